//! Builds the authenticated duplex connection URL and opens the socket.
//!
//! Mirrors the teacher's `deployment_to_ws_url` scheme normalization
//! (`client/mod.rs`), generalized to this protocol's query-string shape and
//! sub-protocol-carried auth token.

use tokio_tungstenite::{
    tungstenite::client::IntoClientRequest,
    MaybeTlsStream,
    WebSocketStream,
};
use url::Url;

use crate::{
    error::ConfigError,
    types::Version,
};

pub type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Builds the `/connect` URL carrying `clientID`, `roomID`, `baseCookie`,
/// `ts`, and `lmid` query parameters. Fails with [`ConfigError::BadOrigin`]
/// if `origin` is not `ws://` or `wss://`.
pub fn build_url(
    origin: &str,
    client_id: &str,
    room_id: &str,
    base_cookie: Version,
    now_ms: i64,
    last_mutation_id_received: i64,
) -> Result<Url, ConfigError> {
    if !(origin.starts_with("ws://") || origin.starts_with("wss://")) {
        return Err(ConfigError::BadOrigin(origin.to_string()));
    }
    let mut url = Url::parse(origin).map_err(|_| ConfigError::BadOrigin(origin.to_string()))?;
    url.set_path("connect");
    let base_cookie_str = base_cookie.map(|c| c.to_string()).unwrap_or_default();
    url.query_pairs_mut()
        .append_pair("clientID", client_id)
        .append_pair("roomID", room_id)
        .append_pair("baseCookie", &base_cookie_str)
        .append_pair("ts", &now_ms.to_string())
        .append_pair("lmid", &last_mutation_id_received.to_string());
    Ok(url)
}

/// Opens a connection whose sub-protocol carries the URL-encoded auth token
/// (empty token means no sub-protocol offered).
pub async fn connect(url: Url, auth_token: &str) -> anyhow::Result<Socket> {
    let mut request = url.as_str().into_client_request()?;
    if !auth_token.is_empty() {
        let encoded =
            url::form_urlencoded::byte_serialize(auth_token.as_bytes()).collect::<String>();
        request
            .headers_mut()
            .insert(http::header::SEC_WEBSOCKET_PROTOCOL, http::HeaderValue::from_str(&encoded)?);
    }
    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_url_with_expected_query_params() {
        let url = build_url("wss://example.test", "client-1", "room-1", Some(7), 1000, 42)
            .expect("valid origin");
        assert_eq!(url.path(), "/connect");
        let pairs: Vec<_> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("clientID".to_string(), "client-1".to_string())));
        assert!(pairs.contains(&("roomID".to_string(), "room-1".to_string())));
        assert!(pairs.contains(&("baseCookie".to_string(), "7".to_string())));
        assert!(pairs.contains(&("ts".to_string(), "1000".to_string())));
        assert!(pairs.contains(&("lmid".to_string(), "42".to_string())));
    }

    #[test]
    fn null_base_cookie_is_empty_string() {
        let url = build_url("ws://example.test", "c", "r", None, 0, 0).unwrap();
        let pairs: Vec<_> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("baseCookie".to_string(), String::new())));
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let err = build_url("https://example.test", "c", "r", None, 0, 0).unwrap_err();
        assert_eq!(err, ConfigError::BadOrigin("https://example.test".to_string()));
    }
}
