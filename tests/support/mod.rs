//! A mock WebSocket server for exercising the connection state machine end
//! to end over a real loopback socket, in the style of the teacher's
//! `rt-test-utils::mock_ws_server::MockWsServer`: bind to port 0, accept
//! connections in a background task, and hand each accepted connection to
//! the test so it can script the exact server-side behavior a scenario
//! needs instead of auto-responding.

use std::net::SocketAddr;

use futures::{
    stream::{
        SplitSink,
        SplitStream,
    },
    SinkExt,
    StreamExt,
};
use tokio::{
    net::{
        TcpListener,
        TcpStream,
    },
    sync::mpsc,
};
use tokio_tungstenite::{
    tungstenite::Message,
    WebSocketStream,
};

pub struct MockServer {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<MockConnection>,
    _accept_task: tokio::task::JoinHandle<()>,
}

pub struct MockConnection {
    /// The request path and query string the client connected with, e.g.
    /// `/connect?clientID=...&lmid=42`.
    pub uri: String,
    pub sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    pub stream: SplitStream<WebSocketStream<TcpStream>>,
}

impl MockConnection {
    pub async fn send_json(&mut self, value: &serde_json::Value) {
        self.sink.send(Message::Text(value.to_string().into())).await.expect("mock server send failed");
    }

    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).expect("client sent invalid JSON")),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = Self::handle(stream, tx).await;
                });
            }
        });

        Self {
            addr,
            connections: rx,
            _accept_task: task,
        }
    }

    pub fn origin(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Generous timeout relative to the 5s watchdog cadence: under a paused
    /// test clock this never costs real wall time, and staying well clear of
    /// the watchdog's own deadline avoids a race between "no connection
    /// arrived" and "the virtual clock just happens to reach both deadlines
    /// at once".
    pub async fn next_connection(&mut self) -> MockConnection {
        tokio::time::timeout(std::time::Duration::from_secs(20), self.connections.recv())
            .await
            .expect("timed out waiting for a client connection")
            .expect("accept loop ended")
    }

    async fn handle(
        stream: TcpStream,
        out: mpsc::UnboundedSender<MockConnection>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut uri = String::new();
        let callback = |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                        response: tokio_tungstenite::tungstenite::handshake::server::Response| {
            uri = request.uri().to_string();
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (sink, stream) = ws.split();
        let _ = out.send(MockConnection { uri, sink, stream });
        Ok(())
    }
}
