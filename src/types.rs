//! Wire and domain types shared across the connection, playback, and pusher
//! subsystems.

use std::time::Duration;

use serde::{
    de::{
        self,
        Deserializer,
    },
    ser::{
        SerializeTuple,
        Serializer,
    },
    Deserialize,
    Serialize,
};
use serde_json::Value as Json;

/// A monotonically non-decreasing scalar identifying replica state. `None`
/// only at genesis, before the store has applied its first poke.
pub type Version = Option<i64>;

/// An opaque JSON delta from the server. Content is never interpreted here.
pub type PatchEntry = Json;

/// A locally created mutation, handed to the pusher by the store and never
/// mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Monotonic integer per client.
    pub id: u64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub name: String,
    /// Opaque JSON arguments.
    pub args: Json,
    /// Milliseconds, monotonic.
    pub timestamp: i64,
}

/// A server-originated patch carrying a base -> next cookie transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PokeBody {
    #[serde(rename = "baseCookie")]
    pub base_cookie: Version,
    pub cookie: Version,
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
    pub patch: Vec<PatchEntry>,
    /// Milliseconds, from the source's clock.
    pub timestamp: i64,
    /// Present when multiple sources multiplex pokes onto one connection;
    /// `timestamp` is then measured against that source's clock.
    #[serde(rename = "clientID", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A combined poke produced by the playback pipeline's drain step, handed to
/// the store as a single atomic transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedPoke {
    pub base_cookie: Version,
    pub cookie: Version,
    pub last_mutation_id: u64,
    pub patch: Vec<PatchEntry>,
}

/// Downstream envelope, `[tag, payload]` on the wire (§6.2). Hand-written
/// rather than `#[serde(tag, content)]` because that attribute produces an
/// `{"tag": ..., "payload": ...}` object, not the two-element array the wire
/// protocol actually sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Downstream {
    Connected,
    Error(String),
    Pong,
    Poke(PokeList),
}

impl Serialize for Downstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        match self {
            Downstream::Connected => {
                tup.serialize_element("connected")?;
                tup.serialize_element(&Json::Object(Default::default()))?;
            },
            Downstream::Error(message) => {
                tup.serialize_element("error")?;
                tup.serialize_element(message)?;
            },
            Downstream::Pong => {
                tup.serialize_element("pong")?;
                tup.serialize_element(&Json::Object(Default::default()))?;
            },
            Downstream::Poke(list) => {
                tup.serialize_element("poke")?;
                tup.serialize_element(list)?;
            },
        }
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Downstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, payload): (String, Json) = Deserialize::deserialize(deserializer)?;
        match tag.as_str() {
            "connected" => Ok(Downstream::Connected),
            "error" => {
                let message = payload
                    .as_str()
                    .ok_or_else(|| de::Error::custom("\"error\" payload must be a string"))?
                    .to_string();
                Ok(Downstream::Error(message))
            },
            "pong" => Ok(Downstream::Pong),
            "poke" => {
                let list: PokeList = serde_json::from_value(payload).map_err(de::Error::custom)?;
                Ok(Downstream::Poke(list))
            },
            other => Err(de::Error::custom(format!("unexpected downstream tag {other:?}"))),
        }
    }
}

/// `poke` payload may be a single body or an array; normalized on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PokeList {
    One(PokeBody),
    Many(Vec<PokeBody>),
}

impl PokeList {
    pub fn into_vec(self) -> Vec<PokeBody> {
        match self {
            PokeList::One(p) => vec![p],
            PokeList::Many(ps) => ps,
        }
    }
}

/// Upstream envelope, `[tag, payload]` on the wire (§6.3). See [`Downstream`]
/// for why this isn't a plain `#[derive(Serialize, Deserialize)]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    Ping,
    Push(PushBody),
}

impl Serialize for Upstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        match self {
            Upstream::Ping => {
                tup.serialize_element("ping")?;
                tup.serialize_element(&Json::Object(Default::default()))?;
            },
            Upstream::Push(body) => {
                tup.serialize_element("push")?;
                tup.serialize_element(body)?;
            },
        }
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Upstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, payload): (String, Json) = Deserialize::deserialize(deserializer)?;
        match tag.as_str() {
            "ping" => Ok(Upstream::Ping),
            "push" => {
                let body: PushBody = serde_json::from_value(payload).map_err(de::Error::custom)?;
                Ok(Upstream::Push(body))
            },
            other => Err(de::Error::custom(format!("unexpected upstream tag {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushBody {
    pub mutations: Vec<Mutation>,
    #[serde(rename = "clientGroupID", skip_serializing_if = "Option::is_none")]
    pub client_group_id: Option<String>,
    #[serde(rename = "profileID", skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    pub timestamp: i64,
}

/// Connection lifecycle state. Initial: `Disconnected`. `close()` leaves the
/// owning connection in a terminal `Disconnected` state forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(5000);
pub const PING_DEADLINE: Duration = Duration::from_millis(2000);
pub const DEFAULT_JITTER_BUFFER: Duration = Duration::from_millis(250);
