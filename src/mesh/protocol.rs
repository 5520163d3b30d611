//! Mesh wire protocol.
//!
//! Newline-delimited JSON. Each line is an envelope
//! `{ "type": <int>, "data": "<inner json>", "from_agent": ..,
//! "to_agent": .., "timestamp": .., "hops": .. }`; the `data` string
//! decodes into the payload for that type. Unknown types and malformed
//! payloads fail closed: the line is dropped and logged, never decoded
//! into a null.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::users::AccessUser;

/// Lines longer than this close the link.
pub const MAX_LINE: usize = 64 * 1024;

/// Stable mesh error codes.
pub const ERR_UNKNOWN_BOT: &str = "UNKNOWN_BOT";
pub const ERR_AUTH_FAILED: &str = "AUTH_FAILED";
pub const ERR_PROTO_BAD: &str = "PROTO_BAD";
pub const ERR_CLOSING: &str = "CLOSING";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: u16,
    pub data: String,
    #[serde(default)]
    pub from_agent: String,
    /// Empty string broadcasts.
    #[serde(default)]
    pub to_agent: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub hops: u32,
}

// Payloads, one struct per wire type.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub agent_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// 32 random bytes, base64.
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// base64(SHA-256(password ∥ challenge-bytes)).
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub agent_name: String,
    #[serde(default)]
    pub linked_bots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goodbye {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPong {
    pub ping_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub from_nick: String,
    pub channel: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyJoin {
    pub nick: String,
    pub channel: String,
    #[serde(default)]
    pub flags: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyPart {
    pub nick: String,
    pub channel: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Who {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhoReply {
    pub members: Vec<PartyMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyMember {
    pub nick: String,
    pub agent: String,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSync {
    pub users: Vec<AccessUser>,
    #[serde(default)]
    pub is_full_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRequest {
    pub server: String,
    pub channel: String,
    pub nick: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpGrant {
    pub server: String,
    pub channel: String,
    pub nick: String,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickRequest {
    pub server: String,
    pub channel: String,
    pub nick: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanSync {
    pub server: String,
    pub channel: String,
    pub mask: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub agent_name: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub id: String,
    pub state: String,
    pub nick: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channels {
    pub channels: Vec<ChannelInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub server: String,
    pub name: String,
    pub users: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshError {
    pub code: String,
    pub message: String,
}

/// Every message the mesh speaks.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshMessage {
    Hello(Hello),
    Challenge(Challenge),
    Response(ChallengeResponse),
    Welcome(Welcome),
    Goodbye(Goodbye),
    Ping(PingPong),
    Pong(PingPong),
    Chat(Chat),
    Action(Chat),
    PartyJoin(PartyJoin),
    PartyPart(PartyPart),
    Who(Who),
    WhoReply(WhoReply),
    UserSync(UserSync),
    OpRequest(OpRequest),
    OpGrant(OpGrant),
    KickRequest(KickRequest),
    BanSync(BanSync),
    Info(Info),
    Status(Status),
    Channels(Channels),
    Error(MeshError),
}

impl MeshMessage {
    pub fn type_id(&self) -> u16 {
        match self {
            MeshMessage::Hello(_) => 1,
            MeshMessage::Challenge(_) => 2,
            MeshMessage::Response(_) => 3,
            MeshMessage::Welcome(_) => 4,
            MeshMessage::Goodbye(_) => 5,
            MeshMessage::Ping(_) => 10,
            MeshMessage::Pong(_) => 11,
            MeshMessage::Chat(_) => 20,
            MeshMessage::Action(_) => 21,
            MeshMessage::PartyJoin(_) => 22,
            MeshMessage::PartyPart(_) => 23,
            MeshMessage::Who(_) => 24,
            MeshMessage::WhoReply(_) => 25,
            MeshMessage::UserSync(_) => 30,
            MeshMessage::OpRequest(_) => 40,
            MeshMessage::OpGrant(_) => 41,
            MeshMessage::KickRequest(_) => 42,
            MeshMessage::BanSync(_) => 43,
            MeshMessage::Info(_) => 50,
            MeshMessage::Status(_) => 51,
            MeshMessage::Channels(_) => 52,
            MeshMessage::Error(_) => 99,
        }
    }

    fn data_json(&self) -> serde_json::Result<String> {
        match self {
            MeshMessage::Hello(p) => serde_json::to_string(p),
            MeshMessage::Challenge(p) => serde_json::to_string(p),
            MeshMessage::Response(p) => serde_json::to_string(p),
            MeshMessage::Welcome(p) => serde_json::to_string(p),
            MeshMessage::Goodbye(p) => serde_json::to_string(p),
            MeshMessage::Ping(p) | MeshMessage::Pong(p) => serde_json::to_string(p),
            MeshMessage::Chat(p) | MeshMessage::Action(p) => serde_json::to_string(p),
            MeshMessage::PartyJoin(p) => serde_json::to_string(p),
            MeshMessage::PartyPart(p) => serde_json::to_string(p),
            MeshMessage::Who(p) => serde_json::to_string(p),
            MeshMessage::WhoReply(p) => serde_json::to_string(p),
            MeshMessage::UserSync(p) => serde_json::to_string(p),
            MeshMessage::OpRequest(p) => serde_json::to_string(p),
            MeshMessage::OpGrant(p) => serde_json::to_string(p),
            MeshMessage::KickRequest(p) => serde_json::to_string(p),
            MeshMessage::BanSync(p) => serde_json::to_string(p),
            MeshMessage::Info(p) => serde_json::to_string(p),
            MeshMessage::Status(p) => serde_json::to_string(p),
            MeshMessage::Channels(p) => serde_json::to_string(p),
            MeshMessage::Error(p) => serde_json::to_string(p),
        }
    }

    /// Serialize into one wire line (no trailing newline).
    pub fn encode(&self, from_agent: &str, to_agent: &str) -> AgentResult<String> {
        let data = self
            .data_json()
            .map_err(|e| AgentError::Protocol(format!("mesh encode: {}", e)))?;
        let envelope = Envelope {
            msg_type: self.type_id(),
            data,
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            timestamp: Utc::now().timestamp(),
            hops: 0,
        };
        serde_json::to_string(&envelope)
            .map_err(|e| AgentError::Protocol(format!("mesh encode: {}", e)))
    }

    /// Decode one wire line. Unknown types and bad payloads are
    /// `Protocol` errors; callers drop the line (or the link).
    pub fn decode(line: &str) -> AgentResult<(Envelope, MeshMessage)> {
        if line.len() > MAX_LINE {
            return Err(AgentError::Protocol("mesh line exceeds 64 KiB".into()));
        }
        let envelope: Envelope = serde_json::from_str(line)
            .map_err(|e| AgentError::Protocol(format!("mesh envelope: {}", e)))?;

        fn payload<T: for<'de> Deserialize<'de>>(data: &str) -> AgentResult<T> {
            serde_json::from_str(data)
                .map_err(|e| AgentError::Protocol(format!("mesh payload: {}", e)))
        }

        let msg = match envelope.msg_type {
            1 => MeshMessage::Hello(payload(&envelope.data)?),
            2 => MeshMessage::Challenge(payload(&envelope.data)?),
            3 => MeshMessage::Response(payload(&envelope.data)?),
            4 => MeshMessage::Welcome(payload(&envelope.data)?),
            5 => MeshMessage::Goodbye(payload(&envelope.data)?),
            10 => MeshMessage::Ping(payload(&envelope.data)?),
            11 => MeshMessage::Pong(payload(&envelope.data)?),
            20 => MeshMessage::Chat(payload(&envelope.data)?),
            21 => MeshMessage::Action(payload(&envelope.data)?),
            22 => MeshMessage::PartyJoin(payload(&envelope.data)?),
            23 => MeshMessage::PartyPart(payload(&envelope.data)?),
            24 => MeshMessage::Who(payload(&envelope.data)?),
            25 => MeshMessage::WhoReply(payload(&envelope.data)?),
            30 => MeshMessage::UserSync(payload(&envelope.data)?),
            40 => MeshMessage::OpRequest(payload(&envelope.data)?),
            41 => MeshMessage::OpGrant(payload(&envelope.data)?),
            42 => MeshMessage::KickRequest(payload(&envelope.data)?),
            43 => MeshMessage::BanSync(payload(&envelope.data)?),
            50 => MeshMessage::Info(payload(&envelope.data)?),
            51 => MeshMessage::Status(payload(&envelope.data)?),
            52 => MeshMessage::Channels(payload(&envelope.data)?),
            99 => MeshMessage::Error(payload(&envelope.data)?),
            other => {
                return Err(AgentError::Protocol(format!(
                    "unknown mesh message type {}",
                    other
                )))
            }
        };
        Ok((envelope, msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let original = MeshMessage::Chat(Chat {
            from_nick: "alice".to_string(),
            channel: "*party*".to_string(),
            text: "hello mesh".to_string(),
        });
        let line = original.encode("munin", "").unwrap();
        let (envelope, decoded) = MeshMessage::decode(&line).unwrap();
        assert_eq!(envelope.msg_type, 20);
        assert_eq!(envelope.from_agent, "munin");
        assert_eq!(envelope.to_agent, "");
        assert_eq!(decoded, original);
    }

    #[test]
    fn envelope_shape_on_wire() {
        let line = MeshMessage::Ping(PingPong {
            ping_id: "p1".to_string(),
        })
        .encode("munin", "hugin")
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], 10);
        assert_eq!(value["to_agent"], "hugin");
        // data is a nested JSON *string*.
        assert!(value["data"].is_string());
        let inner: serde_json::Value =
            serde_json::from_str(value["data"].as_str().unwrap()).unwrap();
        assert_eq!(inner["ping_id"], "p1");
    }

    #[test]
    fn unknown_type_fails_closed() {
        let line = r#"{"type":77,"data":"{}","from_agent":"x","to_agent":"","timestamp":0,"hops":0}"#;
        let err = MeshMessage::decode(line).unwrap_err();
        assert_eq!(err.error_code(), "protocol");
    }

    #[test]
    fn malformed_payload_fails_closed() {
        let line = r#"{"type":1,"data":"not json","from_agent":"x","to_agent":"","timestamp":0,"hops":0}"#;
        assert!(MeshMessage::decode(line).is_err());
    }

    #[test]
    fn oversized_line_rejected() {
        let line = "x".repeat(MAX_LINE + 1);
        assert!(MeshMessage::decode(&line).is_err());
    }

    #[test]
    fn hello_public_key_is_optional_and_ignored() {
        let hello = MeshMessage::Hello(Hello {
            agent_name: "hugin".to_string(),
            version: "0.9.0".to_string(),
            public_key: None,
        });
        let line = hello.encode("hugin", "munin").unwrap();
        assert!(!line.contains("public_key"));

        let with_key = r#"{"type":1,"data":"{\"agent_name\":\"h\",\"version\":\"1\",\"public_key\":\"AAAA\"}","from_agent":"h","to_agent":"","timestamp":0,"hops":0}"#;
        let (_, msg) = MeshMessage::decode(with_key).unwrap();
        match msg {
            MeshMessage::Hello(h) => assert_eq!(h.public_key.as_deref(), Some("AAAA")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
