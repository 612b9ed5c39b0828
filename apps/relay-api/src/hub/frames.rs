//! Wire-format frames and envelopes.
//!
//! The message envelope and lifecycle event shapes are a stable contract
//! shared with clients and with other instances over the broker — field
//! names must not change. All binary fields are base64; the cryptographic
//! content is opaque to this service.

use serde::{Deserialize, Serialize};

/// A per-recipient-device sealed symmetric key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "ephPubKey")]
    pub eph_pub_key: String,
    #[serde(rename = "keyNonce")]
    pub key_nonce: String,
    #[serde(rename = "sealedKey")]
    pub sealed_key: String,
}

/// An end-to-end-encrypted group message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Client-assigned id; recipients deduplicate on it.
    pub id: String,
    pub group_id: String,
    #[serde(rename = "messageType")]
    pub message_type: i32,
    #[serde(rename = "msgNonce")]
    pub msg_nonce: String,
    pub ciphertext: String,
    pub envelopes: Vec<KeyEnvelope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    UserInvited,
    UserRemoved,
    GroupUpdated,
    GroupDeleted,
}

/// A group lifecycle change, published on the shared events channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event: LifecycleKind,
    pub group_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A frame received from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on the connection.
    Auth { token: String },
    Message {
        #[serde(flatten)]
        envelope: MessageEnvelope,
    },
    Heartbeat,
}

/// A frame sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledges a successful handshake.
    Ready {
        user_id: String,
        heartbeat_interval: u64,
    },
    Message {
        #[serde(flatten)]
        envelope: MessageEnvelope,
    },
    Lifecycle {
        #[serde(flatten)]
        event: LifecycleEvent,
    },
    HeartbeatAck,
    Error {
        code: &'static str,
        message: String,
    },
}
