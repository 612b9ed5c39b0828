use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::messages;

/// Insert row for a persisted message. The cryptographic payload is stored
/// verbatim; this service never interprets it.
#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage<'a> {
    /// Client-assigned message id — the deduplication key for at-least-once
    /// delivery.
    pub id: &'a str,
    pub group_id: &'a str,
    pub sender_id: &'a str,
    pub message_type: i32,
    pub msg_nonce: &'a str,
    pub ciphertext: &'a str,
    pub envelopes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
