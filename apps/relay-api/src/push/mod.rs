//! Push provider contract.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Error;

pub mod expo;

pub use expo::ExpoPushClient;

/// Hard ceiling on recipients per provider call, for both sends and receipt
/// lookups.
pub const PROVIDER_BATCH_LIMIT: usize = 100;

/// One notification addressed to one push token.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// Per-message outcome of a send call.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The provider accepted the notification for asynchronous delivery and
    /// issued a ticket to verify it later.
    Accepted { ticket_id: String },
    /// The token no longer maps to an installed app; delete it.
    DeviceNotRegistered,
    Failed { message: String },
}

/// Verdict from the provider's receipt endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptOutcome {
    Delivered,
    DeviceNotRegistered,
    Failed { message: String },
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Send one batch of at most [`PROVIDER_BATCH_LIMIT`] notifications.
    /// Outcomes are positional with respect to `messages`.
    async fn send(&self, messages: &[PushMessage]) -> Result<Vec<PushOutcome>, Error>;

    /// Look up delivery verdicts for at most [`PROVIDER_BATCH_LIMIT`]
    /// tickets. Tickets without a verdict yet are absent from the result.
    async fn receipts(
        &self,
        ticket_ids: &[String],
    ) -> Result<HashMap<String, ReceiptOutcome>, Error>;
}

/// Validate the provider's token format before use. Malformed tokens are
/// dropped silently rather than burning a slot in a batch.
pub fn is_valid_push_token(token: &str) -> bool {
    let inner = token
        .strip_prefix("ExponentPushToken[")
        .or_else(|| token.strip_prefix("ExpoPushToken["));
    match inner {
        Some(rest) => rest.len() > 1 && rest.ends_with(']'),
        None => false,
    }
}
