//! Expo push API client.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::Error;

use super::{PushMessage, PushOutcome, PushProvider, ReceiptOutcome, PROVIDER_BATCH_LIMIT};

const DEFAULT_BASE_URL: &str = "https://exp.host/--/api/v2";

pub struct ExpoPushClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl ExpoPushClient {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token,
        }
    }

    /// Point the client at a different endpoint (local stub in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut req = self.http.post(url);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    data: Vec<TicketStatus>,
}

#[derive(Debug, Deserialize)]
struct TicketStatus {
    status: String,
    id: Option<String>,
    message: Option<String>,
    details: Option<StatusDetails>,
}

#[derive(Debug, Deserialize)]
struct StatusDetails {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceiptsResponse {
    data: HashMap<String, ReceiptStatus>,
}

#[derive(Debug, Deserialize)]
struct ReceiptStatus {
    status: String,
    message: Option<String>,
    details: Option<StatusDetails>,
}

fn device_not_registered(details: &Option<StatusDetails>) -> bool {
    matches!(
        details,
        Some(StatusDetails { error: Some(e) }) if e == "DeviceNotRegistered"
    )
}

#[async_trait::async_trait]
impl PushProvider for ExpoPushClient {
    async fn send(&self, messages: &[PushMessage]) -> Result<Vec<PushOutcome>, Error> {
        if messages.len() > PROVIDER_BATCH_LIMIT {
            return Err(Error::Provider(format!(
                "send batch of {} exceeds provider limit of {PROVIDER_BATCH_LIMIT}",
                messages.len()
            )));
        }

        let resp = self
            .request(format!("{}/push/send", self.base_url))
            .json(messages)
            .send()
            .await?
            .error_for_status()?;
        let body: SendResponse = resp.json().await?;

        if body.data.len() != messages.len() {
            return Err(Error::Provider(format!(
                "provider returned {} tickets for {} messages",
                body.data.len(),
                messages.len()
            )));
        }

        Ok(body
            .data
            .into_iter()
            .map(|ticket| {
                if ticket.status == "ok" {
                    match ticket.id {
                        Some(ticket_id) => PushOutcome::Accepted { ticket_id },
                        None => PushOutcome::Failed {
                            message: "ok ticket without id".to_string(),
                        },
                    }
                } else if device_not_registered(&ticket.details) {
                    PushOutcome::DeviceNotRegistered
                } else {
                    PushOutcome::Failed {
                        message: ticket.message.unwrap_or_else(|| ticket.status),
                    }
                }
            })
            .collect())
    }

    async fn receipts(
        &self,
        ticket_ids: &[String],
    ) -> Result<HashMap<String, ReceiptOutcome>, Error> {
        if ticket_ids.len() > PROVIDER_BATCH_LIMIT {
            return Err(Error::Provider(format!(
                "receipt batch of {} exceeds provider limit of {PROVIDER_BATCH_LIMIT}",
                ticket_ids.len()
            )));
        }

        let resp = self
            .request(format!("{}/push/getReceipts", self.base_url))
            .json(&serde_json::json!({ "ids": ticket_ids }))
            .send()
            .await?
            .error_for_status()?;
        let body: ReceiptsResponse = resp.json().await?;

        Ok(body
            .data
            .into_iter()
            .map(|(ticket_id, receipt)| {
                let outcome = if receipt.status == "ok" {
                    ReceiptOutcome::Delivered
                } else if device_not_registered(&receipt.details) {
                    ReceiptOutcome::DeviceNotRegistered
                } else {
                    ReceiptOutcome::Failed {
                        message: receipt.message.unwrap_or_else(|| receipt.status),
                    }
                };
                (ticket_id, outcome)
            })
            .collect())
    }
}
