//! Provider receipt reconciliation.
//!
//! Send tickets only say the provider accepted a notification; the receipt
//! endpoint says whether the platform delivered it. Receipts are checked
//! after the provider has had time to resolve them and are abandoned after a
//! day — the provider stops answering for old tickets anyway.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tokio_util::sync::CancellationToken;

use crate::db::schema::{push_receipts, push_tokens};
use crate::error::Error;
use crate::models::PushReceipt;
use crate::push::{ReceiptOutcome, PROVIDER_BATCH_LIMIT};

use super::{Job, JobContext};

/// Leave tickets this long before asking; the provider resolves them
/// asynchronously.
const MIN_AGE_MINUTES: i64 = 30;

/// Tickets older than this are purged unqueried.
const MAX_AGE_HOURS: i64 = 24;

pub struct PushReceipts;

#[async_trait]
impl Job for PushReceipts {
    fn name(&self) -> &'static str {
        "push-receipts"
    }

    fn schedule(&self) -> &'static str {
        // Every thirty minutes.
        "0 */30 * * * *"
    }

    fn lock_ttl(&self) -> u64 {
        600
    }

    async fn execute(&self, ctx: &JobContext, cancel: &CancellationToken) -> Result<(), Error> {
        let now = Utc::now();
        let ready_before = now - Duration::minutes(MIN_AGE_MINUTES);
        let abandoned_before = now - Duration::hours(MAX_AGE_HOURS);
        let mut conn = ctx.db.get().await?;

        let ready: Vec<PushReceipt> = push_receipts::table
            .filter(push_receipts::created_at.lt(ready_before))
            .filter(push_receipts::created_at.ge(abandoned_before))
            .select(PushReceipt::as_select())
            .load(&mut conn)
            .await?;

        let token_by_ticket: HashMap<&str, &str> = ready
            .iter()
            .map(|r| (r.ticket_id.as_str(), r.push_token.as_str()))
            .collect();

        for chunk in ready.chunks(PROVIDER_BATCH_LIMIT) {
            if cancel.is_cancelled() {
                break;
            }
            let ticket_ids: Vec<String> = chunk.iter().map(|r| r.ticket_id.clone()).collect();
            let verdicts = match ctx.push.receipts(&ticket_ids).await {
                Ok(verdicts) => verdicts,
                Err(err) => {
                    // Batch stays queued for the next tick.
                    tracing::warn!(batch = ticket_ids.len(), error = %err, "receipt lookup failed");
                    continue;
                }
            };

            for (ticket_id, verdict) in &verdicts {
                match verdict {
                    ReceiptOutcome::Delivered => {}
                    ReceiptOutcome::DeviceNotRegistered => {
                        if let Some(token) = token_by_ticket.get(ticket_id.as_str()) {
                            diesel::delete(
                                push_tokens::table.filter(push_tokens::token.eq(*token)),
                            )
                            .execute(&mut conn)
                            .await?;
                            tracing::info!("pruned dead push token from receipt");
                        }
                    }
                    ReceiptOutcome::Failed { message } => {
                        tracing::warn!(%ticket_id, %message, "push delivery failed");
                    }
                }
            }

            // The whole queried batch is settled, verdict or not; tickets
            // the provider no longer answers for would otherwise pin the
            // table until the purge window.
            diesel::delete(push_receipts::table.filter(push_receipts::ticket_id.eq_any(&ticket_ids)))
                .execute(&mut conn)
                .await?;
        }

        let purged = diesel::delete(
            push_receipts::table.filter(push_receipts::created_at.lt(abandoned_before)),
        )
        .execute(&mut conn)
        .await?;
        if purged > 0 {
            tracing::info!(purged, "abandoned receipts purged");
        }

        Ok(())
    }
}
