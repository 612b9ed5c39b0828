//! Push notification for group members with no live connection anywhere.
//!
//! Runs after the commit point, off the connection's critical path. Every
//! failure here is logged and absorbed; a missed notification is recoverable,
//! a failed send is not allowed to fail the message.

use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::db::schema::{group_members, push_receipts, push_tokens};
use crate::error::Error;
use crate::models::NewPushReceipt;
use crate::push::{is_valid_push_token, PushMessage, PushOutcome, PushProvider, PROVIDER_BATCH_LIMIT};
use crate::store::keys;
use crate::AppState;

pub async fn notify_offline(
    state: &AppState,
    sender_id: &str,
    group_id: &str,
    members: &[String],
) -> Result<(), Error> {
    // Absent means no presence record anywhere in the fleet, not just not
    // connected here. The sender is never notified about their own message.
    let mut absent = Vec::new();
    for user_id in members {
        if user_id == sender_id {
            continue;
        }
        if state.store.get(&keys::presence(user_id)).await?.is_none() {
            absent.push(user_id.clone());
        }
    }
    if absent.is_empty() {
        return Ok(());
    }

    let mut conn = state.db.get().await?;
    let unmuted: Vec<String> = group_members::table
        .filter(group_members::group_id.eq(group_id))
        .filter(group_members::muted.eq(false))
        .filter(group_members::user_id.eq_any(&absent))
        .select(group_members::user_id)
        .load(&mut conn)
        .await?;
    if unmuted.is_empty() {
        return Ok(());
    }

    let tokens: Vec<String> = push_tokens::table
        .filter(push_tokens::enabled.eq(true))
        .filter(push_tokens::user_id.eq_any(&unmuted))
        .select(push_tokens::token)
        .load(&mut conn)
        .await?;

    let title = state
        .store
        .hget(&keys::group_info(group_id), "name")
        .await?
        .unwrap_or_else(|| "New message".to_string());

    let messages: Vec<PushMessage> = tokens
        .into_iter()
        .filter(|token| is_valid_push_token(token))
        .map(|token| PushMessage {
            to: token,
            title: title.clone(),
            body: "You have a new message".to_string(),
            data: serde_json::json!({ "groupId": group_id }),
        })
        .collect();
    if messages.is_empty() {
        return Ok(());
    }

    let outcomes = push_batches(&*state.push, &messages).await;
    apply_push_outcomes(&mut conn, outcomes).await;

    Ok(())
}

/// Record accepted tickets and prune dead tokens. Each outcome is settled
/// independently; a failed write is logged and the rest still apply.
pub async fn apply_push_outcomes(
    conn: &mut AsyncPgConnection,
    outcomes: Vec<(PushMessage, PushOutcome)>,
) {
    for (message, outcome) in outcomes {
        match outcome {
            PushOutcome::Accepted { ticket_id } => {
                let recorded = diesel::insert_into(push_receipts::table)
                    .values(NewPushReceipt {
                        ticket_id: &ticket_id,
                        push_token: &message.to,
                        created_at: chrono::Utc::now(),
                    })
                    .on_conflict(push_receipts::ticket_id)
                    .do_nothing()
                    .execute(conn)
                    .await;
                if let Err(err) = recorded {
                    tracing::warn!(error = %err, "receipt ticket not recorded");
                }
            }
            PushOutcome::DeviceNotRegistered => {
                let deleted =
                    diesel::delete(push_tokens::table.filter(push_tokens::token.eq(&message.to)))
                        .execute(conn)
                        .await;
                match deleted {
                    Ok(_) => tracing::info!("pruned dead push token"),
                    Err(err) => tracing::warn!(error = %err, "dead push token not pruned"),
                }
            }
            PushOutcome::Failed { message: reason } => {
                tracing::warn!(%reason, "push send rejected");
            }
        }
    }
}

/// Send `messages` in provider-sized batches. A failed batch is logged and
/// skipped; later batches still go out. Returns per-message outcomes for
/// every batch the provider answered.
pub async fn push_batches(
    provider: &dyn PushProvider,
    messages: &[PushMessage],
) -> Vec<(PushMessage, PushOutcome)> {
    let mut results = Vec::new();
    for chunk in messages.chunks(PROVIDER_BATCH_LIMIT) {
        match provider.send(chunk).await {
            Ok(outcomes) => {
                results.extend(chunk.iter().cloned().zip(outcomes));
            }
            Err(err) => {
                tracing::warn!(batch = chunk.len(), error = %err, "push batch failed");
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::ReceiptOutcome;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Provider that records batch sizes and fails whole batches on demand.
    struct FakeProvider {
        batches: Mutex<Vec<usize>>,
        fail_first: bool,
    }

    #[async_trait::async_trait]
    impl PushProvider for FakeProvider {
        async fn send(&self, messages: &[PushMessage]) -> Result<Vec<PushOutcome>, Error> {
            let mut batches = self.batches.lock().unwrap();
            batches.push(messages.len());
            if self.fail_first && batches.len() == 1 {
                return Err(Error::Provider("gateway timeout".to_string()));
            }
            Ok(messages
                .iter()
                .enumerate()
                .map(|(i, _)| PushOutcome::Accepted {
                    ticket_id: format!("ticket-{}-{i}", batches.len()),
                })
                .collect())
        }

        async fn receipts(
            &self,
            _ticket_ids: &[String],
        ) -> Result<HashMap<String, ReceiptOutcome>, Error> {
            Ok(HashMap::new())
        }
    }

    fn messages(n: usize) -> Vec<PushMessage> {
        (0..n)
            .map(|i| PushMessage {
                to: format!("ExponentPushToken[t{i}]"),
                title: "t".to_string(),
                body: "b".to_string(),
                data: serde_json::json!({}),
            })
            .collect()
    }

    #[tokio::test]
    async fn batches_never_exceed_the_provider_limit() {
        let provider = FakeProvider {
            batches: Mutex::new(Vec::new()),
            fail_first: false,
        };
        let outcomes = push_batches(&provider, &messages(150)).await;

        assert_eq!(outcomes.len(), 150);
        assert_eq!(*provider.batches.lock().unwrap(), vec![100, 50]);
    }

    #[tokio::test]
    async fn failed_batch_does_not_sink_the_rest() {
        let provider = FakeProvider {
            batches: Mutex::new(Vec::new()),
            fail_first: true,
        };
        let outcomes = push_batches(&provider, &messages(150)).await;

        // First batch of 100 lost, second batch of 50 answered.
        assert_eq!(outcomes.len(), 50);
        assert_eq!(*provider.batches.lock().unwrap(), vec![100, 50]);
        assert_eq!(outcomes[0].0.to, "ExponentPushToken[t100]");
    }

    #[tokio::test]
    async fn empty_input_sends_nothing() {
        let provider = FakeProvider {
            batches: Mutex::new(Vec::new()),
            fail_first: false,
        };
        let outcomes = push_batches(&provider, &[]).await;
        assert!(outcomes.is_empty());
        assert!(provider.batches.lock().unwrap().is_empty());
    }
}
