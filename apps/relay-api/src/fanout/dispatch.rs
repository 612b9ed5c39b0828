//! Accepting a message from a connected sender.
//!
//! Order is fixed: membership gate, durable insert, broadcast, offline
//! notification. The insert is the commit point — once it succeeds the send
//! is accepted even if the broadcast or notification steps fail, because
//! recipients recover the message from history.

use diesel_async::RunQueryDsl;

use crate::db::schema::messages;
use crate::error::Error;
use crate::hub::frames::MessageEnvelope;
use crate::models::NewMessage;
use crate::store::keys;
use crate::AppState;

use super::notify;

pub async fn dispatch_message(
    state: &AppState,
    sender_id: &str,
    envelope: MessageEnvelope,
) -> Result<(), Error> {
    let group_id = envelope.group_id.clone();

    // Membership gate against the shared view, not the database: it is the
    // same view fan-out uses, so a sender the fleet considers removed is
    // rejected even if a lifecycle write is still in flight.
    let members = state.store.smembers(&keys::group_members(&group_id)).await?;
    if !members.iter().any(|m| m == sender_id) {
        return Err(Error::NotAMember);
    }

    let mut conn = state.db.get().await?;
    // The id is client-assigned; a redelivered frame inserts nothing and the
    // broadcast below is a harmless duplicate (clients dedup on id).
    diesel::insert_into(messages::table)
        .values(NewMessage {
            id: &envelope.id,
            group_id: &group_id,
            sender_id,
            message_type: envelope.message_type,
            msg_nonce: &envelope.msg_nonce,
            ciphertext: &envelope.ciphertext,
            envelopes: serde_json::to_value(&envelope.envelopes)?,
            created_at: chrono::Utc::now(),
        })
        .on_conflict(messages::id)
        .do_nothing()
        .execute(&mut conn)
        .await?;
    drop(conn);

    let payload = serde_json::to_string(&envelope)?;
    if let Err(err) = state
        .store
        .publish(&keys::group_message_channel(&group_id), &payload)
        .await
    {
        // The message is durable; online recipients catch up from history.
        tracing::error!(%group_id, error = %err, "broadcast failed after persist");
    }

    let state = state.clone();
    let sender_id = sender_id.to_string();
    tokio::spawn(async move {
        if let Err(err) = notify::notify_offline(&state, &sender_id, &group_id, &members).await {
            tracing::error!(%group_id, error = %err, "offline notification failed");
        }
    });

    Ok(())
}
