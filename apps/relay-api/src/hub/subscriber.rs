//! The shared broker subscriber task.
//!
//! One subscription per process carries the fleet-wide events channel plus
//! every group message channel with at least one local member. The hub
//! drives the channel set; this task only parses payloads and forwards them
//! as hub commands.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::{keys, CoordStore};

use super::frames::{LifecycleEvent, MessageEnvelope};
use super::registry::{HubHandle, SubscriberCommand};

pub async fn run(
    store: Arc<dyn CoordStore>,
    hub: HubHandle,
    mut ctl: mpsc::UnboundedReceiver<SubscriberCommand>,
    cancel: CancellationToken,
) -> Result<(), crate::error::Error> {
    let mut sub = store.subscribe().await?;
    sub.subscribe(keys::EVENTS_CHANNEL).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            cmd = ctl.recv() => {
                match cmd {
                    Some(SubscriberCommand::Subscribe(channel)) => {
                        if let Err(err) = sub.subscribe(&channel).await {
                            tracing::error!(%channel, error = %err, "channel subscribe failed");
                        }
                    }
                    Some(SubscriberCommand::Unsubscribe(channel)) => {
                        if let Err(err) = sub.unsubscribe(&channel).await {
                            tracing::warn!(%channel, error = %err, "channel unsubscribe failed");
                        }
                    }
                    None => break,
                }
            }

            msg = sub.next_message() => {
                let Some((channel, payload)) = msg else {
                    tracing::warn!("broker subscription closed");
                    break;
                };
                dispatch(&hub, &channel, &payload).await;
            }
        }
    }
    Ok(())
}

async fn dispatch(hub: &HubHandle, channel: &str, payload: &str) {
    if channel == keys::EVENTS_CHANNEL {
        match serde_json::from_str::<LifecycleEvent>(payload) {
            Ok(event) => hub.lifecycle(event).await,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable lifecycle event dropped");
            }
        }
        return;
    }

    if let Some(group_id) = keys::parse_group_message_channel(channel) {
        match serde_json::from_str::<MessageEnvelope>(payload) {
            Ok(envelope) => hub.deliver(group_id.to_string(), envelope).await,
            Err(err) => {
                tracing::warn!(%channel, error = %err, "undecodable message payload dropped");
            }
        }
        return;
    }

    tracing::debug!(%channel, "payload on unrecognized channel ignored");
}
