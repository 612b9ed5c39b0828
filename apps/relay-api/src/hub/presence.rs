//! Cross-instance presence records.
//!
//! Each connected user gets a `presence:{user_id}` key naming the owning
//! instance, refreshed on a cadence and expiring on its own if the instance
//! dies. Retraction is compare-and-delete on the instance id so a user who
//! reconnected elsewhere is never marked offline by the old instance.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::store::{keys, CoordStore};

use super::registry::HubHandle;

/// Record that `user_id` is connected to this instance.
pub async fn mark_online(
    store: &dyn CoordStore,
    instance_id: &str,
    user_id: &str,
) -> Result<(), crate::error::Error> {
    store
        .set_ex(&keys::presence(user_id), instance_id, keys::PRESENCE_TTL_SECS)
        .await?;
    store
        .sadd(&keys::instance_clients(instance_id), user_id)
        .await?;
    Ok(())
}

/// Retract `user_id`'s presence, but only if this instance still owns it.
pub async fn mark_offline(
    store: &dyn CoordStore,
    instance_id: &str,
    user_id: &str,
) -> Result<(), crate::error::Error> {
    let retracted = store
        .del_if_eq(&keys::presence(user_id), instance_id)
        .await?;
    if !retracted {
        tracing::debug!(%user_id, "presence owned elsewhere; left intact");
    }
    store
        .srem(&keys::instance_clients(instance_id), user_id)
        .await?;
    Ok(())
}

/// Refresh presence for every locally-connected user, forever. Keeps records
/// alive while connections last; lets them expire within
/// [`keys::PRESENCE_TTL_SECS`] if this instance dies without cleanup.
pub async fn heartbeat_loop(
    store: Arc<dyn CoordStore>,
    hub: HubHandle,
    instance_id: String,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(
        keys::PRESENCE_REFRESH_SECS,
    ));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it, connections just registered.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let users = match hub.local_users().await {
            Ok(users) => users,
            Err(err) => {
                tracing::warn!(error = %err, "presence refresh skipped");
                continue;
            }
        };

        for user_id in users {
            if let Err(err) = store
                .set_ex(
                    &keys::presence(&user_id),
                    &instance_id,
                    keys::PRESENCE_TTL_SECS,
                )
                .await
            {
                tracing::warn!(%user_id, error = %err, "presence refresh failed");
            }
        }
    }
}

/// Startup sweep: retract any presence records left behind by a previous
/// process with the same instance id that died without cleanup. Returns the
/// number of records retracted.
pub async fn reconcile_instance(
    store: &dyn CoordStore,
    instance_id: &str,
) -> Result<usize, crate::error::Error> {
    let clients_key = keys::instance_clients(instance_id);
    let stale = store.smembers(&clients_key).await?;
    let mut retracted = 0;
    for user_id in &stale {
        if store.del_if_eq(&keys::presence(user_id), instance_id).await? {
            retracted += 1;
        }
        store.srem(&clients_key, user_id).await?;
    }
    if retracted > 0 {
        tracing::info!(retracted, "reconciled stale presence from previous run");
    }
    Ok(retracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn online_then_offline_round_trip() {
        let store = MemoryStore::new();
        mark_online(&store, "ins_a", "usr_1").await.unwrap();

        assert_eq!(
            store.get("presence:usr_1").await.unwrap().as_deref(),
            Some("ins_a")
        );
        assert_eq!(
            store.smembers("instance:ins_a:clients").await.unwrap(),
            vec!["usr_1"]
        );

        mark_offline(&store, "ins_a", "usr_1").await.unwrap();
        assert!(store.get("presence:usr_1").await.unwrap().is_none());
        assert!(store
            .smembers("instance:ins_a:clients")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn offline_does_not_clobber_newer_owner() {
        let store = MemoryStore::new();
        mark_online(&store, "ins_a", "usr_1").await.unwrap();
        // User reconnects through another instance before the old socket's
        // cleanup runs.
        mark_online(&store, "ins_b", "usr_1").await.unwrap();

        mark_offline(&store, "ins_a", "usr_1").await.unwrap();

        assert_eq!(
            store.get("presence:usr_1").await.unwrap().as_deref(),
            Some("ins_b")
        );
        assert_eq!(
            store.smembers("instance:ins_b:clients").await.unwrap(),
            vec!["usr_1"]
        );
    }

    #[tokio::test]
    async fn reconcile_sweeps_only_owned_records() {
        let store = MemoryStore::new();
        mark_online(&store, "ins_a", "usr_1").await.unwrap();
        mark_online(&store, "ins_a", "usr_2").await.unwrap();
        // usr_2 has since moved to another instance.
        store.set_ex("presence:usr_2", "ins_b", 120).await.unwrap();

        let retracted = reconcile_instance(&store, "ins_a").await.unwrap();
        assert_eq!(retracted, 1);

        assert!(store.get("presence:usr_1").await.unwrap().is_none());
        assert_eq!(
            store.get("presence:usr_2").await.unwrap().as_deref(),
            Some("ins_b")
        );
        assert!(store
            .smembers("instance:ins_a:clients")
            .await
            .unwrap()
            .is_empty());
    }
}
