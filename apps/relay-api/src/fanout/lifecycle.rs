//! Group lifecycle transitions.
//!
//! Each transition updates the shared membership views first, then announces
//! the change on the fleet-wide events channel. Updates before announce:
//! an instance reacting to the event must already see the new membership.

use serde::Serialize;

use crate::error::Error;
use crate::hub::frames::{LifecycleEvent, LifecycleKind};
use crate::store::{keys, CoordStore};

pub async fn user_invited(
    store: &dyn CoordStore,
    group_id: &str,
    user_id: &str,
) -> Result<(), Error> {
    store.sadd(&keys::group_members(group_id), user_id).await?;
    store.sadd(&keys::user_groups(user_id), group_id).await?;
    announce(
        store,
        LifecycleEvent {
            event: LifecycleKind::UserInvited,
            group_id: group_id.to_string(),
            user_id: Some(user_id.to_string()),
        },
    )
    .await
}

pub async fn user_removed(
    store: &dyn CoordStore,
    group_id: &str,
    user_id: &str,
) -> Result<(), Error> {
    store.srem(&keys::group_members(group_id), user_id).await?;
    store.srem(&keys::user_groups(user_id), group_id).await?;
    announce(
        store,
        LifecycleEvent {
            event: LifecycleKind::UserRemoved,
            group_id: group_id.to_string(),
            user_id: Some(user_id.to_string()),
        },
    )
    .await
}

pub async fn group_updated(
    store: &dyn CoordStore,
    group_id: &str,
    name: &str,
) -> Result<(), Error> {
    store.hset(&keys::group_info(group_id), "name", name).await?;
    announce(
        store,
        LifecycleEvent {
            event: LifecycleKind::GroupUpdated,
            group_id: group_id.to_string(),
            user_id: None,
        },
    )
    .await
}

/// Retract every shared view of a group, then announce the deletion.
pub async fn group_deleted(
    store: &dyn CoordStore,
    group_id: &str,
    member_ids: &[String],
) -> Result<(), Error> {
    for user_id in member_ids {
        store.srem(&keys::user_groups(user_id), group_id).await?;
    }
    store.del(&keys::group_members(group_id)).await?;
    store.del(&keys::group_info(group_id)).await?;
    announce(
        store,
        LifecycleEvent {
            event: LifecycleKind::GroupDeleted,
            group_id: group_id.to_string(),
            user_id: None,
        },
    )
    .await
}

async fn announce(store: &dyn CoordStore, event: LifecycleEvent) -> Result<(), Error> {
    store
        .publish(keys::EVENTS_CHANNEL, &to_payload(&event)?)
        .await
}

fn to_payload<T: Serialize>(event: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(event)?)
}
