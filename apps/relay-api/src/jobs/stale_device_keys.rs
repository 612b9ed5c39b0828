//! Pruning of device keys that have gone quiet.
//!
//! A device key unseen for the retention window is dropped, unless its owner
//! still belongs to a live group — encrypting to a stale-but-member device
//! is recoverable, dropping a key someone still encrypts to is not.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use diesel::dsl::{exists, not};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tokio_util::sync::CancellationToken;

use crate::db::schema::{device_keys, group_members, groups};
use crate::error::Error;

use super::{Job, JobContext};

const RETAIN_DAYS: i64 = 90;

pub struct StaleDeviceKeys;

#[async_trait]
impl Job for StaleDeviceKeys {
    fn name(&self) -> &'static str {
        "stale-device-keys"
    }

    fn schedule(&self) -> &'static str {
        // Daily at 04:00 UTC.
        "0 0 4 * * *"
    }

    fn lock_ttl(&self) -> u64 {
        600
    }

    async fn execute(&self, ctx: &JobContext, _cancel: &CancellationToken) -> Result<(), Error> {
        let cutoff = Utc::now() - Duration::days(RETAIN_DAYS);
        let mut conn = ctx.db.get().await?;

        let owner_in_live_group = group_members::table
            .inner_join(groups::table)
            .filter(group_members::user_id.eq(device_keys::user_id))
            .filter(groups::expires_at.gt(Utc::now()));

        let pruned = diesel::delete(
            device_keys::table
                .filter(device_keys::last_seen_at.lt(cutoff))
                .filter(not(exists(owner_in_live_group))),
        )
        .execute(&mut conn)
        .await?;

        if pruned > 0 {
            tracing::info!(pruned, "stale device keys removed");
        }
        Ok(())
    }
}
