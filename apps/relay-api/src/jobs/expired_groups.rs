//! Teardown of groups past their expiry timestamp.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use tokio_util::sync::CancellationToken;

use crate::db::schema::{group_members, groups, messages};
use crate::error::Error;
use crate::fanout::lifecycle;
use crate::models::Group;
use crate::storage::group_prefix;

use super::{Job, JobContext};

/// Groups torn down per tick. Bounds one run's work; the rest waits for the
/// next tick.
const TEARDOWN_BATCH: i64 = 50;

pub struct ExpiredGroups;

#[async_trait]
impl Job for ExpiredGroups {
    fn name(&self) -> &'static str {
        "expired-groups"
    }

    fn schedule(&self) -> &'static str {
        // Every five minutes.
        "0 */5 * * * *"
    }

    fn lock_ttl(&self) -> u64 {
        240
    }

    async fn execute(&self, ctx: &JobContext, cancel: &CancellationToken) -> Result<(), Error> {
        let mut conn = ctx.db.get().await?;

        let expired: Vec<Group> = groups::table
            .filter(groups::expires_at.le(Utc::now()))
            .select(Group::as_select())
            .limit(TEARDOWN_BATCH)
            .load(&mut conn)
            .await?;
        if expired.is_empty() {
            return Ok(());
        }
        tracing::info!(count = expired.len(), "tearing down expired groups");

        let mut failed = 0usize;
        for group in &expired {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = teardown_group(ctx, &group.id).await {
                tracing::error!(group_id = %group.id, expired_at = %group.expires_at, error = %err, "group teardown failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(Error::JobExecution {
                job: "expired-groups",
                message: format!("{failed} of {} groups failed teardown", expired.len()),
            });
        }
        Ok(())
    }
}

/// One group's teardown. Media first (orphaned rows can re-drive media
/// deletion, orphaned media cannot be found from deleted rows), then the
/// rows in one transaction, then the shared cache views and the fleet-wide
/// announcement.
async fn teardown_group(ctx: &JobContext, group_id: &str) -> Result<(), Error> {
    match ctx.objects.delete_prefix(&group_prefix(group_id)).await {
        Ok(removed) => {
            if removed > 0 {
                tracing::debug!(%group_id, removed, "group media deleted");
            }
        }
        Err(err) => {
            // Rows still go; leaked media is re-deletable, a half-dead group
            // is worse.
            tracing::warn!(%group_id, error = %err, "media deletion failed");
        }
    }

    let mut conn = ctx.db.get().await?;
    let member_ids = conn
        .transaction::<_, Error, _>(|conn| {
            async move {
                let member_ids: Vec<String> = group_members::table
                    .filter(group_members::group_id.eq(group_id))
                    .select(group_members::user_id)
                    .load(conn)
                    .await?;

                diesel::delete(messages::table.filter(messages::group_id.eq(group_id)))
                    .execute(conn)
                    .await?;
                diesel::delete(
                    group_members::table.filter(group_members::group_id.eq(group_id)),
                )
                .execute(conn)
                .await?;
                diesel::delete(groups::table.filter(groups::id.eq(group_id)))
                    .execute(conn)
                    .await?;

                Ok(member_ids)
            }
            .scope_boxed()
        })
        .await?;

    // Best effort from here: the rows are gone, which is the source of
    // truth. Stale cache entries get no deliveries and carry their own TTLs
    // where they have one.
    if let Err(err) = lifecycle::group_deleted(&*ctx.store, group_id, &member_ids).await {
        tracing::warn!(%group_id, error = %err, "cache retraction after teardown failed");
    }

    Ok(())
}
