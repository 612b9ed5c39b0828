//! Cleanup of group reservations that were never completed.
//!
//! A reservation pins a group id (and possibly uploaded media) while a
//! client walks the creation flow. Abandoned flows leave the reservation
//! behind; after a day it is not coming back.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tokio_util::sync::CancellationToken;

use crate::db::schema::group_reservations;
use crate::error::Error;
use crate::models::GroupReservation;
use crate::storage::group_prefix;

use super::{Job, JobContext};

const STALE_AFTER_HOURS: i64 = 24;

pub struct StaleReservations;

#[async_trait]
impl Job for StaleReservations {
    fn name(&self) -> &'static str {
        "stale-reservations"
    }

    fn schedule(&self) -> &'static str {
        // Hourly.
        "0 0 * * * *"
    }

    fn lock_ttl(&self) -> u64 {
        300
    }

    async fn execute(&self, ctx: &JobContext, cancel: &CancellationToken) -> Result<(), Error> {
        let cutoff = Utc::now() - Duration::hours(STALE_AFTER_HOURS);
        let mut conn = ctx.db.get().await?;

        let stale: Vec<GroupReservation> = group_reservations::table
            .filter(group_reservations::created_at.lt(cutoff))
            .select(GroupReservation::as_select())
            .load(&mut conn)
            .await?;
        if stale.is_empty() {
            return Ok(());
        }
        tracing::info!(count = stale.len(), "reclaiming stale reservations");

        for reservation in &stale {
            if cancel.is_cancelled() {
                break;
            }
            let group_id = &reservation.group_id;
            // Media first, row second; a surviving row re-drives the media
            // deletion next tick.
            if let Err(err) = ctx.objects.delete_prefix(&group_prefix(group_id)).await {
                tracing::warn!(%group_id, error = %err, "reserved media deletion failed");
                continue;
            }
            diesel::delete(
                group_reservations::table.filter(group_reservations::group_id.eq(group_id)),
            )
            .execute(&mut conn)
            .await?;
            tracing::debug!(%group_id, holder = %reservation.user_id, "reservation reclaimed");
        }
        Ok(())
    }
}
