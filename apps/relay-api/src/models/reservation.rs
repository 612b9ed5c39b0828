use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::group_reservations;

/// A claimed-but-not-yet-created group id, held so a client can pre-stage an
/// avatar upload. Deleted on group creation or after 24h of staleness.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = group_reservations)]
pub struct GroupReservation {
    pub group_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}
