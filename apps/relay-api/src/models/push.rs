use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::push_receipts;

/// A pending provider receipt awaiting a delivery verdict.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = push_receipts)]
pub struct PushReceipt {
    pub ticket_id: String,
    pub push_token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = push_receipts)]
pub struct NewPushReceipt<'a> {
    pub ticket_id: &'a str,
    pub push_token: &'a str,
    pub created_at: DateTime<Utc>,
}
