use chrono::{DateTime, Utc};
use cove_common::id::{prefix, PrefixedId};
use diesel::prelude::*;

use crate::db::schema::groups;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = groups)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub avatar_key: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PrefixedId for Group {
    const PREFIX: &'static str = prefix::GROUP;
}
