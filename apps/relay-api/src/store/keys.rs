//! Key and channel names shared by every instance in the fleet.
//!
//! These strings are a cross-instance wire contract: an instance running an
//! older build must still find the same presence records and channels, so
//! changing any of them is a breaking protocol change.

/// Presence records expire this many seconds after their last refresh.
pub const PRESENCE_TTL_SECS: u64 = 120;

/// Presence refresh cadence. Strictly less than half the expiry window so a
/// single missed refresh does not flap the record.
pub const PRESENCE_REFRESH_SECS: u64 = 45;

/// The single fleet-wide lifecycle events channel.
pub const EVENTS_CHANNEL: &str = "events";

/// `presence:{user_id}` → owning instance id.
pub fn presence(user_id: &str) -> String {
    format!("presence:{user_id}")
}

/// `instance:{instance_id}:clients` → set of locally-connected user ids.
pub fn instance_clients(instance_id: &str) -> String {
    format!("instance:{instance_id}:clients")
}

/// `user:{user_id}:groups` → set of group ids with active membership.
pub fn user_groups(user_id: &str) -> String {
    format!("user:{user_id}:groups")
}

/// `group:{group_id}:members` → set of member user ids.
pub fn group_members(group_id: &str) -> String {
    format!("group:{group_id}:members")
}

/// `group:{group_id}:info` → hash of denormalized group metadata.
pub fn group_info(group_id: &str) -> String {
    format!("group:{group_id}:info")
}

/// Per-group broadcast channel for newly persisted messages.
pub fn group_message_channel(group_id: &str) -> String {
    format!("group:{group_id}:messages")
}

/// Extract the group id from a message channel name, if it is one.
pub fn parse_group_message_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("group:")
        .and_then(|rest| rest.strip_suffix(":messages"))
}

/// `lock:job:{name}` — scheduler mutual-exclusion key.
pub fn job_lock(job_name: &str) -> String {
    format!("lock:job:{job_name}")
}
