//! Scheduled maintenance jobs.
//!
//! Every instance runs the scheduler; a store-backed lock keyed by job name
//! ensures each tick executes on exactly one instance.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::db::pool::DbPool;
use crate::error::Error;
use crate::push::PushProvider;
use crate::storage::ObjectStore;
use crate::store::CoordStore;

pub mod expired_groups;
pub mod push_receipts;
pub mod scheduler;
pub mod stale_device_keys;
pub mod stale_reservations;

/// Environment prefix for per-job overrides, e.g. `JOB_EXPIRED_GROUPS=false`.
const JOB_ENV_PREFIX: &str = "JOB_";

/// Shared handles a job executes against.
#[derive(Clone)]
pub struct JobContext {
    pub db: DbPool,
    pub store: Arc<dyn CoordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub push: Arc<dyn PushProvider>,
    pub instance_id: String,
}

#[async_trait]
pub trait Job: Send + Sync {
    /// Stable name; the lock key and the env override derive from it.
    fn name(&self) -> &'static str;

    /// Cron expression with a seconds field.
    fn schedule(&self) -> &'static str;

    /// Lock lifetime in seconds. Longer than the worst expected run so the
    /// lock outlives the work, shorter than the schedule interval so a
    /// crashed holder frees the tick before the next one.
    fn lock_ttl(&self) -> u64;

    /// Static enable flag; the `JOB_*` env override layers on top of it.
    fn enabled(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &JobContext, cancel: &CancellationToken) -> Result<(), Error>;
}

/// All jobs this binary schedules.
pub fn registry() -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(expired_groups::ExpiredGroups),
        Arc::new(stale_reservations::StaleReservations),
        Arc::new(stale_device_keys::StaleDeviceKeys),
        Arc::new(push_receipts::PushReceipts),
    ]
}

fn override_var_name(job_name: &str) -> String {
    format!(
        "{JOB_ENV_PREFIX}{}",
        job_name.to_uppercase().replace('-', "_")
    )
}

/// A job is enabled unless its override variable is set to `false` or `0`.
pub fn job_enabled(job_name: &str) -> bool {
    match std::env::var(override_var_name(job_name)) {
        Ok(value) => !matches!(value.trim(), "false" | "0"),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_names_follow_the_job_name() {
        assert_eq!(override_var_name("expired-groups"), "JOB_EXPIRED_GROUPS");
        assert_eq!(override_var_name("push-receipts"), "JOB_PUSH_RECEIPTS");
    }

    #[test]
    fn jobs_default_to_enabled() {
        assert!(job_enabled("some-job-with-no-override"));
    }

    #[test]
    fn false_and_zero_disable() {
        // Unique names per case; the environment is process-global.
        std::env::set_var("JOB_UNIT_CASE_A", "false");
        assert!(!job_enabled("unit-case-a"));

        std::env::set_var("JOB_UNIT_CASE_B", "0");
        assert!(!job_enabled("unit-case-b"));

        std::env::set_var("JOB_UNIT_CASE_C", "true");
        assert!(job_enabled("unit-case-c"));
    }

    #[test]
    fn registry_names_and_schedules_are_well_formed() {
        use std::str::FromStr;
        for job in registry() {
            assert!(cron::Schedule::from_str(job.schedule()).is_ok(), "{}", job.name());
            assert!(!job.name().is_empty());
        }
    }
}
