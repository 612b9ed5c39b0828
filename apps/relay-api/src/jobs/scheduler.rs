//! Cron-driven job loops with store-backed mutual exclusion.
//!
//! Every instance computes the same tick times from the cron expression and
//! races for `lock:job:{name}` at each one. The winner executes; everyone
//! else skips the tick. The lock is owned by instance id and released by
//! compare-and-delete, so a crashed winner only blocks until the TTL lapses.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::store::keys;

use super::{job_enabled, Job, JobContext};

/// Lock acquisition attempts per tick, spaced by [`LOCK_RETRY_BACKOFF`].
/// Covers transient store hiccups at tick time without re-running a tick a
/// finished winner already released the lock for.
const LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Spawn one loop per registered job.
pub fn spawn_all(ctx: JobContext, jobs: Vec<Arc<dyn Job>>, cancel: &CancellationToken) {
    for job in jobs {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_job_loop(ctx, job, cancel).await;
        });
    }
}

async fn run_job_loop(ctx: JobContext, job: Arc<dyn Job>, cancel: CancellationToken) {
    let schedule = match Schedule::from_str(job.schedule()) {
        Ok(schedule) => schedule,
        Err(err) => {
            tracing::error!(job = job.name(), error = %err, "invalid cron expression; job not scheduled");
            return;
        }
    };

    if !job.enabled() {
        tracing::info!(job = job.name(), "statically disabled; not scheduled");
        return;
    }

    tracing::info!(job = job.name(), schedule = job.schedule(), "job scheduled");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::warn!(job = job.name(), "schedule yields no further ticks");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        if !job_enabled(job.name()) {
            tracing::debug!(job = job.name(), "disabled by override; tick skipped");
            continue;
        }

        run_tick(&ctx, job.as_ref(), &cancel).await;
    }
}

/// One scheduled tick: race for the lock, execute on win, always release
/// what we own. Returns whether this instance executed.
pub async fn run_tick(ctx: &JobContext, job: &dyn Job, cancel: &CancellationToken) -> bool {
    let lock_key = keys::job_lock(job.name());

    let mut acquired = false;
    for attempt in 0..LOCK_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(LOCK_RETRY_BACKOFF * attempt).await;
        }
        match ctx
            .store
            .try_lock(&lock_key, &ctx.instance_id, job.lock_ttl())
            .await
        {
            Ok(true) => {
                acquired = true;
                break;
            }
            Ok(false) => {
                // Held by another instance; this tick is covered.
                tracing::debug!(job = job.name(), "lock held elsewhere; tick skipped");
                return false;
            }
            Err(err) => {
                tracing::warn!(job = job.name(), attempt, error = %err, "lock attempt failed");
            }
        }
    }
    if !acquired {
        tracing::error!(job = job.name(), "store unreachable; tick skipped");
        return false;
    }

    tracing::info!(job = job.name(), "job starting");
    let started = std::time::Instant::now();
    match job.execute(ctx, cancel).await {
        Ok(()) => {
            tracing::info!(job = job.name(), elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
        }
        Err(err) => {
            tracing::error!(job = job.name(), error = %err, "job failed");
        }
    }

    // Release even after failure; the next tick should not wait out the TTL.
    match ctx.store.del_if_eq(&lock_key, &ctx.instance_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(job = job.name(), "lock expired mid-run; TTL may be too short");
        }
        Err(err) => {
            tracing::warn!(job = job.name(), error = %err, "lock release failed; TTL will clear it");
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::push::ExpoPushClient;
    use crate::storage::MemoryObjectStore;
    use crate::store::{CoordStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowJob {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for SlowJob {
        fn name(&self) -> &'static str {
            "slow-job"
        }

        fn schedule(&self) -> &'static str {
            "0 * * * * *"
        }

        fn lock_ttl(&self) -> u64 {
            30
        }

        async fn execute(&self, _ctx: &JobContext, _cancel: &CancellationToken) -> Result<(), Error> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            // Hold the lock long enough for the loser to observe it.
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    struct FailingJob;

    #[async_trait]
    impl Job for FailingJob {
        fn name(&self) -> &'static str {
            "failing-job"
        }

        fn schedule(&self) -> &'static str {
            "0 * * * * *"
        }

        fn lock_ttl(&self) -> u64 {
            30
        }

        async fn execute(&self, _ctx: &JobContext, _cancel: &CancellationToken) -> Result<(), Error> {
            Err(Error::JobExecution {
                job: "failing-job",
                message: "boom".to_string(),
            })
        }
    }

    fn context(store: Arc<MemoryStore>, instance_id: &str) -> JobContext {
        let manager = diesel_async::pooled_connection::AsyncDieselConnectionManager::<
            diesel_async::AsyncPgConnection,
        >::new("postgres://unused/unused");
        let db = diesel_async::pooled_connection::deadpool::Pool::builder(manager)
            .max_size(1)
            .build()
            .unwrap();
        JobContext {
            db,
            store,
            objects: Arc::new(MemoryObjectStore::new()),
            push: Arc::new(ExpoPushClient::new(None)),
            instance_id: instance_id.to_string(),
        }
    }

    #[tokio::test]
    async fn one_instance_wins_each_tick() {
        let store = Arc::new(MemoryStore::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let a = {
            let ctx = context(store.clone(), "ins_a");
            let job = SlowJob { runs: runs.clone() };
            let cancel = cancel.clone();
            tokio::spawn(async move { run_tick(&ctx, &job, &cancel).await })
        };
        let b = {
            let ctx = context(store.clone(), "ins_b");
            let job = SlowJob { runs: runs.clone() };
            let cancel = cancel.clone();
            tokio::spawn(async move { run_tick(&ctx, &job, &cancel).await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a ^ b, "exactly one instance must execute");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lock_released_after_failure() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone(), "ins_a");
        let cancel = CancellationToken::new();

        assert!(run_tick(&ctx, &FailingJob, &cancel).await);
        // Lock free again: another instance can win the next tick.
        assert!(store
            .try_lock("lock:job:failing-job", "ins_b", 30)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn held_lock_skips_the_tick() {
        let store = Arc::new(MemoryStore::new());
        store
            .try_lock("lock:job:failing-job", "ins_other", 30)
            .await
            .unwrap();
        let ctx = context(store.clone(), "ins_a");
        let cancel = CancellationToken::new();

        assert!(!run_tick(&ctx, &FailingJob, &cancel).await);
        // The holder keeps it.
        assert!(!store
            .try_lock("lock:job:failing-job", "ins_b", 30)
            .await
            .unwrap());
    }
}
