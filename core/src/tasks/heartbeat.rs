use crate::helpers::flag_store::FlagStore;
use anyhow::Result;
use chrono::Duration;
use uuid::Uuid;

const HEARTBEAT_TTL_SECONDS: i64 = 120;

fn flag(job_id: Uuid) -> String {
  format!("job_heartbeat:{}", job_id)
}

/// Marks a job as actively worked on. The TTL doubles as the liveness
/// window: a crashed worker's heartbeat simply expires.
pub async fn beat(flags: &FlagStore, job_id: Uuid) -> Result<()> {
  flags
    .raise(&flag(job_id), Duration::try_seconds(HEARTBEAT_TTL_SECONDS))
    .await
}

/// True when another live worker currently owns the job.
pub async fn is_fresh(flags: &FlagStore, job_id: Uuid) -> Result<bool> {
  flags.is_raised(&flag(job_id)).await
}

pub async fn clear(flags: &FlagStore, job_id: Uuid) -> Result<()> {
  flags.clear(&flag(job_id)).await
}
