//! Network load balancer pipeline
//!
//! Same shape as the CLB pipeline. Server groups live outside the load
//! balancer and are found by tag, and most writes are asynchronous jobs
//! that [`wait_job`] polls to completion.

mod applier;
mod builder;
mod fetcher;
mod listener;


pub use applier::apply;
pub use builder::build_local;
pub use fetcher::build_remote;

use tracing::debug;

use crate::config::ReconcileOptions;
use crate::error::{Error, Result};
use crate::provider::{JobStatus, NlbProvider};

/// Servers per add/remove/update call
pub const MAX_SERVERS_PER_CALL: usize = 200;

/// Poll `job_id` until it finishes or `job_timeout` runs out
pub async fn wait_job<P>(provider: &P, job_id: &str, opts: &ReconcileOptions) -> Result<()>
where
    P: NlbProvider + ?Sized,
{
    let poll = async {
        loop {
            match provider.describe_job(job_id).await? {
                JobStatus::Succeeded => return Ok(()),
                JobStatus::Failed { code, message } => {
                    return Err(Error::cloud(code, format!("job {job_id} failed: {message}")))
                }
                JobStatus::Processing => {
                    debug!(job_id, "job still processing");
                    tokio::time::sleep(opts.job_poll_interval).await;
                }
            }
        }
    };
    tokio::time::timeout(opts.job_timeout, poll)
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "job {job_id} did not finish within {:?}",
                opts.job_timeout
            ))
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::nlb::NlbAttributes;
    use crate::provider::memory::MemoryCloud;
    use std::time::Duration;

    fn opts(timeout_ms: u64) -> ReconcileOptions {
        ReconcileOptions {
            job_poll_interval: Duration::from_millis(1),
            job_timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_wait_job_polls_until_done() {
        let cloud = MemoryCloud::new().with_job_polls(3);
        let id = cloud.insert_nlb(NlbAttributes::default()).await;
        let job = cloud.delete_nlb(&id).await.unwrap();

        wait_job(&cloud, &job, &opts(5_000)).await.unwrap();
        let polls = cloud
            .calls()
            .await
            .iter()
            .filter(|c| c.op == "GetJobStatus")
            .count();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn test_wait_job_times_out() {
        let cloud = MemoryCloud::new().with_job_polls(u32::MAX);
        let id = cloud.insert_nlb(NlbAttributes::default()).await;
        let job = cloud.delete_nlb(&id).await.unwrap();

        let err = wait_job(&cloud, &job, &opts(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_retriable());
    }
}
