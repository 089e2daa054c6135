//! Progress reported by running job scripts.
//!
//! A job script reports back while it runs: once when it starts, once per
//! finished stage and once when it is done (or has failed). These reports
//! are what move a pair from `Enqueued` to `Running` and on to `Complete`.
//!
//! A pair with a post processor stays `Running` after it finishes; the
//! post-processing tick completes it once the queued stage output has been
//! processed.

use anyhow::Result;
use anyhow::bail;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::PairId;
use crate::store::PairStatus;
use crate::store::PairStore;
use crate::store::ResourceUsage;

/// A progress report of a job script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairReport {
    /// The script started running.
    Running,
    /// A stage of the pair finished.
    StageFinished(i64),
    /// The script finished, with the resources it used if they were
    /// measured.
    Finished(Option<ResourceUsage>),
    /// The script failed.
    Failed(String),
}

/// Applies a job script report to a pair.
///
/// Returns the status of the pair afterwards. A report that comes too late
/// for the pair's status (for example a killed pair reporting that it
/// started) is logged and otherwise ignored.
pub async fn apply(store: &dyn PairStore, pair: PairId, report: PairReport) -> Result<PairStatus> {
    let Some(stored) = store.get_pair(pair).await? else {
        bail!("job pair `{pair}` does not exist");
    };

    match report {
        PairReport::Running => {
            if !store.set_pair_status(pair, PairStatus::Running).await? {
                warn!(pair, status = %stored.status, "ignoring start of job pair");
            }
        }
        PairReport::StageFinished(stage) => {
            if stage < 1 || stage > stored.stages.len() as i64 {
                bail!(
                    "job pair `{pair}` has no stage {stage}; it has {count} stage(s)",
                    count = stored.stages.len()
                );
            }

            store.complete_stage(pair, stage).await?;
            debug!(pair, stage, "stage of job pair finished");
        }
        PairReport::Finished(usage) => {
            if !store.finish_pair(pair, usage).await? {
                debug!(pair, "ignoring repeated finish of job pair");
            } else if stored.post_processor.is_some() {
                // The last stage always gets processed, even if the script
                // did not report it
                let last = stored.stages.len() as i64;
                store.complete_stage(pair, last).await?;
                info!(pair, "job pair finished; awaiting post-processing");
            } else if store.set_pair_status(pair, PairStatus::Complete).await? {
                info!(pair, "job pair complete");
            } else {
                warn!(pair, status = %stored.status, "finished job pair was not completed");
            }
        }
        PairReport::Failed(reason) => {
            if store.set_pair_error(pair, &reason).await? {
                info!(pair, %reason, "job pair failed");
            } else {
                warn!(pair, status = %stored.status, "ignoring failure of job pair");
            }
        }
    }

    Ok(store
        .get_pair(pair)
        .await?
        .map(|p| p.status)
        .unwrap_or(stored.status))
}
