//! Post-processing of finished job pair output.
//!
//! Each tick takes a bounded batch of the stages awaiting post-processing,
//! runs the stage's processor over the raw output and stores the resulting
//! attributes. Items that fail stay queued for the next tick.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;

use crate::backend::CommandRunner;
use crate::backend::CommandSpec;
use crate::config::PostProcessingConfig;
use crate::dispatch::PairLayout;
use crate::store::PairStatus;
use crate::store::PairStore;
use crate::store::PostProcessingItem;

/// Parses `key=value` lines of processor output into attributes.
///
/// Blank lines, `#` comments and lines without `=` are ignored. Later
/// values of a repeated key replace earlier ones.
pub fn parse_attributes(output: &str) -> IndexMap<String, String> {
    let mut attributes = IndexMap::new();
    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            trace!(line, "ignoring processor output line");
            continue;
        };

        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        attributes.insert(key.to_string(), value.trim().to_string());
    }

    attributes
}

/// Represents a step that turns the output of a pair stage into attributes.
#[async_trait]
pub trait PostProcessor: Send + Sync + fmt::Debug {
    /// Processes one stage of a pair.
    async fn process(&self, item: &PostProcessingItem) -> Result<IndexMap<String, String>>;
}

/// A post processor that runs a script in the processor's directory.
///
/// The script is invoked with the stage output file and the benchmark path
/// and prints `key=value` lines.
#[derive(Debug)]
pub struct ScriptPostProcessor {
    /// The persistence layer.
    store: Arc<dyn PairStore>,
    /// The runner of processor scripts.
    runner: Arc<dyn CommandRunner>,
    /// The layout used to find stage output.
    layout: PairLayout,
    /// The name of the script inside a processor directory.
    run_script_name: String,
    /// The timeout of a single run.
    timeout: Duration,
}

impl ScriptPostProcessor {
    /// Constructs a new script post processor.
    pub fn new(
        config: &PostProcessingConfig,
        layout: PairLayout,
        store: Arc<dyn PairStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            store,
            runner,
            layout,
            run_script_name: config.run_script_name.clone(),
            timeout: config.processor_timeout(),
        }
    }
}

#[async_trait]
impl PostProcessor for ScriptPostProcessor {
    async fn process(&self, item: &PostProcessingItem) -> Result<IndexMap<String, String>> {
        let pair = self
            .store
            .get_pair(item.pair_id)
            .await?
            .with_context(|| format!("job pair `{pair}` does not exist", pair = item.pair_id))?;

        let processor = self
            .store
            .get_processor(item.processor_id)
            .await?
            .with_context(|| {
                format!(
                    "processor `{processor}` does not exist",
                    processor = item.processor_id
                )
            })?;

        let script = processor.path.join(&self.run_script_name);
        let output = self.layout.stage_output(&pair, item.stage);

        let command = CommandSpec::new(script.display().to_string())
            .arg(output.display().to_string())
            .arg(pair.benchmark.path.display().to_string())
            .current_dir(&processor.path)
            .timeout(self.timeout);

        let stdout = self.runner.run(&command).await.with_context(|| {
            format!(
                "failed to run processor `{name}` on stage {stage} of job pair `{pair}`",
                name = processor.name,
                stage = item.stage,
                pair = pair.id
            )
        })?;

        Ok(parse_attributes(&stdout))
    }
}

/// A summary of one post-processing tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostProcessingReport {
    /// The number of items processed.
    pub processed: usize,
    /// The number of items that failed.
    pub failed: usize,
    /// The number of items still awaiting post-processing.
    pub remaining: usize,
}

/// Drives post-processing in bounded batches.
#[derive(Debug)]
pub struct PostProcessingCoordinator {
    /// The persistence layer.
    store: Arc<dyn PairStore>,
    /// The processing step.
    processor: Arc<dyn PostProcessor>,
    /// The maximum number of items per tick.
    batch_size: usize,
}

impl PostProcessingCoordinator {
    /// Constructs a new coordinator.
    pub fn new(
        store: Arc<dyn PairStore>,
        processor: Arc<dyn PostProcessor>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            processor,
            batch_size,
        }
    }

    /// Runs one post-processing tick.
    pub async fn tick(&self) -> PostProcessingReport {
        let mut report = PostProcessingReport::default();

        let items = match self.store.get_pairs_awaiting_post_processing().await {
            Ok(items) => items,
            Err(e) => {
                error!("failed to get pairs awaiting post-processing: {e:#}");
                return report;
            }
        };

        for item in items.iter().take(self.batch_size) {
            match self.process(item).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    error!(
                        pair = item.pair_id,
                        stage = item.stage,
                        "post-processing failed: {e:#}"
                    );
                    report.failed += 1;
                }
            }
        }

        report.remaining = items.len() - report.processed;
        if report.processed + report.failed > 0 {
            info!(
                processed = report.processed,
                failed = report.failed,
                remaining = report.remaining,
                "post-processing tick finished"
            );
        }

        report
    }

    /// Processes a single item.
    async fn process(&self, item: &PostProcessingItem) -> Result<()> {
        let attributes = self.processor.process(item).await?;
        debug!(
            pair = item.pair_id,
            stage = item.stage,
            attributes = attributes.len(),
            "processed stage output"
        );

        self.store
            .add_pair_attributes(item.pair_id, item.stage, &attributes)
            .await?;

        if !self
            .store
            .set_pair_status(item.pair_id, PairStatus::Complete)
            .await?
        {
            debug!(pair = item.pair_id, "job pair status left unchanged");
        }

        self.store
            .mark_post_processed(item.pair_id, item.stage)
            .await
    }
}
