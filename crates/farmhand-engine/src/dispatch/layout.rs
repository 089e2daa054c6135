//! Filesystem layout of job pair artifacts.

use std::path::Path;
use std::path::PathBuf;

use crate::config::DispatchConfig;
use crate::store::JobPair;

/// Computes where the script, log and output of a pair live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairLayout {
    /// The directory job scripts are written to.
    script_directory: PathBuf,
    /// The root directory of pair logs.
    log_directory: PathBuf,
    /// The root directory of pair output.
    output_directory: PathBuf,
}

impl PairLayout {
    /// Constructs a layout from the dispatch configuration.
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            script_directory: config.script_directory.clone(),
            log_directory: config.log_directory.clone(),
            output_directory: config.output_directory.clone(),
        }
    }

    /// Gets the directory job scripts are written to.
    pub fn script_directory(&self) -> &Path {
        &self.script_directory
    }

    /// Gets the path of a pair's job script.
    pub fn script_path(&self, pair: &JobPair) -> PathBuf {
        self.script_directory
            .join(format!("job_{pair}.bash", pair = pair.id))
    }

    /// Gets the path of a pair's log file.
    pub fn log_path(&self, pair: &JobPair) -> PathBuf {
        self.log_directory
            .join(pair.job_id.to_string())
            .join(format!("{pair}.log", pair = pair.id))
    }

    /// Gets a pair's output directory.
    pub fn output_directory(&self, pair: &JobPair) -> PathBuf {
        self.output_directory
            .join(pair.user_id.to_string())
            .join(pair.job_id.to_string())
            .join(pair.id.to_string())
    }

    /// Gets the output file of one stage of a pair.
    pub fn stage_output(&self, pair: &JobPair, stage: i64) -> PathBuf {
        self.output_directory(pair).join(format!("{stage}.txt"))
    }
}
