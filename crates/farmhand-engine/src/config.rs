//! Implementation of the engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

use crate::monitor::DEFAULT_LOAD_THRESHOLD;

/// The default grid engine administrative user.
const DEFAULT_ADMIN_USER: &str = "sgeadmin";

/// The default path to the grid engine `qconf` tool.
const DEFAULT_QCONF_PATH: &str = "qconf";

/// The default timeout of a single scheduler command, in seconds.
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// The name of the single queue of the local backend.
pub const DEFAULT_QUEUE_NAME: &str = "all.q";

/// The default interval between dispatch ticks, in seconds.
const DEFAULT_DISPATCH_INTERVAL_SECS: u64 = 60;

/// The default number of pairs to keep enqueued per node of a queue.
const DEFAULT_NODE_MULTIPLIER: u64 = 8;

/// The default interval between cluster topology refreshes, in seconds.
const DEFAULT_TOPOLOGY_INTERVAL_SECS: u64 = 300;

/// The default interval between reconciliation sweeps, in seconds.
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 3 * 60 * 60;

/// The default interval between post-processing ticks, in seconds.
const DEFAULT_POST_PROCESSING_INTERVAL_SECS: u64 = 45;

/// The default number of items post-processed per tick.
const DEFAULT_POST_PROCESSING_BATCH_SIZE: usize = 100;

/// The default timeout for a single post processor run, in seconds.
const DEFAULT_PROCESSOR_TIMEOUT_SECS: u64 = 300;

/// The default name of the script inside a processor directory.
const DEFAULT_RUN_SCRIPT_NAME: &str = "process";

/// Default administrative user function for serde.
fn default_admin_user() -> String {
    String::from(DEFAULT_ADMIN_USER)
}

/// Default `qconf` path function for serde.
fn default_qconf_path() -> String {
    String::from(DEFAULT_QCONF_PATH)
}

/// Default command timeout function for serde.
fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

/// Default `use_sudo` function for serde.
fn default_use_sudo() -> bool {
    true
}

/// Default local queue name function for serde.
fn default_queue_name() -> String {
    String::from(DEFAULT_QUEUE_NAME)
}

/// Default dispatch interval function for serde.
fn default_dispatch_interval_secs() -> u64 {
    DEFAULT_DISPATCH_INTERVAL_SECS
}

/// Default node multiplier function for serde.
fn default_node_multiplier() -> u64 {
    DEFAULT_NODE_MULTIPLIER
}

/// Default load threshold function for serde.
fn default_load_threshold() -> i64 {
    DEFAULT_LOAD_THRESHOLD
}

/// Default topology interval function for serde.
fn default_topology_interval_secs() -> u64 {
    DEFAULT_TOPOLOGY_INTERVAL_SECS
}

/// Default reconciliation interval function for serde.
fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

/// Default post-processing interval function for serde.
fn default_post_processing_interval_secs() -> u64 {
    DEFAULT_POST_PROCESSING_INTERVAL_SECS
}

/// Default post-processing batch size function for serde.
fn default_batch_size() -> usize {
    DEFAULT_POST_PROCESSING_BATCH_SIZE
}

/// Default processor timeout function for serde.
fn default_processor_timeout_secs() -> u64 {
    DEFAULT_PROCESSOR_TIMEOUT_SECS
}

/// Default run script name function for serde.
fn default_run_script_name() -> String {
    String::from(DEFAULT_RUN_SCRIPT_NAME)
}

/// Represents the configuration of the dispatch engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct EngineConfig {
    /// The execution backend to use.
    #[serde(default)]
    pub backend: BackendConfig,
    /// The dispatch configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// The cluster topology configuration.
    #[serde(default)]
    pub topology: TopologyConfig,
    /// The post-processing configuration.
    #[serde(default)]
    pub post_processing: PostProcessingConfig,
}

impl EngineConfig {
    /// Validates the engine configuration.
    pub fn validate(&self) -> Result<()> {
        self.backend.validate()?;
        self.dispatch.validate()?;
        self.topology.validate()?;
        self.post_processing.validate()?;
        Ok(())
    }
}

/// Represents supported execution backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackendConfig {
    /// Use a grid engine (SGE) cluster.
    GridEngine(GridEngineBackendConfig),
    /// Use an OAR cluster.
    Oar(OarBackendConfig),
    /// Run job scripts one at a time on this host.
    Local(LocalBackendConfig),
    /// Accept nothing; every submission fails.
    Null,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local(Default::default())
    }
}

impl BackendConfig {
    /// Validates the backend configuration.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::GridEngine(config) => config.validate(),
            Self::Oar(config) => config.validate(),
            Self::Local(config) => config.validate(),
            Self::Null => Ok(()),
        }
    }

    /// Gets the scheduler installation root to initialize the backend with.
    pub fn root(&self) -> Option<&std::path::Path> {
        match self {
            Self::GridEngine(config) => Some(&config.root),
            _ => None,
        }
    }
}

/// Represents configuration for the grid engine backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct GridEngineBackendConfig {
    /// The grid engine installation root, exported as `SGE_ROOT` for
    /// administrative commands.
    pub root: PathBuf,
    /// The user that administrative commands run as.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    /// The path to the `qconf` tool used for administrative commands.
    #[serde(default = "default_qconf_path")]
    pub qconf_path: String,
    /// Whether administrative commands are run through `sudo`.
    #[serde(default = "default_use_sudo")]
    pub use_sudo: bool,
    /// The timeout of a single scheduler command, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for GridEngineBackendConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/opt/sge"),
            admin_user: default_admin_user(),
            qconf_path: default_qconf_path(),
            use_sudo: default_use_sudo(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl GridEngineBackendConfig {
    /// Validates the grid engine backend configuration.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            bail!("grid engine backend configuration value `root` cannot be empty");
        }

        if self.admin_user.is_empty() {
            bail!("grid engine backend configuration value `admin_user` cannot be empty");
        }

        if self.command_timeout_secs == 0 {
            bail!("grid engine backend configuration value `command_timeout_secs` cannot be zero");
        }

        Ok(())
    }

    /// Gets the command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Represents configuration for the OAR backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OarBackendConfig {
    /// The timeout of a single scheduler command, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for OarBackendConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl OarBackendConfig {
    /// Validates the OAR backend configuration.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            bail!("oar backend configuration value `command_timeout_secs` cannot be zero");
        }

        Ok(())
    }

    /// Gets the command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Represents configuration for the local backend.
///
/// <div class="warning">
/// Warning: the local backend runs job scripts directly on the host; only
/// use it with trusted solvers.
/// </div>
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LocalBackendConfig {
    /// The name reported for the single worker node.
    ///
    /// Defaults to the output of `hostname`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// The name reported for the single queue.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            queue_name: default_queue_name(),
        }
    }
}

impl LocalBackendConfig {
    /// Validates the local backend configuration.
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.is_empty() {
            bail!("local backend configuration value `queue_name` cannot be empty");
        }

        if matches!(&self.node_name, Some(name) if name.is_empty()) {
            bail!("local backend configuration value `node_name` cannot be empty");
        }

        Ok(())
    }
}

/// Represents the dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DispatchConfig {
    /// The path to the job script template.
    pub script_template: PathBuf,
    /// The directory job scripts are written to.
    pub script_directory: PathBuf,
    /// The root directory of job pair output.
    pub output_directory: PathBuf,
    /// The root directory of job pair logs.
    pub log_directory: PathBuf,
    /// The working directory scripts are submitted with.
    pub working_directory: PathBuf,
    /// The interval between dispatch ticks, in seconds.
    #[serde(default = "default_dispatch_interval_secs")]
    pub interval_secs: u64,
    /// The number of pairs kept enqueued per node of a queue.
    #[serde(default = "default_node_multiplier")]
    pub node_multiplier: u64,
    /// How far a user's load may exceed the minimum load before their pairs
    /// are deferred.
    #[serde(default = "default_load_threshold")]
    pub load_threshold: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            script_template: PathBuf::from("jobscript.bash"),
            script_directory: PathBuf::from("./scripts"),
            output_directory: PathBuf::from("./output"),
            log_directory: PathBuf::from("./logs"),
            working_directory: PathBuf::from("."),
            interval_secs: default_dispatch_interval_secs(),
            node_multiplier: default_node_multiplier(),
            load_threshold: default_load_threshold(),
        }
    }
}

impl DispatchConfig {
    /// Validates the dispatch configuration.
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("dispatch configuration value `interval_secs` cannot be zero");
        }

        if self.node_multiplier == 0 {
            bail!("dispatch configuration value `node_multiplier` cannot be zero");
        }

        if self.load_threshold < 0 {
            bail!("dispatch configuration value `load_threshold` cannot be negative");
        }

        Ok(())
    }

    /// Gets the dispatch interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Represents the cluster topology configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TopologyConfig {
    /// The interval between topology refreshes, in seconds.
    #[serde(default = "default_topology_interval_secs")]
    pub interval_secs: u64,
    /// The interval between reconciliation sweeps, in seconds.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_topology_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl TopologyConfig {
    /// Validates the topology configuration.
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("topology configuration value `interval_secs` cannot be zero");
        }

        if self.reconcile_interval_secs == 0 {
            bail!("topology configuration value `reconcile_interval_secs` cannot be zero");
        }

        Ok(())
    }

    /// Gets the topology refresh interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Gets the reconciliation interval.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Represents the post-processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PostProcessingConfig {
    /// The interval between post-processing ticks, in seconds.
    #[serde(default = "default_post_processing_interval_secs")]
    pub interval_secs: u64,
    /// The maximum number of items processed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// The timeout of a single processor run, in seconds.
    #[serde(default = "default_processor_timeout_secs")]
    pub processor_timeout_secs: u64,
    /// The name of the script invoked inside a processor directory.
    #[serde(default = "default_run_script_name")]
    pub run_script_name: String,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_post_processing_interval_secs(),
            batch_size: default_batch_size(),
            processor_timeout_secs: default_processor_timeout_secs(),
            run_script_name: default_run_script_name(),
        }
    }
}

impl PostProcessingConfig {
    /// Validates the post-processing configuration.
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("post-processing configuration value `interval_secs` cannot be zero");
        }

        if self.batch_size == 0 {
            bail!("post-processing configuration value `batch_size` cannot be zero");
        }

        if self.run_script_name.is_empty() {
            bail!("post-processing configuration value `run_script_name` cannot be empty");
        }

        Ok(())
    }

    /// Gets the post-processing interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Gets the processor timeout.
    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs)
    }
}
