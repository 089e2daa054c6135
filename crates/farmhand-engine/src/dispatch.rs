//! Implementation of the job dispatcher.
//!
//! The dispatcher turns eligible job pairs into executable scripts and hands
//! them to the execution backend. Each queue has its own fair-share monitor;
//! a user whose load runs too far ahead of the others on a queue has their
//! pairs deferred to a later tick.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::ExecutionBackend;
use crate::ExecutionId;
use crate::PairId;
use crate::UserId;
use crate::config::DispatchConfig;
use crate::monitor::FairShareLoadMonitor;
use crate::monitor::Load;
use crate::store::Job;
use crate::store::JobPair;
use crate::store::PairStatus;
use crate::store::PairStore;

mod layout;
mod template;

pub use layout::PairLayout;
pub use template::ScriptTemplate;
pub use template::bash_array;
pub use template::shell_escape;

/// The number of bytes in a megabyte, as used for `$$MAX_MEM$$`.
const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// The permissions of written job scripts.
#[cfg(unix)]
const SCRIPT_MODE: u32 = 0o755;

/// The outcome of submitting a single pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The backend accepted the pair.
    Submitted(ExecutionId),
    /// The pair was left for a later tick.
    Deferred,
    /// The backend rejected the submission; the pair stays enqueued.
    Rejected,
    /// The pair could not be prepared and was marked as an error.
    Failed,
}

/// A summary of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// The number of pairs the backend accepted.
    pub submitted: usize,
    /// The number of pairs left for a later tick.
    pub deferred: usize,
    /// The number of pairs marked as an error.
    pub failed: usize,
}

impl DispatchReport {
    /// Records the outcome of one pair.
    fn record(&mut self, outcome: SubmitOutcome) {
        match outcome {
            SubmitOutcome::Submitted(_) => self.submitted += 1,
            SubmitOutcome::Deferred | SubmitOutcome::Rejected => self.deferred += 1,
            SubmitOutcome::Failed => self.failed += 1,
        }
    }
}

/// Represents the job dispatcher.
#[derive(Debug)]
pub struct JobDispatcher {
    /// The backend pairs are submitted to.
    backend: Arc<dyn ExecutionBackend>,
    /// The persistence layer.
    store: Arc<dyn PairStore>,
    /// The job script template.
    template: ScriptTemplate,
    /// The filesystem layout of pair artifacts.
    layout: PairLayout,
    /// The working directory scripts are submitted with.
    working_directory: PathBuf,
    /// The number of pairs kept enqueued per node of a queue.
    node_multiplier: u64,
    /// The skip threshold of new monitors.
    load_threshold: Load,
    /// The fair-share monitor of each queue.
    monitors: HashMap<String, FairShareLoadMonitor>,
}

impl JobDispatcher {
    /// Constructs a new job dispatcher.
    pub fn new(
        config: &DispatchConfig,
        template: ScriptTemplate,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn PairStore>,
    ) -> Self {
        Self {
            backend,
            store,
            template,
            layout: PairLayout::new(config),
            working_directory: config.working_directory.clone(),
            node_multiplier: config.node_multiplier,
            load_threshold: config.load_threshold,
            monitors: HashMap::new(),
        }
    }

    /// Constructs a new job dispatcher, reading the template named by the
    /// configuration.
    pub fn from_config(
        config: &DispatchConfig,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn PairStore>,
    ) -> Result<Self> {
        let template = ScriptTemplate::from_file(&config.script_template)?;
        Ok(Self::new(config, template, backend, store))
    }

    /// Gets the pair layout used by the dispatcher.
    pub fn layout(&self) -> &PairLayout {
        &self.layout
    }

    /// Gets the fair-share monitor of a queue, if the queue has been
    /// dispatched to.
    pub fn monitor(&self, queue: &str) -> Option<&FairShareLoadMonitor> {
        self.monitors.get(queue)
    }

    /// Renders and writes the job script of a pair.
    ///
    /// The script is made executable by its owner. Returns the path of the
    /// script.
    pub fn write_script(&self, pair: &JobPair) -> Result<PathBuf> {
        let path = self.layout.script_path(pair);
        let values = self.script_values(pair, &path)?;
        let script = self.template.render(&values);

        fs::create_dir_all(self.layout.script_directory()).with_context(|| {
            format!(
                "failed to create directory `{path}`",
                path = self.layout.script_directory().display()
            )
        })?;

        fs::write(&path, script).with_context(|| {
            format!(
                "failed to write job script `{path}`",
                path = path.display()
            )
        })?;

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;

            fs::set_permissions(&path, Permissions::from_mode(SCRIPT_MODE)).with_context(|| {
                format!(
                    "failed to make job script `{path}` executable",
                    path = path.display()
                )
            })?;
        }

        Ok(path)
    }

    /// Submits a written script to the backend.
    pub async fn submit(&self, script: &Path, log: &Path) -> ExecutionId {
        self.backend
            .submit_script(script, &self.working_directory, log)
            .await
    }

    /// Stores a job and submits each of its pairs.
    ///
    /// The job is stored before anything is submitted. Pairs are submitted
    /// independently; a pair that fails does not stop the others. Fair-share
    /// deferral does not apply to a job submitted directly.
    pub async fn submit_job(&mut self, job: Job) -> Result<(Job, DispatchReport)> {
        let job = self.store.add_job(job).await?;
        info!(job = job.id, pairs = job.pairs.len(), "stored job");

        let mut report = DispatchReport::default();
        let mut available = true;
        for pair in &job.pairs {
            let outcome = self.submit_pair(pair, available).await;
            match outcome {
                SubmitOutcome::Submitted(_) => {
                    if let Some(monitor) = self.monitors.get_mut(&pair.queue) {
                        monitor.change_load(pair.user_id, pair.limits.wallclock_timeout);
                    }
                }
                SubmitOutcome::Rejected => available = false,
                SubmitOutcome::Deferred | SubmitOutcome::Failed => {}
            }
            report.record(outcome);
        }

        Ok((job, report))
    }

    /// Runs one dispatch pass over the eligible pairs.
    ///
    /// `node_counts` holds the number of nodes of each known queue; a queue
    /// missing from it has unbounded capacity.
    pub async fn dispatch(&mut self, node_counts: &HashMap<String, usize>) -> DispatchReport {
        let mut report = DispatchReport::default();

        let pairs = match self.store.get_eligible_pairs_for_dispatch().await {
            Ok(pairs) => pairs,
            Err(e) => {
                error!("failed to get eligible job pairs: {e:#}");
                return report;
            }
        };

        // Persistence order is kept within each queue
        let mut queues: IndexMap<String, Vec<JobPair>> = IndexMap::new();
        for pair in pairs {
            queues.entry(pair.queue.clone()).or_default().push(pair);
        }

        // Stop tracking users on queues with nothing pending; their credits
        // belong to the loads being forgotten
        for (queue, monitor) in &mut self.monitors {
            if !queues.contains_key(queue) && !monitor.is_empty() {
                debug!(queue, "no pending pairs; resetting monitor");
                monitor.reset();
                if let Err(e) = self.store.take_load_credits(queue).await {
                    error!(queue, "failed to clear load credits: {e:#}");
                }
            }
        }

        let mut available = true;
        for (queue, pairs) in queues {
            let capacity = match node_counts.get(&queue) {
                Some(nodes) => match self.store.count_pairs_in_queue(&queue).await {
                    Ok(enqueued) => {
                        let limit = *nodes as u64 * self.node_multiplier;
                        Some(limit.saturating_sub(enqueued))
                    }
                    Err(e) => {
                        error!(queue, "failed to count pairs in queue: {e:#}");
                        report.deferred += pairs.len();
                        continue;
                    }
                },
                None => None,
            };

            if capacity == Some(0) {
                info!(queue, "not adding more job pairs to a full queue");
                report.deferred += pairs.len();
                continue;
            }

            let loads = self
                .store
                .get_user_loads_on_queue(&queue)
                .await
                .unwrap_or_else(|e| {
                    error!(queue, "failed to get user loads: {e:#}");
                    HashMap::new()
                });

            let pending: HashMap<UserId, Load> = pairs
                .iter()
                .map(|p| (p.user_id, loads.get(&p.user_id).copied().unwrap_or(0)))
                .collect();

            let mut monitor = self
                .monitors
                .remove(&queue)
                .unwrap_or_else(|| FairShareLoadMonitor::with_threshold(self.load_threshold));

            // Pairs that finished early return the unused part of their charge
            match self.store.take_load_credits(&queue).await {
                Ok(credits) if !credits.is_empty() => {
                    debug!(queue, ?credits, "crediting user loads");
                    monitor.credit(&credits);
                }
                Ok(_) => {}
                Err(e) => error!(queue, "failed to get load credits: {e:#}"),
            }

            monitor.set_users(&pending);
            debug!(queue, %monitor, "dispatching to queue");

            let mut submitted = 0u64;
            for pair in &pairs {
                if capacity.is_some_and(|c| submitted >= c) {
                    report.deferred += 1;
                    continue;
                }

                if monitor.skip_user(pair.user_id) {
                    debug!(
                        queue,
                        user = pair.user_id,
                        pair = pair.id,
                        load = monitor.load(pair.user_id),
                        min = monitor.min(),
                        "deferring pair of user ahead of the fair share"
                    );
                    report.deferred += 1;
                    continue;
                }

                let outcome = self.submit_pair(pair, available).await;
                match outcome {
                    SubmitOutcome::Submitted(_) => {
                        submitted += 1;
                        monitor.change_load(pair.user_id, pair.limits.wallclock_timeout);
                    }
                    SubmitOutcome::Rejected => {
                        warn!(
                            backend = self.backend.name(),
                            "backend rejected a submission; deferring the remaining pairs"
                        );
                        available = false;
                    }
                    SubmitOutcome::Deferred | SubmitOutcome::Failed => {}
                }
                report.record(outcome);
            }

            self.monitors.insert(queue, monitor);
        }

        if report != DispatchReport::default() {
            info!(
                submitted = report.submitted,
                deferred = report.deferred,
                failed = report.failed,
                "dispatch pass finished"
            );
        }

        report
    }

    /// Kills a pair.
    ///
    /// The backend kill is best effort; the pair is marked as killed
    /// regardless. Returns whether the pair's status changed.
    pub async fn kill_pair(&self, pair: PairId) -> Result<bool> {
        let Some(pair) = self.store.get_pair(pair).await? else {
            bail!("job pair `{pair}` does not exist");
        };

        if pair.status.is_terminal() {
            debug!(pair = pair.id, status = %pair.status, "pair already finished");
            return Ok(false);
        }

        if let Some(id) = pair.execution_id
            && !self.backend.kill_pair(id).await
        {
            warn!(pair = pair.id, %id, "backend failed to kill pair");
        }

        self.store.set_pair_status(pair.id, PairStatus::Killed).await
    }

    /// Kills every pair held by the backend.
    ///
    /// Returns the number of pairs marked as killed.
    pub async fn kill_all(&self) -> Result<usize> {
        if !self.backend.kill_all().await {
            warn!(backend = self.backend.name(), "backend failed to kill all pairs");
        }

        let mut killed = 0;
        for pair in self.store.get_pairs_in_backend().await? {
            if self
                .store
                .set_pair_status(pair.id, PairStatus::Killed)
                .await?
            {
                killed += 1;
            }
        }

        Ok(killed)
    }

    /// Prepares and submits a single pair.
    ///
    /// When the backend is not `available`, the script is still written but
    /// the pair is left as it is.
    async fn submit_pair(&self, pair: &JobPair, available: bool) -> SubmitOutcome {
        if pair.stages.is_empty() || pair.benchmark.path.as_os_str().is_empty() {
            self.fail(pair, "job pair has no stages or no benchmark")
                .await;
            return SubmitOutcome::Failed;
        }

        let script = match self.write_script(pair) {
            Ok(script) => script,
            Err(e) => {
                self.fail(pair, &format!("{e:#}")).await;
                return SubmitOutcome::Failed;
            }
        };

        let log = self.layout.log_path(pair);
        if let Err(e) = self.prepare_output(pair, &log) {
            self.fail(pair, &format!("{e:#}")).await;
            return SubmitOutcome::Failed;
        }

        if !available {
            return SubmitOutcome::Deferred;
        }

        // Enqueue before submitting so a fast-starting pair is never seen as
        // created
        if pair.status != PairStatus::Enqueued {
            match self
                .store
                .set_pair_status(pair.id, PairStatus::Enqueued)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(pair = pair.id, "pair is no longer eligible for dispatch");
                    return SubmitOutcome::Deferred;
                }
                Err(e) => {
                    error!(pair = pair.id, "failed to enqueue pair: {e:#}");
                    return SubmitOutcome::Deferred;
                }
            }
        }

        let id = self.submit(&script, &log).await;
        if self.backend.is_error(id) {
            warn!(pair = pair.id, "submission of job pair failed; pair stays enqueued");
            return SubmitOutcome::Rejected;
        }

        // An unrecorded handle would have the pair submitted again, so the
        // backend's copy is removed
        if let Err(e) = self.store.record_execution_handle(pair.id, id).await {
            error!(
                pair = pair.id,
                %id,
                "failed to record execution handle; killing the submitted pair: {e:#}"
            );
            if !self.backend.kill_pair(id).await {
                warn!(pair = pair.id, %id, "backend failed to kill unrecorded pair");
            }
            return SubmitOutcome::Deferred;
        }

        debug!(pair = pair.id, %id, "submitted job pair");
        SubmitOutcome::Submitted(id)
    }

    /// Marks a pair as an error.
    async fn fail(&self, pair: &JobPair, reason: &str) {
        error!(pair = pair.id, reason, "job pair cannot be submitted");
        if let Err(e) = self.store.set_pair_error(pair.id, reason).await {
            error!(pair = pair.id, "failed to record job pair error: {e:#}");
        }
    }

    /// Creates the output directory of a pair and clears any stale log.
    fn prepare_output(&self, pair: &JobPair, log: &Path) -> Result<()> {
        let output = self.layout.output_directory(pair);
        fs::create_dir_all(&output).with_context(|| {
            format!(
                "failed to create directory `{path}`",
                path = output.display()
            )
        })?;

        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create directory `{path}`",
                    path = parent.display()
                )
            })?;
        }

        if log.exists() {
            debug!(pair = pair.id, "deleting old log file");
            fs::remove_file(log).with_context(|| {
                format!(
                    "failed to remove old log file `{path}`",
                    path = log.display()
                )
            })?;
        }

        Ok(())
    }

    /// Gets the placeholder values of a pair's script.
    ///
    /// Every value is escaped for use inside double quotes.
    fn script_values(&self, pair: &JobPair, script: &Path) -> Result<HashMap<&'static str, String>> {
        let Some(stage) = pair.primary_stage() else {
            bail!("job pair `{pair}` has no stages", pair = pair.id);
        };

        let limits = &pair.limits;
        let benchmark = pair.benchmark.path.display().to_string();

        let scalars = [
            ("QUEUE", pair.queue.clone()),
            ("JOBID", pair.job_id.to_string()),
            ("USERID", pair.user_id.to_string()),
            ("PAIRID", pair.id.to_string()),
            ("SOLVER_PATH", stage.solver.path.display().to_string()),
            ("SOLVER_NAME", stage.solver.name.clone()),
            ("CONFIG", stage.configuration.name.clone()),
            ("BENCH", benchmark.clone()),
            ("BENCH_PATH", benchmark),
            ("BENCH_ID", pair.benchmark.id.to_string()),
            (
                "OUT_DIR",
                self.layout.output_directory(pair).display().to_string(),
            ),
            ("SCRIPT_PATH", script.display().to_string()),
            ("MAX_RUNTIME", limits.wallclock_timeout.max(1).to_string()),
            ("MAX_CPUTIME", limits.cpu_timeout.max(1).to_string()),
            (
                "MAX_MEM",
                (limits.max_memory / BYTES_PER_MEGABYTE).to_string(),
            ),
            ("NUM_STAGES", pair.stages.len().to_string()),
        ];

        let mut values: HashMap<&'static str, String> = scalars
            .into_iter()
            .map(|(name, value)| (name, shell_escape(&value)))
            .collect();

        values.extend([
            (
                "STAGE_NUMBER_ARRAY",
                bash_array(
                    "STAGE_NUMBERS",
                    pair.stages.iter().map(|s| s.number.to_string()),
                ),
            ),
            (
                "SOLVER_NAME_ARRAY",
                bash_array("SOLVER_NAMES", pair.stages.iter().map(|s| &s.solver.name)),
            ),
            (
                "SOLVER_PATH_ARRAY",
                bash_array(
                    "SOLVER_PATHS",
                    pair.stages
                        .iter()
                        .map(|s| s.solver.path.display().to_string()),
                ),
            ),
            (
                "CONFIG_NAME_ARRAY",
                bash_array(
                    "CONFIG_NAMES",
                    pair.stages.iter().map(|s| &s.configuration.name),
                ),
            ),
        ]);

        Ok(values)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::ResourceUsage;
    use crate::test_support::MemoryStore;
    use crate::test_support::RecordingBackend;
    use crate::test_support::job;

    /// A template using every scalar placeholder.
    const TEMPLATE: &str = "#!/bin/bash\n\
        # $$QUEUE$$ $$JOBID$$ $$USERID$$ $$PAIRID$$\n\
        SOLVER=$$SOLVER_PATH$$/$$SOLVER_NAME$$/$$CONFIG$$\n\
        BENCH=$$BENCH$$ $$BENCH_PATH$$ $$BENCH_ID$$\n\
        OUT=$$OUT_DIR$$\n\
        LIMITS=$$MAX_RUNTIME$$,$$MAX_CPUTIME$$,$$MAX_MEM$$,$$NUM_STAGES$$\n\
        SELF=$$SCRIPT_PATH$$\n\
        $$SOLVER_NAME_ARRAY$$";

    struct Fixture {
        dir: tempfile::TempDir,
        backend: Arc<RecordingBackend>,
        store: Arc<MemoryStore>,
        dispatcher: JobDispatcher,
    }

    fn fixture(threshold: Load) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            script_template: dir.path().join("template"),
            script_directory: dir.path().join("scripts"),
            output_directory: dir.path().join("output"),
            log_directory: dir.path().join("logs"),
            working_directory: dir.path().to_path_buf(),
            load_threshold: threshold,
            ..Default::default()
        };

        let backend = Arc::new(RecordingBackend::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = JobDispatcher::new(
            &config,
            ScriptTemplate::new(TEMPLATE),
            backend.clone(),
            store.clone(),
        );

        Fixture {
            dir,
            backend,
            store,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn writes_executable_script() {
        let f = fixture(600);
        let job = f.store.add_job(job(12, "all.q", 1)).await.unwrap();
        let pair = &job.pairs[0];

        let path = f.dispatcher.write_script(pair).unwrap();
        assert_eq!(path, f.dir.path().join("scripts").join(format!("job_{}.bash", pair.id)));

        let script = fs::read_to_string(&path).unwrap();
        let out = f
            .dir
            .path()
            .join("output")
            .join("12")
            .join(job.id.to_string())
            .join(pair.id.to_string());
        assert_eq!(
            script,
            format!(
                "#!/bin/bash\n# all.q {job} 12 {pair}\nSOLVER=/solvers/minisat/minisat/default\n\
                 BENCH={bench} {bench} {bench_id}\nOUT={out}\nLIMITS=900,900,1024,1\n\
                 SELF={path}\nSOLVER_NAMES[0]=\"minisat\"\n",
                job = job.id,
                pair = pair.id,
                bench = pair.benchmark.path.display(),
                bench_id = pair.benchmark.id,
                out = out.display(),
                path = path.display(),
            )
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o100, 0o100);
        }
    }

    #[tokio::test]
    async fn submit_job_persists_then_submits() {
        let mut f = fixture(600);
        let (job, report) = f.dispatcher.submit_job(job(12, "all.q", 3)).await.unwrap();

        assert_eq!(report.submitted, 3);
        assert_eq!(f.backend.submitted().len(), 3);
        for pair in &job.pairs {
            let stored = f.store.get_pair(pair.id).await.unwrap().unwrap();
            assert_eq!(stored.status, PairStatus::Enqueued);
            assert!(stored.execution_id.is_some());
        }
    }

    #[tokio::test]
    async fn unavailable_backend_keeps_pairs_enqueued() {
        let mut f = fixture(600);
        f.backend.set_available(false);

        let (job, report) = f.dispatcher.submit_job(job(12, "all.q", 3)).await.unwrap();
        assert_eq!(report.submitted, 0);
        assert_eq!(report.deferred, 3);
        assert_eq!(report.failed, 0);

        // Only the first pair reached the backend
        assert_eq!(f.backend.attempts(), 1);
        let first = f.store.get_pair(job.pairs[0].id).await.unwrap().unwrap();
        assert_eq!(first.status, PairStatus::Enqueued);
        assert_eq!(first.execution_id, None);

        // The rest still have their scripts written
        for pair in &job.pairs {
            assert!(f.dispatcher.layout().script_path(pair).exists());
        }

        // All of them are retried on the next tick
        f.backend.set_available(true);
        let report = f.dispatcher.dispatch(&HashMap::new()).await;
        assert_eq!(report.submitted, 3);
    }

    #[tokio::test]
    async fn pair_without_stages_is_an_error() {
        let mut f = fixture(600);
        let mut description = job(12, "all.q", 2);
        description.pairs[1].stages.clear();
        let job = f.store.add_job(description).await.unwrap();

        let report = f.dispatcher.dispatch(&HashMap::new()).await;
        assert_eq!(report.submitted, 1);
        assert_eq!(report.failed, 1);

        let broken = f.store.get_pair(job.pairs[1].id).await.unwrap().unwrap();
        assert_eq!(broken.status, PairStatus::Error);
        assert_eq!(
            f.store.error_reason(broken.id).as_deref(),
            Some("job pair has no stages or no benchmark")
        );
    }

    #[tokio::test]
    async fn unwritable_script_is_an_error() {
        let mut f = fixture(600);
        f.store.add_job(job(12, "all.q", 1)).await.unwrap();

        // A file where the script directory should be
        fs::write(f.dir.path().join("scripts"), "").unwrap();

        let report = f.dispatcher.dispatch(&HashMap::new()).await;
        assert_eq!(report.failed, 1);
        assert!(f.backend.submitted().is_empty());
    }

    #[tokio::test]
    async fn removes_stale_log() {
        let mut f = fixture(600);
        let job = f.store.add_job(job(12, "all.q", 1)).await.unwrap();
        let log = f.dispatcher.layout().log_path(&job.pairs[0]);
        fs::create_dir_all(log.parent().unwrap()).unwrap();
        fs::write(&log, "old").unwrap();

        f.dispatcher.dispatch(&HashMap::new()).await;
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn heavy_user_is_deferred() {
        let mut f = fixture(600);
        // Each pair charges 900 seconds of wallclock to its owner
        let first = f.store.add_job(job(1, "all.q", 2)).await.unwrap();
        let second = f.store.add_job(job(2, "all.q", 2)).await.unwrap();

        let report = f.dispatcher.dispatch(&HashMap::new()).await;

        // User 1 submits once and is then 900 ahead of user 2; user 2 catches
        // up and then both are even again
        assert_eq!(report.submitted, 3);
        assert_eq!(report.deferred, 1);

        let submitted = f.backend.submitted_pairs();
        assert_eq!(
            submitted,
            [first.pairs[0].id, second.pairs[0].id, second.pairs[1].id]
        );
        let monitor = f.dispatcher.monitor("all.q").unwrap();
        assert_eq!(monitor.load(1), Some(900));
        assert_eq!(monitor.load(2), Some(1800));
    }

    #[tokio::test]
    async fn queue_capacity_is_respected() {
        let mut f = fixture(i64::MAX);
        f.store.add_job(job(1, "all.q", 5)).await.unwrap();

        // One node with a multiplier of 8, already holding 6 pairs
        f.store.set_pairs_in_queue("all.q", 6);
        let report = f
            .dispatcher
            .dispatch(&HashMap::from([("all.q".to_string(), 1)]))
            .await;
        assert_eq!(report.submitted, 2);
        assert_eq!(report.deferred, 3);
    }

    #[tokio::test]
    async fn monitors_reset_when_nothing_is_pending() {
        let mut f = fixture(600);
        f.store.add_job(job(1, "all.q", 1)).await.unwrap();
        f.dispatcher.dispatch(&HashMap::new()).await;
        assert!(!f.dispatcher.monitor("all.q").unwrap().is_empty());

        let report = f.dispatcher.dispatch(&HashMap::new()).await;
        assert_eq!(report, DispatchReport::default());
        assert!(f.dispatcher.monitor("all.q").unwrap().is_empty());
    }

    #[tokio::test]
    async fn killed_pair_stays_killed() {
        let mut f = fixture(600);
        let (job, _) = f.dispatcher.submit_job(job(1, "all.q", 1)).await.unwrap();
        let pair = job.pairs[0].id;

        assert!(f.dispatcher.kill_pair(pair).await.unwrap());
        assert_eq!(f.backend.killed().len(), 1);

        let stored = f.store.get_pair(pair).await.unwrap().unwrap();
        assert_eq!(stored.status, PairStatus::Killed);

        // Nothing moves a killed pair again
        assert!(!f.dispatcher.kill_pair(pair).await.unwrap());
        assert!(
            !f.store
                .set_pair_status(pair, PairStatus::Running)
                .await
                .unwrap()
        );
        assert_eq!(f.dispatcher.dispatch(&HashMap::new()).await.submitted, 0);
    }

    #[tokio::test]
    async fn kill_is_local_even_if_backend_fails() {
        let mut f = fixture(600);
        let (job, _) = f.dispatcher.submit_job(job(1, "all.q", 2)).await.unwrap();
        f.backend.set_available(false);

        assert!(f.dispatcher.kill_pair(job.pairs[0].id).await.unwrap());
        assert_eq!(f.dispatcher.kill_all().await.unwrap(), 1);
        for pair in &job.pairs {
            let stored = f.store.get_pair(pair.id).await.unwrap().unwrap();
            assert_eq!(stored.status, PairStatus::Killed);
        }
    }

    #[tokio::test]
    async fn script_values_are_escaped() {
        let f = fixture(600);
        let mut description = job(12, "all.q", 1);
        description.pairs[0].benchmark.path = PathBuf::from("/b/$(touch pwned) \"q\" `id`.cnf");
        description.pairs[0].stages[0].configuration.name = String::from("fast;$HOME");
        let job = f.store.add_job(description).await.unwrap();

        let path = f.dispatcher.write_script(&job.pairs[0]).unwrap();
        let script = fs::read_to_string(path).unwrap();
        assert!(script.contains("BENCH=/b/\\$(touch pwned) \\\"q\\\" \\`id\\`.cnf "));
        assert!(script.contains("SOLVER=/solvers/minisat/minisat/fast;\\$HOME\n"));
    }

    #[tokio::test]
    async fn unrecorded_handle_is_killed_and_retried() {
        let mut f = fixture(600);
        let job = f.store.add_job(job(12, "all.q", 1)).await.unwrap();
        let pair = job.pairs[0].id;

        f.store.set_fail_handle_recording(true);
        let report = f.dispatcher.dispatch(&HashMap::new()).await;
        assert_eq!(
            report,
            DispatchReport {
                submitted: 0,
                deferred: 1,
                failed: 0,
            }
        );
        assert_eq!(f.backend.killed(), [ExecutionId::new(1000)]);

        let stored = f.store.get_pair(pair).await.unwrap().unwrap();
        assert_eq!(stored.status, PairStatus::Enqueued);
        assert_eq!(stored.execution_id, None);

        f.store.set_fail_handle_recording(false);
        assert_eq!(f.dispatcher.dispatch(&HashMap::new()).await.submitted, 1);
        assert_eq!(
            f.store.get_pair(pair).await.unwrap().unwrap().execution_id,
            Some(ExecutionId::new(1001))
        );
    }

    #[tokio::test]
    async fn finished_pairs_credit_their_owner() {
        let mut f = fixture(600);
        let first = f.store.add_job(job(1, "all.q", 2)).await.unwrap();
        let second = f.store.add_job(job(2, "all.q", 2)).await.unwrap();

        // User 1 is deferred once; both users end up charged 900 per pair
        f.dispatcher.dispatch(&HashMap::new()).await;
        assert_eq!(f.dispatcher.monitor("all.q").unwrap().load(2), Some(1800));

        // User 2's pairs finish within a second, returning all but 1 of each charge
        for pair in &second.pairs {
            let usage = ResourceUsage {
                wallclock_ms: 300,
                ..Default::default()
            };
            assert!(f.store.finish_pair(pair.id, Some(usage)).await.unwrap());
        }
        let third = f.store.add_job(job(2, "all.q", 1)).await.unwrap();

        // User 2 is now 898 below user 1, who stays deferred
        let report = f.dispatcher.dispatch(&HashMap::new()).await;
        assert_eq!(report.submitted, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(f.backend.submitted_pairs().last(), Some(&third.pairs[0].id));

        let monitor = f.dispatcher.monitor("all.q").unwrap();
        assert_eq!(monitor.load(1), Some(900));
        assert_eq!(monitor.load(2), Some(902));

        let deferred = f.store.get_pair(first.pairs[1].id).await.unwrap().unwrap();
        assert_eq!(deferred.status, PairStatus::Created);
        assert!(f.store.take_load_credits("all.q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn killing_unknown_pair_is_an_error() {
        let f = fixture(600);
        assert!(f.dispatcher.kill_pair(404).await.is_err());
    }
}
