//! Fakes shared by the unit tests.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::ExecutionBackend;
use crate::ExecutionId;
use crate::JobId;
use crate::PairId;
use crate::ProcessorId;
use crate::UserId;
use crate::backend::CommandRunner;
use crate::backend::CommandSpec;
use crate::backend::command::CommandError;
use crate::monitor::Load;
use crate::post::PostProcessor;
use crate::store::Benchmark;
use crate::store::Configuration;
use crate::store::Job;
use crate::store::JobPair;
use crate::store::JobStatus;
use crate::store::PairStatus;
use crate::store::PairStore;
use crate::store::PostProcessingItem;
use crate::store::Processor;
use crate::store::ResourceLimits;
use crate::store::ResourceUsage;
use crate::store::Solver;
use crate::store::Stage;

/// Gets a single-stage pair running `minisat` on a benchmark.
pub fn pair(id: PairId, job_id: JobId, user_id: UserId) -> JobPair {
    JobPair {
        id,
        job_id,
        user_id,
        queue: "all.q".to_string(),
        limits: ResourceLimits::default(),
        post_processor: None,
        benchmark: Benchmark {
            id,
            name: format!("bench{id}"),
            path: PathBuf::from(format!("/bench/{id}.cnf")),
        },
        stages: vec![Stage {
            number: 1,
            solver: Solver {
                id: 1,
                name: "minisat".to_string(),
                path: PathBuf::from("/solvers/minisat"),
            },
            configuration: Configuration {
                id: 1,
                name: "default".to_string(),
            },
        }],
        status: PairStatus::Created,
        execution_id: None,
        usage: None,
    }
}

/// Gets an unstored job of `count` pairs.
pub fn job(user_id: UserId, queue: &str, count: usize) -> Job {
    Job {
        id: 0,
        user_id,
        name: format!("job-of-{user_id}"),
        queue: queue.to_string(),
        limits: ResourceLimits::default(),
        pre_processor: None,
        post_processor: None,
        pairs: (1..=count as i64)
            .map(|i| {
                let mut pair = pair(0, 0, user_id);
                pair.benchmark.id = i;
                pair.benchmark.name = format!("bench{i}");
                pair.benchmark.path = PathBuf::from(format!("/bench/{queue}/{i}.cnf"));
                pair
            })
            .collect(),
        status: JobStatus::Pending,
    }
}

/// A command runner replaying canned output.
///
/// Commands are matched by the longest registered prefix of their display
/// form. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    /// Registered responses by prefix.
    responses: Mutex<Vec<(String, Result<String, String>)>>,
    /// Every command run so far.
    specs: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    /// Constructs an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Responds to commands starting with `prefix` with `stdout`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.responses
            .lock()
            .push((prefix.to_string(), Ok(stdout.to_string())));
    }

    /// Fails commands starting with `prefix` with `stderr`.
    pub fn fail(&self, prefix: &str, stderr: &str) {
        self.responses
            .lock()
            .push((prefix.to_string(), Err(stderr.to_string())));
    }

    /// Gets the display form of every command run so far.
    pub fn invocations(&self) -> Vec<String> {
        self.specs.lock().iter().map(ToString::to_string).collect()
    }

    /// Gets every command run so far.
    pub fn specs(&self) -> Vec<CommandSpec> {
        self.specs.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        let line = spec.to_string();
        self.specs.lock().push(spec.clone());

        let responses = self.responses.lock();
        let response = responses
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, response)| response.clone());

        match response {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(stderr)) => Err(CommandError::Failed {
                program: spec.program().to_string(),
                status: "exit status: 1".to_string(),
                stderr,
            }),
            None => Ok(String::new()),
        }
    }
}

/// The state of a [`RecordingBackend`].
#[derive(Debug)]
struct Recording {
    /// Whether the backend accepts calls.
    available: bool,
    /// The next execution id.
    next_id: i64,
    /// The number of submission attempts.
    attempts: usize,
    /// The accepted scripts, in order.
    submitted: Vec<PathBuf>,
    /// The killed execution ids.
    killed: Vec<ExecutionId>,
    /// The execution ids the backend reports as active.
    active: BTreeSet<ExecutionId>,
    /// The queues.
    queues: Vec<String>,
    /// The queue of each node.
    associations: HashMap<String, String>,
    /// The number of shutdowns.
    shutdowns: usize,
}

/// A backend that records what it is asked to do.
#[derive(Debug)]
pub struct RecordingBackend {
    /// The recorded state.
    state: Mutex<Recording>,
}

impl RecordingBackend {
    /// Constructs an available backend with a single empty `all.q` queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Recording {
                available: true,
                next_id: 1000,
                attempts: 0,
                submitted: Vec::new(),
                killed: Vec::new(),
                active: BTreeSet::new(),
                queues: vec!["all.q".to_string()],
                associations: HashMap::new(),
                shutdowns: 0,
            }),
        }
    }

    /// Sets whether the backend accepts calls.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Sets the node to queue associations; the queues become the associated
    /// ones.
    pub fn set_topology<'a>(&self, associations: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut state = self.state.lock();
        state.associations = associations
            .into_iter()
            .map(|(n, q)| (n.to_string(), q.to_string()))
            .collect();
        let queues: BTreeSet<_> = state.associations.values().cloned().collect();
        state.queues = queues.into_iter().collect();
    }

    /// Sets the queues.
    pub fn set_queues<'a>(&self, queues: impl IntoIterator<Item = &'a str>) {
        self.state.lock().queues = queues.into_iter().map(str::to_string).collect();
    }

    /// Forgets an execution, as if it was removed behind the backend's back.
    pub fn forget(&self, id: ExecutionId) {
        self.state.lock().active.remove(&id);
    }

    /// Gets the number of submission attempts.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Gets the accepted scripts.
    pub fn submitted(&self) -> Vec<PathBuf> {
        self.state.lock().submitted.clone()
    }

    /// Gets the pairs of the accepted scripts.
    pub fn submitted_pairs(&self) -> Vec<PairId> {
        self.submitted()
            .iter()
            .filter_map(|script| {
                script
                    .file_stem()?
                    .to_str()?
                    .strip_prefix("job_")?
                    .parse()
                    .ok()
            })
            .collect()
    }

    /// Gets the killed execution ids.
    pub fn killed(&self) -> Vec<ExecutionId> {
        self.state.lock().killed.clone()
    }

    /// Gets the number of times the backend was shut down.
    pub fn shutdowns(&self) -> usize {
        self.state.lock().shutdowns
    }

    /// Fails if the backend is unavailable.
    fn check(&self) -> Result<()> {
        if !self.state.lock().available {
            bail!("backend is unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn initialize(&self, _: Option<&Path>) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {
        self.state.lock().shutdowns += 1;
    }

    async fn submit_script(&self, script: &Path, _: &Path, _: &Path) -> ExecutionId {
        let mut state = self.state.lock();
        state.attempts += 1;
        if !state.available {
            return ExecutionId::SUBMIT_FAILED;
        }

        let id = ExecutionId::new(state.next_id);
        state.next_id += 1;
        state.submitted.push(script.to_path_buf());
        state.active.insert(id);
        id
    }

    async fn kill_pair(&self, id: ExecutionId) -> bool {
        let mut state = self.state.lock();
        if !state.available {
            return false;
        }

        state.active.remove(&id);
        state.killed.push(id);
        true
    }

    async fn kill_all(&self) -> bool {
        let mut state = self.state.lock();
        if !state.available {
            return false;
        }

        let active = std::mem::take(&mut state.active);
        state.killed.extend(active);
        true
    }

    async fn worker_nodes(&self) -> Result<Vec<String>> {
        self.check()?;
        let mut nodes: Vec<_> = self.state.lock().associations.keys().cloned().collect();
        nodes.sort();
        Ok(nodes)
    }

    async fn queues(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.state.lock().queues.clone())
    }

    async fn node_queue_associations(&self) -> Result<HashMap<String, String>> {
        self.check()?;
        Ok(self.state.lock().associations.clone())
    }

    async fn move_node(&self, _: &str, _: &str) -> bool {
        false
    }

    async fn create_queue_with_slots(
        &self,
        _: &str,
        _: &[String],
        _: &[Option<String>],
        _: i64,
    ) -> bool {
        false
    }

    async fn delete_queue(&self, _: &str) -> bool {
        false
    }

    async fn active_execution_ids(&self) -> Result<HashSet<ExecutionId>> {
        self.check()?;
        Ok(self.state.lock().active.iter().copied().collect())
    }

    async fn clear_node_error_states(&self) -> bool {
        self.state.lock().available
    }

    async fn running_jobs_status(&self) -> Result<String> {
        self.check()?;
        Ok(String::new())
    }
}

/// A post processor reporting the same attributes for every item.
#[derive(Debug, Default)]
pub struct StaticProcessor;

#[async_trait]
impl PostProcessor for StaticProcessor {
    async fn process(&self, _: &PostProcessingItem) -> Result<IndexMap<String, String>> {
        Ok(IndexMap::from([("result".to_string(), "SAT".to_string())]))
    }
}

/// The state of a [`MemoryStore`].
#[derive(Debug, Default)]
struct Memory {
    /// The last assigned job id.
    last_job: JobId,
    /// The last assigned pair id.
    last_pair: PairId,
    /// The last assigned processor id.
    last_processor: ProcessorId,
    /// The pairs, in insertion order.
    pairs: IndexMap<PairId, JobPair>,
    /// The processors.
    processors: HashMap<ProcessorId, Processor>,
    /// The error reasons of pairs.
    errors: HashMap<PairId, String>,
    /// The stages awaiting post-processing.
    awaiting: Vec<PostProcessingItem>,
    /// The attributes of pair stages.
    attributes: HashMap<(PairId, i64), IndexMap<String, String>>,
    /// Overrides of the pair count of queues.
    queue_counts: HashMap<String, u64>,
    /// The stored jobs, without their pairs.
    jobs: HashMap<JobId, Job>,
    /// The pairs reported finished.
    finished: HashSet<PairId>,
    /// The pending load credits by queue and user.
    credits: HashMap<(String, UserId), Load>,
    /// Whether recording execution handles fails.
    fail_handles: bool,
}

impl Memory {
    /// Gets a pair or fails.
    fn pair_mut(&mut self, pair: PairId) -> Result<&mut JobPair> {
        self.pairs
            .get_mut(&pair)
            .ok_or_else(|| anyhow!("job pair `{pair}` does not exist"))
    }

    /// Iterates over the pairs held by the backend.
    fn in_backend(&self) -> impl Iterator<Item = &JobPair> {
        self.pairs.values().filter(|p| {
            matches!(p.status, PairStatus::Enqueued | PairStatus::Running)
                && p.execution_id.is_some()
                && !self.finished.contains(&p.id)
        })
    }
}

/// An in-memory pair store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// The stored state.
    state: Mutex<Memory>,
}

impl MemoryStore {
    /// Constructs an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the recorded error reason of a pair.
    pub fn error_reason(&self, pair: PairId) -> Option<String> {
        self.state.lock().errors.get(&pair).cloned()
    }

    /// Gets the attributes of a pair stage.
    pub fn attributes(&self, pair: PairId, stage: i64) -> IndexMap<String, String> {
        self.state
            .lock()
            .attributes
            .get(&(pair, stage))
            .cloned()
            .unwrap_or_default()
    }

    /// Sets whether recording execution handles fails.
    pub fn set_fail_handle_recording(&self, fail: bool) {
        self.state.lock().fail_handles = fail;
    }

    /// Overrides the number of pairs reported for a queue.
    pub fn set_pairs_in_queue(&self, queue: &str, count: u64) {
        self.state
            .lock()
            .queue_counts
            .insert(queue.to_string(), count);
    }
}

#[async_trait]
impl PairStore for MemoryStore {
    async fn add_job(&self, mut job: Job) -> Result<Job> {
        let mut state = self.state.lock();
        state.last_job += 1;
        job.id = state.last_job;

        for pair in &mut job.pairs {
            state.last_pair += 1;
            pair.id = state.last_pair;
            pair.job_id = job.id;
            pair.user_id = job.user_id;
            pair.queue = job.queue.clone();
            pair.limits = job.limits;
            pair.post_processor = job.post_processor;
            pair.status = PairStatus::Created;
            pair.execution_id = None;
            for (i, stage) in pair.stages.iter_mut().enumerate() {
                stage.number = i as i64 + 1;
            }
            state.pairs.insert(pair.id, pair.clone());
        }

        job.refresh_status();
        state.jobs.insert(
            job.id,
            Job {
                pairs: Vec::new(),
                ..job.clone()
            },
        );
        Ok(job)
    }

    async fn get_eligible_pairs_for_dispatch(&self) -> Result<Vec<JobPair>> {
        Ok(self
            .state
            .lock()
            .pairs
            .values()
            .filter(|p| {
                p.status == PairStatus::Created
                    || (p.status == PairStatus::Enqueued && p.execution_id.is_none())
            })
            .cloned()
            .collect())
    }

    async fn record_execution_handle(&self, pair: PairId, handle: ExecutionId) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_handles {
            bail!("database is locked");
        }

        state.pair_mut(pair)?.execution_id = Some(handle);
        Ok(())
    }

    async fn set_pair_status(&self, pair: PairId, status: PairStatus) -> Result<bool> {
        let mut state = self.state.lock();
        let pair = state.pair_mut(pair)?;
        if !pair.status.can_transition_to(status) {
            return Ok(false);
        }

        pair.status = status;
        Ok(true)
    }

    async fn get_pairs_awaiting_post_processing(&self) -> Result<Vec<PostProcessingItem>> {
        Ok(self.state.lock().awaiting.clone())
    }

    async fn mark_post_processed(&self, pair: PairId, stage: i64) -> Result<()> {
        self.state
            .lock()
            .awaiting
            .retain(|item| (item.pair_id, item.stage) != (pair, stage));
        Ok(())
    }

    async fn get_pair(&self, pair: PairId) -> Result<Option<JobPair>> {
        Ok(self.state.lock().pairs.get(&pair).cloned())
    }

    async fn get_job(&self, job: JobId) -> Result<Option<Job>> {
        let state = self.state.lock();
        let Some(stored) = state.jobs.get(&job) else {
            return Ok(None);
        };

        let mut job = stored.clone();
        job.pairs = state
            .pairs
            .values()
            .filter(|p| p.job_id == job.id)
            .cloned()
            .collect();
        job.refresh_status();
        Ok(Some(job))
    }

    async fn add_processor(&self, mut processor: Processor) -> Result<Processor> {
        let mut state = self.state.lock();
        state.last_processor += 1;
        processor.id = state.last_processor;
        state.processors.insert(processor.id, processor.clone());
        Ok(processor)
    }

    async fn get_processor(&self, processor: ProcessorId) -> Result<Option<Processor>> {
        Ok(self.state.lock().processors.get(&processor).cloned())
    }

    async fn get_pairs_in_backend(&self) -> Result<Vec<JobPair>> {
        Ok(self.state.lock().in_backend().cloned().collect())
    }

    async fn get_user_loads_on_queue(&self, queue: &str) -> Result<HashMap<UserId, Load>> {
        let state = self.state.lock();
        let mut loads = HashMap::new();
        for pair in state.in_backend().filter(|p| p.queue == queue) {
            *loads.entry(pair.user_id).or_default() += pair.limits.wallclock_timeout;
        }
        Ok(loads)
    }

    async fn count_pairs_in_queue(&self, queue: &str) -> Result<u64> {
        let state = self.state.lock();
        if let Some(count) = state.queue_counts.get(queue) {
            return Ok(*count);
        }

        Ok(state.in_backend().filter(|p| p.queue == queue).count() as u64)
    }

    async fn set_pair_error(&self, pair: PairId, reason: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let stored = state.pair_mut(pair)?;
        if stored.status.is_terminal() {
            return Ok(false);
        }

        stored.status = PairStatus::Error;
        state.errors.insert(pair, reason.to_string());
        Ok(true)
    }

    async fn add_pair_attributes(
        &self,
        pair: PairId,
        stage: i64,
        attributes: &IndexMap<String, String>,
    ) -> Result<()> {
        self.state
            .lock()
            .attributes
            .entry((pair, stage))
            .or_default()
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn complete_stage(&self, pair: PairId, stage: i64) -> Result<()> {
        let mut state = self.state.lock();
        let Some(processor_id) = state.pair_mut(pair)?.post_processor else {
            return Ok(());
        };

        let item = PostProcessingItem {
            pair_id: pair,
            stage,
            processor_id,
        };
        if !state.awaiting.contains(&item) {
            state.awaiting.push(item);
        }
        Ok(())
    }

    async fn finish_pair(&self, pair: PairId, usage: Option<ResourceUsage>) -> Result<bool> {
        let mut state = self.state.lock();
        let stored = state.pair_mut(pair)?;
        let (queue, user) = (stored.queue.clone(), stored.user_id);
        let credit = usage.map(|usage| stored.limits.unused_wallclock(&usage));
        if !state.finished.insert(pair) {
            return Ok(false);
        }

        state.pair_mut(pair)?.usage = usage;
        if let Some(credit) = credit {
            *state.credits.entry((queue, user)).or_default() += credit;
        }
        Ok(true)
    }

    async fn take_load_credits(&self, queue: &str) -> Result<HashMap<UserId, Load>> {
        let mut state = self.state.lock();
        let mut taken = HashMap::new();
        state.credits.retain(|(q, user), credit| {
            if q == queue {
                taken.insert(*user, *credit);
                false
            } else {
                true
            }
        });
        Ok(taken)
    }
}
