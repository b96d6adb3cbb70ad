//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted execution collaborators and evaluation stages
//! - An in-memory isolation backend that counts every call
//! - A harness wiring them into an orchestrator

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use conductor::core::{Task, TaskDescriptor, TaskId};
use conductor::evaluation::{Cascade, Stage, StageInput, StageReport};
use conductor::git::GitOps;
use conductor::isolation::{Isolation, IsolationManager, Workspace};
use conductor::merge::MergePolicy;
use conductor::notify::{ChannelNotifier, EventKind, TaskEvent};
use conductor::orchestration::{
    ExecutionOutput, ExecutionRequest, Executor, Orchestrator, SlotContext,
};
use conductor::scoring::ScoreWeights;
use conductor::state::{SharedStore, TaskStore, WorkspaceRegistry};
use conductor::{ControlHandle, Error, Result, RunSummary};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        let repo = Self { temp_dir, path };
        repo.git(&["init"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);

        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo
    }

    fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Get the current branch name.
    pub fn current_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", name)])
            .current_dir(&self.path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Create a branch at HEAD without checking it out.
    pub fn create_branch(&self, name: &str) {
        self.git(&["branch", name]);
    }

    /// Contents of `file` on `branch`.
    pub fn show(&self, branch: &str, file: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{}:{}", branch, file)])
            .current_dir(&self.path)
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }
}

pub fn id(s: &str) -> TaskId {
    TaskId::parse(s).unwrap()
}

/// What a scripted execution does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return after the delay, reporting completion.
    Complete,
    /// Return after the delay without reporting completion.
    Incomplete,
    /// Return an execution error.
    Fail(String),
    /// Panic inside the execution.
    Panic,
    /// Never return on its own.
    Hang,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: TaskId,
    pub attempt: u32,
    pub feedback: Option<String>,
}

struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Executor that follows a per-task script. Unscripted tasks complete.
pub struct ScriptedExecutor {
    delay: Duration,
    raw_output: String,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            raw_output: "done".to_string(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, task: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), steps.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.task_id.as_str() == task)
            .collect()
    }

    /// Highest number of executions in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput> {
        let task = request.task.id.to_string();
        self.calls.lock().unwrap().push(Call {
            task_id: request.task.id.clone(),
            attempt: request.attempt,
            feedback: request.feedback.map(String::from),
        });
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&task)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Complete);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = Active(&self.active);

        let wait = match step {
            Step::Hang => Duration::from_secs(3600),
            _ => self.delay,
        };
        tokio::time::sleep(wait).await;

        let output = |complete: bool| ExecutionOutput {
            patch_ref: format!("patch-{}-{}", task, request.attempt),
            self_reported_complete: complete,
            raw_output: self.raw_output.clone(),
        };
        match step {
            Step::Complete => Ok(output(true)),
            Step::Incomplete => Ok(output(false)),
            Step::Fail(message) => Err(Error::Execution(message)),
            Step::Panic => panic!("scripted executor crash"),
            Step::Hang => Err(Error::Execution("hung execution returned".into())),
        }
    }
}

/// Stage that passes with a fixed signal unless told to fail a task.
pub struct ScriptedStage {
    name: String,
    signal: f64,
    delay: Duration,
    failures: Mutex<HashMap<String, u32>>,
    runs: AtomicUsize,
}

impl ScriptedStage {
    pub fn new(name: &str, signal: f64) -> Self {
        Self {
            name: name.to_string(),
            signal,
            delay: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `times` runs for `task`.
    pub fn fail_times(&self, task: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(task.to_string(), times);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: StageInput<'_>) -> Result<StageReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(input.task.id.as_str()) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            Ok(StageReport::fail(format!("{} rejected the patch", self.name)))
        } else {
            Ok(StageReport::pass().with_signal(self.signal))
        }
    }
}

/// In-memory isolation backend that counts every call.
#[derive(Default)]
pub struct CountingIsolation {
    created: Mutex<HashMap<String, usize>>,
    destroyed: Mutex<HashMap<String, usize>>,
    kept: Mutex<Vec<String>>,
    integrated: Mutex<Vec<String>>,
    refuse_create: Mutex<HashSet<String>>,
    crash_create: Mutex<HashSet<String>>,
    conflicts: Mutex<HashSet<String>>,
}

impl CountingIsolation {
    pub fn creates(&self, task: &str) -> usize {
        self.created.lock().unwrap().get(task).copied().unwrap_or(0)
    }

    pub fn destroys(&self, task: &str) -> usize {
        self.destroyed.lock().unwrap().get(task).copied().unwrap_or(0)
    }

    /// Tasks whose branch was kept on disposal.
    pub fn kept_branches(&self) -> Vec<String> {
        self.kept.lock().unwrap().clone()
    }

    pub fn integrated(&self) -> Vec<String> {
        self.integrated.lock().unwrap().clone()
    }

    pub fn refuse_create(&self, task: &str) {
        self.refuse_create.lock().unwrap().insert(task.to_string());
    }

    /// Panic inside `create` for `task`.
    pub fn crash_create(&self, task: &str) {
        self.crash_create.lock().unwrap().insert(task.to_string());
    }

    pub fn conflict_on(&self, task: &str) {
        self.conflicts.lock().unwrap().insert(task.to_string());
    }
}

impl Isolation for CountingIsolation {
    fn create(&self, workspace: &Workspace) -> Result<Option<String>> {
        let task = workspace.task_id.to_string();
        if self.refuse_create.lock().unwrap().contains(&task) {
            return Err(Error::Validation("repository is locked".into()));
        }
        if self.crash_create.lock().unwrap().contains(&task) {
            panic!("provider crashed mid-create");
        }
        *self.created.lock().unwrap().entry(task).or_default() += 1;
        Ok(Some("base".into()))
    }

    fn destroy(&self, workspace: &Workspace, keep_branch: bool) -> Result<()> {
        let task = workspace.task_id.to_string();
        if keep_branch {
            self.kept.lock().unwrap().push(task.clone());
        }
        *self.destroyed.lock().unwrap().entry(task).or_default() += 1;
        Ok(())
    }

    fn integrate(&self, workspace: &Workspace, _target: &str) -> Result<String> {
        let task = workspace.task_id.to_string();
        if self.conflicts.lock().unwrap().contains(&task) {
            return Err(Error::Integration {
                task: workspace.task_id.clone(),
                reason: "merge conflict in src/lib.rs".into(),
            });
        }
        self.integrated.lock().unwrap().push(task.clone());
        Ok(format!("merge-{}", task))
    }

    fn change_size(&self, _workspace: &Workspace, _patch_ref: &str) -> Result<usize> {
        Ok(10)
    }
}

/// Knobs for [`Harness::new`].
#[derive(Debug, Clone)]
pub struct Options {
    pub concurrency: usize,
    pub exec_delay: Duration,
    pub stages: Vec<&'static str>,
    pub stage_delay: Duration,
    pub signal: f64,
    pub threshold: f64,
    pub weights: ScoreWeights,
    pub task_timeout: Duration,
    pub stage_timeout: Duration,
    pub max_debug_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            concurrency: 2,
            exec_delay: Duration::from_millis(20),
            stages: vec!["checks"],
            stage_delay: Duration::ZERO,
            signal: 1.0,
            threshold: 0.85,
            // Score equals the stage signal.
            weights: ScoreWeights {
                acceptance: 1.0,
                review: 0.0,
                complexity: 0.0,
            },
            task_timeout: Duration::from_secs(10),
            stage_timeout: Duration::from_secs(10),
            max_debug_retries: 0,
        }
    }
}

/// Orchestrator wired to scripted collaborators.
pub struct Harness {
    pub store: SharedStore,
    pub isolation: Arc<IsolationManager>,
    pub provider: Arc<CountingIsolation>,
    pub executor: Arc<ScriptedExecutor>,
    pub stages: Vec<Arc<ScriptedStage>>,
    pub events: mpsc::UnboundedReceiver<TaskEvent>,
    pub control: ControlHandle,
    orchestrator: Option<Orchestrator>,
}

impl Harness {
    pub fn new(options: Options, tasks: Vec<TaskDescriptor>) -> Self {
        let mut store = TaskStore::in_memory();
        store.add_batch(tasks).expect("valid task batch");
        Self::with_store(options, store, WorkspaceRegistry::in_memory())
    }

    pub fn with_store(options: Options, store: TaskStore, registry: WorkspaceRegistry) -> Self {
        let store: SharedStore = Arc::new(RwLock::new(store));
        let provider = Arc::new(CountingIsolation::default());
        let isolation = Arc::new(IsolationManager::new(
            provider.clone(),
            registry,
            std::path::Path::new("/tmp/conductor-integration"),
            "conductor/task/",
            "main",
        ));
        let executor = Arc::new(ScriptedExecutor::new(options.exec_delay));

        let mut cascade = Cascade::new(options.stage_timeout);
        let stages: Vec<Arc<ScriptedStage>> = options
            .stages
            .iter()
            .map(|name| Arc::new(ScriptedStage::new(name, options.signal).with_delay(options.stage_delay)))
            .collect();
        for stage in &stages {
            cascade.push(stage.clone());
        }

        let ctx = SlotContext {
            executor: executor.clone(),
            cascade,
            isolation: isolation.clone(),
            weights: options.weights,
            policy: MergePolicy {
                threshold: options.threshold,
            },
            task_timeout: options.task_timeout,
            max_debug_retries: options.max_debug_retries,
            complexity_budget_lines: 400,
        };

        let (notifier, events) = ChannelNotifier::new();
        let orchestrator = Orchestrator::new(store.clone(), ctx, options.concurrency, Arc::new(notifier))
            .expect("valid concurrency");
        let control = orchestrator.control();

        Self {
            store,
            isolation,
            provider,
            executor,
            stages,
            events,
            control,
            orchestrator: Some(orchestrator),
        }
    }

    pub fn stage(&self, name: &str) -> Arc<ScriptedStage> {
        self.stages
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .expect("stage exists")
    }

    /// Run to completion in place.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.orchestrator
            .as_mut()
            .expect("orchestrator already spawned")
            .run()
            .await
    }

    /// Run on a separate task so the test can drive the control handle.
    pub fn spawn(&mut self) -> JoinHandle<Result<RunSummary>> {
        let mut orchestrator = self.orchestrator.take().expect("orchestrator already spawned");
        tokio::spawn(async move { orchestrator.run().await })
    }

    pub fn peak_concurrency(&self) -> Option<usize> {
        self.orchestrator.as_ref().map(Orchestrator::peak_concurrency)
    }

    pub async fn task(&self, name: &str) -> Task {
        self.store
            .read()
            .await
            .get(&id(name))
            .cloned()
            .expect("task exists")
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait until `count` tasks have started.
    pub async fn wait_for_starts(&mut self, count: usize) -> Vec<TaskEvent> {
        let mut started = Vec::new();
        while started.len() < count {
            let event = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .expect("timed out waiting for task start")
                .expect("event channel closed");
            if event.kind == EventKind::TaskStarted {
                started.push(event);
            }
        }
        started
    }
}

pub fn task(name: &str) -> TaskDescriptor {
    TaskDescriptor::new(name, &format!("implement {}", name))
}

/// Executor that writes `<task>.txt` into the workspace and commits it.
pub struct FileWritingExecutor {
    /// Per-task file name override, to provoke conflicts.
    pub files: HashMap<String, String>,
    /// Pause before writing, so parallel tasks overlap.
    pub delay: Duration,
}

#[async_trait]
impl Executor for FileWritingExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput> {
        tokio::time::sleep(self.delay).await;
        let task = request.task.id.to_string();
        let file = self
            .files
            .get(&task)
            .cloned()
            .unwrap_or_else(|| format!("{}.txt", task));
        let path = request.workspace.path.clone();
        std::fs::write(path.join(&file), format!("written by {}\n", task))?;

        let message = format!("{}: {}", task, request.task.description);
        let patch_ref = tokio::task::spawn_blocking(move || GitOps::new(&path)?.commit_all(&path, &message))
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))??;
        Ok(ExecutionOutput {
            patch_ref,
            self_reported_complete: true,
            raw_output: "CONFIDENCE: 0.95".into(),
        })
    }
}
