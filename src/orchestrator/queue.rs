//! Build admission controller.
//!
//! At most `max_concurrent` build/deploy jobs run at once; everything else
//! waits in a FIFO queue. A project never has more than one job queued or
//! running. When a running job reaches a terminal state its slot is released
//! and the queue is drained in the same critical section, so a free slot is
//! never left idle while jobs are waiting.
//!
//! Each running job is owned by a monitor task that forwards output to the
//! hub, races the process exit against the job timeout and cancellation,
//! then resolves the submitter's [`JobTicket`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::commands::CommandResolver;
use super::events::{HubMessage, channels};
use super::hub::EventHub;
use super::models::{BuildJob, BuildOptions, CommandSpec, JobState, ProcessKind, Project, ProjectId};
use super::process::{OutputLine, Supervised, spawn_supervised};
use super::progress::{ExtractorRegistry, ProgressExtractor, detect_tool};
use crate::errors::OrchestratorError;

/// Result a job's future resolves with. On success the job record is
/// returned in its final (`completed`) state.
pub type JobOutcome = Result<BuildJob, OrchestratorError>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub job_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on cancel or timeout.
    pub kill_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            job_timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was running; its process has been asked to terminate.
    Signalled,
    /// The job was queued and has been removed without spawning anything.
    Dequeued,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub active_count: usize,
    pub queue_length: usize,
    pub max_concurrent: usize,
    pub active: Vec<BuildJob>,
    pub queued: Vec<BuildJob>,
}

/// Handle returned by [`BuildQueue::submit`].
#[derive(Debug)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub project_id: ProjectId,
    pub kind: ProcessKind,
    /// 1-based queue position at submission, `None` if the job started
    /// immediately.
    pub queue_position: Option<usize>,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn started_immediately(&self) -> bool {
        self.queue_position.is_none()
    }

    /// Wait for the job to reach a terminal state.
    pub async fn wait(self) -> JobOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(OrchestratorError::Other(anyhow!(
                "{} job for project {} was dropped without an outcome",
                self.kind,
                self.project_id
            ))),
        }
    }
}

struct PendingJob {
    job: BuildJob,
    cwd: PathBuf,
    spec: CommandSpec,
    extractor: Arc<dyn ProgressExtractor>,
    done: oneshot::Sender<JobOutcome>,
}

struct ActiveJob {
    job: BuildJob,
    cancel: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct QueueState {
    active: HashMap<ProjectId, ActiveJob>,
    queued: VecDeque<PendingJob>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Timeout,
    Cancelled,
}

struct Inner {
    config: QueueConfig,
    hub: Arc<EventHub>,
    resolver: Arc<dyn CommandResolver>,
    extractors: ExtractorRegistry,
    state: Mutex<QueueState>,
    idle: Notify,
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct BuildQueue {
    inner: Arc<Inner>,
}

impl BuildQueue {
    pub fn new(
        config: QueueConfig,
        hub: Arc<EventHub>,
        resolver: Arc<dyn CommandResolver>,
        extractors: ExtractorRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                hub,
                resolver,
                extractors,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Admit a build or deploy job for `project`.
    ///
    /// Starts it right away when a slot is free, otherwise appends it to the
    /// queue. Fails synchronously with `DuplicateBuild` if the project already
    /// has a queued or running job; nothing is changed in that case.
    pub fn submit(
        &self,
        project: &Project,
        kind: ProcessKind,
        options: BuildOptions,
    ) -> Result<JobTicket, OrchestratorError> {
        if kind == ProcessKind::Dev {
            return Err(anyhow!("Dev servers are not admitted through the build queue").into());
        }
        if kind == ProcessKind::Build
            && let Some(tool) = options.tool.as_deref()
        {
            let known = self.inner.extractors.tools();
            if !known.contains(&tool.to_lowercase()) {
                return Err(OrchestratorError::MalformedMessage(format!(
                    "Unknown build tool '{}' (known: {})",
                    tool,
                    known.join(", ")
                )));
            }
        }
        let spec = self.inner.resolver.resolve(kind, project, &options)?;
        let extractor = match kind {
            ProcessKind::Deploy => self.inner.extractors.for_deploy(),
            _ => {
                let tool = options
                    .tool
                    .clone()
                    .or_else(|| detect_tool(&project.path).map(str::to_string));
                self.inner.extractors.for_tool(tool.as_deref())
            }
        };

        let job = BuildJob::new(project.id.clone(), kind, options);
        let (done, rx) = oneshot::channel();
        let mut ticket = JobTicket {
            job_id: job.id,
            project_id: project.id.clone(),
            kind,
            queue_position: None,
            rx,
        };
        let pending = PendingJob {
            job,
            cwd: project.path.clone(),
            spec,
            extractor,
            done,
        };

        let mut state = self.inner.lock();
        if state.closed {
            return Err(anyhow!("Build queue is shutting down").into());
        }
        if state.active.contains_key(&project.id)
            || state.queued.iter().any(|p| p.job.project_id == project.id)
        {
            return Err(OrchestratorError::DuplicateBuild {
                id: project.id.clone(),
            });
        }

        if state.active.len() < self.inner.config.max_concurrent {
            self.inner.launch(&mut state, pending);
        } else {
            let position = state.queued.len() + 1;
            info!(project = %project.id, %kind, position, "Job queued, all slots busy");
            self.inner.publish_progress(
                &pending.job,
                JobState::Queued,
                "queued",
                0,
                format!("Waiting for a free slot (position {})", position),
            );
            state.queued.push_back(pending);
            ticket.queue_position = Some(position);
        }
        Ok(ticket)
    }

    /// Cancel the project's job, whether running or still queued.
    pub fn cancel(&self, project_id: &str) -> CancelOutcome {
        let mut state = self.inner.lock();
        if let Some(active) = state.active.get_mut(project_id) {
            if let Some(tx) = active.cancel.take() {
                let _ = tx.send(());
            }
            info!(project = %project_id, "Cancellation requested for running job");
            return CancelOutcome::Signalled;
        }
        let position = state
            .queued
            .iter()
            .position(|p| p.job.project_id == project_id);
        match position.and_then(|i| state.queued.remove(i)) {
            Some(pending) => {
                drop(state);
                info!(project = %project_id, "Removed queued job");
                self.inner.reject_cancelled(pending);
                CancelOutcome::Dequeued
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Whether the project has a queued or running job.
    pub fn has_job(&self, project_id: &str) -> bool {
        let state = self.inner.lock();
        state.active.contains_key(project_id)
            || state.queued.iter().any(|p| p.job.project_id == project_id)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        let mut active: Vec<BuildJob> = state.active.values().map(|a| a.job.clone()).collect();
        active.sort_by_key(|j| j.started_at);
        QueueStats {
            active_count: state.active.len(),
            queue_length: state.queued.len(),
            max_concurrent: self.inner.config.max_concurrent,
            active,
            queued: state.queued.iter().map(|p| p.job.clone()).collect(),
        }
    }

    /// Stop admitting work, cancel everything queued, signal every running
    /// job and wait up to `wait` for their monitors to finish.
    pub async fn shutdown(&self, wait: Duration) {
        let (queued, running) = {
            let mut state = self.inner.lock();
            state.closed = true;
            let queued: Vec<PendingJob> = state.queued.drain(..).collect();
            for active in state.active.values_mut() {
                if let Some(tx) = active.cancel.take() {
                    let _ = tx.send(());
                }
            }
            (queued, state.active.len())
        };
        info!(queued = queued.len(), running, "Shutting down build queue");
        for pending in queued {
            self.inner.reject_cancelled(pending);
        }
        if running == 0 {
            return;
        }

        let drained = tokio::time::timeout(wait, async {
            loop {
                let notified = self.inner.idle.notified();
                let empty = self.inner.lock().active.is_empty();
                if empty {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Build jobs still running after {:?}", wait);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the job's process and hand it to a monitor task. Called with
    /// the state lock held. A spawn failure resolves the job as failed and
    /// does not take a slot.
    fn launch(self: &Arc<Self>, state: &mut QueueState, pending: PendingJob) {
        let PendingJob {
            mut job,
            cwd,
            spec,
            extractor,
            done,
        } = pending;
        job.state = JobState::Running;
        job.started_at = Some(Utc::now());

        match spawn_supervised(&job.project_id, job.kind, &spec, &cwd, self.config.kill_grace) {
            Ok(supervised) => {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                info!(
                    project = %job.project_id,
                    kind = %job.kind,
                    pid = ?supervised.handle.pid(),
                    active = state.active.len() + 1,
                    "Job started"
                );
                state.active.insert(
                    job.project_id.clone(),
                    ActiveJob {
                        job: job.clone(),
                        cancel: Some(cancel_tx),
                    },
                );
                self.publish_progress(&job, JobState::Running, "starting", 0, spec.display());
                tokio::spawn(Arc::clone(self).monitor(job, supervised, extractor, cancel_rx, done));
            }
            Err(source) => {
                let err = OrchestratorError::SpawnError {
                    id: job.project_id.clone(),
                    kind: job.kind,
                    source,
                };
                error!(project = %job.project_id, kind = %job.kind, "{}", err);
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());
                self.publish_progress(&job, JobState::Failed, "failed", 0, err.to_string());
                let _ = done.send(Err(err));
            }
        }
    }

    async fn monitor(
        self: Arc<Self>,
        mut job: BuildJob,
        supervised: Supervised,
        extractor: Arc<dyn ProgressExtractor>,
        mut cancel_rx: oneshot::Receiver<()>,
        done: oneshot::Sender<JobOutcome>,
    ) {
        let Supervised {
            mut handle,
            mut output,
            mut exit,
        } = supervised;
        let started = Instant::now();
        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);

        let mut stop: Option<StopReason> = None;
        let mut cancel_open = true;
        let exit_result = loop {
            tokio::select! {
                result = &mut exit => break result,
                Some(line) = output.recv() => self.forward_line(&job, extractor.as_ref(), line),
                () = &mut deadline, if stop.is_none() => {
                    warn!(
                        project = %job.project_id,
                        kind = %job.kind,
                        "Job exceeded {:?}, terminating",
                        self.config.job_timeout
                    );
                    stop = Some(StopReason::Timeout);
                    handle.terminate();
                }
                res = &mut cancel_rx, if stop.is_none() && cancel_open => match res {
                    Ok(()) => {
                        stop = Some(StopReason::Cancelled);
                        handle.terminate();
                    }
                    Err(_) => cancel_open = false,
                },
            }
        };
        while let Ok(line) = output.try_recv() {
            self.forward_line(&job, extractor.as_ref(), line);
        }

        let id = job.project_id.clone();
        let outcome = match (stop, exit_result) {
            (Some(StopReason::Timeout), _) => Err(OrchestratorError::Timeout {
                id,
                kind: job.kind,
                after: self.config.job_timeout,
            }),
            (Some(StopReason::Cancelled), _) => Err(OrchestratorError::Cancelled { id }),
            (None, Ok(exit)) if exit.success() => Ok(()),
            (None, Ok(exit)) => Err(OrchestratorError::NonZeroExit {
                id,
                kind: job.kind,
                code: exit.code,
            }),
            (None, Err(_)) => Err(OrchestratorError::NonZeroExit {
                id,
                kind: job.kind,
                code: None,
            }),
        };

        job.finished_at = Some(Utc::now());
        let elapsed = started.elapsed();
        match &outcome {
            Ok(()) => {
                job.state = JobState::Completed;
                info!(project = %job.project_id, kind = %job.kind, ?elapsed, "Job completed");
                self.publish_progress(&job, JobState::Completed, "complete", 100, format!("Finished in {:.1}s", elapsed.as_secs_f64()));
            }
            Err(err) => {
                job.state = match err {
                    OrchestratorError::Cancelled { .. } => JobState::Cancelled,
                    _ => JobState::Failed,
                };
                warn!(project = %job.project_id, kind = %job.kind, ?elapsed, "Job ended: {}", err);
                self.publish_progress(&job, job.state, job.state.as_str(), 0, err.to_string());
            }
        }

        self.finish(&job);
        let _ = done.send(outcome.map(|()| job));
    }

    /// Release the job's slot and start queued jobs while capacity allows.
    fn finish(self: &Arc<Self>, job: &BuildJob) {
        let mut state = self.lock();
        if state
            .active
            .get(&job.project_id)
            .is_some_and(|a| a.job.id == job.id)
        {
            state.active.remove(&job.project_id);
        }
        while !state.closed && state.active.len() < self.config.max_concurrent {
            let Some(next) = state.queued.pop_front() else {
                break;
            };
            debug!(project = %next.job.project_id, "Dequeued job");
            self.launch(&mut state, next);
        }
        if state.active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn reject_cancelled(&self, pending: PendingJob) {
        let PendingJob { mut job, done, .. } = pending;
        job.state = JobState::Cancelled;
        job.finished_at = Some(Utc::now());
        let err = OrchestratorError::Cancelled {
            id: job.project_id.clone(),
        };
        self.publish_progress(&job, JobState::Cancelled, "cancelled", 0, err.to_string());
        let _ = done.send(Err(err));
    }

    fn forward_line(&self, job: &BuildJob, extractor: &dyn ProgressExtractor, line: OutputLine) {
        if let Some(progress) = extractor.extract(&line.line) {
            self.publish_progress(
                job,
                JobState::Running,
                progress.stage,
                progress.progress,
                progress.message,
            );
        }
        self.hub.publish_to(
            &channels::project_logs(&job.project_id),
            HubMessage::ProjectLog {
                project_id: job.project_id.clone(),
                kind: job.kind,
                stream: line.stream,
                line: line.line,
            },
        );
    }

    fn publish_progress(
        &self,
        job: &BuildJob,
        state: JobState,
        stage: impl Into<String>,
        progress: u8,
        message: impl Into<String>,
    ) {
        let channel = match job.kind {
            ProcessKind::Deploy => channels::project_deploy(&job.project_id),
            _ => channels::project_build(&job.project_id),
        };
        self.hub.publish_to(
            &channel,
            HubMessage::job_progress(job.kind, &job.project_id, state, stage, progress, message),
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::orchestrator::commands::ShellResolver;
    use crate::orchestrator::hub::{HubConfig, Outbound};
    use serde_json::Value;

    /// Runs the build script found in `<project>/build.sh`.
    struct ScriptResolver;

    impl CommandResolver for ScriptResolver {
        fn resolve(
            &self,
            _kind: ProcessKind,
            _project: &Project,
            _options: &BuildOptions,
        ) -> anyhow::Result<CommandSpec> {
            Ok(CommandSpec::new("sh").arg("build.sh"))
        }
    }

    struct Fixture {
        queue: BuildQueue,
        hub: Arc<EventHub>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(max_concurrent: usize, timeout: Duration) -> Self {
            let hub = Arc::new(EventHub::new(HubConfig::default()));
            let queue = BuildQueue::new(
                QueueConfig {
                    max_concurrent,
                    job_timeout: timeout,
                    kill_grace: Duration::from_millis(500),
                },
                Arc::clone(&hub),
                Arc::new(ScriptResolver),
                ExtractorRegistry::default(),
            );
            Self {
                queue,
                hub,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn project(&self, id: &str, script: &str) -> Project {
            let path = self.dir.path().join(id);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("build.sh"), script).unwrap();
            Project::new(id, id, path)
        }
    }

    async fn wait_for_file(path: &std::path::Path) {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_runs_job_to_completion() {
        let fx = Fixture::new(2, Duration::from_secs(10));
        let p1 = fx.project("p1", "echo building; echo '50%'; exit 0");
        let ticket = fx.queue.submit(&p1, ProcessKind::Build, BuildOptions::default()).unwrap();
        assert!(ticket.started_immediately());
        let job = ticket.wait().await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.finished_at.is_some());
        assert_eq!(fx.queue.stats().active_count, 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_job() {
        let fx = Fixture::new(1, Duration::from_secs(10));
        let p1 = fx.project("p1", "exit 2");
        let err = fx
            .queue
            .submit(&p1, ProcessKind::Build, BuildOptions::default())
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        match err {
            OrchestratorError::NonZeroExit { code, .. } => assert_eq!(code, Some(2)),
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_resolves_job_failed() {
        let hub = Arc::new(EventHub::new(HubConfig::default()));
        let queue = BuildQueue::new(
            QueueConfig::default(),
            hub,
            Arc::new(ShellResolver::new()),
            ExtractorRegistry::default(),
        );
        // Resolution fails synchronously when no command is configured.
        let project = Project::new("p1", "p1", "/nonexistent/devplane-test");
        assert!(queue.submit(&project, ProcessKind::Build, BuildOptions::default()).is_err());

        let queue = BuildQueue::new(
            QueueConfig::default(),
            Arc::new(EventHub::new(HubConfig::default())),
            Arc::new(ShellResolver::new().with(ProcessKind::Build, "true")),
            ExtractorRegistry::default(),
        );
        // The working directory does not exist, so the spawn itself fails.
        let err = queue
            .submit(&project, ProcessKind::Build, BuildOptions::default())
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SpawnError { .. }));
        assert_eq!(queue.stats().active_count, 0);
    }

    #[tokio::test]
    async fn test_second_job_waits_then_runs() {
        let fx = Fixture::new(1, Duration::from_secs(10));
        let gate = fx.dir.path().join("release-p1");
        let p1 = fx.project("p1", &format!("while [ ! -f '{}' ]; do sleep 0.05; done", gate.display()));
        let p2 = fx.project("p2", "echo second");

        let t1 = fx.queue.submit(&p1, ProcessKind::Build, BuildOptions::default()).unwrap();
        let t2 = fx.queue.submit(&p2, ProcessKind::Build, BuildOptions::default()).unwrap();
        assert!(t1.started_immediately());
        assert_eq!(t2.queue_position, Some(1));

        let stats = fx.queue.stats();
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.queue_length, 1);
        assert_eq!(stats.active[0].project_id, "p1");
        assert_eq!(stats.queued[0].project_id, "p2");

        std::fs::write(&gate, "").unwrap();
        assert!(t1.wait().await.is_ok());
        let job2 = tokio::time::timeout(Duration::from_secs(5), t2.wait())
            .await
            .expect("queued job should start once the slot frees")
            .unwrap();
        assert_eq!(job2.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_queued_job_starts_after_failure() {
        let fx = Fixture::new(1, Duration::from_secs(10));
        let p1 = fx.project("p1", "sleep 0.2; exit 1");
        let p2 = fx.project("p2", "exit 0");
        let t1 = fx.queue.submit(&p1, ProcessKind::Build, BuildOptions::default()).unwrap();
        let t2 = fx.queue.submit(&p2, ProcessKind::Build, BuildOptions::default()).unwrap();
        assert!(t1.wait().await.is_err());
        assert!(t2.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_build_rejected() {
        let fx = Fixture::new(1, Duration::from_secs(10));
        let p1 = fx.project("p1", "sleep 5");
        let p2 = fx.project("p2", "sleep 5");
        let _t1 = fx.queue.submit(&p1, ProcessKind::Build, BuildOptions::default()).unwrap();
        let _t2 = fx.queue.submit(&p2, ProcessKind::Build, BuildOptions::default()).unwrap();

        // Running and queued projects are both rejected, for any job kind.
        for project in [&p1, &p2] {
            let err = fx
                .queue
                .submit(project, ProcessKind::Deploy, BuildOptions::default())
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::DuplicateBuild { .. }));
        }
        assert_eq!(fx.queue.stats().queue_length, 1);
        fx.queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_unknown_build_tool_rejected() {
        let fx = Fixture::new(1, Duration::from_secs(10));
        let project = fx.project("p1", "echo done");
        let options = BuildOptions {
            tool: Some("parcel".to_string()),
            ..BuildOptions::default()
        };
        let err = fx.queue.submit(&project, ProcessKind::Build, options).unwrap_err();
        match err {
            OrchestratorError::MalformedMessage(message) => {
                assert!(message.contains("parcel"));
                assert!(message.contains("next, vite, webpack"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!fx.queue.has_job("p1"));

        let options = BuildOptions {
            tool: Some("Vite".to_string()),
            ..BuildOptions::default()
        };
        let ticket = fx.queue.submit(&project, ProcessKind::Build, options).unwrap();
        assert!(ticket.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_fifo_order() {
        let fx = Fixture::new(2, Duration::from_secs(10));
        let mut tickets = Vec::new();
        for i in 0..6 {
            let project = fx.project(&format!("p{}", i), "sleep 0.1");
            tickets.push(fx.queue.submit(&project, ProcessKind::Build, BuildOptions::default()).unwrap());
            assert!(fx.queue.stats().active_count <= 2);
        }
        assert_eq!(fx.queue.stats().queue_length, 4);

        let watcher = {
            let queue = fx.queue.clone();
            tokio::spawn(async move {
                let mut max_seen = 0;
                for _ in 0..100 {
                    max_seen = max_seen.max(queue.stats().active_count);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                max_seen
            })
        };

        let mut jobs = Vec::new();
        for ticket in tickets {
            jobs.push(ticket.wait().await.unwrap());
        }
        assert!(watcher.await.unwrap() <= 2);

        // Queued jobs were started in submission order.
        let starts: Vec<_> = jobs[2..].iter().map(|j| j.started_at.unwrap()).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_timeout_fails_job_and_drains_queue() {
        let fx = Fixture::new(1, Duration::from_millis(300));
        let p1 = fx.project("p1", "sleep 30");
        let p2 = fx.project("p2", "exit 0");
        let t1 = fx.queue.submit(&p1, ProcessKind::Build, BuildOptions::default()).unwrap();
        let t2 = fx.queue.submit(&p2, ProcessKind::Build, BuildOptions::default()).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), t1.wait())
            .await
            .expect("timed-out job should resolve")
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { .. }));
        assert!(t2.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let fx = Fixture::new(1, Duration::from_secs(30));
        let p1 = fx.project("p1", "sleep 30");
        let t1 = fx.queue.submit(&p1, ProcessKind::Build, BuildOptions::default()).unwrap();
        assert_eq!(fx.queue.cancel("p1"), CancelOutcome::Signalled);
        let err = tokio::time::timeout(Duration::from_secs(5), t1.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));
        assert!(!fx.queue.has_job("p1"));
    }

    #[tokio::test]
    async fn test_cancel_queued_job_never_spawns() {
        let fx = Fixture::new(1, Duration::from_secs(10));
        let marker = fx.dir.path().join("p2-ran");
        let p1 = fx.project("p1", "sleep 0.3");
        let p2 = fx.project("p2", &format!("touch '{}'", marker.display()));
        let t1 = fx.queue.submit(&p1, ProcessKind::Build, BuildOptions::default()).unwrap();
        let t2 = fx.queue.submit(&p2, ProcessKind::Build, BuildOptions::default()).unwrap();

        assert_eq!(fx.queue.cancel("p2"), CancelOutcome::Dequeued);
        let err = t2.wait().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));

        assert!(t1.wait().await.is_ok());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!marker.exists());
        assert_eq!(fx.queue.cancel("p2"), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_output_forwarded_to_hub() {
        let fx = Fixture::new(1, Duration::from_secs(10));
        let p1 = fx.project("p1", "echo hello; echo 'compiling 40%'");
        let (observer, mut rx) = fx.hub.connect(None).unwrap();
        fx.hub.handle_text(
            observer,
            &serde_json::json!({"type": "subscribe", "data": {"channels": [
                channels::project_logs("p1"),
                channels::project_build("p1"),
            ]}})
            .to_string(),
        );

        fx.queue
            .submit(&p1, ProcessKind::Build, BuildOptions::default())
            .unwrap()
            .wait()
            .await
            .unwrap();

        let mut types = Vec::new();
        let mut logs = Vec::new();
        let mut progress = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            let value: Value = serde_json::from_str(&text).unwrap();
            let kind = value["type"].as_str().unwrap().to_string();
            if kind == "projectLog" {
                logs.push(value["data"]["line"].as_str().unwrap().to_string());
            }
            if kind == "buildProgress" {
                progress.push((
                    value["data"]["state"].as_str().unwrap().to_string(),
                    value["data"]["progress"].as_u64().unwrap(),
                ));
            }
            types.push(kind);
        }
        assert_eq!(logs, vec!["hello", "compiling 40%"]);
        assert!(progress.contains(&("running".to_string(), 40)));
        assert_eq!(progress.last().unwrap(), &("completed".to_string(), 100));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let fx = Fixture::new(1, Duration::from_secs(30));
        let started = fx.dir.path().join("p1-started");
        let p1 = fx.project("p1", &format!("touch '{}'; sleep 30", started.display()));
        let p2 = fx.project("p2", "exit 0");
        let t1 = fx.queue.submit(&p1, ProcessKind::Build, BuildOptions::default()).unwrap();
        let t2 = fx.queue.submit(&p2, ProcessKind::Build, BuildOptions::default()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), wait_for_file(&started))
            .await
            .unwrap();

        fx.queue.shutdown(Duration::from_secs(5)).await;
        assert!(matches!(t1.wait().await, Err(OrchestratorError::Cancelled { .. })));
        assert!(matches!(t2.wait().await, Err(OrchestratorError::Cancelled { .. })));
        assert!(fx.queue.submit(&p2, ProcessKind::Build, BuildOptions::default()).is_err());
    }
}
