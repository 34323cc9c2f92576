//! Per-project process lifecycle.
//!
//! `ProcessManager` is the only writer of `Project.status`. It supervises at
//! most one dev server per project directly and runs build/deploy jobs
//! through the admission queue, which enforces the one-job-per-project rule.
//!
//! ```text
//! idle --start--> running --stop | exit--> idle
//! idle --spawn failure--> error
//! idle --build--> building --success--> idle (running if a dev server is up)
//!                          --failure--> error
//! ```
//!
//! Every dev server gets a generation number. Its exit listener only resets
//! state if the entry it finds still carries that generation, so a late exit
//! from a stopped server can never clobber a newer one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::commands::CommandResolver;
use super::events::{HubMessage, channels};
use super::hub::EventHub;
use super::models::{
    BuildJob, BuildOptions, JobState, ProcessInfo, ProcessKind, Project, ProjectId, ProjectPatch,
    ProjectStatus,
};
use super::ports::PortAllocator;
use super::process::{OutputLine, ProcessExit, ProcessHandle, Supervised, spawn_supervised};
use super::queue::{BuildQueue, CancelOutcome, JobOutcome, JobTicket};
use super::store::ProjectStore;
use crate::errors::OrchestratorError;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub base_port: u16,
    pub port_window: u16,
    pub kill_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            base_port: 3000,
            port_window: 100,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// What a caller gets back when a job is admitted without waiting for it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReceipt {
    pub job_id: Uuid,
    pub project_id: ProjectId,
    pub kind: ProcessKind,
    pub state: JobState,
    pub queue_position: Option<usize>,
}

impl From<&JobTicket> for JobReceipt {
    fn from(ticket: &JobTicket) -> Self {
        Self {
            job_id: ticket.job_id,
            project_id: ticket.project_id.clone(),
            kind: ticket.kind,
            state: if ticket.started_immediately() {
                JobState::Running
            } else {
                JobState::Queued
            },
            queue_position: ticket.queue_position,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset: Vec<ProjectId>,
    pub dropped: Vec<ProjectId>,
}

struct DevServer {
    handle: ProcessHandle,
    port: u16,
    generation: u64,
}

struct Inner {
    config: LifecycleConfig,
    store: Arc<dyn ProjectStore>,
    hub: Arc<EventHub>,
    ports: Arc<PortAllocator>,
    queue: BuildQueue,
    resolver: Arc<dyn CommandResolver>,
    devs: Mutex<HashMap<ProjectId, DevServer>>,
    generation: AtomicU64,
    listeners: AtomicUsize,
    listeners_done: Notify,
}

#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl ProcessManager {
    pub fn new(
        config: LifecycleConfig,
        store: Arc<dyn ProjectStore>,
        hub: Arc<EventHub>,
        ports: Arc<PortAllocator>,
        queue: BuildQueue,
        resolver: Arc<dyn CommandResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                hub,
                ports,
                queue,
                resolver,
                devs: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                listeners: AtomicUsize::new(0),
                listeners_done: Notify::new(),
            }),
        }
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.inner.queue
    }

    /// Start the project's dev server on a freshly allocated port.
    pub fn start(&self, id: &str) -> Result<Project, OrchestratorError> {
        let inner = &self.inner;
        let project = inner.project(id)?;
        let mut devs = inner.lock_devs();
        if project.status == ProjectStatus::Running || devs.contains_key(id) {
            return Err(OrchestratorError::AlreadyRunning { id: id.to_string() });
        }

        let port = inner
            .ports
            .allocate(inner.config.base_port, inner.config.port_window)?;
        let spec = match inner
            .resolver
            .resolve(ProcessKind::Dev, &project, &BuildOptions::default())
        {
            Ok(spec) => spec.env("PORT", port.to_string()),
            Err(e) => {
                inner.ports.release(port);
                return Err(e.into());
            }
        };

        let supervised = match spawn_supervised(
            &project.id,
            ProcessKind::Dev,
            &spec,
            &project.path,
            inner.config.kill_grace,
        ) {
            Ok(supervised) => supervised,
            Err(source) => {
                inner.ports.release(port);
                let err = OrchestratorError::SpawnError {
                    id: id.to_string(),
                    kind: ProcessKind::Dev,
                    source,
                };
                error!(project = %id, "{}", err);
                inner.set_status(
                    id,
                    ProjectPatch::status(ProjectStatus::Error)
                        .with_port(None)
                        .with_error(Some(err.to_string())),
                );
                return Err(err);
            }
        };

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Supervised {
            handle,
            output,
            exit,
        } = supervised;
        info!(project = %id, port, pid = ?handle.pid(), "Dev server started");
        devs.insert(
            id.to_string(),
            DevServer {
                handle,
                port,
                generation,
            },
        );
        let updated = inner.set_status(
            id,
            ProjectPatch::status(ProjectStatus::Running)
                .with_port(Some(port))
                .with_error(None),
        );
        drop(devs);

        inner.listeners.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(Arc::clone(inner).watch_dev(id.to_string(), port, generation, output, exit));
        updated.ok_or_else(|| OrchestratorError::ProjectNotFound { id: id.to_string() })
    }

    /// Signal the dev server to terminate and reset state without waiting
    /// for the exit. A no-op when nothing is running.
    pub fn stop(&self, id: &str) -> Result<Project, OrchestratorError> {
        let inner = &self.inner;
        let project = inner.project(id)?;
        let mut devs = inner.lock_devs();
        let Some(mut dev) = devs.remove(id) else {
            return Ok(project);
        };
        dev.handle.terminate();
        info!(project = %id, port = dev.port, "Dev server stopping");
        let status = inner.settled_status(id, &devs);
        let updated = inner.set_status(id, ProjectPatch::status(status).with_port(None));
        drop(devs);
        updated.ok_or_else(|| OrchestratorError::ProjectNotFound { id: id.to_string() })
    }

    pub fn restart(&self, id: &str) -> Result<Project, OrchestratorError> {
        self.stop(id)?;
        self.start(id)
    }

    /// Admit a build or deploy job and mark the project `building`. The
    /// returned ticket resolves with the job outcome; the caller is expected
    /// to hand it to [`settle_job`](Self::settle_job).
    pub fn begin_job(
        &self,
        id: &str,
        kind: ProcessKind,
        options: BuildOptions,
    ) -> Result<JobTicket, OrchestratorError> {
        let inner = &self.inner;
        let project = inner.project(id)?;
        if project.status == ProjectStatus::Building {
            return Err(OrchestratorError::AlreadyBuilding { id: id.to_string() });
        }
        let ticket = inner.queue.submit(&project, kind, options)?;
        inner.set_status(
            id,
            ProjectPatch::status(ProjectStatus::Building).with_error(None),
        );
        Ok(ticket)
    }

    /// Wait for the job behind `ticket` and move the project to its settled
    /// status.
    pub async fn settle_job(&self, ticket: JobTicket) -> JobOutcome {
        let id = ticket.project_id.clone();
        let outcome = ticket.wait().await;
        self.inner.settle_after_job(&id, &outcome);
        outcome
    }

    /// Run a build to completion.
    pub async fn build(&self, id: &str, options: BuildOptions) -> Result<BuildJob, OrchestratorError> {
        let ticket = self.begin_job(id, ProcessKind::Build, options)?;
        self.settle_job(ticket).await
    }

    /// Run a deploy to completion.
    pub async fn deploy(&self, id: &str, options: BuildOptions) -> Result<BuildJob, OrchestratorError> {
        let ticket = self.begin_job(id, ProcessKind::Deploy, options)?;
        self.settle_job(ticket).await
    }

    /// Admit a job and settle it in the background.
    pub fn spawn_job(
        &self,
        id: &str,
        kind: ProcessKind,
        options: BuildOptions,
    ) -> Result<JobReceipt, OrchestratorError> {
        let ticket = self.begin_job(id, kind, options)?;
        let receipt = JobReceipt::from(&ticket);
        let manager = self.clone();
        tokio::spawn(async move {
            let _ = manager.settle_job(ticket).await;
        });
        Ok(receipt)
    }

    pub fn cancel_job(&self, id: &str) -> Result<CancelOutcome, OrchestratorError> {
        self.inner.project(id)?;
        Ok(self.inner.queue.cancel(id))
    }

    /// Stop everything the project owns so it can be deleted.
    pub fn release_project(&self, id: &str) -> Result<(), OrchestratorError> {
        self.stop(id)?;
        let cancelled = self.inner.queue.cancel(id);
        debug!(project = %id, ?cancelled, "Released project");
        Ok(())
    }

    pub fn dev_process(&self, id: &str) -> Option<ProcessInfo> {
        self.inner
            .lock_devs()
            .get(id)
            .map(|dev| dev.handle.info().clone())
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock_devs().len()
    }

    /// Reconcile persisted state after the control plane itself restarted:
    /// no child process can have survived, and projects whose directory is
    /// gone are dropped.
    pub fn recover(&self) -> RecoveryReport {
        let store = &self.inner.store;
        let mut report = RecoveryReport::default();
        for project in store.list_projects() {
            if !project.path.exists() {
                warn!(project = %project.id, path = %project.path.display(), "Project directory missing, dropping");
                if store.delete_project(&project.id).is_ok() {
                    report.dropped.push(project.id);
                }
                continue;
            }
            if matches!(project.status, ProjectStatus::Running | ProjectStatus::Building) {
                let patch = ProjectPatch::status(ProjectStatus::Idle).with_port(None);
                if store.update_project(&project.id, &patch).is_ok() {
                    report.reset.push(project.id);
                }
            }
        }
        if !report.reset.is_empty() || !report.dropped.is_empty() {
            info!(reset = report.reset.len(), dropped = report.dropped.len(), "Recovered project state");
        }
        report
    }

    /// Stop every dev server and drain the build queue, waiting up to `wait`
    /// for the processes to go away.
    pub async fn shutdown(&self, wait: Duration) {
        let ids: Vec<ProjectId> = self.inner.lock_devs().keys().cloned().collect();
        for id in &ids {
            if let Err(e) = self.stop(id) {
                warn!(project = %id, "Failed to stop dev server: {}", e);
            }
        }
        self.inner.queue.shutdown(wait).await;

        let inner = &self.inner;
        let drained = tokio::time::timeout(wait, async {
            loop {
                let notified = inner.listeners_done.notified();
                if inner.listeners.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Dev servers still running after {:?}", wait);
        }
    }
}

impl Inner {
    fn lock_devs(&self) -> MutexGuard<'_, HashMap<ProjectId, DevServer>> {
        self.devs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn project(&self, id: &str) -> Result<Project, OrchestratorError> {
        self.store
            .get_project(id)
            .ok_or_else(|| OrchestratorError::ProjectNotFound { id: id.to_string() })
    }

    /// Status a project returns to when nothing is failing: `building` while
    /// a job is admitted, `running` while a dev server is up, else `idle`.
    fn settled_status(&self, id: &str, devs: &HashMap<ProjectId, DevServer>) -> ProjectStatus {
        if self.queue.has_job(id) {
            ProjectStatus::Building
        } else if devs.contains_key(id) {
            ProjectStatus::Running
        } else {
            ProjectStatus::Idle
        }
    }

    /// Apply a patch and broadcast the resulting status. Returns `None` if
    /// the project has been deleted meanwhile.
    fn set_status(&self, id: &str, patch: ProjectPatch) -> Option<Project> {
        match self.store.update_project(id, &patch) {
            Ok(project) => {
                debug!(project = %id, status = %project.status, "Status changed");
                self.hub.publish(HubMessage::ProjectStatus {
                    project_id: project.id.clone(),
                    status: project.status,
                    port: project.port,
                    error: project.last_error.clone(),
                });
                Some(project)
            }
            Err(e) => {
                debug!(project = %id, "Status update skipped: {}", e);
                None
            }
        }
    }

    fn settle_after_job(&self, id: &str, outcome: &JobOutcome) {
        let devs = self.lock_devs();
        let port = devs.get(id).map(|dev| dev.port);
        let settled = if devs.contains_key(id) {
            ProjectStatus::Running
        } else {
            ProjectStatus::Idle
        };
        let patch = match outcome {
            Err(err) if err.is_runtime_failure() => {
                ProjectPatch::status(ProjectStatus::Error).with_error(Some(err.to_string()))
            }
            Ok(_) => ProjectPatch::status(settled).with_error(None),
            // Cancelled, or rejected while the queue shuts down.
            Err(err) => {
                debug!(project = %id, "Job ended without running to completion: {}", err);
                ProjectPatch::status(settled).with_error(None)
            }
        };
        self.set_status(id, patch.with_port(port));
    }

    async fn watch_dev(
        self: Arc<Self>,
        id: ProjectId,
        port: u16,
        generation: u64,
        mut output: mpsc::UnboundedReceiver<OutputLine>,
        exit: oneshot::Receiver<ProcessExit>,
    ) {
        let channel = channels::project_logs(&id);
        let forward = async {
            while let Some(line) = output.recv().await {
                self.hub.publish_to(
                    &channel,
                    HubMessage::ProjectLog {
                        project_id: id.clone(),
                        kind: ProcessKind::Dev,
                        stream: line.stream,
                        line: line.line,
                    },
                );
            }
        };
        // The supervisor reports the exit only after the output readers are
        // done, so forwarding everything first loses nothing.
        forward.await;
        let exit = exit.await.unwrap_or(ProcessExit {
            code: None,
            terminated: false,
            killed: false,
            error: Some("supervisor dropped".to_string()),
        });

        self.on_dev_exit(&id, port, generation, &exit);
        if self.listeners.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.listeners_done.notify_waiters();
        }
    }

    fn on_dev_exit(&self, id: &str, port: u16, generation: u64, exit: &ProcessExit) {
        self.ports.release(port);
        let mut devs = self.lock_devs();
        if !devs.get(id).is_some_and(|dev| dev.generation == generation) {
            debug!(project = %id, code = ?exit.code, "Stopped dev server exited");
            return;
        }
        devs.remove(id);

        let patch = if exit.clean() {
            info!(project = %id, code = ?exit.code, "Dev server exited");
            ProjectPatch::status(self.settled_status(id, &devs)).with_error(None)
        } else {
            let message = match (&exit.error, exit.code) {
                (Some(e), _) => format!("Dev server failed: {}", e),
                (None, code) => OrchestratorError::NonZeroExit {
                    id: id.to_string(),
                    kind: ProcessKind::Dev,
                    code,
                }
                .to_string(),
            };
            warn!(project = %id, code = ?exit.code, "{}", message);
            ProjectPatch::status(ProjectStatus::Error).with_error(Some(message))
        };
        self.set_status(id, patch.with_port(None));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::orchestrator::commands::ShellResolver;
    use crate::orchestrator::hub::{HubConfig, Outbound};
    use crate::orchestrator::progress::ExtractorRegistry;
    use crate::orchestrator::queue::QueueConfig;
    use crate::orchestrator::store::SnapshotStore;
    use std::net::TcpListener;

    struct Fixture {
        manager: ProcessManager,
        store: Arc<SnapshotStore>,
        hub: Arc<EventHub>,
        ports: Arc<PortAllocator>,
        dir: tempfile::TempDir,
    }

    fn fixture(resolver: ShellResolver, base_port: u16, job_timeout: Duration) -> Fixture {
        let store = Arc::new(SnapshotStore::in_memory());
        let hub = Arc::new(EventHub::new(HubConfig::default()));
        let ports = Arc::new(PortAllocator::default());
        let resolver: Arc<dyn CommandResolver> = Arc::new(resolver);
        let queue = BuildQueue::new(
            QueueConfig {
                max_concurrent: 1,
                job_timeout,
                kill_grace: Duration::from_millis(500),
            },
            Arc::clone(&hub),
            Arc::clone(&resolver),
            ExtractorRegistry::default(),
        );
        let manager = ProcessManager::new(
            LifecycleConfig {
                base_port,
                port_window: 100,
                kill_grace: Duration::from_millis(500),
            },
            store.clone(),
            Arc::clone(&hub),
            Arc::clone(&ports),
            queue,
            resolver,
        );
        let dir = tempfile::tempdir().unwrap();
        Fixture {
            manager,
            store,
            hub,
            ports,
            dir,
        }
    }

    impl Fixture {
        fn add_project(&self, id: &str) -> Project {
            let path = self.dir.path().join(id);
            std::fs::create_dir_all(&path).unwrap();
            self.store.insert_project(Project::new(id, id, path)).unwrap()
        }

        fn status(&self, id: &str) -> ProjectStatus {
            self.store.get_project(id).unwrap().status
        }

        async fn wait_for_status(&self, id: &str, status: ProjectStatus) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.status(id) != status {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("{} never reached {}, is {}", id, status, self.status(id)));
        }
    }

    fn free_base_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port().min(65000)
    }

    #[tokio::test]
    async fn test_start_skips_occupied_port() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = occupied.local_addr().unwrap().port();
        if base > 65000 {
            return;
        }
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Dev, "echo port=$PORT; sleep 30"),
            base,
            Duration::from_secs(10),
        );
        fx.add_project("p1");

        let project = fx.manager.start("p1").unwrap();
        let port = project.port.unwrap();
        assert_ne!(port, base);
        assert!(port > base && port < base + 100);
        assert_eq!(project.status, ProjectStatus::Running);
        assert!(fx.ports.is_allocated(port));
        assert!(fx.manager.dev_process("p1").is_some());

        fx.manager.shutdown(Duration::from_secs(5)).await;
        drop(occupied);
    }

    #[tokio::test]
    async fn test_start_twice_is_already_running() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Dev, "sleep 30"),
            free_base_port(),
            Duration::from_secs(10),
        );
        fx.add_project("p1");
        fx.manager.start("p1").unwrap();
        let err = fx.manager.start("p1").unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));
        assert_eq!(fx.manager.running_count(), 1);
        fx.manager.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_stop_resets_and_releases_port() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Dev, "sleep 30"),
            free_base_port(),
            Duration::from_secs(10),
        );
        fx.add_project("p1");
        let port = fx.manager.start("p1").unwrap().port.unwrap();

        let project = fx.manager.stop("p1").unwrap();
        assert_eq!(project.status, ProjectStatus::Idle);
        assert_eq!(project.port, None);
        assert!(fx.manager.dev_process("p1").is_none());

        // The port goes back to the pool once the process has exited.
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.ports.is_allocated(port) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(fx.status("p1"), ProjectStatus::Idle);

        // Stopping again is a no-op.
        assert_eq!(fx.manager.stop("p1").unwrap().status, ProjectStatus::Idle);
    }

    #[tokio::test]
    async fn test_spawn_failure_sets_error() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Dev, "sleep 30"),
            free_base_port(),
            Duration::from_secs(10),
        );
        let project = fx
            .store
            .insert_project(Project::new("ghost", "ghost", fx.dir.path().join("missing")))
            .unwrap();
        let err = fx.manager.start(&project.id).unwrap_err();
        assert!(matches!(err, OrchestratorError::SpawnError { .. }));
        let project = fx.store.get_project("ghost").unwrap();
        assert_eq!(project.status, ProjectStatus::Error);
        assert!(project.last_error.is_some());
        assert_eq!(project.port, None);
    }

    #[tokio::test]
    async fn test_dev_crash_sets_error() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Dev, "sleep 0.1; exit 7"),
            free_base_port(),
            Duration::from_secs(10),
        );
        fx.add_project("p1");
        fx.manager.start("p1").unwrap();
        fx.wait_for_status("p1", ProjectStatus::Error).await;
        let project = fx.store.get_project("p1").unwrap();
        assert!(project.last_error.unwrap().contains("7"));
        assert!(fx.manager.dev_process("p1").is_none());
    }

    #[tokio::test]
    async fn test_clean_dev_exit_returns_to_idle() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Dev, "sleep 0.1"),
            free_base_port(),
            Duration::from_secs(10),
        );
        fx.add_project("p1");
        fx.manager.start("p1").unwrap();
        fx.wait_for_status("p1", ProjectStatus::Idle).await;
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Dev, "sleep 30"),
            free_base_port(),
            Duration::from_secs(10),
        );
        fx.add_project("p1");
        let first = fx.manager.start("p1").unwrap();
        let first_pid = fx.manager.dev_process("p1").unwrap().pid;
        let second = fx.manager.restart("p1").unwrap();
        assert_eq!(second.status, ProjectStatus::Running);
        assert_ne!(fx.manager.dev_process("p1").unwrap().pid, first_pid);

        // The old server's exit must not reset the new one.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.status("p1"), ProjectStatus::Running);
        assert!(first.port.is_some());
        fx.manager.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_build_success_and_failure() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Build, "test -f ok"),
            free_base_port(),
            Duration::from_secs(10),
        );
        let project = fx.add_project("p1");

        let err = fx.manager.build("p1", BuildOptions::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NonZeroExit { .. }));
        assert_eq!(fx.status("p1"), ProjectStatus::Error);

        std::fs::write(project.path.join("ok"), "").unwrap();
        let job = fx.manager.build("p1", BuildOptions::default()).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        let project = fx.store.get_project("p1").unwrap();
        assert_eq!(project.status, ProjectStatus::Idle);
        assert_eq!(project.last_error, None);
    }

    #[tokio::test]
    async fn test_build_while_building_is_rejected() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Build, "sleep 30"),
            free_base_port(),
            Duration::from_secs(30),
        );
        fx.add_project("p1");
        let receipt = fx
            .manager
            .spawn_job("p1", ProcessKind::Build, BuildOptions::default())
            .unwrap();
        assert_eq!(receipt.state, JobState::Running);
        assert_eq!(fx.status("p1"), ProjectStatus::Building);

        let err = fx.manager.build("p1", BuildOptions::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyBuilding { .. }));

        // Cancelling returns to the pre-build state rather than error.
        assert_eq!(fx.manager.cancel_job("p1").unwrap(), CancelOutcome::Signalled);
        fx.wait_for_status("p1", ProjectStatus::Idle).await;
    }

    #[tokio::test]
    async fn test_build_timeout_sets_error() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Build, "sleep 30"),
            free_base_port(),
            Duration::from_millis(200),
        );
        fx.add_project("p1");
        let err = fx.manager.build("p1", BuildOptions::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { .. }));
        let project = fx.store.get_project("p1").unwrap();
        assert_eq!(project.status, ProjectStatus::Error);
        assert!(project.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_build_with_dev_running_settles_to_running() {
        let fx = fixture(
            ShellResolver::new()
                .with(ProcessKind::Dev, "sleep 30")
                .with(ProcessKind::Build, "true"),
            free_base_port(),
            Duration::from_secs(10),
        );
        fx.add_project("p1");
        let port = fx.manager.start("p1").unwrap().port;
        fx.manager.build("p1", BuildOptions::default()).await.unwrap();
        let project = fx.store.get_project("p1").unwrap();
        assert_eq!(project.status, ProjectStatus::Running);
        assert_eq!(project.port, port);
        fx.manager.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_status_changes_are_broadcast() {
        let fx = fixture(
            ShellResolver::new().with(ProcessKind::Dev, "sleep 30"),
            free_base_port(),
            Duration::from_secs(10),
        );
        fx.add_project("p1");
        let (_observer, mut rx) = fx.hub.connect(None).unwrap();
        fx.manager.start("p1").unwrap();
        fx.manager.stop("p1").unwrap();

        let mut statuses = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "projectStatus" {
                statuses.push(value["data"]["status"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(statuses, vec!["running", "idle"]);
    }

    #[tokio::test]
    async fn test_release_project_stops_everything() {
        let fx = fixture(
            ShellResolver::new()
                .with(ProcessKind::Dev, "sleep 30")
                .with(ProcessKind::Build, "sleep 30"),
            free_base_port(),
            Duration::from_secs(30),
        );
        fx.add_project("p1");
        fx.manager.start("p1").unwrap();
        fx.manager
            .spawn_job("p1", ProcessKind::Build, BuildOptions::default())
            .unwrap();

        fx.manager.release_project("p1").unwrap();
        assert!(fx.manager.dev_process("p1").is_none());
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.manager.queue().has_job("p1") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        fx.store.delete_project("p1").unwrap();
    }

    #[test]
    fn test_recover_resets_and_drops() {
        let store = Arc::new(SnapshotStore::in_memory());
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live");
        std::fs::create_dir_all(&live).unwrap();

        let mut running = Project::new("running", "r", &live);
        running.status = ProjectStatus::Running;
        running.port = Some(3005);
        let mut building = Project::new("building", "b", &live);
        building.status = ProjectStatus::Building;
        let failed = {
            let mut p = Project::new("failed", "f", &live);
            p.status = ProjectStatus::Error;
            p
        };
        let gone = Project::new("gone", "g", dir.path().join("deleted"));
        for p in [running, building, failed, gone] {
            store.insert_project(p).unwrap();
        }

        let hub = Arc::new(EventHub::new(HubConfig::default()));
        let resolver: Arc<dyn CommandResolver> = Arc::new(ShellResolver::new());
        let manager = ProcessManager::new(
            LifecycleConfig::default(),
            store.clone(),
            Arc::clone(&hub),
            Arc::new(PortAllocator::default()),
            BuildQueue::new(QueueConfig::default(), hub, Arc::clone(&resolver), ExtractorRegistry::default()),
            resolver,
        );
        let mut report = manager.recover();
        report.reset.sort();
        assert_eq!(report.reset, vec!["building".to_string(), "running".to_string()]);
        assert_eq!(report.dropped, vec!["gone".to_string()]);

        assert_eq!(store.get_project("running").unwrap().status, ProjectStatus::Idle);
        assert_eq!(store.get_project("running").unwrap().port, None);
        assert_eq!(store.get_project("building").unwrap().status, ProjectStatus::Idle);
        assert_eq!(store.get_project("failed").unwrap().status, ProjectStatus::Error);
        assert!(store.get_project("gone").is_none());
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let fx = fixture(ShellResolver::new(), free_base_port(), Duration::from_secs(1));
        assert!(matches!(
            fx.manager.start("nope"),
            Err(OrchestratorError::ProjectNotFound { .. })
        ));
        assert!(matches!(
            fx.manager.build("nope", BuildOptions::default()).await,
            Err(OrchestratorError::ProjectNotFound { .. })
        ));
    }
}
