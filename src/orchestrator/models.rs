use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque project key. Assigned by the external creation flow.
pub type ProjectId = String;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Idle,
    Running,
    Building,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Building => "building",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "building" => Ok(Self::Building),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Bun => "bun",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "npm" => Ok(Self::Npm),
            "pnpm" => Ok(Self::Pnpm),
            "yarn" => Ok(Self::Yarn),
            "bun" => Ok(Self::Bun),
            _ => Err(format!("Invalid package manager: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub package_manager: PackageManager,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            package_manager: PackageManager::default(),
            status: ProjectStatus::Idle,
            port: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_package_manager(mut self, package_manager: PackageManager) -> Self {
        self.package_manager = package_manager;
        self
    }
}

/// Partial update applied through [`ProjectStore::update_project`].
///
/// Double options distinguish "leave unchanged" (`None`) from "clear"
/// (`Some(None)`).
///
/// [`ProjectStore::update_project`]: super::store::ProjectStore::update_project
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
    pub status: Option<ProjectStatus>,
    pub port: Option<Option<u16>>,
    pub last_error: Option<Option<String>>,
}

impl ProjectPatch {
    pub fn status(status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn apply(&self, project: &mut Project) {
        if let Some(status) = self.status {
            project.status = status;
        }
        if let Some(port) = self.port {
            project.port = port;
        }
        if let Some(ref error) = self.last_error {
            project.last_error = error.clone();
        }
        project.updated_at = Utc::now();
    }
}

/// Purpose of a supervised OS process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Dev,
    Build,
    Deploy,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Build => "build",
            Self::Deploy => "deploy",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable record of a supervised process, the observable half of a
/// process handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub project_id: ProjectId,
    pub kind: ProcessKind,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Options supplied with a build or deploy request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildOptions {
    #[serde(default)]
    pub production: bool,
    /// Build-tool family used to pick a progress extractor (`vite`, `next`,
    /// `webpack`, ...). Detected from the project directory when absent.
    #[serde(default)]
    pub tool: Option<String>,
    /// Deploy provider, passed to the deploy command as `DEVPLANE_DEPLOY_TARGET`.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A build or deploy request tracked by the admission controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub kind: ProcessKind,
    pub options: BuildOptions,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildJob {
    pub fn new(project_id: impl Into<String>, kind: ProcessKind, options: BuildOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            kind,
            options,
            state: JobState::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// An executable, its arguments and extra environment, as resolved by a
/// [`CommandResolver`](super::commands::CommandResolver).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
