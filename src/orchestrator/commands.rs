//! Resolution of the executable to run for a project's dev server, build
//! or deploy.
//!
//! The orchestration core treats the result as an opaque
//! [`CommandSpec`]; which program and arguments it contains is the
//! resolver's business.

use std::collections::HashMap;

use anyhow::Result;

use super::models::{BuildOptions, CommandSpec, PackageManager, ProcessKind, Project};

/// Script names looked up in `package.json` by [`PackageManagerResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptNames {
    pub dev: String,
    pub build: String,
    pub deploy: String,
}

impl Default for ScriptNames {
    fn default() -> Self {
        Self {
            dev: "dev".to_string(),
            build: "build".to_string(),
            deploy: "deploy".to_string(),
        }
    }
}

impl ScriptNames {
    fn for_kind(&self, kind: ProcessKind) -> &str {
        match kind {
            ProcessKind::Dev => &self.dev,
            ProcessKind::Build => &self.build,
            ProcessKind::Deploy => &self.deploy,
        }
    }
}

/// Strategy mapping (project, purpose, options) to a command.
pub trait CommandResolver: Send + Sync {
    fn resolve(
        &self,
        kind: ProcessKind,
        project: &Project,
        options: &BuildOptions,
    ) -> Result<CommandSpec>;
}

/// Runs `package.json` scripts through the project's package manager.
#[derive(Debug, Clone, Default)]
pub struct PackageManagerResolver {
    scripts: ScriptNames,
}

impl PackageManagerResolver {
    pub fn new(scripts: ScriptNames) -> Self {
        Self { scripts }
    }
}

impl CommandResolver for PackageManagerResolver {
    fn resolve(
        &self,
        kind: ProcessKind,
        project: &Project,
        options: &BuildOptions,
    ) -> Result<CommandSpec> {
        let script = self.scripts.for_kind(kind);
        let spec = match project.package_manager {
            PackageManager::Yarn => CommandSpec::new("yarn").arg(script),
            pm => CommandSpec::new(pm.as_str()).arg("run").arg(script),
        };
        Ok(with_option_env(spec, kind, options))
    }
}

/// Runs configured shell command lines (`sh -c <line>`), falling back to
/// another resolver for kinds without a configured line.
pub struct ShellResolver {
    lines: HashMap<ProcessKind, String>,
    fallback: Option<Box<dyn CommandResolver>>,
}

impl Default for ShellResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellResolver {
    pub fn new() -> Self {
        Self {
            lines: HashMap::new(),
            fallback: None,
        }
    }

    pub fn with(mut self, kind: ProcessKind, line: impl Into<String>) -> Self {
        self.lines.insert(kind, line.into());
        self
    }

    pub fn with_fallback(mut self, fallback: impl CommandResolver + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl CommandResolver for ShellResolver {
    fn resolve(
        &self,
        kind: ProcessKind,
        project: &Project,
        options: &BuildOptions,
    ) -> Result<CommandSpec> {
        match self.lines.get(&kind) {
            Some(line) => Ok(with_option_env(shell_command(line), kind, options)),
            None => match self.fallback {
                Some(ref fallback) => fallback.resolve(kind, project, options),
                None => anyhow::bail!("No {} command configured for project {}", kind, project.id),
            },
        }
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> CommandSpec {
    CommandSpec::new("sh").arg("-c").arg(line)
}

#[cfg(windows)]
fn shell_command(line: &str) -> CommandSpec {
    CommandSpec::new("cmd").arg("/C").arg(line)
}

fn with_option_env(mut spec: CommandSpec, kind: ProcessKind, options: &BuildOptions) -> CommandSpec {
    if kind != ProcessKind::Dev && options.production {
        spec = spec.env("NODE_ENV", "production");
    }
    if kind == ProcessKind::Deploy
        && let Some(ref target) = options.target
    {
        spec = spec.env("DEVPLANE_DEPLOY_TARGET", target.clone());
    }
    for (key, value) in &options.env {
        spec = spec.env(key.clone(), value.clone());
    }
    spec
}
