//! Best-effort progress extraction from build and deploy output.
//!
//! Each build-tool family gets its own [`ProgressExtractor`]. The admission
//! queue asks the [`ExtractorRegistry`] for the extractor matching a job and
//! feeds it every output line; lines that match nothing are still forwarded
//! as raw logs, they just produce no progress event.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;

// Compile regexes once using LazyLock
static PERCENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\d.])(\d{1,3})(?:\.\d+)?\s?%").unwrap());

static WEBPACK_PERCENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*<?[a-z]?>?\s*(\d{1,3})%\s+(\w[\w ]*)").unwrap());

static VITE_BUILT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"built in \d+(?:\.\d+)?\s?m?s").unwrap());

static VITE_MODULES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) modules transformed").unwrap());

static NEXT_PAGES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Generating static pages.*\((\d+)/(\d+)\)").unwrap());

/// Coarse progress derived from one chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub stage: String,
    pub progress: u8,
    pub message: String,
}

impl Progress {
    pub fn new(stage: impl Into<String>, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            progress: progress.min(100),
            message: message.into(),
        }
    }
}

/// Maps recognisable output to progress. Implementations must be cheap and
/// must never fail; returning `None` means "nothing recognisable here".
pub trait ProgressExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, chunk: &str) -> Option<Progress>;
}

/// Generic `NN%` matcher, the fallback for tools without a dedicated extractor.
pub struct PercentExtractor;

impl ProgressExtractor for PercentExtractor {
    fn name(&self) -> &'static str {
        "percent"
    }

    fn extract(&self, chunk: &str) -> Option<Progress> {
        let cap = PERCENT_REGEX.captures(chunk)?;
        let value: u16 = cap.get(1)?.as_str().parse().ok()?;
        if value > 100 {
            return None;
        }
        Some(Progress::new("building", value as u8, chunk.trim()))
    }
}

pub struct ViteExtractor;

impl ProgressExtractor for ViteExtractor {
    fn name(&self) -> &'static str {
        "vite"
    }

    fn extract(&self, chunk: &str) -> Option<Progress> {
        let line = chunk.trim();
        if VITE_BUILT_REGEX.is_match(line) {
            return Some(Progress::new("complete", 100, line));
        }
        if line.contains("building for production") || line.starts_with("vite v") {
            return Some(Progress::new("starting", 5, line));
        }
        if let Some(cap) = VITE_MODULES_REGEX.captures(line) {
            return Some(Progress::new(
                "transforming",
                50,
                format!("{} modules transformed", &cap[1]),
            ));
        }
        if line.starts_with("transforming") {
            return Some(Progress::new("transforming", 30, line));
        }
        if line.starts_with("rendering chunks") {
            return Some(Progress::new("rendering", 70, line));
        }
        if line.starts_with("computing gzip size") {
            return Some(Progress::new("optimizing", 85, line));
        }
        None
    }
}

pub struct WebpackExtractor;

impl ProgressExtractor for WebpackExtractor {
    fn name(&self) -> &'static str {
        "webpack"
    }

    fn extract(&self, chunk: &str) -> Option<Progress> {
        let line = chunk.trim();
        if line.contains("compiled successfully") || line.contains("Compiled successfully") {
            return Some(Progress::new("complete", 100, line));
        }
        if line.contains("compiled with") && line.contains("error") {
            return Some(Progress::new("failed", 100, line));
        }
        if let Some(cap) = WEBPACK_PERCENT_REGEX.captures(line) {
            let value: u16 = cap[1].parse().ok()?;
            if value <= 100 {
                return Some(Progress::new(cap[2].trim().to_string(), value as u8, line));
            }
        }
        None
    }
}

pub struct NextExtractor;

impl ProgressExtractor for NextExtractor {
    fn name(&self) -> &'static str {
        "next"
    }

    fn extract(&self, chunk: &str) -> Option<Progress> {
        let line = chunk.trim();
        if let Some(cap) = NEXT_PAGES_REGEX.captures(line) {
            let done: u32 = cap[1].parse().ok()?;
            let total: u32 = cap[2].parse().ok()?;
            let fraction = if total == 0 { 1.0 } else { done as f64 / total as f64 };
            let progress = 75.0 + fraction.min(1.0) * 15.0;
            return Some(Progress::new("generating", progress as u8, line));
        }
        let table: [(&str, &str, u8); 6] = [
            ("Creating an optimized production build", "starting", 10),
            ("Compiled successfully", "compiled", 50),
            ("Linting and checking validity of types", "checking", 60),
            ("Collecting page data", "collecting", 70),
            ("Finalizing page optimization", "finalizing", 95),
            ("Route (app)", "complete", 100),
        ];
        table
            .iter()
            .find(|(marker, _, _)| line.contains(marker))
            .map(|(_, stage, progress)| Progress::new(*stage, *progress, line))
    }
}

/// Markers printed by common deploy CLIs (vercel, netlify, wrangler, rsync).
pub struct DeployExtractor;

impl ProgressExtractor for DeployExtractor {
    fn name(&self) -> &'static str {
        "deploy"
    }

    fn extract(&self, chunk: &str) -> Option<Progress> {
        let line = chunk.trim();
        let lower = line.to_lowercase();
        if lower.contains("deployment complete")
            || lower.contains("deployed to")
            || lower.contains("published")
            || lower.starts_with("production:")
        {
            return Some(Progress::new("complete", 100, line));
        }
        if lower.contains("uploading") || lower.contains("uploaded") {
            return Some(Progress::new("uploading", 50, line));
        }
        if lower.contains("deploying") {
            return Some(Progress::new("deploying", 30, line));
        }
        PercentExtractor
            .extract(line)
            .map(|p| Progress::new("uploading", p.progress, p.message))
    }
}

/// Tries a tool-specific extractor first, then the generic percentage one.
pub struct WithFallback {
    primary: Arc<dyn ProgressExtractor>,
    fallback: Arc<dyn ProgressExtractor>,
}

impl ProgressExtractor for WithFallback {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    fn extract(&self, chunk: &str) -> Option<Progress> {
        self.primary
            .extract(chunk)
            .or_else(|| self.fallback.extract(chunk))
    }
}

/// Extractors keyed by build-tool family.
#[derive(Clone)]
pub struct ExtractorRegistry {
    by_tool: HashMap<String, Arc<dyn ProgressExtractor>>,
    fallback: Arc<dyn ProgressExtractor>,
    deploy: Arc<dyn ProgressExtractor>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            by_tool: HashMap::new(),
            fallback: Arc::new(PercentExtractor),
            deploy: Arc::new(DeployExtractor),
        };
        registry.register("vite", Arc::new(ViteExtractor));
        registry.register("webpack", Arc::new(WebpackExtractor));
        registry.register("next", Arc::new(NextExtractor));
        registry
    }
}

impl ExtractorRegistry {
    /// Add or replace the extractor for a tool family.
    pub fn register(&mut self, tool: &str, extractor: Arc<dyn ProgressExtractor>) {
        let combined: Arc<dyn ProgressExtractor> = Arc::new(WithFallback {
            primary: extractor,
            fallback: Arc::clone(&self.fallback),
        });
        self.by_tool.insert(tool.to_lowercase(), combined);
    }

    pub fn for_tool(&self, tool: Option<&str>) -> Arc<dyn ProgressExtractor> {
        tool.and_then(|t| self.by_tool.get(&t.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn for_deploy(&self) -> Arc<dyn ProgressExtractor> {
        Arc::clone(&self.deploy)
    }

    pub fn tools(&self) -> Vec<String> {
        let mut tools: Vec<_> = self.by_tool.keys().cloned().collect();
        tools.sort();
        tools
    }
}

/// Guess the build-tool family from config files in the project directory.
pub fn detect_tool(project_path: &Path) -> Option<&'static str> {
    let candidates: [(&str, &[&str]); 3] = [
        ("vite", &["vite.config.ts", "vite.config.js", "vite.config.mjs", "vite.config.mts"]),
        ("next", &["next.config.js", "next.config.mjs", "next.config.ts"]),
        ("webpack", &["webpack.config.js", "webpack.config.ts", "webpack.config.cjs"]),
    ];
    candidates
        .iter()
        .find(|(_, files)| files.iter().any(|f| project_path.join(f).exists()))
        .map(|(tool, _)| *tool)
}
