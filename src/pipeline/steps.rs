//! Atomic build steps and the job each one hands to its collaborator.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use glob::MatchOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::core::Task;
use crate::glog_warn;
use crate::pipeline::collaborator::Collaborator;

/// How step patterns match paths: `*` stays within one directory and no
/// wildcard matches a leading dot.
pub const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// One atomic step of the site pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    /// Remove the dist and temp directories.
    Clean,
    StyleLint,
    ScriptLint,
    /// Compile styles into temp.
    Style,
    /// Transpile scripts into temp.
    Script,
    /// Render page templates into temp.
    Page,
    /// Optimize images into dist.
    Image,
    /// Optimize fonts into dist.
    Font,
    /// Copy public files into dist.
    Extra,
    /// Inline the assets referenced by pages in temp, minify in production,
    /// write to dist.
    Useref,
    /// Development server with file watching.
    Serve,
    /// Static server over dist.
    DistServe,
    /// Publish dist.
    Upload,
    /// Ask the development server to reload connected browsers.
    Reload,
}

impl Step {
    pub const ALL: [Step; 14] = [
        Step::Clean,
        Step::StyleLint,
        Step::ScriptLint,
        Step::Style,
        Step::Script,
        Step::Page,
        Step::Image,
        Step::Font,
        Step::Extra,
        Step::Useref,
        Step::Serve,
        Step::DistServe,
        Step::Upload,
        Step::Reload,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Clean => "clean",
            Step::StyleLint => "style-lint",
            Step::ScriptLint => "script-lint",
            Step::Style => "style",
            Step::Script => "script",
            Step::Page => "page",
            Step::Image => "image",
            Step::Font => "font",
            Step::Extra => "extra",
            Step::Useref => "useref",
            Step::Serve => "serve",
            Step::DistServe => "dist-serve",
            Step::Upload => "upload",
            Step::Reload => "reload",
        }
    }

    /// Steps that run a server until interrupted rather than finishing.
    pub fn is_server(&self) -> bool {
        matches!(self, Step::Serve | Step::DistServe)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.name() == s)
            .ok_or_else(|| format!("unknown step: {}", s))
    }
}

/// Everything a collaborator needs to perform one step, and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepJob {
    pub step: Step,
    /// Project root; commands run here.
    pub root: PathBuf,
    /// Directory the patterns are relative to.
    pub cwd: PathBuf,
    /// Input globs. For `clean`, the directories to remove.
    pub patterns: Vec<String>,
    /// Output directory, for steps that write files.
    pub dest: Option<PathBuf>,
    pub production: bool,
    /// Step-specific settings (port, branch, ...).
    pub options: BTreeMap<String, String>,
}

impl StepJob {
    fn new(step: Step, cwd: PathBuf, config: &Config) -> Self {
        Self {
            step,
            root: config.root.clone(),
            cwd,
            patterns: Vec::new(),
            dest: None,
            production: config.production,
            options: BTreeMap::new(),
        }
    }

    fn pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_string());
        self
    }

    fn dest(mut self, dest: PathBuf) -> Self {
        self.dest = Some(dest);
        self
    }

    fn option(mut self, key: &str, value: impl ToString) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Build the job for `step` from the project configuration.
    pub fn for_step(step: Step, config: &Config) -> Self {
        let paths = &config.build.paths;
        let src = config.src_dir();
        let temp = config.temp_dir();
        let dist = config.dist_dir();

        match step {
            Step::Clean => Self::new(step, config.root.clone(), config)
                .pattern(&config.build.dist)
                .pattern(&config.build.temp),
            Step::StyleLint => Self::new(step, src, config).pattern(&paths.styles),
            Step::ScriptLint => Self::new(step, src, config).pattern(&paths.scripts),
            Step::Style => Self::new(step, src, config).pattern(&paths.styles).dest(temp),
            Step::Script => Self::new(step, src, config).pattern(&paths.scripts).dest(temp),
            Step::Page => Self::new(step, src, config)
                .pattern(&paths.pages)
                .dest(temp)
                .option("data", page_data(config)),
            Step::Image => Self::new(step, src, config).pattern(&paths.images).dest(dist),
            Step::Font => Self::new(step, src, config).pattern(&paths.fonts).dest(dist),
            Step::Extra => Self::new(step, config.public_dir(), config)
                .pattern("**")
                .dest(dist),
            Step::Useref => {
                let search = join_paths([
                    temp.clone(),
                    config.root.clone(),
                    config.root.join(".."),
                ]);
                Self::new(step, temp, config)
                    .pattern(&paths.pages)
                    .dest(dist)
                    .option("search_path", search)
            }
            Step::Serve => {
                let base_dirs = join_paths([temp, src, config.public_dir()]);
                Self::new(step, config.root.clone(), config)
                    .option("port", config.serve.dev_port)
                    .option("open", false)
                    .option("base_dirs", base_dirs)
                    .option("routes", "/node_modules=node_modules")
            }
            Step::DistServe => Self::new(step, dist, config)
                .option("port", config.serve.port)
                .option("open", config.serve.open),
            Step::Upload => Self::new(step, dist, config)
                .pattern("**")
                .option("branch", &config.deploy.branch),
            Step::Reload => Self::new(step, config.root.clone(), config)
                .option("port", config.serve.dev_port),
        }
    }
}

fn join_paths<const N: usize>(paths: [PathBuf; N]) -> String {
    std::env::join_paths(paths)
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Template data for `page`, as JSON: the `[data]` table, the project's
/// `package.json` under `pkg`, and the build `date`. Keys set in `[data]` win.
fn page_data(config: &Config) -> String {
    let mut data: serde_json::Map<String, Value> = config
        .data
        .iter()
        .filter_map(|(key, value)| Some((key.clone(), serde_json::to_value(value).ok()?)))
        .collect();

    let manifest = config.root.join("package.json");
    if manifest.is_file() {
        match std::fs::read_to_string(&manifest)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<Value>(&text).map_err(|e| e.to_string()))
        {
            Ok(pkg) => {
                data.entry("pkg").or_insert(pkg);
            }
            Err(e) => glog_warn!("page: ignoring {}: {}", manifest.display(), e),
        }
    }

    data.entry("date")
        .or_insert_with(|| Value::String(chrono::Local::now().to_rfc3339()));
    Value::Object(data).to_string()
}

/// Atomic task that hands `job` to `collaborator`.
pub fn step_task(job: StepJob, collaborator: Arc<dyn Collaborator>) -> Task {
    let name = job.step.name();
    Task::future(name, move |_| collaborator.invoke(job.clone()))
}
