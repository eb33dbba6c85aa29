use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::orchestration::RunOptions;
use crate::pipeline::Step;
use crate::{glog_debug, Error, Result};

pub const CONFIG_FILE: &str = "gantry.toml";

/// Project configuration, read from `gantry.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minify scripts, styles and pages during `useref`.
    pub production: bool,
    pub build: BuildConfig,
    pub orchestrator: OrchestratorConfig,
    pub serve: ServeConfig,
    pub deploy: DeployConfig,
    /// Shell command per step name, e.g. `style = "sass {cwd}:{dest}"`.
    pub commands: BTreeMap<String, String>,
    /// Template data handed to `page` (site menus, titles, ...).
    #[serde(skip_serializing_if = "toml::Table::is_empty")]
    pub data: toml::Table,
    /// Directory the configured paths are relative to.
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub src: String,
    pub dist: String,
    pub temp: String,
    pub public: String,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub styles: String,
    pub scripts: String,
    pub pages: String,
    pub images: String,
    pub fonts: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    pub fail_fast: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Port for `dist-serve`.
    pub port: u16,
    /// Open a browser when `dist-serve` starts.
    pub open: bool,
    /// Port for the development server started by `serve`.
    pub dev_port: u16,
    /// Quiet period before a burst of file changes is acted on.
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub branch: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            production: false,
            build: BuildConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            serve: ServeConfig::default(),
            deploy: DeployConfig::default(),
            commands: BTreeMap::new(),
            data: toml::Table::new(),
            root: PathBuf::from("."),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            src: "src".to_string(),
            dist: "dist".to_string(),
            temp: "temp".to_string(),
            public: "public".to_string(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            styles: "assets/styles/*.scss".to_string(),
            scripts: "assets/scripts/*.js".to_string(),
            pages: "*.html".to_string(),
            images: "assets/images/**".to_string(),
            fonts: "assets/fonts/**".to_string(),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: 2080,
            open: false,
            dev_port: 8080,
            debounce_ms: 100,
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            branch: "gh-pages".to_string(),
        }
    }
}

impl Config {
    /// Load `gantry.toml` from the current directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Load a config file; a missing file yields the defaults.
    ///
    /// Paths in the file are relative to the directory containing it.
    pub fn load_from(path: &Path) -> Result<Self> {
        glog_debug!("Config::load_from path={}", path.display());
        let root = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut config: Self = if path.exists() {
            toml::from_str(&fs::read_to_string(path)?)?
        } else {
            glog_debug!("Config file not found, using defaults");
            Self::default()
        };
        config.root = root;
        config.validate()?;

        glog_debug!(
            "Config loaded: production={}, commands={:?}, orchestrator={:?}",
            config.production,
            config.commands.keys().collect::<Vec<_>>(),
            config.orchestrator
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        glog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject settings that would only fail later, mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_parallel == Some(0) {
            return Err(Error::Validation(
                "orchestrator.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.task_timeout_secs == Some(0) {
            return Err(Error::Validation(
                "orchestrator.task_timeout_secs must be at least 1".to_string(),
            ));
        }
        for step in self.commands.keys() {
            Step::from_str(step).map_err(|_| {
                Error::Validation(format!("commands.{} does not name a step", step))
            })?;
        }
        let paths = &self.build.paths;
        for pattern in [
            &paths.styles,
            &paths.scripts,
            &paths.pages,
            &paths.images,
            &paths.fonts,
        ] {
            glob::Pattern::new(pattern)?;
        }
        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions::from(&self.orchestrator)
    }

    /// Configured command for `step`, if any.
    pub fn command(&self, step: Step) -> Option<&str> {
        self.commands.get(step.name()).map(String::as_str)
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join(&self.build.src)
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.root.join(&self.build.dist)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(&self.build.temp)
    }

    pub fn public_dir(&self) -> PathBuf {
        self.root.join(&self.build.public)
    }
}
