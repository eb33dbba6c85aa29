//! The static-site pipeline: atomic steps wired into entry points.
//!
//! Every step is registered under its name, then the entry points are
//! composed from those names:
//!
//! ```text
//! lint    = parallel(style-lint, script-lint)
//! compile = parallel(style, script, page)
//! build   = series(clean, parallel(series(compile, useref), image, font, extra))
//! start   = series(build, dist-serve)
//! deploy  = series(build, upload)
//! ```

pub mod builtin;
pub mod collaborator;
pub mod serve;
pub mod steps;

use std::sync::Arc;

pub use collaborator::{Collaborator, ShellCommand, Toolchain};
pub use serve::{Change, DevServer, WatchRules};
pub use steps::{step_task, Step, StepJob};

use crate::config::Config;
use crate::core::{Compose, Registry, Task};
use crate::{glog_debug, Result};

/// Tasks meant to be run from the command line.
pub const ENTRY_POINTS: [&str; 7] = [
    "clean", "lint", "build", "serve", "compile", "start", "deploy",
];

/// Registry of steps and entry points for one project.
#[derive(Debug)]
pub struct Pipeline {
    registry: Registry,
}

impl Pipeline {
    /// Pipeline whose steps are performed by the configured [`Toolchain`].
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config, Arc::new(Toolchain::from_config(config)))
    }

    pub fn new(config: &Config, collaborator: Arc<dyn Collaborator>) -> Result<Self> {
        let mut registry = Registry::new();

        for step in Step::ALL {
            let task = match step {
                Step::Serve => serve::serve_task(config, Arc::clone(&collaborator))?,
                _ => step_task(StepJob::for_step(step, config), Arc::clone(&collaborator)),
            };
            registry.register(step.name(), task)?;
        }

        registry.parallel("lint", &["style-lint", "script-lint"])?;
        registry.parallel("compile", &["style", "script", "page"])?;
        registry.compose(
            "build",
            Compose::series([
                Compose::task("clean"),
                Compose::parallel([
                    Compose::series([Compose::task("compile"), Compose::task("useref")]),
                    Compose::task("image"),
                    Compose::task("font"),
                    Compose::task("extra"),
                ]),
            ]),
        )?;
        registry.series("start", &["build", "dist-serve"])?;
        registry.series("deploy", &["build", "upload"])?;
        registry.validate()?;

        glog_debug!("Pipeline ready: {:?}", registry);
        Ok(Self { registry })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Task tree for `name`, which may be an entry point or a single step.
    pub fn resolve(&self, name: &str) -> Result<Task> {
        self.registry.resolve(name)
    }

    pub fn describe(&self, name: &str) -> Result<String> {
        self.registry.describe(name)
    }

    pub fn entry_points(&self) -> &'static [&'static str] {
        &ENTRY_POINTS
    }
}
