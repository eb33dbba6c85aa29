//! Development server with rebuild-on-change.
//!
//! `serve` starts the dev-server step and watches the source and public
//! directories. Changed styles, scripts and pages re-run their compile step
//! through a fresh orchestrator run and then trigger `reload`; other source
//! or public changes trigger `reload` directly.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::core::{parallel, Task, TaskContext, TaskResult};
use crate::error::TaskError;
use crate::orchestration::{Orchestrator, RunOptions};
use crate::pipeline::collaborator::Collaborator;
use crate::pipeline::steps::{step_task, Step, StepJob, MATCH_OPTIONS};
use crate::util::AbortOnDrop;
use crate::{glog, glog_debug, glog_error, glog_trace, Result};

/// What a changed file calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    Rebuild(Step),
    Reload,
}

/// Maps changed paths to the work they trigger.
#[derive(Debug, Clone)]
pub struct WatchRules {
    src: Vec<PathBuf>,
    public: Vec<PathBuf>,
    rebuild: Vec<(Pattern, Step)>,
}

impl WatchRules {
    pub fn new(config: &Config) -> Result<Self> {
        let paths = &config.build.paths;
        Ok(Self {
            src: with_canonical(config.src_dir()),
            public: with_canonical(config.public_dir()),
            rebuild: vec![
                (Pattern::new(&paths.styles)?, Step::Style),
                (Pattern::new(&paths.scripts)?, Step::Script),
                (Pattern::new(&paths.pages)?, Step::Page),
            ],
        })
    }

    /// Directories to watch recursively.
    pub fn roots(&self) -> Vec<&Path> {
        fn first(dirs: &[PathBuf]) -> Option<&Path> {
            dirs.first().map(PathBuf::as_path)
        }
        first(&self.src).into_iter().chain(first(&self.public)).collect()
    }

    pub fn classify(&self, path: &Path) -> Option<Change> {
        if let Some(relative) = strip_any(path, &self.src) {
            let step = self
                .rebuild
                .iter()
                .find(|(pattern, _)| pattern.matches_path_with(relative, MATCH_OPTIONS))
                .map(|(_, step)| *step);
            return Some(step.map_or(Change::Reload, Change::Rebuild));
        }
        strip_any(path, &self.public).map(|_| Change::Reload)
    }
}

fn with_canonical(dir: PathBuf) -> Vec<PathBuf> {
    match dir.canonicalize() {
        Ok(canonical) if canonical != dir => vec![dir, canonical],
        _ => vec![dir],
    }
}

fn strip_any<'a>(path: &'a Path, roots: &[PathBuf]) -> Option<&'a Path> {
    roots.iter().find_map(|root| path.strip_prefix(root).ok())
}

/// Development server session.
pub struct DevServer {
    config: Config,
    rules: WatchRules,
    collaborator: Arc<dyn Collaborator>,
    options: RunOptions,
}

impl DevServer {
    pub fn new(config: &Config, collaborator: Arc<dyn Collaborator>) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            rules: WatchRules::new(config)?,
            collaborator,
            options: config.run_options(),
        })
    }

    /// Serve until the server exits, Ctrl-C, or the run is cancelled.
    pub async fn run(&self, ctx: &TaskContext) -> TaskResult {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = self.watch(tx).map_err(TaskError::from)?;

        let job = StepJob::for_step(Step::Serve, &self.config);
        // Dropping the guard kills the server process.
        let mut server = AbortOnDrop(tokio::spawn(self.collaborator.invoke(job)));
        let debounce = Duration::from_millis(self.config.serve.debounce_ms);

        loop {
            tokio::select! {
                joined = server.handle() => {
                    break joined.unwrap_or_else(|e| Err(TaskError::msg(e.to_string())));
                }
                _ = tokio::signal::ctrl_c() => {
                    glog!("serve: interrupted");
                    break Ok(());
                }
                _ = ctx.cancelled() => break Err(TaskError::Cancelled),
                Some(path) = rx.recv() => {
                    let mut changed = BTreeSet::from([path]);
                    while let Ok(Some(path)) = tokio::time::timeout(debounce, rx.recv()).await {
                        changed.insert(path);
                    }
                    self.apply(&changed).await;
                }
            }
        }
    }

    fn watch(&self, tx: mpsc::UnboundedSender<PathBuf>) -> Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    match event.kind {
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {}
                        _ => return,
                    }
                    glog_trace!("watch: {:?} {:?}", event.kind, event.paths);
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            },
            notify::Config::default(),
        )?;

        for root in self.rules.roots() {
            if root.exists() {
                watcher.watch(root, RecursiveMode::Recursive)?;
                glog_debug!("serve: watching {}", root.display());
            }
        }
        Ok(watcher)
    }

    /// Changes implied by `paths`, in step order, `Reload` last.
    pub fn changes<'a, I>(&self, paths: I) -> BTreeSet<Change>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        paths
            .into_iter()
            .filter_map(|path| self.rules.classify(path))
            .collect()
    }

    /// Rebuild what `paths` affect, then reload.
    ///
    /// Returns false when a rebuild failed; the browser is not reloaded then.
    pub async fn apply(&self, paths: &BTreeSet<PathBuf>) -> bool {
        let changes = self.changes(paths);
        if changes.is_empty() {
            return true;
        }

        let mut steps: Vec<Task> = changes
            .iter()
            .filter_map(|change| match change {
                Change::Rebuild(step) => Some(step_task(
                    StepJob::for_step(*step, &self.config),
                    Arc::clone(&self.collaborator),
                )),
                Change::Reload => None,
            })
            .collect();

        if !steps.is_empty() {
            let task = if steps.len() == 1 {
                steps.remove(0)
            } else {
                parallel(steps).named("rebuild")
            };
            glog!("serve: rebuilding {}", task.label());
            match Orchestrator::new(self.options.clone()).run(&task).await {
                Ok(report) if report.is_success() => {}
                Ok(report) => {
                    if let Some(failure) = &report.failure {
                        glog_error!("serve: rebuild failed: {}", failure);
                        eprintln!("Rebuild failed: {}", failure);
                    }
                    return false;
                }
                Err(e) => {
                    glog_error!("serve: rebuild rejected: {}", e);
                    return false;
                }
            }
        }

        let reload = StepJob::for_step(Step::Reload, &self.config);
        if let Err(e) = self.collaborator.invoke(reload).await {
            glog_error!("serve: reload failed: {}", e);
            return false;
        }
        true
    }
}

/// The `serve` step: dev server plus watcher.
pub fn serve_task(config: &Config, collaborator: Arc<dyn Collaborator>) -> Result<Task> {
    let server = Arc::new(DevServer::new(config, collaborator)?);
    Ok(Task::future(Step::Serve.name(), move |ctx| {
        let server = Arc::clone(&server);
        async move { server.run(&ctx).await }
    }))
}
