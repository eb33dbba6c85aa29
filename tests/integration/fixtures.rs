//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Atomic tasks that record what ran, and when
//! - A collaborator that records step jobs instead of running tools
//! - Temporary site directories

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tempfile::TempDir;

use gantry::config::Config;
use gantry::core::{Task, TaskResult};
use gantry::pipeline::{Collaborator, Step, StepJob};
use gantry::TaskError;

/// Shared log of task invocations, in the order they happened.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Number of times `name` ran.
    pub fn count(&self, name: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == name).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }
}

/// Sync task that appends its name to `journal`.
pub fn recording(name: &str, journal: &Journal) -> Task {
    let journal = journal.clone();
    let entry = name.to_string();
    Task::sync(name, move |_| {
        journal.push(entry.clone());
        Ok(())
    })
}

/// Async task that logs `name:start`, sleeps, then logs `name:end`.
pub fn delayed(name: &str, delay_ms: u64, journal: &Journal) -> Task {
    let journal = journal.clone();
    let entry = name.to_string();
    Task::future(name, move |_| {
        let journal = journal.clone();
        let entry = entry.clone();
        async move {
            journal.push(format!("{}:start", entry));
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            journal.push(format!("{}:end", entry));
            Ok(())
        }
    })
}

/// Async task that fails with `message` after `delay_ms`.
pub fn failing(name: &str, delay_ms: u64, message: &str) -> Task {
    let message = message.to_string();
    Task::future(name, move |_| {
        let message = message.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Err(TaskError::msg(message))
        }
    })
}

/// Tracks how many tasks are inside their body at once.
#[derive(Clone, Default)]
pub struct Gauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Async task that holds the gauge for `delay_ms`.
    pub fn task(&self, name: &str, delay_ms: u64) -> Task {
        let gauge = self.clone();
        Task::future(name, move |_| {
            let gauge = gauge.clone();
            async move {
                let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                gauge.current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }
}

/// Collaborator that records every job and never touches the filesystem.
#[derive(Default)]
pub struct RecordingCollaborator {
    jobs: Mutex<Vec<StepJob>>,
    failing: HashSet<Step>,
}

impl RecordingCollaborator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Collaborator for which every step in `steps` fails.
    pub fn failing(steps: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(Vec::new()),
            failing: steps.iter().copied().collect(),
        })
    }

    pub fn jobs(&self) -> Vec<StepJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<Step> {
        self.jobs().into_iter().map(|job| job.step).collect()
    }
}

impl Collaborator for RecordingCollaborator {
    fn invoke(&self, job: StepJob) -> BoxFuture<'static, TaskResult> {
        let step = job.step;
        self.jobs.lock().unwrap().push(job);
        let result = if self.failing.contains(&step) {
            Err(TaskError::msg(format!("{} broke", step)))
        } else {
            Ok(())
        };
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            result
        }
        .boxed()
    }
}

/// A temporary site: `src/`, `public/` and a config rooted there.
pub struct TestSite {
    /// The temporary directory containing the site.
    pub temp_dir: TempDir,
    pub config: Config,
}

impl TestSite {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();

        std::fs::create_dir_all(root.join("src/assets/styles")).unwrap();
        std::fs::write(root.join("src/index.html"), "<html></html>\n").unwrap();
        std::fs::write(root.join("src/assets/styles/main.scss"), "body {}\n").unwrap();
        std::fs::create_dir_all(root.join("public/icons")).unwrap();
        std::fs::write(root.join("public/favicon.ico"), "ico").unwrap();
        std::fs::write(root.join("public/icons/logo.svg"), "<svg/>").unwrap();

        let config = Config {
            root,
            ..Config::default()
        };
        Self { temp_dir, config }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }
}
