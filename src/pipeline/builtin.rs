//! Native implementations for steps that need no external tool.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path};

use glob::Pattern;
use walkdir::WalkDir;

use crate::core::TaskResult;
use crate::error::TaskError;
use crate::pipeline::steps::{StepJob, MATCH_OPTIONS};
use crate::util::blocking;
use crate::{glog_debug, Error, Result};

/// Remove every directory named in `job.patterns`, relative to `job.cwd`.
///
/// Directories that do not exist are ignored.
pub async fn clean(job: &StepJob) -> TaskResult {
    for dir in &job.patterns {
        if !is_plain_relative(Path::new(dir)) {
            return Err(TaskError::msg(format!(
                "refusing to remove `{}`: not a directory below the project root",
                dir
            )));
        }
        let target = job.cwd.join(dir);
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => glog_debug!("clean: removed {}", target.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                glog_debug!("clean: {} already absent", target.display())
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// Non-empty, relative, and free of `..`/`.`.
fn is_plain_relative(path: &Path) -> bool {
    let mut components = path.components().peekable();
    components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
}

/// Copy the files under `job.cwd` that match `job.patterns` into `job.dest`,
/// keeping their relative paths.
pub async fn copy_tree(job: &StepJob) -> TaskResult {
    let Some(dest) = job.dest.clone() else {
        return Err(TaskError::msg(format!("{} has no destination", job.step)));
    };
    let src = job.cwd.clone();
    let patterns = job
        .patterns
        .iter()
        .map(|p| Pattern::new(p))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)?;

    let copied = blocking(move || copy_matching(&src, &dest, &patterns)).await?;
    glog_debug!("{}: copied {} files", job.step, copied);
    Ok(())
}

fn copy_matching(src: &Path, dest: &Path, patterns: &[Pattern]) -> Result<usize> {
    if !src.is_dir() {
        glog_debug!("copy: {} does not exist, nothing to copy", src.display());
        return Ok(0);
    }

    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Validation(e.to_string()))?;
        if !patterns
            .iter()
            .any(|p| p.matches_path_with(relative, MATCH_OPTIONS))
        {
            continue;
        }

        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        copied += 1;
    }
    Ok(copied)
}
