//! Collaborators perform the work behind each step.
//!
//! The orchestrator never looks inside a step: it hands a [`StepJob`] to a
//! [`Collaborator`] and waits for the result. [`Toolchain`] is the default
//! collaborator; it runs the shell command configured for a step, falls back
//! to a native built-in, or skips the step.

use std::collections::BTreeMap;
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;

use crate::config::Config;
use crate::core::TaskResult;
use crate::error::TaskError;
use crate::pipeline::builtin;
use crate::pipeline::steps::{Step, StepJob};
use crate::{glog, glog_debug, glog_trace, glog_warn};

/// Performs build steps.
pub trait Collaborator: Send + Sync + 'static {
    fn invoke(&self, job: StepJob) -> BoxFuture<'static, TaskResult>;
}

/// Shell command template for one step.
///
/// `{step}`, `{cwd}`, `{dest}`, `{patterns}`, `{production}` and every key of
/// the job's options (`{port}`, `{branch}`, ...) are replaced by shell-quoted
/// values. The same values are exported as `GANTRY_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    template: String,
}

impl ShellCommand {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Command line with placeholders filled in from `job`.
    pub fn render(&self, job: &StepJob) -> String {
        let mut rendered = expand_patterns(&self.template, job);
        for (key, value) in placeholders(job) {
            rendered = rendered.replace(&format!("{{{}}}", key), &shell_quote(&value));
        }
        rendered
    }

    fn command(&self, job: &StepJob) -> (String, Command) {
        let line = self.render(job);
        let env = environment(job);
        glog_trace!("{} environment: {:?}", job.step, env);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&line)
            .current_dir(&job.root)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        (line, cmd)
    }

    /// Run to completion, capturing output. A non-zero exit fails the step.
    pub async fn run(&self, job: &StepJob) -> TaskResult {
        let (line, mut cmd) = self.command(job);
        glog_debug!("{}: running `{}`", job.step, line);

        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            glog_debug!("{} stdout: {}", job.step, stdout.trim());
        }

        if !output.status.success() {
            return Err(TaskError::Command {
                command: line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Run with inherited stdout and stderr, for long-lived servers.
    pub async fn run_attached(&self, job: &StepJob) -> TaskResult {
        let (line, mut cmd) = self.command(job);
        glog!("{}: starting `{}`", job.step, line);

        let status = cmd
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if !status.success() {
            return Err(TaskError::Command {
                command: line,
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

fn placeholders(job: &StepJob) -> Vec<(String, String)> {
    let mut values = vec![
        ("step".to_string(), job.step.name().to_string()),
        ("cwd".to_string(), job.cwd.display().to_string()),
        (
            "dest".to_string(),
            job.dest
                .as_ref()
                .map(|dest| dest.display().to_string())
                .unwrap_or_default(),
        ),
        ("production".to_string(), job.production.to_string()),
    ];
    values.extend(job.options.iter().map(|(k, v)| (k.clone(), v.clone())));
    values
}

fn environment(job: &StepJob) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = placeholders(job)
        .into_iter()
        .map(|(key, value)| (env_name(&key), value))
        .collect();
    env.insert("GANTRY_PATTERNS".to_string(), job.patterns.join("\n"));
    env
}

fn env_name(key: &str) -> String {
    format!("GANTRY_{}", key.to_uppercase().replace('-', "_"))
}

// `{patterns}` expands to one word per pattern.
fn expand_patterns(template: &str, job: &StepJob) -> String {
    let words = job
        .patterns
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    template.replace("{patterns}", &words)
}

/// Single-quote `value` for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Default collaborator: configured commands, then built-ins, then skip.
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    commands: BTreeMap<Step, ShellCommand>,
}

impl Toolchain {
    pub fn new(commands: BTreeMap<Step, ShellCommand>) -> Self {
        Self { commands }
    }

    /// Commands from the `[commands]` table. Unknown keys are rejected by
    /// [`Config::validate`], so they are skipped here.
    pub fn from_config(config: &Config) -> Self {
        let commands = Step::ALL
            .into_iter()
            .filter_map(|step| {
                config
                    .command(step)
                    .map(|template| (step, ShellCommand::new(template)))
            })
            .collect();
        Self::new(commands)
    }

    pub fn command(&self, step: Step) -> Option<&ShellCommand> {
        self.commands.get(&step)
    }
}

impl Collaborator for Toolchain {
    fn invoke(&self, job: StepJob) -> BoxFuture<'static, TaskResult> {
        let command = self.commands.get(&job.step).cloned();
        async move {
            match (command, job.step) {
                (Some(command), step) if step.is_server() => command.run_attached(&job).await,
                (Some(command), _) => command.run(&job).await,
                (None, Step::Clean) => builtin::clean(&job).await,
                (None, Step::Extra) => builtin::copy_tree(&job).await,
                (None, Step::Serve) => {
                    glog_warn!("No dev server command configured; watching only");
                    std::future::pending().await
                }
                (None, step) => {
                    glog_warn!("No command configured for `{}`, skipping", step);
                    Ok(())
                }
            }
        }
        .boxed()
    }
}
