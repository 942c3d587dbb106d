//! Build executor — brings the working copy up to date and runs the
//! provisioning command, streaming process output as it arrives.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::models::push::RepoSlug;
use crate::services::event_store::EventHandle;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {}", describe_exit(.code))]
    Exit { command: String, code: Option<i32> },
    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

/// What a build is about: which repository, at which revision.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub slug: RepoSlug,
    pub revision: String,
}

/// Destination for process output. Each call is one fragment.
pub trait OutputSink: Send + Sync {
    fn write(&self, fragment: &str);
}

impl OutputSink for EventHandle {
    fn write(&self, fragment: &str) {
        if let Err(e) = self.append_output(fragment) {
            tracing::debug!(event_id = self.id(), "Dropping output fragment: {e}");
        }
    }
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Clone the repository if there is no working copy yet, pull otherwise.
    async fn sync(&self, job: &BuildJob, output: &dyn OutputSink) -> Result<(), ExecutorError>;

    /// Run the provisioning step inside the working copy.
    async fn provision(&self, job: &BuildJob, output: &dyn OutputSink)
        -> Result<(), ExecutorError>;
}

/// Runs `git` and the configured shell command as child processes.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    workdir: PathBuf,
    provision_command: String,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(workdir: impl Into<PathBuf>, provision_command: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            provision_command: provision_command.into(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Local working copy of a repository.
    pub fn working_copy(&self, slug: &RepoSlug) -> PathBuf {
        self.workdir.join(&slug.owner).join(&slug.name)
    }

    async fn run(
        &self,
        mut command: Command,
        display: String,
        output: &dyn OutputSink,
    ) -> Result<(), ExecutorError> {
        output.write(&format!("$ {display}\n"));

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            command: display.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let status = tokio::time::timeout(self.timeout, async {
            tokio::try_join!(forward(stdout, output), forward(stderr, output))?;
            child.wait().await
        })
        .await
        .map_err(|_| ExecutorError::Timeout {
            command: display.clone(),
            timeout: self.timeout,
        })??;

        if status.success() {
            Ok(())
        } else {
            Err(ExecutorError::Exit {
                command: display,
                code: status.code(),
            })
        }
    }
}

#[async_trait]
impl BuildExecutor for CommandExecutor {
    async fn sync(&self, job: &BuildJob, output: &dyn OutputSink) -> Result<(), ExecutorError> {
        let path = self.working_copy(&job.slug);

        if tokio::fs::try_exists(path.join(".git")).await.unwrap_or(false) {
            let mut command = Command::new("git");
            command.args(["pull", "--ff-only"]).current_dir(&path);
            return self.run(command, "git pull --ff-only".to_string(), output).await;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let url = job.slug.ssh_url();
        let mut command = Command::new("git");
        command.arg("clone").arg(&url).arg(&path);
        self.run(command, format!("git clone {url}"), output).await
    }

    async fn provision(
        &self,
        job: &BuildJob,
        output: &dyn OutputSink,
    ) -> Result<(), ExecutorError> {
        let path = self.working_copy(&job.slug);
        let mut command = Command::new("bash");
        command
            .args(["-c", self.provision_command.as_str()])
            .current_dir(existing_dir(&path, &self.workdir))
            .env("CI", "true")
            .env("HOOKS_REPO", job.slug.to_string())
            .env("HOOKS_REVISION", &job.revision);
        self.run(command, self.provision_command.clone(), output).await
    }
}

fn existing_dir<'a>(preferred: &'a Path, fallback: &'a Path) -> &'a Path {
    if preferred.is_dir() {
        preferred
    } else {
        fallback
    }
}

/// Copy a child pipe into `output` line by line until EOF. Bytes that are
/// not valid UTF-8 are replaced, never rejected.
async fn forward<R>(pipe: Option<R>, output: &dyn OutputSink) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(());
    };
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        output.write(&String::from_utf8_lossy(&line));
    }
}
