//! External stage execution with skip-if-output-exists semantics.
//!
//! Every expensive operation in the pipeline is an external process described
//! by a typed [`StageInvocation`] (never a shell string). The executor checks
//! for the stage's output artifact before spawning anything; an existing
//! artifact is a cache hit and the invocation is skipped. The filesystem
//! namespace of artifact paths *is* the cache — another process writing under
//! the same naming convention concurrently is a data race this design does not
//! protect against.

use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::error::{SweepError, SweepResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Render,
    Join,
    Equalize,
    Dice,
    Colormap,
    MinMax,
    NanStrip,
    Quantize,
    Encode,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Render => "render",
            Self::Join => "join",
            Self::Equalize => "equalize",
            Self::Dice => "dice",
            Self::Colormap => "colormap",
            Self::MinMax => "minmax",
            Self::NanStrip => "nan-strip",
            Self::Quantize => "quantize",
            Self::Encode => "encode",
        };
        f.write_str(name)
    }
}

/// A fully-formed external command: program plus ordered argv.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl StageInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    /// One-line rendering for logs and error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }
}

/// A stage output on disk, with a note of whether it was reused from cache.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub path: PathBuf,
    pub reused: bool,
}

/// Caller-initiated cancellation shared with long-running stages.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution backend for external stages.
///
/// `run` produces a file and skips the invocation when the file already
/// exists. `capture` returns the process's stdout and is never cached; the
/// aggregation scan relies on that to always reflect the current artifact set.
pub trait StageExecutor {
    fn run(
        &mut self,
        stage: StageKind,
        invocation: &StageInvocation,
        output: &Path,
    ) -> SweepResult<Artifact>;

    fn capture(&mut self, stage: StageKind, invocation: &StageInvocation) -> SweepResult<String>;
}

/// The real backend: spawns the external process synchronously, polls for
/// cancellation, and surfaces abnormal termination with the command line and
/// captured stderr. Never retries.
#[derive(Clone, Debug, Default)]
pub struct ProcessExecutor {
    pub cancel: CancelToken,
}

impl ProcessExecutor {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    fn execute(
        &self,
        stage: StageKind,
        invocation: &StageInvocation,
        capture_stdout: bool,
    ) -> SweepResult<String> {
        if self.cancel.is_cancelled() {
            return Err(SweepError::Cancelled {
                stage,
                command: invocation.command_line(),
            });
        }

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SweepError::ExternalFailure {
                stage,
                command: invocation.command_line(),
                status: "failed to spawn".to_string(),
                stderr: e.to_string(),
            })?;

        // Drain pipes off-thread so a chatty child cannot deadlock against the
        // cancellation poll below.
        let stderr_reader = child.stderr.take().map(spawn_pipe_reader);
        let stdout_reader = child.stdout.take().map(spawn_pipe_reader);

        let status = loop {
            if self.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SweepError::Cancelled {
                    stage,
                    command: invocation.command_line(),
                });
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => std::thread::sleep(Duration::from_millis(25)),
            }
        };

        let stderr = join_pipe_reader(stderr_reader);
        let stdout = join_pipe_reader(stdout_reader);

        if !status.success() {
            return Err(SweepError::ExternalFailure {
                stage,
                command: invocation.command_line(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        if !stderr.trim().is_empty() {
            tracing::debug!(stage = %stage, "{}", stderr.trim());
        }

        Ok(stdout)
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

fn join_pipe_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

impl StageExecutor for ProcessExecutor {
    fn run(
        &mut self,
        stage: StageKind,
        invocation: &StageInvocation,
        output: &Path,
    ) -> SweepResult<Artifact> {
        if output.exists() {
            tracing::info!(stage = %stage, "skipped (exists): {}", output.display());
            return Ok(Artifact {
                path: output.to_path_buf(),
                reused: true,
            });
        }

        self.execute(stage, invocation, false)?;

        if !output.exists() {
            return Err(SweepError::ExternalFailure {
                stage,
                command: invocation.command_line(),
                status: "exit status: 0".to_string(),
                stderr: format!(
                    "stage reported success but did not produce '{}'",
                    output.display()
                ),
            });
        }

        Ok(Artifact {
            path: output.to_path_buf(),
            reused: false,
        })
    }

    fn capture(&mut self, stage: StageKind, invocation: &StageInvocation) -> SweepResult<String> {
        self.execute(stage, invocation, true)
    }
}
