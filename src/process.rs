//! Child process supervisor
//!
//! Spawns a script command through the platform shell in its own process
//! group, streams its output, and can terminate the entire process subtree.
//! The lifecycle is `starting -> started -> stopping -> stopped`, with a side
//! transition to `stopped` on spawn error; a terminate request that arrives
//! before `started` is deferred and delivered as soon as the child is up.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::deferred::Deferred;

/// Categorized terminal result of a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitResult {
    Ok,
    ExitNonZero(i32),
    Signal(i32),
    SpawnError(String),
    /// The child exited because we terminated it.
    Terminated,
}

#[derive(Debug)]
enum ChildState {
    Starting { terminate_requested: bool },
    Started,
    Stopping,
    Stopped,
}

/// A supervised child process.
pub struct ScriptChildProcess {
    state: Arc<Mutex<ChildState>>,
    completed: Deferred<ExitResult>,
    pid: u32,
}

impl ScriptChildProcess {
    /// Spawn `command` via the shell with `package_dir` as working directory.
    /// Output chunks are forwarded to our own stdout/stderr and appended to
    /// the capture files.
    pub fn spawn(
        command: &str,
        package_dir: &Path,
        stdout_capture: PathBuf,
        stderr_capture: PathBuf,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(ChildState::Starting {
            terminate_requested: false,
        }));
        let completed: Deferred<ExitResult> = Deferred::new();

        let mut cmd = shell_command(command);
        cmd.current_dir(package_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // A clean environment: the runner's own lifecycle variables describe
        // wireit's invocation, not the child's package, so they are removed.
        for (key, _) in std::env::vars_os() {
            let Some(name) = key.to_str() else { continue };
            if name.starts_with("npm_package_")
                || name == "npm_lifecycle_event"
                || name == "npm_lifecycle_script"
            {
                cmd.env_remove(&key);
            }
        }
        cmd.env("PATH", build_path_env(package_dir));

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                *state.lock().unwrap() = ChildState::Stopped;
                completed.resolve(ExitResult::SpawnError(err.to_string()));
                return Err(err).with_context(|| format!("Failed to spawn: {command}"));
            }
        };

        let pid = child.id().context("Spawned child has no pid")?;
        debug!(pid, command, "spawned");

        let stdout_task = child
            .stdout
            .take()
            .map(|reader| tokio::spawn(forward(reader, tokio::io::stdout(), stdout_capture)));
        let stderr_task = child
            .stderr
            .take()
            .map(|reader| tokio::spawn(forward(reader, tokio::io::stderr(), stderr_capture)));

        {
            let mut guard = state.lock().unwrap();
            let deferred_terminate =
                matches!(*guard, ChildState::Starting { terminate_requested: true });
            *guard = ChildState::Started;
            drop(guard);
            if deferred_terminate {
                Self::terminate_group(pid, &state);
            }
        }

        {
            let state = state.clone();
            let completed = completed.clone();
            tokio::spawn(async move {
                let status = child.wait().await;

                // Drain output before reporting completion so chunks from a
                // single child always precede its exit event.
                if let Some(task) = stdout_task {
                    let _ = task.await;
                }
                if let Some(task) = stderr_task {
                    let _ = task.await;
                }

                let mut guard = state.lock().unwrap();
                let terminated = matches!(*guard, ChildState::Stopping);
                *guard = ChildState::Stopped;
                drop(guard);

                let result = if terminated {
                    ExitResult::Terminated
                } else {
                    match status {
                        Err(err) => ExitResult::SpawnError(err.to_string()),
                        Ok(status) if status.success() => ExitResult::Ok,
                        Ok(status) => categorize_exit(status),
                    }
                };
                debug!(pid, ?result, "exited");
                completed.resolve(result);
            });
        }

        Ok(Self {
            state,
            completed,
            pid,
        })
    }

    /// Completion holder: resolves exactly once with the categorized result.
    pub fn completed(&self) -> &Deferred<ExitResult> {
        &self.completed
    }

    /// Terminate the whole process group. Idempotent; a call before the
    /// child is up is delivered once it is.
    pub fn terminate(&self) {
        let mut guard = self.state.lock().unwrap();
        match *guard {
            ChildState::Starting { .. } => {
                *guard = ChildState::Starting {
                    terminate_requested: true,
                };
            }
            ChildState::Started => {
                drop(guard);
                Self::terminate_group(self.pid, &self.state);
            }
            ChildState::Stopping | ChildState::Stopped => {}
        }
    }

    fn terminate_group(pid: u32, state: &Arc<Mutex<ChildState>>) {
        {
            let mut guard = state.lock().unwrap();
            if matches!(*guard, ChildState::Stopping | ChildState::Stopped) {
                return;
            }
            *guard = ChildState::Stopping;
        }
        debug!(pid, "terminating process group");

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGINT);
        }

        #[cfg(windows)]
        {
            let _ = tokio::process::Command::new("taskkill")
                .args(["/pid", &pid.to_string(), "/t", "/f"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        }
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd.exe");
    cmd.args(["/d", "/s", "/c", command]);
    cmd
}

#[cfg(unix)]
fn categorize_exit(status: std::process::ExitStatus) -> ExitResult {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitResult::ExitNonZero(code),
        None => ExitResult::Signal(status.signal().unwrap_or(-1)),
    }
}

#[cfg(windows)]
fn categorize_exit(status: std::process::ExitStatus) -> ExitResult {
    ExitResult::ExitNonZero(status.code().unwrap_or(-1))
}

/// The curated PATH: every `node_modules/.bin` from the package directory up
/// to the filesystem root, then the inherited PATH with the leading `.bin`
/// entries the outer runner prepended stripped off.
fn build_path_env(package_dir: &Path) -> OsString {
    let bin_suffix: PathBuf = ["node_modules", ".bin"].iter().collect();

    let mut entries: Vec<PathBuf> = Vec::new();
    let mut dir = Some(package_dir);
    while let Some(current) = dir {
        entries.push(current.join(&bin_suffix));
        dir = current.parent();
    }

    if let Some(inherited) = std::env::var_os("PATH") {
        let mut inherited = std::env::split_paths(&inherited).peekable();
        while let Some(entry) = inherited.peek() {
            if entry.ends_with(&bin_suffix) {
                inherited.next();
            } else {
                break;
            }
        }
        entries.extend(inherited);
    }

    std::env::join_paths(entries).unwrap_or_default()
}

async fn forward<R, W>(mut reader: R, mut console: W, capture: PathBuf)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(capture)
        .await
        .ok();

    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &buffer[..n];
                let _ = console.write_all(chunk).await;
                let _ = console.flush().await;
                if let Some(file) = file.as_mut() {
                    let _ = file.write_all(chunk).await;
                }
            }
        }
    }
    if let Some(file) = file.as_mut() {
        let _ = file.flush().await;
    }
}
