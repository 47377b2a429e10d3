//! Instance Runner: owns exactly one OS child process (spec §4.1).

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::descriptor::{ProgramDescriptor, StopSignal};
use crate::error::SpawnError;

/// Result of a non-blocking liveness check.
pub enum PollResult {
    Alive,
    Exited(Option<i32>),
}

/// One OS child process corresponding to one index of a multi-process program.
pub struct Instance {
    pub index: u32,
    child: Option<Child>,
    pid: Option<i32>,
    spawned_at: Instant,
    pub last_exit_code: Option<i32>,
}

impl Instance {
    /// Spawns instance `index` of `desc`.
    ///
    /// Resolves output sinks, composes the environment, sets umask/cwd,
    /// places the child in its own process group, and execs `desc.cmd`
    /// through a shell. Any failure leaves no child behind.
    pub fn spawn(desc: &ProgramDescriptor, index: u32) -> Result<Self, SpawnError> {
        if !desc.workingdir.is_dir() {
            return Err(SpawnError::MissingWorkingDir(
                desc.workingdir.display().to_string(),
            ));
        }

        let stdout = open_sink(desc.stdout_path(index).as_deref())?;
        let stderr = open_sink(desc.stderr_path(index).as_deref())?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&desc.cmd)
            .current_dir(&desc.workingdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .envs(desc.env.iter())
            .process_group(0);

        let umask = desc.umask;
        unsafe {
            cmd.pre_exec(move || {
                libc::umask(umask as libc::mode_t);
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(SpawnError::Exec)?;
        let pid = child.id().map(|p| p as i32);

        Ok(Instance {
            index,
            child: Some(child),
            pid,
            spawned_at: Instant::now(),
            last_exit_code: None,
        })
    }

    /// Non-blocking liveness check. On exit, the wait is completed and
    /// resources are released exactly once.
    pub fn poll(&mut self) -> PollResult {
        let Some(child) = self.child.as_mut() else {
            return PollResult::Exited(self.last_exit_code);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                self.last_exit_code = status.code();
                self.child = None;
                self.pid = None;
                PollResult::Exited(self.last_exit_code)
            }
            Ok(None) => PollResult::Alive,
            Err(_) => {
                // The child is no longer waitable; treat it as gone.
                self.child = None;
                self.pid = None;
                PollResult::Exited(self.last_exit_code)
            }
        }
    }

    /// Sends `signal` to the process group, waits up to `grace`, then
    /// escalates to SIGKILL. Idempotent if the child is already dead.
    pub async fn terminate(&mut self, signal: StopSignal, grace: Duration) -> Option<i32> {
        let Some(pid) = self.pid else {
            return self.last_exit_code;
        };
        let Some(mut child) = self.child.take() else {
            return self.last_exit_code;
        };

        unsafe {
            libc::kill(-pid, signal.as_libc());
        }

        let status = match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) | Err(_) => {
                unsafe {
                    libc::kill(-pid, libc::SIGKILL);
                }
                match child.wait().await {
                    Ok(status) => status,
                    Err(_) => {
                        self.pid = None;
                        return self.last_exit_code;
                    }
                }
            }
        };

        self.pid = None;
        self.last_exit_code = status.code();
        self.last_exit_code
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        self.child.is_some()
    }
}

fn open_sink(path: Option<&Path>) -> Result<Stdio, SpawnError> {
    match path {
        None => Ok(Stdio::null()),
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| SpawnError::Sink {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| SpawnError::Sink {
                    path: path.display().to_string(),
                    source,
                })?;
            Ok(Stdio::from(file))
        }
    }
}
