//! Subprocess invocation for the VCS binary.
//!
//! Commands are built as argument vectors and never pass through a shell,
//! so paths and revision queries cannot be reinterpreted.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::{VcsError, VcsOutput};

/// How often a running child is polled while a timeout is armed
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single VCS invocation.
#[derive(Debug, Clone)]
pub struct VcsCommand {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: PathBuf,
    timeout: Option<Duration>,
}

impl VcsCommand {
    pub fn new(program: impl AsRef<Path>, cwd: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Kill the child if it has not exited after `timeout`. `None` waits forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human-readable form for logs and error messages
    pub fn describe(&self) -> String {
        let mut text = self.program.display().to_string();
        for arg in &self.args {
            text.push(' ');
            text.push_str(&arg.to_string_lossy());
        }
        text
    }

    /// Run to completion and collect exit status, stdout and stderr.
    ///
    /// A non-zero exit is returned as data, not as an error.
    pub fn run(&self) -> Result<VcsOutput, VcsError> {
        debug!("vcs: {} (in {:?})", self.describe(), self.cwd);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| VcsError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Drain both pipes on their own threads so a chatty child can't block
        // on a full pipe while we wait for it.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match self.timeout {
            None => child.wait()?,
            Some(limit) => match wait_with_deadline(&mut child, limit)? {
                Some(status) => status,
                None => {
                    warn!("vcs: {} timed out after {:?}, killing", self.describe(), limit);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(VcsError::Timeout {
                        command: self.describe(),
                        after: limit,
                    });
                }
            },
        };

        let output = VcsOutput {
            status: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        if !output.success() {
            debug!(
                "vcs: {} exited with {}: {}",
                self.describe(),
                output.status,
                output.stderr.trim()
            );
        }

        Ok(output)
    }
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> std::io::Result<Option<ExitStatus>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= limit {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
