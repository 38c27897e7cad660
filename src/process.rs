//! External `samtools` processes used to decode and encode BAM files.
//!
//! Decoding runs `samtools view <bam>` and reads its stdout as SAM text;
//! encoding runs `samtools view -b -o <bam> -` and feeds its stdin. Every
//! spawned process is wrapped in an [`ExternalProcess`] that drains stderr on
//! a background thread and must be joined before the run is reported.

use crate::error::FilterError;
use log::{debug, warn};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

/// Command builder for the external decoder/encoder
#[derive(Debug, Clone)]
pub struct Samtools {
    program: PathBuf,
    threads: usize,
}

impl Default for Samtools {
    fn default() -> Self {
        Samtools::new("samtools")
    }
}

impl Samtools {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Samtools {
            program: program.into(),
            threads: 0,
        }
    }

    /// Additional compression threads for the encoder (`-@`)
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("view");
        cmd
    }

    /// Read the header block of `bam` as text
    pub fn read_header(&self, bam: &Path) -> Result<String, FilterError> {
        let output = self
            .command()
            .arg("-H")
            .arg(bam)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FilterError::Open {
                source: self.program.display().to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(FilterError::Subprocess {
                program: format!("{} view -H {}", self.program.display(), bam.display()),
                status: Some(output.status),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Start decoding `bam`; the returned stdout yields one SAM record per line
    pub fn decode(&self, bam: &Path) -> Result<(ExternalProcess, ChildStdout), FilterError> {
        let mut cmd = self.command();
        cmd.arg(bam).stdin(Stdio::null()).stdout(Stdio::piped());
        let mut process = ExternalProcess::spawn(
            cmd,
            format!("{} view {}", self.program.display(), bam.display()),
        )?;
        let stdout = process.child.stdout.take().ok_or_else(|| FilterError::Open {
            source: process.name.clone(),
            reason: "stdout was not captured".to_string(),
        })?;
        Ok((process, stdout))
    }

    /// Start encoding SAM text written to the returned stdin into `bam`
    pub fn encode(&self, bam: &Path) -> Result<(ExternalProcess, ChildStdin), FilterError> {
        let mut cmd = self.command();
        cmd.arg("-b").arg("-o").arg(bam);
        if self.threads > 0 {
            cmd.arg("-@").arg(self.threads.to_string());
        }
        cmd.arg("-").stdin(Stdio::piped()).stdout(Stdio::null());
        let mut process = ExternalProcess::spawn(
            cmd,
            format!("{} view -b -o {}", self.program.display(), bam.display()),
        )?;
        let stdin = process.child.stdin.take().ok_or_else(|| FilterError::Open {
            source: process.name.clone(),
            reason: "stdin was not captured".to_string(),
        })?;
        Ok((process, stdin))
    }
}

/// A running child process together with the thread collecting its stderr.
///
/// Dropping an un-joined process kills and reaps it.
#[derive(Debug)]
pub struct ExternalProcess {
    name: String,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    joined: bool,
}

impl ExternalProcess {
    pub fn spawn(mut cmd: Command, name: String) -> Result<Self, FilterError> {
        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| FilterError::Open {
            source: name.clone(),
            reason: e.to_string(),
        })?;
        debug!("Started '{}' (pid {})", name, child.id());

        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                let _ = pipe.read_to_end(&mut buffer);
                String::from_utf8_lossy(&buffer).into_owned()
            })
        });

        Ok(ExternalProcess {
            name,
            child,
            stderr,
            joined: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the process has exited
    pub fn is_done(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn collect_stderr(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }

    /// Wait for the process to exit. Diagnostic output is logged; a non-zero
    /// exit status is an error.
    pub fn join(mut self) -> Result<(), FilterError> {
        let status = self.child.wait();
        self.joined = true;
        let stderr = self.collect_stderr();

        let status = match status {
            Ok(status) => status,
            Err(_) => {
                return Err(FilterError::Subprocess {
                    program: self.name.clone(),
                    status: None,
                    stderr,
                })
            }
        };
        if !status.success() {
            return Err(FilterError::Subprocess {
                program: self.name.clone(),
                status: Some(status),
                stderr,
            });
        }
        if !stderr.trim().is_empty() {
            warn!("'{}' output:\n{}", self.name, stderr.trim_end());
        }
        debug!("'{}' finished", self.name);
        Ok(())
    }

    /// Wait for a process whose output pipe was closed before it was read to
    /// the end. Being killed by SIGPIPE is the expected outcome then and is
    /// not an error; any other abnormal exit still is.
    pub fn join_after_hangup(mut self) -> Result<(), FilterError> {
        match self.child.wait() {
            Ok(status) if killed_by_sigpipe(&status) => {
                self.joined = true;
                let _ = self.collect_stderr();
                debug!("'{}' stopped before the end of its output", self.name);
                Ok(())
            }
            _ => self.join(),
        }
    }
}

/// Killed by SIGPIPE, either directly or as reported by a wrapping shell
#[cfg(unix)]
fn killed_by_sigpipe(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    const SIGPIPE: i32 = 13;
    status.signal() == Some(SIGPIPE) || status.code() == Some(128 + SIGPIPE)
}

#[cfg(not(unix))]
fn killed_by_sigpipe(_status: &ExitStatus) -> bool {
    false
}

impl Drop for ExternalProcess {
    fn drop(&mut self) {
        if !self.joined {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
