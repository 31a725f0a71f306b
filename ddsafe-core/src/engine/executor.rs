//! The external byte-copy executor and how to talk to it.
use super::progress::{DdStatusParser, ProgressParser};
use crate::error::Error;
use crate::request::BlockSize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

/// Where the executor reads from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Path(PathBuf),
    /// Bytes are streamed in by the engine through the child's stdin.
    Stdin,
}

/// One invocation of the executor: a single pass over the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyJob {
    pub input: Input,
    pub output: PathBuf,
    pub block_size: BlockSize,
    /// Stop after this many bytes. `None` copies until the input ends.
    pub count: Option<u64>,
    /// Truncate the output first. Only image files are ever truncated.
    pub truncate: bool,
}

/// An external program that copies bytes from an input to an output.
pub trait Executor: Send + Sync {
    /// Builds the command for `job`. The engine wires up the standard streams.
    fn command(&self, job: &CopyJob) -> Command;

    /// A fresh parser for the program's progress output on stderr.
    fn progress_parser(&self) -> Box<dyn ProgressParser>;

    /// Maps a non-zero exit and the program's diagnostics to a failure class.
    fn classify_failure(&self, status: ExitStatus, diagnostics: &str) -> Error {
        classify_diagnostics(status, diagnostics)
    }
}

/// Failure classes recognised in coreutils-style diagnostics.
pub fn classify_diagnostics(status: ExitStatus, diagnostics: &str) -> Error {
    let lower = diagnostics.to_lowercase();
    let detail = if diagnostics.trim().is_empty() {
        format!("executor exited with {status}")
    } else {
        format!("executor exited with {status}: {}", diagnostics.trim())
    };

    if lower.contains("no space left on device") || lower.contains("file too large") {
        Error::InsufficientSpace(detail)
    } else if lower.contains("device or resource busy")
        || lower.contains("no such device")
        || lower.contains("no medium found")
    {
        Error::DeviceBusy(detail)
    } else {
        Error::IoFailure(detail)
    }
}

/// GNU coreutils `dd`, optionally run through `sudo -n`.
#[derive(Clone, Debug)]
pub struct DdExecutor {
    program: PathBuf,
    use_sudo: bool,
}

impl Default for DdExecutor {
    fn default() -> Self {
        Self::new("dd")
    }
}

impl DdExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            use_sudo: false,
        }
    }

    pub fn use_sudo(mut self, sudo: bool) -> Self {
        self.use_sudo = sudo;
        self
    }

    /// The `dd` operands for `job`, in the order they are passed.
    pub fn operands(job: &CopyJob) -> Vec<OsString> {
        let mut args = Vec::new();

        if let Input::Path(path) = &job.input {
            let mut arg = OsString::from("if=");
            arg.push(path);
            args.push(arg);
        }

        let mut of = OsString::from("of=");
        of.push(&job.output);
        args.push(of);

        args.push(format!("bs={}", job.block_size.bytes()).into());
        args.push("status=progress".into());

        let conv = if job.truncate { "conv=fsync" } else { "conv=fsync,notrunc" };
        args.push(conv.into());

        match job.count {
            Some(count) => {
                args.push("iflag=fullblock,count_bytes".into());
                args.push(format!("count={count}").into());
            }
            None => args.push("iflag=fullblock".into()),
        }

        args
    }
}

impl Executor for DdExecutor {
    fn command(&self, job: &CopyJob) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.program);
            cmd
        } else {
            Command::new(&self.program)
        };
        cmd.args(Self::operands(job));
        // Progress parsing and failure classification expect English output.
        cmd.env("LC_ALL", "C");
        cmd
    }

    fn progress_parser(&self) -> Box<dyn ProgressParser> {
        Box::new(DdStatusParser)
    }
}
