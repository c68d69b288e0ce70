use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("adb connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed adb frame: {0}")]
    Framing(String),
    #[error("unexpected adb response: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("{0}")]
    Device(String),
    #[error("chunk of {len} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { len: usize, max: usize },
    #[error("adb connection is closed")]
    Closed,
    #[error("timed out waiting for device")]
    DeviceTimeout,
    #[error("adb not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error("adb {command} failed with exit {status}{}", format_output(.stdout, .stderr))]
    Exit {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },
}

pub type AdbResult<T> = Result<T, AdbError>;

impl AdbError {
    /// True when the failure came from the socket or its framing; the connection is gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AdbError::Io(_) | AdbError::Framing(_) | AdbError::Closed
        )
    }
}

fn format_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let mut out = String::new();
    if !stdout.is_empty() {
        out.push_str("\nstdout:\n");
        out.push_str(stdout);
    }
    if !stderr.is_empty() {
        out.push_str("\nstderr:\n");
        out.push_str(stderr);
    }
    out
}
