//! Shell v2 sessions: a multiplexed stdin/stdout/stderr/exit stream over one connection.

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::error::{AdbError, AdbResult};
use crate::transport::Connection;

pub const CHANNEL_STDIN: u8 = 0;
pub const CHANNEL_STDOUT: u8 = 1;
pub const CHANNEL_STDERR: u8 = 2;
pub const CHANNEL_EXIT: u8 = 3;
pub const CHANNEL_CLOSE_STDIN: u8 = 4;
pub const CHANNEL_WINDOW_SIZE: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellKind {
    Raw,
    Pty,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellRequest {
    pub kind: ShellKind,
    /// Empty or absent runs an interactive shell.
    pub command: Option<String>,
    pub term: Option<String>,
}

impl ShellRequest {
    pub fn service(&self) -> String {
        let mut cmd = String::from("shell,v2");
        if let Some(term) = &self.term {
            cmd.push_str(",TERM=");
            cmd.push_str(term);
        }
        cmd.push_str(match self.kind {
            ShellKind::Raw => ",raw",
            ShellKind::Pty => ",pty",
        });
        cmd.push(':');
        if let Some(command) = &self.command {
            cmd.push_str(command);
        }
        cmd
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u8),
    /// Returned by every receive after the exit message.
    Exited,
}

/// Sends the shell service request on `conn` and splits the session into its two directions.
pub async fn open<S>(
    mut conn: Connection<S>,
    request: &ShellRequest,
) -> AdbResult<(ShellReader<S>, ShellWriter<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send_command(request.service().as_bytes()).await?;
    let (read, write) = conn.into_split()?;
    Ok((
        ShellReader {
            conn: read,
            exited: false,
        },
        ShellWriter { conn: write },
    ))
}

pub struct ShellReader<S> {
    conn: Connection<ReadHalf<S>>,
    exited: bool,
}

impl<S: AsyncRead> ShellReader<S> {
    pub async fn recv(&mut self) -> AdbResult<ShellEvent> {
        if self.exited {
            return Ok(ShellEvent::Exited);
        }
        let (id, data) = self.conn.read_multiplexed().await?;
        match id {
            CHANNEL_STDOUT => Ok(ShellEvent::Stdout(data)),
            CHANNEL_STDERR => Ok(ShellEvent::Stderr(data)),
            CHANNEL_EXIT => {
                self.exited = true;
                self.conn.close();
                Ok(ShellEvent::Exit(data.first().copied().unwrap_or_default()))
            }
            other => {
                self.conn.close();
                Err(AdbError::Protocol(format!("shell channel {other}")))
            }
        }
    }
}

pub struct ShellWriter<S> {
    conn: Connection<WriteHalf<S>>,
}

impl<S: AsyncWrite> ShellWriter<S> {
    pub async fn write_stdin(&mut self, data: &[u8]) -> AdbResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.conn.write_multiplexed(CHANNEL_STDIN, data).await
    }

    pub async fn close_stdin(&mut self) -> AdbResult<()> {
        self.conn.write_multiplexed(CHANNEL_CLOSE_STDIN, &[]).await
    }

    pub async fn resize(&mut self, rows: u32, cols: u32, width: u32, height: u32) -> AdbResult<()> {
        let payload = format!("{rows}x{cols},{width}x{height}");
        self.conn
            .write_multiplexed(CHANNEL_WINDOW_SIZE, payload.as_bytes())
            .await
    }
}
