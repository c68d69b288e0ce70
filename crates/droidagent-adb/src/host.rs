use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{AdbError, AdbResult};
use crate::shell::{self, ShellReader, ShellRequest, ShellWriter};
use crate::sync::{self, DirectoryEntry, PullStream, PushStream, StatResult};
use crate::transport::Connection;

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5037";

/// Client for the adb host daemon. Each operation dials a fresh connection; nothing is reused
/// between operations.
#[derive(Clone, Debug)]
pub struct AdbClient {
    addr: String,
}

impl Default for AdbClient {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_ADDR)
    }
}

impl AdbClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send_command(&self, cmd: &[u8]) -> AdbResult<Connection> {
        let mut conn = Connection::connect(&self.addr).await?;
        conn.send_command(cmd).await?;
        Ok(conn)
    }

    /// Runs a one-shot host command, returning its length-prefixed reply when `has_body` is set.
    pub async fn execute(&self, cmd: &[u8], has_body: bool) -> AdbResult<Option<Vec<u8>>> {
        let mut conn = self.send_command(cmd).await?;
        if !has_body {
            return Ok(None);
        }
        let body = conn.read_hex_blob().await?;
        Ok(Some(body))
    }

    /// Blocks until the daemon tracks a device in the `device` state. With no deadline the wait
    /// is unbounded.
    pub async fn wait_for_device(&self, deadline: Option<Duration>) -> AdbResult<()> {
        let wait = async {
            let mut conn = self.send_command(b"host:track-devices").await?;
            wait_for_online(&mut conn).await
        };
        match deadline {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| AdbError::DeviceTimeout)?,
            None => wait.await,
        }
    }

    /// Opens a connection bound to the single local emulator.
    pub async fn open_emulator(&self) -> AdbResult<Connection> {
        self.send_command(b"host:transport-local").await
    }

    async fn open_sync(&self) -> AdbResult<Connection> {
        let mut conn = self.open_emulator().await?;
        conn.send_command(b"sync:").await?;
        Ok(conn)
    }

    /// Restarts adbd as root and returns the daemon's status line.
    pub async fn root(&self) -> AdbResult<Option<String>> {
        let mut conn = self.open_emulator().await?;
        conn.send_command(b"root:").await?;
        let line = conn.read_line().await?;
        info!("adb root: {}", line.as_deref().unwrap_or(""));
        Ok(line)
    }

    pub async fn list_directory(&self, path: &str) -> AdbResult<Vec<DirectoryEntry>> {
        let mut conn = self.open_sync().await?;
        sync::list_directory(&mut conn, path).await
    }

    pub async fn stat(&self, path: &str, follow_links: bool) -> AdbResult<StatResult> {
        let mut conn = self.open_sync().await?;
        sync::stat(&mut conn, path, follow_links).await
    }

    pub async fn pull(&self, path: &str) -> AdbResult<PullStream<TcpStream>> {
        PullStream::open(self.open_sync().await?, path).await
    }

    pub async fn push(&self, path: &str, mode: u32) -> AdbResult<PushStream<TcpStream>> {
        PushStream::open(self.open_sync().await?, path, mode).await
    }

    pub async fn open_shell(
        &self,
        request: &ShellRequest,
    ) -> AdbResult<(ShellReader<TcpStream>, ShellWriter<TcpStream>)> {
        shell::open(self.open_emulator().await?, request).await
    }
}

async fn wait_for_online<S>(conn: &mut Connection<S>) -> AdbResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let msg = conn.read_hex_blob().await?;
        let text = String::from_utf8_lossy(&msg);
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let serial = fields.next();
            let state = fields.next();
            debug!("tracked device {:?} is {:?}", serial, state);
            if state == Some("device") {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn fake_daemon<F, Fut>(script: F) -> (AdbClient, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(stream).await;
        });
        (AdbClient::new(addr.to_string()), handle)
    }

    async fn expect_request(stream: &mut TcpStream, expected: &str) {
        let mut buf = vec![0u8; 4 + expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[4..], expected.as_bytes());
    }

    fn blob(text: &str) -> Vec<u8> {
        format!("{:04x}{text}", text.len()).into_bytes()
    }

    #[tokio::test]
    async fn wait_returns_once_device_is_online() {
        let (client, daemon) = fake_daemon(|mut stream| async move {
            expect_request(&mut stream, "host:track-devices").await;
            stream.write_all(b"OKAY").await.unwrap();
            stream.write_all(&blob("")).await.unwrap();
            stream.write_all(&blob("emulator-5556\toffline\n")).await.unwrap();
            stream
                .write_all(&blob("emulator-5556\tdevice\n"))
                .await
                .unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        })
        .await;

        client.wait_for_device(None).await.unwrap();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn wait_honours_deadline() {
        let (client, daemon) = fake_daemon(|mut stream| async move {
            expect_request(&mut stream, "host:track-devices").await;
            stream.write_all(b"OKAY").await.unwrap();
            stream.write_all(&blob("emulator-5556\toffline\n")).await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        })
        .await;

        let err = client
            .wait_for_device(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, AdbError::DeviceTimeout));
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn wait_ignores_malformed_lines() {
        let (client, daemon) = fake_daemon(|mut stream| async move {
            expect_request(&mut stream, "host:track-devices").await;
            stream.write_all(b"OKAY").await.unwrap();
            stream.write_all(&blob("garbage\n\nemulator-5556 device\n")).await.unwrap();
        })
        .await;

        client.wait_for_device(None).await.unwrap();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn root_reads_status_line() {
        let (client, daemon) = fake_daemon(|mut stream| async move {
            expect_request(&mut stream, "host:transport-local").await;
            stream.write_all(b"OKAY").await.unwrap();
            expect_request(&mut stream, "root:").await;
            stream.write_all(b"OKAY").await.unwrap();
            stream
                .write_all(b"restarting adbd as root\n")
                .await
                .unwrap();
        })
        .await;

        let line = client.root().await.unwrap();
        assert_eq!(line.as_deref(), Some("restarting adbd as root"));
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn execute_reads_body() {
        let (client, daemon) = fake_daemon(|mut stream| async move {
            expect_request(&mut stream, "host:version").await;
            stream.write_all(b"OKAY").await.unwrap();
            stream.write_all(&blob("0029")).await.unwrap();
        })
        .await;

        let body = client.execute(b"host:version", true).await.unwrap();
        assert_eq!(body.as_deref(), Some(&b"0029"[..]));
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn missing_emulator_is_server_error() {
        let (client, daemon) = fake_daemon(|mut stream| async move {
            expect_request(&mut stream, "host:transport-local").await;
            stream.write_all(b"FAIL").await.unwrap();
            stream.write_all(&blob("no emulators found")).await.unwrap();
        })
        .await;

        let err = client.list_directory("/").await.unwrap_err();
        assert_eq!(err.to_string(), "server error: no emulators found");
        daemon.await.unwrap();
    }
}
