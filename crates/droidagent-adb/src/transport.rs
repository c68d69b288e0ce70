//! Framing for the adb host protocol.
//!
//! Requests are a four digit lowercase hex length followed by the payload, answered by a four
//! byte status. Shell v2 sessions switch to a five byte header (channel id plus little-endian
//! length). Any I/O or framing failure drops the underlying stream; every later call on the same
//! [`Connection`] fails with [`AdbError::Closed`].

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::error::{AdbError, AdbResult};

pub const STATUS_OKAY: [u8; 4] = *b"OKAY";
pub const STATUS_FAIL: [u8; 4] = *b"FAIL";

const MAX_MESSAGE_LEN: usize = 0xffff;
/// Largest shell v2 payload adbd emits (its `MAX_PAYLOAD`).
pub const MAX_PACKET_LEN: usize = 1024 * 1024;

#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: Option<S>,
}

impl<S> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn close(&mut self) {
        self.stream = None;
    }

    fn stream(&mut self) -> AdbResult<&mut S> {
        self.stream.as_mut().ok_or(AdbError::Closed)
    }

    fn fail<T>(&mut self, err: AdbError) -> AdbResult<T> {
        self.stream = None;
        Err(err)
    }
}

impl Connection<TcpStream> {
    pub async fn connect(addr: &str) -> AdbResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    /// Splits into independently owned read and write halves, for sessions where one task
    /// reads device output while another writes requests.
    pub fn into_split(self) -> AdbResult<(Connection<ReadHalf<S>>, Connection<WriteHalf<S>>)> {
        let stream = self.stream.ok_or(AdbError::Closed)?;
        let (read, write) = io::split(stream);
        Ok((Connection::new(read), Connection::new(write)))
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    pub async fn write_raw(&mut self, packet: &[u8]) -> AdbResult<()> {
        let stream = self.stream()?;
        let result = async {
            stream.write_all(packet).await?;
            stream.flush().await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err.into()),
        }
    }

    pub async fn write_message(&mut self, msg: &[u8]) -> AdbResult<()> {
        if msg.len() > MAX_MESSAGE_LEN {
            return self.fail(AdbError::Framing(format!(
                "message of {} bytes does not fit a 4 digit length",
                msg.len()
            )));
        }
        let mut packet = format!("{:04x}", msg.len()).into_bytes();
        packet.extend_from_slice(msg);
        self.write_raw(&packet).await
    }

    pub async fn write_multiplexed(&mut self, id: u8, blob: &[u8]) -> AdbResult<()> {
        let Ok(len) = u32::try_from(blob.len()) else {
            return self.fail(AdbError::Framing(format!(
                "blob of {} bytes is too large",
                blob.len()
            )));
        };
        let mut packet = Vec::with_capacity(5 + blob.len());
        packet.push(id);
        packet.extend_from_slice(&len.to_le_bytes());
        packet.extend_from_slice(blob);
        self.write_raw(&packet).await
    }
}

impl<S: AsyncRead + Unpin> Connection<S> {
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> AdbResult<()> {
        let stream = self.stream()?;
        let result = stream.read_exact(buf).await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => self.fail(err.into()),
        }
    }

    /// Reads `len` bytes announced by the peer. A length above `max` closes the connection
    /// before anything is allocated.
    pub async fn read_vec(&mut self, len: u32, max: usize) -> AdbResult<Vec<u8>> {
        let len = len as usize;
        if len > max {
            return self.fail(AdbError::Protocol(format!(
                "peer announced {len} bytes, limit is {max}"
            )));
        }
        let mut buf = vec![0u8; len];
        self.read_raw(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_u32_le(&mut self) -> AdbResult<u32> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf).await?;
        Ok(u32::from_le_bytes(buf))
    }

    pub async fn read_status(&mut self) -> AdbResult<[u8; 4]> {
        let mut status = [0u8; 4];
        self.read_raw(&mut status).await?;
        Ok(status)
    }

    pub async fn read_hex_blob(&mut self) -> AdbResult<Vec<u8>> {
        let mut prefix = [0u8; 4];
        self.read_raw(&mut prefix).await?;
        let len = match std::str::from_utf8(&prefix)
            .ok()
            .and_then(|s| u32::from_str_radix(s, 16).ok())
        {
            Some(len) => len,
            None => {
                return self.fail(AdbError::Framing(format!(
                    "invalid length prefix {:?}",
                    String::from_utf8_lossy(&prefix)
                )))
            }
        };
        self.read_vec(len, MAX_MESSAGE_LEN).await
    }

    pub async fn read_multiplexed(&mut self) -> AdbResult<(u8, Vec<u8>)> {
        let mut header = [0u8; 5];
        self.read_raw(&mut header).await?;
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let blob = self.read_vec(len, MAX_PACKET_LEN).await?;
        Ok((header[0], blob))
    }

    /// Reads a single `\n` terminated line. Returns `None` if the stream ends before any byte of a
    /// new line arrives; the connection is closed in that case.
    pub async fn read_line(&mut self) -> AdbResult<Option<String>> {
        let mut line = Vec::new();
        loop {
            let stream = self.stream()?;
            let mut byte = [0u8; 1];
            let result = stream.read(&mut byte).await;
            let read = match result {
                Ok(read) => read,
                Err(err) => return self.fail(err.into()),
            };
            if read == 0 {
                self.close();
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Sends `cmd` and consumes the status. A `FAIL` reply becomes [`AdbError::Server`] with the
    /// message the daemon attached.
    pub async fn send_command(&mut self, cmd: &[u8]) -> AdbResult<()> {
        self.write_message(cmd).await?;
        let status = self.read_status().await?;
        if status == STATUS_OKAY {
            return Ok(());
        }
        let msg = self.read_hex_blob().await?;
        self.close();
        if status == STATUS_FAIL {
            Err(AdbError::Server(String::from_utf8_lossy(&msg).into_owned()))
        } else {
            Err(AdbError::Protocol(format!(
                "status {:?}",
                String::from_utf8_lossy(&status)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn write_message_prefixes_hex_length() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        conn.write_message(b"example message").await.unwrap();
        drop(conn);

        let mut data = Vec::new();
        server.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"000fexample message");
    }

    #[tokio::test]
    async fn write_message_uses_lowercase_hex() {
        let (client, mut server) = duplex(512);
        let mut conn = Connection::new(client);

        conn.write_message(&[b'x'; 171]).await.unwrap();
        drop(conn);

        let mut data = Vec::new();
        server.read_to_end(&mut data).await.unwrap();
        assert_eq!(&data[..4], b"00ab");
        assert_eq!(data.len(), 175);
    }

    #[tokio::test]
    async fn write_multiplexed_frames_id_and_length() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        conn.write_multiplexed(123, b"example message").await.unwrap();
        drop(conn);

        let mut data = Vec::new();
        server.read_to_end(&mut data).await.unwrap();
        let mut expected = vec![0x7b, 0x0f, 0x00, 0x00, 0x00];
        expected.extend_from_slice(b"example message");
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn read_hex_blob_returns_payload() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        server.write_all(b"000fexample message").await.unwrap();
        let blob = conn.read_hex_blob().await.unwrap();
        assert_eq!(blob, b"example message");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn read_hex_blob_rejects_bad_prefix_and_closes() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        server.write_all(b"zz0fexample message").await.unwrap();
        let err = conn.read_hex_blob().await.unwrap_err();
        assert!(matches!(err, AdbError::Framing(_)));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.read_status().await.unwrap_err(),
            AdbError::Closed
        ));
    }

    #[tokio::test]
    async fn short_read_closes_connection() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        server.write_all(b"0010short").await.unwrap();
        drop(server);
        let err = conn.read_hex_blob().await.unwrap_err();
        assert!(matches!(err, AdbError::Io(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn read_multiplexed_splits_header() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        server
            .write_all(b"\x7b\x0f\x00\x00\x00example message")
            .await
            .unwrap();
        let (id, blob) = conn.read_multiplexed().await.unwrap();
        assert_eq!(id, 123);
        assert_eq!(blob, b"example message");
    }

    #[tokio::test]
    async fn multiplexed_blob_survives_the_wire() {
        let (a, b) = duplex(64);
        let mut writer = Connection::new(a);
        let mut reader = Connection::new(b);

        writer.write_multiplexed(2, b"").await.unwrap();
        writer.write_multiplexed(1, b"hello").await.unwrap();

        assert_eq!(reader.read_multiplexed().await.unwrap(), (2, Vec::new()));
        assert_eq!(
            reader.read_multiplexed().await.unwrap(),
            (1, b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn oversized_multiplexed_header_closes_without_reading() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        server.write_all(b"\x01\xff\xff\xff\xff").await.unwrap();
        let err = conn.read_multiplexed().await.unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn read_vec_enforces_limit() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        server.write_all(b"abcd").await.unwrap();
        assert_eq!(conn.read_vec(4, 4).await.unwrap(), b"abcd");
        assert!(matches!(
            conn.read_vec(5, 4).await.unwrap_err(),
            AdbError::Protocol(_)
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn read_status_returns_four_bytes() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        server.write_all(b"OKAYFAIL").await.unwrap();
        assert_eq!(conn.read_status().await.unwrap(), STATUS_OKAY);
        assert_eq!(conn.read_status().await.unwrap(), STATUS_FAIL);
    }

    #[tokio::test]
    async fn read_line_strips_terminator() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        server
            .write_all(b"restarting adbd as root\r\nsecond")
            .await
            .unwrap();
        drop(server);

        assert_eq!(
            conn.read_line().await.unwrap().as_deref(),
            Some("restarting adbd as root")
        );
        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("second"));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn read_line_at_eof_is_none() {
        let (client, server) = duplex(64);
        let mut conn = Connection::new(client);
        drop(server);

        assert_eq!(conn.read_line().await.unwrap(), None);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn send_command_accepts_okay() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        let peer = tokio::spawn(async move {
            let mut request = [0u8; 9];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(b"OKAY").await.unwrap();
            request
        });

        conn.send_command(b"sync:").await.unwrap();
        assert_eq!(&peer.await.unwrap(), b"0005sync:");
    }

    #[tokio::test]
    async fn send_command_surfaces_fail_message() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        let peer = tokio::spawn(async move {
            let mut request = [0u8; 9];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(b"FAIL000dExample Error").await.unwrap();
        });

        let err = conn.send_command(b"sync:").await.unwrap_err();
        peer.await.unwrap();
        assert!(matches!(err, AdbError::Server(ref msg) if msg == "Example Error"));
        assert!(err.to_string().contains("Example Error"));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn split_halves_work_independently() {
        let (client, mut server) = duplex(64);
        let (mut read, mut write) = Connection::new(client).into_split().unwrap();

        write.write_multiplexed(0, b"ls\n").await.unwrap();
        let mut request = [0u8; 8];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"\x00\x03\x00\x00\x00ls\n");

        server.write_all(b"\x03\x01\x00\x00\x00\x00").await.unwrap();
        assert_eq!(read.read_multiplexed().await.unwrap(), (3, vec![0]));
    }
}
