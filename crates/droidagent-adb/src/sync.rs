//! The `sync:` file service, using the `*2` request variants.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{AdbError, AdbResult};
use crate::transport::Connection;

pub const MAX_DATA: usize = 64 * 1024;
pub const FILE_STAT_SIZE: usize = 64;
/// Longest path or entry name the daemon will send.
pub const MAX_NAME_LEN: usize = 1024;
/// Longest `FAIL` message accepted from the daemon.
pub const MAX_FAIL_LEN: usize = MAX_DATA;

const fn sync_id(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

pub const ID_LIST_V2: u32 = sync_id(b"LIS2");
pub const ID_DENT_V2: u32 = sync_id(b"DNT2");
pub const ID_DONE: u32 = sync_id(b"DONE");
pub const ID_STAT_V2: u32 = sync_id(b"STA2");
pub const ID_LSTAT_V2: u32 = sync_id(b"LST2");
pub const ID_RECV_V2: u32 = sync_id(b"RCV2");
pub const ID_SEND_V2: u32 = sync_id(b"SND2");
pub const ID_DATA: u32 = sync_id(b"DATA");
pub const ID_FAIL: u32 = sync_id(b"FAIL");
pub const ID_OKAY: u32 = sync_id(b"OKAY");

fn id_name(id: u32) -> String {
    String::from_utf8_lossy(&id.to_le_bytes()).into_owned()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn parse(data: &[u8; FILE_STAT_SIZE]) -> Self {
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(b)
        };
        Self {
            dev: u64_at(0),
            ino: u64_at(8),
            mode: u32_at(16),
            nlink: u32_at(20),
            uid: u32_at(24),
            gid: u32_at(28),
            size: u64_at(32),
            atime: u64_at(40) as i64,
            mtime: u64_at(48) as i64,
            ctime: u64_at(56) as i64,
        }
    }

    pub fn encode(&self) -> [u8; FILE_STAT_SIZE] {
        let mut out = [0u8; FILE_STAT_SIZE];
        out[0..8].copy_from_slice(&self.dev.to_le_bytes());
        out[8..16].copy_from_slice(&self.ino.to_le_bytes());
        out[16..20].copy_from_slice(&self.mode.to_le_bytes());
        out[20..24].copy_from_slice(&self.nlink.to_le_bytes());
        out[24..28].copy_from_slice(&self.uid.to_le_bytes());
        out[28..32].copy_from_slice(&self.gid.to_le_bytes());
        out[32..40].copy_from_slice(&self.size.to_le_bytes());
        out[40..48].copy_from_slice(&self.atime.to_le_bytes());
        out[48..56].copy_from_slice(&self.mtime.to_le_bytes());
        out[56..64].copy_from_slice(&self.ctime.to_le_bytes());
        out
    }
}

/// Outcome of a stat on the device: either the record or the errno the daemon reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatResult {
    Stat(FileStat),
    Error(u32),
}

impl StatResult {
    fn from_parts(stat_error: u32, stat: FileStat) -> Self {
        if stat_error == 0 {
            StatResult::Stat(stat)
        } else {
            StatResult::Error(stat_error)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub stat: StatResult,
}

fn path_request(id: u32, path: &str) -> AdbResult<Vec<u8>> {
    let len = u32::try_from(path.len())
        .map_err(|_| AdbError::Framing(format!("path of {} bytes is too long", path.len())))?;
    let mut packet = Vec::with_capacity(8 + path.len() + 12);
    packet.extend_from_slice(&id.to_le_bytes());
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(path.as_bytes());
    Ok(packet)
}

/// Lists `path` over a connection already switched into sync mode.
pub async fn list_directory<S>(
    conn: &mut Connection<S>,
    path: &str,
) -> AdbResult<Vec<DirectoryEntry>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_raw(&path_request(ID_LIST_V2, path)?).await?;

    let mut entries = Vec::new();
    loop {
        let mut record = [0u8; FILE_STAT_SIZE + 12];
        conn.read_raw(&mut record).await?;

        let id = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        if id == ID_DONE {
            break;
        }
        if id != ID_DENT_V2 {
            conn.close();
            return Err(AdbError::Protocol(format!("{} while listing", id_name(id))));
        }
        let stat_error = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        let mut stat = [0u8; FILE_STAT_SIZE];
        stat.copy_from_slice(&record[8..8 + FILE_STAT_SIZE]);
        let tail = &record[8 + FILE_STAT_SIZE..];
        let name_len = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let name = conn.read_vec(name_len, MAX_NAME_LEN).await?;

        entries.push(DirectoryEntry {
            name: String::from_utf8_lossy(&name).into_owned(),
            stat: StatResult::from_parts(stat_error, FileStat::parse(&stat)),
        });
    }

    debug!("listed {} entries in {path}", entries.len());
    Ok(entries)
}

/// Stats `path`, following symlinks when `follow_links` is set.
pub async fn stat<S>(
    conn: &mut Connection<S>,
    path: &str,
    follow_links: bool,
) -> AdbResult<StatResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = if follow_links { ID_STAT_V2 } else { ID_LSTAT_V2 };
    conn.write_raw(&path_request(id, path)?).await?;

    let mut resp = [0u8; FILE_STAT_SIZE + 8];
    conn.read_raw(&mut resp).await?;

    let id = u32::from_le_bytes([resp[0], resp[1], resp[2], resp[3]]);
    let stat_error = u32::from_le_bytes([resp[4], resp[5], resp[6], resp[7]]);
    if id == ID_FAIL {
        let msg = conn.read_vec(stat_error, MAX_FAIL_LEN).await?;
        conn.close();
        return Err(AdbError::Device(String::from_utf8_lossy(&msg).into_owned()));
    }
    if id != ID_STAT_V2 && id != ID_LSTAT_V2 {
        conn.close();
        return Err(AdbError::Protocol(format!("{} in stat reply", id_name(id))));
    }

    let mut stat = [0u8; FILE_STAT_SIZE];
    stat.copy_from_slice(&resp[8..]);
    Ok(StatResult::from_parts(stat_error, FileStat::parse(&stat)))
}

/// An in-flight file download. Yields chunks until the daemon reports completion.
#[derive(Debug)]
pub struct PullStream<S> {
    conn: Connection<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PullStream<S> {
    pub async fn open(mut conn: Connection<S>, path: &str) -> AdbResult<Self> {
        let mut packet = path_request(ID_RECV_V2, path)?;
        packet.extend_from_slice(&ID_RECV_V2.to_le_bytes());
        packet.extend_from_slice(&0u32.to_le_bytes());
        conn.write_raw(&packet).await?;
        Ok(Self { conn })
    }

    /// Next chunk of the file, or `None` once the transfer completed.
    pub async fn recv(&mut self) -> AdbResult<Option<Vec<u8>>> {
        let mut header = [0u8; 8];
        self.conn.read_raw(&mut header).await?;
        let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        match id {
            ID_DATA => Ok(Some(self.conn.read_vec(len, MAX_DATA).await?)),
            ID_DONE => {
                self.conn.close();
                Ok(None)
            }
            ID_FAIL => {
                let msg = self.conn.read_vec(len, MAX_FAIL_LEN).await?;
                self.conn.close();
                Err(AdbError::Device(String::from_utf8_lossy(&msg).into_owned()))
            }
            other => {
                self.conn.close();
                Err(AdbError::Protocol(format!("{} during pull", id_name(other))))
            }
        }
    }
}

/// An in-flight file upload. Feed it with [`PushStream::send`] and complete with
/// [`PushStream::finish`].
#[derive(Debug)]
pub struct PushStream<S> {
    conn: Connection<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PushStream<S> {
    pub async fn open(mut conn: Connection<S>, path: &str, mode: u32) -> AdbResult<Self> {
        let mut packet = path_request(ID_SEND_V2, path)?;
        packet.extend_from_slice(&ID_SEND_V2.to_le_bytes());
        packet.extend_from_slice(&mode.to_le_bytes());
        packet.extend_from_slice(&0u32.to_le_bytes());
        conn.write_raw(&packet).await?;
        Ok(Self { conn })
    }

    /// Sends one chunk. Chunks over [`MAX_DATA`] abort the transfer and close the connection.
    pub async fn send(&mut self, chunk: &[u8]) -> AdbResult<()> {
        if chunk.len() > MAX_DATA {
            self.conn.close();
            return Err(AdbError::ChunkTooLarge {
                len: chunk.len(),
                max: MAX_DATA,
            });
        }
        let mut packet = Vec::with_capacity(8 + chunk.len());
        packet.extend_from_slice(&ID_DATA.to_le_bytes());
        packet.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        packet.extend_from_slice(chunk);
        self.conn.write_raw(&packet).await
    }

    pub async fn finish(mut self, mtime: u32) -> AdbResult<()> {
        let mut packet = [0u8; 8];
        packet[0..4].copy_from_slice(&ID_DONE.to_le_bytes());
        packet[4..8].copy_from_slice(&mtime.to_le_bytes());
        self.conn.write_raw(&packet).await?;

        let mut header = [0u8; 8];
        self.conn.read_raw(&mut header).await?;
        let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let result = match id {
            ID_OKAY => Ok(()),
            ID_FAIL => {
                let msg = self.conn.read_vec(len, MAX_FAIL_LEN).await?;
                Err(AdbError::Device(String::from_utf8_lossy(&msg).into_owned()))
            }
            other => Err(AdbError::Protocol(format!("{} in push receipt", id_name(other)))),
        };
        self.conn.close();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn header(id: u32, len: u32) -> Vec<u8> {
        let mut out = id.to_le_bytes().to_vec();
        out.extend_from_slice(&len.to_le_bytes());
        out
    }

    fn sample_stat() -> FileStat {
        FileStat {
            dev: 0xfd00,
            ino: 42,
            mode: 0o100644,
            nlink: 1,
            uid: 2000,
            gid: 2000,
            size: 1234,
            atime: 1_700_000_000,
            mtime: -5,
            ctime: 1_700_000_002,
        }
    }

    async fn read_request(server: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        server.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn ids_spell_their_tags() {
        assert_eq!(&ID_LIST_V2.to_le_bytes(), b"LIS2");
        assert_eq!(&ID_DONE.to_le_bytes(), b"DONE");
        assert_eq!(ID_DATA, 0x4154_4144);
    }

    #[test]
    fn stat_record_layout() {
        let raw = sample_stat().encode();
        assert_eq!(&raw[16..20], &0o100644u32.to_le_bytes());
        assert_eq!(&raw[48..56], &(-5i64).to_le_bytes());
        assert_eq!(FileStat::parse(&raw), sample_stat());
    }

    #[tokio::test]
    async fn list_reads_entries_until_done() {
        let (client, mut server) = duplex(4096);
        let mut conn = Connection::new(client);

        let peer = tokio::spawn(async move {
            let req = read_request(&mut server, 8 + 12).await;
            assert_eq!(&req[0..4], b"LIS2");
            assert_eq!(&req[4..8], &12u32.to_le_bytes());
            assert_eq!(&req[8..], b"/data/local/");

            let mut reply = Vec::new();
            for (name, err) in [("tmp", 0u32), ("secret", 13)] {
                reply.extend_from_slice(&ID_DENT_V2.to_le_bytes());
                reply.extend_from_slice(&err.to_le_bytes());
                reply.extend_from_slice(&sample_stat().encode());
                reply.extend_from_slice(&(name.len() as u32).to_le_bytes());
                reply.extend_from_slice(name.as_bytes());
            }
            reply.extend_from_slice(&ID_DONE.to_le_bytes());
            reply.extend_from_slice(&[0u8; FILE_STAT_SIZE + 8]);
            server.write_all(&reply).await.unwrap();
            server
        });

        let entries = list_directory(&mut conn, "/data/local/").await.unwrap();
        let _server = peer.await.unwrap();
        assert_eq!(
            entries,
            vec![
                DirectoryEntry {
                    name: "tmp".into(),
                    stat: StatResult::Stat(sample_stat()),
                },
                DirectoryEntry {
                    name: "secret".into(),
                    stat: StatResult::Error(13),
                },
            ]
        );
    }

    #[tokio::test]
    async fn list_rejects_unknown_id() {
        let (client, mut server) = duplex(4096);
        let mut conn = Connection::new(client);

        let mut reply = ID_OKAY.to_le_bytes().to_vec();
        reply.extend_from_slice(&[0u8; FILE_STAT_SIZE + 8]);
        server.write_all(&reply).await.unwrap();

        let err = list_directory(&mut conn, "/").await.unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn stat_uses_lstat_without_follow() {
        let (client, mut server) = duplex(4096);
        let mut conn = Connection::new(client);

        let peer = tokio::spawn(async move {
            let req = read_request(&mut server, 8 + 7).await;
            assert_eq!(&req[0..4], b"LST2");
            let mut reply = header(ID_LSTAT_V2, 0);
            reply.extend_from_slice(&sample_stat().encode());
            server.write_all(&reply).await.unwrap();
            server
        });

        let result = stat(&mut conn, "/sdcard", false).await.unwrap();
        let _server = peer.await.unwrap();
        assert_eq!(result, StatResult::Stat(sample_stat()));
    }

    #[tokio::test]
    async fn stat_reports_errno() {
        let (client, mut server) = duplex(4096);
        let mut conn = Connection::new(client);

        let mut reply = header(ID_STAT_V2, 2);
        reply.extend_from_slice(&[0u8; FILE_STAT_SIZE]);
        server.write_all(&reply).await.unwrap();

        let result = stat(&mut conn, "/missing", true).await.unwrap();
        assert_eq!(result, StatResult::Error(2));
    }

    #[tokio::test]
    async fn stat_fail_carries_message() {
        let (client, mut server) = duplex(4096);
        let mut conn = Connection::new(client);

        let mut reply = header(ID_FAIL, 17);
        reply.extend_from_slice(&[0u8; FILE_STAT_SIZE]);
        reply.extend_from_slice(b"permission denied");
        server.write_all(&reply).await.unwrap();

        let err = stat(&mut conn, "/root", true).await.unwrap_err();
        assert_eq!(err.to_string(), "permission denied");
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn pull_yields_chunks_then_none() {
        let (client, mut server) = duplex(4096);

        let peer = tokio::spawn(async move {
            let req = read_request(&mut server, 8 + 9 + 8).await;
            assert_eq!(&req[0..4], b"RCV2");
            assert_eq!(&req[8..17], b"/etc/host");
            assert_eq!(&req[17..21], b"RCV2");
            assert_eq!(&req[21..25], &[0, 0, 0, 0]);

            let mut reply = header(ID_DATA, 5);
            reply.extend_from_slice(b"hello");
            reply.extend_from_slice(&header(ID_DATA, 1));
            reply.extend_from_slice(b"!");
            reply.extend_from_slice(&header(ID_DONE, 0));
            server.write_all(&reply).await.unwrap();
            server
        });

        let mut pull = PullStream::open(Connection::new(client), "/etc/host")
            .await
            .unwrap();
        assert_eq!(pull.recv().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(pull.recv().await.unwrap(), Some(b"!".to_vec()));
        assert_eq!(pull.recv().await.unwrap(), None);
        let _server = peer.await.unwrap();
    }

    #[tokio::test]
    async fn pull_fail_is_device_error() {
        let (client, mut server) = duplex(4096);
        let mut reply = header(ID_FAIL, 14);
        reply.extend_from_slice(b"No such file.");
        reply.push(b'\n');
        server.write_all(&reply).await.unwrap();

        let mut pull = PullStream::open(Connection::new(client), "/nope")
            .await
            .unwrap();
        let err = pull.recv().await.unwrap_err();
        assert!(matches!(err, AdbError::Device(ref msg) if msg == "No such file.\n"));
    }

    #[tokio::test]
    async fn pull_rejects_chunk_above_max_data() {
        let (client, mut server) = duplex(1 << 20);
        let oversized = (MAX_DATA + 1) as u32;
        let mut reply = header(ID_DATA, oversized);
        reply.extend_from_slice(&vec![0u8; MAX_DATA + 1]);
        server.write_all(&reply).await.unwrap();

        let mut pull = PullStream::open(Connection::new(client), "/sdcard/big.bin")
            .await
            .unwrap();
        let err = pull.recv().await.unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
        assert!(matches!(pull.recv().await.unwrap_err(), AdbError::Closed));
    }

    #[tokio::test]
    async fn pull_rejects_huge_fail_length() {
        let (client, mut server) = duplex(4096);
        server.write_all(&header(ID_FAIL, u32::MAX)).await.unwrap();

        let mut pull = PullStream::open(Connection::new(client), "/nope")
            .await
            .unwrap();
        assert!(matches!(
            pull.recv().await.unwrap_err(),
            AdbError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn list_rejects_overlong_name() {
        let (client, mut server) = duplex(4096);
        let mut conn = Connection::new(client);

        let mut reply = ID_DENT_V2.to_le_bytes().to_vec();
        reply.extend_from_slice(&0u32.to_le_bytes());
        reply.extend_from_slice(&sample_stat().encode());
        reply.extend_from_slice(&u32::MAX.to_le_bytes());
        server.write_all(&reply).await.unwrap();

        let err = list_directory(&mut conn, "/").await.unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn stat_rejects_huge_fail_length() {
        let (client, mut server) = duplex(4096);
        let mut conn = Connection::new(client);

        let mut reply = header(ID_FAIL, 0xffff_fff0);
        reply.extend_from_slice(&[0u8; FILE_STAT_SIZE]);
        server.write_all(&reply).await.unwrap();

        let err = stat(&mut conn, "/root", true).await.unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn push_rejects_huge_fail_receipt() {
        let (client, mut server) = duplex(4096);
        let push = PushStream::open(Connection::new(client), "/system/x", 0o644)
            .await
            .unwrap();
        server.write_all(&header(ID_FAIL, u32::MAX)).await.unwrap();

        assert!(matches!(
            push.finish(0).await.unwrap_err(),
            AdbError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn push_sends_chunks_and_reads_receipt() {
        let (client, mut server) = duplex(8192);

        let peer = tokio::spawn(async move {
            let req = read_request(&mut server, 8 + 8 + 12).await;
            assert_eq!(&req[0..4], b"SND2");
            assert_eq!(&req[8..16], b"/tmp/out");
            assert_eq!(&req[16..20], b"SND2");
            assert_eq!(&req[20..24], &0o644u32.to_le_bytes());

            let data = read_request(&mut server, 8 + 3).await;
            assert_eq!(data, [header(ID_DATA, 3), b"abc".to_vec()].concat());
            let done = read_request(&mut server, 8).await;
            assert_eq!(done, header(ID_DONE, 1_700_000_000));

            server.write_all(&header(ID_OKAY, 0)).await.unwrap();
            server
        });

        let mut push = PushStream::open(Connection::new(client), "/tmp/out", 0o644)
            .await
            .unwrap();
        push.send(b"abc").await.unwrap();
        push.finish(1_700_000_000).await.unwrap();
        let _server = peer.await.unwrap();
    }

    #[tokio::test]
    async fn push_rejects_oversized_chunk_and_closes() {
        let (client, _server) = duplex(1 << 20);
        let mut push = PushStream::open(Connection::new(client), "/tmp/big", 0o644)
            .await
            .unwrap();

        let chunk = vec![0u8; MAX_DATA + 1];
        let err = push.send(&chunk).await.unwrap_err();
        assert!(matches!(err, AdbError::ChunkTooLarge { len: 65_537, .. }));
        assert!(push.is_closed());
        assert!(matches!(
            push.send(b"more").await.unwrap_err(),
            AdbError::Closed
        ));
    }

    #[tokio::test]
    async fn push_accepts_exactly_max_chunk() {
        let (client, mut server) = duplex(1 << 20);
        let mut push = PushStream::open(Connection::new(client), "/tmp/big", 0o644)
            .await
            .unwrap();

        push.send(&vec![7u8; MAX_DATA]).await.unwrap();
        let mut skip = vec![0u8; 8 + 8 + 12 + 8 + MAX_DATA];
        server.read_exact(&mut skip).await.unwrap();
        assert_eq!(&skip[28..36], &header(ID_DATA, MAX_DATA as u32)[..]);
    }

    #[tokio::test]
    async fn push_fail_receipt_is_error() {
        let (client, mut server) = duplex(4096);
        let push = PushStream::open(Connection::new(client), "/system/x", 0o644)
            .await
            .unwrap();

        let mut reply = header(ID_FAIL, 21);
        reply.extend_from_slice(b"Read-only file system");
        server.write_all(&reply).await.unwrap();

        let err = push.finish(0).await.unwrap_err();
        assert_eq!(err.to_string(), "Read-only file system");
    }
}
