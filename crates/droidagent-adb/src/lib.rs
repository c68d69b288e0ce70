//! Host side of the Android Debug Bridge: wire framing, the sync file service, shell v2 sessions,
//! and daemon bootstrap.

mod error;
mod host;
mod server;
pub mod shell;
pub mod sync;
mod transport;

pub use error::{AdbError, AdbResult};
pub use host::{AdbClient, DEFAULT_SERVER_ADDR};
pub use server::{default_key_path, start_server};
pub use shell::{ShellEvent, ShellKind, ShellReader, ShellRequest, ShellWriter};
pub use sync::{DirectoryEntry, FileStat, PullStream, PushStream, StatResult, MAX_DATA};
pub use transport::Connection;
