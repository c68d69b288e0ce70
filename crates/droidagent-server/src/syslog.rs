//! Fans the emulator's serial console out to every `StreamSysLog` caller. The emulator connects to
//! a Unix socket (`-shell-serial unix:<path>`); each line read from it is offered to every
//! listener without replaying history.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::UnixListener,
    sync::mpsc::{self, error::TrySendError},
};
use tracing::{info, warn};

pub const LISTENER_CAPACITY: usize = 100;

#[derive(Clone, Default)]
pub struct SysLog {
    listeners: Arc<Mutex<Vec<mpsc::Sender<String>>>>,
}

impl SysLog {
    /// Binds `socket_path`, replacing any stale socket, and starts accepting connections.
    pub fn start(socket_path: &Path) -> io::Result<Self> {
        match std::fs::remove_file(socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(socket_path)?;
        let syslog = Self::default();
        tokio::spawn(syslog.clone().accept_loop(listener, socket_path.to_path_buf()));
        Ok(syslog)
    }

    async fn accept_loop(self, listener: UnixListener, path: PathBuf) {
        info!("syslog listening on {}", path.display());
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    info!("syslog connection accepted");
                    self.pump(stream).await;
                }
                Err(err) => {
                    warn!("syslog accept error: {err}");
                    return;
                }
            }
        }
    }

    /// Reads lines from one console connection until it closes.
    async fn pump<R: AsyncRead + Unpin>(&self, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.publish(line),
                Ok(None) => break,
                Err(err) => {
                    warn!("syslog error: {err}");
                    break;
                }
            }
        }
    }

    /// Offers `line` to every listener. Full listeners drop it; closed listeners are removed.
    pub fn publish(&self, line: String) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.retain(|tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("syslog listener full - dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn listen(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
