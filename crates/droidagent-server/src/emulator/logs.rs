use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::info;

const ERROR_PREFIX: &str = "ERROR   |";
const WARNING_PREFIX: &str = "WARNING |";
const INFO_PREFIX: &str = "INFO    |";

/// Tracks the most recent `ERROR` block on the emulator's stderr. A block starts at an `ERROR`
/// line and runs until the next `WARNING` or `INFO` line.
#[derive(Debug, Default)]
pub(crate) struct ErrorBlock {
    in_error: bool,
    text: String,
}

impl ErrorBlock {
    pub(crate) fn observe(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
            self.in_error = true;
            self.text = rest.to_string();
        } else if line.starts_with(WARNING_PREFIX) || line.starts_with(INFO_PREFIX) {
            self.in_error = false;
        } else if self.in_error {
            self.text.push('\n');
            self.text.push_str(line);
        }
    }

    pub(crate) fn last_error(&self) -> String {
        self.text.trim().to_string()
    }
}

/// Logs both output streams until each reaches EOF, and returns the last error block seen on
/// stderr.
pub(crate) async fn merge_logs<O, E>(stdout: O, stderr: E) -> String
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let mut out_open = true;
    let mut err_open = true;
    let mut block = ErrorBlock::default();

    while out_open || err_open {
        tokio::select! {
            line = out.next_line(), if out_open => match line {
                Ok(Some(line)) => info!(target: "emulator", "[OUT] {line}"),
                _ => out_open = false,
            },
            line = err.next_line(), if err_open => match line {
                Ok(Some(line)) => {
                    info!(target: "emulator", "[ERR] {line}");
                    block.observe(&line);
                }
                _ => err_open = false,
            },
        }
    }

    info!("emulator output end reached");
    block.last_error()
}
