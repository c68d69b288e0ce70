//! Bootstraps the adb host daemon through the `adb` binary.

use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use tokio::process::Command;
use tracing::info;

use crate::error::{AdbError, AdbResult};

async fn adb_output(adb: &Path, args: &[&str]) -> AdbResult<Output> {
    let output = Command::new(adb)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                AdbError::NotFound(adb.to_path_buf())
            } else {
                AdbError::Io(e)
            }
        })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(AdbError::Exit {
            command: args.first().copied().unwrap_or_default().to_string(),
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn log_output(output: &Output) {
    for line in String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
    {
        if !line.trim().is_empty() {
            info!(target: "adb", "{line}");
        }
    }
}

pub fn default_key_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".into());
    PathBuf::from(home).join(".android").join("adbkey")
}

/// Regenerates the host key at `key_path` and starts the daemon.
pub async fn start_server(adb: &Path, key_path: &Path) -> AdbResult<()> {
    if let Some(dir) = key_path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    info!("generating adb key at {}", key_path.display());
    let key = key_path.to_string_lossy();
    let output = adb_output(adb, &["keygen", key.as_ref()]).await?;
    log_output(&output);
    set_owner_only(key_path).await?;

    info!("starting adb server");
    let output = adb_output(adb, &["start-server"]).await?;
    log_output(&output);
    Ok(())
}

async fn set_owner_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("adb");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn keygen_then_start_server() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls");
        let adb = write_script(
            dir.path(),
            &format!(
                "echo \"$@\" >> {log}\n[ \"$1\" = keygen ] && touch \"$2\"\nexit 0",
                log = log.display()
            ),
        );
        let key = dir.path().join("home/.android/adbkey");

        start_server(&adb, &key).await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls, vec![format!("keygen {}", key.display()).as_str(), "start-server"]);
        let mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn failing_binary_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        let adb = write_script(dir.path(), "echo 'daemon not running' >&2\nexit 3");

        let err = start_server(&adb, &dir.path().join("adbkey"))
            .await
            .unwrap_err();
        match err {
            AdbError::Exit {
                command,
                status,
                stderr,
                ..
            } => {
                assert_eq!(command, "keygen");
                assert_eq!(status, 3);
                assert_eq!(stderr.trim(), "daemon not running");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = start_server(&dir.path().join("nope"), &dir.path().join("adbkey"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdbError::NotFound(_)));
    }
}
