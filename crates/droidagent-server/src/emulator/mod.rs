//! Emulator process supervision. [`Emulator::start`] writes the AVD, spawns the emulator in its
//! own process group and leaves three tasks behind: one merging the output streams, one waiting
//! for exit, and one bringing the console and adb up. Progress is reported through [`Monitor`].

mod avd;
mod logs;

use std::{
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use droidagent_adb::{AdbClient, AdbError};
use droidagent_util::AgentConfig;
use thiserror::Error;
use tokio::{process::Command, sync::watch};
use tracing::{info, warn};

use crate::console::{Console, TouchInput};
use crate::display::Frame;

pub use avd::HardwareProfile;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("invalid emulator config: {0}")]
    Config(String),
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to spawn emulator: {0}")]
    Spawn(#[source] io::Error),
    #[error("emulator not ready")]
    NotReady,
    #[error("console request failed: {}", .0.message())]
    Console(#[from] tonic::Status),
    #[error(transparent)]
    Adb(#[from] AdbError),
    #[error("failed to signal emulator: {0}")]
    Signal(#[source] io::Error),
    #[error("shared memory setup failed: {0}")]
    SharedMemory(#[source] io::Error),
}

/// Lifecycle events a running emulator reports to its owner.
#[tonic::async_trait]
pub trait Monitor: Send + Sync + 'static {
    /// The console is up, adb sees the device, and root was granted if requested.
    async fn on_started(&self);

    /// The process is gone. `None` for a clean or requested exit.
    async fn on_exit(&self, error: Option<String>);

    async fn on_frame(&self, frame: Frame);
}

/// Host-side locations and flags shared by every launch.
#[derive(Clone, Debug)]
pub struct EmulatorSettings {
    pub emulator_path: PathBuf,
    pub sdk_root: PathBuf,
    pub avd_home: PathBuf,
    pub system_image_dir: PathBuf,
    pub emulator_ports: String,
    pub console_port: u16,
    pub gpu_mode: String,
    pub syslog_socket: PathBuf,
    pub device_wait_timeout: Option<Duration>,
    pub adb: AdbClient,
}

impl EmulatorSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            emulator_path: cfg.emulator_path(),
            sdk_root: cfg.sdk_root(),
            avd_home: cfg.avd_home(),
            system_image_dir: cfg.system_image_dir(),
            emulator_ports: cfg.emulator_ports.clone(),
            console_port: cfg.console_port,
            gpu_mode: cfg.gpu_mode.clone(),
            syslog_socket: PathBuf::from(&cfg.syslog_socket),
            device_wait_timeout: cfg.device_wait_timeout(),
            adb: AdbClient::new(cfg.adb_server_addr.clone()),
        }
    }

    fn console_addr(&self) -> String {
        format!("127.0.0.1:{}", self.console_port)
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-avd".into(),
            avd::AVD_NAME.into(),
            "-ports".into(),
            self.emulator_ports.clone(),
            "-grpc".into(),
            self.console_port.to_string(),
            "-no-window".into(),
            "-skip-adb-auth".into(),
            "-no-snapshot-save".into(),
            "-wipe-data".into(),
            "-shell-serial".into(),
            format!("unix:{}", self.syslog_socket.display()),
            "-gpu".into(),
            self.gpu_mode.clone(),
            "-qemu".into(),
            "-append".into(),
            "panic=1".into(),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchOptions {
    pub profile: HardwareProfile,
    pub root_adb: bool,
}

/// A live emulator as seen by its owner.
#[tonic::async_trait]
pub trait EmulatorHandle: Send + Sync {
    async fn send_input(&self, touch: TouchInput) -> Result<(), EmulatorError>;

    async fn stop(&self, force: bool) -> Result<(), EmulatorError>;
}

pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        options: LaunchOptions,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Arc<dyn EmulatorHandle>, EmulatorError>;
}

/// Launches the real emulator binary.
pub struct ProcessLauncher {
    settings: Arc<EmulatorSettings>,
}

impl ProcessLauncher {
    pub fn new(settings: EmulatorSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        options: LaunchOptions,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Arc<dyn EmulatorHandle>, EmulatorError> {
        let emulator = Emulator::start(Arc::clone(&self.settings), options, monitor)?;
        Ok(Arc::new(emulator))
    }
}

pub struct Emulator {
    pgid: i32,
    console: Arc<OnceLock<Console>>,
    force_requested: Arc<AtomicBool>,
}

impl Emulator {
    pub fn start(
        settings: Arc<EmulatorSettings>,
        options: LaunchOptions,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self, EmulatorError> {
        let avd_dir = avd::write_avd(
            &settings.avd_home,
            &settings.system_image_dir,
            &options.profile,
        )?;
        info!("wrote avd to {}", avd_dir.display());

        let mut child = Command::new(&settings.emulator_path)
            .args(settings.args())
            .env("ANDROID_AVD_HOME", &settings.avd_home)
            .env("ANDROID_SDK_ROOT", &settings.sdk_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(EmulatorError::Spawn)?;

        let pgid = child
            .id()
            .ok_or_else(|| EmulatorError::Spawn(io::Error::other("emulator exited at spawn")))?
            as i32;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EmulatorError::Spawn(io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EmulatorError::Spawn(io::Error::other("stderr not captured")))?;
        info!("emulator started with pid {pgid}");

        let console = Arc::new(OnceLock::new());
        let force_requested = Arc::new(AtomicBool::new(false));
        let startup_error = Arc::new(Mutex::new(None::<String>));
        let (exited_tx, exited_rx) = watch::channel(false);

        let logs = tokio::spawn(logs::merge_logs(stdout, stderr));

        {
            let monitor = Arc::clone(&monitor);
            let force_requested = Arc::clone(&force_requested);
            let startup_error = Arc::clone(&startup_error);
            tokio::spawn(async move {
                let status = child.wait().await;
                let _ = exited_tx.send(true);
                let last_error = logs.await.unwrap_or_default();
                let startup = startup_error
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                let error = exit_error(
                    status,
                    force_requested.load(Ordering::SeqCst),
                    startup,
                    &last_error,
                );
                match &error {
                    Some(err) => warn!("emulator exited: {err}"),
                    None => info!("emulator exited"),
                }
                monitor.on_exit(error).await;
            });
        }

        {
            let console = Arc::clone(&console);
            let mut exited = exited_rx.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    result = bring_up(&settings, options, &monitor, &console, exited_rx) => result,
                    _ = exited.wait_for(|gone| *gone) => return,
                };
                if let Err(err) = result {
                    warn!("emulator startup failed: {err}");
                    *startup_error
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err.to_string());
                    if let Err(err) = kill_group(pgid) {
                        warn!("{err}");
                    }
                }
            });
        }

        Ok(Self {
            pgid,
            console,
            force_requested,
        })
    }
}

#[tonic::async_trait]
impl EmulatorHandle for Emulator {
    async fn send_input(&self, touch: TouchInput) -> Result<(), EmulatorError> {
        let console = self.console.get().ok_or(EmulatorError::NotReady)?;
        console.send_touch(touch).await
    }

    /// A forced stop kills the whole process group; otherwise the console is asked to shut the
    /// VM down.
    async fn stop(&self, force: bool) -> Result<(), EmulatorError> {
        if force {
            self.force_requested.store(true, Ordering::SeqCst);
            return kill_group(self.pgid);
        }
        let console = self.console.get().ok_or(EmulatorError::NotReady)?;
        console.request_exit().await
    }
}

async fn bring_up(
    settings: &EmulatorSettings,
    options: LaunchOptions,
    monitor: &Arc<dyn Monitor>,
    slot: &OnceLock<Console>,
    exited: watch::Receiver<bool>,
) -> Result<(), EmulatorError> {
    let console = Console::connect(&settings.console_addr()).await?;
    let console = slot.get_or_init(|| console).clone();

    tokio::spawn(pull_frames(
        console,
        options.profile.lcd_width,
        options.profile.lcd_height,
        Arc::clone(monitor),
        exited,
    ));

    info!("waiting for adb device");
    settings
        .adb
        .wait_for_device(settings.device_wait_timeout)
        .await?;
    if options.root_adb {
        settings.adb.root().await?;
    }

    monitor.on_started().await;
    Ok(())
}

async fn pull_frames(
    console: Console,
    width: u32,
    height: u32,
    monitor: Arc<dyn Monitor>,
    mut exited: watch::Receiver<bool>,
) {
    let pull = async {
        let mut frames = console.stream_frames(width, height).await?;
        while let Some(frame) = frames.next().await? {
            monitor.on_frame(frame).await;
        }
        Ok::<_, EmulatorError>(())
    };
    tokio::select! {
        result = pull => {
            if let Err(err) = result {
                warn!("display capture stopped: {err}");
            }
        }
        _ = exited.wait_for(|gone| *gone) => {}
    }
}

fn kill_group(pgid: i32) -> Result<(), EmulatorError> {
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        return Err(EmulatorError::Signal(io::Error::last_os_error()));
    }
    Ok(())
}

/// Classifies an exit. A startup failure wins; a SIGKILL after a requested force-stop and a zero
/// status are clean; anything else carries the last error block or the raw status.
fn exit_error(
    status: io::Result<ExitStatus>,
    force_requested: bool,
    startup_error: Option<String>,
    last_error: &str,
) -> Option<String> {
    if startup_error.is_some() {
        return startup_error;
    }
    let status = match status {
        Ok(status) => status,
        Err(err) => return Some(format!("failed to wait for emulator: {err}")),
    };
    if force_requested && status.signal() == Some(libc::SIGKILL) {
        return None;
    }
    if status.success() {
        return None;
    }
    if last_error.is_empty() {
        Some(format!("emulator exited with {status}"))
    } else {
        Some(last_error.to_string())
    }
}
