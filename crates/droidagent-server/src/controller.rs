//! The single owner of the emulator lifecycle. Every transition happens under one mutex and is
//! republished through the state broadcaster.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use droidagent_proto::droidagent::v1::{agent_state, AgentState};
use tokio::sync::Mutex;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::broadcaster::{Broadcaster, Listener};
use crate::console::TouchInput;
use crate::display::Frame;
use crate::emulator::{EmulatorHandle, LaunchOptions, Launcher, Monitor};
use crate::status::emulator_status;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmulatorState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl EmulatorState {
    fn to_proto(self) -> agent_state::EmulatorState {
        match self {
            EmulatorState::Stopped => agent_state::EmulatorState::Off,
            EmulatorState::Starting => agent_state::EmulatorState::Starting,
            EmulatorState::Running => agent_state::EmulatorState::Running,
            EmulatorState::Error => agent_state::EmulatorState::Error,
        }
    }
}

impl fmt::Display for EmulatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EmulatorState::Stopped => "stopped",
            EmulatorState::Starting => "starting",
            EmulatorState::Running => "running",
            EmulatorState::Error => "error",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: EmulatorState,
    emulator: Option<Arc<dyn EmulatorHandle>>,
    error: Option<String>,
    /// Bumped on every launch so reports from an earlier emulator are ignored.
    instance: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    launcher: Box<dyn Launcher>,
    states: Broadcaster<AgentState>,
    frames: Broadcaster<Option<Arc<Frame>>>,
}

impl Shared {
    fn publish(&self, inner: &Inner) {
        self.states.broadcast(AgentState {
            emulator_state: inner.state.to_proto() as i32,
            emulator_error: inner.error.clone(),
        });
    }
}

#[derive(Clone)]
pub struct ControlPlane {
    shared: Arc<Shared>,
}

impl ControlPlane {
    pub fn new<L: Launcher + 'static>(launcher: L) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: EmulatorState::Stopped,
                emulator: None,
                error: None,
                instance: 0,
            }),
            launcher: Box::new(launcher),
            states: Broadcaster::new(),
            frames: Broadcaster::new(),
        });
        shared.states.broadcast(AgentState {
            emulator_state: agent_state::EmulatorState::Off as i32,
            emulator_error: None,
        });
        shared.frames.broadcast(None);
        Self { shared }
    }

    /// Listener whose first wait yields the current state.
    pub fn states(&self) -> Listener<AgentState> {
        self.shared.states.listen()
    }

    /// Listener whose first wait yields the current frame; `None` means no display.
    pub fn frames(&self) -> Listener<Option<Arc<Frame>>> {
        self.shared.frames.listen()
    }

    pub async fn state(&self) -> EmulatorState {
        self.shared.inner.lock().await.state
    }

    pub async fn start(&self, options: LaunchOptions) -> Result<(), Status> {
        let mut inner = self.shared.inner.lock().await;
        if !matches!(inner.state, EmulatorState::Stopped | EmulatorState::Error) {
            return Err(Status::failed_precondition("emulator already running"));
        }

        inner.instance += 1;
        let monitor = Arc::new(InstanceMonitor {
            shared: Arc::downgrade(&self.shared),
            instance: inner.instance,
        });

        match self.shared.launcher.launch(options, monitor) {
            Ok(emulator) => {
                info!("emulator starting (instance {})", inner.instance);
                inner.state = EmulatorState::Starting;
                inner.emulator = Some(emulator);
                inner.error = None;
                self.shared.publish(&inner);
                Ok(())
            }
            Err(err) => {
                warn!("emulator launch failed: {err}");
                let message = err.to_string();
                inner.state = EmulatorState::Error;
                inner.emulator = None;
                inner.error = Some(message.clone());
                self.shared.publish(&inner);
                Err(Status::internal(message))
            }
        }
    }

    pub async fn stop(&self, force: bool) -> Result<(), Status> {
        let (emulator, instance) = {
            let inner = self.shared.inner.lock().await;
            match (&inner.state, &inner.emulator) {
                (EmulatorState::Running, Some(emulator)) => (Arc::clone(emulator), inner.instance),
                _ => return Err(Status::failed_precondition("emulator is not running")),
            }
        };

        info!("stopping emulator (force={force})");
        if let Err(err) = emulator.stop(force).await {
            warn!("emulator stop failed: {err}");
            let mut inner = self.shared.inner.lock().await;
            if inner.instance == instance && inner.emulator.is_some() {
                inner.state = EmulatorState::Error;
                inner.emulator = None;
                inner.error = Some(err.to_string());
                self.shared.publish(&inner);
            }
            return Err(emulator_status(err));
        }
        Ok(())
    }

    pub async fn send_input(&self, touch: TouchInput) -> Result<(), Status> {
        let emulator = {
            let inner = self.shared.inner.lock().await;
            match (&inner.state, &inner.emulator) {
                (EmulatorState::Starting | EmulatorState::Running, Some(emulator)) => {
                    Arc::clone(emulator)
                }
                _ => return Err(Status::failed_precondition("emulator not running")),
            }
        };
        emulator.send_input(touch).await.map_err(emulator_status)
    }

    /// Gate for adb-backed operations.
    pub async fn require_running(&self) -> Result<(), Status> {
        if self.state().await != EmulatorState::Running {
            return Err(Status::failed_precondition("emulator not running"));
        }
        Ok(())
    }
}

/// Monitor handed to one launch. Holds only a weak reference back to the control plane.
struct InstanceMonitor {
    shared: Weak<Shared>,
    instance: u64,
}

#[tonic::async_trait]
impl Monitor for InstanceMonitor {
    async fn on_started(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock().await;
        if inner.instance != self.instance || inner.state != EmulatorState::Starting {
            debug!(
                "ignoring start report from instance {} in state {}",
                self.instance, inner.state
            );
            return;
        }
        info!("emulator running");
        inner.state = EmulatorState::Running;
        shared.publish(&inner);
    }

    async fn on_exit(&self, error: Option<String>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock().await;
        if inner.instance != self.instance || inner.emulator.is_none() {
            debug!("ignoring exit report from instance {}", self.instance);
            return;
        }
        inner.state = if error.is_some() {
            EmulatorState::Error
        } else {
            EmulatorState::Stopped
        };
        inner.emulator = None;
        inner.error = error;
        shared.publish(&inner);
        shared.frames.broadcast(None);
    }

    async fn on_frame(&self, frame: Frame) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let inner = shared.inner.lock().await;
        if inner.instance != self.instance || inner.emulator.is_none() {
            return;
        }
        shared.frames.broadcast(Some(Arc::new(frame)));
    }
}
