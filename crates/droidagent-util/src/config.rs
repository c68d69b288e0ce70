use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{data_dir, expand_user, DEFAULT_AGENT_ADDR};

const CONFIG_FILE: &str = "agent.json";

/// Runtime settings for the agent. Read from a JSON file, then overridden field by field from the
/// environment. Empty path fields are derived from `sdk_root`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub listen_addr: String,
    pub adb_server_addr: String,
    pub adb_path: String,
    pub sdk_root: String,
    pub avd_home: String,
    pub system_image_dir: String,
    pub console_port: u16,
    pub emulator_ports: String,
    pub gpu_mode: String,
    pub syslog_socket: String,
    pub device_wait_timeout_secs: Option<u64>,
    pub start_adb_server: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_AGENT_ADDR.into(),
            adb_server_addr: "127.0.0.1:5037".into(),
            adb_path: String::new(),
            sdk_root: "/android".into(),
            avd_home: String::new(),
            system_image_dir: String::new(),
            console_port: 8554,
            emulator_ports: "5556,5557".into(),
            gpu_mode: "swiftshader_indirect".into(),
            syslog_socket: "/tmp/sys-shell.sock".into(),
            device_wait_timeout_secs: None,
            start_adb_server: true,
        }
    }
}

impl AgentConfig {
    pub fn load() -> Self {
        let mut cfg = Self::load_file(&config_path());
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg
    }

    pub fn load_file(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<AgentConfig>(&data) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("failed to parse {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("failed to read {}: {err}", path.display());
                }
                Self::default()
            }
        }
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DROIDAGENT_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("DROIDAGENT_ADB_SERVER") {
            self.adb_server_addr = v;
        }
        if let Some(v) = get("DROIDAGENT_ADB_PATH") {
            self.adb_path = v;
        }
        if let Some(v) = get("ANDROID_SDK_ROOT") {
            self.sdk_root = v;
        }
        if let Some(v) = get("ANDROID_AVD_HOME") {
            self.avd_home = v;
        }
        if let Some(v) = get("DROIDAGENT_SYSTEM_IMAGE") {
            self.system_image_dir = v;
        }
        if let Some(v) = get("DROIDAGENT_CONSOLE_PORT") {
            match v.parse() {
                Ok(port) => self.console_port = port,
                Err(_) => warn!("ignoring invalid DROIDAGENT_CONSOLE_PORT={v}"),
            }
        }
        if let Some(v) = get("DROIDAGENT_GPU_MODE") {
            self.gpu_mode = v;
        }
        if let Some(v) = get("DROIDAGENT_SYSLOG_SOCKET") {
            self.syslog_socket = v;
        }
        if let Some(v) = get("DROIDAGENT_DEVICE_WAIT_SECS") {
            match v.parse() {
                Ok(secs) => self.device_wait_timeout_secs = Some(secs),
                Err(_) => warn!("ignoring invalid DROIDAGENT_DEVICE_WAIT_SECS={v}"),
            }
        }
        if let Some(v) = get("DROIDAGENT_START_ADB") {
            self.start_adb_server = !matches!(v.as_str(), "0" | "false" | "no");
        }
    }

    pub fn sdk_root(&self) -> PathBuf {
        expand_user(&self.sdk_root)
    }

    pub fn adb_path(&self) -> PathBuf {
        if self.adb_path.is_empty() {
            self.sdk_root().join("platform-tools").join("adb")
        } else {
            expand_user(&self.adb_path)
        }
    }

    pub fn emulator_path(&self) -> PathBuf {
        self.sdk_root().join("emulator").join("emulator")
    }

    pub fn avd_home(&self) -> PathBuf {
        if self.avd_home.is_empty() {
            self.sdk_root().join("home")
        } else {
            expand_user(&self.avd_home)
        }
    }

    pub fn system_image_dir(&self) -> PathBuf {
        if self.system_image_dir.is_empty() {
            self.sdk_root().join("system-image")
        } else {
            expand_user(&self.system_image_dir)
        }
    }

    pub fn device_wait_timeout(&self) -> Option<Duration> {
        self.device_wait_timeout_secs.map(Duration::from_secs)
    }
}

pub fn config_path() -> PathBuf {
    match std::env::var("DROIDAGENT_CONFIG") {
        Ok(path) if !path.trim().is_empty() => expand_user(&path),
        _ => data_dir().join(CONFIG_FILE),
    }
}
