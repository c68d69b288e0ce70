mod broadcaster;
mod console;
mod controller;
mod display;
mod emulator;
mod service;
mod status;
mod syslog;

use std::path::Path;

use droidagent_adb::{default_key_path, start_server};
use droidagent_proto::droidagent::v1::agent_controller_server::AgentControllerServer;
use droidagent_util::{init_tracing, serve_grpc, AgentConfig};
use tracing::info;

use controller::ControlPlane;
use emulator::{EmulatorSettings, ProcessLauncher};
use service::Svc;
use syslog::SysLog;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let cfg = AgentConfig::load();
    if cfg.start_adb_server {
        let adb = cfg.adb_path();
        info!("starting adb server with {}", adb.display());
        start_server(&adb, &default_key_path()).await?;
    }

    let syslog = SysLog::start(Path::new(&cfg.syslog_socket))?;
    let settings = EmulatorSettings::from_config(&cfg);
    let adb = settings.adb.clone();
    let plane = ControlPlane::new(ProcessLauncher::new(settings));
    let svc = Svc::new(plane, adb, syslog);

    serve_grpc("droidagent-server", &cfg.listen_addr, |server| {
        server.add_service(AgentControllerServer::new(svc))
    })
    .await
}
