use std::{net::SocketAddr, path::PathBuf};

use tonic::transport::{server::Router, Server};
use tracing::info;

mod config;

pub use config::AgentConfig;

pub const DEFAULT_AGENT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_CLIENT_ADDR: &str = "127.0.0.1:8080";

pub fn env_addr(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn client_addr() -> String {
    env_addr("DROIDAGENT_ADDR", DEFAULT_CLIENT_ADDR)
}

pub fn data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/droidagent")
    } else {
        PathBuf::from("/tmp/droidagent")
    }
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

pub async fn serve_grpc<F>(
    app_name: &str,
    addr: &str,
    add_service: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut Server) -> Router,
{
    let addr: SocketAddr = addr.parse()?;
    info!("{app_name} listening on {addr}");

    let mut server = Server::builder();
    add_service(&mut server).serve(addr).await?;
    Ok(())
}
