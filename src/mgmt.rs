use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::leasedb::{Binding, LeaseDb};

#[derive(Deserialize)]
#[serde(tag = "command")]
pub enum MgmtRequest {
    #[serde(rename = "reload")]
    Reload,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "bindings")]
    Bindings,
}

#[derive(Serialize, Default)]
pub struct MgmtResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_bindings: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindings: Option<Vec<Binding>>,
}

impl MgmtResponse {
    fn failure(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Main management listener loop
pub fn listener(
    listener: TcpListener,
    config: Arc<ArcSwap<Config>>,
    leases: Arc<LeaseDb>,
    config_path: PathBuf,
) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                handle_client(stream, &config, &leases, &config_path);
                if let Some(addr) = peer {
                    info!(%addr, "handled management request");
                }
            }
            Err(e) => {
                warn!(%e, "failed to accept management connection");
            }
        }
    }
}

fn handle_client(stream: TcpStream, config: &ArcSwap<Config>, leases: &LeaseDb, config_path: &Path) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    stream.set_write_timeout(Some(Duration::from_secs(5))).ok();

    let mut reader = BufReader::new(&stream);
    let mut line = String::new();

    match reader.read_line(&mut line) {
        Ok(0) => return, // EOF
        Ok(_) => {}
        Err(e) => {
            warn!(%e, "failed to read from management client");
            return;
        }
    }

    let response = handle_request(&line, config, leases, config_path);

    let mut writer = stream;
    if let Err(e) = serde_json::to_writer(&mut writer, &response) {
        warn!(%e, "failed to write response");
    }
    let _ = writer.write_all(b"\n");
}

/// Answer one JSON line from a management client.
pub fn handle_request(
    line: &str,
    config: &ArcSwap<Config>,
    leases: &LeaseDb,
    config_path: &Path,
) -> MgmtResponse {
    match serde_json::from_str::<MgmtRequest>(line) {
        Ok(MgmtRequest::Reload) => match reload_from_disk(config, config_path) {
            Ok(generation) => MgmtResponse {
                success: true,
                message: Some(format!("Reloaded configuration generation {generation}")),
                generation: Some(generation),
                ..Default::default()
            },
            Err(e) => MgmtResponse::failure(e.to_string()),
        },
        Ok(MgmtRequest::Status) => MgmtResponse {
            success: true,
            message: Some("Status OK".into()),
            generation: Some(config.load().generation),
            active_bindings: Some(leases.active_count()),
            ..Default::default()
        },
        Ok(MgmtRequest::Bindings) => {
            let mut bindings = leases.active_bindings();
            bindings.sort_by(|a, b| (&a.key.link, a.address).cmp(&(&b.key.link, b.address)));
            MgmtResponse {
                success: true,
                active_bindings: Some(bindings.len()),
                bindings: Some(bindings),
                ..Default::default()
            }
        }
        Err(e) => MgmtResponse::failure(format!("Invalid request: {}", e)),
    }
}

/// Load the configuration from disk and swap it in as the next generation.
///
/// The running configuration is kept when the file fails to load or validate.
pub fn reload_from_disk(config: &ArcSwap<Config>, path: &Path) -> Result<u64, ConfigError> {
    let mut next = Config::load(path)?;
    next.generation = config.load().generation + 1;
    let generation = next.generation;
    let links = next.links.len();
    config.store(Arc::new(next));

    info!(generation, links, path = %path.display(), "reloaded configuration from disk");
    Ok(generation)
}
