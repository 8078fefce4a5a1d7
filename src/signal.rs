use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::config::Config;
use crate::mgmt;

/// Spawn a thread that handles SIGHUP by reloading the configuration from disk
pub fn spawn_sighup_handler(
    config: Arc<ArcSwap<Config>>,
    config_path: PathBuf,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let mut signals = Signals::new([SIGHUP])?;

    std::thread::Builder::new()
        .name("sighup".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                if sig == SIGHUP {
                    info!("received SIGHUP, reloading configuration");
                    match mgmt::reload_from_disk(&config, &config_path) {
                        Ok(generation) => info!(generation, "reloaded configuration"),
                        Err(e) => error!(%e, "failed to reload configuration"),
                    }
                }
            }
        })
}
