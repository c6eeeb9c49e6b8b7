//! `dryercontrold`: drives one or more filament-drying chambers over
//! Moonraker. This binary owns process wiring only - argument parsing,
//! config loading, logger installation, and handing the assembled pieces
//! to the [`Supervisor`] loop and the HTTP control surface; the control
//! logic itself lives in [`control`], the hardware drivers in [`hardware`].

mod cc_fs;
mod config;
mod control;
mod error;
mod hardware;
mod http;
mod logger;
mod model;
mod moonraker;
mod store;
mod supervisor;

use crate::config::{Config, DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE};
use crate::moonraker::MoonrakerClient;
use crate::store::{InMemoryStore, Store};
use crate::supervisor::Supervisor;
use anyhow::Result;
use clap::Parser;
use log::{LevelFilter, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use tokio_util::sync::CancellationToken;

/// Drives filament-drying chambers over Moonraker.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file (default: /etc/dryercontrold/config.toml).
    #[clap(long)]
    config: Option<PathBuf>,

    /// Overrides `daemon.data_directory` from the config file.
    #[clap(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Increases log verbosity; repeat for more (-v = debug, -vv = trace).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decreases log verbosity; repeat for less (-q = warn, -qq = error).
    #[clap(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

/// `LevelFilter` ordinals, least to most verbose, with `Info` (index 2) as
/// the zero-verbosity default: `-v`/`-q` walk this scale up/down.
const LOG_LEVELS: [LevelFilter; 5] = [
    LevelFilter::Error,
    LevelFilter::Warn,
    LevelFilter::Info,
    LevelFilter::Debug,
    LevelFilter::Trace,
];

fn log_level(verbose: u8, quiet: u8) -> LevelFilter {
    let base = 2_i32;
    let index = (base + verbose as i32 - quiet as i32).clamp(0, LOG_LEVELS.len() as i32 - 1);
    LOG_LEVELS[index as usize]
}

fn main() -> Result<()> {
    let args = Args::parse();
    cc_fs::runtime(run(args))
}

async fn run(args: Args) -> Result<()> {
    let level = log_level(args.verbose, args.quiet);
    let (log_handle, log_actor) = logger::init(level);
    tokio::task::spawn_local(log_actor.run());

    info!("dryercontrold starting up");

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE));
    let mut config = Config::load(&config_path).await?;
    info!("loaded config from {}", config_path.display());

    if let Some(data_dir) = args.data_dir {
        config.daemon.data_directory = data_dir;
    }
    cc_fs::create_dir_all(&config.daemon.data_directory)
        .await
        .map_err(|e| anyhow::anyhow!("could not create data directory {}: {e}", config.daemon.data_directory.display()))?;
    info!("using data directory {}", config.daemon.data_directory.display());

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.bind_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_address/bind_port: {e}"))?;

    let moonraker = Rc::new(MoonrakerClient::new(
        config.moonraker.base_url.clone(),
        config.moonraker.api_key.clone(),
    ));
    let store: Rc<dyn Store> = Rc::new(InMemoryStore::new());

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let mut supervisor = Supervisor::new(store, moonraker, log_handle.clone());
    let http_state = http::AppState {
        supervisor: supervisor.handle(),
        logs: log_handle,
    };

    let cancel_supervisor = cancel.clone();
    let cancel_http = cancel;

    // The supervisor's tick loop and the HTTP control surface are sibling
    // tasks sharing one cancellation token; this scope doesn't return until
    // both have wound down, so nothing leaks past `run`'s end.
    moro_local::async_scope!(|scope| {
        scope.spawn(async move {
            supervisor.run(cancel_supervisor).await;
        });
        scope.spawn(async move {
            if let Err(e) = http::serve(bind_addr, http_state, cancel_http).await {
                log::error!("HTTP control surface exited with an error: {e}");
            }
        });
    })
    .await;

    info!("dryercontrold shut down");
    Ok(())
}

/// Cancels `cancel` on the first of SIGINT/SIGTERM, whichever arrives
/// first. A second signal during shutdown just terminates the process the
/// normal way, since the supervisor loop exits promptly on cancellation.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::task::spawn_local(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(e) => {
                    log::error!("failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_verbosity_is_info() {
        assert_eq!(log_level(0, 0), LevelFilter::Info);
    }

    #[test]
    fn verbose_flags_walk_up_to_trace_and_no_further() {
        assert_eq!(log_level(1, 0), LevelFilter::Debug);
        assert_eq!(log_level(2, 0), LevelFilter::Trace);
        assert_eq!(log_level(5, 0), LevelFilter::Trace);
    }

    #[test]
    fn quiet_flags_walk_down_to_error_and_no_further() {
        assert_eq!(log_level(0, 1), LevelFilter::Warn);
        assert_eq!(log_level(0, 2), LevelFilter::Error);
        assert_eq!(log_level(0, 5), LevelFilter::Error);
    }

    #[test]
    fn verbose_and_quiet_offset_each_other() {
        assert_eq!(log_level(2, 2), LevelFilter::Info);
    }
}
