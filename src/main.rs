//! jupyter-keeper: Jupyter session lifecycle service.
//!
//! Serves the session API, sweeps expired and dead sessions in the
//! background, and shuts down cleanly on Ctrl-C or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use jupyter_keeper::config::KeeperConfig;
use jupyter_keeper::instance::InstanceManager;
use jupyter_keeper::instance::credentials::CommandHasher;
use jupyter_keeper::instance::launcher::ScriptLauncher;
use jupyter_keeper::instance::registry::InstanceRegistry;
use jupyter_keeper::logging;
use jupyter_keeper::paths::KeeperPaths;
use jupyter_keeper::server::{self, AppState};

/// Jupyter session lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "jupyter-keeper", version, about = "Jupyter session lifecycle manager")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/jupyter-keeper/keeper.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8000
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Registry file tracking running sessions
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Launcher program that starts one notebook server
    #[arg(long)]
    launcher: Option<PathBuf>,

    /// Host name or IP placed in session URLs
    #[arg(long)]
    public_host: Option<String>,
}

impl Args {
    fn apply(self, config: &mut KeeperConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(state_file) = self.state_file {
            config.state_file = Some(state_file);
        }
        if let Some(launcher) = self.launcher {
            config.launcher = launcher;
        }
        if let Some(public_host) = self.public_host {
            config.public_host = public_host;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    let paths = KeeperPaths::resolve().unwrap_or_else(KeeperPaths::system);
    let _log_guard = logging::init(&paths.logs);
    if let Err(e) = paths.ensure() {
        warn!(error = %e, data = %paths.data.display(), "could not create data directories");
    }

    let mut config = KeeperConfig::load(args.config.take().as_deref(), &paths)?;
    args.apply(&mut config);

    let state_file = config.state_file(&paths);
    info!(
        bind = %config.bind,
        state_file = %state_file.display(),
        launcher = %config.launcher.display(),
        "jupyter-keeper starting"
    );

    let launcher = Arc::new(ScriptLauncher::new(
        config.launcher.clone(),
        config.launcher_timeout(),
    ));
    let mut manager = InstanceManager::new(
        config.manager_settings(),
        InstanceRegistry::new(state_file),
        launcher,
    );
    if let Some((program, args)) = config
        .credentials
        .hash_command
        .as_ref()
        .and_then(|cmd| cmd.split_first())
    {
        manager = manager.with_hasher(Arc::new(CommandHasher::new(
            program,
            args.to_vec(),
            std::time::Duration::from_secs(config.credentials.hash_timeout_secs),
        )));
    }
    let manager = Arc::new(manager);

    let startup = manager
        .reconcile()
        .context("initial reconciliation of the session registry")?;
    info!(
        removed = startup.removed.len(),
        retained = startup.retained,
        "registry loaded"
    );

    let sweeper = config
        .sweep_interval()
        .map(|interval| manager.spawn_sweeper(interval));

    let app = server::router(AppState::new(Arc::clone(&manager), config.public_host.clone()));
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(addr = %config.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("jupyter-keeper stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}
