use std::{
    fs::{File, OpenOptions},
    future::{pending, Future},
    io,
    path::Path,
    process::exit,
};

use anyhow::Context;
use clap::Parser;
use env_logger::Target;
use kube::Client;
use log::{error, info, warn, LevelFilter};
use ovnkube_core::{
    config::{
        external_ids::OvsVsctl,
        gateway::GatewaySettings,
        Config, DEFAULT_LOG_LEVEL,
    },
    exec::SystemCommands,
    kubernetes::operations::create_client,
};
use tokio::signal::{
    ctrl_c,
    unix::{signal, SignalKind},
};
use tokio_util::sync::CancellationToken;

use crate::{
    cli::Cli,
    node_agent::NodeAgent,
    orchestrator::KubeOrchestrator,
    pidfile::PidFile,
    supervisor::{run_control_plane, ExitStatus},
};

mod cli;
mod node_agent;
mod orchestrator;
mod pidfile;
mod reconciler;
mod supervisor;
mod watcher;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = get_config(&cli).await;

    if cli.ha {
        info!("Running against a replicated northbound database");
    }

    let pidfile = match &cli.pidfile {
        Some(path) => Some(get_pidfile(path).await),
        None => None,
    };

    let gateway = get_gateway(&cli);

    if !cli.runs_control_plane() && cli.init_node.is_none() {
        error!("Nothing to run! Pass --init-master, --net-controller or --init-node.");
        exit(1)
    }

    if cli.init_node.is_some() {
        if let Err(error) = config.require_token() {
            error!("{error}");
            exit(1)
        }
    }

    let client = get_client(&config).await;
    let shutdown = CancellationToken::new();

    let signals = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signals.cancel();
    });

    let control_plane = async {
        if !cli.runs_control_plane() {
            return ExitStatus::Clean;
        }

        let status = run_control_plane(&config, client.clone(), cli.nodeport, shutdown.clone()).await;
        shutdown.cancel();

        status
    };

    let node_agent = async {
        let Some(node) = cli.init_node.as_deref() else {
            return ExitStatus::Clean;
        };

        let orchestrator = KubeOrchestrator::new(client.clone());
        let external_ids = OvsVsctl::default();
        let agent = NodeAgent {
            node,
            north: &config.ovn_north,
            south: &config.ovn_south,
            gateway: gateway.as_ref(),
            orchestrator: &orchestrator,
            external_ids: &external_ids,
            commands: &SystemCommands,
        };

        match agent.run(shutdown.clone()).await {
            Ok(()) => ExitStatus::Clean,
            Err(error) => {
                error!("Node agent of '{node}' failed! {error}");
                shutdown.cancel();
                ExitStatus::Failed
            }
        }
    };

    let (control_plane, node_agent) = tokio::join!(control_plane, node_agent);
    let code = control_plane.code().max(node_agent.code());

    info!("Exiting with code {code}");

    drop(pidfile);
    exit(code)
}

async fn get_config(cli: &Cli) -> Config {
    let external_ids = OvsVsctl::default();
    let loaded = Config::load(
        cli.config_layer(),
        cli.config_file.as_deref(),
        &external_ids,
        cli.discovery(),
    )
    .await;

    match loaded {
        Ok((config, path)) => {
            configure_logger(config.logging.level, config.logging.file.as_deref());

            if let Some(path) = path {
                info!("Loaded config file {}", path.display());
            }

            config
        }
        Err(error) => {
            configure_logger(cli.loglevel.unwrap_or(DEFAULT_LOG_LEVEL), None);
            error!("Invalid configuration! {error}");
            exit(1)
        }
    }
}

async fn get_pidfile(path: &Path) -> PidFile {
    match PidFile::create(path).await {
        Ok(pidfile) => pidfile,
        Err(error) => {
            error!("{error}");
            exit(1)
        }
    }
}

fn get_gateway(cli: &Cli) -> Option<GatewaySettings> {
    match cli.gateway_options().validate(cli.init_node.is_some()) {
        Ok(gateway) => gateway,
        Err(error) => {
            error!("Invalid gateway configuration! {error}");
            exit(1)
        }
    }
}

async fn get_client(config: &Config) -> Client {
    match create_client(&config.kubernetes).await {
        Ok(client) => client,
        Err(error) => {
            error!("Couldn't create client! {error:?}");
            exit(1)
        }
    }
}

async fn wait_for_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            warn!("Couldn't listen for SIGTERM! {error}");

            if !interrupted(ctrl_c()).await {
                // nothing left to listen on, run until killed
                pending::<()>().await;
            }

            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => info!("Interrupted, shutting down..."),
        _ = terminate.recv() => info!("Terminated, shutting down..."),
    }
}

/// Waits for `interrupt`, `false` if it can't be listened for.
async fn interrupted(interrupt: impl Future<Output = io::Result<()>>) -> bool {
    match interrupt.await {
        Ok(()) => {
            info!("Interrupted, shutting down...");
            true
        }
        Err(error) => {
            error!("Couldn't listen for SIGINT either! {error}");
            false
        }
    }
}

/// 5=debug, 4=info, 3=warn, everything below is error.
fn level_filter(level: u8) -> LevelFilter {
    match level {
        5.. => LevelFilter::Debug,
        4 => LevelFilter::Info,
        3 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

fn configure_logger(level: u8, file: Option<&Path>) {
    let mut logger = env_logger::builder();

    logger
        .default_format()
        .format_module_path(false)
        .filter_level(level_filter(level));

    let mut failure = None;
    if let Some(file) = file {
        match open_logfile(file) {
            Ok(file) => {
                logger.target(Target::Pipe(Box::new(file)));
            }
            Err(error) => failure = Some(error),
        }
    }

    logger.init();

    if let Some(error) = failure {
        warn!("Logging to stderr instead! {error:#}");
    }
}

fn open_logfile(path: &Path) -> anyhow::Result<File> {
    if let Some(directory) = path.parent().filter(|directory| !directory.as_os_str().is_empty()) {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("Couldn't create log directory {}!", directory.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Couldn't open log file {}!", path.display()))
}
