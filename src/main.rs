use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use xds_gateway::cli::{Cli, Commands};
use xds_gateway::discovery;
use xds_gateway::snapshot::SnapshotEngine;
use xds_gateway::xds::{ReadySignal, XdsState};
use xds_gateway::{Result, APP_NAME, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(&cli.command, Commands::Version) {
        println!("{APP_NAME} {VERSION}");
        return Ok(());
    }

    xds_gateway::observability::logging::init_logging();
    info!(app_name = APP_NAME, version = VERSION, "starting xDS gateway");

    if let Err(error) = run(cli).await {
        error!(%error, "fatal startup error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let settings = cli.into_settings()?;
    let namespace = if cli.namespace.is_empty() { None } else { Some(cli.namespace.clone()) };
    let workers = settings.workers;

    let client = discovery::build_client(&cli.master, &cli.kubeconfig).await?;

    let shutdown = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c signal handler");
        info!("shutdown signal received");
    };

    let state = Arc::new(XdsState::new(settings.clone()));
    let ready = Arc::new(ReadySignal::new());
    let engine = Arc::new(SnapshotEngine::new(state.clone()));

    let server_state = state.clone();
    let server_ready = ready.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(error) = xds_gateway::xds::serve(server_state, server_ready, shutdown).await {
            error!(%error, "xDS server failed");
        }
    });

    info!(ads = settings.ads, "waiting for Envoy to connect to the xDS server");
    ready.report().await;
    if let Some(node_id) = ready.node_id() {
        engine.set_node_id(node_id);
    }

    let discovery_result = match cli.command {
        Commands::Kubernetes { port_name } => {
            discovery::run_kubernetes(client, namespace, engine, port_name, settings.annotation_prefix.clone(), cli.opt_in, workers).await
        }
        Commands::Appmesh { gateway_mesh, gateway_name, gateway_namespace } => {
            discovery::run_appmesh(
                client,
                namespace,
                engine,
                settings.annotation_prefix.clone(),
                cli.opt_in,
                gateway_mesh,
                gateway_name,
                gateway_namespace,
                workers,
            )
            .await
        }
        Commands::Version => unreachable!("handled before run() was called"),
    };

    if let Err(error) = &discovery_result {
        error!(%error, "discovery controller exited with an error");
    }

    server_handle.abort();
    discovery_result
}
