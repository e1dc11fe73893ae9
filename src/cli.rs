//! # Command Line Interface
//!
//! Persistent flags shared by both discovery modes, plus a `version`
//! subcommand. Grounded on the original implementation's `cmd/kxds` Cobra
//! wiring (`--master`/`--kubeconfig`/`--port`/`--namespace`/`--ads`/`--opt-in`
//! persistent flags, `kubernetes`/`appmesh`/`version` subcommands) and on the
//! teacher's `clap::Parser`/`Subcommand` derive style (`src/cli.rs`).

use clap::{Parser, Subcommand};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "xds-gateway")]
#[command(about = "xDS control plane that programs an Envoy edge proxy from Kubernetes state")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// The address of the Kubernetes API server. Overrides any value in kubeconfig.
    /// Only required if out-of-cluster.
    #[arg(long, default_value = "")]
    pub master: String,

    /// Path to a kubeconfig. Only required if out-of-cluster; empty uses in-cluster config.
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    /// Envoy xDS port to listen on.
    #[arg(short, long, default_value_t = 18000)]
    pub port: u16,

    /// Namespace to watch for Kubernetes objects; empty watches all namespaces.
    #[arg(short, long, default_value = "")]
    pub namespace: String,

    /// Forces all Envoy resources to be explicitly named in the request (ADS semantics).
    #[arg(short, long)]
    pub ads: bool,

    /// When enabled only objects with an explicit `expose: "true"` annotation are discoverable.
    #[arg(long)]
    pub opt_in: bool,

    /// Optional config file layered between compiled defaults and environment variables.
    #[arg(long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start Kubernetes Service discovery.
    Kubernetes {
        /// Include Kubernetes services with this named port.
        #[arg(long, default_value = "http")]
        port_name: String,
    },

    /// Start App Mesh VirtualService discovery.
    Appmesh {
        /// App Mesh mesh that this gateway belongs to.
        #[arg(long)]
        gateway_mesh: String,

        /// Gateway Kubernetes service name.
        #[arg(long)]
        gateway_name: String,

        /// Gateway Kubernetes namespace.
        #[arg(long)]
        gateway_namespace: String,
    },

    /// Print the binary's version and exit.
    Version,
}

impl Cli {
    /// Layer CLI flags on top of file/environment-loaded settings. CLI flags
    /// are the most specific statement of operator intent, so they win
    /// (SPEC_FULL.md §4.H).
    pub fn into_settings(&self) -> crate::errors::Result<Settings> {
        let mut settings = crate::config::load_settings(self.config.as_deref())?;
        settings.xds.port = self.port;
        settings.ads = self.ads;
        settings.validate_all()?;
        Ok(settings)
    }
}
