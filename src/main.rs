use clap::{ArgGroup, Parser};
use portkite::aws::{resolve_region, Credentials};
use portkite::discovery::{EcsClient, TaskFilter};
use portkite::reconcile::Ambassador;
use tracing::info;

/// A sidecar TCP ambassador: listens locally on every port a named
/// container exposes and load-balances connections across its running
/// instances.
#[derive(Parser, Debug)]
#[command(name = "portkite", version)]
#[command(group(
    ArgGroup::new("selector")
        .required(true)
        .multiple(false)
        .args(["family", "service"])
))]
struct Args {
    /// Container name within the task family or service
    #[arg(long)]
    name: String,

    /// Task family, optionally with revision
    #[arg(long)]
    family: Option<String>,

    /// Service to proxy to; must be the service name
    #[arg(long)]
    service: Option<String>,

    /// Proxy to public addresses, not private
    #[arg(long)]
    public: bool,

    /// Cluster
    #[arg(long, default_value = "default")]
    cluster: String,

    /// Log level: error|warn|info|debug|trace
    #[arg(long, default_value = "info")]
    loglevel: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let directive = format!("portkite={}", args.loglevel)
        .parse()
        // Unparseable loglevel falls back to info rather than failing
        .unwrap_or_else(|_| "portkite=info".parse().expect("valid log directive"));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let region = resolve_region().await?;
    let credentials = Credentials::from_env()?;
    info!(
        region,
        cluster = args.cluster,
        container = args.name,
        "starting ambassador"
    );

    let client = EcsClient::new(region, credentials)?;
    let filter = TaskFilter {
        cluster: args.cluster,
        family: args.family,
        service: args.service,
        container: args.name,
        public: args.public,
    };

    Ambassador::new(client, filter).run().await;
    Ok(())
}
