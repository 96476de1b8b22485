use std::time::Duration;

use build_time::build_time_local;
use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kube_pg_upgrader::cancel::Cancellation;
use kube_pg_upgrader::config;
use kube_pg_upgrader::upgrade::{UpgradeRunner, UpgradeSettings};

#[derive(Parser)]
#[command(author, version, about = "In-place major version upgrades for PostgreSQL data volumes on Kubernetes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upgrade the database behind a StatefulSet
    Statefulset(StatefulsetArgs),
    /// Upgrade the database on a bare PersistentVolumeClaim
    Pvc(PvcArgs),
}

#[derive(Args)]
struct StatefulsetArgs {
    /// Name of the StatefulSet running postgres
    name: String,

    /// Name of the postgres container; discovered from the image when left blank
    #[arg(long, default_value = "")]
    container: String,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct PvcArgs {
    /// Name of the PVC holding the postgres data directory
    source_pvc: String,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Namespace of the postgres instance; defaults to the kubecontext namespace
    #[arg(short = 'n', long, default_value = "")]
    namespace: String,

    /// User used for initdb
    #[arg(short = 'u', long, default_value = "")]
    user: String,

    /// Target postgres major version, for example 14, 15 or 16
    #[arg(short = 't', long)]
    target_version: String,

    /// Current postgres major version; auto discovery is attempted when left blank
    #[arg(long, default_value = "")]
    current_version: String,

    /// Size of the upgraded volume, for example 10G; defaults to the source claim's request
    #[arg(long, default_value = "")]
    size: String,

    /// Name of the new PVC; defaults to the current name
    #[arg(long, default_value = "")]
    target_pvc_name: String,

    /// Additional arguments for initdb, matching what the database was created with
    #[arg(short = 'i', long, default_value = "")]
    extra_initdb_args: String,

    /// Directory inside the volume that holds the data directory
    #[arg(long, default_value = "")]
    subpath: String,

    /// Upgrade image base; the `<current>-to-<target>` tag is appended
    #[arg(long, env = "UPGRADE_IMAGE", default_value = config::DEFAULT_UPGRADE_IMAGE)]
    upgrade_image: String,

    /// Seconds to wait before giving up, zero means no timeout
    #[arg(long, default_value_t = 0)]
    timeout: u64,
}

impl CommonArgs {
    fn settings(&self, source_pvc_name: &str, container_name: &str) -> UpgradeSettings {
        UpgradeSettings {
            upgrade_image: self.upgrade_image.clone(),
            init_db_args: self.extra_initdb_args.clone(),
            disk_size: self.size.clone(),
            current_version: self.current_version.clone(),
            target_version: self.target_version.clone(),
            container_name: container_name.to_string(),
            init_db_user: self.user.clone(),
            source_pvc_name: source_pvc_name.to_string(),
            target_pvc_name: self.target_pvc_name.clone(),
            sub_path: self.subpath.clone(),
        }
    }

    fn cancellation(&self) -> Cancellation {
        Cancellation::with_timeout(Duration::from_secs(self.timeout))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(
        "kube-pg-upgrader v{} built at {}",
        env!("CARGO_PKG_VERSION"),
        build_time_local!()
    );

    let cli = Cli::parse();
    match &cli.command {
        Command::Statefulset(args) => {
            let cancel = args.common.cancellation();
            let settings = args.common.settings("", &args.container);
            let runner = UpgradeRunner::new(&args.common.namespace, settings).await?;
            runner.run_for_statefulset(&cancel, &args.name).await?;
        }
        Command::Pvc(args) => {
            let cancel = args.common.cancellation();
            let settings = args.common.settings(&args.source_pvc, "");
            let runner = UpgradeRunner::new(&args.common.namespace, settings).await?;
            runner.run_for_pvc(&cancel).await?;
        }
    }

    Ok(())
}
