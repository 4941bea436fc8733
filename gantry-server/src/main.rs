// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Gantry — API gateway loader and request-pipeline assembler
//
//  Data plane:  tokio + hyper listeners per configured port
//  Routing:     arc-swapped router set rebuilt wholesale per reload
//  Config:      YAML + GANTRY_* environment overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use gantry_chain::stages::custom::NullDriverHost;
use gantry_core::config::GatewayConfig;
use gantry_core::descriptor::ApiDescriptor;
use gantry_gateway::loader::ApiLoader;
use gantry_store::binder::AmbientStores;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gantry", version, about = "Gantry API Gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory of API descriptor documents (JSON, one per file)
    #[arg(long, default_value = "apps")]
    apps: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Gantry starting");

    let config = Arc::new(GatewayConfig::load(
        cli.config.as_ref().and_then(|p| p.to_str()),
    )?);
    info!(
        listen_port = config.listen_port,
        control_port = config.control_port(),
        strict_routes = config.strict_routes,
        cloud = config.cloud,
        hash_keys = config.hash_keys,
        rpc = config.slave_options.use_rpc,
        uptime_tests_disabled = config.uptime_tests_disabled,
        "configuration loaded"
    );

    let playground_template = config.template_path.join("playground.html");
    if !playground_template.exists() {
        warn!(
            path = %playground_template.display(),
            "playground template missing; playground-enabled APIs will 500"
        );
    }

    // Durable store engines are collaborators; the single-node default keeps
    // everything on one in-memory backend.
    let ambient = AmbientStores::in_memory();
    let loader = Arc::new(ApiLoader::new(
        config.clone(),
        ambient,
        Arc::new(NullDriverHost),
    ));

    let specs = read_descriptors(&cli.apps);
    info!(count = specs.len(), dir = %cli.apps.display(), "API descriptors read");
    loader.load(specs);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let reload_loader = loader.clone();
        let apps_dir = cli.apps.clone();
        tokio::spawn(async move {
            reload_on_sighup(reload_loader, apps_dir).await;
        });

        gantry_gateway::serve::run_listeners(loader).await
    })
}

/// Read every `*.json` descriptor document in the apps directory. Unreadable
/// files are logged and skipped; the loader handles semantic rejection.
fn read_descriptors(dir: &Path) -> Vec<ApiDescriptor> {
    let mut specs = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "apps directory unreadable, starting empty");
            return specs;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_slice::<ApiDescriptor>(&raw).map_err(Into::into))
        {
            Ok(spec) => specs.push(spec),
            Err(e) => error!(file = %path.display(), error = %e, "descriptor unreadable, skipped"),
        }
    }
    specs
}

/// SIGHUP re-reads the descriptor directory and hot-swaps the route table.
async fn reload_on_sighup(loader: Arc<ApiLoader>, apps_dir: PathBuf) {
    let mut hups = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, hot reload disabled");
            return;
        }
    };
    while hups.recv().await.is_some() {
        info!("SIGHUP received, reloading APIs");
        let specs = read_descriptors(&apps_dir);
        let report = loader.load(specs);
        info!(?report, "reload finished");
    }
}
