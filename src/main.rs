use anyhow::{bail, Context, Result};
use mediavault::*;
use serde::Serialize;
use std::env;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: mediavault <command> [args]

Commands:
  serve            reconcile, then watch managed directories until Ctrl-C
  reconcile        run one reconciliation pass
  evict            run one eviction pass with the configured bounds
  health           print registry health
  resolve <id>     print one file record
  history <id>     print the operation chain that produced a file
  verify <id>      re-hash one file and cascade if it was lost

Configuration: MEDIAVAULT_CONFIG, MEDIAVAULT_REGISTRY, MEDIAVAULT_DIRS";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = EngineConfig::load().context("loading configuration")?;
    // One-shot commands report what they find; only `serve` repairs on open.
    config.reconcile_on_startup = command == "serve";

    tracing::info!("MediaVault starting: registry {}", config.registry_path.display());
    for dir in &config.managed_dirs {
        tracing::info!("Managed directory: {}", dir.display());
    }

    let registry = Arc::new(Registry::open(config).context("opening registry")?);

    match command.as_str() {
        "serve" => serve(registry).await,
        "reconcile" => print_json(&registry.request_reconciliation()?),
        "evict" => print_json(&registry.run_eviction()?),
        "health" => {
            let report = registry.health_check()?;
            print_json(&report)?;
            if !report.healthy {
                std::process::exit(1);
            }
            Ok(())
        }
        "resolve" => print_json(&registry.resolve(file_id_arg(&args)?)?),
        "history" => print_json(&registry.history(file_id_arg(&args)?)?),
        "verify" => print_json(&registry.verify(file_id_arg(&args)?)?),
        other => {
            eprintln!("{}", USAGE);
            bail!("unknown command '{}'", other)
        }
    }
}

async fn serve(registry: Arc<Registry>) -> Result<()> {
    let mut librarian = Librarian::new(Arc::clone(&registry));
    librarian.start()?;
    tracing::info!("✓ Librarian (watcher) started");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("MediaVault shutting down...");

    // Joining blocks until an in-flight pass notices the cancellation.
    tokio::task::spawn_blocking(move || librarian.stop()).await?;
    Ok(())
}

fn file_id_arg(args: &[String]) -> Result<FileId> {
    let raw = args.get(2).context("missing file id argument")?;
    raw.parse().with_context(|| format!("'{}' is not a file id", raw))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
