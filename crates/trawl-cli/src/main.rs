use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trawl_client::ReqwestProbe;
use trawl_core::{
    Dataset, DatasetStore, ExportFormat, FileStorage, ProbeStatus, ProxyRouter, ProxyRouterConfig,
    ProxySource, Storage, TrawlConfig,
};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Dataset and proxy pool administration for trawl")]
struct Cli {
    /// Root directory for datasets and checkpoints
    #[arg(long, global = true, env = "TRAWL_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and export stored datasets
    Datasets {
        #[command(subcommand)]
        command: DatasetCommands,
    },

    /// Work with the configured proxy pool
    Proxies {
        #[command(subcommand)]
        command: ProxyCommands,
    },
}

#[derive(Subcommand)]
enum DatasetCommands {
    /// List all datasets
    List,

    /// Show item count, size and timestamps of a dataset
    Info { name: String },

    /// Export a dataset as json, jsonl or csv
    Export {
        name: String,

        /// Output format
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a window of records as JSON lines
    Tail {
        name: String,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete a dataset and all of its records
    Delete {
        name: String,

        /// Confirm deletion
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// Probe every proxy concurrently and print the outcome
    Test {
        /// Comma-separated proxies (overrides TRAWL_PROXY / TRAWL_PROXIES)
        #[arg(long)]
        proxies: Option<String>,

        /// Newline-delimited proxy file (overrides TRAWL_PROXY_FILE)
        #[arg(long)]
        proxy_file: Option<PathBuf>,

        /// URL fetched through each proxy
        #[arg(long, env = "TRAWL_PROBE_URL")]
        probe_url: Option<String>,

        /// Per-probe timeout in seconds
        #[arg(long, env = "TRAWL_PROBE_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,

        /// Print outcomes and stats as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = TrawlConfig::from_env().context("Invalid trawl configuration")?;
    if let Some(dir) = cli.storage_dir {
        config = config.with_storage_dir(dir);
    }

    match cli.command {
        Commands::Datasets { command } => {
            let store = DatasetStore::new(FileStorage::new(&config.storage_dir));
            let mut stdout = std::io::stdout().lock();
            run_dataset_command(command, &store, &mut stdout).await?;
        }
        Commands::Proxies {
            command:
                ProxyCommands::Test {
                    proxies,
                    proxy_file,
                    probe_url,
                    timeout_secs,
                    json,
                },
        } => {
            if let Some(path) = proxy_file {
                config = config.with_proxy_source(ProxySource::File(path));
            } else if let Some(list) = proxies {
                config = config.with_proxy_source(ProxySource::from_value(&list));
            }
            if let Some(url) = probe_url {
                config = config.with_probe_url(url);
            }
            if let Some(secs) = timeout_secs {
                if secs == 0 {
                    bail!("--timeout-secs must be at least 1");
                }
                config = config.with_probe_timeout(Duration::from_secs(secs));
            }
            cmd_proxies_test(&config, json).await?;
        }
    }

    Ok(())
}

async fn run_dataset_command<S: Storage>(
    command: DatasetCommands,
    store: &DatasetStore<S>,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        DatasetCommands::List => cmd_list(store, out).await,
        DatasetCommands::Info { name } => cmd_info(store, &name, out).await,
        DatasetCommands::Export {
            name,
            format,
            output,
        } => cmd_export(store, &name, format, output.as_deref(), out).await,
        DatasetCommands::Tail {
            name,
            offset,
            limit,
        } => cmd_tail(store, &name, offset, limit, out).await,
        DatasetCommands::Delete { name, yes } => cmd_delete(store, &name, yes, out).await,
    }
}

async fn cmd_list<S: Storage>(store: &DatasetStore<S>, out: &mut impl Write) -> Result<()> {
    let datasets = store
        .list_datasets()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if datasets.is_empty() {
        writeln!(out, "No datasets found")?;
        return Ok(());
    }

    for info in &datasets {
        let modified = info
            .modified_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "  {:<24} {:>8} items {:>10} bytes  {}",
            info.name, info.item_count, info.size_bytes, modified
        )?;
    }
    writeln!(out, "\nTotal: {} datasets", datasets.len())?;
    Ok(())
}

/// Look up a dataset that must already exist, without repairing or creating anything.
async fn existing<S: Storage>(store: &DatasetStore<S>, name: &str) -> Result<Dataset<S>> {
    store
        .get(name)
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .with_context(|| format!("Dataset '{name}' not found"))
}

async fn cmd_info<S: Storage>(store: &DatasetStore<S>, name: &str, out: &mut impl Write) -> Result<()> {
    let dataset = existing(store, name).await?;
    let info = dataset.get_info().await.map_err(|e| anyhow::anyhow!(e))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
    Ok(())
}

async fn cmd_export<S: Storage>(
    store: &DatasetStore<S>,
    name: &str,
    format: ExportFormat,
    output: Option<&Path>,
    out: &mut impl Write,
) -> Result<()> {
    let dataset = existing(store, name).await?;
    let rendered = dataset
        .export(format)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write export to {}", path.display()))?;
            tracing::info!(dataset = %name, %format, path = %path.display(), "Export written");
        }
        None => {
            out.write_all(rendered.as_bytes())?;
            if !rendered.ends_with('\n') && !rendered.is_empty() {
                writeln!(out)?;
            }
        }
    }
    Ok(())
}

async fn cmd_tail<S: Storage>(
    store: &DatasetStore<S>,
    name: &str,
    offset: usize,
    limit: usize,
    out: &mut impl Write,
) -> Result<()> {
    let dataset = existing(store, name).await?;
    let page = dataset
        .get_data(offset, limit)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    for item in &page.items {
        writeln!(out, "{}", serde_json::to_string(item)?)?;
    }
    tracing::info!(
        dataset = %name,
        shown = page.items.len(),
        offset,
        total = page.total,
        "Records listed"
    );
    Ok(())
}

async fn cmd_delete<S: Storage>(
    store: &DatasetStore<S>,
    name: &str,
    yes: bool,
    out: &mut impl Write,
) -> Result<()> {
    if !yes {
        bail!("Refusing to delete dataset '{name}' without --yes");
    }
    let dataset = existing(store, name).await?;
    dataset.delete().await.map_err(|e| anyhow::anyhow!(e))?;
    writeln!(out, "Deleted dataset {name}")?;
    Ok(())
}

async fn cmd_proxies_test(config: &TrawlConfig, json: bool) -> Result<()> {
    let source = config.proxy_source.as_ref().context(
        "No proxies configured. Set TRAWL_PROXY, TRAWL_PROXIES or TRAWL_PROXY_FILE, or pass --proxies.",
    )?;

    let router =
        ProxyRouter::new(ProxyRouterConfig::default().with_probe_timeout(config.probe_timeout));
    let report = router.load_from(source).map_err(|e| anyhow::anyhow!(e))?;
    for rejected in &report.rejected {
        tracing::warn!(input = %rejected.input, reason = %rejected.reason, "Rejected proxy entry");
    }
    if router.is_empty() {
        bail!("Proxy source contained no usable entries");
    }

    tracing::info!(
        proxies = router.len(),
        url = %config.probe_url,
        "Probing proxies"
    );
    let probe = ReqwestProbe::new(&config.probe_url, config.probe_timeout);
    let outcomes = router.test_all(&probe).await;

    if json {
        let doc = serde_json::json!({
            "outcomes": outcomes,
            "stats": router.get_stats(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        for outcome in &outcomes {
            match &outcome.status {
                ProbeStatus::Ok { latency_ms } => {
                    println!("  [ok]     {} ({latency_ms} ms)", outcome.url)
                }
                ProbeStatus::Failed { error } => println!("  [failed] {} ({error})", outcome.url),
            }
        }
        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        println!("\n{ok}/{} proxies reachable", outcomes.len());
    }

    Ok(())
}
