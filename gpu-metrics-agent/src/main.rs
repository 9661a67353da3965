//! GPU Metrics Agent - reports attached GPU stats to Cloud Monitoring
//!
//! Subcommands:
//! - run (default): register descriptors, resolve the resource, poll forever
//! - create-descriptors / list-descriptors / delete-descriptors
//! - catalog: print the watched fields

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gpu_metrics_agent::config::{parse_label, AgentConfig, ConfigOverrides, Settings};
use gpu_metrics_agent::dcgmi::DcgmiReader;
use gpu_metrics_agent::monitoring::{CloudMonitoringClient, TokenSource, CUSTOM_METRIC_DOMAIN};
use gpu_metrics_agent::resource::{self, GceMetadataClient};
use gpu_metrics_agent::sink::project_path;
use gpu_metrics_agent::{registrar, BatchBuilder, Exporter, MetricCatalog, PollLoop, Translator};

#[derive(Debug, Parser)]
#[command(name = "gpu-metrics-agent", version, about = "Monitors attached GPUs and reports the stats to Cloud Monitoring")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// GCP project id
    #[arg(long, global = true, env = "GPU_METRICS_PROJECT_ID")]
    project_id: Option<String>,

    /// Metrics update interval in seconds (minimum 10)
    #[arg(long, global = true)]
    update_interval: Option<u64>,

    /// Monitored resource type
    #[arg(long, global = true)]
    resource_type: Option<String>,

    /// Resource label as key=value; disables metadata lookup (repeatable)
    #[arg(long = "resource-label", global = true, value_parser = parse_label)]
    resource_labels: Vec<(String, String)>,

    /// Static OAuth access token instead of the metadata server
    #[arg(long, global = true, env = "GPU_METRICS_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register descriptors and publish GPU metrics until interrupted
    Run,
    /// Register the catalog's metric descriptors and exit
    CreateDescriptors,
    /// List the project's custom metric descriptors
    ListDescriptors,
    /// Delete the catalog's descriptors, or the named custom metrics
    DeleteDescriptors {
        /// Metric names relative to custom.googleapis.com/
        names: Vec<String>,
    },
    /// Print the watched DCGM fields
    Catalog,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            project_id: self.project_id.clone(),
            update_interval_secs: self.update_interval,
            resource_type: self.resource_type.clone(),
            resource_labels: self.resource_labels.clone(),
            access_token: self.access_token.clone(),
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "gpu_metrics_agent=debug" } else { "gpu_metrics_agent=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

fn monitoring_client(settings: &Settings) -> Result<CloudMonitoringClient> {
    let tokens = match &settings.access_token {
        Some(token) => TokenSource::fixed(token.clone()),
        None => TokenSource::metadata(
            GceMetadataClient::new(&settings.metadata_endpoint).context("Failed to build metadata client")?,
        ),
    };
    CloudMonitoringClient::new(&settings.monitoring_endpoint, tokens, settings.retry.clone())
        .context("Failed to build Cloud Monitoring client")
}

fn print_catalog(catalog: &MetricCatalog) {
    for definition in catalog.iter() {
        println!(
            "{:>5}  {:<60} {:<7} {}",
            definition.field_id,
            definition.metric_name,
            definition.value_type,
            definition.unit.as_deref().unwrap_or("-")
        );
    }
}

/// Installs the interrupt handler right away, so a ctrl-c arriving while the
/// watch is opening or during the first cycle is not lost
#[cfg(unix)]
fn interrupt_listener() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(async move {
        interrupt.recv().await;
    })
}

#[cfg(windows)]
fn interrupt_listener() -> Result<impl Future<Output = ()>> {
    let mut interrupt = tokio::signal::windows::ctrl_c()?;
    Ok(async move {
        interrupt.recv().await;
    })
}

async fn run(settings: &Settings, catalog: &MetricCatalog, client: &CloudMonitoringClient) -> Result<()> {
    let project = project_path(&settings.project_id);

    info!("Project ID: {}", settings.project_id);
    info!("Entering monitoring loop with update interval: {:?}", settings.update_interval);

    let metadata = GceMetadataClient::new(&settings.metadata_endpoint).context("Failed to build metadata client")?;
    let identity = resource::resolve(settings.resource_type, &metadata, settings.resource_labels.as_ref())
        .await
        .context("Failed to resolve monitored resource")?;

    registrar::ensure_registered(client, &project, catalog)
        .await
        .context("Failed to register metric descriptors")?;

    let builder = BatchBuilder::new(Translator::new(catalog, &identity));
    let exporter = Exporter::new(client, project);
    let poll_loop = PollLoop::new(builder, exporter, settings.update_interval);

    let shutdown = interrupt_listener().context("Failed to listen for interrupt")?;

    let report = poll_loop
        .run(&DcgmiReader::default(), &settings.field_group, shutdown)
        .await
        .context("Failed to watch DCGM fields")?;

    info!(
        "Stopped after {} cycles ({} series submitted, {} dropped, {} failed polls)",
        report.cycles, report.series_submitted, report.series_dropped, report.failed_polls
    );
    Ok(())
}

async fn execute(command: Command, config: &AgentConfig, catalog: &MetricCatalog) -> Result<()> {
    let settings = config.validate().context("Invalid configuration")?;
    let client = monitoring_client(&settings)?;
    let project = project_path(&settings.project_id);

    match command {
        Command::Run => run(&settings, catalog, &client).await?,
        Command::CreateDescriptors => {
            let count = registrar::ensure_registered(&client, &project, catalog)
                .await
                .context("Failed to register metric descriptors")?;
            println!("Created {count} metric descriptors");
        }
        Command::ListDescriptors => {
            for name in client.list_descriptors(&project).await.context("Failed to list descriptors")? {
                println!("{name}");
            }
        }
        Command::DeleteDescriptors { names } => {
            let metric_types: Vec<String> = if names.is_empty() {
                catalog.iter().map(|definition| definition.metric_name.clone()).collect()
            } else {
                names.iter().map(|name| format!("{CUSTOM_METRIC_DOMAIN}{name}")).collect()
            };
            for metric_type in metric_types {
                client
                    .delete_descriptor(&project, &metric_type)
                    .await
                    .with_context(|| format!("Failed to delete {metric_type}"))?;
                println!("Deleted: {project}/metricDescriptors/{metric_type}");
            }
        }
        Command::Catalog => print_catalog(catalog),
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    let mut cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = AgentConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    config.apply(cli.overrides());

    let catalog = MetricCatalog::dcgm_default(&config.collection.metric_prefix);

    // Printing the catalog needs no project or credentials
    match cli.command.take().unwrap_or(Command::Run) {
        Command::Catalog => print_catalog(&catalog),
        command => execute(command, &config, &catalog).await?,
    }

    Ok(())
}
