//! testcast CLI
//!
//! `run` executes a test and streams its output to the relay, `watch` prints
//! what another `run` streams, `list` shows the test catalog.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use testcast_core::Config;
use testcast_core::catalog::{TestCatalog, build_command, spec_file};
use testcast_core::config::load_config;
use testcast_core::tracing_init::{crate_filter, init_tracing};

use testcast_cli::client::{ClientConfig, RelayClient};
use testcast_cli::producer::Producer;
use testcast_cli::subprocess::{LineRetention, ProcessRunner, RunnerConfig, ShellMode};
use testcast_cli::watch::{self, WatchEnd};

/// Crates whose events the configured log level applies to.
const LOG_TARGETS: &[&str] = &["testcast", "testcast_cli", "testcast_core"];

#[derive(Parser, Debug)]
#[command(name = "testcast")]
#[command(version, about = "Run tests and stream their console output live", long_about = None)]
struct Cli {
    /// Project directory (settings and the test catalog are resolved from here)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Relay URL, e.g. ws://localhost:3001
    #[arg(long, global = true)]
    relay_url: Option<String>,

    /// Output logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a test and stream its output
    Run {
        /// Test name; the command runs `<name><spec suffix>`
        name: String,

        /// Run this command instead of the configured template
        #[arg(long)]
        command: Option<String>,

        /// Do not connect to the relay
        #[arg(long)]
        no_relay: bool,
    },
    /// Print the output streamed by a running test
    Watch,
    /// List catalogued tests
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let mut config = load_config(Some(&project_dir))?;
    if let Some(url) = cli.relay_url {
        config.relay.url = url;
    }

    init_tracing(&crate_filter(&config.relay.log_level, LOG_TARGETS), cli.log_json);

    match cli.command {
        Commands::Run {
            name,
            command,
            no_relay,
        } => run(&config, &project_dir, &name, command, no_relay).await,
        Commands::Watch => watch_relay(&config).await,
        Commands::List => list(&config, &project_dir),
    }
}

fn client_for(config: &Config) -> RelayClient {
    RelayClient::new(ClientConfig {
        url: config.relay.url.clone(),
        connect_timeout: Duration::from_secs(config.relay.connect_timeout_secs),
    })
}

fn catalog_for(config: &Config, project_dir: &Path) -> TestCatalog {
    TestCatalog::new(project_dir.join(&config.catalog.tests_dir))
}

#[allow(clippy::print_stdout)]
async fn run(
    config: &Config,
    project_dir: &Path,
    name: &str,
    command: Option<String>,
    no_relay: bool,
) -> anyhow::Result<ExitCode> {
    let command = command.unwrap_or_else(|| {
        build_command(
            &config.runner.command_template,
            &spec_file(name, &config.runner.spec_suffix),
        )
    });

    let runner = ProcessRunner::new(RunnerConfig {
        shell: ShellMode::Shell,
        working_directory: Some(
            config
                .runner
                .working_directory
                .as_ref()
                .map_or_else(|| project_dir.to_path_buf(), |dir| project_dir.join(dir)),
        ),
        retention: LineRetention::from_cap(config.runner.max_retained_lines),
        env: Vec::new(),
    });

    let mut producer = Producer::new(runner).with_catalog(catalog_for(config, project_dir));
    if !no_relay {
        producer = producer.with_relay(client_for(config));
    }

    let result = producer
        .run(name, &command, |line| {
            println!("{}", watch::render_line(line));
        })
        .await;

    if result.succeeded {
        info!(test = %name, "Test passed");
        Ok(ExitCode::SUCCESS)
    } else {
        let detail = result.error_detail.as_deref().unwrap_or("test failed");
        error!(test = %name, exit_code = result.exit_code, "{detail}");
        Ok(ExitCode::FAILURE)
    }
}

#[allow(clippy::print_stdout)]
async fn watch_relay(config: &Config) -> anyhow::Result<ExitCode> {
    let client = client_for(config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let end = watch::watch(&client, |text| println!("{text}"), shutdown).await?;
    match end {
        WatchEnd::Interrupted | WatchEnd::Disconnected => Ok(ExitCode::SUCCESS),
        WatchEnd::Rejected => Ok(ExitCode::from(2)),
    }
}

#[allow(clippy::print_stdout)]
fn list(config: &Config, project_dir: &Path) -> anyhow::Result<ExitCode> {
    let records = catalog_for(config, project_dir).list()?;
    if records.is_empty() {
        println!("No tests catalogued");
        return Ok(ExitCode::SUCCESS);
    }

    let width = records.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for record in records {
        let last = record
            .passed_at
            .iter()
            .chain(record.failed_at.iter())
            .max()
            .map_or("", String::as_str);
        println!(
            "{:<width$}  {:<8}  {}",
            record.name,
            record.status.as_str(),
            last,
        );
    }
    Ok(ExitCode::SUCCESS)
}
