use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use proxy_qualifier::{
    proxy::{
        render_config, DescriptorParser, EngineProbe, Origin, QualificationOutcome, Qualifier,
        ResultStore, RunHandle, RunReport, SourceFetcher,
    },
    tui::QualifierApp,
    Config, TEST_URL_PRESETS, TIMEOUT_PRESETS, WORKER_PRESETS,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Fetches share links and keeps the ones that currently work
#[derive(Parser)]
#[command(name = "proxy-qualifier")]
#[command(about = "Fetches vmess/vless/shadowsocks/trojan share links and qualifies them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Result store file path
    #[arg(short, long, global = true, default_value = "working.txt")]
    store: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a share-link list and print the distinct candidates
    Fetch {
        /// URL, file path, or `-` to read the list from stdin
        origin: String,
    },
    /// Parse one share link and print its descriptor as JSON
    Parse {
        /// Raw share link
        uri: String,
    },
    /// Print the engine configuration a probe would use for a share link
    Config {
        /// Raw share link
        uri: String,
        /// Local SOCKS port
        #[arg(short, long, default_value_t = 10808)]
        port: u16,
    },
    /// Fetch a list, qualify it and merge working links into the store
    Qualify {
        /// URL, file path, or `-` to read the list from stdin
        origin: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Re-qualify the links already in the store
    Refresh {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Print the stored working links
    List,
    /// Remove links from the store
    Remove {
        /// Links to remove
        #[arg(required = true)]
        uris: Vec<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Number of concurrent probes (4, 8, 16, 32, 64)
    #[arg(short = 'n', long, default_value_t = 8, value_parser = parse_workers)]
    workers: usize,
    /// Probe timeout in seconds (2, 5, 10, 15)
    #[arg(short, long, default_value_t = 5, value_parser = parse_timeout)]
    timeout: u64,
    /// URL requested through each candidate
    #[arg(long, default_value = TEST_URL_PRESETS[0], value_parser = parse_test_url)]
    test_url: String,
    /// Proxy engine binary
    #[arg(short, long, default_value = "xray")]
    engine: PathBuf,
    /// Show live progress in a terminal UI
    #[arg(long)]
    tui: bool,
}

impl RunArgs {
    fn config(&self, store: PathBuf) -> Config {
        Config {
            store_path: store,
            engine_binary: self.engine.clone(),
            workers: self.workers,
            timeout: Duration::from_secs(self.timeout),
            test_url: self.test_url.clone(),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let tui = matches!(
        &cli.command,
        Commands::Qualify { run, .. } | Commands::Refresh { run } if run.tui
    );
    init_tracing(cli.verbose, tui);

    match cli.command {
        Commands::Fetch { origin } => {
            let candidates = SourceFetcher::new().fetch(&read_origin(&origin)?).await?;
            for uri in candidates.iter() {
                println!("{}", uri);
            }
        }
        Commands::Parse { uri } => {
            let descriptor = DescriptorParser::parse(&uri)?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Commands::Config { uri, port } => {
            let descriptor = DescriptorParser::parse(&uri)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&render_config(&descriptor, port))?
            );
        }
        Commands::Qualify { origin, run } => {
            let config = run.config(cli.store);
            let candidates = SourceFetcher::new().fetch(&read_origin(&origin)?).await?;
            if candidates.is_empty() {
                warn!(origin = %origin, "no candidates found");
                return Ok(());
            }
            info!(
                candidates = candidates.len(),
                workers = config.workers,
                timeout = ?config.timeout,
                test_url = %config.test_url,
                "starting qualification"
            );
            let report = qualify(&config, candidates.into_vec(), run.tui).await?;
            print_report(&report);
        }
        Commands::Refresh { run } => {
            let config = run.config(cli.store);
            let existing = ResultStore::new(&config.store_path).load()?;
            if existing.is_empty() {
                println!("Store {:?} is empty.", config.store_path);
                return Ok(());
            }
            info!(entries = existing.len(), "refreshing store");
            let report = qualify(&config, existing, run.tui).await?;
            print_report(&report);
        }
        Commands::List => {
            let entries = ResultStore::new(&cli.store).load()?;
            if entries.is_empty() {
                eprintln!("No stored links in {:?}.", cli.store);
            }
            for uri in entries {
                println!("{}", uri);
            }
        }
        Commands::Remove { uris } => {
            let store = ResultStore::new(&cli.store);
            let before = store.load()?.len();
            let remaining = store.remove(&uris)?;
            println!(
                "Removed {} entries, {} remaining",
                before.saturating_sub(remaining.len()),
                remaining.len()
            );
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, tui: bool) {
    let filter = if verbose {
        EnvFilter::new("info,proxy_qualifier=debug")
    } else {
        let default = if tui { "warn" } else { "info" };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_origin(input: &str) -> Result<Origin> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read share links from stdin")?;
        return Ok(Origin::Literal(text));
    }
    Ok(Origin::detect(input)?)
}

async fn qualify(config: &Config, candidates: Vec<String>, tui: bool) -> Result<RunReport> {
    let qualifier = Arc::new(Qualifier::new(
        EngineProbe::new(config.engine_config()),
        config.qualifier_config(),
        ResultStore::new(&config.store_path),
    ));
    let (handle, events) = qualifier.spawn(candidates);

    if tui {
        QualifierApp::new(handle, events).run().await
    } else {
        run_headless(handle, events).await
    }
}

/// Log outcomes as they arrive; Ctrl-C stops the run
async fn run_headless(
    handle: RunHandle,
    mut events: UnboundedReceiver<QualificationOutcome>,
) -> Result<RunReport> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            outcome = events.recv() => match outcome {
                Some(outcome) if outcome.is_working() => {
                    let progress = handle.progress();
                    info!(
                        uri = %outcome.uri,
                        latency = %outcome.latency,
                        tested = progress.tested,
                        total = progress.total,
                        "working"
                    );
                }
                Some(_) => {}
                None => return handle.join().await,
            },
            _ = &mut ctrl_c => {
                warn!("interrupted, stopping run");
                return handle.stop().await;
            }
        }
    }
}

fn print_report(report: &RunReport) {
    if report.cancelled {
        eprintln!("Run cancelled; nothing was saved.");
        return;
    }

    eprintln!(
        "Tested {} | working {} | stored {}",
        report.outcomes.len(),
        report.working.len(),
        report.persisted.len()
    );
    for outcome in &report.working {
        println!("{} ({})", outcome.uri, outcome.latency);
    }
}

fn parse_workers(s: &str) -> std::result::Result<usize, String> {
    parse_preset(s, WORKER_PRESETS)
}

fn parse_timeout(s: &str) -> std::result::Result<u64, String> {
    parse_preset(s, TIMEOUT_PRESETS)
}

fn parse_test_url(s: &str) -> std::result::Result<String, String> {
    if TEST_URL_PRESETS.contains(&s) {
        Ok(s.to_string())
    } else {
        Err(format!("must be one of: {}", TEST_URL_PRESETS.join(", ")))
    }
}

fn parse_preset<T>(s: &str, presets: &[T]) -> std::result::Result<T, String>
where
    T: std::str::FromStr + PartialEq + Copy + std::fmt::Display,
{
    let value: T = s.parse().map_err(|_| format!("`{}` is not a number", s))?;
    if presets.contains(&value) {
        Ok(value)
    } else {
        let allowed: Vec<String> = presets.iter().map(|p| p.to_string()).collect();
        Err(format!("must be one of: {}", allowed.join(", ")))
    }
}
