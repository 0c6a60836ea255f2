use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use argh::FromArgs;
use promscrape::signal::{Signals, SignalTo};
use promscrape::{check_config, duration::parse_duration, Manager, ScrapeOptions, Sink};
use tracing::{debug, error, info};

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_duration_flag(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|err| err.to_string())
}

#[derive(FromArgs)]
#[argh(description = "promscrape is a Prometheus-compatible scrape agent")]
struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level"
    )]
    log_level: String,

    #[argh(
        option,
        short = 'c',
        long = "config",
        default = "PathBuf::new()",
        description = "path to the scrape config file; empty means nothing to scrape"
    )]
    config: PathBuf,

    #[argh(
        option,
        from_str_fn(parse_duration_flag),
        description = "interval for re-checking the config file for changes; disabled by default, send SIGHUP to force a reload"
    )]
    config_check_interval: Option<Duration>,

    #[argh(
        option,
        from_str_fn(parse_duration_flag),
        description = "interval for re-reading file_sd_configs target files (default 30s)"
    )]
    file_sd_check_interval: Option<Duration>,

    #[argh(
        switch,
        description = "suppress duplicate scrape target errors; duplicates are dropped either way"
    )]
    suppress_duplicate_scrape_target_errors: bool,

    #[argh(
        option,
        short = 't',
        default = "default_worker_threads()",
        description = "how many threads the tokio runtime will use"
    )]
    threads: usize,

    #[argh(subcommand)]
    sub_command: Option<SubCommands>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum SubCommands {
    CheckConfig(CheckConfig),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "check-config", description = "check the config file for errors")]
struct CheckConfig {}

fn main() {
    let opts: RootCommand = argh::from_env();

    if opts.version {
        println!("promscrape {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let filter = std::env::var("PROMSCRAPE_LOG").unwrap_or_else(|_| opts.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    if let Some(SubCommands::CheckConfig(_)) = opts.sub_command {
        match check_config(&opts.config) {
            Ok(()) => {
                println!("config {:?} is ok", opts.config);
                std::process::exit(exitcode::OK);
            }
            Err(err) => {
                eprintln!("{}", err);
                std::process::exit(exitcode::CONFIG);
            }
        }
    }

    let options = ScrapeOptions {
        config_path: opts.config,
        config_check_interval: opts.config_check_interval.unwrap_or(Duration::ZERO),
        file_sd_check_interval: opts
            .file_sd_check_interval
            .unwrap_or(Duration::from_secs(30)),
        suppress_duplicate_errors: opts.suppress_duplicate_scrape_target_errors,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("promscrape-worker")
        .worker_threads(opts.threads)
        .enable_io()
        .enable_time()
        .build()
        .unwrap();

    runtime.block_on(async move {
        info!(
            message = "start promscrape",
            threads = opts.threads,
            config = ?options.config_path
        );

        // The sink is where a remote-write client would hang off; this
        // binary only accounts for what the scrape loops produce.
        let sink: Sink = Arc::new(|wr| {
            debug!(message = "scraped series batch", series = wr.timeseries.len());
        });

        let manager = match Manager::start(options, sink) {
            Ok(manager) => manager,
            Err(err) => {
                error!(message = "cannot start scrapers", %err);
                std::process::exit(exitcode::CONFIG);
            }
        };

        let mut signals = match Signals::new() {
            Ok(signals) => signals,
            Err(err) => {
                error!(message = "cannot install signal handlers", %err);
                std::process::exit(exitcode::OSERR);
            }
        };
        loop {
            match signals.recv().await {
                SignalTo::ReloadFromDisk => manager.reload(),
                SignalTo::Shutdown => break,
                SignalTo::Quit => std::process::exit(exitcode::OK),
            }
        }

        info!("Shutdown signal received");
        let started = Instant::now();
        manager.stop().await;
        info!(message = "promscrape stopped", elapsed = ?started.elapsed());
    });

    runtime.shutdown_timeout(Duration::from_secs(5));
}
