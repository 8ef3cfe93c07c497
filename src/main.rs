use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wort_mirror::{
    run_mirror, BarProgress, Database, MirrorConfig, NoProgress, ProgressSink, PublishPolicy,
    ARCHIVE_URL, MANIFEST_NAME,
};

#[derive(Parser, Debug)]
#[command(name = "wort-mirror")]
#[command(about = "Mirror a wort signature database with sha256 verification", long_about = None)]
#[command(version)]
struct Args {
    /// Database to mirror
    #[arg(value_enum)]
    database: Database,

    /// Destination directory, or an http(s):// object store base URL
    destination: String,

    /// Base URL of the archive
    #[arg(long, default_value = ARCHIVE_URL)]
    archive_url: String,

    /// Source base location, overriding <archive-url>/wort-<database>
    #[arg(long)]
    source: Option<String>,

    /// Remote manifest location (defaults to the manifest at the source root)
    #[arg(long)]
    manifest: Option<String>,

    /// Maximum number of simultaneous transfers
    #[arg(short = 'm', long, default_value_t = 30)]
    max_downloaders: usize,

    /// Hash every destination file and compare on (key, sha256)
    #[arg(short = 'f', long)]
    full_check: bool,

    /// Only mirror signatures created after this date (YYYY-MM-DD or RFC 3339)
    #[arg(short = 's', long, value_parser = parse_since)]
    since: Option<DateTime<Utc>>,

    /// Print what would be transferred and exit
    #[arg(short = 'd', long)]
    dry_run: bool,

    /// Publish the manifest even when some transfers failed, listing only verified entries
    #[arg(long)]
    allow_partial: bool,

    /// Number of transfers per batch
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Staging directory for uploads to an object store
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Bearer token for writes to an object-store destination
    #[arg(long, env = "WORT_MIRROR_TOKEN", hide_env_values = true)]
    dest_token: Option<String>,

    /// Write the run report as JSON to this path
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected YYYY-MM-DD or RFC 3339 timestamp: {}", e))
}

/// Cancels `cancel` on the first interrupt so the running batch drains.
/// Returns true on a second interrupt; false once the signal source fails.
async fn watch_interrupts<F, Fut>(mut interrupt: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    while interrupt().await.is_ok() {
        if cancel.is_cancelled() {
            return true;
        }
        warn!("Interrupt received, finishing the current batch (press Ctrl-C again to exit)");
        cancel.cancel();
    }
    false
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr so dry-run output on stdout stays parseable
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wort_mirror={}", log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<u8> {
    let source = args
        .source
        .clone()
        .unwrap_or_else(|| args.database.source_url(&args.archive_url));
    let config = MirrorConfig {
        source,
        manifest: args.manifest.clone(),
        destination: args.destination.clone(),
        max_concurrency: args.max_downloaders,
        verify_hash: args.full_check,
        since: args.since,
        dry_run: args.dry_run,
        batch_size: args.batch_size,
        publish_policy: if args.allow_partial {
            PublishPolicy::AcceptPartial
        } else {
            PublishPolicy::RequireFullSuccess
        },
        manifest_name: MANIFEST_NAME.to_string(),
        staging_dir: args.staging_dir.clone(),
        destination_token: args.dest_token.clone(),
        ..MirrorConfig::default()
    };

    info!("wort-mirror: {} -> {}", config.source, config.destination);
    info!(
        "Concurrency: {}, full check: {}, since: {}",
        config.max_concurrency,
        config.verify_hash,
        config
            .since
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );

    let client = reqwest::Client::builder()
        .user_agent(concat!("wort-mirror/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, interrupt).await {
            error!("Second interrupt, exiting without waiting for the batch");
            std::process::exit(130);
        }
    });

    let sink: Arc<dyn ProgressSink> = if config.dry_run {
        Arc::new(NoProgress)
    } else {
        Arc::new(BarProgress::new())
    };

    let report = run_mirror(&config, &client, sink, cancel)
        .await
        .context("Mirror run failed")?;

    for item in &report.planned {
        println!("download: {}", item.key);
    }
    eprintln!("{}", report);

    if let Some(path) = &args.report_json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    Ok(report.exit_code())
}
