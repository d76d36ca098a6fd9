//! CLI entry point for `imapvault`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use imapvault::archive::{verify_archive, ArchiveStore};
use imapvault::config::{self, Config};
use imapvault::export::write_mbox;
use imapvault::remote::imap::ImapSource;
use imapvault::remote::MailSource;
use imapvault::sync::{run_sync, Progress, Reporter};

#[derive(Parser)]
#[command(name = "imapvault", version, about = "Archive IMAP mailboxes to local append-only logs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// IMAP server as host or host:port (port defaults to 993)
    #[arg(long, env = "IMAP_SERVER", global = true)]
    server: Option<String>,

    /// Login name
    #[arg(long, env = "IMAP_EMAIL", global = true)]
    email: Option<String>,

    /// Login password
    #[arg(long, env = "IMAP_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List the mailboxes on the server
    List,
    /// Archive a mailbox, fetching only what is missing
    Fetch {
        mailbox: String,
        /// Number of parallel fetch connections
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Write an archive as mbox to stdout
    Mbox { path: PathBuf },
    /// Check every stored message against its digest
    Verify { path: PathBuf },
    /// Show archive statistics
    Stats {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Server login taken from flags or the environment.
struct Credentials {
    server: String,
    email: String,
    password: String,
}

impl Cli {
    fn credentials(&self) -> anyhow::Result<Credentials> {
        fn required(value: Option<&str>, flag: &str, var: &str) -> anyhow::Result<String> {
            value
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .with_context(|| format!("missing --{flag} (or {var})"))
        }
        Ok(Credentials {
            server: required(self.server.as_deref(), "server", "IMAP_SERVER")?,
            email: required(self.email.as_deref(), "email", "IMAP_EMAIL")?,
            password: required(self.password.as_deref(), "password", "IMAP_PASSWORD")?,
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match run(&cli, &config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("imapvault: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Commands::List => cmd_list(&cli.credentials()?),
        Commands::Fetch {
            mailbox,
            concurrency,
        } => cmd_fetch(&cli.credentials()?, config, mailbox, *concurrency),
        Commands::Mbox { path } => cmd_mbox(path),
        Commands::Verify { path } => cmd_verify(path),
        Commands::Stats { path, json } => cmd_stats(path, *json),
        Commands::Completions { shell } => cmd_completions(*shell),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = config::log_file_path(config);
    let file_layer = match (log_path.parent(), log_path.file_name()) {
        (Some(dir), Some(name)) if std::fs::create_dir_all(dir).is_ok() => {
            let file_appender = tracing_appender::rolling::never(dir, name);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file_appender),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<ExitCode> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "imapvault", &mut std::io::stdout());
    Ok(ExitCode::SUCCESS)
}

/// Print every mailbox name on the server.
fn cmd_list(creds: &Credentials) -> anyhow::Result<ExitCode> {
    let mut source = ImapSource::connect(&creds.server, &creds.email, &creds.password, None)?;
    for name in source.list_mailboxes()? {
        println!("{name}");
    }
    Ok(ExitCode::SUCCESS)
}

/// Bring the local archive of `mailbox` up to date.
fn cmd_fetch(
    creds: &Credentials,
    config: &Config,
    mailbox: &str,
    concurrency: Option<usize>,
) -> anyhow::Result<ExitCode> {
    let path = config::archive_path(config, mailbox);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating archive directory {}", parent.display()))?;
    }

    let store = ArchiveStore::open_with(&path, config.store.options())
        .with_context(|| format!("opening archive {}", path.display()))?;
    info!("Have {} messages", store.size());

    let mut options = config.sync.options();
    if let Some(n) = concurrency {
        options.concurrency = n.max(1);
    }

    let mut scan_source =
        ImapSource::connect(&creds.server, &creds.email, &creds.password, Some(mailbox))?;

    let progress = Arc::new(Progress::new());
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {elapsed} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(120));
    let reporter = {
        let spinner = spinner.clone();
        Reporter::spawn(
            Arc::clone(&progress),
            config.sync.progress_interval(),
            move |snapshot| {
                spinner.suspend(|| info!("{snapshot}"));
                spinner.set_message(snapshot.to_string());
            },
        )
    };

    let start = Instant::now();
    let result = run_sync(
        &mut scan_source,
        |_| ImapSource::connect(&creds.server, &creds.email, &creds.password, Some(mailbox)),
        &store,
        &progress,
        &options,
    );
    reporter.stop();
    spinner.finish_and_clear();

    let closed = store.write_close();
    let summary = result.with_context(|| format!("syncing {mailbox}"))?;
    closed.with_context(|| format!("closing archive {}", path.display()))?;

    info!(
        elapsed = ?start.elapsed(),
        "{} scanned, {} fetched, {} label updates; archive now holds {} messages",
        summary.scan.scanned,
        summary.fetched,
        summary.scan.label_updates,
        store.size()
    );
    Ok(ExitCode::SUCCESS)
}

/// Open an existing archive for reading. Nothing is written back to it.
fn open_existing(path: &Path) -> anyhow::Result<ArchiveStore> {
    if !path.exists() {
        anyhow::bail!("archive not found: {}", path.display());
    }
    ArchiveStore::open_read_only(path)
        .with_context(|| format!("opening archive {}", path.display()))
}

/// Write the archive as mbox to stdout.
fn cmd_mbox(path: &Path) -> anyhow::Result<ExitCode> {
    let store = open_existing(path)?;
    let stats = write_mbox(&store, std::io::stdout().lock())?;
    if stats.digest_mismatches > 0 {
        warn!(
            "{} message(s) did not match their digest",
            stats.digest_mismatches
        );
    }
    if stats.unreadable > 0 {
        warn!("{} message(s) had an unreadable body and were skipped", stats.unreadable);
    }
    info!("Wrote {} messages", stats.messages);
    Ok(ExitCode::SUCCESS)
}

/// Check digests; fails when a live message is damaged.
fn cmd_verify(path: &Path) -> anyhow::Result<ExitCode> {
    let store = open_existing(path)?;
    let report = verify_archive(&store)?;

    println!();
    println!("  {:<20} {}", "Archive", path.display());
    println!("  {:<20} {}", "Frames", report.frames);
    println!("  {:<20} {}", "Full records", report.full);
    println!("  {:<20} {}", "Label updates", report.label_updates);
    println!("  {:<20} {}", "Tombstones", report.tombstones);
    println!("  {:<20} {}", "Digest mismatches", report.mismatches.len());
    for m in &report.mismatches {
        let state = if m.live { "live" } else { "superseded" };
        println!("    message {} at offset {} ({state})", m.message_id, m.offset);
    }
    println!();

    if report.mismatches.iter().any(|m| m.live) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Show archive statistics.
fn cmd_stats(path: &Path, json: bool) -> anyhow::Result<ExitCode> {
    use humansize::{format_size, BINARY};

    let store = open_existing(path)?;
    let log_size = store.log_len()?;
    let index_size = std::fs::metadata(store.index_path())
        .map(|m| m.len())
        .unwrap_or(0);
    let snapshot = store.snapshot()?;

    let mut histogram: HashMap<&str, usize> = HashMap::new();
    for record in &snapshot.records {
        for label in &record.labels {
            *histogram.entry(label.as_str()).or_default() += 1;
        }
    }
    let mut top: Vec<(&str, usize)> = histogram.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    top.truncate(10);

    if json {
        let labels: Vec<serde_json::Value> = top
            .iter()
            .map(|(label, count)| serde_json::json!({ "label": label, "count": count }))
            .collect();
        let stats = serde_json::json!({
            "file": path.to_string_lossy(),
            "messages": store.size(),
            "log_size": log_size,
            "index_size": index_size,
            "top_labels": labels,
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    println!("  {:<20} {}", "Archive", path.display());
    println!("  {:<20} {}", "Messages", store.size());
    println!("  {:<20} {}", "Log size", format_size(log_size, BINARY));
    if index_size > 0 {
        println!("  {:<20} {}", "Index size", format_size(index_size, BINARY));
    }
    if !top.is_empty() {
        println!();
        println!("  Top labels:");
        for (label, count) in &top {
            println!("    {count:>6}  {label}");
        }
    }
    println!();
    Ok(ExitCode::SUCCESS)
}
