// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use rescache::trust::ActionStore;
use rescache::{
    format_error, ArtifactDescriptor, CacheStore, DownloadOptions, FetchError, Headless,
    ResourceRequest, ResourceTracker, Settings, TrustPolicy, Unpack200Command, UpdatePolicy,
    UserDecisions, Version,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Data error - payload could not be decoded
    pub const DATA_ERR: i32 = 65;
    /// Internal software error - unexpected condition
    pub const SOFTWARE: i32 = 70;
    /// I/O error - network or file operation failed
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - try again later (e.g. offline)
    pub const TEMP_FAIL: i32 = 75;
    /// Permission denied - trust policy or user refused
    pub const NO_PERM: i32 = 77;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// Progress display fed by tracker events
mod progress {
    use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
    use rescache::FetchEvent;
    use tokio::sync::broadcast::{self, error::RecvError};
    use tokio::task::JoinHandle;

    /// Create a byte progress bar with consistent styling
    pub fn create(hidden: bool) -> ProgressBar {
        let bar = ProgressBar::new(0);
        if hidden {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar
    }

    /// Mirror events into `bar` until the task is aborted
    pub fn follow(bar: ProgressBar, mut rx: broadcast::Receiver<FetchEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(FetchEvent::Progress { transferred, total, .. }) => {
                        if let Some(total) = total {
                            bar.set_length(total);
                        }
                        bar.set_position(transferred);
                    }
                    Ok(FetchEvent::StatusChanged { new, .. }) => {
                        bar.set_message(new.to_string().to_lowercase());
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Interactive answers for the fetch engine's questions
mod prompt {
    use inquire::{Confirm, Select};
    use rescache::{ArtifactDescriptor, RememberScope, UntrustedDecision, UserDecisions};

    pub struct InquireDecisions;

    const ALLOW_ONCE: &str = "Allow this time";
    const ALLOW_ARTIFACT: &str = "Always allow this file";
    const ALLOW_ORIGIN: &str = "Always allow this site";
    const DENY_ONCE: &str = "Deny this time";
    const DENY_ARTIFACT: &str = "Always deny this file";

    impl UserDecisions for InquireDecisions {
        fn auth_challenge(&self, artifact: &ArtifactDescriptor) -> bool {
            Confirm::new(&format!(
                "The network requires authentication before {} can be fetched. \
                 Log in, then continue?",
                artifact.location
            ))
            .with_default(false)
            .prompt()
            .unwrap_or(false)
        }

        fn untrusted_content(&self, artifact: &ArtifactDescriptor) -> UntrustedDecision {
            let name = artifact.title.as_deref().unwrap_or(artifact.location.as_str());
            let options = vec![ALLOW_ONCE, ALLOW_ARTIFACT, ALLOW_ORIGIN, DENY_ONCE, DENY_ARTIFACT];
            let answer = Select::new(
                &format!("{name} from {} is not trusted. Use it anyway?", artifact.origin),
                options,
            )
            .with_help_message("↑↓ to move, enter to select")
            .prompt();

            let (allow, remember) = match answer {
                Ok(ALLOW_ONCE) => (true, RememberScope::Once),
                Ok(ALLOW_ARTIFACT) => (true, RememberScope::Artifact),
                Ok(ALLOW_ORIGIN) => (true, RememberScope::Origin),
                Ok(DENY_ARTIFACT) => (false, RememberScope::Artifact),
                _ => (false, RememberScope::Once),
            };
            UntrustedDecision { allow, remember }
        }
    }
}

/// rescache - versioned resource cache and fetch engine
#[derive(Parser)]
#[command(name = "rescache")]
#[command(version = VERSION)]
#[command(about = "Versioned resource cache and fetch engine. Resolve, download, decode, persist.")]
#[command(long_about = "rescache - versioned resource cache and fetch engine\n\n\
    Fetch a file:        rescache fetch https://example.com/lib/app.jar\n\
    Pinned version:      rescache fetch <url> --version 1.2 --versioned\n\
    From cache only:     rescache fetch <url> --offline\n\
    List the cache:      rescache cache list\n\
    Reclaim space:       rescache cache clean\n\
    Configure:           rescache config show")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Quiet mode: warnings and errors only, no progress bar
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a resource into the cache and print its path
    ///
    /// Examples:
    ///   rescache fetch https://example.com/lib/app.jar
    ///   rescache fetch https://example.com/lib/app.jar --version 2.1 --versioned --pack
    ///   rescache fetch https://example.com/lib/app.jar --offline
    Fetch {
        /// Location of the resource
        url: String,
        /// Version to request
        #[arg(long)]
        version: Option<String>,
        /// Try .pack.gz variants first
        #[arg(long)]
        pack: bool,
        /// Try __V<version> filename variants
        #[arg(long)]
        versioned: bool,
        /// Never touch the network
        #[arg(long)]
        offline: bool,
        /// Follow HTTP redirects
        #[arg(long)]
        allow_redirects: bool,
        /// Re-download even when the cached copy is current
        #[arg(long, conflicts_with = "never_update")]
        force: bool,
        /// Use any cached copy without checking the server
        #[arg(long)]
        never_update: bool,
        /// Resolve only; print the accepted URL and remote metadata
        #[arg(long)]
        connect_only: bool,
        /// Treat the resource as untrusted content and apply the trust policy
        #[arg(long)]
        untrusted: bool,
        /// Answer yes to every question (non-interactive)
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Inspect or clean the cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached entries
    List,
    /// Delete entries marked for deletion
    Clean,
    /// Print the cache directory
    Path,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective settings
    Show,
    /// Print the config file location
    Path,
}

struct FetchArgs {
    url: String,
    version: Option<String>,
    pack: bool,
    versioned: bool,
    offline: bool,
    allow_redirects: bool,
    force: bool,
    never_update: bool,
    connect_only: bool,
    untrusted: bool,
    yes: bool,
}

fn init_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose {
        "rescache=debug"
    } else if quiet {
        "rescache=warn"
    } else {
        "rescache=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            let chain: Vec<String> = e.chain().skip(1).map(|c| c.to_string()).collect();
            let causes: Vec<&str> = chain.iter().map(String::as_str).collect();
            eprintln!("{}", format_error(&e.to_string(), &causes, &[]));
            ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Fetch {
            url,
            version,
            pack,
            versioned,
            offline,
            allow_redirects,
            force,
            never_update,
            connect_only,
            untrusted,
            yes,
        } => {
            let args = FetchArgs {
                url,
                version,
                pack,
                versioned,
                offline,
                allow_redirects,
                force,
                never_update,
                connect_only,
                untrusted,
                yes,
            };
            let settings = match Settings::load() {
                Ok(settings) => settings,
                Err(e) => {
                    eprintln!(
                        "{}",
                        format_error(
                            &format!("{e:#}"),
                            &["The config file is not valid JSON"],
                            &["Inspect it: rescache config path"],
                        )
                    );
                    return Ok(CONFIG);
                }
            };
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(fetch_command(args, settings, cli.quiet))
        }
        Commands::Cache { command } => cache_command(command),
        Commands::Config { command } => config_command(command),
    }
}

async fn fetch_command(args: FetchArgs, settings: Settings, quiet: bool) -> Result<i32> {
    let mut policy = settings.fetch_policy();
    policy.offline |= args.offline;
    policy.allow_redirects |= args.allow_redirects;

    let decisions: Arc<dyn UserDecisions> = if args.yes {
        Arc::new(Headless { proceed: true })
    } else if std::io::stdin().is_terminal() {
        Arc::new(prompt::InquireDecisions)
    } else {
        Arc::new(Headless::default())
    };

    let mut trust = TrustPolicy::new(settings.security_level)
        .with_user_store(ActionStore::new(Settings::user_trust_file()?));
    if let Some(global) = &settings.global_trust_file {
        trust = trust.with_global_store(ActionStore::new(global));
    }

    let unpack200 = settings
        .unpack200
        .clone()
        .unwrap_or_else(|| PathBuf::from("unpack200"));
    let tracker = match ResourceTracker::builder()
        .cache_root(settings.cache_root())
        .policy(policy)
        .transport_config(settings.transport_config())
        .decisions(decisions)
        .unpacker(Arc::new(Unpack200Command::new(unpack200)))
        .trust_policy(trust)
        .build()
    {
        Ok(tracker) => tracker,
        Err(e) => return Ok(report(&e)),
    };

    let update_policy = if args.force {
        UpdatePolicy::Force
    } else if args.never_update {
        UpdatePolicy::Never
    } else {
        UpdatePolicy::Always
    };
    let request = match ResourceRequest::parse(&args.url) {
        Ok(request) => request
            .version(args.version.as_deref().and_then(Version::parse))
            .options(DownloadOptions {
                use_pack: args.pack,
                use_version: args.versioned,
            })
            .update_policy(update_policy),
        Err(e) => return Ok(report(&e)),
    };

    if args.untrusted {
        let mut artifact = ArtifactDescriptor::new(request.location.clone());
        if let Some(name) = request.location.path_segments().and_then(|mut s| s.next_back()) {
            if !name.is_empty() {
                artifact = artifact.with_title(name);
            }
        }
        if let Err(e) = tracker.confirm_untrusted(artifact).await {
            return Ok(report(&e));
        }
    }

    let bar = progress::create(quiet || !std::io::stderr().is_terminal());
    let follower = progress::follow(bar.clone(), tracker.subscribe());

    let code = if args.connect_only {
        match tracker.connect(request).await {
            Ok(resource) => {
                bar.finish_and_clear();
                let state = resource.snapshot();
                let url = state
                    .download_location
                    .map(String::from)
                    .unwrap_or_else(|| "(cache)".to_string());
                println!("{} {}", "[✓]".green(), url);
                if let Some(size) = state.size {
                    println!("    size:          {} bytes", size);
                }
                if let Some(millis) = state.remote_last_modified {
                    println!("    last-modified: {}", format_millis(millis));
                }
                if let Some(path) = state.local_file {
                    println!("    cache file:    {}", path.display());
                }
                SUCCESS
            }
            Err(e) => {
                bar.finish_and_clear();
                report(&e)
            }
        }
    } else {
        match tracker.fetch(request).await {
            Ok(path) => {
                bar.finish_and_clear();
                println!("{}", path.display());
                SUCCESS
            }
            Err(e) => {
                bar.finish_and_clear();
                report(&e)
            }
        }
    };
    follower.abort();
    Ok(code)
}

/// Print a fetch failure and pick the exit code for it.
fn report(error: &FetchError) -> i32 {
    eprintln!("{}", error.report());
    match error.root() {
        FetchError::InvalidLocation { .. } => USAGE,
        FetchError::Decode { .. } => DATA_ERR,
        FetchError::OfflineUnavailable { .. } | FetchError::ResolutionFailed { .. } => TEMP_FAIL,
        FetchError::Transport { .. }
        | FetchError::HttpStatus { .. }
        | FetchError::Transfer { .. }
        | FetchError::Cache(_) => IO_ERR,
        FetchError::UntrustedDenied { .. } | FetchError::AuthDeclined { .. } => NO_PERM,
        FetchError::RedirectDisallowed { .. } => ERROR,
        FetchError::ResourceFailed { .. } | FetchError::Worker { .. } => SOFTWARE,
    }
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn cache_command(command: CacheCommands) -> Result<i32> {
    let settings = Settings::load()?;
    let cache = CacheStore::new(settings.cache_root());

    match command {
        CacheCommands::List => {
            let entries = cache
                .entries()
                .with_context(|| format!("Failed to read cache at {}", cache.root().display()))?;
            if entries.is_empty() {
                println!("Cache is empty ({})", cache.root().display());
                return Ok(SUCCESS);
            }
            for entry in &entries {
                let info = entry.info();
                let marker = if info.delete {
                    "[deleted]".yellow().to_string()
                } else if entry.is_cached() {
                    "[cached]".green().to_string()
                } else {
                    "[empty]".dimmed().to_string()
                };
                let version = info
                    .version
                    .as_deref()
                    .map(|v| format!(" ({v})"))
                    .unwrap_or_default();
                println!("{} {}{}", marker, info.location.bold(), version);
                println!(
                    "    {} bytes, updated {}",
                    entry.file_len().unwrap_or(0),
                    info.last_updated.map(format_millis).unwrap_or_else(|| "never".to_string())
                );
                println!("    {}", entry.path().display().to_string().dimmed());
            }
            println!();
            println!("{} entries in {}", entries.len(), cache.root().display());
        }
        CacheCommands::Clean => {
            let report = cache
                .sweep()
                .with_context(|| format!("Failed to clean cache at {}", cache.root().display()))?;
            println!(
                "{} Removed {} files ({} bytes)",
                "[✓]".green(),
                report.files,
                report.bytes
            );
            if report.skipped > 0 {
                println!(
                    "{} {} entries are in use and were left for the next clean",
                    "[!]".yellow(),
                    report.skipped
                );
            }
        }
        CacheCommands::Path => {
            println!("{}", cache.root().display());
        }
    }
    Ok(SUCCESS)
}

fn config_command(command: ConfigCommands) -> Result<i32> {
    match command {
        ConfigCommands::Show => {
            let settings = Settings::load()?;
            println!("{}", "=== rescache configuration ===".bold());
            println!("{}", serde_json::to_string_pretty(&settings)?);
            println!();
            println!("cache root: {}", settings.cache_root().display());
        }
        ConfigCommands::Path => {
            println!("{}", Settings::default_path()?.display());
        }
    }
    Ok(SUCCESS)
}
