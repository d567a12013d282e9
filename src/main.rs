use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use claude_code_log::cache::{CacheStats, format_bytes};
use claude_code_log::config::{self, Config};
use claude_code_log::project::{ProjectCacheManager, ProjectOptions, discover_projects};
use claude_code_log::sessions::{
    DEFAULT_SPAN_GAP, SessionInfo, Span, build_session_index, build_spans,
};
use claude_code_log::types::TranscriptEntry;
use claude_code_log::{DirectoryAggregator, dates, debug_log};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "claude-code-log")]
#[command(version)]
#[command(disable_help_subcommand = true)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(Args)]
struct LogArgs {
    /// Project directory, or the projects root with --all-projects
    path: Option<PathBuf>,

    /// Earliest instant to include (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    from: Option<String>,

    /// Latest instant to include (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    to: Option<String>,

    /// Treat PATH (default: ~/.claude/projects) as a directory of projects
    #[arg(long, default_value_t = false)]
    all_projects: bool,

    /// Parse every file and leave caches untouched
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Pretty-print JSON instead of a single line
    #[arg(long, default_value_t = false)]
    pretty: bool,

    /// Only output the session index, not the entries
    #[arg(long, default_value_t = false)]
    sessions_only: bool,

    /// Seconds of silence that start a new span
    #[arg(long, default_value_t = DEFAULT_SPAN_GAP.num_seconds())]
    span_gap: i64,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or maintain transcript caches
    Cache(CacheArgs),
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    subcommand: CacheSubcommands,
}

#[derive(Args)]
struct CacheTarget {
    /// Project directory, or the projects root with --all-projects
    path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    all_projects: bool,
}

#[derive(Subcommand)]
enum CacheSubcommands {
    /// Show cache statistics
    Stats(CacheTarget),
    /// Delete all cache files
    Clear(CacheTarget),
    /// Delete cache files whose transcript no longer exists
    Prune(CacheTarget),
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key (cache-enabled, cache-root, projects-root)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Serialize)]
struct Report<'a> {
    projects: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entries: Option<Vec<&'a TranscriptEntry>>,
    sessions: Vec<SessionInfo>,
    spans: Vec<Span>,
    diagnostics: Vec<String>,
}

fn main() {
    debug_log::init();
    let cli = Cli::parse();

    match cli.command {
        None => {
            if let Err(e) = run_log(cli.log) {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
        Some(Commands::Cache(cache_args)) => {
            if let Err(e) = handle_cache_subcommand(cache_args) {
                eprintln!("Cache error: {e:#}");
                std::process::exit(1);
            }
        }
        Some(Commands::Config(config_args)) => {
            handle_config_subcommand(config_args);
        }
    }
}

fn run_log(args: LogArgs) -> Result<()> {
    let range = dates::resolve_range(args.from.as_deref(), args.to.as_deref())?;
    let config = Config::load_or_default()?;
    let options = config.project_options(args.no_cache);

    let mut managers = open_managers(&config, args.path.as_deref(), args.all_projects, &options)?;
    let span_gap = TimeDelta::try_seconds(args.span_gap)
        .filter(|gap| *gap >= TimeDelta::zero())
        .with_context(|| format!("Invalid --span-gap: {}", args.span_gap))?;
    let projects = managers
        .iter()
        .map(|m| m.project_dir().display().to_string())
        .collect();

    let load = DirectoryAggregator::new(managers.iter_mut()).aggregate(&range);
    for diagnostic in &load.diagnostics {
        debug_log::log("LOAD", "DIAG", &diagnostic.to_string());
    }

    let report = Report {
        projects,
        entries: (!args.sessions_only).then(|| load.records().collect()),
        sessions: build_session_index(&load.entries),
        spans: build_spans(&load.entries, span_gap),
        diagnostics: load.diagnostics.iter().map(|d| d.to_string()).collect(),
    };

    let json = if args.pretty {
        simd_json::to_string_pretty(&report)?
    } else {
        simd_json::to_string(&report)?
    };
    println!("{json}");

    Ok(())
}

/// One manager for PATH, or one per project under the root.
fn open_managers(
    config: &Config,
    path: Option<&Path>,
    all_projects: bool,
    options: &ProjectOptions,
) -> Result<Vec<ProjectCacheManager>> {
    let dirs = match (path, all_projects) {
        (Some(path), false) => {
            if !path.is_dir() {
                anyhow::bail!("{} is not a directory", path.display());
            }
            vec![path.to_path_buf()]
        }
        (Some(root), true) => discover_projects(root)?,
        (None, _) => {
            let root = config.projects_root()?;
            discover_projects(&root)
                .with_context(|| format!("No projects found under {}", root.display()))?
        }
    };

    Ok(dirs
        .into_iter()
        .map(|dir| ProjectCacheManager::with_options(dir, options.clone()))
        .collect())
}

fn open_target(
    config: &Config,
    target: &CacheTarget,
    options: &ProjectOptions,
) -> Result<Vec<ProjectCacheManager>> {
    open_managers(config, target.path.as_deref(), target.all_projects, options)
}

fn handle_cache_subcommand(cache_args: CacheArgs) -> Result<()> {
    let config = Config::load_or_default()?;
    let options = config.project_options(false);

    match cache_args.subcommand {
        CacheSubcommands::Stats(target) => {
            let mut total = CacheStats::default();
            for mut manager in open_target(&config, &target, &options)? {
                let stats = manager.cache_stats()?;
                println!(
                    "{}: {} files, {} records, {} malformed lines, {}",
                    manager.project_dir().display(),
                    stats.cached_files,
                    stats.total_records,
                    stats.malformed_lines,
                    format_bytes(stats.bytes_on_disk)
                );
                total.cached_files += stats.cached_files;
                total.total_records += stats.total_records;
                total.malformed_lines += stats.malformed_lines;
                total.bytes_on_disk += stats.bytes_on_disk;
            }
            println!(
                "Total: {} files, {} records, {}",
                total.cached_files,
                total.total_records,
                format_bytes(total.bytes_on_disk)
            );
        }
        CacheSubcommands::Clear(target) => {
            let mut removed = 0;
            for mut manager in open_target(&config, &target, &options)? {
                removed += manager.clear_cache()?;
            }
            println!("🧹 Removed {removed} cache files");
        }
        CacheSubcommands::Prune(target) => {
            let mut removed = 0;
            for mut manager in open_target(&config, &target, &options)? {
                removed += manager.prune()?;
            }
            println!("🧹 Pruned {removed} orphaned cache files");
        }
    }

    Ok(())
}

fn handle_config_subcommand(config_args: ConfigArgs) {
    match config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            if let Err(e) = config::create_default_config(overwrite) {
                eprintln!("Error creating config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Show => {
            if let Err(e) = config::show_config() {
                eprintln!("Error showing config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Set { key, value } => {
            if let Err(e) = config::set_config_value(&key, &value) {
                eprintln!("Error setting config: {e}");
                std::process::exit(1);
            }
        }
    }
}
