//! asyncload - CLI

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use asyncload::manifest::{package_name_for, Manifest};
use asyncload::runtime::io::DiskFileSystem;
use asyncload::runtime::scheduler::{AsyncLoader, LoadResult, PackageRequest, TickState};
use asyncload::util::config::{self, LoaderConfig};
use asyncload::util::logger::{self, LogLevel};
use asyncload::{NAME, VERSION};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use serde::Serialize;
use walkdir::WalkDir;

/// Event-driven asynchronous package loader
#[derive(Parser, Debug)]
#[command(name = "asyncload")]
#[command(author = "YaoXiang Team")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (RON); defaults to the user config
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build package files from a JSON manifest
    Pack {
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Load packages from a content directory
    Load {
        /// Content root holding the package files
        #[arg(value_name = "DIR")]
        root: PathBuf,

        /// Packages to load; every package below DIR when empty
        #[arg(value_name = "PACKAGE")]
        packages: Vec<String>,

        /// Run the graph on a background loading thread
        #[arg(long)]
        threaded: bool,

        /// Randomize the load order with this seed
        #[arg(long, value_name = "SEED")]
        randomize_seed: Option<u64>,

        /// Tick with this time limit instead of one blocking flush
        #[arg(long, value_name = "MS")]
        time_limit_ms: Option<u64>,

        /// Disk I/O threads
        #[arg(long, default_value_t = 4)]
        io_threads: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Print the user config file path instead
        #[arg(long)]
        path: bool,
    },

    /// Print version information
    Version,
}

#[derive(Debug, Serialize)]
struct PackageReport {
    name: String,
    result: String,
    objects: usize,
}

#[derive(Debug, Serialize)]
struct LoadReport {
    packages: Vec<PackageReport>,
    elapsed_ms: f64,
    ticks: usize,
    events_executed: usize,
    reads_issued: usize,
    bytes_read: u64,
}

fn load_config(path: Option<&Path>) -> Result<LoaderConfig> {
    let mut config = match path {
        Some(path) => LoaderConfig::load_file(path)?,
        None => config::load_user_config()?,
    };
    if path.is_some() {
        config.apply_env()?;
    }
    Ok(config)
}

fn discover(
    root: &Path,
    extension: &str,
) -> Vec<String> {
    let mut names: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| package_name_for(root, entry.path(), extension))
        .collect();
    names.sort();
    names
}

#[allow(clippy::too_many_arguments)]
fn run_load(
    mut config: LoaderConfig,
    root: PathBuf,
    packages: Vec<String>,
    threaded: bool,
    randomize_seed: Option<u64>,
    time_limit_ms: Option<u64>,
    io_threads: usize,
    json: bool,
) -> Result<()> {
    if threaded {
        config.use_background_thread = true;
    }
    if randomize_seed.is_some() {
        config.randomize_load_order = randomize_seed;
    }
    let root = match &config.content_root {
        Some(content_root) if root.as_os_str().is_empty() => content_root.clone(),
        _ => root,
    };
    let names = if packages.is_empty() {
        discover(&root, &config.package_extension)
    } else {
        packages
    };
    if names.is_empty() {
        bail!("no packages found below {}", root.display());
    }

    let fs = DiskFileSystem::new(&root, io_threads).context("failed to start disk I/O")?;
    let loader = AsyncLoader::builder().config(config).file_system(Arc::new(fs)).build()?;
    let store = Arc::clone(loader.store());

    let results: Arc<Mutex<BTreeMap<String, LoadResult>>> = Arc::new(Mutex::new(BTreeMap::new()));
    for name in &names {
        let results = Arc::clone(&results);
        loader.request_load(PackageRequest::new(name.clone()).on_complete(move |name, _, result| {
            results.lock().insert(name.to_string(), result);
        }))?;
    }

    let start = Instant::now();
    let mut ticks = 0;
    match time_limit_ms {
        Some(ms) => loop {
            ticks += 1;
            if loader.tick(true, false, Duration::from_millis(ms), None)? == TickState::Complete {
                break;
            }
        },
        None => {
            ticks = 1;
            loader.flush(None)?;
        }
    }
    let elapsed = start.elapsed();
    let stats = loader.stats();

    let results = results.lock();
    let report = LoadReport {
        packages: results
            .iter()
            .map(|(name, result)| PackageReport {
                name: name.clone(),
                result: result.to_string(),
                objects: store.objects_in_package(name),
            })
            .collect(),
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        ticks,
        events_executed: stats.events_executed,
        reads_issued: stats.reads_issued,
        bytes_read: stats.bytes_read,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for package in &report.packages {
        let status = match package.result.as_str() {
            "succeeded" => format!("{}", "ok".green()),
            "canceled" => format!("{}", "canceled".yellow()),
            _ => format!("{}", "failed".red()),
        };
        println!("{:>8}  {} ({} objects)", status, package.name, package.objects);
    }
    println!(
        "{} packages in {:.1} ms, {} ticks, {} events, {} reads, {} bytes",
        report.packages.len().bold(),
        report.elapsed_ms,
        report.ticks,
        report.events_executed,
        report.reads_issued,
        report.bytes_read
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init_with_level(LogLevel::from_verbosity(args.verbose));

    match args.command {
        Commands::Pack { manifest, out } => {
            let extension = load_config(args.config.as_deref())?.package_extension;
            let manifest = Manifest::load(&manifest)?;
            for path in manifest.write_all(&out, &extension)? {
                println!("{} {}", "wrote".green(), path.display());
            }
        }
        Commands::Load {
            root,
            packages,
            threaded,
            randomize_seed,
            time_limit_ms,
            io_threads,
            json,
        } => {
            let config = load_config(args.config.as_deref())?;
            run_load(config, root, packages, threaded, randomize_seed, time_limit_ms, io_threads, json)?;
        }
        Commands::Config { path } => {
            if path {
                match config::get_config_path() {
                    Some(path) => println!("{}", path.display()),
                    None => bail!("no user config directory"),
                }
            } else {
                print!("{}", load_config(args.config.as_deref())?.to_ron()?);
            }
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}
