//! rotor CLI - test matrix scheduler for virtualization test fleets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use rotor::catalog::Catalog;
use rotor::config::{self, Config};
use rotor::emit::{self, ArtifactFormat};
use rotor::registry::{Registry, Scope};
use rotor::scheduler::{ScheduleError, Scheduler};
use rotor::state::StateStore;

#[derive(Parser)]
#[command(name = "rotor")]
#[command(about = "Round-robin test matrix scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "rotor.toml")]
    config: PathBuf,

    /// Override the state directory from the config
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule the next guest test for a scope
    Schedule {
        /// Schedule for a manually owned host
        #[arg(long)]
        host: Option<String>,

        /// Schedule for a specific testee class
        #[arg(long)]
        class: Option<String>,

        /// Pick the next testee class by fleet-wide rotation
        #[arg(long)]
        auto: bool,

        /// Keep scheduling guests until the scope's capacity is exhausted
        #[arg(long)]
        fill: bool,

        /// Fixed random seed for reproducible tie-breaks
        #[arg(long)]
        seed: Option<u64>,

        /// Artifact format
        #[arg(long, value_enum, default_value_t = FormatArg::Json)]
        format: FormatArg,

        /// Write the artifact to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show cycle progress for a scope (host:<name> or class:<name>)
    Status {
        scope: Scope,
    },

    /// Clear a scope's rotation record
    Reset {
        scope: Scope,
    },

    /// List catalog or fleet entries
    List {
        what: ListTarget,
    },

    /// Validate the configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Toml,
}

impl From<FormatArg> for ArtifactFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Json => ArtifactFormat::Json,
            FormatArg::Toml => ArtifactFormat::Toml,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListTarget {
    Vendors,
    Images,
    Tests,
    Hosts,
}

/// Exit code for retryable lock contention, so cron wrappers can back off
/// and retry instead of paging someone.
const EXIT_RETRYABLE: i32 = 75;

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install logging subscriber");
    }

    if let Err(err) = run(cli) {
        eprintln!("{} {err:#}", style("error:").red().bold());
        let retryable = err
            .downcast_ref::<ScheduleError>()
            .is_some_and(ScheduleError::is_retryable);
        std::process::exit(if retryable { EXIT_RETRYABLE } else { 1 });
    }
}

fn run(cli: Cli) -> Result<()> {
    // Init must work before a config exists.
    if matches!(cli.command, Commands::Init) {
        return init_config(&cli.config);
    }

    let config = config::load_config(&cli.config)?;
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| config.scheduler.state_dir.clone());

    match cli.command {
        Commands::Schedule {
            host,
            class,
            auto,
            fill,
            seed,
            format,
            output,
        } => schedule(
            &config, &state_dir, host, class, auto, fill, seed, format, output,
        ),
        Commands::Status { scope } => status(&config, &state_dir, &scope),
        Commands::Reset { scope } => reset(&config, &state_dir, &scope),
        Commands::List { what } => list(&config, what),
        Commands::Validate => validate(&config, &cli.config),
        Commands::Init => unreachable!("handled above"),
    }
}

fn open_store(config: &Config, state_dir: &Path) -> Result<StateStore> {
    let timeout = Duration::from_millis(config.scheduler.lock_timeout_ms);
    StateStore::open(state_dir, timeout)
        .with_context(|| format!("Failed to open state directory {}", state_dir.display()))
}

#[allow(clippy::too_many_arguments)]
fn schedule(
    config: &Config,
    state_dir: &Path,
    host: Option<String>,
    class: Option<String>,
    auto: bool,
    fill: bool,
    seed: Option<u64>,
    format: FormatArg,
    output: Option<PathBuf>,
) -> Result<()> {
    let targets = usize::from(host.is_some()) + usize::from(class.is_some()) + usize::from(auto);
    if targets != 1 {
        bail!("pass exactly one of --host, --class, or --auto");
    }

    let catalog = Catalog::new(config);
    let registry = Registry::new(config);
    let store = open_store(config, state_dir)?;

    let mut scheduler = match seed {
        Some(seed) => Scheduler::with_seed(&catalog, &registry, &store, &config.scheduler, seed),
        None => Scheduler::new(&catalog, &registry, &store, &config.scheduler),
    };

    let scope = if let Some(name) = host {
        Some(Scope::Host(name))
    } else {
        class.map(Scope::Class)
    };

    let run = match scope {
        Some(scope) => {
            info!(scope = %scope, fill, "scheduling");
            if fill {
                scheduler.schedule_fill(&scope)?
            } else {
                scheduler.schedule(&scope)?
            }
        }
        // --auto: the class cursor only advances once the run committed.
        None => {
            info!(fill, "scheduling next class in rotation");
            scheduler.schedule_auto(fill)?
        }
    };

    emit::write_artifact(&run, format.into(), output.as_deref())
}

fn status(config: &Config, state_dir: &Path, scope: &Scope) -> Result<()> {
    let catalog = Catalog::new(config);
    let registry = Registry::new(config);
    let store = open_store(config, state_dir)?;

    let capacity = registry.capacity_of(scope)?;
    let record = store.load(scope)?;

    println!(
        "{} (capacity: {} MiB, {} vcpus)",
        style(scope).bold(),
        capacity.memory_mib,
        capacity.vcpus
    );
    if let Some(last) = &record.last_vendor {
        println!("last vendor: {last}");
    }
    for vendor in catalog.vendors() {
        let eligible = catalog
            .combinations_for(vendor)?
            .iter()
            .filter(|c| capacity.admits(c.image.arch, c.image.min_memory_mib))
            .count();
        let done = record.scheduled_count(vendor);
        let line = format!("{vendor:<20} {done}/{eligible} scheduled this cycle");
        if eligible == 0 {
            println!("{}", style(line).dim());
        } else {
            println!("{line}");
        }
    }
    Ok(())
}

fn reset(config: &Config, state_dir: &Path, scope: &Scope) -> Result<()> {
    let registry = Registry::new(config);
    registry.resolve(scope)?;

    let store = open_store(config, state_dir)?;
    let _lock = store.lock(scope).map_err(ScheduleError::State)?;
    store.clear(scope)?;
    println!("rotation record for {scope} cleared");
    Ok(())
}

fn list(config: &Config, what: ListTarget) -> Result<()> {
    let catalog = Catalog::new(config);
    match what {
        ListTarget::Vendors => {
            for vendor in catalog.vendors() {
                let combos = catalog.combinations_for(vendor)?.len();
                println!("{vendor:<20} {combos} combinations");
            }
        }
        ListTarget::Images => {
            for image in &config.images {
                let line = format!(
                    "{:<44} {:<10} {:<8} {:>6} MiB min",
                    image.name, image.vendor, image.arch, image.min_memory_mib
                );
                if image.enabled {
                    println!("{line}");
                } else {
                    println!("{} {}", style(line).dim(), style("(disabled)").dim());
                }
            }
        }
        ListTarget::Tests => {
            for test in &config.tests {
                println!(
                    "{:<16} {:<20} os={:<10} timeout={}s",
                    test.name, test.command, test.os_family, test.timeout_secs
                );
            }
        }
        ListTarget::Hosts => {
            for host in &config.hosts {
                let line = format!(
                    "host  {:<20} {:>6} MiB, {} vcpus",
                    host.name, host.memory, host.vcpus
                );
                if host.enabled {
                    println!("{line}");
                } else {
                    println!("{}", style(line).dim());
                }
            }
            for class in &config.classes {
                let line = format!(
                    "class {:<20} {:>6} MiB, {} vcpus",
                    class.name, class.memory, class.vcpus
                );
                if class.enabled {
                    println!("{line}");
                } else {
                    println!("{}", style(line).dim());
                }
            }
        }
    }
    Ok(())
}

fn validate(config: &Config, path: &Path) -> Result<()> {
    let problems = config.problems();
    if problems.is_empty() {
        let catalog = Catalog::new(config);
        println!(
            "{} {} ({} vendors, {} combinations, {} hosts, {} classes)",
            style("ok:").green().bold(),
            path.display(),
            config.vendors.len(),
            catalog.len(),
            config.hosts.len(),
            config.classes.len()
        );
        return Ok(());
    }
    for problem in &problems {
        eprintln!("{} {problem}", style("problem:").yellow().bold());
    }
    bail!("{} problem(s) found in {}", problems.len(), path.display());
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!(
            "{} already exists; remove it first or pass a different --config",
            path.display()
        );
    }
    std::fs::write(path, config::sample_config())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("wrote starter config to {}", path.display());
    Ok(())
}
