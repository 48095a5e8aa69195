//! rotor: a round-robin test matrix scheduler for virtualization test fleets.
//!
//! Given a catalog of (vendor, image, test) combinations and a fleet of
//! hosts, each invocation picks the next combination for one scheduling
//! scope so that, over many invocations, every eligible combination is
//! scheduled exactly once per cycle.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Catalog**: vendors in rotation order and their schedulable combinations
//! - **Registry**: fleet members (hosts, testee classes) and their capacities
//! - **State**: durable per-scope rotation records with atomic commits
//! - **Scheduler**: the decision engine (round-robin + weighted random tie-break)
//! - **Emit**: renders assignments for the external execution system
//!
//! # Example
//!
//! ```no_run
//! use rotor::catalog::Catalog;
//! use rotor::config::load_config;
//! use rotor::registry::{Registry, Scope};
//! use rotor::scheduler::Scheduler;
//! use rotor::state::StateStore;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("rotor.toml"))?;
//!     let catalog = Catalog::new(&config);
//!     let registry = Registry::new(&config);
//!     let store = StateStore::open(&config.scheduler.state_dir, Duration::from_secs(5))?;
//!     let mut scheduler = Scheduler::new(&catalog, &registry, &store, &config.scheduler);
//!     let run = scheduler.schedule(&Scope::Host("unicorn".into()))?;
//!     println!("{}", rotor::emit::render(&run, rotor::emit::ArtifactFormat::Json)?);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod checks;
pub mod config;
pub mod emit;
pub mod registry;
pub mod scheduler;
pub mod state;

// Re-export commonly used types
pub use catalog::{Catalog, Combination};
pub use config::{load_config, Config};
pub use emit::ArtifactFormat;
pub use registry::{Capacity, Mode, Registry, Scope};
pub use scheduler::{Assignment, ScheduleError, Scheduler, TestRun};
pub use state::{ScopeRecord, StateStore};
