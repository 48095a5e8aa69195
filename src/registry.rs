//! The host registry: fleet members, their modes, and their capacities.
//!
//! A scheduling scope is either one manually owned host or one automatic
//! testee class. The two kinds live in separate keyspaces so they can never
//! collide in the rotation-state directory.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::checks;
use crate::config::{Arch, ClassConfig, Config, HostConfig};

/// Result type for registry lookups.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("unknown testee class: {0}")]
    UnknownClass(String),

    #[error("{0} is disabled; enable it in the config to schedule against it")]
    Disabled(Scope),
}

/// Scheduling mode of a fleet member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A host owned by a specific tester; scheduled on demand.
    Manual,
    /// A testee class scheduled by fleet-wide rotation.
    Automatic,
}

/// A rotation scope: the unit of fairness and of state serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Host(String),
    Class(String),
}

impl Scope {
    /// Filesystem-safe key for state and lock files.
    pub fn key(&self) -> String {
        match self {
            Scope::Host(name) => format!("host-{name}"),
            Scope::Class(name) => format!("class-{name}"),
        }
    }

    /// The bare host or class name.
    pub fn name(&self) -> &str {
        match self {
            Scope::Host(name) | Scope::Class(name) => name,
        }
    }

    /// The mode this scope belongs to.
    pub fn mode(&self) -> Mode {
        match self {
            Scope::Host(_) => Mode::Manual,
            Scope::Class(_) => Mode::Automatic,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Host(name) => write!(f, "host:{name}"),
            Scope::Class(name) => write!(f, "class:{name}"),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let scope = match s.split_once(':') {
            Some(("host", name)) => Scope::Host(name.to_string()),
            Some(("class", name)) => Scope::Class(name.to_string()),
            _ => {
                return Err(format!(
                    "invalid scope '{s}': expected host:<name> or class:<name>"
                ))
            }
        };
        // Scope names end up in state and lock file paths.
        checks::host_name(scope.name()).map_err(|err| err.to_string())?;
        Ok(scope)
    }
}

/// Resources a scope can hand to guests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capacity {
    /// Schedulable memory in MiB (host reserve already subtracted).
    pub memory_mib: u64,
    /// Schedulable vcpus.
    pub vcpus: u32,
    /// Guest architectures the scope can run.
    pub arches: BTreeSet<Arch>,
}

impl Capacity {
    /// Whether an image with the given requirements fits at all.
    pub fn admits(&self, arch: Arch, min_memory_mib: u64) -> bool {
        self.vcpus >= 1 && self.arches.contains(&arch) && self.memory_mib >= min_memory_mib
    }
}

/// Read-only view over the fleet.
pub struct Registry {
    hosts: Vec<HostConfig>,
    classes: Vec<ClassConfig>,
    host_reserve_mib: u64,
}

impl Registry {
    /// Build the registry from a loaded config.
    pub fn new(config: &Config) -> Self {
        Self {
            hosts: config.hosts.clone(),
            classes: config.classes.clone(),
            host_reserve_mib: config.scheduler.host_reserve_mib,
        }
    }

    /// Names of enabled fleet members in the given mode, in declared order.
    pub fn members_by_mode(&self, mode: Mode) -> Vec<String> {
        match mode {
            Mode::Manual => self
                .hosts
                .iter()
                .filter(|h| h.enabled)
                .map(|h| h.name.clone())
                .collect(),
            Mode::Automatic => self
                .classes
                .iter()
                .filter(|c| c.enabled)
                .map(|c| c.name.clone())
                .collect(),
        }
    }

    /// All class names in declared order, with their enabled flag.
    /// Used by the automatic rotation cursor, which must step over
    /// disabled entries without losing its position.
    pub fn classes_in_order(&self) -> Vec<(String, bool)> {
        self.classes
            .iter()
            .map(|c| (c.name.clone(), c.enabled))
            .collect()
    }

    /// Resolve a scope against the fleet without touching capacity.
    ///
    /// Disabled members still resolve, so operator tools like `reset` can
    /// work on them; unknown names are an error.
    pub fn resolve(&self, scope: &Scope) -> RegistryResult<Mode> {
        match scope {
            Scope::Host(name) => self
                .hosts
                .iter()
                .find(|h| &h.name == name)
                .map(|_| Mode::Manual)
                .ok_or_else(|| RegistryError::UnknownHost(name.clone())),
            Scope::Class(name) => self
                .classes
                .iter()
                .find(|c| &c.name == name)
                .map(|_| Mode::Automatic)
                .ok_or_else(|| RegistryError::UnknownClass(name.clone())),
        }
    }

    /// Capacity of a scope, after the host reserve.
    ///
    /// Fails for unknown scopes and for disabled ones, so an operator who
    /// pulled a host out of the fleet gets a diagnostic rather than a
    /// silently scheduled guest.
    pub fn capacity_of(&self, scope: &Scope) -> RegistryResult<Capacity> {
        match scope {
            Scope::Host(name) => {
                let host = self
                    .hosts
                    .iter()
                    .find(|h| &h.name == name)
                    .ok_or_else(|| RegistryError::UnknownHost(name.clone()))?;
                if !host.enabled {
                    return Err(RegistryError::Disabled(scope.clone()));
                }
                Ok(Capacity {
                    memory_mib: host.memory.saturating_sub(self.host_reserve_mib),
                    vcpus: host.vcpus,
                    arches: host.arches.clone(),
                })
            }
            Scope::Class(name) => {
                let class = self
                    .classes
                    .iter()
                    .find(|c| &c.name == name)
                    .ok_or_else(|| RegistryError::UnknownClass(name.clone()))?;
                if !class.enabled {
                    return Err(RegistryError::Disabled(scope.clone()));
                }
                Ok(Capacity {
                    memory_mib: class.memory,
                    vcpus: class.vcpus,
                    arches: class.arches.clone(),
                })
            }
        }
    }
}
