//! Configuration schema definitions for rotor.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. One file carries the whole scheduling universe:
//! tuning knobs, the catalog (vendors, images, tests), and the host registry
//! (manually owned hosts and automatic testee classes).
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SchedulerConfig        - Tuning (state dir, lock timeout, memory steps)
//! ├── [[vendors]]            - OS vendors, in rotation order
//! ├── [[images]]             - Installable guest images, per vendor
//! ├── [[tests]]              - Test procedures with compatibility constraints
//! ├── [[hosts]]              - Manually owned hosts (one scheduling scope each)
//! └── [[classes]]            - Automatic testee classes (one scheduling scope each)
//! ```
//!
//! # Example
//!
//! ```
//! use rotor::config::Config;
//!
//! let config: Config = toml::from_str(r#"
//!     [scheduler]
//!     state_dir = ".rotor"
//!
//!     [[vendors]]
//!     name = "redhat"
//!
//!     [[images]]
//!     name = "redhat_rhel5u2_64b.qcow2"
//!     vendor = "redhat"
//!     arch = "x86_64"
//!     os_family = "linux"
//!
//!     [[tests]]
//!     name = "kernbench"
//!     command = "loop_kernbench"
//!     os_family = "linux"
//!
//!     [[hosts]]
//!     name = "unicorn"
//!     memory = "8G"
//!     vcpus = 4
//! "#).unwrap();
//! assert!(config.problems().is_empty());
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use crate::checks;

/// Root configuration structure for rotor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Scheduler tuning (optional, has defaults).
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Known OS vendors, in rotation order.
    #[serde(default)]
    pub vendors: Vec<VendorConfig>,

    /// Installable guest images.
    #[serde(default)]
    pub images: Vec<ImageConfig>,

    /// Test procedures.
    #[serde(default)]
    pub tests: Vec<TestConfig>,

    /// Manually owned hosts.
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// Automatic testee classes.
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
}

/// Scheduler tuning knobs.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `state_dir` | `.rotor` |
/// | `lock_timeout_ms` | 5000 |
/// | `memory_step_mib` | 256 |
/// | `min_guest_memory_mib` | 1024 |
/// | `bigmem_boundary_mib` | 4096 |
/// | `host_reserve_mib` | 1024 |
/// | `mac_site_octets` | `[0, 0]` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Directory holding rotation state files and locks.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// How long a scheduling invocation waits for a scope's lock before
    /// giving up with a retryable conflict.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Guest memory is allocated in multiples of this step.
    #[serde(default = "default_memory_step_mib")]
    pub memory_step_mib: u64,

    /// Smallest guest memory the scheduler will ever derive.
    #[serde(default = "default_min_guest_memory_mib", deserialize_with = "de_memory")]
    pub min_guest_memory_mib: u64,

    /// Memory boundary above which bigmem-capable guests are preferred.
    #[serde(default = "default_bigmem_boundary_mib", deserialize_with = "de_memory")]
    pub bigmem_boundary_mib: u64,

    /// Memory subtracted from each host's capacity for the virtualization
    /// layer itself before any guest is placed.
    #[serde(default = "default_host_reserve_mib", deserialize_with = "de_memory")]
    pub host_reserve_mib: u64,

    /// Two site-specific octets folded into generated guest MAC addresses,
    /// together with a hash of the scope name.
    #[serde(default)]
    pub mac_site_octets: [u8; 2],
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
            memory_step_mib: default_memory_step_mib(),
            min_guest_memory_mib: default_min_guest_memory_mib(),
            bigmem_boundary_mib: default_bigmem_boundary_mib(),
            host_reserve_mib: default_host_reserve_mib(),
            mac_site_octets: [0, 0],
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".rotor")
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_memory_step_mib() -> u64 {
    256
}

fn default_min_guest_memory_mib() -> u64 {
    1_024
}

fn default_bigmem_boundary_mib() -> u64 {
    4_096
}

fn default_host_reserve_mib() -> u64 {
    1_024
}

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    I686,
    X86_64,
    Aarch64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::I686 => write!(f, "i686"),
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

/// How a guest image is virtualized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuestType {
    Paravirtual,
    FullyVirtualized,
    Container,
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestType::Paravirtual => write!(f, "paravirtual"),
            GuestType::FullyVirtualized => write!(f, "fully-virtualized"),
            GuestType::Container => write!(f, "container"),
        }
    }
}

/// On-disk format of a guest image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow,
    Qcow2,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Raw => write!(f, "raw"),
            ImageFormat::Qcow => write!(f, "qcow"),
            ImageFormat::Qcow2 => write!(f, "qcow2"),
        }
    }
}

/// Expected duration class of a test procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationClass {
    Short,
    Long,
}

/// An OS vendor (distribution family) in rotation order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VendorConfig {
    /// Vendor identifier, e.g. `redhat`.
    pub name: String,
}

/// An installable guest image.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    /// Image file name, unique across the catalog.
    pub name: String,

    /// Vendor this image belongs to. Must match a `[[vendors]]` entry.
    pub vendor: String,

    /// On-disk image format.
    #[serde(default = "default_image_format")]
    pub format: ImageFormat,

    /// Guest CPU architecture of the image.
    pub arch: Arch,

    /// Virtualization flavor the image boots under.
    #[serde(default = "default_guest_type")]
    pub guest_type: GuestType,

    /// OS family used to match compatible tests, e.g. `linux`, `windows`.
    pub os_family: String,

    /// Minimum guest memory the image is documented to need, in MiB.
    /// Accepts `"512M"` / `"4G"` style strings under the `min_memory` key.
    #[serde(
        default = "default_min_guest_memory_mib",
        deserialize_with = "de_memory",
        alias = "min_memory"
    )]
    pub min_memory_mib: u64,

    /// Whether the guest OS can address more than the bigmem boundary.
    #[serde(default)]
    pub bigmem: bool,

    /// Whether the guest kernel supports multiple vcpus.
    #[serde(default = "default_true")]
    pub smp: bool,

    /// Disabled images are never scheduled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_image_format() -> ImageFormat {
    ImageFormat::Qcow2
}

fn default_guest_type() -> GuestType {
    GuestType::FullyVirtualized
}

fn default_true() -> bool {
    true
}

/// A test procedure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestConfig {
    /// Test identifier, e.g. `kernbench`.
    pub name: String,

    /// Command executed inside the guest.
    pub command: String,

    /// OS family the test runs against.
    pub os_family: String,

    /// Guest types the test is restricted to. Empty means any.
    #[serde(default)]
    pub guest_types: Vec<GuestType>,

    /// Expected duration class.
    #[serde(default = "default_duration")]
    pub duration: DurationClass,

    /// Hard timeout handed to the execution system, in seconds.
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_duration() -> DurationClass {
    DurationClass::Long
}

fn default_test_timeout_secs() -> u64 {
    36_000
}

/// A manually owned host; each one is its own scheduling scope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Host name.
    pub name: String,

    /// Physical memory, in MiB. Accepts `"8G"` style strings.
    #[serde(deserialize_with = "de_memory")]
    pub memory: u64,

    /// Number of schedulable vcpus.
    pub vcpus: u32,

    /// Guest architectures the host can run.
    #[serde(default = "default_arches")]
    pub arches: BTreeSet<Arch>,

    /// Disabled hosts refuse scheduling with a diagnostic.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// An automatic testee class; each one is its own scheduling scope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassConfig {
    /// Class name, e.g. `xen-unstable-64b`.
    pub name: String,

    /// Memory capacity assumed for members of the class, in MiB.
    #[serde(deserialize_with = "de_memory")]
    pub memory: u64,

    /// Vcpu capacity assumed for members of the class.
    pub vcpus: u32,

    /// Guest architectures members of the class can run.
    #[serde(default = "default_arches")]
    pub arches: BTreeSet<Arch>,

    /// Disabled classes are skipped by automatic rotation.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_arches() -> BTreeSet<Arch> {
    [Arch::X86_64, Arch::I686].into_iter().collect()
}

/// Deserialize a memory size given either as MiB (integer) or as a
/// suffixed string like `"4G"`.
fn de_memory<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Mib(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Mib(mib) => Ok(mib),
        Raw::Text(text) => checks::parse_memory_mib(&text).map_err(serde::de::Error::custom),
    }
}

impl Config {
    /// Cross-check the configuration and collect every problem found.
    ///
    /// An empty result means the config is usable. Problems are worded for
    /// the operator running `rotor validate`.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let mut vendor_names = HashSet::new();
        for vendor in &self.vendors {
            if let Err(err) = checks::vendor_name(&vendor.name) {
                problems.push(err.to_string());
            }
            if !vendor_names.insert(vendor.name.as_str()) {
                problems.push(format!("duplicate vendor '{}'", vendor.name));
            }
        }

        let mut image_names = HashSet::new();
        for image in &self.images {
            if let Err(err) = checks::image_name(&image.name) {
                problems.push(err.to_string());
            }
            if !image_names.insert(image.name.as_str()) {
                problems.push(format!("duplicate image '{}'", image.name));
            }
            if !vendor_names.contains(image.vendor.as_str()) {
                problems.push(format!(
                    "image '{}' references unknown vendor '{}'",
                    image.name, image.vendor
                ));
            }
            if image.min_memory_mib == 0 {
                problems.push(format!("image '{}' declares zero minimum memory", image.name));
            }
            if !self.tests.iter().any(|t| test_fits_image(t, image)) {
                problems.push(format!(
                    "image '{}' has no compatible test (os family '{}')",
                    image.name, image.os_family
                ));
            }
        }

        let mut test_keys = HashSet::new();
        for test in &self.tests {
            if let Err(err) = checks::test_name(&test.name) {
                problems.push(err.to_string());
            }
            if let Err(err) = checks::test_command(&test.command) {
                problems.push(err.to_string());
            }
            if !test_keys.insert((test.name.as_str(), test.os_family.as_str())) {
                problems.push(format!(
                    "duplicate test '{}' for os family '{}'",
                    test.name, test.os_family
                ));
            }
            if !self.images.iter().any(|i| test_fits_image(test, i)) {
                problems.push(format!(
                    "test '{}' matches no image (os family '{}')",
                    test.name, test.os_family
                ));
            }
        }

        let mut scope_names = HashSet::new();
        for host in &self.hosts {
            if let Err(err) = checks::host_name(&host.name) {
                problems.push(err.to_string());
            }
            if !scope_names.insert(format!("host:{}", host.name)) {
                problems.push(format!("duplicate host '{}'", host.name));
            }
            if let Err(err) = checks::vcpu_count(host.vcpus) {
                problems.push(format!("host '{}': {}", host.name, err));
            }
            if host.memory <= self.scheduler.host_reserve_mib {
                problems.push(format!(
                    "host '{}' has no memory left after the {} MiB reserve",
                    host.name, self.scheduler.host_reserve_mib
                ));
            }
        }
        for class in &self.classes {
            if let Err(err) = checks::host_name(&class.name) {
                problems.push(err.to_string());
            }
            if !scope_names.insert(format!("class:{}", class.name)) {
                problems.push(format!("duplicate class '{}'", class.name));
            }
            if let Err(err) = checks::vcpu_count(class.vcpus) {
                problems.push(format!("class '{}': {}", class.name, err));
            }
        }

        // An image nothing in the fleet could ever fit is an operator
        // mistake, not a per-invocation failure.
        for image in &self.images {
            if image.enabled && !self.capacity_exists_for(image) {
                problems.push(format!(
                    "image '{}' needs {} MiB / arch {} but no enabled host or class provides that",
                    image.name, image.min_memory_mib, image.arch
                ));
            }
        }

        problems
    }

    fn capacity_exists_for(&self, image: &ImageConfig) -> bool {
        let host_fits = self.hosts.iter().any(|h| {
            h.enabled
                && h.arches.contains(&image.arch)
                && h.memory.saturating_sub(self.scheduler.host_reserve_mib) >= image.min_memory_mib
        });
        let class_fits = self.classes.iter().any(|c| {
            c.enabled && c.arches.contains(&image.arch) && c.memory >= image.min_memory_mib
        });
        host_fits || class_fits
    }
}

/// Compatibility rule between a test and an image: matching OS family, and
/// the image's guest type within the test's restriction (if any).
pub fn test_fits_image(test: &TestConfig, image: &ImageConfig) -> bool {
    test.os_family == image.os_family
        && (test.guest_types.is_empty() || test.guest_types.contains(&image.guest_type))
}
