//! Configuration loading and schema definitions.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// A commented starter configuration written by `rotor init`.
pub fn sample_config() -> &'static str {
    r#"# rotor configuration
#
# One file describes the whole scheduling universe: the catalog of vendors,
# images, and tests, plus the fleet of hosts and testee classes.

[scheduler]
# Rotation state and lock files live here.
state_dir = ".rotor"
# Per-scope lock wait before giving up with a retryable conflict.
lock_timeout_ms = 5000
# Guest memory is allocated in multiples of this step (MiB).
memory_step_mib = 256
# Memory kept back for the virtualization layer on each host.
host_reserve_mib = "1G"
# Site octets for generated guest MAC addresses. The middle octets mix
# these with a hash of the scope name, so runs on different hosts or
# classes never mint the same address.
mac_site_octets = [10, 42]

# Vendors rotate in the order listed here.
[[vendors]]
name = "redhat"

[[vendors]]
name = "suse"

[[images]]
name = "redhat_rhel5u2_64b_smp.qcow2"
vendor = "redhat"
format = "qcow2"
arch = "x86_64"
guest_type = "fully-virtualized"
os_family = "linux"
min_memory = "1G"
bigmem = true
smp = true

[[images]]
name = "suse_sles10_32b_up.qcow2"
vendor = "suse"
arch = "i686"
os_family = "linux"
smp = false

[[tests]]
name = "kernbench"
command = "loop_kernbench"
os_family = "linux"
duration = "long"
timeout_secs = 36000

[[tests]]
name = "LTP"
command = "run_ltp"
os_family = "linux"

# Manually owned hosts. Each host is its own rotation scope.
[[hosts]]
name = "unicorn"
memory = "8G"
vcpus = 4
arches = ["x86_64", "i686"]

# Automatic testee classes. Each class is its own rotation scope.
[[classes]]
name = "xen-unstable-64b"
memory = "4G"
vcpus = 2
arches = ["x86_64", "i686"]
"#
}
