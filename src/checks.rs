//! Input sanity checks for identifiers and quantities.
//!
//! Every name that ends up in a state file path or an emitted artifact is
//! validated here at config-load time, so the rest of the crate can treat
//! identifiers as trusted.

use std::sync::OnceLock;

use regex::Regex;

/// Result type for check operations.
pub type CheckResult<T> = Result<T, CheckError>;

/// Errors produced by input validation.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("invalid host name '{0}': must start with a letter and contain only letters, digits, and dashes")]
    HostName(String),

    #[error("invalid image name '{0}': must start with a letter and contain only letters, digits, and _,+@-./=")]
    ImageName(String),

    #[error("invalid test name '{0}': must start with a letter and contain only letters, digits, underscores, and dashes")]
    TestName(String),

    #[error("invalid vendor name '{0}': must start with a letter and contain only letters, digits, underscores, and dashes")]
    VendorName(String),

    #[error("invalid test command '{0}': contains characters outside letters, digits, and _,+@-./=")]
    TestCommand(String),

    #[error("invalid memory size '{0}': expected a number with an optional M/MB or G/GB suffix")]
    MemorySize(String),

    #[error("vcpu count {0} out of range (1..={max})", max = MAX_VCPUS)]
    VcpuCount(u32),
}

/// Upper bound on configurable vcpus per host or class.
pub const MAX_VCPUS: u32 = 64;

fn pattern(cell: &'static OnceLock<Regex>, re: &'static str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(re).unwrap())
}

/// Validate a host or testee-class name.
pub fn host_name(name: &str) -> CheckResult<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if pattern(&RE, r"^[A-Za-z][A-Za-z0-9\-]*$").is_match(name) {
        Ok(())
    } else {
        Err(CheckError::HostName(name.to_string()))
    }
}

/// Validate a guest image name.
pub fn image_name(name: &str) -> CheckResult<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if pattern(&RE, r"^[A-Za-z][A-Za-z0-9_,+@\-\./=]*$").is_match(name) {
        Ok(())
    } else {
        Err(CheckError::ImageName(name.to_string()))
    }
}

/// Validate a test procedure name.
pub fn test_name(name: &str) -> CheckResult<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if pattern(&RE, r"^[A-Za-z][A-Za-z0-9_\-]+$").is_match(name) {
        Ok(())
    } else {
        Err(CheckError::TestName(name.to_string()))
    }
}

/// Validate a vendor (distribution family) name.
pub fn vendor_name(name: &str) -> CheckResult<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if pattern(&RE, r"^[A-Za-z][A-Za-z0-9_\-]+$").is_match(name) {
        Ok(())
    } else {
        Err(CheckError::VendorName(name.to_string()))
    }
}

/// Validate the command line a test procedure runs inside the guest.
pub fn test_command(command: &str) -> CheckResult<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if pattern(&RE, r"^[A-Za-z0-9_,+@\-\./=]+$").is_match(command) {
        Ok(())
    } else {
        Err(CheckError::TestCommand(command.to_string()))
    }
}

/// Parse a memory size into MiB.
///
/// Accepts a bare number (already MiB) or a number with an `M`/`MB` or
/// `G`/`GB` suffix, e.g. `512M`, `4G`, `1.5G`.
pub fn parse_memory_mib(value: &str) -> CheckResult<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = pattern(&RE, r"^([0-9]*\.?[0-9]+)\s*([MG]B?)?$");
    let caps = re
        .captures(value.trim())
        .ok_or_else(|| CheckError::MemorySize(value.to_string()))?;
    let number: f64 = caps[1]
        .parse()
        .map_err(|_| CheckError::MemorySize(value.to_string()))?;
    let mib = match caps.get(2).map(|m| m.as_str().as_bytes()[0]) {
        Some(b'G') => number * 1024.0,
        _ => number,
    };
    if !mib.is_finite() || mib < 1.0 {
        return Err(CheckError::MemorySize(value.to_string()));
    }
    Ok(mib.round() as u64)
}

/// Validate a vcpu count.
pub fn vcpu_count(count: u32) -> CheckResult<u32> {
    if (1..=MAX_VCPUS).contains(&count) {
        Ok(count)
    } else {
        Err(CheckError::VcpuCount(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_name_accepts_typical_names() {
        assert!(host_name("unicorn").is_ok());
        assert!(host_name("kvm-host-01").is_ok());
    }

    #[test]
    fn test_host_name_rejects_leading_digit_and_dots() {
        assert!(host_name("9lives").is_err());
        assert!(host_name("host.lab").is_err());
        assert!(host_name("").is_err());
    }

    #[test]
    fn test_image_name_allows_paths_and_versions() {
        assert!(image_name("redhat_rhel5u2_64b_smp.qcow2").is_ok());
        assert!(image_name("suse/sles10_32b_up.img").is_ok());
        assert!(image_name("../etc/passwd").is_err());
    }

    #[test]
    fn test_test_command_rejects_shell_metacharacters() {
        assert!(test_command("run_ltp").is_ok());
        assert!(test_command("loop_kernbench --fast").is_err());
        assert!(test_command("run; rm -rf /").is_err());
    }

    #[test]
    fn test_parse_memory_mib_suffixes() {
        assert_eq!(parse_memory_mib("512").unwrap(), 512);
        assert_eq!(parse_memory_mib("512M").unwrap(), 512);
        assert_eq!(parse_memory_mib("512MB").unwrap(), 512);
        assert_eq!(parse_memory_mib("4G").unwrap(), 4096);
        assert_eq!(parse_memory_mib("1.5G").unwrap(), 1536);
    }

    #[test]
    fn test_parse_memory_mib_rejects_garbage() {
        assert!(parse_memory_mib("lots").is_err());
        assert!(parse_memory_mib("-4G").is_err());
        assert!(parse_memory_mib("0").is_err());
    }

    #[test]
    fn test_vcpu_count_bounds() {
        assert!(vcpu_count(1).is_ok());
        assert!(vcpu_count(64).is_ok());
        assert!(vcpu_count(0).is_err());
        assert!(vcpu_count(65).is_err());
    }
}
