//! Rendering test runs for the external execution system.
//!
//! The emitted artifact is the scheduler's only interface to the outside:
//! everything the execution system needs to provision and boot the guests
//! is in here, keyed by stable assignment ids. Rendering is a pure function
//! of the run.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::scheduler::TestRun;

/// Output format of the emitted artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Json,
    Toml,
}

/// Render a test run into an artifact string.
pub fn render(run: &TestRun, format: ArtifactFormat) -> Result<String> {
    match format {
        ArtifactFormat::Json => {
            serde_json::to_string_pretty(run).context("Failed to render test run as JSON")
        }
        ArtifactFormat::Toml => {
            toml::to_string_pretty(run).context("Failed to render test run as TOML")
        }
    }
}

/// Render and write the artifact to a file, or to stdout when no path is
/// given.
pub fn write_artifact(run: &TestRun, format: ArtifactFormat, output: Option<&Path>) -> Result<()> {
    let artifact = render(run, format)?;
    match output {
        Some(path) => std::fs::write(path, artifact.as_bytes())
            .with_context(|| format!("Failed to write artifact to {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{artifact}").context("Failed to write artifact to stdout")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Arch, GuestType, ImageFormat};
    use crate::scheduler::Assignment;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_run() -> TestRun {
        let created_at = Utc::now();
        TestRun {
            run_id: Uuid::new_v4(),
            scope: "host:unicorn".into(),
            created_at,
            assignments: vec![Assignment {
                id: Uuid::new_v4(),
                scope: "host:unicorn".into(),
                vendor: "redhat".into(),
                image: "redhat_rhel5u2_64b.qcow2".into(),
                image_format: ImageFormat::Qcow2,
                arch: Arch::X86_64,
                guest_type: GuestType::FullyVirtualized,
                test: "LTP".into(),
                test_command: "run_ltp".into(),
                timeout_secs: 36_000,
                memory_mib: 2048,
                vcpus: 2,
                run_index: 1,
                vnc_display: 0,
                mac_address: "52:54:00:0A:2A:01".into(),
                created_at,
            }],
        }
    }

    #[test]
    fn test_json_artifact_carries_required_fields() {
        let run = sample_run();
        let artifact = render(&run, ArtifactFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&artifact).unwrap();

        let assignment = &value["assignments"][0];
        for field in [
            "id",
            "vendor",
            "image",
            "test",
            "scope",
            "memory_mib",
            "vcpus",
        ] {
            assert!(!assignment[field].is_null(), "missing field {field}");
        }
        assert_eq!(assignment["arch"], "x86_64");
        assert_eq!(assignment["guest_type"], "fully-virtualized");
    }

    #[test]
    fn test_toml_artifact_parses_back() {
        let run = sample_run();
        let artifact = render(&run, ArtifactFormat::Toml).unwrap();
        let value: toml::Value = toml::from_str(&artifact).unwrap();
        assert_eq!(
            value["assignments"][0]["image"].as_str(),
            Some("redhat_rhel5u2_64b.qcow2")
        );
    }

    #[test]
    fn test_rendering_is_pure() {
        let run = sample_run();
        let a = render(&run, ArtifactFormat::Json).unwrap();
        let b = render(&run, ArtifactFormat::Json).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_write_artifact_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let run = sample_run();
        write_artifact(&run, ArtifactFormat::Json, Some(&path)).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("run_ltp"));
    }
}
