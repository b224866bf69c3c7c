use std::path::Path;
use tokio::process::Command;

use crate::errors::MonitorError;

/// Arguments for the "list upgradable packages, including all architectures" query.
pub const LIST_UPGRADABLE_ARGS: [&str; 3] = ["list", "--upgradable", "-a"];

/// One line of the package manager's upgradable list.
///
/// apt prints `name/suite version arch [upgradable from: old]`. Lines that don't
/// follow that shape still count as an upgrade; only `raw` and `name` are filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradablePackage {
    pub name: String,
    pub suite: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub from_version: Option<String>,
    pub raw: String,
}

impl UpgradablePackage {
    pub fn parse(line: &str) -> Self {
        let raw = line.trim().to_string();
        let mut tokens = raw.split_whitespace();
        let first = tokens.next().unwrap_or_default();
        let (name, suite) = match first.split_once('/') {
            Some((name, suite)) => (name.to_string(), Some(suite.to_string())),
            None => (first.to_string(), None),
        };
        let version = tokens.next().map(str::to_string);
        let arch = tokens.next().map(str::to_string);

        let from_version = raw
            .split_once("upgradable from: ")
            .map(|(_, rest)| rest.trim_end_matches(']').trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            name,
            suite,
            version,
            arch,
            from_version,
            raw,
        }
    }
}

/// Splits raw query output into package entries, skipping exactly `header_lines`
/// leading lines and every empty line after them.
pub fn parse_upgradable(stdout: &str, header_lines: usize) -> Vec<UpgradablePackage> {
    stdout
        .lines()
        .skip(header_lines)
        .filter(|line| !line.trim().is_empty())
        .map(UpgradablePackage::parse)
        .collect()
}

/// Runs the upgradable query against `executable` and parses its stdout.
///
/// A non-zero exit is a [`MonitorError::Query`]; the reason carries stderr when
/// the package manager printed any.
pub async fn list_upgradable(
    executable: &Path,
    header_lines: usize,
) -> Result<Vec<UpgradablePackage>, MonitorError> {
    let output = Command::new(executable)
        .args(LIST_UPGRADABLE_ARGS)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| MonitorError::Query {
            executable: executable.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let reason = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            format!("exited with {}: {stderr}", output.status)
        };
        return Err(MonitorError::Query {
            executable: executable.to_path_buf(),
            reason,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_upgradable(&stdout, header_lines))
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes an executable `sh` script named `name` into `dir`.
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }
}
