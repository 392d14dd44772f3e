//! Job id generation.
//!
//! Ids look like `{name}-{serial:03}-{version}-{dataset}`, e.g.
//! `baseline-004-v002-datasource_complete`. The serial is one more than the
//! highest serial already present under the jobs root, so two jobs with the
//! same name and source never collide.

use std::path::Path;

use crate::error::{BatchError, Result};

const DEFAULT_NAME: &str = "job";

/// Next free serial under `root`.
pub fn next_serial(root: &Path) -> Result<u32> {
    if !root.exists() {
        return Ok(1);
    }

    let entries = std::fs::read_dir(root).map_err(|e| BatchError::io(root, e))?;

    let max_serial = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().and_then(parse_serial))
        .max()
        .unwrap_or(0);

    Ok(max_serial + 1)
}

/// Extract the serial from a job directory name.
///
/// The serial is the first all-digit segment (3+ digits) that is followed by
/// a `vNNN` version segment.
fn parse_serial(dir_name: &str) -> Option<u32> {
    let segments: Vec<&str> = dir_name.split('-').collect();

    segments.windows(2).find_map(|pair| {
        let (serial, version) = (pair[0], pair[1]);
        let is_serial = serial.len() >= 3 && serial.bytes().all(|b| b.is_ascii_digit());
        if is_serial && is_version_segment(version) {
            serial.parse().ok()
        } else {
            None
        }
    })
}

fn is_version_segment(segment: &str) -> bool {
    segment
        .strip_prefix('v')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Version tag derived from a processor reference.
///
/// `volume-weight.v002.system.txt` → `v002`, `weight.v2.system.txt` → `v002`,
/// anything else → `v000`.
pub fn processor_version(reference: &str) -> String {
    let parts: Vec<&str> = reference.split('.').collect();
    if parts.len() < 3 {
        return "v000".to_string();
    }

    parts[1..parts.len() - 1]
        .iter()
        .find(|part| is_version_segment(part))
        .and_then(|part| part[1..].parse::<u32>().ok())
        .map(|n| format!("v{:03}", n))
        .unwrap_or_else(|| "v000".to_string())
}

/// Dataset tag derived from the source path (its file stem).
pub fn dataset_name(source: &Path) -> String {
    source
        .file_stem()
        .and_then(|s| s.to_str())
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "input".to_string())
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Generate a fresh job id for `source` under `root`.
pub fn generate_job_id(
    root: &Path,
    name: Option<&str>,
    processor: Option<&str>,
    source: &Path,
) -> Result<String> {
    let serial = next_serial(root)?;
    let prefix = name
        .map(sanitize)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_NAME.to_string());
    let version = processor.map(processor_version).unwrap_or_else(|| "v000".to_string());

    Ok(format!("{}-{:03}-{}-{}", prefix, serial, version, dataset_name(source)))
}
