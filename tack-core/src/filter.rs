//! Ignore-filter for files under the watched directory.
//!
//! Decides which files the catalog should skip: directories, report and log
//! sidecars, the catalog database itself, and every segment of a multi-part
//! image except the first. Rules are evaluated in order and the first match
//! wins.
//!
//! The `.img` rule inspects sibling files, so a verdict can change as the
//! directory changes; the reconciler re-evaluates on every pass.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::path::Path;

fn case_insensitive(pattern: &str) -> Regex {
    RegexBuilder::new(pattern).case_insensitive(true).build().expect("Invalid ignore-filter regex")
}

/// Per-segment report sidecars: `.E01.txt`, `.LX01.adcf`, `.E01.packed_log`, ...
static SEGMENT_SIDECAR: Lazy<Regex> =
    Lazy::new(|| case_insensitive(r"\.[EL]X?\w\w\.(txt|adcf|(packed_)?log)$"));

/// Plain report and log sidecars.
const SIDECAR_SUFFIXES: [&str; 3] = [".txt", ".log", ".packed_log"];

/// Letter-coded segment suffixes: `.E02`, `.EAA`, `.FAB`, `.E123`, ...
static LETTER_SEGMENT: Lazy<Regex> =
    Lazy::new(|| case_insensitive(r"\.[EFGHIJKLMNOPQRSTUWXYZ]X?(\w\w|\d\d+)$"));

/// First letter-coded segment: `.E01`, `.L01`, `.Ex01`, `.Lx01`.
static FIRST_LETTER_SEGMENT: Lazy<Regex> = Lazy::new(|| case_insensitive(r"\.[EL]X?01$"));

/// Numbered segments: `.001`, `.002`, ...
static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| case_insensitive(r"\.\d\d\d$"));

/// VMDK extents: `-s001.vmdk`, ...
static VMDK_EXTENT: Lazy<Regex> = Lazy::new(|| case_insensitive(r"-s\w\w\w\.vmdk$"));

/// VHD differencing chain members: `-0.vhd`, `-1.vhd`, ...
static VHD_CHAIN: Lazy<Regex> = Lazy::new(|| case_insensitive(r"-(\d+)\.vhd$"));

/// Pure predicate over paths (plus sibling listings for `.img`).
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    path_contains: Option<String>,
}

impl IgnoreFilter {
    pub fn new(path_contains: Option<String>) -> Self {
        Self { path_contains: path_contains.filter(|s| !s.is_empty()) }
    }

    /// Whether `path` should be left out of the catalog.
    pub fn should_ignore(&self, path: &Path) -> bool {
        if path.is_dir() {
            return true;
        }

        let path_str = path.to_string_lossy();
        let lower = path_str.to_lowercase();

        if SEGMENT_SIDECAR.is_match(&path_str)
            || SIDECAR_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
        {
            return true;
        }

        if lower.ends_with("raw") {
            return false;
        }

        if lower.ends_with("img") {
            return has_ewf_siblings(path);
        }

        if lower.ends_with(".db") {
            return true;
        }

        if is_later_segment(&path_str, &lower) {
            return true;
        }

        if let Some(needle) = &self.path_contains {
            if !path_str.contains(needle.as_str()) {
                return true;
            }
        }

        false
    }
}

/// Multi-part segments other than the first.
fn is_later_segment(path_str: &str, lower: &str) -> bool {
    if !lower.ends_with("log")
        && LETTER_SEGMENT.is_match(path_str)
        && !FIRST_LETTER_SEGMENT.is_match(path_str)
    {
        return true;
    }

    if NUMERIC_SEGMENT.is_match(path_str) && !lower.ends_with(".001") {
        return true;
    }

    if VMDK_EXTENT.is_match(path_str) {
        return true;
    }

    VHD_CHAIN
        .captures(path_str)
        .and_then(|c| c.get(1))
        .is_some_and(|index| index.as_str() != "0")
}

/// An `.img` that ships next to both `<base>.e01` and `<base>.imf` belongs to
/// a multi-part EWF set and is skipped. `<base>` is everything before the
/// first dot of the file name.
fn has_ewf_siblings(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return false;
    };
    let base = name.split('.').next().unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let Ok(entries) = std::fs::read_dir(parent) else {
        return false;
    };
    let siblings: Vec<String> =
        entries.flatten().map(|e| e.file_name().to_string_lossy().to_lowercase()).collect();

    ["e01", "imf"].iter().all(|ext| siblings.contains(&format!("{}.{}", base, ext)))
}
