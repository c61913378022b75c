// SPDX-License-Identifier: MIT

use anyhow::{bail, Result};

/// Strip leading slashes and lowercase the whole path. Normalization happens
/// before validation so `/Claude/Web` and `claude/web` address one inbox.
pub fn normalize(path: &str) -> String {
    path.trim().trim_start_matches('/').to_ascii_lowercase()
}

/// Validate a normalized inbox path.
///
/// Paths are 1–3 `/`-separated non-empty segments. A single segment is only
/// accepted when the carrying message has project metadata; otherwise the
/// first segment is the platform and at least one narrowing segment is
/// required.
pub fn validate(path: &str, has_project_metadata: bool) -> Result<()> {
    if path.is_empty() {
        bail!("INVALID:inbox path is empty");
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        bail!("INVALID:inbox path '{path}' contains an empty segment");
    }
    if segments.len() > 3 {
        bail!(
            "INVALID:inbox path '{path}' has {} segments (max 3)",
            segments.len()
        );
    }
    if segments.len() == 1 && !has_project_metadata {
        bail!(
            "INVALID:single-segment inbox path '{path}' requires project metadata"
        );
    }
    Ok(())
}

/// The root platform segment of a path or agent identifier.
pub fn root(path: &str) -> &str {
    path.split('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_slashes_and_lowercases() {
        assert_eq!(normalize("/Claude/Web"), "claude/web");
        assert_eq!(normalize("//replit/main"), "replit/main");
        assert_eq!(normalize("  gpt/chat "), "gpt/chat");
    }

    #[test]
    fn two_and_three_segments_always_valid() {
        assert!(validate("replit/main", false).is_ok());
        assert!(validate("replit/main/deploys", true).is_ok());
    }

    #[test]
    fn single_segment_requires_project_metadata() {
        assert!(validate("claude", false).is_err());
        assert!(validate("claude", true).is_ok());
    }

    #[test]
    fn rejects_empty_segments_and_overlong_paths() {
        assert!(validate("", true).is_err());
        assert!(validate("claude//web", true).is_err());
        assert!(validate("a/b/c/d", true).is_err());
    }

    #[test]
    fn root_extracts_platform() {
        assert_eq!(root("claude/web"), "claude");
        assert_eq!(root("replit"), "replit");
    }
}
