//! Path normalization and glob listing

use std::path::{Component, Path, PathBuf};

use crate::error::{EtdError, Result};

/// Lexically normalize a path: make it absolute against the current
/// directory and resolve `.`/`..` components without touching the
/// filesystem. Registry conflict detection compares these.
pub fn normalize_path(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| EtdError::io("current dir", e))?
            .join(p)
    };
    let mut out = PathBuf::new();
    for component in abs.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Expand a leading `~/` (or bare `~`) using the platform's home directory.
/// Fails when expansion is requested but the platform cannot honour it.
fn expand_tilde(pattern: &str) -> Result<String> {
    if !pattern.starts_with('~') {
        return Ok(pattern.to_string());
    }
    let home = std::env::var_os("HOME").ok_or_else(|| {
        EtdError::InvalidArgument(
            "the target O/S does not support the requested tilde expansion".to_string(),
        )
    })?;
    let home = home.to_string_lossy();
    match pattern.strip_prefix("~/") {
        Some(rest) => Ok(format!("{home}/{rest}")),
        None if pattern == "~" => Ok(home.into_owned()),
        // ~user expansion is not offered
        None => Err(EtdError::InvalidArgument(
            "the target O/S does not support the requested tilde expansion".to_string(),
        )),
    }
}

/// Glob-expand `path` for `listPath`. A trailing `/` means "contents of",
/// so `*` is appended before expansion. Directory entries come back with a
/// trailing `/` marker; no match yields an empty list.
pub fn list_path(path: &str, allow_tilde: bool) -> Result<Vec<String>> {
    if path.is_empty() {
        return Err(EtdError::InvalidArgument(
            "listing an empty path is not allowed".to_string(),
        ));
    }
    let mut pattern = if allow_tilde {
        expand_tilde(path)?
    } else {
        path.to_string()
    };
    if pattern.ends_with('/') {
        pattern.push('*');
    }
    let paths = glob::glob(&pattern)
        .map_err(|e| EtdError::InvalidArgument(format!("bad glob pattern '{path}': {e}")))?;
    let mut entries = Vec::new();
    for entry in paths {
        // unreadable entries are skipped, as glob(3) would
        let Ok(p) = entry else { continue };
        let mut s = p.display().to_string();
        if p.is_dir() && !s.ends_with('/') {
            s.push('/');
        }
        entries.push(s);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_resolves_dots() {
        let n = normalize_path("/a/b/../c/./d").unwrap();
        assert_eq!(n, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn normalize_anchors_relative_paths() {
        let n = normalize_path("x/y").unwrap();
        assert!(n.is_absolute());
        assert!(n.ends_with("x/y"));
    }

    #[test]
    fn empty_path_is_invalid() {
        assert!(matches!(
            list_path("", true),
            Err(EtdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn trailing_slash_lists_contents_and_marks_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("file.txt"), b"x").unwrap();

        let pattern = format!("{}/", tmp.path().display());
        let mut entries = list_path(&pattern, false).unwrap();
        entries.sort();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("file.txt"));
        assert!(entries[1].ends_with("sub/"));
    }

    #[test]
    fn no_match_is_an_empty_list() {
        let tmp = tempfile::tempdir().unwrap();
        let pattern = format!("{}/nothing-here-*", tmp.path().display());
        assert!(list_path(&pattern, false).unwrap().is_empty());
    }
}
