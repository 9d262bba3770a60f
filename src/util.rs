use std::path::{Component, Path, PathBuf};

use crate::error::ProtocolError;

/// Human-readable byte count for the push summary, in powers of 1024.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Map a wire path onto the receiving root. Anything that could climb out of
/// the root is refused.
pub fn resolve_under_root(root: &Path, relative: &str) -> Result<PathBuf, ProtocolError> {
    let mut safe = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => safe.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ProtocolError::UnsafePath(relative.to_string()));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(ProtocolError::UnsafePath(relative.to_string()));
    }
    Ok(root.join(safe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(10), "10 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.00 GB");
        // nothing above GB
        assert_eq!(format_size(2048 * 1024 * 1024 * 1024), "2048.00 GB");
    }

    #[test]
    fn test_resolve_under_root() {
        let root = Path::new("/srv/sync");
        assert_eq!(
            resolve_under_root(root, "tree/a.txt").unwrap(),
            root.join("tree/a.txt")
        );
        assert_eq!(
            resolve_under_root(root, "./tree//b").unwrap(),
            root.join("tree/b")
        );
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/srv/sync");
        for bad in ["../etc/passwd", "tree/../../x", "/etc/passwd", "", "."] {
            assert!(
                matches!(resolve_under_root(root, bad), Err(ProtocolError::UnsafePath(_))),
                "{bad:?} should be refused"
            );
        }
    }
}
