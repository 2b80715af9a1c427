//! Module path resolution
//!
//! Import names resolve in two ways:
//! - `./x` and `../x` are relative to the importing module's directory
//! - anything else is tried against the configured search directories in
//!   order (an absolute path is used as-is)
//!
//! The source extension is appended when the name has none.

use std::path::{Path, PathBuf};

/// Resolve an import name to an existing file, or None when nothing matched.
pub fn resolve_module_path(
    name: &str,
    importer_dir: Option<&Path>,
    search_paths: &[PathBuf],
    extension: &str,
) -> Option<PathBuf> {
    let file_name = with_extension(name, extension);

    if name.starts_with("./") || name.starts_with("../") {
        let base = importer_dir.unwrap_or(Path::new("."));
        let candidate = base.join(&file_name);
        return candidate.is_file().then_some(candidate);
    }

    let as_path = Path::new(&file_name);
    if as_path.is_absolute() {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }

    for dir in search_paths {
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn with_extension(name: &str, extension: &str) -> String {
    if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{}.{}", name, extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("aegis-path-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_relative_resolution() {
        let dir = scratch_dir("rel");
        fs::write(dir.join("util.aeg"), "").unwrap();

        let resolved = resolve_module_path("./util", Some(&dir), &[], "aeg");
        assert_eq!(resolved, Some(dir.join("util.aeg")));

        assert_eq!(resolve_module_path("./missing", Some(&dir), &[], "aeg"), None);
    }

    #[test]
    fn test_search_path_order() {
        let first = scratch_dir("first");
        let second = scratch_dir("second");
        fs::write(second.join("probe.aeg"), "").unwrap();

        let paths = vec![first.clone(), second.clone()];
        let resolved = resolve_module_path("probe", None, &paths, "aeg");
        assert_eq!(resolved, Some(second.join("probe.aeg")));

        // A hit in an earlier directory wins.
        fs::write(first.join("probe.aeg"), "").unwrap();
        let resolved = resolve_module_path("probe", None, &paths, "aeg");
        assert_eq!(resolved, Some(first.join("probe.aeg")));
    }

    #[test]
    fn test_extension_kept_when_present() {
        let dir = scratch_dir("ext");
        fs::write(dir.join("raw.aeg"), "").unwrap();

        let resolved = resolve_module_path("./raw.aeg", Some(&dir), &[], "aeg");
        assert_eq!(resolved, Some(dir.join("raw.aeg")));
    }
}
