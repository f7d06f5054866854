use std::path::{Path, PathBuf};

use crate::download::sha1_of_file;
use crate::jobs::Job;
use crate::models::error::cancelled;
use crate::models::{CatalogResult, Version};
use crate::sqlite::CatalogStore;

/// One installation found by a filesystem probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DetectedEntry {
    pub package: String,
    pub version: Version,
    pub path: PathBuf,
    pub external: bool,
}

/// Scans the pre-1.15 install layout, where every installation lives in
/// a `<package>-<version>` directory.
///
/// In exact mode only names known to the catalog are accepted. In loose
/// mode unknown names become synthetic externally-installed entries.
pub(crate) fn scan_legacy_dir(
    catalog: &CatalogStore,
    root: &Path,
    exact: bool,
) -> CatalogResult<Vec<DetectedEntry>> {
    let mut found = Vec::new();

    for name in list_directories(root) {
        let Some((package, version)) = split_versioned_dir_name(&name) else {
            continue;
        };

        let known = catalog.find_package(&package)?.is_some();
        if exact && !known {
            tracing::debug!(directory = %name, "skipping unknown legacy install directory");
            continue;
        }

        found.push(DetectedEntry {
            package,
            version,
            path: root.join(&name),
            external: !known,
        });
    }

    Ok(found)
}

/// Walks the current install root one level deep, honoring the ignore
/// list, and maps `<name>-<version>` directories to catalog packages by
/// full or short name.
pub(crate) fn scan_install_root(
    catalog: &CatalogStore,
    root: &Path,
    ignored: &[String],
) -> CatalogResult<Vec<DetectedEntry>> {
    let mut found = Vec::new();

    for name in list_directories(root) {
        if ignored.iter().any(|i| i.eq_ignore_ascii_case(&name)) {
            continue;
        }
        let Some((base, version)) = split_versioned_dir_name(&name) else {
            continue;
        };

        let package = if catalog.find_package(&base)?.is_some() {
            Some(base)
        } else {
            catalog
                .find_packages_by_short_name(&base)?
                .into_iter()
                .next()
                .map(|p| p.name)
        };
        let Some(package) = package else {
            continue;
        };

        found.push(DetectedEntry {
            package,
            version,
            path: root.join(&name),
            external: false,
        });
    }

    Ok(found)
}

/// Tests the detect-file declarations of every version that has any: a
/// version is detected when all of its described files exist under the
/// probe root and every declared SHA-1 matches.
pub(crate) fn detect_by_files(
    catalog: &CatalogStore,
    probe_root: &Path,
    job: &Job,
) -> CatalogResult<Vec<DetectedEntry>> {
    let versions = catalog.get_package_versions_with_detect_files()?;
    let total = versions.len();
    let mut found = Vec::new();

    for (i, pv) in versions.into_iter().enumerate() {
        if !job.should_proceed() {
            return Err(cancelled());
        }

        if !pv.detect_files.is_empty()
            && pv
                .detect_files
                .iter()
                .all(|df| detect_file_matches(probe_root, &df.path, df.sha1.as_deref()))
        {
            found.push(DetectedEntry {
                package: pv.package.clone(),
                version: pv.version.clone(),
                path: probe_root.to_path_buf(),
                external: true,
            });
        }

        if total > 0 {
            job.set_progress((i + 1) as f64 / total as f64);
        }
    }

    Ok(found)
}

fn detect_file_matches(probe_root: &Path, relative: &str, sha1: Option<&str>) -> bool {
    let path = probe_root.join(relative.replace('\\', "/"));
    if !path.is_file() {
        return false;
    }
    let Some(expected) = sha1 else {
        return true;
    };
    match sha1_of_file(&path) {
        Ok(actual) => actual.eq_ignore_ascii_case(expected),
        Err(error) => {
            tracing::debug!(path = %path.display(), %error, "cannot hash detect file");
            false
        }
    }
}

/// `com.example.Foo-1.2.3` -> (`com.example.Foo`, `1.2.3`). The version
/// is taken from the last dash whose suffix parses as one.
fn split_versioned_dir_name(name: &str) -> Option<(String, Version)> {
    let mut search_end = name.len();
    while let Some(dash) = name[..search_end].rfind('-') {
        if let Some(version) = Version::parse(&name[dash + 1..]) {
            if dash > 0 {
                return Some((name[..dash].to_string(), version));
            }
        }
        search_end = dash;
    }
    None
}

fn list_directories(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
    }
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_dir_names_split_on_the_version_dash() {
        let (package, version) = split_versioned_dir_name("com.example.Foo-1.2.3").unwrap();
        assert_eq!(package, "com.example.Foo");
        assert_eq!(version.to_string(), "1.2.3");
    }

    #[test]
    fn dashes_inside_the_package_name_are_kept() {
        let (package, version) = split_versioned_dir_name("com.example.foo-bar-2.0").unwrap();
        assert_eq!(package, "com.example.foo-bar");
        assert_eq!(version.to_string(), "2");
    }

    #[test]
    fn names_without_a_version_suffix_are_rejected() {
        assert!(split_versioned_dir_name("NoVersionHere").is_none());
        assert!(split_versioned_dir_name("-1.0").is_none());
        assert!(split_versioned_dir_name("foo-bar").is_none());
    }
}
