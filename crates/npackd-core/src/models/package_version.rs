use serde::{Deserialize, Serialize};

use crate::models::version::Version;

/// A filesystem probe declared by a package version to assert that the
/// package is installed: a relative path and an optional SHA-1 of the file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DetectFile {
    pub path: String,
    pub sha1: Option<String>,
}

/// A specific release of a package.
///
/// The catalog persists the raw repository XML fragment describing a
/// version and re-parses it on demand; this struct is the parsed view.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackageVersion {
    pub package: String,
    pub version: Version,
    pub download_url: Option<String>,
    /// Microsoft Installer product code; globally unique when present.
    pub msi_guid: Option<String>,
    pub detect_files: Vec<DetectFile>,
}

impl PackageVersion {
    pub fn new(package: impl Into<String>, version: Version) -> Self {
        Self {
            package: package.into(),
            version: version.normalized(),
            download_url: None,
            msi_guid: None,
            detect_files: Vec::new(),
        }
    }

    /// A version without a download URL exists in the catalog but cannot
    /// be installed from it.
    pub fn installable(&self) -> bool {
        self.download_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}
