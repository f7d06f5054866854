use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::version::Version;

/// A package version detected on the host, as reported by the
/// installation oracle.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackageVersion {
    pub package: String,
    pub version: Version,
    pub install_path: PathBuf,
    /// True when the software was installed by something other than the
    /// package manager itself.
    pub external: bool,
}
