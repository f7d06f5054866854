pub(crate) mod scan;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::jobs::Job;
use crate::models::error::cancelled;
use crate::models::{CatalogResult, InstalledPackageVersion, Version};
use crate::sqlite::CatalogStore;

/// MSI product as reported by the host installer database.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MsiProduct {
    pub guid: String,
    pub install_path: Option<PathBuf>,
}

/// A runtime component found through well-known registry keys (.NET,
/// JRE, JDK, MSXML, the Windows installer itself), already mapped to its
/// fixed package name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WellKnownComponent {
    pub package: String,
    pub version: Version,
    pub install_path: Option<PathBuf>,
}

/// Host-specific probes the oracle consumes. The registry and MSI
/// queries behind this trait are platform collaborators; tests inject
/// doubles.
pub trait SystemProbe: Send + Sync {
    fn msi_products(&self) -> CatalogResult<Vec<MsiProduct>>;

    fn well_known_components(&self) -> CatalogResult<Vec<WellKnownComponent>>;
}

/// A probe reporting nothing; for hosts without an installer database.
pub struct NoSystemProbe;

impl SystemProbe for NoSystemProbe {
    fn msi_products(&self) -> CatalogResult<Vec<MsiProduct>> {
        Ok(Vec::new())
    }

    fn well_known_components(&self) -> CatalogResult<Vec<WellKnownComponent>> {
        Ok(Vec::new())
    }
}

/// Determines which catalog packages exist on the host and in which
/// versions. The catalog consumes only [`enumerate_installed`] during
/// status computation.
///
/// [`enumerate_installed`]: InstallationOracle::enumerate_installed
pub trait InstallationOracle: Send + Sync {
    /// Re-runs all probes against the given catalog.
    fn refresh(&self, catalog: &CatalogStore, job: &Job) -> CatalogResult<()>;

    fn enumerate_installed(&self) -> CatalogResult<Vec<InstalledPackageVersion>>;

    /// Records one detected installation; later marks of the same
    /// `(package, version)` replace earlier ones.
    fn mark_version(&self, package: &str, version: Version, install_path: &Path, external: bool);
}

/// Filesystem roots the scans operate on.
#[derive(Clone, Debug, Default)]
pub struct ScanLayout {
    /// Current install root, traversed one level deep.
    pub install_root: Option<PathBuf>,
    /// Pre-1.15 install layout, if it still exists.
    pub legacy_root: Option<PathBuf>,
    /// Accept unknown names in the legacy scan, creating synthetic
    /// externally-installed entries.
    pub loose_legacy_scan: bool,
    /// Root the detect-file probes resolve relative paths against.
    pub probe_root: Option<PathBuf>,
    /// Directory names the install-root traversal skips.
    pub ignored: Vec<String>,
}

/// The default oracle: a union of the MSI probe, the well-known
/// component probe, the legacy and current install-directory scans, and
/// the detect-file heuristics.
pub struct HostInventory {
    probe: Box<dyn SystemProbe>,
    layout: ScanLayout,
    entries: Mutex<Vec<InstalledPackageVersion>>,
}

impl HostInventory {
    pub fn new(probe: Box<dyn SystemProbe>, layout: ScanLayout) -> Self {
        Self {
            probe,
            layout,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn mark_detected(&self, detected: Vec<scan::DetectedEntry>) {
        for entry in detected {
            self.mark_version(&entry.package, entry.version, &entry.path, entry.external);
        }
    }
}

impl InstallationOracle for HostInventory {
    fn refresh(&self, catalog: &CatalogStore, job: &Job) -> CatalogResult<()> {
        self.entries.lock().unwrap().clear();

        if job.should_proceed() {
            let sub = job.new_sub_job(0.2, "Detecting MSI products");
            for product in self.probe.msi_products()? {
                if let Some(pv) = catalog.find_package_version_by_msi_guid(&product.guid)? {
                    let path = product.install_path.clone().unwrap_or_default();
                    self.mark_version(&pv.package, pv.version, &path, true);
                }
            }
            sub.complete();
        }

        if job.should_proceed() {
            let sub = job.new_sub_job(0.1, "Detecting well-known components");
            for component in self.probe.well_known_components()? {
                let path = component.install_path.clone().unwrap_or_default();
                self.mark_version(&component.package, component.version, &path, true);
            }
            sub.complete();
        }

        if job.should_proceed() {
            if let Some(legacy_root) = &self.layout.legacy_root {
                let sub = job.new_sub_job(0.2, "Scanning the legacy install directory");
                let exact = !self.layout.loose_legacy_scan;
                self.mark_detected(scan::scan_legacy_dir(catalog, legacy_root, exact)?);
                sub.complete();
            }
        }

        if job.should_proceed() {
            if let Some(install_root) = &self.layout.install_root {
                let sub = job.new_sub_job(0.2, "Scanning the install directory");
                self.mark_detected(scan::scan_install_root(
                    catalog,
                    install_root,
                    &self.layout.ignored,
                )?);
                sub.complete();
            }
        }

        if job.should_proceed() {
            if let Some(probe_root) = &self.layout.probe_root {
                let sub = job.new_sub_job(0.3, "Testing detect files");
                self.mark_detected(scan::detect_by_files(catalog, probe_root, &sub)?);
                sub.complete();
            }
        }

        if !job.should_proceed() {
            return Err(cancelled());
        }

        job.set_progress(1.0);
        job.complete();
        Ok(())
    }

    fn enumerate_installed(&self) -> CatalogResult<Vec<InstalledPackageVersion>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    fn mark_version(&self, package: &str, version: Version, install_path: &Path, external: bool) {
        let mut entries = self.entries.lock().unwrap();
        let entry = InstalledPackageVersion {
            package: package.to_string(),
            version,
            install_path: install_path.to_path_buf(),
            external,
        };
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.package == entry.package && e.version == entry.version)
        {
            *existing = entry;
        } else {
            entries.push(entry);
        }
    }
}
