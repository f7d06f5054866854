use std::collections::HashMap;
use std::sync::Mutex;

use crate::ingest::RecordSink;
use crate::models::{CatalogResult, License, Package, PackageVersion, Version};
use crate::repository::PackageRepository;

/// A repository held entirely in memory. Used while parsing a repository
/// document before its records are staged, and as a lightweight catalog
/// in tests.
#[derive(Default)]
pub struct InMemoryRepository {
    inner: Mutex<Content>,
}

#[derive(Default)]
struct Content {
    packages: HashMap<String, Package>,
    /// Parsed versions plus the verbatim XML fragment they came from.
    versions: Vec<(PackageVersion, Vec<u8>)>,
    licenses: HashMap<String, License>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn package_count(&self) -> usize {
        self.inner.lock().unwrap().packages.len()
    }

    pub fn version_count(&self) -> usize {
        self.inner.lock().unwrap().versions.len()
    }

    pub fn license_count(&self) -> usize {
        self.inner.lock().unwrap().licenses.len()
    }

    /// Drains the collected records: packages and licenses sorted by
    /// name, versions with their fragments in ingestion order.
    pub fn into_records(self) -> (Vec<Package>, Vec<(PackageVersion, Vec<u8>)>, Vec<License>) {
        let content = self.inner.into_inner().unwrap();
        let mut packages: Vec<Package> = content.packages.into_values().collect();
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        let mut licenses: Vec<License> = content.licenses.into_values().collect();
        licenses.sort_by(|a, b| a.name.cmp(&b.name));
        (packages, content.versions, licenses)
    }
}

impl RecordSink for InMemoryRepository {
    fn package(&mut self, package: Package) -> CatalogResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.packages.entry(package.name.clone()).or_insert(package);
        Ok(())
    }

    fn package_version(&mut self, version: PackageVersion, fragment: &[u8]) -> CatalogResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let exists = inner
            .versions
            .iter()
            .any(|(pv, _)| pv.package == version.package && pv.version == version.version);
        if !exists {
            inner.versions.push((version, fragment.to_vec()));
        }
        Ok(())
    }

    fn license(&mut self, license: License) -> CatalogResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.licenses.entry(license.name.clone()).or_insert(license);
        Ok(())
    }
}

impl PackageRepository for InMemoryRepository {
    fn find_package(&self, name: &str) -> CatalogResult<Option<Package>> {
        Ok(self.inner.lock().unwrap().packages.get(name).cloned())
    }

    fn find_package_version(
        &self,
        package: &str,
        version: &Version,
    ) -> CatalogResult<Option<PackageVersion>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .versions
            .iter()
            .find(|(pv, _)| pv.package == package && pv.version == *version)
            .map(|(pv, _)| pv.clone()))
    }

    fn find_package_version_by_msi_guid(
        &self,
        guid: &str,
    ) -> CatalogResult<Option<PackageVersion>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .versions
            .iter()
            .find(|(pv, _)| pv.msi_guid.as_deref() == Some(guid))
            .map(|(pv, _)| pv.clone()))
    }

    fn find_license(&self, name: &str) -> CatalogResult<Option<License>> {
        Ok(self.inner.lock().unwrap().licenses.get(name).cloned())
    }

    fn package_versions(&self, package: &str) -> CatalogResult<Vec<PackageVersion>> {
        let inner = self.inner.lock().unwrap();
        let mut versions: Vec<PackageVersion> = inner
            .versions
            .iter()
            .filter(|(pv, _)| pv.package == package)
            .map(|(pv, _)| pv.clone())
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }
}
