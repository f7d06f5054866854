pub mod in_memory;

pub use in_memory::InMemoryRepository;

use crate::models::{CatalogResult, License, Package, PackageVersion, Version};

/// The capability set shared by every source of catalog data: the
/// SQL-backed catalog store and the in-memory repository filled during
/// parsing.
///
/// Implementations are used under the single-writer discipline of the
/// catalog; they are not required to be shareable across threads.
pub trait PackageRepository {
    fn find_package(&self, name: &str) -> CatalogResult<Option<Package>>;

    fn find_package_version(
        &self,
        package: &str,
        version: &Version,
    ) -> CatalogResult<Option<PackageVersion>>;

    fn find_package_version_by_msi_guid(
        &self,
        guid: &str,
    ) -> CatalogResult<Option<PackageVersion>>;

    fn find_license(&self, name: &str) -> CatalogResult<Option<License>>;

    /// All versions of a package, newest first.
    fn package_versions(&self, package: &str) -> CatalogResult<Vec<PackageVersion>>;
}
