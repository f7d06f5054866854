pub mod category;
pub mod error;
pub mod installed;
pub mod license;
pub mod package;
pub mod package_version;
pub mod version;

pub use category::{Category, CategoryCount, CategoryFilter};
pub use error::{CatalogError, CatalogErrorKind, CatalogResult};
pub use installed::InstalledPackageVersion;
pub use license::License;
pub use package::{Links, Package, PackageStatus};
pub use package_version::{DetectFile, PackageVersion};
pub use version::Version;
