use std::path::Path;
use std::sync::Arc;

use base64::Engine;

use npackd_core::config::RepositoryConfig;
use npackd_core::download::Downloader;
use npackd_core::jobs::Job;
use npackd_core::models::{
    CatalogErrorKind, CatalogResult, InstalledPackageVersion, Package, PackageStatus, Version,
};
use npackd_core::oracle::InstallationOracle;
use npackd_core::refresh::refresh;
use npackd_core::sqlite::CatalogStore;

/// Oracle double reporting a fixed installed set.
struct StaticOracle {
    entries: Vec<InstalledPackageVersion>,
}

impl InstallationOracle for StaticOracle {
    fn refresh(&self, _catalog: &CatalogStore, job: &Job) -> CatalogResult<()> {
        job.complete();
        Ok(())
    }

    fn enumerate_installed(&self) -> CatalogResult<Vec<InstalledPackageVersion>> {
        Ok(self.entries.clone())
    }

    fn mark_version(&self, _package: &str, _version: Version, _path: &Path, _external: bool) {}
}

fn repository_document(title: &str, versions: &[&str]) -> String {
    let mut doc = String::from("<root>\n");
    doc.push_str(&format!(
        "<package name=\"com.example.App\"><title>{title}</title></package>\n"
    ));
    for version in versions {
        doc.push_str(&format!(
            "<version name=\"{version}\" package=\"com.example.App\">\
             <url>https://example.com/app-{version}.zip</url></version>\n"
        ));
    }
    doc.push_str("</root>\n");
    doc
}

fn as_data_url(document: &str) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(document.as_bytes())
    )
}

fn installed(package: &str, version: &str) -> InstalledPackageVersion {
    InstalledPackageVersion {
        package: package.to_string(),
        version: Version::parse(version).unwrap(),
        install_path: std::path::PathBuf::from("/opt/app"),
        external: false,
    }
}

#[tokio::test]
async fn refresh_builds_the_live_catalog_from_repositories() {
    let dir = tempfile::tempdir().unwrap();
    let live_path = dir.path().join("Data.db");

    let config = RepositoryConfig::new(vec![as_data_url(&repository_document(
        "App",
        &["1.0", "2.0"],
    ))])
    .unwrap();
    let oracle = Arc::new(StaticOracle {
        entries: vec![installed("com.example.App", "1.0")],
    });

    let job = Job::new("refresh");
    refresh(
        &job,
        &live_path,
        &config,
        oracle,
        &Downloader::new().unwrap(),
        false,
    )
    .await
    .unwrap();
    assert!(job.is_completed());
    assert_eq!(job.error_message(), None);

    let live = CatalogStore::open(&live_path, true).unwrap();
    let package = live.find_package("com.example.App").unwrap().unwrap();
    assert_eq!(package.title, "App");
    assert_eq!(package.status, PackageStatus::Updateable);
    assert_eq!(live.get_package_versions("com.example.App").unwrap().len(), 2);
    assert_eq!(live.read_repositories().unwrap().len(), 1);

    // The downloaded document's hash was recorded for the repository.
    let url = &config.urls()[0];
    assert!(live.repository_sha1(url).unwrap().is_some());
    drop(live);

    // A second refresh over the same catalog is a full rebuild, not an
    // accumulation.
    let oracle = Arc::new(StaticOracle { entries: vec![] });
    refresh(
        &Job::new("refresh"),
        &live_path,
        &config,
        oracle,
        &Downloader::new().unwrap(),
        false,
    )
    .await
    .unwrap();

    let live = CatalogStore::open(&live_path, true).unwrap();
    assert_eq!(live.get_package_versions("com.example.App").unwrap().len(), 2);
    assert_eq!(live.read_repositories().unwrap().len(), 1);
    assert_eq!(
        live.find_package("com.example.App").unwrap().unwrap().status,
        PackageStatus::NotInstalled
    );
}

#[tokio::test]
async fn the_first_declaring_repository_wins() {
    let dir = tempfile::tempdir().unwrap();
    let live_path = dir.path().join("Data.db");

    let config = RepositoryConfig::new(vec![
        as_data_url(&repository_document("From R0", &["1.0"])),
        as_data_url(&repository_document("From R1", &["1.0", "2.0"])),
    ])
    .unwrap();
    let oracle = Arc::new(StaticOracle { entries: vec![] });

    refresh(
        &Job::new("refresh"),
        &live_path,
        &config,
        oracle,
        &Downloader::new().unwrap(),
        false,
    )
    .await
    .unwrap();

    let live = CatalogStore::open(&live_path, true).unwrap();
    let package = live.find_package("com.example.App").unwrap().unwrap();
    assert_eq!(package.title, "From R0");

    // Non-conflicting rows from the second repository still land.
    assert_eq!(live.get_package_versions("com.example.App").unwrap().len(), 2);
}

#[tokio::test]
async fn an_empty_repository_list_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let live_path = dir.path().join("Data.db");

    let job = Job::new("refresh");
    let error = refresh(
        &job,
        &live_path,
        &RepositoryConfig::default(),
        Arc::new(StaticOracle { entries: vec![] }),
        &Downloader::new().unwrap(),
        false,
    )
    .await
    .unwrap_err();

    assert_eq!(error.kind, CatalogErrorKind::Config);
    assert!(job.error_message().unwrap().contains("No repositories"));
}

#[tokio::test]
async fn a_failed_refresh_leaves_the_previous_catalog_intact() {
    let dir = tempfile::tempdir().unwrap();
    let live_path = dir.path().join("Data.db");

    // Seed the live catalog through one successful refresh.
    let good = RepositoryConfig::new(vec![as_data_url(&repository_document("App", &["1.0"]))])
        .unwrap();
    refresh(
        &Job::new("refresh"),
        &live_path,
        &good,
        Arc::new(StaticOracle { entries: vec![] }),
        &Downloader::new().unwrap(),
        false,
    )
    .await
    .unwrap();

    // A repository that fails to download must not touch the live data.
    let bad = RepositoryConfig::new(vec![
        "data:image/png;base64,@@broken@@".to_string(),
    ])
    .unwrap();
    let job = Job::new("refresh");
    let error = refresh(
        &job,
        &live_path,
        &bad,
        Arc::new(StaticOracle { entries: vec![] }),
        &Downloader::new().unwrap(),
        false,
    )
    .await
    .unwrap_err();
    assert_eq!(error.kind, CatalogErrorKind::Transport);

    let live = CatalogStore::open(&live_path, true).unwrap();
    let package = live.find_package("com.example.App").unwrap().unwrap();
    assert_eq!(package.title, "App");
}

#[tokio::test]
async fn a_parse_failure_reports_the_repository_url() {
    let dir = tempfile::tempdir().unwrap();
    let live_path = dir.path().join("Data.db");

    let url = as_data_url("<root><package name=\"x\"><title>t</wrong></package></root>");
    let config = RepositoryConfig::new(vec![url.clone()]).unwrap();

    let job = Job::new("refresh");
    let error = refresh(
        &job,
        &live_path,
        &config,
        Arc::new(StaticOracle { entries: vec![] }),
        &Downloader::new().unwrap(),
        false,
    )
    .await
    .unwrap_err();

    assert_eq!(error.kind, CatalogErrorKind::CorruptCatalog);
    assert_eq!(error.url.as_deref(), Some(url.as_str()));
}

#[test]
fn transfer_failure_rolls_back_to_the_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let live_path = dir.path().join("Data.db");

    let mut live = CatalogStore::open(&live_path, false).unwrap();
    live.upsert_package(&Package::new("com.example.Kept", "Kept"), true)
        .unwrap();

    // The staging file exists but holds no catalog tables, so the copy
    // fails after the live tables were already cleared inside the
    // transaction. The rollback must restore the previous snapshot.
    let staging = dir.path().join("staging.db");
    std::fs::write(&staging, b"").unwrap();

    let job = Job::new("transfer");
    let error = live.transfer_from(&job, &staging).unwrap_err();
    assert_eq!(error.kind, CatalogErrorKind::Schema);
    assert!(job.error_message().is_some());

    drop(live);
    let live = CatalogStore::open(&live_path, true).unwrap();
    assert!(live.find_package("com.example.Kept").unwrap().is_some());
}
