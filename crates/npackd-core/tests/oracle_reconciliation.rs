use std::path::PathBuf;

use npackd_core::jobs::Job;
use npackd_core::models::{CatalogResult, Package, PackageVersion, Version};
use npackd_core::oracle::{
    HostInventory, InstallationOracle, MsiProduct, NoSystemProbe, ScanLayout, SystemProbe,
    WellKnownComponent,
};
use npackd_core::sqlite::CatalogStore;

struct FixedProbe {
    msi: Vec<MsiProduct>,
    components: Vec<WellKnownComponent>,
}

impl SystemProbe for FixedProbe {
    fn msi_products(&self) -> CatalogResult<Vec<MsiProduct>> {
        Ok(self.msi.clone())
    }

    fn well_known_components(&self) -> CatalogResult<Vec<WellKnownComponent>> {
        Ok(self.components.clone())
    }
}

fn open_store(dir: &tempfile::TempDir) -> CatalogStore {
    CatalogStore::open(&dir.path().join("Data.db"), false).unwrap()
}

fn add_version(store: &CatalogStore, package: &str, version: &str, extra: &str) {
    store
        .upsert_package(&Package::new(package, package), true)
        .unwrap();
    let fragment = format!(
        "<version name=\"{version}\" package=\"{package}\">\
         <url>https://example.com/x.zip</url>{extra}</version>"
    );
    let mut pv = PackageVersion::new(package, Version::parse(version).unwrap());
    pv.download_url = Some("https://example.com/x.zip".to_string());
    store
        .upsert_package_version(&pv, fragment.as_bytes(), true)
        .unwrap();
}

#[test]
fn msi_products_are_matched_through_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    store
        .upsert_package(&Package::new("com.example.Msi", "Msi"), true)
        .unwrap();
    let fragment = "<version name=\"1.0\" package=\"com.example.Msi\">\
                    <url>https://example.com/m.zip</url>\
                    <msi-guid>{aaaabbbb-cccc-dddd-eeee-ffff00001111}</msi-guid>\
                    </version>";
    let mut pv = PackageVersion::new("com.example.Msi", Version::parse("1.0").unwrap());
    pv.msi_guid = Some("{aaaabbbb-cccc-dddd-eeee-ffff00001111}".to_string());
    store
        .upsert_package_version(&pv, fragment.as_bytes(), true)
        .unwrap();

    let oracle = HostInventory::new(
        Box::new(FixedProbe {
            msi: vec![
                MsiProduct {
                    guid: "{AAAABBBB-CCCC-DDDD-EEEE-FFFF00001111}".to_string(),
                    install_path: Some(PathBuf::from("/opt/msi")),
                },
                // Unknown product codes are ignored.
                MsiProduct {
                    guid: "{00000000-0000-0000-0000-000000000000}".to_string(),
                    install_path: None,
                },
            ],
            components: vec![],
        }),
        ScanLayout::default(),
    );

    oracle.refresh(&store, &Job::new("recognize")).unwrap();

    let installed = oracle.enumerate_installed().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].package, "com.example.Msi");
    assert_eq!(installed[0].version.to_string(), "1");
    assert!(installed[0].external);
}

#[test]
fn well_known_components_are_reported_as_external() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let oracle = HostInventory::new(
        Box::new(FixedProbe {
            msi: vec![],
            components: vec![WellKnownComponent {
                package: "com.oracle.JRE".to_string(),
                version: Version::parse("1.8.0.121").unwrap(),
                install_path: None,
            }],
        }),
        ScanLayout::default(),
    );

    oracle.refresh(&store, &Job::new("recognize")).unwrap();

    let installed = oracle.enumerate_installed().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].package, "com.oracle.JRE");
    assert!(installed[0].external);
}

#[test]
fn exact_legacy_scan_accepts_only_catalog_packages() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    add_version(&store, "com.example.Known", "1.0", "");

    let legacy = tempfile::tempdir().unwrap();
    std::fs::create_dir(legacy.path().join("com.example.Known-1.0")).unwrap();
    std::fs::create_dir(legacy.path().join("com.example.Unknown-2.0")).unwrap();
    std::fs::create_dir(legacy.path().join("NotAVersionedDir")).unwrap();

    let oracle = HostInventory::new(
        Box::new(NoSystemProbe),
        ScanLayout {
            legacy_root: Some(legacy.path().to_path_buf()),
            ..ScanLayout::default()
        },
    );
    oracle.refresh(&store, &Job::new("recognize")).unwrap();

    let installed = oracle.enumerate_installed().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].package, "com.example.Known");
    assert!(!installed[0].external);
}

#[test]
fn loose_legacy_scan_creates_synthetic_entries_for_unknown_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    add_version(&store, "com.example.Known", "1.0", "");

    let legacy = tempfile::tempdir().unwrap();
    std::fs::create_dir(legacy.path().join("com.example.Known-1.0")).unwrap();
    std::fs::create_dir(legacy.path().join("com.example.Unknown-2.0")).unwrap();

    let oracle = HostInventory::new(
        Box::new(NoSystemProbe),
        ScanLayout {
            legacy_root: Some(legacy.path().to_path_buf()),
            loose_legacy_scan: true,
            ..ScanLayout::default()
        },
    );
    oracle.refresh(&store, &Job::new("recognize")).unwrap();

    let mut installed = oracle.enumerate_installed().unwrap();
    installed.sort_by(|a, b| a.package.cmp(&b.package));
    assert_eq!(installed.len(), 2);
    assert!(!installed[0].external);
    assert_eq!(installed[1].package, "com.example.Unknown");
    assert!(installed[1].external);
}

#[test]
fn install_root_traversal_honors_the_ignore_list_and_short_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    add_version(&store, "com.example.Tool", "2.5", "");

    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("Tool-2.5")).unwrap();
    std::fs::create_dir(root.path().join("Ignored-9.9")).unwrap();

    let oracle = HostInventory::new(
        Box::new(NoSystemProbe),
        ScanLayout {
            install_root: Some(root.path().to_path_buf()),
            ignored: vec!["ignored-9.9".to_string()],
            ..ScanLayout::default()
        },
    );
    oracle.refresh(&store, &Job::new("recognize")).unwrap();

    let installed = oracle.enumerate_installed().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].package, "com.example.Tool");
    assert_eq!(installed[0].version.to_string(), "2.5");
}

#[test]
fn detect_files_require_existence_and_matching_hash() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    // SHA-1("abc")
    add_version(
        &store,
        "com.example.Detected",
        "1.0",
        "<detect-file><path>bin/tool.exe</path>\
         <sha1>a9993e364706816aba3e25717850c26c9cd0d89d</sha1></detect-file>",
    );
    add_version(
        &store,
        "com.example.WrongHash",
        "1.0",
        "<detect-file><path>bin/tool.exe</path>\
         <sha1>0000000000000000000000000000000000000000</sha1></detect-file>",
    );
    add_version(
        &store,
        "com.example.MissingFile",
        "1.0",
        "<detect-file><path>bin/absent.exe</path></detect-file>",
    );

    let probe_root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(probe_root.path().join("bin")).unwrap();
    std::fs::write(probe_root.path().join("bin").join("tool.exe"), b"abc").unwrap();

    let oracle = HostInventory::new(
        Box::new(NoSystemProbe),
        ScanLayout {
            probe_root: Some(probe_root.path().to_path_buf()),
            ..ScanLayout::default()
        },
    );
    oracle.refresh(&store, &Job::new("recognize")).unwrap();

    let installed = oracle.enumerate_installed().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].package, "com.example.Detected");
    assert!(installed[0].external);
}

#[test]
fn marking_the_same_version_twice_replaces_the_entry() {
    let oracle = HostInventory::new(Box::new(NoSystemProbe), ScanLayout::default());

    oracle.mark_version(
        "com.example.App",
        Version::parse("1.0").unwrap(),
        &PathBuf::from("/first"),
        true,
    );
    oracle.mark_version(
        "com.example.App",
        Version::parse("1.0.0").unwrap(),
        &PathBuf::from("/second"),
        false,
    );

    let installed = oracle.enumerate_installed().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].install_path, PathBuf::from("/second"));
    assert!(!installed[0].external);
}

#[test]
fn refresh_discards_entries_from_the_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let oracle = HostInventory::new(Box::new(NoSystemProbe), ScanLayout::default());
    oracle.mark_version(
        "com.example.Stale",
        Version::parse("1.0").unwrap(),
        &PathBuf::from("/stale"),
        true,
    );

    oracle.refresh(&store, &Job::new("recognize")).unwrap();
    assert!(oracle.enumerate_installed().unwrap().is_empty());
}
