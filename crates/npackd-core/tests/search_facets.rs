use npackd_core::models::{CategoryFilter, Package, PackageStatus, Version};
use npackd_core::sqlite::{CatalogStore, StatusFilter};

fn add_package(store: &CatalogStore, name: &str, title: &str, category: Option<&str>) {
    let mut package = Package::new(name, title);
    package.description = format!("{title} description");
    if let Some(category) = category {
        package.categories.push(category.to_string());
    }
    store.upsert_package(&package, true).unwrap();
}

fn seeded_store(dir: &tempfile::TempDir) -> CatalogStore {
    let store = CatalogStore::open(&dir.path().join("Data.db"), false).unwrap();

    add_package(&store, "com.example.Vim", "Vim", Some("Dev/Editors"));
    add_package(&store, "com.example.Emacs", "Emacs", Some("Dev/Editors"));
    add_package(&store, "com.example.Kate", "Kate", Some("Dev/Editors"));
    add_package(&store, "com.example.Gcc", "GCC", Some("Dev/Compilers"));
    add_package(&store, "com.example.Clang", "Clang", Some("Dev/Compilers"));
    add_package(&store, "com.example.Loose", "Loose Tool", None);

    store
}

#[test]
fn free_text_search_matches_title_description_and_name() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir);

    let by_title = store
        .find_package_names("vim", StatusFilter::Any, CategoryFilter::Any, CategoryFilter::Any)
        .unwrap();
    assert_eq!(by_title, vec!["com.example.Vim"]);

    let by_name = store
        .find_package_names(
            "com.example.gcc",
            StatusFilter::Any,
            CategoryFilter::Any,
            CategoryFilter::Any,
        )
        .unwrap();
    assert_eq!(by_name, vec!["com.example.Gcc"]);

    let several = store
        .find_package_names(
            "description",
            StatusFilter::Any,
            CategoryFilter::Any,
            CategoryFilter::Any,
        )
        .unwrap();
    assert_eq!(several.len(), 6);
}

#[test]
fn results_are_ordered_by_title() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir);

    let names = store
        .find_package_names("", StatusFilter::Any, CategoryFilter::Any, CategoryFilter::Any)
        .unwrap();
    assert_eq!(
        names,
        vec![
            "com.example.Clang",
            "com.example.Emacs",
            "com.example.Gcc",
            "com.example.Kate",
            "com.example.Loose",
            "com.example.Vim",
        ]
    );
}

#[test]
fn single_character_keywords_are_dropped_from_package_search() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir);

    // "q" matches nothing, but as a one-character keyword it is not
    // allowed to constrain the query.
    let names = store
        .find_package_names(
            "q vim",
            StatusFilter::Any,
            CategoryFilter::Any,
            CategoryFilter::Any,
        )
        .unwrap();
    assert_eq!(names, vec!["com.example.Vim"]);
}

#[test]
fn category_search_keeps_single_character_keywords() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir);

    // The rollup variant applies every keyword, including length-1 ones;
    // "q" therefore filters everything out here.
    let counts = store
        .find_categories(
            "q vim",
            0,
            StatusFilter::Any,
            CategoryFilter::Any,
            CategoryFilter::Any,
        )
        .unwrap();
    assert!(counts.is_empty());
}

#[test]
fn category_rollup_counts_per_level() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = seeded_store(&dir);
    store.read_categories().unwrap();

    let level0 = store
        .find_categories(
            "",
            0,
            StatusFilter::Any,
            CategoryFilter::Any,
            CategoryFilter::Any,
        )
        .unwrap();

    // NULL sorts first: the uncategorized row, then Dev.
    assert_eq!(level0.len(), 2);
    assert_eq!(level0[0].id, None);
    assert_eq!(level0[0].count, 1);
    assert_eq!(level0[0].name, "");
    assert_eq!(level0[1].name, "Dev");
    assert_eq!(level0[1].count, 5);

    let dev_id = level0[1].id.unwrap();
    let level1 = store
        .find_categories(
            "",
            1,
            StatusFilter::Any,
            CategoryFilter::Id(dev_id),
            CategoryFilter::Any,
        )
        .unwrap();

    assert_eq!(level1.len(), 2);
    assert_eq!(level1[0].name, "Compilers");
    assert_eq!(level1[0].count, 2);
    assert_eq!(level1[1].name, "Editors");
    assert_eq!(level1[1].count, 3);
}

#[test]
fn uncategorized_filter_matches_null_category_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir);

    let names = store
        .find_package_names(
            "",
            StatusFilter::Any,
            CategoryFilter::Uncategorized,
            CategoryFilter::Any,
        )
        .unwrap();
    assert_eq!(names, vec!["com.example.Loose"]);
}

#[test]
fn installed_status_filter_includes_updateable_packages() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir);

    // Vim 1.0 installed with a 2.0 available -> UPDATEABLE; Emacs
    // up to date -> INSTALLED.
    let fragment = |p: &str, v: &str| {
        format!("<version name=\"{v}\" package=\"{p}\"><url>https://e/x.zip</url></version>")
            .into_bytes()
    };
    for (package, version) in [
        ("com.example.Vim", "1.0"),
        ("com.example.Vim", "2.0"),
        ("com.example.Emacs", "1.0"),
    ] {
        let pv = npackd_core::models::PackageVersion::new(
            package,
            Version::parse(version).unwrap(),
        );
        store
            .upsert_package_version(&pv, &fragment(package, version), true)
            .unwrap();
    }
    store
        .update_status("com.example.Vim", &[Version::parse("1.0").unwrap()])
        .unwrap();
    store
        .update_status("com.example.Emacs", &[Version::parse("1.0").unwrap()])
        .unwrap();

    let installed = store
        .find_package_names(
            "",
            StatusFilter::Is(PackageStatus::Installed),
            CategoryFilter::Any,
            CategoryFilter::Any,
        )
        .unwrap();
    assert_eq!(installed, vec!["com.example.Emacs", "com.example.Vim"]);

    let updateable = store
        .find_package_names(
            "",
            StatusFilter::Is(PackageStatus::Updateable),
            CategoryFilter::Any,
            CategoryFilter::Any,
        )
        .unwrap();
    assert_eq!(updateable, vec!["com.example.Vim"]);
}
