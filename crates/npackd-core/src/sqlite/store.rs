use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use rusqlite::{Connection, OpenFlags};

use crate::ingest;
use crate::jobs::Job;
use crate::models::error::{schema_error, CatalogResult};
use crate::models::{
    InstalledPackageVersion, License, Links, Package, PackageStatus, PackageVersion, Version,
};
use crate::repository::PackageRepository;
use crate::sqlite::schema;

const LICENSE_CACHE_SIZE: usize = 32;

/// Batch size for `find_packages`; names are looked up in `IN` lists of
/// at most this many parameters.
const FIND_PACKAGES_BLOCK: usize = 10;

const DETACH_ATTEMPTS: usize = 10;
const DETACH_BACKOFF: Duration = Duration::from_secs(1);

/// The durable catalog: packages, versions, licenses, categories, links
/// and the configured repository list, in one SQLite file.
///
/// One handle owns one connection. Writers keep a single handle;
/// concurrent readers open their own read-only handles.
pub struct CatalogStore {
    conn: Connection,
    path: PathBuf,
    /// Repository index stamped onto rows written by the loader.
    current_repository: i64,
    /// `id -> name`, rebuilt at open and after every refresh.
    categories: HashMap<i64, String>,
    licenses: Mutex<LruCache<String, License>>,
}

impl CatalogStore {
    /// Opens (and for read-write handles, creates/upgrades) the catalog
    /// at `path`. Idempotent.
    pub fn open(path: &Path, read_only: bool) -> CatalogResult<Self> {
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };
        let conn = Connection::open_with_flags(path, flags).map_err(|e| schema_error("open", e))?;

        conn.busy_timeout(Duration::from_secs(30))
            .map_err(|e| schema_error("busy_timeout", e))?;

        if !read_only {
            conn.query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))
                .map_err(|e| schema_error("journal_mode", e))?;
            schema::update_schema(&conn)?;
        }

        let mut store = Self {
            conn,
            path: path.to_path_buf(),
            current_repository: 0,
            categories: HashMap::new(),
            licenses: Mutex::new(LruCache::new(
                NonZeroUsize::new(LICENSE_CACHE_SIZE).unwrap(),
            )),
        };
        store.read_categories()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tags subsequent writes with the index of the repository being
    /// loaded.
    pub fn set_current_repository(&mut self, index: i64) {
        self.current_repository = index;
    }

    pub(crate) fn exec(&self, operation: &str, sql: &str) -> CatalogResult<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| schema_error(operation, e))
    }

    pub fn begin_transaction(&self) -> CatalogResult<()> {
        self.exec("begin_transaction", "BEGIN TRANSACTION")
    }

    pub fn commit(&self) -> CatalogResult<()> {
        self.exec("commit", "COMMIT")
    }

    pub fn rollback(&self) -> CatalogResult<()> {
        self.exec("rollback", "ROLLBACK")
    }

    /// Inserts the package row; `replace` decides between overwrite and
    /// keep-existing semantics. Link rows are rewritten only when the
    /// package row itself was written.
    pub fn upsert_package(&self, package: &Package, replace: bool) -> CatalogResult<()> {
        let category_ids = self.insert_categories(package)?;

        let sql = format!(
            "INSERT OR {} INTO PACKAGE \
             (REPOSITORY, NAME, TITLE, URL, ICON, DESCRIPTION, LICENSE, FULLTEXT, \
              STATUS, SHORT_NAME, CATEGORY0, CATEGORY1, CATEGORY2, CATEGORY3, CATEGORY4) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            if replace { "REPLACE" } else { "IGNORE" }
        );
        let mut statement = self
            .conn
            .prepare_cached(&sql)
            .map_err(|e| schema_error("upsert_package", e))?;

        let affected = statement
            .execute((
                self.current_repository,
                &package.name,
                &package.title,
                &package.url,
                &package.icon,
                &package.description,
                &package.license,
                package.full_text(),
                package.status.as_i64(),
                package.short_name(),
                category_ids[0],
                category_ids[1],
                category_ids[2],
                category_ids[3],
                category_ids[4],
            ))
            .map_err(|e| schema_error("upsert_package", e))?;

        if affected > 0 {
            self.delete_links(&package.name)?;
            self.save_links(package)?;
        }

        Ok(())
    }

    /// Persists a version row together with the verbatim XML fragment it
    /// was parsed from; the blob is immutable after insert.
    pub fn upsert_package_version(
        &self,
        version: &PackageVersion,
        content: &[u8],
        replace: bool,
    ) -> CatalogResult<()> {
        let sql = format!(
            "INSERT OR {} INTO PACKAGE_VERSION \
             (NAME, PACKAGE, URL, CONTENT, MSIGUID, DETECT_FILE_COUNT) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            if replace { "REPLACE" } else { "IGNORE" }
        );
        let mut statement = self
            .conn
            .prepare_cached(&sql)
            .map_err(|e| schema_error("upsert_package_version", e))?;

        statement
            .execute((
                version.version.clone().normalized().to_string(),
                &version.package,
                version.download_url.as_deref().unwrap_or(""),
                content,
                version.msi_guid.as_deref(),
                version.detect_files.len() as i64,
            ))
            .map_err(|e| schema_error("upsert_package_version", e))?;

        Ok(())
    }

    pub fn upsert_license(&self, license: &License, replace: bool) -> CatalogResult<()> {
        let sql = format!(
            "INSERT OR {} INTO LICENSE (NAME, TITLE, DESCRIPTION, URL) \
             VALUES (?1, ?2, ?3, ?4)",
            if replace { "REPLACE" } else { "IGNORE" }
        );
        let mut statement = self
            .conn
            .prepare_cached(&sql)
            .map_err(|e| schema_error("upsert_license", e))?;

        statement
            .execute((
                &license.name,
                &license.title,
                &license.description,
                &license.url,
            ))
            .map_err(|e| schema_error("upsert_license", e))?;

        Ok(())
    }

    pub fn find_package(&self, name: &str) -> CatalogResult<Option<Package>> {
        let mut statement = self
            .conn
            .prepare_cached(
                "SELECT TITLE, URL, ICON, DESCRIPTION, LICENSE, STATUS, \
                 CATEGORY0, CATEGORY1, CATEGORY2, CATEGORY3, CATEGORY4 \
                 FROM PACKAGE WHERE NAME = ?1 LIMIT 1",
            )
            .map_err(|e| schema_error("find_package", e))?;

        let row = statement
            .query_row([name], |row| {
                let mut package = Package::new(name, row.get::<_, String>(0)?);
                package.url = row.get(1)?;
                package.icon = row.get(2)?;
                package.description = row.get(3)?;
                package.license = row.get(4)?;
                package.status = PackageStatus::from_i64(row.get(5)?);
                let categories: [Option<i64>; 5] = [
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                ];
                Ok((package, categories))
            })
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(|e| schema_error("find_package", e))?;

        let Some((mut package, categories)) = row else {
            return Ok(None);
        };

        let path = self.category_path(&categories);
        if !path.is_empty() {
            package.categories.push(path);
        }
        package.links = self.read_links(&package.name)?;
        Ok(Some(package))
    }

    /// Batched lookup; the output order matches the input order and
    /// unknown names are skipped.
    pub fn find_packages(&self, names: &[String]) -> CatalogResult<Vec<Package>> {
        let mut result = Vec::with_capacity(names.len());

        for chunk in names.chunks(FIND_PACKAGES_BLOCK) {
            let placeholders = (1..=chunk.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT NAME, TITLE, URL, ICON, DESCRIPTION, LICENSE, STATUS, \
                 CATEGORY0, CATEGORY1, CATEGORY2, CATEGORY3, CATEGORY4 \
                 FROM PACKAGE WHERE NAME IN ({placeholders})"
            );
            let mut statement = self
                .conn
                .prepare_cached(&sql)
                .map_err(|e| schema_error("find_packages", e))?;

            let mut found: Vec<(Package, [Option<i64>; 5])> = statement
                .query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                    let mut package =
                        Package::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
                    package.url = row.get(2)?;
                    package.icon = row.get(3)?;
                    package.description = row.get(4)?;
                    package.license = row.get(5)?;
                    package.status = PackageStatus::from_i64(row.get(6)?);
                    let categories: [Option<i64>; 5] = [
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                    ];
                    Ok((package, categories))
                })
                .map_err(|e| schema_error("find_packages", e))?
                .collect::<rusqlite::Result<_>>()
                .map_err(|e| schema_error("find_packages", e))?;

            for name in chunk {
                let Some(i) = found.iter().position(|(p, _)| &p.name == name) else {
                    continue;
                };
                let (mut package, categories) = found.remove(i);
                let path = self.category_path(&categories);
                if !path.is_empty() {
                    package.categories.push(path);
                }
                package.links = self.read_links(&package.name)?;
                result.push(package);
            }
        }

        Ok(result)
    }

    pub fn find_packages_by_short_name(&self, short_name: &str) -> CatalogResult<Vec<Package>> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT NAME FROM PACKAGE WHERE SHORT_NAME = ?1 ORDER BY NAME")
            .map_err(|e| schema_error("find_packages_by_short_name", e))?;

        let names: Vec<String> = statement
            .query_map([short_name], |row| row.get(0))
            .map_err(|e| schema_error("find_packages_by_short_name", e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| schema_error("find_packages_by_short_name", e))?;
        drop(statement);

        let mut result = Vec::with_capacity(names.len());
        for name in &names {
            if let Some(package) = self.find_package(name)? {
                result.push(package);
            }
        }
        Ok(result)
    }

    /// Re-parses the stored fragment of `(package, version)`; a damaged
    /// blob surfaces as `CorruptCatalog` with the position in the
    /// original document.
    pub fn find_package_version(
        &self,
        package: &str,
        version: &Version,
    ) -> CatalogResult<Option<PackageVersion>> {
        let normalized = version.clone().normalized().to_string();
        let mut statement = self
            .conn
            .prepare_cached(
                "SELECT CONTENT FROM PACKAGE_VERSION WHERE NAME = ?1 AND PACKAGE = ?2",
            )
            .map_err(|e| schema_error("find_package_version", e))?;

        let content: Option<Vec<u8>> = statement
            .query_row((normalized, package), |row| row.get(0))
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(|e| schema_error("find_package_version", e))?;

        match content {
            Some(content) => Ok(Some(ingest::parse_version_fragment(&content)?)),
            None => Ok(None),
        }
    }

    /// All versions of a package, newest first.
    pub fn get_package_versions(&self, package: &str) -> CatalogResult<Vec<PackageVersion>> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT CONTENT FROM PACKAGE_VERSION WHERE PACKAGE = ?1")
            .map_err(|e| schema_error("get_package_versions", e))?;

        let contents: Vec<Vec<u8>> = statement
            .query_map([package], |row| row.get(0))
            .map_err(|e| schema_error("get_package_versions", e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| schema_error("get_package_versions", e))?;

        let mut versions = Vec::with_capacity(contents.len());
        for content in &contents {
            versions.push(ingest::parse_version_fragment(content)?);
        }
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    /// Versions declaring at least one detect-file, prefiltered through
    /// the index on `DETECT_FILE_COUNT`.
    pub fn get_package_versions_with_detect_files(&self) -> CatalogResult<Vec<PackageVersion>> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT CONTENT FROM PACKAGE_VERSION WHERE DETECT_FILE_COUNT > 0")
            .map_err(|e| schema_error("get_package_versions_with_detect_files", e))?;

        let contents: Vec<Vec<u8>> = statement
            .query_map([], |row| row.get(0))
            .map_err(|e| schema_error("get_package_versions_with_detect_files", e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| schema_error("get_package_versions_with_detect_files", e))?;

        let mut versions = Vec::with_capacity(contents.len());
        for content in &contents {
            versions.push(ingest::parse_version_fragment(content)?);
        }
        versions.sort_by(|a, b| {
            a.package
                .cmp(&b.package)
                .then_with(|| b.version.cmp(&a.version))
        });
        Ok(versions)
    }

    /// Exact MSI product-code lookup; at most one row exists.
    pub fn find_package_version_by_msi_guid(
        &self,
        guid: &str,
    ) -> CatalogResult<Option<PackageVersion>> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT CONTENT FROM PACKAGE_VERSION WHERE MSIGUID = ?1")
            .map_err(|e| schema_error("find_package_version_by_msi_guid", e))?;

        let content: Option<Vec<u8>> = statement
            .query_row([guid.to_lowercase()], |row| row.get(0))
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(|e| schema_error("find_package_version_by_msi_guid", e))?;

        match content {
            Some(content) => Ok(Some(ingest::parse_version_fragment(&content)?)),
            None => Ok(None),
        }
    }

    /// Read-heavy; served through a bounded in-process cache. Entries
    /// are cloned on the way out to isolate callers.
    pub fn find_license(&self, name: &str) -> CatalogResult<Option<License>> {
        if let Some(cached) = self.licenses.lock().unwrap().get(name) {
            return Ok(Some(cached.clone()));
        }

        let mut statement = self
            .conn
            .prepare_cached(
                "SELECT NAME, TITLE, DESCRIPTION, URL FROM LICENSE WHERE NAME = ?1",
            )
            .map_err(|e| schema_error("find_license", e))?;

        let license: Option<License> = statement
            .query_row([name], |row| {
                Ok(License {
                    name: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    url: row.get(3)?,
                })
            })
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(|e| schema_error("find_license", e))?;

        if let Some(license) = &license {
            self.licenses
                .lock()
                .unwrap()
                .put(name.to_string(), license.clone());
        }
        Ok(license)
    }

    /// Looks up the `(parent, level, name)` triple, inserting it when
    /// absent, and returns the category ID either way.
    pub fn insert_category(&self, parent: i64, level: i64, name: &str) -> CatalogResult<i64> {
        let mut select = self
            .conn
            .prepare_cached(
                "SELECT ID FROM CATEGORY WHERE PARENT = ?1 AND LEVEL = ?2 AND NAME = ?3",
            )
            .map_err(|e| schema_error("insert_category", e))?;

        let existing: Option<i64> = select
            .query_row((parent, level, name), |row| row.get(0))
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(|e| schema_error("insert_category", e))?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let mut insert = self
            .conn
            .prepare_cached(
                "INSERT INTO CATEGORY (ID, NAME, PARENT, LEVEL) VALUES (NULL, ?1, ?2, ?3)",
            )
            .map_err(|e| schema_error("insert_category", e))?;
        insert
            .execute((name, parent, level))
            .map_err(|e| schema_error("insert_category", e))?;

        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_category(&self, id: i64) -> Option<&str> {
        self.categories.get(&id).map(String::as_str)
    }

    /// Printable slash-separated path for materialized category columns,
    /// with empty segments elided.
    pub fn category_path(&self, ids: &[Option<i64>; 5]) -> String {
        let mut path = String::new();
        for id in ids.iter().flatten() {
            let Some(name) = self.find_category(*id) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(name);
        }
        path
    }

    /// Rebuilds the in-memory `id -> name` category map.
    pub fn read_categories(&mut self) -> CatalogResult<()> {
        self.categories.clear();

        if !schema::table_exists(&self.conn, "CATEGORY")
            .map_err(|e| schema_error("read_categories", e))?
        {
            return Ok(());
        }

        let mut statement = self
            .conn
            .prepare("SELECT ID, NAME FROM CATEGORY")
            .map_err(|e| schema_error("read_categories", e))?;
        let mut rows = statement
            .query([])
            .map_err(|e| schema_error("read_categories", e))?;
        let mut categories = HashMap::new();
        while let Some(row) = rows.next().map_err(|e| schema_error("read_categories", e))? {
            let id: i64 = row.get(0).map_err(|e| schema_error("read_categories", e))?;
            let name: String = row.get(1).map_err(|e| schema_error("read_categories", e))?;
            categories.insert(id, name);
        }
        drop(rows);
        drop(statement);

        self.categories = categories;
        Ok(())
    }

    /// Deletes all catalog rows, reporting per-table progress. The
    /// category map and the license cache are invalidated wholesale.
    pub fn clear(&mut self, job: &Job) -> CatalogResult<()> {
        self.categories.clear();
        self.licenses.lock().unwrap().clear();

        let steps: [(f64, &str, &str); 5] = [
            (0.1, "Clearing the packages table", "DELETE FROM PACKAGE"),
            (
                0.6,
                "Clearing the package versions table",
                "DELETE FROM PACKAGE_VERSION",
            ),
            (0.13, "Clearing the licenses table", "DELETE FROM LICENSE"),
            (0.13, "Clearing the links table", "DELETE FROM LINK"),
            (0.04, "Clearing the categories table", "DELETE FROM CATEGORY"),
        ];

        for (weight, title, sql) in steps {
            if !job.should_proceed() {
                return Err(crate::models::error::cancelled());
            }
            let sub = job.new_sub_job(weight, title);
            if let Err(error) = self.exec("clear", sql) {
                job.set_error(error.to_string());
                return Err(error);
            }
            sub.complete();
        }

        job.set_progress(1.0);
        job.complete();
        Ok(())
    }

    /// Deletes packages that lost their last version.
    pub fn delete_orphaned_packages(&self) -> CatalogResult<()> {
        self.exec(
            "delete_orphaned_packages",
            "DELETE FROM PACKAGE WHERE NOT EXISTS \
             (SELECT * FROM PACKAGE_VERSION WHERE PACKAGE = PACKAGE.NAME)",
        )
    }

    /// Recomputes and persists the status of one package against the
    /// set of its installed versions.
    pub fn update_status(&self, package: &str, installed: &[Version]) -> CatalogResult<()> {
        let versions = self.get_package_versions(package)?;

        let newest_installed = installed.iter().max();
        let newest_installable = versions
            .iter()
            .filter(|pv| pv.installable())
            .map(|pv| &pv.version)
            .max();

        let status = match newest_installed {
            None => PackageStatus::NotInstalled,
            Some(installed) => match newest_installable {
                Some(available) if available > installed => PackageStatus::Updateable,
                _ => PackageStatus::Installed,
            },
        };

        let mut statement = self
            .conn
            .prepare_cached("UPDATE PACKAGE SET STATUS = ?1 WHERE NAME = ?2")
            .map_err(|e| schema_error("update_status", e))?;
        statement
            .execute((status.as_i64(), package))
            .map_err(|e| schema_error("update_status", e))?;
        Ok(())
    }

    /// Re-evaluates every package with at least one installed version;
    /// everything else keeps the default `NOT_INSTALLED`.
    pub fn update_status_for_installed(
        &self,
        job: &Job,
        installed: &[InstalledPackageVersion],
    ) -> CatalogResult<()> {
        let initial_title = job.title();

        let mut by_package: HashMap<&str, Vec<Version>> = HashMap::new();
        for entry in installed {
            by_package
                .entry(entry.package.as_str())
                .or_default()
                .push(entry.version.clone());
        }
        job.set_progress(0.1);

        job.set_title(format!("{initial_title} / Updating statuses"));
        let mut packages: Vec<&str> = by_package.keys().copied().collect();
        packages.sort_unstable();
        let total = packages.len();
        for (i, package) in packages.iter().enumerate() {
            if !job.should_proceed() {
                return Err(crate::models::error::cancelled());
            }
            self.update_status(package, &by_package[package])?;
            job.set_progress(0.1 + 0.9 * (i + 1) as f64 / total as f64);
        }

        job.set_title(initial_title);
        job.complete();
        Ok(())
    }

    /// Number of packages an update is available for.
    pub fn count_updates(&self) -> CatalogResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM PACKAGE WHERE STATUS = ?1",
                [PackageStatus::Updateable.as_i64()],
                |row| row.get(0),
            )
            .map_err(|e| schema_error("count_updates", e))
    }

    /// Rewrites the configured repository rows; IDs reflect the declared
    /// order, starting at 1.
    pub fn save_repositories(&self, urls: &[String]) -> CatalogResult<()> {
        self.exec("save_repositories", "DELETE FROM REPOSITORY")?;

        let mut statement = self
            .conn
            .prepare_cached("INSERT INTO REPOSITORY (ID, URL) VALUES (?1, ?2)")
            .map_err(|e| schema_error("save_repositories", e))?;
        for (i, url) in urls.iter().enumerate() {
            statement
                .execute((i as i64 + 1, url))
                .map_err(|e| schema_error("save_repositories", e))?;
        }
        Ok(())
    }

    pub fn read_repositories(&self) -> CatalogResult<Vec<String>> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT ID, URL FROM REPOSITORY ORDER BY ID")
            .map_err(|e| schema_error("read_repositories", e))?;
        let urls = statement
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| schema_error("read_repositories", e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| schema_error("read_repositories", e))?;
        Ok(urls)
    }

    /// Content hash of the last successfully ingested document for a
    /// repository URL.
    pub fn repository_sha1(&self, url: &str) -> CatalogResult<Option<String>> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT SHA1 FROM REPOSITORY WHERE URL = ?1")
            .map_err(|e| schema_error("repository_sha1", e))?;
        statement
            .query_row([url], |row| row.get::<_, Option<String>>(0))
            .or_else(ignore_no_rows_flat)
            .map_err(|e| schema_error("repository_sha1", e))
    }

    pub fn set_repository_sha1(&self, url: &str, sha1: &str) -> CatalogResult<()> {
        let mut statement = self
            .conn
            .prepare_cached("UPDATE REPOSITORY SET SHA1 = ?1 WHERE URL = ?2")
            .map_err(|e| schema_error("set_repository_sha1", e))?;
        statement
            .execute((sha1, url))
            .map_err(|e| schema_error("set_repository_sha1", e))?;
        Ok(())
    }

    /// Replaces the live contents with the staging database at `path`:
    /// ATTACH, one transaction of clear + `INSERT … SELECT` per table,
    /// then DETACH with a bounded busy retry.
    pub fn transfer_from(&mut self, job: &Job, path: &Path) -> CatalogResult<()> {
        let initial_title = job.title();
        let mut transaction_started = false;
        let mut result = Ok(());

        if job.should_proceed() {
            job.set_title(format!("{initial_title} / Attaching the temporary database"));
            let attached = self
                .conn
                .execute("ATTACH DATABASE ?1 AS tempdb", [path_to_sql(path)])
                .map(|_| ())
                .map_err(|e| schema_error("attach", e));
            match attached {
                Ok(()) => job.set_progress(0.10),
                Err(error) => {
                    job.set_error(error.to_string());
                    result = Err(error);
                }
            }
        }

        if job.should_proceed() {
            job.set_title(format!("{initial_title} / Starting an SQL transaction"));
            match self.begin_transaction() {
                Ok(()) => {
                    transaction_started = true;
                    job.set_progress(0.11);
                }
                Err(error) => {
                    job.set_error(error.to_string());
                    result = Err(error);
                }
            }
        }

        if job.should_proceed() {
            job.set_title(format!("{initial_title} / Clearing the database"));
            let sub = job.new_sub_job(0.09, "Clearing the database");
            match self.clear(&sub) {
                Ok(()) => job.set_progress(0.20),
                Err(error) => {
                    job.set_error(error.to_string());
                    result = Err(error);
                }
            }
        }

        if job.should_proceed() {
            job.set_title(format!(
                "{initial_title} / Transferring the data from the temporary database"
            ));
            match self.copy_tables_from_attached() {
                Ok(()) => job.set_progress(0.95),
                Err(error) => {
                    job.set_error(error.to_string());
                    result = Err(error);
                }
            }
        }

        if job.should_proceed() {
            job.set_title(format!("{initial_title} / Commiting the SQL transaction"));
            match self.commit() {
                Ok(()) => job.set_progress(0.97),
                Err(error) => {
                    job.set_error(error.to_string());
                    result = Err(error);
                }
            }
        } else if transaction_started {
            let _ = self.rollback();
        }

        if job.should_proceed() {
            job.set_title(format!("{initial_title} / Detaching the temporary database"));
            let conn = &self.conn;
            let detached = retry_busy(
                DETACH_ATTEMPTS,
                || std::thread::sleep(DETACH_BACKOFF),
                || conn.execute_batch("DETACH tempdb"),
            )
            .map_err(|e| schema_error("detach", e));
            match detached {
                Ok(()) => job.set_progress(0.99),
                Err(error) => {
                    job.set_error(error.to_string());
                    result = Err(error);
                }
            }
        }

        if job.should_proceed() {
            match self.read_categories() {
                Ok(()) => job.set_progress(1.0),
                Err(error) => {
                    job.set_error(error.to_string());
                    result = Err(error);
                }
            }
        }

        job.set_title(initial_title);
        job.complete();
        result
    }

    fn copy_tables_from_attached(&self) -> CatalogResult<()> {
        self.exec(
            "transfer_package",
            "INSERT INTO PACKAGE(NAME, TITLE, URL, ICON, DESCRIPTION, LICENSE, FULLTEXT, \
             STATUS, SHORT_NAME, REPOSITORY, CATEGORY0, CATEGORY1, CATEGORY2, CATEGORY3, \
             CATEGORY4) SELECT NAME, TITLE, URL, ICON, DESCRIPTION, LICENSE, FULLTEXT, \
             STATUS, SHORT_NAME, REPOSITORY, CATEGORY0, CATEGORY1, CATEGORY2, CATEGORY3, \
             CATEGORY4 FROM tempdb.PACKAGE",
        )?;
        self.exec(
            "transfer_package_version",
            "INSERT INTO PACKAGE_VERSION(NAME, PACKAGE, URL, CONTENT, MSIGUID, \
             DETECT_FILE_COUNT) SELECT NAME, PACKAGE, URL, CONTENT, MSIGUID, \
             DETECT_FILE_COUNT FROM tempdb.PACKAGE_VERSION",
        )?;
        self.exec(
            "transfer_license",
            "INSERT INTO LICENSE(NAME, TITLE, DESCRIPTION, URL) \
             SELECT NAME, TITLE, DESCRIPTION, URL FROM tempdb.LICENSE",
        )?;
        self.exec(
            "transfer_category",
            "INSERT INTO CATEGORY(ID, NAME, PARENT, LEVEL) \
             SELECT ID, NAME, PARENT, LEVEL FROM tempdb.CATEGORY",
        )?;
        self.exec(
            "transfer_link",
            "INSERT INTO LINK(PACKAGE, INDEX_, REL, HREF) \
             SELECT PACKAGE, INDEX_, REL, HREF FROM tempdb.LINK",
        )?;
        // clear() leaves REPOSITORY alone; the rows are rewritten here so
        // a repeated refresh does not collide on the unique ID index.
        self.exec("transfer_repository", "DELETE FROM REPOSITORY")?;
        self.exec(
            "transfer_repository",
            "INSERT INTO REPOSITORY(ID, URL, SHA1) \
             SELECT ID, URL, SHA1 FROM tempdb.REPOSITORY",
        )
    }

    fn insert_categories(&self, package: &Package) -> CatalogResult<[Option<i64>; 5]> {
        let mut ids: [Option<i64>; 5] = [None; 5];
        let Some(path) = package.categories.first() else {
            return Ok(ids);
        };

        let mut parent = 0i64;
        for (level, segment) in path.split('/').take(5).enumerate() {
            let segment = segment.trim();
            let id = self.insert_category(parent, level as i64, segment)?;
            ids[level] = Some(id);
            parent = id;
        }
        Ok(ids)
    }

    fn read_links(&self, package: &str) -> CatalogResult<Links> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT REL, HREF FROM LINK WHERE PACKAGE = ?1 ORDER BY INDEX_")
            .map_err(|e| schema_error("read_links", e))?;

        let mut rows = statement
            .query([package])
            .map_err(|e| schema_error("read_links", e))?;
        let mut links = Links::new();
        while let Some(row) = rows.next().map_err(|e| schema_error("read_links", e))? {
            let rel: String = row.get(0).map_err(|e| schema_error("read_links", e))?;
            let href: String = row.get(1).map_err(|e| schema_error("read_links", e))?;
            links.add(rel, href);
        }
        Ok(links)
    }

    fn delete_links(&self, package: &str) -> CatalogResult<()> {
        let mut statement = self
            .conn
            .prepare_cached("DELETE FROM LINK WHERE PACKAGE = ?1")
            .map_err(|e| schema_error("delete_links", e))?;
        statement
            .execute([package])
            .map_err(|e| schema_error("delete_links", e))?;
        Ok(())
    }

    fn save_links(&self, package: &Package) -> CatalogResult<()> {
        let mut statement = self
            .conn
            .prepare_cached(
                "INSERT INTO LINK (PACKAGE, INDEX_, REL, HREF) VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(|e| schema_error("save_links", e))?;

        let mut index = 1i64;
        for rel in package.links.rels() {
            for href in package.links.hrefs(rel) {
                if rel.is_empty() || href.is_empty() {
                    continue;
                }
                statement
                    .execute((&package.name, index, rel, href))
                    .map_err(|e| schema_error("save_links", e))?;
                index += 1;
            }
        }
        Ok(())
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl PackageRepository for CatalogStore {
    fn find_package(&self, name: &str) -> CatalogResult<Option<Package>> {
        CatalogStore::find_package(self, name)
    }

    fn find_package_version(
        &self,
        package: &str,
        version: &Version,
    ) -> CatalogResult<Option<PackageVersion>> {
        CatalogStore::find_package_version(self, package, version)
    }

    fn find_package_version_by_msi_guid(
        &self,
        guid: &str,
    ) -> CatalogResult<Option<PackageVersion>> {
        CatalogStore::find_package_version_by_msi_guid(self, guid)
    }

    fn find_license(&self, name: &str) -> CatalogResult<Option<License>> {
        CatalogStore::find_license(self, name)
    }

    fn package_versions(&self, package: &str) -> CatalogResult<Vec<PackageVersion>> {
        self.get_package_versions(package)
    }
}

fn ignore_no_rows<T>(error: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match error {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

fn ignore_no_rows_flat(error: rusqlite::Error) -> rusqlite::Result<Option<String>> {
    match error {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

fn path_to_sql(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Runs `operation` up to `attempts` times, sleeping between attempts,
/// as long as it keeps failing with a busy-class error. Some drivers
/// hold residual locks briefly after a transaction ends.
fn retry_busy<T>(
    attempts: usize,
    mut backoff: impl FnMut(),
    mut operation: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut last = operation();
    for _ in 1..attempts {
        match &last {
            Ok(_) => return last,
            Err(error) if is_busy(error) => {
                backoff();
                last = operation();
            }
            Err(_) => return last,
        }
    }
    last
}
