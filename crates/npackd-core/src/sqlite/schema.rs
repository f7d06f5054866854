use rusqlite::Connection;

use crate::models::error::{schema_error, CatalogResult};

// NULL is stored in CATEGORY0..CATEGORY4 when a package is not
// categorized at that level.
const CREATE_PACKAGE: &str = "CREATE TABLE PACKAGE(NAME TEXT, \
    TITLE TEXT, \
    URL TEXT, \
    ICON TEXT, \
    DESCRIPTION TEXT, \
    LICENSE TEXT, \
    FULLTEXT TEXT, \
    STATUS INTEGER, \
    SHORT_NAME TEXT, \
    REPOSITORY INTEGER, \
    CATEGORY0 INTEGER, \
    CATEGORY1 INTEGER, \
    CATEGORY2 INTEGER, \
    CATEGORY3 INTEGER, \
    CATEGORY4 INTEGER)";

const CREATE_PACKAGE_VERSION: &str = "CREATE TABLE PACKAGE_VERSION(NAME TEXT, \
    PACKAGE TEXT, \
    URL TEXT, \
    CONTENT BLOB, \
    MSIGUID TEXT, \
    DETECT_FILE_COUNT INTEGER)";

const CREATE_LICENSE: &str = "CREATE TABLE LICENSE(NAME TEXT, \
    TITLE TEXT, \
    DESCRIPTION TEXT, \
    URL TEXT)";

const CREATE_CATEGORY: &str =
    "CREATE TABLE CATEGORY(ID INTEGER PRIMARY KEY ASC, NAME TEXT, PARENT INTEGER, LEVEL INTEGER)";

const CREATE_REPOSITORY: &str =
    "CREATE TABLE REPOSITORY(ID INTEGER PRIMARY KEY ASC, URL TEXT, SHA1 TEXT)";

const CREATE_LINK: &str = "CREATE TABLE LINK(PACKAGE TEXT NOT NULL, \
    INDEX_ INTEGER NOT NULL, \
    REL TEXT NOT NULL, \
    HREF TEXT NOT NULL)";

pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let mut statement =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    statement.exists([table])
}

pub(crate) fn column_exists(
    conn: &Connection,
    table: &str,
    column: &str,
) -> rusqlite::Result<bool> {
    let mut statement = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Creates missing tables and indexes. Migrations are additive and keyed
/// off table/column existence probes; a table missing a column added by a
/// breaking change is dropped and recreated empty.
pub(crate) fn update_schema(conn: &Connection) -> CatalogResult<()> {
    apply_schema(conn).map_err(|e| schema_error("update_schema", e))
}

fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "PACKAGE")? {
        conn.execute_batch(CREATE_PACKAGE)?;
        conn.execute_batch("CREATE UNIQUE INDEX PACKAGE_NAME ON PACKAGE(NAME)")?;
        conn.execute_batch("CREATE INDEX PACKAGE_SHORT_NAME ON PACKAGE(SHORT_NAME)")?;
    }

    if !table_exists(conn, "CATEGORY")? {
        conn.execute_batch(CREATE_CATEGORY)?;
        conn.execute_batch("CREATE UNIQUE INDEX CATEGORY_ID ON CATEGORY(ID)")?;
    }

    // PACKAGE_VERSION.URL arrived after the first shipped schema; a table
    // without it predates the blob layout and cannot be upgraded in place.
    if table_exists(conn, "PACKAGE_VERSION")? && !column_exists(conn, "PACKAGE_VERSION", "URL")? {
        conn.execute_batch("DROP TABLE PACKAGE_VERSION")?;
    }
    if !table_exists(conn, "PACKAGE_VERSION")? {
        conn.execute_batch(CREATE_PACKAGE_VERSION)?;
        conn.execute_batch("CREATE INDEX PACKAGE_VERSION_PACKAGE ON PACKAGE_VERSION(PACKAGE)")?;
        conn.execute_batch(
            "CREATE UNIQUE INDEX PACKAGE_VERSION_PACKAGE_NAME ON PACKAGE_VERSION(PACKAGE, NAME)",
        )?;
        conn.execute_batch(
            "CREATE INDEX PACKAGE_VERSION_DETECT_FILE_COUNT ON PACKAGE_VERSION(DETECT_FILE_COUNT)",
        )?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS PACKAGE_VERSION_MSIGUID ON PACKAGE_VERSION(MSIGUID)",
    )?;

    if !table_exists(conn, "LICENSE")? {
        conn.execute_batch(CREATE_LICENSE)?;
        conn.execute_batch("CREATE UNIQUE INDEX LICENSE_NAME ON LICENSE(NAME)")?;
    }

    // REPOSITORY.SHA1 is likewise a breaking addition.
    if table_exists(conn, "REPOSITORY")? && !column_exists(conn, "REPOSITORY", "SHA1")? {
        conn.execute_batch("DROP TABLE REPOSITORY")?;
    }
    if !table_exists(conn, "REPOSITORY")? {
        conn.execute_batch(CREATE_REPOSITORY)?;
        conn.execute_batch("CREATE UNIQUE INDEX REPOSITORY_ID ON REPOSITORY(ID)")?;
    }

    if !table_exists(conn, "LINK")? {
        conn.execute_batch(CREATE_LINK)?;
        conn.execute_batch("CREATE INDEX LINK_PACKAGE ON LINK(PACKAGE)")?;
    }

    Ok(())
}
