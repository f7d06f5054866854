use rusqlite::types::Value;

use crate::models::error::{schema_error, CatalogResult};
use crate::models::{CategoryCount, CategoryFilter, PackageStatus};
use crate::sqlite::store::CatalogStore;

/// Status facet of a search: no filter, or one specific status. The
/// installed filter is inclusive and matches updateable packages too.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusFilter {
    Any,
    Is(PackageStatus),
}

impl CatalogStore {
    /// Free-text plus faceted search; returns matching package names
    /// ordered by title. Keywords shorter than two characters are
    /// dropped to avoid explosive scans.
    pub fn find_package_names(
        &self,
        query: &str,
        status: StatusFilter,
        cat0: CategoryFilter,
        cat1: CategoryFilter,
    ) -> CatalogResult<Vec<String>> {
        let keywords: Vec<String> = split_keywords(query)
            .into_iter()
            .filter(|kw| kw.len() > 1)
            .collect();
        let (where_clause, params) = build_where(&keywords, status, cat0, cat1);

        let mut sql = "SELECT NAME FROM PACKAGE".to_string();
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        sql.push_str(" ORDER BY TITLE");

        let mut statement = self
            .connection()
            .prepare_cached(&sql)
            .map_err(|e| schema_error("find_package_names", e))?;
        let names = statement
            .query_map(rusqlite::params_from_iter(params), |row| row.get(0))
            .map_err(|e| schema_error("find_package_names", e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| schema_error("find_package_names", e))?;
        Ok(names)
    }

    /// Facet rollup for the requested category level under the same
    /// filter as the package search: `(id, count, name)` per distinct
    /// category, with a NULL-id row counting uncategorized packages.
    ///
    /// Unlike `find_package_names`, every keyword participates here,
    /// including single-character ones.
    pub fn find_categories(
        &self,
        query: &str,
        level: u32,
        status: StatusFilter,
        cat0: CategoryFilter,
        cat1: CategoryFilter,
    ) -> CatalogResult<Vec<CategoryCount>> {
        let keywords = split_keywords(query);
        let (where_clause, params) = build_where(&keywords, status, cat0, cat1);

        let mut sql = format!(
            "SELECT CATEGORY.ID, COUNT(*), CATEGORY.NAME FROM PACKAGE \
             LEFT JOIN CATEGORY ON PACKAGE.CATEGORY{level} = CATEGORY.ID"
        );
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        sql.push_str(" GROUP BY CATEGORY.ID, CATEGORY.NAME ORDER BY CATEGORY.NAME");

        let mut statement = self
            .connection()
            .prepare_cached(&sql)
            .map_err(|e| schema_error("find_categories", e))?;
        let counts = statement
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok(CategoryCount {
                    id: row.get(0)?,
                    count: row.get(1)?,
                    name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })
            .map_err(|e| schema_error("find_categories", e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| schema_error("find_categories", e))?;
        Ok(counts)
    }
}

fn split_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn build_where(
    keywords: &[String],
    status: StatusFilter,
    cat0: CategoryFilter,
    cat1: CategoryFilter,
) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for keyword in keywords {
        clauses.push(format!("FULLTEXT LIKE ?{}", params.len() + 1));
        params.push(Value::Text(format!("%{keyword}%")));
    }

    if let StatusFilter::Is(status) = status {
        let operator = if status == PackageStatus::Installed {
            ">="
        } else {
            "="
        };
        clauses.push(format!("STATUS {} ?{}", operator, params.len() + 1));
        params.push(Value::Integer(status.as_i64()));
    }

    for (column, filter) in [("CATEGORY0", cat0), ("CATEGORY1", cat1)] {
        match filter {
            CategoryFilter::Any => {}
            CategoryFilter::Uncategorized => clauses.push(format!("{column} IS NULL")),
            CategoryFilter::Id(id) => {
                clauses.push(format!("{} = ?{}", column, params.len() + 1));
                params.push(Value::Integer(id));
            }
        }
    }

    (clauses.join(" AND "), params)
}
