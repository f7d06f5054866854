use serde::{Deserialize, Serialize};

/// A node of the two-level-searchable, five-level-deep category forest.
/// `parent` is 0 for roots; `(parent, level, name)` is unique.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent: i64,
    pub level: i64,
}

/// Facet filter for one category level of a search.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CategoryFilter {
    /// No filter for this level (`-1` in the wire form).
    Any,
    /// Only rows where this level's category is NULL (`0`).
    Uncategorized,
    /// Only rows whose category ID at this level equals the value.
    Id(i64),
}

impl CategoryFilter {
    /// Decodes the conventional `-1 / 0 / N` encoding used by front-ends.
    pub fn from_i64(value: i64) -> Self {
        match value {
            v if v < 0 => Self::Any,
            0 => Self::Uncategorized,
            v => Self::Id(v),
        }
    }
}

/// One row of the facet pane: a category (or NULL for "uncategorized"),
/// the number of matching packages, and the category name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CategoryCount {
    pub id: Option<i64>,
    pub count: i64,
    pub name: String,
}
