use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CatalogErrorKind {
    Transport,
    CorruptCatalog,
    Schema,
    Io,
    Config,
    Cancelled,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CatalogError {
    pub kind: CatalogErrorKind,
    /// URL of the repository or artifact the failure belongs to, if any.
    pub url: Option<String>,
    /// 1-based line and column in the source document for parse failures.
    pub position: Option<(u64, u64)>,
    pub message: String,
}

impl CatalogError {
    pub fn is_cancelled(&self) -> bool {
        self.kind == CatalogErrorKind::Cancelled
    }
}

impl Display for CatalogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.kind, &self.url, &self.position) {
            (CatalogErrorKind::CorruptCatalog, _, Some((line, column))) => write!(
                f,
                "XML parsing failed at line {}, column {}: {}",
                line, column, self.message
            ),
            (_, Some(url), _) => write!(f, "{:?}: {} ({})", self.kind, self.message, url),
            _ => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl Error for CatalogError {}

pub type CatalogResult<T> = Result<T, CatalogError>;

pub fn transport_error(url: impl Into<String>, message: impl Into<String>) -> CatalogError {
    CatalogError {
        kind: CatalogErrorKind::Transport,
        url: Some(url.into()),
        position: None,
        message: message.into(),
    }
}

pub fn corrupt_catalog(line: u64, column: u64, message: impl Into<String>) -> CatalogError {
    CatalogError {
        kind: CatalogErrorKind::CorruptCatalog,
        url: None,
        position: Some((line, column)),
        message: message.into(),
    }
}

pub fn schema_error(operation: &str, error: rusqlite::Error) -> CatalogError {
    schema_error_text(operation, error.to_string())
}

pub fn schema_error_text(operation: &str, message: impl AsRef<str>) -> CatalogError {
    CatalogError {
        kind: CatalogErrorKind::Schema,
        url: None,
        position: None,
        message: format!("catalog store '{operation}' failed: {}", message.as_ref()),
    }
}

pub fn io_error(operation: &str, error: std::io::Error) -> CatalogError {
    CatalogError {
        kind: CatalogErrorKind::Io,
        url: None,
        position: None,
        message: format!("{operation}: {error}"),
    }
}

pub fn config_error(message: impl Into<String>) -> CatalogError {
    CatalogError {
        kind: CatalogErrorKind::Config,
        url: None,
        position: None,
        message: message.into(),
    }
}

pub fn cancelled() -> CatalogError {
    CatalogError {
        kind: CatalogErrorKind::Cancelled,
        url: None,
        position: None,
        message: "the operation was cancelled".to_string(),
    }
}
