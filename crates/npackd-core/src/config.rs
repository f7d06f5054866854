use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::error::{config_error, io_error, CatalogResult};

/// The user's ordered repository list, persisted as JSON under the
/// application data directory. The catalog mirrors it into the
/// `REPOSITORY` table on every refresh.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    urls: Vec<String>,
}

impl RepositoryConfig {
    pub fn new(urls: Vec<String>) -> CatalogResult<Self> {
        for url in &urls {
            validate_url(url)?;
        }
        Ok(Self { urls })
    }

    /// Loads the configuration; a missing file means no repositories are
    /// configured yet.
    pub fn load(path: &Path) -> CatalogResult<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let bytes =
            std::fs::read(path).map_err(|e| io_error("reading the repository list", e))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| config_error(format!("malformed repository list: {e}")))?;
        for url in &config.urls {
            validate_url(url)?;
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> CatalogResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_error("creating the configuration directory", e))?;
        }
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| config_error(format!("encoding the repository list: {e}")))?;
        std::fs::write(path, bytes).map_err(|e| io_error("writing the repository list", e))
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

fn validate_url(url: &str) -> CatalogResult<()> {
    if url.starts_with("data:image/png;base64,") {
        return Ok(());
    }
    let parsed =
        reqwest::Url::parse(url).map_err(|e| config_error(format!("malformed URL '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(config_error(format!(
            "unsupported URL scheme '{other}' in '{url}'"
        ))),
    }
}

/// Conventional catalog location under the machine-wide application
/// data directory.
pub fn default_catalog_path(data_dir: &Path) -> PathBuf {
    data_dir.join("Npackd").join("Data.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repositories.json");

        let config =
            RepositoryConfig::new(vec!["https://example.com/Rep.xml".to_string()]).unwrap();
        config.save(&path).unwrap();

        assert_eq!(RepositoryConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn a_missing_file_is_an_empty_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let config = RepositoryConfig::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn malformed_urls_are_rejected() {
        assert!(RepositoryConfig::new(vec!["not a url".to_string()]).is_err());
        assert!(RepositoryConfig::new(vec!["ftp://example.com/r".to_string()]).is_err());
    }
}
