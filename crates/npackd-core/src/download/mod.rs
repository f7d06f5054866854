use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::jobs::Job;
use crate::models::error::{cancelled, config_error, io_error, transport_error};
use crate::models::CatalogResult;

const DATA_URL_PREFIX: &str = "data:image/png;base64,";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

/// A completed download: the temporary file holding the decoded bytes
/// and, when requested, their hash.
#[derive(Debug)]
pub struct Downloaded {
    pub file: NamedTempFile,
    pub hash: Option<String>,
}

/// Fetches repository artifacts. `http://`, `https://` and
/// `data:image/png;base64,` URLs are supported; redirects and gzip
/// content encoding are handled by the transport, so hashes are always
/// computed over the decoded bytes.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    cache_dir: Option<PathBuf>,
}

impl Downloader {
    pub fn new() -> CatalogResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| config_error(format!("building the HTTP client: {e}")))?;
        Ok(Self {
            client,
            cache_dir: None,
        })
    }

    /// Enables the local URL cache under `dir`.
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    /// Downloads `url` into a temporary file. Cancellation is polled
    /// between chunks; a partial file never escapes this function.
    pub async fn download(
        &self,
        job: &Job,
        url: &str,
        use_cache: bool,
        algorithm: Option<HashAlgorithm>,
    ) -> CatalogResult<Downloaded> {
        if !job.should_proceed() {
            return Err(cancelled());
        }

        let result = if let Some(encoded) = url.strip_prefix(DATA_URL_PREFIX) {
            self.decode_data_url(url, encoded, algorithm)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.download_http(job, url, use_cache, algorithm).await
        } else {
            Err(config_error(format!("unsupported URL scheme: {url}")))
        };

        match result {
            Ok(downloaded) => {
                job.complete();
                Ok(downloaded)
            }
            Err(error) => {
                job.set_error(error.to_string());
                Err(error)
            }
        }
    }

    fn decode_data_url(
        &self,
        url: &str,
        encoded: &str,
        algorithm: Option<HashAlgorithm>,
    ) -> CatalogResult<Downloaded> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| transport_error(url, format!("invalid base64 payload: {e}")))?;

        let mut hasher = algorithm.map(Hasher::new);
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&bytes);
        }

        let mut file =
            NamedTempFile::new().map_err(|e| io_error("creating a temporary file", e))?;
        file.write_all(&bytes)
            .map_err(|e| io_error("writing the downloaded data", e))?;
        file.flush()
            .map_err(|e| io_error("writing the downloaded data", e))?;

        Ok(Downloaded {
            file,
            hash: hasher.map(Hasher::finalize),
        })
    }

    async fn download_http(
        &self,
        job: &Job,
        url: &str,
        use_cache: bool,
        algorithm: Option<HashAlgorithm>,
    ) -> CatalogResult<Downloaded> {
        if use_cache {
            if let Some(cached) = self.read_cache(url, algorithm)? {
                job.set_progress(1.0);
                return Ok(cached);
            }
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transport_error(url, format!("HTTP status {status}")));
        }

        // With gzip content encoding the transport strips Content-Length
        // and progress stays indeterminate.
        let content_length = response.content_length();

        let mut file =
            NamedTempFile::new().map_err(|e| io_error("creating a temporary file", e))?;
        let mut hasher = algorithm.map(Hasher::new);
        let mut received: u64 = 0;

        let mut response = response;
        loop {
            if !job.should_proceed() {
                return Err(cancelled());
            }
            let chunk = response
                .chunk()
                .await
                .map_err(|e| transport_error(url, e.to_string()))?;
            let Some(chunk) = chunk else {
                break;
            };

            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            file.write_all(&chunk)
                .map_err(|e| io_error("writing the downloaded data", e))?;

            received += chunk.len() as u64;
            if let Some(total) = content_length {
                if total > 0 {
                    job.set_progress(received as f64 / total as f64);
                }
            }
        }

        file.flush()
            .map_err(|e| io_error("writing the downloaded data", e))?;

        if use_cache {
            self.write_cache(url, file.path())?;
        }

        Ok(Downloaded {
            file,
            hash: hasher.map(Hasher::finalize),
        })
    }

    fn cache_path(&self, url: &str) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let mut digest = Sha256::new();
        digest.update(url.as_bytes());
        Some(dir.join(hex(&digest.finalize())))
    }

    fn read_cache(
        &self,
        url: &str,
        algorithm: Option<HashAlgorithm>,
    ) -> CatalogResult<Option<Downloaded>> {
        let Some(path) = self.cache_path(url) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }

        let bytes = std::fs::read(&path).map_err(|e| io_error("reading the URL cache", e))?;
        let mut hasher = algorithm.map(Hasher::new);
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&bytes);
        }

        let mut file =
            NamedTempFile::new().map_err(|e| io_error("creating a temporary file", e))?;
        file.write_all(&bytes)
            .map_err(|e| io_error("copying from the URL cache", e))?;
        file.flush()
            .map_err(|e| io_error("copying from the URL cache", e))?;

        Ok(Some(Downloaded {
            file,
            hash: hasher.map(Hasher::finalize),
        }))
    }

    fn write_cache(&self, url: &str, downloaded: &std::path::Path) -> CatalogResult<()> {
        let Some(path) = self.cache_path(url) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_error("creating the URL cache directory", e))?;
        }
        std::fs::copy(downloaded, &path).map_err(|e| io_error("writing the URL cache", e))?;
        Ok(())
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> String {
        match self {
            Self::Sha1(h) => hex(&h.finalize()),
            Self::Sha256(h) => hex(&h.finalize()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Streaming SHA-1 of a file on disk, shared with the detect-file
/// probes.
pub fn sha1_of_file(path: &std::path::Path) -> std::io::Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex(&hasher.finalize()))
}
