use std::path::Path;
use std::sync::Arc;

use crate::config::RepositoryConfig;
use crate::download::{Downloaded, Downloader, HashAlgorithm};
use crate::ingest::{self, RecordSink};
use crate::jobs::Job;
use crate::models::error::{cancelled, config_error, io_error, CatalogResult};
use crate::models::{CatalogError, License, Package, PackageVersion};
use crate::oracle::InstallationOracle;
use crate::sqlite::CatalogStore;

/// Writes parsed records into the staging store. With `replace = false`
/// existing rows win, which makes the first declaring repository the
/// owner of a key.
struct StagingSink<'a> {
    store: &'a CatalogStore,
    replace: bool,
}

impl RecordSink for StagingSink<'_> {
    fn package(&mut self, package: Package) -> CatalogResult<()> {
        self.store.upsert_package(&package, self.replace)
    }

    fn package_version(&mut self, version: PackageVersion, fragment: &[u8]) -> CatalogResult<()> {
        self.store
            .upsert_package_version(&version, fragment, self.replace)
    }

    fn license(&mut self, license: License) -> CatalogResult<()> {
        self.store.upsert_license(&license, self.replace)
    }
}

/// Rebuilds the live catalog at `live_path` from the configured
/// repositories and the host's installed software.
///
/// All expensive work happens against a staging database in a scratch
/// file; the live catalog is replaced in a single transaction at the
/// end, so concurrent readers always observe a consistent snapshot.
pub async fn refresh(
    job: &Job,
    live_path: &Path,
    config: &RepositoryConfig,
    oracle: Arc<dyn InstallationOracle>,
    downloader: &Downloader,
    use_cache: bool,
) -> CatalogResult<()> {
    let result = refresh_inner(job, live_path, config, oracle, downloader, use_cache).await;
    if let Err(error) = &result {
        if !error.is_cancelled() {
            tracing::error!(kind = ?error.kind, message = %error.message, "refresh failed");
        }
        job.set_error(error.to_string());
    }
    job.complete();
    result
}

async fn refresh_inner(
    job: &Job,
    live_path: &Path,
    config: &RepositoryConfig,
    oracle: Arc<dyn InstallationOracle>,
    downloader: &Downloader,
    use_cache: bool,
) -> CatalogResult<()> {
    if config.is_empty() {
        return Err(config_error("No repositories defined"));
    }
    let urls: Vec<String> = config.urls().to_vec();

    let staging_file = tempfile::NamedTempFile::new()
        .map_err(|e| io_error("creating a temporary file for the staging database", e))?;
    let staging_path = staging_file.path().to_path_buf();
    job.set_progress(0.02);

    let artifacts = fetch_repositories(job, &urls, downloader, use_cache).await?;

    let staging_job = job.new_sub_job(0.55, "Updating the temporary database");
    let stage_urls = urls.clone();
    let stage_path = staging_path.clone();
    let stage_oracle = oracle.clone();
    run_blocking(move || {
        stage(
            &staging_job,
            &stage_path,
            &stage_urls,
            artifacts,
            stage_oracle.as_ref(),
        )
    })
    .await?;

    let transfer_job = job.new_sub_job(0.2, "Transferring the data from the temporary database");
    let live = live_path.to_path_buf();
    run_blocking(move || {
        let mut store = CatalogStore::open(&live, false)?;
        store.transfer_from(&transfer_job, &staging_path)
    })
    .await?;

    job.set_progress(1.0);
    Ok(())
}

/// Downloads every configured repository in parallel, one task and one
/// child job per URL. All tasks are awaited (join, not race) before the
/// first error is reported.
pub async fn fetch_repositories(
    job: &Job,
    urls: &[String],
    downloader: &Downloader,
    use_cache: bool,
) -> CatalogResult<Vec<Downloaded>> {
    let mut handles = Vec::with_capacity(urls.len());
    for url in urls {
        let sub = job.new_sub_job(0.25 / urls.len() as f64, format!("Downloading {url}"));
        let downloader = downloader.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            downloader
                .download(&sub, &url, use_cache, Some(HashAlgorithm::Sha1))
                .await
        }));
    }

    let mut artifacts = Vec::with_capacity(handles.len());
    let mut first_error: Option<CatalogError> = None;
    let count = handles.len();
    for (i, (handle, url)) in handles.into_iter().zip(urls).enumerate() {
        match handle.await {
            Ok(Ok(downloaded)) => {
                artifacts.push(downloaded);
                job.set_progress(0.02 + 0.25 * (i + 1) as f64 / count as f64);
            }
            Ok(Err(error)) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            Err(join_error) => {
                if first_error.is_none() {
                    first_error = Some(io_error(
                        "waiting for a download task",
                        std::io::Error::other(join_error.to_string()),
                    ));
                }
                tracing::error!(url = %url, "download task did not complete");
            }
        }
    }

    match first_error {
        // Already-downloaded temporaries are dropped here, which removes
        // them from disk.
        Some(error) => Err(error),
        None => Ok(artifacts),
    }
}

/// Builds the staging catalog inside one transaction: clear, ingest all
/// repositories sequentially in declared order, oracle refresh, orphan
/// cleanup, status recomputation.
fn stage(
    job: &Job,
    staging_path: &Path,
    urls: &[String],
    artifacts: Vec<Downloaded>,
    oracle: &dyn InstallationOracle,
) -> CatalogResult<()> {
    let mut staging = CatalogStore::open(staging_path, false)?;

    staging.begin_transaction()?;
    let result = stage_in_transaction(job, &mut staging, urls, artifacts, oracle);
    match result {
        Ok(()) => staging.commit(),
        Err(error) => {
            let _ = staging.rollback();
            job.set_error(error.to_string());
            Err(error)
        }
    }
}

fn stage_in_transaction(
    job: &Job,
    staging: &mut CatalogStore,
    urls: &[String],
    artifacts: Vec<Downloaded>,
    oracle: &dyn InstallationOracle,
) -> CatalogResult<()> {
    if job.should_proceed() {
        let sub = job.new_sub_job(0.05, "Clearing the database");
        staging.clear(&sub)?;
    }

    staging.save_repositories(urls)?;

    let count = urls.len();
    for (i, (url, artifact)) in urls.iter().zip(artifacts).enumerate() {
        if !job.should_proceed() {
            return Err(cancelled());
        }

        let sub = job.new_sub_job(0.5 / count as f64, format!("Repository {} of {}", i + 1, count));
        staging.set_current_repository(i as i64);
        let mut sink = StagingSink {
            store: staging,
            replace: false,
        };
        ingest::ingest_artifact(&sub, artifact.file.path(), &mut sink)
            .map_err(|error| attach_url(error, url))?;

        if let Some(hash) = &artifact.hash {
            staging.set_repository_sha1(url, hash)?;
        }
        sub.complete();
    }

    if job.should_proceed() {
        let sub = job.new_sub_job(0.3, "Refreshing the installation status");
        oracle.refresh(staging, &sub)?;
    }

    if job.should_proceed() {
        let sub = job.new_sub_job(0.05, "Removing packages without versions");
        staging.delete_orphaned_packages()?;
        sub.complete();
    }

    if job.should_proceed() {
        let sub = job.new_sub_job(0.1, "Updating the status for installed packages");
        let installed = oracle.enumerate_installed()?;
        staging.update_status_for_installed(&sub, &installed)?;
    }

    if !job.should_proceed() {
        return Err(cancelled());
    }

    job.set_progress(1.0);
    job.complete();
    Ok(())
}

async fn run_blocking<T, F>(operation: F) -> CatalogResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CatalogResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|join_error| {
            io_error(
                "waiting for a background task",
                std::io::Error::other(join_error.to_string()),
            )
        })?
}

fn attach_url(mut error: CatalogError, url: &str) -> CatalogError {
    if error.url.is_none() {
        error.url = Some(url.to_string());
    }
    error
}
