//! Input staging.
//!
//! [`Driver::with_data`] materializes a datum's inputs under a scratch
//! directory, invokes the processing callback, and unlinks every staged
//! input on the way out: on callback success, callback failure, staging
//! failure, and cancellation alike. Filesystem inputs are linked by
//! reference when the content store supports it; git inputs go through the
//! external [`Fetcher`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use datumflow_types::ids::DatumId;
use datumflow_types::input::Input;
use datumflow_types::stats::ProcessStats;

use crate::driver::Driver;
use crate::errors::DriverError;
use crate::logging::TaggedLogger;

/// Read/link contract of the platform's content-addressed filesystem.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Materialize `repo` files matching `glob` under `dst` by reference
    /// (filesystem-level links, no byte copy). Returns the linked byte
    /// count, or `Ok(None)` when this store cannot provide a
    /// reference-capable view; the caller then falls back to [`copy`].
    ///
    /// [`copy`]: ContentStore::copy
    ///
    /// # Errors
    ///
    /// Implementation-defined I/O failures.
    async fn link(&self, repo: &str, glob: &str, dst: &Path) -> anyhow::Result<Option<u64>>;

    /// Byte-copy fallback for stores without a reference-capable view.
    ///
    /// # Errors
    ///
    /// Implementation-defined I/O failures.
    async fn copy(&self, repo: &str, glob: &str, dst: &Path) -> anyhow::Result<u64>;
}

/// Materializes git refs into a target directory. The checkout itself is an
/// external concern; this crate only consumes the result.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Materialize `reference` of the repository at `url` under `dst`.
    /// Returns the fetched byte count.
    ///
    /// # Errors
    ///
    /// Implementation-defined fetch failures.
    async fn fetch(&self, url: &str, reference: &str, dst: &Path) -> anyhow::Result<u64>;
}

/// Content store over a local directory tree: `<root>/<repo>/...`.
///
/// Links by hard link per file, which keeps large datasets cheap to stage.
/// [`LocalContentStore::without_linking`] builds a store that reports no
/// reference-capable view, forcing callers onto the copy fallback.
pub struct LocalContentStore {
    root: PathBuf,
    link_capable: bool,
}

impl LocalContentStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            link_capable: true,
        }
    }

    /// A store whose `link` always reports unsupported.
    #[must_use]
    pub fn without_linking(root: PathBuf) -> Self {
        Self {
            root,
            link_capable: false,
        }
    }

    /// Resolve `glob` against a repo root into matching file paths.
    fn matched_files(&self, repo: &str, pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
        let repo_root = self.root.join(repo);
        let full_pattern = repo_root
            .join(pattern.trim_start_matches('/'))
            .to_string_lossy()
            .into_owned();
        let mut files = Vec::new();
        for entry in glob::glob(&full_pattern)
            .with_context(|| format!("invalid input glob {pattern:?}"))?
        {
            let path = entry.context("failed to read glob entry")?;
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn stage_files(
        &self,
        repo: &str,
        pattern: &str,
        dst: &Path,
        by_link: bool,
    ) -> anyhow::Result<u64> {
        let repo_root = self.root.join(repo);
        let mut bytes = 0;
        for path in self.matched_files(repo, pattern)? {
            let rel = path
                .strip_prefix(&repo_root)
                .context("matched file escaped repo root")?;
            let target = dst.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if by_link {
                std::fs::hard_link(&path, &target)
                    .with_context(|| format!("failed to link {}", path.display()))?;
                bytes += path.metadata()?.len();
            } else {
                bytes += std::fs::copy(&path, &target)?;
            }
        }
        Ok(bytes)
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn link(&self, repo: &str, glob: &str, dst: &Path) -> anyhow::Result<Option<u64>> {
        if !self.link_capable {
            return Ok(None);
        }
        self.stage_files(repo, glob, dst, true).map(Some)
    }

    async fn copy(&self, repo: &str, glob: &str, dst: &Path) -> anyhow::Result<u64> {
        self.stage_files(repo, glob, dst, false)
    }
}

/// Tracks staged input paths and removes them exactly once.
///
/// Unlink is idempotent: partially staged sets and already-removed paths
/// are fine. `Drop` is the backstop so a panic in the callback still
/// cleans up.
struct StagedInputs {
    paths: Vec<PathBuf>,
    unlinked: bool,
}

impl StagedInputs {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            unlinked: false,
        }
    }

    /// Record a path before its download starts, so partial staging is
    /// still cleaned up.
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn unlink(&mut self) {
        if self.unlinked {
            return;
        }
        self.unlinked = true;
        for path in &self.paths {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to unlink staged input");
                }
            }
        }
    }
}

impl Drop for StagedInputs {
    fn drop(&mut self) {
        self.unlink();
    }
}

/// Race `fut` against context cancellation.
async fn or_canceled<T, F>(ctx: &CancellationToken, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    tokio::select! {
        biased;
        () = ctx.cancelled() => Err(DriverError::Canceled),
        result = fut => result,
    }
}

impl Driver {
    /// Stage `inputs` for one datum, run `cb`, and unlink everything staged
    /// regardless of how `cb` or the staging itself exits.
    ///
    /// The callback takes ownership of the stats accumulator (already
    /// charged with download time and bytes) and returns it with its own
    /// phases added; `with_data` hands the final value back to the caller.
    /// Downloads are not retried here; datum-level retry belongs to the
    /// outer worker loop.
    ///
    /// # Errors
    ///
    /// [`DriverError::System`] on staging I/O failure,
    /// [`DriverError::Canceled`] when `ctx` fires mid-staging or
    /// mid-callback, or whatever `cb` returns.
    pub async fn with_data<F, Fut>(
        &self,
        ctx: &CancellationToken,
        datum: &DatumId,
        inputs: &[Input],
        logger: &TaggedLogger,
        cb: F,
    ) -> Result<ProcessStats, DriverError>
    where
        F: FnOnce(ProcessStats) -> Fut,
        Fut: Future<Output = Result<ProcessStats, DriverError>>,
    {
        let scratch = self.scratch_root().join(datum.as_str());
        tokio::fs::create_dir_all(&scratch).await?;

        let mut staged = StagedInputs::new();
        let mut stats = ProcessStats::default();

        let download_start = Instant::now();
        let downloaded = or_canceled(
            ctx,
            self.download_data(inputs, &scratch, &mut staged, logger),
        )
        .await;
        self.report_download_time_stats(download_start, &mut stats, logger);

        let result = match downloaded {
            Ok(bytes) => {
                stats.download_bytes += bytes;
                self.report_download_size_stats(bytes, logger);
                logger.log(format!(
                    "staged {} input(s), {bytes} bytes",
                    inputs.len()
                ));
                or_canceled(ctx, cb(stats)).await
            }
            Err(e) => Err(e),
        };

        staged.unlink();
        result
    }

    /// Materialize each input under its per-input subpath, in order.
    async fn download_data(
        &self,
        inputs: &[Input],
        scratch: &Path,
        staged: &mut StagedInputs,
        logger: &TaggedLogger,
    ) -> Result<u64, DriverError> {
        let mut total_bytes = 0;
        for input in inputs {
            let dst = scratch.join(input.name());
            staged.track(dst.clone());
            tokio::fs::create_dir_all(&dst).await?;

            let bytes = match input {
                Input::File { repo, glob, .. } => {
                    match self.content_store().link(repo, glob, &dst).await? {
                        Some(bytes) => bytes,
                        // No reference-capable view; fall back to a copy.
                        None => self.content_store().copy(repo, glob, &dst).await?,
                    }
                }
                Input::Git {
                    url, reference, ..
                } => self.fetcher().fetch(url, reference, &dst).await?,
            };

            logger.log(format!("staged input {} ({bytes} bytes)", input.name()));
            total_bytes += bytes;
        }
        Ok(total_bytes)
    }
}
