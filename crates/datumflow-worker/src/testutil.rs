//! Shared fixtures for this crate's tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use datumflow_state::CoordStore;
use datumflow_types::ids::PipelineId;
use datumflow_types::pipeline::{PipelineSpec, ResourceSpec, TransformSpec};

use crate::driver::{Driver, NoopProvisioner};
use crate::stager::{Fetcher, LocalContentStore};

/// Pipeline fixture: id `foo`, primary command `cmd`.
pub(crate) fn test_pipeline(cmd: Vec<String>) -> PipelineSpec {
    PipelineSpec {
        id: PipelineId::new("foo"),
        name: "foo".into(),
        version: 1,
        transform: TransformSpec {
            cmd,
            err_cmd: vec![],
            env: BTreeMap::new(),
            working_dir: None,
        },
        resources: ResourceSpec::default(),
        datum_timeout_secs: None,
        job_timeout_secs: None,
    }
}

/// Fetcher that records calls and writes one marker file per checkout.
/// URLs containing `missing` fail, for error-path tests.
pub(crate) struct StubFetcher {
    calls: Mutex<Vec<(String, String)>>,
}

impl StubFetcher {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, url: &str, reference: &str, dst: &Path) -> anyhow::Result<u64> {
        if url.contains("missing") {
            anyhow::bail!("repository not found: {url}");
        }
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), reference.to_string()));
        let marker = dst.join("CHECKOUT");
        tokio::fs::write(&marker, reference.as_bytes()).await?;
        Ok(reference.len() as u64)
    }
}

pub(crate) fn build_driver(
    base: &Path,
    pipeline: PipelineSpec,
    content_store: LocalContentStore,
    fetcher: Arc<dyn Fetcher>,
) -> Driver {
    Driver::new(
        Arc::new(pipeline),
        Arc::new(CoordStore::in_memory().unwrap()),
        Arc::new(NoopProvisioner),
        Arc::new(content_store),
        fetcher,
        base.join("work"),
    )
}

/// Driver over `<base>/content` and `<base>/work` with a trivial pipeline.
pub(crate) fn test_driver(base: &Path) -> Driver {
    test_driver_with_pipeline(base, test_pipeline(vec!["true".into()]))
}

pub(crate) fn test_driver_with_pipeline(base: &Path, pipeline: PipelineSpec) -> Driver {
    build_driver(
        base,
        pipeline,
        LocalContentStore::new(base.join("content")),
        Arc::new(StubFetcher::new()),
    )
}

pub(crate) fn test_driver_with_store(base: &Path, content_store: LocalContentStore) -> Driver {
    build_driver(
        base,
        test_pipeline(vec!["true".into()]),
        content_store,
        Arc::new(StubFetcher::new()),
    )
}

pub(crate) fn test_driver_with_fetcher(base: &Path, fetcher: Arc<StubFetcher>) -> Driver {
    build_driver(
        base,
        test_pipeline(vec!["true".into()]),
        LocalContentStore::new(base.join("content")),
        fetcher,
    )
}

/// Write `<base>/content/<repo>/<name>` with `contents`.
pub(crate) fn seed_repo_file(base: &Path, repo: &str, name: &str, contents: &[u8]) {
    let repo_dir = base.join("content").join(repo);
    std::fs::create_dir_all(&repo_dir).unwrap();
    std::fs::write(repo_dir.join(name), contents).unwrap();
}
