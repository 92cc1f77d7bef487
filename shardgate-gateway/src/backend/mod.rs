pub mod http_node;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use rand::Rng;
use tracing::{info, warn};

use shardgate_common::backend::ChunkBackend;
use shardgate_common::placement;
use shardgate_common::records::FileId;
use shardgate_storage::store::DirectoryStore;

use crate::config::BackendConfig;

use self::http_node::HttpNodeBackend;

/// Construct a backend from its configuration entry.
pub fn from_config(config: &BackendConfig, client: &reqwest::Client) -> Arc<dyn ChunkBackend> {
    match config {
        BackendConfig::Http { url } => Arc::new(HttpNodeBackend::new(url.clone(), client.clone())),
        BackendConfig::Directory { path } => Arc::new(DirectoryStore::new(path.clone())),
    }
}

/// The ordered, fixed list of backends chunks are spread over.
///
/// Order matters: a chunk's placement is its index in this list.
#[derive(Clone)]
pub struct BackendSet {
    backends: Arc<[Arc<dyn ChunkBackend>]>,
    count: NonZeroUsize,
}

impl BackendSet {
    pub fn new(backends: Vec<Arc<dyn ChunkBackend>>) -> anyhow::Result<Self> {
        let Some(count) = NonZeroUsize::new(backends.len()) else {
            bail!("at least one storage backend is required");
        };
        Ok(Self { backends: backends.into(), count })
    }

    pub fn len(&self) -> NonZeroUsize {
        self.count
    }

    pub fn route(&self, file_id: &FileId, chunk_index: u32) -> usize {
        placement::route(file_id.as_str(), chunk_index, self.count)
    }

    /// Resolve the backend a chunk is placed on.
    pub fn for_chunk(&self, file_id: &FileId, chunk_index: u32) -> (usize, &Arc<dyn ChunkBackend>) {
        let index = self.route(file_id, chunk_index);
        (index, &self.backends[index])
    }

    /// Uniformly random backend. Only for health probes; never used to place data.
    pub fn pick_random(&self) -> (usize, &Arc<dyn ChunkBackend>) {
        let index = rand::thread_rng().gen_range(0..self.count.get());
        (index, &self.backends[index])
    }

    /// Probe every backend until all answer, retrying with a fixed delay.
    pub async fn wait_until_reachable(&self, attempts: u32, delay: Duration) -> anyhow::Result<()> {
        for (index, backend) in self.backends.iter().enumerate() {
            let mut attempt = 1;
            loop {
                match backend.health_check().await {
                    Ok(()) => {
                        info!(backend = index, endpoint = %backend.describe(), "Backend reachable");
                        break;
                    }
                    Err(e) if attempt < attempts => {
                        warn!(
                            backend = index,
                            endpoint = %backend.describe(),
                            attempt,
                            error = %e,
                            "Backend not reachable yet, retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        bail!(
                            "backend {} ({}) unreachable after {} attempts: {}",
                            index,
                            backend.describe(),
                            attempts,
                            e
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
