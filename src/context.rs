use std::sync::Arc;

use crate::cache::BoundedRandomCache;
use crate::config::Settings;
use crate::lock::AsyncLock;
use crate::meow::Upstream;
use crate::queue::Queues;
use crate::snapshot::LatestSnapshot;

/// State shared by every worker of one process.
///
/// Built once in `main` and cloned into each worker; clones share the same
/// caches, locks and queues. Tests build as many independent contexts as
/// they like.
#[derive(Clone)]
pub struct SharedContext {
    pub settings: Arc<Settings>,
    pub cats: AsyncLock<BoundedRandomCache<Arc<Vec<u8>>>>,
    pub facts: AsyncLock<BoundedRandomCache<String>>,
    pub latest: AsyncLock<LatestSnapshot>,
    pub queues: Queues,
    pub upstream: Arc<dyn Upstream>,
}

impl SharedContext {
    pub fn new(settings: Settings, upstream: Arc<dyn Upstream>) -> Self {
        let limit = settings.cache_limit;
        Self {
            settings: Arc::new(settings),
            cats: AsyncLock::new("cats", BoundedRandomCache::new("photo", limit)),
            facts: AsyncLock::new("facts", BoundedRandomCache::new("fact", limit)),
            latest: AsyncLock::new("latest", LatestSnapshot::default()),
            queues: Queues::new(),
            upstream,
        }
    }
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedContext")
            .field("settings", &self.settings)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}
