use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::Serialize;

use crate::{
    buffer::StreamReader,
    config::{ChannelConfig, EngineConfig},
    error::{RestreamError, RestreamResult},
    fetcher::SegmentFetcher,
    util::http::HttpClient,
    worker::{ChannelState, ChannelStatus, ChannelWorker},
    SegmentSource,
};

/// Builds the segment source of a channel.
pub type SourceFactory<S> = Arc<dyn Fn(&ChannelConfig) -> RestreamResult<S> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_channels: usize,
    pub running_channels: usize,
    pub live_channels: usize,
    pub error_channels: usize,
    pub total_segments: u64,
    pub total_errors: u64,
    pub total_clients: usize,
}

/// Outcome of [ChannelRegistry::reload].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    pub failed: Vec<String>,
}

/// Every channel of the process, keyed by id.
pub struct ChannelRegistry<S = SegmentFetcher> {
    engine: Arc<EngineConfig>,
    factory: SourceFactory<S>,
    channels: RwLock<BTreeMap<String, Arc<ChannelWorker<S>>>>,
}

impl ChannelRegistry<SegmentFetcher> {
    /// Registry whose channels fetch from their CDN with a shared client.
    pub fn http(engine: EngineConfig, client: HttpClient) -> Self {
        let engine = Arc::new(engine);
        let factory_engine = engine.clone();
        Self::new(
            engine,
            Arc::new(move |config: &ChannelConfig| {
                SegmentFetcher::new(client.clone(), config, &factory_engine)
            }),
        )
    }
}

impl<S: SegmentSource> ChannelRegistry<S> {
    pub fn new(engine: Arc<EngineConfig>, factory: SourceFactory<S>) -> Self {
        Self {
            engine,
            factory,
            channels: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Worker of a channel.
    pub fn worker(&self, id: &str) -> RestreamResult<Arc<ChannelWorker<S>>> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| RestreamError::ChannelNotFound(id.to_string()))
    }

    /// Register a channel. A registered channel with a different configuration is
    /// replaced and its worker stopped. Returns whether anything changed.
    pub async fn add(&self, config: ChannelConfig) -> RestreamResult<bool> {
        let previous = {
            let mut channels = self.write();
            if channels
                .get(&config.id)
                .is_some_and(|existing| existing.config() == &config)
            {
                return Ok(false);
            }
            let worker = self.create(config.clone())?;
            channels.insert(config.id, worker)
        };

        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(true)
    }

    /// Unregister a channel and stop its worker.
    pub async fn remove(&self, id: &str) -> RestreamResult<ChannelStatus> {
        let worker = self
            .write()
            .remove(id)
            .ok_or_else(|| RestreamError::ChannelNotFound(id.to_string()))?;
        Ok(worker.stop().await)
    }

    /// Start a channel. A stopped channel is started with a fresh worker.
    pub fn start(&self, id: &str) -> RestreamResult<ChannelStatus> {
        let worker = self.worker(id)?;
        if worker.state() != ChannelState::Stopped {
            return Ok(worker.start());
        }

        let worker = {
            let mut channels = self.write();
            let current = channels
                .get(id)
                .ok_or_else(|| RestreamError::ChannelNotFound(id.to_string()))?;
            if current.state() == ChannelState::Stopped {
                let fresh = self.create(current.config().clone())?;
                channels.insert(id.to_string(), fresh.clone());
                fresh
            } else {
                current.clone()
            }
        };
        Ok(worker.start())
    }

    pub async fn stop(&self, id: &str) -> RestreamResult<ChannelStatus> {
        let worker = self.worker(id)?;
        Ok(worker.stop().await)
    }

    pub async fn restart(&self, id: &str) -> RestreamResult<ChannelStatus> {
        let worker = self.worker(id)?;
        if worker.state() == ChannelState::Stopped {
            return self.start(id);
        }
        Ok(worker.restart().await)
    }

    pub fn status(&self, id: &str) -> RestreamResult<ChannelStatus> {
        Ok(self.worker(id)?.status())
    }

    /// Status of every channel, ordered by id.
    pub fn list_all(&self) -> Vec<ChannelStatus> {
        self.workers().iter().map(|w| w.status()).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        self.list_all()
            .into_iter()
            .fold(RegistryStats::default(), |mut stats, status| {
                stats.total_channels += 1;
                stats.running_channels += status.running as usize;
                stats.live_channels += (status.state == ChannelState::Live) as usize;
                stats.error_channels += (status.state == ChannelState::Error) as usize;
                stats.total_segments += status.segments;
                stats.total_errors += status.errors;
                stats.total_clients += status.clients;
                stats
            })
    }

    /// Attach a viewer to a channel.
    pub fn open_reader(&self, id: &str) -> RestreamResult<StreamReader> {
        self.worker(id)?.open_reader()
    }

    /// Reconcile the registry with a new channel list: add new channels, replace
    /// changed ones and remove the ones no longer listed.
    pub async fn reload(&self, configs: Vec<ChannelConfig>, autostart: bool) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let listed: HashSet<String> = configs.iter().map(|c| c.id.clone()).collect();

        let stale: Vec<String> = self
            .read()
            .keys()
            .filter(|id| !listed.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if self.remove(&id).await.is_ok() {
                summary.removed.push(id);
            }
        }

        for config in configs {
            let id = config.id.clone();
            let existed = self.read().contains_key(&id);
            match self.add(config).await {
                Ok(false) => summary.unchanged += 1,
                Ok(true) => {
                    if autostart {
                        if let Err(e) = self.start(&id) {
                            tracing::warn!(channel = %id, "Failed to start channel: {e}");
                        }
                    }
                    if existed {
                        summary.updated.push(id);
                    } else {
                        summary.added.push(id);
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = %id, "Skipping channel: {e}");
                    summary.failed.push(id);
                }
            }
        }

        tracing::info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            unchanged = summary.unchanged,
            failed = summary.failed.len(),
            "Channel list reloaded"
        );
        summary
    }

    /// Stop every channel.
    pub async fn shutdown(&self) {
        let workers = self.workers();
        tracing::info!(channels = workers.len(), "Stopping all channels");
        futures::future::join_all(workers.iter().map(|w| w.stop())).await;
    }

    fn create(&self, config: ChannelConfig) -> RestreamResult<Arc<ChannelWorker<S>>> {
        let source = (self.factory)(&config)?;
        Ok(Arc::new(ChannelWorker::new(
            config,
            self.engine.clone(),
            source,
        )))
    }

    fn workers(&self) -> Vec<Arc<ChannelWorker<S>>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<ChannelWorker<S>>>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<ChannelWorker<S>>>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}
