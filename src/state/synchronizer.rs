use async_trait::async_trait;
use ethers::types::{Filter, Log, ValueOrArray};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use super::{log_position, sort_logs, BlockCursor, EventSource, LogSubscriber, SyncError, TrackedContract};
use crate::cache_store::{get_or_compute, CacheStore};
use crate::chain::ChainClient;
use crate::metrics;
use crate::settings::Settings;

/// Tunables for one synchronizer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Snapshots kept per contract; older blocks fall back to reconstruction.
    pub max_history_blocks: usize,
    pub init_retry_base: Duration,
    pub init_retry_max: Duration,
    pub init_max_retries: usize,
    /// Memoise reconstructions in the cache store for this long. `None` disables it.
    pub state_cache_ttl: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_history_blocks: 64,
            init_retry_base: Duration::from_millis(200),
            init_retry_max: Duration::from_secs(5),
            init_max_retries: 5,
            state_cache_ttl: None,
        }
    }
}

impl SyncConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let state = &settings.state;
        Self {
            max_history_blocks: state.max_history_blocks.max(1),
            init_retry_base: Duration::from_millis(state.init_retry_base_ms),
            init_retry_max: Duration::from_millis(state.init_retry_max_ms),
            init_max_retries: state.init_max_retries,
            state_cache_ttl: (state.state_cache_ttl_secs > 0)
                .then(|| Duration::from_secs(state.state_cache_ttl_secs)),
        }
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        // Doubles from the base delay: 2^n * (base / 2).
        let factor = (self.init_retry_base.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.init_retry_max)
            .take(self.init_max_retries)
    }
}

struct SnapshotHistory<S> {
    snapshots: BTreeMap<u64, Arc<S>>,
    cursor: Option<BlockCursor>,
    dropped_before_init: u64,
}

impl<S> SnapshotHistory<S> {
    fn latest(&self) -> Option<&Arc<S>> {
        self.snapshots.values().next_back()
    }

    fn prune(&mut self, max_history: usize) {
        while self.snapshots.len() > max_history {
            if let Some(oldest) = self.snapshots.keys().next().copied() {
                self.snapshots.remove(&oldest);
            }
        }
    }
}

/// Per-contract snapshot history advanced by log folding.
///
/// Holds an ordered map `block -> Arc<State>` plus a cursor marking how far the
/// history is known good. Snapshots are immutable: every applied log produces
/// a new state value, and readers hold `Arc`s that stay valid after pruning.
pub struct StateSynchronizer<E: EventSource> {
    source: Arc<E>,
    chain: Arc<dyn ChainClient>,
    cache: Option<Arc<dyn CacheStore>>,
    config: SyncConfig,
    history: RwLock<SnapshotHistory<E::State>>,
}

impl<E: EventSource> StateSynchronizer<E> {
    pub fn new(source: Arc<E>, chain: Arc<dyn ChainClient>, config: SyncConfig) -> Self {
        Self {
            source,
            chain,
            cache: None,
            config,
            history: RwLock::new(SnapshotHistory {
                snapshots: BTreeMap::new(),
                cursor: None,
                dropped_before_init: 0,
            }),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn source(&self) -> &Arc<E> {
        &self.source
    }

    fn label(&self) -> &str {
        &self.source.contract().source_key
    }

    /// Full reconstruction at `block_number`, memoised in the cache store when configured.
    async fn generate(&self, block_number: u64) -> anyhow::Result<E::State> {
        match (&self.cache, self.config.state_cache_ttl) {
            (Some(cache), Some(ttl)) => {
                let key = format!(
                    "state:{}:{:?}:{}",
                    self.label(),
                    self.source.contract().address,
                    block_number
                );
                get_or_compute(cache.as_ref(), &key, ttl, || self.source.generate_state(block_number)).await
            }
            _ => self.source.generate_state(block_number).await,
        }
    }

    async fn reconstruct(&self, block_number: u64) -> Result<E::State, SyncError> {
        let address = self.source.contract().address;
        let attempt = move || async move {
            let result = self.generate(block_number).await;
            if let Err(e) = &result {
                warn!(
                    "[{}] State reconstruction for {:?} at block {} failed, retrying: {}",
                    self.label(),
                    address,
                    block_number,
                    e
                );
            }
            result
        };
        match Retry::spawn(self.config.retry_strategy(), attempt).await {
            Ok(state) => {
                metrics::increment_reconstruction(self.label(), "ok");
                Ok(state)
            }
            Err(e) => {
                metrics::increment_reconstruction(self.label(), "error");
                Err(SyncError::Reconstruction {
                    address,
                    block: block_number,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Cold start: reconstructs the state at `block_number` and makes it the
    /// only snapshot. Retries with backoff before giving up.
    pub async fn initialize(&self, block_number: u64) -> Result<(), SyncError> {
        let state = Arc::new(self.reconstruct(block_number).await?);
        let mut history = self.history.write().await;
        history.snapshots.clear();
        history.snapshots.insert(block_number, state);
        history.cursor = Some(BlockCursor::at_block(block_number));
        info!(
            "[{}] Initialized state for {:?} at block {} ({} logs seen before init were ignored)",
            self.label(),
            self.source.contract().address,
            block_number,
            history.dropped_before_init
        );
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.history.read().await.cursor.is_some()
    }

    pub async fn cursor(&self) -> Option<BlockCursor> {
        self.history.read().await.cursor
    }

    /// Logs received before initialization, which were ignored.
    pub async fn dropped_before_init(&self) -> u64 {
        self.history.read().await.dropped_before_init
    }

    pub async fn snapshot_blocks(&self) -> Vec<u64> {
        self.history.read().await.snapshots.keys().copied().collect()
    }

    /// Folds a single log. Returns `Ok(true)` if the log changed the state.
    ///
    /// Logs received before initialization, logs at or before the cursor and
    /// logs the decoder does not know are ignored. Undecodable logs are
    /// skipped with a warning and still advance the cursor.
    pub async fn apply_log(&self, log: &Log) -> Result<bool, SyncError> {
        let (block_number, log_index) = log_position(log)?;
        let mut history = self.history.write().await;
        let Some(cursor) = history.cursor else {
            history.dropped_before_init += 1;
            metrics::increment_logs_dropped(self.label(), "uninitialized");
            debug!("[{}] Ignoring log at {}:{} before initialization", self.label(), block_number, log_index);
            return Ok(false);
        };
        if !cursor.admits(block_number, log_index) {
            metrics::increment_logs_dropped(self.label(), "stale");
            debug!("[{}] Ignoring already applied log at {}:{}", self.label(), block_number, log_index);
            return Ok(false);
        }
        let Some(current) = history.latest().cloned() else {
            return Err(SyncError::NotInitialized(self.source.contract().address));
        };

        let changed = match self.source.decoder().apply(&current, log) {
            Ok(Some(next)) => {
                history.snapshots.insert(block_number, Arc::new(next));
                history.prune(self.config.max_history_blocks);
                metrics::increment_logs_applied(self.label(), 1);
                true
            }
            Ok(None) => false,
            Err(e) => {
                metrics::increment_logs_dropped(self.label(), "undecodable");
                warn!("[{}] Skipping log at {}:{}: {}", self.label(), block_number, log_index, e);
                false
            }
        };
        history.cursor = Some(BlockCursor::at_log(block_number, log_index));
        Ok(changed)
    }

    /// Folds every log of `block_number` (already in log-index order) and marks
    /// the block as complete. Returns how many logs changed the state.
    pub async fn apply_block_logs(&self, block_number: u64, logs: &[Log]) -> Result<usize, SyncError> {
        let mut history = self.history.write().await;
        let Some(cursor) = history.cursor else {
            history.dropped_before_init += logs.len() as u64;
            return Ok(0);
        };
        if cursor.covers(block_number) {
            return Ok(0);
        }
        let Some(mut state) = history.latest().cloned() else {
            return Err(SyncError::NotInitialized(self.source.contract().address));
        };

        let mut applied = 0usize;
        for log in logs {
            let (log_block, log_index) = log_position(log)?;
            if log_block != block_number || !cursor.admits(log_block, log_index) {
                continue;
            }
            match self.source.decoder().apply(&state, log) {
                Ok(Some(next)) => {
                    state = Arc::new(next);
                    applied += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    metrics::increment_logs_dropped(self.label(), "undecodable");
                    warn!("[{}] Skipping log at {}:{}: {}", self.label(), log_block, log_index, e);
                }
            }
        }

        if applied > 0 {
            history.snapshots.insert(block_number, state);
            history.prune(self.config.max_history_blocks);
            metrics::increment_logs_applied(self.label(), applied as u64);
        }
        history.cursor = Some(BlockCursor::at_block(block_number));
        Ok(applied)
    }

    /// Snapshot in effect at the end of `block_number`, if the history covers it.
    pub async fn state_at(&self, block_number: u64) -> Option<Arc<E::State>> {
        let history = self.history.read().await;
        let cursor = history.cursor?;
        if !cursor.covers(block_number) {
            return None;
        }
        history
            .snapshots
            .range(..=block_number)
            .next_back()
            .map(|(_, state)| state.clone())
    }

    /// Returns the cached state for `block_number`, or reconstructs it.
    ///
    /// A reconstruction past the cursor becomes the newest snapshot; older
    /// reconstructions are returned without touching the history.
    pub async fn get_state_or_generate(&self, block_number: u64, force: bool) -> Result<Arc<E::State>, SyncError> {
        if !force {
            if let Some(state) = self.state_at(block_number).await {
                return Ok(state);
            }
        }

        let state = Arc::new(self.reconstruct(block_number).await?);
        let mut history = self.history.write().await;
        let advances = history
            .cursor
            .map_or(true, |cursor| block_number > cursor.block_number);
        if advances {
            history.snapshots.insert(block_number, state.clone());
            history.prune(self.config.max_history_blocks);
            history.cursor = Some(BlockCursor::at_block(block_number));
        }
        Ok(state)
    }

    /// Discards every snapshot above `common_ancestor`.
    ///
    /// If nothing at or below the ancestor survives, the synchronizer returns
    /// to the uninitialized state and needs a new cold start.
    pub async fn rollback(&self, common_ancestor: u64) -> usize {
        let mut history = self.history.write().await;
        let discarded = history.snapshots.split_off(&(common_ancestor + 1)).len();
        let behind_cursor = history
            .cursor
            .map_or(false, |cursor| cursor.block_number > common_ancestor);
        if behind_cursor {
            history.cursor = if history.snapshots.is_empty() {
                None
            } else {
                Some(BlockCursor::at_block(common_ancestor))
            };
        }
        if discarded > 0 || behind_cursor {
            warn!(
                "[{}] Rolled back {:?} to block {} ({} snapshots discarded)",
                self.label(),
                self.source.contract().address,
                common_ancestor,
                discarded
            );
        }
        discarded
    }

    /// Fetches and folds the contract's logs from the cursor up to `to_block`.
    pub async fn replay(&self, to_block: u64) -> anyhow::Result<usize> {
        let Some(cursor) = self.cursor().await else {
            return Err(SyncError::NotInitialized(self.source.contract().address).into());
        };
        let from_block = match cursor.log_index {
            Some(_) => cursor.block_number,
            None => cursor.block_number + 1,
        };
        if from_block > to_block {
            return Ok(0);
        }

        let contract = self.source.contract();
        let filter = Filter::new()
            .address(ValueOrArray::Value(contract.address))
            .topic0(ValueOrArray::Array(contract.topics.iter().map(|t| Some(*t)).collect()))
            .from_block(from_block)
            .to_block(to_block);
        let mut logs = self.chain.get_logs(&filter).await?;
        sort_logs(&mut logs);

        let mut by_block: BTreeMap<u64, Vec<Log>> = BTreeMap::new();
        for log in logs {
            let (block_number, _) = log_position(&log)?;
            by_block.entry(block_number).or_default().push(log);
        }

        let mut applied = 0;
        for block_number in from_block..=to_block {
            let logs = by_block.remove(&block_number).unwrap_or_default();
            applied += self.apply_block_logs(block_number, &logs).await?;
        }
        debug!(
            "[{}] Replayed blocks {}..={} for {:?}: {} logs applied",
            self.label(),
            from_block,
            to_block,
            contract.address,
            applied
        );
        Ok(applied)
    }
}

#[async_trait]
impl<E: EventSource> LogSubscriber for StateSynchronizer<E> {
    fn contract(&self) -> &TrackedContract {
        self.source.contract()
    }

    async fn is_initialized(&self) -> bool {
        StateSynchronizer::is_initialized(self).await
    }

    async fn initialize(&self, block_number: u64) -> anyhow::Result<()> {
        StateSynchronizer::initialize(self, block_number).await?;
        Ok(())
    }

    async fn on_block_logs(&self, block_number: u64, logs: &[Log]) -> anyhow::Result<()> {
        // Initialized behind the dispatcher: catch up on the blocks in between.
        if let Some(cursor) = self.cursor().await {
            if block_number > cursor.block_number + 1 {
                self.replay(block_number - 1).await?;
            }
        }
        self.apply_block_logs(block_number, logs).await?;
        Ok(())
    }

    async fn on_reorg(&self, common_ancestor: u64) -> usize {
        self.rollback(common_ancestor).await
    }
}
