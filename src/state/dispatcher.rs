use anyhow::Result;
use dashmap::DashMap;
use ethers::types::{Address, Filter, Log, ValueOrArray, H256};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use super::{log_position, sort_logs, LogSubscriber};
use crate::chain::{BlockHeader, ChainClient};
use crate::metrics;

const MAX_ADDRESSES_PER_REQUEST: usize = 500;

/// What one call to [`BlockLogDispatcher::process_block`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// First block whose logs were delivered; `None` if the block was already processed.
    pub from_block: Option<u64>,
    pub to_block: u64,
    pub logs: usize,
    /// Common ancestor the subscribers were rolled back to.
    pub reorged_to: Option<u64>,
    pub failed_subscribers: usize,
}

/// Follows the canonical chain and fans each block's logs out to the
/// subscribed contracts.
///
/// Blocks are processed one at a time; within a block, subscribers run
/// concurrently and a failing subscriber never affects the others. A block
/// whose parent hash disagrees with the recorded hash of the previous block
/// triggers a walk back to the common ancestor, a rollback of every
/// subscriber, and a replay of the replaced range.
pub struct BlockLogDispatcher {
    chain: Arc<dyn ChainClient>,
    subscribers: DashMap<(Address, String), Arc<dyn LogSubscriber>>,
    /// Recently processed canonical hashes, by block number.
    recent: Mutex<BTreeMap<u64, H256>>,
    max_tracked_blocks: usize,
}

impl BlockLogDispatcher {
    pub fn new(chain: Arc<dyn ChainClient>, max_tracked_blocks: usize) -> Self {
        Self {
            chain,
            subscribers: DashMap::new(),
            recent: Mutex::new(BTreeMap::new()),
            max_tracked_blocks: max_tracked_blocks.max(2),
        }
    }

    /// Adds (or replaces) the subscriber for its contract and source.
    pub fn subscribe(&self, subscriber: Arc<dyn LogSubscriber>) {
        let contract = subscriber.contract();
        let key = (contract.address, contract.source_key.clone());
        if self.subscribers.insert(key, subscriber).is_none() {
            debug!("Dispatcher now tracking {} contracts", self.subscribers.len());
        }
    }

    pub fn unsubscribe(&self, address: Address, source_key: &str) -> bool {
        self.subscribers
            .remove(&(address, source_key.to_string()))
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn snapshot_subscribers(&self) -> Vec<Arc<dyn LogSubscriber>> {
        self.subscribers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Cold-starts every uninitialized subscriber at `block_number`. Returns
    /// the number that failed.
    pub async fn initialize_all(&self, block_number: u64) -> usize {
        let subscribers = self.snapshot_subscribers();
        let results = join_all(subscribers.iter().map(|subscriber| async move {
            if subscriber.is_initialized().await {
                return Ok(());
            }
            subscriber.initialize(block_number).await
        }))
        .await;

        let mut failed = 0;
        for (subscriber, result) in subscribers.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                error!(
                    "[{}] Failed to initialize {:?} at block {}: {}",
                    subscriber.contract().source_key,
                    subscriber.contract().address,
                    block_number,
                    e
                );
            }
        }
        failed
    }

    /// Processes a new head. Fills any gap since the last processed block and
    /// handles a reorg if the head does not extend the recorded chain.
    pub async fn process_block(&self, header: BlockHeader) -> Result<DispatchReport> {
        let mut recent = self.recent.lock().await;
        let mut report = DispatchReport {
            to_block: header.number,
            ..Default::default()
        };

        if recent.get(&header.number) == Some(&header.hash) {
            return Ok(report);
        }

        let from_block = match recent.keys().next_back().copied() {
            None => header.number,
            Some(last) => {
                let parent_known = header
                    .number
                    .checked_sub(1)
                    .and_then(|parent| recent.get(&parent).copied());
                let diverged = header.number <= last
                    || parent_known.map_or(false, |parent_hash| parent_hash != header.parent_hash);
                // A head past a gap says nothing about `last`; ask the chain.
                let stale_tip = !diverged && header.number > last + 1 && !self.is_canonical(&recent, last).await?;
                if diverged || stale_tip {
                    let start = header.number.saturating_sub(1).min(last);
                    let ancestor = self.find_common_ancestor(&recent, start).await?;
                    warn!(
                        "Reorg detected at block {} (parent {:?}), rolling back to {}",
                        header.number, header.parent_hash, ancestor
                    );
                    metrics::increment_reorgs();
                    self.rollback_subscribers(ancestor).await;
                    recent.retain(|&number, _| number <= ancestor);
                    report.reorged_to = Some(ancestor);
                    ancestor + 1
                } else {
                    (last + 1).min(header.number)
                }
            }
        };

        let (logs, failed) = self.dispatch_range(from_block, header.number).await?;
        report.from_block = Some(from_block);
        report.logs = logs;
        report.failed_subscribers = failed;

        recent.insert(header.number, header.hash);
        while recent.len() > self.max_tracked_blocks {
            if let Some(oldest) = recent.keys().next().copied() {
                recent.remove(&oldest);
            }
        }
        Ok(report)
    }

    /// Rolls every subscriber back to `common_ancestor` on an externally
    /// detected reorg. The next processed block replays from there.
    pub async fn notify_reorg(&self, common_ancestor: u64) {
        let mut recent = self.recent.lock().await;
        metrics::increment_reorgs();
        self.rollback_subscribers(common_ancestor).await;
        recent.retain(|&number, _| number <= common_ancestor);
        if recent.is_empty() {
            if let Ok(Some(header)) = self.chain.block_header(common_ancestor).await {
                recent.insert(common_ancestor, header.hash);
            }
        }
    }

    async fn rollback_subscribers(&self, common_ancestor: u64) {
        let subscribers = self.snapshot_subscribers();
        let discarded: usize = join_all(subscribers.iter().map(|s| s.on_reorg(common_ancestor)))
            .await
            .into_iter()
            .sum();
        info!(
            "Rolled back {} subscribers to block {} ({} snapshots discarded)",
            subscribers.len(),
            common_ancestor,
            discarded
        );
    }

    async fn is_canonical(&self, recent: &BTreeMap<u64, H256>, number: u64) -> Result<bool> {
        let canonical = self.chain.block_header(number).await?;
        Ok(canonical.map(|header| header.hash) == recent.get(&number).copied())
    }

    /// Walks back from `start` to the highest recorded block whose hash still
    /// matches the canonical chain.
    async fn find_common_ancestor(&self, recent: &BTreeMap<u64, H256>, start: u64) -> Result<u64> {
        for (&number, known_hash) in recent.range(..=start).rev() {
            match self.chain.block_header(number).await? {
                Some(canonical) if canonical.hash == *known_hash => return Ok(number),
                _ => continue,
            }
        }
        let deepest = recent.keys().next().copied().unwrap_or(start);
        warn!(
            "Reorg deeper than the {} tracked blocks, rolling back to {}",
            recent.len(),
            deepest.saturating_sub(1)
        );
        Ok(deepest.saturating_sub(1))
    }

    /// Fetches the range's logs once for all subscribers and delivers them per
    /// block. Returns (logs fetched, subscribers that failed).
    async fn dispatch_range(&self, from_block: u64, to_block: u64) -> Result<(usize, usize)> {
        let subscribers = self.snapshot_subscribers();
        if subscribers.is_empty() {
            return Ok((0, 0));
        }

        let addresses: BTreeSet<Address> = subscribers.iter().map(|s| s.contract().address).collect();
        let topics: BTreeSet<H256> = subscribers
            .iter()
            .flat_map(|s| s.contract().topics.iter().copied())
            .collect();
        let addresses: Vec<Address> = addresses.into_iter().collect();

        let mut logs = Vec::new();
        for chunk in addresses.chunks(MAX_ADDRESSES_PER_REQUEST) {
            let filter = Filter::new()
                .address(ValueOrArray::Array(chunk.to_vec()))
                .topic0(ValueOrArray::Array(topics.iter().map(|t| Some(*t)).collect()))
                .from_block(from_block)
                .to_block(to_block);
            logs.extend(self.chain.get_logs(&filter).await?);
        }
        sort_logs(&mut logs);
        let total = logs.len();

        let mut by_address: HashMap<Address, Vec<Log>> = HashMap::new();
        for log in logs {
            by_address.entry(log.address).or_default().push(log);
        }

        let deliveries = subscribers.iter().map(|subscriber| {
            let contract = subscriber.contract();
            let mut per_block: BTreeMap<u64, Vec<Log>> = BTreeMap::new();
            if let Some(logs) = by_address.get(&contract.address) {
                for log in logs.iter().filter(|log| contract.tracks(log)) {
                    if let Ok((block_number, _)) = log_position(log) {
                        per_block.entry(block_number).or_default().push(log.clone());
                    }
                }
            }
            async move {
                for block_number in from_block..=to_block {
                    let logs = per_block.remove(&block_number).unwrap_or_default();
                    subscriber.on_block_logs(block_number, &logs).await?;
                }
                Ok::<(), anyhow::Error>(())
            }
        });

        let mut failed = 0;
        for (subscriber, result) in subscribers.iter().zip(join_all(deliveries).await) {
            if let Err(e) = result {
                failed += 1;
                error!(
                    "[{}] Failed to apply blocks {}..={} to {:?}: {}",
                    subscriber.contract().source_key,
                    from_block,
                    to_block,
                    subscriber.contract().address,
                    e
                );
            }
        }
        debug!(
            "Dispatched {} logs for blocks {}..={} to {} subscribers",
            total,
            from_block,
            to_block,
            subscribers.len()
        );
        Ok((total, failed))
    }

    /// Polls the chain head every `interval` and processes each new block
    /// until `shutdown` flips to true.
    pub async fn run_poller(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Block poller stopped");
                        return;
                    }
                    continue;
                }
            }

            let head = match self.chain.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!("Failed to read chain head: {}", e);
                    continue;
                }
            };
            match self.chain.block_header(head).await {
                Ok(Some(header)) => match self.process_block(header).await {
                    Ok(report) if report.reorged_to.is_some() || report.failed_subscribers > 0 => {
                        warn!("Block {} processed with issues: {:?}", head, report)
                    }
                    Ok(report) => debug!("Block {} processed: {} logs", head, report.logs),
                    Err(e) => error!("Failed to process block {}: {}", head, e),
                },
                Ok(None) => debug!("Block {} not available yet", head),
                Err(e) => warn!("Failed to read header {}: {}", head, e),
            }
        }
    }
}
