//! Lắng nghe sự kiện của vendor contract
//!
//! Polls the node for new blocks, fetches vendor logs in block order,
//! decodes them and pushes them onto the event queue. Node errors back off
//! exponentially (capped at one minute) and the block cursor only moves
//! forward once a range has been fetched in full.

use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Log, H256};
use metrics::increment_counter;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::error::RelayResult;
use crate::events::EventCodec;
use crate::queue::EventQueue;

/// Largest block span fetched in one `eth_getLogs` call
const MAX_BLOCK_RANGE: u64 = 2_000;

/// Cap for the backoff between failed polls
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Where vendor logs come from
#[async_trait]
pub trait VendorLogSource: Send + Sync {
    /// Latest block number on the node
    async fn latest_block(&self) -> RelayResult<u64>;

    /// Vendor contract logs whose topic0 is one of `topics`, inclusive block range
    async fn vendor_logs(&self, topics: &[H256], from_block: u64, to_block: u64) -> RelayResult<Vec<Log>>;
}

/// Polling listener feeding the event queue
pub struct EventListener {
    source: Arc<dyn VendorLogSource>,
    codec: EventCodec,
    queue: EventQueue,
    poll_interval: Duration,
    /// Next block to scan; None until the first poll when no start block is configured
    next_block: Option<u64>,
}

impl EventListener {
    pub fn new(
        source: Arc<dyn VendorLogSource>,
        codec: EventCodec,
        queue: EventQueue,
        start_block: Option<u64>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            codec,
            queue,
            poll_interval,
            next_block: start_block,
        }
    }

    /// Next block the listener will scan
    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    /// Scan new blocks once and enqueue what was found; returns the number of events queued
    pub async fn poll_once(&mut self) -> RelayResult<usize> {
        let latest = self.source.latest_block().await?;
        let from = match self.next_block {
            Some(block) => block,
            None => {
                info!("Starting event scan at latest block {}", latest);
                self.next_block = Some(latest);
                latest
            }
        };
        if from > latest {
            return Ok(0);
        }

        let topics = self.codec.topics();
        let mut queued = 0;
        let mut cursor = from;
        while cursor <= latest {
            let to = min(latest, cursor.saturating_add(MAX_BLOCK_RANGE - 1));
            let mut logs = self.source.vendor_logs(&topics, cursor, to).await?;
            logs.sort_by_key(|l| (l.block_number, l.transaction_index, l.log_index));

            for log in &logs {
                match self.codec.decode(log) {
                    Ok(event) => {
                        increment_counter!("relay_events_received_total", "kind" => event.event.kind());
                        self.queue.enqueue(event);
                        queued += 1;
                    }
                    Err(e) => {
                        warn!(
                            "Skipping log in tx {:?} at block {:?}: {}",
                            log.transaction_hash, log.block_number, e
                        );
                        increment_counter!("relay_events_rejected_total", "reason" => e.kind());
                    }
                }
            }

            debug!("Scanned blocks {}..={}: {} logs", cursor, to, logs.len());
            cursor = to + 1;
            self.next_block = Some(cursor);
        }
        Ok(queued)
    }

    /// Poll until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Event listener started (poll every {:?})", self.poll_interval);
        let mut error_count: u32 = 0;

        loop {
            let wait = match self.poll_once().await {
                Ok(n) => {
                    if n > 0 {
                        info!("Queued {} vendor events", n);
                    }
                    error_count = 0;
                    self.poll_interval
                }
                Err(e) => {
                    error_count = error_count.saturating_add(1);
                    let backoff = min(
                        Duration::from_secs(2u64.saturating_pow(error_count.min(6))),
                        MAX_BACKOFF,
                    );
                    error!("Event poll failed (#{}): {}, retrying in {:?}", error_count, e, backoff);
                    backoff
                }
            };

            tokio::select! {
                _ = time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Event listener stopped at block {:?}", self.next_block);
    }
}
