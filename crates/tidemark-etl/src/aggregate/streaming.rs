//! Bounded-memory streaming group-by
//!
//! At most `buffer_size` groups are resident in an LRU cache. A group leaves
//! the cache when it is evicted to make room for a new key, or when the input
//! ends, and is then emitted downstream through a bounded hand-off queue that
//! is drained after every input row.
//!
//! With ascending input and a merge that keeps the latest timestamp, groups
//! leave the cache in ascending timestamp order.

use futures::stream::{BoxStream, StreamExt};
use futures::FutureExt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use super::cache::EvictingCache;
use super::{FieldAggregation, Floors, InputClock, Pending, Transformer};
use crate::error::{EtlError, Result};
use crate::load::Staged;
use crate::progress::ProgressTicker;
use crate::row::{EtlRow, UntypedRow};

pub const DEFAULT_AGGREGATION_BUFFER: usize = 1000;

type KeyFn<R, K> = Arc<dyn Fn(&R) -> K + Send + Sync>;
type MergeFn<R> = Arc<dyn Fn(R, R) -> Result<R> + Send + Sync>;

pub struct StreamingAggregator<R, K> {
    name: String,
    buffer_size: NonZeroUsize,
    key: KeyFn<R, K>,
    merge: MergeFn<R>,
    progress_interval: Duration,
}

impl<R, K> Clone for StreamingAggregator<R, K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            buffer_size: self.buffer_size,
            key: self.key.clone(),
            merge: self.merge.clone(),
            progress_interval: self.progress_interval,
        }
    }
}

#[derive(Default)]
struct AggregationCounters {
    transformed: AtomicU64,
    emitted: AtomicU64,
}

impl AggregationCounters {
    /// `1 - emitted / transformed`, zero before any input
    fn ratio(&self) -> f64 {
        let transformed = self.transformed.load(Ordering::Relaxed);
        if transformed == 0 {
            return 0.0;
        }
        1.0 - self.emitted.load(Ordering::Relaxed) as f64 / transformed as f64
    }
}

impl<R, K> StreamingAggregator<R, K>
where
    R: EtlRow,
    K: Hash + Eq + Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        buffer_size: usize,
        key: impl Fn(&R) -> K + Send + Sync + 'static,
        merge: impl Fn(R, R) -> Result<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            buffer_size: NonZeroUsize::new(buffer_size).unwrap_or(NonZeroUsize::MIN),
            key: Arc::new(key),
            merge: Arc::new(merge),
            progress_interval: Duration::from_secs(10),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.get()
    }

    async fn run(
        self,
        group_id: String,
        mut input: BoxStream<'static, Result<R>>,
        output: mpsc::Sender<Result<Staged<R>>>,
    ) {
        let counters = Arc::new(AggregationCounters::default());
        let ticker = {
            let counters = counters.clone();
            let name = self.name.clone();
            let group_id = group_id.clone();
            ProgressTicker::start(self.progress_interval, move || {
                info!(
                    transformer = %name,
                    group_id = %group_id,
                    transformed = counters.transformed.load(Ordering::Relaxed),
                    emitted = counters.emitted.load(Ordering::Relaxed),
                    ratio = counters.ratio(),
                    "aggregation in progress"
                );
            })
        };

        // a panic in key or merge ends the stream with an error
        let outcome = AssertUnwindSafe(self.consume(&mut input, &output, &counters))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(EtlError::panicked(panic.as_ref())));
        ticker.stop();
        drop(input);

        match outcome {
            Ok(()) => info!(
                transformer = %self.name,
                group_id = %group_id,
                transformed = counters.transformed.load(Ordering::Relaxed),
                emitted = counters.emitted.load(Ordering::Relaxed),
                ratio = counters.ratio(),
                "aggregation finished"
            ),
            Err(e) => {
                error!(transformer = %self.name, group_id = %group_id, error = %e, "aggregation failed");
                let _ = output.send(Err(e)).await;
            }
        }
    }

    async fn consume(
        &self,
        input: &mut BoxStream<'static, Result<R>>,
        output: &mpsc::Sender<Result<Staged<R>>>,
        counters: &AggregationCounters,
    ) -> Result<()> {
        let capacity = self.buffer_size.get();
        let (hand_off, mut evicted) = mpsc::channel::<Pending<R>>(capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let mut cache = {
            let overflowed = overflowed.clone();
            EvictingCache::new(self.buffer_size, move |_key: K, group: Pending<R>| {
                if hand_off.try_send(group).is_err() {
                    overflowed.store(true, Ordering::SeqCst);
                }
            })
        };
        let mut floors = Floors::default();
        let mut clock = InputClock::new();

        while let Some(item) = input.next().await {
            let row = item?;
            clock.advance(row.timestamp())?;
            counters.transformed.fetch_add(1, Ordering::Relaxed);

            let key = (self.key)(&row);
            cache.compute(key, |group| match group {
                Some(Pending { row: current, floor }) => {
                    (self.merge)(current, row).map(|row| Pending { row, floor })
                }
                None => {
                    floors.hold(clock.floor());
                    Ok(Pending {
                        row,
                        floor: clock.floor(),
                    })
                }
            })?;

            if overflowed.load(Ordering::SeqCst) {
                return Err(EtlError::HandOffOverflow(capacity));
            }
            if !drain(&mut evicted, &mut floors, output, counters).await {
                debug!(transformer = %self.name, "downstream closed, stopping aggregation");
                return Ok(());
            }
        }

        cache.evict_all();
        if overflowed.load(Ordering::SeqCst) {
            return Err(EtlError::HandOffOverflow(capacity));
        }
        drain(&mut evicted, &mut floors, output, counters).await;
        Ok(())
    }
}

/// Forward everything queued in the hand-off. Returns false once downstream is gone.
///
/// Nothing touches the cache between an eviction and its drain, so the
/// floors left after releasing a group are those of the groups still held
/// back at the moment it was evicted.
async fn drain<R>(
    evicted: &mut mpsc::Receiver<Pending<R>>,
    floors: &mut Floors,
    output: &mpsc::Sender<Result<Staged<R>>>,
    counters: &AggregationCounters,
) -> bool {
    while let Ok(group) = evicted.try_recv() {
        floors.release(group.floor);
        if output.send(Ok(Staged::new(group.row, floors.settled()))).await.is_err() {
            return false;
        }
        counters.emitted.fetch_add(1, Ordering::Relaxed);
    }
    true
}

impl StreamingAggregator<UntypedRow, String> {
    /// Aggregator over named fields of untyped rows
    pub fn untyped(name: impl Into<String>, aggregation: FieldAggregation, buffer_size: usize) -> Self {
        let aggregation = Arc::new(aggregation);
        let key_by = aggregation.clone();
        Self::new(
            name,
            buffer_size,
            move |row: &UntypedRow| key_by.key(row),
            move |current, next| aggregation.merge(current, next),
        )
    }
}

impl<R, K> Transformer<R> for StreamingAggregator<R, K>
where
    R: EtlRow,
    K: Hash + Eq + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        group_id: &str,
        input: BoxStream<'static, Result<R>>,
    ) -> BoxStream<'static, Result<Staged<R>>> {
        let (tx, rx) = mpsc::channel(self.buffer_size.get());
        tokio::spawn(self.clone().run(group_id.to_string(), input, tx));
        ReceiverStream::new(rx).boxed()
    }
}
