//! Non-evicting group-by for low-cardinality keys
//!
//! All groups stay in one map until more than `threshold` distinct keys are
//! resident, then every group is emitted at once in timestamp order. Memory
//! is only bounded when the key space is known to be small.

use futures::stream::{BoxStream, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use super::{FieldAggregation, Floors, InputClock, Pending, Transformer};
use crate::error::{EtlError, Result};
use crate::load::Staged;
use crate::row::{EtlRow, UntypedRow};

pub struct GroupingAggregator<R, K> {
    name: String,
    threshold: usize,
    key: Arc<dyn Fn(&R) -> K + Send + Sync>,
    merge: Arc<dyn Fn(R, R) -> Result<R> + Send + Sync>,
}

impl<R, K> Clone for GroupingAggregator<R, K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            threshold: self.threshold,
            key: self.key.clone(),
            merge: self.merge.clone(),
        }
    }
}

impl<R, K> GroupingAggregator<R, K>
where
    R: EtlRow,
    K: Hash + Eq + Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        threshold: usize,
        key: impl Fn(&R) -> K + Send + Sync + 'static,
        merge: impl Fn(R, R) -> Result<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            key: Arc::new(key),
            merge: Arc::new(merge),
        }
    }

    async fn run(
        self,
        group_id: String,
        mut input: BoxStream<'static, Result<R>>,
        output: mpsc::Sender<Result<Staged<R>>>,
    ) {
        let outcome = AssertUnwindSafe(self.consume(&mut input, &output))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(EtlError::panicked(panic.as_ref())));
        drop(input);

        if let Err(e) = outcome {
            error!(transformer = %self.name, group_id = %group_id, error = %e, "grouping failed");
            let _ = output.send(Err(e)).await;
        }
    }

    async fn consume(
        &self,
        input: &mut BoxStream<'static, Result<R>>,
        output: &mpsc::Sender<Result<Staged<R>>>,
    ) -> Result<()> {
        let mut groups: HashMap<K, Pending<R>> = HashMap::new();
        let mut clock = InputClock::new();

        while let Some(item) = input.next().await {
            let row = item?;
            clock.advance(row.timestamp())?;

            let key = (self.key)(&row);
            let group = match groups.remove(&key) {
                Some(Pending { row: current, floor }) => Pending {
                    row: (self.merge)(current, row)?,
                    floor,
                },
                None => Pending {
                    row,
                    floor: clock.floor(),
                },
            };
            groups.insert(key, group);

            if groups.len() > self.threshold {
                debug!(transformer = %self.name, groups = groups.len(), "flushing groups");
                if !flush(&mut groups, output).await {
                    return Ok(());
                }
            }
        }
        flush(&mut groups, output).await;
        Ok(())
    }
}

/// Emit every group in timestamp order, each tagged with the oldest floor
/// among the groups emitted after it
async fn flush<K, R: EtlRow>(groups: &mut HashMap<K, Pending<R>>, output: &mpsc::Sender<Result<Staged<R>>>) -> bool {
    let mut pending: Vec<Pending<R>> = groups.drain().map(|(_, group)| group).collect();
    pending.sort_by_key(|group| group.row.timestamp());

    let mut floors = Floors::default();
    for group in &pending {
        floors.hold(group.floor);
    }
    for group in pending {
        floors.release(group.floor);
        if output.send(Ok(Staged::new(group.row, floors.settled()))).await.is_err() {
            return false;
        }
    }
    true
}

impl GroupingAggregator<UntypedRow, String> {
    pub fn untyped(name: impl Into<String>, aggregation: FieldAggregation, threshold: usize) -> Self {
        let aggregation = Arc::new(aggregation);
        let key_by = aggregation.clone();
        Self::new(
            name,
            threshold,
            move |row: &UntypedRow| key_by.key(row),
            move |current, next| aggregation.merge(current, next),
        )
    }
}

impl<R, K> Transformer<R> for GroupingAggregator<R, K>
where
    R: EtlRow,
    K: Hash + Eq + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, group_id: &str, input: BoxStream<'static, Result<R>>) -> BoxStream<'static, Result<Staged<R>>> {
        let (tx, rx) = mpsc::channel(self.threshold.min(1024));
        tokio::spawn(self.clone().run(group_id.to_string(), input, tx));
        ReceiverStream::new(rx).boxed()
    }
}
