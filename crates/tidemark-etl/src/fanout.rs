//! Fan-out of one extracted stream to several independent consumers
//!
//! Items pulled from the source channel are kept in a shared retention
//! buffer until every live consumer has read them. A consumer that runs
//! `retention` items ahead of the slowest one is suspended until the slowest
//! catches up or goes away, which bounds memory whatever the speed skew.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};

pub const DEFAULT_RETENTION: usize = 2000;

struct State<T> {
    buffer: VecDeque<T>,
    /// Absolute index of `buffer[0]`
    base: u64,
    /// Next index per consumer, `None` once it was dropped
    cursors: Vec<Option<u64>>,
    finished: bool,
}

impl<T> State<T> {
    fn end(&self) -> u64 {
        self.base + self.buffer.len() as u64
    }

    /// Drop every item all live consumers have read. Returns whether anything moved.
    fn trim(&mut self) -> bool {
        let slowest = self.cursors.iter().flatten().min().copied();
        let keep_from = slowest.unwrap_or_else(|| self.end());
        let mut trimmed = false;
        while self.base < keep_from && self.buffer.pop_front().is_some() {
            self.base += 1;
            trimmed = true;
        }
        trimmed
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    source: tokio::sync::Mutex<mpsc::Receiver<T>>,
    progress: Notify,
    retention: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One forward-only view over the shared stream
pub struct FanOutConsumer<T> {
    id: usize,
    shared: Arc<Shared<T>>,
}

enum Step<'a, T> {
    Item(T),
    Done,
    Wait(Notified<'a>),
    Pull,
}

/// Split `source` into `consumers` views that each yield every item, in order.
pub fn fan_out<T>(source: mpsc::Receiver<T>, consumers: usize, retention: usize) -> Vec<FanOutConsumer<T>>
where
    T: Clone + Send + 'static,
{
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::new(),
            base: 0,
            cursors: vec![Some(0); consumers],
            finished: false,
        }),
        source: tokio::sync::Mutex::new(source),
        progress: Notify::new(),
        retention: retention.max(1),
    });

    (0..consumers)
        .map(|id| FanOutConsumer {
            id,
            shared: shared.clone(),
        })
        .collect()
}

impl<T> FanOutConsumer<T>
where
    T: Clone + Send + 'static,
{
    pub async fn next(&mut self) -> Option<T> {
        loop {
            match self.step() {
                Step::Item(item) => return Some(item),
                Step::Done => return None,
                Step::Wait(notified) => notified.await,
                Step::Pull => self.pull().await,
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, T> {
        stream::unfold(self, |mut consumer| async move {
            consumer.next().await.map(|item| (item, consumer))
        })
        .boxed()
    }

    fn step(&self) -> Step<'_, T> {
        let mut state = self.shared.lock();
        let Some(cursor) = state.cursors.get(self.id).copied().flatten() else {
            return Step::Done;
        };

        if cursor < state.end() {
            let offset = (cursor - state.base) as usize;
            let item = state.buffer.get(offset).cloned();
            state.cursors[self.id] = Some(cursor + 1);
            if state.trim() {
                self.shared.progress.notify_waiters();
            }
            return match item {
                Some(item) => Step::Item(item),
                None => Step::Done,
            };
        }

        if state.finished {
            return Step::Done;
        }

        if state.buffer.len() >= self.shared.retention {
            // registered before the lock is released, so no trim is missed
            return Step::Wait(self.shared.progress.notified());
        }

        Step::Pull
    }

    async fn pull(&self) {
        let mut source = self.shared.source.lock().await;
        {
            // another consumer may have pulled while we waited for the source
            let state = self.shared.lock();
            let cursor = state.cursors.get(self.id).copied().flatten();
            let caught_up = cursor.is_some_and(|c| c >= state.end());
            if state.finished || !caught_up || state.buffer.len() >= self.shared.retention {
                return;
            }
        }

        let next = source.recv().await;
        {
            let mut state = self.shared.lock();
            match next {
                Some(item) => state.buffer.push_back(item),
                None => state.finished = true,
            }
        }
        drop(source);
        self.shared.progress.notify_waiters();
    }
}

impl<T> Drop for FanOutConsumer<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(cursor) = state.cursors.get_mut(self.id) {
            *cursor = None;
        }
        state.trim();
        drop(state);
        self.shared.progress.notify_waiters();
    }
}
