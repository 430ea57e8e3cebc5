// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide buffer that groups records into batches.
//!
//! A batch is handed off when it reaches `max_size` records or when `max_age` has elapsed
//! since its first record, whichever comes first. Warm invocations reuse the same buffer:
//! re-wrapping a handler reconfigures the existing instance instead of creating a new one,
//! so records buffered by an earlier configuration are never orphaned.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::LogRecord;

pub type FlushFn = Arc<dyn Fn(Vec<LogRecord>) + Send + Sync>;

static GLOBAL_BUFFER: OnceLock<Arc<BatchBuffer>> = OnceLock::new();

struct BufferState {
    records: Vec<LogRecord>,
    flush_fn: Option<FlushFn>,
    max_size: usize,
    max_age: Duration,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush so a timer armed for an earlier batch never flushes a later one.
    generation: u64,
}

pub struct BatchBuffer {
    state: Mutex<BufferState>,
    this: Weak<BatchBuffer>,
}

impl BatchBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| BatchBuffer {
            state: Mutex::new(BufferState {
                records: Vec::new(),
                flush_fn: None,
                max_size: 1,
                max_age: Duration::ZERO,
                timer: None,
                generation: 0,
            }),
            this: this.clone(),
        })
    }

    /// The buffer shared by every middleware instance in this process.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_BUFFER.get_or_init(BatchBuffer::new))
    }

    /// Replaces the flush handler and thresholds. Pending records are kept.
    #[allow(clippy::expect_used)]
    pub fn configure(&self, flush_fn: FlushFn, max_size: usize, max_age: Duration) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.flush_fn = Some(flush_fn);
        state.max_size = max_size.max(1);
        state.max_age = max_age;
        debug!(
            "batch buffer configured: max_size={} max_age={}ms pending={}",
            state.max_size,
            max_age.as_millis(),
            state.records.len()
        );
    }

    #[allow(clippy::expect_used)]
    pub fn add(&self, record: LogRecord) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.records.push(record);

        if state.records.len() >= state.max_size {
            let batch = Self::take_batch(&mut state);
            drop(state);
            Self::hand_off(batch);
        } else if state.timer.is_none() && !state.max_age.is_zero() {
            state.timer = self.arm_timer(state.max_age, state.generation);
        }
    }

    /// Hands off every pending record. A no-op when nothing is pending.
    #[allow(clippy::expect_used)]
    pub fn flush(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        let batch = Self::take_batch(&mut state);
        drop(state);
        Self::hand_off(batch);
    }

    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(clippy::expect_used)]
    fn flush_expired(&self, generation: u64) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.generation != generation {
            return;
        }
        // the timer is the running task, drop the handle instead of aborting it
        state.timer = None;
        let batch = Self::take_batch(&mut state);
        drop(state);
        debug!("batch buffer max age reached");
        Self::hand_off(batch);
    }

    /// Swaps the pending records out for an empty batch. Runs under the lock so records
    /// added while the handler executes land in the next batch.
    fn take_batch(state: &mut BufferState) -> Option<(FlushFn, Vec<LogRecord>)> {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.records.is_empty() {
            return None;
        }
        let Some(flush_fn) = state.flush_fn.clone() else {
            warn!(
                "batch buffer has {} records but no flush handler configured",
                state.records.len()
            );
            return None;
        };
        state.generation = state.generation.wrapping_add(1);
        Some((flush_fn, std::mem::take(&mut state.records)))
    }

    fn hand_off(batch: Option<(FlushFn, Vec<LogRecord>)>) {
        if let Some((flush_fn, records)) = batch {
            debug!("flushing batch of {} records", records.len());
            flush_fn(records);
        }
    }

    fn arm_timer(&self, max_age: Duration, generation: u64) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, batch will only flush on size");
            return None;
        };
        let this = self.this.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(max_age).await;
            if let Some(buffer) = this.upgrade() {
                buffer.flush_expired(generation);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Direction, RequestRecord, ResponseRecord};
    use chrono::Utc;
    use std::collections::HashMap;
    use tracing_test::traced_test;

    fn record(uri: &str) -> LogRecord {
        let now = Utc::now();
        LogRecord::new(
            RequestRecord {
                time: now,
                verb: "GET".into(),
                uri: uri.into(),
                ip_address: None,
                headers: HashMap::new(),
                body: None,
                transfer_encoding: None,
                api_version: None,
            },
            ResponseRecord {
                time: now,
                status: 200,
                headers: HashMap::new(),
                body: None,
                transfer_encoding: None,
                blocked_by: None,
            },
            Direction::Incoming,
        )
    }

    type Flushed = Arc<Mutex<Vec<Vec<String>>>>;

    fn collector() -> (FlushFn, Flushed) {
        let flushed: Flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        let flush_fn: FlushFn = Arc::new(move |records: Vec<LogRecord>| {
            sink.lock()
                .unwrap()
                .push(records.into_iter().map(|r| r.request.uri).collect());
        });
        (flush_fn, flushed)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_once_when_full() {
        let buffer = BatchBuffer::new();
        let (flush_fn, flushed) = collector();
        buffer.configure(flush_fn, 3, Duration::from_secs(2));

        for uri in ["/1", "/2", "/3"] {
            buffer.add(record(uri));
        }

        assert_eq!(*flushed.lock().unwrap(), vec![vec!["/1", "/2", "/3"]]);
        assert!(buffer.is_empty());

        // the size flush cancelled the age timer
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(flushed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_once_when_max_age_reached() {
        let buffer = BatchBuffer::new();
        let (flush_fn, flushed) = collector();
        buffer.configure(flush_fn, 10, Duration::from_millis(2000));

        buffer.add(record("/1"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        buffer.add(record("/2"));
        assert!(flushed.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![vec!["/1", "/2"]]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(flushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_on_empty_buffer_is_noop() {
        let buffer = BatchBuffer::new();
        let (flush_fn, flushed) = collector();
        buffer.configure(flush_fn, 10, Duration::from_secs(1));

        buffer.flush();
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_cancels_timer_and_next_batch_gets_new_timer() {
        let buffer = BatchBuffer::new();
        let (flush_fn, flushed) = collector();
        buffer.configure(flush_fn, 10, Duration::from_millis(1000));

        buffer.add(record("/1"));
        buffer.flush();
        tokio::time::sleep(Duration::from_millis(600)).await;
        buffer.add(record("/2"));
        tokio::time::sleep(Duration::from_millis(600)).await;

        // the first timer would have fired here; only the manual flush happened
        assert_eq!(*flushed.lock().unwrap(), vec![vec!["/1"]]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![vec!["/1"], vec!["/2"]]);
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_pending_records() {
        let buffer = BatchBuffer::new();
        let (first, first_flushed) = collector();
        buffer.configure(first, 10, Duration::from_secs(60));
        buffer.add(record("/1"));

        let (second, second_flushed) = collector();
        buffer.configure(second, 2, Duration::from_secs(60));
        buffer.add(record("/2"));

        assert!(first_flushed.lock().unwrap().is_empty());
        assert_eq!(*second_flushed.lock().unwrap(), vec![vec!["/1", "/2"]]);
    }

    #[tokio::test]
    async fn test_records_added_during_flush_go_to_next_batch() {
        let buffer = BatchBuffer::new();
        let flushed: Flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        let reentrant = Arc::downgrade(&buffer);
        let flush_fn: FlushFn = Arc::new(move |records: Vec<LogRecord>| {
            let first_batch = sink.lock().unwrap().is_empty();
            sink.lock()
                .unwrap()
                .push(records.into_iter().map(|r| r.request.uri).collect());
            if first_batch {
                if let Some(buffer) = reentrant.upgrade() {
                    buffer.add(record("/late"));
                }
            }
        });
        buffer.configure(flush_fn, 2, Duration::from_secs(60));

        buffer.add(record("/1"));
        buffer.add(record("/2"));
        assert_eq!(buffer.len(), 1);

        buffer.flush();
        assert_eq!(
            *flushed.lock().unwrap(),
            vec![vec!["/1", "/2"], vec!["/late"]]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unconfigured_buffer_keeps_records() {
        let buffer = BatchBuffer::new();
        buffer.add(record("/1"));
        buffer.flush();
        assert_eq!(buffer.len(), 1);
        assert!(logs_contain("no flush handler configured"));
    }

    #[test]
    fn test_global_is_a_singleton() {
        assert!(Arc::ptr_eq(&BatchBuffer::global(), &BatchBuffer::global()));
    }
}
