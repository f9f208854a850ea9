// src/case_log.rs
//
// Case-log persistence adapter. Maps case mutations to append/update
// batches against the store's schema, coalescing repeated mutations of the
// same case within a tick. The store is eventually consistent: writes are
// retried with exponential backoff under a bounded timeout, and a batch
// that keeps failing is abandoned with an alert. In-memory case state
// stays authoritative; the decision pipeline never blocks on the store.

use crate::codec::{self, CaseLogInsert, CaseRecord, WireMessage};
use crate::error::PipelineError;
use crate::pipeline::metrics::PipelineMetrics;
use crate::types::PersistenceConfig;
use anyhow::Result;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[allow(async_fn_in_trait)]
pub trait CaseStore {
    async fn insert(&mut self, batch: &CaseLogInsert) -> Result<()>;
}

/// Store client speaking the length-prefixed JSON protocol of the case-log
/// service. One connection per batch; the service treats every record with
/// a known case_id as an upsert.
pub struct TcpCaseStore {
    addr: String,
}

impl TcpCaseStore {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl CaseStore for TcpCaseStore {
    async fn insert(&mut self, batch: &CaseLogInsert) -> Result<()> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        codec::write_message(&mut stream, &WireMessage::CaseLogInsert(batch.clone())).await?;
        Ok(())
    }
}

pub struct CaseLogAdapter<S: CaseStore> {
    store: S,
    config: PersistenceConfig,
    rx: mpsc::Receiver<CaseRecord>,
    metrics: PipelineMetrics,
}

impl<S: CaseStore> CaseLogAdapter<S> {
    pub fn new(
        store: S,
        config: PersistenceConfig,
        rx: mpsc::Receiver<CaseRecord>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            store,
            config,
            rx,
            metrics,
        }
    }

    pub async fn run(mut self) {
        info!(store = %self.config.store_addr, "case-log adapter started");
        while let Some(first) = self.rx.recv().await {
            let mut pending = vec![first];
            while let Ok(more) = self.rx.try_recv() {
                pending.push(more);
            }
            let batch = coalesce(pending);
            if let Err(e) = self.write_with_retry(batch).await {
                self.metrics.inc(&self.metrics.persistence_failures);
                error!("{e}; in-memory state remains authoritative");
            }
        }
        info!("case-log adapter stopped");
    }

    async fn write_with_retry(&mut self, batch: CaseLogInsert) -> Result<(), PipelineError> {
        let timeout = Duration::from_millis(self.config.write_timeout_ms);
        let mut backoff = Duration::from_millis(self.config.backoff_ms);

        for attempt in 1..=self.config.max_attempts {
            match tokio::time::timeout(timeout, self.store.insert(&batch)).await {
                Ok(Ok(())) => {
                    debug!(records = batch.logs.len(), attempt, "case-log batch persisted");
                    return Ok(());
                }
                Ok(Err(e)) => warn!(attempt, "case-log write failed: {e:#}"),
                Err(_) => warn!(attempt, timeout_ms = timeout.as_millis() as u64, "case-log write timed out"),
            }
            if attempt < self.config.max_attempts {
                self.metrics.inc(&self.metrics.persistence_retries);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(PipelineError::PersistenceFailure(format!(
            "batch of {} record(s) abandoned after {} attempts",
            batch.logs.len(),
            self.config.max_attempts
        )))
    }
}

/// Keep only the newest record per case_id, preserving first-seen order.
fn coalesce(records: Vec<CaseRecord>) -> CaseLogInsert {
    let mut logs: Vec<CaseRecord> = Vec::with_capacity(records.len());
    for record in records {
        if let Some(existing) = logs.iter_mut().find(|r| r.case_id == record.case_id) {
            *existing = record;
        } else {
            logs.push(record);
        }
    }
    CaseLogInsert { logs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CaseType, Label, Location};
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    fn record(case_id: u64, closed: u8) -> CaseRecord {
        CaseRecord {
            case_id,
            case_type: CaseType::Danger,
            detection_type: Label::Gun,
            robot_id: "robot_1".to_string(),
            user_id: "operator".to_string(),
            location: Location::A,
            is_ignored: 0,
            is_119_reported: 0,
            is_112_reported: 0,
            is_illegal_warned: 0,
            is_danger_warned: 0,
            is_emergency_warned: 0,
            is_case_closed: closed,
            start_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            end_time: None,
        }
    }

    #[derive(Clone)]
    struct MockStore {
        batches: Arc<Mutex<Vec<CaseLogInsert>>>,
        fail_first: Arc<Mutex<u32>>,
    }

    impl MockStore {
        fn new(fail_first: u32) -> Self {
            Self {
                batches: Arc::new(Mutex::new(Vec::new())),
                fail_first: Arc::new(Mutex::new(fail_first)),
            }
        }
    }

    impl CaseStore for MockStore {
        async fn insert(&mut self, batch: &CaseLogInsert) -> Result<()> {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("store unavailable");
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            store_addr: "mock".to_string(),
            write_timeout_ms: 100,
            backoff_ms: 10,
            max_attempts: 3,
        }
    }

    #[test]
    fn coalesce_keeps_the_newest_record_per_case() {
        let batch = coalesce(vec![record(1, 0), record(2, 0), record(1, 1)]);
        assert_eq!(batch.logs.len(), 2);
        assert_eq!(batch.logs[0].case_id, 1);
        assert_eq!(batch.logs[0].is_case_closed, 1);
        assert_eq!(batch.logs[1].case_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_in_one_tick_become_one_write() {
        let store = MockStore::new(0);
        let (tx, rx) = mpsc::channel(16);
        let adapter = CaseLogAdapter::new(store.clone(), config(), rx, PipelineMetrics::new());

        tx.send(record(1, 0)).await.unwrap();
        tx.send(record(1, 1)).await.unwrap();
        drop(tx);
        adapter.run().await;

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].logs.len(), 1);
        assert_eq!(batches[0].logs[0].is_case_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_writes_are_retried_with_backoff() {
        let store = MockStore::new(2);
        let (tx, rx) = mpsc::channel(16);
        let metrics = PipelineMetrics::new();
        let adapter = CaseLogAdapter::new(store.clone(), config(), rx, metrics.clone());

        tx.send(record(7, 0)).await.unwrap();
        drop(tx);
        adapter.run().await;

        assert_eq!(store.batches.lock().unwrap().len(), 1);
        assert_eq!(
            metrics
                .persistence_retries
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_abandon_the_batch_without_blocking() {
        let store = MockStore::new(10);
        let (tx, rx) = mpsc::channel(16);
        let metrics = PipelineMetrics::new();
        let adapter = CaseLogAdapter::new(store.clone(), config(), rx, metrics.clone());

        tx.send(record(8, 0)).await.unwrap();
        drop(tx);
        adapter.run().await;

        assert!(store.batches.lock().unwrap().is_empty());
        assert_eq!(
            metrics
                .persistence_failures
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
