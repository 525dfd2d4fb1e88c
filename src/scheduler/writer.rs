//! Background persistence: batched result writes and retention sweeps.

use crate::db::{Store, StoreRecord};

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_THRESHOLD: usize = 500;

/// Run the batch writer that accumulates and flushes result records.
///
/// Exits when the channel closes or `stop` fires, flushing what it holds.
pub async fn run_batch_writer(
    mut rx: mpsc::Receiver<StoreRecord>,
    store: Arc<Store>,
    mut stop: broadcast::Receiver<()>,
) {
    let mut buffer: Vec<StoreRecord> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = stop.recv() => {
                while let Ok(r) = rx.try_recv() {
                    buffer.push(r);
                }
                flush_buffer(&store, &mut buffer);
                break;
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
    tracing::debug!("BatchWriter: stopped");
}

fn flush_buffer(store: &Store, buffer: &mut Vec<StoreRecord>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_records(buffer) {
        tracing::error!("Failed to flush {} results: {}", buffer.len(), e);
    }

    buffer.clear();
}

/// Periodically delete results older than `retention`.
pub async fn run_retention(
    store: Arc<Store>,
    retention: Duration,
    mut stop: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = interval.tick() => {
                let cutoff = Utc::now()
                    - ChronoDuration::from_std(retention).unwrap_or_else(|_| ChronoDuration::days(36_500));
                match store.delete_results_before(cutoff) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Retention: deleted {} results before {}", n, cutoff),
                    Err(e) => tracing::error!("Retention: failed to delete old results: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CheckRecord;
    use tempfile::NamedTempFile;

    fn record(target_id: i64) -> StoreRecord {
        StoreRecord::Check(CheckRecord {
            time: Utc::now(),
            target_id,
            address: "10.0.0.1".to_string(),
            success: true,
            latency: 2_000_000.0,
            reason: None,
            remote_group: None,
        })
    }

    fn count(store: &Store, target_id: i64) -> usize {
        let now = Utc::now();
        store
            .get_check_results(
                target_id,
                now - ChronoDuration::hours(1),
                now + ChronoDuration::hours(1),
                1000,
            )
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_records() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let writer = tokio::spawn(run_batch_writer(rx, store.clone(), stop_rx));

        for _ in 0..3 {
            tx.send(record(1)).await.unwrap();
        }
        stop_tx.send(()).unwrap();
        writer.await.unwrap();

        assert_eq!(count(&store, 1), 3);
    }

    #[tokio::test]
    async fn test_closed_channel_flushes() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let (tx, rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = broadcast::channel(1);
        let writer = tokio::spawn(run_batch_writer(rx, store.clone(), stop_rx));

        tx.send(record(2)).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(count(&store, 2), 1);
    }
}
