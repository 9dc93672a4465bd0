//! Tails the source database by polling its file and WAL sidekick modification
//! times. A poller task enqueues change events; the consumer debounces them
//! and runs one sync cycle per surviving event. All database work happens on
//! the consumer, so cache and store observations stay self-consistent within
//! a cycle.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::cache::SyncCaches;
use crate::convo;
use crate::extract::{RawMessageRow, SourceDb};
use crate::prelude::*;
use crate::store::{watermarks, Store};
use crate::sync::{self, IngestMode};
use crate::timeconv;

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod tests;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEBOUNCE: Duration = Duration::from_millis(50);
/// Extra sleep after the debounce, letting the writer finish its current WAL frame.
const POST_DEBOUNCE_GRACE: Duration = Duration::from_millis(25);

/// Aborts the wrapped task when dropped, so cancelling the watcher tears down
/// its poller with it.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs until the event channel closes. Errors inside a cycle are logged and
/// the next event is processed; watermarks only advance on success.
pub async fn watch(store: &Store,
                   source: &mut SourceDb,
                   caches: &mut SyncCaches,
                   gap_secs: i64) -> EmptyRes {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let db_path = source.path().to_path_buf();
    let wal_path = wal_sidekick(&db_path);
    let _poller = AbortOnDrop(tokio::spawn(
        poll_for_changes(events_tx, db_path, wal_path, POLL_INTERVAL)));

    let (message_rowid, attachment_rowid) = store.transaction(|txn| {
        Ok((watermarks::message_rowid(txn)?, watermarks::attachment_rowid(txn)?))
    })?;
    log::info!("Starting watcher with message row-id watermark {message_rowid}, \
                attachment row-id watermark {attachment_rowid}");

    let mut last_cycle: Option<Instant> = None;
    while events_rx.recv().await.is_some() {
        if last_cycle.is_some_and(|t| t.elapsed() < DEBOUNCE) {
            continue;
        }
        sleep(DEBOUNCE + POST_DEBOUNCE_GRACE).await;
        last_cycle = Some(Instant::now());

        if let Err(e) = run_cycle(store, source, caches, gap_secs) {
            log::error!("Live sync cycle failed: {e:#}");
        }
    }
    Ok(())
}

pub fn wal_sidekick(db_path: &Path) -> PathBuf {
    let mut path = db_path.as_os_str().to_owned();
    path.push("-wal");
    PathBuf::from(path)
}

async fn poll_for_changes(events: UnboundedSender<()>,
                          db_path: PathBuf,
                          wal_path: PathBuf,
                          interval: Duration) {
    let mut last_db_mtime = mtime_of(&db_path);
    let mut last_wal_mtime = mtime_of(&wal_path);
    loop {
        sleep(interval).await;
        let current_db_mtime = mtime_of(&db_path);
        let current_wal_mtime = mtime_of(&wal_path);
        let changed = current_db_mtime != last_db_mtime || current_wal_mtime != last_wal_mtime;
        last_db_mtime = current_db_mtime;
        last_wal_mtime = current_wal_mtime;
        if changed && events.send(()).is_err() {
            break; // consumer is gone
        }
    }
}

/// Missing files report `None`, so appearance and disappearance both register
/// as changes.
fn mtime_of(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn run_cycle(store: &Store,
             source: &mut SourceDb,
             caches: &mut SyncCaches,
             gap_secs: i64) -> EmptyRes {
    let mut timings: Vec<(&'static str, Duration)> = vec![];

    let (message_rowid, attachment_rowid, prev_watermark_ns) = store.transaction(|txn| {
        Ok((watermarks::message_rowid(txn)?,
            watermarks::attachment_rowid(txn)?,
            watermarks::timestamp_ns(txn)?.unwrap_or(0)))
    })?;

    let (new_messages, new_message_rowid) =
        timed(&mut timings, "fetch_messages_by_rowid", || source.fetch_messages(message_rowid));
    let (new_attachments, new_attachment_rowid) =
        timed(&mut timings, "fetch_attachments_by_rowid", || source.fetch_attachments(attachment_rowid));

    if new_messages.is_empty() && new_attachments.is_empty() {
        return Ok(());
    }

    if !new_messages.is_empty() {
        let outcome = timed(&mut timings, "sync_messages",
                            || sync::messages::sync_messages(store, caches, &new_messages, IngestMode::Live))?;
        store.transaction(|txn| watermarks::set(txn, watermarks::KEY_MESSAGE_ROWID, new_message_rowid))?;

        if !outcome.per_chat.is_empty() {
            let affected = outcome.per_chat.keys().copied().collect_vec();
            let since = timeconv::apple_ns_to_utc(prev_watermark_ns);
            timed(&mut timings, "reconcile_conversations",
                  || store.transaction(|txn| convo::reconcile_live(txn, &affected, since, gap_secs)))?;
        }

        if outcome.imported > 0 {
            // Timestamps are not monotonic with row-ids, so the watermark takes
            // the maximum observed, never the last.
            match new_messages.iter().filter_map(|m| m.date_ns).max() {
                Some(max_ns) => {
                    log_ingest_latency(&new_messages, prev_watermark_ns, max_ns);
                    store.transaction(|txn| watermarks::set(txn, watermarks::KEY_APPLE_EPOCH_NS, max_ns))?;
                }
                None => log::error!("No valid timestamps among new messages to advance the watermark"),
            }
        }
    }

    if !new_attachments.is_empty() {
        timed(&mut timings, "sync_attachments",
              || sync::attachments::sync_attachments(store, caches, &new_attachments))?;
        store.transaction(|txn| watermarks::set(txn, watermarks::KEY_ATTACHMENT_ROWID, new_attachment_rowid))?;
    }

    let total: Duration = timings.iter().map(|(_, d)| *d).sum();
    let breakdown = timings.iter()
        .map(|(label, d)| format!("{label}={:.3}s", d.as_secs_f64()))
        .join(", ");
    log::info!("Batch processed in {:.3}s ({breakdown})", total.as_secs_f64());
    Ok(())
}

fn timed<T>(timings: &mut Vec<(&'static str, Duration)>,
            label: &'static str,
            block: impl FnOnce() -> T) -> T {
    let start = std::time::Instant::now();
    let result = block();
    timings.push((label, start.elapsed()));
    result
}

fn log_ingest_latency(rows: &[RawMessageRow], prev_watermark_ns: i64, max_ns: i64) {
    let Some(now_unix_ns) = timeconv::utc_to_unix_ns(chrono::Utc::now()) else { return };
    for row in rows {
        let Some(date_ns) = row.date_ns else { continue };
        if date_ns <= prev_watermark_ns || date_ns > max_ns {
            continue;
        }
        let Some(sent_unix_ns) = timeconv::apple_ns_to_unix_ns(date_ns) else { continue };
        let latency_ms = (now_unix_ns - sent_unix_ns) as f64 / 1e6;
        let content = row.text.as_deref().unwrap_or("");
        log::info!("Message {{content: '{content}'}}, WAL to log latency: {latency_ms:.2} ms");
    }
}
