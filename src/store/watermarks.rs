//! Durable cursors of the live sync, persisted as key/value rows so a restarted
//! process resumes exactly where it stopped.

use diesel::prelude::*;

use crate::extract::SourceDb;
use crate::prelude::*;
use crate::store::mapping::schema::{live_sync_state, message};
use crate::store::mapping::RawWatermark;
use crate::timeconv;

pub const KEY_MESSAGE_ROWID: &str = "last_message_rowid";
pub const KEY_ATTACHMENT_ROWID: &str = "last_attachment_rowid";
pub const KEY_APPLE_EPOCH_NS: &str = "apple_epoch_ns";

fn get(conn: &mut SqliteConnection, key: &str) -> Result<Option<i64>> {
    let value: Option<String> = live_sync_state::table
        .filter(live_sync_state::key.eq(key))
        .select(live_sync_state::value)
        .first(conn)
        .optional()?;
    value.map(|v| v.parse::<i64>().with_context(|| format!("Malformed watermark value for '{key}'")))
        .transpose()
}

pub fn set(conn: &mut SqliteConnection, key: &str, value: i64) -> EmptyRes {
    diesel::replace_into(live_sync_state::table)
        .values(RawWatermark { key: key.to_owned(), value: value.to_string() })
        .execute(conn)?;
    Ok(())
}

/// High-water mark on source message row-ids, 0 when never set.
pub fn message_rowid(conn: &mut SqliteConnection) -> Result<i64> {
    Ok(get(conn, KEY_MESSAGE_ROWID)?.unwrap_or(0))
}

/// High-water mark on source attachment row-ids, 0 when never set.
pub fn attachment_rowid(conn: &mut SqliteConnection) -> Result<i64> {
    Ok(get(conn, KEY_ATTACHMENT_ROWID)?.unwrap_or(0))
}

/// Legacy timestamp watermark, in Apple-epoch nanoseconds.
pub fn timestamp_ns(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    get(conn, KEY_APPLE_EPOCH_NS)
}

/// On first start the row-id watermarks are seeded with the source tables'
/// current maxima, so the watcher does not re-ingest the existing backlog.
pub fn initialize_rowid_watermarks_if_missing(conn: &mut SqliteConnection,
                                              source: &mut SourceDb) -> Result<(i64, i64)> {
    let message_wm = message_rowid(conn)?;
    let attachment_wm = attachment_rowid(conn)?;
    if message_wm == 0 && attachment_wm == 0 {
        let max_message_rowid = source.max_message_rowid()?;
        set(conn, KEY_MESSAGE_ROWID, max_message_rowid)?;
        log::info!("Initialized message row-id watermark to {max_message_rowid}");

        let max_attachment_rowid = source.max_attachment_rowid()?;
        set(conn, KEY_ATTACHMENT_ROWID, max_attachment_rowid)?;
        log::info!("Initialized attachment row-id watermark to {max_attachment_rowid}");
    }
    Ok((message_rowid(conn)?, attachment_rowid(conn)?))
}

/// Seeds the timestamp watermark from the newest mirrored message,
/// or one day before now when the store is empty.
pub fn initialize_timestamp_watermark_if_missing(conn: &mut SqliteConnection) -> Result<i64> {
    if let Some(ns) = timestamp_ns(conn)? {
        return Ok(ns);
    }
    let newest_unix_ns: Option<i64> = message::table
        .select(diesel::dsl::max(message::time_sent))
        .first(conn)?;
    let apple_ns = match newest_unix_ns {
        Some(unix_ns) => timeconv::unix_ns_to_apple_ns(unix_ns),
        None => {
            let one_day_ago = chrono::Utc::now() - chrono::Duration::days(1);
            timeconv::utc_to_apple_ns(one_day_ago)
                .context("Current time is not representable in nanoseconds")?
        }
    };
    set(conn, KEY_APPLE_EPOCH_NS, apple_ns)?;
    log::info!("Initialized timestamp watermark to {apple_ns} ns");
    Ok(apple_ns)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::prelude::*;

    use super::*;

    #[test]
    fn set_and_get_round_trip() -> EmptyRes {
        let store = new_test_store("watermarks");
        store.transaction(|txn| {
            assert_eq!(message_rowid(txn)?, 0);
            set(txn, KEY_MESSAGE_ROWID, 41)?;
            set(txn, KEY_MESSAGE_ROWID, 42)?;
            assert_eq!(message_rowid(txn)?, 42);
            assert_eq!(attachment_rowid(txn)?, 0);
            assert_eq!(timestamp_ns(txn)?, None);
            Ok(())
        })
    }

    #[test]
    fn timestamp_watermark_seeds_from_newest_message() -> EmptyRes {
        let store = new_test_store("watermark-seed");
        let alice = insert_test_contact(&store, "Alice");
        let chat = insert_test_chat(&store, "4155550100");
        insert_test_message(&store, chat, Some(alice), "g1", 1_700_000_000);

        let ns = store.transaction(initialize_timestamp_watermark_if_missing)?;
        assert_eq!(ns, 1_700_000_000 * 1_000_000_000 - timeconv::APPLE_EPOCH_OFFSET_NS);
        // Idempotent once set.
        assert_eq!(store.transaction(initialize_timestamp_watermark_if_missing)?, ns);
        Ok(())
    }

    #[test]
    fn empty_store_seeds_roughly_one_day_back() -> EmptyRes {
        let store = new_test_store("watermark-empty");
        let ns = store.transaction(initialize_timestamp_watermark_if_missing)?;

        let now_apple_ns = timeconv::utc_to_apple_ns(chrono::Utc::now()).unwrap();
        let day_ns = 86_400_i64 * 1_000_000_000;
        let minute_ns = 60_i64 * 1_000_000_000;
        assert!(ns >= now_apple_ns - day_ns - minute_ns);
        assert!(ns <= now_apple_ns - day_ns + minute_ns);
        Ok(())
    }
}
