//! One-shot import orchestration: the backup snapshot import and the initial
//! live import the watcher starts from.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::backup::BackupLocator;
use crate::cache::SyncCaches;
use crate::convo;
use crate::extract::{self, SourceDb};
use crate::prelude::*;
use crate::store::Store;
use crate::sync::contacts::AddressBookKind;
use crate::sync::{attachments, chats, contacts, messages, IngestMode};

/// Imports a historical snapshot that may contain older or interleaved
/// messages, then re-derives conversations with fresh-split-and-compare so
/// existing conversation ids survive wherever the segmentation is unchanged.
pub fn import_backup_data(store: &Store,
                          caches: &mut SyncCaches,
                          backup_dir: &Path,
                          gap_secs: i64) -> EmptyRes {
    measure(|| {
        log::info!("Starting backup import from {}", backup_dir.to_string_lossy());
        let locator = BackupLocator::new(backup_dir);
        let sms_db = locator.sms_db_path()?;
        let address_book_db = locator.address_book_db_path()?;

        measure(|| contacts::etl_address_book(store, &address_book_db, AddressBookKind::Backup),
                |_, t| log::info!("[Backup] Contacts ETL: {t} ms"))?;

        let mut source = SourceDb::new(&sms_db);
        measure(|| chats::etl_chats(store, caches, &mut source),
                |_, t| log::info!("[Backup] Chats ETL: {t} ms"))?;

        measure(|| -> EmptyRes {
            let rows = source.fetch_all_messages(None)?;
            messages::sync_messages(store, caches, &rows, IngestMode::Backup)?;
            Ok(())
        }, |_, t| log::info!("[Backup] Messages ETL: {t} ms"))?;

        measure(|| -> EmptyRes {
            let rows = source.fetch_all_attachments(None)?;
            attachments::sync_attachments(store, caches, &rows)?;
            Ok(())
        }, |_, t| log::info!("[Backup] Attachments ETL: {t} ms"))?;

        measure(|| store.transaction(|txn| convo::fresh_split_compare(txn, gap_secs)),
                |_, t| log::info!("[Backup] Conversations (fresh split) ETL: {t} ms"))?;

        Ok(())
    }, |_: &EmptyRes, t| log::info!("Total backup import time: {t} ms"))
}

/// Imports from the live database: everything when `since` is absent, only
/// newer rows otherwise. Conversations go through the live (append-or-create)
/// reconciliation.
pub fn import_live_data(store: &Store,
                        caches: &mut SyncCaches,
                        since: Option<DateTime<Utc>>,
                        gap_secs: i64) -> EmptyRes {
    contacts::etl_live_contacts(store)?;

    let live_db = extract::live_chat_db_path()?;
    require!(live_db.exists(), "Messages database not found at {}", live_db.to_string_lossy());
    let mut source = SourceDb::new(&live_db);

    chats::etl_chats(store, caches, &mut source)?;

    let rows = source.fetch_all_messages(since)?;
    // A re-run over the same span must converge, so known GUIDs get updated.
    messages::sync_messages(store, caches, &rows, IngestMode::Backup)?;

    let hints = source.account_login_hints()?;
    contacts::refresh_myself_identifiers(store, &hints)?;

    let attachment_rows = source.fetch_all_attachments(since)?;
    attachments::sync_attachments(store, caches, &attachment_rows)?;

    store.transaction(|txn| convo::reconcile_live_all(txn, since, gap_secs))?;
    Ok(())
}
