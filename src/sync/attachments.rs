//! The attachment half of the sync engine: dedup on attachment GUID, resolve
//! the owning message through the message-GUID cache, bulk insert.

use diesel::prelude::*;

use crate::cache::SyncCaches;
use crate::extract::RawAttachmentRow;
use crate::prelude::*;
use crate::store::mapping::schema;
use crate::store::mapping::RawAttachment;
use crate::store::Store;
use crate::timeconv;

/// Rows per bulk statement, keeping bind counts under SQLite's limit.
const BATCH_SIZE: usize = 1000;

pub fn sync_attachments(store: &Store,
                        caches: &mut SyncCaches,
                        rows: &[RawAttachmentRow]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    store.transaction(|txn| {
        caches.ensure_populated(txn)?;

        let mut to_insert: Vec<RawAttachment> = vec![];
        let mut skipped = 0usize;
        for row in rows {
            if caches.attachment_guids.value().contains(&row.guid) {
                skipped += 1;
                continue;
            }
            let Some(&message_id) = caches.message_id_by_guid.value().get(&row.message_guid) else {
                log::warn!("Message not found for attachment {}", row.guid);
                skipped += 1;
                continue;
            };
            to_insert.push(RawAttachment {
                id: None,
                message_internal_id: *message_id,
                source_guid: row.guid.clone(),
                created_at: row.created_date
                    .and_then(timeconv::from_apple_timestamp)
                    .and_then(timeconv::utc_to_unix_ns),
                file_name: row.filename.clone(),
                uti: row.uti.clone(),
                mime_type: row.mime_type.clone(),
                size_bytes: row.total_bytes,
                is_sticker: row.is_sticker as i32,
            });
        }

        let imported = to_insert.len();
        if !to_insert.is_empty() {
            log::info!("Inserting {imported} new attachments");
        }
        for chunk in to_insert.chunks(BATCH_SIZE) {
            for attachment in chunk {
                diesel::insert_into(schema::attachment::table)
                    .values(attachment)
                    .on_conflict_do_nothing()
                    .execute(txn)?;
                caches.attachment_guids.value_mut().insert(attachment.source_guid.clone());
            }
        }
        if imported > 0 || skipped > 0 {
            log::info!("Attachments sync complete. Imported: {imported}, skipped: {skipped}");
        }
        Ok(imported)
    })
}
