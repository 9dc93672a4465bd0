//! The message half of the sync engine: normalises and deduplicates raw source
//! rows into messages and reactions, auto-creating chats and contacts that are
//! referenced for the first time.

use diesel::prelude::*;

use crate::cache::SyncCaches;
use crate::extract::RawMessageRow;
use crate::norm;
use crate::prelude::*;
use crate::store::mapping::schema;
use crate::store::mapping::{RawChat, RawContact, RawContactIdentifier, RawMessage, RawReaction};
use crate::store::Store;
use crate::sync::IngestMode;
use crate::timeconv;

/// Provenance tag of contacts auto-created for unseen senders.
pub const AUTO_CONTACT_SOURCE: &str = "live_sync_message_sender";

/// Rows per bulk statement, keeping bind counts under SQLite's limit.
const BATCH_SIZE: usize = 1000;

#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Count of newly inserted messages (reactions and updates not included).
    pub imported: usize,
    pub skipped: usize,
    /// Newly inserted message count per affected chat.
    pub per_chat: HashMap<ChatId, i64, Hasher>,
}

struct TransformedMessage {
    chat_identifier: String,
    /// Canonicalised; `None` when the source row carried no sender handle.
    sender_identifier: Option<String>,
    content: String,
    time_unix_ns: Option<i64>,
    is_from_me: bool,
    message_type: Option<i64>,
    service: Option<String>,
    guid: String,
    associated_guid: Option<String>,
    reply_to_guid: Option<String>,
    is_group: bool,
}

pub fn sync_messages(store: &Store,
                     caches: &mut SyncCaches,
                     rows: &[RawMessageRow],
                     mode: IngestMode) -> Result<SyncOutcome> {
    if rows.is_empty() {
        return Ok(SyncOutcome::default());
    }
    store.transaction(|txn| sync_messages_inner(txn, caches, rows, mode))
}

fn sync_messages_inner(txn: &mut SqliteConnection,
                       caches: &mut SyncCaches,
                       rows: &[RawMessageRow],
                       mode: IngestMode) -> Result<SyncOutcome> {
    caches.ensure_populated(txn)?;
    let myself_id = super::contacts::ensure_myself(txn)?;

    // First pass: collect senders the contact cache has never seen and create
    // them in one bulk insert, deduplicated by canonical identifier.
    let mut unknown_senders: HashMap<String, (String, IdentifierKind)> = HashMap::new();
    for row in rows {
        if row.is_from_me { continue; }
        let Some(ref original) = row.sender_identifier else { continue };
        let canonical = norm::canonical_identifier(original);
        if caches.contact_by_identifier.value().contains_key(&canonical) { continue; }
        unknown_senders.entry(canonical)
            .or_insert_with(|| (original.clone(), IdentifierKind::infer(original)));
    }
    if !unknown_senders.is_empty() {
        create_contacts_for_unknown_senders(txn, caches, &unknown_senders)?;
    }

    let mut messages_to_insert: Vec<RawMessage> = vec![];
    let mut messages_to_update: Vec<RawMessage> = vec![];
    let mut reactions_to_insert: Vec<RawReaction> = vec![];
    let mut reactions_to_update: Vec<RawReaction> = vec![];
    let mut staged_guids: HashSet<String, Hasher> = HashSet::default();
    let mut per_chat: HashMap<ChatId, i64, Hasher> = HashMap::default();
    let mut missing_chat_identifiers: HashSet<String> = HashSet::new();
    let mut imported = 0usize;
    let mut skipped = 0usize;
    let mut created_chats = 0usize;

    for row in rows {
        let t = transform(row, caches);

        let chat_id = match caches.chat_id_by_identifier.value().get(&t.chat_identifier).copied() {
            Some(id) => Some(id),
            None if !t.chat_identifier.is_empty() => {
                match create_chat_if_missing(txn, caches, &t.chat_identifier, t.is_group) {
                    Ok(id) => {
                        created_chats += 1;
                        Some(id)
                    }
                    Err(e) => {
                        if missing_chat_identifiers.insert(t.chat_identifier.clone()) {
                            log::warn!("Failed to create chat for identifier '{}': {e}", t.chat_identifier);
                        }
                        None
                    }
                }
            }
            None => None,
        };
        let Some(chat_id) = chat_id else {
            if !t.chat_identifier.is_empty()
                && missing_chat_identifiers.insert(t.chat_identifier.clone()) {
                log::warn!("Chat not found for identifier '{}' derived from sender '{:?}'",
                           t.chat_identifier, row.sender_identifier);
            }
            skipped += 1;
            continue;
        };

        let sender_id = if t.is_from_me {
            Some(myself_id)
        } else {
            let Some(ref canonical) = t.sender_identifier else {
                log::warn!("Message {} is not from me but has no sender identifier, skipping", t.guid);
                skipped += 1;
                continue;
            };
            match caches.contact_by_identifier.value().get(canonical).copied() {
                Some(id) => Some(id),
                None => {
                    log::error!("Sender id not found for '{canonical}' even after batch creation, \
                                 skipping message {}", t.guid);
                    skipped += 1;
                    continue;
                }
            }
        };

        if !staged_guids.insert(t.guid.clone()) {
            skipped += 1;
            continue;
        }

        match t.message_type {
            // A row with a non-zero type is a tapback/effect, not a message.
            // A null associated GUID is kept as-is, never coerced to a message.
            Some(tpe) if tpe != 0 => {
                if let Some(name) = TapbackType::name_of(tpe) {
                    log::debug!("Reaction {}: {name}", t.guid);
                }
                let raw = RawReaction {
                    id: None,
                    source_guid: t.guid.clone(),
                    original_message_guid: t.associated_guid.clone(),
                    reaction_type: Some(tpe),
                    sender_id: sender_id.map(|c| *c),
                    time_sent: t.time_unix_ns,
                    chat_id: *chat_id,
                };
                if !caches.reaction_guids.value().contains(&t.guid) {
                    reactions_to_insert.push(raw);
                } else if mode == IngestMode::Backup {
                    reactions_to_update.push(raw);
                }
            }
            _ => {
                let raw = RawMessage {
                    internal_id: None,
                    chat_id: *chat_id,
                    sender_id: sender_id.map(|c| *c),
                    conversation_id: None,
                    content: Some(t.content.clone()),
                    time_sent: t.time_unix_ns,
                    is_from_me: t.is_from_me as i32,
                    message_type: t.message_type.unwrap_or(0) as i32,
                    service: t.service.clone(),
                    source_guid: t.guid.clone(),
                    associated_guid: t.associated_guid.clone(),
                    reply_to_guid: t.reply_to_guid.clone(),
                };
                if !caches.message_id_by_guid.value().contains_key(&t.guid) {
                    *per_chat.entry(chat_id).or_insert(0) += 1;
                    imported += 1;
                    messages_to_insert.push(raw);
                } else if mode == IngestMode::Backup {
                    messages_to_update.push(raw);
                }
            }
        }
    }

    for chunk in messages_to_insert.chunks(BATCH_SIZE) {
        diesel::insert_into(schema::message::table)
            .values(chunk)
            .execute(txn)?;
        // SQLite cannot INSERT .. RETURNING over multiple values through Diesel,
        // so the fresh internal ids are re-selected by GUID.
        let chunk_guids = chunk.iter().map(|m| m.source_guid.clone()).collect_vec();
        let inserted: Vec<(String, i64)> = schema::message::table
            .filter(schema::message::source_guid.eq_any(&chunk_guids))
            .select((schema::message::source_guid, schema::message::internal_id))
            .load(txn)?;
        for (guid, internal_id) in inserted {
            caches.message_id_by_guid.value_mut().insert(guid, MessageId(internal_id));
        }
    }
    for m in &messages_to_update {
        diesel::update(schema::message::table.filter(schema::message::source_guid.eq(&m.source_guid)))
            .set((schema::message::chat_id.eq(m.chat_id),
                  schema::message::sender_id.eq(m.sender_id),
                  schema::message::content.eq(m.content.clone()),
                  schema::message::time_sent.eq(m.time_sent),
                  schema::message::is_from_me.eq(m.is_from_me),
                  schema::message::message_type.eq(m.message_type),
                  schema::message::service.eq(m.service.clone())))
            .execute(txn)?;
    }

    for chunk in reactions_to_insert.chunks(BATCH_SIZE) {
        diesel::insert_into(schema::reaction::table)
            .values(chunk)
            .execute(txn)?;
        for r in chunk {
            caches.reaction_guids.value_mut().insert(r.source_guid.clone());
        }
    }
    for r in &reactions_to_update {
        diesel::update(schema::reaction::table.filter(schema::reaction::source_guid.eq(&r.source_guid)))
            .set((schema::reaction::original_message_guid.eq(r.original_message_guid.clone()),
                  schema::reaction::reaction_type.eq(r.reaction_type),
                  schema::reaction::sender_id.eq(r.sender_id),
                  schema::reaction::time_sent.eq(r.time_sent),
                  schema::reaction::chat_id.eq(r.chat_id)))
            .execute(txn)?;
    }

    for (chat_id, count) in &per_chat {
        diesel::update(schema::chat::table.find(**chat_id))
            .set(schema::chat::msg_count.eq(schema::chat::msg_count + *count as i32))
            .execute(txn)?;
    }

    if skipped > 0 {
        log::info!("Skipped {skipped} rows during message sync");
    }
    if created_chats > 0 {
        log::info!("Created {created_chats} new chats during message sync");
    }

    Ok(SyncOutcome { imported, skipped, per_chat })
}

fn transform(row: &RawMessageRow, caches: &SyncCaches) -> TransformedMessage {
    // Chat identity falls back from the row's own participant list to the
    // source-side participants cache, and finally to the bare sender handle.
    let participants = row.chat_participants.clone()
        .filter(|p| !p.is_empty())
        .or_else(|| row.source_chat_rowid
            .and_then(|rowid| caches.source_participants.value().get(&rowid))
            .filter(|p| !p.is_empty())
            .cloned())
        .or_else(|| row.sender_identifier.clone())
        .unwrap_or_default();

    let mut content = row.text.clone().unwrap_or_default();
    if content.is_empty() {
        if let Some(ref body) = row.attributed_body {
            content = norm::decode_attributed_body(body);
        }
    }

    TransformedMessage {
        chat_identifier: norm::chat_identifier(participants.split(',')),
        sender_identifier: row.sender_identifier.as_deref().map(norm::canonical_identifier),
        content: norm::clean_text(&content),
        time_unix_ns: row.date_ns.and_then(timeconv::apple_ns_to_unix_ns),
        is_from_me: row.is_from_me,
        message_type: row.associated_message_type,
        service: row.service.clone(),
        guid: row.guid.clone(),
        associated_guid: row.associated_message_guid.as_deref()
            .map(|guid| norm::clean_guid(guid).to_owned()),
        reply_to_guid: row.reply_to_guid.clone(),
        is_group: participants.split(',').count() > 1,
    }
}

fn create_contacts_for_unknown_senders(txn: &mut SqliteConnection,
                                       caches: &mut SyncCaches,
                                       unknown: &HashMap<String, (String, IdentifierKind)>) -> EmptyRes {
    let contacts = unknown.values()
        .map(|(original, _)| RawContact {
            id: None,
            name: Some(original.clone()),
            is_myself: 0,
            data_source: Some(AUTO_CONTACT_SOURCE.to_owned()),
        })
        .collect_vec();
    for chunk in contacts.chunks(BATCH_SIZE) {
        diesel::insert_into(schema::contact::table).values(chunk).execute(txn)?;
    }

    let names = unknown.values().map(|(original, _)| original.clone()).collect_vec();
    let mut id_by_name: HashMap<String, i64> = HashMap::new();
    for chunk in names.chunks(BATCH_SIZE) {
        let retrieved: Vec<(i64, Option<String>)> = schema::contact::table
            .filter(schema::contact::name.eq_any(chunk))
            .filter(schema::contact::data_source.eq(AUTO_CONTACT_SOURCE))
            .select((schema::contact::id, schema::contact::name))
            .load(txn)?;
        id_by_name.extend(retrieved.into_iter().filter_map(|(id, name)| name.map(|n| (n, id))));
    }

    let mut identifiers = vec![];
    for (canonical, (original, kind)) in unknown {
        match id_by_name.get(original) {
            Some(&contact_id) => {
                caches.contact_by_identifier.value_mut().insert(canonical.clone(), ContactId(contact_id));
                identifiers.push(RawContactIdentifier {
                    id: None,
                    contact_id,
                    identifier: canonical.clone(),
                    kind: kind.as_str().to_owned(),
                    is_primary: 1,
                    last_used: None,
                });
            }
            None => log::warn!("Could not retrieve id for auto-created contact '{original}'"),
        }
    }
    for identifier in &identifiers {
        // The same identifier may already exist under another contact.
        diesel::insert_into(schema::contact_identifier::table)
            .values(identifier)
            .on_conflict_do_nothing()
            .execute(txn)?;
    }
    Ok(())
}

fn create_chat_if_missing(txn: &mut SqliteConnection,
                          caches: &mut SyncCaches,
                          chat_identifier: &str,
                          is_group: bool) -> Result<ChatId> {
    if let Some(&id) = caches.chat_id_by_identifier.value().get(chat_identifier) {
        return Ok(id);
    }
    // The cache only ever lags with false negatives, so double-check the table.
    let existing: Option<i64> = schema::chat::table
        .filter(schema::chat::chat_identifier.eq(chat_identifier))
        .select(schema::chat::id)
        .first(txn)
        .optional()?;
    if let Some(id) = existing {
        caches.chat_id_by_identifier.value_mut().insert(chat_identifier.to_owned(), ChatId(id));
        return Ok(ChatId(id));
    }

    let now_ns = timeconv::utc_to_unix_ns(chrono::Utc::now());
    let id: i64 = diesel::insert_into(schema::chat::table)
        .values(RawChat {
            id: None,
            chat_identifier: chat_identifier.to_owned(),
            name: None,
            created_at: now_ns,
            last_message_at: now_ns,
            is_group: is_group as i32,
            service: Some("iMessage".to_owned()),
            msg_count: 0,
        })
        .returning(schema::chat::id)
        .get_result(txn)?;
    caches.chat_id_by_identifier.value_mut().insert(chat_identifier.to_owned(), ChatId(id));
    log::info!("Created new chat with identifier '{chat_identifier}', assigned id {id}");
    Ok(ChatId(id))
}
