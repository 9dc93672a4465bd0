//! Chat extract-transform-load: upserts chat rows from the source database and
//! links their participants to known contacts.

use diesel::prelude::*;

use crate::cache::SyncCaches;
use crate::extract::{RawChatRow, SourceDb};
use crate::norm;
use crate::prelude::*;
use crate::store::mapping::schema;
use crate::store::mapping::{RawChat, RawChatParticipant};
use crate::store::Store;
use crate::timeconv;

const DISPLAY_NAME_MAX_CHARS: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChatEtlStats {
    pub new_chats: usize,
    pub updated_chats: usize,
}

struct TransformedChat {
    chat_identifier: String,
    name: String,
    created_at: Option<i64>,
    last_message_at: Option<i64>,
    is_group: bool,
    service: Option<String>,
    participant_contact_ids: Vec<i64>,
}

pub fn etl_chats(store: &Store, caches: &mut SyncCaches, source: &mut SourceDb) -> Result<ChatEtlStats> {
    log::info!("Starting chat ETL from {}", source.path().to_string_lossy());
    let raw_chats = source.fetch_chats()?;
    let stats = store.transaction(|txn| load_chats(txn, &raw_chats))?;

    // Chat rows changed underneath the chat caches; have them rebuilt on next use.
    caches.chat_id_by_identifier.reset();
    caches.group_chat_id_by_display_name.reset();

    log::info!("Chat ETL complete. New: {}, updated: {}", stats.new_chats, stats.updated_chats);
    Ok(stats)
}

fn load_chats(txn: &mut SqliteConnection, raw_chats: &[RawChatRow]) -> Result<ChatEtlStats> {
    // Canonical identifier -> (contact id, contact name), for participant
    // resolution and display-name fallbacks.
    let contact_rows: Vec<(String, i64, Option<String>)> = schema::contact_identifier::table
        .inner_join(schema::contact::table)
        .select((schema::contact_identifier::identifier,
                 schema::contact::id,
                 schema::contact::name))
        .load(txn)?;
    let contact_by_canonical: HashMap<String, (i64, Option<String>), Hasher> = contact_rows.into_iter()
        .map(|(identifier, id, name)| (norm::canonical_identifier(&identifier), (id, name)))
        .collect();

    let chat_rows: Vec<(String, i64, Option<String>, i32)> = schema::chat::table
        .select((schema::chat::chat_identifier, schema::chat::id,
                 schema::chat::name, schema::chat::is_group))
        .load(txn)?;
    let mut id_by_identifier: HashMap<String, i64, Hasher> = HashMap::default();
    let mut id_by_display_name: HashMap<String, i64, Hasher> = HashMap::default();
    for (identifier, id, name, is_group) in chat_rows {
        id_by_identifier.insert(identifier, id);
        if is_group != 0 {
            if let Some(name) = name {
                id_by_display_name.insert(name, id);
            }
        }
    }

    let mut stats = ChatEtlStats::default();
    for raw in raw_chats {
        let chat = transform_chat(raw, &contact_by_canonical);

        // Group chats are matched by display name first, then anything by identifier.
        let mut chat_id = if chat.is_group {
            id_by_display_name.get(&chat.name).copied()
        } else {
            None
        };
        if chat_id.is_none() {
            chat_id = id_by_identifier.get(&chat.chat_identifier).copied();
        }

        let chat_id = match chat_id {
            Some(id) => {
                let (existing_created, existing_last): (Option<i64>, Option<i64>) = schema::chat::table
                    .find(id)
                    .select((schema::chat::created_at, schema::chat::last_message_at))
                    .first(txn)?;
                diesel::update(schema::chat::table.find(id))
                    .set((schema::chat::name.eq(Some(chat.name.clone())),
                          schema::chat::created_at.eq(min_instant(existing_created, chat.created_at)),
                          schema::chat::last_message_at.eq(max_instant(existing_last, chat.last_message_at)),
                          schema::chat::service.eq(chat.service.clone())))
                    .execute(txn)?;
                stats.updated_chats += 1;
                id
            }
            None => {
                let id: i64 = diesel::insert_into(schema::chat::table)
                    .values(RawChat {
                        id: None,
                        chat_identifier: chat.chat_identifier.clone(),
                        name: Some(chat.name.clone()),
                        created_at: chat.created_at,
                        last_message_at: chat.last_message_at,
                        is_group: chat.is_group as i32,
                        service: chat.service.clone(),
                        msg_count: 0,
                    })
                    .returning(schema::chat::id)
                    .get_result(txn)?;
                id_by_identifier.insert(chat.chat_identifier.clone(), id);
                if chat.is_group {
                    id_by_display_name.insert(chat.name.clone(), id);
                }
                stats.new_chats += 1;
                id
            }
        };

        let participants = chat.participant_contact_ids.iter()
            .map(|&contact_id| RawChatParticipant { chat_id, contact_id })
            .collect_vec();
        for participant in &participants {
            diesel::insert_into(schema::chat_participant::table)
                .values(participant)
                .on_conflict_do_nothing()
                .execute(txn)?;
        }
    }
    Ok(stats)
}

fn transform_chat(raw: &RawChatRow,
                  contact_by_canonical: &HashMap<String, (i64, Option<String>), Hasher>) -> TransformedChat {
    let participant_identifiers = raw.participants.as_deref().unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unique()
        .collect_vec();

    let mut participant_contact_ids = vec![];
    let mut participant_names = vec![];
    for identifier in &participant_identifiers {
        match contact_by_canonical.get(&norm::canonical_identifier(identifier)) {
            Some((contact_id, name)) => {
                participant_contact_ids.push(*contact_id);
                participant_names.push(match name {
                    Some(name) if !name.is_empty() => name.clone(),
                    _ => (*identifier).to_owned(),
                });
            }
            None => participant_names.push((*identifier).to_owned()),
        }
    }

    let name = match raw.display_name.as_deref() {
        Some(display_name) if !display_name.is_empty() => display_name.to_owned(),
        _ if !participant_names.is_empty() => participant_names.join(", "),
        _ => format!("Chat {}", raw.rowid),
    };
    let name = truncate_display_name(&name);

    TransformedChat {
        chat_identifier: norm::chat_identifier(participant_identifiers.iter().copied()),
        name,
        created_at: raw.created_date
            .and_then(timeconv::from_apple_timestamp)
            .and_then(timeconv::utc_to_unix_ns),
        last_message_at: raw.last_message_date
            .and_then(timeconv::from_apple_timestamp)
            .and_then(timeconv::utc_to_unix_ns),
        is_group: raw.is_group,
        service: raw.service_name.clone(),
        participant_contact_ids,
    }
}

fn truncate_display_name(name: &str) -> String {
    if name.chars().count() > DISPLAY_NAME_MAX_CHARS {
        let truncated: String = name.chars().take(DISPLAY_NAME_MAX_CHARS).collect();
        format!("{truncated}...")
    } else {
        name.to_owned()
    }
}

fn min_instant(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_instant(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
