//! In-process lookup caches over the internal store, plus one read-only map
//! over the source database. Lazily populated, explicitly resettable.
//!
//! Mutation discipline: the sync engine updates these immediately after a
//! successful insert, so readers may only ever observe false negatives
//! (a missing entry), never false positives.

use diesel::prelude::*;

use crate::extract::SourceDb;
use crate::norm::canonical_identifier;
use crate::prelude::*;
use crate::store::mapping::schema;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    Loaded,
}

/// A lazily populated value with an explicit populated flag.
pub struct Cached<T: Default> {
    state: CacheState,
    value: T,
}

impl<T: Default> Cached<T> {
    fn empty() -> Self {
        Cached { state: CacheState::Empty, value: T::default() }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// The cached value; callers must only rely on it after population.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn get_or_populate(&mut self, populate: impl FnOnce() -> Result<T>) -> Result<&mut T> {
        if self.state == CacheState::Empty {
            self.value = populate()?;
            self.state = CacheState::Loaded;
        }
        Ok(&mut self.value)
    }

    pub fn reset(&mut self) {
        self.value = T::default();
        self.state = CacheState::Empty;
    }
}

/// All caches of the engine, constructed once and passed explicitly to the
/// sync and conversation engines.
pub struct SyncCaches {
    /// Canonical identifier -> contact id.
    pub contact_by_identifier: Cached<HashMap<String, ContactId, Hasher>>,
    /// Source message GUID -> internal message id.
    pub message_id_by_guid: Cached<HashMap<String, MessageId, Hasher>>,
    /// Chat identifier -> chat id.
    pub chat_id_by_identifier: Cached<HashMap<String, ChatId, Hasher>>,
    /// Group-chat display name -> chat id.
    pub group_chat_id_by_display_name: Cached<HashMap<String, ChatId, Hasher>>,
    /// Known reaction source GUIDs.
    pub reaction_guids: Cached<HashSet<String, Hasher>>,
    /// Known attachment source GUIDs.
    pub attachment_guids: Cached<HashSet<String, Hasher>>,
    /// Source chat row-id -> comma-joined participant list, from the source database.
    pub source_participants: Cached<HashMap<i64, String, Hasher>>,
}

impl SyncCaches {
    pub fn new() -> Self {
        SyncCaches {
            contact_by_identifier: Cached::empty(),
            message_id_by_guid: Cached::empty(),
            chat_id_by_identifier: Cached::empty(),
            group_chat_id_by_display_name: Cached::empty(),
            reaction_guids: Cached::empty(),
            attachment_guids: Cached::empty(),
            source_participants: Cached::empty(),
        }
    }

    /// Populates every store-backed cache that is still empty.
    pub fn ensure_populated(&mut self, conn: &mut SqliteConnection) -> EmptyRes {
        self.contact_by_identifier.get_or_populate(|| {
            let rows: Vec<(String, i64)> = schema::contact_identifier::table
                .inner_join(schema::contact::table)
                .select((schema::contact_identifier::identifier, schema::contact::id))
                .load(&mut *conn)?;
            Ok(rows.into_iter()
                .map(|(identifier, id)| (canonical_identifier(&identifier), ContactId(id)))
                .collect())
        })?;

        self.message_id_by_guid.get_or_populate(|| {
            let rows: Vec<(String, i64)> = schema::message::table
                .select((schema::message::source_guid, schema::message::internal_id))
                .load(&mut *conn)?;
            Ok(rows.into_iter().map(|(guid, id)| (guid, MessageId(id))).collect())
        })?;

        let chat_rows: Option<Vec<(String, i64, Option<String>, i32)>> =
            if self.chat_id_by_identifier.state() == CacheState::Empty
                || self.group_chat_id_by_display_name.state() == CacheState::Empty {
                Some(schema::chat::table
                    .select((schema::chat::chat_identifier, schema::chat::id,
                             schema::chat::name, schema::chat::is_group))
                    .load(&mut *conn)?)
            } else {
                None
            };
        if let Some(chat_rows) = chat_rows {
            self.chat_id_by_identifier.get_or_populate(|| {
                Ok(chat_rows.iter()
                    .map(|(identifier, id, _, _)| (identifier.clone(), ChatId(*id)))
                    .collect())
            })?;
            self.group_chat_id_by_display_name.get_or_populate(|| {
                Ok(chat_rows.iter()
                    .filter(|(_, _, _, is_group)| *is_group != 0)
                    .filter_map(|(_, id, name, _)| name.clone().map(|n| (n, ChatId(*id))))
                    .collect())
            })?;
        }

        self.reaction_guids.get_or_populate(|| {
            let guids: Vec<String> = schema::reaction::table
                .select(schema::reaction::source_guid)
                .load(&mut *conn)?;
            Ok(guids.into_iter().collect())
        })?;

        self.attachment_guids.get_or_populate(|| {
            let guids: Vec<String> = schema::attachment::table
                .select(schema::attachment::source_guid)
                .load(&mut *conn)?;
            Ok(guids.into_iter().collect())
        })?;

        Ok(())
    }

    /// Populates the source-side participants map (read-only on the source).
    pub fn populate_source_participants(&mut self, source: &mut SourceDb) -> EmptyRes {
        self.source_participants.get_or_populate(|| source.participants_by_chat_rowid())?;
        Ok(())
    }

    pub fn reset_all(&mut self) {
        self.contact_by_identifier.reset();
        self.message_id_by_guid.reset();
        self.chat_id_by_identifier.reset();
        self.group_chat_id_by_display_name.reset();
        self.reaction_guids.reset();
        self.attachment_guids.reset();
        self.source_participants.reset();
    }
}

impl Default for SyncCaches {
    fn default() -> Self {
        Self::new()
    }
}
