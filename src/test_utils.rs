#![allow(dead_code)]

use std::env::temp_dir;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

use diesel::prelude::*;

use crate::extract::RawMessageRow;
use crate::prelude::*;
use crate::store::mapping::schema;
use crate::store::mapping::{RawChat, RawContact, RawMessage};
use crate::store::Store;

const SEC: i64 = 1_000_000_000;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opens a store on a fresh temp-dir database file.
pub fn new_test_store(tag: &str) -> Store {
    let seq = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = temp_dir().join(format!("chat-mirror-test-{}-{tag}-{seq}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let db_file = dir.join("data.sqlite");
    if db_file.exists() {
        fs::remove_file(&db_file).unwrap();
    }
    Store::open(&db_file).unwrap()
}

/// A plain source message row; `t_secs` is seconds from the Apple epoch.
pub fn source_message(rowid: i64,
                      guid: &str,
                      text: &str,
                      sender: Option<&str>,
                      participants: &str,
                      is_from_me: bool,
                      t_secs: i64) -> RawMessageRow {
    RawMessageRow {
        rowid,
        guid: guid.to_owned(),
        text: Some(text.to_owned()),
        attributed_body: None,
        service: Some("iMessage".to_owned()),
        date_ns: Some(t_secs * SEC),
        is_from_me,
        associated_message_guid: None,
        associated_message_type: Some(0),
        reply_to_guid: None,
        sender_identifier: sender.map(str::to_owned),
        source_chat_rowid: Some(1),
        chat_participants: if participants.is_empty() { None } else { Some(participants.to_owned()) },
    }
}

pub fn insert_test_contact(store: &Store, name: &str) -> ContactId {
    store.transaction(|txn| {
        let id: i64 = diesel::insert_into(schema::contact::table)
            .values(RawContact {
                id: None,
                name: Some(name.to_owned()),
                is_myself: 0,
                data_source: None,
            })
            .returning(schema::contact::id)
            .get_result(txn)?;
        Ok(ContactId(id))
    }).unwrap()
}

pub fn insert_test_chat(store: &Store, chat_identifier: &str) -> ChatId {
    store.transaction(|txn| {
        let id: i64 = diesel::insert_into(schema::chat::table)
            .values(RawChat {
                id: None,
                chat_identifier: chat_identifier.to_owned(),
                name: None,
                created_at: None,
                last_message_at: None,
                is_group: 0,
                service: Some("iMessage".to_owned()),
                msg_count: 0,
            })
            .returning(schema::chat::id)
            .get_result(txn)?;
        Ok(ChatId(id))
    }).unwrap()
}

/// Inserts a normal message directly into the store; `t_secs` lands in
/// `time_sent` as seconds expressed in nanoseconds.
pub fn insert_test_message(store: &Store,
                           chat_id: ChatId,
                           sender_id: Option<ContactId>,
                           guid: &str,
                           t_secs: i64) -> MessageId {
    store.transaction(|txn| {
        let id: i64 = diesel::insert_into(schema::message::table)
            .values(RawMessage {
                internal_id: None,
                chat_id: *chat_id,
                sender_id: sender_id.map(|c| *c),
                conversation_id: None,
                content: Some(format!("message {guid}")),
                time_sent: Some(t_secs * SEC),
                is_from_me: 0,
                message_type: 0,
                service: Some("iMessage".to_owned()),
                source_guid: guid.to_owned(),
                associated_guid: None,
                reply_to_guid: None,
            })
            .returning(schema::message::internal_id)
            .get_result(txn)?;
        Ok(MessageId(id))
    }).unwrap()
}

/// All conversations of a chat as (id, start, end, msg_count), ordered by start time.
pub fn chat_conversations(store: &Store, chat_id: ChatId) -> Vec<(i64, i64, i64, i32)> {
    store.transaction(|txn| {
        Ok(schema::conversation::table
            .filter(schema::conversation::chat_id.eq(*chat_id))
            .order(schema::conversation::start_time.asc())
            .select((schema::conversation::id,
                     schema::conversation::start_time,
                     schema::conversation::end_time,
                     schema::conversation::msg_count))
            .load(txn)?)
    }).unwrap()
}

/// The conversation id each given message is attached to.
pub fn conversation_of(store: &Store, message_id: MessageId) -> Option<i64> {
    store.transaction(|txn| {
        Ok(schema::message::table
            .find(*message_id)
            .select(schema::message::conversation_id)
            .first(txn)?)
    }).unwrap()
}

//
// Source database fixture
//

/// Creates an empty source database with the subset of the chat.db schema the
/// extractor touches, and returns a writer connection to it.
pub fn new_test_source_db(tag: &str) -> (std::path::PathBuf, rusqlite::Connection) {
    let seq = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = temp_dir().join(format!("chat-mirror-src-{}-{tag}-{seq}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let db_file = dir.join("chat.db");
    if db_file.exists() {
        fs::remove_file(&db_file).unwrap();
    }
    let conn = rusqlite::Connection::open(&db_file).unwrap();
    conn.execute_batch(r"
        CREATE TABLE message (
            ROWID INTEGER PRIMARY KEY,
            guid TEXT,
            text TEXT,
            attributedBody BLOB,
            handle_id INTEGER,
            service TEXT,
            date INTEGER,
            is_from_me INTEGER,
            associated_message_guid TEXT,
            associated_message_type INTEGER DEFAULT 0,
            reply_to_guid TEXT
        );
        CREATE TABLE chat (
            ROWID INTEGER PRIMARY KEY,
            guid TEXT,
            chat_identifier TEXT,
            display_name TEXT,
            service_name TEXT,
            account_login TEXT
        );
        CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT);
        CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
        CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER);
        CREATE TABLE attachment (
            ROWID INTEGER PRIMARY KEY,
            guid TEXT,
            created_date INTEGER,
            filename TEXT,
            uti TEXT,
            mime_type TEXT,
            total_bytes INTEGER,
            is_sticker INTEGER DEFAULT 0
        );
        CREATE TABLE message_attachment_join (attachment_id INTEGER, message_id INTEGER);
    ").unwrap();
    (db_file, conn)
}

/// Inserts one source message joined to the given chat; `date` is raw
/// (any of the three source units).
pub fn add_source_message(conn: &rusqlite::Connection,
                          rowid: i64,
                          chat_rowid: i64,
                          handle_rowid: Option<i64>,
                          guid: &str,
                          text: &str,
                          date: i64,
                          is_from_me: bool) {
    conn.execute(r"
        INSERT INTO message (ROWID, guid, text, handle_id, service, date, is_from_me)
        VALUES (?1, ?2, ?3, ?4, 'iMessage', ?5, ?6)",
        rusqlite::params![rowid, guid, text, handle_rowid, date, is_from_me as i64]).unwrap();
    conn.execute("INSERT INTO chat_message_join (chat_id, message_id) VALUES (?1, ?2)",
                 rusqlite::params![chat_rowid, rowid]).unwrap();
}

pub fn add_source_chat(conn: &rusqlite::Connection,
                       rowid: i64,
                       chat_identifier: &str,
                       display_name: Option<&str>,
                       handles: &[(i64, &str)]) {
    conn.execute(r"
        INSERT INTO chat (ROWID, guid, chat_identifier, display_name, service_name)
        VALUES (?1, ?2, ?3, ?4, 'iMessage')",
        rusqlite::params![rowid, format!("iMessage;-;{chat_identifier}"), chat_identifier, display_name]).unwrap();
    for (handle_rowid, identifier) in handles {
        conn.execute("INSERT OR IGNORE INTO handle (ROWID, id) VALUES (?1, ?2)",
                     rusqlite::params![handle_rowid, identifier]).unwrap();
        conn.execute("INSERT INTO chat_handle_join (chat_id, handle_id) VALUES (?1, ?2)",
                     rusqlite::params![rowid, handle_rowid]).unwrap();
    }
}
