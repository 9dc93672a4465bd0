//! Read-only access to the source chat database. One lazily established
//! connection with a short busy timeout; a connection-level failure resets it
//! so the next cycle re-establishes. The row-id cursored fetches never swallow
//! data: on error they return an empty batch plus the unchanged watermark.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};

use crate::prelude::*;
use crate::timeconv;

const BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// A message row as it leaves the source database. `date_ns` is already
/// normalised to Apple-epoch nanoseconds, so downstream code sees one unit.
#[derive(Debug, Clone)]
pub struct RawMessageRow {
    pub rowid: i64,
    pub guid: String,
    pub text: Option<String>,
    pub attributed_body: Option<Vec<u8>>,
    pub service: Option<String>,
    pub date_ns: Option<i64>,
    pub is_from_me: bool,
    pub associated_message_guid: Option<String>,
    pub associated_message_type: Option<i64>,
    pub reply_to_guid: Option<String>,
    pub sender_identifier: Option<String>,
    pub source_chat_rowid: Option<i64>,
    pub chat_participants: Option<String>,
}

/// An attachment row; `created_date` is left in raw source units.
#[derive(Debug, Clone)]
pub struct RawAttachmentRow {
    pub rowid: i64,
    pub guid: String,
    pub created_date: Option<i64>,
    pub filename: Option<String>,
    pub uti: Option<String>,
    pub mime_type: Option<String>,
    pub total_bytes: Option<i64>,
    pub is_sticker: bool,
    pub message_guid: String,
}

#[derive(Debug, Clone)]
pub struct RawChatRow {
    pub rowid: i64,
    pub chat_identifier: Option<String>,
    pub display_name: Option<String>,
    pub service_name: Option<String>,
    pub participants: Option<String>,
    pub created_date: Option<i64>,
    pub last_message_date: Option<i64>,
    pub is_group: bool,
}

/// Most recent login identifiers gleaned from `chat.account_login`.
#[derive(Debug, Clone, Default)]
pub struct LoginHints {
    pub phone: Option<String>,
    pub email: Option<String>,
}

pub struct SourceDb {
    path: PathBuf,
    conn: Option<Connection>,
}

const MESSAGES_SELECT: &str = r"
    SELECT m.ROWID AS message_rowid, m.guid, m.text, m.attributedBody, m.service,
           m.date, m.is_from_me, m.associated_message_guid, m.associated_message_type,
           m.reply_to_guid, sender_handle.id AS sender_identifier,
           chat.ROWID AS chat_rowid";

const MESSAGES_FROM: &str = r"
    FROM message m
    JOIN chat_message_join cmj ON m.ROWID = cmj.message_id
    JOIN chat ON cmj.chat_id = chat.ROWID
    LEFT JOIN handle AS sender_handle ON m.handle_id = sender_handle.ROWID";

impl SourceDb {
    pub fn new(path: &Path) -> Self {
        SourceDb { path: path.to_path_buf(), conn: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reset(&mut self) {
        self.conn = None;
    }

    fn conn(&mut self) -> Result<&Connection> {
        if self.conn.is_none() {
            let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("Cannot open source database {}", self.path.to_string_lossy()))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            self.conn = Some(conn);
        }
        Ok(self.conn.as_ref().unwrap())
    }

    /// Messages with source row-id strictly above `last_rowid`, ascending,
    /// plus the highest row-id observed. Empty batch and unchanged watermark on error.
    pub fn fetch_messages(&mut self, last_rowid: i64) -> (Vec<RawMessageRow>, i64) {
        match self.fetch_messages_inner(last_rowid) {
            Ok(result) => result,
            Err(e) => {
                log::error!("Failed to fetch messages above row-id {last_rowid}: {e}");
                self.reset();
                (vec![], last_rowid)
            }
        }
    }

    fn fetch_messages_inner(&mut self, last_rowid: i64) -> Result<(Vec<RawMessageRow>, i64)> {
        let sql = format!("{MESSAGES_SELECT}, NULL AS chat_participants {MESSAGES_FROM} \
                           WHERE m.ROWID > ?1 ORDER BY m.ROWID ASC");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([last_rowid])?;
        let mut result = vec![];
        while let Some(row) = rows.next()? {
            result.push(read_message_row(row)?);
        }
        let new_high = result.iter().map(|m| m.rowid).max().unwrap_or(last_rowid);
        if !result.is_empty() {
            log::info!("fetch_messages -> {} rows using ROWID > {last_rowid}, max_rowid={new_high}",
                       result.len());
        }
        Ok((result, new_high))
    }

    /// The full message set (optionally since a cutoff), with per-chat
    /// participant lists joined in. Used by the one-shot imports.
    pub fn fetch_all_messages(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<RawMessageRow>> {
        let mut sql = format!(
            "{MESSAGES_SELECT}, GROUP_CONCAT(DISTINCT chat_handle.id) AS chat_participants \
             {MESSAGES_FROM} \
             LEFT JOIN chat_handle_join ON chat.ROWID = chat_handle_join.chat_id \
             LEFT JOIN handle AS chat_handle ON chat_handle_join.handle_id = chat_handle.ROWID");
        let mut params: Vec<i64> = vec![];
        if let Some(since) = since {
            sql.push_str(" WHERE m.date > ?1");
            params.push(timeconv::utc_to_apple_ns(since)
                .context("Cutoff instant is not representable in nanoseconds")?);
        }
        sql.push_str(" GROUP BY m.ROWID ORDER BY m.ROWID ASC");

        let path_display = self.path.to_string_lossy().into_owned();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut result = vec![];
        while let Some(row) = rows.next()? {
            result.push(read_message_row(row)?);
        }
        log::info!("Extracted {} messages from {}", result.len(), path_display);
        Ok(result)
    }

    /// Attachments with source row-id strictly above `last_rowid`, ascending.
    pub fn fetch_attachments(&mut self, last_rowid: i64) -> (Vec<RawAttachmentRow>, i64) {
        match self.fetch_attachments_inner(last_rowid) {
            Ok(result) => result,
            Err(e) => {
                log::error!("Failed to fetch attachments above row-id {last_rowid}: {e}");
                self.reset();
                (vec![], last_rowid)
            }
        }
    }

    fn fetch_attachments_inner(&mut self, last_rowid: i64) -> Result<(Vec<RawAttachmentRow>, i64)> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(r"
            SELECT a.ROWID AS attachment_rowid, a.guid, a.created_date, a.filename, a.uti,
                   a.mime_type, a.total_bytes, a.is_sticker, m.guid AS message_guid
            FROM attachment a
            JOIN message_attachment_join maj ON a.ROWID = maj.attachment_id
            JOIN message m ON maj.message_id = m.ROWID
            WHERE a.ROWID > ?1
            ORDER BY a.ROWID ASC
        ")?;
        let mut rows = stmt.query([last_rowid])?;
        let mut result = vec![];
        while let Some(row) = rows.next()? {
            result.push(read_attachment_row(row)?);
        }
        let new_high = result.iter().map(|a| a.rowid).max().unwrap_or(last_rowid);
        if !result.is_empty() {
            log::info!("fetch_attachments -> {} rows using ROWID > {last_rowid}, max_rowid={new_high}",
                       result.len());
        }
        Ok((result, new_high))
    }

    pub fn fetch_all_attachments(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<RawAttachmentRow>> {
        let mut sql = String::from(r"
            SELECT a.ROWID AS attachment_rowid, a.guid, a.created_date, a.filename, a.uti,
                   a.mime_type, a.total_bytes, a.is_sticker, m.guid AS message_guid
            FROM attachment a
            JOIN message_attachment_join maj ON a.ROWID = maj.attachment_id
            JOIN message m ON maj.message_id = m.ROWID");
        let mut params: Vec<i64> = vec![];
        if let Some(since) = since {
            sql.push_str(" WHERE a.created_date > ?1");
            params.push(timeconv::utc_to_apple_ns(since)
                .context("Cutoff instant is not representable in nanoseconds")?);
        }
        sql.push_str(" ORDER BY a.created_date ASC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut result = vec![];
        while let Some(row) = rows.next()? {
            result.push(read_attachment_row(row)?);
        }
        Ok(result)
    }

    /// Chats with participants, first/last message dates and a group flag.
    pub fn fetch_chats(&mut self) -> Result<Vec<RawChatRow>> {
        let path_display = self.path.to_string_lossy().into_owned();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(r"
            SELECT chat.ROWID AS chat_rowid, chat.chat_identifier, chat.display_name,
                   chat.service_name,
                   GROUP_CONCAT(DISTINCT handle.id) AS participants,
                   MIN(message.date) AS created_date, MAX(message.date) AS last_message_date,
                   CASE WHEN COUNT(DISTINCT chat_handle_join.handle_id) > 1 THEN 1 ELSE 0 END AS is_group
            FROM chat
            LEFT JOIN chat_handle_join ON chat.ROWID = chat_handle_join.chat_id
            LEFT JOIN handle ON chat_handle_join.handle_id = handle.ROWID
            LEFT JOIN chat_message_join ON chat.ROWID = chat_message_join.chat_id
            LEFT JOIN message ON chat_message_join.message_id = message.ROWID
            GROUP BY chat.ROWID
        ")?;
        let mut rows = stmt.query([])?;
        let mut result = vec![];
        while let Some(row) = rows.next()? {
            result.push(RawChatRow {
                rowid: row.get("chat_rowid")?,
                chat_identifier: row.get("chat_identifier")?,
                display_name: row.get("display_name")?,
                service_name: row.get("service_name")?,
                participants: row.get("participants")?,
                created_date: row.get("created_date")?,
                last_message_date: row.get("last_message_date")?,
                is_group: row.get::<_, i64>("is_group")? != 0,
            });
        }
        log::info!("Extracted {} chats from {}", result.len(), path_display);
        Ok(result)
    }

    /// Source chat row-id -> comma-joined participant handle list.
    pub fn participants_by_chat_rowid(&mut self) -> Result<HashMap<i64, String, Hasher>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(r"
            SELECT chat.ROWID AS chat_rowid,
                   GROUP_CONCAT(DISTINCT handle.id) AS participants
            FROM chat
            LEFT JOIN chat_handle_join ON chat.ROWID = chat_handle_join.chat_id
            LEFT JOIN handle ON chat_handle_join.handle_id = handle.ROWID
            GROUP BY chat.ROWID
        ")?;
        let mut rows = stmt.query([])?;
        let mut result: HashMap<i64, String, Hasher> = HashMap::default();
        while let Some(row) = rows.next()? {
            let chat_rowid: i64 = row.get("chat_rowid")?;
            let participants: Option<String> = row.get("participants")?;
            result.insert(chat_rowid, participants.unwrap_or_default());
        }
        Ok(result)
    }

    /// The most recent `P:+…` and `E:…` login entries of `chat.account_login`.
    pub fn account_login_hints(&mut self) -> Result<LoginHints> {
        let conn = self.conn()?;
        let phone: Option<String> = conn.query_row(r"
            SELECT account_login FROM chat
            WHERE account_login LIKE 'P:+%' AND account_login != 'P:+'
        ", [], |r| r.get(0)).optional()?;
        let email: Option<String> = conn.query_row(r"
            SELECT account_login FROM chat
            WHERE account_login LIKE 'E:%' AND account_login != 'E:'
        ", [], |r| r.get(0)).optional()?;

        Ok(LoginHints {
            phone: phone.map(|p| p.replace("P:+", "").trim().to_owned()).filter(|p| !p.is_empty()),
            email: email.map(|e| e.replace("E:", "").trim().to_lowercase()).filter(|e| !e.is_empty()),
        })
    }

    pub fn max_message_rowid(&mut self) -> Result<i64> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row("SELECT MAX(ROWID) FROM message", [], |r| r.get(0))?;
        Ok(max.unwrap_or(0))
    }

    pub fn max_attachment_rowid(&mut self) -> Result<i64> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row("SELECT MAX(ROWID) FROM attachment", [], |r| r.get(0))?;
        Ok(max.unwrap_or(0))
    }
}

fn read_message_row(row: &Row) -> Result<RawMessageRow> {
    Ok(RawMessageRow {
        rowid: row.get("message_rowid")?,
        guid: row.get("guid")?,
        text: row.get("text")?,
        attributed_body: row.get("attributedBody")?,
        service: row.get("service")?,
        date_ns: row.get::<_, Option<i64>>("date")?.and_then(timeconv::to_nanos),
        is_from_me: row.get::<_, Option<i64>>("is_from_me")?.unwrap_or(0) != 0,
        associated_message_guid: row.get("associated_message_guid")?,
        associated_message_type: row.get("associated_message_type")?,
        reply_to_guid: row.get("reply_to_guid")?,
        sender_identifier: row.get("sender_identifier")?,
        source_chat_rowid: row.get("chat_rowid")?,
        chat_participants: row.get("chat_participants")?,
    })
}

fn read_attachment_row(row: &Row) -> Result<RawAttachmentRow> {
    Ok(RawAttachmentRow {
        rowid: row.get("attachment_rowid")?,
        guid: row.get("guid")?,
        created_date: row.get("created_date")?,
        filename: row.get("filename")?,
        uti: row.get("uti")?,
        mime_type: row.get("mime_type")?,
        total_bytes: row.get("total_bytes")?,
        is_sticker: row.get::<_, Option<i64>>("is_sticker")?.unwrap_or(0) != 0,
        message_guid: row.get("message_guid")?,
    })
}

/// Location of the live Messages database.
pub fn live_chat_db_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join("Library").join("Messages").join("chat.db"))
}
