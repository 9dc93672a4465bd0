//! Contact population: the address-book extract-transform-load for backup and
//! live databases, the own-user contact, and the login-hint refresh of the
//! own-user identifiers.

use std::fs;
use std::path::{Path, PathBuf};

use diesel::prelude::*;
use rusqlite::{Connection, OpenFlags};

use crate::extract::LoginHints;
use crate::norm;
use crate::prelude::*;
use crate::store::mapping::schema;
use crate::store::mapping::{RawContact, RawContactIdentifier};
use crate::store::Store;
use crate::timeconv;

pub const MYSELF_NAME: &str = "Me";

const LIVE_ADDRESS_BOOK_FILENAME: &str = "AddressBook-v22.abcddb";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressBookKind {
    /// `AddressBook.sqlitedb` out of an iPhone backup.
    Backup,
    /// `AddressBook-v22.abcddb` of the local Contacts app.
    Live,
}

struct RawContactRow {
    first_name: Option<String>,
    last_name: Option<String>,
    identifier: String,
}

struct NewContact {
    name: String,
    identifier: String,
    kind: IdentifierKind,
    data_source: String,
}

/// Returns the id of the "is-me" contact, creating it on first use.
pub fn ensure_myself(txn: &mut SqliteConnection) -> Result<ContactId> {
    let existing: Option<i64> = schema::contact::table
        .filter(schema::contact::is_myself.eq(1))
        .select(schema::contact::id)
        .first(txn)
        .optional()?;
    if let Some(id) = existing {
        return Ok(ContactId(id));
    }
    let id: i64 = diesel::insert_into(schema::contact::table)
        .values(RawContact {
            id: None,
            name: Some(MYSELF_NAME.to_owned()),
            is_myself: 1,
            data_source: Some("system_user".to_owned()),
        })
        .returning(schema::contact::id)
        .get_result(txn)?;
    log::info!("Created the own-user contact, id {id}");
    Ok(ContactId(id))
}

pub fn etl_address_book(store: &Store, db_path: &Path, kind: AddressBookKind) -> Result<usize> {
    let source_type = match kind {
        AddressBookKind::Live => "live_addressbook",
        AddressBookKind::Backup => "backup_addressbook",
    };
    log::info!("Starting contacts ETL from {source_type}: {}", db_path.to_string_lossy());

    let raw_contacts = extract_contacts(db_path, kind)?;
    let transformed = raw_contacts.iter()
        .filter_map(|c| transform_contact(c, source_type))
        .collect_vec();

    let imported = store.transaction(|txn| {
        ensure_myself(txn)?;
        load_contacts(txn, &transformed)
    })?;
    log::info!("Imported {imported} new contacts from {}", db_path.to_string_lossy());
    Ok(imported)
}

/// Runs the contacts ETL over every live address book found on this machine.
pub fn etl_live_contacts(store: &Store) -> Result<usize> {
    let mut total = 0;
    for db_path in find_live_address_books()? {
        total += etl_address_book(store, &db_path, AddressBookKind::Live)?;
    }
    Ok(total)
}

/// Recursively searches the user's AddressBook directory (Sources included)
/// for live address-book databases.
pub fn find_live_address_books() -> Result<Vec<PathBuf>> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    let root = PathBuf::from(home).join("Library").join("Application Support").join("AddressBook");
    let mut found = vec![];
    collect_address_books(&root, &mut found);
    if found.is_empty() {
        log::warn!("No address-book databases found under {}", root.to_string_lossy());
    } else {
        log::info!("Found {} live address-book database(s)", found.len());
    }
    Ok(found)
}

fn collect_address_books(dir: &Path, acc: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_address_books(&path, acc);
        } else if path.file_name().is_some_and(|name| name == LIVE_ADDRESS_BOOK_FILENAME) {
            acc.push(path);
        }
    }
}

fn extract_contacts(db_path: &Path, kind: AddressBookKind) -> Result<Vec<RawContactRow>> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("Cannot open address book {}", db_path.to_string_lossy()))?;

    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let (required, sql): (&[&str], &str) = match kind {
        AddressBookKind::Live => (
            &["ZABCDRECORD", "ZABCDPHONENUMBER", "ZABCDMESSAGINGADDRESS"],
            r"
            SELECT ZABCDRECORD.ZFIRSTNAME AS first_name, ZABCDRECORD.ZLASTNAME AS last_name,
                   ZABCDPHONENUMBER.ZFULLNUMBER AS identifier
            FROM ZABCDRECORD
            LEFT JOIN ZABCDPHONENUMBER ON ZABCDPHONENUMBER.ZOWNER = ZABCDRECORD.Z_PK
            WHERE ZABCDPHONENUMBER.ZFULLNUMBER IS NOT NULL
            UNION
            SELECT ZABCDRECORD.ZFIRSTNAME AS first_name, ZABCDRECORD.ZLASTNAME AS last_name,
                   ZABCDMESSAGINGADDRESS.ZADDRESS AS identifier
            FROM ZABCDRECORD
            LEFT JOIN ZABCDMESSAGINGADDRESS ON ZABCDMESSAGINGADDRESS.ZOWNER = ZABCDRECORD.Z_PK
            WHERE ZABCDMESSAGINGADDRESS.ZADDRESS IS NOT NULL
            "),
        AddressBookKind::Backup => (
            &["ABPerson", "ABMultiValue"],
            r"
            SELECT ABPerson.First AS first_name, ABPerson.Last AS last_name,
                   ABMultiValue.value AS identifier
            FROM ABPerson
            LEFT JOIN ABMultiValue ON ABMultiValue.record_id = ABPerson.ROWID
            WHERE ABMultiValue.value IS NOT NULL
            "),
    };

    let missing = required.iter().filter(|t| !tables.iter().any(|name| name == *t)).collect_vec();
    if !missing.is_empty() {
        log::warn!("Missing required tables in {}: {}",
                   db_path.to_string_lossy(), missing.iter().join(", "));
        return Ok(vec![]);
    }

    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut result = vec![];
    while let Some(row) = rows.next()? {
        result.push(RawContactRow {
            first_name: row.get("first_name")?,
            last_name: row.get("last_name")?,
            identifier: row.get("identifier")?,
        });
    }
    log::info!("Extracted {} contacts from {}", result.len(), db_path.to_string_lossy());
    Ok(result)
}

fn transform_contact(contact: &RawContactRow, source_type: &str) -> Option<NewContact> {
    let name = format!("{} {}",
                       contact.first_name.as_deref().unwrap_or(""),
                       contact.last_name.as_deref().unwrap_or(""))
        .trim().to_owned();
    let identifier = contact.identifier.as_str();

    // System and carrier entries are not people.
    if name.starts_with('#') || identifier.starts_with('#')
        || name.starts_with('*') || identifier.starts_with('*')
        || name.contains("VZ") || name.contains("Roadside") || name.contains("Assistance") {
        return None;
    }

    let kind = IdentifierKind::infer(identifier);
    let identifier = norm::canonical_identifier(identifier);
    let name = if name.is_empty() { identifier.clone() } else { name };
    Some(NewContact { name, identifier, kind, data_source: source_type.to_owned() })
}

fn load_contacts(txn: &mut SqliteConnection, contacts: &[NewContact]) -> Result<usize> {
    let existing_rows: Vec<(Option<String>, String, String)> = schema::contact_identifier::table
        .inner_join(schema::contact::table)
        .select((schema::contact::name,
                 schema::contact_identifier::identifier,
                 schema::contact_identifier::kind))
        .load(txn)?;
    let existing: HashSet<(String, String, String)> = existing_rows.into_iter()
        .map(|(name, identifier, kind)| (name.unwrap_or_default(), identifier, kind))
        .collect();

    let mut imported = 0;
    for contact in contacts {
        let key = (contact.name.clone(), contact.identifier.clone(), contact.kind.as_str().to_owned());
        if existing.contains(&key) {
            continue;
        }
        let contact_id: i64 = diesel::insert_into(schema::contact::table)
            .values(RawContact {
                id: None,
                name: Some(contact.name.clone()),
                is_myself: 0,
                data_source: Some(contact.data_source.clone()),
            })
            .returning(schema::contact::id)
            .get_result(txn)?;
        diesel::insert_into(schema::contact_identifier::table)
            .values(RawContactIdentifier {
                id: None,
                contact_id,
                identifier: contact.identifier.clone(),
                kind: contact.kind.as_str().to_owned(),
                is_primary: 1,
                last_used: None,
            })
            .on_conflict_do_nothing()
            .execute(txn)?;
        imported += 1;
    }
    Ok(imported)
}

/// Replaces the own-user phone/email identifiers with the most recent login
/// hints parsed out of the source database. Delete-then-insert, one transaction.
pub fn refresh_myself_identifiers(store: &Store, hints: &LoginHints) -> EmptyRes {
    if hints.phone.is_none() && hints.email.is_none() {
        return Ok(());
    }
    store.transaction(|txn| {
        let myself = ensure_myself(txn)?;
        let now_ns = timeconv::utc_to_unix_ns(chrono::Utc::now());
        if let Some(ref phone) = hints.phone {
            replace_identifier(txn, myself, &norm::normalize_phone(phone), IdentifierKind::Phone, now_ns)?;
        }
        if let Some(ref email) = hints.email {
            replace_identifier(txn, myself, &norm::normalize_email(email), IdentifierKind::Email, now_ns)?;
        }
        log::info!("Own-user contact identifiers refreshed from the source login hints");
        Ok(())
    })
}

fn replace_identifier(txn: &mut SqliteConnection,
                      contact_id: ContactId,
                      identifier: &str,
                      kind: IdentifierKind,
                      now_ns: Option<i64>) -> EmptyRes {
    diesel::delete(schema::contact_identifier::table
        .filter(schema::contact_identifier::contact_id.eq(*contact_id))
        .filter(schema::contact_identifier::kind.eq(kind.as_str())))
        .execute(txn)?;
    diesel::insert_into(schema::contact_identifier::table)
        .values(RawContactIdentifier {
            id: None,
            contact_id: *contact_id,
            identifier: identifier.to_owned(),
            kind: kind.as_str().to_owned(),
            is_primary: 1,
            last_used: now_ns,
        })
        .execute(txn)?;
    Ok(())
}
