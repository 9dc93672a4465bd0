use std::cell::RefCell;
use std::fs;
use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::migration::{Migration, MigrationSource};
use diesel::prelude::*;
use diesel::sqlite::Sqlite;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::prelude::*;

pub mod mapping;
pub mod watermarks;

/// The internal store: a single SQLite database holding mirrored and derived data.
/// All access goes through [`Store::transaction`], which commits on clean exit
/// and rolls back on any raised failure.
pub struct Store {
    conn: RefCell<SqliteConnection>,
}

impl Store {
    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./resources/main/migrations");

    pub fn open(db_file: &Path) -> Result<Self> {
        let parent = db_file.parent().context("Database path has no parent directory!")?;
        require!(parent.as_os_str().is_empty() || parent.exists(),
                 "Parent directory for {} does not exist!", path_to_str(db_file)?);
        let file_name = db_file.file_name().context("Database path has no file name!")?;
        let absolute_path = if parent.as_os_str().is_empty() {
            fs::canonicalize(".")?.join(file_name)
        } else {
            fs::canonicalize(parent)?.join(file_name)
        };
        let absolute_path = path_to_str(&absolute_path)?.to_owned();

        let mut conn = SqliteConnection::establish(&absolute_path)?;
        conn.batch_execute(r"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
            PRAGMA foreign_keys = ON;
        ")?;

        require!(!<EmbeddedMigrations as MigrationSource<Sqlite>>::migrations(&Store::MIGRATIONS)
            .normalize_error()?.is_empty(),
                 "Migrations not found!");
        let pending = conn.pending_migrations(Store::MIGRATIONS).normalize_error()?;
        for m in pending.iter() {
            log::info!("Applying migration: {}", m.name());
            conn.run_migration(m).normalize_error()?;
        }

        log::info!("Opened internal store at {absolute_path}");
        Ok(Store { conn: RefCell::new(conn) })
    }

    /// Scoped transactional session: the closure's `Err` rolls everything back.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.borrow_mut();
        conn.transaction(f)
    }
}
