//! Locates databases inside an iPhone backup directory. The backup keeps file
//! content at `<backup>/<fileID[:2]>/<fileID>`, with the relative-path to
//! fileID map stored in its Manifest.db.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::prelude::*;

const MANIFEST_FILENAME: &str = "Manifest.db";
const SMS_DB_RELATIVE_PATH: &str = "Library/SMS/sms.db";
const ADDRESS_BOOK_RELATIVE_PATH: &str = "Library/AddressBook/AddressBook.sqlitedb";

pub struct BackupLocator {
    backup_dir: PathBuf,
}

impl BackupLocator {
    pub fn new(backup_dir: &Path) -> Self {
        BackupLocator { backup_dir: backup_dir.to_path_buf() }
    }

    pub fn sms_db_path(&self) -> Result<PathBuf> {
        self.resolve(SMS_DB_RELATIVE_PATH)
    }

    pub fn address_book_db_path(&self) -> Result<PathBuf> {
        self.resolve(ADDRESS_BOOK_RELATIVE_PATH)
    }

    fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        let manifest = self.backup_dir.join(MANIFEST_FILENAME);
        require!(manifest.exists(),
                 "{MANIFEST_FILENAME} not found in {}", self.backup_dir.to_string_lossy());
        let conn = Connection::open_with_flags(&manifest, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        // The files table changed casing across backup format versions.
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        let files_table = ["Files", "files", "File", "file"].into_iter()
            .find(|t| tables.iter().any(|name| name == t))
            .with_context(|| format!("No files table found in the manifest, available tables: {}",
                                     tables.iter().join(", ")))?;

        let file_id: Option<String> = conn.query_row(
            &format!("SELECT fileID FROM {files_table} \
                      WHERE relativePath = ?1 AND domain = 'HomeDomain'"),
            [relative_path], |r| r.get(0)).optional()?;
        let file_id = file_id
            .with_context(|| format!("{relative_path} is not present in the backup manifest"))?;
        require!(file_id.len() > 2, "Malformed fileID '{file_id}' for {relative_path}");

        let resolved = self.backup_dir.join(&file_id[..2]).join(&file_id);
        require!(resolved.exists(),
                 "{relative_path} not found in backup at {}", resolved.to_string_lossy());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::env::temp_dir;
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    fn make_backup_dir(name: &str) -> PathBuf {
        let dir = temp_dir().join(format!("chat-mirror-backup-test-{name}-{}", std::process::id()));
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_manifest(backup_dir: &Path, entries: &[(&str, &str)]) {
        let conn = Connection::open(backup_dir.join(MANIFEST_FILENAME)).unwrap();
        conn.execute_batch("CREATE TABLE Files (fileID TEXT, domain TEXT, relativePath TEXT)").unwrap();
        for (relative_path, file_id) in entries {
            conn.execute("INSERT INTO Files (fileID, domain, relativePath) VALUES (?1, 'HomeDomain', ?2)",
                         [file_id, relative_path]).unwrap();
        }
    }

    #[test]
    fn resolves_sms_db_through_manifest() {
        let dir = make_backup_dir("resolve");
        let file_id = "ab1234567890";
        write_manifest(&dir, &[(SMS_DB_RELATIVE_PATH, file_id)]);
        fs::create_dir_all(dir.join("ab")).unwrap();
        fs::write(dir.join("ab").join(file_id), b"not really a database").unwrap();

        let locator = BackupLocator::new(&dir);
        let resolved = locator.sms_db_path().unwrap();
        assert_eq!(resolved, dir.join("ab").join(file_id));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_database_is_an_error() {
        let dir = make_backup_dir("missing");
        write_manifest(&dir, &[]);

        let locator = BackupLocator::new(&dir);
        assert!(locator.sms_db_path().is_err());
        assert!(locator.address_book_db_path().is_err());

        fs::remove_dir_all(&dir).unwrap();
    }
}
