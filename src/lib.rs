#[macro_use]
extern crate num_derive;

use std::path::Path;

use prelude::*;

use crate::cache::SyncCaches;
use crate::extract::SourceDb;
use crate::store::{watermarks, Store};

mod backup;
mod cache;
mod convo;
mod entities;
mod extract;
mod importer;
mod norm;
mod store;
mod sync;
#[cfg(test)]
mod test_utils;
mod timeconv;
mod utils;
mod watcher;

pub mod prelude {
    pub use std::collections::{HashMap, HashSet};

    pub use itertools::Itertools;

    pub use crate::{err, require};
    pub use crate::entities::*;
    #[cfg(test)]
    pub use crate::test_utils::*;
    pub use crate::utils::*;
}

//
// Entry points
//

/// One-shot import of an iPhone backup snapshot, followed by a full
/// fresh-split-and-compare re-derivation of conversations.
pub fn run_backup_import(db_file: &Path, backup_dir: &Path) -> EmptyRes {
    let store = Store::open(db_file)?;
    let mut caches = SyncCaches::new();
    importer::import_backup_data(&store, &mut caches, backup_dir, convo::DEFAULT_GAP_THRESHOLD_SECS)
}

/// Initial live import, watermark and cache initialisation, then the watcher
/// tailing the live database until cancelled.
pub async fn run_live_sync(db_file: &Path) -> EmptyRes {
    let store = Store::open(db_file)?;
    let mut caches = SyncCaches::new();

    log::info!("Starting initial data import...");
    importer::import_live_data(&store, &mut caches, None, convo::DEFAULT_GAP_THRESHOLD_SECS)?;
    log::info!("Initial data import finished");

    let mut source = SourceDb::new(&extract::live_chat_db_path()?);
    store.transaction(|txn| {
        watermarks::initialize_timestamp_watermark_if_missing(txn)?;
        watermarks::initialize_rowid_watermarks_if_missing(txn, &mut source)?;
        Ok(())
    })?;

    // Rebuild every cache fresh before the watcher starts; from here on the
    // watcher relies on incremental updates only.
    caches.reset_all();
    store.transaction(|txn| caches.ensure_populated(txn))?;
    caches.populate_source_participants(&mut source)?;

    log::info!("Starting live sync watcher...");
    watcher::watch(&store, &mut source, &mut caches, convo::DEFAULT_GAP_THRESHOLD_SECS).await
}
