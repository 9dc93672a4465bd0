pub mod attachments;
pub mod chats;
pub mod contacts;
pub mod messages;

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;

/// Which ingestion mode a batch belongs to. The live tail assumes the source
/// is append-only and never touches existing rows; a snapshot re-ingestion
/// updates rows whose GUIDs are already known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestMode {
    Live,
    Backup,
}
