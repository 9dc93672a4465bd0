//! The conversation engine: segments a chat's messages into contiguous runs
//! separated by silences longer than the gap threshold, and reconciles fresh
//! segmentations against the conversations already stored.
//!
//! Two reconciliation modes exist. The live path appends to the most recent
//! conversation or creates new ones, and never rewrites history. The backup
//! path re-derives the whole segmentation and compares membership, keeping
//! conversation ids stable wherever the segmentation did not change.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::prelude::*;
use crate::store::mapping::schema;
use crate::store::mapping::RawConversation;
use crate::timeconv;

#[cfg(test)]
#[path = "convo_tests.rs"]
mod tests;

pub const DEFAULT_GAP_THRESHOLD_SECS: i64 = 10_800; // 3 hours

const NS_PER_SEC: i64 = 1_000_000_000;

/// The slice of a message the segmentation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePoint {
    pub id: MessageId,
    /// Unix epoch nanoseconds.
    pub time_ns: i64,
    pub sender_id: Option<ContactId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start_ns: i64,
    pub end_ns: i64,
    pub message_ids: Vec<i64>,
    /// Sender of the first sender-bearing message.
    pub initiator_id: ContactId,
    /// Distinct senders, in order of first appearance.
    pub participant_ids: Vec<ContactId>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Conversations created.
    pub imported: usize,
    /// Conversations extended by appending.
    pub updated: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FreshSplitStats {
    /// Fresh segments whose membership matched an existing conversation exactly.
    pub reused: usize,
    /// Fresh segments that replaced overlapping conversations.
    pub replaced: usize,
}

/// Splits messages (which must be in ascending timestamp order) into segments
/// at silences longer than `gap_secs`. Segments without a single
/// sender-bearing message are discarded.
pub fn split_into_segments(points: &[MessagePoint], gap_secs: i64) -> Vec<Segment> {
    let gap_ns = gap_secs * NS_PER_SEC;
    let mut segments = vec![];
    let mut current: Vec<&MessagePoint> = vec![];
    for point in points {
        if let Some(last) = current.last() {
            if point.time_ns - last.time_ns > gap_ns {
                segments.extend(close_segment(&current));
                current.clear();
            }
        }
        current.push(point);
    }
    segments.extend(close_segment(&current));
    segments
}

fn close_segment(points: &[&MessagePoint]) -> Option<Segment> {
    let initiator_id = points.iter().find_map(|p| p.sender_id)?;
    Some(Segment {
        start_ns: points.first()?.time_ns,
        end_ns: points.last()?.time_ns,
        message_ids: points.iter().map(|p| *p.id).collect(),
        initiator_id,
        participant_ids: points.iter().filter_map(|p| p.sender_id).unique().collect(),
    })
}

/// Live reconciliation: for each chat, either extends the chat's most recent
/// conversation (when the new segment starts within the gap of its end,
/// inclusive at zero) or creates a new one. `since` restricts the input to
/// messages at or after that cutoff.
pub fn reconcile_live(txn: &mut SqliteConnection,
                      chat_ids: &[ChatId],
                      since: Option<DateTime<Utc>>,
                      gap_secs: i64) -> Result<ReconcileStats> {
    let since_unix_ns = match since {
        Some(dt) => Some(timeconv::utc_to_unix_ns(dt)
            .context("Cutoff instant is not representable in nanoseconds")?),
        None => None,
    };
    let gap_ns = gap_secs * NS_PER_SEC;
    let mut stats = ReconcileStats::default();

    for &chat_id in chat_ids {
        let points = load_chat_messages(txn, chat_id, since_unix_ns)?;
        if points.is_empty() {
            continue;
        }
        let segments = split_into_segments(&points, gap_secs);

        let mut last: Option<(ConversationId, i64)> = schema::conversation::table
            .filter(schema::conversation::chat_id.eq(*chat_id))
            .order(schema::conversation::end_time.desc())
            .select((schema::conversation::id, schema::conversation::end_time))
            .first::<(i64, i64)>(txn)
            .optional()?
            .map(|(id, end_time)| (ConversationId(id), end_time));

        for segment in segments {
            match last {
                Some((last_id, last_end)) if (0..=gap_ns).contains(&(segment.start_ns - last_end)) => {
                    diesel::update(schema::conversation::table.find(*last_id))
                        .set((schema::conversation::end_time.eq(segment.end_ns),
                              schema::conversation::msg_count
                                  .eq(schema::conversation::msg_count + segment.message_ids.len() as i32)))
                        .execute(txn)?;
                    attach_messages(txn, &segment.message_ids, last_id)?;
                    stats.updated += 1;
                    last = Some((last_id, segment.end_ns));
                }
                _ => {
                    let new_id = insert_conversation(txn, chat_id, &segment, gap_secs)?;
                    attach_messages(txn, &segment.message_ids, new_id)?;
                    stats.imported += 1;
                    last = Some((new_id, segment.end_ns));
                }
            }
        }
    }
    Ok(stats)
}

/// Live reconciliation over every chat that has messages.
pub fn reconcile_live_all(txn: &mut SqliteConnection,
                          since: Option<DateTime<Utc>>,
                          gap_secs: i64) -> Result<ReconcileStats> {
    let chat_ids = chats_with_messages(txn)?;
    reconcile_live(txn, &chat_ids, since, gap_secs)
}

/// Backup reconciliation: re-derives the full segmentation of every chat and
/// compares membership against the existing conversations. Where the sorted
/// message-id set matches exactly, the conversation id is reused without a
/// write; otherwise every conversation overlapping the fresh segment's
/// interval is detached and deleted, and a new conversation takes its place.
pub fn fresh_split_compare(txn: &mut SqliteConnection, gap_secs: i64) -> Result<FreshSplitStats> {
    let mut stats = FreshSplitStats::default();
    for chat_id in chats_with_messages(txn)? {
        let chat_stats = fresh_split_chat(txn, chat_id, gap_secs)?;
        stats.reused += chat_stats.reused;
        stats.replaced += chat_stats.replaced;
    }
    log::info!("Fresh split complete. Reused: {}, replaced: {}", stats.reused, stats.replaced);
    Ok(stats)
}

fn fresh_split_chat(txn: &mut SqliteConnection, chat_id: ChatId, gap_secs: i64) -> Result<FreshSplitStats> {
    let points = load_chat_messages(txn, chat_id, None)?;
    let fresh = split_into_segments(&points, gap_secs);

    let existing: Vec<(i64, i64, i64)> = schema::conversation::table
        .filter(schema::conversation::chat_id.eq(*chat_id))
        .select((schema::conversation::id,
                 schema::conversation::start_time,
                 schema::conversation::end_time))
        .load(txn)?;

    let attached: Vec<(Option<i64>, i64)> = schema::message::table
        .filter(schema::message::chat_id.eq(*chat_id))
        .filter(schema::message::conversation_id.is_not_null())
        .select((schema::message::conversation_id, schema::message::internal_id))
        .order(schema::message::internal_id.asc())
        .load(txn)?;
    let mut members_by_conversation: HashMap<i64, Vec<i64>> = HashMap::new();
    for (conversation_id, message_id) in attached {
        if let Some(conversation_id) = conversation_id {
            members_by_conversation.entry(conversation_id).or_default().push(message_id);
        }
    }
    let conversation_by_members: HashMap<Vec<i64>, i64> = members_by_conversation.iter()
        .map(|(&id, members)| (members.clone(), id))
        .collect();

    let mut alive: HashSet<i64> = existing.iter().map(|(id, _, _)| *id).collect();
    let mut stats = FreshSplitStats::default();

    for segment in fresh {
        let members = segment.message_ids.iter().copied().sorted().collect_vec();
        if let Some(&conversation_id) = conversation_by_members.get(&members) {
            if alive.contains(&conversation_id) {
                stats.reused += 1;
                continue;
            }
        }

        // Interval overlap is inclusive on both ends; this keeps boundary
        // cases stable across re-imports.
        let overlapping = existing.iter()
            .filter(|(id, start, end)| {
                alive.contains(id) && *start <= segment.end_ns && *end >= segment.start_ns
            })
            .map(|(id, _, _)| *id)
            .collect_vec();
        if !overlapping.is_empty() {
            diesel::update(schema::message::table
                .filter(schema::message::conversation_id.eq_any(&overlapping)))
                .set(schema::message::conversation_id.eq(None::<i64>))
                .execute(txn)?;
            diesel::delete(schema::conversation::table
                .filter(schema::conversation::id.eq_any(&overlapping)))
                .execute(txn)?;
            for id in &overlapping {
                alive.remove(id);
            }
        }

        let new_id = insert_conversation(txn, chat_id, &segment, gap_secs)?;
        attach_messages(txn, &segment.message_ids, new_id)?;
        stats.replaced += 1;
    }
    Ok(stats)
}

fn chats_with_messages(txn: &mut SqliteConnection) -> Result<Vec<ChatId>> {
    let chat_ids: Vec<i64> = schema::message::table
        .select(schema::message::chat_id)
        .distinct()
        .load(txn)?;
    Ok(chat_ids.into_iter().map(ChatId).collect())
}

/// Normal messages of a chat with a present timestamp, ascending. Messages
/// with absent timestamps cannot be segmented and are left alone.
fn load_chat_messages(txn: &mut SqliteConnection,
                      chat_id: ChatId,
                      since_unix_ns: Option<i64>) -> Result<Vec<MessagePoint>> {
    let mut query = schema::message::table
        .select((schema::message::internal_id,
                 schema::message::time_sent,
                 schema::message::sender_id))
        .filter(schema::message::chat_id.eq(*chat_id))
        .filter(schema::message::message_type.eq(0))
        .filter(schema::message::time_sent.is_not_null())
        .into_boxed();
    if let Some(since) = since_unix_ns {
        query = query.filter(schema::message::time_sent.ge(since));
    }
    let rows: Vec<(i64, Option<i64>, Option<i64>)> = query
        .order((schema::message::time_sent.asc(), schema::message::internal_id.asc()))
        .load(txn)?;
    Ok(rows.into_iter()
        .filter_map(|(id, time_ns, sender_id)| time_ns.map(|time_ns| MessagePoint {
            id: MessageId(id),
            time_ns,
            sender_id: sender_id.map(ContactId),
        }))
        .collect())
}

fn insert_conversation(txn: &mut SqliteConnection,
                       chat_id: ChatId,
                       segment: &Segment,
                       gap_secs: i64) -> Result<ConversationId> {
    let id: i64 = diesel::insert_into(schema::conversation::table)
        .values(RawConversation {
            id: None,
            chat_id: *chat_id,
            initiator_id: Some(*segment.initiator_id),
            start_time: segment.start_ns,
            end_time: segment.end_ns,
            msg_count: segment.message_ids.len() as i32,
            gap_threshold: gap_secs,
        })
        .returning(schema::conversation::id)
        .get_result(txn)?;
    Ok(ConversationId(id))
}

fn attach_messages(txn: &mut SqliteConnection,
                   message_ids: &[i64],
                   conversation_id: ConversationId) -> EmptyRes {
    // Chunked so a huge segment cannot exceed SQLite's bind limit.
    for chunk in message_ids.chunks(1000) {
        diesel::update(schema::message::table
            .filter(schema::message::internal_id.eq_any(chunk)))
            .set(schema::message::conversation_id.eq(Some(*conversation_id)))
            .execute(txn)?;
    }
    Ok(())
}
