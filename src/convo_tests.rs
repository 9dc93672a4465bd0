#![allow(unused_imports)]

use diesel::prelude::*;
use pretty_assertions::assert_eq;

use crate::prelude::*;
use crate::store::mapping::schema;
use crate::store::mapping::RawMessage;
use crate::store::Store;
use crate::timeconv::unix_ns_to_utc;

use super::*;

fn pt(id: i64, t_secs: i64, sender: Option<i64>) -> MessagePoint {
    MessagePoint {
        id: MessageId(id),
        time_ns: t_secs * NS_PER_SEC,
        sender_id: sender.map(ContactId),
    }
}

fn since_secs(t_secs: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    Some(unix_ns_to_utc(t_secs * NS_PER_SEC))
}

/// Conversations of a chat must be pairwise time-disjoint.
fn assert_disjoint(convos: &[(i64, i64, i64, i32)]) {
    for pair in convos.windows(2) {
        assert!(pair[0].2 < pair[1].1, "Conversations overlap: {pair:?}");
    }
}

//
// Segmentation
//

#[test]
fn splits_at_silences_exceeding_the_gap() {
    let points = [
        pt(1, 0, Some(10)),
        pt(2, 60, Some(11)),
        pt(3, 600, Some(10)),
        pt(4, 11_500, Some(11)),
    ];
    let segments = split_into_segments(&points, DEFAULT_GAP_THRESHOLD_SECS);
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].message_ids, vec![1, 2, 3]);
    assert_eq!(segments[1].message_ids, vec![4]);
    assert_eq!(segments[0].start_ns, 0);
    assert_eq!(segments[0].end_ns, 600 * NS_PER_SEC);
    assert_eq!(segments[0].initiator_id, ContactId(10));
    assert_eq!(segments[0].participant_ids, vec![ContactId(10), ContactId(11)]);
}

#[test]
fn gap_exactly_at_threshold_does_not_split() {
    let boundary = [pt(1, 0, Some(1)), pt(2, DEFAULT_GAP_THRESHOLD_SECS, Some(1))];
    assert_eq!(split_into_segments(&boundary, DEFAULT_GAP_THRESHOLD_SECS).len(), 1);

    let beyond = [pt(1, 0, Some(1)), pt(2, DEFAULT_GAP_THRESHOLD_SECS + 1, Some(1))];
    assert_eq!(split_into_segments(&beyond, DEFAULT_GAP_THRESHOLD_SECS).len(), 2);
}

#[test]
fn segments_without_senders_are_discarded() {
    let points = [pt(1, 0, None), pt(2, 60, None), pt(3, 20_000, Some(5))];
    let segments = split_into_segments(&points, DEFAULT_GAP_THRESHOLD_SECS);
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].message_ids, vec![3]);
}

#[test]
fn initiator_is_the_first_sender_bearing_message() {
    let points = [pt(1, 0, None), pt(2, 60, Some(7)), pt(3, 120, Some(8))];
    let segments = split_into_segments(&points, DEFAULT_GAP_THRESHOLD_SECS);
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].initiator_id, ContactId(7));
    // The sender-less head still belongs to the segment.
    assert_eq!(segments[0].message_ids, vec![1, 2, 3]);
}

#[test]
fn empty_input_produces_no_segments() {
    assert!(split_into_segments(&[], DEFAULT_GAP_THRESHOLD_SECS).is_empty());
}

//
// Live (append-or-create) reconciliation
//

#[test]
fn live_reconciliation_appends_and_creates() -> EmptyRes {
    let store = new_test_store("convo-live");
    let alice = insert_test_contact(&store, "Alice");
    let chat = insert_test_chat(&store, "4155550100");

    let m1 = insert_test_message(&store, chat, Some(alice), "m1", 0);
    let _m2 = insert_test_message(&store, chat, Some(alice), "m2", 60);
    let m3 = insert_test_message(&store, chat, Some(alice), "m3", 600);
    let m4 = insert_test_message(&store, chat, Some(alice), "m4", 11_500);

    let stats = store.transaction(|txn|
        reconcile_live(txn, &[chat], None, DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, ReconcileStats { imported: 2, updated: 0 });

    let convos = chat_conversations(&store, chat);
    assert_eq!(convos.len(), 2);
    let (first_id, second_id) = (convos[0].0, convos[1].0);
    assert_eq!(convos[0].3, 3);
    assert_eq!(conversation_of(&store, m1), Some(first_id));
    assert_eq!(conversation_of(&store, m3), Some(first_id));
    assert_eq!(conversation_of(&store, m4), Some(second_id));

    // A message within the gap of the last conversation's end appends to it,
    // with the cutoff at the previous timestamp watermark.
    let m5 = insert_test_message(&store, chat, Some(alice), "m5", 12_000);
    let stats = store.transaction(|txn|
        reconcile_live(txn, &[chat], since_secs(11_500), DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, ReconcileStats { imported: 0, updated: 1 });
    assert_eq!(conversation_of(&store, m4), Some(second_id));
    assert_eq!(conversation_of(&store, m5), Some(second_id));

    // A message beyond the gap opens a new conversation.
    let m6 = insert_test_message(&store, chat, Some(alice), "m6", 30_000);
    let stats = store.transaction(|txn|
        reconcile_live(txn, &[chat], since_secs(12_000), DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, ReconcileStats { imported: 1, updated: 1 });

    let convos = chat_conversations(&store, chat);
    assert_eq!(convos.len(), 3);
    assert_eq!(conversation_of(&store, m6), Some(convos[2].0));
    assert_disjoint(&convos);
    Ok(())
}

#[test]
fn live_append_is_inclusive_at_zero_gap() -> EmptyRes {
    let store = new_test_store("convo-zero-gap");
    let alice = insert_test_contact(&store, "Alice");
    let chat = insert_test_chat(&store, "4155550100");

    let m1 = insert_test_message(&store, chat, Some(alice), "m1", 1000);
    store.transaction(|txn| reconcile_live(txn, &[chat], None, DEFAULT_GAP_THRESHOLD_SECS))?;

    // A new message sharing the previous end instant still appends.
    let m2 = insert_test_message(&store, chat, Some(alice), "m2", 1000);
    let stats = store.transaction(|txn|
        reconcile_live(txn, &[chat], since_secs(1000), DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, ReconcileStats { imported: 0, updated: 1 });

    let convos = chat_conversations(&store, chat);
    assert_eq!(convos.len(), 1);
    assert_eq!(conversation_of(&store, m1), Some(convos[0].0));
    assert_eq!(conversation_of(&store, m2), Some(convos[0].0));
    Ok(())
}

#[test]
fn chats_are_reconciled_in_isolation() -> EmptyRes {
    let store = new_test_store("convo-isolated");
    let alice = insert_test_contact(&store, "Alice");
    let bob = insert_test_contact(&store, "Bob");
    let chat_a = insert_test_chat(&store, "4155550100");
    let chat_b = insert_test_chat(&store, "442079460000");

    let a1 = insert_test_message(&store, chat_a, Some(alice), "a1", 0);
    let b1 = insert_test_message(&store, chat_b, Some(bob), "b1", 100);

    let stats = store.transaction(|txn|
        reconcile_live_all(txn, None, DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, ReconcileStats { imported: 2, updated: 0 });

    let convo_a = conversation_of(&store, a1).unwrap();
    let convo_b = conversation_of(&store, b1).unwrap();
    assert_ne!(convo_a, convo_b);
    assert_eq!(chat_conversations(&store, chat_a).len(), 1);
    assert_eq!(chat_conversations(&store, chat_b).len(), 1);
    Ok(())
}

#[test]
fn untimed_and_tapback_rows_are_not_segmented() -> EmptyRes {
    let store = new_test_store("convo-untimed");
    let alice = insert_test_contact(&store, "Alice");
    let chat = insert_test_chat(&store, "4155550100");
    let timed = insert_test_message(&store, chat, Some(alice), "timed", 50);

    let (untimed, tapback) = store.transaction(|txn| {
        let untimed: i64 = diesel::insert_into(schema::message::table)
            .values(RawMessage {
                internal_id: None,
                chat_id: *chat,
                sender_id: Some(*alice),
                conversation_id: None,
                content: None,
                time_sent: None,
                is_from_me: 0,
                message_type: 0,
                service: None,
                source_guid: "untimed".to_owned(),
                associated_guid: None,
                reply_to_guid: None,
            })
            .returning(schema::message::internal_id)
            .get_result(txn)?;
        let tapback: i64 = diesel::insert_into(schema::message::table)
            .values(RawMessage {
                internal_id: None,
                chat_id: *chat,
                sender_id: Some(*alice),
                conversation_id: None,
                content: None,
                time_sent: Some(60 * NS_PER_SEC),
                is_from_me: 0,
                message_type: 2000,
                service: None,
                source_guid: "tapback".to_owned(),
                associated_guid: None,
                reply_to_guid: None,
            })
            .returning(schema::message::internal_id)
            .get_result(txn)?;
        Ok((untimed, tapback))
    })?;

    store.transaction(|txn| reconcile_live(txn, &[chat], None, DEFAULT_GAP_THRESHOLD_SECS))?;

    assert!(conversation_of(&store, timed).is_some());
    assert_eq!(conversation_of(&store, MessageId(untimed)), None);
    assert_eq!(conversation_of(&store, MessageId(tapback)), None);
    Ok(())
}

//
// Backup (fresh-split-and-compare) reconciliation
//

fn seed_split_chat(store: &Store) -> (ContactId, ChatId, Vec<MessageId>) {
    let alice = insert_test_contact(store, "Alice");
    let chat = insert_test_chat(store, "4155550100");
    let messages = [("m1", 0), ("m2", 60), ("m3", 600), ("m4", 11_500)].iter()
        .map(|(guid, t_secs)| insert_test_message(store, chat, Some(alice), guid, *t_secs))
        .collect_vec();
    (alice, chat, messages)
}

#[test]
fn fresh_split_reuses_stable_conversations() -> EmptyRes {
    let store = new_test_store("convo-fresh-stable");
    let (_alice, chat, _messages) = seed_split_chat(&store);

    let stats = store.transaction(|txn| fresh_split_compare(txn, DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, FreshSplitStats { reused: 0, replaced: 2 });
    let before = chat_conversations(&store, chat);
    assert_eq!(before.len(), 2);

    // Identical re-run: no writes, ids retained.
    let stats = store.transaction(|txn| fresh_split_compare(txn, DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, FreshSplitStats { reused: 2, replaced: 0 });
    assert_eq!(chat_conversations(&store, chat), before);
    Ok(())
}

#[test]
fn fresh_split_replaces_only_changed_intervals() -> EmptyRes {
    let store = new_test_store("convo-fresh-replace");
    let (alice, chat, messages) = seed_split_chat(&store);
    store.transaction(|txn| fresh_split_compare(txn, DEFAULT_GAP_THRESHOLD_SECS))?;
    let before = chat_conversations(&store, chat);
    let (first_before, second_before) = (before[0].0, before[1].0);

    // A historical message interleaves into the first interval.
    let m_new = insert_test_message(&store, chat, Some(alice), "m-new", 300);
    let stats = store.transaction(|txn| fresh_split_compare(txn, DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, FreshSplitStats { reused: 1, replaced: 1 });

    let after = chat_conversations(&store, chat);
    assert_eq!(after.len(), 2);
    assert_ne!(after[0].0, first_before, "Changed interval must be replaced");
    assert_eq!(after[1].0, second_before, "Unchanged interval must keep its id");
    assert_eq!(after[0].3, 4);
    assert_eq!(conversation_of(&store, m_new), Some(after[0].0));
    assert_eq!(conversation_of(&store, messages[0]), Some(after[0].0));
    assert_eq!(conversation_of(&store, messages[3]), Some(after[1].0));
    assert_disjoint(&after);
    Ok(())
}

#[test]
fn fresh_split_builds_initial_segmentation() -> EmptyRes {
    let store = new_test_store("convo-fresh-initial");
    let (_alice, chat, messages) = seed_split_chat(&store);

    let stats = store.transaction(|txn| fresh_split_compare(txn, DEFAULT_GAP_THRESHOLD_SECS))?;
    assert_eq!(stats, FreshSplitStats { reused: 0, replaced: 2 });

    let convos = chat_conversations(&store, chat);
    assert_eq!(convos.len(), 2);
    assert_eq!((convos[0].1, convos[0].2, convos[0].3), (0, 600 * NS_PER_SEC, 3));
    assert_eq!((convos[1].1, convos[1].2, convos[1].3),
               (11_500 * NS_PER_SEC, 11_500 * NS_PER_SEC, 1));
    for (message_id, expected) in messages.iter().zip([convos[0].0, convos[0].0, convos[0].0, convos[1].0]) {
        assert_eq!(conversation_of(&store, *message_id), Some(expected));
    }
    assert_disjoint(&convos);
    Ok(())
}
