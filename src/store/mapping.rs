use diesel::prelude::*;

pub mod schema {
    diesel::table! {
        contact (id) {
            id -> BigInt,
            name -> Nullable<Text>,
            is_myself -> Integer,
            data_source -> Nullable<Text>,
        }
    }

    diesel::table! {
        contact_identifier (id) {
            id -> BigInt,
            contact_id -> BigInt,
            identifier -> Text,
            kind -> Text,
            is_primary -> Integer,
            last_used -> Nullable<BigInt>,
        }
    }

    diesel::table! {
        chat (id) {
            id -> BigInt,
            chat_identifier -> Text,
            name -> Nullable<Text>,
            created_at -> Nullable<BigInt>,
            last_message_at -> Nullable<BigInt>,
            is_group -> Integer,
            service -> Nullable<Text>,
            msg_count -> Integer,
        }
    }

    diesel::table! {
        chat_participant (chat_id, contact_id) {
            chat_id -> BigInt,
            contact_id -> BigInt,
        }
    }

    diesel::table! {
        conversation (id) {
            id -> BigInt,
            chat_id -> BigInt,
            initiator_id -> Nullable<BigInt>,
            start_time -> BigInt,
            end_time -> BigInt,
            msg_count -> Integer,
            gap_threshold -> BigInt,
        }
    }

    diesel::table! {
        message (internal_id) {
            internal_id -> BigInt,
            chat_id -> BigInt,
            sender_id -> Nullable<BigInt>,
            conversation_id -> Nullable<BigInt>,
            content -> Nullable<Text>,
            time_sent -> Nullable<BigInt>,
            is_from_me -> Integer,
            message_type -> Integer,
            service -> Nullable<Text>,
            source_guid -> Text,
            associated_guid -> Nullable<Text>,
            reply_to_guid -> Nullable<Text>,
        }
    }

    diesel::table! {
        reaction (id) {
            id -> BigInt,
            source_guid -> Text,
            original_message_guid -> Nullable<Text>,
            reaction_type -> Nullable<BigInt>,
            sender_id -> Nullable<BigInt>,
            time_sent -> Nullable<BigInt>,
            chat_id -> BigInt,
        }
    }

    diesel::table! {
        attachment (id) {
            id -> BigInt,
            message_internal_id -> BigInt,
            source_guid -> Text,
            created_at -> Nullable<BigInt>,
            file_name -> Nullable<Text>,
            uti -> Nullable<Text>,
            mime_type -> Nullable<Text>,
            size_bytes -> Nullable<BigInt>,
            is_sticker -> Integer,
        }
    }

    diesel::table! {
        live_sync_state (key) {
            key -> Text,
            value -> Text,
        }
    }

    diesel::joinable!(contact_identifier -> contact (contact_id));
    diesel::joinable!(chat_participant -> chat (chat_id));
    diesel::joinable!(chat_participant -> contact (contact_id));
    diesel::joinable!(conversation -> chat (chat_id));
    diesel::joinable!(message -> chat (chat_id));
    diesel::joinable!(attachment -> message (message_internal_id));
    diesel::joinable!(reaction -> chat (chat_id));

    diesel::allow_tables_to_appear_in_same_query!(
        attachment,
        chat,
        chat_participant,
        contact,
        contact_identifier,
        conversation,
        live_sync_state,
        message,
        reaction,
    );
}

//
// Entities
//

#[derive(Debug, PartialEq, Clone, Selectable, Queryable, Insertable)]
#[diesel(table_name = schema::contact)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawContact {
    #[diesel(deserialize_as = i64)]
    pub id: Option<i64>,
    pub name: Option<String>,
    /// Boolean value
    pub is_myself: i32,
    pub data_source: Option<String>,
}

#[derive(Debug, PartialEq, Clone, Selectable, Queryable, Insertable)]
#[diesel(table_name = schema::contact_identifier)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawContactIdentifier {
    #[diesel(deserialize_as = i64)]
    pub id: Option<i64>,
    pub contact_id: i64,
    pub identifier: String,
    pub kind: String,
    /// Boolean value
    pub is_primary: i32,
    pub last_used: Option<i64>,
}

#[derive(Debug, PartialEq, Clone, Selectable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::chat)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct RawChat {
    #[diesel(deserialize_as = i64)]
    pub id: Option<i64>,
    pub chat_identifier: String,
    pub name: Option<String>,
    pub created_at: Option<i64>,
    pub last_message_at: Option<i64>,
    /// Boolean value
    pub is_group: i32,
    pub service: Option<String>,
    pub msg_count: i32,
}

#[derive(Debug, PartialEq, Clone, Identifiable, Selectable, Queryable, Insertable)]
#[diesel(primary_key(chat_id, contact_id))]
#[diesel(table_name = schema::chat_participant)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawChatParticipant {
    pub chat_id: i64,
    pub contact_id: i64,
}

#[derive(Debug, PartialEq, Clone, Selectable, Queryable, Insertable)]
#[diesel(table_name = schema::conversation)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawConversation {
    #[diesel(deserialize_as = i64)]
    pub id: Option<i64>,
    pub chat_id: i64,
    pub initiator_id: Option<i64>,
    /// Unix epoch nanoseconds
    pub start_time: i64,
    /// Unix epoch nanoseconds
    pub end_time: i64,
    pub msg_count: i32,
    /// Seconds
    pub gap_threshold: i64,
}

#[derive(Debug, PartialEq, Clone, Selectable, Queryable, Insertable)]
#[diesel(table_name = schema::message)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawMessage {
    #[diesel(deserialize_as = i64)]
    pub internal_id: Option<i64>,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub conversation_id: Option<i64>,
    pub content: Option<String>,
    /// Unix epoch nanoseconds
    pub time_sent: Option<i64>,
    /// Boolean value
    pub is_from_me: i32,
    pub message_type: i32,
    pub service: Option<String>,
    pub source_guid: String,
    pub associated_guid: Option<String>,
    pub reply_to_guid: Option<String>,
}

#[derive(Debug, PartialEq, Clone, Selectable, Queryable, Insertable)]
#[diesel(table_name = schema::reaction)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawReaction {
    #[diesel(deserialize_as = i64)]
    pub id: Option<i64>,
    pub source_guid: String,
    pub original_message_guid: Option<String>,
    pub reaction_type: Option<i64>,
    pub sender_id: Option<i64>,
    pub time_sent: Option<i64>,
    pub chat_id: i64,
}

#[derive(Debug, PartialEq, Clone, Selectable, Queryable, Insertable)]
#[diesel(table_name = schema::attachment)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawAttachment {
    #[diesel(deserialize_as = i64)]
    pub id: Option<i64>,
    pub message_internal_id: i64,
    pub source_guid: String,
    pub created_at: Option<i64>,
    pub file_name: Option<String>,
    pub uti: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
    /// Boolean value
    pub is_sticker: i32,
}

#[derive(Debug, PartialEq, Clone, Selectable, Queryable, Insertable)]
#[diesel(table_name = schema::live_sync_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawWatermark {
    pub key: String,
    pub value: String,
}
