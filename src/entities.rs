use derive_deref::Deref;
use num_traits::FromPrimitive;

#[derive(Deref, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContactId(pub i64);

#[derive(Deref, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub i64);

#[derive(Deref, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i64);

#[derive(Deref, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentifierKind {
    Phone,
    Email,
}

impl IdentifierKind {
    /// Addresses with an `@` are emails, everything else is treated as a phone number.
    pub fn infer(identifier: &str) -> Self {
        if identifier.contains('@') { IdentifierKind::Email } else { IdentifierKind::Phone }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Phone => "Phone",
            IdentifierKind::Email => "Email",
        }
    }
}

/// Known tapback codes carried in `associated_message_type`.
/// 2xxx places a tapback, 3xxx removes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(i64)]
pub enum TapbackType {
    Loved = 2000,
    Liked = 2001,
    Disliked = 2002,
    Laughed = 2003,
    Emphasized = 2004,
    Questioned = 2005,
    RemovedLoved = 3000,
    RemovedLiked = 3001,
    RemovedDisliked = 3002,
    RemovedLaughed = 3003,
    RemovedEmphasized = 3004,
    RemovedQuestioned = 3005,
}

impl TapbackType {
    pub fn name_of(code: i64) -> Option<&'static str> {
        TapbackType::from_i64(code).map(|tpe| match tpe {
            TapbackType::Loved => "loved",
            TapbackType::Liked => "liked",
            TapbackType::Disliked => "disliked",
            TapbackType::Laughed => "laughed",
            TapbackType::Emphasized => "emphasized",
            TapbackType::Questioned => "questioned",
            TapbackType::RemovedLoved => "removed loved",
            TapbackType::RemovedLiked => "removed liked",
            TapbackType::RemovedDisliked => "removed disliked",
            TapbackType::RemovedLaughed => "removed laughed",
            TapbackType::RemovedEmphasized => "removed emphasized",
            TapbackType::RemovedQuestioned => "removed questioned",
        })
    }
}
