//! Canonicalisation of phone numbers, emails, chat identifiers, GUIDs and text payloads.
//! Everything downstream keys on the outputs of these functions, so they must be stable.

use std::cell::RefCell;
use std::collections::HashMap;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref NON_DIGIT_REGEX: Regex = Regex::new(r"\D").unwrap();

    // \p{C} is any "other" character (controls, formatting, unassigned),
    // \p{Z} is any separator (including \u00A0 no-break space); space, newline
    // and tab survive. The object replacement character U+FFFC and U+FFFD are
    // symbols, so they are stripped explicitly, as is U+0001.
    static ref UNPRINTABLE_REGEX: Regex =
        Regex::new(r"[\u{FFFC}\u{0001}\u{FFFD}]|[[\p{C}\p{Z}]--[ \n\t]]").unwrap();
}

/// Strips all non-digit characters and the leading US country code.
/// Memoised, since the same handles come up over and over during a sync.
pub fn normalize_phone(phone: &str) -> String {
    thread_local! {
        static MEMO: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
    }
    MEMO.with(|memo| {
        if let Some(hit) = memo.borrow().get(phone) {
            return hit.clone();
        }
        let digits = NON_DIGIT_REGEX.replace_all(phone, "").into_owned();
        let normalized =
            if digits.len() == 11 && digits.starts_with('1') {
                digits[1..].to_owned()
            } else {
                digits
            };
        memo.borrow_mut().insert(phone.to_owned(), normalized.clone());
        normalized
    })
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn canonical_identifier(identifier: &str) -> String {
    if identifier.contains('@') {
        normalize_email(identifier)
    } else {
        normalize_phone(identifier)
    }
}

/// Derives the stable chat key: canonicalised participants, deduplicated,
/// sorted and comma-joined. Invariant under participant permutations.
pub fn chat_identifier<'a>(participants: impl IntoIterator<Item = &'a str>) -> String {
    participants.into_iter()
        .map(|p| canonical_identifier(p.trim()))
        .unique()
        .sorted()
        .join(",")
}

pub fn clean_text(content: &str) -> String {
    UNPRINTABLE_REGEX.replace_all(content, "").trim().to_owned()
}

/// Tapback references come prefixed (e.g. "p:0/ABCDEF"); the actual GUID
/// is whatever follows the last `/` or `:`.
pub fn clean_guid(guid: &str) -> &str {
    match guid.rfind(['/', ':']) {
        Some(idx) => &guid[idx + 1..],
        None => guid,
    }
}

/// Best-effort text recovery from an NSKeyedArchiver-serialized `attributedBody`
/// blob, for rows where `message.text` is null. The payload of interest sits
/// between the NSString and NSDictionary markers with a fixed framing; anything
/// that does not match that framing yields no text.
pub fn decode_attributed_body(raw: &[u8]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let decoded = String::from_utf8_lossy(raw);
    if let Some((before_number, _)) = decoded.split_once("NSNumber") {
        if let Some((_, after_string)) = before_number.split_once("NSString") {
            if let Some((payload, _)) = after_string.split_once("NSDictionary") {
                let chars = payload.chars().collect_vec();
                if chars.len() > 18 {
                    let inner: String = chars[6..chars.len() - 12].iter().collect();
                    return inner.trim().to_owned();
                }
            }
        }
    }
    String::new()
}
