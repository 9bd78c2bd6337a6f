//! External message identifiers of the form `<{uid}@{tag}>`.

use std::sync::OnceLock;

use itertools::Itertools;
use log::debug;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a message uid: {0:?}")]
pub struct IdentifierFormatError(pub String);

fn message_uid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^<(\d+)@[^<>@\s]+>$").expect("message uid pattern is valid"))
}

pub fn encode_message_uid(uid: u32, tag: &str) -> String {
    format!("<{}@{}>", uid, tag)
}

pub fn decode_message_uid(value: &str) -> Result<u32, IdentifierFormatError> {
    message_uid_pattern()
        .captures(value)
        .and_then(|captures| captures.get(1))
        .and_then(|digits| digits.as_str().parse::<u32>().ok())
        .ok_or_else(|| IdentifierFormatError(value.to_string()))
}

/// Decodes a batch of external identifiers, dropping malformed entries and
/// duplicates while keeping the caller's order.
pub fn decode_message_uids<S: AsRef<str>>(values: &[S]) -> Vec<u32> {
    values
        .iter()
        .filter_map(|value| match decode_message_uid(value.as_ref()) {
            Ok(uid) => Some(uid),
            Err(e) => {
                debug!("Dropping {}", e);
                None
            }
        })
        .unique()
        .collect()
}
