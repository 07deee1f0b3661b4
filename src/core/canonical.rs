//! Statement normalization and content-derived identifiers.
//!
//! Canonical ids depend only on normalized statement text, so permuting the
//! order in which roots or children are supplied never changes an id.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-z0-9]+").unwrap_or_else(|_| unreachable!("static pattern compiles"))
});

/// Hex digits kept from the SHA-256 digest for canonical ids.
const CANONICAL_HEX_LEN: usize = 16;

/// Hex digits kept for decomposition child ids.
const CHILD_HEX_LEN: usize = 10;

/// Lowercase, replace every non-alphanumeric run with one space, trim.
#[must_use]
pub fn normalize_statement(text: &str) -> String {
    let lowered = text.to_lowercase();
    NON_ALNUM.replace_all(&lowered, " ").trim().to_string()
}

/// Collapse whitespace runs without touching case or punctuation.
///
/// Used for quote-fidelity checks where punctuation matters.
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for byte in bytes {
        if out.len() >= len {
            break;
        }
        let _ = write!(out, "{byte:02x}");
    }
    out.truncate(len);
    out
}

/// Canonical id of a root statement.
#[must_use]
pub fn canonical_id(statement: &str) -> String {
    let digest = Sha256::digest(normalize_statement(statement).as_bytes());
    format!("cid-{}", hex_prefix(&digest, CANONICAL_HEX_LEN))
}

/// Child id for a decomposition entry; identical statements merge.
#[must_use]
pub fn child_id(statement: &str) -> String {
    let digest = Sha256::digest(normalize_statement(statement).as_bytes());
    format!("c{}", hex_prefix(&digest, CHILD_HEX_LEN))
}

/// SHA-256 hex digest of arbitrary bytes (trace digests).
#[must_use]
pub fn digest_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_prefix(&digest, digest.len() * 2)
}

/// Unordered pair key `a|b` with members sorted ascending.
#[must_use]
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

/// Split a pair key into its two members.
#[must_use]
pub fn split_pair_key(key: &str) -> Option<(&str, &str)> {
    let (left, right) = key.split_once('|')?;
    let (left, right) = (left.trim(), right.trim());
    if left.is_empty() || right.is_empty() || right.contains('|') {
        return None;
    }
    Some((left, right))
}
