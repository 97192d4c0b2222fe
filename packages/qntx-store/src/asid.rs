//! Attestation ID (ASID) generation.
//!
//! An ASID is a 32-character identifier laid out as
//! `PP R2 S5 R2 P7 R2 C5 R4 A3`: a two-character prefix, interleaved hex
//! digits drawn from a single UUIDv4, and "vanity" segments extracted from
//! the subject (5), predicate (7), context (5), and actor (3) inputs so the
//! id stays human-scannable.
//!
//! Vanity extraction uppercases the input and strips non-alphanumerics. When
//! the result is shorter than the segment, the remainder is padded
//! deterministically from the SHA-256 of the original input through an
//! alphabet that drops `I`, `O`, `0`, and `1` for legibility. The same input
//! always pads the same way, so two generations over the same tuple differ
//! only in their random hex segments.

use std::future::Future;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Padding alphabet. 32 characters; I, O, 0 and 1 are excluded.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Maximum candidates generated before giving up on uniqueness.
const MAX_COLLISION_RETRIES: usize = 10;

/// Two-character ASID prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    /// Attestations.
    Attestation,
    /// Queued jobs.
    Job,
    /// Job descriptions (schedules).
    JobDescription,
    /// Executions.
    Execution,
}

impl IdPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdPrefix::Attestation => "AS",
            IdPrefix::Job => "JB",
            IdPrefix::JobDescription => "JD",
            IdPrefix::Execution => "PX",
        }
    }
}

/// The four input strings an ASID is derived from.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsidInput<'a> {
    pub subject: &'a str,
    pub predicate: &'a str,
    pub context: &'a str,
    /// Empty actor marks a self-certifying id: by convention the actor is
    /// later set to the id itself.
    pub actor: &'a str,
}

/// Generate one ASID candidate.
pub fn generate(prefix: IdPrefix, input: &AsidInput<'_>) -> String {
    let hex = Uuid::new_v4().simple().to_string();

    let mut id = String::with_capacity(32);
    id.push_str(prefix.as_str());
    id.push_str(&hex[0..2]);
    id.push_str(&vanity(input.subject, 5));
    id.push_str(&hex[2..4]);
    id.push_str(&vanity(input.predicate, 7));
    id.push_str(&hex[4..6]);
    id.push_str(&vanity(input.context, 5));
    id.push_str(&hex[6..10]);
    id.push_str(&vanity(input.actor, 3));
    id
}

/// Generate an ASID, retrying while `exists` reports a collision.
///
/// After [`MAX_COLLISION_RETRIES`] candidates the last one is returned
/// regardless; the caller's unique constraint is the final arbiter.
pub fn generate_unique<F>(prefix: IdPrefix, input: &AsidInput<'_>, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    let mut candidate = generate(prefix, input);
    for _ in 1..MAX_COLLISION_RETRIES {
        if !exists(&candidate) {
            return candidate;
        }
        candidate = generate(prefix, input);
    }
    candidate
}

/// Async variant of [`generate_unique`] for collision checks that hit the
/// database.
pub async fn generate_unique_with<F, Fut, E>(
    prefix: IdPrefix,
    input: &AsidInput<'_>,
    mut exists: F,
) -> Result<String, E>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let mut candidate = generate(prefix, input);
    for _ in 1..MAX_COLLISION_RETRIES {
        if !exists(candidate.clone()).await? {
            return Ok(candidate);
        }
        candidate = generate(prefix, input);
    }
    Ok(candidate)
}

/// Extract a vanity segment of exactly `len` characters from `input`.
fn vanity(input: &str, len: usize) -> String {
    let cleaned: String = input
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(len)
        .collect();

    if cleaned.len() == len {
        return cleaned;
    }

    // Deterministic padding from the hash of the original (unstripped) input.
    let digest = Sha256::digest(input.as_bytes());
    let mut padded = cleaned;
    let mut i = 0;
    while padded.len() < len {
        let byte = digest[i % digest.len()];
        padded.push(ALPHABET[byte as usize % ALPHABET.len()] as char);
        i += 1;
    }
    padded
}

/// Whether `id` is a well-formed ASID.
///
/// Accepts both the structured layout and the legacy form where all 30
/// characters after the prefix are hex.
pub fn is_valid(id: &str) -> bool {
    if id.len() != 32 || !id.is_ascii() {
        return false;
    }
    let bytes = id.as_bytes();
    let prefix_ok = bytes[..2]
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
    if !prefix_ok {
        return false;
    }

    let rest = &id[2..];
    if rest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return true;
    }

    // Structured layout: hex at the random offsets, upper-alphanumeric in
    // the vanity segments.
    let hex_ranges = [(2usize, 4usize), (9, 11), (18, 20), (25, 29)];
    let vanity_ranges = [(4usize, 9usize), (11, 18), (20, 25), (29, 32)];

    hex_ranges
        .iter()
        .all(|&(a, b)| id[a..b].bytes().all(|c| c.is_ascii_hexdigit()))
        && vanity_ranges.iter().all(|&(a, b)| {
            id[a..b]
                .bytes()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        })
}
