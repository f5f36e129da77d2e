//! Order fingerprints and content hashes.
//!
//! A fingerprint identifies one logical order: the same author asking for
//! the same trip again (a repost, or an edit of the original) maps to the
//! same fingerprint, while wording changes alter only the content hash.

use std::collections::BTreeSet;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::pipeline::rules::{passenger_count, route_endpoints};
use crate::text::tokenize;

/// Tokens shorter than this carry too little signal for identity.
const MIN_PLACE_TOKEN_LEN: usize = 4;
/// Cap on the token set used when no route is found.
const MAX_PLACE_TOKENS: usize = 8;

/// Stable identifier of a logical order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderFingerprint(String);

impl OrderFingerprint {
    /// Compute the fingerprint for `canonical` text written by `author`.
    ///
    /// `author` is the sender id when the transport exposes one, otherwise
    /// the source chat id. Phone numbers and handles never contribute.
    pub fn compute(author: i64, canonical: &str) -> Self {
        let places = match route_endpoints(canonical) {
            Some((from, to)) => format!("route:{from}>{to}"),
            None => {
                let tokens: BTreeSet<&str> = tokenize(canonical)
                    .into_iter()
                    .filter(|t| t.len() >= MIN_PLACE_TOKEN_LEN)
                    .filter(|t| !t.bytes().any(|b| b.is_ascii_digit()))
                    .collect();
                let tokens: Vec<&str> = tokens.into_iter().take(MAX_PLACE_TOKENS).collect();
                format!("tokens:{}", tokens.join(","))
            }
        };
        let pax = passenger_count(canonical)
            .map(|n| n.to_string())
            .unwrap_or_default();

        Self(sha256_hex(&format!("{author}|{places}|{pax}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of the canonical text, used to tell a real edit from a resubmit.
pub fn content_hash(canonical: &str) -> String {
    sha256_hex(canonical)
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}
