//! Collision-resistant content fingerprints for cache keys and bandit arms.
//!
//! A fingerprint is SHA-256 over a canonical serialization of the request:
//! task type, normalized query or message history, the constraints that
//! affect the answer, and the route class. The full 64-hex digest is the
//! cache key; shard and bucket selection read its top bits.
//!
//! Canonicalization trims whitespace, lowercases semantic fields (task type,
//! constraint keys, route class) but never user text, and emits constraint
//! keys in sorted order so key order in the wire request cannot split the
//! cache.

use sha2::{Digest, Sha256};

use crate::types::{ChatMessage, Request, RequestPayload};

/// A 64-hex-character content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The hex digest as a cache key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shard index derived from the top bits of the digest.
    ///
    /// `shard_count` must be a power of two no larger than 256.
    #[must_use]
    pub fn shard(&self, shard_count: usize) -> usize {
        debug_assert!(shard_count.is_power_of_two() && shard_count <= 256);
        // First hex byte pair = top 8 bits of the digest.
        let top = u8::from_str_radix(&self.0[..2], 16).unwrap_or(0);
        (top as usize) & (shard_count - 1)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of a request under a route class.
///
/// Identical canonicalized inputs always produce identical fingerprints;
/// distinct inputs differ except with negligible probability.
#[must_use]
pub fn fingerprint_request(request: &Request, route_class: &str) -> Fingerprint {
    let mut hasher = Sha256::new();

    hasher.update(request.task_type().as_str().as_bytes());
    hasher.update(b"\x1f");

    match &request.payload {
        RequestPayload::Chat { history, message } => {
            for turn in history {
                hash_message(&mut hasher, turn);
            }
            hasher.update(b"user\x1e");
            hasher.update(message.trim().as_bytes());
            hasher.update(b"\x1f");
        }
        RequestPayload::Search {
            query,
            filters,
            max_results,
        } => {
            hasher.update(query.trim().as_bytes());
            hasher.update(b"\x1f");
            // Filter keys in fixed (sorted) order.
            if !filters.allowed_sources.is_empty() {
                let mut sources = filters.allowed_sources.clone();
                sources.sort();
                hasher.update(b"allowed_sources=");
                hasher.update(sources.join(",").to_lowercase().as_bytes());
                hasher.update(b"\x1f");
            }
            if let Some(days) = filters.recency_days {
                hasher.update(b"recency_days=");
                hasher.update(days.to_string().as_bytes());
                hasher.update(b"\x1f");
            }
            hasher.update(b"max_results=");
            hasher.update(max_results.to_string().as_bytes());
            hasher.update(b"\x1f");
        }
        RequestPayload::Research { question, depth } => {
            hasher.update(question.trim().as_bytes());
            hasher.update(b"\x1f");
            hasher.update(b"depth=");
            hasher.update(format!("{depth:?}").to_lowercase().as_bytes());
            hasher.update(b"\x1f");
        }
    }

    // Answer-affecting constraints, keys sorted.
    if let Some(max_cost) = request.constraints.max_cost {
        hasher.update(b"max_cost=");
        hasher.update(format!("{max_cost:.6}").as_bytes());
        hasher.update(b"\x1f");
    }
    if let Some(max_latency) = request.constraints.max_latency_ms {
        hasher.update(b"max_latency_ms=");
        hasher.update(max_latency.to_string().as_bytes());
        hasher.update(b"\x1f");
    }
    if let Some(quality) = request.constraints.quality {
        hasher.update(b"quality=");
        hasher.update(format!("{quality:?}").to_lowercase().as_bytes());
        hasher.update(b"\x1f");
    }

    hasher.update(route_class.trim().to_lowercase().as_bytes());

    Fingerprint(hex::encode(hasher.finalize()))
}

fn hash_message(hasher: &mut Sha256, turn: &ChatMessage) {
    hasher.update(format!("{:?}", turn.role).to_lowercase().as_bytes());
    hasher.update(b"\x1e");
    hasher.update(turn.content.trim().as_bytes());
    hasher.update(b"\x1f");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Constraints, QualityLevel, RequestPayload, UserTier};
    use proptest::prelude::*;

    fn chat_request(message: &str) -> Request {
        Request::new(
            "u1",
            UserTier::Free,
            RequestPayload::Chat {
                history: vec![],
                message: message.to_string(),
            },
        )
    }

    #[test]
    fn test_identical_inputs_identical_fingerprints() {
        let a = fingerprint_request(&chat_request("hello"), "chat");
        let b = fingerprint_request(&chat_request("hello"), "chat");
        assert_eq!(a, b);
    }

    #[test]
    fn test_whitespace_is_canonicalized() {
        let a = fingerprint_request(&chat_request("  hello  "), "chat");
        let b = fingerprint_request(&chat_request("hello"), "chat");
        assert_eq!(a, b);
    }

    #[test]
    fn test_user_text_case_is_preserved() {
        let a = fingerprint_request(&chat_request("Hello"), "chat");
        let b = fingerprint_request(&chat_request("hello"), "chat");
        assert_ne!(a, b);
    }

    #[test]
    fn test_route_class_case_is_not_significant() {
        let a = fingerprint_request(&chat_request("hello"), "Chat");
        let b = fingerprint_request(&chat_request("hello"), "chat");
        assert_eq!(a, b);
    }

    #[test]
    fn test_constraints_affect_fingerprint() {
        let mut constrained = chat_request("hello");
        constrained.constraints = Constraints {
            max_cost: Some(0.5),
            quality: Some(QualityLevel::High),
            max_latency_ms: None,
        };
        let a = fingerprint_request(&constrained, "chat");
        let b = fingerprint_request(&chat_request("hello"), "chat");
        assert_ne!(a, b);
    }

    #[test]
    fn test_history_and_message_do_not_collide() {
        // "a" as history + "b" as message must differ from "ab" as message.
        let mut with_history = chat_request("b");
        if let RequestPayload::Chat { history, .. } = &mut with_history.payload {
            history.push(ChatMessage::user("a"));
        }
        let a = fingerprint_request(&with_history, "chat");
        let b = fingerprint_request(&chat_request("ab"), "chat");
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_is_64_hex() {
        let fp = fingerprint_request(&chat_request("hello"), "chat");
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_shard_is_stable_and_bounded() {
        let fp = fingerprint_request(&chat_request("hello"), "chat");
        let shard = fp.shard(16);
        assert!(shard < 16);
        assert_eq!(shard, fp.shard(16));
    }

    proptest! {
        #[test]
        fn prop_distinct_messages_distinct_fingerprints(
            a in "[a-zA-Z0-9 ]{1,64}",
            b in "[a-zA-Z0-9 ]{1,64}",
        ) {
            prop_assume!(a.trim() != b.trim());
            let fa = fingerprint_request(&chat_request(&a), "chat");
            let fb = fingerprint_request(&chat_request(&b), "chat");
            prop_assert_ne!(fa, fb);
        }

        #[test]
        fn prop_shards_in_range(message in "[a-z]{1,32}", shards in prop::sample::select(vec![8usize, 16])) {
            let fp = fingerprint_request(&chat_request(&message), "chat");
            prop_assert!(fp.shard(shards) < shards);
        }
    }
}
