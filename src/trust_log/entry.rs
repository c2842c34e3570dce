use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash that precedes step 1 in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One link of a hash-chained log.
///
/// `content` is the serialized record exactly as it was hashed; verification
/// works on these bytes and never re-serializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustLogEntry {
    pub step: u64,
    pub content: String,
    pub content_hash: String,
    pub prev_hash: String,
    pub hash: String,
}

impl TrustLogEntry {
    /// Build the entry that follows `prev_hash`.
    pub fn seal(step: u64, content: String, prev_hash: &str) -> Self {
        let content_hash = content_digest(&content);
        let hash = chain_digest(prev_hash, &content);
        Self {
            step,
            content,
            content_hash,
            prev_hash: prev_hash.to_string(),
            hash,
        }
    }
}

pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// `H(prev_hash ‖ content)`.
pub fn chain_digest(prev_hash: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of recomputing a chain forward from genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub total: usize,
    pub valid: bool,
    pub first_invalid_step: Option<u64>,
    /// Every step whose stored hashes disagree with the recomputed chain.
    pub invalid_steps: Vec<u64>,
    pub message: String,
}

/// Verify entries in step order.
///
/// The running hash is the recomputed one, never the stored one, so once an
/// entry is altered every later entry fails too.
pub fn verify_chain(entries: &[TrustLogEntry]) -> ChainReport {
    let mut running = GENESIS_HASH.to_string();
    let mut invalid_steps = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let expected_step = index as u64 + 1;
        let expected_hash = chain_digest(&running, &entry.content);
        let ok = entry.step == expected_step
            && entry.prev_hash == running
            && entry.content_hash == content_digest(&entry.content)
            && entry.hash == expected_hash;
        if !ok {
            invalid_steps.push(entry.step);
        }
        running = expected_hash;
    }

    let first_invalid_step = invalid_steps.first().copied();
    let message = match first_invalid_step {
        None => format!("chain valid: {} entries verified", entries.len()),
        Some(step) => format!(
            "chain broken at step {step}: {} of {} entries fail verification",
            invalid_steps.len(),
            entries.len()
        ),
    };

    ChainReport {
        total: entries.len(),
        valid: invalid_steps.is_empty(),
        first_invalid_step,
        invalid_steps,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn build(contents: &[&str]) -> Vec<TrustLogEntry> {
        let mut prev = GENESIS_HASH.to_string();
        let mut out = Vec::new();
        for (i, content) in contents.iter().enumerate() {
            let entry = TrustLogEntry::seal(i as u64 + 1, (*content).to_string(), &prev);
            prev = entry.hash.clone();
            out.push(entry);
        }
        out
    }

    #[test]
    fn empty_chain_is_valid() {
        let report = verify_chain(&[]);
        assert!(report.valid);
        assert_eq!(report.total, 0);
    }

    #[test]
    fn sealed_chain_verifies() {
        let entries = build(&["a", "b", "c"]);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        let report = verify_chain(&entries);
        assert!(report.valid, "{}", report.message);
    }

    #[test]
    fn tampered_content_breaks_that_step_and_all_later() {
        let mut entries = build(&["a", "b", "c", "d"]);
        entries[1].content = "B".into();
        let report = verify_chain(&entries);
        assert!(!report.valid);
        assert_eq!(report.first_invalid_step, Some(2));
        assert_eq!(report.invalid_steps, vec![2, 3, 4]);
    }

    #[test]
    fn deleted_entry_is_detected() {
        let mut entries = build(&["a", "b", "c"]);
        entries.remove(1);
        let report = verify_chain(&entries);
        assert_eq!(report.first_invalid_step, Some(3));
    }

    proptest! {
        #[test]
        fn any_single_mutation_fails_from_that_step_on(
            contents in prop::collection::vec("[a-z]{1,12}", 1..20),
            pick in any::<prop::sample::Index>(),
            suffix in "[A-Z]{1,4}",
        ) {
            let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
            let mut entries = build(&refs);
            let idx = pick.index(entries.len());
            entries[idx].content.push_str(&suffix);

            let report = verify_chain(&entries);
            let step = idx as u64 + 1;
            prop_assert_eq!(report.first_invalid_step, Some(step));
            let expected: Vec<u64> = (step..=entries.len() as u64).collect();
            prop_assert_eq!(report.invalid_steps, expected);
        }
    }
}
