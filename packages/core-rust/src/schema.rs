//! Schema summary fingerprints.
//!
//! A schema summary is a SHA-256 over every `(schema_id, contract)` pair in
//! id order. Two deployments with the same contracts produce the same
//! summary regardless of registration order; any contract edit changes it.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Computes the hex-encoded summary of a set of schema contracts.
#[must_use]
pub fn schemas_summary(schemas_by_id: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (id, contract) in schemas_by_id {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update(contract.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schemas(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn summary_is_order_independent() {
        let a = schemas(&[("a", "one"), ("b", "two")]);
        let b = schemas(&[("b", "two"), ("a", "one")]);
        assert_eq!(schemas_summary(&a), schemas_summary(&b));
    }

    #[test]
    fn summary_changes_with_contract() {
        let a = schemas(&[("a", "one")]);
        let b = schemas(&[("a", "one!")]);
        assert_ne!(schemas_summary(&a), schemas_summary(&b));
    }

    #[test]
    fn summary_separates_id_from_contract() {
        let a = schemas(&[("ab", "c")]);
        let b = schemas(&[("a", "bc")]);
        assert_ne!(schemas_summary(&a), schemas_summary(&b));
    }

    #[test]
    fn empty_summary_is_sha256_of_nothing() {
        assert_eq!(
            schemas_summary(&BTreeMap::new()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
