//! Content fingerprinting (spec §3: "Fingerprint = content hash over raw
//! text plus sorted config map"), mirroring the teacher's use of content
//! hashing (`blake3`/`md5`) for checksums in `dbt-schemas`/`dbt-common`.

use std::collections::BTreeMap;

/// Stable fingerprint over a model's raw source text and its sorted config
/// map. Sorting the map first makes the fingerprint independent of
/// insertion order, which is the only way two semantically-identical
/// configs can hash identically.
pub fn fingerprint(raw_text: &str, config: &BTreeMap<String, String>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(raw_text.as_bytes());
    for (key, value) in config {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

/// Fingerprint of an arbitrary byte string (used for SQL-fragment hashing in
/// logs/telemetry, matching the teacher's `code_hash` helper).
pub fn code_hash(bytes: &str) -> String {
    blake3::hash(bytes.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_regardless_of_map_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());

        assert_eq!(fingerprint("select 1", &a), fingerprint("select 1", &b));
    }

    #[test]
    fn fingerprint_changes_with_text() {
        let cfg = BTreeMap::new();
        assert_ne!(
            fingerprint("select 1", &cfg),
            fingerprint("select 2", &cfg)
        );
    }

    #[test]
    fn fingerprint_changes_with_config() {
        let mut cfg = BTreeMap::new();
        cfg.insert("materialized".to_string(), "view".to_string());
        let empty = BTreeMap::new();
        assert_ne!(fingerprint("select 1", &cfg), fingerprint("select 1", &empty));
    }
}
