use rand::Rng;

/// Random lowercase hex string of `n` characters.
#[must_use]
pub fn hex(n: usize) -> String {
    const TABLE: &[u8; 16] = b"0123456789abcdef";

    let mut rng = rand::rng();
    (0..n).map(|_| TABLE[rng.random_range(0..16)] as char).collect()
}

/// FNV-1a 64 digest of the concatenated parts, hex encoded.
///
/// Deployment identifiers are `sum(&[uri, &hex(64)])`.
#[must_use]
pub fn sum(parts: &[&str]) -> String {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    if parts.is_empty() {
        return String::new();
    }

    let mut hash = OFFSET_BASIS;
    for part in parts {
        for b in part.as_bytes() {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(PRIME);
        }
    }

    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn hex_shape() {
        let id = hex(8);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[rstest]
    #[case(&[], "")]
    #[case(&[""], "cbf29ce484222325")]
    #[case(&["a"], "af63dc4c8601ec8c")]
    #[case(&["foobar"], "85944171f73967e8")]
    fn sum_vectors(#[case] parts: &[&str], #[case] should: &str) {
        assert_eq!(sum(parts), should);
    }

    #[test]
    fn sum_concatenates() {
        assert_eq!(sum(&["foo", "bar"]), sum(&["foobar"]));
    }
}
