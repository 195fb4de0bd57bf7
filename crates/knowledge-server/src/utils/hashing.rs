use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of arbitrary content. Used for body hashes,
/// embedding-cache keys and tenant path hashes.
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalise a repo-relative path to POSIX separators.
pub fn posix_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_stable_and_lowercase() {
        let h = sha256_hex("hello");
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(h, h.to_lowercase());
        assert_eq!(sha256_hex("hello"), sha256_hex("hello"));
        assert_ne!(sha256_hex("hello"), sha256_hex("hello "));
    }

    #[test]
    fn posix_path_normalises_backslashes() {
        assert_eq!(posix_path("docs\\guides\\a.md"), "docs/guides/a.md");
        assert_eq!(posix_path("docs/a.md"), "docs/a.md");
    }
}
