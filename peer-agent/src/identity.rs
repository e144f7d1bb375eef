//! Run-scoped peer identifiers

use std::io;

use ring::rand::{SecureRandom, SystemRandom};

/// Longest base id kept before the port suffix
pub const MAX_BASE_ID_LEN: usize = 16;

/// `base` (truncated) plus `:port`, so several agents on one host stay distinct
pub fn derive_peer_id(base: &str, port: u16) -> String {
    let base: String = base.chars().take(MAX_BASE_ID_LEN).collect();
    format!("{}:{}", base, port)
}

/// Random hex base id from the system RNG
pub fn random_base_id() -> io::Result<String> {
    let mut bytes = [0u8; MAX_BASE_ID_LEN / 2];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "system RNG unavailable"))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_base_kept() {
        assert_eq!(derive_peer_id("p1", 40000), "p1:40000");
    }

    #[test]
    fn test_long_base_truncated() {
        let id = derive_peer_id("0123456789abcdef0123456789abcdef", 5);
        assert_eq!(id, "0123456789abcdef:5");
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let id = derive_peer_id(&"é".repeat(20), 1);
        assert_eq!(id, format!("{}:1", "é".repeat(16)));
    }

    #[test]
    fn test_random_base_id() {
        let a = random_base_id().unwrap();
        let b = random_base_id().unwrap();
        assert_eq!(a.len(), MAX_BASE_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
