//! Domain-level building blocks shared by the gateway, orchestrator and
//! reconciler crates: the data model, storage contracts, configuration and
//! telemetry wiring.

pub mod config;
pub mod model;
pub mod services;
pub mod storage;

use hex::encode as hex_encode;
use sha3::{Digest, Sha3_256};

pub use config::*;
pub use model::*;
pub use services::*;
pub use storage::*;

/// Derives the idempotence key sent with a payment creation call. The nonce
/// makes separate top-ups of the same package distinct while a retried call
/// reuses the key it was given.
pub fn derive_idempotence_key(user: UserId, package: &PaymentPackage, nonce: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(user.get().to_be_bytes());
    hasher.update(package.amount_minor.to_be_bytes());
    hasher.update(package.credits.to_be_bytes());
    hasher.update(nonce.as_bytes());
    hex_encode(hasher.finalize())
}

/// Returns `bytes` random bytes from the OS RNG, hex encoded.
pub fn random_hex(bytes: usize) -> Result<String, getrandom::Error> {
    let mut buffer = vec![0u8; bytes];
    getrandom::fill(&mut buffer)?;
    Ok(hex_encode(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotence_key_is_deterministic_per_nonce() {
        let package = PaymentPackage::parse("299:30").unwrap();
        let user = UserId::new(7);
        let left = derive_idempotence_key(user, &package, "n1");
        let right = derive_idempotence_key(user, &package, "n1");
        assert_eq!(left, right);
        assert_eq!(left.len(), 64);
        assert_ne!(left, derive_idempotence_key(user, &package, "n2"));
        assert_ne!(left, derive_idempotence_key(UserId::new(8), &package, "n1"));
    }

    #[test]
    fn random_hex_has_requested_width() {
        let value = random_hex(16).unwrap();
        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(value, random_hex(16).unwrap());
    }
}
