mod digest;
mod ed25519;
mod verifier;

pub use digest::{sha256_hex, sha256_reader_hex, HashAlgorithm, Sha256};
pub use ed25519::{verify_ed25519_signature_hex, verify_manifest_signature};
pub use verifier::{ChecksumVerifier, VerificationResult, VerifiedAsset};
