use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let public_key: [u8; 32] = decode_fixed_hex(public_key_hex, "public key")?;
    let signature: [u8; 64] = decode_fixed_hex(signature_hex, "signature")?;

    let verifying_key =
        VerifyingKey::from_bytes(&public_key).context("invalid Ed25519 public key bytes")?;
    let signature = Signature::from_bytes(&signature);

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

/// Checks a detached signature file (hex text, surrounding whitespace
/// ignored) over the raw checksum manifest bytes.
pub fn verify_manifest_signature(
    manifest: &[u8],
    public_key_hex: &str,
    signature_file: &str,
) -> Result<bool> {
    let signature_hex = signature_file.trim();
    if signature_hex.is_empty() {
        return Err(anyhow!("signature file is empty"));
    }
    verify_ed25519_signature_hex(manifest, public_key_hex, signature_hex)
}

fn decode_fixed_hex<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    let bytes =
        hex::decode(value.trim()).with_context(|| format!("failed to decode Ed25519 {what} hex"))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 {what} length: expected {N} bytes, got {len}")
    })
}
