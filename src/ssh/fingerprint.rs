//! Host key fingerprints and verification.
//!
//! An expected fingerprint selects its comparison format by string length:
//! MD5 colon-separated hex is 47 characters, SHA-1 colon-separated hex is
//! 59, base64 (raw, unpadded) SHA-256 is 43. Anything else is unsupported.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use md5::Md5;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const MD5_HEX_LEN: usize = 47;
const SHA1_HEX_LEN: usize = 59;
const SHA256_BASE64_LEN: usize = 43;

/// MD5 fingerprint of the key blob, `aa:bb:...` style.
pub fn md5_fingerprint(key: &PublicKey) -> String {
    hex_colon(&Md5::digest(key.public_key_bytes()))
}

/// SHA-1 fingerprint of the key blob, `aa:bb:...` style.
pub fn sha1_fingerprint(key: &PublicKey) -> String {
    hex_colon(&Sha1::digest(key.public_key_bytes()))
}

/// SHA-256 fingerprint of the key blob, raw base64 without padding.
pub fn sha256_fingerprint(key: &PublicKey) -> String {
    STANDARD_NO_PAD.encode(Sha256::digest(key.public_key_bytes()))
}

fn hex_colon(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Compares `key` against `expected`, choosing the digest by the expected
/// string's length.
///
/// With no expected fingerprint the key is only accepted when
/// `accept_unknown` was explicitly set; otherwise verification fails with
/// the server's MD5 fingerprint so the caller can pin it.
pub(crate) fn verify_host_key(
    expected: Option<&str>,
    accept_unknown: bool,
    key: &PublicKey,
) -> Result<()> {
    let expected = expected.unwrap_or("");
    let actual = match expected.len() {
        SHA256_BASE64_LEN => sha256_fingerprint(key),
        SHA1_HEX_LEN => sha1_fingerprint(key),
        MD5_HEX_LEN => md5_fingerprint(key),
        0 => {
            if accept_unknown {
                return Ok(());
            }
            return Err(Error::HostKey(format!(
                "unable to verify identity of host.\n\nThe fingerprint of the received key was {:?}.",
                md5_fingerprint(key)
            )));
        }
        _ => {
            return Err(Error::HostKey(
                "unsupported host key fingerprint format".into(),
            ))
        }
    };

    if actual != expected {
        return Err(Error::HostKey(format!(
            "host key verification failed.\n\nThe fingerprint of the received key was {actual:?}."
        )));
    }
    Ok(())
}
