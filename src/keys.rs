//! SSH keypair generation (supplemented feature; grounded in the teacher's
//! `ssh/keys.rs`, carried forward unchanged in approach).

use crate::error::{EngineError, EngineResult};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

/// Returns `(private_key_openssh_pem, public_key_openssh_line)`.
pub fn generate_key_pair(algorithm: &str, passphrase: Option<&str>) -> EngineResult<(String, String)> {
    let mut rng = OsRng;

    let private_key = match algorithm {
        "ed25519" => PrivateKey::random(&mut rng, Algorithm::Ed25519)
            .map_err(|e| EngineError::Internal(format!("generate ed25519 key: {e}")))?,
        "rsa" => PrivateKey::random(&mut rng, Algorithm::Rsa { hash: None })
            .map_err(|e| EngineError::Internal(format!("generate rsa key: {e}")))?,
        other => return Err(EngineError::Conflict(format!("unsupported key algorithm: {other}"))),
    };

    let private_key = match passphrase {
        Some(pass) if !pass.is_empty() => private_key
            .encrypt(&mut rng, pass)
            .map_err(|e| EngineError::Internal(format!("encrypt key: {e}")))?,
        _ => private_key,
    };

    let public_key = private_key.public_key();

    let private_pem = private_key
        .to_openssh(LineEnding::LF)
        .map_err(|e| EngineError::Internal(format!("encode private key: {e}")))?
        .to_string();

    let public_openssh = public_key
        .to_openssh()
        .map_err(|e| EngineError::Internal(format!("encode public key: {e}")))?;

    Ok((private_pem, public_openssh))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_ed25519_keypair() {
        let (private, public) = generate_key_pair("ed25519", None).unwrap();
        assert!(private.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert!(public.starts_with("ssh-ed25519"));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(generate_key_pair("dsa", None).is_err());
    }
}
