/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use russh::keys::{PublicKey, PublicKeyBase64};

/// Generates an argon2id hash for the given password with the default
/// parameters, in PHC string format.
pub fn generate_hash(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|error| AuthError::Hashing { error })?;
    Ok(hash.to_string())
}

/// Verifies a password against a stored argon2id PHC hash string. The hash
/// parameters are taken from the hash string itself.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|error| AuthError::InvalidHash { error })?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(error) => Err(AuthError::Verification { error }),
    }
}

/// Checks an offered public key against a user's configured authorized-key
/// lines. Malformed entries are warned about once and skipped; they never
/// fail the login on their own.
pub fn key_matches(user: &str, pubkeys: &[String], offered: &PublicKey) -> bool {
    let offered = offered.public_key_base64();

    for (index, line) in pubkeys.iter().enumerate() {
        let key = match line.parse::<PublicKey>() {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(user, index, %error, "invalid pubkey");
                continue;
            }
        };

        if key.public_key_base64() == offered {
            return true;
        }
    }

    false
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("error calculating argon2id hash: {error}")]
    Hashing {
        error: argon2::password_hash::Error,
    },
    #[error("invalid argon2id hash: {error}")]
    InvalidHash {
        error: argon2::password_hash::Error,
    },
    #[error("error verifying password: {error}")]
    Verification {
        error: argon2::password_hash::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_LINE: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@host";

    #[test]
    fn test_hash_round_trip() {
        let hash = generate_hash("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter2x", &hash).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let first = generate_hash("same").unwrap();
        let second = generate_hash("same").unwrap();
        assert_ne!(first, second);
        assert!(verify_password("same", &first).unwrap());
        assert!(verify_password("same", &second).unwrap());
    }

    #[test]
    fn test_invalid_hash_is_an_error() {
        assert!(matches!(
            verify_password("pw", "not-a-phc-string"),
            Err(AuthError::InvalidHash { .. })
        ));
    }

    #[test]
    fn test_key_matches() {
        let offered: PublicKey = ED25519_LINE.parse().unwrap();
        assert!(key_matches(
            "test",
            &[ED25519_LINE.to_string()],
            &offered
        ));
    }

    #[test]
    fn test_malformed_keys_are_skipped() {
        let offered: PublicKey = ED25519_LINE.parse().unwrap();
        let keys = vec!["garbage".to_string(), ED25519_LINE.to_string()];
        assert!(key_matches("test", &keys, &offered));

        let only_garbage = vec!["garbage".to_string()];
        assert!(!key_matches("test", &only_garbage, &offered));
    }

    #[test]
    fn test_no_keys_never_matches() {
        let offered: PublicKey = ED25519_LINE.parse().unwrap();
        assert!(!key_matches("test", &[], &offered));
    }
}
