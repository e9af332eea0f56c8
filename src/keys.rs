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

use std::io::Write;
use std::path::Path;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKeyBase64};

/// Loads host keys from the ssh directory, generating and saving a new
/// ed25519 keypair if no valid key was found.
pub fn ensure_host_keys(ssh_dir: &Path) -> Result<Vec<PrivateKey>, KeyError> {
    let mut keys = load_host_keys(ssh_dir)?;
    if keys.is_empty() {
        tracing::warn!("no valid host keys found, generating new ed25519 keys");
        keys.push(generate_host_key(ssh_dir)?);
    }
    Ok(keys)
}

/// Recursively walks the ssh directory looking for private host keys:
/// files whose basename starts with `id_` and does not end in `.pub`.
/// Unparsable key files are warned about and skipped.
pub fn load_host_keys(ssh_dir: &Path) -> Result<Vec<PrivateKey>, KeyError> {
    std::fs::create_dir_all(ssh_dir).map_err(|error| KeyError::Io {
        what: "creating ssh directory",
        path: ssh_dir.to_string_lossy().to_string(),
        error,
    })?;

    let mut keys = Vec::new();
    walk_dir(ssh_dir, &mut keys)?;
    Ok(keys)
}

fn walk_dir(dir: &Path, keys: &mut Vec<PrivateKey>) -> Result<(), KeyError> {
    let entries = std::fs::read_dir(dir).map_err(|error| KeyError::Io {
        what: "reading ssh directory",
        path: dir.to_string_lossy().to_string(),
        error,
    })?;

    for entry in entries {
        let entry = entry.map_err(|error| KeyError::Io {
            what: "reading ssh directory entry",
            path: dir.to_string_lossy().to_string(),
            error,
        })?;
        let path = entry.path();

        if path.is_dir() {
            walk_dir(&path, keys)?;
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("id_") || name.ends_with(".pub") {
            continue;
        }

        match russh::keys::load_secret_key(&path, None) {
            Ok(key) => keys.push(key),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "invalid private key");
            }
        }
    }

    Ok(())
}

/// Generates a new ed25519 keypair and saves it in the ssh directory as
/// `id_ed25519` (0600) and `id_ed25519.pub` (0644), with the public line
/// carrying a `user@host` comment.
pub fn generate_host_key(ssh_dir: &Path) -> Result<PrivateKey, KeyError> {
    std::fs::create_dir_all(ssh_dir).map_err(|error| KeyError::Io {
        what: "creating ssh directory",
        path: ssh_dir.to_string_lossy().to_string(),
        error,
    })?;

    let generated = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|error| KeyError::Generating { error })?;
    let comment = key_comment();
    let key = PrivateKey::new(generated.key_data().clone(), comment.clone())
        .map_err(|error| KeyError::Generating { error })?;

    let private_path = ssh_dir.join("id_ed25519");
    let private_pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|error| KeyError::Encoding { error })?;
    write_private_key(&private_path, private_pem.as_bytes())?;

    let public_path = ssh_dir.join("id_ed25519.pub");
    let public_line = format!(
        "ssh-ed25519 {} {}\n",
        key.public_key().public_key_base64(),
        comment
    );
    std::fs::write(&public_path, public_line).map_err(|error| KeyError::Io {
        what: "writing public key",
        path: public_path.to_string_lossy().to_string(),
        error,
    })?;
    set_mode(&public_path, 0o644)?;

    Ok(key)
}

/// Writes the private key with owner-only permissions.
fn write_private_key(path: &Path, data: &[u8]) -> Result<(), KeyError> {
    let io_error = |error| KeyError::Io {
        what: "writing private key",
        path: path.to_string_lossy().to_string(),
        error,
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(io_error)?;
        file.write_all(data).map_err(io_error)?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, data).map_err(io_error)?;

    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|error| {
        KeyError::Io {
            what: "setting key permissions",
            path: path.to_string_lossy().to_string(),
            error,
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), KeyError> {
    Ok(())
}

fn key_comment() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "seashell".to_string());
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}")
}

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("error {what} at {path}: {error}")]
    Io {
        what: &'static str,
        path: String,
        error: std::io::Error,
    },
    #[error("error generating host key: {error}")]
    Generating {
        error: russh::keys::ssh_key::Error,
    },
    #[error("error encoding host key: {error}")]
    Encoding {
        error: russh::keys::ssh_key::Error,
    },
}
