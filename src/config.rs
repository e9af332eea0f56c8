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

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use duration_str::deserialize_duration;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::permissions::PermissionsMap;

/// Top-level configuration, loaded from `seashell.hcl`.
///
/// Labeled blocks (`route "name" { … }`, `user "name" { … }`) decode into
/// insertion-ordered maps so that route dispatch stays deterministic when
/// patterns overlap.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "route")]
    pub routes: IndexMap<String, Route>,
    #[serde(default)]
    pub auth: Auth,
}

/// Server-wide settings.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ssh_dir: Option<PathBuf>,
    pub listen_addr: String,
    pub debug: bool,
}

/// A virtual host: a regex over the routing argument bound to a backend
/// instance with its settings and permissions.
#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    #[serde(skip)]
    pub name: String,
    pub backend: String,
    #[serde(rename = "match")]
    pub match_pattern: String,
    #[serde(default = "null_value")]
    pub settings: hcl::Value,
    #[serde(default)]
    pub permissions: Option<PermissionsMap>,
}

impl Route {
    /// Evaluates the route's permission map for the given items. A route
    /// without a permission map allows everything.
    pub fn is_allowed(&self, user: &User, items: &[&str]) -> bool {
        match &self.permissions {
            Some(permissions) => permissions.is_allowed(user, items),
            None => true,
        }
    }
}

/// Authentication settings: the optional rate limiter and the user
/// directory.
#[derive(Debug, Default, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub fail2ban: Option<Fail2Ban>,
    #[serde(default, rename = "user")]
    pub users: IndexMap<String, User>,
}

/// Settings for the failed-login rate limiter.
#[derive(Debug, Deserialize)]
pub struct Fail2Ban {
    #[serde(deserialize_with = "deserialize_duration")]
    pub limit: Duration,
    pub attempts: u32,
}

/// A virtual user. Loaded once at startup and immutable for the process
/// lifetime.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub pubkeys: Vec<String>,
}

impl Config {
    /// Loads the configuration from the given path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|error| ConfigError::CouldNotRead {
            path: path.to_string_lossy().to_string(),
            error,
        })?;
        let mut config: Config = hcl::from_str(&text).map_err(|error| ConfigError::InvalidHcl {
            path: path.to_string_lossy().to_string(),
            error,
        })?;

        // Block labels are the map keys; copy them into the bodies so the
        // rest of the code can pass routes and users around by value.
        for (name, route) in config.routes.iter_mut() {
            route.name = name.clone();
        }
        for (name, user) in config.auth.users.iter_mut() {
            user.name = name.clone();
        }

        Ok(config)
    }

    /// The address to bind the SSH listener to. Host-less forms like
    /// `":2222"` are accepted and bind on all interfaces.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = &self.settings.listen_addr;
        let full = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.clone()
        };
        full.parse().map_err(|error| ConfigError::InvalidListenAddr {
            addr: addr.clone(),
            error,
        })
    }

    /// The directory searched for host keys, defaulting to `$HOME/.ssh`.
    pub fn ssh_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.settings.ssh_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".ssh"))
                .ok_or(ConfigError::NoHomeDirectory),
        }
    }

    /// Looks up a user in the directory by name.
    pub fn find_user(&self, name: &str) -> Option<&User> {
        self.auth.users.get(name)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_dir: None,
            listen_addr: Defaults::listen_addr(),
            debug: false,
        }
    }
}

pub struct Defaults;

impl Defaults {
    pub fn listen_addr() -> String {
        ":2222".to_string()
    }
}

fn null_value() -> hcl::Value {
    hcl::Value::Null
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file at {path}: {error}")]
    CouldNotRead { path: String, error: std::io::Error },
    #[error("HCL error in config file at {path}: {error}")]
    InvalidHcl { path: String, error: hcl::Error },
    #[error("invalid listen_addr {addr:?}: {error}")]
    InvalidListenAddr {
        addr: String,
        error: std::net::AddrParseError,
    },
    #[error("could not determine the home directory for the default ssh_dir")]
    NoHomeDirectory,
}
