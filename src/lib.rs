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

pub mod auth;
pub mod backends;
pub mod config;
pub mod fail2ban;
pub mod keys;
pub mod nomad;
pub mod permissions;
pub mod router;
pub mod server;
pub mod session;

use std::sync::Arc;

use crate::config::{Config, ConfigError};
use crate::fail2ban::RateLimiter;
use crate::router::Router;

/// Builds the router and rate limiter from the configuration, loads (or
/// generates) the host keys, and runs the SSH server in the background.
/// The returned handle shuts the server down when consumed.
pub async fn spawn(config: Config) -> Result<server::Handle, SpawnError> {
    let config = Arc::new(config);

    let mut router = Router::new();
    router.use_middleware(router::logging());

    for route in config.routes.values() {
        let route = Arc::new(route.clone());

        let Some(backend) = backends::get(&route.backend) else {
            tracing::warn!(id = %route.backend, route = %route.name, "invalid backend");
            continue;
        };

        if let Err(error) = router.handle(route.clone(), backend(route.clone())) {
            tracing::warn!(route = %route.name, %error, "invalid route pattern, skipping");
        }
    }

    let limiter = match &config.auth.fail2ban {
        Some(fail2ban) => RateLimiter::new(fail2ban.limit, fail2ban.attempts),
        None => RateLimiter::disabled(),
    };

    let host_keys = keys::ensure_host_keys(&config.ssh_dir()?)?;

    let handle = server::spawn(config, Arc::new(router), limiter, host_keys).await?;
    Ok(handle)
}

#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("error adding host keys: {0}")]
    Keys(#[from] keys::KeyError),
    #[error(transparent)]
    Server(#[from] server::SpawnError),
}
