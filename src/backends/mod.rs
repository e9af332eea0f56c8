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

pub mod docker;
pub mod nomad;
pub mod proxy;
pub mod serial;

use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;

use crate::config::{Route, User};
use crate::router::{Handler, HandlerError};

/// A backend: a factory from a route to a session handler. Each backend
/// closes over its route (settings and permissions) at registration time.
pub type Backend = fn(Arc<Route>) -> Handler;

/// Returns a backend given its identifier.
pub fn get(name: &str) -> Option<Backend> {
    match name {
        "proxy" => Some(proxy::backend),
        "docker" => Some(docker::backend),
        "nomad" => Some(nomad::backend),
        "serial" => Some(serial::backend),
        _ => None,
    }
}

/// Decodes a route's dynamically-typed settings object into a backend's
/// settings record. Unknown keys are ignored; a shape mismatch reports the
/// route by name.
pub(crate) fn decode_settings<T: DeserializeOwned>(route: &Route) -> Result<T, HandlerError> {
    hcl::from_value(route.settings.clone()).map_err(|error| HandlerError::InvalidSettings {
        route: route.name.clone(),
        error,
    })
}

/// Resolves the effective remote username: an explicit `user` setting
/// wins, then the authenticated user's entry in `user_map`, then the
/// authenticated user's own name.
pub(crate) fn resolve_remote_user(
    explicit: Option<&String>,
    user_map: Option<&IndexMap<String, String>>,
    user: &User,
) -> String {
    if let Some(explicit) = explicit {
        return explicit.clone();
    }
    if let Some(mapped) = user_map.and_then(|map| map.get(&user.name)) {
        return mapped.clone();
    }
    user.name.clone()
}

/// Picks the command to run: the client-supplied command wins, then the
/// route's configured command, then `/bin/sh`.
pub(crate) fn command_or_default(
    session_command: &[String],
    settings_command: Option<&Vec<String>>,
) -> Vec<String> {
    if !session_command.is_empty() {
        return session_command.to_vec();
    }
    if let Some(command) = settings_command {
        if !command.is_empty() {
            return command.clone();
        }
    }
    vec!["/bin/sh".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> User {
        User {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_registry() {
        assert!(get("proxy").is_some());
        assert!(get("docker").is_some());
        assert!(get("nomad").is_some());
        assert!(get("serial").is_some());
        assert!(get("kubernetes").is_none());
    }

    #[test]
    fn test_resolve_remote_user() {
        let mut map = IndexMap::new();
        map.insert("alice".to_string(), "root".to_string());

        let explicit = "admin".to_string();
        assert_eq!(
            resolve_remote_user(Some(&explicit), Some(&map), &user("alice")),
            "admin"
        );
        assert_eq!(
            resolve_remote_user(None, Some(&map), &user("alice")),
            "root"
        );
        assert_eq!(resolve_remote_user(None, Some(&map), &user("bob")), "bob");
        assert_eq!(resolve_remote_user(None, None, &user("carol")), "carol");
    }

    #[test]
    fn test_command_or_default() {
        let session = vec!["htop".to_string()];
        let settings = vec!["/bin/bash".to_string(), "-l".to_string()];

        assert_eq!(command_or_default(&session, Some(&settings)), session);
        assert_eq!(command_or_default(&[], Some(&settings)), settings);
        assert_eq!(command_or_default(&[], Some(&Vec::new())), ["/bin/sh"]);
        assert_eq!(command_or_default(&[], None), ["/bin/sh"]);
    }

    #[test]
    fn test_decode_settings_reports_route_name() {
        let route = Route {
            name: "broken".to_string(),
            backend: "docker".to_string(),
            match_pattern: ".*".to_string(),
            settings: hcl::Value::from("not an object"),
            permissions: None,
        };

        let result: Result<docker::DockerSettings, _> = decode_settings(&route);
        match result {
            Err(HandlerError::InvalidSettings { route, .. }) => assert_eq!(route, "broken"),
            other => panic!("expected InvalidSettings, got {other:?}"),
        }
    }
}
