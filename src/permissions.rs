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

use indexmap::IndexMap;
use serde::Deserialize;

use crate::config::User;

/// Per-group allow/deny pattern lists for a route.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GroupRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Group-keyed access rules attached to a route. An absent map on a route
/// means allow-all; a present map denies by default and requires a matching
/// `allow` pattern on one of the user's effective groups.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct PermissionsMap(pub IndexMap<String, GroupRules>);

impl PermissionsMap {
    /// Checks whether the user has permission for all of the given items.
    ///
    /// Denials take priority over allows: a single `deny` pattern matching
    /// any item on any of the user's groups fails the whole check, even if
    /// another group explicitly allows it. Every user implicitly carries
    /// the `all` pseudo-group.
    pub fn is_allowed(&self, user: &User, items: &[&str]) -> bool {
        for item in items {
            let mut allowed = false;
            let mut denied = false;

            let groups = user.groups.iter().map(String::as_str).chain(["all"]);
            for group in groups {
                let Some(rules) = self.0.get(group) else {
                    continue;
                };

                if rules.deny.iter().any(|p| match_pattern(p, item)) {
                    denied = true;
                    break;
                }

                if rules.allow.iter().any(|p| match_pattern(p, item)) {
                    allowed = true;
                }
            }

            if denied || !allowed {
                return false;
            }
        }
        true
    }
}

/// Checks if an item matches a pattern. `*` alone matches everything, a
/// pattern with an embedded `*` matches by prefix and suffix, anything else
/// compares for equality.
fn match_pattern(pattern: &str, item: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        return item.starts_with(prefix) && item.ends_with(suffix);
    }
    pattern == item
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(groups: &[&str]) -> User {
        User {
            name: "test".to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    fn rules(allow: &[&str], deny: &[&str]) -> GroupRules {
        GroupRules {
            allow: allow.iter().map(|p| p.to_string()).collect(),
            deny: deny.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_match_pattern() {
        assert!(match_pattern("*", "anything"));
        assert!(match_pattern("job:*", "job:web"));
        assert!(match_pattern("*.log", "access.log"));
        assert!(match_pattern("a*c", "abc"));
        assert!(!match_pattern("a*c", "abd"));
        assert!(match_pattern("exact", "exact"));
        assert!(!match_pattern("exact", "exactly"));
    }

    #[test]
    fn test_literal_pattern_is_equality() {
        // A pattern without `*` behaves exactly like string equality.
        for (pattern, item) in [("ttyS0", "ttyS0"), ("ttyS0", "ttyS1"), ("a", "")] {
            assert_eq!(match_pattern(pattern, item), pattern == item);
        }
    }

    #[test]
    fn test_allow_on_user_group() {
        let mut pm = PermissionsMap::default();
        pm.0.insert("admins".to_string(), rules(&["*"], &[]));

        assert!(pm.is_allowed(&user(&["admins"]), &["job:web"]));
        assert!(!pm.is_allowed(&user(&["users"]), &["job:web"]));
        assert!(!pm.is_allowed(&user(&[]), &["job:web"]));
    }

    #[test]
    fn test_deny_beats_allow_across_groups() {
        let mut pm = PermissionsMap::default();
        pm.0.insert("admins".to_string(), rules(&["*"], &[]));
        pm.0.insert("interns".to_string(), rules(&[], &["job:prod*"]));

        let u = user(&["admins", "interns"]);
        assert!(pm.is_allowed(&u, &["job:staging"]));
        assert!(!pm.is_allowed(&u, &["job:prod-web"]));
    }

    #[test]
    fn test_all_pseudo_group() {
        let mut pm = PermissionsMap::default();
        pm.0.insert("all".to_string(), rules(&["shared-*"], &["secret"]));

        let u = user(&[]);
        assert!(pm.is_allowed(&u, &["shared-tty"]));
        assert!(!pm.is_allowed(&u, &["secret"]));
        assert!(!pm.is_allowed(&u, &["other"]));
    }

    #[test]
    fn test_all_items_must_pass() {
        let mut pm = PermissionsMap::default();
        pm.0.insert("ops".to_string(), rules(&["job:web", "task:*"], &[]));

        let u = user(&["ops"]);
        assert!(pm.is_allowed(&u, &["job:web", "task:nginx"]));
        assert!(!pm.is_allowed(&u, &["job:web", "group:default"]));
    }

    #[test]
    fn test_empty_map_denies_everything() {
        // A present-but-empty map has no allow pattern that could match.
        let pm = PermissionsMap::default();
        assert!(!pm.is_allowed(&user(&["admins"]), &["anything"]));
    }

    #[test]
    fn test_deny_in_one_group_stops_group_iteration() {
        let mut pm = PermissionsMap::default();
        pm.0.insert("first".to_string(), rules(&[], &["res"]));
        pm.0.insert("second".to_string(), rules(&["res"], &[]));

        // The later allow never rescues the earlier deny.
        assert!(!pm.is_allowed(&user(&["first", "second"]), &["res"]));
    }
}
