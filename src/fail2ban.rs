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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A fail2ban-like rate limiter tracking failed login attempts per source
/// IP. A background task empties the counter map every `limit`, so an
/// address that accumulated `attempts` failures is blocked until the next
/// reset.
///
/// Failed attempts are recorded per *connection*, not per auth callback: a
/// connection that eventually authenticates contributes nothing, no matter
/// how many attempts it burned first.
///
/// The limiter is advisory: a disabled instance (configuration omitted)
/// always allows logins and ignores recorded failures. The critical
/// sections only touch the map, so the mutex is a plain blocking one.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    max_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    /// Creates an enabled limiter and spawns its process-lifetime reset
    /// task. Must be called from within a tokio runtime.
    pub fn new(limit: Duration, max_attempts: u32) -> Self {
        let inner = Arc::new(Inner {
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        });

        let reset = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + limit;
            let mut interval = tokio::time::interval_at(start, limit);
            loop {
                interval.tick().await;
                let Some(inner) = reset.upgrade() else {
                    break;
                };
                inner
                    .attempts
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clear();
            }
        });

        Self { inner: Some(inner) }
    }

    /// A limiter that always allows logins and records nothing.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Records a failed login from the given address. Called once per
    /// connection that closed without ever authenticating.
    pub fn add_failed_login(&self, addr: &str) {
        let Some(inner) = &self.inner else { return };
        let mut attempts = inner
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *attempts.entry(addr_key(addr)).or_insert(0) += 1;
    }

    /// Reports whether a login from the given address is still allowed.
    pub fn login_allowed(&self, addr: &str) -> bool {
        let Some(inner) = &self.inner else { return true };
        let attempts = inner
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        attempts.get(&addr_key(addr)).copied().unwrap_or(0) < inner.max_attempts
    }
}

/// Extracts the counter key (the IP) from an address string. Socket
/// addresses use their IP field; anything else falls back to stripping the
/// last `:`-separated token, which mangles bracketed IPv6 forms that fail
/// to parse. That fallback matches the historical behavior and is kept.
fn addr_key(addr: &str) -> String {
    if let Ok(sockaddr) = addr.parse::<SocketAddr>() {
        return sockaddr.ip().to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, _port)) => host.to_string(),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_key() {
        assert_eq!(addr_key("1.2.3.4:5678"), "1.2.3.4");
        assert_eq!(addr_key("[::1]:2222"), "::1");
        assert_eq!(addr_key("somehost:22"), "somehost");
        assert_eq!(addr_key("noport"), "noport");
    }

    #[tokio::test]
    async fn test_threshold() {
        let limiter = RateLimiter::new(Duration::from_secs(300), 3);
        let addr = "1.2.3.4:40000";

        limiter.add_failed_login(addr);
        limiter.add_failed_login(addr);
        assert!(limiter.login_allowed(addr));

        limiter.add_failed_login(addr);
        assert!(!limiter.login_allowed(addr));
    }

    #[tokio::test]
    async fn test_counts_by_ip_not_port() {
        let limiter = RateLimiter::new(Duration::from_secs(300), 2);

        limiter.add_failed_login("1.2.3.4:1111");
        limiter.add_failed_login("1.2.3.4:2222");
        assert!(!limiter.login_allowed("1.2.3.4:3333"));
        assert!(limiter.login_allowed("5.6.7.8:1111"));
    }

    #[tokio::test]
    async fn test_reset_task_clears_counters() {
        let limiter = RateLimiter::new(Duration::from_millis(50), 1);
        let addr = "9.9.9.9:1234";

        limiter.add_failed_login(addr);
        assert!(!limiter.login_allowed(addr));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.login_allowed(addr));
    }

    #[test]
    fn test_disabled_limiter() {
        let limiter = RateLimiter::disabled();
        let addr = "1.2.3.4:5678";

        for _ in 0..100 {
            limiter.add_failed_login(addr);
        }
        assert!(limiter.login_allowed(addr));
    }
}
