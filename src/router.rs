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

use std::future::Future;
use std::num::ParseIntError;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use regex::Regex;

use crate::config::Route;
use crate::session::{Session, SessionClosed, SessionWriter};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// A backend session handler. Receives the accepted session and the clean
/// routing argument, and blocks until the backend side terminates.
pub type Handler = Arc<dyn Fn(Session, String) -> HandlerFuture + Send + Sync>;

/// Wraps a handler with additional behavior around its invocation.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Routes accepted sessions to backend handlers by matching the routing
/// argument against the registered patterns, in registration order.
#[derive(Default)]
pub struct Router {
    routes: Vec<CompiledRoute>,
    middlewares: Vec<Middleware>,
}

struct CompiledRoute {
    route: Arc<Route>,
    regex: Regex,
    has_arg_group: bool,
    handler: Handler,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware. The first-registered middleware executes
    /// outermost at dispatch time.
    pub fn use_middleware(&mut self, middleware: Middleware) {
        self.middlewares.push(middleware);
    }

    /// Registers a route. Fails if the route's match pattern does not
    /// compile, in which case the route is not stored.
    pub fn handle(&mut self, route: Arc<Route>, handler: Handler) -> Result<(), regex::Error> {
        let regex = Regex::new(&route.match_pattern)?;
        let has_arg_group = regex.capture_names().flatten().any(|name| name == "arg");
        self.routes.push(CompiledRoute {
            route,
            regex,
            has_arg_group,
            handler,
        });
        Ok(())
    }

    /// Handles an accepted session: matches the routing argument against
    /// the registered routes, runs the middleware chain and the matched
    /// backend handler, reports any error to the client, and closes the
    /// channel.
    pub async fn dispatch(&self, mut session: Session) {
        let arg = session.context.arg.clone();
        let writer = session.writer.clone();

        let Some((matched, clean_arg)) = self.select(&arg) else {
            write_error(&writer, &format!("no matching route found for {arg:?}")).await;
            writer.exit_status(1).await;
            writer.close().await;
            return;
        };

        session.context.route = Some(matched.route.clone());

        let mut handler = matched.handler.clone();
        for middleware in self.middlewares.iter().rev() {
            handler = middleware(handler);
        }

        match handler(session, clean_arg).await {
            Ok(()) => writer.exit_status(0).await,
            Err(error) => {
                write_error(&writer, &error.to_string()).await;
                writer.exit_status(1).await;
            }
        }
        writer.close().await;
    }

    /// Finds the first route whose pattern matches the argument and
    /// derives the clean argument for it: the capture group named `arg` if
    /// the pattern defines one, else capture group 1, else the whole
    /// matched string.
    fn select(&self, arg: &str) -> Option<(&CompiledRoute, String)> {
        for compiled in &self.routes {
            let Some(captures) = compiled.regex.captures(arg) else {
                continue;
            };

            let clean_arg = if compiled.has_arg_group {
                captures.name("arg").map_or("", |m| m.as_str())
            } else if captures.len() >= 2 {
                captures.get(1).map_or("", |m| m.as_str())
            } else {
                captures.get(0).map_or("", |m| m.as_str())
            };

            return Some((compiled, clean_arg.to_string()));
        }
        None
    }
}

/// Writes a formatted error message to the session's stderr stream.
async fn write_error(writer: &SessionWriter, message: &str) {
    let line = format!("\x1b[31;1m[ERROR]\x1b[0m {message}\r\n");
    writer.stderr(line.as_bytes()).await.ok();
}

/// Returns a middleware that logs incoming sessions and closed
/// connections, including any error that caused the close.
pub fn logging() -> Middleware {
    Arc::new(|next: Handler| -> Handler {
        Arc::new(move |session: Session, arg: String| -> HandlerFuture {
            let next = next.clone();
            Box::pin(async move {
                let user = session.context.user.name.clone();
                let route = session
                    .context
                    .route
                    .as_ref()
                    .map(|r| r.name.clone())
                    .unwrap_or_default();
                let addr = session.peer_addr.clone();

                tracing::info!(
                    user = %user,
                    route = %route,
                    arg = %arg,
                    addr = %addr,
                    "incoming user session"
                );

                let start = Instant::now();
                let result = next(session, arg).await;
                let duration = start.elapsed();

                match &result {
                    Err(error) => tracing::error!(
                        user = %user,
                        route = %route,
                        ?duration,
                        addr = %addr,
                        %error,
                        "connection closed"
                    ),
                    Ok(()) => tracing::info!(
                        user = %user,
                        route = %route,
                        ?duration,
                        "connection closed"
                    ),
                }

                result
            })
        })
    })
}

/// Errors surfaced to the client by backend handlers.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("you are not authorized to access this resource")]
    Unauthorized,
    #[error("this route only accepts pty sessions (try adding the -t flag)")]
    PtyRequired,
    #[error("invalid settings for route {route}: {error}")]
    InvalidSettings { route: String, error: hcl::Error },
    #[error("password entry canceled")]
    PasswordEntryCanceled,
    #[error(transparent)]
    SessionClosed(#[from] SessionClosed),

    // proxy backend
    #[error("no host configuration provided")]
    NoHostConfigured,
    #[error("provided argument doesn't match any host patterns in configuration")]
    NoMatchingHostPattern,
    #[error("invalid port {value:?}: {error}")]
    InvalidPort { value: String, error: ParseIntError },
    #[error("error loading private key at {path}: {error}")]
    LoadingPrivateKey {
        path: String,
        error: russh::keys::Error,
    },
    #[error("host key verification failed: {error}")]
    KnownHosts { error: russh::keys::Error },
    #[error("could not authenticate to {addr} as {user}, all authentication attempts failed")]
    UpstreamAuthFailed { user: String, addr: String },
    #[error("remote command exited with status {status}")]
    UpstreamExit { status: u32 },
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    // docker backend
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    // nomad backend
    #[error("job {job:?} has no allocations")]
    NoAllocations { job: String },
    #[error("task not found")]
    TaskNotFound,
    #[error("task group not found")]
    TaskGroupNotFound,
    #[error(transparent)]
    Nomad(#[from] crate::nomad::NomadError),

    // serial backend
    #[error("either directory or file must be set in the server config")]
    SerialEndpointMissing,
    #[error("no serial configuration provided")]
    SerialModeMissing,
    #[error("no baud rate provided")]
    BaudRateMissing,
    #[error("invalid baud rate {value:?}: {error}")]
    InvalidBaudRate { value: String, error: ParseIntError },
    #[error("invalid serial mode: {0:?}")]
    InvalidSerialMode(String),
    #[error("unknown parity mode: {0}")]
    UnknownParity(char),
    #[error("unsupported stop bit amount: {0:?}")]
    UnsupportedStopBits(String),
    #[error("{0} is not supported by the serial driver")]
    UnsupportedSerialOption(String),
    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Route;

    fn test_route(name: &str, pattern: &str) -> Arc<Route> {
        Arc::new(Route {
            name: name.to_string(),
            backend: "test".to_string(),
            match_pattern: pattern.to_string(),
            settings: hcl::Value::Null,
            permissions: None,
        })
    }

    fn noop_handler() -> Handler {
        Arc::new(|_session, _arg| -> HandlerFuture { Box::pin(async { Ok(()) }) })
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let mut router = Router::new();
        let result = router.handle(test_route("bad", "(unclosed"), noop_handler());
        assert!(result.is_err());
        assert!(router.routes.is_empty());
    }

    #[test]
    fn test_first_capture_group_is_the_argument() {
        let mut router = Router::new();
        router
            .handle(test_route("nomad", r"nomad\.(.+)"), noop_handler())
            .unwrap();

        let (matched, clean_arg) = router.select("nomad.web").unwrap();
        assert_eq!(matched.route.name, "nomad");
        assert_eq!(clean_arg, "web");
    }

    #[test]
    fn test_named_arg_group_overrides_group_one() {
        let mut router = Router::new();
        router
            .handle(
                test_route("named", r"(serial)\.(?P<arg>.+)"),
                noop_handler(),
            )
            .unwrap();

        let (_, clean_arg) = router.select("serial.ttyS0.9600").unwrap();
        assert_eq!(clean_arg, "ttyS0.9600");
    }

    #[test]
    fn test_no_groups_uses_the_whole_match() {
        let mut router = Router::new();
        router
            .handle(test_route("plain", r"docker-\w+"), noop_handler())
            .unwrap();

        let (_, clean_arg) = router.select("xx docker-web yy").unwrap();
        assert_eq!(clean_arg, "docker-web");
    }

    #[test]
    fn test_patterns_match_as_substring_search() {
        let mut router = Router::new();
        router
            .handle(test_route("sub", r"nomad\.(.+)"), noop_handler())
            .unwrap();
        router
            .handle(test_route("anchored", r"^serial\.(.+)$"), noop_handler())
            .unwrap();

        assert!(router.select("prefix-nomad.web").is_some());
        assert!(router.select("prefix-serial.tty").is_none());
        assert!(router.select("serial.tty").is_some());
    }

    #[test]
    fn test_dispatch_is_deterministic_in_registration_order() {
        let mut router = Router::new();
        router
            .handle(test_route("first", r".*\.(.+)"), noop_handler())
            .unwrap();
        router
            .handle(test_route("second", r"nomad\.(.+)"), noop_handler())
            .unwrap();

        for _ in 0..32 {
            let (matched, _) = router.select("nomad.web").unwrap();
            assert_eq!(matched.route.name, "first");
        }
    }

    #[test]
    fn test_no_match() {
        let mut router = Router::new();
        router
            .handle(test_route("nomad", r"nomad\.(.+)"), noop_handler())
            .unwrap();

        assert!(router.select("docker.web").is_none());
    }
}
