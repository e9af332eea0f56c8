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
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey};
use russh::server::{run_stream, Auth, Msg, Server as RusshServer, Session as ServerSession};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigError, User};
use crate::fail2ban::RateLimiter;
use crate::router::Router;
use crate::session::{PtyRequest, Session, SessionContext, SessionWriter, WindowSize};

/// Binds the SSH listener and runs the server in the background until the
/// returned handle is shut down.
pub async fn spawn(
    config: Arc<Config>,
    router: Arc<Router>,
    limiter: RateLimiter,
    host_keys: Vec<PrivateKey>,
) -> Result<Handle, SpawnError> {
    let listen_address = config.listen_socket_addr()?;

    let russh_config = Arc::new(russh::server::Config {
        keys: host_keys,
        methods: MethodSet::from([MethodKind::PublicKey, MethodKind::Password].as_slice()),
        nodelay: true,
        auth_rejection_time: Duration::from_millis(30),
        ..Default::default()
    });

    let server = SshServer {
        config,
        router,
        limiter,
        russh_config,
    };

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|error| SpawnError::Listening {
            addr: listen_address,
            error,
        })?;
    tracing::info!("listening on {}", listen_address);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join_handle = tokio::spawn(server.run(listener, shutdown_rx));

    Ok(Handle {
        shutdown_tx,
        join_handle,
    })
}

pub struct Handle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl Handle {
    pub fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }

    pub async fn shutdown_and_wait(self) {
        let (shutdown_tx, join_handle) = self.into_parts();
        shutdown_tx.send(()).ok();
        join_handle.await.ok();
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("error listening on {addr}: {error}")]
    Listening {
        addr: SocketAddr,
        error: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct SshServer {
    config: Arc<Config>,
    router: Arc<Router>,
    limiter: RateLimiter,
    russh_config: Arc<russh::server::Config>,
}

impl SshServer {
    /// Accepts connections forever until `shutdown` fires (or its sending
    /// end is dropped).
    async fn run(mut self, socket: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                accept_result = socket.accept() => {
                    match accept_result {
                        Ok((socket, _)) => {
                            let russh_config = self.russh_config.clone();
                            let handler = self.new_client(socket.peer_addr().ok());

                            tokio::spawn(async move {
                                if russh_config.nodelay {
                                    if let Err(error) = socket.set_nodelay(true) {
                                        tracing::warn!(%error, "set_nodelay() failed");
                                    }
                                }

                                let session = match run_stream(russh_config, socket, handler).await {
                                    Ok(session) => session,
                                    Err(ServerError::Russh(russh::Error::Disconnect)) => {
                                        tracing::debug!("client disconnected");
                                        return;
                                    }
                                    Err(ServerError::Russh(russh::Error::ConnectionTimeout)) => {
                                        tracing::debug!("client connection timeout");
                                        return;
                                    }
                                    Err(error) => {
                                        tracing::warn!(%error, "connection setup failed");
                                        return;
                                    }
                                };

                                match session.await {
                                    Ok(_) => tracing::debug!("connection closed"),
                                    Err(ServerError::Russh(russh::Error::IO(io_error)))
                                        if io_error.kind() == io::ErrorKind::UnexpectedEof =>
                                    {
                                        tracing::debug!("eof from client");
                                    }
                                    Err(error) => {
                                        tracing::warn!(%error, "connection closed with error");
                                    }
                                }
                            });
                        }

                        Err(error) => {
                            tracing::error!(%error, "error accepting SSH connection from socket");
                            break;
                        }
                    }
                },

                _ = &mut shutdown => break,
            }
        }
    }
}

impl RusshServer for SshServer {
    type Handler = ClientHandler;

    fn new_client(&mut self, addr: Option<SocketAddr>) -> Self::Handler {
        ClientHandler {
            config: self.config.clone(),
            router: self.router.clone(),
            limiter: self.limiter.clone(),
            peer_addr: addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            user: None,
            arg: None,
            authenticated: false,
            auth_failed: false,
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        tracing::error!("session error: {error:?}");
    }
}

/// Per-connection handler: runs the authentication pipeline and turns
/// shell/exec requests into routed sessions.
pub struct ClientHandler {
    config: Arc<Config>,
    router: Arc<Router>,
    limiter: RateLimiter,
    peer_addr: String,
    /// The authenticated directory user, once resolved.
    user: Option<Arc<User>>,
    /// The routing argument from the virtual-host label.
    arg: Option<String>,
    /// Whether any auth callback returned `Auth::Accept`.
    authenticated: bool,
    /// Whether any auth attempt was rejected. Only committed to the rate
    /// limiter when the connection ends without authenticating.
    auth_failed: bool,
    channels: HashMap<ChannelId, ChannelState>,
}

struct ChannelState {
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    stdin_rx: Option<mpsc::Receiver<Vec<u8>>>,
    resize_tx: mpsc::UnboundedSender<WindowSize>,
    resize_rx: Option<mpsc::UnboundedReceiver<WindowSize>>,
    pty: Option<PtyRequest>,
    env: Vec<(String, String)>,
}

impl ClientHandler {
    /// Resolves the virtual user for this connection: splits the SSH
    /// username into `user:arg` (or `user~arg`), binds the argument, and
    /// looks the user up in the directory. Subsequent calls return the
    /// already-bound user.
    fn resolve_user(&mut self, ssh_username: &str) -> Option<Arc<User>> {
        if let Some(user) = &self.user {
            return Some(user.clone());
        }

        let (name, arg) = split_label(ssh_username)?;
        self.arg = Some(arg.to_string());

        let user = Arc::new(self.config.find_user(name)?.clone());
        self.user = Some(user.clone());
        Some(user)
    }

    /// Rejects the attempt and remembers that this connection was denied.
    /// Clients retry passwords and offer several keys within one
    /// connection, so nothing is recorded yet: the failure is committed at
    /// connection close, and only if auth never succeeded.
    fn reject_attempt(&mut self) -> Auth {
        self.auth_failed = true;
        reject()
    }

    fn dispatch(
        &mut self,
        channel_id: ChannelId,
        session: &mut ServerSession,
        command: Vec<String>,
    ) -> Result<(), ServerError> {
        let Some(user) = self.user.clone() else {
            return Err(ServerError::MissingAuthenticatedUser {
                method: "session request",
            });
        };

        let Some(state) = self.channels.get_mut(&channel_id) else {
            tracing::error!(peer_addr = %self.peer_addr, "request on unknown channel");
            session.channel_failure(channel_id).ok();
            session.close(channel_id).ok();
            return Ok(());
        };

        let (Some(stdin), Some(resize)) = (state.stdin_rx.take(), state.resize_rx.take()) else {
            tracing::error!(peer_addr = %self.peer_addr, "channel already has a running session");
            session.channel_failure(channel_id).ok();
            return Ok(());
        };

        let routed_session = Session {
            context: SessionContext {
                user,
                arg: self.arg.clone().unwrap_or_default(),
                route: None,
            },
            peer_addr: self.peer_addr.clone(),
            pty: state.pty.clone(),
            env: state.env.clone(),
            command,
            stdin,
            resize,
            writer: SessionWriter::new(session.handle(), channel_id),
        };

        session.channel_success(channel_id)?;

        let router = self.router.clone();
        tokio::spawn(async move {
            router.dispatch(routed_session).await;
        });

        Ok(())
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // Auth can still succeed after a rejected attempt (clients retry a
        // mistyped password or offer several keys), so the failure only
        // counts once the connection is gone without ever authenticating.
        // Successful auth never increments the limiter.
        if self.auth_failed && !self.authenticated {
            tracing::warn!(addr = %self.peer_addr, "failed login attempt");
            self.limiter.add_failed_login(&self.peer_addr);
        }
    }
}

impl russh::server::Handler for ClientHandler {
    type Error = ServerError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.limiter.login_allowed(&self.peer_addr) {
            tracing::warn!(
                username = %user,
                addr = %self.peer_addr,
                "login attempt blocked by fail2ban policy"
            );
            return Ok(self.reject_attempt());
        }

        let Some(directory_user) = self.resolve_user(user) else {
            return Ok(self.reject_attempt());
        };
        let Some(hash) = directory_user.password.clone() else {
            return Ok(self.reject_attempt());
        };

        // argon2id verification is CPU-heavy; keep it off the runtime
        // worker threads so other sessions don't stall behind it.
        let password = password.to_string();
        let verified =
            tokio::task::spawn_blocking(move || crate::auth::verify_password(&password, &hash))
                .await;

        match verified {
            Ok(Ok(true)) => {
                self.authenticated = true;
                Ok(Auth::Accept)
            }
            Ok(Ok(false)) => Ok(self.reject_attempt()),
            Ok(Err(error)) => {
                tracing::warn!(username = %user, %error, "password verification failed");
                Ok(self.reject_attempt())
            }
            Err(error) => {
                tracing::error!(%error, "password verification task failed");
                Ok(self.reject_attempt())
            }
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if !self.limiter.login_allowed(&self.peer_addr) {
            tracing::warn!(
                username = %user,
                addr = %self.peer_addr,
                "login attempt blocked by fail2ban policy"
            );
            return Ok(self.reject_attempt());
        }

        let Some(directory_user) = self.resolve_user(user) else {
            return Ok(self.reject_attempt());
        };

        if crate::auth::key_matches(&directory_user.name, &directory_user.pubkeys, key) {
            Ok(Auth::Accept)
        } else {
            Ok(self.reject_attempt())
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if !self.limiter.login_allowed(&self.peer_addr) {
            tracing::warn!(
                username = %user,
                addr = %self.peer_addr,
                "login attempt blocked by fail2ban policy"
            );
            return Ok(self.reject_attempt());
        }

        let Some(directory_user) = self.resolve_user(user) else {
            return Ok(self.reject_attempt());
        };

        if crate::auth::key_matches(&directory_user.name, &directory_user.pubkeys, key) {
            self.authenticated = true;
            Ok(Auth::Accept)
        } else {
            Ok(self.reject_attempt())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut ServerSession,
    ) -> Result<bool, Self::Error> {
        if self.user.is_none() {
            return Err(ServerError::MissingAuthenticatedUser {
                method: "channel_open_session",
            });
        }

        let (stdin_tx, stdin_rx) = mpsc::channel(64);
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        self.channels.insert(
            channel.id(),
            ChannelState {
                stdin_tx: Some(stdin_tx),
                stdin_rx: Some(stdin_rx),
                resize_tx,
                resize_rx: Some(resize_rx),
                pty: None,
                env: Vec::new(),
            },
        );

        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.pty = Some(PtyRequest {
                term: term.to_string(),
                cols: col_width,
                rows: row_height,
            });
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state
                .env
                .push((variable_name.to_string(), variable_value.to_string()));
            session.channel_success(channel)?;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            state
                .resize_tx
                .send(WindowSize {
                    cols: col_width,
                    rows: row_height,
                })
                .ok();
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, session, Vec::new())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, session, parse_command(data))
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(stdin_tx) = &state.stdin_tx {
                stdin_tx.send(data.to_vec()).await.ok();
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            // Dropping the sender is the EOF signal for the backend.
            state.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("BUG: {method} called but we don't have an authenticated user")]
    MissingAuthenticatedUser { method: &'static str },
    #[error(transparent)]
    Russh(#[from] russh::Error),
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

/// Splits a virtual-host label into user and argument. `:` is tried
/// first, `~` is the fallback.
fn split_label(username: &str) -> Option<(&str, &str)> {
    username
        .split_once(':')
        .or_else(|| username.split_once('~'))
}

/// Shell-splits the client's exec command line. Unbalanced quoting falls
/// back to whitespace splitting.
fn parse_command(data: &[u8]) -> Vec<String> {
    let line = String::from_utf8_lossy(data);
    shell_words::split(&line)
        .unwrap_or_else(|_| line.split_whitespace().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use russh::server::Handler as _;

    use super::*;

    fn test_handler(limiter: RateLimiter, peer_addr: &str) -> ClientHandler {
        let mut config = Config::default();
        config.auth.users.insert(
            "admin".to_string(),
            User {
                name: "admin".to_string(),
                password: Some(crate::auth::generate_hash("hunter2").unwrap()),
                ..Default::default()
            },
        );

        ClientHandler {
            config: Arc::new(config),
            router: Arc::new(Router::new()),
            limiter,
            peer_addr: peer_addr.to_string(),
            user: None,
            arg: None,
            authenticated: false,
            auth_failed: false,
            channels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_successful_auth_never_increments() {
        let limiter = RateLimiter::new(Duration::from_secs(300), 1);
        let addr = "1.2.3.4:40000";

        // A connection that fumbles an attempt but eventually
        // authenticates leaves the counter untouched.
        {
            let mut handler = test_handler(limiter.clone(), addr);
            let rejected = handler.auth_password("admin:web", "wrong").await.unwrap();
            assert!(matches!(rejected, Auth::Reject { .. }));

            let accepted = handler.auth_password("admin:web", "hunter2").await.unwrap();
            assert!(matches!(accepted, Auth::Accept));
        }

        assert!(limiter.login_allowed(addr));
    }

    #[tokio::test]
    async fn test_unauthenticated_connection_counts_once_at_close() {
        let limiter = RateLimiter::new(Duration::from_secs(300), 2);
        let addr = "1.2.3.4:40000";

        // Several rejected attempts within one connection commit a single
        // failed login when it closes.
        {
            let mut handler = test_handler(limiter.clone(), addr);
            for _ in 0..3 {
                let rejected = handler.auth_password("admin:web", "wrong").await.unwrap();
                assert!(matches!(rejected, Auth::Reject { .. }));
            }
        }
        assert!(limiter.login_allowed(addr));

        {
            let mut handler = test_handler(limiter.clone(), addr);
            let rejected = handler.auth_password("admin:web", "wrong").await.unwrap();
            assert!(matches!(rejected, Auth::Reject { .. }));
        }
        assert!(!limiter.login_allowed(addr));
    }

    #[test]
    fn test_split_label() {
        assert_eq!(split_label("alice:docker.web-1"), Some(("alice", "docker.web-1")));
        assert_eq!(split_label("alice~nomad.web"), Some(("alice", "nomad.web")));
        assert_eq!(split_label("justaname"), None);
        assert_eq!(split_label(""), None);
    }

    #[test]
    fn test_split_label_colon_wins() {
        // When both separators are present, `:` is tried first.
        assert_eq!(split_label("alice:a~b"), Some(("alice", "a~b")));
        assert_eq!(split_label("alice~a:b"), Some(("alice~a", "b")));
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command(b"ls -la"), ["ls", "-la"]);
        assert_eq!(
            parse_command(b"sh -c 'echo hi'"),
            ["sh", "-c", "echo hi"]
        );
        assert!(parse_command(b"").is_empty());
        // Unbalanced quotes degrade to whitespace splitting.
        assert_eq!(parse_command(b"echo 'oops"), ["echo", "'oops"]);
    }
}
