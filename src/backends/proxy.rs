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

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg};
use russh::ChannelMsg;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::Route;
use crate::router::{Handler, HandlerError, HandlerFuture};
use crate::session::{Session, SessionClosed, SessionWriter};

/// Settings for the proxy backend. Exactly one of `host` and `hosts` is
/// expected: a fixed upstream, or a list of `addr[:port]` glob patterns
/// matched against the routing argument.
#[derive(Debug, Deserialize)]
pub(crate) struct ProxySettings {
    host: Option<String>,
    hosts: Option<Vec<String>>,
    user: Option<String>,
    privkey: Option<PathBuf>,
    user_map: Option<IndexMap<String, String>>,
}

/// The proxy backend: bridges the client session onto an interactive
/// session on a remote SSH server.
pub fn backend(route: Arc<Route>) -> Handler {
    Arc::new(move |session, arg| -> HandlerFuture {
        let route = route.clone();
        Box::pin(run(route, session, arg))
    })
}

async fn run(route: Arc<Route>, session: Session, arg: String) -> Result<(), HandlerError> {
    let Session {
        context,
        pty,
        command,
        mut stdin,
        mut resize,
        writer,
        ..
    } = session;
    let user = context.user;

    if !route.is_allowed(&user, &["*"]) {
        return Err(HandlerError::Unauthorized);
    }

    let opts: ProxySettings = super::decode_settings(&route)?;

    let Some(pty) = pty else {
        return Err(HandlerError::PtyRequired);
    };

    let remote_user = super::resolve_remote_user(opts.user.as_ref(), opts.user_map.as_ref(), &user);
    let (addr, port) = select_host(&opts, &arg)?;

    let config = Arc::new(russh::client::Config::default());
    let handler = UpstreamHandler {
        host: addr.clone(),
        port,
    };
    let mut client = russh::client::connect(config, (addr.as_str(), port), handler).await?;

    let mut authenticated = false;
    if let Some(privkey) = &opts.privkey {
        let key = russh::keys::load_secret_key(privkey, None).map_err(|error| {
            HandlerError::LoadingPrivateKey {
                path: privkey.display().to_string(),
                error,
            }
        })?;
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), Some(HashAlg::Sha512));

        if client
            .authenticate_publickey(&remote_user, key)
            .await?
            .success()
        {
            authenticated = true;
        } else {
            tracing::warn!(user = %remote_user, addr = %addr, "public key authentication failed");
        }
    }

    if !authenticated {
        let prompt = format!("Password for {remote_user}@{addr}: ");
        writer.stderr(prompt.as_bytes()).await?;
        let password = read_password(&mut stdin, &writer).await?;
        writer.data(b"\n").await.ok();

        if client
            .authenticate_password(&remote_user, &password)
            .await?
            .success()
        {
            authenticated = true;
        }
    }

    if !authenticated {
        return Err(HandlerError::UpstreamAuthFailed {
            user: remote_user,
            addr: format!("{addr}:{port}"),
        });
    }

    let channel = client.channel_open_session().await?;
    channel
        .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
        .await?;

    if command.is_empty() {
        channel.request_shell(false).await?;
    } else {
        channel.exec(false, shell_words::join(&command)).await?;
    }

    let (mut upstream_rx, upstream_tx) = channel.split();

    // Forward client input and window resizes to the upstream session.
    let pump = tokio::spawn(async move {
        let mut stdin_open = true;
        let mut resize_open = true;
        while stdin_open || resize_open {
            tokio::select! {
                data = stdin.recv(), if stdin_open => match data {
                    Some(bytes) => {
                        if upstream_tx.data(bytes.as_slice()).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        stdin_open = false;
                        upstream_tx.eof().await.ok();
                    }
                },
                size = resize.recv(), if resize_open => match size {
                    Some(ws) => {
                        upstream_tx.window_change(ws.cols, ws.rows, 0, 0).await.ok();
                    }
                    None => resize_open = false,
                },
            }
        }
    });

    let mut exit_status = None;
    while let Some(msg) = upstream_rx.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                if writer.data(&data).await.is_err() {
                    break;
                }
            }
            ChannelMsg::ExtendedData { data, .. } => {
                if writer.stderr(&data).await.is_err() {
                    break;
                }
            }
            ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
            _ => {}
        }
    }
    pump.abort();

    match exit_status {
        Some(0) | None => Ok(()),
        Some(status) => Err(HandlerError::UpstreamExit { status }),
    }
}

/// Picks the upstream address and port. A fixed `host` wins; otherwise the
/// `hosts` patterns are tried in order, matching the address part against
/// the routing argument with shell globs. On a pattern match the effective
/// address is the argument itself, with the port taken from the pattern.
fn select_host(opts: &ProxySettings, arg: &str) -> Result<(String, u16), HandlerError> {
    if let Some(host) = &opts.host {
        let (addr, port) = split_host_port(host);
        return Ok((addr.to_string(), parse_port(port)?));
    }

    let hosts = opts.hosts.as_deref().unwrap_or(&[]);
    if hosts.is_empty() {
        return Err(HandlerError::NoHostConfigured);
    }

    for pattern in hosts {
        let (addr, port) = split_host_port(pattern);
        if glob_match(addr, arg) {
            return Ok((arg.to_string(), parse_port(port)?));
        }
    }

    Err(HandlerError::NoMatchingHostPattern)
}

fn split_host_port(host: &str) -> (&str, &str) {
    host.split_once(':').unwrap_or((host, "22"))
}

fn parse_port(port: &str) -> Result<u16, HandlerError> {
    port.parse().map_err(|error| HandlerError::InvalidPort {
        value: port.to_string(),
        error,
    })
}

/// Shell-style glob match: `*` matches any run of characters, `?` matches
/// any single character, everything else matches literally.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(pattern: &[char], text: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('*', rest)) => {
                (0..=text.len()).any(|skip| matches(rest, &text[skip..]))
            }
            Some(('?', rest)) => !text.is_empty() && matches(rest, &text[1..]),
            Some((ch, rest)) => text.first() == Some(ch) && matches(rest, &text[1..]),
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches(&pattern, &text)
}

/// Reads a password from the client one byte at a time, echoing `*` per
/// byte. Handles backspace (erase one `*`), Ctrl-C/Ctrl-D (close the
/// session and cancel), and CR/LF (commit, trimmed).
async fn read_password(
    stdin: &mut mpsc::Receiver<Vec<u8>>,
    writer: &SessionWriter,
) -> Result<String, HandlerError> {
    let mut out: Vec<u8> = Vec::new();

    loop {
        let Some(bytes) = stdin.recv().await else {
            return Err(SessionClosed.into());
        };

        for byte in bytes {
            match byte {
                b'\r' | b'\n' => {
                    return Ok(String::from_utf8_lossy(&out).trim().to_string());
                }
                0x7F => {
                    if !out.is_empty() {
                        out.pop();
                        // Erase the last asterisk.
                        writer.data(b"\x08 \x08").await.ok();
                    }
                }
                0x03 | 0x04 => {
                    writer.close().await;
                    return Err(HandlerError::PasswordEntryCanceled);
                }
                _ => {
                    writer.data(b"*").await.ok();
                    out.push(byte);
                }
            }
        }
    }
}

struct UpstreamHandler {
    host: String,
    port: u16,
}

impl russh::client::Handler for UpstreamHandler {
    type Error = HandlerError;

    async fn check_server_key(
        &mut self,
        key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh::keys::check_known_hosts(&self.host, self.port, key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, key)
                    .map_err(|error| HandlerError::KnownHosts { error })?;
                tracing::info!(host = %self.host, port = self.port, "added host key to known hosts");
                Ok(true)
            }
            Err(error) => Err(HandlerError::KnownHosts { error }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(host: Option<&str>, hosts: Option<&[&str]>) -> ProxySettings {
        ProxySettings {
            host: host.map(|h| h.to_string()),
            hosts: hosts.map(|hs| hs.iter().map(|h| h.to_string()).collect()),
            user: None,
            privkey: None,
            user_map: None,
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("node*", "node03"));
        assert!(glob_match("node*", "node"));
        assert!(!glob_match("node*", "mode03"));
        assert!(glob_match("node??", "node03"));
        assert!(!glob_match("node??", "node3"));
        assert!(glob_match("nas", "nas"));
        assert!(!glob_match("nas", "NAS"));
    }

    #[test]
    fn test_fixed_host() {
        let opts = settings(Some("10.0.0.5:2222"), None);
        assert_eq!(
            select_host(&opts, "ignored").unwrap(),
            ("10.0.0.5".to_string(), 2222)
        );

        let opts = settings(Some("10.0.0.5"), None);
        assert_eq!(
            select_host(&opts, "ignored").unwrap(),
            ("10.0.0.5".to_string(), 22)
        );
    }

    #[test]
    fn test_host_patterns() {
        let opts = settings(None, Some(&["node*", "nas"]));

        // The effective address is the argument, not the pattern.
        assert_eq!(
            select_host(&opts, "node03").unwrap(),
            ("node03".to_string(), 22)
        );
        assert_eq!(select_host(&opts, "nas").unwrap(), ("nas".to_string(), 22));
        assert!(matches!(
            select_host(&opts, "other"),
            Err(HandlerError::NoMatchingHostPattern)
        ));
    }

    #[test]
    fn test_host_pattern_port() {
        let opts = settings(None, Some(&["node*:2222"]));
        assert_eq!(
            select_host(&opts, "node7").unwrap(),
            ("node7".to_string(), 2222)
        );
    }

    #[test]
    fn test_no_host_configuration() {
        let opts = settings(None, None);
        assert!(matches!(
            select_host(&opts, "x"),
            Err(HandlerError::NoHostConfigured)
        ));

        let opts = settings(None, Some(&[]));
        assert!(matches!(
            select_host(&opts, "x"),
            Err(HandlerError::NoHostConfigured)
        ));
    }

    #[test]
    fn test_invalid_port() {
        let opts = settings(Some("host:notaport"), None);
        assert!(matches!(
            select_host(&opts, "x"),
            Err(HandlerError::InvalidPort { .. })
        ));
    }
}
