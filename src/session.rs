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

use std::sync::Arc;

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;

use crate::config::{Route, User};

/// A window-resize event from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
}

/// The client's PTY request: terminal type and initial dimensions.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// Per-connection bindings carried through the session lifetime. The
/// authentication pipeline writes `user` and `arg`; the router writes
/// `route`. None of the values are mutated after being written.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user: Arc<User>,
    pub arg: String,
    pub route: Option<Arc<Route>>,
}

/// An accepted interactive session, handed to the router once the client
/// sends a shell or exec request. Backends consume the stdin and resize
/// receivers and write output through the writer; when the client
/// disconnects both receivers close, which is the teardown signal.
pub struct Session {
    pub context: SessionContext,
    pub peer_addr: String,
    pub pty: Option<PtyRequest>,
    pub env: Vec<(String, String)>,
    /// The exec command line, shell-split. Empty for shell requests.
    pub command: Vec<String>,
    pub stdin: mpsc::Receiver<Vec<u8>>,
    pub resize: mpsc::UnboundedReceiver<WindowSize>,
    pub writer: SessionWriter,
}

/// The writing side of a client session channel. Cheap to clone; all
/// writes go through the russh server handle so they can be issued from
/// any task.
#[derive(Clone)]
pub struct SessionWriter {
    handle: Handle,
    channel: ChannelId,
}

/// The client side of the session went away mid-write.
#[derive(thiserror::Error, Debug)]
#[error("client session closed")]
pub struct SessionClosed;

impl SessionWriter {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }

    /// Writes to the session's stdout stream.
    pub async fn data(&self, data: &[u8]) -> Result<(), SessionClosed> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| SessionClosed)
    }

    /// Writes to the session's stderr stream.
    pub async fn stderr(&self, data: &[u8]) -> Result<(), SessionClosed> {
        self.handle
            .extended_data(self.channel, 1, CryptoVec::from_slice(data))
            .await
            .map_err(|_| SessionClosed)
    }

    /// Reports the handler's exit status to the client.
    pub async fn exit_status(&self, status: u32) {
        self.handle
            .exit_status_request(self.channel, status)
            .await
            .ok();
    }

    /// Closes the client channel.
    pub async fn close(&self) {
        self.handle.eof(self.channel).await.ok();
        self.handle.close(self.channel).await.ok();
    }
}
