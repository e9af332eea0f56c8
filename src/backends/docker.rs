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

use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use indexmap::IndexMap;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::config::Route;
use crate::router::{Handler, HandlerError, HandlerFuture};
use crate::session::Session;

/// Settings for the docker backend. The routing argument is the container
/// to exec into.
#[derive(Debug, Deserialize)]
pub(crate) struct DockerSettings {
    command: Option<Vec<String>>,
    privileged: Option<bool>,
    user: Option<String>,
    user_map: Option<IndexMap<String, String>>,
}

/// The docker backend: attaches the client session to an interactive exec
/// in the container named by the routing argument.
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
        env,
        command,
        mut stdin,
        mut resize,
        writer,
        ..
    } = session;
    let user = context.user;

    if !route.is_allowed(&user, &[arg.as_str()]) {
        return Err(HandlerError::Unauthorized);
    }

    let opts: DockerSettings = super::decode_settings(&route)?;

    let Some(pty) = pty else {
        return Err(HandlerError::PtyRequired);
    };

    let remote_user = super::resolve_remote_user(opts.user.as_ref(), opts.user_map.as_ref(), &user);
    let cmd = super::command_or_default(&command, opts.command.as_ref());

    let docker = Docker::connect_with_defaults()?;

    let exec = docker
        .create_exec(
            &arg,
            CreateExecOptions::<String> {
                user: Some(remote_user),
                privileged: opts.privileged,
                tty: Some(true),
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                env: Some(compose_env(&env, &pty.term)),
                cmd: Some(cmd),
                ..Default::default()
            },
        )
        .await?;

    // Resize fan-out for the lifetime of the exec.
    let resize_docker = docker.clone();
    let exec_id = exec.id.clone();
    let resize_task = tokio::spawn(async move {
        while let Some(ws) = resize.recv().await {
            resize_docker
                .resize_exec(
                    &exec_id,
                    ResizeExecOptions {
                        height: ws.rows as u16,
                        width: ws.cols as u16,
                    },
                )
                .await
                .ok();
        }
    });

    let results = match docker
        .start_exec(
            &exec.id,
            Some(StartExecOptions {
                detach: false,
                ..Default::default()
            }),
        )
        .await
    {
        Ok(results) => results,
        Err(error) => {
            resize_task.abort();
            return Err(error.into());
        }
    };

    let StartExecResults::Attached {
        mut output,
        mut input,
    } = results
    else {
        resize_task.abort();
        return Ok(());
    };

    // Seed the exec's terminal with the client's initial window size.
    docker
        .resize_exec(
            &exec.id,
            ResizeExecOptions {
                height: pty.rows as u16,
                width: pty.cols as u16,
            },
        )
        .await
        .ok();

    let mut stdin_open = true;
    let result = loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(Ok(chunk)) => {
                    let bytes = chunk.into_bytes();
                    if writer.data(&bytes).await.is_err() {
                        break Ok(());
                    }
                }
                Some(Err(error)) => break Err(error.into()),
                None => break Ok(()),
            },
            data = stdin.recv(), if stdin_open => match data {
                Some(bytes) => {
                    if input.write_all(&bytes).await.is_err() {
                        break Ok(());
                    }
                }
                None => {
                    stdin_open = false;
                    input.shutdown().await.ok();
                }
            },
        }
    };

    resize_task.abort();
    result
}

/// The exec environment: the session's environment variables plus the
/// client terminal type.
fn compose_env(env: &[(String, String)], term: &str) -> Vec<String> {
    env.iter()
        .map(|(name, value)| format!("{name}={value}"))
        .chain([format!("TERM={term}")])
        .collect()
}
