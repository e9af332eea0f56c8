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

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::Route;
use crate::nomad::{AllocationStub, JobInfo, TaskGroup, TerminalSize};
use crate::router::{Handler, HandlerError, HandlerFuture};
use crate::session::Session;

/// Settings for the nomad backend. The `delimeter` spelling matches the
/// configuration surface.
#[derive(Debug, Deserialize)]
pub(crate) struct NomadSettings {
    server: String,
    delimeter: Option<String>,
    region: Option<String>,
    namespace: Option<String>,
    auth_token: Option<String>,
    command: Option<Vec<String>>,
}

/// The nomad backend: runs an interactive command in a task of a job's
/// allocation. The routing argument addresses the task as `job`,
/// `job.task`, `job.group.task`, or `job.alloc.group.task`, where `alloc`
/// is an allocation ID or an index into the job's allocation list.
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
        stdin,
        mut resize,
        writer,
        ..
    } = session;
    let user = context.user;

    let opts: NomadSettings = super::decode_settings(&route)?;

    // The PTY is the interactive-mode indicator; its size seeds the
    // remote terminal, with later changes carried by the resize events.
    let Some(pty) = pty else {
        return Err(HandlerError::PtyRequired);
    };

    let client = crate::nomad::Client::new(
        &opts.server,
        opts.region.clone(),
        opts.namespace.clone(),
        opts.auth_token.clone(),
    )?;

    let delimiter = opts.delimeter.as_deref().unwrap_or(".");
    let tokens: Vec<&str> = arg.split(delimiter).collect();
    let job = tokens[0];

    let allocations = client.job_allocations(job).await?;
    if allocations.is_empty() {
        return Err(HandlerError::NoAllocations {
            job: job.to_string(),
        });
    }

    if tokens.len() > 4 {
        return Ok(());
    }

    let alloc_id = select_allocation(&allocations, &tokens);
    let allocation = client.allocation(&alloc_id).await?;
    let (group, task) = resolve_target(&allocation.job, &tokens)?;
    let group_name = group
        .name
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    let job_tag = format!("job:{job}");
    let task_tag = format!("task:{task}");
    let group_tag = format!("group:{group_name}");
    if !route.is_allowed(
        &user,
        &[job_tag.as_str(), task_tag.as_str(), group_tag.as_str()],
    ) {
        return Err(HandlerError::Unauthorized);
    }

    let cmd = super::command_or_default(&command, opts.command.as_ref());

    // Fan resize events out to the exec's terminal-size stream, starting
    // with the client's initial window size.
    let (size_tx, size_rx) = mpsc::channel(1);
    let resize_task = tokio::spawn(async move {
        let initial = TerminalSize {
            height: pty.rows,
            width: pty.cols,
        };
        if size_tx.send(initial).await.is_err() {
            return;
        }
        while let Some(ws) = resize.recv().await {
            let size = TerminalSize {
                height: ws.rows,
                width: ws.cols,
            };
            if size_tx.send(size).await.is_err() {
                break;
            }
        }
    });

    let result = client
        .exec(&allocation, &task, &cmd, stdin, size_rx, writer.clone())
        .await;
    resize_task.abort();
    result?;

    Ok(())
}

/// Which allocation to inspect: the four-token form lets the client pick
/// one by ID, or by index into the job's allocation list; everything else
/// uses the first allocation.
fn select_allocation(allocations: &[AllocationStub], tokens: &[&str]) -> String {
    if tokens.len() == 4 {
        let reference = tokens[1];
        if let Ok(index) = reference.parse::<usize>() {
            if index < allocations.len() {
                return allocations[index].id.clone();
            }
        }
        return reference.to_string();
    }
    allocations[0].id.clone()
}

/// Resolves the task group and task name addressed by the tokens. An
/// empty task token selects the group's first task.
fn resolve_target<'a>(
    job: &'a JobInfo,
    tokens: &[&str],
) -> Result<(&'a TaskGroup, String), HandlerError> {
    let first_group = || job.task_groups.first().ok_or(HandlerError::TaskGroupNotFound);
    let first_task = |group: &TaskGroup| {
        group
            .tasks
            .first()
            .map(|task| task.name.clone())
            .ok_or(HandlerError::TaskNotFound)
    };

    match *tokens {
        [_job] => {
            let group = first_group()?;
            Ok((group, first_task(group)?))
        }
        [_job, task] => {
            let group = first_group()?;
            let task = group
                .tasks
                .iter()
                .find(|t| t.name == task)
                .ok_or(HandlerError::TaskNotFound)?;
            Ok((group, task.name.clone()))
        }
        [_job, group, task] => {
            let group = job
                .lookup_task_group(group)
                .ok_or(HandlerError::TaskGroupNotFound)?;
            let task = if task.is_empty() {
                first_task(group)?
            } else {
                task.to_string()
            };
            Ok((group, task))
        }
        [_job, _alloc, group, task] => {
            let group = if group.is_empty() {
                first_group()?
            } else {
                job.lookup_task_group(group)
                    .ok_or(HandlerError::TaskGroupNotFound)?
            };
            let task = if task.is_empty() {
                first_task(group)?
            } else {
                task.to_string()
            };
            Ok((group, task))
        }
        _ => Err(HandlerError::TaskNotFound),
    }
}
