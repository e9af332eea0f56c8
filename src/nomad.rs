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

//! A thin client for the Nomad HTTP API: allocation listing and lookup
//! over REST, and the interactive task exec endpoint over its WebSocket
//! protocol (base64 data frames, tty_size resize frames).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::session::SessionWriter;

pub struct Client {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
    region: Option<String>,
    namespace: Option<String>,
}

/// A resize event for the remote pseudo-terminal.
#[derive(Debug, Clone, Copy)]
pub struct TerminalSize {
    pub height: u32,
    pub width: u32,
}

impl Client {
    pub fn new(
        server: &str,
        region: Option<String>,
        namespace: Option<String>,
        token: Option<String>,
    ) -> Result<Self, NomadError> {
        let base = Url::parse(server).map_err(|error| NomadError::InvalidServer {
            url: server.to_string(),
            error,
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token,
            region,
            namespace,
        })
    }

    /// Lists the current allocations of a job.
    pub async fn job_allocations(&self, job: &str) -> Result<Vec<AllocationStub>, NomadError> {
        self.get_json(&format!("/v1/job/{job}/allocations")).await
    }

    /// Fetches a single allocation, including its job's task groups.
    pub async fn allocation(&self, id: &str) -> Result<Allocation, NomadError> {
        self.get_json(&format!("/v1/allocation/{id}")).await
    }

    /// Runs an interactive command in a task of the given allocation,
    /// wiring the client session's stdin and resize events to the remote
    /// side and the remote output to the session. Returns the remote exit
    /// code once the command finishes.
    pub async fn exec(
        &self,
        allocation: &Allocation,
        task: &str,
        command: &[String],
        mut stdin: mpsc::Receiver<Vec<u8>>,
        mut resize: mpsc::Receiver<TerminalSize>,
        writer: SessionWriter,
    ) -> Result<i32, NomadError> {
        let command_json =
            serde_json::to_string(command).map_err(|error| NomadError::Encoding { error })?;

        let mut url = self.url(&format!("/v1/client/allocation/{}/exec", allocation.id))?;
        url.query_pairs_mut()
            .append_pair("task", task)
            .append_pair("command", &command_json)
            .append_pair("tty", "true");
        let ws_scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(ws_scheme)
            .map_err(|()| NomadError::InvalidScheme)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|error| NomadError::WebSocket { error })?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(token)
                .map_err(|error| NomadError::InvalidToken { error })?;
            request.headers_mut().insert("X-Nomad-Token", value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|error| NomadError::WebSocket { error })?;
        let (mut tx, mut rx) = stream.split();

        let mut stdin_open = true;
        let mut resize_open = true;

        loop {
            tokio::select! {
                frame = rx.next() => match frame {
                    None => return Ok(0),
                    Some(Err(error)) => return Err(NomadError::WebSocket { error }),
                    Some(Ok(Message::Text(text))) => {
                        let frame: ExecFrame = serde_json::from_str(&text)
                            .map_err(|error| NomadError::Encoding { error })?;

                        if let Some(data) = frame.stdout.and_then(|s| s.data) {
                            let bytes = BASE64
                                .decode(data)
                                .map_err(|error| NomadError::Base64 { error })?;
                            if writer.data(&bytes).await.is_err() {
                                return Ok(0);
                            }
                        }
                        if let Some(data) = frame.stderr.and_then(|s| s.data) {
                            let bytes = BASE64
                                .decode(data)
                                .map_err(|error| NomadError::Base64 { error })?;
                            if writer.stderr(&bytes).await.is_err() {
                                return Ok(0);
                            }
                        }
                        if frame.exited.unwrap_or(false) {
                            let code = frame.result.and_then(|r| r.exit_code).unwrap_or(0);
                            return Ok(code);
                        }
                    }
                    Some(Ok(_)) => {}
                },

                data = stdin.recv(), if stdin_open => match data {
                    Some(bytes) => {
                        let frame = serde_json::json!({
                            "stdin": { "data": BASE64.encode(&bytes) }
                        });
                        tx.send(Message::Text(frame.to_string()))
                            .await
                            .map_err(|error| NomadError::WebSocket { error })?;
                    }
                    None => {
                        stdin_open = false;
                        let frame = serde_json::json!({ "stdin": { "close": true } });
                        tx.send(Message::Text(frame.to_string())).await.ok();
                    }
                },

                size = resize.recv(), if resize_open => match size {
                    Some(ts) => {
                        let frame = serde_json::json!({
                            "tty_size": { "height": ts.height, "width": ts.width }
                        });
                        tx.send(Message::Text(frame.to_string())).await.ok();
                    }
                    None => resize_open = false,
                },
            }
        }
    }

    fn url(&self, path: &str) -> Result<Url, NomadError> {
        let mut url = self.base.join(path).map_err(|error| NomadError::InvalidServer {
            url: format!("{}{path}", self.base),
            error,
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(region) = &self.region {
                query.append_pair("region", region);
            }
            if let Some(namespace) = &self.namespace {
                query.append_pair("namespace", namespace);
            }
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, NomadError> {
        let url = self.url(path)?;
        let mut request = self.http.get(url.as_str());
        if let Some(token) = &self.token {
            request = request.header("X-Nomad-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| NomadError::Http { error })?;
        let status = response.status();
        if !status.is_success() {
            return Err(NomadError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json()
            .await
            .map_err(|error| NomadError::Http { error })
    }
}

/// A job allocation as returned by the allocation-list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocationStub {
    #[serde(rename = "ID")]
    pub id: String,
}

/// A single allocation with the job structure needed to resolve task
/// groups and tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Job")]
    pub job: JobInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobInfo {
    #[serde(rename = "TaskGroups", default)]
    pub task_groups: Vec<TaskGroup>,
}

impl JobInfo {
    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups
            .iter()
            .find(|group| group.name.as_deref() == Some(name))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskGroup {
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Tasks", default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExecFrame {
    stdout: Option<FrameData>,
    stderr: Option<FrameData>,
    exited: Option<bool>,
    result: Option<FrameResult>,
}

#[derive(Debug, Deserialize)]
struct FrameData {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameResult {
    exit_code: Option<i32>,
}

#[derive(thiserror::Error, Debug)]
pub enum NomadError {
    #[error("invalid nomad server url {url:?}: {error}")]
    InvalidServer { url: String, error: url::ParseError },
    #[error("nomad server url scheme cannot be used for websockets")]
    InvalidScheme,
    #[error("nomad request failed: {error}")]
    Http { error: reqwest::Error },
    #[error("nomad api returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("nomad websocket error: {error}")]
    WebSocket {
        error: tokio_tungstenite::tungstenite::Error,
    },
    #[error("error encoding nomad exec frame: {error}")]
    Encoding { error: serde_json::Error },
    #[error("error decoding nomad exec data: {error}")]
    Base64 { error: base64::DecodeError },
    #[error("invalid nomad auth token: {error}")]
    InvalidToken { error: InvalidHeaderValue },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_decoding() {
        let allocation: Allocation = serde_json::from_str(
            r#"{
                "ID": "5456bd7a-7c7f-4c44-91c0-c902c5f40e7e",
                "Job": {
                    "TaskGroups": [
                        {
                            "Name": "web",
                            "Tasks": [{"Name": "frontend"}, {"Name": "sidecar"}]
                        },
                        {
                            "Name": "db",
                            "Tasks": [{"Name": "postgres"}]
                        }
                    ]
                }
            }"#,
        )
        .expect("allocation didn't decode");

        assert_eq!(allocation.id, "5456bd7a-7c7f-4c44-91c0-c902c5f40e7e");
        assert_eq!(allocation.job.task_groups.len(), 2);

        let group = allocation.job.lookup_task_group("db").unwrap();
        assert_eq!(group.tasks[0].name, "postgres");
        assert!(allocation.job.lookup_task_group("missing").is_none());
    }

    #[test]
    fn test_exec_frame_decoding() {
        let frame: ExecFrame =
            serde_json::from_str(r#"{"stdout":{"data":"aGVsbG8="}}"#).unwrap();
        let data = frame.stdout.unwrap().data.unwrap();
        assert_eq!(BASE64.decode(data).unwrap(), b"hello");

        let frame: ExecFrame =
            serde_json::from_str(r#"{"exited":true,"result":{"exit_code":3}}"#).unwrap();
        assert_eq!(frame.exited, Some(true));
        assert_eq!(frame.result.unwrap().exit_code, Some(3));
    }

    #[test]
    fn test_region_and_namespace_are_query_params() {
        let client = Client::new(
            "http://localhost:4646",
            Some("eu".to_string()),
            Some("default".to_string()),
            None,
        )
        .unwrap();

        let url = client.url("/v1/job/web/allocations").unwrap();
        assert_eq!(url.path(), "/v1/job/web/allocations");
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(query.contains(&("region".to_string(), "eu".to_string())));
        assert!(query.contains(&("namespace".to_string(), "default".to_string())));
    }

    #[test]
    fn test_invalid_server_url() {
        assert!(matches!(
            Client::new("not a url", None, None, None),
            Err(NomadError::InvalidServer { .. })
        ));
    }
}
