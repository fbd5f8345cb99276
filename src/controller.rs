//! HTTP client for the local Moonraker controller bound to one printer.

use crate::error::ControllerError;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
const MAX_SNAPSHOT_BYTES: usize = 10 * 1024 * 1024;
const OVERALL_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Short ordered list of webcam snapshot endpoints tried in turn; the first
/// 2xx response wins, a 404 advances to the next candidate.
const SNAPSHOT_CANDIDATES: &[&str] = &["/webcam/?action=snapshot", "/webcam1/?action=snapshot", "/snapshot"];

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
}

pub struct SnapshotImage {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Client bound to one Moonraker instance, owned by the orchestrator for
/// the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    http: Client,
    base_url: Url,
    aux_url: Option<Url>,
}

impl ControllerClient {
    pub fn new(base_url: &str, ui_port: Option<u16>) -> Result<Self, ControllerError> {
        let http = Client::builder()
            .timeout(OVERALL_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build()?;
        let base_url = Url::parse(base_url)?;
        let aux_url = match ui_port {
            Some(port) => {
                let mut u = base_url.clone();
                u.set_port(Some(port))
                    .map_err(|_| ControllerError::Other("base_url cannot carry a port".to_string()))?;
                Some(u)
            }
            None => None,
        };
        Ok(ControllerClient {
            http,
            base_url,
            aux_url,
        })
    }

    async fn read_capped(resp: Response, cap: usize) -> Result<(StatusCode, Vec<u8>), ControllerError> {
        let status = resp.status();
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if bytes.len() + chunk.len() > cap {
                return Err(ControllerError::ResponseTooLarge(cap));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok((status, bytes))
    }

    async fn json_response<T: for<'de> serde::Deserialize<'de>>(
        resp: Response,
    ) -> Result<T, ControllerError> {
        let (status, bytes) = Self::read_capped(resp, MAX_RESPONSE_BYTES).await?;
        if !status.is_success() {
            return Err(ControllerError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).chars().take(512).collect(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn empty_response(resp: Response) -> Result<(), ControllerError> {
        let (status, bytes) = Self::read_capped(resp, MAX_RESPONSE_BYTES).await?;
        if !status.is_success() {
            return Err(ControllerError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).chars().take(512).collect(),
            });
        }
        Ok(())
    }

    pub async fn query_objects(&self) -> Result<Value, ControllerError> {
        let url = self.base_url.join("/printer/objects/query")?;
        let body = json!({
            "objects": {
                "print_stats": Value::Null,
                "virtual_sdcard": Value::Null,
                "extruder": Value::Null,
                "heater_bed": Value::Null,
                "toolhead": Value::Null,
                "pause_resume": Value::Null,
            }
        });
        let resp = self.http.post(url).json(&body).send().await?;
        Self::json_response(resp).await
    }

    pub async fn pause(&self) -> Result<(), ControllerError> {
        let url = self.base_url.join("/printer/print/pause")?;
        let resp = self.http.post(url).send().await?;
        Self::empty_response(resp).await
    }

    pub async fn resume(&self) -> Result<(), ControllerError> {
        let url = self.base_url.join("/printer/print/resume")?;
        let resp = self.http.post(url).send().await?;
        Self::empty_response(resp).await
    }

    pub async fn cancel(&self) -> Result<(), ControllerError> {
        let url = self.base_url.join("/printer/print/cancel")?;
        let resp = self.http.post(url).send().await?;
        Self::empty_response(resp).await
    }

    pub async fn start_print(&self, filename: &str) -> Result<(), ControllerError> {
        let mut url = self.base_url.join("/printer/print/start")?;
        url.query_pairs_mut().append_pair("filename", filename);
        let resp = self.http.post(url).send().await?;
        Self::empty_response(resp).await
    }

    pub async fn upload_file(&self, filename: &str, bytes: Vec<u8>) -> Result<(), ControllerError> {
        let url = self.base_url.join("/server/files/upload")?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("root", "gcodes");
        let resp = self.http.post(url).multipart(form).send().await?;
        Self::empty_response(resp).await
    }

    pub async fn delete_file(&self, filename: &str) -> Result<(), ControllerError> {
        let mut url = self.base_url.join("/server/files/gcodes/")?;
        url.path_segments_mut()
            .map_err(|_| ControllerError::Other("base_url cannot be a base".to_string()))?
            .push(filename);
        let resp = self.http.delete(url).send().await?;
        Self::empty_response(resp).await
    }

    pub async fn list_files(&self) -> Result<Vec<FileRecord>, ControllerError> {
        let url = self.base_url.join("/server/files/list")?;
        let resp = self.http.get(url).send().await?;
        let body: Value = Self::json_response(resp).await?;
        let result = body.get("result").ok_or_else(|| {
            ControllerError::Other("controller response missing result key".to_string())
        })?;
        let entries = result.as_array().ok_or_else(|| {
            ControllerError::Other("controller result was not an array".to_string())
        })?;
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = entry
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let size = entry.get("size").and_then(Value::as_u64).unwrap_or(0);
            files.push(FileRecord { path, size });
        }
        Ok(files)
    }

    /// Best-effort: tries each candidate endpoint in turn, skipping past
    /// 404s, returning the first 2xx body. Any other non-2xx is fatal.
    pub async fn get_snapshot_image(&self) -> Result<SnapshotImage, ControllerError> {
        let base = self.aux_url.as_ref().unwrap_or(&self.base_url);
        for candidate in SNAPSHOT_CANDIDATES {
            let url = base.join(candidate)?;
            let resp = self.http.get(url).send().await?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                continue;
            }
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let (status, bytes) = Self::read_capped(resp, MAX_SNAPSHOT_BYTES).await?;
            if !status.is_success() {
                return Err(ControllerError::Status {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).chars().take(512).collect(),
                });
            }
            return Ok(SnapshotImage { content_type, bytes });
        }
        Err(ControllerError::NoSnapshotCandidate)
    }
}
