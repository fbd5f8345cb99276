//! HTTP client for the remote control plane: pairing, heartbeats, command
//! fetch/complete, snapshot batches, and backup uploads.

use crate::error::CloudError;
use crate::util::PermissiveId;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const USER_AGENT_PREFIX: &str = "printer-connector";
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
const OVERALL_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub pairing_token: String,
    pub site_name: String,
    pub printers: Vec<RegisterPrinter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterPrinter {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub connector: RegisterConnector,
    pub credentials: RegisterCredentials,
    #[serde(default)]
    pub printers: Vec<RegisteredPrinter>,
    #[serde(default)]
    pub polling: Option<PollingOverrides>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterConnector {
    pub id: PermissiveId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterCredentials {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredPrinter {
    pub id: PermissiveId,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingOverrides {
    pub commands_seconds: Option<u64>,
    pub snapshots_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub uptime_seconds: u64,
    pub agent_version: String,
    pub printers: Vec<PrinterReachability>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrinterReachability {
    pub printer_id: PermissiveId,
    pub reachable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudCommand {
    pub id: PermissiveId,
    pub printer_id: PermissiveId,
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteCommandRequest {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotPayload {
    pub printer_id: PermissiveId,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotBatch {
    pub snapshots: Vec<SnapshotPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotBatchResponse {
    pub inserted: u64,
}

/// Client for the remote control plane. Stateless after `set_credentials` is
/// called once following a successful pairing; safe to share across the
/// three concurrent loops.
#[derive(Debug, Clone)]
pub struct CloudClient {
    http: Client,
    base_url: Url,
    connector_id: Option<PermissiveId>,
    connector_secret: Option<String>,
}

impl CloudClient {
    pub fn new(base_url: &str) -> Result<Self, CloudError> {
        let http = Client::builder()
            .timeout(OVERALL_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .user_agent(format!("{}/{}", USER_AGENT_PREFIX, env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(CloudClient {
            http,
            base_url: Url::parse(base_url)?,
            connector_id: None,
            connector_secret: None,
        })
    }

    /// Installs long-lived credentials after a successful pairing. Called
    /// exactly once, before any authenticated loop starts.
    pub fn set_credentials(&mut self, connector_id: PermissiveId, connector_secret: String) {
        self.connector_id = Some(connector_id);
        self.connector_secret = Some(connector_secret);
    }

    fn auth_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder.header("Accept", "application/json");
        if let Some(secret) = &self.connector_secret {
            builder = builder.bearer_auth(secret);
        }
        if let Some(id) = &self.connector_id {
            builder = builder.header("X-Connector-Id", id.0.as_str());
        }
        builder
    }

    async fn read_capped(resp: Response) -> Result<(StatusCode, Vec<u8>), CloudError> {
        let status = resp.status();
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(CloudError::ResponseTooLarge(MAX_RESPONSE_BYTES));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok((status, bytes))
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        resp: Response,
    ) -> Result<T, CloudError> {
        let (status, bytes) = Self::read_capped(resp).await?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CloudError::Auth {
                status: status.as_u16(),
                body: trimmed_body(&bytes),
            });
        }
        if !status.is_success() {
            return Err(CloudError::Transient {
                status: status.as_u16(),
                body: trimmed_body(&bytes),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, CloudError> {
        let url = self.base_url.join("/api/v1/connectors/register")?;
        let resp = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .json(req)
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    pub async fn heartbeat(&self, payload: &HeartbeatPayload) -> Result<(), CloudError> {
        let id = self.require_connector_id()?;
        let url = self
            .base_url
            .join(&format!("/api/v1/connectors/{}/heartbeat", id))?;
        let resp = self.auth_headers(self.http.post(url)).json(payload).send().await?;
        let (status, bytes) = Self::read_capped(resp).await?;
        classify_status(status, &bytes)
    }

    pub async fn get_commands(&self, limit: u32) -> Result<Vec<CloudCommand>, CloudError> {
        let id = self.require_connector_id()?;
        let url = self.base_url.join(&format!(
            "/api/v1/connectors/{}/commands?limit={}",
            id, limit
        ))?;
        let resp = self.auth_headers(self.http.get(url)).send().await?;
        Self::handle_response(resp).await
    }

    /// Fire-and-forget: the caller logs and swallows any error, since an
    /// unacknowledged command is simply re-offered on the next poll.
    pub async fn complete_command(
        &self,
        command_id: &PermissiveId,
        req: &CompleteCommandRequest,
    ) -> Result<(), CloudError> {
        let url = self
            .base_url
            .join(&format!("/api/v1/commands/{}/complete", command_id))?;
        let resp = self.auth_headers(self.http.post(url)).json(req).send().await?;
        let (status, bytes) = Self::read_capped(resp).await?;
        classify_status(status, &bytes)
    }

    pub async fn push_snapshots(
        &self,
        batch: &SnapshotBatch,
    ) -> Result<SnapshotBatchResponse, CloudError> {
        let url = self.base_url.join("/api/v1/snapshots/batch")?;
        let resp = self.auth_headers(self.http.post(url)).json(batch).send().await?;
        Self::handle_response(resp).await
    }

    /// Uploads a backup archive to an opaque presigned URL. No connector
    /// auth headers are sent — the URL itself is the capability.
    pub async fn upload_backup(
        &self,
        presigned_url: &str,
        local_path: &std::path::Path,
    ) -> Result<(), CloudError> {
        let file = tokio::fs::File::open(local_path).await.map_err(|e| {
            CloudError::Other(format!("failed to open staged backup: {}", e))
        })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| CloudError::Other(format!("failed to stat staged backup: {}", e)))?
            .len();
        let stream = tokio_util::io::ReaderStream::new(file);
        let resp = self
            .http
            .put(presigned_url)
            .header("Content-Type", "application/gzip")
            .header("Content-Length", len)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        let (status, body) = Self::read_capped(resp).await?;
        classify_status(status, &body)
    }

    fn require_connector_id(&self) -> Result<&PermissiveId, CloudError> {
        self.connector_id
            .as_ref()
            .ok_or_else(|| CloudError::Other("connector_id not set; pairing has not completed".to_string()))
    }
}

fn classify_status(status: StatusCode, body: &[u8]) -> Result<(), CloudError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CloudError::Auth {
            status: status.as_u16(),
            body: trimmed_body(body),
        });
    }
    if !status.is_success() {
        return Err(CloudError::Transient {
            status: status.as_u16(),
            body: trimmed_body(body),
        });
    }
    Ok(())
}

fn trimmed_body(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars().take(512).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn register_parses_positional_printer_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/connectors/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connector": {"id": 7},
                "credentials": {"secret": "S"},
                "printers": [{"id": 42, "name": "K1"}],
                "polling": {"commands_seconds": 5, "snapshots_seconds": 45}
            })))
            .mount(&server)
            .await;

        let client = CloudClient::new(&server.uri()).unwrap();
        let req = RegisterRequest {
            pairing_token: "PT".to_string(),
            site_name: "".to_string(),
            printers: vec![RegisterPrinter {
                name: "K1".to_string(),
            }],
        };
        let resp = client.register(&req).await.unwrap();
        assert_eq!(resp.connector.id.0, "7");
        assert_eq!(resp.printers[0].id.0, "42");
        assert_eq!(resp.polling.unwrap().commands_seconds, Some(5));
    }

    #[tokio::test]
    async fn register_rejects_bad_token_as_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/connectors/register"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let client = CloudClient::new(&server.uri()).unwrap();
        let req = RegisterRequest {
            pairing_token: "BAD".to_string(),
            site_name: "".to_string(),
            printers: vec![],
        };
        let err = client.register(&req).await.unwrap_err();
        assert!(matches!(err, CloudError::Auth { status: 401, .. }));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/connectors/register"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = CloudClient::new(&server.uri()).unwrap();
        let req = RegisterRequest {
            pairing_token: "PT".to_string(),
            site_name: "".to_string(),
            printers: vec![],
        };
        let err = client.register(&req).await.unwrap_err();
        assert!(err.is_transient());
    }
}
