//! Executes one cloud command against its target printer and reports the
//! outcome back to the cloud, including a best-effort follow-up snapshot.

use crate::backup::{build_backup, expand_home, IncludeFlags};
use crate::cloud::{
    CloudClient, CommandStatus, CompleteCommandRequest, SnapshotBatch, SnapshotPayload,
};
use crate::controller::ControllerClient;
use crate::util::PermissiveId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A command execution failure, carrying whatever partial result fields had
/// already been accumulated before the failure occurred.
#[derive(Debug)]
struct ExecError {
    message: String,
    partial_result: Option<Value>,
}

impl ExecError {
    fn new(message: impl Into<String>) -> Self {
        ExecError {
            message: message.into(),
            partial_result: None,
        }
    }

    fn with_result(message: impl Into<String>, partial_result: Value) -> Self {
        ExecError {
            message: message.into(),
            partial_result: Some(partial_result),
        }
    }
}

impl<E: std::error::Error> From<E> for ExecError {
    fn from(e: E) -> Self {
        ExecError::new(e.to_string())
    }
}

/// Byte ceiling applied to any archive this agent builds; a printer data
/// directory larger than this aborts the backup rather than risk filling
/// the staging disk.
const BACKUP_BYTE_CEILING: u64 = 2 * 1024 * 1024 * 1024;
const COMMAND_FETCH_LIMIT: u32 = 20;

pub fn command_fetch_limit() -> u32 {
    COMMAND_FETCH_LIMIT
}

pub struct CommandExecutor<'a> {
    pub controllers: &'a HashMap<String, ControllerClient>,
    pub cloud: &'a CloudClient,
    pub state_dir: &'a Path,
    pub default_data_root: PathBuf,
    pub agent_version: &'a str,
    pub connector_id: &'a str,
}

impl<'a> CommandExecutor<'a> {
    /// Runs one command end-to-end: dispatch, best-effort follow-up
    /// snapshot, and cloud completion report. Errors reporting completion
    /// are logged, not propagated — the command loop always advances.
    pub async fn dispatch(&self, cmd: &crate::cloud::CloudCommand) {
        let started = std::time::Instant::now();
        let outcome = self.execute(cmd).await;
        let duration_ms = started.elapsed().as_millis();
        let request = match outcome {
            Ok(result) => CompleteCommandRequest {
                status: CommandStatus::Succeeded,
                result: Some(result),
                error_message: None,
            },
            Err(err) => {
                log::warn!(
                    "connector_id={} command_id={} printer_id={} action={} duration_ms={} failed: {}",
                    self.connector_id,
                    cmd.id,
                    cmd.printer_id,
                    cmd.action,
                    duration_ms,
                    err.message
                );
                CompleteCommandRequest {
                    status: CommandStatus::Failed,
                    result: err.partial_result,
                    error_message: Some(err.message),
                }
            }
        };

        if let Err(e) = self.cloud.complete_command(&cmd.id, &request).await {
            log::warn!(
                "connector_id={} command_id={} failed to report completion: {}",
                self.connector_id,
                cmd.id,
                e
            );
        }
    }

    async fn execute(&self, cmd: &crate::cloud::CloudCommand) -> Result<Value, ExecError> {
        let controller = self
            .controllers
            .get(cmd.printer_id.0.as_str())
            .ok_or_else(|| ExecError::new(format!("unknown printer_id {}", cmd.printer_id)))?;

        let mut result = match cmd.action.as_str() {
            "pause" => {
                controller
                    .pause()
                    .await
                    .map_err(|e| ExecError::with_result(e.to_string(), json!({"action": "pause"})))?;
                json!({"action": "pause"})
            }
            "resume" => {
                controller
                    .resume()
                    .await
                    .map_err(|e| ExecError::with_result(e.to_string(), json!({"action": "resume"})))?;
                json!({"action": "resume"})
            }
            "cancel" => {
                controller
                    .cancel()
                    .await
                    .map_err(|e| ExecError::with_result(e.to_string(), json!({"action": "cancel"})))?;
                json!({"action": "cancel"})
            }
            "start_print" => {
                let filename = required_str(&cmd.params, "filename")?;
                controller.start_print(filename).await.map_err(|e| {
                    ExecError::with_result(e.to_string(), json!({"action": "start_print", "filename": filename}))
                })?;
                json!({"action": "start_print", "filename": filename})
            }
            "upload_file" => {
                let filename = required_str(&cmd.params, "filename")?.to_string();
                let content = required_str(&cmd.params, "content")?;
                let bytes = base64::decode(content)
                    .map_err(|e| ExecError::new(format!("invalid base64 content: {}", e)))?;
                let size = bytes.len();
                controller.upload_file(&filename, bytes).await.map_err(|e| {
                    ExecError::with_result(
                        e.to_string(),
                        json!({"action": "upload_file", "filename": filename}),
                    )
                })?;
                json!({"action": "upload_file", "filename": filename, "size": size})
            }
            "delete_file" => {
                let filename = required_str(&cmd.params, "filename")?.to_string();
                controller.delete_file(&filename).await.map_err(|e| {
                    ExecError::with_result(
                        e.to_string(),
                        json!({"action": "delete_file", "filename": filename}),
                    )
                })?;
                json!({"action": "delete_file", "filename": filename})
            }
            "sync_files" => {
                let files = controller
                    .list_files()
                    .await
                    .map_err(|e| ExecError::with_result(e.to_string(), json!({"action": "sync_files"})))?;
                let count = files.len();
                let files_json: Vec<Value> = files
                    .into_iter()
                    .map(|f| json!({"path": f.path, "size": f.size}))
                    .collect();
                json!({"action": "sync_files", "files": files_json, "count": count})
            }
            "create_backup" => self.execute_create_backup(&cmd.printer_id, &cmd.params).await?,
            other => return Err(ExecError::new(format!("unknown action {}", other))),
        };

        self.attach_follow_up_snapshot(&cmd.printer_id, controller, &mut result)
            .await;

        Ok(result)
    }

    async fn attach_follow_up_snapshot(
        &self,
        printer_id: &PermissiveId,
        controller: &ControllerClient,
        result: &mut Value,
    ) {
        match controller.query_objects().await {
            Ok(payload) => {
                let batch = SnapshotBatch {
                    snapshots: vec![SnapshotPayload {
                        printer_id: printer_id.clone(),
                        captured_at: chrono::Utc::now(),
                        payload,
                    }],
                };
                match self.cloud.push_snapshots(&batch).await {
                    Ok(_) => {
                        result["post_snapshot"] = json!("captured");
                    }
                    Err(e) => {
                        result["post_snapshot_error"] = json!(e.to_string());
                    }
                }
            }
            Err(e) => {
                result["post_snapshot_error"] = json!(e.to_string());
            }
        }
    }

    async fn execute_create_backup(
        &self,
        printer_id: &PermissiveId,
        params: &Value,
    ) -> Result<Value, ExecError> {
        let backup_id = required_str(params, "backup_id")?.to_string();
        let presigned_url = required_str(params, "presigned_url")?.to_string();
        let root = params
            .get("printer_data_root")
            .and_then(Value::as_str)
            .map(expand_home)
            .unwrap_or_else(|| self.default_data_root.clone());
        let include = parse_include_flags(params.get("include"));

        let staged_path = self.state_dir.join(format!("backup-{}.tar.gz", backup_id));
        std::fs::create_dir_all(self.state_dir)?;
        std::fs::set_permissions(
            self.state_dir,
            std::fs::Permissions::from_mode(0o750),
        )?;

        let _ = printer_id; // retained for symmetry with other actions; backups are printer-scoped by data root, not by controller call

        let build_root = root.clone();
        let build_path = staged_path.clone();
        let build_outcome = tokio::task::spawn_blocking(move || {
            build_backup(&build_root, &include, &build_path, Some(BACKUP_BYTE_CEILING))
        })
        .await
        .map_err(|e| ExecError::new(format!("backup task panicked: {}", e)));

        let outcome = match build_outcome {
            Ok(Ok(backup)) => match self.cloud.upload_backup(&presigned_url, &staged_path).await {
                Ok(()) => Ok(json!({
                    "action": "create_backup",
                    "backup_id": backup_id.clone(),
                    "size_bytes": backup.size_bytes,
                    "sha256": backup.sha256,
                    "uploaded_at": chrono::Utc::now().to_rfc3339(),
                })),
                Err(e) => Err(ExecError::new(e.to_string())),
            },
            Ok(Err(e)) => Err(ExecError::new(e.to_string())),
            Err(e) => Err(e),
        };

        let _ = std::fs::remove_file(&staged_path);

        outcome.map_err(|mut e| {
            e.partial_result
                .get_or_insert_with(|| json!({"action": "create_backup", "backup_id": backup_id}));
            e
        })
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ExecError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ExecError::new(format!("missing required param {:?}", key)))
}

fn parse_include_flags(value: Option<&Value>) -> IncludeFlags {
    let get = |key: &str| value.and_then(|v| v.get(key)).and_then(Value::as_bool).unwrap_or(false);
    IncludeFlags {
        config: get("config"),
        database: get("database"),
        gcodes: get("gcodes"),
        logs: get("logs"),
    }
}
