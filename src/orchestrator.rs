//! Ties the config store, cloud client, and per-printer controller clients
//! together: pairing, and the three peer loops that run for the life of the
//! process (or, in one-shot mode, exactly once).

use crate::backoff::Backoff;
use crate::cloud::{
    CloudClient, HeartbeatPayload, PrinterReachability, RegisterPrinter, RegisterRequest,
    SnapshotBatch, SnapshotPayload,
};
use crate::config::Config;
use crate::controller::ControllerClient;
use crate::error::CloudError;
use crate::executor::{command_fetch_limit, CommandExecutor};
use crate::util::PermissiveId;
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct Orchestrator {
    config: Config,
    cloud: CloudClient,
    controllers: HashMap<String, ControllerClient>,
    start: Instant,
    agent_version: String,
}

impl Orchestrator {
    /// Loads and validates the config, runs pairing synchronously if a
    /// pairing_token is present, and builds one controller client per
    /// binding. Returns a ready-to-run orchestrator.
    pub async fn bootstrap(config_path: &Path) -> Result<Self> {
        let mut config = Config::load(config_path).context("loading config")?;
        config.validate().context("validating config")?;

        let mut cloud = CloudClient::new(
            config
                .cloud_url
                .as_deref()
                .ok_or_else(|| anyhow!("cloud_url missing after validation"))?,
        )?;

        if config.pairing_token.is_some() {
            pair(&mut config, &mut cloud, config_path).await?;
        } else {
            let id = config
                .connector_id
                .clone()
                .ok_or_else(|| anyhow!("connector_id missing after validation"))?;
            let secret = config
                .connector_secret
                .clone()
                .ok_or_else(|| anyhow!("connector_secret missing after validation"))?;
            cloud.set_credentials(id, secret);
        }

        let controllers = build_controllers(&config)?;

        Ok(Orchestrator {
            config,
            cloud,
            controllers,
            start: Instant::now(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Runs the heartbeat, command-dispatch, and snapshot loops as peers
    /// until `token` is cancelled, or until one of them hits a fatal error.
    /// A fatal error in any loop cancels the token so the other two stop
    /// promptly, and is propagated to the caller so `main` can exit 1.
    pub async fn run_continuous(self, token: CancellationToken) -> Result<()> {
        let me = Arc::new(self);
        let (heartbeat, commands, snapshots) = tokio::join!(
            heartbeat_loop(me.clone(), token.clone()),
            command_loop(me.clone(), token.clone()),
            snapshot_loop(me.clone(), token.clone()),
        );
        heartbeat.and(commands).and(snapshots)
    }

    /// Runs exactly one iteration of each loop in sequence. Returns `true`
    /// if at least one iteration succeeded, `false` if all three failed.
    pub async fn run_once(&self) -> bool {
        let connector_id = self.connector_id_str();

        let started = Instant::now();
        let heartbeat = self.heartbeat_iteration().await;
        if let Err(e) = &heartbeat {
            log::warn!(
                "connector_id={} duration_ms={} one-shot heartbeat failed: {}",
                connector_id,
                started.elapsed().as_millis(),
                e
            );
        }

        let started = Instant::now();
        let commands = self.commands_iteration().await;
        if let Err(e) = &commands {
            log::warn!(
                "connector_id={} duration_ms={} one-shot command poll failed: {}",
                connector_id,
                started.elapsed().as_millis(),
                e
            );
        }

        let started = Instant::now();
        let snapshots = self.snapshots_iteration().await;
        if let Err(e) = &snapshots {
            log::warn!(
                "connector_id={} duration_ms={} one-shot snapshot push failed: {}",
                connector_id,
                started.elapsed().as_millis(),
                e
            );
        }

        heartbeat.is_ok() || commands.is_ok() || snapshots.is_ok()
    }

    async fn heartbeat_iteration(&self) -> Result<(), CloudError> {
        let mut printers = Vec::with_capacity(self.controllers.len());
        for (id, controller) in &self.controllers {
            let reachable = controller.query_objects().await.is_ok();
            printers.push(PrinterReachability {
                printer_id: PermissiveId(id.clone()),
                reachable,
            });
        }
        let payload = HeartbeatPayload {
            uptime_seconds: self.start.elapsed().as_secs(),
            agent_version: self.agent_version.clone(),
            printers,
        };
        self.cloud.heartbeat(&payload).await
    }

    async fn commands_iteration(&self) -> Result<(), CloudError> {
        let commands = self.cloud.get_commands(command_fetch_limit()).await?;
        let executor = CommandExecutor {
            controllers: &self.controllers,
            cloud: &self.cloud,
            state_dir: &self.config.state_dir,
            default_data_root: default_printer_data_root(),
            agent_version: &self.agent_version,
            connector_id: self.connector_id_str(),
        };
        // Strictly sequential, in cloud-issued order: no intra-batch
        // parallelism.
        for command in commands {
            executor.dispatch(&command).await;
        }
        Ok(())
    }

    /// Pushes one snapshot per reachable binding. A binding whose query
    /// fails is skipped and logged, not fatal to the batch.
    async fn snapshots_iteration(&self) -> Result<(), CloudError> {
        let mut snapshots = Vec::with_capacity(self.controllers.len());
        for (id, controller) in &self.controllers {
            let started = Instant::now();
            match controller.query_objects().await {
                Ok(payload) => snapshots.push(SnapshotPayload {
                    printer_id: PermissiveId(id.clone()),
                    captured_at: chrono::Utc::now(),
                    payload,
                }),
                Err(e) => log::warn!(
                    "connector_id={} printer_id={} duration_ms={} snapshot query failed: {}",
                    self.connector_id_str(),
                    id,
                    started.elapsed().as_millis(),
                    e
                ),
            }
        }
        if snapshots.is_empty() {
            return Ok(());
        }
        self.cloud.push_snapshots(&SnapshotBatch { snapshots }).await?;
        Ok(())
    }

    /// Textual connector id for log lines; "unknown" before pairing has
    /// populated credentials (bootstrap always runs pairing first, so this
    /// only applies to not-yet-paired error paths).
    fn connector_id_str(&self) -> &str {
        self.config
            .connector_id
            .as_ref()
            .map(|id| id.0.as_str())
            .unwrap_or("unknown")
    }
}

/// Registers with the cloud using the configured pairing_token, then
/// atomically rewrites the config with the returned credentials, cadence
/// overrides, and positionally-matched printer_ids.
async fn pair(config: &mut Config, cloud: &mut CloudClient, config_path: &Path) -> Result<()> {
    let token = config
        .pairing_token
        .clone()
        .ok_or_else(|| anyhow!("pair() called without a pairing_token"))?;

    let request = RegisterRequest {
        pairing_token: token,
        site_name: config.site_name.clone(),
        printers: config
            .moonraker
            .iter()
            .map(|b| RegisterPrinter { name: b.name.clone() })
            .collect(),
    };

    let response = cloud.register(&request).await.context("pairing with cloud")?;

    config.pairing_token = None;
    config.connector_id = Some(response.connector.id.clone());
    config.connector_secret = Some(response.credentials.secret.clone());
    if let Some(polling) = &response.polling {
        if let Some(v) = polling.commands_seconds {
            config.poll_commands_seconds = v;
        }
        if let Some(v) = polling.snapshots_seconds {
            config.push_snapshots_seconds = v;
        }
    }
    for (index, binding) in config.moonraker.iter_mut().enumerate() {
        if let Some(registered) = response.printers.get(index) {
            binding.printer_id = Some(registered.id.clone());
        }
    }

    config
        .save_atomic(config_path)
        .context("saving config after pairing")?;

    cloud.set_credentials(
        config.connector_id.clone().expect("just set"),
        config.connector_secret.clone().expect("just set"),
    );

    log::info!(
        "connector_id={} paired, connector_secret={}",
        config.connector_id.as_ref().expect("just set"),
        crate::util::redacted(),
    );

    Ok(())
}

fn build_controllers(config: &Config) -> Result<HashMap<String, ControllerClient>> {
    let mut map = HashMap::with_capacity(config.moonraker.len());
    for binding in &config.moonraker {
        let printer_id = binding
            .printer_id
            .as_ref()
            .ok_or_else(|| anyhow!("printer {:?} is missing a printer_id", binding.name))?;
        let client = ControllerClient::new(&binding.base_url, binding.ui_port)
            .with_context(|| format!("building controller client for printer {:?}", binding.name))?;
        map.insert(printer_id.0.clone(), client);
    }
    Ok(map)
}

fn default_printer_data_root() -> std::path::PathBuf {
    dirs_home().join("printer_data")
}

fn dirs_home() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("/home/pi"))
}

async fn heartbeat_loop(orchestrator: Arc<Orchestrator>, token: CancellationToken) -> Result<()> {
    let period = Duration::from_secs(orchestrator.config.heartbeat_seconds.max(1));
    let connector_id = orchestrator.connector_id_str().to_string();
    run_peer_loop("heartbeat", &connector_id, period, token, || {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.heartbeat_iteration().await.map_err(anyhow::Error::from) }
    })
    .await
}

async fn command_loop(orchestrator: Arc<Orchestrator>, token: CancellationToken) -> Result<()> {
    let period = Duration::from_secs(orchestrator.config.poll_commands_seconds.max(1));
    let connector_id = orchestrator.connector_id_str().to_string();
    run_peer_loop("commands", &connector_id, period, token, || {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.commands_iteration().await.map_err(anyhow::Error::from) }
    })
    .await
}

async fn snapshot_loop(orchestrator: Arc<Orchestrator>, token: CancellationToken) -> Result<()> {
    let period = Duration::from_secs(orchestrator.config.push_snapshots_seconds.max(1));
    let connector_id = orchestrator.connector_id_str().to_string();
    run_peer_loop("snapshots", &connector_id, period, token, || {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.snapshots_iteration().await.map_err(anyhow::Error::from) }
    })
    .await
}

/// Shared loop shape: wait for the ticker (or cancellation), run one
/// iteration, and either reset backoff on success or sleep the next
/// backoff interval on failure. Most iteration errors are transient and
/// only cost a backoff sleep; an error that downcasts to a fatal
/// `CloudError` (§7: a response/URL shape a retry will never fix, as
/// opposed to a 5xx, timeout, or repeated 401/403) cancels `token` — so the
/// other peer loops stop too — and is propagated to the caller.
async fn run_peer_loop<F, Fut>(
    name: &str,
    connector_id: &str,
    period: Duration,
    token: CancellationToken,
    mut iteration: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut backoff = Backoff::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let started = Instant::now();
        match iteration().await {
            Ok(()) => backoff.reset(),
            Err(e) => {
                let duration_ms = started.elapsed().as_millis();
                if is_fatal(&e) {
                    log::error!(
                        "connector_id={} loop={} duration_ms={} fatal error, shutting down: {}",
                        connector_id,
                        name,
                        duration_ms,
                        e
                    );
                    token.cancel();
                    return Err(e);
                }
                log::warn!(
                    "connector_id={} loop={} duration_ms={} iteration failed: {}",
                    connector_id,
                    name,
                    duration_ms,
                    e
                );
                if !backoff.sleep_cancellable(&token).await {
                    return Ok(());
                }
            }
        }
    }
}

/// True when `e` carries a `CloudError` that `CloudError::is_fatal` flags as
/// unrecoverable. Iteration futures box their error as `anyhow::Error` so
/// the loop body stays transport-agnostic; downcasting recovers the typed
/// classification at the one place that needs it.
fn is_fatal(e: &anyhow::Error) -> bool {
    e.downcast_ref::<CloudError>()
        .map(CloudError::is_fatal)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrinterBinding;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn binding(name: &str, base_url: &str) -> PrinterBinding {
        PrinterBinding {
            printer_id: None,
            name: name.to_string(),
            base_url: base_url.to_string(),
            ui_port: None,
        }
    }

    #[tokio::test]
    async fn pairing_clears_token_sets_credentials_and_matches_printer_ids_positionally() {
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

        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let mut config = Config {
            cloud_url: Some(server.uri()),
            pairing_token: Some("PT".to_string()),
            moonraker: vec![binding("K1", "http://127.0.0.1:7125")],
            ..Config::default()
        };
        let mut cloud = CloudClient::new(&server.uri()).unwrap();

        pair(&mut config, &mut cloud, &config_path).await.unwrap();

        assert!(config.pairing_token.is_none());
        assert_eq!(config.connector_id.as_ref().unwrap().0, "7");
        assert_eq!(config.connector_secret.as_deref(), Some("S"));
        assert_eq!(config.poll_commands_seconds, 5);
        assert_eq!(config.push_snapshots_seconds, 45);
        assert_eq!(config.moonraker[0].printer_id.as_ref().unwrap().0, "42");

        let reloaded = Config::load(&config_path).unwrap();
        assert_eq!(reloaded, config);
        reloaded.validate().unwrap();
    }

    #[tokio::test]
    async fn snapshot_loop_pushes_only_the_reachable_binding() {
        let good_controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/printer/objects/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": {}})))
            .mount(&good_controller)
            .await;
        let bad_controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/printer/objects/query"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad_controller)
            .await;

        let cloud_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/snapshots/batch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"inserted": 1})))
            .mount(&cloud_server)
            .await;

        let mut cloud = CloudClient::new(&cloud_server.uri()).unwrap();
        cloud.set_credentials(PermissiveId("7".to_string()), "S".to_string());

        let mut controllers = HashMap::new();
        controllers.insert(
            "1".to_string(),
            ControllerClient::new(&good_controller.uri(), None).unwrap(),
        );
        controllers.insert(
            "2".to_string(),
            ControllerClient::new(&bad_controller.uri(), None).unwrap(),
        );

        let orchestrator = Orchestrator {
            config: Config {
                cloud_url: Some(cloud_server.uri()),
                connector_id: Some(PermissiveId("7".to_string())),
                connector_secret: Some("S".to_string()),
                ..Config::default()
            },
            cloud,
            controllers,
            start: Instant::now(),
            agent_version: "test".to_string(),
        };

        orchestrator.snapshots_iteration().await.unwrap();

        // The mock asserts exactly one matching request via its expectation
        // defaults; a second snapshots/batch call (for the failing binding)
        // would not happen since snapshots_iteration skips failed queries,
        // verified structurally: only one binding's query_objects succeeds.
        let requests = cloud_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn one_shot_reports_partial_success_as_ok() {
        let cloud_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/connectors/7/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&cloud_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/connectors/7/commands"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&cloud_server)
            .await;
        // No /api/v1/snapshots/batch mock: with no controllers configured,
        // snapshots_iteration short-circuits to Ok(()) before ever calling
        // the cloud, so heartbeat succeeding alone is enough for a true result.

        let mut cloud = CloudClient::new(&cloud_server.uri()).unwrap();
        cloud.set_credentials(PermissiveId("7".to_string()), "S".to_string());

        let orchestrator = Orchestrator {
            config: Config {
                cloud_url: Some(cloud_server.uri()),
                connector_id: Some(PermissiveId("7".to_string())),
                connector_secret: Some("S".to_string()),
                ..Config::default()
            },
            cloud,
            controllers: HashMap::new(),
            start: Instant::now(),
            agent_version: "test".to_string(),
        };

        assert!(orchestrator.run_once().await);
    }
}
