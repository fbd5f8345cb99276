use std::path::PathBuf;

/// Errors surfaced while loading, validating, or rewriting the on-disk config.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadIO {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    WriteIO {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cloud_url must start with http:// or https:// (got {url:?})")]
    InvalidCloudUrl { url: String },

    #[error("printer {printer_id:?} base_url must start with http:// or https:// (got {url:?})")]
    InvalidPrinterUrl { printer_id: String, url: String },

    #[error("printer base_url must not contain path traversal segments (got {url:?})")]
    PathTraversal { url: String },

    #[error("duplicate printer_id {printer_id:?} in moonraker bindings")]
    DuplicatePrinterId { printer_id: String },

    #[error("config must have exactly one of pairing_token or (connector_id, connector_secret), found {detail}")]
    InconsistentCredentials { detail: &'static str },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from calls to the cloud control plane.
#[derive(thiserror::Error, Debug)]
pub enum CloudError {
    #[error("cloud rejected credentials (status {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("transient cloud failure (status {status}): {body}")]
    Transient { status: u16, body: String },

    #[error("cloud request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cloud response was not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("cloud response body exceeded the {0} byte cap")]
    ResponseTooLarge(usize),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    Other(String),
}

impl CloudError {
    /// True when this failure should be treated as transient (worth a backoff
    /// retry) rather than fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::Transient { .. } | CloudError::Request(_) | CloudError::ResponseTooLarge(_)
        )
    }

    /// True when a peer loop should give up and let the process exit rather
    /// than keep backing off. `Auth` is deliberately excluded: repeated
    /// 401/403s are retried forever, since the agent does not self-disable
    /// on sustained auth failure. `Decode`/`Url`/`Other` indicate a response
    /// shape or URL construction problem that another retry will not fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CloudError::Decode(_) | CloudError::Url(_) | CloudError::Other(_)
        )
    }
}

/// Errors from calls to the local Moonraker controller.
#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("controller request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("controller returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("controller response was not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("controller response body exceeded the {0} byte cap")]
    ResponseTooLarge(usize),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("no snapshot image candidate returned a successful response")]
    NoSnapshotCandidate,

    #[error("{0}")]
    Other(String),
}

/// Errors from streaming a backup archive.
#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("archive entry escapes declared root: {path}")]
    PathEscape { path: PathBuf },

    #[error("archive exceeded the configured {limit} byte ceiling")]
    TooLarge { limit: u64 },

    #[error("{0}")]
    Other(String),
}
