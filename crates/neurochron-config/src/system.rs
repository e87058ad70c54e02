//! System configuration parsing.
//!
//! Configuration lives in a KDL file (`neurochron.kdl` by default):
//!
//! ```kdl
//! server {
//!     bind "0.0.0.0:8080"
//!     log-format "json"
//! }
//! dispatcher {
//!     workers 2
//!     lease-ttl-secs 300
//! }
//! preprocessor {
//!     image "freesurfer/freesurfer:7.4.1"
//!     license "/opt/freesurfer/license.txt"
//!     timeout-secs 43200
//! }
//! retry {
//!     preprocess max-retries=1 base-delay-ms=60000
//! }
//! ```
//!
//! Every field has a default. `DATABASE_URL` and `SENDGRID_API_KEY` from the
//! environment take precedence over file values.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "neurochron.kdl";

/// System-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub storage: StorageConfig,
    pub converter: ConverterConfig,
    pub preprocessor: PreprocessorConfig,
    pub predictor: PredictorConfig,
    pub notifier: NotifierConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// When unset the server runs on the in-process store.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Concurrent worker slots.
    pub workers: usize,
    pub lease_ttl: Duration,
    /// Idle wait between claim attempts when no submission wakes the pool.
    pub poll_interval: Duration,
    pub instance_id: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            lease_ttl: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub work_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/data/neurochron"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    pub command: String,
    pub args: Vec<String>,
    pub min_output_bytes: u64,
    /// The conversion process is killed after this long.
    pub timeout: Duration,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            command: "dcm2niix".to_string(),
            args: ["-z", "n", "-f", "${job_id}", "-o", "${output_dir}", "${input}"]
                .map(String::from)
                .to_vec(),
            min_output_bytes: 100 * 1024,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    pub image: String,
    pub license: PathBuf,
    pub subjects_dir: PathBuf,
    pub command: Vec<String>,
    pub timeout: Duration,
    /// Timeouts allowed before the stage fails outright.
    pub timeout_retries: u32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            image: "freesurfer/freesurfer:7.4.1".to_string(),
            license: PathBuf::from("/opt/freesurfer/license.txt"),
            subjects_dir: PathBuf::from("/data/neurochron/subjects"),
            command: ["recon-all", "-i", "${input}", "-s", "${subject}", "-all"]
                .map(String::from)
                .to_vec(),
            timeout: Duration::from_secs(12 * 60 * 60),
            timeout_retries: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            command: "neurochron-predict".to_string(),
            args: vec!["${output_dir}".to_string()],
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierBackend {
    #[default]
    Log,
    SendGrid,
}

impl std::str::FromStr for NotifierBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "log" => Ok(NotifierBackend::Log),
            "sendgrid" => Ok(NotifierBackend::SendGrid),
            other => Err(ConfigError::invalid(
                "notifier backend",
                format!("unknown backend '{other}' (expected log or sendgrid)"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub backend: NotifierBackend,
    pub from: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub api_key: Option<String>,
    pub endpoint: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            backend: NotifierBackend::Log,
            from: "noreply@neurochron.local".to_string(),
            from_name: "NeuroChron".to_string(),
            reply_to: None,
            api_key: None,
            endpoint: "https://api.sendgrid.com/v3/mail/send".to_string(),
        }
    }
}

/// Retry budget and backoff bounds for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl StageRetryConfig {
    pub const fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub convert: StageRetryConfig,
    pub preprocess: StageRetryConfig,
    pub predict: StageRetryConfig,
    pub notify: StageRetryConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            convert: StageRetryConfig::new(3, Duration::from_secs(1), Duration::from_secs(30)),
            preprocess: StageRetryConfig::new(1, Duration::from_secs(60), Duration::from_secs(600)),
            predict: StageRetryConfig::new(3, Duration::from_secs(2), Duration::from_secs(60)),
            notify: StageRetryConfig::new(2, Duration::from_secs(5), Duration::from_secs(60)),
        }
    }
}

impl SystemConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist, then apply environment overrides and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            parse_system_config(&text)?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            SystemConfig::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `DATABASE_URL` and `SENDGRID_API_KEY` overrides.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database.url = Some(url);
        }
        if let Some(key) = lookup("SENDGRID_API_KEY").filter(|v| !v.is_empty()) {
            self.notifier.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.dispatcher.workers == 0 {
            return Err(ConfigError::invalid("dispatcher workers", "must be at least 1"));
        }
        if self.dispatcher.lease_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "dispatcher lease-ttl-secs",
                "must be greater than zero",
            ));
        }
        if self.preprocessor.image.trim().is_empty() {
            return Err(ConfigError::invalid("preprocessor image", "must not be empty"));
        }
        if self.preprocessor.command.is_empty() {
            return Err(ConfigError::invalid("preprocessor command", "must not be empty"));
        }
        if self.converter.command.trim().is_empty() {
            return Err(ConfigError::invalid("converter command", "must not be empty"));
        }
        if self.predictor.command.trim().is_empty() {
            return Err(ConfigError::invalid("predictor command", "must not be empty"));
        }
        if self.notifier.backend == NotifierBackend::SendGrid && self.notifier.api_key.is_none() {
            return Err(ConfigError::MissingField(
                "notifier api-key (or SENDGRID_API_KEY)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse system configuration from KDL text. Unknown nodes are ignored.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        let Some(children) = node.children() else {
            continue;
        };
        match node.name().value() {
            "server" => parse_server(children, &mut config.server)?,
            "database" => parse_database(children, &mut config.database)?,
            "dispatcher" => parse_dispatcher(children, &mut config.dispatcher)?,
            "storage" => {
                if let Some(dir) = child_string(children, "work-dir") {
                    config.storage.work_dir = PathBuf::from(dir);
                }
            }
            "converter" => parse_converter(children, &mut config.converter)?,
            "preprocessor" => parse_preprocessor(children, &mut config.preprocessor)?,
            "predictor" => parse_predictor(children, &mut config.predictor)?,
            "notifier" => parse_notifier(children, &mut config.notifier)?,
            "retry" => parse_retry(children, &mut config.retry)?,
            _ => {}
        }
    }

    Ok(config)
}

fn parse_server(doc: &KdlDocument, server: &mut ServerConfig) -> ConfigResult<()> {
    if let Some(bind) = child_string(doc, "bind") {
        server.bind = bind;
    }
    if let Some(format) = child_string(doc, "log-format") {
        server.log_format = match format.as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::invalid(
                    "server log-format",
                    format!("unknown format '{other}' (expected text or json)"),
                ));
            }
        };
    }
    Ok(())
}

fn parse_database(doc: &KdlDocument, database: &mut DatabaseConfig) -> ConfigResult<()> {
    if let Some(url) = child_string(doc, "url") {
        database.url = Some(url);
    }
    if let Some(max) = child_u64(doc, "max-connections")? {
        database.max_connections = narrow(max, "database max-connections")?;
    }
    Ok(())
}

fn parse_dispatcher(doc: &KdlDocument, dispatcher: &mut DispatcherConfig) -> ConfigResult<()> {
    if let Some(workers) = child_u64(doc, "workers")? {
        dispatcher.workers = narrow(workers, "dispatcher workers")?;
    }
    if let Some(secs) = child_u64(doc, "lease-ttl-secs")? {
        dispatcher.lease_ttl = Duration::from_secs(secs);
    }
    if let Some(ms) = child_u64(doc, "poll-interval-ms")? {
        dispatcher.poll_interval = Duration::from_millis(ms);
    }
    if let Some(id) = child_string(doc, "instance-id") {
        dispatcher.instance_id = Some(id);
    }
    Ok(())
}

fn parse_converter(doc: &KdlDocument, converter: &mut ConverterConfig) -> ConfigResult<()> {
    if let Some(command) = child_string(doc, "command") {
        converter.command = command;
    }
    if let Some(args) = child_args(doc, "args") {
        converter.args = args;
    }
    if let Some(bytes) = child_u64(doc, "min-output-bytes")? {
        converter.min_output_bytes = bytes;
    }
    if let Some(secs) = child_u64(doc, "timeout-secs")? {
        converter.timeout = Duration::from_secs(secs);
    }
    Ok(())
}

fn parse_preprocessor(doc: &KdlDocument, pre: &mut PreprocessorConfig) -> ConfigResult<()> {
    if let Some(image) = child_string(doc, "image") {
        pre.image = image;
    }
    if let Some(license) = child_string(doc, "license") {
        pre.license = PathBuf::from(license);
    }
    if let Some(dir) = child_string(doc, "subjects-dir") {
        pre.subjects_dir = PathBuf::from(dir);
    }
    if let Some(command) = child_args(doc, "command") {
        pre.command = command;
    }
    if let Some(secs) = child_u64(doc, "timeout-secs")? {
        pre.timeout = Duration::from_secs(secs);
    }
    if let Some(retries) = child_u64(doc, "timeout-retries")? {
        pre.timeout_retries = narrow(retries, "preprocessor timeout-retries")?;
    }
    Ok(())
}

fn parse_predictor(doc: &KdlDocument, predictor: &mut PredictorConfig) -> ConfigResult<()> {
    if let Some(command) = child_string(doc, "command") {
        predictor.command = command;
    }
    if let Some(args) = child_args(doc, "args") {
        predictor.args = args;
    }
    if let Some(secs) = child_u64(doc, "timeout-secs")? {
        predictor.timeout = Duration::from_secs(secs);
    }
    Ok(())
}

fn parse_notifier(doc: &KdlDocument, notifier: &mut NotifierConfig) -> ConfigResult<()> {
    if let Some(backend) = child_string(doc, "backend") {
        notifier.backend = backend.parse()?;
    }
    if let Some(from) = child_string(doc, "from") {
        notifier.from = from;
    }
    if let Some(name) = child_string(doc, "from-name") {
        notifier.from_name = name;
    }
    if let Some(reply_to) = child_string(doc, "reply-to") {
        notifier.reply_to = Some(reply_to);
    }
    if let Some(key) = child_string(doc, "api-key") {
        notifier.api_key = Some(key);
    }
    if let Some(endpoint) = child_string(doc, "endpoint") {
        notifier.endpoint = endpoint;
    }
    Ok(())
}

fn parse_retry(doc: &KdlDocument, retry: &mut RetryConfig) -> ConfigResult<()> {
    for node in doc.nodes() {
        let stage = match node.name().value() {
            "convert" => &mut retry.convert,
            "preprocess" => &mut retry.preprocess,
            "predict" => &mut retry.predict,
            "notify" => &mut retry.notify,
            other => {
                return Err(ConfigError::invalid(
                    "retry",
                    format!("unknown stage '{other}'"),
                ));
            }
        };
        if let Some(max) = get_u64_prop(node, "max-retries")? {
            stage.max_retries = narrow(max, "retry max-retries")?;
        }
        if let Some(ms) = get_u64_prop(node, "base-delay-ms")? {
            stage.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = get_u64_prop(node, "max-delay-ms")? {
            stage.max_delay = Duration::from_millis(ms);
        }
        if stage.base_delay > stage.max_delay {
            return Err(ConfigError::invalid(
                "retry",
                format!("{} base-delay-ms exceeds max-delay-ms", node.name().value()),
            ));
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn child<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlNode> {
    doc.nodes().iter().find(|n| n.name().value() == name)
}

fn child_string(doc: &KdlDocument, name: &str) -> Option<String> {
    child(doc, name).and_then(get_first_string_arg)
}

fn child_args(doc: &KdlDocument, name: &str) -> Option<Vec<String>> {
    child(doc, name).map(get_all_string_args)
}

fn child_u64(doc: &KdlDocument, name: &str) -> ConfigResult<Option<u64>> {
    let Some(node) = child(doc, name) else {
        return Ok(None);
    };
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(name.to_string()))?
        .value();
    let int = value
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(name, format!("expected an integer, got {value:?}")))?;
    u64::try_from(int)
        .map(Some)
        .map_err(|_| ConfigError::invalid(name, "must not be negative"))
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => {
            let int = value.as_integer().ok_or_else(|| {
                ConfigError::invalid(name, format!("expected an integer, got {value:?}"))
            })?;
            u64::try_from(int)
                .map(Some)
                .map_err(|_| ConfigError::invalid(name, "must not be negative"))
        }
    }
}

fn narrow<T: TryFrom<u64>>(value: u64, field: &str) -> ConfigResult<T> {
    T::try_from(value).map_err(|_| ConfigError::invalid(field, "value out of range"))
}
