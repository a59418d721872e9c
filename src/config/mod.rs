use std::fs;
use std::net::SocketAddr;
use std::{collections::HashMap, time::Duration};

use http::HeaderName;
use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{
    batch::TargetMap,
    core::{BatchError, BatchResult},
    worker::{WorkerPoolConfig, WorkerSettings},
};

/// Suffix of environment variables that add entries to the target map.
pub const HOST_ENV_SUFFIX: &str = "_BATCH_HOST";

static SERVICE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").unwrap());

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_roles"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    #[serde(default)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    #[serde(default)]
    pub batch: Batch,

    #[validate(custom(function = "Config::validate_hosts"))]
    #[serde(default)]
    pub hosts: HashMap<String, String>,

    #[validate(nested)]
    #[serde(default)]
    pub queue: Queue,
    #[validate(nested)]
    #[serde(default)]
    pub store: Store,
    #[validate(nested)]
    #[serde(default)]
    pub workers: Workers,

    pub log: Option<Log>,
    pub status: Option<Status>,
    pub prometheus: Option<Prometheus>,
    pub sentry: Option<Sentry>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    /// Configured hosts overlaid with `<NAME>_BATCH_HOST` variables from the
    /// process environment.
    pub fn target_map(&self) -> BatchResult<TargetMap> {
        self.target_map_with(std::env::vars())
    }

    pub fn target_map_with<I>(&self, vars: I) -> BatchResult<TargetMap>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut hosts = self.hosts.clone();
        for (key, value) in vars {
            let Some(name) = key.strip_suffix(HOST_ENV_SUFFIX) else {
                continue;
            };
            let name = name.to_ascii_lowercase();
            if let Err(e) = check_host(&name, &value) {
                return Err(BatchError::Configuration(format!(
                    "invalid host from environment {key}: {e}"
                )));
            }
            if let Some(previous) = hosts.insert(name.clone(), value.clone()) {
                debug!("Host {name} overridden from environment: {previous} -> {value}");
            } else {
                debug!("Host {name} added from environment: {value}");
            }
        }

        if hosts.is_empty() {
            warn!("No hosts configured, only absolute http(s) targets can be reached");
        }
        Ok(TargetMap::new(hosts))
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            count: self.workers.count,
            restart_backoff: Duration::from_millis(self.workers.restart_backoff),
            max_restarts: self.workers.max_restarts,
            shutdown_timeout: Duration::from_secs(self.workers.shutdown_timeout),
            worker: WorkerSettings {
                idle_timeout: Duration::from_millis(self.workers.idle_timeout),
                missing_record_retries: self.workers.missing_record_retries,
                consumer_group: self.queue.consumer_group.clone(),
                ..Default::default()
            },
        }
    }

    // The queue lives in process, so workers only ever see batches accepted
    // by this process's own listeners.
    fn validate_roles(&self) -> Result<(), ValidationError> {
        if self.listeners.is_empty() {
            let mut err = ValidationError::new("listener_required");
            err.message = Some(if self.workers.count > 0 {
                "worker-only mode needs a shared queue; the in-process queue requires a listener".into()
            } else {
                "at least one listener is required".into()
            });
            return Err(err);
        }
        Ok(())
    }

    fn validate_hosts(hosts: &HashMap<String, String>) -> Result<(), ValidationError> {
        for (name, url) in hosts {
            check_host(name, url)?;
        }
        Ok(())
    }
}

fn check_host(name: &str, url: &str) -> Result<(), ValidationError> {
    if !SERVICE_NAME.is_match(name) {
        let mut err = ValidationError::new("invalid_service_name");
        err.add_param("name".into(), &name.to_string());
        return Err(err);
    }
    let lower = url.to_ascii_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        let mut err = ValidationError::new("invalid_host_url");
        err.add_param("url".into(), &url.to_string());
        return Err(err);
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Batch {
    #[validate(range(min = 1))]
    #[serde(default = "Batch::default_max_requests")]
    pub max_requests: usize,
    #[validate(range(min = 1))]
    #[serde(default = "Batch::default_max_requests_async")]
    pub max_requests_async: usize,
    #[validate(custom(function = "Batch::validate_identity_header"))]
    #[serde(default = "Batch::default_identity_header")]
    pub identity_header: String,
    #[validate(range(min = 1))]
    #[serde(default = "Batch::default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Outbound request timeout in seconds.
    #[validate(range(min = 1))]
    #[serde(default = "Batch::default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            max_requests: Self::default_max_requests(),
            max_requests_async: Self::default_max_requests_async(),
            identity_header: Self::default_identity_header(),
            max_body_bytes: Self::default_max_body_bytes(),
            request_timeout: Self::default_request_timeout(),
        }
    }
}

impl Batch {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    fn validate_identity_header(name: &String) -> Result<(), ValidationError> {
        HeaderName::from_bytes(name.as_bytes())
            .map(|_| ())
            .map_err(|_| ValidationError::new("invalid_identity_header"))
    }

    fn default_max_requests() -> usize {
        100
    }

    fn default_max_requests_async() -> usize {
        10_000
    }

    fn default_identity_header() -> String {
        "X-Identity-ID".to_string()
    }

    fn default_max_body_bytes() -> usize {
        10 * 1024 * 1024
    }

    fn default_request_timeout() -> u64 {
        300
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Queue {
    #[validate(length(min = 1))]
    #[serde(default = "Queue::default_name")]
    pub topic: String,
    #[validate(length(min = 1))]
    #[serde(default = "Queue::default_name")]
    pub consumer_group: String,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            topic: Self::default_name(),
            consumer_group: Self::default_name(),
        }
    }
}

impl Queue {
    fn default_name() -> String {
        "batch_async".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Store {
    /// Correlation record TTL in minutes.
    #[validate(range(min = 1))]
    #[serde(default = "Store::default_expire")]
    pub expire: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            expire: Self::default_expire(),
        }
    }
}

impl Store {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.expire * 60)
    }

    fn default_expire() -> u64 {
        60
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Workers {
    #[serde(default)]
    pub count: usize,
    /// Milliseconds.
    #[validate(range(min = 1))]
    #[serde(default = "Workers::default_idle_timeout")]
    pub idle_timeout: u64,
    /// Milliseconds.
    #[serde(default = "Workers::default_restart_backoff")]
    pub restart_backoff: u64,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    /// Seconds.
    #[serde(default = "Workers::default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    #[serde(default = "Workers::default_missing_record_retries")]
    pub missing_record_retries: u32,
}

impl Default for Workers {
    fn default() -> Self {
        Self {
            count: 0,
            idle_timeout: Self::default_idle_timeout(),
            restart_backoff: Self::default_restart_backoff(),
            max_restarts: None,
            shutdown_timeout: Self::default_shutdown_timeout(),
            missing_record_retries: Self::default_missing_record_retries(),
        }
    }
}

impl Workers {
    fn default_idle_timeout() -> u64 {
        500
    }

    fn default_restart_backoff() -> u64 {
        1000
    }

    fn default_shutdown_timeout() -> u64 {
        3
    }

    fn default_missing_record_retries() -> u32 {
        3
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
    pub level: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sentry {
    pub dsn: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn not_a_test_i_cannot_write_yaml_by_hand() {
        init_log();
        let conf = Config::default();
        // cargo test -- --nocapture not_a_test_i_cannot_write_yaml_by_hand
        println!("{}", conf.to_yaml());
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1
  threads: 2

listeners:
  - address: 0.0.0.0:8080
  - address: "[::1]:8443"
    tls:
      cert_path: /etc/ssl/server.crt
      key_path: /etc/ssl/server.key
    offer_h2: true

batch:
  max_requests: 50
  identity_header: X-User-ID

hosts:
  pmn: http://pmn-load-balancer:80/
  search: https://search.internal

store:
  expire: 5

workers:
  count: 4
  shutdown_timeout: 10
  max_restarts: 20

status:
  address: 127.0.0.1:7085

prometheus:
  address: 127.0.0.1:9091
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str).unwrap();
        assert_eq!(1, conf.pingora.version);
        assert_eq!(2, conf.listeners.len());
        assert_eq!(50, conf.batch.max_requests);
        assert_eq!(10_000, conf.batch.max_requests_async);
        assert_eq!("X-User-ID", conf.batch.identity_header);
        assert_eq!(2, conf.hosts.len());
        assert_eq!(Duration::from_secs(300), conf.store.ttl());
        assert_eq!("batch_async", conf.queue.topic);
        assert_eq!("batch_async", conf.queue.consumer_group);
        assert!(conf.status.is_some());
        assert!(conf.log.is_none());

        let pool = conf.worker_pool();
        assert_eq!(4, pool.count);
        assert_eq!(Some(20), pool.max_restarts);
        assert_eq!(Duration::from_secs(10), pool.shutdown_timeout);
        assert_eq!(Duration::from_millis(500), pool.worker.idle_timeout);
        assert_eq!("batch_async", pool.worker.consumer_group);
        print!("{}", conf.to_yaml());
    }

    #[test]
    fn test_worker_only_config_rejected() {
        init_log();
        let conf_str = r#"
---
workers:
  count: 2
        "#;
        let err = Config::from_yaml(conf_str).unwrap_err();
        assert!(format!("{err}").contains("worker-only mode needs a shared queue"));
    }

    #[test]
    fn test_valid_listeners_required() {
        init_log();
        let conf_str = r#"
---
listeners: []
hosts:
  pmn: http://pmn
        "#;
        let conf = Config::from_yaml(conf_str);
        match conf {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_valid_listeners_tls_for_offer_h2() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
    offer_h2: true
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_batch_limits() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
batch:
  max_requests: 0
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_hosts() {
        init_log();
        let bad_name = r#"
---
listeners:
  - address: "[::1]:8080"
hosts:
  "Bad Name": http://x
        "#;
        assert!(Config::from_yaml(bad_name).is_err());

        let bad_url = r#"
---
listeners:
  - address: "[::1]:8080"
hosts:
  pmn: ftp://x
        "#;
        assert!(Config::from_yaml(bad_url).is_err());
    }

    #[test]
    fn test_valid_identity_header() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
batch:
  identity_header: "bad header"
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_target_map_env_overlay() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
hosts:
  pmn: http://pmn-default
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        let vars = vec![
            ("PMN_BATCH_HOST".to_string(), "http://pmn-override".to_string()),
            ("SEARCH_BATCH_HOST".to_string(), "https://search".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let targets = conf.target_map_with(vars).unwrap();
        assert_eq!(2, targets.len());
        assert_eq!(Some("http://pmn-override"), targets.get("pmn"));
        assert_eq!(Some("https://search"), targets.get("search"));

        let invalid = vec![("X_BATCH_HOST".to_string(), "not-a-url".to_string())];
        assert!(matches!(
            conf.target_map_with(invalid),
            Err(BatchError::Configuration(_))
        ));
    }
}
