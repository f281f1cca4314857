//! Configuration for the daemon.
//!
//! Values come from `DYNCLUSTER_*` environment variables. If
//! `DYNCLUSTER_CONFIG` names a TOML file, its values are loaded first and
//! the environment overrides them.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::reconciler::ReconcilerConfig;
use crate::service::ServiceConfig;

const ENV_PREFIX: &str = "DYNCLUSTER_";

/// Which container engine backs the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Docker Engine API.
    Docker,
    /// In-memory engine and registry, for development.
    Mock,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "mock" => Ok(Self::Mock),
            other => bail!("unknown engine kind {other:?} (expected docker or mock)"),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub listen_addr: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory holding the registry database.
    pub data_dir: PathBuf,

    pub engine: EngineKind,

    /// Docker host: a socket path, `unix://` URL or `tcp://host:port`.
    pub docker_host: String,

    /// Registry to log in to at startup and prefix image references with.
    pub image_registry: Option<String>,

    pub image_repository: String,

    /// Network every node container joins.
    pub network: String,

    /// Time between expiry sweeps.
    pub cleanup_interval: Duration,

    /// Cluster lifetime when a caller does not ask for one.
    pub default_ttl: Duration,

    /// Longest cluster lifetime a caller may ask for.
    pub max_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let service = ServiceConfig::default();
        Self {
            listen_addr: "0.0.0.0:19923".to_string(),
            log_level: "info".to_string(),
            data_dir: PathBuf::from("./data"),
            engine: EngineKind::Docker,
            docker_host: "/var/run/docker.sock".to_string(),
            image_registry: None,
            image_repository: service.image_repository,
            network: service.network,
            cleanup_interval: ReconcilerConfig::default().interval,
            default_ttl: service.default_ttl,
            max_ttl: service.max_ttl,
        }
    }
}

/// Values accepted in the TOML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    log_level: Option<String>,
    data_dir: Option<PathBuf>,
    engine: Option<EngineKind>,
    docker_host: Option<String>,
    docker_port: Option<u16>,
    image_registry: Option<String>,
    image_repository: Option<String>,
    network: Option<String>,
    cleanup_interval_secs: Option<u64>,
    default_ttl_secs: Option<u64>,
    max_ttl_secs: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` to read variables.
    pub fn load<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        let file = match var("CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let mut config = Config::default();

        if let Some(v) = var("LISTEN_ADDR").or(file.listen_addr) {
            config.listen_addr = v;
        }
        if let Some(v) = var("LOG_LEVEL").or(file.log_level) {
            config.log_level = v;
        }
        if let Some(v) = var("DATA_DIR").map(PathBuf::from).or(file.data_dir) {
            config.data_dir = v;
        }
        if let Some(v) = var("ENGINE") {
            config.engine = v.parse()?;
        } else if let Some(v) = file.engine {
            config.engine = v;
        }

        let docker_port = match var("DOCKER_PORT") {
            Some(v) => Some(parse_var("DOCKER_PORT", &v)?),
            None => file.docker_port,
        };
        config.docker_host = resolve_docker_host(var("DOCKER_HOST").or(file.docker_host), docker_port)
            .unwrap_or(config.docker_host);

        if let Some(v) = var("IMAGE_REGISTRY").or(file.image_registry) {
            config.image_registry = Some(v);
        }
        if let Some(v) = var("IMAGE_REPOSITORY").or(file.image_repository) {
            config.image_repository = v;
        }
        if let Some(v) = var("NETWORK").or(file.network) {
            config.network = v;
        }

        if let Some(secs) = secs_var(&var, "CLEANUP_INTERVAL_SECS", file.cleanup_interval_secs)? {
            config.cleanup_interval = secs;
        }
        if let Some(secs) = secs_var(&var, "DEFAULT_TTL_SECS", file.default_ttl_secs)? {
            config.default_ttl = secs;
        }
        if let Some(secs) = secs_var(&var, "MAX_TTL_SECS", file.max_ttl_secs)? {
            config.max_ttl = secs;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cleanup_interval.is_zero() {
            bail!("cleanup interval must be greater than zero");
        }
        if self.default_ttl.is_zero() {
            bail!("default cluster TTL must be greater than zero");
        }
        if self.default_ttl > self.max_ttl {
            bail!(
                "default cluster TTL ({}s) exceeds the maximum ({}s)",
                self.default_ttl.as_secs(),
                self.max_ttl.as_secs()
            );
        }
        Ok(())
    }

    /// Path of the registry database inside the data directory.
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    /// Settings for the cluster service.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            network: self.network.clone(),
            image_registry: self.image_registry.clone(),
            image_repository: self.image_repository.clone(),
            default_ttl: self.default_ttl,
            max_ttl: self.max_ttl,
        }
    }

    /// Settings for the expiry reconciler.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.cleanup_interval,
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("invalid config file {}", path.display()))
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {ENV_PREFIX}{name}: {value:?}"))
}

fn secs_var<F>(var: &F, name: &str, fallback: Option<u64>) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = match var(name) {
        Some(v) => Some(parse_var::<u64>(name, &v)?),
        None => fallback,
    };
    Ok(secs.map(Duration::from_secs))
}

/// Combine a docker host with the legacy port setting.
///
/// A port with no host means a local TCP daemon. A port with a bare host
/// name means that host over TCP. Hosts that already carry a scheme or are
/// socket paths are left alone.
fn resolve_docker_host(host: Option<String>, port: Option<u16>) -> Option<String> {
    match (host, port) {
        (None, None) => None,
        (None, Some(port)) => Some(format!("tcp://127.0.0.1:{port}")),
        (Some(host), Some(port)) if !host.contains("://") && !host.starts_with('/') => {
            Some(format!("tcp://{host}:{port}"))
        }
        (Some(host), _) => Some(host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use rstest::rstest;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::load(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:19923");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.engine, EngineKind::Docker);
        assert_eq!(config.docker_host, "/var/run/docker.sock");
        assert_eq!(config.network, "macvlan0");
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.registry_path(), PathBuf::from("./data/registry.db"));
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("DYNCLUSTER_LISTEN_ADDR", "127.0.0.1:8080"),
            ("DYNCLUSTER_ENGINE", "mock"),
            ("DYNCLUSTER_NETWORK", "bridge"),
            ("DYNCLUSTER_IMAGE_REGISTRY", "registry.local:5000"),
            ("DYNCLUSTER_CLEANUP_INTERVAL_SECS", "30"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.engine, EngineKind::Mock);
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));

        let service = config.service_config();
        assert_eq!(service.network, "bridge");
        assert_eq!(service.image_registry.as_deref(), Some("registry.local:5000"));
    }

    #[test]
    fn test_file_values_overridden_by_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network = \"from-file\"\nlog_level = \"debug\"\ncleanup_interval_secs = 60"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = load(&[
            ("DYNCLUSTER_CONFIG", path.as_str()),
            ("DYNCLUSTER_NETWORK", "from-env"),
        ])
        .unwrap();

        assert_eq!(config.network, "from-env");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "netwrok = \"typo\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        assert!(load(&[("DYNCLUSTER_CONFIG", path.as_str())]).is_err());
    }

    #[rstest]
    #[case::bad_engine(&[("DYNCLUSTER_ENGINE", "podman")])]
    #[case::bad_interval(&[("DYNCLUSTER_CLEANUP_INTERVAL_SECS", "soon")])]
    #[case::zero_interval(&[("DYNCLUSTER_CLEANUP_INTERVAL_SECS", "0")])]
    #[case::default_above_max(&[("DYNCLUSTER_DEFAULT_TTL_SECS", "7200"), ("DYNCLUSTER_MAX_TTL_SECS", "3600")])]
    fn test_invalid_config(#[case] vars: &[(&str, &str)]) {
        assert!(load(vars).is_err());
    }

    #[rstest]
    #[case::unset(None, None, None)]
    #[case::port_only(None, Some(2375), Some("tcp://127.0.0.1:2375"))]
    #[case::bare_host(Some("docker1"), Some(2376), Some("tcp://docker1:2376"))]
    #[case::socket_ignores_port(Some("/run/docker.sock"), Some(2375), Some("/run/docker.sock"))]
    #[case::url_ignores_port(Some("tcp://docker1:2375"), Some(9999), Some("tcp://docker1:2375"))]
    fn test_resolve_docker_host(
        #[case] host: Option<&str>,
        #[case] port: Option<u16>,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(
            resolve_docker_host(host.map(String::from), port).as_deref(),
            expected
        );
    }
}
