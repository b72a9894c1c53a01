use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, bail};
use podcap_core::ReconcilerConfig;
use podcap_exec::SupervisorConfig;
use podcap_observe::{LoggerConfig, LoggerFormat, logger_init};

/// CRI endpoints probed, in order, when `PODCAP_CRI_SOCKET` is not set.
pub const CRI_SOCKET_CANDIDATES: [&str; 3] = [
    "/run/containerd/containerd.sock",
    "/run/crio/crio.sock",
    "/var/run/dockershim.sock",
];

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8090";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node this agent captures on.
    pub node_name: String,
    pub capture_dir: PathBuf,
    pub max_concurrent: usize,
    /// `unix://` endpoint handed to `crictl`; `None` lets `crictl` use its own default.
    pub cri_socket: Option<String>,
    /// `None` disables the HTTP server.
    pub http_addr: Option<SocketAddr>,
    pub workers: usize,
    pub reap_orphans: bool,
    /// Also run the annotation-driven reconciler.
    pub annotations: bool,
    pub log_level: String,
    pub log_format: LoggerFormat,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            capture_dir: PathBuf::from("/captures"),
            max_concurrent: 5,
            cri_socket: None,
            http_addr: DEFAULT_HTTP_ADDR.parse().ok(),
            workers: 2,
            reap_orphans: true,
            annotations: false,
            log_level: "info".into(),
            log_format: LoggerFormat::Text,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from `lookup` (an environment accessor).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let mut cfg = Self::default();

        cfg.node_name = get("NODE_NAME")
            .filter(|v| !v.is_empty())
            .context("NODE_NAME must be set")?;

        if let Some(dir) = get("PODCAP_CAPTURE_DIR").filter(|v| !v.is_empty()) {
            cfg.capture_dir = PathBuf::from(dir);
        }
        if let Some(raw) = get("PODCAP_MAX_CONCURRENT") {
            cfg.max_concurrent = parse("PODCAP_MAX_CONCURRENT", &raw)?;
        }
        if let Some(raw) = get("PODCAP_WORKERS") {
            cfg.workers = parse("PODCAP_WORKERS", &raw)?;
        }
        if let Some(raw) = get("PODCAP_REAP_ORPHANS") {
            cfg.reap_orphans = parse_bool("PODCAP_REAP_ORPHANS", &raw)?;
        }
        if let Some(raw) = get("PODCAP_ANNOTATIONS") {
            cfg.annotations = parse_bool("PODCAP_ANNOTATIONS", &raw)?;
        }
        if let Some(raw) = get("PODCAP_HTTP_ADDR") {
            cfg.http_addr = if raw.is_empty() {
                None
            } else {
                Some(parse("PODCAP_HTTP_ADDR", &raw)?)
            };
        }

        cfg.cri_socket = match get("PODCAP_CRI_SOCKET").filter(|v| !v.is_empty()) {
            Some(socket) => Some(socket),
            None => detect_cri_socket(CRI_SOCKET_CANDIDATES.iter().map(Path::new)),
        };

        if let Some(level) = get("PODCAP_LOG_LEVEL").filter(|v| !v.is_empty()) {
            cfg.log_level = level;
        }
        if let Some(raw) = get("PODCAP_LOG_FORMAT") {
            cfg.log_format = raw
                .parse()
                .with_context(|| format!("PODCAP_LOG_FORMAT={raw}"))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            bail!("node name must not be empty");
        }
        if self.max_concurrent == 0 {
            bail!("max concurrent captures must be > 0");
        }
        if self.workers == 0 {
            bail!("reconcile workers must be > 0");
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut cfg =
            SupervisorConfig::new(&self.capture_dir).with_max_concurrent(self.max_concurrent);
        cfg.reap_orphans = self.reap_orphans;
        cfg
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        let mut cfg = ReconcilerConfig::new(self.node_name.as_str());
        cfg.workers = self.workers;
        cfg
    }

    pub fn logger_config(&self) -> LoggerConfig {
        LoggerConfig::default()
            .with_format(self.log_format)
            .with_level(self.log_level.as_str())
    }

    /// Install the global logger. Call once, before [`crate::Agent::new`].
    pub fn init_logger(&self) -> anyhow::Result<()> {
        logger_init(&self.logger_config()).context("logger initialization")
    }
}

/// First existing socket among `candidates`, as a `unix://` endpoint.
pub fn detect_cri_socket<'a>(candidates: impl IntoIterator<Item = &'a Path>) -> Option<String> {
    candidates
        .into_iter()
        .find(|path| path.exists())
        .map(|path| format!("unix://{}", path.display()))
}

fn parse<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().with_context(|| format!("{key}={raw}"))
}

fn parse_bool(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{key}={raw}: expected a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_with_only_node_name() {
        let cfg = AgentConfig::from_lookup(lookup(&[
            ("NODE_NAME", "node-a"),
            ("PODCAP_CRI_SOCKET", "unix:///tmp/cri.sock"),
        ]))
        .unwrap();

        assert_eq!(cfg.node_name, "node-a");
        assert_eq!(cfg.capture_dir, PathBuf::from("/captures"));
        assert_eq!(cfg.max_concurrent, 5);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.http_addr, Some("0.0.0.0:8090".parse().unwrap()));
        assert_eq!(cfg.cri_socket.as_deref(), Some("unix:///tmp/cri.sock"));
        assert!(cfg.reap_orphans);
        assert!(!cfg.annotations);
        assert_eq!(cfg.log_format, LoggerFormat::Text);
    }

    #[test]
    fn node_name_is_required() {
        let err = AgentConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("NODE_NAME"));
        assert!(AgentConfig::from_lookup(lookup(&[("NODE_NAME", " ")])).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = AgentConfig::from_lookup(lookup(&[
            ("NODE_NAME", "node-a"),
            ("PODCAP_CAPTURE_DIR", "/var/lib/podcap"),
            ("PODCAP_MAX_CONCURRENT", "1"),
            ("PODCAP_WORKERS", "4"),
            ("PODCAP_HTTP_ADDR", ""),
            ("PODCAP_REAP_ORPHANS", "false"),
            ("PODCAP_ANNOTATIONS", "TRUE"),
            ("PODCAP_LOG_FORMAT", "json"),
            ("PODCAP_LOG_LEVEL", "podcap_core=debug,info"),
        ]))
        .unwrap();

        assert_eq!(cfg.capture_dir, PathBuf::from("/var/lib/podcap"));
        assert_eq!(cfg.max_concurrent, 1);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.http_addr, None);
        assert!(!cfg.reap_orphans);
        assert!(cfg.annotations);
        assert_eq!(cfg.log_format, LoggerFormat::Json);

        let sup = cfg.supervisor_config();
        assert_eq!(sup.max_concurrent, 1);
        assert!(!sup.reap_orphans);
        assert_eq!(cfg.reconciler_config().workers, 4);
        assert_eq!(cfg.logger_config().level, "podcap_core=debug,info");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            ("PODCAP_MAX_CONCURRENT", "0"),
            ("PODCAP_MAX_CONCURRENT", "many"),
            ("PODCAP_WORKERS", "0"),
            ("PODCAP_HTTP_ADDR", "nowhere"),
            ("PODCAP_ANNOTATIONS", "maybe"),
            ("PODCAP_LOG_FORMAT", "xml"),
        ] {
            let res = AgentConfig::from_lookup(lookup(&[("NODE_NAME", "node-a"), (key, value)]));
            assert!(res.is_err(), "{key}={value}");
        }
    }

    #[test]
    fn cri_socket_detection_takes_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let containerd = dir.path().join("containerd.sock");
        let crio = dir.path().join("crio.sock");
        std::fs::write(&crio, b"").unwrap();

        let found = detect_cri_socket([containerd.as_path(), crio.as_path()]);
        assert_eq!(found, Some(format!("unix://{}", crio.display())));

        assert_eq!(detect_cri_socket([containerd.as_path()]), None);
    }
}
