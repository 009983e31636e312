//! Configuration management.
//!
//! All configuration comes from environment variables with defaults, loaded
//! once at startup. A `.env` file is honored when present. Parse failures are
//! collected and reported together rather than one at a time.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, StackError};
use crate::manifest::quantity;

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address, e.g. `:8081` or `0.0.0.0:8081`.
    pub http_addr: String,

    /// Grace period for in-flight requests on shutdown.
    pub shutdown_timeout: Duration,

    /// Optional Prometheus exposition listener.
    pub metrics_addr: Option<SocketAddr>,

    pub api_key: ApiKeyConfig,
    pub stack: StackSettings,
}

/// API-key guard configuration.
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub enabled: bool,
    pub value: String,
}

/// Settings for the stack lifecycle engine and its collaborators.
#[derive(Debug, Clone)]
pub struct StackSettings {
    pub namespace: String,
    pub stack_ttl: Duration,
    pub scheduler_interval: Duration,
    pub node_port_min: u16,
    pub node_port_max: u16,
    pub port_lock_ttl: Duration,
    pub scheduling_timeout: Duration,
    pub require_ingress_network_policy: bool,
    pub node_role: String,

    /// Aggregate CPU reservation ceiling in millicores. `None` disables the
    /// capacity guard.
    pub max_reserved_cpu_milli: Option<i64>,

    /// Aggregate memory reservation ceiling in bytes. `None` disables the
    /// capacity guard.
    pub max_reserved_memory_bytes: Option<i64>,

    pub table_name: String,
    pub aws_region: String,
    pub aws_endpoint: Option<String>,
    pub consistent_read: bool,
    pub use_mock_repository: bool,

    pub kubeconfig_path: Option<String>,
    pub kube_context: Option<String>,
    pub client_qps: f64,
    pub client_burst: u32,
    pub use_mock_orchestrator: bool,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        // Missing .env is the normal case; anything else should not kill boot.
        let _ = dotenvy::dotenv();

        let mut errs: Vec<String> = Vec::new();

        let http_addr = env_str("HTTP_ADDR", ":8081");
        let shutdown_timeout =
            env_duration("SHUTDOWN_TIMEOUT", Duration::from_secs(10), &mut errs);
        let metrics_addr = env_socket_addr("METRICS_ADDR", &mut errs);

        let api_key = ApiKeyConfig {
            enabled: env_bool("API_KEY_ENABLED", true, &mut errs),
            value: env_str("API_KEY", ""),
        };

        let stack = StackSettings {
            namespace: env_str("STACK_NAMESPACE", "stacks"),
            stack_ttl: env_duration("STACK_TTL", Duration::from_secs(2 * 3600), &mut errs),
            scheduler_interval: env_duration(
                "STACK_SCHEDULER_INTERVAL",
                Duration::from_secs(10),
                &mut errs,
            ),
            node_port_min: env_u16("STACK_NODEPORT_MIN", 31001, &mut errs),
            node_port_max: env_u16("STACK_NODEPORT_MAX", 32767, &mut errs),
            port_lock_ttl: env_duration(
                "STACK_PORT_LOCK_TTL",
                Duration::from_secs(30),
                &mut errs,
            ),
            scheduling_timeout: env_duration(
                "STACK_SCHEDULING_TIMEOUT",
                Duration::from_secs(20),
                &mut errs,
            ),
            require_ingress_network_policy: env_bool(
                "STACK_REQUIRE_INGRESS_NETWORK_POLICY",
                true,
                &mut errs,
            ),
            node_role: env_str("STACK_NODE_ROLE", "stack"),
            max_reserved_cpu_milli: env_cpu_milli("STACK_MAX_RESERVED_CPU", &mut errs),
            max_reserved_memory_bytes: env_memory_bytes("STACK_MAX_RESERVED_MEMORY", &mut errs),
            table_name: env_str("DDB_STACK_TABLE", "smctf-stacks"),
            aws_region: env_str("AWS_REGION", "us-east-1"),
            aws_endpoint: env_opt("AWS_ENDPOINT"),
            consistent_read: env_bool("DDB_CONSISTENT_READ", true, &mut errs),
            use_mock_repository: env_bool("DDB_USE_MOCK", false, &mut errs),
            kubeconfig_path: env_opt("K8S_KUBECONFIG"),
            kube_context: env_opt("K8S_CONTEXT"),
            client_qps: env_f64("K8S_CLIENT_QPS", 20.0, &mut errs),
            client_burst: env_u32("K8S_CLIENT_BURST", 40, &mut errs),
            use_mock_orchestrator: env_bool("K8S_USE_MOCK", false, &mut errs),
        };

        let cfg = Config { http_addr, shutdown_timeout, metrics_addr, api_key, stack };
        cfg.validate(&mut errs);

        if !errs.is_empty() {
            return Err(StackError::InvalidConfig { reason: errs.join("; ") });
        }

        Ok(cfg)
    }

    fn validate(&self, errs: &mut Vec<String>) {
        if self.http_addr.is_empty() {
            errs.push("HTTP_ADDR must not be empty".to_string());
        }

        if self.api_key.enabled && self.api_key.value.trim().is_empty() {
            errs.push("API_KEY must not be empty when API_KEY_ENABLED=true".to_string());
        }

        let stack = &self.stack;
        if stack.namespace.is_empty() {
            errs.push("STACK_NAMESPACE must not be empty".to_string());
        }

        if stack.stack_ttl.is_zero() {
            errs.push("STACK_TTL must be positive".to_string());
        }

        if stack.scheduler_interval.is_zero() {
            errs.push("STACK_SCHEDULER_INTERVAL must be positive".to_string());
        }

        if stack.node_port_min == 0 || stack.node_port_min > stack.node_port_max {
            errs.push("STACK_NODEPORT range is invalid".to_string());
        }

        if stack.port_lock_ttl.is_zero() {
            errs.push("STACK_PORT_LOCK_TTL must be positive".to_string());
        }

        if stack.scheduling_timeout.is_zero() {
            errs.push("STACK_SCHEDULING_TIMEOUT must be positive".to_string());
        }

        if stack.node_role.is_empty() {
            errs.push("STACK_NODE_ROLE must not be empty".to_string());
        }

        if stack.client_qps <= 0.0 {
            errs.push("K8S_CLIENT_QPS must be positive".to_string());
        }

        if stack.client_burst == 0 {
            errs.push("K8S_CLIENT_BURST must be positive".to_string());
        }

        if !stack.use_mock_repository {
            if stack.table_name.is_empty() {
                errs.push("DDB_STACK_TABLE must not be empty when DDB_USE_MOCK=false".to_string());
            }

            if stack.aws_region.is_empty() {
                errs.push("AWS_REGION must not be empty when DDB_USE_MOCK=false".to_string());
            }
        }
    }

    /// Copy of the config with secrets masked, safe to log.
    pub fn redacted(&self) -> Config {
        let mut cfg = self.clone();
        cfg.api_key.value = redact(&cfg.api_key.value);
        cfg
    }
}

fn redact(value: &str) -> String {
    const VISIBLE: usize = 2;
    if value.is_empty() {
        return String::new();
    }

    if value.len() <= VISIBLE * 2 {
        return "***".to_string();
    }

    format!("{}***{}", &value[..VISIBLE], &value[value.len() - VISIBLE..])
}

fn env_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool, errs: &mut Vec<String>) -> bool {
    match env_opt(key) {
        None => default,
        Some(v) => match v.parse() {
            Ok(b) => b,
            Err(_) => {
                errs.push(format!("{key} must be a boolean"));
                default
            }
        },
    }
}

fn env_u16(key: &str, default: u16, errs: &mut Vec<String>) -> u16 {
    match env_opt(key) {
        None => default,
        Some(v) => match v.parse() {
            Ok(n) => n,
            Err(_) => {
                errs.push(format!("{key} must be a port number"));
                default
            }
        },
    }
}

fn env_u32(key: &str, default: u32, errs: &mut Vec<String>) -> u32 {
    match env_opt(key) {
        None => default,
        Some(v) => match v.parse() {
            Ok(n) => n,
            Err(_) => {
                errs.push(format!("{key} must be an integer"));
                default
            }
        },
    }
}

fn env_f64(key: &str, default: f64, errs: &mut Vec<String>) -> f64 {
    match env_opt(key) {
        None => default,
        Some(v) => match v.parse() {
            Ok(n) => n,
            Err(_) => {
                errs.push(format!("{key} must be a number"));
                default
            }
        },
    }
}

fn env_duration(key: &str, default: Duration, errs: &mut Vec<String>) -> Duration {
    match env_opt(key) {
        None => default,
        Some(v) => match humantime::parse_duration(&v) {
            Ok(d) => d,
            Err(_) => {
                errs.push(format!("{key} must be a duration (e.g. 10s, 2h)"));
                default
            }
        },
    }
}

fn env_socket_addr(key: &str, errs: &mut Vec<String>) -> Option<SocketAddr> {
    match env_opt(key) {
        None => None,
        Some(v) => match v.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                errs.push(format!("{key} must be a socket address"));
                None
            }
        },
    }
}

fn env_cpu_milli(key: &str, errs: &mut Vec<String>) -> Option<i64> {
    let raw = env_opt(key)?;
    match quantity::parse_cpu_milli(&raw) {
        Ok(milli) => Some(milli),
        Err(_) => {
            errs.push(format!("{key} must be a cpu quantity (e.g. 64000m)"));
            None
        }
    }
}

fn env_memory_bytes(key: &str, errs: &mut Vec<String>) -> Option<i64> {
    let raw = env_opt(key)?;
    match quantity::parse_memory_bytes(&raw) {
        Ok(bytes) => Some(bytes),
        Err(_) => {
            errs.push(format!("{key} must be a memory quantity (e.g. 256Gi)"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> StackSettings {
        StackSettings {
            namespace: "stacks".to_string(),
            stack_ttl: Duration::from_secs(3600),
            scheduler_interval: Duration::from_secs(10),
            node_port_min: 31001,
            node_port_max: 32767,
            port_lock_ttl: Duration::from_secs(30),
            scheduling_timeout: Duration::from_secs(20),
            require_ingress_network_policy: false,
            node_role: "stack".to_string(),
            max_reserved_cpu_milli: None,
            max_reserved_memory_bytes: None,
            table_name: "smctf-stacks".to_string(),
            aws_region: "us-east-1".to_string(),
            aws_endpoint: None,
            consistent_read: true,
            use_mock_repository: true,
            kubeconfig_path: None,
            kube_context: None,
            client_qps: 20.0,
            client_burst: 40,
            use_mock_orchestrator: true,
        }
    }

    fn base_config() -> Config {
        Config {
            http_addr: ":8081".to_string(),
            shutdown_timeout: Duration::from_secs(10),
            metrics_addr: None,
            api_key: ApiKeyConfig { enabled: false, value: String::new() },
            stack: base_settings(),
        }
    }

    #[test]
    fn test_validate_accepts_base_config() {
        let mut errs = Vec::new();
        base_config().validate(&mut errs);
        assert!(errs.is_empty(), "unexpected errors: {errs:?}");
    }

    #[test]
    fn test_validate_rejects_inverted_port_range() {
        let mut cfg = base_config();
        cfg.stack.node_port_min = 32000;
        cfg.stack.node_port_max = 31000;

        let mut errs = Vec::new();
        cfg.validate(&mut errs);
        assert!(errs.iter().any(|e| e.contains("STACK_NODEPORT")));
    }

    #[test]
    fn test_validate_requires_api_key_when_enabled() {
        let mut cfg = base_config();
        cfg.api_key.enabled = true;

        let mut errs = Vec::new();
        cfg.validate(&mut errs);
        assert!(errs.iter().any(|e| e.contains("API_KEY")));
    }

    #[test]
    fn test_redacted_masks_api_key() {
        let mut cfg = base_config();
        cfg.api_key.value = "super-secret-key".to_string();
        assert_eq!(cfg.redacted().api_key.value, "su***ey");

        cfg.api_key.value = "abcd".to_string();
        assert_eq!(cfg.redacted().api_key.value, "***");
    }
}
