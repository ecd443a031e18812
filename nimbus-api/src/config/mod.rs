//! Process configuration, read once from the environment at startup.

pub mod database;
pub mod redis;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use nimbus_common::validate::Cidr;
use nimbus_providers::{BackendConfig, ComputeKind, DnsKind, NetworkKind};

/// `DATABASE_URL` prefix selecting the in-memory store.
pub const MEMORY_STORE_URL: &str = "memory://";

const MIN_SECRETS_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment {other:?}")),
        }
    }
}

/// Which halves of the control plane this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorRole {
    All,
    /// HTTP surface only, no reconcilers.
    Api,
    /// Reconcilers only; HTTP serves health.
    Worker,
}

impl OperatorRole {
    pub fn runs_workers(&self) -> bool {
        !matches!(self, OperatorRole::Api)
    }

    pub fn serves_api(&self) -> bool {
        !matches!(self, OperatorRole::Worker)
    }
}

impl FromStr for OperatorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(OperatorRole::All),
            "api" => Ok(OperatorRole::Api),
            "worker" => Ok(OperatorRole::Worker),
            other => Err(format!("unknown operator role {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub backends: BackendConfig,
    pub secrets_encryption_key: Option<String>,
    pub environment: Environment,
    pub default_vpc_cidr: String,
    pub role: OperatorRole,
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    pub shutdown_drain: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unset and blank values
    /// fall back to defaults; malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;
        let redis_url = get("REDIS_URL");
        if redis_url.is_none() && !database_url.starts_with(MEMORY_STORE_URL) {
            bail!("REDIS_URL must be set");
        }

        let environment: Environment = parse_or(get("ENVIRONMENT"), Environment::Development, "ENVIRONMENT")?;
        let secrets_encryption_key = get("SECRETS_ENCRYPTION_KEY");
        match (&secrets_encryption_key, environment) {
            (Some(k), _) if k.len() < MIN_SECRETS_KEY_LEN => {
                bail!("SECRETS_ENCRYPTION_KEY must be at least {MIN_SECRETS_KEY_LEN} characters")
            }
            (None, Environment::Production) => bail!("SECRETS_ENCRYPTION_KEY must be set in production"),
            _ => {}
        }

        let default_vpc_cidr = get("DEFAULT_VPC_CIDR").unwrap_or_else(|| "10.0.0.0/16".to_string());
        Cidr::parse("DEFAULT_VPC_CIDR", &default_vpc_cidr).map_err(|e| anyhow!("{e}"))?;

        let workdir = PathBuf::from(get("WORKDIR").unwrap_or_else(|| "/var/lib/nimbus".to_string()));
        let backends = BackendConfig {
            compute: parse_or(get("COMPUTE_BACKEND"), ComputeKind::ContainerRuntime, "COMPUTE_BACKEND")?,
            network: parse_or(get("NETWORK_BACKEND"), NetworkKind::Ovs, "NETWORK_BACKEND")?,
            dns: parse_or(get("DNS_BACKEND"), DnsKind::Noop, "DNS_BACKEND")?,
            microvm_kernel: get("MICROVM_KERNEL")
                .unwrap_or_else(|| workdir.join("vmlinux").to_string_lossy().into_owned()),
            workdir,
            libvirt_uri: get("LIBVIRT_URI").unwrap_or_else(|| "qemu:///system".to_string()),
            docker_socket: PathBuf::from(get("DOCKER_SOCKET").unwrap_or_else(|| "/var/run/docker.sock".to_string())),
            pdns_api_url: get("PDNS_API_URL"),
            pdns_api_key: get("PDNS_API_KEY"),
        };

        let rate_limit_rps: u32 = parse_or(get("RATE_LIMIT_RPS"), 20, "RATE_LIMIT_RPS")?;
        let rate_limit_burst: u32 = parse_or(get("RATE_LIMIT_BURST"), 40, "RATE_LIMIT_BURST")?;
        if rate_limit_rps == 0 || rate_limit_burst == 0 {
            bail!("RATE_LIMIT_RPS and RATE_LIMIT_BURST must be positive");
        }

        Ok(Self {
            port: parse_or(get("PORT"), 8003, "PORT")?,
            database_url,
            redis_url,
            backends,
            secrets_encryption_key,
            environment,
            default_vpc_cidr,
            role: parse_or(get("OPERATOR_ROLE"), OperatorRole::All, "OPERATOR_ROLE")?,
            rate_limit_rps,
            rate_limit_burst,
            shutdown_drain: Duration::from_secs(parse_or(get("SHUTDOWN_DRAIN_SECS"), 10, "SHUTDOWN_DRAIN_SECS")?),
        })
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.starts_with(MEMORY_STORE_URL)
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn parse_or<T>(raw: Option<String>, default: T, key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v
            .parse::<T>()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid {key}={v:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&[("DATABASE_URL", "postgres://localhost/nimbus"), ("REDIS_URL", "redis://localhost")]).unwrap();
        assert_eq!(cfg.port, 8003);
        assert_eq!(cfg.backends.compute, ComputeKind::ContainerRuntime);
        assert_eq!(cfg.backends.network, NetworkKind::Ovs);
        assert_eq!(cfg.role, OperatorRole::All);
        assert_eq!(cfg.default_vpc_cidr, "10.0.0.0/16");
        assert_eq!(cfg.shutdown_drain, Duration::from_secs(10));
        assert!(!cfg.uses_memory_store());
    }

    #[test]
    fn database_url_is_required() {
        assert!(load(&[("REDIS_URL", "redis://localhost")]).is_err());
    }

    #[test]
    fn memory_store_needs_no_redis() {
        let cfg = load(&[("DATABASE_URL", "memory://"), ("COMPUTE_BACKEND", "noop")]).unwrap();
        assert!(cfg.uses_memory_store());
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn production_requires_a_long_key() {
        let base = [("DATABASE_URL", "memory://"), ("ENVIRONMENT", "production")];
        assert!(load(&base).is_err());

        let short = [base[0], base[1], ("SECRETS_ENCRYPTION_KEY", "too-short")];
        assert!(load(&short).is_err());

        let key = "k".repeat(32);
        let ok = [base[0], base[1], ("SECRETS_ENCRYPTION_KEY", key.as_str())];
        assert!(load(&ok).unwrap().is_production());
    }

    #[test]
    fn malformed_values_fail() {
        assert!(load(&[("DATABASE_URL", "memory://"), ("PORT", "eighty")]).is_err());
        assert!(load(&[("DATABASE_URL", "memory://"), ("COMPUTE_BACKEND", "mainframe")]).is_err());
        assert!(load(&[("DATABASE_URL", "memory://"), ("OPERATOR_ROLE", "janitor")]).is_err());
        assert!(load(&[("DATABASE_URL", "memory://"), ("DEFAULT_VPC_CIDR", "10.0.0.0/40")]).is_err());
    }

    #[test]
    fn roles() {
        assert!(OperatorRole::All.runs_workers() && OperatorRole::All.serves_api());
        assert!(!OperatorRole::Api.runs_workers());
        assert!(!OperatorRole::Worker.serves_api());
    }
}
