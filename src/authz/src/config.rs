//! Service configuration loaded from the environment

use crate::engine::{EngineConfig, RedirectTargets, RouteTable};
use crate::error::{AuthzError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the authorization service
#[derive(Debug, Clone)]
pub struct AuthzConfig {
    /// HTTP listen port
    pub port: u16,

    /// Postgres connection string; in-memory stores when absent
    pub database_url: Option<String>,

    /// HS256 secret used by the trust boundary
    pub jwt_secret: String,

    /// Session cache TTL
    pub session_ttl: Duration,

    pub redirects: RedirectTargets,

    /// Optional JSON route table; built-in appraisal routes otherwise
    pub route_table_path: Option<String>,

    /// Sessions untouched for this long are evicted from the server registry
    pub session_idle: Duration,

    /// Payment gateways seeded into the in-memory data tier
    pub payment_gateways: Vec<GatewaySeed>,
}

/// Payment gateway declared in `PAYMENT_GATEWAYS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySeed {
    pub id: String,
    pub name: String,
}

/// Parse `id` or `id:Display Name` entries separated by commas
fn parse_gateways(raw: &str) -> Result<Vec<GatewaySeed>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (id, name) = match item.split_once(':') {
                Some((id, name)) => (id.trim(), name.trim()),
                None => (item, item),
            };
            if id.is_empty() {
                return Err(AuthzError::Config(format!(
                    "PAYMENT_GATEWAYS entry '{}' has no id",
                    item
                )));
            }
            let name = if name.is_empty() { id } else { name };
            Ok(GatewaySeed {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: None,
            jwt_secret: String::new(),
            session_ttl: Duration::from_secs(300),
            redirects: RedirectTargets::default(),
            route_table_path: None,
            session_idle: Duration::from_secs(1800),
            payment_gateways: Vec::new(),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AuthzError::Config(format!("{} has invalid value '{}'", key, raw))),
    }
}

impl AuthzConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let redirects = RedirectTargets {
            sign_in: get("SIGN_IN_PATH").unwrap_or(defaults.redirects.sign_in),
            default_area: get("DEFAULT_AREA_PATH").unwrap_or(defaults.redirects.default_area),
            plan_selection: get("PLANS_PATH").unwrap_or(defaults.redirects.plan_selection),
        };

        for path in [&redirects.sign_in, &redirects.default_area, &redirects.plan_selection] {
            if !path.starts_with('/') {
                return Err(AuthzError::Config(format!(
                    "Redirect path must be absolute: {}",
                    path
                )));
            }
        }

        let ttl_secs: u64 = parse("SESSION_CACHE_TTL", get("SESSION_CACHE_TTL"), 300)?;
        let idle_secs: u64 = parse("SESSION_IDLE_TIMEOUT", get("SESSION_IDLE_TIMEOUT"), 1800)?;
        if idle_secs == 0 {
            return Err(AuthzError::Config(
                "SESSION_IDLE_TIMEOUT must be positive".to_string(),
            ));
        }
        let payment_gateways = match get("PAYMENT_GATEWAYS") {
            Some(raw) => parse_gateways(&raw)?,
            None => defaults.payment_gateways,
        };

        Ok(Self {
            port: parse("PORT", get("PORT"), defaults.port)?,
            database_url: get("DATABASE_URL"),
            jwt_secret: get("JWT_SECRET")
                .ok_or_else(|| AuthzError::Config("JWT_SECRET is required".to_string()))?,
            session_ttl: Duration::from_secs(ttl_secs),
            redirects,
            route_table_path: get("ROUTE_TABLE_PATH"),
            session_idle: Duration::from_secs(idle_secs),
            payment_gateways,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            session_ttl: self.session_ttl,
            redirects: self.redirects.clone(),
        }
    }

    /// Route table from `route_table_path`, or the built-in one
    pub fn route_table(&self) -> Result<RouteTable> {
        match &self.route_table_path {
            None => Ok(RouteTable::appraisal_defaults()),
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    AuthzError::Config(format!("Failed to read route table {}: {}", path, e))
                })?;
                RouteTable::from_json(&json)
            }
        }
    }
}
