//! Substrate configuration.
//!
//! Layered like every daemon config in this workspace: built-in defaults,
//! then an optional file, then `CONCLAVE_`-prefixed environment variables
//! (`CONCLAVE_LEDGER__DATA_DIR`, `CONCLAVE_SERVER__LISTEN_ADDR`, ...).

use std::net::{Ipv4Addr, SocketAddr};

use chrono::Duration;
use conclave_kernel_halt::HaltConfig;
use conclave_kernel_ledger::{ActorRegistry, LedgerConfig};
use conclave_kernel_lifecycle::{LegitimacyBand, TimeoutPolicy, WindowedThresholds};
use conclave_kernel_merkle::MerkleConfig;
use conclave_kernel_safety::TermFilterConfig;
use conclave_types::ActorId;
use serde::{Deserialize, Serialize};

use crate::error::SubstrateError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    pub ledger: LedgerConfig,
    pub merkle: MerkleConfig,
    pub halt: HaltConfig,
    pub timeouts: TimeoutConfig,
    pub projection: ProjectionConfig,
    pub legitimacy: LegitimacyConfig,
    pub actors: ActorsConfig,
    pub filter: TermFilterConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

impl SubstrateConfig {
    /// Load configuration from defaults, `path` and the environment.
    pub fn load(path: Option<&str>) -> Result<Self, SubstrateError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&SubstrateConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONCLAVE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Everything in memory, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            ledger: LedgerConfig::in_memory(),
            ..Self::default()
        }
    }
}

/// Windows for automatic task transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub routed_ttl_hours: i64,
    pub acceptance_inactivity_hours: i64,
    pub report_deadline_hours: i64,
    pub aggregation_deadline_hours: i64,
    pub sweep_interval_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            routed_ttl_hours: 72,
            acceptance_inactivity_hours: 24,
            report_deadline_hours: 7 * 24,
            aggregation_deadline_hours: 72,
            sweep_interval_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            routed_ttl: Duration::hours(self.routed_ttl_hours),
            acceptance_inactivity: Duration::hours(self.acceptance_inactivity_hours),
            report_deadline: Duration::hours(self.report_deadline_hours),
            aggregation_deadline: Duration::hours(self.aggregation_deadline_hours),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// How often live views are recomputed and compared.
    pub drift_check_interval_secs: u64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            drift_check_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandThreshold {
    pub min_violations: u32,
    pub band: LegitimacyBand,
}

/// Parameters of the windowed violation-density policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegitimacyConfig {
    pub window_days: i64,
    pub thresholds: Vec<BandThreshold>,
    pub evaluate_interval_secs: u64,
}

impl Default for LegitimacyConfig {
    fn default() -> Self {
        let reference = WindowedThresholds::default();
        Self {
            window_days: reference.window.num_days(),
            thresholds: reference
                .thresholds
                .into_iter()
                .map(|(min_violations, band)| BandThreshold {
                    min_violations,
                    band,
                })
                .collect(),
            evaluate_interval_secs: 60,
        }
    }
}

impl LegitimacyConfig {
    pub fn policy(&self) -> WindowedThresholds {
        WindowedThresholds {
            window: Duration::days(self.window_days),
            thresholds: self
                .thresholds
                .iter()
                .map(|t| (t.min_violations, t.band))
                .collect(),
        }
    }
}

/// Who may write to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorsConfig {
    /// Accept any non-reserved actor id.
    pub open: bool,
    pub known: Vec<ActorId>,
}

impl Default for ActorsConfig {
    fn default() -> Self {
        Self {
            open: true,
            known: Vec::new(),
        }
    }
}

impl ActorsConfig {
    pub fn registry(&self) -> ActorRegistry {
        if self.open {
            ActorRegistry::permissive()
        } else {
            ActorRegistry::new(self.known.iter().cloned())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub enable_cors: bool,
    /// Bearer token for the halt endpoint. Without one the endpoint refuses
    /// every caller.
    pub halt_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8787)),
            enable_cors: true,
            halt_token: None,
            request_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_windows() {
        let config = SubstrateConfig::default();
        assert_eq!(config.timeouts.policy(), TimeoutPolicy::default());
        assert_eq!(config.legitimacy.policy().thresholds, WindowedThresholds::default().thresholds);
        assert_eq!(config.server.listen_addr.port(), 8787);
        assert!(config.ledger.data_dir.is_some());
        assert!(SubstrateConfig::in_memory().ledger.data_dir.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conclave.toml");
        std::fs::write(
            &path,
            "[timeouts]\nrouted_ttl_hours = 12\n\n[merkle]\nepoch_size = 8\n",
        )
        .unwrap();

        let config = SubstrateConfig::load(path.to_str()).unwrap();
        assert_eq!(config.timeouts.routed_ttl_hours, 12);
        assert_eq!(config.timeouts.acceptance_inactivity_hours, 24);
        assert_eq!(config.merkle.epoch_size, 8);
    }

    #[test]
    fn closed_registry_only_knows_listed_actors() {
        let actors = ActorsConfig {
            open: false,
            known: vec![ActorId::new("earl")],
        };
        let registry = actors.registry();
        assert!(registry.is_known(&ActorId::new("earl")));
        assert!(!registry.is_known(&ActorId::new("mallory")));
    }
}
