//! Command line and operator commands.

use clap::{Parser, Subcommand};
use conclave_kernel_projection::ProjectionName;
use conclave_substrate::{Substrate, SubstrateConfig};
use conclave_types::{ActorId, EventId};
use serde_json::Value;

use crate::error::{DaemonError, DaemonResult};

/// Conclave daemon CLI
#[derive(Debug, Parser)]
#[command(name = "conclaved")]
#[command(about = "Conclave daemon - constitutional event substrate", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONCLAVE_CONFIG", global = true)]
    pub config: Option<String>,

    /// Listen address, overriding the configuration
    #[arg(short, long, env = "CONCLAVE_LISTEN_ADDR", global = true)]
    pub listen: Option<String>,

    /// Log level, overriding the configuration
    #[arg(long, env = "CONCLAVE_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "CONCLAVE_LOG_JSON", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API and the background loops (default)
    Serve,
    /// Print the whole ledger as a JSON array
    Export,
    /// Re-verify the hash chain from genesis
    Verify,
    /// Print the inclusion proof of one event
    Prove { event_id: String },
    /// Rebuild one projection from the ledger
    Rebuild { projection: String },
    /// Clear an integrity lock after the storage has been repaired
    ClearLock {
        #[arg(long)]
        operator: String,
    },
}

impl Cli {
    /// Apply CLI overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut SubstrateConfig) -> DaemonResult<()> {
        if let Some(listen) = &self.listen {
            config.server.listen_addr = listen
                .parse()
                .map_err(|e| DaemonError::Config(format!("Invalid listen address: {}", e)))?;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json {
            config.logging.json = true;
        }
        Ok(())
    }
}

/// Run one operator command against an opened substrate and return what to
/// print.
pub async fn run_operator(substrate: &Substrate, command: &Command) -> DaemonResult<Value> {
    let output = match command {
        Command::Serve => {
            return Err(DaemonError::Config("serve is not an operator command".into()))
        }
        Command::Export => serde_json::to_value(substrate.export().await?),
        Command::Verify => serde_json::to_value(substrate.verify().await?),
        Command::Prove { event_id } => {
            let event_id: EventId = event_id
                .parse()
                .map_err(|e| DaemonError::Config(format!("Invalid event id {event_id}: {e}")))?;
            substrate.merkle().catch_up().await.map_err(to_daemon)?;
            serde_json::to_value(substrate.prove(&event_id).await?)
        }
        Command::Rebuild { projection } => {
            let name: ProjectionName = projection.parse().map_err(to_daemon)?;
            serde_json::to_value(substrate.rebuild(name).await?)
        }
        Command::ClearLock { operator } => {
            let operator = ActorId::new(operator.as_str());
            serde_json::to_value(substrate.clear_integrity_lock(&operator).await?)
        }
    };
    output.map_err(|e| DaemonError::Server(format!("Unable to render output: {e}")))
}

fn to_daemon(e: impl Into<conclave_substrate::SubstrateError>) -> DaemonError {
    DaemonError::Substrate(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_kernel_chain::EnvelopeDraft;
    use conclave_types::{Branch, EventKind, TaskVerb};
    use serde_json::json;

    #[test]
    fn serve_is_the_default_and_flags_override_config() {
        let cli = Cli::try_parse_from(["conclaved", "--listen", "0.0.0.0:9000", "--json"]).unwrap();
        assert!(cli.command.is_none());

        let mut config = SubstrateConfig::default();
        cli.apply(&mut config).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert!(config.logging.json);
    }

    #[test]
    fn bad_listen_address_is_a_config_error() {
        let cli = Cli::try_parse_from(["conclaved", "--listen", "nowhere"]).unwrap();
        let mut config = SubstrateConfig::default();
        assert!(matches!(cli.apply(&mut config), Err(DaemonError::Config(_))));
    }

    #[test]
    fn clear_lock_requires_an_operator() {
        assert!(Cli::try_parse_from(["conclaved", "clear-lock"]).is_err());
        let cli = Cli::try_parse_from(["conclaved", "clear-lock", "--operator", "custodian"]).unwrap();
        assert!(matches!(cli.command, Some(Command::ClearLock { .. })));
    }

    #[tokio::test]
    async fn operator_commands_read_the_ledger() {
        let substrate = Substrate::open(SubstrateConfig::in_memory()).await.unwrap();
        substrate
            .append(EnvelopeDraft::new(
                EventKind::Task {
                    branch: Branch::Executive,
                    verb: TaskVerb::Authorized,
                },
                ActorId::new("earl-1"),
                json!({ "task_id": "T1" }),
            ))
            .await
            .unwrap();

        let exported = run_operator(&substrate, &Command::Export).await.unwrap();
        assert_eq!(exported.as_array().map(Vec::len), Some(2));

        let summary = run_operator(&substrate, &Command::Verify).await.unwrap();
        assert_eq!(summary["length"], 2);

        let rebuilt = run_operator(
            &substrate,
            &Command::Rebuild {
                projection: "tasks".into(),
            },
        )
        .await
        .unwrap();
        assert!(rebuilt.is_object());

        assert!(run_operator(
            &substrate,
            &Command::Rebuild {
                projection: "nonsense".into()
            }
        )
        .await
        .is_err());
        assert!(run_operator(&substrate, &Command::ClearLock { operator: "custodian".into() })
            .await
            .is_err());
    }
}
