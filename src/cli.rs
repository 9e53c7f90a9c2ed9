//! CLI subcommands for one-shot operations
//!
//! Each command runs against the configured store and returns the text to
//! print; the binary decides how to exit. The repair audit log lives in the
//! daemon and is served at `GET /api/audit`.

use chrono::Utc;
use clap::Subcommand;

use crate::checker::Anomaly;
use crate::demo::seed_demo;
use crate::metrics::MetricsWindow;
use crate::service::RepairService;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one consistency pass and print the summary
    Pass,

    /// Detect anomalies without repairing them
    Check {
        /// Print anomalies as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the health report
    Report,

    /// Print the auto-assignment success rate
    Rate {
        /// Only count requests created in the last N hours
        #[arg(long)]
        window_hours: Option<u32>,
    },

    /// Load the demonstration data set into the store
    SeedDemo,
}

pub async fn execute_command(service: &RepairService, command: Commands) -> anyhow::Result<String> {
    match command {
        Commands::Pass => {
            let pass = service.scheduler().run_consistency_pass().await?;
            let mut output = format!(
                "Pass {}: found {}, repaired {}, skipped {}, failed {}",
                pass.pass_id, pass.anomalies_found, pass.repaired, pass.skipped, pass.failed
            );
            if pass.dry_run {
                output.push_str(" (dry run)");
            }
            for item in &pass.unrepairable {
                output.push_str(&format!("\n  unrepairable [{}] {}", item.kind, item.description));
            }
            Ok(output)
        }

        Commands::Check { json } => {
            let anomalies = service.scheduler().detect().await?;
            if json {
                return Ok(serde_json::to_string_pretty(&anomalies)?);
            }
            Ok(format_anomalies(&anomalies))
        }

        Commands::Report => Ok(service.scheduler().health_report().await?.to_string()),

        Commands::Rate { window_hours } => {
            let window = window_hours.map(|hours| MetricsWindow::last_hours(i64::from(hours)));
            let rate = service.metrics().auto_assignment_success_rate(window).await?;
            let scope = match window_hours {
                Some(hours) => format!("last {}h", hours),
                None => "all time".to_string(),
            };
            Ok(format!(
                "Auto-assignment success rate ({}): {}% ({} resolved / {} pending)",
                scope, rate.rate, rate.auto_resolved, rate.auto_pending
            ))
        }

        Commands::SeedDemo => {
            let seed = seed_demo(service.store().as_ref(), Utc::now()).await?;
            Ok(format!(
                "Seeded demo data: {} rows inserted, {} already present",
                seed.inserted, seed.existing
            ))
        }
    }
}

fn format_anomalies(anomalies: &[Anomaly]) -> String {
    if anomalies.is_empty() {
        return "No anomalies".to_string();
    }
    let mut output = format!("{} anomalies", anomalies.len());
    for anomaly in anomalies {
        output.push_str(&format!("\n  [{}] {}", anomaly.kind(), anomaly.describe()));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StoreBackend};

    fn memory_service() -> RepairService {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config.repair.retry_backoff_ms = 0;
        RepairService::open(config).unwrap()
    }

    #[tokio::test]
    async fn test_seed_check_pass_report() {
        let service = memory_service();

        let seeded = execute_command(&service, Commands::SeedDemo).await.unwrap();
        assert!(seeded.contains("rows inserted"));

        let check = execute_command(&service, Commands::Check { json: false }).await.unwrap();
        assert!(check.starts_with("5 anomalies"), "{}", check);

        let pass = execute_command(&service, Commands::Pass).await.unwrap();
        assert!(pass.contains("found 5, repaired 5"), "{}", pass);

        let check = execute_command(&service, Commands::Check { json: false }).await.unwrap();
        assert_eq!(check, "No anomalies");

        let report = execute_command(&service, Commands::Report).await.unwrap();
        assert!(report.contains("HEALTHY"), "{}", report);
    }

    #[tokio::test]
    async fn test_rate_output() {
        let service = memory_service();
        let output = execute_command(&service, Commands::Rate { window_hours: None })
            .await
            .unwrap();
        assert!(output.contains("0%"), "{}", output);
    }

    #[derive(clap::Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_subcommand_parsing() {
        use clap::Parser;

        let cli = TestCli::try_parse_from(["assignment-repair", "rate", "--window-hours", "6"]).unwrap();
        assert!(matches!(cli.command, Commands::Rate { window_hours: Some(6) }));

        let cli = TestCli::try_parse_from(["assignment-repair", "check", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Check { json: true }));

        // The audit log is only reachable through the daemon's API
        assert!(TestCli::try_parse_from(["assignment-repair", "audit"]).is_err());
    }

    #[tokio::test]
    async fn test_rate_with_huge_window() {
        let service = memory_service();
        let output = execute_command(&service, Commands::Rate { window_hours: Some(u32::MAX) })
            .await
            .unwrap();
        assert!(output.contains(&format!("last {}h", u32::MAX)), "{}", output);
    }
}
