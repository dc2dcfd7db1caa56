//! Compliance Guardian Agent entry point
//!
//! Continuous threshold monitoring with immediate rollback for critical
//! violations and time-bounded consultation for moderate ones.

use clap::{Parser, Subcommand};
use compliance_guardian::breaker::BreakerRegistry;
use compliance_guardian::client::{GuardianClient, HttpHealthSource};
use compliance_guardian::contracts::{GuardianConfig, Notification, ThresholdRule};
use compliance_guardian::engine::{
    ConsultationCoordinator, MetricsAggregator, MonitoringEngine, RollbackDecisionEngine,
    RollbackExecutor, ViolationClassifier,
};
use compliance_guardian::error::Result as GuardianResult;
use compliance_guardian::handler::{create_router, AppState};
use compliance_guardian::notify::{Notifier, NullNotifier, WebhookNotifier};
use compliance_guardian::telemetry::GuardianMetrics;
use compliance_guardian::{RollbackOutcome, RollbackPlan};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "compliance-guardian")]
#[command(about = "Compliance Guardian Agent - threshold monitoring and degraded-mode orchestration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring loop and HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8085", env = "PORT")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Path to guardian config file (JSON/YAML)
        #[arg(short, long)]
        config: String,
    },

    /// Run one sweep and print the report
    Sweep {
        /// Path to guardian config file (JSON/YAML)
        #[arg(short, long)]
        config: String,
    },

    /// Fetch the status snapshot from a running agent
    Status {
        /// Base URL of the agent
        #[arg(short, long, default_value = "http://127.0.0.1:8085")]
        url: String,
    },
}

/// On-disk configuration: runtime knobs plus the monitored surface
#[derive(Debug, Deserialize)]
struct GuardianFile {
    #[serde(default)]
    config: GuardianConfig,
    #[serde(default)]
    sources: Vec<SourceSpec>,
    #[serde(default)]
    rules: Vec<ThresholdRule>,
    /// Webhook that receives notification envelopes
    notify_webhook: Option<String>,
    /// Endpoint the rollback hook posts plans to
    rollback_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SourceSpec {
    id: String,
    endpoint: String,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    conservative_default: Option<f64>,
}

/// Posts accepted plans to the deployment infrastructure
struct HttpRollbackExecutor {
    endpoint: String,
    client: reqwest::Client,
}

impl RollbackExecutor for HttpRollbackExecutor {
    fn execute_rollback(
        &self,
        plan: RollbackPlan,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = GuardianResult<RollbackOutcome>> + Send>,
    > {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        Box::pin(async move {
            let response = client
                .post(&endpoint)
                .json(&plan)
                .timeout(Duration::from_millis(5000))
                .send()
                .await
                .map_err(|e| {
                    compliance_guardian::GuardianError::RollbackExecution {
                        attempts: 1,
                        last_error: e.to_string(),
                    }
                })?;

            if !response.status().is_success() {
                return Ok(RollbackOutcome {
                    success: false,
                    fallbacks_activated: Vec::new(),
                });
            }

            response.json().await.map_err(|e| {
                compliance_guardian::GuardianError::RollbackExecution {
                    attempts: 1,
                    last_error: format!("malformed rollback outcome: {}", e),
                }
            })
        })
    }
}

/// Accepts plans locally when no rollback endpoint is configured.
/// Useful for dry runs; always reports success.
struct LoggingRollbackExecutor;

impl RollbackExecutor for LoggingRollbackExecutor {
    fn execute_rollback(
        &self,
        plan: RollbackPlan,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = GuardianResult<RollbackOutcome>> + Send>,
    > {
        Box::pin(async move {
            tracing::warn!(plan_id = %plan.id, "no rollback endpoint configured, plan logged only");
            Ok(RollbackOutcome {
                success: true,
                fallbacks_activated: Vec::new(),
            })
        })
    }
}

fn load_file(path: &str) -> anyhow::Result<GuardianFile> {
    let content = std::fs::read_to_string(path)?;
    let file: GuardianFile = if path.ends_with(".yaml") || path.ends_with(".yml") {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    file.config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    Ok(file)
}

fn build_engine(file: GuardianFile) -> anyhow::Result<Arc<MonitoringEngine>> {
    let config = file.config.clone();

    let mut aggregator = MetricsAggregator::new(
        Duration::from_millis(config.health_check_timeout_ms),
        config.safe_floor_score,
    );
    for spec in &file.sources {
        let mut source = HttpHealthSource::new(&spec.id, &spec.endpoint);
        if let Some(default) = spec.conservative_default {
            source = source.with_conservative_default(default);
        }
        aggregator.register(Arc::new(source));
        if let Some(weight) = spec.weight {
            aggregator.set_weight(&spec.id, weight);
        }
    }

    let notifier: Arc<dyn Notifier> = match &file.notify_webhook {
        Some(endpoint) => Arc::new(WebhookNotifier::new(endpoint)),
        None => Arc::new(NullNotifier),
    };

    let executor: Arc<dyn RollbackExecutor> = match &file.rollback_endpoint {
        Some(endpoint) => Arc::new(HttpRollbackExecutor {
            endpoint: endpoint.clone(),
            client: reqwest::Client::new(),
        }),
        None => Arc::new(LoggingRollbackExecutor),
    };

    let metrics = Arc::new(GuardianMetrics::new()?);

    let coordinator = Arc::new(ConsultationCoordinator::new(
        config.quorum_fraction,
        config.approval_threshold,
    ));

    let decision = Arc::new(RollbackDecisionEngine::new(
        executor,
        Arc::clone(&notifier),
        Arc::clone(&coordinator),
        Arc::clone(&metrics),
        config.clone(),
    ));

    let breakers = Arc::new(BreakerRegistry::with_parts(
        config.clone(),
        Arc::new(compliance_guardian::breaker::InvariantFallbackGenerator::new()),
        Arc::clone(&notifier),
        Arc::clone(&metrics),
    ));

    Ok(Arc::new(MonitoringEngine::new(
        aggregator,
        ViolationClassifier::new(file.rules),
        decision,
        coordinator,
        breakers,
        notifier,
        metrics,
        config,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host, config } => {
            let file = load_file(&config)?;
            let engine = build_engine(file)?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let loop_engine = Arc::clone(&engine);
            let monitor = tokio::spawn(loop_engine.run(shutdown_rx));

            let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
            let state = Arc::new(AppState { engine });
            let router = create_router(state);

            tracing::info!("Starting Compliance Guardian Agent on {}", addr);
            tracing::info!(
                "Agent ID: {}, Version: {}",
                Notification::AGENT_ID,
                Notification::AGENT_VERSION
            );

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;

            let _ = shutdown_tx.send(true);
            let _ = monitor.await;
        }

        Commands::Sweep { config } => {
            let file = load_file(&config)?;
            let engine = build_engine(file)?;

            let report = engine.sweep().await;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if report.critical_count > 0 {
                std::process::exit(1);
            }
        }

        Commands::Status { url } => {
            let client = GuardianClient::new(url);
            let snapshot = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}
