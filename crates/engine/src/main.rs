//! Sweeper binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::process::ExitCode;
use std::sync::Arc;
use sweeper_cloud::{AwsIdentity, IdentityApi};
use sweeper_core::{AppConfig, FilterRules};
use sweeper_engine::diagnostics::{self, DiagnosticsState};
use sweeper_engine::{EngineMetrics, Pipeline, PipelineDeps, discover_accounts};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sweeper - audit and remediate object encryption and ACLs across an organization
#[derive(Parser, Debug)]
#[command(name = "sweeperd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "SWEEPER_CONFIG", default_value = "config.toml")]
    config: String,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if args.dump_config {
        let rendered = toml::to_string_pretty(&AppConfig::default())
            .context("failed to render default configuration")?;
        println!("{rendered}");
        return Ok(ExitCode::SUCCESS);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Sweeper v{}", env!("CARGO_PKG_VERSION"));

    // The file is optional; every setting has a default and env vars override.
    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!(config_path = %args.config, "No config file found, using defaults");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("SWEEPER_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    tracing::info!(
        mode = config.run_mode().as_str(),
        org = config.scope.check_org_accounts,
        one_bucket = config.scope.one_bucket,
        delete = config.danger.delete_allowed(),
        force_acl = config.danger.force_acl_allowed(),
        reencrypt = config.danger.reencrypt_allowed(),
        "Configuration loaded"
    );

    let metrics = Arc::new(EngineMetrics::new().context("failed to create metrics registry")?);

    let ledger = sweeper_ledger::from_config(&config.ledger)
        .await
        .context("failed to open idempotency ledger")?;

    let identity: Arc<dyn IdentityApi> = Arc::new(
        AwsIdentity::new(&config.aws)
            .await
            .context("failed to initialize AWS clients")?,
    );

    let rules = FilterRules::load(config.audit.filter_file.as_deref());
    tracing::info!(rules = rules.len(), "Loaded filter rules");

    let listen = config.diagnostics.listen.clone().filter(|l| !l.is_empty());
    let scope = config.scope.clone();
    let deps = PipelineDeps::new(config, identity.clone(), ledger, rules, metrics.clone())
        .context("failed to build pipeline")?;
    let pipeline = Pipeline::new(deps);

    let shutdown = pipeline.cancellation_token();
    let diagnostics = listen.map(|listen| {
        let state = DiagnosticsState {
            metrics: metrics.clone(),
            tracker: pipeline.tracker(),
        };
        tokio::spawn(diagnostics::serve(listen, state, shutdown.clone()))
    });

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping run");
                shutdown.cancel();
            }
        });
    }

    let result = match discover_accounts(identity.as_ref(), &scope).await {
        Ok(seed) => pipeline.run(seed).await,
        Err(e) => Err(e),
    };
    shutdown.cancel();
    if let Some(handle) = diagnostics {
        let _ = handle.await;
    }

    match result {
        Ok(summary) => {
            summary.log();
            tracing::info!("Run complete");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_fatal() => {
            metrics.summary().log();
            tracing::error!(error = %e, "Run aborted");
            Ok(ExitCode::from(e.exit_code()))
        }
        Err(e) => {
            metrics.summary().log();
            Err(e).context("run failed")
        }
    }
}
