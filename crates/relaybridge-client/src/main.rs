//! relaybridge binary: parse flags, load configuration, wire the
//! collaborators, run the supervisor until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaybridge_client::config::Config;
use relaybridge_client::error::ClientError;
use relaybridge_client::expose::{self, ExposeState};
use relaybridge_client::health::{self, HealthRegistry};
use relaybridge_client::supervisor::{Supervisor, SupervisorOptions};
use relaybridge_client::tunnel::TunnelManager;
use relaybridge_client::{Cli, metrics};
use relaybridge_transport::{
    CircuitBreaker, CircuitBreakerConfig, ProtocolSelector, RateLimiter, TransportPolicy,
};

fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relaybridge: {e}");
            std::process::exit(2);
        }
    };
    cli.apply(&mut config);

    if let Err(e) = init_tracing(&config) {
        eprintln!("relaybridge: {e}");
        std::process::exit(2);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            info!("clean shutdown");
        }
        Err(e) => {
            let code = e
                .downcast_ref::<ClientError>()
                .map_or(1, ClientError::exit_code);
            error!("{e:#}");
            std::process::exit(code);
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    // One process-wide rustls provider; transports build their own configs
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let prometheus = metrics::install()?;

    let selector = Arc::new(ProtocolSelector::new(TransportPolicy::default()));
    let breaker = Arc::new(CircuitBreaker::new(
        "relay",
        CircuitBreakerConfig::default(),
    ));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.to_config()));
    let options = SupervisorOptions::from_config(&config);
    let tunnels = TunnelManager::new(options.request_timeout);
    let registry = HealthRegistry::new(config.health_check_interval(), Duration::from_secs(10));

    let mut supervisor = Supervisor::new(
        config.clone(),
        options,
        Arc::clone(&selector),
        Arc::clone(&breaker),
        Arc::clone(&limiter),
        tunnels.clone(),
    )
    .context("wiring supervisor")?;

    let cancel = supervisor.cancellation_token();
    let established = supervisor.established_watch();

    health::register_builtin_checks(
        &registry,
        established.clone(),
        tunnels.clone(),
        config.metrics.enabled.then_some(config.metrics.port),
    );
    let health_task = registry.spawn(cancel.clone());
    let janitor_task = limiter.spawn_janitor(cancel.clone());

    let expose_task = if config.metrics.enabled {
        let state = ExposeState {
            prometheus,
            health: registry.clone(),
            established,
        };
        let metrics_config = config.metrics.clone();
        let health_config = config.health.clone();
        let expose_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) =
                expose::serve(state, &metrics_config, &health_config, expose_cancel).await
            {
                error!("exposition server failed: {e}");
            }
        }))
    } else {
        None
    };

    // Termination signal triggers the same graceful path as close()
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("termination signal received");
            signal_cancel.cancel();
        }
    });

    let result = supervisor.run().await;

    cancel.cancel();
    let _ = health_task.await;
    let _ = janitor_task.await;
    if let Some(task) = expose_task {
        let _ = task.await;
    }

    result.map_err(Into::into)
}

fn init_tracing(config: &Config) -> Result<(), ClientError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match (&config.logging.file, config.logging.format.as_str()) {
        (Some(path), format) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().ok_or_else(|| {
                ClientError::Config(format!("logging.file {:?} has no file name", path))
            })?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let builder = builder.with_writer(appender).with_ansi(false);
            if format == "json" {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        (None, "json") => builder.json().try_init(),
        (None, _) => builder.try_init(),
    };
    result.map_err(|e| ClientError::Config(format!("logging: {e}")))
}
