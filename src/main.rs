use std::{future::Future, process, sync::Arc};

use cachet::{
    cache::{
        ArtifactState, CacheConfig, CacheService, CacheWarmer, PurgeScope,
        admin::{AdminState, build_admin_router},
        build_artifact_router,
    },
    config,
    infra::{error::InfraError, telemetry},
};
use tokio::{sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(args) => run_purge(settings, args).await,
        config::Command::Warm(_) => run_warm(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let cache_config = CacheConfig::from(&settings);
    let cache = Arc::new(CacheService::connect(cache_config.clone()).await?);
    let warmer = build_warmer(&settings)?.map(Arc::new);

    info!(
        target = "cachet::serve",
        backend = cache.fragments().backend_name(),
        page_root = %cache_config.page_root.display(),
        warmer = warmer.is_some(),
        "Serve configuration resolved"
    );

    let warm_handle = match warmer.as_ref() {
        Some(warmer) if !settings.warm.paths.is_empty() => {
            let warmer = Arc::clone(warmer);
            let paths = settings.warm.paths.clone();
            Some(tokio::spawn(async move {
                warmer.warm(&paths).await;
            }))
        }
        _ => None,
    };

    let public_router = build_artifact_router(ArtifactState {
        pages: Arc::clone(cache.pages()),
        policy: cache_config.policy.clone(),
    });
    let admin_router = build_admin_router(AdminState {
        cache: Arc::clone(&cache),
        warmer,
    });

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr).await?;

    info!(
        target = "cachet::serve",
        public_addr = %settings.server.public_addr,
        admin_addr = %settings.server.admin_addr,
        "Listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

    let servers = async { try_join!(public_server, admin_server) };
    tokio::pin!(servers);

    let finished = tokio::select! {
        result = &mut servers => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(result) => result.map(|_| ()),
        None => {
            info!(target = "cachet::serve", "Shutdown signal received");
            let _ = shutdown_tx.send(true);
            drain(servers, settings.server.graceful_shutdown).await
        }
    };

    if let Some(handle) = warm_handle {
        handle.abort();
        let _ = handle.await;
    }

    result.map_err(|err| InfraError::server(err.to_string()))
}

async fn drain<F>(servers: F, timeout: std::time::Duration) -> Result<(), std::io::Error>
where
    F: Future<Output = Result<((), ()), std::io::Error>>,
{
    match tokio::time::timeout(timeout, servers).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => {
            warn!(
                target = "cachet::serve",
                timeout_secs = timeout.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_purge(settings: config::Settings, args: config::PurgeArgs) -> Result<(), InfraError> {
    let scope = if args.all {
        PurgeScope::everything()
    } else {
        PurgeScope {
            fragment_prefix: args.fragment_prefix,
            path_prefix: args.path_prefix,
        }
    };
    if scope.is_empty() {
        return Err(InfraError::command(
            "purge requires --fragment-prefix, --path-prefix or --all",
        ));
    }

    let cache = CacheService::connect(CacheConfig::from(&settings)).await?;
    let report = cache.purge(&scope).await?;

    info!(
        target = "cachet::purge",
        fragment_prefix = ?scope.fragment_prefix,
        path_prefix = ?scope.path_prefix,
        fragments = ?report.fragments,
        artifacts = ?report.artifacts,
        "Purge completed"
    );
    Ok(())
}

async fn run_warm(settings: config::Settings) -> Result<(), InfraError> {
    let Some(warmer) = build_warmer(&settings)? else {
        return Err(InfraError::command(
            "warm requires warm.base_url (or --base-url)",
        ));
    };

    if settings.warm.paths.is_empty() {
        warn!(target = "cachet::warm", "No paths to warm");
        return Ok(());
    }

    let report = warmer.warm(&settings.warm.paths).await;

    if report.is_success() {
        Ok(())
    } else {
        Err(InfraError::command(format!(
            "{} of {} paths failed to warm",
            report.failed.len() + report.invalid.len(),
            report.requested + report.invalid.len()
        )))
    }
}

fn build_warmer(settings: &config::Settings) -> Result<Option<CacheWarmer>, InfraError> {
    settings
        .warm
        .base_url
        .as_ref()
        .map(|url| CacheWarmer::remote(url.as_str(), settings.warm.concurrency.get()))
        .transpose()
        .map_err(InfraError::from)
}
