use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::try_join_all;
use merge_verifier::client::{Client, ClientEndpoint, ConnectOptions, TtdTimestamp};
use merge_verifier::env::load_dotenvy_vars_if_present;
use merge_verifier::probe::ProbeSettings;
use merge_verifier::verification::Verifications;
use merge_verifier::verifier::{Verifier, WatchdogConfig};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[path = "merge_verifier/cli.rs"]
mod cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    load_dotenvy_vars_if_present();
    merge_verifier::tracing::init();

    let args = cli::Cli::parse();

    let verifications = Verifications::load(
        args.override_verifications.as_deref(),
        &args.extra_verifications,
    )?;
    info!(verifications = ?verifications.names(), "loaded verifications");

    let options = ConnectOptions {
        ttd: args.ttd,
        call_timeout: Duration::from_secs(args.call_timeout),
        ttd_timestamp: TtdTimestamp::default(),
    };
    let ids = ClientEndpoint::assign_ids(&args.clients);
    let clients = try_join_all(ids.into_iter().zip(&args.clients).map(|(id, endpoint)| {
        let options = &options;
        async move {
            Client::connect(id, endpoint.url.clone(), options)
                .await
                .with_context(|| format!("couldn't connect to {id} at {}", endpoint.url))
        }
    }))
    .await?;

    let settings = ProbeSettings {
        retry_window: args.retry_window,
        backfill_threshold: args.backfill_threshold,
        check_delay: args.check_delay.map(Duration::from_secs),
    };
    let watchdogs = WatchdogConfig {
        ttd_epoch_limit: args.ttd_epoch_limit,
        verification_epoch_limit: args.verif_epoch_limit,
        ..WatchdogConfig::default()
    };
    let verifier = Verifier::new(clients, &verifications, settings, watchdogs)
        .context("couldn't set up verification probes")?;

    let report = verifier.run(shutdown_signal()).await;
    if report.all_passed() {
        info!(reason = %report.reason, "all verifications passed");
        Ok(ExitCode::SUCCESS)
    } else {
        let failed = report.entries.iter().filter(|entry| !entry.passed()).count();
        error!(reason = %report.reason, failed, "verifications failed");
        Ok(ExitCode::FAILURE)
    }
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        error!("couldn't install signal handlers, falling back to ctrl-c");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
