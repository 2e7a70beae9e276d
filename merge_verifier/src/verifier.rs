//! Runs every probe concurrently, decides when to stop and reports the final
//! verdicts.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

use crate::client::{ClientId, NodeClient};
use crate::probe::{ProbeSet, ProbeSettings, ProbeStatus, VerificationProbe};
use crate::types::{ClientLayer, VerificationOutcome};
use crate::verification::Verifications;

/// Broadcast cancellation. Once triggered it stays triggered.
#[derive(Clone, Debug)]
pub struct StopSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Returns `true` only for the call that actually stopped the run.
    pub fn trigger(&self) -> bool {
        self.sender.send_if_modified(|stopped| !std::mem::replace(stopped, true))
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once [`StopSignal::trigger`] has been called.
    pub async fn stopped(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierError {
    #[error("zero verifications to perform")]
    NoVerifications,
    #[error(
        "at least one execution layer verification is required, otherwise the terminal block \
         can never be found"
    )]
    NoExecutionVerifications,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    /// Delay before the terminal epoch watchdog starts polling.
    pub ttd_grace: Duration,
    /// Epochs from genesis to wait for the terminal block. 0 disables.
    pub ttd_epoch_limit: u64,
    /// Epochs after the terminal epoch to wait for every verification to
    /// pass. 0 disables.
    pub verification_epoch_limit: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ttd_grace: Duration::from_secs(60),
            ttd_epoch_limit: 5,
            verification_epoch_limit: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    External,
    AllPassing,
    TtdTimeout,
    VerificationTimeout,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownReason::External => "received stop signal",
            ShutdownReason::AllPassing => "all verifications have succeeded",
            ShutdownReason::TtdTimeout => "timed out waiting for the terminal block",
            ShutdownReason::VerificationTimeout => "timed out waiting for verifications to pass",
        })
    }
}

/// Final verdict of one probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportEntry {
    pub client: ClientId,
    pub verification: String,
    /// `Err` if the verification could not be evaluated at all.
    pub outcome: Result<VerificationOutcome, String>,
}

impl ReportEntry {
    pub fn passed(&self) -> bool {
        matches!(&self.outcome, Ok(outcome) if outcome.success)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub reason: ShutdownReason,
    pub entries: Vec<ReportEntry>,
}

impl Report {
    pub fn all_passed(&self) -> bool {
        self.entries.iter().all(ReportEntry::passed)
    }
}

pub struct Verifier<C> {
    clients: Vec<Arc<C>>,
    probes: Vec<VerificationProbe<C>>,
    probe_set: ProbeSet,
    watchdogs: WatchdogConfig,
    stop: StopSignal,
}

impl<C: NodeClient> Verifier<C> {
    /// Creates one probe per verification and eligible client.
    pub fn new(
        clients: impl IntoIterator<Item = C>,
        verifications: &Verifications,
        settings: ProbeSettings,
        watchdogs: WatchdogConfig,
    ) -> Result<Self, VerifierError> {
        let clients: Vec<Arc<C>> = clients.into_iter().map(Arc::new).collect();
        let verifications: Vec<_> = verifications.iter().cloned().map(Arc::new).collect();

        let mut probes: Vec<VerificationProbe<C>> = clients
            .iter()
            .flat_map(|client| {
                verifications
                    .iter()
                    .filter(move |verification| verification.applies_to(client.id().client_type))
                    .map(move |verification| {
                        VerificationProbe::new(verification.clone(), client.clone(), settings)
                    })
            })
            .collect();
        if probes.is_empty() {
            return Err(VerifierError::NoVerifications);
        }

        let probe_set: ProbeSet = probes.iter().map(|probe| probe.status().clone()).collect();
        if probe_set.count_for_layer(ClientLayer::Execution) == 0 {
            return Err(VerifierError::NoExecutionVerifications);
        }
        for probe in &mut probes {
            probe.set_peers(probe_set.clone());
        }

        Ok(Self {
            clients,
            probes,
            probe_set,
            watchdogs,
            stop: StopSignal::new(),
        })
    }

    pub fn probe_set(&self) -> &ProbeSet {
        &self.probe_set
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs until `external_shutdown` resolves, every verification passes or
    /// a watchdog fires, then stops and joins every probe. Probes and
    /// watchdogs each run on their own task.
    pub async fn run(self, external_shutdown: impl Future<Output = ()>) -> Report {
        let Self {
            clients,
            probes,
            probe_set,
            watchdogs,
            stop,
        } = self;
        info!(probes = probes.len(), clients = clients.len(), "starting probes");

        let tasks: Vec<_> = probes
            .into_iter()
            .map(|probe| tokio::spawn(probe.run(stop.clone())))
            .collect();
        let beacons: Arc<[Arc<C>]> = clients
            .into_iter()
            .filter(|client| client.layer() == ClientLayer::Beacon)
            .collect();

        let mut watchdog_tasks = JoinSet::new();
        {
            let probe_set = probe_set.clone();
            watchdog_tasks.spawn(async move {
                all_passing(&probe_set, watchdogs.poll_interval).await;
                ShutdownReason::AllPassing
            });
        }
        if watchdogs.ttd_epoch_limit > 0 {
            let beacons = beacons.clone();
            watchdog_tasks.spawn(async move {
                ttd_epoch_timeout(&beacons, &watchdogs).await;
                ShutdownReason::TtdTimeout
            });
        }
        if watchdogs.verification_epoch_limit > 0 {
            let (beacons, probe_set) = (beacons.clone(), probe_set.clone());
            watchdog_tasks.spawn(async move {
                verification_epoch_timeout(&beacons, &probe_set, &watchdogs).await;
                ShutdownReason::VerificationTimeout
            });
        }

        let reason = tokio::select! {
            _ = external_shutdown => ShutdownReason::External,
            _ = stop.stopped() => ShutdownReason::External,
            reason = first_to_fire(&mut watchdog_tasks) => reason,
        };
        info!(%reason, "wrapping up");
        stop.trigger();
        watchdog_tasks.abort_all();

        let joined = join_all(tasks).await;
        wrap_up(reason, probe_set.iter().cloned().zip(joined))
    }
}

/// Evaluates and logs the final verdict of every probe.
pub fn wrap_up<C: NodeClient>(
    reason: ShutdownReason,
    probes: impl IntoIterator<Item = (Arc<ProbeStatus>, Result<VerificationProbe<C>, JoinError>)>,
) -> Report {
    let entries = probes
        .into_iter()
        .map(|(status, probe)| {
            let outcome = match probe {
                Ok(probe) => probe.evaluate().map_err(|e| e.to_string()),
                Err(e) => Err(format!("probe task failed: {e}")),
            };
            let entry = ReportEntry {
                client: status.client(),
                verification: status.verification().to_string(),
                outcome,
            };
            match &entry.outcome {
                Ok(outcome) if outcome.success => {
                    let line = outcome.render(&entry.verification);
                    info!(client = %entry.client, pass = true, "{line}")
                }
                Ok(outcome) => {
                    let line = outcome.render(&entry.verification);
                    error!(client = %entry.client, pass = false, "{line}")
                }
                Err(e) => error!(
                    client = %entry.client,
                    verification = %entry.verification,
                    error = %e,
                    "unable to perform verification"
                ),
            }
            entry
        })
        .collect();
    Report { reason, entries }
}

/// The reason given by the first watchdog to finish. A failed watchdog is
/// logged and the others keep running.
async fn first_to_fire(tasks: &mut JoinSet<ShutdownReason>) -> ShutdownReason {
    loop {
        match tasks.join_next().await {
            Some(Ok(reason)) => return reason,
            Some(Err(e)) => error!(error = %e, "watchdog failed"),
            None => std::future::pending().await,
        }
    }
}

async fn all_passing(probe_set: &ProbeSet, poll_interval: Duration) {
    loop {
        tokio::time::sleep(poll_interval).await;
        if probe_set.all_passing() {
            return;
        }
    }
}

/// Resolves once a beacon client reaches the epoch limit without having seen
/// the terminal slot. Never resolves after the terminal slot is known.
async fn ttd_epoch_timeout<C: NodeClient>(beacons: &[Arc<C>], config: &WatchdogConfig) {
    tokio::time::sleep(config.ttd_grace).await;
    loop {
        tokio::time::sleep(config.poll_interval).await;
        for client in beacons {
            if let Ok(Some(_)) = client.update_ttd_block_slot().await {
                return std::future::pending().await;
            }
            // Errors mean genesis has not happened yet.
            if let Ok(epoch) = client.ongoing_epoch().await {
                if epoch >= config.ttd_epoch_limit {
                    return;
                }
            }
        }
    }
}

/// Resolves once a beacon client is past its terminal epoch plus the limit
/// while some verification is still failing.
async fn verification_epoch_timeout<C: NodeClient>(
    beacons: &[Arc<C>],
    probe_set: &ProbeSet,
    config: &WatchdogConfig,
) {
    loop {
        tokio::time::sleep(config.poll_interval).await;
        for client in beacons {
            let Ok(Some(ttd_slot)) = client.update_ttd_block_slot().await else {
                continue;
            };
            let Some(ttd_epoch) = client.epoch_for_slot(ttd_slot) else {
                continue;
            };
            let Ok(epoch) = client.ongoing_epoch().await else {
                continue;
            };
            let deadline = ttd_epoch
                .saturating_add(config.verification_epoch_limit)
                .saturating_add(1);
            if epoch >= deadline && !probe_set.all_passing() {
                return;
            }
        }
    }
}
