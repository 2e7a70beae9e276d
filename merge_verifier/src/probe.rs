//! One verification bound to one client, polled on its own task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ClientId, NodeClient};
use crate::data_points::DataPoints;
use crate::types::{ClientLayer, VerificationOutcome};
use crate::verification::{Verification, VerificationError};
use crate::verifier::StopSignal;

/// Tuning shared by every probe of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeSettings {
    /// A height that still fails once the head is more than this many
    /// heights ahead is skipped for good.
    pub retry_window: u64,
    /// A gap to the head larger than this puts the probe in backfill.
    pub backfill_threshold: u64,
    /// Overrides every rule's `check_delay_seconds` when set.
    pub check_delay: Option<Duration>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            retry_window: 5,
            backfill_threshold: 10,
            check_delay: None,
        }
    }
}

/// The part of a probe other tasks may read while it runs.
#[derive(Debug)]
pub struct ProbeStatus {
    client: ClientId,
    verification: String,
    layer: ClientLayer,
    outcome: RwLock<Option<VerificationOutcome>>,
    syncing: AtomicBool,
}

impl ProbeStatus {
    fn new(client: ClientId, verification: &Verification) -> Self {
        Self {
            client,
            verification: verification.name.clone(),
            layer: verification.layer,
            outcome: RwLock::new(None),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn verification(&self) -> &str {
        &self.verification
    }

    pub fn layer(&self) -> ClientLayer {
        self.layer
    }

    /// The outcome cached by the last tick that was not backfilling.
    pub fn outcome(&self) -> Option<VerificationOutcome> {
        self.outcome.read().clone()
    }

    pub fn is_passing(&self) -> bool {
        self.outcome
            .read()
            .as_ref()
            .is_some_and(|outcome| outcome.success)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    fn set_outcome(&self, outcome: VerificationOutcome) {
        *self.outcome.write() = Some(outcome);
    }

    fn set_syncing(&self, syncing: bool) {
        self.syncing.store(syncing, Ordering::Release);
    }
}

/// Every probe of a run, in creation order.
#[derive(Clone, Debug, Default)]
pub struct ProbeSet(Arc<[Arc<ProbeStatus>]>);

impl ProbeSet {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProbeStatus>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn any_syncing(&self) -> bool {
        self.iter().any(|status| status.is_syncing())
    }

    /// `false` for an empty set.
    pub fn all_passing(&self) -> bool {
        !self.is_empty() && self.iter().all(|status| status.is_passing())
    }

    pub fn count_for_layer(&self, layer: ClientLayer) -> usize {
        self.iter().filter(|status| status.layer() == layer).count()
    }

    /// Whether no probe of `client` is backfilling.
    pub fn client_synced(&self, client: ClientId) -> bool {
        !self
            .iter()
            .any(|status| status.client() == client && status.is_syncing())
    }
}

impl FromIterator<Arc<ProbeStatus>> for ProbeSet {
    fn from_iter<I: IntoIterator<Item = Arc<ProbeStatus>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub struct VerificationProbe<C> {
    verification: Arc<Verification>,
    client: Arc<C>,
    settings: ProbeSettings,
    /// Lowest height not yet attempted; the high-water mark is one below.
    next_height: u64,
    /// Head that started the current backfill.
    backfill_target: Option<u64>,
    data_points: DataPoints,
    status: Arc<ProbeStatus>,
    peers: ProbeSet,
}

impl<C: NodeClient> VerificationProbe<C> {
    pub fn new(verification: Arc<Verification>, client: Arc<C>, settings: ProbeSettings) -> Self {
        let status = Arc::new(ProbeStatus::new(client.id(), &verification));
        Self {
            verification,
            client,
            settings,
            next_height: 0,
            backfill_target: None,
            data_points: DataPoints::new(),
            status,
            peers: ProbeSet::default(),
        }
    }

    /// Lets the probe tell when its whole client has caught up.
    pub fn set_peers(&mut self, peers: ProbeSet) {
        self.peers = peers;
    }

    pub fn status(&self) -> &Arc<ProbeStatus> {
        &self.status
    }

    pub fn verification(&self) -> &Verification {
        &self.verification
    }

    pub fn client_id(&self) -> ClientId {
        self.status.client
    }

    pub fn data_points(&self) -> &DataPoints {
        &self.data_points
    }

    /// Highest height already attempted, if any.
    pub fn high_water_mark(&self) -> Option<u64> {
        self.next_height.checked_sub(1)
    }

    pub fn is_backfilling(&self) -> bool {
        self.backfill_target.is_some()
    }

    pub fn evaluate(&self) -> Result<VerificationOutcome, VerificationError> {
        self.verification.evaluate(&self.data_points)
    }

    /// Collects every height up to the client's head and, unless
    /// backfilling, refreshes the cached outcome.
    pub async fn tick(&mut self) -> Result<(), ClientError> {
        if self.verification.post_merge {
            let Some(ttd) = self.client.update_ttd_block_slot().await? else {
                return Ok(());
            };
            if ttd >= self.next_height {
                self.next_height = ttd;
            }
        }

        let head = self.client.latest_block_slot_number().await?;
        self.collect_until(head).await;

        if !self.is_backfilling() {
            self.refresh_outcome();
        }
        Ok(())
    }

    async fn collect_until(&mut self, head: u64) {
        if self.backfill_target.is_none()
            && head.saturating_sub(self.next_height) > self.settings.backfill_threshold
        {
            info!(
                client = %self.client_id(),
                verification = %self.verification.name,
                from = self.next_height,
                head,
                "backfilling"
            );
            self.backfill_target = Some(head);
            self.status.set_syncing(true);
        }

        while self.next_height <= head {
            let height = self.next_height;
            match self.client.data_point(self.verification.metric, height).await {
                Ok(Some(point)) => {
                    self.data_points.insert(height, point);
                }
                Ok(None) => {}
                Err(error) if head - height > self.settings.retry_window => {
                    debug!(
                        client = %self.client_id(),
                        verification = %self.verification.name,
                        height,
                        %error,
                        "skipping height"
                    );
                }
                Err(error) => {
                    debug!(
                        client = %self.client_id(),
                        verification = %self.verification.name,
                        height,
                        %error,
                        "will retry"
                    );
                    break;
                }
            }
            self.next_height = height + 1;
        }

        if let Some(target) = self.backfill_target {
            if self.next_height > target {
                self.backfill_target = None;
                self.status.set_syncing(false);
                info!(
                    client = %self.client_id(),
                    verification = %self.verification.name,
                    "backfill complete"
                );
                if self.peers.client_synced(self.client_id()) {
                    info!(client = %self.client_id(), "client synced");
                }
            }
        }
    }

    fn refresh_outcome(&self) {
        let outcome = self.evaluate().unwrap_or_else(|error| VerificationOutcome {
            success: false,
            message: error.to_string(),
        });
        self.status.set_outcome(outcome);
    }

    /// Ticks every `check_delay` until `stop` fires, then hands the probe
    /// back for a final evaluation.
    pub async fn run(mut self, stop: StopSignal) -> Self {
        let delay = self
            .settings
            .check_delay
            .unwrap_or_else(|| self.verification.check_delay());
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            tokio::select! {
                _ = stop.stopped() => break,
                result = self.tick() => {
                    if let Err(error) = result {
                        warn!(
                            client = %self.client_id(),
                            verification = %self.verification.name,
                            %error,
                            "probe tick failed"
                        );
                    }
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::sync::atomic::AtomicU64;

    use parking_lot::Mutex;

    use super::*;
    use crate::data_points::DataPoint;
    use crate::types::{AggregateFunction, ClientType, MetricName, PassCriteria};

    /// A client whose head, terminal height and data are set by the test.
    #[derive(Default)]
    struct ScriptedClient {
        head: AtomicU64,
        ttd: Mutex<Option<u64>>,
        values: Mutex<BTreeMap<u64, u64>>,
        /// Heights that fail as if not imported yet.
        missing: Mutex<Vec<u64>>,
        requested: Mutex<Vec<u64>>,
    }

    impl ScriptedClient {
        fn with_values(values: impl IntoIterator<Item = (u64, u64)>) -> Self {
            let client = Self::default();
            client.values.lock().extend(values);
            client
        }

        fn set_head(&self, head: u64) {
            self.head.store(head, Ordering::SeqCst);
        }
    }

    impl NodeClient for ScriptedClient {
        fn id(&self) -> ClientId {
            ClientId::new(ClientType::Geth, 0)
        }

        async fn data_point(
            &self,
            _metric: MetricName,
            height: u64,
        ) -> Result<Option<DataPoint>, ClientError> {
            self.requested.lock().push(height);
            if self.missing.lock().contains(&height) {
                return Err(ClientError::NotFound(format!("block {height}")));
            }
            Ok(Some(DataPoint::from(
                self.values.lock().get(&height).copied().unwrap_or(1),
            )))
        }

        async fn latest_block_slot_number(&self) -> Result<u64, ClientError> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn update_ttd_block_slot(&self) -> Result<Option<u64>, ClientError> {
            Ok(*self.ttd.lock())
        }

        fn ttd_block_slot(&self) -> Option<u64> {
            *self.ttd.lock()
        }

        async fn ongoing_epoch(&self) -> Result<u64, ClientError> {
            Ok(0)
        }

        fn epoch_for_slot(&self, _slot: u64) -> Option<u64> {
            None
        }
    }

    /// Never answers a data request.
    struct StuckClient;

    impl NodeClient for StuckClient {
        fn id(&self) -> ClientId {
            ClientId::new(ClientType::Besu, 0)
        }

        fn data_point(
            &self,
            _metric: MetricName,
            _height: u64,
        ) -> impl Future<Output = Result<Option<DataPoint>, ClientError>> + Send {
            std::future::pending()
        }

        async fn latest_block_slot_number(&self) -> Result<u64, ClientError> {
            Ok(100)
        }

        async fn update_ttd_block_slot(&self) -> Result<Option<u64>, ClientError> {
            Ok(None)
        }

        fn ttd_block_slot(&self) -> Option<u64> {
            None
        }

        async fn ongoing_epoch(&self) -> Result<u64, ClientError> {
            Ok(0)
        }

        fn epoch_for_slot(&self, _slot: u64) -> Option<u64> {
            None
        }
    }

    fn block_count(post_merge: bool) -> Arc<Verification> {
        Arc::new(Verification {
            name: "blocks".into(),
            layer: ClientLayer::Execution,
            post_merge,
            check_delay_seconds: 1,
            metric: MetricName::BlockCount,
            aggregate_function: AggregateFunction::Count,
            aggregate_function_value: None,
            pass_criteria: PassCriteria::MinimumValue,
            pass_value: "1".into(),
        })
    }

    fn probe<C: NodeClient>(
        verification: Arc<Verification>,
        client: &Arc<C>,
    ) -> VerificationProbe<C> {
        VerificationProbe::new(verification, client.clone(), ProbeSettings::default())
    }

    #[tokio::test]
    async fn collects_every_height_up_to_head() {
        let client = Arc::new(ScriptedClient::with_values([(1, 0)]));
        client.set_head(3);
        let mut probe = probe(block_count(false), &client);

        probe.tick().await.unwrap();
        assert_eq!(probe.data_points().heights().collect::<Vec<_>>(), [0, 1, 2, 3]);
        assert_eq!(probe.high_water_mark(), Some(3));
        assert_eq!(
            probe.status().outcome(),
            Some(VerificationOutcome {
                success: true,
                message: "3 >= 1".into()
            })
        );

        client.set_head(5);
        probe.tick().await.unwrap();
        assert_eq!(*client.requested.lock(), [0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn post_merge_probe_waits_then_jumps_to_terminal_height() {
        let client = Arc::new(ScriptedClient::default());
        client.set_head(8);
        let mut probe = probe(block_count(true), &client);

        for _ in 0..3 {
            probe.tick().await.unwrap();
        }
        assert!(probe.data_points().is_empty());
        assert_eq!(probe.high_water_mark(), None);
        assert!(client.requested.lock().is_empty());

        *client.ttd.lock() = Some(6);
        probe.tick().await.unwrap();
        assert_eq!(*client.requested.lock(), [6, 7, 8]);
        assert_eq!(probe.data_points().heights().next(), Some(6));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_without_moving_backwards() {
        let client = Arc::new(ScriptedClient::default());
        client.missing.lock().push(4);
        client.set_head(6);
        let mut probe = probe(block_count(false), &client);

        probe.tick().await.unwrap();
        // 4 is within the retry window of head 6: stop and retry later.
        assert_eq!(probe.high_water_mark(), Some(3));

        client.set_head(7);
        probe.tick().await.unwrap();
        assert_eq!(probe.high_water_mark(), Some(3));

        client.missing.lock().clear();
        probe.tick().await.unwrap();
        assert_eq!(probe.high_water_mark(), Some(7));
        assert!(probe.data_points().contains(4));
    }

    #[tokio::test]
    async fn heights_outside_the_retry_window_are_skipped() {
        let client = Arc::new(ScriptedClient::default());
        client.missing.lock().extend([2, 9]);
        client.set_head(9);
        let mut probe = probe(block_count(false), &client);

        probe.tick().await.unwrap();
        // 9 - 2 > 5: gone for good. 9 is the head itself: retried.
        assert!(!probe.data_points().contains(2));
        assert_eq!(probe.high_water_mark(), Some(8));
        assert_eq!(probe.data_points().len(), 8);
    }

    #[tokio::test]
    async fn large_gaps_mark_the_probe_as_backfilling() {
        let client = Arc::new(ScriptedClient::default());
        client.missing.lock().push(18);
        client.set_head(20);
        let mut probe = probe(block_count(false), &client);

        probe.tick().await.unwrap();
        assert!(probe.is_backfilling());
        assert!(probe.status().is_syncing());
        // No evaluation while catching up.
        assert_eq!(probe.status().outcome(), None);

        client.missing.lock().clear();
        probe.tick().await.unwrap();
        assert!(!probe.is_backfilling());
        assert!(!probe.status().is_syncing());
        assert!(probe.status().is_passing());
    }

    #[tokio::test]
    async fn evaluation_errors_are_cached_as_failures() {
        let client = Arc::new(ScriptedClient::default());
        let mut verification = (*block_count(false)).clone();
        verification.pass_value = "many".into();
        let mut probe = probe(Arc::new(verification), &client);

        probe.tick().await.unwrap();
        let outcome = probe.status().outcome().unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("many"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_blocked_tick() {
        let client = Arc::new(StuckClient);
        let probe = probe(block_count(false), &client);
        let stop = StopSignal::new();
        let task = tokio::spawn(probe.run(stop.clone()));

        // Let the first tick start and block on the client.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!task.is_finished());

        stop.trigger();
        let probe = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("probe observes the stop signal")
            .unwrap();
        assert_eq!(probe.high_water_mark(), None);
    }

    #[test]
    fn probe_set_predicates() {
        let verification = block_count(false);
        let geth = ClientId::new(ClientType::Geth, 0);
        let teku = ClientId::new(ClientType::Teku, 0);
        let beacon = Arc::new(Verification {
            layer: ClientLayer::Beacon,
            metric: MetricName::SlotBlock,
            ..(*verification).clone()
        });
        let statuses = [
            Arc::new(ProbeStatus::new(geth, &verification)),
            Arc::new(ProbeStatus::new(geth, &verification)),
            Arc::new(ProbeStatus::new(teku, &beacon)),
        ];
        let set: ProbeSet = statuses.iter().cloned().collect();

        assert_eq!(set.count_for_layer(ClientLayer::Execution), 2);
        assert_eq!(set.count_for_layer(ClientLayer::Beacon), 1);
        assert!(!set.all_passing());
        assert!(!ProbeSet::default().all_passing());

        let pass = VerificationOutcome {
            success: true,
            message: "1 >= 1".into(),
        };
        for status in &statuses {
            status.set_outcome(pass.clone());
        }
        assert!(set.all_passing());

        statuses[1].set_syncing(true);
        assert!(set.any_syncing());
        assert!(!set.client_synced(geth));
        assert!(set.client_synced(teku));
    }
}
