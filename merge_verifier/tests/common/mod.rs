use merge_verifier::client::{ClientError, ClientId, NodeClient};
use merge_verifier::data_points::DataPoint;
use merge_verifier::types::{ClientLayer, ClientType, MetricName};
use tokio::time::Instant;

/// A node whose chain grows with (paused) tokio time: one height every
/// `seconds_per_height` seconds since creation.
pub struct FakeClient {
    id: ClientId,
    started: Instant,
    seconds_per_height: u64,
    slots_per_epoch: u64,
    ttd: Option<u64>,
    value: u64,
    max_height: u64,
}

impl FakeClient {
    pub fn new(client_type: ClientType, index: usize) -> Self {
        Self {
            id: ClientId::new(client_type, index),
            started: Instant::now(),
            seconds_per_height: 1,
            slots_per_epoch: 2,
            ttd: None,
            value: 1,
            max_height: u64::MAX,
        }
    }

    /// The terminal height, reported once the chain has grown past it.
    pub fn with_ttd(mut self, ttd: u64) -> Self {
        self.ttd = Some(ttd);
        self
    }

    /// Every height measures `value`.
    pub fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    /// The chain stops growing at `max_height`.
    pub fn with_max_height(mut self, max_height: u64) -> Self {
        self.max_height = max_height;
        self
    }

    fn head(&self) -> u64 {
        (self.started.elapsed().as_secs() / self.seconds_per_height).min(self.max_height)
    }
}

impl NodeClient for FakeClient {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn data_point(
        &self,
        _metric: MetricName,
        height: u64,
    ) -> Result<Option<DataPoint>, ClientError> {
        let head = self.head();
        if height > head {
            return Err(ClientError::NotYetAvailable { height, head });
        }
        Ok(Some(DataPoint::Uint64(self.value)))
    }

    async fn latest_block_slot_number(&self) -> Result<u64, ClientError> {
        Ok(self.head())
    }

    async fn update_ttd_block_slot(&self) -> Result<Option<u64>, ClientError> {
        Ok(self.ttd_block_slot())
    }

    fn ttd_block_slot(&self) -> Option<u64> {
        self.ttd.filter(|&ttd| ttd <= self.head())
    }

    async fn ongoing_epoch(&self) -> Result<u64, ClientError> {
        match self.layer() {
            ClientLayer::Beacon => Ok(self.head() / self.slots_per_epoch),
            ClientLayer::Execution => Err(ClientError::Unsupported {
                operation: "epochs",
                layer: ClientLayer::Execution,
            }),
        }
    }

    fn epoch_for_slot(&self, slot: u64) -> Option<u64> {
        (self.layer() == ClientLayer::Beacon).then(|| slot / self.slots_per_epoch)
    }
}
