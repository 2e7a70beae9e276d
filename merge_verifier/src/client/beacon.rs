//! Beacon node driver over the standard REST API, plus the lighthouse
//! `validator_inclusion` extension for epoch performance.

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::B256;
use alloy::transports::http::reqwest::{self, header::ACCEPT, StatusCode, Url};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::{with_timeout, ClientError, ClientId, ConnectOptions, NodeClient, TtdTimestamp};
use crate::data_points::DataPoint;
use crate::quoted_u64;
use crate::types::MetricName;

/// Wall clock used to derive the ongoing slot.
#[cfg_attr(test, mockall::automock)]
pub trait SlotClock: Send + Sync + 'static {
    /// Seconds since the unix epoch.
    fn now(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SlotClock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    }
}

/// The subset of `/eth/v1/config/spec` the driver needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct BeaconSpec {
    #[serde(rename = "SECONDS_PER_SLOT", with = "quoted_u64")]
    pub seconds_per_slot: u64,
    #[serde(rename = "SLOTS_PER_EPOCH", with = "quoted_u64")]
    pub slots_per_epoch: u64,
    #[serde(rename = "SYNC_COMMITTEE_SIZE", with = "quoted_u64")]
    pub sync_committee_size: u64,
}

impl BeaconSpec {
    fn validate(self) -> Result<Self, ClientError> {
        if self.seconds_per_slot == 0 || self.slots_per_epoch == 0 {
            return Err(ClientError::decode("spec", "zero slot or epoch length"));
        }
        Ok(self)
    }

    pub fn epoch_for_slot(&self, slot: u64) -> u64 {
        slot / self.slots_per_epoch
    }

    pub fn is_epoch_boundary(&self, slot: u64) -> bool {
        slot != 0 && slot % self.slots_per_epoch == 0
    }

    pub fn slot_at(&self, genesis_time: u64, timestamp: u64) -> Result<u64, ClientError> {
        timestamp
            .checked_sub(genesis_time)
            .map(|elapsed| elapsed / self.seconds_per_slot)
            .ok_or(ClientError::BeforeGenesis(timestamp))
    }
}

/// A hex encoded bit list or bit vector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitField(Vec<u8>);

impl BitField {
    pub fn count_ones(&self) -> u64 {
        self.0.iter().map(|byte| u64::from(byte.count_ones())).sum()
    }
}

impl<'de> Deserialize<'de> for BitField {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| serde::de::Error::custom("bit field is not 0x-prefixed"))?;
        hex::decode(digits)
            .map(BitField)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: u16,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Genesis {
    #[serde(with = "quoted_u64")]
    genesis_time: u64,
}

#[derive(Debug, Deserialize)]
struct Checkpoint {
    root: B256,
}

#[derive(Debug, Deserialize)]
struct FinalityCheckpoints {
    current_justified: Checkpoint,
    finalized: Checkpoint,
}

#[derive(Debug, Deserialize)]
struct Committee {
    #[serde(with = "quoted_u64")]
    slot: u64,
    validators: Vec<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct AttestationData {
    #[serde(with = "quoted_u64")]
    slot: u64,
}

#[derive(Debug, Deserialize)]
struct Attestation {
    aggregation_bits: BitField,
    data: AttestationData,
}

#[derive(Debug, Deserialize)]
struct SyncAggregate {
    sync_committee_bits: BitField,
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    /// Absent before Altair.
    #[serde(default)]
    sync_aggregate: Option<SyncAggregate>,
}

#[derive(Debug, Deserialize)]
struct BlockMessage {
    body: BlockBody,
}

#[derive(Debug, Deserialize)]
struct SignedBlock {
    message: BlockMessage,
}

/// Response of lighthouse's `validator_inclusion/{epoch}/global`.
#[derive(Debug, Deserialize)]
struct GlobalInclusion {
    current_epoch_active_gwei: u64,
    #[serde(default)]
    previous_epoch_active_gwei: Option<u64>,
    previous_epoch_target_attesting_gwei: u64,
    previous_epoch_head_attesting_gwei: u64,
}

impl GlobalInclusion {
    fn active_gwei(&self) -> u64 {
        self.previous_epoch_active_gwei
            .unwrap_or(self.current_epoch_active_gwei)
    }
}

fn percentage(part: u64, whole: u64) -> Option<u64> {
    part.checked_mul(100)?.checked_div(whole)
}

/// Set bits of an aggregation bit list, without the trailing length bit.
fn attesters(bits: &BitField) -> u64 {
    bits.count_ones().saturating_sub(1)
}

/// A node on the beacon layer.
pub struct BeaconClient<K = SystemClock> {
    id: ClientId,
    base_url: String,
    http: reqwest::Client,
    call_timeout: Duration,
    spec: BeaconSpec,
    genesis_time: OnceCell<u64>,
    ttd_timestamp: TtdTimestamp,
    ttd_slot: OnceLock<u64>,
    clock: K,
}

impl BeaconClient {
    /// Fetches the node's spec, which every slot computation depends on.
    pub async fn connect(
        id: ClientId,
        url: Url,
        options: &ConnectOptions,
    ) -> Result<Self, ClientError> {
        let mut client = Self {
            id,
            base_url: url.as_str().trim_end_matches('/').to_string(),
            http: reqwest::Client::builder().build()?,
            call_timeout: options.call_timeout,
            spec: BeaconSpec {
                seconds_per_slot: 1,
                slots_per_epoch: 1,
                sync_committee_size: 0,
            },
            genesis_time: OnceCell::new(),
            ttd_timestamp: options.ttd_timestamp.clone(),
            ttd_slot: OnceLock::new(),
            clock: SystemClock,
        };
        client.spec = client
            .get::<BeaconSpec>("/eth/v1/config/spec")
            .await?
            .validate()?;
        debug!(client = %id, spec = ?client.spec, "connected");
        Ok(client)
    }
}

impl<K: SlotClock> BeaconClient<K> {
    #[instrument(skip(self), fields(client = %self.id), level = "trace")]
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let request = async {
            let response = self
                .http
                .get(format!("{}{path}", self.base_url))
                .header(ACCEPT, "application/json")
                .send()
                .await?;
            let status = response.status();
            let body = response.bytes().await?;
            if status == StatusCode::NOT_FOUND {
                return Err(ClientError::NotFound(path.to_string()));
            }
            if !status.is_success() {
                return Err(match serde_json::from_slice::<ApiError>(&body) {
                    Ok(error) => ClientError::Api {
                        code: error.code,
                        message: error.message,
                    },
                    Err(_) => ClientError::Api {
                        code: status.as_u16(),
                        message: status.to_string(),
                    },
                });
            }
            serde_json::from_slice::<Envelope<T>>(&body)
                .map(|envelope| envelope.data)
                .map_err(|e| ClientError::decode(path, e))
        };
        with_timeout(self.call_timeout, request).await
    }

    async fn genesis_time(&self) -> Result<u64, ClientError> {
        self.genesis_time
            .get_or_try_init(|| async {
                let genesis: Genesis = self.get("/eth/v1/beacon/genesis").await?;
                Ok::<_, ClientError>(genesis.genesis_time)
            })
            .await
            .copied()
    }

    async fn ongoing_slot(&self) -> Result<u64, ClientError> {
        let genesis_time = self.genesis_time().await?;
        self.spec.slot_at(genesis_time, self.clock.now())
    }

    async fn has_block_header(&self, slot: u64) -> Result<bool, ClientError> {
        match self
            .get::<IgnoredAny>(&format!("/eth/v1/beacon/headers/{slot}"))
            .await
        {
            Ok(_) => Ok(true),
            Err(ClientError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn finality_checkpoints(&self, slot: u64) -> Result<FinalityCheckpoints, ClientError> {
        self.get(&format!("/eth/v1/beacon/states/{slot}/finality_checkpoints"))
            .await
    }

    /// 1 if the checkpoint selected by `root` changed at the epoch boundary
    /// `slot`, 0 otherwise.
    async fn checkpoint_changed(
        &self,
        slot: u64,
        root: fn(&FinalityCheckpoints) -> B256,
    ) -> Result<u64, ClientError> {
        if !self.spec.is_epoch_boundary(slot) {
            return Ok(0);
        }
        let current = root(&self.finality_checkpoints(slot).await?);
        if current.is_zero() {
            return Ok(0);
        }
        let previous = root(&self.finality_checkpoints(slot - 1).await?);
        Ok(u64::from(previous != current))
    }

    async fn committee_size(&self, slot: u64) -> Result<u64, ClientError> {
        let committees: Vec<Committee> = self
            .get(&format!("/eth/v1/beacon/states/{slot}/committees?slot={slot}"))
            .await?;
        Ok(committees
            .iter()
            .filter(|committee| committee.slot == slot)
            .map(|committee| committee.validators.len() as u64)
            .sum())
    }

    /// Number of attesters in the first aggregate for `slot` included in a
    /// later block. Attestations are only includable for one epoch, so once
    /// that window has been produced without a match the count is zero.
    async fn attestation_count(&self, slot: u64, ongoing_slot: u64) -> Result<u64, ClientError> {
        let window_end = slot + self.spec.slots_per_epoch;
        for block_slot in slot + 1..=window_end.min(ongoing_slot.saturating_sub(1)) {
            let path = format!("/eth/v1/beacon/blocks/{block_slot}/attestations");
            let attestations = match self.get::<Vec<Attestation>>(&path).await {
                Ok(attestations) => attestations,
                // Empty slot.
                Err(ClientError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if let Some(attestation) = attestations.iter().find(|it| it.data.slot == slot) {
                return Ok(attesters(&attestation.aggregation_bits));
            }
        }
        if window_end < ongoing_slot {
            Ok(0)
        } else {
            Err(ClientError::NotYetAvailable {
                height: slot,
                head: ongoing_slot,
            })
        }
    }

    async fn sync_participation(&self, slot: u64) -> Result<Option<u64>, ClientError> {
        let block: SignedBlock = self.get(&format!("/eth/v2/beacon/blocks/{slot}")).await?;
        Ok(block
            .message
            .body
            .sync_aggregate
            .map(|aggregate| aggregate.sync_committee_bits.count_ones()))
    }

    /// Lighthouse inclusion figures for the epoch before the boundary
    /// `slot`. Other slots carry no figures.
    async fn global_inclusion(&self, slot: u64) -> Result<Option<GlobalInclusion>, ClientError> {
        if !self.spec.is_epoch_boundary(slot) {
            return Ok(None);
        }
        let epoch = self.spec.epoch_for_slot(slot);
        self.get(&format!("/lighthouse/validator_inclusion/{epoch}/global"))
            .await
            .map(Some)
    }

    #[instrument(skip(self), fields(client = %self.id), level = "trace")]
    async fn measure(
        &self,
        metric: MetricName,
        slot: u64,
    ) -> Result<Option<DataPoint>, ClientError> {
        // Only finished slots are measured.
        let ongoing_slot = self.ongoing_slot().await?;
        if slot >= ongoing_slot {
            return Err(ClientError::NotYetAvailable {
                height: slot,
                head: ongoing_slot,
            });
        }

        let value = match metric {
            MetricName::SlotBlock => Some(u64::from(self.has_block_header(slot).await?)),
            MetricName::FinalizedEpoch => {
                Some(self.checkpoint_changed(slot, |c| c.finalized.root).await?)
            }
            MetricName::JustifiedEpoch => {
                Some(self.checkpoint_changed(slot, |c| c.current_justified.root).await?)
            }
            MetricName::SlotAttestations => Some(self.attestation_count(slot, ongoing_slot).await?),
            MetricName::SlotAttestationsPercentage => {
                let committee_size = self.committee_size(slot).await?;
                if committee_size == 0 {
                    return Err(ClientError::EmptyCommittee(slot));
                }
                let attestations = self.attestation_count(slot, ongoing_slot).await?;
                percentage(attestations, committee_size)
            }
            MetricName::SyncParticipationCount => self.sync_participation(slot).await?,
            MetricName::SyncParticipationPercentage => self
                .sync_participation(slot)
                .await?
                .map(|count| {
                    percentage(count, self.spec.sync_committee_size)
                        .ok_or_else(|| ClientError::decode("spec", "zero sync committee size"))
                })
                .transpose()?,
            MetricName::EpochAttestationPerformance => self
                .global_inclusion(slot)
                .await?
                .and_then(|it| percentage(it.previous_epoch_head_attesting_gwei, it.active_gwei())),
            MetricName::EpochTargetAttestationPerformance => self
                .global_inclusion(slot)
                .await?
                .and_then(|it| {
                    percentage(it.previous_epoch_target_attesting_gwei, it.active_gwei())
                }),
            _ => {
                return Err(ClientError::UnsupportedMetric {
                    metric,
                    client_type: self.id.client_type,
                })
            }
        };
        Ok(value.map(DataPoint::from))
    }

    async fn resolve_ttd_slot(&self) -> Result<Option<u64>, ClientError> {
        if let Some(slot) = self.ttd_slot.get() {
            return Ok(Some(*slot));
        }
        let Some(timestamp) = self.ttd_timestamp.get() else {
            return Ok(None);
        };
        let slot = self.spec.slot_at(self.genesis_time().await?, timestamp)?;
        if self.ttd_slot.set(slot).is_ok() {
            debug!(client = %self.id, slot, "terminal slot resolved");
        }
        Ok(Some(slot))
    }
}

impl<K: SlotClock> NodeClient for BeaconClient<K> {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn data_point(
        &self,
        metric: MetricName,
        height: u64,
    ) -> Result<Option<DataPoint>, ClientError> {
        self.measure(metric, height).await
    }

    /// The ongoing slot; on the beacon layer time, not blocks, is the head.
    async fn latest_block_slot_number(&self) -> Result<u64, ClientError> {
        self.ongoing_slot().await
    }

    async fn update_ttd_block_slot(&self) -> Result<Option<u64>, ClientError> {
        self.resolve_ttd_slot().await
    }

    fn ttd_block_slot(&self) -> Option<u64> {
        self.ttd_slot.get().copied()
    }

    async fn ongoing_epoch(&self) -> Result<u64, ClientError> {
        Ok(self.spec.epoch_for_slot(self.ongoing_slot().await?))
    }

    fn epoch_for_slot(&self, slot: u64) -> Option<u64> {
        Some(self.spec.epoch_for_slot(slot))
    }
}
