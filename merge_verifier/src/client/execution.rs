//! Execution layer driver and the terminal block detector.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{B256, B64, U256, U64};
use alloy::providers::{Provider as _, RootProvider};
use alloy::transports::http::reqwest::Url;
use alloy::transports::BoxTransport;
use num_bigint::{BigInt, BigUint};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use super::{with_timeout, ClientError, ClientId, ConnectOptions, NodeClient, TtdTimestamp};
use crate::data_points::DataPoint;
use crate::types::{ClientLayer, MetricName};

/// Parses a terminal total difficulty given in decimal or `0x` hex.
pub fn parse_ttd(s: &str) -> Result<U256, String> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(s, 10),
    }
    .map_err(|e| format!("invalid terminal total difficulty {s:?}: {e}"))
}

/// The header fields the metrics read, as returned by
/// `eth_getBlockByNumber`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHeader {
    pub number: U64,
    pub timestamp: U64,
    pub difficulty: U256,
    #[serde(default)]
    pub total_difficulty: Option<U256>,
    /// Absent before London.
    #[serde(default)]
    pub base_fee_per_gas: Option<U256>,
    pub gas_used: U64,
    #[serde(default)]
    pub mix_hash: Option<B256>,
    pub sha3_uncles: B256,
    #[serde(default)]
    pub nonce: Option<B64>,
}

impl ExecutionHeader {
    pub fn number(&self) -> u64 {
        self.number.to()
    }
}

/// JSON-RPC surface of an execution node.
pub trait ExecutionRpc: Send + Sync + 'static {
    fn block_number(&self) -> impl Future<Output = Result<u64, ClientError>> + Send;

    /// `Ok(None)` if the node does not have block `number`.
    fn header_by_number(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Option<ExecutionHeader>, ClientError>> + Send;

    fn latest_header(
        &self,
    ) -> impl Future<Output = Result<Option<ExecutionHeader>, ClientError>> + Send;
}

/// [`ExecutionRpc`] over an alloy HTTP provider.
pub struct AlloyRpc {
    provider: RootProvider<BoxTransport>,
    call_timeout: Duration,
}

impl AlloyRpc {
    pub fn new(url: Url, call_timeout: Duration) -> Self {
        Self {
            provider: RootProvider::new_http(url).boxed(),
            call_timeout,
        }
    }

    async fn get_header(
        &self,
        block: BlockNumberOrTag,
    ) -> Result<Option<ExecutionHeader>, ClientError> {
        with_timeout(
            self.call_timeout,
            async {
                self.provider
                    .raw_request::<_, Option<ExecutionHeader>>(
                        "eth_getBlockByNumber".into(),
                        (block, false),
                    )
                    .await
            },
        )
        .await
    }
}

impl ExecutionRpc for AlloyRpc {
    async fn block_number(&self) -> Result<u64, ClientError> {
        with_timeout(self.call_timeout, async {
            self.provider.get_block_number().await
        })
        .await
    }

    async fn header_by_number(&self, number: u64) -> Result<Option<ExecutionHeader>, ClientError> {
        self.get_header(BlockNumberOrTag::Number(number)).await
    }

    async fn latest_header(&self) -> Result<Option<ExecutionHeader>, ClientError> {
        self.get_header(BlockNumberOrTag::Latest).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtdBlock {
    pub number: u64,
    pub timestamp: u64,
}

/// Finds the terminal block once the node's total difficulty reaches the
/// configured threshold.
///
/// The terminal block is the highest block with a nonzero difficulty; every
/// block after it has difficulty zero. It is found by walking back from the
/// head, at most once per detector.
#[derive(Debug)]
pub struct TtdDetector {
    ttd: U256,
    resolved: OnceLock<TtdBlock>,
    scan: Mutex<()>,
    publish_to: TtdTimestamp,
}

impl TtdDetector {
    pub fn new(ttd: U256, publish_to: TtdTimestamp) -> Self {
        Self {
            ttd,
            resolved: OnceLock::new(),
            scan: Mutex::new(()),
            publish_to,
        }
    }

    pub fn resolved(&self) -> Option<TtdBlock> {
        self.resolved.get().copied()
    }

    pub async fn update<R: ExecutionRpc>(&self, rpc: &R) -> Result<Option<TtdBlock>, ClientError> {
        if let Some(block) = self.resolved() {
            return Ok(Some(block));
        }
        // Concurrent probes of one client wait here for a single scan.
        let _scan = self.scan.lock().await;
        if let Some(block) = self.resolved() {
            return Ok(Some(block));
        }

        let Some(mut header) = rpc.latest_header().await? else {
            return Ok(None);
        };
        let total_difficulty = header
            .total_difficulty
            .ok_or_else(|| ClientError::decode("latest header", "missing totalDifficulty"))?;
        if total_difficulty < self.ttd {
            return Ok(None);
        }

        while header.difficulty.is_zero() {
            let number = header.number();
            if number == 0 {
                return Err(ClientError::TtdBlockNotFound);
            }
            header = rpc
                .header_by_number(number - 1)
                .await?
                .ok_or_else(|| ClientError::NotFound(format!("block {}", number - 1)))?;
        }

        let block = TtdBlock {
            number: header.number(),
            timestamp: header.timestamp.to(),
        };
        // Only this task can get here while the lock is held.
        let _ = self.resolved.set(block);
        self.publish_to.publish(block.timestamp);
        info!(
            block = block.number,
            timestamp = block.timestamp,
            "terminal block reached"
        );
        Ok(Some(block))
    }
}

fn big_int(bytes: &[u8]) -> BigInt {
    BigInt::from(BigUint::from_bytes_be(bytes))
}

fn u256_to_big_int(value: U256) -> BigInt {
    big_int(&value.to_be_bytes::<32>())
}

/// A node on the execution layer.
pub struct ExecutionClient<R = AlloyRpc> {
    id: ClientId,
    rpc: R,
    ttd: TtdDetector,
}

impl ExecutionClient {
    pub fn connect(id: ClientId, url: Url, options: &ConnectOptions) -> Self {
        Self::new(
            id,
            AlloyRpc::new(url, options.call_timeout),
            TtdDetector::new(options.ttd, options.ttd_timestamp.clone()),
        )
    }
}

impl<R: ExecutionRpc> ExecutionClient<R> {
    pub fn new(id: ClientId, rpc: R, ttd: TtdDetector) -> Self {
        Self { id, rpc, ttd }
    }

    pub fn ttd_block(&self) -> Option<TtdBlock> {
        self.ttd.resolved()
    }

    async fn header(&self, number: u64) -> Result<ExecutionHeader, ClientError> {
        if let Some(header) = self.rpc.header_by_number(number).await? {
            return Ok(header);
        }
        let head = self.rpc.block_number().await?;
        if number > head {
            Err(ClientError::NotYetAvailable {
                height: number,
                head,
            })
        } else {
            Err(ClientError::NotFound(format!("block {number}")))
        }
    }

    #[instrument(skip(self), fields(client = %self.id), level = "trace")]
    async fn measure(
        &self,
        metric: MetricName,
        number: u64,
    ) -> Result<Option<DataPoint>, ClientError> {
        let header = self.header(number).await?;
        Ok(match metric {
            MetricName::BlockCount => Some(1u64.into()),
            MetricName::BlockBaseFee => header
                .base_fee_per_gas
                .map(|fee| u256_to_big_int(fee).into()),
            MetricName::BlockGasUsed => Some(header.gas_used.to::<u64>().into()),
            MetricName::BlockDifficulty => Some(u256_to_big_int(header.difficulty).into()),
            MetricName::BlockMixHash => header.mix_hash.map(|hash| big_int(hash.as_slice()).into()),
            MetricName::BlockUnclesHash => Some(big_int(header.sha3_uncles.as_slice()).into()),
            MetricName::BlockNonce => header.nonce.map(|nonce| u64::from_be_bytes(nonce.0).into()),
            _ => {
                return Err(ClientError::UnsupportedMetric {
                    metric,
                    client_type: self.id.client_type,
                })
            }
        })
    }
}

impl<R: ExecutionRpc> NodeClient for ExecutionClient<R> {
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

    async fn latest_block_slot_number(&self) -> Result<u64, ClientError> {
        self.rpc.block_number().await
    }

    #[instrument(skip(self), fields(client = %self.id))]
    async fn update_ttd_block_slot(&self) -> Result<Option<u64>, ClientError> {
        let block = self.ttd.update(&self.rpc).await?;
        Ok(block.map(|block| block.number))
    }

    fn ttd_block_slot(&self) -> Option<u64> {
        self.ttd.resolved().map(|block| block.number)
    }

    async fn ongoing_epoch(&self) -> Result<u64, ClientError> {
        Err(ClientError::Unsupported {
            operation: "epochs",
            layer: ClientLayer::Execution,
        })
    }

    fn epoch_for_slot(&self, _slot: u64) -> Option<u64> {
        None
    }
}
