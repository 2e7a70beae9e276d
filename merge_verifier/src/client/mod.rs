//! The capability interface every node driver implements, plus the pieces
//! shared between drivers: error taxonomy, endpoint parsing, per-call
//! deadlines and the terminal block timestamp handed from execution to
//! beacon clients.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use alloy::primitives::U256;
use alloy::transports::http::reqwest::{self, Url};
use alloy::transports::TransportError;
use thiserror::Error;

use crate::data_points::DataPoint;
use crate::types::{ClientLayer, ClientType, MetricName, UnknownVariant};

pub mod beacon;
pub mod execution;

pub use beacon::BeaconClient;
pub use execution::ExecutionClient;

/// Default deadline for a single network call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    /// The node has not reached `height` yet. Always worth retrying.
    #[error("height {height} is not available yet (head {head})")]
    NotYetAvailable { height: u64, head: u64 },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("node returned error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("couldn't decode {context}: {reason}")]
    Decode { context: String, reason: String },
    #[error("metric {metric} is not produced by {client_type} clients")]
    UnsupportedMetric {
        metric: MetricName,
        client_type: ClientType,
    },
    #[error("timestamp {0} is before genesis")]
    BeforeGenesis(u64),
    #[error("empty committee for slot {0}")]
    EmptyCommittee(u64),
    #[error("no block with a nonzero difficulty at or below the head")]
    TtdBlockNotFound,
    #[error("{operation} is not supported by {layer} clients")]
    Unsupported {
        operation: &'static str,
        layer: ClientLayer,
    },
}

impl ClientError {
    pub(crate) fn decode(context: impl Into<String>, reason: impl fmt::Display) -> Self {
        ClientError::Decode {
            context: context.into(),
            reason: reason.to_string(),
        }
    }
}

/// Bounds `request` by `deadline`, surfacing an elapsed deadline as
/// [`ClientError::Timeout`].
pub(crate) async fn with_timeout<T, E>(
    deadline: Duration,
    request: impl Future<Output = Result<T, E>>,
) -> Result<T, ClientError>
where
    E: Into<ClientError>,
{
    match tokio::time::timeout(deadline, request).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ClientError::Timeout(deadline)),
    }
}

/// Identity of one configured node: its implementation and its position
/// among the nodes of that implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub client_type: ClientType,
    pub index: usize,
}

impl ClientId {
    pub fn new(client_type: ClientType, index: usize) -> Self {
        Self { client_type, index }
    }

    pub fn layer(&self) -> ClientLayer {
        self.client_type.layer()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.client_type, self.index)
    }
}

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("expected <client type>,<url>, got {0:?}")]
    Format(String),
    #[error(transparent)]
    ClientType(#[from] UnknownVariant),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// A node endpoint as written on the command line: `<client type>,<url>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientEndpoint {
    pub client_type: ClientType,
    pub url: Url,
}

impl FromStr for ClientEndpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (client_type, url) = s
            .split_once(',')
            .ok_or_else(|| EndpointError::Format(s.to_string()))?;
        Ok(Self {
            client_type: ClientType::parse_lenient(client_type.trim())?,
            url: url.trim().parse()?,
        })
    }
}

impl ClientEndpoint {
    /// Numbers endpoints per client type in order of appearance.
    pub fn assign_ids(endpoints: &[ClientEndpoint]) -> Vec<ClientId> {
        let mut seen: Vec<ClientType> = Vec::with_capacity(endpoints.len());
        endpoints
            .iter()
            .map(|endpoint| {
                let index = seen
                    .iter()
                    .filter(|&&it| it == endpoint.client_type)
                    .count();
                seen.push(endpoint.client_type);
                ClientId::new(endpoint.client_type, index)
            })
            .collect()
    }
}

/// Timestamp of the terminal block, set once by whichever execution client
/// finds it first and read by every beacon client.
#[derive(Clone, Debug, Default)]
pub struct TtdTimestamp(Arc<OnceLock<u64>>);

impl TtdTimestamp {
    /// Returns `false` if a timestamp was already published.
    pub fn publish(&self, timestamp: u64) -> bool {
        self.0.set(timestamp).is_ok()
    }

    pub fn get(&self) -> Option<u64> {
        self.0.get().copied()
    }
}

/// Operations the probes and watchdogs need from a node.
///
/// Heights are block numbers on the execution layer and slot numbers on the
/// beacon layer.
pub trait NodeClient: Send + Sync + 'static {
    fn id(&self) -> ClientId;

    fn layer(&self) -> ClientLayer {
        self.id().layer()
    }

    /// Measures `metric` at `height`. `Ok(None)` means no measurement will
    /// ever exist there; [`ClientError::NotYetAvailable`] means the node has
    /// not caught up yet.
    fn data_point(
        &self,
        metric: MetricName,
        height: u64,
    ) -> impl Future<Output = Result<Option<DataPoint>, ClientError>> + Send;

    fn latest_block_slot_number(&self) -> impl Future<Output = Result<u64, ClientError>> + Send;

    /// Resolves the terminal block (execution) or slot (beacon) if the
    /// transition has happened. Once resolved the cached value is returned
    /// without further network calls.
    fn update_ttd_block_slot(
        &self,
    ) -> impl Future<Output = Result<Option<u64>, ClientError>> + Send;

    /// The cached terminal block or slot, without any I/O.
    fn ttd_block_slot(&self) -> Option<u64>;

    fn ongoing_epoch(&self) -> impl Future<Output = Result<u64, ClientError>> + Send;

    /// `None` on layers without epochs.
    fn epoch_for_slot(&self, slot: u64) -> Option<u64>;
}

/// Settings shared by every driver at construction.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub ttd: U256,
    pub call_timeout: Duration,
    pub ttd_timestamp: TtdTimestamp,
}

/// A connected node of either layer.
pub enum Client {
    Execution(ExecutionClient),
    Beacon(BeaconClient),
}

impl Client {
    pub async fn connect(
        id: ClientId,
        url: Url,
        options: &ConnectOptions,
    ) -> Result<Self, ClientError> {
        Ok(match id.layer() {
            ClientLayer::Execution => Client::Execution(ExecutionClient::connect(id, url, options)),
            ClientLayer::Beacon => Client::Beacon(BeaconClient::connect(id, url, options).await?),
        })
    }
}

impl NodeClient for Client {
    fn id(&self) -> ClientId {
        match self {
            Client::Execution(client) => client.id(),
            Client::Beacon(client) => client.id(),
        }
    }

    async fn data_point(
        &self,
        metric: MetricName,
        height: u64,
    ) -> Result<Option<DataPoint>, ClientError> {
        match self {
            Client::Execution(client) => client.data_point(metric, height).await,
            Client::Beacon(client) => client.data_point(metric, height).await,
        }
    }

    async fn latest_block_slot_number(&self) -> Result<u64, ClientError> {
        match self {
            Client::Execution(client) => client.latest_block_slot_number().await,
            Client::Beacon(client) => client.latest_block_slot_number().await,
        }
    }

    async fn update_ttd_block_slot(&self) -> Result<Option<u64>, ClientError> {
        match self {
            Client::Execution(client) => client.update_ttd_block_slot().await,
            Client::Beacon(client) => client.update_ttd_block_slot().await,
        }
    }

    fn ttd_block_slot(&self) -> Option<u64> {
        match self {
            Client::Execution(client) => client.ttd_block_slot(),
            Client::Beacon(client) => client.ttd_block_slot(),
        }
    }

    async fn ongoing_epoch(&self) -> Result<u64, ClientError> {
        match self {
            Client::Execution(client) => client.ongoing_epoch().await,
            Client::Beacon(client) => client.ongoing_epoch().await,
        }
    }

    fn epoch_for_slot(&self, slot: u64) -> Option<u64> {
        match self {
            Client::Execution(client) => client.epoch_for_slot(slot),
            Client::Beacon(client) => client.epoch_for_slot(slot),
        }
    }
}
