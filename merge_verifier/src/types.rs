//! Closed enumerations shared by the whole verifier, together with the static
//! lookup tables that relate them (client type to layer, metric to numeric
//! domain, metric to required client implementation).

use std::fmt;
use std::str::FromStr;

use num_bigint::BigInt;
use serde::Deserialize;
use thiserror::Error;

/// Error returned when a textual enumeration value is not recognised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Generates `FromStr`, `Display` and a string-backed `Deserialize` for a
/// field-less enum whose textual names are exactly the variant names.
macro_rules! named_enum {
    ($ty:ident, $kind:literal, [$($variant:ident),+ $(,)?]) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => stringify!($variant)),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .find(|it| it.as_str() == s)
                    .copied()
                    .ok_or_else(|| UnknownVariant::new($kind, s))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// The layer a node lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientLayer {
    Execution,
    Beacon,
}

named_enum!(ClientLayer, "layer type", [Execution, Beacon]);

/// Supported node implementations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientType {
    Geth,
    Nethermind,
    Besu,
    Erigon,
    Lodestar,
    Nimbus,
    Teku,
    Prysm,
    Lighthouse,
}

impl ClientType {
    /// Case-insensitive lookup, as accepted on the command line.
    pub fn parse_lenient(s: &str) -> Result<Self, UnknownVariant> {
        Self::ALL
            .iter()
            .find(|it| it.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| UnknownVariant::new("client type", s))
    }

    pub const fn layer(&self) -> ClientLayer {
        match self {
            ClientType::Geth | ClientType::Nethermind | ClientType::Besu | ClientType::Erigon => {
                ClientLayer::Execution
            }
            ClientType::Lodestar
            | ClientType::Nimbus
            | ClientType::Teku
            | ClientType::Prysm
            | ClientType::Lighthouse => ClientLayer::Beacon,
        }
    }
}

named_enum!(
    ClientType,
    "client type",
    [Geth, Nethermind, Besu, Erigon, Lodestar, Nimbus, Teku, Prysm, Lighthouse]
);

/// Numeric domain of a metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Uint64,
    BigInt,
}

named_enum!(DataType, "data type", [Uint64, BigInt]);

/// Every metric the node drivers know how to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Execution
    BlockCount,
    BlockBaseFee,
    BlockGasUsed,
    BlockDifficulty,
    BlockMixHash,
    BlockUnclesHash,
    BlockNonce,
    // Beacon
    SlotBlock,
    FinalizedEpoch,
    JustifiedEpoch,
    SlotAttestations,
    SlotAttestationsPercentage,
    EpochAttestationPerformance,
    EpochTargetAttestationPerformance,
    SyncParticipationCount,
    SyncParticipationPercentage,
}

named_enum!(
    MetricName,
    "metric name",
    [
        BlockCount,
        BlockBaseFee,
        BlockGasUsed,
        BlockDifficulty,
        BlockMixHash,
        BlockUnclesHash,
        BlockNonce,
        SlotBlock,
        FinalizedEpoch,
        JustifiedEpoch,
        SlotAttestations,
        SlotAttestationsPercentage,
        EpochAttestationPerformance,
        EpochTargetAttestationPerformance,
        SyncParticipationCount,
        SyncParticipationPercentage,
    ]
);

impl MetricName {
    /// Numeric domain of this metric on `layer`, or `None` if the layer does
    /// not produce it.
    pub const fn data_type(&self, layer: ClientLayer) -> Option<DataType> {
        use MetricName::*;

        match (layer, self) {
            (ClientLayer::Execution, BlockCount | BlockGasUsed | BlockNonce) => {
                Some(DataType::Uint64)
            }
            (
                ClientLayer::Execution,
                BlockBaseFee | BlockDifficulty | BlockMixHash | BlockUnclesHash,
            ) => Some(DataType::BigInt),
            (
                ClientLayer::Beacon,
                SlotBlock
                | FinalizedEpoch
                | JustifiedEpoch
                | SlotAttestations
                | SlotAttestationsPercentage
                | EpochAttestationPerformance
                | EpochTargetAttestationPerformance
                | SyncParticipationCount
                | SyncParticipationPercentage,
            ) => Some(DataType::Uint64),
            _ => None,
        }
    }

    /// Client implementations able to produce this metric. An empty slice
    /// means any client of the right layer can.
    pub const fn required_client_types(&self) -> &'static [ClientType] {
        match self {
            // Served by lighthouse's `validator_inclusion` API only.
            MetricName::EpochAttestationPerformance
            | MetricName::EpochTargetAttestationPerformance => &[ClientType::Lighthouse],
            _ => &[],
        }
    }

    pub fn is_supported_by(&self, client_type: ClientType) -> bool {
        let required = self.required_client_types();
        required.is_empty() || required.contains(&client_type)
    }
}

/// Reduction applied to a probe's data points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    CountUnequal,
    CountEqual,
    Average,
    Sum,
    Percentage,
    Min,
    Max,
}

named_enum!(
    AggregateFunction,
    "aggregate function",
    [Count, CountUnequal, CountEqual, Average, Sum, Percentage, Min, Max]
);

/// Outcome of checking a verification against its data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub success: bool,
    pub message: String,
}

impl VerificationOutcome {
    pub fn render(&self, verification_name: &str) -> String {
        let verdict = if self.success { "PASS" } else { "FAIL" };
        format!("{verdict} ({verification_name}): {}", self.message)
    }
}

/// Comparison applied between an aggregated value and the pass threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassCriteria {
    MinimumValue,
    MaximumValue,
}

named_enum!(PassCriteria, "pass criteria", [MinimumValue, MaximumValue]);

impl PassCriteria {
    pub fn compare<T: Ord + fmt::Display>(
        &self,
        aggregated: &T,
        threshold: &T,
    ) -> VerificationOutcome {
        let (success, op) = match self {
            PassCriteria::MinimumValue if aggregated >= threshold => (true, ">="),
            PassCriteria::MinimumValue => (false, "<"),
            PassCriteria::MaximumValue if aggregated <= threshold => (true, "<="),
            PassCriteria::MaximumValue => (false, ">"),
        };
        VerificationOutcome {
            success,
            message: format!("{aggregated} {op} {threshold}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputValueError {
    #[error("invalid value for uint64: {0}")]
    Uint64(String),
    #[error("invalid value for bigInt: {0}")]
    BigInt(String),
}

/// A numeric value as written in a rule file: decimal, or hex with a `0x`
/// prefix. It is only given a type when it meets a metric's domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputValue(String);

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Rule files may spell small thresholds as bare integers.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Number(n) => Self(n.to_string()),
        })
    }
}

impl InputValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_u64(&self) -> Result<u64, InputValueError> {
        let s = self.0.trim();
        match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        }
        .map_err(|_| InputValueError::Uint64(self.0.clone()))
    }

    pub fn to_big_int(&self) -> Result<BigInt, InputValueError> {
        let s = self.0.trim();
        match s.strip_prefix("0x") {
            Some(hex) if !hex.is_empty() => BigInt::parse_bytes(hex.as_bytes(), 16),
            Some(_) => None,
            None => s.parse().ok(),
        }
        .ok_or_else(|| InputValueError::BigInt(self.0.clone()))
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_types_map_to_layers() {
        assert_eq!(ClientType::Geth.layer(), ClientLayer::Execution);
        assert_eq!(ClientType::Erigon.layer(), ClientLayer::Execution);
        assert_eq!(ClientType::Lighthouse.layer(), ClientLayer::Beacon);
        assert_eq!(ClientType::Prysm.layer(), ClientLayer::Beacon);
    }

    #[test]
    fn client_type_parsing_ignores_case() {
        assert_eq!(
            ClientType::parse_lenient("lighthouse"),
            Ok(ClientType::Lighthouse)
        );
        assert_eq!(ClientType::parse_lenient("GETH"), Ok(ClientType::Geth));
        assert!(ClientType::parse_lenient("reth").is_err());
        // The strict form is what rule files use.
        assert!("geth".parse::<ClientType>().is_err());
    }

    #[test]
    fn metric_domains_are_per_layer() {
        assert_eq!(
            MetricName::BlockBaseFee.data_type(ClientLayer::Execution),
            Some(DataType::BigInt)
        );
        assert_eq!(
            MetricName::BlockGasUsed.data_type(ClientLayer::Execution),
            Some(DataType::Uint64)
        );
        assert_eq!(
            MetricName::SyncParticipationCount.data_type(ClientLayer::Beacon),
            Some(DataType::Uint64)
        );
        assert_eq!(MetricName::SlotBlock.data_type(ClientLayer::Execution), None);
        assert_eq!(MetricName::BlockCount.data_type(ClientLayer::Beacon), None);
    }

    #[test]
    fn every_metric_belongs_to_exactly_one_layer() {
        for metric in MetricName::ALL {
            let execution = metric.data_type(ClientLayer::Execution).is_some();
            let beacon = metric.data_type(ClientLayer::Beacon).is_some();
            assert!(execution ^ beacon, "{metric}");
        }
    }

    #[test]
    fn epoch_performance_requires_lighthouse() {
        let metric = MetricName::EpochTargetAttestationPerformance;
        assert!(metric.is_supported_by(ClientType::Lighthouse));
        assert!(!metric.is_supported_by(ClientType::Teku));
        assert!(MetricName::SlotBlock.is_supported_by(ClientType::Teku));
    }

    #[test]
    fn pass_criteria_messages() {
        let min = PassCriteria::MinimumValue;
        assert_eq!(
            min.compare(&47u64, &1),
            VerificationOutcome {
                success: true,
                message: "47 >= 1".into()
            }
        );
        assert_eq!(min.compare(&0u64, &1).message, "0 < 1");

        let max = PassCriteria::MaximumValue;
        assert!(max.compare(&0u64, &0).success);
        assert_eq!(max.compare(&3u64, &0).message, "3 > 0");
    }

    #[test]
    fn input_values_accept_decimal_and_hex() {
        assert_eq!(InputValue::from("42").to_u64(), Ok(42));
        assert_eq!(InputValue::from("0x2a").to_u64(), Ok(42));
        assert_eq!(
            InputValue::from("0x10000000000000000").to_big_int(),
            Ok(BigInt::from(u64::MAX) + 1)
        );
        assert_eq!(
            InputValue::from("18446744073709551616").to_big_int(),
            Ok(BigInt::from(u64::MAX) + 1)
        );
        assert!(InputValue::from("0x10000000000000000").to_u64().is_err());
        assert!(InputValue::from("ten").to_u64().is_err());
        assert!(InputValue::from("0x").to_big_int().is_err());
    }
}
