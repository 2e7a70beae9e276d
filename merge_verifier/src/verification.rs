//! Declarative verification rules and their evaluation against collected
//! data points.

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use num_bigint::BigInt;
use serde::Deserialize;
use thiserror::Error;

use crate::data_points::{AggregationError, DataPoints, Measurement};
use crate::types::{
    AggregateFunction, ClientLayer, ClientType, DataType, InputValue, InputValueError, MetricName,
    PassCriteria, VerificationOutcome,
};

/// Rules shipped with the binary, used unless overridden on the command
/// line.
const DEFAULT_VERIFICATIONS: &str = include_str!("../default_verifications.toml");

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("metric {metric} does not exist on the {layer} layer")]
    UnknownMetric {
        metric: MetricName,
        layer: ClientLayer,
    },
    #[error("invalid pass value: {0}")]
    InvalidPassValue(#[source] InputValueError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// One rule: which metric to collect on which layer, how to reduce it and
/// what the reduced value must satisfy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Verification {
    pub name: String,
    pub layer: ClientLayer,
    /// Only collect data from the terminal block/slot onwards.
    #[serde(default)]
    pub post_merge: bool,
    pub check_delay_seconds: u64,
    pub metric: MetricName,
    pub aggregate_function: AggregateFunction,
    #[serde(default)]
    pub aggregate_function_value: Option<InputValue>,
    pub pass_criteria: PassCriteria,
    pub pass_value: InputValue,
}

impl Verification {
    pub fn check_delay(&self) -> Duration {
        Duration::from_secs(self.check_delay_seconds)
    }

    /// Whether a probe should be created for this rule on a client of
    /// `client_type`.
    pub fn applies_to(&self, client_type: ClientType) -> bool {
        client_type.layer() == self.layer && self.metric.is_supported_by(client_type)
    }

    pub fn data_type(&self) -> Result<DataType, VerificationError> {
        self.metric
            .data_type(self.layer)
            .ok_or(VerificationError::UnknownMetric {
                metric: self.metric,
                layer: self.layer,
            })
    }

    /// Aggregates `points` in the metric's domain and compares the result to
    /// the pass value.
    pub fn evaluate(&self, points: &DataPoints) -> Result<VerificationOutcome, VerificationError> {
        match self.data_type()? {
            DataType::Uint64 => self.evaluate_as::<u64>(points),
            DataType::BigInt => self.evaluate_as::<BigInt>(points),
        }
    }

    fn evaluate_as<T: Measurement>(
        &self,
        points: &DataPoints,
    ) -> Result<VerificationOutcome, VerificationError> {
        let aggregated: T =
            points.aggregate(self.aggregate_function, self.aggregate_function_value.as_ref())?;
        let threshold =
            T::parse_input(&self.pass_value).map_err(VerificationError::InvalidPassValue)?;
        Ok(self.pass_criteria.compare(&aggregated, &threshold))
    }
}

#[derive(Deserialize)]
struct VerificationFile {
    #[serde(default, rename = "verification")]
    verifications: Vec<Verification>,
}

/// An ordered list of rules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Verifications(Vec<Verification>);

impl Verifications {
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let file: VerificationFile =
            toml::from_str(contents).context("invalid verifications file")?;
        Ok(Self(file.verifications))
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("couldn't load {}", path.display()))
    }

    pub fn defaults() -> Self {
        Self::from_toml(DEFAULT_VERIFICATIONS).expect("bundled verifications are valid")
    }

    /// Builds the effective rule set: `overrides` replaces the bundled
    /// defaults when given, every `extras` file is appended.
    pub fn load(overrides: Option<&Path>, extras: &[impl AsRef<Path>]) -> anyhow::Result<Self> {
        let mut verifications = match overrides {
            Some(path) => Self::from_path(path)?,
            None => Self::defaults(),
        };
        for path in extras {
            verifications.extend(Self::from_path(path.as_ref())?);
        }
        Ok(verifications)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Verification> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|v| v.name.as_str()).collect()
    }
}

impl Extend<Verification> for Verifications {
    fn extend<I: IntoIterator<Item = Verification>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

impl IntoIterator for Verifications {
    type Item = Verification;
    type IntoIter = std::vec::IntoIter<Verification>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Verification> for Verifications {
    fn from_iter<I: IntoIterator<Item = Verification>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_points::DataPoint;

    fn rule(metric: MetricName, function: AggregateFunction, pass_value: &str) -> Verification {
        Verification {
            name: "test".into(),
            layer: metric
                .data_type(ClientLayer::Execution)
                .map_or(ClientLayer::Beacon, |_| ClientLayer::Execution),
            post_merge: false,
            check_delay_seconds: 1,
            metric,
            aggregate_function: function,
            aggregate_function_value: None,
            pass_criteria: PassCriteria::MinimumValue,
            pass_value: pass_value.into(),
        }
    }

    fn points(values: &[(u64, u64)]) -> DataPoints {
        values.iter().map(|&(h, v)| (h, DataPoint::from(v))).collect()
    }

    #[test]
    fn count_passes_minimum() {
        let v = rule(MetricName::BlockCount, AggregateFunction::Count, "1");
        let outcome = v.evaluate(&points(&[(10, 1), (11, 0), (12, 1)])).unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome {
                success: true,
                message: "2 >= 1".into()
            }
        );
    }

    #[test]
    fn count_unequal_counts_nonzero_values() {
        let mut v = rule(MetricName::SlotBlock, AggregateFunction::CountUnequal, "1");
        v.aggregate_function_value = Some("0".into());
        let outcome = v.evaluate(&points(&[(10, 0), (11, 5), (12, 0)])).unwrap();
        assert_eq!(outcome.message, "1 >= 1");
        assert!(outcome.success);
    }

    #[test]
    fn maximum_on_big_int_metric() {
        let mut v = rule(MetricName::BlockDifficulty, AggregateFunction::Sum, "0");
        v.pass_criteria = PassCriteria::MaximumValue;
        let data: DataPoints = [(1, BigInt::from(0)), (2, BigInt::from(131072))]
            .into_iter()
            .map(|(h, d)| (h, DataPoint::from(d)))
            .collect();
        let outcome = v.evaluate(&data).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message, "131072 > 0");
    }

    #[test]
    fn evaluation_errors_are_reported() {
        let v = rule(MetricName::BlockGasUsed, AggregateFunction::Average, "lots");
        assert!(matches!(
            v.evaluate(&points(&[(1, 1)])),
            Err(VerificationError::InvalidPassValue(_))
        ));

        let mut v = rule(MetricName::SlotBlock, AggregateFunction::Count, "1");
        v.layer = ClientLayer::Execution;
        assert_eq!(
            v.evaluate(&DataPoints::new()),
            Err(VerificationError::UnknownMetric {
                metric: MetricName::SlotBlock,
                layer: ClientLayer::Execution
            })
        );

        let v = rule(MetricName::BlockGasUsed, AggregateFunction::Percentage, "1");
        assert_eq!(
            v.evaluate(&DataPoints::new()),
            Err(VerificationError::Aggregation(AggregationError::DivisionByZero))
        );
    }

    #[test]
    fn applies_to_checks_layer_and_capability() {
        let v = rule(
            MetricName::EpochAttestationPerformance,
            AggregateFunction::Average,
            "95",
        );
        assert!(v.applies_to(ClientType::Lighthouse));
        assert!(!v.applies_to(ClientType::Teku));
        assert!(!v.applies_to(ClientType::Geth));
    }

    #[test]
    fn parses_rule_files() {
        let verifications = Verifications::from_toml(
            r#"
            [[verification]]
            name = "Unique mix hashes"
            layer = "Execution"
            post_merge = true
            check_delay_seconds = 2
            metric = "BlockMixHash"
            aggregate_function = "CountUnequal"
            aggregate_function_value = "0x0"
            pass_criteria = "MinimumValue"
            pass_value = 1
            "#,
        )
        .unwrap();
        let v = verifications.iter().next().unwrap();
        assert_eq!(v.metric, MetricName::BlockMixHash);
        assert_eq!(v.aggregate_function_value, Some(InputValue::from("0x0")));
        assert_eq!(v.pass_value, InputValue::from("1"));
        assert_eq!(v.check_delay(), Duration::from_secs(2));

        let err = Verifications::from_toml(
            r#"
            [[verification]]
            name = "x"
            layer = "Consensus"
            check_delay_seconds = 1
            metric = "SlotBlock"
            aggregate_function = "Count"
            pass_criteria = "MinimumValue"
            pass_value = "1"
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid layer type: Consensus"));
    }

    #[test]
    fn bundled_defaults_are_well_formed() {
        let defaults = Verifications::defaults();
        assert!(!defaults.is_empty());
        assert!(defaults.iter().any(|v| v.layer == ClientLayer::Execution));
        for v in defaults.iter() {
            assert!(v.data_type().is_ok(), "{}", v.name);
            assert!(v.check_delay_seconds > 0, "{}", v.name);
        }
    }
}
