//! Time-indexed measurements collected by a probe and the aggregate functions
//! that reduce them to a single comparable value.
//!
//! A store only ever holds values of one [`DataType`]. The aggregate
//! functions are written once over [`Measurement`] and instantiated for the
//! two domains, `u64` and arbitrary-precision [`BigInt`].

use std::collections::BTreeMap;
use std::fmt;

use num_bigint::BigInt;
use num_traits::{CheckedAdd, CheckedDiv, Zero};
use thiserror::Error;

use crate::types::{AggregateFunction, DataType, InputValue, InputValueError};

/// One measurement at one block or slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataPoint {
    Uint64(u64),
    BigInt(BigInt),
}

impl DataPoint {
    pub fn data_type(&self) -> DataType {
        match self {
            DataPoint::Uint64(_) => DataType::Uint64,
            DataPoint::BigInt(_) => DataType::BigInt,
        }
    }
}

impl From<u64> for DataPoint {
    fn from(value: u64) -> Self {
        DataPoint::Uint64(value)
    }
}

impl From<BigInt> for DataPoint {
    fn from(value: BigInt) -> Self {
        DataPoint::BigInt(value)
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataPoint::Uint64(v) => write!(f, "{v}"),
            DataPoint::BigInt(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("invalid data for {expected} at height {height}: {found}")]
    TypeMismatch {
        height: u64,
        expected: DataType,
        found: DataPoint,
    },
    #[error("aggregate function {0} requires an operand")]
    MissingOperand(AggregateFunction),
    #[error("invalid aggregate function operand: {0}")]
    InvalidOperand(#[from] InputValueError),
    #[error("percentage over an empty data set")]
    DivisionByZero,
    #[error("{0} over an empty data set")]
    EmptyDataSet(AggregateFunction),
    #[error("{0} overflowed")]
    Overflow(AggregateFunction),
}

/// A numeric domain the aggregate functions can operate on.
pub trait Measurement:
    Sized + Clone + Ord + fmt::Display + Zero + CheckedAdd + CheckedDiv + From<u64>
{
    const DATA_TYPE: DataType;

    fn from_data_point(point: &DataPoint) -> Option<&Self>;

    fn parse_input(value: &InputValue) -> Result<Self, InputValueError>;
}

impl Measurement for u64 {
    const DATA_TYPE: DataType = DataType::Uint64;

    fn from_data_point(point: &DataPoint) -> Option<&Self> {
        match point {
            DataPoint::Uint64(v) => Some(v),
            DataPoint::BigInt(_) => None,
        }
    }

    fn parse_input(value: &InputValue) -> Result<Self, InputValueError> {
        value.to_u64()
    }
}

impl Measurement for BigInt {
    const DATA_TYPE: DataType = DataType::BigInt;

    fn from_data_point(point: &DataPoint) -> Option<&Self> {
        match point {
            DataPoint::BigInt(v) => Some(v),
            DataPoint::Uint64(_) => None,
        }
    }

    fn parse_input(value: &InputValue) -> Result<Self, InputValueError> {
        value.to_big_int()
    }
}

/// Measurements keyed by block or slot number.
///
/// A missing height means the value was not collected (or was skipped for
/// good); it is never read as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataPoints(BTreeMap<u64, DataPoint>);

impl DataPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, height: u64, point: DataPoint) -> Option<DataPoint> {
        self.0.insert(height, point)
    }

    pub fn get(&self, height: u64) -> Option<&DataPoint> {
        self.0.get(&height)
    }

    pub fn contains(&self, height: u64) -> bool {
        self.0.contains_key(&height)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn heights(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.keys().copied()
    }

    /// Borrows every value as `T`, failing on the first value of another
    /// domain.
    pub fn typed<T: Measurement>(&self) -> Result<Vec<&T>, AggregationError> {
        self.0
            .iter()
            .map(|(height, point)| {
                T::from_data_point(point).ok_or_else(|| AggregationError::TypeMismatch {
                    height: *height,
                    expected: T::DATA_TYPE,
                    found: point.clone(),
                })
            })
            .collect()
    }

    pub fn aggregate_u64(
        &self,
        function: AggregateFunction,
        operand: Option<&InputValue>,
    ) -> Result<u64, AggregationError> {
        self.aggregate(function, operand)
    }

    pub fn aggregate_big_int(
        &self,
        function: AggregateFunction,
        operand: Option<&InputValue>,
    ) -> Result<BigInt, AggregationError> {
        self.aggregate(function, operand)
    }

    /// Reduces the store with `function`. `operand` is only read by
    /// `CountEqual` and `CountUnequal`.
    pub fn aggregate<T: Measurement>(
        &self,
        function: AggregateFunction,
        operand: Option<&InputValue>,
    ) -> Result<T, AggregationError> {
        let values = self.typed::<T>()?;

        let parse_operand = || -> Result<T, AggregationError> {
            let operand = operand.ok_or(AggregationError::MissingOperand(function))?;
            Ok(T::parse_input(operand)?)
        };
        let count = |predicate: &dyn Fn(&T) -> bool| {
            T::from(values.iter().filter(|&&v| predicate(v)).count() as u64)
        };
        let sum = || {
            values
                .iter()
                .copied()
                .try_fold(T::zero(), |acc, v| acc.checked_add(v))
                .ok_or(AggregationError::Overflow(function))
        };

        match function {
            AggregateFunction::Count => Ok(count(&|v| !v.is_zero())),
            AggregateFunction::CountEqual => {
                let operand = parse_operand()?;
                Ok(count(&|v| *v == operand))
            }
            AggregateFunction::CountUnequal => {
                let operand = parse_operand()?;
                Ok(count(&|v| *v != operand))
            }
            AggregateFunction::Sum => sum(),
            AggregateFunction::Average => {
                if values.is_empty() {
                    return Ok(T::zero());
                }
                let total = sum()?;
                total
                    .checked_div(&T::from(values.len() as u64))
                    .ok_or(AggregationError::Overflow(function))
            }
            AggregateFunction::Percentage => {
                if values.is_empty() {
                    return Err(AggregationError::DivisionByZero);
                }
                let nonzero = values.iter().filter(|v| !v.is_zero()).count() as u64;
                Ok(T::from(nonzero * 100 / values.len() as u64))
            }
            AggregateFunction::Min => values
                .iter()
                .copied()
                .min()
                .cloned()
                .ok_or(AggregationError::EmptyDataSet(function)),
            AggregateFunction::Max => values
                .iter()
                .copied()
                .max()
                .cloned()
                .ok_or(AggregationError::EmptyDataSet(function)),
        }
    }
}

impl FromIterator<(u64, DataPoint)> for DataPoints {
    fn from_iter<I: IntoIterator<Item = (u64, DataPoint)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
