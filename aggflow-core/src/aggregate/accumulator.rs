use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::hll::HyperLogLog;
use crate::config::{AggFunction, AggregationSpec};
use crate::message::Record;
use crate::value::Value;

/// Numeric operand of min and max. Ints stay exact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) if f.is_finite() => Some(Number::Float(*f)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    /// Compares magnitudes; ints are compared exactly.
    fn order(self, other: Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(&b),
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Number::Int(i) => Value::Int(i),
            Number::Float(f) => Value::Float(f),
        }
    }
}

/// Sum split into an exact integer part and an exact float part. Floats are kept as
/// non-overlapping partials (Shewchuk) and rounded once when read, so the result does not depend
/// on the order records were added or partial sums were merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sum {
    int: i128,
    /// Increasing magnitude, pairwise non-overlapping.
    partials: Vec<f64>,
    floats: u64,
}

impl Sum {
    fn add(&mut self, number: Number) {
        match number {
            Number::Int(i) => self.int += i128::from(i),
            Number::Float(f) => {
                add_exact(&mut self.partials, f);
                self.floats += 1;
            }
        }
    }

    fn merge(&mut self, other: &Sum) {
        self.int += other.int;
        for partial in &other.partials {
            add_exact(&mut self.partials, *partial);
        }
        self.floats += other.floats;
    }

    fn total(&self) -> f64 {
        let mut partials = self.partials.clone();
        // i128 to f64 rounds, the remainder carries what was lost
        let high = self.int as f64;
        add_exact(&mut partials, high);
        add_exact(&mut partials, (self.int - high as i128) as f64);
        round_exact(&partials)
    }

    fn value(&self) -> Value {
        if self.floats == 0
            && let Ok(int) = i64::try_from(self.int)
        {
            return Value::Int(int);
        }
        Value::Float(self.total())
    }
}

impl PartialEq for Sum {
    /// Equal when both hold the same exact value, however the partials are split.
    fn eq(&self, other: &Self) -> bool {
        if self.int != other.int || self.floats != other.floats {
            return false;
        }
        let mut difference = self.partials.clone();
        for partial in &other.partials {
            add_exact(&mut difference, -partial);
        }
        round_exact(&difference) == 0.0
    }
}

/// Adds `x` to the partials without rounding error.
fn add_exact(partials: &mut Vec<f64>, mut x: f64) {
    let mut kept = Vec::with_capacity(partials.len() + 1);
    for mut y in partials.drain(..) {
        if x.abs() < y.abs() {
            std::mem::swap(&mut x, &mut y);
        }
        let hi = x + y;
        let lo = y - (hi - x);
        if lo != 0.0 {
            kept.push(lo);
        }
        x = hi;
    }
    kept.push(x);
    *partials = kept;
}

/// Correctly rounded value of the partials, ties to even.
fn round_exact(partials: &[f64]) -> f64 {
    let mut rest = partials.iter().rev().copied();
    let Some(mut hi) = rest.next() else {
        return 0.0;
    };
    let mut lo = 0.0;
    for y in rest.by_ref() {
        let x = hi;
        hi = x + y;
        lo = y - (hi - x);
        if lo != 0.0 {
            break;
        }
    }
    // half way cases need the sign of what lies below
    if let Some(below) = rest.next()
        && ((lo < 0.0 && below < 0.0) || (lo > 0.0 && below > 0.0))
    {
        let y = lo * 2.0;
        let x = hi + y;
        if x - hi == y {
            hi = x;
        }
    }
    hi
}

/// Partial state of one aggregation function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialState {
    Count(u64),
    Sum(Sum),
    Min(Option<Number>),
    Max(Option<Number>),
    Avg { sum: Sum, count: u64 },
    ApproxDistinct(HyperLogLog),
}

impl PartialState {
    fn new(function: AggFunction) -> Self {
        match function {
            AggFunction::Count => PartialState::Count(0),
            AggFunction::Sum => PartialState::Sum(Sum::default()),
            AggFunction::Min => PartialState::Min(None),
            AggFunction::Max => PartialState::Max(None),
            AggFunction::Avg => PartialState::Avg {
                sum: Sum::default(),
                count: 0,
            },
            AggFunction::ApproxDistinct => PartialState::ApproxDistinct(HyperLogLog::default()),
        }
    }

    fn update(&mut self, field: Option<&Value>, has_field: bool) {
        match self {
            PartialState::Count(count) => {
                if !has_field || field.is_some_and(|v| !v.is_null()) {
                    *count += 1;
                }
            }
            PartialState::Sum(sum) => {
                if let Some(n) = field.and_then(Number::from_value) {
                    sum.add(n);
                }
            }
            PartialState::Min(min) => {
                if let Some(n) = field.and_then(Number::from_value) {
                    *min = Some(pick(*min, n, Ordering::Less));
                }
            }
            PartialState::Max(max) => {
                if let Some(n) = field.and_then(Number::from_value) {
                    *max = Some(pick(*max, n, Ordering::Greater));
                }
            }
            PartialState::Avg { sum, count } => {
                if let Some(n) = field.and_then(Number::from_value) {
                    sum.add(n);
                    *count += 1;
                }
            }
            PartialState::ApproxDistinct(hll) => {
                if let Some(v) = field.filter(|v| !v.is_null()) {
                    hll.insert(v.canonical().as_str());
                }
            }
        }
    }

    /// Merges two partial states of the same function; mismatched kinds are left untouched.
    fn merge(&mut self, other: &PartialState) {
        match (self, other) {
            (PartialState::Count(a), PartialState::Count(b)) => *a += b,
            (PartialState::Sum(a), PartialState::Sum(b)) => a.merge(b),
            (PartialState::Min(a), PartialState::Min(b)) => {
                if let Some(b) = b {
                    *a = Some(pick(*a, *b, Ordering::Less));
                }
            }
            (PartialState::Max(a), PartialState::Max(b)) => {
                if let Some(b) = b {
                    *a = Some(pick(*a, *b, Ordering::Greater));
                }
            }
            (
                PartialState::Avg { sum, count },
                PartialState::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                sum.merge(other_sum);
                *count += other_count;
            }
            (PartialState::ApproxDistinct(a), PartialState::ApproxDistinct(b)) => a.merge(b),
            _ => {}
        }
    }

    fn result(&self) -> Value {
        match self {
            PartialState::Count(count) => Value::Int(i64::try_from(*count).unwrap_or(i64::MAX)),
            PartialState::Sum(sum) => sum.value(),
            PartialState::Min(n) | PartialState::Max(n) => {
                n.map(Number::into_value).unwrap_or(Value::Null)
            }
            PartialState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Float(sum.total() / *count as f64)
                }
            }
            PartialState::ApproxDistinct(hll) => {
                Value::Int(i64::try_from(hll.estimate()).unwrap_or(i64::MAX))
            }
        }
    }
}

/// Keeps `candidate` over `current` when it compares as `wanted`. Equal magnitudes prefer the int
/// so the outcome does not depend on which side of a merge a value came from.
fn pick(current: Option<Number>, candidate: Number, wanted: Ordering) -> Number {
    let Some(current) = current else {
        return candidate;
    };
    match candidate.order(current) {
        Ordering::Equal => match (current, candidate) {
            (Number::Float(_), Number::Int(_)) => candidate,
            _ => current,
        },
        o if o == wanted => candidate,
        _ => current,
    }
}

/// Partial aggregation state of one window: the number of records folded in and one partial
/// state per named aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    pub record_count: u64,
    pub states: BTreeMap<String, PartialState>,
}

impl Accumulator {
    pub fn new(aggregations: &[AggregationSpec]) -> Self {
        Self {
            record_count: 0,
            states: aggregations
                .iter()
                .map(|spec| (spec.name.clone(), PartialState::new(spec.function)))
                .collect(),
        }
    }

    /// Folds one record in, O(1) per aggregation.
    pub fn update(&mut self, aggregations: &[AggregationSpec], record: &Record) {
        self.record_count += 1;
        for spec in aggregations {
            let field = spec.field.as_deref().and_then(|f| record.field(f));
            if let Some(state) = self.states.get_mut(&spec.name) {
                state.update(field, spec.field.is_some());
            }
        }
    }

    /// Associative and commutative merge of two partial aggregates of the same window.
    pub fn merge(&mut self, other: &Accumulator) {
        self.record_count += other.record_count;
        for (name, theirs) in &other.states {
            match self.states.get_mut(name) {
                Some(mine) => mine.merge(theirs),
                None => {
                    self.states.insert(name.clone(), theirs.clone());
                }
            }
        }
    }

    /// Functional form of [`Accumulator::merge`].
    pub fn merged(mut self, other: &Accumulator) -> Accumulator {
        self.merge(other);
        self
    }

    pub fn results(&self) -> BTreeMap<String, Value> {
        self.states
            .iter()
            .map(|(name, state)| (name.clone(), state.result()))
            .collect()
    }
}
