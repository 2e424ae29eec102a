//! Broker-native filter expressions.
//!
//! A filter is what a partition link is opened with: a single comparison
//! against one event attribute. Because every attribute is ordered consistently
//! with the partition log, a filter selects a suffix of the log: once an event
//! matches, every later event matches too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ReceivedEvent;
use crate::id::{Offset, SequenceNumber};

/// Event attribute a filter compares against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAttribute {
    Offset,
    SequenceNumber,
    EnqueuedTime,
}

impl FilterAttribute {
    /// Annotation name the broker evaluates the selector against.
    pub fn annotation(&self) -> &'static str {
        match self {
            Self::Offset => "amqp.annotation.x-opt-offset",
            Self::SequenceNumber => "amqp.annotation.x-opt-sequence-number",
            Self::EnqueuedTime => "amqp.annotation.x-opt-enqueued-time",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    GreaterOrEqual,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterOrEqual => ">=",
        }
    }

    pub fn from_inclusive(inclusive: bool) -> Self {
        if inclusive {
            Self::GreaterOrEqual
        } else {
            Self::GreaterThan
        }
    }

    fn holds<T: Ord>(&self, actual: T, bound: T) -> bool {
        match self {
            Self::GreaterThan => actual > bound,
            Self::GreaterOrEqual => actual >= bound,
        }
    }
}

/// Value a filter compares against; the variant determines the attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "attribute", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    Offset(Offset),
    SequenceNumber(SequenceNumber),
    EnqueuedTime(DateTime<Utc>),
}

impl FilterValue {
    pub fn attribute(&self) -> FilterAttribute {
        match self {
            Self::Offset(_) => FilterAttribute::Offset,
            Self::SequenceNumber(_) => FilterAttribute::SequenceNumber,
            Self::EnqueuedTime(_) => FilterAttribute::EnqueuedTime,
        }
    }
}

/// `attribute <comparison> value`, as sent to the broker when opening a link.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterExpression {
    comparison: Comparison,
    value: FilterValue,
}

impl FilterExpression {
    pub fn new(comparison: Comparison, value: FilterValue) -> Self {
        Self { comparison, value }
    }

    pub fn comparison(&self) -> Comparison {
        self.comparison
    }

    pub fn value(&self) -> FilterValue {
        self.value
    }

    pub fn attribute(&self) -> FilterAttribute {
        self.value.attribute()
    }

    pub fn is_inclusive(&self) -> bool {
        self.comparison == Comparison::GreaterOrEqual
    }

    /// Whether `event` is selected by this filter.
    pub fn matches(&self, event: &ReceivedEvent) -> bool {
        match self.value {
            FilterValue::Offset(bound) => self.comparison.holds(event.offset(), bound),
            FilterValue::SequenceNumber(bound) => {
                self.comparison.holds(event.sequence_number(), bound)
            }
            FilterValue::EnqueuedTime(bound) => {
                self.comparison.holds(event.enqueued_time(), bound)
            }
        }
    }

    /// Index of the first event in `log` this filter selects (`log.len()` if none).
    ///
    /// `log` must be in partition order.
    pub fn first_match(&self, log: &[ReceivedEvent]) -> usize {
        log.partition_point(|event| !self.matches(event))
    }
}

/// Renders the selector text understood by the broker.
///
/// Enqueue times are rendered as Unix epoch milliseconds.
impl core::fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let attribute = self.attribute().annotation();
        let op = self.comparison.symbol();
        match self.value {
            FilterValue::Offset(v) => write!(f, "{attribute} {op} '{v}'"),
            FilterValue::SequenceNumber(v) => write!(f, "{attribute} {op} '{v}'"),
            FilterValue::EnqueuedTime(t) => {
                write!(f, "{attribute} {op} '{}'", t.timestamp_millis())
            }
        }
    }
}
