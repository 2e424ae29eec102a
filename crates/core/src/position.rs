//! Starting positions for a partition read.
//!
//! A [`Position`] names exactly one place in a partition, using whichever
//! scheme the caller has at hand: a symbolic marker, an offset, a sequence
//! number or an enqueue timestamp. Value positions carry their own inclusivity
//! flag; the symbolic markers have fixed semantics.
//!
//! [`PositionConfig`] is the loosely-typed shape positions take in configuration
//! files. It is converted (and validated) into a `Position` before use.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReceiveError, ReceiveResult};
use crate::event::ReceivedEvent;
use crate::id::{Offset, SequenceNumber};

/// Where a partition read starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Position {
    /// Before the first retained event.
    StreamStart,

    /// After every event present when the read is opened.
    StreamEnd,

    Offset { value: Offset, inclusive: bool },

    SequenceNumber { value: SequenceNumber, inclusive: bool },

    /// Broker enqueue time. Several events may share a timestamp.
    Timestamp { value: DateTime<Utc>, inclusive: bool },
}

impl Position {
    /// Exclusive offset position.
    pub fn offset(value: impl Into<Offset>) -> Self {
        Self::Offset {
            value: value.into(),
            inclusive: false,
        }
    }

    /// Exclusive sequence-number position.
    pub fn sequence_number(value: impl Into<SequenceNumber>) -> Self {
        Self::SequenceNumber {
            value: value.into(),
            inclusive: false,
        }
    }

    /// Exclusive enqueue-time position.
    pub fn enqueued_time(value: DateTime<Utc>) -> Self {
        Self::Timestamp {
            value,
            inclusive: false,
        }
    }

    /// The same position, but including the event located exactly at it.
    ///
    /// No effect on the symbolic markers.
    pub fn inclusive(self) -> Self {
        self.with_inclusive(true)
    }

    pub fn with_inclusive(self, inclusive: bool) -> Self {
        match self {
            Self::StreamStart | Self::StreamEnd => self,
            Self::Offset { value, .. } => Self::Offset { value, inclusive },
            Self::SequenceNumber { value, .. } => Self::SequenceNumber { value, inclusive },
            Self::Timestamp { value, .. } => Self::Timestamp { value, inclusive },
        }
    }

    pub fn is_inclusive(&self) -> bool {
        match self {
            Self::StreamStart => true,
            Self::StreamEnd => false,
            Self::Offset { inclusive, .. }
            | Self::SequenceNumber { inclusive, .. }
            | Self::Timestamp { inclusive, .. } => *inclusive,
        }
    }

    /// Positions that can only be resolved against the partition's current tail.
    pub fn requires_partition_tail(&self) -> bool {
        matches!(self, Self::StreamEnd)
    }

    /// Exclusive position just after `event`, in the given scheme.
    pub fn after(event: &ReceivedEvent, scheme: PositionScheme) -> Self {
        match scheme {
            PositionScheme::Offset => Self::offset(event.offset()),
            PositionScheme::SequenceNumber => Self::sequence_number(event.sequence_number()),
            PositionScheme::Timestamp => Self::enqueued_time(event.enqueued_time()),
        }
    }

    /// Check value constraints that the type alone cannot express.
    pub fn validate(&self) -> ReceiveResult<()> {
        match self {
            Self::Offset { value, .. } if value.is_negative() => Err(
                ReceiveError::invalid_position(format!("offset must not be negative (got {value})")),
            ),
            Self::SequenceNumber { value, .. } if value.is_negative() => {
                Err(ReceiveError::invalid_position(format!(
                    "sequence number must not be negative (got {value})"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// The value schemes a position can be expressed in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PositionScheme {
    Offset,
    SequenceNumber,
    Timestamp,
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let marker = if self.is_inclusive() { "+" } else { "" };
        match self {
            Self::StreamStart => f.write_str("@start"),
            Self::StreamEnd => f.write_str("@latest"),
            Self::Offset { value, .. } => write!(f, "offset:{value}{marker}"),
            Self::SequenceNumber { value, .. } => write!(f, "seq:{value}{marker}"),
            Self::Timestamp { value, .. } => write!(f, "time:{}{marker}", value.to_rfc3339()),
        }
    }
}

/// Configuration form of a position: any subset of fields may be present in
/// the input, but exactly one of them must be set for it to be usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PositionConfig {
    pub start: bool,
    pub latest: bool,
    pub offset: Option<i64>,
    pub sequence_number: Option<i64>,
    pub enqueued_time: Option<DateTime<Utc>>,
    pub inclusive: bool,
}

impl TryFrom<PositionConfig> for Position {
    type Error = ReceiveError;

    fn try_from(config: PositionConfig) -> Result<Self, Self::Error> {
        let set = [
            config.start,
            config.latest,
            config.offset.is_some(),
            config.sequence_number.is_some(),
            config.enqueued_time.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();

        if set != 1 {
            return Err(ReceiveError::invalid_position(format!(
                "exactly one of start, latest, offset, sequence_number, enqueued_time must be set (found {set})"
            )));
        }

        let position = match (
            config.start,
            config.latest,
            config.offset,
            config.sequence_number,
            config.enqueued_time,
        ) {
            (true, ..) => Position::StreamStart,
            (_, true, ..) => Position::StreamEnd,
            (_, _, Some(offset), ..) => Position::offset(offset),
            (_, _, _, Some(seq), _) => Position::sequence_number(seq),
            (_, _, _, _, Some(time)) => Position::enqueued_time(time),
            _ => return Err(ReceiveError::invalid_position("no position given")),
        };

        let position = position.with_inclusive(config.inclusive);
        position.validate()?;
        Ok(position)
    }
}

impl From<Position> for PositionConfig {
    fn from(position: Position) -> Self {
        let mut config = PositionConfig {
            inclusive: position.is_inclusive(),
            ..PositionConfig::default()
        };
        match position {
            Position::StreamStart => config.start = true,
            Position::StreamEnd => {
                config.latest = true;
                config.inclusive = false;
            }
            Position::Offset { value, .. } => config.offset = Some(value.value()),
            Position::SequenceNumber { value, .. } => config.sequence_number = Some(value.value()),
            Position::Timestamp { value, .. } => config.enqueued_time = Some(value),
        }
        config
    }
}

/// Parses the textual forms `@start`, `-1`, `@latest`, `offset:<n>`, `<n>`,
/// `seq:<n>`, `time:<rfc3339>`. A trailing `+` marks the position inclusive.
impl FromStr for Position {
    type Err = ReceiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (body, inclusive) = match s.strip_suffix('+') {
            Some(body) => (body.trim_end(), true),
            None => (s, false),
        };

        let parse_int = |raw: &str, what: &str| {
            raw.trim().parse::<i64>().map_err(|e| {
                ReceiveError::invalid_position(format!("{what} '{raw}' is not an integer: {e}"))
            })
        };

        let position = match body {
            "@start" | "-1" => Position::StreamStart,
            "@latest" => Position::StreamEnd,
            _ => {
                if let Some(raw) = body.strip_prefix("offset:") {
                    Position::offset(parse_int(raw, "offset")?)
                } else if let Some(raw) = body
                    .strip_prefix("seq:")
                    .or_else(|| body.strip_prefix("sequence:"))
                {
                    Position::sequence_number(parse_int(raw, "sequence number")?)
                } else if let Some(raw) = body.strip_prefix("time:") {
                    let time = DateTime::parse_from_rfc3339(raw.trim()).map_err(|e| {
                        ReceiveError::invalid_position(format!("timestamp '{raw}': {e}"))
                    })?;
                    Position::enqueued_time(time.with_timezone(&Utc))
                } else if body.starts_with('@') {
                    return Err(ReceiveError::invalid_position(format!(
                        "unknown marker '{body}'"
                    )));
                } else {
                    Position::offset(parse_int(body, "offset")?)
                }
            }
        };

        let position = position.with_inclusive(inclusive);
        position.validate()?;
        Ok(position)
    }
}
