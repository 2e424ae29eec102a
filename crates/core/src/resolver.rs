//! Position → filter translation.
//!
//! Pure: the only broker fact it needs (the partition tail, for `StreamEnd`)
//! is passed in by the caller.

use crate::error::ReceiveResult;
use crate::filter::{Comparison, FilterExpression, FilterValue};
use crate::id::{Offset, SequenceNumber};
use crate::position::Position;

/// Lowest offset a partition can hold.
pub const STREAM_START_OFFSET: Offset = Offset::new(0);

/// Turns a [`Position`] into the filter a partition link is opened with.
#[derive(Debug, Default, Clone, Copy)]
pub struct CursorResolver;

impl CursorResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `position`.
    ///
    /// `partition_tail` is the last sequence number enqueued in the partition
    /// at resolution time (`None` for a partition that never held an event).
    /// It is only consulted for `StreamEnd`, which is frozen to it here: later
    /// receives never re-evaluate "latest".
    pub fn resolve(
        &self,
        position: &Position,
        partition_tail: Option<SequenceNumber>,
    ) -> ReceiveResult<FilterExpression> {
        position.validate()?;

        let filter = match *position {
            Position::StreamStart => FilterExpression::new(
                Comparison::GreaterOrEqual,
                FilterValue::Offset(STREAM_START_OFFSET),
            ),
            Position::StreamEnd => match partition_tail {
                Some(tail) => FilterExpression::new(
                    Comparison::GreaterThan,
                    FilterValue::SequenceNumber(tail),
                ),
                None => FilterExpression::new(
                    Comparison::GreaterOrEqual,
                    FilterValue::SequenceNumber(SequenceNumber::new(0)),
                ),
            },
            Position::Offset { value, inclusive } => FilterExpression::new(
                Comparison::from_inclusive(inclusive),
                FilterValue::Offset(value),
            ),
            Position::SequenceNumber { value, inclusive } => FilterExpression::new(
                Comparison::from_inclusive(inclusive),
                FilterValue::SequenceNumber(value),
            ),
            Position::Timestamp { value, inclusive } => FilterExpression::new(
                Comparison::from_inclusive(inclusive),
                FilterValue::EnqueuedTime(value),
            ),
        };

        Ok(filter)
    }
}

/// Resolve with the default resolver.
pub fn resolve(
    position: &Position,
    partition_tail: Option<SequenceNumber>,
) -> ReceiveResult<FilterExpression> {
    CursorResolver.resolve(position, partition_tail)
}
