//! Strongly-typed identifiers and stream coordinates.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::ReceiveError;

/// Name of the consumer group every stream carries by default.
pub const DEFAULT_CONSUMER_GROUP: &str = "$default";

/// Identifier of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConsumerGroup(String);

/// Identifier of a partition within the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionId(String);

macro_rules! impl_name_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create an identifier, rejecting empty or whitespace-only names.
            pub fn new(value: impl Into<String>) -> Result<Self, ReceiveError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(ReceiveError::invalid_identifier(format!(
                        "{}: must not be empty",
                        $name
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = ReceiveError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $t {
            type Error = ReceiveError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = ReceiveError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_name_newtype!(ConsumerGroup, "ConsumerGroup");
impl_name_newtype!(PartitionId, "PartitionId");

impl ConsumerGroup {
    pub fn default_group() -> Self {
        Self(DEFAULT_CONSUMER_GROUP.to_string())
    }
}

impl Default for ConsumerGroup {
    fn default() -> Self {
        Self::default_group()
    }
}

/// Broker-assigned byte position of an event within its partition.
///
/// Only ordering within one partition is meaningful.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(i64);

/// Broker-assigned, gapless, per-partition event counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(i64);

macro_rules! impl_counter_newtype {
    ($t:ty) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn value(self) -> i64 {
                self.0
            }

            pub const fn is_negative(self) -> bool {
                self.0 < 0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_counter_newtype!(Offset);
impl_counter_newtype!(SequenceNumber);

impl SequenceNumber {
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}
