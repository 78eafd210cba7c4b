pub mod cursor;
pub mod event;
pub mod id;
pub mod record;
mod timestamp;

pub use self::cursor::{Cursor, next_cursor};
pub use self::id::{FollowId, RecordId, UserId};
pub use self::record::{FollowEdge, SleepRecord};
pub use self::timestamp::{Timestamp, TimestampParseError};

/// Define a `u64`-backed identifier newtype
///
/// Identifiers are allocated sequentially by the relational store, so their
/// natural ordering is also their allocation order.
#[macro_export]
macro_rules! define_id_type {
    (
        $(#[$outer:meta])*
        struct $t:ident
    ) => {
        $(#[$outer])*
        #[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
        #[derive(
            Copy,
            Clone,
            Hash,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t(u64);

        impl $t {
            pub const ZERO: Self = Self(0);
            pub const MAX: Self = Self(u64::MAX);

            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $t {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }

        impl From<$t> for u64 {
            fn from(v: $t) -> Self {
                v.0
            }
        }

        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $t {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}
