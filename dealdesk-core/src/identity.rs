//! Identity types for DealDesk entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Common behaviour for the strongly-typed row identifiers.
///
/// Every table row is keyed by a UUID on the backend. Wrapping each table's
/// key in its own newtype keeps a `ListingId` from being passed where a
/// `UserId` is expected.
pub trait EntityIdType:
    Copy + Eq + std::hash::Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Wrap a raw UUID.
    fn from_uuid(uuid: Uuid) -> Self;

    /// Unwrap to the raw UUID.
    fn as_uuid(&self) -> Uuid;

    /// Generate a new timestamp-sortable identifier.
    fn now_v7() -> Self {
        Self::from_uuid(Uuid::now_v7())
    }

    /// Build an identifier from a fixed integer (handy for fixtures).
    fn from_u128(value: u128) -> Self {
        Self::from_uuid(Uuid::from_u128(value))
    }
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl EntityIdType for $name {
            fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

entity_id!(
    /// Identifier of a row in `profiles` (a marketplace user).
    UserId
);
entity_id!(
    /// Identifier of a row in `listings`.
    ListingId
);
entity_id!(
    /// Identifier of a row in `connection_requests`.
    RequestId
);
entity_id!(
    /// Identifier of a row in `deals`.
    DealId
);
entity_id!(
    /// Identifier of a row in `firm_agreements`.
    FirmId
);
