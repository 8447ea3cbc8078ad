//! DealDesk Core - Entity Types
//!
//! Row types, typed identifiers, the error taxonomy, client configuration and
//! the traits that stand in for the hosted backend. This crate contains no
//! caching or mutation logic; `dealdesk-query` builds on it.

pub mod backend;
pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod identity;

pub use backend::{Backend, FunctionInvoker, PageRequest, RequestListFilter};
pub use config::{ClientConfig, MutationConfig, QueryConfig, RealtimeConfig, RetryConfig};
pub use entities::{
    ConnectionRequest, ConnectionRequestPatch, Deal, DealPatch, FirmAgreement,
    FirmAgreementPatch, Listing, ListingPatch, Profile, ProfilePatch, UserSummary,
};
pub use enums::{
    AgreementKind, AgreementStatus, ApprovalStatus, DealStage, ListingStatus, RequestStatus,
    TableName,
};
pub use error::{
    AuthError, CacheError, ConfigError, ConflictError, DealDeskError, DealDeskResult, ErrorKind,
    FunctionError, RealtimeError, TransportError, ValidationError,
};
pub use identity::{DealId, EntityIdType, FirmId, ListingId, RequestId, Timestamp, UserId};
