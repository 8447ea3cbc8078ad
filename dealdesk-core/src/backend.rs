//! Seams to the hosted backend.
//!
//! The relational store and the serverless functions are external
//! collaborators. These traits are the only surface the rest of the workspace
//! sees; production code plugs in an HTTP client, tests plug in the in-memory
//! implementations from `dealdesk-test-utils`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ConnectionRequest, ConnectionRequestPatch, DealDeskResult, Deal, DealId, DealPatch,
    FirmAgreement, FirmAgreementPatch, FirmId, Listing, ListingId, ListingPatch, ListingStatus,
    Profile, ProfilePatch, RequestId, RequestStatus, UserId,
};

/// Filter for connection request reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestListFilter {
    pub status: Option<RequestStatus>,
    pub user_id: Option<UserId>,
    pub page: Option<PageRequest>,
}

/// Offset pagination, 1-based page numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Offset of the first row on this page.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }
}

/// Table reads and writes against the hosted store.
///
/// Every write is a single remote call that is applied at most once; callers
/// must not retry writes.
#[async_trait]
pub trait Backend: Send + Sync {
    // ========================================================================
    // CONNECTION REQUESTS
    // ========================================================================

    /// List connection requests, newest first, with the user sub-record joined.
    async fn list_connection_requests(
        &self,
        filter: &RequestListFilter,
    ) -> DealDeskResult<Vec<ConnectionRequest>>;

    /// Update one connection request and return the stored row.
    async fn update_connection_request(
        &self,
        id: RequestId,
        patch: &ConnectionRequestPatch,
    ) -> DealDeskResult<ConnectionRequest>;

    // ========================================================================
    // PROFILES
    // ========================================================================

    async fn list_profiles(&self) -> DealDeskResult<Vec<Profile>>;

    async fn update_profile(&self, id: UserId, patch: &ProfilePatch) -> DealDeskResult<Profile>;

    // ========================================================================
    // LISTINGS
    // ========================================================================

    async fn list_listings(&self, status: Option<ListingStatus>) -> DealDeskResult<Vec<Listing>>;

    async fn get_listing(&self, id: ListingId) -> DealDeskResult<Option<Listing>>;

    async fn update_listing(&self, id: ListingId, patch: &ListingPatch) -> DealDeskResult<Listing>;

    // ========================================================================
    // DEALS
    // ========================================================================

    async fn list_deals(&self) -> DealDeskResult<Vec<Deal>>;

    async fn get_deal(&self, id: DealId) -> DealDeskResult<Option<Deal>>;

    async fn update_deal(&self, id: DealId, patch: &DealPatch) -> DealDeskResult<Deal>;

    // ========================================================================
    // FIRM AGREEMENTS
    // ========================================================================

    async fn list_firm_agreements(&self) -> DealDeskResult<Vec<FirmAgreement>>;

    async fn update_firm_agreement(
        &self,
        id: FirmId,
        patch: &FirmAgreementPatch,
    ) -> DealDeskResult<FirmAgreement>;

    // ========================================================================
    // REMOTE PROCEDURES
    // ========================================================================

    /// Call a stored procedure by name.
    async fn rpc(&self, name: &str, args: Value) -> DealDeskResult<Value>;
}

/// Invokes named serverless functions with a JSON body.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, name: &str, body: Value) -> DealDeskResult<Value>;
}
