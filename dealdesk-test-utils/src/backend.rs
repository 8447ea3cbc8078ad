//! In-memory backend with fault and latency injection.

use async_trait::async_trait;
use chrono::Utc;
use dealdesk_core::{
    Backend, ConnectionRequest, ConnectionRequestPatch, Deal, DealDeskError, DealDeskResult,
    DealId, DealPatch, FirmAgreement, FirmAgreementPatch, FirmId, Listing, ListingId,
    ListingPatch, ListingStatus, Profile, ProfilePatch, RequestId, RequestListFilter, TableName,
    UserId,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Tables {
    profiles: Vec<Profile>,
    requests: Vec<ConnectionRequest>,
    listings: Vec<Listing>,
    deals: Vec<Deal>,
    firms: Vec<FirmAgreement>,
    rpc_results: HashMap<String, Value>,
}

#[derive(Debug, Default)]
struct Faults {
    write_errors: VecDeque<DealDeskError>,
    read_errors: VecDeque<DealDeskError>,
    write_delays: VecDeque<Duration>,
    default_write_delay: Duration,
    read_delay: Duration,
}

/// Backend that keeps every table in memory.
///
/// Writes are applied when they complete, after any injected delay, so two
/// overlapping writes land in completion order like they would on a server.
/// Connection request reads join the current profile as the `user`
/// sub-record.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    writes: AtomicU64,
    reads: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // SEEDING
    // ========================================================================

    pub fn with_profiles(self, profiles: impl IntoIterator<Item = Profile>) -> Self {
        lock(&self.tables).profiles.extend(profiles);
        self
    }

    pub fn with_requests(self, requests: impl IntoIterator<Item = ConnectionRequest>) -> Self {
        lock(&self.tables).requests.extend(requests);
        self
    }

    pub fn with_listings(self, listings: impl IntoIterator<Item = Listing>) -> Self {
        lock(&self.tables).listings.extend(listings);
        self
    }

    pub fn with_deals(self, deals: impl IntoIterator<Item = Deal>) -> Self {
        lock(&self.tables).deals.extend(deals);
        self
    }

    pub fn with_firms(self, firms: impl IntoIterator<Item = FirmAgreement>) -> Self {
        lock(&self.tables).firms.extend(firms);
        self
    }

    pub fn set_rpc_result(&self, name: &str, value: Value) {
        lock(&self.tables).rpc_results.insert(name.to_string(), value);
    }

    // ========================================================================
    // FAULT INJECTION
    // ========================================================================

    /// Fail the next write with `error`. Queued errors are used in order.
    pub fn fail_next_write(&self, error: DealDeskError) {
        lock(&self.faults).write_errors.push_back(error);
    }

    pub fn fail_next_read(&self, error: DealDeskError) {
        lock(&self.faults).read_errors.push_back(error);
    }

    /// Delay the next write by `delay`. Queued delays are used in order, then
    /// the default write delay applies.
    pub fn delay_next_write(&self, delay: Duration) {
        lock(&self.faults).write_delays.push_back(delay);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        lock(&self.faults).default_write_delay = delay;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        lock(&self.faults).read_delay = delay;
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn request(&self, id: RequestId) -> Option<ConnectionRequest> {
        let tables = lock(&self.tables);
        tables
            .requests
            .iter()
            .find(|r| r.id == id)
            .map(|r| with_user(r, &tables.profiles))
    }

    pub fn profile(&self, id: UserId) -> Option<Profile> {
        lock(&self.tables).profiles.iter().find(|p| p.id == id).cloned()
    }

    pub fn deal(&self, id: DealId) -> Option<Deal> {
        lock(&self.tables).deals.iter().find(|d| d.id == id).cloned()
    }

    pub fn firm(&self, id: FirmId) -> Option<FirmAgreement> {
        lock(&self.tables).firms.iter().find(|f| f.id == id).cloned()
    }

    pub fn listing(&self, id: ListingId) -> Option<Listing> {
        lock(&self.tables).listings.iter().find(|l| l.id == id).cloned()
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn begin_read(&self) -> DealDeskResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let (error, delay) = {
            let mut faults = lock(&self.faults);
            (faults.read_errors.pop_front(), faults.read_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        error.map_or(Ok(()), Err)
    }

    /// Wait out the injected latency, then report the injected failure if any.
    async fn begin_write(&self) -> DealDeskResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let (error, delay) = {
            let mut faults = lock(&self.faults);
            let delay = faults
                .write_delays
                .pop_front()
                .unwrap_or(faults.default_write_delay);
            (faults.write_errors.pop_front(), delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        error.map_or(Ok(()), Err)
    }
}

fn with_user(request: &ConnectionRequest, profiles: &[Profile]) -> ConnectionRequest {
    let mut request = request.clone();
    request.user = profiles
        .iter()
        .find(|p| p.id == request.user_id)
        .map(Profile::summary);
    request
}

fn not_found(table: TableName, id: impl ToString) -> DealDeskError {
    DealDeskError::NotFound {
        table,
        id: id.to_string(),
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn list_connection_requests(
        &self,
        filter: &RequestListFilter,
    ) -> DealDeskResult<Vec<ConnectionRequest>> {
        self.begin_read().await?;
        let tables = lock(&self.tables);
        let mut rows: Vec<ConnectionRequest> = tables
            .requests
            .iter()
            .filter(|r| filter.status.map_or(true, |status| r.status == status))
            .filter(|r| filter.user_id.map_or(true, |user| r.user_id == user))
            .map(|r| with_user(r, &tables.profiles))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(page) = filter.page {
            rows = rows
                .into_iter()
                .skip(page.offset())
                .take(page.page_size as usize)
                .collect();
        }
        Ok(rows)
    }

    async fn update_connection_request(
        &self,
        id: RequestId,
        patch: &ConnectionRequestPatch,
    ) -> DealDeskResult<ConnectionRequest> {
        self.begin_write().await?;
        let mut tables = lock(&self.tables);
        let row = tables
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| not_found(TableName::ConnectionRequests, id))?;
        patch.apply_to(row, Utc::now());
        let row = row.clone();
        Ok(with_user(&row, &tables.profiles))
    }

    async fn list_profiles(&self) -> DealDeskResult<Vec<Profile>> {
        self.begin_read().await?;
        let mut rows = lock(&self.tables).profiles.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn update_profile(&self, id: UserId, patch: &ProfilePatch) -> DealDeskResult<Profile> {
        self.begin_write().await?;
        let mut tables = lock(&self.tables);
        let row = tables
            .profiles
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| not_found(TableName::Profiles, id))?;
        patch.apply_to(row, Utc::now());
        Ok(row.clone())
    }

    async fn list_listings(&self, status: Option<ListingStatus>) -> DealDeskResult<Vec<Listing>> {
        self.begin_read().await?;
        let tables = lock(&self.tables);
        Ok(tables
            .listings
            .iter()
            .filter(|l| status.map_or(true, |s| l.status == s))
            .cloned()
            .collect())
    }

    async fn get_listing(&self, id: ListingId) -> DealDeskResult<Option<Listing>> {
        self.begin_read().await?;
        Ok(self.listing(id))
    }

    async fn update_listing(&self, id: ListingId, patch: &ListingPatch) -> DealDeskResult<Listing> {
        self.begin_write().await?;
        let mut tables = lock(&self.tables);
        let row = tables
            .listings
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| not_found(TableName::Listings, id))?;
        patch.apply_to(row, Utc::now());
        Ok(row.clone())
    }

    async fn list_deals(&self) -> DealDeskResult<Vec<Deal>> {
        self.begin_read().await?;
        Ok(lock(&self.tables).deals.clone())
    }

    async fn get_deal(&self, id: DealId) -> DealDeskResult<Option<Deal>> {
        self.begin_read().await?;
        Ok(self.deal(id))
    }

    async fn update_deal(&self, id: DealId, patch: &DealPatch) -> DealDeskResult<Deal> {
        self.begin_write().await?;
        let mut tables = lock(&self.tables);
        let row = tables
            .deals
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| not_found(TableName::Deals, id))?;
        patch.apply_to(row, Utc::now());
        Ok(row.clone())
    }

    async fn list_firm_agreements(&self) -> DealDeskResult<Vec<FirmAgreement>> {
        self.begin_read().await?;
        Ok(lock(&self.tables).firms.clone())
    }

    async fn update_firm_agreement(
        &self,
        id: FirmId,
        patch: &FirmAgreementPatch,
    ) -> DealDeskResult<FirmAgreement> {
        self.begin_write().await?;
        let mut tables = lock(&self.tables);
        let row = tables
            .firms
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| not_found(TableName::FirmAgreements, id))?;
        patch.apply_to(row, Utc::now());
        Ok(row.clone())
    }

    async fn rpc(&self, name: &str, _args: Value) -> DealDeskResult<Value> {
        self.begin_read().await?;
        lock(&self.tables)
            .rpc_results
            .get(name)
            .cloned()
            .ok_or_else(|| DealDeskError::from(dealdesk_core::FunctionError::InvocationFailed {
                function: name.to_string(),
                status: 404,
                message: "no such procedure".to_string(),
            }))
    }
}
