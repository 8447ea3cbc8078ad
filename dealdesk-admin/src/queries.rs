//! Admin reads.
//!
//! Every read goes through the shared [`QueryClient`] so that mutations and
//! realtime changes can patch and invalidate what the admin screens show.
//! Fetchers are registered with the cache, which lets the invalidation
//! fan-out refetch an observed list without the screen asking again.

use dealdesk_core::{
    Backend, ConnectionRequest, Deal, DealDeskError, DealDeskResult, DealId, FirmAgreement,
    Listing, ListingId, ListingStatus, PageRequest, Profile, RequestListFilter, RequestStatus,
    TableName, UserId,
};
use dealdesk_query::{typed_fetcher, QueryClient, QueryFetcher, QueryKey, QueryObserver};
use std::sync::Arc;
use tracing::debug;

/// Cache key for a connection request list.
///
/// Lists narrowed to one user live under `user-connection-requests`, every
/// other variant under `connection-requests`, extended by status and page.
pub fn request_list_key(filter: &RequestListFilter) -> QueryKey {
    let mut key = match filter.user_id {
        Some(user_id) => QueryKey::user_connection_requests(user_id),
        None => QueryKey::connection_requests(),
    };
    if let Some(status) = filter.status {
        key = key.with_status(status);
    }
    if let Some(page) = filter.page {
        key = key.with_page(page.page, page.page_size);
    }
    key
}

/// Typed reads for the admin screens.
#[derive(Clone)]
pub struct AdminQueries {
    client: QueryClient,
    backend: Arc<dyn Backend>,
}

impl AdminQueries {
    pub fn new(client: QueryClient, backend: Arc<dyn Backend>) -> Self {
        Self { client, backend }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    // ========================================================================
    // CONNECTION REQUESTS
    // ========================================================================

    pub async fn connection_requests(
        &self,
        filter: RequestListFilter,
    ) -> DealDeskResult<Vec<ConnectionRequest>> {
        let key = request_list_key(&filter);
        let backend = Arc::clone(&self.backend);
        let fetcher = typed_fetcher(move |_key| {
            let backend = Arc::clone(&backend);
            let filter = filter.clone();
            async move { backend.list_connection_requests(&filter).await }
        });
        self.client.query_data(&key, fetcher).await
    }

    pub async fn all_connection_requests(&self) -> DealDeskResult<Vec<ConnectionRequest>> {
        self.connection_requests(RequestListFilter::default()).await
    }

    pub async fn connection_requests_page(
        &self,
        page: u32,
        page_size: u32,
    ) -> DealDeskResult<Vec<ConnectionRequest>> {
        self.connection_requests(RequestListFilter {
            page: Some(PageRequest::new(page, page_size)),
            ..Default::default()
        })
        .await
    }

    pub async fn connection_requests_with_status(
        &self,
        status: RequestStatus,
    ) -> DealDeskResult<Vec<ConnectionRequest>> {
        self.connection_requests(RequestListFilter {
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    pub async fn user_connection_requests(
        &self,
        user_id: UserId,
    ) -> DealDeskResult<Vec<ConnectionRequest>> {
        self.connection_requests(RequestListFilter {
            user_id: Some(user_id),
            ..Default::default()
        })
        .await
    }

    // ========================================================================
    // USERS
    // ========================================================================

    pub async fn admin_users(&self) -> DealDeskResult<Vec<Profile>> {
        self.client
            .query_data(&QueryKey::admin_users(), self.users_fetcher())
            .await
    }

    fn users_fetcher(&self) -> Arc<dyn QueryFetcher> {
        let backend = Arc::clone(&self.backend);
        typed_fetcher(move |_key| {
            let backend = Arc::clone(&backend);
            async move { backend.list_profiles().await }
        })
    }

    // ========================================================================
    // LISTINGS
    // ========================================================================

    pub async fn listings(&self, status: Option<ListingStatus>) -> DealDeskResult<Vec<Listing>> {
        let key = match status {
            Some(status) => QueryKey::listings_with_status(status),
            None => QueryKey::listings(),
        };
        let backend = Arc::clone(&self.backend);
        let fetcher = typed_fetcher(move |_key| {
            let backend = Arc::clone(&backend);
            async move { backend.list_listings(status).await }
        });
        self.client.query_data(&key, fetcher).await
    }

    /// One listing, or `NotFound` if the backend has no such row.
    pub async fn listing(&self, id: ListingId) -> DealDeskResult<Listing> {
        let backend = Arc::clone(&self.backend);
        let fetcher = typed_fetcher(move |_key| {
            let backend = Arc::clone(&backend);
            async move { backend.get_listing(id).await }
        });
        let row: Option<Listing> = self
            .client
            .query_data(&QueryKey::listing(id), fetcher)
            .await?;
        row.ok_or_else(|| not_found(TableName::Listings, id))
    }

    // ========================================================================
    // DEALS
    // ========================================================================

    pub async fn deals(&self) -> DealDeskResult<Vec<Deal>> {
        let backend = Arc::clone(&self.backend);
        let fetcher = typed_fetcher(move |_key| {
            let backend = Arc::clone(&backend);
            async move { backend.list_deals().await }
        });
        self.client.query_data(&QueryKey::deals(), fetcher).await
    }

    pub async fn deal(&self, id: DealId) -> DealDeskResult<Deal> {
        let backend = Arc::clone(&self.backend);
        let fetcher = typed_fetcher(move |_key| {
            let backend = Arc::clone(&backend);
            async move { backend.get_deal(id).await }
        });
        let row: Option<Deal> = self.client.query_data(&QueryKey::deal(id), fetcher).await?;
        row.ok_or_else(|| not_found(TableName::Deals, id))
    }

    // ========================================================================
    // FIRM AGREEMENTS
    // ========================================================================

    pub async fn firm_agreements(&self) -> DealDeskResult<Vec<FirmAgreement>> {
        let backend = Arc::clone(&self.backend);
        let fetcher = typed_fetcher(move |_key| {
            let backend = Arc::clone(&backend);
            async move { backend.list_firm_agreements().await }
        });
        self.client
            .query_data(&QueryKey::firm_agreements(), fetcher)
            .await
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    /// Keep the connection request list for `filter` loaded and observed, so
    /// the fan-out refetches it instead of only marking it stale.
    pub async fn watch_connection_requests(
        &self,
        filter: RequestListFilter,
    ) -> DealDeskResult<QueryObserver> {
        let key = request_list_key(&filter);
        let observer = self.client.observe(&key);
        self.connection_requests(filter).await?;
        debug!(key = %key, "Watching connection requests");
        Ok(observer)
    }

    pub async fn watch_admin_users(&self) -> DealDeskResult<QueryObserver> {
        let observer = self.client.observe(&QueryKey::admin_users());
        self.admin_users().await?;
        Ok(observer)
    }
}

fn not_found(table: TableName, id: impl ToString) -> DealDeskError {
    DealDeskError::NotFound {
        table,
        id: id.to_string(),
    }
}
