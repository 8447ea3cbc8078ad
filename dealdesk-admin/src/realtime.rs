//! Realtime channel presets for the admin screens.
//!
//! One channel per table. Each lists the cache keys a change on that table can
//! make stale. `profiles` also protects the connection request lists because
//! they embed the user row.

use dealdesk_core::{DealDeskResult, TableName};
use dealdesk_query::{
    ChangeFilter, ChannelSpec, KeyFilter, QueryClient, QueryKey, QueryScope, RealtimeTransport,
    SubscriptionHandle,
};
use std::sync::Arc;
use tracing::info;

/// Channel name for a table, e.g. `admin-connection_requests`.
pub fn channel_name(table: TableName) -> String {
    format!("admin-{}", table)
}

/// Cache keys invalidated by a change on `table`.
pub fn protected_keys(table: TableName) -> Vec<KeyFilter> {
    match table {
        TableName::Profiles => vec![
            QueryKey::admin_users().prefix(),
            QueryKey::connection_requests().prefix(),
            KeyFilter::Scope(QueryScope::UserConnectionRequests),
        ],
        TableName::ConnectionRequests => vec![
            QueryKey::connection_requests().prefix(),
            KeyFilter::Scope(QueryScope::UserConnectionRequests),
        ],
        TableName::Listings => vec![
            QueryKey::listings().prefix(),
            KeyFilter::Scope(QueryScope::ListingDetail),
            KeyFilter::Scope(QueryScope::BuyerScores),
        ],
        TableName::Deals => vec![
            QueryKey::deals().prefix(),
            KeyFilter::Scope(QueryScope::DealDetail),
        ],
        TableName::FirmAgreements => vec![QueryKey::firm_agreements().prefix()],
    }
}

/// Channel spec for one table in `schema`.
pub fn channel_for(schema: &str, table: TableName) -> ChannelSpec {
    protected_keys(table)
        .into_iter()
        .fold(
            ChannelSpec::new(channel_name(table), ChangeFilter::new(schema, table)),
            ChannelSpec::invalidates,
        )
}

/// Channel specs for every table.
pub fn channel_presets(schema: &str) -> Vec<ChannelSpec> {
    TableName::ALL
        .into_iter()
        .map(|table| channel_for(schema, table))
        .collect()
}

/// Subscribe every preset channel using the client's configured schema.
///
/// Dropping the returned handles closes the channels.
pub async fn subscribe_all(
    client: &QueryClient,
    transport: Arc<dyn RealtimeTransport>,
) -> DealDeskResult<Vec<SubscriptionHandle>> {
    let bridge = client.realtime(transport);
    let mut handles = Vec::new();
    for spec in channel_presets(&client.config().realtime.schema) {
        handles.push(bridge.subscribe(spec).await?);
    }
    info!(channels = handles.len(), "Subscribed admin realtime channels");
    Ok(handles)
}
