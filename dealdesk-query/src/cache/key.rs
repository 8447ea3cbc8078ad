//! Strongly-typed query keys.
//!
//! A `QueryKey` is an ordered tuple `(scope, parts...)` compared by structural
//! equality. Keys can only be built through the constructors below, so the
//! same logical view is always cached under the same shape. A `KeyFilter`
//! selects a set of keys for invalidation and optimistic patching.

use dealdesk_core::{
    DealId, EntityIdType, ListingId, ListingStatus, RequestStatus, TableName, UserId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of result set a key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryScope {
    AdminUsers,
    ConnectionRequests,
    UserConnectionRequests,
    Listings,
    ListingDetail,
    Deals,
    DealDetail,
    FirmAgreements,
    BuyerScores,
}

impl QueryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryScope::AdminUsers => "admin-users",
            QueryScope::ConnectionRequests => "connection-requests",
            QueryScope::UserConnectionRequests => "user-connection-requests",
            QueryScope::Listings => "listings",
            QueryScope::ListingDetail => "listing",
            QueryScope::Deals => "deals",
            QueryScope::DealDetail => "deal",
            QueryScope::FirmAgreements => "firm-agreements",
            QueryScope::BuyerScores => "buyer-scores",
        }
    }

    /// The table whose rows back this scope.
    pub fn table(&self) -> TableName {
        match self {
            QueryScope::AdminUsers => TableName::Profiles,
            QueryScope::ConnectionRequests | QueryScope::UserConnectionRequests => {
                TableName::ConnectionRequests
            }
            QueryScope::Listings | QueryScope::ListingDetail | QueryScope::BuyerScores => {
                TableName::Listings
            }
            QueryScope::Deals | QueryScope::DealDetail => TableName::Deals,
            QueryScope::FirmAgreements => TableName::FirmAgreements,
        }
    }
}

/// One positional component of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPart {
    Id(Uuid),
    Text(String),
    Int(i64),
    Flag(bool),
    Page { page: u32, size: u32 },
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Id(id) => write!(f, "{}", id),
            KeyPart::Text(text) => write!(f, "{}", text),
            KeyPart::Int(n) => write!(f, "{}", n),
            KeyPart::Flag(b) => write!(f, "{}", b),
            KeyPart::Page { page, size } => write!(f, "page={}:{}", page, size),
        }
    }
}

/// Identifier of one cached result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    scope: QueryScope,
    parts: Vec<KeyPart>,
}

impl QueryKey {
    fn root(scope: QueryScope) -> Self {
        Self {
            scope,
            parts: Vec::new(),
        }
    }

    fn push(mut self, part: KeyPart) -> Self {
        self.parts.push(part);
        self
    }

    // ========================================================================
    // BUILDERS
    // ========================================================================

    /// All profiles, as shown on the admin users page.
    pub fn admin_users() -> Self {
        Self::root(QueryScope::AdminUsers)
    }

    /// All connection requests. Extend with `with_status` / `with_page`.
    pub fn connection_requests() -> Self {
        Self::root(QueryScope::ConnectionRequests)
    }

    /// Connection requests made by one user.
    pub fn user_connection_requests(user_id: UserId) -> Self {
        Self::root(QueryScope::UserConnectionRequests).push(KeyPart::Id(user_id.as_uuid()))
    }

    pub fn listings() -> Self {
        Self::root(QueryScope::Listings)
    }

    pub fn listings_with_status(status: ListingStatus) -> Self {
        Self::listings().push(KeyPart::Text(enum_text(&status)))
    }

    pub fn listing(id: ListingId) -> Self {
        Self::root(QueryScope::ListingDetail).push(KeyPart::Id(id.as_uuid()))
    }

    pub fn deals() -> Self {
        Self::root(QueryScope::Deals)
    }

    pub fn deal(id: DealId) -> Self {
        Self::root(QueryScope::DealDetail).push(KeyPart::Id(id.as_uuid()))
    }

    pub fn firm_agreements() -> Self {
        Self::root(QueryScope::FirmAgreements)
    }

    /// AI buyer scores computed for one listing.
    pub fn buyer_scores(listing_id: ListingId) -> Self {
        Self::root(QueryScope::BuyerScores).push(KeyPart::Id(listing_id.as_uuid()))
    }

    /// Narrow a connection request key to one status.
    pub fn with_status(self, status: RequestStatus) -> Self {
        self.push(KeyPart::Text(enum_text(&status)))
    }

    /// Narrow a list key to one page.
    pub fn with_page(self, page: u32, size: u32) -> Self {
        self.push(KeyPart::Page { page, size })
    }

    pub fn with_id<I: EntityIdType>(self, id: I) -> Self {
        self.push(KeyPart::Id(id.as_uuid()))
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.push(KeyPart::Text(text.into()))
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn scope(&self) -> QueryScope {
        self.scope
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Whether `prefix` has the same scope and its parts lead this key's parts.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.scope == prefix.scope && self.parts.starts_with(&prefix.parts)
    }

    /// Page component, if this key is paginated.
    pub fn page(&self) -> Option<(u32, u32)> {
        self.parts.iter().find_map(|part| match part {
            KeyPart::Page { page, size } => Some((*page, *size)),
            _ => None,
        })
    }

    /// First id component, if any.
    pub fn id(&self) -> Option<Uuid> {
        self.parts.iter().find_map(|part| match part {
            KeyPart::Id(id) => Some(*id),
            _ => None,
        })
    }

    /// First text component, if any.
    pub fn text(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            KeyPart::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Filter matching exactly this key.
    pub fn exact(&self) -> KeyFilter {
        KeyFilter::Exact(self.clone())
    }

    /// Filter matching this key and every key extending it.
    pub fn prefix(&self) -> KeyFilter {
        KeyFilter::Prefix(self.clone())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scope.as_str())?;
        for part in &self.parts {
            write!(f, "/{}", part)?;
        }
        Ok(())
    }
}

/// Selects a set of cached keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyFilter {
    Exact(QueryKey),
    Prefix(QueryKey),
    Scope(QueryScope),
    All,
}

impl KeyFilter {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            KeyFilter::Exact(exact) => exact == key,
            KeyFilter::Prefix(prefix) => key.starts_with(prefix),
            KeyFilter::Scope(scope) => key.scope == *scope,
            KeyFilter::All => true,
        }
    }

    /// Whether every key this filter matches is also matched by `other`.
    pub fn is_covered_by(&self, other: &KeyFilter) -> bool {
        match (self, other) {
            (_, KeyFilter::All) => true,
            (KeyFilter::All, _) => false,
            (KeyFilter::Exact(key), _) => other.matches(key),
            (KeyFilter::Prefix(prefix), KeyFilter::Prefix(outer)) => prefix.starts_with(outer),
            (KeyFilter::Prefix(prefix), KeyFilter::Scope(scope)) => prefix.scope == *scope,
            (KeyFilter::Scope(a), KeyFilter::Scope(b)) => a == b,
            (KeyFilter::Scope(scope), KeyFilter::Prefix(prefix)) => {
                prefix.scope == *scope && prefix.parts.is_empty()
            }
            (_, KeyFilter::Exact(_)) => false,
        }
    }
}

impl From<QueryKey> for KeyFilter {
    fn from(key: QueryKey) -> Self {
        KeyFilter::Exact(key)
    }
}

impl From<QueryScope> for KeyFilter {
    fn from(scope: QueryScope) -> Self {
        KeyFilter::Scope(scope)
    }
}

impl fmt::Display for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFilter::Exact(key) => write!(f, "{}", key),
            KeyFilter::Prefix(key) => write!(f, "{}/*", key),
            KeyFilter::Scope(scope) => write!(f, "{}/**", scope.as_str()),
            KeyFilter::All => f.write_str("*"),
        }
    }
}

/// Wire text of a serde unit enum (`"on_hold"`), used for key parts.
fn enum_text<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(text)) => text,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_compare_structurally() {
        let a = QueryKey::connection_requests().with_page(1, 50);
        let b = QueryKey::connection_requests().with_page(1, 50);
        let c = QueryKey::connection_requests().with_page(2, 50);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display() {
        let key = QueryKey::connection_requests()
            .with_status(RequestStatus::OnHold)
            .with_page(2, 25);
        assert_eq!(key.to_string(), "connection-requests/on_hold/page=2:25");
    }

    #[test]
    fn test_prefix_matches_paginated_variants() {
        let root = QueryKey::connection_requests();
        let page = QueryKey::connection_requests().with_page(3, 10);
        let other_scope = QueryKey::admin_users();

        assert!(root.prefix().matches(&root));
        assert!(root.prefix().matches(&page));
        assert!(!root.prefix().matches(&other_scope));
        assert!(!page.prefix().matches(&root));
    }

    #[test]
    fn test_exact_does_not_match_variants() {
        let root = QueryKey::connection_requests();
        let page = root.clone().with_page(1, 10);
        assert!(!root.exact().matches(&page));
    }

    #[test]
    fn test_scope_filter() {
        let filter = KeyFilter::Scope(QueryScope::DealDetail);
        assert!(filter.matches(&QueryKey::deal(DealId::from_u128(1))));
        assert!(!filter.matches(&QueryKey::deals()));
    }

    #[test]
    fn test_accessors() {
        let user = UserId::from_u128(9);
        let key = QueryKey::user_connection_requests(user);
        assert_eq!(key.id(), Some(user.as_uuid()));
        assert_eq!(key.page(), None);
        assert_eq!(key.scope().table(), TableName::ConnectionRequests);

        let key = QueryKey::listings_with_status(ListingStatus::Active);
        assert_eq!(key.text(), Some("active"));
    }

    #[test]
    fn test_filter_coverage() {
        let all_requests = QueryKey::connection_requests().prefix();
        let page = QueryKey::connection_requests().with_page(1, 10).exact();
        assert!(page.is_covered_by(&all_requests));
        assert!(!all_requests.is_covered_by(&page));
        assert!(all_requests.is_covered_by(&KeyFilter::Scope(QueryScope::ConnectionRequests)));
        assert!(KeyFilter::Scope(QueryScope::ConnectionRequests).is_covered_by(&all_requests));
        assert!(!KeyFilter::All.is_covered_by(&all_requests));
    }
}
