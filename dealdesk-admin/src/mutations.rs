//! Admin writes as optimistic mutations.
//!
//! Each mutation states what it patches and what it invalidates. Patches
//! reach every cached variant of the affected lists (status filters, pages,
//! per-user lists) and every key that embeds a copy of the changed row, such
//! as the user sub-record inside connection requests. Invalidation is by
//! prefix so that server data eventually replaces each prediction.

use chrono::Utc;
use dealdesk_core::{
    AgreementKind, AgreementStatus, ApprovalStatus, Backend, CacheError, ConnectionRequest,
    ConnectionRequestPatch, Deal, DealDeskResult, DealId, DealPatch, DealStage, FirmAgreement,
    FirmAgreementPatch, FirmId, Listing, ListingId, ListingPatch, ListingStatus, Profile,
    ProfilePatch, RequestId, RequestStatus, Timestamp, UserId, ValidationError,
};
use dealdesk_query::{
    KeyFilter, MutationReport, OptimisticMutation, OptimisticPatch, QueryClient, QueryKey,
    QueryScope,
};
use std::sync::Arc;
use tracing::info;

use crate::functions::AdminFunctions;

// ============================================================================
// VARIABLES
// ============================================================================

// Each update carries the time it was issued, so every cached copy of a row
// gets the same predicted timestamps.

#[derive(Debug, Clone, PartialEq)]
pub struct RequestUpdate {
    pub id: RequestId,
    pub patch: ConnectionRequestPatch,
    pub at: Timestamp,
}

impl RequestUpdate {
    pub fn new(id: RequestId, patch: ConnectionRequestPatch) -> Self {
        Self {
            id,
            patch,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileUpdate {
    pub id: UserId,
    pub patch: ProfilePatch,
    pub at: Timestamp,
}

impl ProfileUpdate {
    pub fn new(id: UserId, patch: ProfilePatch) -> Self {
        Self {
            id,
            patch,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingUpdate {
    pub id: ListingId,
    pub patch: ListingPatch,
    pub at: Timestamp,
}

impl ListingUpdate {
    pub fn new(id: ListingId, patch: ListingPatch) -> Self {
        Self {
            id,
            patch,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DealUpdate {
    pub id: DealId,
    pub patch: DealPatch,
    pub at: Timestamp,
}

impl DealUpdate {
    pub fn new(id: DealId, patch: DealPatch) -> Self {
        Self {
            id,
            patch,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirmUpdate {
    pub id: FirmId,
    pub patch: FirmAgreementPatch,
    pub at: Timestamp,
}

impl FirmUpdate {
    pub fn new(id: FirmId, patch: FirmAgreementPatch) -> Self {
        Self {
            id,
            patch,
            at: Utc::now(),
        }
    }
}

// ============================================================================
// MUTATION DEFINITIONS
// ============================================================================

/// Replace the rows selected by `matches` with a patched copy.
fn patch_rows<T: Clone>(rows: &[T], matches: impl Fn(&T) -> bool, apply: impl Fn(&mut T)) -> Vec<T> {
    rows.iter()
        .cloned()
        .map(|mut row| {
            if matches(&row) {
                apply(&mut row);
            }
            row
        })
        .collect()
}

/// Patch the updated request in one cached list. A list filtered by status
/// drops the row once its predicted status no longer matches, as a refetch
/// would.
fn patch_request_rows(
    key: &QueryKey,
    rows: &[ConnectionRequest],
    update: &RequestUpdate,
) -> Vec<ConnectionRequest> {
    let mut rows = patch_rows(
        rows,
        |row| row.id == update.id,
        |row| update.patch.apply_to(row, update.at),
    );
    if let Some(status) = key.text() {
        rows.retain(|row| row.id != update.id || row.status.as_str() == status);
    }
    rows
}

fn patch_embedded_users(
    rows: &[ConnectionRequest],
    update: &ProfileUpdate,
) -> Vec<ConnectionRequest> {
    patch_rows(
        rows,
        |row| row.user_id == update.id,
        |row| {
            if let Some(user) = row.user.as_mut() {
                update.patch.apply_to_summary(user);
            }
        },
    )
}

fn user_request_lists() -> KeyFilter {
    KeyFilter::Scope(QueryScope::UserConnectionRequests)
}

/// Connection request updates: status, admin comment and follow-up flags.
pub fn request_mutation(
    backend: Arc<dyn Backend>,
) -> Result<OptimisticMutation<RequestUpdate, ConnectionRequest>, CacheError> {
    OptimisticMutation::builder("update_connection_request")
        .mutate_with(move |update: RequestUpdate| {
            let backend = Arc::clone(&backend);
            async move {
                backend
                    .update_connection_request(update.id, &update.patch)
                    .await
            }
        })
        .patch(OptimisticPatch::keyed(
            QueryKey::connection_requests().prefix(),
            |key: &QueryKey, rows: &Vec<ConnectionRequest>, update: &RequestUpdate| {
                patch_request_rows(key, rows, update)
            },
        ))
        .patch(OptimisticPatch::keyed(
            user_request_lists(),
            |key: &QueryKey, rows: &Vec<ConnectionRequest>, update: &RequestUpdate| {
                patch_request_rows(key, rows, update)
            },
        ))
        .invalidates(QueryKey::connection_requests().prefix())
        .invalidates(user_request_lists())
        .build()
}

/// Profile updates. The user row is aliased inside every connection request
/// list, so those keys are patched and invalidated along with `admin-users`.
pub fn profile_mutation(
    backend: Arc<dyn Backend>,
) -> Result<OptimisticMutation<ProfileUpdate, Profile>, CacheError> {
    OptimisticMutation::builder("update_profile")
        .mutate_with(move |update: ProfileUpdate| {
            let backend = Arc::clone(&backend);
            async move { backend.update_profile(update.id, &update.patch).await }
        })
        .patch(OptimisticPatch::typed(
            QueryKey::admin_users().prefix(),
            |rows: &Vec<Profile>, update: &ProfileUpdate| {
                patch_rows(
                    rows,
                    |row| row.id == update.id,
                    |row| update.patch.apply_to(row, update.at),
                )
            },
        ))
        .patch(OptimisticPatch::typed(
            QueryKey::connection_requests().prefix(),
            |rows: &Vec<ConnectionRequest>, update: &ProfileUpdate| patch_embedded_users(rows, update),
        ))
        .patch(OptimisticPatch::typed(
            user_request_lists(),
            |rows: &Vec<ConnectionRequest>, update: &ProfileUpdate| patch_embedded_users(rows, update),
        ))
        .invalidates(QueryKey::admin_users().prefix())
        .invalidates(QueryKey::connection_requests().prefix())
        .invalidates(user_request_lists())
        .build()
}

pub fn listing_mutation(
    backend: Arc<dyn Backend>,
) -> Result<OptimisticMutation<ListingUpdate, Listing>, CacheError> {
    OptimisticMutation::builder("update_listing")
        .mutate_with(move |update: ListingUpdate| {
            let backend = Arc::clone(&backend);
            async move { backend.update_listing(update.id, &update.patch).await }
        })
        .patch(OptimisticPatch::typed(
            QueryKey::listings().prefix(),
            |rows: &Vec<Listing>, update: &ListingUpdate| {
                patch_rows(
                    rows,
                    |row| row.id == update.id,
                    |row| update.patch.apply_to(row, update.at),
                )
            },
        ))
        .patch(OptimisticPatch::typed(
            KeyFilter::Scope(QueryScope::ListingDetail),
            |row: &Option<Listing>, update: &ListingUpdate| {
                let mut row = row.clone();
                if let Some(listing) = row.as_mut().filter(|l| l.id == update.id) {
                    update.patch.apply_to(listing, update.at);
                }
                row
            },
        ))
        .invalidates(QueryKey::listings().prefix())
        .invalidates(KeyFilter::Scope(QueryScope::ListingDetail))
        .build()
}

pub fn deal_mutation(
    backend: Arc<dyn Backend>,
) -> Result<OptimisticMutation<DealUpdate, Deal>, CacheError> {
    OptimisticMutation::builder("update_deal")
        .mutate_with(move |update: DealUpdate| {
            let backend = Arc::clone(&backend);
            async move { backend.update_deal(update.id, &update.patch).await }
        })
        .patch(OptimisticPatch::typed(
            QueryKey::deals().prefix(),
            |rows: &Vec<Deal>, update: &DealUpdate| {
                patch_rows(
                    rows,
                    |row| row.id == update.id,
                    |row| update.patch.apply_to(row, update.at),
                )
            },
        ))
        .patch(OptimisticPatch::typed(
            KeyFilter::Scope(QueryScope::DealDetail),
            |row: &Option<Deal>, update: &DealUpdate| {
                let mut row = row.clone();
                if let Some(deal) = row.as_mut().filter(|d| d.id == update.id) {
                    update.patch.apply_to(deal, update.at);
                }
                row
            },
        ))
        .invalidates(QueryKey::deals().prefix())
        .invalidates(KeyFilter::Scope(QueryScope::DealDetail))
        .build()
}

pub fn firm_mutation(
    backend: Arc<dyn Backend>,
) -> Result<OptimisticMutation<FirmUpdate, FirmAgreement>, CacheError> {
    OptimisticMutation::builder("update_firm_agreement")
        .mutate_with(move |update: FirmUpdate| {
            let backend = Arc::clone(&backend);
            async move { backend.update_firm_agreement(update.id, &update.patch).await }
        })
        .patch(OptimisticPatch::typed(
            QueryKey::firm_agreements().prefix(),
            |rows: &Vec<FirmAgreement>, update: &FirmUpdate| {
                patch_rows(
                    rows,
                    |row| row.id == update.id,
                    |row| update.patch.apply_to(row, update.at),
                )
            },
        ))
        .invalidates(QueryKey::firm_agreements().prefix())
        .build()
}

// ============================================================================
// ADMIN MUTATIONS
// ============================================================================

/// The admin write surface.
pub struct AdminMutations {
    client: QueryClient,
    functions: AdminFunctions,
    requests: OptimisticMutation<RequestUpdate, ConnectionRequest>,
    profiles: OptimisticMutation<ProfileUpdate, Profile>,
    listings: OptimisticMutation<ListingUpdate, Listing>,
    deals: OptimisticMutation<DealUpdate, Deal>,
    firms: OptimisticMutation<FirmUpdate, FirmAgreement>,
}

impl AdminMutations {
    pub fn new(
        client: QueryClient,
        backend: Arc<dyn Backend>,
        functions: AdminFunctions,
    ) -> DealDeskResult<Self> {
        Ok(Self {
            requests: request_mutation(Arc::clone(&backend))?,
            profiles: profile_mutation(Arc::clone(&backend))?,
            listings: listing_mutation(Arc::clone(&backend))?,
            deals: deal_mutation(Arc::clone(&backend))?,
            firms: firm_mutation(backend)?,
            client,
            functions,
        })
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    // ========================================================================
    // CONNECTION REQUESTS
    // ========================================================================

    pub async fn update_request(
        &self,
        id: RequestId,
        patch: ConnectionRequestPatch,
    ) -> DealDeskResult<ConnectionRequest> {
        if patch.is_empty() {
            return Err(empty_patch("connection request"));
        }
        self.client
            .mutate(&self.requests, RequestUpdate::new(id, patch))
            .await
    }

    /// Like [`update_request`](Self::update_request), with the rollback and
    /// fan-out outcome.
    pub async fn update_request_detailed(
        &self,
        id: RequestId,
        patch: ConnectionRequestPatch,
    ) -> MutationReport<ConnectionRequest> {
        if patch.is_empty() {
            return MutationReport::rejected(empty_patch("connection request"));
        }
        self.client
            .mutate_detailed(&self.requests, RequestUpdate::new(id, patch))
            .await
    }

    pub async fn update_request_status(
        &self,
        id: RequestId,
        status: RequestStatus,
        admin_comment: Option<String>,
    ) -> DealDeskResult<ConnectionRequest> {
        self.update_request(
            id,
            ConnectionRequestPatch {
                status: Some(status),
                admin_comment,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_followed_up(
        &self,
        id: RequestId,
        followed_up: bool,
    ) -> DealDeskResult<ConnectionRequest> {
        self.update_request(
            id,
            ConnectionRequestPatch {
                followed_up: Some(followed_up),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_negative_followed_up(
        &self,
        id: RequestId,
        negative_followed_up: bool,
    ) -> DealDeskResult<ConnectionRequest> {
        self.update_request(
            id,
            ConnectionRequestPatch {
                negative_followed_up: Some(negative_followed_up),
                ..Default::default()
            },
        )
        .await
    }

    // ========================================================================
    // USERS
    // ========================================================================

    /// Set a user's approval status. Approving also sends the approval
    /// email; a failed email is reported through the notifier and does not
    /// fail the update.
    pub async fn update_user_approval(
        &self,
        id: UserId,
        status: ApprovalStatus,
    ) -> DealDeskResult<Profile> {
        let profile = self
            .client
            .mutate(
                &self.profiles,
                ProfileUpdate::new(
                    id,
                    ProfilePatch {
                        approval_status: Some(status),
                        ..Default::default()
                    },
                ),
            )
            .await?;
        if status == ApprovalStatus::Approved {
            if let Err(e) = self.functions.send_user_approval_email(&profile).await {
                self.client.notify("Send approval email", e);
            }
        }
        info!(user_id = %id, status = ?status, "Updated user approval");
        Ok(profile)
    }

    pub async fn set_admin(&self, id: UserId, is_admin: bool) -> DealDeskResult<Profile> {
        self.client
            .mutate(
                &self.profiles,
                ProfileUpdate::new(
                    id,
                    ProfilePatch {
                        is_admin: Some(is_admin),
                        ..Default::default()
                    },
                ),
            )
            .await
    }

    // ========================================================================
    // LISTINGS AND DEALS
    // ========================================================================

    pub async fn set_listing_status(
        &self,
        id: ListingId,
        status: ListingStatus,
    ) -> DealDeskResult<Listing> {
        self.client
            .mutate(
                &self.listings,
                ListingUpdate::new(
                    id,
                    ListingPatch {
                        status: Some(status),
                        ..Default::default()
                    },
                ),
            )
            .await
    }

    pub async fn move_deal_stage(&self, id: DealId, stage: DealStage) -> DealDeskResult<Deal> {
        self.client
            .mutate(
                &self.deals,
                DealUpdate::new(
                    id,
                    DealPatch {
                        stage: Some(stage),
                        ..Default::default()
                    },
                ),
            )
            .await
    }

    // ========================================================================
    // FIRM AGREEMENTS
    // ========================================================================

    /// Set one firm agreement's status. Marking it `Sent` also sends the
    /// agreement email; a failed email is only notified.
    pub async fn update_firm_agreement(
        &self,
        id: FirmId,
        kind: AgreementKind,
        status: AgreementStatus,
    ) -> DealDeskResult<FirmAgreement> {
        let firm = self
            .client
            .mutate(
                &self.firms,
                FirmUpdate::new(id, FirmAgreementPatch::for_kind(kind, status)),
            )
            .await?;
        if status == AgreementStatus::Sent {
            if let Err(e) = self.functions.send_agreement_email(kind, &firm).await {
                self.client.notify("Send agreement email", e);
            }
        }
        Ok(firm)
    }
}

fn empty_patch(what: &str) -> dealdesk_core::DealDeskError {
    ValidationError::RequiredFieldMissing {
        field: format!("{} patch", what),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealdesk_core::{ConflictError, DealDeskError, EntityIdType, RequestListFilter, TableName};
    use dealdesk_query::{CacheEvent, ErrorNotifier};
    use dealdesk_test_utils::fixtures::{seeded_backend, REQUEST_42};
    use dealdesk_test_utils::{drain_events, CollectingNotifier, InMemoryBackend, RecordingFunctions};
    use serde_json::json;

    use crate::functions::{SEND_NDA_EMAIL, SEND_USER_APPROVAL_EMAIL};
    use crate::queries::AdminQueries;

    struct Harness {
        backend: Arc<InMemoryBackend>,
        functions: Arc<RecordingFunctions>,
        notifier: Arc<CollectingNotifier>,
        queries: AdminQueries,
        mutations: AdminMutations,
    }

    fn harness() -> Harness {
        let backend = Arc::new(seeded_backend());
        let functions = Arc::new(RecordingFunctions::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let client = QueryClient::new(
            dealdesk_core::ClientConfig::default(),
            notifier.clone() as Arc<dyn ErrorNotifier>,
        );
        let queries = AdminQueries::new(client.clone(), backend.clone());
        let mutations = AdminMutations::new(
            client.clone(),
            backend.clone(),
            AdminFunctions::new(client, functions.clone()),
        )
        .expect("mutations");
        Harness {
            backend,
            functions,
            notifier,
            queries,
            mutations,
        }
    }

    fn cached_requests(h: &Harness, key: &QueryKey) -> Vec<ConnectionRequest> {
        h.mutations
            .client()
            .cache()
            .get_data(key)
            .expect("decode")
            .expect("cached list")
    }

    #[test]
    fn test_every_mutation_builds() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        assert!(request_mutation(backend.clone()).is_ok());
        assert!(profile_mutation(backend.clone()).is_ok());
        assert!(listing_mutation(backend.clone()).is_ok());
        assert!(deal_mutation(backend.clone()).is_ok());
        assert!(firm_mutation(backend).is_ok());
    }

    #[test]
    fn test_request_prediction_touches_only_target_row() {
        let mutation = request_mutation(Arc::new(seeded_backend())).expect("build");
        let rows = vec![
            dealdesk_test_utils::fixtures::connection_request(
                41,
                &dealdesk_test_utils::fixtures::profile(1),
                ListingId::from_u128(100),
            ),
            dealdesk_test_utils::fixtures::connection_request(
                REQUEST_42,
                &dealdesk_test_utils::fixtures::profile(2),
                ListingId::from_u128(100),
            ),
        ];
        let value = serde_json::to_value(&rows).expect("serialize");
        let update = RequestUpdate::new(
            RequestId::from_u128(REQUEST_42),
            ConnectionRequestPatch {
                status: Some(RequestStatus::Approved),
                ..Default::default()
            },
        );

        let predicted = mutation
            .predict(&QueryKey::connection_requests().with_page(1, 50), &value, &update)
            .expect("changed");
        let predicted: Vec<ConnectionRequest> = serde_json::from_value(predicted).expect("decode");
        assert_eq!(predicted[0], rows[0]);
        assert_eq!(predicted[1].status, RequestStatus::Approved);
        assert!(predicted[1].decision_at.is_some());

        // Deal lists have a different shape and scope.
        assert!(mutation.predict(&QueryKey::deals(), &json!([]), &update).is_none());
    }

    fn seeded_rows() -> Vec<ConnectionRequest> {
        use dealdesk_test_utils::fixtures::{connection_request, profile};
        vec![
            connection_request(41, &profile(1), ListingId::from_u128(100)),
            connection_request(REQUEST_42, &profile(2), ListingId::from_u128(100)),
        ]
    }

    #[test]
    fn test_prediction_stamps_every_copy_with_the_same_time() {
        let mutation = request_mutation(Arc::new(seeded_backend())).expect("build");
        let value = serde_json::to_value(seeded_rows()).expect("serialize");
        let update = RequestUpdate::new(
            RequestId::from_u128(REQUEST_42),
            ConnectionRequestPatch {
                status: Some(RequestStatus::Rejected),
                ..Default::default()
            },
        );

        let target = |key: QueryKey| -> ConnectionRequest {
            let predicted = mutation.predict(&key, &value, &update).expect("changed");
            let rows: Vec<ConnectionRequest> = serde_json::from_value(predicted).expect("decode");
            rows.into_iter()
                .find(|row| row.id == update.id)
                .expect("row")
        };
        let in_all = target(QueryKey::connection_requests().with_page(1, 50));
        let in_user = target(QueryKey::user_connection_requests(UserId::from_u128(2)));
        assert_eq!(in_all, in_user);
        assert_eq!(in_all.updated_at, update.at);
        assert_eq!(in_all.decision_at, Some(update.at));
    }

    #[test]
    fn test_status_filtered_list_drops_row_that_leaves_the_status() {
        let mutation = request_mutation(Arc::new(seeded_backend())).expect("build");
        let rows = seeded_rows();
        assert!(rows.iter().all(|r| r.status == RequestStatus::Pending));
        let value = serde_json::to_value(&rows).expect("serialize");
        let update = RequestUpdate::new(
            RequestId::from_u128(REQUEST_42),
            ConnectionRequestPatch {
                status: Some(RequestStatus::Approved),
                ..Default::default()
            },
        );

        let pending_key = QueryKey::connection_requests().with_status(RequestStatus::Pending);
        let predicted = mutation.predict(&pending_key, &value, &update).expect("changed");
        let predicted: Vec<ConnectionRequest> = serde_json::from_value(predicted).expect("decode");
        assert_eq!(predicted, vec![rows[0].clone()]);

        // A comment keeps the row in its status list.
        let comment = RequestUpdate::new(
            RequestId::from_u128(REQUEST_42),
            ConnectionRequestPatch {
                admin_comment: Some("call back".to_string()),
                ..Default::default()
            },
        );
        let predicted = mutation.predict(&pending_key, &value, &comment).expect("changed");
        let predicted: Vec<ConnectionRequest> = serde_json::from_value(predicted).expect("decode");
        assert_eq!(predicted.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_list_matches_refetch_during_approval() {
        let h = harness();
        let pending_key = QueryKey::connection_requests().with_status(RequestStatus::Pending);
        h.queries
            .connection_requests_with_status(RequestStatus::Pending)
            .await
            .expect("pending");
        let id = RequestId::from_u128(REQUEST_42);
        assert!(cached_requests(&h, &pending_key).iter().any(|r| r.id == id));

        h.backend.delay_next_write(std::time::Duration::from_millis(20));
        let write = h
            .mutations
            .update_request_status(id, RequestStatus::Approved, None);
        let peek = async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            cached_requests(&h, &pending_key)
        };
        let (result, optimistic) = tokio::join!(write, peek);
        assert!(result.is_ok());
        assert!(optimistic.iter().all(|r| r.id != id));

        let fresh = h
            .queries
            .connection_requests_with_status(RequestStatus::Pending)
            .await
            .expect("refetch");
        assert!(fresh.iter().all(|r| r.id != id));
    }

    #[tokio::test]
    async fn test_status_update_reaches_every_list_variant() {
        let h = harness();
        h.queries.all_connection_requests().await.expect("all");
        h.queries.connection_requests_page(1, 50).await.expect("page");
        h.queries
            .user_connection_requests(UserId::from_u128(2))
            .await
            .expect("user");

        let id = RequestId::from_u128(REQUEST_42);
        let report = h
            .mutations
            .update_request_detailed(
                id,
                ConnectionRequestPatch {
                    status: Some(RequestStatus::Approved),
                    ..Default::default()
                },
            )
            .await;
        assert!(report.result.is_ok());
        assert_eq!(report.patched.len(), 3);

        for key in [
            QueryKey::connection_requests(),
            QueryKey::connection_requests().with_page(1, 50),
            QueryKey::user_connection_requests(UserId::from_u128(2)),
        ] {
            let fresh = h
                .queries
                .connection_requests(match key.scope() {
                    QueryScope::UserConnectionRequests => RequestListFilter {
                        user_id: Some(UserId::from_u128(2)),
                        ..Default::default()
                    },
                    _ => RequestListFilter {
                        page: key.page().map(|(p, s)| dealdesk_core::PageRequest::new(p, s)),
                        ..Default::default()
                    },
                })
                .await
                .expect("refetch");
            let row = fresh.iter().find(|r| r.id == id).expect("row");
            assert_eq!(row.status, RequestStatus::Approved, "key {}", key);
        }
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_and_notifies() {
        let h = harness();
        h.queries.all_connection_requests().await.expect("seed cache");
        let before = cached_requests(&h, &QueryKey::connection_requests());

        h.backend.fail_next_write(
            ConflictError::WriteRejected {
                table: TableName::ConnectionRequests,
                id: REQUEST_42.to_string(),
                reason: "row locked".to_string(),
            }
            .into(),
        );
        let mut events = h.mutations.client().events();
        let err = h
            .mutations
            .set_followed_up(RequestId::from_u128(REQUEST_42), true)
            .await
            .expect_err("write fails");
        assert!(matches!(err, DealDeskError::Conflict(_)));

        let after = cached_requests(&h, &QueryKey::connection_requests());
        assert_eq!(before, after);
        let rollbacks = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, CacheEvent::MutationRolledBack { .. }))
            .count();
        assert_eq!(rollbacks, 1);
        assert_eq!(h.notifier.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_request_patch_is_rejected_without_write() {
        let h = harness();
        let err = h
            .mutations
            .update_request(RequestId::from_u128(REQUEST_42), ConnectionRequestPatch::default())
            .await
            .expect_err("empty");
        assert!(matches!(err, DealDeskError::Validation(_)));
        assert_eq!(h.backend.write_count(), 0);

        let report = h
            .mutations
            .update_request_detailed(
                RequestId::from_u128(REQUEST_42),
                ConnectionRequestPatch::default(),
            )
            .await;
        assert!(matches!(report.result, Err(DealDeskError::Validation(_))));
        assert!(report.patched.is_empty());
        assert!(report.rollback.is_none());
        assert_eq!(h.backend.write_count(), 0);
        assert!(h.notifier.is_empty());
    }

    #[tokio::test]
    async fn test_approval_patches_embedded_user() {
        let h = harness();
        h.queries.all_connection_requests().await.expect("requests");
        h.queries.admin_users().await.expect("users");
        h.backend.delay_next_write(std::time::Duration::from_millis(20));

        let user = UserId::from_u128(2);
        let mutations = &h.mutations;
        let pending = mutations.update_user_approval(user, ApprovalStatus::Approved);
        let check = async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            let rows = cached_requests(&h, &QueryKey::connection_requests());
            let embedded = rows
                .iter()
                .filter(|r| r.user_id == user)
                .filter_map(|r| r.user.as_ref())
                .all(|u| u.approval_status == ApprovalStatus::Approved);
            let users: Vec<Profile> = h
                .mutations
                .client()
                .cache()
                .get_data(&QueryKey::admin_users())
                .expect("decode")
                .expect("users");
            let profile = users.iter().find(|p| p.id == user).map(|p| p.approval_status);
            (embedded, profile)
        };
        let (result, (embedded, profile)) = tokio::join!(pending, check);
        assert!(result.is_ok());
        assert!(embedded);
        assert_eq!(profile, Some(ApprovalStatus::Approved));
        assert_eq!(h.functions.calls_to(SEND_USER_APPROVAL_EMAIL).len(), 1);
    }

    #[tokio::test]
    async fn test_email_failure_does_not_fail_approval() {
        let h = harness();
        h.functions.fail(SEND_USER_APPROVAL_EMAIL, 502);
        let profile = h
            .mutations
            .update_user_approval(UserId::from_u128(1), ApprovalStatus::Approved)
            .await
            .expect("approval stands");
        assert_eq!(profile.approval_status, ApprovalStatus::Approved);
        assert_eq!(h.notifier.len(), 1);
        assert_eq!(h.notifier.notices()[0].context, "Send approval email");
    }

    #[tokio::test]
    async fn test_rejection_sends_no_email() {
        let h = harness();
        h.mutations
            .update_user_approval(UserId::from_u128(1), ApprovalStatus::Rejected)
            .await
            .expect("rejected");
        assert_eq!(h.functions.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_firm_agreement_sent_sends_email() {
        let h = harness();
        let firm = h
            .mutations
            .update_firm_agreement(FirmId::from_u128(9), AgreementKind::Nda, AgreementStatus::Sent)
            .await
            .expect("update");
        assert_eq!(firm.nda_status, AgreementStatus::Sent);
        assert_eq!(h.functions.calls_to(SEND_NDA_EMAIL).len(), 1);

        h.mutations
            .update_firm_agreement(FirmId::from_u128(9), AgreementKind::Nda, AgreementStatus::Signed)
            .await
            .expect("update");
        assert_eq!(h.functions.invocation_count(), 1);
        assert!(h
            .backend
            .firm(FirmId::from_u128(9))
            .and_then(|f| f.nda_signed_at)
            .is_some());
    }

    #[tokio::test]
    async fn test_listing_and_deal_detail_patches() {
        let h = harness();
        h.queries.listing(ListingId::from_u128(100)).await.expect("listing");
        h.queries.deal(DealId::from_u128(7)).await.expect("deal");

        let listing = h
            .mutations
            .set_listing_status(ListingId::from_u128(100), ListingStatus::Sold)
            .await
            .expect("listing");
        assert_eq!(listing.status, ListingStatus::Sold);
        let deal = h
            .mutations
            .move_deal_stage(DealId::from_u128(7), DealStage::UnderContract)
            .await
            .expect("deal");
        assert_eq!(deal.stage, DealStage::UnderContract);

        let state = h
            .mutations
            .client()
            .cache()
            .entry_state(&QueryKey::deal(DealId::from_u128(7)))
            .expect("entry");
        assert!(state.has_value);
    }
}
