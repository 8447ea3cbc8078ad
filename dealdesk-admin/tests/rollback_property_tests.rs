//! Property-Based Tests for Optimistic Admin Writes
//!
//! For any connection request update whose remote write fails, every cached
//! request list SHALL read exactly as it did before the write, and exactly
//! one rollback SHALL be published. For any update that succeeds, the next
//! read SHALL show the server's row.

use dealdesk_admin::{AdminConsole, RequestUpdate};
use dealdesk_core::{
    ApprovalStatus, ClientConfig, ConnectionRequest, ConnectionRequestPatch, DealDeskError,
    EntityIdType, RequestId, RequestStatus, TransportError, UserId,
};
use dealdesk_query::{CacheEvent, QueryClient, QueryKey, UpdateSource};
use dealdesk_test_utils::fixtures::{seeded_backend, REQUEST_42};
use dealdesk_test_utils::generators::{arb_request_patch, arb_seeded_request_id};
use dealdesk_test_utils::{
    drain_events, recv_event, CollectingNotifier, InMemoryBackend, RecordingFunctions,
};
use proptest::prelude::*;
use std::sync::Arc;
use tokio::time::Duration;

struct Harness {
    backend: Arc<InMemoryBackend>,
    notifier: Arc<CollectingNotifier>,
    console: AdminConsole,
}

fn harness() -> Harness {
    let backend = Arc::new(seeded_backend());
    let notifier = Arc::new(CollectingNotifier::new());
    let client = QueryClient::new(ClientConfig::default(), notifier.clone());
    let console = AdminConsole::new(client, backend.clone(), Arc::new(RecordingFunctions::new()))
        .expect("console");
    Harness {
        backend,
        notifier,
        console,
    }
}

fn cached_list(console: &AdminConsole, key: &QueryKey) -> Option<Vec<ConnectionRequest>> {
    console.client().cache().get_data(key).ok().flatten()
}

fn cached_status(console: &AdminConsole, id: RequestId) -> Option<RequestStatus> {
    cached_list(console, &QueryKey::connection_requests())?
        .into_iter()
        .find(|row| row.id == id)
        .map(|row| row.status)
}

fn unavailable() -> DealDeskError {
    TransportError::Unavailable {
        status: 503,
        message: "backend unavailable".to_string(),
    }
    .into()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Rollback law over arbitrary request updates.
    #[test]
    fn prop_failed_request_update_restores_lists(
        id in arb_seeded_request_id(),
        patch in arb_request_patch(),
    ) {
        prop_assume!(!patch.is_empty());
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = harness();
            let queries = h.console.queries();
            queries.all_connection_requests().await.expect("all");
            queries.connection_requests_page(1, 2).await.expect("page");
            queries.user_connection_requests(UserId::from_u128(2)).await.expect("user");
            let keys = h.console.client().cache().keys(&dealdesk_query::KeyFilter::All);
            let before: Vec<_> = keys.iter().map(|k| cached_list(&h.console, k)).collect();

            let mut rx = h.console.client().events();
            h.backend.fail_next_write(unavailable());
            let report = h.console.mutations().update_request_detailed(id, patch.clone()).await;
            prop_assert!(report.result.is_err());

            let after: Vec<_> = keys.iter().map(|k| cached_list(&h.console, k)).collect();
            prop_assert_eq!(before, after);

            let rollbacks = drain_events(&mut rx)
                .into_iter()
                .filter(|e| matches!(e, CacheEvent::MutationRolledBack { .. }))
                .count();
            prop_assert_eq!(rollbacks, 1);
            prop_assert_eq!(h.notifier.len(), 1);
            prop_assert_eq!(h.backend.write_count(), 1);
            Ok(())
        })?;
    }

    /// A successful update is visible on the next read of every list.
    #[test]
    fn prop_successful_request_update_is_read_back(
        id in arb_seeded_request_id(),
        patch in arb_request_patch(),
    ) {
        prop_assume!(!patch.is_empty());
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = harness();
            h.console.queries().all_connection_requests().await.expect("all");

            let update = RequestUpdate::new(id, patch.clone());
            let written = h
                .console
                .mutations()
                .update_request(update.id, update.patch)
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            let fresh = h.console.queries().all_connection_requests().await.expect("refetch");
            let row = fresh.into_iter().find(|r| r.id == id).expect("row");
            prop_assert_eq!(&row, &written);
            if let Some(status) = patch.status {
                prop_assert_eq!(row.status, status);
            }
            if let Some(followed_up) = patch.followed_up {
                prop_assert_eq!(row.followed_up, followed_up);
            }
            Ok(())
        })?;
    }
}

/// Request 42 goes `pending -> approved` optimistically, the write fails,
/// and the row reads `pending` again with a single rollback published.
#[tokio::test(start_paused = true)]
async fn test_request_42_failed_approval_reverts_to_pending() {
    let h = harness();
    let id = RequestId::from_u128(REQUEST_42);
    h.console.queries().all_connection_requests().await.expect("seed");
    assert_eq!(cached_status(&h.console, id), Some(RequestStatus::Pending));

    let mut rx = h.console.client().events();
    h.backend.delay_next_write(Duration::from_millis(50));
    h.backend.fail_next_write(unavailable());

    let write = h
        .console
        .mutations()
        .update_request_status(id, RequestStatus::Approved, None);
    let peek = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cached_status(&h.console, id)
    };
    let (result, optimistic) = tokio::join!(write, peek);

    assert_eq!(optimistic, Some(RequestStatus::Approved));
    assert!(matches!(result, Err(DealDeskError::Transient(_))));
    assert_eq!(cached_status(&h.console, id), Some(RequestStatus::Pending));

    let first = recv_event(&mut rx, "optimistic write").await;
    assert!(matches!(
        first,
        CacheEvent::EntryUpdated {
            source: UpdateSource::Optimistic,
            ..
        }
    ));
    let events = drain_events(&mut rx);
    let mutation_id = events
        .iter()
        .find(|e| matches!(e, CacheEvent::MutationArmed { .. }))
        .and_then(CacheEvent::mutation_id)
        .expect("armed");
    let rollbacks: Vec<&CacheEvent> = events
        .iter()
        .filter(|e| matches!(e, CacheEvent::MutationRolledBack { .. }))
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].mutation_id(), Some(mutation_id));
    assert!(events
        .iter()
        .any(|e| matches!(e, CacheEvent::MutationFailed { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, CacheEvent::MutationCommitted { .. })));

    let notices = h.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].mutation_id, Some(mutation_id));
}

/// A failed approval restores the embedded user in request lists as well as
/// the admin user list.
#[tokio::test]
async fn test_failed_approval_restores_aliased_user() {
    let h = harness();
    h.console.queries().all_connection_requests().await.expect("requests");
    h.console.queries().admin_users().await.expect("users");
    let requests_before = cached_list(&h.console, &QueryKey::connection_requests());

    h.backend.fail_next_write(unavailable());
    let result = h
        .console
        .mutations()
        .update_user_approval(UserId::from_u128(2), ApprovalStatus::Approved)
        .await;
    assert!(result.is_err());

    assert_eq!(
        cached_list(&h.console, &QueryKey::connection_requests()),
        requests_before
    );
    let users: Vec<dealdesk_core::Profile> = h
        .console
        .client()
        .cache()
        .get_data(&QueryKey::admin_users())
        .expect("decode")
        .expect("users");
    assert!(users
        .iter()
        .all(|p| p.approval_status == ApprovalStatus::Pending));
}

#[tokio::test]
async fn test_empty_patch_never_reaches_backend() {
    let h = harness();
    let result = h
        .console
        .mutations()
        .update_request(RequestId::from_u128(REQUEST_42), ConnectionRequestPatch::default())
        .await;
    assert!(matches!(result, Err(DealDeskError::Validation(_))));
    assert_eq!(h.backend.write_count(), 0);
    assert!(h.notifier.is_empty());
}
