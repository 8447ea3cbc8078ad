//! DealDesk Test Utilities
//!
//! Centralized test infrastructure for the DealDesk workspace:
//! - In-memory backend with fault and latency injection
//! - In-memory realtime transport and function invoker
//! - Collecting error notifier and event helpers
//! - Proptest generators and fixtures

mod backend;

pub use backend::InMemoryBackend;

pub use dealdesk_core::{
    AgreementKind, AgreementStatus, ApprovalStatus, Backend, ClientConfig, ConnectionRequest,
    ConnectionRequestPatch, Deal, DealDeskError, DealDeskResult, DealId, DealStage, EntityIdType,
    FirmAgreement, FirmId, FunctionInvoker, Listing, ListingId, ListingStatus, Profile,
    RequestId, RequestStatus, TableName, Timestamp, UserId,
};

use async_trait::async_trait;
use dealdesk_core::{FunctionError, RealtimeError};
use dealdesk_query::{
    CacheEvent, ChangeEvent, ChangeFilter, ChangePayload, ErrorNotice, ErrorNotifier,
    RealtimeTransport,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// REALTIME
// ============================================================================

/// Realtime transport that broadcasts every emitted payload to every open
/// channel. Filtering is left to the bridge, as a misconfigured server
/// subscription would.
#[derive(Debug, Default)]
pub struct InMemoryRealtime {
    channels: Mutex<HashMap<String, mpsc::Sender<ChangePayload>>>,
    subscribes: Mutex<HashMap<String, u64>>,
    unsubscribes: Mutex<HashMap<String, u64>>,
    fail_subscribe: Mutex<Option<String>>,
}

impl InMemoryRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to every open channel. Returns how many received it.
    pub async fn emit(&self, payload: ChangePayload) -> usize {
        let senders: Vec<mpsc::Sender<ChangePayload>> =
            lock(&self.channels).values().cloned().collect();
        let mut delivered = 0;
        for tx in senders {
            if tx.send(payload.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop the server side of `channel`, as a lost connection would.
    pub fn disconnect(&self, channel: &str) {
        lock(&self.channels).remove(channel);
    }

    /// Make the next subscribe to `channel` fail.
    pub fn fail_subscribe_to(&self, channel: &str) {
        *lock(&self.fail_subscribe) = Some(channel.to_string());
    }

    pub fn subscribe_count(&self, channel: &str) -> u64 {
        lock(&self.subscribes).get(channel).copied().unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, channel: &str) -> u64 {
        lock(&self.unsubscribes).get(channel).copied().unwrap_or(0)
    }

    pub fn open_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.channels).keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryRealtime {
    async fn subscribe(
        &self,
        channel: &str,
        _filter: &ChangeFilter,
    ) -> DealDeskResult<mpsc::Receiver<ChangePayload>> {
        *lock(&self.subscribes).entry(channel.to_string()).or_default() += 1;
        let fail = lock(&self.fail_subscribe)
            .take_if(|name| name == channel)
            .is_some();
        if fail {
            return Err(RealtimeError::SubscribeFailed {
                channel: channel.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        let (tx, rx) = mpsc::channel(64);
        lock(&self.channels).insert(channel.to_string(), tx);
        Ok(rx)
    }

    fn unsubscribe(&self, channel: &str) {
        *lock(&self.unsubscribes).entry(channel.to_string()).or_default() += 1;
        lock(&self.channels).remove(channel);
    }
}

/// Row-change payload in the `public` schema.
pub fn change(event: ChangeEvent, table: TableName, new: Option<Value>, old: Option<Value>) -> ChangePayload {
    ChangePayload {
        event,
        schema: "public".to_string(),
        table,
        old,
        new,
    }
}

// ============================================================================
// SERVERLESS FUNCTIONS
// ============================================================================

/// Function invoker that records every call and answers from a script.
#[derive(Debug, Default)]
pub struct RecordingFunctions {
    calls: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, DealDeskError>>,
    invocations: AtomicU64,
}

impl RecordingFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, function: &str, value: Value) {
        lock(&self.responses).insert(function.to_string(), value);
    }

    /// Make every call to `function` fail with `status`.
    pub fn fail(&self, function: &str, status: u16) {
        lock(&self.failures).insert(
            function.to_string(),
            FunctionError::InvocationFailed {
                function: function.to_string(),
                status,
                message: "injected failure".to_string(),
            }
            .into(),
        );
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, function: &str) -> Vec<Value> {
        lock(&self.calls)
            .iter()
            .filter(|(name, _)| name == function)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FunctionInvoker for RecordingFunctions {
    async fn invoke(&self, name: &str, body: Value) -> DealDeskResult<Value> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        lock(&self.calls).push((name.to_string(), body));
        if let Some(err) = lock(&self.failures).get(name).cloned() {
            return Err(err);
        }
        Ok(lock(&self.responses)
            .get(name)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "success": true })))
    }
}

// ============================================================================
// NOTIFICATIONS AND EVENTS
// ============================================================================

/// Notifier that keeps every notice for later assertions.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    notices: Mutex<Vec<ErrorNotice>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<ErrorNotice> {
        lock(&self.notices).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.notices).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.notices).is_empty()
    }
}

impl ErrorNotifier for CollectingNotifier {
    fn notify(&self, notice: ErrorNotice) {
        lock(&self.notices).push(notice);
    }
}

/// Receive the next event or panic after 200ms.
pub async fn recv_event(rx: &mut broadcast::Receiver<CacheEvent>, label: &str) -> CacheEvent {
    match timeout(Duration::from_millis(200), rx.recv()).await {
        Ok(Ok(event)) => event,
        Ok(Err(err)) => panic!("Event recv error for {}: {:?}", label, err),
        Err(_) => panic!("Timed out waiting for event: {}", label),
    }
}

/// Every event currently buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use chrono::DateTime;

    /// Id of the connection request used in the rollback scenario.
    pub const REQUEST_42: u128 = 42;

    /// Fixed base time so fixtures sort deterministically.
    pub fn base_time() -> Timestamp {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    fn minutes_after_base(minutes: i64) -> Timestamp {
        base_time() + chrono::Duration::minutes(minutes)
    }

    pub fn profile(n: u128) -> Profile {
        let at = minutes_after_base(n as i64);
        Profile {
            id: UserId::from_u128(n),
            email: format!("buyer{}@example.com", n),
            first_name: format!("Buyer{}", n),
            last_name: "Test".to_string(),
            company: Some(format!("Fund {}", n)),
            buyer_type: Some("private_equity".to_string()),
            approval_status: ApprovalStatus::Pending,
            is_admin: false,
            email_verified: true,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn listing(n: u128) -> Listing {
        let at = minutes_after_base(n as i64);
        Listing {
            id: ListingId::from_u128(n),
            title: format!("Listing {}", n),
            category: "Services".to_string(),
            location: "Austin, TX".to_string(),
            revenue: 5_000_000,
            ebitda: 1_000_000,
            status: ListingStatus::Active,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn connection_request(id: u128, user: &Profile, listing: ListingId) -> ConnectionRequest {
        let at = minutes_after_base(id as i64);
        ConnectionRequest {
            id: RequestId::from_u128(id),
            user_id: user.id,
            listing_id: listing,
            status: RequestStatus::Pending,
            user_message: Some("We would like to learn more.".to_string()),
            admin_comment: None,
            followed_up: false,
            negative_followed_up: false,
            user: Some(user.summary()),
            decision_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn deal(n: u128) -> Deal {
        let at = minutes_after_base(n as i64);
        Deal {
            id: DealId::from_u128(n),
            title: format!("Deal {}", n),
            listing_id: Some(ListingId::from_u128(n)),
            stage: DealStage::Sourced,
            contact_email: Some(format!("seller{}@example.com", n)),
            nda_status: AgreementStatus::NotSent,
            fee_agreement_status: AgreementStatus::NotSent,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn firm(n: u128) -> FirmAgreement {
        FirmAgreement {
            id: FirmId::from_u128(n),
            firm_name: format!("Firm {}", n),
            nda_status: AgreementStatus::NotSent,
            nda_signed_at: None,
            fee_agreement_status: AgreementStatus::NotSent,
            fee_agreement_signed_at: None,
            member_count: 3,
            updated_at: minutes_after_base(n as i64),
        }
    }

    /// Backend with three buyers, two listings, a deal, a firm, and
    /// connection requests 40 through 44 (request 42 belongs to buyer 2).
    pub fn seeded_backend() -> InMemoryBackend {
        let buyers: Vec<Profile> = (1..=3).map(profile).collect();
        let listings = vec![listing(100), listing(101)];
        let requests: Vec<ConnectionRequest> = (40..=44)
            .map(|id| {
                let owner = &buyers[((id + 1) % 3) as usize];
                connection_request(id, owner, listings[(id % 2) as usize].id)
            })
            .collect();
        InMemoryBackend::new()
            .with_profiles(buyers)
            .with_listings(listings)
            .with_requests(requests)
            .with_deals(vec![deal(7)])
            .with_firms(vec![firm(9)])
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_request_status() -> impl Strategy<Value = RequestStatus> {
        prop_oneof![
            Just(RequestStatus::Pending),
            Just(RequestStatus::Approved),
            Just(RequestStatus::Rejected),
            Just(RequestStatus::OnHold),
        ]
    }

    pub fn arb_approval_status() -> impl Strategy<Value = ApprovalStatus> {
        prop_oneof![
            Just(ApprovalStatus::Pending),
            Just(ApprovalStatus::Approved),
            Just(ApprovalStatus::Rejected),
        ]
    }

    pub fn arb_deal_stage() -> impl Strategy<Value = DealStage> {
        prop_oneof![
            Just(DealStage::Sourced),
            Just(DealStage::Qualified),
            Just(DealStage::NdaSent),
            Just(DealStage::NdaSigned),
            Just(DealStage::LoiSubmitted),
            Just(DealStage::UnderContract),
            Just(DealStage::ClosedWon),
            Just(DealStage::ClosedLost),
        ]
    }

    pub fn arb_agreement_status() -> impl Strategy<Value = AgreementStatus> {
        prop_oneof![
            Just(AgreementStatus::NotSent),
            Just(AgreementStatus::Sent),
            Just(AgreementStatus::Signed),
            Just(AgreementStatus::Declined),
        ]
    }

    /// One of the seeded request ids (40..=44).
    pub fn arb_seeded_request_id() -> impl Strategy<Value = RequestId> {
        (40u128..=44).prop_map(RequestId::from_u128)
    }

    /// One of the seeded buyer ids (1..=3).
    pub fn arb_seeded_user_id() -> impl Strategy<Value = UserId> {
        (1u128..=3).prop_map(UserId::from_u128)
    }

    pub fn arb_request_patch() -> impl Strategy<Value = ConnectionRequestPatch> {
        (
            proptest::option::of(arb_request_status()),
            proptest::option::of("[a-zA-Z0-9 .,]{1,40}"),
            proptest::option::of(any::<bool>()),
            proptest::option::of(any::<bool>()),
        )
            .prop_map(|(status, admin_comment, followed_up, negative_followed_up)| {
                ConnectionRequestPatch {
                    status,
                    admin_comment,
                    followed_up,
                    negative_followed_up,
                }
            })
    }
}
