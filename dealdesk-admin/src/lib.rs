//! DealDesk Admin - Marketplace Admin Call Sites
//!
//! The reads, optimistic writes, serverless function calls and realtime
//! channels behind the admin screens, all sharing one [`QueryClient`].
//!
//! ```text
//! AdminConsole
//!   ├── AdminQueries    (cached reads over Backend)
//!   ├── AdminMutations  (optimistic writes, patches + fan-out)
//!   ├── AdminFunctions  (emails, buyer scoring, notifications)
//!   └── realtime        (per-table channel presets)
//! ```

pub mod functions;
pub mod mutations;
pub mod queries;
pub mod realtime;
pub mod telemetry;

pub use functions::{AdminFunctions, BuyerScore};
pub use mutations::{
    AdminMutations, DealUpdate, FirmUpdate, ListingUpdate, ProfileUpdate, RequestUpdate,
};
pub use queries::{request_list_key, AdminQueries};
pub use realtime::{channel_presets, subscribe_all};
pub use telemetry::{init_tracing, TelemetryConfig};

use dealdesk_core::{Backend, DealDeskResult, FunctionInvoker};
use dealdesk_query::{QueryClient, RealtimeTransport, SubscriptionHandle};
use std::sync::Arc;

/// Everything an admin session needs, wired to one client.
pub struct AdminConsole {
    client: QueryClient,
    queries: AdminQueries,
    mutations: AdminMutations,
    functions: AdminFunctions,
}

impl AdminConsole {
    pub fn new(
        client: QueryClient,
        backend: Arc<dyn Backend>,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> DealDeskResult<Self> {
        let functions = AdminFunctions::new(client.clone(), invoker);
        let mutations = AdminMutations::new(client.clone(), Arc::clone(&backend), functions.clone())?;
        let queries = AdminQueries::new(client.clone(), backend);
        Ok(Self {
            client,
            queries,
            mutations,
            functions,
        })
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn queries(&self) -> &AdminQueries {
        &self.queries
    }

    pub fn mutations(&self) -> &AdminMutations {
        &self.mutations
    }

    pub fn functions(&self) -> &AdminFunctions {
        &self.functions
    }

    /// Subscribe the per-table realtime channels.
    pub async fn connect_realtime(
        &self,
        transport: Arc<dyn RealtimeTransport>,
    ) -> DealDeskResult<Vec<SubscriptionHandle>> {
        subscribe_all(&self.client, transport).await
    }
}
