//! Serverless function wrappers.

use dealdesk_core::{
    AgreementKind, DealDeskResult, FirmAgreement, FunctionError, FunctionInvoker, ListingId,
    Profile, UserId,
};
use dealdesk_query::{fetcher_fn, QueryClient, QueryKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub const SEND_USER_APPROVAL_EMAIL: &str = "send-user-approval-email";
pub const SEND_NDA_EMAIL: &str = "send-nda-email";
pub const SEND_FEE_AGREEMENT_EMAIL: &str = "send-fee-agreement-email";
pub const SCORE_BUYERS: &str = "score-buyers";
pub const PASSWORD_RESET: &str = "password-reset";
pub const NOTIFY_ADMINS: &str = "notify-admins";

/// Fit score of one buyer for a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyerScore {
    pub user_id: UserId,
    pub score: f64,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScoreBuyersResponse {
    scores: Vec<BuyerScore>,
}

/// Function that sends the email for an agreement kind.
pub fn agreement_email_function(kind: AgreementKind) -> &'static str {
    match kind {
        AgreementKind::Nda => SEND_NDA_EMAIL,
        AgreementKind::FeeAgreement => SEND_FEE_AGREEMENT_EMAIL,
    }
}

/// Typed calls to the hosted functions.
///
/// Email and notification functions are side effects and are not cached.
/// `score-buyers` is a read and goes through the query cache.
#[derive(Clone)]
pub struct AdminFunctions {
    client: QueryClient,
    invoker: Arc<dyn FunctionInvoker>,
}

impl AdminFunctions {
    pub fn new(client: QueryClient, invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self { client, invoker }
    }

    pub async fn send_user_approval_email(&self, profile: &Profile) -> DealDeskResult<()> {
        let body = json!({
            "user_id": profile.id,
            "email": profile.email,
            "first_name": profile.first_name,
            "last_name": profile.last_name,
        });
        self.call(SEND_USER_APPROVAL_EMAIL, body).await?;
        info!(user_id = %profile.id, "Sent approval email");
        Ok(())
    }

    pub async fn send_agreement_email(
        &self,
        kind: AgreementKind,
        firm: &FirmAgreement,
    ) -> DealDeskResult<()> {
        let function = agreement_email_function(kind);
        let body = json!({
            "firm_id": firm.id,
            "firm_name": firm.firm_name,
            "agreement": kind,
        });
        self.call(function, body).await?;
        info!(firm_id = %firm.id, function = function, "Sent agreement email");
        Ok(())
    }

    pub async fn send_password_reset(&self, email: &str) -> DealDeskResult<()> {
        self.call(PASSWORD_RESET, json!({ "email": email })).await?;
        Ok(())
    }

    pub async fn notify_admins(&self, subject: &str, message: &str) -> DealDeskResult<()> {
        self.call(NOTIFY_ADMINS, json!({ "subject": subject, "message": message }))
            .await?;
        Ok(())
    }

    /// Buyer scores for a listing, cached under `buyer-scores/<listing>`.
    pub async fn score_buyers(&self, listing_id: ListingId) -> DealDeskResult<Vec<BuyerScore>> {
        let invoker = Arc::clone(&self.invoker);
        let fetcher = fetcher_fn(move |_key| {
            let invoker = Arc::clone(&invoker);
            async move {
                let response = invoker
                    .invoke(SCORE_BUYERS, json!({ "listing_id": listing_id }))
                    .await?;
                let parsed: ScoreBuyersResponse = decode(SCORE_BUYERS, response)?;
                Ok(serde_json::to_value(parsed.scores).map_err(dealdesk_core::CacheError::from)?)
            }
        });
        self.client
            .query_data(&QueryKey::buyer_scores(listing_id), fetcher)
            .await
    }

    async fn call(&self, function: &str, body: Value) -> DealDeskResult<Value> {
        self.invoker.invoke(function, body).await.inspect_err(|e| {
            warn!(function = function, error = %e, "Function call failed");
        })
    }
}

fn decode<T: DeserializeOwned>(function: &str, value: Value) -> DealDeskResult<T> {
    serde_json::from_value(value).map_err(|e| {
        FunctionError::InvalidResponse {
            function: function.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealdesk_core::{DealDeskError, EntityIdType};
    use dealdesk_test_utils::fixtures::{firm, profile};
    use dealdesk_test_utils::RecordingFunctions;

    fn functions() -> (AdminFunctions, Arc<RecordingFunctions>) {
        let invoker = Arc::new(RecordingFunctions::new());
        let functions = AdminFunctions::new(QueryClient::default(), invoker.clone());
        (functions, invoker)
    }

    #[tokio::test]
    async fn test_approval_email_body() {
        let (functions, invoker) = functions();
        functions
            .send_user_approval_email(&profile(2))
            .await
            .expect("send");
        let calls = invoker.calls_to(SEND_USER_APPROVAL_EMAIL);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["email"], json!("buyer2@example.com"));
    }

    #[tokio::test]
    async fn test_agreement_email_picks_function() {
        let (functions, invoker) = functions();
        functions
            .send_agreement_email(AgreementKind::FeeAgreement, &firm(9))
            .await
            .expect("send");
        assert_eq!(invoker.calls_to(SEND_FEE_AGREEMENT_EMAIL).len(), 1);
        assert!(invoker.calls_to(SEND_NDA_EMAIL).is_empty());
    }

    #[tokio::test]
    async fn test_score_buyers_is_cached_per_listing() {
        let invoker = Arc::new(RecordingFunctions::new());
        invoker.respond(
            SCORE_BUYERS,
            json!({ "scores": [{ "user_id": UserId::from_u128(1), "score": 0.9 }] }),
        );
        let mut config = dealdesk_core::ClientConfig::default();
        config.query.stale_time_ms = 60_000;
        let functions = AdminFunctions::new(QueryClient::from_config(config), invoker.clone());

        let listing = ListingId::from_u128(100);
        let scores = functions.score_buyers(listing).await.expect("scores");
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].rationale, None);
        functions.score_buyers(listing).await.expect("scores");
        assert_eq!(invoker.invocation_count(), 1);
    }

    #[tokio::test]
    async fn test_score_buyers_rejects_malformed_response() {
        let (functions, invoker) = functions();
        invoker.respond(SCORE_BUYERS, json!({ "unexpected": true }));
        let err = functions
            .score_buyers(ListingId::from_u128(100))
            .await
            .expect_err("malformed");
        assert!(matches!(
            err,
            DealDeskError::Function(FunctionError::InvalidResponse { .. })
        ));
    }
}
