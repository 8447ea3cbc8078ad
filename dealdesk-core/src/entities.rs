//! Row types for the marketplace tables and their update payloads.
//!
//! Update payloads carry only the fields being changed. `apply_to` is shared
//! by optimistic patches and by in-memory backends so that a provisional row
//! has the same shape a refetch would produce.

use serde::{Deserialize, Serialize};

use crate::{
    AgreementKind, AgreementStatus, ApprovalStatus, DealId, DealStage, FirmId, ListingId,
    ListingStatus, RequestId, RequestStatus, Timestamp, UserId,
};

/// Marketplace user (`profiles`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub buyer_type: Option<String>,
    pub approval_status: ApprovalStatus,
    pub is_admin: bool,
    pub email_verified: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Profile {
    /// The sub-record embedded in connection requests.
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            company: self.company.clone(),
            approval_status: self.approval_status,
            is_admin: self.is_admin,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// User fields embedded in a connection request row.
///
/// These alias `Profile` fields, so a profile update has to reach every cached
/// connection-request list as well as the admin user list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub approval_status: ApprovalStatus,
    pub is_admin: bool,
}

/// Buyer request to connect on a listing (`connection_requests`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub id: RequestId,
    pub user_id: UserId,
    pub listing_id: ListingId,
    pub status: RequestStatus,
    pub user_message: Option<String>,
    pub admin_comment: Option<String>,
    pub followed_up: bool,
    pub negative_followed_up: bool,
    pub user: Option<UserSummary>,
    pub decision_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Business for sale (`listings`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub category: String,
    pub location: String,
    pub revenue: i64,
    pub ebitda: i64,
    pub status: ListingStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Deal tracked in the admin pipeline (`deals`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub title: String,
    pub listing_id: Option<ListingId>,
    pub stage: DealStage,
    pub contact_email: Option<String>,
    pub nda_status: AgreementStatus,
    pub fee_agreement_status: AgreementStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Firm-level NDA and fee agreement tracking (`firm_agreements`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmAgreement {
    pub id: FirmId,
    pub firm_name: String,
    pub nda_status: AgreementStatus,
    pub nda_signed_at: Option<Timestamp>,
    pub fee_agreement_status: AgreementStatus,
    pub fee_agreement_signed_at: Option<Timestamp>,
    pub member_count: i32,
    pub updated_at: Timestamp,
}

impl FirmAgreement {
    pub fn status_of(&self, kind: AgreementKind) -> AgreementStatus {
        match kind {
            AgreementKind::Nda => self.nda_status,
            AgreementKind::FeeAgreement => self.fee_agreement_status,
        }
    }
}

// ============================================================================
// UPDATE PAYLOADS
// ============================================================================

/// Update payload for connection requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequestPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followed_up: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_followed_up: Option<bool>,
}

impl ConnectionRequestPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, row: &mut ConnectionRequest, now: Timestamp) {
        if let Some(status) = self.status {
            if status != row.status {
                row.decision_at = status.is_decided().then_some(now);
            }
            row.status = status;
        }
        if let Some(comment) = &self.admin_comment {
            row.admin_comment = Some(comment.clone());
        }
        if let Some(followed_up) = self.followed_up {
            row.followed_up = followed_up;
        }
        if let Some(negative) = self.negative_followed_up {
            row.negative_followed_up = negative;
        }
        row.updated_at = now;
    }
}

/// Update payload for profiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, row: &mut Profile, now: Timestamp) {
        if let Some(status) = self.approval_status {
            row.approval_status = status;
        }
        if let Some(is_admin) = self.is_admin {
            row.is_admin = is_admin;
        }
        row.updated_at = now;
    }

    /// Apply the same change to an embedded user sub-record.
    pub fn apply_to_summary(&self, summary: &mut UserSummary) {
        if let Some(status) = self.approval_status {
            summary.approval_status = status;
        }
        if let Some(is_admin) = self.is_admin {
            summary.is_admin = is_admin;
        }
    }
}

/// Update payload for listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ListingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ListingPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, row: &mut Listing, now: Timestamp) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(title) = &self.title {
            row.title = title.clone();
        }
        row.updated_at = now;
    }
}

/// Update payload for deals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<DealStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nda_status: Option<AgreementStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_agreement_status: Option<AgreementStatus>,
}

impl DealPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, row: &mut Deal, now: Timestamp) {
        if let Some(stage) = self.stage {
            row.stage = stage;
        }
        if let Some(status) = self.nda_status {
            row.nda_status = status;
        }
        if let Some(status) = self.fee_agreement_status {
            row.fee_agreement_status = status;
        }
        row.updated_at = now;
    }
}

/// Update payload for firm agreements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmAgreementPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nda_status: Option<AgreementStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_agreement_status: Option<AgreementStatus>,
}

impl FirmAgreementPatch {
    /// Patch setting one agreement to `status`.
    pub fn for_kind(kind: AgreementKind, status: AgreementStatus) -> Self {
        match kind {
            AgreementKind::Nda => Self {
                nda_status: Some(status),
                ..Self::default()
            },
            AgreementKind::FeeAgreement => Self {
                fee_agreement_status: Some(status),
                ..Self::default()
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, row: &mut FirmAgreement, now: Timestamp) {
        if let Some(status) = self.nda_status {
            row.nda_signed_at = (status == AgreementStatus::Signed).then_some(now);
            row.nda_status = status;
        }
        if let Some(status) = self.fee_agreement_status {
            row.fee_agreement_signed_at = (status == AgreementStatus::Signed).then_some(now);
            row.fee_agreement_status = status;
        }
        row.updated_at = now;
    }
}
