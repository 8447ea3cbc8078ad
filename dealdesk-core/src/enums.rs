//! Enum types shared across DealDesk crates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Backend tables the marketplace reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Profiles,
    ConnectionRequests,
    Listings,
    Deals,
    FirmAgreements,
}

impl TableName {
    /// All known tables, in declaration order.
    pub const ALL: [TableName; 5] = [
        TableName::Profiles,
        TableName::ConnectionRequests,
        TableName::Listings,
        TableName::Deals,
        TableName::FirmAgreements,
    ];

    /// Name of the table as the backend knows it.
    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Profiles => "profiles",
            TableName::ConnectionRequests => "connection_requests",
            TableName::Listings => "listings",
            TableName::Deals => "deals",
            TableName::FirmAgreements => "firm_agreements",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TableName::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "table".to_string(),
                reason: format!("unknown table '{}'", s),
            })
    }
}

/// Lifecycle of a buyer's request to connect on a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    OnHold,
}

impl RequestStatus {
    /// Wire name, as stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::OnHold => "on_hold",
        }
    }

    /// Whether an admin has made a final decision.
    pub fn is_decided(&self) -> bool {
        matches!(self, RequestStatus::Approved | RequestStatus::Rejected)
    }
}

/// Admin approval of a marketplace account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// Publication state of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Draft,
    Active,
    Inactive,
    Sold,
}

/// Stage of a deal in the admin pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    #[default]
    Sourced,
    Qualified,
    NdaSent,
    NdaSigned,
    LoiSubmitted,
    UnderContract,
    ClosedWon,
    ClosedLost,
}

impl DealStage {
    /// Closed deals no longer move through the pipeline.
    pub fn is_closed(&self) -> bool {
        matches!(self, DealStage::ClosedWon | DealStage::ClosedLost)
    }
}

/// Status of a signable agreement (NDA or fee agreement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    #[default]
    NotSent,
    Sent,
    Signed,
    Declined,
}

/// Which agreement a firm-level update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementKind {
    Nda,
    FeeAgreement,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_roundtrip() {
        for table in TableName::ALL {
            assert_eq!(table.as_str().parse::<TableName>().ok(), Some(table));
        }
        assert!("users".parse::<TableName>().is_err());
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_value(RequestStatus::OnHold).expect("serialize");
        assert_eq!(json, serde_json::json!("on_hold"));
        let stage: DealStage = serde_json::from_value(serde_json::json!("loi_submitted"))
            .expect("deserialize");
        assert_eq!(stage, DealStage::LoiSubmitted);
    }

    #[test]
    fn test_request_status_as_str_matches_wire_name() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Rejected,
            RequestStatus::OnHold,
        ] {
            let json = serde_json::to_value(status).expect("serialize");
            assert_eq!(json, serde_json::json!(status.as_str()));
        }
    }

    #[test]
    fn test_request_status_decided() {
        assert!(!RequestStatus::Pending.is_decided());
        assert!(!RequestStatus::OnHold.is_decided());
        assert!(RequestStatus::Approved.is_decided());
        assert!(RequestStatus::Rejected.is_decided());
    }
}
