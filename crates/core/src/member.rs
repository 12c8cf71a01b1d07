use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered club participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub email: String,
    pub student_id: String,
    pub department: String,
    pub batch: String,
    pub status: MemberStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soft_deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Member {
    /// Returns `true` when the member has withdrawn from the club.
    pub fn is_deleted(&self) -> bool {
        matches!(self.status, MemberStatus::Deleted)
    }
}

/// Membership status persisted in the database.
///
/// Withdrawal is a one-way transition: `Deleted` members never return to
/// `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Active,
    Deleted,
}

impl MemberStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Deleted => "DELETED",
        }
    }
}

/// Payload used by the member service to create a new member.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemberCreateCommand {
    pub name: String,
    pub email: String,
    pub student_id: String,
    pub department: String,
    pub batch: String,
}

/// A scheduled club event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(status: MemberStatus) -> Member {
        Member {
            id: "m-1".to_string(),
            name: "Sam".to_string(),
            email: "sam@example.com".to_string(),
            student_id: "202412345".to_string(),
            department: "CS".to_string(),
            batch: "24-25".to_string(),
            status,
            soft_deleted_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn active_member_is_not_deleted() {
        assert!(!member(MemberStatus::Active).is_deleted());
    }

    #[test]
    fn deleted_member_reports_deleted() {
        assert!(member(MemberStatus::Deleted).is_deleted());
    }

    #[test]
    fn status_round_trips_canonical_strings() {
        assert_eq!(MemberStatus::Active.as_str(), "ACTIVE");
        assert_eq!(MemberStatus::Deleted.as_str(), "DELETED");
    }
}
