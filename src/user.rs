//! User domain types and the invite-chain proximity metric.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Proximity returned when two users share no invite ancestor.
pub const PROXIMITY_UNRELATED: usize = 9_999;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub device_ids: Vec<String>,
    pub apns_token: Option<String>,
    /// Ordered user ids from self to root inviter; `chain[0] == id`.
    pub ancestor_chain: Vec<i64>,
    pub invites_remaining: i64,
    pub profile_complete: bool,
    pub profile_completed_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.email)
    }
}

/// Invite-tree distance between two ancestor chains: the sum of both
/// walk lengths to the first shared ancestor, or [`PROXIMITY_UNRELATED`]
/// when the chains never meet.
pub fn proximity(chain_a: &[i64], chain_b: &[i64]) -> usize {
    if chain_a.is_empty() || chain_b.is_empty() {
        return PROXIMITY_UNRELATED;
    }
    if chain_a[0] == chain_b[0] {
        return 0;
    }
    for (i, ancestor) in chain_a.iter().enumerate() {
        if let Some(j) = chain_b.iter().position(|b| b == ancestor) {
            return i + j;
        }
    }
    PROXIMITY_UNRELATED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proximity_self() {
        assert_eq!(proximity(&[1], &[1]), 0);
    }

    #[test]
    fn test_proximity_siblings() {
        // 2 and 3 both invited by 1
        assert_eq!(proximity(&[2, 1], &[3, 1]), 2);
    }

    #[test]
    fn test_proximity_parent_child() {
        // 2 invited by 1
        assert_eq!(proximity(&[2, 1], &[1]), 1);
    }

    #[test]
    fn test_proximity_unrelated() {
        assert_eq!(proximity(&[2, 1], &[4, 3]), PROXIMITY_UNRELATED);
        assert_eq!(proximity(&[], &[1]), PROXIMITY_UNRELATED);
    }
}
