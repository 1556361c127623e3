//! # Leader Selection
//!
//! Deterministic, advisory leader designation among connected peers.
//!
//! ## Selection Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Leader Selection                                 │
//! │                                                                         │
//! │  INPUT: every known member with (id, priority, connected)              │
//! │                                                                         │
//! │  1. Drop members that are not connected                                │
//! │  2. Highest role_weight wins        controller (2) > display (1)        │
//! │  3. Equal weight: earliest start    start_timestamp ascending           │
//! │  4. Still equal: highest id wins    lexicographic, final tie-break      │
//! │                                                                         │
//! │  Every peer evaluating the same member set picks the same leader.      │
//! │  There are no terms and no votes: partitions may disagree until they   │
//! │  heal, and that is accepted.                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::cmp::Ordering;

use crate::types::Priority;

/// One member considered by [`select_leader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub id: &'a str,
    pub priority: Priority,
    pub connected: bool,
}

impl<'a> Candidate<'a> {
    pub fn new(id: &'a str, priority: Priority, connected: bool) -> Self {
        Candidate {
            id,
            priority,
            connected,
        }
    }
}

/// Total order used by the election; `Greater` means the better leader.
pub fn compare(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.priority.cmp(&b.priority).then_with(|| a.id.cmp(b.id))
}

/// Picks the leader among connected candidates, or `None` if none is
/// connected.
///
/// ## Example
/// ```rust
/// use stagelink_core::election::{select_leader, Candidate};
/// use stagelink_core::{PeerRole, Priority};
///
/// let members = [
///     Candidate::new("display-a", Priority::new(PeerRole::Display, 1_000), true),
///     Candidate::new("console", Priority::new(PeerRole::Controller, 9_000), true),
/// ];
/// assert_eq!(select_leader(members), Some("console"));
/// ```
pub fn select_leader<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = Candidate<'a>>,
{
    candidates
        .into_iter()
        .filter(|c| c.connected)
        .max_by(compare)
        .map(|c| c.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerRole;

    fn c(id: &str, role: PeerRole, start: i64) -> Candidate<'_> {
        Candidate::new(id, Priority::new(role, start), true)
    }

    #[test]
    fn test_controller_beats_display_regardless_of_start() {
        let early_display = c("d", PeerRole::Display, 1);
        let late_controller = c("c", PeerRole::Controller, 1_000_000);
        assert_eq!(select_leader([early_display, late_controller]), Some("c"));
        assert_eq!(select_leader([late_controller, early_display]), Some("c"));
    }

    #[test]
    fn test_earlier_start_wins_within_role() {
        let members = [
            c("late", PeerRole::Controller, 2_000),
            c("early", PeerRole::Controller, 1_000),
        ];
        assert_eq!(select_leader(members), Some("early"));
    }

    #[test]
    fn test_full_tie_broken_by_higher_id() {
        let members = [
            c("aaa", PeerRole::Display, 5),
            c("zzz", PeerRole::Display, 5),
            c("mmm", PeerRole::Display, 5),
        ];
        assert_eq!(select_leader(members), Some("zzz"));
    }

    #[test]
    fn test_disconnected_members_are_ignored() {
        let mut best = c("best", PeerRole::Controller, 1);
        best.connected = false;
        let other = c("other", PeerRole::Display, 10);
        assert_eq!(select_leader([best, other]), Some("other"));
    }

    #[test]
    fn test_no_connected_members() {
        assert_eq!(select_leader(Vec::<Candidate<'_>>::new()), None);
    }

    #[test]
    fn test_deterministic_under_permutation() {
        let a = c("a", PeerRole::Display, 3);
        let b = c("b", PeerRole::Controller, 7);
        let d = c("d", PeerRole::Controller, 7);
        let orders = [[a, b, d], [d, b, a], [b, a, d], [a, d, b]];
        for order in orders {
            assert_eq!(select_leader(order), Some("d"));
        }
    }
}
