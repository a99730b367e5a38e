use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Places in a commit where the coordinator can be told to halt, leaving
/// recovery to whatever reached the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPoint {
    /// PREPARING is journaled, no vote was requested
    BeforeVote,
    /// One participant voted, the rest were never asked
    AfterFirstVote,
    /// Every vote is in, no decision recorded
    AfterVotes,
    /// Decision journaled, no participant told
    AfterDecision,
    /// Decision delivered to the first participant only
    AfterFirstDelivery,
    /// Decision delivered everywhere, entry not reclaimed
    AfterDelivery,
}

impl FaultPoint {
    pub const ALL: [FaultPoint; 6] = [
        FaultPoint::BeforeVote,
        FaultPoint::AfterFirstVote,
        FaultPoint::AfterVotes,
        FaultPoint::AfterDecision,
        FaultPoint::AfterFirstDelivery,
        FaultPoint::AfterDelivery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultPoint::BeforeVote => "before_vote",
            FaultPoint::AfterFirstVote => "after_first_vote",
            FaultPoint::AfterVotes => "after_votes",
            FaultPoint::AfterDecision => "after_decision",
            FaultPoint::AfterFirstDelivery => "after_first_delivery",
            FaultPoint::AfterDelivery => "after_delivery",
        }
    }

    /// True when the decision is on disk by the time the coordinator halts.
    pub fn is_decided(&self) -> bool {
        matches!(
            self,
            FaultPoint::AfterDecision | FaultPoint::AfterFirstDelivery | FaultPoint::AfterDelivery
        )
    }
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown fault point: {0}")]
pub struct UnknownFaultPoint(pub String);

impl FromStr for FaultPoint {
    type Err = UnknownFaultPoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        FaultPoint::ALL
            .into_iter()
            .find(|point| point.as_str() == wanted)
            .ok_or(UnknownFaultPoint(wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_point_names() {
        assert_eq!("After_Decision".parse::<FaultPoint>().unwrap(), FaultPoint::AfterDecision);
        assert_eq!(
            serde_json::to_string(&FaultPoint::AfterFirstVote).unwrap(),
            "\"after_first_vote\""
        );
        for point in FaultPoint::ALL {
            assert_eq!(point.as_str().parse::<FaultPoint>().unwrap(), point);
        }
        assert!("reboot".parse::<FaultPoint>().is_err());
    }
}
