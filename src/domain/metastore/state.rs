//! Queue lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::backend::MetaStoreError;

/// The lifecycle stage a message currently occupies.
///
/// States carry no ordering: the store accepts any transition, including
/// `Active -> Deferred -> Active`. Which transitions make sense is decided by
/// the caller's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Incoming,
    Active,
    Deferred,
    Hold,
    Bounce,
}

impl QueueState {
    /// Every state, in declaration order.
    pub const ALL: [QueueState; 5] = [
        QueueState::Incoming,
        QueueState::Active,
        QueueState::Deferred,
        QueueState::Hold,
        QueueState::Bounce,
    ];

    /// Canonical lowercase name used for directories, columns and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Incoming => "incoming",
            QueueState::Active => "active",
            QueueState::Deferred => "deferred",
            QueueState::Hold => "hold",
            QueueState::Bounce => "bounce",
        }
    }

    /// Dense index for fixed-size per-state tables.
    pub(crate) fn index(&self) -> usize {
        match self {
            QueueState::Incoming => 0,
            QueueState::Active => 1,
            QueueState::Deferred => 2,
            QueueState::Hold => 3,
            QueueState::Bounce => 4,
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = MetaStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(QueueState::Incoming),
            "active" => Ok(QueueState::Active),
            "deferred" => Ok(QueueState::Deferred),
            "hold" => Ok(QueueState::Hold),
            "bounce" => Ok(QueueState::Bounce),
            other => Err(MetaStoreError::InvalidState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_round_trip() {
        for state in QueueState::ALL {
            assert_eq!(state.as_str().parse::<QueueState>().unwrap(), state);
            assert_eq!(state.to_string(), state.as_str());
        }
    }

    #[test]
    fn test_unknown_state_rejected() {
        let err = "retrying".parse::<QueueState>().unwrap_err();
        assert!(matches!(err, MetaStoreError::InvalidState(ref s) if s == "retrying"));

        // Names are case sensitive
        assert!("Active".parse::<QueueState>().is_err());
    }

    #[test]
    fn test_indexes_are_dense() {
        let mut seen = [false; 5];
        for state in QueueState::ALL {
            seen[state.index()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&QueueState::Deferred).unwrap();
        assert_eq!(json, "\"deferred\"");

        let state: QueueState = serde_json::from_str("\"hold\"").unwrap();
        assert_eq!(state, QueueState::Hold);
    }
}
