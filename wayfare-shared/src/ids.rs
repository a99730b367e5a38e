use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transaction identifier shared by the coordinator, the TM and every RM.
///
/// `TxnId::GLOBAL` addresses the committed table directly and is never
/// registered with the transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(pub i64);

impl TxnId {
    pub const GLOBAL: TxnId = TxnId(-1);

    pub fn is_global(&self) -> bool {
        *self == Self::GLOBAL
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxnId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(TxnId)
    }
}

impl From<i64> for TxnId {
    fn from(value: i64) -> Self {
        TxnId(value)
    }
}

pub type CustomerId = i64;
