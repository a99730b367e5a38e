use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The resource category a resource manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Flight,
    Car,
    Room,
}

impl ResourceKind {
    /// Fixed order used whenever several RMs are locked or called together.
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Flight, ResourceKind::Car, ResourceKind::Room];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Flight => "flight",
            ResourceKind::Car => "car",
            ResourceKind::Room => "room",
        }
    }

    /// Heading used when partial bills are stitched together.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Flight => "Flight info",
            ResourceKind::Car => "Car info",
            ResourceKind::Room => "Room info",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownResourceKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flight" | "flights" => Ok(ResourceKind::Flight),
            "car" | "cars" => Ok(ResourceKind::Car),
            "room" | "rooms" | "hotel" => Ok(ResourceKind::Room),
            other => Err(UnknownResourceKind(other.to_string())),
        }
    }
}
