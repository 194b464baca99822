//! Branded identifier types.
//!
//! Each id is a thin newtype over [`uuid::Uuid`] with its own decode-and-
//! validate constructor, so a `StockId` and a `FlowId` can never be mixed up
//! even though both are UUIDs underneath.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

branded_id!(ModelId);
branded_id!(StockId);
branded_id!(FlowId);
branded_id!(VariableId);
branded_id!(ScenarioId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let id = StockId::new();
        let text = id.to_string();
        let parsed: StockId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_invalid_string() {
        assert!("not-a-uuid".parse::<StockId>().is_err());
    }
}
