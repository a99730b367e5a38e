use serde::{Deserialize, Serialize};
use std::fmt;
use wayfare_shared::{CustomerId, ResourceKind};

/// Category-prefixed key of a record inside one RM's table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    pub fn flight(flight_num: i64) -> Self {
        ItemKey(format!("flight-{}", flight_num))
    }

    pub fn car(location: &str) -> Self {
        ItemKey(format!("car-{}", location.trim().to_lowercase()))
    }

    pub fn room(location: &str) -> Self {
        ItemKey(format!("room-{}", location.trim().to_lowercase()))
    }

    pub fn customer(id: CustomerId) -> Self {
        ItemKey(format!("customer-{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A flight, or the cars/rooms offered at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservableItem {
    pub key: ItemKey,
    pub kind: ResourceKind,
    /// Flight number or location, as given by the caller
    pub location: String,
    pub available: i64,
    pub reserved: i64,
    pub price: i64,
}

impl ReservableItem {
    pub fn new(kind: ResourceKind, key: ItemKey, location: impl Into<String>, count: i64, price: i64) -> Self {
        Self {
            key,
            kind,
            location: location.into(),
            available: count,
            reserved: 0,
            price,
        }
    }

    /// Adds capacity to an existing item. A non-positive price keeps the current one.
    /// Returns false, leaving the item untouched, when the total would overflow.
    pub fn restock(&mut self, count: i64, price: i64) -> bool {
        let Some(available) = self.available.checked_add(count) else {
            return false;
        };
        if available.checked_add(self.reserved).is_none() {
            return false;
        }
        self.available = available;
        if price > 0 {
            self.price = price;
        }
        true
    }

    /// Moves one unit from available to reserved. Returns false when sold out.
    pub fn reserve_one(&mut self) -> bool {
        if self.available <= 0 {
            return false;
        }
        self.available -= 1;
        self.reserved += 1;
        true
    }

    /// Returns up to `count` reserved units to the available pool. The total
    /// never changes, so the move cannot overflow.
    pub fn release(&mut self, count: i64) {
        let moved = count.clamp(0, self.reserved);
        self.available += moved;
        self.reserved -= moved;
    }

    pub fn is_deletable(&self) -> bool {
        self.reserved == 0
    }

    pub fn total(&self) -> i64 {
        self.available + self.reserved
    }
}
