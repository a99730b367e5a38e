use crate::item::ItemKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use wayfare_shared::CustomerId;

/// Units of one item held by a customer, at the price paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedItem {
    pub key: ItemKey,
    pub location: String,
    pub count: i64,
    pub price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub reservations: BTreeMap<ItemKey, ReservedItem>,
}

impl Customer {
    pub fn new(id: CustomerId) -> Self {
        Self {
            id,
            reservations: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::customer(self.id)
    }

    /// Records one more unit of `key`. The latest price wins.
    pub fn reserve(&mut self, key: &ItemKey, location: &str, price: i64) {
        self.reservations
            .entry(key.clone())
            .and_modify(|r| {
                r.count += 1;
                r.price = price;
            })
            .or_insert_with(|| ReservedItem {
                key: key.clone(),
                location: location.to_string(),
                count: 1,
                price,
            });
    }

    /// Bill lines ordered by item key, header always present.
    pub fn bill(&self) -> String {
        let mut s = format!("Bill for customer {}\n", self.id);
        for item in self.reservations.values() {
            let _ = writeln!(s, "{} {} ${}", item.count, item.key, item.price);
        }
        s
    }
}
