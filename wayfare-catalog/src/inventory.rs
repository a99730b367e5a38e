use crate::customer::Customer;
use crate::item::{ItemKey, ReservableItem};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use wayfare_core::CoreError;

/// One entry of an RM table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Item(ReservableItem),
    Customer(Customer),
}

impl Record {
    pub fn key(&self) -> ItemKey {
        match self {
            Record::Item(item) => item.key.clone(),
            Record::Customer(customer) => customer.key(),
        }
    }

    pub fn into_item(self) -> Result<ReservableItem, InventoryError> {
        match self {
            Record::Item(item) => Ok(item),
            Record::Customer(c) => Err(InventoryError::WrongRecordType {
                key: c.key().to_string(),
                expected: "item",
            }),
        }
    }

    pub fn into_customer(self) -> Result<Customer, InventoryError> {
        match self {
            Record::Customer(c) => Ok(c),
            Record::Item(item) => Err(InventoryError::WrongRecordType {
                key: item.key.to_string(),
                expected: "customer",
            }),
        }
    }
}

/// Committed records of one resource manager
#[derive(Debug, Default, Clone)]
pub struct InventoryTable {
    records: HashMap<ItemKey, Record>,
}

impl InventoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ItemKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn put(&mut self, record: Record) {
        self.records.insert(record.key(), record);
    }

    pub fn remove(&mut self, key: &ItemKey) -> Option<Record> {
        self.records.remove(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Applies a transaction's staged entries. Tombstones delete.
    pub fn merge(&mut self, shadow: ShadowTable) -> usize {
        let mut applied = 0;
        for (key, entry) in shadow.entries {
            match entry {
                Some(record) => {
                    self.records.insert(key, record);
                }
                None => {
                    self.records.remove(&key);
                }
            }
            applied += 1;
        }
        applied
    }
}

/// Copy-on-first-access overlay owned by one transaction.
///
/// `None` entries are tombstones for records deleted inside the transaction.
#[derive(Debug)]
pub struct ShadowTable {
    entries: HashMap<ItemKey, Option<Record>>,
    closed: bool,
}

impl ShadowTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            closed: false,
        }
    }

    /// `Some(entry)` if the key was already staged, `None` if it must be read through.
    pub fn get(&self, key: &ItemKey) -> Option<&Option<Record>> {
        self.entries.get(key)
    }

    pub fn stage(&mut self, key: ItemKey, entry: Option<Record>) {
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A closed shadow has been merged or discarded and accepts no more work.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Marks the shadow closed and hands its entries over.
    pub fn close(&mut self) -> ShadowTable {
        self.closed = true;
        ShadowTable {
            entries: std::mem::take(&mut self.entries),
            closed: true,
        }
    }
}

impl Default for ShadowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Record {key} is not a {expected}")]
    WrongRecordType {
        key: String,
        expected: &'static str,
    },

    #[error("Could not mint a free customer id after {0} attempts")]
    CustomerIdExhausted(usize),
}

impl From<InventoryError> for CoreError {
    fn from(err: InventoryError) -> Self {
        CoreError::Internal(err.to_string())
    }
}
