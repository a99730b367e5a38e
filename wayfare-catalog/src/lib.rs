pub mod customer;
pub mod inventory;
pub mod item;
pub mod manager;

pub use customer::{Customer, ReservedItem};
pub use inventory::{InventoryError, InventoryTable, Record, ShadowTable};
pub use item::{ItemKey, ReservableItem};
pub use manager::InventoryManager;
