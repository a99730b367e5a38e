pub mod ids;
pub mod models;
pub mod resource;

pub use ids::{CustomerId, TxnId};
pub use resource::ResourceKind;
