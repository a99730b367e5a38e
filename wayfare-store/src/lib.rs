pub mod app_config;
pub mod journal_repo;

pub use app_config::Config;
pub use journal_repo::{FileJournal, MemoryJournal};
