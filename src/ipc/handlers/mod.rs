pub mod backup_exchange;
pub mod core;
pub mod roster;
pub mod setup;
pub mod transition;
