// Storage layer for the account store

pub mod database;
pub mod ledger;

pub use database::Database;
pub use ledger::{AccountRole, CreditLedger, UsageAccount, UsageEvent};
