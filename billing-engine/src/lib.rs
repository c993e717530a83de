//! Billing engine: daily subscription renewal batches.

pub mod clock;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod scheduler;
pub mod services;
pub mod startup;
