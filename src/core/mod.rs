pub mod balance_cache;
pub mod chat;
pub mod config;
pub mod deduction;
pub mod eligibility;
pub mod formatter;
pub mod gate;
pub mod generator;
pub mod idempotency;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod pricing;
pub mod service;
pub mod telemetry;
pub mod transactions;

#[cfg(test)]
pub mod testing;
