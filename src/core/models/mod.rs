pub mod balance;
pub mod chat;
pub mod deduction;
pub mod pricing;
pub mod transaction;
pub mod user;
