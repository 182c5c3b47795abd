pub mod accounts;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod store;
pub mod types;
pub mod utils;
