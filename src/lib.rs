//! Library crate for eternal-scan: target expansion, the scan scheduler and
//! probe pool, the device inventory and the HTTP API around them.
pub mod auth;
pub mod config;
pub mod country;
pub mod error;
pub mod inventory;
pub mod netdetect;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod targets;
pub mod types;
