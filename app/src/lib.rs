mod app;
pub mod ack;
pub mod activity;
pub mod clock;
pub mod config;
pub mod distributor;
pub mod error;
pub mod interfaces;
pub mod messages;
pub mod metrics;
pub mod peer;
pub mod service;
pub mod session;
pub mod testing;
pub mod types;
pub mod watchdog;

#[cfg(test)]
mod tests;

// for main.rs
pub use app::run;
