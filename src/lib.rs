pub mod app;
pub mod assignment;
pub mod bus;
pub mod config;
pub mod error;
pub mod liveness;
pub mod notices;
pub mod reconciler;
pub mod store;
pub mod sweeper;
pub mod types;
