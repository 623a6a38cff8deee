pub mod api;
pub mod config;
pub mod error;
pub mod queue;
pub mod runner;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod task;
pub mod worker;
pub mod workspace;
