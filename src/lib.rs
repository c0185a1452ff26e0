pub mod api;
pub mod artifact;
pub mod config;
pub mod error;
pub mod execution;
pub mod orchestrator;
pub mod runner;
pub mod service;
pub mod shutdown;
