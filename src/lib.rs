pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod intelligence;
pub mod metrics;
pub mod models;
pub mod services;
