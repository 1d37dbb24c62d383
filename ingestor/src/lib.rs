pub mod commands;
pub mod config;
pub mod db;
pub mod engine;
pub mod envelope;
pub mod errors;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod query;
pub mod request;
pub mod resolution;
pub mod rest;
pub mod router;
pub mod rules;
pub mod store;
pub mod validate;
