//! Storage module for persistent data storage
//!
//! Provides the SQLite database behind the durable record store and broker.

mod database;

pub use database::PipelineDb;
