//! Shared store access for recwatch.
//!
//! This crate contains:
//! - The `CollectionGateway` trait and `Record` type
//! - A ClickHouse-backed gateway
//! - An in-memory gateway for tests

pub mod clickhouse;
pub mod gateway;
pub mod memory;

pub use clickhouse::{ClickHouseClient, ClickHouseConfig, ClickHouseGateway};
pub use gateway::{validate_identifier, watermark_of, CollectionGateway, Record, StoreError};
pub use memory::MemoryGateway;
