//! Sled-backed durable implementation of the core's `ChainStore` trait.

pub mod sled_store;

pub use sled_store::SledStore;
