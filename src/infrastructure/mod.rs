//! Adapters behind the domain ports: storage, providers, clocks and notifiers.

pub mod clock;
pub mod gateways;
pub mod in_memory;
pub mod notifier;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
