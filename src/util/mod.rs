//! Module with utilities for the rest of the crate: logging, serialization,
//! configuration, the outbound event bus and the persistence contract.

#[macro_use]
pub(crate) mod macro_logger;

pub mod logger;
#[macro_use]
pub mod ser;
pub mod errors;
pub mod events;
pub mod config;
pub mod persist;

pub(crate) mod byte_utils;
pub(crate) mod transaction_utils;

#[cfg(test)]
pub(crate) mod test_utils;
