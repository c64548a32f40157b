//! Structs and traits which allow the channel engine to interact with the blockchain via an
//! external chain oracle and wallet.

pub mod chaininterface;
pub mod transaction;
