#![crate_name = "ln_channel"]

//! A payment-channel engine for a bidirectional off-chain payment protocol, in
//! library form. The crate owns the hard part of a node - the per-channel
//! commitment state machine - and nothing else: there is no built-in
//! networking, no wallet, no storage backend and no runtime. The user (you)
//! drives each channel with peer messages, local commands and chain events,
//! and performs the effects (outgoing messages, transaction broadcasts, watch
//! registrations, disk writes) the channel hands back. This makes it a good
//! candidate for tight integration into an existing node or wallet process.

#![cfg_attr(not(feature = "fuzztarget"), deny(missing_docs))]
#![forbid(unsafe_code)]

extern crate bitcoin;
extern crate bitcoin_hashes;
extern crate secp256k1;
#[cfg(test)] extern crate rand;
#[cfg(test)] extern crate hex;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
