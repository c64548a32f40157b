//! The persistence contract. The crate does not assume any specific backend; it requires only
//! durable atomic writes and crash-safe reads, surfaced through [`ChannelStore`].
//!
//! Two durability rules defeat every recovery hazard and MUST be honored by the driver:
//!
//! 1. Before an outgoing `commitment_signed` is handed to the transport, the channel data
//!    (which at that point contains the signed next remote commitment with its per-commitment
//!    point and index) must have been written via [`ChannelStore::put_channel`]. After a crash
//!    we can then answer a `channel_reestablish` proving we signed it.
//! 2. Before an outgoing `revoke_and_ack` is handed to the transport, the channel data (which
//!    at that point contains the new local commitment and the revealed per-commitment secret in
//!    the revocation store) must have been written, atomically replacing the previous state.
//!
//! Additionally, for HTLCs we intend to fulfill, the preimage must be stored durably (it is part
//! of the channel data once the fulfill command is applied) *before* the corresponding fulfill is
//! acknowledged upstream, or a crash between the two steps can lose funds.
//!
//! Writes must be serialized per channel id; writes for different channel ids may proceed
//! concurrently under serializable isolation. In multi-process deployments a single-writer lease
//! (expiry + instance id) should guard the store; a persistence failure is fatal to the process,
//! not the channel, so that a healthy replica can take the lease.

use ln::PaymentPreimage;
use util::ser::{Writeable, Writer, Readable};
use ln::msgs::DecodeError;

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

/// An upstream settlement command queued for relay, replayed after restart so a settled
/// downstream HTLC always reaches its upstream channel.
#[derive(Clone, PartialEq)]
pub enum RelayAction {
	/// Fulfill the upstream HTLC with the given preimage.
	Fulfill(PaymentPreimage),
	/// Fail the upstream HTLC with the given (already onion-wrapped) reason.
	Fail(Vec<u8>),
	/// Fail the upstream HTLC as malformed.
	FailMalformed([u8; 32], u16),
}

impl Writeable for RelayAction {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		match self {
			&RelayAction::Fulfill(ref preimage) => {
				0u8.write(writer)?;
				preimage.0.write(writer)?;
			},
			&RelayAction::Fail(ref reason) => {
				1u8.write(writer)?;
				reason.write(writer)?;
			},
			&RelayAction::FailMalformed(ref sha256_of_onion, ref failure_code) => {
				2u8.write(writer)?;
				sha256_of_onion.write(writer)?;
				failure_code.write(writer)?;
			},
		}
		Ok(())
	}
}

impl<R: Read> Readable<R> for RelayAction {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable<R>>::read(reader)? {
			0 => RelayAction::Fulfill(PaymentPreimage(Readable::read(reader)?)),
			1 => RelayAction::Fail(Readable::read(reader)?),
			2 => RelayAction::FailMalformed(Readable::read(reader)?, Readable::read(reader)?),
			_ => return Err(DecodeError::InvalidValue),
		})
	}
}

/// A pending upstream relay entry: which HTLC on the given (upstream) channel to settle, and how.
#[derive(Clone)]
pub struct PendingRelay {
	/// The upstream HTLC id the action applies to.
	pub htlc_id: u64,
	/// What to do with it.
	pub action: RelayAction,
}

impl_writeable!(PendingRelay, { htlc_id, action });

/// The storage operations the channel driver requires. `put_channel` (with any side effects the
/// driver bundles into the same write) must be atomic.
pub trait ChannelStore: Send + Sync {
	/// Reads the serialized channel data for the given channel id, if any.
	fn get_channel(&self, channel_id: &[u8; 32]) -> Option<Vec<u8>>;
	/// Durably and atomically replaces the serialized channel data for the given channel id.
	fn put_channel(&self, channel_id: &[u8; 32], data: Vec<u8>);
	/// Queues an upstream settlement for the given (upstream) channel id.
	fn add_pending_relay(&self, channel_id: &[u8; 32], cmd: PendingRelay);
	/// Drops the queued settlement for the given HTLC once it is irrevocably relayed.
	fn remove_pending_relay(&self, channel_id: &[u8; 32], htlc_id: u64);
	/// Lists queued settlements for the given channel id, in insertion order.
	fn list_pending_relay(&self, channel_id: &[u8; 32]) -> Vec<PendingRelay>;
}

/// An in-memory ChannelStore. Useful for tests; obviously not durable.
pub struct MemoryChannelStore {
	channels: Mutex<HashMap<[u8; 32], Vec<u8>>>,
	pending_relay: Mutex<HashMap<[u8; 32], Vec<PendingRelay>>>,
}

impl MemoryChannelStore {
	/// Creates an empty store.
	pub fn new() -> Self {
		MemoryChannelStore {
			channels: Mutex::new(HashMap::new()),
			pending_relay: Mutex::new(HashMap::new()),
		}
	}
}

impl ChannelStore for MemoryChannelStore {
	fn get_channel(&self, channel_id: &[u8; 32]) -> Option<Vec<u8>> {
		self.channels.lock().unwrap().get(channel_id).cloned()
	}
	fn put_channel(&self, channel_id: &[u8; 32], data: Vec<u8>) {
		self.channels.lock().unwrap().insert(*channel_id, data);
	}
	fn add_pending_relay(&self, channel_id: &[u8; 32], cmd: PendingRelay) {
		self.pending_relay.lock().unwrap().entry(*channel_id).or_insert_with(Vec::new).push(cmd);
	}
	fn remove_pending_relay(&self, channel_id: &[u8; 32], htlc_id: u64) {
		if let Some(cmds) = self.pending_relay.lock().unwrap().get_mut(channel_id) {
			cmds.retain(|cmd| cmd.htlc_id != htlc_id);
		}
	}
	fn list_pending_relay(&self, channel_id: &[u8; 32]) -> Vec<PendingRelay> {
		self.pending_relay.lock().unwrap().get(channel_id).cloned().unwrap_or_else(Vec::new)
	}
}
