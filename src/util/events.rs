//! Events are returned from various bits in the library which indicate something happened that
//! external subscribers (a GUI, telemetry, the relayer) may care about.
//!
//! Because we don't have a built-in runtime, it's up to the client to drain events at a time of
//! its choosing via [`EventsProvider::get_and_clear_pending_events`]. The core never waits on a
//! subscriber.

use ln::{PaymentHash, PaymentPreimage};
use chain::transaction::OutPoint;

/// The reason a channel reached the terminal CLOSED state, included in
/// [`Event::ChannelClosed`].
#[derive(Clone, Debug, PartialEq)]
pub enum ClosureReason {
	/// We and our peer negotiated a mutual close which has confirmed.
	CooperativeClosure,
	/// We force-closed, either by local command or in reaction to a protocol
	/// violation. The message is the diagnostic we sent in our `error`.
	HolderForceClosed {
		/// The diagnostic carried in the outgoing error message.
		message: String,
	},
	/// The counterparty published a commitment transaction (current or revoked).
	CounterpartyForceClosed,
	/// The counterparty sent us an `error` message.
	CounterpartyError {
		/// Their diagnostic, lossily sanitized for printing.
		message: String,
	},
	/// The funding transaction failed to confirm within the grace period, or
	/// the open handshake stalled and timed out.
	FundingTimedOut,
	/// We detected we lost channel state and asked the peer to publish their
	/// commitment; the channel closed on their current state.
	DataLossRecovery,
}

/// An Event which external subscribers may want to act on. Subscribers are external; the core
/// never blocks on them and events carry owned data only.
pub enum Event {
	/// A channel object has been created (either side of the open handshake).
	ChannelCreated {
		/// The channel's current (possibly temporary) id.
		channel_id: [u8; 32],
		/// Whether we initiated the open.
		is_funder: bool,
	},
	/// A channel was reloaded from persisted data.
	ChannelRestored {
		/// The channel id.
		channel_id: [u8; 32],
		/// The state name the channel came back in.
		state_name: &'static str,
	},
	/// The funding transaction reached the configured depth and the channel
	/// was assigned its short channel id.
	ShortChannelIdAssigned {
		/// The channel id.
		channel_id: [u8; 32],
		/// (block_height << 40) | (tx_index << 16) | output_index.
		short_channel_id: u64,
	},
	/// The channel moved between top-level states.
	StateChanged {
		/// The channel id.
		channel_id: [u8; 32],
		/// State we left.
		previous_state: &'static str,
		/// State we entered.
		new_state: &'static str,
	},
	/// We sent a commitment_signed to the peer.
	SignatureSent {
		/// The channel id.
		channel_id: [u8; 32],
		/// The commitment number (counting up from 0) we signed.
		commitment_number: u64,
	},
	/// We received and verified a commitment_signed from the peer.
	SignatureReceived {
		/// The channel id.
		channel_id: [u8; 32],
		/// The commitment number (counting up from 0) they signed.
		commitment_number: u64,
	},
	/// The channel became usable for payments (or its parameters changed).
	LocalChannelUpdate {
		/// The channel id.
		channel_id: [u8; 32],
		/// The short channel id, if assigned.
		short_channel_id: Option<u64>,
	},
	/// The channel is no longer usable for new payments.
	LocalChannelDown {
		/// The channel id.
		channel_id: [u8; 32],
	},
	/// The balance available to send changed (HTLC settled, fee changed, ...).
	AvailableBalanceChanged {
		/// The channel id.
		channel_id: [u8; 32],
		/// Current available-for-send per the availability formula, in msat.
		available_for_send_msat: u64,
	},
	/// The channel's persisted root was handed to the store.
	ChannelPersisted {
		/// The channel id.
		channel_id: [u8; 32],
	},
	/// Our own commitment transaction confirmed on chain.
	LocalCommitConfirmed {
		/// The channel id.
		channel_id: [u8; 32],
		/// Confirmation height.
		height: u32,
	},
	/// All relevant outputs are spent by sufficiently confirmed transactions;
	/// the channel is gone.
	ChannelClosed {
		/// The channel id.
		channel_id: [u8; 32],
		/// Why it closed.
		reason: ClosureReason,
		/// The funding outpoint, for cross-referencing.
		funding_txo: Option<OutPoint>,
	},
	/// An HTLC we offered was fulfilled; the preimage is our receipt.
	PaymentSent {
		/// The preimage revealed by the fulfiller.
		payment_preimage: PaymentPreimage,
	},
	/// An HTLC paying us was irrevocably committed; dig out the preimage and
	/// fulfill (or fail) it.
	PaymentReceived {
		/// The hash the preimage must match.
		payment_hash: PaymentHash,
		/// The value, in millisatoshi.
		amount_msat: u64,
	},
	/// An HTLC we relayed settled in both directions.
	PaymentRelayed {
		/// The hash of the relayed payment.
		payment_hash: PaymentHash,
		/// Incoming amount in millisatoshi.
		amount_in_msat: u64,
		/// Outgoing amount in millisatoshi (difference is our fee).
		amount_out_msat: u64,
	},
	/// An HTLC we offered failed backwards.
	PaymentFailed {
		/// The hash of the failed payment.
		payment_hash: PaymentHash,
		/// True if the final recipient rejected it (retrying the same route
		/// will not help).
		rejected_by_dest: bool,
	},
}

/// A trait indicating an object may generate events
pub trait EventsProvider {
	/// Gets the list of pending events which were generated by previous actions, clearing the list
	/// in the process.
	fn get_and_clear_pending_events(&mut self) -> Vec<Event>;
}
