//! Traits and types which let the channel engine talk to an external chain oracle.
//!
//! The engine never blocks on the chain: it emits [`PublishRequest`]s and [`WatchRequest`]s for
//! the driver to perform, and consumes [`ChainEvent`]s the driver routes back. Includes traits
//! for transaction broadcasting and feerate information requests.

use bitcoin::blockdata::transaction::Transaction;
use bitcoin_hashes::sha256d::Hash as Sha256dHash;

use chain::transaction::OutPoint;

/// How a transaction handed to the broadcaster should be pushed into a block.
#[derive(Clone, PartialEq, Debug)]
pub enum PublishStrategy {
	/// Broadcast as-is; the fee is already adequate.
	JustPublish,
	/// The transaction pays (nearly) no fee itself: attach a wallet input spending the given
	/// anchor output and CPFP it in. Only meaningful for anchor-outputs channels.
	CpfpAnchor {
		/// The 330-sat anchor output to spend.
		anchor_outpoint: OutPoint,
		/// Weight of the parent commitment transaction, for package feerate computation.
		parent_weight: u64,
	},
}

/// A request that the driver broadcast the given transaction as soon as possible.
#[derive(Clone)]
pub struct PublishRequest {
	/// The fully-signed transaction to publish.
	pub tx: Transaction,
	/// How to get it confirmed.
	pub strategy: PublishStrategy,
}

/// Identifies which part of the channel a watch event is relevant to, so the driver can route
/// the resulting [`ChainEvent`] back without the engine re-deriving it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum WatchTag {
	/// The 2-of-2 funding output.
	FundingSpent,
	/// The funding transaction itself reaching depth.
	FundingConfirmed,
	/// A commitment transaction (ours or theirs) reaching depth.
	CommitConfirmed,
	/// A mutual close transaction reaching depth.
	MutualCloseConfirmed,
	/// One of our claim/penalty transactions reaching depth.
	ClaimConfirmed,
	/// An output of a published commitment being spent (HTLC outputs, their main output, ...).
	CommitOutputSpent,
	/// The delayed output of a second-stage HTLC transaction being spent.
	HtlcOutputSpent,
}

/// A request that the driver start watching the chain on our behalf.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchRequest {
	/// Tell us when the given transaction has the given number of confirmations.
	Confirmed {
		/// Transaction to watch.
		txid: Sha256dHash,
		/// Depth at which to fire.
		min_depth: u32,
		/// Routing tag echoed back in the event.
		tag: WatchTag,
	},
	/// Tell us when anyone spends the given outpoint.
	Spent {
		/// Outpoint to watch.
		outpoint: OutPoint,
		/// Routing tag echoed back in the event.
		tag: WatchTag,
	},
}

/// A chain observation routed to the channel by the driver.
pub enum ChainEvent {
	/// A new block was connected at the given height.
	BlockConnected {
		/// The new chain tip height.
		height: u32,
	},
	/// A previously-watched transaction reached its requested depth.
	Confirmed {
		/// The confirmed transaction.
		tx: Transaction,
		/// The height of the block containing it.
		block_height: u32,
		/// Its index within that block.
		tx_index: u32,
		/// The tag given when the watch was registered.
		tag: WatchTag,
	},
	/// A previously-watched outpoint was spent.
	Spent {
		/// The outpoint which was spent.
		outpoint: OutPoint,
		/// The transaction which spent it.
		spending_tx: Transaction,
		/// The tag given when the watch was registered.
		tag: WatchTag,
	},
}

/// An interface to send a transaction to the Bitcoin network.
pub trait BroadcasterInterface: Sync + Send {
	/// Sends a transaction out to (hopefully) be mined, honoring the given strategy.
	fn broadcast_transaction(&self, tx: &Transaction, strategy: PublishStrategy);
}

/// A minimal pull interface to the oracle for transaction lookups the engine occasionally needs
/// (eg re-checking a commitment transaction it was told about before a restart).
pub trait TxFetchInterface: Sync + Send {
	/// Gets the transaction with the given txid together with its confirmation height, if it is
	/// known to the oracle and confirmed.
	fn get_tx_with_meta(&self, txid: &Sha256dHash) -> Option<(Transaction, u32)>;
}

/// An enum that represents the speed at which we want a transaction to confirm used for feerate
/// estimation.
#[derive(Clone, Copy, PartialEq)]
pub enum ConfirmationTarget {
	/// We are happy with this transaction confirming slowly when feerate drops some.
	Background,
	/// We'd like this transaction to confirm without major delay, but 12-18 blocks is fine.
	Normal,
	/// We'd like this transaction to confirm in the next few blocks.
	HighPriority,
}

/// A trait which should be implemented to provide feerate information on a number of time
/// horizons.
///
/// Note that all of the functions implemented here *must* be reentrant-safe (obviously - they're
/// called from inside the library in response to chain events, P2P events, or timer events).
pub trait FeeEstimator: Sync + Send {
	/// Gets estimated satoshis of fee required per 1000 Weight-Units.
	///
	/// Must be no smaller than 253 (ie 1 satoshi-per-byte rounded up to ensure later round-downs
	/// don't put us below 1 satoshi-per-byte).
	fn get_est_sat_per_1000_weight(&self, confirmation_target: ConfirmationTarget) -> u64;
}

/// Minimum relay fee as required by bitcoin network mempool policy, expressed in sat/kw.
pub const MIN_RELAY_FEE_SAT_PER_1000_WEIGHT: u64 = 253;
