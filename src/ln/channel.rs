//! The per-channel state machine. One [`Channel`] owns all state for one channel and is driven
//! by exactly three kinds of input: peer messages, local commands, and chain events. Handlers
//! mutate the channel and return the wire messages to send; transactions to publish, watches to
//! arm and domain events accumulate on the channel and are drained by the driver after every
//! input. Within a channel processing is strictly serial; across channels there is no shared
//! state beyond configuration and the external collaborators.

use bitcoin::blockdata::script::{Script, Builder};
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::transaction::Transaction;

use bitcoin_hashes::Hash;
use bitcoin_hashes::hash160::Hash as Hash160;
use bitcoin_hashes::sha256d::Hash as Sha256dHash;

use secp256k1::key::PublicKey;
use secp256k1::{Secp256k1, Signature};
use secp256k1;

use ln::{PaymentHash, PaymentPreimage};
use ln::chan_utils;
use ln::chan_utils::{ChannelKeys, CommitmentFormat, CommitmentSpec, HtlcDirection, RevocationStore};
use ln::commitments::{per_commitment_point, secret_index, CmdAddHtlc, Commitments, HtlcOrigin,
	HtlcSettlement, LocalChanges, LocalCommit, LocalParams, NextRemoteCommitInfo, RemoteChanges,
	RemoteCommit, RemoteParams, RevocationOutcome};
use ln::msgs;
use ln::msgs::{DecodeError, Features, OptionalField, UpdateMessage};
use ln::onchain;
use ln::onchain::{ClosingState, FundingSpendClass, OnchainSettlement};
use chain::chaininterface::{FeeEstimator, ConfirmationTarget, PublishRequest, WatchRequest, WatchTag};
use chain::transaction::OutPoint;
use util::config::{ChannelConfig, UserConfig};
use util::errors::CommandError;
use util::events::{ClosureReason, Event, EventsProvider};
use util::logger::Logger;
use util::ser::{Readable, Writeable, Writer};

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::cmp;

/// Maximum funding without the wumbo feature, fixed by the protocol (2^24 satoshi).
pub const MAX_FUNDING_SATOSHIS_NO_WUMBO: u64 = 1 << 24;
/// Protocol cap on concurrently accepted HTLCs per direction.
pub const MAX_ACCEPTED_HTLCS_LIMIT: u16 = 483;
/// Ticks of TickChannelOpenTimeout a pre-funding handshake may survive.
pub const CHANNEL_OPEN_TIMEOUT_TICKS: u8 = 2;

/// Used to return a simple error back to the driver. The Close variant expects the driver to
/// send an `error` message carrying the diagnostic and feed the resulting force-close actions
/// back through [`Channel::force_close`].
pub enum ChannelError {
	/// The input was meaningless or redundant in the current state; drop it and carry on.
	Ignore(&'static str),
	/// The peer violated the protocol; the channel must be force-closed.
	Close(&'static str),
}

impl ::std::fmt::Debug for ChannelError {
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
		match self {
			&ChannelError::Ignore(e) => write!(f, "Ignore : {}", e),
			&ChannelError::Close(e) => write!(f, "Close : {}", e),
		}
	}
}

/// The top-level states of the machine. The OFFLINE and SYNCING overlays of the protocol are
/// orthogonal to these and live in [`Channel::peer_connected`] / awaiting_reestablish flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelState {
	/// Funder-side: created, open_channel not yet handed out.
	WaitForInit,
	/// Fundee-side: waiting for the peer's open_channel.
	WaitForOpenChannel,
	/// Funder-side: open_channel sent, waiting for accept_channel.
	WaitForAcceptChannel,
	/// Funder-side: waiting for the wallet to craft the funding transaction.
	WaitForFundingInternal,
	/// Fundee-side: waiting for funding_created.
	WaitForFundingCreated,
	/// Funder-side: funding_created sent, waiting for funding_signed.
	WaitForFundingSigned,
	/// Waiting for the funding transaction to reach the negotiated depth.
	WaitForFundingConfirmed,
	/// Funding deep enough; funding_locked sent, theirs not yet seen (or vice versa).
	WaitForFundingLocked,
	/// Operational.
	Normal,
	/// Both sides exchanged shutdown but HTLCs are still pending settlement.
	Shutdown,
	/// Shutdown exchanged, no HTLCs: negotiating the closing fee.
	Negotiating,
	/// Some commitment (any branch) is on chain; claims are in flight.
	Closing,
	/// Every relevant output is irrevocably settled. Terminal.
	Closed,
	/// We proved to ourselves we lost state; waiting for the peer to unilaterally close so we
	/// can claim our main output.
	WaitForRemotePublishFutureCommitment,
}

impl ChannelState {
	/// The state's name, as surfaced in events.
	pub fn name(&self) -> &'static str {
		match self {
			&ChannelState::WaitForInit => "WAIT_FOR_INIT",
			&ChannelState::WaitForOpenChannel => "WAIT_FOR_OPEN_CHANNEL",
			&ChannelState::WaitForAcceptChannel => "WAIT_FOR_ACCEPT_CHANNEL",
			&ChannelState::WaitForFundingInternal => "WAIT_FOR_FUNDING_INTERNAL",
			&ChannelState::WaitForFundingCreated => "WAIT_FOR_FUNDING_CREATED",
			&ChannelState::WaitForFundingSigned => "WAIT_FOR_FUNDING_SIGNED",
			&ChannelState::WaitForFundingConfirmed => "WAIT_FOR_FUNDING_CONFIRMED",
			&ChannelState::WaitForFundingLocked => "WAIT_FOR_FUNDING_LOCKED",
			&ChannelState::Normal => "NORMAL",
			&ChannelState::Shutdown => "SHUTDOWN",
			&ChannelState::Negotiating => "NEGOTIATING",
			&ChannelState::Closing => "CLOSING",
			&ChannelState::Closed => "CLOSED",
			&ChannelState::WaitForRemotePublishFutureCommitment => "WAIT_FOR_REMOTE_PUBLISH_FUTURE_COMMITMENT",
		}
	}

	fn write_to<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		(*self as u8).write(writer)
	}

	fn read_from<R: Read>(reader: &mut R) -> Result<ChannelState, DecodeError> {
		Ok(match <u8 as Readable<R>>::read(reader)? {
			0 => ChannelState::WaitForInit,
			1 => ChannelState::WaitForOpenChannel,
			2 => ChannelState::WaitForAcceptChannel,
			3 => ChannelState::WaitForFundingInternal,
			4 => ChannelState::WaitForFundingCreated,
			5 => ChannelState::WaitForFundingSigned,
			6 => ChannelState::WaitForFundingConfirmed,
			7 => ChannelState::WaitForFundingLocked,
			8 => ChannelState::Normal,
			9 => ChannelState::Shutdown,
			10 => ChannelState::Negotiating,
			11 => ChannelState::Closing,
			12 => ChannelState::Closed,
			13 => ChannelState::WaitForRemotePublishFutureCommitment,
			_ => return Err(DecodeError::InvalidValue),
		})
	}
}

/// When retransmitting after a reconnect, whether the lost revoke_and_ack predates the lost
/// commitment_signed or the other way around.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RAACommitmentOrder {
	/// Send the commitment_signed (and its updates) first.
	CommitmentFirst,
	/// Send the revoke_and_ack first.
	RevokeAndACKFirst,
}

/// Everything a channel_reestablish handler may ask us to put back on the wire.
pub struct ReestablishResponses {
	/// funding_locked to re-send (it carries no ack, so a lost one is simply repeated).
	pub funding_locked: Option<msgs::FundingLocked>,
	/// The update messages of our un-acked signed batch, to replay before the commitment.
	pub updates_to_resend: Vec<UpdateMessage>,
	/// The lost commitment_signed, if the peer never received it.
	pub commitment_signed: Option<msgs::CommitmentSigned>,
	/// The lost revoke_and_ack, if the peer never received it.
	pub revocation: Option<msgs::RevokeAndACK>,
	/// Which of the two to send first.
	pub order: RAACommitmentOrder,
	/// Our shutdown, re-sent because shutdown is negotiated from scratch after reconnect.
	pub shutdown: Option<msgs::Shutdown>,
}

/// An HTLC outcome the driver must replay on the upstream channel (or report to the payer).
pub struct UpstreamSettlement {
	/// Where the HTLC came from.
	pub origin: HtlcOrigin,
	/// The payment hash.
	pub payment_hash: PaymentHash,
	/// What happened to it.
	pub settlement: HtlcSettlement,
}

// Fundee-side grace parameters for a funding transaction that never confirms.
const FUNDEE_FUNDING_GRACE_BLOCKS_DEFAULT: u32 = 2016;

/// A payment channel's complete state machine. See the module docs for the driving contract.
pub struct Channel {
	config: ChannelConfig,
	state: ChannelState,
	/// False while the OFFLINE overlay applies.
	peer_connected: bool,
	/// True between reconnection and a valid channel_reestablish from the peer (SYNCING).
	awaiting_reestablish: bool,

	channel_id: [u8; 32],
	is_funder: bool,
	format: CommitmentFormat,
	static_remote_key: bool,
	secp_ctx: Secp256k1<secp256k1::All>,

	funding_satoshis: u64,
	push_msat: u64,
	feerate_per_kw: u64,
	minimum_depth: u32,

	local_params: LocalParams,
	// Populated once accept_channel/open_channel has been processed.
	remote_params: Option<RemoteParams>,
	remote_first_per_commitment_point: Option<PublicKey>,
	funding_txo: Option<OutPoint>,
	// The funder stashes its signed initial remote commitment between funding_created and
	// funding_signed.
	initial_remote_commit: Option<RemoteCommit>,
	// Their funding_locked may arrive while we still wait for our own confirmation.
	pending_remote_funding_locked: Option<PublicKey>,

	commitments: Option<Commitments>,
	short_channel_id: Option<u64>,

	// Cooperative close bookkeeping.
	local_shutdown_script: Option<Script>,
	remote_shutdown_script: Option<Script>,
	local_shutdown_sent: bool,
	remote_shutdown_received: bool,
	last_sent_closing_fee: Option<(u64, u64)>, // (feerate, fee)
	closing_rounds: u8,
	mutual_close_proposed: Vec<Sha256dHash>,

	closing: Option<ClosingState>,
	closure_reason: Option<ClosureReason>,
	// The peer's current per-commitment point, proved during a reestablish that showed we lost
	// data; lets us claim our main output from their future commitment.
	future_remote_point: Option<PublicKey>,

	// Where claim transactions pay out; owned by the user's wallet.
	destination_script: Script,
	// Fallback scriptpubkey for the cooperative close.
	shutdown_pubkey: PublicKey,

	open_timeout_ticks: u8,
	funding_wait_blocks: u32,

	pending_events: Vec<Event>,
	pending_publishes: Vec<PublishRequest>,
	pending_watches: Vec<WatchRequest>,

	logger: Arc<Logger>,
}

macro_rules! secp_check {
	($res: expr, $err: expr) => {
		match $res {
			Ok(thing) => thing,
			Err(_) => return Err(ChannelError::Close($err)),
		}
	};
}

impl Channel {
	// Convert constants + channel value to limits:
	fn get_our_max_htlc_value_in_flight_msat(channel_value_satoshis: u64) -> u64 {
		channel_value_satoshis * 1000 / 10
	}

	/// Returns a minimum channel reserve value the other side needs to maintain: 1% of the
	/// channel value, floored at 1000 sat.
	pub(crate) fn get_our_channel_reserve_satoshis(channel_value_satoshis: u64) -> u64 {
		cmp::min(channel_value_satoshis, cmp::max(channel_value_satoshis / 100, 1000))
	}

	fn our_max_accepted_htlcs() -> u16 {
		50
	}

	fn build_local_params(config: &UserConfig, keys: ChannelKeys, is_funder: bool, channel_value_satoshis: u64, upfront_shutdown: Option<Script>) -> LocalParams {
		LocalParams {
			is_funder,
			dust_limit_satoshis: config.own_channel_config.our_dust_limit_satoshis,
			max_htlc_value_in_flight_msat: Channel::get_our_max_htlc_value_in_flight_msat(channel_value_satoshis),
			channel_reserve_satoshis: 0, // filled from the peer's open/accept
			htlc_minimum_msat: config.own_channel_config.our_htlc_minimum_msat,
			to_self_delay: config.own_channel_config.our_to_self_delay,
			max_accepted_htlcs: Channel::our_max_accepted_htlcs(),
			keys,
			shutdown_script: upfront_shutdown,
		}
	}

	fn default_shutdown_script(&self) -> Script {
		Builder::new().push_opcode(opcodes::all::OP_PUSHBYTES_0)
		              .push_slice(&Hash160::hash(&self.shutdown_pubkey.serialize())[..])
		              .into_script()
	}

	// Constructors:

	/// Creates a new outbound (funder-side) channel. `temporary_channel_id` must be unique until
	/// the funding outpoint replaces it.
	pub fn new_outbound(config: &UserConfig, keys: ChannelKeys, shutdown_pubkey: PublicKey, destination_script: Script,
			temporary_channel_id: [u8; 32], their_features: &Features, funding_satoshis: u64, push_msat: u64,
			feerate_per_kw: u64, format: CommitmentFormat, logger: Arc<Logger>) -> Result<Channel, CommandError> {
		if funding_satoshis >= MAX_FUNDING_SATOSHIS_NO_WUMBO && !their_features.supports_wumbo() {
			return Err(CommandError::ChannelUnavailable { err: "Funding above the legacy cap requires the wumbo feature" });
		}
		if push_msat > funding_satoshis * 1000 {
			return Err(CommandError::ChannelUnavailable { err: "push value > channel value" });
		}
		if format == CommitmentFormat::AnchorOutputs && !their_features.supports_anchor_outputs() {
			return Err(CommandError::ChannelUnavailable { err: "Peer does not support anchor outputs" });
		}

		let static_remote_key = their_features.supports_static_remote_key() || format == CommitmentFormat::AnchorOutputs;
		let secp_ctx = Secp256k1::new();
		let local_params = Channel::build_local_params(config, keys, true, funding_satoshis, None);

		let mut chan = Channel {
			config: config.channel_options.clone(),
			state: ChannelState::WaitForInit,
			peer_connected: true,
			awaiting_reestablish: false,
			channel_id: temporary_channel_id,
			is_funder: true,
			format,
			static_remote_key,
			secp_ctx,
			funding_satoshis,
			push_msat,
			feerate_per_kw,
			minimum_depth: config.own_channel_config.minimum_depth,
			local_params,
			remote_params: None,
			remote_first_per_commitment_point: None,
			funding_txo: None,
			initial_remote_commit: None,
			pending_remote_funding_locked: None,
			commitments: None,
			short_channel_id: None,
			local_shutdown_script: None,
			remote_shutdown_script: None,
			local_shutdown_sent: false,
			remote_shutdown_received: false,
			last_sent_closing_fee: None,
			closing_rounds: 0,
			mutual_close_proposed: Vec::new(),
			closing: None,
			closure_reason: None,
			future_remote_point: None,
			destination_script,
			shutdown_pubkey,
			open_timeout_ticks: 0,
			funding_wait_blocks: 0,
			pending_events: Vec::new(),
			pending_publishes: Vec::new(),
			pending_watches: Vec::new(),
			logger,
		};
		chan.pending_events.push(Event::ChannelCreated { channel_id: temporary_channel_id, is_funder: true });
		Ok(chan)
	}

	/// Creates a new inbound (fundee-side) channel from the peer's open_channel request.
	/// Assumes the chain_hash has already been checked by the driver, and that the driver drops
	/// (rather than re-processes) a duplicate open_channel carrying a temporary channel id it
	/// already tracks.
	pub fn new_inbound(config: &UserConfig, keys: ChannelKeys, shutdown_pubkey: PublicKey, destination_script: Script,
			msg: &msgs::OpenChannel, their_features: &Features, format: CommitmentFormat, logger: Arc<Logger>)
			-> Result<Channel, ChannelError> {
		// Check sanity of message fields:
		if msg.funding_satoshis >= MAX_FUNDING_SATOSHIS_NO_WUMBO && !their_features.supports_wumbo() {
			return Err(ChannelError::Close("funding value over the legacy cap without wumbo"));
		}
		if msg.funding_satoshis > config.peer_channel_config_limits.max_funding_satoshis {
			return Err(ChannelError::Close("funding satoshis is greater than the user specified limit"));
		}
		if msg.funding_satoshis < config.peer_channel_config_limits.min_funding_satoshis {
			return Err(ChannelError::Close("funding satoshis is less than the user specified limit"));
		}
		if msg.channel_reserve_satoshis > msg.funding_satoshis {
			return Err(ChannelError::Close("Bogus channel_reserve_satoshis"));
		}
		if msg.push_msat > (msg.funding_satoshis - msg.channel_reserve_satoshis) * 1000 {
			return Err(ChannelError::Close("push_msat larger than funding value"));
		}
		if msg.dust_limit_satoshis > msg.channel_reserve_satoshis {
			return Err(ChannelError::Close("Bogus; channel reserve is less than dust limit"));
		}
		if msg.htlc_minimum_msat >= (msg.funding_satoshis - msg.channel_reserve_satoshis) * 1000 {
			return Err(ChannelError::Close("Minimum htlc value is full channel value"));
		}
		if msg.to_self_delay > config.peer_channel_config_limits.their_to_self_delay {
			return Err(ChannelError::Close("They wanted our payments to be delayed by a needlessly long period"));
		}
		if msg.max_accepted_htlcs < 1 {
			return Err(ChannelError::Close("0 max_accepted_htlcs makes for a useless channel"));
		}
		if msg.max_accepted_htlcs > MAX_ACCEPTED_HTLCS_LIMIT {
			return Err(ChannelError::Close("max_accepted_htlcs > 483"));
		}
		if msg.htlc_minimum_msat > config.peer_channel_config_limits.max_htlc_minimum_msat {
			return Err(ChannelError::Close("htlc minimum msat is higher than the user specified limit"));
		}
		if msg.max_htlc_value_in_flight_msat < config.peer_channel_config_limits.min_max_htlc_value_in_flight_msat {
			return Err(ChannelError::Close("max htlc value in flight msat is less than the user specified limit"));
		}
		if msg.channel_reserve_satoshis > config.peer_channel_config_limits.max_channel_reserve_satoshis {
			return Err(ChannelError::Close("channel reserve satoshis is higher than the user specified limit"));
		}
		if msg.dust_limit_satoshis < config.peer_channel_config_limits.min_dust_limit_satoshis {
			return Err(ChannelError::Close("dust limit satoshis is less than the user specified limit"));
		}
		if msg.dust_limit_satoshis > config.peer_channel_config_limits.max_dust_limit_satoshis {
			return Err(ChannelError::Close("dust limit satoshis is greater than the user specified limit"));
		}

		let our_channel_reserve = Channel::get_our_channel_reserve_satoshis(msg.funding_satoshis);
		if our_channel_reserve < config.own_channel_config.our_dust_limit_satoshis {
			return Err(ChannelError::Close("Suitable channel reserve not found. aborting"));
		}
		if msg.channel_reserve_satoshis < config.own_channel_config.our_dust_limit_satoshis {
			return Err(ChannelError::Close("channel_reserve_satoshis too small"));
		}

		// Check the funder can pay the initial commitment fee.
		let funders_amount_msat = msg.funding_satoshis * 1000 - msg.push_msat;
		let initial_fee = chan_utils::commit_tx_fee(format, msg.feerate_per_kw as u64, 0) + format.anchors_cost_satoshis();
		if funders_amount_msat / 1000 < initial_fee + msg.channel_reserve_satoshis {
			return Err(ChannelError::Close("Insufficient funding amount for initial commitment"));
		}

		let remote_shutdown_script = if their_features.supports_upfront_shutdown_script() {
			match &msg.shutdown_scriptpubkey {
				&OptionalField::Present(ref script) => {
					if script.is_p2pkh() || script.is_p2sh() || script.is_v0_p2wsh() || script.is_v0_p2wpkh() {
						Some(script.clone())
					} else if script.len() == 0 {
						None
					} else {
						return Err(ChannelError::Close("Peer is signaling upfront_shutdown but has provided a non-accepted scriptpubkey format"));
					}
				},
				&OptionalField::Absent => {
					return Err(ChannelError::Close("Peer is signaling upfront_shutdown but we don't get any script. Use 0-length script to opt-out"));
				}
			}
		} else { None };

		let static_remote_key = their_features.supports_static_remote_key() || format == CommitmentFormat::AnchorOutputs;
		let secp_ctx = Secp256k1::new();
		let mut local_params = Channel::build_local_params(config, keys, false, msg.funding_satoshis, None);
		local_params.channel_reserve_satoshis = msg.channel_reserve_satoshis;

		let remote_params = RemoteParams {
			dust_limit_satoshis: msg.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: cmp::min(msg.max_htlc_value_in_flight_msat, msg.funding_satoshis * 1000),
			channel_reserve_satoshis: our_channel_reserve,
			htlc_minimum_msat: msg.htlc_minimum_msat,
			to_self_delay: msg.to_self_delay,
			max_accepted_htlcs: msg.max_accepted_htlcs,
			funding_pubkey: msg.funding_pubkey,
			revocation_basepoint: msg.revocation_basepoint,
			payment_basepoint: msg.payment_basepoint,
			delayed_payment_basepoint: msg.delayed_payment_basepoint,
			htlc_basepoint: msg.htlc_basepoint,
			shutdown_script: remote_shutdown_script,
		};

		let mut chan = Channel {
			config: config.channel_options.clone(),
			state: ChannelState::WaitForFundingCreated,
			peer_connected: true,
			awaiting_reestablish: false,
			channel_id: msg.temporary_channel_id,
			is_funder: false,
			format,
			static_remote_key,
			secp_ctx,
			funding_satoshis: msg.funding_satoshis,
			push_msat: msg.push_msat,
			feerate_per_kw: msg.feerate_per_kw as u64,
			minimum_depth: config.own_channel_config.minimum_depth,
			local_params,
			remote_params: Some(remote_params),
			remote_first_per_commitment_point: Some(msg.first_per_commitment_point),
			funding_txo: None,
			initial_remote_commit: None,
			pending_remote_funding_locked: None,
			commitments: None,
			short_channel_id: None,
			local_shutdown_script: None,
			remote_shutdown_script: None,
			local_shutdown_sent: false,
			remote_shutdown_received: false,
			last_sent_closing_fee: None,
			closing_rounds: 0,
			mutual_close_proposed: Vec::new(),
			closing: None,
			closure_reason: None,
			future_remote_point: None,
			destination_script,
			shutdown_pubkey,
			open_timeout_ticks: 0,
			funding_wait_blocks: 0,
			pending_events: Vec::new(),
			pending_publishes: Vec::new(),
			pending_watches: Vec::new(),
			logger,
		};
		chan.pending_events.push(Event::ChannelCreated { channel_id: msg.temporary_channel_id, is_funder: false });
		Ok(chan)
	}

	// ---- handshake messages ----

	/// The funder's open_channel. Panics if called twice or on an inbound channel.
	pub fn get_open_channel(&mut self, chain_hash: Sha256dHash) -> msgs::OpenChannel {
		if !self.is_funder {
			panic!("Tried to open a channel for an inbound channel?");
		}
		if self.state != ChannelState::WaitForInit {
			panic!("Cannot generate an open_channel after we've moved forward");
		}
		self.set_state(ChannelState::WaitForAcceptChannel);

		let first_per_commitment_point = per_commitment_point(&self.secp_ctx, &self.local_params.keys.commitment_seed, 0);
		let upfront = if self.config.commit_upfront_shutdown_pubkey {
			let script = self.default_shutdown_script();
			self.local_params.shutdown_script = Some(script.clone());
			OptionalField::Present(script)
		} else {
			OptionalField::Present(Builder::new().into_script())
		};
		msgs::OpenChannel {
			chain_hash,
			temporary_channel_id: self.channel_id,
			funding_satoshis: self.funding_satoshis,
			push_msat: self.push_msat,
			dust_limit_satoshis: self.local_params.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: self.local_params.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: Channel::get_our_channel_reserve_satoshis(self.funding_satoshis),
			htlc_minimum_msat: self.local_params.htlc_minimum_msat,
			feerate_per_kw: self.feerate_per_kw as u32,
			to_self_delay: self.local_params.to_self_delay,
			max_accepted_htlcs: self.local_params.max_accepted_htlcs,
			funding_pubkey: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.funding_key),
			revocation_basepoint: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.revocation_base_key),
			payment_basepoint: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.payment_base_key),
			delayed_payment_basepoint: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.delayed_payment_base_key),
			htlc_basepoint: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.htlc_base_key),
			first_per_commitment_point,
			channel_flags: if self.config.announced_channel { 1 } else { 0 },
			shutdown_scriptpubkey: upfront,
		}
	}

	/// The fundee's accept_channel. Panics on an outbound channel.
	pub fn get_accept_channel(&mut self) -> msgs::AcceptChannel {
		if self.is_funder {
			panic!("Tried to send accept_channel for an outbound channel?");
		}
		if self.state != ChannelState::WaitForFundingCreated {
			panic!("Tried to send accept_channel after channel had moved forward");
		}

		let first_per_commitment_point = per_commitment_point(&self.secp_ctx, &self.local_params.keys.commitment_seed, 0);
		let upfront = if self.config.commit_upfront_shutdown_pubkey {
			let script = self.default_shutdown_script();
			self.local_params.shutdown_script = Some(script.clone());
			OptionalField::Present(script)
		} else {
			OptionalField::Present(Builder::new().into_script())
		};
		msgs::AcceptChannel {
			temporary_channel_id: self.channel_id,
			dust_limit_satoshis: self.local_params.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: self.local_params.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: Channel::get_our_channel_reserve_satoshis(self.funding_satoshis),
			htlc_minimum_msat: self.local_params.htlc_minimum_msat,
			minimum_depth: self.minimum_depth,
			to_self_delay: self.local_params.to_self_delay,
			max_accepted_htlcs: self.local_params.max_accepted_htlcs,
			funding_pubkey: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.funding_key),
			revocation_basepoint: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.revocation_base_key),
			payment_basepoint: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.payment_base_key),
			delayed_payment_basepoint: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.delayed_payment_base_key),
			htlc_basepoint: PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.htlc_base_key),
			first_per_commitment_point,
			shutdown_scriptpubkey: upfront,
		}
	}

	/// Handles the fundee's accept_channel.
	pub fn accept_channel(&mut self, msg: &msgs::AcceptChannel, config: &UserConfig, their_features: &Features) -> Result<(), ChannelError> {
		if !self.is_funder {
			return Err(ChannelError::Close("Got an accept_channel message from an inbound peer"));
		}
		if self.state != ChannelState::WaitForAcceptChannel {
			return Err(ChannelError::Close("Got an accept_channel message at a strange time"));
		}
		if msg.channel_reserve_satoshis > self.funding_satoshis {
			return Err(ChannelError::Close("Bogus channel_reserve_satoshis"));
		}
		if msg.dust_limit_satoshis > msg.channel_reserve_satoshis {
			return Err(ChannelError::Close("Bogus channel_reserve and dust_limit"));
		}
		if msg.channel_reserve_satoshis < self.local_params.dust_limit_satoshis {
			return Err(ChannelError::Close("Peer never wants payout outputs?"));
		}
		if msg.htlc_minimum_msat >= (self.funding_satoshis - msg.channel_reserve_satoshis) * 1000 {
			return Err(ChannelError::Close("Minimum htlc value is full channel value"));
		}
		if msg.to_self_delay > config.peer_channel_config_limits.their_to_self_delay {
			return Err(ChannelError::Close("They wanted our payments to be delayed by a needlessly long period"));
		}
		if msg.max_accepted_htlcs < 1 {
			return Err(ChannelError::Close("0 max_accepted_htlcs makes for a useless channel"));
		}
		if msg.max_accepted_htlcs > MAX_ACCEPTED_HTLCS_LIMIT {
			return Err(ChannelError::Close("max_accepted_htlcs > 483"));
		}
		if msg.htlc_minimum_msat > config.peer_channel_config_limits.max_htlc_minimum_msat {
			return Err(ChannelError::Close("htlc minimum msat is higher than the user specified limit"));
		}
		if msg.max_htlc_value_in_flight_msat < config.peer_channel_config_limits.min_max_htlc_value_in_flight_msat {
			return Err(ChannelError::Close("max htlc value in flight msat is less than the user specified limit"));
		}
		if msg.channel_reserve_satoshis > config.peer_channel_config_limits.max_channel_reserve_satoshis {
			return Err(ChannelError::Close("channel reserve satoshis is higher than the user specified limit"));
		}
		if msg.dust_limit_satoshis < config.peer_channel_config_limits.min_dust_limit_satoshis {
			return Err(ChannelError::Close("dust limit satoshis is less than the user specified limit"));
		}
		if msg.dust_limit_satoshis > config.peer_channel_config_limits.max_dust_limit_satoshis {
			return Err(ChannelError::Close("dust limit satoshis is greater than the user specified limit"));
		}
		if msg.minimum_depth > config.peer_channel_config_limits.max_minimum_depth {
			return Err(ChannelError::Close("We consider the minimum depth to be unreasonably large"));
		}

		let remote_shutdown_script = if their_features.supports_upfront_shutdown_script() {
			match &msg.shutdown_scriptpubkey {
				&OptionalField::Present(ref script) => {
					if script.is_p2pkh() || script.is_p2sh() || script.is_v0_p2wsh() || script.is_v0_p2wpkh() {
						Some(script.clone())
					} else if script.len() == 0 {
						None
					} else {
						return Err(ChannelError::Close("Peer is signaling upfront_shutdown but has provided a non-accepted scriptpubkey format"));
					}
				},
				&OptionalField::Absent => {
					return Err(ChannelError::Close("Peer is signaling upfront_shutdown but we don't get any script. Use 0-length script to opt-out"));
				}
			}
		} else { None };

		self.local_params.channel_reserve_satoshis = msg.channel_reserve_satoshis;
		self.minimum_depth = msg.minimum_depth;
		self.remote_params = Some(RemoteParams {
			dust_limit_satoshis: msg.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: cmp::min(msg.max_htlc_value_in_flight_msat, self.funding_satoshis * 1000),
			channel_reserve_satoshis: Channel::get_our_channel_reserve_satoshis(self.funding_satoshis),
			htlc_minimum_msat: msg.htlc_minimum_msat,
			to_self_delay: msg.to_self_delay,
			max_accepted_htlcs: msg.max_accepted_htlcs,
			funding_pubkey: msg.funding_pubkey,
			revocation_basepoint: msg.revocation_basepoint,
			payment_basepoint: msg.payment_basepoint,
			delayed_payment_basepoint: msg.delayed_payment_basepoint,
			htlc_basepoint: msg.htlc_basepoint,
			shutdown_script: remote_shutdown_script,
		});
		self.remote_first_per_commitment_point = Some(msg.first_per_commitment_point);
		self.set_state(ChannelState::WaitForFundingInternal);
		Ok(())
	}

	fn obscure_factor(&self) -> u64 {
		let our_payment_basepoint = PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.payment_base_key);
		let their_payment_basepoint = &self.remote_params.as_ref().unwrap().payment_basepoint;
		if self.is_funder {
			chan_utils::commitment_number_obscure_factor(&our_payment_basepoint, their_payment_basepoint)
		} else {
			chan_utils::commitment_number_obscure_factor(their_payment_basepoint, &our_payment_basepoint)
		}
	}

	fn initial_local_spec(&self) -> CommitmentSpec {
		let (to_local_msat, to_remote_msat) = if self.is_funder {
			(self.funding_satoshis * 1000 - self.push_msat, self.push_msat)
		} else {
			(self.push_msat, self.funding_satoshis * 1000 - self.push_msat)
		};
		CommitmentSpec {
			htlcs: Vec::new(),
			feerate_per_kw: self.feerate_per_kw,
			to_local_msat,
			to_remote_msat,
		}
	}

	fn initial_remote_spec(&self) -> CommitmentSpec {
		let local = self.initial_local_spec();
		CommitmentSpec {
			htlcs: Vec::new(),
			feerate_per_kw: local.feerate_per_kw,
			to_local_msat: local.to_remote_msat,
			to_remote_msat: local.to_local_msat,
		}
	}

	/// Gets the redeemscript for the funding transaction output (ie the funding transaction
	/// output pays to get_funding_redeemscript().to_v0_p2wsh()).
	/// Panics if called before the open/accept exchange completes.
	pub fn get_funding_redeemscript(&self) -> Script {
		chan_utils::make_funding_redeemscript(
			&PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.funding_key),
			&self.remote_params.as_ref().expect("get_funding_redeemscript only allowed after accept_channel").funding_pubkey)
	}

	fn build_initial_remote_commit(&self) -> Result<(Transaction, RemoteCommit), ChannelError> {
		let remote_params = self.remote_params.as_ref().unwrap();
		let point = self.remote_first_per_commitment_point.as_ref().unwrap();
		let keys = secp_check!(chan_utils::TxCreationKeys::new(&self.secp_ctx, point,
			&remote_params.delayed_payment_basepoint, &remote_params.htlc_basepoint,
			&PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.revocation_base_key),
			&PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.payment_base_key),
			&PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.htlc_base_key),
			self.static_remote_key), "Remote tx keys generation got bogus keys");
		let spec = self.initial_remote_spec();
		let (tx, _) = chan_utils::build_commitment_tx(
			self.funding_txo.as_ref().unwrap(), &keys, &spec, self.format,
			0, self.obscure_factor(), remote_params.dust_limit_satoshis,
			!self.is_funder, self.local_params.to_self_delay,
			&remote_params.funding_pubkey,
			&PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.funding_key));
		let txid = tx.txid();
		Ok((tx, RemoteCommit {
			index: 0,
			spec,
			txid,
			remote_per_commitment_point: point.clone(),
		}))
	}

	fn build_initial_local_commit(&self) -> Result<(Transaction, CommitmentSpec), ChannelError> {
		let remote_params = self.remote_params.as_ref().unwrap();
		let point = per_commitment_point(&self.secp_ctx, &self.local_params.keys.commitment_seed, 0);
		let keys = secp_check!(chan_utils::TxCreationKeys::new(&self.secp_ctx, &point,
			&PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.delayed_payment_base_key),
			&PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.htlc_base_key),
			&remote_params.revocation_basepoint, &remote_params.payment_basepoint, &remote_params.htlc_basepoint,
			self.static_remote_key), "Local tx keys generation got bogus keys");
		let spec = self.initial_local_spec();
		let (tx, _) = chan_utils::build_commitment_tx(
			self.funding_txo.as_ref().unwrap(), &keys, &spec, self.format,
			0, self.obscure_factor(), self.local_params.dust_limit_satoshis,
			self.is_funder, remote_params.to_self_delay,
			&PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.keys.funding_key),
			&remote_params.funding_pubkey);
		Ok((tx, spec))
	}

	fn make_commitments(&self, local_commit: LocalCommit, remote_commit: RemoteCommit) -> Commitments {
		let mut remote_claimable_htlcs = HashMap::new();
		remote_claimable_htlcs.insert(remote_commit.txid, Vec::new());
		Commitments {
			channel_id: self.channel_id,
			format: self.format,
			static_remote_key: self.static_remote_key,
			local_params: self.local_params.clone(),
			remote_params: self.remote_params.clone().unwrap(),
			funding_txo: self.funding_txo.unwrap(),
			funding_amount_satoshis: self.funding_satoshis,
			obscure_factor: self.obscure_factor(),
			local_commit,
			remote_commit: remote_commit.clone(),
			local_changes: LocalChanges { proposed: Vec::new(), signed: Vec::new(), acked: Vec::new() },
			remote_changes: RemoteChanges { proposed: Vec::new(), acked: Vec::new(), signed: Vec::new() },
			local_next_htlc_id: 0,
			remote_next_htlc_id: 0,
			origins: HashMap::new(),
			remote_next_commit: NextRemoteCommitInfo::Revoked(remote_commit.remote_per_commitment_point),
			remote_claimable_htlcs,
			remote_per_commitment_secrets: RevocationStore::new(),
			payment_preimages: HashMap::new(),
		}
	}

	fn arm_funding_watches(&mut self) {
		let funding_txo = self.funding_txo.unwrap();
		self.pending_watches.push(WatchRequest::Spent { outpoint: funding_txo, tag: WatchTag::FundingSpent });
		self.pending_watches.push(WatchRequest::Confirmed { txid: funding_txo.txid, min_depth: self.minimum_depth, tag: WatchTag::FundingConfirmed });
	}

	/// The wallet produced the funding transaction's outpoint; sign the fundee's first
	/// commitment. Funder only. Do NOT broadcast the funding transaction before funding_signed
	/// verifies.
	pub fn funding_internal(&mut self, funding_txo: OutPoint) -> Result<msgs::FundingCreated, ChannelError> {
		if !self.is_funder {
			panic!("Tried to create outbound funding_created message on an inbound channel!");
		}
		if self.state != ChannelState::WaitForFundingInternal {
			panic!("Tried to get a funding_created message at a strange state");
		}
		self.funding_txo = Some(funding_txo);

		let (remote_commit_tx, remote_commit) = match self.build_initial_remote_commit() {
			Ok(res) => res,
			Err(e) => {
				self.funding_txo = None;
				return Err(e);
			}
		};
		let funding_redeemscript = self.get_funding_redeemscript();
		let sighash = chan_utils::sighash_all(&remote_commit_tx, 0, &funding_redeemscript, self.funding_satoshis);
		let our_signature = self.secp_ctx.sign(&sighash, &self.local_params.keys.funding_key);

		let temporary_channel_id = self.channel_id;
		self.channel_id = funding_txo.to_channel_id();
		self.initial_remote_commit = Some(remote_commit);
		self.set_state(ChannelState::WaitForFundingSigned);

		Ok(msgs::FundingCreated {
			temporary_channel_id,
			funding_txid: funding_txo.txid,
			funding_output_index: funding_txo.index,
			signature: our_signature,
		})
	}

	/// Handles funding_created (fundee side): verify their signature over our first commitment,
	/// sign theirs. The returned message must not be sent before this channel is persisted.
	pub fn funding_created(&mut self, msg: &msgs::FundingCreated) -> Result<msgs::FundingSigned, ChannelError> {
		if self.is_funder {
			return Err(ChannelError::Close("Received funding_created for an outbound channel?"));
		}
		if self.state != ChannelState::WaitForFundingCreated {
			return Err(ChannelError::Close("Received funding_created after we got the channel!"));
		}

		let funding_txo = OutPoint::new(msg.funding_txid, msg.funding_output_index);
		self.funding_txo = Some(funding_txo);

		let (local_commit_tx, local_spec) = match self.build_initial_local_commit() {
			Ok(res) => res,
			Err(e) => {
				self.funding_txo = None;
				return Err(e);
			}
		};
		let funding_redeemscript = self.get_funding_redeemscript();
		let local_sighash = chan_utils::sighash_all(&local_commit_tx, 0, &funding_redeemscript, self.funding_satoshis);
		secp_check!(self.secp_ctx.verify(&local_sighash, &msg.signature, &self.remote_params.as_ref().unwrap().funding_pubkey),
			"Invalid funding_created signature from peer");

		let (remote_commit_tx, remote_commit) = self.build_initial_remote_commit()?;
		let remote_sighash = chan_utils::sighash_all(&remote_commit_tx, 0, &funding_redeemscript, self.funding_satoshis);
		let our_signature = self.secp_ctx.sign(&remote_sighash, &self.local_params.keys.funding_key);

		self.channel_id = funding_txo.to_channel_id();
		let local_commit = LocalCommit {
			index: 0,
			spec: local_spec,
			commit_tx: local_commit_tx,
			remote_sig: msg.signature.clone(),
			htlcs_and_sigs: Vec::new(),
		};
		self.commitments = Some(self.make_commitments(local_commit, remote_commit));
		self.set_state(ChannelState::WaitForFundingConfirmed);
		self.arm_funding_watches();

		Ok(msgs::FundingSigned {
			channel_id: self.channel_id,
			signature: our_signature,
		})
	}

	/// Handles funding_signed (funder side). On success the funding transaction may (and
	/// should) be broadcast.
	pub fn funding_signed(&mut self, msg: &msgs::FundingSigned) -> Result<(), ChannelError> {
		if !self.is_funder {
			return Err(ChannelError::Close("Received funding_signed for an inbound channel?"));
		}
		if self.state != ChannelState::WaitForFundingSigned {
			return Err(ChannelError::Close("Received funding_signed in strange state!"));
		}

		let (local_commit_tx, local_spec) = self.build_initial_local_commit()?;
		let funding_redeemscript = self.get_funding_redeemscript();
		let local_sighash = chan_utils::sighash_all(&local_commit_tx, 0, &funding_redeemscript, self.funding_satoshis);
		secp_check!(self.secp_ctx.verify(&local_sighash, &msg.signature, &self.remote_params.as_ref().unwrap().funding_pubkey),
			"Invalid funding_signed signature from peer");

		let local_commit = LocalCommit {
			index: 0,
			spec: local_spec,
			commit_tx: local_commit_tx,
			remote_sig: msg.signature.clone(),
			htlcs_and_sigs: Vec::new(),
		};
		let remote_commit = self.initial_remote_commit.take().unwrap();
		self.commitments = Some(self.make_commitments(local_commit, remote_commit));
		self.set_state(ChannelState::WaitForFundingConfirmed);
		self.arm_funding_watches();
		Ok(())
	}

	/// The funding transaction reached the configured depth. Verifies the funding output is what
	/// both sides signed for and produces our funding_locked.
	pub fn funding_confirmed(&mut self, tx: &Transaction, height: u32, tx_index: u32) -> Result<Option<msgs::FundingLocked>, ChannelError> {
		match self.state {
			ChannelState::WaitForFundingConfirmed => {},
			// A replayed watch after restart; idempotent.
			ChannelState::WaitForFundingLocked | ChannelState::Normal => return Ok(None),
			_ => return Err(ChannelError::Ignore("Funding confirmation in a state that doesn't care")),
		}
		let funding_txo = self.funding_txo.unwrap();
		if tx.txid() != funding_txo.txid {
			return Err(ChannelError::Ignore("Confirmation of a transaction that isn't our funding"));
		}
		let txo_idx = funding_txo.index as usize;
		if txo_idx >= tx.output.len() || tx.output[txo_idx].script_pubkey != self.get_funding_redeemscript().to_v0_p2wsh() ||
				tx.output[txo_idx].value != self.funding_satoshis {
			self.set_state(ChannelState::Closed);
			self.closure_reason = Some(ClosureReason::FundingTimedOut);
			return Err(ChannelError::Close("funding tx had wrong script/value"));
		}

		let short_channel_id = ((height as u64) << (5 * 8)) |
		                       ((tx_index as u64) << (2 * 8)) |
		                       ((funding_txo.index as u64) << (0 * 8));
		self.short_channel_id = Some(short_channel_id);
		self.pending_events.push(Event::ShortChannelIdAssigned { channel_id: self.channel_id, short_channel_id });

		let funding_locked = msgs::FundingLocked {
			channel_id: self.channel_id,
			next_per_commitment_point: per_commitment_point(&self.secp_ctx, &self.local_params.keys.commitment_seed, 1),
		};
		if let Some(their_point) = self.pending_remote_funding_locked.take() {
			self.commitments.as_mut().unwrap().remote_next_commit = NextRemoteCommitInfo::Revoked(their_point);
			self.enter_normal();
		} else {
			self.set_state(ChannelState::WaitForFundingLocked);
		}
		Ok(Some(funding_locked))
	}

	fn enter_normal(&mut self) {
		self.set_state(ChannelState::Normal);
		let channel_id = self.channel_id;
		let short_channel_id = self.short_channel_id;
		self.pending_events.push(Event::LocalChannelUpdate { channel_id, short_channel_id });
		let available = self.commitments.as_ref().unwrap().available_balance_for_send_msat();
		self.pending_events.push(Event::AvailableBalanceChanged { channel_id, available_for_send_msat: available });
	}

	/// Handles the peer's funding_locked.
	pub fn funding_locked(&mut self, msg: &msgs::FundingLocked) -> Result<(), ChannelError> {
		if !self.peer_connected || self.awaiting_reestablish {
			return Err(ChannelError::Close("Peer sent funding_locked when we needed a channel_reestablish"));
		}
		match self.state {
			ChannelState::WaitForFundingConfirmed => {
				self.pending_remote_funding_locked = Some(msg.next_per_commitment_point);
				Ok(())
			},
			ChannelState::WaitForFundingLocked => {
				self.commitments.as_mut().unwrap().remote_next_commit = NextRemoteCommitInfo::Revoked(msg.next_per_commitment_point);
				self.enter_normal();
				Ok(())
			},
			ChannelState::Normal => {
				// They probably disconnected/reconnected and re-sent the funding_locked, which
				// is required until updates have flowed.
				let commitments = self.commitments.as_ref().unwrap();
				if commitments.local_commit.index == 0 && commitments.remote_commit.index == 0 {
					Ok(())
				} else {
					Err(ChannelError::Close("Peer sent a funding_locked at a strange time"))
				}
			},
			_ => Err(ChannelError::Close("Peer sent a funding_locked at a strange time")),
		}
	}

	// ---- state gates ----

	fn require_operational(&self) -> Result<(), ChannelError> {
		if !self.peer_connected || self.awaiting_reestablish {
			return Err(ChannelError::Close("Peer sent a channel update when we needed a channel_reestablish"));
		}
		match self.state {
			ChannelState::Normal | ChannelState::Shutdown => Ok(()),
			_ => Err(ChannelError::Close("Got a channel update message when channel was not in an operational state")),
		}
	}

	fn commitments_mut(&mut self) -> &mut Commitments {
		self.commitments.as_mut().expect("Operational states imply commitments exist")
	}

	/// The commitment ledger, for driver queries. Present from funding signature exchange until
	/// the channel dies.
	pub fn commitments(&self) -> Option<&Commitments> {
		self.commitments.as_ref()
	}

	/// Current state, for driver routing and telemetry.
	pub fn state(&self) -> ChannelState {
		self.state
	}

	/// The channel id: temporary before the funding outpoint exists, funding-derived after.
	pub fn channel_id(&self) -> [u8; 32] {
		self.channel_id
	}

	/// The short channel id once the funding transaction is deeply confirmed.
	pub fn short_channel_id(&self) -> Option<u64> {
		self.short_channel_id
	}

	/// Whether this side funded the channel.
	pub fn is_funder(&self) -> bool {
		self.is_funder
	}

	fn set_state(&mut self, new_state: ChannelState) {
		if self.state != new_state {
			log_debug!(self, "Channel {} transitioning {} -> {}", log_bytes!(self.channel_id), self.state.name(), new_state.name());
			self.pending_events.push(Event::StateChanged {
				channel_id: self.channel_id,
				previous_state: self.state.name(),
				new_state: new_state.name(),
			});
			self.state = new_state;
		}
	}

	// ---- local commands (CMD_*) ----

	fn require_usable_for_commands(&self) -> Result<(), CommandError> {
		if !self.peer_connected || self.awaiting_reestablish {
			return Err(CommandError::ChannelUnavailable { err: "Peer is disconnected" });
		}
		match self.state {
			ChannelState::Normal | ChannelState::Shutdown => Ok(()),
			_ => Err(CommandError::ChannelUnavailable { err: "Channel is not operational" }),
		}
	}

	/// CMD_ADD_HTLC.
	pub fn cmd_add_htlc(&mut self, amount_msat: u64, payment_hash: PaymentHash, cltv_expiry: u32,
			onion_routing_packet: msgs::OnionPacket, origin: HtlcOrigin) -> Result<msgs::UpdateAddHTLC, CommandError> {
		self.require_usable_for_commands()?;
		if self.state != ChannelState::Normal || self.local_shutdown_sent || self.remote_shutdown_received {
			return Err(CommandError::ChannelUnavailable { err: "Cannot send HTLCs while shutting down" });
		}
		let msg = self.commitments_mut().send_add(CmdAddHtlc {
			amount_msat, payment_hash, cltv_expiry, onion_routing_packet, origin,
		})?;
		Ok(msg)
	}

	/// CMD_FULFILL_HTLC.
	pub fn cmd_fulfill_htlc(&mut self, htlc_id: u64, payment_preimage: PaymentPreimage) -> Result<msgs::UpdateFulfillHTLC, CommandError> {
		self.require_usable_for_commands()?;
		self.commitments_mut().send_fulfill(htlc_id, payment_preimage)
	}

	/// CMD_FAIL_HTLC.
	pub fn cmd_fail_htlc(&mut self, htlc_id: u64, reason: msgs::OnionErrorPacket) -> Result<msgs::UpdateFailHTLC, CommandError> {
		self.require_usable_for_commands()?;
		self.commitments_mut().send_fail(htlc_id, reason)
	}

	/// CMD_FAIL_MALFORMED_HTLC.
	pub fn cmd_fail_malformed_htlc(&mut self, htlc_id: u64, sha256_of_onion: [u8; 32], failure_code: u16) -> Result<msgs::UpdateFailMalformedHTLC, CommandError> {
		self.require_usable_for_commands()?;
		self.commitments_mut().send_fail_malformed(htlc_id, sha256_of_onion, failure_code)
	}

	/// CMD_UPDATE_FEE.
	pub fn cmd_update_fee(&mut self, feerate_per_kw: u64) -> Result<msgs::UpdateFee, CommandError> {
		self.require_usable_for_commands()?;
		if self.state != ChannelState::Normal {
			return Err(CommandError::ChannelUnavailable { err: "Cannot update fees while shutting down" });
		}
		self.commitments_mut().send_fee(feerate_per_kw)
	}

	/// CMD_SIGN. Returns None when a signature is already in flight; in that case one will be
	/// produced automatically when the outstanding revocation arrives.
	pub fn cmd_sign(&mut self) -> Result<Option<msgs::CommitmentSigned>, CommandError> {
		self.require_usable_for_commands()?;
		if !self.commitments().unwrap().local_has_changes() {
			return Err(CommandError::ChannelUnavailable { err: "Cannot sign without any changes" });
		}
		if let NextRemoteCommitInfo::Waiting(_) = self.commitments().unwrap().remote_next_commit {
			self.commitments_mut().mark_re_sign_asap();
			return Ok(None);
		}
		let secp_ctx = self.secp_ctx.clone();
		let msg = self.commitments_mut().send_commit(&secp_ctx).map_err(|e| match e {
			ChannelError::Ignore(err) | ChannelError::Close(err) => CommandError::ChannelUnavailable { err },
		})?;
		let commitment_number = match self.commitments().unwrap().remote_next_commit {
			NextRemoteCommitInfo::Waiting(ref wait) => wait.next_remote_commit.index,
			_ => unreachable!(),
		};
		self.pending_events.push(Event::SignatureSent { channel_id: self.channel_id, commitment_number });
		Ok(Some(msg))
	}

	// ---- peer update messages ----

	/// update_add_htlc from the peer.
	pub fn update_add_htlc(&mut self, msg: &msgs::UpdateAddHTLC) -> Result<(), ChannelError> {
		self.require_operational()?;
		if self.state != ChannelState::Normal || self.remote_shutdown_received {
			return Err(ChannelError::Close("Got add HTLC message when channel was not in an operational state"));
		}
		self.commitments_mut().receive_add(msg.clone())
	}

	/// update_fulfill_htlc from the peer. The returned origin and HTLC must be relayed upstream
	/// immediately - but only after this channel has been persisted, preimage included.
	pub fn update_fulfill_htlc(&mut self, msg: &msgs::UpdateFulfillHTLC) -> Result<(HtlcOrigin, msgs::UpdateAddHTLC), ChannelError> {
		self.require_operational()?;
		let (origin, add) = self.commitments_mut().receive_fulfill(msg.clone())?;
		if let HtlcOrigin::Local = origin {
			self.pending_events.push(Event::PaymentSent { payment_preimage: msg.payment_preimage });
		}
		Ok((origin, add))
	}

	/// update_fail_htlc from the peer. The upstream replay happens once the removal is
	/// irrevocable, via [`Channel::revoke_and_ack`]'s outcome.
	pub fn update_fail_htlc(&mut self, msg: &msgs::UpdateFailHTLC) -> Result<(), ChannelError> {
		self.require_operational()?;
		self.commitments_mut().receive_fail(msg.clone())
	}

	/// update_fail_malformed_htlc from the peer.
	pub fn update_fail_malformed_htlc(&mut self, msg: &msgs::UpdateFailMalformedHTLC) -> Result<(), ChannelError> {
		self.require_operational()?;
		self.commitments_mut().receive_fail_malformed(msg.clone())
	}

	/// update_fee from the peer. Valid only from the funder; we compare against our own estimate
	/// and treat an unexplainable feerate as channel-fatal when so configured.
	pub fn update_fee(&mut self, msg: &msgs::UpdateFee, fee_estimator: &FeeEstimator) -> Result<(), ChannelError> {
		self.require_operational()?;
		let our_estimate = fee_estimator.get_est_sat_per_1000_weight(ConfirmationTarget::Normal);
		let proposed = msg.feerate_per_kw as u64;
		if proposed * 100 < our_estimate * self.config.min_feerate_mismatch_percent as u64
				|| proposed * 100 > our_estimate * self.config.max_feerate_mismatch_percent as u64 {
			if self.config.close_on_feerate_mismatch {
				return Err(ChannelError::Close("Peer's feerate is outside our tolerance"));
			}
			log_warn!(self, "Accepting out-of-tolerance feerate {} (our estimate {}) on channel {}", proposed, our_estimate, log_bytes!(self.channel_id));
		}
		self.commitments_mut().receive_fee(msg.clone())
	}

	/// commitment_signed from the peer. Returns the revoke_and_ack reply and, when we have our
	/// own changes pending, the commitment_signed continuing the dance. The channel MUST be
	/// persisted after this call and before either message hits the wire.
	pub fn commitment_signed(&mut self, msg: &msgs::CommitmentSigned, fee_estimator: &FeeEstimator)
			-> Result<(msgs::RevokeAndACK, Option<msgs::CommitmentSigned>, Option<msgs::ClosingSigned>), ChannelError> {
		self.require_operational()?;
		if self.last_sent_closing_fee.is_some() {
			return Err(ChannelError::Close("Peer sent commitment_signed after we'd started exchanging closing_signeds"));
		}
		let secp_ctx = self.secp_ctx.clone();
		let revocation = self.commitments_mut().receive_commit(msg, &secp_ctx)?;
		{
			let commitments = self.commitments.as_ref().unwrap();
			self.pending_events.push(Event::SignatureReceived { channel_id: self.channel_id, commitment_number: commitments.local_commit.index });
		}

		// Continue the dance if we have changes of our own to lock in.
		let our_commitment = if self.commitments().unwrap().local_has_changes() {
			match self.commitments().unwrap().remote_next_commit {
				NextRemoteCommitInfo::Revoked(_) => {
					let sig = self.commitments_mut().send_commit(&secp_ctx)?;
					self.pending_events.push(Event::SignatureSent {
						channel_id: self.channel_id,
						commitment_number: match self.commitments().unwrap().remote_next_commit {
							NextRemoteCommitInfo::Waiting(ref wait) => wait.next_remote_commit.index,
							_ => unreachable!(),
						},
					});
					Some(sig)
				},
				NextRemoteCommitInfo::Waiting(_) => {
					self.commitments_mut().mark_re_sign_asap();
					None
				},
			}
		} else { None };

		let closing_signed = self.maybe_enter_negotiation(fee_estimator);
		self.notify_available_balance();
		Ok((revocation, our_commitment, closing_signed))
	}

	/// revoke_and_ack from the peer. Returns the irrevocable settlement outcome plus, when a
	/// sign was queued behind the revocation, the next commitment_signed.
	pub fn revoke_and_ack(&mut self, msg: &msgs::RevokeAndACK, fee_estimator: &FeeEstimator)
			-> Result<(RevocationOutcome, Option<msgs::CommitmentSigned>, Option<msgs::ClosingSigned>), ChannelError> {
		self.require_operational()?;
		if self.last_sent_closing_fee.is_some() {
			return Err(ChannelError::Close("Peer sent revoke_and_ack after we'd started exchanging closing_signeds"));
		}
		let secp_ctx = self.secp_ctx.clone();
		let outcome = self.commitments_mut().receive_revocation(msg, &secp_ctx)?;

		for &(ref origin, ref add, ref settlement) in outcome.settled.iter() {
			if let &HtlcOrigin::Local = origin {
				match settlement {
					&HtlcSettlement::Failed(_) | &HtlcSettlement::FailedMalformed(..) => {
						self.pending_events.push(Event::PaymentFailed { payment_hash: add.payment_hash, rejected_by_dest: false });
					},
					&HtlcSettlement::Fulfilled(_) => {},
				}
			}
		}

		let our_commitment = if outcome.re_sign_asap && self.commitments().unwrap().local_has_changes() {
			let sig = self.commitments_mut().send_commit(&secp_ctx)?;
			self.pending_events.push(Event::SignatureSent {
				channel_id: self.channel_id,
				commitment_number: match self.commitments().unwrap().remote_next_commit {
					NextRemoteCommitInfo::Waiting(ref wait) => wait.next_remote_commit.index,
					_ => unreachable!(),
				},
			});
			Some(sig)
		} else { None };

		let closing_signed = self.maybe_enter_negotiation(fee_estimator);
		self.notify_available_balance();
		Ok((outcome, our_commitment, closing_signed))
	}

	fn notify_available_balance(&mut self) {
		let available = match self.commitments {
			Some(ref commitments) => commitments.available_balance_for_send_msat(),
			None => return,
		};
		self.pending_events.push(Event::AvailableBalanceChanged {
			channel_id: self.channel_id,
			available_for_send_msat: available,
		});
	}

	// ---- cooperative close ----

	fn no_pending_settlement(&self) -> bool {
		let commitments = match self.commitments {
			Some(ref commitments) => commitments,
			None => return true,
		};
		commitments.local_commit.spec.htlcs.is_empty()
			&& commitments.remote_commit.spec.htlcs.is_empty()
			&& !commitments.local_has_changes()
			&& !commitments.remote_has_changes()
			&& match commitments.remote_next_commit { NextRemoteCommitInfo::Revoked(_) => true, _ => false }
	}

	fn negotiated_dust_limit(&self) -> u64 {
		let commitments = self.commitments.as_ref().unwrap();
		cmp::max(commitments.local_params.dust_limit_satoshis, commitments.remote_params.dust_limit_satoshis)
	}

	fn build_closing_tx(&self, total_fee_satoshis: u64) -> (Transaction, u64) {
		let commitments = self.commitments.as_ref().unwrap();
		let spec = &commitments.local_commit.spec;
		let mut total_fee = total_fee_satoshis;
		let (mut to_local, mut to_remote) = (spec.to_local_msat / 1000, spec.to_remote_msat / 1000);
		if self.is_funder {
			if total_fee > to_local {
				total_fee = to_local;
			}
			to_local -= total_fee;
		} else {
			if total_fee > to_remote {
				total_fee = to_remote;
			}
			to_remote -= total_fee;
		}
		let tx = chan_utils::build_closing_transaction(
			&commitments.funding_txo,
			to_local, to_remote,
			self.local_shutdown_script.clone().unwrap(),
			self.remote_shutdown_script.clone().unwrap(),
			self.negotiated_dust_limit());
		(tx, total_fee)
	}

	fn sign_closing_tx(&self, tx: &Transaction) -> Signature {
		let commitments = self.commitments.as_ref().unwrap();
		let funding_redeemscript = commitments.funding_redeemscript(&self.secp_ctx);
		let sighash = chan_utils::sighash_all(tx, 0, &funding_redeemscript, self.funding_satoshis);
		self.secp_ctx.sign(&sighash, &commitments.local_params.keys.funding_key)
	}

	fn preferred_closing_fee(&self, fee_estimator: &FeeEstimator) -> u64 {
		let feerate = fee_estimator.get_est_sat_per_1000_weight(ConfirmationTarget::Background);
		let weight = chan_utils::closing_transaction_weight(
			self.local_shutdown_script.as_ref().unwrap(),
			self.remote_shutdown_script.as_ref().unwrap());
		chan_utils::weight2fee(feerate, weight)
	}

	fn maybe_enter_negotiation(&mut self, fee_estimator: &FeeEstimator) -> Option<msgs::ClosingSigned> {
		if !(self.local_shutdown_sent && self.remote_shutdown_received) {
			return None;
		}
		match self.state {
			ChannelState::Normal | ChannelState::Shutdown | ChannelState::Negotiating => {},
			_ => return None,
		}
		if !self.no_pending_settlement() {
			self.set_state(ChannelState::Shutdown);
			return None;
		}
		self.set_state(ChannelState::Negotiating);
		// The funder proposes first; the fundee waits.
		if !self.is_funder || self.last_sent_closing_fee.is_some() {
			return None;
		}
		let proposed_fee = self.preferred_closing_fee(fee_estimator);
		let (closing_tx, used_fee) = self.build_closing_tx(proposed_fee);
		let signature = self.sign_closing_tx(&closing_tx);
		self.mutual_close_proposed.push(closing_tx.txid());
		self.last_sent_closing_fee = Some((0, used_fee));
		Some(msgs::ClosingSigned {
			channel_id: self.channel_id,
			fee_satoshis: used_fee,
			signature,
		})
	}

	/// CMD_CLOSE: begin a cooperative close.
	pub fn cmd_close(&mut self, script_opt: Option<Script>, fee_estimator: &FeeEstimator) -> Result<(msgs::Shutdown, Option<msgs::ClosingSigned>), CommandError> {
		match self.state {
			ChannelState::Normal | ChannelState::Shutdown => {},
			ChannelState::Negotiating | ChannelState::Closing => return Err(CommandError::ClosingAlreadyInProgress),
			_ => return Err(CommandError::ChannelUnavailable { err: "Cannot close a channel that isn't operational" }),
		}
		if self.local_shutdown_sent {
			return Err(CommandError::ClosingAlreadyInProgress);
		}
		if !self.peer_connected || self.awaiting_reestablish {
			return Err(CommandError::ChannelUnavailable { err: "Cannot begin shutdown while peer is disconnected, maybe force-close instead?" });
		}
		{
			let commitments = self.commitments.as_ref().unwrap();
			for update in commitments.local_changes.proposed.iter() {
				if let &UpdateMessage::AddHtlc(_) = update {
					return Err(CommandError::ChannelUnavailable { err: "Cannot close with unsigned outgoing HTLCs; sign first" });
				}
			}
		}

		let script = match (script_opt, self.local_params.shutdown_script.clone()) {
			(Some(script), Some(upfront)) => {
				if script != upfront {
					return Err(CommandError::ChannelUnavailable { err: "Must close to the upfront shutdown script we committed to" });
				}
				script
			},
			(Some(script), None) => {
				if !script.is_p2pkh() && !script.is_p2sh() && !script.is_v0_p2wpkh() && !script.is_v0_p2wsh() {
					return Err(CommandError::ChannelUnavailable { err: "Closing script must be a standard form" });
				}
				script
			},
			(None, Some(upfront)) => upfront,
			(None, None) => self.default_shutdown_script(),
		};
		self.local_shutdown_script = Some(script.clone());
		self.local_shutdown_sent = true;
		self.pending_events.push(Event::LocalChannelDown { channel_id: self.channel_id });

		let closing_signed = self.maybe_enter_negotiation(fee_estimator);
		Ok((msgs::Shutdown {
			channel_id: self.channel_id,
			scriptpubkey: script,
		}, closing_signed))
	}

	/// shutdown from the peer.
	pub fn shutdown(&mut self, msg: &msgs::Shutdown, fee_estimator: &FeeEstimator)
			-> Result<(Option<msgs::Shutdown>, Option<msgs::ClosingSigned>), ChannelError> {
		if !self.peer_connected || self.awaiting_reestablish {
			return Err(ChannelError::Close("Peer sent shutdown when we needed a channel_reestablish"));
		}
		match self.state {
			ChannelState::Normal | ChannelState::Shutdown | ChannelState::Negotiating => {},
			_ => return Err(ChannelError::Close("Peer sent shutdown pre-funding or post-close")),
		}
		if !msg.scriptpubkey.is_p2pkh() && !msg.scriptpubkey.is_p2sh() && !msg.scriptpubkey.is_v0_p2wpkh() && !msg.scriptpubkey.is_v0_p2wsh() {
			return Err(ChannelError::Close("Got a nonstandard scriptpubkey from remote peer"));
		}
		{
			let commitments = self.commitments.as_ref().unwrap();
			if let Some(ref upfront) = commitments.remote_params.shutdown_script {
				if *upfront != msg.scriptpubkey {
					return Err(ChannelError::Close("Got shutdown request with a scriptpubkey which did not match their previous scriptpubkey"));
				}
			}
			if let Some(ref prev) = self.remote_shutdown_script {
				if *prev != msg.scriptpubkey {
					return Err(ChannelError::Close("Got shutdown request with a scriptpubkey which did not match their previous scriptpubkey"));
				}
			}
			for update in commitments.remote_changes.proposed.iter() {
				if let &UpdateMessage::AddHtlc(_) = update {
					return Err(ChannelError::Close("Got shutdown with remote pending HTLCs"));
				}
			}
		}
		self.remote_shutdown_script = Some(msg.scriptpubkey.clone());
		self.remote_shutdown_received = true;

		// From here on out, we may not fail!

		let our_shutdown = if self.local_shutdown_sent {
			None
		} else {
			let script = self.local_params.shutdown_script.clone().unwrap_or_else(|| self.default_shutdown_script());
			self.local_shutdown_script = Some(script.clone());
			self.local_shutdown_sent = true;
			self.pending_events.push(Event::LocalChannelDown { channel_id: self.channel_id });
			Some(msgs::Shutdown {
				channel_id: self.channel_id,
				scriptpubkey: script,
			})
		};
		let closing_signed = self.maybe_enter_negotiation(fee_estimator);
		Ok((our_shutdown, closing_signed))
	}

	/// closing_signed from the peer: accept their fee if it is reasonable or counter halfway.
	/// Returns our reply and, once agreement is reached, the fully-signed closing transaction
	/// (which this channel has also queued for publication and watching).
	pub fn closing_signed(&mut self, msg: &msgs::ClosingSigned, fee_estimator: &FeeEstimator)
			-> Result<(Option<msgs::ClosingSigned>, Option<Transaction>), ChannelError> {
		if self.state != ChannelState::Negotiating {
			return Err(ChannelError::Close("Remote end sent us a closing_signed before both sides provided a shutdown"));
		}
		if !self.peer_connected || self.awaiting_reestablish {
			return Err(ChannelError::Close("Peer sent closing_signed when we needed a channel_reestablish"));
		}
		if msg.fee_satoshis > 21_000_000 * 100_000_000 {
			return Err(ChannelError::Close("Remote tried to send us a closing tx with > 21 million BTC fee"));
		}
		self.closing_rounds += 1;
		if self.closing_rounds > self.config.max_closing_negotiation_iterations {
			return Err(ChannelError::Close("Unable to come to consensus about closing feerate"));
		}

		let (mut closing_tx, used_fee) = self.build_closing_tx(msg.fee_satoshis);
		if used_fee != msg.fee_satoshis {
			return Err(ChannelError::Close("Remote sent us a closing_signed with a fee greater than the value they can claim"));
		}
		{
			let commitments = self.commitments.as_ref().unwrap();
			let funding_redeemscript = commitments.funding_redeemscript(&self.secp_ctx);
			let sighash = chan_utils::sighash_all(&closing_tx, 0, &funding_redeemscript, self.funding_satoshis);
			secp_check!(self.secp_ctx.verify(&sighash, &msg.signature, &commitments.remote_params.funding_pubkey),
				"Invalid closing tx signature from peer");
		}

		macro_rules! complete_close {
			($fee: expr, $tx: expr) => { {
				let our_sig = self.sign_closing_tx(&$tx);
				{
					let commitments = self.commitments.as_ref().unwrap();
					let funding_redeemscript = commitments.funding_redeemscript(&self.secp_ctx);
					chan_utils::finalize_funding_input(&mut $tx, &our_sig, &msg.signature,
						&commitments.local_funding_pubkey(&self.secp_ctx), &commitments.remote_params.funding_pubkey,
						&funding_redeemscript);
				}
				self.mutual_close_proposed.push($tx.txid());
				let mut closing = ClosingState::new();
				closing.mutual_close_tx = Some($tx.clone());
				self.pending_publishes.extend(closing.publish_requests());
				self.pending_watches.extend(closing.watch_requests(self.minimum_depth));
				self.closing = Some(closing);
				self.closure_reason = Some(ClosureReason::CooperativeClosure);
				self.set_state(ChannelState::Closing);
				Ok((Some(msgs::ClosingSigned {
					channel_id: self.channel_id,
					fee_satoshis: $fee,
					signature: our_sig,
				}), Some($tx)))
			} }
		}

		if let Some((_, last_fee)) = self.last_sent_closing_fee {
			if last_fee == msg.fee_satoshis {
				// They accepted our last proposal; no need to echo another closing_signed.
				let our_sig = self.sign_closing_tx(&closing_tx);
				{
					let commitments = self.commitments.as_ref().unwrap();
					let funding_redeemscript = commitments.funding_redeemscript(&self.secp_ctx);
					chan_utils::finalize_funding_input(&mut closing_tx, &our_sig, &msg.signature,
						&commitments.local_funding_pubkey(&self.secp_ctx), &commitments.remote_params.funding_pubkey,
						&funding_redeemscript);
				}
				self.mutual_close_proposed.push(closing_tx.txid());
				let mut closing = ClosingState::new();
				closing.mutual_close_tx = Some(closing_tx.clone());
				self.pending_publishes.extend(closing.publish_requests());
				self.pending_watches.extend(closing.watch_requests(self.minimum_depth));
				self.closing = Some(closing);
				self.closure_reason = Some(ClosureReason::CooperativeClosure);
				self.set_state(ChannelState::Closing);
				return Ok((None, Some(closing_tx)));
			}
		}

		let our_preferred = self.preferred_closing_fee(fee_estimator);
		let reference = match self.last_sent_closing_fee {
			Some((_, last_fee)) => last_fee,
			None => our_preferred,
		};
		// Accept anything within a factor of two of what we'd pick ourselves, otherwise meet
		// them halfway; the gap halves every round so this terminates quickly.
		if msg.fee_satoshis >= reference / 2 && msg.fee_satoshis <= reference.saturating_mul(2) {
			return complete_close!(msg.fee_satoshis, closing_tx);
		}
		let counter_fee = (reference + msg.fee_satoshis) / 2;
		if counter_fee == msg.fee_satoshis {
			return complete_close!(msg.fee_satoshis, closing_tx);
		}
		let (counter_tx, counter_used_fee) = self.build_closing_tx(counter_fee);
		let signature = self.sign_closing_tx(&counter_tx);
		self.mutual_close_proposed.push(counter_tx.txid());
		self.last_sent_closing_fee = Some((0, counter_used_fee));
		Ok((Some(msgs::ClosingSigned {
			channel_id: self.channel_id,
			fee_satoshis: counter_used_fee,
			signature,
		}), None))
	}

	// ---- disconnection and reestablish ----

	/// INPUT_DISCONNECTED. Parks the channel in the OFFLINE overlay; un-signed proposals on both
	/// sides are rolled back and our dropped adds are returned so their payments can be failed
	/// upstream. Pre-funding channels die outright.
	pub fn mark_disconnected(&mut self) -> Vec<(HtlcOrigin, msgs::UpdateAddHTLC)> {
		match self.state {
			ChannelState::WaitForInit | ChannelState::WaitForOpenChannel | ChannelState::WaitForAcceptChannel |
			ChannelState::WaitForFundingInternal | ChannelState::WaitForFundingCreated | ChannelState::WaitForFundingSigned => {
				self.set_state(ChannelState::Closed);
				self.closure_reason = Some(ClosureReason::FundingTimedOut);
				return Vec::new();
			},
			ChannelState::Closing | ChannelState::Closed => return Vec::new(),
			_ => {},
		}
		self.peer_connected = false;
		// Closing negotiation restarts from scratch on reconnect.
		self.last_sent_closing_fee = None;
		self.closing_rounds = 0;
		if self.state == ChannelState::Negotiating {
			self.set_state(ChannelState::Shutdown);
		}
		match self.commitments {
			Some(ref mut commitments) => commitments.discard_unsigned_updates(),
			None => Vec::new(),
		}
	}

	/// INPUT_RECONNECTED: a fresh connection replaced any prior one. Produces our
	/// channel_reestablish; updates flow again only after the peer's arrives.
	pub fn mark_connected(&mut self) -> Result<msgs::ChannelReestablish, ChannelError> {
		if self.peer_connected && !self.awaiting_reestablish {
			// A second connection replaces the first; re-run the same dance.
			self.mark_disconnected();
		}
		self.peer_connected = true;
		self.awaiting_reestablish = true;
		self.get_channel_reestablish()
	}

	fn get_channel_reestablish(&self) -> Result<msgs::ChannelReestablish, ChannelError> {
		let commitments = match self.commitments {
			Some(ref commitments) => commitments,
			None => return Err(ChannelError::Ignore("Nothing to reestablish before the funding handshake")),
		};
		let data_loss_protect = if commitments.remote_commit.index > 0 {
			OptionalField::Present(msgs::DataLossProtect {
				your_last_per_commitment_secret: commitments.remote_per_commitment_secrets
					.get_secret(secret_index(commitments.remote_commit.index - 1))
					.unwrap_or([0; 32]),
				my_current_per_commitment_point: per_commitment_point(&self.secp_ctx, &commitments.local_params.keys.commitment_seed, commitments.local_commit.index),
			})
		} else {
			OptionalField::Present(msgs::DataLossProtect {
				your_last_per_commitment_secret: [0; 32],
				my_current_per_commitment_point: per_commitment_point(&self.secp_ctx, &commitments.local_params.keys.commitment_seed, commitments.local_commit.index),
			})
		};
		Ok(msgs::ChannelReestablish {
			channel_id: self.channel_id,
			next_local_commitment_number: commitments.local_commit.index + 1,
			next_remote_commitment_number: commitments.remote_commit.index,
			data_loss_protect,
		})
	}

	/// channel_reestablish from the peer: decide what must be retransmitted, or detect that one
	/// of us lost state.
	pub fn channel_reestablish(&mut self, msg: &msgs::ChannelReestablish) -> Result<ReestablishResponses, ChannelError> {
		if !self.awaiting_reestablish {
			// While the spec doesn't explicitly require erroring here, a loose reestablish
			// almost certainly means we are about to end up out of sync.
			return Err(ChannelError::Close("Peer sent a loose channel_reestablish not after reconnect"));
		}
		if self.commitments.is_none() {
			return Err(ChannelError::Close("Peer sent channel_reestablish pre-funding"));
		}
		if msg.next_local_commitment_number == 0 {
			return Err(ChannelError::Close("Peer sent a garbage channel_reestablish"));
		}

		// Did WE fall behind? Their next_remote_commitment_number counts the revocations they
		// hold from us; if it exceeds our own commitment index they know states we don't.
		let (local_index, remote_index, our_next_commit_number, waiting) = {
			let commitments = self.commitments.as_ref().unwrap();
			let (our_next, waiting) = match commitments.remote_next_commit {
				NextRemoteCommitInfo::Waiting(ref wait) => (wait.next_remote_commit.index + 1, true),
				NextRemoteCommitInfo::Revoked(_) => (commitments.remote_commit.index + 1, false),
			};
			(commitments.local_commit.index, commitments.remote_commit.index, our_next, waiting)
		};

		if msg.next_remote_commitment_number > local_index {
			if let OptionalField::Present(ref data_loss) = msg.data_loss_protect {
				let commitments = self.commitments.as_ref().unwrap();
				let expected = chan_utils::build_commitment_secret(&commitments.local_params.keys.commitment_seed,
					secret_index(msg.next_remote_commitment_number - 1));
				if expected != data_loss.your_last_per_commitment_secret {
					return Err(ChannelError::Close("Peer sent a garbage channel_reestablish with secret key not matching the commitment height provided"));
				}
				// We have fallen behind: if we broadcast our stale commitment the peer will
				// punish us. Hold still and wait for them to close on their current state.
				self.future_remote_point = Some(data_loss.my_current_per_commitment_point);
				self.awaiting_reestablish = false;
				self.closure_reason = Some(ClosureReason::DataLossRecovery);
				self.set_state(ChannelState::WaitForRemotePublishFutureCommitment);
				self.pending_events.push(Event::LocalChannelDown { channel_id: self.channel_id });
				return Ok(ReestablishResponses {
					funding_locked: None,
					updates_to_resend: Vec::new(),
					commitment_signed: None,
					revocation: None,
					order: RAACommitmentOrder::CommitmentFirst,
					shutdown: None,
				});
			} else {
				return Err(ChannelError::Close("Peer claimed a future state without proof"));
			}
		}

		self.awaiting_reestablish = false;

		// Which revocation of ours, if any, do they still need? They hold revocations for all our
		// commitments below msg.next_remote_commitment_number; our latest revocation covered
		// commitment local_index - 1.
		let revocation = if msg.next_remote_commitment_number == local_index {
			// In sync: they saw the revocation of our previous commitment.
			None
		} else if msg.next_remote_commitment_number + 1 == local_index {
			// They haven't received our last revoke_and_ack; repeat it.
			let commitments = self.commitments.as_ref().unwrap();
			Some(msgs::RevokeAndACK {
				channel_id: self.channel_id,
				per_commitment_secret: chan_utils::build_commitment_secret(&commitments.local_params.keys.commitment_seed, secret_index(local_index - 1)),
				next_per_commitment_point: per_commitment_point(&self.secp_ctx, &commitments.local_params.keys.commitment_seed, local_index + 1),
			})
		} else {
			return Err(ChannelError::Close("Peer attempted to reestablish channel with a very old local commitment transaction"));
		};

		// Which commitment_signed of ours, if any, do they still need?
		let (updates_to_resend, commitment_signed, order) = if waiting && msg.next_local_commitment_number + 1 == our_next_commit_number {
			// They never received our last commitment_signed: replay the batch and the sig.
			let commitments = self.commitments.as_ref().unwrap();
			let wait = match commitments.remote_next_commit {
				NextRemoteCommitInfo::Waiting(ref wait) => wait,
				_ => unreachable!(),
			};
			let order = if revocation.is_some() && wait.sent_after_local_commit_index == local_index {
				// Our lost revocation predates the lost signature.
				RAACommitmentOrder::RevokeAndACKFirst
			} else {
				RAACommitmentOrder::CommitmentFirst
			};
			(commitments.local_changes.signed.clone(), Some(wait.sent.clone()), order)
		} else if msg.next_local_commitment_number == our_next_commit_number {
			(Vec::new(), None, RAACommitmentOrder::RevokeAndACKFirst)
		} else {
			return Err(ChannelError::Close("Peer attempted to reestablish channel with a very old remote commitment transaction"));
		};

		// Re-send funding_locked when no commitment has moved yet and they ask for it.
		let funding_locked = if local_index == 0 && remote_index == 0 && msg.next_local_commitment_number == 1 && commitment_signed.is_none() {
			let commitments = self.commitments.as_ref().unwrap();
			Some(msgs::FundingLocked {
				channel_id: self.channel_id,
				next_per_commitment_point: per_commitment_point(&self.secp_ctx, &commitments.local_params.keys.commitment_seed, 1),
			})
		} else { None };

		let shutdown = if self.local_shutdown_sent {
			Some(msgs::Shutdown {
				channel_id: self.channel_id,
				scriptpubkey: self.local_shutdown_script.clone().unwrap(),
			})
		} else { None };

		Ok(ReestablishResponses {
			funding_locked,
			updates_to_resend,
			commitment_signed,
			revocation,
			order,
			shutdown,
		})
	}

	// ---- unilateral close and chain reactions ----

	fn map_settlements(&self, raw: Vec<OnchainSettlement>) -> Vec<UpstreamSettlement> {
		let commitments = match self.commitments {
			Some(ref commitments) => commitments,
			None => return Vec::new(),
		};
		let mut settlements = Vec::new();
		for settlement in raw {
			let payment_hash = match settlement {
				OnchainSettlement::Fulfilled { payment_hash, .. } => payment_hash,
				OnchainSettlement::Failed { payment_hash } => payment_hash,
			};
			// Settlements of our offered HTLCs replay upstream through the origin map.
			let origin = commitments.local_commit.spec.htlcs.iter()
				.chain(commitments.remote_commit.spec.htlcs.iter())
				.filter(|h| h.add.payment_hash == payment_hash)
				.filter_map(|h| commitments.origins.get(&h.add.htlc_id))
				.next()
				.cloned()
				.unwrap_or(HtlcOrigin::Local);
			let mapped = match settlement {
				OnchainSettlement::Fulfilled { payment_preimage, .. } => HtlcSettlement::Fulfilled(payment_preimage),
				OnchainSettlement::Failed { .. } => HtlcSettlement::Failed(msgs::OnionErrorPacket { data: Vec::new() }),
			};
			settlements.push(UpstreamSettlement { origin, payment_hash, settlement: mapped });
		}
		settlements
	}

	fn ensure_closing(&mut self) -> &mut ClosingState {
		if self.closing.is_none() {
			self.closing = Some(ClosingState::new());
		}
		self.closing.as_mut().unwrap()
	}

	/// CMD_FORCECLOSE, or the reaction the driver feeds back after any ChannelError::Close:
	/// publish our commitment and all second-stage transactions we can.
	pub fn force_close(&mut self, reason: &'static str, fee_estimator: &FeeEstimator) -> Vec<UpstreamSettlement> {
		match self.state {
			ChannelState::Closed => return Vec::new(),
			ChannelState::Closing => return Vec::new(),
			_ => {},
		}
		if self.commitments.is_none() {
			self.set_state(ChannelState::Closed);
			self.closure_reason = Some(ClosureReason::HolderForceClosed { message: reason.to_string() });
			return Vec::new();
		}
		log_info!(self, "Force-closing channel {}: {}", log_bytes!(self.channel_id), reason);
		let claim_feerate = fee_estimator.get_est_sat_per_1000_weight(ConfirmationTarget::HighPriority);
		let lcp = {
			let commitments = self.commitments.as_ref().unwrap();
			onchain::LocalCommitPublished::build(commitments, &self.secp_ctx, &self.destination_script, claim_feerate)
		};
		// Trimmed outbound HTLCs can never reach the chain; they fail upstream immediately.
		let trimmed = {
			let commitments = self.commitments.as_ref().unwrap();
			onchain::trimmed_offered_htlcs(commitments, &lcp.htlcs,
				commitments.local_params.dust_limit_satoshis, commitments.local_commit.spec.feerate_per_kw)
		};
		let settlements = self.map_settlements(trimmed.into_iter().map(|payment_hash| OnchainSettlement::Failed { payment_hash }).collect());
		{
			let min_depth = self.minimum_depth;
			let closing = self.ensure_closing();
			closing.local_commit_published = Some(lcp);
			let publishes = closing.publish_requests();
			let watches = closing.watch_requests(min_depth);
			self.pending_publishes.extend(publishes);
			self.pending_watches.extend(watches);
		}
		self.closure_reason = Some(ClosureReason::HolderForceClosed { message: reason.to_string() });
		self.set_state(ChannelState::Closing);
		self.pending_events.push(Event::LocalChannelDown { channel_id: self.channel_id });
		settlements
	}

	/// Handles an `error` message from the peer: they are unilaterally closing, or telling us
	/// they cannot continue; either way the only safe reaction is a force close of our own.
	pub fn peer_error(&mut self, msg: &msgs::ErrorMessage, fee_estimator: &FeeEstimator) -> Vec<UpstreamSettlement> {
		let settlements = self.force_close("peer sent error message", fee_estimator);
		self.closure_reason = Some(ClosureReason::CounterpartyError { message: msg.data.clone() });
		settlements
	}

	/// The funding output was spent. Classify the spender and arm the matching claim branch.
	pub fn funding_spent(&mut self, tx: &Transaction, fee_estimator: &FeeEstimator) -> Result<Vec<UpstreamSettlement>, ChannelError> {
		let commitments = match self.commitments {
			Some(ref commitments) => commitments.clone(),
			None => return Err(ChannelError::Ignore("Funding spent before we have commitments?")),
		};
		let txid = tx.txid();
		// Idempotency: a replayed watch for a branch we already track.
		if let Some(ref closing) = self.closing {
			let known = closing.mutual_close_tx.as_ref().map_or(false, |t| t.txid() == txid)
				|| closing.local_commit_published.as_ref().map_or(false, |b| b.commit_tx.txid() == txid)
				|| closing.remote_commit_published.as_ref().map_or(false, |b| b.txid == txid)
				|| closing.next_remote_commit_published.as_ref().map_or(false, |b| b.txid == txid)
				|| closing.revoked_commit_published.iter().any(|b| b.txid == txid)
				|| closing.future_remote_commit_published.as_ref().map_or(false, |b| b.txid == txid);
			if known {
				return Ok(Vec::new());
			}
		}

		let claim_feerate = fee_estimator.get_est_sat_per_1000_weight(ConfirmationTarget::HighPriority);
		let mut settlements_raw: Vec<OnchainSettlement> = Vec::new();
		match onchain::classify_funding_spend(&commitments, &self.mutual_close_proposed, tx) {
			FundingSpendClass::MutualClose => {
				let closing = self.ensure_closing();
				if closing.mutual_close_tx.is_none() {
					closing.mutual_close_tx = Some(tx.clone());
				}
				if self.closure_reason.is_none() {
					self.closure_reason = Some(ClosureReason::CooperativeClosure);
				}
			},
			FundingSpendClass::LocalCommit => {
				let lcp = onchain::LocalCommitPublished::build(&commitments, &self.secp_ctx, &self.destination_script, claim_feerate);
				settlements_raw.extend(onchain::trimmed_offered_htlcs(&commitments, &lcp.htlcs,
					commitments.local_params.dust_limit_satoshis, commitments.local_commit.spec.feerate_per_kw)
					.into_iter().map(|payment_hash| OnchainSettlement::Failed { payment_hash }));
				self.ensure_closing().local_commit_published = Some(lcp);
				if self.closure_reason.is_none() {
					self.closure_reason = Some(ClosureReason::HolderForceClosed { message: "commit tx reached the chain".to_string() });
				}
			},
			FundingSpendClass::RemoteCommit => {
				let rcp = secp_check!(onchain::RemoteCommitPublished::build(&commitments, &commitments.remote_commit, &self.secp_ctx, &self.destination_script, claim_feerate),
					"Building remote close claims failed");
				settlements_raw.extend(onchain::trimmed_offered_htlcs(&commitments, &rcp.htlcs,
					commitments.remote_params.dust_limit_satoshis, commitments.remote_commit.spec.feerate_per_kw)
					.into_iter().map(|payment_hash| OnchainSettlement::Failed { payment_hash }));
				self.ensure_closing().remote_commit_published = Some(rcp);
				self.closure_reason = Some(ClosureReason::CounterpartyForceClosed);
			},
			FundingSpendClass::NextRemoteCommit => {
				let next_remote = match commitments.remote_next_commit {
					NextRemoteCommitInfo::Waiting(ref wait) => wait.next_remote_commit.clone(),
					_ => unreachable!(),
				};
				let rcp = secp_check!(onchain::RemoteCommitPublished::build(&commitments, &next_remote, &self.secp_ctx, &self.destination_script, claim_feerate),
					"Building next-remote close claims failed");
				self.ensure_closing().next_remote_commit_published = Some(rcp);
				self.closure_reason = Some(ClosureReason::CounterpartyForceClosed);
			},
			FundingSpendClass::RevokedCommit => {
				let rvk = secp_check!(onchain::RevokedCommitPublished::build(&commitments, tx, &self.secp_ctx, &self.destination_script, claim_feerate),
					"Building penalty claims failed");
				log_warn!(self, "Counterparty published REVOKED commitment {} on channel {}; punishing", txid, log_bytes!(self.channel_id));
				self.ensure_closing().revoked_commit_published.push(rvk);
				self.closure_reason = Some(ClosureReason::CounterpartyForceClosed);
			},
			FundingSpendClass::FutureCommit => {
				// We cannot know the HTLC set of a future commitment; claim the main output if
				// we can and let everything else go.
				let future_point = self.future_remote_point.clone();
				let fut = onchain::FutureRemoteCommitPublished::build(&commitments, tx, future_point.as_ref(), &self.secp_ctx, &self.destination_script, claim_feerate);
				self.ensure_closing().future_remote_commit_published = Some(fut);
				self.closure_reason = Some(ClosureReason::DataLossRecovery);
			},
		}

		{
			let min_depth = self.minimum_depth;
			let closing = self.closing.as_ref().unwrap();
			let publishes = closing.publish_requests();
			let watches = closing.watch_requests(min_depth);
			self.pending_publishes.extend(publishes);
			self.pending_watches.extend(watches);
		}
		self.set_state(ChannelState::Closing);
		Ok(self.map_settlements(settlements_raw))
	}

	/// A watched transaction reached its requested depth.
	pub fn tx_confirmed(&mut self, tx: &Transaction, height: u32, fee_estimator: &FeeEstimator) -> Vec<UpstreamSettlement> {
		let txid = tx.txid();
		let mut settlements_raw: Vec<OnchainSettlement> = Vec::new();
		let claim_feerate = fee_estimator.get_est_sat_per_1000_weight(ConfirmationTarget::HighPriority);

		let done = {
			let commitments = match self.commitments {
				Some(ref commitments) => commitments.clone(),
				None => return Vec::new(),
			};
			let secp_ctx = self.secp_ctx.clone();
			let destination_script = self.destination_script.clone();
			let closing = match self.closing {
				Some(ref mut closing) => closing,
				None => return Vec::new(),
			};

			if let Some(ref mut lcp) = closing.local_commit_published {
				if txid == lcp.commit_tx.txid() {
					self.pending_events.push(Event::LocalCommitConfirmed { channel_id: commitments.channel_id, height });
				}
				// A second-stage HTLC tx confirming unlocks the third-stage claim; a timeout
				// path confirming deep enough settles the HTLC backwards.
				if lcp.htlc_txs.iter().any(|t| t.txid() == txid) {
					lcp.on_htlc_tx_confirmed(&commitments, &secp_ctx, &destination_script, claim_feerate, tx);
					if tx.lock_time != 0 {
						for htlc in lcp.htlcs.iter() {
							if htlc.direction == HtlcDirection::Offered && htlc.add.cltv_expiry == tx.lock_time {
								settlements_raw.push(OnchainSettlement::Failed { payment_hash: htlc.add.payment_hash });
							}
						}
					}
				}
			}
			for rcp in closing.remote_commit_published.iter_mut().chain(closing.next_remote_commit_published.iter_mut()) {
				if rcp.claim_htlc_timeout_txs.iter().any(|t| t.txid() == txid) && tx.lock_time != 0 {
					for htlc in rcp.htlcs.iter() {
						// Our offered HTLCs are Received in their spec.
						if htlc.direction == HtlcDirection::Received && htlc.add.cltv_expiry == tx.lock_time {
							settlements_raw.push(OnchainSettlement::Failed { payment_hash: htlc.add.payment_hash });
						}
					}
				}
			}

			let done = closing.on_tx_confirmed(txid, height);
			let publishes = closing.publish_requests();
			let watches = closing.watch_requests(self.minimum_depth);
			self.pending_publishes.extend(publishes);
			self.pending_watches.extend(watches);
			done
		};

		if done {
			let reason = self.closure_reason.clone().unwrap_or(ClosureReason::CooperativeClosure);
			self.pending_events.push(Event::ChannelClosed {
				channel_id: self.channel_id,
				reason,
				funding_txo: self.funding_txo,
			});
			self.set_state(ChannelState::Closed);
		}
		self.map_settlements(settlements_raw)
	}

	/// A watched (non-funding) outpoint was spent: extract preimages, punish counterparty
	/// second-stage transactions on revoked commitments, and record the spend.
	pub fn output_spent(&mut self, outpoint: &OutPoint, spending_tx: &Transaction, fee_estimator: &FeeEstimator) -> Vec<UpstreamSettlement> {
		let commitments = match self.commitments {
			Some(ref commitments) => commitments.clone(),
			None => return Vec::new(),
		};
		let claim_feerate = fee_estimator.get_est_sat_per_1000_weight(ConfirmationTarget::HighPriority);
		let secp_ctx = self.secp_ctx.clone();
		let destination_script = self.destination_script.clone();

		// Any witness the counterparty reveals may hold a preimage for an HTLC we relayed.
		let pending_hashes: Vec<PaymentHash> = commitments.local_commit.spec.htlcs.iter()
			.chain(commitments.remote_commit.spec.htlcs.iter())
			.map(|h| h.add.payment_hash)
			.collect();
		let mut settlements_raw = onchain::extract_preimages(spending_tx, &pending_hashes);

		{
			let closing = match self.closing {
				Some(ref mut closing) => closing,
				None => return self.map_settlements(settlements_raw),
			};
			let spender = spending_tx.txid();
			if let Some(ref mut lcp) = closing.local_commit_published {
				if outpoint.txid == lcp.commit_tx.txid() || lcp.htlc_txs.iter().any(|t| t.txid() == outpoint.txid) {
					lcp.irrevocably_spent.insert(*outpoint, spender);
				}
			}
			for rcp in closing.remote_commit_published.iter_mut().chain(closing.next_remote_commit_published.iter_mut()) {
				if outpoint.txid == rcp.txid {
					rcp.irrevocably_spent.insert(*outpoint, spender);
				}
			}
			for rvk in closing.revoked_commit_published.iter_mut() {
				if outpoint.txid == rvk.txid {
					rvk.irrevocably_spent.insert(*outpoint, spender);
					// If the cheater spent an HTLC output with their own second-stage tx, its
					// delayed output is still ours by revocation.
					if spending_tx.input.iter().any(|i| i.previous_output.txid == rvk.txid) && spender != rvk.txid {
						let ours = rvk.htlc_penalty_txs.iter().any(|t| t.txid() == spender)
							|| rvk.main_penalty_tx.as_ref().map_or(false, |t| t.txid() == spender)
							|| rvk.claim_main_tx.as_ref().map_or(false, |t| t.txid() == spender);
						if !ours {
							rvk.on_their_htlc_tx(&commitments, &secp_ctx, &destination_script, claim_feerate, spending_tx);
						}
					}
				}
			}
			if let Some(ref mut fut) = closing.future_remote_commit_published {
				if outpoint.txid == fut.txid {
					fut.irrevocably_spent.insert(*outpoint, spender);
				}
			}
			let publishes = closing.publish_requests();
			let watches = closing.watch_requests(self.minimum_depth);
			self.pending_publishes.extend(publishes);
			self.pending_watches.extend(watches);
		}

		self.map_settlements(settlements_raw)
	}

	// ---- timeouts ----

	/// TickChannelOpenTimeout: a pre-funding handshake that stalls twice in a row is abandoned.
	pub fn tick_channel_open_timeout(&mut self) {
		match self.state {
			ChannelState::WaitForInit | ChannelState::WaitForOpenChannel | ChannelState::WaitForAcceptChannel |
			ChannelState::WaitForFundingInternal | ChannelState::WaitForFundingCreated | ChannelState::WaitForFundingSigned => {
				self.open_timeout_ticks += 1;
				if self.open_timeout_ticks >= CHANNEL_OPEN_TIMEOUT_TICKS {
					self.set_state(ChannelState::Closed);
					self.closure_reason = Some(ClosureReason::FundingTimedOut);
					self.pending_events.push(Event::ChannelClosed {
						channel_id: self.channel_id,
						reason: ClosureReason::FundingTimedOut,
						funding_txo: self.funding_txo,
					});
				}
			},
			_ => {},
		}
	}

	/// A new block. Only the fundee's funding-confirmation grace period cares.
	pub fn block_connected(&mut self, _height: u32) {
		if self.state == ChannelState::WaitForFundingConfirmed && !self.is_funder {
			self.funding_wait_blocks += 1;
			let grace = if self.config.funding_timeout_blocks != 0 { self.config.funding_timeout_blocks } else { FUNDEE_FUNDING_GRACE_BLOCKS_DEFAULT };
			if self.funding_wait_blocks > grace {
				self.set_state(ChannelState::Closed);
				self.closure_reason = Some(ClosureReason::FundingTimedOut);
				self.pending_events.push(Event::ChannelClosed {
					channel_id: self.channel_id,
					reason: ClosureReason::FundingTimedOut,
					funding_txo: self.funding_txo,
				});
			}
		}
	}

	// ---- restart ----

	/// INPUT_RESTORED: re-arm every watch and re-publish every unconfirmed transaction this
	/// channel still cares about. Idempotent by construction.
	pub fn restored(&mut self) {
		self.pending_events.push(Event::ChannelRestored { channel_id: self.channel_id, state_name: self.state.name() });
		match self.state {
			ChannelState::WaitForFundingConfirmed | ChannelState::WaitForFundingLocked => {
				self.arm_funding_watches();
			},
			ChannelState::Normal | ChannelState::Shutdown | ChannelState::Negotiating |
			ChannelState::WaitForRemotePublishFutureCommitment => {
				let funding_txo = self.funding_txo.unwrap();
				self.pending_watches.push(WatchRequest::Spent { outpoint: funding_txo, tag: WatchTag::FundingSpent });
			},
			ChannelState::Closing => {
				let commit_confirmed = {
					let closing = self.closing.as_ref().unwrap();
					let commit_txid = closing.local_commit_published.as_ref().map(|b| b.commit_tx.txid())
						.or(closing.remote_commit_published.as_ref().map(|b| b.txid))
						.or(closing.next_remote_commit_published.as_ref().map(|b| b.txid))
						.or(closing.revoked_commit_published.first().map(|b| b.txid))
						.or(closing.future_remote_commit_published.as_ref().map(|b| b.txid))
						.or(closing.mutual_close_tx.as_ref().map(|t| t.txid()));
					match commit_txid {
						Some(txid) => closing.confirmed.contains_key(&txid),
						None => false,
					}
				};
				if !commit_confirmed {
					let funding_txo = self.funding_txo.unwrap();
					self.pending_watches.push(WatchRequest::Spent { outpoint: funding_txo, tag: WatchTag::FundingSpent });
				}
				let min_depth = self.minimum_depth;
				let closing = self.closing.as_ref().unwrap();
				let publishes = closing.publish_requests();
				let watches = closing.watch_requests(min_depth);
				self.pending_publishes.extend(publishes);
				self.pending_watches.extend(watches);
			},
			_ => {},
		}
	}

	// ---- effect draining ----

	/// Transactions to broadcast, accumulated since the last drain.
	pub fn get_and_clear_pending_publishes(&mut self) -> Vec<PublishRequest> {
		::std::mem::replace(&mut self.pending_publishes, Vec::new())
	}

	/// Watches to arm, accumulated since the last drain.
	pub fn get_and_clear_pending_watches(&mut self) -> Vec<WatchRequest> {
		::std::mem::replace(&mut self.pending_watches, Vec::new())
	}
}

impl EventsProvider for Channel {
	fn get_and_clear_pending_events(&mut self) -> Vec<Event> {
		::std::mem::replace(&mut self.pending_events, Vec::new())
	}
}

const SERIALIZATION_VERSION: u8 = 1;
const MIN_SERIALIZATION_VERSION: u8 = 1;

impl Writeable for Channel {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		// Pre-funding channels are deliberately not persistable; both sides forget them on
		// disconnect, per the protocol.
		writer.write_all(&[SERIALIZATION_VERSION; 1])?;
		writer.write_all(&[MIN_SERIALIZATION_VERSION; 1])?;

		self.config.write(writer)?;
		self.state.write_to(writer)?;
		self.channel_id.write(writer)?;
		self.is_funder.write(writer)?;
		self.format.write(writer)?;
		self.static_remote_key.write(writer)?;
		self.funding_satoshis.write(writer)?;
		self.push_msat.write(writer)?;
		self.feerate_per_kw.write(writer)?;
		self.minimum_depth.write(writer)?;
		self.funding_txo.write(writer)?;
		self.pending_remote_funding_locked.write(writer)?;
		self.commitments.as_ref().expect("Only funded channels are persisted").write(writer)?;
		self.short_channel_id.write(writer)?;
		self.local_shutdown_script.write(writer)?;
		self.remote_shutdown_script.write(writer)?;
		self.local_shutdown_sent.write(writer)?;
		self.remote_shutdown_received.write(writer)?;
		self.mutual_close_proposed.write(writer)?;
		self.closing.write(writer)?;
		self.future_remote_point.write(writer)?;
		self.destination_script.write(writer)?;
		self.shutdown_pubkey.write(writer)?;
		self.funding_wait_blocks.write(writer)
	}
}

impl Channel {
	/// Reads a channel back from disk. The channel comes back in the OFFLINE overlay; the driver
	/// must feed INPUT_RESTORED (via [`Channel::restored`]) and then reconnect the peer.
	pub fn read<R: Read>(reader: &mut R, logger: Arc<Logger>) -> Result<Channel, DecodeError> {
		let version: u8 = Readable::read(reader)?;
		let min_version: u8 = Readable::read(reader)?;
		if min_version > SERIALIZATION_VERSION || version < MIN_SERIALIZATION_VERSION {
			return Err(DecodeError::UnknownVersion);
		}

		let config: ChannelConfig = Readable::read(reader)?;
		let state = ChannelState::read_from(reader)?;
		let channel_id = Readable::read(reader)?;
		let is_funder = Readable::read(reader)?;
		let format = Readable::read(reader)?;
		let static_remote_key = Readable::read(reader)?;
		let funding_satoshis = Readable::read(reader)?;
		let push_msat = Readable::read(reader)?;
		let feerate_per_kw = Readable::read(reader)?;
		let minimum_depth = Readable::read(reader)?;
		let funding_txo = Readable::read(reader)?;
		let pending_remote_funding_locked = Readable::read(reader)?;
		let commitments: Commitments = Readable::read(reader)?;
		let short_channel_id = Readable::read(reader)?;
		let local_shutdown_script = Readable::read(reader)?;
		let remote_shutdown_script = Readable::read(reader)?;
		let local_shutdown_sent = Readable::read(reader)?;
		let remote_shutdown_received = Readable::read(reader)?;
		let mutual_close_proposed = Readable::read(reader)?;
		let closing = Readable::read(reader)?;
		let future_remote_point = Readable::read(reader)?;
		let destination_script = Readable::read(reader)?;
		let shutdown_pubkey = Readable::read(reader)?;
		let funding_wait_blocks = Readable::read(reader)?;

		let local_params = commitments.local_params.clone();
		let remote_params = commitments.remote_params.clone();
		Ok(Channel {
			config,
			state,
			peer_connected: false,
			awaiting_reestablish: false,
			channel_id,
			is_funder,
			format,
			static_remote_key,
			secp_ctx: Secp256k1::new(),
			funding_satoshis,
			push_msat,
			feerate_per_kw,
			minimum_depth,
			local_params,
			remote_params: Some(remote_params),
			remote_first_per_commitment_point: None,
			funding_txo,
			initial_remote_commit: None,
			pending_remote_funding_locked,
			commitments: Some(commitments),
			short_channel_id,
			local_shutdown_script,
			remote_shutdown_script,
			local_shutdown_sent,
			remote_shutdown_received,
			last_sent_closing_fee: None,
			closing_rounds: 0,
			mutual_close_proposed,
			closing,
			closure_reason: None,
			future_remote_point,
			destination_script,
			shutdown_pubkey,
			open_timeout_ticks: 0,
			funding_wait_blocks,
			pending_events: Vec::new(),
			pending_publishes: Vec::new(),
			pending_watches: Vec::new(),
			logger,
		})
	}
}
