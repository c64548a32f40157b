//! The commitment ledger: one side's complete bookkeeping for a funded channel. Holds the pair
//! of commitments (latest signed local, latest signed remote, plus the transient next-remote
//! while a revocation is outstanding), the changes logs of both sides, origin tracking for
//! relayed HTLCs and the counterparty's revealed revocation secrets.
//!
//! Every mutation validates the full constraint set (balances, reserves, dust, in-flight caps,
//! HTLC counts, funder fee affordability) before any state is touched, so a failed operation
//! leaves the ledger exactly as it was.

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{Transaction, SigHashType};

use bitcoin_hashes::Hash;
use bitcoin_hashes::sha256::Hash as Sha256;
use bitcoin_hashes::sha256d::Hash as Sha256dHash;

use secp256k1::key::{PublicKey, SecretKey};
use secp256k1::{Secp256k1, Signature};
use secp256k1;

use ln::{PaymentHash, PaymentPreimage};
use ln::chan_utils;
use ln::chan_utils::{ChannelKeys, CommitmentFormat, CommitmentSpec, DirectedHtlc, HtlcDirection,
	HTLCOutputInCommitment, RevocationStore, TxCreationKeys};
use ln::channel::ChannelError;
use ln::msgs;
use ln::msgs::{DecodeError, UpdateMessage};
use chain::transaction::OutPoint;
use util::errors::CommandError;
use util::ser::{Readable, Writeable, Writer, U48};

use std::collections::HashMap;
use std::io::Read;

/// Commitment secrets are indexed counting down from 2^48-1 while commitment numbers count up
/// from 0; this is the pivot between the two.
pub const INITIAL_COMMITMENT_INDEX: u64 = (1 << 48) - 1;

/// Converts an up-counting commitment number into the down-counting secret-chain index.
#[inline]
pub fn secret_index(commitment_number: u64) -> u64 {
	INITIAL_COMMITMENT_INDEX - commitment_number
}

/// The per-commitment secret for one of our own commitments.
pub fn per_commitment_secret(commitment_seed: &[u8; 32], commitment_number: u64) -> SecretKey {
	SecretKey::from_slice(&chan_utils::build_commitment_secret(commitment_seed, secret_index(commitment_number))).expect("SHA256 output is a valid key with overwhelming probability")
}

/// The per-commitment point for one of our own commitments.
pub fn per_commitment_point<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, commitment_seed: &[u8; 32], commitment_number: u64) -> PublicKey {
	PublicKey::from_secret_key(secp_ctx, &per_commitment_secret(commitment_seed, commitment_number))
}

/// Our immutable side of the channel parameters, fixed at the open handshake.
#[derive(Clone)]
pub struct LocalParams {
	/// Whether we funded the channel (and thus pay commit fees and anchors).
	pub is_funder: bool,
	/// Below this, outputs are trimmed from commitments we hold.
	pub dust_limit_satoshis: u64,
	/// Cap on aggregate inbound HTLC value, set by us.
	pub max_htlc_value_in_flight_msat: u64,
	/// The reserve WE must maintain, demanded by the peer.
	pub channel_reserve_satoshis: u64,
	/// Smallest inbound HTLC we accept.
	pub htlc_minimum_msat: u64,
	/// Blocks the peer must wait to claim their delayed output.
	pub to_self_delay: u16,
	/// Cap on the number of inbound HTLCs, set by us.
	pub max_accepted_htlcs: u16,
	/// Our secret keys for this channel.
	pub keys: ChannelKeys,
	/// The script we committed to close to, if we used upfront_shutdown_script.
	pub shutdown_script: Option<Script>,
}

impl_writeable!(LocalParams, {
	is_funder,
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	to_self_delay,
	max_accepted_htlcs,
	keys,
	shutdown_script
});

/// The peer's side of the channel parameters.
#[derive(Clone)]
pub struct RemoteParams {
	/// Below this, outputs are trimmed from commitments they hold.
	pub dust_limit_satoshis: u64,
	/// Cap on aggregate HTLC value we may have in flight towards them.
	pub max_htlc_value_in_flight_msat: u64,
	/// The reserve THEY must maintain, demanded by us.
	pub channel_reserve_satoshis: u64,
	/// Smallest HTLC they accept.
	pub htlc_minimum_msat: u64,
	/// Blocks we must wait to claim our delayed output.
	pub to_self_delay: u16,
	/// Cap on the number of HTLCs we may offer them.
	pub max_accepted_htlcs: u16,
	/// Their funding pubkey in the 2-of-2.
	pub funding_pubkey: PublicKey,
	/// Their revocation basepoint.
	pub revocation_basepoint: PublicKey,
	/// Their payment basepoint.
	pub payment_basepoint: PublicKey,
	/// Their delayed payment basepoint.
	pub delayed_payment_basepoint: PublicKey,
	/// Their HTLC basepoint.
	pub htlc_basepoint: PublicKey,
	/// The script they committed to close to, if any.
	pub shutdown_script: Option<Script>,
}

impl_writeable!(RemoteParams, {
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	to_self_delay,
	max_accepted_htlcs,
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint,
	htlc_basepoint,
	shutdown_script
});

/// Our latest commitment, carrying the peer's signatures: publishable at any moment.
#[derive(Clone)]
pub struct LocalCommit {
	/// Commitment number, counting up from 0.
	pub index: u64,
	/// The balance/HTLC state it commits to, from our point of view.
	pub spec: CommitmentSpec,
	/// The unsigned commitment transaction (witness filled in only at publish time).
	pub commit_tx: Transaction,
	/// The peer's signature on it.
	pub remote_sig: Signature,
	/// Each non-dust HTLC with the peer's signature for its second-stage transaction, in
	/// commitment output order.
	pub htlcs_and_sigs: Vec<(HTLCOutputInCommitment, Signature)>,
}

impl LocalCommit {
	/// The txid of the commitment transaction.
	pub fn txid(&self) -> Sha256dHash {
		self.commit_tx.txid()
	}
}

impl_writeable!(LocalCommit, { index, spec, commit_tx, remote_sig, htlcs_and_sigs });

/// The latest commitment we signed for the peer. We keep only what is needed to recognize and
/// claim it on chain; the peer holds the transaction itself.
#[derive(Clone)]
pub struct RemoteCommit {
	/// Commitment number, counting up from 0.
	pub index: u64,
	/// The state it commits to, from the PEER's point of view (their to_local is our to_remote).
	pub spec: CommitmentSpec,
	/// Its txid, for classification when the funding output is spent.
	pub txid: Sha256dHash,
	/// The per-commitment point it was built with.
	pub remote_per_commitment_point: PublicKey,
}

impl_writeable!(RemoteCommit, { index, spec, txid, remote_per_commitment_point });

/// Sent a commitment_signed, awaiting the matching revoke_and_ack.
#[derive(Clone)]
pub struct WaitingForRevocation {
	/// The not-yet-revoked-into-effect next remote commitment.
	pub next_remote_commit: RemoteCommit,
	/// The commitment_signed we sent, for retransmission on reconnect.
	pub sent: msgs::CommitmentSigned,
	/// Our local commitment index at the time we signed. On reconnect this decides whether a
	/// lost revoke_and_ack of ours predates the lost commitment_signed or the other way around.
	pub sent_after_local_commit_index: u64,
	/// Set when a sign command arrived while waiting; we sign again as soon as the revocation
	/// lands.
	pub re_sign_asap: bool,
}

impl_writeable!(WaitingForRevocation, { next_remote_commit, sent, sent_after_local_commit_index, re_sign_asap });

/// Either we are waiting for the peer to revoke (and hold the transient next remote commitment),
/// or we hold the per-commitment point to build their next commitment with.
#[derive(Clone)]
pub enum NextRemoteCommitInfo {
	/// An unrevoked commitment_signed is in flight.
	Waiting(WaitingForRevocation),
	/// The peer's next per-commitment point, ready for our next signature.
	Revoked(PublicKey),
}

impl Writeable for NextRemoteCommitInfo {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		match self {
			&NextRemoteCommitInfo::Waiting(ref wait) => {
				0u8.write(writer)?;
				wait.write(writer)
			},
			&NextRemoteCommitInfo::Revoked(ref point) => {
				1u8.write(writer)?;
				point.write(writer)
			},
		}
	}
}
impl<R: Read> Readable<R> for NextRemoteCommitInfo {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable<R>>::read(reader)? {
			0 => NextRemoteCommitInfo::Waiting(Readable::read(reader)?),
			1 => NextRemoteCommitInfo::Revoked(Readable::read(reader)?),
			_ => return Err(DecodeError::InvalidValue),
		})
	}
}

/// Updates we proposed, in the order we sent them.
#[derive(Clone)]
pub struct LocalChanges {
	/// Sent, but not yet included in a commitment_signed we sent.
	pub proposed: Vec<UpdateMessage>,
	/// Included in our latest commitment_signed, awaiting the peer's revocation.
	pub signed: Vec<UpdateMessage>,
	/// Irrevocably in the peer's commitment, not yet in ours.
	pub acked: Vec<UpdateMessage>,
}

impl LocalChanges {
	/// All updates not yet embedded in both commitments.
	pub fn all(&self) -> Vec<UpdateMessage> {
		let mut all = self.proposed.clone();
		all.extend_from_slice(&self.signed);
		all.extend_from_slice(&self.acked);
		all
	}
}

impl_writeable!(LocalChanges, { proposed, signed, acked });

/// Updates the peer proposed, in the order they arrived.
#[derive(Clone)]
pub struct RemoteChanges {
	/// Received, not yet included in any signature.
	pub proposed: Vec<UpdateMessage>,
	/// In our latest commitment (we signed for them by revoking), not yet in the peer's.
	pub acked: Vec<UpdateMessage>,
	/// Included in the commitment_signed we most recently sent, awaiting their revocation.
	pub signed: Vec<UpdateMessage>,
}

impl_writeable!(RemoteChanges, { proposed, acked, signed });

/// Where a locally-offered HTLC came from, consulted when it settles to replay the outcome
/// upstream.
#[derive(Clone, PartialEq, Debug)]
pub enum HtlcOrigin {
	/// We are the payer.
	Local,
	/// Relayed from an upstream channel; the outcome must be replayed there.
	Relayed {
		/// The upstream channel id.
		original_channel_id: [u8; 32],
		/// The HTLC id on the upstream channel.
		original_htlc_id: u64,
		/// The upstream amount (difference with ours is our fee).
		amount_in_msat: u64,
	},
}

impl Writeable for HtlcOrigin {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		match self {
			&HtlcOrigin::Local => 0u8.write(writer),
			&HtlcOrigin::Relayed { ref original_channel_id, ref original_htlc_id, ref amount_in_msat } => {
				1u8.write(writer)?;
				original_channel_id.write(writer)?;
				original_htlc_id.write(writer)?;
				amount_in_msat.write(writer)
			},
		}
	}
}
impl<R: Read> Readable<R> for HtlcOrigin {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable<R>>::read(reader)? {
			0 => HtlcOrigin::Local,
			1 => HtlcOrigin::Relayed {
				original_channel_id: Readable::read(reader)?,
				original_htlc_id: Readable::read(reader)?,
				amount_in_msat: Readable::read(reader)?,
			},
			_ => return Err(DecodeError::InvalidValue),
		})
	}
}

/// How an outbound HTLC of ours was settled by the peer.
pub enum HtlcSettlement {
	/// Fulfilled with this preimage.
	Fulfilled(PaymentPreimage),
	/// Failed with an onion-wrapped reason to relay backwards.
	Failed(msgs::OnionErrorPacket),
	/// Failed as malformed; we must wrap the code ourselves when relaying backwards.
	FailedMalformed([u8; 32], u16),
}

/// What a processed revoke_and_ack irrevocably resolved.
pub struct RevocationOutcome {
	/// Inbound HTLCs now locked in on both commitments, ready to be relayed or accepted.
	pub forwards: Vec<msgs::UpdateAddHTLC>,
	/// Outbound HTLCs of ours which are now irrevocably gone, with their origins and outcomes.
	pub settled: Vec<(HtlcOrigin, msgs::UpdateAddHTLC, HtlcSettlement)>,
	/// A sign command was queued while we waited for this revocation.
	pub re_sign_asap: bool,
}

/// A local command to add an HTLC.
pub struct CmdAddHtlc {
	/// Amount in millisatoshi.
	pub amount_msat: u64,
	/// The payment hash.
	pub payment_hash: PaymentHash,
	/// Absolute expiry height.
	pub cltv_expiry: u32,
	/// The onion to forward, end-to-end opaque.
	pub onion_routing_packet: msgs::OnionPacket,
	/// Where the HTLC came from.
	pub origin: HtlcOrigin,
}

/// The full, persisted bookkeeping of a funded channel.
#[derive(Clone)]
pub struct Commitments {
	/// The channel id (funding-derived; never the temporary one by this point).
	pub channel_id: [u8; 32],
	/// Which commitment format both sides committed to at open.
	pub format: CommitmentFormat,
	/// Whether static_remote_key applies to to_remote outputs.
	pub static_remote_key: bool,
	/// Our parameters.
	pub local_params: LocalParams,
	/// Their parameters.
	pub remote_params: RemoteParams,
	/// The funding outpoint.
	pub funding_txo: OutPoint,
	/// Channel capacity in satoshi.
	pub funding_amount_satoshis: u64,
	/// The commit-number obscuring factor (fixed by the payment basepoints in funder order).
	pub obscure_factor: u64,
	/// Our latest signed commitment.
	pub local_commit: LocalCommit,
	/// Their latest signed commitment.
	pub remote_commit: RemoteCommit,
	/// Our changes log.
	pub local_changes: LocalChanges,
	/// Their changes log.
	pub remote_changes: RemoteChanges,
	/// Id the next HTLC we offer will carry.
	pub local_next_htlc_id: u64,
	/// Id we expect on the next HTLC they offer.
	pub remote_next_htlc_id: u64,
	/// Origins of our outbound HTLCs, by htlc id.
	pub origins: HashMap<u64, HtlcOrigin>,
	/// The in-flight next remote commitment, or their next per-commitment point.
	pub remote_next_commit: NextRemoteCommitInfo,
	/// The HTLC output set of every remote commitment we ever signed, by txid, so a penalty can
	/// claim every output should any revoked one appear on chain.
	pub remote_claimable_htlcs: HashMap<Sha256dHash, Vec<HTLCOutputInCommitment>>,
	/// Every revocation secret they have revealed, compressed.
	pub remote_per_commitment_secrets: RevocationStore,
	/// Preimages we know. Durably stored (as part of this struct) before any fulfill is
	/// acknowledged upstream.
	pub payment_preimages: HashMap<PaymentHash, PaymentPreimage>,
}

impl Commitments {
	// ---- key and script helpers ----

	/// Our funding public key.
	pub fn local_funding_pubkey<T: secp256k1::Signing>(&self, secp_ctx: &Secp256k1<T>) -> PublicKey {
		PublicKey::from_secret_key(secp_ctx, &self.local_params.keys.funding_key)
	}

	/// The 2-of-2 redeemscript of the funding output.
	pub fn funding_redeemscript<T: secp256k1::Signing>(&self, secp_ctx: &Secp256k1<T>) -> Script {
		chan_utils::make_funding_redeemscript(&self.local_funding_pubkey(secp_ctx), &self.remote_params.funding_pubkey)
	}

	/// Keys for a commitment WE broadcast, at the given commitment number.
	pub fn local_tx_keys(&self, secp_ctx: &Secp256k1<secp256k1::All>, commitment_number: u64) -> Result<TxCreationKeys, ChannelError> {
		let point = per_commitment_point(secp_ctx, &self.local_params.keys.commitment_seed, commitment_number);
		TxCreationKeys::new(secp_ctx, &point,
			&PublicKey::from_secret_key(secp_ctx, &self.local_params.keys.delayed_payment_base_key),
			&PublicKey::from_secret_key(secp_ctx, &self.local_params.keys.htlc_base_key),
			&self.remote_params.revocation_basepoint,
			&self.remote_params.payment_basepoint,
			&self.remote_params.htlc_basepoint,
			self.static_remote_key)
			.map_err(|_| ChannelError::Close("Peer provided a bogus basepoint"))
	}

	/// Keys for a commitment THEY broadcast, built from their per-commitment point.
	pub fn remote_tx_keys(&self, secp_ctx: &Secp256k1<secp256k1::All>, remote_per_commitment_point: &PublicKey) -> Result<TxCreationKeys, ChannelError> {
		TxCreationKeys::new(secp_ctx, remote_per_commitment_point,
			&self.remote_params.delayed_payment_basepoint,
			&self.remote_params.htlc_basepoint,
			&PublicKey::from_secret_key(secp_ctx, &self.local_params.keys.revocation_base_key),
			&PublicKey::from_secret_key(secp_ctx, &self.local_params.keys.payment_base_key),
			&PublicKey::from_secret_key(secp_ctx, &self.local_params.keys.htlc_base_key),
			self.static_remote_key)
			.map_err(|_| ChannelError::Close("Peer provided a bogus per-commitment point"))
	}

	// ---- changes-log status ----

	/// True when we have updates the next commitment_signed we send would cover.
	pub fn local_has_changes(&self) -> bool {
		!self.remote_changes.acked.is_empty() || !self.local_changes.proposed.is_empty()
	}

	/// True when the peer has updates a commitment_signed from them would cover.
	pub fn remote_has_changes(&self) -> bool {
		!self.local_changes.acked.is_empty() || !self.remote_changes.proposed.is_empty()
	}

	/// True when updates of ours are still in flight towards both commitments.
	pub fn local_has_unsettled_updates(&self) -> bool {
		!self.local_changes.proposed.is_empty() || !self.local_changes.signed.is_empty() || !self.local_changes.acked.is_empty()
	}

	/// The next remote commitment's spec as it would be if we signed right now: the latest remote
	/// spec with their acked changes and all our proposals applied. This is the view every
	/// outgoing-direction constraint is checked against.
	fn projected_remote_spec(&self, extra: Option<&UpdateMessage>) -> Result<CommitmentSpec, ChannelError> {
		// If a signature is in flight its commitment already embeds our signed batch, so in both
		// cases only the still-proposed updates and their acked ones remain to be applied.
		let base = match self.remote_next_commit {
			NextRemoteCommitInfo::Waiting(ref wait) => &wait.next_remote_commit.spec,
			NextRemoteCommitInfo::Revoked(_) => &self.remote_commit.spec,
		};
		let mut counterparty_changes = self.local_changes.proposed.clone();
		if let Some(update) = extra {
			counterparty_changes.push(update.clone());
		}
		base.reduce(&self.remote_changes.acked, &counterparty_changes)
			.map_err(|_| ChannelError::Close("Commitment spec reduction failed"))
	}

	/// The next local commitment's spec as it would be if the peer signed right now.
	fn projected_local_spec(&self, extra: Option<&UpdateMessage>) -> Result<CommitmentSpec, ChannelError> {
		let mut counterparty_changes = self.remote_changes.proposed.clone();
		if let Some(update) = extra {
			counterparty_changes.push(update.clone());
		}
		self.local_commit.spec.reduce(&self.local_changes.acked, &counterparty_changes)
			.map_err(|_| ChannelError::Close("Commitment spec reduction failed"))
	}

	// ---- availability ----

	/// The amount we can send right now, honoring our reserve, the commit fee with one more
	/// HTLC output, and (as funder) the anchor cost and a feerate-headroom of two HTLC outputs.
	pub fn available_balance_for_send_msat(&self) -> u64 {
		let reduced = match self.projected_remote_spec(None) {
			Ok(spec) => spec,
			Err(_) => return 0,
		};
		// In the remote spec our funds are to_remote.
		let balance_msat = reduced.to_remote_msat;
		let reserve_msat = self.local_params.channel_reserve_satoshis * 1000;
		if self.local_params.is_funder {
			let untrimmed = reduced.untrimmed_htlc_count(self.format, self.remote_params.dust_limit_satoshis);
			let commit_fee = chan_utils::commit_tx_fee(self.format, reduced.feerate_per_kw, untrimmed + 1);
			let anchors = self.format.anchors_cost_satoshis();
			let headroom = 2 * chan_utils::weight2fee(reduced.feerate_per_kw, self.format.htlc_output_weight());
			balance_msat.saturating_sub(reserve_msat)
				.saturating_sub((commit_fee + anchors + headroom) * 1000)
		} else {
			balance_msat.saturating_sub(reserve_msat)
		}
	}

	/// The amount the peer can send us right now; the same formula from their side (they bear
	/// the fees iff they funded the channel).
	pub fn available_balance_for_receive_msat(&self) -> u64 {
		let reduced = match self.projected_local_spec(None) {
			Ok(spec) => spec,
			Err(_) => return 0,
		};
		// In our local spec their funds are to_remote.
		let balance_msat = reduced.to_remote_msat;
		let reserve_msat = self.remote_params.channel_reserve_satoshis * 1000;
		if !self.local_params.is_funder {
			let untrimmed = reduced.untrimmed_htlc_count(self.format, self.local_params.dust_limit_satoshis);
			let commit_fee = chan_utils::commit_tx_fee(self.format, reduced.feerate_per_kw, untrimmed + 1);
			let anchors = self.format.anchors_cost_satoshis();
			let headroom = 2 * chan_utils::weight2fee(reduced.feerate_per_kw, self.format.htlc_output_weight());
			balance_msat.saturating_sub(reserve_msat)
				.saturating_sub((commit_fee + anchors + headroom) * 1000)
		} else {
			balance_msat.saturating_sub(reserve_msat)
		}
	}

	// ---- outgoing updates ----

	/// Adds an outbound HTLC to our proposed changes. Returns the wire message to send; a
	/// commitment_signed must follow eventually.
	pub fn send_add(&mut self, cmd: CmdAddHtlc) -> Result<msgs::UpdateAddHTLC, CommandError> {
		if cmd.amount_msat < self.remote_params.htlc_minimum_msat {
			return Err(CommandError::HtlcValueTooSmall { minimum_msat: self.remote_params.htlc_minimum_msat });
		}

		let available_msat = self.available_balance_for_send_msat();
		if cmd.amount_msat > available_msat {
			return Err(CommandError::InsufficientFunds { amount_msat: cmd.amount_msat, available_msat });
		}

		let reduced = self.projected_remote_spec(None)
			.map_err(|_| CommandError::ChannelUnavailable { err: "Commitment state is inconsistent" })?;
		// In the remote spec our outgoing HTLCs point inward (Received).
		if reduced.htlc_count(HtlcDirection::Received) + 1 > self.remote_params.max_accepted_htlcs as usize {
			return Err(CommandError::TooManyAcceptedHtlcs { maximum: self.remote_params.max_accepted_htlcs });
		}
		if reduced.htlc_value_in_flight_msat(HtlcDirection::Received) + cmd.amount_msat > self.remote_params.max_htlc_value_in_flight_msat {
			return Err(CommandError::HtlcValueTooHighInFlight { maximum_msat: self.remote_params.max_htlc_value_in_flight_msat });
		}

		let add = msgs::UpdateAddHTLC {
			channel_id: self.channel_id,
			htlc_id: self.local_next_htlc_id,
			amount_msat: cmd.amount_msat,
			payment_hash: cmd.payment_hash,
			cltv_expiry: cmd.cltv_expiry,
			onion_routing_packet: cmd.onion_routing_packet,
		};
		self.origins.insert(self.local_next_htlc_id, cmd.origin);
		self.local_next_htlc_id += 1;
		self.local_changes.proposed.push(UpdateMessage::AddHtlc(add.clone()));
		Ok(add)
	}

	/// Handles an inbound update_add_htlc.
	pub fn receive_add(&mut self, msg: msgs::UpdateAddHTLC) -> Result<(), ChannelError> {
		if msg.htlc_id != self.remote_next_htlc_id {
			return Err(ChannelError::Close("Remote skipped an HTLC id"));
		}
		if msg.amount_msat < self.local_params.htlc_minimum_msat {
			return Err(ChannelError::Close("Remote side tried to send less than our minimum HTLC value"));
		}
		if msg.cltv_expiry >= 500000000 {
			return Err(ChannelError::Close("Remote provided CLTV expiry in seconds instead of block height"));
		}
		if msg.amount_msat > self.available_balance_for_receive_msat() {
			return Err(ChannelError::Close("Remote HTLC add would put them under their reserve or fee obligations"));
		}

		let reduced = self.projected_local_spec(None)?;
		if reduced.htlc_count(HtlcDirection::Received) + 1 > self.local_params.max_accepted_htlcs as usize {
			return Err(ChannelError::Close("Remote tried to push more than our max accepted HTLCs"));
		}
		if reduced.htlc_value_in_flight_msat(HtlcDirection::Received) + msg.amount_msat > self.local_params.max_htlc_value_in_flight_msat {
			return Err(ChannelError::Close("Remote HTLC add would put them over our max HTLC value"));
		}

		self.remote_next_htlc_id += 1;
		self.remote_changes.proposed.push(UpdateMessage::AddHtlc(msg));
		Ok(())
	}

	/// Looks up an inbound HTLC which is committed (present in our latest local commitment) and
	/// not already being settled by one of our proposed/signed updates.
	fn settleable_incoming_htlc(&self, htlc_id: u64) -> Result<&DirectedHtlc, CommandError> {
		for updates in [&self.local_changes.proposed[..], &self.local_changes.signed[..], &self.local_changes.acked[..]].iter() {
			for update in updates.iter() {
				match update {
					&UpdateMessage::FulfillHtlc(ref m) if m.htlc_id == htlc_id => return Err(CommandError::UnknownHtlcId { htlc_id }),
					&UpdateMessage::FailHtlc(ref m) if m.htlc_id == htlc_id => return Err(CommandError::UnknownHtlcId { htlc_id }),
					&UpdateMessage::FailMalformedHtlc(ref m) if m.htlc_id == htlc_id => return Err(CommandError::UnknownHtlcId { htlc_id }),
					_ => {},
				}
			}
		}
		match self.local_commit.spec.find_htlc(HtlcDirection::Received, htlc_id) {
			Some(htlc) => Ok(htlc),
			None => Err(CommandError::UnknownHtlcId { htlc_id }),
		}
	}

	/// Fulfills an inbound HTLC. The preimage lands in `payment_preimages` so it survives a
	/// crash and a later unilateral close. Idempotent failure: unknown or already-settled ids
	/// reject the command without touching the channel.
	pub fn send_fulfill(&mut self, htlc_id: u64, preimage: PaymentPreimage) -> Result<msgs::UpdateFulfillHTLC, CommandError> {
		let payment_hash = PaymentHash(Sha256::hash(&preimage.0[..]).into_inner());
		{
			let htlc = self.settleable_incoming_htlc(htlc_id)?;
			if htlc.add.payment_hash != payment_hash {
				return Err(CommandError::UnknownHtlcId { htlc_id });
			}
		}
		self.payment_preimages.insert(payment_hash, preimage);
		let fulfill = msgs::UpdateFulfillHTLC {
			channel_id: self.channel_id,
			htlc_id,
			payment_preimage: preimage,
		};
		self.local_changes.proposed.push(UpdateMessage::FulfillHtlc(fulfill.clone()));
		Ok(fulfill)
	}

	/// Fails an inbound HTLC with an onion-wrapped reason.
	pub fn send_fail(&mut self, htlc_id: u64, reason: msgs::OnionErrorPacket) -> Result<msgs::UpdateFailHTLC, CommandError> {
		self.settleable_incoming_htlc(htlc_id)?;
		let fail = msgs::UpdateFailHTLC {
			channel_id: self.channel_id,
			htlc_id,
			reason,
		};
		self.local_changes.proposed.push(UpdateMessage::FailHtlc(fail.clone()));
		Ok(fail)
	}

	/// Fails an inbound HTLC whose onion we could not even parse.
	pub fn send_fail_malformed(&mut self, htlc_id: u64, sha256_of_onion: [u8; 32], failure_code: u16) -> Result<msgs::UpdateFailMalformedHTLC, CommandError> {
		if failure_code & msgs::BADONION == 0 {
			return Err(CommandError::ChannelUnavailable { err: "fail_malformed requires the BADONION bit" });
		}
		self.settleable_incoming_htlc(htlc_id)?;
		let fail = msgs::UpdateFailMalformedHTLC {
			channel_id: self.channel_id,
			htlc_id,
			sha256_of_onion,
			failure_code,
		};
		self.local_changes.proposed.push(UpdateMessage::FailMalformedHtlc(fail.clone()));
		Ok(fail)
	}

	/// Proposes a feerate change. Only the funder pays the fee, so only the funder may call.
	pub fn send_fee(&mut self, feerate_per_kw: u64) -> Result<msgs::UpdateFee, CommandError> {
		if !self.local_params.is_funder {
			return Err(CommandError::ChannelUnavailable { err: "Only the funder may change the feerate" });
		}
		let msg = msgs::UpdateFee {
			channel_id: self.channel_id,
			feerate_per_kw: feerate_per_kw as u32,
		};
		// The funder must still afford the new fee with all pending changes applied.
		let reduced = self.projected_remote_spec(Some(&UpdateMessage::Fee(msg.clone())))
			.map_err(|_| CommandError::ChannelUnavailable { err: "Commitment state is inconsistent" })?;
		let fee = reduced.commit_tx_fee(self.format, self.remote_params.dust_limit_satoshis) + self.format.anchors_cost_satoshis();
		let our_balance_after_fee_msat = reduced.to_remote_msat.checked_sub(fee * 1000);
		match our_balance_after_fee_msat {
			Some(balance) if balance >= self.local_params.channel_reserve_satoshis * 1000 => {},
			_ => return Err(CommandError::InsufficientFunds {
				amount_msat: fee * 1000,
				available_msat: reduced.to_remote_msat,
			}),
		}
		self.local_changes.proposed.push(UpdateMessage::Fee(msg.clone()));
		Ok(msg)
	}

	// ---- incoming settlement updates ----

	/// Finds one of our outbound HTLCs which the peer may settle: it must be in their commitment
	/// and not already settled by one of their pending updates.
	fn their_settleable_outgoing_htlc(&self, htlc_id: u64) -> Result<&DirectedHtlc, ChannelError> {
		for updates in [&self.remote_changes.proposed[..], &self.remote_changes.acked[..], &self.remote_changes.signed[..]].iter() {
			for update in updates.iter() {
				match update {
					&UpdateMessage::FulfillHtlc(ref m) if m.htlc_id == htlc_id =>
						return Err(ChannelError::Close("Remote tried to settle an HTLC twice")),
					&UpdateMessage::FailHtlc(ref m) if m.htlc_id == htlc_id =>
						return Err(ChannelError::Close("Remote tried to settle an HTLC twice")),
					&UpdateMessage::FailMalformedHtlc(ref m) if m.htlc_id == htlc_id =>
						return Err(ChannelError::Close("Remote tried to settle an HTLC twice")),
					_ => {},
				}
			}
		}
		// From their point of view our HTLC is inbound (Received). They settle against their
		// newest commitment, which may still be awaiting revocation.
		let latest_remote_spec = match self.remote_next_commit {
			NextRemoteCommitInfo::Waiting(ref wait) => &wait.next_remote_commit.spec,
			NextRemoteCommitInfo::Revoked(_) => &self.remote_commit.spec,
		};
		match latest_remote_spec.find_htlc(HtlcDirection::Received, htlc_id) {
			Some(htlc) => Ok(htlc),
			None => Err(ChannelError::Close("Remote tried to fulfill/fail an HTLC we couldn't find")),
		}
	}

	/// Handles an inbound update_fulfill_htlc. Returns the settled HTLC and its origin so the
	/// preimage can be relayed upstream immediately - the preimage is money.
	pub fn receive_fulfill(&mut self, msg: msgs::UpdateFulfillHTLC) -> Result<(HtlcOrigin, msgs::UpdateAddHTLC), ChannelError> {
		let add = {
			let htlc = self.their_settleable_outgoing_htlc(msg.htlc_id)?;
			let payment_hash = PaymentHash(Sha256::hash(&msg.payment_preimage.0[..]).into_inner());
			if htlc.add.payment_hash != payment_hash {
				return Err(ChannelError::Close("Remote tried to fulfill HTLC with an incorrect preimage"));
			}
			htlc.add.clone()
		};
		let origin = self.origins.get(&msg.htlc_id).cloned().unwrap_or(HtlcOrigin::Local);
		self.payment_preimages.insert(add.payment_hash, msg.payment_preimage);
		self.remote_changes.proposed.push(UpdateMessage::FulfillHtlc(msg));
		Ok((origin, add))
	}

	/// Handles an inbound update_fail_htlc. The upstream failure is only replayed once the
	/// removal is irrevocable (see [`Commitments::receive_revocation`]).
	pub fn receive_fail(&mut self, msg: msgs::UpdateFailHTLC) -> Result<(), ChannelError> {
		self.their_settleable_outgoing_htlc(msg.htlc_id)?;
		self.remote_changes.proposed.push(UpdateMessage::FailHtlc(msg));
		Ok(())
	}

	/// Handles an inbound update_fail_malformed_htlc.
	pub fn receive_fail_malformed(&mut self, msg: msgs::UpdateFailMalformedHTLC) -> Result<(), ChannelError> {
		if msg.failure_code & msgs::BADONION == 0 {
			return Err(ChannelError::Close("Got update_fail_malformed_htlc with BADONION not set"));
		}
		self.their_settleable_outgoing_htlc(msg.htlc_id)?;
		self.remote_changes.proposed.push(UpdateMessage::FailMalformedHtlc(msg));
		Ok(())
	}

	/// Handles an inbound update_fee. Tolerance against our own estimate is the caller's
	/// judgement; here we only enforce protocol shape and affordability.
	pub fn receive_fee(&mut self, msg: msgs::UpdateFee) -> Result<(), ChannelError> {
		if self.local_params.is_funder {
			return Err(ChannelError::Close("Non-funder tried to update the channel fee"));
		}
		let reduced = self.projected_local_spec(Some(&UpdateMessage::Fee(msg.clone())))?;
		let fee = reduced.commit_tx_fee(self.format, self.local_params.dust_limit_satoshis) + self.format.anchors_cost_satoshis();
		// The funder is remote here; their balance is to_remote in our spec.
		if reduced.to_remote_msat < (fee + self.remote_params.channel_reserve_satoshis) * 1000 {
			return Err(ChannelError::Close("Funder cannot afford the proposed new fee"));
		}
		self.remote_changes.proposed.push(UpdateMessage::Fee(msg));
		Ok(())
	}

	// ---- the signature dance ----

	/// Signs the peer's next commitment: every change we have proposed plus everything of theirs
	/// we have acked becomes part of it. Must not be called while an earlier signature is
	/// unrevoked - the caller gates on [`NextRemoteCommitInfo`].
	pub fn send_commit(&mut self, secp_ctx: &Secp256k1<secp256k1::All>) -> Result<msgs::CommitmentSigned, ChannelError> {
		let remote_next_point = match self.remote_next_commit {
			NextRemoteCommitInfo::Revoked(point) => point,
			NextRemoteCommitInfo::Waiting(_) => {
				return Err(ChannelError::Ignore("Cannot sign until the previous commitment is revoked"));
			}
		};
		if !self.local_has_changes() {
			return Err(ChannelError::Ignore("Cannot sign without any changes"));
		}

		let spec = self.remote_commit.spec.reduce(&self.remote_changes.acked, &self.local_changes.proposed)
			.map_err(|_| ChannelError::Close("Commitment spec reduction failed"))?;
		let keys = self.remote_tx_keys(secp_ctx, &remote_next_point)?;
		let (commit_tx, htlcs) = chan_utils::build_commitment_tx(
			&self.funding_txo, &keys, &spec, self.format,
			self.remote_commit.index + 1, self.obscure_factor,
			self.remote_params.dust_limit_satoshis,
			// The spec is from their POV: they are the funder iff we are not.
			!self.local_params.is_funder,
			self.local_params.to_self_delay,
			&self.remote_params.funding_pubkey,
			&self.local_funding_pubkey(secp_ctx));

		let commit_txid = commit_tx.txid();
		let funding_redeemscript = self.funding_redeemscript(secp_ctx);
		let commit_sighash = chan_utils::sighash_all(&commit_tx, 0, &funding_redeemscript, self.funding_amount_satoshis);
		let commit_sig = secp_ctx.sign(&commit_sighash, &self.local_params.keys.funding_key);

		let mut htlc_sigs = Vec::new();
		let our_htlc_key = chan_utils::derive_private_key(secp_ctx, &remote_next_point, &self.local_params.keys.htlc_base_key)
			.map_err(|_| ChannelError::Close("Peer provided a bogus per-commitment point"))?;
		for htlc in htlcs.iter() {
			if htlc.transaction_output_index.is_some() {
				let htlc_tx = chan_utils::build_htlc_transaction(&commit_txid, self.format, spec.feerate_per_kw,
					self.local_params.to_self_delay, htlc, &keys.a_delayed_payment_key, &keys.revocation_key);
				let htlc_redeemscript = chan_utils::get_htlc_redeemscript(htlc, &keys);
				let htlc_sighash = chan_utils::sighash(&htlc_tx, 0, &htlc_redeemscript, htlc.amount_msat / 1000,
					self.format.counterparty_htlc_sighash());
				htlc_sigs.push(secp_ctx.sign(&htlc_sighash, &our_htlc_key));
			}
		}

		let msg = msgs::CommitmentSigned {
			channel_id: self.channel_id,
			signature: commit_sig,
			htlc_signatures: htlc_sigs,
		};

		// Both signed lists are necessarily empty here: they only fill while a signature is in
		// flight, and we are gated on remote_next_commit being Revoked.
		debug_assert!(self.local_changes.signed.is_empty());
		debug_assert!(self.remote_changes.signed.is_empty());
		self.local_changes.signed = ::std::mem::replace(&mut self.local_changes.proposed, Vec::new());
		self.remote_changes.signed = ::std::mem::replace(&mut self.remote_changes.acked, Vec::new());
		self.remote_claimable_htlcs.insert(commit_txid, htlcs.iter().filter(|h| h.transaction_output_index.is_some()).cloned().collect());
		self.remote_next_commit = NextRemoteCommitInfo::Waiting(WaitingForRevocation {
			next_remote_commit: RemoteCommit {
				index: self.remote_commit.index + 1,
				spec,
				txid: commit_txid,
				remote_per_commitment_point: remote_next_point,
			},
			sent: msg.clone(),
			sent_after_local_commit_index: self.local_commit.index,
			re_sign_asap: false,
		});
		Ok(msg)
	}

	/// Verifies a commitment_signed from the peer over our next commitment and produces the
	/// matching revoke_and_ack. The caller must have persisted the ledger after this returns and
	/// before the revocation goes on the wire.
	pub fn receive_commit(&mut self, msg: &msgs::CommitmentSigned, secp_ctx: &Secp256k1<secp256k1::All>) -> Result<msgs::RevokeAndACK, ChannelError> {
		if !self.remote_has_changes() {
			return Err(ChannelError::Close("Got commitment signed without any changes"));
		}

		let next_index = self.local_commit.index + 1;
		let spec = self.local_commit.spec.reduce(&self.local_changes.acked, &self.remote_changes.proposed)
			.map_err(|_| ChannelError::Close("Commitment spec reduction failed"))?;
		let keys = self.local_tx_keys(secp_ctx, next_index)?;
		let (commit_tx, htlcs) = chan_utils::build_commitment_tx(
			&self.funding_txo, &keys, &spec, self.format,
			next_index, self.obscure_factor,
			self.local_params.dust_limit_satoshis,
			self.local_params.is_funder,
			self.remote_params.to_self_delay,
			&self.local_funding_pubkey(secp_ctx),
			&self.remote_params.funding_pubkey);

		let commit_txid = commit_tx.txid();
		let funding_redeemscript = self.funding_redeemscript(secp_ctx);
		let commit_sighash = chan_utils::sighash_all(&commit_tx, 0, &funding_redeemscript, self.funding_amount_satoshis);
		secp_ctx.verify(&commit_sighash, &msg.signature, &self.remote_params.funding_pubkey)
			.map_err(|_| ChannelError::Close("Invalid commitment tx signature from peer"))?;

		let mut sorted_htlcs: Vec<&HTLCOutputInCommitment> = htlcs.iter().filter(|h| h.transaction_output_index.is_some()).collect();
		sorted_htlcs.sort_by_key(|h| h.transaction_output_index.unwrap());
		if msg.htlc_signatures.len() != sorted_htlcs.len() {
			return Err(ChannelError::Close("Got wrong number of HTLC signatures from remote"));
		}

		let mut htlcs_and_sigs = Vec::with_capacity(sorted_htlcs.len());
		for (idx, htlc) in sorted_htlcs.iter().enumerate() {
			let htlc_tx = chan_utils::build_htlc_transaction(&commit_txid, self.format, spec.feerate_per_kw,
				self.remote_params.to_self_delay, htlc, &keys.a_delayed_payment_key, &keys.revocation_key);
			let htlc_redeemscript = chan_utils::get_htlc_redeemscript(htlc, &keys);
			let htlc_sighash = chan_utils::sighash(&htlc_tx, 0, &htlc_redeemscript, htlc.amount_msat / 1000,
				self.format.counterparty_htlc_sighash());
			secp_ctx.verify(&htlc_sighash, &msg.htlc_signatures[idx], &keys.b_htlc_key)
				.map_err(|_| ChannelError::Close("Invalid HTLC tx signature from peer"))?;
			htlcs_and_sigs.push(((*htlc).clone(), msg.htlc_signatures[idx].clone()));
		}

		// All verification passed: step the ledger.
		self.local_commit = LocalCommit {
			index: next_index,
			spec,
			commit_tx,
			remote_sig: msg.signature.clone(),
			htlcs_and_sigs,
		};
		self.local_changes.acked.clear();
		let newly_acked = ::std::mem::replace(&mut self.remote_changes.proposed, Vec::new());
		self.remote_changes.acked.extend(newly_acked);

		Ok(msgs::RevokeAndACK {
			channel_id: self.channel_id,
			per_commitment_secret: chan_utils::build_commitment_secret(&self.local_params.keys.commitment_seed, secret_index(next_index - 1)),
			next_per_commitment_point: per_commitment_point(secp_ctx, &self.local_params.keys.commitment_seed, next_index + 1),
		})
	}

	/// Handles the peer's revoke_and_ack: verifies the revealed secret against the commitment it
	/// poisons, stores it, promotes the changes logs, and reports everything that became
	/// irrevocable.
	pub fn receive_revocation(&mut self, msg: &msgs::RevokeAndACK, secp_ctx: &Secp256k1<secp256k1::All>) -> Result<RevocationOutcome, ChannelError> {
		let wait = match self.remote_next_commit {
			NextRemoteCommitInfo::Waiting(ref wait) => wait.clone(),
			NextRemoteCommitInfo::Revoked(_) => {
				return Err(ChannelError::Close("Got a revoke_and_ack when none was expected"));
			}
		};

		let claimed_secret = SecretKey::from_slice(&msg.per_commitment_secret)
			.map_err(|_| ChannelError::Close("Peer provided an invalid per_commitment_secret"))?;
		if PublicKey::from_secret_key(secp_ctx, &claimed_secret) != self.remote_commit.remote_per_commitment_point {
			return Err(ChannelError::Close("Got a revoke commitment secret which didn't correspond to their current pubkey"));
		}
		self.remote_per_commitment_secrets.provide_secret(secret_index(self.remote_commit.index), msg.per_commitment_secret)
			.map_err(|_| ChannelError::Close("Previous secret did not match new one"))?;

		// Everything in the just-revoked batch is now locked in on both sides.
		let mut forwards = Vec::new();
		let mut settled = Vec::new();
		for update in self.remote_changes.signed.iter() {
			match update {
				&UpdateMessage::AddHtlc(ref add) => forwards.push(add.clone()),
				&UpdateMessage::FailHtlc(ref fail) => {
					if let Some(htlc) = self.remote_commit.spec.find_htlc(HtlcDirection::Received, fail.htlc_id) {
						let origin = self.origins.remove(&fail.htlc_id).unwrap_or(HtlcOrigin::Local);
						settled.push((origin, htlc.add.clone(), HtlcSettlement::Failed(fail.reason.clone())));
					}
				},
				&UpdateMessage::FailMalformedHtlc(ref fail) => {
					if let Some(htlc) = self.remote_commit.spec.find_htlc(HtlcDirection::Received, fail.htlc_id) {
						let origin = self.origins.remove(&fail.htlc_id).unwrap_or(HtlcOrigin::Local);
						settled.push((origin, htlc.add.clone(), HtlcSettlement::FailedMalformed(fail.sha256_of_onion, fail.failure_code)));
					}
				},
				&UpdateMessage::FulfillHtlc(ref fulfill) => {
					// Relayed upstream already at receive time; drop the origin now that the
					// removal is irrevocable.
					self.origins.remove(&fulfill.htlc_id);
				},
				&UpdateMessage::Fee(_) => {},
			}
		}

		let newly_acked = ::std::mem::replace(&mut self.local_changes.signed, Vec::new());
		self.local_changes.acked.extend(newly_acked);
		self.remote_changes.signed.clear();
		self.remote_commit = wait.next_remote_commit;
		self.remote_next_commit = NextRemoteCommitInfo::Revoked(msg.next_per_commitment_point);

		Ok(RevocationOutcome {
			forwards,
			settled,
			re_sign_asap: wait.re_sign_asap,
		})
	}

	/// Marks that a sign command arrived while a revocation is outstanding; we sign the moment
	/// it lands.
	pub fn mark_re_sign_asap(&mut self) -> bool {
		if let NextRemoteCommitInfo::Waiting(ref mut wait) = self.remote_next_commit {
			wait.re_sign_asap = true;
			true
		} else {
			false
		}
	}

	// ---- disconnect handling ----

	/// Rolls back every un-signed proposal on both sides, as required after a disconnect: the
	/// peer will do the same and retransmissions restart from the signed state. Returns our
	/// dropped outbound adds so their payments can be failed upstream.
	pub fn discard_unsigned_updates(&mut self) -> Vec<(HtlcOrigin, msgs::UpdateAddHTLC)> {
		let mut dropped = Vec::new();
		let origins = &mut self.origins;
		let mut dropped_local_adds = 0;
		for update in self.local_changes.proposed.drain(..) {
			if let UpdateMessage::AddHtlc(add) = update {
				let origin = origins.remove(&add.htlc_id).unwrap_or(HtlcOrigin::Local);
				dropped_local_adds += 1;
				dropped.push((origin, add));
			}
		}
		self.local_next_htlc_id -= dropped_local_adds;
		let mut dropped_remote_adds = 0;
		for update in self.remote_changes.proposed.drain(..) {
			if let UpdateMessage::AddHtlc(_) = update {
				dropped_remote_adds += 1;
			}
		}
		self.remote_next_htlc_id -= dropped_remote_adds;
		dropped
	}

	// ---- publication ----

	/// Our latest commitment transaction with its witness filled in, ready to broadcast.
	pub fn fully_signed_local_commit_tx(&self, secp_ctx: &Secp256k1<secp256k1::All>) -> Transaction {
		let mut tx = self.local_commit.commit_tx.clone();
		let funding_redeemscript = self.funding_redeemscript(secp_ctx);
		let sighash = chan_utils::sighash_all(&tx, 0, &funding_redeemscript, self.funding_amount_satoshis);
		let our_sig = secp_ctx.sign(&sighash, &self.local_params.keys.funding_key);
		chan_utils::finalize_funding_input(&mut tx, &our_sig, &self.local_commit.remote_sig,
			&self.local_funding_pubkey(secp_ctx), &self.remote_params.funding_pubkey, &funding_redeemscript);
		tx
	}

	/// The second-stage transactions we can publish on top of our own commitment right now:
	/// HTLC-timeout for every offered output (we hold the signature pair already) and
	/// HTLC-success for every received output whose preimage we know.
	pub fn fully_signed_htlc_txs(&self, secp_ctx: &Secp256k1<secp256k1::All>) -> Vec<Transaction> {
		let keys = match self.local_tx_keys(secp_ctx, self.local_commit.index) {
			Ok(keys) => keys,
			Err(_) => return Vec::new(),
		};
		let commit_txid = self.local_commit.txid();
		let mut res = Vec::new();
		for &(ref htlc, ref remote_sig) in self.local_commit.htlcs_and_sigs.iter() {
			let preimage = if htlc.offered {
				None
			} else {
				match self.payment_preimages.get(&htlc.payment_hash) {
					Some(preimage) => Some(*preimage),
					None => continue,
				}
			};
			let mut htlc_tx = chan_utils::build_htlc_transaction(&commit_txid, self.format,
				self.local_commit.spec.feerate_per_kw, self.remote_params.to_self_delay, htlc,
				&keys.a_delayed_payment_key, &keys.revocation_key);
			let htlc_redeemscript = chan_utils::get_htlc_redeemscript(htlc, &keys);
			let htlc_sighash = chan_utils::sighash(&htlc_tx, 0, &htlc_redeemscript, htlc.amount_msat / 1000, SigHashType::All);
			let our_htlc_key = match chan_utils::derive_private_key(secp_ctx, &keys.per_commitment_point, &self.local_params.keys.htlc_base_key) {
				Ok(key) => key,
				Err(_) => continue,
			};
			let our_sig = secp_ctx.sign(&htlc_sighash, &our_htlc_key);
			chan_utils::finalize_htlc_input(&mut htlc_tx, &our_sig, remote_sig,
				self.format.counterparty_htlc_sighash(), &preimage, &htlc_redeemscript);
			res.push(htlc_tx);
		}
		res
	}
}

impl Writeable for Commitments {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		self.channel_id.write(writer)?;
		self.format.write(writer)?;
		self.static_remote_key.write(writer)?;
		self.local_params.write(writer)?;
		self.remote_params.write(writer)?;
		self.funding_txo.write(writer)?;
		self.funding_amount_satoshis.write(writer)?;
		U48(self.obscure_factor).write(writer)?;
		self.local_commit.write(writer)?;
		self.remote_commit.write(writer)?;
		self.local_changes.write(writer)?;
		self.remote_changes.write(writer)?;
		self.local_next_htlc_id.write(writer)?;
		self.remote_next_htlc_id.write(writer)?;
		(self.origins.len() as u16).write(writer)?;
		let mut origin_ids: Vec<&u64> = self.origins.keys().collect();
		origin_ids.sort();
		for htlc_id in origin_ids {
			htlc_id.write(writer)?;
			self.origins[htlc_id].write(writer)?;
		}
		self.remote_next_commit.write(writer)?;
		(self.remote_claimable_htlcs.len() as u16).write(writer)?;
		let mut claimable_txids: Vec<&Sha256dHash> = self.remote_claimable_htlcs.keys().collect();
		claimable_txids.sort();
		for txid in claimable_txids {
			txid.write(writer)?;
			self.remote_claimable_htlcs[txid].write(writer)?;
		}
		self.remote_per_commitment_secrets.write(writer)?;
		(self.payment_preimages.len() as u16).write(writer)?;
		let mut preimages: Vec<&PaymentPreimage> = self.payment_preimages.values().collect();
		preimages.sort_by_key(|p| p.0);
		for preimage in preimages {
			preimage.write(writer)?;
		}
		Ok(())
	}
}

impl<R: Read> Readable<R> for Commitments {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		let channel_id = Readable::read(reader)?;
		let format = Readable::read(reader)?;
		let static_remote_key = Readable::read(reader)?;
		let local_params = Readable::read(reader)?;
		let remote_params = Readable::read(reader)?;
		let funding_txo = Readable::read(reader)?;
		let funding_amount_satoshis = Readable::read(reader)?;
		let obscure_factor = <U48 as Readable<R>>::read(reader)?.0;
		let local_commit = Readable::read(reader)?;
		let remote_commit = Readable::read(reader)?;
		let local_changes = Readable::read(reader)?;
		let remote_changes = Readable::read(reader)?;
		let local_next_htlc_id = Readable::read(reader)?;
		let remote_next_htlc_id = Readable::read(reader)?;
		let origins_len: u16 = Readable::read(reader)?;
		let mut origins = HashMap::with_capacity(origins_len as usize);
		for _ in 0..origins_len {
			origins.insert(Readable::read(reader)?, Readable::read(reader)?);
		}
		let remote_next_commit = Readable::read(reader)?;
		let claimable_len: u16 = Readable::read(reader)?;
		let mut remote_claimable_htlcs = HashMap::with_capacity(claimable_len as usize);
		for _ in 0..claimable_len {
			remote_claimable_htlcs.insert(Readable::read(reader)?, Readable::read(reader)?);
		}
		let remote_per_commitment_secrets = Readable::read(reader)?;
		let preimages_len: u16 = Readable::read(reader)?;
		let mut payment_preimages = HashMap::with_capacity(preimages_len as usize);
		for _ in 0..preimages_len {
			let preimage: PaymentPreimage = Readable::read(reader)?;
			payment_preimages.insert(PaymentHash(Sha256::hash(&preimage.0[..]).into_inner()), preimage);
		}
		Ok(Commitments {
			channel_id,
			format,
			static_remote_key,
			local_params,
			remote_params,
			funding_txo,
			funding_amount_satoshis,
			obscure_factor,
			local_commit,
			remote_commit,
			local_changes,
			remote_changes,
			local_next_htlc_id,
			remote_next_htlc_id,
			origins,
			remote_next_commit,
			remote_claimable_htlcs,
			remote_per_commitment_secrets,
			payment_preimages,
		})
	}
}
