//! The closing engine: once the funding output is spent, classifies the spending transaction
//! (our commitment, their current, their unrevoked-next, any revoked one, the mutual close, or
//! an unknown future state after data loss) and derives the exact set of claim, second-stage and
//! penalty transactions we can and must publish, together with the outpoints to keep watching.
//!
//! Everything is idempotent: rebuilding after a restart re-publishes only what hasn't confirmed
//! and re-arms every watch; a watch that already fired just replays its event.

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{Transaction, TxIn, TxOut, SigHashType};

use bitcoin_hashes::Hash;
use bitcoin_hashes::sha256::Hash as Sha256;
use bitcoin_hashes::sha256d::Hash as Sha256dHash;

use secp256k1::key::{PublicKey, SecretKey};
use secp256k1::Secp256k1;
use secp256k1;

use ln::{PaymentHash, PaymentPreimage};
use ln::chan_utils;
use ln::chan_utils::{CommitmentFormat, HtlcDirection, DirectedHtlc};
use ln::commitments::{Commitments, RemoteCommit, secret_index};
use chain::chaininterface::{PublishRequest, PublishStrategy, WatchRequest, WatchTag};
use chain::transaction::OutPoint;
use util::ser::{Readable, Writeable, Writer};
use util::ser::U48;
use ln::msgs::DecodeError;

use std::collections::HashMap;
use std::io::Read;

// Claim transaction weights, used to deduct a fee from the claimed value. These cover the worst
// case witness sizes for each spend path.
pub(crate) const CLAIM_MAIN_WEIGHT: u64 = 438;
pub(crate) const CLAIM_DELAYED_WEIGHT: u64 = 483;
pub(crate) const CLAIM_HTLC_SUCCESS_WEIGHT: u64 = 571;
pub(crate) const CLAIM_HTLC_TIMEOUT_WEIGHT: u64 = 545;
pub(crate) const MAIN_PENALTY_WEIGHT: u64 = 484;
pub(crate) const HTLC_PENALTY_WEIGHT: u64 = 578;

/// Minimum claim output value; claims worth less than this after fees are left to the miners.
const CLAIM_DUST_LIMIT_SATOSHIS: u64 = 546;

fn claim_skeleton(prev_txid: Sha256dHash, prev_vout: u32, value_sat: u64, sequence: u32, lock_time: u32, destination_script: &Script) -> Transaction {
	Transaction {
		version: 2,
		lock_time,
		input: vec![TxIn {
			previous_output: ::bitcoin::blockdata::transaction::OutPoint { txid: prev_txid, vout: prev_vout },
			script_sig: Script::new(),
			sequence,
			witness: Vec::new(),
		}],
		output: vec![TxOut {
			script_pubkey: destination_script.clone(),
			value: value_sat,
		}],
	}
}

fn claimed_value(input_value_sat: u64, feerate_per_kw: u64, weight: u64) -> Option<u64> {
	let fee = chan_utils::weight2fee(feerate_per_kw, weight);
	match input_value_sat.checked_sub(fee) {
		Some(value) if value >= CLAIM_DUST_LIMIT_SATOSHIS => Some(value),
		_ => None,
	}
}

/// What an on-chain event resolved for an HTLC we were party to. The channel maps these to
/// upstream fulfill/fail commands through its origin table.
pub enum OnchainSettlement {
	/// A preimage appeared in a witness; the matching inbound HTLC can be fulfilled upstream
	/// immediately.
	Fulfilled {
		/// The payment hash the preimage matches.
		payment_hash: PaymentHash,
		/// The extracted preimage.
		payment_preimage: PaymentPreimage,
	},
	/// An HTLC's timeout path confirmed deep enough (or it was trimmed and can never reach the
	/// chain); fail it upstream.
	Failed {
		/// The payment hash of the failed HTLC.
		payment_hash: PaymentHash,
	},
}

/// Our own commitment hit the chain (force-close or their broadcast of it is impossible - only
/// we hold it signed).
pub struct LocalCommitPublished {
	/// The fully signed commitment transaction.
	pub commit_tx: Transaction,
	/// Our anchor output on it, for CPFP fee-bumping, in anchor format.
	pub anchor_outpoint: Option<OutPoint>,
	/// Claim of our main output, valid after to_self_delay.
	pub claim_main_delayed_tx: Option<Transaction>,
	/// HTLC-timeout (offered) and HTLC-success (received + known preimage) transactions; we hold
	/// the counterparty signature pair for each already.
	pub htlc_txs: Vec<Transaction>,
	/// Third-stage claims of confirmed HTLC transactions' delayed outputs, built as those
	/// confirm.
	pub claim_htlc_delayed_txs: Vec<Transaction>,
	/// All HTLCs of the published commitment (including trimmed ones), for settlement tracking.
	pub htlcs: Vec<DirectedHtlc>,
	/// Outpoints of this closing branch spent by a confirmed transaction, with the spender.
	pub irrevocably_spent: HashMap<OutPoint, Sha256dHash>,
}

impl_writeable!(LocalCommitPublished, { commit_tx, anchor_outpoint, claim_main_delayed_tx, htlc_txs, claim_htlc_delayed_txs, htlcs, irrevocably_spent });

/// A commitment held by the peer hit the chain: either their latest, or the signed-but-unrevoked
/// next one.
pub struct RemoteCommitPublished {
	/// The commitment txid we matched.
	pub txid: Sha256dHash,
	/// Claim of our (undelayed) main output. None when the value is dust or the claim is left to
	/// the wallet under static_remote_key.
	pub claim_main_tx: Option<Transaction>,
	/// Claims, by preimage, of HTLC outputs they offered us.
	pub claim_htlc_success_txs: Vec<Transaction>,
	/// Claims, after expiry, of HTLC outputs we offered them.
	pub claim_htlc_timeout_txs: Vec<Transaction>,
	/// All HTLCs of the published commitment from THEIR point of view, for settlement tracking.
	pub htlcs: Vec<DirectedHtlc>,
	/// Outpoints of this closing branch spent by a confirmed transaction, with the spender.
	pub irrevocably_spent: HashMap<OutPoint, Sha256dHash>,
}

impl_writeable!(RemoteCommitPublished, { txid, claim_main_tx, claim_htlc_success_txs, claim_htlc_timeout_txs, htlcs, irrevocably_spent });

/// The local anchor outpoint of a commitment transaction, for CPFP fee-bumping, if the
/// commitment has one.
fn local_anchor_outpoint<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, commitments: &Commitments, commit_tx: &Transaction) -> Option<OutPoint> {
	if commitments.format != CommitmentFormat::AnchorOutputs {
		return None;
	}
	let anchor_script = chan_utils::get_anchor_redeemscript(&commitments.local_funding_pubkey(secp_ctx)).to_v0_p2wsh();
	for (idx, outp) in commit_tx.output.iter().enumerate() {
		if outp.script_pubkey == anchor_script {
			return Some(OutPoint::new(commit_tx.txid(), idx as u16));
		}
	}
	None
}

/// A REVOKED commitment of theirs hit the chain. Every output is ours for the taking with the
/// revocation key.
pub struct RevokedCommitPublished {
	/// The revoked commitment txid.
	pub txid: Sha256dHash,
	/// The commitment number it carried (recovered from sequence/locktime).
	pub commitment_number: u64,
	/// Claim of our own main output, as for any remote commitment.
	pub claim_main_tx: Option<Transaction>,
	/// The punishment spend of their main output.
	pub main_penalty_tx: Option<Transaction>,
	/// One punishment spend per HTLC output.
	pub htlc_penalty_txs: Vec<Transaction>,
	/// Punishment spends of any second-stage HTLC transaction they manage to confirm first.
	pub claim_htlc_delayed_penalty_txs: Vec<Transaction>,
	/// Outpoints of this closing branch spent by a confirmed transaction, with the spender.
	pub irrevocably_spent: HashMap<OutPoint, Sha256dHash>,
}

impl Writeable for RevokedCommitPublished {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		self.txid.write(writer)?;
		U48(self.commitment_number).write(writer)?;
		self.claim_main_tx.write(writer)?;
		self.main_penalty_tx.write(writer)?;
		self.htlc_penalty_txs.write(writer)?;
		self.claim_htlc_delayed_penalty_txs.write(writer)?;
		self.irrevocably_spent.write(writer)
	}
}
impl<R: Read> Readable<R> for RevokedCommitPublished {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(RevokedCommitPublished {
			txid: Readable::read(reader)?,
			commitment_number: <U48 as Readable<R>>::read(reader)?.0,
			claim_main_tx: Readable::read(reader)?,
			main_penalty_tx: Readable::read(reader)?,
			htlc_penalty_txs: Readable::read(reader)?,
			claim_htlc_delayed_penalty_txs: Readable::read(reader)?,
			irrevocably_spent: Readable::read(reader)?,
		})
	}
}

/// An unknown commitment spent the funding output: a state from the future, which means WE lost
/// data. We can only claim our main output; the HTLC set is unknowable.
pub struct FutureRemoteCommitPublished {
	/// The commitment txid.
	pub txid: Sha256dHash,
	/// Claim of our main output, derived from the per-commitment point the peer proved during
	/// reestablish (or None before they did, or under static_remote_key where it's wallet-native
	/// anyway).
	pub claim_main_tx: Option<Transaction>,
	/// Outpoints of this closing branch spent by a confirmed transaction, with the spender.
	pub irrevocably_spent: HashMap<OutPoint, Sha256dHash>,
}

impl_writeable!(FutureRemoteCommitPublished, { txid, claim_main_tx, irrevocably_spent });

/// The aggregate closing progress of a channel whose funding output has been spent (or which
/// negotiated a mutual close and is waiting for it to confirm). More than one branch can be live
/// at once while competing spends fight for confirmation; confirmation of the funding spend
/// collapses it to one.
pub struct ClosingState {
	/// The negotiated mutual close transaction, if that is how we got here.
	pub mutual_close_tx: Option<Transaction>,
	/// Live local-commit branch.
	pub local_commit_published: Option<LocalCommitPublished>,
	/// Live remote-commit branch.
	pub remote_commit_published: Option<RemoteCommitPublished>,
	/// Live next-remote-commit branch (they published the commitment we signed but they never
	/// revoked the old one for).
	pub next_remote_commit_published: Option<RemoteCommitPublished>,
	/// Live revoked branches (a determined cheater can publish several over time... no, only one
	/// can spend the funding output, but we keep a list to stay shape-compatible with watch
	/// replays).
	pub revoked_commit_published: Vec<RevokedCommitPublished>,
	/// Live future-remote branch after data loss.
	pub future_remote_commit_published: Option<FutureRemoteCommitPublished>,
	/// Heights at which relevant txids confirmed at their requested depth.
	pub confirmed: HashMap<Sha256dHash, u32>,
}

impl_writeable!(ClosingState, {
	mutual_close_tx,
	local_commit_published,
	remote_commit_published,
	next_remote_commit_published,
	revoked_commit_published,
	future_remote_commit_published,
	confirmed
});

impl ClosingState {
	/// An empty closing state; branches attach as spends are classified.
	pub fn new() -> Self {
		ClosingState {
			mutual_close_tx: None,
			local_commit_published: None,
			remote_commit_published: None,
			next_remote_commit_published: None,
			revoked_commit_published: Vec::new(),
			future_remote_commit_published: None,
			confirmed: HashMap::new(),
		}
	}

	/// Every transaction this closing state wants on the chain, skipping already-confirmed ones.
	/// Re-publishing a confirmed transaction would be a no-op anyway; skipping keeps restarts
	/// quiet.
	pub fn publish_requests(&self) -> Vec<PublishRequest> {
		let mut requests: Vec<PublishRequest> = Vec::new();
		{
			let mut push = |tx: &Transaction, strategy: PublishStrategy| {
				if !self.confirmed.contains_key(&tx.txid()) {
					requests.push(PublishRequest { tx: tx.clone(), strategy });
				}
			};
			if let Some(ref tx) = self.mutual_close_tx {
				push(tx, PublishStrategy::JustPublish);
			}
			if let Some(ref lcp) = self.local_commit_published {
				// The commitment itself may need a CPFP bump in anchor format; everything else
				// carries its own fee.
				let strategy = match lcp.anchor_outpoint {
					Some(anchor_outpoint) => PublishStrategy::CpfpAnchor {
						anchor_outpoint,
						parent_weight: lcp.commit_tx.get_weight() as u64,
					},
					None => PublishStrategy::JustPublish,
				};
				push(&lcp.commit_tx, strategy);
				for tx in lcp.claim_main_delayed_tx.iter().chain(lcp.htlc_txs.iter()).chain(lcp.claim_htlc_delayed_txs.iter()) {
					push(tx, PublishStrategy::JustPublish);
				}
			}
			for rcp in self.remote_commit_published.iter().chain(self.next_remote_commit_published.iter()) {
				for tx in rcp.claim_main_tx.iter().chain(rcp.claim_htlc_success_txs.iter()).chain(rcp.claim_htlc_timeout_txs.iter()) {
					push(tx, PublishStrategy::JustPublish);
				}
			}
			for rvk in self.revoked_commit_published.iter() {
				for tx in rvk.claim_main_tx.iter().chain(rvk.main_penalty_tx.iter()).chain(rvk.htlc_penalty_txs.iter()).chain(rvk.claim_htlc_delayed_penalty_txs.iter()) {
					push(tx, PublishStrategy::JustPublish);
				}
			}
			if let Some(ref fut) = self.future_remote_commit_published {
				for tx in fut.claim_main_tx.iter() {
					push(tx, PublishStrategy::JustPublish);
				}
			}
		}
		requests
	}

	/// Every watch this closing state needs armed: confirmation of each transaction we publish,
	/// and spend notification on each output someone else may race us for.
	pub fn watch_requests(&self, min_depth: u32) -> Vec<WatchRequest> {
		let mut watches = Vec::new();
		if let Some(ref tx) = self.mutual_close_tx {
			watches.push(WatchRequest::Confirmed { txid: tx.txid(), min_depth, tag: WatchTag::MutualCloseConfirmed });
		}
		if let Some(ref lcp) = self.local_commit_published {
			watches.push(WatchRequest::Confirmed { txid: lcp.commit_tx.txid(), min_depth, tag: WatchTag::CommitConfirmed });
			let commit_txid = lcp.commit_tx.txid();
			for (idx, _) in lcp.commit_tx.output.iter().enumerate() {
				watches.push(WatchRequest::Spent { outpoint: OutPoint::new(commit_txid, idx as u16), tag: WatchTag::CommitOutputSpent });
			}
			for tx in lcp.htlc_txs.iter().chain(lcp.claim_htlc_delayed_txs.iter()).chain(lcp.claim_main_delayed_tx.iter()) {
				watches.push(WatchRequest::Confirmed { txid: tx.txid(), min_depth, tag: WatchTag::ClaimConfirmed });
			}
			for tx in lcp.htlc_txs.iter() {
				watches.push(WatchRequest::Spent { outpoint: OutPoint::new(tx.txid(), 0), tag: WatchTag::HtlcOutputSpent });
			}
		}
		for rcp in self.remote_commit_published.iter().chain(self.next_remote_commit_published.iter()) {
			watches.push(WatchRequest::Confirmed { txid: rcp.txid, min_depth, tag: WatchTag::CommitConfirmed });
			for tx in rcp.claim_main_tx.iter().chain(rcp.claim_htlc_success_txs.iter()).chain(rcp.claim_htlc_timeout_txs.iter()) {
				watches.push(WatchRequest::Confirmed { txid: tx.txid(), min_depth, tag: WatchTag::ClaimConfirmed });
				watches.push(WatchRequest::Spent { outpoint: OutPoint::new(rcp.txid, tx.input[0].previous_output.vout as u16), tag: WatchTag::CommitOutputSpent });
			}
		}
		for rvk in self.revoked_commit_published.iter() {
			watches.push(WatchRequest::Confirmed { txid: rvk.txid, min_depth, tag: WatchTag::CommitConfirmed });
			for tx in rvk.claim_main_tx.iter().chain(rvk.main_penalty_tx.iter()).chain(rvk.htlc_penalty_txs.iter()).chain(rvk.claim_htlc_delayed_penalty_txs.iter()) {
				watches.push(WatchRequest::Confirmed { txid: tx.txid(), min_depth, tag: WatchTag::ClaimConfirmed });
			}
			for tx in rvk.main_penalty_tx.iter().chain(rvk.htlc_penalty_txs.iter()) {
				watches.push(WatchRequest::Spent { outpoint: OutPoint::new(rvk.txid, tx.input[0].previous_output.vout as u16), tag: WatchTag::CommitOutputSpent });
			}
		}
		if let Some(ref fut) = self.future_remote_commit_published {
			watches.push(WatchRequest::Confirmed { txid: fut.txid, min_depth, tag: WatchTag::CommitConfirmed });
			if let Some(ref tx) = fut.claim_main_tx {
				watches.push(WatchRequest::Confirmed { txid: tx.txid(), min_depth, tag: WatchTag::ClaimConfirmed });
			}
		}
		watches
	}

	/// Records a deep confirmation. Returns true if this closing is now fully resolved (every
	/// transaction we were pushing is confirmed, or its output was taken by a competing spend we
	/// have recorded).
	pub fn on_tx_confirmed(&mut self, txid: Sha256dHash, height: u32) -> bool {
		self.confirmed.insert(txid, height);
		self.is_done()
	}

	fn branch_done(confirmed: &HashMap<Sha256dHash, u32>, irrevocably_spent: &HashMap<OutPoint, Sha256dHash>, txs: &[&Transaction]) -> bool {
		txs.iter().all(|tx| {
			confirmed.contains_key(&tx.txid())
				|| irrevocably_spent.contains_key(&OutPoint::new(tx.input[0].previous_output.txid, tx.input[0].previous_output.vout as u16))
		})
	}

	/// Whether every claim this closing needs has landed.
	pub fn is_done(&self) -> bool {
		if let Some(ref tx) = self.mutual_close_tx {
			return self.confirmed.contains_key(&tx.txid());
		}
		if let Some(ref lcp) = self.local_commit_published {
			if !self.confirmed.contains_key(&lcp.commit_tx.txid()) {
				return false;
			}
			let mut txs: Vec<&Transaction> = Vec::new();
			txs.extend(lcp.claim_main_delayed_tx.iter());
			txs.extend(lcp.htlc_txs.iter());
			txs.extend(lcp.claim_htlc_delayed_txs.iter());
			return Self::branch_done(&self.confirmed, &lcp.irrevocably_spent, &txs);
		}
		for rcp in self.remote_commit_published.iter().chain(self.next_remote_commit_published.iter()) {
			if !self.confirmed.contains_key(&rcp.txid) {
				return false;
			}
			let mut txs: Vec<&Transaction> = Vec::new();
			txs.extend(rcp.claim_main_tx.iter());
			txs.extend(rcp.claim_htlc_success_txs.iter());
			txs.extend(rcp.claim_htlc_timeout_txs.iter());
			return Self::branch_done(&self.confirmed, &rcp.irrevocably_spent, &txs);
		}
		for rvk in self.revoked_commit_published.iter() {
			if !self.confirmed.contains_key(&rvk.txid) {
				return false;
			}
			let mut txs: Vec<&Transaction> = Vec::new();
			txs.extend(rvk.claim_main_tx.iter());
			txs.extend(rvk.main_penalty_tx.iter());
			txs.extend(rvk.htlc_penalty_txs.iter());
			txs.extend(rvk.claim_htlc_delayed_penalty_txs.iter());
			return Self::branch_done(&self.confirmed, &rvk.irrevocably_spent, &txs);
		}
		if let Some(ref fut) = self.future_remote_commit_published {
			if !self.confirmed.contains_key(&fut.txid) {
				return false;
			}
			if let Some(ref tx) = fut.claim_main_tx {
				return self.confirmed.contains_key(&tx.txid());
			}
			return true;
		}
		false
	}
}

/// Extracts candidate payment preimages from a transaction's witnesses: any 32-byte push whose
/// SHA256 matches one of the given pending payment hashes.
pub fn extract_preimages(tx: &Transaction, pending_hashes: &[PaymentHash]) -> Vec<OnchainSettlement> {
	let mut settlements = Vec::new();
	for input in tx.input.iter() {
		for item in input.witness.iter() {
			if item.len() == 32 {
				let mut preimage = [0; 32];
				preimage.copy_from_slice(item);
				let hash = PaymentHash(Sha256::hash(&preimage).into_inner());
				if pending_hashes.contains(&hash) {
					settlements.push(OnchainSettlement::Fulfilled {
						payment_hash: hash,
						payment_preimage: PaymentPreimage(preimage),
					});
				}
			}
		}
	}
	settlements
}

// ---- branch builders ----

fn sign_claim_input<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, tx: &mut Transaction, redeemscript: &Script, value_sat: u64, key: &SecretKey, extra_witness_item: Option<Vec<u8>>) {
	let sighash = chan_utils::sighash(tx, 0, redeemscript, value_sat, SigHashType::All);
	let sig = secp_ctx.sign(&sighash, key);
	tx.input[0].witness.push(sig.serialize_der().to_vec());
	tx.input[0].witness[0].push(SigHashType::All as u8);
	if let Some(item) = extra_witness_item {
		tx.input[0].witness.push(item);
	}
	tx.input[0].witness.push(redeemscript.to_bytes());
}

impl LocalCommitPublished {
	/// Builds the full local-close branch from the current ledger state.
	pub fn build(commitments: &Commitments, secp_ctx: &Secp256k1<secp256k1::All>, destination_script: &Script, claim_feerate_per_kw: u64) -> LocalCommitPublished {
		let commit_tx = commitments.fully_signed_local_commit_tx(secp_ctx);
		let commit_txid = commit_tx.txid();
		let htlc_txs = commitments.fully_signed_htlc_txs(secp_ctx);

		let mut claim_main_delayed_tx = None;
		if let Ok(keys) = commitments.local_tx_keys(secp_ctx, commitments.local_commit.index) {
			let to_self_delay = commitments.remote_params.to_self_delay;
			let revokeable_script = chan_utils::get_revokeable_redeemscript(&keys.revocation_key, to_self_delay, &keys.a_delayed_payment_key);
			let revokeable_p2wsh = revokeable_script.to_v0_p2wsh();
			for (idx, outp) in commit_tx.output.iter().enumerate() {
				if outp.script_pubkey == revokeable_p2wsh {
					if let Some(value) = claimed_value(outp.value, claim_feerate_per_kw, CLAIM_DELAYED_WEIGHT) {
						let mut tx = claim_skeleton(commit_txid, idx as u32, value, to_self_delay as u32, 0, destination_script);
						if let Ok(delayed_key) = chan_utils::derive_private_key(secp_ctx, &keys.per_commitment_point, &commitments.local_params.keys.delayed_payment_base_key) {
							sign_claim_input(secp_ctx, &mut tx, &revokeable_script, outp.value, &delayed_key, Some(Vec::new()));
							claim_main_delayed_tx = Some(tx);
						}
					}
					break; // There can only be one of these
				}
			}
		}

		let anchor_outpoint = local_anchor_outpoint(secp_ctx, commitments, &commit_tx);
		LocalCommitPublished {
			commit_tx,
			anchor_outpoint,
			claim_main_delayed_tx,
			htlc_txs,
			claim_htlc_delayed_txs: Vec::new(),
			htlcs: commitments.local_commit.spec.htlcs.clone(),
			irrevocably_spent: HashMap::new(),
		}
	}

	/// One of our second-stage HTLC transactions confirmed; builds the third-stage claim of its
	/// delayed output.
	pub fn on_htlc_tx_confirmed(&mut self, commitments: &Commitments, secp_ctx: &Secp256k1<secp256k1::All>, destination_script: &Script, claim_feerate_per_kw: u64, htlc_tx: &Transaction) {
		if !self.htlc_txs.iter().any(|tx| tx.txid() == htlc_tx.txid()) {
			return;
		}
		if self.claim_htlc_delayed_txs.iter().any(|tx| tx.input[0].previous_output.txid == htlc_tx.txid()) {
			return;
		}
		if let Ok(keys) = commitments.local_tx_keys(secp_ctx, commitments.local_commit.index) {
			let to_self_delay = commitments.remote_params.to_self_delay;
			let revokeable_script = chan_utils::get_revokeable_redeemscript(&keys.revocation_key, to_self_delay, &keys.a_delayed_payment_key);
			let value_in = htlc_tx.output[0].value;
			if let Some(value) = claimed_value(value_in, claim_feerate_per_kw, CLAIM_DELAYED_WEIGHT) {
				let mut tx = claim_skeleton(htlc_tx.txid(), 0, value, to_self_delay as u32, 0, destination_script);
				if let Ok(delayed_key) = chan_utils::derive_private_key(secp_ctx, &keys.per_commitment_point, &commitments.local_params.keys.delayed_payment_base_key) {
					sign_claim_input(secp_ctx, &mut tx, &revokeable_script, value_in, &delayed_key, Some(Vec::new()));
					self.claim_htlc_delayed_txs.push(tx);
				}
			}
		}
	}
}

impl RemoteCommitPublished {
	/// Builds the remote-close branch for the given (current or signed-next) remote commitment.
	pub fn build(commitments: &Commitments, remote_commit: &RemoteCommit, secp_ctx: &Secp256k1<secp256k1::All>, destination_script: &Script, claim_feerate_per_kw: u64) -> Result<RemoteCommitPublished, ()> {
		let keys = commitments.remote_tx_keys(secp_ctx, &remote_commit.remote_per_commitment_point).map_err(|_| ())?;
		// Reproduce their commitment to locate the outputs.
		let (commit_tx, htlc_outputs) = chan_utils::build_commitment_tx(
			&commitments.funding_txo, &keys, &remote_commit.spec, commitments.format,
			remote_commit.index, commitments.obscure_factor,
			commitments.remote_params.dust_limit_satoshis,
			!commitments.local_params.is_funder,
			commitments.local_params.to_self_delay,
			&commitments.remote_params.funding_pubkey,
			&commitments.local_funding_pubkey(secp_ctx));
		let txid = commit_tx.txid();
		debug_assert_eq!(txid, remote_commit.txid);

		// Our main output on their commitment.
		let mut claim_main_tx = None;
		let our_payment_key = if commitments.static_remote_key {
			commitments.local_params.keys.payment_base_key.clone()
		} else {
			chan_utils::derive_private_key(secp_ctx, &remote_commit.remote_per_commitment_point, &commitments.local_params.keys.payment_base_key).map_err(|_| ())?
		};
		let to_remote_script = chan_utils::get_to_remote_script(commitments.format, &keys.b_payment_key);
		for (idx, outp) in commit_tx.output.iter().enumerate() {
			if outp.script_pubkey == to_remote_script {
				if let Some(value) = claimed_value(outp.value, claim_feerate_per_kw, CLAIM_MAIN_WEIGHT) {
					let sequence = match commitments.format {
						CommitmentFormat::Legacy => 0xffffffff,
						CommitmentFormat::AnchorOutputs => 1,
					};
					let mut tx = claim_skeleton(txid, idx as u32, value, sequence, 0, destination_script);
					match commitments.format {
						CommitmentFormat::Legacy => {
							// P2WPKH spend: signature then pubkey, no script push.
							let sighash = {
								// The implicit P2WPKH script code.
								let script_code = ::bitcoin::blockdata::script::Builder::new()
									.push_opcode(::bitcoin::blockdata::opcodes::all::OP_DUP)
									.push_opcode(::bitcoin::blockdata::opcodes::all::OP_HASH160)
									.push_slice(&::bitcoin_hashes::hash160::Hash::hash(&keys.b_payment_key.serialize())[..])
									.push_opcode(::bitcoin::blockdata::opcodes::all::OP_EQUALVERIFY)
									.push_opcode(::bitcoin::blockdata::opcodes::all::OP_CHECKSIG)
									.into_script();
								chan_utils::sighash(&tx, 0, &script_code, outp.value, SigHashType::All)
							};
							let sig = secp_ctx.sign(&sighash, &our_payment_key);
							tx.input[0].witness.push(sig.serialize_der().to_vec());
							tx.input[0].witness[0].push(SigHashType::All as u8);
							tx.input[0].witness.push(keys.b_payment_key.serialize().to_vec());
						},
						CommitmentFormat::AnchorOutputs => {
							let witness_script = ::bitcoin::blockdata::script::Builder::new()
								.push_slice(&keys.b_payment_key.serialize())
								.push_opcode(::bitcoin::blockdata::opcodes::all::OP_CHECKSIGVERIFY)
								.push_int(1)
								.push_opcode(::bitcoin::blockdata::opcodes::OP_CSV)
								.into_script();
							sign_claim_input(secp_ctx, &mut tx, &witness_script, outp.value, &our_payment_key, None);
						},
					}
					claim_main_tx = Some(tx);
				}
				break;
			}
		}

		// HTLC outputs: preimage claims for what they offered us, timeout claims for what we
		// offered them. All direct spends of the commitment, no second stage on their side.
		let our_htlc_key = chan_utils::derive_private_key(secp_ctx, &remote_commit.remote_per_commitment_point, &commitments.local_params.keys.htlc_base_key).map_err(|_| ())?;
		let mut claim_htlc_success_txs = Vec::new();
		let mut claim_htlc_timeout_txs = Vec::new();
		for htlc in htlc_outputs.iter() {
			let output_index = match htlc.transaction_output_index {
				Some(idx) => idx,
				None => continue,
			};
			let value_in = htlc.amount_msat / 1000;
			let redeemscript = chan_utils::get_htlc_redeemscript(htlc, &keys);
			if htlc.offered {
				// Offered by THEM: ours on preimage.
				if let Some(preimage) = commitments.payment_preimages.get(&htlc.payment_hash) {
					if let Some(value) = claimed_value(value_in, claim_feerate_per_kw, CLAIM_HTLC_SUCCESS_WEIGHT) {
						let mut tx = claim_skeleton(txid, output_index, value, 0xffffffff, 0, destination_script);
						sign_claim_input(secp_ctx, &mut tx, &redeemscript, value_in, &our_htlc_key, Some(preimage.0.to_vec()));
						claim_htlc_success_txs.push(tx);
					}
				}
			} else {
				// Offered by US: ours at expiry.
				if let Some(value) = claimed_value(value_in, claim_feerate_per_kw, CLAIM_HTLC_TIMEOUT_WEIGHT) {
					let mut tx = claim_skeleton(txid, output_index, value, 0xfffffffd, htlc.cltv_expiry, destination_script);
					sign_claim_input(secp_ctx, &mut tx, &redeemscript, value_in, &our_htlc_key, Some(Vec::new()));
					claim_htlc_timeout_txs.push(tx);
				}
			}
		}

		Ok(RemoteCommitPublished {
			txid,
			claim_main_tx,
			claim_htlc_success_txs,
			claim_htlc_timeout_txs,
			htlcs: remote_commit.spec.htlcs.clone(),
			irrevocably_spent: HashMap::new(),
		})
	}
}

impl RevokedCommitPublished {
	/// Builds the penalty branch for a revoked remote commitment. Returns Err if the revealed
	/// secrets don't cover the commitment number the transaction claims - in which case it is
	/// not revoked but a future state.
	pub fn build(commitments: &Commitments, tx: &Transaction, secp_ctx: &Secp256k1<secp256k1::All>, destination_script: &Script, claim_feerate_per_kw: u64) -> Result<RevokedCommitPublished, ()> {
		let txid = tx.txid();
		let commitment_number = chan_utils::decode_commitment_number(tx.input[0].sequence, tx.lock_time, commitments.obscure_factor);
		if commitment_number >= (1 << 48) {
			return Err(());
		}
		let secret_bytes = match commitments.remote_per_commitment_secrets.get_secret(secret_index(commitment_number)) {
			Some(secret) => secret,
			None => return Err(()),
		};
		let per_commitment_secret = SecretKey::from_slice(&secret_bytes).map_err(|_| ())?;
		let per_commitment_point = PublicKey::from_secret_key(secp_ctx, &per_commitment_secret);

		let revocation_key = chan_utils::derive_private_revocation_key(secp_ctx, &per_commitment_secret, &commitments.local_params.keys.revocation_base_key).map_err(|_| ())?;
		let revocation_pubkey = PublicKey::from_secret_key(secp_ctx, &revocation_key);
		let their_delayed_key = chan_utils::derive_public_key(secp_ctx, &per_commitment_point, &commitments.remote_params.delayed_payment_basepoint).map_err(|_| ())?;
		let their_htlc_key = chan_utils::derive_public_key(secp_ctx, &per_commitment_point, &commitments.remote_params.htlc_basepoint).map_err(|_| ())?;
		let our_htlc_key = chan_utils::derive_public_key(secp_ctx, &per_commitment_point, &PublicKey::from_secret_key(secp_ctx, &commitments.local_params.keys.htlc_base_key)).map_err(|_| ())?;

		// Their main output, spent with the revocation key.
		let mut main_penalty_tx = None;
		let revokeable_script = chan_utils::get_revokeable_redeemscript(&revocation_pubkey, commitments.local_params.to_self_delay, &their_delayed_key);
		let revokeable_p2wsh = revokeable_script.to_v0_p2wsh();
		for (idx, outp) in tx.output.iter().enumerate() {
			if outp.script_pubkey == revokeable_p2wsh {
				if let Some(value) = claimed_value(outp.value, claim_feerate_per_kw, MAIN_PENALTY_WEIGHT) {
					let mut penalty = claim_skeleton(txid, idx as u32, value, 0xfffffffd, 0, destination_script);
					sign_claim_input(secp_ctx, &mut penalty, &revokeable_script, outp.value, &revocation_key, Some(vec![1]));
					main_penalty_tx = Some(penalty);
				}
				break;
			}
		}

		// Our own main output, same as any remote close.
		let mut claim_main_tx = None;
		let our_payment_pubkey = if commitments.static_remote_key {
			PublicKey::from_secret_key(secp_ctx, &commitments.local_params.keys.payment_base_key)
		} else {
			chan_utils::derive_public_key(secp_ctx, &per_commitment_point, &PublicKey::from_secret_key(secp_ctx, &commitments.local_params.keys.payment_base_key)).map_err(|_| ())?
		};
		let our_payment_key = if commitments.static_remote_key {
			commitments.local_params.keys.payment_base_key.clone()
		} else {
			chan_utils::derive_private_key(secp_ctx, &per_commitment_point, &commitments.local_params.keys.payment_base_key).map_err(|_| ())?
		};
		let to_remote_script = chan_utils::get_to_remote_script(commitments.format, &our_payment_pubkey);
		for (idx, outp) in tx.output.iter().enumerate() {
			if outp.script_pubkey == to_remote_script {
				if let Some(value) = claimed_value(outp.value, claim_feerate_per_kw, CLAIM_MAIN_WEIGHT) {
					let mut claim = claim_skeleton(txid, idx as u32, value, 0xffffffff, 0, destination_script);
					if let CommitmentFormat::Legacy = commitments.format {
						let script_code = ::bitcoin::blockdata::script::Builder::new()
							.push_opcode(::bitcoin::blockdata::opcodes::all::OP_DUP)
							.push_opcode(::bitcoin::blockdata::opcodes::all::OP_HASH160)
							.push_slice(&::bitcoin_hashes::hash160::Hash::hash(&our_payment_pubkey.serialize())[..])
							.push_opcode(::bitcoin::blockdata::opcodes::all::OP_EQUALVERIFY)
							.push_opcode(::bitcoin::blockdata::opcodes::all::OP_CHECKSIG)
							.into_script();
						let sighash = chan_utils::sighash(&claim, 0, &script_code, outp.value, SigHashType::All);
						let sig = secp_ctx.sign(&sighash, &our_payment_key);
						claim.input[0].witness.push(sig.serialize_der().to_vec());
						claim.input[0].witness[0].push(SigHashType::All as u8);
						claim.input[0].witness.push(our_payment_pubkey.serialize().to_vec());
					} else {
						let witness_script = ::bitcoin::blockdata::script::Builder::new()
							.push_slice(&our_payment_pubkey.serialize())
							.push_opcode(::bitcoin::blockdata::opcodes::all::OP_CHECKSIGVERIFY)
							.push_int(1)
							.push_opcode(::bitcoin::blockdata::opcodes::OP_CSV)
							.into_script();
						sign_claim_input(secp_ctx, &mut claim, &witness_script, outp.value, &our_payment_key, None);
					}
					claim_main_tx = Some(claim);
				}
				break;
			}
		}

		// Every HTLC output, spent with the revocation key.
		let mut htlc_penalty_txs = Vec::new();
		if let Some(htlc_outputs) = commitments.remote_claimable_htlcs.get(&txid) {
			for htlc in htlc_outputs.iter() {
				let output_index = match htlc.transaction_output_index {
					Some(idx) => idx,
					None => continue,
				};
				if output_index as usize >= tx.output.len() {
					continue;
				}
				let redeemscript = chan_utils::get_htlc_redeemscript_with_explicit_keys(htlc, &their_htlc_key, &our_htlc_key, &revocation_pubkey);
				if tx.output[output_index as usize].script_pubkey != redeemscript.to_v0_p2wsh() {
					continue;
				}
				let value_in = tx.output[output_index as usize].value;
				if let Some(value) = claimed_value(value_in, claim_feerate_per_kw, HTLC_PENALTY_WEIGHT) {
					let mut penalty = claim_skeleton(txid, output_index, value, 0xfffffffd, 0, destination_script);
					let sighash = chan_utils::sighash(&penalty, 0, &redeemscript, value_in, SigHashType::All);
					let sig = secp_ctx.sign(&sighash, &revocation_key);
					penalty.input[0].witness.push(sig.serialize_der().to_vec());
					penalty.input[0].witness[0].push(SigHashType::All as u8);
					penalty.input[0].witness.push(revocation_pubkey.serialize().to_vec());
					penalty.input[0].witness.push(redeemscript.to_bytes());
					htlc_penalty_txs.push(penalty);
				}
			}
		}

		Ok(RevokedCommitPublished {
			txid,
			commitment_number,
			claim_main_tx,
			main_penalty_tx,
			htlc_penalty_txs,
			claim_htlc_delayed_penalty_txs: Vec::new(),
			irrevocably_spent: HashMap::new(),
		})
	}

	/// The cheater raced us: they confirmed one of their own second-stage HTLC transactions.
	/// Punish its delayed output with the revocation key.
	pub fn on_their_htlc_tx(&mut self, commitments: &Commitments, secp_ctx: &Secp256k1<secp256k1::All>, destination_script: &Script, claim_feerate_per_kw: u64, their_htlc_tx: &Transaction) {
		if self.claim_htlc_delayed_penalty_txs.iter().any(|tx| tx.input[0].previous_output.txid == their_htlc_tx.txid()) {
			return;
		}
		let secret_bytes = match commitments.remote_per_commitment_secrets.get_secret(secret_index(self.commitment_number)) {
			Some(secret) => secret,
			None => return,
		};
		let per_commitment_secret = match SecretKey::from_slice(&secret_bytes) {
			Ok(secret) => secret,
			Err(_) => return,
		};
		let per_commitment_point = PublicKey::from_secret_key(secp_ctx, &per_commitment_secret);
		let revocation_key = match chan_utils::derive_private_revocation_key(secp_ctx, &per_commitment_secret, &commitments.local_params.keys.revocation_base_key) {
			Ok(key) => key,
			Err(_) => return,
		};
		let revocation_pubkey = PublicKey::from_secret_key(secp_ctx, &revocation_key);
		let their_delayed_key = match chan_utils::derive_public_key(secp_ctx, &per_commitment_point, &commitments.remote_params.delayed_payment_basepoint) {
			Ok(key) => key,
			Err(_) => return,
		};
		let revokeable_script = chan_utils::get_revokeable_redeemscript(&revocation_pubkey, commitments.local_params.to_self_delay, &their_delayed_key);
		if their_htlc_tx.output.is_empty() || their_htlc_tx.output[0].script_pubkey != revokeable_script.to_v0_p2wsh() {
			return;
		}
		let value_in = their_htlc_tx.output[0].value;
		if let Some(value) = claimed_value(value_in, claim_feerate_per_kw, CLAIM_DELAYED_WEIGHT) {
			let mut penalty = claim_skeleton(their_htlc_tx.txid(), 0, value, 0xfffffffd, 0, destination_script);
			sign_claim_input(secp_ctx, &mut penalty, &revokeable_script, value_in, &revocation_key, Some(vec![1]));
			self.claim_htlc_delayed_penalty_txs.push(penalty);
		}
	}
}

impl FutureRemoteCommitPublished {
	/// Builds the only thing we can claim from an unknown future commitment: our main output,
	/// using the per-commitment point the peer proved during reestablish.
	pub fn build(commitments: &Commitments, tx: &Transaction, remote_current_point: Option<&PublicKey>, secp_ctx: &Secp256k1<secp256k1::All>, destination_script: &Script, claim_feerate_per_kw: u64) -> FutureRemoteCommitPublished {
		let txid = tx.txid();
		let mut claim_main_tx = None;

		let key_and_pub = if commitments.static_remote_key {
			let key = commitments.local_params.keys.payment_base_key.clone();
			Some((key.clone(), PublicKey::from_secret_key(secp_ctx, &key)))
		} else if let Some(point) = remote_current_point {
			match chan_utils::derive_private_key(secp_ctx, point, &commitments.local_params.keys.payment_base_key) {
				Ok(key) => Some((key.clone(), PublicKey::from_secret_key(secp_ctx, &key))),
				Err(_) => None,
			}
		} else {
			None
		};

		if let Some((our_payment_key, our_payment_pubkey)) = key_and_pub {
			let to_remote_script = chan_utils::get_to_remote_script(commitments.format, &our_payment_pubkey);
			for (idx, outp) in tx.output.iter().enumerate() {
				if outp.script_pubkey == to_remote_script {
					if let Some(value) = claimed_value(outp.value, claim_feerate_per_kw, CLAIM_MAIN_WEIGHT) {
						let mut claim = claim_skeleton(txid, idx as u32, value, 0xffffffff, 0, destination_script);
						if let CommitmentFormat::Legacy = commitments.format {
							let script_code = ::bitcoin::blockdata::script::Builder::new()
								.push_opcode(::bitcoin::blockdata::opcodes::all::OP_DUP)
								.push_opcode(::bitcoin::blockdata::opcodes::all::OP_HASH160)
								.push_slice(&::bitcoin_hashes::hash160::Hash::hash(&our_payment_pubkey.serialize())[..])
								.push_opcode(::bitcoin::blockdata::opcodes::all::OP_EQUALVERIFY)
								.push_opcode(::bitcoin::blockdata::opcodes::all::OP_CHECKSIG)
								.into_script();
							let sighash = chan_utils::sighash(&claim, 0, &script_code, outp.value, SigHashType::All);
							let sig = secp_ctx.sign(&sighash, &our_payment_key);
							claim.input[0].witness.push(sig.serialize_der().to_vec());
							claim.input[0].witness[0].push(SigHashType::All as u8);
							claim.input[0].witness.push(our_payment_pubkey.serialize().to_vec());
						} else {
							let witness_script = ::bitcoin::blockdata::script::Builder::new()
								.push_slice(&our_payment_pubkey.serialize())
								.push_opcode(::bitcoin::blockdata::opcodes::all::OP_CHECKSIGVERIFY)
								.push_int(1)
								.push_opcode(::bitcoin::blockdata::opcodes::OP_CSV)
								.into_script();
							sign_claim_input(secp_ctx, &mut claim, &witness_script, outp.value, &our_payment_key, None);
						}
						claim_main_tx = Some(claim);
					}
					break;
				}
			}
		}

		FutureRemoteCommitPublished {
			txid,
			claim_main_tx,
			irrevocably_spent: HashMap::new(),
		}
	}
}

/// Which branch a spend of the funding output belongs to.
pub enum FundingSpendClass {
	/// Our own commitment (force close).
	LocalCommit,
	/// Their latest signed commitment.
	RemoteCommit,
	/// The signed-but-unrevoked next remote commitment.
	NextRemoteCommit,
	/// A revoked commitment of theirs.
	RevokedCommit,
	/// The mutual close we negotiated.
	MutualClose,
	/// None of the above: a future state, which means we lost data.
	FutureCommit,
}

/// Classifies a transaction spending the funding output against the ledger.
pub fn classify_funding_spend(commitments: &Commitments, mutual_close_txids: &[Sha256dHash], tx: &Transaction) -> FundingSpendClass {
	let txid = tx.txid();
	if mutual_close_txids.contains(&txid) {
		return FundingSpendClass::MutualClose;
	}
	if txid == commitments.local_commit.txid() {
		return FundingSpendClass::LocalCommit;
	}
	if txid == commitments.remote_commit.txid {
		return FundingSpendClass::RemoteCommit;
	}
	if let ::ln::commitments::NextRemoteCommitInfo::Waiting(ref wait) = commitments.remote_next_commit {
		if txid == wait.next_remote_commit.txid {
			return FundingSpendClass::NextRemoteCommit;
		}
	}
	// Any historical remote commitment we have the revocation secret for is claimably revoked.
	let commitment_number = chan_utils::decode_commitment_number(tx.input[0].sequence, tx.lock_time, commitments.obscure_factor);
	if commitment_number < (1 << 48) && commitments.remote_per_commitment_secrets.get_secret(secret_index(commitment_number)).is_some() {
		return FundingSpendClass::RevokedCommit;
	}
	FundingSpendClass::FutureCommit
}

/// HTLCs which can never appear on chain because they were trimmed from the published
/// commitment: they fail immediately once the commitment confirms.
pub fn trimmed_offered_htlcs(commitments: &Commitments, spec_htlcs: &[DirectedHtlc], dust_limit_satoshis: u64, feerate_per_kw: u64) -> Vec<PaymentHash> {
	spec_htlcs.iter()
		.filter(|h| h.direction == HtlcDirection::Offered)
		.filter(|h| h.is_trimmed(commitments.format, dust_limit_satoshis, feerate_per_kw))
		.map(|h| h.add.payment_hash)
		.collect()
}
