//! Various utilities for building scripts and deriving keys related to channels. Contains the
//! whole commitment-transaction construction pipeline: weights and fees, dust trimming, output
//! ordering, the obscured commitment number, second-stage HTLC transactions, the cooperative
//! closing transaction, and the compressed per-commitment revocation secret store.
//!
//! Everything here is a pure function of its inputs; nothing touches channel state.

use bitcoin::blockdata::script::{Script, Builder};
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::transaction::{TxIn, TxOut, Transaction, SigHashType};
use bitcoin::consensus::encode;
use bitcoin::util::bip143;

use bitcoin_hashes::{Hash, HashEngine};
use bitcoin_hashes::sha256::Hash as Sha256;
use bitcoin_hashes::sha256d::Hash as Sha256dHash;
use bitcoin_hashes::ripemd160::Hash as Ripemd160;
use bitcoin_hashes::hash160::Hash as Hash160;

use ln::{PaymentHash, PaymentPreimage};
use ln::msgs::{DecodeError, UpdateAddHTLC, UpdateMessage};
use chain::transaction::OutPoint;
use util::ser::{Readable, Writeable, Writer};
use util::transaction_utils;

use secp256k1::key::{SecretKey, PublicKey};
use secp256k1::{Secp256k1, Signature};
use secp256k1;

use std::io::Read;

/// The two commitment transaction formats the protocol has shipped. All weights are fixed by the
/// protocol; fees are computed from them and the negotiated feerate, never estimated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommitmentFormat {
	/// The original format.
	Legacy,
	/// Anchor outputs: two 330-sat anchors for CPFP fee-bumping, CSV-1 on the to_remote path and
	/// SIGHASH_SINGLE|ANYONECANPAY on counterparty HTLC signatures.
	AnchorOutputs,
}

/// The value of each of the two anchor outputs, in satoshi.
pub const ANCHOR_OUTPUT_VALUE_SATOSHIS: u64 = 330;

impl CommitmentFormat {
	/// Weight of the commitment transaction, excluding HTLC outputs.
	pub fn commit_weight(&self) -> u64 {
		match self {
			&CommitmentFormat::Legacy => 724,
			&CommitmentFormat::AnchorOutputs => 1124,
		}
	}
	/// Weight of an HTLC-timeout transaction.
	pub fn htlc_timeout_weight(&self) -> u64 {
		match self {
			&CommitmentFormat::Legacy => 663,
			&CommitmentFormat::AnchorOutputs => 666,
		}
	}
	/// Weight of an HTLC-success transaction.
	pub fn htlc_success_weight(&self) -> u64 {
		match self {
			&CommitmentFormat::Legacy => 703,
			&CommitmentFormat::AnchorOutputs => 706,
		}
	}
	/// Weight each untrimmed HTLC output adds to the commitment transaction.
	pub fn htlc_output_weight(&self) -> u64 { 172 }

	/// The nSequence on second-stage HTLC transaction inputs. The 1-block delay in anchor format
	/// is the CPFP carve-out.
	pub fn htlc_tx_input_sequence(&self) -> u32 {
		match self {
			&CommitmentFormat::Legacy => 0,
			&CommitmentFormat::AnchorOutputs => 1,
		}
	}

	/// The sighash flags under which the counterparty signs our second-stage HTLC transactions,
	/// letting them (in anchor format) attach fee inputs later.
	pub fn counterparty_htlc_sighash(&self) -> SigHashType {
		match self {
			&CommitmentFormat::Legacy => SigHashType::All,
			&CommitmentFormat::AnchorOutputs => SigHashType::SinglePlusAnyoneCanPay,
		}
	}

	/// Total satoshis the funder loses to anchors, on top of the commit fee.
	pub fn anchors_cost_satoshis(&self) -> u64 {
		match self {
			&CommitmentFormat::Legacy => 0,
			&CommitmentFormat::AnchorOutputs => 2 * ANCHOR_OUTPUT_VALUE_SATOSHIS,
		}
	}
}

impl Writeable for CommitmentFormat {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		match self {
			&CommitmentFormat::Legacy => 0u8.write(writer),
			&CommitmentFormat::AnchorOutputs => 1u8.write(writer),
		}
	}
}
impl<R: Read> Readable<R> for CommitmentFormat {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable<R>>::read(reader)? {
			0 => CommitmentFormat::Legacy,
			1 => CommitmentFormat::AnchorOutputs,
			_ => return Err(DecodeError::InvalidValue),
		})
	}
}

/// Converts a weight and a feerate in satoshi-per-kiloweight to a fee.
#[inline]
pub fn weight2fee(feerate_per_kw: u64, weight: u64) -> u64 {
	feerate_per_kw * weight / 1000
}

/// The fee the funder pays on a commitment transaction carrying the given number of untrimmed
/// HTLC outputs. In anchor format the two 330-sat anchors come on top of this, deducted from the
/// funder's main output rather than paid to miners.
pub fn commit_tx_fee(format: CommitmentFormat, feerate_per_kw: u64, untrimmed_htlc_count: usize) -> u64 {
	weight2fee(feerate_per_kw, format.commit_weight() + format.htlc_output_weight() * untrimmed_htlc_count as u64)
}

/// Threshold, in satoshi, below which an offered HTLC produces no commitment output.
pub fn offered_htlc_trim_threshold(format: CommitmentFormat, dust_limit_satoshis: u64, feerate_per_kw: u64) -> u64 {
	dust_limit_satoshis + weight2fee(feerate_per_kw, format.htlc_timeout_weight())
}

/// Threshold, in satoshi, below which a received HTLC produces no commitment output.
pub fn received_htlc_trim_threshold(format: CommitmentFormat, dust_limit_satoshis: u64, feerate_per_kw: u64) -> u64 {
	dust_limit_satoshis + weight2fee(feerate_per_kw, format.htlc_success_weight())
}

// ---- per-commitment secrets ----

/// Build the commitment secret from the seed and the commitment number. Secrets count DOWN from
/// index 2^48-1; we expose the up-counting commitment number at the call sites and convert there.
pub fn build_commitment_secret(commitment_seed: &[u8; 32], idx: u64) -> [u8; 32] {
	let mut res: [u8; 32] = commitment_seed.clone();
	for i in 0..48 {
		let bitpos = 47 - i;
		if idx & (1 << bitpos) == (1 << bitpos) {
			res[bitpos / 8] ^= 1 << (bitpos & 7);
			res = Sha256::hash(&res).into_inner();
		}
	}
	res
}

/// Implements the per-commitment secret storage scheme from BOLT 3.
///
/// Stores all of the counterparty's revealed per-commitment secrets in 49 slots (one per possible
/// trailing-zero count of the secret index), giving O(log n) storage and O(log n) lookup of any
/// revealed secret, so a penalty can be produced for any prior remote commitment.
#[derive(Clone)]
pub struct RevocationStore {
	old_secrets: [([u8; 32], u64); 49],
}

impl PartialEq for RevocationStore {
	fn eq(&self, other: &Self) -> bool {
		for (&(ref secret, ref idx), &(ref o_secret, ref o_idx)) in self.old_secrets.iter().zip(other.old_secrets.iter()) {
			if secret != o_secret || idx != o_idx {
				return false;
			}
		}
		true
	}
}

impl RevocationStore {
	/// Creates a new empty store.
	pub fn new() -> Self {
		Self { old_secrets: [([0; 32], 1 << 48); 49] }
	}

	/// Returns the minimum index of all stored secrets. Note that indexes start at 1 << 48 and
	/// get decremented by one for each new secret as they are received.
	pub fn get_min_seen_secret(&self) -> u64 {
		self.old_secrets.iter().fold(1 << 48, |min, &(_, idx)| {
			if idx < min { idx } else { min }
		})
	}

	#[inline]
	fn place_secret(idx: u64) -> u8 {
		for i in 0..48 {
			if idx & (1 << i) == (1 << i) {
				return i;
			}
		}
		48
	}

	#[inline]
	fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
		let mut res: [u8; 32] = secret;
		for i in 0..bits {
			let bitpos = bits - 1 - i;
			if idx & (1 << bitpos) == (1 << bitpos) {
				res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
				res = Sha256::hash(&res).into_inner();
			}
		}
		res
	}

	/// Inserts the `secret` at `idx`. Returns `Err` if the secret doesn't chain to the secrets
	/// already stored - a peer handing us such a secret is lying about its past states.
	pub fn provide_secret(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), ()> {
		let pos = Self::place_secret(idx);
		for i in 0..pos {
			let (old_secret, old_idx) = self.old_secrets[i as usize];
			if Self::derive_secret(secret, pos, old_idx) != old_secret {
				return Err(());
			}
		}
		if self.get_min_seen_secret() <= idx {
			return Ok(());
		}
		self.old_secrets[pos as usize] = (secret, idx);
		Ok(())
	}

	/// Returns the secret at `idx`. Returns `None` if `idx` is < `get_min_seen_secret`.
	pub fn get_secret(&self, idx: u64) -> Option<[u8; 32]> {
		for i in 0..self.old_secrets.len() {
			if (idx & (!((1 << i) - 1))) == self.old_secrets[i].1 {
				return Some(Self::derive_secret(self.old_secrets[i].0, i as u8, idx));
			}
		}
		assert!(idx < self.get_min_seen_secret());
		None
	}
}

impl Writeable for RevocationStore {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		for &(ref secret, ref idx) in self.old_secrets.iter() {
			secret.write(writer)?;
			idx.write(writer)?;
		}
		Ok(())
	}
}
impl<R: Read> Readable<R> for RevocationStore {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		let mut old_secrets = [([0; 32], 1 << 48); 49];
		for &mut (ref mut secret, ref mut idx) in old_secrets.iter_mut() {
			*secret = Readable::read(reader)?;
			*idx = Readable::read(reader)?;
		}
		Ok(Self { old_secrets })
	}
}

// ---- key derivation ----

/// The set of secret keys one side holds for a channel. How they are generated is the business of
/// an external keys provider; the engine only requires that they exist and stay stable.
#[derive(Clone)]
pub struct ChannelKeys {
	/// Private key of the 2-of-2 multisig controlling the funding output.
	pub funding_key: SecretKey,
	/// Base secret the counterparty's per-commitment revocation keys are derived from.
	pub revocation_base_key: SecretKey,
	/// Base secret our simple (to_remote on their commitment) payment key is derived from.
	pub payment_base_key: SecretKey,
	/// Base secret our delayed payment keys are derived from.
	pub delayed_payment_base_key: SecretKey,
	/// Base secret our HTLC keys are derived from.
	pub htlc_base_key: SecretKey,
	/// Seed of our per-commitment secret chain.
	pub commitment_seed: [u8; 32],
}

impl ChannelKeys {
	/// Deterministically derives a full key set from a 32-byte seed. Fine for tests and simple
	/// nodes; hardware-backed deployments will populate the struct themselves.
	pub fn new_from_seed(seed: &[u8; 32]) -> ChannelKeys {
		let mut derive = |tag: u8| {
			let mut sha = Sha256::engine();
			sha.input(seed);
			sha.input(&[tag]);
			SecretKey::from_slice(&Sha256::from_engine(sha).into_inner()).expect("SHA256 output is a valid key with overwhelming probability")
		};
		let funding_key = derive(1);
		let revocation_base_key = derive(2);
		let payment_base_key = derive(3);
		let delayed_payment_base_key = derive(4);
		let htlc_base_key = derive(5);
		let commitment_seed = {
			let mut sha = Sha256::engine();
			sha.input(seed);
			sha.input(&[6]);
			Sha256::from_engine(sha).into_inner()
		};
		ChannelKeys {
			funding_key,
			revocation_base_key,
			payment_base_key,
			delayed_payment_base_key,
			htlc_base_key,
			commitment_seed,
		}
	}
}

impl_writeable!(ChannelKeys, {
	funding_key,
	revocation_base_key,
	payment_base_key,
	delayed_payment_base_key,
	htlc_base_key,
	commitment_seed
});

/// Derives a per-commitment-transaction private key (eg an htlc key or a delayed_payment key)
/// from the base secret and the per_commitment_point.
pub fn derive_private_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_secret: &SecretKey) -> Result<SecretKey, secp256k1::Error> {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&PublicKey::from_secret_key(&secp_ctx, &base_secret).serialize());
	let res = Sha256::from_engine(sha).into_inner();

	let mut key = base_secret.clone();
	key.add_assign(&res)?;
	Ok(key)
}

/// Derives a per-commitment-transaction public key from the base point and the
/// per_commitment_point - the public equivalent of derive_private_key.
pub fn derive_public_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_point: &PublicKey) -> Result<PublicKey, secp256k1::Error> {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&base_point.serialize());
	let res = Sha256::from_engine(sha).into_inner();

	let hashkey = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&res)?);
	base_point.combine(&hashkey)
}

/// Derives a per-commitment-transaction revocation secret from the counterparty's revealed
/// per-commitment secret and our revocation base secret. Only the punisher can compute this.
pub fn derive_private_revocation_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_secret: &SecretKey, revocation_base_secret: &SecretKey) -> Result<SecretKey, secp256k1::Error> {
	let revocation_base_point = PublicKey::from_secret_key(&secp_ctx, &revocation_base_secret);
	let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);

	let rev_append_commit_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&revocation_base_point.serialize());
		sha.input(&per_commitment_point.serialize());
		Sha256::from_engine(sha).into_inner()
	};
	let commit_append_rev_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&per_commitment_point.serialize());
		sha.input(&revocation_base_point.serialize());
		Sha256::from_engine(sha).into_inner()
	};

	let mut part_a = revocation_base_secret.clone();
	part_a.mul_assign(&rev_append_commit_hash_key)?;
	let mut part_b = per_commitment_secret.clone();
	part_b.mul_assign(&commit_append_rev_hash_key)?;
	part_a.add_assign(&part_b[..])?;
	Ok(part_a)
}

/// Derives a per-commitment-transaction revocation public key from the broadcaster's
/// per-commitment point and the countersignatory's revocation base point.
pub fn derive_public_revocation_key<T: secp256k1::Verification>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, revocation_base_point: &PublicKey) -> Result<PublicKey, secp256k1::Error> {
	let rev_append_commit_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&revocation_base_point.serialize());
		sha.input(&per_commitment_point.serialize());
		Sha256::from_engine(sha).into_inner()
	};
	let commit_append_rev_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&per_commitment_point.serialize());
		sha.input(&revocation_base_point.serialize());
		Sha256::from_engine(sha).into_inner()
	};

	let mut base_contrib = revocation_base_point.clone();
	base_contrib.mul_assign(&secp_ctx, &rev_append_commit_hash_key)?;
	let mut commit_contrib = per_commitment_point.clone();
	commit_contrib.mul_assign(&secp_ctx, &commit_append_rev_hash_key)?;
	base_contrib.combine(&commit_contrib)
}

/// The set of public keys which are used in the creation of one commitment transaction.
/// These are derived from the channel base keys and per-commitment data.
///
/// "a" keys belong to the potential broadcaster of the transaction, "b" keys to the participant
/// who can only countersign it.
#[derive(Clone, PartialEq)]
pub struct TxCreationKeys {
	/// The broadcaster's per-commitment public key which was used to derive the other keys.
	pub per_commitment_point: PublicKey,
	/// The revocation key which is used to allow the broadcaster of the commitment
	/// transaction to be punished if it is revoked.
	pub revocation_key: PublicKey,
	/// Broadcaster's HTLC key
	pub a_htlc_key: PublicKey,
	/// Countersignatory's HTLC key
	pub b_htlc_key: PublicKey,
	/// Broadcaster's payment key, delayed by to_self_delay
	pub a_delayed_payment_key: PublicKey,
	/// Countersignatory's simple (undelayed) payment key
	pub b_payment_key: PublicKey,
}

impl_writeable!(TxCreationKeys, {
	per_commitment_point,
	revocation_key,
	a_htlc_key,
	b_htlc_key,
	a_delayed_payment_key,
	b_payment_key
});

impl TxCreationKeys {
	/// Creates the transaction keys for a commitment broadcastable by the "a" side. When
	/// static_remote_key is in effect the countersignatory's payment key is its basepoint,
	/// undiversified, so their main output is wallet-native.
	pub fn new<T: secp256k1::Signing + secp256k1::Verification>(secp_ctx: &Secp256k1<T>,
			per_commitment_point: &PublicKey,
			a_delayed_payment_base: &PublicKey, a_htlc_base: &PublicKey,
			b_revocation_base: &PublicKey, b_payment_base: &PublicKey, b_htlc_base: &PublicKey,
			static_remote_key: bool) -> Result<TxCreationKeys, secp256k1::Error> {
		Ok(TxCreationKeys {
			per_commitment_point: per_commitment_point.clone(),
			revocation_key: derive_public_revocation_key(&secp_ctx, &per_commitment_point, &b_revocation_base)?,
			a_htlc_key: derive_public_key(&secp_ctx, &per_commitment_point, &a_htlc_base)?,
			b_htlc_key: derive_public_key(&secp_ctx, &per_commitment_point, &b_htlc_base)?,
			a_delayed_payment_key: derive_public_key(&secp_ctx, &per_commitment_point, &a_delayed_payment_base)?,
			b_payment_key: if static_remote_key {
				b_payment_base.clone()
			} else {
				derive_public_key(&secp_ctx, &per_commitment_point, &b_payment_base)?
			},
		})
	}
}

// ---- scripts ----

/// Gets the 2-of-2 redeemscript for the funding output, with the pubkeys in lexical order.
pub fn make_funding_redeemscript(a: &PublicKey, b: &PublicKey) -> Script {
	let our_funding_key = a.serialize();
	let their_funding_key = b.serialize();

	let builder = Builder::new().push_opcode(opcodes::all::OP_PUSHNUM_2);
	if our_funding_key[..] < their_funding_key[..] {
		builder.push_slice(&our_funding_key)
			.push_slice(&their_funding_key)
	} else {
		builder.push_slice(&their_funding_key)
			.push_slice(&our_funding_key)
	}.push_opcode(opcodes::all::OP_PUSHNUM_2).push_opcode(opcodes::all::OP_CHECKMULTISIG).into_script()
}

/// A script either spendable by the revocation key or, after contest_delay, by the broadcaster's
/// delayed payment key. Encumbers the main to-self output and all second-stage HTLC outputs.
pub fn get_revokeable_redeemscript(revocation_key: &PublicKey, contest_delay: u16, a_delayed_payment_key: &PublicKey) -> Script {
	Builder::new().push_opcode(opcodes::all::OP_IF)
	              .push_slice(&revocation_key.serialize())
	              .push_opcode(opcodes::all::OP_ELSE)
	              .push_int(contest_delay as i64)
	              .push_opcode(opcodes::OP_CSV)
	              .push_opcode(opcodes::all::OP_DROP)
	              .push_slice(&a_delayed_payment_key.serialize())
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .push_opcode(opcodes::all::OP_CHECKSIG)
	              .into_script()
}

/// The scriptPubKey paying the countersignatory's main balance: P2WPKH in legacy format, or the
/// CSV-1-encumbered P2WSH in anchor format (so the carve-out applies to it too).
pub fn get_to_remote_script(format: CommitmentFormat, payment_key: &PublicKey) -> Script {
	match format {
		CommitmentFormat::Legacy => {
			Builder::new().push_opcode(opcodes::all::OP_PUSHBYTES_0)
			              .push_slice(&Hash160::hash(&payment_key.serialize())[..])
			              .into_script()
		},
		CommitmentFormat::AnchorOutputs => {
			Builder::new().push_slice(&payment_key.serialize())
			              .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
			              .push_int(1)
			              .push_opcode(opcodes::OP_CSV)
			              .into_script()
			              .to_v0_p2wsh()
		},
	}
}

/// The anchor output redeemscript: spendable by the given funding key, or by anyone after 16
/// blocks (so a stray anchor is sweepable and doesn't bloat the UTXO set forever).
pub fn get_anchor_redeemscript(funding_pubkey: &PublicKey) -> Script {
	Builder::new().push_slice(&funding_pubkey.serialize())
	              .push_opcode(opcodes::all::OP_CHECKSIG)
	              .push_opcode(opcodes::all::OP_IFDUP)
	              .push_opcode(opcodes::all::OP_NOTIF)
	              .push_opcode(opcodes::all::OP_PUSHNUM_16)
	              .push_opcode(opcodes::OP_CSV)
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .into_script()
}

/// Information about an HTLC as it appears in a commitment transaction
#[derive(Clone, PartialEq)]
pub struct HTLCOutputInCommitment {
	/// Whether the HTLC was "offered" (ie outbound in relation to this commitment transaction).
	/// Note that this is not the same as whether it is outbound *from us*; for a commitment held
	/// by our counterparty the senses flip.
	pub offered: bool,
	/// The value, in msat, of the HTLC. The value as it appears in the commitment transaction is
	/// this divided by 1000.
	pub amount_msat: u64,
	/// The CLTV lock-time at which this HTLC expires.
	pub cltv_expiry: u32,
	/// The hash of the preimage which unlocks this HTLC.
	pub payment_hash: PaymentHash,
	/// The position within the commitment transactions' outputs. This may be None if the value is
	/// below the dust limit (in which case no output appears in the commitment transaction and the
	/// value is spent to additional transaction fees).
	pub transaction_output_index: Option<u32>,
}

impl_writeable!(HTLCOutputInCommitment, {
	offered,
	amount_msat,
	cltv_expiry,
	payment_hash,
	transaction_output_index
});

/// Gets the witness redeemscript for an HTLC output in a commitment transaction. Note that the
/// broadcaster/countersignatory sense of the keys must match the commitment the HTLC sits in.
pub fn get_htlc_redeemscript_with_explicit_keys(htlc: &HTLCOutputInCommitment, a_htlc_key: &PublicKey, b_htlc_key: &PublicKey, revocation_key: &PublicKey) -> Script {
	let payment_hash160 = Ripemd160::hash(&htlc.payment_hash.0[..]).into_inner();
	if htlc.offered {
		Builder::new().push_opcode(opcodes::all::OP_DUP)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&Hash160::hash(&revocation_key.serialize())[..])
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_slice(&b_htlc_key.serialize()[..])
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_opcode(opcodes::all::OP_SIZE)
		              .push_int(32)
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_NOTIF)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_slice(&a_htlc_key.serialize()[..])
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_CHECKMULTISIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&payment_hash160)
		              .push_opcode(opcodes::all::OP_EQUALVERIFY)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .into_script()
	} else {
		Builder::new().push_opcode(opcodes::all::OP_DUP)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&Hash160::hash(&revocation_key.serialize())[..])
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_slice(&b_htlc_key.serialize()[..])
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_opcode(opcodes::all::OP_SIZE)
		              .push_int(32)
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&payment_hash160)
		              .push_opcode(opcodes::all::OP_EQUALVERIFY)
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_slice(&a_htlc_key.serialize()[..])
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_CHECKMULTISIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_int(htlc.cltv_expiry as i64)
		              .push_opcode(opcodes::OP_CLTV)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .into_script()
	}
}

/// Gets the redeemscript for the given HTLC using the keys of the commitment it sits in.
#[inline]
pub fn get_htlc_redeemscript(htlc: &HTLCOutputInCommitment, keys: &TxCreationKeys) -> Script {
	get_htlc_redeemscript_with_explicit_keys(htlc, &keys.a_htlc_key, &keys.b_htlc_key, &keys.revocation_key)
}

// ---- commitment specification and reduction ----

/// Direction of an HTLC relative to the owner of the commitment spec it appears in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HtlcDirection {
	/// The spec owner offered this HTLC (it is paying outward).
	Offered,
	/// The spec owner received this HTLC (it will be paid inward on preimage).
	Received,
}

/// An HTLC together with its direction relative to the spec owner.
#[derive(Clone, PartialEq, Debug)]
pub struct DirectedHtlc {
	/// The direction.
	pub direction: HtlcDirection,
	/// The underlying add message, kept whole so it can be retransmitted and so the onion
	/// payload survives for relaying.
	pub add: UpdateAddHTLC,
}

impl DirectedHtlc {
	/// Whether the HTLC produces no output at the given dust limit and feerate.
	pub fn is_trimmed(&self, format: CommitmentFormat, dust_limit_satoshis: u64, feerate_per_kw: u64) -> bool {
		let threshold = match self.direction {
			HtlcDirection::Offered => offered_htlc_trim_threshold(format, dust_limit_satoshis, feerate_per_kw),
			HtlcDirection::Received => received_htlc_trim_threshold(format, dust_limit_satoshis, feerate_per_kw),
		};
		self.add.amount_msat / 1000 < threshold
	}
}

impl Writeable for DirectedHtlc {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		match self.direction {
			HtlcDirection::Offered => 0u8.write(writer)?,
			HtlcDirection::Received => 1u8.write(writer)?,
		}
		self.add.write(writer)
	}
}
impl<R: Read> Readable<R> for DirectedHtlc {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(DirectedHtlc {
			direction: match <u8 as Readable<R>>::read(reader)? {
				0 => HtlcDirection::Offered,
				1 => HtlcDirection::Received,
				_ => return Err(DecodeError::InvalidValue),
			},
			add: Readable::read(reader)?,
		})
	}
}

/// One side's view of the channel funds at a given commitment: the live HTLC set, the feerate,
/// and the two main balances. Invariant: to_local + to_remote + sum(htlcs) equals the channel
/// capacity, in millisatoshi; fees are attributed only when a transaction is built from the spec.
#[derive(Clone, PartialEq, Debug)]
pub struct CommitmentSpec {
	/// HTLCs alive in this commitment.
	pub htlcs: Vec<DirectedHtlc>,
	/// Feerate, in satoshi per kiloweight, this commitment pays.
	pub feerate_per_kw: u64,
	/// Funds owned by the spec owner, before fee deduction, in millisatoshi.
	pub to_local_msat: u64,
	/// Funds owned by the counterparty, before fee deduction, in millisatoshi.
	pub to_remote_msat: u64,
}

impl_writeable!(CommitmentSpec, { htlcs, feerate_per_kw, to_local_msat, to_remote_msat });

/// Errors from applying a changes log to a spec. These are protocol violations: the peer
/// referenced an HTLC that does not exist or double-settled one.
#[derive(Debug, PartialEq)]
pub enum SpecError {
	/// An update referenced an unknown htlc id.
	UnknownHtlc(u64),
	/// A balance underflowed; the update set was not validated before application.
	BalanceUnderflow,
}

impl CommitmentSpec {
	/// Finds the HTLC with the given direction and id.
	pub fn find_htlc(&self, direction: HtlcDirection, htlc_id: u64) -> Option<&DirectedHtlc> {
		self.htlcs.iter().find(|h| h.direction == direction && h.add.htlc_id == htlc_id)
	}

	fn add_htlc(&mut self, direction: HtlcDirection, add: &UpdateAddHTLC) -> Result<(), SpecError> {
		match direction {
			HtlcDirection::Offered => {
				self.to_local_msat = self.to_local_msat.checked_sub(add.amount_msat).ok_or(SpecError::BalanceUnderflow)?;
			},
			HtlcDirection::Received => {
				self.to_remote_msat = self.to_remote_msat.checked_sub(add.amount_msat).ok_or(SpecError::BalanceUnderflow)?;
			},
		}
		self.htlcs.push(DirectedHtlc { direction, add: add.clone() });
		Ok(())
	}

	// `by_owner` is true when the spec owner settles a Received HTLC, false when the
	// counterparty settles an Offered one.
	fn settle_htlc(&mut self, by_owner: bool, htlc_id: u64, fulfilled: bool) -> Result<(), SpecError> {
		let direction = if by_owner { HtlcDirection::Received } else { HtlcDirection::Offered };
		let pos = match self.htlcs.iter().position(|h| h.direction == direction && h.add.htlc_id == htlc_id) {
			Some(pos) => pos,
			None => return Err(SpecError::UnknownHtlc(htlc_id)),
		};
		let amount_msat = self.htlcs[pos].add.amount_msat;
		// A fulfilled HTLC pays the settling side, a failed one refunds the offerer.
		match (by_owner, fulfilled) {
			(true, true) => self.to_local_msat += amount_msat,
			(true, false) => self.to_remote_msat += amount_msat,
			(false, true) => self.to_remote_msat += amount_msat,
			(false, false) => self.to_local_msat += amount_msat,
		}
		self.htlcs.remove(pos);
		Ok(())
	}

	/// Applies two changes logs to this spec, producing the next spec. `owner_changes` were
	/// proposed by the spec owner, `counterparty_changes` by the other side. Fee updates apply
	/// whole-spec; adds before settles, so a settle in the same batch as its add resolves.
	pub fn reduce(&self, owner_changes: &[UpdateMessage], counterparty_changes: &[UpdateMessage]) -> Result<CommitmentSpec, SpecError> {
		let mut spec = self.clone();
		for update in owner_changes.iter().chain(counterparty_changes.iter()) {
			if let &UpdateMessage::Fee(ref msg) = update {
				spec.feerate_per_kw = msg.feerate_per_kw as u64;
			}
		}
		for update in owner_changes.iter() {
			if let &UpdateMessage::AddHtlc(ref msg) = update {
				spec.add_htlc(HtlcDirection::Offered, msg)?;
			}
		}
		for update in counterparty_changes.iter() {
			if let &UpdateMessage::AddHtlc(ref msg) = update {
				spec.add_htlc(HtlcDirection::Received, msg)?;
			}
		}
		for update in owner_changes.iter() {
			match update {
				&UpdateMessage::FulfillHtlc(ref msg) => spec.settle_htlc(true, msg.htlc_id, true)?,
				&UpdateMessage::FailHtlc(ref msg) => spec.settle_htlc(true, msg.htlc_id, false)?,
				&UpdateMessage::FailMalformedHtlc(ref msg) => spec.settle_htlc(true, msg.htlc_id, false)?,
				_ => {},
			}
		}
		for update in counterparty_changes.iter() {
			match update {
				&UpdateMessage::FulfillHtlc(ref msg) => spec.settle_htlc(false, msg.htlc_id, true)?,
				&UpdateMessage::FailHtlc(ref msg) => spec.settle_htlc(false, msg.htlc_id, false)?,
				&UpdateMessage::FailMalformedHtlc(ref msg) => spec.settle_htlc(false, msg.htlc_id, false)?,
				_ => {},
			}
		}
		Ok(spec)
	}

	/// The untrimmed HTLC count at the given dust limit, which sizes the commit fee.
	pub fn untrimmed_htlc_count(&self, format: CommitmentFormat, dust_limit_satoshis: u64) -> usize {
		self.htlcs.iter().filter(|h| !h.is_trimmed(format, dust_limit_satoshis, self.feerate_per_kw)).count()
	}

	/// The fee this spec's commitment transaction pays.
	pub fn commit_tx_fee(&self, format: CommitmentFormat, dust_limit_satoshis: u64) -> u64 {
		commit_tx_fee(format, self.feerate_per_kw, self.untrimmed_htlc_count(format, dust_limit_satoshis))
	}

	/// Sum of in-flight HTLC value in the given direction, in millisatoshi.
	pub fn htlc_value_in_flight_msat(&self, direction: HtlcDirection) -> u64 {
		self.htlcs.iter().filter(|h| h.direction == direction).map(|h| h.add.amount_msat).sum()
	}

	/// Number of in-flight HTLCs in the given direction.
	pub fn htlc_count(&self, direction: HtlcDirection) -> usize {
		self.htlcs.iter().filter(|h| h.direction == direction).count()
	}
}

// ---- the obscured commitment number ----

/// Computes the 48-bit factor obscuring commitment numbers in the commitment transaction, from
/// the payment basepoints in funding order: lower_48(SHA256(opener_bp || accepter_bp)).
pub fn commitment_number_obscure_factor(opener_payment_basepoint: &PublicKey, accepter_payment_basepoint: &PublicKey) -> u64 {
	let mut sha = Sha256::engine();
	sha.input(&opener_payment_basepoint.serialize());
	sha.input(&accepter_payment_basepoint.serialize());
	let res = Sha256::from_engine(sha).into_inner();

	((res[26] as u64) << 5*8) |
	((res[27] as u64) << 4*8) |
	((res[28] as u64) << 3*8) |
	((res[29] as u64) << 2*8) |
	((res[30] as u64) << 1*8) |
	((res[31] as u64) << 0*8)
}

/// Splits the obscured commitment number into the (sequence, locktime) pair carried by the
/// commitment transaction: high 24 bits into sequence under 0x80 padding, low 24 into locktime
/// under 0x20 padding. Must be reproduced bit-for-bit or signatures will not match.
pub fn encode_commitment_number(commitment_number: u64, obscure_factor: u64) -> (u32, u32) {
	assert!(commitment_number < (1 << 48));
	let obscured = commitment_number ^ obscure_factor;
	(((0x80 as u32) << 8*3) | ((obscured >> 3*8) as u32),
	 ((0x20 as u32) << 8*3) | ((obscured & 0xffffff) as u32))
}

/// Recovers a commitment number from a commitment transaction's sequence and locktime.
pub fn decode_commitment_number(sequence: u32, locktime: u32, obscure_factor: u64) -> u64 {
	((((sequence as u64) & 0xffffff) << 3*8) | ((locktime as u64) & 0xffffff)) ^ obscure_factor
}

// ---- commitment transaction assembly ----

/// Builds a commitment transaction from the owner's point of view: to_local pays the owner via
/// the revokeable-delayed script, to_remote pays the counterparty, offered HTLCs are outputs the
/// owner can reclaim on timeout. Returns the unsigned transaction and every HTLC of the spec with
/// its output index filled in (None for trimmed HTLCs, whose value went to fees).
///
/// Outputs are in BIP69 order with the CLTV tie-break for identical offered HTLCs, so both sides
/// produce byte-identical transactions and agree on HTLC-to-signature pairing.
pub fn build_commitment_tx(funding_outpoint: &OutPoint, keys: &TxCreationKeys, spec: &CommitmentSpec,
		format: CommitmentFormat, commitment_number: u64, obscure_factor: u64,
		dust_limit_satoshis: u64, owner_is_funder: bool, to_self_delay: u16,
		owner_funding_pubkey: &PublicKey, counterparty_funding_pubkey: &PublicKey)
		-> (Transaction, Vec<HTLCOutputInCommitment>) {
	let (sequence, locktime) = encode_commitment_number(commitment_number, obscure_factor);

	let txins = vec![TxIn {
		previous_output: funding_outpoint.into_bitcoin_outpoint(),
		script_sig: Script::new(),
		sequence,
		witness: Vec::new(),
	}];

	let mut txouts: Vec<(TxOut, Option<HTLCOutputInCommitment>)> = Vec::with_capacity(spec.htlcs.len() + 4);
	let mut trimmed_htlcs: Vec<HTLCOutputInCommitment> = Vec::new();

	for htlc in spec.htlcs.iter() {
		let htlc_in_tx = HTLCOutputInCommitment {
			offered: htlc.direction == HtlcDirection::Offered,
			amount_msat: htlc.add.amount_msat,
			cltv_expiry: htlc.add.cltv_expiry,
			payment_hash: htlc.add.payment_hash,
			transaction_output_index: None,
		};
		if htlc.is_trimmed(format, dust_limit_satoshis, spec.feerate_per_kw) {
			trimmed_htlcs.push(htlc_in_tx);
		} else {
			txouts.push((TxOut {
				script_pubkey: get_htlc_redeemscript(&htlc_in_tx, keys).to_v0_p2wsh(),
				value: htlc.add.amount_msat / 1000,
			}, Some(htlc_in_tx)));
		}
	}

	let commit_fee = spec.commit_tx_fee(format, dust_limit_satoshis);
	let anchors_cost = format.anchors_cost_satoshis();
	let (funder_cost, fundee_cost) = (commit_fee + anchors_cost, 0);
	let (to_local_cost, to_remote_cost) = if owner_is_funder { (funder_cost, fundee_cost) } else { (fundee_cost, funder_cost) };

	let to_local_sat = (spec.to_local_msat / 1000) as i64 - to_local_cost as i64;
	let to_remote_sat = (spec.to_remote_msat / 1000) as i64 - to_remote_cost as i64;

	let has_htlc_outputs = txouts.len() != 0;
	let to_local_included = to_local_sat >= dust_limit_satoshis as i64;
	let to_remote_included = to_remote_sat >= dust_limit_satoshis as i64;

	if to_local_included {
		txouts.push((TxOut {
			script_pubkey: get_revokeable_redeemscript(&keys.revocation_key, to_self_delay, &keys.a_delayed_payment_key).to_v0_p2wsh(),
			value: to_local_sat as u64,
		}, None));
	}
	if to_remote_included {
		txouts.push((TxOut {
			script_pubkey: get_to_remote_script(format, &keys.b_payment_key),
			value: to_remote_sat as u64,
		}, None));
	}
	if format == CommitmentFormat::AnchorOutputs {
		if to_local_included || has_htlc_outputs {
			txouts.push((TxOut {
				script_pubkey: get_anchor_redeemscript(owner_funding_pubkey).to_v0_p2wsh(),
				value: ANCHOR_OUTPUT_VALUE_SATOSHIS,
			}, None));
		}
		if to_remote_included || has_htlc_outputs {
			txouts.push((TxOut {
				script_pubkey: get_anchor_redeemscript(counterparty_funding_pubkey).to_v0_p2wsh(),
				value: ANCHOR_OUTPUT_VALUE_SATOSHIS,
			}, None));
		}
	}

	transaction_utils::sort_outputs(&mut txouts, |a, b| {
		if let &Some(ref a_htlc) = a {
			if let &Some(ref b_htlc) = b {
				// Identical-amount identical-hash offered HTLCs must agree with the peer on
				// which pairs with which HTLC-timeout tx: order by expiry.
				a_htlc.cltv_expiry.cmp(&b_htlc.cltv_expiry)
					.then(a_htlc.payment_hash.0.cmp(&b_htlc.payment_hash.0))
			} else { ::std::cmp::Ordering::Equal }
		} else { ::std::cmp::Ordering::Equal }
	});

	let mut outputs = Vec::with_capacity(txouts.len());
	let mut htlcs_included = Vec::with_capacity(txouts.len() + trimmed_htlcs.len());
	for (idx, out) in txouts.drain(..).enumerate() {
		outputs.push(out.0);
		if let Some(mut htlc) = out.1 {
			htlc.transaction_output_index = Some(idx as u32);
			htlcs_included.push(htlc);
		}
	}
	htlcs_included.append(&mut trimmed_htlcs);

	(Transaction {
		version: 2,
		lock_time: locktime,
		input: txins,
		output: outputs,
	}, htlcs_included)
}

/// Builds the htlc-timeout or htlc-success transaction which spends a given HTLC output of a
/// commitment transaction. The single output pays back to the commitment broadcaster, delayed.
pub fn build_htlc_transaction(prev_hash: &Sha256dHash, format: CommitmentFormat, feerate_per_kw: u64, contest_delay: u16, htlc: &HTLCOutputInCommitment, a_delayed_payment_key: &PublicKey, revocation_key: &PublicKey) -> Transaction {
	let txins = vec![TxIn {
		previous_output: ::bitcoin::blockdata::transaction::OutPoint {
			txid: prev_hash.clone(),
			vout: htlc.transaction_output_index.expect("Can't build an HTLC transaction for a dust output"),
		},
		script_sig: Script::new(),
		sequence: format.htlc_tx_input_sequence(),
		witness: Vec::new(),
	}];

	let total_fee = if htlc.offered {
		weight2fee(feerate_per_kw, format.htlc_timeout_weight())
	} else {
		weight2fee(feerate_per_kw, format.htlc_success_weight())
	};

	let txouts = vec![TxOut {
		script_pubkey: get_revokeable_redeemscript(revocation_key, contest_delay, a_delayed_payment_key).to_v0_p2wsh(),
		value: htlc.amount_msat / 1000 - total_fee,
	}];

	Transaction {
		version: 2,
		lock_time: if htlc.offered { htlc.cltv_expiry } else { 0 },
		input: txins,
		output: txouts,
	}
}

/// Builds the cooperative closing transaction: the funding output paid out directly to the two
/// negotiated scripts, below-dust outputs dropped, BIP69 ordered, no delays and no HTLCs.
pub fn build_closing_transaction(funding_outpoint: &OutPoint, to_local_sat: u64, to_remote_sat: u64, local_script: Script, remote_script: Script, dust_limit_satoshis: u64) -> Transaction {
	let txins = vec![TxIn {
		previous_output: funding_outpoint.into_bitcoin_outpoint(),
		script_sig: Script::new(),
		sequence: 0xffffffff,
		witness: Vec::new(),
	}];

	let mut txouts: Vec<(TxOut, ())> = Vec::new();
	if to_local_sat >= dust_limit_satoshis {
		txouts.push((TxOut { script_pubkey: local_script, value: to_local_sat }, ()));
	}
	if to_remote_sat >= dust_limit_satoshis {
		txouts.push((TxOut { script_pubkey: remote_script, value: to_remote_sat }, ()));
	}

	transaction_utils::sort_outputs(&mut txouts, |_, _| ::std::cmp::Ordering::Equal);

	let mut outputs: Vec<TxOut> = Vec::new();
	for out in txouts.drain(..) {
		outputs.push(out.0);
	}

	Transaction {
		version: 2,
		lock_time: 0,
		input: txins,
		output: outputs,
	}
}

/// The weight of a closing transaction paying out to the two given scripts, for fee proposals.
pub fn closing_transaction_weight(a_scriptpubkey: &Script, b_scriptpubkey: &Script) -> u64 {
	(4 + 1 + 36 + 4 + 1 + 1 + 2 * (8 + 1) + 4 + a_scriptpubkey.len() as u64 + b_scriptpubkey.len() as u64) * 4 + 2 + 1 + 1 + 2 * (1 + 72)
}

// ---- sighash helpers ----

/// The BIP143 sighash message for input 0 under SIGHASH_ALL, which covers every commitment,
/// closing and second-stage signature in legacy format.
pub fn sighash_all(tx: &Transaction, input_index: usize, script: &Script, value_sat: u64) -> secp256k1::Message {
	hash_to_message!(&bip143::SighashComponents::new(tx).sighash_all(&tx.input[input_index], script, value_sat)[..])
}

/// The BIP143 sighash message for the given input under an arbitrary sighash type. Assembled by
/// hand because the anchor format's SIGHASH_SINGLE|ANYONECANPAY is not covered by the library
/// helper; under SIGHASH_ALL this reproduces [`sighash_all`] exactly.
pub fn sighash(tx: &Transaction, input_index: usize, script: &Script, value_sat: u64, sighash_type: SigHashType) -> secp256k1::Message {
	let anyone_can_pay = (sighash_type as u32) & 0x80 == 0x80;
	let base_type = (sighash_type as u32) & 0x1f;

	let mut preimage = Vec::with_capacity(256);
	preimage.extend_from_slice(&encode::serialize(&tx.version));
	let hash_prevouts = if anyone_can_pay {
		[0; 32].to_vec()
	} else {
		let mut enc = Vec::new();
		for txin in tx.input.iter() {
			enc.extend_from_slice(&encode::serialize(&txin.previous_output));
		}
		Sha256dHash::hash(&enc).into_inner().to_vec()
	};
	preimage.extend_from_slice(&hash_prevouts);
	let hash_sequence = if anyone_can_pay || base_type != SigHashType::All as u32 {
		[0; 32].to_vec()
	} else {
		let mut enc = Vec::new();
		for txin in tx.input.iter() {
			enc.extend_from_slice(&encode::serialize(&txin.sequence));
		}
		Sha256dHash::hash(&enc).into_inner().to_vec()
	};
	preimage.extend_from_slice(&hash_sequence);
	preimage.extend_from_slice(&encode::serialize(&tx.input[input_index].previous_output));
	preimage.extend_from_slice(&encode::serialize(script));
	preimage.extend_from_slice(&encode::serialize(&value_sat));
	preimage.extend_from_slice(&encode::serialize(&tx.input[input_index].sequence));
	let hash_outputs = if base_type == SigHashType::Single as u32 && input_index < tx.output.len() {
		Sha256dHash::hash(&encode::serialize(&tx.output[input_index])).into_inner().to_vec()
	} else if base_type == SigHashType::All as u32 {
		let mut enc = Vec::new();
		for txout in tx.output.iter() {
			enc.extend_from_slice(&encode::serialize(txout));
		}
		Sha256dHash::hash(&enc).into_inner().to_vec()
	} else {
		[0; 32].to_vec()
	};
	preimage.extend_from_slice(&hash_outputs);
	preimage.extend_from_slice(&encode::serialize(&tx.lock_time));
	preimage.extend_from_slice(&encode::serialize(&(sighash_type as u32)));

	hash_to_message!(&Sha256dHash::hash(&preimage)[..])
}

/// Fills in the witness of a commitment (or closing) transaction input given both funding
/// signatures, in the funding pubkeys' lexical order.
pub fn finalize_funding_input(tx: &mut Transaction, our_sig: &Signature, their_sig: &Signature, our_funding_key: &PublicKey, their_funding_key: &PublicKey, funding_redeemscript: &Script) {
	assert!(tx.input.len() == 1);
	assert!(tx.input[0].witness.is_empty());
	tx.input[0].witness.push(Vec::new()); // First is the multisig dummy

	if our_funding_key.serialize()[..] < their_funding_key.serialize()[..] {
		tx.input[0].witness.push(our_sig.serialize_der().to_vec());
		tx.input[0].witness.push(their_sig.serialize_der().to_vec());
	} else {
		tx.input[0].witness.push(their_sig.serialize_der().to_vec());
		tx.input[0].witness.push(our_sig.serialize_der().to_vec());
	}
	tx.input[0].witness[1].push(SigHashType::All as u8);
	tx.input[0].witness[2].push(SigHashType::All as u8);
	tx.input[0].witness.push(funding_redeemscript.to_bytes());
}

/// Fills in the witness of a second-stage HTLC transaction: multisig dummy, both HTLC
/// signatures, then the preimage (success) or an empty vector (timeout), then the redeemscript.
/// `their_sighash_type` carries the anchor-format ANYONECANPAY flag on the counterparty's
/// signature.
pub fn finalize_htlc_input(tx: &mut Transaction, our_sig: &Signature, their_sig: &Signature, their_sighash_type: SigHashType, preimage: &Option<PaymentPreimage>, htlc_redeemscript: &Script) {
	assert!(tx.input.len() == 1);
	assert!(tx.input[0].witness.is_empty());
	tx.input[0].witness.push(Vec::new()); // First is the multisig dummy

	// The redeemscript orders the keys countersignatory-first.
	tx.input[0].witness.push(their_sig.serialize_der().to_vec());
	tx.input[0].witness[1].push(their_sighash_type as u8);
	tx.input[0].witness.push(our_sig.serialize_der().to_vec());
	tx.input[0].witness[2].push(SigHashType::All as u8);

	match preimage {
		&Some(ref preimage) => tx.input[0].witness.push(preimage.0.to_vec()),
		&None => tx.input[0].witness.push(Vec::new()),
	}
	tx.input[0].witness.push(htlc_redeemscript.to_bytes());
}

#[cfg(test)]
mod tests {
	use super::*;
	use hex;
	use secp256k1::key::{PublicKey, SecretKey};
	use secp256k1::Secp256k1;
	use ln::PaymentHash;
	use ln::msgs::{OnionPacket, UpdateAddHTLC};

	fn secret_from_hex(hex_str: &str) -> [u8; 32] {
		let mut res = [0; 32];
		res[..].copy_from_slice(&hex::decode(hex_str).unwrap());
		res
	}

	#[test]
	fn test_per_commitment_secret_gen() {
		// Test vectors from BOLT 3 Appendix D:
		let seed0 = [0; 32];
		assert_eq!(build_commitment_secret(&seed0, 281474976710655),
		           secret_from_hex("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"));

		let seedff = [0xff; 32];
		assert_eq!(build_commitment_secret(&seedff, 281474976710655),
		           secret_from_hex("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"));

		assert_eq!(build_commitment_secret(&seedff, 0xaaaaaaaaaaa),
		           secret_from_hex("56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528"));

		assert_eq!(build_commitment_secret(&seedff, 0x555555555555),
		           secret_from_hex("9015daaeb06dba4ccc05b91b2f73bd54405f2be9f217fbacd3c5ac2e62327d31"));

		let seed01 = secret_from_hex("0101010101010101010101010101010101010101010101010101010101010101");
		assert_eq!(build_commitment_secret(&seed01, 1),
		           secret_from_hex("915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c"));
	}

	#[test]
	fn test_per_commitment_storage() {
		// Test vectors from BOLT 3:
		let mut secrets: Vec<[u8; 32]> = Vec::new();
		let mut store = RevocationStore::new();

		macro_rules! test_secrets {
			() => {
				let mut idx = 281474976710655;
				for secret in secrets.iter() {
					assert_eq!(store.get_secret(idx).unwrap(), *secret);
					idx -= 1;
				}
				assert_eq!(store.get_min_seen_secret(), idx + 1);
				assert!(store.get_secret(idx).is_none());
			};
		}

		{
			// insert_secret correct sequence
			secrets.push(secret_from_hex("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"));
			store.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964"));
			store.provide_secret(281474976710654, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8"));
			store.provide_secret(281474976710653, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116"));
			store.provide_secret(281474976710652, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("c65716add7aa98ba7acb236352d665cab17345fe45b55fb879ff80e6bd0c41dd"));
			store.provide_secret(281474976710651, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2"));
			store.provide_secret(281474976710650, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("a5a64476122ca0925fb344bdc1854c1c0a59fc614298e50a33e331980a220f32"));
			store.provide_secret(281474976710649, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("05cde6323d949933f7f7b78776bcc1ea6d9b31447732e3802e1f7ac44b650e17"));
			store.provide_secret(281474976710648, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();
		}

		{
			// insert_secret #1 incorrect
			store = RevocationStore::new();
			secrets.clear();

			secrets.push(secret_from_hex("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"));
			store.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964"));
			assert!(store.provide_secret(281474976710654, secrets.last().unwrap().clone()).is_err());
		}

		{
			// insert_secret #2 incorrect (#1 derived from incorrect)
			store = RevocationStore::new();
			secrets.clear();

			secrets.push(secret_from_hex("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"));
			store.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("dddc3a8d14fddf2b68fa8c7fbad2748274937479dd0f8930d5ebb4ab6bd866a3"));
			store.provide_secret(281474976710654, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8"));
			store.provide_secret(281474976710653, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116"));
			assert!(store.provide_secret(281474976710652, secrets.last().unwrap().clone()).is_err());
		}

		{
			// insert_secret #5 incorrect
			store = RevocationStore::new();
			secrets.clear();

			secrets.push(secret_from_hex("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"));
			store.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964"));
			store.provide_secret(281474976710654, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8"));
			store.provide_secret(281474976710653, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116"));
			store.provide_secret(281474976710652, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("631373ad5f9ef654bb3dade742d09504c567edd24320d2fcd68e3cc47e2ff6a6"));
			store.provide_secret(281474976710651, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2"));
			assert!(store.provide_secret(281474976710650, secrets.last().unwrap().clone()).is_err());
		}
	}

	#[test]
	fn test_obscure_factor_vector() {
		// BOLT 3 Appendix C: local payment basepoint and remote payment basepoint give an
		// obscuring factor of 0x2bb038521914.
		let opener = PublicKey::from_slice(&hex::decode("034f355bdcb7cc0af728ef3cceb9615d90684bb5b2ca5f859ab0f0b704075871aa").unwrap()).unwrap();
		let accepter = PublicKey::from_slice(&hex::decode("032c0b7cf95324a07d05398b240174dc0c2be444d96b159aa6c7f7b1e668680991").unwrap()).unwrap();
		assert_eq!(commitment_number_obscure_factor(&opener, &accepter), 0x2bb038521914);
	}

	#[test]
	fn test_commitment_number_roundtrip() {
		use rand::{thread_rng, Rng};
		let mut rng = thread_rng();
		for _ in 0..1000 {
			let obscure: u64 = rng.gen::<u64>() & 0xffff_ffff_ffff;
			let number: u64 = rng.gen::<u64>() & 0xffff_ffff_ffff;
			let (sequence, locktime) = encode_commitment_number(number, obscure);
			assert_eq!(sequence >> 24, 0x80);
			assert_eq!(locktime >> 24, 0x20);
			assert_eq!(decode_commitment_number(sequence, locktime, obscure), number);
		}
		// The endpoints too.
		for &number in [0u64, 1, (1 << 48) - 1].iter() {
			let (sequence, locktime) = encode_commitment_number(number, 0x2bb038521914);
			assert_eq!(decode_commitment_number(sequence, locktime, 0x2bb038521914), number);
		}
	}

	fn dummy_onion() -> OnionPacket {
		OnionPacket {
			version: 0,
			public_key: PublicKey::from_slice(&[2; 33]),
			hop_data: [0; 20 * 65],
			hmac: [0; 32],
		}
	}

	fn dummy_add(htlc_id: u64, amount_msat: u64, cltv_expiry: u32, hash_byte: u8) -> UpdateAddHTLC {
		UpdateAddHTLC {
			channel_id: [5; 32],
			htlc_id,
			amount_msat,
			payment_hash: PaymentHash([hash_byte; 32]),
			cltv_expiry,
			onion_routing_packet: dummy_onion(),
		}
	}

	fn dummy_keys() -> TxCreationKeys {
		let secp_ctx = Secp256k1::new();
		let pk = |b: u8| PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[b; 32]).unwrap());
		TxCreationKeys::new(&secp_ctx, &pk(1), &pk(2), &pk(3), &pk(4), &pk(5), &pk(6), false).unwrap()
	}

	fn funding_outpoint() -> OutPoint {
		use bitcoin_hashes::Hash;
		OutPoint::new(Sha256dHash::hash(&[42; 32]), 0)
	}

	#[test]
	fn test_dust_trimming_boundary() {
		// An offered HTLC at exactly dust_limit + timeout-fee stays; one msat below is trimmed.
		let format = CommitmentFormat::Legacy;
		let feerate = 10_000;
		let dust_limit = 1_100;
		let threshold_sat = offered_htlc_trim_threshold(format, dust_limit, feerate);

		let spec_at = CommitmentSpec {
			htlcs: vec![DirectedHtlc { direction: HtlcDirection::Offered, add: dummy_add(0, threshold_sat * 1000, 500, 1) }],
			feerate_per_kw: feerate,
			to_local_msat: 700_000_000,
			to_remote_msat: 300_000_000 - threshold_sat * 1000,
		};
		let (tx, htlcs) = build_commitment_tx(&funding_outpoint(), &dummy_keys(), &spec_at, format, 42, 0,
			dust_limit, true, 144, &dummy_keys().a_htlc_key, &dummy_keys().b_htlc_key);
		assert_eq!(tx.output.len(), 3);
		assert!(htlcs[0].transaction_output_index.is_some());

		let spec_below = CommitmentSpec {
			htlcs: vec![DirectedHtlc { direction: HtlcDirection::Offered, add: dummy_add(0, threshold_sat * 1000 - 1, 500, 1) }],
			..spec_at.clone()
		};
		let (tx, htlcs) = build_commitment_tx(&funding_outpoint(), &dummy_keys(), &spec_below, format, 42, 0,
			dust_limit, true, 144, &dummy_keys().a_htlc_key, &dummy_keys().b_htlc_key);
		assert_eq!(tx.output.len(), 2);
		assert!(htlcs[0].transaction_output_index.is_none());
	}

	#[test]
	fn test_commit_fee_matches_funder_deduction() {
		let format = CommitmentFormat::Legacy;
		let feerate = 10_000;
		let dust_limit = 546;
		let spec = CommitmentSpec {
			htlcs: vec![
				DirectedHtlc { direction: HtlcDirection::Offered, add: dummy_add(0, 40_000_000, 500, 1) },
				DirectedHtlc { direction: HtlcDirection::Received, add: dummy_add(0, 30_000_000, 501, 2) },
			],
			feerate_per_kw: feerate,
			to_local_msat: 600_000_000,
			to_remote_msat: 330_000_000,
		};
		let fee = spec.commit_tx_fee(format, dust_limit);
		assert_eq!(fee, weight2fee(feerate, 724 + 2 * 172));

		let (tx, _) = build_commitment_tx(&funding_outpoint(), &dummy_keys(), &spec, format, 7, 0,
			dust_limit, true, 144, &dummy_keys().a_htlc_key, &dummy_keys().b_htlc_key);
		let total_out: u64 = tx.output.iter().map(|o| o.value).sum();
		// Funder (owner here) main output carries the whole fee.
		assert_eq!(total_out + fee, 600_000 + 330_000 + 40_000 + 30_000);
	}

	#[test]
	fn test_anchor_format_outputs() {
		let format = CommitmentFormat::AnchorOutputs;
		let secp_ctx = Secp256k1::new();
		let funding_a = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[11; 32]).unwrap());
		let funding_b = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[12; 32]).unwrap());
		let spec = CommitmentSpec {
			htlcs: Vec::new(),
			feerate_per_kw: 5_000,
			to_local_msat: 500_000_000,
			to_remote_msat: 500_000_000,
		};
		let (tx, _) = build_commitment_tx(&funding_outpoint(), &dummy_keys(), &spec, format, 0, 0,
			546, true, 144, &funding_a, &funding_b);
		// to_local, to_remote and two anchors.
		assert_eq!(tx.output.len(), 4);
		let anchors: Vec<_> = tx.output.iter().filter(|o| o.value == ANCHOR_OUTPUT_VALUE_SATOSHIS).collect();
		assert_eq!(anchors.len(), 2);
		let fee = spec.commit_tx_fee(format, 546);
		let total_out: u64 = tx.output.iter().map(|o| o.value).sum();
		assert_eq!(total_out + fee, 1_000_000);
	}

	#[test]
	fn test_output_ordering_is_total_and_stable() {
		// Two offered HTLCs with identical amount and hash must order by CLTV expiry.
		let format = CommitmentFormat::Legacy;
		let spec = CommitmentSpec {
			htlcs: vec![
				DirectedHtlc { direction: HtlcDirection::Offered, add: dummy_add(1, 50_000_000, 502, 9) },
				DirectedHtlc { direction: HtlcDirection::Offered, add: dummy_add(0, 50_000_000, 501, 9) },
			],
			feerate_per_kw: 1_000,
			to_local_msat: 500_000_000,
			to_remote_msat: 400_000_000,
		};
		let (tx, htlcs) = build_commitment_tx(&funding_outpoint(), &dummy_keys(), &spec, format, 3, 0,
			546, true, 144, &dummy_keys().a_htlc_key, &dummy_keys().b_htlc_key);
		let h501 = htlcs.iter().find(|h| h.cltv_expiry == 501).unwrap();
		let h502 = htlcs.iter().find(|h| h.cltv_expiry == 502).unwrap();
		assert!(h501.transaction_output_index.unwrap() < h502.transaction_output_index.unwrap());

		// Same inputs, same result.
		let (tx2, _) = build_commitment_tx(&funding_outpoint(), &dummy_keys(), &spec, format, 3, 0,
			546, true, 144, &dummy_keys().a_htlc_key, &dummy_keys().b_htlc_key);
		assert_eq!(tx.txid(), tx2.txid());
	}

	#[test]
	fn test_spec_reduce() {
		use ln::msgs::{UpdateFulfillHTLC, UpdateFailHTLC, OnionErrorPacket, UpdateMessage};
		use ln::PaymentPreimage;

		let spec = CommitmentSpec {
			htlcs: Vec::new(),
			feerate_per_kw: 1_000,
			to_local_msat: 600_000_000,
			to_remote_msat: 400_000_000,
		};

		// We add one HTLC, the peer adds one.
		let ours = vec![UpdateMessage::AddHtlc(dummy_add(0, 10_000_000, 500, 1))];
		let theirs = vec![UpdateMessage::AddHtlc(dummy_add(0, 5_000_000, 501, 2))];
		let spec1 = spec.reduce(&ours, &theirs).unwrap();
		assert_eq!(spec1.to_local_msat, 590_000_000);
		assert_eq!(spec1.to_remote_msat, 395_000_000);
		assert_eq!(spec1.htlcs.len(), 2);

		// The peer fulfills our HTLC, we fail theirs: value moves to them, theirs returns.
		let ours = vec![UpdateMessage::FailHtlc(UpdateFailHTLC {
			channel_id: [5; 32], htlc_id: 0, reason: OnionErrorPacket { data: vec![1, 2, 3] },
		})];
		let theirs = vec![UpdateMessage::FulfillHtlc(UpdateFulfillHTLC {
			channel_id: [5; 32], htlc_id: 0, payment_preimage: PaymentPreimage([0; 32]),
		})];
		let spec2 = spec1.reduce(&ours, &theirs).unwrap();
		assert_eq!(spec2.to_local_msat, 590_000_000);
		assert_eq!(spec2.to_remote_msat, 410_000_000);
		assert!(spec2.htlcs.is_empty());
		// Capacity is conserved throughout.
		assert_eq!(spec2.to_local_msat + spec2.to_remote_msat, 1_000_000_000);

		// Settling an unknown id is a protocol violation, not a panic.
		let bogus = vec![UpdateMessage::FulfillHtlc(UpdateFulfillHTLC {
			channel_id: [5; 32], htlc_id: 42, payment_preimage: PaymentPreimage([0; 32]),
		})];
		assert_eq!(spec2.reduce(&bogus, &[]).unwrap_err(), SpecError::UnknownHtlc(42));
	}
}
