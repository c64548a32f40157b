//! Wire messages, traits representing wire message handlers, and a few error types live here.
//!
//! For a normal node you probably don't need to use anything here, however, if you wish to split a
//! node into an internet-facing route/message socket handling daemon and a channel daemon, the
//! framing helpers here allow you to shuttle messages between the two as raw bytes: every message
//! round-trips bit-identically through its `Writeable`/`Readable` implementation, and
//! [`read_message`]/[`write_message`] add the two-byte BOLT type prefix.

use secp256k1;
use secp256k1::key::PublicKey;
use secp256k1::Signature;
use bitcoin_hashes::sha256d::Hash as Sha256dHash;
use bitcoin::blockdata::script::Script;

use std::error::Error;
use std::io::Read;
use std::fmt;
use std::result::Result;

use ln::{PaymentHash, PaymentPreimage};
use util::ser::{Readable, Writeable, Writer};

/// An error in decoding a message or struct.
#[derive(Debug)]
pub enum DecodeError {
	/// A version byte specified something we don't know how to handle.
	/// Includes unknown realm byte in an OnionHopData packet
	UnknownVersion,
	/// Unknown feature mandating we fail to parse message
	UnknownRequiredFeature,
	/// Value was invalid, eg a byte which was supposed to be a bool was something other than a 0
	/// or 1, a public key/private key/signature was invalid, text wasn't UTF-8, etc
	InvalidValue,
	/// Buffer too short
	ShortRead,
	/// A length descriptor in the packet didn't describe the later data correctly
	BadLengthDescriptor,
	/// Error from std::io
	Io(::std::io::Error),
}

impl Error for DecodeError {
	fn description(&self) -> &str {
		match *self {
			DecodeError::UnknownVersion => "Unknown realm byte in Onion packet",
			DecodeError::UnknownRequiredFeature => "Unknown required feature preventing decode",
			DecodeError::InvalidValue => "Nonsense bytes didn't map to the type they were interpreted as",
			DecodeError::ShortRead => "Packet extended beyond the provided bytes",
			DecodeError::BadLengthDescriptor => "A length descriptor in the packet didn't describe the later data correctly",
			DecodeError::Io(ref e) => e.description(),
		}
	}
}
impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.description())
	}
}

impl From<::std::io::Error> for DecodeError {
	fn from(e: ::std::io::Error) -> Self {
		if e.kind() == ::std::io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e)
		}
	}
}

/// Tracks the set of features which a node implements, templated by the context in which it
/// appears. We only track the handful the channel engine cares about.
#[derive(Clone, PartialEq)]
pub struct Features {
	flags: Vec<u8>,
}

macro_rules! feature_bit {
	($getter: ident, $setter: ident, $bit: expr) => {
		/// Checks whether the feature is advertised, either optional or required.
		pub fn $getter(&self) -> bool {
			let byte = $bit / 8;
			self.flags.len() > byte && (self.flags[byte] & (3u8 << ($bit - byte * 8))) != 0
		}
		/// Advertises the feature as optional.
		pub fn $setter(mut self) -> Self {
			let byte = $bit / 8 + 1;
			if self.flags.len() < byte {
				self.flags.resize(byte, 0);
			}
			self.flags[byte - 1] |= 1 << ($bit + 1 - (byte - 1) * 8);
			self
		}
	}
}

impl Features {
	/// Creates a features set with only option_data_loss_protect set, the one feature this engine
	/// always runs with.
	pub fn new() -> Features {
		Features {
			flags: vec![1 << 1],
		}
	}

	/// Creates a completely empty features set (for tests exercising legacy peers).
	pub fn empty() -> Features {
		Features { flags: Vec::new() }
	}

	feature_bit!(supports_data_loss_protect, set_data_loss_protect, 0);
	feature_bit!(supports_upfront_shutdown_script, set_upfront_shutdown_script, 4);
	feature_bit!(supports_static_remote_key, set_static_remote_key, 12);
	feature_bit!(supports_wumbo, set_wumbo, 18);
	feature_bit!(supports_anchor_outputs, set_anchor_outputs, 20);

	/// Returns true if a peer requires a feature bit we have no understanding of.
	pub fn requires_unknown_bits(&self) -> bool {
		const KNOWN: [u8; 3] = [
			0b0011_0011, // data_loss_protect, upfront_shutdown_script
			0b0011_0000, // static_remote_key
			0b0011_1100, // wumbo, anchor_outputs
		];
		for (idx, &byte) in self.flags.iter().enumerate() {
			let known = if idx < KNOWN.len() { KNOWN[idx] } else { 0 };
			// Even (required) bits only.
			if (byte & 0b0101_0101 & !known) != 0 {
				return true;
			}
		}
		false
	}
}

impl Writeable for Features {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		(self.flags.len() as u16).write(w)?;
		for f in self.flags.iter() {
			f.write(w)?;
		}
		Ok(())
	}
}

impl<R: Read> Readable<R> for Features {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let len = <u16 as Readable<R>>::read(r)? as usize;
		let mut flags = vec![0; len];
		r.read_exact(&mut flags)?;
		Ok(Features { flags })
	}
}

/// An init message to be sent or received from a peer
pub struct Init {
	/// Global features (historic; carried for wire compatibility).
	pub global_features: Features,
	/// The features the peer supports for channels with us.
	pub local_features: Features,
}

/// An error message to be sent or received from a peer
#[derive(Clone)]
pub struct ErrorMessage {
	/// The channel id the error applies to, or all-zeroes for all channels.
	pub channel_id: [u8; 32],
	/// The diagnostic. May contain arbitrary bytes; sanitize before printing.
	pub data: String,
}

/// A ping message to be sent or received from a peer
pub struct Ping {
	/// The desired response length
	pub ponglen: u16,
	/// The ping packet size.
	/// This field is not sent on the wire. byteslen zeros are sent.
	pub byteslen: u16,
}

/// A pong message to be sent or received from a peer
pub struct Pong {
	/// The pong packet size.
	/// This field is not sent on the wire. byteslen zeros are sent.
	pub byteslen: u16,
}

/// An open_channel message to be sent or received from a peer
#[derive(Clone)]
pub struct OpenChannel {
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: Sha256dHash,
	/// A temporary channel ID, until the funding outpoint is announced
	pub temporary_channel_id: [u8; 32],
	/// The channel value
	pub funding_satoshis: u64,
	/// The amount to push to the counterparty as part of the open, in milli-satoshi
	pub push_msat: u64,
	/// The threshold below which outputs on transactions broadcast by sender will be omitted
	pub dust_limit_satoshis: u64,
	/// The maximum inbound HTLC value in flight towards sender, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum value unencumbered by HTLCs for the counterparty to keep in the channel
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size incoming to sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The feerate per 1000-weight of sender generated transactions, until updated by update_fee
	pub feerate_per_kw: u32,
	/// The number of blocks which the counterparty will have to wait to claim on-chain funds if
	/// they broadcast a commitment transaction
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs towards sender
	pub max_accepted_htlcs: u16,
	/// The sender's key controlling the funding transaction
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key for transactions broadcast by counterparty
	pub revocation_basepoint: PublicKey,
	/// A payment key to sender for transactions broadcast by counterparty
	pub payment_basepoint: PublicKey,
	/// Used to derive a payment key to sender for transactions broadcast by sender
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive an HTLC payment key to sender
	pub htlc_basepoint: PublicKey,
	/// The first to-be-broadcast-by-sender transaction's per commitment point
	pub first_per_commitment_point: PublicKey,
	/// Channel flags; bit 0 indicates the channel should be announced publicly
	pub channel_flags: u8,
	/// Optionally, a request to pre-set the to-sender output's scriptPubkey for when we collaboratively close
	pub shutdown_scriptpubkey: OptionalField<Script>,
}

/// An accept_channel message to be sent or received from a peer
#[derive(Clone)]
pub struct AcceptChannel {
	/// The same temporary channel ID as given in the open_channel
	pub temporary_channel_id: [u8; 32],
	/// The threshold below which outputs on transactions broadcast by sender will be omitted
	pub dust_limit_satoshis: u64,
	/// The maximum inbound HTLC value in flight towards sender, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum value unencumbered by HTLCs for the counterparty to keep in the channel
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size incoming to sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// Minimum depth of the funding transaction before the channel is considered open
	pub minimum_depth: u32,
	/// The number of blocks which the counterparty will have to wait to claim on-chain funds if
	/// they broadcast a commitment transaction
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs towards sender
	pub max_accepted_htlcs: u16,
	/// The sender's key controlling the funding transaction
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key for transactions broadcast by counterparty
	pub revocation_basepoint: PublicKey,
	/// A payment key to sender for transactions broadcast by counterparty
	pub payment_basepoint: PublicKey,
	/// Used to derive a payment key to sender for transactions broadcast by sender
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive an HTLC payment key to sender
	pub htlc_basepoint: PublicKey,
	/// The first to-be-broadcast-by-sender transaction's per commitment point
	pub first_per_commitment_point: PublicKey,
	/// Optionally, a request to pre-set the to-sender output's scriptPubkey for when we collaboratively close
	pub shutdown_scriptpubkey: OptionalField<Script>,
}

/// A funding_created message to be sent or received from a peer
#[derive(Clone)]
pub struct FundingCreated {
	/// The same temporary channel ID as given in the open_channel
	pub temporary_channel_id: [u8; 32],
	/// The funding transaction ID
	pub funding_txid: Sha256dHash,
	/// The specific output index funding this channel
	pub funding_output_index: u16,
	/// The signature of the channel initiator (funder) on the funding transaction
	pub signature: Signature,
}

/// A funding_signed message to be sent or received from a peer
#[derive(Clone)]
pub struct FundingSigned {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The signature of the channel acceptor (fundee) on the funding transaction
	pub signature: Signature,
}

/// A funding_locked message to be sent or received from a peer
#[derive(Clone)]
pub struct FundingLocked {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The per-commitment point of the second commitment transaction
	pub next_per_commitment_point: PublicKey,
}

/// A shutdown message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct Shutdown {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The destination of this peer's funds on closing.
	/// Must be in one of these forms: p2pkh, p2sh, p2wpkh, p2wsh.
	pub scriptpubkey: Script,
}

/// A closing_signed message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct ClosingSigned {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The proposed total fee for the closing transaction
	pub fee_satoshis: u64,
	/// A signature on the closing transaction
	pub signature: Signature,
}

/// An update_add_htlc message to be sent or received from a peer
#[derive(Clone, PartialEq, Debug)]
pub struct UpdateAddHTLC {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The HTLC ID
	pub htlc_id: u64,
	/// The HTLC value in milli-satoshi
	pub amount_msat: u64,
	/// The payment hash, the pre-image of which controls HTLC redemption
	pub payment_hash: PaymentHash,
	/// The expiry height of the HTLC
	pub cltv_expiry: u32,
	/// The onion routing packet with encrypted data for the next hop. Opaque to the engine.
	pub onion_routing_packet: OnionPacket,
}

/// An update_fulfill_htlc message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct UpdateFulfillHTLC {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The HTLC ID
	pub htlc_id: u64,
	/// The pre-image of the payment hash, allowing HTLC redemption
	pub payment_preimage: PaymentPreimage,
}

/// An update_fail_htlc message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct UpdateFailHTLC {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The HTLC ID
	pub htlc_id: u64,
	/// The reason field, onion-encrypted hop by hop back to the payer.
	pub reason: OnionErrorPacket,
}

/// An update_fail_malformed_htlc message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct UpdateFailMalformedHTLC {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The HTLC ID
	pub htlc_id: u64,
	/// The SHA256 of the onion the sender could not parse
	pub sha256_of_onion: [u8; 32],
	/// The failure code. Must have the BADONION bit set.
	pub failure_code: u16,
}

/// A commitment_signed message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct CommitmentSigned {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// A signature on the commitment transaction
	pub signature: Signature,
	/// Signatures on the HTLC transactions, in commitment output order
	pub htlc_signatures: Vec<Signature>,
}

/// A revoke_and_ack message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct RevokeAndACK {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The secret corresponding to the per-commitment point of the revoked commitment
	pub per_commitment_secret: [u8; 32],
	/// The next sender-broadcast commitment transaction's per-commitment point
	pub next_per_commitment_point: PublicKey,
}

/// An update_fee message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct UpdateFee {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// Fee rate per 1000-weight of the transaction
	pub feerate_per_kw: u32,
}

/// Proof that the sender knows the per-commitment secret of the previous commitment transaction,
/// appended to channel_reestablish when option_data_loss_protect is negotiated (always, here).
#[derive(Clone, PartialEq)]
pub struct DataLossProtect {
	/// Proof that the sender knows the per-commitment secret of a specific commitment transaction
	/// belonging to the recipient
	pub your_last_per_commitment_secret: [u8; 32],
	/// The sender's per-commitment point for their current commitment transaction
	pub my_current_per_commitment_point: PublicKey,
}

/// A channel_reestablish message to be sent or received from a peer
#[derive(Clone, PartialEq)]
pub struct ChannelReestablish {
	/// The channel ID
	pub channel_id: [u8; 32],
	/// The next commitment number for the sender
	pub next_local_commitment_number: u64,
	/// The next commitment number for the recipient
	pub next_remote_commitment_number: u64,
	/// Optionally, a field proving that next_remote_commitment_number-1 has been revoked
	pub data_loss_protect: OptionalField<DataLossProtect>,
}

/// An optional field whose presence is detected by whether bytes remain in the message.
#[derive(Clone, PartialEq)]
pub enum OptionalField<T> {
	/// Optional field is included in message
	Present(T),
	/// Optional field is absent in message
	Absent,
}

/// The update messages a changes log holds: everything the protocol lets one side propose
/// between two signatures.
#[derive(Clone, PartialEq)]
pub enum UpdateMessage {
	/// A proposed new HTLC.
	AddHtlc(UpdateAddHTLC),
	/// A proposed removal by preimage.
	FulfillHtlc(UpdateFulfillHTLC),
	/// A proposed removal by failure.
	FailHtlc(UpdateFailHTLC),
	/// A proposed removal for an undecodable onion.
	FailMalformedHtlc(UpdateFailMalformedHTLC),
	/// A proposed feerate change (funder only).
	Fee(UpdateFee),
}

impl UpdateMessage {
	/// The id of the HTLC this update adds or removes, if any.
	pub fn htlc_id(&self) -> Option<u64> {
		match self {
			&UpdateMessage::AddHtlc(ref msg) => Some(msg.htlc_id),
			&UpdateMessage::FulfillHtlc(ref msg) => Some(msg.htlc_id),
			&UpdateMessage::FailHtlc(ref msg) => Some(msg.htlc_id),
			&UpdateMessage::FailMalformedHtlc(ref msg) => Some(msg.htlc_id),
			&UpdateMessage::Fee(_) => None,
		}
	}
}

// ---- onion payloads (opaque to the engine) ----

/// BOLT 4 onion packet including hop data for the receiving node. The engine treats the contents
/// as an opaque byte string; only payment-hash, amount, expiry and the relay decision attached by
/// the outer node matter to it.
#[derive(Debug)]
pub struct OnionPacket {
	/// bolt 04 version number
	pub version: u8,
	/// In order to ensure we always return an error on Onion decode in compliance with BOLT 4, we
	/// have to deserialize OnionPackets contained in UpdateAddHTLCs even if the ephemeral public
	/// key (here) is bogus, so we hold a Result instead of a PublicKey as we'd like.
	pub public_key: Result<PublicKey, secp256k1::Error>,
	/// 1300 bytes encrypted payload for the next hop
	pub hop_data: [u8; 20 * 65],
	/// HMAC to verify the integrity of hop_data
	pub hmac: [u8; 32],
}

impl Clone for OnionPacket {
	fn clone(&self) -> OnionPacket {
		OnionPacket {
			version: self.version,
			public_key: self.public_key.clone(),
			hop_data: self.hop_data,
			hmac: self.hmac,
		}
	}
}

impl PartialEq for OnionPacket {
	fn eq(&self, other: &OnionPacket) -> bool {
		self.version == other.version && self.public_key == other.public_key &&
			&self.hop_data[..] == &other.hop_data[..] && self.hmac == other.hmac
	}
}

/// An onion-wrapped error payload relayed backwards along a payment path. Opaque to the engine.
#[derive(Clone, PartialEq)]
pub struct OnionErrorPacket {
	/// The encrypted failure data.
	pub data: Vec<u8>,
}

// BOLT 4 failure codes the engine itself produces when settling on-chain or rejecting relays.
/// Failure code bit set when the failing node included a channel update.
pub const UPDATE: u16 = 0x1000;
/// Failure code bit indicating a permanent failure.
pub const PERM: u16 = 0x4000;
/// Failure code bit indicating the failing node is the final recipient.
pub const NODE: u16 = 0x2000;
/// Failure code bit required on all update_fail_malformed_htlc failure codes.
pub const BADONION: u16 = 0x8000;
/// The payment details were wrong or unknown to the final node.
pub const INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS: u16 = PERM | 15;
/// The channel is temporarily unable to relay (eg capacity, disconnection).
pub const TEMPORARY_CHANNEL_FAILURE: u16 = UPDATE | 7;
/// The channel can no longer relay at all (eg it is closing).
pub const PERMANENT_CHANNEL_FAILURE: u16 = PERM | 8;

// ---- serialization ----

impl_writeable!(Init, { global_features, local_features });
impl_writeable!(FundingCreated, { temporary_channel_id, funding_txid, funding_output_index, signature });
impl_writeable!(FundingSigned, { channel_id, signature });
impl_writeable!(FundingLocked, { channel_id, next_per_commitment_point });
impl_writeable!(Shutdown, { channel_id, scriptpubkey });
impl_writeable!(ClosingSigned, { channel_id, fee_satoshis, signature });
impl_writeable!(UpdateAddHTLC, { channel_id, htlc_id, amount_msat, payment_hash, cltv_expiry, onion_routing_packet });
impl_writeable!(UpdateFulfillHTLC, { channel_id, htlc_id, payment_preimage });
impl_writeable!(UpdateFailHTLC, { channel_id, htlc_id, reason });
impl_writeable!(UpdateFailMalformedHTLC, { channel_id, htlc_id, sha256_of_onion, failure_code });
impl_writeable!(CommitmentSigned, { channel_id, signature, htlc_signatures });
impl_writeable!(RevokeAndACK, { channel_id, per_commitment_secret, next_per_commitment_point });
impl_writeable!(UpdateFee, { channel_id, feerate_per_kw });

impl Writeable for OpenChannel {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.chain_hash.write(w)?;
		self.temporary_channel_id.write(w)?;
		self.funding_satoshis.write(w)?;
		self.push_msat.write(w)?;
		self.dust_limit_satoshis.write(w)?;
		self.max_htlc_value_in_flight_msat.write(w)?;
		self.channel_reserve_satoshis.write(w)?;
		self.htlc_minimum_msat.write(w)?;
		self.feerate_per_kw.write(w)?;
		self.to_self_delay.write(w)?;
		self.max_accepted_htlcs.write(w)?;
		self.funding_pubkey.write(w)?;
		self.revocation_basepoint.write(w)?;
		self.payment_basepoint.write(w)?;
		self.delayed_payment_basepoint.write(w)?;
		self.htlc_basepoint.write(w)?;
		self.first_per_commitment_point.write(w)?;
		self.channel_flags.write(w)?;
		self.shutdown_scriptpubkey.write(w)
	}
}

impl<R: Read> Readable<R> for OpenChannel {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		Ok(OpenChannel {
			chain_hash: Readable::read(r)?,
			temporary_channel_id: Readable::read(r)?,
			funding_satoshis: Readable::read(r)?,
			push_msat: Readable::read(r)?,
			dust_limit_satoshis: Readable::read(r)?,
			max_htlc_value_in_flight_msat: Readable::read(r)?,
			channel_reserve_satoshis: Readable::read(r)?,
			htlc_minimum_msat: Readable::read(r)?,
			feerate_per_kw: Readable::read(r)?,
			to_self_delay: Readable::read(r)?,
			max_accepted_htlcs: Readable::read(r)?,
			funding_pubkey: Readable::read(r)?,
			revocation_basepoint: Readable::read(r)?,
			payment_basepoint: Readable::read(r)?,
			delayed_payment_basepoint: Readable::read(r)?,
			htlc_basepoint: Readable::read(r)?,
			first_per_commitment_point: Readable::read(r)?,
			channel_flags: Readable::read(r)?,
			shutdown_scriptpubkey: Readable::read(r)?,
		})
	}
}

impl Writeable for AcceptChannel {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.temporary_channel_id.write(w)?;
		self.dust_limit_satoshis.write(w)?;
		self.max_htlc_value_in_flight_msat.write(w)?;
		self.channel_reserve_satoshis.write(w)?;
		self.htlc_minimum_msat.write(w)?;
		self.minimum_depth.write(w)?;
		self.to_self_delay.write(w)?;
		self.max_accepted_htlcs.write(w)?;
		self.funding_pubkey.write(w)?;
		self.revocation_basepoint.write(w)?;
		self.payment_basepoint.write(w)?;
		self.delayed_payment_basepoint.write(w)?;
		self.htlc_basepoint.write(w)?;
		self.first_per_commitment_point.write(w)?;
		self.shutdown_scriptpubkey.write(w)
	}
}

impl<R: Read> Readable<R> for AcceptChannel {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		Ok(AcceptChannel {
			temporary_channel_id: Readable::read(r)?,
			dust_limit_satoshis: Readable::read(r)?,
			max_htlc_value_in_flight_msat: Readable::read(r)?,
			channel_reserve_satoshis: Readable::read(r)?,
			htlc_minimum_msat: Readable::read(r)?,
			minimum_depth: Readable::read(r)?,
			to_self_delay: Readable::read(r)?,
			max_accepted_htlcs: Readable::read(r)?,
			funding_pubkey: Readable::read(r)?,
			revocation_basepoint: Readable::read(r)?,
			payment_basepoint: Readable::read(r)?,
			delayed_payment_basepoint: Readable::read(r)?,
			htlc_basepoint: Readable::read(r)?,
			first_per_commitment_point: Readable::read(r)?,
			shutdown_scriptpubkey: Readable::read(r)?,
		})
	}
}

impl Writeable for OptionalField<Script> {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		match *self {
			OptionalField::Present(ref script) => {
				// Note that Writeable for script includes the 16-bit length tag for us
				script.write(w)?;
			},
			OptionalField::Absent => {}
		}
		Ok(())
	}
}

impl<R: Read> Readable<R> for OptionalField<Script> {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		match <u16 as Readable<R>>::read(r) {
			Ok(len) => {
				let mut buf = vec![0; len as usize];
				r.read_exact(&mut buf)?;
				Ok(OptionalField::Present(Script::from(buf)))
			},
			Err(DecodeError::ShortRead) => Ok(OptionalField::Absent),
			Err(e) => Err(e)
		}
	}
}

impl Writeable for OptionalField<DataLossProtect> {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		match *self {
			OptionalField::Present(ref dlp) => {
				dlp.your_last_per_commitment_secret.write(w)?;
				dlp.my_current_per_commitment_point.write(w)?;
			},
			OptionalField::Absent => {}
		}
		Ok(())
	}
}

impl<R: Read> Readable<R> for OptionalField<DataLossProtect> {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		match <[u8; 32] as Readable<R>>::read(r) {
			Ok(your_last_per_commitment_secret) => {
				Ok(OptionalField::Present(DataLossProtect {
					your_last_per_commitment_secret,
					my_current_per_commitment_point: Readable::read(r)?,
				}))
			},
			Err(DecodeError::ShortRead) => Ok(OptionalField::Absent),
			Err(e) => Err(e)
		}
	}
}

impl Writeable for ChannelReestablish {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.channel_id.write(w)?;
		self.next_local_commitment_number.write(w)?;
		self.next_remote_commitment_number.write(w)?;
		self.data_loss_protect.write(w)
	}
}

impl<R: Read> Readable<R> for ChannelReestablish {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		Ok(ChannelReestablish {
			channel_id: Readable::read(r)?,
			next_local_commitment_number: Readable::read(r)?,
			next_remote_commitment_number: Readable::read(r)?,
			data_loss_protect: Readable::read(r)?,
		})
	}
}

impl Writeable for ErrorMessage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.channel_id.write(w)?;
		(self.data.len() as u16).write(w)?;
		w.write_all(self.data.as_bytes())
	}
}

impl<R: Read> Readable<R> for ErrorMessage {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		Ok(ErrorMessage {
			channel_id: Readable::read(r)?,
			data: {
				let len: u16 = Readable::read(r)?;
				let mut data = vec![0; len as usize];
				r.read_exact(&mut data)?;
				// Unprintable bytes survive the round-trip lossily; the spec
				// wants diagnostics, not exact byte fidelity, for error text.
				String::from_utf8_lossy(&data).into_owned()
			}
		})
	}
}

impl Writeable for Ping {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.ponglen.write(w)?;
		vec![0u8; self.byteslen as usize].write(w)
	}
}

impl<R: Read> Readable<R> for Ping {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Ping {
			ponglen: Readable::read(r)?,
			byteslen: {
				let byteslen = Readable::read(r)?;
				r.read_exact(&mut vec![0u8; byteslen as usize][..])?;
				byteslen
			}
		})
	}
}

impl Writeable for Pong {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		vec![0u8; self.byteslen as usize].write(w)
	}
}

impl<R: Read> Readable<R> for Pong {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Pong {
			byteslen: {
				let byteslen = Readable::read(r)?;
				r.read_exact(&mut vec![0u8; byteslen as usize][..])?;
				byteslen
			}
		})
	}
}

impl Writeable for OnionPacket {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.version.write(w)?;
		match self.public_key {
			Ok(pubkey) => pubkey.write(w)?,
			Err(_) => [0u8; 33].write(w)?,
		}
		w.write_all(&self.hop_data)?;
		self.hmac.write(w)
	}
}

impl<R: Read> Readable<R> for OnionPacket {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		Ok(OnionPacket {
			version: Readable::read(r)?,
			public_key: {
				let mut buf = [0u8; 33];
				r.read_exact(&mut buf)?;
				PublicKey::from_slice(&buf)
			},
			hop_data: {
				let mut hop_data = [0u8; 20 * 65];
				r.read_exact(&mut hop_data)?;
				hop_data
			},
			hmac: Readable::read(r)?,
		})
	}
}

impl Writeable for OnionErrorPacket {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		(self.data.len() as u16).write(w)?;
		w.write_all(&self.data)
	}
}

impl<R: Read> Readable<R> for OnionErrorPacket {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		Ok(OnionErrorPacket {
			data: {
				let len: u16 = Readable::read(r)?;
				let mut data = vec![0; len as usize];
				r.read_exact(&mut data)?;
				data
			}
		})
	}
}

impl Writeable for UpdateMessage {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		match self {
			&UpdateMessage::AddHtlc(ref msg) => { 0u8.write(writer)?; msg.write(writer)?; },
			&UpdateMessage::FulfillHtlc(ref msg) => { 1u8.write(writer)?; msg.write(writer)?; },
			&UpdateMessage::FailHtlc(ref msg) => { 2u8.write(writer)?; msg.write(writer)?; },
			&UpdateMessage::FailMalformedHtlc(ref msg) => { 3u8.write(writer)?; msg.write(writer)?; },
			&UpdateMessage::Fee(ref msg) => { 4u8.write(writer)?; msg.write(writer)?; },
		}
		Ok(())
	}
}

impl<R: Read> Readable<R> for UpdateMessage {
	fn read(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable<R>>::read(reader)? {
			0 => UpdateMessage::AddHtlc(Readable::read(reader)?),
			1 => UpdateMessage::FulfillHtlc(Readable::read(reader)?),
			2 => UpdateMessage::FailHtlc(Readable::read(reader)?),
			3 => UpdateMessage::FailMalformedHtlc(Readable::read(reader)?),
			4 => UpdateMessage::Fee(Readable::read(reader)?),
			_ => return Err(DecodeError::InvalidValue),
		})
	}
}

// ---- framing ----

/// All messages the engine consumes or emits, for type-prefixed framing over an encrypted
/// transport owned by the driver.
pub enum Message {
	/// BOLT 1 init
	Init(Init),
	/// BOLT 1 error
	Error(ErrorMessage),
	/// BOLT 1 ping
	Ping(Ping),
	/// BOLT 1 pong
	Pong(Pong),
	/// BOLT 2 open_channel
	OpenChannel(OpenChannel),
	/// BOLT 2 accept_channel
	AcceptChannel(AcceptChannel),
	/// BOLT 2 funding_created
	FundingCreated(FundingCreated),
	/// BOLT 2 funding_signed
	FundingSigned(FundingSigned),
	/// BOLT 2 funding_locked
	FundingLocked(FundingLocked),
	/// BOLT 2 shutdown
	Shutdown(Shutdown),
	/// BOLT 2 closing_signed
	ClosingSigned(ClosingSigned),
	/// BOLT 2 update_add_htlc
	UpdateAddHTLC(UpdateAddHTLC),
	/// BOLT 2 update_fulfill_htlc
	UpdateFulfillHTLC(UpdateFulfillHTLC),
	/// BOLT 2 update_fail_htlc
	UpdateFailHTLC(UpdateFailHTLC),
	/// BOLT 2 update_fail_malformed_htlc
	UpdateFailMalformedHTLC(UpdateFailMalformedHTLC),
	/// BOLT 2 commitment_signed
	CommitmentSigned(CommitmentSigned),
	/// BOLT 2 revoke_and_ack
	RevokeAndACK(RevokeAndACK),
	/// BOLT 2 update_fee
	UpdateFee(UpdateFee),
	/// BOLT 2 channel_reestablish
	ChannelReestablish(ChannelReestablish),
	/// A message of a type we do not understand. Per BOLT 1 odd types are ignored.
	Unknown(u16),
}

impl Message {
	/// The BOLT message type number.
	pub fn type_id(&self) -> u16 {
		match self {
			&Message::Init(_) => 16,
			&Message::Error(_) => 17,
			&Message::Ping(_) => 18,
			&Message::Pong(_) => 19,
			&Message::OpenChannel(_) => 32,
			&Message::AcceptChannel(_) => 33,
			&Message::FundingCreated(_) => 34,
			&Message::FundingSigned(_) => 35,
			&Message::FundingLocked(_) => 36,
			&Message::Shutdown(_) => 38,
			&Message::ClosingSigned(_) => 39,
			&Message::UpdateAddHTLC(_) => 128,
			&Message::UpdateFulfillHTLC(_) => 130,
			&Message::UpdateFailHTLC(_) => 131,
			&Message::CommitmentSigned(_) => 132,
			&Message::RevokeAndACK(_) => 133,
			&Message::UpdateFee(_) => 134,
			&Message::UpdateFailMalformedHTLC(_) => 135,
			&Message::ChannelReestablish(_) => 136,
			&Message::Unknown(type_id) => type_id,
		}
	}
}

/// Writes a message with its two-byte type prefix.
pub fn write_message<W: Writer>(writer: &mut W, msg: &Message) -> Result<(), ::std::io::Error> {
	msg.type_id().write(writer)?;
	match msg {
		&Message::Init(ref m) => m.write(writer),
		&Message::Error(ref m) => m.write(writer),
		&Message::Ping(ref m) => m.write(writer),
		&Message::Pong(ref m) => m.write(writer),
		&Message::OpenChannel(ref m) => m.write(writer),
		&Message::AcceptChannel(ref m) => m.write(writer),
		&Message::FundingCreated(ref m) => m.write(writer),
		&Message::FundingSigned(ref m) => m.write(writer),
		&Message::FundingLocked(ref m) => m.write(writer),
		&Message::Shutdown(ref m) => m.write(writer),
		&Message::ClosingSigned(ref m) => m.write(writer),
		&Message::UpdateAddHTLC(ref m) => m.write(writer),
		&Message::UpdateFulfillHTLC(ref m) => m.write(writer),
		&Message::UpdateFailHTLC(ref m) => m.write(writer),
		&Message::UpdateFailMalformedHTLC(ref m) => m.write(writer),
		&Message::CommitmentSigned(ref m) => m.write(writer),
		&Message::RevokeAndACK(ref m) => m.write(writer),
		&Message::UpdateFee(ref m) => m.write(writer),
		&Message::ChannelReestablish(ref m) => m.write(writer),
		&Message::Unknown(_) => Ok(()),
	}
}

/// Reads a message with its two-byte type prefix. Unknown even types are a
/// [`DecodeError::UnknownRequiredFeature`]; unknown odd types parse to [`Message::Unknown`] and
/// should be ignored by the caller.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, DecodeError> {
	let type_id = <u16 as Readable<R>>::read(reader)?;
	Ok(match type_id {
		16 => Message::Init(Readable::read(reader)?),
		17 => Message::Error(Readable::read(reader)?),
		18 => Message::Ping(Readable::read(reader)?),
		19 => Message::Pong(Readable::read(reader)?),
		32 => Message::OpenChannel(Readable::read(reader)?),
		33 => Message::AcceptChannel(Readable::read(reader)?),
		34 => Message::FundingCreated(Readable::read(reader)?),
		35 => Message::FundingSigned(Readable::read(reader)?),
		36 => Message::FundingLocked(Readable::read(reader)?),
		38 => Message::Shutdown(Readable::read(reader)?),
		39 => Message::ClosingSigned(Readable::read(reader)?),
		128 => Message::UpdateAddHTLC(Readable::read(reader)?),
		130 => Message::UpdateFulfillHTLC(Readable::read(reader)?),
		131 => Message::UpdateFailHTLC(Readable::read(reader)?),
		132 => Message::CommitmentSigned(Readable::read(reader)?),
		133 => Message::RevokeAndACK(Readable::read(reader)?),
		134 => Message::UpdateFee(Readable::read(reader)?),
		135 => Message::UpdateFailMalformedHTLC(Readable::read(reader)?),
		136 => Message::ChannelReestablish(Readable::read(reader)?),
		_ => {
			if type_id % 2 == 0 {
				return Err(DecodeError::UnknownRequiredFeature);
			}
			Message::Unknown(type_id)
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use secp256k1::key::SecretKey;
	use secp256k1::Secp256k1;
	use bitcoin_hashes::Hash;

	fn pubkey(byte: u8) -> PublicKey {
		let secp_ctx = Secp256k1::new();
		PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[byte; 32]).unwrap())
	}

	fn sig() -> Signature {
		let secp_ctx = Secp256k1::new();
		let sk = SecretKey::from_slice(&[42; 32]).unwrap();
		let msg = hash_to_message!(&[1; 32][..]);
		secp_ctx.sign(&msg, &sk)
	}

	fn roundtrip(msg: Message) -> Message {
		let mut buf = Vec::new();
		write_message(&mut buf, &msg).unwrap();
		let decoded = read_message(&mut &buf[..]).unwrap();
		let mut buf2 = Vec::new();
		write_message(&mut buf2, &decoded).unwrap();
		assert_eq!(buf, buf2);
		decoded
	}

	#[test]
	fn open_channel_roundtrip() {
		let msg = OpenChannel {
			chain_hash: Sha256dHash::hash(&[0; 32]),
			temporary_channel_id: [2; 32],
			funding_satoshis: 1311768467284833366,
			push_msat: 2536655962884945560,
			dust_limit_satoshis: 3608586615801332854,
			max_htlc_value_in_flight_msat: 8511154718567732591,
			channel_reserve_satoshis: 8581087981162296583,
			htlc_minimum_msat: 2316138423780173,
			feerate_per_kw: 821716,
			to_self_delay: 49340,
			max_accepted_htlcs: 49340,
			funding_pubkey: pubkey(1),
			revocation_basepoint: pubkey(2),
			payment_basepoint: pubkey(3),
			delayed_payment_basepoint: pubkey(4),
			htlc_basepoint: pubkey(5),
			first_per_commitment_point: pubkey(6),
			channel_flags: 1,
			shutdown_scriptpubkey: OptionalField::Absent,
		};
		let decoded = roundtrip(Message::OpenChannel(msg.clone()));
		if let Message::OpenChannel(m) = decoded {
			assert_eq!(m.funding_satoshis, msg.funding_satoshis);
			assert!(if let OptionalField::Absent = m.shutdown_scriptpubkey { true } else { false });
		} else { panic!(); }
	}

	#[test]
	fn channel_reestablish_roundtrip() {
		let msg = ChannelReestablish {
			channel_id: [4; 32],
			next_local_commitment_number: 3,
			next_remote_commitment_number: 4,
			data_loss_protect: OptionalField::Present(DataLossProtect {
				your_last_per_commitment_secret: [9; 32],
				my_current_per_commitment_point: pubkey(7),
			}),
		};
		let decoded = roundtrip(Message::ChannelReestablish(msg.clone()));
		if let Message::ChannelReestablish(m) = decoded {
			assert!(m == msg);
		} else { panic!(); }

		let msg = ChannelReestablish {
			channel_id: [4; 32],
			next_local_commitment_number: 3,
			next_remote_commitment_number: 4,
			data_loss_protect: OptionalField::Absent,
		};
		let decoded = roundtrip(Message::ChannelReestablish(msg.clone()));
		if let Message::ChannelReestablish(m) = decoded {
			assert!(m == msg);
		} else { panic!(); }
	}

	#[test]
	fn commitment_signed_roundtrip() {
		let msg = CommitmentSigned {
			channel_id: [2; 32],
			signature: sig(),
			htlc_signatures: vec![sig(), sig()],
		};
		let decoded = roundtrip(Message::CommitmentSigned(msg.clone()));
		if let Message::CommitmentSigned(m) = decoded {
			assert!(m == msg);
		} else { panic!(); }
	}

	#[test]
	fn unknown_message_types() {
		let mut buf = Vec::new();
		// Odd unknown type: ignored.
		259u16.write(&mut buf).unwrap();
		if let Message::Unknown(259) = read_message(&mut &buf[..]).unwrap() {} else { panic!(); }
		// Even unknown type: it's-ok-to-be-odd rule says we must fail.
		let mut buf = Vec::new();
		260u16.write(&mut buf).unwrap();
		match read_message(&mut &buf[..]) {
			Err(DecodeError::UnknownRequiredFeature) => {},
			_ => panic!(),
		}
	}
}
