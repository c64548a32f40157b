//! Tests which drive two Channel state machines against each other through complete protocol
//! flows: payments, failed payments, cooperative close, punishment of revoked commitments,
//! data-loss recovery and restart during a unilateral close.

use bitcoin::blockdata::script::{Script, Builder};
use bitcoin::blockdata::transaction::{Transaction, TxOut};
use bitcoin::blockdata::opcodes;

use bitcoin_hashes::Hash;
use bitcoin_hashes::sha256::Hash as Sha256;
use bitcoin_hashes::sha256d::Hash as Sha256dHash;

use secp256k1::key::{PublicKey, SecretKey};
use secp256k1::Secp256k1;

use ln::{PaymentHash, PaymentPreimage};
use ln::chan_utils;
use ln::chan_utils::{ChannelKeys, CommitmentFormat, HtlcDirection};
use ln::channel::{Channel, ChannelState, RAACommitmentOrder};
use ln::commitments::{HtlcOrigin, NextRemoteCommitInfo};
use ln::msgs;
use ln::msgs::{Features, UpdateMessage};
use chain::chaininterface::WatchTag;
use chain::transaction::OutPoint;
use util::config::UserConfig;
use util::events::EventsProvider;
use util::logger::Logger;
use util::ser::Writeable;
use util::test_utils::{TestFeeEstimator, TestLogger};

use std::sync::Arc;

fn test_logger() -> Arc<Logger> {
	Arc::new(TestLogger::new())
}

fn dummy_onion() -> msgs::OnionPacket {
	msgs::OnionPacket {
		version: 0,
		public_key: PublicKey::from_slice(&[2; 33]),
		hop_data: [0; 20 * 65],
		hmac: [0; 32],
	}
}

fn dummy_destination(tag: u8) -> Script {
	Builder::new().push_opcode(opcodes::all::OP_PUSHBYTES_0).push_slice(&[tag; 20]).into_script()
}

struct NodeCfg {
	config: UserConfig,
	keys: ChannelKeys,
	shutdown_pubkey: PublicKey,
	destination: Script,
}

fn node_cfg(seed: u8, dust_limit_satoshis: u64) -> NodeCfg {
	let secp_ctx = Secp256k1::new();
	let mut config = UserConfig::default();
	config.own_channel_config.our_dust_limit_satoshis = dust_limit_satoshis;
	NodeCfg {
		config,
		keys: ChannelKeys::new_from_seed(&[seed; 32]),
		shutdown_pubkey: PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[seed + 100; 32]).unwrap()),
		destination: dummy_destination(seed),
	}
}

struct TestPair {
	a: Channel,
	b: Channel,
	funding_tx: Transaction,
}

/// Runs the complete open handshake and funding confirmation, leaving both sides in NORMAL.
/// `a` funds with `funding_satoshis` and pushes `push_msat` to `b`.
fn open_channel_pair(funding_satoshis: u64, push_msat: u64, feerate_per_kw: u64, dust_limit_satoshis: u64) -> TestPair {
	let cfg_a = node_cfg(1, dust_limit_satoshis);
	let cfg_b = node_cfg(2, dust_limit_satoshis);
	let features = Features::new();
	let chain_hash = Sha256dHash::hash(&[0xde, 0xad]);

	let mut a = Channel::new_outbound(&cfg_a.config, cfg_a.keys, cfg_a.shutdown_pubkey, cfg_a.destination,
		[42; 32], &features, funding_satoshis, push_msat, feerate_per_kw, CommitmentFormat::Legacy, test_logger()).unwrap();
	let open = a.get_open_channel(chain_hash);

	let mut b = Channel::new_inbound(&cfg_b.config, cfg_b.keys, cfg_b.shutdown_pubkey, cfg_b.destination,
		&open, &features, CommitmentFormat::Legacy, test_logger()).unwrap();
	let accept = b.get_accept_channel();
	a.accept_channel(&accept, &cfg_a.config, &features).unwrap();

	let funding_tx = Transaction {
		version: 2,
		lock_time: 0,
		input: Vec::new(),
		output: vec![TxOut {
			value: funding_satoshis,
			script_pubkey: a.get_funding_redeemscript().to_v0_p2wsh(),
		}],
	};
	let funding_txo = OutPoint::new(funding_tx.txid(), 0);

	let funding_created = a.funding_internal(funding_txo).unwrap();
	let funding_signed = b.funding_created(&funding_created).unwrap();
	a.funding_signed(&funding_signed).unwrap();

	let locked_a = a.funding_confirmed(&funding_tx, 100, 1).unwrap().unwrap();
	let locked_b = b.funding_confirmed(&funding_tx, 100, 1).unwrap().unwrap();
	a.funding_locked(&locked_b).unwrap();
	b.funding_locked(&locked_a).unwrap();

	assert_eq!(a.state(), ChannelState::Normal);
	assert_eq!(b.state(), ChannelState::Normal);
	assert_eq!(a.channel_id(), b.channel_id());
	assert_eq!(a.short_channel_id().unwrap(), (100u64 << 40) | (1u64 << 16));

	TestPair { a, b, funding_tx }
}

/// One full signature round-trip initiated by `x`: x signs, y replies with its revocation and
/// (necessarily, as it now holds x's changes) its own signature, which x revokes in turn.
fn cross_sign(x: &mut Channel, y: &mut Channel, fee: &TestFeeEstimator) {
	let cs_x = x.cmd_sign().unwrap().expect("initiator must not have a signature in flight");
	let (raa_y, cs_y, _) = y.commitment_signed(&cs_x, fee).unwrap();
	let (_, cs_x2, _) = x.revoke_and_ack(&raa_y, fee).unwrap();
	assert!(cs_x2.is_none());
	let cs_y = cs_y.expect("y must sign back, it just acquired x's changes");
	let (raa_x, cs_x3, _) = x.commitment_signed(&cs_y, fee).unwrap();
	assert!(cs_x3.is_none());
	let (_, cs_y2, _) = y.revoke_and_ack(&raa_x, fee).unwrap();
	assert!(cs_y2.is_none());
}

fn assert_commitments_in_sync(a: &Channel, b: &Channel) {
	let ca = a.commitments().unwrap();
	let cb = b.commitments().unwrap();
	assert_eq!(ca.local_commit.spec.to_local_msat, cb.remote_commit.spec.to_local_msat);
	assert_eq!(ca.local_commit.spec.to_remote_msat, cb.remote_commit.spec.to_remote_msat);
	assert_eq!(ca.local_commit.spec.to_local_msat, cb.local_commit.spec.to_remote_msat);
	assert_eq!(ca.local_commit.spec.to_remote_msat, cb.local_commit.spec.to_local_msat);
	assert_eq!(ca.local_commit.txid(), cb.remote_commit.txid);
	assert_eq!(cb.local_commit.txid(), ca.remote_commit.txid);
}

fn preimage(byte: u8) -> (PaymentPreimage, PaymentHash) {
	let preimage = PaymentPreimage([byte; 32]);
	(preimage, PaymentHash(Sha256::hash(&preimage.0).into_inner()))
}

/// Recomputes the availability formula independently of the ledger's implementation.
fn expected_available_for_send(chan: &Channel) -> u64 {
	let commitments = chan.commitments().unwrap();
	let spec = match commitments.remote_next_commit {
		NextRemoteCommitInfo::Waiting(ref wait) => wait.next_remote_commit.spec.clone(),
		NextRemoteCommitInfo::Revoked(_) => commitments.remote_commit.spec.clone(),
	};
	let spec = spec.reduce(&commitments.remote_changes.acked, &commitments.local_changes.proposed).unwrap();
	let balance = spec.to_remote_msat;
	let reserve = commitments.local_params.channel_reserve_satoshis * 1000;
	if !commitments.local_params.is_funder {
		return balance.saturating_sub(reserve);
	}
	let untrimmed = spec.untrimmed_htlc_count(commitments.format, commitments.remote_params.dust_limit_satoshis);
	let commit_fee_with_one_more = chan_utils::commit_tx_fee(commitments.format, spec.feerate_per_kw, untrimmed + 1);
	let anchors = commitments.format.anchors_cost_satoshis();
	let headroom = 2 * chan_utils::weight2fee(spec.feerate_per_kw, commitments.format.htlc_output_weight());
	balance.saturating_sub(reserve).saturating_sub((commit_fee_with_one_more + anchors + headroom) * 1000)
}

// S1 - happy payment. A adds 42_000_000 msat, both sides cross-sign, B fulfills, cross-sign.
#[test]
fn test_happy_payment() {
	let fee = TestFeeEstimator { sat_per_kw: 10_000 };
	// to_local(A) = 758_640_000 msat, to_remote = 190_000_000 msat.
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);
	assert_eq!(pair.a.commitments().unwrap().local_commit.spec.to_local_msat, 758_640_000);
	assert_eq!(pair.a.commitments().unwrap().local_commit.spec.to_remote_msat, 190_000_000);
	assert_eq!(pair.a.commitments().unwrap().available_balance_for_send_msat(), expected_available_for_send(&pair.a));

	let (payment_preimage, payment_hash) = preimage(7);
	let add = pair.a.cmd_add_htlc(42_000_000, payment_hash, 500, dummy_onion(), HtlcOrigin::Local).unwrap();
	assert_eq!(pair.a.commitments().unwrap().available_balance_for_send_msat(), expected_available_for_send(&pair.a));
	pair.b.update_add_htlc(&add).unwrap();
	cross_sign(&mut pair.a, &mut pair.b, &fee);
	assert_commitments_in_sync(&pair.a, &pair.b);
	assert_eq!(pair.a.commitments().unwrap().local_commit.spec.htlcs.len(), 1);
	assert_eq!(pair.a.commitments().unwrap().available_balance_for_send_msat(), expected_available_for_send(&pair.a));

	let fulfill = pair.b.cmd_fulfill_htlc(0, payment_preimage).unwrap();
	pair.a.update_fulfill_htlc(&fulfill).unwrap();
	cross_sign(&mut pair.b, &mut pair.a, &fee);
	assert_commitments_in_sync(&pair.a, &pair.b);

	let ca = pair.a.commitments().unwrap();
	let cb = pair.b.commitments().unwrap();
	assert!(ca.local_commit.spec.htlcs.is_empty());
	assert_eq!(ca.local_commit.spec.to_local_msat, 716_640_000);
	assert_eq!(ca.local_commit.spec.to_remote_msat, 232_000_000);
	assert_eq!(cb.local_commit.spec.to_local_msat, 232_000_000);
	assert_eq!(cb.local_commit.spec.to_remote_msat, 716_640_000);
	assert_eq!(ca.available_balance_for_send_msat(), expected_available_for_send(&pair.a));
}

// S2 - failed payment: balances return to the opening state.
#[test]
fn test_failed_payment() {
	let fee = TestFeeEstimator { sat_per_kw: 10_000 };
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);

	let (_, payment_hash) = preimage(9);
	let add = pair.a.cmd_add_htlc(42_000_000, payment_hash, 500, dummy_onion(), HtlcOrigin::Local).unwrap();
	pair.b.update_add_htlc(&add).unwrap();
	cross_sign(&mut pair.a, &mut pair.b, &fee);

	// incorrect_or_unknown_payment_details(42 msat, 42 height), already onion-wrapped upstream.
	let fail = pair.b.cmd_fail_htlc(0, msgs::OnionErrorPacket { data: vec![0x40, 0x0f, 42, 42] }).unwrap();
	pair.a.update_fail_htlc(&fail).unwrap();
	cross_sign(&mut pair.b, &mut pair.a, &fee);
	assert_commitments_in_sync(&pair.a, &pair.b);

	let ca = pair.a.commitments().unwrap();
	assert!(ca.local_commit.spec.htlcs.is_empty());
	assert_eq!(ca.local_commit.spec.to_local_msat, 758_640_000);
	assert_eq!(ca.local_commit.spec.to_remote_msat, 190_000_000);

	// The payer learns about the failure.
	let events = pair.a.get_and_clear_pending_events();
	assert!(events.iter().any(|e| match e {
		&::util::events::Event::PaymentFailed { payment_hash: ph, .. } => ph == payment_hash,
		_ => false,
	}));
}

// S3 - mutual close convergence: at most 4 closing_signed rounds, closing tx is BIP69-ordered
// with at most two outputs.
#[test]
fn test_mutual_close_convergence() {
	let fee = TestFeeEstimator { sat_per_kw: 250 };
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);

	let (shutdown_a, none) = pair.a.cmd_close(None, &fee).unwrap();
	assert!(none.is_none());
	let (shutdown_b, closing_b) = pair.b.shutdown(&shutdown_a, &fee).unwrap();
	// The fundee never proposes first.
	assert!(closing_b.is_none());
	let (echo, closing_a) = pair.a.shutdown(&shutdown_b.unwrap(), &fee).unwrap();
	assert!(echo.is_none());
	let closing_a = closing_a.expect("funder proposes once negotiation opens");
	assert_eq!(pair.a.state(), ChannelState::Negotiating);
	assert_eq!(pair.b.state(), ChannelState::Negotiating);

	let mut rounds = 1;
	let mut next_for_b = Some(closing_a);
	let mut final_tx: Option<Transaction> = None;
	while let Some(msg) = next_for_b.take() {
		assert!(rounds <= 4, "closing fee negotiation did not converge");
		let (reply, tx_b) = pair.b.closing_signed(&msg, &fee).unwrap();
		if let Some(reply) = reply {
			rounds += 1;
			let (counter, tx_a) = pair.a.closing_signed(&reply, &fee).unwrap();
			if let Some(tx) = tx_a {
				assert!(tx_b.is_some());
				final_tx = Some(tx);
				assert!(counter.is_none());
				break;
			}
			next_for_b = counter;
		} else {
			final_tx = tx_b;
			break;
		}
	}

	let tx = final_tx.expect("negotiation must converge on a closing tx");
	assert!(tx.output.len() <= 2);
	assert_eq!(tx.input.len(), 1);
	assert_eq!(tx.input[0].previous_output.txid, pair.funding_tx.txid());
	for window in tx.output.windows(2) {
		assert!(window[0].value < window[1].value
			|| (window[0].value == window[1].value && window[0].script_pubkey[..] <= window[1].script_pubkey[..]));
	}
	assert_eq!(pair.a.state(), ChannelState::Closing);
	assert_eq!(pair.b.state(), ChannelState::Closing);

	// Confirmation of the mutual close finishes the channel.
	let settle = pair.a.tx_confirmed(&tx, 130, &fee);
	assert!(settle.is_empty());
	assert_eq!(pair.a.state(), ChannelState::Closed);
}

// S4 - revoked remote commitment: main penalty, per-HTLC penalties and our main claim must
// cover every output; a racing second-stage HTLC tx gets a delayed-output penalty.
#[test]
fn test_revoked_commitment_punishment() {
	let secp_ctx = Secp256k1::new();
	let fee = TestFeeEstimator { sat_per_kw: 10_000 };
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);

	// Round 1: A offers an HTLC, B learns the preimage but has not yet revealed it on-chain.
	let (payment_preimage, payment_hash) = preimage(11);
	let add = pair.a.cmd_add_htlc(42_000_000, payment_hash, 500, dummy_onion(), HtlcOrigin::Local).unwrap();
	pair.b.update_add_htlc(&add).unwrap();
	cross_sign(&mut pair.a, &mut pair.b, &fee);
	let fulfill = pair.b.cmd_fulfill_htlc(0, payment_preimage).unwrap();

	// Snapshot B here: its commitment still carries the HTLC and it knows the preimage.
	let stale_b_bytes = pair.b.encode();

	// The channel moves on; B's snapshot state becomes revoked.
	pair.a.update_fulfill_htlc(&fulfill).unwrap();
	cross_sign(&mut pair.b, &mut pair.a, &fee);
	let (_, payment_hash2) = preimage(12);
	let add2 = pair.a.cmd_add_htlc(10_000_000, payment_hash2, 600, dummy_onion(), HtlcOrigin::Local).unwrap();
	pair.b.update_add_htlc(&add2).unwrap();
	cross_sign(&mut pair.a, &mut pair.b, &fee);

	// Resurrect the cheater and put its stale commitment on chain.
	let stale_b = Channel::read(&mut &stale_b_bytes[..], test_logger()).unwrap();
	let revoked_tx = stale_b.commitments().unwrap().fully_signed_local_commit_tx(&secp_ctx);
	let settlements = pair.a.funding_spent(&revoked_tx, &fee).unwrap();
	assert!(settlements.is_empty());
	assert_eq!(pair.a.state(), ChannelState::Closing);

	{
		let publishes = pair.a.get_and_clear_pending_publishes();
		// main-penalty, htlc-penalty, claim-main.
		assert_eq!(publishes.len(), 3);

		// Every output of the revoked commitment is covered by exactly one of our spends.
		let mut claimed: Vec<u32> = publishes.iter().map(|p| {
			assert_eq!(p.tx.input[0].previous_output.txid, revoked_tx.txid());
			p.tx.input[0].previous_output.vout
		}).collect();
		claimed.sort();
		let expected: Vec<u32> = (0..revoked_tx.output.len() as u32).collect();
		assert_eq!(claimed, expected);
	}

	// B races us with its own HTLC-success transaction; its delayed output is punished too.
	let stale_htlc_txs = stale_b.commitments().unwrap().fully_signed_htlc_txs(&secp_ctx);
	assert_eq!(stale_htlc_txs.len(), 1);
	let their_htlc_tx = &stale_htlc_txs[0];
	let spent = OutPoint::new(their_htlc_tx.input[0].previous_output.txid, their_htlc_tx.input[0].previous_output.vout as u16);
	pair.a.output_spent(&spent, their_htlc_tx, &fee);
	let publishes = pair.a.get_and_clear_pending_publishes();
	assert!(publishes.iter().any(|p| p.tx.input[0].previous_output.txid == their_htlc_tx.txid()));
}

// S5 - data-loss reconnect: the rolled-back node detects its own regression, freezes, and when
// the peer force-closes it claims only its main output.
#[test]
fn test_data_loss_reconnect() {
	let secp_ctx = Secp256k1::new();
	let fee = TestFeeEstimator { sat_per_kw: 10_000 };
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);

	// A makes a payment, then we roll A back to its pre-payment state.
	let stale_a_bytes = {
		let (payment_preimage, payment_hash) = preimage(21);
		let add = pair.a.cmd_add_htlc(42_000_000, payment_hash, 500, dummy_onion(), HtlcOrigin::Local).unwrap();
		pair.b.update_add_htlc(&add).unwrap();
		let bytes = pair.a.encode();
		cross_sign(&mut pair.a, &mut pair.b, &fee);
		let fulfill = pair.b.cmd_fulfill_htlc(0, payment_preimage).unwrap();
		pair.a.update_fulfill_htlc(&fulfill).unwrap();
		cross_sign(&mut pair.b, &mut pair.a, &fee);
		bytes
	};

	let mut stale_a = Channel::read(&mut &stale_a_bytes[..], test_logger()).unwrap();
	stale_a.restored();

	// Reconnect. B is honest and up to date; A is running on stale state.
	let reestablish_a = stale_a.mark_connected().unwrap();
	pair.b.mark_disconnected();
	let reestablish_b = pair.b.mark_connected().unwrap();

	// A sees proof that B holds revocations A has no memory of handing out.
	let responses = stale_a.channel_reestablish(&reestablish_b).unwrap();
	assert!(responses.commitment_signed.is_none() && responses.revocation.is_none());
	assert_eq!(stale_a.state(), ChannelState::WaitForRemotePublishFutureCommitment);

	// B sees A asking for retransmission of long-revoked state and closes on it.
	assert!(pair.b.channel_reestablish(&reestablish_a).is_err());
	let settlements = pair.b.force_close("peer lost data", &fee);
	assert!(settlements.is_empty());
	let b_commit = pair.b.commitments().unwrap().fully_signed_local_commit_tx(&secp_ctx);

	// When B's current commitment confirms, A claims only its main output.
	stale_a.funding_spent(&b_commit, &fee).unwrap();
	assert_eq!(stale_a.state(), ChannelState::Closing);
	let publishes = stale_a.get_and_clear_pending_publishes();
	assert_eq!(publishes.len(), 1);
	let claim = &publishes[0].tx;
	assert_eq!(claim.input.len(), 1);
	assert_eq!(claim.input[0].previous_output.txid, b_commit.txid());
	// The claim pays our wallet, and claims nothing HTLC-ish (there is nothing it could know).
	assert_eq!(claim.output[0].script_pubkey, dummy_destination(1));
}

// S6 - restart during closing: exactly the unconfirmed subset is re-published.
#[test]
fn test_restart_during_closing() {
	let fee = TestFeeEstimator { sat_per_kw: 10_000 };
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);

	let (_, payment_hash) = preimage(31);
	let add = pair.a.cmd_add_htlc(42_000_000, payment_hash, 500, dummy_onion(), HtlcOrigin::Local).unwrap();
	pair.b.update_add_htlc(&add).unwrap();
	cross_sign(&mut pair.a, &mut pair.b, &fee);

	pair.a.force_close("test", &fee);
	assert_eq!(pair.a.state(), ChannelState::Closing);
	let publishes = pair.a.get_and_clear_pending_publishes();
	// Commitment, claim of our delayed main output, one HTLC-timeout.
	assert_eq!(publishes.len(), 3);
	let commit_tx = publishes.iter().map(|p| p.tx.clone())
		.find(|tx| tx.input[0].previous_output.txid == pair.funding_tx.txid()).unwrap();
	pair.a.get_and_clear_pending_watches();

	// The commitment confirms, then the node dies.
	pair.a.tx_confirmed(&commit_tx, 130, &fee);
	assert_eq!(pair.a.state(), ChannelState::Closing);
	let persisted = pair.a.encode();

	let mut restarted = Channel::read(&mut &persisted[..], test_logger()).unwrap();
	restarted.restored();
	let republished = restarted.get_and_clear_pending_publishes();
	// The confirmed commitment is not re-published; the unconfirmed claims are.
	assert_eq!(republished.len(), 2);
	assert!(republished.iter().all(|p| p.tx.txid() != commit_tx.txid()));
	assert!(republished.iter().all(|p| p.tx.input[0].previous_output.txid == commit_tx.txid()));
	let watches = restarted.get_and_clear_pending_watches();
	assert!(watches.iter().any(|w| match w {
		&::chain::chaininterface::WatchRequest::Confirmed { tag: WatchTag::ClaimConfirmed, .. } => true,
		_ => false,
	}));
}

// Reconnecting after a lost commitment_signed retransmits the exact update batch and signature.
#[test]
fn test_reestablish_retransmits_lost_commitment() {
	let fee = TestFeeEstimator { sat_per_kw: 10_000 };
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);

	let (_, payment_hash) = preimage(41);
	let _lost_add = pair.a.cmd_add_htlc(42_000_000, payment_hash, 500, dummy_onion(), HtlcOrigin::Local).unwrap();
	let _lost_cs = pair.a.cmd_sign().unwrap().unwrap();
	// Neither message reaches B. Connection dies.
	let dropped = pair.a.mark_disconnected();
	assert!(dropped.is_empty(), "signed adds are not dropped on disconnect");
	pair.b.mark_disconnected();

	let reestablish_a = pair.a.mark_connected().unwrap();
	let reestablish_b = pair.b.mark_connected().unwrap();

	let responses_b = pair.b.channel_reestablish(&reestablish_a).unwrap();
	assert!(responses_b.commitment_signed.is_none());
	assert!(responses_b.revocation.is_none());

	let responses_a = pair.a.channel_reestablish(&reestablish_b).unwrap();
	let cs = responses_a.commitment_signed.expect("A must retransmit the lost signature");
	assert_eq!(responses_a.order, RAACommitmentOrder::CommitmentFirst);
	assert_eq!(responses_a.updates_to_resend.len(), 1);

	// B replays the batch and the dance completes.
	for update in responses_a.updates_to_resend.iter() {
		match update {
			&UpdateMessage::AddHtlc(ref add) => pair.b.update_add_htlc(add).unwrap(),
			_ => panic!("unexpected update type in retransmission"),
		}
	}
	let (raa_b, cs_b, _) = pair.b.commitment_signed(&cs, &fee).unwrap();
	let (_, none, _) = pair.a.revoke_and_ack(&raa_b, &fee).unwrap();
	assert!(none.is_none());
	let (raa_a, _, _) = pair.a.commitment_signed(&cs_b.unwrap(), &fee).unwrap();
	pair.b.revoke_and_ack(&raa_a, &fee).unwrap();

	assert_commitments_in_sync(&pair.a, &pair.b);
	assert_eq!(pair.a.commitments().unwrap().local_commit.spec.htlcs.len(), 1);
	assert_eq!(pair.a.commitments().unwrap().local_commit.spec.htlcs[0].add.payment_hash, payment_hash);
}

// Property: if available_balance_for_send says x, sending x succeeds, across random channel
// shapes. Mirrors the receive side through the peer's acceptance check.
#[test]
fn test_send_availability_is_safe() {
	use rand::{thread_rng, Rng};
	let mut rng = thread_rng();

	for _ in 0..20 {
		let feerate = 600 + rng.gen::<u64>() % 20_000;
		let dust: u64 = 546 + rng.gen::<u64>() % 2_000;
		let funding = 500_000 + rng.gen::<u64>() % 1_000_000;
		let push_msat = rng.gen::<u64>() % (funding * 400); // up to ~40% pushed
		let fee = TestFeeEstimator { sat_per_kw: feerate };

		let mut pair = open_channel_pair(funding, push_msat, feerate, dust);
		for step in 0..3 {
			let available = pair.a.commitments().unwrap().available_balance_for_send_msat();
			let in_flight_cap = pair.a.commitments().unwrap().remote_params.max_htlc_value_in_flight_msat;
			let in_flight_used = pair.a.commitments().unwrap().local_commit.spec.htlc_value_in_flight_msat(HtlcDirection::Offered);
			let amount = ::std::cmp::min(available, in_flight_cap.saturating_sub(in_flight_used));
			if amount < pair.a.commitments().unwrap().remote_params.htlc_minimum_msat {
				break;
			}
			let (_, payment_hash) = preimage(50 + step);
			let add = pair.a.cmd_add_htlc(amount, payment_hash, 500, dummy_onion(), HtlcOrigin::Local)
				.expect("send of exactly the advertised available balance must succeed");
			pair.b.update_add_htlc(&add)
				.expect("receive of exactly the advertised available balance must succeed");
			cross_sign(&mut pair.a, &mut pair.b, &fee);
			assert_commitments_in_sync(&pair.a, &pair.b);
		}
	}
}

// Persistence round-trips byte-identically, so a restore replays to the same state.
#[test]
fn test_channel_serialization_roundtrip() {
	let fee = TestFeeEstimator { sat_per_kw: 10_000 };
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);

	let (_, payment_hash) = preimage(61);
	let add = pair.a.cmd_add_htlc(42_000_000, payment_hash, 500, dummy_onion(), HtlcOrigin::Local).unwrap();
	pair.b.update_add_htlc(&add).unwrap();
	cross_sign(&mut pair.a, &mut pair.b, &fee);

	for chan in [&pair.a, &pair.b].iter() {
		let bytes = chan.encode();
		let restored = Channel::read(&mut &bytes[..], test_logger()).unwrap();
		assert_eq!(restored.encode(), bytes);
		assert_eq!(restored.state(), chan.state());
		assert_eq!(restored.channel_id(), chan.channel_id());
	}
}

// A duplicate open is ignored; a fee update outside tolerance closes the channel when the
// config says so.
#[test]
fn test_update_fee_tolerance() {
	let fee = TestFeeEstimator { sat_per_kw: 10_000 };
	let mut pair = open_channel_pair(948_640, 190_000_000, 10_000, 1_100);

	// In tolerance: accepted.
	let update = pair.a.cmd_update_fee(12_000).unwrap();
	pair.b.update_fee(&update, &fee).unwrap();
	cross_sign(&mut pair.a, &mut pair.b, &fee);
	assert_eq!(pair.b.commitments().unwrap().local_commit.spec.feerate_per_kw, 12_000);

	// Out of tolerance (>2x our estimate): channel-fatal for the fundee.
	let update = pair.a.cmd_update_fee(25_000).unwrap();
	match pair.b.update_fee(&update, &fee) {
		Err(::ln::channel::ChannelError::Close(_)) => {},
		_ => panic!("an unexplainable feerate must be channel-fatal"),
	}

	// The fundee cannot propose fees at all.
	match pair.b.cmd_update_fee(9_000) {
		Err(::util::errors::CommandError::ChannelUnavailable { .. }) => {},
		_ => panic!("only the funder may update the fee"),
	}
}
