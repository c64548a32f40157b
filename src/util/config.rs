//! Various user-configurable channel limits and settings which ChannelManager
//! applies for you.

/// Top-level config which holds ChannelHandshakeLimits and ChannelConfig.
#[derive(Clone, Debug)]
pub struct UserConfig {
	/// Channel config that we propose to our counterparty.
	pub own_channel_config: ChannelHandshakeConfig,
	/// Limits applied to our counterparty's proposed channel config settings.
	pub peer_channel_config_limits: ChannelHandshakeLimits,
	/// Channel config which affects behavior during channel lifetime.
	pub channel_options: ChannelConfig,
}

impl Default for UserConfig {
	fn default() -> Self {
		UserConfig {
			own_channel_config: ChannelHandshakeConfig::default(),
			peer_channel_config_limits: ChannelHandshakeLimits::default(),
			channel_options: ChannelConfig::default(),
		}
	}
}

/// Configuration we set when applicable.
#[derive(Clone, Debug)]
pub struct ChannelHandshakeConfig {
	/// Confirmations we will wait for before considering the channel locked in.
	pub minimum_depth: u32,
	/// Set to the amount of time we require our counterparty to wait to claim their money.
	///
	/// It's one of the main parameter of our security model. We (or one of our watchtowers) MUST
	/// be online to check for peer having broadcast a revoked transaction to steal our funds
	/// at least once every our_to_self_delay blocks.
	pub our_to_self_delay: u16,
	/// The smallest output value, in satoshi, we will include in a commitment transaction.
	pub our_dust_limit_satoshis: u64,
	/// The smallest HTLC, in millisatoshi, we will accept.
	pub our_htlc_minimum_msat: u64,
}

impl Default for ChannelHandshakeConfig {
	fn default() -> ChannelHandshakeConfig {
		ChannelHandshakeConfig {
			minimum_depth: 6,
			our_to_self_delay: 6 * 24, // one day
			our_dust_limit_satoshis: 546,
			our_htlc_minimum_msat: 1000,
		}
	}
}

/// Optional channel limits which are applied during channel creation.
///
/// These limits are only applied to our counterparty's limits, not our own.
#[derive(Clone, Debug)]
pub struct ChannelHandshakeLimits {
	/// Minimum allowed satoshis when a channel is funded, this is supplied by the sender.
	pub min_funding_satoshis: u64,
	/// Maximum allowed satoshis when a channel is funded. Beyond the legacy
	/// protocol cap this is also enforced on wumbo channels.
	pub max_funding_satoshis: u64,
	/// The remote node sets a limit on the minimum size of HTLCs we can send to them. This allows
	/// you to limit the maximum minimum-size they can require.
	pub max_htlc_minimum_msat: u64,
	/// The remote node sets a limit on the maximum value of pending HTLCs to them at any given
	/// time to limit their funds exposure to HTLCs. This allows you to set a minimum such value.
	pub min_max_htlc_value_in_flight_msat: u64,
	/// The remote node will require we keep a certain amount in direct payment to ourselves at all
	/// time, ensuring that we are able to be punished if we broadcast an old state. This allows to
	/// you limit the amount which we will have to keep to ourselves (and cannot use for HTLCs).
	pub max_channel_reserve_satoshis: u64,
	/// The remote node sets a limit on the maximum number of pending HTLCs to them at any given
	/// time. This allows you to set a minimum such value.
	pub min_max_accepted_htlcs: u16,
	/// Outputs below a certain value will not be added to on-chain transactions. The dust value is
	/// required to always be higher than this value so this only applies to HTLC outputs (and
	/// potentially to-self outputs before any payments have been made).
	/// Thus, this needs to be set to allow multiple payments smaller than your dust limit.
	pub min_dust_limit_satoshis: u64,
	/// Maximum allowed threshold above which outputs will not be generated in their commitment
	/// transactions.
	pub max_dust_limit_satoshis: u64,
	/// Before a channel is usable the funding transaction will need to be confirmed by at least a
	/// certain number of blocks, specified by the node which is not the funder (as the funder can
	/// assume they aren't going to double-spend themselves).
	/// This config allows you to set a limit on the maximum amount of time to wait.
	pub max_minimum_depth: u32,
	/// The remote node can set a to_self_delay on our payouts; this caps how long they may make
	/// us wait to claim our own funds after a unilateral close.
	pub their_to_self_delay: u16,
}

impl Default for ChannelHandshakeLimits {
	fn default() -> Self {
		ChannelHandshakeLimits {
			min_funding_satoshis: 1000,
			max_funding_satoshis: 1 << 30,
			max_htlc_minimum_msat: <u64>::max_value(),
			min_max_htlc_value_in_flight_msat: 0,
			max_channel_reserve_satoshis: <u64>::max_value(),
			min_max_accepted_htlcs: 0,
			min_dust_limit_satoshis: 546,
			max_dust_limit_satoshis: 10_000,
			max_minimum_depth: 144,
			their_to_self_delay: 6 * 24 * 7, // one week
		}
	}
}

/// Options which apply on a per-channel basis and may change at runtime or based on negotiation
/// with our counterparty.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
	/// We don't exchange more than this many signatures when negotiating the closing fee before
	/// giving up and force-closing.
	pub max_closing_negotiation_iterations: u8,
	/// The lowest feerate, as a percentage of our own current estimate, we will accept in an
	/// update_fee from the funder before considering the channel at risk.
	pub min_feerate_mismatch_percent: u32,
	/// The highest feerate, as a percentage of our own current estimate, we will accept in an
	/// update_fee from the funder before considering the channel at risk.
	pub max_feerate_mismatch_percent: u32,
	/// If set, a feerate outside the mismatch tolerance causes us to force-close rather than
	/// carry a commitment we consider unsafe.
	pub close_on_feerate_mismatch: bool,
	/// Set to announce the channel publicly and notify all nodes that they can route via this
	/// channel.
	pub announced_channel: bool,
	/// When set, we commit to an upfront shutdown_pubkey at channel open.
	///
	/// The upfront key committed is provided from our shutdown pubkey - a commitment prevents our
	/// counterparty from accepting a different close script later.
	pub commit_upfront_shutdown_pubkey: bool,
	/// Blocks we give the funding transaction to confirm, as the fundee, before we forget the
	/// channel entirely.
	pub funding_timeout_blocks: u32,
}

impl_writeable!(ChannelConfig, {
	max_closing_negotiation_iterations,
	min_feerate_mismatch_percent,
	max_feerate_mismatch_percent,
	close_on_feerate_mismatch,
	announced_channel,
	commit_upfront_shutdown_pubkey,
	funding_timeout_blocks
});

impl Default for ChannelConfig {
	fn default() -> Self {
		ChannelConfig {
			max_closing_negotiation_iterations: 20,
			min_feerate_mismatch_percent: 50,
			max_feerate_mismatch_percent: 200,
			close_on_feerate_mismatch: true,
			announced_channel: true,
			commit_upfront_shutdown_pubkey: true,
			funding_timeout_blocks: 2016, // two weeks
		}
	}
}
