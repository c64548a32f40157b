//! Error types live here.

use std::fmt;

/// Indicates a local command (add/fulfill/fail/sign/fee/close) could not be
/// completed. The channel state is unchanged when one of these is returned -
/// command failures never close a channel on their own.
pub enum CommandError {
	/// Our balance, after the channel reserve, the commitment fee and (for a
	/// funder) the anchor and fee-spike margins, cannot cover the requested
	/// amount.
	InsufficientFunds {
		/// The amount requested, in millisatoshi.
		amount_msat: u64,
		/// The amount actually available to send, in millisatoshi.
		available_msat: u64,
	},
	/// The HTLC amount is below the counterparty's htlc_minimum_msat.
	HtlcValueTooSmall {
		/// The minimum the counterparty will accept, in millisatoshi.
		minimum_msat: u64,
	},
	/// Adding the HTLC would push the aggregate in-flight value over the
	/// counterparty's max_htlc_value_in_flight_msat.
	HtlcValueTooHighInFlight {
		/// The in-flight cap, in millisatoshi.
		maximum_msat: u64,
	},
	/// Adding the HTLC would exceed the counterparty's max_accepted_htlcs.
	TooManyAcceptedHtlcs {
		/// The outgoing HTLC count cap.
		maximum: u16,
	},
	/// A feerate (ours or proposed) is outside the configured tolerance of the
	/// current estimate.
	FeerateTooDifferent {
		/// The feerate proposed, in satoshi per kiloweight.
		proposed_sat_per_kw: u64,
		/// Our current estimate, in satoshi per kiloweight.
		estimate_sat_per_kw: u64,
	},
	/// The channel is not in a state where the command makes sense (not yet
	/// operational, peer disconnected, or already closing).
	ChannelUnavailable {
		/// A human-readable error message
		err: &'static str,
	},
	/// A fulfill/fail referenced an HTLC id we have no (unresolved) HTLC for.
	/// Commands hitting this are rejected, never escalated to a force-close.
	UnknownHtlcId {
		/// The id the command referenced.
		htlc_id: u64,
	},
	/// A shutdown was requested but one is already in progress.
	ClosingAlreadyInProgress,
}

impl fmt::Debug for CommandError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			CommandError::InsufficientFunds { amount_msat, available_msat } =>
				write!(f, "Insufficient funds: requested {} msat, available {} msat", amount_msat, available_msat),
			CommandError::HtlcValueTooSmall { minimum_msat } =>
				write!(f, "HTLC value below counterparty minimum of {} msat", minimum_msat),
			CommandError::HtlcValueTooHighInFlight { maximum_msat } =>
				write!(f, "HTLC would exceed the in-flight cap of {} msat", maximum_msat),
			CommandError::TooManyAcceptedHtlcs { maximum } =>
				write!(f, "Cannot push more than {} outgoing HTLCs", maximum),
			CommandError::FeerateTooDifferent { proposed_sat_per_kw, estimate_sat_per_kw } =>
				write!(f, "Feerate {} sat/kw too far from our estimate of {} sat/kw", proposed_sat_per_kw, estimate_sat_per_kw),
			CommandError::ChannelUnavailable { err } => f.write_str(err),
			CommandError::UnknownHtlcId { htlc_id } =>
				write!(f, "No pending HTLC with id {}", htlc_id),
			CommandError::ClosingAlreadyInProgress => f.write_str("Shutdown already in progress"),
		}
	}
}
