//! High level channel bits, as well as the protocol data structures they consume and produce.

pub mod msgs;
pub mod chan_utils;
pub mod commitments;
pub mod channel;
pub mod onchain;

#[cfg(test)]
mod functional_tests;

/// payment_hash type, use to cross-lock hop
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentHash(pub [u8; 32]);
/// payment_preimage type, use to route payment between hop
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentPreimage(pub [u8; 32]);

impl ::util::ser::Writeable for PaymentHash {
	fn write<W: ::util::ser::Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.0.write(w)
	}
}
impl<R: ::std::io::Read> ::util::ser::Readable<R> for PaymentHash {
	fn read(r: &mut R) -> Result<Self, msgs::DecodeError> {
		Ok(PaymentHash(::util::ser::Readable::read(r)?))
	}
}
impl ::util::ser::Writeable for PaymentPreimage {
	fn write<W: ::util::ser::Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.0.write(w)
	}
}
impl<R: ::std::io::Read> ::util::ser::Readable<R> for PaymentPreimage {
	fn read(r: &mut R) -> Result<Self, msgs::DecodeError> {
		Ok(PaymentPreimage(::util::ser::Readable::read(r)?))
	}
}
