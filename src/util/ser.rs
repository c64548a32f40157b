//! A very simple serialization framework which is used for messages sent over
//! the wire and for channel data persisted to disk. Integers are big-endian,
//! matching the wire protocol; everything round-trips bit-identically.

use std::result::Result;
use std::io::{Read, Write};
use std::collections::HashMap;
use std::hash::Hash;

use secp256k1::Signature;
use secp256k1::key::PublicKey;
use secp256k1::key::SecretKey;
use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::Transaction;
use bitcoin::consensus;
use bitcoin_hashes::sha256d::Hash as Sha256dHash;

use ln::msgs::DecodeError;
use util::byte_utils::{be16_to_array, be32_to_array, be48_to_array, be64_to_array, slice_to_be16, slice_to_be32, slice_to_be48, slice_to_be64};

const MAX_BUF_SIZE: usize = 64 * 1024;

/// A sink to which a Writeable object is serialized. Implemented for anything
/// io::Write, plus a length-counting sink used to size buffers.
pub trait Writer {
	/// Writes the given buf out. See std::io::Write::write_all for more
	fn write_all(&mut self, buf: &[u8]) -> Result<(), ::std::io::Error>;
}

impl<W: Write> Writer for W {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> Result<(), ::std::io::Error> {
		<Self as ::std::io::Write>::write_all(self, buf)
	}
}

/// Writer that only tracks the amount of bytes written - useful if you need to calculate the length
/// of some data when serialized
pub struct LengthCalculatingWriter(pub usize);
impl Writer for LengthCalculatingWriter {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> Result<(), ::std::io::Error> {
		self.0 += buf.len();
		Ok(())
	}
}

/// A trait that various objects in the crate implement allowing them to be written out to a Writer
pub trait Writeable {
	/// Writes self out to the given Writer
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error>;

	/// Writes self out to a Vec<u8>
	fn encode(&self) -> Vec<u8> {
		let mut msg = Vec::new();
		self.write(&mut msg).unwrap();
		msg
	}

	/// Gets the length of this object after it has been serialized.
	fn serialized_length(&self) -> usize {
		let mut len_calc = LengthCalculatingWriter(0);
		self.write(&mut len_calc).expect("No in-memory data may fail to serialize");
		len_calc.0
	}
}

/// A trait that various objects in the crate implement allowing them to be read in from a Read
pub trait Readable<R>
	where Self: Sized,
	      R: Read
{
	/// Reads a Self in from the given Read
	fn read(reader: &mut R) -> Result<Self, DecodeError>;
}

macro_rules! impl_writeable_primitive {
	($val_type:ty, $meth_write:ident, $len: expr, $meth_read:ident) => {
		impl Writeable for $val_type {
			#[inline]
			fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
				writer.write_all(&$meth_write(*self))
			}
		}
		impl<R: Read> Readable<R> for $val_type {
			#[inline]
			fn read(reader: &mut R) -> Result<$val_type, DecodeError> {
				let mut buf = [0; $len];
				reader.read_exact(&mut buf)?;
				Ok($meth_read(&buf))
			}
		}
	}
}

impl_writeable_primitive!(u64, be64_to_array, 8, slice_to_be64);
impl_writeable_primitive!(u32, be32_to_array, 4, slice_to_be32);
impl_writeable_primitive!(u16, be16_to_array, 2, slice_to_be16);

impl Writeable for u8 {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		writer.write_all(&[*self])
	}
}
impl<R: Read> Readable<R> for u8 {
	#[inline]
	fn read(reader: &mut R) -> Result<u8, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		Ok(buf[0])
	}
}

impl Writeable for bool {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		writer.write_all(&[if *self { 1 } else { 0 }])
	}
}
impl<R: Read> Readable<R> for bool {
	#[inline]
	fn read(reader: &mut R) -> Result<bool, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		if buf[0] != 0 && buf[0] != 1 {
			return Err(DecodeError::InvalidValue);
		}
		Ok(buf[0] == 1)
	}
}

/// A u64 which only uses 6 bytes on the wire (commitment numbers are 48-bit).
pub(crate) struct U48(pub u64);
impl Writeable for U48 {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		writer.write_all(&be48_to_array(self.0))
	}
}
impl<R: Read> Readable<R> for U48 {
	#[inline]
	fn read(reader: &mut R) -> Result<U48, DecodeError> {
		let mut buf = [0; 6];
		reader.read_exact(&mut buf)?;
		Ok(U48(slice_to_be48(&buf)))
	}
}

// u8 arrays
macro_rules! impl_array {
	( $size:expr ) => (
		impl Writeable for [u8; $size] {
			#[inline]
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
				w.write_all(self)
			}
		}

		impl<R: Read> Readable<R> for [u8; $size] {
			#[inline]
			fn read(r: &mut R) -> Result<Self, DecodeError> {
				let mut buf = [0u8; $size];
				r.read_exact(&mut buf)?;
				Ok(buf)
			}
		}
	);
}

impl_array!(32); // for channel id, hashes & secrets
impl_array!(33); // for PublicKey
impl_array!(64); // for Signature

// HashMap
impl<K, V> Writeable for HashMap<K, V>
	where K: Writeable + Eq + Hash,
	      V: Writeable
{
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		(self.len() as u16).write(w)?;
		for (key, value) in self.iter() {
			key.write(w)?;
			value.write(w)?;
		}
		Ok(())
	}
}

impl<R: Read, K, V> Readable<R> for HashMap<K, V>
	where K: Readable<R> + Eq + Hash,
	      V: Readable<R>
{
	#[inline]
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let len: u16 = Readable::read(r)?;
		let mut ret = HashMap::with_capacity(len as usize);
		for _ in 0..len {
			ret.insert(K::read(r)?, V::read(r)?);
		}
		Ok(ret)
	}
}

// Vectors
impl<T: Writeable> Writeable for Vec<T> {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		(self.len() as u16).write(w)?;
		for e in self.iter() {
			e.write(w)?;
		}
		Ok(())
	}
}

impl<R: Read, T: Readable<R>> Readable<R> for Vec<T> {
	#[inline]
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let len: u16 = Readable::read(r)?;
		let mut ret = Vec::with_capacity(::std::cmp::min(len as usize, MAX_BUF_SIZE / ::std::mem::size_of::<T>()));
		for _ in 0..len {
			ret.push(T::read(r)?);
		}
		Ok(ret)
	}
}

impl<A: Writeable, B: Writeable> Writeable for (A, B) {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.0.write(w)?;
		self.1.write(w)
	}
}

impl<R: Read, A: Readable<R>, B: Readable<R>> Readable<R> for (A, B) {
	#[inline]
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let a = A::read(r)?;
		let b = B::read(r)?;
		Ok((a, b))
	}
}

impl Writeable for Script {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		(self.len() as u16).write(w)?;
		w.write_all(&self.to_bytes())
	}
}

impl<R: Read> Readable<R> for Script {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let len = <u16 as Readable<R>>::read(r)? as usize;
		let mut buf = vec![0; len];
		r.read_exact(&mut buf)?;
		Ok(Script::from(buf))
	}
}

impl Writeable for PublicKey {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.serialize().write(w)
	}
}

impl<R: Read> Readable<R> for PublicKey {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 33] = Readable::read(r)?;
		match PublicKey::from_slice(&buf) {
			Ok(key) => Ok(key),
			Err(_) => return Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for SecretKey {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		let mut ser = [0; 32];
		ser.copy_from_slice(&self[..]);
		ser.write(w)
	}
}

impl<R: Read> Readable<R> for SecretKey {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(r)?;
		match SecretKey::from_slice(&buf) {
			Ok(key) => Ok(key),
			Err(_) => return Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for Sha256dHash {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		w.write_all(&self[..])
	}
}

impl<R: Read> Readable<R> for Sha256dHash {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		use bitcoin_hashes::Hash;
		let buf: [u8; 32] = Readable::read(r)?;
		Ok(Sha256dHash::from_slice(&buf[..]).unwrap())
	}
}

impl Writeable for Signature {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.serialize_compact().write(w)
	}
}

impl<R: Read> Readable<R> for Signature {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 64] = Readable::read(r)?;
		match Signature::from_compact(&buf) {
			Ok(sig) => Ok(sig),
			Err(_) => return Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for Transaction {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		let ser = consensus::encode::serialize(self);
		(ser.len() as u32).write(w)?;
		w.write_all(&ser)
	}
}

impl<R: Read> Readable<R> for Transaction {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		let len = <u32 as Readable<R>>::read(r)? as usize;
		if len > MAX_BUF_SIZE {
			return Err(DecodeError::BadLengthDescriptor);
		}
		let mut buf = vec![0; len];
		r.read_exact(&mut buf)?;
		match consensus::encode::deserialize(&buf) {
			Ok(tx) => Ok(tx),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}

impl<T: Writeable> Writeable for Option<T> {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		match *self {
			None => 0u8.write(w)?,
			Some(ref data) => {
				1u8.write(w)?;
				data.write(w)?;
			}
		}
		Ok(())
	}
}

impl<R: Read, T: Readable<R>> Readable<R> for Option<T> {
	fn read(r: &mut R) -> Result<Self, DecodeError> {
		match <u8 as Readable<R>>::read(r)? {
			0 => Ok(None),
			1 => Ok(Some(Readable::read(r)?)),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

macro_rules! impl_writeable {
	($st:ident, {$($field:ident),*}) => {
		impl ::util::ser::Writeable for $st {
			fn write<W: ::util::ser::Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
				$( self.$field.write(w)?; )*
				Ok(())
			}
		}

		impl<R: ::std::io::Read> ::util::ser::Readable<R> for $st {
			fn read(r: &mut R) -> Result<Self, ::ln::msgs::DecodeError> {
				Ok(Self {
					$($field: ::util::ser::Readable::read(r)?),*
				})
			}
		}
	}
}
