//! Portable binary archive.
//!
//! Values are written as fixed-width little-endian integers; `usize` always
//! travels as `u64` so archives move between 32- and 64-bit builds. Strings
//! and sequences carry a `u64` element count, `Option` a one-byte tag.
//!
//! A table is archived as its capacity, its size, and then `size` key-value
//! pairs in iteration order. Restoring decodes the whole stream before the
//! target is touched, then re-creates it with the archived capacity and
//! assigns the pairs. The target's previous state does not matter: it may
//! be uninitialized, populated, or created with a different capacity. On
//! any failure the target is left empty.

use crate::alloc::{AllocError, Allocator};
use crate::hash::KeyHash;
use crate::open_hash_map::OpenHashMap;
use crate::packed_hash_map::{Entry, PackedHashMap};
use crate::table::{Table, TableError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::string::FromUtf8Error;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on elements reserved ahead of decoding a sequence, so a
/// corrupt length cannot trigger a huge allocation.
const PREALLOC_LIMIT: usize = 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive stream failed")]
    Io(#[source] io::Error),
    #[error("archive ended unexpectedly")]
    Truncated,
    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),
    #[error("invalid option tag {0:#04x}")]
    InvalidTag(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("length {0} does not fit in usize")]
    LengthOverflow(u64),
    #[error("archived table holds {size} entries but capacity {capacity}")]
    CapacityBelowSize { capacity: usize, size: usize },
    #[error("archived table repeats keys: {expected} pairs, {actual} distinct")]
    DuplicateKeys { expected: usize, actual: usize },
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Table(#[from] TableError),
}

impl ArchiveError {
    /// Whether the stream itself was malformed, as opposed to I/O or
    /// allocation trouble while handling it.
    pub fn is_deserialization(&self) -> bool {
        matches!(
            self,
            ArchiveError::Truncated
                | ArchiveError::InvalidBool(_)
                | ArchiveError::InvalidTag(_)
                | ArchiveError::InvalidUtf8(_)
                | ArchiveError::LengthOverflow(_)
                | ArchiveError::CapacityBelowSize { .. }
                | ArchiveError::DuplicateKeys { .. }
        )
    }
}

impl From<io::Error> for ArchiveError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ArchiveError::Truncated
        } else {
            ArchiveError::Io(e)
        }
    }
}

pub trait Encode {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError>;
}

pub trait Decode: Sized {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError>;
}

/// Decode in place, replacing the current contents of `self`.
pub trait Restore {
    fn restore<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<(), ArchiveError>;
}

impl Encode for u8 {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        Ok(w.write_u8(*self)?)
    }
}

impl Decode for u8 {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
        Ok(r.read_u8()?)
    }
}

impl Encode for i8 {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        Ok(w.write_i8(*self)?)
    }
}

impl Decode for i8 {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
        Ok(r.read_i8()?)
    }
}

macro_rules! impl_fixed_width {
    ($($t:ty => $write:ident, $read:ident;)*) => {$(
        impl Encode for $t {
            fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
                Ok(w.$write::<LittleEndian>(*self)?)
            }
        }

        impl Decode for $t {
            fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
                Ok(r.$read::<LittleEndian>()?)
            }
        }
    )*};
}

impl_fixed_width! {
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl Encode for usize {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        (*self as u64).encode(w)
    }
}

impl Decode for usize {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
        let raw = u64::decode(r)?;
        usize::try_from(raw).map_err(|_| ArchiveError::LengthOverflow(raw))
    }
}

impl Encode for bool {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        u8::from(*self).encode(w)
    }
}

impl Decode for bool {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
        match u8::decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ArchiveError::InvalidBool(other)),
        }
    }
}

impl Encode for str {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        self.len().encode(w)?;
        Ok(w.write_all(self.as_bytes())?)
    }
}

impl Encode for String {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        self.as_str().encode(w)
    }
}

impl Decode for String {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
        let len = usize::decode(r)?;
        let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT));
        (&mut *r).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(ArchiveError::Truncated);
        }
        Ok(String::from_utf8(buf)?)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        self.len().encode(w)?;
        self.iter().try_for_each(|item| item.encode(w))
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        self.as_slice().encode(w)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
        let len = usize::decode(r)?;
        let mut out = Vec::with_capacity(len.min(PREALLOC_LIMIT));
        for _ in 0..len {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        match self {
            None => 0u8.encode(w),
            Some(v) => {
                1u8.encode(w)?;
                v.encode(w)
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
        match u8::decode(r)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(r)?)),
            other => Err(ArchiveError::InvalidTag(other)),
        }
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        self.0.encode(w)?;
        self.1.encode(w)
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, ArchiveError> {
        Ok((A::decode(r)?, B::decode(r)?))
    }
}

/// Write `table` as capacity, size, then its pairs in iteration order.
pub fn write_table<T, W>(table: &T, w: &mut W) -> Result<(), ArchiveError>
where
    T: Table,
    T::Key: Encode,
    T::Value: Encode,
    W: Write + ?Sized,
{
    table.capacity().encode(w)?;
    table.len().encode(w)?;
    for (key, value) in table.iter() {
        key.encode(w)?;
        value.encode(w)?;
    }
    Ok(())
}

/// Replace the contents of `table` with the archived table read from `r`.
///
/// On error `table` is cleared, or left uninitialized if re-creating it
/// failed.
///
/// The archived capacity is allocated as-is, so a 16-byte header can ask
/// for an arbitrarily large table. Restore untrusted input into a table
/// backed by a [`BoundedPool`](crate::pool::BoundedPool); an oversized
/// capacity then fails with [`ArchiveError::Alloc`].
pub fn read_table<T, R>(table: &mut T, r: &mut R) -> Result<(), ArchiveError>
where
    T: Table,
    T::Key: Decode,
    T::Value: Decode,
    R: Read + ?Sized,
{
    let result = decode_pairs::<T::Key, T::Value, R>(r)
        .and_then(|(capacity, pairs)| rebuild(table, capacity, pairs));
    if let Err(err) = &result {
        table.clear();
        warn!(error = %err, "rejected archived table");
    }
    result
}

type Pairs<K, V> = Vec<(K, V)>;

fn decode_pairs<K, V, R>(r: &mut R) -> Result<(usize, Pairs<K, V>), ArchiveError>
where
    K: Decode,
    V: Decode,
    R: Read + ?Sized,
{
    let capacity = usize::decode(r)?;
    let size = usize::decode(r)?;
    if size > capacity {
        return Err(ArchiveError::CapacityBelowSize { capacity, size });
    }
    let mut pairs = Vec::with_capacity(size.min(PREALLOC_LIMIT));
    for _ in 0..size {
        pairs.push(<(K, V)>::decode(r)?);
    }
    Ok((capacity, pairs))
}

fn rebuild<T: Table>(
    table: &mut T,
    capacity: usize,
    pairs: Pairs<T::Key, T::Value>,
) -> Result<(), ArchiveError> {
    let size = pairs.len();
    table.create(capacity)?;
    table.assign(pairs)?;
    if table.len() != size {
        return Err(ArchiveError::DuplicateKeys {
            expected: size,
            actual: table.len(),
        });
    }
    debug!(capacity, size, "restored table from archive");
    Ok(())
}

impl<K, V, H> Encode for OpenHashMap<K, V, H>
where
    K: Eq + Encode,
    V: Encode,
    H: KeyHash<K>,
{
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        write_table(self, w)
    }
}

impl<K, V, H> Restore for OpenHashMap<K, V, H>
where
    K: Eq + Decode,
    V: Decode,
    H: KeyHash<K>,
{
    fn restore<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<(), ArchiveError> {
        read_table(self, r)
    }
}

impl<K, V, H, A> Encode for PackedHashMap<K, V, H, A>
where
    K: Eq + Encode,
    V: Encode,
    H: KeyHash<K>,
    A: Allocator<Entry<K, V>>,
{
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ArchiveError> {
        write_table(self, w)
    }
}

impl<K, V, H, A> Restore for PackedHashMap<K, V, H, A>
where
    K: Eq + Decode,
    V: Decode,
    H: KeyHash<K>,
    A: Allocator<Entry<K, V>>,
{
    fn restore<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<(), ArchiveError> {
        read_table(self, r)
    }
}

/// A byte stream that values and tables are written to or read from.
#[derive(Debug, Default)]
pub struct BinArchive<S> {
    stream: S,
}

impl<S> BinArchive<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Write> BinArchive<S> {
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> Result<(), ArchiveError> {
        value.encode(&mut self.stream)
    }

    pub fn flush(&mut self) -> Result<(), ArchiveError> {
        Ok(self.stream.flush()?)
    }
}

impl<S: Read> BinArchive<S> {
    /// Restore `target` in place from the next value in the stream.
    pub fn read<T: Restore + ?Sized>(&mut self, target: &mut T) -> Result<(), ArchiveError> {
        target.restore(&mut self.stream)
    }

    pub fn read_value<T: Decode>(&mut self) -> Result<T, ArchiveError> {
        T::decode(&mut self.stream)
    }
}
