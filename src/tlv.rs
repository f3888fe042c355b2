//! ISO 7816 flavoured BER-TLV (Tag-Length-Value) engine.
//!
//! BER is an ASN.1 encoding, originally documented in ISO 8825. The subset
//! smartcards speak is the slightly odd dialect of ISO 7816-6, recapped in
//! EMV Book 3, Annex B, which is freely available from EMVCo's website and
//! is what this implementation is written against. The ecosystem convention
//! of referring to tags by their hex value (0x9F38 rather than a namespaced
//! ASN.1 name) is followed throughout.
//!
//! Cards pad TLV blobs to cipher block boundaries with runs of 0x00 or 0xFF;
//! whether that is tolerated is the caller's call, via [`PaddingPolicy`].

pub mod dol;

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use thiserror::Error;
use tracing::warn;

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// Templates the EMV list decoder descends into. Anything else constructed
/// is kept whole; Book 3 only promises nesting for these.
const KNOWN_TEMPLATES: [u32; 5] = [0x6F, 0x70, 0x77, 0xA5, 0xBF0C];

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TlvError {
    /// A length field runs past the end of the input, or a structure is
    /// otherwise inconsistent with its declared length.
    #[error("malformed TLV structure")]
    MalformedTlv,

    /// Tag bytes end in the middle of a multi-byte tag.
    #[error("truncated tag")]
    TruncatedTag,

    /// Residual 0x00 or 0xFF bytes after the last complete TLV.
    #[error("trailing padding after last TLV")]
    Padding,

    /// The caller's output buffer cannot hold the result.
    #[error("output buffer too small")]
    OutputTooSmall,

    /// A DOL's total data length does not fit a signed 32-bit count.
    #[error("data object list too long")]
    DolTooLong,
}

/// What to do with residual 0x00/0xFF bytes after the last complete TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingPolicy {
    /// Report [`TlvError::Padding`].
    Reject,
    /// Swallow the run silently, provided it is shorter than the cipher
    /// block size of the structure it pads (8 or 16 bytes). Longer runs are
    /// still reported.
    Ignore { block_size: usize },
}

impl Default for PaddingPolicy {
    fn default() -> Self {
        PaddingPolicy::Reject
    }
}

/// A BER tag, canonically a 24-bit integer: up to 3 encoded bytes, kept in
/// the integer the way they appear on the wire (0x9F38, not 0x1F38).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

impl Tag {
    pub const fn new(value: u32) -> Self {
        Tag(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Number of bytes this tag occupies on the wire.
    pub fn encoded_len(self) -> usize {
        match self.0 {
            0..=0xFF => 1,
            0x100..=0xFFFF => 2,
            _ => 3,
        }
    }

    /// The first (class/constructed) byte of the encoded tag.
    fn first_byte(self) -> u8 {
        match self.encoded_len() {
            1 => self.0 as u8,
            2 => (self.0 >> 8) as u8,
            _ => (self.0 >> 16) as u8,
        }
    }

    /// Does this tag introduce a constructed value (one containing further
    /// TLV tuples, as opposed to a primitive string/number/blob)?
    pub fn is_constructed(self) -> bool {
        self.first_byte() & (1 << 5) != 0
    }

    fn write(self, out: &mut Vec<u8>) {
        match self.encoded_len() {
            1 => out.push(self.0 as u8),
            2 => out.extend_from_slice(&[(self.0 >> 8) as u8, self.0 as u8]),
            _ => out.extend_from_slice(&[(self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8]),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

impl From<u32> for Tag {
    fn from(v: u32) -> Self {
        Tag(v)
    }
}

/// Domain flag: this AID entry matches by prefix rather than exactly.
pub const FLAG_MATCH_PARTIAL: u8 = 1 << 0;

/// One tag-length-value field. The length is implicit in the value; the
/// flags byte carries domain bits such as the AID matching mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub tag: Tag,
    pub value: Vec<u8>,
    pub flags: u8,
}

impl Field {
    pub fn new<V: Into<Vec<u8>>>(tag: Tag, value: V) -> Self {
        Field {
            tag,
            value: value.into(),
            flags: 0,
        }
    }

    pub fn with_flags<V: Into<Vec<u8>>>(tag: Tag, value: V, flags: u8) -> Self {
        Field {
            tag,
            value: value.into(),
            flags,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match crate::tags::name_of(self.tag) {
            Some(name) => write!(f, "{} ({}): {}", self.tag, name, hex::encode(&self.value)),
            None => write!(f, "{}: {}", self.tag, hex::encode(&self.value)),
        }
    }
}

/// An ordered sequence of fields. Lookups walk in insertion order, and
/// duplicate tags are legal and preserved — EMV relies on both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvList {
    fields: Vec<Field>,
}

impl TlvList {
    pub fn new() -> Self {
        TlvList { fields: Vec::new() }
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// First field with this tag, in insertion order.
    pub fn get(&self, tag: Tag) -> Option<&Field> {
        self.fields.iter().find(|f| f.tag == tag)
    }

    pub fn get_mut(&mut self, tag: Tag) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.tag == tag)
    }

    /// Mutable access to the first field with this tag, appending a field
    /// holding `default` first when the list has none.
    pub fn get_or_insert_mut<V: Into<Vec<u8>>>(&mut self, tag: Tag, default: V) -> &mut Field {
        let at = match self.fields.iter().position(|f| f.tag == tag) {
            Some(at) => at,
            None => {
                self.fields.push(Field::new(tag, default));
                self.fields.len() - 1
            }
        };
        &mut self.fields[at]
    }

    /// Value bytes of the first field with this tag.
    pub fn value(&self, tag: Tag) -> Option<&[u8]> {
        self.get(tag).map(|f| f.value.as_slice())
    }

    /// Replace the value of the first field with this tag, or append a new
    /// field if there is none.
    pub fn set<V: Into<Vec<u8>>>(&mut self, tag: Tag, value: V) {
        match self.get_mut(tag) {
            Some(f) => f.value = value.into(),
            None => self.push(Field::new(tag, value)),
        }
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Field> {
        let idx = self.fields.iter().position(|f| f.tag == tag)?;
        Some(self.fields.remove(idx))
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Field> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// BER-encode every field in order, with minimal length encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            field.tag.write(&mut out);
            write_len(field.value.len(), &mut out);
            out.extend_from_slice(&field.value);
        }
        out
    }
}

impl<'a> IntoIterator for &'a TlvList {
    type Item = &'a Field;
    type IntoIter = std::slice::Iter<'a, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl FromIterator<Field> for TlvList {
    fn from_iter<T: IntoIterator<Item = Field>>(iter: T) -> Self {
        TlvList {
            fields: iter.into_iter().collect(),
        }
    }
}

fn write_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

/// Parses a tag.
///
/// If bits 1-5 of the first byte are all set, this is a multi-byte tag,
/// continuing until and including the first subsequent byte without bit 8
/// set. EMV caps tags at 3 encoded bytes. See EMV Book 3, Annex B1.
fn take_tag(data: &[u8]) -> Result<(&[u8], Tag), TlvError> {
    let (rest, first): (&[u8], u8) = be_u8::<_, nom::error::Error<&[u8]>>(data)
        .map_err(|_: nom::Err<_>| TlvError::TruncatedTag)?;
    if first & 0b0001_1111 != 0b0001_1111 {
        return Ok((rest, Tag(first as u32)));
    }
    let mut tag = first as u32;
    let mut rest = rest;
    loop {
        let (r, b): (&[u8], u8) = be_u8::<_, nom::error::Error<&[u8]>>(rest)
            .map_err(|_: nom::Err<_>| TlvError::TruncatedTag)?;
        tag = (tag << 8) | b as u32;
        rest = r;
        if b & (1 << 7) == 0 {
            break;
        }
        if tag > 0xFF_FFFF {
            // More than 3 encoded bytes is beyond EMV's canonical 24 bits.
            return Err(TlvError::MalformedTlv);
        }
    }
    if tag > 0xFF_FFFF {
        return Err(TlvError::MalformedTlv);
    }
    Ok((rest, Tag(tag)))
}

/// Parses a length field. Short form encodes itself; long form (0x80 | n)
/// is followed by n big-endian bytes. The indefinite form (a bare 0x80) is
/// valid BER but not EMV, and is rejected.
fn take_len(data: &[u8]) -> Result<(&[u8], usize), TlvError> {
    let (rest, first): (&[u8], u8) = be_u8::<_, nom::error::Error<&[u8]>>(data)
        .map_err(|_: nom::Err<_>| TlvError::MalformedTlv)?;
    if first < 0x80 {
        return Ok((rest, first as usize));
    }
    let n = (first & 0x7F) as usize;
    if n == 0 || n > 4 {
        return Err(TlvError::MalformedTlv);
    }
    if rest.len() < n {
        return Err(TlvError::MalformedTlv);
    }
    let len = BigEndian::read_uint(rest, n) as usize;
    Ok((&rest[n..], len))
}

/// Parses the next (tag, value) pair, returning the remaining input.
pub fn parse_next(data: &[u8]) -> Result<(&[u8], Tag, &[u8]), TlvError> {
    let (rest, tag) = take_tag(data)?;
    let (rest, len) = take_len(rest)?;
    let (rest, value) = take::<_, _, nom::error::Error<&[u8]>>(len)(rest)
        .map_err(|_: nom::Err<_>| TlvError::MalformedTlv)?;
    Ok((rest, tag, value))
}

/// Iterator over the (tag, value) pairs of a TLV blob.
pub struct TlvIter<'a> {
    data: &'a [u8],
    policy: PaddingPolicy,
    failed: bool,
}

impl<'a> TlvIter<'a> {
    fn padding_run(&self) -> bool {
        !self.data.is_empty()
            && (self.data.iter().all(|&b| b == 0x00) || self.data.iter().all(|&b| b == 0xFF))
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<(Tag, &'a [u8]), TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        if self.padding_run() {
            match self.policy {
                PaddingPolicy::Ignore { block_size } if self.data.len() < block_size => {
                    self.data = &[];
                    return None;
                }
                _ => {
                    self.failed = true;
                    return Some(Err(TlvError::Padding));
                }
            }
        }
        match parse_next(self.data) {
            Ok((rest, tag, value)) => {
                self.data = rest;
                Some(Ok((tag, value)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterate over a TLV blob, rejecting trailing padding.
pub fn iter(data: &[u8]) -> TlvIter<'_> {
    iter_with(data, PaddingPolicy::Reject)
}

/// Iterate over a TLV blob with an explicit padding policy.
pub fn iter_with(data: &[u8], policy: PaddingPolicy) -> TlvIter<'_> {
    TlvIter {
        data,
        policy,
        failed: false,
    }
}

/// Decode an EMV TLV blob into a flat list.
///
/// Primitive fields are appended in encounter order (duplicates preserved);
/// the well-known constructed templates (FCI, record, response format 2,
/// FCI proprietary/discretionary) are descended into rather than stored.
/// A template must consume exactly the length it declares.
pub fn decode_into(data: &[u8], list: &mut TlvList, policy: PaddingPolicy) -> Result<(), TlvError> {
    for item in iter_with(data, policy) {
        let (tag, value) = item?;
        if tag.is_constructed() && KNOWN_TEMPLATES.contains(&tag.value()) {
            // Padding only ever trails the outermost structure; inside a
            // template every byte is accounted for.
            decode_into(value, list, PaddingPolicy::Reject)?;
        } else {
            if tag.is_constructed() {
                warn!("keeping unknown constructed field {} whole", tag);
            }
            list.push(Field::new(tag, value));
        }
    }
    Ok(())
}

/// Decode an EMV TLV blob into a fresh list, rejecting padding.
pub fn decode(data: &[u8]) -> Result<TlvList, TlvError> {
    let mut list = TlvList::new();
    decode_into(data, &mut list, PaddingPolicy::Reject)?;
    Ok(list)
}
