//! Data Object List (DOL) and Tag List processing.
//!
//! A DOL is a list of tag/length pairs with no values: the card's way of
//! saying "send me these fields, at these widths, in this order". The
//! terminal answers with a bare concatenation of values, reconciled to the
//! requested widths by the format-dependent rules of EMV Book 3, 5.4. A
//! Tag List (e.g. the Static Data Authentication Tag List) is the same idea
//! without the lengths.

use tracing::trace;

use super::{take_len, take_tag, Tag, TlvError, TlvList};
use crate::tags::{self, Format};

/// One DOL entry: a tag and the width the card expects its value at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DolEntry {
    pub tag: Tag,
    pub len: usize,
}

/// A borrowed DOL. Entries are decoded lazily; re-calling [`Dol::entries`]
/// restarts the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dol<'a> {
    raw: &'a [u8],
}

impl<'a> Dol<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        Dol { raw }
    }

    pub fn entries(&self) -> DolIter<'a> {
        DolIter { data: self.raw }
    }

    /// Total width of the data the DOL asks for. EMV transports lengths in
    /// signed 32-bit counts; anything beyond that is rejected.
    pub fn data_len(&self) -> Result<usize, TlvError> {
        let mut total: i32 = 0;
        for entry in self.entries() {
            let entry = entry?;
            let len = i32::try_from(entry.len).map_err(|_| TlvError::DolTooLong)?;
            total = total.checked_add(len).ok_or(TlvError::DolTooLong)?;
        }
        Ok(total as usize)
    }

    /// Build the concatenated value stream the card asked for, writing into
    /// `out`. For each entry the first matching tag in `src1`, then `src2`,
    /// supplies the value; a missing tag contributes zero bytes of the
    /// declared width. Returns the number of bytes written.
    pub fn build_into(
        &self,
        src1: &TlvList,
        src2: Option<&TlvList>,
        out: &mut [u8],
    ) -> Result<usize, TlvError> {
        let needed = self.data_len()?;
        if out.len() < needed {
            return Err(TlvError::OutputTooSmall);
        }
        let mut at = 0;
        for entry in self.entries() {
            let entry = entry?;
            if entry.len == 0 {
                continue;
            }
            let dest = &mut out[at..at + entry.len];
            at += entry.len;
            let found = src1
                .get(entry.tag)
                .or_else(|| src2.and_then(|s| s.get(entry.tag)));
            match found {
                Some(field) => reconcile(entry.tag, &field.value, dest),
                None => {
                    trace!("DOL wants {} but no source carries it", entry.tag);
                    dest.fill(0x00);
                }
            }
        }
        Ok(at)
    }

    /// [`Dol::build_into`] into a freshly sized buffer.
    pub fn build(&self, src1: &TlvList, src2: Option<&TlvList>) -> Result<Vec<u8>, TlvError> {
        let mut out = vec![0u8; self.data_len()?];
        self.build_into(src1, src2, &mut out)?;
        Ok(out)
    }
}

/// Fit a value into the width a DOL entry declares (Book 3, 5.4).
///
/// Same width copies verbatim. A longer value is truncated by format:
/// numeric and compressed numeric keep the least significant (rightmost)
/// digits, binary keeps the leftmost bytes. A shorter value is padded by
/// format: numeric with zeros on the left, compressed numeric with 0xFF on
/// the right, binary with zeros on the right.
fn reconcile(tag: Tag, value: &[u8], dest: &mut [u8]) {
    let want = dest.len();
    let have = value.len();
    let format = tags::format_of(tag);
    if have == want {
        dest.copy_from_slice(value);
    } else if have > want {
        match format {
            Format::Numeric | Format::CompressedNumeric => {
                dest.copy_from_slice(&value[have - want..])
            }
            _ => dest.copy_from_slice(&value[..want]),
        }
    } else {
        match format {
            Format::Numeric => {
                dest[..want - have].fill(0x00);
                dest[want - have..].copy_from_slice(value);
            }
            Format::CompressedNumeric => {
                dest[..have].copy_from_slice(value);
                dest[have..].fill(0xFF);
            }
            _ => {
                dest[..have].copy_from_slice(value);
                dest[have..].fill(0x00);
            }
        }
    }
}

pub struct DolIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for DolIter<'a> {
    type Item = Result<DolEntry, TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let (rest, tag) = match take_tag(self.data) {
            Ok(v) => v,
            Err(e) => {
                self.data = &[];
                return Some(Err(e));
            }
        };
        let (rest, len) = match take_len(rest) {
            Ok(v) => v,
            Err(e) => {
                self.data = &[];
                return Some(Err(e));
            }
        };
        self.data = rest;
        Some(Ok(DolEntry { tag, len }))
    }
}

/// A borrowed Tag List: tags only, no lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagList<'a> {
    raw: &'a [u8],
}

impl<'a> TagList<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        TagList { raw }
    }

    pub fn tags(&self) -> TagIter<'a> {
        TagIter { data: self.raw }
    }

    /// Does the list mention this tag?
    pub fn contains(&self, tag: Tag) -> bool {
        self.tags().any(|t| t == Ok(tag))
    }
}

pub struct TagIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for TagIter<'a> {
    type Item = Result<Tag, TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        match take_tag(self.data) {
            Ok((rest, tag)) => {
                self.data = rest;
                Some(Ok(tag))
            }
            Err(e) => {
                self.data = &[];
                Some(Err(e))
            }
        }
    }
}
