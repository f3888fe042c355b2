//! ATR (Answer-to-Reset) parser.
//!
//! Aside from ISO 7816-3, this is covered by the EMV L1 Contact Interface
//! Specification, Section 8: "Answer to Reset", which is freely available
//! from EMVCo's website. Useful online ATR parser for cross-checking:
//! https://smartcard-atr.apdu.fr/
//!
//! The parser fills in the ISO defaults first (Fi=372, Di=1, f(max)=5 MHz,
//! 12 etu guard time, T=0, WI=10, IFSC=32, CWI=13, BWI=4, LRC) and lets the
//! interface bytes override them, so the result is always a complete set of
//! timing parameters.

use nom::bytes::complete::take;
use nom::combinator::cond;
use nom::number::complete::be_u8;
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;
use tracing::warn;

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AtrError {
    /// An ATR is 2 to 33 bytes; this one isn't, or announced bytes are
    /// missing, or unannounced bytes trail it.
    #[error("ATR length invalid")]
    InvalidLength,
    /// The initial character is neither 0x3B nor 0x3F.
    #[error("unknown initial character TS")]
    UnknownTs,
    /// An interface byte carries an RFU or out-of-spec value.
    #[error("invalid interface byte")]
    InvalidInterfaceByte,
    /// TCK is missing or the T0..TCK XOR is nonzero.
    #[error("ATR checksum invalid")]
    InvalidChecksum,
    /// The historical byte block ends mid-structure.
    #[error("historical bytes truncated")]
    TruncatedHistoricalBytes,
}

type Result<T> = std::result::Result<T, AtrError>;

/// Initial Character TS: electrical transmission convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Convention {
    /// Direct convention, 1 is high - (H)LHHLHHHLLH.
    Direct = 0x3B,
    /// Inverse convention, 1 is low - (H)LHHLLLLLLH.
    /// Relatively rare; EMV (but not ISO 7816) has deprecated this form.
    Inverse = 0x3F,
    #[num_enum(catch_all)]
    Invalid(u8) = 0xFF,
}

/// T=1 error detection code selected by TC3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edc {
    Lrc,
    Crc,
}

/// The TA/TB/TC/TD interface byte matrix, i in 1..=4.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceBytes {
    pub ta: [Option<u8>; 4],
    pub tb: [Option<u8>; 4],
    pub tc: [Option<u8>; 4],
    pub td: [Option<u8>; 4],
}

impl InterfaceBytes {
    /// Protocols indicated by the TD bytes, in order of appearance.
    pub fn protocols(&self) -> impl Iterator<Item = u8> + '_ {
        self.td.iter().flatten().map(|td| td & 0x0F)
    }

    /// Does any TD indicate a protocol other than T=0?
    pub fn beyond_t0(&self) -> bool {
        self.protocols().any(|p| p != 0)
    }
}

/// Transmission parameters after applying the interface bytes over the
/// ISO defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Clock rate conversion integer.
    pub fi: u16,
    /// Baud rate adjustment integer.
    pub di: u8,
    /// Maximum clock frequency, in kHz.
    pub fmax_khz: u32,
    /// Character guard time, in etu.
    pub guard_etu: u8,
    /// Extra guard time N from TC1 (0xFF asks for the protocol minimum).
    pub extra_guard: u8,
    /// T=0 waiting time integer.
    pub wi: u8,
    /// T=1 information field size of the card.
    pub ifsc: u8,
    /// T=1 character waiting time integer.
    pub cwi: u8,
    /// T=1 block waiting time integer.
    pub bwi: u8,
    /// T=1 error detection code.
    pub edc: Edc,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            fi: 372,
            di: 1,
            fmax_khz: 5000,
            guard_etu: 12,
            extra_guard: 0,
            wi: 10,
            ifsc: 32,
            cwi: 13,
            bwi: 4,
            edc: Edc::Lrc,
        }
    }
}

/// Fi and f(max) by TA1 high nibble (ISO 7816-3, Table 7).
fn fi_fmax(nibble: u8) -> Result<(u16, u32)> {
    Ok(match nibble {
        0x0 => (372, 4000),
        0x1 => (372, 5000),
        0x2 => (558, 6000),
        0x3 => (744, 8000),
        0x4 => (1116, 12000),
        0x5 => (1488, 16000),
        0x6 => (1860, 20000),
        0x9 => (512, 5000),
        0xA => (768, 7500),
        0xB => (1024, 10000),
        0xC => (1536, 15000),
        0xD => (2048, 20000),
        _ => return Err(AtrError::InvalidInterfaceByte),
    })
}

/// Di by TA1 low nibble (ISO 7816-3, Table 8).
fn di(nibble: u8) -> Result<u8> {
    Ok(match nibble {
        0x1 => 1,
        0x2 => 2,
        0x3 => 4,
        0x4 => 8,
        0x5 => 16,
        0x6 => 32,
        0x7 => 64,
        0x8 => 12,
        0x9 => 20,
        _ => return Err(AtrError::InvalidInterfaceByte),
    })
}

/// Card life cycle and status word from the historical bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusIndicator {
    pub life_cycle: Option<u8>,
    pub sw: Option<u16>,
}

fn parse_status_indicator(data: &[u8]) -> Result<StatusIndicator> {
    match data {
        [lc] => Ok(StatusIndicator {
            life_cycle: Some(*lc),
            sw: None,
        }),
        [sw1, sw2] => Ok(StatusIndicator {
            life_cycle: None,
            sw: Some(u16::from_be_bytes([*sw1, *sw2])),
        }),
        [lc, sw1, sw2] => Ok(StatusIndicator {
            life_cycle: Some(*lc),
            sw: Some(u16::from_be_bytes([*sw1, *sw2])),
        }),
        _ => Err(AtrError::TruncatedHistoricalBytes),
    }
}

/// Decoded historical bytes, shaped by the category byte T1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoricalBytes {
    /// No historical bytes at all (K = 0).
    Absent,
    /// Category 0x00: COMPACT-TLV objects followed by a mandatory 3-byte
    /// status indicator.
    CompactTlv {
        objects: Vec<(u8, Vec<u8>)>,
        status: StatusIndicator,
    },
    /// Category 0x80: COMPACT-TLV objects throughout; a tag-8 object, if
    /// present, is the status indicator.
    CompactTlvOpen {
        objects: Vec<(u8, Vec<u8>)>,
        status: Option<StatusIndicator>,
    },
    /// Category 0x10: a DIR data reference.
    DirDataReference(u8),
    /// Any other category: kept raw.
    Proprietary(u8, Vec<u8>),
}

/// COMPACT-TLV: high nibble is a tag, low nibble is a length. Not BER, but
/// thankfully this makes the parser nice and compact, too.
fn parse_compact_tlv(mut data: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut objects = Vec::new();
    while !data.is_empty() {
        let (rest, tl): (&[u8], u8) = be_u8::<_, nom::error::Error<&[u8]>>(data)
            .map_err(|_: nom::Err<_>| AtrError::TruncatedHistoricalBytes)?;
        let (tag, len) = (tl >> 4, (tl & 0x0F) as usize);
        let (rest, value) = take::<_, _, nom::error::Error<&[u8]>>(len)(rest)
            .map_err(|_: nom::Err<_>| AtrError::TruncatedHistoricalBytes)?;
        objects.push((tag, value.to_vec()));
        data = rest;
    }
    Ok(objects)
}

fn parse_historical(data: &[u8]) -> Result<HistoricalBytes> {
    let Some((&category, rest)) = data.split_first() else {
        return Ok(HistoricalBytes::Absent);
    };
    match category {
        0x00 => {
            // The status indicator is the last three bytes, mandatorily.
            if rest.len() < 3 {
                return Err(AtrError::TruncatedHistoricalBytes);
            }
            let (objects, status) = rest.split_at(rest.len() - 3);
            Ok(HistoricalBytes::CompactTlv {
                objects: parse_compact_tlv(objects)?,
                status: parse_status_indicator(status)?,
            })
        }
        0x10 => match rest.first() {
            Some(&dir) => Ok(HistoricalBytes::DirDataReference(dir)),
            None => Err(AtrError::TruncatedHistoricalBytes),
        },
        0x80 => {
            let objects = parse_compact_tlv(rest)?;
            let status = objects
                .iter()
                .find(|(tag, _)| *tag == 0x8)
                .map(|(_, v)| parse_status_indicator(v))
                .transpose()?;
            Ok(HistoricalBytes::CompactTlvOpen { objects, status })
        }
        cat => {
            warn!("unknown historical byte category: {:02X}", cat);
            Ok(HistoricalBytes::Proprietary(cat, rest.to_vec()))
        }
    }
}

/// A decoded Answer-to-Reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    pub convention: Convention,
    /// The raw format byte T0.
    pub t0: u8,
    pub interface: InterfaceBytes,
    pub historical: HistoricalBytes,
    /// Check character; present iff a protocol beyond T=0 is indicated.
    pub tck: Option<u8>,
    pub timing: Timing,
}

impl Atr {
    /// First indicated protocol, defaulting to T=0.
    pub fn protocol(&self) -> u8 {
        self.interface.protocols().next().unwrap_or(0)
    }
}

fn take_u8(data: &[u8]) -> Result<(&[u8], u8)> {
    be_u8::<_, nom::error::Error<&[u8]>>(data)
        .map(|(rest, v)| (rest, v))
        .map_err(|_: nom::Err<_>| AtrError::InvalidLength)
}

/// Parse one column of the interface byte matrix; `present` is the high
/// nibble of T0 or of the previous TD.
fn take_column(data: &[u8], present: u8) -> Result<(&[u8], [Option<u8>; 4])> {
    let parse = |d| {
        let (d, ta) = cond(present & 1 != 0, be_u8)(d)?;
        let (d, tb) = cond(present & 2 != 0, be_u8)(d)?;
        let (d, tc) = cond(present & 4 != 0, be_u8)(d)?;
        let (d, td) = cond(present & 8 != 0, be_u8)(d)?;
        Ok((d, [ta, tb, tc, td]))
    };
    parse(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| AtrError::InvalidLength)
}

/// Decode and validate an ATR.
pub fn parse(data: &[u8]) -> Result<Atr> {
    if data.len() < 2 || data.len() > 33 {
        return Err(AtrError::InvalidLength);
    }

    let (rest, ts) = take_u8(data)?;
    let convention = Convention::from(ts);
    if matches!(convention, Convention::Invalid(_)) {
        return Err(AtrError::UnknownTs);
    }
    let (mut rest, t0) = take_u8(rest)?;
    let k = (t0 & 0x0F) as usize;

    let mut interface = InterfaceBytes::default();
    let mut present = t0 >> 4;
    for i in 0..4 {
        if present == 0 {
            break;
        }
        let (r, col) = take_column(rest, present)?;
        rest = r;
        interface.ta[i] = col[0];
        interface.tb[i] = col[1];
        interface.tc[i] = col[2];
        interface.td[i] = col[3];
        present = col[3].map(|td| td >> 4).unwrap_or(0);
    }
    if present != 0 {
        // A fifth column is not a thing as of this writing.
        return Err(AtrError::InvalidInterfaceByte);
    }

    if rest.len() < k {
        return Err(AtrError::TruncatedHistoricalBytes);
    }
    let (historical_raw, rest) = rest.split_at(k);
    let historical = parse_historical(historical_raw)?;

    // TCK is present exactly when a protocol beyond T=0 is indicated, and
    // then the XOR of everything from T0 through TCK must be zero.
    let tck = if interface.beyond_t0() {
        match rest {
            [tck] => {
                if data[1..].iter().fold(0u8, |acc, b| acc ^ b) != 0 {
                    return Err(AtrError::InvalidChecksum);
                }
                Some(*tck)
            }
            [] => return Err(AtrError::InvalidChecksum),
            _ => return Err(AtrError::InvalidLength),
        }
    } else {
        if !rest.is_empty() {
            return Err(AtrError::InvalidLength);
        }
        None
    };

    let mut timing = Timing::default();
    if let Some(ta1) = interface.ta[0] {
        let (fi, fmax) = fi_fmax(ta1 >> 4)?;
        timing.fi = fi;
        timing.fmax_khz = fmax;
        timing.di = di(ta1 & 0x0F)?;
    }
    if let Some(tc1) = interface.tc[0] {
        timing.extra_guard = tc1;
    }
    if let Some(tc2) = interface.tc[1] {
        timing.wi = tc2;
    }
    if let Some(ta3) = interface.ta[2] {
        timing.ifsc = ta3;
    }
    if let Some(tb3) = interface.tb[2] {
        timing.cwi = tb3 & 0x0F;
        timing.bwi = tb3 >> 4;
    }
    if let Some(tc3) = interface.tc[2] {
        timing.edc = if tc3 & 1 != 0 { Edc::Crc } else { Edc::Lrc };
        if tc3 & 0xFE != 0 {
            warn!("TC3 carries RFU bits: {:02X}", tc3);
        }
    }

    Ok(Atr {
        convention,
        t0,
        interface,
        historical,
        tck,
        timing,
    })
}
