//! Terminal Application Layer: the EMV card commands.
//!
//! One tier above the transport: this is where C-APDUs get their EMV
//! meaning. Every operation here issues a command through the TTL, maps
//! the status word onto the fatal/continuable split, and parses the
//! response into TLV structures. Command coding is from EMV Book 3,
//! Section 6; the PSE directory conventions from Book 1, Section 12.
//!
//! Nothing in this module sequences commands - that is the selection and
//! transaction state machines' job.

use tracing::{debug, trace_span, warn};

use crate::errors::{Fatal, Result, Soft};
use crate::oda::OdaBuffer;
use crate::tags;
use crate::tlv::{self, Field, PaddingPolicy, Tag, TlvList};
use crate::ttl::{Apdu, CardReader, Rapdu, Sw, Ttl};

/// DF name of the contact Payment System Environment.
pub const PSE_DF_NAME: &[u8] = b"1PAY.SYS.DDF01";

/// Cryptogram type requested from (or reported by) GENERATE AC, encoded
/// in the two top bits of P1 / CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcType {
    /// Application Authentication Cryptogram - declined.
    Aac,
    /// Transaction Certificate - approved offline.
    Tc,
    /// Authorisation Request Cryptogram - go online.
    Arqc,
}

impl AcType {
    pub fn p1(self) -> u8 {
        match self {
            AcType::Aac => 0x00,
            AcType::Tc => 0x40,
            AcType::Arqc => 0x80,
        }
    }

    /// Decode the type bits of a Cryptogram Information Data byte.
    pub fn from_cid(cid: u8) -> Option<AcType> {
        match cid & 0xC0 {
            0x00 => Some(AcType::Aac),
            0x40 => Some(AcType::Tc),
            0x80 => Some(AcType::Arqc),
            _ => None,
        }
    }
}

/// P1 flag requesting a CDA signature on GENERATE AC.
pub const GENERATE_AC_CDA: u8 = 0x10;

/// A parsed File Control Information template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fci {
    /// The DF Name (tag 84) the card claims to have selected.
    pub df_name: Vec<u8>,
    /// Everything in the FCI, flattened (proprietary template included).
    pub fields: TlvList,
}

fn parse_fci(data: &[u8]) -> std::result::Result<Fci, tlv::TlvError> {
    let fields = tlv::decode(data)?;
    let df_name = fields
        .value(tags::DF_NAME)
        .ok_or(tlv::TlvError::MalformedTlv)?
        .to_vec();
    Ok(Fci { df_name, fields })
}

/// Parse a SELECT response FCI without judging whose AID it is; candidate
/// discovery matches the DF name itself.
pub fn parse_candidate_fci(data: &[u8]) -> std::result::Result<Fci, tlv::TlvError> {
    parse_fci(data)
}

/// The Payment System Environment's directory handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseDirectory {
    /// SFI of the directory elementary file (tag 88, values 1-30).
    pub sfi: u8,
    /// Language Preference (5F2D), pairs of lowercase ISO 639 codes.
    pub languages: Option<String>,
    pub fci: TlvList,
}

/// One application advertised by a PSE directory record (a 61 entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// ADF Name (4F): the application's AID.
    pub aid: Vec<u8>,
    /// Application Label (50), raw common character set bytes.
    pub label: Option<Vec<u8>>,
    /// Application Preferred Name (9F12) and its code table (9F11).
    pub preferred_name: Option<Vec<u8>>,
    pub code_table: Option<u8>,
    /// Application Priority Indicator (87), low nibble 1-15.
    pub priority: Option<u8>,
}

/// Result of pulling the AFL's records off the card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Records appended to the ODA buffer.
    pub oda_records: usize,
    /// At least one ODA-flagged record was structurally invalid; offline
    /// authentication is doomed, but reading continued.
    pub oda_invalid: bool,
}

/// Response to GET PROCESSING OPTIONS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpo {
    pub aip: [u8; 2],
    pub afl: Vec<u8>,
}

/// One Application File Locator entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AflEntry {
    pub sfi: u8,
    pub first_record: u8,
    pub last_record: u8,
    /// How many records, from the first, feed offline authentication.
    pub oda_records: u8,
}

/// Parse and validate an AFL blob: groups of four bytes, SFI in 1..=30,
/// sane record ranges, ODA count within the range.
pub fn parse_afl(data: &[u8]) -> std::result::Result<Vec<AflEntry>, Fatal> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(Fatal::AflInvalid);
    }
    let mut entries = Vec::with_capacity(data.len() / 4);
    for chunk in data.chunks_exact(4) {
        let entry = AflEntry {
            sfi: chunk[0] >> 3,
            first_record: chunk[1],
            last_record: chunk[2],
            oda_records: chunk[3],
        };
        if chunk[0] & 0b0000_0111 != 0
            || entry.sfi == 0
            || entry.sfi > 30
            || entry.first_record == 0
            || entry.last_record < entry.first_record
            || entry.oda_records > entry.last_record - entry.first_record + 1
        {
            return Err(Fatal::AflInvalid);
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Response to GENERATE AC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenAc {
    /// Cryptogram Information Data (9F27).
    pub cid: u8,
    /// Application Transaction Counter (9F36).
    pub atc: [u8; 2],
    /// Application Cryptogram (9F26).
    pub cryptogram: Vec<u8>,
    /// Issuer Application Data (9F10), if present.
    pub issuer_data: Option<Vec<u8>>,
    /// Signed Dynamic Application Data (9F4B) when CDA was requested.
    pub sdad: Option<Vec<u8>>,
    /// The response data objects in card order (format 2 only); CDA hashes
    /// these, minus the SDAD itself.
    pub fields: TlvList,
}

impl GenAc {
    pub fn ac_type(&self) -> Option<AcType> {
        AcType::from_cid(self.cid)
    }
}

/// The application layer: EMV commands over a TTL.
pub struct Tal<R: CardReader> {
    ttl: Ttl<R>,
}

impl<R: CardReader> Tal<R> {
    pub fn new(reader: R) -> Self {
        Tal { ttl: Ttl::new(reader) }
    }

    pub fn from_ttl(ttl: Ttl<R>) -> Self {
        Tal { ttl }
    }

    /// Raw SELECT by DF name. `next` asks for the next occurrence (P2=02),
    /// used to enumerate partial AID matches.
    pub fn select_df(&mut self, name: &[u8], next: bool) -> std::result::Result<Rapdu, Fatal> {
        let p2 = if next { 0x02 } else { 0x00 };
        self.ttl
            .transceive(&Apdu::case4(0x00, 0xA4, 0x04, p2, name.to_vec(), 0x00))
    }

    /// SELECT an application and validate its FCI: the returned DF Name
    /// must equal the AID we asked for, byte for byte.
    pub fn select_application(&mut self, aid: &[u8]) -> Result<Fci> {
        let span = trace_span!("select_application");
        let _enter = span.enter();

        let rsp = self.select_df(aid, false)?;
        match rsp.sw {
            Sw::OK => {}
            Sw::FILE_DEACTIVATED => return Err(Soft::AppBlocked.into()),
            Sw::FILE_NOT_FOUND => return Err(Soft::AppNotFound.into()),
            sw => {
                debug!("SELECT {} refused: SW {}", hex::encode(aid), sw);
                return Err(Soft::AppSelectionFailed.into());
            }
        }
        let fci = parse_fci(&rsp.data).map_err(|e| {
            warn!("bad application FCI: {}", e);
            Soft::AppFciParseFailed
        })?;
        if fci.df_name != aid {
            warn!(
                "DF name mismatch: asked {}, card says {}",
                hex::encode(aid),
                hex::encode(&fci.df_name)
            );
            return Err(Soft::AppFciParseFailed.into());
        }
        Ok(fci)
    }

    /// SELECT the contact PSE and locate its directory file.
    pub fn read_pse(&mut self) -> Result<PseDirectory> {
        let span = trace_span!("read_pse");
        let _enter = span.enter();

        let rsp = self.select_df(PSE_DF_NAME, false)?;
        match rsp.sw {
            Sw::OK => {}
            Sw::FILE_NOT_FOUND => return Err(Soft::PseNotFound.into()),
            Sw::FILE_DEACTIVATED | Sw::AUTH_METHOD_BLOCKED => {
                return Err(Soft::PseBlocked.into())
            }
            sw => {
                debug!("SELECT PSE refused: SW {}", sw);
                return Err(Soft::PseSelectFailed.into());
            }
        }

        let fci = match tlv::decode(&rsp.data) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("bad PSE FCI: {}", e);
                return Err(Soft::PseFciParseFailed.into());
            }
        };
        let sfi = match fci.value(tags::PSE_SFI) {
            Some([sfi]) => *sfi,
            Some(_) => return Err(Soft::PseSfiInvalid.into()),
            None => return Err(Soft::PseSfiNotFound.into()),
        };
        if sfi == 0 || sfi > 30 {
            return Err(Soft::PseSfiInvalid.into());
        }
        let languages = fci
            .value(tags::LANGUAGE_PREFERENCE)
            .map(|v| String::from_utf8_lossy(v).into_owned());

        Ok(PseDirectory {
            sfi,
            languages,
            fci,
        })
    }

    /// Walk the PSE directory records (READ RECORD 1.. until "record not
    /// found") and collect every application entry.
    pub fn read_pse_entries(&mut self, dir: &PseDirectory) -> Result<Vec<DirectoryEntry>> {
        let span = trace_span!("read_pse_entries", sfi = dir.sfi);
        let _enter = span.enter();

        // The AEF holding the directory must be addressable by a short
        // READ RECORD, i.e. its SFI must be in 1..=10.
        if dir.sfi > 10 {
            return Err(Soft::PseSfiInvalid.into());
        }

        let mut entries = Vec::new();
        for record in 1..=31u8 {
            let rsp = self.read_record(dir.sfi, record)?;
            match rsp.sw {
                Sw::OK => {}
                Sw::RECORD_NOT_FOUND => break,
                sw => {
                    debug!("PSE record {} refused: SW {}", record, sw);
                    return Err(Soft::PseAefInvalid.into());
                }
            }
            entries.extend(parse_aef_record(&rsp.data)?);
        }
        Ok(entries)
    }

    /// READ RECORD with Le=0.
    pub fn read_record(&mut self, sfi: u8, record: u8) -> std::result::Result<Rapdu, Fatal> {
        self.ttl
            .transceive(&Apdu::case2(0x00, 0xB2, record, (sfi << 3) | 0x04, 0x00))
    }

    /// GET PROCESSING OPTIONS with the given PDOL data (may be empty),
    /// wrapped in the command template.
    pub fn get_processing_options(&mut self, pdol_data: &[u8]) -> Result<Gpo> {
        let span = trace_span!("get_processing_options");
        let _enter = span.enter();

        let mut body = TlvList::new();
        body.push(Field::new(tags::COMMAND_TEMPLATE, pdol_data.to_vec()));
        let rsp = self
            .ttl
            .transceive(&Apdu::case4(0x80, 0xA8, 0x00, 0x00, body.encode(), 0x00))?;
        match rsp.sw {
            Sw::OK => {}
            Sw::CONDITIONS_NOT_SATISFIED => return Err(Soft::GpoConditionsNotSatisfied.into()),
            sw => return Err(Fatal::GpoFailed(sw.as_u16()).into()),
        }

        let (rest, tag, value) =
            tlv::parse_next(&rsp.data).map_err(|_| Fatal::GpoParseFailed)?;
        if !rest.is_empty() {
            return Err(Fatal::GpoParseFailed.into());
        }
        match tag {
            // Format 1: AIP followed by the AFL, in one primitive blob.
            tags::RESPONSE_FORMAT_1 => {
                if value.len() < 2 {
                    return Err(Fatal::GpoParseFailed.into());
                }
                let (aip, afl) = value.split_at(2);
                Ok(Gpo {
                    aip: [aip[0], aip[1]],
                    afl: afl.to_vec(),
                })
            }
            // Format 2: a template with tagged AIP and AFL.
            tags::RESPONSE_FORMAT_2 => {
                let fields = tlv::decode(value).map_err(|_| Fatal::GpoParseFailed)?;
                let aip = match fields.value(tags::AIP) {
                    Some([a, b]) => [*a, *b],
                    Some(_) => return Err(Fatal::GpoParseFailed.into()),
                    None => return Err(Fatal::GpoFieldNotFound(tags::AIP).into()),
                };
                let afl = fields
                    .value(tags::AFL)
                    .ok_or(Fatal::GpoFieldNotFound(tags::AFL))?
                    .to_vec();
                Ok(Gpo { aip, afl })
            }
            _ => Err(Fatal::GpoParseFailed.into()),
        }
    }

    /// Read every record the AFL names, filing fields into `icc` and
    /// feeding ODA-flagged records to the buffer in AFL order.
    pub fn read_afl_records(
        &mut self,
        entries: &[AflEntry],
        icc: &mut TlvList,
        oda: &mut OdaBuffer,
    ) -> Result<ReadOutcome> {
        let span = trace_span!("read_afl_records");
        let _enter = span.enter();

        let mut outcome = ReadOutcome::default();
        for entry in entries {
            for record in entry.first_record..=entry.last_record {
                let rsp = self.read_record(entry.sfi, record)?;
                if rsp.sw != Sw::OK {
                    return Err(Fatal::ReadRecordFailed(rsp.sw.as_u16()).into());
                }
                let for_oda = record - entry.first_record < entry.oda_records;

                if entry.sfi <= 10 {
                    // Records in SFI 1-10 are 70 templates; the template
                    // content (without its tag and length) is what ODA
                    // hashes. Book 3, 10.3.
                    match parse_record_template(&rsp.data) {
                        Ok(content) => {
                            if for_oda {
                                oda.push_record(content);
                                outcome.oda_records += 1;
                            }
                            tlv::decode_into(&rsp.data, icc, PaddingPolicy::Reject)
                                .map_err(|_| Fatal::ReadRecordParseFailed)?;
                        }
                        Err(_) if for_oda => {
                            warn!(
                                "SFI {} record {} flagged for ODA is invalid",
                                entry.sfi, record
                            );
                            outcome.oda_invalid = true;
                        }
                        Err(_) => return Err(Fatal::ReadRecordInvalid.into()),
                    }
                } else if for_oda {
                    // Records above SFI 10 feed ODA whole and are not
                    // required to be TLV at all.
                    oda.push_record(&rsp.data);
                    outcome.oda_records += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// GET DATA for a primitive data object of the current application.
    pub fn get_data(&mut self, tag: Tag) -> Result<Vec<u8>> {
        let encoded = tag.value();
        if encoded > 0xFFFF {
            return Err(Fatal::InvalidParameter("GET DATA wants a 2-byte tag").into());
        }
        let rsp = self.ttl.transceive(&Apdu::case2(
            0x80,
            0xCA,
            (encoded >> 8) as u8,
            encoded as u8,
            0x00,
        ))?;
        match rsp.sw {
            Sw::OK => {}
            Sw::REFERENCED_DATA_NOT_FOUND | Sw::FUNCTION_NOT_SUPPORTED => {
                return Err(Soft::GetDataFailed.into())
            }
            sw => {
                debug!("GET DATA {} refused: SW {}", tag, sw);
                return Err(Soft::GetDataFailed.into());
            }
        }
        let (rest, got, value) =
            tlv::parse_next(&rsp.data).map_err(|_| Fatal::GetDataParseFailed)?;
        if got != tag || !rest.is_empty() {
            return Err(Fatal::GetDataParseFailed.into());
        }
        Ok(value.to_vec())
    }

    /// INTERNAL AUTHENTICATE; returns the Signed Dynamic Application Data.
    pub fn internal_authenticate(&mut self, ddol_data: &[u8]) -> Result<Vec<u8>> {
        let rsp = self
            .ttl
            .transceive(&Apdu::case4(0x00, 0x88, 0x00, 0x00, ddol_data.to_vec(), 0x00))?;
        if rsp.sw != Sw::OK {
            return Err(Fatal::IntAuthFailed(rsp.sw.as_u16()).into());
        }
        let (rest, tag, value) =
            tlv::parse_next(&rsp.data).map_err(|_| Fatal::IntAuthParseFailed)?;
        if !rest.is_empty() {
            return Err(Fatal::IntAuthParseFailed.into());
        }
        match tag {
            tags::RESPONSE_FORMAT_1 => Ok(value.to_vec()),
            tags::RESPONSE_FORMAT_2 => {
                let fields = tlv::decode(value).map_err(|_| Fatal::IntAuthParseFailed)?;
                fields
                    .value(tags::SIGNED_DYNAMIC_DATA)
                    .map(|v| v.to_vec())
                    .ok_or_else(|| Fatal::IntAuthFieldNotFound(tags::SIGNED_DYNAMIC_DATA).into())
            }
            _ => Err(Fatal::IntAuthParseFailed.into()),
        }
    }

    /// GENERATE AC. `p1` is the reference control parameter: an
    /// [`AcType`]'s bits, optionally OR-ed with [`GENERATE_AC_CDA`].
    pub fn generate_ac(&mut self, p1: u8, cdol_data: &[u8]) -> Result<GenAc> {
        let span = trace_span!("generate_ac", p1 = p1);
        let _enter = span.enter();

        let rsp = self
            .ttl
            .transceive(&Apdu::case4(0x80, 0xAE, p1, 0x00, cdol_data.to_vec(), 0x00))?;
        if rsp.sw != Sw::OK {
            return Err(Fatal::GenAcFailed(rsp.sw.as_u16()).into());
        }
        let (rest, tag, value) =
            tlv::parse_next(&rsp.data).map_err(|_| Fatal::GenAcParseFailed)?;
        if !rest.is_empty() {
            return Err(Fatal::GenAcParseFailed.into());
        }
        match tag {
            // Format 1: CID | ATC | AC | optional IAD, one primitive blob.
            tags::RESPONSE_FORMAT_1 => {
                if value.len() < 11 {
                    return Err(Fatal::GenAcParseFailed.into());
                }
                Ok(GenAc {
                    cid: value[0],
                    atc: [value[1], value[2]],
                    cryptogram: value[3..11].to_vec(),
                    issuer_data: (value.len() > 11).then(|| value[11..].to_vec()),
                    sdad: None,
                    fields: TlvList::new(),
                })
            }
            tags::RESPONSE_FORMAT_2 => {
                let fields = tlv::decode(value).map_err(|_| Fatal::GenAcParseFailed)?;
                let cid = match fields.value(tags::CID) {
                    Some([cid]) => *cid,
                    Some(_) => return Err(Fatal::GenAcParseFailed.into()),
                    None => return Err(Fatal::GenAcFieldNotFound(tags::CID).into()),
                };
                let atc = match fields.value(tags::ATC) {
                    Some([a, b]) => [*a, *b],
                    Some(_) => return Err(Fatal::GenAcParseFailed.into()),
                    None => return Err(Fatal::GenAcFieldNotFound(tags::ATC).into()),
                };
                let cryptogram = fields
                    .value(tags::APPLICATION_CRYPTOGRAM)
                    .ok_or(Fatal::GenAcFieldNotFound(tags::APPLICATION_CRYPTOGRAM))?
                    .to_vec();
                Ok(GenAc {
                    cid,
                    atc,
                    cryptogram,
                    issuer_data: fields.value(Tag::new(0x9F10)).map(|v| v.to_vec()),
                    sdad: fields.value(tags::SIGNED_DYNAMIC_DATA).map(|v| v.to_vec()),
                    fields,
                })
            }
            _ => Err(Fatal::GenAcParseFailed.into()),
        }
    }
}

/// A record in SFI 1-10 must be a single 70 template; returns its content.
fn parse_record_template(data: &[u8]) -> std::result::Result<&[u8], tlv::TlvError> {
    let (rest, tag, value) = tlv::parse_next(data)?;
    if tag != tags::RECORD_TEMPLATE || !rest.is_empty() {
        return Err(tlv::TlvError::MalformedTlv);
    }
    Ok(value)
}

/// Parse one PSE directory (AEF) record into its application entries.
fn parse_aef_record(data: &[u8]) -> Result<Vec<DirectoryEntry>> {
    let content = parse_record_template(data).map_err(|e| {
        warn!("AEF record is not a 70 template: {}", e);
        Soft::PseAefInvalid
    })?;

    let mut entries = Vec::new();
    for item in tlv::iter(content) {
        let (tag, value) = item.map_err(|_| Soft::PseAefParseFailed)?;
        if tag != tags::APP_TEMPLATE {
            warn!("AEF record carries unexpected field {}", tag);
            continue;
        }
        let fields = tlv::decode(value).map_err(|_| Soft::PseAefParseFailed)?;
        let aid = match fields.value(tags::ADF_NAME) {
            Some(aid) if (5..=16).contains(&aid.len()) => aid.to_vec(),
            _ => return Err(Soft::PseAefInvalid.into()),
        };
        entries.push(DirectoryEntry {
            aid,
            label: fields.value(tags::APP_LABEL).map(|v| v.to_vec()),
            preferred_name: fields.value(tags::APP_PREFERRED_NAME).map(|v| v.to_vec()),
            code_table: match fields.value(tags::ISSUER_CODE_TABLE) {
                Some([idx]) => Some(*idx),
                _ => None,
            },
            priority: match fields.value(tags::APP_PRIORITY) {
                Some([p]) => Some(*p),
                _ => None,
            },
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::ttl::testing::Script;

    fn sw(bytes: &[u8], sw: [u8; 2]) -> Vec<u8> {
        let mut v = bytes.to_vec();
        v.extend_from_slice(&sw);
        v
    }

    #[test]
    fn afl_parses_and_validates() {
        let entries = parse_afl(&[0x08, 0x01, 0x03, 0x02, 0x10, 0x01, 0x01, 0x00]).unwrap();
        assert_eq!(
            entries,
            vec![
                AflEntry { sfi: 1, first_record: 1, last_record: 3, oda_records: 2 },
                AflEntry { sfi: 2, first_record: 1, last_record: 1, oda_records: 0 },
            ]
        );

        // Not a multiple of four.
        assert_eq!(parse_afl(&[0x08, 0x01, 0x01]), Err(Fatal::AflInvalid));
        // SFI 0.
        assert_eq!(parse_afl(&[0x00, 0x01, 0x01, 0x00]), Err(Fatal::AflInvalid));
        // Low bits of the SFI byte must be zero.
        assert_eq!(parse_afl(&[0x09, 0x01, 0x01, 0x00]), Err(Fatal::AflInvalid));
        // First record zero.
        assert_eq!(parse_afl(&[0x08, 0x00, 0x01, 0x00]), Err(Fatal::AflInvalid));
        // Range backwards.
        assert_eq!(parse_afl(&[0x08, 0x03, 0x02, 0x00]), Err(Fatal::AflInvalid));
        // More ODA records than the range holds.
        assert_eq!(parse_afl(&[0x08, 0x01, 0x02, 0x03]), Err(Fatal::AflInvalid));
    }

    // PSE SELECT response from a Dutch debit card.
    const PSE_FCI: [u8; 34] = [
        0x6F, 0x20, 0x84, 0x0E, 0x31, 0x50, 0x41, 0x59, 0x2E, 0x53, 0x59, 0x53, 0x2E, 0x44, 0x44,
        0x46, 0x30, 0x31, 0xA5, 0x0E, 0x88, 0x01, 0x01, 0x5F, 0x2D, 0x04, 0x6E, 0x6C, 0x65, 0x6E,
        0x9F, 0x11, 0x01, 0x01,
    ];

    #[test]
    fn pse_walk() {
        // One AEF record with a single application, then "record not found".
        let record: Vec<u8> = vec![
            0x70, 0x1A, 0x61, 0x18, 0x4F, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10, 0x50,
            0x0A, 0x4D, 0x61, 0x65, 0x73, 0x74, 0x72, 0x6F, 0x20, 0x4E, 0x4C, 0x87, 0x01, 0x01,
        ];
        let mut select_pse = vec![0x00, 0xA4, 0x04, 0x00, 0x0E];
        select_pse.extend_from_slice(PSE_DF_NAME);
        select_pse.push(0x00);
        let mut tal = Tal::new(Script::new(vec![
            (select_pse, sw(&PSE_FCI, [0x90, 0x00])),
            (vec![0x00, 0xB2, 0x01, 0x0C, 0x00], sw(&record, [0x90, 0x00])),
            (vec![0x00, 0xB2, 0x02, 0x0C, 0x00], vec![0x6A, 0x83]),
        ]));

        let dir = tal.read_pse().expect("couldn't read PSE");
        assert_eq!(dir.sfi, 1);
        assert_eq!(dir.languages.as_deref(), Some("nlen"));

        let entries = tal.read_pse_entries(&dir).expect("couldn't walk directory");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].aid, vec![0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10]);
        assert_eq!(entries[0].label.as_deref(), Some(&b"Maestro NL"[..]));
        assert_eq!(entries[0].priority, Some(1));
    }

    #[test]
    fn pse_not_found_vs_blocked() {
        let select_pse = {
            let mut v = vec![0x00, 0xA4, 0x04, 0x00, 0x0E];
            v.extend_from_slice(PSE_DF_NAME);
            v.push(0x00);
            v
        };
        let mut tal = Tal::new(Script::new(vec![(select_pse.clone(), vec![0x6A, 0x82])]));
        assert_eq!(tal.read_pse().unwrap_err().soft(), Some(Soft::PseNotFound));

        let mut tal = Tal::new(Script::new(vec![(select_pse, vec![0x62, 0x83])]));
        assert_eq!(tal.read_pse().unwrap_err().soft(), Some(Soft::PseBlocked));
    }

    #[test]
    fn select_application_validates_df_name() {
        let aid = vec![0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10];
        // FCI echoing a different DF name.
        let fci = vec![
            0x6F, 0x0B, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x04, 0x99, 0x99, 0xA5, 0x00,
        ];
        let mut cmd = vec![0x00, 0xA4, 0x04, 0x00, 0x07];
        cmd.extend_from_slice(&aid);
        cmd.push(0x00);
        let mut tal = Tal::new(Script::new(vec![(cmd, sw(&fci, [0x90, 0x00]))]));
        assert_eq!(
            tal.select_application(&aid).unwrap_err().soft(),
            Some(Soft::AppFciParseFailed)
        );
    }

    #[test]
    fn select_application_blocked_app() {
        let aid = vec![0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10];
        let mut cmd = vec![0x00, 0xA4, 0x04, 0x00, 0x07];
        cmd.extend_from_slice(&aid);
        cmd.push(0x00);
        let mut tal = Tal::new(Script::new(vec![(cmd, vec![0x62, 0x83])]));
        assert_eq!(
            tal.select_application(&aid).unwrap_err().soft(),
            Some(Soft::AppBlocked)
        );
    }

    #[test]
    fn gpo_format_1() {
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00],
            sw(&[0x80, 0x06, 0x5C, 0x00, 0x08, 0x01, 0x01, 0x00], [0x90, 0x00]),
        )]));
        let gpo = tal.get_processing_options(&[]).unwrap();
        assert_eq!(gpo.aip, [0x5C, 0x00]);
        assert_eq!(gpo.afl, vec![0x08, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn gpo_format_2() {
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x80, 0xA8, 0x00, 0x00, 0x06, 0x83, 0x04, 0xDE, 0xAD, 0xBE, 0xEF],
            sw(
                &[0x77, 0x0A, 0x82, 0x02, 0x19, 0x80, 0x94, 0x04, 0x10, 0x02, 0x04, 0x00],
                [0x90, 0x00],
            ),
        )]));
        let gpo = tal.get_processing_options(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(gpo.aip, [0x19, 0x80]);
        assert_eq!(gpo.afl, vec![0x10, 0x02, 0x04, 0x00]);
    }

    #[test]
    fn gpo_missing_afl_is_field_not_found() {
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00],
            sw(&[0x77, 0x04, 0x82, 0x02, 0x19, 0x80], [0x90, 0x00]),
        )]));
        assert_eq!(
            tal.get_processing_options(&[]).unwrap_err(),
            Error::Fatal(Fatal::GpoFieldNotFound(tags::AFL))
        );
    }

    #[test]
    fn gpo_conditions_not_satisfied_is_soft() {
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00],
            vec![0x69, 0x85],
        )]));
        assert_eq!(
            tal.get_processing_options(&[]).unwrap_err().soft(),
            Some(Soft::GpoConditionsNotSatisfied)
        );
    }

    #[test]
    fn read_afl_records_files_fields_and_feeds_oda() {
        let rec1 = vec![0x70, 0x04, 0x5A, 0x02, 0x54, 0x13];
        let rec2 = vec![0x70, 0x05, 0x9F, 0x32, 0x01, 0x03, 0x00];
        let mut tal = Tal::new(Script::new(vec![
            (vec![0x00, 0xB2, 0x01, 0x0C, 0x00], sw(&rec1, [0x90, 0x00])),
            (vec![0x00, 0xB2, 0x02, 0x0C, 0x00], sw(&rec2, [0x90, 0x00])),
        ]));
        let entries = parse_afl(&[0x08, 0x01, 0x02, 0x01]).unwrap();
        let mut icc = TlvList::new();
        let mut oda = OdaBuffer::new();
        let outcome = tal.read_afl_records(&entries, &mut icc, &mut oda).unwrap();

        assert_eq!(outcome.oda_records, 1);
        assert!(!outcome.oda_invalid);
        // Only record 1 is ODA-flagged, and only its 70 content is hashed.
        assert_eq!(oda.as_bytes(), &[0x5A, 0x02, 0x54, 0x13]);
        assert_eq!(icc.value(tags::PAN), Some(&[0x54, 0x13][..]));
        assert_eq!(icc.value(tags::ISSUER_PK_EXPONENT), Some(&[0x03][..]));
    }

    #[test]
    fn invalid_oda_record_is_tolerated() {
        // Record 1 is garbage but ODA-flagged; record 2 is fine.
        let rec2 = vec![0x70, 0x04, 0x5A, 0x02, 0x54, 0x13];
        let mut tal = Tal::new(Script::new(vec![
            (vec![0x00, 0xB2, 0x01, 0x0C, 0x00], sw(&[0x12, 0x34], [0x90, 0x00])),
            (vec![0x00, 0xB2, 0x02, 0x0C, 0x00], sw(&rec2, [0x90, 0x00])),
        ]));
        let entries = parse_afl(&[0x08, 0x01, 0x02, 0x01]).unwrap();
        let mut icc = TlvList::new();
        let mut oda = OdaBuffer::new();
        let outcome = tal.read_afl_records(&entries, &mut icc, &mut oda).unwrap();
        assert!(outcome.oda_invalid);
        assert_eq!(oda.as_bytes(), &[] as &[u8]);
        assert_eq!(icc.value(tags::PAN), Some(&[0x54, 0x13][..]));
    }

    #[test]
    fn invalid_plain_record_is_fatal() {
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x00, 0xB2, 0x01, 0x0C, 0x00],
            sw(&[0x12, 0x34], [0x90, 0x00]),
        )]));
        let entries = parse_afl(&[0x08, 0x01, 0x01, 0x00]).unwrap();
        let mut icc = TlvList::new();
        let mut oda = OdaBuffer::new();
        assert_eq!(
            tal.read_afl_records(&entries, &mut icc, &mut oda).unwrap_err(),
            Error::Fatal(Fatal::ReadRecordInvalid)
        );
    }

    #[test]
    fn high_sfi_records_feed_oda_whole() {
        let body = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x00, 0xB2, 0x01, 0x5C, 0x00],
            sw(&body, [0x90, 0x00]),
        )]));
        let entries = parse_afl(&[0x58, 0x01, 0x01, 0x01]).unwrap();
        let mut icc = TlvList::new();
        let mut oda = OdaBuffer::new();
        let outcome = tal.read_afl_records(&entries, &mut icc, &mut oda).unwrap();
        assert_eq!(outcome.oda_records, 1);
        assert_eq!(oda.as_bytes(), &body[..]);
        assert!(icc.is_empty());
    }

    #[test]
    fn get_data_soft_failure() {
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x80, 0xCA, 0x9F, 0x13, 0x00],
            vec![0x6A, 0x88],
        )]));
        assert_eq!(
            tal.get_data(tags::LAST_ONLINE_ATC).unwrap_err().soft(),
            Some(Soft::GetDataFailed)
        );
    }

    #[test]
    fn get_data_parses_echoed_tag() {
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x80, 0xCA, 0x9F, 0x36, 0x00],
            sw(&[0x9F, 0x36, 0x02, 0x00, 0x1E], [0x90, 0x00]),
        )]));
        assert_eq!(tal.get_data(tags::ATC).unwrap(), vec![0x00, 0x1E]);
    }

    #[test]
    fn internal_authenticate_both_formats() {
        let sdad = vec![0xAA; 8];
        let mut fmt1 = vec![0x80, 0x08];
        fmt1.extend_from_slice(&sdad);
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x00, 0x88, 0x00, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF, 0x00],
            sw(&fmt1, [0x90, 0x00]),
        )]));
        assert_eq!(
            tal.internal_authenticate(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap(),
            sdad
        );

        let mut fmt2 = vec![0x77, 0x0B, 0x9F, 0x4B, 0x08];
        fmt2.extend_from_slice(&sdad);
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x00, 0x88, 0x00, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF, 0x00],
            sw(&fmt2, [0x90, 0x00]),
        )]));
        assert_eq!(
            tal.internal_authenticate(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap(),
            sdad
        );
    }

    #[test]
    fn generate_ac_format_1() {
        let rsp = [
            0x80, 0x12, 0x40, 0x00, 0x1E, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x06,
            0x01, 0x0A, 0x03, 0x60, 0x31, 0x00,
        ];
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x80, 0xAE, 0x40, 0x00, 0x02, 0xAB, 0xCD, 0x00],
            sw(&rsp, [0x90, 0x00]),
        )]));
        let ac = tal.generate_ac(AcType::Tc.p1(), &[0xAB, 0xCD]).unwrap();
        assert_eq!(ac.ac_type(), Some(AcType::Tc));
        assert_eq!(ac.atc, [0x00, 0x1E]);
        assert_eq!(ac.cryptogram, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(
            ac.issuer_data,
            Some(vec![0x06, 0x01, 0x0A, 0x03, 0x60, 0x31, 0x00])
        );
    }

    #[test]
    fn generate_ac_format_2_missing_cid() {
        let rsp = [0x77, 0x05, 0x9F, 0x36, 0x02, 0x00, 0x1E];
        let mut tal = Tal::new(Script::new(vec![(
            vec![0x80, 0xAE, 0x80, 0x00, 0x02, 0xAB, 0xCD, 0x00],
            sw(&rsp, [0x90, 0x00]),
        )]));
        assert_eq!(
            tal.generate_ac(AcType::Arqc.p1(), &[0xAB, 0xCD]).unwrap_err(),
            Error::Fatal(Fatal::GenAcFieldNotFound(tags::CID))
        );
    }
}
