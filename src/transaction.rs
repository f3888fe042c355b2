//! The transaction state machine: one EMV context from application
//! selection through GENERATE AC.
//!
//! The context owns the four TLV lists of the data model (terminal
//! config, transaction parameters, ICC data, terminal outputs), the TAL,
//! the crypto provider and the CA key registry. The caller populates
//! config and parameters, then drives the phases in order:
//!
//! ```text
//! Idle -> AppSelected -> ProcessingOptions -> ReadingAppData
//!      -> OdaPerformed -> CardholderVerif -> RiskMgmt
//!      -> AcGeneration -> Done
//! ```
//!
//! Continuable failures leave the machine in the phase they were raised
//! from (or the next one, where EMV says processing carries on); a
//! fatal error means the card session is over and the context should be
//! cleared. The whole thing is single-threaded and synchronous - the one
//! suspension point is the reader callback, and cancellation between
//! exchanges is [`EmvContext::clear`].

use chrono::NaiveDate;
use tracing::{debug, trace_span, warn};

use crate::crypto::{CaKeyDb, Crypto, PublicKey};
use crate::errors::{Fatal, Result, Soft};
use crate::format;
use crate::oda::{self, Method, OdaBuffer};
use crate::restrict;
use crate::risk::{self, TxLogEntry};
use crate::select::{ApplicationSelection, CandidateList, Outcome, SupportedAid};
use crate::tags;
use crate::tal::{parse_afl, AcType, AflEntry, GenAc, ReadOutcome, Tal, GENERATE_AC_CDA};
use crate::tlv::dol::Dol;
use crate::tlv::{Field, TlvList};
use crate::ttl::CardReader;
use crate::tvr::{self, tsi, tvr as tvr_bits};

/// Where in the transaction flow a context is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AppSelected,
    ProcessingOptions,
    ReadingAppData,
    OdaPerformed,
    CardholderVerif,
    RiskMgmt,
    AcGeneration,
    Done,
}

/// An EMV transaction context. Exclusively owned by one logical caller
/// for the lifetime of a transaction.
pub struct EmvContext<R: CardReader, C: Crypto> {
    tal: Tal<R>,
    crypto: C,
    ca_keys: CaKeyDb,

    /// Terminal configuration (9F33, 9F1A, 9F1B, supported AIDs, ...).
    pub config: TlvList,
    /// Transaction parameters (9F02, 81, 9A, 9C, 9F37, ...).
    pub params: TlvList,
    /// Data read off the card.
    pub icc: TlvList,
    /// Terminal outputs: TVR (95) and TSI (9B) live here.
    pub terminal: TlvList,

    selection: ApplicationSelection,
    phase: Phase,
    oda: OdaBuffer,
    aid: Vec<u8>,
    aip: Option<[u8; 2]>,
    afl: Vec<AflEntry>,
    oda_record_invalid: bool,
    oda_method: Option<Method>,
    icc_pk: Option<PublicKey>,
    /// PDOL then CDOL data, accumulated for the CDA transaction hash.
    tx_dol_data: Vec<u8>,
    first_ac: Option<AcType>,
}

impl<R: CardReader, C: Crypto> EmvContext<R, C> {
    pub fn new(reader: R, crypto: C, ca_keys: CaKeyDb) -> Self {
        EmvContext {
            tal: Tal::new(reader),
            crypto,
            ca_keys,
            config: TlvList::new(),
            params: TlvList::new(),
            icc: TlvList::new(),
            terminal: TlvList::new(),
            selection: ApplicationSelection::new(),
            phase: Phase::Idle,
            oda: OdaBuffer::new(),
            aid: Vec::new(),
            aip: None,
            afl: Vec::new(),
            oda_record_invalid: false,
            oda_method: None,
            icc_pk: None,
            tx_dol_data: Vec::new(),
            first_ac: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn selected_aid(&self) -> &[u8] {
        &self.aid
    }

    pub fn aip(&self) -> Option<[u8; 2]> {
        self.aip
    }

    pub fn oda_method(&self) -> Option<Method> {
        self.oda_method
    }

    pub fn candidates(&self) -> &CandidateList {
        self.selection.candidates()
    }

    /// Abort: release everything owned by the running transaction and
    /// return to `Idle`. The terminal configuration survives.
    pub fn clear(&mut self) {
        self.params.clear();
        self.icc.clear();
        self.terminal.clear();
        self.oda.clear();
        self.selection.terminate();
        self.aid.clear();
        self.aip = None;
        self.afl.clear();
        self.oda_record_invalid = false;
        self.oda_method = None;
        self.icc_pk = None;
        self.tx_dol_data.clear();
        self.first_ac = None;
        self.phase = Phase::Idle;
    }

    fn require_phase(&self, expected: Phase) -> Result<()> {
        if self.phase != expected {
            warn!("operation out of order: in {:?}, wanted {:?}", self.phase, expected);
            return Err(Fatal::InvalidParameter("operation out of phase order").into());
        }
        Ok(())
    }

    /// Discover the card's applications (PSE, then AID probing) using the
    /// supported AIDs from the terminal config.
    pub fn build_candidates(&mut self) -> Result<&CandidateList> {
        self.require_phase(Phase::Idle)?;
        let supported = SupportedAid::from_config(&self.config);
        if supported.is_empty() {
            return Err(Fatal::TerminalDataMissing(tags::AID_TERMINAL).into());
        }
        self.selection.build(&mut self.tal, &supported)
    }

    /// Must the cardholder confirm the application choice?
    pub fn needs_cardholder_selection(&self) -> bool {
        self.selection.needs_confirmation()
    }

    /// Select a candidate by index. On success the FCI fields join the
    /// ICC list, the AID lands in the parameters as 9F06, and TVR/TSI are
    /// zeroed for the new transaction.
    pub fn select_candidate(&mut self, index: usize) -> Outcome {
        let outcome = self.selection.select(&mut self.tal, index);
        if let Outcome::Selected(fci) = &outcome {
            self.aid = fci.df_name.clone();
            for field in fci.fields.iter() {
                self.icc.push(field.clone());
            }
            self.params.set(tags::AID_TERMINAL, self.aid.clone());
            self.terminal.set(tags::TVR, vec![0u8; tvr::TVR_LEN]);
            self.terminal.set(tags::TSI, vec![0u8; tvr::TSI_LEN]);
            self.phase = Phase::AppSelected;
        }
        outcome
    }

    /// Secondary DOL source: terminal outputs first (TVR, TSI), then the
    /// static configuration. The primary source is always the parameters.
    fn dol_secondary(&self) -> TlvList {
        self.terminal
            .iter()
            .chain(self.config.iter())
            .cloned()
            .collect()
    }

    fn ensure_unpredictable_number(&mut self) -> [u8; 4] {
        if let Some(value) = self.params.value(tags::UNPREDICTABLE_NUMBER) {
            if let Ok(un) = <[u8; 4]>::try_from(value) {
                return un;
            }
        }
        let un = self.crypto.unpredictable_number();
        self.params.set(tags::UNPREDICTABLE_NUMBER, un.to_vec());
        un
    }

    fn transaction_date(&self) -> Result<NaiveDate> {
        let raw = self
            .params
            .value(tags::TRANSACTION_DATE)
            .ok_or(Fatal::TerminalDataMissing(tags::TRANSACTION_DATE))?;
        format::date_from_n(raw)
            .map_err(|_| Fatal::InvalidParameter("transaction date is not YYMMDD").into())
    }

    /// Initiate application processing: build the PDOL data and GET
    /// PROCESSING OPTIONS (Book 3, 10.1).
    pub fn initiate(&mut self) -> Result<()> {
        let span = trace_span!("initiate");
        let _enter = span.enter();

        self.require_phase(Phase::AppSelected)?;
        self.ensure_unpredictable_number();

        let pdol_data = match self.icc.value(tags::PDOL) {
            Some(raw) => {
                let raw = raw.to_vec();
                let secondary = self.dol_secondary();
                Dol::new(&raw)
                    .build(&self.params, Some(&secondary))
                    .map_err(|_| Fatal::GpoParseFailed)?
            }
            None => Vec::new(),
        };

        let gpo = self.tal.get_processing_options(&pdol_data)?;
        self.afl = parse_afl(&gpo.afl)?;
        self.icc.set(tags::AIP, gpo.aip.to_vec());
        self.icc.set(tags::AFL, gpo.afl.clone());
        self.aip = Some(gpo.aip);
        self.tx_dol_data = pdol_data;
        self.phase = Phase::ProcessingOptions;
        Ok(())
    }

    /// Read the application data the AFL names and assemble the ODA
    /// buffer (Book 3, 10.2), then run the processing restriction
    /// checks over what arrived.
    pub fn read_app_data(&mut self) -> Result<ReadOutcome> {
        self.require_phase(Phase::ProcessingOptions)?;
        let entries = self.afl.clone();
        let outcome = self
            .tal
            .read_afl_records(&entries, &mut self.icc, &mut self.oda)?;
        self.oda_record_invalid = outcome.oda_invalid;
        restrict::perform(&self.config, &self.params, &self.icc, &mut self.terminal);
        self.phase = Phase::ReadingAppData;
        Ok(outcome)
    }

    fn icc_required(&mut self, tag: crate::tlv::Tag) -> Result<Vec<u8>> {
        match self.icc.value(tag) {
            Some(value) => Ok(value.to_vec()),
            None => {
                debug!("{} missing for offline authentication", tag);
                tvr::set_tvr(&mut self.terminal, tvr_bits::ICC_DATA_MISSING);
                tvr::set_tvr(&mut self.terminal, tvr_bits::OFFLINE_AUTH_NOT_PERFORMED);
                Err(Soft::IccDataMissing.into())
            }
        }
    }

    /// Record a failed verification for `method`: the TVR failure bit,
    /// plus TSI "offline data authentication performed" - it was
    /// performed, it just did not end well.
    fn oda_failed(&mut self, method: Method) -> crate::errors::Error {
        let (bit, soft) = match method {
            Method::Sda => (tvr_bits::SDA_FAILED, Soft::SdaFailed),
            Method::Dda => (tvr_bits::DDA_FAILED, Soft::DdaFailed),
            Method::Cda => (tvr_bits::CDA_FAILED, Soft::CdaFailed),
        };
        tvr::set_tvr(&mut self.terminal, bit);
        tvr::set_tsi(&mut self.terminal, tsi::OFFLINE_AUTH_PERFORMED);
        soft.into()
    }

    /// Offline data authentication (Book 2). Picks the strongest method
    /// both sides support and runs its certificate chain; for CDA the
    /// signature itself arrives with GENERATE AC, so this step stops
    /// after recovering the ICC key.
    pub fn authenticate(&mut self) -> Result<Method> {
        let span = trace_span!("authenticate");
        let _enter = span.enter();

        self.require_phase(Phase::ReadingAppData)?;
        // ODA failures are continuable: the machine moves on regardless.
        self.phase = Phase::OdaPerformed;

        let aip = self.aip.ok_or(Fatal::Internal("AIP lost between phases"))?;
        let caps = self
            .config
            .value(tags::TERMINAL_CAPABILITIES)
            .ok_or(Fatal::TerminalDataMissing(tags::TERMINAL_CAPABILITIES))?
            .to_vec();
        let Some(method) = oda::select_method(aip, &caps) else {
            debug!("no offline authentication method in common");
            tvr::set_tvr(&mut self.terminal, tvr_bits::OFFLINE_AUTH_NOT_PERFORMED);
            return Err(Soft::NoSupportedMethod.into());
        };

        let now = self.transaction_date()?;
        let pan = self.icc_required(tags::PAN)?;
        let index = self.icc_required(tags::CA_PK_INDEX)?;
        let cert = self.icc_required(tags::ISSUER_PK_CERT)?;
        let exponent = self.icc_required(tags::ISSUER_PK_EXPONENT)?;
        let remainder = self
            .icc
            .value(tags::ISSUER_PK_REMAINDER)
            .map(|v| v.to_vec())
            .unwrap_or_default();

        let rid: [u8; 5] = self.aid[..]
            .get(..5)
            .and_then(|r| r.try_into().ok())
            .ok_or(Fatal::Internal("selected AID shorter than a RID"))?;
        let index = match index[..] {
            [index] => index,
            _ => {
                tvr::set_tvr(&mut self.terminal, tvr_bits::ICC_DATA_MISSING);
                tvr::set_tvr(&mut self.terminal, tvr_bits::OFFLINE_AUTH_NOT_PERFORMED);
                return Err(Soft::IccDataMissing.into());
            }
        };
        let Some(ca) = self.ca_keys.lookup(rid, index).cloned() else {
            debug!("no CA key for RID {} index {:02X}", hex::encode(rid), index);
            tvr::set_tvr(&mut self.terminal, tvr_bits::OFFLINE_AUTH_NOT_PERFORMED);
            return Err(Soft::IccDataMissing.into());
        };

        let static_data = match oda::static_data(&self.oda, aip, &self.icc, method) {
            Ok(data) => data,
            Err(e) => {
                warn!("static data assembly failed: {}", e);
                return Err(self.oda_failed(method));
            }
        };
        if self.oda_record_invalid {
            debug!("ODA-flagged records were invalid, failing {:?}", method);
            return Err(self.oda_failed(method));
        }

        let issuer = match oda::recover_issuer_key(
            &self.crypto,
            &ca,
            &cert,
            &remainder,
            &exponent,
            &pan,
            now,
        ) {
            Ok(key) => key,
            Err(e) => {
                warn!("issuer certificate rejected: {}", e);
                return Err(self.oda_failed(method));
            }
        };

        match method {
            Method::Sda => {
                let ssad = self.icc_required(tags::SIGNED_STATIC_DATA)?;
                match oda::verify_ssad(&self.crypto, &issuer.key, &ssad, &static_data) {
                    Ok(dac) => {
                        self.icc.push(Field::new(tags::DATA_AUTH_CODE, dac.to_vec()));
                        tvr::clear_tvr(&mut self.terminal, tvr_bits::SDA_FAILED);
                        tvr::set_tsi(&mut self.terminal, tsi::OFFLINE_AUTH_PERFORMED);
                        self.oda_method = Some(Method::Sda);
                        Ok(Method::Sda)
                    }
                    Err(e) => {
                        warn!("SDA rejected: {}", e);
                        Err(self.oda_failed(method))
                    }
                }
            }
            Method::Dda | Method::Cda => {
                let icc_cert = self.icc_required(tags::ICC_PK_CERT)?;
                let icc_exponent = self.icc_required(tags::ICC_PK_EXPONENT)?;
                let icc_remainder = self
                    .icc
                    .value(tags::ICC_PK_REMAINDER)
                    .map(|v| v.to_vec())
                    .unwrap_or_default();
                let icc_key = match oda::recover_icc_key(
                    &self.crypto,
                    &issuer.key,
                    &icc_cert,
                    &icc_remainder,
                    &icc_exponent,
                    &static_data,
                    &pan,
                    now,
                ) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!("ICC certificate rejected: {}", e);
                        return Err(self.oda_failed(method));
                    }
                };

                if method == Method::Cda {
                    // The signature comes with GENERATE AC; keep the key.
                    self.icc_pk = Some(icc_key.key);
                    self.oda_method = Some(Method::Cda);
                    return Ok(Method::Cda);
                }

                self.ensure_unpredictable_number();
                let ddol_raw = self
                    .icc
                    .value(tags::DDOL)
                    .map(|v| v.to_vec())
                    // Default DDOL: the unpredictable number alone.
                    .unwrap_or_else(|| vec![0x9F, 0x37, 0x04]);
                let secondary = self.dol_secondary();
                let ddol_data = match Dol::new(&ddol_raw).build(&self.params, Some(&secondary)) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("DDOL unusable: {}", e);
                        return Err(self.oda_failed(method));
                    }
                };
                let sdad = self.tal.internal_authenticate(&ddol_data)?;
                match oda::verify_dda(&self.crypto, &icc_key.key, &sdad, &ddol_data) {
                    Ok(number) => {
                        self.icc.push(Field::new(tags::ICC_DYNAMIC_NUMBER, number));
                        tvr::clear_tvr(&mut self.terminal, tvr_bits::DDA_FAILED);
                        tvr::set_tsi(&mut self.terminal, tsi::OFFLINE_AUTH_PERFORMED);
                        self.oda_method = Some(Method::Dda);
                        Ok(Method::Dda)
                    }
                    Err(e) => {
                        warn!("DDA rejected: {}", e);
                        Err(self.oda_failed(method))
                    }
                }
            }
        }
    }

    /// Record the outcome of cardholder verification (performed outside
    /// this kernel) and move on.
    pub fn note_cardholder_verification(&mut self, performed: bool) -> Result<()> {
        self.require_phase(Phase::OdaPerformed)?;
        if performed {
            tvr::set_tsi(&mut self.terminal, tsi::CARDHOLDER_VERIFICATION_PERFORMED);
        }
        self.phase = Phase::CardholderVerif;
        Ok(())
    }

    /// Terminal risk management (Book 3, 10.6).
    pub fn risk_management(&mut self, log: Option<&[TxLogEntry]>) -> Result<()> {
        self.require_phase(Phase::CardholderVerif)?;
        risk::perform(
            &mut self.tal,
            &self.config,
            &self.params,
            &self.icc,
            &mut self.terminal,
            log,
        )?;
        self.phase = Phase::RiskMgmt;
        Ok(())
    }

    /// First GENERATE AC, with CDOL1. Requests CDA when that is the
    /// selected method and the request is not an outright decline.
    pub fn generate_first_ac(&mut self, requested: AcType) -> Result<GenAc> {
        self.require_phase(Phase::RiskMgmt)?;
        let cdol = self
            .icc
            .value(tags::CDOL1)
            .ok_or(Fatal::TerminalDataMissing(tags::CDOL1))?
            .to_vec();
        self.issue_ac(requested, &cdol, true)
    }

    /// Second GENERATE AC, with CDOL2; only valid after a first ARQC.
    pub fn generate_second_ac(&mut self, requested: AcType) -> Result<GenAc> {
        self.require_phase(Phase::AcGeneration)?;
        if self.first_ac != Some(AcType::Arqc) {
            return Err(Fatal::InvalidParameter("second cryptogram needs a first ARQC").into());
        }
        if requested == AcType::Arqc {
            return Err(Fatal::InvalidParameter("second cryptogram cannot be ARQC").into());
        }
        let cdol = self
            .icc
            .value(tags::CDOL2)
            .ok_or(Fatal::TerminalDataMissing(tags::CDOL2))?
            .to_vec();
        self.issue_ac(requested, &cdol, false)
    }

    fn issue_ac(&mut self, requested: AcType, cdol: &[u8], first: bool) -> Result<GenAc> {
        let span = trace_span!("issue_ac", first = first);
        let _enter = span.enter();

        let secondary = self.dol_secondary();
        let cdol_data = Dol::new(cdol)
            .build(&self.params, Some(&secondary))
            .map_err(|_| Fatal::GenAcParseFailed)?;

        let with_cda =
            self.oda_method == Some(Method::Cda) && self.icc_pk.is_some() && requested != AcType::Aac;
        let p1 = requested.p1() | if with_cda { GENERATE_AC_CDA } else { 0 };

        let genac = self.tal.generate_ac(p1, &cdol_data)?;
        if genac.ac_type().is_none() {
            return Err(Fatal::GenAcParseFailed.into());
        }
        self.tx_dol_data.extend_from_slice(&cdol_data);

        if with_cda {
            match self.verify_cda_response(&genac) {
                Ok(number) => {
                    self.icc.push(Field::new(tags::ICC_DYNAMIC_NUMBER, number));
                    tvr::clear_tvr(&mut self.terminal, tvr_bits::CDA_FAILED);
                    tvr::set_tsi(&mut self.terminal, tsi::OFFLINE_AUTH_PERFORMED);
                }
                Err(e) => {
                    warn!("CDA rejected: {}", e);
                    tvr::set_tvr(&mut self.terminal, tvr_bits::CDA_FAILED);
                    tvr::set_tsi(&mut self.terminal, tsi::OFFLINE_AUTH_PERFORMED);
                    self.advance_after_ac(&genac, first);
                    return Err(Soft::CdaFailed.into());
                }
            }
        }

        self.advance_after_ac(&genac, first);
        Ok(genac)
    }

    fn advance_after_ac(&mut self, genac: &GenAc, first: bool) {
        if first {
            self.first_ac = genac.ac_type();
            self.phase = if self.first_ac == Some(AcType::Arqc) {
                Phase::AcGeneration
            } else {
                Phase::Done
            };
        } else {
            self.phase = Phase::Done;
        }
    }

    fn verify_cda_response(&self, genac: &GenAc) -> std::result::Result<Vec<u8>, oda::VerifyError> {
        let icc_pk = self.icc_pk.as_ref().ok_or(oda::VerifyError::BadDynamicData)?;
        let sdad = genac.sdad.as_ref().ok_or(oda::VerifyError::BadDynamicData)?;
        let un = self
            .params
            .value(tags::UNPREDICTABLE_NUMBER)
            .ok_or(oda::VerifyError::BadDynamicData)?;

        // Transaction data: PDOL and CDOL values, then the response data
        // objects except the signature itself, in card order.
        let mut tx_data = self.tx_dol_data.clone();
        let without_sdad: TlvList = genac
            .fields
            .iter()
            .filter(|f| f.tag != tags::SIGNED_DYNAMIC_DATA)
            .cloned()
            .collect();
        tx_data.extend_from_slice(&without_sdad.encode());

        oda::verify_cda(&self.crypto, icc_pk, sdad, un, genac.cid, &tx_data)
            .map(|v| v.icc_dynamic_number)
    }
}
