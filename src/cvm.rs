//! Cardholder Verification Method list processing (EMV Book 3, 10.5).
//!
//! Capturing a PIN or a signature is the integration's job; what the
//! kernel does is parse the card's CVM List (8E), walk its rules in
//! order against the transaction conditions and the terminal's CVM
//! capabilities, and hand back the rule the integration should attempt.
//! The integration reports how the attempt went, and the CVM Results
//! (9F34) and TVR bits fall out of that.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::debug;

use crate::caps::TerminalCapabilities;
use crate::tags;
use crate::tlv::TlvList;
use crate::tvr::{self, tsi, tvr as tvr_bits};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CvmError {
    /// A CVM list is two amounts plus at least one two-byte rule.
    #[error("CVM list too short")]
    TooShort,
    /// Rules come in pairs of bytes.
    #[error("CVM list length is not amounts plus rule pairs")]
    RaggedRules,
}

/// A cardholder verification method (rule byte 1, low six bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvMethod {
    /// Fail CVM processing.
    Fail,
    PlaintextPin,
    EncipheredPinOnline,
    PlaintextPinAndSignature,
    EncipheredPinOffline,
    EncipheredPinOfflineAndSignature,
    Signature,
    NoCvmRequired,
    /// Payment-system or issuer proprietary code.
    Proprietary(u8),
    /// Reserved code we do not recognise.
    Unknown(u8),
}

impl CvMethod {
    fn from_code(code: u8) -> CvMethod {
        match code {
            0x00 => CvMethod::Fail,
            0x01 => CvMethod::PlaintextPin,
            0x02 => CvMethod::EncipheredPinOnline,
            0x03 => CvMethod::PlaintextPinAndSignature,
            0x04 => CvMethod::EncipheredPinOffline,
            0x05 => CvMethod::EncipheredPinOfflineAndSignature,
            0x1E => CvMethod::Signature,
            0x1F => CvMethod::NoCvmRequired,
            c @ 0x20..=0x2F => CvMethod::Proprietary(c),
            c => CvMethod::Unknown(c),
        }
    }

    /// Can this terminal perform the method at all?
    pub fn supported_by(self, caps: &TerminalCapabilities) -> bool {
        match self {
            CvMethod::Fail => true,
            CvMethod::PlaintextPin => caps.plaintext_pin_for_icc(),
            CvMethod::EncipheredPinOnline => caps.enciphered_pin_online(),
            CvMethod::PlaintextPinAndSignature => {
                caps.plaintext_pin_for_icc() && caps.signature()
            }
            CvMethod::EncipheredPinOffline => caps.enciphered_pin_offline(),
            CvMethod::EncipheredPinOfflineAndSignature => {
                caps.enciphered_pin_offline() && caps.signature()
            }
            CvMethod::Signature => caps.signature(),
            CvMethod::NoCvmRequired => caps.no_cvm_required(),
            CvMethod::Proprietary(_) | CvMethod::Unknown(_) => false,
        }
    }
}

/// A rule condition (rule byte 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvmCondition {
    Always,
    UnattendedCash,
    NotUnattendedCashNotManualCashNotCashback,
    IfTerminalSupports,
    ManualCash,
    PurchaseWithCashback,
    AmountUnderX,
    AmountOverX,
    AmountUnderY,
    AmountOverY,
    Other(u8),
}

impl CvmCondition {
    fn from_code(code: u8) -> CvmCondition {
        match code {
            0x00 => CvmCondition::Always,
            0x01 => CvmCondition::UnattendedCash,
            0x02 => CvmCondition::NotUnattendedCashNotManualCashNotCashback,
            0x03 => CvmCondition::IfTerminalSupports,
            0x04 => CvmCondition::ManualCash,
            0x05 => CvmCondition::PurchaseWithCashback,
            0x06 => CvmCondition::AmountUnderX,
            0x07 => CvmCondition::AmountOverX,
            0x08 => CvmCondition::AmountUnderY,
            0x09 => CvmCondition::AmountOverY,
            c => CvmCondition::Other(c),
        }
    }
}

/// One two-byte CV Rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CvRule {
    bytes: [u8; 2],
}

impl CvRule {
    pub fn new(bytes: [u8; 2]) -> Self {
        CvRule { bytes }
    }

    pub fn bytes(&self) -> [u8; 2] {
        self.bytes
    }

    pub fn method(&self) -> CvMethod {
        CvMethod::from_code(self.bytes[0] & 0x3F)
    }

    pub fn condition(&self) -> CvmCondition {
        CvmCondition::from_code(self.bytes[1])
    }

    /// Bit 7 of byte 1: on failure, apply the succeeding rule rather
    /// than failing cardholder verification outright.
    pub fn continue_on_failure(&self) -> bool {
        self.bytes[0] & 0x40 != 0
    }
}

/// A parsed CVM List: the two threshold amounts and the rules in card
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvmList {
    pub x: u32,
    pub y: u32,
    pub rules: Vec<CvRule>,
}

impl CvmList {
    pub fn parse(raw: &[u8]) -> Result<CvmList, CvmError> {
        if raw.len() < 10 {
            return Err(CvmError::TooShort);
        }
        if (raw.len() - 8) % 2 != 0 {
            return Err(CvmError::RaggedRules);
        }
        Ok(CvmList {
            x: BigEndian::read_u32(&raw[0..4]),
            y: BigEndian::read_u32(&raw[4..8]),
            rules: raw[8..]
                .chunks_exact(2)
                .map(|pair| CvRule::new([pair[0], pair[1]]))
                .collect(),
        })
    }

    /// Read and parse the CVM List off an ICC data list.
    pub fn from_icc(icc: &TlvList) -> Option<Result<CvmList, CvmError>> {
        icc.value(tags::CVM_LIST).map(CvmList::parse)
    }
}

/// The transaction-side facts a condition is judged against.
#[derive(Debug, Clone, Copy, Default)]
pub struct CvmFacts {
    /// Amount, authorised, binary.
    pub amount: u32,
    /// The transaction currency is the application currency, which is
    /// what the X/Y thresholds are denominated in.
    pub currency_matches: bool,
    pub unattended_cash: bool,
    pub manual_cash: bool,
    pub purchase_with_cashback: bool,
}

fn condition_applies(rule: &CvRule, list: &CvmList, facts: &CvmFacts) -> bool {
    match rule.condition() {
        CvmCondition::Always => true,
        CvmCondition::UnattendedCash => facts.unattended_cash,
        CvmCondition::NotUnattendedCashNotManualCashNotCashback => {
            !facts.unattended_cash && !facts.manual_cash && !facts.purchase_with_cashback
        }
        CvmCondition::IfTerminalSupports => true,
        CvmCondition::ManualCash => facts.manual_cash,
        CvmCondition::PurchaseWithCashback => facts.purchase_with_cashback,
        CvmCondition::AmountUnderX => facts.currency_matches && facts.amount < list.x,
        CvmCondition::AmountOverX => facts.currency_matches && facts.amount > list.x,
        CvmCondition::AmountUnderY => facts.currency_matches && facts.amount < list.y,
        CvmCondition::AmountOverY => facts.currency_matches && facts.amount > list.y,
        CvmCondition::Other(_) => false,
    }
}

/// What CVM processing decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvmPlan {
    /// Attempt this rule's method; on failure, consult
    /// [`CvRule::continue_on_failure`] and call [`select`] again with
    /// the rules after it.
    Attempt(CvRule),
    /// A "fail CVM processing" rule fired, or no applicable rule
    /// remained: verification has failed.
    Failed,
}

/// Walk the rules and pick the first applicable, supported one
/// (Book 3, 10.5). Unrecognised methods set TVR "unrecognised CVM" and
/// fall through when the rule allows it.
pub fn select(
    list: &CvmList,
    facts: &CvmFacts,
    caps: &TerminalCapabilities,
    terminal: &mut TlvList,
) -> CvmPlan {
    for rule in &list.rules {
        if !condition_applies(rule, list, facts) {
            continue;
        }
        let method = rule.method();
        if matches!(method, CvMethod::Proprietary(_) | CvMethod::Unknown(_)) {
            debug!("unrecognised CVM code {:02X}", rule.bytes()[0] & 0x3F);
            tvr::set_tvr(terminal, tvr_bits::UNRECOGNISED_CVM);
            if rule.continue_on_failure() {
                continue;
            }
            fail(terminal);
            return CvmPlan::Failed;
        }
        if method == CvMethod::Fail {
            fail(terminal);
            return CvmPlan::Failed;
        }
        if !method.supported_by(caps) {
            // Condition 03 explicitly gates on support; elsewhere an
            // unsupported method simply cannot be attempted.
            if rule.continue_on_failure()
                || rule.condition() == CvmCondition::IfTerminalSupports
            {
                continue;
            }
            fail(terminal);
            return CvmPlan::Failed;
        }
        return CvmPlan::Attempt(*rule);
    }
    fail(terminal);
    CvmPlan::Failed
}

fn fail(terminal: &mut TlvList) {
    tvr::set_tvr(terminal, tvr_bits::CARDHOLDER_VERIFICATION_FAILED);
    // CVM Results: "no CVM performed", failed.
    terminal.set(tags::CVM_RESULTS, vec![0x3F, 0x00, 0x01]);
    tvr::set_tsi(terminal, tsi::CARDHOLDER_VERIFICATION_PERFORMED);
}

/// How the integration's attempt at a method went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Successful,
    Failed,
    /// Performed but with no knowable outcome (signature).
    Unknown,
}

/// Record the attempt's outcome: CVM Results (9F34) and the TSI bit,
/// plus the TVR failure bit when it failed.
pub fn record_attempt(rule: CvRule, outcome: Attempt, terminal: &mut TlvList) {
    let result = match outcome {
        Attempt::Unknown => 0x00,
        Attempt::Failed => 0x01,
        Attempt::Successful => 0x02,
    };
    terminal.set(
        tags::CVM_RESULTS,
        vec![rule.bytes()[0], rule.bytes()[1], result],
    );
    if outcome == Attempt::Failed {
        tvr::set_tvr(terminal, tvr_bits::CARDHOLDER_VERIFICATION_FAILED);
    }
    tvr::set_tsi(terminal, tsi::CARDHOLDER_VERIFICATION_PERFORMED);
}
