//! Error taxonomy for the terminal kernel.
//!
//! EMV Book 4 distinguishes between conditions that terminate the card
//! session and conditions under which the session may proceed (possibly
//! along a different path). We keep the two apart as separate enums:
//! [`Fatal`] aborts the transaction and requires a reader reset, [`Soft`]
//! is reported to the caller so the selection/transaction state machines
//! can decide the next step.

use thiserror::Error;

use crate::tlv::Tag;
use crate::ttl::ReaderError;

/// Fatal outcomes. The card session is dead; reset the reader.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fatal {
    #[error("internal error: {0}")]
    Internal(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("reader failure: {0}")]
    Reader(#[from] ReaderError),

    /// The card (or the selected application's DF) is blocked.
    #[error("card blocked")]
    CardBlocked,

    /// The Application File Locator is structurally invalid.
    #[error("malformed AFL")]
    AflInvalid,

    /// A terminal-side data object a command needs is not configured.
    #[error("terminal data missing: {0}")]
    TerminalDataMissing(Tag),

    #[error("GET PROCESSING OPTIONS refused: SW {0:04X}")]
    GpoFailed(u16),
    #[error("GET PROCESSING OPTIONS response malformed")]
    GpoParseFailed,
    #[error("GET PROCESSING OPTIONS response is missing {0}")]
    GpoFieldNotFound(Tag),

    #[error("READ RECORD refused: SW {0:04X}")]
    ReadRecordFailed(u16),
    #[error("READ RECORD returned an invalid record")]
    ReadRecordInvalid,
    #[error("READ RECORD response malformed")]
    ReadRecordParseFailed,

    #[error("GET DATA response malformed")]
    GetDataParseFailed,

    #[error("INTERNAL AUTHENTICATE refused: SW {0:04X}")]
    IntAuthFailed(u16),
    #[error("INTERNAL AUTHENTICATE response malformed")]
    IntAuthParseFailed,
    #[error("INTERNAL AUTHENTICATE response is missing {0}")]
    IntAuthFieldNotFound(Tag),

    #[error("GENERATE AC refused: SW {0:04X}")]
    GenAcFailed(u16),
    #[error("GENERATE AC response malformed")]
    GenAcParseFailed,
    #[error("GENERATE AC response is missing {0}")]
    GenAcFieldNotFound(Tag),
}

/// Continuable outcomes. The session survives; the state machine picks the
/// next step.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Soft {
    #[error("no payment system environment on this card")]
    PseNotFound,
    #[error("payment system environment is blocked")]
    PseBlocked,
    #[error("payment system environment could not be selected")]
    PseSelectFailed,
    #[error("payment system environment FCI malformed")]
    PseFciParseFailed,
    #[error("payment system environment FCI carries no directory SFI")]
    PseSfiNotFound,
    #[error("payment system environment directory SFI out of range")]
    PseSfiInvalid,
    #[error("payment system environment directory record malformed")]
    PseAefParseFailed,
    #[error("payment system environment directory record invalid")]
    PseAefInvalid,

    #[error("no mutually supported application")]
    AppNotFound,
    #[error("application blocked")]
    AppBlocked,
    #[error("application could not be selected")]
    AppSelectionFailed,
    #[error("application FCI malformed")]
    AppFciParseFailed,

    #[error("GET PROCESSING OPTIONS: conditions of use not satisfied")]
    GpoConditionsNotSatisfied,

    #[error("a record flagged for offline authentication is invalid")]
    OdaRecordInvalid,

    #[error("GET DATA: requested object not available")]
    GetDataFailed,

    #[error("no offline authentication method supported by both sides")]
    NoSupportedMethod,
    #[error("ICC data required for offline authentication is missing")]
    IccDataMissing,
    #[error("static data authentication failed")]
    SdaFailed,
    #[error("dynamic data authentication failed")]
    DdaFailed,
    #[error("combined data authentication failed")]
    CdaFailed,
}

/// Either failure category, for operations that can produce both.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Fatal(#[from] Fatal),
    #[error(transparent)]
    Soft(#[from] Soft),
}

impl Error {
    /// Does this error terminate the card session?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// The continuable kind, if this is one.
    pub fn soft(&self) -> Option<Soft> {
        match self {
            Error::Soft(s) => Some(*s),
            Error::Fatal(_) => None,
        }
    }
}

impl From<ReaderError> for Error {
    fn from(e: ReaderError) -> Self {
        Error::Fatal(Fatal::Reader(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_and_soft_are_distinguishable() {
        let hard: Error = Fatal::CardBlocked.into();
        let soft: Error = Soft::SdaFailed.into();
        assert!(hard.is_fatal());
        assert!(!soft.is_fatal());
        assert_eq!(soft.soft(), Some(Soft::SdaFailed));
        assert_eq!(hard.soft(), None);
    }

    #[test]
    fn reader_errors_are_fatal() {
        let err: Error = ReaderError::NoCard.into();
        assert!(err.is_fatal());
    }
}
