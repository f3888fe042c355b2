//! Terminal Transport Layer: APDU exchange over a reader callback.
//!
//! The reader is a single transmit/receive callback; everything hardware-
//! flavoured (PCSC, serial, test fakes) lives behind [`CardReader`]. On top
//! of it this layer speaks ISO 7816-4: it encodes case 1-4 C-APDUs, splits
//! the status word off R-APDUs, fetches continuation data on `61 xx` with
//! GET RESPONSE, and re-issues the command with the corrected length on
//! `6C xx`. Procedure-byte juggling below that (T=0 TPDU mapping) is the
//! reader's problem.

use std::fmt;

use thiserror::Error;
use tracing::{trace, trace_span, warn};

use crate::errors::Fatal;

/// Default R-APDU payload capacity, and the largest Le expressible in a
/// short-form APDU.
pub const RX_CAP: usize = 256;

/// Hardware-level failure. Always fatal: the session cannot continue when
/// the reader stops talking to us.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error("no card present")]
    NoCard,
    #[error("card removed mid-session")]
    Removed,
    #[error("exchange timed out")]
    Timeout,
    #[error("response shorter than a status word")]
    ShortResponse,
    #[error("transport: {0}")]
    Transport(String),
}

/// The one suspension point of the whole library (see the concurrency
/// notes in the crate docs): a raw APDU exchange.
///
/// Implementations return the R-APDU including its trailing SW1 SW2, at
/// most `rx_cap + 2` bytes. Closures of the right shape implement this
/// directly, which is what the tests use.
pub trait CardReader {
    fn transceive(&mut self, tx: &[u8], rx_cap: usize) -> Result<Vec<u8>, ReaderError>;
}

impl<F> CardReader for F
where
    F: FnMut(&[u8], usize) -> Result<Vec<u8>, ReaderError>,
{
    fn transceive(&mut self, tx: &[u8], rx_cap: usize) -> Result<Vec<u8>, ReaderError> {
        self(tx, rx_cap)
    }
}

/// A status word, kept as its two raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sw(pub u8, pub u8);

impl Sw {
    pub const OK: Sw = Sw(0x90, 0x00);
    /// "Selected file deactivated" - a blocked application.
    pub const FILE_DEACTIVATED: Sw = Sw(0x62, 0x83);
    /// "Authentication method blocked".
    pub const AUTH_METHOD_BLOCKED: Sw = Sw(0x69, 0x83);
    /// "Conditions of use not satisfied".
    pub const CONDITIONS_NOT_SATISFIED: Sw = Sw(0x69, 0x85);
    /// "Function not supported" - for SELECT, a blocked card.
    pub const FUNCTION_NOT_SUPPORTED: Sw = Sw(0x6A, 0x81);
    /// "File not found".
    pub const FILE_NOT_FOUND: Sw = Sw(0x6A, 0x82);
    /// "Record not found".
    pub const RECORD_NOT_FOUND: Sw = Sw(0x6A, 0x83);
    /// "Referenced data not found".
    pub const REFERENCED_DATA_NOT_FOUND: Sw = Sw(0x6A, 0x88);
    /// Proprietary "card blocked" some schemes return to SELECT.
    pub const CARD_BLOCKED_PROPRIETARY: Sw = Sw(0x93, 0x03);

    pub fn as_u16(self) -> u16 {
        u16::from_be_bytes([self.0, self.1])
    }

    pub fn is_ok(self) -> bool {
        self == Sw::OK
    }

    /// `61 xx`: xx more response bytes are waiting for GET RESPONSE.
    pub fn bytes_remaining(self) -> Option<u8> {
        (self.0 == 0x61).then_some(self.1)
    }

    /// `6C xx`: wrong Le, retry the exact command with Le=xx.
    pub fn wrong_le(self) -> Option<u8> {
        (self.0 == 0x6C).then_some(self.1)
    }
}

impl fmt::Display for Sw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0, self.1)
    }
}

/// A command APDU. `le` is the short-form expected length, with 0 encoding
/// the maximum of 256; `None` means no response data is expected (case 1/3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u8>,
}

impl Apdu {
    pub fn case1(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Apdu { cla, ins, p1, p2, data: Vec::new(), le: None }
    }

    pub fn case2(cla: u8, ins: u8, p1: u8, p2: u8, le: u8) -> Self {
        Apdu { cla, ins, p1, p2, data: Vec::new(), le: Some(le) }
    }

    pub fn case3<T: Into<Vec<u8>>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Apdu { cla, ins, p1, p2, data: data.into(), le: None }
    }

    pub fn case4<T: Into<Vec<u8>>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T, le: u8) -> Self {
        Apdu { cla, ins, p1, p2, data: data.into(), le: Some(le) }
    }

    /// Serialize to wire format (short encoding).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            debug_assert!(self.data.len() <= 255);
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            out.push(le);
        }
        out
    }
}

/// A response APDU, status word split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rapdu {
    pub data: Vec<u8>,
    pub sw: Sw,
}

/// The transport layer proper. Strictly synchronous: one command at a
/// time, suspending only in the reader callback.
pub struct Ttl<R: CardReader> {
    reader: R,
    rx_cap: usize,
}

/// Paranoia bound on 61xx/6Cxx loops; a conformant card converges in two.
const MAX_HOPS: usize = 16;

impl<R: CardReader> Ttl<R> {
    pub fn new(reader: R) -> Self {
        Ttl { reader, rx_cap: RX_CAP }
    }

    pub fn with_rx_cap(reader: R, rx_cap: usize) -> Self {
        Ttl { reader, rx_cap }
    }

    pub fn into_reader(self) -> R {
        self.reader
    }

    fn exchange_raw(&mut self, tx: &[u8]) -> Result<Rapdu, Fatal> {
        trace!(">> {}", hex::encode(tx));
        let rx = self.reader.transceive(tx, self.rx_cap).map_err(Fatal::Reader)?;
        trace!("<< {}", hex::encode(&rx));
        if rx.len() < 2 {
            return Err(Fatal::Reader(ReaderError::ShortResponse));
        }
        let (data, sw) = rx.split_at(rx.len() - 2);
        Ok(Rapdu {
            data: data.to_vec(),
            sw: Sw(sw[0], sw[1]),
        })
    }

    /// Send one command, following `6C xx` re-issues and draining `61 xx`
    /// chains with GET RESPONSE. Returns the assembled response with the
    /// final status word; non-chaining status words are propagated to the
    /// caller, not judged here - except the SELECT responses that mean the
    /// whole card is blocked, which nothing above us can recover from.
    pub fn transceive(&mut self, apdu: &Apdu) -> Result<Rapdu, Fatal> {
        let span = trace_span!("transceive", ins = apdu.ins);
        let _enter = span.enter();

        let mut rsp = self.exchange_raw(&apdu.encode())?;
        let mut hops = 0;

        while let Some(le) = rsp.sw.wrong_le() {
            hops += 1;
            if hops > MAX_HOPS {
                warn!("card keeps changing its mind about Le");
                return Err(Fatal::Internal("6C re-issue loop"));
            }
            let mut retry = apdu.clone();
            retry.le = Some(le);
            rsp = self.exchange_raw(&retry.encode())?;
        }

        let mut assembled = rsp.data;
        while let Some(le) = rsp.sw.bytes_remaining() {
            hops += 1;
            if hops > MAX_HOPS {
                warn!("GET RESPONSE chain does not converge");
                return Err(Fatal::Internal("61 chaining loop"));
            }
            let get_response = Apdu::case2(0x00, 0xC0, 0x00, 0x00, le);
            rsp = self.exchange_raw(&get_response.encode())?;
            assembled.extend_from_slice(&rsp.data);
        }

        if apdu.ins == 0xA4
            && (rsp.sw == Sw::FUNCTION_NOT_SUPPORTED || rsp.sw == Sw::CARD_BLOCKED_PROPRIETARY)
        {
            return Err(Fatal::CardBlocked);
        }

        Ok(Rapdu {
            data: assembled,
            sw: rsp.sw,
        })
    }
}

/// A scripted reader for exchange-level tests: a list of expected commands
/// and canned responses, checked in order.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct Script {
        exchanges: Vec<(Vec<u8>, Vec<u8>)>,
        at: usize,
    }

    impl Script {
        pub fn new(exchanges: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            Script { exchanges, at: 0 }
        }

        pub fn drained(&self) -> bool {
            self.at == self.exchanges.len()
        }
    }

    impl CardReader for Script {
        fn transceive(&mut self, tx: &[u8], _rx_cap: usize) -> Result<Vec<u8>, ReaderError> {
            let (expect, reply) = self
                .exchanges
                .get(self.at)
                .unwrap_or_else(|| panic!("unscripted exchange: {}", hex::encode(tx)));
            assert_eq!(
                hex::encode(tx),
                hex::encode(expect),
                "unexpected command at step {}",
                self.at
            );
            self.at += 1;
            Ok(reply.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Script;
    use super::*;

    #[test]
    fn apdu_encoding_cases() {
        // Case 1: header only.
        assert_eq!(
            Apdu::case1(0x00, 0xA4, 0x12, 0x34).encode(),
            vec![0x00, 0xA4, 0x12, 0x34]
        );
        // Case 2: header + Le.
        assert_eq!(
            Apdu::case2(0x00, 0xB2, 0x01, 0x0C, 0x00).encode(),
            vec![0x00, 0xB2, 0x01, 0x0C, 0x00]
        );
        // Case 3: header + Lc + data.
        assert_eq!(
            Apdu::case3(0x00, 0xA4, 0x12, 0x34, vec![0x56, 0x78]).encode(),
            vec![0x00, 0xA4, 0x12, 0x34, 0x02, 0x56, 0x78]
        );
        // Case 4: header + Lc + data + Le.
        assert_eq!(
            Apdu::case4(0x00, 0xA4, 0x04, 0x00, vec![0x56, 0x78], 0x00).encode(),
            vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0x56, 0x78, 0x00]
        );
    }

    #[test]
    fn sw_predicates() {
        assert!(Sw(0x90, 0x00).is_ok());
        assert_eq!(Sw(0x61, 0x1C).bytes_remaining(), Some(0x1C));
        assert_eq!(Sw(0x6C, 0x2A).wrong_le(), Some(0x2A));
        assert_eq!(Sw(0x90, 0x00).bytes_remaining(), None);
        assert_eq!(Sw(0x6A, 0x83).as_u16(), 0x6A83);
        assert_eq!(format!("{}", Sw(0x6A, 0x83)), "6A83");
    }

    #[test]
    fn get_response_chaining() {
        let mut ttl = Ttl::new(Script::new(vec![
            (
                vec![0x00, 0xCA, 0x9F, 0x36, 0x00],
                vec![0x61, 0x05],
            ),
            (
                vec![0x00, 0xC0, 0x00, 0x00, 0x05],
                vec![0x9F, 0x36, 0x02, 0x00, 0x1E, 0x90, 0x00],
            ),
        ]));
        let rsp = ttl
            .transceive(&Apdu::case2(0x00, 0xCA, 0x9F, 0x36, 0x00))
            .unwrap();
        assert_eq!(rsp.sw, Sw::OK);
        assert_eq!(rsp.data, vec![0x9F, 0x36, 0x02, 0x00, 0x1E]);
    }

    #[test]
    fn wrong_le_reissues() {
        let mut ttl = Ttl::new(Script::new(vec![
            (
                vec![0x00, 0xB2, 0x01, 0x0C, 0x00],
                vec![0x6C, 0x03],
            ),
            (
                vec![0x00, 0xB2, 0x01, 0x0C, 0x03],
                vec![0xAA, 0xBB, 0xCC, 0x90, 0x00],
            ),
        ]));
        let rsp = ttl
            .transceive(&Apdu::case2(0x00, 0xB2, 0x01, 0x0C, 0x00))
            .unwrap();
        assert_eq!(rsp.data, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(rsp.sw, Sw::OK);
    }

    #[test]
    fn blocked_card_on_select_is_fatal() {
        for sw in [[0x6A, 0x81], [0x93, 0x03]] {
            let mut ttl = Ttl::new(Script::new(vec![(
                vec![0x00, 0xA4, 0x04, 0x00, 0x01, 0xAA, 0x00],
                sw.to_vec(),
            )]));
            let err = ttl
                .transceive(&Apdu::case4(0x00, 0xA4, 0x04, 0x00, vec![0xAA], 0x00))
                .unwrap_err();
            assert_eq!(err, Fatal::CardBlocked);
        }
    }

    #[test]
    fn blocked_statuses_outside_select_pass_through() {
        let mut ttl = Ttl::new(Script::new(vec![(
            vec![0x00, 0xB2, 0x01, 0x0C, 0x00],
            vec![0x6A, 0x81],
        )]));
        let rsp = ttl
            .transceive(&Apdu::case2(0x00, 0xB2, 0x01, 0x0C, 0x00))
            .unwrap();
        assert_eq!(rsp.sw, Sw::FUNCTION_NOT_SUPPORTED);
    }

    #[test]
    fn reader_errors_are_fatal() {
        fn broken(_tx: &[u8], _cap: usize) -> Result<Vec<u8>, ReaderError> {
            Err(ReaderError::Timeout)
        }
        let mut ttl = Ttl::new(broken);
        let err = ttl.transceive(&Apdu::case1(0x00, 0xA4, 0x00, 0x00)).unwrap_err();
        assert_eq!(err, Fatal::Reader(ReaderError::Timeout));
    }

    #[test]
    fn short_response_is_a_reader_failure() {
        fn stub(_tx: &[u8], _cap: usize) -> Result<Vec<u8>, ReaderError> {
            Ok(vec![0x90])
        }
        let mut ttl = Ttl::new(stub);
        let err = ttl.transceive(&Apdu::case1(0x00, 0xA4, 0x00, 0x00)).unwrap_err();
        assert_eq!(err, Fatal::Reader(ReaderError::ShortResponse));
    }
}
