//! Terminal risk management: floor limit, velocity checking and new-card
//! detection (EMV Book 3, 10.6).
//!
//! Everything here talks in TVR bits; the only card traffic is the pair
//! of GET DATA commands for the ATC registers. The transaction log is
//! supplied by the integration - this kernel holds no storage - as a
//! plain slice of past approvals.

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace_span};

use crate::errors::{Error, Fatal, Result};
use crate::tags;
use crate::tal::Tal;
use crate::tlv::TlvList;
use crate::ttl::CardReader;
use crate::tvr::{self, tsi, tvr as tvr_bits};

/// A Last Online ATC of zero marks a card that has never been online;
/// with an ATC at or below this it is reported as brand new.
const NEW_CARD_ATC_LIMIT: u64 = 2;

/// One past transaction, as the integration logged it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLogEntry {
    /// PAN, right-padded with 0xFF to ten bytes.
    pub pan: [u8; 10],
    /// Application PAN sequence number, if the card carried one.
    pub sequence: Option<u8>,
    /// Transaction date, "n 6" YYMMDD.
    pub date: [u8; 3],
    /// Amount, authorised, binary.
    pub amount: u32,
}

impl TxLogEntry {
    /// Does this entry belong to the given application PAN (tag 5A value,
    /// up to ten bytes)?
    pub fn matches_pan(&self, pan: &[u8]) -> bool {
        if pan.len() > 10 {
            return false;
        }
        let mut padded = [0xFFu8; 10];
        padded[..pan.len()].copy_from_slice(pan);
        self.pan == padded
    }
}

fn read_amount(value: &[u8]) -> Option<u32> {
    (value.len() == 4).then(|| BigEndian::read_u32(value))
}

fn read_counter(value: &[u8]) -> Option<u64> {
    (1..=4).contains(&value.len()).then(|| BigEndian::read_uint(value, value.len()))
}

/// Run terminal risk management for the current transaction. Sets the
/// relevant TVR bits and, on the way out, TSI "terminal risk management
/// was performed".
pub fn perform<R: CardReader>(
    tal: &mut Tal<R>,
    config: &TlvList,
    params: &TlvList,
    icc: &TlvList,
    terminal: &mut TlvList,
    log: Option<&[TxLogEntry]>,
) -> Result<()> {
    let span = trace_span!("risk_management");
    let _enter = span.enter();

    floor_limit(config, params, icc, terminal, log)?;
    velocity(tal, icc, terminal)?;

    tvr::set_tsi(terminal, tsi::TERMINAL_RISK_MANAGEMENT_PERFORMED);
    Ok(())
}

/// Floor limit check (Book 3, 10.6.1): the transaction exceeds the floor
/// limit outright, or together with the logged amounts for the same PAN.
fn floor_limit(
    config: &TlvList,
    params: &TlvList,
    icc: &TlvList,
    terminal: &mut TlvList,
    log: Option<&[TxLogEntry]>,
) -> Result<()> {
    let floor = config
        .value(tags::TERMINAL_FLOOR_LIMIT)
        .and_then(read_amount)
        .ok_or(Fatal::TerminalDataMissing(tags::TERMINAL_FLOOR_LIMIT))?;
    let amount = params
        .value(tags::AMOUNT_BINARY)
        .and_then(read_amount)
        .ok_or(Fatal::TerminalDataMissing(tags::AMOUNT_BINARY))?;

    let logged: u64 = match (log, icc.value(tags::PAN)) {
        (Some(entries), Some(pan)) => entries
            .iter()
            .filter(|e| e.matches_pan(pan))
            .map(|e| e.amount as u64)
            .sum(),
        _ => 0,
    };

    if amount as u64 > floor as u64 || logged + amount as u64 > floor as u64 {
        debug!(
            "floor limit {} exceeded (amount {}, logged {})",
            floor, amount, logged
        );
        tvr::set_tvr(terminal, tvr_bits::FLOOR_LIMIT_EXCEEDED);
    }
    Ok(())
}

/// Velocity checking (Book 3, 10.6.3), performed when the card carries
/// both consecutive-offline limits. The ATC registers come from GET DATA;
/// when the card cannot produce them, both limits count as exceeded.
fn velocity<R: CardReader>(tal: &mut Tal<R>, icc: &TlvList, terminal: &mut TlvList) -> Result<()> {
    let lower = icc.value(tags::LOWER_CONSECUTIVE_LIMIT).and_then(read_counter);
    let upper = icc.value(tags::UPPER_CONSECUTIVE_LIMIT).and_then(read_counter);
    let (Some(lower), Some(upper)) = (lower, upper) else {
        return Ok(());
    };

    let atc = fetch_counter(tal, tags::ATC)?;
    let last_online = fetch_counter(tal, tags::LAST_ONLINE_ATC)?;
    let (Some(atc), Some(last_online)) = (atc, last_online) else {
        debug!("ATC registers unavailable, velocity limits count as exceeded");
        tvr::set_tvr(terminal, tvr_bits::LOWER_OFFLINE_LIMIT_EXCEEDED);
        tvr::set_tvr(terminal, tvr_bits::UPPER_OFFLINE_LIMIT_EXCEEDED);
        return Ok(());
    };

    let consecutive = atc.saturating_sub(last_online);
    if consecutive > lower {
        tvr::set_tvr(terminal, tvr_bits::LOWER_OFFLINE_LIMIT_EXCEEDED);
        if consecutive > upper {
            tvr::set_tvr(terminal, tvr_bits::UPPER_OFFLINE_LIMIT_EXCEEDED);
        }
    }

    if last_online == 0 && atc <= NEW_CARD_ATC_LIMIT {
        tvr::set_tvr(terminal, tvr_bits::NEW_CARD);
    }
    Ok(())
}

/// GET DATA for a counter; a continuable "not available" becomes `None`.
fn fetch_counter<R: CardReader>(
    tal: &mut Tal<R>,
    tag: crate::tlv::Tag,
) -> Result<Option<u64>> {
    match tal.get_data(tag) {
        Ok(value) => Ok(read_counter(&value)),
        Err(Error::Soft(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::Field;
    use crate::ttl::testing::Script;

    const PAN: [u8; 8] = [0x54, 0x13, 0x33, 0x00, 0x89, 0x00, 0x01, 0x23];

    fn entry(pan: &[u8], amount: u32) -> TxLogEntry {
        let mut padded = [0xFFu8; 10];
        padded[..pan.len()].copy_from_slice(pan);
        TxLogEntry {
            pan: padded,
            sequence: None,
            date: [0x26, 0x07, 0x15],
            amount,
        }
    }

    fn lists(floor: u32, amount: u32) -> (TlvList, TlvList, TlvList, TlvList) {
        let mut config = TlvList::new();
        config.push(Field::new(tags::TERMINAL_FLOOR_LIMIT, floor.to_be_bytes().to_vec()));
        let mut params = TlvList::new();
        params.push(Field::new(tags::AMOUNT_BINARY, amount.to_be_bytes().to_vec()));
        let mut icc = TlvList::new();
        icc.push(Field::new(tags::PAN, PAN.to_vec()));
        (config, params, icc, TlvList::new())
    }

    #[test]
    fn floor_limit_via_transaction_log() {
        // Floor 100.00, amount 50.00: under the limit alone, over it
        // together with the logged approvals for the same PAN.
        let (config, params, icc, mut terminal) = lists(0x2710, 0x1388);
        let log = [
            entry(&PAN, 0x9999),
            entry(&PAN, 0x1234),
            entry(&PAN, 0x1234),
            entry(&[0x99; 8], 0xFFFF_0000), // someone else's card
        ];
        let mut tal = Tal::new(Script::new(vec![]));
        perform(&mut tal, &config, &params, &icc, &mut terminal, Some(&log)).unwrap();

        assert!(tvr::tvr_is_set(&terminal, tvr_bits::FLOOR_LIMIT_EXCEEDED));
        assert!(tvr::tsi_is_set(&terminal, tsi::TERMINAL_RISK_MANAGEMENT_PERFORMED));
    }

    #[test]
    fn amount_under_floor_without_history_passes() {
        let (config, params, icc, mut terminal) = lists(0x2710, 0x1388);
        let mut tal = Tal::new(Script::new(vec![]));
        perform(&mut tal, &config, &params, &icc, &mut terminal, None).unwrap();
        assert!(!tvr::tvr_is_set(&terminal, tvr_bits::FLOOR_LIMIT_EXCEEDED));
        assert!(tvr::tsi_is_set(&terminal, tsi::TERMINAL_RISK_MANAGEMENT_PERFORMED));
    }

    #[test]
    fn amount_over_floor_alone_trips() {
        let (config, params, icc, mut terminal) = lists(0x1000, 0x1001);
        let mut tal = Tal::new(Script::new(vec![]));
        perform(&mut tal, &config, &params, &icc, &mut terminal, None).unwrap();
        assert!(tvr::tvr_is_set(&terminal, tvr_bits::FLOOR_LIMIT_EXCEEDED));
    }

    #[test]
    fn missing_floor_limit_is_fatal() {
        let (_, params, icc, mut terminal) = lists(0, 0);
        let config = TlvList::new();
        let mut tal = Tal::new(Script::new(vec![]));
        let err = perform(&mut tal, &config, &params, &icc, &mut terminal, None).unwrap_err();
        assert_eq!(
            err,
            Error::Fatal(Fatal::TerminalDataMissing(tags::TERMINAL_FLOOR_LIMIT))
        );
    }

    fn with_limits(icc: &mut TlvList, lower: u8, upper: u8) {
        icc.push(Field::new(tags::LOWER_CONSECUTIVE_LIMIT, vec![lower]));
        icc.push(Field::new(tags::UPPER_CONSECUTIVE_LIMIT, vec![upper]));
    }

    #[test]
    fn velocity_exceeds_both_limits() {
        let (config, params, mut icc, mut terminal) = lists(0x2710, 0x0001);
        with_limits(&mut icc, 2, 5);
        let mut tal = Tal::new(Script::new(vec![
            (
                vec![0x80, 0xCA, 0x9F, 0x36, 0x00],
                vec![0x9F, 0x36, 0x02, 0x00, 0x14, 0x90, 0x00], // ATC 20
            ),
            (
                vec![0x80, 0xCA, 0x9F, 0x13, 0x00],
                vec![0x9F, 0x13, 0x02, 0x00, 0x0A, 0x90, 0x00], // last online 10
            ),
        ]));
        perform(&mut tal, &config, &params, &icc, &mut terminal, None).unwrap();
        assert!(tvr::tvr_is_set(&terminal, tvr_bits::LOWER_OFFLINE_LIMIT_EXCEEDED));
        assert!(tvr::tvr_is_set(&terminal, tvr_bits::UPPER_OFFLINE_LIMIT_EXCEEDED));
        assert!(!tvr::tvr_is_set(&terminal, tvr_bits::NEW_CARD));
    }

    #[test]
    fn velocity_between_limits_sets_lower_only() {
        let (config, params, mut icc, mut terminal) = lists(0x2710, 0x0001);
        with_limits(&mut icc, 2, 15);
        let mut tal = Tal::new(Script::new(vec![
            (
                vec![0x80, 0xCA, 0x9F, 0x36, 0x00],
                vec![0x9F, 0x36, 0x02, 0x00, 0x14, 0x90, 0x00],
            ),
            (
                vec![0x80, 0xCA, 0x9F, 0x13, 0x00],
                vec![0x9F, 0x13, 0x02, 0x00, 0x0A, 0x90, 0x00],
            ),
        ]));
        perform(&mut tal, &config, &params, &icc, &mut terminal, None).unwrap();
        assert!(tvr::tvr_is_set(&terminal, tvr_bits::LOWER_OFFLINE_LIMIT_EXCEEDED));
        assert!(!tvr::tvr_is_set(&terminal, tvr_bits::UPPER_OFFLINE_LIMIT_EXCEEDED));
    }

    #[test]
    fn unavailable_atc_counts_as_exceeded() {
        let (config, params, mut icc, mut terminal) = lists(0x2710, 0x0001);
        with_limits(&mut icc, 2, 5);
        let mut tal = Tal::new(Script::new(vec![
            (vec![0x80, 0xCA, 0x9F, 0x36, 0x00], vec![0x6A, 0x88]),
            (vec![0x80, 0xCA, 0x9F, 0x13, 0x00], vec![0x6A, 0x88]),
        ]));
        perform(&mut tal, &config, &params, &icc, &mut terminal, None).unwrap();
        assert!(tvr::tvr_is_set(&terminal, tvr_bits::LOWER_OFFLINE_LIMIT_EXCEEDED));
        assert!(tvr::tvr_is_set(&terminal, tvr_bits::UPPER_OFFLINE_LIMIT_EXCEEDED));
    }

    #[test]
    fn new_card_detected() {
        let (config, params, mut icc, mut terminal) = lists(0x2710, 0x0001);
        with_limits(&mut icc, 2, 5);
        let mut tal = Tal::new(Script::new(vec![
            (
                vec![0x80, 0xCA, 0x9F, 0x36, 0x00],
                vec![0x9F, 0x36, 0x02, 0x00, 0x01, 0x90, 0x00], // ATC 1
            ),
            (
                vec![0x80, 0xCA, 0x9F, 0x13, 0x00],
                vec![0x9F, 0x13, 0x02, 0x00, 0x00, 0x90, 0x00], // never online
            ),
        ]));
        perform(&mut tal, &config, &params, &icc, &mut terminal, None).unwrap();
        assert!(tvr::tvr_is_set(&terminal, tvr_bits::NEW_CARD));
        assert!(!tvr::tvr_is_set(&terminal, tvr_bits::LOWER_OFFLINE_LIMIT_EXCEEDED));
    }

    #[test]
    fn cards_without_limits_skip_velocity() {
        let (config, params, icc, mut terminal) = lists(0x2710, 0x0001);
        // No GET DATA exchanges scripted: issuing one would panic.
        let mut tal = Tal::new(Script::new(vec![]));
        perform(&mut tal, &config, &params, &icc, &mut terminal, None).unwrap();
        assert!(!tvr::tvr_is_set(&terminal, tvr_bits::LOWER_OFFLINE_LIMIT_EXCEEDED));
    }

    #[test]
    fn log_pan_matching_pads_with_ff() {
        let e = entry(&PAN, 1);
        assert!(e.matches_pan(&PAN));
        assert!(!e.matches_pan(&PAN[..7]));
        assert!(!e.matches_pan(&[0x99; 8]));
    }
}
