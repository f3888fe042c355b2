//! Processing restrictions (EMV Book 3, 10.4): application version,
//! usage control and date checks.
//!
//! Pure bookkeeping over data already on hand - no card traffic. Every
//! check that fails sets its TVR bit and nothing else; the action
//! analysis downstream decides what the bits mean for the transaction.

use tracing::{debug, trace_span};

use crate::caps;
use crate::format;
use crate::tags;
use crate::tlv::TlvList;
use crate::tvr::{self, tvr as tvr_bits};

// Application Usage Control byte 1 (Book 3, Annex C2).
const AUC_DOMESTIC_CASH: u8 = 0x80;
const AUC_INTERNATIONAL_CASH: u8 = 0x40;
const AUC_DOMESTIC_GOODS: u8 = 0x20;
const AUC_INTERNATIONAL_GOODS: u8 = 0x10;
const AUC_DOMESTIC_SERVICES: u8 = 0x08;
const AUC_INTERNATIONAL_SERVICES: u8 = 0x04;
const AUC_AT_ATMS: u8 = 0x02;
const AUC_OTHER_THAN_ATMS: u8 = 0x01;
// Byte 2.
const AUC_DOMESTIC_CASHBACK: u8 = 0x80;
const AUC_INTERNATIONAL_CASHBACK: u8 = 0x40;

/// Run the processing restriction checks, setting TVR bits in the
/// terminal list.
pub fn perform(config: &TlvList, params: &TlvList, icc: &TlvList, terminal: &mut TlvList) {
    let span = trace_span!("processing_restrictions");
    let _enter = span.enter();

    application_version(config, icc, terminal);
    application_dates(params, icc, terminal);
    usage_control(config, params, icc, terminal);
}

/// Book 3, 10.4.1: compare the card's Application Version Number with
/// the terminal's. A card without one passes by definition.
fn application_version(config: &TlvList, icc: &TlvList, terminal: &mut TlvList) {
    let (Some(card), Some(ours)) = (
        icc.value(tags::APP_VERSION_ICC),
        config.value(tags::APP_VERSION_TERMINAL),
    ) else {
        return;
    };
    if card != ours {
        debug!(
            "application versions differ: card {}, terminal {}",
            hex::encode(card),
            hex::encode(ours)
        );
        tvr::set_tvr(terminal, tvr_bits::APP_VERSIONS_DIFFER);
    }
}

/// Book 3, 10.4.3: the transaction date against the application
/// effective (5F25) and expiration (5F24) dates.
fn application_dates(params: &TlvList, icc: &TlvList, terminal: &mut TlvList) {
    let Some(today) = params
        .value(tags::TRANSACTION_DATE)
        .and_then(|raw| format::date_from_n(raw).ok())
    else {
        return;
    };

    if let Some(effective) = icc
        .value(tags::EFFECTIVE_DATE)
        .and_then(|raw| format::date_from_n(raw).ok())
    {
        if today < effective {
            tvr::set_tvr(terminal, tvr_bits::APP_NOT_YET_EFFECTIVE);
        }
    }
    if let Some(expiry) = icc
        .value(tags::EXPIRY_DATE)
        .and_then(|raw| format::date_from_n(raw).ok())
    {
        if today > expiry {
            tvr::set_tvr(terminal, tvr_bits::EXPIRED_APPLICATION);
        }
    }
}

/// Book 3, 10.4.2: Application Usage Control against the transaction
/// type and the domestic/international split.
fn usage_control(config: &TlvList, params: &TlvList, icc: &TlvList, terminal: &mut TlvList) {
    let Some(auc) = icc.value(tags::APP_USAGE_CONTROL) else {
        return;
    };
    let (auc1, auc2) = match *auc {
        [a] => (a, 0),
        [a, b] => (a, b),
        _ => return,
    };

    // The ATM split applies whenever the AUC is present.
    let atm_ok = if caps::is_atm(config) {
        auc1 & AUC_AT_ATMS != 0
    } else {
        auc1 & AUC_OTHER_THAN_ATMS != 0
    };
    if !atm_ok {
        tvr::set_tvr(terminal, tvr_bits::SERVICE_NOT_ALLOWED);
        return;
    }

    // The domestic/international split needs both country codes.
    let (Some(issuer), Some(ours)) = (
        icc.value(tags::ISSUER_COUNTRY),
        config.value(tags::TERMINAL_COUNTRY),
    ) else {
        return;
    };
    let domestic = issuer == ours;

    let tx_type = params
        .value(tags::TRANSACTION_TYPE)
        .and_then(|v| v.first().copied())
        .unwrap_or(0x00);
    let allowed = match tx_type {
        // Cash advance or disbursement.
        0x01 | 0x17 => {
            auc1 & if domestic { AUC_DOMESTIC_CASH } else { AUC_INTERNATIONAL_CASH } != 0
        }
        // Purchase with cashback: both the purchase and the cashback
        // sides must be allowed.
        0x09 => {
            auc1 & if domestic { AUC_DOMESTIC_GOODS } else { AUC_INTERNATIONAL_GOODS } != 0
                && auc2
                    & if domestic { AUC_DOMESTIC_CASHBACK } else { AUC_INTERNATIONAL_CASHBACK }
                    != 0
        }
        // Purchase of goods or services.
        _ => {
            auc1 & if domestic {
                AUC_DOMESTIC_GOODS | AUC_DOMESTIC_SERVICES
            } else {
                AUC_INTERNATIONAL_GOODS | AUC_INTERNATIONAL_SERVICES
            } != 0
        }
    };
    if !allowed {
        debug!("usage control forbids this transaction type here");
        tvr::set_tvr(terminal, tvr_bits::SERVICE_NOT_ALLOWED);
    }
}
