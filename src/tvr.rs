//! Terminal Verification Results and Transaction Status Information bits.
//!
//! Positions are from EMV Book 3, Annex C. TVR is five bytes of "what went
//! wrong", TSI two bytes of "what was done"; both live in the terminal
//! data list (tags 95 and 9B) and every state machine step records its
//! outcome here before returning, so a caller looking at the list always
//! sees a consistent story.

use crate::tags;
use crate::tlv::TlvList;

/// One flag: a byte index into the field and a mask within that byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bit {
    pub byte: usize,
    pub mask: u8,
}

pub const TVR_LEN: usize = 5;
pub const TSI_LEN: usize = 2;

pub mod tvr {
    use super::Bit;

    // Byte 1
    pub const OFFLINE_AUTH_NOT_PERFORMED: Bit = Bit { byte: 0, mask: 0x80 };
    pub const SDA_FAILED: Bit = Bit { byte: 0, mask: 0x40 };
    pub const ICC_DATA_MISSING: Bit = Bit { byte: 0, mask: 0x20 };
    pub const CARD_ON_EXCEPTION_FILE: Bit = Bit { byte: 0, mask: 0x10 };
    pub const DDA_FAILED: Bit = Bit { byte: 0, mask: 0x08 };
    pub const CDA_FAILED: Bit = Bit { byte: 0, mask: 0x04 };

    // Byte 2
    pub const APP_VERSIONS_DIFFER: Bit = Bit { byte: 1, mask: 0x80 };
    pub const EXPIRED_APPLICATION: Bit = Bit { byte: 1, mask: 0x40 };
    pub const APP_NOT_YET_EFFECTIVE: Bit = Bit { byte: 1, mask: 0x20 };
    pub const SERVICE_NOT_ALLOWED: Bit = Bit { byte: 1, mask: 0x10 };
    pub const NEW_CARD: Bit = Bit { byte: 1, mask: 0x08 };

    // Byte 3
    pub const CARDHOLDER_VERIFICATION_FAILED: Bit = Bit { byte: 2, mask: 0x80 };
    pub const UNRECOGNISED_CVM: Bit = Bit { byte: 2, mask: 0x40 };
    pub const PIN_TRY_LIMIT_EXCEEDED: Bit = Bit { byte: 2, mask: 0x20 };
    pub const PIN_PAD_UNAVAILABLE: Bit = Bit { byte: 2, mask: 0x10 };
    pub const PIN_NOT_ENTERED: Bit = Bit { byte: 2, mask: 0x08 };
    pub const ONLINE_PIN_ENTERED: Bit = Bit { byte: 2, mask: 0x04 };

    // Byte 4
    pub const FLOOR_LIMIT_EXCEEDED: Bit = Bit { byte: 3, mask: 0x80 };
    pub const LOWER_OFFLINE_LIMIT_EXCEEDED: Bit = Bit { byte: 3, mask: 0x40 };
    pub const UPPER_OFFLINE_LIMIT_EXCEEDED: Bit = Bit { byte: 3, mask: 0x20 };
    pub const SELECTED_RANDOMLY_ONLINE: Bit = Bit { byte: 3, mask: 0x10 };
    pub const MERCHANT_FORCED_ONLINE: Bit = Bit { byte: 3, mask: 0x08 };

    // Byte 5
    pub const DEFAULT_TDOL_USED: Bit = Bit { byte: 4, mask: 0x80 };
    pub const ISSUER_AUTH_FAILED: Bit = Bit { byte: 4, mask: 0x40 };
    pub const SCRIPT_FAILED_BEFORE_AC: Bit = Bit { byte: 4, mask: 0x20 };
    pub const SCRIPT_FAILED_AFTER_AC: Bit = Bit { byte: 4, mask: 0x10 };
}

pub mod tsi {
    use super::Bit;

    pub const OFFLINE_AUTH_PERFORMED: Bit = Bit { byte: 0, mask: 0x80 };
    pub const CARDHOLDER_VERIFICATION_PERFORMED: Bit = Bit { byte: 0, mask: 0x40 };
    pub const CARD_RISK_MANAGEMENT_PERFORMED: Bit = Bit { byte: 0, mask: 0x20 };
    pub const ISSUER_AUTH_PERFORMED: Bit = Bit { byte: 0, mask: 0x10 };
    pub const TERMINAL_RISK_MANAGEMENT_PERFORMED: Bit = Bit { byte: 0, mask: 0x08 };
    pub const SCRIPT_PROCESSING_PERFORMED: Bit = Bit { byte: 0, mask: 0x04 };
}

fn field_mut<'a>(
    list: &'a mut TlvList,
    tag: crate::tlv::Tag,
    len: usize,
) -> &'a mut Vec<u8> {
    let field = list.get_or_insert_mut(tag, vec![0u8; len]);
    if field.value.len() != len {
        field.value.resize(len, 0);
    }
    &mut field.value
}

/// Set a TVR bit in the terminal list, creating a zeroed TVR if missing.
pub fn set_tvr(terminal: &mut TlvList, bit: Bit) {
    field_mut(terminal, tags::TVR, TVR_LEN)[bit.byte] |= bit.mask;
}

/// Clear a TVR bit.
pub fn clear_tvr(terminal: &mut TlvList, bit: Bit) {
    field_mut(terminal, tags::TVR, TVR_LEN)[bit.byte] &= !bit.mask;
}

pub fn tvr_is_set(terminal: &TlvList, bit: Bit) -> bool {
    terminal
        .value(tags::TVR)
        .and_then(|v| v.get(bit.byte))
        .map(|b| b & bit.mask != 0)
        .unwrap_or(false)
}

/// Set a TSI bit in the terminal list, creating a zeroed TSI if missing.
pub fn set_tsi(terminal: &mut TlvList, bit: Bit) {
    field_mut(terminal, tags::TSI, TSI_LEN)[bit.byte] |= bit.mask;
}

pub fn tsi_is_set(terminal: &TlvList, bit: Bit) -> bool {
    terminal
        .value(tags::TSI)
        .and_then(|v| v.get(bit.byte))
        .map(|b| b & bit.mask != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_land_in_the_right_bytes() {
        let mut terminal = TlvList::new();
        set_tvr(&mut terminal, tvr::FLOOR_LIMIT_EXCEEDED);
        set_tvr(&mut terminal, tvr::SDA_FAILED);
        assert_eq!(
            terminal.value(tags::TVR),
            Some(&[0x40, 0x00, 0x00, 0x80, 0x00][..])
        );
        assert!(tvr_is_set(&terminal, tvr::FLOOR_LIMIT_EXCEEDED));
        assert!(!tvr_is_set(&terminal, tvr::NEW_CARD));

        clear_tvr(&mut terminal, tvr::SDA_FAILED);
        assert!(!tvr_is_set(&terminal, tvr::SDA_FAILED));

        set_tsi(&mut terminal, tsi::TERMINAL_RISK_MANAGEMENT_PERFORMED);
        assert_eq!(terminal.value(tags::TSI), Some(&[0x08, 0x00][..]));
    }

    #[test]
    fn existing_fields_are_updated_in_place() {
        let mut terminal = TlvList::new();
        terminal.set(tags::TVR, vec![0x00, 0x00, 0x00, 0x00, 0x00]);
        set_tvr(&mut terminal, tvr::NEW_CARD);
        assert_eq!(
            terminal.value(tags::TVR),
            Some(&[0x00, 0x08, 0x00, 0x00, 0x00][..])
        );
        // Only one TVR field, mutated in place.
        assert_eq!(terminal.len(), 1);
    }
}
