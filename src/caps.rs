//! Typed views over the Terminal Capabilities (9F33) and terminal type,
//! per EMV Book 4, Annex A.

use crate::tags;
use crate::tlv::TlvList;

/// The three capability bytes of tag 9F33: card data input, CVM
/// capability, security capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalCapabilities {
    bytes: [u8; 3],
}

impl TerminalCapabilities {
    pub fn new(bytes: [u8; 3]) -> Self {
        TerminalCapabilities { bytes }
    }

    /// Read 9F33 from a terminal config list.
    pub fn from_config(config: &TlvList) -> Option<Self> {
        match config.value(tags::TERMINAL_CAPABILITIES) {
            Some(&[a, b, c]) => Some(TerminalCapabilities::new([a, b, c])),
            _ => None,
        }
    }

    pub fn bytes(&self) -> [u8; 3] {
        self.bytes
    }

    // Byte 1: card data input capability.

    pub fn manual_key_entry(&self) -> bool {
        self.bytes[0] & 0x80 != 0
    }

    pub fn magnetic_stripe(&self) -> bool {
        self.bytes[0] & 0x40 != 0
    }

    pub fn icc_with_contacts(&self) -> bool {
        self.bytes[0] & 0x20 != 0
    }

    // Byte 2: CVM capability.

    pub fn plaintext_pin_for_icc(&self) -> bool {
        self.bytes[1] & 0x80 != 0
    }

    pub fn enciphered_pin_online(&self) -> bool {
        self.bytes[1] & 0x40 != 0
    }

    pub fn signature(&self) -> bool {
        self.bytes[1] & 0x20 != 0
    }

    pub fn enciphered_pin_offline(&self) -> bool {
        self.bytes[1] & 0x10 != 0
    }

    pub fn no_cvm_required(&self) -> bool {
        self.bytes[1] & 0x08 != 0
    }

    // Byte 3: security capability.

    pub fn sda(&self) -> bool {
        self.bytes[2] & 0x80 != 0
    }

    pub fn dda(&self) -> bool {
        self.bytes[2] & 0x40 != 0
    }

    pub fn card_capture(&self) -> bool {
        self.bytes[2] & 0x20 != 0
    }

    pub fn cda(&self) -> bool {
        self.bytes[2] & 0x08 != 0
    }
}

/// Is this terminal an ATM? Book 4, Annex A1: an unattended financial
/// institution terminal (type 14, 15 or 16) with cash disbursement
/// capability (9F40 byte 1 bit 8).
pub fn is_atm(config: &TlvList) -> bool {
    let unattended_fi = matches!(
        config.value(tags::TERMINAL_TYPE),
        Some(&[0x14]) | Some(&[0x15]) | Some(&[0x16])
    );
    let cash = config
        .value(tags::ADDITIONAL_CAPABILITIES)
        .and_then(|v| v.first())
        .map(|b| b & 0x80 != 0)
        .unwrap_or(false);
    unattended_fi && cash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::Field;

    #[test]
    fn capability_bits() {
        let caps = TerminalCapabilities::new([0xE0, 0xB8, 0xC8]);
        assert!(caps.manual_key_entry());
        assert!(caps.magnetic_stripe());
        assert!(caps.icc_with_contacts());
        assert!(caps.plaintext_pin_for_icc());
        assert!(!caps.enciphered_pin_online());
        assert!(caps.signature());
        assert!(caps.enciphered_pin_offline());
        assert!(caps.no_cvm_required());
        assert!(caps.sda());
        assert!(caps.dda());
        assert!(!caps.card_capture());
        assert!(caps.cda());
    }

    #[test]
    fn from_config_needs_three_bytes() {
        let mut config = TlvList::new();
        config.push(Field::new(tags::TERMINAL_CAPABILITIES, vec![0xE0, 0xB8]));
        assert_eq!(TerminalCapabilities::from_config(&config), None);
        config.set(tags::TERMINAL_CAPABILITIES, vec![0xE0, 0xB8, 0xC8]);
        assert!(TerminalCapabilities::from_config(&config).is_some());
    }

    #[test]
    fn atm_detection() {
        let mut config = TlvList::new();
        assert!(!is_atm(&config));
        config.push(Field::new(tags::TERMINAL_TYPE, vec![0x14]));
        assert!(!is_atm(&config)); // no cash capability advertised
        config.push(Field::new(
            tags::ADDITIONAL_CAPABILITIES,
            vec![0x80, 0x00, 0x00, 0x00, 0x00],
        ));
        assert!(is_atm(&config));
        config.set(tags::TERMINAL_TYPE, vec![0x22]);
        assert!(!is_atm(&config)); // attended merchant terminal
    }
}
