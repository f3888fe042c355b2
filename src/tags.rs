//! EMV data element dictionary.
//!
//! Tag values and format classes are taken from EMV Book 3, Annex A. The
//! format class matters beyond display: the DOL data-build rules truncate
//! and pad differently for "n", "cn" and "b" data (Book 3, 5.4), so the
//! kernel needs to know what a tag holds without looking at its value.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::tlv::Tag;

/// EMV format class of a data element (Book 3, 4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// "a" — alphabetic.
    Alphabetic,
    /// "an" — alphanumeric.
    Alphanumeric,
    /// "ans" — alphanumeric special.
    AlphanumericSpecial,
    /// "b" — binary.
    Binary,
    /// "cn" — compressed numeric, left-justified BCD padded with 0xF.
    CompressedNumeric,
    /// "n" — numeric, right-justified BCD padded with leading zeros.
    Numeric,
    /// A constructed template.
    Template,
    /// A Data Object List (tag/length pairs, no values).
    Dol,
}

#[derive(Debug, Clone, Copy)]
pub struct DataElement {
    pub tag: u32,
    pub name: &'static str,
    pub format: Format,
}

macro_rules! dictionary {
    [$($tag:expr => $name:literal: $format:ident,)*] => {
        HashMap::from([$(
            ($tag, DataElement { tag: $tag, name: $name, format: Format::$format }),
        )*])
    };
}

lazy_static! {
    static ref ELEMENTS: HashMap<u32, DataElement> = dictionary![
        0x42 => "Issuer Identification Number (IIN)": Numeric,
        0x4F => "Application Dedicated File (ADF) Name": Binary,
        0x50 => "Application Label": AlphanumericSpecial,
        0x56 => "Track 1 Data": Binary,
        0x57 => "Track 2 Equivalent Data": Binary,
        0x5A => "Application Primary Account Number (PAN)": CompressedNumeric,
        0x61 => "Application Template": Template,
        0x6F => "File Control Information (FCI) Template": Template,
        0x70 => "READ RECORD Response Message Template": Template,
        0x71 => "Issuer Script Template 1": Template,
        0x72 => "Issuer Script Template 2": Template,
        0x73 => "Directory Discretionary Template": Template,
        0x77 => "Response Message Template Format 2": Template,
        0x80 => "Response Message Template Format 1": Binary,
        0x81 => "Amount, Authorised (Binary)": Binary,
        0x82 => "Application Interchange Profile": Binary,
        0x83 => "Command Template": Binary,
        0x84 => "Dedicated File (DF) Name": Binary,
        0x87 => "Application Priority Indicator": Binary,
        0x88 => "Short File Identifier (SFI)": Binary,
        0x89 => "Authorisation Code": Binary,
        0x8A => "Authorisation Response Code": Alphanumeric,
        0x8C => "Card Risk Management Data Object List 1 (CDOL1)": Dol,
        0x8D => "Card Risk Management Data Object List 2 (CDOL2)": Dol,
        0x8E => "Cardholder Verification Method (CVM) List": Binary,
        0x8F => "Certification Authority Public Key Index": Binary,
        0x90 => "Issuer Public Key Certificate": Binary,
        0x91 => "Issuer Authentication Data": Binary,
        0x92 => "Issuer Public Key Remainder": Binary,
        0x93 => "Signed Static Application Data": Binary,
        0x94 => "Application File Locator (AFL)": Binary,
        0x95 => "Terminal Verification Results": Binary,
        0x97 => "Transaction Certificate Data Object List (TDOL)": Dol,
        0x98 => "Transaction Certificate (TC) Hash Value": Binary,
        0x99 => "Transaction Personal Identification Number (PIN) Data": Binary,
        0x9A => "Transaction Date": Numeric,
        0x9B => "Transaction Status Information": Binary,
        0x9C => "Transaction Type": Numeric,
        0x9D => "Directory Definition File (DDF) Name": Binary,
        0xA5 => "File Control Information (FCI) Proprietary Template": Template,
        0x5F20 => "Cardholder Name": AlphanumericSpecial,
        0x5F24 => "Application Expiration Date": Numeric,
        0x5F25 => "Application Effective Date": Numeric,
        0x5F28 => "Issuer Country Code": Numeric,
        0x5F2A => "Transaction Currency Code": Numeric,
        0x5F2D => "Language Preference": Alphanumeric,
        0x5F30 => "Service Code": Numeric,
        0x5F34 => "Application PAN Sequence Number": Numeric,
        0x5F36 => "Transaction Currency Exponent": Numeric,
        0x5F50 => "Issuer URL": AlphanumericSpecial,
        0x5F53 => "International Bank Account Number (IBAN)": Binary,
        0x5F54 => "Bank Identifier Code (BIC)": Binary,
        0x5F55 => "Issuer Country Code (alpha2 format)": Alphabetic,
        0x5F56 => "Issuer Country Code (alpha3 format)": Alphabetic,
        0x9F01 => "Acquirer Identifier": Numeric,
        0x9F02 => "Amount, Authorised (Numeric)": Numeric,
        0x9F03 => "Amount, Other (Numeric)": Numeric,
        0x9F04 => "Amount, Other (Binary)": Binary,
        0x9F05 => "Application Discretionary Data": Binary,
        0x9F06 => "Application Identifier (AID) - terminal": Binary,
        0x9F07 => "Application Usage Control": Binary,
        0x9F08 => "Application Version Number (ICC)": Binary,
        0x9F09 => "Application Version Number (terminal)": Binary,
        0x9F0B => "Cardholder Name Extended": AlphanumericSpecial,
        0x9F0D => "Issuer Action Code - Default": Binary,
        0x9F0E => "Issuer Action Code - Denial": Binary,
        0x9F0F => "Issuer Action Code - Online": Binary,
        0x9F10 => "Issuer Application Data": Binary,
        0x9F11 => "Issuer Code Table Index": Numeric,
        0x9F12 => "Application Preferred Name": AlphanumericSpecial,
        0x9F13 => "Last Online Application Transaction Counter (ATC) Register": Binary,
        0x9F14 => "Lower Consecutive Offline Limit": Binary,
        0x9F15 => "Merchant Category Code": Numeric,
        0x9F16 => "Merchant Identifier": AlphanumericSpecial,
        0x9F17 => "Personal Identification Number (PIN) Try Counter": Binary,
        0x9F18 => "Issuer Script Identifier": Binary,
        0x9F1A => "Terminal Country Code": Numeric,
        0x9F1B => "Terminal Floor Limit": Binary,
        0x9F1C => "Terminal Identification": Alphanumeric,
        0x9F1D => "Terminal Risk Management Data": Binary,
        0x9F1E => "Interface Device (IFD) Serial Number": Alphanumeric,
        0x9F1F => "Track 1 Discretionary Data": AlphanumericSpecial,
        0x9F20 => "Track 2 Discretionary Data": CompressedNumeric,
        0x9F21 => "Transaction Time": Numeric,
        0x9F22 => "Certification Authority Public Key Index (terminal)": Binary,
        0x9F23 => "Upper Consecutive Offline Limit": Binary,
        0x9F26 => "Application Cryptogram": Binary,
        0x9F27 => "Cryptogram Information Data": Binary,
        0x9F2D => "ICC PIN Encipherment Public Key Certificate": Binary,
        0x9F2E => "ICC PIN Encipherment Public Key Exponent": Binary,
        0x9F2F => "ICC PIN Encipherment Public Key Remainder": Binary,
        0x9F32 => "Issuer Public Key Exponent": Binary,
        0x9F33 => "Terminal Capabilities": Binary,
        0x9F34 => "Cardholder Verification Method (CVM) Results": Binary,
        0x9F35 => "Terminal Type": Numeric,
        0x9F36 => "Application Transaction Counter (ATC)": Binary,
        0x9F37 => "Unpredictable Number": Binary,
        0x9F38 => "Processing Options Data Object List (PDOL)": Dol,
        0x9F39 => "Point-of-Service (POS) Entry Mode": Numeric,
        0x9F3A => "Amount, Reference Currency": Binary,
        0x9F3B => "Application Reference Currency": Numeric,
        0x9F3C => "Transaction Reference Currency Code": Numeric,
        0x9F3D => "Transaction Reference Currency Exponent": Numeric,
        0x9F40 => "Additional Terminal Capabilities": Binary,
        0x9F41 => "Transaction Sequence Counter": Numeric,
        0x9F42 => "Application Currency Code": Numeric,
        0x9F43 => "Application Reference Currency Exponent": Numeric,
        0x9F44 => "Application Currency Exponent": Numeric,
        0x9F45 => "Data Authentication Code": Binary,
        0x9F46 => "ICC Public Key Certificate": Binary,
        0x9F47 => "ICC Public Key Exponent": Binary,
        0x9F48 => "ICC Public Key Remainder": Binary,
        0x9F49 => "Dynamic Data Authentication Data Object List (DDOL)": Dol,
        0x9F4A => "Static Data Authentication Tag List": Binary,
        0x9F4B => "Signed Dynamic Application Data": Binary,
        0x9F4C => "ICC Dynamic Number": Binary,
        0x9F4D => "Log Entry": Binary,
        0x9F4E => "Merchant Name and Location": AlphanumericSpecial,
        0x9F4F => "Log Format": Dol,
        0xBF0C => "FCI Issuer Discretionary Data": Template,
    ];
}

/// Look up a data element by tag.
pub fn lookup(tag: Tag) -> Option<&'static DataElement> {
    ELEMENTS.get(&tag.value())
}

/// The format class of a tag; unknown tags are treated as binary, which
/// gives the DOL rules their most conservative behaviour.
pub fn format_of(tag: Tag) -> Format {
    lookup(tag).map(|e| e.format).unwrap_or(Format::Binary)
}

/// The dictionary name of a tag, if we know it.
pub fn name_of(tag: Tag) -> Option<&'static str> {
    lookup(tag).map(|e| e.name)
}

// Tags the kernel itself branches on, as typed constants.
pub const ADF_NAME: Tag = Tag::new(0x4F);
pub const APP_LABEL: Tag = Tag::new(0x50);
pub const PAN: Tag = Tag::new(0x5A);
pub const APP_TEMPLATE: Tag = Tag::new(0x61);
pub const FCI_TEMPLATE: Tag = Tag::new(0x6F);
pub const RECORD_TEMPLATE: Tag = Tag::new(0x70);
pub const RESPONSE_FORMAT_2: Tag = Tag::new(0x77);
pub const RESPONSE_FORMAT_1: Tag = Tag::new(0x80);
pub const AMOUNT_BINARY: Tag = Tag::new(0x81);
pub const AIP: Tag = Tag::new(0x82);
pub const COMMAND_TEMPLATE: Tag = Tag::new(0x83);
pub const DF_NAME: Tag = Tag::new(0x84);
pub const APP_PRIORITY: Tag = Tag::new(0x87);
pub const PSE_SFI: Tag = Tag::new(0x88);
pub const CDOL1: Tag = Tag::new(0x8C);
pub const CDOL2: Tag = Tag::new(0x8D);
pub const CA_PK_INDEX: Tag = Tag::new(0x8F);
pub const ISSUER_PK_CERT: Tag = Tag::new(0x90);
pub const ISSUER_PK_REMAINDER: Tag = Tag::new(0x92);
pub const SIGNED_STATIC_DATA: Tag = Tag::new(0x93);
pub const AFL: Tag = Tag::new(0x94);
pub const TVR: Tag = Tag::new(0x95);
pub const TRANSACTION_DATE: Tag = Tag::new(0x9A);
pub const TSI: Tag = Tag::new(0x9B);
pub const TRANSACTION_TYPE: Tag = Tag::new(0x9C);
pub const FCI_PROPRIETARY: Tag = Tag::new(0xA5);
pub const CVM_LIST: Tag = Tag::new(0x8E);
pub const EXPIRY_DATE: Tag = Tag::new(0x5F24);
pub const EFFECTIVE_DATE: Tag = Tag::new(0x5F25);
pub const ISSUER_COUNTRY: Tag = Tag::new(0x5F28);
pub const TRANSACTION_CURRENCY: Tag = Tag::new(0x5F2A);
pub const LANGUAGE_PREFERENCE: Tag = Tag::new(0x5F2D);
pub const AMOUNT_AUTHORISED: Tag = Tag::new(0x9F02);
pub const AID_TERMINAL: Tag = Tag::new(0x9F06);
pub const APP_USAGE_CONTROL: Tag = Tag::new(0x9F07);
pub const APP_VERSION_ICC: Tag = Tag::new(0x9F08);
pub const APP_VERSION_TERMINAL: Tag = Tag::new(0x9F09);
pub const ISSUER_CODE_TABLE: Tag = Tag::new(0x9F11);
pub const APP_PREFERRED_NAME: Tag = Tag::new(0x9F12);
pub const LAST_ONLINE_ATC: Tag = Tag::new(0x9F13);
pub const LOWER_CONSECUTIVE_LIMIT: Tag = Tag::new(0x9F14);
pub const TERMINAL_COUNTRY: Tag = Tag::new(0x9F1A);
pub const TERMINAL_FLOOR_LIMIT: Tag = Tag::new(0x9F1B);
pub const UPPER_CONSECUTIVE_LIMIT: Tag = Tag::new(0x9F23);
pub const APPLICATION_CRYPTOGRAM: Tag = Tag::new(0x9F26);
pub const CID: Tag = Tag::new(0x9F27);
pub const ISSUER_PK_EXPONENT: Tag = Tag::new(0x9F32);
pub const TERMINAL_CAPABILITIES: Tag = Tag::new(0x9F33);
pub const CVM_RESULTS: Tag = Tag::new(0x9F34);
pub const TERMINAL_TYPE: Tag = Tag::new(0x9F35);
pub const ATC: Tag = Tag::new(0x9F36);
pub const UNPREDICTABLE_NUMBER: Tag = Tag::new(0x9F37);
pub const PDOL: Tag = Tag::new(0x9F38);
pub const ADDITIONAL_CAPABILITIES: Tag = Tag::new(0x9F40);
pub const APP_CURRENCY: Tag = Tag::new(0x9F42);
pub const DATA_AUTH_CODE: Tag = Tag::new(0x9F45);
pub const ICC_PK_CERT: Tag = Tag::new(0x9F46);
pub const ICC_PK_EXPONENT: Tag = Tag::new(0x9F47);
pub const ICC_PK_REMAINDER: Tag = Tag::new(0x9F48);
pub const DDOL: Tag = Tag::new(0x9F49);
pub const SDA_TAG_LIST: Tag = Tag::new(0x9F4A);
pub const SIGNED_DYNAMIC_DATA: Tag = Tag::new(0x9F4B);
pub const ICC_DYNAMIC_NUMBER: Tag = Tag::new(0x9F4C);
pub const FCI_ISSUER_DISCRETIONARY: Tag = Tag::new(0xBF0C);
