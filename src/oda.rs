//! Offline Data Authentication: certificate chain recovery and the
//! SDA/DDA/CDA verifications of EMV Book 2.
//!
//! Everything here is pure computation over recovered signatures; the
//! transaction state machine owns sequencing (when to INTERNAL
//! AUTHENTICATE, which TVR bits to set). The recovered-certificate
//! layouts are byte-exact from Book 2, Tables 6, 14, 17 and 19 - the
//! offsets below are load-bearing, which is why each parser spells them
//! out instead of being clever.

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{Crypto, CryptoError, PublicKey};
use crate::format;
use crate::tags;
use crate::tlv::dol::TagList;
use crate::tlv::{Tag, TlvList};

/// Why a recovery or verification failed. Mostly interesting for logs and
/// tests; the state machine flattens this to the TVR bit and the
/// continuable result for the method in use.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    #[error("recovered data too short for its layout")]
    TooShort,
    #[error("recovered header is not 6A")]
    BadHeader,
    #[error("recovered trailer is not BC")]
    BadTrailer,
    #[error("unexpected certificate format byte")]
    BadFormat,
    #[error("hash algorithm is not SHA-1")]
    BadHashAlgorithm,
    #[error("public key algorithm is not RSA")]
    BadPkAlgorithm,
    #[error("key length fields disagree with the data on the card")]
    KeyLengthMismatch,
    #[error("padding bytes are not BB")]
    BadPadding,
    #[error("certificate issuer does not match the PAN")]
    IssuerMismatch,
    #[error("certificate PAN does not match the application PAN")]
    PanMismatch,
    #[error("certificate expired")]
    Expired,
    #[error("certificate carries an undecodable date")]
    BadDate,
    #[error("recovered hash does not match")]
    HashMismatch,
    #[error("static data tag list is not exactly the AIP")]
    BadTagList,
    #[error("dynamic data is inconsistent")]
    BadDynamicData,
    #[error("CID in the signature differs from the response CID")]
    CidMismatch,
    #[error("transaction data hash does not match")]
    TransactionHashMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

type Result<T> = std::result::Result<T, VerifyError>;

/// The input buffer for offline authentication: record payloads in AFL
/// order. Only records flagged by their AFL entry land here, appended in
/// record-number order within each entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OdaBuffer {
    data: Vec<u8>,
}

impl OdaBuffer {
    pub fn new() -> Self {
        OdaBuffer::default()
    }

    pub fn push_record(&mut self, record: &[u8]) {
        self.data.extend_from_slice(record);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// An offline authentication method, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Method {
    Cda,
    Dda,
    Sda,
}

// AIP byte 1 feature bits (Book 3, Annex C1).
const AIP_SDA: u8 = 0x40;
const AIP_DDA: u8 = 0x20;
const AIP_CDA: u8 = 0x01;

// Terminal Capabilities (9F33) byte 3 bits (Book 4, Annex A2).
const CAPS_SDA: u8 = 0x80;
const CAPS_DDA: u8 = 0x40;
const CAPS_CDA: u8 = 0x08;

/// Pick the strongest method both the card (AIP) and the terminal (9F33
/// byte 3) support: CDA over DDA over SDA.
pub fn select_method(aip: [u8; 2], capabilities: &[u8]) -> Option<Method> {
    let caps = *capabilities.get(2)?;
    if aip[0] & AIP_CDA != 0 && caps & CAPS_CDA != 0 {
        Some(Method::Cda)
    } else if aip[0] & AIP_DDA != 0 && caps & CAPS_DDA != 0 {
        Some(Method::Dda)
    } else if aip[0] & AIP_SDA != 0 && caps & CAPS_SDA != 0 {
        Some(Method::Sda)
    } else {
        None
    }
}

/// Assemble the static data to be authenticated: the ODA buffer, plus the
/// AIP. For SDA the AIP is always appended; for DDA/CDA only when the card
/// carries a Static Data Authentication Tag List (9F4A), which then must
/// reference exactly the AIP.
pub fn static_data(
    buffer: &OdaBuffer,
    aip: [u8; 2],
    icc: &TlvList,
    method: Method,
) -> Result<Vec<u8>> {
    let tag_list_aip = match icc.value(tags::SDA_TAG_LIST) {
        Some(raw) => {
            let listed: std::result::Result<Vec<Tag>, _> = TagList::new(raw).tags().collect();
            match listed {
                Ok(listed) if listed == [tags::AIP] => true,
                _ => return Err(VerifyError::BadTagList),
            }
        }
        None => false,
    };
    let mut data = buffer.as_bytes().to_vec();
    if tag_list_aip || method == Method::Sda {
        data.extend_from_slice(&aip);
    }
    Ok(data)
}

/// A public key recovered from a certificate, with its vitals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredKey {
    pub key: PublicKey,
    pub expiry: NaiveDate,
    pub serial: [u8; 3],
}

fn check_envelope(recovered: &[u8], min_len: usize) -> Result<()> {
    if recovered.len() < min_len {
        return Err(VerifyError::TooShort);
    }
    if recovered[0] != 0x6A {
        return Err(VerifyError::BadHeader);
    }
    if recovered[recovered.len() - 1] != 0xBC {
        return Err(VerifyError::BadTrailer);
    }
    Ok(())
}

/// Compare a left-justified, F-padded BCD identifier against the leading
/// digits of the application PAN.
fn matches_pan_prefix(field: &[u8], pan: &[u8]) -> bool {
    let Ok(pan_digits) = format::from_cn(pan) else {
        return false;
    };
    let pan_digits = pan_digits.as_bytes();
    let mut at = 0;
    for &byte in field {
        for nibble in [byte >> 4, byte & 0x0F] {
            if nibble == 0xF {
                return at > 0;
            }
            if nibble > 9 {
                return false;
            }
            match pan_digits.get(at) {
                Some(&digit) if digit - b'0' == nibble => at += 1,
                _ => return false,
            }
        }
    }
    at > 0
}

/// Reassemble a modulus from a certificate's leftmost-bytes field, the
/// remainder object (may be empty) and the declared length. A key that
/// fits entirely in the certificate is right-padded there with BB bytes.
fn assemble_modulus(leftmost: &[u8], remainder: &[u8], declared: usize) -> Result<Vec<u8>> {
    if declared <= leftmost.len() {
        if !leftmost[declared..].iter().all(|&b| b == 0xBB) {
            return Err(VerifyError::BadPadding);
        }
        if !remainder.is_empty() {
            return Err(VerifyError::KeyLengthMismatch);
        }
        Ok(leftmost[..declared].to_vec())
    } else {
        if declared - leftmost.len() != remainder.len() {
            return Err(VerifyError::KeyLengthMismatch);
        }
        let mut modulus = leftmost.to_vec();
        modulus.extend_from_slice(remainder);
        Ok(modulus)
    }
}

/// Recover and validate the Issuer Public Key Certificate (tag 90) under a
/// certification authority key. Book 2, 5.3 and Table 6.
pub fn recover_issuer_key(
    crypto: &dyn Crypto,
    ca: &PublicKey,
    certificate: &[u8],
    remainder: &[u8],
    exponent: &[u8],
    pan: &[u8],
    now: NaiveDate,
) -> Result<RecoveredKey> {
    let recovered = crypto.rsa_recover(ca, certificate)?;
    let n = recovered.len();
    check_envelope(&recovered, 42)?;
    if recovered[1] != 0x02 {
        return Err(VerifyError::BadFormat);
    }
    if !matches_pan_prefix(&recovered[2..6], pan) {
        return Err(VerifyError::IssuerMismatch);
    }
    let expiry = format::expiry_from_mmyy(&recovered[6..8]).map_err(|_| VerifyError::BadDate)?;
    if expiry < now {
        debug!("issuer certificate expired {}", expiry);
        return Err(VerifyError::Expired);
    }
    let serial = [recovered[8], recovered[9], recovered[10]];
    if recovered[11] != 0x01 {
        return Err(VerifyError::BadHashAlgorithm);
    }
    if recovered[12] != 0x01 {
        return Err(VerifyError::BadPkAlgorithm);
    }
    let declared_len = recovered[13] as usize;
    if recovered[14] as usize != exponent.len() {
        return Err(VerifyError::KeyLengthMismatch);
    }

    let leftmost = &recovered[15..n - 21];
    let modulus = assemble_modulus(leftmost, remainder, declared_len)?;

    let mut hashed = recovered[1..n - 21].to_vec();
    hashed.extend_from_slice(remainder);
    hashed.extend_from_slice(exponent);
    if crypto.sha1(&hashed) != recovered[n - 21..n - 1] {
        return Err(VerifyError::HashMismatch);
    }

    Ok(RecoveredKey {
        key: PublicKey::new(modulus, exponent.to_vec()),
        expiry,
        serial,
    })
}

/// Recover and validate the ICC Public Key Certificate (tag 9F46) under
/// the issuer key. The certificate hash covers the static data to be
/// authenticated, binding the key to the card's records. Book 2, 6.4 and
/// Table 14.
pub fn recover_icc_key(
    crypto: &dyn Crypto,
    issuer: &PublicKey,
    certificate: &[u8],
    remainder: &[u8],
    exponent: &[u8],
    static_data: &[u8],
    pan: &[u8],
    now: NaiveDate,
) -> Result<RecoveredKey> {
    let recovered = crypto.rsa_recover(issuer, certificate)?;
    let n = recovered.len();
    check_envelope(&recovered, 48)?;
    if recovered[1] != 0x04 {
        return Err(VerifyError::BadFormat);
    }

    // The recovered PAN is the full application PAN, F-padded to 10 bytes.
    let mut padded_pan = pan.to_vec();
    padded_pan.resize(10, 0xFF);
    if recovered[2..12] != padded_pan[..] {
        return Err(VerifyError::PanMismatch);
    }

    let expiry = format::expiry_from_mmyy(&recovered[12..14]).map_err(|_| VerifyError::BadDate)?;
    if expiry < now {
        debug!("ICC certificate expired {}", expiry);
        return Err(VerifyError::Expired);
    }
    let serial = [recovered[14], recovered[15], recovered[16]];
    if recovered[17] != 0x01 {
        return Err(VerifyError::BadHashAlgorithm);
    }
    if recovered[18] != 0x01 {
        return Err(VerifyError::BadPkAlgorithm);
    }
    let declared_len = recovered[19] as usize;
    if recovered[20] as usize != exponent.len() {
        return Err(VerifyError::KeyLengthMismatch);
    }

    let leftmost = &recovered[21..n - 21];
    let modulus = assemble_modulus(leftmost, remainder, declared_len)?;

    let mut hashed = recovered[1..n - 21].to_vec();
    hashed.extend_from_slice(remainder);
    hashed.extend_from_slice(exponent);
    hashed.extend_from_slice(static_data);
    if crypto.sha1(&hashed) != recovered[n - 21..n - 1] {
        return Err(VerifyError::HashMismatch);
    }

    Ok(RecoveredKey {
        key: PublicKey::new(modulus, exponent.to_vec()),
        expiry,
        serial,
    })
}

/// Verify the Signed Static Application Data (tag 93) and extract the
/// Data Authentication Code. Book 2, 5.4 and Table 7.
pub fn verify_ssad(
    crypto: &dyn Crypto,
    issuer: &PublicKey,
    ssad: &[u8],
    static_data: &[u8],
) -> Result<[u8; 2]> {
    let recovered = crypto.rsa_recover(issuer, ssad)?;
    let n = recovered.len();
    check_envelope(&recovered, 26)?;
    if recovered[1] != 0x03 {
        return Err(VerifyError::BadFormat);
    }
    if recovered[2] != 0x01 {
        return Err(VerifyError::BadHashAlgorithm);
    }
    let dac = [recovered[3], recovered[4]];
    if !recovered[5..n - 21].iter().all(|&b| b == 0xBB) {
        return Err(VerifyError::BadPadding);
    }

    let mut hashed = recovered[1..n - 21].to_vec();
    hashed.extend_from_slice(static_data);
    if crypto.sha1(&hashed) != recovered[n - 21..n - 1] {
        warn!("SSAD hash mismatch");
        return Err(VerifyError::HashMismatch);
    }
    Ok(dac)
}

/// Split the ICC Dynamic Data: its first byte is the length of the ICC
/// Dynamic Number (2-8 bytes), which follows immediately.
fn split_dynamic_number(dynamic: &[u8]) -> Result<(&[u8], &[u8])> {
    let (&len, rest) = dynamic.split_first().ok_or(VerifyError::BadDynamicData)?;
    let len = len as usize;
    if !(2..=8).contains(&len) || rest.len() < len {
        return Err(VerifyError::BadDynamicData);
    }
    Ok(rest.split_at(len))
}

/// Common recovery for the Signed Dynamic Application Data envelope
/// (DDA and CDA share the layout of Book 2, Table 17/19). Returns the
/// ICC Dynamic Data after checking padding and the hash over
/// (recovered body || challenge).
fn recover_sdad(
    crypto: &dyn Crypto,
    icc: &PublicKey,
    sdad: &[u8],
    challenge: &[u8],
) -> Result<Vec<u8>> {
    let recovered = crypto.rsa_recover(icc, sdad)?;
    let n = recovered.len();
    check_envelope(&recovered, 25)?;
    if recovered[1] != 0x05 {
        return Err(VerifyError::BadFormat);
    }
    if recovered[2] != 0x01 {
        return Err(VerifyError::BadHashAlgorithm);
    }
    let ldd = recovered[3] as usize;
    if 4 + ldd > n - 21 {
        return Err(VerifyError::BadDynamicData);
    }
    if !recovered[4 + ldd..n - 21].iter().all(|&b| b == 0xBB) {
        return Err(VerifyError::BadPadding);
    }

    let mut hashed = recovered[1..n - 21].to_vec();
    hashed.extend_from_slice(challenge);
    if crypto.sha1(&hashed) != recovered[n - 21..n - 1] {
        return Err(VerifyError::HashMismatch);
    }
    Ok(recovered[4..4 + ldd].to_vec())
}

/// Verify a DDA signature over the terminal's DDOL data and extract the
/// ICC Dynamic Number. Book 2, 6.5.
pub fn verify_dda(
    crypto: &dyn Crypto,
    icc: &PublicKey,
    sdad: &[u8],
    ddol_data: &[u8],
) -> Result<Vec<u8>> {
    let dynamic = recover_sdad(crypto, icc, sdad, ddol_data)?;
    let (number, _) = split_dynamic_number(&dynamic)?;
    Ok(number.to_vec())
}

/// What a CDA signature vouched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdaVerified {
    pub icc_dynamic_number: Vec<u8>,
}

/// Verify a CDA signature from a GENERATE AC response. The signature's
/// dynamic data embeds the CID and a hash of the transaction data; both
/// must line up with what the card actually answered. Book 2, 6.6.2.
///
/// `tx_data` is PDOL data || CDOL data || the GENERATE AC response data
/// objects minus the SDAD itself, in response order.
pub fn verify_cda(
    crypto: &dyn Crypto,
    icc: &PublicKey,
    sdad: &[u8],
    unpredictable_number: &[u8],
    cid: u8,
    tx_data: &[u8],
) -> Result<CdaVerified> {
    let dynamic = recover_sdad(crypto, icc, sdad, unpredictable_number)?;
    let (number, rest) = split_dynamic_number(&dynamic)?;
    let (&signed_cid, rest) = rest.split_first().ok_or(VerifyError::BadDynamicData)?;
    if signed_cid != cid {
        return Err(VerifyError::CidMismatch);
    }
    if rest.len() < 20 {
        return Err(VerifyError::BadDynamicData);
    }
    if crypto.sha1(tx_data) != rest[..20] {
        return Err(VerifyError::TransactionHashMismatch);
    }
    Ok(CdaVerified {
        icc_dynamic_number: number.to_vec(),
    })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::tlv::Field;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
    }

    #[test]
    fn method_selection_prefers_strength() {
        // Terminal supports everything.
        let caps = [0xE0, 0xB8, 0xC8];
        assert_eq!(select_method([0x41, 0x00], &caps), Some(Method::Cda));
        assert_eq!(select_method([0x60, 0x00], &caps), Some(Method::Dda));
        assert_eq!(select_method([0x40, 0x00], &caps), Some(Method::Sda));
        // Card wants CDA, terminal can only do SDA.
        assert_eq!(select_method([0x41, 0x00], &[0xE0, 0xB8, 0x80]), Some(Method::Sda));
        // No overlap.
        assert_eq!(select_method([0x08, 0x00], &caps), None);
        assert_eq!(select_method([0x40, 0x00], &[0xE0, 0xB8, 0x00]), None);
        // Malformed capabilities.
        assert_eq!(select_method([0x40, 0x00], &[0xE0]), None);
    }

    #[test]
    fn static_data_aip_rules() {
        let mut buffer = OdaBuffer::new();
        buffer.push_record(&[0x01, 0x02]);
        let aip = [0x5C, 0x00];

        // SDA appends the AIP unconditionally.
        let mut icc = TlvList::new();
        assert_eq!(
            static_data(&buffer, aip, &icc, Method::Sda).unwrap(),
            vec![0x01, 0x02, 0x5C, 0x00]
        );
        // DDA without a tag list does not.
        assert_eq!(
            static_data(&buffer, aip, &icc, Method::Dda).unwrap(),
            vec![0x01, 0x02]
        );
        // DDA with a 9F4A naming the AIP does.
        icc.push(Field::new(tags::SDA_TAG_LIST, vec![0x82]));
        assert_eq!(
            static_data(&buffer, aip, &icc, Method::Dda).unwrap(),
            vec![0x01, 0x02, 0x5C, 0x00]
        );
        // A tag list naming anything else is broken.
        icc.get_mut(tags::SDA_TAG_LIST).unwrap().value = vec![0x82, 0x94];
        assert_eq!(
            static_data(&buffer, aip, &icc, Method::Dda),
            Err(VerifyError::BadTagList)
        );
    }

    #[test]
    fn issuer_recovery_round_trip() {
        let issuer_modulus = vec![0x11; 26];
        let exponent = [0x03];
        let cert = issuer_cert(64, &issuer_modulus, &exponent);
        let ca = PublicKey::new(vec![0xFF; 64], vec![0x03]);

        let recovered =
            recover_issuer_key(&PlainCrypto, &ca, &cert, &[], &exponent, &PAN, today()).unwrap();
        assert_eq!(recovered.key.modulus, issuer_modulus);
        assert_eq!(recovered.key.exponent, vec![0x03]);
        assert_eq!(recovered.serial, [0x00, 0x00, 0x01]);
        assert_eq!(recovered.expiry, NaiveDate::from_ymd_opt(2049, 12, 31).unwrap());
    }

    #[test]
    fn issuer_recovery_catches_tampering() {
        let exponent = [0x03];
        let ca = PublicKey::new(vec![0xFF; 64], vec![0x03]);

        // Flipped payload bit: hash mismatch.
        let mut cert = issuer_cert(64, &[0x11; 26], &exponent);
        cert[16] ^= 0x01;
        assert_eq!(
            recover_issuer_key(&PlainCrypto, &ca, &cert, &[], &exponent, &PAN, today()),
            Err(VerifyError::HashMismatch)
        );

        // Wrong issuer identifier.
        let mut cert = issuer_cert(64, &[0x11; 26], &exponent);
        cert[2] = 0x99;
        assert_eq!(
            recover_issuer_key(&PlainCrypto, &ca, &cert, &[], &exponent, &PAN, today()),
            Err(VerifyError::IssuerMismatch)
        );

        // Bad trailer.
        let mut cert = issuer_cert(64, &[0x11; 26], &exponent);
        let last = cert.len() - 1;
        cert[last] = 0xBD;
        assert_eq!(
            recover_issuer_key(&PlainCrypto, &ca, &cert, &[], &exponent, &PAN, today()),
            Err(VerifyError::BadTrailer)
        );

        // Expired.
        let cert = issuer_cert(64, &[0x11; 26], &exponent);
        assert_eq!(
            recover_issuer_key(
                &PlainCrypto,
                &ca,
                &cert,
                &[],
                &exponent,
                &PAN,
                NaiveDate::from_ymd_opt(2050, 1, 1).unwrap()
            ),
            Err(VerifyError::Expired)
        );

        // Exponent length disagrees.
        let cert = issuer_cert(64, &[0x11; 26], &exponent);
        assert_eq!(
            recover_issuer_key(&PlainCrypto, &ca, &cert, &[], &[0x01, 0x00, 0x01], &PAN, today()),
            Err(VerifyError::KeyLengthMismatch)
        );
    }

    #[test]
    fn ssad_verification_extracts_dac() {
        let issuer_modulus = vec![0x11; 26];
        let issuer = PublicKey::new(issuer_modulus, vec![0x03]);
        let static_bytes = [0xAA, 0xBB, 0xCC, 0x5C, 0x00];
        let signed = ssad(26, [0x12, 0x34], &static_bytes);

        assert_eq!(
            verify_ssad(&PlainCrypto, &issuer, &signed, &static_bytes).unwrap(),
            [0x12, 0x34]
        );
        // Different static data: the signature stops matching.
        assert_eq!(
            verify_ssad(&PlainCrypto, &issuer, &signed, &[0xAA]),
            Err(VerifyError::HashMismatch)
        );
    }

    #[test]
    fn icc_recovery_with_remainder() {
        let icc_modulus: Vec<u8> = (0..28u8).collect();
        let exponent = [0x03];
        let static_bytes = [0x70, 0x02, 0x5A, 0x00, 0x19, 0x80];
        // n_i = 64: leftmost field holds 22 bytes, remainder carries 6.
        let (cert, remainder) = icc_cert(64, &icc_modulus, &exponent, &static_bytes);
        assert_eq!(remainder.len(), 6);
        let issuer = PublicKey::new(vec![0x11; 64], vec![0x03]);

        let recovered = recover_icc_key(
            &PlainCrypto,
            &issuer,
            &cert,
            &remainder,
            &exponent,
            &static_bytes,
            &PAN,
            today(),
        )
        .unwrap();
        assert_eq!(recovered.key.modulus, icc_modulus);

        // The certificate binds the static data: change it and fail.
        assert_eq!(
            recover_icc_key(
                &PlainCrypto,
                &issuer,
                &cert,
                &remainder,
                &exponent,
                &[0x00],
                &PAN,
                today(),
            ),
            Err(VerifyError::HashMismatch)
        );

        // Wrong PAN.
        let other_pan = [0x41u8; 8];
        assert_eq!(
            recover_icc_key(
                &PlainCrypto,
                &issuer,
                &cert,
                &remainder,
                &exponent,
                &static_bytes,
                &other_pan,
                today(),
            ),
            Err(VerifyError::PanMismatch)
        );
    }

    #[test]
    fn dda_verification_extracts_dynamic_number() {
        let icc_key = PublicKey::new(vec![0x22; 28], vec![0x03]);
        let dynamic_number = [0x9A, 0x6B];
        let ddol_data = [0xDE, 0xAD, 0xBE, 0xEF];
        let sdad = dda_sdad(28, &dynamic_number, &ddol_data);

        assert_eq!(
            verify_dda(&PlainCrypto, &icc_key, &sdad, &ddol_data).unwrap(),
            dynamic_number.to_vec()
        );
        // A different challenge must fail.
        assert_eq!(
            verify_dda(&PlainCrypto, &icc_key, &sdad, &[0x00; 4]),
            Err(VerifyError::HashMismatch)
        );
    }

    #[test]
    fn cda_verification_checks_cid_and_tx_hash() {
        let icc_key = PublicKey::new(vec![0x22; 49], vec![0x03]);
        let un = [0xDE, 0xAD, 0xBE, 0xEF];
        let tx_data = [0x9F, 0x27, 0x01, 0x40, 0x9F, 0x36, 0x02, 0x00, 0x1E];
        let cid = 0x40;

        // Assemble the signed dynamic data by hand: number, CID, tx hash.
        let mut sdad = vec![0xBB; 49];
        sdad[0] = 0x6A;
        sdad[1] = 0x05;
        sdad[2] = 0x01;
        sdad[3] = 24; // 1 + 2 + 1 + 20
        sdad[4] = 2;
        sdad[5..7].copy_from_slice(&[0x9A, 0x6B]);
        sdad[7] = cid;
        let tx_hash = PlainCrypto.sha1(&tx_data);
        sdad[8..28].copy_from_slice(&tx_hash);
        let mut hashed = sdad[1..28].to_vec();
        hashed.extend_from_slice(&un);
        let hash = PlainCrypto.sha1(&hashed);
        sdad[28..48].copy_from_slice(&hash);
        sdad[48] = 0xBC;

        let verified = verify_cda(&PlainCrypto, &icc_key, &sdad, &un, cid, &tx_data).unwrap();
        assert_eq!(verified.icc_dynamic_number, vec![0x9A, 0x6B]);

        // CID mismatch.
        assert_eq!(
            verify_cda(&PlainCrypto, &icc_key, &sdad, &un, 0x80, &tx_data),
            Err(VerifyError::CidMismatch)
        );
        // Tampered transaction data.
        assert_eq!(
            verify_cda(&PlainCrypto, &icc_key, &sdad, &un, cid, &[0x00]),
            Err(VerifyError::TransactionHashMismatch)
        );
    }

    #[test]
    fn sdad_padding_enforced() {
        let icc_key = PublicKey::new(vec![0x22; 30], vec![0x03]);
        // n = 30 leaves two real padding bytes at offsets 7 and 8.
        let mut sdad = dda_sdad(30, &[0x9A, 0x6B], &[0x01]);
        // Corrupt a padding byte; padding is checked before the hash.
        sdad[8] = 0x00;
        assert_eq!(
            verify_dda(&PlainCrypto, &icc_key, &sdad, &[0x01]),
            Err(VerifyError::BadPadding)
        );
    }
}
