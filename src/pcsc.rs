//! PCSC-backed reader callback, for integrations that talk to real
//! hardware through the platform's smartcard service.

use crate::ttl::{CardReader, ReaderError};

/// A connected PCSC card as a [`CardReader`].
pub struct PcscReader {
    card: pcsc::Card,
}

impl PcscReader {
    pub fn new(card: pcsc::Card) -> Self {
        PcscReader { card }
    }

    pub fn into_card(self) -> pcsc::Card {
        self.card
    }
}

impl CardReader for PcscReader {
    fn transceive(&mut self, tx: &[u8], rx_cap: usize) -> Result<Vec<u8>, ReaderError> {
        let mut rbuf = vec![0u8; rx_cap + 2];
        let rsp = self.card.transmit(tx, &mut rbuf).map_err(convert)?;
        Ok(rsp.to_vec())
    }
}

fn convert(err: pcsc::Error) -> ReaderError {
    match err {
        pcsc::Error::NoSmartcard => ReaderError::NoCard,
        pcsc::Error::RemovedCard | pcsc::Error::ResetCard => ReaderError::Removed,
        pcsc::Error::Timeout => ReaderError::Timeout,
        other => ReaderError::Transport(other.to_string()),
    }
}
