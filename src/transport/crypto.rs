//! Datagram encryption for the split transport
//!
//! Every audio datagram is `nonce (16 bytes) || AES-128-CTR(payload)`. The
//! nonce is the session's base nonce with two fields overwritten:
//!
//! ```text
//!  0      2      4                     12           16
//!  +------+------+----------------------+------------+
//!  | base | len  | base                 | sequence   |
//!  +------+------+----------------------+------------+
//!          u16 BE                         u32 BE
//! ```
//!
//! The derived nonce doubles as the initial CTR counter block.

use aes::cipher::{KeyIvInit, StreamCipher};
use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::NONCE_LEN;
use crate::error::ProtocolError;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Key, base nonce and both sequence counters of one session
#[derive(Clone)]
pub struct CryptoStream {
    key: [u8; 16],
    base_nonce: [u8; NONCE_LEN],
    local_sequence: u32,
    /// Highest sequence accepted from the server, `None` until the first packet
    remote_sequence: Option<u32>,
}

impl CryptoStream {
    pub fn new(key: [u8; 16], base_nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            key,
            base_nonce,
            local_sequence: 0,
            remote_sequence: None,
        }
    }

    /// Build from the hex strings of the server hello
    pub fn from_hex(key: &str, nonce: &str) -> Result<Self, ProtocolError> {
        Ok(Self::new(decode_hex16("key", key)?, decode_hex16("nonce", nonce)?))
    }

    /// Nonce for a payload of `len` bytes sent with sequence `seq`
    pub fn derive_nonce(base: &[u8; NONCE_LEN], len: u16, seq: u32) -> [u8; NONCE_LEN] {
        let mut nonce = *base;
        nonce[2..4].copy_from_slice(&len.to_be_bytes());
        nonce[12..16].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    /// Encrypt one outbound payload into a complete datagram
    pub fn seal(&mut self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        let len = u16::try_from(payload.len())
            .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
        self.local_sequence = self.local_sequence.wrapping_add(1);
        let nonce = Self::derive_nonce(&self.base_nonce, len, self.local_sequence);

        let mut datagram = BytesMut::with_capacity(NONCE_LEN + payload.len());
        datagram.put_slice(&nonce);
        datagram.put_slice(payload);
        apply_keystream(&self.key, &nonce, &mut datagram[NONCE_LEN..]);
        Ok(datagram.freeze())
    }

    /// Decrypt one inbound datagram
    ///
    /// Packets older than the last accepted sequence are rejected; gaps are
    /// logged and otherwise tolerated.
    pub fn open(&mut self, datagram: &[u8]) -> Result<Bytes, ProtocolError> {
        if datagram.len() < NONCE_LEN {
            return Err(ProtocolError::PacketTooShort(datagram.len()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&datagram[..NONCE_LEN]);
        let sequence = u32::from_be_bytes([nonce[12], nonce[13], nonce[14], nonce[15]]);

        if let Some(last) = self.remote_sequence {
            let ahead = sequence.wrapping_sub(last) as i32;
            if ahead <= 0 {
                return Err(ProtocolError::StaleSequence { received: sequence, last });
            }
            if ahead > 1 {
                tracing::debug!("Datagram gap: {} lost before sequence {}", ahead - 1, sequence);
            }
        }
        self.remote_sequence = Some(sequence);

        let mut payload = datagram[NONCE_LEN..].to_vec();
        apply_keystream(&self.key, &nonce, &mut payload);
        Ok(Bytes::from(payload))
    }

    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    pub fn remote_sequence(&self) -> Option<u32> {
        self.remote_sequence
    }

    #[cfg(test)]
    pub(crate) fn set_local_sequence(&mut self, sequence: u32) {
        self.local_sequence = sequence;
    }
}

impl std::fmt::Debug for CryptoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys stay out of logs
        f.debug_struct("CryptoStream")
            .field("local_sequence", &self.local_sequence)
            .field("remote_sequence", &self.remote_sequence)
            .finish_non_exhaustive()
    }
}

fn apply_keystream(key: &[u8; 16], nonce: &[u8; NONCE_LEN], buf: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), nonce.into());
    cipher.apply_keystream(buf);
}

fn decode_hex16(field: &'static str, value: &str) -> Result<[u8; 16], ProtocolError> {
    let bytes = hex::decode(value).map_err(|e| ProtocolError::InvalidHex {
        field,
        reason: e.to_string(),
    })?;
    <[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| ProtocolError::InvalidHex {
        field,
        reason: format!("expected 16 bytes, got {}", bytes.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &str = "00112233445566778899aabbccddeeff";
    const NONCE: &str = "01000000aabbccddeeff001122000000";

    fn pair() -> (CryptoStream, CryptoStream) {
        (
            CryptoStream::from_hex(KEY, NONCE).unwrap(),
            CryptoStream::from_hex(KEY, NONCE).unwrap(),
        )
    }

    #[test]
    fn test_nonce_layout() {
        let base: [u8; 16] = hex::decode(NONCE).unwrap().try_into().unwrap();
        let nonce = CryptoStream::derive_nonce(&base, 0x0102, 7);
        assert_eq!(hex::encode(nonce), "01000102aabbccddeeff001100000007");
    }

    #[test]
    fn test_known_vector() {
        // NIST SP 800-38A F.5.1, first block
        let key: [u8; 16] = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap().try_into().unwrap();
        let iv: [u8; 16] = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap().try_into().unwrap();
        let mut block = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        apply_keystream(&key, &iv, &mut block);
        assert_eq!(hex::encode(block), "874d6191b620e3261bef6864990db6ce");
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!(matches!(
            CryptoStream::from_hex("zz", NONCE),
            Err(ProtocolError::InvalidHex { field: "key", .. })
        ));
        assert!(matches!(
            CryptoStream::from_hex(KEY, "0011"),
            Err(ProtocolError::InvalidHex { field: "nonce", .. })
        ));
    }

    #[test]
    fn test_short_packet_dropped() {
        let (_, mut rx) = pair();
        assert!(matches!(rx.open(&[0u8; 15]), Err(ProtocolError::PacketTooShort(15))));
        assert_eq!(rx.remote_sequence(), None);
    }

    #[test]
    fn test_sequence_increments_once_per_send() {
        let (mut tx, _) = pair();
        let first = tx.seal(b"a").unwrap();
        let second = tx.seal(b"b").unwrap();
        assert_eq!(&first[12..16], &1u32.to_be_bytes());
        assert_eq!(&second[12..16], &2u32.to_be_bytes());
        assert_eq!(tx.local_sequence(), 2);
    }

    #[test]
    fn test_stale_and_replayed_packets_rejected() {
        let (mut tx, mut rx) = pair();
        let one = tx.seal(b"one").unwrap();
        let two = tx.seal(b"two").unwrap();
        let three = tx.seal(b"three").unwrap();

        assert_eq!(rx.open(&one).unwrap().as_ref(), b"one");
        // two is lost, three arrives
        assert_eq!(rx.open(&three).unwrap().as_ref(), b"three");
        assert!(matches!(rx.open(&two), Err(ProtocolError::StaleSequence { received: 2, last: 3 })));
        assert!(rx.open(&three).is_err());
    }

    #[test]
    fn test_sequence_wraps() {
        let (mut tx, mut rx) = pair();
        tx.set_local_sequence(u32::MAX - 1);

        let last = tx.seal(b"x").unwrap();
        assert_eq!(tx.local_sequence(), u32::MAX);
        let wrapped = tx.seal(b"y").unwrap();
        assert_eq!(tx.local_sequence(), 0);
        assert_eq!(&wrapped[12..16], &[0, 0, 0, 0]);

        rx.open(&last).unwrap();
        assert_eq!(rx.open(&wrapped).unwrap().as_ref(), b"y");
    }

    proptest! {
        #[test]
        fn prop_derive_nonce_is_pure(base in any::<[u8; 16]>(), len in any::<u16>(), seq in any::<u32>()) {
            let a = CryptoStream::derive_nonce(&base, len, seq);
            let b = CryptoStream::derive_nonce(&base, len, seq);
            prop_assert_eq!(a, b);
            prop_assert_eq!(&a[0..2], &base[0..2]);
            prop_assert_eq!(&a[4..12], &base[4..12]);
            prop_assert_eq!(u16::from_be_bytes([a[2], a[3]]), len);
            prop_assert_eq!(u32::from_be_bytes([a[12], a[13], a[14], a[15]]), seq);
        }

        #[test]
        fn prop_seal_open_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            let (mut tx, mut rx) = pair();
            let datagram = tx.seal(&payload).unwrap();
            prop_assert_eq!(datagram.len(), NONCE_LEN + payload.len());
            prop_assert_eq!(u16::from_be_bytes([datagram[2], datagram[3]]) as usize, payload.len());
            let opened = rx.open(&datagram).unwrap();
            prop_assert_eq!(opened.as_ref(), payload.as_slice());
        }
    }
}
