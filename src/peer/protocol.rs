use crate::error::{PeerError, Result};

pub const HANDSHAKE_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";

/// Zero padding between the header and the peer id
const PADDING_LEN: usize = 10;

pub const HANDSHAKE_LEN: usize = HANDSHAKE_HEADER.len() + PADDING_LEN + 4;

/// Handshake message opening every connection
/// Format: <header><10 zero bytes><peer id>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub peer_id: u32,
}

impl Handshake {
    pub fn new(peer_id: u32) -> Self {
        Self { peer_id }
    }

    /// Serialize handshake to bytes
    /// Total: 18 + 10 + 4 = 32 bytes
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[..HANDSHAKE_HEADER.len()].copy_from_slice(HANDSHAKE_HEADER);
        buf[HANDSHAKE_LEN - 4..].copy_from_slice(&self.peer_id.to_be_bytes());
        buf
    }

    /// Deserialize handshake from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerError::MalformedHandshake(format!(
                "expected {} bytes, got {}",
                HANDSHAKE_LEN,
                data.len()
            )));
        }

        let (header, rest) = data.split_at(HANDSHAKE_HEADER.len());
        if header != HANDSHAKE_HEADER {
            return Err(PeerError::MalformedHandshake(
                "header mismatch".to_string(),
            ));
        }

        let (padding, id) = rest.split_at(PADDING_LEN);
        if padding.iter().any(|&b| b != 0) {
            return Err(PeerError::MalformedHandshake(
                "non-zero padding".to_string(),
            ));
        }

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(id);

        Ok(Handshake {
            peer_id: u32::from_be_bytes(id_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialization() {
        let handshake = Handshake::new(1001);
        let bytes = handshake.to_bytes();

        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..18], HANDSHAKE_HEADER);
        assert_eq!(&bytes[18..28], &[0u8; 10]);
        assert_eq!(&bytes[28..], &1001u32.to_be_bytes());

        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let bytes = Handshake::new(7).to_bytes();

        for len in [0, 31, 33] {
            let mut data = bytes.to_vec();
            data.resize(len, 0);
            assert!(matches!(
                Handshake::from_bytes(&data),
                Err(PeerError::MalformedHandshake(_))
            ));
        }
    }

    #[test]
    fn test_rejects_bad_header() {
        for i in 0..HANDSHAKE_HEADER.len() {
            let mut bytes = Handshake::new(7).to_bytes();
            bytes[i] ^= 0x20;
            assert!(matches!(
                Handshake::from_bytes(&bytes),
                Err(PeerError::MalformedHandshake(_))
            ));
        }
    }

    #[test]
    fn test_rejects_non_zero_padding() {
        for i in 18..28 {
            let mut bytes = Handshake::new(7).to_bytes();
            bytes[i] = 1;
            assert!(matches!(
                Handshake::from_bytes(&bytes),
                Err(PeerError::MalformedHandshake(_))
            ));
        }
    }
}
