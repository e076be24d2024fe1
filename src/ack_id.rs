use std::fmt;

use crate::{Error, Result};

const TOKEN_LEN: usize = 32;
const CRC_OFFSET: usize = 28;

/// Opaque, single-use token authorizing ack or deadline changes for one delivery.
///
/// Clients only ever see the hex string; the broker decodes it back into an
/// [`AckToken`]. The embedded checksum rejects truncated or mangled ids.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckId(String);

impl AckId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn decode(&self) -> Result<AckToken> {
        AckToken::decode(&self.0).ok_or_else(|| Error::InvalidAckId(self.0.clone()))
    }
}

impl fmt::Debug for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckId({})", self.0)
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AckId {
    fn from(value: String) -> Self {
        AckId(value)
    }
}

impl From<&str> for AckId {
    fn from(value: &str) -> Self {
        AckId(value.to_string())
    }
}

/// Decoded contents of an [`AckId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AckToken {
    /// Identifies one lifetime of a subscription; a recreated subscription
    /// with the same name never accepts ids from its predecessor.
    pub incarnation: u32,
    pub offset: u64,
    /// Subscription-wide delivery serial, unique per lease grant.
    pub serial: u64,
    pub fencing_token: u64,
}

impl AckToken {
    pub fn encode(&self) -> AckId {
        let mut buf = [0u8; TOKEN_LEN];
        buf[0..4].copy_from_slice(&self.incarnation.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..20].copy_from_slice(&self.serial.to_le_bytes());
        buf[20..28].copy_from_slice(&self.fencing_token.to_le_bytes());
        let crc = crc32(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());

        let mut out = String::with_capacity(TOKEN_LEN * 2);
        for byte in buf {
            out.push_str(&format!("{byte:02x}"));
        }
        AckId(out)
    }

    fn decode(text: &str) -> Option<Self> {
        if text.len() != TOKEN_LEN * 2 || !text.is_ascii() {
            return None;
        }
        let mut buf = [0u8; TOKEN_LEN];
        for (idx, byte) in buf.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[idx * 2..idx * 2 + 2], 16).ok()?;
        }
        let crc = u32::from_le_bytes(buf[CRC_OFFSET..].try_into().ok()?);
        if crc != crc32(&buf[..CRC_OFFSET]) {
            return None;
        }
        Some(Self {
            incarnation: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            offset: u64::from_le_bytes(buf[4..12].try_into().ok()?),
            serial: u64::from_le_bytes(buf[12..20].try_into().ok()?),
            fencing_token: u64::from_le_bytes(buf[20..28].try_into().ok()?),
        })
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
