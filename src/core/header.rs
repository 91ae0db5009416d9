use crate::core::{Error, Result};

pub const RECORD_HEADER_SIZE: usize = 32;
pub const RECORD_ALIGN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - 1;

pub const COMMIT_LEN_OFFSET: usize = 0;
pub const POINT_COUNT_OFFSET: usize = 4;
pub const SEQ_OFFSET: usize = 8;
pub const TIMESTAMP_OFFSET: usize = 16;
pub const CHECKSUM_OFFSET: usize = 24;
pub const FLAGS_OFFSET: usize = 28;

/// Fixed-size header written in front of every stored record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Commit word:
    /// 0 = no record (end of data)
    /// >0 = payload length + 1
    pub commit_len: u32,
    pub point_count: u32,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub checksum: u32,
    pub flags: u32,
}

impl RecordHeader {
    pub fn for_payload(
        payload: &[u8],
        point_count: u32,
        seq: u64,
        timestamp_ms: u64,
    ) -> Result<Self> {
        Ok(Self {
            commit_len: Self::commit_len_for_payload(payload.len())?,
            point_count,
            seq,
            timestamp_ms,
            checksum: Self::crc32(payload),
            flags: 0,
        })
    }

    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[COMMIT_LEN_OFFSET..4].copy_from_slice(&self.commit_len.to_le_bytes());
        buf[POINT_COUNT_OFFSET..8].copy_from_slice(&self.point_count.to_le_bytes());
        buf[SEQ_OFFSET..16].copy_from_slice(&self.seq.to_le_bytes());
        buf[TIMESTAMP_OFFSET..24].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf[CHECKSUM_OFFSET..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf[FLAGS_OFFSET..32].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(Error::Corrupt("record header truncated"));
        }
        Ok(Self {
            commit_len: read_u32(bytes, COMMIT_LEN_OFFSET),
            point_count: read_u32(bytes, POINT_COUNT_OFFSET),
            seq: read_u64(bytes, SEQ_OFFSET),
            timestamp_ms: read_u64(bytes, TIMESTAMP_OFFSET),
            checksum: read_u32(bytes, CHECKSUM_OFFSET),
            flags: read_u32(bytes, FLAGS_OFFSET),
        })
    }

    pub fn is_committed(&self) -> bool {
        self.commit_len != 0
    }

    pub fn payload_len(&self) -> Result<usize> {
        if self.commit_len == 0 {
            return Err(Error::Corrupt("commit length is zero"));
        }
        Ok((self.commit_len - 1) as usize)
    }

    /// Bytes this record occupies in a segment, header and alignment included.
    pub fn record_len(&self) -> Result<usize> {
        Ok(record_len_for_payload(self.payload_len()?))
    }

    pub fn commit_len_for_payload(payload_len: usize) -> Result<u32> {
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok((payload_len as u32) + 1)
    }

    pub fn crc32(payload: &[u8]) -> u32 {
        use crc32fast::Hasher;
        let mut hasher = Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn validate_crc(&self, payload: &[u8]) -> Result<()> {
        if Self::crc32(payload) == self.checksum {
            Ok(())
        } else {
            Err(Error::Corrupt("crc mismatch"))
        }
    }
}

pub fn record_len_for_payload(payload_len: usize) -> usize {
    align_up(RECORD_HEADER_SIZE + payload_len, RECORD_ALIGN)
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_known_payload() {
        let crc = RecordHeader::crc32(b"hello");
        assert_eq!(crc, 0x3610A686);
    }

    #[test]
    fn record_len_is_aligned() {
        assert_eq!(record_len_for_payload(0), 32);
        assert_eq!(record_len_for_payload(1), 40);
        assert_eq!(record_len_for_payload(8), 40);
        assert_eq!(record_len_for_payload(9), 48);
    }

    #[test]
    fn header_bytes_survive_reparse() {
        let header =
            RecordHeader::for_payload(b"cpu.load 1", 1, 42, 1_700_000_000_000).expect("header");
        let parsed = RecordHeader::from_bytes(&header.to_bytes()).expect("parse");
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_len().expect("len"), 10);
        parsed.validate_crc(b"cpu.load 1").expect("crc");
        assert!(parsed.validate_crc(b"cpu.load 2").is_err());
    }
}
