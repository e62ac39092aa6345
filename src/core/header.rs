//! Native block header codec.
//!
//! The node's `get_block_template` delivers a hex-encoded header:
//!
//! ```text
//! version(1) || height(8 BE) || timestamp(8 BE) || nonce(8 BE)
//!   || extra_nonce(32) || tips_count(1) || tips_count × 32
//!   || txs_count(2 BE) || txs_count × 32 || miner(32)
//! ```
//!
//! From it the pool derives the immutable `work_hash` and the 112-byte
//! work blob miners grind nonces over. The nonce region sits at bytes
//! 40..48 of the work blob, big-endian.

use super::types::{Hash256, MINER_WORK_SIZE, NONCE_OFFSET};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("header has {0} trailing bytes")]
    TrailingBytes(usize),
}

/// A parsed native block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u8,
    pub height: u64,
    pub timestamp: u64,
    pub nonce: u64,
    pub extra_nonce: [u8; 32],
    pub tips: Vec<Hash256>,
    pub tx_hashes: Vec<Hash256>,
    pub miner: Hash256,
}

/// Cursor-style reader over the raw header bytes.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], HeaderError> {
        if self.pos + n > self.buf.len() {
            return Err(HeaderError::Truncated { need: self.pos + n, have: self.buf.len() });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, HeaderError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, HeaderError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u64_be(&mut self) -> Result<u64, HeaderError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn hash(&mut self) -> Result<Hash256, HeaderError> {
        let mut h = [0u8; 32];
        h.copy_from_slice(self.take(32)?);
        Ok(h)
    }
}

impl BlockHeader {
    /// Parse the native wire layout. Rejects truncated and oversized
    /// input; counts must match the bytes present.
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {
        let mut r = Reader { buf: bytes, pos: 0 };

        let version = r.u8()?;
        let height = r.u64_be()?;
        let timestamp = r.u64_be()?;
        let nonce = r.u64_be()?;
        let mut extra_nonce = [0u8; 32];
        extra_nonce.copy_from_slice(r.take(32)?);

        let tips_count = r.u8()? as usize;
        let mut tips = Vec::with_capacity(tips_count);
        for _ in 0..tips_count {
            tips.push(r.hash()?);
        }

        let txs_count = r.u16_be()? as usize;
        let mut tx_hashes = Vec::with_capacity(txs_count);
        for _ in 0..txs_count {
            tx_hashes.push(r.hash()?);
        }

        let miner = r.hash()?;

        if r.pos != bytes.len() {
            return Err(HeaderError::TrailingBytes(bytes.len() - r.pos));
        }

        Ok(BlockHeader { version, height, timestamp, nonce, extra_nonce, tips, tx_hashes, miner })
    }

    /// Serialize back to the native wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + 8 + 8 + 8 + 32 + 1 + self.tips.len() * 32 + 2 + self.tx_hashes.len() * 32 + 32,
        );
        out.push(self.version);
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.extra_nonce);
        out.push(self.tips.len() as u8);
        for tip in &self.tips {
            out.extend_from_slice(tip);
        }
        out.extend_from_slice(&(self.tx_hashes.len() as u16).to_be_bytes());
        for tx in &self.tx_hashes {
            out.extend_from_slice(tx);
        }
        out.extend_from_slice(&self.miner);
        out
    }

    /// The immutable part of the header a nonce cannot touch:
    /// `BLAKE3(version || height_be || BLAKE3(tips) || BLAKE3(txs))`.
    pub fn work_hash(&self) -> Hash256 {
        let mut tips_concat = Vec::with_capacity(self.tips.len() * 32);
        for tip in &self.tips {
            tips_concat.extend_from_slice(tip);
        }
        let mut txs_concat = Vec::with_capacity(self.tx_hashes.len() * 32);
        for tx in &self.tx_hashes {
            txs_concat.extend_from_slice(tx);
        }

        let mut input = Vec::with_capacity(1 + 8 + 32 + 32);
        input.push(self.version);
        input.extend_from_slice(&self.height.to_be_bytes());
        input.extend_from_slice(blake3::hash(&tips_concat).as_bytes());
        input.extend_from_slice(blake3::hash(&txs_concat).as_bytes());
        *blake3::hash(&input).as_bytes()
    }

    /// Assemble the 112-byte work blob miners grind over:
    /// `work_hash(32) || timestamp(8 BE) || nonce(8 BE) || extra_nonce(32) || miner(32)`.
    pub fn miner_work(&self) -> [u8; MINER_WORK_SIZE] {
        let mut work = [0u8; MINER_WORK_SIZE];
        work[0..32].copy_from_slice(&self.work_hash());
        work[32..40].copy_from_slice(&self.timestamp.to_be_bytes());
        work[40..48].copy_from_slice(&self.nonce.to_be_bytes());
        work[48..80].copy_from_slice(&self.extra_nonce);
        work[80..112].copy_from_slice(&self.miner);
        work
    }
}

/// Job id: the first 8 bytes of the work blob, hex-encoded.
pub fn job_id_of(work: &[u8; MINER_WORK_SIZE]) -> String {
    hex::encode(&work[..8])
}

/// Overwrite the nonce region of a work blob, big-endian.
pub fn splice_nonce(work: &mut [u8; MINER_WORK_SIZE], nonce: u64) {
    work[NONCE_OFFSET..NONCE_OFFSET + 8].copy_from_slice(&nonce.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            height: 12_345,
            timestamp: 1_700_000_000,
            nonce: 0,
            extra_nonce: [0xAB; 32],
            tips: vec![[0x11; 32], [0x22; 32]],
            tx_hashes: vec![[0x33; 32]],
            miner: [0x44; 32],
        }
    }

    #[test]
    fn test_parse_roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        let parsed = BlockHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_parse_truncated() {
        let bytes = sample_header().to_bytes();
        assert!(matches!(
            BlockHeader::parse(&bytes[..bytes.len() - 1]),
            Err(HeaderError::Truncated { .. })
        ));
        assert!(matches!(BlockHeader::parse(&[]), Err(HeaderError::Truncated { .. })));
    }

    #[test]
    fn test_parse_trailing_bytes() {
        let mut bytes = sample_header().to_bytes();
        bytes.push(0);
        assert!(matches!(BlockHeader::parse(&bytes), Err(HeaderError::TrailingBytes(1))));
    }

    #[test]
    fn test_work_hash_ignores_nonce() {
        let mut header = sample_header();
        let before = header.work_hash();
        header.nonce = 0xDEAD_BEEF;
        header.timestamp += 10;
        assert_eq!(header.work_hash(), before);
    }

    #[test]
    fn test_work_hash_tracks_height() {
        let mut header = sample_header();
        let before = header.work_hash();
        header.height += 1;
        assert_ne!(header.work_hash(), before);
    }

    #[test]
    fn test_miner_work_layout() {
        let header = sample_header();
        let work = header.miner_work();
        assert_eq!(&work[0..32], &header.work_hash());
        assert_eq!(&work[32..40], &header.timestamp.to_be_bytes());
        assert_eq!(&work[40..48], &header.nonce.to_be_bytes());
        assert_eq!(&work[48..80], &header.extra_nonce);
        assert_eq!(&work[80..112], &header.miner);
    }

    #[test]
    fn test_splice_nonce_is_big_endian() {
        let mut work = sample_header().miner_work();
        splice_nonce(&mut work, 0x0011_2233_4455_6677);
        assert_eq!(&work[40..48], &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
    }

    #[test]
    fn test_job_id_of() {
        let mut work = [0u8; MINER_WORK_SIZE];
        work[..8].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(job_id_of(&work), "0011223344556677");
    }
}
