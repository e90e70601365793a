//! Save-state container and the byte-level helpers used by every component's
//! `save_state`/`load_state` pair.
//!
//! Container layout:
//! magic string, version byte, ROM checksum byte (header 0x14D), raw RGB
//! framebuffer, then the machine-state blob. The blob is gzip-compressed on
//! write; readers accept both gzip and raw blobs (sniffed by the gzip magic).

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::CoreError;

pub const SAVE_STATE_MAGIC: &[u8] = b"MegaBoy Emulator Save State";
pub const SAVE_STATE_VERSION: u8 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Append-only little-endian byte sink for machine state records.
#[derive(Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed byte run, for records whose size depends on the
    /// cartridge (RAM banks, ROM-derived data).
    pub fn blob(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.bytes(v);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a machine state blob. Every accessor fails with
/// [`CoreError::CorruptSaveState`] on truncation.
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(CoreError::CorruptSaveState("truncated state record"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, CoreError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, CoreError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32, CoreError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64, CoreError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bytes(&mut self, out: &mut [u8]) -> Result<(), CoreError> {
        out.copy_from_slice(self.take(out.len())?);
        Ok(())
    }

    pub fn blob(&mut self) -> Result<&'a [u8], CoreError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}

pub(crate) fn compress_blob(blob: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
    enc.write_all(blob)?;
    enc.finish()
}

pub(crate) fn decompress_blob(data: &[u8]) -> Result<Vec<u8>, CoreError> {
    if data.len() >= 2 && data[..2] == GZIP_MAGIC {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|_| CoreError::CorruptSaveState("bad gzip stream"))?;
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

/// Quick check whether a byte stream looks like one of our save states.
pub fn is_save_state(data: &[u8]) -> bool {
    data.len() > SAVE_STATE_MAGIC.len() && &data[..SAVE_STATE_MAGIC.len()] == SAVE_STATE_MAGIC
}
