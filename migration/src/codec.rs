// Copyright (c) 2024 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Byte layout of the ram section.
//!
//! Every record starts with a big endian u64 holding a page aligned offset
//! and flags in the low bits. The first record of a region on a channel is
//! followed by the length prefixed region name; later records of the same
//! region on that channel carry `RAM_SAVE_FLAG_CONTINUE` instead.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};

use crate::MigrationError;

pub const RAM_SAVE_FLAG_ZERO: u64 = 0x02;
pub const RAM_SAVE_FLAG_MEM_SIZE: u64 = 0x04;
pub const RAM_SAVE_FLAG_PAGE: u64 = 0x08;
pub const RAM_SAVE_FLAG_EOS: u64 = 0x10;
pub const RAM_SAVE_FLAG_CONTINUE: u64 = 0x20;
pub const RAM_SAVE_FLAG_XBZRLE: u64 = 0x40;
/// Reserved for the transport's own records.
pub const RAM_SAVE_FLAG_HOOK: u64 = 0x80;
pub const RAM_SAVE_FLAG_COMPRESS_PAGE: u64 = 0x100;

/// Flags a receiver accepts, anything else is a protocol violation.
pub const RAM_SAVE_FLAG_VALID_MASK: u64 = RAM_SAVE_FLAG_ZERO
    | RAM_SAVE_FLAG_MEM_SIZE
    | RAM_SAVE_FLAG_PAGE
    | RAM_SAVE_FLAG_EOS
    | RAM_SAVE_FLAG_CONTINUE
    | RAM_SAVE_FLAG_XBZRLE
    | RAM_SAVE_FLAG_HOOK
    | RAM_SAVE_FLAG_COMPRESS_PAGE;

pub const ENCODING_FLAG_XBZRLE: u8 = 0x1;
/// Trailer of every receive bitmap sent back during resume.
pub const RAMBLOCK_RECV_BITMAP_ENDING: u64 = 0x0123_4567_89ab_cdef;
/// Size of a record header without name.
pub const PAGE_HEADER_SIZE: u64 = 8;

const IO_BUF_SIZE: usize = 32 * 1024;

/// Logical stream carrying ram records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Background pages.
    Precopy = 0,
    /// Pages requested by the destination in postcopy.
    Postcopy = 1,
}

pub const RAM_CHANNEL_MAX: usize = 2;

impl Default for Channel {
    fn default() -> Self {
        Channel::Precopy
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Precopy => write!(f, "precopy"),
            Channel::Postcopy => write!(f, "postcopy"),
        }
    }
}

/// Split a record word into (offset, flags).
pub fn split_header(word: u64, target_page_size: u64) -> (u64, u64) {
    let mask = target_page_size - 1;
    (word & !mask, word & mask)
}

/// Append a record header to `out`, return the bytes appended.
///
/// # Arguments
///
/// * `name` - Name of the region the page belongs to.
/// * `offset` - Page offset with flags in the low bits.
/// * `cont` - The region was the last one named on this channel.
pub fn encode_page_header(out: &mut Vec<u8>, name: &str, offset: u64, cont: bool) -> u64 {
    let mut word = [0_u8; 8];
    if cont {
        BigEndian::write_u64(&mut word, offset | RAM_SAVE_FLAG_CONTINUE);
        out.extend_from_slice(&word);
        return PAGE_HEADER_SIZE;
    }
    BigEndian::write_u64(&mut word, offset);
    out.extend_from_slice(&word);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    PAGE_HEADER_SIZE + 1 + name.len() as u64
}

/// Output side of a migration channel.
///
/// Write errors are latched: once an error happens all later writes are
/// dropped and `get_error` reports the first failure.
pub struct MigrationStream {
    name: String,
    writer: Box<dyn Write + Send>,
    buf: Vec<u8>,
    error: Option<String>,
    /// Bytes handed to the stream, buffered or not.
    total: u64,
    /// Bytes allowed per rate window, 0 for unlimited.
    rate_limit_max: u64,
    rate_limit_used: u64,
}

impl MigrationStream {
    pub fn new(name: &str, writer: Box<dyn Write + Send>) -> Self {
        MigrationStream {
            name: name.to_string(),
            writer,
            buf: Vec::with_capacity(IO_BUF_SIZE),
            error: None,
            total: 0,
            rate_limit_max: 0,
            rate_limit_used: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put_buffer(&mut self, data: &[u8]) {
        if self.error.is_some() {
            return;
        }
        self.buf.extend_from_slice(data);
        self.total += data.len() as u64;
        self.rate_limit_used += data.len() as u64;
        if self.buf.len() >= IO_BUF_SIZE {
            self.fflush();
        }
    }

    pub fn put_byte(&mut self, v: u8) {
        self.put_buffer(&[v]);
    }

    pub fn put_be16(&mut self, v: u16) {
        let mut b = [0_u8; 2];
        BigEndian::write_u16(&mut b, v);
        self.put_buffer(&b);
    }

    pub fn put_be32(&mut self, v: u32) {
        let mut b = [0_u8; 4];
        BigEndian::write_u32(&mut b, v);
        self.put_buffer(&b);
    }

    pub fn put_be64(&mut self, v: u64) {
        let mut b = [0_u8; 8];
        BigEndian::write_u64(&mut b, v);
        self.put_buffer(&b);
    }

    /// Write a record header, return the bytes written.
    pub fn put_page_header(&mut self, name: &str, offset: u64, cont: bool) -> u64 {
        let mut hdr = Vec::with_capacity(PAGE_HEADER_SIZE as usize + 1 + name.len());
        let len = encode_page_header(&mut hdr, name, offset, cont);
        self.put_buffer(&hdr);
        len
    }

    /// Push buffered bytes to the channel, latching any error.
    pub fn fflush(&mut self) {
        if self.error.is_some() || self.buf.is_empty() {
            return;
        }
        let ret = self
            .writer
            .write_all(&self.buf)
            .and_then(|_| self.writer.flush());
        self.buf.clear();
        if let Err(e) = ret {
            self.set_error(e.to_string());
        }
    }

    pub fn set_error(&mut self, err: String) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Check the latched error of the stream.
    pub fn get_error(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(anyhow!(MigrationError::StreamErr(
                self.name.clone(),
                e.clone()
            ))),
            None => Ok(()),
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Total bytes handed to the stream.
    pub fn transferred(&self) -> u64 {
        self.total
    }

    /// Set the byte budget of one rate window.
    pub fn set_rate_limit(&mut self, bytes_per_window: u64) {
        self.rate_limit_max = bytes_per_window;
    }

    pub fn rate_limit_exceeded(&self) -> bool {
        self.error.is_some()
            || (self.rate_limit_max != 0 && self.rate_limit_used >= self.rate_limit_max)
    }

    pub fn rate_limit_reset(&mut self) {
        self.rate_limit_used = 0;
    }

    /// Account bytes sent through side channels against the budget.
    pub fn rate_limit_account(&mut self, len: u64) {
        self.rate_limit_used += len;
    }
}

/// Input side of a migration channel.
pub struct MigrationStreamReader {
    name: String,
    reader: Box<dyn Read + Send>,
    buf: Vec<u8>,
    pos: usize,
    error: Option<String>,
}

impl MigrationStreamReader {
    pub fn new(name: &str, reader: Box<dyn Read + Send>) -> Self {
        MigrationStreamReader {
            name: name.to_string(),
            reader,
            buf: Vec::new(),
            pos: 0,
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn fill(&mut self) -> Result<usize> {
        let mut tmp = vec![0_u8; IO_BUF_SIZE];
        loop {
            match self.reader.read(&mut tmp) {
                Ok(n) => {
                    self.buf.drain(..self.pos);
                    self.pos = 0;
                    self.buf.extend_from_slice(&tmp[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.latch(e.to_string())),
            }
        }
    }

    fn latch(&mut self, err: String) -> anyhow::Error {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
        anyhow!(MigrationError::StreamErr(self.name.clone(), err))
    }

    pub fn get_buffer(&mut self, out: &mut [u8]) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(anyhow!(MigrationError::StreamErr(
                self.name.clone(),
                e.clone()
            )));
        }
        let mut done = 0;
        while done < out.len() {
            if self.pos == self.buf.len() && self.fill()? == 0 {
                return Err(self.latch("unexpected end of stream".to_string()));
            }
            let n = std::cmp::min(out.len() - done, self.buf.len() - self.pos);
            out[done..done + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            done += n;
        }
        Ok(())
    }

    pub fn get_byte(&mut self) -> Result<u8> {
        let mut b = [0_u8; 1];
        self.get_buffer(&mut b)?;
        Ok(b[0])
    }

    pub fn get_be16(&mut self) -> Result<u16> {
        let mut b = [0_u8; 2];
        self.get_buffer(&mut b)?;
        Ok(BigEndian::read_u16(&b))
    }

    pub fn get_be32(&mut self) -> Result<u32> {
        let mut b = [0_u8; 4];
        self.get_buffer(&mut b)?;
        Ok(BigEndian::read_u32(&b))
    }

    pub fn get_be64(&mut self) -> Result<u64> {
        let mut b = [0_u8; 8];
        self.get_buffer(&mut b)?;
        Ok(BigEndian::read_u64(&b))
    }

    /// Read a length prefixed region name.
    pub fn get_name(&mut self) -> Result<String> {
        let len = self.get_byte()? as usize;
        let mut name = vec![0_u8; len];
        self.get_buffer(&mut name)?;
        String::from_utf8(name).map_err(|e| self.latch(e.to_string()))
    }

    /// Whether the peer closed the channel at a record boundary.
    pub fn at_eof(&mut self) -> Result<bool> {
        if self.pos < self.buf.len() {
            return Ok(false);
        }
        Ok(self.fill()? == 0)
    }

    pub fn get_error(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(anyhow!(MigrationError::StreamErr(
                self.name.clone(),
                e.clone()
            ))),
            None => Ok(()),
        }
    }
}

/// In-process byte pipe, reads return end of stream when it is drained.
#[derive(Clone, Default)]
pub struct MemoryPipe {
    data: Arc<Mutex<VecDeque<u8>>>,
}

impl MemoryPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written and not read yet.
    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Output stream appending to the pipe.
    pub fn writer(&self, name: &str) -> MigrationStream {
        MigrationStream::new(name, Box::new(self.clone()))
    }

    /// Input stream consuming the pipe.
    pub fn reader(&self, name: &str) -> MigrationStreamReader {
        MigrationStreamReader::new(name, Box::new(self.clone()))
    }
}

impl Write for MemoryPipe {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut data = self
            .data
            .lock()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        data.extend(buf.iter());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Read for MemoryPipe {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut data = self
            .data
            .lock()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let n = std::cmp::min(buf.len(), data.len());
        for (dst, src) in buf.iter_mut().zip(data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}
