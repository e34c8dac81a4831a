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

//! Incoming ram migration.

use std::io::Read;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, info};

use crate::codec::{
    split_header, Channel, MigrationStream, MigrationStreamReader, ENCODING_FLAG_XBZRLE,
    RAMBLOCK_RECV_BITMAP_ENDING, RAM_CHANNEL_MAX, RAM_SAVE_FLAG_COMPRESS_PAGE,
    RAM_SAVE_FLAG_CONTINUE, RAM_SAVE_FLAG_EOS, RAM_SAVE_FLAG_HOOK, RAM_SAVE_FLAG_MEM_SIZE,
    RAM_SAVE_FLAG_PAGE, RAM_SAVE_FLAG_XBZRLE, RAM_SAVE_FLAG_ZERO,
};
use crate::compress::{compress_bound, DecompressPool, DecompressTarget};
use crate::config::MigrationConfig;
use crate::multifd::MultifdReceiver;
use crate::postcopy::PostcopyTmpPage;
use crate::region::{find_region, RamRegion};
use crate::xbzrle::xbzrle_decode_buffer;
use crate::MigrationError;
use util::bitmap::Bitmap;
use util::unix::host_page_size;

/// Records handled between two yields of the loading thread.
const LOAD_YIELD_RECORDS: u64 = 32768;

const PAGE_RECORD_FLAGS: u64 =
    RAM_SAVE_FLAG_ZERO | RAM_SAVE_FLAG_PAGE | RAM_SAVE_FLAG_COMPRESS_PAGE | RAM_SAVE_FLAG_XBZRLE;

/// Receiver of records the source transport hook produced.
pub trait LoadHook: Send + Sync {
    fn load_hook(&self, stream: &mut MigrationStreamReader, flags: u64) -> Result<()>;
}

pub struct RamLoadState {
    config: MigrationConfig,
    target_page_bits: u32,
    target_page_size: u64,
    regions: Vec<Arc<RamRegion>>,
    /// Pages written so far, one bitmap per region.
    received: Arc<Vec<Bitmap>>,
    last_recv_block: [Option<usize>; RAM_CHANNEL_MAX],
    tmp_pages: Vec<PostcopyTmpPage>,
    decompress: Option<DecompressPool>,
    multifd: Option<MultifdReceiver>,
    load_hook: Option<Arc<dyn LoadHook>>,
    in_postcopy: bool,
    page_buf: Vec<u8>,
    xbzrle_buf: Vec<u8>,
}

impl RamLoadState {
    /// Create the destination of a session sending into `regions`.
    pub fn new(config: MigrationConfig, regions: Vec<Arc<RamRegion>>) -> Result<Self> {
        let target_page_bits = config.target_page_bits();
        let target_page_size = config.target_page_size;
        let regions: Vec<Arc<RamRegion>> =
            regions.into_iter().filter(|r| !r.is_ignored()).collect();
        let received = regions
            .iter()
            .map(|r| Bitmap::new(r.pages(target_page_bits) as usize))
            .collect();
        let max_page_size = regions
            .iter()
            .map(|r| r.page_size())
            .fold(target_page_size, std::cmp::max);

        let decompress = if config.compress.enabled {
            Some(
                DecompressPool::new(config.compress.decompress_threads as u8, target_page_size)
                    .with_context(|| "Failed to start decompression threads")?,
            )
        } else {
            None
        };

        Ok(RamLoadState {
            target_page_bits,
            target_page_size,
            regions,
            received: Arc::new(received),
            last_recv_block: [None; RAM_CHANNEL_MAX],
            tmp_pages: (0..RAM_CHANNEL_MAX)
                .map(|_| PostcopyTmpPage::new(max_page_size))
                .collect(),
            decompress,
            multifd: None,
            load_hook: None,
            in_postcopy: false,
            page_buf: vec![0_u8; target_page_size as usize],
            xbzrle_buf: vec![0_u8; target_page_size as usize],
            config,
        })
    }

    /// Receive pages from the parallel bulk channels too.
    pub fn with_multifd(mut self, readers: Vec<Box<dyn Read + Send>>) -> Result<Self> {
        self.multifd = Some(MultifdReceiver::new(
            readers,
            self.regions.clone(),
            self.received.clone(),
            self.target_page_size,
        )?);
        Ok(self)
    }

    pub fn with_load_hook(mut self, hook: Arc<dyn LoadHook>) -> Self {
        self.load_hook = Some(hook);
        self
    }

    /// The guest runs on the destination from now on, pages are placed a
    /// whole host page at a time.
    pub fn postcopy_run(&mut self) {
        info!("Ram load switched to postcopy");
        self.in_postcopy = true;
    }

    /// Load the records of one section from `stream`, up to its EOS.
    ///
    /// Returns false when the peer closed `stream` before a new record.
    pub fn load(&mut self, stream: &mut MigrationStreamReader, channel: Channel) -> Result<bool> {
        let ret = if self.in_postcopy {
            self.load_postcopy(stream, channel)
        } else {
            self.load_precopy(stream, channel)
        };
        if let Err(e) = &ret {
            error!("Failed to load ram from {}: {:?}", stream.name(), e);
        }
        ret
    }

    /// Whether the stream is closed, a close in the middle of a section is
    /// an error.
    fn stream_closed(stream: &mut MigrationStreamReader, records: u64) -> Result<bool> {
        if !stream.at_eof()? {
            return Ok(false);
        }
        if records != 0 {
            bail!(MigrationError::StreamErr(
                stream.name().to_string(),
                "end of stream in the middle of a section".to_string()
            ));
        }
        Ok(true)
    }

    fn load_precopy(&mut self, stream: &mut MigrationStreamReader, channel: Channel) -> Result<bool> {
        let invalid_flags = if self.decompress.is_none() {
            RAM_SAVE_FLAG_COMPRESS_PAGE
        } else {
            0
        };

        let mut records = 0_u64;
        loop {
            if Self::stream_closed(stream, records)? {
                return Ok(false);
            }
            records += 1;
            if records % LOAD_YIELD_RECORDS == 0 {
                thread::yield_now();
            }

            let (addr, flags) = split_header(stream.get_be64()?, self.target_page_size);
            if flags & invalid_flags != 0 {
                bail!(MigrationError::UnexpectedCompressPage);
            }

            if flags & PAGE_RECORD_FLAGS != 0 {
                let (idx, region) = self.region_from_stream(stream, flags, channel)?;
                self.check_offset(&region, addr)?;
                match flags & !RAM_SAVE_FLAG_CONTINUE {
                    RAM_SAVE_FLAG_ZERO => {
                        let ch = stream.get_byte()?;
                        // Skip the write to keep untouched memory unallocated.
                        if ch != 0 || !region.is_zero(addr, self.target_page_size)? {
                            region.fill(addr, ch, self.target_page_size)?;
                        }
                    }
                    RAM_SAVE_FLAG_PAGE => {
                        stream.get_buffer(&mut self.page_buf)?;
                        region.write(addr, &self.page_buf)?;
                    }
                    RAM_SAVE_FLAG_COMPRESS_PAGE => {
                        let data = self.read_compressed(stream)?;
                        if let Some(pool) = self.decompress.as_ref() {
                            pool.decompress_page(data, DecompressTarget::Region(region.clone(), addr));
                        }
                    }
                    RAM_SAVE_FLAG_XBZRLE => self.load_xbzrle(stream, &region, addr)?,
                    _ => bail!(MigrationError::UnknownFlags(flags)),
                }
                self.received[idx].set((addr >> self.target_page_bits) as usize)?;
                continue;
            }

            match flags {
                RAM_SAVE_FLAG_MEM_SIZE => self.load_mem_size(stream, addr)?,
                RAM_SAVE_FLAG_EOS => {
                    if let Some(multifd) = self.multifd.as_mut() {
                        multifd.sync_main()?;
                    }
                    break;
                }
                RAM_SAVE_FLAG_HOOK => match self.load_hook.as_ref() {
                    Some(hook) => hook.load_hook(stream, addr)?,
                    None => bail!(MigrationError::UnknownFlags(flags)),
                },
                _ => bail!(MigrationError::UnknownFlags(flags)),
            }
        }

        self.wait_for_decompress_done()?;
        Ok(true)
    }

    fn load_postcopy(&mut self, stream: &mut MigrationStreamReader, channel: Channel) -> Result<bool> {
        let ch_idx = channel as usize;
        let mut records = 0_u64;
        loop {
            if Self::stream_closed(stream, records)? {
                return Ok(false);
            }
            records += 1;
            if records % LOAD_YIELD_RECORDS == 0 {
                thread::yield_now();
            }

            let (addr, flags) = split_header(stream.get_be64()?, self.target_page_size);
            let mut place_needed = false;
            if flags & (RAM_SAVE_FLAG_ZERO | RAM_SAVE_FLAG_PAGE | RAM_SAVE_FLAG_COMPRESS_PAGE) != 0 {
                let (idx, region) = self.region_from_stream(stream, flags, channel)?;
                self.check_offset(&region, addr)?;
                let single_page = region.page_size() == self.target_page_size;
                let tps = self.target_page_size as usize;
                let tmp = &mut self.tmp_pages[ch_idx];
                let (buf_off, complete) = tmp.add(idx, &region, addr, self.target_page_size)?;
                place_needed = complete;

                match flags & !RAM_SAVE_FLAG_CONTINUE {
                    RAM_SAVE_FLAG_ZERO => {
                        let ch = stream.get_byte()?;
                        if ch != 0 || !single_page {
                            tmp.buf.lock().unwrap()[buf_off..buf_off + tps].fill(ch);
                        }
                        if ch != 0 {
                            tmp.all_zero = false;
                        }
                    }
                    RAM_SAVE_FLAG_PAGE => {
                        tmp.all_zero = false;
                        stream.get_buffer(&mut tmp.buf.lock().unwrap()[buf_off..buf_off + tps])?;
                    }
                    RAM_SAVE_FLAG_COMPRESS_PAGE => {
                        tmp.all_zero = false;
                        let data = Self::read_compressed_data(stream, self.target_page_size)?;
                        let target = DecompressTarget::Buffer(tmp.buf.clone(), buf_off);
                        match self.decompress.as_ref() {
                            Some(pool) => pool.decompress_page(data, target),
                            None => bail!(MigrationError::UnexpectedCompressPage),
                        }
                    }
                    _ => bail!(MigrationError::UnknownFlags(flags)),
                }
            } else {
                match flags {
                    RAM_SAVE_FLAG_EOS => break,
                    _ => bail!(MigrationError::UnknownFlags(flags)),
                }
            }

            if place_needed {
                self.place_host_page(ch_idx)?;
            }
        }
        Ok(true)
    }

    /// Write the assembled host page of channel `ch_idx` into its region.
    fn place_host_page(&mut self, ch_idx: usize) -> Result<()> {
        self.wait_for_decompress_done()?;
        let tmp = &mut self.tmp_pages[ch_idx];
        let (idx, host_offset) = match tmp.host {
            Some(host) => host,
            None => return Ok(()),
        };
        let region = &self.regions[idx];
        let page_size = region.page_size();
        if tmp.all_zero {
            region.fill(host_offset, 0, page_size)?;
        } else {
            region.write(host_offset, &tmp.buf.lock().unwrap()[..page_size as usize])?;
        }
        self.received[idx].set_range(
            (host_offset >> self.target_page_bits) as usize,
            (page_size >> self.target_page_bits) as usize,
        )?;
        tmp.reset();
        Ok(())
    }

    fn region_from_stream(
        &mut self,
        stream: &mut MigrationStreamReader,
        flags: u64,
        channel: Channel,
    ) -> Result<(usize, Arc<RamRegion>)> {
        let ch_idx = channel as usize;
        if flags & RAM_SAVE_FLAG_CONTINUE != 0 {
            return match self.last_recv_block[ch_idx] {
                Some(idx) => Ok((idx, self.regions[idx].clone())),
                None => Err(anyhow!(MigrationError::StreamErr(
                    stream.name().to_string(),
                    "continued record without a region".to_string()
                ))),
            };
        }

        let name = stream.get_name()?;
        let (idx, region) = find_region(&self.regions, &name)
            .ok_or_else(|| anyhow!(MigrationError::UnknownRegion(name.clone())))?;
        self.last_recv_block[ch_idx] = Some(idx);
        Ok((idx, region.clone()))
    }

    fn check_offset(&self, region: &RamRegion, addr: u64) -> Result<()> {
        let valid = addr
            .checked_add(self.target_page_size - 1)
            .map_or(false, |end| region.contains(end));
        if !valid {
            bail!(MigrationError::IllegalOffset(region.name().to_string(), addr));
        }
        Ok(())
    }

    fn load_mem_size(&mut self, stream: &mut MigrationStreamReader, total: u64) -> Result<()> {
        let check_page_size = self.config.postcopy.enabled;
        let host_page = host_page_size();
        let mut remaining = total;
        while remaining != 0 {
            let name = stream.get_name()?;
            let length = stream.get_be64()?;
            let (_, region) = find_region(&self.regions, &name)
                .ok_or_else(|| anyhow!(MigrationError::UnknownRegion(name.clone())))?;
            if length != region.used_length() {
                bail!(MigrationError::RegionLengthMismatch(
                    name,
                    length,
                    region.used_length()
                ));
            }
            if check_page_size && region.page_size() != host_page {
                let remote = stream.get_be64()?;
                if remote != region.page_size() {
                    bail!(MigrationError::RegionPageSizeMismatch(
                        name,
                        remote,
                        region.page_size()
                    ));
                }
            }
            remaining = remaining.checked_sub(length).ok_or_else(|| {
                anyhow!(MigrationError::TotalSizeMismatch(total, total - remaining + length))
            })?;
            debug!("Incoming ram region {} with {:#x} bytes", name, length);
        }
        Ok(())
    }

    fn read_compressed(&self, stream: &mut MigrationStreamReader) -> Result<Vec<u8>> {
        Self::read_compressed_data(stream, self.target_page_size)
    }

    fn read_compressed_data(stream: &mut MigrationStreamReader, page_size: u64) -> Result<Vec<u8>> {
        let len = stream.get_be32()? as u64;
        if len == 0 || len > compress_bound(page_size) {
            bail!(MigrationError::InvalidCompressLen(len));
        }
        let mut data = vec![0_u8; len as usize];
        stream.get_buffer(&mut data)?;
        Ok(data)
    }

    fn load_xbzrle(&mut self, stream: &mut MigrationStreamReader, region: &RamRegion, addr: u64) -> Result<()> {
        let encoding = stream.get_byte()?;
        if encoding != ENCODING_FLAG_XBZRLE {
            bail!(MigrationError::XbzrleLoadErr(format!(
                "unknown encoding flag {:#x}",
                encoding
            )));
        }
        let len = stream.get_be16()? as usize;
        if len as u64 > self.target_page_size {
            bail!(MigrationError::XbzrleLoadErr(format!(
                "data length {} exceeds the page size",
                len
            )));
        }
        stream.get_buffer(&mut self.xbzrle_buf[..len])?;

        region.read(addr, &mut self.page_buf)?;
        xbzrle_decode_buffer(&self.xbzrle_buf[..len], &mut self.page_buf)
            .map_err(|e| anyhow!(MigrationError::XbzrleLoadErr(e.to_string())))?;
        region.write(addr, &self.page_buf)
    }

    fn wait_for_decompress_done(&self) -> Result<()> {
        match self.decompress.as_ref() {
            Some(pool) => pool.wait_for_decompress_done(),
            None => Ok(()),
        }
    }

    /// The source dropped the content of `len` bytes at `start` of `name`.
    pub fn discard_range(&mut self, name: &str, start: u64, len: u64) -> Result<()> {
        let (idx, region) = find_region(&self.regions, name)
            .ok_or_else(|| anyhow!(MigrationError::UnknownRegion(name.to_string())))?;
        if start % self.target_page_size != 0 || len % self.target_page_size != 0 {
            bail!(MigrationError::Unaligned(
                format!("discard range of {}", name),
                start,
                self.target_page_size
            ));
        }
        region.discard(start, len)?;
        self.received[idx].clear_range(
            (start >> self.target_page_bits) as usize,
            (len >> self.target_page_bits) as usize,
        )?;
        Ok(())
    }

    /// Whether the page at `offset` of `name` was received.
    pub fn is_received(&self, name: &str, offset: u64) -> bool {
        find_region(&self.regions, name).map_or(false, |(idx, _)| {
            self.received[idx]
                .contain((offset >> self.target_page_bits) as usize)
                .unwrap_or(false)
        })
    }

    /// Send the receive bitmap of every region back to a resuming source.
    pub fn recv_bitmap_send_all(&self, stream: &mut MigrationStream) -> Result<()> {
        for (idx, region) in self.regions.iter().enumerate() {
            let bits = self.received[idx].to_le_bytes();
            stream.put_byte(region.name().len() as u8);
            stream.put_buffer(region.name().as_bytes());
            stream.put_be64(bits.len() as u64);
            stream.put_buffer(&bits);
            stream.put_be64(RAMBLOCK_RECV_BITMAP_ENDING);
        }
        stream.fflush();
        stream.get_error()
    }

    pub fn cleanup(&mut self) {
        if let Some(mut pool) = self.decompress.take() {
            pool.cleanup();
        }
        if let Some(mut multifd) = self.multifd.take() {
            multifd.cleanup();
        }
        for tmp in self.tmp_pages.iter_mut() {
            tmp.reset();
        }
        self.last_recv_block = [None; RAM_CHANNEL_MAX];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MemoryPipe;

    const PAGE: u64 = 4096;

    fn dest(config: MigrationConfig) -> (RamLoadState, Arc<RamRegion>) {
        let region = RamRegion::new("pc.ram", 8 * PAGE, PAGE).unwrap();
        (RamLoadState::new(config, vec![region.clone()]).unwrap(), region)
    }

    fn load_all(state: &mut RamLoadState, pipe: &MemoryPipe) -> Result<()> {
        let mut r = pipe.reader("precopy");
        while state.load(&mut r, Channel::Precopy)? {}
        Ok(())
    }

    #[test]
    fn test_load_zero_and_raw_pages() {
        let (mut state, region) = dest(MigrationConfig::default());
        region.fill(PAGE, 0xff, PAGE).unwrap();

        let pipe = MemoryPipe::new();
        let mut w = pipe.writer("precopy");
        w.put_be64(8 * PAGE | RAM_SAVE_FLAG_MEM_SIZE);
        w.put_byte(6);
        w.put_buffer(b"pc.ram");
        w.put_be64(8 * PAGE);
        w.put_be64(RAM_SAVE_FLAG_EOS);
        w.put_page_header("pc.ram", PAGE | RAM_SAVE_FLAG_ZERO, false);
        w.put_byte(0);
        w.put_page_header("pc.ram", 2 * PAGE | RAM_SAVE_FLAG_PAGE, true);
        w.put_buffer(&[7_u8; PAGE as usize]);
        w.put_be64(RAM_SAVE_FLAG_EOS);
        w.fflush();

        load_all(&mut state, &pipe).unwrap();
        assert!(region.is_zero(PAGE, PAGE).unwrap());
        let mut buf = vec![0_u8; PAGE as usize];
        region.read(2 * PAGE, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 7));
        assert!(state.is_received("pc.ram", PAGE));
        assert!(state.is_received("pc.ram", 2 * PAGE));
        assert!(!state.is_received("pc.ram", 0));
    }

    fn load_one(config: MigrationConfig, build: impl FnOnce(&mut MigrationStream)) -> Result<()> {
        let (mut state, _) = dest(config);
        let pipe = MemoryPipe::new();
        let mut w = pipe.writer("precopy");
        build(&mut w);
        w.put_be64(RAM_SAVE_FLAG_EOS);
        w.fflush();
        load_all(&mut state, &pipe)
    }

    #[test]
    fn test_load_rejects_bad_streams() {
        // Region list mismatches.
        assert!(load_one(MigrationConfig::default(), |w| {
            w.put_be64(PAGE | RAM_SAVE_FLAG_MEM_SIZE);
            w.put_byte(3);
            w.put_buffer(b"rom");
            w.put_be64(PAGE);
        })
        .is_err());
        assert!(load_one(MigrationConfig::default(), |w| {
            w.put_be64(4 * PAGE | RAM_SAVE_FLAG_MEM_SIZE);
            w.put_byte(6);
            w.put_buffer(b"pc.ram");
            w.put_be64(4 * PAGE);
        })
        .is_err());
        // Page beyond the region.
        assert!(load_one(MigrationConfig::default(), |w| {
            w.put_page_header("pc.ram", 8 * PAGE | RAM_SAVE_FLAG_ZERO, false);
            w.put_byte(0);
        })
        .is_err());
        // Continued record with no region named before.
        assert!(load_one(MigrationConfig::default(), |w| {
            w.put_page_header("pc.ram", RAM_SAVE_FLAG_ZERO, true);
            w.put_byte(0);
        })
        .is_err());
        // Compressed page while compression is off.
        assert!(load_one(MigrationConfig::default(), |w| {
            w.put_page_header("pc.ram", RAM_SAVE_FLAG_COMPRESS_PAGE, false);
            w.put_be32(4);
            w.put_buffer(&[0_u8; 4]);
        })
        .is_err());
        // Hook record without a hook.
        assert!(load_one(MigrationConfig::default(), |w| {
            w.put_be64(RAM_SAVE_FLAG_HOOK);
        })
        .is_err());
        // Bad xbzrle encoding flag and oversized delta.
        assert!(load_one(MigrationConfig::default(), |w| {
            w.put_page_header("pc.ram", RAM_SAVE_FLAG_XBZRLE, false);
            w.put_byte(2);
            w.put_be16(1);
            w.put_byte(0);
        })
        .is_err());
        assert!(load_one(MigrationConfig::default(), |w| {
            w.put_page_header("pc.ram", RAM_SAVE_FLAG_XBZRLE, false);
            w.put_byte(ENCODING_FLAG_XBZRLE);
            w.put_be16(PAGE as u16 + 1);
        })
        .is_err());

        let mut config = MigrationConfig::default();
        config.compress.enabled = true;
        assert!(load_one(config, |w| {
            w.put_page_header("pc.ram", RAM_SAVE_FLAG_COMPRESS_PAGE, false);
            w.put_be32(0);
        })
        .is_err());
    }

    #[test]
    fn test_truncated_section() {
        let (mut state, _) = dest(MigrationConfig::default());
        let pipe = MemoryPipe::new();
        let mut w = pipe.writer("precopy");
        w.put_page_header("pc.ram", RAM_SAVE_FLAG_ZERO, false);
        w.put_byte(0);
        w.fflush();
        assert!(load_all(&mut state, &pipe).is_err());
    }

    #[test]
    fn test_postcopy_places_whole_host_pages() {
        let huge = RamRegion::new("huge.ram", 8 * PAGE, 4 * PAGE).unwrap();
        huge.fill(0, 0xee, 8 * PAGE).unwrap();
        let mut state = RamLoadState::new(MigrationConfig::default(), vec![huge.clone()]).unwrap();
        state.postcopy_run();

        let pipe = MemoryPipe::new();
        let mut w = pipe.writer("postcopy");
        // Host page 0 is zero, host page 1 has one raw target page.
        for page in 0..4 {
            w.put_page_header("huge.ram", page * PAGE | RAM_SAVE_FLAG_ZERO, page != 0);
            w.put_byte(0);
        }
        w.put_page_header("huge.ram", 4 * PAGE | RAM_SAVE_FLAG_ZERO, true);
        w.put_byte(0);
        w.put_page_header("huge.ram", 5 * PAGE | RAM_SAVE_FLAG_PAGE, true);
        w.put_buffer(&[3_u8; PAGE as usize]);
        w.put_be64(RAM_SAVE_FLAG_EOS);
        w.fflush();

        let mut r = pipe.reader("postcopy");
        assert!(state.load(&mut r, Channel::Postcopy).unwrap());
        assert!(huge.is_zero(0, 4 * PAGE).unwrap());
        assert!(state.is_received("huge.ram", 3 * PAGE));
        // The second host page is still incomplete.
        assert!(!state.is_received("huge.ram", 5 * PAGE));
        let mut buf = vec![0_u8; PAGE as usize];
        huge.read(5 * PAGE, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xee));
    }

    #[test]
    fn test_postcopy_non_same_host_page() {
        let huge = RamRegion::new("huge.ram", 8 * PAGE, 4 * PAGE).unwrap();
        let mut state = RamLoadState::new(MigrationConfig::default(), vec![huge]).unwrap();
        state.postcopy_run();

        let pipe = MemoryPipe::new();
        let mut w = pipe.writer("postcopy");
        w.put_page_header("huge.ram", RAM_SAVE_FLAG_ZERO, false);
        w.put_byte(0);
        w.put_page_header("huge.ram", 4 * PAGE | RAM_SAVE_FLAG_ZERO, true);
        w.put_byte(0);
        w.fflush();
        let mut r = pipe.reader("postcopy");
        assert!(state.load(&mut r, Channel::Postcopy).is_err());
    }

    #[test]
    fn test_recv_bitmap_and_discard() {
        let (mut state, _) = dest(MigrationConfig::default());
        let pipe = MemoryPipe::new();
        let mut w = pipe.writer("precopy");
        for page in 0..3 {
            w.put_page_header("pc.ram", page * PAGE | RAM_SAVE_FLAG_ZERO, page != 0);
            w.put_byte(1);
        }
        w.put_be64(RAM_SAVE_FLAG_EOS);
        w.fflush();
        load_all(&mut state, &pipe).unwrap();

        state.discard_range("pc.ram", PAGE, PAGE).unwrap();
        assert!(!state.is_received("pc.ram", PAGE));
        assert!(state.discard_range("pc.ram", 1, PAGE).is_err());

        let rp = MemoryPipe::new();
        let mut out = rp.writer("return-path");
        state.recv_bitmap_send_all(&mut out).unwrap();
        let mut r = rp.reader("return-path");
        assert_eq!(r.get_name().unwrap(), "pc.ram");
        assert_eq!(r.get_be64().unwrap(), 8);
        let mut bits = [0_u8; 8];
        r.get_buffer(&mut bits).unwrap();
        assert_eq!(bits[0], 0b101);
        assert_eq!(r.get_be64().unwrap(), RAMBLOCK_RECV_BITMAP_ENDING);
    }

    struct Rdma {
        tag: std::sync::Mutex<Option<u32>>,
    }

    impl LoadHook for Rdma {
        fn load_hook(&self, stream: &mut MigrationStreamReader, _flags: u64) -> Result<()> {
            *self.tag.lock().unwrap() = Some(stream.get_be32()?);
            Ok(())
        }
    }

    fn hook_stream() -> MemoryPipe {
        let pipe = MemoryPipe::new();
        let mut w = pipe.writer("precopy");
        w.put_be64(RAM_SAVE_FLAG_HOOK);
        w.put_be32(0xabcd);
        w.put_be64(RAM_SAVE_FLAG_EOS);
        w.fflush();
        pipe
    }

    #[test]
    fn test_hook_records() {
        let (mut state, _) = dest(MigrationConfig::default());
        assert!(load_all(&mut state, &hook_stream()).is_err());

        let hook = Arc::new(Rdma {
            tag: std::sync::Mutex::new(None),
        });
        let (state, _) = dest(MigrationConfig::default());
        let mut state = state.with_load_hook(hook.clone());
        load_all(&mut state, &hook_stream()).unwrap();
        assert_eq!(*hook.tag.lock().unwrap(), Some(0xabcd));
    }
}
