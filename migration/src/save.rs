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

//! Classification of one dirty target page into a record.
//!
//! In order: transport hook, parallel compression (zero pages are found by
//! the workers), zero page, parallel bulk channel, delta against the cache,
//! raw page.

use std::sync::Arc;

use anyhow::Result;
use log::trace;

use crate::codec::{
    ENCODING_FLAG_XBZRLE, PAGE_HEADER_SIZE, RAM_SAVE_FLAG_PAGE, RAM_SAVE_FLAG_XBZRLE,
    RAM_SAVE_FLAG_ZERO,
};
use crate::compress::{CompressSubmit, CompressedRecord};
use crate::region::{buffer_is_zero, RamRegion};
use crate::scanner::PageSearchStatus;
use crate::session::RamSaveState;
use crate::xbzrle::xbzrle_encode_buffer;

/// Transport able to move pages by itself.
pub trait SaveHook: Send + Sync {
    /// Send `size` bytes at `offset` of `region`.
    ///
    /// Returns None when the transport leaves the page to the stream,
    /// otherwise the bytes it sent.
    fn save_page(&self, region: &RamRegion, offset: u64, size: u64) -> Option<Result<u64>>;
}

impl RamSaveState {
    /// Send the target page at `pss`, return the pages sent.
    pub(crate) fn save_target_page(
        &mut self,
        pss: &PageSearchStatus,
        region: &Arc<RamRegion>,
    ) -> Result<u64> {
        let idx = pss.region;
        let offset = pss.page << self.target_page_bits;

        if let Some(hook) = self.save_hook.clone() {
            if let Some(ret) = hook.save_page(region, offset, self.target_page_size) {
                self.counters.hook_bytes += ret?;
                self.counters.normal_pages += 1;
                return Ok(1);
            }
        }

        if self.save_compress_page(idx, region, offset) {
            return Ok(1);
        }

        region.read(offset, &mut self.page_buf)?;
        if buffer_is_zero(&self.page_buf) {
            self.save_zero_page(idx, region, offset);
            if !self.compress_active() {
                self.xbzrle_cache_zero_page(idx, offset);
            }
            return Ok(1);
        }

        // A whole host page must land at once in postcopy.
        if !self.in_postcopy {
            if let Some(multifd) = self.multifd.as_mut() {
                multifd.queue_page(idx, region, offset)?;
                self.channels
                    .stream()
                    .rate_limit_account(self.target_page_size);
                self.counters.normal_pages += 1;
                return Ok(1);
            }
        }

        if self.xbzrle_enabled && !self.in_postcopy {
            if let Some(pages) = self.save_xbzrle_page(idx, region, offset) {
                return Ok(pages);
            }
        }
        self.save_normal_page(idx, region, offset);
        Ok(1)
    }

    pub(crate) fn compress_active(&self) -> bool {
        self.compress.is_some() && !self.xbzrle_enabled && !self.last_stage && !self.in_postcopy
    }

    /// Hand the page to a compression slot. Records already queued name
    /// the last sent region, so a region change flushes them first and the
    /// page goes out uncompressed to name its region.
    fn save_compress_page(&mut self, idx: usize, region: &Arc<RamRegion>, offset: u64) -> bool {
        if !self.compress_active() {
            return false;
        }
        if self.channels.last_sent_block() != Some(idx) {
            self.flush_compressed_data();
            return false;
        }

        let submit = match self.compress.as_ref() {
            Some(pool) => pool.compress_page(region, offset),
            None => return false,
        };
        match submit {
            CompressSubmit::Queued(record) => {
                self.emit_compressed_record(record);
                true
            }
            CompressSubmit::Busy => {
                self.counters.compress.busy += 1;
                false
            }
        }
    }

    fn emit_compressed_record(&mut self, record: CompressedRecord) {
        if let Some(e) = record.error {
            self.channels.stream().set_error(e);
            return;
        }
        if record.data.is_empty() {
            return;
        }
        self.channels.stream().put_buffer(&record.data);
        if record.zero_page {
            self.counters.zero_pages += 1;
        } else {
            self.counters.compress.pages += 1;
            self.counters.compress.compressed_size += record.data.len() as u64 - PAGE_HEADER_SIZE;
        }
    }

    /// Wait for every compression slot and append their records.
    pub(crate) fn flush_compressed_data(&mut self) {
        let records = match self.compress.as_ref() {
            Some(pool) => pool.flush(),
            None => return,
        };
        for record in records {
            self.emit_compressed_record(record);
        }
    }

    fn save_zero_page(&mut self, idx: usize, region: &RamRegion, offset: u64) {
        self.channels
            .put_page_header(idx, region.name(), offset | RAM_SAVE_FLAG_ZERO);
        self.channels.stream().put_byte(0);
        self.counters.zero_pages += 1;
    }

    /// Later deltas of a page sent as zero are computed against zeros.
    fn xbzrle_cache_zero_page(&mut self, idx: usize, offset: u64) {
        if !self.xbzrle_enabled || self.in_postcopy {
            return;
        }
        if let Some(cache) = self.xbzrle_cache.as_ref() {
            let addr = self.region_base[idx] + offset;
            let age = self.tracker.dirty_sync_count();
            cache.lock().unwrap().insert(addr, &self.zero_page, age);
        }
    }

    /// Send the page as a delta of its cached content.
    ///
    /// Returns None if the page has to be sent raw.
    fn save_xbzrle_page(&mut self, idx: usize, region: &RamRegion, offset: u64) -> Option<u64> {
        let cache = self.xbzrle_cache.clone()?;
        let mut cache = cache.lock().unwrap();
        let addr = self.region_base[idx] + offset;
        let age = self.tracker.dirty_sync_count();

        if !cache.is_cached(addr, age) {
            self.counters.xbzrle.cache_miss += 1;
            // The final pass must not leave a cache the guest never sees.
            if !self.last_stage && !cache.insert(addr, &self.page_buf, age) {
                trace!("Failed to cache page {:#x}", addr);
            }
            return None;
        }
        self.counters.xbzrle.cache_hit += 1;

        let prev = cache.get_mut(addr)?;
        let encoded = xbzrle_encode_buffer(prev, &self.page_buf, &mut self.encoded_buf);
        if encoded == Some(0) {
            trace!("Page {:#x} unchanged since it was cached", addr);
            return Some(1);
        }
        // The cache must hold what the destination gets, raw page included.
        if !self.last_stage {
            prev.copy_from_slice(&self.page_buf);
        }
        drop(cache);

        let encoded_len = match encoded {
            Some(len) => len,
            None => {
                self.counters.xbzrle.overflow += 1;
                self.counters.xbzrle.pages += 1;
                self.counters.xbzrle.bytes += self.target_page_size;
                return None;
            }
        };

        let mut bytes = self
            .channels
            .put_page_header(idx, region.name(), offset | RAM_SAVE_FLAG_XBZRLE);
        let stream = self.channels.stream();
        stream.put_byte(ENCODING_FLAG_XBZRLE);
        stream.put_be16(encoded_len as u16);
        stream.put_buffer(&self.encoded_buf[..encoded_len]);
        bytes += encoded_len as u64 + 1 + 2;
        self.counters.xbzrle.pages += 1;
        self.counters.xbzrle.bytes += bytes - PAGE_HEADER_SIZE;
        Some(1)
    }

    fn save_normal_page(&mut self, idx: usize, region: &RamRegion, offset: u64) {
        self.channels
            .put_page_header(idx, region.name(), offset | RAM_SAVE_FLAG_PAGE);
        self.channels.stream().put_buffer(&self.page_buf);
        self.counters.normal_pages += 1;
    }
}
