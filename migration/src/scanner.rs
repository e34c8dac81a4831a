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

//! Picking the next page to send.
//!
//! Per step: the oldest fault request, then the preempted huge page, then
//! the background scan from the persistent cursor. A round is complete when
//! the scan gets back to where it started without finding a dirty page.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use log::{error, trace};

use crate::codec::Channel;
use crate::region::RamRegion;
use crate::session::RamSaveState;
use crate::MigrationError;
use util::num_ops::round_up;

/// Cursor of one scan step.
#[derive(Copy, Clone, Debug, Default)]
pub struct PageSearchStatus {
    /// Index of the region in the dirty tracker.
    pub region: usize,
    pub page: u64,
    /// Wrapped around the last region at least once.
    pub complete_round: bool,
    /// The page was asked for by the destination.
    pub postcopy_requested: bool,
    pub target_channel: Channel,
}

/// Range of a region the destination faulted on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub region: usize,
    pub offset: u64,
    pub len: u64,
}

struct RequestQueueInner {
    queue: VecDeque<PageRequest>,
    /// Region of the last request naming one.
    last_req: Option<usize>,
}

/// FIFO of destination fault requests, fed by the return path.
pub struct PageRequestQueue {
    regions: Vec<Arc<RamRegion>>,
    target_page_size: u64,
    inner: Mutex<RequestQueueInner>,
    total: AtomicU64,
}

impl PageRequestQueue {
    /// # Arguments
    ///
    /// * `regions` - Migrated regions, in dirty tracker order.
    /// * `target_page_size` - Base page size of the stream.
    pub fn new(regions: Vec<Arc<RamRegion>>, target_page_size: u64) -> Self {
        PageRequestQueue {
            regions,
            target_page_size,
            inner: Mutex::new(RequestQueueInner {
                queue: VecDeque::new(),
                last_req: None,
            }),
            total: AtomicU64::new(0),
        }
    }

    /// Queue `len` bytes at `start` of region `name`, or of the region of
    /// the previous request when `name` is None.
    pub fn queue_pages(&self, name: Option<&str>, start: u64, len: u64) -> Result<()> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        let idx = match name {
            Some(name) => {
                let idx = self
                    .regions
                    .iter()
                    .position(|r| r.name() == name)
                    .ok_or_else(|| anyhow!(MigrationError::UnknownRegion(name.to_string())))?;
                inner.last_req = Some(idx);
                idx
            }
            None => inner.last_req.ok_or_else(|| {
                anyhow!(MigrationError::InvalidPageRequest(
                    "<previous>".to_string(),
                    start,
                    len
                ))
            })?,
        };

        let region = &self.regions[idx];
        let valid = len != 0
            && start % self.target_page_size == 0
            && start
                .checked_add(len - 1)
                .map_or(false, |end| region.contains(end));
        if !valid {
            error!(
                "Page request out of range: {} start {:#x} len {:#x} region length {:#x}",
                region.name(),
                start,
                len,
                region.used_length()
            );
            return Err(anyhow!(MigrationError::InvalidPageRequest(
                region.name().to_string(),
                start,
                len
            )));
        }

        inner.queue.push_back(PageRequest {
            region: idx,
            offset: start,
            len,
        });
        trace!("Queued page request {} {:#x} {:#x}", region.name(), start, len);
        Ok(())
    }

    pub fn has_request(&self) -> bool {
        !self.inner.lock().unwrap().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_request()
    }

    /// Take the first target page of the oldest request.
    pub fn unqueue(&self) -> Option<(usize, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.queue.front_mut()?;
        let ret = (entry.region, entry.offset);
        if entry.len > self.target_page_size {
            entry.len -= self.target_page_size;
            entry.offset += self.target_page_size;
        } else {
            inner.queue.pop_front();
        }
        Some(ret)
    }

    /// Drop every queued request, return how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.queue.len();
        inner.queue.clear();
        inner.last_req = None;
        n
    }

    /// Requests received since the queue was created.
    pub fn total_requests(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

impl RamSaveState {
    pub(crate) fn host_page_pages(&self, idx: usize) -> u64 {
        std::cmp::max(
            self.tracker.region(idx).page_size() >> self.target_page_bits,
            1,
        )
    }

    /// Move `pss` to the next dirty page of the background scan.
    ///
    /// Returns true if a page was found. `again` is cleared when the round
    /// completed without finding anything.
    pub(crate) fn find_dirty_block(&mut self, pss: &mut PageSearchStatus, again: &mut bool) -> bool {
        pss.page = self.tracker.find_next_dirty(pss.region, pss.page);
        if pss.complete_round && pss.region == self.last_seen_block && pss.page >= self.last_page {
            *again = false;
            return false;
        }

        let pages = self.tracker.region(pss.region).pages(self.target_page_bits);
        if pss.page >= pages {
            pss.page = 0;
            pss.region += 1;
            if pss.region >= self.tracker.len() {
                // A page dirtied again may still sit in a compression slot.
                self.flush_compressed_data();
                pss.region = 0;
                pss.complete_round = true;
                if self.xbzrle_cache.is_some() && !self.xbzrle_enabled {
                    self.xbzrle_enabled = true;
                }
            }
            *again = true;
            return false;
        }

        *again = true;
        true
    }

    /// Point `pss` at the oldest requested page still dirty.
    pub(crate) fn get_queued_page(&mut self, pss: &mut PageSearchStatus) -> bool {
        while let Some((idx, offset)) = self.requests.unqueue() {
            let page = offset >> self.target_page_bits;
            if self.preempt.contains(idx, page, self.host_page_pages(idx)) {
                // Serve the request from the preempted huge page.
                self.preempt.restore(pss, true);
                return true;
            }
            if self.tracker.is_dirty(idx, page) {
                pss.region = idx;
                pss.page = page;
                // A queued page breaks the one round check.
                pss.complete_round = false;
                pss.postcopy_requested = true;
                pss.target_channel = Channel::Postcopy;
                return true;
            }
            trace!("Requested page {:#x} of region {} already sent", offset, idx);
        }
        false
    }

    /// Find the next page to send and send its host page.
    ///
    /// Returns the number of target pages sent, 0 when nothing is dirty.
    pub(crate) fn find_and_save_block(&mut self) -> Result<u64> {
        if self.tracker.is_empty() || self.tracker.total_bytes() == 0 {
            return Ok(0);
        }

        let mut pss = PageSearchStatus {
            region: self.last_seen_block,
            page: self.last_page,
            ..Default::default()
        };
        if pss.region >= self.tracker.len() {
            pss.region = 0;
            pss.page = 0;
        }

        let mut pages = 0;
        let mut again = true;
        loop {
            let mut found = self.get_queued_page(&mut pss);
            if !found {
                if self.preempt.triggered() {
                    self.preempt.restore(&mut pss, false);
                    found = true;
                } else {
                    pss.postcopy_requested = false;
                    pss.target_channel = Channel::Precopy;
                    found = self.find_dirty_block(&mut pss, &mut again);
                }
            }

            if found {
                if self.preempt.enabled(self.in_postcopy) {
                    self.channels.choose(pss.target_channel);
                }
                pages = self.save_host_page(&mut pss)?;
            }
            if pages != 0 || !again {
                break;
            }
        }

        self.last_seen_block = pss.region;
        self.last_page = pss.page;
        Ok(pages)
    }

    /// Send every dirty target page of the host page holding `pss.page`.
    fn save_host_page(&mut self, pss: &mut PageSearchStatus) -> Result<u64> {
        let region = self.tracker.region(pss.region).clone();
        let host_pages = self.host_page_pages(pss.region);
        let boundary = round_up(pss.page + 1, host_pages).unwrap_or(u64::MAX);
        let region_pages = region.pages(self.target_page_bits);
        let start_page = pss.page;
        let mut pages = 0;

        self.preempt.begin_host_page(pss, host_pages > 1);
        loop {
            let has_request = self.requests.has_request();
            if self.preempt.needs_preempt(
                pss,
                &region,
                self.target_page_size,
                self.in_postcopy,
                has_request,
            ) {
                self.preempt.do_preempt(pss);
                break;
            }

            // The bit is cleared before the content is read.
            if self.tracker.clear_and_test(pss.region, pss.page)? {
                pages += self.save_target_page(pss, &region)?;
            }
            pss.page = self.tracker.find_next_dirty(pss.region, pss.page);
            if pss.page >= boundary || pss.page >= region_pages {
                break;
            }
        }
        pss.page = std::cmp::min(pss.page, boundary);

        if self.config.postcopy.preempt && pss.postcopy_requested {
            self.channels.stream().fflush();
        }
        if self.config.postcopy.release_ram && self.in_postcopy && pages != 0 {
            let start = start_page << self.target_page_bits;
            let end = std::cmp::min(pss.page, region_pages) << self.target_page_bits;
            if end > start {
                region.discard(start, end - start)?;
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    fn queue() -> PageRequestQueue {
        let regions = vec![
            RamRegion::new("pc.ram", 16 * PAGE, PAGE).unwrap(),
            RamRegion::new("vga.ram", 4 * PAGE, PAGE).unwrap(),
        ];
        PageRequestQueue::new(regions, PAGE)
    }

    #[test]
    fn test_queue_pages_validation() {
        let q = queue();
        assert!(q.queue_pages(None, 0, PAGE).is_err());
        assert!(q.queue_pages(Some("nope"), 0, PAGE).is_err());
        assert!(q.queue_pages(Some("vga.ram"), 4 * PAGE, PAGE).is_err());
        assert!(q.queue_pages(Some("vga.ram"), 3 * PAGE, 2 * PAGE).is_err());
        assert!(q.queue_pages(Some("vga.ram"), 100, PAGE).is_err());
        assert!(q.queue_pages(Some("vga.ram"), 0, 0).is_err());
        assert!(q.is_empty());

        q.queue_pages(Some("vga.ram"), 3 * PAGE, PAGE).unwrap();
        // Reuses the region of the previous request.
        q.queue_pages(None, 0, PAGE).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.unqueue(), Some((1, 3 * PAGE)));
        assert_eq!(q.unqueue(), Some((1, 0)));
        assert_eq!(q.unqueue(), None);
        assert_eq!(q.total_requests(), 8);
    }

    #[test]
    fn test_unqueue_by_target_page() {
        let q = queue();
        q.queue_pages(Some("pc.ram"), 2 * PAGE, 3 * PAGE).unwrap();
        q.queue_pages(Some("vga.ram"), 0, PAGE).unwrap();

        assert_eq!(q.unqueue(), Some((0, 2 * PAGE)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.unqueue(), Some((0, 3 * PAGE)));
        assert_eq!(q.unqueue(), Some((0, 4 * PAGE)));
        assert_eq!(q.len(), 1);
        assert_eq!(q.unqueue(), Some((1, 0)));
        assert!(!q.has_request());
    }

    #[test]
    fn test_clear_drops_requests() {
        let q = queue();
        q.queue_pages(Some("pc.ram"), 0, 4 * PAGE).unwrap();
        q.queue_pages(Some("pc.ram"), 8 * PAGE, PAGE).unwrap();
        assert_eq!(q.clear(), 2);
        assert_eq!(q.unqueue(), None);
        assert!(q.queue_pages(None, 0, PAGE).is_err());
    }
}
