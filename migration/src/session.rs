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

//! Outgoing ram migration session.
//!
//! The caller drives the session with `setup`, then `iterate` until
//! `pending` is small enough, then `complete` with the guest stopped.
//! Every phase ends with an EOS record on the precopy channel. All methods
//! take `&mut self`, so whoever shares the session holds it behind one lock.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, info, warn};

use crate::codec::{
    MigrationStream, MigrationStreamReader, RAMBLOCK_RECV_BITMAP_ENDING, RAM_SAVE_FLAG_EOS,
    RAM_SAVE_FLAG_MEM_SIZE,
};
use crate::compress::CompressPool;
use crate::config::{ConfigCheck, MigrationConfig};
use crate::dirty::{DirtyLogSource, DirtyTracker, DiscardManager};
use crate::multifd::MultifdSender;
use crate::postcopy::{probe_write_protect, ChannelSelector, PostcopyPreempt};
use crate::region::RamRegion;
use crate::save::SaveHook;
use crate::scanner::PageRequestQueue;
use crate::stats::{MigrationStats, RamCounters};
use crate::status::MigrationStatus;
use crate::throttle::{CpuThrottle, ThrottleController};
use crate::xbzrle::PageCache;
use crate::MigrationError;
use util::bitmap::Bitmap;
use util::num_ops::{div_round_up, round_up};
use util::unix::host_page_size;

/// Length of one rate limiting window.
const RATE_WINDOW: Duration = Duration::from_millis(100);
/// Longest time one `iterate` call may spend sending.
const MAX_ITERATE_TIME: Duration = Duration::from_millis(50);
/// Steps between two checks of the elapsed time.
const ITERATE_CHECK_STEPS: u64 = 64;

/// Outcome of one `iterate` call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IterState {
    /// Stopped on the rate limit or the time slice, dirty pages may remain.
    More,
    /// A whole scan round found nothing to send.
    Done,
}

/// Bytes still to send, split by the phase able to send them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingSize {
    pub precopy_only: u64,
    pub postcopy_compatible: u64,
}

/// Dirty range the destination must drop when postcopy starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscardRange {
    pub region: String,
    pub start: u64,
    pub len: u64,
}

/// Device side hooks around the final pass.
pub trait DrainHook: Send + Sync {
    /// Stop devices from writing guest memory.
    fn drain_begin(&self);

    fn drain_end(&self);
}

pub struct RamSaveState {
    pub(crate) config: MigrationConfig,
    pub(crate) target_page_bits: u32,
    pub(crate) target_page_size: u64,
    status: MigrationStatus,
    pub(crate) tracker: DirtyTracker,
    /// Start of each tracked region in one flat address space, keys the
    /// delta cache.
    pub(crate) region_base: Vec<u64>,
    pub(crate) channels: ChannelSelector,
    pub(crate) requests: Arc<PageRequestQueue>,
    pub(crate) preempt: PostcopyPreempt,
    throttle: ThrottleController,
    pub(crate) xbzrle_cache: Option<Arc<Mutex<PageCache>>>,
    /// Deltas are used from the second round on.
    pub(crate) xbzrle_enabled: bool,
    pub(crate) page_buf: Vec<u8>,
    pub(crate) zero_page: Vec<u8>,
    /// One byte short of a page, so a delta is only kept when it's smaller.
    pub(crate) encoded_buf: Vec<u8>,
    pub(crate) compress: Option<CompressPool>,
    pub(crate) multifd: Option<MultifdSender>,
    multifd_writers: Vec<Box<dyn Write + Send>>,
    pub(crate) save_hook: Option<Arc<dyn SaveHook>>,
    drain_hook: Option<Arc<dyn DrainHook>>,
    /// Scan cursor kept between calls.
    pub(crate) last_seen_block: usize,
    pub(crate) last_page: u64,
    pub(crate) in_postcopy: bool,
    /// The final pass with the guest stopped is running.
    pub(crate) last_stage: bool,
    pub(crate) counters: RamCounters,
    rate_window_start: Instant,
}

impl RamSaveState {
    /// Create a session migrating the not ignored `regions`.
    ///
    /// # Arguments
    ///
    /// * `config` - Session parameters, checked by `setup`.
    /// * `regions` - Guest memory regions.
    /// * `log` - Dirty log of the regions.
    /// * `throttle` - Guest cpu throttle for auto-converge.
    /// * `precopy` - Main output channel.
    pub fn new(
        config: MigrationConfig,
        regions: Vec<Arc<RamRegion>>,
        log: Arc<dyn DirtyLogSource>,
        throttle: Arc<dyn CpuThrottle>,
        precopy: MigrationStream,
    ) -> Self {
        let target_page_bits = config.target_page_bits();
        let target_page_size = config.target_page_size;
        let tracked: Vec<Arc<RamRegion>> =
            regions.into_iter().filter(|r| !r.is_ignored()).collect();
        let tracker = DirtyTracker::new(
            &tracked,
            target_page_bits,
            config.clear_bitmap_shift,
            log,
            None,
        );

        let mut region_base = Vec::with_capacity(tracked.len());
        let mut base = 0;
        for region in tracked.iter() {
            region_base.push(base);
            base += region.used_length();
        }

        RamSaveState {
            target_page_bits,
            target_page_size,
            status: MigrationStatus::None,
            tracker,
            region_base,
            channels: ChannelSelector::new(precopy, None),
            requests: Arc::new(PageRequestQueue::new(tracked, target_page_size)),
            preempt: PostcopyPreempt::new(config.postcopy.clone()),
            throttle: ThrottleController::new(config.throttle.clone(), throttle),
            xbzrle_cache: None,
            xbzrle_enabled: false,
            page_buf: vec![0_u8; target_page_size as usize],
            zero_page: vec![0_u8; target_page_size as usize],
            encoded_buf: vec![0_u8; target_page_size as usize - 1],
            compress: None,
            multifd: None,
            multifd_writers: Vec::new(),
            save_hook: None,
            drain_hook: None,
            last_seen_block: 0,
            last_page: 0,
            in_postcopy: false,
            last_stage: false,
            counters: RamCounters::default(),
            rate_window_start: Instant::now(),
            config,
        }
    }

    /// Send requested pages through `stream` once postcopy preempt runs.
    pub fn with_postcopy_channel(mut self, stream: MigrationStream) -> Self {
        self.channels.set_postcopy_stream(stream);
        self
    }

    /// Outputs of the parallel bulk channels, one per configured channel.
    pub fn with_multifd(mut self, writers: Vec<Box<dyn Write + Send>>) -> Self {
        self.multifd_writers = writers;
        self
    }

    pub fn with_save_hook(mut self, hook: Arc<dyn SaveHook>) -> Self {
        self.save_hook = Some(hook);
        self
    }

    pub fn with_drain_hook(mut self, hook: Arc<dyn DrainHook>) -> Self {
        self.drain_hook = Some(hook);
        self
    }

    pub fn with_discard_manager(mut self, discard: Arc<dyn DiscardManager>) -> Self {
        self.tracker.set_discard_manager(discard);
        self
    }

    pub fn status(&self) -> MigrationStatus {
        self.status
    }

    /// Queue fed by the return path with the destination's page faults.
    pub fn page_requests(&self) -> Arc<PageRequestQueue> {
        self.requests.clone()
    }

    fn check_active(&self, op: &str) -> Result<()> {
        if !self.status.is_active() {
            bail!(MigrationError::InvalidStatus(op.to_string(), self.status));
        }
        Ok(())
    }

    /// Mark the session failed, `resume_prepare` may restart it.
    pub fn fail(&mut self) {
        match self.status.transfer(MigrationStatus::Failed) {
            Ok(status) => {
                error!("Ram migration failed in status {}", self.status);
                self.status = status;
            }
            Err(e) => warn!("{:?}", e),
        }
    }

    /// Prepare the session and send the region list.
    pub fn setup(&mut self) -> Result<()> {
        self.status = self.status.transfer(MigrationStatus::Setup)?;
        if let Err(e) = self.do_setup() {
            error!("Ram migration setup failed: {:?}", e);
            self.status = MigrationStatus::Failed;
            return Err(e);
        }
        self.status = self.status.transfer(MigrationStatus::Active)?;
        info!(
            "Ram migration set up: {} regions, {} bytes",
            self.tracker.len(),
            self.tracker.total_bytes()
        );
        Ok(())
    }

    fn do_setup(&mut self) -> Result<()> {
        self.config.check()?;
        if self.config.postcopy.ram_wp {
            probe_write_protect()?;
        }

        if self.config.compress.enabled {
            match CompressPool::new(
                self.config.compress.threads as u8,
                self.config.compress.level as u8,
                self.config.compress.wait_thread,
                self.target_page_size,
            ) {
                Ok(pool) => self.compress = Some(pool),
                Err(e) => warn!("Compression is disabled: {:?}", e),
            }
        }
        if self.config.xbzrle.enabled {
            match PageCache::new(self.config.xbzrle.cache_size, self.target_page_size) {
                Ok(cache) => self.xbzrle_cache = Some(Arc::new(Mutex::new(cache))),
                Err(e) => warn!("Xbzrle is disabled: {:?}", e),
            }
        }
        if self.config.multifd.enabled {
            if self.multifd_writers.len() as u64 != self.config.multifd.channels {
                bail!(MigrationError::InvalidParam(
                    format!("{} channels", self.multifd_writers.len()),
                    "multifd".to_string()
                ));
            }
            let writers = std::mem::take(&mut self.multifd_writers);
            self.multifd = Some(
                MultifdSender::new(writers, self.target_page_size)
                    .with_context(|| "Failed to start multifd channels")?,
            );
        }

        self.channels
            .precopy()
            .set_rate_limit(self.config.max_bandwidth / 10);
        self.rate_window_start = Instant::now();
        self.tracker.init_bitmaps()?;

        self.save_mem_size();
        if let Some(multifd) = self.multifd.as_mut() {
            multifd.sync()?;
        }
        self.put_eos();
        self.channels.get_error()
    }

    fn save_mem_size(&mut self) {
        let postcopy = self.config.postcopy.enabled;
        let host_page = host_page_size();
        let stream = self.channels.precopy();
        stream.put_be64(self.tracker.total_bytes() | RAM_SAVE_FLAG_MEM_SIZE);
        for rb in self.tracker.bitmaps() {
            let region = &rb.region;
            stream.put_byte(region.name().len() as u8);
            stream.put_buffer(region.name().as_bytes());
            stream.put_be64(region.used_length());
            if postcopy && region.page_size() != host_page {
                stream.put_be64(region.page_size());
            }
        }
    }

    fn put_eos(&mut self) {
        let stream = self.channels.precopy();
        stream.put_be64(RAM_SAVE_FLAG_EOS);
        self.channels.fflush_all();
    }

    /// Open a new rate window when the current one is over, waiting for
    /// its end if its budget is spent.
    fn rate_limit_window(&mut self) {
        let elapsed = self.rate_window_start.elapsed();
        if elapsed < RATE_WINDOW {
            if !self.channels.precopy().rate_limit_exceeded() {
                return;
            }
            thread::sleep(RATE_WINDOW - elapsed);
        }
        self.channels.precopy().rate_limit_reset();
        self.rate_window_start = Instant::now();
    }

    /// Send dirty pages until the rate limit or the time slice is used up.
    pub fn iterate(&mut self) -> Result<IterState> {
        self.check_active("iterate")?;
        self.rate_limit_window();

        let start = Instant::now();
        let mut state = IterState::More;
        let mut steps = 0_u64;
        while !self.channels.precopy().rate_limit_exceeded() || self.requests.has_request() {
            if self.channels.get_error().is_err() {
                break;
            }
            let pages = self.find_and_save_block()?;
            if pages == 0 {
                state = IterState::Done;
                break;
            }
            self.counters.target_page_count += pages;

            steps += 1;
            if steps % ITERATE_CHECK_STEPS == 0 {
                if start.elapsed() > MAX_ITERATE_TIME {
                    debug!("Ram iteration time slice used up after {} steps", steps);
                    break;
                }
                thread::yield_now();
            }
        }

        self.end_section()?;
        Ok(state)
    }

    /// Push everything still queued and close the section with EOS.
    fn end_section(&mut self) -> Result<()> {
        self.flush_compressed_data();
        self.channels.reset();
        if let Some(multifd) = self.multifd.as_mut() {
            multifd.sync()?;
        }
        self.put_eos();
        self.channels.get_error()
    }

    /// Send every remaining dirty page, the guest must be stopped.
    pub fn complete(&mut self) -> Result<()> {
        self.check_active("complete")?;
        if let Some(hook) = self.drain_hook.as_ref() {
            hook.drain_begin();
        }
        let ret = self.do_complete();
        if let Some(hook) = self.drain_hook.as_ref() {
            hook.drain_end();
        }
        ret?;

        self.status = self.status.transfer(MigrationStatus::Completed)?;
        info!(
            "Ram migration completed: {} bytes sent",
            self.channels.transferred()
        );
        Ok(())
    }

    fn do_complete(&mut self) -> Result<()> {
        self.flush_compressed_data();
        self.last_stage = true;
        if !self.in_postcopy {
            self.bitmap_sync()?;
        }

        loop {
            let pages = self.find_and_save_block()?;
            if pages == 0 {
                break;
            }
            self.counters.target_page_count += pages;
        }
        if self.in_postcopy {
            self.channels.close_postcopy();
        }
        self.end_section()
    }

    /// Bytes left to send, synchronizing the dirty log first when the
    /// estimate is below `max_size`.
    pub fn pending(&mut self, max_size: u64) -> Result<PendingSize> {
        let mut remaining = self.tracker.dirty_pages() * self.target_page_size;
        if !self.in_postcopy && remaining < max_size {
            self.bitmap_sync()?;
            remaining = self.tracker.dirty_pages() * self.target_page_size;
        }

        if self.config.postcopy.enabled {
            Ok(PendingSize {
                precopy_only: 0,
                postcopy_compatible: remaining,
            })
        } else {
            Ok(PendingSize {
                precopy_only: remaining,
                postcopy_compatible: 0,
            })
        }
    }

    /// Merge the dirty log and evaluate the dirty rate.
    pub fn bitmap_sync(&mut self) -> Result<()> {
        self.tracker.sync_all()?;
        let transferred = self.transferred();
        if let Some(period) = self.tracker.take_period(transferred) {
            self.throttle.on_period(&period);
            self.counters.update_rates(self.target_page_size);
        }
        Ok(())
    }

    fn transferred(&self) -> u64 {
        self.channels.transferred()
            + self.counters.hook_bytes
            + self.multifd.as_ref().map_or(0, |m| m.bytes())
    }

    /// Release everything the session holds. Safe to call in any status.
    pub fn cleanup(&mut self) {
        self.tracker.stop();
        if let Some(mut pool) = self.compress.take() {
            pool.cleanup();
        }
        if let Some(mut multifd) = self.multifd.take() {
            multifd.cleanup();
        }
        let dropped = self.requests.clear();
        if dropped != 0 {
            warn!("Dropped {} queued page requests", dropped);
        }
        self.throttle.stop();
        self.preempt.reset();
        self.xbzrle_cache = None;
        self.xbzrle_enabled = false;
        self.in_postcopy = false;

        if matches!(
            self.status,
            MigrationStatus::Setup | MigrationStatus::Active | MigrationStatus::Postcopy
        ) {
            self.status = MigrationStatus::Canceled;
        }
        info!("Ram migration cleaned up in status {}", self.status);
    }

    /// Switch to postcopy.
    ///
    /// Returns the dirty ranges whose content on the destination is stale.
    pub fn postcopy_start(&mut self) -> Result<Vec<DiscardRange>> {
        if !self.config.postcopy.enabled {
            bail!(MigrationError::InvalidParam(
                "postcopy-start".to_string(),
                "postcopy disabled session".to_string()
            ));
        }
        if self.status != MigrationStatus::Active {
            bail!(MigrationError::InvalidStatus(
                "start postcopy".to_string(),
                self.status
            ));
        }

        self.flush_compressed_data();
        self.bitmap_sync()?;
        for idx in 0..self.tracker.len() {
            let host_pages = self.host_page_pages(idx);
            if host_pages > 1 {
                self.dirty_whole_host_pages(idx, host_pages)?;
            }
        }

        self.channels.reset_last_sent_block();
        self.last_seen_block = 0;
        self.last_page = 0;
        self.in_postcopy = true;
        self.status = self.status.transfer(MigrationStatus::Postcopy)?;

        let mut ranges = Vec::new();
        for idx in 0..self.tracker.len() {
            let region = self.tracker.region(idx).clone();
            let pages = region.pages(self.target_page_bits);
            let mut start = self.tracker.find_next_dirty(idx, 0);
            while start < pages {
                let end = std::cmp::min(self.tracker.find_next_clean(idx, start), pages);
                ranges.push(DiscardRange {
                    region: region.name().to_string(),
                    start: start << self.target_page_bits,
                    len: (end - start) << self.target_page_bits,
                });
                start = self.tracker.find_next_dirty(idx, end);
            }
            if self.config.postcopy.release_ram {
                self.release_sent_pages(idx, &region, pages)?;
            }
        }
        info!(
            "Postcopy started: {} dirty pages in {} ranges",
            self.tracker.dirty_pages(),
            ranges.len()
        );
        Ok(ranges)
    }

    /// A host page is placed at once on the destination, so it is resent
    /// whole when any of its target pages is dirty.
    fn dirty_whole_host_pages(&mut self, idx: usize, host_pages: u64) -> Result<()> {
        let pages = self.tracker.region(idx).pages(self.target_page_bits);
        let mut page = self.tracker.find_next_dirty(idx, 0);
        while page < pages {
            let host_start = page / host_pages * host_pages;
            let npages = std::cmp::min(host_pages, pages - host_start);
            self.tracker.mark_dirty(idx, host_start, npages)?;
            page = self.tracker.find_next_dirty(idx, host_start + host_pages);
        }
        Ok(())
    }

    /// Give back source memory already sent and not dirtied since.
    fn release_sent_pages(&mut self, idx: usize, region: &RamRegion, pages: u64) -> Result<()> {
        let mut start = self.tracker.find_next_clean(idx, 0);
        while start < pages {
            let end = std::cmp::min(self.tracker.find_next_dirty(idx, start), pages);
            region.discard(
                start << self.target_page_bits,
                (end - start) << self.target_page_bits,
            )?;
            start = self.tracker.find_next_clean(idx, end);
        }
        Ok(())
    }

    /// Restart a failed session on new channels.
    ///
    /// The destination sends the receive bitmap of every region through
    /// `return_path`, pages it hasn't received are dirty again.
    pub fn resume_prepare(
        &mut self,
        return_path: &mut MigrationStreamReader,
        precopy: MigrationStream,
        postcopy: Option<MigrationStream>,
    ) -> Result<()> {
        if self.status != MigrationStatus::Failed {
            bail!(MigrationError::InvalidStatus(
                "resume".to_string(),
                self.status
            ));
        }
        self.status = self.status.transfer(MigrationStatus::Setup)?;

        for _ in 0..self.tracker.len() {
            let name = return_path.get_name()?;
            if let Err(e) = self.dirty_bitmap_reload(&name, return_path) {
                self.status = MigrationStatus::Failed;
                return Err(e);
            }
        }

        let pages = self.tracker.count_dirty_pages();
        self.last_seen_block = 0;
        self.last_page = 0;
        self.xbzrle_enabled = false;
        self.preempt.reset();
        self.channels = ChannelSelector::new(precopy, postcopy);
        self.channels
            .precopy()
            .set_rate_limit(self.config.max_bandwidth / 10);
        self.rate_window_start = Instant::now();

        self.status = self.status.transfer(MigrationStatus::Active)?;
        if self.in_postcopy {
            self.status = self.status.transfer(MigrationStatus::Postcopy)?;
        }
        info!("Ram migration resumed with {} dirty pages", pages);
        Ok(())
    }

    /// Read the receive bitmap of region `name` and make every page the
    /// destination lacks dirty.
    pub fn dirty_bitmap_reload(
        &mut self,
        name: &str,
        return_path: &mut MigrationStreamReader,
    ) -> Result<()> {
        let idx = self
            .tracker
            .find(name)
            .ok_or_else(|| anyhow!(MigrationError::UnknownRegion(name.to_string())))?;
        let nbits = self.tracker.bitmaps()[idx].bmap.len() as u64;
        let local_size = div_round_up(nbits, 8)
            .and_then(|bytes| round_up(bytes, 8))
            .unwrap_or_default();

        let size = return_path.get_be64()?;
        if size != local_size {
            error!(
                "Receive bitmap of {} has {:#x} bytes, expected {:#x}",
                name, size, local_size
            );
            bail!(MigrationError::RecvBitmapSizeMismatch(
                name.to_string(),
                local_size,
                size
            ));
        }
        let mut buf = vec![0_u8; size as usize];
        return_path.get_buffer(&mut buf)?;
        let end_mark = return_path.get_be64()?;
        if end_mark != RAMBLOCK_RECV_BITMAP_ENDING {
            bail!(MigrationError::RecvBitmapEndMark(name.to_string(), end_mark));
        }

        let received = Bitmap::new(nbits as usize);
        received.load_le_bytes(&buf)?;
        self.tracker.reload_from_received(idx, &received)?;
        debug!("Reloaded dirty bitmap of {}", name);
        Ok(())
    }

    /// The guest reported `len` bytes at `offset` of `name` as free.
    pub fn free_page_hint(&mut self, name: &str, offset: u64, len: u64) -> Result<()> {
        let idx = self
            .tracker
            .find(name)
            .ok_or_else(|| anyhow!(MigrationError::UnknownRegion(name.to_string())))?;
        let used_length = self.tracker.region(idx).used_length();
        if offset >= used_length {
            bail!(MigrationError::IllegalOffset(name.to_string(), offset));
        }
        let len = std::cmp::min(len, used_length - offset);
        self.tracker.free_page_hint(
            idx,
            offset >> self.target_page_bits,
            len >> self.target_page_bits,
        )
    }

    /// Resize the delta cache, its content is dropped.
    pub fn set_xbzrle_cache_size(&mut self, size: u64) -> Result<()> {
        if size < self.target_page_size {
            bail!(MigrationError::IllegalValue(
                "xbzrle cache size".to_string(),
                self.target_page_size,
                true,
                u64::MAX,
                true
            ));
        }
        if size == self.config.xbzrle.cache_size {
            return Ok(());
        }
        if let Some(cache) = self.xbzrle_cache.as_ref() {
            let new_cache = PageCache::new(size, self.target_page_size)?;
            *cache.lock().unwrap() = new_cache;
        }
        self.config.xbzrle.cache_size = size;
        info!("Xbzrle cache size set to {:#x}", size);
        Ok(())
    }

    pub fn stats(&self) -> MigrationStats {
        MigrationStats {
            transferred: self.transferred(),
            remaining: self.tracker.dirty_pages() * self.target_page_size,
            total: self.tracker.total_bytes(),
            normal_pages: self.counters.normal_pages,
            zero_pages: self.counters.zero_pages,
            multifd_bytes: self.multifd.as_ref().map_or(0, |m| m.bytes()),
            postcopy_requests: self.requests.total_requests(),
            dirty_sync_count: self.tracker.dirty_sync_count(),
            dirty_pages_rate: self.tracker.dirty_pages_rate(),
            throttle_percentage: self.throttle.percentage(),
            xbzrle: self.counters.xbzrle,
            compress: self.counters.compress,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::codec::{MemoryPipe, RAM_SAVE_FLAG_PAGE};
    use crate::dirty::SoftDirtyLog;
    use crate::throttle::SharedCpuThrottle;

    const PAGE: u64 = 4096;

    fn session(
        config: MigrationConfig,
        regions: Vec<Arc<RamRegion>>,
    ) -> (RamSaveState, MemoryPipe, Arc<SoftDirtyLog>) {
        let pipe = MemoryPipe::new();
        let log = Arc::new(SoftDirtyLog::new(config.target_page_bits()));
        let state = RamSaveState::new(
            config,
            regions,
            log.clone(),
            Arc::new(SharedCpuThrottle::new()),
            pipe.writer("precopy"),
        );
        (state, pipe, log)
    }

    fn unlimited() -> MigrationConfig {
        MigrationConfig {
            max_bandwidth: 0,
            ..Default::default()
        }
    }

    fn run_to_done(state: &mut RamSaveState) {
        for _ in 0..1000 {
            if state.iterate().unwrap() == IterState::Done {
                return;
            }
        }
        panic!("iterate never finished a round");
    }

    #[test]
    fn test_setup_sends_region_list() {
        let regions = vec![
            RamRegion::new("pc.ram", 8 * PAGE, PAGE).unwrap(),
            RamRegion::new_ignored("rom", PAGE, PAGE).unwrap(),
            RamRegion::new("vga.ram", 2 * PAGE, PAGE).unwrap(),
        ];
        let (mut state, pipe, _) = session(unlimited(), regions);
        state.setup().unwrap();
        assert_eq!(state.status(), MigrationStatus::Active);
        assert!(state.setup().is_err());

        let mut r = pipe.reader("precopy");
        assert_eq!(r.get_be64().unwrap(), 10 * PAGE | RAM_SAVE_FLAG_MEM_SIZE);
        assert_eq!(r.get_name().unwrap(), "pc.ram");
        assert_eq!(r.get_be64().unwrap(), 8 * PAGE);
        assert_eq!(r.get_name().unwrap(), "vga.ram");
        assert_eq!(r.get_be64().unwrap(), 2 * PAGE);
        assert_eq!(r.get_be64().unwrap(), RAM_SAVE_FLAG_EOS);
        assert!(r.at_eof().unwrap());
    }

    #[test]
    fn test_invalid_config_fails_setup() {
        let config = MigrationConfig {
            target_page_size: 3000,
            ..Default::default()
        };
        let region = RamRegion::new("pc.ram", 4 * PAGE, PAGE).unwrap();
        let pipe = MemoryPipe::new();
        let mut state = RamSaveState::new(
            MigrationConfig::default(),
            vec![region],
            Arc::new(SoftDirtyLog::new(12)),
            Arc::new(SharedCpuThrottle::new()),
            pipe.writer("precopy"),
        );
        state.config = config;
        assert!(state.setup().is_err());
        assert_eq!(state.status(), MigrationStatus::Failed);
        assert!(state.iterate().is_err());
    }

    #[test]
    fn test_round_sends_each_page_once() {
        let region = RamRegion::new("pc.ram", 16 * PAGE, PAGE).unwrap();
        for page in (0..16).step_by(2) {
            region.fill(page * PAGE, 0x5a, PAGE).unwrap();
        }
        let (mut state, _pipe, log) = session(unlimited(), vec![region.clone()]);
        state.setup().unwrap();
        run_to_done(&mut state);

        let stats = state.stats();
        assert_eq!(stats.normal_pages, 8);
        assert_eq!(stats.zero_pages, 8);
        assert_eq!(stats.remaining, 0);
        assert_eq!(state.iterate().unwrap(), IterState::Done);
        assert_eq!(state.stats().normal_pages, 8);

        // Only a page dirtied after the sync is sent again.
        log.write(&region, 3 * PAGE, &[1_u8; 16]).unwrap();
        let pending = state.pending(u64::MAX).unwrap();
        assert_eq!(pending.precopy_only, PAGE);
        assert_eq!(pending.postcopy_compatible, 0);
        run_to_done(&mut state);
        assert_eq!(state.stats().normal_pages, 9);
        assert_eq!(state.stats().dirty_sync_count, 2);
    }

    #[test]
    fn test_pending_skips_sync_above_threshold() {
        let region = RamRegion::new("pc.ram", 4 * PAGE, PAGE).unwrap();
        let (mut state, _pipe, _) = session(unlimited(), vec![region]);
        state.setup().unwrap();
        let syncs = state.stats().dirty_sync_count;
        assert_eq!(state.pending(PAGE).unwrap().precopy_only, 4 * PAGE);
        assert_eq!(state.stats().dirty_sync_count, syncs);
    }

    #[test]
    fn test_complete_and_cleanup() {
        let region = RamRegion::new("pc.ram", 4 * PAGE, PAGE).unwrap();
        region.fill(0, 1, 4 * PAGE).unwrap();
        let (mut state, _pipe, _) = session(unlimited(), vec![region]);
        state.setup().unwrap();
        state.complete().unwrap();
        assert_eq!(state.status(), MigrationStatus::Completed);
        assert_eq!(state.stats().normal_pages, 4);
        state.cleanup();
        assert_eq!(state.status(), MigrationStatus::Completed);
    }

    #[test]
    fn test_cleanup_cancels_and_drops_requests() {
        let region = RamRegion::new("pc.ram", 4 * PAGE, PAGE).unwrap();
        let (mut state, _pipe, _) = session(unlimited(), vec![region]);
        state.setup().unwrap();
        let requests = state.page_requests();
        requests.queue_pages(Some("pc.ram"), 0, 2 * PAGE).unwrap();
        state.cleanup();
        assert_eq!(state.status(), MigrationStatus::Canceled);
        assert!(requests.is_empty());
        assert_eq!(state.stats().remaining, 0);
    }

    #[test]
    fn test_postcopy_start_discard_ranges() {
        let mut config = unlimited();
        config.postcopy.enabled = true;
        let small = RamRegion::new("pc.ram", 8 * PAGE, PAGE).unwrap();
        let huge = RamRegion::new("huge.ram", 16 * PAGE, 4 * PAGE).unwrap();
        let (mut state, _pipe, log) = session(config, vec![small.clone(), huge.clone()]);
        state.setup().unwrap();
        run_to_done(&mut state);

        log.write(&small, 2 * PAGE, &[1_u8; 2 * PAGE as usize]).unwrap();
        log.write(&huge, 5 * PAGE, &[1_u8; 8]).unwrap();
        let ranges = state.postcopy_start().unwrap();
        assert_eq!(state.status(), MigrationStatus::Postcopy);
        assert_eq!(
            ranges,
            vec![
                DiscardRange {
                    region: "pc.ram".to_string(),
                    start: 2 * PAGE,
                    len: 2 * PAGE,
                },
                DiscardRange {
                    region: "huge.ram".to_string(),
                    start: 4 * PAGE,
                    len: 4 * PAGE,
                },
            ]
        );
        assert_eq!(state.stats().remaining, 6 * PAGE);
        assert!(state.postcopy_start().is_err());

        // Nothing is synchronized any more while in postcopy.
        assert_eq!(state.pending(u64::MAX).unwrap().postcopy_compatible, 6 * PAGE);
        state.complete().unwrap();
        assert_eq!(state.stats().remaining, 0);
    }

    #[test]
    fn test_postcopy_start_needs_postcopy() {
        let region = RamRegion::new("pc.ram", 4 * PAGE, PAGE).unwrap();
        let (mut state, _pipe, _) = session(unlimited(), vec![region]);
        state.setup().unwrap();
        assert!(state.postcopy_start().is_err());
    }

    fn recv_bitmap(name: &str, size: u64, bits: &[u8], end: u64) -> MemoryPipe {
        let pipe = MemoryPipe::new();
        let mut w = pipe.writer("return-path");
        w.put_byte(name.len() as u8);
        w.put_buffer(name.as_bytes());
        w.put_be64(size);
        w.put_buffer(bits);
        w.put_be64(end);
        w.fflush();
        pipe
    }

    #[test]
    fn test_resume_reloads_dirty_bitmap() {
        let region = RamRegion::new("pc.ram", 10 * PAGE, PAGE).unwrap();
        let (mut state, _pipe, _) = session(unlimited(), vec![region]);
        state.setup().unwrap();
        assert!(state
            .resume_prepare(
                &mut MemoryPipe::new().reader("rp"),
                MemoryPipe::new().writer("precopy"),
                None
            )
            .is_err());
        state.fail();

        // Bad size, then bad end mark.
        let rp = recv_bitmap("pc.ram", 16, &[0_u8; 16], RAMBLOCK_RECV_BITMAP_ENDING);
        let new_out = MemoryPipe::new();
        assert!(state
            .resume_prepare(&mut rp.reader("rp"), new_out.writer("precopy"), None)
            .is_err());
        assert_eq!(state.status(), MigrationStatus::Failed);
        let rp = recv_bitmap("pc.ram", 8, &[0_u8; 8], 0);
        assert!(state
            .resume_prepare(&mut rp.reader("rp"), new_out.writer("precopy"), None)
            .is_err());

        // Pages 0-7 were received, 8 and 9 were not.
        let rp = recv_bitmap(
            "pc.ram",
            8,
            &[0xff, 0, 0, 0, 0, 0, 0, 0],
            RAMBLOCK_RECV_BITMAP_ENDING,
        );
        state
            .resume_prepare(&mut rp.reader("rp"), new_out.writer("precopy"), None)
            .unwrap();
        assert_eq!(state.status(), MigrationStatus::Active);
        assert_eq!(state.stats().remaining, 2 * PAGE);

        state.complete().unwrap();
        assert_eq!(state.stats().remaining, 0);
        assert!(!new_out.is_empty());
    }

    #[test]
    fn test_free_page_hint() {
        let region = RamRegion::new("pc.ram", 8 * PAGE, PAGE).unwrap();
        let (mut state, _pipe, _) = session(unlimited(), vec![region]);
        state.setup().unwrap();
        state.free_page_hint("pc.ram", 2 * PAGE, 100 * PAGE).unwrap();
        assert_eq!(state.stats().remaining, 2 * PAGE);
        assert!(state.free_page_hint("pc.ram", 8 * PAGE, PAGE).is_err());
        assert!(state.free_page_hint("nope", 0, PAGE).is_err());
    }

    #[test]
    fn test_xbzrle_cache_resize() {
        let mut config = unlimited();
        config.xbzrle.enabled = true;
        config.xbzrle.cache_size = 4 * PAGE;
        let region = RamRegion::new("pc.ram", 8 * PAGE, PAGE).unwrap();
        let (mut state, _pipe, _) = session(config, vec![region]);
        state.setup().unwrap();
        assert!(state.xbzrle_cache.is_some());
        assert!(state.set_xbzrle_cache_size(PAGE - 1).is_err());
        state.set_xbzrle_cache_size(16 * PAGE).unwrap();
        let cache = state.xbzrle_cache.as_ref().unwrap();
        assert_eq!(cache.lock().unwrap().max_items(), 16);
    }

    #[test]
    fn test_rate_limit_stops_iteration() {
        let config = MigrationConfig {
            max_bandwidth: 10 * PAGE * 10,
            ..Default::default()
        };
        let region = RamRegion::new("pc.ram", 64 * PAGE, PAGE).unwrap();
        region.fill(0, 0xaa, 64 * PAGE).unwrap();
        let (mut state, _pipe, _) = session(config, vec![region]);
        state.setup().unwrap();
        assert_eq!(state.iterate().unwrap(), IterState::More);
        let sent = state.stats().normal_pages;
        assert!(sent >= 10 && sent < 64);
    }

    #[derive(Default)]
    struct Transport {
        bytes: AtomicU64,
        drains: AtomicU64,
        undrains: AtomicU64,
    }

    impl SaveHook for Transport {
        fn save_page(&self, _region: &RamRegion, _offset: u64, size: u64) -> Option<Result<u64>> {
            self.bytes.fetch_add(size, Ordering::SeqCst);
            Some(Ok(size))
        }
    }

    impl DrainHook for Transport {
        fn drain_begin(&self) {
            self.drains.fetch_add(1, Ordering::SeqCst);
        }

        fn drain_end(&self) {
            self.undrains.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Unplugged;

    impl DiscardManager for Unplugged {
        fn discarded_ranges(&self, _region: &RamRegion) -> Vec<(u64, u64)> {
            vec![(0, 2 * PAGE)]
        }
    }

    #[test]
    fn test_hooks_and_discarded_ranges() {
        let region = RamRegion::new("pc.ram", 8 * PAGE, PAGE).unwrap();
        region.fill(0, 0x33, 8 * PAGE).unwrap();
        let transport = Arc::new(Transport::default());
        let (state, pipe, _) = session(unlimited(), vec![region]);
        let mut state = state
            .with_save_hook(transport.clone())
            .with_drain_hook(transport.clone())
            .with_discard_manager(Arc::new(Unplugged));
        state.setup().unwrap();
        assert_eq!(state.stats().remaining, 6 * PAGE);

        state.complete().unwrap();
        assert_eq!(transport.bytes.load(Ordering::SeqCst), 6 * PAGE);
        assert_eq!(transport.drains.load(Ordering::SeqCst), 1);
        assert_eq!(transport.undrains.load(Ordering::SeqCst), 1);
        let stats = state.stats();
        assert_eq!(stats.normal_pages, 6);
        assert!(stats.transferred >= 6 * PAGE);

        // The stream carries the region list and the section ends only.
        let mut r = pipe.reader("precopy");
        assert_eq!(r.get_be64().unwrap(), 8 * PAGE | RAM_SAVE_FLAG_MEM_SIZE);
        assert_eq!(r.get_name().unwrap(), "pc.ram");
        assert_eq!(r.get_be64().unwrap(), 8 * PAGE);
        assert_eq!(r.get_be64().unwrap(), RAM_SAVE_FLAG_EOS);
        assert_eq!(r.get_be64().unwrap(), RAM_SAVE_FLAG_EOS);
        assert!(r.at_eof().unwrap());
    }

    #[test]
    fn test_requested_page_takes_postcopy_channel() {
        let mut config = unlimited();
        config.postcopy.enabled = true;
        config.postcopy.preempt = true;
        let region = RamRegion::new("pc.ram", 8 * PAGE, PAGE).unwrap();
        region.fill(0, 0x44, 8 * PAGE).unwrap();
        let urgent = MemoryPipe::new();
        let (state, _pipe, _) = session(config, vec![region]);
        let mut state = state.with_postcopy_channel(urgent.writer("postcopy"));
        state.setup().unwrap();
        state.postcopy_start().unwrap();

        state
            .page_requests()
            .queue_pages(Some("pc.ram"), 5 * PAGE, PAGE)
            .unwrap();
        assert_eq!(state.iterate().unwrap(), IterState::Done);
        assert_eq!(state.stats().remaining, 0);

        let mut r = urgent.reader("postcopy");
        assert_eq!(r.get_be64().unwrap(), 5 * PAGE | RAM_SAVE_FLAG_PAGE);
        assert_eq!(r.get_name().unwrap(), "pc.ram");
        let mut page = vec![0_u8; PAGE as usize];
        r.get_buffer(&mut page).unwrap();
        assert!(page.iter().all(|b| *b == 0x44));
        assert!(r.at_eof().unwrap());
    }
}
