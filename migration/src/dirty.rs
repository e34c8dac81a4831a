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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_LOG_DIRTY_PAGES};
use kvm_ioctls::VmFd;
use log::{debug, warn};

use crate::config::{CLEAR_BITMAP_SHIFT_MAX, CLEAR_BITMAP_SHIFT_MIN};
use crate::region::RamRegion;
use crate::MigrationError;
use util::bitmap::Bitmap;

/// Minimum time between two dirty rate evaluations.
const DIRTY_PERIOD_MS: u128 = 1000;

/// Source of the hypervisor's dirty page log.
pub trait DirtyLogSource: Send + Sync {
    /// Start logging writes to `region`.
    fn start_dirty_log(&self, region: &RamRegion) -> Result<()>;

    /// Stop logging writes to `region`.
    fn stop_dirty_log(&self, region: &RamRegion) -> Result<()>;

    /// Fetch and reset the dirty log of `region`, one bit per target page.
    fn get_dirty_log(&self, region: &RamRegion) -> Result<Vec<u64>>;

    /// Re-arm logging of `npages` pages from `start_page` once migration has
    /// taken them over.
    fn clear_dirty_log(&self, _region: &RamRegion, _start_page: u64, _npages: u64) -> Result<()> {
        Ok(())
    }
}

/// Provider of ranges which are unplugged or discarded and must not migrate.
pub trait DiscardManager: Send + Sync {
    /// Discarded (offset, length) ranges of `region`.
    fn discarded_ranges(&self, region: &RamRegion) -> Vec<(u64, u64)>;
}

/// Dirty log of KVM memory slots.
pub struct KvmDirtyLog {
    vm_fd: Arc<VmFd>,
    mem_slots: Mutex<HashMap<u32, kvm_userspace_memory_region>>,
}

impl KvmDirtyLog {
    pub fn new(vm_fd: Arc<VmFd>) -> Self {
        KvmDirtyLog {
            vm_fd,
            mem_slots: Mutex::new(HashMap::new()),
        }
    }

    /// Map `region` into the guest at `guest_phys_addr`.
    pub fn register_region(&self, region: &RamRegion, guest_phys_addr: u64) -> Result<()> {
        let mem_region = kvm_userspace_memory_region {
            slot: region.slot(),
            flags: 0,
            guest_phys_addr,
            memory_size: region.used_length(),
            userspace_addr: region.host_address(),
        };
        // SAFETY: the host memory of region stays mapped while the region lives.
        unsafe {
            self.vm_fd
                .set_user_memory_region(mem_region)
                .with_context(|| format!("Failed to register memory slot {}", region.slot()))?;
        }
        self.lock_slots()?.insert(region.slot(), mem_region);
        Ok(())
    }

    fn lock_slots(&self) -> Result<std::sync::MutexGuard<HashMap<u32, kvm_userspace_memory_region>>> {
        self.mem_slots
            .lock()
            .map_err(|e| anyhow!("Failed to lock kvm memory slots: {}", e))
    }

    fn set_flags(&self, region: &RamRegion, flags: u32) -> Result<()> {
        let mut slots = self.lock_slots()?;
        let mem_region = slots
            .get_mut(&region.slot())
            .ok_or_else(|| anyhow!(MigrationError::UnknownRegion(region.name().to_string())))?;
        mem_region.flags = flags;
        // SAFETY: mem_region was registered from a live region.
        unsafe {
            self.vm_fd
                .set_user_memory_region(*mem_region)
                .with_context(|| {
                    format!(
                        "Failed to update dirty log of slot {}, error is {}",
                        region.slot(),
                        std::io::Error::last_os_error()
                    )
                })
        }
    }
}

impl DirtyLogSource for KvmDirtyLog {
    fn start_dirty_log(&self, region: &RamRegion) -> Result<()> {
        self.set_flags(region, KVM_MEM_LOG_DIRTY_PAGES)
    }

    fn stop_dirty_log(&self, region: &RamRegion) -> Result<()> {
        self.set_flags(region, 0)
    }

    fn get_dirty_log(&self, region: &RamRegion) -> Result<Vec<u64>> {
        self.vm_fd
            .get_dirty_log(region.slot(), region.used_length() as usize)
            .map_err(|e| {
                anyhow!(MigrationError::DirtyLogErr(
                    region.name().to_string(),
                    e.to_string()
                ))
            })
    }
}

/// Dirty log kept in software, fed by `write`.
pub struct SoftDirtyLog {
    target_page_bits: u32,
    logs: Mutex<HashMap<String, Arc<Bitmap>>>,
}

impl SoftDirtyLog {
    pub fn new(target_page_bits: u32) -> Self {
        SoftDirtyLog {
            target_page_bits,
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn log_of(&self, region: &RamRegion) -> Result<Option<Arc<Bitmap>>> {
        let logs = self
            .logs
            .lock()
            .map_err(|e| anyhow!("Failed to lock soft dirty log: {}", e))?;
        Ok(logs.get(region.name()).cloned())
    }

    /// Write guest memory and log the touched pages.
    pub fn write(&self, region: &RamRegion, offset: u64, data: &[u8]) -> Result<()> {
        region.write(offset, data)?;
        if data.is_empty() {
            return Ok(());
        }
        if let Some(log) = self.log_of(region)? {
            let first = offset >> self.target_page_bits;
            let last = (offset + data.len() as u64 - 1) >> self.target_page_bits;
            log.set_range(first as usize, (last - first + 1) as usize)?;
        }
        Ok(())
    }
}

impl DirtyLogSource for SoftDirtyLog {
    fn start_dirty_log(&self, region: &RamRegion) -> Result<()> {
        let mut logs = self
            .logs
            .lock()
            .map_err(|e| anyhow!("Failed to lock soft dirty log: {}", e))?;
        logs.entry(region.name().to_string()).or_insert_with(|| {
            Arc::new(Bitmap::new(region.pages(self.target_page_bits) as usize))
        });
        Ok(())
    }

    fn stop_dirty_log(&self, region: &RamRegion) -> Result<()> {
        let mut logs = self
            .logs
            .lock()
            .map_err(|e| anyhow!("Failed to lock soft dirty log: {}", e))?;
        logs.remove(region.name());
        Ok(())
    }

    fn get_dirty_log(&self, region: &RamRegion) -> Result<Vec<u64>> {
        match self.log_of(region)? {
            Some(log) => Ok(log.take_words()),
            None => Err(anyhow!(MigrationError::DirtyLogErr(
                region.name().to_string(),
                "dirty log is not started".to_string()
            ))),
        }
    }
}

/// Migration owned bitmaps of one region.
pub struct RegionBitmap {
    pub region: Arc<RamRegion>,
    /// One bit per target page, set means not sent since last sync.
    pub bmap: Bitmap,
    /// One bit per chunk, set means the hypervisor log of the chunk still
    /// needs to be re-armed.
    clear_bmap: Bitmap,
}

/// Dirty rate sampled over one evaluation period.
#[derive(Copy, Clone, Debug, Default)]
pub struct DirtyPeriod {
    pub bytes_dirty_period: u64,
    pub bytes_xfer_period: u64,
    pub elapsed_ms: u64,
}

/// Per region dirty bitmaps and the aggregate dirty page count.
pub struct DirtyTracker {
    bitmaps: Vec<RegionBitmap>,
    target_page_bits: u32,
    clear_bmap_shift: u8,
    log: Arc<dyn DirtyLogSource>,
    discard: Option<Arc<dyn DiscardManager>>,
    /// Sum of set bits of all bmaps.
    dirty_pages: u64,
    dirty_sync_count: u64,
    num_dirty_pages_period: u64,
    dirty_pages_rate: u64,
    time_last_bitmap_sync: Instant,
    bytes_xfer_prev: u64,
    log_started: bool,
}

impl DirtyTracker {
    /// Create the tracker of the not ignored `regions`.
    pub fn new(
        regions: &[Arc<RamRegion>],
        target_page_bits: u32,
        clear_bmap_shift: u8,
        log: Arc<dyn DirtyLogSource>,
        discard: Option<Arc<dyn DiscardManager>>,
    ) -> Self {
        let shift = clear_bmap_shift.clamp(CLEAR_BITMAP_SHIFT_MIN, CLEAR_BITMAP_SHIFT_MAX);
        if shift != clear_bmap_shift {
            warn!(
                "Clear bitmap shift {} is out of range, use {}",
                clear_bmap_shift, shift
            );
        }

        let bitmaps = regions
            .iter()
            .filter(|r| !r.is_ignored())
            .map(|r| {
                let pages = r.pages(target_page_bits);
                let chunks = (pages + (1 << shift) - 1) >> shift;
                RegionBitmap {
                    region: r.clone(),
                    bmap: Bitmap::new(pages as usize),
                    clear_bmap: Bitmap::new(chunks as usize),
                }
            })
            .collect();

        DirtyTracker {
            bitmaps,
            target_page_bits,
            clear_bmap_shift: shift,
            log,
            discard,
            dirty_pages: 0,
            dirty_sync_count: 0,
            num_dirty_pages_period: 0,
            dirty_pages_rate: 0,
            time_last_bitmap_sync: Instant::now(),
            bytes_xfer_prev: 0,
            log_started: false,
        }
    }

    pub fn set_discard_manager(&mut self, discard: Arc<dyn DiscardManager>) {
        self.discard = Some(discard);
    }

    /// Mark every page dirty, start the hypervisor log and do the first sync.
    pub fn init_bitmaps(&mut self) -> Result<()> {
        for rb in self.bitmaps.iter() {
            rb.bmap.fill();
            rb.clear_bmap.clear_all();
        }
        self.dirty_pages = self.bitmaps.iter().map(|rb| rb.bmap.len() as u64).sum();
        self.clear_discarded()?;

        for rb in self.bitmaps.iter() {
            self.log.start_dirty_log(&rb.region)?;
        }
        self.log_started = true;
        self.time_last_bitmap_sync = Instant::now();
        self.sync_all()
    }

    /// Stop the hypervisor log and forget all dirty state.
    pub fn stop(&mut self) {
        if self.log_started {
            for rb in self.bitmaps.iter() {
                if let Err(e) = self.log.stop_dirty_log(&rb.region) {
                    warn!("Failed to stop dirty log of {}: {:?}", rb.region.name(), e);
                }
            }
            self.log_started = false;
        }
        for rb in self.bitmaps.iter() {
            rb.bmap.clear_all();
            rb.clear_bmap.clear_all();
        }
        self.dirty_pages = 0;
    }

    /// Merge the hypervisor log of every region into its bitmap.
    pub fn sync_all(&mut self) -> Result<()> {
        self.dirty_sync_count += 1;
        for idx in 0..self.bitmaps.len() {
            let rb = &self.bitmaps[idx];
            let words = self.log.get_dirty_log(&rb.region)?;
            let added = rb.bmap.merge_words(&words)?;
            // Everything just fetched needs re-arming once it is cleared.
            rb.clear_bmap.fill();
            self.dirty_pages += added;
            self.num_dirty_pages_period += added;
            if added != 0 && self.discard.is_some() {
                self.clear_discarded_of(idx)?;
            }
        }
        debug!(
            "Dirty bitmap sync {}: {} dirty pages",
            self.dirty_sync_count, self.dirty_pages
        );
        Ok(())
    }

    /// Close the evaluation period if it lasted long enough.
    ///
    /// # Arguments
    ///
    /// * `bytes_transferred` - Total bytes sent by the session so far.
    pub fn take_period(&mut self, bytes_transferred: u64) -> Option<DirtyPeriod> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.time_last_bitmap_sync).as_millis();
        if elapsed <= DIRTY_PERIOD_MS {
            return None;
        }

        let period = DirtyPeriod {
            bytes_dirty_period: self.num_dirty_pages_period << self.target_page_bits,
            bytes_xfer_period: bytes_transferred.saturating_sub(self.bytes_xfer_prev),
            elapsed_ms: elapsed as u64,
        };
        self.dirty_pages_rate = self.num_dirty_pages_period * 1000 / elapsed as u64;
        self.time_last_bitmap_sync = now;
        self.num_dirty_pages_period = 0;
        self.bytes_xfer_prev = bytes_transferred;
        Some(period)
    }

    /// Test and clear the dirty bit of `page`, re-arming the hypervisor log
    /// of its chunk first. Must happen before the page content is read.
    pub fn clear_and_test(&mut self, idx: usize, page: u64) -> Result<bool> {
        let rb = &self.bitmaps[idx];
        let chunk = page >> self.clear_bmap_shift;
        if rb.clear_bmap.test_and_clear(chunk as usize)? {
            let start = chunk << self.clear_bmap_shift;
            let npages = std::cmp::min(1 << self.clear_bmap_shift, rb.bmap.len() as u64 - start);
            self.log.clear_dirty_log(&rb.region, start, npages)?;
        }

        let ret = rb.bmap.test_and_clear(page as usize)?;
        if ret {
            self.dirty_pages -= 1;
        }
        Ok(ret)
    }

    /// First dirty page of region `idx` at or after `start`, or the page
    /// count of the region.
    pub fn find_next_dirty(&self, idx: usize, start: u64) -> u64 {
        self.bitmaps[idx].bmap.find_next_bit(start as usize) as u64
    }

    /// First clean page of region `idx` at or after `start`, or the page
    /// count of the region.
    pub fn find_next_clean(&self, idx: usize, start: u64) -> u64 {
        self.bitmaps[idx].bmap.find_next_zero_bit(start as usize) as u64
    }

    pub fn is_dirty(&self, idx: usize, page: u64) -> bool {
        self.bitmaps[idx].bmap.contain(page as usize).unwrap_or(false)
    }

    /// Mark `npages` pages dirty, used when whole host pages must be resent.
    pub fn mark_dirty(&mut self, idx: usize, start: u64, npages: u64) -> Result<()> {
        let rb = &self.bitmaps[idx];
        for page in start..start + npages {
            if !rb.bmap.test_and_set(page as usize)? {
                self.dirty_pages += 1;
            }
        }
        Ok(())
    }

    /// Drop pages the guest reported as free from the bitmap.
    pub fn free_page_hint(&mut self, idx: usize, start_page: u64, npages: u64) -> Result<()> {
        let rb = &self.bitmaps[idx];
        let npages = std::cmp::min(npages, (rb.bmap.len() as u64).saturating_sub(start_page));
        let cleared = rb.bmap.clear_range(start_page as usize, npages as usize)?;
        self.dirty_pages -= cleared;
        Ok(())
    }

    fn clear_discarded(&mut self) -> Result<()> {
        for idx in 0..self.bitmaps.len() {
            self.clear_discarded_of(idx)?;
        }
        Ok(())
    }

    fn clear_discarded_of(&mut self, idx: usize) -> Result<()> {
        let discard = match &self.discard {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        let rb = &self.bitmaps[idx];
        let pages = rb.bmap.len() as u64;
        let mut cleared = 0;
        for (offset, len) in discard.discarded_ranges(&rb.region) {
            let first = offset >> self.target_page_bits;
            if first >= pages {
                continue;
            }
            let npages = std::cmp::min(len >> self.target_page_bits, pages - first);
            cleared += rb.bmap.clear_range(first as usize, npages as usize)?;
        }
        self.dirty_pages -= cleared;
        Ok(())
    }

    /// Replace the bitmap of region `idx` by the pages the destination has
    /// not received, `received` being its receive bitmap.
    pub fn reload_from_received(&mut self, idx: usize, received: &Bitmap) -> Result<()> {
        let rb = &self.bitmaps[idx];
        rb.bmap.load_le_bytes(&received.to_le_bytes())?;
        rb.bmap.complement();
        rb.clear_bmap.fill();
        self.clear_discarded_of(idx)?;
        self.count_dirty_pages();
        Ok(())
    }

    /// Recompute the aggregate count from the bitmaps.
    pub fn count_dirty_pages(&mut self) -> u64 {
        self.dirty_pages = self.bitmaps.iter().map(|rb| rb.bmap.count_ones()).sum();
        self.dirty_pages
    }

    pub fn dirty_pages(&self) -> u64 {
        self.dirty_pages
    }

    pub fn dirty_sync_count(&self) -> u64 {
        self.dirty_sync_count
    }

    pub fn dirty_pages_rate(&self) -> u64 {
        self.dirty_pages_rate
    }

    pub fn bitmaps(&self) -> &[RegionBitmap] {
        &self.bitmaps
    }

    pub fn region(&self, idx: usize) -> &Arc<RamRegion> {
        &self.bitmaps[idx].region
    }

    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Index of the tracked region named `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.bitmaps.iter().position(|rb| rb.region.name() == name)
    }

    /// Total bytes of the tracked regions.
    pub fn total_bytes(&self) -> u64 {
        self.bitmaps.iter().map(|rb| rb.region.used_length()).sum()
    }
}
