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

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use log::error;

use crate::MigrationError;
use util::num_ops::round_up;
use util::unix::{do_mmap, do_munmap, host_page_size, madvise};

/// Region names are sent with a one byte length prefix.
pub const MAX_REGION_NAME_LEN: usize = 255;

/// Record information of the memory mapping backing one region.
#[derive(Debug)]
struct RegionMemory {
    /// The start address of mapped memory.
    host_addr: *mut u8,
    /// Length of the mapping, aligned to host page size.
    size: u64,
}

// Send and Sync is not auto-implemented for raw pointer type
// implementing them is safe because field of RegionMemory won't change once initialized,
// only access(r/w) is permitted
unsafe impl Send for RegionMemory {}
unsafe impl Sync for RegionMemory {}

impl Drop for RegionMemory {
    /// Release the memory mapping.
    fn drop(&mut self) {
        if let Err(e) = do_munmap(self.host_addr as u64, self.size) {
            error!("Failed to unmap ram region memory: {:?}", e);
        }
    }
}

/// A contiguous guest memory range tracked for migration.
#[derive(Debug)]
pub struct RamRegion {
    /// Stable short name, identifies the region on the wire.
    name: String,
    memory: RegionMemory,
    /// Usable length of the region.
    used_length: u64,
    /// Native page granularity, may be a huge page.
    page_size: u64,
    /// Hypervisor memory slot of the region.
    slot: u32,
    /// Region is skipped by migration.
    ignored: bool,
}

impl RamRegion {
    /// Create a region backed by anonymous memory.
    ///
    /// # Arguments
    ///
    /// * `name` - Region name, no longer than 255 bytes.
    /// * `length` - Usable length.
    /// * `page_size` - Native page size of the backend.
    pub fn new(name: &str, length: u64, page_size: u64) -> Result<Arc<Self>> {
        if name.is_empty() || name.len() > MAX_REGION_NAME_LEN {
            bail!(MigrationError::InvalidParam(
                name.to_string(),
                "ram region name".to_string()
            ));
        }
        if !page_size.is_power_of_two() || length == 0 || length % page_size != 0 {
            return Err(anyhow!(MigrationError::Unaligned(
                format!("ram region {} length", name),
                length,
                page_size
            )));
        }

        let size = round_up(length, host_page_size())
            .with_context(|| format!("Ram region {} is too large", name))?;
        let host_addr = do_mmap(size, false)
            .with_context(|| format!("Failed to map memory for ram region {}", name))?;

        Ok(Arc::new(RamRegion {
            name: name.to_string(),
            memory: RegionMemory {
                host_addr: host_addr as *mut u8,
                size,
            },
            used_length: length,
            page_size,
            slot: 0,
            ignored: false,
        }))
    }

    /// Create a region bound to a hypervisor memory slot.
    pub fn with_slot(name: &str, length: u64, page_size: u64, slot: u32) -> Result<Arc<Self>> {
        let mut region = Self::new(name, length, page_size)?;
        if let Some(r) = Arc::get_mut(&mut region) {
            r.slot = slot;
        }
        Ok(region)
    }

    /// Create a region which migration skips.
    pub fn new_ignored(name: &str, length: u64, page_size: u64) -> Result<Arc<Self>> {
        let mut region = Self::new(name, length, page_size)?;
        if let Some(r) = Arc::get_mut(&mut region) {
            r.ignored = true;
        }
        Ok(region)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn used_length(&self) -> u64 {
        self.used_length
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    /// Get start `HVA` (host virtual address) of the region.
    #[inline]
    pub fn host_address(&self) -> u64 {
        self.memory.host_addr as u64
    }

    /// Whether `offset` lies in the usable part of the region.
    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        offset < self.used_length
    }

    /// Number of base pages of the region.
    pub fn pages(&self, target_page_bits: u32) -> u64 {
        self.used_length >> target_page_bits
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.used_length => Ok(()),
            _ => Err(anyhow!(MigrationError::IllegalOffset(
                self.name.clone(),
                offset
            ))),
        }
    }

    /// Copy region content at `offset` into `buf`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        // SAFETY: the range was checked against the mapping above, the guest
        // may write concurrently which only races on content.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.memory.host_addr.add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        // SAFETY: the range was checked against the mapping above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.memory.host_addr.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Fill `len` bytes at `offset` with `byte`.
    pub fn fill(&self, offset: u64, byte: u8, len: u64) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range was checked against the mapping above.
        unsafe {
            std::ptr::write_bytes(self.memory.host_addr.add(offset as usize), byte, len as usize);
        }
        Ok(())
    }

    /// Check whether `len` bytes at `offset` are all zero.
    pub fn is_zero(&self, offset: u64, len: u64) -> Result<bool> {
        self.check_range(offset, len)?;
        // SAFETY: the range was checked against the mapping above.
        let mem = unsafe {
            std::slice::from_raw_parts(self.memory.host_addr.add(offset as usize), len as usize)
        };
        Ok(buffer_is_zero(mem))
    }

    /// Give the pages back to the host, they read as zero afterwards.
    pub fn discard(&self, offset: u64, len: u64) -> Result<()> {
        self.check_range(offset, len)?;
        let page = host_page_size();
        if offset % page != 0 || len % page != 0 {
            // Partial host pages can't be released, zero them instead.
            return self.fill(offset, 0, len);
        }
        madvise(self.host_address() + offset, len, libc::MADV_DONTNEED)
            .with_context(|| format!("Failed to discard {:#x}@{:#x} of {}", len, offset, self.name))
    }
}

/// Check whether `buf` only contains zero bytes.
pub fn buffer_is_zero(buf: &[u8]) -> bool {
    // SAFETY: any bit pattern is a valid u64.
    let (prefix, words, suffix) = unsafe { buf.align_to::<u64>() };
    prefix.iter().all(|b| *b == 0) && words.iter().all(|w| *w == 0) && suffix.iter().all(|b| *b == 0)
}

/// Find a region by its name.
pub fn find_region<'a>(regions: &'a [Arc<RamRegion>], name: &str) -> Option<(usize, &'a Arc<RamRegion>)> {
    regions.iter().enumerate().find(|(_, r)| r.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_access() {
        let region = RamRegion::new("pc.ram", 64 * 1024, 4096).unwrap();
        assert_eq!(region.pages(12), 16);
        assert!(region.is_zero(0, 64 * 1024).unwrap());

        region.write(4096, &[1, 2, 3]).unwrap();
        let mut buf = [0_u8; 3];
        region.read(4096, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert!(!region.is_zero(4096, 4096).unwrap());

        region.discard(4096, 4096).unwrap();
        assert!(region.is_zero(4096, 4096).unwrap());

        assert!(region.read(64 * 1024 - 1, &mut buf).is_err());
        assert!(region.contains(64 * 1024 - 1));
        assert!(!region.contains(64 * 1024));

        let slotted = RamRegion::with_slot("vga.ram", 4096, 4096, 3).unwrap();
        assert_eq!(slotted.slot(), 3);
        assert!(!slotted.is_ignored());
    }

    #[test]
    fn test_region_invalid() {
        assert!(RamRegion::new("", 4096, 4096).is_err());
        assert!(RamRegion::new(&"x".repeat(256), 4096, 4096).is_err());
        assert!(RamRegion::new("ram", 6000, 4096).is_err());
        assert!(RamRegion::new("ram", 4096, 3000).is_err());
    }

    #[test]
    fn test_find_region() {
        let regions = vec![
            RamRegion::new("a", 4096, 4096).unwrap(),
            RamRegion::new_ignored("b", 4096, 4096).unwrap(),
        ];
        let (idx, region) = find_region(&regions, "b").unwrap();
        assert_eq!(idx, 1);
        assert!(region.is_ignored());
        assert!(find_region(&regions, "c").is_none());
    }
}
