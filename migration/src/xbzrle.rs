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

//! XOR based zero run length encoding of a page against its previously
//! sent content, and the cache holding that content.
//!
//! An encoded page is a sequence of
//! `uleb128(unchanged run) uleb128(changed run) changed bytes` tuples.
//! A trailing unchanged run is not encoded.

use anyhow::{anyhow, bail, Result};
use log::warn;

use crate::MigrationError;
use util::num_ops::pow2_floor;

/// Entries younger than this many bitmap syncs are never evicted.
const CACHED_PAGE_LIFETIME: u64 = 2;

fn uleb128_encode(dst: &mut [u8], mut value: usize) -> Option<usize> {
    let mut n = 0;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        *dst.get_mut(n)? = byte;
        n += 1;
        if value == 0 {
            return Some(n);
        }
    }
}

fn uleb128_decode(src: &[u8]) -> Option<(usize, usize)> {
    let mut value: usize = 0;
    for (n, byte) in src.iter().enumerate().take(4) {
        value |= ((byte & 0x7f) as usize) << (7 * n);
        if byte & 0x80 == 0 {
            return Some((value, n + 1));
        }
    }
    None
}

/// Encode `new` against `old` into `dst`.
///
/// Returns the encoded length, 0 when the page is unchanged, or `None` when
/// the encoding doesn't fit in `dst`.
pub fn xbzrle_encode_buffer(old: &[u8], new: &[u8], dst: &mut [u8]) -> Option<usize> {
    let slen = std::cmp::min(old.len(), new.len());
    let mut i = 0;
    let mut d = 0;

    while i < slen {
        let zrun_start = i;
        while i < slen && old[i] == new[i] {
            i += 1;
        }
        if i == slen {
            break;
        }
        d += uleb128_encode(&mut dst[d..], i - zrun_start)?;

        let nzrun_start = i;
        while i < slen && old[i] != new[i] {
            i += 1;
        }
        let nzrun_len = i - nzrun_start;
        d += uleb128_encode(&mut dst[d..], nzrun_len)?;
        if d + nzrun_len > dst.len() {
            return None;
        }
        dst[d..d + nzrun_len].copy_from_slice(&new[nzrun_start..i]);
        d += nzrun_len;
    }

    Some(d)
}

/// Apply the encoded delta `src` on top of `dst`, return the bytes covered.
pub fn xbzrle_decode_buffer(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    let err = |msg: &str| anyhow!(MigrationError::XbzrleLoadErr(msg.to_string()));
    let mut i = 0;
    let mut d = 0;

    while i < src.len() {
        let (zrun, n) = uleb128_decode(&src[i..]).ok_or_else(|| err("bad zero run"))?;
        // Only the first run may be empty.
        if i != 0 && zrun == 0 {
            return Err(err("empty zero run"));
        }
        i += n;
        d += zrun;
        if d > dst.len() {
            return Err(err("zero run overflows page"));
        }

        let (nzrun, n) = uleb128_decode(&src[i..]).ok_or_else(|| err("bad data run"))?;
        if nzrun == 0 {
            return Err(err("empty data run"));
        }
        i += n;
        if d + nzrun > dst.len() || i + nzrun > src.len() {
            return Err(err("data run overflows page"));
        }
        dst[d..d + nzrun].copy_from_slice(&src[i..i + nzrun]);
        d += nzrun;
        i += nzrun;
    }

    Ok(d)
}

struct CacheItem {
    addr: u64,
    age: u64,
    data: Vec<u8>,
}

/// Direct mapped cache of sent pages, indexed by guest address.
pub struct PageCache {
    items: Vec<Option<CacheItem>>,
    page_size: u64,
    max_items: u64,
}

impl PageCache {
    /// Create a cache able to hold `cache_size` bytes of pages.
    pub fn new(cache_size: u64, page_size: u64) -> Result<Self> {
        if page_size == 0 || cache_size < page_size {
            bail!(MigrationError::IllegalValue(
                "xbzrle cache size".to_string(),
                page_size,
                true,
                u64::MAX,
                true
            ));
        }
        let max_items = pow2_floor(cache_size / page_size);
        let mut items = Vec::new();
        items
            .try_reserve_exact(max_items as usize)
            .map_err(|e| anyhow!("Failed to allocate xbzrle cache: {}", e))?;
        items.resize_with(max_items as usize, || None);

        Ok(PageCache {
            items,
            page_size,
            max_items,
        })
    }

    fn pos(&self, addr: u64) -> usize {
        ((addr / self.page_size) & (self.max_items - 1)) as usize
    }

    pub fn max_items(&self) -> u64 {
        self.max_items
    }

    /// Check whether `addr` is cached, refreshing its age on hit.
    pub fn is_cached(&mut self, addr: u64, current_age: u64) -> bool {
        let pos = self.pos(addr);
        match self.items[pos].as_mut() {
            Some(item) if item.addr == addr => {
                item.age = current_age;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, addr: u64) -> Option<&[u8]> {
        match &self.items[self.pos(addr)] {
            Some(item) if item.addr == addr => Some(&item.data),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, addr: u64) -> Option<&mut [u8]> {
        let pos = self.pos(addr);
        match self.items[pos].as_mut() {
            Some(item) if item.addr == addr => Some(&mut item.data),
            _ => None,
        }
    }

    /// Store `data` as the content of `addr`.
    ///
    /// Returns false if the slot holds another page inserted too recently,
    /// or the page buffer can't be allocated.
    pub fn insert(&mut self, addr: u64, data: &[u8], current_age: u64) -> bool {
        let pos = self.pos(addr);
        let page_size = self.page_size as usize;
        match self.items[pos].as_mut() {
            Some(item) => {
                if item.addr != addr && item.age + CACHED_PAGE_LIFETIME > current_age {
                    return false;
                }
                item.data.copy_from_slice(&data[..page_size]);
                item.addr = addr;
                item.age = current_age;
            }
            None => {
                let mut buf = Vec::new();
                if buf.try_reserve_exact(page_size).is_err() {
                    warn!("Failed to allocate xbzrle cache page");
                    return false;
                }
                buf.extend_from_slice(&data[..page_size]);
                self.items[pos] = Some(CacheItem {
                    addr,
                    age: current_age,
                    data: buf,
                });
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_delta() {
        let old = vec![0x11_u8; 4096];
        let mut new = old.clone();
        new[0] = 0x22;
        new[100..110].copy_from_slice(&[0x33; 10]);
        new[4095] = 0x44;

        let mut encoded = vec![0_u8; 4096];
        let len = xbzrle_encode_buffer(&old, &new, &mut encoded).unwrap();
        // (0, 1, b) (99, 10, 10b) (3985, 1, b)
        assert_eq!(len, 3 + 12 + 4);

        let mut page = old.clone();
        assert_eq!(xbzrle_decode_buffer(&encoded[..len], &mut page).unwrap(), 4096);
        assert_eq!(page, new);
    }

    #[test]
    fn test_encode_unchanged_and_overflow() {
        let old = vec![0_u8; 4096];
        let mut dst = vec![0_u8; 4096];
        assert_eq!(xbzrle_encode_buffer(&old, &old, &mut dst), Some(0));

        // Every other byte changed costs more than a page.
        let new: Vec<u8> = (0..4096).map(|i| (i % 2) as u8).collect();
        assert_eq!(xbzrle_encode_buffer(&old, &new, &mut dst), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut page = vec![0_u8; 16];
        // Data run longer than the page.
        assert!(xbzrle_decode_buffer(&[0, 20], &mut page).is_err());
        // Empty data run.
        assert!(xbzrle_decode_buffer(&[1, 0], &mut page).is_err());
        // Empty zero run after the first tuple.
        assert!(xbzrle_decode_buffer(&[0, 1, 9, 0, 1, 9], &mut page).is_err());
        // Data run truncated.
        assert!(xbzrle_decode_buffer(&[0, 4, 1, 2], &mut page).is_err());
    }

    #[test]
    fn test_page_cache() {
        // Three pages round down to two slots.
        let mut cache = PageCache::new(3 * 4096, 4096).unwrap();
        assert_eq!(cache.max_items(), 2);

        let page_a = vec![0xaa_u8; 4096];
        let page_b = vec![0xbb_u8; 4096];
        assert!(!cache.is_cached(0, 1));
        assert!(cache.insert(0, &page_a, 1));
        assert!(cache.is_cached(0, 1));
        assert_eq!(cache.get(0).unwrap()[0], 0xaa);

        // Address 0x2000 shares the slot of 0 and can't evict a young entry.
        assert!(!cache.insert(0x2000, &page_b, 2));
        assert!(cache.insert(0x2000, &page_b, 3));
        assert!(!cache.is_cached(0, 3));
        assert_eq!(cache.get(0x2000).unwrap()[0], 0xbb);

        cache.get_mut(0x2000).unwrap()[0] = 0xcc;
        assert_eq!(cache.get(0x2000).unwrap()[0], 0xcc);
        assert!(PageCache::new(1024, 4096).is_err());
    }
}
