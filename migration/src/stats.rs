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

use serde::Serialize;

/// Delta compression counters.
#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct XbzrleStats {
    /// Encoded bytes, record headers excluded.
    pub bytes: u64,
    pub pages: u64,
    pub cache_miss: u64,
    pub cache_hit: u64,
    pub overflow: u64,
    pub cache_miss_rate: f64,
    pub encoding_rate: f64,
}

/// Parallel compression counters.
#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct CompressStats {
    pub pages: u64,
    /// Pages sent raw because every slot was busy.
    pub busy: u64,
    /// Compressed bytes, record headers excluded.
    pub compressed_size: u64,
    pub busy_rate: f64,
    pub compression_rate: f64,
}

/// Snapshot of the counters of a session.
#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct MigrationStats {
    pub transferred: u64,
    pub remaining: u64,
    pub total: u64,
    pub normal_pages: u64,
    pub zero_pages: u64,
    /// Bytes sent through the parallel bulk channels.
    pub multifd_bytes: u64,
    pub postcopy_requests: u64,
    pub dirty_sync_count: u64,
    pub dirty_pages_rate: u64,
    pub throttle_percentage: u64,
    pub xbzrle: XbzrleStats,
    pub compress: CompressStats,
}

/// Running counters and the values they had at the previous period.
#[derive(Default)]
pub(crate) struct RamCounters {
    pub normal_pages: u64,
    pub zero_pages: u64,
    /// Bytes moved by a transport save hook.
    pub hook_bytes: u64,
    pub target_page_count: u64,
    pub xbzrle: XbzrleStats,
    pub compress: CompressStats,
    target_page_count_prev: u64,
    xbzrle_cache_miss_prev: u64,
    xbzrle_bytes_prev: u64,
    xbzrle_pages_prev: u64,
    compress_busy_prev: u64,
    compress_pages_prev: u64,
    compressed_size_prev: u64,
}

impl RamCounters {
    /// Recompute the ratios over the pages sent since the last period.
    pub fn update_rates(&mut self, target_page_size: u64) {
        let page_count = self.target_page_count - self.target_page_count_prev;
        if page_count == 0 {
            return;
        }

        let x = &mut self.xbzrle;
        x.cache_miss_rate = (x.cache_miss - self.xbzrle_cache_miss_prev) as f64 / page_count as f64;
        self.xbzrle_cache_miss_prev = x.cache_miss;
        let unencoded = ((x.pages - self.xbzrle_pages_prev) * target_page_size) as f64;
        let encoded = (x.bytes - self.xbzrle_bytes_prev) as f64;
        x.encoding_rate = if x.pages == self.xbzrle_pages_prev || encoded == 0.0 {
            0.0
        } else {
            unencoded / encoded
        };
        self.xbzrle_pages_prev = x.pages;
        self.xbzrle_bytes_prev = x.bytes;

        let c = &mut self.compress;
        c.busy_rate = (c.busy - self.compress_busy_prev) as f64 / page_count as f64;
        self.compress_busy_prev = c.busy;
        let compressed = c.compressed_size - self.compressed_size_prev;
        if compressed != 0 {
            let uncompressed = ((c.pages - self.compress_pages_prev) * target_page_size) as f64;
            c.compression_rate = uncompressed / compressed as f64;
            self.compress_pages_prev = c.pages;
            self.compressed_size_prev = c.compressed_size;
        }

        self.target_page_count_prev = self.target_page_count;
    }
}
