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

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::MigrationError;

pub const DEFAULT_TARGET_PAGE_SIZE: u64 = 4096;
const MIN_TARGET_PAGE_SIZE: u64 = 1024;
const MAX_TARGET_PAGE_SIZE: u64 = 64 * 1024;
/// Default xbzrle cache is 64MB.
pub const DEFAULT_XBZRLE_CACHE_SIZE: u64 = 64 * 1024 * 1024;
/// Bandwidth default is 128MB/s.
pub const DEFAULT_MAX_BANDWIDTH: u64 = 128 << 20;
const MAX_THREADS: u64 = 255;
const MAX_COMPRESS_LEVEL: u64 = 19;
const MAX_THROTTLE_PCT: u64 = 99;
const MAX_TRIGGER_THRESHOLD: u64 = 100;

/// One clear bit covers 2^18 pages (1GB of 4K pages) by default.
pub const CLEAR_BITMAP_SHIFT_DEFAULT: u8 = 18;
pub const CLEAR_BITMAP_SHIFT_MIN: u8 = 6;
pub const CLEAR_BITMAP_SHIFT_MAX: u8 = 31;

pub trait ConfigCheck: Send + Sync {
    /// To check the legality of Config structure.
    ///
    /// # Errors
    ///
    /// * `IllegalValue` - A number is out of its range.
    /// * `InvalidParam` - Two features can't be enabled together.
    fn check(&self) -> Result<()>;
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(MigrationError::IllegalValue(
            name.to_string(),
            min,
            true,
            max,
            true
        )));
    }
    Ok(())
}

/// Parallel compression parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressConfig {
    pub enabled: bool,
    pub threads: u64,
    pub decompress_threads: u64,
    pub level: u64,
    /// Block until a compression slot frees instead of sending the page raw.
    pub wait_thread: bool,
}

impl Default for CompressConfig {
    fn default() -> Self {
        CompressConfig {
            enabled: false,
            threads: 8,
            decompress_threads: 2,
            level: 1,
            wait_thread: true,
        }
    }
}

/// Delta compression parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XbzrleConfig {
    pub enabled: bool,
    pub cache_size: u64,
}

impl Default for XbzrleConfig {
    fn default() -> Self {
        XbzrleConfig {
            enabled: false,
            cache_size: DEFAULT_XBZRLE_CACHE_SIZE,
        }
    }
}

/// Auto-converge parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    pub auto_converge: bool,
    pub initial: u64,
    pub increment: u64,
    pub max: u64,
    /// Percentage of transferred bytes the dirtied bytes may reach in one period.
    pub trigger_threshold: u64,
    pub tailslow: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            auto_converge: false,
            initial: 20,
            increment: 10,
            max: 99,
            trigger_threshold: 50,
            tailslow: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostcopyConfig {
    pub enabled: bool,
    /// Send requested pages through a dedicated channel.
    pub preempt: bool,
    /// Allow a request to interrupt a huge page in the middle.
    pub break_huge: bool,
    /// Write protect guest memory for background snapshot.
    pub ram_wp: bool,
    /// Discard source pages once they were sent in postcopy.
    pub release_ram: bool,
}

impl Default for PostcopyConfig {
    fn default() -> Self {
        PostcopyConfig {
            enabled: false,
            preempt: false,
            break_huge: true,
            ram_wp: false,
            release_ram: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MultifdConfig {
    pub enabled: bool,
    pub channels: u64,
}

impl Default for MultifdConfig {
    fn default() -> Self {
        MultifdConfig {
            enabled: false,
            channels: 2,
        }
    }
}

/// Configuration of one ram migration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    pub target_page_size: u64,
    pub compress: CompressConfig,
    pub xbzrle: XbzrleConfig,
    pub throttle: ThrottleConfig,
    pub postcopy: PostcopyConfig,
    pub multifd: MultifdConfig,
    pub clear_bitmap_shift: u8,
    /// Bytes per second, 0 means unlimited.
    pub max_bandwidth: u64,
    pub downtime_limit_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            target_page_size: DEFAULT_TARGET_PAGE_SIZE,
            compress: CompressConfig::default(),
            xbzrle: XbzrleConfig::default(),
            throttle: ThrottleConfig::default(),
            postcopy: PostcopyConfig::default(),
            multifd: MultifdConfig::default(),
            clear_bitmap_shift: CLEAR_BITMAP_SHIFT_DEFAULT,
            max_bandwidth: DEFAULT_MAX_BANDWIDTH,
            downtime_limit_ms: 300,
        }
    }
}

impl MigrationConfig {
    /// Load config from a json file and check it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read migration config {}", path.display()))?;
        let config: MigrationConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow!(MigrationError::Json { source: e }))?;
        config.check()?;
        Ok(config)
    }

    pub fn target_page_bits(&self) -> u32 {
        self.target_page_size.trailing_zeros()
    }
}

impl ConfigCheck for MigrationConfig {
    fn check(&self) -> Result<()> {
        if !self.target_page_size.is_power_of_two() {
            return Err(anyhow!(MigrationError::Unaligned(
                "target page size".to_string(),
                self.target_page_size,
                2
            )));
        }
        check_range(
            "target page size",
            self.target_page_size,
            MIN_TARGET_PAGE_SIZE,
            MAX_TARGET_PAGE_SIZE,
        )?;

        check_range("compress threads", self.compress.threads, 1, MAX_THREADS)?;
        check_range(
            "decompress threads",
            self.compress.decompress_threads,
            1,
            MAX_THREADS,
        )?;
        check_range("compress level", self.compress.level, 0, MAX_COMPRESS_LEVEL)?;

        if self.xbzrle.enabled && self.xbzrle.cache_size < self.target_page_size {
            return Err(anyhow!(MigrationError::IllegalValue(
                "xbzrle cache size".to_string(),
                self.target_page_size,
                true,
                u64::MAX,
                true
            )));
        }

        check_range("throttle initial", self.throttle.initial, 1, MAX_THROTTLE_PCT)?;
        check_range("throttle increment", self.throttle.increment, 1, MAX_THROTTLE_PCT)?;
        check_range("throttle max", self.throttle.max, 1, MAX_THROTTLE_PCT)?;
        check_range(
            "throttle trigger threshold",
            self.throttle.trigger_threshold,
            1,
            MAX_TRIGGER_THRESHOLD,
        )?;

        check_range("multifd channels", self.multifd.channels, 1, MAX_THREADS)?;

        if self.postcopy.preempt && !self.postcopy.enabled {
            bail!(MigrationError::InvalidParam(
                "postcopy.preempt".to_string(),
                "postcopy disabled".to_string()
            ));
        }
        if self.multifd.enabled && self.compress.enabled {
            bail!(MigrationError::InvalidParam(
                "compress".to_string(),
                "multifd".to_string()
            ));
        }
        if self.postcopy.ram_wp && self.postcopy.enabled {
            bail!(MigrationError::InvalidParam(
                "postcopy.ram_wp".to_string(),
                "postcopy".to_string()
            ));
        }

        Ok(())
    }
}
