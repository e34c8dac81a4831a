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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::info;

use crate::config::ThrottleConfig;
use crate::dirty::DirtyPeriod;

/// Periods in a row the dirty rate must stay high before throttling more.
const DIRTY_RATE_HIGH_PERIODS: u64 = 2;

/// Guest cpu throttle.
pub trait CpuThrottle: Send + Sync {
    fn active(&self) -> bool;

    /// Percentage of time the vcpus are kept off cpu.
    fn percentage(&self) -> u64;

    fn set(&self, pct: u64);

    fn stop(&self);
}

/// Throttle state shared with the vcpu threads, which sleep for
/// `percentage` of each time slice.
#[derive(Default)]
pub struct SharedCpuThrottle {
    pct: AtomicU64,
    active: AtomicBool,
}

impl SharedCpuThrottle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CpuThrottle for SharedCpuThrottle {
    fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn percentage(&self) -> u64 {
        self.pct.load(Ordering::Acquire)
    }

    fn set(&self, pct: u64) {
        self.pct.store(pct, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.pct.store(0, Ordering::Release);
    }
}

/// Slows the guest down when it dirties memory faster than it's sent.
pub struct ThrottleController {
    config: ThrottleConfig,
    throttle: Arc<dyn CpuThrottle>,
    dirty_rate_high_cnt: u64,
}

impl ThrottleController {
    pub fn new(config: ThrottleConfig, throttle: Arc<dyn CpuThrottle>) -> Self {
        ThrottleController {
            config,
            throttle,
            dirty_rate_high_cnt: 0,
        }
    }

    /// Evaluate one dirty period, return true if the throttle was raised.
    pub fn on_period(&mut self, period: &DirtyPeriod) -> bool {
        if !self.config.auto_converge {
            return false;
        }

        let bytes_dirty_threshold =
            period.bytes_xfer_period * self.config.trigger_threshold / 100;
        if period.bytes_dirty_period <= bytes_dirty_threshold {
            self.dirty_rate_high_cnt = 0;
            return false;
        }

        self.dirty_rate_high_cnt += 1;
        if self.dirty_rate_high_cnt < DIRTY_RATE_HIGH_PERIODS {
            return false;
        }
        self.dirty_rate_high_cnt = 0;
        self.throttle_guest_down(period.bytes_dirty_period, bytes_dirty_threshold);
        true
    }

    fn throttle_guest_down(&self, bytes_dirty_period: u64, bytes_dirty_threshold: u64) {
        let pct_max = self.config.max;

        if !self.throttle.active() {
            let pct = std::cmp::min(self.config.initial, pct_max);
            info!("Start throttling guest cpu at {}%", pct);
            self.throttle.set(pct);
            return;
        }

        let throttle_now = self.throttle.percentage();
        let throttle_inc = if self.config.tailslow {
            // Cut the gap to the rate that just matches the threshold, but
            // never by more than the plain increment.
            let cpu_now = 100_u64.saturating_sub(throttle_now);
            let ratio = bytes_dirty_threshold as f64 / bytes_dirty_period as f64;
            let cpu_ideal = (cpu_now as f64 * ratio) as u64;
            std::cmp::min(cpu_now.saturating_sub(cpu_ideal), self.config.increment)
        } else {
            self.config.increment
        };

        let pct = std::cmp::max(
            throttle_now,
            std::cmp::min(throttle_now + throttle_inc, pct_max),
        );
        if pct != throttle_now {
            info!("Raise guest cpu throttle from {}% to {}%", throttle_now, pct);
        }
        self.throttle.set(pct);
    }

    pub fn percentage(&self) -> u64 {
        if self.throttle.active() {
            self.throttle.percentage()
        } else {
            0
        }
    }

    /// Release the guest at the end of the session.
    pub fn stop(&mut self) {
        self.dirty_rate_high_cnt = 0;
        if self.throttle.active() {
            info!("Stop throttling guest cpu");
            self.throttle.stop();
        }
    }
}
