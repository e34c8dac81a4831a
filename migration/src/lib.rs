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

//! # Migration
//!
//! Live migration of guest ram: dirty page tracking, page scanning,
//! delta and parallel compression, postcopy with preemption, auto-converge
//! and the ram record stream.

pub mod codec;
pub mod compress;
pub mod config;
pub mod dirty;
pub mod error;
pub mod load;
pub mod multifd;
pub mod postcopy;
pub mod region;
pub mod save;
pub mod scanner;
pub mod session;
pub mod stats;
pub mod status;
pub mod throttle;
pub mod xbzrle;

pub use anyhow::Result;

pub use codec::{Channel, MemoryPipe, MigrationStream, MigrationStreamReader};
pub use config::{ConfigCheck, MigrationConfig};
pub use dirty::{DirtyLogSource, DiscardManager, KvmDirtyLog, SoftDirtyLog};
pub use error::MigrationError;
pub use load::{LoadHook, RamLoadState};
pub use region::RamRegion;
pub use save::SaveHook;
pub use scanner::PageRequestQueue;
pub use session::{DiscardRange, DrainHook, IterState, PendingSize, RamSaveState};
pub use stats::MigrationStats;
pub use status::MigrationStatus;
pub use throttle::{CpuThrottle, SharedCpuThrottle};
