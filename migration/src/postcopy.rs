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

//! Postcopy channel selection and preemption.
//!
//! Background pages go on the precopy channel. With preemption enabled an
//! urgent request arriving while a huge page is being sent interrupts it:
//! the position is saved, the urgent page goes on the postcopy channel and
//! the huge page is resumed from the saved position afterwards.

use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use log::{debug, trace};
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iowr_nr};

use crate::codec::{Channel, MigrationStream, RAM_SAVE_FLAG_EOS};
use crate::config::PostcopyConfig;
use crate::region::RamRegion;
use crate::scanner::PageSearchStatus;
use crate::MigrationError;

const UFFD_API: u64 = 0xAA;
const UFFD_FEATURE_PAGEFAULT_FLAG_WP: u64 = 1 << 0;

#[repr(C)]
#[derive(Default)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

ioctl_iowr_nr!(UFFDIO_API, 0xAA, 0x3F, UffdioApi);

/// Check that userfaultfd write protection is available on the host.
pub fn probe_write_protect() -> Result<()> {
    let unsupported =
        |msg: String| anyhow!(MigrationError::PostcopyWriteProtectUnsupported(msg));

    // SAFETY: userfaultfd takes only flags and returns a new fd or -1.
    let fd = unsafe { libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if fd < 0 {
        return Err(unsupported(format!(
            "userfaultfd: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: fd was just created and is owned by nobody else.
    let uffd = unsafe { File::from_raw_fd(fd as i32) };

    let mut api = UffdioApi {
        api: UFFD_API,
        features: UFFD_FEATURE_PAGEFAULT_FLAG_WP,
        ioctls: 0,
    };
    // SAFETY: uffd is a valid userfaultfd and api outlives the call.
    let ret = unsafe { ioctl_with_mut_ref(&uffd, UFFDIO_API(), &mut api) };
    if ret < 0 {
        return Err(unsupported(format!(
            "UFFDIO_API: {}",
            std::io::Error::last_os_error()
        )));
    }
    if api.features & UFFD_FEATURE_PAGEFAULT_FLAG_WP == 0 {
        return Err(unsupported("missing UFFD_FEATURE_PAGEFAULT_FLAG_WP".to_string()));
    }
    Ok(())
}

/// State of the postcopy channel controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PreemptState {
    /// Only background pages are flowing.
    Background,
    /// A huge background page is being sent.
    SendingLargePage,
    /// A huge page was interrupted, its position is saved.
    Preempted,
    /// An urgent page is being sent with nothing preempted.
    ServicingUrgent,
}

/// Position of an interrupted huge page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PreemptSnapshot {
    pub region: usize,
    pub page: u64,
}

pub struct PostcopyPreempt {
    config: PostcopyConfig,
    state: PreemptState,
    snapshot: Option<PreemptSnapshot>,
}

impl PostcopyPreempt {
    pub fn new(config: PostcopyConfig) -> Self {
        PostcopyPreempt {
            config,
            state: PreemptState::Background,
            snapshot: None,
        }
    }

    pub fn state(&self) -> PreemptState {
        self.state
    }

    pub fn snapshot(&self) -> Option<PreemptSnapshot> {
        self.snapshot
    }

    /// Preemption is possible at all for the session.
    pub fn enabled(&self, in_postcopy: bool) -> bool {
        self.config.preempt && in_postcopy
    }

    /// Whether sending `pss` must stop in favour of a queued request.
    ///
    /// # Arguments
    ///
    /// * `pss` - Page about to be sent.
    /// * `region` - Region of `pss`.
    /// * `target_page_size` - Base page size of the stream.
    /// * `in_postcopy` - The session runs in postcopy.
    /// * `has_request` - A fault request is queued.
    pub fn needs_preempt(
        &self,
        pss: &PageSearchStatus,
        region: &RamRegion,
        target_page_size: u64,
        in_postcopy: bool,
        has_request: bool,
    ) -> bool {
        if !self.config.preempt || !self.config.break_huge {
            return false;
        }
        if region.page_size() == target_page_size || !in_postcopy {
            return false;
        }
        // A requested page has the same priority as any new request.
        if pss.postcopy_requested {
            return false;
        }
        has_request
    }

    /// Save the position of `pss` and mark the controller preempted.
    pub fn do_preempt(&mut self, pss: &PageSearchStatus) {
        debug!(
            "Postcopy preempted region {} page {:#x}",
            pss.region, pss.page
        );
        self.snapshot = Some(PreemptSnapshot {
            region: pss.region,
            page: pss.page,
        });
        self.state = PreemptState::Preempted;
    }

    pub fn triggered(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Whether `page` of `region` lies in the host page of the snapshot.
    pub fn contains(&self, region: usize, page: u64, host_page_pages: u64) -> bool {
        match self.snapshot {
            Some(s) if s.region == region => {
                let pages = std::cmp::max(host_page_pages, 1);
                s.page / pages == page / pages
            }
            _ => false,
        }
    }

    /// Point `pss` back at the preempted page. The rest of that page lives on
    /// the precopy channel whoever asked for it.
    pub fn restore(&mut self, pss: &mut PageSearchStatus, postcopy_requested: bool) {
        if let Some(s) = self.snapshot.take() {
            pss.region = s.region;
            pss.page = s.page;
            pss.postcopy_requested = postcopy_requested;
            pss.target_channel = Channel::Precopy;
            debug!("Postcopy restored region {} page {:#x}", s.region, s.page);
        }
        self.state = PreemptState::SendingLargePage;
    }

    /// Record what kind of page is about to be sent.
    pub fn begin_host_page(&mut self, pss: &PageSearchStatus, huge: bool) {
        if self.snapshot.is_some() {
            return;
        }
        self.state = if pss.postcopy_requested {
            PreemptState::ServicingUrgent
        } else if huge {
            PreemptState::SendingLargePage
        } else {
            PreemptState::Background
        };
    }

    /// Forget any preemption, used when the session restarts or ends.
    pub fn reset(&mut self) {
        self.snapshot = None;
        self.state = PreemptState::Background;
    }
}

/// Output channels of a session and the one records currently go to.
pub struct ChannelSelector {
    precopy: MigrationStream,
    postcopy: Option<MigrationStream>,
    current: Channel,
    /// Region named last on the current channel.
    last_sent_block: Option<usize>,
}

impl ChannelSelector {
    pub fn new(precopy: MigrationStream, postcopy: Option<MigrationStream>) -> Self {
        ChannelSelector {
            precopy,
            postcopy,
            current: Channel::Precopy,
            last_sent_block: None,
        }
    }

    pub fn current(&self) -> Channel {
        self.current
    }

    /// Add or replace the urgent page channel.
    pub fn set_postcopy_stream(&mut self, stream: MigrationStream) {
        self.postcopy = Some(stream);
        if self.current == Channel::Postcopy {
            self.last_sent_block = None;
        }
    }

    /// Stream of the background channel, which also carries EOS.
    pub fn precopy(&mut self) -> &mut MigrationStream {
        &mut self.precopy
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        match channel {
            Channel::Precopy => true,
            Channel::Postcopy => self.postcopy.is_some(),
        }
    }

    /// Stream of the current channel.
    pub fn stream(&mut self) -> &mut MigrationStream {
        match (self.current, &mut self.postcopy) {
            (Channel::Postcopy, Some(s)) => s,
            _ => &mut self.precopy,
        }
    }

    /// Switch to `channel` if it differs from the current one.
    pub fn choose(&mut self, channel: Channel) {
        if channel == self.current || !self.has_channel(channel) {
            return;
        }
        self.current = channel;
        // Region names are channel local.
        self.last_sent_block = None;
        trace!("Switched to {} channel", channel);
    }

    /// Go back to the precopy channel.
    pub fn reset(&mut self) {
        self.choose(Channel::Precopy);
    }

    /// End the urgent channel with an EOS, its reader stops there.
    pub fn close_postcopy(&mut self) {
        if let Some(s) = self.postcopy.as_mut() {
            s.put_be64(RAM_SAVE_FLAG_EOS);
        }
    }

    pub fn last_sent_block(&self) -> Option<usize> {
        self.last_sent_block
    }

    /// Forget the region named last, the next record names its region.
    pub fn reset_last_sent_block(&mut self) {
        self.last_sent_block = None;
    }

    /// Write the header of a record of region `idx` on the current channel.
    pub fn put_page_header(&mut self, idx: usize, name: &str, offset: u64) -> u64 {
        let cont = self.last_sent_block == Some(idx);
        self.last_sent_block = Some(idx);
        self.stream().put_page_header(name, offset, cont)
    }

    pub fn fflush_all(&mut self) {
        self.precopy.fflush();
        if let Some(s) = self.postcopy.as_mut() {
            s.fflush();
        }
    }

    /// First latched error of any channel.
    pub fn get_error(&self) -> Result<()> {
        self.precopy.get_error()?;
        match &self.postcopy {
            Some(s) => s.get_error(),
            None => Ok(()),
        }
    }

    /// Bytes handed to all channels.
    pub fn transferred(&self) -> u64 {
        self.precopy.transferred() + self.postcopy.as_ref().map_or(0, |s| s.transferred())
    }
}

/// Staging buffer assembling one host page on the destination.
pub struct PostcopyTmpPage {
    pub buf: Arc<Mutex<Vec<u8>>>,
    /// Base pages received for the host page being assembled.
    pub target_pages: u64,
    pub all_zero: bool,
    /// Region and host page offset being assembled.
    pub host: Option<(usize, u64)>,
}

impl PostcopyTmpPage {
    pub fn new(max_page_size: u64) -> Self {
        PostcopyTmpPage {
            buf: Arc::new(Mutex::new(vec![0_u8; max_page_size as usize])),
            target_pages: 0,
            all_zero: true,
            host: None,
        }
    }

    /// Account one base page of `region` at `addr`.
    ///
    /// Returns the offset of the base page in the buffer and whether the
    /// host page is complete.
    pub fn add(
        &mut self,
        idx: usize,
        region: &RamRegion,
        addr: u64,
        target_page_size: u64,
    ) -> Result<(usize, bool)> {
        let page_size = region.page_size();
        let host_offset = addr & !(page_size - 1);
        self.target_pages += 1;
        if self.target_pages == 1 {
            self.host = Some((idx, host_offset));
        } else if self.host != Some((idx, host_offset)) {
            let expected = self.host.map(|(_, off)| off).unwrap_or_default();
            return Err(anyhow!(MigrationError::NonSameHostPage(expected, host_offset)));
        }
        let complete = self.target_pages == page_size / target_page_size;
        Ok(((addr - host_offset) as usize, complete))
    }

    pub fn reset(&mut self) {
        self.target_pages = 0;
        self.all_zero = true;
        self.host = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MemoryPipe;

    const PAGE: u64 = 4096;

    fn preempt_config() -> PostcopyConfig {
        PostcopyConfig {
            enabled: true,
            preempt: true,
            ..Default::default()
        }
    }

    fn pss(region: usize, page: u64) -> PageSearchStatus {
        PageSearchStatus {
            region,
            page,
            ..Default::default()
        }
    }

    #[test]
    fn test_needs_preempt_conditions() {
        let huge = RamRegion::new("huge", 16 * PAGE, 4 * PAGE).unwrap();
        let small = RamRegion::new("small", 16 * PAGE, PAGE).unwrap();
        let preempt = PostcopyPreempt::new(preempt_config());
        let p = pss(0, 1);

        assert!(preempt.needs_preempt(&p, &huge, PAGE, true, true));
        assert!(!preempt.needs_preempt(&p, &huge, PAGE, true, false));
        assert!(!preempt.needs_preempt(&p, &huge, PAGE, false, true));
        assert!(!preempt.needs_preempt(&p, &small, PAGE, true, true));

        let mut requested = p;
        requested.postcopy_requested = true;
        assert!(!preempt.needs_preempt(&requested, &huge, PAGE, true, true));

        let no_break = PostcopyPreempt::new(PostcopyConfig {
            break_huge: false,
            ..preempt_config()
        });
        assert!(!no_break.needs_preempt(&p, &huge, PAGE, true, true));
    }

    #[test]
    fn test_preempt_and_restore() {
        let mut preempt = PostcopyPreempt::new(preempt_config());
        assert_eq!(preempt.state(), PreemptState::Background);

        preempt.begin_host_page(&pss(1, 4), true);
        assert_eq!(preempt.state(), PreemptState::SendingLargePage);

        preempt.do_preempt(&pss(1, 6));
        assert!(preempt.triggered());
        assert_eq!(preempt.state(), PreemptState::Preempted);
        assert!(preempt.contains(1, 4, 4));
        assert!(preempt.contains(1, 7, 4));
        assert!(!preempt.contains(1, 8, 4));
        assert!(!preempt.contains(0, 6, 4));

        // Urgent pages sent meanwhile keep the snapshot.
        let mut urgent = pss(0, 3);
        urgent.postcopy_requested = true;
        preempt.begin_host_page(&urgent, false);
        assert_eq!(preempt.state(), PreemptState::Preempted);

        let mut p = urgent;
        p.target_channel = Channel::Postcopy;
        preempt.restore(&mut p, true);
        assert_eq!((p.region, p.page), (1, 6));
        assert_eq!(p.target_channel, Channel::Precopy);
        assert!(p.postcopy_requested);
        assert!(!preempt.triggered());
        assert!(preempt.snapshot().is_none());
    }

    #[test]
    fn test_channel_switch_resets_naming() {
        let pre = MemoryPipe::new();
        let post = MemoryPipe::new();
        let mut channels = ChannelSelector::new(pre.writer("precopy"), Some(post.writer("postcopy")));

        assert_eq!(channels.put_page_header(0, "pc.ram", 0), 8 + 1 + 6);
        assert_eq!(channels.put_page_header(0, "pc.ram", PAGE), 8);

        // Choosing the current channel is a no-op.
        channels.choose(Channel::Precopy);
        assert_eq!(channels.last_sent_block(), Some(0));

        channels.choose(Channel::Postcopy);
        assert_eq!(channels.current(), Channel::Postcopy);
        assert_eq!(channels.put_page_header(0, "pc.ram", 0), 15);

        channels.reset();
        assert_eq!(channels.current(), Channel::Precopy);
        assert_eq!(channels.put_page_header(0, "pc.ram", 0), 15);

        channels.fflush_all();
        assert_eq!(pre.len(), 15 + 8 + 15);
        assert_eq!(post.len(), 15);
        assert_eq!(channels.transferred(), 15 + 8 + 15 + 15);
    }

    #[test]
    fn test_missing_postcopy_channel_is_not_chosen() {
        let pre = MemoryPipe::new();
        let mut channels = ChannelSelector::new(pre.writer("precopy"), None);
        channels.choose(Channel::Postcopy);
        assert_eq!(channels.current(), Channel::Precopy);
    }

    #[test]
    fn test_tmp_page_assembly() {
        let region = RamRegion::new("huge", 16 * PAGE, 4 * PAGE).unwrap();
        let mut tmp = PostcopyTmpPage::new(4 * PAGE);

        assert_eq!(tmp.add(0, &region, 4 * PAGE, PAGE).unwrap(), (0, false));
        assert_eq!(tmp.add(0, &region, 5 * PAGE, PAGE).unwrap(), (PAGE as usize, false));
        assert!(tmp.add(0, &region, 8 * PAGE, PAGE).is_err());

        tmp.reset();
        for i in 0..3 {
            assert!(!tmp.add(0, &region, (8 + i) * PAGE, PAGE).unwrap().1);
        }
        assert_eq!(tmp.add(0, &region, 11 * PAGE, PAGE).unwrap(), (3 * PAGE as usize, true));
    }
}
