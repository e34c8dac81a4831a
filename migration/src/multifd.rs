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

//! Parallel bulk channels.
//!
//! Raw pages are batched per region into packets and spread over the
//! channels round robin. A packet is
//!
//! ```text
//! be32 magic | be32 version | be32 flags | be32 pages | be64 packet number
//! u8 name len | name | be64 offset * pages | page data * pages
//! ```
//!
//! A packet with `MULTIFD_FLAG_SYNC` and no page marks the end of a phase on
//! its channel. The main stream writes EOS only after every channel acked
//! its sync packet, and the receiver holds every channel at its sync packet
//! until the main stream reached EOS.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use log::{error, info};

use crate::codec::{MigrationStream, MigrationStreamReader};
use crate::region::{find_region, RamRegion};
use crate::MigrationError;
use util::bitmap::Bitmap;

pub const MULTIFD_MAGIC: u32 = 0x1122_3344;
pub const MULTIFD_VERSION: u32 = 1;
pub const MULTIFD_FLAG_SYNC: u32 = 1 << 0;
/// Pages per packet.
const MULTIFD_PACKET_PAGES: usize = 128;
/// Packets queued per channel before the producer blocks.
const MULTIFD_QUEUE_DEPTH: usize = 4;

enum SendJob {
    Pages {
        region: Arc<RamRegion>,
        offsets: Vec<u64>,
    },
    Sync,
}

struct SendChannel {
    tx: Option<SyncSender<SendJob>>,
    handle: Option<JoinHandle<()>>,
}

/// Sending side of the bulk channels.
pub struct MultifdSender {
    channels: Vec<SendChannel>,
    next: usize,
    pending: Option<(usize, Arc<RamRegion>, Vec<u64>)>,
    ack_rx: Receiver<std::result::Result<(), String>>,
    bytes: Arc<AtomicU64>,
    page_size: u64,
}

impl MultifdSender {
    /// Start one thread per writer.
    pub fn new(writers: Vec<Box<dyn Write + Send>>, page_size: u64) -> Result<Self> {
        let (ack_tx, ack_rx) = channel();
        let bytes = Arc::new(AtomicU64::new(0));
        let packet_num = Arc::new(AtomicU64::new(0));
        let mut sender = MultifdSender {
            channels: Vec::with_capacity(writers.len()),
            next: 0,
            pending: None,
            ack_rx,
            bytes,
            page_size,
        };

        for (id, writer) in writers.into_iter().enumerate() {
            let (tx, rx) = sync_channel(MULTIFD_QUEUE_DEPTH);
            let stream = MigrationStream::new(&format!("multifd-{}", id), writer);
            let ack_tx = ack_tx.clone();
            let bytes = sender.bytes.clone();
            let packet_num = packet_num.clone();
            let handle = thread::Builder::new()
                .name(format!("multifd-send-{}", id))
                .spawn(move || multifd_send_thread(stream, rx, ack_tx, bytes, packet_num, page_size))
                .with_context(|| format!("Failed to create multifd send thread {}", id))?;
            sender.channels.push(SendChannel {
                tx: Some(tx),
                handle: Some(handle),
            });
        }
        info!("Started {} multifd send channels", sender.channels.len());
        Ok(sender)
    }

    /// Bytes written by all channels.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    fn send_job(&mut self, job: SendJob) -> Result<()> {
        let id = self.next;
        self.next = (self.next + 1) % self.channels.len();
        let tx = self.channels[id]
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!(MigrationError::MultifdPacketErr("channel closed".to_string())))?;
        tx.send(job).map_err(|_| {
            anyhow!(MigrationError::MultifdPacketErr(format!(
                "channel {} is gone",
                id
            )))
        })
    }

    fn flush_pending(&mut self) -> Result<()> {
        if let Some((_, region, offsets)) = self.pending.take() {
            self.send_job(SendJob::Pages { region, offsets })?;
        }
        Ok(())
    }

    /// Queue the page at `offset` of region `idx`.
    pub fn queue_page(&mut self, idx: usize, region: &Arc<RamRegion>, offset: u64) -> Result<()> {
        match self.pending.as_mut() {
            Some((pending_idx, _, offsets)) if *pending_idx == idx => {
                offsets.push(offset);
                if offsets.len() < MULTIFD_PACKET_PAGES {
                    return Ok(());
                }
            }
            _ => {
                self.flush_pending()?;
                let mut offsets = Vec::with_capacity(MULTIFD_PACKET_PAGES);
                offsets.push(offset);
                self.pending = Some((idx, region.clone(), offsets));
                return Ok(());
            }
        }
        self.flush_pending()
    }

    /// Push queued pages and a sync packet on every channel and wait until
    /// every channel wrote them.
    pub fn sync(&mut self) -> Result<()> {
        self.flush_pending()?;
        for _ in 0..self.channels.len() {
            self.send_job(SendJob::Sync)?;
        }
        let mut ret = Ok(());
        for _ in 0..self.channels.len() {
            let ack = self.ack_rx.recv().map_err(|_| {
                anyhow!(MigrationError::MultifdPacketErr(
                    "send threads exited".to_string()
                ))
            })?;
            if let Err(e) = ack {
                if ret.is_ok() {
                    ret = Err(anyhow!(MigrationError::MultifdPacketErr(e)));
                }
            }
        }
        ret
    }

    /// Close the channels and join the threads, queued pages are dropped.
    pub fn cleanup(&mut self) {
        self.pending = None;
        for ch in self.channels.iter_mut() {
            ch.tx = None;
        }
        for ch in self.channels.iter_mut() {
            if let Some(handle) = ch.handle.take() {
                if handle.join().is_err() {
                    error!("Multifd send thread panicked");
                }
            }
        }
    }
}

impl Drop for MultifdSender {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn multifd_send_thread(
    mut stream: MigrationStream,
    rx: Receiver<SendJob>,
    ack_tx: Sender<std::result::Result<(), String>>,
    bytes: Arc<AtomicU64>,
    packet_num: Arc<AtomicU64>,
    page_size: u64,
) {
    let mut page = vec![0_u8; page_size as usize];
    while let Ok(job) = rx.recv() {
        let before = stream.transferred();
        match job {
            SendJob::Pages { region, offsets } => {
                put_packet_header(&mut stream, 0, region.name(), &offsets, &packet_num);
                for offset in offsets.iter() {
                    if let Err(e) = region.read(*offset, &mut page) {
                        stream.set_error(e.to_string());
                        break;
                    }
                    stream.put_buffer(&page);
                }
            }
            SendJob::Sync => {
                put_packet_header(&mut stream, MULTIFD_FLAG_SYNC, "", &[], &packet_num);
                stream.fflush();
                let ack = stream.get_error().map_err(|e| e.to_string());
                if ack_tx.send(ack).is_err() {
                    break;
                }
            }
        }
        bytes.fetch_add(stream.transferred() - before, Ordering::SeqCst);
    }
    stream.fflush();
}

fn put_packet_header(
    stream: &mut MigrationStream,
    flags: u32,
    name: &str,
    offsets: &[u64],
    packet_num: &AtomicU64,
) {
    stream.put_be32(MULTIFD_MAGIC);
    stream.put_be32(MULTIFD_VERSION);
    stream.put_be32(flags);
    stream.put_be32(offsets.len() as u32);
    stream.put_be64(packet_num.fetch_add(1, Ordering::SeqCst));
    stream.put_byte(name.len() as u8);
    stream.put_buffer(name.as_bytes());
    for offset in offsets {
        stream.put_be64(*offset);
    }
}

enum RecvEvent {
    Synced,
    Failed(String),
}

/// Receiving side of the bulk channels.
pub struct MultifdReceiver {
    handles: Vec<JoinHandle<()>>,
    releases: Vec<Sender<()>>,
    event_rx: Receiver<RecvEvent>,
}

impl MultifdReceiver {
    /// Start one thread per reader writing pages straight into `regions`.
    ///
    /// # Arguments
    ///
    /// * `readers` - One input per channel.
    /// * `regions` - Destination regions.
    /// * `received` - Receive bitmaps of `regions`, in the same order.
    /// * `page_size` - Base page size of the stream.
    pub fn new(
        readers: Vec<Box<dyn Read + Send>>,
        regions: Vec<Arc<RamRegion>>,
        received: Arc<Vec<Bitmap>>,
        page_size: u64,
    ) -> Result<Self> {
        let (event_tx, event_rx) = channel();
        let mut receiver = MultifdReceiver {
            handles: Vec::with_capacity(readers.len()),
            releases: Vec::with_capacity(readers.len()),
            event_rx,
        };
        for (id, reader) in readers.into_iter().enumerate() {
            let (release_tx, release_rx) = channel();
            let stream = MigrationStreamReader::new(&format!("multifd-{}", id), reader);
            let ctx = RecvContext {
                regions: regions.clone(),
                received: received.clone(),
                page_size,
            };
            let event_tx = event_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("multifd-recv-{}", id))
                .spawn(move || multifd_recv_thread(stream, ctx, event_tx, release_rx))
                .with_context(|| format!("Failed to create multifd recv thread {}", id))?;
            receiver.handles.push(handle);
            receiver.releases.push(release_tx);
        }
        Ok(receiver)
    }

    /// Wait until every channel reached its sync packet, then let them go on.
    pub fn sync_main(&mut self) -> Result<()> {
        let mut ret = Ok(());
        for _ in 0..self.releases.len() {
            match self.event_rx.recv() {
                Ok(RecvEvent::Synced) => {}
                Ok(RecvEvent::Failed(e)) => {
                    if ret.is_ok() {
                        ret = Err(anyhow!(MigrationError::MultifdPacketErr(e)));
                    }
                }
                Err(_) => {
                    return Err(anyhow!(MigrationError::MultifdPacketErr(
                        "receive threads exited".to_string()
                    )))
                }
            }
        }
        for release in self.releases.iter() {
            // A thread that failed is gone already.
            let _ = release.send(());
        }
        ret
    }

    pub fn cleanup(&mut self) {
        self.releases.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Multifd recv thread panicked");
            }
        }
    }
}

impl Drop for MultifdReceiver {
    fn drop(&mut self) {
        self.cleanup();
    }
}

struct RecvContext {
    regions: Vec<Arc<RamRegion>>,
    received: Arc<Vec<Bitmap>>,
    page_size: u64,
}

fn multifd_recv_thread(
    mut stream: MigrationStreamReader,
    ctx: RecvContext,
    event_tx: Sender<RecvEvent>,
    release_rx: Receiver<()>,
) {
    let mut page = vec![0_u8; ctx.page_size as usize];
    loop {
        match stream.at_eof() {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => {
                let _ = event_tx.send(RecvEvent::Failed(e.to_string()));
                break;
            }
        }
        match recv_packet(&mut stream, &ctx, &mut page) {
            Ok(true) => {
                if event_tx.send(RecvEvent::Synced).is_err() || release_rx.recv().is_err() {
                    break;
                }
            }
            Ok(false) => {}
            Err(e) => {
                error!("{}: {:?}", stream.name(), e);
                let _ = event_tx.send(RecvEvent::Failed(e.to_string()));
                break;
            }
        }
    }
}

/// Read one packet, return whether it was a sync packet.
fn recv_packet(stream: &mut MigrationStreamReader, ctx: &RecvContext, page: &mut [u8]) -> Result<bool> {
    let err = |msg: String| anyhow!(MigrationError::MultifdPacketErr(msg));
    let magic = stream.get_be32()?;
    if magic != MULTIFD_MAGIC {
        return Err(err(format!("bad magic {:#x}", magic)));
    }
    let version = stream.get_be32()?;
    if version != MULTIFD_VERSION {
        return Err(err(format!("unsupported version {}", version)));
    }
    let flags = stream.get_be32()?;
    let pages = stream.get_be32()? as usize;
    let _packet_num = stream.get_be64()?;
    let name = stream.get_name()?;
    if pages > MULTIFD_PACKET_PAGES {
        return Err(err(format!("{} pages in one packet", pages)));
    }
    if pages == 0 {
        return Ok(flags & MULTIFD_FLAG_SYNC != 0);
    }

    let (idx, region) = find_region(&ctx.regions, &name)
        .ok_or_else(|| anyhow!(MigrationError::UnknownRegion(name.clone())))?;
    let mut offsets = Vec::with_capacity(pages);
    for _ in 0..pages {
        let offset = stream.get_be64()?;
        if offset % ctx.page_size != 0 || !region.contains(offset) {
            return Err(anyhow!(MigrationError::IllegalOffset(name.clone(), offset)));
        }
        offsets.push(offset);
    }
    for offset in offsets {
        stream.get_buffer(page)?;
        region.write(offset, page)?;
        ctx.received[idx].set((offset / ctx.page_size) as usize)?;
    }
    Ok(flags & MULTIFD_FLAG_SYNC != 0)
}
