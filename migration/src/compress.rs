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

//! Compression workforce.
//!
//! Every worker owns one slot. A slot is idle (done) or busy. The producer
//! hands a page to an idle slot and collects the record the slot produced
//! for its previous page, so the stream sees records in slot collection
//! order. `flush` waits for every slot to go idle and collects them all.
//! The producer takes the first idle slot, lowest index first, not a
//! rotating one.
//!
//! Workers compress base pages, whatever the host page size of the region.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, WriteBytesExt};
use log::{error, info};

use crate::codec::{
    encode_page_header, RAM_SAVE_FLAG_COMPRESS_PAGE, RAM_SAVE_FLAG_ZERO,
};
use crate::region::{buffer_is_zero, RamRegion};
use crate::MigrationError;

/// Upper bound of a compressed record payload for pages of `page_size`.
pub fn compress_bound(page_size: u64) -> u64 {
    zstd::zstd_safe::compress_bound(page_size as usize) as u64
}

/// Page handed to a compression worker.
struct CompressJob {
    region: Arc<RamRegion>,
    offset: u64,
}

struct CompressParamState {
    job: Option<CompressJob>,
    quit: bool,
}

struct CompressParam {
    state: Mutex<CompressParamState>,
    cond: Condvar,
}

/// Record produced by a slot, ready to be appended to the stream.
#[derive(Default)]
pub struct CompressedRecord {
    pub data: Vec<u8>,
    pub zero_page: bool,
    pub error: Option<String>,
}

impl CompressedRecord {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.error.is_none()
    }
}

struct CompressDone {
    done: bool,
    record: CompressedRecord,
}

struct CompressShared {
    params: Vec<CompressParam>,
    page_size: usize,
    done: Mutex<Vec<CompressDone>>,
    done_cond: Condvar,
}

/// Outcome of offering a page to the pool.
pub enum CompressSubmit {
    /// An idle slot took the page, carrying the record of its previous page.
    Queued(CompressedRecord),
    /// Every slot was busy and the pool does not wait.
    Busy,
}

/// Sending side compression workers.
pub struct CompressPool {
    shared: Arc<CompressShared>,
    threads: Vec<JoinHandle<()>>,
    wait_thread: bool,
}

impl CompressPool {
    /// Spawn `threads` workers compressing at `level`.
    ///
    /// # Arguments
    ///
    /// * `threads` - Number of workers, each owning one slot.
    /// * `level` - zstd compression level.
    /// * `wait_thread` - Wait for an idle slot instead of reporting busy.
    /// * `page_size` - Base page size of the stream.
    pub fn new(threads: u8, level: u8, wait_thread: bool, page_size: u64) -> Result<Self> {
        let shared = Arc::new(CompressShared {
            page_size: page_size as usize,
            params: (0..threads)
                .map(|_| CompressParam {
                    state: Mutex::new(CompressParamState {
                        job: None,
                        quit: false,
                    }),
                    cond: Condvar::new(),
                })
                .collect(),
            done: Mutex::new(
                (0..threads)
                    .map(|_| CompressDone {
                        done: true,
                        record: CompressedRecord::default(),
                    })
                    .collect(),
            ),
            done_cond: Condvar::new(),
        });

        let mut pool = CompressPool {
            shared,
            threads: Vec::with_capacity(threads as usize),
            wait_thread,
        };
        for idx in 0..threads as usize {
            let compressor = zstd::bulk::Compressor::new(level as i32)
                .map_err(|e| anyhow!(MigrationError::CompressErr(e.to_string())))?;
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("compress-{}", idx))
                .spawn(move || compress_worker(shared, idx, compressor))
                .with_context(|| format!("Failed to create compress thread {}", idx))?;
            pool.threads.push(handle);
        }
        info!("Started {} compress threads, level {}", threads, level);
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.shared.params.len()
    }

    /// Offer the page at `offset` of `region` to an idle slot.
    pub fn compress_page(&self, region: &Arc<RamRegion>, offset: u64) -> CompressSubmit {
        let mut done = self.shared.done.lock().unwrap();
        loop {
            if let Some(idx) = done.iter().position(|d| d.done) {
                done[idx].done = false;
                let record = std::mem::take(&mut done[idx].record);
                drop(done);

                let param = &self.shared.params[idx];
                param.state.lock().unwrap().job = Some(CompressJob {
                    region: region.clone(),
                    offset,
                });
                param.cond.notify_one();
                return CompressSubmit::Queued(record);
            }
            if !self.wait_thread {
                return CompressSubmit::Busy;
            }
            done = self.shared.done_cond.wait(done).unwrap();
        }
    }

    /// Wait for every slot to finish and collect their records in slot order.
    pub fn flush(&self) -> Vec<CompressedRecord> {
        let mut done = self.shared.done.lock().unwrap();
        while !done.iter().all(|d| d.done) {
            done = self.shared.done_cond.wait(done).unwrap();
        }
        done.iter_mut()
            .map(|d| std::mem::take(&mut d.record))
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// Stop and join every worker. Pending records are dropped.
    pub fn cleanup(&mut self) {
        for param in self.shared.params.iter() {
            param.state.lock().unwrap().quit = true;
            param.cond.notify_one();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Compress thread panicked");
            }
        }
    }
}

impl Drop for CompressPool {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn compress_worker(shared: Arc<CompressShared>, idx: usize, mut compressor: zstd::bulk::Compressor) {
    let param = &shared.params[idx];
    let mut page = vec![0_u8; shared.page_size];
    let mut state = param.state.lock().unwrap();
    while !state.quit {
        let job = match state.job.take() {
            Some(job) => job,
            None => {
                state = param.cond.wait(state).unwrap();
                continue;
            }
        };
        drop(state);

        let record = do_compress_page(&mut compressor, &job, &mut page);
        let mut done = shared.done.lock().unwrap();
        done[idx].done = true;
        done[idx].record = record;
        shared.done_cond.notify_all();
        drop(done);

        state = param.state.lock().unwrap();
    }
}

/// Build the record of one page: a zero record or a compressed one. The
/// region is always the last one named on the channel.
fn do_compress_page(
    compressor: &mut zstd::bulk::Compressor,
    job: &CompressJob,
    page: &mut [u8],
) -> CompressedRecord {
    let name = job.region.name();
    let mut record = CompressedRecord::default();
    if let Err(e) = job.region.read(job.offset, page) {
        record.error = Some(e.to_string());
        return record;
    }

    if buffer_is_zero(page) {
        encode_page_header(&mut record.data, name, job.offset | RAM_SAVE_FLAG_ZERO, true);
        record.data.push(0);
        record.zero_page = true;
        return record;
    }

    match compressor.compress(page) {
        Ok(blob) => {
            encode_page_header(
                &mut record.data,
                name,
                job.offset | RAM_SAVE_FLAG_COMPRESS_PAGE,
                true,
            );
            // Writes into a Vec do not fail.
            let _ = record.data.write_u32::<BigEndian>(blob.len() as u32);
            record.data.extend_from_slice(&blob);
        }
        Err(e) => record.error = Some(e.to_string()),
    }
    record
}

/// Where a decompressed page lands.
#[derive(Clone)]
pub enum DecompressTarget {
    /// Page at an offset of a region.
    Region(Arc<RamRegion>, u64),
    /// Byte offset into a staging buffer.
    Buffer(Arc<Mutex<Vec<u8>>>, usize),
}

struct DecompressJob {
    data: Vec<u8>,
    target: DecompressTarget,
}

struct DecompressParamState {
    job: Option<DecompressJob>,
    quit: bool,
}

struct DecompressParam {
    state: Mutex<DecompressParamState>,
    cond: Condvar,
}

struct DecompressDone {
    done: Vec<bool>,
    error: Option<String>,
}

struct DecompressShared {
    params: Vec<DecompressParam>,
    done: Mutex<DecompressDone>,
    done_cond: Condvar,
}

/// Receiving side decompression workers.
pub struct DecompressPool {
    shared: Arc<DecompressShared>,
    threads: Vec<JoinHandle<()>>,
}

impl DecompressPool {
    pub fn new(threads: u8, page_size: u64) -> Result<Self> {
        let shared = Arc::new(DecompressShared {
            params: (0..threads)
                .map(|_| DecompressParam {
                    state: Mutex::new(DecompressParamState {
                        job: None,
                        quit: false,
                    }),
                    cond: Condvar::new(),
                })
                .collect(),
            done: Mutex::new(DecompressDone {
                done: vec![true; threads as usize],
                error: None,
            }),
            done_cond: Condvar::new(),
        });

        let mut pool = DecompressPool {
            shared,
            threads: Vec::with_capacity(threads as usize),
        };
        for idx in 0..threads as usize {
            let decompressor = zstd::bulk::Decompressor::new()
                .map_err(|e| anyhow!(MigrationError::DecompressErr(e.to_string())))?;
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("decompress-{}", idx))
                .spawn(move || decompress_worker(shared, idx, decompressor, page_size as usize))
                .with_context(|| format!("Failed to create decompress thread {}", idx))?;
            pool.threads.push(handle);
        }
        Ok(pool)
    }

    /// Hand compressed `data` to an idle worker, waiting for one if needed.
    pub fn decompress_page(&self, data: Vec<u8>, target: DecompressTarget) {
        let mut done = self.shared.done.lock().unwrap();
        loop {
            if let Some(idx) = done.done.iter().position(|d| *d) {
                done.done[idx] = false;
                drop(done);
                let param = &self.shared.params[idx];
                param.state.lock().unwrap().job = Some(DecompressJob { data, target });
                param.cond.notify_one();
                return;
            }
            done = self.shared.done_cond.wait(done).unwrap();
        }
    }

    /// Wait for every queued page to be written, report the first failure.
    pub fn wait_for_decompress_done(&self) -> Result<()> {
        let mut done = self.shared.done.lock().unwrap();
        while !done.done.iter().all(|d| *d) {
            done = self.shared.done_cond.wait(done).unwrap();
        }
        match done.error.take() {
            Some(e) => Err(anyhow!(MigrationError::DecompressErr(e))),
            None => Ok(()),
        }
    }

    pub fn cleanup(&mut self) {
        for param in self.shared.params.iter() {
            param.state.lock().unwrap().quit = true;
            param.cond.notify_one();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Decompress thread panicked");
            }
        }
    }
}

impl Drop for DecompressPool {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn decompress_worker(
    shared: Arc<DecompressShared>,
    idx: usize,
    mut decompressor: zstd::bulk::Decompressor<'static>,
    page_size: usize,
) {
    let param = &shared.params[idx];
    let mut page = vec![0_u8; page_size];
    let mut state = param.state.lock().unwrap();
    while !state.quit {
        let job = match state.job.take() {
            Some(job) => job,
            None => {
                state = param.cond.wait(state).unwrap();
                continue;
            }
        };
        drop(state);

        let ret = do_decompress_page(&mut decompressor, &job, &mut page);
        let mut done = shared.done.lock().unwrap();
        if let Err(e) = ret {
            error!("Decompress thread {}: {:?}", idx, e);
            if done.error.is_none() {
                done.error = Some(e.to_string());
            }
        }
        done.done[idx] = true;
        shared.done_cond.notify_all();
        drop(done);

        state = param.state.lock().unwrap();
    }
}

fn do_decompress_page(
    decompressor: &mut zstd::bulk::Decompressor<'static>,
    job: &DecompressJob,
    page: &mut [u8],
) -> Result<()> {
    let len = decompressor
        .decompress_to_buffer(&job.data, page)
        .map_err(|e| anyhow!(MigrationError::DecompressErr(e.to_string())))?;
    if len != page.len() {
        return Err(anyhow!(MigrationError::DecompressErr(format!(
            "page decompressed to {} bytes, expected {}",
            len,
            page.len()
        ))));
    }

    match &job.target {
        DecompressTarget::Region(region, offset) => region.write(*offset, page),
        DecompressTarget::Buffer(buf, offset) => {
            let mut buf = buf.lock().unwrap();
            let dst = buf
                .get_mut(*offset..*offset + page.len())
                .ok_or_else(|| anyhow!(MigrationError::InvalidCompressLen(*offset as u64)))?;
            dst.copy_from_slice(page);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RAM_SAVE_FLAG_CONTINUE;
    use byteorder::ByteOrder;

    const PAGE: u64 = 4096;

    fn record_payload(record: &CompressedRecord) -> (u64, Vec<u8>) {
        let word = BigEndian::read_u64(&record.data[0..8]);
        let len = BigEndian::read_u32(&record.data[8..12]) as usize;
        (word, record.data[12..12 + len].to_vec())
    }

    #[test]
    fn test_compress_then_flush() {
        let region = RamRegion::new("pc.ram", 4 * PAGE, PAGE).unwrap();
        region.fill(PAGE, 0x5a, PAGE).unwrap();
        let pool = CompressPool::new(2, 1, true, PAGE).unwrap();

        for page in 0..2 {
            match pool.compress_page(&region, page * PAGE) {
                CompressSubmit::Queued(r) => assert!(r.is_empty()),
                CompressSubmit::Busy => panic!("pool must wait"),
            }
        }
        let records = pool.flush();
        assert_eq!(records.len(), 2);

        let zero = records.iter().find(|r| r.zero_page).unwrap();
        assert_eq!(
            BigEndian::read_u64(&zero.data[0..8]),
            RAM_SAVE_FLAG_ZERO | RAM_SAVE_FLAG_CONTINUE
        );
        assert_eq!(zero.data.len(), 9);

        let comp = records.iter().find(|r| !r.zero_page).unwrap();
        let (word, blob) = record_payload(comp);
        assert_eq!(
            word,
            PAGE | RAM_SAVE_FLAG_COMPRESS_PAGE | RAM_SAVE_FLAG_CONTINUE
        );
        assert!(blob.len() as u64 <= compress_bound(PAGE));

        let dst = RamRegion::new("pc.ram", 4 * PAGE, PAGE).unwrap();
        let dpool = DecompressPool::new(1, PAGE).unwrap();
        dpool.decompress_page(blob, DecompressTarget::Region(dst.clone(), PAGE));
        dpool.wait_for_decompress_done().unwrap();
        let mut buf = vec![0_u8; PAGE as usize];
        dst.read(PAGE, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0x5a));
    }

    #[test]
    fn test_huge_region_compresses_base_pages() {
        let region = RamRegion::new("huge.ram", 8 * PAGE, 4 * PAGE).unwrap();
        region.fill(7 * PAGE, 0x3c, PAGE).unwrap();
        let pool = CompressPool::new(1, 1, true, PAGE).unwrap();
        match pool.compress_page(&region, 7 * PAGE) {
            CompressSubmit::Queued(r) => assert!(r.is_empty()),
            CompressSubmit::Busy => panic!("pool must wait"),
        }
        let records = pool.flush();
        assert_eq!(records.len(), 1);
        assert!(records[0].error.is_none());

        let (word, blob) = record_payload(&records[0]);
        assert_eq!(
            word,
            7 * PAGE | RAM_SAVE_FLAG_COMPRESS_PAGE | RAM_SAVE_FLAG_CONTINUE
        );
        let mut decompressor = zstd::bulk::Decompressor::new().unwrap();
        let page = decompressor.decompress(&blob, 4 * PAGE as usize).unwrap();
        assert_eq!(page.len(), PAGE as usize);
        assert!(page.iter().all(|b| *b == 0x3c));
    }

    #[test]
    fn test_flush_on_idle_pool() {
        let pool = CompressPool::new(3, 1, false, PAGE).unwrap();
        assert!(pool.flush().is_empty());
    }

    #[test]
    fn test_decompress_into_buffer_and_bad_data() {
        let mut compressor = zstd::bulk::Compressor::new(1).unwrap();
        let blob = compressor.compress(&[7_u8; PAGE as usize]).unwrap();
        let buf = Arc::new(Mutex::new(vec![0_u8; 2 * PAGE as usize]));

        let pool = DecompressPool::new(2, PAGE).unwrap();
        pool.decompress_page(blob, DecompressTarget::Buffer(buf.clone(), PAGE as usize));
        pool.wait_for_decompress_done().unwrap();
        {
            let buf = buf.lock().unwrap();
            assert!(buf[..PAGE as usize].iter().all(|b| *b == 0));
            assert!(buf[PAGE as usize..].iter().all(|b| *b == 7));
        }

        pool.decompress_page(
            vec![1, 2, 3, 4],
            DecompressTarget::Buffer(buf, 0),
        );
        assert!(pool.wait_for_decompress_done().is_err());
        // The error is reported once.
        assert!(pool.wait_for_decompress_done().is_ok());
    }
}
