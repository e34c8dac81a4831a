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

//! Migrate a synthetic guest over local sockets and report the counters.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use clap::{crate_description, Parser};
use log::{error, info};

use migration::{
    Channel, IterState, MigrationConfig, MigrationStream, MigrationStreamReader, RamLoadState,
    RamRegion, RamSaveState, SharedCpuThrottle, SoftDirtyLog,
};
use util::logger;

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(version, about = crate_description!())]
struct Cli {
    /// Migration config in json.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Path of log file, logs go to stderr if unset.
    #[arg(short, long)]
    log: Option<PathBuf>,
    /// Guest ram size in MiB.
    #[arg(short, long, default_value_t = 64)]
    size: u64,
    /// Pages the guest dirties after each iteration.
    #[arg(long, default_value_t = 256)]
    dirty_pages: u64,
    /// Iterations before the guest is stopped.
    #[arg(long, default_value_t = 8)]
    max_iterations: u64,
}

struct Guest {
    regions: Vec<Arc<RamRegion>>,
    log: Arc<SoftDirtyLog>,
    page_size: u64,
    cursor: u64,
}

impl Guest {
    fn new(config: &MigrationConfig, size: u64) -> Result<Self> {
        let page_size = config.target_page_size;
        let region = RamRegion::new("pc.ram", size, page_size)?;
        let pages = size / page_size;
        for page in (0..pages).filter(|p| p % 4 != 0) {
            region.fill(page * page_size, (page % 251) as u8 + 1, page_size)?;
        }
        Ok(Guest {
            regions: vec![region],
            log: Arc::new(SoftDirtyLog::new(config.target_page_bits())),
            page_size,
            cursor: 0,
        })
    }

    /// Touch `count` pages, walking the ram in strides.
    fn run(&mut self, count: u64) -> Result<()> {
        let region = &self.regions[0];
        let pages = region.used_length() / self.page_size;
        for _ in 0..count {
            let offset = (self.cursor % pages) * self.page_size;
            let stamp = self.cursor.to_le_bytes();
            self.log.write(region, offset + 64, &stamp)?;
            self.cursor += 7;
        }
        Ok(())
    }
}

fn stream_pair(name: &str) -> Result<(MigrationStream, MigrationStreamReader)> {
    let (tx, rx) = UnixStream::pair().with_context(|| format!("Failed to create {}", name))?;
    Ok((
        MigrationStream::new(name, Box::new(tx)),
        MigrationStreamReader::new(name, Box::new(rx)),
    ))
}

fn start_destination(
    config: MigrationConfig,
    size: u64,
    mut stream: MigrationStreamReader,
    multifd: Vec<Box<dyn Read + Send>>,
) -> Result<JoinHandle<Result<Arc<RamRegion>>>> {
    let region = RamRegion::new("pc.ram", size, config.target_page_size)?;
    thread::Builder::new()
        .name("destination".to_string())
        .spawn(move || {
            let mut dst = RamLoadState::new(config, vec![region.clone()])?;
            if !multifd.is_empty() {
                dst = dst.with_multifd(multifd)?;
            }
            let mut sections = 0;
            while dst.load(&mut stream, Channel::Precopy)? {
                sections += 1;
            }
            dst.cleanup();
            info!("Destination loaded {} sections", sections);
            Ok(region)
        })
        .with_context(|| "Failed to spawn destination")
}

fn migrate(cli: &Cli) -> Result<()> {
    let config = match cli.config.as_ref() {
        Some(path) => MigrationConfig::from_file(path)?,
        None => MigrationConfig::default(),
    };
    let size = cli.size * MIB;
    let mut guest = Guest::new(&config, size)?;

    let (main_tx, main_rx) = stream_pair("precopy")?;
    let mut multifd_tx: Vec<Box<dyn Write + Send>> = Vec::new();
    let mut multifd_rx: Vec<Box<dyn Read + Send>> = Vec::new();
    if config.multifd.enabled {
        for i in 0..config.multifd.channels {
            let (tx, rx) = UnixStream::pair()
                .with_context(|| format!("Failed to create multifd channel {}", i))?;
            multifd_tx.push(Box::new(tx));
            multifd_rx.push(Box::new(rx));
        }
    }
    let dst = start_destination(config.clone(), size, main_rx, multifd_rx)?;

    let downtime_bytes = std::cmp::max(
        config.max_bandwidth * config.downtime_limit_ms / 1000,
        guest.page_size,
    );
    let mut src = RamSaveState::new(
        config,
        guest.regions.clone(),
        guest.log.clone(),
        Arc::new(SharedCpuThrottle::new()),
        main_tx,
    );
    if !multifd_tx.is_empty() {
        src = src.with_multifd(multifd_tx);
    }

    src.setup()?;
    let mut iterations = 0;
    loop {
        if src.iterate()? == IterState::Done {
            iterations += 1;
            guest.run(cli.dirty_pages)?;
        }
        let pending = src.pending(downtime_bytes)?;
        let remaining = pending.precopy_only + pending.postcopy_compatible;
        if remaining <= downtime_bytes || iterations >= cli.max_iterations {
            info!(
                "Stopping guest after {} iterations, {} bytes left",
                iterations, remaining
            );
            break;
        }
    }
    src.complete()?;
    let stats = src.stats();
    src.cleanup();
    // Closing the streams ends the destination.
    drop(src);

    let dst_region = dst
        .join()
        .map_err(|_| anyhow!("Destination panicked"))??;
    let mut expected = vec![0_u8; size as usize];
    let mut actual = vec![0_u8; size as usize];
    guest.regions[0].read(0, &mut expected)?;
    dst_region.read(0, &mut actual)?;
    if expected != actual {
        bail!("Destination ram differs from the source");
    }

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let log_path = cli
        .log
        .as_ref()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Err(e) = logger::init_log(log_path) {
        eprintln!("{:?}", e);
        exit(1);
    }

    if let Err(e) = migrate(&cli) {
        error!("{:?}", e);
        eprintln!("{:?}", e);
        exit(1);
    }
}
