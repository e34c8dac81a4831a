// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
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

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use nix::unistd::{getpid, gettid};

use crate::time::{get_format_time, gettime};

/// Environment variable selecting the log level.
pub const LOG_LEVEL_ENV: &str = "RAM_MIGRATE_LOG_LEVEL";
// Max size of one log file is 64MB.
const LOG_ROTATE_SIZE_MAX: u64 = 64 * 1024 * 1024;
// Number of rotated files kept besides the active one.
const LOG_ROTATE_COUNT_MAX: u32 = 4;

fn format_now() -> String {
    let (sec, nsec) = gettime().unwrap_or((0, 0));
    let t = get_format_time(sec as i64);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
        t[0], t[1], t[2], t[3], t[4], t[5], nsec
    )
}

fn today() -> i32 {
    gettime().map_or(0, |(sec, _)| get_format_time(sec as i64)[2])
}

struct LogSink {
    handler: Box<dyn Write + Send>,
    /// Empty when logging to stderr, rotation is disabled then.
    path: String,
    written: u64,
    create_day: i32,
}

impl LogSink {
    fn rotate(&mut self) -> Result<()> {
        if self.path.is_empty()
            || (self.written < LOG_ROTATE_SIZE_MAX && self.create_day == today())
        {
            return Ok(());
        }

        // log.3 -> dropped, log.2 -> log.3, ..., log -> log.1
        for idx in (0..LOG_ROTATE_COUNT_MAX).rev() {
            let from = if idx == 0 {
                self.path.clone()
            } else {
                format!("{}.{}", self.path, idx)
            };
            if !Path::new(&from).exists() {
                continue;
            }
            if idx + 1 == LOG_ROTATE_COUNT_MAX {
                std::fs::remove_file(&from)
                    .with_context(|| format!("Failed to remove log file {}", from))?;
            } else {
                let to = format!("{}.{}", self.path, idx + 1);
                std::fs::rename(&from, &to)
                    .with_context(|| format!("Failed to rename log file {} to {}", from, to))?;
            }
        }

        self.handler = Box::new(open_log_file(&self.path)?);
        self.written = 0;
        self.create_day = today();
        Ok(())
    }
}

/// Format like "%year-%mon-%dayT%hour:%min:%sec.%nsec [pid][tid][file: line]:level: msg"
struct MigrationLogger {
    sink: Mutex<LogSink>,
    level: Level,
}

impl Log for MigrationLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let msg = format!(
            "{}: [{}][{}][{}: {}]:{}: {}\n",
            format_now(),
            getpid().as_raw(),
            gettid().as_raw(),
            record.file().unwrap_or(""),
            record.line().unwrap_or(0),
            record.level(),
            record.args()
        );

        let mut sink = match self.sink.lock() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        if let Err(e) = sink.handler.write_all(msg.as_bytes()) {
            eprintln!("Failed to log message {:?}", e);
            return;
        }
        sink.written += msg.len() as u64;
        if let Err(e) = sink.rotate() {
            eprintln!("Failed to rotate log files {:?}", e);
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.handler.flush();
        }
    }
}

fn level_from_env() -> Level {
    match std::env::var(LOG_LEVEL_ENV) {
        Ok(l) => parse_level(&l),
        _ => Level::Info,
    }
}

fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "error" => Level::Error,
        "warn" => Level::Warn,
        "debug" => Level::Debug,
        "trace" => Level::Trace,
        _ => Level::Info,
    }
}

fn open_log_file(path: &str) -> Result<File> {
    std::fs::OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .mode(0o640)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path))
}

/// Install the process logger. Empty `path` logs to stderr.
pub fn init_log(path: String) -> Result<()> {
    let (handler, written, create_day): (Box<dyn Write + Send>, u64, i32) = if path.is_empty() {
        (Box::new(std::io::stderr()), 0, 0)
    } else {
        let file = open_log_file(&path)?;
        let metadata = file.metadata()?;
        let sec = metadata.modified()?.duration_since(UNIX_EPOCH)?.as_secs();
        (
            Box::new(file),
            metadata.len(),
            get_format_time(sec as i64)[2],
        )
    };

    let logger = MigrationLogger {
        sink: Mutex::new(LogSink {
            handler,
            path: path.clone(),
            written,
            create_day,
        }),
        level: level_from_env(),
    };
    log::set_boxed_logger(Box::new(logger))
        .map(|()| log::set_max_level(LevelFilter::Trace))
        .with_context(|| format!("Failed to init logger: {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("ERROR"), Level::Error);
        assert_eq!(parse_level("debug"), Level::Debug);
        assert_eq!(parse_level("unknown"), Level::Info);
    }

    #[test]
    fn test_rotate_files() {
        let dir = std::env::temp_dir().join(format!("ram-migrate-log-{}", getpid()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("migrate.log").to_string_lossy().to_string();

        let mut sink = LogSink {
            handler: Box::new(open_log_file(&path).unwrap()),
            path: path.clone(),
            written: LOG_ROTATE_SIZE_MAX,
            create_day: today(),
        };
        sink.handler.write_all(b"first\n").unwrap();
        sink.rotate().unwrap();
        assert_eq!(sink.written, 0);
        assert!(Path::new(&format!("{}.1", path)).exists());
        assert!(Path::new(&path).exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
