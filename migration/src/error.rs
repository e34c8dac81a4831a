// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
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

use thiserror::Error;

use crate::status::MigrationStatus;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("UtilError")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("Io")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Json")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("Failed to transfer migration status from {0} to {1}.")]
    InvalidStatusTransfer(MigrationStatus, MigrationStatus),
    #[error("Can't {0} in migration status {1}.")]
    InvalidStatus(String, MigrationStatus),
    #[error("{0} must >{} {1} and <{} {3}.", if *.2 {"="} else {""}, if *.4 {"="} else {""})]
    IllegalValue(String, u64, bool, u64, bool),
    #[error("Input value {0} is unaligned with {1} for {2}.")]
    Unaligned(String, u64, u64),
    #[error("Invalid parameter \'{0}\' for \'{1}\'")]
    InvalidParam(String, String),
    #[error("Stream error on {0} channel: {1}")]
    StreamErr(String, String),
    #[error("Unknown ram region: {0}")]
    UnknownRegion(String),
    #[error("Ram region {0} length mismatch: source {1:#x}, destination {2:#x}")]
    RegionLengthMismatch(String, u64, u64),
    #[error("Ram region {0} page size mismatch: source {1:#x}, destination {2:#x}")]
    RegionPageSizeMismatch(String, u64, u64),
    #[error("Ram size mismatch: source {0:#x}, destination {1:#x}")]
    TotalSizeMismatch(u64, u64),
    #[error("Illegal ram offset {1:#x} for region {0}")]
    IllegalOffset(String, u64),
    #[error("Unknown combination of migration flags: {0:#x}")]
    UnknownFlags(u64),
    #[error("Received an unexpected compressed page")]
    UnexpectedCompressPage,
    #[error("Invalid compressed data length: {0}")]
    InvalidCompressLen(u64),
    #[error("Failed to load XBZRLE page: {0}")]
    XbzrleLoadErr(String),
    #[error("Failed to compress page: {0}")]
    CompressErr(String),
    #[error("Failed to decompress page: {0}")]
    DecompressErr(String),
    #[error("Ram region {0} receive bitmap size mismatch: expected {1:#x}, got {2:#x}")]
    RecvBitmapSizeMismatch(String, u64, u64),
    #[error("Ram region {0} receive bitmap end mark mismatch: got {1:#x}")]
    RecvBitmapEndMark(String, u64),
    #[error("Postcopy write protection is not supported by the host: {0}")]
    PostcopyWriteProtectUnsupported(String),
    #[error("Invalid page request: region {0}, start {1:#x}, len {2:#x}")]
    InvalidPageRequest(String, u64, u64),
    #[error("Non-same host page in postcopy: expected {0:#x}, got {1:#x}")]
    NonSameHostPage(u64, u64),
    #[error("Invalid multifd packet: {0}")]
    MultifdPacketErr(String),
    #[error("Failed to get dirty log of region {0}: {1}")]
    DirtyLogErr(String, String),
}
