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

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::MigrationError;

/// Status of a ram migration session.
///
/// # Notes
///
/// State transfer:
/// None -----------> Setup: bitmaps, caches and workers are set up.
/// Setup ----------> Active: the first section has been sent.
/// Active ---------> Postcopy: destination runs the guest, pages are fetched on demand.
/// Active/Postcopy -> Completed: the final section has been sent.
/// Failed ---------> Setup: recovered channel, resume the session.
/// Any ------------> Failed: something wrong in migration.
/// Any ------------> Canceled: cancel migration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    /// Session resources are not prepared.
    None,
    /// Session resources are set up.
    Setup,
    /// Precopy is running.
    Active,
    /// Postcopy is running.
    Postcopy,
    /// Migration completed.
    Completed,
    /// Migration failed.
    Failed,
    /// Migration canceled.
    Canceled,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                MigrationStatus::None => "none",
                MigrationStatus::Setup => "setup",
                MigrationStatus::Active => "active",
                MigrationStatus::Postcopy => "postcopy-active",
                MigrationStatus::Completed => "completed",
                MigrationStatus::Failed => "failed",
                MigrationStatus::Canceled => "canceled",
            }
        )
    }
}

impl MigrationStatus {
    // Check and transfer migration status after convert migration operations.
    pub fn transfer(self, new_status: MigrationStatus) -> Result<MigrationStatus> {
        let allowed = match self {
            MigrationStatus::None => matches!(new_status, MigrationStatus::Setup),
            MigrationStatus::Setup => matches!(
                new_status,
                MigrationStatus::Active | MigrationStatus::Failed | MigrationStatus::Canceled
            ),
            MigrationStatus::Active => matches!(
                new_status,
                MigrationStatus::Postcopy
                    | MigrationStatus::Completed
                    | MigrationStatus::Failed
                    | MigrationStatus::Canceled
            ),
            MigrationStatus::Postcopy => matches!(
                new_status,
                MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Canceled
            ),
            MigrationStatus::Completed => matches!(new_status, MigrationStatus::Canceled),
            MigrationStatus::Failed => matches!(
                new_status,
                MigrationStatus::Setup | MigrationStatus::Canceled
            ),
            MigrationStatus::Canceled => matches!(new_status, MigrationStatus::None),
        };

        if allowed {
            Ok(new_status)
        } else {
            Err(anyhow!(MigrationError::InvalidStatusTransfer(
                self, new_status
            )))
        }
    }

    /// Whether the session is running and may produce records.
    pub fn is_active(self) -> bool {
        matches!(self, MigrationStatus::Active | MigrationStatus::Postcopy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_transfer() {
        let mut status = MigrationStatus::None;

        // None to Setup.
        status = status.transfer(MigrationStatus::Setup).unwrap();
        // Setup to Active.
        status = status.transfer(MigrationStatus::Active).unwrap();
        assert!(status.is_active());
        // Active to Postcopy.
        status = status.transfer(MigrationStatus::Postcopy).unwrap();
        assert!(status.is_active());
        // Postcopy to Failed, then resume.
        status = status.transfer(MigrationStatus::Failed).unwrap();
        status = status.transfer(MigrationStatus::Setup).unwrap();
        status = status.transfer(MigrationStatus::Active).unwrap();
        // Active to Completed.
        status = status.transfer(MigrationStatus::Completed).unwrap();

        assert_eq!(status, MigrationStatus::Completed);
        assert!(!status.is_active());
    }

    #[test]
    fn test_abnormal_transfer_with_error() {
        let status = MigrationStatus::None;

        // None to Active.
        match status.transfer(MigrationStatus::Active) {
            Err(e) => assert_eq!(
                e.to_string(),
                format!(
                    "Failed to transfer migration status from {} to {}.",
                    MigrationStatus::None,
                    MigrationStatus::Active
                )
            ),
            Ok(_) => panic!("None to Active should be refused"),
        }

        // Postcopy can't fall back to precopy.
        assert!(MigrationStatus::Postcopy
            .transfer(MigrationStatus::Active)
            .is_err());
    }
}
