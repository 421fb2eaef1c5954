//! Translation of engine completion reports into [`GenDetails`].

use crate::engine::{
    BriefCallback, DeviceStatuses, ProcessCallback, SyncProcess, TableBriefCallback,
    TableStatuses, TransferInfo,
};
use crate::error::convert_status;
use ddms_core::store::{
    DetailAsync, GenDetails, Progress, ProgressDetail, Statistic, TableDetail,
};
use ddms_core::GeneralError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Completion callback reporting one finished entry per device.
pub(crate) fn device_brief(callback: Option<DetailAsync>) -> BriefCallback {
    let Some(callback) = callback else {
        return Box::new(|_| {});
    };
    Box::new(move |statuses: &DeviceStatuses| {
        let details: GenDetails = statuses
            .iter()
            .map(|(device, status)| (device.clone(), ProgressDetail::finished(convert_status(status))))
            .collect();
        callback(&details);
    })
}

/// Completion callback failing a device if any of its tables failed.
pub(crate) fn table_brief(callback: Option<DetailAsync>) -> TableBriefCallback {
    let Some(callback) = callback else {
        return Box::new(|_| {});
    };
    Box::new(move |statuses: &TableStatuses| {
        let details: GenDetails = statuses
            .iter()
            .map(|(device, tables)| {
                let code = if tables.iter().any(|t| t.status.is_err()) {
                    Err(GeneralError::Error)
                } else {
                    Ok(())
                };
                (device.clone(), ProgressDetail::finished(code))
            })
            .collect();
        callback(&details);
    })
}

/// Progress callback for cloud syncs.
///
/// `on_data_change` runs whenever a finished report downloaded changes.
pub(crate) fn cloud_process(
    callback: Option<DetailAsync>,
    on_data_change: Option<Arc<dyn Fn() + Send + Sync>>,
) -> ProcessCallback {
    Arc::new(move |processes: &BTreeMap<String, SyncProcess>| {
        if callback.is_none() && on_data_change.is_none() {
            return;
        }
        let details = to_details(processes);
        if let Some(callback) = &callback {
            callback(&details);
        }
        let changed = details.values().next().is_some_and(|d| d.data_change);
        if changed {
            if let Some(hook) = &on_data_change {
                hook();
            }
        }
    })
}

fn statistic(info: &TransferInfo) -> Statistic {
    Statistic {
        total: info.total,
        success: info.success_count,
        failed: info.fail_count,
        untreated: info
            .total
            .saturating_sub(info.success_count)
            .saturating_sub(info.fail_count),
    }
}

/// Converts engine progress reports into store details.
pub fn to_details(processes: &BTreeMap<String, SyncProcess>) -> GenDetails {
    processes
        .iter()
        .map(|(id, process)| {
            let mut detail = ProgressDetail {
                progress: process.process,
                code: convert_status(&process.status),
                ..ProgressDetail::default()
            };
            for (table, counts) in &process.tables {
                detail.details.insert(
                    table.clone(),
                    TableDetail {
                        upload: statistic(&counts.upload),
                        download: statistic(&counts.download),
                    },
                );
                detail.data_change |=
                    process.process == Progress::Finished && counts.download.changed_data();
            }
            (id.clone(), detail)
        })
        .collect()
}
