//! USB precondition: make sure the stick is in modem mode before opening ports.
//!
//! Many GSM sticks enumerate as a CD-ROM/storage device first and only expose
//! their serial interfaces after a `usb_modeswitch` message. The probe reads
//! `idVendor`/`idProduct` from sysfs; nothing here is fatal.

use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::config::UsbConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsbMode {
    NotFound,
    Storage,
    Modem,
}

impl std::fmt::Display for UsbMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UsbMode::NotFound => "not found",
            UsbMode::Storage => "storage",
            UsbMode::Modem => "modem",
        };
        f.write_str(s)
    }
}

fn read_id(dir: &Path, file: &str) -> Option<String> {
    fs::read_to_string(dir.join(file))
        .ok()
        .map(|s| s.trim().to_ascii_lowercase())
}

/// Scan the sysfs device directory for the configured ids. Modem mode wins if
/// both pairs are present.
pub fn probe(config: &UsbConfig) -> UsbMode {
    let entries = match fs::read_dir(&config.sysfs_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot scan {}: {}", config.sysfs_root, e);
            return UsbMode::NotFound;
        }
    };

    let storage = (
        config.storage_vendor.to_ascii_lowercase(),
        config.storage_product.to_ascii_lowercase(),
    );
    let modem = (
        config.modem_vendor.to_ascii_lowercase(),
        config.modem_product.to_ascii_lowercase(),
    );

    let mut result = UsbMode::NotFound;
    for entry in entries.flatten() {
        let dir = entry.path();
        let (Some(vendor), Some(product)) = (read_id(&dir, "idVendor"), read_id(&dir, "idProduct"))
        else {
            continue;
        };
        debug!("USB device {}:{} at {}", vendor, product, dir.display());
        let pair = (vendor, product);
        if pair == modem {
            return UsbMode::Modem;
        }
        if pair == storage {
            result = UsbMode::Storage;
        }
    }
    result
}

/// Arguments passed to `usb_modeswitch`.
pub fn modeswitch_args(config: &UsbConfig) -> Vec<String> {
    vec![
        "-v".to_string(),
        format!("0x{}", config.storage_vendor),
        "-p".to_string(),
        format!("0x{}", config.storage_product),
        "-V".to_string(),
        format!("0x{}", config.modem_vendor),
        "-P".to_string(),
        format!("0x{}", config.modem_product),
        "-M".to_string(),
        config.modeswitch_message.clone(),
    ]
}

async fn run_modeswitch(config: &UsbConfig) -> bool {
    let args = modeswitch_args(config);
    match Command::new(&config.modeswitch_binary).args(&args).output().await {
        Ok(out) if out.status.success() => true,
        Ok(out) => {
            warn!(
                "{} exited with {}: {}",
                config.modeswitch_binary,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
            false
        }
        Err(e) => {
            warn!("Failed to run {}: {}", config.modeswitch_binary, e);
            false
        }
    }
}

/// Probe once; if the stick is in storage mode, switch it and probe again
/// after the settle delay. Returns the final mode.
pub async fn ensure_modem_mode(config: &UsbConfig) -> UsbMode {
    if !config.enabled {
        return UsbMode::NotFound;
    }
    let mode = probe(config);
    if mode != UsbMode::Storage {
        info!("USB modem probe: {}", mode);
        return mode;
    }

    info!(
        "Modem {}:{} is in storage mode; switching to {}:{}",
        config.storage_vendor, config.storage_product, config.modem_vendor, config.modem_product
    );
    if !run_modeswitch(config).await {
        return mode;
    }
    tokio::time::sleep(Duration::from_secs(config.settle_secs)).await;
    let after = probe(config);
    info!("USB modem probe after switch: {}", after);
    after
}
