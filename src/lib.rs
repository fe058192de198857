//! # smsgate - SMS Gateway for GSM USB Modems
//!
//! smsgate drives a GSM modem over its serial AT interface: it sends, lists and
//! deletes text-mode SMS, keeps an inbox of received messages on disk, and
//! survives the modem being unplugged and plugged back in.
//!
//! ## Features
//!
//! - **AT Command Engine**: Deadline-bounded command/response exchange with suffix matching on `OK`/`ERROR`/`> `.
//! - **SMS Codec**: `+CMGL` listing parser that reports malformed entries instead of dropping them.
//! - **Hot-plug Monitor**: `NoDevice`/`Ready` state machine with a recheck timer and per-session watchers.
//! - **Inbox**: Received messages persisted to a JSON file with atomic rewrites.
//! - **USB Mode Switch**: Flips storage-mode sticks into modem mode via `usb_modeswitch`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smsgate::config::Config;
//! use smsgate::modem::SerialOpener;
//! use smsgate::monitor::Monitor;
//! use smsgate::storage::MessageStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = MessageStore::load(&config.storage.inbox_path).into_shared();
//!     let monitor = Monitor::new(
//!         config.modem.monitor_settings(),
//!         Arc::new(SerialOpener::default()),
//!         store,
//!     );
//!     let handle = monitor.handle();
//!     let (_stop, stop_rx) = tokio::sync::watch::channel(false);
//!     tokio::spawn(monitor.run(stop_rx));
//!
//!     handle.wait_for(|s| s.state == smsgate::monitor::MonitorState::Ready).await;
//!     handle.send_sms("+15551234567", "hello").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`modem`] - Serial transport, AT command engine, SMS codec and notification parsing
//! - [`monitor`] - Device lifecycle state machine and the caller-facing handle
//! - [`storage`] - Persisted inbox
//! - [`usb`] - Storage-mode detection and mode switching
//! - [`config`] - Configuration loading and environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  MonitorHandle  │ ← send / list / delete / stats
//! └─────────────────┘
//!          │
//! ┌─────────────────┐     ┌─────────────────┐
//! │ Device Monitor  │ ──▶ │  Message Store  │
//! └─────────────────┘     └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Command Engine  │ ← AT framing and timeouts
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Transport    │ ← serial ports
//! └─────────────────┘
//! ```

pub mod config;
pub mod instance;
pub mod logutil;
pub mod metrics;
pub mod modem;
pub mod monitor;
pub mod storage;
pub mod usb;
