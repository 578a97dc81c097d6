//! Event system for UI decoupling.
//!
//! CLI or GUI frontends subscribe to flashing events without tight coupling
//! to the operations layer.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of a flashing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// Waiting for a device connection.
    Detecting,
    /// Protocol-level identification in progress.
    Identifying,
    /// Streaming an image to the device.
    Flashing,
    /// Streaming an image from the device.
    Dumping,
    /// Device is rebooting or switching mode.
    Switching,
    /// All operations complete.
    Complete,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Detecting => write!(f, "Detecting"),
            FlashPhase::Identifying => write!(f, "Identifying"),
            FlashPhase::Flashing => write!(f, "Flashing"),
            FlashPhase::Dumping => write!(f, "Dumping"),
            FlashPhase::Switching => write!(f, "Switching"),
            FlashPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Events emitted during detection and operations.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// USB device matched against the device table.
    DeviceFound { vid: u16, pid: u16, label: String },
    /// Device disconnected (it may re-enumerate under another protocol).
    DeviceLost,
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Progress update for a streaming operation.
    Progress {
        phase: FlashPhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving flash events.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceFound { vid, pid, label } => {
                tracing::info!(
                    vid = %format!("{vid:04X}"),
                    pid = %format!("{pid:04X}"),
                    label = %label,
                    "Device found"
                );
            }
            FlashEvent::DeviceLost => {
                tracing::warn!("Device lost");
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 { (*current * 100) / *total } else { 0 };
                tracing::debug!(
                    phase = %phase,
                    operation = %operation,
                    progress = %format!("{pct}%"),
                    "Progress"
                );
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}
