//! Per-connection byte and frame-rate quotas.

pub mod rate_limit;

use std::time::Instant;

use ethtun_core::control::{ERROR_CODE_BACKPRESSURE, ERROR_CODE_QUOTA_BYTES, ERROR_CODE_QUOTA_FPS};

pub use rate_limit::FrameRateLimiter;

/// Which limit a tunnel ran into. Every variant ends the tunnel with 1008.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QuotaExceeded {
    #[error("byte quota exceeded")]
    Bytes,
    #[error("frame rate quota exceeded")]
    FrameRate,
    #[error("outbound websocket backpressure")]
    Backpressure,
}

impl QuotaExceeded {
    /// Close reason sent to the peer.
    pub fn reason(self) -> &'static str {
        match self {
            QuotaExceeded::Bytes => "byte quota exceeded",
            QuotaExceeded::FrameRate => "frame rate quota exceeded",
            QuotaExceeded::Backpressure => "outbound websocket backpressure",
        }
    }

    /// Code carried by the `Error` control message preceding the close.
    pub fn error_code(self) -> u16 {
        match self {
            QuotaExceeded::Bytes => ERROR_CODE_QUOTA_BYTES,
            QuotaExceeded::FrameRate => ERROR_CODE_QUOTA_FPS,
            QuotaExceeded::Backpressure => ERROR_CODE_BACKPRESSURE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Combined rx + tx bytes per connection; 0 = unbounded.
    pub max_bytes_per_connection: u64,
    /// Inbound messages per rolling second; 0 = unbounded.
    pub max_frames_per_second: u64,
}

/// Accounting for one tunnel. Owned by the tunnel task, never shared.
#[derive(Debug)]
pub struct QuotaEnforcer {
    max_bytes: u64,
    rx_bytes: u64,
    tx_bytes: u64,
    frames: FrameRateLimiter,
}

impl QuotaEnforcer {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            max_bytes: limits.max_bytes_per_connection,
            rx_bytes: 0,
            tx_bytes: 0,
            frames: FrameRateLimiter::new(limits.max_frames_per_second),
        }
    }

    /// Account for an inbound WebSocket message of `len` bytes.
    pub fn on_inbound(&mut self, len: usize) -> Result<(), QuotaExceeded> {
        self.on_inbound_at(len, Instant::now())
    }

    pub fn on_inbound_at(&mut self, len: usize, now: Instant) -> Result<(), QuotaExceeded> {
        self.rx_bytes = self.rx_bytes.saturating_add(len as u64);
        self.check_bytes()?;
        if !self.frames.check_and_record_at(now) {
            return Err(QuotaExceeded::FrameRate);
        }
        Ok(())
    }

    /// Account for an outbound WebSocket message of `len` bytes.
    ///
    /// Outbound traffic counts toward the byte quota only.
    pub fn on_outbound(&mut self, len: usize) -> Result<(), QuotaExceeded> {
        self.tx_bytes = self.tx_bytes.saturating_add(len as u64);
        self.check_bytes()
    }

    fn check_bytes(&self) -> Result<(), QuotaExceeded> {
        if self.max_bytes != 0 && self.rx_bytes.saturating_add(self.tx_bytes) > self.max_bytes {
            return Err(QuotaExceeded::Bytes);
        }
        Ok(())
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }
}

/// Length a close frame contributes to byte accounting: status code plus reason.
pub fn close_frame_len(reason: &str) -> usize {
    2 + reason.len()
}
