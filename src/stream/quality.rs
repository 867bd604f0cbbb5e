//! Quality ladder and the adaptive controller that walks it
//!
//! Drops and congested ticks push the level down quickly; only a sustained
//! run of healthy ticks moves it back up, one step at a time.

use super::flow::FlowCounters;
use log::{debug, info};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Consecutive drops that force an immediate downgrade
pub const DROPS_BEFORE_DOWNGRADE: u32 = 3;
/// Consecutive congested ticks that force a downgrade
pub const CONGESTED_TICKS_BEFORE_DOWNGRADE: u32 = 2;
/// Consecutive healthy ticks required to upgrade
pub const HEALTHY_TICKS_BEFORE_UPGRADE: u32 = 6;

const CONGESTED_PENDING: u32 = 5;
const CONGESTED_ACK_MS: u64 = 3000;
const HEALTHY_PENDING: u32 = 1;
const HEALTHY_ACK_MS: u64 = 500;

/// Discrete capture/encode preset, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QualityLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl QualityLevel {
    pub const ALL: [QualityLevel; 4] = [
        QualityLevel::High,
        QualityLevel::Medium,
        QualityLevel::Low,
        QualityLevel::VeryLow,
    ];

    /// Resolution scale relative to the source
    pub fn scale(self) -> f32 {
        match self {
            QualityLevel::High => 1.0,
            QualityLevel::Medium => 0.75,
            QualityLevel::Low => 0.5,
            QualityLevel::VeryLow => 0.25,
        }
    }

    /// Compression quality, 1..=100
    pub fn quality(self) -> u8 {
        match self {
            QualityLevel::High => 80,
            QualityLevel::Medium => 60,
            QualityLevel::Low => 40,
            QualityLevel::VeryLow => 30,
        }
    }

    pub fn fps(self) -> u32 {
        match self {
            QualityLevel::High => 30,
            QualityLevel::Medium => 20,
            QualityLevel::Low => 10,
            QualityLevel::VeryLow => 5,
        }
    }

    /// One step down, clamped at the lowest level
    pub fn lower(self) -> Self {
        match self {
            QualityLevel::High => QualityLevel::Medium,
            QualityLevel::Medium => QualityLevel::Low,
            QualityLevel::Low | QualityLevel::VeryLow => QualityLevel::VeryLow,
        }
    }

    /// One step up, clamped at the highest level
    pub fn higher(self) -> Self {
        match self {
            QualityLevel::High | QualityLevel::Medium => QualityLevel::High,
            QualityLevel::Low => QualityLevel::Medium,
            QualityLevel::VeryLow => QualityLevel::Low,
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityLevel::High => "high",
            QualityLevel::Medium => "medium",
            QualityLevel::Low => "low",
            QualityLevel::VeryLow => "very-low",
        };
        f.write_str(name)
    }
}

/// Limits requested by the viewer for the current stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTarget {
    /// Upper bound on compression quality (software path)
    pub quality: u8,
    /// Upper bound on frame rate
    pub max_fps: u32,
    /// Bitrate at the top level (hardware path), bits per second
    pub bitrate: u32,
}

impl Default for StreamTarget {
    fn default() -> Self {
        Self {
            quality: 80,
            max_fps: 30,
            bitrate: 2_000_000,
        }
    }
}

/// Concrete encode parameters for one level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityParams {
    pub level: QualityLevel,
    pub scale: f32,
    pub quality: u8,
    pub fps: u32,
    pub bitrate: u32,
}

impl QualityParams {
    pub fn resolve(level: QualityLevel, target: &StreamTarget) -> Self {
        let quality = level.quality().min(target.quality.max(1));
        let bitrate = (target.bitrate as u64 * level.quality() as u64 / 80) as u32;
        Self {
            level,
            scale: level.scale(),
            quality,
            fps: level.fps().min(target.max_fps.max(1)),
            bitrate: bitrate.max(1),
        }
    }

    /// Minimum spacing between emitted frames
    pub fn frame_interval_ms(&self) -> u64 {
        1000 / self.fps.max(1) as u64
    }
}

/// Closed-loop quality controller.
///
/// The single owner of the current level. Returns the new parameters when
/// the level moves; the caller forwards them to the engine.
pub struct QualityController {
    flow: Arc<FlowCounters>,
    target: StreamTarget,
    level: QualityLevel,
    adaptive: bool,
    consecutive_slow: u32,
    consecutive_fast: u32,
    acked_bytes: u64,
}

impl QualityController {
    pub fn new(flow: Arc<FlowCounters>, target: StreamTarget) -> Self {
        Self {
            flow,
            target,
            level: QualityLevel::High,
            adaptive: true,
            consecutive_slow: 0,
            consecutive_fast: 0,
            acked_bytes: 0,
        }
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    pub fn params(&self) -> QualityParams {
        QualityParams::resolve(self.level, &self.target)
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    pub fn acked_bytes(&self) -> u64 {
        self.acked_bytes
    }

    /// (slow, fast) signal counters
    pub fn signal_counts(&self) -> (u32, u32) {
        (self.consecutive_slow, self.consecutive_fast)
    }

    pub fn on_frame_acknowledged(&mut self, size_bytes: usize, now: Instant) {
        self.flow.frame_settled();
        self.flow.mark_ack(now);
        self.acked_bytes += size_bytes as u64;
    }

    pub fn on_frame_dropped(&mut self) -> Option<QualityParams> {
        self.flow.frame_settled();
        if !self.adaptive {
            return None;
        }
        self.consecutive_fast = 0;
        self.consecutive_slow += 1;
        if self.consecutive_slow >= DROPS_BEFORE_DOWNGRADE {
            debug!("{} consecutive drops", self.consecutive_slow);
            return self.step(self.level.lower());
        }
        None
    }

    /// Periodic congestion check
    pub fn tick(&mut self, now: Instant) -> Option<QualityParams> {
        if !self.adaptive {
            return None;
        }
        let pending = self.flow.pending();
        let since_ack = self.flow.millis_since_ack(now);

        if pending > CONGESTED_PENDING || since_ack > CONGESTED_ACK_MS {
            self.consecutive_fast = 0;
            self.consecutive_slow += 1;
            debug!(
                "Congested tick: pending={} since_ack={}ms slow={}",
                pending, since_ack, self.consecutive_slow
            );
            if self.consecutive_slow >= CONGESTED_TICKS_BEFORE_DOWNGRADE {
                return self.step(self.level.lower());
            }
        } else if pending <= HEALTHY_PENDING && since_ack < HEALTHY_ACK_MS {
            self.consecutive_slow = 0;
            self.consecutive_fast += 1;
            if self.consecutive_fast >= HEALTHY_TICKS_BEFORE_UPGRADE {
                return self.step(self.level.higher());
            }
        }
        None
    }

    /// Pin the level explicitly; works with adaptation on or off
    pub fn set_level(&mut self, level: QualityLevel) -> Option<QualityParams> {
        self.step(level)
    }

    pub fn set_adaptive_enabled(&mut self, enabled: bool) {
        if self.adaptive != enabled {
            info!("Adaptive quality {}", if enabled { "enabled" } else { "disabled" });
        }
        self.adaptive = enabled;
        self.consecutive_slow = 0;
        self.consecutive_fast = 0;
    }

    fn step(&mut self, next: QualityLevel) -> Option<QualityParams> {
        self.consecutive_slow = 0;
        self.consecutive_fast = 0;
        if next == self.level {
            return None;
        }
        info!("Quality level {} -> {}", self.level, next);
        self.level = next;
        Some(self.params())
    }
}
