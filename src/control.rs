//! Bandwidth-driven encoding parameters.
//!
//! The policy is a three-tier step function on the observed bandwidth plus one
//! adjustment for large blocks. No smoothing and no hysteresis: every batch is
//! decided from the latest sample alone.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

const LOW_BANDWIDTH_BPS: f64 = 1e6;
const HIGH_BANDWIDTH_BPS: f64 = 5e6;
const LARGE_BLOCK_BYTES: u64 = 1_000_000;
const LARGE_BLOCK_QP_STEP: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale factor of this resolution against `reference`, by height.
    pub fn scale_relative_to(&self, reference: Resolution) -> f64 {
        if reference.height == 0 {
            return 1.0;
        }
        self.height as f64 / reference.height as f64
    }

    /// `reference` scaled by `factor`, rounded down to even dimensions.
    pub fn scaled(reference: Resolution, factor: f64) -> Self {
        let even = |v: u32| ((v as f64 * factor / 2.0).trunc() as u32) * 2;
        Self::new(even(reference.width), even(reference.height))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Encoding parameters for one batch. Replaced wholesale between batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodingParameters {
    pub low_qp: u32,
    pub high_qp: u32,
    pub resolution: Resolution,
}

/// Picks encoding parameters from the current bandwidth and batch block size.
///
/// | bandwidth (bit/s) | low_qp | high_qp | resolution |
/// |---|---|---|---|
/// | `< 1e6` | 35 | 30 | 640x360 |
/// | `< 5e6` | 28 | 24 | 1280x720 |
/// | otherwise | 20 | 18 | 1920x1080 |
///
/// Blocks larger than 1e6 bytes raise `high_qp` by 2 after the tier is chosen.
pub fn select_parameters(bandwidth_bps: f64, block_size_bytes: u64) -> EncodingParameters {
    let mut params = if bandwidth_bps < LOW_BANDWIDTH_BPS {
        EncodingParameters {
            low_qp: 35,
            high_qp: 30,
            resolution: Resolution::new(640, 360),
        }
    } else if bandwidth_bps < HIGH_BANDWIDTH_BPS {
        EncodingParameters {
            low_qp: 28,
            high_qp: 24,
            resolution: Resolution::new(1280, 720),
        }
    } else {
        EncodingParameters {
            low_qp: 20,
            high_qp: 18,
            resolution: Resolution::new(1920, 1080),
        }
    };

    if block_size_bytes > LARGE_BLOCK_BYTES {
        params.high_qp += LARGE_BLOCK_QP_STEP;
    }
    params
}

/// Source of bandwidth estimates.
pub trait BandwidthMonitor: Send {
    fn name(&self) -> &'static str;

    /// Current rate estimate in bits per second.
    fn sample_bandwidth(&mut self) -> Result<f64>;
}

/// Monitor that always reports the same rate.
#[derive(Clone, Copy, Debug)]
pub struct StaticBandwidth {
    bps: f64,
}

impl StaticBandwidth {
    pub fn new(bps: f64) -> Self {
        Self { bps }
    }
}

impl BandwidthMonitor for StaticBandwidth {
    fn name(&self) -> &'static str {
        "static"
    }

    fn sample_bandwidth(&mut self) -> Result<f64> {
        Ok(self.bps)
    }
}

/// Holds the parameters in force and re-decides them once per batch.
///
/// Without a monitor the configured parameters are kept for the whole run.
pub struct ParameterController {
    monitor: Option<Box<dyn BandwidthMonitor>>,
    current: EncodingParameters,
}

impl ParameterController {
    pub fn new(initial: EncodingParameters) -> Self {
        Self {
            monitor: None,
            current: initial,
        }
    }

    pub fn with_monitor<M: BandwidthMonitor + 'static>(mut self, monitor: M) -> Self {
        self.monitor = Some(Box::new(monitor));
        self
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor.is_some()
    }

    pub fn current(&self) -> EncodingParameters {
        self.current
    }

    /// Parameters for the next batch.
    ///
    /// `block_size` is only evaluated when a monitor is attached. A failed
    /// bandwidth sample keeps the previous parameters.
    pub fn next_parameters(
        &mut self,
        block_size: impl FnOnce() -> Result<u64>,
    ) -> Result<EncodingParameters> {
        let Some(monitor) = self.monitor.as_mut() else {
            return Ok(self.current);
        };
        let bandwidth = match monitor.sample_bandwidth() {
            Ok(bps) => bps,
            Err(e) => {
                log::warn!(
                    "bandwidth monitor '{}' failed, keeping parameters: {:#}",
                    monitor.name(),
                    e
                );
                return Ok(self.current);
            }
        };
        let block_bytes = block_size()?;
        let next = select_parameters(bandwidth, block_bytes);
        if next != self.current {
            log::info!(
                "bandwidth {:.0} bit/s, block {} bytes: low_qp={} high_qp={} resolution={}",
                bandwidth,
                block_bytes,
                next.low_qp,
                next.high_qp,
                next.resolution
            );
        }
        self.current = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn middle_tier_small_block() {
        assert_eq!(
            select_parameters(2e6, 200_000),
            EncodingParameters {
                low_qp: 28,
                high_qp: 24,
                resolution: Resolution::new(1280, 720)
            }
        );
    }

    #[test]
    fn large_block_raises_high_qp() {
        assert_eq!(
            select_parameters(2e6, 2_000_000),
            EncodingParameters {
                low_qp: 28,
                high_qp: 26,
                resolution: Resolution::new(1280, 720)
            }
        );
        // exactly 1e6 bytes is not large
        assert_eq!(select_parameters(2e6, 1_000_000).high_qp, 24);
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(select_parameters(0.0, 0).low_qp, 35);
        assert_eq!(select_parameters(999_999.0, 0).resolution, Resolution::new(640, 360));
        assert_eq!(select_parameters(1e6, 0).low_qp, 28);
        assert_eq!(select_parameters(4_999_999.0, 0).low_qp, 28);
        assert_eq!(select_parameters(5e6, 0).low_qp, 20);
        assert_eq!(select_parameters(5e6, 0).resolution, Resolution::new(1920, 1080));
        assert_eq!(select_parameters(1e9, 5_000_000).high_qp, 20);
    }

    #[test]
    fn controller_without_monitor_keeps_parameters() {
        let initial = EncodingParameters {
            low_qp: 36,
            high_qp: 26,
            resolution: Resolution::new(1536, 864),
        };
        let mut controller = ParameterController::new(initial);
        let next = controller
            .next_parameters(|| Err(anyhow!("block size must not be read")))
            .expect("no monitor");
        assert_eq!(next, initial);
    }

    #[test]
    fn controller_with_monitor_follows_policy() {
        let initial = EncodingParameters {
            low_qp: 36,
            high_qp: 26,
            resolution: Resolution::new(1536, 864),
        };
        let mut controller =
            ParameterController::new(initial).with_monitor(StaticBandwidth::new(600_000.0));
        let next = controller.next_parameters(|| Ok(2_000_000)).expect("sample");
        assert_eq!(next, select_parameters(600_000.0, 2_000_000));
        assert_eq!(controller.current(), next);
    }

    struct FailingMonitor;

    impl BandwidthMonitor for FailingMonitor {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn sample_bandwidth(&mut self) -> Result<f64> {
            Err(anyhow!("link down"))
        }
    }

    #[test]
    fn failed_sample_keeps_previous_parameters() {
        let initial = select_parameters(1e7, 0);
        let mut controller = ParameterController::new(initial).with_monitor(FailingMonitor);
        assert_eq!(controller.next_parameters(|| Ok(0)).expect("kept"), initial);
    }

    #[test]
    fn resolution_scaling() {
        let reference = Resolution::new(1920, 1080);
        assert_eq!(Resolution::scaled(reference, 0.8), Resolution::new(1536, 864));
        let half = Resolution::new(1280, 720).scale_relative_to(reference);
        assert!((half - 2.0 / 3.0).abs() < 1e-12);
    }
}
