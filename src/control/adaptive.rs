//! Loss/jitter driven controller

use serde::{Deserialize, Serialize};

use crate::rtp::RtcpReport;

/// Controller thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Minimum bitrate (bps)
    pub min_bitrate: u32,
    /// Maximum bitrate (bps)
    pub max_bitrate: u32,
    /// Additive increase step (bps)
    pub bitrate_step: u32,
    /// Loss fraction above which the bitrate is cut hard
    pub high_loss: f32,
    /// Loss fraction above which the bitrate is trimmed
    pub moderate_loss: f32,
    /// Loss fraction below which a report counts as good
    pub low_loss: f32,
    /// Consecutive good reports before increasing
    pub recovery_reports: u32,
    /// Jitter (ms) above which adaptive jitter compensation is turned on
    pub jitter_threshold_ms: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_bitrate: 6_000,
            max_bitrate: 64_000,
            bitrate_step: 4_000,
            high_loss: 0.10,
            moderate_loss: 0.03,
            low_loss: 0.01,
            recovery_reports: 3,
            jitter_threshold_ms: 40.0,
        }
    }
}

impl AdaptiveConfig {
    /// Video defaults
    pub fn video() -> Self {
        Self {
            min_bitrate: 64_000,
            max_bitrate: 2_000_000,
            bitrate_step: 64_000,
            ..Self::default()
        }
    }
}

/// Adjustment requested by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// New encoder target bitrate (bps)
    SetBitrate(u32),
    /// Turn the session's adaptive jitter compensation on or off
    EnableAdaptiveJitter(bool),
}

/// Adaptive controller.
///
/// Disabled controllers keep their state but request nothing.
#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    enabled: bool,
    clock_rate: u32,
    current_bitrate: u32,
    good_reports: u32,
    adaptive_jitter: bool,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, initial_bitrate: u32, clock_rate: u32) -> Self {
        let current_bitrate = initial_bitrate.clamp(config.min_bitrate, config.max_bitrate);
        Self {
            config,
            enabled: false,
            clock_rate: clock_rate.max(1),
            current_bitrate,
            good_reports: 0,
            adaptive_jitter: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            tracing::info!(
                "Adaptive control {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.enabled = enabled;
        self.good_reports = 0;
    }

    /// Bitrate the controller currently targets
    pub fn bitrate(&self) -> u32 {
        self.current_bitrate
    }

    /// Keep track of the session's jitter setting when changed elsewhere
    pub fn set_adaptive_jitter_state(&mut self, enabled: bool) {
        self.adaptive_jitter = enabled;
    }

    /// Feed one RTCP report from the peer
    pub fn process_report(&mut self, report: &RtcpReport) -> Vec<ControlAction> {
        let mut actions = Vec::new();
        if !self.enabled {
            return actions;
        }
        let Some(block) = report.block.as_ref() else {
            return actions;
        };

        let loss = block.fraction_lost as f32 / 256.0;
        let jitter_ms = block.jitter as f64 * 1000.0 / self.clock_rate as f64;

        let target = if loss > self.config.high_loss {
            self.good_reports = 0;
            scale(self.current_bitrate, 7, 10)
        } else if loss > self.config.moderate_loss {
            self.good_reports = 0;
            scale(self.current_bitrate, 9, 10)
        } else if loss < self.config.low_loss {
            self.good_reports += 1;
            if self.good_reports >= self.config.recovery_reports {
                self.good_reports = 0;
                self.current_bitrate.saturating_add(self.config.bitrate_step)
            } else {
                self.current_bitrate
            }
        } else {
            self.good_reports = 0;
            self.current_bitrate
        };

        let target = target.clamp(self.config.min_bitrate, self.config.max_bitrate);
        if target != self.current_bitrate {
            tracing::debug!(
                "Loss {:.1}%: bitrate {} -> {}",
                loss * 100.0,
                self.current_bitrate,
                target
            );
            self.current_bitrate = target;
            actions.push(ControlAction::SetBitrate(target));
        }

        if jitter_ms > self.config.jitter_threshold_ms && !self.adaptive_jitter {
            tracing::debug!("Jitter {:.1} ms, enabling adaptive jitter compensation", jitter_ms);
            self.adaptive_jitter = true;
            actions.push(ControlAction::EnableAdaptiveJitter(true));
        }

        actions
    }
}

fn scale(value: u32, num: u64, den: u64) -> u32 {
    (value as u64 * num / den) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::rtcp::ReportBlock;

    fn report(fraction_lost: u8, jitter: u32) -> RtcpReport {
        RtcpReport {
            sender_ssrc: 7,
            is_sender_report: false,
            block: Some(ReportBlock {
                ssrc: 1,
                fraction_lost,
                cumulative_lost: 0,
                highest_seq: 0,
                jitter,
                last_sr: 0,
                delay_since_last_sr: 0,
            }),
        }
    }

    fn controller() -> AdaptiveController {
        let mut c = AdaptiveController::new(AdaptiveConfig::default(), 32_000, 48_000);
        c.set_enabled(true);
        c
    }

    #[test]
    fn test_disabled_does_nothing() {
        let mut c = AdaptiveController::new(AdaptiveConfig::default(), 32_000, 48_000);
        assert!(c.process_report(&report(128, 0)).is_empty());
        assert_eq!(c.bitrate(), 32_000);
    }

    #[test]
    fn test_heavy_loss_cuts_bitrate() {
        let mut c = controller();
        // 64/256 = 25%
        let actions = c.process_report(&report(64, 0));
        assert_eq!(actions, vec![ControlAction::SetBitrate(22_400)]);
    }

    #[test]
    fn test_never_below_minimum() {
        let mut c = controller();
        for _ in 0..50 {
            c.process_report(&report(200, 0));
        }
        assert_eq!(c.bitrate(), AdaptiveConfig::default().min_bitrate);
    }

    #[test]
    fn test_recovery_after_good_reports() {
        let mut c = controller();
        assert!(c.process_report(&report(0, 0)).is_empty());
        assert!(c.process_report(&report(0, 0)).is_empty());
        assert_eq!(
            c.process_report(&report(0, 0)),
            vec![ControlAction::SetBitrate(36_000)]
        );
    }

    #[test]
    fn test_high_jitter_enables_compensation_once() {
        let mut c = controller();
        c.set_adaptive_jitter_state(false);
        // 4800 ticks at 48 kHz = 100 ms
        let actions = c.process_report(&report(5, 4800));
        assert!(actions.contains(&ControlAction::EnableAdaptiveJitter(true)));
        let again = c.process_report(&report(5, 4800));
        assert!(!again.contains(&ControlAction::EnableAdaptiveJitter(true)));
    }

    #[test]
    fn test_report_without_block_ignored() {
        let mut c = controller();
        let r = RtcpReport {
            sender_ssrc: 7,
            is_sender_report: true,
            block: None,
        };
        assert!(c.process_report(&r).is_empty());
    }
}
