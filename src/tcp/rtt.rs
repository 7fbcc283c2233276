use crate::time::{Duration, Instant};
use crate::wire::TcpSeqNumber;

use super::Config;

/// A round-trip-time estimator, RFC 6298 style.
///
/// At most one sample is in progress at a time, and retransmitted data
/// never produces a sample (Karn's algorithm); the caller enforces the
/// latter by clearing the pending sample whenever it retransmits.
///
/// Stored values are in milliseconds.
#[derive(Debug, Clone, Copy)]
pub(super) struct RttEstimator {
    /// true if we have made at least one rtt measurement.
    have_measurement: bool,
    /// Smoothed RTT.
    srtt: u32,
    /// RTT variance.
    rttvar: u32,
    /// Retransmission Time-Out.
    rto: u32,
    /// In-progress sample: when the send happened, and the sequence
    /// number an acknowledgement has to reach for the sample to complete.
    timestamp: Option<(Instant, TcpSeqNumber)>,
}

impl RttEstimator {
    pub(super) fn new(config: &Config) -> Self {
        Self {
            have_measurement: false,
            srtt: 0,   // ignored, will be overwritten on first measurement.
            rttvar: 0, // ignored, will be overwritten on first measurement.
            rto: config.rto_initial.total_millis() as u32,
            timestamp: None,
        }
    }

    pub(super) fn rto(&self) -> Duration {
        Duration::from_millis(self.rto as u64)
    }

    /// Start a sample on freshly sent data, unless one is in progress.
    pub(super) fn start_sample(&mut self, now: Instant, seq: TcpSeqNumber) {
        if self.timestamp.is_none() {
            self.timestamp = Some((now, seq));
        }
    }

    /// Discard the in-progress sample. Called on every retransmission.
    pub(super) fn clear_sample(&mut self) {
        self.timestamp = None;
    }

    /// Complete the in-progress sample if `ack` covers it.
    pub(super) fn on_ack(&mut self, config: &Config, now: Instant, ack: TcpSeqNumber) {
        if let Some((sent_at, seq)) = self.timestamp {
            if ack.ge(seq) {
                self.sample(config, (now - sent_at).total_millis() as u32);
                self.timestamp = None;
            }
        }
    }

    /// Back the timeout off after an expiry, clamped to the maximum.
    pub(super) fn backoff(&mut self, config: &Config) {
        self.rto = (self.rto * 2).min(config.rto_max.total_millis() as u32);
    }

    fn sample(&mut self, config: &Config, new_rtt: u32) {
        if self.have_measurement {
            let diff = self.srtt.abs_diff(new_rtt);
            self.rttvar = (self.rttvar * 3 + diff) / 4;
            self.srtt = (self.srtt * 7 + new_rtt) / 8;
        } else {
            self.srtt = new_rtt;
            self.rttvar = new_rtt / 2;
            self.have_measurement = true;
        }

        self.rto = (self.srtt + 4 * self.rttvar).clamp(
            config.rto_min.total_millis() as u32,
            config.rto_max.total_millis() as u32,
        );
    }
}
