// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! RTT estimation from acknowledgement samples, following {{?RFC9002}}
//! section 5.

use std::{
    cmp::{max, min},
    time::{Duration, Instant},
};

use neqo_common::qwarn;

/// The timer granularity assumed everywhere a minimum delay is needed.
pub const GRANULARITY: Duration = Duration::from_millis(1);

/// Smoothed RTT, RTT variance, and min RTT, updated from ack samples.
///
/// `smoothed_rtt` of `None` means "no sample yet"; accessors fall back to
/// `initial_rtt` (and a quarter of it, for `rttvar`) in that case, which
/// is what makes the very first PTO equal `2 * initial_rtt`.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    initial_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Option<Duration>,
    rttvar: Duration,
    latest_rtt: Duration,
}

impl RttEstimator {
    #[must_use]
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            initial_rtt,
            min_rtt: Duration::MAX,
            smoothed_rtt: None,
            rttvar: Duration::ZERO,
            latest_rtt: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(self.initial_rtt)
    }

    #[must_use]
    pub fn rttvar(&self) -> Duration {
        if self.smoothed_rtt.is_some() {
            self.rttvar
        } else {
            self.initial_rtt / 4
        }
    }

    #[must_use]
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    #[must_use]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    /// Feed in one RTT sample observed from an acknowledgement.
    ///
    /// `ack_delay` is the peer-reported delay between receiving the packet
    /// and sending the ACK, already clamped by the caller to the peer's
    /// advertised `max_ack_delay` (see `RecoveryManager::on_ack_received`,
    /// which is the only caller and owns that transport parameter).
    pub fn add_sample(&mut self, time_received: Instant, time_sent: Instant, ack_delay: Duration) {
        let Some(sample) = time_received.checked_duration_since(time_sent) else {
            qwarn!("discarding RTT sample: ack received before packet was sent");
            return;
        };
        self.latest_rtt = sample;
        self.min_rtt = min(self.min_rtt, sample);

        // Adjust for the peer's reported ack delay, but never let the
        // adjustment push the sample below min_rtt: a delay larger than the
        // headroom above min_rtt isn't plausible and is ignored instead.
        let mut sample = sample;
        if sample > self.min_rtt + ack_delay {
            sample -= ack_delay;
        }

        match self.smoothed_rtt {
            None => {
                self.smoothed_rtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(smoothed) => {
                let rttvar_sample = smoothed.abs_diff(sample);
                self.rttvar = (self.rttvar * 3 + rttvar_sample) / 4;
                self.smoothed_rtt = Some((smoothed * 7 + sample) / 8);
            }
        }
    }

    /// The base PTO period for the current RTT estimate, before the
    /// exponential backoff term and any per-space `max_ack_delay`
    /// contribution are applied.
    #[must_use]
    pub fn base_pto(&self) -> Duration {
        self.smoothed_rtt() + max(4 * self.rttvar(), GRANULARITY)
    }
}
