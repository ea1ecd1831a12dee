// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Loss detection and probe-timeout scheduling, following {{?RFC9002}}.
//!
//! [`LossDetector`] tracks in-flight packets for a single packet-number
//! space and declares losses by packet and time threshold.
//! [`RecoveryManager`] owns one `LossDetector` per space plus the shared
//! [`RttEstimator`](crate::rtt::RttEstimator) and drives the single
//! loss-detection timer all three spaces share.

use std::{
    collections::BTreeMap,
    ops::RangeInclusive,
    time::{Duration, Instant},
};

use neqo_common::{qdebug, qinfo, qwarn};
use smallvec::SmallVec;
use static_assertions::const_assert;

use crate::{
    collaborators::{CongestionAdvisor, Frame, HandshakeStateObserver, ProbeSender},
    rtt::RttEstimator,
    tracking::{EncryptionLevel, HandshakeState, PerSpace, PnSpace},
};

/// Cap on the PTO exponential backoff shift (`pto_count.min(MAX_PTO_BACKOFF_SHIFT)`),
/// chosen so the shift can never overflow a `u32`.
const MAX_PTO_BACKOFF_SHIFT: u32 = 16;
const_assert!(MAX_PTO_BACKOFF_SHIFT < u32::BITS);

/// Bytes of PADDING a `[Ping, Padding(n)]` probe carries when a space has
/// nothing worth retransmitting verbatim.
const PROBE_PADDING_BYTES: u32 = 2;

/// Tunables that RFC9002 treats as constants but that a real client may
/// want to override (for testing, or to follow local transport parameter
/// negotiation for `max_ack_delay`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Packets more than this many behind the largest acknowledged are
    /// declared lost outright (`kPacketThreshold`).
    pub packet_threshold: u64,
    /// Numerator of the time-threshold multiplier applied to RTT
    /// (`kTimeThreshold`, default `9/8`).
    pub time_threshold_num: u32,
    pub time_threshold_den: u32,
    /// Assumed timer granularity; the time threshold is never allowed
    /// below this (`kGranularity`).
    pub granularity_ms: u64,
    /// RTT assumed before the first sample arrives (`kInitialRtt`).
    pub initial_rtt_ms: u64,
    /// The peer's advertised `max_ack_delay` transport parameter; ack
    /// delays are clamped to this before use.
    pub receiver_max_ack_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            packet_threshold: 3,
            time_threshold_num: 9,
            time_threshold_den: 8,
            granularity_ms: 1,
            initial_rtt_ms: 333,
            receiver_max_ack_delay_ms: 25,
        }
    }
}

/// A packet this crate has sent and is waiting to see acknowledged or
/// declared lost.
#[derive(Debug, Clone)]
pub struct InFlightPacket<T> {
    pub pn: u64,
    pub time_sent: Instant,
    pub size: u32,
    pub ack_eliciting: bool,
    /// Ack-eliciting or carries PADDING: occupies congestion-window bytes
    /// and is tracked by a [`LossDetector`] at all. A packet made up
    /// solely of an ACK frame is neither.
    pub in_flight: bool,
    /// Packets rarely carry more than a handful of frames, so this stays
    /// inline instead of allocating for every packet in flight.
    pub frames: SmallVec<[Frame<T>; 4]>,
}

impl<T> InFlightPacket<T> {
    #[must_use]
    pub fn new(pn: u64, time_sent: Instant, size: u32, frames: impl Into<SmallVec<[Frame<T>; 4]>>) -> Self {
        let frames = frames.into();
        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let in_flight = ack_eliciting || frames.iter().any(|f| matches!(f, Frame::Padding(_)));
        Self {
            pn,
            time_sent,
            size,
            ack_eliciting,
            in_flight,
            frames,
        }
    }

    /// The frames worth putting in a probe that retransmits this packet's
    /// content: everything except `Ack` (`Ack` is never retransmitted, and
    /// always stale by the time a probe fires).
    fn retransmittable_frames(&self) -> Vec<Frame<T>>
    where
        T: Clone,
    {
        self.frames
            .iter()
            .filter(|f| !matches!(f, Frame::Ack))
            .cloned()
            .collect()
    }
}

/// The result of feeding an ACK range into a single space's
/// [`LossDetector`].
struct AckResult<T> {
    acked: Vec<InFlightPacket<T>>,
    /// `(time_sent, time_received)` of the largest newly-acked
    /// ack-eliciting packet, if any: the one RTT sample RFC9002 allows
    /// per ACK.
    rtt_sample: Option<(Instant, Instant)>,
}

/// Tracks in-flight packets and declares losses for one packet-number
/// space.
#[derive(Debug)]
pub struct LossDetector<T> {
    sent: BTreeMap<u64, InFlightPacket<T>>,
    largest_acked: Option<u64>,
    loss_time: Option<Instant>,
    last_ack_eliciting_sent: Option<Instant>,
    /// True until this space has ever seen an ACK frame at all, including
    /// ones that acknowledge nothing new. Distinguishes "no reply yet"
    /// from "nothing currently in flight" for the PTO anti-deadlock rule.
    no_ack_received: bool,
}

impl<T> Default for LossDetector<T> {
    fn default() -> Self {
        Self {
            sent: BTreeMap::new(),
            largest_acked: None,
            loss_time: None,
            last_ack_eliciting_sent: None,
            no_ack_received: true,
        }
    }
}

impl<T> LossDetector<T> {
    pub fn on_packet_sent(&mut self, pkt: InFlightPacket<T>) {
        if pkt.ack_eliciting {
            self.last_ack_eliciting_sent = Some(pkt.time_sent);
        }
        self.sent.insert(pkt.pn, pkt);
    }

    fn on_ack_received(&mut self, acked_ranges: &[RangeInclusive<u64>], ack_time: Instant) -> AckResult<T> {
        // The ACK frame's largest_acknowledged: the maximum packet number
        // any of its ranges covers, whether or not it was newly acked here.
        let ack_largest = acked_ranges.iter().map(|r| *r.end()).max();
        let mut acked = Vec::new();
        let mut largest_newly_acked: Option<(u64, bool, Instant)> = None;
        for range in acked_ranges {
            for pn in range.clone() {
                let Some(pkt) = self.sent.remove(&pn) else {
                    continue;
                };
                if largest_newly_acked.map_or(true, |(l, ..)| pn > l) {
                    largest_newly_acked = Some((pn, pkt.ack_eliciting, pkt.time_sent));
                }
                acked.push(pkt);
            }
        }
        if let Some(largest) = ack_largest {
            self.largest_acked = Some(self.largest_acked.map_or(largest, |prev| prev.max(largest)));
        }
        // An RTT sample is only valid from the ACK frame's actual largest
        // acknowledged packet number. On a duplicate or overlapping ACK
        // whose largest was already acked by an earlier frame,
        // `largest_newly_acked` is some smaller, older packet; sampling RTT
        // from it would inflate `latest_rtt`/`smoothed_rtt` with a stale
        // send time.
        let rtt_sample = largest_newly_acked.and_then(|(pn, ack_eliciting, time_sent)| {
            (ack_eliciting && ack_largest == Some(pn)).then_some((time_sent, ack_time))
        });
        self.no_ack_received = false;
        AckResult { acked, rtt_sample }
    }

    /// Remove and return packets declared lost: either `packet_threshold`
    /// or more behind the largest acknowledged packet number, or sent
    /// longer than `loss_delay` ago. Also updates the space's `loss_time`
    /// to the earliest point a still-in-flight packet would cross the
    /// time threshold, for [`RecoveryManager::set_loss_detection_timer`].
    fn detect_lost_packets(
        &mut self,
        now: Instant,
        loss_delay: Duration,
        packet_threshold: u64,
    ) -> Vec<InFlightPacket<T>> {
        self.loss_time = None;
        let Some(largest_acked) = self.largest_acked else {
            return Vec::new();
        };
        let lost_pns: Vec<u64> = self
            .sent
            .range(..=largest_acked)
            .filter(|(&pn, pkt)| largest_acked - pn >= packet_threshold || pkt.time_sent + loss_delay <= now)
            .map(|(&pn, _)| pn)
            .collect();
        let lost: Vec<InFlightPacket<T>> = lost_pns
            .into_iter()
            .map(|pn| self.sent.remove(&pn).expect("key was just observed in self.sent"))
            .collect();
        for (_, pkt) in self.sent.range(..=largest_acked) {
            let candidate = pkt.time_sent + loss_delay;
            self.loss_time = Some(self.loss_time.map_or(candidate, |t| t.min(candidate)));
        }
        lost
    }

    #[must_use]
    pub fn loss_time(&self) -> Option<Instant> {
        self.loss_time
    }

    #[must_use]
    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.sent.values().any(|p| p.ack_eliciting)
    }

    #[must_use]
    pub fn last_ack_eliciting_sent_time(&self) -> Option<Instant> {
        self.last_ack_eliciting_sent
    }

    #[must_use]
    pub fn no_ack_received(&self) -> bool {
        self.no_ack_received
    }

    /// The unacked packet with the smallest packet number, if any. The
    /// backing map is keyed by packet number, so iteration order already
    /// gives us this for free.
    fn earliest_unacked(&self) -> Option<&InFlightPacket<T>> {
        self.sent.values().next()
    }

    /// The unacked packet with the smallest packet number that is
    /// ack-eliciting and carries at least one frame worth retransmitting
    /// (excludes packets made up only of `Ping`/`Padding`/`Ack`).
    fn earliest_unacked_non_trivial(&self) -> Option<&InFlightPacket<T>> {
        self.sent
            .values()
            .find(|p| p.ack_eliciting && p.frames.iter().any(|f| !f.is_trivial_for_retransmit()))
    }

    /// Forget everything this space was tracking, returning the packets
    /// that were in flight. Used when a space is discarded or recovery is
    /// torn down entirely; those packets are neither acked nor lost, just
    /// no longer relevant. `no_ack_received` is untouched: whether this
    /// space has ever heard from the peer doesn't depend on what it still
    /// has in flight.
    pub fn reset(&mut self) -> Vec<InFlightPacket<T>> {
        self.largest_acked = None;
        self.loss_time = None;
        self.last_ack_eliciting_sent = None;
        std::mem::take(&mut self.sent).into_values().collect()
    }
}

/// Packets acknowledged and declared lost by a single call to
/// [`RecoveryManager::on_ack_received`].
pub struct AckOutcome<T> {
    pub acked: Vec<InFlightPacket<T>>,
    pub lost: Vec<InFlightPacket<T>>,
}

/// What governed the most recent arming of the shared loss-detection
/// timer, recorded so a firing doesn't need to recompute which case it's
/// in (and so a stale firing can be told apart from a live one).
#[derive(Clone, Copy, PartialEq, Eq)]
enum TimerReason {
    Loss(PnSpace),
    Pto,
}

impl std::fmt::Debug for TimerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loss(space) => write!(f, "loss timer in {space}"),
            Self::Pto => write!(f, "PTO"),
        }
    }
}

/// What happened when the shared loss-detection timer fired.
pub enum TimerEvent<T> {
    /// `generation` didn't match the timer's current generation; this
    /// firing raced a reschedule or cancellation and must be ignored.
    Stale,
    Loss {
        space: PnSpace,
        lost: Vec<InFlightPacket<T>>,
    },
    Pto {
        level: EncryptionLevel,
        pto_count: u32,
    },
}

/// Owns RTT estimation and per-space loss detection, and drives the
/// single shared loss-detection timer.
///
/// There is exactly one timer across all three spaces. Every time it is
/// (re)armed, `timer_generation` is incremented and handed back to the
/// caller alongside the deadline; [`Self::on_timer_fired`] takes that
/// generation back and ignores the firing if it no longer matches, which
/// is what makes a stale timer (one rearmed or cancelled after it was
/// already queued to fire) harmless instead of a race.
pub struct RecoveryManager<T> {
    config: RecoveryConfig,
    rtt: RttEstimator,
    detectors: PerSpace<LossDetector<T>>,
    active: PerSpace<bool>,
    handshake_state: HandshakeState,
    pto_count: u32,
    /// Whether a Handshake-level packet has been sent yet; the first one
    /// discards the Initial space (its keys are retired once the
    /// handshake starts sending at the next level).
    first_handshake_sent: bool,
    timer_generation: u64,
    armed: Option<(Instant, u64, TimerReason)>,
    /// Set by [`Self::stop_recovery`]; once true every event method is a
    /// no-op.
    stopped: bool,
}

impl<T> RecoveryManager<T> {
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        let rtt = RttEstimator::new(Duration::from_millis(config.initial_rtt_ms));
        Self {
            config,
            rtt,
            detectors: PerSpace::default(),
            active: PerSpace::new_with(true),
            handshake_state: HandshakeState::Initial,
            pto_count: 0,
            first_handshake_sent: false,
            timer_generation: 0,
            armed: None,
            stopped: false,
        }
    }

    #[must_use]
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    #[must_use]
    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    fn is_active(&self, space: PnSpace) -> bool {
        *self.active.get(space)
    }

    fn loss_delay(&self) -> Duration {
        let base = self.rtt.smoothed_rtt().max(self.rtt.latest_rtt());
        let scaled = base * self.config.time_threshold_num / self.config.time_threshold_den;
        scaled.max(Duration::from_millis(self.config.granularity_ms))
    }

    fn pto_duration(&self, space: PnSpace) -> Duration {
        let mut pto = self.rtt.base_pto();
        if space == PnSpace::App {
            pto += Duration::from_millis(self.config.receiver_max_ack_delay_ms);
        }
        let backoff = 1_u32 << self.pto_count.min(MAX_PTO_BACKOFF_SHIFT);
        pto * backoff
    }

    fn ack_eliciting_in_flight(&self) -> bool {
        PnSpace::ALL
            .into_iter()
            .any(|s| self.is_active(s) && self.detectors.get(s).has_ack_eliciting_in_flight())
    }

    /// True while the client still doesn't know whether the peer has
    /// validated its address: before Handshake keys exist, or after they
    /// do but neither the Handshake nor the App space has heard back at
    /// all. Without this, a client that has nothing in flight (everything
    /// sent so far got acked) would disarm the timer and stall forever
    /// waiting on a peer that never replies.
    fn peer_awaiting_validation(&self) -> bool {
        matches!(self.handshake_state, HandshakeState::Initial | HandshakeState::HasHandshakeKeys)
            && self.detectors.get(PnSpace::Handshake).no_ack_received()
            && self.detectors.get(PnSpace::App).no_ack_received()
    }

    /// `(space, last_ack_eliciting_sent)` for the space with the earliest
    /// such timestamp, across active spaces that have one at all.
    fn earliest_last_ack_eliciting_sent(&self) -> Option<(PnSpace, Instant)> {
        PnSpace::ALL
            .into_iter()
            .filter(|&s| self.is_active(s))
            .filter_map(|s| self.detectors.get(s).last_ack_eliciting_sent_time().map(|t| (s, t)))
            .min_by_key(|&(_, t)| t)
    }

    /// Recompute and arm the shared timer, returning the new deadline and
    /// generation if it ends up armed at all. Called after every event
    /// that could change when the timer should next fire.
    pub fn set_loss_detection_timer(&mut self, now: Instant) -> Option<(Instant, u64)> {
        if self.stopped {
            return None;
        }
        let earliest_loss = PnSpace::ALL
            .into_iter()
            .filter(|&s| self.is_active(s))
            .filter_map(|s| self.detectors.get(s).loss_time().map(|t| (s, t)))
            .min_by_key(|&(_, t)| t);

        if let Some((space, t)) = earliest_loss {
            return self.arm(t, TimerReason::Loss(space));
        }

        let ack_eliciting_in_flight = self.ack_eliciting_in_flight();
        let peer_awaiting_validation = self.peer_awaiting_validation();
        if !ack_eliciting_in_flight && !peer_awaiting_validation {
            qdebug!("nothing ack-eliciting in flight and peer is validated; disarming loss detection timer");
            self.armed = None;
            return None;
        }

        let (space, anchor) = match self.earliest_last_ack_eliciting_sent() {
            Some((s, t)) => (s, t),
            None if peer_awaiting_validation => (PnSpace::Handshake, now),
            None => {
                // `ack_eliciting_in_flight` must be true here (we would
                // have disarmed above otherwise), yet no space recorded a
                // last-ack-eliciting-sent time: an impossible combination
                // absent a bug elsewhere. Coerce to `now` so the timer
                // stays armed rather than silently stalling the handshake.
                qwarn!("ack-eliciting packet in flight but no last-ack-eliciting-sent time recorded; using now()");
                (PnSpace::Handshake, now)
            }
        };
        let pto = self.pto_duration(space);
        self.arm(anchor + pto, TimerReason::Pto)
    }

    fn arm(&mut self, deadline: Instant, reason: TimerReason) -> Option<(Instant, u64)> {
        self.timer_generation += 1;
        qdebug!("arming loss detection timer for {reason:?}, generation {}", self.timer_generation);
        self.armed = Some((deadline, self.timer_generation, reason));
        Some((deadline, self.timer_generation))
    }

    pub fn on_packet_sent(
        &mut self,
        space: PnSpace,
        pkt: InFlightPacket<T>,
        now: Instant,
        cc: &mut impl CongestionAdvisor,
    ) {
        if self.stopped {
            return;
        }
        if space == PnSpace::Handshake && !self.first_handshake_sent {
            qdebug!("first Handshake packet sent; discarding Initial keys");
            *self.active.get_mut(PnSpace::Initial) = false;
            self.detectors.get_mut(PnSpace::Initial).reset();
            self.first_handshake_sent = true;
        }
        if !pkt.in_flight {
            return;
        }
        cc.on_packet_sent(pkt.size);
        self.detectors.get_mut(space).on_packet_sent(pkt);
        self.set_loss_detection_timer(now);
    }

    pub fn on_ack_received(
        &mut self,
        space: PnSpace,
        acked_ranges: &[RangeInclusive<u64>],
        ack_delay: Duration,
        now: Instant,
        cc: &mut impl CongestionAdvisor,
    ) -> AckOutcome<T> {
        if self.stopped {
            return AckOutcome { acked: Vec::new(), lost: Vec::new() };
        }
        self.pto_count = 0;
        let ack_delay = ack_delay.min(Duration::from_millis(self.config.receiver_max_ack_delay_ms));
        let result = self.detectors.get_mut(space).on_ack_received(acked_ranges, now);
        if let Some((time_sent, time_received)) = result.rtt_sample {
            self.rtt.add_sample(time_received, time_sent, ack_delay);
        }
        for pkt in &result.acked {
            cc.on_packet_acked(pkt.size);
        }

        let loss_delay = self.loss_delay();
        let lost = self
            .detectors
            .get_mut(space)
            .detect_lost_packets(now, loss_delay, self.config.packet_threshold);
        if !lost.is_empty() {
            let sizes: Vec<u32> = lost.iter().map(|p| p.size).collect();
            qinfo!("[{space}] {} packets declared lost", sizes.len());
            cc.on_packets_lost(&sizes);
        }

        self.set_loss_detection_timer(now);
        AckOutcome { acked: result.acked, lost }
    }

    /// Build the frames a PTO probe should carry for `space`, per the
    /// retransmit-or-ping-and-pad rule: a packet worth retransmitting
    /// verbatim if one is in flight, otherwise a bare `[Ping, Padding(2)]`.
    fn probe_frames(&self, space: PnSpace) -> Vec<Frame<T>>
    where
        T: Clone,
    {
        self.detectors
            .get(space)
            .earliest_unacked_non_trivial()
            .map_or_else(|| vec![Frame::Ping, Frame::Padding(PROBE_PADDING_BYTES)], InFlightPacket::retransmittable_frames)
    }

    /// Choose what a PTO probe retransmits and at which level, following
    /// §4.5's three-way handshake-progress split: probe Initial until
    /// Handshake keys exist, then Handshake until App keys exist, then the
    /// space that's actually been waiting longest.
    fn probe_plan(&self) -> (EncryptionLevel, Vec<Frame<T>>)
    where
        T: Clone,
    {
        if !self.handshake_state.has_handshake_keys() {
            let frames = self
                .detectors
                .get(PnSpace::Initial)
                .earliest_unacked()
                .map_or_else(|| vec![Frame::Ping, Frame::Padding(PROBE_PADDING_BYTES)], InFlightPacket::retransmittable_frames);
            (EncryptionLevel::Initial, frames)
        } else if !self.handshake_state.has_app_keys() {
            (EncryptionLevel::Handshake, self.probe_frames(PnSpace::Handshake))
        } else {
            let space = self
                .earliest_last_ack_eliciting_sent()
                .map_or(PnSpace::App, |(s, _)| s);
            (space.related_encryption_level(), self.probe_frames(space))
        }
    }

    /// Drive the shared timer. `generation` must be the one returned by
    /// the call to [`Self::set_loss_detection_timer`] that armed the
    /// firing being handled; anything else means this firing is stale
    /// and is reported (and otherwise ignored) as [`TimerEvent::Stale`].
    pub fn on_timer_fired(
        &mut self,
        generation: u64,
        now: Instant,
        sender: &mut impl ProbeSender<T>,
        cc: &mut impl CongestionAdvisor,
    ) -> TimerEvent<T>
    where
        T: Clone,
    {
        if self.stopped {
            return TimerEvent::Stale;
        }
        let reason = match self.armed {
            Some((_, g, reason)) if g == generation => reason,
            _ => {
                qwarn!("ignoring stale loss detection timer fire (generation {generation})");
                return TimerEvent::Stale;
            }
        };
        self.armed = None;

        match reason {
            TimerReason::Loss(space) => {
                let loss_delay = self.loss_delay();
                let lost = self
                    .detectors
                    .get_mut(space)
                    .detect_lost_packets(now, loss_delay, self.config.packet_threshold);
                qinfo!("[{space}] loss timer fired, {} packets lost", lost.len());
                if !lost.is_empty() {
                    let sizes: Vec<u32> = lost.iter().map(|p| p.size).collect();
                    cc.on_packets_lost(&sizes);
                }
                self.set_loss_detection_timer(now);
                TimerEvent::Loss { space, lost }
            }
            TimerReason::Pto => {
                self.pto_count += 1;
                let (level, frames) = self.probe_plan();
                let num_probes = if self.pto_count > 1 { 2 } else { 1 };
                qinfo!("[{level}] PTO fired, pto_count now {}, sending {num_probes} probe(s)", self.pto_count);
                for _ in 0..num_probes {
                    sender.send_probe(frames.clone(), level);
                }
                self.set_loss_detection_timer(now);
                TimerEvent::Pto {
                    level,
                    pto_count: self.pto_count,
                }
            }
        }
    }

    /// Discard all state for `space`; its packets are neither acked nor
    /// lost, they simply stop being tracked. Equivalent to `stop_recovery`
    /// scoped to a single space.
    pub fn discard_space(&mut self, space: PnSpace, now: Instant) -> Vec<InFlightPacket<T>> {
        *self.active.get_mut(space) = false;
        let forgotten = self.detectors.get_mut(space).reset();
        self.set_loss_detection_timer(now);
        forgotten
    }

    /// Tear down all recovery state, e.g. because the connection is
    /// closing. No packets are returned: nobody acts on them past this
    /// point. Every event method becomes a no-op afterward.
    pub fn stop_recovery(&mut self) {
        self.armed = None;
        self.stopped = true;
        for (_, detector) in self.detectors.iter_mut() {
            detector.reset();
        }
    }
}

impl<T> HandshakeStateObserver for RecoveryManager<T> {
    /// Record a new handshake state. The caller must follow this with a
    /// call to [`Self::set_loss_detection_timer`]: confirming the
    /// handshake can disarm the anti-deadlock PTO arm, and this type has
    /// no clock of its own to do that rearming itself.
    fn handshake_state_changed(&mut self, new_state: HandshakeState) {
        debug_assert!(new_state >= self.handshake_state, "handshake state must not go backwards");
        self.handshake_state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::AlwaysSend;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    struct RecordingSender {
        probes: Vec<(EncryptionLevel, Vec<Frame<()>>)>,
    }

    impl ProbeSender<()> for RecordingSender {
        fn send_probe(&mut self, frames: Vec<Frame<()>>, level: EncryptionLevel) {
            self.probes.push((level, frames));
        }
    }

    #[derive(Default)]
    struct RecordingCc {
        lost: Vec<u32>,
    }

    impl CongestionAdvisor for RecordingCc {
        fn on_packet_sent(&mut self, _size: u32) {}
        fn on_packet_acked(&mut self, _size: u32) {}
        fn on_packets_lost(&mut self, sizes: &[u32]) {
            self.lost.extend_from_slice(sizes);
        }
        fn can_send(&self) -> bool {
            true
        }
    }

    fn sent_ping(pn: u64, now: Instant) -> InFlightPacket<()> {
        InFlightPacket::new(pn, now, 1200, vec![Frame::Ping])
    }

    #[test]
    fn first_pto_is_two_times_initial_rtt() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        let (deadline, _) = mgr.armed.expect("timer armed after sending an ack-eliciting packet");
        assert_eq!(deadline, t0 + ms(2 * 333));
    }

    #[test]
    fn pto_fire_sends_two_probes_and_backs_off() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        let (deadline, gen) = mgr.armed.unwrap();

        let mut sender = RecordingSender { probes: Vec::new() };
        let event = mgr.on_timer_fired(gen, deadline, &mut sender, &mut cc);
        assert!(matches!(event, TimerEvent::Pto { pto_count: 1, .. }));
        // First PTO: only one probe.
        assert_eq!(sender.probes.len(), 1);
        assert_eq!(mgr.pto_count(), 1);

        // Sending the probe re-arms the timer with the doubled backoff.
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(1, deadline), deadline, &mut cc);
        let (deadline2, gen2) = mgr.armed.unwrap();
        assert_eq!(deadline2, deadline + ms(2 * 2 * 333));

        // A second consecutive PTO sends two probes.
        let mut sender2 = RecordingSender { probes: Vec::new() };
        let event2 = mgr.on_timer_fired(gen2, deadline2, &mut sender2, &mut cc);
        assert!(matches!(event2, TimerEvent::Pto { pto_count: 2, .. }));
        assert_eq!(sender2.probes.len(), 2);
    }

    #[test]
    fn stale_timer_fire_is_ignored() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        let (_, gen) = mgr.armed.unwrap();
        let mut sender = RecordingSender { probes: Vec::new() };
        assert!(matches!(mgr.on_timer_fired(gen + 1, t0, &mut sender, &mut cc), TimerEvent::Stale));
        assert!(sender.probes.is_empty());
        assert_eq!(mgr.pto_count(), 0);
    }

    #[test]
    fn ack_clears_in_flight_and_resets_pto_count() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        let outcome = mgr.on_ack_received(PnSpace::Initial, &[0..=0], ms(0), t0 + ms(50), &mut cc);
        assert_eq!(outcome.acked.len(), 1);
        assert!(outcome.lost.is_empty());
        assert_eq!(mgr.rtt().latest_rtt(), ms(50));
        // Nothing left in flight and the handshake isn't confirmed: the
        // timer re-arms for another anti-deadlock PTO rather than
        // disarming outright.
        assert!(mgr.armed.is_some());
    }

    #[test]
    fn ack_resets_pto_count_even_when_nothing_new_is_acked() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        let (deadline, gen) = mgr.armed.unwrap();
        let mut sender = RecordingSender { probes: Vec::new() };
        mgr.on_timer_fired(gen, deadline, &mut sender, &mut cc);
        assert_eq!(mgr.pto_count(), 1);
        // A duplicate ack for a packet number that was never sent acks
        // nothing new, but receiving any ACK at all still resets pto_count.
        mgr.on_ack_received(PnSpace::Initial, &[99..=99], ms(0), deadline, &mut cc);
        assert_eq!(mgr.pto_count(), 0);
    }

    #[test]
    fn packet_threshold_loss_detection() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        for pn in 0..4 {
            mgr.on_packet_sent(PnSpace::Initial, sent_ping(pn, t0 + ms(pn)), t0 + ms(pn), &mut cc);
        }
        // Acking packet 3 puts packet 0 three-or-more behind the default
        // packet_threshold of 3.
        let outcome = mgr.on_ack_received(PnSpace::Initial, &[3..=3], ms(0), t0 + ms(60), &mut cc);
        assert_eq!(outcome.lost.iter().map(|p| p.pn).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn loss_timer_fire_notifies_congestion_advisor() {
        // pn=0 is never acked and falls behind the time threshold; pn=1 is
        // acked immediately, which arms the per-space loss timer for pn=0
        // rather than disarming or falling back to a PTO arm.
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = RecordingCc::default();
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(1, t0), t0, &mut cc);
        mgr.on_ack_received(PnSpace::Initial, &[1..=1], ms(0), t0 + ms(10), &mut cc);

        let (deadline, gen) = mgr.armed.expect("loss timer must be armed for the still-unacked pn=0");
        let mut sender = RecordingSender { probes: Vec::new() };
        let event = mgr.on_timer_fired(gen, deadline, &mut sender, &mut cc);
        assert!(matches!(event, TimerEvent::Loss { ref lost, .. } if lost.len() == 1));
        assert_eq!(cc.lost, vec![1200]);
    }

    #[test]
    fn discarding_a_space_forgets_its_packets_without_loss_or_ack() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        let forgotten = mgr.discard_space(PnSpace::Initial, t0);
        assert_eq!(forgotten.len(), 1);
        assert_eq!(forgotten[0].pn, 0);
    }

    #[test]
    fn first_handshake_packet_discards_initial() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        assert!(mgr.detectors.get(PnSpace::Initial).has_ack_eliciting_in_flight());

        mgr.on_packet_sent(PnSpace::Handshake, sent_ping(0, t0 + ms(10)), t0 + ms(10), &mut cc);
        assert!(!mgr.is_active(PnSpace::Initial));
        assert!(!mgr.detectors.get(PnSpace::Initial).has_ack_eliciting_in_flight());

        // A second Handshake packet must not re-trigger the discard logic
        // (it's already inactive, so this is a no-op either way).
        mgr.on_packet_sent(PnSpace::Handshake, sent_ping(1, t0 + ms(20)), t0 + ms(20), &mut cc);
        assert!(!mgr.is_active(PnSpace::Initial));
    }

    #[test]
    fn pto_retransmits_earliest_unacked_initial_packet() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        let pkt = InFlightPacket::new(0, t0, 1200, vec![Frame::Other(())]);
        mgr.on_packet_sent(PnSpace::Initial, pkt, t0, &mut cc);
        let (deadline, gen) = mgr.armed.unwrap();

        let mut sender = RecordingSender { probes: Vec::new() };
        mgr.on_timer_fired(gen, deadline, &mut sender, &mut cc);
        assert_eq!(sender.probes.len(), 1);
        let (level, frames) = &sender.probes[0];
        assert_eq!(*level, EncryptionLevel::Initial);
        assert_eq!(*frames, vec![Frame::Other(())]);
    }

    #[test]
    fn pto_sends_ping_and_padding_when_nothing_to_retransmit() {
        // Nothing has ever been sent in Initial: probe_plan has no unacked
        // packet to fall back on and must synthesize [Ping, Padding(2)].
        let mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let (level, frames) = mgr.probe_plan();
        assert_eq!(level, EncryptionLevel::Initial);
        assert_eq!(frames, vec![Frame::Ping, Frame::Padding(PROBE_PADDING_BYTES)]);
    }

    #[test]
    fn handshake_probe_retransmits_only_non_trivial_frames() {
        // Once Handshake keys exist, a Ping-only unacked packet doesn't
        // count as something worth retransmitting: the probe still falls
        // back to [Ping, Padding(2)] even though a packet is in flight.
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.handshake_state_changed(HandshakeState::HasHandshakeKeys);
        mgr.on_packet_sent(PnSpace::Handshake, sent_ping(0, t0), t0, &mut cc);
        let (level, frames) = mgr.probe_plan();
        assert_eq!(level, EncryptionLevel::Handshake);
        assert_eq!(frames, vec![Frame::Ping, Frame::Padding(PROBE_PADDING_BYTES)]);
    }

    #[test]
    fn peer_awaiting_validation_keeps_timer_armed_with_nothing_in_flight() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        mgr.handshake_state_changed(HandshakeState::HasHandshakeKeys);
        let t0 = test_fixture::now();
        // Nothing has ever been sent: earliest_last_ack_eliciting_sent is
        // None, but peer_awaiting_validation is true, so the timer still
        // arms, anchored at `now`.
        let armed = mgr.set_loss_detection_timer(t0);
        let (deadline, _) = armed.expect("must arm while awaiting validation");
        assert_eq!(deadline, t0 + ms(2 * 333));
    }

    #[test]
    fn confirmed_handshake_with_nothing_in_flight_disarms() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        mgr.on_ack_received(PnSpace::Initial, &[0..=0], ms(0), t0 + ms(10), &mut cc);
        mgr.handshake_state_changed(HandshakeState::Confirmed);
        let armed = mgr.set_loss_detection_timer(t0 + ms(10));
        assert!(armed.is_none());
        assert!(mgr.armed.is_none());
    }

    #[test]
    fn stopped_recovery_ignores_further_events() {
        let mut mgr: RecoveryManager<()> = RecoveryManager::new(RecoveryConfig::default());
        let mut cc = AlwaysSend;
        let t0 = test_fixture::now();
        mgr.on_packet_sent(PnSpace::Initial, sent_ping(0, t0), t0, &mut cc);
        mgr.stop_recovery();
        assert!(mgr.armed.is_none());

        mgr.on_packet_sent(PnSpace::Initial, sent_ping(1, t0 + ms(5)), t0 + ms(5), &mut cc);
        assert!(mgr.armed.is_none());
        let outcome = mgr.on_ack_received(PnSpace::Initial, &[1..=1], ms(0), t0 + ms(10), &mut cc);
        assert!(outcome.acked.is_empty() && outcome.lost.is_empty());
    }
}
