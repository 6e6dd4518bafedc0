//! XEP-0198 stream management ledger.
//!
//! Both counters live in u32 space mod 2^32 and are compared the RFC 1982
//! way: an ack within half the space ahead of what we believe is valid,
//! anything else is the peer misbehaving. The unacknowledged queue holds
//! every counted outbound stanza until the peer's `<a/>` covers it, and is
//! what gets replayed after `<resumed/>`.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};

use minidom::Element;

/// The peer's ack counter contradicts what we sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmError {
    /// `h` moved backwards; stanzas cannot be un-acked.
    AckWentBackwards {
        /// Counter the peer sent
        h: u32,
        /// Counter value we had confirmed before
        base: u32,
    },
    /// `h` covers more stanzas than we ever sent.
    AckedMoreThanSent {
        /// Counter the peer sent
        h: u32,
        /// Number of stanzas we actually sent
        sent: u32,
    },
}

impl fmt::Display for SmError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmError::AckWentBackwards { h, base } => {
                write!(fmt, "peer acked h={} after already acking {}", h, base)
            }
            SmError::AckedMoreThanSent { h, sent } => {
                write!(fmt, "peer acked h={} but only {} stanzas were sent", h, sent)
            }
        }
    }
}

impl StdError for SmError {}

/// Stream management knobs.
#[derive(Debug, Clone)]
pub struct SmConfig {
    /// Negotiate `resume='true'` so the session survives transport loss.
    pub request_resumption: bool,
    /// Send `<r/>` after this many outbound stanzas.
    pub ack_request_interval: u32,
}

impl Default for SmConfig {
    fn default() -> SmConfig {
        SmConfig {
            request_resumption: true,
            ack_request_interval: 5,
        }
    }
}

/// Token needed to resume the session later.
#[derive(Debug, Clone)]
pub struct ResumeInfo {
    /// Value for the `previd` attribute of `<resume/>`.
    pub id: String,
    /// Server-advertised maximum pause, if any.
    pub max_age: Option<Duration>,
}

/// Counter and queue state of one stream-management session.
///
/// Not a synchronization primitive itself; the client keeps it behind a
/// mutex since both the reader and the writer side touch it.
#[derive(Debug, Default)]
pub struct SmState {
    enabled: bool,
    /// Outbound count confirmed by the peer.
    outbound_base: u32,
    /// Stanzas we received and counted.
    inbound_ctr: u32,
    /// Sent but not yet covered by an ack, oldest first.
    unacked: VecDeque<Element>,
    since_ack_request: u32,
    resumption: Option<ResumeInfo>,
    disconnected_at: Option<Instant>,
}

impl SmState {
    pub fn new() -> SmState {
        SmState::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `<enabled/>` arrived; counting starts at zero.
    pub fn on_enabled(&mut self, id: Option<String>, resume: bool, max_secs: Option<u64>) {
        self.enabled = true;
        self.outbound_base = 0;
        self.inbound_ctr = 0;
        self.unacked.clear();
        self.since_ack_request = 0;
        self.resumption = if resume {
            id.map(|id| ResumeInfo {
                id,
                max_age: max_secs.map(Duration::from_secs),
            })
        } else {
            None
        };
        self.disconnected_at = None;
    }

    /// Records a counted outbound stanza.
    pub fn on_sent(&mut self, stanza: Element) {
        if !self.enabled {
            return;
        }
        self.unacked.push_back(stanza);
        self.since_ack_request += 1;
    }

    /// True once enough stanzas went out that an `<r/>` is warranted.
    /// Resets the interval counter when it fires.
    pub fn ack_due(&mut self, interval: u32) -> bool {
        if !self.enabled || interval == 0 {
            return false;
        }
        if self.since_ack_request >= interval {
            self.since_ack_request = 0;
            true
        } else {
            false
        }
    }

    /// Total outbound count, mod 2^32.
    pub fn outbound_count(&self) -> u32 {
        self.outbound_base.wrapping_add(self.unacked.len() as u32)
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Applies the peer's `<a h='…'/>`, dropping everything it covers.
    pub fn remote_acked(&mut self, h: u32) -> Result<(), SmError> {
        let to_drop = h.wrapping_sub(self.outbound_base);
        if to_drop as usize > self.unacked.len() {
            if to_drop > u32::MAX / 2 {
                // RFC 1982: more than half the space "ahead" means the
                // counter actually went backwards.
                return Err(SmError::AckWentBackwards {
                    h,
                    base: self.outbound_base,
                });
            }
            return Err(SmError::AckedMoreThanSent {
                h,
                sent: self.outbound_count(),
            });
        }
        for _ in 0..to_drop {
            self.unacked.pop_front();
        }
        self.outbound_base = h;
        Ok(())
    }

    /// Counts one received stanza.
    pub fn inbound_incr(&mut self) {
        if self.enabled {
            self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
        }
    }

    /// Value to put into our `<a/>` and `<resume/>`.
    pub fn inbound_h(&self) -> u32 {
        self.inbound_ctr
    }

    pub fn resume_info(&self) -> Option<&ResumeInfo> {
        self.resumption.as_ref()
    }

    /// Transport died; starts the resumption clock.
    pub fn on_disconnect(&mut self) {
        if self.disconnected_at.is_none() {
            self.disconnected_at = Some(Instant::now());
        }
    }

    /// Whether a `<resume/>` attempt is still worth making.
    pub fn can_resume(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(info) = &self.resumption else {
            return false;
        };
        match (info.max_age, self.disconnected_at) {
            (Some(max_age), Some(at)) => at.elapsed() <= max_age,
            _ => true,
        }
    }

    /// `<resumed h='…'/>` arrived: applies the ack and hands back what the
    /// server never saw, in original send order, for retransmission
    /// through the normal send path (which re-enqueues them).
    pub fn on_resumed(&mut self, h: u32) -> Result<Vec<Element>, SmError> {
        self.remote_acked(h)?;
        self.disconnected_at = None;
        Ok(self.unacked.drain(..).collect())
    }

    /// Resumption failed or was abandoned: the session is gone, and these
    /// stanzas were never delivered. The caller must surface them; they
    /// are not silently droppable.
    pub fn take_lost(&mut self) -> Vec<Element> {
        self.enabled = false;
        self.resumption = None;
        self.disconnected_at = None;
        self.since_ack_request = 0;
        self.unacked.drain(..).collect()
    }

    #[cfg(test)]
    fn force_counters(&mut self, outbound_base: u32, inbound: u32) {
        self.outbound_base = outbound_base;
        self.inbound_ctr = inbound;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(id: &str) -> Element {
        format!("<message xmlns='jabber:client' id='{id}'/>")
            .parse()
            .unwrap()
    }

    fn enabled_state() -> SmState {
        let mut state = SmState::new();
        state.on_enabled(Some("tok".to_owned()), true, Some(300));
        state
    }

    #[test]
    fn acks_drop_covered_stanzas() {
        let mut state = enabled_state();
        state.on_sent(stanza("1"));
        state.on_sent(stanza("2"));
        state.on_sent(stanza("3"));
        assert_eq!(state.outbound_count(), 3);

        state.remote_acked(2).unwrap();
        assert_eq!(state.unacked_len(), 1);
        assert_eq!(state.outbound_count(), 3);

        // Re-acking the same value is a no-op, not an error.
        state.remote_acked(2).unwrap();
        assert_eq!(state.unacked_len(), 1);
    }

    #[test]
    fn ack_going_backwards_is_detected() {
        let mut state = enabled_state();
        state.on_sent(stanza("1"));
        state.on_sent(stanza("2"));
        state.remote_acked(2).unwrap();
        assert_eq!(
            state.remote_acked(1),
            Err(SmError::AckWentBackwards { h: 1, base: 2 })
        );
    }

    #[test]
    fn acking_more_than_sent_is_detected() {
        let mut state = enabled_state();
        state.on_sent(stanza("1"));
        assert_eq!(
            state.remote_acked(5),
            Err(SmError::AckedMoreThanSent { h: 5, sent: 1 })
        );
    }

    #[test]
    fn counters_wrap_around() {
        let mut state = enabled_state();
        state.force_counters(u32::MAX - 1, u32::MAX);
        state.on_sent(stanza("1"));
        state.on_sent(stanza("2"));
        state.on_sent(stanza("3"));
        assert_eq!(state.outbound_count(), 1); // wrapped past u32::MAX

        // Ack across the wrap boundary.
        state.remote_acked(0).unwrap();
        assert_eq!(state.unacked_len(), 1);
        state.remote_acked(1).unwrap();
        assert_eq!(state.unacked_len(), 0);

        // Backwards across the boundary is still backwards.
        assert!(matches!(
            state.remote_acked(u32::MAX),
            Err(SmError::AckWentBackwards { .. })
        ));

        state.inbound_incr();
        assert_eq!(state.inbound_h(), 0);
    }

    #[test]
    fn resume_replays_in_original_order() {
        let mut state = enabled_state();
        for id in ["a", "b", "c", "d"] {
            state.on_sent(stanza(id));
        }
        state.on_disconnect();
        assert!(state.can_resume());

        let replay = state.on_resumed(1).unwrap();
        let ids: Vec<_> = replay
            .iter()
            .map(|el| el.attr("id").unwrap().to_owned())
            .collect();
        assert_eq!(ids, ["b", "c", "d"]);
        assert_eq!(state.unacked_len(), 0);
    }

    #[test]
    fn lost_stanzas_are_surfaced_not_dropped() {
        let mut state = enabled_state();
        state.on_sent(stanza("x"));
        state.on_sent(stanza("y"));
        let lost = state.take_lost();
        assert_eq!(lost.len(), 2);
        assert!(!state.is_enabled());
        assert!(!state.can_resume());
    }

    #[test]
    fn resumption_window_expires() {
        let mut state = SmState::new();
        state.on_enabled(Some("tok".to_owned()), true, Some(0));
        state.on_disconnect();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!state.can_resume());
    }

    #[test]
    fn no_resume_token_without_resume_attribute() {
        let mut state = SmState::new();
        state.on_enabled(Some("tok".to_owned()), false, None);
        assert!(state.is_enabled());
        assert!(state.resume_info().is_none());
        assert!(!state.can_resume());
    }

    #[test]
    fn ack_requests_fire_on_the_interval() {
        let mut state = enabled_state();
        for _ in 0..4 {
            state.on_sent(stanza("s"));
            assert!(!state.ack_due(5));
        }
        state.on_sent(stanza("s"));
        assert!(state.ack_due(5));
        // Interval restarts after firing.
        state.on_sent(stanza("s"));
        assert!(!state.ack_due(5));
    }

    #[test]
    fn disabled_state_counts_nothing() {
        let mut state = SmState::new();
        state.on_sent(stanza("1"));
        state.inbound_incr();
        assert_eq!(state.outbound_count(), 0);
        assert_eq!(state.inbound_h(), 0);
        assert!(!state.ack_due(1));
    }
}
