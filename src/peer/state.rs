//! Perfect-negotiation role flags for one peer handle.
//!
//! The flags are owned by a single `Negotiator` and only ever touched from its
//! event loop. They are atomics so the scoped guards below can be held across
//! `.await` points inside a `Send` future; no second context writes them.

use crate::peer::types::{SdpType, SignalingState};
use std::sync::atomic::{AtomicBool, Ordering};

/// Reserved data-channel payload used only for the open handshake.
pub const HANDSHAKE_SENTINEL: &str = "__pairlink_channel_open__";

#[derive(Debug, Default)]
pub struct NegotiationState {
    polite: AtomicBool,
    making_offer: AtomicBool,
    setting_remote_answer_pending: AtomicBool,
    ignoring_offer: AtomicBool,
}

/// Verdict on an incoming description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionVerdict {
    Apply,
    /// Collision lost by the impolite side; drop without any state change
    Ignore,
}

impl NegotiationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_polite(&self) -> bool {
        self.polite.load(Ordering::Relaxed)
    }

    pub fn set_polite(&self, polite: bool) {
        self.polite.store(polite, Ordering::Relaxed);
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer.load(Ordering::Relaxed)
    }

    pub fn is_setting_remote_answer_pending(&self) -> bool {
        self.setting_remote_answer_pending.load(Ordering::Relaxed)
    }

    pub fn is_ignoring_offer(&self) -> bool {
        self.ignoring_offer.load(Ordering::Relaxed)
    }

    /// Raises `making_offer` for the lifetime of the returned guard.
    /// Returns `None` when an offer is already being built.
    pub fn begin_offer(&self) -> Option<MakingOffer<'_>> {
        self.making_offer
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .ok()
            .map(|_| MakingOffer(&self.making_offer))
    }

    /// Raises `setting_remote_answer_pending` for the lifetime of the guard.
    pub fn begin_remote_answer(&self) -> RemoteAnswerPending<'_> {
        self.setting_remote_answer_pending.store(true, Ordering::Relaxed);
        RemoteAnswerPending(&self.setting_remote_answer_pending)
    }

    /// Collision check for an incoming description. Updates `ignoring_offer`
    /// before returning; nothing else is mutated.
    pub fn evaluate_description(&self, kind: SdpType, signaling: SignalingState) -> DescriptionVerdict {
        let ready_for_offer = !self.is_making_offer()
            && (signaling == SignalingState::Stable || self.is_setting_remote_answer_pending());
        let offer_collision = kind == SdpType::Offer && !ready_for_offer;

        let ignore = !self.is_polite() && offer_collision;
        self.ignoring_offer.store(ignore, Ordering::Relaxed);

        if ignore {
            DescriptionVerdict::Ignore
        } else {
            DescriptionVerdict::Apply
        }
    }

    /// Back to a fresh, impolite peer.
    pub fn reset(&self) {
        self.polite.store(false, Ordering::Relaxed);
        self.making_offer.store(false, Ordering::Relaxed);
        self.setting_remote_answer_pending.store(false, Ordering::Relaxed);
        self.ignoring_offer.store(false, Ordering::Relaxed);
    }
}

/// Lowers `making_offer` on drop, whatever path the offer took.
#[derive(Debug)]
pub struct MakingOffer<'a>(&'a AtomicBool);

impl Drop for MakingOffer<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct RemoteAnswerPending<'a>(&'a AtomicBool);

impl Drop for RemoteAnswerPending<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_guard_is_exclusive_and_scoped() {
        let state = NegotiationState::new();
        assert!(!state.is_making_offer());
        {
            let guard = state.begin_offer();
            assert!(guard.is_some());
            assert!(state.is_making_offer());
            assert!(state.begin_offer().is_none());
        }
        assert!(!state.is_making_offer());
    }

    #[test]
    fn offer_guard_resets_on_error_path() {
        fn build(state: &NegotiationState) -> Result<(), &'static str> {
            let _offer = state.begin_offer().ok_or("busy")?;
            Err("description generation failed")
        }
        let state = NegotiationState::new();
        assert!(build(&state).is_err());
        assert!(!state.is_making_offer());
    }

    #[test]
    fn polite_side_accepts_colliding_offer() {
        let state = NegotiationState::new();
        state.set_polite(true);
        let _offer = state.begin_offer();
        let verdict = state.evaluate_description(SdpType::Offer, SignalingState::Stable);
        assert_eq!(verdict, DescriptionVerdict::Apply);
        assert!(!state.is_ignoring_offer());
    }

    #[test]
    fn impolite_side_ignores_colliding_offer() {
        let state = NegotiationState::new();
        let _offer = state.begin_offer();
        let verdict = state.evaluate_description(SdpType::Offer, SignalingState::Stable);
        assert_eq!(verdict, DescriptionVerdict::Ignore);
        assert!(state.is_ignoring_offer());
    }

    #[test]
    fn impolite_side_ignores_offer_with_local_offer_pending() {
        let state = NegotiationState::new();
        let verdict = state.evaluate_description(SdpType::Offer, SignalingState::HaveLocalOffer);
        assert_eq!(verdict, DescriptionVerdict::Ignore);
    }

    #[test]
    fn answer_in_flight_does_not_count_as_collision() {
        let state = NegotiationState::new();
        let _pending = state.begin_remote_answer();
        let verdict = state.evaluate_description(SdpType::Offer, SignalingState::HaveLocalOffer);
        assert_eq!(verdict, DescriptionVerdict::Apply);
    }

    #[test]
    fn answers_are_never_ignored() {
        let state = NegotiationState::new();
        let _offer = state.begin_offer();
        let verdict = state.evaluate_description(SdpType::Answer, SignalingState::HaveLocalOffer);
        assert_eq!(verdict, DescriptionVerdict::Apply);
    }

    #[test]
    fn ignoring_flag_clears_on_next_description() {
        let state = NegotiationState::new();
        state.evaluate_description(SdpType::Offer, SignalingState::HaveLocalOffer);
        assert!(state.is_ignoring_offer());
        state.evaluate_description(SdpType::Offer, SignalingState::Stable);
        assert!(!state.is_ignoring_offer());
    }

    #[test]
    fn reset_returns_to_impolite() {
        let state = NegotiationState::new();
        state.set_polite(true);
        state.evaluate_description(SdpType::Offer, SignalingState::Stable);
        state.reset();
        assert!(!state.is_polite());
        assert!(!state.is_ignoring_offer());
    }
}
