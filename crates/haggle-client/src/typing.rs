use std::time::Duration;

use tokio::time::Instant;

/// The three states of the typing indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    /// Nothing tracked, or the field was cleared.
    Idle,
    /// `typing:true` has been tracked and the idle timer is armed.
    Typing,
    /// The idle timer elapsed mid-compose: `typing:false` is already
    /// tracked, but the field still holds text. The next input change
    /// re-tracks `typing:true`.
    CoolingDown,
}

/// Timer-driven debounce for the typing indicator.
///
/// `typing:true` is tracked at most once per idle→typing transition, never
/// per keystroke. The driver owns the actual timer; this type only decides
/// transitions, which keeps the debounce behavior independently testable.
#[derive(Debug)]
pub struct TypingTracker {
    state: TypingState,
    deadline: Option<Instant>,
    debounce: Duration,
}

impl TypingTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: TypingState::Idle,
            deadline: None,
            debounce,
        }
    }

    pub fn state(&self) -> TypingState {
        self.state
    }

    /// When the driver should call [`Self::deadline_elapsed`], if ever.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Feed a local input change. Returns the typing flag to track, if any.
    pub fn input_changed(&mut self, non_empty: bool, now: Instant) -> Option<bool> {
        if !non_empty {
            // Cleared: cancel the timer. Only an active Typing state has an
            // outstanding `typing:true` to retract.
            let retract = self.state == TypingState::Typing;
            self.state = TypingState::Idle;
            self.deadline = None;
            return retract.then_some(false);
        }

        match self.state {
            TypingState::Idle | TypingState::CoolingDown => {
                self.state = TypingState::Typing;
                self.deadline = Some(now + self.debounce);
                Some(true)
            }
            TypingState::Typing => {
                // Re-arm without re-tracking.
                self.deadline = Some(now + self.debounce);
                None
            }
        }
    }

    /// Feed timer expiry. Returns the typing flag to track, if any.
    pub fn deadline_elapsed(&mut self, now: Instant) -> Option<bool> {
        if self.state == TypingState::Typing && self.deadline.is_some_and(|d| d <= now) {
            self.state = TypingState::CoolingDown;
            self.deadline = None;
            Some(false)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(1200);

    #[tokio::test(start_paused = true)]
    async fn test_first_input_tracks_typing_once() {
        let mut tracker = TypingTracker::new(DEBOUNCE);
        let now = Instant::now();
        assert_eq!(tracker.input_changed(true, now), Some(true));
        assert_eq!(tracker.state(), TypingState::Typing);
        // Further keystrokes only re-arm the timer.
        assert_eq!(tracker.input_changed(true, now + Duration::from_millis(100)), None);
        assert_eq!(tracker.input_changed(true, now + Duration::from_millis(200)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_tracks_false_after_debounce() {
        let mut tracker = TypingTracker::new(DEBOUNCE);
        let now = Instant::now();
        tracker.input_changed(true, now);
        let deadline = tracker.deadline().unwrap();
        assert_eq!(deadline, now + DEBOUNCE);

        // Not yet elapsed.
        assert_eq!(tracker.deadline_elapsed(now + Duration::from_millis(1199)), None);
        assert_eq!(tracker.deadline_elapsed(deadline), Some(false));
        assert_eq!(tracker.state(), TypingState::CoolingDown);
        // Expiry is edge-triggered.
        assert_eq!(tracker.deadline_elapsed(deadline + DEBOUNCE), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_rearms_the_timer() {
        let mut tracker = TypingTracker::new(DEBOUNCE);
        let now = Instant::now();
        tracker.input_changed(true, now);
        tracker.input_changed(true, now + Duration::from_millis(1000));
        // The original deadline has passed, but the re-armed one has not.
        assert_eq!(tracker.deadline_elapsed(now + DEBOUNCE), None);
        assert_eq!(tracker.state(), TypingState::Typing);
        assert_eq!(
            tracker.deadline_elapsed(now + Duration::from_millis(1000) + DEBOUNCE),
            Some(false)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooling_down_retracks_on_further_input() {
        let mut tracker = TypingTracker::new(DEBOUNCE);
        let now = Instant::now();
        tracker.input_changed(true, now);
        tracker.deadline_elapsed(now + DEBOUNCE);
        assert_eq!(tracker.state(), TypingState::CoolingDown);
        // Composing resumes: a fresh idle→typing transition.
        assert_eq!(tracker.input_changed(true, now + DEBOUNCE * 2), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_input_tracks_false_immediately() {
        let mut tracker = TypingTracker::new(DEBOUNCE);
        let now = Instant::now();
        tracker.input_changed(true, now);
        assert_eq!(tracker.input_changed(false, now + Duration::from_millis(50)), Some(false));
        assert_eq!(tracker.state(), TypingState::Idle);
        assert!(tracker.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_while_cooling_down_stays_silent() {
        let mut tracker = TypingTracker::new(DEBOUNCE);
        let now = Instant::now();
        tracker.input_changed(true, now);
        tracker.deadline_elapsed(now + DEBOUNCE);
        // `typing:false` already tracked by the timer; no duplicate.
        assert_eq!(tracker.input_changed(false, now + DEBOUNCE * 2), None);
        assert_eq!(tracker.state(), TypingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_input_while_idle_is_a_no_op() {
        let mut tracker = TypingTracker::new(DEBOUNCE);
        assert_eq!(tracker.input_changed(false, Instant::now()), None);
        assert_eq!(tracker.state(), TypingState::Idle);
    }
}
