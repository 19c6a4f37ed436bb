//! Timer and event-queue abstraction
//!
//! The stack never blocks. Every wait (receive windows, ACK timeout, duty
//! cycle backoff) is a one-shot timer; when it expires the platform posts
//! the [`TimerId`] back to the device, which handles it on the dispatcher
//! thread.

/// Milliseconds since an arbitrary epoch, wrapping
pub type TimerTime = u32;

/// One-shot timers used by the MAC
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerId {
    /// Delayed transmission after a duty cycle restriction
    TxDelayed,
    /// RX1 window opening
    Rx1Window,
    /// RX2 window opening
    Rx2Window,
    /// Confirmed uplink ACK timeout
    AckTimeout,
}

/// Platform timer service
pub trait Timer {
    /// Current time in milliseconds
    fn now(&self) -> TimerTime;

    /// Arm (or re-arm) a one-shot timer
    fn start(&mut self, id: TimerId, timeout_ms: u32);

    /// Disarm a timer. Returns false when it already fired and its
    /// expiry is still waiting in the event queue.
    fn stop(&mut self, id: TimerId) -> bool;

    /// True while the timer is armed
    fn is_running(&self, id: TimerId) -> bool;

    /// Milliseconds elapsed since `since`
    fn elapsed(&self, since: TimerTime) -> u32 {
        self.now().wrapping_sub(since)
    }
}
