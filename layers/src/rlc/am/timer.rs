//! Millisecond timers and poll triggers
//! 
//! Timers are stepped explicitly once per millisecond by the owning
//! entity, which keeps them inside the entity lock and makes expiry
//! handling deterministic.

use std::fmt;

use super::pdu::POLL_PERIODICITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Stopped,
    Running { elapsed: u32 },
    Expired,
}

/// One-shot timer driven by `step`
#[derive(Debug, Clone)]
pub struct Timer {
    name: &'static str,
    duration: u32,
    state: TimerState,
}

impl Timer {
    /// A timer with duration 0 is disabled and never runs
    pub fn new(name: &'static str, duration_ms: u32) -> Self {
        Self {
            name,
            duration: duration_ms,
            state: TimerState::Stopped,
        }
    }
    
    /// Change the duration, stopping the timer
    pub fn set_duration(&mut self, duration_ms: u32) {
        self.duration = duration_ms;
        self.state = TimerState::Stopped;
    }
    
    pub fn is_configured(&self) -> bool {
        self.duration > 0
    }
    
    /// Start or restart the timer
    pub fn run(&mut self) {
        if self.is_configured() {
            self.state = TimerState::Running { elapsed: 0 };
        }
    }
    
    pub fn stop(&mut self) {
        self.state = TimerState::Stopped;
    }
    
    pub fn is_running(&self) -> bool {
        matches!(self.state, TimerState::Running { .. })
    }
    
    /// Expired and not restarted or stopped since
    pub fn is_expired(&self) -> bool {
        self.state == TimerState::Expired
    }
    
    pub fn elapsed(&self) -> u32 {
        match self.state {
            TimerState::Running { elapsed } => elapsed,
            TimerState::Expired => self.duration,
            TimerState::Stopped => 0,
        }
    }
    
    /// Advance by 1 ms, returning true on the step that expires the timer
    pub fn step(&mut self) -> bool {
        if let TimerState::Running { elapsed } = self.state {
            let elapsed = elapsed + 1;
            if elapsed >= self.duration {
                self.state = TimerState::Expired;
                return true;
            }
            self.state = TimerState::Running { elapsed };
        }
        false
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{} ms", self.name, self.elapsed(), self.duration)
    }
}

/// Reason a poll bit is set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCause {
    PduCount,
    ByteCount,
    PollRetxExpired,
    WindowFull,
    QueuesEmpty,
    Periodic,
}

/// Transmitter state the poll decision depends on
#[derive(Debug, Clone, Copy)]
pub struct PollContext {
    pub poll_retx_expired: bool,
    pub window_full: bool,
    pub queues_empty: bool,
    pub vt_s: u16,
}

/// PDU and byte counters since the last poll
#[derive(Debug, Clone, Default)]
pub struct PollTrigger {
    poll_pdu: i32,
    poll_byte: i32,
    pdu_without_poll: u32,
    byte_without_poll: u32,
}

impl PollTrigger {
    /// Negative thresholds disable the corresponding trigger
    pub fn new(poll_pdu: i32, poll_byte: i32) -> Self {
        Self {
            poll_pdu,
            poll_byte,
            ..Default::default()
        }
    }
    
    /// Account for one transmitted PDU of `bytes` bytes
    pub fn record(&mut self, bytes: usize) {
        self.pdu_without_poll = self.pdu_without_poll.saturating_add(1);
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);
        self.byte_without_poll = self.byte_without_poll.saturating_add(bytes);
    }
    
    pub fn reset(&mut self) {
        self.pdu_without_poll = 0;
        self.byte_without_poll = 0;
    }
    
    pub fn pdu_without_poll(&self) -> u32 {
        self.pdu_without_poll
    }
    
    pub fn byte_without_poll(&self) -> u32 {
        self.byte_without_poll
    }
    
    /// First matching poll condition, if any
    pub fn required(&self, ctx: PollContext) -> Option<PollCause> {
        if self.poll_pdu > 0 && self.pdu_without_poll > self.poll_pdu as u32 {
            return Some(PollCause::PduCount);
        }
        if self.poll_byte > 0 && self.byte_without_poll > self.poll_byte as u32 {
            return Some(PollCause::ByteCount);
        }
        if ctx.poll_retx_expired {
            return Some(PollCause::PollRetxExpired);
        }
        if ctx.window_full {
            return Some(PollCause::WindowFull);
        }
        if ctx.queues_empty {
            return Some(PollCause::QueuesEmpty);
        }
        if self.poll_pdu == 0 && self.poll_byte == 0 && ctx.vt_s % POLL_PERIODICITY == 0 {
            return Some(PollCause::Periodic);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    fn idle(vt_s: u16) -> PollContext {
        PollContext {
            poll_retx_expired: false,
            window_full: false,
            queues_empty: false,
            vt_s,
        }
    }
    
    #[test]
    fn test_timer_expiry() {
        let mut timer = Timer::new("t-Reordering", 3);
        assert!(!timer.step());
        
        timer.run();
        assert!(timer.is_running());
        assert!(!timer.step());
        assert!(!timer.step());
        assert_eq!(timer.elapsed(), 2);
        assert!(timer.step());
        assert!(timer.is_expired());
        assert!(!timer.is_running());
        assert!(!timer.step());
        
        timer.run();
        assert!(!timer.is_expired());
        timer.stop();
        assert!(!timer.is_running());
    }
    
    #[test]
    fn test_zero_duration_timer_never_runs() {
        let mut timer = Timer::new("t-StatusProhibit", 0);
        timer.run();
        assert!(!timer.is_running());
        assert!(!timer.step());
    }
    
    #[test]
    fn test_poll_pdu_and_byte_counters() {
        let mut trigger = PollTrigger::new(4, 25);
        for _ in 0..4 {
            trigger.record(3);
            assert_eq!(trigger.required(idle(1)), None);
        }
        trigger.record(3);
        assert_eq!(trigger.required(idle(1)), Some(PollCause::PduCount));
        
        trigger.reset();
        trigger.record(26);
        assert_eq!(trigger.required(idle(1)), Some(PollCause::ByteCount));
    }
    
    #[test]
    fn test_disabled_triggers() {
        let mut trigger = PollTrigger::new(-1, -1);
        for _ in 0..100 {
            trigger.record(1000);
        }
        assert_eq!(trigger.required(idle(8)), None);
        
        let ctx = PollContext { queues_empty: true, ..idle(3) };
        assert_eq!(trigger.required(ctx), Some(PollCause::QueuesEmpty));
    }
    
    #[test]
    fn test_counters_saturate() {
        let mut trigger = PollTrigger::new(-1, -1);
        trigger.pdu_without_poll = u32::MAX;
        trigger.byte_without_poll = u32::MAX - 1;
        trigger.record(10);
        assert_eq!(trigger.pdu_without_poll(), u32::MAX);
        assert_eq!(trigger.byte_without_poll(), u32::MAX);
        
        trigger.reset();
        trigger.record(usize::MAX);
        assert_eq!(trigger.byte_without_poll(), u32::MAX);
        assert_eq!(trigger.required(idle(1)), None);
    }
    
    #[test]
    fn test_periodic_poll() {
        let trigger = PollTrigger::new(0, 0);
        assert_eq!(trigger.required(idle(16)), Some(PollCause::Periodic));
        assert_eq!(trigger.required(idle(17)), None);
    }
}
