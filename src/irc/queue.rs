//! Outbound flood control.
//!
//! A token bucket per connection (size `floodBurst`, one token per
//! `floodIntervalMs`) paces every outbound command. Priorities drain
//! HIGH before NORMAL before LOW when tokens are scarce; PONG replies to
//! server PINGs are marked bypass and never wait for a token.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outbound priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// One queued raw line (no CRLF).
#[derive(Debug)]
pub struct OutboundCommand {
    pub line: String,
    pub priority: Priority,
    /// Skip the token bucket entirely (server-PING replies).
    pub bypass: bool,
    pub enqueued_at: Instant,
}

impl OutboundCommand {
    pub fn new(line: String, priority: Priority) -> OutboundCommand {
        OutboundCommand {
            line,
            priority,
            bypass: false,
            enqueued_at: Instant::now(),
        }
    }

    pub fn bypass(line: String) -> OutboundCommand {
        OutboundCommand {
            line,
            priority: Priority::High,
            bypass: true,
            enqueued_at: Instant::now(),
        }
    }
}

/// Classic token bucket; time is passed in so tests control the clock.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    tokens: u32,
    interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(burst: u32, interval: Duration, now: Instant) -> TokenBucket {
        TokenBucket {
            capacity: burst.max(1),
            tokens: burst.max(1),
            interval: interval.max(Duration::from_millis(1)),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.tokens >= self.capacity {
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = (elapsed.as_nanos() / self.interval.as_nanos()) as u32;
        if earned == 0 {
            return;
        }
        let added = earned.min(self.capacity - self.tokens);
        self.tokens += added;
        if self.tokens >= self.capacity {
            self.last_refill = now;
        } else {
            self.last_refill += self.interval * earned;
        }
    }

    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Time until the next token, `None` when one is available now.
    pub fn next_token_in(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens > 0 {
            return None;
        }
        let next = self.last_refill + self.interval;
        Some(next.saturating_duration_since(now))
    }
}

/// Priority-ordered outbound queue with the token bucket applied on pop.
#[derive(Debug)]
pub struct FloodQueue {
    high: VecDeque<OutboundCommand>,
    normal: VecDeque<OutboundCommand>,
    low: VecDeque<OutboundCommand>,
    bucket: TokenBucket,
}

impl FloodQueue {
    pub fn new(burst: u32, interval: Duration, now: Instant) -> FloodQueue {
        FloodQueue {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            bucket: TokenBucket::new(burst, interval, now),
        }
    }

    pub fn push(&mut self, cmd: OutboundCommand) {
        match cmd.priority {
            Priority::High => self.high.push_back(cmd),
            Priority::Normal => self.normal.push_back(cmd),
            Priority::Low => self.low.push_back(cmd),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    /// Pop the next command allowed to go on the wire right now.
    pub fn pop_ready(&mut self, now: Instant) -> Option<OutboundCommand> {
        // Bypass commands (PONG) jump the bucket but keep HIGH ordering.
        if self.high.front().is_some_and(|c| c.bypass) {
            return self.high.pop_front();
        }
        if self.is_empty() || !self.bucket.try_take(now) {
            return None;
        }
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// How long until `pop_ready` could yield, `None` when the queue is
    /// empty (wait for a push instead).
    pub fn next_ready_in(&mut self, now: Instant) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        if self.high.front().is_some_and(|c| c.bypass) {
            return Some(Duration::ZERO);
        }
        Some(self.bucket.next_token_in(now).unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(line: &str, priority: Priority) -> OutboundCommand {
        OutboundCommand::new(line.to_string(), priority)
    }

    #[test]
    fn burst_then_steady_rate() {
        let start = Instant::now();
        let mut queue = FloodQueue::new(5, Duration::from_secs(1), start);
        for i in 0..20 {
            queue.push(cmd(&format!("PRIVMSG #x :{}", i), Priority::Normal));
        }

        // Exactly 5 commands drain in the first instant.
        let mut drained = 0;
        while queue.pop_ready(start).is_some() {
            drained += 1;
        }
        assert_eq!(drained, 5);

        // Exactly one more per elapsed second.
        for second in 1..=5u64 {
            let now = start + Duration::from_secs(second);
            assert!(queue.pop_ready(now).is_some(), "second {}", second);
            assert!(queue.pop_ready(now).is_none(), "second {}", second);
        }
    }

    #[test]
    fn emission_bound_over_window() {
        // Across T seconds: at most burst + floor(T / interval) sends.
        let start = Instant::now();
        let mut queue = FloodQueue::new(3, Duration::from_millis(500), start);
        for i in 0..100 {
            queue.push(cmd(&format!("m{}", i), Priority::Normal));
        }
        let mut emitted = 0;
        let mut now = start;
        let step = Duration::from_millis(100);
        for _ in 0..100 {
            while queue.pop_ready(now).is_some() {
                emitted += 1;
            }
            now += step;
        }
        let window = now.duration_since(start);
        let bound = 3 + (window.as_millis() / 500) as u32;
        assert!(emitted <= bound, "{} > {}", emitted, bound);
    }

    #[test]
    fn priorities_drain_in_order() {
        let start = Instant::now();
        let mut queue = FloodQueue::new(3, Duration::from_secs(1), start);
        queue.push(cmd("low", Priority::Low));
        queue.push(cmd("normal", Priority::Normal));
        queue.push(cmd("high", Priority::High));
        assert_eq!(queue.pop_ready(start).unwrap().line, "high");
        assert_eq!(queue.pop_ready(start).unwrap().line, "normal");
        assert_eq!(queue.pop_ready(start).unwrap().line, "low");
    }

    #[test]
    fn pong_bypasses_exhausted_bucket() {
        let start = Instant::now();
        let mut queue = FloodQueue::new(1, Duration::from_secs(1), start);
        assert!(queue.bucket.try_take(start));

        queue.push(cmd("PRIVMSG #x :hi", Priority::Normal));
        queue.push(OutboundCommand::bypass("PONG :abc".to_string()));

        // Bucket is empty, but the PONG still goes.
        assert_eq!(queue.pop_ready(start).unwrap().line, "PONG :abc");
        assert!(queue.pop_ready(start).is_none());
    }

    #[test]
    fn next_ready_reports_refill_delay() {
        let start = Instant::now();
        let mut queue = FloodQueue::new(1, Duration::from_secs(1), start);
        assert!(queue.next_ready_in(start).is_none());

        queue.push(cmd("a", Priority::Normal));
        assert_eq!(queue.next_ready_in(start), Some(Duration::ZERO));
        queue.pop_ready(start).unwrap();

        queue.push(cmd("b", Priority::Normal));
        let wait = queue.next_ready_in(start).unwrap();
        assert!(wait > Duration::from_millis(900), "{:?}", wait);
    }

    #[test]
    fn idle_bucket_does_not_overfill() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, Duration::from_secs(1), start);
        let later = start + Duration::from_secs(60);
        assert!(bucket.try_take(later));
        assert!(bucket.try_take(later));
        assert!(!bucket.try_take(later));
    }
}
