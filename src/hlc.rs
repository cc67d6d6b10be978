// src/hlc.rs

//! Hybrid logical clock
//!
//! Timestamps combine physical milliseconds, a logical counter, and a node
//! id. The canonical string form is `"%019d:%09d:%s"` so that lexical
//! comparison of rendered timestamps equals semantic comparison; the format
//! is a compatibility boundary and must not change.

use crate::error::{Error, Result};
use chrono::Utc;
use std::fmt;
use std::str::FromStr;

/// A single hybrid logical timestamp
///
/// Field order matters: the derived ordering is (wall_ms, counter, node_id),
/// which matches lexical ordering of the canonical string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hlc {
    pub wall_ms: i64,
    pub counter: u32,
    pub node_id: String,
}

impl Hlc {
    pub fn new(wall_ms: i64, counter: u32, node_id: impl Into<String>) -> Self {
        Self {
            wall_ms,
            counter,
            node_id: node_id.into(),
        }
    }

    /// The zero timestamp, older than anything a clock emits
    pub fn zero() -> Self {
        Self::new(0, 0, "")
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:019}:{:09}:{}", self.wall_ms, self.counter, self.node_id)
    }
}

impl FromStr for Hlc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (ms, counter, node) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ms), Some(counter), Some(node)) => (ms, counter, node),
            _ => return Err(Error::invalid_data(format!("malformed hlc '{}'", s))),
        };

        let wall_ms: i64 = ms
            .parse()
            .map_err(|_| Error::invalid_data(format!("malformed hlc millis '{}'", ms)))?;
        let counter: u32 = counter
            .parse()
            .map_err(|_| Error::invalid_data(format!("malformed hlc counter '{}'", counter)))?;

        Ok(Hlc::new(wall_ms, counter, node))
    }
}

/// Clock state generating monotonically increasing timestamps for one node
#[derive(Debug)]
pub struct HlcClock {
    node_id: String,
    last_ms: i64,
    counter: u32,
}

impl HlcClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            last_ms: 0,
            counter: 0,
        }
    }

    /// Restore a clock from persisted state so restarts never regress
    pub fn restore(node_id: impl Into<String>, last_ms: i64, counter: u32) -> Self {
        Self {
            node_id: node_id.into(),
            last_ms,
            counter,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current clock state, for persistence
    pub fn state(&self) -> (i64, u32) {
        (self.last_ms, self.counter)
    }

    fn physical_now() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Emit the next local timestamp
    pub fn now(&mut self) -> Hlc {
        let physical = Self::physical_now();
        if physical > self.last_ms {
            self.last_ms = physical;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        Hlc::new(self.last_ms, self.counter, self.node_id.clone())
    }

    /// Advance the clock past a timestamp received from another node
    ///
    /// Returns the new local timestamp, which is greater than both the
    /// received timestamp and anything previously emitted here.
    pub fn update(&mut self, received: &Hlc) -> Hlc {
        let physical = Self::physical_now();
        let m = physical.max(self.last_ms).max(received.wall_ms);

        self.counter = if m == self.last_ms && m == received.wall_ms {
            self.counter.max(received.counter) + 1
        } else if m == self.last_ms {
            self.counter + 1
        } else if m == received.wall_ms {
            received.counter + 1
        } else {
            0
        };
        self.last_ms = m;

        Hlc::new(self.last_ms, self.counter, self.node_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let hlc = Hlc::new(1722500000000, 42, "node-a");
        let text = hlc.to_string();
        assert_eq!(text.parse::<Hlc>().unwrap(), hlc);
    }

    #[test]
    fn test_string_format_is_fixed_width() {
        let hlc = Hlc::new(5, 1, "n");
        assert_eq!(hlc.to_string(), "0000000000000000005:000000001:n");
    }

    #[test]
    fn test_lexical_order_matches_semantic_order() {
        let samples = vec![
            Hlc::new(1, 0, "a"),
            Hlc::new(1, 0, "b"),
            Hlc::new(1, 1, "a"),
            Hlc::new(2, 0, "a"),
            Hlc::new(10, 0, "a"),
            Hlc::new(1722500000000, 999, "z"),
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(
                    a.to_string() < b.to_string(),
                    a < b,
                    "lexical/semantic mismatch for {} vs {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_now_is_strictly_monotonic() {
        let mut clock = HlcClock::new("node");
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_update_exceeds_received() {
        let mut clock = HlcClock::new("local");
        // A remote timestamp far in the future
        let remote = Hlc::new(Utc::now().timestamp_millis() + 60_000, 7, "remote");
        let next = clock.update(&remote);
        assert!(next > remote);
        assert_eq!(next.wall_ms, remote.wall_ms);
        assert_eq!(next.counter, 8);

        // Local timestamps keep moving forward from there
        let after = clock.now();
        assert!(after > next);
    }

    #[test]
    fn test_update_with_stale_remote_keeps_local_lead() {
        let mut clock = HlcClock::restore("local", Utc::now().timestamp_millis() + 60_000, 5);
        let stale = Hlc::new(1000, 0, "remote");
        let next = clock.update(&stale);
        assert!(next > stale);
        assert_eq!(next.counter, 6);
    }

    #[test]
    fn test_restore_never_regresses() {
        let mut clock = HlcClock::restore("local", Utc::now().timestamp_millis() + 60_000, 3);
        let next = clock.now();
        assert!(next.wall_ms >= Utc::now().timestamp_millis());
        assert_eq!(next.counter, 4);
    }

    #[test]
    fn test_malformed_strings_rejected() {
        assert!("".parse::<Hlc>().is_err());
        assert!("123".parse::<Hlc>().is_err());
        assert!("abc:def:node".parse::<Hlc>().is_err());
    }
}
