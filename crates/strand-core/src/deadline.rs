//! Deadlines and the `grpc-timeout` wire grammar.
//!
//! A deadline is an absolute monotonic instant. It is never sent as-is: the
//! remaining duration is recomputed at send time and encoded as
//! `<digits><unit>` with unit one of `H M S m u n`. The receiver converts
//! back to an absolute deadline against its own clock.

use std::fmt;
use std::time::{Duration, Instant};

/// Maximum digits allowed in a `grpc-timeout` value.
const MAX_TIMEOUT_DIGITS: usize = 8;
const MAX_TIMEOUT_VALUE: u64 = 99_999_999;

/// An absolute point in monotonic time by which a call must complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Deadline {
            at: Instant::now()
                .checked_add(duration)
                .unwrap_or_else(far_future),
        }
    }

    /// A deadline at an explicit instant.
    pub fn at(instant: Instant) -> Self {
        Deadline { at: instant }
    }

    /// The deadline instant.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left until the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// The earlier of two deadlines. Used when a child context narrows.
    pub fn earliest(self, other: Deadline) -> Deadline {
        if self.at <= other.at { self } else { other }
    }

    /// A timer that completes when the deadline elapses.
    ///
    /// Handlers are expected to race long operations against this.
    pub fn timer(&self) -> tokio::time::Sleep {
        tokio::time::sleep_until(self.at.into())
    }

    /// Encode the *remaining* duration in the `grpc-timeout` grammar.
    ///
    /// Always derived at call time so a propagated deadline shrinks rather
    /// than forwarding a stale duration literal.
    pub fn to_timeout_header(&self) -> String {
        format_timeout(self.remaining())
    }
}

fn far_future() -> Instant {
    // ~30 years out; effectively "no deadline" without an Option.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// Errors from `grpc-timeout` parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    Empty,
    /// No trailing unit character.
    MissingUnit,
    /// Digits portion is empty or not decimal.
    InvalidDigits,
    /// More than eight digits.
    TooManyDigits,
    /// Unit character outside `H M S m u n`.
    UnknownUnit(char),
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutError::Empty => write!(f, "empty timeout value"),
            TimeoutError::MissingUnit => write!(f, "timeout value has no unit"),
            TimeoutError::InvalidDigits => write!(f, "timeout digits are not decimal"),
            TimeoutError::TooManyDigits => {
                write!(f, "timeout exceeds {} digits", MAX_TIMEOUT_DIGITS)
            }
            TimeoutError::UnknownUnit(c) => write!(f, "unknown timeout unit {:?}", c),
        }
    }
}

impl std::error::Error for TimeoutError {}

const UNITS: [(char, u64); 6] = [
    ('H', 3_600_000_000_000),
    ('M', 60_000_000_000),
    ('S', 1_000_000_000),
    ('m', 1_000_000),
    ('u', 1_000),
    ('n', 1),
];

/// Format a duration in the `grpc-timeout` grammar.
///
/// Picks the coarsest unit that represents the duration exactly within the
/// eight-digit budget; when no unit is exact, precision floors to the
/// finest unit whose value still fits.
pub fn format_timeout(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0n".to_string();
    }

    // Exact representation, coarsest unit first.
    for &(unit, factor) in UNITS.iter() {
        let factor = factor as u128;
        if nanos % factor == 0 {
            let value = nanos / factor;
            if value <= MAX_TIMEOUT_VALUE as u128 {
                return format!("{}{}", value, unit);
            }
        }
    }

    // Lossy fallback: floor to the finest unit whose value still fits.
    for &(unit, factor) in UNITS.iter().rev() {
        let value = nanos / factor as u128;
        if value <= MAX_TIMEOUT_VALUE as u128 {
            return format!("{}{}", value, unit);
        }
    }

    // Larger than 99_999_999 hours; clamp.
    format!("{}H", MAX_TIMEOUT_VALUE)
}

/// Parse a `grpc-timeout` value.
pub fn parse_timeout(text: &str) -> Result<Duration, TimeoutError> {
    if text.is_empty() {
        return Err(TimeoutError::Empty);
    }
    let (digits, unit) = text.split_at(text.len() - text.chars().last().map_or(0, char::len_utf8));
    let unit = unit.chars().next().ok_or(TimeoutError::MissingUnit)?;
    if digits.is_empty() {
        return Err(TimeoutError::InvalidDigits);
    }
    if digits.len() > MAX_TIMEOUT_DIGITS {
        return Err(TimeoutError::TooManyDigits);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimeoutError::InvalidDigits);
    }
    let value: u64 = digits.parse().map_err(|_| TimeoutError::InvalidDigits)?;

    let factor = UNITS
        .iter()
        .find(|(u, _)| *u == unit)
        .map(|(_, f)| *f)
        .ok_or(TimeoutError::UnknownUnit(unit))?;

    let total = value as u128 * factor as u128;
    let secs = (total / 1_000_000_000) as u64;
    let nanos = (total % 1_000_000_000) as u32;
    Ok(Duration::new(secs, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_picks_exact_unit() {
        assert_eq!(format_timeout(Duration::from_secs(3600)), "1H");
        assert_eq!(format_timeout(Duration::from_secs(90)), "90S");
        assert_eq!(format_timeout(Duration::from_millis(50)), "50m");
        assert_eq!(format_timeout(Duration::from_micros(7)), "7u");
        assert_eq!(format_timeout(Duration::from_nanos(13)), "13n");
        assert_eq!(format_timeout(Duration::ZERO), "0n");
    }

    #[test]
    fn format_floors_when_nanos_overflow_digits() {
        // 1 second + 1 nanosecond cannot be exact in 8 digits of ns.
        let d = Duration::new(1, 1);
        let formatted = format_timeout(d);
        let parsed = parse_timeout(&formatted).unwrap();
        assert!(parsed <= d);
        // Floored value is within one unit of the original.
        assert!(d - parsed < Duration::from_secs(1));
    }

    #[test]
    fn parse_all_units() {
        assert_eq!(parse_timeout("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_timeout("2M").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_timeout("3S").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_timeout("50m").unwrap(), Duration::from_millis(50));
        assert_eq!(parse_timeout("9u").unwrap(), Duration::from_micros(9));
        assert_eq!(parse_timeout("0n").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(parse_timeout(""), Err(TimeoutError::Empty));
        assert_eq!(parse_timeout("S"), Err(TimeoutError::InvalidDigits));
        assert_eq!(parse_timeout("12"), Err(TimeoutError::UnknownUnit('2')));
        assert_eq!(parse_timeout("5x"), Err(TimeoutError::UnknownUnit('x')));
        assert_eq!(parse_timeout("1.5S"), Err(TimeoutError::InvalidDigits));
        assert_eq!(
            parse_timeout("123456789S"),
            Err(TimeoutError::TooManyDigits)
        );
    }

    #[test]
    fn roundtrip_representable_durations() {
        for d in [
            Duration::ZERO,
            Duration::from_nanos(1),
            Duration::from_micros(250),
            Duration::from_millis(50),
            Duration::from_secs(7),
            Duration::from_secs(3600 * 24),
        ] {
            assert_eq!(parse_timeout(&format_timeout(d)).unwrap(), d);
        }
    }

    #[test]
    fn deadline_remaining_counts_down() {
        let d = Deadline::after(Duration::from_secs(10));
        let remaining = d.remaining();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
        assert!(!d.is_expired());
    }

    #[test]
    fn deadline_zero_expires_immediately() {
        let d = Deadline::after(Duration::ZERO);
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[test]
    fn earliest_narrows() {
        let near = Deadline::after(Duration::from_secs(1));
        let far = Deadline::after(Duration::from_secs(60));
        assert_eq!(near.earliest(far), near);
        assert_eq!(far.earliest(near), near);
    }
}
