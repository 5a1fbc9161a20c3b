//! Usage-limit detection over free-form assistant output.
//!
//! Pure and infallible: any input yields a `UsageLimitSignal`, and anything
//! that cannot be read with confidence becomes `None` instead of a guess.
//!
//! Passes, first hit wins:
//! 1. 12-hour wall clock anywhere in the text (`3pm`, `11:30 a.m.`)
//! 2. 24-hour wall clock right after a deadline word (`resets at 15:00`)
//! 3. explicit relative wait (`try again in 20 minutes`)
//! 4. limit phrases without a time → default cooldown

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone};
use regex::Regex;

static MERIDIEM_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9]{1,2})(?::([0-5][0-9]))?\s?([ap])\.?m\b\.?").unwrap()
});

static DEADLINE_24H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:until|till|at|resets?|after)\s+([0-9]{1,2}):([0-5][0-9])\b").unwrap()
});

static RELATIVE_WAIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:try again|retry|resets?|available again|wait)\s+(?:in|after|for)\s+([0-9]{1,6})\s*(seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h)\b",
    )
    .unwrap()
});

static LIMIT_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:rate[\s_-]?limit|usage[\s_-]?limit|(?:5|five)[\s-]hour limit|limit reached|quota (?:exceeded|exhausted)|exceeded (?:your|the) quota|too many requests|temporarily unavailable|try again later|overloaded|blocked until|out of (?:credits|usage))",
    )
    .unwrap()
});

/// AM/PM marker as written in the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meridiem {
    Am,
    Pm,
}

/// A time of day taken from a message, already converted to 24-hour form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub hour: u32,
    pub minute: u32,
    /// `None` when the message used 24-hour notation.
    pub meridiem: Option<Meridiem>,
}

impl WallClock {
    /// Convert a 12-hour reading. `None` for impossible values.
    pub fn from_meridiem(hour: u32, minute: u32, meridiem: Meridiem) -> Option<Self> {
        if !(1..=12).contains(&hour) || minute > 59 {
            return None;
        }
        let hour = match (meridiem, hour) {
            (Meridiem::Am, 12) => 0,
            (Meridiem::Am, h) => h,
            (Meridiem::Pm, 12) => 12,
            (Meridiem::Pm, h) => h + 12,
        };
        Some(Self {
            hour,
            minute,
            meridiem: Some(meridiem),
        })
    }

    /// 24-hour reading. `None` for impossible values.
    pub fn from_24h(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            hour,
            minute,
            meridiem: None,
        })
    }

    /// First moment strictly after `now` showing this time of day in `now`'s
    /// timezone. A time already passed today resolves to tomorrow.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = now.timezone();
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN);
        let mut date = now.date_naive();

        // Two iterations cover "later today" and "tomorrow"; a third only
        // matters when a DST gap swallows the requested time.
        for _ in 0..3 {
            let naive = date.and_time(time);
            let resolved = tz
                .from_local_datetime(&naive)
                .earliest()
                .or_else(|| {
                    tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                        .earliest()
                });
            if let Some(candidate) = resolved {
                if candidate > *now {
                    return candidate;
                }
            }
            date = date.succ_opt().unwrap_or(date);
        }
        now.clone() + chrono::Duration::hours(24)
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// What a piece of output says about the usage limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLimitSignal {
    /// No limit detected (also the answer when unsure).
    None,
    /// Blocked for a number of seconds from now.
    RelativeWait { seconds: u64 },
    /// Blocked until a time of day.
    AbsoluteTime(WallClock),
}

impl UsageLimitSignal {
    pub fn is_limited(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Absolute resume timestamp relative to `now`, if limited.
    pub fn resume_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Self::None => None,
            Self::RelativeWait { seconds } => {
                let secs = i64::try_from(*seconds).unwrap_or(i64::MAX / 1000);
                Some(now.clone() + chrono::Duration::seconds(secs))
            }
            Self::AbsoluteTime(wall) => Some(wall.next_after(now)),
        }
    }
}

impl fmt::Display for UsageLimitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::RelativeWait { seconds } => write!(f, "relative_wait({seconds}s)"),
            Self::AbsoluteTime(wall) => write!(f, "absolute_time({wall})"),
        }
    }
}

/// Detector configured with the fallback cooldown.
#[derive(Debug, Clone)]
pub struct UsageLimitDetector {
    default_cooldown: Duration,
    tail_lines: Option<usize>,
}

impl UsageLimitDetector {
    pub fn new(default_cooldown: Duration) -> Self {
        Self {
            default_cooldown,
            tail_lines: None,
        }
    }

    /// Only inspect the last `lines` lines of the text.
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = Some(lines);
        self
    }

    /// Classify `text`.
    pub fn detect(&self, text: &str) -> UsageLimitSignal {
        let text = match self.tail_lines {
            Some(n) => tail(text, n),
            None => text,
        };

        if let Some(wall) = find_meridiem_time(text) {
            return UsageLimitSignal::AbsoluteTime(wall);
        }
        if let Some(wall) = find_24h_deadline(text) {
            return UsageLimitSignal::AbsoluteTime(wall);
        }
        if let Some(seconds) = find_relative_wait(text) {
            return UsageLimitSignal::RelativeWait { seconds };
        }
        if LIMIT_PHRASE.is_match(text) {
            return UsageLimitSignal::RelativeWait {
                seconds: self.default_cooldown.as_secs(),
            };
        }
        UsageLimitSignal::None
    }
}

fn tail(text: &str, lines: usize) -> &str {
    if lines == 0 {
        return "";
    }
    match text.rmatch_indices('\n').nth(lines - 1) {
        Some((idx, _)) => &text[idx + 1..],
        None => text,
    }
}

fn find_meridiem_time(text: &str) -> Option<WallClock> {
    MERIDIEM_TIME.captures_iter(text).find_map(|caps| {
        let hour = caps.get(1)?.as_str().parse().ok()?;
        let minute = match caps.get(2) {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        let meridiem = match caps.get(3)?.as_str() {
            "a" | "A" => Meridiem::Am,
            _ => Meridiem::Pm,
        };
        WallClock::from_meridiem(hour, minute, meridiem)
    })
}

fn find_24h_deadline(text: &str) -> Option<WallClock> {
    DEADLINE_24H.captures_iter(text).find_map(|caps| {
        let hour = caps.get(1)?.as_str().parse().ok()?;
        let minute = caps.get(2)?.as_str().parse().ok()?;
        WallClock::from_24h(hour, minute)
    })
}

fn find_relative_wait(text: &str) -> Option<u64> {
    let caps = RELATIVE_WAIT.captures(text)?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let scale = match unit.chars().next()? {
        's' => 1,
        'm' => 60,
        _ => 3600,
    };
    Some(amount.saturating_mul(scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    const COOLDOWN: Duration = Duration::from_secs(1800);

    fn detector() -> UsageLimitDetector {
        UsageLimitDetector::new(COOLDOWN)
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn absolute_time_later_today() {
        let signal = detector().detect("You are blocked until 3:00pm");
        assert_eq!(
            signal,
            UsageLimitSignal::AbsoluteTime(WallClock {
                hour: 15,
                minute: 0,
                meridiem: Some(Meridiem::Pm)
            })
        );
        let resume = signal.resume_at(&at(10, 13, 0)).unwrap();
        assert_eq!(resume, at(10, 15, 0));
    }

    #[test]
    fn absolute_time_already_passed_rolls_to_tomorrow() {
        let signal = detector().detect("blocked until 3:00pm");
        let resume = signal.resume_at(&at(10, 16, 0)).unwrap();
        assert_eq!(resume, at(11, 15, 0));
    }

    #[test]
    fn exact_stated_time_is_not_now() {
        let signal = detector().detect("limit resets 3pm");
        let resume = signal.resume_at(&at(10, 15, 0)).unwrap();
        assert_eq!(resume, at(11, 15, 0));
    }

    #[test]
    fn resume_respects_timezone_of_now() {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2025, 3, 10, 23, 30, 0).unwrap();
        let signal = detector().detect("Your limit will reset at 1am (America/New_York)");
        let resume = signal.resume_at(&now).unwrap();
        assert_eq!(resume, tz.with_ymd_and_hms(2025, 3, 11, 1, 0, 0).unwrap());
    }

    #[test]
    fn twelve_oclock_edge_cases() {
        assert_eq!(WallClock::from_meridiem(12, 0, Meridiem::Am).unwrap().hour, 0);
        assert_eq!(WallClock::from_meridiem(12, 30, Meridiem::Pm).unwrap().hour, 12);
        assert!(WallClock::from_meridiem(13, 0, Meridiem::Pm).is_none());
        assert!(WallClock::from_meridiem(0, 0, Meridiem::Am).is_none());
    }

    #[test]
    fn first_time_token_wins() {
        let signal = detector().detect("usage limit: resets 4am, or upgrade before 9pm");
        match signal {
            UsageLimitSignal::AbsoluteTime(wall) => assert_eq!(wall.hour, 4),
            other => panic!("expected absolute time, got {other:?}"),
        }
    }

    #[test]
    fn invalid_time_token_is_skipped() {
        let signal = detector().detect("at 27pm something happened, then blocked until 5 p.m.");
        match signal {
            UsageLimitSignal::AbsoluteTime(wall) => assert_eq!(wall.hour, 17),
            other => panic!("expected absolute time, got {other:?}"),
        }
    }

    #[test]
    fn twenty_four_hour_deadline() {
        let signal = detector().detect("Usage limit reached. Resets at 18:45.");
        assert_eq!(
            signal,
            UsageLimitSignal::AbsoluteTime(WallClock {
                hour: 18,
                minute: 45,
                meridiem: None
            })
        );
    }

    #[test]
    fn explicit_relative_wait() {
        let signal = detector().detect("Too many requests. Please try again in 20 minutes.");
        assert_eq!(signal, UsageLimitSignal::RelativeWait { seconds: 1200 });
    }

    #[test]
    fn keyword_fallback_uses_default_cooldown() {
        let signal = detector().detect("rate limit exceeded, please retry");
        assert_eq!(
            signal,
            UsageLimitSignal::RelativeWait {
                seconds: COOLDOWN.as_secs()
            }
        );
    }

    #[test]
    fn keyword_synonyms() {
        for text in [
            "Error: 429 Too Many Requests",
            "Claude usage limit reached.",
            "Service temporarily unavailable",
            "quota exceeded for this organization",
            "Something went wrong, try again later",
            "5-hour limit reached",
        ] {
            assert!(detector().detect(text).is_limited(), "{text}");
        }
    }

    #[test]
    fn ordinary_output_is_none() {
        let text = "I updated src/lib.rs and all 42 tests pass.\nTASK COMPLETE custom-1";
        assert_eq!(detector().detect(text), UsageLimitSignal::None);
        assert_eq!(detector().detect(""), UsageLimitSignal::None);
    }

    #[test]
    fn malformed_input_never_panics() {
        let inputs = [
            "99:99pm",
            "::pm",
            "12:",
            "\u{0663}pm",
            "retry in 99999999999999999999 s",
            "\0\0",
        ];
        for text in inputs {
            let _ = detector().detect(text);
        }
    }

    #[test]
    fn tail_window_ignores_old_messages() {
        let text = "usage limit reached, resets 3pm\nline\nline\nall good now";
        let signal = detector().with_tail_lines(2).detect(text);
        assert_eq!(signal, UsageLimitSignal::None);
        assert!(detector().with_tail_lines(10).detect(text).is_limited());
    }

    #[test]
    fn relative_resume_is_now_plus_seconds() {
        let signal = UsageLimitSignal::RelativeWait { seconds: 90 };
        let now = at(10, 12, 0);
        assert_eq!(signal.resume_at(&now).unwrap(), now + chrono::Duration::seconds(90));
        assert!(UsageLimitSignal::None.resume_at(&now).is_none());
    }
}
