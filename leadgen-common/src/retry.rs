use std::time;

/// How long to wait before a given delivery attempt.
///
/// The default is a fixed `[0s, 5s, 15s]` ladder: attempt 1 runs
/// immediately, attempt 2 after 5s, attempt 3 after 15s. The exponential
/// variant computes `base * coefficient^(n-1)` with an optional cap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetrySchedule {
    Fixed(Vec<time::Duration>),
    Exponential {
        base: time::Duration,
        coefficient: u32,
        maximum: Option<time::Duration>,
    },
}

impl RetrySchedule {
    /// Delay to wait before running `attempt` (1-based). Attempts past the
    /// end of a fixed ladder reuse its last rung.
    pub fn delay_before(&self, attempt: u32) -> time::Duration {
        let attempt = attempt.max(1);
        match self {
            RetrySchedule::Fixed(delays) => {
                if delays.is_empty() {
                    return time::Duration::ZERO;
                }
                let index = ((attempt - 1) as usize).min(delays.len() - 1);
                delays[index]
            }
            RetrySchedule::Exponential {
                base,
                coefficient,
                maximum,
            } => {
                let candidate = *base * coefficient.saturating_pow(attempt - 1);
                match maximum {
                    Some(max) => std::cmp::min(candidate, *max),
                    None => candidate,
                }
            }
        }
    }

    /// Parse a comma-separated list of seconds, e.g. `"0,5,15"`.
    pub fn parse_fixed(value: &str) -> Result<Self, ParseRetryScheduleError> {
        let delays = value
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map(time::Duration::from_secs)
                    .map_err(|_| ParseRetryScheduleError(value.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if delays.is_empty() {
            return Err(ParseRetryScheduleError(value.to_owned()));
        }

        Ok(RetrySchedule::Fixed(delays))
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        RetrySchedule::Fixed(vec![
            time::Duration::ZERO,
            time::Duration::from_secs(5),
            time::Duration::from_secs(15),
        ])
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseRetryScheduleError(pub String);

impl std::fmt::Display for ParseRetryScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} is not a valid retry schedule", self.0)
    }
}

impl std::error::Error for ParseRetryScheduleError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_matches_delivery_ladder() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.delay_before(1), time::Duration::ZERO);
        assert_eq!(schedule.delay_before(2), time::Duration::from_secs(5));
        assert_eq!(schedule.delay_before(3), time::Duration::from_secs(15));
        // Past the ladder, the last rung repeats.
        assert_eq!(schedule.delay_before(4), time::Duration::from_secs(15));
    }

    #[test]
    fn exponential_schedule_grows_and_caps() {
        let schedule = RetrySchedule::Exponential {
            base: time::Duration::from_secs(5),
            coefficient: 3,
            maximum: Some(time::Duration::from_secs(60)),
        };
        assert_eq!(schedule.delay_before(1), time::Duration::from_secs(5));
        assert_eq!(schedule.delay_before(2), time::Duration::from_secs(15));
        assert_eq!(schedule.delay_before(3), time::Duration::from_secs(45));
        assert_eq!(schedule.delay_before(4), time::Duration::from_secs(60));
    }

    #[test]
    fn parse_fixed_accepts_seconds_list() {
        assert_eq!(
            RetrySchedule::parse_fixed("0,5,15"),
            Ok(RetrySchedule::default())
        );
        assert!(RetrySchedule::parse_fixed("0,five,15").is_err());
        assert!(RetrySchedule::parse_fixed("").is_err());
    }
}
