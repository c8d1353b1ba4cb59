//! Timer-based event sources
//!
//! A [`Timer`] fires once, `duration` after it is started, and is stopped
//! again by the time its callback runs. A [`Ticker`] re-arms itself and keeps
//! firing every period until stopped. Durations carry microsecond
//! resolution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::source::{Kind, Source, TimerState};

fn duration_to_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// A one-shot timer
///
/// Starting a timer with a zero duration makes it fire exactly once on the
/// next dispatch pass.
pub struct Timer {
    pub(crate) src: Source,
}

impl Timer {
    /// Create a new timer firing `duration` after it is started.
    pub fn new<F>(duration: Duration, mut callback: F) -> Timer
    where
        F: FnMut(&Timer) + Send + 'static,
    {
        let state = TimerState {
            duration_us: AtomicU64::new(duration_to_us(duration)),
        };
        let src = Source::new_inner(
            Kind::Timer(state),
            Some(Box::new(move |src: &Source| {
                callback(&Timer { src: src.clone() })
            })),
        );
        Timer { src }
    }

    /// The configured duration.
    pub fn duration(&self) -> Duration {
        duration(&self.src)
    }

    /// Change the duration.
    ///
    /// Must not be called while the timer is started; the new value only
    /// applies to the next start.
    pub fn set_duration(&self, duration: Duration) {
        set_duration(&self.src, duration)
    }
}

super::typed_source!(Timer, Timer);

/// A periodic ticker
///
/// Fires every `period` once started, until stopped. A ticker that falls
/// behind fires once per missed period, with the deliveries coalesced into
/// the next dispatch pass.
pub struct Ticker {
    pub(crate) src: Source,
}

impl Ticker {
    /// Create a new ticker firing every `period` while started.
    ///
    /// A zero period is a caller bug and aborts at start.
    pub fn new<F>(period: Duration, mut callback: F) -> Ticker
    where
        F: FnMut(&Ticker) + Send + 'static,
    {
        let state = TimerState {
            duration_us: AtomicU64::new(duration_to_us(period)),
        };
        let src = Source::new_inner(
            Kind::Ticker(state),
            Some(Box::new(move |src: &Source| {
                callback(&Ticker { src: src.clone() })
            })),
        );
        Ticker { src }
    }

    /// The configured period.
    pub fn duration(&self) -> Duration {
        duration(&self.src)
    }

    /// Change the period.
    ///
    /// Must not be called while the ticker is started; the new value only
    /// applies to the next start.
    pub fn set_duration(&self, period: Duration) {
        set_duration(&self.src, period)
    }
}

super::typed_source!(Ticker, Ticker);

fn timer_state(src: &Source) -> &TimerState {
    match &src.inner.kind {
        Kind::Timer(state) | Kind::Ticker(state) => state,
        _ => unreachable!("timer handle must carry timer state"),
    }
}

fn duration(src: &Source) -> Duration {
    Duration::from_micros(timer_state(src).duration_us.load(Ordering::Acquire))
}

fn set_duration(src: &Source, duration: Duration) {
    timer_state(src)
        .duration_us
        .store(duration_to_us(duration), Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_survives_update() {
        let timer = Timer::new(Duration::from_micros(1500), |_| {});
        assert_eq!(timer.duration(), Duration::from_micros(1500));

        timer.set_duration(Duration::from_millis(2));
        assert_eq!(timer.duration(), Duration::from_millis(2));
    }

    #[test]
    fn sub_microsecond_truncates() {
        let ticker = Ticker::new(Duration::from_nanos(2500), |_| {});
        assert_eq!(ticker.duration(), Duration::from_micros(2));
    }
}
