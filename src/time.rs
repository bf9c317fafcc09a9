//! Clock glue. The session works in plain milliseconds since an arbitrary
//! epoch; anything implementing [`embedded_time::Clock`] can feed it.

use embedded_time::{Clock, duration::Milliseconds};

/// Milliseconds elapsed since the clock's epoch.
pub fn now_ms<C>(clock: &C) -> Result<u64, crate::Error>
where
    C: Clock,
    C::T: Into<u64>,
{
    let instant = clock.try_now().map_err(|_| crate::Error::TimeError)?;
    let elapsed = Milliseconds::<C::T>::try_from(instant.duration_since_epoch())
        .map_err(|_| crate::Error::TimeError)?;

    Ok(elapsed.0.into())
}

/// [`Clock`] backed by the embassy time driver, counting from creation.
#[cfg(feature = "embassy")]
pub struct EmbassyClock {
    start: embassy_time::Instant,
}

#[cfg(feature = "embassy")]
impl Default for EmbassyClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "embassy")]
impl EmbassyClock {
    pub fn new() -> Self {
        Self {
            start: embassy_time::Instant::now(),
        }
    }
}

#[cfg(feature = "embassy")]
impl Clock for EmbassyClock {
    type T = u64;

    const SCALING_FACTOR: embedded_time::rate::Fraction =
        embedded_time::rate::Fraction::new(1, 1_000_000);

    fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
        let elapsed = embassy_time::Instant::now().duration_since(self.start);

        Ok(embedded_time::Instant::new(elapsed.as_micros()))
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use embedded_time::{Instant, rate::Fraction};

    use super::*;

    struct MicrosClock(Cell<u64>);

    impl Clock for MicrosClock {
        type T = u64;

        const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000_000);

        fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
            Ok(Instant::new(self.0.get()))
        }
    }

    #[test]
    fn converts_to_milliseconds() {
        let clock = MicrosClock(Cell::new(2_500_999));
        assert_eq!(now_ms(&clock), Ok(2_500));

        clock.0.set(0);
        assert_eq!(now_ms(&clock), Ok(0));
    }
}
