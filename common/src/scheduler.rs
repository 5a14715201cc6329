use crate::{clock::elapsed, sensor::SensorReader, types::Reading};

/// Fires a sensor read at most once per interval, driven by the caller's
/// monotonic timestamps.
#[derive(Debug, Clone)]
pub struct MeasurementScheduler {
    interval_ms: u32,
    last_fired_ms: u32,
}

impl MeasurementScheduler {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            last_fired_ms: 0,
        }
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn last_fired_ms(&self) -> u32 {
        self.last_fired_ms
    }

    pub fn is_due(&self, now_ms: u32) -> bool {
        elapsed(now_ms, self.last_fired_ms) > self.interval_ms
    }

    pub fn tick<S>(&mut self, now_ms: u32, sensor: &mut S) -> Option<Reading>
    where
        S: SensorReader + ?Sized,
    {
        if !self.is_due(now_ms) {
            return None;
        }

        let reading = sensor.read();
        self.last_fired_ms = now_ms;
        Some(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedSensor;

    #[test]
    fn fires_once_per_interval() {
        let mut scheduler = MeasurementScheduler::new(30_000);
        let mut sensor = FixedSensor::new(21.5, Some(40.0));

        assert!(scheduler.tick(30_000, &mut sensor).is_none());
        assert!(scheduler.tick(30_001, &mut sensor).is_some());
        assert!(scheduler.tick(45_000, &mut sensor).is_none());
        assert!(scheduler.tick(60_001, &mut sensor).is_none());
        assert!(scheduler.tick(60_002, &mut sensor).is_some());

        assert_eq!(sensor.reads(), 2);
        assert_eq!(scheduler.last_fired_ms(), 60_002);
    }

    #[test]
    fn fires_once_per_interval_across_counter_overflow() {
        let interval = 5_000;
        let mut scheduler = MeasurementScheduler::new(interval);
        let mut sensor = FixedSensor::new(19.0, None);

        let start = u32::MAX - 12_000;
        assert!(scheduler.tick(start, &mut sensor).is_some());

        let mut fired = 0;
        let mut now = start;
        for _ in 0..30_000 {
            now = now.wrapping_add(1);
            if scheduler.tick(now, &mut sensor).is_some() {
                fired += 1;
            }
        }

        // 30 000 ms at one fire per 5 001 ms, the counter wrapping halfway.
        assert_eq!(fired, 5);
        assert!(now < start);
        assert_eq!(sensor.reads(), 6);
    }

    #[test]
    fn first_tick_after_boot_waits_a_full_interval() {
        let mut scheduler = MeasurementScheduler::new(5_000);
        let mut sensor = FixedSensor::new(20.0, None);

        assert!(scheduler.tick(0, &mut sensor).is_none());
        assert!(scheduler.tick(5_000, &mut sensor).is_none());
        assert_eq!(
            scheduler.tick(5_001, &mut sensor),
            Some(Reading::temperature_only(20.0))
        );
    }
}
