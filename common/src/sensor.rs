use crate::types::Reading;

/// A temperature/humidity source. Failures are reported in-band as NaN
/// fields, never as errors.
pub trait SensorReader {
    fn read(&mut self) -> Reading;

    fn name(&self) -> &'static str {
        "sensor"
    }
}

impl<T: SensorReader + ?Sized> SensorReader for Box<T> {
    fn read(&mut self) -> Reading {
        (**self).read()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
