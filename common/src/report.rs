use crate::{
    broker::{BrokerClient, BrokerLink},
    config::Config,
    types::Reading,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportSummary {
    pub published: u8,
    pub failed: u8,
}

/// Publishes readings, one message per valid field.
#[derive(Debug, Clone)]
pub struct Reporter {
    temperature_topic: String,
    humidity_topic: String,
    retain: bool,
}

impl Reporter {
    pub fn new(config: &Config, retain: bool) -> Self {
        Self {
            temperature_topic: config.temperature_topic().to_string(),
            humidity_topic: config.humidity_topic().to_string(),
            retain,
        }
    }

    pub fn report<L: BrokerLink>(
        &self,
        broker: &mut BrokerClient<L>,
        reading: &Reading,
    ) -> ReportSummary {
        let mut summary = ReportSummary::default();
        if !reading.has_valid_field() {
            log::debug!("sensor returned no valid values; nothing to publish");
            return summary;
        }

        if let Some(temperature) = reading.valid_temperature() {
            log::debug!("temperature (°C): {temperature:.2}");
            self.publish(broker, &self.temperature_topic, temperature, &mut summary);
        }

        if let Some(humidity) = reading.valid_humidity() {
            log::debug!("humidity (%): {humidity:.2}");
            self.publish(broker, &self.humidity_topic, humidity, &mut summary);
        }

        summary
    }

    fn publish<L: BrokerLink>(
        &self,
        broker: &mut BrokerClient<L>,
        topic: &str,
        value: f32,
        summary: &mut ReportSummary,
    ) {
        match broker.publish(topic, &format_value(value), self.retain) {
            Ok(()) => summary.published += 1,
            Err(err) => {
                log::warn!("failed to publish reading: {err}");
                summary.failed += 1;
            }
        }
    }
}

/// Two decimals, matching what existing dashboards already parse.
pub fn format_value(value: f32) -> String {
    format!("{value:.2}")
}
