use std::convert::Infallible;

use crate::{
    broker::{BrokerClient, BrokerLink},
    clock::Clock,
    config::{Config, NodeSettings},
    network::{NetworkConnector, NetworkError, WifiLink},
    report::Reporter,
    scheduler::MeasurementScheduler,
    sensor::SensorReader,
    types::{ConnectionState, SupervisorState},
};

/// Owns every piece of node state and drives the connectivity state machine.
pub struct Supervisor<W, B, S, C> {
    config: Config,
    network: NetworkConnector<W>,
    broker: BrokerClient<B>,
    sensor: S,
    clock: C,
    scheduler: MeasurementScheduler,
    reporter: Reporter,
    watch_network: bool,
    state: SupervisorState,
}

impl<W, B, S, C> Supervisor<W, B, S, C>
where
    W: WifiLink,
    B: BrokerLink,
    S: SensorReader,
    C: Clock,
{
    pub fn new(
        config: Config,
        settings: &NodeSettings,
        network: NetworkConnector<W>,
        broker: BrokerClient<B>,
        sensor: S,
        clock: C,
    ) -> Self {
        Self {
            reporter: Reporter::new(&config, settings.retain_readings),
            scheduler: MeasurementScheduler::new(settings.measurement_interval_ms),
            watch_network: settings.network.is_provisioning(),
            config,
            network,
            broker,
            sensor,
            clock,
            state: SupervisorState::NetworkDown,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn network(&self) -> &NetworkConnector<W> {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut NetworkConnector<W> {
        &mut self.network
    }

    pub fn broker(&self) -> &BrokerClient<B> {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut BrokerClient<B> {
        &mut self.broker
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// One loop iteration: either a liveness check that found a dropped link,
    /// one connection transition, or one round of pump + measurement.
    pub fn step(&mut self) -> Result<SupervisorState, NetworkError> {
        if self.state == SupervisorState::Running {
            if self.watch_network && !self.network.is_connected() {
                self.transition(SupervisorState::NetworkDown);
                return Ok(self.state);
            }
            if !self.broker.is_connected() {
                self.transition(SupervisorState::BrokerDown);
                return Ok(self.state);
            }
        }

        match self.state {
            SupervisorState::NetworkDown => {
                if self.network.ensure_connected(&mut self.clock)? == ConnectionState::Connected {
                    self.transition(SupervisorState::BrokerDown);
                }
            }
            SupervisorState::BrokerDown => {
                self.broker.ensure_connected(&self.config, &mut self.clock);
                self.transition(SupervisorState::Running);
            }
            SupervisorState::Running => {
                // The next step sees the dropped session and reconnects before measuring.
                if self.broker.pump().is_err() {
                    return Ok(self.state);
                }

                let now = self.clock.now_ms();
                if let Some(reading) = self.scheduler.tick(now, &mut self.sensor) {
                    let summary = self.reporter.report(&mut self.broker, &reading);
                    log::debug!(
                        "reported {} value(s) from {} ({} failed)",
                        summary.published,
                        self.sensor.name(),
                        summary.failed
                    );
                }
            }
        }

        Ok(self.state)
    }

    /// Runs forever. Only a join timeout gets out, and the caller answers it
    /// with a device reset.
    pub fn run(&mut self) -> Result<Infallible, NetworkError> {
        log::info!(
            "supervisor started for `{}` (interval {} ms)",
            self.config.host_name(),
            self.scheduler.interval_ms()
        );
        loop {
            self.step()?;
            self.clock.yield_now();
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            log::info!("supervisor {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }
}
