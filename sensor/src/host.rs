use std::{fs, thread};

use anyhow::Context;
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use station_common::{
    DeviceReset, HttpEngine, IndicatorEvent, IndicatorLight, LivenessSignal, NetworkLink,
    RequestRouter, RuntimeConfig, SampleError, SampleSource, SensorBank, SensorKind, ThreadDelay,
};

const HOST_DEFAULT_PORT: u16 = 8080;
/// Simulated sources answer instantly, so the cadence wait is kept short.
const SIMULATED_INTERVAL_MS: u64 = 10;

/// Uniformly random samples inside a plausible range for the sensor.
struct SimulatedSource {
    kind: SensorKind,
    low: f64,
    high: f64,
}

impl SimulatedSource {
    fn new(kind: SensorKind) -> Self {
        let (low, high) = match kind {
            SensorKind::Temperature => (15.0, 30.0),
            SensorKind::Distance => (10.0, 200.0),
            SensorKind::Turbidity => (0.0, 4_000.0),
            SensorKind::TotalDissolvedSolids => (0.0, 2_000.0),
        };
        Self { kind, low, high }
    }
}

impl SampleSource for SimulatedSource {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn read_sample(&mut self) -> Result<f64, SampleError> {
        let value = rand::thread_rng().gen_range(self.low..=self.high);
        Ok((value * 100.0).round() / 100.0)
    }
}

struct LoopbackLink;

impl NetworkLink for LoopbackLink {
    fn is_connected(&self) -> bool {
        true
    }

    fn local_address(&self) -> Option<String> {
        None
    }
}

struct LoggedHeartbeat;

impl LivenessSignal for LoggedHeartbeat {
    fn notify_activity(&self) {
        trace!("heartbeat");
    }
}

struct LoggedIndicator;

impl IndicatorLight for LoggedIndicator {
    fn signal(&self, event: IndicatorEvent) {
        debug!("indicator {event:?} ({} blink(s))", event.pattern().len());
    }
}

struct ProcessExit;

impl DeviceReset for ProcessExit {
    fn trigger_reset(&self) {
        warn!("reset requested; exiting process");
        std::process::exit(0);
    }
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config()?;
    let indicator = LoggedIndicator;
    indicator.signal(IndicatorEvent::Startup);

    let mut sensors = SensorKind::ALL.iter().fold(
        SensorBank::new(runtime.sensors.clone(), ThreadDelay),
        |bank, &kind| bank.with_source(Box::new(SimulatedSource::new(kind))),
    );

    info!("running sensor self-test");
    for reading in sensors.read_all() {
        match reading.value {
            Some(value) => info!(
                "self-test {}: {value:.2} {}",
                reading.sensor.as_str(),
                reading.unit
            ),
            None => warn!("self-test {}: no estimate", reading.sensor.as_str()),
        }
    }

    let link = LoopbackLink;
    let heartbeat = LoggedHeartbeat;
    let reset = ProcessExit;
    let engine = HttpEngine::new(runtime.http.clone(), &link, &heartbeat, &reset);
    let mut router = RequestRouter::new(&mut sensors, &indicator, &runtime.reset_password);

    info!("simulated sensor station started");

    loop {
        let result = engine
            .listen()
            .and_then(|listener| engine.serve(&listener, &mut router));

        if let Err(err) = result {
            error!("http server stopped: {err}");
            indicator.signal(IndicatorEvent::GeneralError);
            thread::sleep(runtime.network.reconnect_interval());
        }
    }
}

fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let mut runtime = match std::env::var("STATION_CONFIG") {
        Ok(path) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file `{path}`"))?;
            serde_json::from_str::<RuntimeConfig>(&raw)
                .with_context(|| format!("failed to parse config file `{path}`"))?
        }
        Err(_) => simulation_defaults(),
    };

    if let Some(port) = std::env::var("HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.http.port = port;
    }

    if let Ok(password) = std::env::var("RESET_PASSWORD") {
        runtime.reset_password = password;
    }

    runtime.sanitize();
    Ok(runtime)
}

/// Defaults for running without a config file.
fn simulation_defaults() -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();
    runtime.http.port = HOST_DEFAULT_PORT;
    for sensor in [
        &mut runtime.sensors.temperature,
        &mut runtime.sensors.distance,
        &mut runtime.sensors.turbidity,
        &mut runtime.sensors.tds,
    ] {
        sensor.reading_interval_ms = SIMULATED_INTERVAL_MS;
    }
    runtime
}

#[cfg(test)]
mod tests {
    use station_common::{SensorReader, SensorSuiteConfig};

    use super::*;

    #[test]
    fn simulation_defaults_keep_rounds_short() {
        let runtime = simulation_defaults();

        assert_eq!(runtime.http.port, HOST_DEFAULT_PORT);
        for kind in SensorKind::ALL {
            let config = runtime.sensors.get(kind);
            assert_eq!(config.reading_interval_ms, SIMULATED_INTERVAL_MS);
            assert_eq!(config.sample_count, SensorSuiteConfig::default().get(kind).sample_count);
        }
    }

    #[test]
    fn simulated_sources_stay_in_range() {
        let mut bank = SensorKind::ALL.iter().fold(
            SensorBank::new(simulation_defaults().sensors, ThreadDelay),
            |bank, &kind| bank.with_source(Box::new(SimulatedSource::new(kind))),
        );

        for kind in SensorKind::ALL {
            let source = SimulatedSource::new(kind);
            let value = bank.read(kind).value.unwrap();
            assert!((source.low..=source.high).contains(&value), "{kind:?}: {value}");
        }
    }
}
