use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{estimator::EstimatorStrategy, types::SensorKind};

/// Upper bound on the waits of one sensor's acquisition round, so a single
/// request stays well inside the device watchdog timeout.
pub const MAX_ACQUISITION_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sample_count: u16,
    pub reading_interval_ms: u64,
    /// Relative deviation from the batch mean beyond which a sample is dropped.
    /// Zero disables filtering.
    pub outlier_fraction: f64,
    /// Decimal digits used to merge near-duplicates before taking the mode.
    #[serde(default)]
    pub rounding_precision: Option<u32>,
    #[serde(default)]
    pub strategy: EstimatorStrategy,
}

impl SensorConfig {
    pub fn for_sensor(kind: SensorKind) -> Self {
        let (outlier_fraction, rounding_precision) = match kind {
            SensorKind::Temperature => (0.10, Some(1)),
            SensorKind::Distance => (0.50, Some(0)),
            SensorKind::Turbidity => (0.20, None),
            SensorKind::TotalDissolvedSolids => (0.20, None),
        };

        Self {
            sample_count: 10,
            reading_interval_ms: 1_000,
            outlier_fraction,
            rounding_precision,
            strategy: EstimatorStrategy::default(),
        }
    }

    pub fn reading_interval(&self) -> Duration {
        Duration::from_millis(self.reading_interval_ms)
    }

    pub fn sanitize(&mut self) {
        self.sample_count = self.sample_count.clamp(1, 100);
        self.reading_interval_ms = self.reading_interval_ms.min(60_000);

        let waits = u64::from(self.sample_count - 1);
        if waits > 0 && waits * self.reading_interval_ms > MAX_ACQUISITION_MS {
            self.reading_interval_ms = MAX_ACQUISITION_MS / waits;
        }

        self.outlier_fraction = if self.outlier_fraction.is_finite() {
            self.outlier_fraction.clamp(0.0, 0.99)
        } else {
            0.0
        };

        if let Some(precision) = self.rounding_precision {
            self.rounding_precision = Some(precision.min(6));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SensorSuiteOverride")]
pub struct SensorSuiteConfig {
    pub temperature: SensorConfig,
    pub distance: SensorConfig,
    pub turbidity: SensorConfig,
    pub tds: SensorConfig,
}

impl Default for SensorSuiteConfig {
    fn default() -> Self {
        Self {
            temperature: SensorConfig::for_sensor(SensorKind::Temperature),
            distance: SensorConfig::for_sensor(SensorKind::Distance),
            turbidity: SensorConfig::for_sensor(SensorKind::Turbidity),
            tds: SensorConfig::for_sensor(SensorKind::TotalDissolvedSolids),
        }
    }
}

impl SensorSuiteConfig {
    pub fn get(&self, kind: SensorKind) -> &SensorConfig {
        match kind {
            SensorKind::Temperature => &self.temperature,
            SensorKind::Distance => &self.distance,
            SensorKind::Turbidity => &self.turbidity,
            SensorKind::TotalDissolvedSolids => &self.tds,
        }
    }

    pub fn sanitize(&mut self) {
        self.temperature.sanitize();
        self.distance.sanitize();
        self.turbidity.sanitize();
        self.tds.sanitize();
    }
}

/// Fields given for one sensor; anything absent keeps that sensor's default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SensorOverride {
    sample_count: Option<u16>,
    reading_interval_ms: Option<u64>,
    outlier_fraction: Option<f64>,
    /// `null` disables rounding, absent keeps the default precision.
    #[serde(deserialize_with = "present")]
    rounding_precision: Option<Option<u32>>,
    strategy: Option<EstimatorStrategy>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl SensorOverride {
    fn apply(self, kind: SensorKind) -> SensorConfig {
        let base = SensorConfig::for_sensor(kind);
        SensorConfig {
            sample_count: self.sample_count.unwrap_or(base.sample_count),
            reading_interval_ms: self.reading_interval_ms.unwrap_or(base.reading_interval_ms),
            outlier_fraction: self.outlier_fraction.unwrap_or(base.outlier_fraction),
            rounding_precision: self.rounding_precision.unwrap_or(base.rounding_precision),
            strategy: self.strategy.unwrap_or(base.strategy),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SensorSuiteOverride {
    temperature: SensorOverride,
    distance: SensorOverride,
    turbidity: SensorOverride,
    tds: SensorOverride,
}

impl From<SensorSuiteOverride> for SensorSuiteConfig {
    fn from(overrides: SensorSuiteOverride) -> Self {
        Self {
            temperature: overrides.temperature.apply(SensorKind::Temperature),
            distance: overrides.distance.apply(SensorKind::Distance),
            turbidity: overrides.turbidity.apply(SensorKind::Turbidity),
            tds: overrides.tds.apply(SensorKind::TotalDissolvedSolids),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub client_timeout_ms: u64,
    pub max_request_bytes: usize,
    pub accept_retry_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 80,
            client_timeout_ms: 10_000,
            max_request_bytes: 1_024,
            accept_retry_delay_ms: 100,
        }
    }
}

impl HttpConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn accept_retry_delay(&self) -> Duration {
        Duration::from_millis(self.accept_retry_delay_ms)
    }

    pub fn sanitize(&mut self) {
        if self.port == 0 {
            self.port = 80;
        }
        self.client_timeout_ms = self.client_timeout_ms.clamp(1_000, 120_000);
        self.max_request_bytes = self.max_request_bytes.clamp(128, 8_192);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub connect_attempts: u32,
    pub reconnect_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            connect_attempts: 3,
            reconnect_interval_ms: 60_000,
        }
    }
}

impl NetworkConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn sanitize(&mut self) {
        self.connect_attempts = self.connect_attempts.clamp(1, 10);
        self.reconnect_interval_ms = self.reconnect_interval_ms.max(1_000);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub sensors: SensorSuiteConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Shared secret for `/hardreset`. Empty disables the route.
    #[serde(default)]
    pub reset_password: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sensors: SensorSuiteConfig::default(),
            http: HttpConfig::default(),
            network: NetworkConfig::default(),
            reset_password: String::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.sensors.sanitize();
        self.http.sanitize();
        self.network.sanitize();
    }
}
