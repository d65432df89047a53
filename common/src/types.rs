use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Distance,
    Turbidity,
    #[serde(rename = "tds")]
    TotalDissolvedSolids,
}

/// How a sensor's estimate is rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Float,
    Integer,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        Self::Temperature,
        Self::Distance,
        Self::Turbidity,
        Self::TotalDissolvedSolids,
    ];

    /// JSON key and log label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Distance => "distance",
            Self::Turbidity => "turbidity",
            Self::TotalDissolvedSolids => "tds",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "C",
            Self::Distance => "cm",
            Self::Turbidity | Self::TotalDissolvedSolids => "adc",
        }
    }

    pub fn value_kind(self) -> ValueKind {
        match self {
            Self::Temperature | Self::Distance => ValueKind::Float,
            Self::Turbidity | Self::TotalDissolvedSolids => ValueKind::Integer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub sensor: SensorKind,
    pub value: Option<f64>,
    pub unit: &'static str,
}

impl SensorReading {
    pub fn new(sensor: SensorKind, value: Option<f64>) -> Self {
        Self {
            sensor,
            value,
            unit: sensor.unit(),
        }
    }

    pub fn absent(sensor: SensorKind) -> Self {
        Self::new(sensor, None)
    }

    pub fn json_value(&self) -> serde_json::Value {
        match (self.value, self.sensor.value_kind()) {
            (None, _) => serde_json::Value::Null,
            (Some(value), ValueKind::Integer) => serde_json::Value::from(value.round() as i64),
            (Some(value), ValueKind::Float) => serde_json::Number::from_f64(value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetPayload {
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AllSensorsPayload {
    pub temperature: Option<f64>,
    pub distance: Option<f64>,
    pub turbidity: Option<i64>,
    pub tds: Option<i64>,
}

impl AllSensorsPayload {
    pub fn from_readings(readings: &[SensorReading]) -> Self {
        let mut payload = Self {
            temperature: None,
            distance: None,
            turbidity: None,
            tds: None,
        };

        for reading in readings {
            match reading.sensor {
                SensorKind::Temperature => payload.temperature = reading.value,
                SensorKind::Distance => payload.distance = reading.value,
                SensorKind::Turbidity => {
                    payload.turbidity = reading.value.map(|v| v.round() as i64)
                }
                SensorKind::TotalDissolvedSolids => {
                    payload.tds = reading.value.map(|v| v.round() as i64)
                }
            }
        }

        payload
    }
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
