pub mod config;
pub mod device;
pub mod error;
pub mod estimator;
pub mod http;
pub mod router;
pub mod routes;
pub mod sampling;
pub mod types;

pub use config::{HttpConfig, NetworkConfig, RuntimeConfig, SensorConfig, SensorSuiteConfig};
pub use device::{
    Blink, Delay, DeviceReset, IndicatorEvent, IndicatorLight, LivenessSignal, NetworkLink,
    ThreadDelay,
};
pub use error::{EngineError, RouteError, SampleError};
pub use estimator::{Estimate, EstimateMethod, EstimatorStrategy, RobustEstimator};
pub use http::{HttpEngine, RequestHandler};
pub use router::RequestRouter;
pub use routes::*;
pub use sampling::{AcquisitionPipeline, SampleSource, SensorBank, SensorReader, UnavailableSource};
pub use types::{SensorKind, SensorReading};
