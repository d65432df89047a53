use log::{debug, info, warn};

use crate::{
    config::{SensorConfig, SensorSuiteConfig},
    device::{Delay, ThreadDelay},
    error::SampleError,
    estimator::RobustEstimator,
    types::{SensorKind, SensorReading},
};

/// One sensor driver: "attempt one read; return a value or fail".
pub trait SampleSource {
    fn kind(&self) -> SensorKind;

    /// `false` when the driver failed to initialize. Fixed for the process lifetime.
    fn is_available(&self) -> bool {
        true
    }

    fn read_sample(&mut self) -> Result<f64, SampleError>;
}

/// Stand-in for a driver whose hardware was missing at startup.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableSource {
    kind: SensorKind,
}

impl UnavailableSource {
    pub fn new(kind: SensorKind) -> Self {
        Self { kind }
    }
}

impl SampleSource for UnavailableSource {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        false
    }

    fn read_sample(&mut self) -> Result<f64, SampleError> {
        Err(SampleError::NotInitialized)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBatch {
    pub values: Vec<f64>,
    pub failures: Vec<SampleError>,
}

impl SampleBatch {
    pub fn attempts(&self) -> usize {
        self.values.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Blocking read-N-times-then-estimate orchestration.
#[derive(Debug)]
pub struct AcquisitionPipeline<D = ThreadDelay> {
    delay: D,
}

impl<D: Delay> AcquisitionPipeline<D> {
    pub fn new(delay: D) -> Self {
        Self { delay }
    }

    /// Runs exactly `sample_count` attempts, waiting `reading_interval`
    /// between consecutive attempts.
    pub fn collect(&mut self, source: &mut dyn SampleSource, config: &SensorConfig) -> SampleBatch {
        let kind = source.kind();
        let total = config.sample_count;
        let mut batch = SampleBatch {
            values: Vec::with_capacity(usize::from(total)),
            failures: Vec::new(),
        };

        debug!(
            "{}: starting {} reads every {} ms",
            kind.as_str(),
            total,
            config.reading_interval_ms
        );

        for attempt in 1..=total {
            match source.read_sample() {
                Ok(value) if value.is_finite() => {
                    debug!("{} read {attempt}/{total}: {value}", kind.as_str());
                    batch.values.push(value);
                }
                Ok(_) => {
                    warn!("{} read {attempt}/{total}: non-finite value", kind.as_str());
                    batch.failures.push(SampleError::InvalidData);
                }
                Err(err) => {
                    warn!("{} read {attempt}/{total} failed: {err}", kind.as_str());
                    batch.failures.push(err);
                }
            }

            if attempt < total {
                self.delay.delay(config.reading_interval());
            }
        }

        batch
    }

    pub fn acquire(&mut self, source: &mut dyn SampleSource, config: &SensorConfig) -> SensorReading {
        let kind = source.kind();

        if !source.is_available() {
            warn!("{}: driver unavailable, skipping acquisition", kind.as_str());
            return SensorReading::absent(kind);
        }

        let batch = self.collect(source, config);
        if batch.is_empty() {
            warn!(
                "{}: no successful reads out of {}",
                kind.as_str(),
                batch.attempts()
            );
            return SensorReading::absent(kind);
        }

        let estimate = RobustEstimator::from_config(config).estimate(&batch.values);
        let value = estimate.value.filter(|value| value.is_finite());
        match value {
            Some(value) => info!(
                "{}: {value:.2} {} ({:?}, kept {}, discarded {}, failed {})",
                kind.as_str(),
                kind.unit(),
                estimate.method,
                estimate.kept,
                estimate.discarded,
                batch.failures.len()
            ),
            None => warn!("{}: no finite estimate ({:?})", kind.as_str(), estimate.method),
        }

        SensorReading::new(kind, value)
    }
}

impl Default for AcquisitionPipeline<ThreadDelay> {
    fn default() -> Self {
        Self::new(ThreadDelay)
    }
}

/// Anything that can produce an estimated reading for a sensor on demand.
pub trait SensorReader {
    fn read(&mut self, kind: SensorKind) -> SensorReading;
}

impl<T: SensorReader + ?Sized> SensorReader for &mut T {
    fn read(&mut self, kind: SensorKind) -> SensorReading {
        (**self).read(kind)
    }
}

/// Process-scoped owner of the sensor drivers and their configuration.
pub struct SensorBank<D = ThreadDelay> {
    sources: Vec<Box<dyn SampleSource>>,
    config: SensorSuiteConfig,
    pipeline: AcquisitionPipeline<D>,
}

impl<D: Delay> SensorBank<D> {
    pub fn new(config: SensorSuiteConfig, delay: D) -> Self {
        Self {
            sources: Vec::with_capacity(SensorKind::ALL.len()),
            config,
            pipeline: AcquisitionPipeline::new(delay),
        }
    }

    /// Registers a driver, replacing any earlier one for the same sensor.
    pub fn with_source(mut self, source: Box<dyn SampleSource>) -> Self {
        let kind = source.kind();
        self.sources.retain(|existing| existing.kind() != kind);
        self.sources.push(source);
        self
    }

    pub fn read_all(&mut self) -> Vec<SensorReading> {
        SensorKind::ALL.iter().map(|&kind| self.read(kind)).collect()
    }
}

impl<D: Delay> SensorReader for SensorBank<D> {
    fn read(&mut self, kind: SensorKind) -> SensorReading {
        let config = self.config.get(kind);
        match self.sources.iter_mut().find(|source| source.kind() == kind) {
            Some(source) => self.pipeline.acquire(source.as_mut(), config),
            None => {
                warn!("{}: no driver registered", kind.as_str());
                SensorReading::absent(kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct RecordingDelay {
        waits: Vec<Duration>,
    }

    impl Delay for &mut RecordingDelay {
        fn delay(&mut self, duration: Duration) {
            self.waits.push(duration);
        }
    }

    struct ScriptedSource {
        kind: SensorKind,
        script: VecDeque<Result<f64, SampleError>>,
        calls: usize,
        available: bool,
    }

    impl ScriptedSource {
        fn new(kind: SensorKind, script: Vec<Result<f64, SampleError>>) -> Self {
            Self {
                kind,
                script: script.into(),
                calls: 0,
                available: true,
            }
        }
    }

    impl SampleSource for ScriptedSource {
        fn kind(&self) -> SensorKind {
            self.kind
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn read_sample(&mut self) -> Result<f64, SampleError> {
            self.calls += 1;
            self.script
                .pop_front()
                .unwrap_or(Err(SampleError::Timeout(30_000)))
        }
    }

    fn config(sample_count: u16) -> SensorConfig {
        SensorConfig {
            sample_count,
            reading_interval_ms: 250,
            outlier_fraction: 0.10,
            rounding_precision: None,
            strategy: Default::default(),
        }
    }

    #[test]
    fn performs_exact_attempt_count_with_waits_between() {
        let mut delay = RecordingDelay::default();
        let mut source = ScriptedSource::new(
            SensorKind::Distance,
            vec![Ok(20.0), Ok(21.0), Ok(19.0), Ok(20.0), Ok(500.0)],
        );

        let reading = AcquisitionPipeline::new(&mut delay).acquire(&mut source, &config(5));

        assert_eq!(source.calls, 5);
        assert_eq!(delay.waits, vec![Duration::from_millis(250); 4]);
        assert_eq!(reading.value, Some(20.0));
        assert_eq!(reading.unit, "cm");
    }

    #[test]
    fn failed_reads_do_not_stop_the_loop() {
        let mut delay = RecordingDelay::default();
        let mut source = ScriptedSource::new(
            SensorKind::Temperature,
            vec![
                Err(SampleError::Timeout(30_000)),
                Ok(22.5),
                Err(SampleError::Driver("crc mismatch".into())),
                Ok(f64::NAN),
                Ok(22.5),
            ],
        );

        let batch = AcquisitionPipeline::new(&mut delay).collect(&mut source, &config(5));

        assert_eq!(batch.values, vec![22.5, 22.5]);
        assert_eq!(batch.failures.len(), 3);
        assert_eq!(batch.failures[2], SampleError::InvalidData);
        assert_eq!(batch.attempts(), 5);
    }

    #[test]
    fn every_read_failing_yields_absent_value() {
        let mut delay = RecordingDelay::default();
        let mut source = ScriptedSource::new(SensorKind::Turbidity, Vec::new());

        let reading = AcquisitionPipeline::new(&mut delay).acquire(&mut source, &config(3));

        assert_eq!(source.calls, 3);
        assert_eq!(reading, SensorReading::absent(SensorKind::Turbidity));
    }

    #[test]
    fn unavailable_source_short_circuits_without_reads_or_waits() {
        let mut delay = RecordingDelay::default();
        let mut source = ScriptedSource::new(SensorKind::Temperature, vec![Ok(22.5); 10]);
        source.available = false;

        let reading = AcquisitionPipeline::new(&mut delay).acquire(&mut source, &config(10));

        assert_eq!(source.calls, 0);
        assert_eq!(reading.value, None);
        assert_eq!(reading.sensor, SensorKind::Temperature);
        assert!(delay.waits.is_empty());
    }

    #[test]
    fn placeholder_for_missing_driver_is_never_read() {
        let mut delay = RecordingDelay::default();
        let mut source = UnavailableSource::new(SensorKind::Distance);

        let reading = AcquisitionPipeline::new(&mut delay).acquire(&mut source, &config(10));

        assert!(!source.is_available());
        assert_eq!(reading, SensorReading::absent(SensorKind::Distance));
        assert!(delay.waits.is_empty());
    }

    #[test]
    fn overflowing_samples_still_yield_a_finite_value() {
        let mut delay = RecordingDelay::default();
        let mut source = ScriptedSource::new(SensorKind::Temperature, vec![Ok(f64::MAX); 3]);

        let reading = AcquisitionPipeline::new(&mut delay).acquire(&mut source, &config(3));

        assert_eq!(reading.value, Some(f64::MAX));
    }

    #[test]
    fn bank_routes_reads_to_matching_driver() {
        let mut delay = RecordingDelay::default();
        let mut suite = SensorSuiteConfig::default();
        suite.tds.sample_count = 3;

        let mut bank = SensorBank::new(suite, &mut delay)
            .with_source(Box::new(ScriptedSource::new(
                SensorKind::TotalDissolvedSolids,
                vec![Ok(812.0), Ok(812.0), Ok(790.0)],
            )))
            .with_source(Box::new(UnavailableSource::new(SensorKind::Temperature)));

        assert_eq!(
            bank.read(SensorKind::TotalDissolvedSolids).value,
            Some(812.0)
        );
        assert_eq!(bank.read(SensorKind::Temperature).value, None);
        assert_eq!(bank.read(SensorKind::Distance).value, None);
        assert_eq!(bank.read_all().len(), 4);
    }
}
