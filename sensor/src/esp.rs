use core::convert::Infallible;
use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADCPin, ADC1,
    },
    delay::Ets,
    gpio::{
        AnyIOPin, AnyInputPin, AnyOutputPin, IOPin, Input, InputOutput, InputPin, Output,
        OutputPin, PinDriver, Pull,
    },
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use one_wire_bus::{Address, OneWire};

use station_common::{
    config::NetworkConfig, Delay, DeviceReset, HttpEngine, IndicatorEvent, IndicatorLight,
    LivenessSignal, NetworkLink, RequestRouter, RuntimeConfig, SampleError, SampleSource,
    SensorBank, SensorKind, UnavailableSource,
};

const NVS_NAMESPACE: &str = "station";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const DS18B20_PIN: i32 = 4;
const ULTRASONIC_TRIGGER_PIN: i32 = 5;
const ULTRASONIC_ECHO_PIN: i32 = 18;
const TURBIDITY_ADC_PIN: i32 = 34;
const TDS_ADC_PIN: i32 = 35;
const LED_PIN: i32 = 2;

const ECHO_TIMEOUT_US: u32 = 30_000;
const SOUND_US_PER_CM: f64 = 29.1;

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

type SharedAdc = Arc<AdcDriver<'static, ADC1>>;

struct OneWireTemperature {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Address,
    delay: Ets,
}

impl OneWireTemperature {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let mut one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;
        let mut delay = Ets;

        let mut device_count = 0_u32;
        let mut first_ds18: Option<Address> = None;
        for addr in one_wire.devices(false, &mut delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if first_ds18.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        first_ds18 = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        let address = first_ds18.ok_or_else(|| {
            anyhow!(
                "no DS18B20 on GPIO{DS18B20_PIN} ({device_count} one-wire device(s) detected)"
            )
        })?;
        info!("DS18B20 ready on GPIO{DS18B20_PIN}, using {address:?}");

        Ok(Self {
            one_wire,
            address,
            delay,
        })
    }
}

impl SampleSource for OneWireTemperature {
    fn kind(&self) -> SensorKind {
        SensorKind::Temperature
    }

    fn read_sample(&mut self) -> Result<f64, SampleError> {
        let sensor = Ds18b20::new::<Infallible>(self.address)
            .map_err(|err| SampleError::Driver(format!("invalid DS18B20 address: {err:?}")))?;

        ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
            .map_err(|err| SampleError::Driver(format!("conversion start failed: {err:?}")))?;

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        let data = sensor
            .read_data(&mut self.one_wire, &mut self.delay)
            .map_err(|err| SampleError::Driver(format!("scratchpad read failed: {err:?}")))?;

        Ok(f64::from(data.temperature))
    }
}

/// HC-SR04 style trigger/echo ranging.
struct UltrasonicDistance {
    trigger: PinDriver<'static, AnyOutputPin, Output>,
    echo: PinDriver<'static, AnyInputPin, Input>,
}

impl UltrasonicDistance {
    fn new(trigger: AnyOutputPin, echo: AnyInputPin) -> anyhow::Result<Self> {
        let mut trigger = PinDriver::output(trigger)?;
        trigger.set_low()?;
        let echo = PinDriver::input(echo)?;

        info!(
            "ultrasonic ranger on trigger GPIO{}, echo GPIO{}",
            ULTRASONIC_TRIGGER_PIN, ULTRASONIC_ECHO_PIN
        );
        Ok(Self { trigger, echo })
    }

    fn pulse_trigger(&mut self) -> Result<(), SampleError> {
        let driver_err = |err: esp_idf_svc::sys::EspError| SampleError::Driver(err.to_string());

        self.trigger.set_low().map_err(driver_err)?;
        Ets::delay_us(2);
        self.trigger.set_high().map_err(driver_err)?;
        Ets::delay_us(10);
        self.trigger.set_low().map_err(driver_err)
    }

    fn wait_for_level(&self, high: bool, since: Instant) -> Result<(), SampleError> {
        let timeout = Duration::from_micros(u64::from(ECHO_TIMEOUT_US));
        while self.echo.is_high() != high {
            if since.elapsed() > timeout {
                return Err(SampleError::Timeout(ECHO_TIMEOUT_US));
            }
        }
        Ok(())
    }
}

impl SampleSource for UltrasonicDistance {
    fn kind(&self) -> SensorKind {
        SensorKind::Distance
    }

    fn read_sample(&mut self) -> Result<f64, SampleError> {
        self.pulse_trigger()?;

        let triggered = Instant::now();
        self.wait_for_level(true, triggered)?;
        let rise = Instant::now();
        self.wait_for_level(false, triggered)?;

        let echo_us = rise.elapsed().as_micros() as f64;
        Ok((echo_us / 2.0) / SOUND_US_PER_CM)
    }
}

/// Raw oneshot ADC counts; calibration is left to consumers.
struct AdcSource<P: ADCPin<Adc = ADC1> + 'static> {
    kind: SensorKind,
    channel: AdcChannelDriver<'static, P, SharedAdc>,
}

impl<P: ADCPin<Adc = ADC1> + 'static> AdcSource<P> {
    fn new(kind: SensorKind, adc: SharedAdc, pin: P, gpio: i32) -> anyhow::Result<Self> {
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(adc, pin, &config)?;

        info!("{} ADC channel ready on GPIO{gpio}", kind.as_str());
        Ok(Self { kind, channel })
    }
}

impl<P: ADCPin<Adc = ADC1> + 'static> SampleSource for AdcSource<P> {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn read_sample(&mut self) -> Result<f64, SampleError> {
        self.channel
            .read_raw()
            .map(f64::from)
            .map_err(|err| SampleError::Driver(err.to_string()))
    }
}

struct StatusLed {
    pin: Mutex<PinDriver<'static, AnyOutputPin, Output>>,
}

impl IndicatorLight for StatusLed {
    fn signal(&self, event: IndicatorEvent) {
        let Ok(mut pin) = self.pin.lock() else {
            return;
        };

        for step in event.pattern() {
            let _ = pin.set_high();
            thread::sleep(Duration::from_millis(step.on_ms));
            let _ = pin.set_low();
            if step.off_ms > 0 {
                thread::sleep(Duration::from_millis(step.off_ms));
            }
        }
    }
}

/// Indicator used when the LED pin could not be claimed.
struct LoggedIndicator;

impl IndicatorLight for LoggedIndicator {
    fn signal(&self, event: IndicatorEvent) {
        info!("indicator {event:?}");
    }
}

struct WifiLink<'w> {
    wifi: &'w BlockingWifi<EspWifi<'static>>,
}

impl NetworkLink for WifiLink<'_> {
    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn local_address(&self) -> Option<String> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip.to_string())
    }
}

struct TaskWatchdog;

impl LivenessSignal for TaskWatchdog {
    fn notify_activity(&self) {
        feed_watchdog();
    }
}

/// Sampling cadence wait that keeps the task watchdog fed through long rounds.
struct WatchdogFedDelay;

impl Delay for WatchdogFedDelay {
    fn delay(&mut self, duration: Duration) {
        pause_fed(duration);
    }
}

struct ChipRestart;

impl DeviceReset for ChipRestart {
    fn trigger_reset(&self) {
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(nvs_partition.clone()).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let led: Box<dyn IndicatorLight> = match PinDriver::output(pins.gpio2.downgrade_output()) {
        Ok(pin) => Box::new(StatusLed {
            pin: Mutex::new(pin),
        }),
        Err(err) => {
            warn!("status LED on GPIO{LED_PIN} unavailable: {err}");
            Box::new(LoggedIndicator)
        }
    };
    led.signal(IndicatorEvent::Startup);

    let mut sensors = SensorBank::new(runtime.sensors.clone(), WatchdogFedDelay)
        .with_source(available_or_placeholder(
            SensorKind::Temperature,
            OneWireTemperature::new(pins.gpio4.downgrade()),
        ))
        .with_source(available_or_placeholder(
            SensorKind::Distance,
            UltrasonicDistance::new(
                pins.gpio5.downgrade_output(),
                pins.gpio18.downgrade_input(),
            ),
        ));

    match AdcDriver::new(adc1) {
        Ok(adc) => {
            let adc = Arc::new(adc);
            sensors = sensors
                .with_source(available_or_placeholder(
                    SensorKind::Turbidity,
                    AdcSource::new(
                        SensorKind::Turbidity,
                        adc.clone(),
                        pins.gpio34,
                        TURBIDITY_ADC_PIN,
                    ),
                ))
                .with_source(available_or_placeholder(
                    SensorKind::TotalDissolvedSolids,
                    AdcSource::new(
                        SensorKind::TotalDissolvedSolids,
                        adc,
                        pins.gpio35,
                        TDS_ADC_PIN,
                    ),
                ));
        }
        Err(err) => {
            warn!("ADC1 unavailable: {err}");
            sensors = sensors
                .with_source(Box::new(UnavailableSource::new(SensorKind::Turbidity)))
                .with_source(Box::new(UnavailableSource::new(
                    SensorKind::TotalDissolvedSolids,
                )));
        }
    }

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

    let mut wifi = start_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    let connected = connect_station(&mut wifi, &runtime.network)
        .map_err(|err| warn!("initial wifi connection failed: {err:#}"))
        .is_ok();
    led.signal(IndicatorEvent::WifiStatus { connected });
    if connected {
        disable_wifi_power_save();
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let watchdog = TaskWatchdog;
    let restart = ChipRestart;
    let mut router = RequestRouter::new(&mut sensors, led.as_ref(), &runtime.reset_password);

    loop {
        feed_watchdog();

        if !wifi.is_connected().unwrap_or(false) {
            let connected = connect_station(&mut wifi, &runtime.network)
                .map_err(|err| warn!("wifi reconnect failed: {err:#}"))
                .is_ok();
            led.signal(IndicatorEvent::WifiStatus { connected });
            if !connected {
                pause_fed(runtime.network.reconnect_interval());
                continue;
            }
        }

        let link = WifiLink { wifi: &wifi };
        let engine = HttpEngine::new(runtime.http.clone(), &link, &watchdog, &restart);
        let result = engine
            .listen()
            .and_then(|listener| engine.serve(&listener, &mut router));

        if let Err(err) = result {
            error!("http server stopped: {err}");
            led.signal(IndicatorEvent::GeneralError);
            pause_fed(runtime.network.reconnect_interval());
        }
    }
}

fn available_or_placeholder<S: SampleSource + 'static>(
    kind: SensorKind,
    source: anyhow::Result<S>,
) -> Box<dyn SampleSource> {
    match source {
        Ok(source) => Box::new(source),
        Err(err) => {
            warn!("{} driver unavailable: {err:#}", kind.as_str());
            Box::new(UnavailableSource::new(kind))
        }
    }
}

fn load_runtime_config(partition: EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 4096];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

fn start_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started for `{}`", network.wifi_ssid);
    Ok(wifi)
}

fn connect_station(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    network: &NetworkConfig,
) -> anyhow::Result<()> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("no wifi ssid configured"));
    }

    let attempts = network.connect_attempts;
    let mut last_err = None;

    for attempt in 1..=attempts {
        feed_watchdog();
        info!("wifi connect attempt {attempt}/{attempts}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi attempt {attempt} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < attempts {
            let _ = wifi.disconnect();
            pause_fed(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    Err(match last_err {
        Some(err) => anyhow!("all {attempts} wifi connect attempts failed; last error: {err:#}"),
        None => anyhow!("no wifi connect attempts made"),
    })
}

/// Sleeps in one-second slices so the task watchdog stays fed.
fn pause_fed(duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        feed_watchdog();
        thread::sleep(Duration::from_secs(1).min(deadline - Instant::now()));
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
