use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::{
    device::{IndicatorEvent, IndicatorLight},
    error::RouteError,
    http::{Dispatch, FollowUp, HttpRequest, HttpResponse, Method, RequestHandler, StatusCode},
    routes::{
        ROUTE_ALL_SENSORS, ROUTE_DISTANCE, ROUTE_HARD_RESET, ROUTE_STATUS, ROUTE_TDS,
        ROUTE_TEMPERATURE, ROUTE_TURBIDITY,
    },
    sampling::SensorReader,
    types::{AllSensorsPayload, ResetPayload, ResetRequest, SensorKind, StatusPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Status,
    Sensor(SensorKind),
    AllSensors,
    HardReset,
}

#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub path: &'static str,
    pub method: Method,
    pub action: RouteAction,
}

const fn route(path: &'static str, method: Method, action: RouteAction) -> Route {
    Route {
        path,
        method,
        action,
    }
}

pub const ROUTES: [Route; 7] = [
    route(ROUTE_STATUS, Method::Get, RouteAction::Status),
    route(
        ROUTE_TEMPERATURE,
        Method::Get,
        RouteAction::Sensor(SensorKind::Temperature),
    ),
    route(
        ROUTE_DISTANCE,
        Method::Get,
        RouteAction::Sensor(SensorKind::Distance),
    ),
    route(
        ROUTE_TURBIDITY,
        Method::Get,
        RouteAction::Sensor(SensorKind::Turbidity),
    ),
    route(
        ROUTE_TDS,
        Method::Get,
        RouteAction::Sensor(SensorKind::TotalDissolvedSolids),
    ),
    route(ROUTE_ALL_SENSORS, Method::Get, RouteAction::AllSensors),
    route(ROUTE_HARD_RESET, Method::Post, RouteAction::HardReset),
];

/// Resolves a request against `routes`: unknown path is 404, known path with
/// another method is 405.
pub fn resolve(routes: &[Route], method: Method, path: &str) -> Result<RouteAction, RouteError> {
    let mut path_known = false;

    for candidate in routes.iter().filter(|r| r.path == path) {
        path_known = true;
        if candidate.method == method {
            return Ok(candidate.action);
        }
    }

    if path_known {
        Err(RouteError::MethodNotAllowed)
    } else {
        Err(RouteError::NotFound)
    }
}

pub struct RequestRouter<'a, S> {
    sensors: S,
    indicator: &'a dyn IndicatorLight,
    reset_digest: Option<Vec<u8>>,
    routes: &'a [Route],
}

impl<'a, S: SensorReader> RequestRouter<'a, S> {
    pub fn new(sensors: S, indicator: &'a dyn IndicatorLight, reset_password: &str) -> Self {
        let reset_digest = if reset_password.is_empty() {
            warn!("no reset password configured; /hardreset is disabled");
            None
        } else {
            Some(Sha256::digest(reset_password.as_bytes()).to_vec())
        };

        Self {
            sensors,
            indicator,
            reset_digest,
            routes: &ROUTES,
        }
    }

    fn status(&self) -> Dispatch {
        HttpResponse::json(StatusCode::Ok, &StatusPayload { status: "ok" }).into()
    }

    fn sensor(&mut self, kind: SensorKind) -> Result<Dispatch, RouteError> {
        self.indicator.signal(IndicatorEvent::ReadingSensors);
        let reading = self.sensors.read(kind);

        if reading.value.is_none() {
            return Err(RouteError::NoData);
        }

        let mut body = serde_json::Map::new();
        body.insert(kind.as_str().to_string(), reading.json_value());
        Ok(HttpResponse::json(StatusCode::Ok, &body).into())
    }

    fn all_sensors(&mut self) -> Result<Dispatch, RouteError> {
        self.indicator.signal(IndicatorEvent::ReadingSensors);
        let readings: Vec<_> = SensorKind::ALL
            .iter()
            .map(|&kind| self.sensors.read(kind))
            .collect();

        if readings.iter().all(|reading| reading.value.is_none()) {
            return Err(RouteError::NoData);
        }

        let payload = AllSensorsPayload::from_readings(&readings);
        Ok(HttpResponse::json(StatusCode::Ok, &payload).into())
    }

    fn hard_reset(&self, body: &str) -> Result<Dispatch, RouteError> {
        let request: ResetRequest = serde_json::from_str(body)
            .map_err(|err| RouteError::BadRequest(format!("Invalid JSON: {err}")))?;

        let supplied = request.password.unwrap_or_default();
        if !self.secret_matches(&supplied) {
            warn!("rejected reset request with wrong password");
            return Err(RouteError::Unauthorized);
        }

        info!("reset password accepted");
        Ok(Dispatch {
            response: HttpResponse::json(
                StatusCode::Ok,
                &ResetPayload {
                    status: "ok",
                    message: "Device is resetting",
                },
            ),
            follow_up: Some(FollowUp::Reset),
        })
    }

    fn secret_matches(&self, supplied: &str) -> bool {
        match &self.reset_digest {
            Some(expected) => Sha256::digest(supplied.as_bytes()).as_slice() == expected.as_slice(),
            None => false,
        }
    }
}

impl<S: SensorReader> RequestHandler for RequestRouter<'_, S> {
    fn handle(&mut self, request: &HttpRequest) -> Result<Dispatch, RouteError> {
        match resolve(self.routes, request.method, &request.path)? {
            RouteAction::Status => Ok(self.status()),
            RouteAction::Sensor(kind) => self.sensor(kind),
            RouteAction::AllSensors => self.all_sensors(),
            RouteAction::HardReset => self.hard_reset(&request.body),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        io::{self, Cursor, Read, Write},
        time::Duration,
    };

    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        config::HttpConfig,
        device::{DeviceReset, LivenessSignal, NetworkLink},
        http::{Connection, HttpEngine},
        types::SensorReading,
    };

    struct FixedSensors {
        values: [Option<f64>; 4],
        reads: Vec<SensorKind>,
    }

    impl FixedSensors {
        fn new(values: [Option<f64>; 4]) -> Self {
            Self {
                values,
                reads: Vec::new(),
            }
        }
    }

    impl SensorReader for FixedSensors {
        fn read(&mut self, kind: SensorKind) -> SensorReading {
            self.reads.push(kind);
            let idx = SensorKind::ALL.iter().position(|k| *k == kind).unwrap();
            SensorReading::new(kind, self.values[idx])
        }
    }

    #[derive(Default)]
    struct RecordingLight {
        events: RefCell<Vec<IndicatorEvent>>,
    }

    impl IndicatorLight for RecordingLight {
        fn signal(&self, event: IndicatorEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    fn request(method: Method, path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method,
            path: path.to_string(),
            body: body.to_string(),
        }
    }

    fn get(path: &str) -> HttpRequest {
        request(Method::Get, path, "")
    }

    fn body_json(dispatch: &Dispatch) -> Value {
        serde_json::from_slice(&dispatch.response.body).unwrap()
    }

    const ALL_PRESENT: [Option<f64>; 4] = [Some(22.5), Some(104.25), Some(1843.4), Some(611.6)];

    #[test]
    fn status_does_not_touch_sensors() {
        let light = RecordingLight::default();
        let mut sensors = FixedSensors::new(ALL_PRESENT);
        let mut router = RequestRouter::new(&mut sensors, &light, "secret");

        let dispatch = router.handle(&get("/status")).unwrap();

        assert_eq!(dispatch.response.status, StatusCode::Ok);
        assert_eq!(body_json(&dispatch), json!({"status": "ok"}));
        drop(router);
        assert!(sensors.reads.is_empty());
        assert!(light.events.borrow().is_empty());
    }

    #[test]
    fn sensor_routes_return_exactly_their_key() {
        let light = RecordingLight::default();
        let mut sensors = FixedSensors::new(ALL_PRESENT);
        let mut router = RequestRouter::new(&mut sensors, &light, "secret");

        let cases = [
            ("/temperature", json!({"temperature": 22.5})),
            ("/distance", json!({"distance": 104.25})),
            ("/turbidity", json!({"turbidity": 1843})),
            ("/tds", json!({"tds": 612})),
        ];

        for (path, expected) in cases {
            let dispatch = router.handle(&get(path)).unwrap();
            assert_eq!(body_json(&dispatch), expected, "{path}");
            assert_eq!(dispatch.follow_up, None);
        }

        assert_eq!(light.events.borrow().len(), 4);
    }

    #[test]
    fn adc_sensors_serialize_as_integers() {
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(FixedSensors::new(ALL_PRESENT), &light, "");

        let dispatch = router.handle(&get("/turbidity")).unwrap();

        assert_eq!(dispatch.response.body, b"{\"turbidity\":1843}".to_vec());
    }

    #[test]
    fn single_sensor_without_estimate_is_500() {
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(
            FixedSensors::new([None, Some(1.0), Some(2.0), Some(3.0)]),
            &light,
            "",
        );

        let err = router.handle(&get("/temperature")).unwrap_err();

        assert_eq!(err, RouteError::NoData);
        assert_eq!(err.status(), StatusCode::InternalServerError);
    }

    #[test]
    fn all_sensors_reads_every_sensor_in_order() {
        let light = RecordingLight::default();
        let mut sensors = FixedSensors::new([Some(22.5), None, Some(1843.0), None]);
        let mut router = RequestRouter::new(&mut sensors, &light, "");

        let dispatch = router.handle(&get("/all_sensors")).unwrap();

        assert_eq!(
            body_json(&dispatch),
            json!({"temperature": 22.5, "distance": null, "turbidity": 1843, "tds": null})
        );
        drop(router);
        assert_eq!(sensors.reads, SensorKind::ALL.to_vec());
    }

    #[test]
    fn all_sensors_failing_is_500() {
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(FixedSensors::new([None; 4]), &light, "");

        assert_eq!(
            router.handle(&get("/all_sensors")).unwrap_err(),
            RouteError::NoData
        );
    }

    #[test]
    fn unknown_path_is_404_and_wrong_method_is_405() {
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(FixedSensors::new(ALL_PRESENT), &light, "");

        assert_eq!(
            router.handle(&get("/nope")).unwrap_err().status(),
            StatusCode::NotFound
        );
        assert_eq!(
            router
                .handle(&request(Method::Post, "/status", ""))
                .unwrap_err()
                .status(),
            StatusCode::MethodNotAllowed
        );
        assert_eq!(
            router.handle(&get("/hardreset")).unwrap_err(),
            RouteError::MethodNotAllowed
        );
    }

    #[test]
    fn reset_with_correct_password_defers_reset() {
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(FixedSensors::new(ALL_PRESENT), &light, "s3cret");

        let dispatch = router
            .handle(&request(Method::Post, "/hardreset", r#"{"password": "s3cret"}"#))
            .unwrap();

        assert_eq!(dispatch.follow_up, Some(FollowUp::Reset));
        assert_eq!(
            body_json(&dispatch),
            json!({"status": "ok", "message": "Device is resetting"})
        );
    }

    #[test]
    fn reset_with_wrong_or_missing_password_is_unauthorized() {
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(FixedSensors::new(ALL_PRESENT), &light, "s3cret");

        for body in [r#"{"password": "guess"}"#, r#"{}"#, r#"{"password": ""}"#] {
            let err = router
                .handle(&request(Method::Post, "/hardreset", body))
                .unwrap_err();
            assert_eq!(err, RouteError::Unauthorized);
            assert_eq!(err.status().code(), 401);
        }
    }

    #[test]
    fn reset_disabled_without_configured_password() {
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(FixedSensors::new(ALL_PRESENT), &light, "");

        let err = router
            .handle(&request(Method::Post, "/hardreset", r#"{"password": ""}"#))
            .unwrap_err();

        assert_eq!(err, RouteError::Unauthorized);
    }

    #[test]
    fn reset_with_invalid_json_is_bad_request() {
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(FixedSensors::new(ALL_PRESENT), &light, "s3cret");

        let err = router
            .handle(&request(Method::Post, "/hardreset", "password=s3cret"))
            .unwrap_err();

        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    struct Wired;

    impl NetworkLink for Wired {
        fn is_connected(&self) -> bool {
            true
        }

        fn local_address(&self) -> Option<String> {
            None
        }
    }

    impl LivenessSignal for Wired {
        fn notify_activity(&self) {}
    }

    /// Records whether a response had been written when the reset fired.
    struct ResetProbe<'a> {
        written: &'a RefCell<Vec<u8>>,
        resets: Cell<usize>,
        written_at_reset: Cell<usize>,
    }

    impl DeviceReset for ResetProbe<'_> {
        fn trigger_reset(&self) {
            self.resets.set(self.resets.get() + 1);
            self.written_at_reset.set(self.written.borrow().len());
        }
    }

    struct Wire<'a> {
        input: Cursor<Vec<u8>>,
        output: &'a RefCell<Vec<u8>>,
    }

    impl Read for Wire<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Wire<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Connection for Wire<'_> {
        fn prepare(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }
    }

    fn exchange(raw: &[u8], password: &str) -> (String, usize, usize) {
        let output = RefCell::new(Vec::new());
        let probe = ResetProbe {
            written: &output,
            resets: Cell::new(0),
            written_at_reset: Cell::new(0),
        };
        let light = RecordingLight::default();
        let mut router = RequestRouter::new(FixedSensors::new(ALL_PRESENT), &light, password);
        let engine = HttpEngine::new(HttpConfig::default(), &Wired, &Wired, &probe);

        let wire = Wire {
            input: Cursor::new(raw.to_vec()),
            output: &output,
        };
        engine.handle(wire, &mut router);

        let text = String::from_utf8(output.borrow().clone()).unwrap();
        (text, probe.resets.get(), probe.written_at_reset.get())
    }

    #[test]
    fn engine_serves_status_and_unknown_paths() {
        let (ok, _, _) = exchange(b"GET /status HTTP/1.1\r\n\r\n", "");
        assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(ok.ends_with("{\"status\":\"ok\"}"));

        let (missing, _, _) = exchange(b"GET /nope HTTP/1.1\r\n\r\n", "");
        assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(missing.ends_with("{\"error\":\"Not Found\"}"));
    }

    #[test]
    fn engine_wrong_password_never_resets() {
        let (text, resets, _) = exchange(
            b"POST /hardreset HTTP/1.1\r\n\r\n{\"password\":\"nope\"}",
            "s3cret",
        );

        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert_eq!(resets, 0);
    }

    #[test]
    fn engine_resets_once_after_response_is_sent() {
        let (text, resets, written_at_reset) = exchange(
            b"POST /hardreset HTTP/1.1\r\n\r\n{\"password\":\"s3cret\"}",
            "s3cret",
        );

        assert!(text.ends_with("\"message\":\"Device is resetting\"}"));
        assert_eq!(resets, 1);
        assert_eq!(written_at_reset, text.len());
    }
}
