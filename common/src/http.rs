//! Single-connection, `Connection: close` HTTP/1.1 subset.
//!
//! One request is served at a time: accept, read once, dispatch, write one
//! response, close. Deferred work (the device reset) runs only after the
//! socket is closed.

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::HttpConfig,
    device::{DeviceReset, LivenessSignal, NetworkLink},
    error::{EngineError, RouteError},
};

const CONTENT_TYPE_JSON: &str = "application/json";
const FALLBACK_ERROR_BODY: &[u8] = br#"{"error":"Internal Server Error"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Other,
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty request")]
    Empty,
    #[error("missing header terminator")]
    MissingDelimiter,
    #[error("malformed request line")]
    MalformedRequestLine,
}

/// Splits a raw request into method, path (query stripped) and body.
/// Headers are ignored.
pub fn parse_request(raw: &[u8]) -> Result<HttpRequest, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Empty);
    }

    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or(ParseError::MissingDelimiter)?;

    let request_line = head.lines().next().unwrap_or_default();
    let mut tokens = request_line.split_whitespace();
    let (Some(method), Some(target)) = (tokens.next(), tokens.next()) else {
        return Err(ParseError::MalformedRequestLine);
    };

    let path = target.split('?').next().unwrap_or(target);

    Ok(HttpRequest {
        method: Method::parse(method),
        path: path.to_string(),
        body: body.trim_end_matches('\0').to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json<T: Serialize>(status: StatusCode, payload: &T) -> Self {
        match serde_json::to_vec(payload) {
            Ok(body) => Self {
                status,
                content_type: CONTENT_TYPE_JSON,
                body,
            },
            Err(err) => {
                warn!("failed to serialize response body: {err}");
                Self {
                    status: StatusCode::InternalServerError,
                    content_type: CONTENT_TYPE_JSON,
                    body: FALLBACK_ERROR_BODY.to_vec(),
                }
            }
        }
    }

    pub fn error(err: &RouteError) -> Self {
        Self::json(err.status(), &err.body())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status.code(),
            self.status.reason(),
            self.content_type,
            self.body.len()
        );

        let mut bytes = Vec::with_capacity(head.len() + self.body.len());
        bytes.extend_from_slice(head.as_bytes());
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Work that must wait until the response has left the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub response: HttpResponse,
    pub follow_up: Option<FollowUp>,
}

impl From<HttpResponse> for Dispatch {
    fn from(response: HttpResponse) -> Self {
        Self {
            response,
            follow_up: None,
        }
    }
}

pub trait RequestHandler {
    fn handle(&mut self, request: &HttpRequest) -> Result<Dispatch, RouteError>;
}

/// A byte stream the engine can serve one request over.
pub trait Connection: Read + Write {
    /// Arms the read/write timeout for every later operation.
    fn prepare(&mut self, timeout: Duration) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for TcpStream {
    fn prepare(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_nonblocking(false)?;
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    /// `None` when nothing was sent back (client gone, transport failure).
    pub status: Option<StatusCode>,
    pub follow_up: Option<FollowUp>,
}

pub struct HttpEngine<'a> {
    config: HttpConfig,
    network: &'a dyn NetworkLink,
    liveness: &'a dyn LivenessSignal,
    reset: &'a dyn DeviceReset,
}

impl<'a> HttpEngine<'a> {
    pub fn new(
        config: HttpConfig,
        network: &'a dyn NetworkLink,
        liveness: &'a dyn LivenessSignal,
        reset: &'a dyn DeviceReset,
    ) -> Self {
        Self {
            config,
            network,
            liveness,
            reset,
        }
    }

    /// Binds `0.0.0.0:<port>`, refusing to do so while the network is down.
    pub fn listen(&self) -> Result<TcpListener, EngineError> {
        self.listen_on(SocketAddr::from(([0, 0, 0, 0], self.config.port)))
    }

    pub fn listen_on(&self, addr: SocketAddr) -> Result<TcpListener, EngineError> {
        if !self.network.is_connected() {
            return Err(EngineError::NetworkDown);
        }

        let listener = TcpListener::bind(addr).map_err(|source| EngineError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        // Polled so the liveness signal keeps flowing while idle.
        listener.set_nonblocking(true)?;

        let bound = listener.local_addr()?;
        info!(
            "http server listening on {}:{}",
            self.network
                .local_address()
                .unwrap_or_else(|| bound.ip().to_string()),
            bound.port()
        );
        Ok(listener)
    }

    /// Serves connections until the network link drops.
    pub fn serve<H: RequestHandler>(
        &self,
        listener: &TcpListener,
        handler: &mut H,
    ) -> Result<(), EngineError> {
        loop {
            if !self.network.is_connected() {
                warn!("network link lost; leaving accept loop");
                return Err(EngineError::NetworkDown);
            }
            self.poll_once(listener, handler);
        }
    }

    /// One accept attempt. Returns the report when a connection was served.
    pub fn poll_once<H: RequestHandler>(
        &self,
        listener: &TcpListener,
        handler: &mut H,
    ) -> Option<ConnectionReport> {
        self.liveness.notify_activity();

        match listener.accept() {
            Ok((stream, peer)) => {
                info!("connection from {peer}");
                self.liveness.notify_activity();
                Some(self.handle(stream, handler))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(self.config.accept_retry_delay());
                None
            }
            Err(err) => {
                warn!("accept failed: {err}");
                thread::sleep(self.config.accept_retry_delay());
                None
            }
        }
    }

    /// Serves `conn`, drops it, then runs any deferred follow-up.
    pub fn handle<C: Connection, H: RequestHandler>(
        &self,
        mut conn: C,
        handler: &mut H,
    ) -> ConnectionReport {
        let report = self.serve_connection(&mut conn, handler);
        drop(conn);
        self.run_follow_up(report.follow_up);
        report
    }

    /// Runs one request/response exchange and always closes the connection.
    pub fn serve_connection<C: Connection, H: RequestHandler>(
        &self,
        conn: &mut C,
        handler: &mut H,
    ) -> ConnectionReport {
        let report = self.exchange(conn, handler);

        if let Err(err) = conn.close() {
            debug!("error while closing connection: {err}");
        }

        report
    }

    fn exchange<C: Connection, H: RequestHandler>(
        &self,
        conn: &mut C,
        handler: &mut H,
    ) -> ConnectionReport {
        let mut report = ConnectionReport {
            status: None,
            follow_up: None,
        };

        if let Err(err) = conn.prepare(self.config.client_timeout()) {
            warn!("failed to arm connection timeout: {err}");
            return report;
        }

        let mut buffer = vec![0_u8; self.config.max_request_bytes];
        let read = match conn.read(&mut buffer) {
            Ok(0) => {
                debug!("client closed before sending a request");
                return report;
            }
            Ok(read) => read,
            Err(err) => {
                warn!("failed to read request: {err}");
                return report;
            }
        };

        let dispatch = match parse_request(&buffer[..read]) {
            Ok(request) => {
                info!("{:?} {}", request.method, request.path);
                match handler.handle(&request) {
                    Ok(dispatch) => dispatch,
                    Err(err) => {
                        warn!("{} {} -> {err}", err.status().code(), request.path);
                        HttpResponse::error(&err).into()
                    }
                }
            }
            Err(err) => {
                warn!("rejecting request: {err}");
                HttpResponse::error(&RouteError::BadRequest("Malformed request".into())).into()
            }
        };

        let bytes = dispatch.response.to_bytes();
        if let Err(err) = conn.write_all(&bytes).and_then(|()| conn.flush()) {
            warn!("failed to send response: {err}");
            return report;
        }

        report.status = Some(dispatch.response.status);
        report.follow_up = dispatch.follow_up;
        report
    }

    fn run_follow_up(&self, follow_up: Option<FollowUp>) {
        match follow_up {
            Some(FollowUp::Reset) => {
                warn!("reset requested over http; restarting");
                self.reset.trigger_reset();
            }
            None => {}
        }
    }
}
