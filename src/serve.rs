//! Minimalist HTTP/1.1 responder for the health endpoint.
//!
//! One request at a time, GET only: parse the request line and the
//! `key: value` headers (capped), hand the request to the handler, write the
//! response, close. The accept loop polls at one-second granularity against
//! an external exit flag.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socket2::{Domain, Socket, Type};

pub const DEFAULT_MAX_HEADERS: usize = 32;
pub const DEFAULT_REQBUF_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    BadRequest,
    NotFound,
    Error,
    Unimplemented,
}

impl ResponseCode {
    fn status_line(self) -> &'static str {
        match self {
            ResponseCode::Ok => "HTTP/1.1 200 OK",
            ResponseCode::BadRequest => "HTTP/1.1 400 Bad Request",
            ResponseCode::NotFound => "HTTP/1.1 404 Not Found",
            ResponseCode::Error => "HTTP/1.1 500 Internal Server Error",
            ResponseCode::Unimplemented => "HTTP/1.1 501 Not Implemented",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub resource: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub code: ResponseCode,
    pub content_type: String,
    pub content: String,
}

impl Response {
    pub fn ok(content_type: &str, content: String) -> Response {
        Response { code: ResponseCode::Ok, content_type: content_type.into(), content }
    }

    pub fn code(code: ResponseCode) -> Response {
        Response { code, content_type: "text/plain".into(), content: String::new() }
    }
}

pub type Handler = Box<dyn Fn(&Request) -> Response + Send + Sync>;

pub struct HttpServer {
    listener: TcpListener,
    max_headers: usize,
    reqbuf_size: usize,
}

impl HttpServer {
    /// Bind the status port (0 picks an ephemeral port).
    pub fn bind(port: u16) -> io::Result<HttpServer> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&addr.into())?;
        socket.listen(10)?;
        let listener: TcpListener = socket.into();
        info!("[serve] listening on port {}", listener.local_addr()?.port());
        Ok(HttpServer {
            listener,
            max_headers: DEFAULT_MAX_HEADERS,
            reqbuf_size: DEFAULT_REQBUF_SIZE,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Accept and answer requests until `exit` is set. The flag is checked
    /// at least once per second. Returns the number of requests served.
    pub fn run(&self, handler: &Handler, exit: &Arc<AtomicBool>) -> usize {
        let mut nrequests = 0;
        let mut reqbuf = vec![0u8; self.reqbuf_size];

        while !exit.load(Ordering::Acquire) {
            let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(1000u16)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    error!("[serve] poll: {}", e);
                    continue;
                }
            }

            let (mut stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("[serve] accept: {}", e);
                    continue;
                }
            };
            debug!("[serve] request from {}", peer);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));

            let n = match stream.read(&mut reqbuf) {
                Ok(n) if n > 0 => n,
                _ => continue,
            };

            match self.parse(&reqbuf[..n]) {
                Ok(req) => {
                    let resp = handler(&req);
                    Self::send(&mut stream, &resp);
                }
                Err(code) => Self::send(&mut stream, &Response::code(code)),
            }
            nrequests += 1;
        }
        nrequests
    }

    fn parse(&self, raw: &[u8]) -> Result<Request, ResponseCode> {
        let text = std::str::from_utf8(raw).map_err(|_| ResponseCode::BadRequest)?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or(ResponseCode::BadRequest)?;
        let mut parts = request_line.split(' ');
        let method = parts.next().ok_or(ResponseCode::BadRequest)?;
        let resource = parts.next().ok_or(ResponseCode::BadRequest)?;
        let version = parts.next().ok_or(ResponseCode::BadRequest)?;
        if !version.starts_with("HTTP/1") {
            return Err(ResponseCode::BadRequest);
        }
        if method != "GET" {
            return Err(ResponseCode::Unimplemented);
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() || headers.len() >= self.max_headers {
                break;
            }
            if let Some((key, val)) = line.split_once(':') {
                headers.push((key.trim().to_string(), val.trim().to_string()));
            }
        }

        Ok(Request { resource: resource.to_string(), headers })
    }

    fn send(stream: &mut TcpStream, resp: &Response) {
        // every code carries its content; a diagnostic body on an error
        // reply is as valid as a payload on 200
        let out = format!(
            "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            resp.code.status_line(),
            resp.content_type,
            resp.content.len(),
            resp.content
        );
        if let Err(e) = stream.write_all(out.as_bytes()) {
            debug!("[serve] send: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;
    use std::thread;

    fn get(port: u16, raw: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut out = String::new();
        BufReader::new(stream).read_to_string(&mut out).unwrap();
        out
    }

    fn spawn_server(handler: Handler) -> (u16, Arc<AtomicBool>, thread::JoinHandle<usize>) {
        let server = HttpServer::bind(0).unwrap();
        let port = server.local_port();
        let exit = Arc::new(AtomicBool::new(false));
        let exit2 = exit.clone();
        let join = thread::spawn(move || server.run(&handler, &exit2));
        (port, exit, join)
    }

    #[test]
    fn serves_handler_content_with_length() {
        let (port, exit, join) = spawn_server(Box::new(|req| {
            if req.resource == "/" {
                Response::ok("application/json", "{\"state\":\"running\"}".into())
            } else {
                Response::code(ResponseCode::NotFound)
            }
        }));

        let reply = get(port, "GET / HTTP/1.1\r\nHost: x\r\nUser-Agent: t\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.contains("Content-Length: 19"));
        assert!(reply.ends_with("{\"state\":\"running\"}"));

        let reply = get(port, "GET /nope HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 404"));

        let reply = get(port, "POST / HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 501"));

        let reply = get(port, "garbage\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 400"));

        exit.store(true, Ordering::Release);
        let served = join.join().unwrap();
        assert_eq!(served, 4);
    }

    #[test]
    fn error_replies_carry_their_diagnostic_body() {
        let (port, exit, join) = spawn_server(Box::new(|_| Response {
            code: ResponseCode::NotFound,
            content_type: "text/plain".into(),
            content: "no such resource".into(),
        }));
        let reply = get(port, "GET /missing HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 404"));
        assert!(reply.contains("Content-Length: 16"));
        assert!(reply.ends_with("no such resource"));
        exit.store(true, Ordering::Release);
        join.join().unwrap();
    }

    #[test]
    fn handler_sees_parsed_headers() {
        let (port, exit, join) = spawn_server(Box::new(|req| {
            let ua = req.header("user-agent").unwrap_or("none").to_string();
            Response::ok("text/plain", ua)
        }));
        let reply = get(port, "GET / HTTP/1.1\r\nUser-Agent: probe/1.0\r\n\r\n");
        assert!(reply.ends_with("probe/1.0"));
        exit.store(true, Ordering::Release);
        join.join().unwrap();
    }

    #[test]
    fn exit_flag_stops_the_accept_loop() {
        let (_port, exit, join) = spawn_server(Box::new(|_| Response::code(ResponseCode::Ok)));
        exit.store(true, Ordering::Release);
        // the loop notices within its one-second poll
        join.join().unwrap();
    }
}
