//! Blocking mock servers for end-to-end tests.
use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};

use crate::websocket::{
    frame::{decode, encode, Frame, OpCode},
    handshake::accept_key,
};

const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) version: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
    /// Which accepted connection carried the request.
    pub(crate) connection: usize,
}

impl RecordedRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn wants_close(&self) -> bool {
        match self.header("connection") {
            Some(v) => v.eq_ignore_ascii_case("close"),
            None => self.version == "HTTP/1.0",
        }
    }
}

pub(crate) enum MockResponse {
    Reply {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    /// Never answer; hold the connection until the client drops it.
    Hang,
    /// Drop the connection without answering.
    Close,
    Delay(Duration, Box<MockResponse>),
    /// Announce `bytes` of body and send one byte per `every`.
    Trickle { bytes: usize, every: Duration },
}

impl MockResponse {
    pub(crate) fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        MockResponse::Reply {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub(crate) fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200, body)
    }

    pub(crate) fn redirect(status: u16, location: &str) -> Self {
        Self::status(status, Vec::new()).with_header("location", location)
    }

    pub(crate) fn with_header(mut self, name: &str, value: &str) -> Self {
        if let MockResponse::Reply { headers, .. } = &mut self {
            headers.push((name.to_string(), value.to_string()));
        }
        self
    }
}

type Handler = dyn Fn(&RecordedRequest) -> MockResponse + Send + Sync;

#[derive(Default)]
struct Recorded {
    requests: Mutex<Vec<RecordedRequest>>,
    arrived: Condvar,
}

/// HTTP/1.1 server answering every request through a handler, with keep-alive.
pub(crate) struct MockServer {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
}

impl MockServer {
    pub(crate) fn start(
        handler: impl Fn(&RecordedRequest) -> MockResponse + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Recorded::default());
        let handler: Arc<Handler> = Arc::new(handler);
        let connections = AtomicUsize::new(0);
        {
            let recorded = recorded.clone();
            thread::spawn(move || {
                for socket in listener.incoming() {
                    let Ok(socket) = socket else { return };
                    let id = connections.fetch_add(1, Ordering::SeqCst);
                    let recorded = recorded.clone();
                    let handler = handler.clone();
                    thread::spawn(move || {
                        let _ = serve_connection(socket, id, &recorded, handler.as_ref());
                    });
                }
            });
        }
        Self { addr, recorded }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn wait_for_requests(&self, count: usize) {
        let deadline = Instant::now() + WAIT;
        let mut requests = self.recorded.requests.lock();
        while requests.len() < count {
            if self
                .recorded
                .arrived
                .wait_until(&mut requests, deadline)
                .timed_out()
            {
                panic!("expected {count} requests, got {}", requests.len());
            }
        }
    }

    pub(crate) fn request(&self, idx: usize) -> RecordedRequest {
        self.wait_for_requests(idx + 1);
        self.recorded.requests.lock()[idx].clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.recorded.requests.lock().len()
    }
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn read_head(reader: &mut impl BufRead) -> io::Result<Option<(String, Vec<(String, String)>)>> {
    let Some(start) = read_line(reader)? else {
        return Ok(None);
    };
    let mut headers = Vec::new();
    while let Some(line) = read_line(reader)? {
        if line.is_empty() {
            return Ok(Some((start, headers)));
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(None)
}

fn read_request(
    reader: &mut impl BufRead,
    connection: usize,
) -> io::Result<Option<RecordedRequest>> {
    let Some((start, headers)) = read_head(reader)? else {
        return Ok(None);
    };
    let mut parts = start.split(' ');
    let mut request = RecordedRequest {
        method: parts.next().unwrap_or_default().to_string(),
        path: parts.next().unwrap_or_default().to_string(),
        version: parts.next().unwrap_or_default().to_string(),
        headers,
        body: Vec::new(),
        connection,
    };
    if request
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        loop {
            let size_line = read_line(reader)?.unwrap_or_default();
            let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("0").trim(), 16)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if size == 0 {
                // Trailers end with an empty line.
                while !read_line(reader)?.unwrap_or_default().is_empty() {}
                break;
            }
            let mut chunk = vec![0; size + 2];
            reader.read_exact(&mut chunk)?;
            request.body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(len) = request
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        request.body = vec![0; len];
        reader.read_exact(&mut request.body)?;
    }
    Ok(Some(request))
}

fn reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

fn serve_connection(
    socket: TcpStream,
    id: usize,
    recorded: &Recorded,
    handler: &Handler,
) -> io::Result<()> {
    let mut writer = socket.try_clone()?;
    let mut reader = BufReader::new(socket);
    while let Some(request) = read_request(&mut reader, id)? {
        let close = request.wants_close();
        let mut response = handler(&request);
        {
            recorded.requests.lock().push(request);
            recorded.arrived.notify_all();
        }
        loop {
            match response {
                MockResponse::Delay(delay, inner) => {
                    thread::sleep(delay);
                    response = *inner;
                }
                MockResponse::Hang => {
                    let mut sink = [0u8; 1024];
                    while reader.read(&mut sink)? > 0 {}
                    return Ok(());
                }
                MockResponse::Close => return Ok(()),
                MockResponse::Trickle { bytes, every } => {
                    write!(writer, "HTTP/1.1 200 OK\r\nContent-Length: {bytes}\r\n\r\n")?;
                    for _ in 0..bytes {
                        thread::sleep(every);
                        writer.write_all(b"x")?;
                    }
                    break;
                }
                MockResponse::Reply {
                    status,
                    headers,
                    body,
                } => {
                    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason(status));
                    for (name, value) in &headers {
                        head.push_str(&format!("{name}: {value}\r\n"));
                    }
                    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
                    if close {
                        head.push_str("Connection: close\r\n");
                    }
                    head.push_str("\r\n");
                    writer.write_all(head.as_bytes())?;
                    writer.write_all(&body)?;
                    break;
                }
            }
        }
        if close {
            return Ok(());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum MockWsBehavior {
    /// Echo data frames, answer pings, answer a close and hang up.
    Echo,
    /// Send `1001 going away` right after the upgrade and wait for the echo.
    CloseAfterHandshake,
    /// Ping right after the upgrade, report the pong as text, then echo.
    PingAfterHandshake,
    /// Send one text message in two fragments, then echo.
    Fragmented,
    /// Read everything, answer nothing.
    IgnoreClose,
    /// Answer the upgrade with `400`.
    Refuse,
    /// Drop the connection right after the upgrade, without a close frame.
    HangUp,
    /// Answer a close, then keep the socket open for the given time.
    LingerAfterClose(Duration),
}

/// WebSocket server on a plain TCP socket, one thread per connection.
pub(crate) struct MockWsServer {
    addr: SocketAddr,
    echoed_close: Arc<(Mutex<Option<u16>>, Condvar)>,
}

impl MockWsServer {
    pub(crate) fn start(behavior: MockWsBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let echoed_close = Arc::new((Mutex::new(None), Condvar::new()));
        {
            let echoed_close = echoed_close.clone();
            thread::spawn(move || {
                for socket in listener.incoming() {
                    let Ok(socket) = socket else { return };
                    let echoed_close = echoed_close.clone();
                    thread::spawn(move || {
                        let _ = serve_ws(socket, behavior, &echoed_close);
                    });
                }
            });
        }
        Self { addr, echoed_close }
    }

    pub(crate) fn uri(&self) -> String {
        format!("ws://127.0.0.1:{}/socket", self.addr.port())
    }

    /// Status code of the close frame the client answered with.
    pub(crate) fn echoed_close(&self) -> Option<u16> {
        let (code, arrived) = &*self.echoed_close;
        let deadline = Instant::now() + WAIT;
        let mut code = code.lock();
        while code.is_none() {
            if arrived.wait_until(&mut code, deadline).timed_out() {
                break;
            }
        }
        *code
    }
}

struct WsPeer {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    buf: BytesMut,
}

impl WsPeer {
    fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let wire = encode(frame, None).map_err(|e| io::Error::other(e.to_string()))?;
        self.writer.write_all(&wire)
    }

    fn recv(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(mut frame) = decode(&mut self.buf, 1 << 24)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            {
                if let Some(key) = frame.mask.take() {
                    let plain: Vec<u8> =
                        frame.payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect();
                    frame.payload = plain.into();
                }
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Echo until the client closes.
    fn echo(&mut self) -> io::Result<()> {
        while let Some(frame) = self.recv()? {
            match frame.opcode {
                OpCode::Ping => self.send(&Frame::new(OpCode::Pong, frame.payload))?,
                OpCode::Pong => {
                    let text = format!("pong:{}", String::from_utf8_lossy(&frame.payload));
                    self.send(&Frame::new(OpCode::Text, text))?;
                }
                OpCode::Close => {
                    self.send(&Frame::new(OpCode::Close, frame.payload))?;
                    return self.writer.shutdown(std::net::Shutdown::Both);
                }
                _ => {
                    let mut echo = Frame::new(frame.opcode, frame.payload);
                    echo.fin = frame.fin;
                    self.send(&echo)?;
                }
            }
        }
        Ok(())
    }
}

fn serve_ws(
    socket: TcpStream,
    behavior: MockWsBehavior,
    echoed_close: &(Mutex<Option<u16>>, Condvar),
) -> io::Result<()> {
    let mut writer = socket.try_clone()?;
    let mut reader = BufReader::new(socket);
    let Some((_, headers)) = read_head(&mut reader)? else {
        return Ok(());
    };
    if let MockWsBehavior::Refuse = behavior {
        writer.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")?;
        return Ok(());
    }
    let key = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("sec-websocket-key"))
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    write!(
        writer,
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    )?;

    let mut peer = WsPeer {
        reader,
        writer,
        buf: BytesMut::new(),
    };
    match behavior {
        MockWsBehavior::Echo => peer.echo(),
        MockWsBehavior::CloseAfterHandshake => {
            let close = Frame::close(Some(1001), "going away")
                .map_err(|e| io::Error::other(e.to_string()))?;
            peer.send(&close)?;
            while let Some(frame) = peer.recv()? {
                if frame.opcode == OpCode::Close {
                    let code = frame.close_reason().ok().and_then(|(code, _)| code);
                    let (slot, arrived) = echoed_close;
                    *slot.lock() = code;
                    arrived.notify_all();
                    break;
                }
            }
            peer.writer.shutdown(std::net::Shutdown::Both)
        }
        MockWsBehavior::PingAfterHandshake => {
            peer.send(&Frame::new(OpCode::Ping, "are-you-there"))?;
            peer.echo()
        }
        MockWsBehavior::Fragmented => {
            let mut first = Frame::new(OpCode::Text, "frag");
            first.fin = false;
            peer.send(&first)?;
            peer.send(&Frame::new(OpCode::Continuation, "ment"))?;
            peer.echo()
        }
        MockWsBehavior::IgnoreClose => {
            while peer.recv()?.is_some() {}
            Ok(())
        }
        MockWsBehavior::HangUp => peer.writer.shutdown(std::net::Shutdown::Both),
        MockWsBehavior::LingerAfterClose(linger) => {
            while let Some(frame) = peer.recv()? {
                if frame.opcode == OpCode::Close {
                    peer.send(&Frame::new(OpCode::Close, frame.payload))?;
                    thread::sleep(linger);
                    break;
                }
            }
            peer.writer.shutdown(std::net::Shutdown::Both)
        }
        MockWsBehavior::Refuse => Ok(()),
    }
}
