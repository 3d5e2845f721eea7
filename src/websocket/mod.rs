//! WebSocket sessions.
//!
//! A [`WebSocketSession`] moves through
//! `Created -> Connecting -> Open -> Closing -> Closed`. The upgrade runs on
//! an I/O thread like any other execution; once open, the same thread owns
//! the channel, writes queued outbound frames and reads inbound ones.
//! Listener notifications for one session run in order on the callback
//! executor.
pub(crate) mod frame;
pub(crate) mod handshake;

use std::{
    fmt, io,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, Splitable};
use monoio_http::h1::codec::encoder::GenericEncoder;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use self::frame::{decode, encode, mask_key, Frame, OpCode, MAX_CONTROL_PAYLOAD};
use crate::{
    backpressure::{admit, Admission, AdmissionGuard},
    client::ClientShared,
    connectors::{ConnectorExt, Stream},
    error::{HttpError, Result},
    event::{EventEmitter, EventKind},
    executor::{CallbackExecutor, OrderedExecutor},
    future::{result_channel, CancelToken, ResultFuture, ResultSlot},
    http::{send_request, Activity},
    key::Key,
    request::{resolve, ResolvedTarget},
    runtime::{IoContext, Job},
};

const READ_CHUNK: usize = 16 * 1024;
const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Created,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl WebSocketState {
    pub fn as_str(self) -> &'static str {
        match self {
            WebSocketState::Created => "CREATED",
            WebSocketState::Connecting => "CONNECTING",
            WebSocketState::Open => "OPEN",
            WebSocketState::Closing => "CLOSING",
            WebSocketState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for WebSocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives session notifications. Every method has an empty default.
///
/// Text and binary frames are delivered as they arrive, with their
/// final-fragment flag and reserved bits; fragments are not reassembled.
/// Continuation frames are reported with the kind of the message they
/// continue.
#[allow(unused_variables)]
pub trait WebSocketListener: Send + Sync + 'static {
    fn on_connect(&self, session: &WebSocketSession) {}
    fn on_text_frame(
        &self,
        session: &WebSocketSession,
        text: &str,
        final_fragment: bool,
        rsv: u8,
    ) {
    }
    fn on_binary_frame(
        &self,
        session: &WebSocketSession,
        payload: &[u8],
        final_fragment: bool,
        rsv: u8,
    ) {
    }
    fn on_ping_frame(&self, session: &WebSocketSession, payload: &[u8]) {}
    fn on_pong_frame(&self, session: &WebSocketSession, payload: &[u8]) {}
    fn on_close_frame(&self, session: &WebSocketSession, code: Option<u16>, reason: &str) {}
    fn on_error(&self, session: &WebSocketSession, error: &HttpError) {}
    fn on_disconnect(&self, session: &WebSocketSession) {}
}

/// Frozen session configuration.
struct SessionSpec {
    uri: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    query: Vec<(String, String)>,
    idle_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    max_frame_size: usize,
    close_timeout: Duration,
    executor: Arc<dyn CallbackExecutor>,
}

struct SessionState {
    state: WebSocketState,
    close_sent: bool,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

struct SessionInner {
    shared: Arc<ClientShared>,
    spec: SessionSpec,
    state: Mutex<SessionState>,
    closed: Condvar,
    listeners: Mutex<Vec<Arc<dyn WebSocketListener>>>,
    dispatcher: OrderedExecutor,
    events: EventEmitter,
    token: Arc<CancelToken>,
}

/// Handle to one WebSocket session. Clones refer to the same session.
#[derive(Clone)]
pub struct WebSocketSession {
    inner: Arc<SessionInner>,
}

impl WebSocketSession {
    fn new(
        shared: Arc<ClientShared>,
        spec: SessionSpec,
        listeners: Vec<Arc<dyn WebSocketListener>>,
    ) -> Self {
        let dispatcher = OrderedExecutor::new(spec.executor.clone());
        let events = shared.emitter();
        Self {
            inner: Arc::new(SessionInner {
                shared,
                spec,
                state: Mutex::new(SessionState {
                    state: WebSocketState::Created,
                    close_sent: false,
                    outbound: None,
                }),
                closed: Condvar::new(),
                listeners: Mutex::new(listeners),
                dispatcher,
                events,
                token: Arc::new(CancelToken::new()),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.events.id()
    }

    pub fn state(&self) -> WebSocketState {
        self.inner.state.lock().state
    }

    /// Register another listener. It receives every event dispatched after
    /// this call, whatever the current state.
    pub fn add_listener(&self, listener: impl WebSocketListener) -> &Self {
        self.inner.listeners.lock().push(Arc::new(listener));
        self
    }

    /// Start the upgrade. Only valid from `Created`; any later call fails
    /// immediately with [`HttpError::WebSocketState`].
    pub fn connect(&self) -> Result<ResultFuture<WebSocketSession>> {
        {
            let mut st = self.inner.state.lock();
            if st.state != WebSocketState::Created {
                return Err(HttpError::WebSocketState {
                    state: st.state.as_str(),
                    action: "connect",
                });
            }
            st.state = WebSocketState::Connecting;
        }
        self.inner.events.emit(EventKind::WsUpgradePipeline);

        let (slot, future) = result_channel(self.inner.spec.executor.clone(), None);
        let connect_token = future.token().clone();
        let shared = &self.inner.shared;

        let target = match resolve(&self.inner.spec.uri, &self.inner.spec.query) {
            Ok(target) => target,
            Err(e) => {
                self.fail_connect(&connect_token, slot, e);
                return Ok(future);
            }
        };
        let deadline = self.inner.spec.total_timeout.map(|total| Instant::now() + total);
        let admission = Admission::new(self.id(), connect_token.clone());
        let guard = match admit(&shared.back_pressure, admission) {
            Ok(guard) => guard,
            Err(e) => {
                self.fail_connect(&connect_token, slot, e);
                return Ok(future);
            }
        };

        let upgrade = Upgrade {
            session: self.clone(),
            target,
            guard,
            connect_token,
            deadline,
        };
        let job = Job::new(self.inner.token.clone(), move |ctx| Box::pin(upgrade.run(ctx, slot)));
        if !shared.workers.dispatch(job) {
            #[cfg(feature = "logging")]
            tracing::debug!("client shut down, websocket {} not connected", self.id());
            self.set_closed();
        }
        Ok(future)
    }

    fn fail_connect(
        &self,
        connect_token: &CancelToken,
        slot: ResultSlot<WebSocketSession>,
        error: HttpError,
    ) {
        #[cfg(feature = "logging")]
        tracing::debug!("websocket {} failed to connect: {error}", self.id());
        connect_token.finish();
        self.inner.token.finish();
        self.set_closed();
        self.inner.events.emit(EventKind::Failed);
        let err = error.clone();
        self.dispatch(move |l, s| l.on_error(s, &err));
        slot.complete(Err(error));
    }

    pub fn send_text_frame(&self, text: impl Into<String>) -> Result<()> {
        self.send(Frame::new(OpCode::Text, text.into()), "send text frame")
    }

    pub fn send_binary_frame(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(Frame::new(OpCode::Binary, payload.into()), "send binary frame")
    }

    pub fn send_ping_frame(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(HttpError::Configuration("ping payload exceeds 125 bytes".into()));
        }
        self.send(Frame::new(OpCode::Ping, payload), "send ping frame")
    }

    /// Start the close handshake with status 1000.
    pub fn send_close_frame(&self) -> Result<()> {
        self.send_close_frame_with(NORMAL_CLOSURE, "")
    }

    /// Start the close handshake. Valid only while `Open`.
    pub fn send_close_frame_with(&self, code: u16, reason: &str) -> Result<()> {
        let frame = Frame::close(Some(code), reason)?;
        let mut st = self.inner.state.lock();
        Self::enqueue(&st, frame, "send close frame")?;
        st.state = WebSocketState::Closing;
        st.close_sent = true;
        Ok(())
    }

    fn send(&self, frame: Frame, action: &'static str) -> Result<()> {
        let st = self.inner.state.lock();
        Self::enqueue(&st, frame, action)
    }

    fn enqueue(st: &SessionState, frame: Frame, action: &'static str) -> Result<()> {
        if st.state != WebSocketState::Open {
            return Err(HttpError::WebSocketState {
                state: st.state.as_str(),
                action,
            });
        }
        match &st.outbound {
            Some(tx) => tx.send(frame).map_err(|_| HttpError::ClientShutdown),
            None => Err(HttpError::ClientShutdown),
        }
    }

    /// Block until the session is `Closed`. Returns at once for a session
    /// that is already closed or was never connected. Never call this from
    /// an I/O thread.
    pub fn await_close(&self) {
        let mut st = self.inner.state.lock();
        while !matches!(st.state, WebSocketState::Closed | WebSocketState::Created) {
            self.inner.closed.wait(&mut st);
        }
    }

    /// Like [`await_close`](Self::await_close), giving up after `timeout`.
    /// Returns whether the session is closed.
    pub fn await_close_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock();
        while !matches!(st.state, WebSocketState::Closed | WebSocketState::Created) {
            if self.inner.closed.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        st.state == WebSocketState::Closed
    }

    fn set_closed(&self) {
        let mut st = self.inner.state.lock();
        st.state = WebSocketState::Closed;
        st.outbound = None;
        self.inner.closed.notify_all();
    }

    /// Run `notify` for every listener registered when the task runs.
    fn dispatch<F>(&self, notify: F)
    where
        F: Fn(&dyn WebSocketListener, &WebSocketSession) + Send + 'static,
    {
        let session = self.clone();
        self.inner.dispatcher.execute(Box::new(move || {
            let listeners = session.inner.listeners.lock().clone();
            for listener in &listeners {
                notify(listener.as_ref(), &session);
            }
        }));
    }
}

impl fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("id", &self.id())
            .field("uri", &self.inner.spec.uri)
            .field("state", &self.state())
            .finish()
    }
}

/// The upgrade of one session, run on an I/O thread.
struct Upgrade {
    session: WebSocketSession,
    target: ResolvedTarget,
    guard: AdmissionGuard,
    connect_token: Arc<CancelToken>,
    deadline: Option<Instant>,
}

impl Upgrade {
    async fn run(self, ctx: Rc<IoContext>, slot: ResultSlot<WebSocketSession>) {
        let Upgrade {
            session,
            target,
            guard,
            connect_token,
            deadline,
        } = self;
        let inner = &session.inner;

        let outcome = {
            let handshake = async {
                match (deadline, inner.spec.total_timeout) {
                    (Some(deadline), Some(total)) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        let opening = handshake(&ctx, &session, &target, guard.admission());
                        monoio::time::timeout(remaining, opening)
                            .await
                            .unwrap_or(Err(HttpError::TotalTimeout(total)))
                    }
                    _ => handshake(&ctx, &session, &target, guard.admission()).await,
                }
            };
            monoio::select! {
                outcome = handshake => outcome,
                reason = connect_token.cancelled() => Err(reason.into_error()),
                reason = inner.token.cancelled() => Err(reason.into_error()),
            }
        };
        drop(guard);

        let (stream, leftover) = match outcome {
            Ok(opened) => opened,
            Err(e) => {
                session.fail_connect(&connect_token, slot, e);
                return;
            }
        };
        connect_token.finish();

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = inner.state.lock();
            st.state = WebSocketState::Open;
            st.outbound = Some(tx);
        }
        #[cfg(feature = "logging")]
        tracing::debug!("websocket {} open to {}", session.id(), target.server);
        inner.events.emit(EventKind::WsOpened);
        session.dispatch(|l, s| l.on_connect(s));
        slot.complete(Ok(session.clone()));

        let error = Connection::new(&session).run(stream, leftover, rx).await.err();

        inner.token.finish();
        session.set_closed();
        #[cfg(feature = "logging")]
        tracing::debug!("websocket {} closed", session.id());
        inner.events.emit(EventKind::WsClosed);
        if let Some(e) = error {
            session.dispatch(move |l, s| l.on_error(s, &e));
        }
        session.dispatch(|l, s| l.on_disconnect(s));
    }
}

async fn handshake(
    ctx: &IoContext,
    session: &WebSocketSession,
    target: &ResolvedTarget,
    admission: &Admission,
) -> Result<(Stream, BytesMut)> {
    let spec = &session.inner.spec;
    let key = Key::try_from(&target.server)?;
    let mut stream = match ctx.raw.connect_with_timeout(key.clone(), ctx.connect_timeout).await {
        Ok(stream) => stream?,
        Err(_) => {
            return Err(HttpError::ConnectTimeout {
                addr: key.to_string(),
                timeout: ctx.connect_timeout,
            })
        }
    };
    session.inner.events.emit(EventKind::ConnectionAcquired);

    let nonce = handshake::generate_key();
    let request = handshake::upgrade_request(
        &target.path,
        &spec.headers,
        &target.server,
        &session.inner.shared.user_agent,
        &nonce,
    )?;
    admission.mark_writing();
    {
        let mut encoder = GenericEncoder::new(&mut stream);
        Activity::new()
            .watch(spec.idle_timeout, send_request(&mut encoder, request))
            .await??;
    }
    session.inner.events.emit(EventKind::HeadersWritten);

    let (head, leftover) = handshake::read_response(&mut stream, spec.idle_timeout).await?;
    session.inner.events.emit(EventKind::ResponseHeadersReceived);
    handshake::validate(&head, &nonce)?;
    Ok((stream, leftover))
}

async fn read_frames<R: AsyncReadRent>(
    mut reader: R,
    mut buf: BytesMut,
    max_frame_size: usize,
    tx: mpsc::UnboundedSender<Result<Frame>>,
) {
    loop {
        match decode(&mut buf, max_frame_size) {
            Ok(Some(frame)) => {
                if tx.send(Ok(frame)).is_err() {
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
        let (res, chunk) = reader.read(Vec::with_capacity(READ_CHUNK)).await;
        match res {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n.min(chunk.len())]),
            Err(e) => {
                let _ = tx.send(Err(e.into()));
                return;
            }
        }
    }
}

/// Frame exchange on an open session.
struct Connection<'a> {
    session: &'a WebSocketSession,
    /// Kind of the fragmented message in progress.
    message: Option<OpCode>,
    close_written: bool,
    close_received: bool,
    close_deadline: Option<Instant>,
    shut_down: bool,
}

impl<'a> Connection<'a> {
    fn new(session: &'a WebSocketSession) -> Self {
        Self {
            session,
            message: None,
            close_written: false,
            close_received: false,
            close_deadline: None,
            shut_down: false,
        }
    }

    #[inline]
    fn handshake_done(&self) -> bool {
        self.close_written && self.close_received
    }

    async fn run(
        mut self,
        stream: Stream,
        leftover: BytesMut,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Result<()> {
        let session = self.session;
        let inner = &session.inner;
        let (reader, mut writer) = stream.into_split();
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let max_frame_size = inner.spec.max_frame_size;
        monoio::spawn(async move {
            monoio::select! {
                _ = read_frames(reader, leftover, max_frame_size, inbound_tx) => {},
                _ = stop_rx => {},
            }
        });

        let outcome = loop {
            let close_timer = close_timer(self.close_deadline);
            let step = monoio::select! {
                frame = outbound.recv(), if !self.shut_down => match frame {
                    Some(frame) => self.write(&mut writer, frame).await,
                    None => Ok(()),
                },
                frame = inbound.recv() => match frame {
                    Some(Ok(frame)) => self.receive(&mut writer, frame).await,
                    Some(Err(_)) | None if self.close_received => break Ok(()),
                    Some(Err(e)) => Err(e),
                    // Hung up without a close frame.
                    None => {
                        let eof = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed the connection without a close frame",
                        );
                        break Err(eof.into());
                    }
                },
                _ = close_timer => {
                    #[cfg(feature = "logging")]
                    tracing::debug!("websocket {} close timer expired", session.id());
                    break Ok(());
                },
                reason = inner.token.cancelled() => break Err(reason.into_error()),
            };
            if let Err(e) = step {
                break Err(e);
            }
            // Both close frames are out: half-close and wait for the peer to
            // hang up, bounded by the close timer.
            if self.handshake_done() && !self.shut_down {
                let _ = writer.shutdown().await;
                self.shut_down = true;
            }
        };
        drop(stop_tx);
        outcome
    }

    async fn write<W: AsyncWriteRent>(&mut self, writer: &mut W, frame: Frame) -> Result<()> {
        if self.close_written {
            return Ok(());
        }
        let is_close = frame.opcode == OpCode::Close;
        let (res, _) = writer.write_all(encode(&frame, Some(mask_key()))?).await;
        res?;
        writer.flush().await?;
        if is_close {
            self.close_written = true;
            self.close_deadline = Some(Instant::now() + self.session.inner.spec.close_timeout);
            self.session.inner.events.emit(EventKind::WsCloseFrameSent);
        }
        Ok(())
    }

    async fn receive<W: AsyncWriteRent>(&mut self, writer: &mut W, frame: Frame) -> Result<()> {
        if frame.mask.is_some() {
            return Err(HttpError::protocol("server sent a masked frame"));
        }
        if self.close_received {
            return Ok(());
        }
        let session = self.session;
        let (fin, rsv) = (frame.fin, frame.rsv);
        match frame.opcode {
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let kind = match frame.opcode {
                    OpCode::Continuation => self
                        .message
                        .ok_or_else(|| {
                            HttpError::protocol("continuation frame without a message")
                        })?,
                    opcode => {
                        if self.message.is_some() {
                            return Err(HttpError::protocol(
                                "new message before the previous one ended",
                            ));
                        }
                        opcode
                    }
                };
                self.message = if fin { None } else { Some(kind) };
                let payload = frame.payload;
                if kind == OpCode::Text {
                    let text = String::from_utf8_lossy(&payload).into_owned();
                    session.dispatch(move |l, s| l.on_text_frame(s, &text, fin, rsv));
                } else {
                    session.dispatch(move |l, s| l.on_binary_frame(s, &payload, fin, rsv));
                }
            }
            OpCode::Ping => {
                let payload = frame.payload;
                self.write(writer, Frame::new(OpCode::Pong, payload.clone()))
                    .await?;
                session.dispatch(move |l, s| l.on_ping_frame(s, &payload));
            }
            OpCode::Pong => {
                let payload = frame.payload;
                session.dispatch(move |l, s| l.on_pong_frame(s, &payload));
            }
            OpCode::Close => {
                let (code, reason) = frame.close_reason()?;
                self.close_received = true;
                session.inner.events.emit(EventKind::WsCloseFrameReceived);
                let echo = {
                    let mut st = session.inner.state.lock();
                    st.state = WebSocketState::Closing;
                    !std::mem::replace(&mut st.close_sent, true)
                };
                session.dispatch(move |l, s| l.on_close_frame(s, code, &reason));
                if echo {
                    self.write(writer, Frame::close(code, "")?).await?;
                }
            }
        }
        Ok(())
    }
}

async fn close_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            monoio::time::sleep(deadline.saturating_duration_since(Instant::now())).await
        }
        None => std::future::pending().await,
    }
}

/// Fluent configuration for a [`WebSocketSession`].
pub struct WebSocketBuilder {
    shared: Arc<ClientShared>,
    uri: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    query: Vec<(String, String)>,
    idle_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    max_frame_size: usize,
    close_timeout: Duration,
    executor: Option<Arc<dyn CallbackExecutor>>,
    listeners: Vec<Arc<dyn WebSocketListener>>,
    error: Option<HttpError>,
}

impl WebSocketBuilder {
    pub(crate) fn new(shared: Arc<ClientShared>, uri: impl Into<String>) -> Self {
        let config = &shared.config;
        Self {
            uri: uri.into(),
            headers: Vec::new(),
            query: Vec::new(),
            idle_timeout: config.idle_timeout(),
            total_timeout: config.total_request_timeout(),
            max_frame_size: config.max_frame_size,
            close_timeout: config.ws_close_timeout(),
            executor: None,
            listeners: Vec::new(),
            error: None,
            shared,
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            _ => {
                if self.error.is_none() {
                    self.error = Some(HttpError::Configuration(format!("invalid header {name}")));
                }
            }
        }
        self
    }

    pub fn add_query_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Inactivity limit for the upgrade exchange. `Duration::ZERO` disables it.
    pub fn idle_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Overall limit for the upgrade exchange. `Duration::ZERO` disables it.
    pub fn total_request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.total_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn max_frame_size(&mut self, size: usize) -> &mut Self {
        self.max_frame_size = size;
        self
    }

    /// How long to wait for the peer's close frame after sending ours.
    pub fn close_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.close_timeout = timeout;
        self
    }

    pub fn callback_executor(&mut self, executor: Arc<dyn CallbackExecutor>) -> &mut Self {
        self.executor = Some(executor);
        self
    }

    pub fn add_listener(&mut self, listener: impl WebSocketListener) -> &mut Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// A new session in `Created` state.
    pub fn build(&self) -> Result<WebSocketSession> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if self.max_frame_size < MAX_CONTROL_PAYLOAD {
            return Err(HttpError::Configuration(
                "max_frame_size must fit a control frame".into(),
            ));
        }
        let spec = SessionSpec {
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            idle_timeout: self.idle_timeout,
            total_timeout: self.total_timeout,
            max_frame_size: self.max_frame_size,
            close_timeout: self.close_timeout,
            executor: self
                .executor
                .clone()
                .unwrap_or_else(|| self.shared.callback_executor.clone()),
        };
        Ok(WebSocketSession::new(
            self.shared.clone(),
            spec,
            self.listeners.clone(),
        ))
    }

    /// Build a session with `listener` added and start connecting it.
    pub fn execute(
        &self,
        listener: impl WebSocketListener,
    ) -> Result<ResultFuture<WebSocketSession>> {
        let session = self.build()?;
        session.add_listener(listener);
        session.connect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use super::*;
    use crate::{
        backpressure::RejectingBackPressure,
        client::HttpClient,
        event::RecordingEventBus,
        test_util::{init_logging, MockWsBehavior, MockWsServer},
    };

    /// Forwards notifications as strings.
    struct Recorder(Mutex<std_mpsc::Sender<String>>);

    impl Recorder {
        fn new() -> (Self, std_mpsc::Receiver<String>) {
            let (tx, rx) = std_mpsc::channel();
            (Recorder(Mutex::new(tx)), rx)
        }

        fn note(&self, what: String) {
            let _ = self.0.lock().send(what);
        }
    }

    impl WebSocketListener for Recorder {
        fn on_connect(&self, _session: &WebSocketSession) {
            self.note("connect".to_string());
        }
        fn on_text_frame(
            &self,
            _session: &WebSocketSession,
            text: &str,
            final_fragment: bool,
            _rsv: u8,
        ) {
            self.note(format!("text {text} {final_fragment}"));
        }
        fn on_binary_frame(
            &self,
            _session: &WebSocketSession,
            payload: &[u8],
            _final_fragment: bool,
            _rsv: u8,
        ) {
            self.note(format!("binary {}", payload.len()));
        }
        fn on_ping_frame(&self, _session: &WebSocketSession, payload: &[u8]) {
            self.note(format!("ping {}", String::from_utf8_lossy(payload)));
        }
        fn on_pong_frame(&self, _session: &WebSocketSession, payload: &[u8]) {
            self.note(format!("pong {}", String::from_utf8_lossy(payload)));
        }
        fn on_close_frame(&self, _session: &WebSocketSession, code: Option<u16>, reason: &str) {
            self.note(format!("close {code:?} {reason}"));
        }
        fn on_error(&self, _session: &WebSocketSession, error: &HttpError) {
            self.note(format!("error {error}"));
        }
        fn on_disconnect(&self, _session: &WebSocketSession) {
            self.note("disconnect".to_string());
        }
    }

    fn next(rx: &std_mpsc::Receiver<String>) -> String {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn client(events: Arc<RecordingEventBus>) -> HttpClient {
        init_logging();
        HttpClient::builder().event_bus(events).build().unwrap()
    }

    #[test]
    fn echo_then_close_handshake() {
        let server = MockWsServer::start(MockWsBehavior::Echo);
        let events = Arc::new(RecordingEventBus::new());
        let client = client(events.clone());
        let (recorder, rx) = Recorder::new();
        let session = client
            .create_web_socket(server.uri())
            .execute(recorder)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(session.state(), WebSocketState::Open);
        assert_eq!(next(&rx), "connect");

        session.send_text_frame("hello").unwrap();
        assert_eq!(next(&rx), "text hello true");
        session.send_binary_frame(vec![1u8, 2, 3]).unwrap();
        assert_eq!(next(&rx), "binary 3");
        session.send_ping_frame("p").unwrap();
        assert_eq!(next(&rx), "pong p");

        session.send_close_frame().unwrap();
        assert!(matches!(
            session.send_text_frame("late"),
            Err(HttpError::WebSocketState { state: "CLOSING", .. })
        ));
        assert!(session.send_close_frame().is_err());
        assert!(session.await_close_timeout(Duration::from_secs(5)));
        assert_eq!(session.state(), WebSocketState::Closed);
        assert_eq!(next(&rx), "close Some(1000) ");
        assert_eq!(next(&rx), "disconnect");
        session.await_close();

        assert_eq!(
            events.kinds_for(session.id()),
            vec![
                EventKind::WsUpgradePipeline,
                EventKind::ConnectionAcquired,
                EventKind::HeadersWritten,
                EventKind::ResponseHeadersReceived,
                EventKind::WsOpened,
                EventKind::WsCloseFrameSent,
                EventKind::WsCloseFrameReceived,
                EventKind::WsClosed,
            ]
        );
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn second_connect_fails() {
        let server = MockWsServer::start(MockWsBehavior::Echo);
        let client = client(Arc::new(RecordingEventBus::new()));
        let session = client.create_web_socket(server.uri()).build().unwrap();
        let first = session.connect().unwrap();
        match session.connect() {
            Err(HttpError::WebSocketState { action: "connect", .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        first.join().unwrap();
        assert!(session.connect().is_err());
        session.send_close_frame().unwrap();
        assert!(session.await_close_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn server_initiated_close_is_echoed() {
        let server = MockWsServer::start(MockWsBehavior::CloseAfterHandshake);
        let client = client(Arc::new(RecordingEventBus::new()));
        let (recorder, rx) = Recorder::new();
        let session = client
            .create_web_socket(server.uri())
            .execute(recorder)
            .unwrap()
            .join()
            .unwrap();
        session.await_close();
        assert_eq!(session.state(), WebSocketState::Closed);
        assert_eq!(next(&rx), "connect");
        assert_eq!(next(&rx), "close Some(1001) going away");
        assert_eq!(next(&rx), "disconnect");
        assert_eq!(server.echoed_close(), Some(1001));
    }

    #[test]
    fn pings_are_answered_and_reported() {
        let server = MockWsServer::start(MockWsBehavior::PingAfterHandshake);
        let client = client(Arc::new(RecordingEventBus::new()));
        let (recorder, rx) = Recorder::new();
        let session = client
            .create_web_socket(server.uri())
            .execute(recorder)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(next(&rx), "connect");
        assert_eq!(next(&rx), "ping are-you-there");
        // The server reports the pong it got back as a text frame.
        assert_eq!(next(&rx), "text pong:are-you-there true");
        session.send_close_frame().unwrap();
        session.await_close();
    }

    #[test]
    fn fragments_are_delivered_unassembled() {
        let server = MockWsServer::start(MockWsBehavior::Fragmented);
        let client = client(Arc::new(RecordingEventBus::new()));
        let (recorder, rx) = Recorder::new();
        let session = client
            .create_web_socket(server.uri())
            .execute(recorder)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(next(&rx), "connect");
        assert_eq!(next(&rx), "text frag false");
        assert_eq!(next(&rx), "text ment true");
        session.send_close_frame().unwrap();
        session.await_close();
    }

    #[test]
    fn late_listeners_get_later_events() {
        let server = MockWsServer::start(MockWsBehavior::Echo);
        let client = client(Arc::new(RecordingEventBus::new()));
        let (early, early_rx) = Recorder::new();
        let session = client
            .create_web_socket(server.uri())
            .execute(early)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(next(&early_rx), "connect");

        let (late, late_rx) = Recorder::new();
        session.add_listener(late);
        session.send_text_frame("both").unwrap();
        assert_eq!(next(&early_rx), "text both true");
        assert_eq!(next(&late_rx), "text both true");
        session.send_close_frame().unwrap();
        session.await_close();
    }

    #[test]
    fn hang_up_without_close_is_an_error() {
        let server = MockWsServer::start(MockWsBehavior::HangUp);
        let client = client(Arc::new(RecordingEventBus::new()));
        let (recorder, rx) = Recorder::new();
        let session = client
            .create_web_socket(server.uri())
            .execute(recorder)
            .unwrap()
            .join()
            .unwrap();
        assert!(session.await_close_timeout(Duration::from_secs(5)));
        assert_eq!(session.state(), WebSocketState::Closed);
        assert_eq!(next(&rx), "connect");
        let error = next(&rx);
        assert!(error.starts_with("error "), "{error}");
        assert!(error.contains("without a close frame"), "{error}");
        assert_eq!(next(&rx), "disconnect");
    }

    #[test]
    fn close_waits_for_the_peer_to_hang_up() {
        let linger = MockWsBehavior::LingerAfterClose(Duration::from_millis(300));
        let server = MockWsServer::start(linger);
        let client = client(Arc::new(RecordingEventBus::new()));
        let (recorder, rx) = Recorder::new();
        let session = client
            .create_web_socket(server.uri())
            .execute(recorder)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(next(&rx), "connect");
        let started = Instant::now();
        session.send_close_frame().unwrap();
        assert_eq!(next(&rx), "close Some(1000) ");
        assert!(session.await_close_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(next(&rx), "disconnect");
    }

    #[test]
    fn lingering_peer_is_dropped_after_close_timeout() {
        let server = MockWsServer::start(MockWsBehavior::LingerAfterClose(Duration::from_secs(30)));
        let client = client(Arc::new(RecordingEventBus::new()));
        let mut builder = client.create_web_socket(server.uri());
        builder.close_timeout(Duration::from_millis(200));
        let session = builder.build().unwrap();
        session.connect().unwrap().join().unwrap();
        let started = Instant::now();
        session.send_close_frame().unwrap();
        assert!(session.await_close_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(session.state(), WebSocketState::Closed);
    }

    #[test]
    fn unanswered_close_times_out() {
        let server = MockWsServer::start(MockWsBehavior::IgnoreClose);
        let client = client(Arc::new(RecordingEventBus::new()));
        let mut builder = client.create_web_socket(server.uri());
        builder.close_timeout(Duration::from_millis(200));
        let session = builder.build().unwrap();
        session.connect().unwrap().join().unwrap();
        let started = Instant::now();
        session.send_close_frame().unwrap();
        assert!(session.await_close_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn refused_upgrade_fails_connect() {
        let server = MockWsServer::start(MockWsBehavior::Refuse);
        let client = client(Arc::new(RecordingEventBus::new()));
        let (recorder, rx) = Recorder::new();
        let session = client.create_web_socket(server.uri()).build().unwrap();
        session.add_listener(recorder);
        let err = session.connect().unwrap().join().unwrap_err();
        assert!(matches!(err, HttpError::Protocol(_)), "{err:?}");
        assert_eq!(session.state(), WebSocketState::Closed);
        assert!(next(&rx).starts_with("error "));
        session.await_close();
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn upgrade_is_gated_by_back_pressure() {
        let server = MockWsServer::start(MockWsBehavior::Echo);
        let client = HttpClient::builder()
            .back_pressure(RejectingBackPressure::new(1))
            .build()
            .unwrap();
        let session = client
            .create_web_socket(server.uri())
            .build()
            .unwrap();
        session.connect().unwrap().join().unwrap();
        // Released once open, so a second session is admitted.
        assert_eq!(client.in_flight(), 0);
        let other = client.create_web_socket(server.uri()).build().unwrap();
        other.connect().unwrap().join().unwrap();
        session.send_close_frame().unwrap();
        other.send_close_frame().unwrap();
        session.await_close();
        other.await_close();
    }

    #[test]
    fn shutdown_closes_open_sessions() {
        let server = MockWsServer::start(MockWsBehavior::Echo);
        let client = client(Arc::new(RecordingEventBus::new()));
        let (recorder, rx) = Recorder::new();
        let session = client
            .create_web_socket(server.uri())
            .execute(recorder)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(next(&rx), "connect");
        client.shutdown();
        assert!(session.await_close_timeout(Duration::from_secs(5)));
        assert!(next(&rx).starts_with("error "));
        assert_eq!(next(&rx), "disconnect");
    }
}
