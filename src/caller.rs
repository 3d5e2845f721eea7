//! The execution orchestrator.
//!
//! `execute` runs on the caller thread: it resolves the target, prepares the
//! body and passes the back pressure gate, then hands the execution to an I/O
//! thread. There the pipeline acquires a channel, writes the request, reads
//! the response and follows redirects, bounded by the total timeout and
//! racing the cancellation token. Whatever happens, exactly one outcome
//! reaches the result slot and the admission is released before it does.
use std::{rc::Rc, sync::Arc, time::Instant};

use bytes::Bytes;
use http::{
    header::{AUTHORIZATION, COOKIE, LOCATION},
    HeaderName, HeaderValue, Method, StatusCode,
};

use crate::{
    backpressure::{admit, Admission, AdmissionGuard},
    client::ClientShared,
    connectors::ConnectorExt,
    error::{HttpError, Result},
    event::{EventEmitter, EventKind},
    future::{
        callback_observer, result_channel, CancelToken, HttpCallback, ResponseFuture, ResultSlot,
    },
    http::{decompress, request_body},
    key::Key,
    request::{
        headers::{assemble, HeaderPlan},
        resolve, resolve_location, PreparedBody, RequestSpec, ResolvedTarget,
    },
    response::{HttpResponse, ResponseHead},
    runtime::{IoContext, Job},
};

/// Everything an admitted execution carries onto its I/O thread.
struct Execution<T> {
    spec: Arc<RequestSpec<T>>,
    target: ResolvedTarget,
    body: Option<PreparedBody>,
    guard: AdmissionGuard,
    events: EventEmitter,
    token: Arc<CancelToken>,
    deadline: Option<Instant>,
    user_agent: Arc<str>,
}

fn terminal_event(outcome: &Result<impl Sized>) -> EventKind {
    match outcome {
        Ok(_) => EventKind::Completed,
        Err(e) if e.is_timeout() => EventKind::TimedOut,
        Err(
            HttpError::Cancelled
            | HttpError::ClientShutdown
            | HttpError::BackPressureEvicted { .. },
        ) => {
            EventKind::Cancelled
        }
        Err(_) => EventKind::Failed,
    }
}

fn fail_early<V: Send + 'static>(
    events: &EventEmitter,
    token: &CancelToken,
    slot: ResultSlot<V>,
    error: HttpError,
) {
    #[cfg(feature = "logging")]
    tracing::debug!("execution {} failed before dispatch: {error}", events.id());
    token.finish();
    events.emit(EventKind::Failed);
    slot.complete(Err(error));
}

pub(crate) fn execute<T: Send + 'static>(
    shared: &Arc<ClientShared>,
    spec: Arc<RequestSpec<T>>,
    callback: Option<Arc<dyn HttpCallback<T>>>,
) -> ResponseFuture<T> {
    let (slot, future) = result_channel(spec.executor.clone(), callback.map(callback_observer));
    let token = future.token().clone();
    let events = shared.emitter();
    events.emit(EventKind::PipelineStarted);

    let prepared =
        resolve(&spec.uri, &spec.query).and_then(|target| Ok((target, spec.body.prepare()?)));
    let (target, body) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            fail_early(&events, &token, slot, e);
            return future;
        }
    };

    let deadline = spec.total_timeout.map(|total| Instant::now() + total);
    let guard = match admit(&shared.back_pressure, Admission::new(events.id(), token.clone())) {
        Ok(guard) => guard,
        Err(e) => {
            fail_early(&events, &token, slot, e);
            return future;
        }
    };
    events.emit(EventKind::Admitted);

    let execution = Execution {
        spec,
        target,
        body,
        guard,
        events,
        token: token.clone(),
        deadline,
        user_agent: shared.user_agent.clone(),
    };
    let job = Job::new(token, move |ctx| Box::pin(run(ctx, execution, slot)));
    if !shared.workers.dispatch(job) {
        #[cfg(feature = "logging")]
        tracing::debug!("client shut down, execution dropped");
    }
    future
}

async fn run<T: Send + 'static>(
    ctx: Rc<IoContext>,
    execution: Execution<T>,
    slot: ResultSlot<HttpResponse<T>>,
) {
    let Execution {
        spec,
        target,
        body,
        guard,
        events,
        token,
        deadline,
        user_agent,
    } = execution;

    let outcome = {
        let pipeline = Pipeline {
            ctx: &ctx,
            spec: &spec,
            events: &events,
            admission: guard.admission(),
            user_agent: &user_agent,
        };
        let bounded = async {
            match (deadline, spec.total_timeout) {
                (Some(deadline), Some(total)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    monoio::time::timeout(remaining, pipeline.run(target, body))
                        .await
                        .unwrap_or(Err(HttpError::TotalTimeout(total)))
                }
                _ => pipeline.run(target, body).await,
            }
        };
        monoio::select! {
            outcome = bounded => outcome,
            reason = token.cancelled() => Err(reason.into_error()),
        }
    };

    token.finish();
    drop(guard);
    #[cfg(feature = "logging")]
    if let Err(e) = &outcome {
        tracing::debug!("execution {} failed: {e}", events.id());
    }
    events.emit(terminal_event(&outcome));
    slot.complete(outcome);
}

struct Pipeline<'a, T> {
    ctx: &'a IoContext,
    spec: &'a RequestSpec<T>,
    events: &'a EventEmitter,
    admission: &'a Admission,
    user_agent: &'a str,
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

impl<T: Send + 'static> Pipeline<'_, T> {
    async fn run(
        self,
        mut target: ResolvedTarget,
        mut body: Option<PreparedBody>,
    ) -> Result<HttpResponse<T>> {
        let mut method = self.spec.method.clone();
        let mut headers = self.spec.headers.clone();
        let mut redirects = 0u32;

        loop {
            let (mut head, payload) = self
                .exchange(&target, &method, &headers, body.as_ref())
                .await?;

            let location = head
                .headers
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .filter(|_| self.spec.follow_redirects && is_redirect(head.status));
            if let Some(location) = location {
                if redirects >= self.spec.max_redirects {
                    return Err(HttpError::RedirectLimitExceeded {
                        limit: self.spec.max_redirects,
                    });
                }
                redirects += 1;
                let next = resolve_location(&target, location)?;
                if !matches!(head.status.as_u16(), 307 | 308) {
                    body = None;
                    if method != Method::GET && method != Method::HEAD {
                        method = Method::GET;
                    }
                }
                if !next.server.same_authority(&target.server) {
                    headers.retain(|(name, _)| name != AUTHORIZATION && name != COOKIE);
                }
                #[cfg(feature = "logging")]
                tracing::debug!("following {} redirect to {}", head.status, next.url());
                target = next;
                self.events.emit(EventKind::RedirectFollowed);
                continue;
            }

            let payload = if self.spec.accept_compressed {
                decompress(&mut head, payload)?
            } else {
                payload
            };
            let value = self.spec.consumer.consume(&head, payload)?;
            return Ok(HttpResponse::new(head, value));
        }
    }

    /// One request/response exchange on one channel.
    async fn exchange(
        &self,
        target: &ResolvedTarget,
        method: &Method,
        headers: &[(HeaderName, HeaderValue)],
        body: Option<&PreparedBody>,
    ) -> Result<(ResponseHead, Bytes)> {
        let key = Key::try_from(&target.server)?;
        let timeout = self.ctx.connect_timeout;
        let mut conn = match self.ctx.http.connect_with_timeout(key.clone(), timeout).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(HttpError::ConnectTimeout {
                    addr: key.to_string(),
                    timeout,
                })
            }
        };
        // Only a fully read response makes the channel reusable again.
        conn.set_reuse(false);
        self.events.emit(EventKind::ConnectionAcquired);

        let map = assemble(&HeaderPlan {
            headers,
            body,
            server: &target.server,
            version: self.spec.version,
            accept_compressed: self.spec.accept_compressed,
            keep_alive: self.spec.keep_alive,
            user_agent: self.user_agent,
        })?;
        let mut request = http::Request::builder()
            .method(method.clone())
            .uri(target.path.as_str())
            .version(self.spec.version)
            .body(request_body(body))?;
        *request.headers_mut() = map;

        self.admission.mark_writing();
        let idle = self.spec.idle_timeout;
        conn.send(request, idle).await?;
        self.events.emit(EventKind::HeadersWritten);
        if body.is_some() {
            self.events.emit(EventKind::BodyWritten);
        }

        let events = &self.events;
        let (head, payload, clean) = conn
            .receive(method, idle, || events.emit(EventKind::ResponseHeadersReceived))
            .await?;

        if clean
            && self.spec.keep_alive
            && !head.connection_close()
            && head.status != StatusCode::SWITCHING_PROTOCOLS
        {
            conn.set_reuse(true);
        }
        Ok((head, payload))
    }
}
