use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, pin_mut};
use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::logging::ExchangeLog;
use crate::session::{DecoderPhase, Emission, SentMessage, SessionEventDecoder};
use crate::translate::{ChatAggregator, DONE_FRAME, DirectLine, LineBuffer, LineTooLong, forward_line, parse_direct_line, sse_frame};

#[derive(Debug, thiserror::Error)]
pub(super) enum LineError {
    #[error("upstream read failed: {0}")]
    Read(#[from] reqwest::Error),
    #[error("upstream stream exceeded {0:?}")]
    Deadline(Duration),
    #[error(transparent)]
    TooLong(#[from] LineTooLong),
}

/// Newline-delimited lines of an upstream body. The whole body must arrive
/// within `deadline`.
fn upstream_lines(
    mut response: reqwest::Response,
    deadline: Duration,
) -> impl Stream<Item = Result<String, LineError>> + Send + 'static {
    async_stream::try_stream! {
        let until = tokio::time::Instant::now() + deadline;
        let mut buf = LineBuffer::default();
        loop {
            let next = tokio::time::timeout_at(until, response.chunk())
                .await
                .map_err(|_| LineError::Deadline(deadline))?;
            match next? {
                Some(chunk) => {
                    for line in buf.push(&chunk)? {
                        yield line;
                    }
                }
                None => break,
            }
        }
        if let Some(line) = buf.finish() {
            yield line;
        }
    }
}

/// Writes the exchange summary exactly once, including when the client goes
/// away and the body stream is dropped mid-flight.
struct StreamFinalize {
    log: ExchangeLog,
    chunks: usize,
    failure: Option<String>,
    logged: bool,
}

impl StreamFinalize {
    fn new(log: ExchangeLog) -> Self {
        Self {
            log,
            chunks: 0,
            failure: None,
            logged: false,
        }
    }

    fn fail(&mut self, reason: String) {
        self.failure = Some(reason);
    }

    fn finish(&mut self) {
        if self.logged {
            return;
        }
        self.logged = true;
        let summary = format!("chunks={}", self.chunks);
        match &self.failure {
            Some(reason) => self.log.error(&format!("{summary} | {reason}")),
            None if self.chunks == 0 => self.log.empty(&summary),
            None => self.log.ok(&summary),
        }
    }
}

impl Drop for StreamFinalize {
    fn drop(&mut self) {
        if !self.logged {
            if self.failure.is_none() {
                self.failure = Some("client disconnected".to_string());
            }
            self.finish();
        }
    }
}

fn sse_response(body: Body) -> Response {
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}

fn emission_frame(emission: &Emission) -> Bytes {
    match emission {
        Emission::Chunk(chunk) => sse_frame(chunk),
        Emission::Done => Bytes::from_static(DONE_FRAME),
    }
}

/// Relays a direct-dialect body line by line as SSE.
pub(super) fn forward_direct(response: reqwest::Response, log: ExchangeLog, deadline: Duration) -> Response {
    let body = async_stream::stream! {
        let mut finalize = StreamFinalize::new(log);
        let lines = upstream_lines(response, deadline);
        pin_mut!(lines);
        while let Some(item) = lines.next().await {
            match item {
                Ok(line) => {
                    if let Some(frame) = forward_line(&line) {
                        finalize.chunks += 1;
                        yield Ok::<Bytes, std::io::Error>(frame);
                    }
                }
                Err(err) => {
                    finalize.fail(err.to_string());
                    yield Err(std::io::Error::other(err));
                    break;
                }
            }
        }
        finalize.finish();
    };
    sse_response(Body::from_stream(body))
}

/// Translates a session event stream to completion chunks as SSE. The
/// upstream body is dropped as soon as the exchange is terminal.
pub(super) fn forward_session(sent: SentMessage, model: &str, log: ExchangeLog, deadline: Duration) -> Response {
    let mut decoder = SessionEventDecoder::new(model);
    let body = async_stream::stream! {
        let mut finalize = StreamFinalize::new(log);
        let lines = upstream_lines(sent.response, deadline);
        pin_mut!(lines);
        let mut failed = false;
        while let Some(item) = lines.next().await {
            match item {
                Ok(line) => {
                    for emission in decoder.decode_line(&line) {
                        yield Ok::<Bytes, std::io::Error>(emission_frame(&emission));
                    }
                    if matches!(decoder.phase(), DecoderPhase::Terminal(_)) {
                        break;
                    }
                }
                Err(err) => {
                    decoder.fail();
                    finalize.fail(err.to_string());
                    failed = true;
                    yield Err(std::io::Error::other(err));
                    break;
                }
            }
        }
        if !failed {
            let tail = decoder.finish();
            if !tail.is_empty() {
                warn!("[{}] session {} ended without stop event", finalize.log.id, sent.session_id);
            }
            for emission in tail {
                yield Ok(emission_frame(&emission));
            }
        }
        finalize.chunks = decoder.deltas();
        finalize.finish();
    };
    sse_response(Body::from_stream(body))
}

fn read_failure(log: &ExchangeLog, err: LineError) -> ApiError {
    log.error(&format!("read stream: {err}"));
    ApiError::BadGateway("Failed to read upstream response".to_string())
}

/// Folds a direct-dialect body into one aggregate.
pub(super) async fn aggregate_direct(
    response: reqwest::Response,
    log: &ExchangeLog,
    deadline: Duration,
) -> ApiResult<ChatAggregator> {
    let mut agg = ChatAggregator::default();
    let lines = upstream_lines(response, deadline);
    pin_mut!(lines);
    while let Some(item) = lines.next().await {
        let line = item.map_err(|err| read_failure(log, err))?;
        if let DirectLine::Chunk(chunk) = parse_direct_line(&line) {
            agg.push(&chunk);
        }
    }
    Ok(agg)
}

/// Folds a session event stream into one aggregate.
pub(super) async fn aggregate_session(
    sent: SentMessage,
    model: &str,
    log: &ExchangeLog,
    deadline: Duration,
) -> ApiResult<ChatAggregator> {
    let mut decoder = SessionEventDecoder::new(model);
    let mut agg = ChatAggregator::default();
    let lines = upstream_lines(sent.response, deadline);
    pin_mut!(lines);
    while let Some(item) = lines.next().await {
        let line = match item {
            Ok(line) => line,
            Err(err) => {
                decoder.fail();
                return Err(read_failure(log, err));
            }
        };
        for emission in decoder.decode_line(&line) {
            if let Emission::Chunk(chunk) = emission {
                agg.push(&chunk);
            }
        }
        if matches!(decoder.phase(), DecoderPhase::Terminal(_)) {
            break;
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        warn!("[{}] session {} ended without stop event", log.id, sent.session_id);
    }
    for emission in tail {
        if let Emission::Chunk(chunk) = emission {
            agg.push(&chunk);
        }
    }
    Ok(agg)
}

/// Summary line for an aggregated exchange.
pub(super) fn log_aggregate(log: &ExchangeLog, agg: &ChatAggregator) {
    if agg.is_empty() {
        log.empty(&agg.summary());
    } else {
        log.ok(&agg.summary());
    }
}
