//! Connection processor: a resizable pool of workers that drive the edition
//! handshake on each accepted connection under a deadline.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::infrared::{
    bedrock::{self, BedrockConn},
    codec::CodecError,
    event::{EventError, EventPayload, Topic},
    filter::FilterError,
    gateway::{Gateway, IncomingConn, Transport},
    java::{self, JavaConn},
    proxy::Shared,
    telemetry,
};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Codec(CodecError),
    #[error(transparent)]
    Filter(FilterError),
    #[error("processing deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Rejected(#[from] EventError),
    #[error("proxy closed")]
    Closed,
}

impl From<CodecError> for ProcessError {
    fn from(err: CodecError) -> Self {
        match err.kind() {
            "timeout" => ProcessError::Timeout,
            _ => ProcessError::Codec(err),
        }
    }
}

impl From<FilterError> for ProcessError {
    fn from(err: FilterError) -> Self {
        match err.kind() {
            "timeout" => ProcessError::Timeout,
            _ => ProcessError::Filter(err),
        }
    }
}

impl ProcessError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::Codec(err) => err.kind(),
            ProcessError::Filter(err) => err.kind(),
            ProcessError::Timeout => "timeout",
            ProcessError::Rejected(_) => "rejected",
            ProcessError::Closed => "closed",
        }
    }
}

/// A connection whose handshake is complete, ready for routing.
pub enum ProcessedConn {
    Java(JavaConn),
    Bedrock(Box<BedrockConn>),
}

impl ProcessedConn {
    pub fn gateway(&self) -> &Arc<Gateway> {
        match self {
            ProcessedConn::Java(c) => &c.gateway,
            ProcessedConn::Bedrock(c) => &c.gateway,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            ProcessedConn::Java(c) => c.remote_addr,
            ProcessedConn::Bedrock(c) => c.remote_addr,
        }
    }

    pub fn event_payload(&self) -> EventPayload {
        match self {
            ProcessedConn::Java(c) => c.event_payload(),
            ProcessedConn::Bedrock(c) => c.event_payload(),
        }
    }

    pub fn close(self) {
        match self {
            ProcessedConn::Java(c) => c.conn.force_close(),
            ProcessedConn::Bedrock(c) => drop(c),
        }
    }
}

/// Worker pool reading the processing stage.
pub struct ConnProcessorPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<CancellationToken>>,
}

impl ConnProcessorPool {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Grows or shrinks the pool. Stopped workers finish the connection
    /// they hold before exiting.
    pub fn set_size(&self, n: usize) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        while workers.len() < n {
            let stop = self.shared.cancel.child_token();
            self.shared
                .tracker
                .spawn(worker(Arc::clone(&self.shared), stop.clone()));
            workers.push(stop);
        }
        while workers.len() > n {
            if let Some(stop) = workers.pop() {
                stop.cancel();
            }
        }
        tracing::debug!(edition = %self.shared.edition, workers = n, "cpn: pool resized");
    }
}

async fn worker(shared: Arc<Shared>, stop: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            c = shared.conn_processor.recv() => match c {
                Some(c) => c,
                None => break,
            },
        };
        let Some(processed) = process(&shared, incoming).await else {
            continue;
        };
        if let Err(back) = shared.server.send(processed).await {
            back.close();
            break;
        }
    }
}

/// Runs the handshake of one connection. Failures close the connection and
/// are reported here; `None` means there is nothing left to route.
pub async fn process(shared: &Shared, incoming: IncomingConn) -> Option<ProcessedConn> {
    let settings = shared.settings.load_full();
    let payload = incoming.event_payload();
    let gateway = Arc::clone(&incoming.gateway);

    if let Err(err) = shared
        .bus
        .request(Topic::PreConnProcessing, payload.clone())
        .await
    {
        tracing::debug!(gateway = %gateway.id, remote = %incoming.remote_addr, err = %err, "cpn: processing vetoed");
        incoming.reject();
        return None;
    }

    let deadline = (!settings.client_timeout.is_zero())
        .then(|| Instant::now() + settings.client_timeout);
    let remote_addr = incoming.remote_addr;
    let work = async {
        match incoming.transport {
            Transport::Tcp(stream) => java::process(stream, Arc::clone(&gateway), remote_addr, deadline)
                .await
                .map(ProcessedConn::Java),
            Transport::Raknet(link) => bedrock::process(
                link,
                Arc::clone(&gateway),
                remote_addr,
                incoming.local_addr,
                settings.compression,
                deadline,
            )
            .await
            .map(|c| ProcessedConn::Bedrock(Box::new(c))),
        }
    };
    let res = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => Err(ProcessError::Closed),
        r = work => r,
    };

    match res {
        Ok(conn) => {
            shared.bus.push(Topic::PostConnProcessing, conn.event_payload());
            Some(conn)
        }
        Err(err) => {
            report_failure(shared, &gateway, remote_addr, payload, &err);
            None
        }
    }
}

fn report_failure(
    shared: &Shared,
    gateway: &Gateway,
    remote: SocketAddr,
    mut payload: EventPayload,
    err: &ProcessError,
) {
    telemetry::processing_failed(err.kind());
    match err {
        ProcessError::Timeout => {
            tracing::debug!(gateway = %gateway.id, remote = %remote, "cpn: processing timed out");
        }
        ProcessError::Filter(FilterError::RateLimitExceeded(_)) => {
            tracing::debug!(gateway = %gateway.id, remote = %remote, "cpn: rate limited");
            return;
        }
        ProcessError::Filter(
            e @ (FilterError::UntrustedProxyHeader(_) | FilterError::ProxyHeaderRequired(_)),
        ) => {
            tracing::warn!(gateway = %gateway.id, remote = %remote, err = %e, "cpn: PROXY header rejected");
        }
        ProcessError::Closed => return,
        other => {
            tracing::debug!(gateway = %gateway.id, remote = %remote, kind = other.kind(), err = %other, "cpn: processing failed");
        }
    }
    payload.error = Some(err.to_string());
    shared.bus.push(Topic::ConnError, payload);
}
