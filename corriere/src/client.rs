// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use corriere_proto::headers::{RequestHeader, TransInfo};
use corriere_proto::{Request, Response};
use corriere_stream::{CallInfo, StreamError, StreamReader, StreamWriter};
use corriere_transport::{
    BackupRequest, ClientError, ConnComplex, ConnPool, InvokeRequest, Pipeline,
};
use hashbrown::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{AddressResolver, Config};

/// The connection discipline a channel runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Discipline {
    /// One connection multiplexes every request, keyed by request id.
    ConnComplex,
    /// N connections, each carrying one request at a time.
    ConnPool,
    /// Requests streamed back to back; responses must come back in order.
    Pipeline,
}

/// Per-call parameters.
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub callee: String,
    pub func: String,
    pub timeout: Duration,
    pub message_type: u32,
    pub content_type: u32,
    pub content_encoding: u32,
    pub trans_info: TransInfo,
    /// Dispatch a hedged copy to the second endpoint if the primary has
    /// not answered within this delay.
    pub backup_delay: Option<Duration>,
}

impl CallOptions {
    pub fn new(callee: impl Into<String>, func: impl Into<String>) -> Self {
        CallOptions {
            callee: callee.into(),
            func: func.into(),
            timeout: Duration::from_secs(1),
            message_type: 0,
            content_type: 0,
            content_encoding: 0,
            trans_info: TransInfo::default(),
            backup_delay: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backup_delay(mut self, delay: Duration) -> Self {
        self.backup_delay = Some(delay);
        self
    }
}

enum Channel {
    Complex(ConnComplex),
    Pool(ConnPool),
    Pipeline(Pipeline),
}

impl Channel {
    fn submit(&self, request: InvokeRequest) {
        match self {
            Channel::Complex(transport) => transport.submit(request),
            Channel::Pool(transport) => transport.submit(request),
            Channel::Pipeline(transport) => transport.submit(request),
        }
    }
}

/// The client runtime: request building, channel management, hedging.
///
/// Cheap to clone through an [`Arc`]; every channel is shared.
pub struct Client {
    config: Config,
    resolver: Arc<dyn AddressResolver>,
    next_request_id: AtomicU32,
    channels: Mutex<HashMap<SocketAddr, Arc<Channel>>>,
    /// Streams always multiplex, whatever the unary discipline is.
    stream_channels: Mutex<HashMap<SocketAddr, ConnComplex>>,
}

impl Client {
    pub fn new(config: Config, resolver: Arc<dyn AddressResolver>) -> Self {
        Client {
            config,
            resolver,
            next_request_id: AtomicU32::new(1),
            channels: Mutex::new(HashMap::new()),
            stream_channels: Mutex::new(HashMap::new()),
        }
    }

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn channel_for(&self, endpoint: SocketAddr) -> Arc<Channel> {
        let mut channels = self.channels.lock().unwrap();
        Arc::clone(channels.entry(endpoint).or_insert_with(|| {
            debug!(%endpoint, discipline = ?self.config.discipline, "opening channel");
            let options = self.config.transport_options();
            Arc::new(match self.config.discipline {
                Discipline::ConnComplex => Channel::Complex(ConnComplex::connect(endpoint, options)),
                Discipline::ConnPool => Channel::Pool(ConnPool::connect(endpoint, options)),
                Discipline::Pipeline => Channel::Pipeline(Pipeline::connect(endpoint, options)),
            })
        }))
    }

    fn stream_channel_for(&self, endpoint: SocketAddr) -> ConnComplex {
        let mut channels = self.stream_channels.lock().unwrap();
        channels
            .entry(endpoint)
            .or_insert_with(|| {
                ConnComplex::connect(endpoint, self.config.transport_options())
            })
            .clone()
    }

    fn build_request(
        &self,
        request_id: u32,
        options: &CallOptions,
        body: Bytes,
    ) -> Result<Bytes, ClientError> {
        let request = Request {
            header: RequestHeader {
                request_id,
                timeout: options.timeout.as_millis() as u32,
                caller: self.config.caller.clone(),
                callee: options.callee.clone(),
                func: options.func.clone(),
                message_type: options.message_type,
                trans_info: options.trans_info.clone(),
                content_type: options.content_type,
                content_encoding: options.content_encoding,
                ..Default::default()
            },
            body,
            attachment: Bytes::new(),
        };
        request
            .encode()
            .map_err(|error| ClientError::Encode(error.to_string()))
    }

    /// One unary call. With a backup delay set and at least two resolved
    /// endpoints, a slow primary triggers a hedged copy to the second
    /// endpoint; the first reply wins.
    pub async fn invoke(
        &self,
        target: &str,
        options: CallOptions,
        body: Bytes,
    ) -> Result<Response, ClientError> {
        let endpoints = self.resolver.resolve(target);
        let Some(&primary) = endpoints.first() else {
            return Err(ClientError::Unknown(format!(
                "target {target} resolves to nothing"
            )));
        };

        let request_id = self.next_request_id();
        let frame = self.build_request(request_id, &options, body)?;

        let hedge_to = match options.backup_delay {
            Some(_) => endpoints.get(1).copied(),
            None => None,
        };
        match (options.backup_delay, hedge_to) {
            (Some(delay), Some(secondary)) => {
                self.invoke_hedged(primary, secondary, request_id, frame, &options, delay)
                    .await
            }
            _ => {
                let (reply, result) = oneshot::channel();
                self.channel_for(primary).submit(InvokeRequest {
                    request_id,
                    frame,
                    timeout: options.timeout,
                    backup: None,
                    reply,
                });
                flatten(result.await)
            }
        }
    }

    async fn invoke_hedged(
        &self,
        primary: SocketAddr,
        secondary: SocketAddr,
        request_id: u32,
        frame: Bytes,
        options: &CallOptions,
        delay: Duration,
    ) -> Result<Response, ClientError> {
        let (notify, hedge_trigger) = oneshot::channel();
        let (reply, mut primary_result) = oneshot::channel();
        self.channel_for(primary).submit(InvokeRequest {
            request_id,
            frame: frame.clone(),
            timeout: options.timeout,
            backup: Some(BackupRequest { delay, notify }),
            reply,
        });

        tokio::select! {
            result = &mut primary_result => flatten(result),
            trigger = hedge_trigger => {
                if trigger.is_err() {
                    // The transport dropped the hedge armed on the primary;
                    // its own completion carries the verdict.
                    return flatten(primary_result.await);
                }
                debug!(request = request_id, %secondary, "dispatching backup request");
                let (reply, hedge_result) = oneshot::channel();
                self.channel_for(secondary).submit(InvokeRequest {
                    request_id,
                    frame,
                    timeout: options.timeout.saturating_sub(delay),
                    backup: None,
                    reply,
                });
                race(primary_result, hedge_result).await
            }
        }
    }

    /// One-way send over the multiplexed discipline: nothing is tracked and
    /// no response is expected.
    pub fn invoke_oneway(
        &self,
        target: &str,
        options: CallOptions,
        body: Bytes,
    ) -> Result<(), ClientError> {
        let endpoints = self.resolver.resolve(target);
        let Some(&primary) = endpoints.first() else {
            return Err(ClientError::Unknown(format!(
                "target {target} resolves to nothing"
            )));
        };
        let frame = self.build_request(self.next_request_id(), &options, body)?;
        self.stream_channel_for(primary).send_only(frame);
        Ok(())
    }

    /// Opens a bidirectional stream to the target.
    pub async fn open_stream(
        &self,
        target: &str,
        options: CallOptions,
    ) -> Result<(StreamReader, StreamWriter), StreamError> {
        let endpoints = self.resolver.resolve(target);
        let Some(&primary) = endpoints.first() else {
            return Err(StreamError::network(
                corriere_stream::StreamRole::Client,
                format!("target {target} resolves to nothing"),
            ));
        };

        self.stream_channel_for(primary)
            .open_stream(CallInfo {
                caller: self.config.caller.clone(),
                callee: options.callee,
                func: options.func,
                message_type: options.message_type,
                content_type: options.content_type,
                content_encoding: options.content_encoding,
                trans_info: options.trans_info,
            })
            .await
    }
}

fn flatten(
    result: Result<Result<Response, ClientError>, oneshot::error::RecvError>,
) -> Result<Response, ClientError> {
    result.map_err(|_| ClientError::Network("transport stopped".into()))?
}

/// Waits for the first successful completion of two racing sinks; when both
/// fail, the first-observed failure is surfaced.
async fn race(
    mut first: oneshot::Receiver<Result<Response, ClientError>>,
    mut second: oneshot::Receiver<Result<Response, ClientError>>,
) -> Result<Response, ClientError> {
    tokio::select! {
        result = &mut first => match flatten(result) {
            Ok(response) => Ok(response),
            Err(error) => match flatten(second.await) {
                Ok(response) => Ok(response),
                Err(_) => Err(error),
            },
        },
        result = &mut second => match flatten(result) {
            Ok(response) => Ok(response),
            Err(error) => match flatten(first.await) {
                Ok(response) => Ok(response),
                Err(_) => Err(error),
            },
        },
    }
}
