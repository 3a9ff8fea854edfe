// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::time::Duration;

use corriere_proto::Response;
use tokio::sync::oneshot;
use tracing::warn;

use crate::ClientError;

/// Hedged-retry opt-in attached to a request.
///
/// The transport arms the request's first deadline with `delay`; when that
/// fires without a response, `notify` tells the caller to dispatch a copy
/// to another endpoint while the primary stays queued with the rest of its
/// budget.
#[derive(Debug)]
pub struct BackupRequest {
    pub delay: Duration,
    pub notify: oneshot::Sender<()>,
}

/// An in-flight request as the timeout wheel keeps it.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub request_id: u32,
    /// Connector the request went out on; pools and pipelines need it.
    pub conn: usize,
    pub timeout: Duration,
    pub backup: Option<BackupRequest>,
    pub reply: oneshot::Sender<Result<Response, ClientError>>,
}

impl InFlight {
    /// The first wheel deadline: the hedge delay when a backup is armed,
    /// the full budget otherwise.
    pub fn first_deadline(&self, now_ms: u64) -> u64 {
        let delay = match &self.backup {
            Some(backup) => backup.delay,
            None => self.timeout,
        };
        now_ms + delay.as_millis() as u64
    }

    /// Handles this entry expiring at `now_ms`.
    ///
    /// With a backup armed this is the hedge trigger: the caller is
    /// notified, and the entry comes back with the remaining budget to be
    /// re-queued. Without one the caller gets the timeout and the entry is
    /// dropped.
    pub fn expire(mut self, now_ms: u64, peer: &str) -> Option<(InFlight, u64)> {
        if self.reply.is_closed() {
            // Caller cancelled; the entry just detaches.
            return None;
        }
        if let Some(backup) = self.backup.take() {
            warn!(
                request = self.request_id,
                peer, "request slow, triggering backup request"
            );
            let _ = backup.notify.send(());
            let remaining = self.timeout.saturating_sub(backup.delay);
            return Some((self, now_ms + remaining.as_millis() as u64));
        }

        let _ = self.reply.send(Err(ClientError::InvokeTimeout(format!(
            "no response from {peer} within the deadline"
        ))));
        None
    }

    /// Fails the entry with `error`.
    pub fn fail(self, error: ClientError) {
        let _ = self.reply.send(Err(error));
    }

    /// Completes the entry with `response`.
    pub fn complete(self, response: Response) {
        let _ = self.reply.send(Ok(response));
    }
}
