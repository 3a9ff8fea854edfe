// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::Semaphore;

/// A DATA payload arrived larger than what is left of the advertised
/// receive window.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WindowExceeded {
    pub got: u32,
    pub remaining: u32,
}

/// Why send credit could not be acquired.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendCreditError {
    /// The stream failed or closed while waiting.
    StreamGone,
    /// The payload can never fit the negotiated window.
    PayloadTooLarge { len: u32, window: u32 },
}

/// Send-side credit window.
///
/// Starts undecided with zero credit; the INIT exchange either enables it
/// with the peer's advertised window or disables it entirely (a window of 0
/// means the peer does not do flow control). Senders block on [`acquire`]
/// until FEEDBACK grants catch up.
///
/// [`acquire`]: SendFlow::acquire
#[derive(Debug)]
pub struct SendFlow {
    enabled: AtomicBool,
    window: AtomicU32,
    credits: Semaphore,
}

impl SendFlow {
    pub fn new() -> Self {
        SendFlow {
            enabled: AtomicBool::new(true),
            window: AtomicU32::new(0),
            credits: Semaphore::new(0),
        }
    }

    /// Arms the window after INIT negotiation.
    pub fn enable(&self, window: u32) {
        self.window.store(window, Ordering::Release);
        self.credits.add_permits(window as usize);
    }

    /// Turns flow control off; every acquire succeeds immediately.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Applies a FEEDBACK grant.
    pub fn grant(&self, increment: u32) {
        if self.enabled.load(Ordering::Acquire) {
            self.credits.add_permits(increment as usize);
        }
    }

    /// Fails every current and future acquire. Called when the stream dies.
    pub fn fail(&self) {
        self.credits.close();
    }

    /// Takes `len` bytes of credit, suspending until enough is available.
    pub async fn acquire(&self, len: u32) -> Result<(), SendCreditError> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let window = self.window.load(Ordering::Acquire);
        if len > window {
            return Err(SendCreditError::PayloadTooLarge { len, window });
        }
        let permit = self
            .credits
            .acquire_many(len)
            .await
            .map_err(|_| SendCreditError::StreamGone)?;
        permit.forget();
        Ok(())
    }

    /// Credit currently available, for diagnostics and tests.
    pub fn available(&self) -> usize {
        self.credits.available_permits()
    }
}

impl Default for SendFlow {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-side credit window.
///
/// Counts consumed payload down from the advertised window; once less than
/// a quarter of the initial window remains, the counter resets and the
/// accumulated amount is returned so the caller can emit one FEEDBACK frame.
#[derive(Clone, Debug)]
pub struct RecvFlow {
    initial: u32,
    remaining: u32,
}

impl RecvFlow {
    pub fn new(initial: u32) -> Self {
        RecvFlow {
            initial,
            remaining: initial,
        }
    }

    /// Accounts for one consumed DATA payload of `len` bytes.
    ///
    /// Returns `Ok(Some(increment))` when a FEEDBACK frame carrying
    /// `increment` must go out.
    pub fn consume(&mut self, len: u32) -> Result<Option<u32>, WindowExceeded> {
        if len > self.remaining {
            return Err(WindowExceeded {
                got: len,
                remaining: self.remaining,
            });
        }
        self.remaining -= len;

        if self.remaining < self.initial / 4 {
            let increment = self.initial - self.remaining;
            self.remaining = self.initial;
            return Ok(Some(increment));
        }
        Ok(None)
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn recv_flow_grants_credit_below_quarter() {
        let mut flow = RecvFlow::new(100);

        assert_eq!(flow.consume(50), Ok(None));
        assert_eq!(flow.remaining(), 50);

        // 25 left is not yet below one quarter (25).
        assert_eq!(flow.consume(25), Ok(None));
        assert_eq!(flow.remaining(), 25);

        // 24 left crosses the threshold: grant 100 - 24 = 76, reset.
        assert_eq!(flow.consume(1), Ok(Some(76)));
        assert_eq!(flow.remaining(), 100);
    }

    #[test]
    fn recv_flow_rejects_oversized_payload() {
        let mut flow = RecvFlow::new(10);
        assert_eq!(flow.consume(8), Ok(None));
        assert_eq!(
            flow.consume(11),
            Err(WindowExceeded {
                got: 11,
                remaining: 2
            })
        );
    }

    #[tokio::test]
    async fn send_flow_blocks_until_feedback() {
        let flow = Arc::new(SendFlow::new());
        flow.enable(10);

        flow.acquire(8).await.unwrap();
        assert_eq!(flow.available(), 2);

        let waiter = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.acquire(5).await })
        };
        // Not enough credit; the waiter must still be parked.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        flow.grant(8);
        waiter.await.unwrap().unwrap();
        assert_eq!(flow.available(), 5);
    }

    #[tokio::test]
    async fn send_flow_disabled_never_blocks() {
        let flow = SendFlow::new();
        flow.disable();
        flow.acquire(1 << 20).await.unwrap();
    }

    #[tokio::test]
    async fn send_flow_fail_wakes_waiters_with_error() {
        let flow = Arc::new(SendFlow::new());
        flow.enable(10);
        flow.acquire(8).await.unwrap();

        let waiter = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.acquire(5).await })
        };
        tokio::task::yield_now().await;
        flow.fail();

        assert_eq!(waiter.await.unwrap(), Err(SendCreditError::StreamGone));
    }

    #[tokio::test]
    async fn send_flow_rejects_payload_beyond_window() {
        let flow = SendFlow::new();
        flow.enable(16);
        assert_eq!(
            flow.acquire(17).await,
            Err(SendCreditError::PayloadTooLarge {
                len: 17,
                window: 16
            })
        );
    }
}
