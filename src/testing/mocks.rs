//! Mock implementations for testing.
//!
//! Provides a recording protocol client and a controllable auth provider so
//! pipeline behavior can be exercised without a broker.

use crate::auth::{AuthProvider, SasToken};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::{ProtocolClient, TransportNotification};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Recording protocol client with scriptable outcomes.
///
/// Calls succeed unless a result was queued with `push_*_result`. Incoming
/// traffic and unsolicited drops are injected through [`FakeProtocolClient::inject`].
pub struct FakeProtocolClient {
    connect_calls: AtomicU32,
    connect_results: Mutex<VecDeque<DeviceResult<()>>>,
    connect_delay: Mutex<Option<Duration>>,
    publish_delay: Mutex<Option<Duration>>,
    publish_results: Mutex<VecDeque<DeviceResult<()>>>,
    published: Mutex<Vec<(String, Bytes)>>,
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    notifications_tx: mpsc::UnboundedSender<TransportNotification>,
    notifications_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportNotification>>>,
}

impl FakeProtocolClient {
    pub fn new() -> Self {
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        Self {
            connect_calls: AtomicU32::new(0),
            connect_results: Mutex::new(VecDeque::new()),
            connect_delay: Mutex::new(None),
            publish_delay: Mutex::new(None),
            publish_results: Mutex::new(VecDeque::new()),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            notifications_tx,
            notifications_rx: Mutex::new(Some(notifications_rx)),
        }
    }

    /// Queue the outcome of the next connect call.
    pub fn push_connect_result(&self, result: DeviceResult<()>) {
        self.connect_results.lock().unwrap().push_back(result);
    }

    /// Queue the outcome of the next publish call.
    pub fn push_publish_result(&self, result: DeviceResult<()>) {
        self.publish_results.lock().unwrap().push_back(result);
    }

    /// Make connect calls take this long before resolving.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Make publish calls take this long before resolving.
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock().unwrap() = Some(delay);
    }

    /// Deliver an unsolicited notification, as the broker would.
    pub fn inject(&self, notification: TransportNotification) {
        let _ = self.notifications_tx.send(notification);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }
}

impl Default for FakeProtocolClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolClient for FakeProtocolClient {
    async fn connect(&self, _credential: SasToken) -> Result<(), DeviceError> {
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connect_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn publish(&self, topic: String, payload: Bytes) -> Result<(), DeviceError> {
        let delay = *self.publish_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.publish_results.lock().unwrap().pop_front();
        match scripted {
            Some(Err(e)) => Err(e),
            _ => {
                self.published.lock().unwrap().push((topic, payload));
                Ok(())
            }
        }
    }

    async fn subscribe(&self, topic_filter: String) -> Result<(), DeviceError> {
        self.subscribed.lock().unwrap().push(topic_filter);
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: String) -> Result<(), DeviceError> {
        self.unsubscribed.lock().unwrap().push(topic_filter);
        Ok(())
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<TransportNotification>> {
        self.notifications_rx.lock().unwrap().take()
    }
}

/// Auth provider with a controllable token lifetime and scriptable renewal.
pub struct FakeAuthProvider {
    token: Mutex<SasToken>,
    renewed_ttl_secs: i64,
    renewals: AtomicU32,
    renew_delay: Mutex<Option<Duration>>,
    fail_next_renewal: Mutex<Option<DeviceError>>,
}

impl FakeAuthProvider {
    /// Provider whose current token expires `ttl_secs` from now and whose
    /// renewed tokens live for `renewed_ttl_secs`.
    pub fn new(ttl_secs: i64, renewed_ttl_secs: i64) -> Self {
        Self {
            token: Mutex::new(Self::make_token(ttl_secs)),
            renewed_ttl_secs,
            renewals: AtomicU32::new(0),
            renew_delay: Mutex::new(None),
            fail_next_renewal: Mutex::new(None),
        }
    }

    /// Make renewals take this long, to widen the outstanding-renewal window.
    pub fn set_renew_delay(&self, delay: Duration) {
        *self.renew_delay.lock().unwrap() = Some(delay);
    }

    fn make_token(ttl_secs: i64) -> SasToken {
        SasToken::new(
            format!("SharedAccessSignature sig=fake&se={ttl_secs}"),
            Utc::now() + ChronoDuration::seconds(ttl_secs),
        )
    }

    pub fn fail_next_renewal(&self, error: DeviceError) {
        *self.fail_next_renewal.lock().unwrap() = Some(error);
    }

    pub fn renewals(&self) -> u32 {
        self.renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for FakeAuthProvider {
    fn current_token(&self) -> SasToken {
        self.token.lock().unwrap().clone()
    }

    async fn renew_token(&self) -> DeviceResult<SasToken> {
        let delay = *self.renew_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_next_renewal.lock().unwrap().take() {
            return Err(error);
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        let fresh = Self::make_token(self.renewed_ttl_secs);
        *self.token.lock().unwrap() = fresh.clone();
        Ok(fresh)
    }
}
