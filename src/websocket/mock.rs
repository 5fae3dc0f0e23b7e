//! Scripted in-memory transport for tests

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::config::WsConfig;
use super::transport::{Transport, TransportEvent, TransportEvents, TransportFactory};
use crate::error::{Error, Result};

/// Records every sent frame and lets a test play the server's part
#[derive(Debug, Default)]
pub struct MockTransport {
    sent: Mutex<Vec<String>>,
    events: Mutex<Option<TransportEvents>>,
    open: AtomicBool,
    closed: AtomicBool,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that already counts as open, for driving the pump directly
    pub fn opened() -> Self {
        let transport = Self::default();
        transport.open.store(true, Ordering::SeqCst);
        transport
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent frames parsed as JSON
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Wait until at least `count` frames were sent, then return them all
    pub async fn wait_for_sent(&self, count: usize) -> Vec<Value> {
        for _ in 0..200 {
            if self.sent.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent_json()
    }

    /// Deliver an inbound text frame
    pub fn inject(&self, text: &str) {
        self.emit(TransportEvent::Message(text.to_string()));
    }

    /// Deliver an inbound JSON frame
    pub fn inject_json(&self, value: Value) {
        self.inject(&value.to_string());
    }

    /// Server-side close, as the read half would report it
    pub fn drop_connection(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Close);
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, events: TransportEvents) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let _ = events.send(TransportEvent::Open);
        *self.events.lock().unwrap() = Some(events);
        self.open.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport("Not connected".to_string()));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        *self.events.lock().unwrap() = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory handing out one shared mock
#[derive(Debug, Clone)]
pub struct MockFactory(pub Arc<MockTransport>);

impl TransportFactory for MockFactory {
    fn create(&self, _config: &WsConfig) -> Arc<dyn Transport> {
        self.0.clone()
    }
}
