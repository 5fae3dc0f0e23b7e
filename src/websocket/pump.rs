//! Send/receive pump
//!
//! One task drains the outbound queue onto the transport in enqueue order.
//! Another takes transport events one at a time and hands text frames to the
//! listener. Both stop together when the pump is shut down. The receive task
//! also stops on its own when the connection ends or goes quiet for longer
//! than the idle timeout, after telling the listener the connection was lost.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use super::transport::{Transport, TransportEvent};
use crate::error::Result;

/// Receiver of what the pump reads
#[async_trait]
pub trait PumpListener: Send + Sync + 'static {
    /// Handle one inbound text frame
    async fn on_text(&self, text: &str) -> Result<()>;

    /// The connection of the given generation is gone. Must not block.
    fn on_lost(&self, generation: u64, reason: &str);
}

/// Handle to the running pump of one connection
#[derive(Debug)]
pub struct Pump {
    outbound: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
}

impl Pump {
    /// Start both loops for a freshly opened connection
    pub fn start<L: PumpListener>(
        generation: u64,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        listener: Weak<L>,
        idle_timeout: Duration,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(send_loop(transport, outbound_rx, shutdown_rx.clone()));
        tokio::spawn(receive_loop(
            generation,
            inbound,
            listener,
            idle_timeout,
            shutdown_rx,
        ));

        Self {
            outbound,
            shutdown_tx,
        }
    }

    /// Queue a text frame for sending. Returns false once the send loop is gone.
    pub fn enqueue(&self, text: String) -> bool {
        self.outbound.send(text).is_ok()
    }

    /// Signal both loops to exit
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn send_loop(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            item = outbound.recv() => {
                let Some(text) = item else { break };
                tracing::trace!("Sending {text}");
                if let Err(e) = transport.send(text).await {
                    // The receive loop notices the dead connection
                    tracing::warn!("Send failed: {e}");
                }
            }
        }
    }
    tracing::debug!("Send loop stopped");
}

async fn receive_loop<L: PumpListener>(
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    listener: Weak<L>,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            next = timeout(idle_timeout, inbound.recv()) => next,
        };

        let Some(listener) = listener.upgrade() else {
            break;
        };

        match event {
            Ok(Some(TransportEvent::Message(text))) => {
                if let Err(e) = listener.on_text(&text).await {
                    tracing::error!("Failed to handle frame {text}: {e}");
                }
            }
            Ok(Some(TransportEvent::Open)) => {
                tracing::debug!("Transport open");
            }
            Ok(Some(TransportEvent::Alive)) => {
                tracing::trace!("Heartbeat answered");
            }
            Ok(Some(TransportEvent::Error(e))) => {
                tracing::warn!("Transport error: {e}");
                listener.on_lost(generation, &e);
                break;
            }
            Ok(Some(TransportEvent::Close)) => {
                listener.on_lost(generation, "transport closed");
                break;
            }
            Ok(None) => {
                listener.on_lost(generation, "transport dropped");
                break;
            }
            Err(_) => {
                tracing::warn!("No message for {idle_timeout:?}, presuming the connection dead");
                listener.on_lost(generation, "idle timeout");
                break;
            }
        }
    }
    tracing::debug!("Receive loop stopped");
}
