//! Serial port discovery and presence watching.
//!
//! The OS-level mechanism is deliberately behind a trait: transports take
//! an attach/detach event feed, not a concrete watcher. The polling
//! implementation below diffs the port enumeration and works everywhere
//! `serialport` does.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Attach/detach notification keyed by port name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    Attached(String),
    Detached(String),
}

impl PortEvent {
    pub fn port(&self) -> &str {
        match self {
            PortEvent::Attached(name) | PortEvent::Detached(name) => name,
        }
    }
}

/// Source of port presence events.
#[async_trait::async_trait]
pub trait PortMonitor: Send + Sync {
    async fn start(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    async fn stop(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Take the event receiver. Yields `None` before `start` or if it was
    /// already taken.
    fn take_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>>;
}

/// Collapses a rapid attach/detach bounce to its final state. Each event
/// restarts a per-port quiet window; only the last event seen before the
/// window elapses is delivered.
pub struct PortEventDebouncer {
    tx: mpsc::Sender<PortEvent>,
    window: Duration,
    inflight: HashMap<String, JoinHandle<()>>,
}

impl PortEventDebouncer {
    pub fn new(tx: mpsc::Sender<PortEvent>, debounce_ms: u64) -> Self {
        Self {
            tx,
            window: Duration::from_millis(debounce_ms),
            inflight: HashMap::new(),
        }
    }

    /// Schedule `event` for delivery once its port has been quiet for the
    /// debounce window. A newer event for the same port supersedes it.
    pub fn send_event(&mut self, event: PortEvent) {
        let port = event.port().to_string();
        if let Some(previous) = self.inflight.remove(&port) {
            previous.abort();
            log::debug!("Superseding pending port event on {}", port);
        }
        let tx = self.tx.clone();
        let window = self.window;
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(event).await;
        });
        self.inflight.insert(port, task);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A discovered serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortInfo {
    pub name: String,
    pub description: Option<String>,
}

/// Enumerate serial ports, sorted by name.
pub fn list_ports() -> Vec<SerialPortInfo> {
    let mut ports: Vec<SerialPortInfo> = match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let description = match p.port_type {
                    serialport::SerialPortType::UsbPort(usb) => usb.product,
                    serialport::SerialPortType::PciPort => Some("PCI device".to_string()),
                    serialport::SerialPortType::BluetoothPort => {
                        Some("Bluetooth device".to_string())
                    }
                    serialport::SerialPortType::Unknown => None,
                };
                SerialPortInfo {
                    name: p.port_name,
                    description,
                }
            })
            .collect(),
        Err(e) => {
            log::warn!("Port enumeration failed: {}", e);
            Vec::new()
        }
    };
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

fn current_port_names() -> HashSet<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            log::warn!("Port enumeration failed: {}", e);
            HashSet::new()
        }
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 32;
const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// Presence watcher that periodically diffs the port enumeration.
pub struct PollingPortMonitor {
    interval: Duration,
    receiver: Option<mpsc::Receiver<PortEvent>>,
    task: Option<JoinHandle<()>>,
}

impl PollingPortMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            receiver: None,
            task: None,
        }
    }
}

impl Default for PollingPortMonitor {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait::async_trait]
impl PortMonitor for PollingPortMonitor {
    async fn start(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.task.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.receiver = Some(rx);
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut debouncer = PortEventDebouncer::new(tx, DEFAULT_DEBOUNCE_MS);
            let mut known = current_port_names();
            loop {
                tokio::time::sleep(interval).await;
                if debouncer.is_closed() {
                    return;
                }
                let now = current_port_names();
                for added in now.difference(&known) {
                    debouncer.send_event(PortEvent::Attached(added.clone()));
                }
                for removed in known.difference(&now) {
                    debouncer.send_event(PortEvent::Detached(removed.clone()));
                }
                known = now;
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.receiver = None;
        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.receiver.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounce_collapses_to_final_state() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut debouncer = PortEventDebouncer::new(tx, 50);

        debouncer.send_event(PortEvent::Attached("COM3".into()));
        debouncer.send_event(PortEvent::Detached("COM3".into()));

        // Only the last event of the bounce survives the quiet window
        assert_eq!(rx.recv().await.unwrap(), PortEvent::Detached("COM3".into()));
        assert!(tokio::time::timeout(Duration::from_millis(150), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_debouncer_passes_spaced_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut debouncer = PortEventDebouncer::new(tx, 10);

        debouncer.send_event(PortEvent::Attached("COM3".into()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        debouncer.send_event(PortEvent::Detached("COM3".into()));

        assert_eq!(rx.recv().await.unwrap(), PortEvent::Attached("COM3".into()));
        assert_eq!(rx.recv().await.unwrap(), PortEvent::Detached("COM3".into()));
    }

    #[tokio::test]
    async fn test_ports_debounce_independently() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut debouncer = PortEventDebouncer::new(tx, 20);

        debouncer.send_event(PortEvent::Attached("COM3".into()));
        debouncer.send_event(PortEvent::Detached("COM4".into()));

        let mut delivered = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        delivered.sort_by_key(|e| e.port().to_string());
        assert_eq!(
            delivered,
            [
                PortEvent::Attached("COM3".into()),
                PortEvent::Detached("COM4".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_polling_monitor_receiver_lifecycle() {
        let mut monitor = PollingPortMonitor::new(Duration::from_millis(50));
        assert!(monitor.take_receiver().is_none());
        monitor.start().await.unwrap();
        assert!(monitor.take_receiver().is_some());
        assert!(monitor.take_receiver().is_none());
        monitor.stop().await.unwrap();
    }
}
