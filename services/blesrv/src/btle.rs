//! btleplug transport
//!
//! Talks to real peripherals through the host Bluetooth stack. Each link
//! holds the connected peripheral plus one forwarding task per subscribed
//! characteristic that copies matching notifications into the session's
//! channel.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::transport::{BleLink, BleTransport, LinkId, TransportError, NOTIFY_QUEUE_DEPTH};

/// Pause between peripheral list checks while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct OpenLink {
    peripheral: Peripheral,
    forwarders: HashMap<Uuid, JoinHandle<()>>,
}

impl OpenLink {
    fn stop_forwarders(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}

/// GATT central backed by the platform adapters btleplug finds
pub struct BtleTransport {
    adapters: Vec<Adapter>,
    links: Mutex<HashMap<LinkId, OpenLink>>,
    next_link: AtomicU64,
}

impl BtleTransport {
    /// Open the platform manager and collect its adapters
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(|e| unavailable(&e))?;
        let adapters = manager.adapters().await.map_err(|e| unavailable(&e))?;
        if adapters.is_empty() {
            return Err(TransportError::ConnectFailed {
                address: String::new(),
                reason: "no Bluetooth adapters found".to_string(),
            });
        }
        for adapter in &adapters {
            if let Ok(name) = adapter.adapter_info().await {
                info!("Bluetooth adapter {}", name);
            }
        }
        Ok(Self {
            adapters,
            links: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
        })
    }

    /// Scan every adapter until a peripheral with `target` shows up
    async fn find(&self, target: BDAddr) -> Result<Peripheral, TransportError> {
        let address = target.to_string();
        for adapter in &self.adapters {
            adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(|e| connect_failed(&address, &e))?;
        }

        loop {
            for adapter in &self.adapters {
                let peripherals = adapter
                    .peripherals()
                    .await
                    .map_err(|e| connect_failed(&address, &e))?;
                if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == target) {
                    return Ok(peripheral);
                }
            }
            trace!("{}: not seen yet", address);
            sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    fn peripheral(&self, link: &BleLink) -> Result<Peripheral, TransportError> {
        self.links
            .lock()
            .get(&link.id)
            .map(|open| open.peripheral.clone())
            .ok_or(TransportError::NotConnected(link.id))
    }
}

fn unavailable(err: &btleplug::Error) -> TransportError {
    TransportError::ConnectFailed {
        address: String::new(),
        reason: err.to_string(),
    }
}

fn connect_failed(address: &str, err: &btleplug::Error) -> TransportError {
    TransportError::ConnectFailed {
        address: address.to_string(),
        reason: err.to_string(),
    }
}

fn parse_address(address: &str) -> Result<BDAddr, TransportError> {
    BDAddr::from_str(address).map_err(|e| TransportError::ConnectFailed {
        address: address.to_string(),
        reason: format!("invalid address: {}", e),
    })
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
}

#[async_trait]
impl BleTransport for BtleTransport {
    async fn connect(&self, address: &str) -> Result<BleLink, TransportError> {
        let target = parse_address(address)?;
        let peripheral = self.find(target).await?;
        for adapter in &self.adapters {
            if let Err(e) = adapter.stop_scan().await {
                debug!("{}: stop scan failed: {}", address, e);
            }
        }

        if !peripheral
            .is_connected()
            .await
            .map_err(|e| connect_failed(address, &e))?
        {
            peripheral
                .connect()
                .await
                .map_err(|e| connect_failed(address, &e))?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(|e| connect_failed(address, &e))?;

        let id = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        self.links.lock().insert(
            id,
            OpenLink {
                peripheral,
                forwarders: HashMap::new(),
            },
        );
        debug!("Link {} open to {}", id, address);
        Ok(BleLink {
            id,
            address: address.to_string(),
        })
    }

    async fn subscribe(
        &self,
        link: &BleLink,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        let peripheral = self.peripheral(link)?;
        let subscribe_failed = |reason: String| TransportError::SubscribeFailed {
            uuid: characteristic,
            reason,
        };
        let target = find_characteristic(&peripheral, characteristic)
            .ok_or_else(|| subscribe_failed("characteristic not found".to_string()))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| subscribe_failed(e.to_string()))?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| subscribe_failed(e.to_string()))?;

        let (sender, receiver) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if sender.send(Bytes::from(notification.value)).await.is_err() {
                    break;
                }
            }
        });

        let mut links = self.links.lock();
        match links.get_mut(&link.id) {
            Some(open) => {
                if let Some(previous) = open.forwarders.insert(characteristic, forwarder) {
                    previous.abort();
                }
                Ok(receiver)
            },
            None => {
                forwarder.abort();
                Err(TransportError::NotConnected(link.id))
            },
        }
    }

    async fn unsubscribe(&self, link: &BleLink, characteristic: Uuid) -> Result<(), TransportError> {
        let peripheral = {
            let mut links = self.links.lock();
            let Some(open) = links.get_mut(&link.id) else {
                return Ok(());
            };
            if let Some(forwarder) = open.forwarders.remove(&characteristic) {
                forwarder.abort();
            }
            open.peripheral.clone()
        };

        if let Some(target) = find_characteristic(&peripheral, characteristic) {
            if let Err(e) = peripheral.unsubscribe(&target).await {
                debug!("{}: unsubscribe {} failed: {}", link.address, characteristic, e);
            }
        }
        Ok(())
    }

    async fn write(
        &self,
        link: &BleLink,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(link)?;
        let write_failed = |reason: String| TransportError::WriteFailed {
            uuid: characteristic,
            reason,
        };
        let target = find_characteristic(&peripheral, characteristic)
            .ok_or_else(|| write_failed("characteristic not found".to_string()))?;

        peripheral
            .write(&target, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| write_failed(e.to_string()))
    }

    async fn disconnect(&self, link: &BleLink) -> Result<(), TransportError> {
        let removed = self.links.lock().remove(&link.id);
        let Some(mut open) = removed else {
            return Ok(());
        };
        open.stop_forwarders();

        match open.peripheral.disconnect().await {
            Ok(()) => debug!("Link {} to {} closed", link.id, link.address),
            Err(e) => debug!("{}: disconnect failed: {}", link.address, e),
        }
        Ok(())
    }
}
