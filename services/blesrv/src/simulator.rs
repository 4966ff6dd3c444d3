//! Simulated BLE devices
//!
//! Speaks the real wire format: requests are CRC-checked Modbus frames,
//! responses are split into MTU-sized notifications, shunts stream `BW`
//! telemetry packets after subscription. Faults can be injected per device.
//! Used by the integration tests and by `blesrv --simulate`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ble_modbus::constants::{EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_WRITE_SINGLE_REGISTER};
use ble_modbus::crc::{append_crc, has_valid_crc};
use ble_modbus::models::{BATTERY_TYPE_REGISTER, LOAD_CONTROL_REGISTER};
use ble_modbus::shunt::{SHUNT_HEADER, SHUNT_PACKET_LEN};
use ble_modbus::{DeviceModel, ModelProtocol};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::transport::{
    BleLink, BleTransport, LinkId, TransportError, MODBUS_NOTIFY_CHAR, MODBUS_WRITE_CHAR,
    NOTIFY_QUEUE_DEPTH, SHUNT_NOTIFY_CHAR,
};

/// Default ATT payload size of a BLE 4.x link
pub const DEFAULT_MTU: usize = 20;

/// Misbehaviour to inject into a simulated device
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Refuse this many connect attempts before accepting
    pub connect_failures: u32,
    /// Accept requests but never answer
    pub silent: bool,
    /// Flip the last CRC byte of every response
    pub corrupt_crc: bool,
    /// Answer every request with this exception code
    pub exception: Option<u8>,
    /// Echo this value for writes instead of the one written
    pub echo_value: Option<u16>,
    /// Bytes sent before each response
    pub leading_noise: Vec<u8>,
    /// Send read responses as `payload + CRC` only
    pub strip_header: bool,
    /// Send only this many bytes of each response or telemetry packet
    pub truncate_to: Option<usize>,
    /// Delay between request and first notification
    pub response_delay: Duration,
}

/// One simulated peripheral
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub device_address: u8,
    pub protocol: ModelProtocol,
    registers: BTreeMap<u16, u16>,
    shunt_packet: Vec<u8>,
    /// Registers nudged by a few counts before every read
    drifting: Vec<u16>,
    pub faults: FaultConfig,
}

impl SimulatedDevice {
    fn empty(device_address: u8, protocol: ModelProtocol) -> Self {
        Self {
            device_address,
            protocol,
            registers: BTreeMap::new(),
            shunt_packet: Vec::new(),
            drifting: Vec::new(),
            faults: FaultConfig::default(),
        }
    }

    /// Solar charge controller with plausible daytime readings
    pub fn controller(device_address: u8) -> Self {
        let mut device = Self::empty(device_address, ModelProtocol::Modbus);
        device.set_ascii(0x000C, "  RNG-CTRL-RVR40");
        device.set_registers(0x001A, &[0x0001]);
        device.set_registers(
            0x0100,
            &[
                87,     // battery %
                146,    // 14.6 V
                523,    // 5.23 A
                0x1983, // 25 °C / -3 °C
                0,
                0,
                0,
                192, // pv 19.2 V
                156, // pv 1.56 A
                300, // pv 300 W
            ],
        );
        device.set_registers(0x011C, &[0x0001, 0xE240]);
        device.set_registers(0x0120, &[0x8005]);
        device.set_registers(BATTERY_TYPE_REGISTER, &[2]);
        device.set_registers(LOAD_CONTROL_REGISTER, &[1]);
        device
    }

    /// DC-DC charger with a full parameter block
    pub fn dcc(device_address: u8) -> Self {
        let mut device = Self::empty(device_address, ModelProtocol::Modbus);
        device.set_ascii(0x000C, "  RBC50D1S-G1   ");
        device.set_registers(0x001A, &[0x0001]);
        device.set_registers(0x0100, &[92, 138, 1210, 0x1E1C, 141, 850, 120]);
        device.set_registers(0x0120, &[0x0002]);
        device.set_registers(
            0xE001,
            &[
                4000, 0, 0, 4, 155, 144, 146, 144, 138, 132, 126, 120, 111, 106, 0, 5, 120, 120,
                30, 3, 0,
            ],
        );
        device
    }

    /// Battery shunt streaming one telemetry packet per subscription
    pub fn shunt() -> Self {
        let mut device = Self::empty(0, ModelProtocol::ShuntTelemetry);
        let mut packet = vec![0u8; SHUNT_PACKET_LEN];
        packet[0..2].copy_from_slice(SHUNT_HEADER);
        packet[2..4].copy_from_slice(&1u16.to_be_bytes());
        packet[21..24].copy_from_slice(&(-2500i32).to_be_bytes()[1..]);
        packet[25..28].copy_from_slice(&13_200u32.to_be_bytes()[1..]);
        packet[30..32].copy_from_slice(&12_650u16.to_be_bytes());
        packet[34..36].copy_from_slice(&875u16.to_be_bytes());
        device.shunt_packet = packet;
        device
    }

    /// Device matching a built-in model
    pub fn for_model(model: &DeviceModel, device_address: u8) -> Self {
        match model.key {
            "dcc" => Self::dcc(device_address),
            _ if model.protocol == ModelProtocol::ShuntTelemetry => Self::shunt(),
            _ => Self::controller(device_address),
        }
    }

    /// Let live readings (voltages, currents) wander between polls
    pub fn with_drift(mut self) -> Self {
        self.drifting = match self.protocol {
            ModelProtocol::Modbus => vec![0x0101, 0x0102, 0x0107, 0x0108],
            ModelProtocol::ShuntTelemetry => Vec::new(),
        };
        self
    }

    fn drift(&mut self) {
        let mut rng = rand::thread_rng();
        for register in &self.drifting {
            let entry = self.registers.entry(*register).or_insert(0);
            *entry = entry.saturating_add_signed(rng.gen_range(-2..=2));
        }
    }

    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    pub fn set_registers(&mut self, start: u16, words: &[u16]) {
        for (i, word) in words.iter().enumerate() {
            self.registers.insert(start.wrapping_add(i as u16), *word);
        }
    }

    fn set_ascii(&mut self, start: u16, text: &str) {
        let words: Vec<u16> = text
            .as_bytes()
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(b' ')]))
            .collect();
        self.set_registers(start, &words);
    }

    pub fn register(&self, register: u16) -> u16 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    /// Answer one request frame; `None` means no response at all
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 8 || !has_valid_crc(request) {
            debug!("Simulator ignored malformed request {}", hex::encode(request));
            return None;
        }
        if request[0] != self.device_address || self.faults.silent {
            return None;
        }

        let function = request[1];
        let register = u16::from_be_bytes([request[2], request[3]]);
        let operand = u16::from_be_bytes([request[4], request[5]]);

        let mut response = if let Some(code) = self.faults.exception {
            vec![self.device_address, function | EXCEPTION_FLAG, code]
        } else {
            match function {
                FC_READ_HOLDING_REGISTERS => {
                    self.drift();
                    let byte_count = operand.saturating_mul(2).min(u16::from(u8::MAX)) as u8;
                    let mut frame = vec![self.device_address, function, byte_count];
                    for offset in 0..operand {
                        let word = self.register(register.wrapping_add(offset));
                        frame.extend_from_slice(&word.to_be_bytes());
                    }
                    frame
                },
                FC_WRITE_SINGLE_REGISTER => {
                    let stored = self.faults.echo_value.unwrap_or(operand);
                    self.registers.insert(register, stored);
                    let mut frame = vec![self.device_address, function];
                    frame.extend_from_slice(&register.to_be_bytes());
                    frame.extend_from_slice(&stored.to_be_bytes());
                    frame
                },
                other => vec![self.device_address, other | EXCEPTION_FLAG, 0x01],
            }
        };
        append_crc(&mut response);

        if self.faults.corrupt_crc {
            if let Some(last) = response.last_mut() {
                *last ^= 0xFF;
            }
        }
        if self.faults.strip_header && function == FC_READ_HOLDING_REGISTERS {
            response.drain(..3);
        }
        if let Some(len) = self.faults.truncate_to {
            response.truncate(len);
        }
        if !self.faults.leading_noise.is_empty() {
            let mut noisy = self.faults.leading_noise.clone();
            noisy.extend_from_slice(&response);
            response = noisy;
        }
        Some(response)
    }
}

#[derive(Debug)]
struct OpenLink {
    address: String,
    subscriptions: HashMap<Uuid, mpsc::Sender<Bytes>>,
}

#[derive(Debug, Default)]
struct SimulatorState {
    devices: HashMap<String, SimulatedDevice>,
    links: HashMap<LinkId, OpenLink>,
    max_concurrent: usize,
    connects: Vec<(String, Instant)>,
    requests: Vec<(String, Vec<u8>)>,
}

/// In-process [`BleTransport`] backed by [`SimulatedDevice`]s
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimulatorState>>,
    next_link: Arc<AtomicU64>,
    mtu: usize,
    connect_delay: Duration,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatorState::default())),
            next_link: Arc::new(AtomicU64::new(1)),
            mtu: DEFAULT_MTU,
            connect_delay: Duration::ZERO,
        }
    }

    /// Time each connect takes before succeeding or failing
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(1);
        self
    }

    pub fn add_device(&self, address: impl Into<String>, device: SimulatedDevice) {
        self.state.lock().devices.insert(address.into(), device);
    }

    pub fn set_faults(&self, address: &str, faults: FaultConfig) {
        if let Some(device) = self.state.lock().devices.get_mut(address) {
            device.faults = faults;
        }
    }

    pub fn register(&self, address: &str, register: u16) -> Option<u16> {
        self.state
            .lock()
            .devices
            .get(address)
            .map(|device| device.register(register))
    }

    /// Links currently open
    pub fn active_connections(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Highest number of simultaneously open links seen so far
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }

    /// Successful connect instants, in order
    pub fn connect_log(&self) -> Vec<(String, Instant)> {
        self.state.lock().connects.clone()
    }

    /// Request frames received by `address`
    pub fn requests(&self, address: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(to, _)| to == address)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    fn link_address(&self, link: &BleLink) -> Result<String, TransportError> {
        self.state
            .lock()
            .links
            .get(&link.id)
            .map(|open| open.address.clone())
            .ok_or(TransportError::NotConnected(link.id))
    }

    /// Deliver `data` as MTU-sized notifications after `delay`
    fn notify(&self, sender: mpsc::Sender<Bytes>, data: Vec<u8>, delay: Duration) {
        let mtu = self.mtu;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for chunk in data.chunks(mtu) {
                trace!("Simulator notify {}", hex::encode(chunk));
                if sender.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    async fn connect(&self, address: &str) -> Result<BleLink, TransportError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(address)
            .ok_or_else(|| TransportError::ConnectFailed {
                address: address.to_string(),
                reason: "device not in range".to_string(),
            })?;
        if device.faults.connect_failures > 0 {
            device.faults.connect_failures -= 1;
            return Err(TransportError::ConnectFailed {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let id = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        state.links.insert(
            id,
            OpenLink {
                address: address.to_string(),
                subscriptions: HashMap::new(),
            },
        );
        state.max_concurrent = state.max_concurrent.max(state.links.len());
        state.connects.push((address.to_string(), Instant::now()));
        debug!("Simulator link {} open to {}", id, address);

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
        let (sender, receiver) = mpsc::channel(NOTIFY_QUEUE_DEPTH);

        let telemetry = {
            let mut state = self.state.lock();
            let open = state
                .links
                .get_mut(&link.id)
                .ok_or(TransportError::NotConnected(link.id))?;
            open.subscriptions.insert(characteristic, sender.clone());
            let address = open.address.clone();

            let device = state.devices.get(&address);
            match device {
                Some(device)
                    if device.protocol == ModelProtocol::ShuntTelemetry
                        && characteristic == SHUNT_NOTIFY_CHAR
                        && !device.faults.silent =>
                {
                    let mut packet = device.shunt_packet.clone();
                    if let Some(len) = device.faults.truncate_to {
                        packet.truncate(len);
                    }
                    Some((packet, device.faults.response_delay))
                },
                Some(device)
                    if device.protocol == ModelProtocol::Modbus
                        && characteristic != MODBUS_NOTIFY_CHAR =>
                {
                    return Err(TransportError::SubscribeFailed {
                        uuid: characteristic,
                        reason: "characteristic not found".to_string(),
                    });
                },
                _ => None,
            }
        };

        if let Some((packet, delay)) = telemetry {
            self.notify(sender, packet, delay);
        }
        Ok(receiver)
    }

    async fn unsubscribe(&self, link: &BleLink, characteristic: Uuid) -> Result<(), TransportError> {
        if let Some(open) = self.state.lock().links.get_mut(&link.id) {
            open.subscriptions.remove(&characteristic);
        }
        Ok(())
    }

    async fn write(
        &self,
        link: &BleLink,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if characteristic != MODBUS_WRITE_CHAR {
            return Err(TransportError::WriteFailed {
                uuid: characteristic,
                reason: "characteristic not writable".to_string(),
            });
        }
        let address = self.link_address(link)?;

        let reply = {
            let mut state = self.state.lock();
            state.requests.push((address.clone(), data.to_vec()));
            let sender = state
                .links
                .get(&link.id)
                .and_then(|open| open.subscriptions.get(&MODBUS_NOTIFY_CHAR).cloned());
            let device = state.devices.get_mut(&address);
            match (sender, device) {
                (Some(sender), Some(device)) => device
                    .respond(data)
                    .map(|response| (sender, response, device.faults.response_delay)),
                _ => None,
            }
        };

        if let Some((sender, response, delay)) = reply {
            self.notify(sender, response, delay);
        }
        Ok(())
    }

    async fn disconnect(&self, link: &BleLink) -> Result<(), TransportError> {
        if self.state.lock().links.remove(&link.id).is_some() {
            debug!("Simulator link {} closed", link.id);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use ble_modbus::{build_read_request, build_write_request, parse_response, RawPayload};

    async fn collect(receiver: &mut mpsc::Receiver<Bytes>, len: usize) -> Vec<u8> {
        let mut data = Vec::new();
        while data.len() < len {
            data.extend_from_slice(&receiver.recv().await.unwrap());
        }
        data
    }

    #[tokio::test]
    async fn test_read_response_fragmented_to_mtu() {
        let transport = SimulatedTransport::new();
        transport.add_device("AA", SimulatedDevice::controller(0xFF));

        let link = transport.connect("AA").await.unwrap();
        let mut notifications = transport.subscribe(&link, MODBUS_NOTIFY_CHAR).await.unwrap();
        let request = build_read_request(0xFF, 0x0100, 35).unwrap();
        transport.write(&link, MODBUS_WRITE_CHAR, &request).await.unwrap();

        let first = notifications.recv().await.unwrap();
        assert_eq!(first.len(), DEFAULT_MTU);
        let mut frame = first.to_vec();
        frame.extend(collect(&mut notifications, 75 - DEFAULT_MTU).await);

        match parse_response(&frame, 0xFF).unwrap() {
            RawPayload::Registers(data) => {
                assert_eq!(data.len(), 70);
                assert_eq!(&data[2..4], &146u16.to_be_bytes());
            },
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_updates_register_and_echoes() {
        let transport = SimulatedTransport::new();
        transport.add_device("AA", SimulatedDevice::controller(0xFF));

        let link = transport.connect("AA").await.unwrap();
        let mut notifications = transport.subscribe(&link, MODBUS_NOTIFY_CHAR).await.unwrap();
        let request = build_write_request(0xFF, BATTERY_TYPE_REGISTER, 4);
        transport.write(&link, MODBUS_WRITE_CHAR, &request).await.unwrap();

        let echo = collect(&mut notifications, 8).await;
        assert_eq!(echo, request);
        assert_eq!(transport.register("AA", BATTERY_TYPE_REGISTER), Some(4));
        assert_eq!(transport.requests("AA"), vec![request]);
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let transport = SimulatedTransport::new();
        transport.add_device(
            "AA",
            SimulatedDevice::controller(0xFF).with_faults(FaultConfig {
                connect_failures: 1,
                ..Default::default()
            }),
        );

        assert!(transport.connect("AA").await.is_err());
        let link = transport.connect("AA").await.unwrap();
        assert_eq!(transport.active_connections(), 1);
        transport.disconnect(&link).await.unwrap();
        assert_eq!(transport.active_connections(), 0);
        assert_eq!(transport.max_concurrent(), 1);
        assert!(transport.connect("BB").await.is_err());
    }

    #[tokio::test]
    async fn test_shunt_streams_packet_on_subscribe() {
        let transport = SimulatedTransport::new();
        transport.add_device("SH", SimulatedDevice::shunt());

        let link = transport.connect("SH").await.unwrap();
        let mut notifications = transport.subscribe(&link, SHUNT_NOTIFY_CHAR).await.unwrap();
        let packet = collect(&mut notifications, SHUNT_PACKET_LEN).await;
        assert!(packet.starts_with(SHUNT_HEADER));
    }
}
