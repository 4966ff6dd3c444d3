//! Connection session
//!
//! One session is one connection to one device:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Sending -> AwaitingResponse -> Parsing -> Closing -> Done
//!                                       ^                                   |            Failed
//!                                       +----------- next command ----------+
//! ```
//!
//! Every path out of `Connected`, including errors and cancellation, goes
//! through `Closing`, which unsubscribes and disconnects. If the session
//! future is dropped mid-flight, [`LinkGuard`] schedules the disconnect.

use std::sync::Arc;
use std::time::Duration;

use ble_modbus::shunt::{is_shunt_packet, SHUNT_HEADER, SHUNT_PACKET_LEN};
use ble_modbus::{
    build_read_request, build_write_request, parse_response, parse_shunt_packet, CodecError,
    Command, Decoded, DeviceModel, ExpectedFrame, FrameAssembler, ModelProtocol, RawPayload,
    ShuntError,
};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::PollingConfig;
use crate::error::SessionFailure;
use crate::transport::{BleLink, BleTransport, GattProfile, TransportError};

/// Pause between connect attempts
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Sending,
    AwaitingResponse,
    Parsing,
    Closing,
    Done,
    Failed,
}

/// Timing limits for one session
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for SessionSettings {
    fn from(polling: &PollingConfig) -> Self {
        Self {
            connect_attempts: polling.connect_attempts.max(1),
            connect_timeout: polling.connect_timeout(),
            response_timeout: polling.response_timeout(),
        }
    }
}

/// Device a session talks to
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub address: String,
    pub device_address: u8,
    pub model: &'static DeviceModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRequest {
    /// Every read command of the model, or one telemetry packet for shunts
    Read,
    /// Write one raw register value and verify the echo
    Write { register: u16, value: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Decoded(Decoded),
    WriteConfirmed { register: u16, value: u16 },
}

/// The single result of a session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: Result<SessionOutcome, SessionFailure>,
    pub final_state: SessionState,
    /// Every state entered, starting with `Idle`
    pub transitions: Vec<SessionState>,
    pub elapsed: Duration,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn passed_through(&self, state: SessionState) -> bool {
        self.transitions.contains(&state)
    }
}

/// Disconnects the link if the session is dropped before `Closing` ran
struct LinkGuard {
    transport: Arc<dyn BleTransport>,
    link: Option<BleLink>,
    subscribed: Option<Uuid>,
}

impl LinkGuard {
    fn new(transport: Arc<dyn BleTransport>, link: BleLink) -> Self {
        Self {
            transport,
            link: Some(link),
            subscribed: None,
        }
    }

    /// Unsubscribe and disconnect; failures here are logged, never reported
    async fn close(mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        if let Some(characteristic) = self.subscribed.take() {
            if let Err(e) = self.transport.unsubscribe(&link, characteristic).await {
                debug!("{}: unsubscribe failed: {}", link.address, e);
            }
        }
        if let Err(e) = self.transport.disconnect(&link).await {
            debug!("{}: disconnect failed: {}", link.address, e);
        }
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("{}: session dropped outside runtime, link {} leaked", link.address, link.id);
            return;
        };
        let transport = Arc::clone(&self.transport);
        let subscribed = self.subscribed.take();
        debug!("{}: session dropped, closing link {}", link.address, link.id);
        runtime.spawn(async move {
            if let Some(characteristic) = subscribed {
                let _ = transport.unsubscribe(&link, characteristic).await;
            }
            let _ = transport.disconnect(&link).await;
        });
    }
}

/// One connect/exchange/close cycle against one device
pub struct Session {
    transport: Arc<dyn BleTransport>,
    target: SessionTarget,
    request: SessionRequest,
    settings: SessionSettings,
    state: SessionState,
    transitions: Vec<SessionState>,
}

impl Session {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        target: SessionTarget,
        request: SessionRequest,
        settings: SessionSettings,
    ) -> Self {
        Self {
            transport,
            target,
            request,
            settings,
            state: SessionState::Idle,
            transitions: vec![SessionState::Idle],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        trace!("{}: {:?} -> {:?}", self.target.address, self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    /// Drive the session to `Done` or `Failed`
    pub async fn run(mut self, cancel: &CancellationToken) -> SessionReport {
        let started = Instant::now();
        let profile = GattProfile::for_protocol(self.target.model.protocol);

        if matches!(self.request, SessionRequest::Write { .. }) && profile.write.is_none() {
            return self.finish(
                Err(SessionFailure::Unsupported("device does not accept writes")),
                started,
            );
        }

        self.transition(SessionState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionFailure::Cancelled),
            result = self.connect() => result,
        };
        let link = match connected {
            Ok(link) => link,
            Err(failure) => {
                self.transition(SessionState::Closing);
                return self.finish(Err(failure), started);
            },
        };

        let mut guard = LinkGuard::new(Arc::clone(&self.transport), link.clone());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionFailure::Cancelled),
            result = self.exchange(&link, profile, &mut guard) => result,
        };

        self.transition(SessionState::Closing);
        guard.close().await;
        self.finish(result, started)
    }

    fn finish(
        mut self,
        outcome: Result<SessionOutcome, SessionFailure>,
        started: Instant,
    ) -> SessionReport {
        let elapsed = started.elapsed();
        match &outcome {
            Ok(_) => {
                self.transition(SessionState::Done);
                debug!(
                    "{}: session done in {:?} ({} states)",
                    self.target.address,
                    elapsed,
                    self.transitions.len()
                );
            },
            Err(failure) => {
                self.transition(SessionState::Failed);
                warn!(
                    "{}: session failed [{}]: {}",
                    self.target.address,
                    failure.kind(),
                    failure
                );
            },
        }
        SessionReport {
            outcome,
            final_state: self.state,
            transitions: self.transitions,
            elapsed,
        }
    }

    async fn connect(&self) -> Result<BleLink, SessionFailure> {
        let attempts = self.settings.connect_attempts;
        for attempt in 1..=attempts {
            match timeout(
                self.settings.connect_timeout,
                self.transport.connect(&self.target.address),
            )
            .await
            {
                Ok(Ok(link)) => {
                    debug!(
                        "{}: connected (link {}, attempt {}/{})",
                        self.target.address, link.id, attempt, attempts
                    );
                    return Ok(link);
                },
                Ok(Err(e)) => warn!(
                    "{}: connect attempt {}/{} failed: {}",
                    self.target.address, attempt, attempts, e
                ),
                Err(_) => warn!(
                    "{}: connect attempt {}/{} timed out after {:?}",
                    self.target.address, attempt, attempts, self.settings.connect_timeout
                ),
            }
            if attempt < attempts {
                tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
            }
        }
        Err(SessionFailure::ConnectTimeout { attempts })
    }

    async fn exchange(
        &mut self,
        link: &BleLink,
        profile: GattProfile,
        guard: &mut LinkGuard,
    ) -> Result<SessionOutcome, SessionFailure> {
        let mut notifications = self.transport.subscribe(link, profile.notify).await?;
        guard.subscribed = Some(profile.notify);
        self.transition(SessionState::Connected);

        match (self.target.model.protocol, profile.write, self.request) {
            (ModelProtocol::ShuntTelemetry, _, SessionRequest::Read) => {
                let decoded = self.listen_for_shunt_packet(&mut notifications).await?;
                Ok(SessionOutcome::Decoded(decoded))
            },
            (ModelProtocol::Modbus, Some(write_char), SessionRequest::Read) => {
                let model = self.target.model;
                let mut decoded = Decoded::default();
                for command in model.commands {
                    let data = self
                        .read_command(link, write_char, &mut notifications, command)
                        .await?;
                    let block = model.decode_command(command, &data);
                    for diagnostic in &block.diagnostics {
                        warn!(
                            "{}: field {} skipped: {}",
                            self.target.address, diagnostic.field, diagnostic.error
                        );
                    }
                    decoded.merge(block);
                }
                info!(
                    "{}: read {} values over {} command(s)",
                    self.target.address,
                    decoded.values.len(),
                    model.commands.len()
                );
                Ok(SessionOutcome::Decoded(decoded))
            },
            (ModelProtocol::Modbus, Some(write_char), SessionRequest::Write { register, value }) => {
                self.write_register(link, write_char, &mut notifications, register, value)
                    .await
            },
            _ => Err(SessionFailure::Unsupported("request not supported by device")),
        }
    }

    async fn read_command(
        &mut self,
        link: &BleLink,
        write_char: Uuid,
        notifications: &mut mpsc::Receiver<Bytes>,
        command: &Command,
    ) -> Result<Vec<u8>, SessionFailure> {
        let request = build_read_request(
            self.target.device_address,
            command.register,
            command.word_count,
        )?;
        let expected = ExpectedFrame::ReadResponse {
            word_count: command.word_count,
        };
        let payload = self
            .request_response(link, write_char, notifications, &request, expected)
            .await?;

        match payload {
            RawPayload::Registers(data) if data.len() == command.word_count as usize * 2 => {
                Ok(data)
            },
            RawPayload::Registers(data) => Err(CodecError::Truncated {
                expected: command.word_count as usize * 2,
                actual: data.len(),
            }
            .into()),
            RawPayload::WriteEcho { .. } => Err(CodecError::UnexpectedFunction(
                ble_modbus::constants::FC_WRITE_SINGLE_REGISTER,
            )
            .into()),
        }
    }

    async fn write_register(
        &mut self,
        link: &BleLink,
        write_char: Uuid,
        notifications: &mut mpsc::Receiver<Bytes>,
        register: u16,
        value: u16,
    ) -> Result<SessionOutcome, SessionFailure> {
        let request = build_write_request(self.target.device_address, register, value);
        let payload = self
            .request_response(
                link,
                write_char,
                notifications,
                &request,
                ExpectedFrame::WriteEcho,
            )
            .await?;

        match payload {
            echo if echo.is_echo_of(register, value) => {
                info!(
                    "{}: register {:#06X} set to {}",
                    self.target.address, register, value
                );
                Ok(SessionOutcome::WriteConfirmed { register, value })
            },
            RawPayload::WriteEcho {
                register: echoed_register,
                value: echoed,
            } => Err(SessionFailure::WriteVerificationFailed {
                register,
                sent: value,
                echoed_register,
                echoed,
            }),
            RawPayload::Registers(_) => Err(CodecError::UnexpectedFunction(
                ble_modbus::constants::FC_READ_HOLDING_REGISTERS,
            )
            .into()),
        }
    }

    /// Send one request and assemble its response from notifications
    async fn request_response(
        &mut self,
        link: &BleLink,
        write_char: Uuid,
        notifications: &mut mpsc::Receiver<Bytes>,
        request: &[u8],
        expected: ExpectedFrame,
    ) -> Result<RawPayload, SessionFailure> {
        self.transition(SessionState::Sending);
        while let Ok(stale) = notifications.try_recv() {
            debug!(
                "{}: discarding stale notification {}",
                self.target.address,
                hex::encode(&stale)
            );
        }
        debug!("{}: -> {}", self.target.address, hex::encode(request));
        self.transport.write(link, write_char, request).await?;

        self.transition(SessionState::AwaitingResponse);
        let response_timeout = self.settings.response_timeout;
        let deadline = Instant::now() + response_timeout;
        let mut assembler = FrameAssembler::new(self.target.device_address, expected);

        let frame = loop {
            match timeout_at(deadline, notifications.recv()).await {
                Ok(Some(fragment)) => {
                    if let Some(frame) = assembler.push(&fragment) {
                        break frame;
                    }
                },
                Ok(None) => return Err(TransportError::Disconnected.into()),
                Err(_) if assembler.buffered() == 0 => {
                    return Err(SessionFailure::NotificationTimeout(response_timeout));
                },
                Err(_) => {
                    debug!(
                        "{}: partial response {}",
                        self.target.address,
                        hex::encode(assembler.partial())
                    );
                    return Err(CodecError::Truncated {
                        expected: expected.frame_len(),
                        actual: assembler.buffered(),
                    }
                    .into());
                },
            }
        };

        self.transition(SessionState::Parsing);
        debug!("{}: <- {}", self.target.address, hex::encode(&frame));
        Ok(parse_response(&frame, self.target.device_address)?)
    }

    /// Wait for one complete `BW` telemetry packet
    async fn listen_for_shunt_packet(
        &mut self,
        notifications: &mut mpsc::Receiver<Bytes>,
    ) -> Result<Decoded, SessionFailure> {
        self.transition(SessionState::AwaitingResponse);
        let response_timeout = self.settings.response_timeout;
        let deadline = Instant::now() + response_timeout;
        let mut buffer = BytesMut::with_capacity(SHUNT_PACKET_LEN);

        let packet = loop {
            let start = buffer
                .windows(SHUNT_HEADER.len())
                .position(|window| window == SHUNT_HEADER);
            if let Some(start) = start {
                if buffer.len() - start >= SHUNT_PACKET_LEN {
                    break buffer[start..start + SHUNT_PACKET_LEN].to_vec();
                }
            }

            match timeout_at(deadline, notifications.recv()).await {
                Ok(Some(fragment)) => buffer.extend_from_slice(&fragment),
                Ok(None) => return Err(TransportError::Disconnected.into()),
                Err(_) if buffer.is_empty() => {
                    return Err(SessionFailure::NotificationTimeout(response_timeout));
                },
                Err(_) => match start {
                    Some(start) if is_shunt_packet(&buffer[start..]) => {
                        break buffer[start..].to_vec();
                    },
                    Some(start) => {
                        return Err(ShuntError::TooShort(buffer.len() - start).into());
                    },
                    None => {
                        return Err(ShuntError::BadHeader(hex::encode(&buffer[..2.min(buffer.len())]))
                            .into());
                    },
                },
            }
        };

        self.transition(SessionState::Parsing);
        Ok(parse_shunt_packet(&packet)?)
    }
}
