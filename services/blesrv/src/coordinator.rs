//! Polling coordinator
//!
//! Owns every device's schedule. A single loop pops due devices from a
//! min-heap and spawns one job per device; a job waits for an adapter slot,
//! runs a session and hands the outcome back to the loop, which reschedules
//! the device. Control requests arrive on a channel through
//! [`CoordinatorHandle`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ble_modbus::{DeviceModel, RegisterMap, WriteValidationError};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdapterSnapshot, AdmissionController};
use crate::config::{AppConfig, DeviceConfig, PollingConfig};
use crate::device::{DeviceRuntime, DeviceSnapshot};
use crate::error::{BleSrvError, Result, SessionFailure};
use crate::session::{Session, SessionOutcome, SessionRequest, SessionSettings, SessionTarget};
use crate::sink::{DeviceEvent, StateSink};
use crate::transport::BleTransport;

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Retry delay after `failures` consecutive failed polls
///
/// `min(base * 2^min(failures, cap_exponent), poll_interval * max_backoff_factor)`
pub fn backoff_delay(failures: u32, polling: &PollingConfig, poll_interval: Duration) -> Duration {
    let exponent = failures.min(polling.backoff_cap_exponent).min(31);
    let grown = polling.backoff_base().saturating_mul(1u32 << exponent);
    let ceiling = poll_interval.saturating_mul(polling.max_backoff_factor.max(1));
    grown.min(ceiling)
}

/// A value to write, in one of the forms the register map can check
#[derive(Debug, Clone, PartialEq)]
pub enum WriteTarget {
    /// Raw register value; the register must be listed as writable
    Raw { register: u16, value: u16 },
    /// Engineering value (volts, amps, seconds) for a named register
    Named { name: String, value: f64 },
    /// Option label such as `lithium` for a named register
    Option { name: String, label: String },
}

impl WriteTarget {
    /// Range-check against `model` and produce `(register, raw value)`
    pub fn resolve(&self, model: &DeviceModel) -> Result<(u16, u16)> {
        match self {
            Self::Raw { register, value } => {
                let writable = model.writable_at(*register).ok_or_else(|| {
                    WriteValidationError::NotWritable(format!("{:#06X}", register))
                })?;
                Ok((*register, writable.validate(*value)?))
            },
            Self::Named { name, value } => {
                let writable = model.writable(name)?;
                Ok((writable.register, writable.encode(*value)?))
            },
            Self::Option { name, label } => {
                let writable = model.writable(name)?;
                Ok((writable.register, writable.encode_label(label)?))
            },
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum ControlCommand {
    Refresh {
        address: String,
        reply: Reply<()>,
    },
    Write {
        address: String,
        target: WriteTarget,
        reply: Reply<()>,
    },
    AddDevice {
        config: DeviceConfig,
        reply: Reply<()>,
    },
    RemoveDevice {
        address: String,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<Vec<DeviceSnapshot>>,
    },
}

/// Cloneable control surface of a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<ControlCommand>,
    admission: Arc<AdmissionController>,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ControlCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| BleSrvError::CoordinatorClosed)?;
        response.await.map_err(|_| BleSrvError::CoordinatorClosed)?
    }

    /// Poll `address` now instead of waiting for its next slot
    pub async fn request_refresh(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.request(|reply| ControlCommand::Refresh { address, reply })
            .await
    }

    /// Write and verify one register; resolves once the echo is checked
    pub async fn write(&self, address: &str, target: WriteTarget) -> Result<()> {
        let address = address.to_string();
        self.request(|reply| ControlCommand::Write {
            address,
            target,
            reply,
        })
        .await
    }

    pub async fn write_register(&self, address: &str, register: u16, value: u16) -> Result<()> {
        self.write(address, WriteTarget::Raw { register, value })
            .await
    }

    pub async fn write_named(&self, address: &str, name: &str, value: f64) -> Result<()> {
        self.write(
            address,
            WriteTarget::Named {
                name: name.to_string(),
                value,
            },
        )
        .await
    }

    pub async fn add_device(&self, config: DeviceConfig) -> Result<()> {
        self.request(|reply| ControlCommand::AddDevice { config, reply })
            .await
    }

    /// Stop polling `address`; an in-flight session is closed
    pub async fn remove_device(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.request(|reply| ControlCommand::RemoveDevice { address, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<Vec<DeviceSnapshot>> {
        self.request(|reply| ControlCommand::Snapshot { reply })
            .await
    }

    pub fn adapter_snapshot(&self, adapter_id: &str) -> Result<AdapterSnapshot> {
        self.admission.snapshot(adapter_id)
    }

    /// Cancel every session and stop the loop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct DueEntry {
    due: Instant,
    generation: u64,
    address: String,
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.generation.cmp(&other.generation))
            .then_with(|| self.address.cmp(&other.address))
    }
}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum JobKind {
    Poll,
    Write {
        register: u16,
        value: u16,
        reply: Reply<()>,
    },
}

struct PendingWrite {
    register: u16,
    value: u16,
    reply: Reply<()>,
}

struct JobResult {
    address: String,
    registration: u64,
    kind: JobKind,
    outcome: std::result::Result<SessionOutcome, SessionFailure>,
}

pub struct Coordinator {
    transport: Arc<dyn BleTransport>,
    admission: Arc<AdmissionController>,
    sink: Arc<dyn StateSink>,
    registry: &'static RegisterMap,
    polling: PollingConfig,
    settings: SessionSettings,
    devices: HashMap<String, DeviceRuntime>,
    queue: BinaryHeap<Reverse<DueEntry>>,
    jobs: JoinSet<JobResult>,
    pending_writes: HashMap<String, VecDeque<PendingWrite>>,
    /// Next auto-assigned stagger slot per adapter
    stagger_slots: HashMap<String, u32>,
    /// Jobs of removed registrations still tearing down, per address
    retiring: HashMap<String, u32>,
    next_registration: u64,
    next_generation: u64,
    commands: mpsc::Receiver<ControlCommand>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Build a coordinator for every configured device
    ///
    /// `cancel` is the service-wide token; each device gets a child token.
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn BleTransport>,
        sink: Arc<dyn StateSink>,
        cancel: CancellationToken,
    ) -> Result<(Self, CoordinatorHandle)> {
        let admission = Arc::new(AdmissionController::new(&config.adapters));
        let (sender, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let mut coordinator = Self {
            transport,
            admission: Arc::clone(&admission),
            sink,
            registry: RegisterMap::builtin(),
            polling: config.polling.clone(),
            settings: SessionSettings::from(&config.polling),
            devices: HashMap::new(),
            queue: BinaryHeap::new(),
            jobs: JoinSet::new(),
            pending_writes: HashMap::new(),
            stagger_slots: HashMap::new(),
            retiring: HashMap::new(),
            next_registration: 0,
            next_generation: 0,
            commands,
            cancel: cancel.clone(),
        };
        for device in &config.devices {
            coordinator.register(device.clone())?;
        }

        let handle = CoordinatorHandle {
            commands: sender,
            admission,
            cancel,
        };
        Ok((coordinator, handle))
    }

    /// Build and spawn onto the current runtime
    pub fn spawn(
        config: &AppConfig,
        transport: Arc<dyn BleTransport>,
        sink: Arc<dyn StateSink>,
        cancel: CancellationToken,
    ) -> Result<(CoordinatorHandle, JoinHandle<()>)> {
        let (coordinator, handle) = Self::new(config, transport, sink, cancel)?;
        Ok((handle, tokio::spawn(coordinator.run())))
    }

    fn register(&mut self, config: DeviceConfig) -> Result<()> {
        if self.devices.contains_key(&config.address) {
            return Err(BleSrvError::DuplicateDevice(config.address));
        }
        let model = self
            .registry
            .model(&config.model)
            .ok_or_else(|| BleSrvError::UnknownModel(config.model.clone()))?;
        let spacing = self.admission.min_spacing(&config.adapter)?;

        let stagger = match config.stagger_secs {
            Some(secs) => Duration::from_secs(secs),
            None if config.enabled => {
                let slot = self.stagger_slots.entry(config.adapter.clone()).or_insert(0);
                let stagger = spacing.saturating_mul(*slot);
                *slot += 1;
                stagger
            },
            None => Duration::ZERO,
        };
        let poll_interval = config.poll_interval(&self.polling);
        let address = config.address.clone();
        let enabled = config.enabled;

        info!(
            "Device {} ({}, {}) on {}: every {:?}, first poll in {:?}{}",
            config.display_name(),
            address,
            model.key,
            config.adapter,
            poll_interval,
            stagger,
            if enabled { "" } else { " [disabled]" }
        );

        self.next_registration += 1;
        let runtime = DeviceRuntime::new(
            config,
            model,
            poll_interval,
            self.next_registration,
            self.cancel.child_token(),
        );
        self.devices.insert(address.clone(), runtime);
        if enabled {
            self.schedule(&address, stagger);
        }
        Ok(())
    }

    fn schedule(&mut self, address: &str, delay: Duration) {
        let Some(device) = self.devices.get_mut(address) else {
            return;
        };
        self.next_generation += 1;
        device.generation = self.next_generation;
        self.queue.push(Reverse(DueEntry {
            due: Instant::now() + delay,
            generation: device.generation,
            address: address.to_string(),
        }));
        debug!("{}: next poll in {:?}", address, delay);
    }

    /// Run until the service token is cancelled
    pub async fn run(mut self) {
        info!("Coordinator started with {} device(s)", self.devices.len());
        let mut commands_open = true;

        loop {
            let next_due = self.queue.peek().map(|Reverse(entry)| entry.due);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    self.on_job_finished(joined);
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.start_due();
                },
            }
        }

        info!("Coordinator stopping, closing {} session(s)", self.jobs.len());
        while self.jobs.join_next().await.is_some() {}
        info!("Coordinator stopped");
    }

    fn start_due(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.due > now {
                break;
            }
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            let Some(device) = self.devices.get_mut(&entry.address) else {
                continue;
            };
            if entry.generation != device.generation {
                continue;
            }
            if device.in_flight {
                device.refresh_pending = true;
                continue;
            }
            self.spawn_job(&entry.address, JobKind::Poll);
        }
    }

    fn spawn_job(&mut self, address: &str, kind: JobKind) {
        let Some(device) = self.devices.get_mut(address) else {
            return;
        };
        // One session per address: wait for a removed registration's job
        if self.retiring.contains_key(address) {
            debug!("{}: previous session still closing, deferring", address);
            match kind {
                JobKind::Poll => device.refresh_pending = true,
                JobKind::Write {
                    register,
                    value,
                    reply,
                } => self
                    .pending_writes
                    .entry(address.to_string())
                    .or_default()
                    .push_front(PendingWrite {
                        register,
                        value,
                        reply,
                    }),
            }
            return;
        }
        device.in_flight = true;
        device.last_attempt = Some(Utc::now());

        let request = match &kind {
            JobKind::Poll => SessionRequest::Read,
            JobKind::Write {
                register, value, ..
            } => SessionRequest::Write {
                register: *register,
                value: *value,
            },
        };
        let target = SessionTarget {
            address: address.to_string(),
            device_address: device.config.device_address,
            model: device.model,
        };
        let registration = device.registration;
        let adapter = device.config.adapter.clone();
        let cancel = device.cancel.clone();
        let transport = Arc::clone(&self.transport);
        let admission = Arc::clone(&self.admission);
        let settings = self.settings;

        self.jobs.spawn(async move {
            let address = target.address.clone();
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SessionFailure::Cancelled),
                permit = admission.acquire(&adapter) => {
                    permit.map_err(|e| SessionFailure::Admission(e.to_string()))
                },
            };
            let outcome = match permit {
                Ok(permit) => {
                    let report = Session::new(transport, target, request, settings)
                        .run(&cancel)
                        .await;
                    drop(permit);
                    report.outcome
                },
                Err(failure) => Err(failure),
            };
            JobResult {
                address,
                registration,
                kind,
                outcome,
            }
        });
    }

    fn on_job_finished(&mut self, joined: std::result::Result<JobResult, JoinError>) {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Device job aborted: {}", e);
                return;
            },
        };
        let JobResult {
            address,
            registration,
            kind,
            outcome,
        } = result;

        let current = self.devices.get(&address).map(|device| device.registration);
        if current != Some(registration) {
            debug!("{}: job finished after removal", address);
            if let JobKind::Write { reply, .. } = kind {
                let _ = reply.send(Err(BleSrvError::DeviceNotFound(address.clone())));
            }
            self.retire_finished(&address);
            return;
        }

        let refresh_now = match kind {
            JobKind::Poll => {
                self.on_poll_finished(&address, outcome);
                false
            },
            JobKind::Write {
                register,
                value,
                reply,
            } => self.on_write_finished(&address, register, value, outcome, reply),
        };

        if let Some(device) = self.devices.get_mut(&address) {
            device.in_flight = false;
        }
        self.start_next(&address, refresh_now);
    }

    /// Start whatever queued up for an idle device: writes first, then a poll
    fn start_next(&mut self, address: &str, refresh_now: bool) {
        let Some(device) = self.devices.get_mut(address) else {
            return;
        };
        if device.in_flight {
            return;
        }
        let refresh = std::mem::take(&mut device.refresh_pending) || refresh_now;

        let next_write = self
            .pending_writes
            .get_mut(address)
            .and_then(VecDeque::pop_front);
        if let Some(write) = next_write {
            if refresh {
                if let Some(device) = self.devices.get_mut(address) {
                    device.refresh_pending = true;
                }
            }
            self.spawn_job(
                address,
                JobKind::Write {
                    register: write.register,
                    value: write.value,
                    reply: write.reply,
                },
            );
        } else if refresh {
            self.spawn_job(address, JobKind::Poll);
        }
    }

    fn retire_finished(&mut self, address: &str) {
        let Some(count) = self.retiring.get_mut(address) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.retiring.remove(address);
            self.start_next(address, false);
        }
    }

    fn on_poll_finished(
        &mut self,
        address: &str,
        outcome: std::result::Result<SessionOutcome, SessionFailure>,
    ) {
        let max_failures = self.polling.max_failures_before_unavailable;
        let Some(device) = self.devices.get_mut(address) else {
            return;
        };
        // An in-flight poll answers any refresh requested while it ran
        device.refresh_pending = false;

        let delay = match outcome {
            Ok(SessionOutcome::Decoded(decoded)) => {
                if device.consecutive_failures >= max_failures {
                    info!("{}: available again", address);
                }
                let now = Utc::now();
                device.record_success(decoded.values, now);
                self.sink.publish(DeviceEvent::Updated {
                    address: address.to_string(),
                    values: device.values.clone(),
                    timestamp: now,
                    stale: false,
                });
                device.poll_interval
            },
            Ok(SessionOutcome::WriteConfirmed { .. }) => device.poll_interval,
            Err(SessionFailure::Cancelled) if device.cancel.is_cancelled() => return,
            Err(failure) => {
                let failures = device.record_failure();
                if failures == max_failures {
                    warn!(
                        "{}: unavailable after {} consecutive failures ({})",
                        address,
                        failures,
                        failure.kind()
                    );
                }
                match device.last_success {
                    Some(last_success) => self.sink.publish(DeviceEvent::Updated {
                        address: address.to_string(),
                        values: device.values.clone(),
                        timestamp: last_success,
                        stale: true,
                    }),
                    None => self.sink.publish(DeviceEvent::Unavailable {
                        address: address.to_string(),
                        reason: failure.to_string(),
                    }),
                }
                let delay = backoff_delay(failures, &self.polling, device.poll_interval);
                debug!("{}: retry #{} in {:?}", address, failures, delay);
                delay
            },
        };

        if device.config.enabled {
            self.schedule(address, delay);
        }
    }

    /// Returns whether the device should be polled right away
    fn on_write_finished(
        &mut self,
        address: &str,
        register: u16,
        value: u16,
        outcome: std::result::Result<SessionOutcome, SessionFailure>,
        reply: Reply<()>,
    ) -> bool {
        let (success, result) = match outcome {
            Ok(_) => (true, Ok(())),
            Err(failure) => {
                warn!(
                    "{}: write {:#06X}={} failed: {}",
                    address, register, value, failure
                );
                (false, Err(BleSrvError::Session(failure)))
            },
        };
        self.sink.publish(DeviceEvent::WriteResult {
            address: address.to_string(),
            register,
            value,
            success,
            error: result.as_ref().err().map(ToString::to_string),
        });
        let _ = reply.send(result);
        success
    }

    fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Refresh { address, reply } => {
                let in_flight = self.devices.get(&address).map(|device| device.in_flight);
                let result = match in_flight {
                    None => Err(BleSrvError::DeviceNotFound(address)),
                    Some(true) => {
                        if let Some(device) = self.devices.get_mut(&address) {
                            device.refresh_pending = true;
                        }
                        Ok(())
                    },
                    Some(false) => {
                        debug!("{}: refresh requested", address);
                        self.spawn_job(&address, JobKind::Poll);
                        Ok(())
                    },
                };
                let _ = reply.send(result);
            },
            ControlCommand::Write {
                address,
                target,
                reply,
            } => {
                let Some(device) = self.devices.get(&address) else {
                    let _ = reply.send(Err(BleSrvError::DeviceNotFound(address)));
                    return;
                };
                let (register, value) = match target.resolve(device.model) {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        warn!("{}: write rejected: {}", address, e);
                        let _ = reply.send(Err(e));
                        return;
                    },
                };
                if device.in_flight {
                    self.pending_writes
                        .entry(address)
                        .or_default()
                        .push_back(PendingWrite {
                            register,
                            value,
                            reply,
                        });
                } else {
                    self.spawn_job(
                        &address,
                        JobKind::Write {
                            register,
                            value,
                            reply,
                        },
                    );
                }
            },
            ControlCommand::AddDevice { config, reply } => {
                let _ = reply.send(self.register(config));
            },
            ControlCommand::RemoveDevice { address, reply } => {
                let result = match self.devices.remove(&address) {
                    Some(device) => {
                        device.cancel.cancel();
                        if device.in_flight {
                            *self.retiring.entry(address.clone()).or_default() += 1;
                        }
                        for write in self.pending_writes.remove(&address).unwrap_or_default() {
                            let _ = write
                                .reply
                                .send(Err(BleSrvError::DeviceNotFound(address.clone())));
                        }
                        info!("Device {} removed", address);
                        Ok(())
                    },
                    None => Err(BleSrvError::DeviceNotFound(address)),
                };
                let _ = reply.send(result);
            },
            ControlCommand::Snapshot { reply } => {
                let mut snapshots: Vec<_> =
                    self.devices.values().map(DeviceRuntime::snapshot).collect();
                snapshots.sort_by(|a, b| a.address.cmp(&b.address));
                let _ = reply.send(Ok(snapshots));
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use ble_modbus::models::{BATTERY_TYPE_REGISTER, CONTROLLER, DCC};

    fn polling() -> PollingConfig {
        PollingConfig {
            backoff_base_secs: 10,
            backoff_cap_exponent: 6,
            max_backoff_factor: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let polling = polling();
        let interval = Duration::from_secs(60);
        let delays: Vec<_> = (1..=8)
            .map(|f| backoff_delay(f, &polling, interval).as_secs())
            .collect();
        assert_eq!(delays, vec![20, 40, 80, 160, 240, 240, 240, 240]);
    }

    #[test]
    fn test_backoff_exponent_cap() {
        let polling = polling();
        let interval = Duration::from_secs(600);
        assert_eq!(backoff_delay(6, &polling, interval), Duration::from_secs(640));
        assert_eq!(backoff_delay(60, &polling, interval), Duration::from_secs(640));
        assert_eq!(backoff_delay(u32::MAX, &polling, interval), Duration::from_secs(640));
    }

    #[test]
    fn test_write_target_resolution() {
        let raw = WriteTarget::Raw {
            register: BATTERY_TYPE_REGISTER,
            value: 2,
        };
        assert_eq!(raw.resolve(&CONTROLLER).unwrap(), (BATTERY_TYPE_REGISTER, 2));

        let option = WriteTarget::Option {
            name: "battery_type".into(),
            label: "Lithium".into(),
        };
        assert_eq!(option.resolve(&DCC).unwrap(), (BATTERY_TYPE_REGISTER, 4));

        let named = WriteTarget::Named {
            name: "boost_voltage".into(),
            value: 14.4,
        };
        assert_eq!(named.resolve(&DCC).unwrap(), (0xE008, 144));

        let out_of_range = WriteTarget::Raw {
            register: BATTERY_TYPE_REGISTER,
            value: 9,
        };
        assert!(matches!(
            out_of_range.resolve(&CONTROLLER),
            Err(BleSrvError::WriteRejected(WriteValidationError::OutOfRange { .. }))
        ));

        let read_only = WriteTarget::Raw {
            register: 0x0101,
            value: 1,
        };
        assert!(matches!(
            read_only.resolve(&CONTROLLER),
            Err(BleSrvError::WriteRejected(WriteValidationError::NotWritable(_)))
        ));
    }

    #[test]
    fn test_due_entries_pop_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (secs, address) in [(30, "c"), (10, "a"), (20, "b")] {
            heap.push(Reverse(DueEntry {
                due: now + Duration::from_secs(secs),
                generation: 1,
                address: address.to_string(),
            }));
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.address)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
