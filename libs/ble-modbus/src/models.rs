//! Built-in register maps
//!
//! Each [`DeviceModel`] lists the read commands issued per poll, the fields
//! decoded from their data blocks, and the registers that accept writes.
//! Field offsets are relative to the data block of the owning command, so
//! `offset + length` never exceeds `word_count * 2`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::constants::FC_READ_HOLDING_REGISTERS;
use crate::register::{
    decode, Decoded, FieldEncoding, RegisterField, WritableRegister, WriteValidationError,
};
use crate::shunt::SHUNT_FIELDS;

/// One read batch issued per poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub function_code: u8,
    pub register: u16,
    pub word_count: u16,
}

impl Command {
    pub const fn read(name: &'static str, register: u16, word_count: u16) -> Self {
        Self {
            name,
            function_code: FC_READ_HOLDING_REGISTERS,
            register,
            word_count,
        }
    }
}

/// How a model delivers its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProtocol {
    /// Modbus request/response over write and notify characteristics
    Modbus,
    /// Unsolicited telemetry packets on a notify characteristic
    ShuntTelemetry,
}

#[derive(Debug)]
pub struct DeviceModel {
    pub key: &'static str,
    pub description: &'static str,
    pub protocol: ModelProtocol,
    pub commands: &'static [Command],
    pub fields: &'static [RegisterField],
    pub writable: &'static [WritableRegister],
}

impl DeviceModel {
    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|command| command.name == name)
    }

    /// Fields carried by `command`'s response
    pub fn fields_for<'a>(&'a self, command: &'a str) -> impl Iterator<Item = &'a RegisterField> {
        self.fields
            .iter()
            .filter(move |field| field.command == command)
    }

    /// Decode the data block returned for `command`
    pub fn decode_command(&self, command: &Command, data: &[u8]) -> Decoded {
        decode(data, self.fields_for(command.name))
    }

    pub fn writable(&self, name: &str) -> Result<&WritableRegister, WriteValidationError> {
        self.writable
            .iter()
            .find(|register| register.name == name)
            .ok_or_else(|| WriteValidationError::NotWritable(name.to_string()))
    }

    pub fn writable_at(&self, register: u16) -> Option<&WritableRegister> {
        self.writable.iter().find(|w| w.register == register)
    }
}

// ============================================================================
// Shared value tables
// ============================================================================

const LOAD_STATUS: &[(u32, &str)] = &[(0, "off"), (1, "on")];

const CHARGING_STATUS: &[(u32, &str)] = &[
    (0, "deactivated"),
    (1, "activated"),
    (2, "mppt"),
    (3, "equalizing"),
    (4, "boost"),
    (5, "floating"),
    (6, "current_limiting"),
];

const DCC_CHARGING_STATUS: &[(u32, &str)] = &[
    (0, "standby"),
    (2, "mppt"),
    (3, "equalizing"),
    (4, "boost"),
    (5, "floating"),
    (6, "current_limiting"),
    (8, "direct_current"),
];

const BATTERY_TYPES: &[(u32, &str)] = &[
    (1, "open"),
    (2, "sealed"),
    (3, "gel"),
    (4, "lithium"),
    (5, "custom"),
];

const CONTROLLER_FAULTS: &[(u8, &str)] = &[
    (16, "battery_over_discharge"),
    (17, "battery_over_voltage"),
    (18, "battery_under_voltage_warning"),
    (19, "load_short_circuit"),
    (20, "load_over_power"),
    (21, "controller_temperature_too_high"),
    (22, "ambient_temperature_too_high"),
    (23, "pv_input_over_power"),
    (24, "pv_input_short_circuit"),
    (25, "pv_input_over_voltage"),
    (26, "solar_panel_counter_current"),
    (27, "solar_panel_working_point_over_voltage"),
    (28, "solar_panel_reversed"),
    (29, "anti_reverse_mos_short"),
    (30, "charge_mos_short_circuit"),
];

// ============================================================================
// Charge controller
// ============================================================================

/// Load output switch register on charge controllers
pub const LOAD_CONTROL_REGISTER: u16 = 0x010A;

/// Battery type register, shared by controllers and DC-DC chargers
pub const BATTERY_TYPE_REGISTER: u16 = 0xE004;

const CONTROLLER_COMMANDS: &[Command] = &[
    Command::read("device_info", 0x000C, 8),
    Command::read("device_id", 0x001A, 1),
    Command::read("dynamic_data", 0x0100, 35),
    Command::read("battery_type", BATTERY_TYPE_REGISTER, 1),
];

const CONTROLLER_FIELDS: &[RegisterField] = &[
    RegisterField::new("model", "device_info", 0x000C, 0, 16).encoding(FieldEncoding::Ascii),
    RegisterField::new("device_id", "device_id", 0x001A, 1, 1),
    RegisterField::new("battery_percentage", "dynamic_data", 0x0100, 0, 2).unit("%"),
    RegisterField::new("battery_voltage", "dynamic_data", 0x0101, 2, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("battery_current", "dynamic_data", 0x0102, 4, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("controller_temperature", "dynamic_data", 0x0103, 6, 1)
        .encoding(FieldEncoding::SignMagnitude)
        .unit("°C"),
    RegisterField::new("battery_temperature", "dynamic_data", 0x0103, 7, 1)
        .encoding(FieldEncoding::SignMagnitude)
        .unit("°C"),
    RegisterField::new("load_voltage", "dynamic_data", 0x0104, 8, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("load_current", "dynamic_data", 0x0105, 10, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("load_power", "dynamic_data", 0x0106, 12, 2).unit("W"),
    RegisterField::new("pv_voltage", "dynamic_data", 0x0107, 14, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("pv_current", "dynamic_data", 0x0108, 16, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("pv_power", "dynamic_data", 0x0109, 18, 2).unit("W"),
    RegisterField::new("battery_min_voltage_today", "dynamic_data", 0x010B, 22, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("battery_max_voltage_today", "dynamic_data", 0x010C, 24, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("max_charging_current_today", "dynamic_data", 0x010D, 26, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("max_discharging_current_today", "dynamic_data", 0x010E, 28, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("max_charging_power_today", "dynamic_data", 0x010F, 30, 2).unit("W"),
    RegisterField::new("max_discharging_power_today", "dynamic_data", 0x0110, 32, 2).unit("W"),
    RegisterField::new("charging_amp_hours_today", "dynamic_data", 0x0111, 34, 2).unit("Ah"),
    RegisterField::new("discharging_amp_hours_today", "dynamic_data", 0x0112, 36, 2).unit("Ah"),
    RegisterField::new("power_generation_today", "dynamic_data", 0x0113, 38, 2).unit("Wh"),
    RegisterField::new("power_consumption_today", "dynamic_data", 0x0114, 40, 2).unit("Wh"),
    RegisterField::new("total_operating_days", "dynamic_data", 0x0115, 42, 2),
    RegisterField::new("total_battery_overdischarges", "dynamic_data", 0x0116, 44, 2),
    RegisterField::new("total_battery_full_charges", "dynamic_data", 0x0117, 46, 2),
    RegisterField::new("total_charging_amp_hours", "dynamic_data", 0x0118, 48, 4).unit("Ah"),
    RegisterField::new("total_discharging_amp_hours", "dynamic_data", 0x011A, 52, 4).unit("Ah"),
    RegisterField::new("power_generation_total", "dynamic_data", 0x011C, 56, 4)
        .scale(0.001)
        .unit("kWh"),
    RegisterField::new("power_consumption_total", "dynamic_data", 0x011E, 60, 4)
        .scale(0.001)
        .unit("kWh"),
    RegisterField::new("load_status", "dynamic_data", 0x0120, 64, 1)
        .mask(0x80)
        .values(LOAD_STATUS),
    RegisterField::new("charging_status", "dynamic_data", 0x0120, 65, 1).values(CHARGING_STATUS),
    RegisterField::new("fault_codes", "dynamic_data", 0x0121, 66, 4).bits(CONTROLLER_FAULTS),
    RegisterField::new("battery_type", "battery_type", BATTERY_TYPE_REGISTER, 0, 2)
        .values(BATTERY_TYPES),
];

const CONTROLLER_WRITABLE: &[WritableRegister] = &[
    WritableRegister::new("load_switch", LOAD_CONTROL_REGISTER, 0, 1).values(LOAD_STATUS),
    WritableRegister::new("battery_type", BATTERY_TYPE_REGISTER, 1, 5).values(BATTERY_TYPES),
];

pub static CONTROLLER: DeviceModel = DeviceModel {
    key: "controller",
    description: "MPPT/PWM solar charge controller",
    protocol: ModelProtocol::Modbus,
    commands: CONTROLLER_COMMANDS,
    fields: CONTROLLER_FIELDS,
    writable: CONTROLLER_WRITABLE,
};

// ============================================================================
// DC-DC charger
// ============================================================================

const DCC_COMMANDS: &[Command] = &[
    Command::read("device_info", 0x000C, 8),
    Command::read("device_id", 0x001A, 1),
    Command::read("dynamic_data", 0x0100, 35),
    Command::read("parameters", 0xE001, 21),
];

const DCC_FIELDS: &[RegisterField] = &[
    RegisterField::new("model", "device_info", 0x000C, 0, 16).encoding(FieldEncoding::Ascii),
    RegisterField::new("device_id", "device_id", 0x001A, 1, 1),
    RegisterField::new("battery_percentage", "dynamic_data", 0x0100, 0, 2).unit("%"),
    RegisterField::new("battery_voltage", "dynamic_data", 0x0101, 2, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("total_charging_current", "dynamic_data", 0x0102, 4, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("controller_temperature", "dynamic_data", 0x0103, 6, 1)
        .encoding(FieldEncoding::SignMagnitude)
        .unit("°C"),
    RegisterField::new("battery_temperature", "dynamic_data", 0x0103, 7, 1)
        .encoding(FieldEncoding::SignMagnitude)
        .unit("°C"),
    RegisterField::new("alternator_voltage", "dynamic_data", 0x0104, 8, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("alternator_current", "dynamic_data", 0x0105, 10, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("alternator_power", "dynamic_data", 0x0106, 12, 2).unit("W"),
    RegisterField::new("solar_voltage", "dynamic_data", 0x0107, 14, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("solar_current", "dynamic_data", 0x0108, 16, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("solar_power", "dynamic_data", 0x0109, 18, 2).unit("W"),
    RegisterField::new("battery_min_voltage_today", "dynamic_data", 0x010B, 22, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("battery_max_voltage_today", "dynamic_data", 0x010C, 24, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("max_charging_current_today", "dynamic_data", 0x010D, 26, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("max_charging_power_today", "dynamic_data", 0x010F, 30, 2).unit("W"),
    RegisterField::new("charging_amp_hours_today", "dynamic_data", 0x0111, 34, 2).unit("Ah"),
    RegisterField::new("power_generation_today", "dynamic_data", 0x0113, 38, 2).unit("Wh"),
    RegisterField::new("total_operating_days", "dynamic_data", 0x0115, 42, 2),
    RegisterField::new("total_battery_overdischarges", "dynamic_data", 0x0116, 44, 2),
    RegisterField::new("total_battery_full_charges", "dynamic_data", 0x0117, 46, 2),
    RegisterField::new("total_charging_amp_hours", "dynamic_data", 0x0118, 48, 4).unit("Ah"),
    RegisterField::new("power_generation_total", "dynamic_data", 0x011C, 56, 4)
        .scale(0.001)
        .unit("kWh"),
    RegisterField::new("charging_status", "dynamic_data", 0x0120, 65, 1)
        .values(DCC_CHARGING_STATUS),
    RegisterField::new("fault_codes", "dynamic_data", 0x0121, 66, 4).bits(CONTROLLER_FAULTS),
    RegisterField::new("max_charging_current", "parameters", 0xE001, 0, 2)
        .scale(0.01)
        .unit("A"),
    RegisterField::new("battery_type", "parameters", 0xE004, 6, 2).values(BATTERY_TYPES),
    RegisterField::new("overvoltage_threshold", "parameters", 0xE005, 8, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("charging_limit_voltage", "parameters", 0xE006, 10, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("equalization_voltage", "parameters", 0xE007, 12, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("boost_voltage", "parameters", 0xE008, 14, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("float_voltage", "parameters", 0xE009, 16, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("boost_return_voltage", "parameters", 0xE00A, 18, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("overdischarge_return_voltage", "parameters", 0xE00B, 20, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("undervoltage_warning_voltage", "parameters", 0xE00C, 22, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("overdischarge_voltage", "parameters", 0xE00D, 24, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("discharge_limit_voltage", "parameters", 0xE00E, 26, 2)
        .scale(0.1)
        .unit("V"),
    RegisterField::new("overdischarge_delay", "parameters", 0xE010, 30, 2).unit("s"),
    RegisterField::new("equalization_time", "parameters", 0xE011, 32, 2).unit("min"),
    RegisterField::new("boost_time", "parameters", 0xE012, 34, 2).unit("min"),
    RegisterField::new("equalization_interval", "parameters", 0xE013, 36, 2).unit("d"),
    RegisterField::new("temperature_compensation", "parameters", 0xE014, 38, 2),
    RegisterField::new("solar_cutoff_current", "parameters", 0xE015, 40, 2).unit("A"),
];

const DCC_WRITABLE: &[WritableRegister] = &[
    WritableRegister::new("max_charging_current", 0xE001, 1000, 6000).scale(0.01),
    WritableRegister::new("battery_type", BATTERY_TYPE_REGISTER, 1, 5).values(BATTERY_TYPES),
    WritableRegister::new("overvoltage_threshold", 0xE005, 70, 170).scale(0.1),
    WritableRegister::new("charging_limit_voltage", 0xE006, 70, 170).scale(0.1),
    WritableRegister::new("equalization_voltage", 0xE007, 70, 170).scale(0.1),
    WritableRegister::new("boost_voltage", 0xE008, 70, 170).scale(0.1),
    WritableRegister::new("float_voltage", 0xE009, 70, 170).scale(0.1),
    WritableRegister::new("boost_return_voltage", 0xE00A, 70, 170).scale(0.1),
    WritableRegister::new("overdischarge_return_voltage", 0xE00B, 70, 170).scale(0.1),
    WritableRegister::new("undervoltage_warning_voltage", 0xE00C, 70, 170).scale(0.1),
    WritableRegister::new("overdischarge_voltage", 0xE00D, 70, 170).scale(0.1),
    WritableRegister::new("discharge_limit_voltage", 0xE00E, 70, 170).scale(0.1),
    WritableRegister::new("overdischarge_delay", 0xE010, 0, 120),
    WritableRegister::new("equalization_time", 0xE011, 0, 300),
    WritableRegister::new("boost_time", 0xE012, 10, 300),
    WritableRegister::new("equalization_interval", 0xE013, 0, 255),
    WritableRegister::new("temperature_compensation", 0xE014, 0, 5),
    WritableRegister::new("solar_cutoff_current", 0xE015, 0, 10),
];

pub static DCC: DeviceModel = DeviceModel {
    key: "dcc",
    description: "DC-DC battery charger with MPPT input",
    protocol: ModelProtocol::Modbus,
    commands: DCC_COMMANDS,
    fields: DCC_FIELDS,
    writable: DCC_WRITABLE,
};

// ============================================================================
// Battery shunt
// ============================================================================

pub static SHUNT: DeviceModel = DeviceModel {
    key: "shunt",
    description: "Battery shunt streaming telemetry notifications",
    protocol: ModelProtocol::ShuntTelemetry,
    commands: &[],
    fields: SHUNT_FIELDS,
    writable: &[],
};

// ============================================================================
// Lookup
// ============================================================================

/// Immutable model registry keyed by model name
#[derive(Debug)]
pub struct RegisterMap {
    models: BTreeMap<&'static str, &'static DeviceModel>,
}

impl RegisterMap {
    /// Registry of the models compiled into this crate
    pub fn builtin() -> &'static RegisterMap {
        static BUILTIN: OnceLock<RegisterMap> = OnceLock::new();
        BUILTIN.get_or_init(|| RegisterMap {
            models: [&CONTROLLER, &DCC, &SHUNT]
                .into_iter()
                .map(|model| (model.key, model))
                .collect(),
        })
    }

    pub fn model(&self, key: &str) -> Option<&'static DeviceModel> {
        self.models.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.models.keys().copied()
    }
}
