//! Transport-agnostic records produced by the data assembler.
//!
//! A record is an immutable snapshot: every refresh builds a new one. Fields a
//! device family does not provide stay `None`. Decoded values without a typed
//! slot are kept by canonical name in `extra`.

use crate::{codec::PhysicalValue, register::Category};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Decoded values keyed by canonical name, packed sub-fields flattened.
pub type FieldValues = BTreeMap<String, PhysicalValue>;

fn take_number(fields: &mut FieldValues, name: &str) -> Option<f64> {
    match fields.get(name) {
        Some(PhysicalValue::Number(value)) => {
            let value = *value;
            fields.remove(name);
            Some(value)
        }
        _ => None,
    }
}

fn take_code(fields: &mut FieldValues, name: &str) -> Option<String> {
    match fields.remove(name) {
        Some(PhysicalValue::Code(code)) => Some(code),
        Some(other) => {
            fields.insert(name.to_string(), other);
            None
        }
        None => None,
    }
}

fn take_list(fields: &mut FieldValues, name: &str) -> Vec<String> {
    match fields.remove(name) {
        Some(PhysicalValue::Faults(list)) => list.into_iter().map(str::to_string).collect(),
        Some(other) => {
            fields.insert(name.to_string(), other);
            Vec::new()
        }
        None => Vec::new(),
    }
}

/// Sum of the present values, `None` if none is present.
fn sum(values: &[Option<f64>]) -> Option<f64> {
    values.iter().flatten().copied().reduce(|a, b| a + b)
}

fn difference(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(a? - b?)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedRuntimeRecord {
    pub captured_at: DateTime<Utc>,
    pub status: Option<String>,
    pub pv1_voltage: Option<f64>,
    pub pv2_voltage: Option<f64>,
    pub pv3_voltage: Option<f64>,
    pub pv1_power: Option<f64>,
    pub pv2_power: Option<f64>,
    pub pv3_power: Option<f64>,
    pub pv_power_total: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub battery_charge_power: Option<f64>,
    pub battery_discharge_power: Option<f64>,
    /// Charge minus discharge power.
    pub battery_net_power: Option<f64>,
    pub grid_voltage: Option<f64>,
    pub grid_frequency: Option<f64>,
    pub inverter_power: Option<f64>,
    pub rectifier_power: Option<f64>,
    pub power_to_grid: Option<f64>,
    pub power_to_user: Option<f64>,
    /// Import minus export power.
    pub grid_net_power: Option<f64>,
    pub eps_power: Option<f64>,
    pub internal_temperature: Option<f64>,
    pub faults: Vec<String>,
    pub warnings: Vec<String>,
    pub extra: FieldValues,
}

impl UnifiedRuntimeRecord {
    /// Moves the known fields into their slots; the rest stays in `extra`.
    pub fn from_fields(mut fields: FieldValues, captured_at: DateTime<Utc>) -> Self {
        let f = &mut fields;
        let pv1_power = take_number(f, "pv1_power");
        let pv2_power = take_number(f, "pv2_power");
        let pv3_power = take_number(f, "pv3_power");
        let battery_charge_power = take_number(f, "battery_charge_power");
        let battery_discharge_power = take_number(f, "battery_discharge_power");
        let power_to_grid = take_number(f, "power_to_grid");
        let power_to_user = take_number(f, "power_to_user");
        Self {
            captured_at,
            status: take_code(f, "status"),
            pv1_voltage: take_number(f, "pv1_voltage"),
            pv2_voltage: take_number(f, "pv2_voltage"),
            pv3_voltage: take_number(f, "pv3_voltage"),
            pv1_power,
            pv2_power,
            pv3_power,
            pv_power_total: sum(&[pv1_power, pv2_power, pv3_power]),
            battery_voltage: take_number(f, "battery_voltage"),
            soc: take_number(f, "soc"),
            soh: take_number(f, "soh"),
            battery_charge_power,
            battery_discharge_power,
            battery_net_power: difference(battery_charge_power, battery_discharge_power),
            grid_voltage: take_number(f, "grid_voltage_r"),
            grid_frequency: take_number(f, "grid_frequency"),
            inverter_power: take_number(f, "inverter_power"),
            rectifier_power: take_number(f, "rectifier_power"),
            power_to_grid,
            power_to_user,
            grid_net_power: difference(power_to_user, power_to_grid),
            eps_power: take_number(f, "eps_power"),
            internal_temperature: take_number(f, "internal_temperature"),
            faults: take_list(f, "fault_code"),
            warnings: take_list(f, "warning_code"),
            extra: fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedEnergyRecord {
    pub captured_at: DateTime<Utc>,
    pub pv_energy_today: Option<f64>,
    pub inverter_energy_today: Option<f64>,
    pub charge_energy_today: Option<f64>,
    pub discharge_energy_today: Option<f64>,
    pub import_energy_today: Option<f64>,
    pub export_energy_today: Option<f64>,
    pub eps_energy_today: Option<f64>,
    pub pv_energy_total: Option<f64>,
    pub inverter_energy_total: Option<f64>,
    pub charge_energy_total: Option<f64>,
    pub discharge_energy_total: Option<f64>,
    pub import_energy_total: Option<f64>,
    pub export_energy_total: Option<f64>,
    pub eps_energy_total: Option<f64>,
    pub extra: FieldValues,
}

impl UnifiedEnergyRecord {
    pub fn from_fields(mut fields: FieldValues, captured_at: DateTime<Utc>) -> Self {
        let f = &mut fields;
        let pv_today = [
            take_number(f, "pv1_energy_today"),
            take_number(f, "pv2_energy_today"),
            take_number(f, "pv3_energy_today"),
        ];
        let pv_total = [
            take_number(f, "pv1_energy_total"),
            take_number(f, "pv2_energy_total"),
            take_number(f, "pv3_energy_total"),
        ];
        Self {
            captured_at,
            pv_energy_today: sum(&pv_today),
            inverter_energy_today: take_number(f, "inverter_energy_today"),
            charge_energy_today: take_number(f, "charge_energy_today"),
            discharge_energy_today: take_number(f, "discharge_energy_today"),
            import_energy_today: take_number(f, "import_energy_today"),
            export_energy_today: take_number(f, "export_energy_today"),
            eps_energy_today: take_number(f, "eps_energy_today"),
            pv_energy_total: sum(&pv_total),
            inverter_energy_total: take_number(f, "inverter_energy_total"),
            charge_energy_total: take_number(f, "charge_energy_total"),
            discharge_energy_total: take_number(f, "discharge_energy_total"),
            import_energy_total: take_number(f, "import_energy_total"),
            export_energy_total: take_number(f, "export_energy_total"),
            eps_energy_total: take_number(f, "eps_energy_total"),
            extra: fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedBatteryRecord {
    pub captured_at: DateTime<Utc>,
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub voltage: Option<f64>,
    /// Positive while charging.
    pub current: Option<f64>,
    pub temperature: Option<f64>,
    pub module_count: Option<f64>,
    pub capacity: Option<f64>,
    pub cycle_count: Option<f64>,
    pub charge_current_limit: Option<f64>,
    pub discharge_current_limit: Option<f64>,
    pub max_cell_voltage: Option<f64>,
    pub min_cell_voltage: Option<f64>,
    pub max_cell_temperature: Option<f64>,
    pub min_cell_temperature: Option<f64>,
    pub bms_fault: Option<String>,
    pub bms_warning: Option<String>,
    pub extra: FieldValues,
}

impl UnifiedBatteryRecord {
    pub fn from_fields(mut fields: FieldValues, captured_at: DateTime<Utc>) -> Self {
        let f = &mut fields;
        Self {
            captured_at,
            soc: take_number(f, "soc"),
            soh: take_number(f, "soh"),
            voltage: take_number(f, "battery_voltage"),
            current: take_number(f, "battery_current"),
            temperature: take_number(f, "battery_temperature"),
            module_count: take_number(f, "battery_count"),
            capacity: take_number(f, "battery_capacity"),
            cycle_count: take_number(f, "cycle_count"),
            charge_current_limit: take_number(f, "bms_charge_current_limit"),
            discharge_current_limit: take_number(f, "bms_discharge_current_limit"),
            max_cell_voltage: take_number(f, "max_cell_voltage"),
            min_cell_voltage: take_number(f, "min_cell_voltage"),
            max_cell_temperature: take_number(f, "max_cell_temperature"),
            min_cell_temperature: take_number(f, "min_cell_temperature"),
            bms_fault: take_code(f, "bms_fault_code"),
            bms_warning: take_code(f, "bms_warning_code"),
            extra: fields,
        }
    }
}

/// Configuration values keyed by canonical name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterRecord {
    pub captured_at: DateTime<Utc>,
    pub values: FieldValues,
}

impl ParameterRecord {
    /// Value of one parameter by canonical name.
    pub fn get(&self, name: &str) -> Option<&PhysicalValue> {
        self.values.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum UnifiedRecord {
    Runtime(UnifiedRuntimeRecord),
    Energy(UnifiedEnergyRecord),
    Battery(UnifiedBatteryRecord),
    Parameters(ParameterRecord),
}

impl UnifiedRecord {
    /// Builds the record of `category` from decoded fields.
    pub fn assemble(category: Category, fields: FieldValues, captured_at: DateTime<Utc>) -> Self {
        match category {
            Category::Runtime => {
                Self::Runtime(UnifiedRuntimeRecord::from_fields(fields, captured_at))
            }
            Category::Energy => Self::Energy(UnifiedEnergyRecord::from_fields(fields, captured_at)),
            Category::Battery => {
                Self::Battery(UnifiedBatteryRecord::from_fields(fields, captured_at))
            }
            Category::Parameters => Self::Parameters(ParameterRecord {
                captured_at,
                values: fields,
            }),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            UnifiedRecord::Runtime(_) => Category::Runtime,
            UnifiedRecord::Energy(_) => Category::Energy,
            UnifiedRecord::Battery(_) => Category::Battery,
            UnifiedRecord::Parameters(_) => Category::Parameters,
        }
    }

    /// When the underlying values were read.
    pub fn captured_at(&self) -> DateTime<Utc> {
        match self {
            UnifiedRecord::Runtime(record) => record.captured_at,
            UnifiedRecord::Energy(record) => record.captured_at,
            UnifiedRecord::Battery(record) => record.captured_at,
            UnifiedRecord::Parameters(record) => record.captured_at,
        }
    }

    pub fn as_runtime(&self) -> Option<&UnifiedRuntimeRecord> {
        match self {
            UnifiedRecord::Runtime(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_energy(&self) -> Option<&UnifiedEnergyRecord> {
        match self {
            UnifiedRecord::Energy(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_battery(&self) -> Option<&UnifiedBatteryRecord> {
        match self {
            UnifiedRecord::Battery(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_parameters(&self) -> Option<&ParameterRecord> {
        match self {
            UnifiedRecord::Parameters(record) => Some(record),
            _ => None,
        }
    }
}
