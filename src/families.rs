//! Register layouts of the supported device families.
//!
//! Every family table is built once, on first use, and shared by reference
//! for the rest of the process. Families are resolved once per device via
//! [`register_map`].

use crate::{
    codes::{BMS_FAULTS, BMS_WARNINGS, INVERTER_FAULTS, INVERTER_STATUS, INVERTER_WARNINGS},
    register::{BitField, Category, RegisterDefinition, ScaleFactor, Unit, WordOrder},
    register_map::{DeviceFamily, RegisterMap},
};
use std::sync::LazyLock;

/// First register of the weekly schedule block.
pub const SCHEDULE_BASE_ADDRESS: u16 = 500;
pub const SCHEDULE_MODES: [&str; 4] =
    ["ac_charge", "forced_charge", "forced_discharge", "peak_shaving"];
pub const SCHEDULE_DAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
pub const SCHEDULE_SLOTS: u16 = 4;
/// 7 days x 4 modes x 4 slots x (start, end).
pub const SCHEDULE_REGISTERS: u16 =
    SCHEDULE_DAYS.len() as u16 * SCHEDULE_MODES.len() as u16 * SCHEDULE_SLOTS * 2;

static SOC_SOH: [BitField; 2] = [
    BitField::value(0, 8, "soc", Some("soc")),
    BitField::value(8, 8, "soh", Some("soh")),
];

static FUNCTION_ENABLE: [BitField; 16] = [
    BitField::flag(0, "eps_en"),
    BitField::flag(1, "overfreq_load_derate_en"),
    BitField::flag(2, "drms_en"),
    BitField::flag(3, "lvrt_en"),
    BitField::flag(4, "anti_island_en"),
    BitField::flag(5, "neutral_detect_en"),
    BitField::flag(6, "grid_on_power_soft_start_en"),
    BitField::flag(7, "ac_charge_en"),
    BitField::flag(8, "seamless_eps_switch_en"),
    BitField::flag(9, "set_to_standby"),
    BitField::flag(10, "forced_discharge_en"),
    BitField::flag(11, "charge_priority_en"),
    BitField::flag(12, "iso_en"),
    BitField::flag(13, "gfci_en"),
    BitField::flag(14, "dci_en"),
    BitField::flag(15, "feed_in_grid_en"),
];

static SYSTEM_FUNCTION: [BitField; 3] = [
    BitField::flag(0, "pv_grid_off_en"),
    BitField::flag(1, "run_without_grid"),
    BitField::flag(2, "micro_grid_en"),
];

static PARALLEL_CONFIG: [BitField; 3] = [
    BitField::enumeration(0, 2, "parallel_role", &[(0, "single"), (1, "master"), (2, "slave")]),
    BitField::enumeration(2, 2, "parallel_phase", &[(1, "R"), (2, "S"), (3, "T")]),
    BitField::value(8, 8, "parallel_group", None),
];

static SCHEDULE_TIME: [BitField; 2] = [
    BitField::value(0, 8, "hour", None),
    BitField::value(8, 8, "minute", None),
];

static SMART_PORTS: [BitField; 4] = [
    BitField::enumeration(0, 2, "smart_port1_mode", PORT_MODES),
    BitField::enumeration(2, 2, "smart_port2_mode", PORT_MODES),
    BitField::enumeration(4, 2, "smart_port3_mode", PORT_MODES),
    BitField::enumeration(6, 2, "smart_port4_mode", PORT_MODES),
];

const PORT_MODES: &[(u16, &str)] = &[(0, "off"), (1, "smart_load"), (2, "ac_couple")];

fn runtime(name: &str, address: u16) -> RegisterDefinition {
    RegisterDefinition::input(name, address, Category::Runtime)
}

fn energy(name: &str, address: u16) -> RegisterDefinition {
    RegisterDefinition::input(name, address, Category::Energy).unit(Unit::KiloWattHour)
}

/// Daily counter in 0.1 kWh.
fn energy_today(name: &str, address: u16) -> RegisterDefinition {
    energy(name, address).scale(ScaleFactor::Div10)
}

/// Lifetime counter in 0.1 kWh over two registers.
fn energy_total(name: &str, address: u16) -> RegisterDefinition {
    energy_today(name, address).double()
}

fn battery(name: &str, address: u16) -> RegisterDefinition {
    RegisterDefinition::input(name, address, Category::Battery)
}

fn volts(def: RegisterDefinition) -> RegisterDefinition {
    def.scale(ScaleFactor::Div10).unit(Unit::Volt)
}

fn hertz(def: RegisterDefinition) -> RegisterDefinition {
    def.scale(ScaleFactor::Div100).unit(Unit::Hertz)
}

fn watts(def: RegisterDefinition) -> RegisterDefinition {
    def.unit(Unit::Watt)
}

fn percent(def: RegisterDefinition) -> RegisterDefinition {
    def.unit(Unit::Percent)
}

/// Telemetry shared by both hybrid inverter families.
fn inverter_common() -> Vec<RegisterDefinition> {
    vec![
        runtime("status", 0).codes(&INVERTER_STATUS).cloud("status").describe("Operating mode"),
        volts(runtime("pv1_voltage", 1)).cloud("vpv1").describe("PV string 1 voltage"),
        volts(runtime("pv2_voltage", 2)).cloud("vpv2").describe("PV string 2 voltage"),
        volts(runtime("pv3_voltage", 3)).cloud("vpv3").describe("PV string 3 voltage"),
        volts(runtime("battery_voltage", 4))
            .cloud("vBat")
            .also(Category::Battery)
            .describe("Battery voltage at the inverter"),
        runtime("soc_soh", 5)
            .bits(&SOC_SOH)
            .also(Category::Battery)
            .describe("State of charge (low byte) and state of health (high byte)"),
        volts(runtime("grid_voltage_r", 12)).cloud("vacr").describe("Grid voltage phase R / L1-N"),
        volts(runtime("grid_voltage_s", 13)).cloud("vacs").describe("Grid voltage phase S / L2-N"),
        volts(runtime("grid_voltage_t", 14)).cloud("vact").describe("Grid voltage phase T"),
        hertz(runtime("grid_frequency", 15)).cloud("fac").describe("Grid frequency"),
        runtime("inverter_current_rms", 18)
            .scale(ScaleFactor::Div100)
            .unit(Unit::Ampere)
            .describe("Inverter RMS current"),
        runtime("power_factor", 19)
            .scale(ScaleFactor::Div1000)
            .cloud("pf")
            .describe("Power factor"),
        volts(runtime("eps_voltage_r", 20))
            .cloud("vepsr")
            .describe("Backup output voltage phase R"),
        volts(runtime("eps_voltage_s", 21))
            .cloud("vepss")
            .describe("Backup output voltage phase S"),
        volts(runtime("eps_voltage_t", 22))
            .cloud("vepst")
            .describe("Backup output voltage phase T"),
        hertz(runtime("eps_frequency", 23)).cloud("feps").describe("Backup output frequency"),
        watts(runtime("eps_power", 24)).cloud("peps").describe("Backup output active power"),
        runtime("eps_apparent_power", 25)
            .unit(Unit::VoltAmpere)
            .cloud("seps")
            .describe("Backup output apparent power"),
        energy_today("pv1_energy_today", 28).cloud("epv1Today"),
        energy_today("pv2_energy_today", 29).cloud("epv2Today"),
        energy_today("pv3_energy_today", 30).cloud("epv3Today"),
        energy_today("inverter_energy_today", 31).cloud("todayYielding"),
        energy_today("rectifier_energy_today", 32).cloud("todayRectifying"),
        energy_today("charge_energy_today", 33).cloud("todayCharging"),
        energy_today("discharge_energy_today", 34).cloud("todayDischarging"),
        energy_today("eps_energy_today", 35).cloud("todayEps"),
        energy_today("export_energy_today", 36).cloud("todayExport"),
        energy_today("import_energy_today", 37).cloud("todayImport"),
        volts(runtime("bus1_voltage", 38)).cloud("vBus1").describe("DC bus 1 voltage"),
        volts(runtime("bus2_voltage", 39)).cloud("vBus2").describe("DC bus 2 voltage"),
        energy_total("pv1_energy_total", 40).cloud("epv1All"),
        energy_total("pv2_energy_total", 42).cloud("epv2All"),
        energy_total("pv3_energy_total", 44).cloud("epv3All"),
        energy_total("inverter_energy_total", 46).cloud("totalYielding"),
        energy_total("rectifier_energy_total", 48).cloud("totalRectifying"),
        energy_total("charge_energy_total", 50).cloud("totalCharging"),
        energy_total("discharge_energy_total", 52).cloud("totalDischarging"),
        energy_total("eps_energy_total", 54).cloud("totalEps"),
        energy_total("export_energy_total", 56).cloud("totalExport"),
        energy_total("import_energy_total", 58).cloud("totalImport"),
        runtime("fault_code", 60)
            .double()
            .faults(&INVERTER_FAULTS)
            .cloud("faultCode")
            .describe("Active inverter faults"),
        runtime("warning_code", 62)
            .double()
            .faults(&INVERTER_WARNINGS)
            .cloud("warningCode")
            .describe("Active inverter warnings"),
        runtime("internal_temperature", 64)
            .signed()
            .unit(Unit::Celsius)
            .cloud("tinner"),
        runtime("radiator1_temperature", 65)
            .signed()
            .unit(Unit::Celsius)
            .cloud("tradiator1"),
        runtime("radiator2_temperature", 66)
            .signed()
            .unit(Unit::Celsius)
            .cloud("tradiator2"),
        battery("battery_temperature", 67).signed().unit(Unit::Celsius).cloud("tBat"),
        runtime("running_time", 69).double().unit(Unit::Second).describe("Accumulated run time"),
        battery("bms_charge_current_limit", 81)
            .scale(ScaleFactor::Div10)
            .unit(Unit::Ampere)
            .cloud("maxChgCurr")
            .describe("Charge current limit requested by the BMS"),
        battery("bms_discharge_current_limit", 82)
            .scale(ScaleFactor::Div10)
            .unit(Unit::Ampere)
            .cloud("maxDischgCurr")
            .describe("Discharge current limit requested by the BMS"),
        volts(battery("bms_charge_voltage_ref", 83)).cloud("chargeVoltRef"),
        volts(battery("bms_discharge_cutoff_voltage", 84)).cloud("dischgCutVolt"),
        battery("battery_count", 96)
            .cloud("batParallelNum")
            .describe("Battery modules in parallel"),
        battery("battery_capacity", 97)
            .unit(Unit::AmpereHour)
            .cloud("batCapacity"),
        battery("battery_current", 98)
            .signed()
            .scale(ScaleFactor::Div100)
            .unit(Unit::Ampere)
            .cloud("currentBat")
            .describe("Battery current, positive while charging"),
        battery("bms_fault_code", 99).codes(&BMS_FAULTS).cloud("bmsFaultCode").provisional(),
        battery("bms_warning_code", 100).codes(&BMS_WARNINGS).cloud("bmsWarningCode").provisional(),
        battery("max_cell_voltage", 101)
            .scale(ScaleFactor::Div1000)
            .unit(Unit::Volt)
            .cloud("maxCellVoltage"),
        battery("min_cell_voltage", 102)
            .scale(ScaleFactor::Div1000)
            .unit(Unit::Volt)
            .cloud("minCellVoltage"),
        battery("max_cell_temperature", 103)
            .signed()
            .scale(ScaleFactor::Div10)
            .unit(Unit::Celsius)
            .cloud("maxCellTemp"),
        battery("min_cell_temperature", 104)
            .signed()
            .scale(ScaleFactor::Div10)
            .unit(Unit::Celsius)
            .cloud("minCellTemp"),
        battery("cycle_count", 106).cloud("cycleCnt"),
        volts(runtime("generator_voltage", 121)).cloud("genVolt"),
        hertz(runtime("generator_frequency", 122)).cloud("genFreq"),
        watts(runtime("generator_power", 123)).cloud("genPower"),
        energy_today("generator_energy_today", 124).cloud("todayGenerating"),
        energy_total("generator_energy_total", 125).cloud("totalGenerating"),
    ]
}

/// Configuration registers shared by both hybrid inverter families.
fn inverter_parameters() -> Vec<RegisterDefinition> {
    let mut params = vec![
        RegisterDefinition::holding("function_enable", 21)
            .bits(&FUNCTION_ENABLE)
            .describe("Function enable flags"),
        percent(RegisterDefinition::holding("charge_power_percent", 64)),
        percent(RegisterDefinition::holding("discharge_power_percent", 65)),
        percent(RegisterDefinition::holding("ac_charge_power_percent", 66)),
        percent(RegisterDefinition::holding("ac_charge_soc_limit", 67)),
        percent(RegisterDefinition::holding("charge_priority_power_percent", 74)),
        percent(RegisterDefinition::holding("charge_priority_soc_limit", 75)),
        percent(RegisterDefinition::holding("forced_discharge_power_percent", 82)),
        percent(RegisterDefinition::holding("forced_discharge_soc_limit", 83)),
        volts(RegisterDefinition::holding("charge_voltage_ref", 99)),
        volts(RegisterDefinition::holding("discharge_cutoff_voltage", 100)),
        RegisterDefinition::holding("charge_current_limit", 101)
            .unit(Unit::Ampere)
            .describe("Battery charge current limit"),
        RegisterDefinition::holding("discharge_current_limit", 102)
            .unit(Unit::Ampere)
            .describe("Battery discharge current limit"),
        percent(RegisterDefinition::holding("feed_in_grid_power_percent", 103)),
        percent(RegisterDefinition::holding("discharge_cutoff_soc", 105)),
        RegisterDefinition::holding("system_function", 110)
            .bits(&SYSTEM_FUNCTION)
            .describe("Off-grid and micro-grid behaviour"),
        RegisterDefinition::holding("parallel_config", 113)
            .bits(&PARALLEL_CONFIG)
            .provisional()
            .describe("Parallel role, phase and group"),
        percent(RegisterDefinition::holding("ongrid_discharge_cutoff_soc", 125)),
        percent(RegisterDefinition::holding("ac_charge_start_soc", 160)),
        percent(RegisterDefinition::holding("ac_charge_end_soc", 161)),
    ];
    params.extend(weekly_schedule());
    params
}

/// Parametrically generated time-of-use schedule.
///
/// One register per slot boundary, hour in the low byte and minute in the
/// high byte. The whole block is provisional.
pub fn weekly_schedule() -> Vec<RegisterDefinition> {
    let mut defs = Vec::with_capacity(usize::from(SCHEDULE_REGISTERS));
    let mut address = SCHEDULE_BASE_ADDRESS;
    for day in SCHEDULE_DAYS {
        for mode in SCHEDULE_MODES {
            for slot in 0..SCHEDULE_SLOTS {
                for edge in ["start", "end"] {
                    defs.push(
                        RegisterDefinition::holding(
                            format!("schedule_{mode}_{day}_slot{slot}_{edge}"),
                            address,
                        )
                        .bits(&SCHEDULE_TIME)
                        .provisional(),
                    );
                    address += 1;
                }
            }
        }
    }
    defs
}

fn pv_series() -> Vec<RegisterDefinition> {
    let mut defs = inverter_common();
    defs.extend([
        watts(runtime("pv1_power", 7)).cloud("ppv1"),
        watts(runtime("pv2_power", 8)).cloud("ppv2"),
        watts(runtime("pv3_power", 9)).cloud("ppv3"),
        watts(runtime("battery_charge_power", 10)).cloud("pCharge"),
        watts(runtime("battery_discharge_power", 11)).cloud("pDisCharge"),
        watts(runtime("inverter_power", 16)).cloud("pinv"),
        watts(runtime("rectifier_power", 17)).cloud("prec"),
        watts(runtime("power_to_grid", 26)).cloud("pToGrid"),
        watts(runtime("power_to_user", 27)).cloud("pToUser"),
        volts(runtime("eps_l1_voltage", 127)).cloud("vepsl1N"),
        volts(runtime("eps_l2_voltage", 128)).cloud("vepsl2N"),
        watts(runtime("eps_l1_power", 129)).cloud("pEpsL1N"),
        watts(runtime("eps_l2_power", 130)).cloud("pEpsL2N"),
    ]);
    defs.extend(inverter_parameters());
    defs
}

fn eu_series() -> Vec<RegisterDefinition> {
    let mut defs = inverter_common();
    defs.extend([
        watts(runtime("pv1_power", 170).double()).cloud("ppv1"),
        watts(runtime("pv2_power", 172).double()).cloud("ppv2"),
        watts(runtime("pv3_power", 174).double()).cloud("ppv3"),
        watts(runtime("battery_charge_power", 176).double()).cloud("pCharge"),
        watts(runtime("battery_discharge_power", 178).double()).cloud("pDisCharge"),
        watts(runtime("inverter_power", 180).double()).cloud("pinv"),
        watts(runtime("rectifier_power", 182).double()).cloud("prec"),
        watts(runtime("power_to_grid", 184).double()).cloud("pToGrid"),
        watts(runtime("power_to_user", 186).double()).cloud("pToUser"),
    ]);
    defs.extend(inverter_parameters());
    defs
}

fn mid_controller() -> Vec<RegisterDefinition> {
    let amps = |def: RegisterDefinition| def.signed().scale(ScaleFactor::Div100).unit(Unit::Ampere);
    let signed_watts = |def: RegisterDefinition| def.signed().unit(Unit::Watt);
    vec![
        volts(runtime("grid_voltage_r", 0)).cloud("gridL1RmsVolt"),
        volts(runtime("grid_voltage_s", 1)).cloud("gridL2RmsVolt"),
        volts(runtime("ups_voltage_l1", 2)).cloud("upsL1RmsVolt"),
        volts(runtime("ups_voltage_l2", 3)).cloud("upsL2RmsVolt"),
        volts(runtime("generator_voltage", 4)).cloud("genL1RmsVolt"),
        volts(runtime("generator_voltage_l2", 5)).cloud("genL2RmsVolt"),
        amps(runtime("grid_current_l1", 6)).cloud("gridL1RmsCurr"),
        amps(runtime("grid_current_l2", 7)).cloud("gridL2RmsCurr"),
        amps(runtime("ups_current_l1", 8)).cloud("upsL1RmsCurr"),
        amps(runtime("ups_current_l2", 9)).cloud("upsL2RmsCurr"),
        amps(runtime("generator_current_l1", 10)).cloud("genL1RmsCurr"),
        amps(runtime("generator_current_l2", 11)).cloud("genL2RmsCurr"),
        signed_watts(runtime("grid_power_l1", 12)).cloud("gridL1ActivePower"),
        signed_watts(runtime("grid_power_l2", 13)).cloud("gridL2ActivePower"),
        signed_watts(runtime("ups_power_l1", 14)).cloud("upsL1ActivePower"),
        signed_watts(runtime("ups_power_l2", 15)).cloud("upsL2ActivePower"),
        signed_watts(runtime("generator_power", 16)).cloud("genL1ActivePower"),
        signed_watts(runtime("generator_power_l2", 17)).cloud("genL2ActivePower"),
        signed_watts(runtime("smart_load1_power", 18)).cloud("smartLoad1L1ActivePower"),
        signed_watts(runtime("smart_load2_power", 19)).cloud("smartLoad2L1ActivePower"),
        signed_watts(runtime("smart_load3_power", 20)).cloud("smartLoad3L1ActivePower"),
        signed_watts(runtime("smart_load4_power", 21)).cloud("smartLoad4L1ActivePower"),
        hertz(runtime("grid_frequency", 22)).cloud("gridFreq"),
        hertz(runtime("generator_frequency", 23)).cloud("genFreq"),
        runtime("smart_port_status", 24).bits(&SMART_PORTS),
        energy_total("import_energy_total", 40).cloud("eGridImportTotal"),
        energy_total("export_energy_total", 42).cloud("eGridExportTotal"),
        energy_total("generator_energy_total", 44).cloud("eGenTotal"),
        energy_today("import_energy_today", 46).cloud("eGridImportToday"),
        energy_today("export_energy_today", 47).cloud("eGridExportToday"),
        energy_today("load_energy_today", 48).cloud("eLoadToday"),
        RegisterDefinition::holding("smart_port_mode", 20)
            .bits(&SMART_PORTS)
            .describe("Smart port assignment"),
        RegisterDefinition::holding("generator_start_soc", 30).unit(Unit::Percent),
        RegisterDefinition::holding("generator_stop_soc", 31).unit(Unit::Percent),
        watts(RegisterDefinition::holding("generator_rated_power", 32)),
    ]
}

fn build(family: DeviceFamily, definitions: Vec<RegisterDefinition>) -> RegisterMap {
    RegisterMap::new(family, WordOrder::LowFirst, definitions)
        .unwrap_or_else(|violation| panic!("invalid {family} register table: {violation}"))
}

static PV_SERIES: LazyLock<RegisterMap> =
    LazyLock::new(|| build(DeviceFamily::PvSeries, pv_series()));
static EU_SERIES: LazyLock<RegisterMap> =
    LazyLock::new(|| build(DeviceFamily::EuSeries, eu_series()));
static MID_CONTROLLER: LazyLock<RegisterMap> =
    LazyLock::new(|| build(DeviceFamily::MidController, mid_controller()));

/// The shared, immutable register map of a family.
pub fn register_map(family: DeviceFamily) -> &'static RegisterMap {
    match family {
        DeviceFamily::PvSeries => &PV_SERIES,
        DeviceFamily::EuSeries => &EU_SERIES,
        DeviceFamily::MidController => &MID_CONTROLLER,
    }
}
