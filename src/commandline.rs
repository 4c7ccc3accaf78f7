use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use inverter_link::{
    codec::PhysicalValue,
    config::DEFAULT_CONFIG_FILE,
    register::{Category, RegisterKind},
    register_map::DeviceFamily,
};
use std::path::PathBuf;

fn parse_register_kind(s: &str) -> Result<RegisterKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "input" | "i" => Ok(RegisterKind::Input),
        "holding" | "h" => Ok(RegisterKind::Holding),
        other => Err(format!("Invalid register kind '{other}', expected input or holding")),
    }
}

fn parse_register(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex::<u16>(s).map_err(|e| format!("Invalid register number format: {e}"))
}

/// Booleans accept on/off as well as true/false, everything else must be a number.
pub fn parse_physical_value(s: &str) -> Result<PhysicalValue, String> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" => Ok(PhysicalValue::Bool(true)),
        "off" | "false" => Ok(PhysicalValue::Bool(false)),
        _ => s
            .parse::<f64>()
            .map(PhysicalValue::Number)
            .map_err(|e| format!("Invalid value '{s}': {e}")),
    }
}

fn parse_switch(s: &str) -> Result<bool, String> {
    match parse_physical_value(s)? {
        PhysicalValue::Bool(on) => Ok(on),
        _ => Err(format!("Invalid switch state '{s}', expected on or off")),
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Modbus-TCP link to a local gateway.
    Local,
    /// Vendor cloud portal.
    Cloud,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Print the register catalog of a device family.
    /// Families: pv-series, eu-series, mid-controller.
    #[clap(verbatim_doc_comment)]
    Catalog {
        #[arg(value_parser = str::parse::<DeviceFamily>)]
        family: DeviceFamily,
    },

    /// Refresh one record category of a device and print it as JSON.
    /// Categories: runtime, energy, battery, parameters.
    #[clap(verbatim_doc_comment)]
    Read {
        /// Serial number of a configured device.
        serial: String,
        #[arg(value_parser = str::parse::<Category>)]
        category: Category,
    },

    /// Read an arbitrary register range, chunked as the transport requires.
    /// Register numbers can be given in decimal or hexadecimal (e.g. "0x7D").
    #[clap(verbatim_doc_comment)]
    Raw {
        serial: String,
        /// Register table: input or holding.
        #[arg(value_parser = parse_register_kind)]
        kind: RegisterKind,
        #[arg(value_parser = parse_register)]
        start: u16,
        #[arg(value_parser = parse_register)]
        count: u16,
    },

    /// Encode and write one parameter by its canonical name.
    /// Writes are not repeated on failure; check the device afterwards.
    #[clap(verbatim_doc_comment)]
    Write {
        serial: String,
        /// Canonical register name, see `catalog`.
        name: String,
        /// Physical value, e.g. "80" or "52.5"; "on"/"off" for switches.
        #[arg(value_parser = parse_physical_value, allow_hyphen_values = true)]
        value: PhysicalValue,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Switch one function flag (e.g. "ac_charge_en") on or off.
    Flag {
        serial: String,
        flag: String,
        #[arg(value_parser = parse_switch)]
        state: bool,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

const fn about_text() -> &'static str {
    "invctl - Read and configure solar inverters, batteries and MID controllers via cloud or Modbus-TCP."
}

#[derive(Parser, Debug)]
#[command(name="invctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML configuration file with transports and devices.
    #[arg(global = true, short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Transport to use. Defaults to local when configured, else cloud.
    #[arg(global = true, short, long, value_enum)]
    pub transport: Option<TransportKind>,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_parse_as_numbers_or_switches() {
        assert_eq!(parse_physical_value("52.5"), Ok(PhysicalValue::Number(52.5)));
        assert_eq!(parse_physical_value("-3"), Ok(PhysicalValue::Number(-3.0)));
        assert_eq!(parse_physical_value("ON"), Ok(PhysicalValue::Bool(true)));
        assert!(parse_physical_value("fast").is_err());
        assert_eq!(parse_switch("off"), Ok(false));
        assert!(parse_switch("1").is_err());
    }

    #[test]
    fn raw_accepts_hex_registers() {
        let args = CliArgs::try_parse_from(["invctl", "raw", "1234567890", "holding", "0x7D", "40"])
            .unwrap();
        assert_eq!(
            args.command,
            CliCommands::Raw {
                serial: "1234567890".into(),
                kind: RegisterKind::Holding,
                start: 125,
                count: 40,
            }
        );
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(args.transport, None);
    }

    #[test]
    fn global_options_follow_the_command() {
        let args = CliArgs::try_parse_from([
            "invctl", "read", "1234567890", "battery", "--transport", "cloud", "-c", "site.yml",
        ])
        .unwrap();
        assert_eq!(args.transport, Some(TransportKind::Cloud));
        assert_eq!(args.config, PathBuf::from("site.yml"));
        assert_eq!(
            args.command,
            CliCommands::Read {
                serial: "1234567890".into(),
                category: Category::Battery,
            }
        );
    }
}
