//! Declarative register model.
//!
//! A [`RegisterDefinition`] describes where a logical quantity lives on the
//! device and how its raw content is scaled and interpreted. Definitions are
//! pure data: they are built once per device family (see [`crate::families`])
//! and never mutated afterwards.

use serde::Serialize;
use std::fmt;

/// Divisor applied to the raw integer to obtain the physical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ScaleFactor {
    #[default]
    None,
    Div10,
    Div100,
    Div1000,
}

impl ScaleFactor {
    /// Raw integer = physical value x divisor.
    pub const fn divisor(self) -> f64 {
        match self {
            ScaleFactor::None => 1.0,
            ScaleFactor::Div10 => 10.0,
            ScaleFactor::Div100 => 100.0,
            ScaleFactor::Div1000 => 1000.0,
        }
    }
}

/// Register width: one 16-bit register or a 32-bit value split over two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Width {
    Bits16,
    Bits32,
}

impl Width {
    /// Number of consecutive registers occupied.
    pub const fn registers(self) -> u16 {
        match self {
            Width::Bits16 => 1,
            Width::Bits32 => 2,
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            Width::Bits16 => 16,
            Width::Bits32 => 32,
        }
    }
}

/// Order of the two halves of a 32-bit value in the register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WordOrder {
    /// Low word at the lower address (LuxPower style).
    LowFirst,
    /// High word at the lower address (classic Modbus big-endian).
    HighFirst,
}

/// Modbus register table a definition lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RegisterKind {
    /// Read-only telemetry.
    Input,
    /// Writable configuration.
    Holding,
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterKind::Input => write!(f, "input"),
            RegisterKind::Holding => write!(f, "holding"),
        }
    }
}

/// Data category a definition contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Category {
    Runtime,
    Energy,
    Battery,
    Parameters,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Runtime,
        Category::Energy,
        Category::Battery,
        Category::Parameters,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Category::Runtime => "runtime",
            Category::Energy => "energy",
            Category::Battery => "battery",
            Category::Parameters => "parameters",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown category `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Unit {
    #[default]
    None,
    Volt,
    Ampere,
    Watt,
    VoltAmpere,
    KiloWattHour,
    AmpereHour,
    Hertz,
    Celsius,
    Percent,
    Second,
    Minute,
}

impl Unit {
    pub const fn symbol(self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Watt => "W",
            Unit::VoltAmpere => "VA",
            Unit::KiloWattHour => "kWh",
            Unit::AmpereHour => "Ah",
            Unit::Hertz => "Hz",
            Unit::Celsius => "°C",
            Unit::Percent => "%",
            Unit::Second => "s",
            Unit::Minute => "min",
        }
    }
}

/// How much a register layout or code entry can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Confidence {
    #[default]
    Verified,
    /// Pending hardware verification.
    Provisional,
}

/// Meaning of a bit range inside one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMeaning {
    /// Single enable/disable bit.
    Flag(&'static str),
    /// Multi-bit field mapping raw values to labels.
    Enum {
        name: &'static str,
        labels: &'static [(u16, &'static str)],
    },
    /// Plain unsigned number packed into the register (e.g. a byte lane).
    Value {
        name: &'static str,
        cloud_field: Option<&'static str>,
    },
}

impl BitMeaning {
    pub const fn name(&self) -> &'static str {
        match *self {
            BitMeaning::Flag(name) => name,
            BitMeaning::Enum { name, .. } => name,
            BitMeaning::Value { name, .. } => name,
        }
    }
}

/// A sub-range of a register's bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub bit_offset: u8,
    pub bit_width: u8,
    pub meaning: BitMeaning,
}

impl BitField {
    pub const fn flag(bit_offset: u8, name: &'static str) -> Self {
        Self {
            bit_offset,
            bit_width: 1,
            meaning: BitMeaning::Flag(name),
        }
    }

    pub const fn value(
        bit_offset: u8,
        bit_width: u8,
        name: &'static str,
        cloud_field: Option<&'static str>,
    ) -> Self {
        Self {
            bit_offset,
            bit_width,
            meaning: BitMeaning::Value { name, cloud_field },
        }
    }

    pub const fn enumeration(
        bit_offset: u8,
        bit_width: u8,
        name: &'static str,
        labels: &'static [(u16, &'static str)],
    ) -> Self {
        Self {
            bit_offset,
            bit_width,
            meaning: BitMeaning::Enum { name, labels },
        }
    }

    pub const fn name(&self) -> &'static str {
        self.meaning.name()
    }

    /// Mask of the field, already shifted into position.
    pub const fn mask(&self) -> u32 {
        let width_mask = if self.bit_width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.bit_width) - 1
        };
        width_mask << self.bit_offset
    }

    pub const fn extract(&self, raw: u32) -> u32 {
        (raw & self.mask()) >> self.bit_offset
    }

    /// Highest bit index occupied plus one.
    pub const fn end_bit(&self) -> u16 {
        self.bit_offset as u16 + self.bit_width as u16
    }
}

/// One entry of a fault, warning or status code catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodeEntry {
    /// Bit index for bitmaps, code value for enumerations.
    pub code: u32,
    pub description: &'static str,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeTable {
    pub name: &'static str,
    pub entries: &'static [CodeEntry],
}

impl CodeTable {
    /// Entry for exactly `code`, if the table knows it.
    pub fn lookup(&self, code: u32) -> Option<&'static CodeEntry> {
        self.entries.iter().find(|entry| entry.code == code)
    }
}

/// How the raw integer of a register is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantics {
    /// Scaled number.
    Scalar,
    /// Packed flags, enums and sub-values.
    Bitfield(&'static [BitField]),
    /// Several conditions at once, one per set bit (inverter faults/warnings).
    FaultBitmap(&'static CodeTable),
    /// Exactly one active code (BMS faults/warnings, status words).
    CodeEnum(&'static CodeTable),
}

/// Where one logical quantity lives and how it is encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDefinition {
    pub canonical_name: String,
    pub address: u16,
    pub kind: RegisterKind,
    pub category: Category,
    /// Second category the register is reported in (e.g. SOC in runtime and battery).
    pub also_in: Option<Category>,
    pub width: Width,
    pub signed: bool,
    pub scale: ScaleFactor,
    pub semantics: Semantics,
    pub unit: Unit,
    /// Field name used by the cloud's fixed record endpoints, if any.
    pub cloud_field: Option<&'static str>,
    pub description: &'static str,
    pub confidence: Confidence,
    pub writable: bool,
}

impl RegisterDefinition {
    /// Read-only telemetry register.
    pub fn input(name: impl Into<String>, address: u16, category: Category) -> Self {
        Self::new(name.into(), address, RegisterKind::Input, category, false)
    }

    /// Writable configuration register.
    pub fn holding(name: impl Into<String>, address: u16) -> Self {
        Self::new(
            name.into(),
            address,
            RegisterKind::Holding,
            Category::Parameters,
            true,
        )
    }

    fn new(
        canonical_name: String,
        address: u16,
        kind: RegisterKind,
        category: Category,
        writable: bool,
    ) -> Self {
        Self {
            canonical_name,
            address,
            kind,
            category,
            also_in: None,
            width: Width::Bits16,
            signed: false,
            scale: ScaleFactor::None,
            semantics: Semantics::Scalar,
            unit: Unit::None,
            cloud_field: None,
            description: "",
            confidence: Confidence::Verified,
            writable,
        }
    }

    pub fn also(mut self, category: Category) -> Self {
        self.also_in = Some(category);
        self
    }

    /// Spans two registers as one 32-bit value.
    pub fn double(mut self) -> Self {
        self.width = Width::Bits32;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn scale(mut self, scale: ScaleFactor) -> Self {
        self.scale = scale;
        self
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Field name in the cloud's record endpoints.
    pub fn cloud(mut self, field: &'static str) -> Self {
        self.cloud_field = Some(field);
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub fn bits(mut self, layout: &'static [BitField]) -> Self {
        self.semantics = Semantics::Bitfield(layout);
        self
    }

    /// Fault bitmap over `table`. Makes the register read-only.
    pub fn faults(mut self, table: &'static CodeTable) -> Self {
        self.semantics = Semantics::FaultBitmap(table);
        self.writable = false;
        self
    }

    /// Single active code out of `table`. Makes the register read-only.
    pub fn codes(mut self, table: &'static CodeTable) -> Self {
        self.semantics = Semantics::CodeEnum(table);
        self.writable = false;
        self
    }

    pub fn provisional(mut self) -> Self {
        self.confidence = Confidence::Provisional;
        self
    }

    pub fn name(&self) -> &str {
        &self.canonical_name
    }

    /// Whether the register is reported in `category`, as primary or second category.
    pub fn belongs_to(&self, category: Category) -> bool {
        self.category == category || self.also_in == Some(category)
    }

    /// Number of registers the definition occupies.
    pub const fn registers(&self) -> u16 {
        self.width.registers()
    }

    /// Last register address covered (inclusive).
    pub fn end_address(&self) -> u16 {
        self.address.saturating_add(self.registers() - 1)
    }

    /// Every register address the definition covers.
    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        self.address..=self.end_address()
    }

    pub fn bit_layout(&self) -> Option<&'static [BitField]> {
        match self.semantics {
            Semantics::Bitfield(layout) => Some(layout),
            _ => None,
        }
    }

    /// Inclusive bounds of the raw integer this register can carry.
    pub const fn raw_bounds(&self) -> (i64, i64) {
        match (self.width, self.signed) {
            (Width::Bits16, false) => (0, u16::MAX as i64),
            (Width::Bits16, true) => (i16::MIN as i64, i16::MAX as i64),
            (Width::Bits32, false) => (0, u32::MAX as i64),
            (Width::Bits32, true) => (i32::MIN as i64, i32::MAX as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_field_mask_and_extract() {
        let soh = BitField::value(8, 8, "soh", Some("soh"));
        assert_eq!(soh.mask(), 0xFF00);
        assert_eq!(soh.extract(0x6452), 0x64);
        assert_eq!(soh.end_bit(), 16);

        let flag = BitField::flag(7, "ac_charge_en");
        assert_eq!(flag.mask(), 0x80);
        assert_eq!(flag.extract(0x80), 1);
        assert_eq!(flag.extract(0x7F), 0);
    }

    #[test]
    fn definition_builder_and_bounds() {
        let def = RegisterDefinition::input("pv_energy_total", 40, Category::Energy)
            .double()
            .scale(ScaleFactor::Div10)
            .unit(Unit::KiloWattHour);
        assert_eq!(def.registers(), 2);
        assert_eq!(def.end_address(), 41);
        assert_eq!(def.addresses().collect::<Vec<_>>(), vec![40, 41]);
        assert_eq!(def.raw_bounds(), (0, u32::MAX as i64));
        assert!(!def.writable);

        let def = RegisterDefinition::holding("grid_power_limit", 100).signed();
        assert_eq!(def.raw_bounds(), (-32768, 32767));
        assert!(def.writable);
        assert_eq!(def.category, Category::Parameters);
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("Runtime".parse::<Category>(), Ok(Category::Runtime));
        assert_eq!("parameters".parse::<Category>(), Ok(Category::Parameters));
        assert!("firmware".parse::<Category>().is_err());
    }
}
