//! Ordered, validated collections of register definitions.

use crate::register::{Category, Confidence, RegisterDefinition, RegisterKind, WordOrder};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

/// A group of models sharing one register layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceFamily {
    /// Split-phase hybrid inverters (18kPV, FlexBOSS).
    PvSeries,
    /// Three-phase hybrid inverters with 32-bit power registers.
    EuSeries,
    /// Grid-interconnect (MID) controller.
    MidController,
}

impl DeviceFamily {
    pub const ALL: [DeviceFamily; 3] = [
        DeviceFamily::PvSeries,
        DeviceFamily::EuSeries,
        DeviceFamily::MidController,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceFamily::PvSeries => "pv-series",
            DeviceFamily::EuSeries => "eu-series",
            DeviceFamily::MidController => "mid-controller",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceFamily::ALL
            .into_iter()
            .find(|family| family.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown device family `{s}`"))
    }
}

/// Why a set of definitions does not form a valid map.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MapViolation {
    #[error("duplicate name `{0}`")]
    DuplicateName(String),

    #[error("`{first}` and `{second}` claim the same registers")]
    Overlap { first: String, second: String },

    #[error("bit field `{field}` of `{register}` overlaps another field")]
    BitOverlap { register: String, field: String },

    #[error("bit field `{field}` of `{register}` exceeds the register width")]
    BitOutOfRange { register: String, field: String },

    #[error("`{0}` runs past the end of the address space")]
    AddressOverflow(String),
}

/// Read-only metadata of one register, for entity and documentation builders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry<'a> {
    pub name: &'a str,
    pub address: u16,
    pub registers: u16,
    pub kind: RegisterKind,
    pub category: Category,
    pub unit: &'static str,
    pub description: &'static str,
    pub confidence: Confidence,
    pub writable: bool,
}

/// Immutable register layout of one device family.
///
/// Definitions are ordered by register table and address. Within a table no
/// two definitions share an address, and bit layouts never overlap or exceed
/// the register width.
#[derive(Debug)]
pub struct RegisterMap {
    family: DeviceFamily,
    word_order: WordOrder,
    definitions: Vec<RegisterDefinition>,
    by_name: HashMap<String, usize>,
}

impl RegisterMap {
    /// Sorts and validates `definitions`.
    ///
    /// Fails on the first duplicate name, overlapping address range, address
    /// overflow or invalid bit layout.
    pub fn new(
        family: DeviceFamily,
        word_order: WordOrder,
        mut definitions: Vec<RegisterDefinition>,
    ) -> Result<Self, MapViolation> {
        definitions.sort_by_key(|def| (def.kind, def.address));

        let mut by_name = HashMap::with_capacity(definitions.len());
        for (index, def) in definitions.iter().enumerate() {
            if by_name.insert(def.canonical_name.clone(), index).is_some() {
                return Err(MapViolation::DuplicateName(def.canonical_name.clone()));
            }
            if def.address.checked_add(def.registers() - 1).is_none() {
                return Err(MapViolation::AddressOverflow(def.canonical_name.clone()));
            }
            validate_bit_layout(def)?;
        }

        for pair in definitions.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);
            if first.kind == second.kind && second.address <= first.end_address() {
                return Err(MapViolation::Overlap {
                    first: first.canonical_name.clone(),
                    second: second.canonical_name.clone(),
                });
            }
        }

        Ok(Self {
            family,
            word_order,
            definitions,
            by_name,
        })
    }

    /// The family this layout belongs to.
    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    /// Order of the two halves of 32-bit values.
    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    /// Looks up a definition by canonical name.
    pub fn get(&self, name: &str) -> Option<&RegisterDefinition> {
        self.by_name.get(name).map(|index| &self.definitions[*index])
    }

    /// Whether `name` is a canonical name in this layout.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All definitions in table and address order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.definitions.iter()
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions contributing to one data category.
    pub fn category(&self, category: Category) -> impl Iterator<Item = &RegisterDefinition> {
        self.definitions
            .iter()
            .filter(move |def| def.belongs_to(category))
    }

    /// Read-only listing of every register, in address order.
    pub fn catalog(&self) -> impl Iterator<Item = CatalogEntry<'_>> {
        self.definitions.iter().map(|def| CatalogEntry {
            name: &def.canonical_name,
            address: def.address,
            registers: def.registers(),
            kind: def.kind,
            category: def.category,
            unit: def.unit.symbol(),
            description: def.description,
            confidence: def.confidence,
            writable: def.writable,
        })
    }
}

fn validate_bit_layout(def: &RegisterDefinition) -> Result<(), MapViolation> {
    let Some(layout) = def.bit_layout() else {
        return Ok(());
    };
    let mut used = 0u32;
    for field in layout {
        if field.bit_width == 0 || field.end_bit() > u16::from(def.width.bits()) {
            return Err(MapViolation::BitOutOfRange {
                register: def.canonical_name.clone(),
                field: field.name().to_string(),
            });
        }
        if used & field.mask() != 0 {
            return Err(MapViolation::BitOverlap {
                register: def.canonical_name.clone(),
                field: field.name().to_string(),
            });
        }
        used |= field.mask();
    }
    Ok(())
}
