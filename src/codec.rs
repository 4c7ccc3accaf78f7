//! Scaling codec between raw register content and physical quantities.
//!
//! All functions are pure. Raw values travel as `i64` so that every register
//! width, signed or not, fits without loss; the two-register split and join of
//! 32-bit values happens in [`words_from_raw`] and [`raw_from_words`].

use crate::{
    error::{EncodeError, Error, Result},
    register::{BitField, BitMeaning, CodeTable, RegisterDefinition, Semantics, Width, WordOrder},
};
use serde::Serialize;
use std::fmt;

/// A decoded bit field that is active (flag set, enum label known) or a packed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BitValue {
    pub name: &'static str,
    pub raw: u32,
    pub label: Option<&'static str>,
}

/// Typed result of decoding one register definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PhysicalValue {
    Number(f64),
    Bool(bool),
    Bits(Vec<BitValue>),
    /// Descriptions of every active condition of a fault bitmap.
    Faults(Vec<&'static str>),
    /// Single code description.
    Code(String),
}

impl PhysicalValue {
    const fn kind(&self) -> &'static str {
        match self {
            PhysicalValue::Number(_) => "a number",
            PhysicalValue::Bool(_) => "a boolean",
            PhysicalValue::Bits(_) => "bit values",
            PhysicalValue::Faults(_) => "fault descriptions",
            PhysicalValue::Code(_) => "a code description",
        }
    }
}

impl fmt::Display for PhysicalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalValue::Number(value) => write!(f, "{value}"),
            PhysicalValue::Bool(value) => write!(f, "{}", if *value { "ON" } else { "OFF" }),
            PhysicalValue::Bits(bits) => {
                let parts: Vec<String> = bits
                    .iter()
                    .map(|bit| match bit.label {
                        Some(label) => format!("{}={label}", bit.name),
                        None => format!("{}={}", bit.name, bit.raw),
                    })
                    .collect();
                write!(f, "[{}]", parts.join(", "))
            }
            PhysicalValue::Faults(faults) => write!(f, "[{}]", faults.join(", ")),
            PhysicalValue::Code(code) => f.write_str(code),
        }
    }
}

/// Reinterprets an unsigned raw register value as two's complement when the
/// definition is signed.
pub fn signed_raw(raw: i64, def: &RegisterDefinition) -> i64 {
    if !def.signed {
        return raw;
    }
    match def.width {
        Width::Bits16 if (0x8000..=0xFFFF).contains(&raw) => raw - 0x1_0000,
        Width::Bits32 if (0x8000_0000..=0xFFFF_FFFF).contains(&raw) => raw - 0x1_0000_0000,
        _ => raw,
    }
}

/// Decodes raw register content into a physical value.
pub fn decode(raw: i64, def: &RegisterDefinition) -> PhysicalValue {
    let raw = signed_raw(raw, def);
    match def.semantics {
        Semantics::Scalar => PhysicalValue::Number(raw as f64 / def.scale.divisor()),
        Semantics::Bitfield(layout) => PhysicalValue::Bits(decode_bitfield(raw as u32, layout)),
        Semantics::FaultBitmap(table) => {
            PhysicalValue::Faults(decode_fault_bits(raw as u32, table))
        }
        Semantics::CodeEnum(table) => PhysicalValue::Code(decode_code(raw as u32, table)),
    }
}

/// Encodes a physical value into the raw integer for `def`.
///
/// The result is range checked against the register width; nothing is
/// truncated silently.
pub fn encode(
    value: &PhysicalValue,
    def: &RegisterDefinition,
) -> std::result::Result<i64, EncodeError> {
    match (&def.semantics, value) {
        (Semantics::Scalar | Semantics::Bitfield(_), PhysicalValue::Number(number)) => {
            encode_number(*number, def)
        }
        (Semantics::Scalar, PhysicalValue::Bool(on)) => Ok(i64::from(*on)),
        (Semantics::Bitfield(layout), PhysicalValue::Bits(bits)) => {
            let mut raw = 0u32;
            for bit in bits {
                raw = compose_field(raw, def, layout, bit.name, bit.raw)?;
            }
            Ok(i64::from(raw))
        }
        (_, other) => Err(EncodeError::NotEncodable {
            field: def.canonical_name.clone(),
            kind: other.kind(),
        }),
    }
}

/// Scales a number into the raw integer and checks it against the register bounds.
pub fn encode_number(
    value: f64,
    def: &RegisterDefinition,
) -> std::result::Result<i64, EncodeError> {
    if !value.is_finite() {
        return Err(EncodeError::NotFinite {
            field: def.canonical_name.clone(),
        });
    }
    let divisor = def.scale.divisor();
    let scaled = (value * divisor).round();
    let (min, max) = def.raw_bounds();
    if scaled < min as f64 || scaled > max as f64 {
        return Err(EncodeError::OutOfRange {
            field: def.canonical_name.clone(),
            value,
            min: min as f64 / divisor,
            max: max as f64 / divisor,
        });
    }
    Ok(scaled as i64)
}

/// Splits a raw value into register words in the given order.
pub fn words_from_raw(raw: i64, def: &RegisterDefinition, order: WordOrder) -> Vec<u16> {
    match def.width {
        Width::Bits16 => vec![raw as u16],
        Width::Bits32 => {
            let bits = raw as u32;
            let (low, high) = (bits as u16, (bits >> 16) as u16);
            match order {
                WordOrder::LowFirst => vec![low, high],
                WordOrder::HighFirst => vec![high, low],
            }
        }
    }
}

/// Joins register words into the unsigned raw value.
///
/// Both halves of a 32-bit value must be present; a partial read is a decode
/// error.
pub fn raw_from_words(words: &[u16], def: &RegisterDefinition, order: WordOrder) -> Result<i64> {
    if words.len() != usize::from(def.registers()) {
        return Err(Error::ProtocolDecode(format!(
            "`{}` spans {} register(s), got {}",
            def.canonical_name,
            def.registers(),
            words.len()
        )));
    }
    Ok(match def.width {
        Width::Bits16 => i64::from(words[0]),
        Width::Bits32 => {
            let (low, high) = match order {
                WordOrder::LowFirst => (words[0], words[1]),
                WordOrder::HighFirst => (words[1], words[0]),
            };
            i64::from(u32::from(high) << 16 | u32::from(low))
        }
    })
}

/// Lists the active fields of a bitfield register.
///
/// Flags appear only when set, enums only when the value has a label, packed
/// values always. Bits outside the layout are ignored.
pub fn decode_bitfield(raw: u32, layout: &[BitField]) -> Vec<BitValue> {
    layout
        .iter()
        .filter_map(|field| {
            let value = field.extract(raw);
            match field.meaning {
                BitMeaning::Flag(name) => (value == 1).then_some(BitValue {
                    name,
                    raw: 1,
                    label: None,
                }),
                BitMeaning::Enum { name, labels } => labels
                    .iter()
                    .find(|(code, _)| u32::from(*code) == value)
                    .map(|(_, label)| BitValue {
                        name,
                        raw: value,
                        label: Some(label),
                    }),
                BitMeaning::Value { name, .. } => Some(BitValue {
                    name,
                    raw: value,
                    label: None,
                }),
            }
        })
        .collect()
}

fn compose_field(
    current: u32,
    def: &RegisterDefinition,
    layout: &[BitField],
    name: &str,
    value: u32,
) -> std::result::Result<u32, EncodeError> {
    let field = layout
        .iter()
        .find(|field| field.name() == name)
        .ok_or_else(|| EncodeError::UnknownBitField {
            field: def.canonical_name.clone(),
            name: name.to_string(),
        })?;
    let max = field.mask() >> field.bit_offset;
    if value > max {
        return Err(EncodeError::OutOfRange {
            field: format!("{}.{}", def.canonical_name, name),
            value: f64::from(value),
            min: 0.0,
            max: f64::from(max),
        });
    }
    Ok(current & !field.mask() | value << field.bit_offset)
}

/// Returns `current` with the named bit field set to `value`, leaving every
/// other bit untouched.
pub fn with_bit_field(
    current: i64,
    def: &RegisterDefinition,
    name: &str,
    value: u32,
) -> std::result::Result<i64, EncodeError> {
    let layout = def.bit_layout().ok_or_else(|| EncodeError::UnknownBitField {
        field: def.canonical_name.clone(),
        name: name.to_string(),
    })?;
    compose_field(current as u32, def, layout, name, value).map(i64::from)
}

/// Descriptions of every set bit that has a catalogue entry, in bit order.
pub fn decode_fault_bits(raw: u32, table: &CodeTable) -> Vec<&'static str> {
    (0..32)
        .filter(|bit| raw & (1 << bit) != 0)
        .filter_map(|bit| table.lookup(bit).map(|entry| entry.description))
        .collect()
}

/// Single-code lookup; unknown codes are rendered, never rejected.
pub fn decode_code(raw: u32, table: &CodeTable) -> String {
    match table.lookup(raw) {
        Some(entry) => entry.description.to_string(),
        None => format!("Unknown code: 0x{raw:04X}"),
    }
}

/// Every field of a bit layout as its own value: flags as booleans, enums as
/// labels, packed values as numbers.
///
/// Unlike [`decode_bitfield`] cleared flags are reported too.
pub fn decode_sub_fields(raw: u32, layout: &[BitField]) -> Vec<(&'static str, PhysicalValue)> {
    layout
        .iter()
        .map(|field| {
            let value = field.extract(raw);
            let decoded = match field.meaning {
                BitMeaning::Flag(_) => PhysicalValue::Bool(value == 1),
                BitMeaning::Enum { labels, .. } => PhysicalValue::Code(
                    labels
                        .iter()
                        .find(|(code, _)| u32::from(*code) == value)
                        .map_or_else(
                            || format!("Unknown code: 0x{value:04X}"),
                            |(_, label)| label.to_string(),
                        ),
                ),
                BitMeaning::Value { .. } => PhysicalValue::Number(f64::from(value)),
            };
            (field.name(), decoded)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{Category, CodeEntry, Confidence, ScaleFactor};
    use assert_matches::assert_matches;

    static THREE_FAULTS: CodeTable = CodeTable {
        name: "test",
        entries: &[
            CodeEntry {
                code: 0,
                description: "zero",
                confidence: Confidence::Verified,
            },
            CodeEntry {
                code: 1,
                description: "one",
                confidence: Confidence::Verified,
            },
            CodeEntry {
                code: 2,
                description: "two",
                confidence: Confidence::Verified,
            },
        ],
    };

    static LAYOUT: [BitField; 3] = [
        BitField::flag(0, "eps_en"),
        BitField::enumeration(1, 2, "role", &[(0, "single"), (1, "master"), (2, "slave")]),
        BitField::value(8, 8, "level", None),
    ];

    fn scalar(width: Width, signed: bool, scale: ScaleFactor) -> RegisterDefinition {
        let mut def = RegisterDefinition::holding("value", 10).scale(scale);
        def.width = width;
        def.signed = signed;
        def
    }

    #[test]
    fn decode_scaled_values() {
        let def = scalar(Width::Bits16, false, ScaleFactor::Div10);
        assert_eq!(decode(219, &def), PhysicalValue::Number(21.9));
        let def = scalar(Width::Bits16, false, ScaleFactor::Div100);
        assert_eq!(decode(5002, &def), PhysicalValue::Number(50.02));
        let def = scalar(Width::Bits16, false, ScaleFactor::Div1000);
        assert_eq!(decode(3312, &def), PhysicalValue::Number(3.312));
    }

    #[test]
    fn signed_16_bit_is_twos_complement() {
        let def = scalar(Width::Bits16, true, ScaleFactor::Div10);
        assert_eq!(decode(0xFF90, &def), PhysicalValue::Number(-11.2));
        assert_eq!(decode(0x8000, &def), PhysicalValue::Number(-3276.8));
        assert_eq!(decode(0x7FFF, &def), PhysicalValue::Number(3276.7));

        let unsigned = scalar(Width::Bits16, false, ScaleFactor::Div10);
        assert_eq!(decode(0xFF90, &unsigned), PhysicalValue::Number(6542.4));
    }

    #[test]
    fn round_trip_over_full_range() {
        let widths = [Width::Bits16, Width::Bits32];
        let scales = [
            ScaleFactor::None,
            ScaleFactor::Div10,
            ScaleFactor::Div100,
            ScaleFactor::Div1000,
        ];
        for width in widths {
            for signed in [false, true] {
                for scale in scales {
                    let def = scalar(width, signed, scale);
                    let (min, max) = def.raw_bounds();
                    let mut samples = vec![min, min + 1, 0, 1, max - 1, max];
                    if signed {
                        samples.extend([-1, -2]);
                    }
                    if width == Width::Bits32 {
                        samples.extend([0xFFFF, 0x1_0000].into_iter().filter(|v| *v <= max));
                    }
                    for raw in samples {
                        let decoded = decode(raw, &def);
                        let encoded = encode(&decoded, &def).unwrap();
                        assert_eq!(encoded, raw, "{width:?} signed={signed} {scale:?}");
                        assert_eq!(decode(encoded, &def), decoded);

                        let words = words_from_raw(encoded, &def, WordOrder::LowFirst);
                        let joined = raw_from_words(&words, &def, WordOrder::LowFirst).unwrap();
                        assert_eq!(decode(joined, &def), decoded);
                    }
                }
            }
        }
    }

    #[test]
    fn encode_rejects_out_of_range() {
        let def = scalar(Width::Bits16, false, ScaleFactor::Div10);
        assert_matches!(encode_number(6553.5, &def), Ok(65535));
        assert_matches!(
            encode_number(6553.6, &def),
            Err(EncodeError::OutOfRange { .. })
        );
        assert_matches!(encode_number(-0.1, &def), Err(EncodeError::OutOfRange { .. }));
        assert_matches!(encode_number(f64::NAN, &def), Err(EncodeError::NotFinite { .. }));

        let def = scalar(Width::Bits32, true, ScaleFactor::None);
        assert_matches!(encode_number(2147483647.0, &def), Ok(2147483647));
        assert_matches!(
            encode_number(2147483648.0, &def),
            Err(EncodeError::OutOfRange { .. })
        );
    }

    #[test]
    fn thirty_two_bit_word_order() {
        let def = scalar(Width::Bits32, false, ScaleFactor::Div10);
        assert_eq!(words_from_raw(0x0001_0002, &def, WordOrder::LowFirst), vec![2, 1]);
        assert_eq!(words_from_raw(0x0001_0002, &def, WordOrder::HighFirst), vec![1, 2]);
        assert_eq!(raw_from_words(&[2, 1], &def, WordOrder::LowFirst).unwrap(), 0x0001_0002);
        assert_eq!(raw_from_words(&[1, 2], &def, WordOrder::HighFirst).unwrap(), 0x0001_0002);

        let signed = scalar(Width::Bits32, true, ScaleFactor::None);
        let words = words_from_raw(-2, &signed, WordOrder::LowFirst);
        assert_eq!(words, vec![0xFFFE, 0xFFFF]);
        let raw = raw_from_words(&words, &signed, WordOrder::LowFirst).unwrap();
        assert_eq!(decode(raw, &signed), PhysicalValue::Number(-2.0));
    }

    #[test]
    fn half_of_a_32_bit_pair_is_an_error() {
        let def = scalar(Width::Bits32, false, ScaleFactor::None);
        assert_matches!(
            raw_from_words(&[0x1234], &def, WordOrder::LowFirst),
            Err(Error::ProtocolDecode(_))
        );
    }

    #[test]
    fn bitfield_decode_ignores_unknown_bits() {
        // eps on, role=master, level=0x42, plus bit 5 and 6 which are not in the layout
        let raw = 0x4200 | 0b110_0011;
        let bits = decode_bitfield(raw, &LAYOUT);
        assert_eq!(
            bits,
            vec![
                BitValue {
                    name: "eps_en",
                    raw: 1,
                    label: None
                },
                BitValue {
                    name: "role",
                    raw: 1,
                    label: Some("master")
                },
                BitValue {
                    name: "level",
                    raw: 0x42,
                    label: None
                },
            ]
        );

        // role value 3 has no label and is dropped
        let bits = decode_bitfield(0b110, &LAYOUT);
        assert_eq!(bits.iter().map(|b| b.name).collect::<Vec<_>>(), vec!["level"]);
    }

    #[test]
    fn bit_field_updates_preserve_other_bits() {
        let def = RegisterDefinition::holding("functions", 21).bits(&LAYOUT);
        let raw = with_bit_field(0x4200, &def, "eps_en", 1).unwrap();
        assert_eq!(raw, 0x4201);
        let raw = with_bit_field(raw, &def, "role", 2).unwrap();
        assert_eq!(raw, 0x4205);
        assert_matches!(
            with_bit_field(raw, &def, "role", 4),
            Err(EncodeError::OutOfRange { .. })
        );
        assert_matches!(
            with_bit_field(raw, &def, "missing", 1),
            Err(EncodeError::UnknownBitField { .. })
        );

        let bits = decode(raw, &def);
        assert_eq!(encode(&bits, &def), Ok(raw));
    }

    #[test]
    fn sub_fields_include_cleared_flags() {
        let fields = decode_sub_fields(0x4206, &LAYOUT);
        assert_eq!(
            fields,
            vec![
                ("eps_en", PhysicalValue::Bool(false)),
                ("role", PhysicalValue::Code("Unknown code: 0x0003".into())),
                ("level", PhysicalValue::Number(66.0)),
            ]
        );
    }

    #[test]
    fn fault_bitmap_returns_every_set_bit() {
        assert_eq!(decode_fault_bits(0b101, &THREE_FAULTS), vec!["zero", "two"]);
        assert!(decode_fault_bits(0, &THREE_FAULTS).is_empty());
        // bit 7 has no entry
        assert_eq!(decode_fault_bits(0b1000_0010, &THREE_FAULTS), vec!["one"]);
    }

    #[test]
    fn code_lookup_renders_unknown_codes() {
        assert_eq!(decode_code(2, &THREE_FAULTS), "two");
        assert_eq!(decode_code(0x1F, &THREE_FAULTS), "Unknown code: 0x001F");
        assert_eq!(decode_code(0x1F, &THREE_FAULTS), decode_code(0x1F, &THREE_FAULTS));
    }

    #[test]
    fn read_only_semantics_are_not_encodable() {
        let def = RegisterDefinition::input("faults", 60, Category::Runtime)
            .double()
            .faults(&THREE_FAULTS);
        assert_matches!(
            encode(&PhysicalValue::Number(1.0), &def),
            Err(EncodeError::NotEncodable { .. })
        );
    }
}
