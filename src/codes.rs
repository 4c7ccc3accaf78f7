//! Fault, warning and status code catalogues.
//!
//! Inverter fault and warning registers are bitmaps: every set bit is an
//! active condition and the entry `code` is the bit index. BMS fault and
//! warning registers carry exactly one code, looked up by value.
//!
//! The BMS catalogue has not been confirmed against hardware and is tagged
//! [`Confidence::Provisional`] entry by entry.

use crate::register::{CodeEntry, CodeTable, Confidence};

const fn verified(code: u32, description: &'static str) -> CodeEntry {
    CodeEntry {
        code,
        description,
        confidence: Confidence::Verified,
    }
}

const fn provisional(code: u32, description: &'static str) -> CodeEntry {
    CodeEntry {
        code,
        description,
        confidence: Confidence::Provisional,
    }
}

pub static INVERTER_STATUS: CodeTable = CodeTable {
    name: "inverter_status",
    entries: &[
        verified(0x00, "Standby"),
        verified(0x01, "Fault"),
        verified(0x02, "Programming"),
        verified(0x04, "PV on-grid"),
        verified(0x08, "PV charging"),
        verified(0x0C, "PV charging on-grid"),
        verified(0x10, "Battery on-grid"),
        verified(0x11, "Bypass"),
        verified(0x14, "PV and battery on-grid"),
        verified(0x20, "AC charging"),
        verified(0x28, "PV and AC charging"),
        verified(0x40, "Battery off-grid"),
        verified(0x80, "PV off-grid"),
        verified(0x88, "PV charging off-grid"),
        verified(0xC0, "PV and battery off-grid"),
    ],
};

pub static INVERTER_FAULTS: CodeTable = CodeTable {
    name: "inverter_faults",
    entries: &[
        verified(0, "E000: Internal communication fault 1"),
        verified(1, "E001: Model fault"),
        verified(8, "E008: Parallel CAN communication lost"),
        verified(9, "E009: No master unit in parallel system"),
        verified(10, "E010: Multiple master units in parallel system"),
        verified(11, "E011: AC input inconsistent in parallel system"),
        verified(12, "E012: UPS output short circuit"),
        verified(13, "E013: Reverse current on UPS output"),
        verified(14, "E014: DC bus short circuit"),
        verified(15, "E015: Phase error in three-phase system"),
        verified(16, "E016: Relay check fault"),
        verified(17, "E017: Internal communication fault 2"),
        verified(18, "E018: Internal communication fault 3"),
        verified(19, "E019: DC bus voltage high"),
        verified(20, "E020: EPS connection fault"),
        verified(21, "E021: PV voltage high"),
        verified(22, "E022: Over-current protection"),
        verified(23, "E023: Neutral fault"),
        verified(24, "E024: PV short circuit"),
        verified(25, "E025: Radiator temperature out of range"),
        verified(26, "E026: Internal fault"),
        verified(27, "E027: Sample inconsistency between main and redundant CPU"),
        verified(31, "E031: Internal communication fault 4"),
    ],
};

pub static INVERTER_WARNINGS: CodeTable = CodeTable {
    name: "inverter_warnings",
    entries: &[
        verified(0, "W000: Battery communication failure"),
        verified(1, "W001: AFCI communication failure"),
        verified(2, "W002: AFCI arc detected"),
        verified(3, "W003: Meter communication failure"),
        verified(4, "W004: Battery forbids charge and discharge"),
        verified(5, "W005: Auto test failed"),
        verified(7, "W007: LCD communication failure"),
        verified(8, "W008: Firmware version mismatch"),
        verified(9, "W009: Fan stuck"),
        verified(11, "W011: Parallel unit count out of range"),
        verified(12, "W012: Battery reverse connection"),
        verified(13, "W013: Grid power outage"),
        verified(14, "W014: Grid voltage out of range"),
        verified(15, "W015: Grid frequency out of range"),
        verified(17, "W017: PV insulation low"),
        verified(18, "W018: Leakage current high"),
        verified(19, "W019: DC injection high"),
        verified(20, "W020: PV short circuit"),
        verified(22, "W022: Battery voltage high"),
        verified(23, "W023: Battery voltage low"),
        verified(24, "W024: Battery open circuit"),
        verified(25, "W025: EPS overload"),
        verified(26, "W026: EPS voltage high"),
        verified(27, "W027: Meter reversed"),
        verified(28, "W028: DC voltage high"),
    ],
};

pub static BMS_FAULTS: CodeTable = CodeTable {
    name: "bms_faults",
    entries: &[
        provisional(0x0000, "No fault"),
        provisional(0x0001, "Cell over-voltage"),
        provisional(0x0002, "Cell under-voltage"),
        provisional(0x0004, "Charge over-temperature"),
        provisional(0x0008, "Discharge over-temperature"),
        provisional(0x0010, "Charge over-current"),
        provisional(0x0020, "Discharge over-current"),
        provisional(0x0040, "Short circuit"),
        provisional(0x0080, "Charge under-temperature"),
        provisional(0x0100, "Discharge under-temperature"),
        provisional(0x0200, "Internal communication failure"),
        provisional(0x0400, "Cell imbalance"),
    ],
};

pub static BMS_WARNINGS: CodeTable = CodeTable {
    name: "bms_warnings",
    entries: &[
        provisional(0x0000, "No warning"),
        provisional(0x0001, "Cell voltage high"),
        provisional(0x0002, "Cell voltage low"),
        provisional(0x0004, "Charge temperature high"),
        provisional(0x0008, "Discharge temperature high"),
        provisional(0x0010, "Charge current high"),
        provisional(0x0020, "Discharge current high"),
        provisional(0x0040, "Module temperature low"),
        provisional(0x0080, "State of charge low"),
    ],
};
