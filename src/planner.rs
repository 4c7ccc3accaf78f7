//! Batch planner: turns requested fields or address ranges into transport-legal
//! chunks.
//!
//! Output is deterministic. Chunks are grouped per register table (input
//! before holding) and sorted by ascending start address; concatenated they
//! cover exactly the requested addresses, each address once.

use crate::{
    error::PlanError,
    register::RegisterKind,
    register_map::RegisterMap,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// A contiguous address range that fits one transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Chunk {
    pub kind: RegisterKind,
    pub start_address: u16,
    pub count: u16,
}

impl Chunk {
    pub const fn new(kind: RegisterKind, start_address: u16, count: u16) -> Self {
        Self {
            kind,
            start_address,
            count,
        }
    }

    /// Every address the chunk covers.
    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        let start = u32::from(self.start_address);
        (start..start + u32::from(self.count)).map(|address| address as u16)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}+{}", self.kind, self.start_address, self.count)
    }
}

/// Plans the reads needed to fetch `fields` from a device using `map`.
///
/// Unknown and duplicated field names fail fast. Fields whose registers touch
/// or overlap are merged into one run; runs longer than `max_chunk` are split
/// into chunks of exactly `max_chunk` registers plus a remainder.
pub fn plan<S: AsRef<str>>(
    fields: &[S],
    map: &RegisterMap,
    max_chunk: u16,
) -> Result<Vec<Chunk>, PlanError> {
    if max_chunk == 0 {
        return Err(PlanError::ZeroChunkSize);
    }
    let mut seen = HashSet::with_capacity(fields.len());
    let mut addresses: BTreeMap<RegisterKind, BTreeSet<u16>> = BTreeMap::new();
    for field in fields {
        let field = field.as_ref();
        let def = map
            .get(field)
            .ok_or_else(|| PlanError::UnknownField(field.to_string()))?;
        if !seen.insert(field) {
            return Err(PlanError::DuplicateField(field.to_string()));
        }
        addresses.entry(def.kind).or_default().extend(def.addresses());
    }
    Ok(addresses
        .into_iter()
        .flat_map(|(kind, set)| split_runs(kind, set, max_chunk))
        .collect())
}

/// Plans a plain `start..start + count` range of one register table.
pub fn plan_range(
    kind: RegisterKind,
    start: u16,
    count: u32,
    max_chunk: u16,
) -> Result<Vec<Chunk>, PlanError> {
    if max_chunk == 0 {
        return Err(PlanError::ZeroChunkSize);
    }
    if u32::from(start) + count > u32::from(u16::MAX) + 1 {
        return Err(PlanError::AddressOverflow { start, count });
    }
    let mut chunks = Vec::new();
    let mut next = u32::from(start);
    let end = u32::from(start) + count;
    while next < end {
        let size = (end - next).min(u32::from(max_chunk));
        chunks.push(Chunk::new(kind, next as u16, size as u16));
        next += size;
    }
    Ok(chunks)
}

/// Groups exactly the addresses being written into minimal contiguous chunks.
///
/// Addresses between two written ones are never included, so unrelated
/// registers are not rewritten. Writing the same address twice is an error.
pub fn plan_writes(
    kind: RegisterKind,
    addresses: &[u16],
    max_chunk: u16,
) -> Result<Vec<Chunk>, PlanError> {
    if max_chunk == 0 {
        return Err(PlanError::ZeroChunkSize);
    }
    let mut set = BTreeSet::new();
    for address in addresses {
        if !set.insert(*address) {
            return Err(PlanError::DuplicateAddress(*address));
        }
    }
    Ok(split_runs(kind, set, max_chunk))
}

fn split_runs(kind: RegisterKind, addresses: BTreeSet<u16>, max_chunk: u16) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current: Option<Chunk> = None;
    for address in addresses {
        match current.as_mut() {
            Some(chunk)
                if u32::from(chunk.start_address) + u32::from(chunk.count) == u32::from(address)
                    && chunk.count < max_chunk =>
            {
                chunk.count += 1;
            }
            _ => {
                if let Some(done) = current.replace(Chunk::new(kind, address, 1)) {
                    chunks.push(done);
                }
            }
        }
    }
    chunks.extend(current);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        families::register_map,
        register::{Category, RegisterDefinition, WordOrder},
        register_map::DeviceFamily,
    };
    use assert_matches::assert_matches;

    fn sizes(chunks: &[Chunk]) -> Vec<u16> {
        chunks.iter().map(|chunk| chunk.count).collect()
    }

    fn covered(chunks: &[Chunk]) -> Vec<u16> {
        chunks.iter().flat_map(Chunk::addresses).collect()
    }

    #[test]
    fn cloud_ceiling_splits_367_registers_in_three() {
        let chunks = plan_range(RegisterKind::Holding, 0, 367, 127).unwrap();
        assert_eq!(sizes(&chunks), vec![127, 127, 113]);
        assert_eq!(chunks[1].start_address, 127);
        assert_eq!(chunks[2].start_address, 254);
    }

    #[test]
    fn local_ceiling_splits_367_registers_in_ten() {
        let chunks = plan_range(RegisterKind::Input, 0, 367, 40).unwrap();
        assert_eq!(chunks.len(), 10);
        assert!(chunks[..9].iter().all(|chunk| chunk.count == 40));
        assert_eq!(chunks[9].count, 7);
    }

    #[test]
    fn range_chunks_cover_without_gap_or_overlap() {
        for max_chunk in [1u16, 126, 127, 128] {
            for count in [0u32, 1, 367] {
                let chunks = plan_range(RegisterKind::Input, 10, count, max_chunk).unwrap();
                let expected: Vec<u16> = (10..10 + count as u16).collect();
                assert_eq!(covered(&chunks), expected, "max {max_chunk} count {count}");
                assert!(chunks.iter().all(|chunk| chunk.count <= max_chunk));
            }
        }
    }

    #[test]
    fn range_past_address_space_is_rejected() {
        assert_matches!(
            plan_range(RegisterKind::Input, 0xFFF0, 17, 40),
            Err(PlanError::AddressOverflow { .. })
        );
        assert_eq!(plan_range(RegisterKind::Input, 0xFFF0, 16, 40).unwrap().len(), 1);
    }

    #[test]
    fn fields_merge_into_contiguous_runs() {
        let map = RegisterMap::new(
            DeviceFamily::PvSeries,
            WordOrder::LowFirst,
            vec![
                RegisterDefinition::input("a", 1, Category::Runtime),
                RegisterDefinition::input("b", 2, Category::Runtime).double(),
                RegisterDefinition::input("c", 10, Category::Runtime),
                RegisterDefinition::holding("limit", 2),
            ],
        )
        .unwrap();
        let chunks = plan(&["c", "limit", "b", "a"], &map, 127).unwrap();
        assert_eq!(
            chunks,
            vec![
                Chunk::new(RegisterKind::Input, 1, 3),
                Chunk::new(RegisterKind::Input, 10, 1),
                Chunk::new(RegisterKind::Holding, 2, 1),
            ]
        );
    }

    #[test]
    fn field_plans_respect_every_chunk_size() {
        let map = register_map(DeviceFamily::PvSeries);
        let fields: Vec<&str> = map.category(Category::Parameters).map(|d| d.name()).collect();
        let mut expected: Vec<u16> = map
            .category(Category::Parameters)
            .flat_map(|def| def.addresses())
            .collect();
        expected.sort_unstable();
        for max_chunk in [1u16, 39, 40, 41, 127] {
            let chunks = plan(&fields, map, max_chunk).unwrap();
            assert_eq!(covered(&chunks), expected);
            assert!(chunks.iter().all(|chunk| chunk.count <= max_chunk));
            assert!(chunks.windows(2).all(|w| w[0].start_address < w[1].start_address));
        }
        assert!(plan::<&str>(&[], map, 40).unwrap().is_empty());
        assert_eq!(plan(&["pv1_voltage"], map, 40).unwrap().len(), 1);
    }

    #[test]
    fn invalid_field_requests_fail_fast() {
        let map = register_map(DeviceFamily::PvSeries);
        assert_eq!(
            plan(&["pv1_voltage", "nonsense"], map, 40),
            Err(PlanError::UnknownField("nonsense".into()))
        );
        assert_eq!(
            plan(&["pv1_voltage", "pv1_voltage"], map, 40),
            Err(PlanError::DuplicateField("pv1_voltage".into()))
        );
        assert_eq!(plan(&["pv1_voltage"], map, 0), Err(PlanError::ZeroChunkSize));
    }

    #[test]
    fn writes_only_touch_written_addresses() {
        let chunks = plan_writes(RegisterKind::Holding, &[66, 64, 65, 99, 101], 40).unwrap();
        assert_eq!(
            chunks,
            vec![
                Chunk::new(RegisterKind::Holding, 64, 3),
                Chunk::new(RegisterKind::Holding, 99, 1),
                Chunk::new(RegisterKind::Holding, 101, 1),
            ]
        );
        assert_eq!(
            plan_writes(RegisterKind::Holding, &[5, 5], 40),
            Err(PlanError::DuplicateAddress(5))
        );
    }
}
