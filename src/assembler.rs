//! Device data assembler.
//!
//! Turns "category X of device D" into a unified record: cache lookup, chunk
//! planning (or a fixed record endpoint), reads, decoding and merging. Writes
//! go through the same register maps and invalidate the cached parameters of
//! the device they touched.

use crate::{
    cache::Cache,
    codec::{self, PhysicalValue},
    device::{Device, DeviceArena, DeviceId},
    error::{Error, PlanError, Result},
    planner::{self, Chunk},
    records::{FieldValues, UnifiedRecord},
    register::{BitField, BitMeaning, Category, RegisterDefinition, RegisterKind},
    register_map::{CatalogEntry, RegisterMap},
    transport::{DeviceAddress, RawRegisterBlock, RecordPayload, Transport},
};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

/// Where a returned record comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "freshness", content = "error")]
pub enum Freshness {
    /// Fetched by this call.
    Fresh,
    /// Served from the cache within its TTL.
    Cached,
    /// The refresh failed; this is the last known good record.
    Stale(String),
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freshness::Fresh => f.write_str("fresh"),
            Freshness::Cached => f.write_str("cached"),
            Freshness::Stale(error) => write!(f, "stale ({error})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Refresh {
    pub record: Arc<UnifiedRecord>,
    pub freshness: Freshness,
}

/// Name under which a packed sub-field is reported.
///
/// Flags, enums and values with a cloud name are device-wide names; other
/// packed values are qualified with their register name.
pub fn sub_field_key(def: &RegisterDefinition, field: &BitField) -> String {
    match field.meaning {
        BitMeaning::Value {
            name,
            cloud_field: None,
        } => format!("{}_{name}", def.canonical_name),
        _ => field.name().to_string(),
    }
}

/// Adds the decoded value of `def` to `fields`, flattening bit layouts.
fn insert_decoded(def: &RegisterDefinition, raw: i64, fields: &mut FieldValues) {
    match def.bit_layout() {
        Some(layout) => {
            let values = codec::decode_sub_fields(raw as u32, layout);
            for (field, (_, value)) in layout.iter().zip(values) {
                fields.insert(sub_field_key(def, field), value);
            }
        }
        None => {
            fields.insert(def.canonical_name.clone(), codec::decode(raw, def));
        }
    }
}

/// Decodes every definition whose registers are all present in `words`.
pub fn decode_fields<'a>(
    map: &RegisterMap,
    definitions: impl Iterator<Item = &'a RegisterDefinition>,
    words: &HashMap<(RegisterKind, u16), u16>,
) -> FieldValues {
    let mut fields = FieldValues::new();
    for def in definitions {
        let Some(content) = def
            .addresses()
            .map(|address| words.get(&(def.kind, address)).copied())
            .collect::<Option<Vec<u16>>>()
        else {
            log::debug!("`{}` was not read, omitted", def.canonical_name);
            continue;
        };
        match codec::raw_from_words(&content, def, map.word_order()) {
            Ok(raw) => insert_decoded(def, raw, &mut fields),
            Err(err) => log::warn!("`{}` omitted: {err}", def.canonical_name),
        }
    }
    fields
}

/// Raw integer carried by a JSON value of a record endpoint.
fn json_raw(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.round() as i64)),
        Value::String(text) => text.trim().parse().ok(),
        Value::Bool(on) => Some(i64::from(*on)),
        _ => None,
    }
}

/// Maps a fixed-endpoint payload onto canonical names.
///
/// Values are raw register integers and go through the same codec as local
/// reads. Fields missing from the payload are omitted.
pub fn fields_from_payload(
    map: &RegisterMap,
    category: Category,
    payload: &RecordPayload,
) -> FieldValues {
    let mut fields = FieldValues::new();
    for def in map.category(category) {
        for field in def.bit_layout().unwrap_or_default() {
            if let BitMeaning::Value {
                cloud_field: Some(key),
                ..
            } = field.meaning
            {
                if let Some(raw) = payload.get(key).and_then(json_raw) {
                    fields.insert(sub_field_key(def, field), PhysicalValue::Number(raw as f64));
                }
            }
        }
        let Some(value) = def.cloud_field.and_then(|key| payload.get(key)) else {
            continue;
        };
        match (json_raw(value), value) {
            (Some(raw), _) => insert_decoded(def, raw, &mut fields),
            (None, Value::String(text)) => {
                fields.insert(def.canonical_name.clone(), PhysicalValue::Code(text.clone()));
            }
            (None, other) => log::debug!("`{}`: unusable value {other}", def.canonical_name),
        }
    }
    fields
}

/// Combines devices, one transport and the record cache.
#[derive(Debug)]
pub struct DeviceDataAssembler {
    devices: DeviceArena,
    transport: Arc<dyn Transport>,
    cache: Cache,
    clock: fn() -> DateTime<Local>,
}

impl DeviceDataAssembler {
    /// Serves `devices` over `transport`, keeping records in `cache`.
    pub fn new(devices: DeviceArena, transport: Arc<dyn Transport>, cache: Cache) -> Self {
        Self {
            devices,
            transport,
            cache,
            clock: Local::now,
        }
    }

    /// Replaces the wall clock that drives the hourly cache purge.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Local>) -> Self {
        self.clock = clock;
        self
    }

    /// The registered devices.
    pub fn devices(&self) -> &DeviceArena {
        &self.devices
    }

    /// The shared transport, e.g. for raw range reads.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Read-only register listing of one device.
    pub fn catalog(&self, id: DeviceId) -> Result<Vec<CatalogEntry<'static>>> {
        Ok(self.devices.get(id)?.map.catalog().collect())
    }

    /// Returns the record of `category` for `id`.
    ///
    /// A fresh cache entry is returned without touching the transport. On
    /// failure the last known record is returned as [`Freshness::Stale`] if
    /// there is one. A record whose slot was invalidated while it was being
    /// fetched is returned but not cached.
    pub async fn refresh(&self, id: DeviceId, category: Category) -> Result<Refresh> {
        let device = self.devices.get(id)?;
        self.cache.roll_hour((self.clock)());
        if let Some(record) = self.cache.fresh(id, category) {
            log::debug!("{}: {category} served from cache", device.serial());
            return Ok(Refresh {
                record,
                freshness: Freshness::Cached,
            });
        }

        let generation = self.cache.generation(id, category);
        match self.fetch(device, category).await {
            Ok(record) => {
                let record = Arc::new(record);
                self.cache.store_if_current(id, category, generation, record.clone());
                Ok(Refresh {
                    record,
                    freshness: Freshness::Fresh,
                })
            }
            Err(err) => match self.cache.last_known(id, category) {
                Some(record) => {
                    log::warn!(
                        "{}: {category} refresh failed, serving stale record: {err}",
                        device.serial()
                    );
                    Ok(Refresh {
                        record,
                        freshness: Freshness::Stale(err.to_string()),
                    })
                }
                None => Err(err),
            },
        }
    }

    /// Refreshes `category` on every device at once.
    pub async fn refresh_all(&self, category: Category) -> Vec<(DeviceId, Result<Refresh>)> {
        let refreshes = self.devices.iter().map(|device| async move {
            (device.id, self.refresh(device.id, category).await)
        });
        futures::future::join_all(refreshes).await
    }

    async fn fetch(&self, device: &Device, category: Category) -> Result<UnifiedRecord> {
        let capabilities = self.transport.capabilities();
        let fields = if capabilities.record_endpoints && category != Category::Parameters {
            let payload = self.transport.fetch_record(&device.address, category).await?;
            fields_from_payload(device.map, category, &payload)
        } else {
            self.read_fields(device, category).await?
        };
        Ok(UnifiedRecord::assemble(category, fields, Utc::now()))
    }

    async fn read_fields(&self, device: &Device, category: Category) -> Result<FieldValues> {
        let capabilities = self.transport.capabilities();
        let names: Vec<&str> = device
            .map
            .category(category)
            .map(RegisterDefinition::name)
            .collect();
        let chunks = planner::plan(&names, device.map, capabilities.max_chunk_size)?;
        log::debug!(
            "{}: {category} needs {} field(s) in {} chunk(s)",
            device.serial(),
            names.len(),
            chunks.len()
        );

        let mut words = HashMap::new();
        for result in self.read_chunks(&device.address, chunks).await {
            match result {
                Ok(block) => {
                    let kind = block.chunk().kind;
                    words.extend(block.iter().map(|(address, word)| ((kind, address), word)));
                }
                // registers a model does not implement; their fields are omitted
                Err(Error::ModbusException(message)) => {
                    log::warn!("{}: {message}, skipping chunk", device.serial());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(decode_fields(device.map, device.map.category(category), &words))
    }

    /// Concurrent when the transport allows it, strictly sequential otherwise.
    async fn read_chunks(
        &self,
        device: &DeviceAddress,
        chunks: Vec<Chunk>,
    ) -> Vec<Result<RawRegisterBlock>> {
        if self.transport.capabilities().concurrent_reads {
            let reads = chunks.into_iter().map(|chunk| self.transport.read_chunk(device, chunk));
            return futures::future::join_all(reads).await;
        }
        let mut results = Vec::new();
        for chunk in chunks {
            let result = self.transport.read_chunk(device, chunk).await;
            let fatal = matches!(&result, Err(err) if !matches!(err, Error::ModbusException(_)));
            results.push(result);
            if fatal {
                break;
            }
        }
        results
    }

    fn writable<'m>(&self, device: &'m Device, name: &str) -> Result<&'m RegisterDefinition> {
        let def = device.map.get(name).ok_or_else(|| Error::UnsupportedField {
            field: name.to_string(),
            family: device.family.to_string(),
        })?;
        if !def.writable || def.kind != RegisterKind::Holding {
            return Err(Error::Unsupported("writes to read-only registers"));
        }
        Ok(def)
    }

    /// Encodes and writes parameters by canonical name.
    ///
    /// Every value is encoded before anything is sent; only the registers
    /// being written are touched. The device's cached parameters are
    /// invalidated once at least one chunk has been written.
    pub async fn write_parameters(
        &self,
        id: DeviceId,
        values: &[(&str, PhysicalValue)],
    ) -> Result<()> {
        let device = self.devices.get(id)?;
        let capabilities = self.transport.capabilities();
        if !capabilities.supports_write {
            return Err(Error::Unsupported("writes on this transport"));
        }

        let mut words = BTreeMap::new();
        for (name, value) in values {
            let def = self.writable(device, name)?;
            let raw = codec::encode(value, def)?;
            let split = codec::words_from_raw(raw, def, device.map.word_order());
            for (address, word) in def.addresses().zip(split) {
                if words.insert(address, word).is_some() {
                    return Err(PlanError::DuplicateAddress(address).into());
                }
            }
        }
        let addresses: Vec<u16> = words.keys().copied().collect();
        let chunks =
            planner::plan_writes(RegisterKind::Holding, &addresses, capabilities.max_chunk_size)?;
        self.write_chunks(device, chunks, &words).await
    }

    /// Encodes and writes a single parameter by canonical name.
    pub async fn write_parameter(
        &self,
        id: DeviceId,
        name: &str,
        value: PhysicalValue,
    ) -> Result<()> {
        self.write_parameters(id, &[(name, value)]).await
    }

    async fn write_chunks(
        &self,
        device: &Device,
        chunks: Vec<Chunk>,
        words: &BTreeMap<u16, u16>,
    ) -> Result<()> {
        let mut written = 0;
        let mut outcome = Ok(());
        for chunk in chunks {
            let values: Vec<u16> = chunk
                .addresses()
                .filter_map(|address| words.get(&address).copied())
                .collect();
            log::debug!("{}: writing {chunk}", device.serial());
            if let Err(err) = self.transport.write_chunk(&device.address, chunk, &values).await {
                outcome = Err(err);
                break;
            }
            written += 1;
        }
        if written > 0 {
            self.cache.invalidate(device.id, Category::Parameters);
        }
        outcome
    }

    /// Read-modify-write of one packed field of a holding register.
    pub async fn set_bit_field(&self, id: DeviceId, field: &str, value: u32) -> Result<()> {
        let device = self.devices.get(id)?;
        let def = device
            .map
            .iter()
            .find(|def| {
                def.bit_layout()
                    .is_some_and(|layout| layout.iter().any(|f| f.name() == field))
            })
            .ok_or_else(|| Error::UnsupportedField {
                field: field.to_string(),
                family: device.family.to_string(),
            })?;
        let def = self.writable(device, &def.canonical_name)?;

        let chunk = Chunk::new(def.kind, def.address, def.registers());
        let block = self.transport.read_chunk(&device.address, chunk).await?;
        let current = codec::raw_from_words(block.words(), def, device.map.word_order())?;
        let updated = codec::with_bit_field(current, def, field, value)?;
        if updated == current {
            log::debug!("{}: `{field}` already {value}", device.serial());
            return Ok(());
        }
        let words: BTreeMap<u16, u16> = def
            .addresses()
            .zip(codec::words_from_raw(updated, def, device.map.word_order()))
            .collect();
        self.write_chunks(device, vec![chunk], &words).await
    }

    /// Switches one function flag (e.g. `ac_charge_en`) on or off.
    pub async fn set_flag(&self, id: DeviceId, flag: &str, on: bool) -> Result<()> {
        self.set_bit_field(id, flag, u32::from(on)).await
    }
}
