//! Transport-agnostic register access for solar inverters, battery banks and
//! grid-interconnect (MID) controllers.
//!
//! Callers ask for logical quantities ("PV1 voltage", "charge current limit")
//! by canonical name. The crate resolves them against the register map of the
//! device family, plans the register reads in chunks the transport accepts,
//! scales and decodes the raw words and returns unified records. The same API
//! works over the vendor cloud and over a local Modbus-TCP link.
//!
//! ## Layers
//!
//! - [`register`], [`codes`] and [`families`]: static, per-family register
//!   definitions.
//! - [`codec`]: scaling, signedness, word order and bitfields.
//! - [`planner`]: splitting reads and writes into transport-sized chunks.
//! - [`transport`], [`cloud`] and [`local`]: moving raw words.
//! - [`cache`], [`records`], [`device`] and [`assembler`]: the stateful side.
//!
//! ## Quick Start
//!
//! ```no_run
//! use inverter_link::{
//!     assembler::DeviceDataAssembler,
//!     cache::Cache,
//!     config::Config,
//!     local::LocalTransport,
//!     register::Category,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("invctl.yml")?;
//!     let local = config.local.as_ref().ok_or("no local link configured")?;
//!     let transport =
//!         LocalTransport::connect(local.address, local.timeout, local.timeout_retries).await?;
//!
//!     let assembler = DeviceDataAssembler::new(
//!         config.device_arena()?,
//!         Arc::new(transport),
//!         Cache::new(config.cache),
//!     );
//!     let id = assembler.devices().id_of("1234567890")?;
//!     let refresh = assembler.refresh(id, Category::Runtime).await?;
//!     if let Some(runtime) = refresh.record.as_runtime() {
//!         println!("PV power: {:?} W ({})", runtime.pv_power_total, refresh.freshness);
//!     }
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod cache;
pub mod cloud;
pub mod codec;
pub mod codes;
pub mod config;
pub mod device;
pub mod error;
pub mod families;
pub mod local;
pub mod planner;
pub mod records;
pub mod register;
pub mod register_map;
pub mod retry;
pub mod transport;

pub use error::{Error, Result};
