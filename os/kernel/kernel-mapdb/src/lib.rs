//! # Kernel Mapping Database
//!
//! Tracks, for every unit of mappable resource, which address spaces hold it
//! and from whom they got it, so that revoking a mapping also revokes
//! everything derived from it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    map_util                         │
//! │    • mem_map / io_map / obj_map                     │
//! │    • *_fpage_unmap, access-bit save-back            │
//! └───────────┬─────────────────────────┬───────────────┘
//!             │                         │
//! ┌───────────▼─────────────┐ ┌─────────▼───────────────┐
//! │  Mapdb (memory, I/O)    │ │  KobjectMapdb           │
//! │    • physframes + locks │ │    • per-object list    │
//! │    • size classes       │ │    • counted / weak     │
//! └───────────┬─────────────┘ └─────────────────────────┘
//!             │
//! ┌───────────▼─────────────────────────────────────────┐
//! │      MappingTree: pre-order slot arrays + submaps   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Page tables and capability tables are not implemented here; the crate
//! drives them through the [`PageSpace`] and [`CapSpace`] traits.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod fpage;
pub mod kobject;
pub mod map_util;
pub mod mapdb;
pub mod mapping;
pub mod page;
pub mod rights;
pub mod space;
pub mod sync;
pub mod tree;

pub use config::MapdbConfig;
pub use error::{ConfigError, InsertError, InsertStatus, MapError};
pub use fpage::{BufferDesc, Fpage, FpageType, MapControl};
pub use kobject::{Capability, EntryFlags, KobjectMapdb, KobjectMappable, NodeId, ObjFlush};
pub use mapdb::{FlushMask, Frame, MappingId, MappingInfo, Mapdb, Physframe};
pub use mapping::{Depth, Mapping};
pub use page::Pfn;
pub use rights::{Attribs, Caching, PageAttr, Rights};
pub use space::{CapSpace, MappingSpace, PageInfo, PageSpace, SpaceDirectory, SpaceId};
pub use sync::{FrameLock, FrameLockGuard};
pub use tree::MappingTree;
