//! # Conversion Data Model
//!
//! Plain DTOs shared by the builder, the persister, the resolver and every
//! storage backend.
//!
//! Design rule: no storage handles, no cache handles, no async here.
//! This module is pure data.

pub mod unit;
pub mod entity;
pub mod conversion;

pub use unit::Unit;
pub use entity::EntityRef;
pub use conversion::{
    ConversionEdge, ConversionId, ConversionMap, ConversionRequest,
    NewConversion, PrimaryConversion,
};
