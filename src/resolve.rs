//! # Conversion Resolver
//!
//! Resolution order for `quantity from → to`:
//!
//! 1. same code → quantity unchanged, nothing looked up
//! 2. both units standard and same type → `q × value(from) / value(to)`
//! 3. entity required from here on
//! 4. entity's conversion map (memo → cache → store)
//! 5. first active edge from `from`; hit `to` directly or bridge through a
//!    standard unit of `to`'s type
//!
//! Anything else is [`Error::ConversionNotFound`]. There is no silent
//! fallback to an approximate number.

use std::sync::Arc;

use crate::cache::RequestMemo;
use crate::expand::ExpansionSummary;
use crate::model::{ConversionMap, ConversionRequest, EntityRef, PrimaryConversion, Unit};
use crate::storage::StorageBackend;
use crate::{Error, Result, UnitConversion};

/// One logical operation against a [`UnitConversion`] handle.
///
/// Memoizes each entity's conversion map for its own lifetime. Create one per
/// request and drop it afterwards; never share it across requests.
pub struct Session<'c, B: StorageBackend> {
    uc: &'c UnitConversion<B>,
    memo: RequestMemo,
}

impl<'c, B: StorageBackend> Session<'c, B> {
    pub(crate) fn new(uc: &'c UnitConversion<B>) -> Self {
        Self {
            uc,
            memo: RequestMemo::default(),
        }
    }

    /// Resolve one conversion request.
    pub async fn convert(&self, request: &ConversionRequest) -> Result<f64> {
        let ConversionRequest { entity, quantity, from, to } = request;
        let quantity = *quantity;

        if from == to {
            return Ok(quantity);
        }

        let from_unit = self.unit(from).await?;
        let to_unit = self.unit(to).await?;

        if let Some(ratio) = from_unit.standard_ratio(&to_unit) {
            tracing::debug!(from = %from, to = %to, "standard conversion");
            return Ok(quantity * ratio);
        }

        let not_found = || Error::ConversionNotFound {
            from: from.clone(),
            to: to.clone(),
        };
        let entity = entity.as_ref().ok_or_else(not_found)?;

        let map = self.conversion_map(entity).await?;
        if let Some(factor) = map.get(from, to) {
            tracing::debug!(entity = %entity, from = %from, to = %to, "entity conversion");
            return Ok(quantity * factor);
        }

        // records written before expansion existed: one hop, then a standard bridge
        if let Some(edge) = self.uc.backend.find_active_conversion(entity, from, None).await? {
            let intermediate = quantity * edge.quantity;
            if edge.to == *to {
                return Ok(intermediate);
            }
            let via = self.unit(&edge.to).await?;
            if let Some(ratio) = via.standard_ratio(&to_unit) {
                tracing::debug!(entity = %entity, from = %from, via = %edge.to, to = %to, "bridged conversion");
                return Ok(intermediate * ratio);
            }
        }

        Err(not_found())
    }

    /// Active unit by code, through the unit cache.
    pub async fn unit(&self, code: &str) -> Result<Unit> {
        self.uc
            .cached_unit(code)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| Error::UnitNotFound(code.to_string()))
    }

    /// The entity's flattened active edges: memo, then cache, then store.
    pub async fn conversion_map(&self, entity: &EntityRef) -> Result<Arc<ConversionMap>> {
        if let Some(map) = self.memo.get(entity) {
            return Ok(map);
        }
        let backend = &self.uc.backend;
        let map = self
            .uc
            .cache
            .conversion_map(entity, || async move {
                let edges = backend.active_conversions(entity).await?;
                Ok::<_, Error>(ConversionMap::from_edges(&edges))
            })
            .await?;
        self.memo.insert(entity, map.clone());
        Ok(map)
    }

    /// Expand within this session; the memoized map for `entity` is dropped.
    pub async fn expand(
        &self,
        entity: &EntityRef,
        primaries: &[PrimaryConversion],
    ) -> Result<ExpansionSummary> {
        let summary = self.uc.expand(entity, primaries).await;
        self.memo.forget(entity);
        summary
    }

    /// Drop this session's memoized map for `entity`.
    pub fn forget(&self, entity: &EntityRef) {
        self.memo.forget(entity);
    }
}
