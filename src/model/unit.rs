//! Unit master data.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A unit definition from the catalog.
///
/// Standard units carry a positive `value` relative to the base unit of their
/// measurement type (`g` for mass, `L` for volume, ...). Two standard units
/// are convertible iff they share `unit_type`. Count-like units (`bag`,
/// `ctn`) have no value and only convert through entity rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub code: String,
    /// Measurement type tag: `mass`, `volume`, `length`, `count`, ...
    #[serde(rename = "type")]
    pub unit_type: String,
    pub value: Option<f64>,
    pub is_standard: bool,
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i16,
    /// Locale → display name.
    #[serde(default)]
    pub translations: HashMap<String, String>,
}

impl Unit {
    /// A non-standard, active unit with no conversion value.
    pub fn new(code: impl Into<String>, unit_type: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            unit_type: unit_type.into(),
            value: None,
            is_standard: false,
            is_active: true,
            sort_order: 0,
            translations: HashMap::new(),
        }
    }

    /// A standard, active unit worth `value` base units.
    pub fn standard(code: impl Into<String>, unit_type: impl Into<String>, value: f64) -> Self {
        Self {
            value: Some(value),
            is_standard: true,
            ..Self::new(code, unit_type)
        }
    }

    pub fn with_translation(mut self, locale: impl Into<String>, name: impl Into<String>) -> Self {
        self.translations.insert(locale.into(), name.into());
        self
    }

    pub fn with_sort_order(mut self, sort_order: i16) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// The value usable for standard ratios: `Some` only for standard units
    /// with a finite positive value.
    pub fn standard_value(&self) -> Option<f64> {
        if !self.is_standard {
            return None;
        }
        self.value.filter(|v| v.is_finite() && *v > 0.0)
    }

    /// Factor such that `1 self = factor other`, when both are standard
    /// units of the same measurement type.
    pub fn standard_ratio(&self, other: &Unit) -> Option<f64> {
        if self.unit_type != other.unit_type {
            return None;
        }
        Some(self.standard_value()? / other.standard_value()?)
    }

    /// Direct unit-to-unit conversion, outside any entity context.
    ///
    /// Fails fast when the types differ or either side is not standard.
    pub fn convert_to(&self, to: &Unit, quantity: f64) -> Result<f64> {
        if self.unit_type != to.unit_type {
            return Err(Error::UnitTypeMismatch {
                from: self.unit_type.clone(),
                to: to.unit_type.clone(),
            });
        }
        let ratio = self
            .standard_ratio(to)
            .ok_or_else(|| Error::NonStandardUnit(format!("{} -> {}", self.code, to.code)))?;
        Ok(quantity * ratio)
    }

    /// Display name for `locale`, then `fallback`, then the code itself.
    pub fn name<'a>(&'a self, locale: &str, fallback: &str) -> &'a str {
        self.translations
            .get(locale)
            .or_else(|| self.translations.get(fallback))
            .map(String::as_str)
            .unwrap_or(&self.code)
    }

    /// `"{code} {name}"`.
    pub fn label(&self, locale: &str, fallback: &str) -> String {
        format!("{} {}", self.code, self.name(locale, fallback))
    }
}
