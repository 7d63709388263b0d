//! Entity reference: the owner of a private set of conversion rules.

use serde::{Deserialize, Serialize};

/// Tagged pointer to an external domain entity (product, material, ...).
///
/// The core never dereferences it. It is only compared, hashed and turned
/// into storage/cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Type tag, e.g. `"product"`.
    pub kind: String,
    /// Identifier within `kind`.
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}
