use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque identity id, assigned by the identity store.
pub type IdentityId = i64;

/// Attribute key holding a generated unique id.
pub const ATTR_UUID: &str = "uuid";
/// Attribute key holding the full display name.
pub const ATTR_FULL_NAME: &str = "fullName";
/// Attribute key holding the short name.
pub const ATTR_NAME: &str = "name";

/// A person (or any tagged entity) that embeddings are trained against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub attributes: BTreeMap<String, String>,
}

impl Identity {
    pub fn new(id: IdentityId, attributes: BTreeMap<String, String>) -> Self {
        Self { id, attributes }
    }

    /// Value of a single attribute, if set.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Best human-readable label: full name, then name, then the numeric id.
    pub fn display_name(&self) -> String {
        self.attribute(ATTR_FULL_NAME)
            .or_else(|| self.attribute(ATTR_NAME))
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

/// Face embedding vector. The dimension is fixed per classifier instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Whether every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Squared Euclidean distance. Callers must compare equal-length vectors.
    pub fn squared_distance(&self, other: &Embedding) -> f32 {
        squared_distance(&self.values, &other.values)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Squared Euclidean distance between two equal-length slices.
#[inline]
pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squared_distance_identical() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        assert_eq!(a.squared_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_squared_distance_axis() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.squared_distance(&b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_from_vec() {
        let e: Embedding = vec![0.5, -1.0].into();
        assert_eq!(e.dim(), 2);
    }

    #[test]
    fn test_is_finite() {
        assert!(Embedding::new(vec![0.0, -3.5]).is_finite());
        assert!(!Embedding::new(vec![0.0, f32::NAN]).is_finite());
        assert!(!Embedding::new(vec![f32::NEG_INFINITY]).is_finite());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut ident = Identity::new(7, BTreeMap::new());
        assert_eq!(ident.display_name(), "#7");
        ident.set_attribute(ATTR_NAME, "ada");
        assert_eq!(ident.display_name(), "ada");
        ident.set_attribute(ATTR_FULL_NAME, "Ada Lovelace");
        assert_eq!(ident.display_name(), "Ada Lovelace");
    }
}
