//! Catalog product referenced by a bundle slot

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use crate::domain::value_objects::{ProductId, VariantId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub title: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub options: Vec<ProductOption>,
    pub variants: Vec<Variant>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductOption { pub title: String, pub values: Vec<String> }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub title: String,
    #[serde(default)]
    pub sku: Option<String>,
    /// Unit price in minor currency units
    pub unit_price: i64,
    /// Option title -> chosen value, e.g. `{"Size": "M"}`
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Product {
    pub fn new(id: impl Into<ProductId>, title: impl Into<String>) -> Self {
        Self { id: id.into(), title: title.into(), handle: None, options: vec![], variants: vec![] }
    }

    pub fn with_variant(mut self, id: impl Into<VariantId>, title: impl Into<String>, unit_price: i64) -> Self {
        self.variants.push(Variant { id: id.into(), title: title.into(), sku: None, unit_price, options: BTreeMap::new() });
        self
    }

    pub fn variant(&self, id: &VariantId) -> Option<&Variant> { self.variants.iter().find(|v| &v.id == id) }
    pub fn has_variant(&self, id: &VariantId) -> bool { self.variant(id).is_some() }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_variant_lookup() {
        let p = Product::new("prod_1", "Tee").with_variant("var_s", "S", 2500).with_variant("var_m", "M", 2700);
        assert!(p.has_variant(&VariantId::from("var_m")));
        assert_eq!(p.variant(&VariantId::from("var_s")).map(|v| v.unit_price), Some(2500));
        assert!(!p.has_variant(&VariantId::from("var_xl")));
    }
}
