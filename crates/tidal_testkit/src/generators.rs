//! Property-based test generators using proptest.
//!
//! Mutation scripts are generated valid: an entity is only updated or
//! deleted while it exists, and only created while it does not.

use crate::fixtures::{product, Product};
use proptest::prelude::*;
use std::collections::BTreeMap;
use tidal_core::OpKind;

/// One local mutation of a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Kind of mutation.
    pub kind: OpKind,
    /// Product id.
    pub id: String,
    /// New value; `None` for deletes.
    pub payload: Option<Product>,
}

/// Strategy for generating products.
pub fn product_strategy() -> impl Strategy<Value = Product> {
    (
        prop::string::string_regex("[A-Z][a-z]{0,8}").expect("Invalid regex"),
        0u32..100_000,
    )
        .prop_map(|(name, price)| product(&name, price))
}

/// Strategy for generating one of `count` product ids (`p0`, `p1`, ...).
pub fn entity_id_strategy(count: usize) -> impl Strategy<Value = String> {
    (0..count.max(1)).prop_map(|i| format!("p{i}"))
}

/// Strategy for generating valid mutation scripts over `entities`
/// products, up to `max_len` steps long.
pub fn mutation_script_strategy(
    entities: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<Mutation>> {
    prop::collection::vec(
        (entity_id_strategy(entities), 0u8..4, product_strategy()),
        1..max_len.max(2),
    )
    .prop_map(|steps| {
        let mut exists: BTreeMap<String, bool> = BTreeMap::new();
        steps
            .into_iter()
            .map(|(id, choice, payload)| {
                let present = exists.entry(id.clone()).or_insert(false);
                let kind = match (*present, choice) {
                    (false, _) => OpKind::Create,
                    (true, 0) => OpKind::Delete,
                    (true, _) => OpKind::Update,
                };
                *present = kind != OpKind::Delete;
                Mutation {
                    kind,
                    payload: (kind != OpKind::Delete).then_some(payload),
                    id,
                }
            })
            .collect()
    })
}

/// Applies a mutation script directly, returning the final state it
/// describes.
pub fn apply_script(script: &[Mutation]) -> BTreeMap<String, Product> {
    let mut state = BTreeMap::new();
    for mutation in script {
        match (&mutation.kind, &mutation.payload) {
            (OpKind::Delete, _) | (_, None) => {
                state.remove(&mutation.id);
            }
            (_, Some(payload)) => {
                state.insert(mutation.id.clone(), payload.clone());
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn scripts_are_valid(script in mutation_script_strategy(3, 20)) {
            let mut exists = BTreeMap::new();
            for mutation in &script {
                let present = exists.entry(mutation.id.clone()).or_insert(false);
                match mutation.kind {
                    OpKind::Create => prop_assert!(!*present),
                    OpKind::Update | OpKind::Delete => prop_assert!(*present),
                }
                prop_assert_eq!(mutation.payload.is_none(), mutation.kind == OpKind::Delete);
                *present = mutation.kind != OpKind::Delete;
            }
        }
    }

    #[test]
    fn apply_script_follows_order() {
        let script = vec![
            Mutation {
                kind: OpKind::Create,
                id: "p0".into(),
                payload: Some(product("Tea", 1)),
            },
            Mutation {
                kind: OpKind::Update,
                id: "p0".into(),
                payload: Some(product("Tea", 2)),
            },
        ];
        assert_eq!(apply_script(&script)["p0"].price, 2);
    }
}
