// ============================================================================
// PARAMETER GROUPS - named registry for optimizer & scoped checkpointing
// ============================================================================

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::Rng;

use crate::tensor::{Graph, TID};

pub const EMBEDDINGS: &str = "embeddings";
pub const ENCODER: &str = "encoder";
pub const DECODER: &str = "decoder";

/// Scope name -> ordered `(parameter name, tape id)` pairs.
#[derive(Default)]
pub struct ParamStore {
    groups: BTreeMap<String, Vec<(String, TID)>>,
}

impl ParamStore {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, scope: &str, name: String, id: TID) {
        self.groups.entry(scope.to_string()).or_default().push((name, id));
    }

    /// Parameters of `scope`; empty when the scope was never built.
    pub fn scope(&self, scope: &str) -> &[(String, TID)] {
        self.groups.get(scope).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn all_ids(&self) -> Vec<TID> {
        self.groups.values().flat_map(|ps| ps.iter().map(|&(_, id)| id)).collect()
    }

    pub fn num_elements(&self, scope: &str, g: &Graph) -> usize {
        self.scope(scope).iter().map(|&(_, id)| g.data(id).len()).sum()
    }

    pub fn is_empty(&self) -> bool { self.groups.is_empty() }
}

/// Creates parameters on the tape and registers them under a scope and a `/`-joined name prefix.
pub struct ParamInit<'a> {
    g: &'a mut Graph,
    store: &'a mut ParamStore,
    rng: &'a mut StdRng,
    scope: &'static str,
    prefix: String,
}

impl<'a> ParamInit<'a> {
    pub fn new(g: &'a mut Graph, store: &'a mut ParamStore, rng: &'a mut StdRng, scope: &'static str) -> Self {
        ParamInit { g, store, rng, scope, prefix: String::new() }
    }

    pub fn child(&mut self, name: &str) -> ParamInit<'_> {
        let prefix = self.qualify(name);
        ParamInit {
            g: &mut *self.g,
            store: &mut *self.store,
            rng: &mut *self.rng,
            scope: self.scope,
            prefix,
        }
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() { name.to_string() } else { format!("{}/{}", self.prefix, name) }
    }

    fn add(&mut self, name: &str, data: Vec<f32>, rows: usize, cols: usize) -> TID {
        let id = self.g.param(data, rows, cols);
        let full = self.qualify(name);
        self.store.register(self.scope, full, id);
        id
    }

    pub fn normal(&mut self, name: &str, rows: usize, cols: usize, scale: f32) -> TID {
        let data = rand_normal(rows * cols, scale, self.rng);
        self.add(name, data, rows, cols)
    }

    pub fn full(&mut self, name: &str, rows: usize, cols: usize, value: f32) -> TID {
        self.add(name, vec![value; rows * cols], rows, cols)
    }

    pub fn zeros(&mut self, name: &str, rows: usize, cols: usize) -> TID {
        self.full(name, rows, cols, 0.0)
    }
}

/// Box-Muller normal samples with standard deviation `scale`.
pub fn rand_normal(n: usize, scale: f32, rng: &mut impl Rng) -> Vec<f32> {
    (0..n).map(|_| {
        let u1: f32 = rng.gen::<f32>().max(1e-10);
        let u2: f32 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos() * scale
    }).collect()
}

/// Inverted-dropout mask: each entry is `1/keep_prob` with probability `keep_prob`, else 0.
pub fn dropout_mask(n: usize, keep_prob: f32, rng: &mut impl Rng) -> Vec<f32> {
    let inv = 1.0 / keep_prob;
    (0..n).map(|_| if rng.gen::<f32>() < keep_prob { inv } else { 0.0 }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn registers_nested_names_per_scope() {
        let mut g = Graph::new();
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(7);
        {
            let mut init = ParamInit::new(&mut g, &mut store, &mut rng, ENCODER);
            let mut cell = init.child("cell");
            cell.normal("w_z", 3, 4, 0.1);
            cell.zeros("b_z", 1, 4);
            init.zeros("bias", 1, 2);
        }
        let names: Vec<&str> = store.scope(ENCODER).iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["cell/w_z", "cell/b_z", "bias"]);
        assert_eq!(store.num_elements(ENCODER, &g), 12 + 4 + 2);
        assert!(store.scope(DECODER).is_empty());
    }

    #[test]
    fn seeded_init_is_reproducible() {
        let a = rand_normal(16, 1.0, &mut StdRng::seed_from_u64(3));
        let b = rand_normal(16, 1.0, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
        assert!(a.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn dropout_mask_keeps_everything_at_keep_prob_one() {
        let mask = dropout_mask(32, 1.0, &mut StdRng::seed_from_u64(1));
        assert!(mask.iter().all(|&m| m == 1.0));
    }
}
