//! Flat parameter registry with per-parameter trainable flags
//!
//! Names follow `{prefix}_{kind}` (`conv1_weight`, `fc6_0_bias`), with a
//! `bn_` infix for parameters owned by normalization layers. The registry
//! does not own tensors; each entry records where its tensor lives so the
//! network can resolve it.

use crate::error::{NetworkError, Result};
use crate::layers::{ParamKind, Sequential};
use crate::network::Stage;
use std::collections::HashMap;
use tracing::debug;

/// Which part of the network owns a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Backbone(Stage),
    Branch(usize),
}

impl Owner {
    #[must_use]
    pub fn prefix(&self) -> String {
        match self {
            Owner::Backbone(stage) => stage.name().to_string(),
            Owner::Branch(index) => format!("fc6_{index}"),
        }
    }
}

/// Address of a tensor inside the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSlot {
    pub owner: Owner,
    pub module: usize,
    pub kind: ParamKind,
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub name: String,
    pub slot: ParamSlot,
    pub shape: Vec<usize>,
    pub trainable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl ParameterRegistry {
    /// Walk the given groups in order; every parameter starts trainable
    pub fn build<'a, I>(groups: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Owner, &'a Sequential)>,
    {
        let mut registry = Self::default();
        for (owner, layers) in groups {
            let prefix = owner.prefix();
            for (module, kind, var) in layers.named_parameters() {
                let normalization = layers
                    .module(module)
                    .is_some_and(|m| m.is_normalization());
                let name = if normalization {
                    format!("{prefix}_bn_{}", kind.as_str())
                } else {
                    format!("{prefix}_{}", kind.as_str())
                };
                registry.insert(RegistryEntry {
                    name,
                    slot: ParamSlot { owner, module, kind },
                    shape: var.dims().to_vec(),
                    trainable: true,
                })?;
            }
        }
        debug!("Built parameter registry with {} entries", registry.len());
        Ok(registry)
    }

    fn insert(&mut self, entry: RegistryEntry) -> Result<()> {
        if self.index.contains_key(&entry.name) {
            return Err(NetworkError::DuplicateName(entry.name));
        }
        self.index.insert(entry.name.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Mark parameters trainable iff their name starts with one of `prefixes`
    pub fn select<S: AsRef<str>>(&mut self, prefixes: &[S]) {
        for entry in &mut self.entries {
            entry.trainable = prefixes
                .iter()
                .any(|prefix| entry.name.starts_with(prefix.as_ref()));
        }
        debug!(
            "Selected {} of {} parameters as trainable",
            self.entries.iter().filter(|e| e.trainable).count(),
            self.entries.len()
        );
    }

    /// Trainable entries in insertion order
    pub fn trainable(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter().filter(|entry| entry.trainable)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Copy trainable flags from `previous` for names present in both
    pub(crate) fn inherit_flags(&mut self, previous: &ParameterRegistry) {
        for entry in &mut self.entries {
            if let Some(old) = previous.get(&entry.name) {
                entry.trainable = old.trainable;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{BatchNorm2d, Conv2d, Dropout, Linear, LocalResponseNorm, Module};
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn head(rng: &mut StdRng) -> Sequential {
        Sequential::new(vec![
            Module::Dropout(Dropout::new(0.5)),
            Module::Linear(Linear::new(8, 2, rng, &Device::Cpu).unwrap()),
        ])
    }

    #[test]
    fn test_build_names_and_order() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Sequential::new(vec![
            Module::Conv(Conv2d::new(3, 4, 3, 1, &mut rng, &Device::Cpu).unwrap()),
            Module::Relu,
            Module::Lrn(LocalResponseNorm),
        ]);
        let branch0 = head(&mut rng);
        let branch1 = head(&mut rng);

        let registry = ParameterRegistry::build([
            (Owner::Backbone(Stage::Conv1), &conv),
            (Owner::Branch(0), &branch0),
            (Owner::Branch(1), &branch1),
        ])
        .unwrap();

        let names: Vec<_> = registry.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "conv1_weight",
                "conv1_bias",
                "fc6_0_weight",
                "fc6_0_bias",
                "fc6_1_weight",
                "fc6_1_bias"
            ]
        );
        assert_eq!(registry.get("fc6_1_weight").unwrap().shape, vec![2, 8]);
        assert_eq!(registry.get("fc6_1_weight").unwrap().slot.module, 1);
    }

    #[test]
    fn test_batch_norm_gets_bn_infix() {
        let mut rng = StdRng::seed_from_u64(0);
        let stage = Sequential::new(vec![
            Module::Conv(Conv2d::new(3, 4, 3, 1, &mut rng, &Device::Cpu).unwrap()),
            Module::BatchNorm(BatchNorm2d::new(4, &Device::Cpu).unwrap()),
            Module::Relu,
            Module::Lrn(LocalResponseNorm),
        ]);
        let registry = ParameterRegistry::build([(Owner::Backbone(Stage::Conv1), &stage)]).unwrap();

        let names: Vec<_> = registry.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["conv1_weight", "conv1_bias", "conv1_bn_weight", "conv1_bn_bias"]
        );
        let norm = registry.get("conv1_bn_weight").unwrap();
        assert_eq!(norm.shape, vec![4]);
        assert_eq!(norm.slot.module, 1);
    }

    #[test]
    fn test_duplicate_name_is_construction_error() {
        let mut rng = StdRng::seed_from_u64(0);
        let branch = head(&mut rng);
        let err = ParameterRegistry::build([(Owner::Branch(0), &branch), (Owner::Branch(0), &branch)])
            .unwrap_err();
        assert!(matches!(err, NetworkError::DuplicateName(ref name) if name == "fc6_0_weight"));
        assert_eq!(err.kind(), crate::ErrorKind::Construction);
    }

    #[test]
    fn test_two_convs_in_one_stage_collide() {
        let mut rng = StdRng::seed_from_u64(0);
        let stage = Sequential::new(vec![
            Module::Conv(Conv2d::new(3, 4, 3, 1, &mut rng, &Device::Cpu).unwrap()),
            Module::Conv(Conv2d::new(4, 4, 3, 1, &mut rng, &Device::Cpu).unwrap()),
        ]);
        let err = ParameterRegistry::build([(Owner::Backbone(Stage::Conv2), &stage)]).unwrap_err();
        assert!(matches!(err, NetworkError::DuplicateName(ref name) if name == "conv2_weight"));
    }

    #[test]
    fn test_select_prefixes() {
        let mut rng = StdRng::seed_from_u64(0);
        let branch0 = head(&mut rng);
        let branch1 = head(&mut rng);
        let mut registry =
            ParameterRegistry::build([(Owner::Branch(0), &branch0), (Owner::Branch(1), &branch1)])
                .unwrap();
        assert_eq!(registry.trainable().count(), 4);

        registry.select(&["fc6_0"]);
        let trainable: Vec<_> = registry.trainable().map(|e| e.name.as_str()).collect();
        assert_eq!(trainable, vec!["fc6_0_weight", "fc6_0_bias"]);

        registry.select::<&str>(&[]);
        assert_eq!(registry.trainable().count(), 0);
    }

    #[test]
    fn test_inherit_flags() {
        let mut rng = StdRng::seed_from_u64(0);
        let branch = head(&mut rng);
        let mut old = ParameterRegistry::build([(Owner::Branch(0), &branch)]).unwrap();
        old.select(&["fc6_0_bias"]);

        let mut rebuilt = ParameterRegistry::build([(Owner::Branch(0), &branch)]).unwrap();
        rebuilt.inherit_flags(&old);
        assert!(!rebuilt.get("fc6_0_weight").unwrap().trainable);
        assert!(rebuilt.get("fc6_0_bias").unwrap().trainable);
    }
}
