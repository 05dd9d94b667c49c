//! Multi-domain network: shared backbone plus K two-class branches
//!
//! ```text
//! crop (N,3,107,107)
//!   conv1 ─ conv2 ─┬────────────────────────────┐
//!                  └ conv_loc1 ─ conv_loc2 ─ θ ─ warp ─ conv3 ─ flatten ─ fc4 ─ fc5 ─ fc6_k
//! ```
//!
//! The regression sub-branch (`conv_loc1`, `conv_loc2`) only runs when the
//! transform is enabled. It never replaces the main activation; its output
//! becomes the per-sample affine transform used to warp conv2 features.

use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::layers::activation::softmax;
use crate::layers::{
    flatten, Conv2d, Dropout, Linear, LocalResponseNorm, MaxPool2d, Module, ParamKind, Sequential,
};
use crate::params::{Owner, ParameterRegistry};
use crate::transform::AffineSpatialTransform;
use crate::weights::{self, WeightFormat};
use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Side length of the input crops the backbone is sized for
pub const INPUT_SIZE: usize = 107;
/// Width of the shared embedding fed to every branch
pub const EMBEDDING_DIM: usize = 512;
const CONV3_FEATURES: usize = 512 * 3 * 3;
const DROPOUT_P: f32 = 0.5;
const IDENTITY_THETA: [f32; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

/// Named backbone stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Conv1,
    Conv2,
    ConvLoc1,
    ConvLoc2,
    Conv3,
    Fc4,
    Fc5,
}

/// How the forward pass treats a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    /// Replaces the running activation
    Ordinary,
    /// First regression stage; reads the activation, produces the side output
    RegressionHead,
    /// Second regression stage; turns the side output into θ
    RegressionOutput,
    /// Warps with θ (when enabled), applies the stage, flattens to 2-D
    WarpAndFlatten,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Conv1,
        Stage::Conv2,
        Stage::ConvLoc1,
        Stage::ConvLoc2,
        Stage::Conv3,
        Stage::Fc4,
        Stage::Fc5,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Conv1 => "conv1",
            Stage::Conv2 => "conv2",
            Stage::ConvLoc1 => "conv_loc1",
            Stage::ConvLoc2 => "conv_loc2",
            Stage::Conv3 => "conv3",
            Stage::Fc4 => "fc4",
            Stage::Fc5 => "fc5",
        }
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn role(self) -> StageRole {
        match self {
            Stage::ConvLoc1 => StageRole::RegressionHead,
            Stage::ConvLoc2 => StageRole::RegressionOutput,
            Stage::Conv3 => StageRole::WarpAndFlatten,
            _ => StageRole::Ordinary,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| NetworkError::InvalidArgument(format!("unknown layer: {s}")))
    }
}

/// Where a forward pass stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Return right after this backbone stage
    Layer(Stage),
    /// Raw branch scores, `(N, 2)`
    Scores,
    /// Softmax over the branch scores
    Softmax,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Layer(stage) => f.write_str(stage.name()),
            Endpoint::Scores => f.write_str("fc6"),
            Endpoint::Softmax => f.write_str("fc6_softmax"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fc6" => Ok(Endpoint::Scores),
            "fc6_softmax" => Ok(Endpoint::Softmax),
            other => other.parse().map(Endpoint::Layer),
        }
    }
}

pub struct MdNet {
    config: NetworkConfig,
    device: Device,
    /// Indexed by [`Stage::index`]
    stages: Vec<Sequential>,
    branches: Vec<Sequential>,
    transform: AffineSpatialTransform,
    registry: ParameterRegistry,
    training: bool,
    rng: RefCell<StdRng>,
}

impl MdNet {
    /// Build the network, then install pretrained weights if configured
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate()?;
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let stages = vec![
            Sequential::new(vec![
                Module::Conv(Conv2d::new(3, 96, 7, 2, &mut rng, &device)?),
                Module::Relu,
                Module::Lrn(LocalResponseNorm),
                Module::MaxPool(MaxPool2d::new(3, 2)),
            ]),
            Sequential::new(vec![
                Module::Conv(Conv2d::new(96, 256, 5, 2, &mut rng, &device)?),
                Module::Relu,
                Module::Lrn(LocalResponseNorm),
                Module::MaxPool(MaxPool2d::new(3, 2)),
            ]),
            Sequential::new(vec![
                Module::Conv(Conv2d::new(256, 64, 3, 1, &mut rng, &device)?),
                Module::Relu,
            ]),
            Sequential::new(vec![Module::Conv(Conv2d::new(64, 6, 3, 1, &mut rng, &device)?)]),
            Sequential::new(vec![
                Module::Conv(Conv2d::new(256, 512, 3, 1, &mut rng, &device)?),
                Module::Relu,
            ]),
            Sequential::new(vec![
                Module::Dropout(Dropout::new(DROPOUT_P)),
                Module::Linear(Linear::new(CONV3_FEATURES, EMBEDDING_DIM, &mut rng, &device)?),
                Module::Relu,
            ]),
            Sequential::new(vec![
                Module::Dropout(Dropout::new(DROPOUT_P)),
                Module::Linear(Linear::new(EMBEDDING_DIM, EMBEDDING_DIM, &mut rng, &device)?),
                Module::Relu,
            ]),
        ];

        let branches = (0..config.num_branches)
            .map(|_| {
                Ok(Sequential::new(vec![
                    Module::Dropout(Dropout::new(DROPOUT_P)),
                    Module::Linear(Linear::new(EMBEDDING_DIM, 2, &mut rng, &device)?),
                ]))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut net = Self {
            device,
            stages,
            branches,
            transform: AffineSpatialTransform::new(5, 5),
            registry: ParameterRegistry::default(),
            training: false,
            rng: RefCell::new(rng),
            config,
        };

        if net.config.zero_init {
            net.reset_regression()?;
        }

        if let Some(source) = net.config.weights.clone() {
            net.load_weights(&source.path, source.format)?;
        }

        net.registry = ParameterRegistry::build(net.groups())?;

        info!(
            "Built MDNet with {} branches, transform {}, {} parameters",
            net.branches.len(),
            if net.config.enable_stn { "enabled" } else { "disabled" },
            net.parameter_count()
        );
        Ok(net)
    }

    /// Zero the final regression conv and make it emit the identity transform
    pub fn reset_regression(&mut self) -> Result<()> {
        let weight = Tensor::zeros((6, 64, 3, 3), DType::F32, &self.device)?;
        let bias = Tensor::new(&IDENTITY_THETA, &self.device)?;
        let stage = &mut self.stages[Stage::ConvLoc2.index()];
        stage.set_parameter(0, ParamKind::Weight, &weight)?;
        stage.set_parameter(0, ParamKind::Bias, &bias)?;
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Device every parameter lives on; inputs must be created there too
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    #[must_use]
    pub fn stn_enabled(&self) -> bool {
        self.config.enable_stn
    }

    /// Dropout draws masks only in training mode
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    #[must_use]
    pub fn is_training(&self) -> bool {
        self.training
    }

    #[must_use]
    pub fn stage(&self, stage: Stage) -> &Sequential {
        &self.stages[stage.index()]
    }

    #[must_use]
    pub fn branch(&self, index: usize) -> Option<&Sequential> {
        self.branches.get(index)
    }

    /// Run stages from `start` until `end`, falling through to branch `branch`
    ///
    /// The result stays on the autograd graph of every parameter it touched.
    pub fn forward(&self, x: &Tensor, branch: usize, start: Stage, end: Endpoint) -> Result<Tensor> {
        if branch >= self.branches.len() {
            return Err(NetworkError::InvalidArgument(format!(
                "branch {branch} out of range, network has {}",
                self.branches.len()
            )));
        }
        if let Endpoint::Layer(end_stage) = end {
            if end_stage < start {
                return Err(NetworkError::InvalidArgument(format!(
                    "start layer {start} comes after end layer {end_stage}"
                )));
            }
        }
        debug!("forward {start}..{end} on input {:?}, branch {branch}", x.dims());

        let stn = self.config.enable_stn;
        let mut rng = self.training.then(|| self.rng.borrow_mut());
        let mut x = x.clone();
        let mut side: Option<Tensor> = None;
        let mut theta: Option<Tensor> = None;

        for stage in &Stage::ALL[start.index()..] {
            let layers = &self.stages[stage.index()];
            match stage.role() {
                StageRole::Ordinary => {
                    x = layers.forward(&x, rng.as_deref_mut())?;
                }
                StageRole::RegressionHead => {
                    if stn {
                        side = Some(layers.forward(&x, rng.as_deref_mut())?);
                    }
                }
                StageRole::RegressionOutput => {
                    if stn {
                        let input = side.take().ok_or_else(|| {
                            NetworkError::InvalidArgument(format!(
                                "{stage} needs the {} output; start at or before it",
                                Stage::ConvLoc1
                            ))
                        })?;
                        let p = layers.forward(&input, rng.as_deref_mut())?;
                        theta = Some(self.to_theta(&p)?);
                    }
                }
                StageRole::WarpAndFlatten => {
                    if stn {
                        let theta = theta.take().ok_or_else(|| {
                            NetworkError::InvalidArgument(format!(
                                "{stage} needs a predicted transform; start at or before {}",
                                Stage::ConvLoc1
                            ))
                        })?;
                        x = self.transform.warp(&x, &theta)?;
                    }
                    x = flatten(&layers.forward(&x, rng.as_deref_mut())?)?;
                }
            }

            if end == Endpoint::Layer(*stage) {
                return Ok(x);
            }
        }

        let scores = self.branches[branch].forward(&x, rng.as_deref_mut())?;
        match end {
            Endpoint::Softmax if scores.elem_count() > 0 => softmax(&scores),
            _ => Ok(scores),
        }
    }

    /// [`forward`](Self::forward) with layer names as strings
    pub fn forward_named(&self, x: &Tensor, branch: usize, start: &str, end: &str) -> Result<Tensor> {
        self.forward(x, branch, start.parse()?, end.parse()?)
    }

    fn to_theta(&self, p: &Tensor) -> Result<Tensor> {
        let batch = p.dims().first().copied().unwrap_or(0);
        if p.elem_count() != batch * 6 {
            return Err(NetworkError::InvalidArgument(format!(
                "regression output {:?} cannot be viewed as ({batch}, 2, 3)",
                p.dims()
            )));
        }
        let theta = p.reshape((batch, 2, 3))?;
        match self.config.theta_clamp {
            Some(limit) => {
                let limit = f64::from(limit);
                Ok(theta.clamp(-limit, limit)?)
            }
            None => Ok(theta),
        }
    }

    fn groups(&self) -> impl Iterator<Item = (Owner, &Sequential)> {
        Stage::ALL
            .into_iter()
            .map(move |stage| (Owner::Backbone(stage), &self.stages[stage.index()]))
            .chain(
                self.branches
                    .iter()
                    .enumerate()
                    .map(|(index, branch)| (Owner::Branch(index), branch)),
            )
    }

    fn owner_layers(&self, owner: Owner) -> Option<&Sequential> {
        match owner {
            Owner::Backbone(stage) => self.stages.get(stage.index()),
            Owner::Branch(index) => self.branches.get(index),
        }
    }

    fn owner_layers_mut(&mut self, owner: Owner) -> Option<&mut Sequential> {
        match owner {
            Owner::Backbone(stage) => self.stages.get_mut(stage.index()),
            Owner::Branch(index) => self.branches.get_mut(index),
        }
    }

    /// Rebuild the registry from the current layer tree, keeping trainable flags
    pub fn build_param_registry(&mut self) -> Result<()> {
        let mut registry = ParameterRegistry::build(self.groups())?;
        registry.inherit_flags(&self.registry);
        self.registry = registry;
        Ok(())
    }

    #[must_use]
    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Freeze everything except parameters whose name starts with a prefix
    pub fn set_learnable_params<S: AsRef<str>>(&mut self, prefixes: &[S]) {
        self.registry.select(prefixes);
        info!(
            "Trainable parameters: {}",
            self.registry
                .trainable()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    /// Trainable `(name, var)` pairs in registry order
    #[must_use]
    pub fn get_learnable_params(&self) -> Vec<(&str, &Var)> {
        self.registry
            .trainable()
            .filter_map(|entry| Some((entry.name.as_str(), self.resolve(entry.name.as_str())?)))
            .collect()
    }

    /// Handles to the trainable vars, ready for a `candle_nn` optimizer
    ///
    /// The handles share storage with the network, so optimizer steps update
    /// it in place. Frozen parameters are never handed out.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.get_learnable_params()
            .into_iter()
            .map(|(_, var)| var.clone())
            .collect()
    }

    /// Every registered `(name, var)` pair in registry order
    #[must_use]
    pub fn parameters(&self) -> Vec<(&str, &Var)> {
        self.registry
            .iter()
            .filter_map(|entry| Some((entry.name.as_str(), self.resolve(entry.name.as_str())?)))
            .collect()
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Var> {
        self.resolve(name)
    }

    /// Overwrite a registered parameter in place; the shape must match
    pub fn set_parameter(&mut self, name: &str, value: &Tensor) -> Result<()> {
        let slot = self
            .registry
            .get(name)
            .ok_or_else(|| NetworkError::InvalidArgument(format!("unknown parameter: {name}")))?
            .slot;
        let layers = self
            .owner_layers_mut(slot.owner)
            .ok_or_else(|| NetworkError::InvalidArgument(format!("unknown parameter: {name}")))?;
        layers
            .set_parameter(slot.module, slot.kind, value)
            .map_err(|err| match err {
                NetworkError::ShapeMismatch { expected, actual, .. } => NetworkError::ShapeMismatch {
                    name: name.to_string(),
                    expected,
                    actual,
                },
                other => other,
            })
    }

    /// Total number of scalar parameters in the registry
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.groups()
            .flat_map(|(_, layers)| layers.named_parameters())
            .map(|(_, _, var)| var.elem_count())
            .sum()
    }

    fn resolve(&self, name: &str) -> Option<&Var> {
        let slot = self.registry.get(name)?.slot;
        self.owner_layers(slot.owner)?
            .module(slot.module)?
            .parameter(slot.kind)
    }

    /// Load a weight file, sniffing its format when `format` is `None`
    pub fn load_weights(&mut self, path: impl AsRef<Path>, format: Option<WeightFormat>) -> Result<()> {
        let path = path.as_ref();
        let format = match format {
            Some(format) => format,
            None => WeightFormat::detect(path)?,
        };
        match format {
            WeightFormat::Native => self.load_native_weights(path),
            WeightFormat::Foreign => self.load_foreign_weights(path),
        }
    }

    /// Install the backbone from a native checkpoint; branches are untouched
    pub fn load_native_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors = weights::native::read_backbone(path, &self.device)?;
        let count = tensors.len();
        self.install_backbone(tensors)?;
        info!("Loaded {} backbone tensors from {}", count, path.display());
        Ok(())
    }

    /// Install a backbone keyed `{stage}.{module}.{kind}`; every key must match
    ///
    /// Nothing is written unless every tensor is present with the right shape.
    pub fn install_backbone(&mut self, mut tensors: HashMap<String, Tensor>) -> Result<()> {
        let mut plan = Vec::new();
        for stage in Stage::ALL {
            for (module, kind, current) in self.stages[stage.index()].named_parameters() {
                let key = format!("{}.{module}.{}", stage.name(), kind.as_str());
                let value = tensors.remove(&key).ok_or_else(|| {
                    NetworkError::Format(format!("checkpoint is missing {key}"))
                })?;
                if value.dims() != current.dims() {
                    return Err(NetworkError::ShapeMismatch {
                        name: key,
                        expected: current.dims().to_vec(),
                        actual: value.dims().to_vec(),
                    });
                }
                plan.push((stage, module, kind, value));
            }
        }
        if !tensors.is_empty() {
            let mut unexpected: Vec<_> = tensors.into_keys().collect();
            unexpected.sort();
            return Err(NetworkError::Format(format!(
                "checkpoint has unexpected tensors: {}",
                unexpected.join(", ")
            )));
        }

        for (stage, module, kind, value) in plan {
            self.stages[stage.index()].set_parameter(module, kind, &value)?;
        }
        Ok(())
    }

    /// Install conv1, conv2 and conv3 from a MatConvNet model
    pub fn load_foreign_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let convs = weights::foreign::read_conv_weights(path, &self.device)?;
        self.install_convs(convs)?;
        info!("Loaded conv1, conv2, conv3 from {}", path.display());
        Ok(())
    }

    /// Install `(weight, bias)` pairs already in `(out, in, kh, kw)` layout
    pub fn install_convs(&mut self, convs: [(Tensor, Tensor); 3]) -> Result<()> {
        let targets = weights::foreign::TARGET_STAGES;
        for (stage, (weight, bias)) in targets.iter().zip(&convs) {
            let layers = &self.stages[stage.index()];
            for (kind, value) in [(ParamKind::Weight, weight), (ParamKind::Bias, bias)] {
                let current = layers
                    .module(0)
                    .and_then(|m| m.parameter(kind))
                    .ok_or_else(|| {
                        NetworkError::Format(format!("{stage} has no {} tensor", kind.as_str()))
                    })?;
                if current.dims() != value.dims() {
                    return Err(NetworkError::ShapeMismatch {
                        name: format!("{stage}_{}", kind.as_str()),
                        expected: current.dims().to_vec(),
                        actual: value.dims().to_vec(),
                    });
                }
            }
        }

        for (stage, (weight, bias)) in targets.into_iter().zip(&convs) {
            let layers = &mut self.stages[stage.index()];
            layers.set_parameter(0, ParamKind::Weight, weight)?;
            layers.set_parameter(0, ParamKind::Bias, bias)?;
        }
        Ok(())
    }

    /// Write the backbone as a native checkpoint
    pub fn save_native_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors: Vec<(String, &Tensor)> = Stage::ALL
            .into_iter()
            .flat_map(|stage| {
                self.stages[stage.index()]
                    .named_parameters()
                    .map(move |(module, kind, var)| {
                        (format!("{}.{module}.{}", stage.name(), kind.as_str()), var.as_tensor())
                    })
            })
            .collect();
        weights::native::write_backbone(path, &tensors)?;
        info!("Saved {} backbone tensors to {}", tensors.len(), path.display());
        Ok(())
    }
}

impl fmt::Debug for MdNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdNet")
            .field("device", &self.device)
            .field("num_branches", &self.branches.len())
            .field("enable_stn", &self.config.enable_stn)
            .field("training", &self.training)
            .field("parameters", &self.registry.len())
            .finish()
    }
}
