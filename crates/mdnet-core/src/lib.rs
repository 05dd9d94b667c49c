//! Multi-domain network core for single-target visual tracking
//!
//! A shared convolutional backbone feeds K independent two-class branches,
//! one per training domain. The backbone carries an optional bbox-regression
//! sub-branch whose predicted affine transform warps conv2 features before
//! conv3. Parameters are exposed through a flat, named registry with
//! per-parameter trainable flags so a tracker can fine-tune only a subset of
//! layers online.
//!
//! # Example
//!
//! ```no_run
//! use candle_nn::{Optimizer, SGD};
//! use mdnet_core::{BinaryLoss, DType, Endpoint, MdNet, NetworkConfig, Stage, Tensor};
//!
//! # fn main() -> mdnet_core::Result<()> {
//! let mut net = MdNet::new(NetworkConfig::tracking().with_weights("models/mdnet_vot-otb.safetensors"))?;
//! net.set_learnable_params(&["fc"]);
//!
//! let crops = Tensor::zeros((8, 3, 107, 107), DType::F32, net.device())?;
//! let scores = net.forward(&crops, 0, Stage::Conv1, Endpoint::Scores)?;
//! assert_eq!(scores.dims(), &[8, 2]);
//!
//! // one online update of the selected layers
//! let mut sgd = SGD::new(net.trainable_vars(), 1e-3)?;
//! let loss = BinaryLoss.compute(&scores.narrow(0, 0, 4)?, &scores.narrow(0, 4, 4)?)?;
//! sgd.backward_step(&loss)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod layers;
pub mod loss;
pub mod network;
pub mod params;
pub mod transform;
pub mod weights;

pub use config::NetworkConfig;
pub use error::{ErrorKind, NetworkError, Result};
pub use candle_core::{DType, Device, Tensor, Var};
pub use layers::{BatchNorm2d, LocalResponseNorm, ParamKind};
pub use loss::{Accuracy, BinaryLoss, Precision};
pub use network::{Endpoint, MdNet, Stage, StageRole, EMBEDDING_DIM, INPUT_SIZE};
pub use params::{Owner, ParameterRegistry, RegistryEntry};
pub use transform::AffineSpatialTransform;
pub use weights::{WeightFormat, WeightSource};
