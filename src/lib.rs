//! MDNet - multi-domain network tracker
//!
//! Facade over the workspace crates: the network core (`mdnet-core`) and the
//! sequence/result plumbing shared with tracking drivers (`mdnet-common`).

pub use mdnet_common as common;
pub use mdnet_core as network;

pub use mdnet_common::{BoundingBox, SequenceConfig, TrackingResult};
pub use mdnet_core::{
    Accuracy, AffineSpatialTransform, BatchNorm2d, BinaryLoss, Endpoint, LocalResponseNorm, MdNet,
    NetworkConfig, NetworkError, ParameterRegistry, Precision, Stage, Tensor, WeightFormat,
};
