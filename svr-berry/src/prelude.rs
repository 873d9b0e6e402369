//! 常用类型一站式导入.

pub use crate::coeff::{coeff_init, CoeffStore};
pub use crate::em::RobustStats;
pub use crate::geom::{FreeFormTransform, ImageGeometry, RigidTransform};
pub use crate::order::{slice_acquisition_order, SliceOrder};
pub use crate::quality::{compute_ncc, QualityReport};
pub use crate::register::{IdentityRegistrar, PackageMeta, Registrar};
pub use crate::store::{CreateSlicesOptions, SliceStore};
pub use crate::{ReconError, Reconstruction, SvrParams, VoxelGrid};
