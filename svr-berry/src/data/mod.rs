//! 体素网格基础数据结构与重采样原语.

mod blur;
mod grid;
mod interp;
mod io;
mod save;

pub use blur::{blur_grid, blur_grid_padded, gaussian_kernel};
pub use grid::VoxelGrid;
pub use interp::{
    interp_linear_padded, resample_onto, resample_under_pose, resample_with_padding, transform_mask,
};
pub use save::ImgWriteVis;
