#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 胎儿/新生儿 MRI 的切片-体积重建 (SVR) 引擎:
//! 把大量厚层、受运动污染、任意朝向的二维切片堆叠融合为
//! 单一各向同性三维体积.
//!
//! 外层迭代交替进行 (a) 刚体 (或 FFD) 切片-体积运动校正,
//! (b) EM 鲁棒统计 (体素权重 + 切片权重 + scale + bias),
//! (c) 超分辨率体积更新与自适应边缘保持正则化.
//!
//! # 注意
//!
//! 1. 实际的配准优化器是外部协作者, 经 [`register::Registrar`]
//!   能力接口注入; 本 crate 自带恒等/定值桩用于测试.
//! 2. 在非期望情况下 (模板未创建、尺寸不一致等契约违规),
//!   程序会直接 panic, 而不会导致内存错误. As what Rust promises.
//!   数据错误与 I/O 失败以 [`ReconError`] 返回.
//!
//! # 开发计划
//!
//! ### 几何与重采样原语 ✅
//!
//! 世界坐标映射、刚体/FFD 变换、padding 感知插值与可分离高斯滤波.
//!
//! 实现位于 `svr-berry/src/geom` 与 `svr-berry/src/data`.
//!
//! ### 切片仓库 ✅
//!
//! 扁平化切片集合与逐切片元数据 (位姿、scale、bias、权重、门控).
//!
//! 实现位于 `svr-berry/src/store.rs`.
//!
//! ### 系数引擎 (PSF 稀疏算子) ✅
//!
//! Jiang-Rueckert 高斯 PSF, 逐切片 CSR 存储, 体积权重图.
//!
//! 实现位于 `svr-berry/src/coeff.rs`.
//!
//! ### 前向模拟 ✅
//!
//! 实现位于 `svr-berry/src/simulate.rs`.
//!
//! ### EM 鲁棒统计 ✅
//!
//! 体素/切片双层混合模型, scale 闭式更新, bias 平滑估计.
//!
//! 实现位于 `svr-berry/src/em.rs`.
//!
//! ### 超分辨率与自适应正则化 ✅
//!
//! 系数转置残差回投、强度钳制、13 方向边缘加权拉普拉斯,
//! 以及全局 bias 校正/归一.
//!
//! 实现位于 `svr-berry/src/sr.rs`.
//!
//! ### 配准调度 ✅
//!
//! 堆叠到模板、逐切片 SVR、package 到体积、NCC 结构化剔除,
//! 以及远程 SVR 的交换目录传输.
//!
//! 实现位于 `svr-berry/src/register`.
//!
//! ### 采集顺序与 package 拆分 ✅
//!
//! 实现位于 `svr-berry/src/order.rs`.
//!
//! ### 质量度量与报告 ✅
//!
//! NCC/NRMSE、逐迭代清单与 CSV 汇总.
//!
//! 实现位于 `svr-berry/src/quality.rs`.

/// 二维索引 (高, 宽).
pub type Idx2d = (usize, usize);

/// 三维索引 (z, 高, 宽).
pub type Idx3d = (usize, usize, usize);

pub mod consts;

mod data;

pub use data::{
    blur_grid, blur_grid_padded, gaussian_kernel, interp_linear_padded, resample_under_pose,
    resample_with_padding, transform_mask, ImgWriteVis, VoxelGrid,
};

pub mod geom;

pub mod coeff;
pub mod em;
pub mod order;
pub mod quality;
pub mod register;
pub mod simulate;
pub mod sr;
pub mod store;

mod recon;

pub use recon::{ReconError, Reconstruction, SvrParams};

pub mod prelude;
