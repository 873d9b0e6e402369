//! 配准调度: 堆叠到模板、切片到体积 (SVR)、package 到体积.
//!
//! 实际的刚体/FFD 配准优化器是外部协作者, 通过 [`Registrar`]
//! 能力接口注入; 本模块只负责调度、原点偏移的矩阵簿记与
//! 位姿广播. 测试以桩实现替代优化器.

pub mod remote;

use crate::consts::ACTIVE_EPS;
use crate::data::{blur_grid_padded, resample_under_pose, transform_mask, VoxelGrid};
use crate::geom::{FreeFormTransform, RigidTransform};
use crate::order::{split_packages_multiband, SliceOrder};
use crate::quality::compute_ncc;
use crate::store::SliceStore;
use rayon::prelude::*;

/// 外部配准优化器的能力接口.
///
/// `target` 为被配准图像, `source` 为参考图像, `init` 为初始位姿;
/// 返回使 `target` 对齐 `source` 的位姿估计.
pub trait Registrar: Sync {
    /// 刚体配准.
    fn rigid_register(
        &self,
        target: &VoxelGrid,
        source: &VoxelGrid,
        init: &RigidTransform,
    ) -> RigidTransform;

    /// 自由形变配准.
    fn ffd_register(
        &self,
        target: &VoxelGrid,
        source: &VoxelGrid,
        init: &FreeFormTransform,
    ) -> FreeFormTransform;
}

/// 恒等桩: 原样返回初始位姿. 用于测试与无配准的流水线演练.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRegistrar;

impl Registrar for IdentityRegistrar {
    fn rigid_register(
        &self,
        _target: &VoxelGrid,
        _source: &VoxelGrid,
        init: &RigidTransform,
    ) -> RigidTransform {
        init.clone()
    }

    fn ffd_register(
        &self,
        _target: &VoxelGrid,
        _source: &VoxelGrid,
        init: &FreeFormTransform,
    ) -> FreeFormTransform {
        init.clone()
    }
}

/// 以固定位姿应答的桩: 模拟一次 "成功恢复已知运动" 的配准.
#[derive(Debug, Clone)]
pub struct FixedPoseRegistrar {
    /// 每次刚体配准返回的位姿.
    pub pose: RigidTransform,
}

impl Registrar for FixedPoseRegistrar {
    fn rigid_register(
        &self,
        _target: &VoxelGrid,
        _source: &VoxelGrid,
        _init: &RigidTransform,
    ) -> RigidTransform {
        self.pose.clone()
    }

    fn ffd_register(
        &self,
        _target: &VoxelGrid,
        _source: &VoxelGrid,
        init: &FreeFormTransform,
    ) -> FreeFormTransform {
        init.clone()
    }
}

/// 全局堆叠到模板配准.
///
/// 模板按 mask 掩膜并清零原点, 各堆叠并行配准; 模板堆叠自身
/// 保持原位姿. 掩膜后模板为空时该轮配准整体跳过.
pub fn stack_registrations(
    registrar: &dyn Registrar,
    stacks: &[VoxelGrid],
    stack_poses: &mut [RigidTransform],
    template: &VoxelGrid,
    template_index: Option<usize>,
    mask: &VoxelGrid,
) {
    let mut target = template.clone();
    let m = transform_mask(mask, &RigidTransform::identity(), target.geom());
    for (v, &mv) in target.data_mut().iter_mut().zip(m.data().iter()) {
        *v *= mv;
    }
    if target.min_max().1 <= 0.0 {
        log::warn!("Masked registration target is empty, skipping stack registrations");
        return;
    }

    let mut geom = target.geom().clone();
    let offset = geom.reset_origin();
    target.set_geom(geom);
    let offset_inv = offset.inverse();

    stack_poses
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, pose)| {
            if template_index == Some(i) {
                return;
            }
            // 配准在 "模板坐标 → 堆叠坐标" 方向上估计.
            let init = pose.inverse().compose(&offset);
            let result = registrar.rigid_register(&target, &stacks[i], &init);
            *pose = result.compose(&offset_inv).inverse();
        });
}

/// 逐切片 SVR. `ffd` 为真时走自由形变路径.
/// 内容近似为零的切片保持原位姿.
pub fn slice_to_volume_registration(
    registrar: &dyn Registrar,
    store: &mut SliceStore,
    volume: &VoxelGrid,
    ffd: bool,
) {
    if ffd {
        let slices = &store.slices;
        let zero_slice = &store.zero_slice;
        store
            .ffd_transformations
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, t)| {
                if zero_slice[idx] {
                    return;
                }
                *t = registrar.ffd_register(&slices[idx], volume, t);
            });
        return;
    }

    let slices = &store.slices;
    let zero_slice = &store.zero_slice;
    store
        .transformations
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, pose)| {
            if zero_slice[idx] {
                return;
            }
            let mut target = slices[idx].clone();
            let mut geom = target.geom().clone();
            let offset = geom.reset_origin();
            target.set_geom(geom);

            let init = pose.compose(&offset);
            let result = registrar.rigid_register(&target, volume, &init);
            *pose = result.compose(&offset.inverse());
        });
}

/// 单个堆叠的 package 元数据.
#[derive(Debug, Clone, Copy)]
pub struct PackageMeta {
    /// package 数.
    pub packages: usize,

    /// multiband 因子.
    pub multiband: usize,

    /// 采集顺序.
    pub order: SliceOrder,

    /// 自定义顺序的步长.
    pub step: usize,

    /// 倒带因子.
    pub rewinder: usize,
}

impl Default for PackageMeta {
    fn default() -> Self {
        Self {
            packages: 1,
            multiband: 1,
            order: SliceOrder::Ascending,
            step: 1,
            rewinder: 1,
        }
    }
}

/// package 到体积配准.
///
/// 每个堆叠按 package 数与 multiband 因子拆成合成 package,
/// 逐个配准到当前体积, 恢复的位姿广播给 package 的全部成员切片.
/// 空 package (无正值) 保持成员位姿不变.
pub fn package_to_volume(
    registrar: &dyn Registrar,
    store: &mut SliceStore,
    volume: &VoxelGrid,
    stacks: &[VoxelGrid],
    metas: &[PackageMeta],
) {
    assert_eq!(stacks.len(), metas.len(), "堆叠与 package 元数据数量不一致");

    for (stack_idx, (stack, meta)) in stacks.iter().zip(metas.iter()).enumerate() {
        let packages = split_packages_multiband(
            stack,
            meta.packages,
            meta.multiband,
            meta.order,
            meta.step,
            meta.rewinder,
        );

        // 成员 z 位置 → 切片仓库下标.
        let mut pos_to_slice = std::collections::HashMap::new();
        for i in 0..store.len() {
            if store.stack_index[i] == stack_idx {
                pos_to_slice.insert(store.slice_pos[i], i);
            }
        }

        for package in &packages {
            if package.grid.min_max().1 <= 0.0 {
                continue;
            }
            let Some(&first) = package
                .members
                .iter()
                .copied()
                .min()
                .and_then(|pos| pos_to_slice.get(&pos))
            else {
                continue;
            };

            let mut target = package.grid.clone();
            let mut geom = target.geom().clone();
            let offset = geom.reset_origin();
            target.set_geom(geom);

            let init = store.transformations[first].compose(&offset);
            let result = registrar.rigid_register(&target, volume, &init);
            let pose = result.compose(&offset.inverse());

            for &pos in &package.members {
                if let Some(&i) = pos_to_slice.get(&pos) {
                    store.transformations[i] = pose.clone();
                }
            }
        }
    }
}

/// 结构化剔除: 基于 NCC 的独立离群检测.
///
/// 把当前体积按切片位姿重采样到切片几何, 与 0.6·dx 高斯模糊后的
/// 原始切片在 mask 内比较 NCC; 低于门限的切片配准门控 `R_i`
/// 置为 -1 (在重新配准前不参与系数构建). 返回被剔除的切片清单.
pub fn structural_exclusion(
    store: &mut SliceStore,
    volume: &VoxelGrid,
    mask: &VoxelGrid,
    ncc_threshold: f64,
) -> Vec<usize> {
    let (smin, _) = volume.min_max();
    let source_pad = if smin < -0.1 {
        -0.5
    } else if smin < 0.1 {
        0.0
    } else {
        f32::MIN
    };

    let nccs: Vec<f64> = {
        let s: &SliceStore = store;
        (0..s.len())
            .into_par_iter()
            .map(|idx| {
                let slice = &s.slices[idx];
                let pose = &s.transformations[idx];

                // 体积重采样到切片空间.
                let resampled =
                    resample_under_pose(volume, pose, slice.geom(), source_pad, 0.0);

                // 原始切片模糊到体积分辨率.
                let mut target = slice.clone();
                blur_grid_padded(&mut target, [0.6, 0.6, 0.0], source_pad);

                // mask 到切片空间.
                let slice_mask = transform_mask(mask, pose, slice.geom());
                let mut masked_target = target;
                let mut masked_output = resampled;
                for ((t, o), &m) in masked_target
                    .data_mut()
                    .iter_mut()
                    .zip(masked_output.data_mut().iter_mut())
                    .zip(slice_mask.data().iter())
                {
                    *t *= m;
                    *o *= m;
                }

                let ncc = compute_ncc(&masked_target, &masked_output, 0.0, None);
                // 无重叠视作无证据, 不剔除.
                if ncc == -1.0 {
                    1.0
                } else {
                    ncc
                }
            })
            .collect()
    };

    let mut excluded = Vec::new();
    let mut mean = 0.0;
    for (idx, &ncc) in nccs.iter().enumerate() {
        mean += ncc;
        if ncc > ncc_threshold {
            store.reg_slice_weight[idx] = 1.0;
        } else {
            store.reg_slice_weight[idx] = -1.0;
            excluded.push(idx);
        }
    }
    mean /= nccs.len().max(1) as f64;
    log::info!("Structural exclusion: excluded {excluded:?}, mean registration ncc {mean}");
    excluded
}

/// 把堆叠位姿对齐到模板堆叠的质心 (纯平移).
pub fn center_stacks(
    stacks: &[VoxelGrid],
    stack_poses: &mut [RigidTransform],
    template_index: usize,
) {
    let centroid = |grid: &VoxelGrid| -> Option<[f64; 3]> {
        let (nz, ny, nx) = grid.shape();
        let mut acc = [0.0f64; 3];
        let mut norm = 0.0f64;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let v = grid.at(x, y, z) as f64;
                    if v <= 0.0 {
                        continue;
                    }
                    acc[0] += v * x as f64;
                    acc[1] += v * y as f64;
                    acc[2] += v * z as f64;
                    norm += v;
                }
            }
        }
        (norm > 0.0).then(|| {
            grid.geom()
                .image_to_world([acc[0] / norm, acc[1] / norm, acc[2] / norm])
        })
    };

    let Some(c0) = centroid(&stacks[template_index]) else {
        log::warn!("Template stack has no positive voxels, skipping centering");
        return;
    };

    for (i, pose) in stack_poses.iter_mut().enumerate() {
        if i == template_index {
            continue;
        }
        let Some(c) = centroid(&stacks[i]) else {
            continue;
        };
        let translation =
            RigidTransform::from_translation(c0[0] - c[0], c0[1] - c[1], c0[2] - c[2]);
        *pose = translation.compose(pose);
    }
}

/// 在当前位姿下把全部堆叠平均到模板几何.
/// 每个体素取有正值贡献的堆叠均值, 无贡献处为 0.
pub fn create_average(
    stacks: &[VoxelGrid],
    stack_poses: &[RigidTransform],
    template_geom: &crate::geom::ImageGeometry,
) -> VoxelGrid {
    let mut sum = VoxelGrid::zeros(template_geom.clone());
    let mut weight = VoxelGrid::zeros(template_geom.clone());
    for (stack, pose) in stacks.iter().zip(stack_poses.iter()) {
        let resampled =
            resample_under_pose(stack, &pose.inverse(), template_geom, ACTIVE_EPS, 0.0);
        for ((s, w), &v) in sum
            .data_mut()
            .iter_mut()
            .zip(weight.data_mut().iter_mut())
            .zip(resampled.data().iter())
        {
            if v > 0.0 {
                *s += v;
                *w += 1.0;
            }
        }
    }
    for (s, &w) in sum.data_mut().iter_mut().zip(weight.data().iter()) {
        if w > 0.0 {
            *s /= w;
        }
    }
    sum
}

/// 运动度量: 堆叠配准到模板后, 相邻切片的平均 NCC (边缘各削 5 像素).
pub fn volume_ncc(
    registrar: &dyn Registrar,
    input_stack: &VoxelGrid,
    template: &VoxelGrid,
    mask: &VoxelGrid,
) -> f64 {
    let mut target = template.clone();
    for (v, &m) in target.data_mut().iter_mut().zip(mask.data().iter()) {
        *v *= m;
    }

    let init = RigidTransform::from_translation(0.0001, 0.0001, -0.0001);
    let pose = registrar.rigid_register(&target, input_stack, &init);
    let mut aligned = resample_under_pose(input_stack, &pose, target.geom(), 0.0, 0.0);
    for (v, &m) in aligned.data_mut().iter_mut().zip(mask.data().iter()) {
        *v *= m;
    }

    let (nz, ny, nx) = aligned.shape();
    let sh = 5usize;
    if nx <= 2 * sh || ny <= 2 * sh || nz < 2 {
        return 0.0;
    }
    let mut ncc_sum = 0.0;
    let mut count = 0usize;
    for z in 0..nz - 1 {
        let a = aligned.region(sh, sh, z, nx - sh, ny - sh, z + 1);
        let b = aligned.region(sh, sh, z + 1, nx - sh, ny - sh, z + 2);
        let ncc = compute_ncc(&a, &b, 0.1, None);
        if ncc > 0.0 {
            ncc_sum += ncc;
            count += 1;
        }
    }
    if count > 0 {
        ncc_sum / count as f64
    } else {
        0.0
    }
}
