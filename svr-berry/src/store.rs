//! 切片仓库: 扁平化的二维切片集合与逐切片元数据.
//!
//! 切片在一次运行中创建一次、只增不删; 位姿、scale、bias
//! 与权重随迭代更新. 元数据按 "平行向量" 方式分离存储.

use crate::consts::{ACTIVE_EPS, PADDING};
use crate::data::{blur_grid_padded, VoxelGrid};
use crate::geom::{FreeFormTransform, RigidTransform};
use rayon::prelude::*;

/// 扁平化的切片集合. 结构完全透明, 所有向量长度一致
/// (由本结构的方法保证), 下标即切片编号.
#[derive(Debug, Clone, Default)]
pub struct SliceStore {
    /// 二维切片 (nz = 1, `dz` 为采集层厚), padding 为 -1.
    pub slices: Vec<VoxelGrid>,

    /// 切片所属堆叠编号.
    pub stack_index: Vec<usize>,

    /// 切片在堆叠内的 package 编号.
    pub package_index: Vec<usize>,

    /// 切片在堆叠内的 z 位置.
    pub slice_pos: Vec<usize>,

    /// 逐切片刚体位姿.
    pub transformations: Vec<RigidTransform>,

    /// 逐切片 FFD 位姿 (仅 FFD 模式下使用).
    pub ffd_transformations: Vec<FreeFormTransform>,

    /// 强度 scale `s_i`.
    pub scale: Vec<f64>,

    /// 对数乘性 bias 场 `B_i` (与切片同形).
    pub bias: Vec<VoxelGrid>,

    /// 体素权重 `w_i ∈ [0, 1]` (与切片同形).
    pub weights: Vec<VoxelGrid>,

    /// 切片权重 `W_i ∈ [0, 1]`.
    pub slice_weight: Vec<f64>,

    /// 配准门控权重 `R_i ∈ {-1, +1}`. 负值的切片在重新配准前
    /// 不参与系数构建.
    pub reg_slice_weight: Vec<f64>,

    /// 内容近似为零的切片标记 (不参与配准).
    pub zero_slice: Vec<bool>,

    /// 切片是否与 mask ROI 有交 (由系数引擎维护).
    pub slice_inside: Vec<bool>,

    /// 模拟切片.
    pub simulated_slices: Vec<VoxelGrid>,

    /// 模拟覆盖权重.
    pub simulated_weights: Vec<VoxelGrid>,

    /// 模拟 "在 ROI 内" 指示.
    pub simulated_inside: Vec<VoxelGrid>,

    /// 残差切片 `d_i`.
    pub slice_dif: Vec<VoxelGrid>,

    /// 可选的逐切片概率图 (为空表示未提供).
    pub probability_maps: Vec<VoxelGrid>,

    /// 创建时的切片总数.
    pub number_of_slices_org: usize,

    /// 创建时的平均采集层厚.
    pub average_thickness_org: f64,
}

/// 切片创建选项.
#[derive(Debug, Clone, Default)]
pub struct CreateSlicesOptions {
    /// 创建时对每张切片做 0.6·dx 的二维高斯预滤波.
    pub blurring: bool,

    /// 堆叠内按 z 位置排除的切片 (对所有堆叠生效).
    pub excluded_entirely: Vec<usize>,
}

impl SliceStore {
    /// 空仓库.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 切片总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// 仓库是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// 从输入堆叠创建切片集合.
    ///
    /// 每张切片继承所属堆叠的位姿作为初始位姿, 层厚覆写为
    /// `thickness[stack]`; `packages[stack]` 给出堆叠的 package 数,
    /// 用于分配 package 编号 (按 z 轮转, 与采集时间无关).
    ///
    /// `stacks`, `stack_poses`, `thickness`, `packages` 的长度必须一致,
    /// 否则 panic.
    pub fn create_from_stacks(
        &mut self,
        stacks: &[VoxelGrid],
        stack_poses: &[RigidTransform],
        thickness: &[f64],
        packages: &[usize],
        probability_maps: Option<&[VoxelGrid]>,
        options: &CreateSlicesOptions,
    ) {
        assert_eq!(stacks.len(), stack_poses.len(), "堆叠与位姿数量不一致");
        assert_eq!(stacks.len(), thickness.len(), "堆叠与层厚数量不一致");
        assert_eq!(stacks.len(), packages.len(), "堆叠与 package 数量不一致");
        if let Some(maps) = probability_maps {
            assert_eq!(stacks.len(), maps.len(), "堆叠与概率图数量不一致");
        }

        self.clear();

        let mut thickness_sum = 0.0;
        for (i, stack) in stacks.iter().enumerate() {
            let nz = stack.shape().0;
            let n_pack = packages[i].max(1);
            for j in 0..nz {
                if options.excluded_entirely.contains(&j) {
                    continue;
                }

                let mut slice = stack.extract_slice(j, thickness[i]);
                self.zero_slice.push(slice.is_zero_content());

                if options.blurring {
                    let sigma = 0.6;
                    blur_grid_padded(&mut slice, [sigma, sigma, 0.0], ACTIVE_EPS);
                }

                let zeroed = {
                    let mut z = slice.clone();
                    z.fill(0.0);
                    z
                };
                let ones = {
                    let mut o = slice.clone();
                    o.fill(1.0);
                    o
                };

                self.stack_index.push(i);
                self.package_index.push(j % n_pack);
                self.slice_pos.push(j);
                self.transformations.push(stack_poses[i].clone());
                self.scale.push(1.0);
                self.slice_weight.push(1.0);
                self.reg_slice_weight.push(1.0);
                self.slice_inside.push(false);
                self.slice_dif.push(zeroed.clone());
                self.simulated_slices.push(zeroed);
                self.simulated_weights.push(ones.clone());
                self.simulated_inside.push(ones);

                if let Some(maps) = probability_maps {
                    self.probability_maps
                        .push(maps[i].extract_slice(j, thickness[i]));
                }

                thickness_sum += thickness[i];
                self.slices.push(slice);
            }
        }

        self.number_of_slices_org = self.slices.len();
        self.average_thickness_org = if self.number_of_slices_org > 0 {
            thickness_sum / self.number_of_slices_org as f64
        } else {
            0.0
        };
        log::info!("Number of slices: {}", self.slices.len());
    }

    /// 清空全部切片与元数据.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// 直接设置外部给定的切片集合 (跳过堆叠抽取).
    pub fn set_slices(
        &mut self,
        slices: Vec<VoxelGrid>,
        slice_poses: Vec<RigidTransform>,
        stack_ids: Vec<usize>,
    ) {
        assert_eq!(slices.len(), slice_poses.len(), "切片与位姿数量不一致");
        assert_eq!(slices.len(), stack_ids.len(), "切片与堆叠编号数量不一致");
        self.clear();
        for ((slice, pose), stack) in slices.into_iter().zip(slice_poses).zip(stack_ids) {
            self.zero_slice.push(slice.is_zero_content());
            let zeroed = {
                let mut z = slice.clone();
                z.fill(0.0);
                z
            };
            let ones = {
                let mut o = slice.clone();
                o.fill(1.0);
                o
            };
            self.stack_index.push(stack);
            self.package_index.push(0);
            self.slice_pos.push(self.slices.len());
            self.transformations.push(pose);
            self.scale.push(1.0);
            self.slice_weight.push(1.0);
            self.reg_slice_weight.push(1.0);
            self.slice_inside.push(false);
            self.slice_dif.push(zeroed.clone());
            self.simulated_slices.push(zeroed);
            self.simulated_weights.push(ones.clone());
            self.simulated_inside.push(ones);
            self.slices.push(slice);
        }
        self.number_of_slices_org = self.slices.len();
    }

    /// 把堆叠位姿广播回所有切片 (覆盖各切片当前位姿).
    pub fn initialise_with_stack_transformations(&mut self, stack_poses: &[RigidTransform]) {
        let stack_index = &self.stack_index;
        self.transformations
            .par_iter_mut()
            .zip(stack_index.par_iter())
            .for_each(|(t, &s)| {
                *t = stack_poses[s].clone();
            });
    }

    /// 按 mask ROI 对切片做 padding 化:
    /// 值低于 0.01 或位姿变换后落在 mask 之外的像素置为 -1.
    pub fn mask_slices(&mut self, mask: &VoxelGrid, ffd: bool) {
        let transformations = &self.transformations;
        let ffd_transformations = &self.ffd_transformations;
        self.slices
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, slice)| {
                let geom = slice.geom().clone();
                let (ny, nx) = (geom.ny(), geom.nx());
                let mut plane = slice.plane_mut();
                for y in 0..ny {
                    for x in 0..nx {
                        if plane[(y, x)] < 0.01 {
                            plane[(y, x)] = PADDING;
                            continue;
                        }
                        let w = geom.image_to_world([x as f64, y as f64, 0.0]);
                        let w = if ffd {
                            ffd_transformations[idx].transform_point(w)
                        } else {
                            transformations[idx].transform_point(w)
                        };
                        let p = mask.geom().world_to_image(w);
                        match mask.geom().contains_rounded(p) {
                            Some(i3) if mask[i3] != 0.0 => {}
                            _ => plane[(y, x)] = PADDING,
                        }
                    }
                }
            });
    }

    /// 用逐堆叠强度因子恢复切片原始强度 (强度匹配的逆操作).
    pub fn restore_slice_intensities(&mut self, stack_factor: &[f64]) {
        let stack_index = &self.stack_index;
        self.slices
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, slice)| {
                let factor = stack_factor[stack_index[idx]];
                for v in slice.data_mut().iter_mut() {
                    if *v > 0.0 {
                        *v /= factor as f32;
                    }
                }
            });
    }

    /// FFD 模式下为每张切片准备恒等形变 (覆盖已有 FFD).
    pub fn init_ffd_transformations(&mut self, domain: &crate::geom::ImageGeometry, cp_spacing: f64) {
        self.ffd_transformations = (0..self.len())
            .map(|_| FreeFormTransform::identity(domain, cp_spacing))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::ImageGeometry;

    fn two_stacks() -> (Vec<VoxelGrid>, Vec<RigidTransform>) {
        let g = ImageGeometry::axial((3, 4, 4), [1.0, 1.0, 2.0], [0.0; 3]);
        let mut a = VoxelGrid::filled(g.clone(), 50.0);
        a.set(0, 0, 0, -1.0);
        let b = VoxelGrid::filled(g, 80.0);
        (
            vec![a, b],
            vec![
                RigidTransform::identity(),
                RigidTransform::from_translation(1.0, 0.0, 0.0),
            ],
        )
    }

    #[test]
    fn test_create_from_stacks() {
        let (stacks, poses) = two_stacks();
        let mut store = SliceStore::new();
        store.create_from_stacks(
            &stacks,
            &poses,
            &[3.0, 3.0],
            &[2, 1],
            None,
            &CreateSlicesOptions::default(),
        );
        assert_eq!(store.len(), 6);
        assert_eq!(store.stack_index, vec![0, 0, 0, 1, 1, 1]);
        // 第一个堆叠 2 个 package: z 位置轮转 0, 1, 0.
        assert_eq!(store.package_index[..3], [0, 1, 0]);
        assert_eq!(store.slice_pos, vec![0, 1, 2, 0, 1, 2]);
        // 层厚覆写.
        assert!((store.slices[0].geom().dz() - 3.0).abs() < 1e-12);
        // 切片位姿继承堆叠位姿.
        assert!((store.transformations[3].tx() - 1.0).abs() < 1e-12);
        assert!((store.average_thickness_org - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_excluded_entirely() {
        let (stacks, poses) = two_stacks();
        let mut store = SliceStore::new();
        let options = CreateSlicesOptions {
            excluded_entirely: vec![1],
            ..Default::default()
        };
        store.create_from_stacks(&stacks, &poses, &[3.0, 3.0], &[1, 1], None, &options);
        assert_eq!(store.len(), 4);
        assert_eq!(store.slice_pos, vec![0, 2, 0, 2]);
    }

    /// mask 之外与低亮度像素应被置为 padding.
    #[test]
    fn test_mask_slices() {
        let (stacks, poses) = two_stacks();
        let mut store = SliceStore::new();
        store.create_from_stacks(
            &stacks,
            &poses,
            &[2.0, 2.0],
            &[1, 1],
            None,
            &CreateSlicesOptions::default(),
        );

        // mask 与堆叠同几何, 只有 x < 2 的一半为 1.
        let g = stacks[0].geom().clone();
        let mut mask = VoxelGrid::zeros(g);
        for z in 0..3 {
            for y in 0..4 {
                for x in 0..2 {
                    mask.set(x, y, z, 1.0);
                }
            }
        }
        store.initialise_with_stack_transformations(&[
            RigidTransform::identity(),
            RigidTransform::identity(),
        ]);
        store.mask_slices(&mask, false);

        let s0 = &store.slices[0];
        assert_eq!(s0.at(0, 0, 0), PADDING); // 原 padding 像素
        assert_eq!(s0.at(1, 0, 0), 50.0); // mask 内
        assert_eq!(s0.at(3, 0, 0), PADDING); // mask 外
    }

    #[test]
    fn test_restore_intensities() {
        let (stacks, poses) = two_stacks();
        let mut store = SliceStore::new();
        store.create_from_stacks(
            &stacks,
            &poses,
            &[2.0, 2.0],
            &[1, 1],
            None,
            &CreateSlicesOptions::default(),
        );
        store.restore_slice_intensities(&[2.0, 4.0]);
        assert_eq!(store.slices[0].at(1, 0, 0), 25.0);
        assert_eq!(store.slices[3].at(1, 0, 0), 20.0);
        // padding 不受影响.
        assert_eq!(store.slices[0].at(0, 0, 0), PADDING);
    }
}
