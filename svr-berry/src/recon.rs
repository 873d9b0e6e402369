//! 重建流水线控制器.
//!
//! [`Reconstruction`] 拥有全部共享状态 (体积、mask、切片仓库、
//! 系数、EM 状态与超参数), 并按固定相序推进一次外层迭代:
//! 位姿 → 系数 → 模拟 → EM → 超分辨率 → 正则化 → (bias).
//!
//! # 错误策略
//!
//! 配置类契约违规 (模板未创建、尺寸不一致) 直接 panic;
//! 数据类错误 (堆叠与 ROI 无交) 与 I/O 失败以 [`ReconError`]
//! 返回并携带肇事下标. EM 数值退化在内部以文档化的回退值恢复.

use crate::coeff::{coeff_init, CoeffStore};
use crate::consts::{default, ACTIVE_EPS, PADDING, SIM_WEIGHT_MIN, SMALL_SLICE_RATIO};
use crate::data::{
    blur_grid, blur_grid_padded, resample_with_padding, transform_mask, ImgWriteVis, VoxelGrid,
};
use crate::em::{self, RobustStats};
use crate::geom::RigidTransform;
use crate::quality::{self, IterationReport, QualityReport};
use crate::register::{self, Registrar};
use crate::simulate::simulate_slices;
use crate::sr;
use crate::store::{CreateSlicesOptions, SliceStore};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 重建超参数.
///
/// `lambda` 与 `alpha` 由 [`SvrParams::set_smoothing`] 从用户给出的
/// (δ, λ) 推导: 内部 `lambda = λ·δ²`, `alpha = min(1, 0.05·δ²/λ)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SvrParams {
    /// 正则化边缘敏感度 δ.
    pub delta: f64,

    /// 内部正则化强度 (已含 δ² 因子).
    pub lambda: f64,

    /// 超分辨率步长 α.
    pub alpha: f64,

    /// 切片/体积 bias 平滑的高斯标准差 (毫米).
    pub sigma_bias: f64,

    /// 全局 bias 校正的低亮度截断比例.
    pub low_intensity_cutoff: f64,

    /// 结构化剔除的 NCC 门限.
    pub global_ncc_threshold: f64,

    /// 外部配准的 NMI 直方图 bin 数 (None 表示交给优化器默认).
    pub nmi_bins: Option<usize>,

    /// 自适应正则化 (κ 保留为真实置信度).
    pub adaptive: bool,

    /// 每轮结束做全局 bias 校正.
    pub global_bias_correction: bool,

    /// 逐切片运动采用 FFD 模型.
    pub ffd: bool,

    /// FFD 控制点间距 (毫米).
    pub cp_spacing: f64,

    /// 切片创建时的二维高斯预滤波.
    pub blurring: bool,

    /// 每轮迭代后运行结构化剔除.
    pub structural: bool,
}

impl Default for SvrParams {
    fn default() -> Self {
        let mut p = Self {
            delta: default::DELTA,
            lambda: default::LAMBDA,
            alpha: 0.0,
            sigma_bias: default::SIGMA_BIAS_MM,
            low_intensity_cutoff: default::LOW_INTENSITY_CUTOFF,
            global_ncc_threshold: default::GLOBAL_NCC_THRESHOLD,
            nmi_bins: None,
            adaptive: false,
            global_bias_correction: false,
            ffd: false,
            cp_spacing: 10.0,
            blurring: false,
            structural: false,
        };
        p.set_smoothing(default::DELTA, default::LAMBDA);
        p
    }
}

impl SvrParams {
    /// 由用户口径的 (δ, λ) 设置平滑参数.
    pub fn set_smoothing(&mut self, delta: f64, lambda: f64) {
        assert!(delta > 0.0 && lambda > 0.0, "平滑参数必须为正");
        self.delta = delta;
        self.lambda = lambda * delta * delta;
        self.alpha = (0.05 / lambda * delta * delta).min(1.0);
    }
}

/// 重建运行期错误.
#[derive(Debug, Clone)]
pub enum ReconError {
    /// 堆叠与 mask ROI 无重叠, 携带堆叠下标.
    EmptyStackOverlap(usize),

    /// 交换文件或产物的 I/O 失败.
    Io(String),
}

impl fmt::Display for ReconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyStackOverlap(i) => {
                write!(f, "Stack {i} has no overlap with ROI")
            }
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ReconError {}

impl From<std::io::Error> for ReconError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<nifti::NiftiError> for ReconError {
    fn from(e: nifti::NiftiError) -> Self {
        Self::Io(e.to_string())
    }
}

/// 重建流水线.
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    /// 超参数.
    pub params: SvrParams,

    /// 切片仓库.
    pub store: SliceStore,

    volume: Option<VoxelGrid>,
    mask: Option<VoxelGrid>,
    coeffs: Option<CoeffStore>,
    confidence_map: Option<VoxelGrid>,
    state: RobustStats,
    force_excluded: Vec<usize>,
    small_slices: Vec<usize>,
    stack_factor: Vec<f64>,
    average_value: f64,
}

impl Reconstruction {
    /// 以给定超参数构建空流水线.
    pub fn new(params: SvrParams) -> Self {
        Self {
            params,
            state: RobustStats::default(),
            ..Default::default()
        }
    }

    /// 当前重建体积. 模板尚未创建时 panic.
    #[inline]
    pub fn volume(&self) -> &VoxelGrid {
        self.volume
            .as_ref()
            .expect("请先创建模板, 再进行几何相关操作")
    }

    /// 当前 mask. 尚未设置时 panic.
    #[inline]
    pub fn mask(&self) -> &VoxelGrid {
        self.mask.as_ref().expect("请先设置 mask")
    }

    /// 模板是否已创建.
    #[inline]
    pub fn template_created(&self) -> bool {
        self.volume.is_some()
    }

    /// 置信度图 (最近一次超分辨率更新的 κ).
    #[inline]
    pub fn confidence_map(&self) -> Option<&VoxelGrid> {
        self.confidence_map.as_ref()
    }

    /// EM 状态量 (只读).
    #[inline]
    pub fn robust_stats(&self) -> &RobustStats {
        &self.state
    }

    /// 小切片清单 (Gaussian 重建时标记).
    #[inline]
    pub fn small_slices(&self) -> &[usize] {
        &self.small_slices
    }

    /// 逐堆叠强度因子 `φ_k`.
    #[inline]
    pub fn stack_factors(&self) -> &[f64] {
        &self.stack_factor
    }

    /// 追加强制剔除的切片. 剔除清单在一次运行内只增不减.
    pub fn exclude_slices(&mut self, slices: &[usize]) {
        for &i in slices {
            if !self.force_excluded.contains(&i) {
                self.force_excluded.push(i);
            }
        }
    }

    // ------------------------------------------------------------------
    // 模板与 mask
    // ------------------------------------------------------------------

    /// 以模板堆叠创建各向同性重建体积, 返回实际采用的分辨率.
    ///
    /// `resolution <= 0` 时取模板体素间距的最小分量.
    pub fn create_template(&mut self, stack: &VoxelGrid, resolution: f64) -> f64 {
        let d = if resolution <= 0.0 {
            let [dx, dy, dz] = stack.geom().spacing();
            dx.min(dy).min(dz)
        } else {
            resolution
        };
        log::info!("Reconstructed volume voxel size : {d} mm");

        let (smin, _) = stack.min_max();
        let volume = if smin < -0.1 {
            resample_with_padding(stack, d, -0.5, PADDING)
        } else if smin < 0.1 {
            resample_with_padding(stack, d, 0.0, 0.0)
        } else {
            resample_with_padding(stack, d, f32::MIN, 0.0)
        };
        self.volume = Some(volume);
        d
    }

    /// 以模板堆叠的原始各向异性几何直接初始化体积.
    pub fn create_template_aniso(&mut self, stack: &VoxelGrid) -> f64 {
        let [dx, dy, dz] = stack.geom().spacing();
        log::info!("Constructing volume with anisotropic voxel size {dx} {dy} {dz}");
        self.volume = Some(stack.clone());
        dx
    }

    /// 把给定图像重采样到当前模板几何并作为体积.
    pub fn set_template(&mut self, template: &VoxelGrid) {
        let geom = self.volume().geom().clone();
        self.volume = Some(crate::data::resample_onto(template, &geom, -0.5, 0.0));
    }

    /// 二值化 mask: 大于 `threshold` 为 1, 否则 0.
    pub fn create_mask(mut image: VoxelGrid, threshold: f32) -> VoxelGrid {
        for v in image.data_mut().iter_mut() {
            *v = if *v > threshold { 1.0 } else { 0.0 };
        }
        image
    }

    /// 归一化后按比例阈值二值化 mask.
    pub fn threshold_normalised_mask(mut image: VoxelGrid, threshold: f32) -> VoxelGrid {
        let (_, max) = image.min_max();
        if max > 0.0 {
            for v in image.data_mut().iter_mut() {
                *v /= max;
            }
        }
        Self::create_mask(image, threshold)
    }

    /// 设置重建 mask.
    ///
    /// 模板必须已创建 (否则无法重采样到模板网格, panic).
    /// `mask` 为 `None` 时 ROI 取全体积; `sigma > 0` 时先平滑再以
    /// `threshold` 二值化.
    pub fn set_mask(&mut self, mask: Option<&VoxelGrid>, sigma: f64, threshold: f32) {
        assert!(
            self.template_created(),
            "请先创建模板, 以便把 mask 重采样到正确的网格"
        );
        let geom = self.volume().geom().clone();

        let m = match mask {
            None => VoxelGrid::filled(geom.clone(), 1.0),
            Some(raw) => {
                let mut m = raw.clone();
                if sigma > 0.0 {
                    let sv = [
                        sigma / m.geom().dx(),
                        sigma / m.geom().dy(),
                        sigma / m.geom().dz(),
                    ];
                    blur_grid(&mut m, sv);
                    m = Self::create_mask(m, threshold);
                }
                transform_mask(&m, &RigidTransform::identity(), &geom)
            }
        };

        let roi_voxels = m.data().iter().filter(|v| **v > 0.1).count();
        let vol_cc = roi_voxels as f64 * geom.voxel_volume() / 1000.0;
        log::info!("ROI volume : {vol_cc} cc");
        self.mask = Some(m);
    }

    /// 把 mask 之外的体素置为 padding.
    pub fn mask_volume(&mut self) {
        let mask = self.mask.as_ref().expect("请先设置 mask");
        let volume = self.volume.as_mut().expect("请先创建模板");
        for (v, &m) in volume.data_mut().iter_mut().zip(mask.data().iter()) {
            if m == 0.0 {
                *v = PADDING;
            }
        }
    }

    /// 把 mask 之外的体素置为给定 padding 值. 尺寸不一致时 panic.
    pub fn mask_image(&self, image: &mut VoxelGrid, padding: f32) {
        let mask = self.mask();
        assert_eq!(
            image.shape(),
            mask.shape(),
            "无法掩膜: 图像与 mask 尺寸不一致"
        );
        for (v, &m) in image.data_mut().iter_mut().zip(mask.data().iter()) {
            if m == 0.0 {
                *v = padding;
            }
        }
    }

    // ------------------------------------------------------------------
    // 强度匹配
    // ------------------------------------------------------------------

    /// 堆叠强度匹配: 每个堆叠在 mask ROI 内的均值被拉到
    /// `average_value` (`together` 时以全体均值统一缩放).
    /// 因子记入 `φ_k`, 供之后恢复原始强度.
    pub fn match_stack_intensities(
        &mut self,
        stacks: &mut [VoxelGrid],
        stack_poses: &[RigidTransform],
        average_value: f64,
        together: bool,
    ) -> Result<(), ReconError> {
        let mask = self.mask.as_ref();
        self.average_value = average_value;

        let mut stack_average = Vec::with_capacity(stacks.len());
        for (ind, stack) in stacks.iter().enumerate() {
            let (nz, ny, nx) = stack.shape();
            let mut sum = 0.0f64;
            let mut num = 0usize;
            for z in 0..nz {
                for y in 0..ny {
                    for x in 0..nx {
                        let v = stack.at(x, y, z);
                        if v <= 0.0 {
                            continue;
                        }
                        let inside = match mask {
                            None => true,
                            Some(m) => {
                                let w = stack
                                    .geom()
                                    .image_to_world([x as f64, y as f64, z as f64]);
                                let p = m.geom().world_to_image(
                                    stack_poses[ind].transform_point(w),
                                );
                                matches!(m.geom().contains_rounded(p), Some(i3) if m[i3] == 1.0)
                            }
                        };
                        if inside {
                            sum += v as f64;
                            num += 1;
                        }
                    }
                }
            }
            if num == 0 {
                return Err(ReconError::EmptyStackOverlap(ind));
            }
            stack_average.push(sum / num as f64);
        }

        let global_average = stack_average.iter().sum::<f64>() / stack_average.len() as f64;
        log::debug!("Stack average intensities are {stack_average:?}");

        self.stack_factor.clear();
        for (ind, stack) in stacks.iter_mut().enumerate() {
            let factor = average_value / if together { global_average } else { stack_average[ind] };
            self.stack_factor.push(factor);
            for v in stack.data_mut().iter_mut() {
                if *v > 0.0 {
                    *v *= factor as f32;
                }
            }
        }
        log::debug!("Stack intensity factors are {:?}", self.stack_factor);
        Ok(())
    }

    /// 以 `φ_k` 恢复切片原始强度.
    pub fn restore_slice_intensities(&mut self) {
        self.store.restore_slice_intensities(&self.stack_factor);
    }

    /// 以切片与模拟的一致性对体积做单次全局缩放.
    pub fn scale_volume(&mut self) {
        let mut scalenum = 0.0f64;
        let mut scaleden = 0.0f64;
        for idx in 0..self.store.len() {
            let slice = self.store.slices[idx].plane();
            let sim = self.store.simulated_slices[idx].plane();
            let sim_w = self.store.simulated_weights[idx].plane();
            let w = self.store.weights[idx].plane();
            let sw = self.store.slice_weight[idx];
            for ((&v, &wv), (&mv, &swv)) in slice
                .iter()
                .zip(w.iter())
                .zip(sim.iter().zip(sim_w.iter()))
            {
                if v != PADDING && swv > SIM_WEIGHT_MIN {
                    scalenum += wv as f64 * sw * v as f64 * mv as f64;
                    scaleden += wv as f64 * sw * (mv as f64) * (mv as f64);
                }
            }
        }

        let scale = if scaleden > 0.0 { scalenum / scaleden } else { 1.0 };
        log::debug!("Volume scale : {scale}");
        let volume = self.volume.as_mut().expect("请先创建模板");
        for v in volume.data_mut().iter_mut() {
            if *v > 0.0 {
                *v *= scale as f32;
            }
        }
    }

    // ------------------------------------------------------------------
    // 切片创建
    // ------------------------------------------------------------------

    /// 从输入堆叠创建切片 (透传 [`SliceStore::create_from_stacks`],
    /// 预滤波开关取自超参数), FFD 模式下同时准备恒等形变.
    pub fn create_slices(
        &mut self,
        stacks: &[VoxelGrid],
        stack_poses: &[RigidTransform],
        thickness: &[f64],
        packages: &[usize],
        probability_maps: Option<&[VoxelGrid]>,
        excluded_entirely: &[usize],
    ) {
        let options = CreateSlicesOptions {
            blurring: self.params.blurring,
            excluded_entirely: excluded_entirely.to_vec(),
        };
        self.store.create_from_stacks(
            stacks,
            stack_poses,
            thickness,
            packages,
            probability_maps,
            &options,
        );
        if self.params.ffd {
            let geom = self.volume().geom().clone();
            self.store.init_ffd_transformations(&geom, self.params.cp_spacing);
        }
    }

    /// 按当前位姿把切片掩膜到 ROI.
    pub fn mask_slices(&mut self) {
        let mask = self.mask.as_ref().expect("请先设置 mask").clone();
        self.store.mask_slices(&mask, self.params.ffd);
    }

    /// 按堆叠位姿把整个堆叠掩膜到 ROI:
    /// 低亮度体素与 mask 之外的体素置为 padding.
    pub fn mask_stacks(&self, stacks: &mut [VoxelGrid], stack_poses: &[RigidTransform]) {
        let Some(mask) = self.mask.as_ref() else {
            log::warn!("Could not mask stacks because no mask has been set");
            return;
        };
        for (stack, pose) in stacks.iter_mut().zip(stack_poses.iter()) {
            let geom = stack.geom().clone();
            let (nz, ny, nx) = geom.shape();
            for z in 0..nz {
                for y in 0..ny {
                    for x in 0..nx {
                        if stack.at(x, y, z) < 0.01 {
                            stack.set(x, y, z, PADDING);
                            continue;
                        }
                        let w = geom.image_to_world([x as f64, y as f64, z as f64]);
                        let p = mask.geom().world_to_image(pose.transform_point(w));
                        match mask.geom().contains_rounded(p) {
                            Some(i3) if mask[i3] != 0.0 => {}
                            _ => stack.set(x, y, z, PADDING),
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // 系数 / 模拟 / 初始化
    // ------------------------------------------------------------------

    /// 重建系数矩阵与体积权重.
    pub fn coeff_init(&mut self) {
        let volume_geom = self.volume().geom().clone();
        let mask = self.mask.as_ref().expect("请先设置 mask").clone();
        let coeffs = coeff_init(
            &mut self.store,
            &volume_geom,
            &mask,
            &self.force_excluded,
            self.params.ffd,
        );
        self.coeffs = Some(coeffs);
    }

    /// 当前系数存储. 尚未构建时 panic.
    #[inline]
    pub fn coeffs(&self) -> &CoeffStore {
        self.coeffs.as_ref().expect("请先运行 coeff_init")
    }

    /// Gaussian 重建 (初始化体积), 并标记小切片.
    ///
    /// 覆盖体素数低于中位数 10% 的切片被记入小切片清单,
    /// 其势能在每次 EStep 中被强制为 -1.
    pub fn gaussian_reconstruction(&mut self) {
        let coeffs = self.coeffs.as_ref().expect("请先运行 coeff_init");
        assert_eq!(
            self.store.bias.len(),
            self.store.len(),
            "请先运行 initialize_em 分配逐切片 bias/权重"
        );
        let volume = self.volume.as_mut().expect("请先创建模板");
        volume.fill(0.0);

        let mut voxel_num: Vec<Option<usize>> = Vec::with_capacity(self.store.len());
        {
            let flat = volume.data_mut().into_slice().expect("标准布局");
            for idx in 0..self.store.len() {
                if self.force_excluded.contains(&idx) {
                    voxel_num.push(None);
                    continue;
                }
                let sc = &coeffs.per_slice[idx];
                let slice = self.store.slices[idx].plane();
                let b = self.store.bias[idx].plane();
                let scale = self.store.scale[idx];
                let (ny, nx) = (
                    self.store.slices[idx].geom().ny(),
                    self.store.slices[idx].geom().nx(),
                );
                let mut count = 0usize;
                for y in 0..ny {
                    for x in 0..nx {
                        if slice[(y, x)] <= ACTIVE_EPS {
                            continue;
                        }
                        let corrected =
                            slice[(y, x)] as f64 * (-b[(y, x)] as f64).exp() * scale;
                        let entries = sc.pixel(x, y);
                        if !entries.is_empty() {
                            count += 1;
                        }
                        for e in entries {
                            flat[e.voxel as usize] += (e.value as f64 * corrected) as f32;
                        }
                    }
                }
                voxel_num.push(Some(count));
            }
        }

        // 按体积权重归一.
        for (v, &w) in volume
            .data_mut()
            .iter_mut()
            .zip(coeffs.volume_weights.data().iter())
        {
            if w > 0.0 {
                *v /= w;
            }
        }

        // 小切片检测: 中位数的 10% 以下.
        let mut counts: Vec<usize> = voxel_num.iter().flatten().copied().collect();
        if counts.is_empty() {
            self.small_slices.clear();
            return;
        }
        let mid = ((counts.len() as f64 * 0.5).round() as usize).saturating_sub(1);
        let (_, median, _) = counts.select_nth_unstable(mid);
        let median = *median;

        self.small_slices = voxel_num
            .iter()
            .enumerate()
            .filter_map(|(i, &n)| {
                n.filter(|&c| (c as f64) < SMALL_SLICE_RATIO * median as f64)
                    .map(|_| i)
            })
            .collect();
        log::debug!("Small slices: {:?}", self.small_slices);
    }

    /// 前向模拟全部切片.
    pub fn simulate_slices(&mut self) {
        let coeffs = self.coeffs.as_ref().expect("请先运行 coeff_init");
        let volume = self.volume.as_ref().expect("请先创建模板");
        let mask = self.mask.as_ref().expect("请先设置 mask");
        simulate_slices(&mut self.store, coeffs, volume, mask);
    }

    /// EM 分配与初始化三连 (分配、复位、初始统计).
    pub fn initialize_em(&mut self) {
        em::initialize_em(&mut self.store, &mut self.state);
    }

    /// 复位 EM 的逐切片量.
    pub fn initialize_em_values(&mut self) {
        em::initialize_em_values(&mut self.store, &self.force_excluded);
    }

    /// 由当前模拟初始化鲁棒统计.
    pub fn initialize_robust_statistics(&mut self) {
        em::initialize_robust_statistics(&mut self.store, &mut self.state, &self.force_excluded);
    }

    /// E 步.
    pub fn e_step(&mut self) -> Vec<f64> {
        em::e_step(
            &mut self.store,
            &mut self.state,
            &self.force_excluded,
            &self.small_slices,
        )
    }

    /// M 步.
    pub fn m_step(&mut self, iter: usize) {
        em::m_step(&self.store, &mut self.state, iter);
    }

    /// 逐切片 scale 更新.
    pub fn scale(&mut self) {
        em::scale_step(&mut self.store);
    }

    /// 逐切片 bias 更新.
    pub fn bias(&mut self) {
        em::bias_step(&mut self.store, self.params.sigma_bias);
    }

    // ------------------------------------------------------------------
    // 超分辨率
    // ------------------------------------------------------------------

    /// 一次超分辨率更新: 残差回投、步进、钳制、自适应正则化,
    /// 以及可选的全局 bias 校正.
    pub fn superresolution(&mut self, _iter: usize) {
        let coeffs = self.coeffs.as_ref().expect("请先运行 coeff_init");
        let original = self.volume().clone();

        sr::slice_difference(&mut self.store);
        let volume_geom = original.geom().clone();
        let (mut addon, mut confidence) =
            sr::superresolution_addon(&self.store, coeffs, &volume_geom);
        if !self.params.adaptive {
            sr::normalize_addon(&mut addon, &mut confidence);
        }

        let volume = self.volume.as_mut().expect("请先创建模板");
        let alpha = self.params.alpha;
        for (v, &a) in volume.data_mut().iter_mut().zip(addon.data().iter()) {
            *v += (alpha * a as f64) as f32;
        }
        sr::clamp_intensities(volume, self.state.min_intensity, self.state.max_intensity);

        sr::adaptive_regularization(
            volume,
            &original,
            &confidence,
            self.params.alpha,
            self.params.lambda,
            self.params.delta,
        );

        if self.params.global_bias_correction {
            let mask = self.mask.as_ref().expect("请先设置 mask");
            sr::bias_correct_volume(
                volume,
                &original,
                mask,
                self.params.sigma_bias,
                self.params.low_intensity_cutoff,
                self.state.min_intensity,
                self.state.max_intensity,
            );
        }
        self.confidence_map = Some(confidence);
    }

    /// 切片 bias 的全局归一.
    pub fn normalise_bias(&mut self, _iter: usize) {
        let coeffs = self.coeffs.as_ref().expect("请先运行 coeff_init");
        let mask = self.mask.as_ref().expect("请先设置 mask").clone();
        let volume = self.volume.as_mut().expect("请先创建模板");
        sr::normalise_bias(&self.store, coeffs, volume, &mask, self.params.sigma_bias);
    }

    // ------------------------------------------------------------------
    // 配准调度
    // ------------------------------------------------------------------

    /// 堆叠到模板的全局配准.
    pub fn stack_registrations(
        &self,
        registrar: &dyn Registrar,
        stacks: &[VoxelGrid],
        stack_poses: &mut [RigidTransform],
        template: &VoxelGrid,
        template_index: Option<usize>,
    ) {
        register::stack_registrations(
            registrar,
            stacks,
            stack_poses,
            template,
            template_index,
            self.mask(),
        );
    }

    /// 逐切片 SVR.
    pub fn slice_to_volume_registration(&mut self, registrar: &dyn Registrar) {
        let volume = self.volume.as_ref().expect("请先创建模板").clone();
        register::slice_to_volume_registration(
            registrar,
            &mut self.store,
            &volume,
            self.params.ffd,
        );
    }

    /// package 到体积配准.
    pub fn package_to_volume(
        &mut self,
        registrar: &dyn Registrar,
        stacks: &[VoxelGrid],
        metas: &[register::PackageMeta],
    ) {
        let volume = self.volume.as_ref().expect("请先创建模板").clone();
        register::package_to_volume(registrar, &mut self.store, &volume, stacks, metas);
    }

    /// NCC 结构化剔除. 返回被门控的切片清单.
    pub fn structural_exclusion(&mut self) -> Vec<usize> {
        let volume = self.volume.as_ref().expect("请先创建模板").clone();
        let mask = self.mask.as_ref().expect("请先设置 mask").clone();
        register::structural_exclusion(
            &mut self.store,
            &volume,
            &mask,
            self.params.global_ncc_threshold,
        )
    }

    // ------------------------------------------------------------------
    // 外层迭代
    // ------------------------------------------------------------------

    /// 推进一次外层迭代.
    ///
    /// `iter` 为外层迭代序号 (0 起); 首轮跳过 SVR 并初始化鲁棒
    /// 统计. `sr_rounds` 为内层 EM+SR 轮数.
    pub fn outer_iteration(&mut self, registrar: &dyn Registrar, iter: usize, sr_rounds: usize) {
        if iter > 0 {
            self.slice_to_volume_registration(registrar);
            if self.params.structural {
                self.structural_exclusion();
            }
        }

        self.coeff_init();
        self.gaussian_reconstruction();
        self.simulate_slices();

        if iter == 0 {
            self.initialize_robust_statistics();
        }
        self.initialize_em_values();
        self.e_step();

        for j in 0..sr_rounds {
            if self.params.sigma_bias > 0.0 {
                self.bias();
            }
            self.scale();
            self.superresolution(j + 1);
            if self.params.sigma_bias > 0.0 && !self.params.global_bias_correction {
                self.normalise_bias(j);
            }
            self.simulate_slices();
            self.m_step(j + 1);
            self.e_step();
        }

        quality::evaluate(&self.store, iter);
    }

    // ------------------------------------------------------------------
    // 质量与产物
    // ------------------------------------------------------------------

    /// 当前迭代的质量指标.
    pub fn quality_report(&self) -> QualityReport {
        let avg = self
            .coeffs
            .as_ref()
            .map(|c| c.average_volume_weight)
            .unwrap_or(0.0);
        quality::recon_quality_report(&self.store, avg)
    }

    /// included/excluded/outside 清单.
    pub fn evaluate(&self, iter: usize) -> IterationReport {
        quality::evaluate(&self.store, iter)
    }

    /// CSV 逐切片汇总.
    pub fn save_slice_info(
        &self,
        stack_names: &[String],
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), ReconError> {
        quality::save_slice_info(&self.store, stack_names, path)?;
        Ok(())
    }

    /// 把逐切片 bias 场导出为灰度 PNG.
    pub fn save_bias_fields(&self, dir: impl AsRef<std::path::Path>) -> Result<(), ReconError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        for (i, b) in self.store.bias.iter().enumerate() {
            b.save_vis(dir.join(format!("bias{i}.png")))
                .map_err(|e| ReconError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// 把逐切片体素权重导出为灰度 PNG.
    pub fn save_weights(&self, dir: impl AsRef<std::path::Path>) -> Result<(), ReconError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        for (i, w) in self.store.weights.iter().enumerate() {
            w.save_vis(dir.join(format!("weights{i}.png")))
                .map_err(|e| ReconError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// 把模拟切片导出为灰度 PNG.
    pub fn save_simulated_slices(
        &self,
        dir: impl AsRef<std::path::Path>,
    ) -> Result<(), ReconError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        for (i, s) in self.store.simulated_slices.iter().enumerate() {
            s.save_vis(dir.join(format!("simslice{i}.png")))
                .map_err(|e| ReconError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// 把置信度图写为 nii.gz.
    pub fn save_confidence_map(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), ReconError> {
        if let Some(c) = &self.confidence_map {
            c.save(path)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 堆叠预处理
    // ------------------------------------------------------------------

    /// 背景滤波: 前景/背景双尺度高斯高通.
    ///
    /// 滤波结果非正的像素置 1, 保证下游 log/exp 数值稳定.
    pub fn background_filtering(stacks: &mut [VoxelGrid], fg_sigma: f64, bg_sigma: f64) {
        for stack in stacks.iter_mut() {
            let dx = stack.geom().dx();
            let mut global_blurred = stack.clone();
            blur_grid(
                &mut global_blurred,
                [bg_sigma, bg_sigma, bg_sigma * dx / stack.geom().dz()],
            );

            let nz = stack.shape().0;
            for z in 0..nz {
                let mut fg = stack.extract_slice(z, stack.geom().dz());
                let mut bg = fg.clone();
                blur_grid_padded(&mut fg, [fg_sigma, fg_sigma, 0.0], f32::MIN);
                blur_grid_padded(&mut bg, [bg_sigma, bg_sigma, 0.0], f32::MIN);

                let (ny, nx) = (stack.geom().ny(), stack.geom().nx());
                for y in 0..ny {
                    for x in 0..nx {
                        let mut v = fg.at(x, y, 0) + global_blurred.at(x, y, z) - bg.at(x, y, 0);
                        if v <= 0.0 {
                            v = 1.0;
                        }
                        stack.set(x, y, z, v);
                    }
                }
            }
        }
    }

    /// 把图像正值线性拉伸到 `[0, max]`.
    pub fn rescale(image: &mut VoxelGrid, max: f64) {
        let (_, old_max) = image.min_max();
        if old_max <= 0.0 {
            return;
        }
        for v in image.data_mut().iter_mut() {
            if *v > 0.0 {
                *v = (*v as f64 / old_max as f64 * max) as f32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::ImageGeometry;
    use crate::register::IdentityRegistrar;

    /// 常值立方体 phantom: 构造一个指定朝向的堆叠,
    /// 在 |world|∞ < 8 的区域取 100, 其余为 0.
    fn cube_stack(axes: [[f64; 3]; 3], shape: (usize, usize, usize), spacing: [f64; 3]) -> VoxelGrid {
        let g = ImageGeometry::new(shape, spacing, [0.0; 3], axes);
        let mut s = VoxelGrid::zeros(g);
        let (nz, ny, nx) = shape;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let w = s.geom().image_to_world([x as f64, y as f64, z as f64]);
                    if w.iter().all(|c| c.abs() < 8.0) {
                        s.set(x, y, z, 100.0);
                    }
                }
            }
        }
        s
    }

    /// 三个正交堆叠.
    fn orthogonal_stacks() -> Vec<VoxelGrid> {
        let id = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let swap_yz = [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]];
        let swap_xz = [[0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]];
        vec![
            cube_stack(id, (8, 24, 24), [1.0, 1.0, 3.0]),
            cube_stack(swap_yz, (8, 24, 24), [1.0, 1.0, 3.0]),
            cube_stack(swap_xz, (8, 24, 24), [1.0, 1.0, 3.0]),
        ]
    }

    #[test]
    #[should_panic(expected = "请先创建模板")]
    fn test_volume_requires_template() {
        let recon = Reconstruction::default();
        let _ = recon.volume();
    }

    /// 模板分辨率选择: 显式给出与自动取最小间距.
    #[test]
    fn test_create_template_resolution() {
        let stack = cube_stack(
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            (8, 24, 24),
            [1.0, 1.0, 3.0],
        );
        let mut recon = Reconstruction::default();
        assert_eq!(recon.create_template(&stack, 1.0), 1.0);
        assert_eq!(recon.volume().shape(), (24, 24, 24));

        let mut recon2 = Reconstruction::default();
        assert_eq!(recon2.create_template(&stack, 0.0), 1.0);
    }

    /// 无重叠堆叠应报出肇事下标.
    #[test]
    fn test_intensity_matching_no_overlap() {
        let stack = cube_stack(
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            (8, 24, 24),
            [1.0, 1.0, 3.0],
        );
        let mut recon = Reconstruction::default();
        recon.create_template(&stack, 1.0);
        recon.set_mask(None, 0.0, 0.5);

        // 第二个堆叠平移出 ROI.
        let mut stacks = vec![stack.clone(), stack];
        let poses = vec![
            RigidTransform::identity(),
            RigidTransform::from_translation(1000.0, 0.0, 0.0),
        ];
        let err = recon
            .match_stack_intensities(&mut stacks, &poses, 700.0, false)
            .unwrap_err();
        assert!(matches!(err, ReconError::EmptyStackOverlap(1)));
    }

    /// 强度匹配因子应把 ROI 均值拉到目标值.
    #[test]
    fn test_intensity_matching_factor() {
        let stack = cube_stack(
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            (8, 24, 24),
            [1.0, 1.0, 3.0],
        );
        let mut recon = Reconstruction::default();
        recon.create_template(&stack, 1.0);
        recon.set_mask(None, 0.0, 0.5);
        let mut stacks = vec![stack];
        let poses = vec![RigidTransform::identity()];
        recon
            .match_stack_intensities(&mut stacks, &poses, 700.0, false)
            .unwrap();
        assert!((recon.stack_factors()[0] - 7.0).abs() < 1e-9);
        assert!((stacks[0].at(12, 12, 4) - 700.0).abs() < 1e-3);
    }

    /// 小切片检测: 覆盖像素过少的切片进入清单并在 EStep 中归零.
    #[test]
    fn test_small_slice_detection() {
        let stack = cube_stack(
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            (8, 24, 24),
            [1.0, 1.0, 3.0],
        );
        let mut recon = Reconstruction::default();
        recon.create_template(&stack, 1.0);
        recon.set_mask(None, 0.0, 0.5);
        recon.create_slices(
            &[stack],
            &[RigidTransform::identity()],
            &[3.0],
            &[1],
            None,
            &[],
        );

        // 把切片 0 几乎全部打成 padding, 只留 4 个像素.
        let plane_value: Vec<(usize, usize)> = vec![(11, 11), (11, 12), (12, 11), (12, 12)];
        let mut s0 = recon.store.slices[0].clone();
        s0.fill(PADDING);
        for &(y, x) in &plane_value {
            s0.set(x, y, 0, 100.0);
        }
        recon.store.slices[0] = s0;

        recon.initialize_em();
        recon.initialize_em_values();
        recon.coeff_init();
        recon.gaussian_reconstruction();
        assert!(recon.small_slices().contains(&0), "{:?}", recon.small_slices());

        recon.simulate_slices();
        recon.initialize_robust_statistics();
        recon.e_step();
        assert_eq!(recon.store.slice_weight[0], 0.0);
    }

    /// 端到端: 三个正交的常值立方体堆叠, 无运动, 若干轮迭代后
    /// mask 内均值贴近输入, mask 外为 padding.
    #[test]
    fn test_constant_cube_reconstruction() {
        let stacks = orthogonal_stacks();
        let poses = vec![RigidTransform::identity(); 3];

        let mut params = SvrParams::default();
        params.set_smoothing(150.0, 0.02);
        params.sigma_bias = 12.0;
        let mut recon = Reconstruction::new(params);

        recon.create_template(&stacks[0], 1.0);
        // ROI 取立方体内部 (|world| < 6), 避开边缘.
        let mut mask_img = VoxelGrid::zeros(recon.volume().geom().clone());
        let (nz, ny, nx) = mask_img.shape();
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let w = mask_img
                        .geom()
                        .image_to_world([x as f64, y as f64, z as f64]);
                    if w.iter().all(|c| c.abs() < 6.0) {
                        mask_img.set(x, y, z, 1.0);
                    }
                }
            }
        }
        recon.set_mask(Some(&mask_img), 0.0, 0.5);

        recon.create_slices(&stacks, &poses, &[3.0; 3], &[1; 3], None, &[]);
        recon.initialize_em();

        let registrar = IdentityRegistrar;
        for iter in 0..2 {
            recon.outer_iteration(&registrar, iter, 2);
        }
        recon.mask_volume();

        let volume = recon.volume();
        let mask = recon.mask();
        let mut sum = 0.0f64;
        let mut n = 0usize;
        let mut exterior_ok = true;
        for (&v, &m) in volume.data().iter().zip(mask.data().iter()) {
            if m == 1.0 {
                sum += v as f64;
                n += 1;
            } else if v != PADDING {
                exterior_ok = false;
            }
        }
        let mean = sum / n as f64;
        assert!(
            (mean - 100.0).abs() / 100.0 < 0.02,
            "mask 内均值 {mean} 偏离输入超过 2%"
        );
        assert!(exterior_ok, "mask 外存在非 padding 体素");

        // 质量报告: 无运动场景下模拟一致性应当很高.
        let report = recon.quality_report();
        assert!(report.mean_nrmse < 0.05, "nrmse = {}", report.mean_nrmse);
        assert!(report.excluded_ratio < 0.5);
    }
}
