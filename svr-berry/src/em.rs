//! EM 鲁棒统计: 体素级与切片级的 inlier/outlier 混合模型.
//!
//! 体素级: 残差 `e = s·exp(-B)·S - sim` 服从零均值高斯 (inlier)
//! 与均匀分布 (outlier) 的混合, 后验即体素权重 `w`.
//! 切片级: 切片势能 (加权残差能量) 服从双高斯混合, 后验即切片
//! 权重 `W`. 同时维护每切片的强度 scale 与平滑 bias 场.

use crate::consts::{default, ACTIVE_EPS, SCALE_RANGE, SIM_WEIGHT_MIN};
use crate::data::blur_grid_padded;
use crate::store::SliceStore;
use itertools::izip;
use rayon::prelude::*;

/// 高斯密度, `s` 为方差.
#[inline]
fn g(x: f64, s: f64) -> f64 {
    (-x * x / (2.0 * s)).exp() / (6.28 * s).sqrt()
}

/// EM 的全局状态量.
#[derive(Debug, Clone)]
pub struct RobustStats {
    /// 体素残差方差 σ².
    pub sigma: f64,

    /// 体素级 inlier 占比.
    pub mix: f64,

    /// 均匀分布密度 `m`.
    pub m: f64,

    /// 切片势能 inlier 成分方差.
    pub sigma_s: f64,

    /// 切片势能 outlier 成分方差.
    pub sigma_s2: f64,

    /// 切片级 inlier 占比.
    pub mix_s: f64,

    /// 切片势能 inlier 均值.
    pub mean_s: f64,

    /// 切片势能 outlier 均值 (恒应大于 `mean_s`).
    pub mean_s2: f64,

    /// 切片集合的最小有效强度.
    pub min_intensity: f32,

    /// 切片集合的最大有效强度.
    pub max_intensity: f32,

    /// 数值稳定项: 方差下界为 `step²/6.28`.
    pub step: f64,
}

impl Default for RobustStats {
    fn default() -> Self {
        Self {
            sigma: 0.0,
            mix: default::MIX,
            m: 0.0,
            sigma_s: default::SIGMA_S,
            sigma_s2: default::SIGMA_S,
            mix_s: default::MIX,
            mean_s: 0.0,
            mean_s2: 0.0,
            min_intensity: f32::MAX,
            max_intensity: f32::MIN,
            step: default::STEP,
        }
    }
}

/// 为 EM 分配逐切片的权重与 bias 平面, 并统计强度范围.
pub fn initialize_em(store: &mut SliceStore, state: &mut RobustStats) {
    store.weights = store
        .slices
        .iter()
        .map(|s| {
            let mut w = s.clone();
            w.fill(0.0);
            w
        })
        .collect();
    store.bias = store.weights.clone();
    store.scale = vec![1.0; store.len()];
    store.slice_weight = vec![1.0; store.len()];

    let (min, max) = store
        .slices
        .par_iter()
        .map(|s| {
            let mut min = f32::MAX;
            let mut max = f32::MIN;
            for &v in s.data().iter() {
                if v > 0.0 {
                    min = min.min(v);
                    max = max.max(v);
                }
            }
            (min, max)
        })
        .reduce(
            || (f32::MAX, f32::MIN),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        );
    state.min_intensity = min;
    state.max_intensity = max;
}

/// 重置 EM 的逐切片量: 有效像素的体素权重置 1, bias 置 0,
/// scale 与切片权重置 1; 再把强制剔除切片的权重压为 0.
pub fn initialize_em_values(store: &mut SliceStore, force_excluded: &[usize]) {
    let slices = &store.slices;
    store
        .weights
        .par_iter_mut()
        .zip(store.bias.par_iter_mut())
        .zip(slices.par_iter())
        .for_each(|((w, b), s)| {
            b.fill(0.0);
            for (wv, sv) in w.data_mut().iter_mut().zip(s.data().iter()) {
                *wv = if *sv > ACTIVE_EPS { 1.0 } else { 0.0 };
            }
        });
    store.slice_weight.iter_mut().for_each(|w| *w = 1.0);
    store.scale.iter_mut().for_each(|s| *s = 1.0);

    for &i in force_excluded {
        if i < store.len() {
            store.slice_weight[i] = 0.0;
        }
    }
}

/// 由初始残差估计体素方差, 并按文档值初始化混合模型参数.
/// 不与 ROI 相交的切片直接得到零权重.
pub fn initialize_robust_statistics(
    store: &mut SliceStore,
    state: &mut RobustStats,
    force_excluded: &[usize],
) {
    // 逐切片部分和并行计算, 汇总保持串行 (结果与线程数无关).
    let partials: Vec<(f64, usize)> = {
        let s: &SliceStore = store;
        (0..s.len())
            .into_par_iter()
            .map(|idx| {
                let slice = s.slices[idx].plane();
                let sim = s.simulated_slices[idx].plane();
                let sim_w = s.simulated_weights[idx].plane();
                let sim_in = s.simulated_inside[idx].plane();
                let mut acc = 0.0f64;
                let mut n = 0usize;
                for (&v, &m, &w, &i) in izip!(slice.iter(), sim.iter(), sim_w.iter(), sim_in.iter())
                {
                    if v > ACTIVE_EPS && i == 1.0 && w > SIM_WEIGHT_MIN {
                        let e = (v - m) as f64;
                        acc += e * e;
                        n += 1;
                    }
                }
                (acc, n)
            })
            .collect()
    };
    let (sum, num) = partials
        .iter()
        .fold((0.0f64, 0usize), |a, b| (a.0 + b.0, a.1 + b.1));

    for idx in 0..store.len() {
        if !store.slice_inside[idx] {
            store.slice_weight[idx] = 0.0;
        }
    }
    for &i in force_excluded {
        if i < store.len() {
            store.slice_weight[i] = 0.0;
        }
    }

    let floor = state.step * state.step / 6.28;
    state.sigma = if num > 0 {
        (sum / num as f64).max(floor)
    } else {
        default::SIGMA_S
    };
    state.sigma_s = default::SIGMA_S;
    state.mix = default::MIX;
    state.mix_s = default::MIX;
    state.m = 1.0 / (2.1 * state.max_intensity as f64 - 1.9 * state.min_intensity as f64);

    log::debug!(
        "Initializing robust statistics: sigma={} m={} mix={} mix_s={}",
        state.sigma.sqrt(),
        state.m,
        state.mix,
        state.mix_s
    );
}

/// E 步: 更新体素权重与切片权重, 返回各切片的势能.
///
/// 势能为 -1 的切片 (无有效像素、被强制剔除、小切片或 scale
/// 超界) 在切片混合模型中不参与拟合且权重置 0.
pub fn e_step(
    store: &mut SliceStore,
    state: &mut RobustStats,
    force_excluded: &[usize],
    small_slices: &[usize],
) -> Vec<f64> {
    // 体素权重与切片势能, 逐切片并行.
    let results: Vec<f64> = {
        let s: &SliceStore = store;
        let (sigma, mix, m) = (state.sigma, state.mix, state.m);
        s.weights
            .par_iter()
            .enumerate()
            .map(|(idx, _)| e_step_slice_potential(s, idx, sigma, mix, m))
            .collect()
    };
    // 把并行计算出的权重平面写回 (重新计算, 避免共享可变状态).
    {
        let slices = &store.slices;
        let simulated_slices = &store.simulated_slices;
        let simulated_weights = &store.simulated_weights;
        let bias = &store.bias;
        let scale = &store.scale;
        let (sigma, mix, m) = (state.sigma, state.mix, state.m);
        store
            .weights
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, w)| {
                let slice = slices[idx].plane();
                let sim = simulated_slices[idx].plane();
                let sim_w = simulated_weights[idx].plane();
                let b = bias[idx].plane();
                let sc = scale[idx];
                let mut wp = w.plane_mut();
                for ((wv, &v), (&mv, (&sw, &bv))) in wp
                    .iter_mut()
                    .zip(slice.iter())
                    .zip(sim.iter().zip(sim_w.iter().zip(b.iter())))
                {
                    *wv = 0.0;
                    if v > ACTIVE_EPS && sw > SIM_WEIGHT_MIN {
                        let e = v as f64 * (-bv as f64).exp() * sc - mv as f64;
                        let g1 = g(e, sigma);
                        let denom = g1 * mix + (1.0 - mix) * m;
                        if denom > 0.0 {
                            *wv = (g1 * mix / denom) as f32;
                        }
                    }
                }
            });
    }

    let mut slice_potential = results;

    // 强制剔除与小切片: 势能压为 -1.
    for &i in force_excluded {
        if i < slice_potential.len() {
            slice_potential[i] = -1.0;
        }
    }
    for &i in small_slices {
        if i < slice_potential.len() {
            slice_potential[i] = -1.0;
        }
    }
    // scale 超界指向配准失败, 同样剔除.
    for (idx, p) in slice_potential.iter_mut().enumerate() {
        if store.scale[idx] < SCALE_RANGE.0 || store.scale[idx] > SCALE_RANGE.1 {
            *p = -1.0;
        }
    }

    log::debug!("Slice potentials: {slice_potential:?}");

    // 切片级混合模型: 均值.
    let (mut sum, mut den, mut sum2, mut den2) = (0.0, 0.0, 0.0, 0.0);
    let (mut maxs, mut mins) = (0.0f64, 1.0f64);
    for (idx, &p) in slice_potential.iter().enumerate() {
        if p >= 0.0 {
            let w = store.slice_weight[idx];
            sum += p * w;
            den += w;
            sum2 += p * (1.0 - w);
            den2 += 1.0 - w;
            maxs = maxs.max(p);
            mins = mins.min(p);
        }
    }
    state.mean_s = if den > 0.0 { sum / den } else { mins };
    state.mean_s2 = if den2 > 0.0 {
        sum2 / den2
    } else {
        (maxs + state.mean_s) / 2.0
    };

    // 方差.
    let (mut sum, mut den, mut sum2, mut den2) = (0.0, 0.0, 0.0, 0.0);
    for (idx, &p) in slice_potential.iter().enumerate() {
        if p >= 0.0 {
            let w = store.slice_weight[idx];
            sum += (p - state.mean_s).powi(2) * w;
            den += w;
            sum2 += (p - state.mean_s2).powi(2) * (1.0 - w);
            den2 += 1.0 - w;
        }
    }
    let floor = state.step * state.step / 6.28;
    if sum > 0.0 && den > 0.0 {
        state.sigma_s = (sum / den).max(floor);
    } else {
        state.sigma_s = default::SIGMA_S;
        log::debug!(
            "All slices are equal, setting sigma_s to {}",
            state.sigma_s.sqrt()
        );
    }
    if sum2 > 0.0 && den2 > 0.0 {
        state.sigma_s2 = (sum2 / den2).max(floor);
    } else {
        state.sigma_s2 = ((state.mean_s2 - state.mean_s).powi(2) / 4.0).max(floor);
        log::debug!(
            "All slices are inliers, setting sigma_s2 to {}",
            state.sigma_s2.sqrt()
        );
    }

    // 切片权重.
    for (idx, &p) in slice_potential.iter().enumerate() {
        if p == -1.0 {
            store.slice_weight[idx] = 0.0;
            continue;
        }
        if den <= 0.0 || state.mean_s2 <= state.mean_s {
            store.slice_weight[idx] = 1.0;
            continue;
        }
        let gs1 = if p < state.mean_s2 {
            g(p - state.mean_s, state.sigma_s)
        } else {
            0.0
        };
        let gs2 = if p > state.mean_s {
            g(p - state.mean_s2, state.sigma_s2)
        } else {
            0.0
        };
        let likelihood = gs1 * state.mix_s + gs2 * (1.0 - state.mix_s);
        store.slice_weight[idx] = if likelihood > 0.0 {
            gs1 * state.mix_s / likelihood
        } else if p <= state.mean_s {
            1.0
        } else if p >= state.mean_s2 {
            0.0
        } else {
            1.0
        };
    }

    // 更新 mix_s.
    let (mut sum, mut num) = (0.0, 0usize);
    for (idx, &p) in slice_potential.iter().enumerate() {
        if p >= 0.0 {
            sum += store.slice_weight[idx];
            num += 1;
        }
    }
    if num > 0 {
        state.mix_s = sum / num as f64;
    } else {
        state.mix_s = default::MIX;
        log::warn!("All slices are outliers, setting mix_s to {}", state.mix_s);
    }

    log::debug!(
        "Slice robust statistics: means {} {}, sigmas {} {}, proportions {} {}",
        state.mean_s,
        state.mean_s2,
        state.sigma_s.sqrt(),
        state.sigma_s2.sqrt(),
        state.mix_s,
        1.0 - state.mix_s
    );

    slice_potential
}

/// 单切片的体素权重与势能 `p = Σ(w·e²)/Σw`. 无有效像素时返回 -1.
fn e_step_slice_potential(store: &SliceStore, idx: usize, sigma: f64, mix: f64, m: f64) -> f64 {
    let slice = store.slices[idx].plane();
    let sim = store.simulated_slices[idx].plane();
    let sim_w = store.simulated_weights[idx].plane();
    let b = store.bias[idx].plane();
    let sc = store.scale[idx];

    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for (&v, (&mv, (&sw, &bv))) in slice
        .iter()
        .zip(sim.iter().zip(sim_w.iter().zip(b.iter())))
    {
        if v > ACTIVE_EPS && sw > SIM_WEIGHT_MIN {
            let e = v as f64 * (-bv as f64).exp() * sc - mv as f64;
            let g1 = g(e, sigma);
            let denom = g1 * mix + (1.0 - mix) * m;
            let w = if denom > 0.0 { g1 * mix / denom } else { 0.0 };
            num += w * e * e;
            den += w;
        }
    }
    if den > 0.0 {
        num / den
    } else {
        -1.0
    }
}

/// M 步: 以当前体素权重更新 σ², inlier 占比与均匀密度.
///
/// 全部权重质量为零属于数值退化, 记一条警告并保持上一轮参数.
pub fn m_step(store: &SliceStore, state: &mut RobustStats, iter: usize) {
    let partials: Vec<(f64, f64, usize, f64, f64)> = (0..store.len())
        .into_par_iter()
        .map(|idx| {
            let slice = store.slices[idx].plane();
            let sim = store.simulated_slices[idx].plane();
            let sim_w = store.simulated_weights[idx].plane();
            let b = store.bias[idx].plane();
            let w = store.weights[idx].plane();
            let sc = store.scale[idx];

            let mut sigma = 0.0f64;
            let mut mix = 0.0f64;
            let mut num = 0usize;
            let mut min = f64::MAX;
            let mut max = f64::MIN;
            for (&v, &wv, (&mv, (&sw, &bv))) in izip!(
                slice.iter(),
                w.iter(),
                sim.iter().zip(sim_w.iter().zip(b.iter()))
            ) {
                if v > ACTIVE_EPS && sw > SIM_WEIGHT_MIN {
                    let corrected = v as f64 * (-bv as f64).exp() * sc;
                    let e = corrected - mv as f64;
                    sigma += wv as f64 * e * e;
                    mix += wv as f64;
                    num += 1;
                    min = min.min(corrected);
                    max = max.max(corrected);
                }
            }
            (sigma, mix, num, min, max)
        })
        .collect();
    // 串行汇总.
    let (sigma, mix, num, min, max) = partials.iter().fold(
        (0.0f64, 0.0f64, 0usize, f64::MAX, f64::MIN),
        |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3.min(b.3), a.4.max(b.4)),
    );

    if mix <= 0.0 {
        log::warn!("Degenerate MStep: sigma={sigma} mix={mix}, keeping previous parameters");
        return;
    }
    state.sigma = (sigma / mix).max(state.step * state.step / 6.28);
    if iter > 1 {
        state.mix = mix / num as f64;
    }
    if max > min {
        state.m = 1.0 / (max - min);
    }

    log::debug!(
        "Voxel-wise robust statistics: sigma={} mix={} m={}",
        state.sigma.sqrt(),
        state.mix,
        state.m
    );
}

/// 闭式 scale 更新: `s = Σ w·Ŝ·sim / Σ w·sim²`,
/// 其中 `Ŝ = exp(-B)·S` 为 bias 校正后的切片值.
pub fn scale_step(store: &mut SliceStore) {
    let scales: Vec<f64> = {
        let s: &SliceStore = store;
        (0..s.len())
            .into_par_iter()
            .map(|idx| {
                let slice = s.slices[idx].plane();
                let sim = s.simulated_slices[idx].plane();
                let sim_w = s.simulated_weights[idx].plane();
                let b = s.bias[idx].plane();
                let w = s.weights[idx].plane();

                let mut num = 0.0f64;
                let mut den = 0.0f64;
                for (&v, &wv, (&mv, (&sw, &bv))) in izip!(
                    slice.iter(),
                    w.iter(),
                    sim.iter().zip(sim_w.iter().zip(b.iter()))
                ) {
                    if v > ACTIVE_EPS && sw > SIM_WEIGHT_MIN {
                        let corrected = v as f64 * (-bv as f64).exp();
                        num += wv as f64 * corrected * mv as f64;
                        den += wv as f64 * (mv as f64) * (mv as f64);
                    }
                }
                if den > 0.0 {
                    num / den
                } else {
                    1.0
                }
            })
            .collect()
    };
    store.scale = scales;
    log::debug!("Slice scales: {:?}", store.scale);
}

/// 切片 bias 更新: 对加权对数残差 `ln(Ŝ/sim)` 做高斯平滑
/// (带伴随权重平滑), 累加到 `B_i` 后归一为零均值.
pub fn bias_step(store: &mut SliceStore, sigma_bias_mm: f64) {
    let slices = &store.slices;
    let simulated_slices = &store.simulated_slices;
    let simulated_weights = &store.simulated_weights;
    let weights = &store.weights;
    let scale = &store.scale;

    store.bias.par_iter_mut().enumerate().for_each(|(idx, b)| {
        let slice = slices[idx].plane();
        let sim = simulated_slices[idx].plane();
        let sim_w = simulated_weights[idx].plane();
        let w = weights[idx].plane();
        let sc = scale[idx];
        let geom = slices[idx].geom().clone();
        let sigma_pix = sigma_bias_mm / geom.dx();

        let mut wresidual = crate::data::VoxelGrid::zeros(geom.clone());
        let mut wb = crate::data::VoxelGrid::zeros(geom.clone());
        {
            let mut wr_p = wresidual.plane_mut();
            let mut wb_p = wb.plane_mut();
            for y in 0..geom.ny() {
                for x in 0..geom.nx() {
                    let v = slice[(y, x)];
                    if v > ACTIVE_EPS && sim_w[(y, x)] > SIM_WEIGHT_MIN {
                        let corrected = v as f64 * (-b.at(x, y, 0) as f64).exp() * sc;
                        let s = sim[(y, x)] as f64;
                        if corrected > 0.0 && s > 0.0 {
                            let weight = w[(y, x)] as f64 * corrected;
                            wb_p[(y, x)] = weight as f32;
                            wr_p[(y, x)] = ((corrected / s).ln() * weight) as f32;
                        }
                    }
                }
            }
        }

        // 平滑残差与伴随权重. 此处不涉及 padding 语义, 阈值取极小.
        blur_grid_padded(&mut wresidual, [sigma_pix, sigma_pix, 0.0], f32::MIN);
        blur_grid_padded(&mut wb, [sigma_pix, sigma_pix, 0.0], f32::MIN);

        let mut mean_num = 0.0f64;
        let mut mean_den = 0.0f64;
        {
            let wr_p = wresidual.plane();
            let wb_p = wb.plane();
            let mut bp = b.plane_mut();
            for y in 0..geom.ny() {
                for x in 0..geom.nx() {
                    if slice[(y, x)] > ACTIVE_EPS && wb_p[(y, x)] > 0.0 {
                        bp[(y, x)] += wr_p[(y, x)] / wb_p[(y, x)];
                    }
                    if slice[(y, x)] > ACTIVE_EPS {
                        mean_num += bp[(y, x)] as f64;
                        mean_den += 1.0;
                    }
                }
            }
            // 零均值归一: bias 不携带全局强度水平.
            if mean_den > 0.0 {
                let mean = (mean_num / mean_den) as f32;
                for y in 0..geom.ny() {
                    for x in 0..geom.nx() {
                        if slice[(y, x)] > ACTIVE_EPS {
                            bp[(y, x)] -= mean;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coeff::coeff_init;
    use crate::data::VoxelGrid;
    use crate::geom::{ImageGeometry, RigidTransform};
    use crate::simulate::simulate_slices;
    use crate::store::{CreateSlicesOptions, SliceStore};

    /// 三张一致切片加一张强噪声切片的微型环境.
    fn setup_with_outlier() -> (SliceStore, RobustStats, Vec<f64>) {
        let stack_geom = ImageGeometry::axial((4, 10, 10), [1.0, 1.0, 2.0], [0.0; 3]);
        let mut stack = VoxelGrid::filled(stack_geom, 100.0);
        // 切片 2 替换为 10 倍均值的均匀噪声.
        for y in 0..10 {
            for x in 0..10 {
                stack.set(x, y, 2, 1000.0 + ((x * 7 + y * 13) % 17) as f32);
            }
        }

        let mut store = SliceStore::new();
        store.create_from_stacks(
            &[stack],
            &[RigidTransform::identity()],
            &[2.0],
            &[1],
            None,
            &CreateSlicesOptions::default(),
        );

        let volume_geom = ImageGeometry::axial((16, 16, 16), [1.0; 3], [0.0; 3]);
        let mask = VoxelGrid::filled(volume_geom.clone(), 1.0);
        let volume = VoxelGrid::filled(volume_geom.clone(), 100.0);

        let coeffs = coeff_init(&mut store, &volume_geom, &mask, &[], false);
        simulate_slices(&mut store, &coeffs, &volume, &mask);

        let mut state = RobustStats::default();
        initialize_em(&mut store, &mut state);
        initialize_em_values(&mut store, &[]);
        initialize_robust_statistics(&mut store, &mut state, &[]);

        let mut first_potentials = Vec::new();
        for it in 0..3 {
            let p = e_step(&mut store, &mut state, &[], &[]);
            if it == 0 {
                first_potentials = p;
            }
            scale_step(&mut store);
            m_step(&store, &mut state, 2);
        }
        (store, state, first_potentials)
    }

    /// 强度范围统计应忽略非正值.
    #[test]
    fn test_initialize_em_intensity_range() {
        let g = ImageGeometry::axial((1, 2, 2), [1.0, 1.0, 2.0], [0.0; 3]);
        let mut s = VoxelGrid::filled(g.clone(), 10.0);
        s.set(0, 0, 0, -1.0);
        s.set(1, 0, 0, 90.0);
        let mut store = SliceStore::new();
        store.set_slices(vec![s], vec![RigidTransform::identity()], vec![0]);
        let mut state = RobustStats::default();
        initialize_em(&mut store, &mut state);
        assert_eq!(state.min_intensity, 10.0);
        assert_eq!(state.max_intensity, 90.0);
    }

    /// 离群切片应在几轮 EM 后得到接近零的切片权重,
    /// 一致切片保持高权重.
    #[test]
    fn test_outlier_slice_rejected() {
        let (store, _, potentials) = setup_with_outlier();
        assert!(
            store.slice_weight[2] < 0.1,
            "outlier weight = {}",
            store.slice_weight[2]
        );
        for idx in [0usize, 1, 3] {
            assert!(
                store.slice_weight[idx] > 0.5,
                "inlier {idx} weight = {}",
                store.slice_weight[idx]
            );
        }
        // 首轮统计中, 离群切片的势能显著更大.
        assert!(potentials[2] > potentials[0] * 10.0 && potentials[2] > 1.0);
    }

    /// 强制剔除的切片在每一轮的权重恒为 0.
    #[test]
    fn test_force_excluded_weight_zero() {
        let (mut store, mut state, _) = setup_with_outlier();
        for _ in 0..3 {
            e_step(&mut store, &mut state, &[1], &[]);
            assert_eq!(store.slice_weight[1], 0.0);
        }
    }

    /// 小切片列表同样被压为 -1 势能 → 零权重.
    #[test]
    fn test_small_slice_excluded() {
        let (mut store, mut state, _) = setup_with_outlier();
        e_step(&mut store, &mut state, &[], &[3]);
        assert_eq!(store.slice_weight[3], 0.0);
    }

    /// scale 超出 [0.2, 5] 的切片被剔除.
    #[test]
    fn test_scale_out_of_range_excluded() {
        let (mut store, mut state, _) = setup_with_outlier();
        store.scale[0] = 10.0;
        e_step(&mut store, &mut state, &[], &[]);
        assert_eq!(store.slice_weight[0], 0.0);
    }

    /// bias/scale 幂等性: 施加 `s·exp(-B)` 后再施加其逆应还原.
    #[test]
    fn test_bias_scale_idempotence() {
        let v: f64 = 120.0;
        let (s, b) = (1.3f64, 0.2f64);
        let corrected = v * (-b).exp() * s;
        let restored = corrected * b.exp() / s;
        assert!((restored - v).abs() < 1e-9);
    }

    /// 静止输入下, 加权残差能量十轮内不增 (弱单调性).
    #[test]
    fn test_em_energy_nonincreasing() {
        let (mut store, mut state, _) = setup_with_outlier();
        let energy = |store: &SliceStore| -> f64 {
            let mut total = 0.0;
            for idx in 0..store.len() {
                let slice = store.slices[idx].plane();
                let sim = store.simulated_slices[idx].plane();
                let w = store.weights[idx].plane();
                let b = store.bias[idx].plane();
                let sc = store.scale[idx];
                let mut e_sum = 0.0;
                for ((&v, &wv), (&mv, &bv)) in slice
                    .iter()
                    .zip(w.iter())
                    .zip(sim.iter().zip(b.iter()))
                {
                    if v > ACTIVE_EPS {
                        let e = v as f64 * (-bv as f64).exp() * sc - mv as f64;
                        e_sum += wv as f64 * e * e;
                    }
                }
                total += store.slice_weight[idx] * e_sum;
            }
            total
        };

        let mut prev = energy(&store);
        for _ in 0..10 {
            e_step(&mut store, &mut state, &[], &[]);
            scale_step(&mut store);
            m_step(&store, &mut state, 2);
            let cur = energy(&store);
            assert!(cur <= prev * 1.01, "energy increased: {prev} -> {cur}");
            prev = cur;
        }
    }
}
