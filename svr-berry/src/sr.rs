//! 超分辨率体积更新与边缘保持正则化.

use crate::coeff::CoeffStore;
use crate::consts::{ACTIVE_EPS, PADDING, REG_STABILITY_BOUND};
use crate::data::{blur_grid, VoxelGrid};
use crate::store::SliceStore;
use rayon::prelude::*;

/// 13 个近邻方向 (覆盖全部相对方向对).
const DIRECTIONS: [[i32; 3]; 13] = [
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [1, -1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
    [1, -1, 1],
    [1, 0, -1],
    [0, 1, -1],
    [1, 1, -1],
    [1, -1, -1],
];

/// 残差切片 `d_i = s·exp(-B)·S − sim`, padding 像素为 0.
pub fn slice_difference(store: &mut SliceStore) {
    let slices = &store.slices;
    let simulated_slices = &store.simulated_slices;
    let bias = &store.bias;
    let scale = &store.scale;
    store
        .slice_dif
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, dif)| {
            let slice = slices[idx].plane();
            let sim = simulated_slices[idx].plane();
            let b = bias[idx].plane();
            let sc = scale[idx];
            let mut d = dif.plane_mut();
            for ((dv, &v), (&mv, &bv)) in d
                .iter_mut()
                .zip(slice.iter())
                .zip(sim.iter().zip(b.iter()))
            {
                *dv = if v > ACTIVE_EPS {
                    (v as f64 * (-bv as f64).exp() * sc - mv as f64) as f32
                } else {
                    0.0
                };
            }
        });
}

/// 系数转置残差: 增量体积 `ΔV` 与置信度 `κ`.
///
/// 逐切片串行累加 (条目会命中相同体素), 结果与线程数无关.
pub fn superresolution_addon(
    store: &SliceStore,
    coeffs: &CoeffStore,
    volume_geom: &crate::geom::ImageGeometry,
) -> (VoxelGrid, VoxelGrid) {
    let mut addon = VoxelGrid::zeros(volume_geom.clone());
    let mut confidence = VoxelGrid::zeros(volume_geom.clone());
    {
        let addon_flat = addon.data_mut().into_slice().expect("标准布局");
        let conf_flat = confidence.data_mut().into_slice().expect("标准布局");

        for idx in 0..store.len() {
            let sw = store.slice_weight[idx];
            if sw <= 0.0 {
                continue;
            }
            let sc = &coeffs.per_slice[idx];
            let slice = store.slices[idx].plane();
            let dif = store.slice_dif[idx].plane();
            let w = store.weights[idx].plane();
            let (ny, nx) = (store.slices[idx].geom().ny(), store.slices[idx].geom().nx());
            for y in 0..ny {
                for x in 0..nx {
                    if slice[(y, x)] <= ACTIVE_EPS {
                        continue;
                    }
                    let pix_w = w[(y, x)] as f64 * sw;
                    let d = dif[(y, x)] as f64;
                    for e in sc.pixel(x, y) {
                        addon_flat[e.voxel as usize] += (e.value as f64 * pix_w * d) as f32;
                        conf_flat[e.voxel as usize] += (e.value as f64 * pix_w) as f32;
                    }
                }
            }
        }
    }
    (addon, confidence)
}

/// 非自适应模式: `ΔV` 逐点除以 `κ`, 随后 `κ` 全部置 1.
pub fn normalize_addon(addon: &mut VoxelGrid, confidence: &mut VoxelGrid) {
    for (a, c) in addon
        .data_mut()
        .iter_mut()
        .zip(confidence.data_mut().iter_mut())
    {
        if *c > 0.0 {
            *a /= *c;
            *c = 1.0;
        }
    }
}

/// 把体积强度钳到 `[0.9·I_min, 1.1·I_max]`.
pub fn clamp_intensities(volume: &mut VoxelGrid, min_intensity: f32, max_intensity: f32) {
    let lo = min_intensity * 0.9;
    let hi = max_intensity * 1.1;
    volume.data_mut().par_mapv_inplace(|v| v.clamp(lo, hi));
}

/// 自适应各向异性正则化.
///
/// 边缘权重由更新前体积 `original` 驱动:
/// `b_d(X) = exp(−|V₀(X+d) − V₀(X)|²/(δ²·|d|))`;
/// 更新对当前体积做 `κ` 门控的边缘加权拉普拉斯上升,
/// 乘子为 `α·λ/δ²`. 乘子超过稳定上界时记录警告.
pub fn adaptive_regularization(
    volume: &mut VoxelGrid,
    original: &VoxelGrid,
    confidence: &VoxelGrid,
    alpha: f64,
    lambda: f64,
    delta: f64,
) {
    if alpha * lambda / (delta * delta) > REG_STABILITY_BOUND {
        log::warn!(
            "Regularization might not have smoothing effect: alpha*lambda/delta^2 = {} > {}",
            alpha * lambda / (delta * delta),
            REG_STABILITY_BOUND
        );
    }

    let (nz, ny, nx) = volume.shape();
    let norms: Vec<f64> = DIRECTIONS
        .iter()
        .map(|d| d.iter().map(|v| v.abs() as f64).sum())
        .collect();

    // 阶段 1: 逐方向边缘权重.
    let edge_weights: Vec<VoxelGrid> = (0..DIRECTIONS.len())
        .into_par_iter()
        .map(|i| {
            let dir = &DIRECTIONS[i];
            let norm = norms[i];
            let mut b = VoxelGrid::zeros(volume.geom().clone());
            for z in 0..nz {
                for y in 0..ny {
                    for x in 0..nx {
                        let (xx, yy, zz) = (
                            x as i32 + dir[0],
                            y as i32 + dir[1],
                            z as i32 + dir[2],
                        );
                        if xx < 0 || yy < 0 || zz < 0 {
                            continue;
                        }
                        let (xx, yy, zz) = (xx as usize, yy as usize, zz as usize);
                        if xx >= nx || yy >= ny || zz >= nz {
                            continue;
                        }
                        let diff =
                            (original.at(xx, yy, zz) - original.at(x, y, z)) as f64;
                        b.set(
                            x,
                            y,
                            z,
                            (-(diff * diff) / (delta * delta * norm)).exp() as f32,
                        );
                    }
                }
            }
            b
        })
        .collect();

    // 阶段 2: 边缘加权拉普拉斯更新.
    let before = volume.clone();
    let factor = alpha * lambda / (delta * delta);
    let updated: Vec<f32> = (0..nz * ny * nx)
        .into_par_iter()
        .map(|lin| {
            let z = lin / (ny * nx);
            let y = (lin / nx) % ny;
            let x = lin % nx;
            let kappa = confidence.at(x, y, z) as f64;
            let center = before.at(x, y, z);
            if kappa <= 0.0 {
                return center;
            }
            let mut val = 0.0f64;
            for (i, dir) in DIRECTIONS.iter().enumerate() {
                let norm = norms[i];
                // 正向差分.
                let (xf, yf, zf) = (
                    x as i32 + dir[0],
                    y as i32 + dir[1],
                    z as i32 + dir[2],
                );
                if xf >= 0
                    && yf >= 0
                    && zf >= 0
                    && (xf as usize) < nx
                    && (yf as usize) < ny
                    && (zf as usize) < nz
                {
                    let fwd = before.at(xf as usize, yf as usize, zf as usize);
                    val += edge_weights[i].at(x, y, z) as f64 * (fwd - center) as f64 / norm;
                }
                // 反向差分: 权重取自 X − d 处.
                let (xb, yb, zb) = (
                    x as i32 - dir[0],
                    y as i32 - dir[1],
                    z as i32 - dir[2],
                );
                if xb >= 0
                    && yb >= 0
                    && zb >= 0
                    && (xb as usize) < nx
                    && (yb as usize) < ny
                    && (zb as usize) < nz
                {
                    let (xb, yb, zb) = (xb as usize, yb as usize, zb as usize);
                    let bwd = before.at(xb, yb, zb);
                    val -= edge_weights[i].at(xb, yb, zb) as f64 * (center - bwd) as f64 / norm;
                }
            }
            (center as f64 + factor * val / kappa) as f32
        })
        .collect();

    volume
        .data_mut()
        .into_slice()
        .expect("标准布局")
        .copy_from_slice(&updated);
}

/// 切片 bias 场的全局归一: 把逐切片对数 bias 经系数矩阵投影到
/// 体积、除以 `ω` 并平滑, 再从重建体积中除去 `exp(-bias)`,
/// 防止逐切片 bias 估计漂移全局强度水平.
pub fn normalise_bias(
    store: &SliceStore,
    coeffs: &CoeffStore,
    volume: &mut VoxelGrid,
    mask: &VoxelGrid,
    sigma_bias_mm: f64,
) {
    let mut bias = VoxelGrid::zeros(volume.geom().clone());
    {
        let bias_flat = bias.data_mut().into_slice().expect("标准布局");
        for idx in 0..store.len() {
            let sc = &coeffs.per_slice[idx];
            let slice = store.slices[idx].plane();
            let b = store.bias[idx].plane();
            let (ny, nx) = (store.slices[idx].geom().ny(), store.slices[idx].geom().nx());
            for y in 0..ny {
                for x in 0..nx {
                    if slice[(y, x)] <= ACTIVE_EPS {
                        continue;
                    }
                    let bv = b[(y, x)];
                    for e in sc.pixel(x, y) {
                        bias_flat[e.voxel as usize] += e.value * bv;
                    }
                }
            }
        }
    }

    // 按贡献权重归一.
    for (b, &w) in bias
        .data_mut()
        .iter_mut()
        .zip(coeffs.volume_weights.data().iter())
    {
        if w > 0.0 {
            *b /= w;
        } else {
            *b = 0.0;
        }
    }
    // mask 外不保留 bias.
    for (b, &m) in bias.data_mut().iter_mut().zip(mask.data().iter()) {
        if m == 0.0 {
            *b = 0.0;
        }
    }

    let sigma_vox = sigma_bias_mm / volume.geom().dx();
    let mut m = mask.clone();
    blur_grid(&mut bias, [sigma_vox; 3]);
    blur_grid(&mut m, [sigma_vox; 3]);
    for (b, &mv) in bias.data_mut().iter_mut().zip(m.data().iter()) {
        if mv > 0.0 {
            *b /= mv;
        }
    }

    for (v, &b) in volume.data_mut().iter_mut().zip(bias.data().iter()) {
        if *v != PADDING {
            *v /= (-b).exp();
        }
    }
}

/// 全局 bias 校正: 相对上一轮体积的低频对数残差平滑后
/// 以乘性场形式从体积中除去, 再重新钳制强度.
pub fn bias_correct_volume(
    volume: &mut VoxelGrid,
    original: &VoxelGrid,
    mask: &VoxelGrid,
    sigma_bias_mm: f64,
    low_intensity_cutoff: f64,
    min_intensity: f32,
    max_intensity: f32,
) {
    let cutoff = (low_intensity_cutoff * max_intensity as f64) as f32;
    let mut residual = VoxelGrid::zeros(volume.geom().clone());
    let mut weights = VoxelGrid::zeros(volume.geom().clone());
    for (((r, w), (&v, &o)), &m) in residual
        .data_mut()
        .iter_mut()
        .zip(weights.data_mut().iter_mut())
        .zip(volume.data().iter().zip(original.data().iter()))
        .zip(mask.data().iter())
    {
        if m == 1.0 && o > cutoff && v > cutoff {
            *r = (v / o).ln();
            *w = 1.0;
        }
    }

    let sigma_vox = sigma_bias_mm / volume.geom().dx();
    blur_grid(&mut residual, [sigma_vox; 3]);
    blur_grid(&mut weights, [sigma_vox; 3]);

    let lo = min_intensity * 0.9;
    let hi = max_intensity * 1.1;
    for ((v, (&r, &w)), &m) in volume
        .data_mut()
        .iter_mut()
        .zip(residual.data().iter().zip(weights.data().iter()))
        .zip(mask.data().iter())
    {
        if m == 1.0 && w > 0.0 {
            let field = (r / w).exp();
            *v = (*v / field).clamp(lo, hi);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coeff::coeff_init;
    use crate::em::{initialize_em, initialize_em_values, RobustStats};
    use crate::geom::{ImageGeometry, RigidTransform};
    use crate::simulate::simulate_slices;
    use crate::store::{CreateSlicesOptions, SliceStore};

    fn setup() -> (SliceStore, CoeffStore, VoxelGrid, VoxelGrid) {
        let stack_geom = ImageGeometry::axial((4, 10, 10), [1.0, 1.0, 2.0], [0.0; 3]);
        let stack = VoxelGrid::filled(stack_geom, 100.0);
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
        let volume = VoxelGrid::filled(volume_geom.clone(), 80.0);
        let coeffs = coeff_init(&mut store, &volume_geom, &mask, &[], false);
        let mut state = RobustStats::default();
        initialize_em(&mut store, &mut state);
        initialize_em_values(&mut store, &[]);
        (store, coeffs, volume, mask)
    }

    /// 残差切片应反映体积与切片的强度差, padding 处为 0.
    #[test]
    fn test_slice_difference() {
        let (mut store, coeffs, volume, mask) = setup();
        simulate_slices(&mut store, &coeffs, &volume, &mask);
        slice_difference(&mut store);
        // 内部像素: 100 - 80 = 20.
        assert!((store.slice_dif[1].at(5, 5, 0) - 20.0).abs() < 1e-3);
        // 人工 padding 像素.
        store.slices[1].set(0, 0, 0, PADDING);
        slice_difference(&mut store);
        assert_eq!(store.slice_dif[1].at(0, 0, 0), 0.0);
    }

    /// 超分辨率更新应把体积推向切片强度.
    #[test]
    fn test_addon_pushes_volume_towards_slices() {
        let (mut store, coeffs, mut volume, mask) = setup();
        simulate_slices(&mut store, &coeffs, &volume, &mask);
        slice_difference(&mut store);
        let (mut addon, mut confidence) =
            superresolution_addon(&store, &coeffs, &volume.geom().clone());
        normalize_addon(&mut addon, &mut confidence);
        let before = volume.at(8, 8, 7);
        for (v, &a) in volume.data_mut().iter_mut().zip(addon.data().iter()) {
            *v += a;
        }
        let after = volume.at(8, 8, 7);
        assert!(after > before, "{before} -> {after}");
        assert!(after <= 100.5);
    }

    /// 零权重切片对 `ΔV` 与 `κ` 的贡献为零.
    #[test]
    fn test_excluded_slice_contributes_nothing() {
        let (mut store, coeffs, volume, mask) = setup();
        simulate_slices(&mut store, &coeffs, &volume, &mask);
        slice_difference(&mut store);
        let (_, conf_all) = superresolution_addon(&store, &coeffs, &volume.geom().clone());
        store.slice_weight[0] = 0.0;
        let (_, conf_without) = superresolution_addon(&store, &coeffs, &volume.geom().clone());
        let total_all: f64 = conf_all.data().iter().map(|v| *v as f64).sum();
        let total_without: f64 = conf_without.data().iter().map(|v| *v as f64).sum();
        assert!(total_without < total_all);
    }

    /// 钳制约束: 更新后 `min V ≥ 0.9·I_min`, `max V ≤ 1.1·I_max`.
    #[test]
    fn test_clamp_contract() {
        let g = ImageGeometry::axial((4, 4, 4), [1.0; 3], [0.0; 3]);
        let mut v = VoxelGrid::zeros(g);
        v.set(0, 0, 0, 500.0);
        v.set(1, 0, 0, -50.0);
        clamp_intensities(&mut v, 10.0, 200.0);
        let (min, max) = v.min_max();
        assert!(min >= 0.9 * 10.0);
        assert!(max <= 1.1 * 200.0);
    }

    /// 平坦区域的正则化应向邻域均值收缩, 常值体积保持不变.
    #[test]
    fn test_regularization_smooths() {
        let g = ImageGeometry::axial((8, 8, 8), [1.0; 3], [0.0; 3]);
        let confidence = VoxelGrid::filled(g.clone(), 1.0);

        // 常值体积: 不变.
        let mut flat = VoxelGrid::filled(g.clone(), 70.0);
        let orig = flat.clone();
        adaptive_regularization(&mut flat, &orig, &confidence, 5.0, 0.02, 20.0);
        for &v in flat.data().iter() {
            assert!((v - 70.0).abs() < 1e-4);
        }

        // 单点尖峰: 被抹平.
        let mut spike = VoxelGrid::filled(g.clone(), 70.0);
        spike.set(4, 4, 4, 90.0);
        let orig = spike.clone();
        adaptive_regularization(&mut spike, &orig, &confidence, 5.0, 0.02, 20.0);
        assert!(spike.at(4, 4, 4) < 90.0);
        assert!(spike.at(3, 4, 4) > 70.0);
    }

    /// 全局 bias 校正应把乘性偏移压回原水平.
    #[test]
    fn test_bias_correct_volume() {
        let g = ImageGeometry::axial((8, 8, 8), [1.0; 3], [0.0; 3]);
        let mask = VoxelGrid::filled(g.clone(), 1.0);
        let original = VoxelGrid::filled(g.clone(), 100.0);
        let mut v = VoxelGrid::filled(g.clone(), 130.0);
        bias_correct_volume(&mut v, &original, &mask, 4.0, 0.01, 50.0, 150.0);
        // 130/exp(ln(1.3)) = 100.
        assert!((v.at(4, 4, 4) - 100.0).abs() < 1.0);
    }
}
