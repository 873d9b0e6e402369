//! 重建质量度量与逐迭代报告.

use crate::consts::ACTIVE_EPS;
use crate::data::VoxelGrid;
use crate::store::SliceStore;
use rayon::prelude::*;
use std::fmt::Write as _;
use std::path::Path;

/// 两幅同形网格的归一化互相关 (NCC).
///
/// 只统计两侧均超过 `threshold` 的体素; 联合有效样本不足 5 个时
/// 返回 -1, 方差为零时返回 0. `count` 给出联合有效体素数.
pub fn compute_ncc(a: &VoxelGrid, b: &VoxelGrid, threshold: f32, count: Option<&mut f64>) -> f64 {
    assert_eq!(a.shape(), b.shape(), "NCC 要求两幅图形状一致");

    let mut n = 0usize;
    let mut mean_a = 0.0f64;
    let mut mean_b = 0.0f64;
    for (&va, &vb) in a.data().iter().zip(b.data().iter()) {
        if va > threshold && vb > threshold {
            mean_a += va as f64;
            mean_b += vb as f64;
            n += 1;
        }
    }
    if let Some(c) = count {
        *c = n as f64;
    }
    if n < 5 {
        return -1.0;
    }
    mean_a /= n as f64;
    mean_b /= n as f64;

    let mut cov = 0.0f64;
    let mut var_a = 0.0f64;
    let mut var_b = 0.0f64;
    for (&va, &vb) in a.data().iter().zip(b.data().iter()) {
        if va > threshold && vb > threshold {
            let da = va as f64 - mean_a;
            let db = vb as f64 - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }
    }
    if var_a * var_b > 0.0 {
        cov / (var_a * var_b).sqrt()
    } else {
        0.0
    }
}

/// 模拟切片相对原始切片的 NRMSE (逐切片后取均值).
///
/// 比较在 scratch 值上进行: 原始切片按 `exp(-B)·s` 校正后
/// 与模拟值求差, 切片数据本身只读.
pub fn evaluate_recon_quality(store: &SliceStore) -> f64 {
    let nrmse: Vec<f64> = (0..store.len())
        .into_par_iter()
        .map(|idx| {
            let slice = store.slices[idx].plane();
            let sim = store.simulated_slices[idx].plane();
            let b = store.bias[idx].plane();
            let sc = store.scale[idx];

            let mut s_diff = 0.0f64;
            let mut s_t = 0.0f64;
            let mut n = 0usize;
            for ((&v, &mv), &bv) in slice.iter().zip(sim.iter()).zip(b.iter()) {
                if v > 0.0 && mv > 0.0 {
                    let corrected = v as f64 * (-bv as f64).exp() * sc;
                    s_t += corrected;
                    s_diff += (corrected - mv as f64).powi(2);
                    n += 1;
                }
            }
            if n > 0 && s_t > 0.0 {
                (s_diff / n as f64).sqrt() / (s_t / n as f64)
            } else {
                0.0
            }
        })
        .collect();

    let valid: Vec<f64> = nrmse.into_iter().filter(|v| *v > 0.0).collect();
    if valid.is_empty() {
        0.0
    } else {
        valid.iter().sum::<f64>() / valid.len() as f64
    }
}

/// 逐迭代质量指标.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    /// 切片与模拟的平均 NCC.
    pub mean_ncc: f64,

    /// 平均 NRMSE.
    pub mean_nrmse: f64,

    /// mask 内平均体积权重.
    pub average_volume_weight: f64,

    /// 被剔除切片 (W < 0.5) 的占比.
    pub excluded_ratio: f64,
}

/// 汇总当前迭代的质量指标. 非有限值按 0 报告.
pub fn recon_quality_report(store: &SliceStore, average_volume_weight: f64) -> QualityReport {
    let nccs: Vec<f64> = (0..store.len())
        .into_par_iter()
        .map(|idx| {
            let mut corrected = store.slices[idx].clone();
            let sc = store.scale[idx];
            let b = store.bias[idx].plane();
            {
                let mut p = corrected.plane_mut();
                for (v, &bv) in p.iter_mut().zip(b.iter()) {
                    if *v > ACTIVE_EPS {
                        *v = (*v as f64 * (-bv as f64).exp() * sc) as f32;
                    }
                }
            }
            let ncc = compute_ncc(&corrected, &store.simulated_slices[idx], 0.01, None);
            if ncc > 0.0 {
                ncc
            } else {
                0.0
            }
        })
        .collect();

    let n = store.len().max(1) as f64;
    let mut mean_ncc = nccs.iter().sum::<f64>() / n;
    let mut mean_nrmse = evaluate_recon_quality(store);
    if !mean_ncc.is_finite() {
        mean_ncc = 0.0;
    }
    if !mean_nrmse.is_finite() {
        mean_nrmse = 0.0;
    }

    let excluded = store.slice_weight.iter().filter(|w| **w < 0.5).count();
    QualityReport {
        mean_ncc,
        mean_nrmse,
        average_volume_weight,
        excluded_ratio: excluded as f64 / n,
    }
}

/// 一次迭代的切片分类清单.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// ROI 内且权重 ≥ 0.5 的切片.
    pub included: Vec<usize>,

    /// ROI 内但权重 < 0.5 的切片.
    pub excluded: Vec<usize>,

    /// 与 ROI 无交的切片.
    pub outside: Vec<usize>,
}

/// 生成并记录 included/excluded/outside 清单.
pub fn evaluate(store: &SliceStore, iter: usize) -> IterationReport {
    let mut report = IterationReport::default();
    for i in 0..store.len() {
        if store.slice_inside[i] {
            if store.slice_weight[i] >= 0.5 {
                report.included.push(i);
            } else {
                report.excluded.push(i);
            }
        } else {
            report.outside.push(i);
        }
    }

    let mut msg = format!("Iteration {iter}:\n");
    let _ = writeln!(
        msg,
        "Included slices: {:?}\nTotal: {}",
        report.included,
        report.included.len()
    );
    let _ = writeln!(
        msg,
        "Excluded slices: {:?}\nTotal: {}",
        report.excluded,
        report.excluded.len()
    );
    let _ = writeln!(
        msg,
        "Outside slices: {:?}\nTotal: {}",
        report.outside,
        report.outside.len()
    );
    log::info!("{msg}");
    report
}

/// 把逐切片信息写为 CSV 汇总.
///
/// 列依次为 stack_index, stack_name, included, excluded, outside,
/// weight, scale, Tx, Ty, Tz, Rx, Ry, Rz.
pub fn save_slice_info<P: AsRef<Path>>(
    store: &SliceStore,
    stack_names: &[String],
    path: P,
) -> std::io::Result<()> {
    let mut out = String::from(
        "stack_index,stack_name,included,excluded,outside,weight,scale,Tx,Ty,Tz,Rx,Ry,Rz\n",
    );
    for i in 0..store.len() {
        let t = &store.transformations[i];
        let stack = store.stack_index[i];
        let inside = store.slice_inside[i];
        let w = store.slice_weight[i];
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            stack,
            stack_names.get(stack).map(String::as_str).unwrap_or(""),
            u8::from(w >= 0.5 && inside),
            u8::from(w < 0.5 && inside),
            u8::from(!inside),
            w,
            store.scale[i],
            t.tx(),
            t.ty(),
            t.tz(),
            t.rx(),
            t.ry(),
            t.rz(),
        );
    }
    std::fs::write(path, out)
}

/// 堆叠内部统计: (mask 体积 cc, 相邻切片平均 NCC).
/// 相邻切片相关性低指示堆叠内运动.
pub fn stack_stats(stack: &VoxelGrid, mask: &VoxelGrid) -> (f64, f64) {
    assert_eq!(stack.shape(), mask.shape(), "堆叠与 mask 形状不一致");
    let mut masked = stack.clone();
    for (v, &m) in masked.data_mut().iter_mut().zip(mask.data().iter()) {
        *v *= m;
    }

    let (nz, ny, nx) = masked.shape();
    let sh = 1usize;
    let mut ncc_sum = 0.0;
    let mut ncc_n = 0usize;
    if ny > 2 * sh && nx > 2 * sh {
        for z in 0..nz.saturating_sub(1) {
            let a = masked.region(sh, sh, z, nx - sh, ny - sh, z + 1);
            let b = masked.region(sh, sh, z + 1, nx - sh, ny - sh, z + 2);
            let ncc = compute_ncc(&a, &b, 0.0, None);
            if ncc > 0.0 {
                ncc_sum += ncc;
                ncc_n += 1;
            }
        }
    }
    let slice_ncc = if ncc_n > 0 { ncc_sum / ncc_n as f64 } else { 0.0 };

    let mask_count = mask.data().iter().filter(|v| **v > 0.01).count();
    let mask_volume = mask_count as f64 * mask.geom().voxel_volume() / 1000.0;
    (mask_volume, slice_ncc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::ImageGeometry;

    fn grid_from(vals: &[f32], n: usize) -> VoxelGrid {
        let g = ImageGeometry::axial((1, 1, n), [1.0, 1.0, 1.0], [0.0; 3]);
        let mut v = VoxelGrid::zeros(g);
        for (x, &val) in vals.iter().enumerate() {
            v.set(x, 0, 0, val);
        }
        v
    }

    /// 完全相关的序列 NCC 应为 1, 反相关为 -1 附近.
    #[test]
    fn test_ncc_basic() {
        let a = grid_from(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 6);
        let b = grid_from(&[2.0, 4.0, 6.0, 8.0, 10.0, 12.0], 6);
        assert!((compute_ncc(&a, &b, 0.0, None) - 1.0).abs() < 1e-9);
    }

    /// 样本不足时返回 -1.
    #[test]
    fn test_ncc_too_few_samples() {
        let a = grid_from(&[1.0, 2.0], 6);
        let b = grid_from(&[1.0, 2.0], 6);
        assert_eq!(compute_ncc(&a, &b, 0.0, None), -1.0);
    }

    /// 零方差返回 0, count 给出联合有效数.
    #[test]
    fn test_ncc_constant_and_count() {
        let a = grid_from(&[5.0; 6], 6);
        let b = grid_from(&[5.0; 6], 6);
        let mut count = 0.0;
        assert_eq!(compute_ncc(&a, &b, 0.0, Some(&mut count)), 0.0);
        assert_eq!(count, 6.0);
    }

    /// mask 体积换算为 cc.
    #[test]
    fn test_stack_stats_volume() {
        let g = ImageGeometry::axial((2, 10, 10), [1.0, 1.0, 5.0], [0.0; 3]);
        let stack = VoxelGrid::filled(g.clone(), 10.0);
        let mask = VoxelGrid::filled(g, 1.0);
        let (vol, _) = stack_stats(&stack, &mask);
        // 200 体素 × 5 mm³ = 1000 mm³ = 1 cc.
        assert!((vol - 1.0).abs() < 1e-9);
    }
}
