//! 可分离高斯滤波.

use super::VoxelGrid;
use ndarray::{Array3, Axis};
use num::Float;

/// 构建归一化的一维高斯核, 半径取 `ceil(3σ)`.
///
/// `sigma` 以体素为单位. `sigma <= 0` 时返回单位冲激.
pub fn gaussian_kernel<F: Float>(sigma: F) -> Vec<F> {
    if sigma <= F::zero() {
        return vec![F::one()];
    }
    let radius = (sigma * F::from(3.0).unwrap()).ceil().to_usize().unwrap().max(1);
    let denom = F::from(2.0).unwrap() * sigma * sigma;
    let mut kernel: Vec<F> = (0..=2 * radius)
        .map(|i| {
            let d = F::from(i as isize - radius as isize).unwrap();
            (-d * d / denom).exp()
        })
        .collect();
    let sum = kernel.iter().fold(F::zero(), |acc, v| acc + *v);
    for v in kernel.iter_mut() {
        *v = *v / sum;
    }
    kernel
}

/// 沿单轴做一次一维卷积. 边界按截断核重归一处理.
fn convolve_axis(data: &Array3<f32>, kernel: &[f64], axis: usize) -> Array3<f32> {
    let radius = kernel.len() / 2;
    let mut out = data.clone();
    let n = data.len_of(Axis(axis));
    if n == 1 || kernel.len() == 1 {
        return out;
    }
    for (lane_in, mut lane_out) in data
        .lanes(Axis(axis))
        .into_iter()
        .zip(out.lanes_mut(Axis(axis)))
    {
        for i in 0..n {
            let mut acc = 0.0f64;
            let mut wsum = 0.0f64;
            for (k, &w) in kernel.iter().enumerate() {
                let j = i as isize + k as isize - radius as isize;
                if j >= 0 && (j as usize) < n {
                    acc += w * lane_in[j as usize] as f64;
                    wsum += w;
                }
            }
            lane_out[i] = (acc / wsum) as f32;
        }
    }
    out
}

/// 对网格做各向异性可分离高斯滤波. `sigma_vox` 按 `[x, y, z]`
/// 顺序给出, 以体素为单位.
pub fn blur_grid(grid: &mut VoxelGrid, sigma_vox: [f64; 3]) {
    let mut data = grid.data().to_owned();
    // 轴 0/1/2 分别是 z/h/w.
    for (axis, sigma) in [(2usize, sigma_vox[0]), (1, sigma_vox[1]), (0, sigma_vox[2])] {
        if sigma > 0.0 {
            data = convolve_axis(&data, &gaussian_kernel(sigma), axis);
        }
    }
    grid.data_mut().assign(&data);
}

/// padding 感知的高斯滤波: 低于 `pad_threshold` 的体素不参与卷积,
/// 且在输出中保持原值. 对应带 padding 的模糊算子.
pub fn blur_grid_padded(grid: &mut VoxelGrid, sigma_vox: [f64; 3], pad_threshold: f32) {
    let src = grid.data().to_owned();
    let mut value = src.clone();
    let mut mask = Array3::<f32>::zeros(src.dim());
    for (v, m) in value.iter_mut().zip(mask.iter_mut()) {
        if *v > pad_threshold {
            *m = 1.0;
        } else {
            *v = 0.0;
        }
    }

    for (axis, sigma) in [(2usize, sigma_vox[0]), (1, sigma_vox[1]), (0, sigma_vox[2])] {
        if sigma > 0.0 {
            let kernel = gaussian_kernel(sigma);
            value = convolve_axis(&value, &kernel, axis);
            mask = convolve_axis(&mask, &kernel, axis);
        }
    }

    for ((out, &v), (&m, &orig)) in grid
        .data_mut()
        .iter_mut()
        .zip(value.iter())
        .zip(mask.iter().zip(src.iter()))
    {
        if orig > pad_threshold {
            *out = if m > 0.0 { v / m } else { orig };
        }
        // padding 体素保持原值.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::ImageGeometry;

    #[test]
    fn test_kernel_normalized() {
        let k: Vec<f64> = gaussian_kernel(1.3);
        let sum: f64 = k.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert_eq!(k.len() % 2, 1);
    }

    /// 常值图像在滤波后应保持不变.
    #[test]
    fn test_blur_constant_invariant() {
        let g = ImageGeometry::axial((5, 5, 5), [1.0; 3], [0.0; 3]);
        let mut grid = VoxelGrid::filled(g, 3.0);
        blur_grid(&mut grid, [1.0, 1.0, 1.0]);
        for &v in grid.data().iter() {
            assert!((v - 3.0).abs() < 1e-5);
        }
    }

    /// 滤波应保持总量 (对内部远离边界的冲激).
    #[test]
    fn test_blur_spreads_impulse() {
        let g = ImageGeometry::axial((9, 9, 9), [1.0; 3], [0.0; 3]);
        let mut grid = VoxelGrid::zeros(g);
        grid.set(4, 4, 4, 1.0);
        blur_grid(&mut grid, [1.0, 1.0, 1.0]);
        let sum: f64 = grid.data().iter().map(|v| *v as f64).sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert!(grid.at(4, 4, 4) < 1.0);
        assert!(grid.at(3, 4, 4) > 0.0);
    }

    /// padding 感知滤波不应让 padding 值渗入有效区域.
    #[test]
    fn test_padded_blur_ignores_padding() {
        let g = ImageGeometry::axial((1, 5, 5), [1.0, 1.0, 3.0], [0.0; 3]);
        let mut grid = VoxelGrid::filled(g, 10.0);
        grid.set(0, 0, 0, -1.0);
        blur_grid_padded(&mut grid, [1.0, 1.0, 0.0], -0.01);
        // padding 像素保持不动.
        assert_eq!(grid.at(0, 0, 0), -1.0);
        // 有效像素不受 -1 污染, 仍为常值.
        assert!((grid.at(2, 2, 0) - 10.0).abs() < 1e-5);
        assert!((grid.at(1, 0, 0) - 10.0).abs() < 1e-5);
    }
}
