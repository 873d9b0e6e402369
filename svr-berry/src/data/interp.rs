//! 带 padding 语义的插值与重采样.

use super::VoxelGrid;
use crate::geom::{ImageGeometry, RigidTransform};

/// 在连续体素坐标 `(x, y, z)` 处做 padding 感知的三线性插值.
///
/// 低于 `pad_threshold` 的体素不参与插值; 八个角点全部无效或坐标
/// 完全越界时返回 `None`, 否则按有效角点权重重归一.
pub fn interp_linear_padded(grid: &VoxelGrid, p: [f64; 3], pad_threshold: f32) -> Option<f32> {
    let (nz, ny, nx) = grid.shape();
    let (x, y, z) = (p[0], p[1], p[2]);
    if x < -0.5 || y < -0.5 || z < -0.5 {
        return None;
    }
    if x > nx as f64 - 0.5 || y > ny as f64 - 0.5 || z > nz as f64 - 0.5 {
        return None;
    }

    let x0 = x.floor() as isize;
    let y0 = y.floor() as isize;
    let z0 = z.floor() as isize;
    let (fx, fy, fz) = (x - x0 as f64, y - y0 as f64, z - z0 as f64);

    let mut acc = 0.0f64;
    let mut wsum = 0.0f64;
    for dz in 0..2isize {
        let wz = if dz == 0 { 1.0 - fz } else { fz };
        if wz == 0.0 {
            continue;
        }
        for dy in 0..2isize {
            let wy = if dy == 0 { 1.0 - fy } else { fy };
            if wy == 0.0 {
                continue;
            }
            for dx in 0..2isize {
                let wx = if dx == 0 { 1.0 - fx } else { fx };
                if wx == 0.0 {
                    continue;
                }
                let (xi, yi, zi) = (x0 + dx, y0 + dy, z0 + dz);
                if xi < 0 || yi < 0 || zi < 0 {
                    continue;
                }
                let (xi, yi, zi) = (xi as usize, yi as usize, zi as usize);
                if xi >= nx || yi >= ny || zi >= nz {
                    continue;
                }
                let v = grid.at(xi, yi, zi);
                if v > pad_threshold {
                    let w = wx * wy * wz;
                    acc += w * v as f64;
                    wsum += w;
                }
            }
        }
    }

    if wsum > 0.0 {
        Some((acc / wsum) as f32)
    } else {
        None
    }
}

/// 把 `src` 重采样到分辨率为 `d` 的各向同性网格, 视野不变.
/// 无有效数据的目标体素填充 `fill`.
pub fn resample_with_padding(src: &VoxelGrid, d: f64, pad_threshold: f32, fill: f32) -> VoxelGrid {
    let geom = src.geom().isotropic_like(d);
    resample_onto(src, &geom, pad_threshold, fill)
}

/// 把 `src` 重采样到给定几何的网格上 (无位姿变换).
pub fn resample_onto(
    src: &VoxelGrid,
    target: &ImageGeometry,
    pad_threshold: f32,
    fill: f32,
) -> VoxelGrid {
    resample_under_pose(src, &RigidTransform::identity(), target, pad_threshold, fill)
}

/// 在位姿 `pose` 下把 `src` 重采样到 `target` 几何:
/// 对每个目标体素, 先映射到世界系, 经 `pose` 变换后落回 `src`
/// 体素坐标, 再做 padding 感知线性插值. 无效处填 `fill`.
pub fn resample_under_pose(
    src: &VoxelGrid,
    pose: &RigidTransform,
    target: &ImageGeometry,
    pad_threshold: f32,
    fill: f32,
) -> VoxelGrid {
    let mut out = VoxelGrid::filled(target.clone(), fill);
    let (nz, ny, nx) = target.shape();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let w = target.image_to_world([x as f64, y as f64, z as f64]);
                let p = src.geom().world_to_image(pose.transform_point(w));
                if let Some(v) = interp_linear_padded(src, p, pad_threshold) {
                    out.set(x, y, z, v);
                }
            }
        }
    }
    out
}

/// 以最近邻方式把二值 mask 变换到 `target` 几何.
/// 落在 mask 之外的目标体素记 0.
pub fn transform_mask(mask: &VoxelGrid, pose: &RigidTransform, target: &ImageGeometry) -> VoxelGrid {
    let mut out = VoxelGrid::zeros(target.clone());
    let (nz, ny, nx) = target.shape();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let w = target.image_to_world([x as f64, y as f64, z as f64]);
                let p = mask.geom().world_to_image(pose.transform_point(w));
                if let Some(idx) = mask.geom().contains_rounded(p) {
                    out.set(x, y, z, mask[idx]);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::ImageGeometry;

    #[test]
    fn test_interp_exact_on_grid_points() {
        let g = ImageGeometry::axial((2, 2, 2), [1.0; 3], [0.0; 3]);
        let mut grid = VoxelGrid::zeros(g);
        grid.set(1, 0, 0, 4.0);
        assert_eq!(interp_linear_padded(&grid, [1.0, 0.0, 0.0], -0.01), Some(4.0));
        assert_eq!(interp_linear_padded(&grid, [0.5, 0.0, 0.0], -0.01), Some(2.0));
        assert_eq!(interp_linear_padded(&grid, [9.0, 0.0, 0.0], -0.01), None);
    }

    /// padding 角点不应稀释插值结果.
    #[test]
    fn test_interp_skips_padding_corner() {
        let g = ImageGeometry::axial((1, 2, 2), [1.0; 3], [0.0; 3]);
        let mut grid = VoxelGrid::filled(g, 8.0);
        grid.set(0, 0, 0, -1.0);
        let v = interp_linear_padded(&grid, [0.5, 0.5, 0.0], -0.01).unwrap();
        assert!((v - 8.0).abs() < 1e-6);
    }

    /// 恒等位姿下的同几何重采样应是恒等操作.
    #[test]
    fn test_resample_identity() {
        let g = ImageGeometry::axial((3, 3, 3), [1.0; 3], [0.0; 3]);
        let mut grid = VoxelGrid::zeros(g.clone());
        grid.set(1, 2, 0, 5.0);
        let out = resample_onto(&grid, &g, -0.01, 0.0);
        assert_eq!(out.at(1, 2, 0), 5.0);
        assert_eq!(out.at(0, 0, 0), 0.0);
    }

    /// 平移位姿应把内容搬运相应的整数体素.
    #[test]
    fn test_resample_translation() {
        let g = ImageGeometry::axial((1, 1, 5), [1.0; 3], [0.0; 3]);
        let mut grid = VoxelGrid::zeros(g.clone());
        grid.set(2, 0, 0, 1.0);
        // pose 把目标世界点映射到源世界点: +1mm 的采样位移.
        let pose = RigidTransform::from_translation(1.0, 0.0, 0.0);
        let out = resample_under_pose(&grid, &pose, &g, -0.01, 0.0);
        assert_eq!(out.at(1, 0, 0), 1.0);
    }
}
