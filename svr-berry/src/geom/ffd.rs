//! 自由形变 (FFD): 均匀三次 B 样条控制点网格上的位移场.
//!
//! 作为逐切片刚体运动模型的替代. 控制点存储世界系位移向量,
//! 任意世界点的位移由 4×4×4 邻域的三次 B 样条权重插值得到.

use super::ImageGeometry;

/// 三次 B 样条基函数在 `u ∈ [0, 1)` 处的四个权重.
#[inline]
fn bspline_weights(u: f64) -> [f64; 4] {
    let u2 = u * u;
    let u3 = u2 * u;
    [
        (1.0 - u).powi(3) / 6.0,
        (3.0 * u3 - 6.0 * u2 + 4.0) / 6.0,
        (-3.0 * u3 + 3.0 * u2 + 3.0 * u + 1.0) / 6.0,
        u3 / 6.0,
    ]
}

/// 均匀三次 B 样条自由形变.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeFormTransform {
    /// 控制点 (0, 0, 0) 的世界坐标.
    origin: [f64; 3],

    /// 控制点间距 (毫米), 三个方向相同.
    spacing: f64,

    /// 控制点网格尺寸 (cz, cy, cx).
    dims: (usize, usize, usize),

    /// 控制点位移, 行优先 `[cz, cy, cx]`.
    disp: Vec<[f64; 3]>,
}

impl FreeFormTransform {
    /// 构建覆盖 `domain` 视野的恒等 FFD (全部位移为零).
    /// 网格向外各扩一圈, 保证边界处 4 点支撑完整.
    pub fn identity(domain: &ImageGeometry, cp_spacing: f64) -> Self {
        assert!(cp_spacing > 0.0, "控制点间距必须为正");
        let lo = domain.image_to_world([0.0, 0.0, 0.0]);
        let hi = domain.image_to_world([
            domain.nx() as f64 - 1.0,
            domain.ny() as f64 - 1.0,
            domain.nz() as f64 - 1.0,
        ]);
        let min = [lo[0].min(hi[0]), lo[1].min(hi[1]), lo[2].min(hi[2])];
        let max = [lo[0].max(hi[0]), lo[1].max(hi[1]), lo[2].max(hi[2])];
        let count =
            |i: usize| ((max[i] - min[i]) / cp_spacing).ceil() as usize + 3;
        let dims = (count(2), count(1), count(0));
        let origin = [
            min[0] - cp_spacing,
            min[1] - cp_spacing,
            min[2] - cp_spacing,
        ];
        Self {
            origin,
            spacing: cp_spacing,
            dims,
            disp: vec![[0.0; 3]; dims.0 * dims.1 * dims.2],
        }
    }

    /// 控制点网格尺寸 (cz, cy, cx).
    #[inline]
    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    /// 控制点间距.
    #[inline]
    pub fn cp_spacing(&self) -> f64 {
        self.spacing
    }

    /// 读取控制点位移.
    #[inline]
    pub fn control_point(&self, cz: usize, cy: usize, cx: usize) -> [f64; 3] {
        self.disp[self.index(cz, cy, cx)]
    }

    /// 覆写控制点位移.
    #[inline]
    pub fn set_control_point(&mut self, cz: usize, cy: usize, cx: usize, d: [f64; 3]) {
        let i = self.index(cz, cy, cx);
        self.disp[i] = d;
    }

    #[inline]
    fn index(&self, cz: usize, cy: usize, cx: usize) -> usize {
        let (dz, dy, dx) = self.dims;
        assert!(cz < dz && cy < dy && cx < dx, "控制点下标越界");
        (cz * dy + cy) * dx + cx
    }

    /// 世界点 `p` 处的位移向量.
    pub fn displacement(&self, p: [f64; 3]) -> [f64; 3] {
        let local = [
            (p[0] - self.origin[0]) / self.spacing,
            (p[1] - self.origin[1]) / self.spacing,
            (p[2] - self.origin[2]) / self.spacing,
        ];
        let base = local.map(|v| v.floor());
        let wx = bspline_weights(local[0] - base[0]);
        let wy = bspline_weights(local[1] - base[1]);
        let wz = bspline_weights(local[2] - base[2]);
        let (dz, dy, dx) = self.dims;
        let clamp = |v: f64, n: usize| (v.max(0.0) as usize).min(n - 1);

        let mut out = [0.0; 3];
        for (kz, wkz) in wz.iter().enumerate() {
            let cz = clamp(base[2] - 1.0 + kz as f64, dz);
            for (ky, wky) in wy.iter().enumerate() {
                let cy = clamp(base[1] - 1.0 + ky as f64, dy);
                for (kx, wkx) in wx.iter().enumerate() {
                    let cx = clamp(base[0] - 1.0 + kx as f64, dx);
                    let w = wkz * wky * wkx;
                    let d = self.disp[(cz * dy + cy) * dx + cx];
                    out[0] += w * d[0];
                    out[1] += w * d[1];
                    out[2] += w * d[2];
                }
            }
        }
        out
    }

    /// 对世界点应用形变.
    #[inline]
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        let d = self.displacement(p);
        [p[0] + d[0], p[1] + d[1], p[2] + d[2]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// B 样条权重在任意 `u` 处应归一.
    #[test]
    fn test_bspline_partition_of_unity() {
        for u in [0.0, 0.25, 0.5, 0.99] {
            let s: f64 = bspline_weights(u).iter().sum();
            assert!((s - 1.0).abs() < 1e-12);
        }
    }

    /// 恒等 FFD 不应移动任何点.
    #[test]
    fn test_identity_ffd() {
        let g = ImageGeometry::axial((8, 8, 8), [1.0, 1.0, 1.0], [0.0; 3]);
        let f = FreeFormTransform::identity(&g, 4.0);
        let p = [1.5, -2.0, 3.0];
        let q = f.transform_point(p);
        for i in 0..3 {
            assert!((p[i] - q[i]).abs() < 1e-12);
        }
    }

    /// 所有控制点同设常位移时, 网格内部的位移应等于该常量.
    #[test]
    fn test_constant_displacement() {
        let g = ImageGeometry::axial((10, 10, 10), [1.0, 1.0, 1.0], [0.0; 3]);
        let mut f = FreeFormTransform::identity(&g, 3.0);
        let (dz, dy, dx) = f.dims();
        for cz in 0..dz {
            for cy in 0..dy {
                for cx in 0..dx {
                    f.set_control_point(cz, cy, cx, [2.0, -1.0, 0.5]);
                }
            }
        }
        let d = f.displacement([0.0, 0.0, 0.0]);
        assert!((d[0] - 2.0).abs() < 1e-9);
        assert!((d[1] + 1.0).abs() < 1e-9);
        assert!((d[2] - 0.5).abs() < 1e-9);
    }
}
