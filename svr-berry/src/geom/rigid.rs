//! 刚体变换: 三个平移分量 (毫米) 加三个欧拉角 (度).

/// 刚体变换. 旋转按 `Rz·Ry·Rx` 顺序组合, 角度以度为单位存储
/// (与姿态 CSV 汇总及 `.dof` 交换文件一致).
#[derive(Debug, Clone, PartialEq)]
pub struct RigidTransform {
    tx: f64,
    ty: f64,
    tz: f64,
    rx: f64,
    ry: f64,
    rz: f64,
}

impl Default for RigidTransform {
    #[inline]
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    /// 恒等变换.
    #[inline]
    pub const fn identity() -> Self {
        Self {
            tx: 0.0,
            ty: 0.0,
            tz: 0.0,
            rx: 0.0,
            ry: 0.0,
            rz: 0.0,
        }
    }

    /// 纯平移变换.
    #[inline]
    pub const fn from_translation(tx: f64, ty: f64, tz: f64) -> Self {
        Self {
            tx,
            ty,
            tz,
            rx: 0.0,
            ry: 0.0,
            rz: 0.0,
        }
    }

    /// 以六参数构建 (平移毫米, 旋转度).
    #[inline]
    pub const fn from_params(tx: f64, ty: f64, tz: f64, rx: f64, ry: f64, rz: f64) -> Self {
        Self {
            tx,
            ty,
            tz,
            rx,
            ry,
            rz,
        }
    }

    /// 从旋转矩阵与平移向量构建, 欧拉角按 `Rz·Ry·Rx` 分解.
    pub fn from_matrix(r: [[f64; 3]; 3], t: [f64; 3]) -> Self {
        let ry = (-r[2][0]).asin();
        let (rx, rz) = if ry.cos().abs() > 1e-9 {
            (r[2][1].atan2(r[2][2]), r[1][0].atan2(r[0][0]))
        } else {
            // 万向节死锁: 把全部绕 z 的旋转归入 rz.
            (0.0, (-r[0][1]).atan2(r[1][1]))
        };
        Self {
            tx: t[0],
            ty: t[1],
            tz: t[2],
            rx: rx.to_degrees(),
            ry: ry.to_degrees(),
            rz: rz.to_degrees(),
        }
    }

    /// 平移分量 (毫米).
    #[inline]
    pub fn translation(&self) -> [f64; 3] {
        [self.tx, self.ty, self.tz]
    }

    /// 欧拉角分量 (度).
    #[inline]
    pub fn rotation(&self) -> [f64; 3] {
        [self.rx, self.ry, self.rz]
    }

    /// x 方向平移.
    #[inline]
    pub fn tx(&self) -> f64 {
        self.tx
    }

    /// y 方向平移.
    #[inline]
    pub fn ty(&self) -> f64 {
        self.ty
    }

    /// z 方向平移.
    #[inline]
    pub fn tz(&self) -> f64 {
        self.tz
    }

    /// 绕 x 轴旋转角.
    #[inline]
    pub fn rx(&self) -> f64 {
        self.rx
    }

    /// 绕 y 轴旋转角.
    #[inline]
    pub fn ry(&self) -> f64 {
        self.ry
    }

    /// 绕 z 轴旋转角.
    #[inline]
    pub fn rz(&self) -> f64 {
        self.rz
    }

    /// 覆写平移分量.
    #[inline]
    pub fn set_translation(&mut self, tx: f64, ty: f64, tz: f64) {
        (self.tx, self.ty, self.tz) = (tx, ty, tz);
    }

    /// 覆写旋转分量 (度).
    #[inline]
    pub fn set_rotation(&mut self, rx: f64, ry: f64, rz: f64) {
        (self.rx, self.ry, self.rz) = (rx, ry, rz);
    }

    /// 旋转矩阵 (`Rz·Ry·Rx`).
    pub fn rotation_matrix(&self) -> [[f64; 3]; 3] {
        let (sx, cx) = self.rx.to_radians().sin_cos();
        let (sy, cy) = self.ry.to_radians().sin_cos();
        let (sz, cz) = self.rz.to_radians().sin_cos();
        [
            [cz * cy, cz * sy * sx - sz * cx, cz * sy * cx + sz * sx],
            [sz * cy, sz * sy * sx + cz * cx, sz * sy * cx - cz * sx],
            [-sy, cy * sx, cy * cx],
        ]
    }

    /// 对世界坐标点应用该变换.
    #[inline]
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        let r = self.rotation_matrix();
        [
            r[0][0] * p[0] + r[0][1] * p[1] + r[0][2] * p[2] + self.tx,
            r[1][0] * p[0] + r[1][1] * p[1] + r[1][2] * p[2] + self.ty,
            r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + self.tz,
        ]
    }

    /// 复合变换: `self ∘ other`, 即先应用 `other` 再应用 `self`.
    pub fn compose(&self, other: &RigidTransform) -> RigidTransform {
        let a = self.rotation_matrix();
        let b = other.rotation_matrix();
        let mut r = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                r[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
            }
        }
        let t = self.transform_point(other.translation());
        Self::from_matrix(r, t)
    }

    /// 逆变换.
    pub fn inverse(&self) -> RigidTransform {
        let r = self.rotation_matrix();
        // 正交阵: 逆即转置.
        let rt = [
            [r[0][0], r[1][0], r[2][0]],
            [r[0][1], r[1][1], r[2][1]],
            [r[0][2], r[1][2], r[2][2]],
        ];
        let t = [
            -(rt[0][0] * self.tx + rt[0][1] * self.ty + rt[0][2] * self.tz),
            -(rt[1][0] * self.tx + rt[1][1] * self.ty + rt[1][2] * self.tz),
            -(rt[2][0] * self.tx + rt[2][1] * self.ty + rt[2][2] * self.tz),
        ];
        Self::from_matrix(rt, t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt_eq(a: [f64; 3], b: [f64; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_identity() {
        let t = RigidTransform::identity();
        assert!(pt_eq(t.transform_point([1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]));
    }

    /// 矩阵分解应还原六参数.
    #[test]
    fn test_matrix_roundtrip() {
        let t = RigidTransform::from_params(1.5, -2.0, 0.5, 10.0, -20.0, 30.0);
        let back = RigidTransform::from_matrix(t.rotation_matrix(), t.translation());
        let (r0, r1) = (t.rotation(), back.rotation());
        for i in 0..3 {
            assert!((r0[i] - r1[i]).abs() < 1e-9);
        }
    }

    /// `compose` 应等价于依次应用两个变换.
    #[test]
    fn test_compose() {
        let a = RigidTransform::from_params(1.0, 0.0, 0.0, 0.0, 0.0, 90.0);
        let b = RigidTransform::from_params(0.0, 2.0, 0.0, 45.0, 0.0, 0.0);
        let p = [0.3, -1.2, 2.5];
        let once = a.compose(&b).transform_point(p);
        let twice = a.transform_point(b.transform_point(p));
        assert!(pt_eq(once, twice), "{once:?} != {twice:?}");
    }

    /// 逆变换应抵消原变换.
    #[test]
    fn test_inverse() {
        let t = RigidTransform::from_params(3.0, -1.0, 2.0, 15.0, 25.0, -40.0);
        let p = [1.0, 2.0, 3.0];
        assert!(pt_eq(t.inverse().transform_point(t.transform_point(p)), p));
    }
}
