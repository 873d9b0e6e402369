//! 三维体素网格.

use crate::consts::{ACTIVE_EPS, PADDING};
use crate::geom::ImageGeometry;
use crate::Idx3d;
use ndarray::{Array3, ArrayView2, ArrayView3, ArrayViewMut2, ArrayViewMut3, Axis};
use std::ops::{Index, IndexMut};

/// 标量三维网格: `[z, h, w]` 顺序的 `f32` 数据加一份几何属性.
///
/// 体积、mask、二维切片 (nz = 1, `dz` 为采集层厚) 共用该结构,
/// 与原始采集数据保持同一套世界坐标语义.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGrid {
    data: Array3<f32>,
    geom: ImageGeometry,
}

impl Index<Idx3d> for VoxelGrid {
    type Output = f32;

    /// 以 `(z, h, w)` 顺序索引, 与底层存储一致.
    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for VoxelGrid {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl VoxelGrid {
    /// 零值网格.
    #[inline]
    pub fn zeros(geom: ImageGeometry) -> Self {
        Self::filled(geom, 0.0)
    }

    /// 常值网格.
    #[inline]
    pub fn filled(geom: ImageGeometry, value: f32) -> Self {
        Self {
            data: Array3::from_elem(geom.shape(), value),
            geom,
        }
    }

    /// 由裸数据与几何属性构建. 形状不一致时 panic.
    pub fn from_array(data: Array3<f32>, geom: ImageGeometry) -> Self {
        assert_eq!(
            data.dim(),
            geom.shape(),
            "数据形状与几何属性不一致"
        );
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().to_owned()
        };
        Self { data, geom }
    }

    /// 几何属性.
    #[inline]
    pub fn geom(&self) -> &ImageGeometry {
        &self.geom
    }

    /// 覆写几何属性. 形状不一致时 panic.
    pub fn set_geom(&mut self, geom: ImageGeometry) {
        assert_eq!(self.data.dim(), geom.shape(), "数据形状与几何属性不一致");
        self.geom = geom;
    }

    /// (nz, ny, nx).
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.geom.shape()
    }

    /// 体素总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 网格是否为空 (恒为 `false`, 几何属性保证非零尺寸).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 以连续坐标习惯 `(x, y, z)` 读取体素.
    #[inline]
    pub fn at(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[(z, y, x)]
    }

    /// 以连续坐标习惯 `(x, y, z)` 写入体素.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, v: f32) {
        self.data[(z, y, x)] = v;
    }

    /// 数据的不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// 数据的可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, f32> {
        self.data.view_mut()
    }

    /// 作为二维平面的视图. 仅对 nz = 1 的切片网格有意义, 否则 panic.
    #[inline]
    pub fn plane(&self) -> ArrayView2<'_, f32> {
        assert_eq!(self.shape().0, 1, "plane() 仅适用于单层切片网格");
        self.data.index_axis(Axis(0), 0)
    }

    /// 作为二维平面的可变视图. 仅对 nz = 1 的切片网格有意义, 否则 panic.
    #[inline]
    pub fn plane_mut(&mut self) -> ArrayViewMut2<'_, f32> {
        assert_eq!(self.shape().0, 1, "plane_mut() 仅适用于单层切片网格");
        self.data.index_axis_mut(Axis(0), 0)
    }

    /// 全图最小/最大值.
    pub fn min_max(&self) -> (f32, f32) {
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in self.data.iter() {
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
        (min, max)
    }

    /// 有效 (非 padding) 像素个数.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.data.iter().filter(|v| **v > ACTIVE_EPS).count()
    }

    /// 将全部体素置为同一值.
    #[inline]
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// 从 3D 堆叠中抽取第 `j` 层切片, 层厚覆写为 `thickness`.
    /// 切片继承母网格的世界位置.
    pub fn extract_slice(&self, j: usize, thickness: f64) -> VoxelGrid {
        let geom = self.geom.slice_geometry(j, thickness);
        let data = self
            .data
            .index_axis(Axis(0), j)
            .to_owned()
            .insert_axis(Axis(0));
        VoxelGrid::from_array(data, geom)
    }

    /// 抽取 `[x1, x2) × [y1, y2) × [z1, z2)` 子区域, 保持世界位置.
    pub fn region(&self, x1: usize, y1: usize, z1: usize, x2: usize, y2: usize, z2: usize) -> VoxelGrid {
        assert!(x1 < x2 && y1 < y2 && z1 < z2, "子区域为空");
        let (nz, ny, nx) = self.shape();
        assert!(x2 <= nx && y2 <= ny && z2 <= nz, "子区域越界");
        let data = self
            .data
            .slice(ndarray::s![z1..z2, y1..y2, x1..x2])
            .to_owned();
        let center = self.geom.image_to_world([
            (x1 + x2) as f64 / 2.0 - 0.5,
            (y1 + y2) as f64 / 2.0 - 0.5,
            (z1 + z2) as f64 / 2.0 - 0.5,
        ]);
        let geom = ImageGeometry::new(
            (z2 - z1, y2 - y1, x2 - x1),
            self.geom.spacing(),
            center,
            self.geom.axes(),
        );
        VoxelGrid::from_array(data, geom)
    }

    /// 将所有 padding 体素钳到 0 (用于配准前的预处理).
    pub fn clamp_padding_to_zero(&mut self) {
        for v in self.data.iter_mut() {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
    }

    /// 判断切片内容是否 "近似为零": 最大值或动态范围不超过 1.
    /// 这样的切片不值得参与配准.
    pub fn is_zero_content(&self) -> bool {
        let (min, max) = self.min_max();
        !(max > 1.0 && max - min > 1.0)
    }

    /// 以 padding 值构建与 `self` 同几何的网格.
    #[inline]
    pub fn like_padding(&self) -> VoxelGrid {
        VoxelGrid::filled(self.geom.clone(), PADDING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_slice_geometry() {
        let g = ImageGeometry::axial((4, 8, 6), [1.0, 1.0, 2.0], [0.0; 3]);
        let mut grid = VoxelGrid::zeros(g);
        grid.set(2, 3, 1, 7.0);
        let slice = grid.extract_slice(1, 3.5);
        assert_eq!(slice.shape(), (1, 8, 6));
        assert_eq!(slice.at(2, 3, 0), 7.0);
        assert!((slice.geom().dz() - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_region_preserves_world_position() {
        let g = ImageGeometry::axial((6, 6, 6), [1.0, 1.0, 1.0], [2.0, -1.0, 0.5]);
        let mut grid = VoxelGrid::zeros(g);
        grid.set(3, 4, 5, 1.0);
        let r = grid.region(2, 3, 4, 6, 6, 6);
        assert_eq!(r.shape(), (2, 3, 4));
        assert_eq!(r.at(1, 1, 1), 1.0);
        // 子区域体素 (1, 1, 1) 与母网格 (3, 4, 5) 应为同一世界点.
        let a = grid.geom().image_to_world([3.0, 4.0, 5.0]);
        let b = r.geom().image_to_world([1.0, 1.0, 1.0]);
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < 1e-9, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_zero_content() {
        let g = ImageGeometry::axial((1, 4, 4), [1.0, 1.0, 3.0], [0.0; 3]);
        let mut s = VoxelGrid::zeros(g);
        assert!(s.is_zero_content());
        s.set(0, 0, 0, 100.0);
        assert!(!s.is_zero_content());
    }
}
