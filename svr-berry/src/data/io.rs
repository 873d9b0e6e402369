//! NIfTI 读写.
//!
//! 磁盘上的 nii 体数据按 `[w, h, z]` 存储, 读入后转为本 crate 的
//! `[z, h, w]` 标准布局; 写出时做逆变换.

use super::VoxelGrid;
use crate::geom::ImageGeometry;
use ndarray::Array3;
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

/// 从 NIfTI 头恢复几何属性.
///
/// 优先使用 sform 仿射; `sform_code == 0` 时退化为以 `pixdim`
/// 与 `qoffset` 描述的轴对齐几何.
fn geometry_from_header(h: &NiftiHeader, shape: (usize, usize, usize)) -> ImageGeometry {
    let (nz, ny, nx) = shape;
    let [_, pw, ph, pz, ..] = h.pixdim;
    let spacing = [pw.abs() as f64, ph.abs() as f64, pz.abs() as f64];
    let center = [
        (nx as f64 - 1.0) / 2.0,
        (ny as f64 - 1.0) / 2.0,
        (nz as f64 - 1.0) / 2.0,
    ];

    if h.sform_code > 0 {
        let rows = [h.srow_x, h.srow_y, h.srow_z];
        let mut axes = [[0.0f64; 3]; 3];
        for j in 0..3 {
            let norm = (0..3)
                .map(|i| (rows[i][j] as f64).powi(2))
                .sum::<f64>()
                .sqrt();
            for i in 0..3 {
                axes[j][i] = if norm > 0.0 {
                    rows[i][j] as f64 / norm
                } else if i == j {
                    1.0
                } else {
                    0.0
                };
            }
        }
        // srow 的平移列是体素 (0,0,0) 的世界坐标; origin 是图像中心.
        let mut origin = [rows[0][3] as f64, rows[1][3] as f64, rows[2][3] as f64];
        for (j, axis) in axes.iter().enumerate() {
            for i in 0..3 {
                origin[i] += axis[i] * spacing[j] * center[j];
            }
        }
        ImageGeometry::new(shape, spacing, origin, axes)
    } else {
        let origin = [
            h.quatern_x as f64 + spacing[0] * center[0],
            h.quatern_y as f64 + spacing[1] * center[1],
            h.quatern_z as f64 + spacing[2] * center[2],
        ];
        ImageGeometry::axial(shape, spacing, origin)
    }
}

/// 由几何属性构建 NIfTI 头 (sform 仿射).
fn header_from_geometry(geom: &ImageGeometry) -> NiftiHeader {
    let (nz, ny, nx) = geom.shape();
    let [dx, dy, dz] = geom.spacing();
    let mut h = NiftiHeader::default();
    h.dim = [3, nx as u16, ny as u16, nz as u16, 1, 1, 1, 1];
    h.pixdim = [1.0, dx as f32, dy as f32, dz as f32, 0.0, 0.0, 0.0, 0.0];
    h.sform_code = 1;
    h.qform_code = 0;

    let axes = geom.axes();
    let center = [
        (nx as f64 - 1.0) / 2.0,
        (ny as f64 - 1.0) / 2.0,
        (nz as f64 - 1.0) / 2.0,
    ];
    // 体素 (0,0,0) 的世界坐标.
    let mut t = geom.origin();
    for (j, axis) in axes.iter().enumerate() {
        for i in 0..3 {
            t[i] -= axis[i] * geom.spacing()[j] * center[j];
        }
    }
    let row = |i: usize| {
        [
            (axes[0][i] * dx) as f32,
            (axes[1][i] * dy) as f32,
            (axes[2][i] * dz) as f32,
            t[i] as f32,
        ]
    };
    h.srow_x = row(0);
    h.srow_y = row(1);
    h.srow_z = row(2);
    h
}

impl VoxelGrid {
    /// 打开 nii/nii.gz 文件. 数据以 `f32` 载入.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = obj.header().clone();

        // [W, H, z] -> [z, H, W].
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()?
            .permuted_axes(vec![2, 1, 0]);
        let shape: Vec<usize> = data.shape().to_vec();
        assert_eq!(shape.len(), 3, "只支持三维 nii 数据");
        // 元素个数与形状匹配, 该操作不会生成 `Err`, 可直接 unwrap.
        let data = Array3::from_shape_vec(
            (shape[0], shape[1], shape[2]),
            data.iter().copied().collect(),
        )
        .unwrap();

        let geom = geometry_from_header(&header, (shape[0], shape[1], shape[2]));
        Ok(VoxelGrid::from_array(data, geom))
    }

    /// 将网格保存为 nii/nii.gz 文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), nifti::NiftiError> {
        let header = header_from_geometry(self.geom());
        // [z, H, W] -> [W, H, z].
        let out = self.data().permuted_axes([2, 1, 0]).as_standard_layout().to_owned();
        WriterOptions::new(path.as_ref())
            .reference_header(&header)
            .write_nifti(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 几何属性经头字段往返后应保持一致.
    #[test]
    fn test_header_geometry_roundtrip() {
        let g = ImageGeometry::axial((4, 6, 8), [0.8, 1.25, 3.0], [5.0, -7.0, 2.0]);
        let h = header_from_geometry(&g);
        let back = geometry_from_header(&h, (4, 6, 8));
        let (s0, s1) = (g.spacing(), back.spacing());
        let (o0, o1) = (g.origin(), back.origin());
        for i in 0..3 {
            assert!((s0[i] - s1[i]).abs() < 1e-5);
            assert!((o0[i] - o1[i]).abs() < 1e-4, "{o0:?} != {o1:?}");
        }
    }
}
