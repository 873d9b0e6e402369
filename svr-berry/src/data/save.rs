//! 二维平面的持久化存储 (调试产物).

use super::VoxelGrid;
use image::ImageResult;
use std::path::Path;

/// 表明一个可以通过 **可视化友好** 模式持久化存储的图像对象.
///
/// 切片平面的浮点强度没有统一的窗口约定, 保存时按有效像素
/// (非 padding) 的最小/最大值线性拉伸到 8-bit 灰度; padding 为黑.
pub trait ImgWriteVis {
    /// 按照可视化规则将图片保存到 `path` 路径.
    fn save_vis<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

/// 仅对 nz = 1 的切片网格实现; 对三维体积调用会 panic.
impl ImgWriteVis for VoxelGrid {
    fn save_vis<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let plane = self.plane();
        let (h, w) = plane.dim();

        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in plane.iter().filter(|v| **v > -0.01) {
            min = min.min(v);
            max = max.max(v);
        }
        let range = if max > min { max - min } else { 1.0 };

        let mut buf = image::GrayImage::new(w as u32, h as u32);
        for ((y, x), &v) in plane.indexed_iter() {
            let gray = if v > -0.01 {
                (((v - min) / range) * 255.0).clamp(0.0, 255.0) as u8
            } else {
                0
            };
            buf.put_pixel(x as u32, y as u32, image::Luma([gray]));
        }
        buf.save(path)
    }
}
