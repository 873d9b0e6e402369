//! 切片-体积系数引擎.
//!
//! 对每个切片像素, 以 Jiang-Rueckert 各向异性高斯 PSF 在目标体积上
//! 采样, 得到 (体素, 权重) 稀疏列表; 全部切片的列表联合构成前向
//! 算子 A. 按切片压缩 (CSR) 存储, 保证超分辨率阶段的顺序访问.
//!
//! 逐切片的构建相互独立、并行执行; 体积权重 `ω = A^T·1` 的累加
//! 按切片串行进行, 保证结果与线程数无关.

use crate::consts::{ACTIVE_EPS, FWHM_TO_SIGMA, PSF_INPLANE_FACTOR};
use crate::data::VoxelGrid;
use crate::geom::ImageGeometry;
use crate::store::SliceStore;
use rayon::prelude::*;
use std::collections::HashMap;

/// 一条系数: 目标体素的线性下标 (`[z, h, w]` 行优先) 与 PSF 权重.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoeffEntry {
    /// 体素线性下标.
    pub voxel: u32,

    /// PSF 权重, 非负.
    pub value: f32,
}

/// 单张切片的系数集合, 按像素压缩存储.
#[derive(Debug, Clone, Default)]
pub struct SliceCoeffs {
    /// 切片宽度 (nx), 用于像素下标换算.
    width: usize,

    /// 每像素条目区间的起点, 长度 = ny·nx + 1.
    offsets: Vec<u32>,

    /// 全部条目, 像素内按体素下标升序.
    entries: Vec<CoeffEntry>,
}

impl SliceCoeffs {
    /// 无任何条目的系数集合 (被剔除切片的占位).
    pub fn empty(ny: usize, nx: usize) -> Self {
        Self {
            width: nx,
            offsets: vec![0; ny * nx + 1],
            entries: Vec::new(),
        }
    }

    /// 像素 `(x, y)` 的条目.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &[CoeffEntry] {
        let i = y * self.width + x;
        &self.entries[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    /// 像素 `(x, y)` 的覆盖度 (权重和).
    #[inline]
    pub fn coverage(&self, x: usize, y: usize) -> f64 {
        self.pixel(x, y).iter().map(|e| e.value as f64).sum()
    }

    /// 非零条目总数.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.entries.len()
    }
}

/// 系数引擎的输出: 逐切片系数、体积权重 `ω` 与 mask 内平均权重.
#[derive(Debug, Clone)]
pub struct CoeffStore {
    /// 逐切片系数 (与切片仓库同序).
    pub per_slice: Vec<SliceCoeffs>,

    /// 体积权重 `ω(X, Y, Z) = Σ v`.
    pub volume_weights: VoxelGrid,

    /// mask 内的平均体积权重.
    pub average_volume_weight: f64,
}

/// PSF 采样网格: 以目标体素尺寸一半为步长, 覆盖 ±2σ 支撑.
struct PsfSampler {
    /// 每个采样点在切片坐标系下的毫米偏移与高斯权重.
    samples: Vec<([f64; 3], f64)>,

    /// 全部采样权重之和 (含落在体积外的), 用于归一.
    total: f64,
}

impl PsfSampler {
    fn new(slice_geom: &ImageGeometry, volume_geom: &ImageGeometry) -> Self {
        let sigma = [
            PSF_INPLANE_FACTOR * slice_geom.dx() / FWHM_TO_SIGMA,
            PSF_INPLANE_FACTOR * slice_geom.dy() / FWHM_TO_SIGMA,
            slice_geom.dz() / FWHM_TO_SIGMA,
        ];
        let [dx, dy, dz] = volume_geom.spacing();
        let step = dx.min(dy).min(dz) / 2.0;

        let axis_samples = |s: f64| -> Vec<(f64, f64)> {
            let r = ((2.0 * s / step).ceil() as isize).max(1);
            (-r..=r)
                .map(|i| {
                    let m = i as f64 * step;
                    (m, (-m * m / (2.0 * s * s)).exp())
                })
                .collect()
        };
        let xs = axis_samples(sigma[0]);
        let ys = axis_samples(sigma[1]);
        let zs = axis_samples(sigma[2]);

        let mut samples = Vec::with_capacity(xs.len() * ys.len() * zs.len());
        let mut total = 0.0;
        for &(mz, wz) in &zs {
            for &(my, wy) in &ys {
                for &(mx, wx) in &xs {
                    let w = wx * wy * wz;
                    total += w;
                    samples.push(([mx, my, mz], w));
                }
            }
        }
        Self { samples, total }
    }
}

/// 构建全部切片的系数与体积权重.
///
/// 被 `force_excluded` 列出的切片与配准门控为负 (`R_i < 0`)
/// 的切片整体跳过, 得到空系数; 其余切片的 `slice_inside`
/// 标记按 "是否有像素命中 mask" 更新.
pub fn coeff_init(
    store: &mut SliceStore,
    volume_geom: &ImageGeometry,
    mask: &VoxelGrid,
    force_excluded: &[usize],
    ffd: bool,
) -> CoeffStore {
    assert_eq!(mask.geom().shape(), volume_geom.shape(), "mask 与体积形状不一致");

    let results: Vec<(SliceCoeffs, bool)> = {
        let s: &SliceStore = store;
        s.slices
            .par_iter()
            .enumerate()
            .map(|(idx, slice)| {
                let (ny, nx) = (slice.geom().ny(), slice.geom().nx());
                let skip = force_excluded.contains(&idx) || s.reg_slice_weight[idx] < 0.0;
                if skip {
                    return (SliceCoeffs::empty(ny, nx), false);
                }
                build_slice_coeffs(s, idx, volume_geom, mask, ffd)
            })
            .collect()
    };

    let mut per_slice = Vec::with_capacity(results.len());
    for (idx, (coeffs, inside)) in results.into_iter().enumerate() {
        store.slice_inside[idx] = inside;
        per_slice.push(coeffs);
    }

    // ω 的累加不并行: 各切片的条目会命中相同体素.
    let mut volume_weights = VoxelGrid::zeros(volume_geom.clone());
    {
        let flat = volume_weights
            .data_mut()
            .into_slice()
            .expect("体积权重必须是标准布局");
        for coeffs in &per_slice {
            for e in &coeffs.entries {
                flat[e.voxel as usize] += e.value;
            }
        }
    }

    let mut sum = 0.0f64;
    let mut num = 0usize;
    for (&w, &m) in volume_weights.data().iter().zip(mask.data().iter()) {
        if m == 1.0 {
            sum += w as f64;
            num += 1;
        }
    }
    let average_volume_weight = if num > 0 { sum / num as f64 } else { 0.0 };
    log::debug!("Average volume weight is {average_volume_weight}");

    CoeffStore {
        per_slice,
        volume_weights,
        average_volume_weight,
    }
}

/// 单张切片的系数构建. 返回 (系数, 是否与 mask 有交).
fn build_slice_coeffs(
    store: &SliceStore,
    idx: usize,
    volume_geom: &ImageGeometry,
    mask: &VoxelGrid,
    ffd: bool,
) -> (SliceCoeffs, bool) {
    let slice = &store.slices[idx];
    let geom = slice.geom();
    let (ny, nx) = (geom.ny(), geom.nx());
    let sampler = PsfSampler::new(geom, volume_geom);
    let axes = geom.axes();

    // 采样偏移从切片系转到世界系; 刚体模式下再经位姿旋转.
    let pose = (!ffd).then(|| &store.transformations[idx]);
    let rot = pose.map(|p| p.rotation_matrix());
    let world_offsets: Vec<[f64; 3]> = sampler
        .samples
        .iter()
        .map(|([mx, my, mz], _)| {
            let mut o = [0.0f64; 3];
            for i in 0..3 {
                o[i] = mx * axes[0][i] + my * axes[1][i] + mz * axes[2][i];
            }
            match &rot {
                Some(r) => [
                    r[0][0] * o[0] + r[0][1] * o[1] + r[0][2] * o[2],
                    r[1][0] * o[0] + r[1][1] * o[1] + r[1][2] * o[2],
                    r[2][0] * o[0] + r[2][1] * o[1] + r[2][2] * o[2],
                ],
                None => o,
            }
        })
        .collect();

    let (vnz, vny, vnx) = volume_geom.shape();
    let plane = slice.plane();
    let mut offsets = Vec::with_capacity(ny * nx + 1);
    offsets.push(0u32);
    let mut entries: Vec<CoeffEntry> = Vec::new();
    let mut inside = false;
    let mut acc: HashMap<u32, f64> = HashMap::new();

    for y in 0..ny {
        for x in 0..nx {
            if plane[(y, x)] > ACTIVE_EPS {
                let center = geom.image_to_world([x as f64, y as f64, 0.0]);
                let base = match pose {
                    Some(p) => p.transform_point(center),
                    None => store.ffd_transformations[idx].transform_point(center),
                };

                acc.clear();
                for (off, &(_, w)) in world_offsets.iter().zip(sampler.samples.iter()) {
                    let p = volume_geom.world_to_image([
                        base[0] + off[0],
                        base[1] + off[1],
                        base[2] + off[2],
                    ]);
                    let (xi, yi, zi) = (p[0].round(), p[1].round(), p[2].round());
                    if xi < 0.0 || yi < 0.0 || zi < 0.0 {
                        continue;
                    }
                    let (xi, yi, zi) = (xi as usize, yi as usize, zi as usize);
                    if xi >= vnx || yi >= vny || zi >= vnz {
                        continue;
                    }
                    let lin = ((zi * vny + yi) * vnx + xi) as u32;
                    *acc.entry(lin).or_insert(0.0) += w;
                    if mask[(zi, yi, xi)] == 1.0 {
                        inside = true;
                    }
                }

                // 以全部采样权重归一: 像素的覆盖度即落入体积内的质量占比.
                let mut pixel_entries: Vec<CoeffEntry> = acc
                    .iter()
                    .filter_map(|(&lin, &w)| {
                        let v = w / sampler.total;
                        (v > 1e-8).then_some(CoeffEntry {
                            voxel: lin,
                            value: v as f32,
                        })
                    })
                    .collect();
                pixel_entries.sort_unstable_by_key(|e| e.voxel);
                entries.extend_from_slice(&pixel_entries);
            }
            offsets.push(entries.len() as u32);
        }
    }

    (
        SliceCoeffs {
            width: nx,
            offsets,
            entries,
        },
        inside,
    )
}
