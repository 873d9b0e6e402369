//! 切片采集顺序与 package 拆分.
//!
//! 交错采集 (interleaved acquisition) 下, 同一堆叠内切片的采集时间
//! 与空间位置不一致. package 到体积配准需要知道哪些切片属于同一
//! 时间组, 才能把恢复的位姿广播给正确的切片集合.

use crate::data::VoxelGrid;

/// 切片采集顺序代码.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SliceOrder {
    /// 1: 升序.
    Ascending,

    /// 2: 降序.
    Descending,

    /// 3: 默认交错 (步长为 package 数).
    Interleaved,

    /// 4: 幂次交错 (步长为 √(每 package 切片数)).
    InterleavedSqrt,

    /// 5: 自定义步长/倒带.
    Custom,
}

impl SliceOrder {
    /// 由数字代码构建. 未知代码返回 `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Ascending),
            2 => Some(Self::Descending),
            3 => Some(Self::Interleaved),
            4 => Some(Self::InterleavedSqrt),
            5 => Some(Self::Custom),
            _ => None,
        }
    }
}

/// 一个堆叠的采集顺序排列.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionOrder {
    /// `time_to_pos[t]` = 第 `t` 个被采集的切片的 z 位置.
    pub time_to_pos: Vec<usize>,

    /// `pos_to_time[z]` = z 位置切片的采集序号. 与 `time_to_pos` 互逆.
    pub pos_to_time: Vec<usize>,
}

/// 以 `step` 步进、溢出后按 `rewinder` 倒带重启的遍历.
/// 参数合法时恰好产生 `0..n` 的一个排列, 否则 panic.
fn interleave(n: usize, step: usize, rewinder: usize) -> Vec<usize> {
    assert!(step >= 1 && rewinder >= 1, "步进与倒带参数必须为正");
    let mut out = Vec::with_capacity(n);
    let mut index = 0usize;
    let mut restart = 0usize;
    for _ in 0..n {
        if index >= n {
            restart += rewinder;
            index = restart;
            assert!(index < n, "步进 {step}/倒带 {rewinder} 无法生成 {n} 元排列");
        }
        out.push(index);
        index += step;
    }
    debug_assert!({
        let mut seen = vec![false; n];
        out.iter().for_each(|&i| seen[i] = true);
        seen.iter().all(|s| *s)
    });
    out
}

/// 计算单个堆叠 (z 层) 的切片采集顺序.
///
/// `step` 与 `rewinder` 仅在 `Custom` 顺序下生效; `Interleaved`
/// 的步长固定为 package 数, `InterleavedSqrt` 的步长为
/// `round(√(每 package 切片数))`.
pub fn slice_acquisition_order(
    z: usize,
    packages: usize,
    order: SliceOrder,
    step: usize,
    rewinder: usize,
) -> AcquisitionOrder {
    assert!(z > 0, "堆叠不能为空");
    assert!(packages >= 1 && packages <= z, "package 数 {packages} 不合法 (z = {z})");

    let rew = rewinder.max(1);
    let time_to_pos = match order {
        SliceOrder::Ascending => interleave(z, packages, 1),
        SliceOrder::Descending => interleave(z, packages, 1)
            .into_iter()
            .map(|p| z - 1 - p)
            .collect(),
        SliceOrder::Interleaved => interleave(z, packages, rew),
        SliceOrder::InterleavedSqrt => {
            let per_package = (z / packages).max(1);
            interleave(z, ((per_package as f64).sqrt().round() as usize).max(1), rew)
        }
        SliceOrder::Custom => interleave(z, step.max(1), rew),
    };

    let mut pos_to_time = vec![0usize; z];
    for (t, &p) in time_to_pos.iter().enumerate() {
        pos_to_time[p] = t;
    }
    AcquisitionOrder {
        time_to_pos,
        pos_to_time,
    }
}

/// 一个合成 package: 与母堆叠同几何的网格 (非成员层为零)
/// 加上成员切片的 z 位置列表.
#[derive(Debug, Clone)]
pub struct Package {
    /// 合成网格, 仅成员层携带数据.
    pub grid: VoxelGrid,

    /// 成员切片在母堆叠内的 z 位置.
    pub members: Vec<usize>,
}

/// 按采集顺序把堆叠拆成 `packages` 个合成 package.
///
/// 第 `p` 个 package 拥有采集时间上连续的一段切片; 堆叠层数
/// 不能整除时, 前若干个 package 各多分到一层.
pub fn split_packages(stack: &VoxelGrid, packages: usize, order: &AcquisitionOrder) -> Vec<Package> {
    let (nz, _, _) = stack.shape();
    assert_eq!(order.time_to_pos.len(), nz, "采集顺序与堆叠层数不一致");
    let base = nz / packages;
    let extra = nz % packages;

    let mut out = Vec::with_capacity(packages);
    let mut cursor = 0usize;
    for p in 0..packages {
        let take = base + usize::from(p < extra);
        let members: Vec<usize> = order.time_to_pos[cursor..cursor + take].to_vec();
        cursor += take;

        let mut grid = VoxelGrid::zeros(stack.geom().clone());
        for &z in &members {
            grid.data_mut()
                .index_axis_mut(ndarray::Axis(0), z)
                .assign(&stack.data().index_axis(ndarray::Axis(0), z));
        }
        out.push(Package { grid, members });
    }
    out
}

/// 多带 (multiband) 拆分: 堆叠沿 z 均分为 `multiband` 个 band,
/// 各 band 内采集模式相同且同时采集; 合成 package 取各 band
/// 同序号 package 成员的并集.
pub fn split_packages_multiband(
    stack: &VoxelGrid,
    packages: usize,
    multiband: usize,
    order_kind: SliceOrder,
    step: usize,
    rewinder: usize,
) -> Vec<Package> {
    let (nz, _, _) = stack.shape();
    assert!(multiband >= 1, "multiband 因子必须为正");
    if multiband == 1 {
        let order = slice_acquisition_order(nz, packages, order_kind, step, rewinder);
        return split_packages(stack, packages, &order);
    }
    assert_eq!(nz % multiband, 0, "堆叠层数 {nz} 不能被 multiband 因子 {multiband} 整除");

    let band_z = nz / multiband;
    let order = slice_acquisition_order(band_z, packages, order_kind, step, rewinder);
    let base = band_z / packages;
    let extra = band_z % packages;

    let mut out = Vec::with_capacity(packages);
    let mut cursor = 0usize;
    for p in 0..packages {
        let take = base + usize::from(p < extra);
        let band_members = &order.time_to_pos[cursor..cursor + take];
        cursor += take;

        let mut members = Vec::with_capacity(take * multiband);
        for band in 0..multiband {
            members.extend(band_members.iter().map(|&z| band * band_z + z));
        }

        let mut grid = VoxelGrid::zeros(stack.geom().clone());
        for &z in &members {
            grid.data_mut()
                .index_axis_mut(ndarray::Axis(0), z)
                .assign(&stack.data().index_axis(ndarray::Axis(0), z));
        }
        out.push(Package { grid, members });
    }
    out
}

/// 把堆叠按每 `packages` 层取一的方式拆为降采样网格
/// (层距放大 `packages` 倍, 世界位置保持不变).
pub fn split_image(image: &VoxelGrid, packages: usize) -> Vec<VoxelGrid> {
    let (nz, ny, nx) = image.shape();
    assert!(packages >= 1 && packages <= nz);
    let pkg_z = nz / packages;

    let mut out = Vec::with_capacity(packages);
    for l in 0..packages {
        let nz_l = pkg_z + usize::from(pkg_z * packages + l < nz);
        let spacing = image.geom().spacing();
        // 新网格中心对应的母网格连续 z 坐标.
        let center_z = (nz_l as f64 - 1.0) / 2.0 * packages as f64 + l as f64;
        let origin = image.geom().image_to_world([
            (nx as f64 - 1.0) / 2.0,
            (ny as f64 - 1.0) / 2.0,
            center_z,
        ]);
        let geom = crate::geom::ImageGeometry::new(
            (nz_l, ny, nx),
            [spacing[0], spacing[1], spacing[2] * packages as f64],
            origin,
            image.geom().axes(),
        );
        let mut grid = VoxelGrid::zeros(geom);
        for k in 0..nz_l {
            grid.data_mut()
                .index_axis_mut(ndarray::Axis(0), k)
                .assign(&image.data().index_axis(ndarray::Axis(0), k * packages + l));
        }
        out.push(grid);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::ImageGeometry;

    /// 默认交错顺序的标准排列 (4 package, 12 层).
    #[test]
    fn test_interleaved_order_literal() {
        let order = slice_acquisition_order(12, 4, SliceOrder::Interleaved, 2, 1);
        assert_eq!(
            order.time_to_pos,
            vec![0, 4, 8, 1, 5, 9, 2, 6, 10, 3, 7, 11]
        );
        // 互逆.
        for (t, &p) in order.time_to_pos.iter().enumerate() {
            assert_eq!(order.pos_to_time[p], t);
        }
    }

    #[test]
    fn test_ascending_descending() {
        let asc = slice_acquisition_order(6, 1, SliceOrder::Ascending, 0, 0);
        assert_eq!(asc.time_to_pos, vec![0, 1, 2, 3, 4, 5]);
        let desc = slice_acquisition_order(6, 1, SliceOrder::Descending, 0, 0);
        assert_eq!(desc.time_to_pos, vec![5, 4, 3, 2, 1, 0]);
    }

    /// 自定义顺序应使用传入的步长与倒带.
    #[test]
    fn test_custom_order() {
        let order = slice_acquisition_order(6, 2, SliceOrder::Custom, 2, 1);
        assert_eq!(order.time_to_pos, vec![0, 2, 4, 1, 3, 5]);
    }

    /// 任何顺序都必须是合法排列.
    #[test]
    fn test_orders_are_permutations() {
        for (order, step) in [
            (SliceOrder::Ascending, 1),
            (SliceOrder::Descending, 1),
            (SliceOrder::Interleaved, 1),
            (SliceOrder::InterleavedSqrt, 1),
            (SliceOrder::Custom, 3),
        ] {
            let a = slice_acquisition_order(15, 3, order, step, 1);
            let mut seen = vec![false; 15];
            a.time_to_pos.iter().for_each(|&p| seen[p] = true);
            assert!(seen.iter().all(|s| *s), "{order:?} 不是排列");
        }
    }

    fn ramp_stack(nz: usize) -> VoxelGrid {
        let g = ImageGeometry::axial((nz, 2, 2), [1.0, 1.0, 2.0], [0.0; 3]);
        let mut s = VoxelGrid::zeros(g);
        for z in 0..nz {
            for y in 0..2 {
                for x in 0..2 {
                    s.set(x, y, z, z as f32 + 1.0);
                }
            }
        }
        s
    }

    /// package 成员应两两不交且覆盖全部层.
    #[test]
    fn test_split_packages_cover() {
        let stack = ramp_stack(10);
        let order = slice_acquisition_order(10, 3, SliceOrder::Interleaved, 1, 1);
        let packages = split_packages(&stack, 3, &order);
        assert_eq!(packages.len(), 3);
        let mut seen = vec![false; 10];
        for p in &packages {
            for &z in &p.members {
                assert!(!seen[z], "层 {z} 被重复分配");
                seen[z] = true;
                // 成员层的数据被复制, 非成员层为零.
                assert_eq!(p.grid.at(0, 0, z), z as f32 + 1.0);
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    /// multiband 拆分应把各 band 的同号 package 并为一组.
    #[test]
    fn test_split_packages_multiband() {
        let stack = ramp_stack(12);
        let packages = split_packages_multiband(&stack, 2, 2, SliceOrder::Ascending, 1, 1);
        assert_eq!(packages.len(), 2);
        // band 大小为 6, 每 band 2 个 package, 各 3 层;
        // package 0 = 两个 band 中最先采集的 3 层.
        let mut m0 = packages[0].members.clone();
        m0.sort_unstable();
        assert_eq!(m0, vec![0, 2, 4, 6, 8, 10]);
    }

    /// 降采样拆分应保持世界位置: 子网格体素与母网格对应层同位.
    #[test]
    fn test_split_image_world_alignment() {
        let stack = ramp_stack(9);
        let packs = split_image(&stack, 2);
        assert_eq!(packs.len(), 2);
        assert_eq!(packs[0].shape().0, 5);
        assert_eq!(packs[1].shape().0, 4);
        for (l, pack) in packs.iter().enumerate() {
            for k in 0..pack.shape().0 {
                let a = pack.geom().image_to_world([0.0, 0.0, k as f64]);
                let b = stack
                    .geom()
                    .image_to_world([0.0, 0.0, (k * 2 + l) as f64]);
                for i in 0..3 {
                    assert!((a[i] - b[i]).abs() < 1e-9);
                }
                assert_eq!(pack.at(0, 0, k), (k * 2 + l) as f32 + 1.0);
            }
        }
    }
}
