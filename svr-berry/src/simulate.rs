//! 前向模拟: 把当前重建体积经系数矩阵投影回各切片.

use crate::coeff::CoeffStore;
use crate::consts::{ACTIVE_EPS, COVERAGE_MIN};
use crate::data::VoxelGrid;
use crate::store::SliceStore;
use rayon::prelude::*;

/// 为每张切片生成模拟切片、模拟覆盖权重与 "在 ROI 内" 指示.
///
/// 像素覆盖度超过 0.98 时模拟值按覆盖度归一, 否则记 0;
/// padding 像素从不模拟. 逐切片完全并行.
pub fn simulate_slices(
    store: &mut SliceStore,
    coeffs: &CoeffStore,
    volume: &VoxelGrid,
    mask: &VoxelGrid,
) {
    let vol_flat = volume.data();
    let vol_flat = vol_flat.as_slice().expect("重建体积必须是标准布局");
    let mask_flat = mask.data();
    let mask_flat = mask_flat.as_slice().expect("mask 必须是标准布局");

    let results: Vec<(VoxelGrid, VoxelGrid, VoxelGrid)> = {
        let s: &SliceStore = store;
        s.slices
            .par_iter()
            .enumerate()
            .map(|(idx, slice)| {
                let sc = &coeffs.per_slice[idx];
                let (ny, nx) = (slice.geom().ny(), slice.geom().nx());
                let mut sim = VoxelGrid::zeros(slice.geom().clone());
                let mut sim_weight = VoxelGrid::zeros(slice.geom().clone());
                let mut sim_inside = VoxelGrid::zeros(slice.geom().clone());

                let plane = slice.plane();
                for y in 0..ny {
                    for x in 0..nx {
                        if plane[(y, x)] <= ACTIVE_EPS {
                            continue;
                        }
                        let mut acc = 0.0f64;
                        let mut weight = 0.0f64;
                        let mut inside = false;
                        for e in sc.pixel(x, y) {
                            acc += e.value as f64 * vol_flat[e.voxel as usize] as f64;
                            weight += e.value as f64;
                            if mask_flat[e.voxel as usize] == 1.0 {
                                inside = true;
                            }
                        }
                        sim_weight.set(x, y, 0, weight as f32);
                        if weight > COVERAGE_MIN {
                            sim.set(x, y, 0, (acc / weight) as f32);
                        }
                        if inside {
                            sim_inside.set(x, y, 0, 1.0);
                        }
                    }
                }
                (sim, sim_weight, sim_inside)
            })
            .collect()
    };

    for (idx, (sim, weight, inside)) in results.into_iter().enumerate() {
        store.simulated_slices[idx] = sim;
        store.simulated_weights[idx] = weight;
        store.simulated_inside[idx] = inside;
    }
}

/// 把模拟切片按堆叠重组为与输入同形的网格, 便于检查.
/// 切片权重不超过 0.5 的切片 (被剔除) 在输出中留零.
pub fn simulate_stacks(store: &SliceStore, stacks: &mut [VoxelGrid]) {
    for idx in 0..store.len() {
        let stack = &mut stacks[store.stack_index[idx]];
        let z = store.slice_pos[idx];
        if store.slice_weight[idx] > 0.5 {
            stack
                .data_mut()
                .index_axis_mut(ndarray::Axis(0), z)
                .assign(&store.simulated_slices[idx].plane());
        } else {
            stack
                .data_mut()
                .index_axis_mut(ndarray::Axis(0), z)
                .fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coeff::coeff_init;
    use crate::geom::{ImageGeometry, RigidTransform};
    use crate::store::{CreateSlicesOptions, SliceStore};

    fn setup() -> (SliceStore, CoeffStore, VoxelGrid, VoxelGrid) {
        let stack_geom = ImageGeometry::axial((4, 8, 8), [1.0, 1.0, 3.0], [0.0; 3]);
        let stack = VoxelGrid::filled(stack_geom, 100.0);
        let mut store = SliceStore::new();
        store.create_from_stacks(
            &[stack],
            &[RigidTransform::identity()],
            &[3.0],
            &[1],
            None,
            &CreateSlicesOptions::default(),
        );
        let volume_geom = ImageGeometry::axial((24, 24, 24), [1.0; 3], [0.0; 3]);
        let mask = VoxelGrid::filled(volume_geom.clone(), 1.0);
        let volume = VoxelGrid::filled(volume_geom.clone(), 50.0);
        let coeffs = coeff_init(&mut store, &volume_geom, &mask, &[], false);
        (store, coeffs, volume, mask)
    }

    /// 常值体积的模拟切片在覆盖充分处应取相同常值.
    #[test]
    fn test_simulate_constant_volume() {
        let (mut store, coeffs, volume, mask) = setup();
        simulate_slices(&mut store, &coeffs, &volume, &mask);
        let sim = &store.simulated_slices[1];
        assert!((sim.at(4, 4, 0) - 50.0).abs() < 1e-3);
        assert!(store.simulated_weights[1].at(4, 4, 0) > 0.98);
        assert_eq!(store.simulated_inside[1].at(4, 4, 0), 1.0);
    }

    /// 模拟的线性: 体积乘以常数 c, 各模拟切片同乘 c.
    #[test]
    fn test_simulation_linearity() {
        let (mut store, coeffs, mut volume, mask) = setup();
        simulate_slices(&mut store, &coeffs, &volume, &mask);
        let before: Vec<f32> = store
            .simulated_slices
            .iter()
            .flat_map(|s| s.data().iter().copied().collect::<Vec<_>>())
            .collect();

        for v in volume.data_mut().iter_mut() {
            *v *= 3.0;
        }
        simulate_slices(&mut store, &coeffs, &volume, &mask);
        let after: Vec<f32> = store
            .simulated_slices
            .iter()
            .flat_map(|s| s.data().iter().copied().collect::<Vec<_>>())
            .collect();

        for (&b, &a) in before.iter().zip(after.iter()) {
            assert!((a - 3.0 * b).abs() < 1e-3 * b.abs().max(1.0));
        }
    }

    /// padding 像素不得被模拟.
    #[test]
    fn test_padding_never_simulated() {
        let (mut store, _, volume, mask) = setup();
        // 人工制造一个 padding 像素并重建系数.
        store.slices[0].set(2, 2, 0, -1.0);
        let volume_geom = volume.geom().clone();
        let coeffs = coeff_init(&mut store, &volume_geom, &mask, &[], false);
        simulate_slices(&mut store, &coeffs, &volume, &mask);
        assert_eq!(store.simulated_slices[0].at(2, 2, 0), 0.0);
        assert_eq!(store.simulated_weights[0].at(2, 2, 0), 0.0);
    }
}
