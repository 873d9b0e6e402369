//! 场景构造与运行.

use svr_berry::prelude::*;

/// 一个场景的汇总结果.
pub struct ScenarioResult {
    /// 场景名.
    pub name: &'static str,

    /// mask 内重建均值相对输入真值的误差百分比.
    pub mean_error_percent: f64,

    /// 流水线质量报告.
    pub report: QualityReport,
}

/// 以给定强度函数构造一个堆叠.
fn make_stack(
    axes: [[f64; 3]; 3],
    shape: (usize, usize, usize),
    spacing: [f64; 3],
    f: &dyn Fn([f64; 3]) -> f32,
) -> VoxelGrid {
    let g = ImageGeometry::new(shape, spacing, [0.0; 3], axes);
    let mut s = VoxelGrid::zeros(g);
    let (nz, ny, nx) = shape;
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let w = s.geom().image_to_world([x as f64, y as f64, z as f64]);
                s.set(x, y, z, f(w));
            }
        }
    }
    s
}

/// 三个正交朝向.
fn orthogonal_axes() -> [[[f64; 3]; 3]; 3] {
    [
        [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]],
        [[0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]],
    ]
}

/// 构建流水线并跑若干轮外层迭代, 返回 mask 内均值.
fn run_pipeline(
    stacks: &[VoxelGrid],
    mask_radius: f64,
    outer: usize,
    sr_rounds: usize,
) -> (Reconstruction, f64) {
    let poses = vec![RigidTransform::identity(); stacks.len()];

    let mut params = SvrParams::default();
    params.set_smoothing(150.0, 0.02);
    let mut recon = Reconstruction::new(params);

    recon.create_template(&stacks[0], 1.0);
    let mut mask = VoxelGrid::zeros(recon.volume().geom().clone());
    let (nz, ny, nx) = mask.shape();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let w = mask.geom().image_to_world([x as f64, y as f64, z as f64]);
                if w.iter().map(|c| c * c).sum::<f64>().sqrt() < mask_radius {
                    mask.set(x, y, z, 1.0);
                }
            }
        }
    }
    recon.set_mask(Some(&mask), 0.0, 0.5);

    recon.create_slices(stacks, &poses, &[3.0; 3], &[1; 3], None, &[]);
    recon.initialize_em();

    let registrar = IdentityRegistrar;
    for iter in 0..outer {
        recon.outer_iteration(&registrar, iter, sr_rounds);
    }
    recon.mask_volume();

    let mut sum = 0.0;
    let mut n = 0usize;
    for (&v, &m) in recon
        .volume()
        .data()
        .iter()
        .zip(recon.mask().data().iter())
    {
        if m == 1.0 {
            sum += v as f64;
            n += 1;
        }
    }
    let mean = sum / n.max(1) as f64;
    (recon, mean)
}

/// 场景 1: 常值立方体, 无运动.
pub fn constant_cube() -> ScenarioResult {
    let cube = |w: [f64; 3]| -> f32 {
        if w.iter().all(|c| c.abs() < 10.0) {
            100.0
        } else {
            0.0
        }
    };
    let stacks: Vec<VoxelGrid> = orthogonal_axes()
        .iter()
        .map(|&axes| make_stack(axes, (10, 30, 30), [1.0, 1.0, 3.0], &cube))
        .collect();

    let (recon, mean) = run_pipeline(&stacks, 7.0, 2, 2);
    log::info!("constant_cube mean = {mean}");
    ScenarioResult {
        name: "constant-cube",
        mean_error_percent: (mean - 100.0).abs(),
        report: recon.quality_report(),
    }
}

/// 场景 2: 高斯球 + 一张 10 倍强度的离群切片.
pub fn ball_with_outlier() -> ScenarioResult {
    let ball = |w: [f64; 3]| -> f32 {
        let r2: f64 = w.iter().map(|c| c * c).sum();
        (150.0 * (-r2 / 64.0).exp()) as f32
    };
    let mut stacks: Vec<VoxelGrid> = orthogonal_axes()
        .iter()
        .map(|&axes| make_stack(axes, (10, 30, 30), [1.0, 1.0, 3.0], &ball))
        .collect();

    // 把第一个堆叠的中间切片替换为高强度噪声.
    {
        let stack = &mut stacks[0];
        let (_, ny, nx) = stack.shape();
        for y in 0..ny {
            for x in 0..nx {
                stack.set(x, y, 5, 1000.0 + ((x * 31 + y * 17) % 29) as f32);
            }
        }
    }

    let (recon, _) = run_pipeline(&stacks, 6.0, 2, 2);

    // 离群切片 (堆叠 0 的第 5 张) 的权重.
    let outlier_weight = recon.store.slice_weight[5];
    log::info!("outlier slice weight = {outlier_weight}");

    // 该场景的 "均值误差" 用球心真值衡量.
    let center = recon.volume().at(
        recon.volume().shape().2 / 2,
        recon.volume().shape().1 / 2,
        recon.volume().shape().0 / 2,
    );
    ScenarioResult {
        name: "ball-with-outlier",
        mean_error_percent: ((center as f64 - 150.0) / 150.0 * 100.0).abs(),
        report: recon.quality_report(),
    }
}
