//! 通用常量.

/// 体素/像素的 padding 哨兵值. 凡是等于该值的体素均被视为
/// "在 mask 之外 / 无数据", 不参与任何统计、模拟与更新.
pub const PADDING: f32 = -1.0;

/// 比较 "是否为有效像素" 时使用的阈值: 像素值 `> -0.01` 即视为有效.
/// 直接与 [`PADDING`] 做相等比较会受浮点误差影响.
pub const ACTIVE_EPS: f32 = -0.01;

/// PSF 覆盖阈值. 一个切片像素的系数权重和低于该值时视为落在体积外.
pub const COVERAGE_MIN: f64 = 0.98;

/// 模拟覆盖阈值. 只有 `simulated_weight > 0.99` 的像素才参与 EM 统计.
pub const SIM_WEIGHT_MIN: f32 = 0.99;

/// FWHM 与高斯标准差的换算系数 (2√(2 ln 2)).
pub const FWHM_TO_SIGMA: f64 = 2.3548;

/// 面内 PSF 展宽系数 (Jiang-Rueckert 模型).
pub const PSF_INPLANE_FACTOR: f64 = 1.2;

/// 切片 scale 的合法闭区间. 估计值落在区间外的切片本轮被强制剔除.
pub const SCALE_RANGE: (f64, f64) = (0.2, 5.0);

/// 默认超参数. 与重建流水线的构造值一一对应.
pub mod default {
    /// 数值稳定项 (混合模型方差下界为 `STEP²/6.28`).
    pub const STEP: f64 = 0.0001;

    /// 切片 bias 场平滑的高斯标准差, 以毫米为单位.
    pub const SIGMA_BIAS_MM: f64 = 12.0;

    /// 切片级混合模型的初始方差.
    pub const SIGMA_S: f64 = 0.025;

    /// 体素级/切片级混合模型 inlier 成分的初始占比.
    pub const MIX: f64 = 0.9;

    /// 正则化边缘敏感度 δ.
    pub const DELTA: f64 = 1.0;

    /// 正则化强度 λ.
    pub const LAMBDA: f64 = 0.1;

    /// 全局 bias 校正的低亮度截断比例.
    pub const LOW_INTENSITY_CUTOFF: f64 = 0.01;

    /// 结构化剔除的全局 NCC 门限.
    pub const GLOBAL_NCC_THRESHOLD: f64 = 0.65;

    /// 远程 SVR 一批注册的切片条带宽度.
    pub const REMOTE_STRIDE: usize = 32;
}

/// 小切片判定比例: 覆盖体素数低于中位数的该比例时视为小切片.
pub const SMALL_SLICE_RATIO: f64 = 0.1;

/// 自适应正则化的稳定性启发式上界 (α·λ/δ²).
pub const REG_STABILITY_BOUND: f64 = 0.068;
