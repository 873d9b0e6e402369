//! 远程 SVR: 文件交换目录 + 外部配准进程.
//!
//! 逐切片配准可以交给外部二进制分批执行. 本模块只负责交换目录
//! 的文件簿记: 体积/切片/mask 写为 `nii.gz`, 位姿写为文本 `.dof`
//! (刚体: 一行六参数; FFD: 控制点网格与位移表). 外部程序以
//! `<binary> <start> <stop> <exchange_dir>` 的约定被调用,
//! 每批处理 32 张切片.

use crate::consts::default::REMOTE_STRIDE;
use crate::data::{resample_with_padding, VoxelGrid};
use crate::geom::{FreeFormTransform, RigidTransform};
use crate::store::SliceStore;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::Command;

/// 刚体位姿写为文本 `.dof`.
pub fn write_rigid_dof<P: AsRef<Path>>(path: P, t: &RigidTransform) -> io::Result<()> {
    let mut f = fs::File::create(path)?;
    writeln!(f, "DOF-Rigid")?;
    writeln!(
        f,
        "{} {} {} {} {} {}",
        t.tx(),
        t.ty(),
        t.tz(),
        t.rx(),
        t.ry(),
        t.rz()
    )
}

/// 读取文本 `.dof` 刚体位姿.
pub fn read_rigid_dof<P: AsRef<Path>>(path: P) -> io::Result<RigidTransform> {
    let text = fs::read_to_string(&path)?;
    let mut lines = text.lines();
    match lines.next() {
        Some("DOF-Rigid") => {}
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("非刚体 .dof 文件 ({other:?}): {}", path.as_ref().display()),
            ))
        }
    }
    let params: Vec<f64> = lines
        .next()
        .unwrap_or("")
        .split_whitespace()
        .filter_map(|v| v.parse().ok())
        .collect();
    if params.len() != 6 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(".dof 参数个数错误: {}", path.as_ref().display()),
        ));
    }
    Ok(RigidTransform::from_params(
        params[0], params[1], params[2], params[3], params[4], params[5],
    ))
}

/// FFD 位姿写为文本 `.dof`: 头行 + 网格描述 + 逐控制点位移.
pub fn write_ffd_dof<P: AsRef<Path>>(path: P, t: &FreeFormTransform) -> io::Result<()> {
    let mut f = fs::File::create(path)?;
    writeln!(f, "DOF-FFD")?;
    let (dz, dy, dx) = t.dims();
    writeln!(f, "{dz} {dy} {dx} {}", t.cp_spacing())?;
    for cz in 0..dz {
        for cy in 0..dy {
            for cx in 0..dx {
                let d = t.control_point(cz, cy, cx);
                writeln!(f, "{} {} {}", d[0], d[1], d[2])?;
            }
        }
    }
    Ok(())
}

/// 交换目录内的文件命名.
mod names {
    /// 当前重建体积 (配准 source).
    pub const CURRENT_SOURCE: &str = "current-source.nii.gz";

    /// 当前 mask.
    pub const CURRENT_MASK: &str = "current-mask.nii.gz";

    /// 最近一次重建结果.
    pub const LATEST_RECON: &str = "latest-out-recon.nii.gz";

    pub fn res_slice(i: usize) -> String {
        format!("res-slice-{i}.nii.gz")
    }

    pub fn res_transformation(i: usize) -> String {
        format!("res-transformation-{i}.dof")
    }

    pub fn ffd_slice(i: usize) -> String {
        format!("slice-{i}.nii.gz")
    }

    pub fn ffd_transformation(i: usize) -> String {
        format!("transformation-{i}.dof")
    }

    pub fn org_slice(i: usize) -> String {
        format!("org-slice-{i}.nii.gz")
    }

    pub fn org_transformation(iter: usize, i: usize) -> String {
        format!("org-transformation-{iter}-{i}.dof")
    }
}

/// 远程 SVR 传输器.
#[derive(Debug, Clone)]
pub struct RemoteSvr {
    /// 外部配准二进制的路径.
    pub binary: PathBuf,

    /// 交换目录.
    pub exchange_dir: PathBuf,

    /// 原点清零偏移 (首轮写切片文件时记录, 供回读时撤销).
    offset_transforms: Vec<RigidTransform>,
}

impl RemoteSvr {
    /// 构建传输器. 交换目录不存在时创建.
    pub fn new(binary: impl Into<PathBuf>, exchange_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let exchange_dir = exchange_dir.into();
        fs::create_dir_all(&exchange_dir)?;
        Ok(Self {
            binary: binary.into(),
            exchange_dir,
            offset_transforms: Vec::new(),
        })
    }

    #[inline]
    fn path(&self, name: &str) -> PathBuf {
        self.exchange_dir.join(name)
    }

    /// 保存当前模型 (切片、mask、位姿与体积), 供远端重建续跑.
    pub fn save_model(
        &self,
        store: &SliceStore,
        mask: &VoxelGrid,
        volume: &VoxelGrid,
        iteration: usize,
        with_slices: bool,
    ) -> io::Result<()> {
        if with_slices {
            for (i, slice) in store.slices.iter().enumerate() {
                slice
                    .save(self.path(&names::org_slice(i)))
                    .map_err(nifti_to_io)?;
            }
            mask.save(self.path(names::CURRENT_MASK)).map_err(nifti_to_io)?;
        }
        for (i, t) in store.transformations.iter().enumerate() {
            write_rigid_dof(self.path(&names::org_transformation(iteration, i)), t)?;
        }
        volume
            .save(self.path(names::LATEST_RECON))
            .map_err(nifti_to_io)?;
        Ok(())
    }

    /// 读回远端写出的最新重建体积.
    pub fn load_latest_recon(&self) -> nifti::Result<VoxelGrid> {
        VoxelGrid::open(self.path(names::LATEST_RECON))
    }

    /// 远程逐切片刚体 SVR.
    ///
    /// 前三轮把切片重采样到体积分辨率并写盘 (原点清零, 偏移记账);
    /// 之后各轮只更新位姿文件. 外部进程按 32 张一批调用, 结束后
    /// 回读位姿并撤销偏移.
    pub fn register_slices(
        &mut self,
        store: &mut SliceStore,
        volume: &VoxelGrid,
        iter: usize,
    ) -> io::Result<()> {
        volume
            .save(self.path(names::CURRENT_SOURCE))
            .map_err(nifti_to_io)?;

        let d = volume.geom().dx();
        if iter < 3 {
            self.offset_transforms.clear();
            // 重采样内部已并行, 切片循环保持串行.
            for (i, slice) in store.slices.iter().enumerate() {
                let mut target = resample_with_padding(slice, d, -0.01, -1.0);
                let mut geom = target.geom().clone();
                let offset = geom.reset_origin();
                target.set_geom(geom);
                store.zero_slice[i] = target.is_zero_content();
                target
                    .save(self.path(&names::res_slice(i)))
                    .map_err(nifti_to_io)?;
                self.offset_transforms.push(offset);
            }
        }
        assert_eq!(
            self.offset_transforms.len(),
            store.len(),
            "偏移记账与切片数不一致 (save 轮次被跳过?)"
        );

        for (i, t) in store.transformations.iter().enumerate() {
            let composed = t.compose(&self.offset_transforms[i]);
            write_rigid_dof(self.path(&names::res_transformation(i)), &composed)?;
        }

        self.run_batches(store.len())?;

        for i in 0..store.len() {
            let read = read_rigid_dof(self.path(&names::res_transformation(i)))?;
            store.transformations[i] = read.compose(&self.offset_transforms[i].inverse());
        }
        Ok(())
    }

    /// 远程 FFD SVR: 同刚体路径, 但文件名与位姿格式不同,
    /// 且不做原点偏移记账.
    pub fn register_slices_ffd(
        &mut self,
        store: &mut SliceStore,
        volume: &VoxelGrid,
        iter: usize,
    ) -> io::Result<()> {
        volume
            .save(self.path(names::CURRENT_SOURCE))
            .map_err(nifti_to_io)?;

        let d = volume.geom().dx();
        if iter < 3 {
            for (i, slice) in store.slices.iter().enumerate() {
                let target = resample_with_padding(slice, d, -0.01, -1.0);
                store.zero_slice[i] = target.is_zero_content();
                target
                    .save(self.path(&names::ffd_slice(i)))
                    .map_err(nifti_to_io)?;
                write_ffd_dof(
                    self.path(&names::ffd_transformation(i)),
                    &store.ffd_transformations[i],
                )?;
            }
        }

        self.run_batches(store.len())
        // FFD 位姿由远端就地更新文件; 本端 FFD 的回读由调用方在
        // 需要时进行 (控制点表较大, 不是每轮都要).
    }

    /// 以 32 张一批的条带调用外部二进制.
    fn run_batches(&self, n_slices: usize) -> io::Result<()> {
        let mut start = 0usize;
        while start < n_slices {
            let stop = (start + REMOTE_STRIDE).min(n_slices);
            let status = Command::new(&self.binary)
                .arg(start.to_string())
                .arg(stop.to_string())
                .arg(&self.exchange_dir)
                .status()?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("远程配准进程退出异常: {status} (批次 {start}..{stop})"),
                ));
            }
            start = stop;
        }
        Ok(())
    }
}

fn nifti_to_io(e: nifti::NiftiError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}
