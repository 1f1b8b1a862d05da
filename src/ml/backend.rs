//! 計算バックエンドの型とデバイス

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

/// NdArray (CPU) バックエンド
pub type CpuBackend = NdArray;
/// WGPU (GPU) バックエンド
pub type GpuBackend = Wgpu;

pub type CpuAutodiff = Autodiff<CpuBackend>;
pub type GpuAutodiff = Autodiff<GpuBackend>;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

pub fn wgpu_device() -> WgpuDevice {
    WgpuDevice::default()
}
