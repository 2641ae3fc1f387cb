//! GPU-resident numeric execution context.
//!
//! Tensor data lives in 2-D texel grids (`wgpu::Texture`), programs are WGSL
//! fragment shaders executed as full-screen draws over an output write region,
//! and completion is tracked through an in-order fence queue so results can be
//! read back without stalling the host unnecessarily.

pub mod alloc;
pub mod bindings;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod metrics;
pub mod packing;
pub mod program;
pub mod readback;
pub mod shaders;
pub mod sync;
pub mod timing;
pub mod types;

use anyhow::Result;
use once_cell::sync::OnceCell;

pub use context::{GpuContext, GpuContextOptions};
pub use dispatch::DispatchBuilder;
pub use program::{ProgramHandle, ProgramSpec};
pub use sync::{FenceState, FenceToken};
pub use timing::TimerToken;

pub use texelflow_api::{
    ContextDiagnostics, ElapsedTime, ElementType, HostTensorOwned, HostTensorView, KernelRequest,
    TexelError, TexelLayout, TexelResult, TextureHandle, WriteRegion,
};

/// Create the process-wide GPU context and register it as the global provider
/// for kernel implementations. Subsequent calls return the same instance.
pub fn register_gpu_context(opts: GpuContextOptions) -> Result<&'static GpuContext> {
    static INSTANCE: OnceCell<&'static GpuContext> = OnceCell::new();
    INSTANCE
        .get_or_try_init(move || {
            let ctx = GpuContext::new(opts)?;
            let leaked: &'static GpuContext = Box::leak(Box::new(ctx));
            unsafe { texelflow_api::register_provider(leaked) };
            Ok(leaked)
        })
        .map(|p| *p)
}

/// Best-effort context bring-up: returns `None` (with a warning) instead of an
/// error when no usable adapter exists, so hosts can fall back to a CPU path.
pub fn ensure_gpu_context() -> Result<Option<&'static GpuContext>> {
    match register_gpu_context(GpuContextOptions::default()) {
        Ok(ctx) => Ok(Some(ctx)),
        Err(e) => {
            log::warn!("texelflow: GPU context initialization failed: {e}");
            Ok(None)
        }
    }
}
