use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use thiserror::Error;

/// How scalars are laid out inside a storage texel.
///
/// `Unpacked` stores one scalar per texel; `Packed` stores a 2x2 logical block
/// (four scalars) per texel in RGBA channel order, which quarters the texel
/// footprint at the cost of an encode/decode step on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TexelLayout {
    Unpacked,
    Packed,
}

impl TexelLayout {
    /// Scalar channels carried by each texel under this layout.
    pub fn channels(&self) -> usize {
        match self {
            TexelLayout::Unpacked => 1,
            TexelLayout::Packed => 4,
        }
    }
}

/// Logical element type of the scalars stored in a texture.
///
/// Host-side data is always `f32`; the element type governs the device-side
/// representation (and therefore precision) of each scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    F16,
    U8,
}

impl ElementType {
    /// Bytes occupied by one scalar channel on the device.
    pub fn channel_bytes(&self) -> usize {
        match self {
            ElementType::F32 => 4,
            ElementType::F16 => 2,
            ElementType::U8 => 1,
        }
    }
}

/// Handle naming one texture allocation inside a context's arena.
///
/// The logical grid (`rows` x `cols`) and layout are fixed at creation; the
/// physical texel grid is derived from them. Handles are plain data and may be
/// freely cloned; the arena's reference count, not the handle count, governs
/// reclamation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureHandle {
    pub rows: usize,
    pub cols: usize,
    pub layout: TexelLayout,
    pub element: ElementType,
    pub device_id: u32,
    pub texture_id: u64,
}

impl TextureHandle {
    /// Logical element count of the grid.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rectangular sub-window of a texture's physical texel grid, in texels.
///
/// The default output region is the full grid; sub-regions support partial
/// writes without reallocating storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRegion {
    pub row0: u32,
    pub col0: u32,
    pub rows: u32,
    pub cols: u32,
}

impl WriteRegion {
    pub fn new(row0: u32, col0: u32, rows: u32, cols: u32) -> Self {
        Self {
            row0,
            col0,
            rows,
            cols,
        }
    }

    /// The full grid of a `phys_rows` x `phys_cols` texture.
    pub fn full(phys_rows: u32, phys_cols: u32) -> Self {
        Self {
            row0: 0,
            col0: 0,
            rows: phys_rows,
            cols: phys_cols,
        }
    }

    /// True when the region lies entirely inside a `phys_rows` x `phys_cols` grid.
    pub fn fits(&self, phys_rows: u32, phys_cols: u32) -> bool {
        self.rows > 0
            && self.cols > 0
            && self.row0.checked_add(self.rows).is_some_and(|end| end <= phys_rows)
            && self.col0.checked_add(self.cols).is_some_and(|end| end <= phys_cols)
    }
}

/// Borrowed view of host-resident tensor data queued for upload.
#[derive(Debug, Clone, Copy)]
pub struct HostTensorView<'a> {
    pub data: &'a [f32],
    pub rows: usize,
    pub cols: usize,
}

/// Owned host-resident tensor data produced by a download.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensorOwned {
    pub data: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
}

/// One kernel invocation as submitted by the op catalog: opaque program
/// source, named inputs in slot order, output grid, and optional uniform
/// parameter bytes.
#[derive(Debug, Clone, Copy)]
pub struct KernelRequest<'a> {
    pub label: &'a str,
    pub source: &'a str,
    pub inputs: &'a [(&'a str, &'a TextureHandle)],
    pub output_rows: usize,
    pub output_cols: usize,
    pub output_layout: TexelLayout,
    pub output_element: ElementType,
    pub params: Option<&'a [u8]>,
}

/// Elapsed time reported by the timing unit. `unreliable` is set when the
/// value came from host wall-clock fallback rather than device timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElapsedTime {
    pub millis: f64,
    pub unreliable: bool,
}

/// Counters exposed for external memory/perf introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDiagnostics {
    pub live_textures: usize,
    pub pooled_textures: usize,
    pub live_programs: usize,
    pub pending_fences: usize,
    pub shader_compiles: u64,
    pub program_cache_hits: u64,
    pub program_cache_misses: u64,
    pub bind_group_cache_hits: u64,
    pub bind_group_cache_misses: u64,
    pub dispatches: u64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub timing_reliable: bool,
}

/// Error taxonomy of the execution context.
///
/// Allocation, format, compile and binding errors propagate synchronously to
/// the calling kernel operation; lifecycle violations are never silently
/// ignored; query/timing problems degrade to unreliable measurements instead
/// of failing the computation.
#[derive(Debug, Error)]
pub enum TexelError {
    #[error("allocation failed: {reason}")]
    Allocation { reason: String },
    #[error("host data mismatch: {reason}")]
    Format { reason: String },
    #[error("program compilation failed: {log}")]
    Compile { log: String },
    #[error("input slot '{name}' is not declared by the active program")]
    UnboundSlot { name: String },
    #[error("binding error: {reason}")]
    Binding { reason: String },
    #[error("lifecycle violation: {reason}")]
    Lifecycle { reason: String },
    #[error("timer query misuse: {reason}")]
    QueryState { reason: String },
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl TexelError {
    pub fn allocation(reason: impl Into<String>) -> Self {
        TexelError::Allocation {
            reason: reason.into(),
        }
    }

    pub fn format(reason: impl Into<String>) -> Self {
        TexelError::Format {
            reason: reason.into(),
        }
    }

    pub fn binding(reason: impl Into<String>) -> Self {
        TexelError::Binding {
            reason: reason.into(),
        }
    }

    pub fn lifecycle(reason: impl Into<String>) -> Self {
        TexelError::Lifecycle {
            reason: reason.into(),
        }
    }

    pub fn query_state(reason: impl Into<String>) -> Self {
        TexelError::QueryState {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        TexelError::Internal {
            reason: reason.into(),
        }
    }
}

pub type TexelResult<T> = Result<T, TexelError>;

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = TexelResult<T>> + 'a>>;
pub type DownloadFuture<'a> = ProviderFuture<'a, HostTensorOwned>;

/// Device/provider interface that execution contexts implement and register so
/// kernel implementations can reach the active context without threading it
/// through every call site.
pub trait TexelProvider: Send + Sync {
    fn allocate(
        &self,
        rows: usize,
        cols: usize,
        layout: TexelLayout,
        element: ElementType,
    ) -> TexelResult<TextureHandle>;
    fn upload(&self, handle: &TextureHandle, host: &HostTensorView) -> TexelResult<()>;
    fn download(&self, handle: &TextureHandle) -> TexelResult<HostTensorOwned>;
    fn download_async<'a>(&'a self, handle: &'a TextureHandle) -> DownloadFuture<'a>;
    fn retain(&self, handle: &TextureHandle) -> TexelResult<()>;
    fn release(&self, handle: &TextureHandle) -> TexelResult<()>;
    fn dispatch_kernel(&self, request: &KernelRequest) -> TexelResult<TextureHandle>;
    fn diagnostics(&self) -> ContextDiagnostics;
    fn device_info(&self) -> String;
    fn device_id(&self) -> u32 {
        0
    }
}

static GLOBAL_PROVIDER: Lazy<RwLock<Option<&'static dyn TexelProvider>>> =
    Lazy::new(|| RwLock::new(None));
static PROVIDER_REGISTRY: Lazy<RwLock<HashMap<u32, &'static dyn TexelProvider>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static DEVICE_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Register a global execution provider.
///
/// # Safety
/// - The caller must guarantee that `p` is valid for the entire program
///   lifetime (e.g. a `'static` singleton), as a raw reference is stored
///   globally.
/// - Concurrent callers must ensure registration happens once or is properly
///   synchronized; re-registration is not synchronized here.
pub unsafe fn register_provider(p: &'static dyn TexelProvider) {
    if let Ok(mut guard) = GLOBAL_PROVIDER.write() {
        *guard = Some(p);
    }
    if let Ok(mut guard) = PROVIDER_REGISTRY.write() {
        guard.insert(p.device_id(), p);
    }
}

pub fn provider() -> Option<&'static dyn TexelProvider> {
    GLOBAL_PROVIDER
        .read()
        .ok()
        .and_then(|guard| guard.as_ref().copied())
}

pub fn provider_for_device(device_id: u32) -> Option<&'static dyn TexelProvider> {
    PROVIDER_REGISTRY
        .read()
        .ok()
        .and_then(|guard| guard.get(&device_id).copied())
        .or_else(provider)
}

pub fn provider_for_handle(handle: &TextureHandle) -> Option<&'static dyn TexelProvider> {
    provider_for_device(handle.device_id)
}

/// Clear the globally registered provider. Intended for tests to ensure
/// deterministic behaviour.
pub fn clear_provider() {
    if let Ok(mut guard) = GLOBAL_PROVIDER.write() {
        *guard = None;
    }
    if let Ok(mut map) = PROVIDER_REGISTRY.write() {
        map.clear();
    }
}

pub fn next_device_id() -> u32 {
    DEVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_region_bounds() {
        let full = WriteRegion::full(4, 6);
        assert!(full.fits(4, 6));
        assert!(WriteRegion::new(1, 2, 3, 4).fits(4, 6));
        assert!(!WriteRegion::new(2, 0, 3, 1).fits(4, 6));
        assert!(!WriteRegion::new(0, 0, 0, 1).fits(4, 6));
        assert!(!WriteRegion::new(0, 5, 1, 2).fits(4, 6));
    }

    #[test]
    fn layout_channel_counts() {
        assert_eq!(TexelLayout::Unpacked.channels(), 1);
        assert_eq!(TexelLayout::Packed.channels(), 4);
        assert_eq!(ElementType::F32.channel_bytes(), 4);
        assert_eq!(ElementType::F16.channel_bytes(), 2);
        assert_eq!(ElementType::U8.channel_bytes(), 1);
    }

    #[test]
    fn device_ids_are_unique() {
        let a = next_device_id();
        let b = next_device_id();
        assert_ne!(a, b);
    }
}
