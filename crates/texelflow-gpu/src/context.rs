//! Context lifecycle: device bring-up, the disposed guard enforced on every
//! public entry point, and the kernel dispatch entry consumed by the op
//! catalog.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use log::{error, info};
use texelflow_api::{
    ContextDiagnostics, ElapsedTime, ElementType, HostTensorView, KernelRequest, TexelError,
    TexelLayout, TexelResult, TextureHandle, WriteRegion,
};

use crate::alloc::TextureArena;
use crate::bindings::BindGroupCache;
use crate::config;
use crate::dispatch::{DispatchBuilder, DispatchResources};
use crate::metrics::ContextMetrics;
use crate::program::{ProgramCache, ProgramHandle, ProgramSpec};
use crate::sync::{FenceRegistry, FenceState, FenceToken};
use crate::timing::{TimerToken, TimerUnit};

#[derive(Clone, Debug)]
pub struct GpuContextOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for GpuContextOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

pub struct GpuContext {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    device_id: u32,
    arena: TextureArena,
    programs: ProgramCache,
    fences: FenceRegistry,
    timing: TimerUnit,
    resources: DispatchResources,
    bind_groups: BindGroupCache,
    metrics: ContextMetrics,
    submission_counter: AtomicU32,
    dispatch_serial: Mutex<()>,
    disposed: AtomicBool,
}

fn install_device_error_handlers(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|err| {
        error!("texelflow uncaptured device error: {err:?}");
    }));
    device.set_device_lost_callback(|reason, message| {
        error!("texelflow device lost: reason={reason:?}, message={message}");
    });
}

impl GpuContext {
    pub async fn new_async(opts: GpuContextOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: opts.power_preference,
                force_fallback_adapter: opts.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| anyhow!("wgpu: no compatible adapter found"))?;
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();

        let timestamps_supported = adapter
            .features()
            .contains(wgpu::Features::TIMESTAMP_QUERY);
        let required_features = if timestamps_supported {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };
        let (device_raw, queue_raw) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("texelflow device"),
                    required_features,
                    required_limits: limits.clone(),
                },
                None,
            )
            .await?;
        let device = Arc::new(device_raw);
        install_device_error_handlers(&device);
        let queue = Arc::new(queue_raw);

        let device_id = texelflow_api::next_device_id();
        info!(
            "texelflow context ready on '{}' ({:?}): max_dim={} timestamps={}",
            adapter_info.name,
            adapter_info.backend,
            limits.max_texture_dimension_2d,
            timestamps_supported
        );

        let timing = TimerUnit::new(&device, &queue, timestamps_supported);
        let resources = DispatchResources::new(&device);
        Ok(Self {
            instance,
            adapter,
            adapter_info,
            arena: TextureArena::new(
                device_id,
                limits.max_texture_dimension_2d,
                config::texture_pool_max_per_key(),
            ),
            limits,
            device,
            queue,
            device_id,
            programs: ProgramCache::new(),
            fences: FenceRegistry::new(config::fence_poll_interval()),
            timing,
            resources,
            bind_groups: BindGroupCache::new(),
            metrics: ContextMetrics::new(),
            submission_counter: AtomicU32::new(1),
            dispatch_serial: Mutex::new(()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn new(opts: GpuContextOptions) -> Result<Self> {
        pollster::block_on(Self::new_async(opts))
    }

    pub(crate) fn ensure_live(&self) -> TexelResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TexelError::lifecycle("context has been disposed"));
        }
        Ok(())
    }

    pub(crate) fn submit(&self, encoder: wgpu::CommandEncoder) -> u32 {
        let submission_id = self.submission_counter.fetch_add(1, Ordering::Relaxed);
        log::trace!("submit {submission_id}: begin");
        self.queue.submit(Some(encoder.finish()));
        self.device.poll(wgpu::Maintain::Poll);
        log::trace!("submit {submission_id}: queued");
        submission_id
    }

    pub(crate) fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub(crate) fn arena(&self) -> &TextureArena {
        &self.arena
    }

    pub(crate) fn fences(&self) -> &FenceRegistry {
        &self.fences
    }

    pub(crate) fn timing(&self) -> &TimerUnit {
        &self.timing
    }

    pub(crate) fn dispatch_resources(&self) -> &DispatchResources {
        &self.resources
    }

    pub(crate) fn bind_groups(&self) -> &BindGroupCache {
        &self.bind_groups
    }

    pub(crate) fn metrics(&self) -> &ContextMetrics {
        &self.metrics
    }

    /// Serializes the uniform-write/submit/fence-arm section of a dispatch so
    /// the shared uniform buffers and the fence queue keep issuance order
    /// even when callers drive the context from multiple threads.
    pub(crate) fn dispatch_serial(&self) -> &Mutex<()> {
        &self.dispatch_serial
    }

    // --- Resource allocator ---------------------------------------------

    pub fn allocate(
        &self,
        rows: usize,
        cols: usize,
        layout: TexelLayout,
        element: ElementType,
    ) -> TexelResult<TextureHandle> {
        self.ensure_live()?;
        self.arena.allocate(&self.device, rows, cols, layout, element)
    }

    pub fn upload(&self, handle: &TextureHandle, host: &HostTensorView) -> TexelResult<()> {
        self.ensure_live()?;
        if host.data.len() != host.rows * host.cols {
            return Err(TexelError::format(format!(
                "host view claims {}x{} but holds {} elements",
                host.rows,
                host.cols,
                host.data.len()
            )));
        }
        if host.rows != handle.rows || host.cols != handle.cols {
            return Err(TexelError::format(format!(
                "host view {}x{} does not match handle grid {}x{}",
                host.rows, host.cols, handle.rows, handle.cols
            )));
        }
        let bytes = self.arena.upload(&self.queue, handle, host.data)?;
        self.metrics.record_upload_bytes(bytes);
        Ok(())
    }

    pub fn retain(&self, handle: &TextureHandle) -> TexelResult<()> {
        self.ensure_live()?;
        self.arena.retain(handle)
    }

    /// Drop one reference; storage is reclaimed (into the recycling pool) at
    /// count zero. Callers must drain pending fences before releasing storage
    /// the GPU may still be writing.
    pub fn release(&self, handle: &TextureHandle) -> TexelResult<()> {
        self.ensure_live()?;
        if let Some(view_id) = self.arena.release(handle)? {
            self.bind_groups.invalidate_view(view_id);
        }
        Ok(())
    }

    // --- Program compiler/cache -----------------------------------------

    pub fn compile_program(&self, spec: &ProgramSpec) -> TexelResult<ProgramHandle> {
        self.ensure_live()?;
        self.programs.compile(&self.device, &self.metrics, spec)
    }

    /// No-op when the program is already active.
    pub fn bind_program(&self, handle: &ProgramHandle) -> TexelResult<()> {
        self.ensure_live()?;
        self.programs.bind(handle);
        Ok(())
    }

    pub fn evict_program(&self, handle: &ProgramHandle) -> TexelResult<()> {
        self.ensure_live()?;
        self.programs.evict(handle);
        Ok(())
    }

    // --- Binding & dispatch ---------------------------------------------

    /// Start configuring a dispatch of the active program.
    pub fn begin_dispatch(&self) -> TexelResult<DispatchBuilder<'_>> {
        self.ensure_live()?;
        let program = self
            .programs
            .active()
            .ok_or_else(|| TexelError::binding("no program bound"))?;
        Ok(DispatchBuilder::new(self, program))
    }

    // --- Synchronization -------------------------------------------------

    pub fn is_fence_passed(&self, token: FenceToken) -> bool {
        self.fences.is_passed(&self.device, token)
    }

    pub fn fence_state(&self, token: FenceToken) -> FenceState {
        self.fences.state(token)
    }

    pub async fn await_fence(&self, token: FenceToken) {
        self.fences.await_fence(&self.device, token).await;
    }

    // --- Timing ----------------------------------------------------------

    pub fn begin_timer_query(&self) -> TexelResult<TimerToken> {
        self.ensure_live()?;
        self.timing.begin()
    }

    pub fn end_timer_query(&self) -> TexelResult<TimerToken> {
        self.ensure_live()?;
        self.timing.end()
    }

    pub fn resolve_timer_query(&self, token: TimerToken) -> TexelResult<ElapsedTime> {
        self.ensure_live()?;
        self.timing
            .resolve(&self.device, &self.queue, &self.fences, token)
    }

    // --- Kernel dispatch entry point -------------------------------------

    /// The integration point for the op catalog: allocate output storage,
    /// compile (or fetch) the program, bind, dispatch, and hand back the
    /// output handle with its write fence recorded.
    pub fn dispatch_kernel(&self, request: &KernelRequest) -> TexelResult<TextureHandle> {
        self.ensure_live()?;
        let slot_names: Vec<&str> = request.inputs.iter().map(|(name, _)| *name).collect();
        let program = self.compile_program(&ProgramSpec {
            label: request.label,
            source: request.source,
            slots: &slot_names,
            output_rows: request.output_rows,
            output_cols: request.output_cols,
            output_layout: request.output_layout,
            output_element: request.output_element,
        })?;
        self.bind_program(&program)?;

        let output = self.allocate(
            request.output_rows,
            request.output_cols,
            request.output_layout,
            request.output_element,
        )?;
        let result = (|| {
            // Build against the program compiled above rather than the
            // context-wide active slot, which another thread may retarget.
            let mut builder = DispatchBuilder::new(self, program.0.clone());
            for (name, handle) in request.inputs {
                builder.bind_input(name, handle)?;
            }
            builder.set_output(&output, None)?;
            if let Some(params) = request.params {
                builder.set_params(params)?;
            }
            builder.dispatch()
        })();
        match result {
            Ok(_token) => Ok(output),
            Err(e) => {
                // Don't leak the output grid when the dispatch never issued.
                let _ = self.release(&output);
                Err(e)
            }
        }
    }

    /// Sub-region variant of `dispatch_kernel`: writes into an existing
    /// output handle instead of allocating one.
    pub fn dispatch_kernel_into(
        &self,
        request: &KernelRequest,
        output: &TextureHandle,
        region: Option<WriteRegion>,
    ) -> TexelResult<FenceToken> {
        self.ensure_live()?;
        let slot_names: Vec<&str> = request.inputs.iter().map(|(name, _)| *name).collect();
        let program = self.compile_program(&ProgramSpec {
            label: request.label,
            source: request.source,
            slots: &slot_names,
            output_rows: request.output_rows,
            output_cols: request.output_cols,
            output_layout: request.output_layout,
            output_element: request.output_element,
        })?;
        self.bind_program(&program)?;
        let mut builder = DispatchBuilder::new(self, program.0.clone());
        for (name, handle) in request.inputs {
            builder.bind_input(name, handle)?;
        }
        builder.set_output(output, region)?;
        if let Some(params) = request.params {
            builder.set_params(params)?;
        }
        builder.dispatch()
    }

    // --- Diagnostics & lifecycle -----------------------------------------

    pub fn diagnostics(&self) -> ContextDiagnostics {
        let (bg_hits, bg_misses) = self.bind_groups.counters();
        self.metrics.snapshot(
            self.arena.live_count(),
            self.arena.pooled_count(),
            self.programs.live_count(),
            self.fences.pending_count(),
            bg_hits,
            bg_misses,
            self.timing.supported(),
        )
    }

    pub fn device_info(&self) -> String {
        format!("{} ({:?})", self.adapter_info.name, self.adapter_info.backend)
    }

    pub fn max_texture_dim(&self) -> u32 {
        self.limits.max_texture_dimension_2d
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Tear down the context: drain pending fences so no storage is reclaimed
    /// while the GPU may still write it, then forcibly reclaim every texture
    /// and program. Safe to call twice; the second call is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fences.drain_blocking(&self.device);
        self.arena.dispose_all();
        self.programs.clear();
        self.bind_groups.clear();
        self.timing.clear();
        info!("texelflow context disposed (device {})", self.device_id);
    }
}

impl texelflow_api::TexelProvider for GpuContext {
    fn allocate(
        &self,
        rows: usize,
        cols: usize,
        layout: TexelLayout,
        element: ElementType,
    ) -> TexelResult<TextureHandle> {
        GpuContext::allocate(self, rows, cols, layout, element)
    }

    fn upload(&self, handle: &TextureHandle, host: &HostTensorView) -> TexelResult<()> {
        GpuContext::upload(self, handle, host)
    }

    fn download(&self, handle: &TextureHandle) -> TexelResult<texelflow_api::HostTensorOwned> {
        GpuContext::download(self, handle)
    }

    fn download_async<'a>(&'a self, handle: &'a TextureHandle) -> texelflow_api::DownloadFuture<'a> {
        GpuContext::download_async(self, handle)
    }

    fn retain(&self, handle: &TextureHandle) -> TexelResult<()> {
        GpuContext::retain(self, handle)
    }

    fn release(&self, handle: &TextureHandle) -> TexelResult<()> {
        GpuContext::release(self, handle)
    }

    fn dispatch_kernel(&self, request: &KernelRequest) -> TexelResult<TextureHandle> {
        GpuContext::dispatch_kernel(self, request)
    }

    fn diagnostics(&self) -> ContextDiagnostics {
        GpuContext::diagnostics(self)
    }

    fn device_info(&self) -> String {
        GpuContext::device_info(self)
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }
}
