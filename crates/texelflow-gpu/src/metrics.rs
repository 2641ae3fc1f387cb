use std::sync::atomic::{AtomicU64, Ordering};

use texelflow_api::ContextDiagnostics;

/// Context-wide counters. Cache-level hit/miss counters live with their
/// caches and are merged in at snapshot time.
#[derive(Default)]
pub struct ContextMetrics {
    shader_compiles: AtomicU64,
    program_cache_hits: AtomicU64,
    program_cache_misses: AtomicU64,
    dispatches: AtomicU64,
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
}

impl ContextMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_shader_compile(&self) {
        self.shader_compiles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_program_hit(&self) {
        self.program_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_program_miss(&self) {
        self.program_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload_bytes(&self, bytes: u64) {
        if bytes > 0 {
            self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_download_bytes(&self, bytes: u64) {
        if bytes > 0 {
            self.download_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn shader_compiles(&self) -> u64 {
        self.shader_compiles.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.shader_compiles.store(0, Ordering::Relaxed);
        self.program_cache_hits.store(0, Ordering::Relaxed);
        self.program_cache_misses.store(0, Ordering::Relaxed);
        self.dispatches.store(0, Ordering::Relaxed);
        self.upload_bytes.store(0, Ordering::Relaxed);
        self.download_bytes.store(0, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn snapshot(
        &self,
        live_textures: usize,
        pooled_textures: usize,
        live_programs: usize,
        pending_fences: usize,
        bind_group_cache_hits: u64,
        bind_group_cache_misses: u64,
        timing_reliable: bool,
    ) -> ContextDiagnostics {
        ContextDiagnostics {
            live_textures,
            pooled_textures,
            live_programs,
            pending_fences,
            shader_compiles: self.shader_compiles.load(Ordering::Relaxed),
            program_cache_hits: self.program_cache_hits.load(Ordering::Relaxed),
            program_cache_misses: self.program_cache_misses.load(Ordering::Relaxed),
            bind_group_cache_hits,
            bind_group_cache_misses,
            dispatches: self.dispatches.load(Ordering::Relaxed),
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
            download_bytes: self.download_bytes.load(Ordering::Relaxed),
            timing_reliable,
        }
    }
}
