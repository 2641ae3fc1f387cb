//! Program compilation and caching.
//!
//! A program is an opaque WGSL fragment source plus its interface: ordered
//! input slot names and the declared output grid. Compilation is deterministic
//! for an identical spec, so the cache key is a stable hash over the source
//! and interface; repeated requests for the same kernel body reuse one
//! pipeline and never re-invoke the shader compiler. Pipelines are destroyed
//! by explicit eviction or disposal, never left to collection, to respect the
//! finite program-object budget of real drivers.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use texelflow_api::{ElementType, TexelError, TexelLayout, TexelResult};

use crate::bindings::build_program_bgl;
use crate::metrics::ContextMetrics;
use crate::shaders::FULLSCREEN_VERTEX_SHADER;
use crate::types::texture_format;

#[derive(Debug, Clone, Copy)]
pub struct ProgramSpec<'a> {
    pub label: &'a str,
    pub source: &'a str,
    pub slots: &'a [&'a str],
    pub output_rows: usize,
    pub output_cols: usize,
    pub output_layout: TexelLayout,
    pub output_element: ElementType,
}

pub(crate) struct Program {
    pub id: u64,
    pub key: u64,
    pub pipeline: wgpu::RenderPipeline,
    pub layout: wgpu::BindGroupLayout,
    pub slots: Vec<String>,
    pub output_rows: usize,
    pub output_cols: usize,
    pub output_layout: TexelLayout,
    pub output_element: ElementType,
}

impl Program {
    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s == name)
    }
}

/// Shared, cached, explicitly destroyed compiled program.
#[derive(Clone)]
pub struct ProgramHandle(pub(crate) Arc<Program>);

impl std::fmt::Debug for ProgramHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramHandle")
            .field("id", &self.0.id)
            .field("slots", &self.0.slots)
            .finish_non_exhaustive()
    }
}

impl ProgramHandle {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn slots(&self) -> &[String] {
        &self.0.slots
    }
}

fn program_key(spec: &ProgramSpec) -> u64 {
    let mut hasher = DefaultHasher::new();
    spec.source.hash(&mut hasher);
    spec.slots.hash(&mut hasher);
    spec.output_rows.hash(&mut hasher);
    spec.output_cols.hash(&mut hasher);
    texture_format(spec.output_layout, spec.output_element).hash(&mut hasher);
    hasher.finish()
}

pub struct ProgramCache {
    programs: Mutex<HashMap<u64, Arc<Program>>>,
    active: Mutex<Option<Arc<Program>>>,
    vertex_module: Mutex<Option<Arc<wgpu::ShaderModule>>>,
    next_id: AtomicU64,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self {
            programs: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            vertex_module: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn vertex_module(&self, device: &wgpu::Device) -> Arc<wgpu::ShaderModule> {
        let mut guard = self.vertex_module.lock().expect("vertex module poisoned");
        guard
            .get_or_insert_with(|| {
                Arc::new(device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("texelflow-fullscreen-vs"),
                    source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(
                        FULLSCREEN_VERTEX_SHADER,
                    )),
                }))
            })
            .clone()
    }

    /// Compile `spec` or return the cached pipeline for an identical spec.
    /// Compilation failures carry the platform diagnostic and are fatal to
    /// the requesting operation only.
    pub fn compile(
        &self,
        device: &wgpu::Device,
        metrics: &ContextMetrics,
        spec: &ProgramSpec,
    ) -> TexelResult<ProgramHandle> {
        let key = program_key(spec);
        if let Some(existing) = self
            .programs
            .lock()
            .expect("program cache poisoned")
            .get(&key)
            .cloned()
        {
            metrics.inc_program_hit();
            log::debug!("program_cache hit key={key:#x} label={}", spec.label);
            return Ok(ProgramHandle(existing));
        }
        metrics.inc_program_miss();

        let vertex = self.vertex_module(device);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(spec.label),
            source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(spec.source)),
        });
        let layout = build_program_bgl(device, spec.label, spec.slots.len());
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(spec.label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(spec.label),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex,
                entry_point: "vs_main",
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &fragment,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: texture_format(spec.output_layout, spec.output_element),
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            let log = match err {
                wgpu::Error::Validation { description, .. } => description,
                other => other.to_string(),
            };
            log::warn!("program '{}' failed to compile: {log}", spec.label);
            return Err(TexelError::Compile { log });
        }
        metrics.inc_shader_compile();

        let program = Arc::new(Program {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            pipeline,
            layout,
            slots: spec.slots.iter().map(|s| s.to_string()).collect(),
            output_rows: spec.output_rows,
            output_cols: spec.output_cols,
            output_layout: spec.output_layout,
            output_element: spec.output_element,
        });
        log::debug!(
            "program_cache compiled key={key:#x} id={} label={}",
            program.id,
            spec.label
        );
        self.programs
            .lock()
            .expect("program cache poisoned")
            .insert(key, program.clone());
        Ok(ProgramHandle(program))
    }

    /// Make `handle` the active program for subsequent dispatches. Returns
    /// false (and touches nothing) when it already is.
    pub fn bind(&self, handle: &ProgramHandle) -> bool {
        let mut guard = self.active.lock().expect("active program poisoned");
        if guard.as_ref().is_some_and(|p| p.id == handle.0.id) {
            return false;
        }
        *guard = Some(handle.0.clone());
        true
    }

    pub(crate) fn active(&self) -> Option<Arc<Program>> {
        self.active.lock().expect("active program poisoned").clone()
    }

    /// Destroy a cached program. The caller guarantees no dispatch is
    /// outstanding against it.
    pub fn evict(&self, handle: &ProgramHandle) {
        let mut guard = self.programs.lock().expect("program cache poisoned");
        guard.remove(&handle.0.key);
        drop(guard);
        let mut active = self.active.lock().expect("active program poisoned");
        if active.as_ref().is_some_and(|p| p.id == handle.0.id) {
            *active = None;
        }
    }

    pub fn live_count(&self) -> usize {
        self.programs.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.programs.lock() {
            guard.clear();
        }
        if let Ok(mut active) = self.active.lock() {
            *active = None;
        }
    }
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(source: &'a str, slots: &'a [&'a str]) -> ProgramSpec<'a> {
        ProgramSpec {
            label: "test",
            source,
            slots,
            output_rows: 4,
            output_cols: 4,
            output_layout: TexelLayout::Unpacked,
            output_element: ElementType::F32,
        }
    }

    #[test]
    fn identical_specs_share_a_key() {
        let a = program_key(&spec("fragment body", &["src"]));
        let b = program_key(&spec("fragment body", &["src"]));
        assert_eq!(a, b);
    }

    #[test]
    fn key_separates_source_and_interface() {
        let base = program_key(&spec("fragment body", &["src"]));
        assert_ne!(base, program_key(&spec("other body", &["src"])));
        assert_ne!(base, program_key(&spec("fragment body", &["a", "b"])));
        let packed = ProgramSpec {
            output_layout: TexelLayout::Packed,
            ..spec("fragment body", &["src"])
        };
        assert_ne!(base, program_key(&packed));
    }
}
