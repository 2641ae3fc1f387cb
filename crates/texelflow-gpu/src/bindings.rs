use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Input textures are loaded with `textureLoad`, so the float32 formats'
/// non-filterable sample type is declared for every slot.
pub fn texture_input_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

pub fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Layout shared by every program with `n_inputs` slots: the input textures
/// in slot order, then the grid uniform block, then the parameter block.
/// Programs may reference any subset of the declared bindings.
pub fn build_program_bgl(
    device: &wgpu::Device,
    label: &str,
    n_inputs: usize,
) -> wgpu::BindGroupLayout {
    let mut entries = Vec::with_capacity(n_inputs + 2);
    for i in 0..n_inputs {
        entries.push(texture_input_entry(i as u32));
    }
    entries.push(uniform_entry(n_inputs as u32));
    entries.push(uniform_entry((n_inputs + 1) as u32));
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    })
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct BindGroupKey {
    layout_ptr: usize,
    views: SmallVec<[wgpu::Id<wgpu::TextureView>; 8]>,
    buffers: SmallVec<[wgpu::Id<wgpu::Buffer>; 2]>,
}

/// Bind groups keyed by layout identity and bound resource ids. Persistent
/// texture views and uniform buffers make repeat dispatches of the same
/// program/input combination cache hits.
pub struct BindGroupCache {
    inner: Mutex<HashMap<BindGroupKey, Arc<wgpu::BindGroup>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for BindGroupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BindGroupCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_or_create(
        &self,
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        views: &[&wgpu::TextureView],
        buffers: &[&wgpu::Buffer],
    ) -> Arc<wgpu::BindGroup> {
        let key = BindGroupKey {
            layout_ptr: layout as *const _ as usize,
            views: views.iter().map(|v| v.global_id()).collect(),
            buffers: buffers.iter().map(|b| b.global_id()).collect(),
        };
        if let Some(existing) = self
            .inner
            .lock()
            .ok()
            .and_then(|map| map.get(&key).cloned())
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("bind_group_cache hit layout_ptr={:#x}", key.layout_ptr);
            return existing;
        }

        let mut entries = Vec::with_capacity(views.len() + buffers.len());
        for (i, view) in views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        for (i, buffer) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: (views.len() + i) as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = Arc::new(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("texelflow-bind-group"),
            layout,
            entries: &entries,
        }));
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!("bind_group_cache miss layout_ptr={:#x}", key.layout_ptr);
        if let Ok(mut map) = self.inner.lock() {
            map.insert(key, bind_group.clone());
        }
        bind_group
    }

    /// Drop every cached group that references the retired view.
    pub fn invalidate_view(&self, view_id: wgpu::Id<wgpu::TextureView>) {
        if let Ok(mut map) = self.inner.lock() {
            map.retain(|key, _| !key.views.contains(&view_id));
        }
    }

    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.inner.lock() {
            map.clear();
        }
    }
}
