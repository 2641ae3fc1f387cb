//! Texture arena: storage handles, explicit reference counts, and a bounded
//! recycling pool for retired grids.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use texelflow_api::{ElementType, TexelError, TexelLayout, TexelResult, TextureHandle};

use crate::packing;
use crate::sync::FenceToken;
use crate::types::texture_format;

#[derive(Clone)]
pub(crate) struct TextureEntry {
    pub texture: Arc<wgpu::Texture>,
    pub view: Arc<wgpu::TextureView>,
    pub rows: usize,
    pub cols: usize,
    pub layout: TexelLayout,
    pub element: ElementType,
    pub phys_rows: u32,
    pub phys_cols: u32,
    pub refcount: usize,
    pub last_write: Option<FenceToken>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    phys_rows: u32,
    phys_cols: u32,
    layout: TexelLayout,
    element: ElementType,
}

struct PooledTexture {
    texture: Arc<wgpu::Texture>,
    view: Arc<wgpu::TextureView>,
}

/// Bounded free-list of retired textures keyed by physical grid and format.
/// Reuse avoids paying allocation cost for the common same-shape-again case.
struct TexturePool {
    pools: Mutex<HashMap<PoolKey, VecDeque<PooledTexture>>>,
    max_per_key: usize,
}

impl TexturePool {
    fn new(max_per_key: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            max_per_key,
        }
    }

    fn acquire(&self, key: PoolKey) -> Option<PooledTexture> {
        let mut guard = self.pools.lock().ok()?;
        let recycled = guard.get_mut(&key)?.pop_front()?;
        log::trace!(
            "texture_pool: reuse {}x{} {:?}/{:?}",
            key.phys_rows,
            key.phys_cols,
            key.layout,
            key.element
        );
        Some(recycled)
    }

    fn release(&self, key: PoolKey, texture: Arc<wgpu::Texture>, view: Arc<wgpu::TextureView>) {
        if let Ok(mut guard) = self.pools.lock() {
            let queue = guard.entry(key).or_default();
            if queue.len() < self.max_per_key {
                log::trace!(
                    "texture_pool: retain {}x{} {:?}/{:?}",
                    key.phys_rows,
                    key.phys_cols,
                    key.layout,
                    key.element
                );
                queue.push_back(PooledTexture { texture, view });
                return;
            }
            log::trace!(
                "texture_pool: drop {}x{} {:?}/{:?} (pool full)",
                key.phys_rows,
                key.phys_cols,
                key.layout,
                key.element
            );
        }
        texture.destroy();
    }

    fn len(&self) -> usize {
        self.pools
            .lock()
            .map(|guard| guard.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.pools.lock() {
            for (_, queue) in guard.drain() {
                for pooled in queue {
                    pooled.texture.destroy();
                }
            }
        }
    }
}

pub struct TextureArena {
    entries: Mutex<HashMap<u64, TextureEntry>>,
    pool: TexturePool,
    next_id: AtomicU64,
    device_id: u32,
    max_dim: u32,
}

impl TextureArena {
    pub fn new(device_id: u32, max_dim: u32, pool_max_per_key: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pool: TexturePool::new(pool_max_per_key),
            next_id: AtomicU64::new(1),
            device_id,
            max_dim,
        }
    }

    /// Create (or recycle) storage for a logical grid. Dimension problems are
    /// reported here, not at dispatch time; device out-of-memory is caught
    /// through an error scope around the allocation.
    pub fn allocate(
        &self,
        device: &wgpu::Device,
        rows: usize,
        cols: usize,
        layout: TexelLayout,
        element: ElementType,
    ) -> TexelResult<TextureHandle> {
        if rows == 0 || cols == 0 {
            return Err(TexelError::allocation(format!(
                "grid dimensions must be positive, got {rows}x{cols}"
            )));
        }
        let (phys_rows, phys_cols) = packing::physical_dims(rows, cols, layout);
        if phys_rows > self.max_dim || phys_cols > self.max_dim {
            return Err(TexelError::allocation(format!(
                "physical grid {phys_rows}x{phys_cols} exceeds device maximum {}",
                self.max_dim
            )));
        }

        let key = PoolKey {
            phys_rows,
            phys_cols,
            layout,
            element,
        };
        let (texture, view) = match self.pool.acquire(key) {
            Some(recycled) => (recycled.texture, recycled.view),
            None => {
                device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
                let texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("texelflow-grid"),
                    size: wgpu::Extent3d {
                        width: phys_cols,
                        height: phys_rows,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: texture_format(layout, element),
                    usage: wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                if let Some(err) = pollster::block_on(device.pop_error_scope()) {
                    return Err(TexelError::allocation(err.to_string()));
                }
                let view = Arc::new(texture.create_view(&wgpu::TextureViewDescriptor::default()));
                (Arc::new(texture), view)
            }
        };

        let texture_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = TextureEntry {
            texture,
            view,
            rows,
            cols,
            layout,
            element,
            phys_rows,
            phys_cols,
            refcount: 1,
            last_write: None,
        };
        self.entries
            .lock()
            .expect("texture arena poisoned")
            .insert(texture_id, entry);
        log::trace!("arena: allocate id={texture_id} {rows}x{cols} {layout:?}/{element:?}");
        Ok(TextureHandle {
            rows,
            cols,
            layout,
            element,
            device_id: self.device_id,
            texture_id,
        })
    }

    pub(crate) fn get(&self, handle: &TextureHandle) -> TexelResult<TextureEntry> {
        if handle.device_id != self.device_id {
            return Err(TexelError::lifecycle(format!(
                "handle device mismatch: expected {}, got {}",
                self.device_id, handle.device_id
            )));
        }
        let guard = self.entries.lock().expect("texture arena poisoned");
        guard.get(&handle.texture_id).cloned().ok_or_else(|| {
            TexelError::lifecycle(format!(
                "texture {} not found (already released?)",
                handle.texture_id
            ))
        })
    }

    /// Copy host data into device storage, re-encoding for the handle's
    /// layout and element type. Returns the device byte count for telemetry.
    pub fn upload(
        &self,
        queue: &wgpu::Queue,
        handle: &TextureHandle,
        data: &[f32],
    ) -> TexelResult<u64> {
        let entry = self.get(handle)?;
        if data.len() != entry.rows * entry.cols {
            return Err(TexelError::format(format!(
                "upload of {} elements into {}x{} grid (expects {})",
                data.len(),
                entry.rows,
                entry.cols,
                entry.rows * entry.cols
            )));
        }
        let encoded =
            packing::encode_texels(data, entry.rows, entry.cols, entry.layout, entry.element)?;
        let bytes_per_row =
            packing::unpadded_bytes_per_row(entry.phys_cols, entry.layout, entry.element) as u32;
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: entry.texture.as_ref(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &encoded,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(entry.phys_rows),
            },
            wgpu::Extent3d {
                width: entry.phys_cols,
                height: entry.phys_rows,
                depth_or_array_layers: 1,
            },
        );
        Ok(encoded.len() as u64)
    }

    pub fn retain(&self, handle: &TextureHandle) -> TexelResult<()> {
        let mut guard = self.entries.lock().expect("texture arena poisoned");
        let entry = guard.get_mut(&handle.texture_id).ok_or_else(|| {
            TexelError::lifecycle(format!(
                "retain of texture {} after release",
                handle.texture_id
            ))
        })?;
        entry.refcount += 1;
        Ok(())
    }

    /// Drop one reference. Returns the retired view's id when the count hit
    /// zero so the caller can invalidate bind-group cache entries. Releasing
    /// a handle that is not live is a double-free and reported as such.
    pub fn release(&self, handle: &TextureHandle) -> TexelResult<Option<wgpu::Id<wgpu::TextureView>>> {
        let mut guard = self.entries.lock().expect("texture arena poisoned");
        let entry = guard.get_mut(&handle.texture_id).ok_or_else(|| {
            TexelError::lifecycle(format!(
                "double free of texture {}",
                handle.texture_id
            ))
        })?;
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(None);
        }
        let entry = guard.remove(&handle.texture_id).expect("entry vanished");
        drop(guard);
        let view_id = entry.view.global_id();
        log::trace!("arena: release id={} to pool", handle.texture_id);
        self.pool.release(
            PoolKey {
                phys_rows: entry.phys_rows,
                phys_cols: entry.phys_cols,
                layout: entry.layout,
                element: entry.element,
            },
            entry.texture,
            entry.view,
        );
        Ok(Some(view_id))
    }

    /// Record the fence guarding the most recent write into `handle`.
    pub fn note_write(&self, handle: &TextureHandle, token: FenceToken) {
        if let Ok(mut guard) = self.entries.lock() {
            if let Some(entry) = guard.get_mut(&handle.texture_id) {
                entry.last_write = Some(token);
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn pooled_count(&self) -> usize {
        self.pool.len()
    }

    /// Forcibly reclaim every live texture and empty the pool. Used by
    /// context disposal only; outstanding handles become invalid.
    pub fn dispose_all(&self) {
        let mut guard = self.entries.lock().expect("texture arena poisoned");
        for (_, entry) in guard.drain() {
            entry.texture.destroy();
        }
        drop(guard);
        self.pool.clear();
    }
}
