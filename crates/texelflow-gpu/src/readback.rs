//! Copying device storage back to host memory.
//!
//! Both paths wait for the fence guarding the most recent write to the
//! handle (draining the fence queue in issuance order), copy the texture into
//! a padded staging buffer, then strip the row padding and decode the texel
//! layout. The async path never blocks the calling thread: fence and map
//! completion are awaited through cooperative poll futures. The sync path is
//! for hosts without an executor and blocks on `Maintain::Wait`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use texelflow_api::{DownloadFuture, HostTensorOwned, TexelError, TexelResult, TextureHandle};

use crate::alloc::TextureEntry;
use crate::context::GpuContext;
use crate::packing;

struct Staging {
    buffer: wgpu::Buffer,
    row_pitch: usize,
    size_bytes: u64,
}

/// Future that pumps the device while waiting for a buffer map to complete,
/// yielding to the executor between polls.
struct MapWait<'a> {
    device: &'a wgpu::Device,
    rx: oneshot::Receiver<Result<(), wgpu::BufferAsyncError>>,
}

impl Future for MapWait<'_> {
    type Output = TexelResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(Ok(()))) => Poll::Ready(Ok(())),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(TexelError::internal(e.to_string()))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TexelError::internal(
                "map_async callback dropped",
            ))),
            Poll::Pending => {
                self.device.poll(wgpu::Maintain::Poll);
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

impl GpuContext {
    fn stage_copy(&self, entry: &TextureEntry) -> Staging {
        let unpadded =
            packing::unpadded_bytes_per_row(entry.phys_cols, entry.layout, entry.element);
        let row_pitch = packing::padded_bytes_per_row(unpadded);
        let size_bytes = (row_pitch * entry.phys_rows as usize) as u64;
        let buffer = self.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("texelflow-readback-staging"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texelflow-readback-encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: entry.texture.as_ref(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(row_pitch as u32),
                    rows_per_image: Some(entry.phys_rows),
                },
            },
            wgpu::Extent3d {
                width: entry.phys_cols,
                height: entry.phys_rows,
                depth_or_array_layers: 1,
            },
        );
        self.submit(encoder);
        Staging {
            buffer,
            row_pitch,
            size_bytes,
        }
    }

    fn finish_readback(
        &self,
        entry: &TextureEntry,
        staging: &Staging,
    ) -> TexelResult<HostTensorOwned> {
        let slice = staging.buffer.slice(..);
        let data = slice.get_mapped_range();
        let decoded = packing::decode_texels(
            &data,
            entry.rows,
            entry.cols,
            entry.layout,
            entry.element,
            staging.row_pitch,
        )?;
        drop(data);
        staging.buffer.unmap();
        self.metrics().record_download_bytes(staging.size_bytes);
        Ok(HostTensorOwned {
            data: decoded,
            rows: entry.rows,
            cols: entry.cols,
        })
    }

    /// Asynchronous readback: resolves once the handle's last write has
    /// retired and the staging copy is mapped, without blocking the host.
    pub fn download_async<'a>(&'a self, handle: &'a TextureHandle) -> DownloadFuture<'a> {
        Box::pin(async move {
            self.ensure_live()?;
            let entry = self.arena().get(handle)?;
            log::trace!(
                "download id={} {}x{} {:?}",
                handle.texture_id,
                entry.rows,
                entry.cols,
                entry.layout
            );
            if let Some(token) = entry.last_write {
                self.fences().await_fence(self.device(), token).await;
            }
            let staging = self.stage_copy(&entry);
            let slice = staging.buffer.slice(..);
            let (tx, rx) = oneshot::channel();
            slice.map_async(wgpu::MapMode::Read, move |res| {
                let _ = tx.send(res);
            });
            MapWait {
                device: self.device(),
                rx,
            }
            .await?;
            self.finish_readback(&entry, &staging)
        })
    }

    /// Blocking readback used when asynchronous completion is unavailable or
    /// undesired.
    pub fn download(&self, handle: &TextureHandle) -> TexelResult<HostTensorOwned> {
        self.ensure_live()?;
        let entry = self.arena().get(handle)?;
        if let Some(token) = entry.last_write {
            self.fences().wait_blocking(self.device(), token);
        }
        let staging = self.stage_copy(&entry);
        let slice = staging.buffer.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device().poll(wgpu::Maintain::Wait);
        pollster::block_on(rx)
            .map_err(|_| TexelError::internal("map_async callback dropped"))?
            .map_err(|e| TexelError::internal(e.to_string()))?;
        self.finish_readback(&entry, &staging)
    }
}
