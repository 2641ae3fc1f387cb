//! Binding and dispatch.
//!
//! A `DispatchBuilder` is pure state configuration: input binds, the single
//! output target with its write region, and uniform parameters. Nothing
//! touches the GPU until `dispatch()`, which encodes one render pass drawing
//! the full-screen triangle over the write region and submits it. The builder
//! is consumed by `dispatch()`, so binds performed afterwards can never affect
//! an already-issued dispatch.

use std::sync::Arc;

use bytemuck::bytes_of;
use texelflow_api::{TexelError, TexelResult, TextureHandle, WriteRegion};

use crate::alloc::TextureEntry;
use crate::config::MAX_PARAM_BYTES;
use crate::context::GpuContext;
use crate::program::Program;
use crate::sync::FenceToken;
use crate::types::GridUniforms;

/// Persistent uniform buffers reused by every dispatch. Queue writes are
/// ordered against submitted passes, so rewriting them between dispatches is
/// safe under the single-queue model.
pub(crate) struct DispatchResources {
    pub grid: wgpu::Buffer,
    pub params: wgpu::Buffer,
}

impl DispatchResources {
    pub fn new(device: &wgpu::Device) -> Self {
        let grid = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texelflow-grid-uniforms"),
            size: std::mem::size_of::<GridUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texelflow-param-uniforms"),
            size: MAX_PARAM_BYTES as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self { grid, params }
    }
}

pub struct DispatchBuilder<'c> {
    ctx: &'c GpuContext,
    program: Arc<Program>,
    inputs: Vec<Option<TextureHandle>>,
    output: Option<(TextureHandle, WriteRegion)>,
    params: Option<Vec<u8>>,
}

impl std::fmt::Debug for DispatchBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchBuilder")
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl<'c> DispatchBuilder<'c> {
    pub(crate) fn new(ctx: &'c GpuContext, program: Arc<Program>) -> Self {
        let slot_count = program.slots.len();
        Self {
            ctx,
            program,
            inputs: vec![None; slot_count],
            output: None,
            params: None,
        }
    }

    /// Associate storage with a named input slot of the active program.
    /// Unknown names fail here, not at dispatch time, so the error points at
    /// the faulty bind call.
    pub fn bind_input(&mut self, name: &str, handle: &TextureHandle) -> TexelResult<&mut Self> {
        let index = self
            .program
            .slot_index(name)
            .ok_or_else(|| TexelError::UnboundSlot {
                name: name.to_string(),
            })?;
        // Surface stale handles at bind time as well.
        self.ctx.arena().get(handle)?;
        self.inputs[index] = Some(handle.clone());
        Ok(self)
    }

    /// Designate the render target and the texel sub-rectangle to write.
    /// `None` selects the full grid. Only one output is bound per dispatch.
    pub fn set_output(
        &mut self,
        handle: &TextureHandle,
        region: Option<WriteRegion>,
    ) -> TexelResult<&mut Self> {
        let entry = self.ctx.arena().get(handle)?;
        if entry.rows != self.program.output_rows || entry.cols != self.program.output_cols {
            return Err(TexelError::binding(format!(
                "output grid {}x{} does not match program's declared {}x{}",
                entry.rows, entry.cols, self.program.output_rows, self.program.output_cols
            )));
        }
        if entry.layout != self.program.output_layout || entry.element != self.program.output_element
        {
            return Err(TexelError::binding(
                "output layout/element does not match program declaration".to_string(),
            ));
        }
        let region = region.unwrap_or_else(|| WriteRegion::full(entry.phys_rows, entry.phys_cols));
        if !region.fits(entry.phys_rows, entry.phys_cols) {
            return Err(TexelError::binding(format!(
                "write region {region:?} exceeds {}x{} texel grid",
                entry.phys_rows, entry.phys_cols
            )));
        }
        self.output = Some((handle.clone(), region));
        Ok(self)
    }

    /// Uniform parameter bytes made available to the program.
    pub fn set_params(&mut self, bytes: &[u8]) -> TexelResult<&mut Self> {
        if bytes.len() > MAX_PARAM_BYTES {
            return Err(TexelError::binding(format!(
                "parameter block of {} bytes exceeds the {MAX_PARAM_BYTES}-byte limit",
                bytes.len()
            )));
        }
        self.params = Some(bytes.to_vec());
        Ok(self)
    }

    /// Issue the draw call covering the write region. This is the only
    /// operation with a computational side effect; everything before it is
    /// state configuration.
    pub fn dispatch(self) -> TexelResult<FenceToken> {
        self.ctx.ensure_live()?;
        let mut input_entries: Vec<TextureEntry> = Vec::with_capacity(self.inputs.len());
        for (slot, input) in self.program.slots.iter().zip(&self.inputs) {
            match input {
                Some(handle) => input_entries.push(self.ctx.arena().get(handle)?),
                None => {
                    return Err(TexelError::binding(format!(
                        "input slot '{slot}' was never bound"
                    )))
                }
            }
        }
        let (out_handle, region) = self
            .output
            .ok_or_else(|| TexelError::binding("no output bound".to_string()))?;
        let out_entry = self.ctx.arena().get(&out_handle)?;

        let serial = self
            .ctx
            .dispatch_serial()
            .lock()
            .map_err(|_| TexelError::internal("dispatch serialization poisoned"))?;

        let token = self.ctx.fences().issue();

        let grid = GridUniforms {
            out_rows: out_entry.rows as u32,
            out_cols: out_entry.cols as u32,
            region_row0: region.row0,
            region_col0: region.col0,
            region_rows: region.rows,
            region_cols: region.cols,
            phys_rows: out_entry.phys_rows,
            phys_cols: out_entry.phys_cols,
        };
        let resources = self.ctx.dispatch_resources();
        self.ctx
            .queue()
            .write_buffer(&resources.grid, 0, bytes_of(&grid));
        let mut param_block = [0u8; MAX_PARAM_BYTES];
        if let Some(params) = &self.params {
            param_block[..params.len()].copy_from_slice(params);
        }
        self.ctx
            .queue()
            .write_buffer(&resources.params, 0, &param_block);

        let views: Vec<&wgpu::TextureView> =
            input_entries.iter().map(|e| e.view.as_ref()).collect();
        let bind_group = self.ctx.bind_groups().get_or_create(
            self.ctx.device(),
            &self.program.layout,
            &views,
            &[&resources.grid, &resources.params],
        );

        let mut encoder =
            self.ctx
                .device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("texelflow-dispatch"),
                });
        let timestamps = self.ctx.timing().pass_timestamps();
        {
            let timestamp_writes =
                timestamps.and_then(|(begin, end)| {
                    self.ctx.timing().query_set().map(|query_set| {
                        wgpu::RenderPassTimestampWrites {
                            query_set,
                            beginning_of_pass_write_index: Some(begin),
                            end_of_pass_write_index: Some(end),
                        }
                    })
                });
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("texelflow-dispatch-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: out_entry.view.as_ref(),
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes,
                occlusion_query_set: None,
            });
            pass.set_viewport(
                region.col0 as f32,
                region.row0 as f32,
                region.cols as f32,
                region.rows as f32,
                0.0,
                1.0,
            );
            pass.set_scissor_rect(region.col0, region.row0, region.cols, region.rows);
            pass.set_pipeline(&self.program.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.ctx.submit(encoder);
        self.ctx.fences().arm(self.ctx.queue(), token);
        drop(serial);
        self.ctx.arena().note_write(&out_handle, token);
        self.ctx.timing().note_dispatch(token);
        self.ctx.metrics().inc_dispatch();
        Ok(token)
    }
}
