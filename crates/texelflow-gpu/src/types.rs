use bytemuck::{Pod, Zeroable};
use texelflow_api::{ElementType, TexelLayout};

/// Uniform block bound at the slot after the last input texture of every
/// program. Gives the shader the logical output grid and the write region in
/// physical texel coordinates.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GridUniforms {
    pub out_rows: u32,
    pub out_cols: u32,
    pub region_row0: u32,
    pub region_col0: u32,
    pub region_rows: u32,
    pub region_cols: u32,
    pub phys_rows: u32,
    pub phys_cols: u32,
}

/// Device texture format for a layout/element pairing. All formats here are
/// renderable color targets and loadable as `texture_2d<f32>`.
pub fn texture_format(layout: TexelLayout, element: ElementType) -> wgpu::TextureFormat {
    match (layout, element) {
        (TexelLayout::Unpacked, ElementType::F32) => wgpu::TextureFormat::R32Float,
        (TexelLayout::Unpacked, ElementType::F16) => wgpu::TextureFormat::R16Float,
        (TexelLayout::Unpacked, ElementType::U8) => wgpu::TextureFormat::R8Unorm,
        (TexelLayout::Packed, ElementType::F32) => wgpu::TextureFormat::Rgba32Float,
        (TexelLayout::Packed, ElementType::F16) => wgpu::TextureFormat::Rgba16Float,
        (TexelLayout::Packed, ElementType::U8) => wgpu::TextureFormat::Rgba8Unorm,
    }
}
