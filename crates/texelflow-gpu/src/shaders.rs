//! Embedded WGSL sources.
//!
//! Every program shares the same vertex stage: a single triangle covering the
//! viewport, so the fragment stage runs once per texel of the output write
//! region. Program sources are fragment-only and must export `fs_main`.
//!
//! Binding convention for a program with `n` input slots: bindings `0..n` are
//! the input textures in slot order, binding `n` is the grid uniform block,
//! binding `n + 1` is the caller-supplied parameter block. Programs may
//! reference any subset.

pub const FULLSCREEN_VERTEX_SHADER: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    var corners = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(3.0, -1.0),
        vec2<f32>(-1.0, 3.0),
    );
    return vec4<f32>(corners[index], 0.0, 1.0);
}
"#;

/// Copies the input grid texel-for-texel. One input slot: `src`.
pub const COPY_SHADER: &str = r#"
@group(0) @binding(0) var src: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    return textureLoad(src, vec2<i32>(pos.xy), 0);
}
"#;

/// Texel-wise sum of two grids. Input slots: `a`, `b`.
pub const ADD_SHADER: &str = r#"
@group(0) @binding(0) var a: texture_2d<f32>;
@group(0) @binding(1) var b: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let texel = vec2<i32>(pos.xy);
    return textureLoad(a, texel, 0) + textureLoad(b, texel, 0);
}
"#;

/// Scales the input grid by `params.factor`. One input slot: `src`; expects a
/// 16-byte parameter block whose first f32 is the factor.
pub const SCALE_SHADER: &str = r#"
@group(0) @binding(0) var src: texture_2d<f32>;

struct ScaleParams {
    factor: f32,
    pad0: f32,
    pad1: f32,
    pad2: f32,
};
@group(0) @binding(2) var<uniform> params: ScaleParams;

@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    return textureLoad(src, vec2<i32>(pos.xy), 0) * params.factor;
}
"#;

/// Writes a constant to every texel of the write region. No input slots;
/// expects a 16-byte parameter block interpreted as a vec4.
pub const FILL_SHADER: &str = r#"
struct FillParams {
    value: vec4<f32>,
};
@group(0) @binding(1) var<uniform> params: FillParams;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return params.value;
}
"#;
