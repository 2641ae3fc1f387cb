//! Host-side texel codecs.
//!
//! Unpacked grids store one scalar per texel, so the physical grid equals the
//! logical grid. Packed grids store a 2x2 logical block per texel in RGBA
//! channel order `[(r,c), (r,c+1), (r+1,c), (r+1,c+1)]`; edge texels of
//! odd-sized grids are only partially populated and the decode side must never
//! read those padding lanes back into the logical result.

use half::f16;
use texelflow_api::{ElementType, TexelError, TexelLayout, TexelResult};

/// Physical texel grid for a logical `rows` x `cols` grid under `layout`.
pub fn physical_dims(rows: usize, cols: usize, layout: TexelLayout) -> (u32, u32) {
    match layout {
        TexelLayout::Unpacked => (rows as u32, cols as u32),
        TexelLayout::Packed => (rows.div_ceil(2) as u32, cols.div_ceil(2) as u32),
    }
}

pub fn bytes_per_texel(layout: TexelLayout, element: ElementType) -> usize {
    layout.channels() * element.channel_bytes()
}

pub fn unpadded_bytes_per_row(phys_cols: u32, layout: TexelLayout, element: ElementType) -> usize {
    phys_cols as usize * bytes_per_texel(layout, element)
}

/// Row pitch padded to the copy alignment wgpu requires for texture/buffer
/// transfers.
pub fn padded_bytes_per_row(unpadded: usize) -> usize {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
    unpadded.div_ceil(align) * align
}

fn write_channel(out: &mut Vec<u8>, value: f32, element: ElementType) {
    match element {
        ElementType::F32 => out.extend_from_slice(&value.to_le_bytes()),
        ElementType::F16 => out.extend_from_slice(&f16::from_f32(value).to_le_bytes()),
        ElementType::U8 => out.push((value.clamp(0.0, 1.0) * 255.0).round() as u8),
    }
}

fn read_channel(bytes: &[u8], offset: usize, element: ElementType) -> f32 {
    match element {
        ElementType::F32 => f32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]),
        ElementType::F16 => f16::from_le_bytes([bytes[offset], bytes[offset + 1]]).to_f32(),
        ElementType::U8 => bytes[offset] as f32 / 255.0,
    }
}

/// Encode row-major logical scalars into tightly packed texel rows suitable
/// for `Queue::write_texture`.
pub fn encode_texels(
    data: &[f32],
    rows: usize,
    cols: usize,
    layout: TexelLayout,
    element: ElementType,
) -> TexelResult<Vec<u8>> {
    if data.len() != rows * cols {
        return Err(TexelError::format(format!(
            "host data has {} elements, grid {}x{} requires {}",
            data.len(),
            rows,
            cols,
            rows * cols
        )));
    }
    let (phys_rows, phys_cols) = physical_dims(rows, cols, layout);
    let mut out = Vec::with_capacity(
        phys_rows as usize * unpadded_bytes_per_row(phys_cols, layout, element),
    );
    match layout {
        TexelLayout::Unpacked => {
            for &value in data {
                write_channel(&mut out, value, element);
            }
        }
        TexelLayout::Packed => {
            for pr in 0..phys_rows as usize {
                for pc in 0..phys_cols as usize {
                    for (dr, dc) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                        let r = pr * 2 + dr;
                        let c = pc * 2 + dc;
                        let value = if r < rows && c < cols {
                            data[r * cols + c]
                        } else {
                            0.0
                        };
                        write_channel(&mut out, value, element);
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Decode texel rows (tight or padded pitch) back into row-major logical
/// scalars. Padding lanes of edge texels are skipped, never read into the
/// output.
pub fn decode_texels(
    bytes: &[u8],
    rows: usize,
    cols: usize,
    layout: TexelLayout,
    element: ElementType,
    row_pitch: usize,
) -> TexelResult<Vec<f32>> {
    let (phys_rows, phys_cols) = physical_dims(rows, cols, layout);
    let unpadded = unpadded_bytes_per_row(phys_cols, layout, element);
    if row_pitch < unpadded {
        return Err(TexelError::internal(format!(
            "row pitch {row_pitch} smaller than texel row ({unpadded} bytes)"
        )));
    }
    let required = (phys_rows as usize - 1) * row_pitch + unpadded;
    if phys_rows > 0 && bytes.len() < required {
        return Err(TexelError::internal(format!(
            "readback buffer has {} bytes, grid requires {}",
            bytes.len(),
            required
        )));
    }
    let texel_bytes = bytes_per_texel(layout, element);
    let channel_bytes = element.channel_bytes();
    let mut out = vec![0.0f32; rows * cols];
    match layout {
        TexelLayout::Unpacked => {
            for r in 0..rows {
                let row_base = r * row_pitch;
                for c in 0..cols {
                    out[r * cols + c] = read_channel(bytes, row_base + c * texel_bytes, element);
                }
            }
        }
        TexelLayout::Packed => {
            for pr in 0..phys_rows as usize {
                let row_base = pr * row_pitch;
                for pc in 0..phys_cols as usize {
                    let texel_base = row_base + pc * texel_bytes;
                    for (lane, (dr, dc)) in [(0, 0), (0, 1), (1, 0), (1, 1)].iter().enumerate() {
                        let r = pr * 2 + dr;
                        let c = pc * 2 + dc;
                        if r < rows && c < cols {
                            out[r * cols + c] =
                                read_channel(bytes, texel_base + lane * channel_bytes, element);
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 + 1.0).collect()
    }

    fn roundtrip(rows: usize, cols: usize, layout: TexelLayout, element: ElementType) -> Vec<f32> {
        let data = ramp(rows * cols);
        let encoded = encode_texels(&data, rows, cols, layout, element).expect("encode");
        let (phys_rows, phys_cols) = physical_dims(rows, cols, layout);
        let unpadded = unpadded_bytes_per_row(phys_cols, layout, element);
        assert_eq!(encoded.len(), phys_rows as usize * unpadded);
        decode_texels(&encoded, rows, cols, layout, element, unpadded).expect("decode")
    }

    #[test]
    fn physical_dims_pack_2x2_blocks() {
        assert_eq!(physical_dims(4, 6, TexelLayout::Unpacked), (4, 6));
        assert_eq!(physical_dims(4, 6, TexelLayout::Packed), (2, 3));
        assert_eq!(physical_dims(5, 7, TexelLayout::Packed), (3, 4));
        assert_eq!(physical_dims(1, 1, TexelLayout::Packed), (1, 1));
    }

    #[test]
    fn unpacked_roundtrip_is_exact() {
        let data = ramp(12);
        assert_eq!(
            roundtrip(3, 4, TexelLayout::Unpacked, ElementType::F32),
            data
        );
    }

    #[test]
    fn packed_roundtrip_even_shape() {
        let data = ramp(24);
        assert_eq!(roundtrip(4, 6, TexelLayout::Packed, ElementType::F32), data);
    }

    #[test]
    fn packed_roundtrip_odd_rows_and_cols() {
        for (rows, cols) in [(5, 7), (1, 6), (6, 1), (3, 3), (1, 1)] {
            let data = ramp(rows * cols);
            assert_eq!(
                roundtrip(rows, cols, TexelLayout::Packed, ElementType::F32),
                data,
                "shape {rows}x{cols}"
            );
        }
    }

    #[test]
    fn packed_single_scalar() {
        let encoded = encode_texels(&[7.0], 1, 1, TexelLayout::Packed, ElementType::F32).unwrap();
        // one RGBA texel, three padding lanes
        assert_eq!(encoded.len(), 16);
        let decoded =
            decode_texels(&encoded, 1, 1, TexelLayout::Packed, ElementType::F32, 16).unwrap();
        assert_eq!(decoded, vec![7.0]);
    }

    #[test]
    fn packed_channel_order_matches_2x2_block() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let encoded = encode_texels(&data, 2, 2, TexelLayout::Packed, ElementType::F32).unwrap();
        let lanes: Vec<f32> = encoded
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        // [(0,0), (0,1), (1,0), (1,1)]
        assert_eq!(lanes, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn padded_pitch_is_stripped() {
        let data = ramp(6);
        let tight = encode_texels(&data, 2, 3, TexelLayout::Unpacked, ElementType::F32).unwrap();
        let unpadded = unpadded_bytes_per_row(3, TexelLayout::Unpacked, ElementType::F32);
        let pitch = padded_bytes_per_row(unpadded);
        assert_eq!(pitch % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize, 0);
        let mut padded = vec![0u8; pitch * 2];
        for r in 0..2 {
            padded[r * pitch..r * pitch + unpadded]
                .copy_from_slice(&tight[r * unpadded..(r + 1) * unpadded]);
        }
        let decoded =
            decode_texels(&padded, 2, 3, TexelLayout::Unpacked, ElementType::F32, pitch).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn f16_roundtrip_preserves_representable_values() {
        let data = vec![0.5, -2.0, 1024.0, 0.0];
        let encoded = encode_texels(&data, 2, 2, TexelLayout::Unpacked, ElementType::F16).unwrap();
        let decoded =
            decode_texels(&encoded, 2, 2, TexelLayout::Unpacked, ElementType::F16, 8).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn u8_encode_clamps_to_unorm_range() {
        let data = vec![-0.5, 0.0, 0.5, 2.0];
        let encoded = encode_texels(&data, 2, 2, TexelLayout::Unpacked, ElementType::U8).unwrap();
        assert_eq!(encoded, vec![0, 0, 128, 255]);
        let decoded =
            decode_texels(&encoded, 2, 2, TexelLayout::Unpacked, ElementType::U8, 4).unwrap();
        assert!((decoded[2] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(decoded[3], 1.0);
    }

    #[test]
    fn encode_rejects_length_mismatch() {
        let err = encode_texels(&[1.0, 2.0], 2, 2, TexelLayout::Unpacked, ElementType::F32)
            .unwrap_err();
        assert!(matches!(err, TexelError::Format { .. }));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err =
            decode_texels(&[0u8; 8], 2, 2, TexelLayout::Unpacked, ElementType::F32, 8).unwrap_err();
        assert!(matches!(err, TexelError::Internal { .. }));
    }
}
