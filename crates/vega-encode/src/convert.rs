//! I420 to engine surface layout conversion.

use vega_core::types::{PixelFormat, RawFrame, Surface};

/// Copy an I420 frame into a surface's native pixel layout. The surface is
/// at least as large as the frame (aligned dimensions); padding rows and
/// columns are left untouched.
pub fn i420_to_surface(frame: &RawFrame, surface: &mut Surface) {
    match surface.format {
        PixelFormat::Nv12 => i420_to_nv12(frame, surface),
        PixelFormat::P010 => i420_to_p010(frame, surface),
    }
}

fn i420_to_nv12(frame: &RawFrame, surface: &mut Surface) {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let pitch = surface.pitch;

    for row in 0..h {
        let src = &frame.y[row * frame.stride_y..row * frame.stride_y + w];
        surface.y[row * pitch..row * pitch + w].copy_from_slice(src);
    }

    let cw = w / 2;
    for row in 0..h / 2 {
        let u = &frame.u[row * frame.stride_u..];
        let v = &frame.v[row * frame.stride_v..];
        let dst = &mut surface.uv[row * pitch..];
        for col in 0..cw {
            dst[col * 2] = u[col];
            dst[col * 2 + 1] = v[col];
        }
    }
}

/// 8-bit source samples are widened to 10 bits in the upper range of the
/// 16-bit container, little-endian.
fn i420_to_p010(frame: &RawFrame, surface: &mut Surface) {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let pitch = surface.pitch;

    let widen = |s: u8| -> [u8; 2] { ((s as u16) << 8).to_le_bytes() };

    for row in 0..h {
        let src = &frame.y[row * frame.stride_y..];
        let dst = &mut surface.y[row * pitch..];
        for col in 0..w {
            dst[col * 2..col * 2 + 2].copy_from_slice(&widen(src[col]));
        }
    }

    let cw = w / 2;
    for row in 0..h / 2 {
        let u = &frame.u[row * frame.stride_u..];
        let v = &frame.v[row * frame.stride_v..];
        let dst = &mut surface.uv[row * pitch..];
        for col in 0..cw {
            dst[col * 4..col * 4 + 2].copy_from_slice(&widen(u[col]));
            dst[col * 4 + 2..col * 4 + 4].copy_from_slice(&widen(v[col]));
        }
    }
}
