//! Pixel-format conversion registry.
//!
//! Converters are listed in a static table, most specialised first. A
//! lookup returns the first entry matching the formats whose CPU
//! requirements are met by the running machine.

use std::fmt;
use std::sync::OnceLock;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

bitflags! {
    /// CPU vector extensions a converter may require.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SimdCaps: u32 {
        const SSE2 = 1 << 0;
        const SSSE3 = 1 << 1;
        const SSE41 = 1 << 2;
        const SSE42 = 1 << 3;
        const AVX = 1 << 4;
        const AVX2 = 1 << 5;
        const NEON = 1 << 6;
    }
}

impl fmt::Display for SimdCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("scalar");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join(" "))
    }
}

/// Extensions available on this CPU, probed once.
pub fn available_simd() -> SimdCaps {
    static CAPS: OnceLock<SimdCaps> = OnceLock::new();
    *CAPS.get_or_init(probe_simd)
}

#[cfg(target_arch = "x86_64")]
fn probe_simd() -> SimdCaps {
    let mut caps = SimdCaps::empty();
    if is_x86_feature_detected!("sse2") {
        caps |= SimdCaps::SSE2;
    }
    if is_x86_feature_detected!("ssse3") {
        caps |= SimdCaps::SSSE3;
    }
    if is_x86_feature_detected!("sse4.1") {
        caps |= SimdCaps::SSE41;
    }
    if is_x86_feature_detected!("sse4.2") {
        caps |= SimdCaps::SSE42;
    }
    if is_x86_feature_detected!("avx") {
        caps |= SimdCaps::AVX;
    }
    if is_x86_feature_detected!("avx2") {
        caps |= SimdCaps::AVX2;
    }
    caps
}

#[cfg(target_arch = "aarch64")]
fn probe_simd() -> SimdCaps {
    SimdCaps::NEON
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn probe_simd() -> SimdCaps {
    SimdCaps::empty()
}

/// Pixel layouts handled by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    /// 8-bit 4:2:0, Y plane + interleaved UV plane.
    Nv12,
    /// 8-bit 4:2:0, Y, U and V planes.
    Yv12,
    /// 16-bit 4:2:0, Y plane + interleaved UV plane.
    P010,
    /// 8-bit 4:4:4 planar.
    Yuv444,
}

impl ColorSpace {
    /// Number of planes.
    pub fn planes(self) -> usize {
        match self {
            Self::Nv12 | Self::P010 => 2,
            Self::Yv12 | Self::Yuv444 => 3,
        }
    }
}

/// Borrowed source plane.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    /// Bytes per row.
    pub pitch: usize,
}

/// Borrowed destination plane.
#[derive(Debug)]
pub struct PlaneMut<'a> {
    pub data: &'a mut [u8],
    /// Bytes per row.
    pub pitch: usize,
}

/// Conversion kernel: `(dst, src, width, height)` in luma pixels.
pub type ConvertFn = fn(&mut [PlaneMut<'_>], &[Plane<'_>], usize, usize) -> Result<()>;

/// One registry entry.
#[derive(Clone, Copy)]
pub struct ConvertEntry {
    pub from: ColorSpace,
    pub to: ColorSpace,
    /// Only chroma planes are written.
    pub uv_only: bool,
    /// Extensions the kernel needs.
    pub requires: SimdCaps,
    pub func: ConvertFn,
    /// Kernel name for logs.
    pub name: &'static str,
}

impl fmt::Debug for ConvertEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvertEntry")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("uv_only", &self.uv_only)
            .field("requires", &self.requires)
            .field("name", &self.name)
            .finish()
    }
}

static CONVERTERS: &[ConvertEntry] = &[
    ConvertEntry {
        from: ColorSpace::Nv12,
        to: ColorSpace::Yv12,
        uv_only: false,
        requires: SimdCaps::empty(),
        func: nv12_to_yv12,
        name: "nv12_yv12",
    },
    ConvertEntry {
        from: ColorSpace::Nv12,
        to: ColorSpace::Yv12,
        uv_only: true,
        requires: SimdCaps::empty(),
        func: nv12_to_yv12_uv,
        name: "nv12_yv12_uv",
    },
    ConvertEntry {
        from: ColorSpace::Yv12,
        to: ColorSpace::Nv12,
        uv_only: false,
        requires: SimdCaps::empty(),
        func: yv12_to_nv12,
        name: "yv12_nv12",
    },
    ConvertEntry {
        from: ColorSpace::Yv12,
        to: ColorSpace::Nv12,
        uv_only: true,
        requires: SimdCaps::empty(),
        func: yv12_to_nv12_uv,
        name: "yv12_nv12_uv",
    },
];

/// All registered converters, most specialised first.
pub fn converters() -> &'static [ConvertEntry] {
    CONVERTERS
}

/// First converter for `from -> to` runnable on this CPU.
pub fn find_converter(from: ColorSpace, to: ColorSpace, uv_only: bool) -> Option<&'static ConvertEntry> {
    find_in(CONVERTERS, from, to, uv_only, available_simd())
}

/// First entry of `table` matching the formats whose requirements `caps` covers.
pub fn find_in(
    table: &[ConvertEntry],
    from: ColorSpace,
    to: ColorSpace,
    uv_only: bool,
    caps: SimdCaps,
) -> Option<&ConvertEntry> {
    table
        .iter()
        .find(|e| e.from == from && e.to == to && e.uv_only == uv_only && caps.contains(e.requires))
}

fn check_planes(dst: &[PlaneMut<'_>], src: &[Plane<'_>], from: ColorSpace, to: ColorSpace) -> Result<()> {
    if src.len() < from.planes() || dst.len() < to.planes() {
        return Err(Error::invalid_input(format!(
            "{from:?} -> {to:?} needs {} source and {} destination planes, got {} and {}",
            from.planes(),
            to.planes(),
            src.len(),
            dst.len()
        )));
    }
    Ok(())
}

fn check_size(len: usize, pitch: usize, row_bytes: usize, rows: usize) -> Result<()> {
    if rows == 0 {
        return Ok(());
    }
    if pitch < row_bytes || len < pitch * (rows - 1) + row_bytes {
        return Err(Error::invalid_input(format!(
            "plane of {len} bytes (pitch {pitch}) too small for {rows} rows of {row_bytes} bytes"
        )));
    }
    Ok(())
}

fn copy_plane(dst: &mut PlaneMut<'_>, src: &Plane<'_>, row_bytes: usize, rows: usize) -> Result<()> {
    check_size(src.data.len(), src.pitch, row_bytes, rows)?;
    check_size(dst.data.len(), dst.pitch, row_bytes, rows)?;
    for y in 0..rows {
        let s = &src.data[y * src.pitch..y * src.pitch + row_bytes];
        dst.data[y * dst.pitch..y * dst.pitch + row_bytes].copy_from_slice(s);
    }
    Ok(())
}

fn split_uv(dst: &mut [PlaneMut<'_>], src: &Plane<'_>, width: usize, height: usize) -> Result<()> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    check_size(src.data.len(), src.pitch, cw * 2, ch)?;
    let [_, u, v, ..] = dst else {
        return Err(Error::invalid_input("missing chroma planes"));
    };
    check_size(u.data.len(), u.pitch, cw, ch)?;
    check_size(v.data.len(), v.pitch, cw, ch)?;
    for y in 0..ch {
        let row = &src.data[y * src.pitch..y * src.pitch + cw * 2];
        let u_row = &mut u.data[y * u.pitch..y * u.pitch + cw];
        let v_row = &mut v.data[y * v.pitch..y * v.pitch + cw];
        for (x, pair) in row.chunks_exact(2).enumerate() {
            u_row[x] = pair[0];
            v_row[x] = pair[1];
        }
    }
    Ok(())
}

fn merge_uv(dst: &mut PlaneMut<'_>, u: &Plane<'_>, v: &Plane<'_>, width: usize, height: usize) -> Result<()> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    check_size(u.data.len(), u.pitch, cw, ch)?;
    check_size(v.data.len(), v.pitch, cw, ch)?;
    check_size(dst.data.len(), dst.pitch, cw * 2, ch)?;
    for y in 0..ch {
        let u_row = &u.data[y * u.pitch..y * u.pitch + cw];
        let v_row = &v.data[y * v.pitch..y * v.pitch + cw];
        let out = &mut dst.data[y * dst.pitch..y * dst.pitch + cw * 2];
        for (x, pair) in out.chunks_exact_mut(2).enumerate() {
            pair[0] = u_row[x];
            pair[1] = v_row[x];
        }
    }
    Ok(())
}

fn nv12_to_yv12(dst: &mut [PlaneMut<'_>], src: &[Plane<'_>], width: usize, height: usize) -> Result<()> {
    check_planes(dst, src, ColorSpace::Nv12, ColorSpace::Yv12)?;
    copy_plane(&mut dst[0], &src[0], width, height)?;
    split_uv(dst, &src[1], width, height)
}

fn nv12_to_yv12_uv(dst: &mut [PlaneMut<'_>], src: &[Plane<'_>], width: usize, height: usize) -> Result<()> {
    check_planes(dst, src, ColorSpace::Nv12, ColorSpace::Yv12)?;
    split_uv(dst, &src[1], width, height)
}

fn yv12_to_nv12(dst: &mut [PlaneMut<'_>], src: &[Plane<'_>], width: usize, height: usize) -> Result<()> {
    check_planes(dst, src, ColorSpace::Yv12, ColorSpace::Nv12)?;
    copy_plane(&mut dst[0], &src[0], width, height)?;
    merge_uv(&mut dst[1], &src[1], &src[2], width, height)
}

fn yv12_to_nv12_uv(dst: &mut [PlaneMut<'_>], src: &[Plane<'_>], width: usize, height: usize) -> Result<()> {
    check_planes(dst, src, ColorSpace::Yv12, ColorSpace::Nv12)?;
    merge_uv(&mut dst[1], &src[1], &src[2], width, height)
}
