//! Packed sprite colors.
//!
//! Colors travel to the GPU as one `u32` with red in the lowest byte, which
//! reads back as `R8G8B8A8_UNORM` on little-endian hosts.

pub const WHITE: u32 = pack_rgba(255, 255, 255, 255);
pub const BLACK: u32 = pack_rgba(0, 0, 0, 255);
pub const TRANSPARENT: u32 = 0;

pub const fn pack_rgba(r: u8, g: u8, b: u8, a: u8) -> u32 {
    r as u32 | (g as u32) << 8 | (b as u32) << 16 | (a as u32) << 24
}

/// Opaque color.
pub const fn pack_rgb(r: u8, g: u8, b: u8) -> u32 {
    pack_rgba(r, g, b, 255)
}

/// Pack normalized channels, clamped to `[0, 1]`.
pub fn pack_rgba_f32(r: f32, g: f32, b: f32, a: f32) -> u32 {
    let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    pack_rgba(byte(r), byte(g), byte(b), byte(a))
}

/// Convert `0xRRGGBBAA` notation to the packed layout.
pub const fn from_rgba_hex(hex: u32) -> u32 {
    hex.swap_bytes()
}

/// Split a packed color into `[r, g, b, a]`.
pub const fn unpack_rgba(color: u32) -> [u8; 4] {
    color.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_red_is_low_byte() {
        assert_eq!(pack_rgba(0xff, 0, 0, 0), 0x0000_00ff);
        assert_eq!(pack_rgba(0x11, 0x22, 0x33, 0x44), 0x4433_2211);
    }

    #[test]
    fn test_hex_notation() {
        assert_eq!(from_rgba_hex(0x1122_3344), pack_rgba(0x11, 0x22, 0x33, 0x44));
        assert_eq!(from_rgba_hex(0xffff_ffff), WHITE);
    }

    #[test]
    fn test_float_channels_clamp() {
        assert_eq!(pack_rgba_f32(2.0, 0.0, -1.0, 1.0), pack_rgba(255, 0, 0, 255));
        assert_eq!(unpack_rgba(pack_rgb(1, 2, 3)), [1, 2, 3, 255]);
    }
}
