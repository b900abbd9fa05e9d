//! Quad corners, bounding boxes and vertex expansion.
//!
//! These functions define what the cull and generate passes compute; the
//! GLSL shaders and the software kernels both follow them.

use super::{DrawCommand, SpriteVertex, SPRITE_VERTEX_COUNT};

/// Axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_array(values: [f32; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }

    pub fn min(&self) -> [f32; 2] {
        [self.x, self.y]
    }

    pub fn max(&self) -> [f32; 2] {
        [self.x + self.width, self.y + self.height]
    }
}

/// Texture coordinates of the four corners.
const CORNER_UVS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

/// Corner order of the two triangles.
const TRIANGLE_CORNERS: [usize; SPRITE_VERTEX_COUNT as usize] = [0, 1, 2, 0, 2, 3];

/// Transformed corners in order top-left, top-right, bottom-right,
/// bottom-left of the local rectangle.
pub fn quad_corners(command: &DrawCommand) -> [[f32; 2]; 4] {
    let transform = command.transform();
    let min = command.local_rect().min();
    let max = command.local_rect().max();
    [
        transform.apply([min[0], min[1]]),
        transform.apply([max[0], min[1]]),
        transform.apply([max[0], max[1]]),
        transform.apply([min[0], max[1]]),
    ]
}

/// Screen-space bounding box of the transformed quad.
pub fn bounding_box(command: &DrawCommand) -> Rect {
    let corners = quad_corners(command);
    let mut min = corners[0];
    let mut max = corners[0];
    for corner in &corners[1..] {
        min = [min[0].min(corner[0]), min[1].min(corner[1])];
        max = [max[0].max(corner[0]), max[1].max(corner[1])];
    }
    Rect::new(min[0], min[1], max[0] - min[0], max[1] - min[1])
}

/// Whether the transformed quad's bounding box overlaps
/// `[0, width] x [0, height]` with non-zero area.
pub fn overlaps_viewport(command: &DrawCommand, width: f32, height: f32) -> bool {
    let bounds = bounding_box(command);
    let max = bounds.max();
    bounds.x < width && max[0] > 0.0 && bounds.y < height && max[1] > 0.0
}

/// The six vertices of a visible sprite. `texture_base` is added to the
/// command's bind index to address the bound descriptor table.
pub fn quad_vertices(
    command: &DrawCommand,
    texture_base: u32,
) -> [SpriteVertex; SPRITE_VERTEX_COUNT as usize] {
    let corners = quad_corners(command);
    TRIANGLE_CORNERS.map(|corner| SpriteVertex {
        position: corners[corner],
        uv: CORNER_UVS[corner],
        color: command.color,
        texture_id: texture_base + command.texture_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sprite::Transform2D;
    use rstest::rstest;

    fn command(rect: [f32; 4], transform: Transform2D) -> DrawCommand {
        DrawCommand {
            rect,
            transform: transform.to_array(),
            color: 0xffff_ffff,
            texture_id: 0,
        }
    }

    fn translated(x: f32, y: f32) -> Transform2D {
        Transform2D {
            translation: [x, y],
            ..Transform2D::IDENTITY
        }
    }

    #[rstest]
    #[case::inside(translated(100.0, 100.0), true)]
    #[case::straddles_left(translated(-10.0, 50.0), true)]
    #[case::far_away(translated(10_000.0, 10_000.0), false)]
    #[case::touches_right_edge(translated(816.0, 50.0), false)]
    #[case::touches_top_edge(translated(50.0, -16.0), false)]
    #[case::just_inside_bottom(translated(50.0, 615.0), true)]
    fn test_viewport_overlap(#[case] transform: Transform2D, #[case] visible: bool) {
        let cmd = command([-16.0, -16.0, 32.0, 32.0], transform);
        assert_eq!(overlaps_viewport(&cmd, 800.0, 600.0), visible);
    }

    #[test]
    fn test_rotation_grows_bounding_box() {
        let cmd = command(
            [-1.0, -1.0, 2.0, 2.0],
            Transform2D {
                rotation: std::f32::consts::FRAC_PI_4,
                ..Transform2D::IDENTITY
            },
        );
        let bounds = bounding_box(&cmd);
        assert!((bounds.width - 2.0 * std::f32::consts::SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_vertices_cover_unit_uvs() {
        let mut cmd = command([0.0, 0.0, 4.0, 2.0], translated(1.0, 1.0));
        cmd.texture_id = 2;
        let vertices = quad_vertices(&cmd, 5);

        assert!(vertices.iter().all(|v| v.texture_id == 7));
        assert_eq!(vertices[0].position, [1.0, 1.0]);
        assert_eq!(vertices[2].position, [5.0, 3.0]);
        assert_eq!(vertices[2].uv, [1.0, 1.0]);
        assert_eq!(vertices[5].uv, [0.0, 1.0]);
        assert_eq!(vertices[0], vertices[3]);
        assert_eq!(vertices[2], vertices[4]);
    }
}
