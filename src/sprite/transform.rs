//! Sprite transforms and the matrix stack.

/// Maximum number of saved transforms.
pub const MATRIX_STACK_DEPTH: usize = 1 << 10;

/// Translation, rotation and uniform scale of a sprite.
///
/// A local point `p` maps to `translation + R(rotation) * (scale * p)`: scale
/// first, then rotate about the local origin, then translate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform2D {
    pub translation: [f32; 2],
    /// Counter-clockwise in radians, y axis pointing down the screen.
    pub rotation: f32,
    pub scale: f32,
}

impl Default for Transform2D {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform2D {
    pub const IDENTITY: Self = Self {
        translation: [0.0, 0.0],
        rotation: 0.0,
        scale: 1.0,
    };

    /// Unpack `[tx, ty, rotation, scale]`, the [`super::DrawCommand`] layout.
    pub fn from_array(values: [f32; 4]) -> Self {
        Self {
            translation: [values[0], values[1]],
            rotation: values[2],
            scale: values[3],
        }
    }

    pub fn to_array(self) -> [f32; 4] {
        [
            self.translation[0],
            self.translation[1],
            self.rotation,
            self.scale,
        ]
    }

    pub fn apply(&self, point: [f32; 2]) -> [f32; 2] {
        let (sin, cos) = self.rotation.sin_cos();
        let x = point[0] * self.scale;
        let y = point[1] * self.scale;
        [
            self.translation[0] + x * cos - y * sin,
            self.translation[1] + x * sin + y * cos,
        ]
    }

    /// Map a transformed point back to local space. Requires a non-zero
    /// scale.
    pub fn inverse_apply(&self, point: [f32; 2]) -> [f32; 2] {
        let (sin, cos) = self.rotation.sin_cos();
        let x = point[0] - self.translation[0];
        let y = point[1] - self.translation[1];
        [
            (x * cos + y * sin) / self.scale,
            (-x * sin + y * cos) / self.scale,
        ]
    }
}

/// Current transform plus a bounded stack of saved ones.
///
/// Pushing onto a full stack and popping an empty one are ignored.
#[derive(Debug, Clone)]
pub struct MatrixStack {
    saved: Vec<Transform2D>,
    current: Transform2D,
}

impl Default for MatrixStack {
    fn default() -> Self {
        Self::new()
    }
}

impl MatrixStack {
    pub fn new() -> Self {
        Self {
            saved: Vec::new(),
            current: Transform2D::IDENTITY,
        }
    }

    pub fn current(&self) -> Transform2D {
        self.current
    }

    pub fn depth(&self) -> usize {
        self.saved.len()
    }

    pub fn push(&mut self) {
        if self.saved.len() < MATRIX_STACK_DEPTH {
            self.saved.push(self.current);
        } else {
            log::warn!("Matrix stack overflow, push ignored");
        }
    }

    pub fn pop(&mut self) {
        match self.saved.pop() {
            Some(transform) => self.current = transform,
            None => log::warn!("Matrix stack underflow, pop ignored"),
        }
    }

    /// Add to the translation.
    pub fn translate(&mut self, x: f32, y: f32) {
        self.current.translation[0] += x;
        self.current.translation[1] += y;
    }

    /// Add to the rotation.
    pub fn rotate(&mut self, radians: f32) {
        self.current.rotation += radians;
    }

    /// Replace the scale. Scales do not accumulate.
    pub fn scale(&mut self, scale: f32) {
        self.current.scale = scale;
    }

    pub fn load_identity(&mut self) {
        self.current = Transform2D::IDENTITY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn assert_close(a: [f32; 2], b: [f32; 2]) {
        assert!(
            (a[0] - b[0]).abs() < 1e-4 && (a[1] - b[1]).abs() < 1e-4,
            "{a:?} != {b:?}"
        );
    }

    #[test]
    fn test_scale_rotate_translate_order() {
        let transform = Transform2D {
            translation: [10.0, 20.0],
            rotation: FRAC_PI_2,
            scale: 2.0,
        };
        // (1, 0) -> scaled (2, 0) -> rotated (0, 2) -> translated (10, 22)
        assert_close(transform.apply([1.0, 0.0]), [10.0, 22.0]);
    }

    #[test]
    fn test_inverse_round_trip() {
        let transform = Transform2D {
            translation: [-3.5, 7.25],
            rotation: 0.7,
            scale: 0.5,
        };
        for point in [[0.0, 0.0], [12.0, -4.0], [-1.5, 3.0]] {
            assert_close(transform.inverse_apply(transform.apply(point)), point);
        }
    }

    #[test]
    fn test_stack_accumulates_and_restores() {
        let mut stack = MatrixStack::new();
        stack.translate(1.0, 2.0);
        stack.push();
        stack.translate(3.0, 4.0);
        stack.rotate(0.5);
        stack.rotate(0.25);
        stack.scale(2.0);
        stack.scale(3.0);
        assert_eq!(stack.current().translation, [4.0, 6.0]);
        assert_eq!(stack.current().rotation, 0.75);
        assert_eq!(stack.current().scale, 3.0);

        stack.pop();
        assert_eq!(stack.current().translation, [1.0, 2.0]);
        assert_eq!(stack.current().scale, 1.0);
    }

    #[test]
    fn test_stack_bounds_are_ignored() {
        let mut stack = MatrixStack::new();
        stack.translate(5.0, 5.0);
        stack.pop();
        assert_eq!(stack.current().translation, [5.0, 5.0]);

        for _ in 0..MATRIX_STACK_DEPTH + 3 {
            stack.push();
        }
        assert_eq!(stack.depth(), MATRIX_STACK_DEPTH);
    }
}
