// Model-space → frame-pixel coordinate mapping.
use crate::agent_engine::parser::COORD_MAX;
use crate::perception::types::FrameMeta;

/// Maps normalized `[0, 1000]` coordinates onto the most recently captured frame.
///
/// Captured frames can differ in size from the physical display, so the mapper
/// is re-primed with every new frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinateMapper {
    width: u32,
    height: u32,
}

impl CoordinateMapper {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn prime(&mut self, meta: &FrameMeta) {
        self.width = meta.width;
        self.height = meta.height;
    }

    pub fn to_pixel(&self, x: i32, y: i32) -> (i32, i32) {
        (scale(x, self.width), scale(y, self.height))
    }
}

fn scale(normalized: i32, dimension: u32) -> i32 {
    (normalized as f64 / COORD_MAX as f64 * dimension as f64).round() as i32
}
