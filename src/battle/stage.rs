//! Static stage geometry

/// Barriers and spawn points of a stage, in collision-space units
#[derive(Debug, Clone)]
pub struct StageLayout {
    pub name: &'static str,
    pub space_width: i32,
    pub space_height: i32,
    /// `(x, y, w, h)` rectangles anchored at their bottom-left corner
    pub barriers: Vec<(f32, f32, f32, f32)>,
    /// Collider centers, one per seat, wrapping around when seats outnumber them
    pub spawn_points: Vec<(f32, f32)>,
}

impl StageLayout {
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "arena" => Some(Self::arena()),
            _ => None,
        }
    }

    /// Walled floor with one floating platform in the middle
    pub fn arena() -> Self {
        Self {
            name: "arena",
            space_width: 1024,
            space_height: 512,
            barriers: vec![
                (0.0, 0.0, 1024.0, 32.0),
                (0.0, 32.0, 32.0, 480.0),
                (992.0, 32.0, 32.0, 480.0),
                (384.0, 160.0, 256.0, 16.0),
            ],
            spawn_points: vec![(160.0, 64.0), (864.0, 64.0), (320.0, 64.0), (704.0, 64.0)],
        }
    }

    pub fn spawn_point(&self, join_index: usize) -> (f32, f32) {
        if self.spawn_points.is_empty() {
            return (0.0, 0.0);
        }
        self.spawn_points[(join_index.saturating_sub(1)) % self.spawn_points.len()]
    }
}
