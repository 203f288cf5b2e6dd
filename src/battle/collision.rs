//! Broad phase: uniform grid of cells indexing colliders by bounding box

use super::geometry::ConvexPolygon;

/// Stable index of a collider inside its `CollisionSpace`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColliderId(usize);

impl ColliderId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What a collider stands for in the battle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColliderData {
    Player { join_index: usize },
    Bullet {
        bullet_local_id: i32,
        offender_join_index: usize,
    },
    Barrier,
}

#[derive(Debug, Clone)]
pub struct Collider {
    pub shape: ConvexPolygon,
    pub w: f32,
    pub h: f32,
    pub data: ColliderData,
    touching_cells: Vec<usize>,
    attached: bool,
}

impl Collider {
    /// Rectangle collider anchored at its bottom-left corner
    pub fn rectangle(x: f32, y: f32, w: f32, h: f32, data: ColliderData) -> Self {
        Self {
            shape: ConvexPolygon::rectangle(x, y, w, h),
            w,
            h,
            data,
            touching_cells: Vec::with_capacity(4),
            attached: false,
        }
    }

    pub fn x(&self) -> f32 {
        self.shape.x
    }

    pub fn y(&self) -> f32 {
        self.shape.y
    }

    pub fn touching_cells(&self) -> &[usize] {
        &self.touching_cells
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

/// Grid bucket
#[derive(Debug, Clone)]
pub struct CollisionCell {
    pub x: i32,
    pub y: i32,
    occupants: Vec<ColliderId>,
}

impl CollisionCell {
    fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            occupants: Vec::with_capacity(8),
        }
    }

    fn register(&mut self, id: ColliderId) {
        if !self.occupants.contains(&id) {
            self.occupants.push(id);
        }
    }

    fn unregister(&mut self, id: ColliderId) {
        self.occupants.retain(|o| *o != id);
    }

    pub fn occupants(&self) -> &[ColliderId] {
        &self.occupants
    }

    pub fn contains(&self, id: ColliderId) -> bool {
        self.occupants.contains(&id)
    }
}

/// Reusable holder for broad phase query results
#[derive(Debug, Default)]
pub struct Collision {
    contacts: Vec<ColliderId>,
    cursor: usize,
}

impl Collision {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            contacts: Vec::with_capacity(capacity),
            cursor: 0,
        }
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
        self.cursor = 0;
    }

    pub fn pop_first_contacted_collider(&mut self) -> Option<ColliderId> {
        let id = self.contacts.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(id)
    }

    /// Contacts not yet popped
    pub fn remaining(&self) -> &[ColliderId] {
        &self.contacts[self.cursor.min(self.contacts.len())..]
    }

    pub fn is_empty(&self) -> bool {
        self.remaining().is_empty()
    }

    /// Sorted and deduplicated so the visiting order never depends on insertion history
    fn finish(&mut self) -> bool {
        self.contacts.sort_unstable();
        self.contacts.dedup();
        !self.contacts.is_empty()
    }
}

pub struct CollisionSpace {
    cell_width: i32,
    cell_height: i32,
    cells_x: i32,
    cells_y: i32,
    cells: Vec<CollisionCell>,
    colliders: Vec<Collider>,
}

impl CollisionSpace {
    pub fn new(space_w: i32, space_h: i32, cell_w: i32, cell_h: i32) -> Self {
        let cell_w = cell_w.max(1);
        let cell_h = cell_h.max(1);
        let cells_x = ((space_w + cell_w - 1) / cell_w).max(1);
        let cells_y = ((space_h + cell_h - 1) / cell_h).max(1);

        let mut cells = Vec::with_capacity((cells_x * cells_y) as usize);
        for y in 0..cells_y {
            for x in 0..cells_x {
                cells.push(CollisionCell::new(x, y));
            }
        }

        Self {
            cell_width: cell_w,
            cell_height: cell_h,
            cells_x,
            cells_y,
            cells,
            colliders: Vec::new(),
        }
    }

    pub fn world_to_space(&self, x: f32, y: f32) -> (i32, i32) {
        (
            (x / self.cell_width as f32).floor() as i32,
            (y / self.cell_height as f32).floor() as i32,
        )
    }

    pub fn space_to_world(&self, x: i32, y: i32) -> (f32, f32) {
        (
            (x * self.cell_width) as f32,
            (y * self.cell_height) as f32,
        )
    }

    pub fn width(&self) -> i32 {
        self.cells_x
    }

    pub fn height(&self) -> i32 {
        self.cells_y
    }

    fn cell_index(&self, x: i32, y: i32) -> Option<usize> {
        if x >= 0 && x < self.cells_x && y >= 0 && y < self.cells_y {
            Some((y * self.cells_x + x) as usize)
        } else {
            None
        }
    }

    pub fn get_cell(&self, x: i32, y: i32) -> Option<&CollisionCell> {
        self.cell_index(x, y).map(|i| &self.cells[i])
    }

    /// Takes ownership of a detached collider and hands back its id
    pub fn insert(&mut self, collider: Collider) -> ColliderId {
        let id = ColliderId(self.colliders.len());
        self.colliders.push(collider);
        id
    }

    pub fn collider(&self, id: ColliderId) -> Option<&Collider> {
        self.colliders.get(id.0)
    }

    pub fn collider_mut(&mut self, id: ColliderId) -> Option<&mut Collider> {
        self.colliders.get_mut(id.0)
    }

    /// Mutable access to `a` alongside shared access to a different `b`
    pub fn pair_mut(&mut self, a: ColliderId, b: ColliderId) -> Option<(&mut Collider, &Collider)> {
        if a.0 == b.0 || a.0 >= self.colliders.len() || b.0 >= self.colliders.len() {
            return None;
        }
        if a.0 < b.0 {
            let (lo, hi) = self.colliders.split_at_mut(b.0);
            Some((&mut lo[a.0], &hi[0]))
        } else {
            let (lo, hi) = self.colliders.split_at_mut(a.0);
            Some((&mut hi[0], &lo[b.0]))
        }
    }

    pub fn add_single(&mut self, id: ColliderId) {
        if let Some(collider) = self.colliders.get_mut(id.0) {
            collider.attached = true;
        }
        self.update(id);
    }

    pub fn remove_single(&mut self, id: ColliderId) {
        let Some(collider) = self.colliders.get_mut(id.0) else {
            return;
        };
        while let Some(cell) = collider.touching_cells.pop() {
            self.cells[cell].unregister(id);
        }
        collider.attached = false;
    }

    /// Re-registers an attached collider in every cell its bounding box touches
    pub fn update(&mut self, id: ColliderId) {
        let Some(collider) = self.colliders.get(id.0) else {
            return;
        };
        if !collider.attached {
            return;
        }
        let (cx, cy, ex, ey) = self.cell_range(collider, 0.0, 0.0);

        let collider = &mut self.colliders[id.0];
        while let Some(cell) = collider.touching_cells.pop() {
            self.cells[cell].unregister(id);
        }
        for y in cy..=ey {
            for x in cx..=ex {
                if x >= 0 && x < self.cells_x && y >= 0 && y < self.cells_y {
                    let cell = (y * self.cells_x + x) as usize;
                    self.cells[cell].register(id);
                    collider.touching_cells.push(cell);
                }
            }
        }
    }

    pub fn set_position(&mut self, id: ColliderId, x: f32, y: f32) {
        if let Some(collider) = self.colliders.get_mut(id.0) {
            collider.shape.set_position(x, y);
            if collider.attached {
                self.update(id);
            }
        }
    }

    /// Cells `(cx, cy, ex, ey)` spanned by the collider's bounding box shifted by `(dx, dy)`
    fn cell_range(&self, collider: &Collider, dx: f32, dy: f32) -> (i32, i32, i32, i32) {
        let x = collider.shape.x + dx;
        let y = collider.shape.y + dy;
        let (cx, cy) = self.world_to_space(x, y);
        let (ex, ey) = self.world_to_space(x + collider.w - 1.0, y + collider.h - 1.0);
        (cx, cy, ex.max(cx), ey.max(cy))
    }

    /// Collects every other collider sharing a cell with `id` shifted by `(dx, dy)`
    pub fn check_all(&self, id: ColliderId, dx: f32, dy: f32, collision: &mut Collision) -> bool {
        collision.clear();
        let Some(collider) = self.colliders.get(id.0) else {
            return false;
        };
        let (cx, cy, ex, ey) = self.cell_range(collider, dx, dy);
        for y in cy..=ey {
            for x in cx..=ex {
                if let Some(cell) = self.get_cell(x, y) {
                    collision
                        .contacts
                        .extend(cell.occupants.iter().copied().filter(|o| *o != id));
                }
            }
        }
        collision.finish()
    }

    /// Colliders registered in the cell containing the point
    pub fn query_point(&self, x: f32, y: f32, collision: &mut Collision) -> bool {
        collision.clear();
        let (sx, sy) = self.world_to_space(x, y);
        if let Some(cell) = self.get_cell(sx, sy) {
            collision.contacts.extend_from_slice(&cell.occupants);
        }
        collision.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> CollisionSpace {
        CollisionSpace::new(100, 100, 10, 10)
    }

    #[test]
    fn test_world_to_space_floors() {
        let space = space();
        assert_eq!(space.world_to_space(15.0, 9.9), (1, 0));
        assert_eq!(space.world_to_space(-0.5, 0.0), (-1, 0));
        assert_eq!(space.space_to_world(2, 3), (20.0, 30.0));
        assert!(space.get_cell(-1, 0).is_none());
        assert!(space.get_cell(10, 0).is_none());
        assert!(space.get_cell(9, 9).is_some());
    }

    #[test]
    fn test_multi_cell_membership_and_removal() {
        let mut space = space();
        let id = space.insert(Collider::rectangle(5.0, 5.0, 10.0, 10.0, ColliderData::Barrier));
        space.add_single(id);

        let collider = space.collider(id).unwrap();
        assert_eq!(collider.touching_cells().len(), 4);
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            assert!(space.get_cell(x, y).unwrap().contains(id));
        }

        space.remove_single(id);
        let collider = space.collider(id).unwrap();
        assert!(collider.touching_cells().is_empty());
        assert!(!collider.is_attached());
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            assert!(!space.get_cell(x, y).unwrap().contains(id));
        }
    }

    #[test]
    fn test_check_all_deduplicates_and_skips_self() {
        let mut space = space();
        let player = space.insert(Collider::rectangle(
            5.0,
            5.0,
            10.0,
            10.0,
            ColliderData::Player { join_index: 1 },
        ));
        let wall = space.insert(Collider::rectangle(0.0, 0.0, 20.0, 20.0, ColliderData::Barrier));
        let far = space.insert(Collider::rectangle(80.0, 80.0, 5.0, 5.0, ColliderData::Barrier));
        for id in [player, wall, far] {
            space.add_single(id);
        }

        let mut collision = Collision::with_capacity(8);
        assert!(space.check_all(player, 0.0, 0.0, &mut collision));
        assert_eq!(collision.remaining(), &[wall]);
        assert_eq!(collision.pop_first_contacted_collider(), Some(wall));
        assert_eq!(collision.pop_first_contacted_collider(), None);

        assert!(space.check_all(player, 75.0, 75.0, &mut collision));
        assert_eq!(collision.remaining(), &[far]);
    }

    #[test]
    fn test_set_position_moves_membership() {
        let mut space = space();
        let id = space.insert(Collider::rectangle(0.0, 0.0, 5.0, 5.0, ColliderData::Barrier));
        space.add_single(id);
        assert!(space.get_cell(0, 0).unwrap().contains(id));

        space.set_position(id, 52.0, 52.0);
        assert!(!space.get_cell(0, 0).unwrap().contains(id));
        assert!(space.get_cell(5, 5).unwrap().contains(id));

        let mut collision = Collision::with_capacity(4);
        assert!(space.query_point(55.0, 55.0, &mut collision));
        assert!(!space.query_point(5.0, 5.0, &mut collision));
    }

    #[test]
    fn test_query_point_returns_exactly_the_cell_occupants() {
        let mut space = space();
        let a = space.insert(Collider::rectangle(1.0, 1.0, 3.0, 3.0, ColliderData::Barrier));
        let neighbour = space.insert(Collider::rectangle(12.0, 1.0, 3.0, 3.0, ColliderData::Barrier));
        let b = space.insert(Collider::rectangle(4.0, 4.0, 3.0, 3.0, ColliderData::Barrier));
        let straddling = space.insert(Collider::rectangle(8.0, 2.0, 4.0, 3.0, ColliderData::Barrier));
        for id in [straddling, b, neighbour, a] {
            space.add_single(id);
        }

        let mut collision = Collision::with_capacity(8);
        assert!(space.query_point(5.0, 5.0, &mut collision));
        assert_eq!(collision.remaining(), &[a, b, straddling]);

        assert!(space.query_point(13.0, 2.0, &mut collision));
        assert_eq!(collision.remaining(), &[neighbour, straddling]);

        assert!(!space.query_point(55.0, 55.0, &mut collision));
        assert!(collision.remaining().is_empty());
    }

    #[test]
    fn test_detached_collider_ignores_set_position() {
        let mut space = space();
        let id = space.insert(Collider::rectangle(0.0, 0.0, 5.0, 5.0, ColliderData::Barrier));
        space.set_position(id, 30.0, 30.0);
        assert!(space.collider(id).unwrap().touching_cells().is_empty());
        assert!(!space.get_cell(3, 3).unwrap().contains(id));
    }

    #[test]
    fn test_pair_mut_rejects_same_id() {
        let mut space = space();
        let a = space.insert(Collider::rectangle(0.0, 0.0, 5.0, 5.0, ColliderData::Barrier));
        let b = space.insert(Collider::rectangle(0.0, 0.0, 5.0, 5.0, ColliderData::Barrier));
        assert!(space.pair_mut(a, a).is_none());
        let (ma, rb) = space.pair_mut(b, a).unwrap();
        ma.shape.set_position(1.0, 1.0);
        assert_eq!(rb.x(), 0.0);
        assert_eq!(space.collider(b).unwrap().x(), 1.0);
    }
}
