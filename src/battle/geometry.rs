//! Narrow phase collision: separating-axis test between convex polygons
//!
//! All math is `f32` and order-dependent; callers on every peer must visit
//! polygons and points in the same order to stay bit-identical.

use std::ops::Deref;

use serde::{Deserialize, Serialize};

use super::collision::{Collision, ColliderData, ColliderId, CollisionSpace};
use super::downsync::{CharacterState, PlayerDownsync};

/// 2D point or direction in collision space
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    pub x: f32,
    pub y: f32,
}

impl Vector {
    pub const ZERO: Vector = Vector { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Convex polygon stored as points relative to an anchor.
///
/// Only the anchor ever moves, the point list is written once.
#[derive(Debug, Clone)]
pub struct ConvexPolygon {
    points: Vec<Vector>,
    pub x: f32,
    pub y: f32,
}

impl ConvexPolygon {
    pub fn new(x: f32, y: f32, points: Vec<Vector>) -> Self {
        Self { points, x, y }
    }

    /// Axis-aligned rectangle anchored at its bottom-left corner, wound counter-clockwise
    pub fn rectangle(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self::new(
            x,
            y,
            vec![
                Vector::new(0.0, 0.0),
                Vector::new(w, 0.0),
                Vector::new(w, h),
                Vector::new(0.0, h),
            ],
        )
    }

    pub fn set_position(&mut self, x: f32, y: f32) {
        self.x = x;
        self.y = y;
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Point relative to the anchor
    pub fn get_point_by_offset(&self, offset: usize) -> Option<Vector> {
        self.points.get(offset).copied()
    }

    /// Absolute axis-aligned bounds as `(min_x, min_y, max_x, max_y)`
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        let mut min_x = f32::MAX;
        let mut min_y = f32::MAX;
        let mut max_x = -f32::MAX;
        let mut max_y = -f32::MAX;
        for p in &self.points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        (self.x + min_x, self.y + min_y, self.x + max_x, self.y + max_y)
    }

    fn point(&self, offset: usize, which: &'static str) -> Result<Vector, GeometryError> {
        self.get_point_by_offset(offset)
            .ok_or(GeometryError::MissingPoint {
                polygon: which,
                offset,
            })
    }
}

/// Scratch result of one polygon pair test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SatResult {
    pub overlap_mag: f32,
    /// Unit axis pointing from `a` into `b`
    pub overlap_x: f32,
    pub overlap_y: f32,
    pub a_contained_in_b: bool,
    pub b_contained_in_a: bool,
    /// Last axis tested
    pub axis_x: f32,
    pub axis_y: f32,
}

impl Default for SatResult {
    fn default() -> Self {
        Self {
            overlap_mag: 0.0,
            overlap_x: 0.0,
            overlap_y: 0.0,
            a_contained_in_b: true,
            b_contained_in_a: true,
            axis_x: 0.0,
            axis_y: 0.0,
        }
    }
}

impl SatResult {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("polygon {polygon} has no point at offset {offset}")]
    MissingPoint { polygon: &'static str, offset: usize },

    #[error("collider {0:?} is not part of the collision space")]
    UnknownCollider(ColliderId),
}

/// Fast inverse square root on `f32` bits, one Newton iteration
pub fn inv_sqrt32(x: f32) -> f32 {
    let xhalf = 0.5f32 * x;
    let i = 0x5f37_59df_i32.wrapping_sub((x.to_bits() as i32) >> 1);
    let y = f32::from_bits(i as u32);
    y * (1.5f32 - xhalf * y * y)
}

/// Fast inverse square root on `f64` bits, one Newton iteration
pub fn inv_sqrt64(x: f64) -> f64 {
    let xhalf = 0.5f64 * x;
    let i = 0x5fe6_eb50_c7b5_37a9_i64.wrapping_sub((x.to_bits() as i64) >> 1);
    let y = f64::from_bits(i as u64);
    y * (1.5f64 - xhalf * y * y)
}

/// Resets `result` and tests `a` against `b`, returning the push-back on overlap
pub fn overlaps(
    a: &ConvexPolygon,
    b: &ConvexPolygon,
    result: &mut SatResult,
) -> Result<Option<Vector>, GeometryError> {
    result.reset();
    if is_polygon_pair_overlapped(a, b, result)? {
        Ok(Some(Vector::new(
            result.overlap_mag * result.overlap_x,
            result.overlap_mag * result.overlap_y,
        )))
    } else {
        Ok(None)
    }
}

/// Separating-axis test over the edge normals of both polygons.
///
/// `result` must be reset by the caller; it accumulates the minimum overlap axis.
pub fn is_polygon_pair_overlapped(
    a: &ConvexPolygon,
    b: &ConvexPolygon,
    result: &mut SatResult,
) -> Result<bool, GeometryError> {
    let a_cnt = a.point_count();
    let b_cnt = b.point_count();

    if a_cnt == 1 && b_cnt == 1 {
        result.overlap_mag = 0.0;
        let pa = a.point(0, "a")?;
        let pb = b.point(0, "b")?;
        return Ok(pa.x == pb.x && pa.y == pb.y);
    }

    if a_cnt > 1 {
        for i in 0..a_cnt {
            if let Some((nx, ny)) = edge_normal(a, i, "a")? {
                if is_polygon_pair_separated_by_dir(a, b, nx, ny, result)? {
                    return Ok(false);
                }
            }
        }
    }

    if b_cnt > 1 {
        for i in 0..b_cnt {
            if let Some((nx, ny)) = edge_normal(b, i, "b")? {
                if is_polygon_pair_separated_by_dir(a, b, nx, ny, result)? {
                    return Ok(false);
                }
            }
        }
    }

    Ok(true)
}

/// Unit normal of the edge starting at point `i`, `None` for a degenerate edge
fn edge_normal(
    polygon: &ConvexPolygon,
    i: usize,
    which: &'static str,
) -> Result<Option<(f32, f32)>, GeometryError> {
    let cnt = polygon.point_count();
    let u = polygon.point(i, which)?;
    let v = polygon.point(if i + 1 == cnt { 0 } else { i + 1 }, which)?;
    let dx = v.x - u.x;
    let dy = v.y - u.y;
    if dx == 0.0 && dy == 0.0 {
        return Ok(None);
    }
    let inv_len = inv_sqrt32(dx * dx + dy * dy);
    Ok(Some((-dy * inv_len, dx * inv_len)))
}

fn project(
    polygon: &ConvexPolygon,
    axis_x: f32,
    axis_y: f32,
    which: &'static str,
) -> Result<(f32, f32), GeometryError> {
    let mut start = f32::MAX;
    let mut end = -f32::MAX;
    for i in 0..polygon.point_count() {
        let p = polygon.point(i, which)?;
        let dot = (p.x + polygon.x) * axis_x + (p.y + polygon.y) * axis_y;
        if start > dot {
            start = dot;
        }
        if end < dot {
            end = dot;
        }
    }
    Ok((start, end))
}

fn is_polygon_pair_separated_by_dir(
    a: &ConvexPolygon,
    b: &ConvexPolygon,
    axis_x: f32,
    axis_y: f32,
    result: &mut SatResult,
) -> Result<bool, GeometryError> {
    let (a_start, a_end) = project(a, axis_x, axis_y, "a")?;
    let (b_start, b_end) = project(b, axis_x, axis_y, "b")?;

    if a_start > b_end || a_end < b_start {
        return Ok(true);
    }

    let overlap_projected = if a_start < b_start {
        result.a_contained_in_b = false;
        if a_end < b_end {
            result.b_contained_in_a = false;
            a_end - b_start
        } else {
            nested_overlap(a_start, a_end, b_start, b_end)
        }
    } else {
        result.b_contained_in_a = false;
        if a_end > b_end {
            result.a_contained_in_b = false;
            a_start - b_end
        } else {
            nested_overlap(a_start, a_end, b_start, b_end)
        }
    };

    let absolute_overlap = overlap_projected.abs();
    let first_axis = result.axis_x == 0.0 && result.axis_y == 0.0;
    if first_axis || result.overlap_mag > absolute_overlap {
        let sign = if overlap_projected < 0.0 { -1.0 } else { 1.0 };
        result.overlap_mag = absolute_overlap;
        result.overlap_x = axis_x * sign;
        result.overlap_y = axis_y * sign;
    }

    result.axis_x = axis_x;
    result.axis_y = axis_y;

    Ok(false)
}

/// One interval contains the other: push out through the nearer end
fn nested_overlap(a_start: f32, a_end: f32, b_start: f32, b_end: f32) -> f32 {
    let option1 = a_end - b_start;
    let option2 = b_end - a_start;
    if option1 < option2 {
        option1
    } else {
        -option2
    }
}

/// Polygon temporarily moved by a trial delta, restored when dropped
struct DisplacedPolygon<'a> {
    polygon: &'a mut ConvexPolygon,
    orig_x: f32,
    orig_y: f32,
}

impl<'a> DisplacedPolygon<'a> {
    fn new(polygon: &'a mut ConvexPolygon, dx: f32, dy: f32) -> Self {
        let (orig_x, orig_y) = (polygon.x, polygon.y);
        polygon.set_position(orig_x + dx, orig_y + dy);
        Self {
            polygon,
            orig_x,
            orig_y,
        }
    }
}

impl Deref for DisplacedPolygon<'_> {
    type Target = ConvexPolygon;

    fn deref(&self) -> &ConvexPolygon {
        self.polygon
    }
}

impl Drop for DisplacedPolygon<'_> {
    fn drop(&mut self) {
        self.polygon.set_position(self.orig_x, self.orig_y);
    }
}

/// Tests `a` displaced by `(dx, dy)` against `b`; `a` keeps its anchor afterwards.
///
/// Returns whether they overlap and the push-back `(x, y)`.
pub fn calc_pushbacks(
    dx: f32,
    dy: f32,
    a: &mut ConvexPolygon,
    b: &ConvexPolygon,
    result: &mut SatResult,
) -> Result<(bool, f32, f32), GeometryError> {
    let displaced = DisplacedPolygon::new(a, dx, dy);
    match overlaps(&displaced, b, result)? {
        Some(pushback) => Ok((true, pushback.x, pushback.y)),
        None => Ok((false, 0.0, 0.0)),
    }
}

/// Scalars shared by every hard push-back computation of a step
#[derive(Debug, Clone, Copy)]
pub struct PushbackParams {
    pub snap_into_platform_overlap: f32,
    pub virtual_grid_to_collision_space_ratio: f32,
}

/// Resolves the player collider against every overlapping barrier.
///
/// Accumulates `(mag - snap) * axis` into `eff_pushback` and records each axis
/// into `hard_pushback_norms`, returning how many were recorded.
#[allow(clippy::too_many_arguments)]
pub fn calc_hard_pushbacks_norms(
    curr_player: &PlayerDownsync,
    next_player: &PlayerDownsync,
    player_collider: ColliderId,
    space: &mut CollisionSpace,
    params: PushbackParams,
    eff_pushback: &mut Vector,
    hard_pushback_norms: &mut [Vector],
    collision: &mut Collision,
    result: &mut SatResult,
) -> Result<usize, GeometryError> {
    let mut virtual_grip_to_wall = 0.0f32;
    if curr_player.character_state == CharacterState::OnWall
        && next_player.vel_x == 0
        && curr_player.dir_x == next_player.dir_x
    {
        let xfac = if next_player.dir_x < 0 { -1.0 } else { 1.0 };
        virtual_grip_to_wall =
            xfac * curr_player.speed as f32 * params.virtual_grid_to_collision_space_ratio;
    }

    let mut ret_cnt = 0;
    if !space.check_all(player_collider, virtual_grip_to_wall, 0.0, collision) {
        return Ok(ret_cnt);
    }

    while let Some(other) = collision.pop_first_contacted_collider() {
        let (player, barrier) = space
            .pair_mut(player_collider, other)
            .ok_or(GeometryError::UnknownCollider(other))?;
        if barrier.data != ColliderData::Barrier {
            continue;
        }

        let (overlapped, _, _) = calc_pushbacks(0.0, 0.0, &mut player.shape, &barrier.shape, result)?;
        if !overlapped {
            continue;
        }

        // The overlap axis points into the platform
        let snapped = result.overlap_mag - params.snap_into_platform_overlap;
        eff_pushback.x += snapped * result.overlap_x;
        eff_pushback.y += snapped * result.overlap_y;

        if let Some(norm) = hard_pushback_norms.get_mut(ret_cnt) {
            norm.x = result.overlap_x;
            norm.y = result.overlap_y;
            ret_cnt += 1;
        }
    }

    Ok(ret_cnt)
}

/// Virtual grid position to collision-space collider center, lossless
pub fn virtual_grid_to_polygon_collider_ctr(vx: i32, vy: i32, ratio: f32) -> (f32, f32) {
    (vx as f32 * ratio, vy as f32 * ratio)
}

/// Collision-space collider center to virtual grid, rounding half to even
pub fn polygon_collider_ctr_to_virtual_grid_pos(wx: f32, wy: f32, inv_ratio: f32) -> (i32, i32) {
    (
        (wx * inv_ratio).round_ties_even() as i32,
        (wy * inv_ratio).round_ties_even() as i32,
    )
}

pub fn polygon_collider_ctr_to_bl(wx: f32, wy: f32, half_w: f32, half_h: f32) -> (f32, f32) {
    (wx - half_w, wy - half_h)
}

pub fn polygon_collider_bl_to_ctr(cx: f32, cy: f32, half_w: f32, half_h: f32) -> (f32, f32) {
    (cx + half_w, cy + half_h)
}
