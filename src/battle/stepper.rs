//! One deterministic simulation step from render frame F to F+1

use tracing::trace;

use crate::config::BattleConfig;

use super::collision::{Collider, ColliderData, ColliderId, Collision, CollisionSpace};
use super::downsync::{
    decode_input, Bullet, CharacterState, InputFrameDownsync, PlayerDownsync, RoomDownsyncFrame,
};
use super::geometry::{
    calc_hard_pushbacks_norms, overlaps, polygon_collider_bl_to_ctr, polygon_collider_ctr_to_bl,
    polygon_collider_ctr_to_virtual_grid_pos, virtual_grid_to_polygon_collider_ctr, GeometryError,
    PushbackParams, SatResult, Vector,
};
use super::stage::StageLayout;

pub const HARD_PUSHBACK_NORMS_CAPACITY: usize = 5;
const BULLET_DAMAGE: i32 = 10;
const INITIAL_HP: i32 = 100;

/// Scratch memory and dynamic collider handles reused by every step
pub struct StepContext {
    collision: Collision,
    sat: SatResult,
    eff_pushbacks: Vec<Vector>,
    hard_pushback_norms: Vec<[Vector; HARD_PUSHBACK_NORMS_CAPACITY]>,
    player_colliders: Vec<ColliderId>,
    bullet_colliders: Vec<ColliderId>,
}

impl StepContext {
    /// Registers one detached collider per seat and per bullet slot
    pub fn new(cfg: &BattleConfig, space: &mut CollisionSpace) -> Self {
        let player_colliders = (1..=cfg.room_capacity)
            .map(|join_index| {
                space.insert(Collider::rectangle(
                    0.0,
                    0.0,
                    cfg.player_collider_width,
                    cfg.player_collider_height,
                    ColliderData::Player { join_index },
                ))
            })
            .collect();
        let bullet_colliders = (0..cfg.bullet_capacity)
            .map(|_| {
                space.insert(Collider::rectangle(
                    0.0,
                    0.0,
                    cfg.bullet_hitbox_width,
                    cfg.bullet_hitbox_height,
                    ColliderData::Bullet {
                        bullet_local_id: -1,
                        offender_join_index: 0,
                    },
                ))
            })
            .collect();

        Self {
            collision: Collision::with_capacity(64),
            sat: SatResult::default(),
            eff_pushbacks: vec![Vector::ZERO; cfg.room_capacity],
            hard_pushback_norms: vec![[Vector::ZERO; HARD_PUSHBACK_NORMS_CAPACITY]; cfg.room_capacity],
            player_colliders,
            bullet_colliders,
        }
    }
}

/// Adds every stage barrier to the space
pub fn add_stage_barriers(stage: &StageLayout, space: &mut CollisionSpace) {
    for &(x, y, w, h) in &stage.barriers {
        let id = space.insert(Collider::rectangle(x, y, w, h, ColliderData::Barrier));
        space.add_single(id);
    }
}

/// Render frame 0 with every seat at its spawn point
pub fn initial_room_downsync_frame(
    cfg: &BattleConfig,
    stage: &StageLayout,
    seats: &[(i32, i32)],
) -> RoomDownsyncFrame {
    let mut rdf = RoomDownsyncFrame::preallocated(cfg.room_capacity, cfg.bullet_capacity);
    rdf.id = 0;
    let inv_ratio = cfg.collision_space_to_virtual_grid_ratio();
    for (k, player) in rdf.players.iter_mut().enumerate() {
        let join_index = k + 1;
        let (player_id, species_id) = seats.get(k).copied().unwrap_or((0, 0));
        let (wx, wy) = stage.spawn_point(join_index);
        let (vx, vy) = polygon_collider_ctr_to_virtual_grid_pos(wx, wy, inv_ratio);
        *player = PlayerDownsync {
            id: player_id,
            join_index,
            species_id,
            virtual_grid_x: vx,
            virtual_grid_y: vy,
            dir_x: if k % 2 == 0 { 1 } else { -1 },
            speed: cfg.walking_speed,
            character_state: CharacterState::InAir,
            in_air: true,
            hp: INITIAL_HP,
            ..PlayerDownsync::default()
        };
    }
    rdf
}

/// Derives `next` from `curr` and the delayed input frame, `None` meaning every seat idles.
///
/// Leaves `space` holding only its static colliders, whatever the outcome.
pub fn apply_input_frame_downsync_dynamics(
    curr: &RoomDownsyncFrame,
    delayed_input: Option<&InputFrameDownsync>,
    cfg: &BattleConfig,
    space: &mut CollisionSpace,
    ctx: &mut StepContext,
    next: &mut RoomDownsyncFrame,
) -> Result<(), GeometryError> {
    next.copy_from(curr);
    next.id = curr.id + 1;

    apply_controls(curr, delayed_input, cfg, next);
    let outcome = resolve_collisions(curr, cfg, space, ctx, next);
    for id in ctx.player_colliders.iter().chain(ctx.bullet_colliders.iter()) {
        space.remove_single(*id);
    }
    outcome?;

    for bullet in next.bullets.iter_mut() {
        bullet.active_frames_remaining -= 1;
    }
    next.bullets.retain(|b| b.active_frames_remaining > 0);

    if cfg.frame_data_logging_enabled {
        trace!(render_frame_id = next.id, players = ?next.players, "stepped");
    }
    Ok(())
}

fn apply_controls(
    curr: &RoomDownsyncFrame,
    delayed_input: Option<&InputFrameDownsync>,
    cfg: &BattleConfig,
    next: &mut RoomDownsyncFrame,
) {
    for (k, (prev, p)) in curr.players.iter().zip(next.players.iter_mut()).enumerate() {
        let encoded = delayed_input
            .and_then(|f| f.input_list.get(k).copied())
            .unwrap_or(0);
        let decoded = decode_input(encoded);

        if p.frames_to_recover > 0 {
            p.frames_to_recover -= 1;
        }
        if p.character_state.is_locked() && p.frames_to_recover == 0 {
            p.character_state = if p.in_air {
                CharacterState::InAir
            } else {
                CharacterState::Idle
            };
            p.vel_x = 0;
        }

        if !p.character_state.is_locked() {
            if decoded.dx != 0 {
                p.dir_x = decoded.dx.signum();
                p.vel_x = p.dir_x * p.speed;
            } else {
                p.vel_x = 0;
            }
            p.dir_y = decoded.dy.signum();

            if decoded.btn_a {
                if !prev.in_air {
                    p.vel_y = cfg.jumping_init_vel_y;
                    p.in_air = true;
                } else if prev.character_state == CharacterState::OnWall {
                    // Kick off the wall
                    p.dir_x = -prev.dir_x;
                    p.vel_x = p.dir_x * p.speed;
                    p.vel_y = cfg.jumping_init_vel_y;
                }
            }

            if decoded.btn_b && next.bullets.len() < cfg.bullet_capacity {
                next.bullets.push(Bullet {
                    bullet_local_id: next.bullet_local_id_counter,
                    offender_join_index: p.join_index,
                    origin_virtual_grid_x: p.virtual_grid_x + p.dir_x * cfg.bullet_offset_x,
                    origin_virtual_grid_y: p.virtual_grid_y,
                    dir_x: p.dir_x,
                    active_frames_remaining: cfg.bullet_active_frames,
                    hit_stun_frames: cfg.hit_stun_frames,
                    pushback_vel_x: p.dir_x * cfg.knockback_speed,
                    damage: BULLET_DAMAGE,
                });
                next.bullet_local_id_counter += 1;
                p.character_state = CharacterState::Atk1;
                p.frames_to_recover = cfg.attack_recovery_frames;
                p.vel_x = 0;
            }
        }

        p.vel_y = (p.vel_y + cfg.gravity_y).max(cfg.max_fall_vel_y);
        if prev.character_state == CharacterState::OnWall && p.in_air {
            p.vel_y = p.vel_y.max(cfg.wall_slide_vel_y);
        }

        p.virtual_grid_x += p.vel_x;
        p.virtual_grid_y += p.vel_y;
    }
}

fn resolve_collisions(
    curr: &RoomDownsyncFrame,
    cfg: &BattleConfig,
    space: &mut CollisionSpace,
    ctx: &mut StepContext,
    next: &mut RoomDownsyncFrame,
) -> Result<(), GeometryError> {
    let ratio = cfg.virtual_grid_to_collision_space_ratio;
    let inv_ratio = cfg.collision_space_to_virtual_grid_ratio();
    let (half_w, half_h) = (cfg.player_collider_width * 0.5, cfg.player_collider_height * 0.5);

    for (p, id) in next.players.iter().zip(ctx.player_colliders.iter()) {
        let (wx, wy) = virtual_grid_to_polygon_collider_ctr(p.virtual_grid_x, p.virtual_grid_y, ratio);
        let (bx, by) = polygon_collider_ctr_to_bl(wx, wy, half_w, half_h);
        space.set_position(*id, bx, by);
        space.add_single(*id);
    }

    let (bullet_half_w, bullet_half_h) = (cfg.bullet_hitbox_width * 0.5, cfg.bullet_hitbox_height * 0.5);
    for (b, id) in next.bullets.iter().zip(ctx.bullet_colliders.iter()) {
        let collider = space
            .collider_mut(*id)
            .ok_or(GeometryError::UnknownCollider(*id))?;
        collider.data = ColliderData::Bullet {
            bullet_local_id: b.bullet_local_id,
            offender_join_index: b.offender_join_index,
        };
        let (wx, wy) = virtual_grid_to_polygon_collider_ctr(
            b.origin_virtual_grid_x,
            b.origin_virtual_grid_y,
            ratio,
        );
        let (bx, by) = polygon_collider_ctr_to_bl(wx, wy, bullet_half_w, bullet_half_h);
        space.set_position(*id, bx, by);
        space.add_single(*id);
    }

    resolve_bullet_hits(space, ctx, next)?;

    let params = PushbackParams {
        snap_into_platform_overlap: cfg.snap_into_platform_overlap,
        virtual_grid_to_collision_space_ratio: ratio,
    };
    for (k, id) in ctx.player_colliders.iter().enumerate().take(next.players.len()) {
        let (Some(prev), Some(p)) = (curr.players.get(k), next.players.get_mut(k)) else {
            break;
        };
        let eff_pushback = &mut ctx.eff_pushbacks[k];
        *eff_pushback = Vector::ZERO;
        let norms = &mut ctx.hard_pushback_norms[k];
        let cnt = calc_hard_pushbacks_norms(
            prev,
            p,
            *id,
            space,
            params,
            eff_pushback,
            &mut norms[..],
            &mut ctx.collision,
            &mut ctx.sat,
        )?;

        let collider = space.collider(*id).ok_or(GeometryError::UnknownCollider(*id))?;
        let (cx, cy) = polygon_collider_bl_to_ctr(
            collider.x() - eff_pushback.x,
            collider.y() - eff_pushback.y,
            half_w,
            half_h,
        );
        let (vx, vy) = polygon_collider_ctr_to_virtual_grid_pos(cx, cy, inv_ratio);
        p.virtual_grid_x = vx;
        p.virtual_grid_y = vy;

        apply_contact_normals(p, &norms[..cnt]);
    }

    Ok(())
}

/// First player hit by each live bullet takes the blow
fn resolve_bullet_hits(
    space: &CollisionSpace,
    ctx: &mut StepContext,
    next: &mut RoomDownsyncFrame,
) -> Result<(), GeometryError> {
    for (bi, id) in ctx.bullet_colliders.iter().enumerate().take(next.bullets.len()) {
        if !space.check_all(*id, 0.0, 0.0, &mut ctx.collision) {
            continue;
        }
        let bullet_shape = &space
            .collider(*id)
            .ok_or(GeometryError::UnknownCollider(*id))?
            .shape;

        while let Some(other) = ctx.collision.pop_first_contacted_collider() {
            let victim_collider = space
                .collider(other)
                .ok_or(GeometryError::UnknownCollider(other))?;
            let ColliderData::Player { join_index } = victim_collider.data else {
                continue;
            };
            let bullet = next.bullets[bi];
            if join_index == bullet.offender_join_index || bullet.active_frames_remaining <= 0 {
                continue;
            }
            if overlaps(bullet_shape, &victim_collider.shape, &mut ctx.sat)?.is_none() {
                continue;
            }
            let Some(victim) = next.players.get_mut(join_index.wrapping_sub(1)) else {
                continue;
            };
            victim.character_state = CharacterState::Atked;
            victim.frames_to_recover = bullet.hit_stun_frames;
            victim.vel_x = bullet.pushback_vel_x;
            victim.hp = (victim.hp - bullet.damage).max(0);
            next.bullets[bi].active_frames_remaining = 0;
            break;
        }
    }
    Ok(())
}

/// Grounded, on-wall and ceiling handling from the recorded push-back normals (y up)
fn apply_contact_normals(p: &mut PlayerDownsync, norms: &[Vector]) {
    let mut grounded = false;
    let mut walled = false;
    for norm in norms {
        if norm.y < -0.5 {
            grounded = true;
        } else if norm.y > 0.5 {
            if p.vel_y > 0 {
                p.vel_y = 0;
            }
        } else if norm.x.abs() > 0.5 {
            walled = true;
        }
    }

    if grounded {
        if p.vel_y < 0 {
            p.vel_y = 0;
        }
        p.in_air = false;
    } else {
        p.in_air = true;
    }

    if !p.character_state.is_locked() {
        p.character_state = if !p.in_air {
            if p.vel_x != 0 {
                CharacterState::Walking
            } else {
                CharacterState::Idle
            }
        } else if walled {
            CharacterState::OnWall
        } else {
            CharacterState::InAir
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::downsync::{encode_input, INPUT_BTN_A};

    struct Rig {
        cfg: BattleConfig,
        space: CollisionSpace,
        ctx: StepContext,
    }

    fn rig() -> Rig {
        let cfg = BattleConfig::default();
        let stage = StageLayout::arena();
        let mut space = CollisionSpace::new(
            stage.space_width,
            stage.space_height,
            cfg.collision_cell_size,
            cfg.collision_cell_size,
        );
        add_stage_barriers(&stage, &mut space);
        let ctx = StepContext::new(&cfg, &mut space);
        Rig { cfg, space, ctx }
    }

    fn inputs(list: &[u64]) -> InputFrameDownsync {
        InputFrameDownsync {
            input_frame_id: 0,
            input_list: list.to_vec(),
            confirmed_list: 0b11,
        }
    }

    fn run(rig: &mut Rig, mut rdf: RoomDownsyncFrame, frames: usize, input: Option<&InputFrameDownsync>) -> RoomDownsyncFrame {
        let mut next = RoomDownsyncFrame::preallocated(rig.cfg.room_capacity, rig.cfg.bullet_capacity);
        for _ in 0..frames {
            apply_input_frame_downsync_dynamics(&rdf, input, &rig.cfg, &mut rig.space, &mut rig.ctx, &mut next)
                .unwrap();
            std::mem::swap(&mut rdf, &mut next);
        }
        rdf
    }

    fn spawned(rig: &Rig) -> RoomDownsyncFrame {
        initial_room_downsync_frame(&rig.cfg, &StageLayout::arena(), &[(10, 1), (20, 1)])
    }

    #[test]
    fn test_players_fall_and_land_on_floor() {
        let mut rig = rig();
        let rdf = spawned(&rig);
        let rdf = run(&mut rig, rdf, 60, None);
        for p in &rdf.players {
            assert!(!p.in_air, "player {} should be grounded", p.join_index);
            assert_eq!(p.character_state, CharacterState::Idle);
            // Floor top is 32, collider half height 16
            let center_y = p.virtual_grid_y as f32 * rig.cfg.virtual_grid_to_collision_space_ratio;
            assert!((center_y - 48.0).abs() < 1.0, "center y {center_y}");
        }
        assert_eq!(rdf.id, 60);
    }

    #[test]
    fn test_step_is_idempotent_and_restores_space() {
        let mut rig = rig();
        let rdf = spawned(&rig);
        let rdf = run(&mut rig, rdf, 30, None);
        let input = inputs(&[encode_input(3, false, true), encode_input(4, true, false)]);

        let mut first = RoomDownsyncFrame::preallocated(2, rig.cfg.bullet_capacity);
        let mut second = RoomDownsyncFrame::preallocated(2, rig.cfg.bullet_capacity);
        apply_input_frame_downsync_dynamics(&rdf, Some(&input), &rig.cfg, &mut rig.space, &mut rig.ctx, &mut first)
            .unwrap();
        apply_input_frame_downsync_dynamics(&rdf, Some(&input), &rig.cfg, &mut rig.space, &mut rig.ctx, &mut second)
            .unwrap();
        assert_eq!(first, second);

        for id in rig.ctx.player_colliders.iter().chain(rig.ctx.bullet_colliders.iter()) {
            assert!(!rig.space.collider(*id).unwrap().is_attached());
        }
    }

    #[test]
    fn test_walk_and_jump() {
        let mut rig = rig();
        let rdf = spawned(&rig);
        let grounded = run(&mut rig, rdf, 30, None);
        let start_x = grounded.players[0].virtual_grid_x;

        let walk = inputs(&[encode_input(3, false, false), 0]);
        let walked = run(&mut rig, grounded.clone(), 5, Some(&walk));
        assert_eq!(walked.players[0].virtual_grid_x, start_x + 5 * rig.cfg.walking_speed);
        assert_eq!(walked.players[0].character_state, CharacterState::Walking);
        assert_eq!(walked.players[1].virtual_grid_x, grounded.players[1].virtual_grid_x);

        let jump = inputs(&[INPUT_BTN_A, 0]);
        let jumped = run(&mut rig, grounded, 3, Some(&jump));
        assert!(jumped.players[0].in_air);
        assert_eq!(jumped.players[0].character_state, CharacterState::InAir);
        assert!(jumped.players[0].vel_y > 0);
    }

    #[test]
    fn test_walls_stop_players() {
        let mut rig = rig();
        let rdf = spawned(&rig);
        let grounded = run(&mut rig, rdf, 30, None);
        let left = inputs(&[encode_input(4, false, false), 0]);
        let rdf = run(&mut rig, grounded, 120, Some(&left));
        let center_x = rdf.players[0].virtual_grid_x as f32 * rig.cfg.virtual_grid_to_collision_space_ratio;
        // Left wall inner face is at 32, collider half width 12
        assert!(center_x >= 43.0, "center x {center_x}");
        assert!(center_x < 46.0, "center x {center_x}");
    }

    #[test]
    fn test_attack_hits_adjacent_player() {
        let mut rig = rig();
        let rdf = spawned(&rig);
        let mut rdf = run(&mut rig, rdf, 30, None);
        // Put seat 2 right in front of seat 1
        rdf.players[1].virtual_grid_x = rdf.players[0].virtual_grid_x + rig.cfg.bullet_offset_x;
        rdf.players[0].dir_x = 1;

        let attack = inputs(&[encode_input(0, false, true), 0]);
        let hit = run(&mut rig, rdf, 1, Some(&attack));

        assert_eq!(hit.players[0].character_state, CharacterState::Atk1);
        assert_eq!(hit.players[1].character_state, CharacterState::Atked);
        assert_eq!(hit.players[1].frames_to_recover, rig.cfg.hit_stun_frames);
        assert_eq!(hit.players[1].hp, INITIAL_HP - BULLET_DAMAGE);
        assert_eq!(hit.bullet_local_id_counter, 1);
        assert!(hit.bullets.is_empty());
    }
}
