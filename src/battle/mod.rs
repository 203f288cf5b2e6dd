//! Rollback battle core: frame windows, prediction and the chasing stepper

pub mod collision;
pub mod downsync;
pub mod geometry;
pub mod prediction;
pub mod ring_buffer;
pub mod stage;
pub mod stepper;

use tracing::{debug, warn};

use crate::config::BattleConfig;

use collision::CollisionSpace;
use downsync::{InputFrameDownsync, RoomDownsyncFrame};
use geometry::GeometryError;
use ring_buffer::{FrameRingBuffer, RingBufferError};
use stage::StageLayout;
use stepper::StepContext;

#[derive(Debug, thiserror::Error)]
pub enum BattleError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    RingBuffer(#[from] RingBufferError),

    #[error("no self player is bound to this battle")]
    SelfPlayerMissing,

    #[error("battle has not been started")]
    NotStarted,

    #[error("render frame {0} is not in the buffer")]
    RenderFrameMissing(i32),

    #[error("input frame {0} is not in the buffer")]
    InputFrameMissing(i32),

    #[error("join index {0} is not a seat of this battle")]
    InvalidJoinIndex(usize),

    #[error("frame {0} does not carry one entry per seat")]
    MalformedFrame(i32),

    #[error("unknown stage: {0}")]
    UnknownStage(String),
}

/// One room's simulation state.
///
/// `chaser_render_frame_id <= render_frame_id` always holds; every render
/// frame up to the chaser has been derived from the inputs currently stored.
pub struct Battle {
    cfg: BattleConfig,
    stage: StageLayout,

    render_frame_id: i32,
    chaser_render_frame_id: i32,
    last_all_confirmed_input_frame_id: i32,

    render_buffer: FrameRingBuffer<RoomDownsyncFrame>,
    input_buffer: FrameRingBuffer<InputFrameDownsync>,

    last_individually_confirmed_input_frame_id: Vec<i32>,
    last_individually_confirmed_input_list: Vec<u64>,
    self_join_index: Option<usize>,
    prefabbed_input_list: Vec<u64>,

    space: CollisionSpace,
    step_ctx: StepContext,
    scratch_rdf: RoomDownsyncFrame,
}

impl Battle {
    pub fn new(cfg: BattleConfig) -> Result<Self, BattleError> {
        let stage = StageLayout::by_name(&cfg.stage_name)
            .ok_or_else(|| BattleError::UnknownStage(cfg.stage_name.clone()))?;
        let mut space = CollisionSpace::new(
            stage.space_width,
            stage.space_height,
            cfg.collision_cell_size,
            cfg.collision_cell_size,
        );
        stepper::add_stage_barriers(&stage, &mut space);
        let step_ctx = StepContext::new(&cfg, &mut space);
        let scratch_rdf = RoomDownsyncFrame::preallocated(cfg.room_capacity, cfg.bullet_capacity);

        let mut battle = Self {
            render_buffer: FrameRingBuffer::new(cfg.render_buffer_size),
            input_buffer: FrameRingBuffer::new(cfg.input_buffer_size()),
            render_frame_id: 0,
            chaser_render_frame_id: -1,
            last_all_confirmed_input_frame_id: -1,
            last_individually_confirmed_input_frame_id: Vec::new(),
            last_individually_confirmed_input_list: Vec::new(),
            self_join_index: None,
            prefabbed_input_list: Vec::new(),
            space,
            step_ctx,
            scratch_rdf,
            stage,
            cfg,
        };
        battle.reset_current_match();
        Ok(battle)
    }

    /// Sizes and pre-fills every buffer; after this the hot path only recycles slots
    pub fn reset_current_match(&mut self) {
        let capacity = self.cfg.room_capacity;

        self.render_frame_id = 0;
        self.chaser_render_frame_id = -1;
        self.last_all_confirmed_input_frame_id = -1;

        self.render_buffer = FrameRingBuffer::new(self.cfg.render_buffer_size);
        for _ in 0..self.render_buffer.capacity() {
            self.render_buffer.put(RoomDownsyncFrame::preallocated(
                capacity,
                self.cfg.bullet_capacity,
            ));
        }
        self.render_buffer.clear();

        self.input_buffer = FrameRingBuffer::new(self.cfg.input_buffer_size());
        for _ in 0..self.input_buffer.capacity() {
            self.input_buffer.put(InputFrameDownsync::preallocated(capacity));
        }
        self.input_buffer.clear();

        self.last_individually_confirmed_input_frame_id = vec![-1; capacity];
        self.last_individually_confirmed_input_list = vec![0; capacity];
        self.prefabbed_input_list = vec![0; capacity];
    }

    /// Marks the seat whose inputs are sampled locally
    pub fn bind_self(&mut self, join_index: usize) -> Result<(), BattleError> {
        self.seat(join_index)?;
        self.self_join_index = Some(join_index);
        Ok(())
    }

    /// Initial frame for the given `(player_id, species_id)` seats
    pub fn initial_frame(&self, seats: &[(i32, i32)]) -> RoomDownsyncFrame {
        stepper::initial_room_downsync_frame(&self.cfg, &self.stage, seats)
    }

    pub fn start(&mut self, initial: &RoomDownsyncFrame) -> Result<(), BattleError> {
        if initial.players.len() != self.cfg.room_capacity {
            return Err(BattleError::MalformedFrame(initial.id));
        }
        let slot = self.render_buffer.dry_set_by_frame_id(initial.id)?;
        slot.copy_from(initial);
        self.render_frame_id = initial.id;
        self.chaser_render_frame_id = initial.id;
        Ok(())
    }

    pub fn config(&self) -> &BattleConfig {
        &self.cfg
    }

    pub fn render_frame_id(&self) -> i32 {
        self.render_frame_id
    }

    pub fn chaser_render_frame_id(&self) -> i32 {
        self.chaser_render_frame_id
    }

    pub fn last_all_confirmed_input_frame_id(&self) -> i32 {
        self.last_all_confirmed_input_frame_id
    }

    pub fn self_join_index(&self) -> Option<usize> {
        self.self_join_index
    }

    pub fn render_frame(&self, render_frame_id: i32) -> Option<&RoomDownsyncFrame> {
        self.render_buffer.get_by_frame_id(render_frame_id)
    }

    pub fn input_frame(&self, input_frame_id: i32) -> Option<&InputFrameDownsync> {
        self.input_buffer.get_by_frame_id(input_frame_id)
    }

    /// Input frame consumed when stepping from `render_frame_id`, negative means none yet
    pub fn delayed_input_frame_id(&self, render_frame_id: i32) -> i32 {
        (render_frame_id - self.cfg.input_delay_frames) >> self.cfg.input_scale_frames
    }

    pub fn no_delay_input_frame_id(&self, render_frame_id: i32) -> i32 {
        render_frame_id >> self.cfg.input_scale_frames
    }

    /// First render frame whose step consumes `input_frame_id`
    pub fn first_used_render_frame_id(&self, input_frame_id: i32) -> i32 {
        (input_frame_id << self.cfg.input_scale_frames) + self.cfg.input_delay_frames
    }

    pub fn should_generate_input_frame_upsync(&self, render_frame_id: i32) -> bool {
        render_frame_id & ((1 << self.cfg.input_scale_frames) - 1) == 0
    }

    /// Latest render frame derived only from all-confirmed inputs
    pub fn last_confirmed_render_frame_id(&self) -> i32 {
        let bound = self.first_used_render_frame_id(self.last_all_confirmed_input_frame_id + 1);
        bound.min(self.chaser_render_frame_id)
    }

    /// Advances one render frame: local input, delayed input prefab, chase, step.
    ///
    /// `local_input` is the sampled input of the self seat, `None` on the server.
    pub fn tick(&mut self, local_input: Option<u64>) -> Result<(), BattleError> {
        if self.chaser_render_frame_id < 0 {
            return Err(BattleError::NotStarted);
        }

        if let Some(input) = local_input {
            if self.should_generate_input_frame_upsync(self.render_frame_id) {
                self.resolve_input(self.no_delay_input_frame_id(self.render_frame_id), true, input)?;
            }
        }

        let delayed_input_frame_id = self.delayed_input_frame_id(self.render_frame_id);
        if delayed_input_frame_id >= 0
            && self.input_buffer.get_by_frame_id(delayed_input_frame_id).is_none()
        {
            if self.self_join_index.is_some() {
                self.resolve_input(delayed_input_frame_id, false, 0)?;
            } else {
                self.prefab_input_frame(delayed_input_frame_id)?;
            }
        }

        let prev_chaser = self.chaser_render_frame_id;
        let next_chaser = (prev_chaser + self.cfg.max_chasing_render_frames_per_update)
            .min(self.render_frame_id);
        if prev_chaser < next_chaser {
            self.rollback_and_chase(prev_chaser, next_chaser, true)?;
        }

        self.rollback_and_chase(self.render_frame_id, self.render_frame_id + 1, false)?;
        self.render_frame_id += 1;
        Ok(())
    }

    /// Re-derives render frames `st + 1..=ed` from frame `st`
    fn rollback_and_chase(&mut self, st: i32, ed: i32, is_chasing: bool) -> Result<(), BattleError> {
        for i in st..ed {
            let curr = self
                .render_buffer
                .get_by_frame_id(i)
                .ok_or(BattleError::RenderFrameMissing(i))?;
            self.scratch_rdf.copy_from(curr);

            let j = self.delayed_input_frame_id(i);
            let delayed_input = if j < 0 {
                None
            } else {
                Some(
                    self.input_buffer
                        .get_by_frame_id(j)
                        .ok_or(BattleError::InputFrameMissing(j))?,
                )
            };

            let next = self.render_buffer.dry_set_by_frame_id(i + 1)?;
            stepper::apply_input_frame_downsync_dynamics(
                &self.scratch_rdf,
                delayed_input,
                &self.cfg,
                &mut self.space,
                &mut self.step_ctx,
                next,
            )?;

            if is_chasing {
                self.chaser_render_frame_id = i + 1;
            }
        }
        Ok(())
    }

    /// Rewinds the chaser to the first render frame that consumed `input_frame_id`
    fn rewind_chaser_for(&mut self, input_frame_id: i32) {
        let render_frame_id = self.first_used_render_frame_id(input_frame_id);
        if render_frame_id >= self.chaser_render_frame_id {
            return;
        }
        let oldest = self.render_buffer.st_frame_id();
        if render_frame_id < oldest {
            warn!(
                input_frame_id,
                render_frame_id,
                oldest,
                "misprediction older than the render window"
            );
        }
        debug!(
            input_frame_id,
            from = self.chaser_render_frame_id,
            to = render_frame_id.max(oldest),
            "rewinding chaser"
        );
        self.chaser_render_frame_id = render_frame_id.max(oldest);
    }

    /// Applies an authoritative frame from a resync
    pub fn apply_room_downsync_frame(&mut self, rdf: &RoomDownsyncFrame) -> Result<bool, BattleError> {
        if rdf.players.len() != self.cfg.room_capacity {
            return Err(BattleError::MalformedFrame(rdf.id));
        }
        if rdf.id < self.render_buffer.st_frame_id() {
            return Ok(false);
        }
        let slot = self.render_buffer.dry_set_by_frame_id(rdf.id)?;
        slot.copy_from(rdf);

        if rdf.id > self.render_frame_id {
            self.render_frame_id = rdf.id;
            self.chaser_render_frame_id = rdf.id;
        } else if rdf.id < self.chaser_render_frame_id {
            self.chaser_render_frame_id = rdf.id;
        }
        Ok(true)
    }

    fn seat(&self, join_index: usize) -> Result<usize, BattleError> {
        if join_index == 0 || join_index > self.cfg.room_capacity {
            return Err(BattleError::InvalidJoinIndex(join_index));
        }
        Ok(join_index - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::downsync::encode_input;

    fn server_battle() -> Battle {
        let mut battle = Battle::new(BattleConfig::default()).unwrap();
        let initial = battle.initial_frame(&[(10, 1), (20, 1)]);
        battle.start(&initial).unwrap();
        battle
    }

    #[test]
    fn test_frame_id_conversions() {
        let battle = server_battle();
        // delay 8, scale 2
        assert!(battle.delayed_input_frame_id(0) < 0);
        assert_eq!(battle.delayed_input_frame_id(8), 0);
        assert_eq!(battle.delayed_input_frame_id(11), 0);
        assert_eq!(battle.delayed_input_frame_id(12), 1);
        assert_eq!(battle.first_used_render_frame_id(3), 20);
        assert_eq!(battle.delayed_input_frame_id(20), 3);
        assert_eq!(battle.no_delay_input_frame_id(9), 2);
        assert!(battle.should_generate_input_frame_upsync(8));
        assert!(!battle.should_generate_input_frame_upsync(9));
    }

    #[test]
    fn test_tick_requires_start() {
        let mut battle = Battle::new(BattleConfig::default()).unwrap();
        assert_eq!(battle.chaser_render_frame_id(), -1);
        assert!(matches!(battle.tick(None), Err(BattleError::NotStarted)));
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        let cfg = BattleConfig {
            stage_name: "nowhere".to_string(),
            ..BattleConfig::default()
        };
        assert!(matches!(Battle::new(cfg), Err(BattleError::UnknownStage(_))));
    }

    #[test]
    fn test_chaser_never_overshoots() {
        let mut battle = server_battle();
        for _ in 0..100 {
            battle.tick(None).unwrap();
            assert!(battle.chaser_render_frame_id() <= battle.render_frame_id());
            assert!(battle.render_frame(battle.render_frame_id()).is_some());
        }
        assert_eq!(battle.render_frame_id(), 100);
        assert_eq!(battle.chaser_render_frame_id(), 99);
    }

    #[test]
    fn test_late_inputs_converge_to_on_time_history() {
        let walk = encode_input(3, false, false);

        let mut on_time = server_battle();
        for ifid in 0..10 {
            assert!(on_time.on_input_upsync(1, ifid, walk).unwrap());
            assert!(on_time.on_input_upsync(2, ifid, 0).unwrap());
        }
        for _ in 0..40 {
            on_time.tick(None).unwrap();
        }

        let mut late = server_battle();
        for _ in 0..20 {
            late.tick(None).unwrap();
        }
        assert_eq!(late.chaser_render_frame_id(), 19);
        for ifid in 0..10 {
            late.on_input_upsync(1, ifid, walk).unwrap();
            late.on_input_upsync(2, ifid, 0).unwrap();
        }
        // Input frame 0 was predicted idle for seat 1
        assert_eq!(late.chaser_render_frame_id(), late.first_used_render_frame_id(0));
        for _ in 0..20 {
            late.tick(None).unwrap();
        }

        assert_eq!(late.render_frame_id(), on_time.render_frame_id());
        for id in 0..=40 {
            assert_eq!(late.render_frame(id), on_time.render_frame(id), "render frame {id}");
        }
        let start_x = on_time.render_frame(0).unwrap().players[0].virtual_grid_x;
        assert!(on_time.render_frame(40).unwrap().players[0].virtual_grid_x > start_x);
    }

    #[test]
    fn test_resync_frame_moves_render_and_chaser() {
        let mut battle = server_battle();
        for _ in 0..10 {
            battle.tick(None).unwrap();
        }

        let mut rdf = battle.render_frame(4).unwrap().clone();
        rdf.players[0].hp = 1;
        assert!(battle.apply_room_downsync_frame(&rdf).unwrap());
        assert_eq!(battle.chaser_render_frame_id(), 4);
        assert_eq!(battle.render_frame_id(), 10);

        rdf.id = 50;
        assert!(battle.apply_room_downsync_frame(&rdf).unwrap());
        assert_eq!(battle.render_frame_id(), 50);
        assert_eq!(battle.chaser_render_frame_id(), 50);
        battle.tick(None).unwrap();
        assert_eq!(battle.render_frame(51).unwrap().players[0].hp, 1);
    }
}
