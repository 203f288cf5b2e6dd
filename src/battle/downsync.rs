//! Frame data shared between the simulation and the wire

use serde::{Deserialize, Serialize};

/// Direction decoder indexed by the low 4 bits of an encoded input
pub const DIRECTION_DECODER: [[i32; 2]; 9] = [
    [0, 0],
    [0, 2],
    [0, -2],
    [2, 0],
    [-2, 0],
    [1, 1],
    [-1, -1],
    [1, -1],
    [-1, 1],
];

pub const INPUT_DIRECTION_MASK: u64 = 0b1111;
pub const INPUT_BTN_A: u64 = 1 << 4;
pub const INPUT_BTN_B: u64 = 1 << 5;

/// Decoded seat input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodedInput {
    pub dx: i32,
    pub dy: i32,
    /// Jump
    pub btn_a: bool,
    /// Attack
    pub btn_b: bool,
}

pub fn decode_input(encoded: u64) -> DecodedInput {
    let dir = (encoded & INPUT_DIRECTION_MASK) as usize;
    let [dx, dy] = DIRECTION_DECODER.get(dir).copied().unwrap_or([0, 0]);
    DecodedInput {
        dx,
        dy,
        btn_a: encoded & INPUT_BTN_A != 0,
        btn_b: encoded & INPUT_BTN_B != 0,
    }
}

pub fn encode_input(dir_index: u64, btn_a: bool, btn_b: bool) -> u64 {
    let mut encoded = dir_index & INPUT_DIRECTION_MASK;
    if btn_a {
        encoded |= INPUT_BTN_A;
    }
    if btn_b {
        encoded |= INPUT_BTN_B;
    }
    encoded
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacterState {
    #[default]
    Idle,
    Walking,
    InAir,
    OnWall,
    Atk1,
    Atked,
}

impl CharacterState {
    /// States during which inputs are ignored until `frames_to_recover` runs out
    pub fn is_locked(self) -> bool {
        matches!(self, CharacterState::Atk1 | CharacterState::Atked)
    }
}

/// One player's state within a render frame, positions in virtual grid units (y up)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDownsync {
    pub id: i32,
    /// 1-based seat
    pub join_index: usize,
    pub species_id: i32,
    pub virtual_grid_x: i32,
    pub virtual_grid_y: i32,
    pub dir_x: i32,
    pub dir_y: i32,
    pub vel_x: i32,
    pub vel_y: i32,
    pub speed: i32,
    pub character_state: CharacterState,
    pub frames_to_recover: i32,
    pub in_air: bool,
    pub hp: i32,
}

/// Transient melee hitbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bullet {
    pub bullet_local_id: i32,
    pub offender_join_index: usize,
    pub origin_virtual_grid_x: i32,
    pub origin_virtual_grid_y: i32,
    pub dir_x: i32,
    pub active_frames_remaining: i32,
    pub hit_stun_frames: i32,
    pub pushback_vel_x: i32,
    pub damage: i32,
}

/// Inputs of every seat for one input frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrameDownsync {
    pub input_frame_id: i32,
    pub input_list: Vec<u64>,
    pub confirmed_list: u64,
}

impl InputFrameDownsync {
    pub fn preallocated(capacity: usize) -> Self {
        Self {
            input_frame_id: -1,
            input_list: vec![0; capacity],
            confirmed_list: 0,
        }
    }

    /// Overwrites in place without reallocating
    pub fn stamp(&mut self, input_frame_id: i32, input_list: &[u64], confirmed_list: u64) {
        self.input_frame_id = input_frame_id;
        self.input_list.clone_from_slice(input_list);
        self.confirmed_list = confirmed_list;
    }
}

/// Full battle state for one render frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDownsyncFrame {
    pub id: i32,
    pub players: Vec<PlayerDownsync>,
    pub bullets: Vec<Bullet>,
    pub bullet_local_id_counter: i32,
}

impl RoomDownsyncFrame {
    pub fn preallocated(capacity: usize, bullet_capacity: usize) -> Self {
        Self {
            id: -1,
            players: vec![PlayerDownsync::default(); capacity],
            bullets: Vec::with_capacity(bullet_capacity),
            bullet_local_id_counter: 0,
        }
    }

    /// Copies `other` into the slots already owned by `self`
    pub fn copy_from(&mut self, other: &RoomDownsyncFrame) {
        self.id = other.id;
        self.players.clone_from(&other.players);
        self.bullets.clone_from(&other.bullets);
        self.bullet_local_id_counter = other.bullet_local_id_counter;
    }
}
