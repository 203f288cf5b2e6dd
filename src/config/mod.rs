//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::battle::stage::StageLayout;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Shared secret used to verify player auth tokens
    pub auth_token_secret: String,
    /// Number of rooms kept in the room pool
    pub room_count: usize,
    /// Allowed client origins for CORS (comma-separated), none means same-origin only
    pub client_origin: Option<String>,

    /// Per-room battle parameters
    pub battle: BattleConfig,
}

/// Battle parameters shared by every room.
///
/// Everything that changes the simulation outcome lives here so that server
/// and clients can be handed the same values.
#[derive(Clone, Debug)]
pub struct BattleConfig {
    pub stage_name: String,
    pub room_capacity: usize,
    pub battle_duration_frames: i32,

    /// Render frames between an input being sampled and being consumed
    pub input_delay_frames: i32,
    /// One input frame covers `1 << input_scale_frames` render frames
    pub input_scale_frames: u32,
    /// Input frames the server waits for a slow seat before confirming its prediction
    pub input_frame_upsync_delay_tolerance: i32,
    pub max_chasing_render_frames_per_update: i32,
    pub render_buffer_size: usize,
    /// Render frames between two full snapshot broadcasts
    pub snapshot_interval_frames: u32,

    pub battle_udp_tunnel_addr: String,
    pub frame_data_logging_enabled: bool,

    /// Gap left between a player and a platform after a hard pushback
    pub snap_into_platform_overlap: f32,
    /// Bits of an encoded input that may be carried forward as a prediction
    pub predictable_input_mask: u64,
    /// Collision-space units per virtual grid unit
    pub virtual_grid_to_collision_space_ratio: f32,
    pub collision_cell_size: i32,

    pub player_collider_width: f32,
    pub player_collider_height: f32,
    pub walking_speed: i32,
    pub gravity_y: i32,
    pub jumping_init_vel_y: i32,
    pub max_fall_vel_y: i32,
    pub wall_slide_vel_y: i32,

    pub bullet_capacity: usize,
    pub bullet_hitbox_width: f32,
    pub bullet_hitbox_height: f32,
    pub bullet_offset_x: i32,
    pub bullet_active_frames: i32,
    pub attack_recovery_frames: i32,
    pub hit_stun_frames: i32,
    pub knockback_speed: i32,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            stage_name: "arena".to_string(),
            room_capacity: 2,
            battle_duration_frames: 60 * 60 * 3,
            input_delay_frames: 8,
            input_scale_frames: 2,
            input_frame_upsync_delay_tolerance: 2,
            max_chasing_render_frames_per_update: 5,
            render_buffer_size: 256,
            snapshot_interval_frames: 60,
            battle_udp_tunnel_addr: String::new(),
            frame_data_logging_enabled: false,
            snap_into_platform_overlap: 0.1,
            predictable_input_mask: 0b1111,
            virtual_grid_to_collision_space_ratio: 0.01,
            collision_cell_size: 64,
            player_collider_width: 24.0,
            player_collider_height: 32.0,
            walking_speed: 300,
            gravity_y: -50,
            jumping_init_vel_y: 1000,
            max_fall_vel_y: -2000,
            wall_slide_vel_y: -200,
            bullet_capacity: 16,
            bullet_hitbox_width: 24.0,
            bullet_hitbox_height: 16.0,
            bullet_offset_x: 2400,
            bullet_active_frames: 6,
            attack_recovery_frames: 15,
            hit_stun_frames: 20,
            knockback_speed: 400,
        }
    }
}

impl BattleConfig {
    /// Inverse of `virtual_grid_to_collision_space_ratio`, derived rather than configured
    pub fn collision_space_to_virtual_grid_ratio(&self) -> f32 {
        1.0 / self.virtual_grid_to_collision_space_ratio
    }

    /// Input buffer capacity derived from the render buffer, as every client sizes it
    pub fn input_buffer_size(&self) -> usize {
        (self.render_buffer_size >> 1) + 1
    }

    /// Bitmask with one bit per seat
    pub fn all_confirmed_mask(&self) -> u64 {
        if self.room_capacity >= 64 {
            u64::MAX
        } else {
            (1u64 << self.room_capacity) - 1
        }
    }

    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cfg = Self {
            stage_name: env::var("STAGE_NAME").unwrap_or(defaults.stage_name),
            room_capacity: parse_env("ROOM_CAPACITY", defaults.room_capacity)?,
            battle_duration_frames: parse_env(
                "BATTLE_DURATION_FRAMES",
                defaults.battle_duration_frames,
            )?,
            input_delay_frames: parse_env("INPUT_DELAY_FRAMES", defaults.input_delay_frames)?,
            input_scale_frames: parse_env("INPUT_SCALE_FRAMES", defaults.input_scale_frames)?,
            input_frame_upsync_delay_tolerance: parse_env(
                "INPUT_FRAME_UPSYNC_DELAY_TOLERANCE",
                defaults.input_frame_upsync_delay_tolerance,
            )?,
            max_chasing_render_frames_per_update: parse_env(
                "MAX_CHASING_RENDER_FRAMES_PER_UPDATE",
                defaults.max_chasing_render_frames_per_update,
            )?,
            render_buffer_size: parse_env("RENDER_BUFFER_SIZE", defaults.render_buffer_size)?,
            snapshot_interval_frames: parse_env(
                "SNAPSHOT_INTERVAL_FRAMES",
                defaults.snapshot_interval_frames,
            )?,
            battle_udp_tunnel_addr: env::var("BATTLE_UDP_TUNNEL_ADDR")
                .unwrap_or(defaults.battle_udp_tunnel_addr),
            frame_data_logging_enabled: parse_env(
                "FRAME_DATA_LOGGING_ENABLED",
                defaults.frame_data_logging_enabled,
            )?,
            snap_into_platform_overlap: parse_env(
                "SNAP_INTO_PLATFORM_OVERLAP",
                defaults.snap_into_platform_overlap,
            )?,
            predictable_input_mask: parse_env(
                "PREDICTABLE_INPUT_MASK",
                defaults.predictable_input_mask,
            )?,
            ..defaults
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the battle core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_capacity == 0 || self.room_capacity > 64 {
            return Err(ConfigError::Invalid("ROOM_CAPACITY"));
        }
        if self.render_buffer_size < 2 {
            return Err(ConfigError::Invalid("RENDER_BUFFER_SIZE"));
        }
        if self.max_chasing_render_frames_per_update < 1 {
            return Err(ConfigError::Invalid("MAX_CHASING_RENDER_FRAMES_PER_UPDATE"));
        }
        if self.input_delay_frames < 0 {
            return Err(ConfigError::Invalid("INPUT_DELAY_FRAMES"));
        }
        if self.virtual_grid_to_collision_space_ratio <= 0.0 {
            return Err(ConfigError::Invalid("VIRTUAL_GRID_TO_COLLISION_SPACE_RATIO"));
        }
        if StageLayout::by_name(&self.stage_name).is_none() {
            return Err(ConfigError::Invalid("STAGE_NAME"));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            auth_token_secret: env::var("AUTH_TOKEN_SECRET")
                .map_err(|_| ConfigError::Missing("AUTH_TOKEN_SECRET"))?,
            room_count: parse_env("ROOM_COUNT", 4)?,
            client_origin: env::var("CLIENT_ORIGIN").ok(),

            battle: BattleConfig::from_env()?,
        })
    }
}

fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
