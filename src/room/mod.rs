//! Rooms: seat admission, disconnect bookkeeping and the battle task

pub mod manager;
pub mod runner;
pub mod snapshot;

pub use manager::RoomManager;
pub use runner::RoomRunner;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::BattleConfig;
use crate::ws::protocol::{BattleColliderInfo, ErrCode};
use crate::ws::session::{CancelSignal, SessionLink};

use runner::RunnerSeat;

/// Room lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// No seat taken
    Idle,
    /// Some seats taken, battle not started
    Waiting,
    /// Every seat was filled and the battle task owns the room
    InBattle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("room is full")]
    RoomFull,

    #[error("player is already seated in this room")]
    DuplicatePlayer,

    #[error("room is not accepting players")]
    RoomNotAcceptingPlayers,

    #[error("no room available")]
    NoRoomAvailable,
}

impl AdmissionError {
    pub fn err_code(self) -> ErrCode {
        match self {
            AdmissionError::RoomFull => ErrCode::RoomFull,
            AdmissionError::DuplicatePlayer => ErrCode::DuplicatePlayer,
            AdmissionError::RoomNotAcceptingPlayers => ErrCode::RoomNotAcceptingPlayers,
            AdmissionError::NoRoomAvailable => ErrCode::NoRoomAvailable,
        }
    }
}

struct Seat {
    player_id: i32,
    species_id: i32,
    connected: bool,
    cancel: CancelSignal,
    /// Moved into the battle task once every seat is filled
    link: Option<SessionLink>,
}

struct RoomInner {
    state: RoomState,
    seats: Vec<Option<Seat>>,
    disconnection_counts: HashMap<i32, u32>,
}

pub struct Room {
    id: i32,
    cfg: BattleConfig,
    inner: Mutex<RoomInner>,
    player_count: AtomicUsize,
}

impl Room {
    pub fn new(id: i32, cfg: BattleConfig) -> Self {
        let seats = (0..cfg.room_capacity).map(|_| None).collect();
        Self {
            id,
            cfg,
            inner: Mutex::new(RoomInner {
                state: RoomState::Idle,
                seats,
                disconnection_counts: HashMap::new(),
            }),
            player_count: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn config(&self) -> &BattleConfig {
        &self.cfg
    }

    pub fn state(&self) -> RoomState {
        self.inner.lock().state
    }

    /// Seated players still connected
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    pub fn disconnection_count(&self, player_id: i32) -> u32 {
        self.inner
            .lock()
            .disconnection_counts
            .get(&player_id)
            .copied()
            .unwrap_or(0)
    }

    /// Higher scores are handed out first: partially filled rooms before idle ones
    pub fn score(&self) -> i64 {
        match self.state() {
            RoomState::Idle | RoomState::Waiting => 1 + self.player_count() as i64,
            RoomState::InBattle => 0,
        }
    }

    pub fn battle_collider_info(&self) -> BattleColliderInfo {
        BattleColliderInfo {
            stage_name: self.cfg.stage_name.clone(),
            bound_room_id: self.id,
            battle_duration_frames: self.cfg.battle_duration_frames,
            input_frame_upsync_delay_tolerance: self.cfg.input_frame_upsync_delay_tolerance,
            max_chasing_render_frames_per_update: self.cfg.max_chasing_render_frames_per_update,
            render_buffer_size: self.cfg.render_buffer_size,
            bound_room_capacity: self.cfg.room_capacity,
            battle_udp_tunnel: self.cfg.battle_udp_tunnel_addr.clone(),
            frame_data_logging_enabled: self.cfg.frame_data_logging_enabled,
        }
    }

    /// Seats the player and returns its join index; the battle task is
    /// spawned by the admission that fills the last seat.
    pub fn add_player_if_possible(
        self: &Arc<Self>,
        player_id: i32,
        species_id: i32,
        link: SessionLink,
    ) -> Result<usize, AdmissionError> {
        let (join_index, seats) = self.admit(player_id, species_id, link)?;
        if let Some(seats) = seats {
            match RoomRunner::new(self.clone(), seats) {
                Ok(runner) => {
                    tokio::spawn(runner.run());
                }
                Err(e) => {
                    error!(room_id = self.id, error = %e, "Failed to start battle");
                    self.dismiss();
                }
            }
        }
        Ok(join_index)
    }

    /// Admission without spawning; returns the battle seats when the room just filled up
    pub(crate) fn admit(
        &self,
        player_id: i32,
        species_id: i32,
        link: SessionLink,
    ) -> Result<(usize, Option<Vec<RunnerSeat>>), AdmissionError> {
        let mut inner = self.inner.lock();
        if inner.state == RoomState::InBattle {
            return Err(AdmissionError::RoomNotAcceptingPlayers);
        }
        if inner
            .seats
            .iter()
            .flatten()
            .any(|seat| seat.player_id == player_id)
        {
            return Err(AdmissionError::DuplicatePlayer);
        }
        let k = inner
            .seats
            .iter()
            .position(Option::is_none)
            .ok_or(AdmissionError::RoomFull)?;

        if inner.state == RoomState::Idle {
            inner.disconnection_counts.clear();
        }
        inner.seats[k] = Some(Seat {
            player_id,
            species_id,
            connected: true,
            cancel: link.cancel.clone(),
            link: Some(link),
        });
        inner.state = RoomState::Waiting;
        self.player_count.fetch_add(1, Ordering::Relaxed);
        let join_index = k + 1;
        info!(room_id = self.id, player_id, join_index, "Player seated");

        if inner.seats.iter().any(Option::is_none) {
            return Ok((join_index, None));
        }

        inner.state = RoomState::InBattle;
        let seats = inner
            .seats
            .iter_mut()
            .enumerate()
            .filter_map(|(k, seat)| {
                let seat = seat.as_mut()?;
                let link = seat.link.take()?;
                Some(RunnerSeat {
                    player_id: seat.player_id,
                    species_id: seat.species_id,
                    join_index: k + 1,
                    outbound_tx: link.outbound_tx,
                    inbound_rx: link.inbound_rx,
                })
            })
            .collect();
        Ok((join_index, Some(seats)))
    }

    /// Called once per admitted session teardown
    pub fn on_player_disconnected(&self, player_id: i32) {
        let mut inner = self.inner.lock();
        *inner.disconnection_counts.entry(player_id).or_insert(0) += 1;

        let Some(k) = inner
            .seats
            .iter()
            .position(|seat| matches!(seat, Some(seat) if seat.player_id == player_id))
        else {
            debug!(room_id = self.id, player_id, "Disconnected player holds no seat");
            return;
        };

        match inner.state {
            RoomState::Waiting => {
                inner.seats[k] = None;
                self.player_count.fetch_sub(1, Ordering::Relaxed);
                if inner.seats.iter().all(Option::is_none) {
                    inner.state = RoomState::Idle;
                }
                info!(room_id = self.id, player_id, "Player left before battle start");
            }
            RoomState::InBattle => {
                if let Some(seat) = inner.seats[k].as_mut() {
                    if seat.connected {
                        seat.connected = false;
                        self.player_count.fetch_sub(1, Ordering::Relaxed);
                        info!(room_id = self.id, player_id, join_index = k + 1, "Player disconnected mid-battle");
                    }
                }
            }
            RoomState::Idle => {}
        }
    }

    /// Bits of the seats whose inputs are no longer awaited
    pub fn inactive_mask(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .seats
            .iter()
            .enumerate()
            .filter(|(_, seat)| !matches!(seat, Some(seat) if seat.connected))
            .fold(0u64, |mask, (k, _)| mask | (1u64 << k))
    }

    /// Cancels every seated session and returns the room to `Idle`
    pub fn dismiss(&self) {
        let mut inner = self.inner.lock();
        for seat in inner.seats.iter_mut() {
            if let Some(seat) = seat.take() {
                seat.cancel.cancel();
            }
        }
        inner.state = RoomState::Idle;
        self.player_count.store(0, Ordering::Relaxed);
        info!(room_id = self.id, "Room dismissed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::session::WsSession;

    fn room() -> Arc<Room> {
        Arc::new(Room::new(1, BattleConfig::default()))
    }

    fn link(player_id: i32) -> SessionLink {
        WsSession::new(player_id).1
    }

    #[test]
    fn seats_are_assigned_in_order() {
        let room = room();
        let (first, seats) = room.admit(10, 1, link(10)).unwrap();
        assert_eq!(first, 1);
        assert!(seats.is_none());
        assert_eq!(room.state(), RoomState::Waiting);
        assert_eq!(room.score(), 2);

        let (second, seats) = room.admit(20, 1, link(20)).unwrap();
        assert_eq!(second, 2);
        let seats = seats.unwrap();
        assert_eq!(seats.len(), 2);
        assert_eq!(seats[1].player_id, 20);
        assert_eq!(room.state(), RoomState::InBattle);
        assert_eq!(room.score(), 0);
    }

    #[test]
    fn duplicate_and_late_players_are_rejected() {
        let room = room();
        room.admit(10, 1, link(10)).unwrap();
        assert_eq!(
            room.admit(10, 1, link(10)).unwrap_err(),
            AdmissionError::DuplicatePlayer
        );

        room.admit(20, 1, link(20)).unwrap();
        assert_eq!(
            room.admit(30, 1, link(30)).unwrap_err(),
            AdmissionError::RoomNotAcceptingPlayers
        );
        assert_eq!(
            AdmissionError::RoomNotAcceptingPlayers.err_code(),
            ErrCode::RoomNotAcceptingPlayers
        );
    }

    #[test]
    fn leaving_before_battle_frees_the_seat() {
        let room = room();
        room.admit(10, 1, link(10)).unwrap();
        room.on_player_disconnected(10);

        assert_eq!(room.state(), RoomState::Idle);
        assert_eq!(room.player_count(), 0);
        assert_eq!(room.disconnection_count(10), 1);
        assert_eq!(room.admit(20, 1, link(20)).unwrap().0, 1);
    }

    #[test]
    fn mid_battle_disconnect_marks_seat_inactive() {
        let room = room();
        room.admit(10, 1, link(10)).unwrap();
        room.admit(20, 1, link(20)).unwrap();
        assert_eq!(room.inactive_mask(), 0);

        room.on_player_disconnected(20);
        assert_eq!(room.inactive_mask(), 0b10);
        assert_eq!(room.player_count(), 1);
        assert_eq!(room.state(), RoomState::InBattle);
    }

    #[test]
    fn dismiss_cancels_sessions() {
        let room = room();
        let (session, link) = WsSession::new(10);
        let signal = link.cancel.clone();
        room.admit(10, 1, link).unwrap();

        room.dismiss();
        assert!(signal.is_cancelled());
        assert_eq!(room.state(), RoomState::Idle);
        assert_eq!(room.inactive_mask(), 0b11);

        // A session ending after dismissal still counts once
        room.on_player_disconnected(session.player_id);
        assert_eq!(room.disconnection_count(10), 1);
    }

    #[test]
    fn new_match_forgets_previous_disconnects() {
        let room = room();
        room.admit(10, 1, link(10)).unwrap();
        room.admit(20, 1, link(20)).unwrap();
        room.on_player_disconnected(10);
        room.on_player_disconnected(20);
        room.dismiss();
        assert_eq!(room.disconnection_count(10), 1);

        room.admit(30, 1, link(30)).unwrap();
        assert_eq!(room.disconnection_count(10), 0);
        assert_eq!(room.disconnection_count(20), 0);

        room.on_player_disconnected(30);
        assert_eq!(room.disconnection_count(30), 1);
    }

    #[tokio::test]
    async fn filling_the_room_starts_the_battle() {
        let room = room();
        let (_s1, l1) = WsSession::new(10);
        let (_s2, l2) = WsSession::new(20);

        assert_eq!(room.add_player_if_possible(10, 1, l1).unwrap(), 1);
        assert_eq!(room.add_player_if_possible(20, 1, l2).unwrap(), 2);
        assert_eq!(room.state(), RoomState::InBattle);

        room.on_player_disconnected(10);
        room.on_player_disconnected(20);
        assert_eq!(room.player_count(), 0);
    }
}
