//! Authoritative per-room battle task

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::battle::{Battle, BattleError};
use crate::util::time::{render_frame_duration, Timer, RENDER_FRAME_DURATION_MICROS};
use crate::ws::protocol::{
    ErrCode, WsReq, WsResp, DOWNSYNC_MSG_ACT_BATTLE_START, DOWNSYNC_MSG_ACT_BATTLE_STOPPED,
    DOWNSYNC_MSG_ACT_FORCED_RESYNC, DOWNSYNC_MSG_ACT_HB_REQ, DOWNSYNC_MSG_ACT_PLAYER_DISCONNECTED,
    UPSYNC_MSG_ACT_HB_PING, UPSYNC_MSG_ACT_PLAYER_CMD,
};

use super::snapshot::SnapshotBuilder;
use super::Room;

/// Channels of one seat, owned by the battle task
#[derive(Debug)]
pub(crate) struct RunnerSeat {
    pub player_id: i32,
    pub species_id: i32,
    pub join_index: usize,
    pub outbound_tx: mpsc::Sender<WsResp>,
    pub inbound_rx: mpsc::Receiver<WsReq>,
}

impl RunnerSeat {
    fn bit(&self) -> u64 {
        1u64 << (self.join_index - 1)
    }

    fn send(&self, room_id: i32, resp: WsResp) {
        match self.outbound_tx.try_send(resp) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(room_id, player_id = self.player_id, "Outbound queue full, dropping downsync");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(room_id, player_id = self.player_id, "Session writer gone");
            }
        }
    }
}

/// Drives one room's battle from start to stop
pub struct RoomRunner {
    room: Arc<Room>,
    battle: Battle,
    seats: Vec<RunnerSeat>,
    snapshots: SnapshotBuilder,
    inactive_mask: u64,
    /// Seats whose own input was confirmed from a wrong prediction
    resync_mask: u64,
}

impl RoomRunner {
    pub(crate) fn new(room: Arc<Room>, seats: Vec<RunnerSeat>) -> Result<Self, BattleError> {
        let cfg = room.config().clone();
        let snapshots = SnapshotBuilder::new(cfg.snapshot_interval_frames);
        Ok(Self {
            battle: Battle::new(cfg)?,
            room,
            seats,
            snapshots,
            inactive_mask: 0,
            resync_mask: 0,
        })
    }

    /// Run the authoritative frame loop, then dismiss the room
    pub async fn run(mut self) {
        let room_id = self.room.id();
        info!(room_id, "Battle started");

        match self.run_battle().await {
            Ok(()) => {
                info!(room_id, render_frame_id = self.battle.render_frame_id(), "Battle stopped");
                self.broadcast(WsResp::new(ErrCode::Ok, DOWNSYNC_MSG_ACT_BATTLE_STOPPED));
            }
            Err(e) => {
                error!(room_id, render_frame_id = self.battle.render_frame_id(), error = %e, "Battle aborted");
                self.broadcast(WsResp::new(ErrCode::UnknownError, DOWNSYNC_MSG_ACT_BATTLE_STOPPED));
            }
        }
        self.room.dismiss();
    }

    async fn run_battle(&mut self) -> Result<(), BattleError> {
        self.start()?;

        let mut frame_interval = interval(render_frame_duration());
        frame_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            frame_interval.tick().await;

            let timer = Timer::new();
            let running = self.step()?;
            let elapsed = timer.elapsed_micros();
            if elapsed > RENDER_FRAME_DURATION_MICROS {
                warn!(
                    room_id = self.room.id(),
                    render_frame_id = self.battle.render_frame_id(),
                    elapsed_micros = elapsed,
                    "Frame exceeded its time budget"
                );
            }
            if !running {
                return Ok(());
            }
        }
    }

    /// Seeds the battle and tells every seat the initial frame
    pub(crate) fn start(&mut self) -> Result<(), BattleError> {
        let seat_ids: Vec<(i32, i32)> = self
            .seats
            .iter()
            .map(|seat| (seat.player_id, seat.species_id))
            .collect();
        let initial = self.battle.initial_frame(&seat_ids);
        self.battle.start(&initial)?;
        self.broadcast(WsResp::room_frame(DOWNSYNC_MSG_ACT_BATTLE_START, initial));
        Ok(())
    }

    /// One authoritative render frame; `false` once the battle is over
    pub(crate) fn step(&mut self) -> Result<bool, BattleError> {
        self.process_upsyncs()?;
        self.refresh_inactive_mask()?;

        let all = self.battle.config().all_confirmed_mask();
        if self.inactive_mask & all == all {
            info!(room_id = self.room.id(), "All players left");
            return Ok(false);
        }

        self.confirm_inputs()?;
        self.battle.tick(None)?;
        self.send_resyncs();

        if self.snapshots.should_send() {
            if let Some(snapshot) = self.snapshots.build(&self.battle) {
                self.broadcast(snapshot);
            }
        }

        Ok(self.battle.render_frame_id() < self.battle.config().battle_duration_frames)
    }

    /// Drains every seat's inbound queue into the input buffer
    fn process_upsyncs(&mut self) -> Result<(), BattleError> {
        let room_id = self.room.id();

        for seat in self.seats.iter_mut() {
            while let Ok(req) = seat.inbound_rx.try_recv() {
                match req.act {
                    UPSYNC_MSG_ACT_PLAYER_CMD => {
                        for upsync in &req.input_frame_upsync_batch {
                            if upsync.input_frame_id < 0 {
                                warn!(
                                    room_id,
                                    player_id = seat.player_id,
                                    input_frame_id = upsync.input_frame_id,
                                    "Negative upsync frame id, dropping"
                                );
                                continue;
                            }
                            if !self.battle.is_within_input_window(upsync.input_frame_id) {
                                warn!(
                                    room_id,
                                    player_id = seat.player_id,
                                    input_frame_id = upsync.input_frame_id,
                                    "Upsync too far ahead, dropping"
                                );
                                continue;
                            }
                            let accepted = self.battle.on_input_upsync(
                                seat.join_index,
                                upsync.input_frame_id,
                                upsync.encoded,
                            )?;
                            if accepted {
                                continue;
                            }
                            let confirmed = self
                                .battle
                                .input_frame(upsync.input_frame_id)
                                .and_then(|f| f.input_list.get(seat.join_index - 1).copied());
                            if confirmed.is_some_and(|c| c != upsync.encoded) {
                                self.resync_mask |= seat.bit();
                            }
                        }
                    }
                    UPSYNC_MSG_ACT_HB_PING => {
                        seat.send(room_id, WsResp::new(ErrCode::Ok, DOWNSYNC_MSG_ACT_HB_REQ));
                    }
                    act => {
                        debug!(room_id, player_id = seat.player_id, act, "Ignoring unknown upsync act");
                    }
                }
            }
        }
        Ok(())
    }

    /// Picks up seats that disconnected since the previous frame
    fn refresh_inactive_mask(&mut self) -> Result<(), BattleError> {
        let mask = self.room.inactive_mask();
        let newly_inactive = mask & !self.inactive_mask;
        self.inactive_mask = mask;
        if newly_inactive == 0 {
            return Ok(());
        }

        for join_index in self.seats.iter().map(|seat| seat.join_index) {
            let bit = 1u64 << (join_index - 1);
            if newly_inactive & bit == 0 {
                continue;
            }
            self.battle.on_seat_disconnected(join_index)?;
            let notice = WsResp {
                peer_join_index: join_index,
                ..WsResp::new(ErrCode::Ok, DOWNSYNC_MSG_ACT_PLAYER_DISCONNECTED)
            };
            self.broadcast(notice);
        }
        self.snapshots.force_next();
        Ok(())
    }

    /// Confirms what every active seat sent, then forces seats lagging past
    /// the tolerance, and broadcasts the newly confirmed frames
    fn confirm_inputs(&mut self) -> Result<(), BattleError> {
        let advanced = self.battle.advance_all_confirmed(self.inactive_mask);

        let tolerance = self.battle.config().input_frame_upsync_delay_tolerance;
        let delayed = self.battle.delayed_input_frame_id(self.battle.render_frame_id());
        let forced = if delayed - self.battle.last_all_confirmed_input_frame_id() > tolerance {
            let forced = self.battle.force_confirm_up_to(delayed - tolerance)?;
            if let Some((from, to)) = forced {
                debug!(room_id = self.room.id(), from, to, "Force confirmed lagging inputs");
            }
            forced
        } else {
            None
        };

        let confirmed = match (advanced, forced) {
            (Some((from, _)), Some((_, to))) => Some((from, to)),
            (advanced, forced) => advanced.or(forced),
        };
        let Some((from, to)) = confirmed else {
            return Ok(());
        };

        let batch: Vec<_> = (from..=to)
            .filter_map(|id| self.battle.input_frame(id).cloned())
            .collect();
        self.broadcast(WsResp::input_batch(batch));
        Ok(())
    }

    fn send_resyncs(&mut self) {
        if self.resync_mask == 0 {
            return;
        }
        let frame_id = self.battle.last_confirmed_render_frame_id();
        if let Some(rdf) = self.battle.render_frame(frame_id) {
            for seat in &self.seats {
                if self.resync_mask & seat.bit() != 0 && self.inactive_mask & seat.bit() == 0 {
                    info!(room_id = self.room.id(), player_id = seat.player_id, frame_id, "Forcing resync");
                    seat.send(
                        self.room.id(),
                        WsResp::room_frame(DOWNSYNC_MSG_ACT_FORCED_RESYNC, rdf.clone()),
                    );
                }
            }
        }
        self.resync_mask = 0;
    }

    fn broadcast(&self, resp: WsResp) {
        let room_id = self.room.id();
        for seat in &self.seats {
            if self.inactive_mask & seat.bit() == 0 {
                seat.send(room_id, resp.clone());
            }
        }
    }
}
