//! Input prediction and ingestion of confirmed inputs

use tracing::debug;

use super::downsync::InputFrameDownsync;
use super::{Battle, BattleError};

impl Battle {
    /// Gets or predicts input frame `input_frame_id` on a client, returning
    /// the self seat's `(previous, current)` input.
    ///
    /// With `can_confirm_self` the self seat's slot takes `local_input` and its
    /// bit is confirmed on an existing frame.
    pub fn resolve_input(
        &mut self,
        input_frame_id: i32,
        can_confirm_self: bool,
        local_input: u64,
    ) -> Result<(u64, u64), BattleError> {
        let join_index = self.self_join_index.ok_or(BattleError::SelfPlayerMissing)?;
        let self_k = join_index - 1;
        let self_bit = 1u64 << self_k;

        let prev_self_input = self
            .input_buffer
            .get_by_frame_id(input_frame_id - 1)
            .and_then(|f| f.input_list.get(self_k).copied())
            .unwrap_or(0);

        if let Some(existing) = self.input_buffer.get_mut_by_frame_id(input_frame_id) {
            if !can_confirm_self {
                let curr = existing.input_list.get(self_k).copied().unwrap_or(0);
                return Ok((prev_self_input, curr));
            }
            existing.input_list[self_k] = local_input;
            existing.confirmed_list |= self_bit;
            return Ok((prev_self_input, local_input));
        }

        self.predict_into_prefabbed(input_frame_id);
        let curr_self_input = if can_confirm_self {
            local_input
        } else {
            self.prefabbed_input_list[self_k]
        };
        self.prefabbed_input_list[self_k] = curr_self_input;
        self.fill_gaps_up_to(input_frame_id, 0)?;

        Ok((prev_self_input, curr_self_input))
    }

    /// Predicts input frame `input_frame_id` for every seat, server side
    pub fn prefab_input_frame(&mut self, input_frame_id: i32) -> Result<(), BattleError> {
        if self.input_buffer.get_by_frame_id(input_frame_id).is_some() {
            return Ok(());
        }
        self.predict_into_prefabbed(input_frame_id);
        self.fill_gaps_up_to(input_frame_id, 0)
    }

    /// Carries forward each seat's last confirmed input, masked to the predictable bits
    fn predict_into_prefabbed(&mut self, input_frame_id: i32) {
        let mask = self.cfg.predictable_input_mask;
        let previous = self.input_buffer.get_by_frame_id(input_frame_id - 1);
        for (k, slot) in self.prefabbed_input_list.iter_mut().enumerate() {
            *slot = if self.last_individually_confirmed_input_frame_id[k] <= input_frame_id {
                self.last_individually_confirmed_input_list[k] & mask
            } else {
                previous
                    .and_then(|f| f.input_list.get(k).copied())
                    .unwrap_or(0)
                    & mask
            };
        }
    }

    /// Appends frames up to and including `input_frame_id`, stamped with the prefabbed list
    fn fill_gaps_up_to(&mut self, input_frame_id: i32, confirmed_list: u64) -> Result<(), BattleError> {
        while self.input_buffer.ed_frame_id() <= input_frame_id {
            let gap_input_frame_id = self.input_buffer.ed_frame_id();
            let slot = self.input_buffer.dry_put()?;
            slot.stamp(gap_input_frame_id, &self.prefabbed_input_list, confirmed_list);
        }
        Ok(())
    }

    /// Re-predicts seat `k`'s unconfirmed slots after `from_input_frame_id`
    fn repredict_seat_after(&mut self, k: usize, from_input_frame_id: i32) {
        let bit = 1u64 << k;
        let predicted = self.last_individually_confirmed_input_list[k] & self.cfg.predictable_input_mask;
        let st = from_input_frame_id.max(self.last_individually_confirmed_input_frame_id[k]) + 1;
        let mut first_changed = None;

        for input_frame_id in st..self.input_buffer.ed_frame_id() {
            let Some(frame) = self.input_buffer.get_mut_by_frame_id(input_frame_id) else {
                continue;
            };
            if frame.confirmed_list & bit != 0 || frame.input_list[k] == predicted {
                continue;
            }
            frame.input_list[k] = predicted;
            first_changed.get_or_insert(input_frame_id);
        }

        if let Some(input_frame_id) = first_changed {
            self.rewind_chaser_for(input_frame_id);
        }
    }

    /// Whether an upsynced input frame id lies within one input buffer of the confirmed frontier
    pub fn is_within_input_window(&self, input_frame_id: i32) -> bool {
        let ahead = i64::from(input_frame_id) - i64::from(self.last_all_confirmed_input_frame_id);
        input_frame_id >= 0 && ahead < self.cfg.input_buffer_size() as i64
    }

    /// Stores one seat's upsynced input on the server.
    ///
    /// Returns `false` when the input arrives after its frame was confirmed
    /// or too far ahead of the confirmed frontier to be buffered.
    pub fn on_input_upsync(
        &mut self,
        join_index: usize,
        input_frame_id: i32,
        encoded: u64,
    ) -> Result<bool, BattleError> {
        let k = self.seat(join_index)?;
        if !self.is_within_input_window(input_frame_id)
            || input_frame_id <= self.last_all_confirmed_input_frame_id
            || input_frame_id < self.input_buffer.st_frame_id()
        {
            return Ok(false);
        }
        self.prefab_input_frame(input_frame_id)?;

        let bit = 1u64 << k;
        let frame = self
            .input_buffer
            .get_mut_by_frame_id(input_frame_id)
            .ok_or(BattleError::InputFrameMissing(input_frame_id))?;
        if frame.confirmed_list & bit != 0 {
            return Ok(false);
        }
        let mispredicted = frame.input_list[k] != encoded;
        frame.input_list[k] = encoded;
        frame.confirmed_list |= bit;

        if input_frame_id > self.last_individually_confirmed_input_frame_id[k] {
            self.last_individually_confirmed_input_frame_id[k] = input_frame_id;
            self.last_individually_confirmed_input_list[k] = encoded;
        }
        if mispredicted {
            self.rewind_chaser_for(input_frame_id);
        }
        self.repredict_seat_after(k, input_frame_id);
        Ok(true)
    }

    /// Confirms every consecutive frame whose missing bits all belong to `inactive_mask`.
    ///
    /// Returns the inclusive range of newly confirmed input frame ids.
    pub fn advance_all_confirmed(&mut self, inactive_mask: u64) -> Option<(i32, i32)> {
        let all = self.cfg.all_confirmed_mask();
        let from = self.last_all_confirmed_input_frame_id + 1;
        let mut input_frame_id = from;
        while let Some(frame) = self.input_buffer.get_mut_by_frame_id(input_frame_id) {
            if (frame.confirmed_list | inactive_mask) & all != all {
                break;
            }
            frame.confirmed_list = all;
            input_frame_id += 1;
        }
        if input_frame_id == from {
            return None;
        }
        self.last_all_confirmed_input_frame_id = input_frame_id - 1;
        Some((from, input_frame_id - 1))
    }

    /// Confirms the current predictions of every frame up to `input_frame_id`
    pub fn force_confirm_up_to(&mut self, input_frame_id: i32) -> Result<Option<(i32, i32)>, BattleError> {
        if input_frame_id <= self.last_all_confirmed_input_frame_id {
            return Ok(None);
        }
        self.prefab_input_frame(input_frame_id)?;

        let all = self.cfg.all_confirmed_mask();
        let from = (self.last_all_confirmed_input_frame_id + 1).max(self.input_buffer.st_frame_id());
        for id in from..=input_frame_id {
            let frame = self
                .input_buffer
                .get_mut_by_frame_id(id)
                .ok_or(BattleError::InputFrameMissing(id))?;
            frame.confirmed_list = all;
        }
        self.last_all_confirmed_input_frame_id = input_frame_id;
        Ok(Some((from, input_frame_id)))
    }

    /// Stops waiting for a seat: it idles from the first unconfirmed frame on
    pub fn on_seat_disconnected(&mut self, join_index: usize) -> Result<(), BattleError> {
        let k = self.seat(join_index)?;
        self.last_individually_confirmed_input_list[k] = 0;
        self.repredict_seat_after(k, self.last_all_confirmed_input_frame_id);
        Ok(())
    }

    /// Merges a batch of server-confirmed frames on a client
    pub fn on_input_frame_downsync_batch(
        &mut self,
        batch: &[InputFrameDownsync],
    ) -> Result<(), BattleError> {
        let capacity = self.cfg.room_capacity;
        let all = self.cfg.all_confirmed_mask();

        for ifd in batch {
            let input_frame_id = ifd.input_frame_id;
            if input_frame_id <= self.last_all_confirmed_input_frame_id {
                continue;
            }
            if ifd.input_list.len() != capacity {
                return Err(BattleError::MalformedFrame(input_frame_id));
            }
            if input_frame_id < self.input_buffer.st_frame_id() {
                self.last_all_confirmed_input_frame_id = input_frame_id;
                continue;
            }

            if input_frame_id > self.input_buffer.ed_frame_id() {
                self.predict_into_prefabbed(input_frame_id - 1);
                self.fill_gaps_up_to(input_frame_id - 1, 0)?;
            }
            let mispredicted = self
                .input_buffer
                .get_by_frame_id(input_frame_id)
                .map(|local| local.input_list != ifd.input_list)
                .unwrap_or(false);

            let slot = self.input_buffer.dry_set_by_frame_id(input_frame_id)?;
            slot.stamp(input_frame_id, &ifd.input_list, all);

            for k in 0..capacity {
                if input_frame_id > self.last_individually_confirmed_input_frame_id[k] {
                    self.last_individually_confirmed_input_frame_id[k] = input_frame_id;
                    self.last_individually_confirmed_input_list[k] = ifd.input_list[k];
                }
            }
            self.last_all_confirmed_input_frame_id = input_frame_id;

            if mispredicted {
                debug!(input_frame_id, "confirmed input differs from prediction");
                self.rewind_chaser_for(input_frame_id);
            }
        }

        let last_all = self.last_all_confirmed_input_frame_id;
        for k in 0..capacity {
            if Some(k + 1) != self.self_join_index {
                self.repredict_seat_after(k, last_all);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::battle::downsync::{encode_input, InputFrameDownsync};
    use crate::battle::{Battle, BattleError};
    use crate::config::BattleConfig;

    fn client_battle(self_join_index: usize) -> Battle {
        let mut battle = Battle::new(BattleConfig::default()).unwrap();
        battle.bind_self(self_join_index).unwrap();
        let initial = battle.initial_frame(&[(10, 1), (20, 1)]);
        battle.start(&initial).unwrap();
        battle
    }

    fn confirmed(input_frame_id: i32, input_list: &[u64]) -> InputFrameDownsync {
        InputFrameDownsync {
            input_frame_id,
            input_list: input_list.to_vec(),
            confirmed_list: 0b11,
        }
    }

    #[test]
    fn test_resolve_input_without_self_fails() {
        let mut battle = Battle::new(BattleConfig::default()).unwrap();
        assert!(matches!(
            battle.resolve_input(0, true, 1),
            Err(BattleError::SelfPlayerMissing)
        ));
    }

    #[test]
    fn test_prediction_masks_button_bits() {
        let mut battle = client_battle(1);
        let peer_input = encode_input(3, true, true);
        battle
            .on_input_frame_downsync_batch(&[confirmed(0, &[0, peer_input])])
            .unwrap();

        let (prev, curr) = battle.resolve_input(1, true, 5).unwrap();
        assert_eq!((prev, curr), (0, 5));

        let frame = battle.input_frame(1).unwrap();
        assert_eq!(frame.input_list, vec![5, 3]);
        assert_eq!(frame.confirmed_list, 0);
    }

    #[test]
    fn test_gaps_are_filled_with_the_same_prediction() {
        let mut battle = client_battle(2);
        battle
            .on_input_frame_downsync_batch(&[confirmed(0, &[encode_input(4, false, true), 0])])
            .unwrap();

        battle.resolve_input(4, true, 1).unwrap();
        for id in 1..=4 {
            let frame = battle.input_frame(id).unwrap();
            assert_eq!(frame.input_frame_id, id);
            assert_eq!(frame.input_list, vec![4, 1]);
        }
    }

    #[test]
    fn test_existing_frame_returns_stored_self_input() {
        let mut battle = client_battle(1);
        battle.resolve_input(0, true, 7).unwrap();

        let (_, curr) = battle.resolve_input(0, false, 99).unwrap();
        assert_eq!(curr, 7);

        let (_, curr) = battle.resolve_input(0, true, 8).unwrap();
        assert_eq!(curr, 8);
        let frame = battle.input_frame(0).unwrap();
        assert_eq!(frame.input_list[0], 8);
        assert_eq!(frame.confirmed_list & 0b1, 0b1);

        let (prev, _) = battle.resolve_input(1, true, 2).unwrap();
        assert_eq!(prev, 8);
    }

    #[test]
    fn test_history_is_predicted_from_previous_slot() {
        let mut battle = client_battle(1);
        battle
            .on_input_frame_downsync_batch(&[confirmed(0, &[0, encode_input(2, false, false)])])
            .unwrap();
        battle.resolve_input(1, true, 0).unwrap();
        battle
            .on_input_frame_downsync_batch(&[confirmed(5, &[0, encode_input(1, false, false)])])
            .unwrap();

        // Frames 2..=4 came from gap filling before frame 5 was stored
        assert_eq!(battle.input_frame(3).unwrap().input_list[1], 2);
        assert_eq!(battle.input_frame(5).unwrap().input_list[1], 1);
        assert_eq!(battle.last_all_confirmed_input_frame_id(), 5);
    }

    #[test]
    fn test_downsync_misprediction_rewinds_chaser() {
        let mut battle = client_battle(1);
        for _ in 0..30 {
            battle.tick(Some(0)).unwrap();
        }
        assert_eq!(battle.chaser_render_frame_id(), 29);

        battle
            .on_input_frame_downsync_batch(&[confirmed(1, &[0, encode_input(3, false, false)])])
            .unwrap();
        // Frame 0 was never confirmed, but frame 1 disagrees with its prediction
        assert_eq!(battle.chaser_render_frame_id(), battle.first_used_render_frame_id(1));

        battle
            .on_input_frame_downsync_batch(&[confirmed(2, &[0, encode_input(3, false, false)])])
            .unwrap();
        assert_eq!(battle.chaser_render_frame_id(), battle.first_used_render_frame_id(1));
    }

    #[test]
    fn test_server_confirmation_and_force_confirm() {
        let mut battle = Battle::new(BattleConfig::default()).unwrap();
        let initial = battle.initial_frame(&[(10, 1), (20, 1)]);
        battle.start(&initial).unwrap();

        assert!(battle.on_input_upsync(1, 0, 3).unwrap());
        assert_eq!(battle.advance_all_confirmed(0), None);
        assert!(battle.on_input_upsync(2, 0, 4).unwrap());
        assert!(!battle.on_input_upsync(2, 0, 4).unwrap());
        assert_eq!(battle.advance_all_confirmed(0), Some((0, 0)));
        assert!(!battle.on_input_upsync(1, 0, 1).unwrap());

        // Seat 2 is gone, seat 1 alone confirms frames
        assert!(battle.on_input_upsync(1, 1, 3).unwrap());
        assert!(battle.on_input_upsync(1, 2, 3).unwrap());
        assert_eq!(battle.advance_all_confirmed(0b10), Some((1, 2)));

        assert_eq!(battle.force_confirm_up_to(5).unwrap(), Some((3, 5)));
        assert_eq!(battle.last_all_confirmed_input_frame_id(), 5);
        let frame = battle.input_frame(5).unwrap();
        assert_eq!(frame.confirmed_list, 0b11);
        // Seat 1 carried forward, seat 2 carried forward its last confirmed input
        assert_eq!(frame.input_list, vec![3, 4]);
        assert_eq!(battle.force_confirm_up_to(4).unwrap(), None);
    }

    #[test]
    fn test_upsync_outside_input_window_is_refused() {
        let mut battle = Battle::new(BattleConfig::default()).unwrap();
        let initial = battle.initial_frame(&[(10, 1), (20, 1)]);
        battle.start(&initial).unwrap();
        let edge = battle.last_all_confirmed_input_frame_id()
            + battle.config().input_buffer_size() as i32;

        for input_frame_id in [i32::MAX, i32::MIN, -1, edge] {
            assert!(!battle.is_within_input_window(input_frame_id));
            assert!(!battle.on_input_upsync(1, input_frame_id, 3).unwrap());
        }
        assert!(battle.input_frame(0).is_none());

        assert!(battle.is_within_input_window(edge - 1));
        assert!(battle.on_input_upsync(1, edge - 1, 3).unwrap());
        assert!(battle.input_frame(edge - 1).is_some());
    }

    #[test]
    fn test_disconnected_seat_idles() {
        let mut battle = Battle::new(BattleConfig::default()).unwrap();
        let initial = battle.initial_frame(&[(10, 1), (20, 1)]);
        battle.start(&initial).unwrap();

        battle.on_input_upsync(2, 0, 3).unwrap();
        battle.prefab_input_frame(3).unwrap();
        assert_eq!(battle.input_frame(3).unwrap().input_list[1], 3);

        battle.on_seat_disconnected(2).unwrap();
        assert_eq!(battle.input_frame(3).unwrap().input_list[1], 0);
        assert_eq!(battle.input_frame(0).unwrap().input_list[1], 3);
        assert!(matches!(
            battle.on_seat_disconnected(3),
            Err(BattleError::InvalidJoinIndex(3))
        ));
    }
}
