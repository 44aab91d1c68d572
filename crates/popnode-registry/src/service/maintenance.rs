use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::domain::{Announcement, BlockHeight, Hash, NodeEntry, OutboundAction, PayeeScript, Timestamp};
use crate::service::PopnodeRegistry;

fn last_activity(entry: &NodeEntry) -> Timestamp {
    entry.last_ping_time().max(entry.sig_time)
}

impl PopnodeRegistry {
    /// Periodic sweep.
    ///
    /// Call from a timer task at `sweep_interval_secs`. Re-checks every
    /// entry, removes spent and long-dead ones, drives recovery, expires the
    /// throttle, verification and seen tables, and runs the index rebuild
    /// policy. Membership listeners are notified after the lock is released.
    ///
    /// Returns the relays produced by recoveries applied in this sweep.
    pub fn check_and_remove(&self) -> Vec<OutboundAction> {
        if !self.chain.is_list_synced() {
            debug!("[popnode] list not synced, sweep skipped");
            return Vec::new();
        }

        let now = self.now();
        let config = &self.config;
        let actions = {
            let mut state = self.state.lock();
            let st = &mut *state;

            self.check_all_locked(st, now, false);

            let grace = config.new_start_required_secs + config.new_start_removal_grace_secs;
            let removed = st.remove_where(|e| {
                e.is_outpoint_spent()
                    || (e.is_new_start_required() && now - last_activity(e) > grace)
            });
            for entry in &removed {
                st.seen
                    .remove_announcement(&Announcement::from_entry(entry).hash());
                st.throttle.forget_entry(&entry.identity);
                info!(
                    "[popnode] removed {} ({}), {} entries left",
                    entry.identity,
                    entry.state,
                    st.len()
                );
            }

            self.schedule_recoveries_locked(st, now);
            let actions = self.process_recovery_windows_locked(st, now);

            st.throttle.expire(now);

            let min_height = st
                .tip_height()
                .map(|tip| tip.saturating_sub(config.max_pose_blocks))
                .unwrap_or(0);
            for addr in st.verifications.expire(
                now,
                config.verification_request_expiry_secs,
                min_height,
            ) {
                debug!("[popnode] verification of {} timed out", addr);
            }
            st.seen.expire_verifications(min_height);
            st.seen.expire_pings(now, config.new_start_required_secs);
            let live: HashSet<Hash> = st
                .entries()
                .iter()
                .map(|e| Announcement::from_entry(e).hash())
                .collect();
            let dropped = st
                .seen
                .expire_announcements(now, config.new_start_required_secs, &live);
            if dropped > 0 {
                debug!("[popnode] {} orphaned seen announcements dropped", dropped);
            }

            st.rebuild_index_if_needed(now, config);

            info!("[popnode] {}", st);
            actions
        };

        self.notify_updates();
        actions
    }

    /// Run the index rebuild policy outside a sweep.
    pub fn check_and_rebuild_index(&self) -> bool {
        let now = self.now();
        self.state.lock().rebuild_index_if_needed(now, &self.config)
    }

    /// Report and reset the change flags to the membership listeners.
    pub fn notify_updates(&self) {
        let (added, removed) = {
            let mut st = self.state.lock();
            let flags = (st.added, st.removed);
            st.added = false;
            st.removed = false;
            flags
        };
        if !added && !removed {
            return;
        }
        for listener in self.listeners.read().iter() {
            listener.on_membership_changed(added, removed);
        }
    }

    /// Chain tip notification: record the tip, penalize duplicate
    /// addresses, refresh last-paid data.
    pub fn ledger_tip_changed(&self, height: BlockHeight, block_hash: Hash) {
        self.state.lock().tip = Some((height, block_hash));
        debug!("[popnode] tip changed to {}", height);
        self.check_same_addr();
        self.update_last_paid();
    }

    /// Scan the last `last_paid_scan_blocks` blocks for popnode payments.
    pub fn update_last_paid(&self) {
        let Some(tip) = self.state.lock().tip_height() else {
            return;
        };

        // Newest payment per payee; chain reads happen outside the lock.
        let mut paid: HashMap<PayeeScript, (BlockHeight, Timestamp)> = HashMap::new();
        let oldest = tip.saturating_sub(self.config.last_paid_scan_blocks.saturating_sub(1));
        for height in (oldest..=tip).rev() {
            if let Some(payee) = self.chain.duty_payee(height) {
                paid.entry(payee).or_insert_with(|| {
                    (height, self.chain.block_time(height).unwrap_or(0))
                });
            }
        }
        if paid.is_empty() {
            return;
        }

        let mut st = self.state.lock();
        let mut updated = 0;
        for entry in st.entries_mut() {
            if let Some((height, time)) = paid.get(&entry.payee()) {
                if *height > entry.last_paid_block {
                    entry.last_paid_block = *height;
                    entry.last_paid_time = *time;
                    updated += 1;
                }
            }
        }
        debug!("[popnode] last paid refreshed for {} entries", updated);
    }
}
