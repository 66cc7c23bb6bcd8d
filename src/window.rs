/// Sliding replay window for DTLS record sequence numbers.
///
/// Maintains the latest accepted sequence number and a 64-bit bitmap of the
/// last 64 seen sequence numbers to reject duplicates and old records
/// (RFC 6347 §4.1.2.6).
#[derive(Debug, Default)]
pub struct ReplayWindow {
    max_seq: u64,
    window: u64,
    any_seen: bool,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seqno` would be accepted, without changing any state.
    ///
    /// Replay detection runs before MAC validation; the window itself is
    /// only advanced by [`ReplayWindow::mark_seen`] after the record has
    /// decrypted successfully.
    pub fn is_fresh(&self, seqno: u64) -> bool {
        if !self.any_seen || seqno > self.max_seq {
            return true;
        }
        let offset = self.max_seq - seqno;
        if offset >= 64 {
            return false; // too old
        }
        (self.window & (1u64 << offset)) == 0
    }

    /// Record `seqno` as seen, advancing the window as needed.
    pub fn mark_seen(&mut self, seqno: u64) {
        if !self.any_seen {
            self.any_seen = true;
            self.max_seq = seqno;
            self.window = 1;
            return;
        }
        if seqno > self.max_seq {
            let delta = seqno - self.max_seq;
            if delta > 63 {
                // Jump exceeds window size: clear entirely, only newest is seen
                self.window = 1;
            } else {
                self.window <<= delta;
                self.window |= 1;
            }
            self.max_seq = seqno;
        } else {
            let offset = self.max_seq - seqno;
            if offset < 64 {
                self.window |= 1u64 << offset;
            }
        }
    }
}

/// Replay state scoped to the session's read epoch.
///
/// Bumping the read epoch discards the previous epoch's window; detection
/// is per `(session, read_epoch)`.
#[derive(Debug, Default)]
pub struct EpochWindow {
    epoch: u16,
    window: ReplayWindow,
}

impl EpochWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fresh(&self, epoch: u16, seqno: u64) -> bool {
        epoch == self.epoch && self.window.is_fresh(seqno)
    }

    pub fn mark_seen(&mut self, epoch: u16, seqno: u64) {
        if epoch != self.epoch {
            return;
        }
        self.window.mark_seen(seqno);
    }

    pub fn advance_epoch(&mut self, epoch: u16) {
        if epoch > self.epoch {
            self.epoch = epoch;
            self.window = ReplayWindow::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_and_update(w: &mut ReplayWindow, seqno: u64) -> bool {
        let fresh = w.is_fresh(seqno);
        if fresh {
            w.mark_seen(seqno);
        }
        fresh
    }

    #[test]
    fn accepts_fresh_and_rejects_duplicate() {
        let mut w = ReplayWindow::new();
        assert!(check_and_update(&mut w, 1));
        assert!(!check_and_update(&mut w, 1)); // duplicate
        assert!(check_and_update(&mut w, 2)); // next fresh
    }

    #[test]
    fn accepts_sequence_zero_first() {
        let mut w = ReplayWindow::new();
        assert!(check_and_update(&mut w, 0));
        assert!(!check_and_update(&mut w, 0));
    }

    #[test]
    fn accepts_out_of_order_within_window() {
        let mut w = ReplayWindow::new();
        assert!(check_and_update(&mut w, 10)); // establish max=10
        assert!(check_and_update(&mut w, 8)); // unseen within 64
        assert!(!check_and_update(&mut w, 8)); // duplicate now
        assert!(check_and_update(&mut w, 9)); // unseen within 64
    }

    #[test]
    fn rejects_too_old() {
        let mut w = ReplayWindow::new();
        assert!(check_and_update(&mut w, 100));
        // offset = 64 -> too old
        assert!(!check_and_update(&mut w, 36));
        // offset = 63 -> allowed once
        assert!(check_and_update(&mut w, 37));
    }

    #[test]
    fn handles_large_jump_and_window_shift() {
        let mut w = ReplayWindow::new();
        assert!(check_and_update(&mut w, 1));
        // Large forward jump clears the window entirely
        assert!(check_and_update(&mut w, 80));
        // Within window of new max and unseen
        assert!(check_and_update(&mut w, 79));
        // Too old relative to new max
        assert!(!check_and_update(&mut w, 15));
    }

    #[test]
    fn peek_does_not_advance() {
        let mut w = ReplayWindow::new();
        assert!(w.is_fresh(5));
        assert!(w.is_fresh(5)); // still fresh, nothing marked
        w.mark_seen(5);
        assert!(!w.is_fresh(5));
    }

    #[test]
    fn epoch_window_scopes_by_epoch() {
        let mut w = EpochWindow::new();
        w.advance_epoch(1);
        assert!(w.is_fresh(1, 5));
        w.mark_seen(1, 5);
        assert!(!w.is_fresh(1, 5));
        // Wrong epoch is never fresh here; the router drops it earlier.
        assert!(!w.is_fresh(0, 5));
        // Epoch bump resets the bitmap.
        w.advance_epoch(2);
        assert!(w.is_fresh(2, 5));
    }
}
