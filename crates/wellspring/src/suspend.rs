//! Suspend-cause accounting
//!
//! Suspension is negotiated by independent subsystems that don't know about
//! each other: the user, a client application, the idle reaper, session
//! management. Each holds the source suspended for its own reason, and the
//! source resumes observably only once every holder has let go.
//!
//! Causes are reference-counted per tag rather than a plain bit set, so a
//! subsystem that requests suspension twice must also release it twice.

/// Why a source is being held suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendCause {
    /// Explicit user request
    User,
    /// A client application asked for it
    Application,
    /// Idle timeout
    Idle,
    /// Session manager (e.g. seat switched away)
    Session,
    /// Internal housekeeping (profile switch, port probe)
    Internal,
}

impl SuspendCause {
    const COUNT: usize = 5;

    fn slot(self) -> usize {
        match self {
            SuspendCause::User => 0,
            SuspendCause::Application => 1,
            SuspendCause::Idle => 2,
            SuspendCause::Session => 3,
            SuspendCause::Internal => 4,
        }
    }
}

/// Per-cause suspension counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuspendCauses {
    counts: [u32; SuspendCause::COUNT],
}

impl SuspendCauses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more hold for `cause`
    pub fn set(&mut self, cause: SuspendCause) {
        self.counts[cause.slot()] = self.counts[cause.slot()].saturating_add(1);
    }

    /// Release one hold for `cause`; releasing an unheld cause is a no-op
    pub fn clear(&mut self, cause: SuspendCause) {
        self.counts[cause.slot()] = self.counts[cause.slot()].saturating_sub(1);
    }

    /// Whether `cause` currently holds the source suspended
    pub fn holds(&self, cause: SuspendCause) -> bool {
        self.counts[cause.slot()] > 0
    }

    /// Suspended ⇔ any cause is held
    pub fn any(&self) -> bool {
        self.counts.iter().any(|&c| c > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_not_suspended() {
        assert!(!SuspendCauses::new().any());
    }

    #[test]
    fn double_set_single_clear_stays_held() {
        let mut c = SuspendCauses::new();
        c.set(SuspendCause::Idle);
        c.set(SuspendCause::Idle);
        c.clear(SuspendCause::Idle);
        assert!(c.any());
        assert!(c.holds(SuspendCause::Idle));
        c.clear(SuspendCause::Idle);
        assert!(!c.any());
    }

    #[test]
    fn clear_unheld_is_noop() {
        let mut c = SuspendCauses::new();
        c.clear(SuspendCause::User);
        assert!(!c.any());
        c.set(SuspendCause::User);
        assert!(c.any());
    }

    #[test]
    fn causes_are_independent() {
        let mut c = SuspendCauses::new();
        c.set(SuspendCause::User);
        c.set(SuspendCause::Session);
        c.clear(SuspendCause::User);
        assert!(c.any());
        assert!(!c.holds(SuspendCause::User));
        assert!(c.holds(SuspendCause::Session));
        c.clear(SuspendCause::Session);
        assert!(!c.any());
    }
}
