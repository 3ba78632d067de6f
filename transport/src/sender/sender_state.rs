use std::sync::{Mutex, PoisonError};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};
use crate::member::Member;

/// Health of a destination as observed by the senders talking to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderState {
    #[default]
    Ready,
    /// a send failed, and the member is being retried
    Suspect,
    /// sends kept failing while the member was suspect
    Failing,
}

/// Sender state per member, shared by all senders of one pool manager
#[derive(Debug, Default)]
pub struct SenderStates {
    states: Mutex<FxHashMap<Member, SenderState>>,
}

impl SenderStates {
    pub fn new() -> SenderStates {
        Default::default()
    }

    pub fn get(&self, member: &Member) -> SenderState {
        self.lock()
            .get(member)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_ready(&self, member: Member) {
        let previous = self.lock().insert(member, SenderState::Ready);
        if matches!(previous, Some(SenderState::Suspect | SenderState::Failing)) {
            info!("{:?} is ready again", member);
        }
    }

    /// Records a failed send: a ready member becomes suspect, a suspect member becomes failing.
    pub fn record_failure(&self, member: Member) -> SenderState {
        let mut states = self.lock();
        let state = states.entry(member).or_default();
        *state = match *state {
            SenderState::Ready => {
                debug!("{:?} is now suspect", member);
                SenderState::Suspect
            }
            SenderState::Suspect | SenderState::Failing => {
                warn!("{:?} is failing", member);
                SenderState::Failing
            }
        };
        *state
    }

    pub fn remove(&self, member: &Member) {
        self.lock().remove(member);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<Member, SenderState>> {
        self.states.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
