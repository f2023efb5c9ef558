/// One of the two positions in a [`SessionPair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator = 0,
    Responder = 1,
}

impl Role {
    pub fn from_initiator(is_initiator: bool) -> Self {
        if is_initiator {
            Self::Initiator
        } else {
            Self::Responder
        }
    }

    pub fn is_initiator(self) -> bool {
        self == Self::Initiator
    }

    pub fn other(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A filled slot: who claimed it and the stream id they declared.
#[derive(Debug, Clone)]
pub struct Slot<O> {
    pub owner: O,
    pub remote_id: u64,
}

/// Two-slot rendezvous record for one token.
///
/// A filled slot is never overwritten; the first claim wins.
#[derive(Debug, Clone)]
pub struct SessionPair<O> {
    slots: [Option<Slot<O>>; 2],
}

impl<O> SessionPair<O> {
    pub fn new() -> Self {
        Self {
            slots: [None, None],
        }
    }

    pub fn slot(&self, role: Role) -> Option<&Slot<O>> {
        self.slots[role.index()].as_ref()
    }

    /// Fill `role` unless it is already taken. Returns whether the claim won.
    pub fn claim(&mut self, role: Role, owner: O, remote_id: u64) -> bool {
        let slot = &mut self.slots[role.index()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(Slot { owner, remote_id });
        true
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Filled slots with their roles.
    pub fn filled(&self) -> impl Iterator<Item = (Role, &Slot<O>)> {
        [Role::Initiator, Role::Responder]
            .into_iter()
            .filter_map(|role| self.slot(role).map(|slot| (role, slot)))
    }

    /// Split a complete pair into `(initiator, responder)`.
    pub fn into_complete(self) -> Option<(Slot<O>, Slot<O>)> {
        let [initiator, responder] = self.slots;
        Some((initiator?, responder?))
    }
}

impl<O> Default for SessionPair<O> {
    fn default() -> Self {
        Self::new()
    }
}
