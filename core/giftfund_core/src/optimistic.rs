//! Optimistic local updates with exact rollback.
//!
//! A mutation is projected locally before the server answers. The
//! pre-mutation snapshot is retained so a rejection restores it exactly,
//! with no partial merge of the projected state.

/// Outcome of reconciling a projected state with the server response.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled<S, E> {
    /// Server accepted; holds the authoritative state.
    Committed(S),
    /// Server rejected; `previous` is the snapshot from before the mutation.
    RolledBack { error: E, previous: S },
}

impl<S, E> Reconciled<S, E> {
    pub fn state(&self) -> &S {
        match self {
            Self::Committed(s) => s,
            Self::RolledBack { previous, .. } => previous,
        }
    }

    pub fn into_state(self) -> S {
        match self {
            Self::Committed(s) => s,
            Self::RolledBack { previous, .. } => previous,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Committed(_) => None,
            Self::RolledBack { error, .. } => Some(error),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// A speculative state awaiting server confirmation.
#[derive(Debug, Clone)]
pub struct Optimistic<S> {
    previous: S,
    projected: S,
}

impl<S: Clone> Optimistic<S> {
    /// Snapshot `current` and apply `mutate` to a copy.
    pub fn apply(current: &S, mutate: impl FnOnce(&mut S)) -> Self {
        let previous = current.clone();
        let mut projected = current.clone();
        mutate(&mut projected);
        Self { previous, projected }
    }

    /// What the UI shows while the request is in flight.
    pub fn projected(&self) -> &S {
        &self.projected
    }

    /// Resolve against the server response. On success the server's state
    /// wins over the projection.
    pub fn reconcile<E>(self, outcome: Result<S, E>) -> Reconciled<S, E> {
        match outcome {
            Ok(state) => Reconciled::Committed(state),
            Err(error) => Reconciled::RolledBack {
                error,
                previous: self.previous,
            },
        }
    }
}
