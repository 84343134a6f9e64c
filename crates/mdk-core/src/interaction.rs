//! Nested interaction tracking.

use thiserror::Error;

/// Ordered interaction sequence numbers identifying a node in a session's
/// nesting tree, e.g. `[0, 2, 1]`.
pub type CausalPath = Vec<u32>;

/// Interaction stack error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InteractionError {
    #[error("Interaction stack underflow: finish_interaction called with no open interaction")]
    StackUnderflow,
}

#[derive(Debug, Clone, Default)]
struct Frame {
    /// Sequence number of this interaction under its parent.
    seq: u32,
    /// Children started under this interaction so far.
    children: u32,
    /// Index into the owning context's failure list.
    failure: Option<usize>,
}

/// Per-session ordered stack of open interactions.
///
/// A stack may continue from a `base` path inherited from another process. The
/// base is never popped: only interactions started locally can be finished.
#[derive(Debug, Clone, Default)]
pub struct InteractionStack {
    base: CausalPath,
    root: Frame,
    frames: Vec<Frame>,
}

impl InteractionStack {
    /// Create an empty stack rooted at the top of a fresh trace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stack whose first interaction nests under `base`.
    #[must_use]
    pub fn continuing(base: CausalPath) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    /// Push a new interaction and return its sequence number.
    ///
    /// The number equals the count of siblings already started under the
    /// current node, so the first child is `0`.
    pub fn start(&mut self) -> u32 {
        let parent = self.frames.last_mut().unwrap_or(&mut self.root);
        let seq = parent.children;
        parent.children = parent.children.saturating_add(1);
        self.frames.push(Frame {
            seq,
            ..Frame::default()
        });
        seq
    }

    /// Pop the innermost interaction.
    ///
    /// Returns the failure index recorded against it, if any.
    ///
    /// # Errors
    /// Returns `StackUnderflow` if no locally started interaction is open.
    pub fn finish(&mut self) -> Result<Option<usize>, InteractionError> {
        self.frames
            .pop()
            .map(|frame| frame.failure)
            .ok_or(InteractionError::StackUnderflow)
    }

    /// Full causal path of the current interaction, including the base.
    #[must_use]
    pub fn path(&self) -> CausalPath {
        self.base
            .iter()
            .copied()
            .chain(self.frames.iter().map(|f| f.seq))
            .collect()
    }

    /// Path inherited from a joined context.
    #[must_use]
    pub fn base(&self) -> &[u32] {
        &self.base
    }

    /// Nesting depth of the current interaction, base included.
    ///
    /// Always equal to `path().len()`.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.base.len() + self.frames.len()
    }

    /// Number of interactions started locally and not yet finished.
    #[must_use]
    pub fn local_depth(&self) -> usize {
        self.frames.len()
    }

    /// Failure recorded against the current interaction (or the session root).
    #[must_use]
    pub fn current_failure(&self) -> Option<usize> {
        self.frames.last().unwrap_or(&self.root).failure
    }

    pub(crate) fn mark_failed(&mut self, index: usize) {
        self.frames.last_mut().unwrap_or(&mut self.root).failure = Some(index);
    }
}
