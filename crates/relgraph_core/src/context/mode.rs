//! Internal mode guard.

use super::EntityContext;
use std::ops::{Deref, DerefMut};

/// Whether context operations have user-visible side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Events are emitted, reads fetch lazily and reference edits are tracked.
    #[default]
    User,
    /// System operation: no events, no implicit fetches, no edit tracking.
    Internal,
}

/// Holds a context in internal mode until dropped.
///
/// The previous mode is restored on drop, so guards nest.
pub struct InternalMode<'a> {
    context: &'a mut EntityContext,
    previous: Mode,
}

impl<'a> InternalMode<'a> {
    pub(crate) fn enter(context: &'a mut EntityContext) -> Self {
        let previous = context.mode;
        context.mode = Mode::Internal;
        Self { context, previous }
    }
}

impl Deref for InternalMode<'_> {
    type Target = EntityContext;

    fn deref(&self) -> &EntityContext {
        self.context
    }
}

impl DerefMut for InternalMode<'_> {
    fn deref_mut(&mut self) -> &mut EntityContext {
        self.context
    }
}

impl Drop for InternalMode<'_> {
    fn drop(&mut self) {
        self.context.mode = self.previous;
    }
}
