//! Session surface: request/response correlation objects.
//!
//! Sessions carry no coordination logic of their own here; they are built
//! through the same factory surface as steps so they share the trace of the
//! chain that created them and live in the worker's session table.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Handle to a session in the worker's session table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

pub trait Session {
    /// Name used in logs
    fn name(&self) -> &str;
}

/// Session shared between its creator and the worker table
pub type SharedSession = Rc<RefCell<dyn Session>>;
