//! Outward notification of projection changes

use crate::student::Student;

/// Receives the projected student after every successful transition.
///
/// Called from the controller task: implementations must not block.
pub trait DocumentObserver: Send + Sync {
    fn on_document_changed(&self, projection: &Student);
}

impl<F> DocumentObserver for F
where
    F: Fn(&Student) + Send + Sync,
{
    fn on_document_changed(&self, projection: &Student) {
        self(projection)
    }
}
