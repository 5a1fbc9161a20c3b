//! Assistant sessions: identity, registry and the collaborator seams.

pub mod collaborator;
pub mod registry;
pub mod tmux;

pub use collaborator::{ExecutionCollaborator, SessionCollaborator};
pub use registry::{
    ProjectId, SessionHandle, SessionRecord, SessionRegistry, SessionState, project_id,
};
pub use tmux::TmuxSession;
