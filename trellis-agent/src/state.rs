use trellis_graph::ErrorKind;

/// Where an [`crate::Agent`] is in its lifecycle. Reflects the most recent
/// run.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentState<O> {
    NotStarted,
    Running,
    Finished(O),
    Failed(ErrorKind, String),
}

impl<O> AgentState<O> {
    pub fn output(&self) -> Option<&O> {
        match self {
            AgentState::Finished(output) => Some(output),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, AgentState::Finished(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, AgentState::Failed(..))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            AgentState::Failed(kind, _) => Some(*kind),
            _ => None,
        }
    }
}
