use trellis_core::Value;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Frame {
    node: Option<String>,
    step_id: Uuid,
    parent_step_id: Uuid,
    last_input: Option<(Value, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PositionSnapshot {
    pub node_path: Vec<String>,
    pub subgraph_inputs: Vec<Value>,
    pub last_input: Value,
    pub last_input_type: String,
}

/// Where the run currently is: node, enclosing subgraphs and step ids.
///
/// Every `enter_subgraph` is matched by exactly one `exit_subgraph`, the
/// runtime calls both around a nested traversal regardless of its outcome.
#[derive(Clone, Debug)]
pub struct ExecutionPosition {
    root_step_id: Uuid,
    subgraphs: Vec<String>,
    node: Option<String>,
    step_id: Uuid,
    parent_step_id: Uuid,
    last_input: Option<(Value, String)>,
    frames: Vec<Frame>,
    last_completed: Option<PositionSnapshot>,
}

impl Default for ExecutionPosition {
    fn default() -> Self {
        let root = Uuid::new_v4();
        Self {
            root_step_id: root,
            subgraphs: Vec::new(),
            node: None,
            step_id: root,
            parent_step_id: root,
            last_input: None,
            frames: Vec::new(),
            last_completed: None,
        }
    }
}

impl ExecutionPosition {
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Names of the enclosing subgraph nodes, outermost first.
    pub fn subgraph_path(&self) -> &[String] {
        &self.subgraphs
    }

    pub fn node_path(&self) -> Vec<String> {
        let mut path = self.subgraphs.clone();
        if let Some(node) = &self.node {
            path.push(node.clone());
        }
        path
    }

    pub fn depth(&self) -> usize {
        self.subgraphs.len()
    }

    pub fn step_id(&self) -> Uuid {
        self.step_id
    }

    pub fn parent_step_id(&self) -> Uuid {
        self.parent_step_id
    }

    /// Step id shared by every node of the current run as their ultimate
    /// ancestor.
    pub fn root_step_id(&self) -> Uuid {
        self.root_step_id
    }

    pub fn last_input(&self) -> Option<(&Value, &str)> {
        self.last_input
            .as_ref()
            .map(|(value, ty)| (value, ty.as_str()))
    }

    /// Inputs of the enclosing subgraph nodes, outermost first.
    pub fn subgraph_inputs(&self) -> Vec<Value> {
        self.frames
            .iter()
            .map(|frame| {
                frame
                    .last_input
                    .as_ref()
                    .map(|(value, _)| value.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn last_completed(&self) -> Option<&PositionSnapshot> {
        self.last_completed.as_ref()
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn begin_node(&mut self, name: &str, input: Value, input_type: &str) {
        self.node = Some(name.to_string());
        self.parent_step_id = self
            .frames
            .last()
            .map(|frame| frame.step_id)
            .unwrap_or(self.root_step_id);
        self.step_id = Uuid::new_v4();
        self.last_input = Some((input, input_type.to_string()));
    }

    pub(crate) fn complete_node(&mut self) {
        let (last_input, last_input_type) = match &self.last_input {
            Some((value, ty)) => (value.clone(), ty.clone()),
            None => (Value::Null, String::new()),
        };
        self.last_completed = Some(PositionSnapshot {
            node_path: self.node_path(),
            subgraph_inputs: self.subgraph_inputs(),
            last_input,
            last_input_type,
        });
    }

    pub(crate) fn enter_subgraph(&mut self) {
        let name = self.node.take().unwrap_or_default();
        self.frames.push(Frame {
            node: Some(name.clone()),
            step_id: self.step_id,
            parent_step_id: self.parent_step_id,
            last_input: self.last_input.take(),
        });
        self.subgraphs.push(name);
    }

    pub(crate) fn exit_subgraph(&mut self) {
        if let Some(frame) = self.frames.pop() {
            self.node = frame.node;
            self.step_id = frame.step_id;
            self.parent_step_id = frame.parent_step_id;
            self.last_input = frame.last_input;
        }
        self.subgraphs.pop();
    }

    /// Moves back to the last node that fully completed. Used when a run is
    /// cancelled mid-node.
    pub(crate) fn rewind(&mut self) {
        let Some(snapshot) = self.last_completed.clone() else {
            self.node = None;
            self.last_input = None;
            self.subgraphs.clear();
            self.frames.clear();
            return;
        };
        let mut path = snapshot.node_path.clone();
        self.node = path.pop();
        self.frames.truncate(path.len());
        self.subgraphs = path;
        self.last_input = Some((snapshot.last_input, snapshot.last_input_type));
    }
}
