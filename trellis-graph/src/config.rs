#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    /// Upper bound on node executions per run, across all subgraph depths.
    /// Reserved start and finish nodes are not counted.
    pub max_steps: Option<usize>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_steps: Some(50),
        }
    }
}

impl ExecutionConfig {
    pub fn merge(&self, overrides: &ExecutionOptions) -> Self {
        Self {
            max_steps: overrides.max_steps.or(self.max_steps),
        }
    }

    pub fn unbounded() -> Self {
        Self { max_steps: None }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    pub max_steps: Option<usize>,
}
