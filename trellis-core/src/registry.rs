use std::collections::HashMap;
use std::sync::Arc;

use crate::tool::{Tool, ToolDescriptor};
use crate::{ToolSpec, TrellisError};

/// Immutable set of tools visible to a run or to a subgraph.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<Vec<Arc<dyn Tool>>>,
    by_name: Arc<HashMap<String, usize>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name
            .get(name)
            .and_then(|index| self.tools.get(*index))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name
            .get(name)
            .and_then(|index| self.tools.get(*index))
            .map(|tool| tool.descriptor())
    }

    /// Names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|tool| tool.name())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|tool| tool.descriptor().to_spec())
            .collect()
    }

    /// Restricts the registry to `names`. Every name must already be
    /// registered.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Result<ToolRegistry, TrellisError> {
        let mut builder = ToolRegistry::builder();
        for name in names {
            let name = name.as_ref();
            let tool = self
                .get(name)
                .ok_or_else(|| TrellisError::UnknownTool(name.to_string()))?;
            builder = builder.register_arc(tool);
        }
        builder.build()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn register<T: Tool + 'static>(self, tool: T) -> Self {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> Result<ToolRegistry, TrellisError> {
        let mut by_name = HashMap::with_capacity(self.tools.len());
        for (index, tool) in self.tools.iter().enumerate() {
            if by_name.insert(tool.name().to_string(), index).is_some() {
                return Err(TrellisError::DuplicateTool(tool.name().to_string()));
            }
        }
        Ok(ToolRegistry {
            tools: Arc::new(self.tools),
            by_name: Arc::new(by_name),
        })
    }
}
