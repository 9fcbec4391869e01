use std::sync::Arc;

/// A user-invocable command bound to a node.
///
/// Pure routing leaf: it names its owning node but holds no process resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: Arc<str>,
    aliases: Vec<Arc<str>>,
    node: Arc<str>,
}

impl Command {
    /// Creates a command owned by `node`.
    pub fn new(
        name: impl Into<Arc<str>>,
        node: impl Into<Arc<str>>,
        aliases: impl IntoIterator<Item = impl Into<Arc<str>>>,
    ) -> Self {
        Self {
            name: name.into(),
            aliases: aliases.into_iter().map(Into::into).collect(),
            node: node.into(),
        }
    }

    /// Primary name.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Alternative names.
    pub fn aliases(&self) -> &[Arc<str>] {
        &self.aliases
    }

    /// Name of the owning node.
    pub fn node(&self) -> &Arc<str> {
        &self.node
    }
}
