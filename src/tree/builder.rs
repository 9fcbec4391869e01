//! # Builder for the process tree.
//!
//! [`TreeBuilder`] collects the topology produced by the configuration loader
//! and validates it once:
//! - the root command line is not empty,
//! - node names are unique,
//! - every node's parent is declared before it (which also rules out cycles),
//! - every command names an existing node,
//! - command names and aliases share one namespace.
//!
//! ## Example
//! ```rust
//! use forkvisor::{Bus, Config, TreeBuilder};
//!
//! let tree = TreeBuilder::new("boot", ["ruby", "-rforkvisor", "-e", "Forkvisor.go"])
//!     .with_node("default_bundle", "boot")
//!     .with_node("development_environment", "default_bundle")
//!     .with_command("console", "development_environment", ["c"])
//!     .build(&Config::default(), Bus::new(16))
//!     .unwrap();
//!
//! assert_eq!(tree.resolve_command("c").unwrap().name().as_ref(), "console");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use super::tree::ProcessTree;
use crate::config::Config;
use crate::error::ConfigError;
use crate::events::Bus;
use crate::node::{Command, Inbox, Node};

struct CommandDecl {
    name: String,
    node: String,
    aliases: Vec<String>,
}

/// Collects nodes and commands, then builds a [`ProcessTree`].
pub struct TreeBuilder {
    root: String,
    argv: Vec<String>,
    nodes: Vec<(String, String)>,
    commands: Vec<CommandDecl>,
}

impl TreeBuilder {
    /// Starts a tree whose root node `root` is spawned from `argv`.
    pub fn new(root: impl Into<String>, argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            root: root.into(),
            argv: argv.into_iter().map(Into::into).collect(),
            nodes: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Adds node `name`, forked from `parent`.
    pub fn with_node(mut self, name: impl Into<String>, parent: impl Into<String>) -> Self {
        self.nodes.push((name.into(), parent.into()));
        self
    }

    /// Adds command `name` (plus `aliases`) owned by `node`.
    pub fn with_command(
        mut self,
        name: impl Into<String>,
        node: impl Into<String>,
        aliases: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.commands.push(CommandDecl {
            name: name.into(),
            node: node.into(),
            aliases: aliases.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Validates the topology and builds the tree.
    pub fn build(self, cfg: &Config, bus: Bus) -> Result<ProcessTree, ConfigError> {
        if self.argv.is_empty() || self.argv[0].is_empty() {
            return Err(ConfigError::EmptyCommandLine(self.root));
        }

        // (name, parent) in declaration order; the root comes first.
        let mut order: Vec<(Arc<str>, Option<Arc<str>>)> = vec![(Arc::from(self.root.as_str()), None)];
        let mut known: HashMap<String, usize> = HashMap::from([(self.root.clone(), 0)]);
        for (name, parent) in &self.nodes {
            if known.contains_key(name) {
                return Err(ConfigError::DuplicateNode(name.clone()));
            }
            if !known.contains_key(parent) {
                return Err(ConfigError::UnknownParent {
                    parent: parent.clone(),
                    child: name.clone(),
                });
            }
            known.insert(name.clone(), order.len());
            order.push((Arc::from(name.as_str()), Some(Arc::from(parent.as_str()))));
        }

        let mut owners: HashMap<String, String> = HashMap::new();
        let mut owned: HashMap<String, Vec<Arc<Command>>> = HashMap::new();
        let mut commands: HashMap<Arc<str>, Arc<Command>> = HashMap::new();
        let mut aliases: HashMap<Arc<str>, Arc<Command>> = HashMap::new();
        for decl in &self.commands {
            if !known.contains_key(&decl.node) {
                return Err(ConfigError::UnknownParent {
                    parent: decl.node.clone(),
                    child: decl.name.clone(),
                });
            }
            for name in std::iter::once(&decl.name).chain(&decl.aliases) {
                if let Some(existing) = owners.get(name) {
                    return Err(ConfigError::NameCollision {
                        name: name.clone(),
                        existing: existing.clone(),
                    });
                }
                owners.insert(name.clone(), decl.name.clone());
            }

            let command = Arc::new(Command::new(
                decl.name.as_str(),
                decl.node.as_str(),
                decl.aliases.iter().map(String::as_str),
            ));
            commands.insert(command.name().clone(), command.clone());
            for alias in command.aliases() {
                aliases.insert(alias.clone(), command.clone());
            }
            owned.entry(decl.node.clone()).or_default().push(command);
        }

        let capacity = cfg.node_inbox_capacity_clamped();
        let mut inboxes: Vec<Option<Inbox>> = order.iter().map(|_| Some(Inbox::new(capacity))).collect();
        let links: Vec<_> = order
            .iter()
            .zip(&inboxes)
            .map(|((name, _), inbox)| inbox.as_ref().map(|i| i.link(name.clone())))
            .collect();

        // Children are always declared after their parent: build back to front.
        let mut built: Vec<Option<Arc<Node>>> = vec![None; order.len()];
        for idx in (0..order.len()).rev() {
            let (name, parent) = &order[idx];
            let children = order
                .iter()
                .enumerate()
                .skip(idx + 1)
                .filter(|(_, (_, p))| p.as_ref() == Some(name))
                .filter_map(|(child, _)| built[child].clone())
                .collect();
            let link = parent
                .as_ref()
                .and_then(|p| known.get(p.as_ref()))
                .and_then(|&pi| links[pi].clone());
            let argv = if parent.is_none() { self.argv.clone() } else { Vec::new() };
            let Some(inbox) = inboxes[idx].take() else {
                continue;
            };
            let node = Node::new(
                name.clone(),
                argv,
                link,
                children,
                owned.remove(name.as_ref()).unwrap_or_default(),
                inbox,
            );
            built[idx] = Some(Arc::new(node));
        }

        let nodes: HashMap<Arc<str>, Arc<Node>> = built
            .into_iter()
            .flatten()
            .map(|node| (node.name().clone(), node))
            .collect();
        let root = nodes
            .get(self.root.as_str())
            .cloned()
            .ok_or_else(|| ConfigError::EmptyCommandLine(self.root.clone()))?;

        Ok(ProcessTree::new(root, nodes, commands, aliases, bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(builder: TreeBuilder) -> Result<ProcessTree, ConfigError> {
        builder.build(&Config::default(), Bus::new(16))
    }

    #[test]
    fn empty_command_line_is_rejected() {
        let err = build(TreeBuilder::new("boot", Vec::<String>::new())).unwrap_err();
        assert_eq!(err, ConfigError::EmptyCommandLine("boot".into()));
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let err = build(
            TreeBuilder::new("boot", ["ruby"])
                .with_node("code", "boot")
                .with_node("code", "boot"),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateNode("code".into()));

        let err = build(TreeBuilder::new("boot", ["ruby"]).with_node("boot", "boot")).unwrap_err();
        assert_eq!(err.as_label(), "config_duplicate_node");
    }

    #[test]
    fn dangling_references_are_rejected() {
        let err = build(TreeBuilder::new("boot", ["ruby"]).with_node("test", "code")).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownParent {
                parent: "code".into(),
                child: "test".into()
            }
        );

        let err = build(TreeBuilder::new("boot", ["ruby"]).with_command("rake", "code", ["r"])).unwrap_err();
        assert_eq!(err.as_label(), "config_unknown_parent");
    }

    #[test]
    fn names_and_aliases_share_one_namespace() {
        let err = build(
            TreeBuilder::new("boot", ["ruby"])
                .with_command("console", "boot", ["c"])
                .with_command("cucumber", "boot", ["c"]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::NameCollision {
                name: "c".into(),
                existing: "console".into()
            }
        );

        let err = build(
            TreeBuilder::new("boot", ["ruby"])
                .with_command("console", "boot", ["server"])
                .with_command("server", "boot", Vec::<String>::new()),
        )
        .unwrap_err();
        assert_eq!(err.as_label(), "config_name_collision");
    }

    #[test]
    fn topology_is_wired() {
        let tree = build(
            TreeBuilder::new("boot", ["ruby", "-e", "go"])
                .with_node("code", "boot")
                .with_node("data", "boot")
                .with_node("test", "code")
                .with_command("rspec", "test", ["spec"]),
        )
        .unwrap();

        let root = tree.root();
        assert_eq!(root.name().as_ref(), "boot");
        let mut children: Vec<_> = root.children().iter().map(|c| c.name().to_string()).collect();
        children.sort();
        assert_eq!(children, vec!["code", "data"]);

        let test = tree.node("test").unwrap();
        assert_eq!(test.parent_name().map(|p| p.as_ref()), Some("code"));
        assert_eq!(test.commands()[0].name().as_ref(), "rspec");
    }
}
