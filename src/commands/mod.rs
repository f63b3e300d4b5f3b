// Render, audit and deploy
pub mod verify;

// Remote control operations
pub mod control;

use anyhow::Result;
use deploykit::{Connector, Inventory, Manager, Plugin};
use std::collections::HashSet;
use std::sync::Arc;

use crate::Context;
use crate::cli::NodeArgs;
use crate::repo::Repo;
use crate::ssh;

/// A loaded repository with every config collected.
pub struct Session {
    pub inventory: Arc<Inventory>,
    pub manager: Manager,
    pub plugins: Vec<Plugin>,
}

impl Session {
    /// Load the repository named by the global `--root`.
    pub fn open(ctx: &Context) -> Result<Self> {
        let repo = Repo::load(&ctx.root)?;
        Self::from_repo(&repo, ssh::connect)
    }

    pub fn from_repo(repo: &Repo, connector: impl Connector + 'static) -> Result<Self> {
        let inventory = Arc::new(repo.inventory(connector)?);
        let mut manager = Manager::new(Arc::clone(&inventory));
        let plugins = repo.collect(&inventory, &mut manager)?;
        Ok(Self {
            inventory,
            manager,
            plugins,
        })
    }

    /// Names of the nodes selected by a node regex, or `None` for all.
    pub fn select_nodes(&self, target: &NodeArgs) -> Result<Option<HashSet<String>>> {
        let Some(pattern) = target.nodes.as_deref() else {
            if let Some(exclude) = target.exclude.as_deref() {
                let names = self.inventory.find_nodes(".", false, Some(exclude))?;
                return Ok(Some(names.into_iter().map(|n| n.name.clone()).collect()));
            }
            return Ok(None);
        };
        let names = self
            .inventory
            .find_nodes(pattern, target.full_match, target.exclude.as_deref())?;
        Ok(Some(names.into_iter().map(|n| n.name.clone()).collect()))
    }
}


#[cfg(test)]
mod tests {
    use super::fixture::fixture;
    use super::*;

    #[test]
    fn test_select_all_nodes() {
        let f = fixture();
        assert!(f.session.select_nodes(&NodeArgs::default()).unwrap().is_none());
    }

    #[test]
    fn test_select_nodes_by_pattern() {
        let f = fixture();
        let target = NodeArgs {
            nodes: Some("web/".into()),
            exclude: Some("b$".into()),
            ..Default::default()
        };
        let selected = f.session.select_nodes(&target).unwrap().unwrap();
        assert_eq!(selected, HashSet::from(["web/a".to_string()]));
    }

    #[test]
    fn test_select_with_exclude_only() {
        let f = fixture();
        let target = NodeArgs {
            exclude: Some("^web/".into()),
            ..Default::default()
        };
        let selected = f.session.select_nodes(&target).unwrap().unwrap();
        assert!(selected.contains("db/main"));
        assert!(!selected.contains("web/a"));
    }
}
