//! Refreshing hierarchical rows without losing their display state.
//!
//! A [`TreeLoader`] fetches entities level by level. Reloading a level
//! replaces the entities but keeps each row's `expanded`/`loaded` flags (by
//! id), and descends into every row that had its children loaded before.

use crate::error::Result;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use strata_schema::EntityId;

/// One displayed row of a tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Row<E> {
    pub id: EntityId,
    pub entity: E,
    pub children: Vec<Row<E>>,
    pub expanded: bool,
    /// Whether `children` has been fetched.
    pub loaded: bool,
    pub has_children: bool,
}

impl<E> Row<E> {
    /// A collapsed row whose children haven't been fetched.
    pub fn new(id: impl Into<EntityId>, entity: E, has_children: bool) -> Self {
        Self { id: id.into(), entity, children: Vec::new(), expanded: false, loaded: false, has_children }
    }
}

/// Fetches the entities behind a tree.
#[async_trait]
pub trait TreeLoader: Send + Sync {
    type Entity: Send + Sync;
    type Options: Send + Sync;

    /// The children of `parent`, or the roots when `parent` is `None`.
    async fn load_children(&self, parent: Option<&Self::Entity>, options: &Self::Options) -> Result<Vec<Self::Entity>>;

    /// A fresh copy of `entity`.
    async fn load_row(&self, entity: &Self::Entity, options: &Self::Options) -> Result<Self::Entity>;

    fn to_row(&self, entity: Self::Entity) -> Row<Self::Entity>;
}

/// Reload the children of `parent` and reconcile them with the rows that
/// were displayed before.
///
/// The result follows the order of the freshly loaded children. Rows whose
/// id was displayed before keep their `expanded` and `loaded` flags, and if
/// they were loaded, their children are reconciled the same way.
pub fn reload_children<'a, L: TreeLoader>(
    loader: &'a L,
    parent: Option<&'a L::Entity>,
    previous: &'a [Row<L::Entity>],
    options: &'a L::Options,
) -> BoxFuture<'a, Result<Vec<Row<L::Entity>>>> {
    async move {
        let fresh = loader.load_children(parent, options).await?;
        let mut rows = Vec::with_capacity(fresh.len());
        for entity in fresh {
            let mut row = loader.to_row(entity);
            if let Some(old) = previous.iter().find(|old| old.id == row.id) {
                restore(loader, &mut row, old, options).await?;
            }
            rows.push(row);
        }
        tracing::trace!(rows = rows.len(), previous = previous.len(), "Reconciled tree level");
        Ok(rows)
    }
    .boxed()
}

/// Reload a single row, and its subtree if its children were loaded.
pub async fn reload_row<L: TreeLoader>(
    loader: &L,
    row: &Row<L::Entity>,
    options: &L::Options,
) -> Result<Row<L::Entity>> {
    let entity = loader.load_row(&row.entity, options).await?;
    let mut fresh = loader.to_row(entity);
    restore(loader, &mut fresh, row, options).await?;
    Ok(fresh)
}

async fn restore<L: TreeLoader>(
    loader: &L,
    row: &mut Row<L::Entity>,
    old: &Row<L::Entity>,
    options: &L::Options,
) -> Result<()> {
    row.expanded = old.expanded;
    row.loaded = old.loaded;
    if old.loaded {
        row.children = reload_children(loader, Some(&row.entity), &old.children, options).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq)]
    struct Node {
        id: i64,
        title: &'static str,
    }

    /// Parent id (`None` for roots) to children.
    #[derive(Default)]
    struct MemoryLoader {
        levels: BTreeMap<Option<i64>, Vec<Node>>,
        calls: AtomicUsize,
    }

    impl MemoryLoader {
        fn level(mut self, parent: Option<i64>, nodes: &[(i64, &'static str)]) -> Self {
            let nodes = nodes.iter().map(|&(id, title)| Node { id, title }).collect();
            self.levels.insert(parent, nodes);
            self
        }
    }

    #[async_trait]
    impl TreeLoader for MemoryLoader {
        type Entity = Node;
        type Options = ();

        async fn load_children(&self, parent: Option<&Node>, _options: &()) -> Result<Vec<Node>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.levels.get(&parent.map(|node| node.id)).cloned().unwrap_or_default())
        }

        async fn load_row(&self, entity: &Node, _options: &()) -> Result<Node> {
            self.levels
                .values()
                .flatten()
                .find(|node| node.id == entity.id)
                .cloned()
                .ok_or_else(|| exn::Exn::from(ErrorKind::Load(format!("node {} is gone", entity.id))))
        }

        fn to_row(&self, entity: Node) -> Row<Node> {
            let has_children = self.levels.contains_key(&Some(entity.id));
            Row::new(entity.id, entity, has_children)
        }
    }

    fn titles(rows: &[Row<Node>]) -> Vec<&'static str> {
        rows.iter().map(|row| row.entity.title).collect()
    }

    #[tokio::test]
    async fn test_reload_preserves_flags_and_descends_into_loaded_rows() {
        let before = MemoryLoader::default()
            .level(None, &[(1, "Docs"), (2, "Blog")])
            .level(Some(1), &[(10, "Intro"), (11, "Setup")]);
        let mut rows = reload_children(&before, None, &[], &()).await.unwrap();
        assert_eq!(titles(&rows), vec!["Docs", "Blog"]);
        assert!(rows.iter().all(|row| !row.expanded && !row.loaded));

        rows[0].children = reload_children(&before, Some(&rows[0].entity), &[], &()).await.unwrap();
        rows[0].expanded = true;
        rows[0].loaded = true;
        rows[0].children[1].expanded = true;

        let after = MemoryLoader::default()
            .level(None, &[(3, "News"), (1, "Docs*")])
            .level(Some(1), &[(11, "Setup*"), (12, "FAQ")])
            .level(Some(2), &[(20, "Hidden")]);
        let reloaded = reload_children(&after, None, &rows, &()).await.unwrap();

        assert_eq!(titles(&reloaded), vec!["News", "Docs*"]);
        assert!(!reloaded[0].loaded);
        assert!(reloaded[1].expanded && reloaded[1].loaded);
        assert_eq!(titles(&reloaded[1].children), vec!["Setup*", "FAQ"]);
        assert!(reloaded[1].children[0].expanded);
        assert!(!reloaded[1].children[1].expanded);
        // Roots, plus the one level that had been loaded.
        assert_eq!(after.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reload_row() {
        let loader = MemoryLoader::default().level(None, &[(1, "Docs")]).level(Some(1), &[(10, "Intro")]);
        let mut row = loader.to_row(Node { id: 1, title: "stale" });
        assert!(row.has_children);

        let fresh = reload_row(&loader, &row, &()).await.unwrap();
        assert_eq!(fresh.entity.title, "Docs");
        assert!(fresh.children.is_empty());

        row.loaded = true;
        row.children = vec![loader.to_row(Node { id: 10, title: "stale" })];
        let fresh = reload_row(&loader, &row, &()).await.unwrap();
        assert!(fresh.loaded);
        assert_eq!(titles(&fresh.children), vec!["Intro"]);

        let gone = loader.to_row(Node { id: 99, title: "gone" });
        let err = reload_row(&loader, &gone, &()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
