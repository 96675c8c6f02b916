//! Nested run hierarchy for the experiment page
//!
//! Runs nest at most two levels deep (root, child, grandchild). The page
//! shows every root run; a root's children are only loaded when its branch is
//! open, and likewise for one child's grandchildren. Which branches are open
//! is carried entirely in the URL (`open_l0`, `open_l1`), so the rendered
//! tree is a pure function of those parameters and the stored runs.

use serde::Serialize;

use crate::{Result, Run, RunId};

/// Run lookups the assembler depends on
pub trait RunLookup {
    /// Direct children of a run, most recent first
    fn child_runs(&self, parent: RunId) -> Result<Vec<Run>>;

    /// Number of direct children of a run
    fn child_run_count(&self, parent: RunId) -> Result<u64>;

    /// Direct children together with their own child counts.
    ///
    /// The default issues one count lookup per child; stores that can answer
    /// this in a single query should override it.
    fn children_with_counts(&self, parent: RunId) -> Result<Vec<(Run, u64)>> {
        self.child_runs(parent)?
            .into_iter()
            .map(|run| {
                let count = self.child_run_count(run.id)?;
                Ok((run, count))
            })
            .collect()
    }
}

/// Expanded branches, from the `open_l0` / `open_l1` query parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenBranches<'a> {
    /// Root run whose children are shown
    pub level0: Option<&'a str>,
    /// Child run whose children (grandchildren) are shown
    pub level1: Option<&'a str>,
}

impl<'a> OpenBranches<'a> {
    pub fn new(level0: Option<&'a str>, level1: Option<&'a str>) -> Self {
        // Empty query values mean "closed"
        Self {
            level0: level0.filter(|s| !s.is_empty()),
            level1: level1.filter(|s| !s.is_empty()),
        }
    }

    fn opens_root(&self, run: &Run) -> bool {
        self.level0 == Some(run.uuid.as_str())
    }

    fn opens_child(&self, run: &Run) -> bool {
        self.level1 == Some(run.uuid.as_str())
    }
}

/// A run with its (possibly loaded) children, built per request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NestedRunView {
    pub run: Run,
    pub id: RunId,
    pub child_count: u64,
    pub children: Vec<NestedRunView>,
}

impl NestedRunView {
    fn leaf(run: Run, child_count: u64) -> Self {
        Self {
            id: run.id,
            run,
            child_count,
            children: Vec::new(),
        }
    }

    pub fn is_expanded(&self) -> bool {
        !self.children.is_empty()
    }
}

/// Materialize the visible run tree.
///
/// Root order is kept as given. Grandchildren are always leaves, whatever
/// their own child count.
pub fn assemble<L: RunLookup + ?Sized>(
    root_runs: Vec<Run>,
    open: &OpenBranches<'_>,
    lookup: &L,
) -> Result<Vec<NestedRunView>> {
    root_runs
        .into_iter()
        .map(|run| {
            let child_count = lookup.child_run_count(run.id)?;
            let expand = open.opens_root(&run) && child_count > 0;
            let mut view = NestedRunView::leaf(run, child_count);
            if expand {
                view.children = assemble_children(view.id, open, lookup)?;
            }
            Ok(view)
        })
        .collect()
}

fn assemble_children<L: RunLookup + ?Sized>(
    parent: RunId,
    open: &OpenBranches<'_>,
    lookup: &L,
) -> Result<Vec<NestedRunView>> {
    lookup
        .children_with_counts(parent)?
        .into_iter()
        .map(|(child, grandchild_count)| {
            let expand = open.opens_child(&child) && grandchild_count > 0;
            let mut view = NestedRunView::leaf(child, grandchild_count);
            if expand {
                view.children = lookup
                    .children_with_counts(view.id)?
                    .into_iter()
                    .map(|(grandchild, count)| NestedRunView::leaf(grandchild, count))
                    .collect();
            }
            Ok(view)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn run(id: i64, uuid: &str, parent: Option<i64>, level: i64) -> Run {
        Run {
            id: RunId(id),
            uuid: uuid.to_string(),
            name: format!("run-{}", uuid),
            notes: String::new(),
            experiment_id: 1,
            parent_run_id: parent.map(RunId),
            nesting_level: level,
            created_at: Utc::now(),
        }
    }

    /// In-memory lookup that records which parents had their children fetched
    #[derive(Default)]
    struct FakeRuns {
        children: HashMap<i64, Vec<Run>>,
        fetched: RefCell<Vec<i64>>,
    }

    impl FakeRuns {
        fn add(&mut self, child: Run) {
            let parent = child.parent_run_id.unwrap().0;
            self.children.entry(parent).or_default().push(child);
        }
    }

    impl RunLookup for FakeRuns {
        fn child_runs(&self, parent: RunId) -> Result<Vec<Run>> {
            self.fetched.borrow_mut().push(parent.0);
            Ok(self.children.get(&parent.0).cloned().unwrap_or_default())
        }

        fn child_run_count(&self, parent: RunId) -> Result<u64> {
            Ok(self.children.get(&parent.0).map(|c| c.len() as u64).unwrap_or(0))
        }
    }

    /// root "r" -> child "c" -> grandchildren "g1", "g2"
    fn three_levels() -> (Vec<Run>, FakeRuns) {
        let mut fake = FakeRuns::default();
        fake.add(run(2, "c", Some(1), 1));
        fake.add(run(3, "g1", Some(2), 2));
        fake.add(run(4, "g2", Some(2), 2));
        (vec![run(1, "r", None, 0)], fake)
    }

    #[test]
    fn test_open_root_closed_child() {
        let (roots, fake) = three_levels();
        let open = OpenBranches::new(Some("r"), None);

        let views = assemble(roots, &open, &fake).unwrap();

        assert_eq!(views.len(), 1);
        assert_eq!(views[0].child_count, 1);
        assert_eq!(views[0].children.len(), 1);
        let child = &views[0].children[0];
        assert_eq!(child.run.uuid, "c");
        assert_eq!(child.child_count, 2);
        assert!(child.children.is_empty());
    }

    #[test]
    fn test_open_root_and_child() {
        let (roots, fake) = three_levels();
        let open = OpenBranches::new(Some("r"), Some("c"));

        let views = assemble(roots, &open, &fake).unwrap();

        let grandchildren: Vec<_> = views[0].children[0]
            .children
            .iter()
            .map(|v| v.run.uuid.as_str())
            .collect();
        assert_eq!(grandchildren, vec!["g1", "g2"]);
        assert!(views[0].children[0].children.iter().all(|g| g.children.is_empty()));
    }

    #[test]
    fn test_everything_closed_fetches_no_children() {
        let (roots, fake) = three_levels();

        let views = assemble(roots, &OpenBranches::default(), &fake).unwrap();

        assert_eq!(views[0].child_count, 1);
        assert!(views[0].children.is_empty());
        assert!(fake.fetched.borrow().is_empty());
    }

    #[test]
    fn test_child_open_without_root_open_is_ignored() {
        let (roots, fake) = three_levels();
        let open = OpenBranches::new(None, Some("c"));

        let views = assemble(roots, &open, &fake).unwrap();

        assert!(views[0].children.is_empty());
        assert!(fake.fetched.borrow().is_empty());
    }

    #[test]
    fn test_open_childless_root_does_not_fetch() {
        let fake = FakeRuns::default();
        let open = OpenBranches::new(Some("lonely"), None);

        let views = assemble(vec![run(9, "lonely", None, 0)], &open, &fake).unwrap();

        assert_eq!(views[0].child_count, 0);
        assert!(!views[0].is_expanded());
        assert!(fake.fetched.borrow().is_empty());
    }

    #[test]
    fn test_grandchildren_are_never_recursed() {
        let (roots, mut fake) = three_levels();
        // Stray deeper row, as if the level cap had been bypassed
        fake.add(run(5, "ggc", Some(3), 3));
        let open = OpenBranches::new(Some("r"), Some("c"));

        let views = assemble(roots, &open, &fake).unwrap();

        let g1 = &views[0].children[0].children[0];
        assert_eq!(g1.run.uuid, "g1");
        assert!(g1.children.is_empty());
        assert!(!fake.fetched.borrow().contains(&3));
    }

    #[test]
    fn test_root_order_preserved() {
        let fake = FakeRuns::default();
        let roots = vec![run(3, "newest", None, 0), run(1, "oldest", None, 0), run(2, "middle", None, 0)];

        let views = assemble(roots, &OpenBranches::default(), &fake).unwrap();

        let order: Vec<_> = views.iter().map(|v| v.run.uuid.as_str()).collect();
        assert_eq!(order, vec!["newest", "oldest", "middle"]);
    }

    #[test]
    fn test_empty_open_params_mean_closed() {
        let open = OpenBranches::new(Some(""), Some(""));
        assert_eq!(open, OpenBranches::default());
    }
}
