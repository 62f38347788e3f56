//! Scoped collection of auxiliary outputs.
//!
//! Stages report diagnostics (`summaries`), intermediate tensors
//! (`module_outputs`) and non-gradient state (`state_updates`) into an
//! [`OutputCollection`] handed to them by reference. Each scope can own named
//! children; callers create a fresh collection per invocation and merge it
//! into the parent afterwards, so nothing accumulates behind anyone's back.
//!
//! Merging is commutative for disjoint keys and rejects duplicates, which
//! keeps the result independent of the order stages are visited in.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Default)]
pub struct OutputCollection {
    pub summaries: BTreeMap<String, Tensor>,
    pub module_outputs: BTreeMap<String, Tensor>,
    pub state_updates: BTreeMap<String, Tensor>,
    children: BTreeMap<String, OutputCollection>,
}

fn merge_leaves(
    scope: &str,
    kind: &str,
    into: &mut BTreeMap<String, Tensor>,
    from: BTreeMap<String, Tensor>,
) -> Result<()> {
    for (key, value) in from {
        if into.contains_key(&key) {
            return Err(PipelineError::OutputConflict {
                key: format!("{scope}{kind}/{key}"),
            });
        }
        into.insert(key, value);
    }
    Ok(())
}

impl OutputCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_summary(&mut self, name: impl Into<String>, value: Tensor) {
        self.summaries.insert(name.into(), value);
    }

    pub fn add_module_output(&mut self, name: impl Into<String>, value: Tensor) {
        self.module_outputs.insert(name.into(), value);
    }

    pub fn add_state_update(&mut self, name: impl Into<String>, value: Tensor) {
        self.state_updates.insert(name.into(), value);
    }

    /// Returns the child scope `name`, creating it when missing.
    pub fn add_child(&mut self, name: impl Into<String>) -> &mut OutputCollection {
        self.children.entry(name.into()).or_default()
    }

    pub fn child(&self, name: &str) -> Option<&OutputCollection> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &OutputCollection)> {
        self.children.iter().map(|(name, child)| (name.as_str(), child))
    }

    /// Follows a `/`-separated chain of child scopes.
    pub fn scope(&self, path: &str) -> Option<&OutputCollection> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Looks up `"scope/.../name"` among the summaries.
    pub fn summary(&self, path: &str) -> Option<&Tensor> {
        match path.rsplit_once('/') {
            Some((scope, name)) => self.scope(scope)?.summaries.get(name),
            None => self.summaries.get(path),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
            && self.module_outputs.is_empty()
            && self.state_updates.is_empty()
            && self.children.values().all(OutputCollection::is_empty)
    }

    /// Moves every entry of `other` into `self`, recursing into children.
    pub fn merge(&mut self, other: OutputCollection) -> Result<()> {
        self.merge_scoped("", other)
    }

    fn merge_scoped(&mut self, scope: &str, other: OutputCollection) -> Result<()> {
        merge_leaves(scope, "summaries", &mut self.summaries, other.summaries)?;
        merge_leaves(scope, "module_outputs", &mut self.module_outputs, other.module_outputs)?;
        merge_leaves(scope, "state_updates", &mut self.state_updates, other.state_updates)?;
        for (name, child) in other.children {
            let child_scope = format!("{scope}{name}/");
            self.add_child(name).merge_scoped(&child_scope, child)?;
        }
        Ok(())
    }

    /// Applies `f` to every tensor, keeping the scope structure.
    pub fn try_map<F>(&self, mut f: F) -> Result<OutputCollection>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        fn walk<F>(node: &OutputCollection, f: &mut F) -> Result<OutputCollection>
        where
            F: FnMut(&Tensor) -> Result<Tensor>,
        {
            let mut children = BTreeMap::new();
            for (name, child) in &node.children {
                children.insert(name.clone(), walk(child, f)?);
            }
            Ok(OutputCollection {
                summaries: map_leaves(&node.summaries, f)?,
                module_outputs: map_leaves(&node.module_outputs, f)?,
                state_updates: map_leaves(&node.state_updates, f)?,
                children,
            })
        }
        fn map_leaves<F>(leaves: &BTreeMap<String, Tensor>, f: &mut F) -> Result<BTreeMap<String, Tensor>>
        where
            F: FnMut(&Tensor) -> Result<Tensor>,
        {
            let mut out = BTreeMap::new();
            for (key, value) in leaves {
                out.insert(key.clone(), f(value)?);
            }
            Ok(out)
        }
        walk(self, &mut f)
    }

    /// Stacks same-shaped collections leafwise along a new axis `dim`.
    ///
    /// Every collection must define exactly the same keys in the same scopes.
    pub fn stack(collections: &[OutputCollection], dim: usize) -> Result<OutputCollection> {
        fn stack_leaves(
            scope: &str,
            kind: &str,
            parts: &[&BTreeMap<String, Tensor>],
            dim: usize,
        ) -> Result<BTreeMap<String, Tensor>> {
            let first = parts[0];
            let mut out = BTreeMap::new();
            for part in parts {
                if part.len() != first.len() || part.keys().any(|key| !first.contains_key(key)) {
                    return Err(PipelineError::structure(format!(
                        "{scope}{kind} keys differ between collections"
                    )));
                }
            }
            for key in first.keys() {
                let column: Vec<&Tensor> = parts.iter().map(|part| &part[key]).collect();
                out.insert(key.clone(), Tensor::stack(&column, dim)?);
            }
            Ok(out)
        }

        fn walk(scope: &str, parts: &[&OutputCollection], dim: usize) -> Result<OutputCollection> {
            let first = parts[0];
            let summaries: Vec<_> = parts.iter().map(|p| &p.summaries).collect();
            let module_outputs: Vec<_> = parts.iter().map(|p| &p.module_outputs).collect();
            let state_updates: Vec<_> = parts.iter().map(|p| &p.state_updates).collect();
            let mut children = BTreeMap::new();
            for name in first.children.keys() {
                let column = parts
                    .iter()
                    .map(|part| {
                        part.children.get(name).ok_or_else(|| {
                            PipelineError::structure(format!("{scope}{name} missing in a collection"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                children.insert(name.clone(), walk(&format!("{scope}{name}/"), &column, dim)?);
            }
            if parts.iter().any(|part| part.children.len() != first.children.len()) {
                return Err(PipelineError::structure(format!(
                    "{scope} child scopes differ between collections"
                )));
            }
            Ok(OutputCollection {
                summaries: stack_leaves(scope, "summaries", &summaries, dim)?,
                module_outputs: stack_leaves(scope, "module_outputs", &module_outputs, dim)?,
                state_updates: stack_leaves(scope, "state_updates", &state_updates, dim)?,
                children,
            })
        }

        if collections.is_empty() {
            return Err(PipelineError::structure("cannot stack zero output collections"));
        }
        let parts: Vec<&OutputCollection> = collections.iter().collect();
        walk("", &parts, dim)
    }
}
