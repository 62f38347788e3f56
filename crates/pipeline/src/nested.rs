//! Nested containers of tensors.
//!
//! Carry, per-stage inputs, outputs, partition hints and parameter specs all
//! share the same shape: an arbitrary tree of named mappings and sequences
//! whose leaves hold the actual values. Every transform in the pipeline is
//! applied leafwise through [`Nested::try_map`] or one of the zip variants, so
//! callers can thread as many named leaves as they like through the schedule.
//!
//! Leaf paths are rendered as `/`-separated keys (sequence entries use their
//! index), e.g. `"encoder/0/hidden"`.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{PipelineError, Result};

/// A tree of mappings and sequences with values of type `T` at the leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum Nested<T> {
    Leaf(T),
    Map(BTreeMap<String, Nested<T>>),
    Seq(Vec<Nested<T>>),
}

/// The common case: a nested container of tensors.
pub type NestedTensor = Nested<Tensor>;

impl<T> Default for Nested<T> {
    fn default() -> Self {
        Nested::Map(BTreeMap::new())
    }
}

impl<T> From<T> for Nested<T> {
    fn from(value: T) -> Self {
        Nested::Leaf(value)
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

fn at(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

impl<T> Nested<T> {
    pub fn leaf(value: T) -> Self {
        Nested::Leaf(value)
    }

    /// Builds a mapping node from `(key, subtree)` pairs.
    pub fn map_from<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Nested<T>)>,
    {
        Nested::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    /// Builds a flat mapping whose children are all leaves.
    pub fn from_leaves<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, T)>,
    {
        Self::map_from(
            entries
                .into_iter()
                .map(|(key, value)| (key, Nested::Leaf(value))),
        )
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Nested::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Child of a mapping node.
    pub fn get(&self, key: &str) -> Option<&Nested<T>> {
        match self {
            Nested::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Resolves a `/`-separated path; numeric segments index sequences.
    pub fn get_path(&self, path: &str) -> Option<&Nested<T>> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| match node {
                Nested::Map(entries) => entries.get(segment),
                Nested::Seq(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                Nested::Leaf(_) => None,
            })
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Nested::Leaf(_) => 1,
            Nested::Map(entries) => entries.values().map(Nested::leaf_count).sum(),
            Nested::Seq(items) => items.iter().map(Nested::leaf_count).sum(),
        }
    }

    /// True when the tree holds no leaves at all.
    pub fn is_empty(&self) -> bool {
        self.leaf_count() == 0
    }

    /// Leaves in deterministic (sorted-key, then index) order.
    pub fn leaves(&self) -> Vec<&T> {
        self.leaves_with_paths()
            .into_iter()
            .map(|(_, leaf)| leaf)
            .collect()
    }

    pub fn leaves_with_paths(&self) -> Vec<(String, &T)> {
        fn collect<'a, T>(node: &'a Nested<T>, path: String, out: &mut Vec<(String, &'a T)>) {
            match node {
                Nested::Leaf(value) => out.push((path, value)),
                Nested::Map(entries) => {
                    for (key, child) in entries {
                        collect(child, join(&path, key), out);
                    }
                }
                Nested::Seq(items) => {
                    for (index, child) in items.iter().enumerate() {
                        collect(child, join(&path, &index.to_string()), out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        collect(self, String::new(), &mut out);
        out
    }

    pub fn map<U, F>(&self, mut f: F) -> Nested<U>
    where
        F: FnMut(&T) -> U,
    {
        fn walk<T, U, F>(node: &Nested<T>, f: &mut F) -> Nested<U>
        where
            F: FnMut(&T) -> U,
        {
            match node {
                Nested::Leaf(value) => Nested::Leaf(f(value)),
                Nested::Map(entries) => Nested::Map(
                    entries
                        .iter()
                        .map(|(key, child)| (key.clone(), walk(child, &mut *f)))
                        .collect(),
                ),
                Nested::Seq(items) => Nested::Seq(items.iter().map(|child| walk(child, &mut *f)).collect()),
            }
        }
        walk(self, &mut f)
    }

    pub fn try_map<U, F>(&self, mut f: F) -> Result<Nested<U>>
    where
        F: FnMut(&T) -> Result<U>,
    {
        self.try_map_with_path(|_, value| f(value))
    }

    /// Like [`Nested::try_map`], also handing the leaf path to `f`.
    pub fn try_map_with_path<U, F>(&self, mut f: F) -> Result<Nested<U>>
    where
        F: FnMut(&str, &T) -> Result<U>,
    {
        fn walk<T, U, F>(node: &Nested<T>, path: &str, f: &mut F) -> Result<Nested<U>>
        where
            F: FnMut(&str, &T) -> Result<U>,
        {
            match node {
                Nested::Leaf(value) => Ok(Nested::Leaf(f(path, value)?)),
                Nested::Map(entries) => {
                    let mut out = BTreeMap::new();
                    for (key, child) in entries {
                        out.insert(key.clone(), walk(child, &join(path, key), f)?);
                    }
                    Ok(Nested::Map(out))
                }
                Nested::Seq(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (index, child) in items.iter().enumerate() {
                        out.push(walk(child, &join(path, &index.to_string()), f)?);
                    }
                    Ok(Nested::Seq(out))
                }
            }
        }
        walk(self, "", &mut f)
    }

    /// Structure-preserving map over two trees with identical structure.
    pub fn try_zip_map<U, V, F>(&self, other: &Nested<U>, mut f: F) -> Result<Nested<V>>
    where
        F: FnMut(&T, &U) -> Result<V>,
    {
        fn walk<T, U, V, F>(
            left: &Nested<T>,
            right: &Nested<U>,
            path: &str,
            f: &mut F,
        ) -> Result<Nested<V>>
        where
            F: FnMut(&T, &U) -> Result<V>,
        {
            match (left, right) {
                (Nested::Leaf(a), Nested::Leaf(b)) => Ok(Nested::Leaf(f(a, b)?)),
                (Nested::Map(a), Nested::Map(b)) => {
                    if a.len() != b.len() || a.keys().any(|key| !b.contains_key(key)) {
                        return Err(PipelineError::structure(format!(
                            "mapping keys differ at {}",
                            at(path)
                        )));
                    }
                    let mut out = BTreeMap::new();
                    for (key, child) in a {
                        out.insert(key.clone(), walk(child, &b[key], &join(path, key), f)?);
                    }
                    Ok(Nested::Map(out))
                }
                (Nested::Seq(a), Nested::Seq(b)) if a.len() == b.len() => {
                    let mut out = Vec::with_capacity(a.len());
                    for (index, (x, y)) in a.iter().zip(b).enumerate() {
                        out.push(walk(x, y, &join(path, &index.to_string()), f)?);
                    }
                    Ok(Nested::Seq(out))
                }
                _ => Err(PipelineError::structure(format!(
                    "node kinds differ at {}",
                    at(path)
                ))),
            }
        }
        walk(self, other, "", &mut f)
    }

    /// Zips any number of same-structured trees, calling `f` with the leaves
    /// found at each position (in the order of `trees`).
    pub fn try_zip_many<U, F>(trees: &[&Nested<T>], mut f: F) -> Result<Nested<U>>
    where
        F: FnMut(&[&T]) -> Result<U>,
    {
        fn walk<T, U, F>(trees: &[&Nested<T>], path: &str, f: &mut F) -> Result<Nested<U>>
        where
            F: FnMut(&[&T]) -> Result<U>,
        {
            let mismatch = || PipelineError::structure(format!("node kinds differ at {}", at(path)));
            let first = trees
                .first()
                .ok_or_else(|| PipelineError::structure("cannot zip an empty list of trees"))?;
            match first {
                Nested::Leaf(_) => {
                    let leaves = trees
                        .iter()
                        .map(|tree| tree.as_leaf().ok_or_else(mismatch))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Nested::Leaf(f(&leaves)?))
                }
                Nested::Map(entries) => {
                    let mut out = BTreeMap::new();
                    for tree in trees {
                        match tree {
                            Nested::Map(other) if other.len() == entries.len() => {}
                            _ => return Err(mismatch()),
                        }
                    }
                    for key in entries.keys() {
                        let children = trees
                            .iter()
                            .map(|tree| {
                                tree.get(key).ok_or_else(|| {
                                    PipelineError::structure(format!(
                                        "missing key '{key}' at {}",
                                        at(path)
                                    ))
                                })
                            })
                            .collect::<Result<Vec<_>>>()?;
                        out.insert(key.clone(), walk(&children, &join(path, key), f)?);
                    }
                    Ok(Nested::Map(out))
                }
                Nested::Seq(items) => {
                    let mut columns: Vec<Vec<&Nested<T>>> =
                        (0..items.len()).map(|_| Vec::with_capacity(trees.len())).collect();
                    for tree in trees {
                        match tree {
                            Nested::Seq(other) if other.len() == items.len() => {
                                for (column, child) in columns.iter_mut().zip(other) {
                                    column.push(child);
                                }
                            }
                            _ => return Err(mismatch()),
                        }
                    }
                    let mut out = Vec::with_capacity(items.len());
                    for (index, column) in columns.iter().enumerate() {
                        out.push(walk(column, &join(path, &index.to_string()), f)?);
                    }
                    Ok(Nested::Seq(out))
                }
            }
        }
        walk(trees, "", &mut f)
    }
}

impl Nested<Tensor> {
    /// Stacks same-structured trees leafwise along a new axis `dim`.
    pub fn stack(trees: &[NestedTensor], dim: usize) -> Result<NestedTensor> {
        let refs: Vec<&NestedTensor> = trees.iter().collect();
        Nested::try_zip_many(&refs, |leaves| Ok(Tensor::stack(leaves, dim)?))
    }

    /// Selects index `i` of the leading axis of every leaf.
    pub fn index(&self, i: usize) -> Result<NestedTensor> {
        self.try_map(|leaf| Ok(leaf.get(i)?))
    }

    /// Cuts every leaf out of the autograd graph.
    pub fn detach(&self) -> NestedTensor {
        self.map(Tensor::detach)
    }

    /// Leaf shapes, mainly for logging.
    pub fn shapes(&self) -> Nested<Vec<usize>> {
        self.map(|leaf| leaf.dims().to_vec())
    }
}
