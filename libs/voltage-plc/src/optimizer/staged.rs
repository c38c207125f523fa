//! Staged optimizer: composable partitioning rules
//!
//! A request starts as one [`Fragment`] inside an [`Ensemble`]. Each stage is
//! an [`OptimizerCondition`]; a stage rewrites every fragment that violates it
//! into smaller fragments. Stages run in order, so rules compose: group by
//! memory area first, then cap each group at the packet limit. The ensemble
//! records the stages it went through so the split can be traced in logs.
//!
//! Merging needs no per-stage reversal: the shared merge in the parent module
//! reassembles by tag name, whatever shape the fragments ended up in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use errors::{PlcError, PlcResult};
use tracing::debug;

use super::{RequestOptimizer, SplitPlan};
use crate::model::{PlcTag, RequestKind};

static NEXT_ENSEMBLE_ID: AtomicU64 = AtomicU64::new(1);

/// A group of request items, identified within its ensemble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    id: usize,
    indices: Vec<usize>,
    owner: Option<u64>,
}

impl Fragment {
    /// Free-standing fragment, not yet owned by an ensemble
    pub fn new(indices: Vec<usize>) -> Self {
        Self {
            id: 0,
            indices,
            owner: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Positions of the items in the original request
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn owner(&self) -> Option<u64> {
        self.owner
    }
}

/// Fragments of one request plus the stages applied to them
#[derive(Debug)]
pub struct Ensemble {
    id: u64,
    fragments: Vec<Fragment>,
    stages: Vec<String>,
    next_fragment: usize,
}

impl Ensemble {
    /// Ensemble holding a single fragment that covers `item_count` items
    pub fn new(item_count: usize) -> PlcResult<Self> {
        let mut ensemble = Self {
            id: NEXT_ENSEMBLE_ID.fetch_add(1, Ordering::Relaxed),
            fragments: Vec::new(),
            stages: Vec::new(),
            next_fragment: 0,
        };
        ensemble.adopt(Fragment::new((0..item_count).collect()))?;
        Ok(ensemble)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Take ownership of a fragment; fails if another ensemble owns it
    pub fn adopt(&mut self, mut fragment: Fragment) -> PlcResult<usize> {
        if let Some(owner) = fragment.owner {
            if owner != self.id {
                return Err(PlcError::Internal(format!(
                    "fragment {} already belongs to ensemble {}",
                    fragment.id, owner
                )));
            }
            if self.fragments.iter().any(|f| f.id == fragment.id) {
                return Err(PlcError::Internal(format!(
                    "fragment {} is already part of ensemble {}",
                    fragment.id, self.id
                )));
            }
        }
        self.next_fragment += 1;
        fragment.id = self.next_fragment;
        fragment.owner = Some(self.id);
        let id = fragment.id;
        self.fragments.push(fragment);
        Ok(id)
    }

    /// Replace one fragment by the given groups, recording `stage`
    ///
    /// The replacement keeps the fragment's place in the ensemble; empty
    /// groups are dropped.
    pub fn replace(
        &mut self,
        fragment_id: usize,
        groups: Vec<Vec<usize>>,
        stage: &str,
    ) -> PlcResult<()> {
        let pos = self
            .fragments
            .iter()
            .position(|f| f.id == fragment_id)
            .ok_or_else(|| {
                PlcError::Internal(format!(
                    "fragment {} not in ensemble {}",
                    fragment_id, self.id
                ))
            })?;
        self.fragments.remove(pos);

        let mut replacements = Vec::with_capacity(groups.len());
        for group in groups.into_iter().filter(|g| !g.is_empty()) {
            self.next_fragment += 1;
            replacements.push(Fragment {
                id: self.next_fragment,
                indices: group,
                owner: Some(self.id),
            });
        }
        let count = replacements.len();
        self.fragments.splice(pos..pos, replacements);

        if self.stages.last().map(String::as_str) != Some(stage) {
            self.stages.push(stage.to_string());
        }
        debug!(ensemble = self.id, fragment_id, stage, into = count, "Fragment rewritten");
        Ok(())
    }

    /// True while the ensemble is still the single untouched fragment
    pub fn is_untouched(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn into_groups(self) -> Vec<Vec<usize>> {
        self.fragments.into_iter().map(|f| f.indices).collect()
    }
}

/// One optimization stage: detect a constraint violation and rewrite it
pub trait OptimizerCondition: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn violated(&self, fragment: &Fragment, tags: &[(&str, &PlcTag)]) -> bool;

    /// Groups of item indices replacing the violating fragment
    fn rewrite(&self, fragment: &Fragment, tags: &[(&str, &PlcTag)]) -> Vec<Vec<usize>>;
}

/// Caps the number of items in one sub-request
#[derive(Debug, Clone, Copy)]
pub struct MaxTagsPerRequest(pub usize);

impl OptimizerCondition for MaxTagsPerRequest {
    fn name(&self) -> &str {
        "max-tags-per-request"
    }

    fn violated(&self, fragment: &Fragment, _tags: &[(&str, &PlcTag)]) -> bool {
        fragment.len() > self.0.max(1)
    }

    fn rewrite(&self, fragment: &Fragment, _tags: &[(&str, &PlcTag)]) -> Vec<Vec<usize>> {
        fragment
            .indices()
            .chunks(self.0.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }
}

/// Keeps items of different memory areas out of the same sub-request
///
/// The area is the address text before `separator` (`DB1` in `DB1.DBW0`).
#[derive(Debug, Clone, Copy)]
pub struct SplitByAddressArea {
    pub separator: char,
}

impl SplitByAddressArea {
    fn area<'a>(&self, tag: &'a PlcTag) -> &'a str {
        let address = tag.address();
        address
            .split_once(self.separator)
            .map_or(address, |(area, _)| area)
    }

    fn areas<'a>(
        &self,
        fragment: &Fragment,
        tags: &[(&str, &'a PlcTag)],
    ) -> BTreeMap<&'a str, Vec<usize>> {
        let mut areas: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for &i in fragment.indices() {
            if let Some((_, tag)) = tags.get(i) {
                areas.entry(self.area(tag)).or_default().push(i);
            }
        }
        areas
    }
}

impl OptimizerCondition for SplitByAddressArea {
    fn name(&self) -> &str {
        "split-by-address-area"
    }

    fn violated(&self, fragment: &Fragment, tags: &[(&str, &PlcTag)]) -> bool {
        self.areas(fragment, tags).len() > 1
    }

    fn rewrite(&self, fragment: &Fragment, tags: &[(&str, &PlcTag)]) -> Vec<Vec<usize>> {
        self.areas(fragment, tags).into_values().collect()
    }
}

/// Runs its conditions in order over the fragments of each request
#[derive(Debug, Default)]
pub struct StagedOptimizer {
    stages: Vec<Box<dyn OptimizerCondition>>,
}

impl StagedOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, condition: impl OptimizerCondition + 'static) -> Self {
        self.stages.push(Box::new(condition));
        self
    }

    /// Apply every stage to a fresh ensemble
    pub fn optimize(&self, tags: &[(&str, &PlcTag)]) -> PlcResult<Ensemble> {
        let mut ensemble = Ensemble::new(tags.len())?;
        for condition in &self.stages {
            let violating: Vec<(usize, Vec<Vec<usize>>)> = ensemble
                .fragments()
                .iter()
                .filter(|f| condition.violated(f, tags))
                .map(|f| (f.id(), condition.rewrite(f, tags)))
                .collect();
            for (fragment_id, groups) in violating {
                ensemble.replace(fragment_id, groups, condition.name())?;
            }
        }
        Ok(ensemble)
    }
}

impl RequestOptimizer for StagedOptimizer {
    fn name(&self) -> &str {
        "staged"
    }

    fn plan(&self, kind: RequestKind, tags: &[(&str, &PlcTag)]) -> SplitPlan {
        match self.optimize(tags) {
            Ok(ensemble) if ensemble.is_untouched() => SplitPlan::Unchanged,
            Ok(ensemble) => {
                debug!(
                    %kind,
                    stages = ?ensemble.stages(),
                    parts = ensemble.fragments().len(),
                    "Staged plan"
                );
                SplitPlan::Split(ensemble.into_groups())
            },
            Err(e) => {
                debug!(%kind, "Staged optimization failed, sending request unchanged: {}", e);
                SplitPlan::Unchanged
            },
        }
    }
}
