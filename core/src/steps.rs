//! Step Tree
//!
//! Ordered, optionally nested steps of a process definition. A tree is only
//! ever constructed through [`StepTree::build`] or grown through
//! [`StepTree::insert`], both of which enforce:
//! - step ids are unique
//! - a parent reference points at a step of the same process
//! - positions are unique among siblings (root steps share one sibling scope)
//! - the parent chain never loops back on itself

use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, EngineResult};
use crate::types::Step;

#[derive(Debug, Clone, Default)]
pub struct StepTree {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
}

impl StepTree {
    /// Validate and index a set of steps loaded from storage or authored in bulk
    pub fn build(steps: Vec<Step>) -> EngineResult<Self> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(EngineError::validation(format!(
                    "Duplicate step id: {}",
                    step.id
                )));
            }
        }

        let tree = Self { steps, index };
        tree.validate_links()?;
        Ok(tree)
    }

    fn validate_links(&self) -> EngineResult<()> {
        let mut sibling_positions: HashSet<(Option<&str>, i64)> = HashSet::new();
        for step in &self.steps {
            if let Some(parent_id) = step.parent_step_id.as_deref() {
                let parent = self.get(parent_id).ok_or_else(|| {
                    EngineError::validation(format!(
                        "Step {} references unknown parent {}",
                        step.id, parent_id
                    ))
                })?;
                if parent.process_id != step.process_id {
                    return Err(EngineError::validation(format!(
                        "Step {} and its parent {} belong to different processes",
                        step.id, parent_id
                    )));
                }
            }
            if !sibling_positions.insert((step.parent_step_id.as_deref(), step.position)) {
                return Err(EngineError::validation(format!(
                    "Position {} is already taken among the siblings of step {}",
                    step.position, step.id
                )));
            }
        }

        for step in &self.steps {
            self.check_parent_chain(&step.id, step.parent_step_id.as_deref())?;
        }
        Ok(())
    }

    /// Check that `step` could be added without breaking the tree invariants
    pub fn validate_insert(&self, step: &Step) -> EngineResult<()> {
        if self.index.contains_key(&step.id) {
            return Err(EngineError::validation(format!(
                "Duplicate step id: {}",
                step.id
            )));
        }
        if let Some(parent_id) = step.parent_step_id.as_deref() {
            if parent_id == step.id {
                return Err(EngineError::validation(format!(
                    "Step {} cannot be its own parent",
                    step.id
                )));
            }
            let parent = self.get(parent_id).ok_or_else(|| {
                EngineError::validation(format!(
                    "Step {} references unknown parent {}",
                    step.id, parent_id
                ))
            })?;
            if parent.process_id != step.process_id {
                return Err(EngineError::validation(format!(
                    "Step {} and its parent {} belong to different processes",
                    step.id, parent_id
                )));
            }
        }
        let taken = self
            .siblings_of(step.parent_step_id.as_deref())
            .iter()
            .any(|sibling| sibling.position == step.position);
        if taken {
            return Err(EngineError::validation(format!(
                "Position {} is already taken among the siblings of step {}",
                step.position, step.id
            )));
        }
        self.check_parent_chain(&step.id, step.parent_step_id.as_deref())
    }

    pub fn insert(&mut self, step: Step) -> EngineResult<()> {
        self.validate_insert(&step)?;
        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    /// Walk up from `parent_id`, failing if `step_id` reappears or the walk
    /// outlasts the number of steps
    fn check_parent_chain(&self, step_id: &str, parent_id: Option<&str>) -> EngineResult<()> {
        let mut current = parent_id;
        let mut hops = 0usize;
        while let Some(id) = current {
            if id == step_id || hops > self.steps.len() {
                return Err(EngineError::validation(format!(
                    "Cycle detected in the parent chain of step {}",
                    step_id
                )));
            }
            hops += 1;
            current = self.get(id).and_then(|s| s.parent_step_id.as_deref());
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn siblings_of(&self, parent_id: Option<&str>) -> Vec<&Step> {
        let mut siblings: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.parent_step_id.as_deref() == parent_id)
            .collect();
        siblings.sort_by_key(|s| s.position);
        siblings
    }

    /// Root steps ordered by position
    pub fn roots(&self) -> Vec<&Step> {
        self.siblings_of(None)
    }

    /// Direct children of a step ordered by position
    pub fn children(&self, parent_id: &str) -> Vec<&Step> {
        self.siblings_of(Some(parent_id))
    }

    /// Parent chain of a step, nearest first
    pub fn ancestors(&self, id: &str) -> Vec<&Step> {
        let mut chain = Vec::new();
        let mut current = self.get(id).and_then(|s| s.parent_step_id.as_deref());
        while let Some(parent_id) = current {
            match self.get(parent_id) {
                Some(parent) if chain.len() < self.steps.len() => {
                    chain.push(parent);
                    current = parent.parent_step_id.as_deref();
                }
                _ => break,
            }
        }
        chain
    }

    /// Pre-order traversal following positions, the order steps are presented
    /// and exported in
    pub fn depth_first(&self) -> Vec<&Step> {
        let mut ordered = Vec::with_capacity(self.steps.len());
        let mut stack: Vec<&Step> = self.roots().into_iter().rev().collect();
        while let Some(step) = stack.pop() {
            ordered.push(step);
            stack.extend(self.children(&step.id).into_iter().rev());
        }
        ordered
    }

    /// Active steps whose ancestors are all active, in traversal order
    pub fn active_steps(&self) -> Vec<&Step> {
        self.depth_first()
            .into_iter()
            .filter(|step| step.is_active && self.ancestors(&step.id).iter().all(|a| a.is_active))
            .collect()
    }

    /// First active leaf in traversal order
    pub fn first_runnable_step(&self) -> Option<&Step> {
        self.active_steps()
            .into_iter()
            .find(|step| self.children(&step.id).iter().all(|c| !c.is_active))
    }
}
