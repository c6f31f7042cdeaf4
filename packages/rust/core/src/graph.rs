//! Static stage dependency table.
//!
//! The per-item pipeline is a small fixed DAG:
//!
//! ```text
//!              Scrape
//!             /      \
//!   EnrichCompany   EnrichLeads
//!         |              |
//!   ExportCompany   ExportLeads
//!             \      /
//!              Import        (batch-level)
//! ```
//!
//! [`StageGraph::validated`] checks the table once (acyclic, single root)
//! and precomputes the waves the scheduler runs; stages within a wave are
//! independent and run concurrently.

use std::collections::{BTreeMap, BTreeSet};

use dealdriver_shared::{DealDriverError, Result, Stage};

/// Each stage and the stages whose artifacts it reads.
pub const STAGE_TABLE: &[(Stage, &[Stage])] = &[
    (Stage::Scrape, &[]),
    (Stage::EnrichCompany, &[Stage::Scrape]),
    (Stage::EnrichLeads, &[Stage::Scrape]),
    (Stage::ExportCompany, &[Stage::EnrichCompany]),
    (Stage::ExportLeads, &[Stage::EnrichLeads]),
    (Stage::Import, &[Stage::ExportCompany, Stage::ExportLeads]),
];

/// A validated stage graph.
#[derive(Debug, Clone)]
pub struct StageGraph {
    deps: BTreeMap<Stage, Vec<Stage>>,
    waves: Vec<Vec<Stage>>,
    root: Stage,
}

impl StageGraph {
    /// The built-in pipeline graph.
    pub fn pipeline() -> Result<Self> {
        Self::validated(STAGE_TABLE)
    }

    /// Validate an adjacency table and compute its execution waves.
    pub fn validated(table: &[(Stage, &[Stage])]) -> Result<Self> {
        let mut deps: BTreeMap<Stage, Vec<Stage>> = BTreeMap::new();
        for (stage, upstream) in table {
            if deps.insert(*stage, upstream.to_vec()).is_some() {
                return Err(DealDriverError::validation(format!(
                    "stage {stage} listed twice"
                )));
            }
        }
        for (stage, upstream) in &deps {
            for dep in upstream {
                if !deps.contains_key(dep) {
                    return Err(DealDriverError::validation(format!(
                        "{stage} depends on unknown stage {dep}"
                    )));
                }
            }
        }

        let roots: Vec<Stage> = deps
            .iter()
            .filter(|(_, upstream)| upstream.is_empty())
            .map(|(stage, _)| *stage)
            .collect();
        let root = match roots.as_slice() {
            [root] => *root,
            [] => return Err(DealDriverError::validation("stage graph has no root")),
            many => {
                return Err(DealDriverError::validation(format!(
                    "stage graph has {} roots, expected one",
                    many.len()
                )));
            }
        };

        // Kahn's algorithm, one wave per layer.
        let mut remaining: BTreeMap<Stage, BTreeSet<Stage>> = deps
            .iter()
            .map(|(stage, upstream)| (*stage, upstream.iter().copied().collect()))
            .collect();
        let mut waves = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<Stage> = remaining
                .iter()
                .filter(|(_, upstream)| upstream.is_empty())
                .map(|(stage, _)| *stage)
                .collect();
            if ready.is_empty() {
                let stuck: Vec<&str> = remaining.keys().map(Stage::as_str).collect();
                return Err(DealDriverError::validation(format!(
                    "stage graph has a cycle through {}",
                    stuck.join(", ")
                )));
            }
            for stage in &ready {
                remaining.remove(stage);
            }
            for upstream in remaining.values_mut() {
                for stage in &ready {
                    upstream.remove(stage);
                }
            }
            waves.push(ready);
        }

        Ok(Self { deps, waves, root })
    }

    pub fn root(&self) -> Stage {
        self.root
    }

    /// Direct dependencies of `stage`.
    pub fn dependencies(&self, stage: Stage) -> &[Stage] {
        self.deps.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All waves, in execution order.
    pub fn waves(&self) -> &[Vec<Stage>] {
        &self.waves
    }

    /// Waves restricted to per-item stages.
    pub fn item_waves(&self) -> Vec<Vec<Stage>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().copied().filter(Stage::is_per_item).collect::<Vec<_>>())
            .filter(|wave| !wave.is_empty())
            .collect()
    }

    /// Per-item stages in execution order.
    pub fn item_stages(&self) -> Vec<Stage> {
        self.item_waves().into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_waves() {
        let graph = StageGraph::pipeline().unwrap();
        assert_eq!(graph.root(), Stage::Scrape);
        assert_eq!(
            graph.waves(),
            &[
                vec![Stage::Scrape],
                vec![Stage::EnrichCompany, Stage::EnrichLeads],
                vec![Stage::ExportCompany, Stage::ExportLeads],
                vec![Stage::Import],
            ]
        );
        assert_eq!(graph.item_waves().len(), 3);
        assert_eq!(graph.item_stages().len(), 5);
        assert_eq!(graph.dependencies(Stage::ExportLeads), &[Stage::EnrichLeads]);
    }

    #[test]
    fn rejects_cycle() {
        let table: &[(Stage, &[Stage])] = &[
            (Stage::Scrape, &[]),
            (Stage::EnrichCompany, &[Stage::Scrape, Stage::ExportCompany]),
            (Stage::ExportCompany, &[Stage::EnrichCompany]),
        ];
        let err = StageGraph::validated(table).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_multiple_roots() {
        let table: &[(Stage, &[Stage])] = &[(Stage::Scrape, &[]), (Stage::EnrichLeads, &[])];
        let err = StageGraph::validated(table).unwrap_err();
        assert!(err.to_string().contains("2 roots"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let table: &[(Stage, &[Stage])] = &[
            (Stage::Scrape, &[]),
            (Stage::ExportLeads, &[Stage::EnrichLeads]),
        ];
        assert!(StageGraph::validated(table).is_err());
    }
}
