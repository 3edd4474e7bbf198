//! Program loading and the in-memory block graph.

use std::collections::HashSet;
use std::path::PathBuf;

use indexmap::IndexMap;
use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::error::RuntimeError;

use super::types::{Block, Edge, ProgramDefinition, VariableDefinition};
use super::StoreFuture;

pub const START_BLOCK: &str = "START";
pub const LABEL_BLOCK: &str = "LABEL";

/// Validated block map and edge list for one loaded program.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramGraph {
    pub program_id: SmolStr,
    pub name: Option<SmolStr>,
    blocks: IndexMap<SmolStr, Block>,
    edges: Vec<Edge>,
    variables: Vec<VariableDefinition>,
    entry: SmolStr,
}

impl ProgramGraph {
    /// Build and validate; `known_type` rejects block types with no executor.
    pub fn build(
        definition: &ProgramDefinition,
        known_type: impl Fn(&str) -> bool,
    ) -> Result<Self, RuntimeError> {
        let invalid = |message: String| RuntimeError::InvalidProgram(message.into());
        if definition.blocks.is_empty() {
            return Err(invalid(format!("program '{}' has no blocks", definition.id)));
        }
        let mut blocks = IndexMap::with_capacity(definition.blocks.len());
        for block in &definition.blocks {
            if block.id.trim().is_empty() {
                return Err(invalid("block id must not be empty".to_string()));
            }
            if !known_type(&block.block_type) {
                return Err(RuntimeError::NoExecutor(block.block_type.clone()));
            }
            if blocks.insert(block.id.clone(), block.clone()).is_some() {
                return Err(invalid(format!("duplicate block id '{}'", block.id)));
            }
        }
        for edge in &definition.edges {
            for end in [&edge.source, &edge.target] {
                if !blocks.contains_key(end) {
                    return Err(invalid(format!(
                        "edge {} -> {} references unknown block '{end}'",
                        edge.source, edge.target
                    )));
                }
            }
        }
        let mut labels = HashSet::new();
        for block in blocks.values().filter(|block| is_type(block, LABEL_BLOCK)) {
            let name = block.str_param("name").unwrap_or(block.id.as_str());
            if !labels.insert(name) {
                return Err(invalid(format!("duplicate label '{name}'")));
            }
        }
        let entry = blocks
            .values()
            .find(|block| is_type(block, START_BLOCK))
            .or_else(|| blocks.values().next())
            .map(|block| block.id.clone())
            .ok_or_else(|| invalid("program has no entry block".to_string()))?;
        Ok(Self {
            program_id: definition.id.clone(),
            name: definition.name.clone(),
            blocks,
            edges: definition.edges.clone(),
            variables: definition.variables.clone(),
            entry,
        })
    }

    /// First block of a run: the START block if present, else the first listed.
    #[must_use]
    pub fn entry(&self) -> &SmolStr {
        &self.entry
    }

    #[must_use]
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    #[must_use]
    pub fn variables(&self) -> &[VariableDefinition] {
        &self.variables
    }

    /// First outgoing edge of `id` accepted by `accept`, in definition order.
    fn first_edge(&self, id: &str, accept: impl Fn(&Edge) -> bool) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|edge| edge.source == id && accept(edge))
    }

    /// Successor when the executor does not choose one: the first unlabelled
    /// outgoing edge, else the first outgoing edge.
    #[must_use]
    pub fn default_next(&self, id: &str) -> Option<&SmolStr> {
        self.first_edge(id, |edge| edge.handle.is_none())
            .or_else(|| self.first_edge(id, |_| true))
            .map(|edge| &edge.target)
    }

    /// First outgoing edge without a handle.
    #[must_use]
    pub fn unlabelled_next(&self, id: &str) -> Option<&SmolStr> {
        self.first_edge(id, |edge| edge.handle.is_none())
            .map(|edge| &edge.target)
    }

    /// Target of the outgoing edge carrying `handle` (case-insensitive).
    #[must_use]
    pub fn handle_target(&self, id: &str, handle: &str) -> Option<&SmolStr> {
        self.first_edge(id, |edge| {
            edge.handle
                .as_deref()
                .is_some_and(|label| label.eq_ignore_ascii_case(handle))
        })
        .map(|edge| &edge.target)
    }

    /// Block id of the LABEL block named `name`.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&SmolStr> {
        self.blocks
            .values()
            .filter(|block| is_type(block, LABEL_BLOCK))
            .find(|block| block.str_param("name").unwrap_or(block.id.as_str()) == name)
            .map(|block| &block.id)
    }
}

fn is_type(block: &Block, block_type: &str) -> bool {
    block.block_type.eq_ignore_ascii_case(block_type)
}

/// Where program definitions come from.
pub trait ProgramSource: Send + Sync {
    fn load(&self, program_id: &str) -> StoreFuture<'_, Result<ProgramDefinition, RuntimeError>>;
}

/// In-memory programs (tests, embedding).
#[derive(Debug, Default)]
pub struct MemoryProgramSource {
    programs: RwLock<IndexMap<SmolStr, ProgramDefinition>>,
}

impl MemoryProgramSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, program: ProgramDefinition) {
        self.programs.write().insert(program.id.clone(), program);
    }

    #[must_use]
    pub fn with(self, program: ProgramDefinition) -> Self {
        self.insert(program);
        self
    }
}

impl ProgramSource for MemoryProgramSource {
    fn load(&self, program_id: &str) -> StoreFuture<'_, Result<ProgramDefinition, RuntimeError>> {
        let program = self.programs.read().get(program_id).cloned().ok_or_else(|| {
            RuntimeError::ProgramSource(format!("program '{program_id}' not found").into())
        });
        Box::pin(async move { program })
    }
}

/// `<dir>/<program id>.json` files.
#[derive(Debug, Clone)]
pub struct DirectoryProgramSource {
    root: PathBuf,
}

impl DirectoryProgramSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, program_id: &str) -> Result<PathBuf, RuntimeError> {
        let valid = !program_id.is_empty()
            && program_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
            && !program_id.starts_with('.');
        if !valid {
            return Err(RuntimeError::ProgramSource(
                format!("invalid program id '{program_id}'").into(),
            ));
        }
        Ok(self.root.join(format!("{program_id}.json")))
    }
}

impl ProgramSource for DirectoryProgramSource {
    fn load(&self, program_id: &str) -> StoreFuture<'_, Result<ProgramDefinition, RuntimeError>> {
        let path = self.path_for(program_id);
        let program_id = SmolStr::new(program_id);
        Box::pin(async move {
            let path = path?;
            let bytes = tokio::fs::read(&path).await.map_err(|err| {
                RuntimeError::ProgramSource(format!("read {}: {err}", path.display()).into())
            })?;
            let program: ProgramDefinition = serde_json::from_slice(&bytes).map_err(|err| {
                RuntimeError::ProgramSource(format!("parse {}: {err}", path.display()).into())
            })?;
            if program.id != program_id {
                return Err(RuntimeError::ProgramSource(
                    format!(
                        "{} declares id '{}', expected '{program_id}'",
                        path.display(),
                        program.id
                    )
                    .into(),
                ));
            }
            Ok(program)
        })
    }
}
