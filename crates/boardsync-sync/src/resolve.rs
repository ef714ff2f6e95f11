use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use boardsync_core::{CanonicalEntity, EntityKind};
use boardsync_storage::{ProjectStore, StoreError};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;

use crate::config::ALIASES_FILE;

/// Minimum Jaro-Winkler similarity for a "did you mean" hint in the run report.
pub const SUGGESTION_THRESHOLD: f64 = 0.85;

/// Collapses runs of whitespace and uppercases, so `" yash  patel"` keys as `"YASH PATEL"`.
pub fn name_key(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Board spellings mapped to canonical store names. Keys match exactly, after trimming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasTable {
    #[serde(default)]
    pub developers: BTreeMap<String, String>,
    #[serde(default)]
    pub teams: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).context("parsing alias table")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&data).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        Self::load(&root.join(ALIASES_FILE))
    }

    pub fn with_alias(mut self, kind: EntityKind, alias: &str, canonical: &str) -> Self {
        self.table_mut(kind)
            .insert(alias.to_string(), canonical.to_string());
        self
    }

    pub fn canonical_for(&self, kind: EntityKind, name: &str) -> Option<&str> {
        self.table(kind).get(name.trim()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.developers.len() + self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self, kind: EntityKind) -> &BTreeMap<String, String> {
        match kind {
            EntityKind::Developer => &self.developers,
            EntityKind::Team => &self.teams,
        }
    }

    fn table_mut(&mut self, kind: EntityKind) -> &mut BTreeMap<String, String> {
        match kind {
            EntityKind::Developer => &mut self.developers,
            EntityKind::Team => &mut self.teams,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnresolvedReason {
    NoMapping,
    /// The alias table points at a canonical name the store does not hold.
    AliasTargetMissing { canonical: String },
    /// `team_name_map` points at a team id the store does not hold.
    MappedIdMissing { team_id: i32 },
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::NoMapping => f.write_str("no alias or canonical match"),
            UnresolvedReason::AliasTargetMissing { canonical } => {
                write!(f, "alias target {canonical:?} is not in the store")
            }
            UnresolvedReason::MappedIdMissing { team_id } => {
                write!(f, "team_name_map points at unknown team id {team_id}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("unresolved {kind} name {name:?}: {reason}")]
pub struct Unresolved {
    pub kind: EntityKind,
    pub name: String,
    pub reason: UnresolvedReason,
}

/// Canonical entity sets loaded from the store once per run.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub developers: Vec<CanonicalEntity>,
    pub teams: Vec<CanonicalEntity>,
    pub team_name_map: Vec<(String, i32)>,
}

impl ReferenceData {
    pub async fn load(store: &dyn ProjectStore) -> Result<Self, StoreError> {
        Ok(Self {
            developers: store.load_developers().await?,
            teams: store.load_teams().await?,
            team_name_map: store.load_team_name_map().await?,
        })
    }
}

#[derive(Debug, Default)]
struct EntityIndex {
    by_key: HashMap<String, i32>,
    ids: HashMap<i32, String>,
    names: Vec<String>,
}

impl EntityIndex {
    fn build(entities: &[CanonicalEntity]) -> Self {
        let mut index = Self::default();
        for entity in entities {
            let key = name_key(&entity.canonical_name);
            if key.is_empty() {
                continue;
            }
            // First row wins when the store holds the same name twice.
            index.by_key.entry(key).or_insert(entity.internal_id);
            index
                .ids
                .entry(entity.internal_id)
                .or_insert_with(|| entity.canonical_name.clone());
            index.names.push(entity.canonical_name.clone());
        }
        index
    }

    fn lookup(&self, name: &str) -> Option<i32> {
        self.by_key.get(&name_key(name)).copied()
    }
}

/// Read-only name resolution over one run's alias table and store reference data.
#[derive(Debug)]
pub struct IdentityResolver {
    aliases: AliasTable,
    developers: EntityIndex,
    teams: EntityIndex,
    team_name_map: HashMap<String, i32>,
}

impl IdentityResolver {
    pub fn new(aliases: AliasTable, reference: &ReferenceData) -> Self {
        let mut team_name_map = HashMap::new();
        for (board_name, team_id) in &reference.team_name_map {
            team_name_map.entry(name_key(board_name)).or_insert(*team_id);
        }
        Self {
            aliases,
            developers: EntityIndex::build(&reference.developers),
            teams: EntityIndex::build(&reference.teams),
            team_name_map,
        }
    }

    pub fn entity_count(&self, kind: EntityKind) -> usize {
        self.index(kind).ids.len()
    }

    /// Alias table, then `team_name_map` for teams, then a direct canonical match.
    pub fn resolve(&self, name: &str, kind: EntityKind) -> Result<i32, Unresolved> {
        let index = self.index(kind);
        let unresolved = |reason| Unresolved {
            kind,
            name: name.trim().to_string(),
            reason,
        };

        if let Some(canonical) = self.aliases.canonical_for(kind, name) {
            return index
                .lookup(canonical)
                .ok_or_else(|| {
                    unresolved(UnresolvedReason::AliasTargetMissing {
                        canonical: canonical.to_string(),
                    })
                });
        }

        if kind == EntityKind::Team {
            if let Some(&team_id) = self.team_name_map.get(&name_key(name)) {
                return if index.ids.contains_key(&team_id) {
                    Ok(team_id)
                } else {
                    Err(unresolved(UnresolvedReason::MappedIdMissing { team_id }))
                };
            }
        }

        index
            .lookup(name)
            .ok_or_else(|| unresolved(UnresolvedReason::NoMapping))
    }

    /// Closest canonical spelling, for the operator. Never used to resolve.
    pub fn suggest(&self, name: &str, kind: EntityKind) -> Option<String> {
        let key = name_key(name);
        self.index(kind)
            .names
            .iter()
            .map(|candidate| (jaro_winkler(&key, &name_key(candidate)), candidate))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, candidate)| candidate.clone())
    }

    fn index(&self, kind: EntityKind) -> &EntityIndex {
        match kind {
            EntityKind::Developer => &self.developers,
            EntityKind::Team => &self.teams,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: i32, name: &str) -> CanonicalEntity {
        CanonicalEntity {
            internal_id: id,
            canonical_name: name.to_string(),
        }
    }

    fn reference() -> ReferenceData {
        ReferenceData {
            developers: vec![
                entity(11, "HARISHKUMAR GUNDAMEEDI"),
                entity(12, "ROMAL PATEL"),
                entity(13, "YASH PATEL"),
            ],
            teams: vec![
                entity(3, "Payments"),
                entity(4, "Core Platform"),
                entity(5, "Data Services"),
            ],
            team_name_map: vec![("Digital Front Door".to_string(), 5)],
        }
    }

    fn aliases() -> AliasTable {
        AliasTable::default()
            .with_alias(EntityKind::Developer, "Harish Gundameedi", "HARISHKUMAR GUNDAMEEDI")
            .with_alias(EntityKind::Developer, "Harishkumar Gundameedi", "HARISHKUMAR GUNDAMEEDI")
            .with_alias(EntityKind::Developer, "Tariq Islam", "TARIQ ISLAM")
            .with_alias(EntityKind::Team, "Core", "Core Platform")
    }

    #[test]
    fn aliases_collapse_to_one_developer() {
        let resolver = IdentityResolver::new(aliases(), &reference());
        let short = resolver
            .resolve("Harish Gundameedi", EntityKind::Developer)
            .unwrap();
        let long = resolver
            .resolve("Harishkumar Gundameedi", EntityKind::Developer)
            .unwrap();
        assert_eq!(short, 11);
        assert_eq!(short, long);
    }

    #[test]
    fn direct_match_ignores_case_and_spacing() {
        let resolver = IdentityResolver::new(AliasTable::default(), &reference());
        assert_eq!(resolver.resolve(" yash   patel ", EntityKind::Developer), Ok(13));
        assert_eq!(resolver.resolve("core platform", EntityKind::Team), Ok(4));
    }

    #[test]
    fn team_name_map_is_consulted_before_canonical_names() {
        let resolver = IdentityResolver::new(aliases(), &reference());
        assert_eq!(resolver.resolve("Digital Front Door", EntityKind::Team), Ok(5));
        assert_eq!(resolver.resolve("Core", EntityKind::Team), Ok(4));
    }

    #[test]
    fn alias_to_a_missing_canonical_name_is_unresolved() {
        let resolver = IdentityResolver::new(aliases(), &reference());
        let err = resolver
            .resolve("Tariq Islam", EntityKind::Developer)
            .unwrap_err();
        assert_eq!(err.kind, EntityKind::Developer);
        assert_eq!(
            err.reason,
            UnresolvedReason::AliasTargetMissing {
                canonical: "TARIQ ISLAM".into()
            }
        );
    }

    #[test]
    fn unknown_names_get_a_hint_but_never_resolve() {
        let resolver = IdentityResolver::new(AliasTable::default(), &reference());
        let err = resolver
            .resolve("Romal Pattel", EntityKind::Developer)
            .unwrap_err();
        assert_eq!(err.reason, UnresolvedReason::NoMapping);
        assert_eq!(
            resolver.suggest("Romal Pattel", EntityKind::Developer).as_deref(),
            Some("ROMAL PATEL")
        );
        assert_eq!(resolver.suggest("Analytics Guild", EntityKind::Team), None);
    }

    #[test]
    fn alias_yaml_parses_both_tables() {
        let table = AliasTable::from_yaml_str(
            "developers:\n  Anusha Reddy Kallu: ANUSHA KALLU\nteams:\n  Core: Core Platform\n",
        )
        .unwrap();
        assert_eq!(
            table.canonical_for(EntityKind::Developer, " Anusha Reddy Kallu "),
            Some("ANUSHA KALLU")
        );
        assert_eq!(table.canonical_for(EntityKind::Team, "Core"), Some("Core Platform"));
        assert_eq!(table.len(), 2);
    }
}
