//! Pre-loaded in-memory cache of all evaluator-relevant tables
//!
//! Built once at startup from a consistent snapshot of the store; immutable
//! afterwards, so request workers can share it by reference without locking.
//! The large set-valued indexes are kept as sorted integer vectors so the
//! per-package definition lookup can use sorted-vector intersection.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::rpm::Evr;
use crate::storage::SqliteStore;

/// Repository lookup key: (content-set label, basearch id, releasever)
pub type RepoKey = (String, Option<i64>, Option<String>);

/// Definition type and root criteria
#[derive(Debug, Clone, Copy)]
pub struct DefinitionDetail {
    pub definition_type: i64,
    pub criteria_id: Option<i64>,
}

/// Candidate package name and existence check of an rpminfo test
#[derive(Debug, Clone, Copy)]
pub struct TestDetail {
    pub package_name_id: i64,
    pub check_existence: i64,
}

/// One evaluable state attached to a test
#[derive(Debug, Clone, Copy)]
pub struct StateRef {
    pub state_id: i64,
    pub evr_id: i64,
    pub evr_operation: i64,
}

#[derive(Debug, Default)]
pub struct Cache {
    pub arch2id: HashMap<String, i64>,
    pub id2arch: HashMap<i64, String>,
    pub packagename2id: HashMap<String, i64>,
    pub id2evr: HashMap<i64, Evr>,
    pub repo2id: HashMap<RepoKey, i64>,
    pub label2content_set_id: HashMap<String, i64>,
    pub repo_id2cpe_ids: HashMap<i64, Vec<i64>>,
    pub content_set_id2cpe_ids: HashMap<i64, Vec<i64>>,
    pub cpe_id2definition_ids: HashMap<i64, Vec<i64>>,
    pub packagename_id2definition_ids: HashMap<i64, Vec<i64>>,
    pub definition_detail: HashMap<i64, DefinitionDetail>,
    pub definition_id2cves: HashMap<i64, Vec<String>>,
    pub criteria_id2operator: HashMap<i64, i64>,
    pub criteria_id2dep_criteria_ids: HashMap<i64, Vec<i64>>,
    pub criteria_id2dep_test_ids: HashMap<i64, Vec<i64>>,
    pub criteria_id2dep_module_test_ids: HashMap<i64, Vec<i64>>,
    pub test_detail: HashMap<i64, TestDetail>,
    pub test_id2states: HashMap<i64, Vec<StateRef>>,
    pub module_test_id2stream: HashMap<i64, String>,
    pub state_id2arch_ids: HashMap<i64, HashSet<i64>>,
}

impl Cache {
    /// Load every index from the store in one consistent snapshot.
    pub fn load(store: &SqliteStore) -> Result<Self> {
        tracing::info!("Loading evaluator cache from store");
        let cache = store
            .snapshot(Self::load_from)
            .context("Failed to load evaluator cache")?;
        tracing::info!(
            packages = cache.packagename2id.len(),
            definitions = cache.definition_detail.len(),
            "Loaded evaluator cache"
        );
        Ok(cache)
    }

    fn load_from(conn: &Connection) -> Result<Cache> {
        let mut cache = Cache::default();

        let mut stmt = conn.prepare("SELECT id, name FROM arch")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let name: String = row.get(1)?;
            cache.id2arch.insert(id, name.clone());
            cache.arch2id.insert(name, id);
        }

        let mut stmt = conn.prepare("SELECT id, name FROM package_name")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cache.packagename2id.insert(row.get(1)?, row.get(0)?);
        }

        let mut stmt = conn.prepare("SELECT id, epoch, version, release FROM evr")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cache.id2evr.insert(
                row.get(0)?,
                Evr {
                    epoch: row.get(1)?,
                    version: row.get(2)?,
                    release: row.get(3)?,
                },
            );
        }

        let mut stmt = conn.prepare("SELECT id, name, basearch_id, releasever FROM repo")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: RepoKey = (row.get(1)?, row.get(2)?, row.get(3)?);
            cache.repo2id.insert(key, row.get(0)?);
        }

        let mut stmt = conn.prepare("SELECT id, name FROM content_set")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cache.label2content_set_id.insert(row.get(1)?, row.get(0)?);
        }

        let mut stmt = conn.prepare("SELECT cpe_id, repo_id FROM cpe_repo")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let cpe_id: i64 = row.get(0)?;
            let repo_id: i64 = row.get(1)?;
            cache.repo_id2cpe_ids.entry(repo_id).or_default().push(cpe_id);
        }

        let mut stmt = conn.prepare("SELECT cpe_id, content_set_id FROM cpe_content_set")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let cpe_id: i64 = row.get(0)?;
            let cs_id: i64 = row.get(1)?;
            cache
                .content_set_id2cpe_ids
                .entry(cs_id)
                .or_default()
                .push(cpe_id);
        }

        let mut stmt = conn.prepare("SELECT cpe_id, definition_id FROM oval_definition_cpe")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let cpe_id: i64 = row.get(0)?;
            let definition_id: i64 = row.get(1)?;
            cache
                .cpe_id2definition_ids
                .entry(cpe_id)
                .or_default()
                .push(definition_id);
        }

        let mut stmt = conn.prepare(
            "SELECT DISTINCT o.package_name_id, d.id
               FROM oval_definition d
               JOIN oval_definition_test dt ON d.id = dt.definition_id
               JOIN oval_rpminfo_test t ON dt.rpminfo_test_id = t.id
               JOIN oval_rpminfo_object o ON t.rpminfo_object_id = o.id",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let package_name_id: i64 = row.get(0)?;
            let definition_id: i64 = row.get(1)?;
            cache
                .packagename_id2definition_ids
                .entry(package_name_id)
                .or_default()
                .push(definition_id);
        }

        let mut stmt =
            conn.prepare("SELECT id, definition_type_id, criteria_id FROM oval_definition")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cache.definition_detail.insert(
                row.get(0)?,
                DefinitionDetail {
                    definition_type: row.get(1)?,
                    criteria_id: row.get(2)?,
                },
            );
        }

        let mut stmt = conn.prepare(
            "SELECT dc.definition_id, cve.name
               FROM oval_definition_cve dc
               JOIN cve ON dc.cve_id = cve.id",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let definition_id: i64 = row.get(0)?;
            let cve: String = row.get(1)?;
            cache
                .definition_id2cves
                .entry(definition_id)
                .or_default()
                .push(cve);
        }

        let mut stmt = conn.prepare("SELECT id, operator_id FROM oval_criteria")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cache.criteria_id2operator.insert(row.get(0)?, row.get(1)?);
        }

        let mut stmt = conn.prepare(
            "SELECT parent_criteria_id, dep_criteria_id, dep_test_id, dep_module_test_id
               FROM oval_criteria_dependency",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let parent: i64 = row.get(0)?;
            let dep_criteria: Option<i64> = row.get(1)?;
            let dep_test: Option<i64> = row.get(2)?;
            let dep_module_test: Option<i64> = row.get(3)?;
            if let Some(id) = dep_criteria {
                cache
                    .criteria_id2dep_criteria_ids
                    .entry(parent)
                    .or_default()
                    .push(id);
            } else if let Some(id) = dep_test {
                cache
                    .criteria_id2dep_test_ids
                    .entry(parent)
                    .or_default()
                    .push(id);
            } else if let Some(id) = dep_module_test {
                cache
                    .criteria_id2dep_module_test_ids
                    .entry(parent)
                    .or_default()
                    .push(id);
            } else {
                tracing::warn!(parent, "criteria dependency row names no dependency, skipping");
            }
        }

        let mut stmt = conn.prepare(
            "SELECT t.id, o.package_name_id, t.check_existence_id
               FROM oval_rpminfo_test t
               JOIN oval_rpminfo_object o ON t.rpminfo_object_id = o.id",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cache.test_detail.insert(
                row.get(0)?,
                TestDetail {
                    package_name_id: row.get(1)?,
                    check_existence: row.get(2)?,
                },
            );
        }

        // States without both an EVR and an operation carry nothing to
        // evaluate and are excluded here, matching the test-match rules.
        let mut stmt = conn.prepare(
            "SELECT ts.rpminfo_test_id, s.id, s.evr_id, s.evr_operation_id
               FROM oval_rpminfo_test_state ts
               JOIN oval_rpminfo_state s ON ts.rpminfo_state_id = s.id
              WHERE s.evr_id IS NOT NULL
                AND s.evr_operation_id IS NOT NULL",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let test_id: i64 = row.get(0)?;
            cache.test_id2states.entry(test_id).or_default().push(StateRef {
                state_id: row.get(1)?,
                evr_id: row.get(2)?,
                evr_operation: row.get(3)?,
            });
        }

        let mut stmt = conn.prepare("SELECT id, module_stream FROM oval_module_test")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cache.module_test_id2stream.insert(row.get(0)?, row.get(1)?);
        }

        let mut stmt =
            conn.prepare("SELECT rpminfo_state_id, arch_id FROM oval_rpminfo_state_arch")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let state_id: i64 = row.get(0)?;
            let arch_id: i64 = row.get(1)?;
            cache.state_id2arch_ids.entry(state_id).or_default().insert(arch_id);
        }

        // Sorted, de-duplicated id vectors make the hot-path intersection a
        // linear merge and the results independent of row order.
        for ids in cache
            .repo_id2cpe_ids
            .values_mut()
            .chain(cache.content_set_id2cpe_ids.values_mut())
            .chain(cache.cpe_id2definition_ids.values_mut())
            .chain(cache.packagename_id2definition_ids.values_mut())
        {
            ids.sort_unstable();
            ids.dedup();
        }

        Ok(cache)
    }
}
