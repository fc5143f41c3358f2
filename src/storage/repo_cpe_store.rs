//! Repository/CPE mapping ingestion
//!
//! Inserts new CPEs, content sets and repositories, then reconciles the two
//! association tables against the freshly parsed mapping: missing pairs are
//! inserted, pairs no longer present upstream are deleted.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::parsers::repo_cpe_map::RepoCpeMap;
use crate::storage::SqliteStore;

pub struct RepoCpeStore<'a> {
    store: &'a SqliteStore,
}

impl<'a> RepoCpeStore<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self { store }
    }

    pub fn store(&self, map: &RepoCpeMap) -> Result<()> {
        let tx = self.store.conn().unchecked_transaction()?;
        let arch_ids = self.store.arch_map()?;

        let cpe_ids = populate_named(&tx, "cpe", &map.cpes)?;
        let content_set_ids = populate_named(&tx, "content_set", &map.content_sets)?;
        let repo_ids = self.populate_repos(&tx, map, &arch_ids)?;

        self.reconcile_content_set_cpes(&tx, map, &cpe_ids, &content_set_ids)?;
        self.reconcile_repo_cpes(&tx, map, &cpe_ids, &repo_ids, &arch_ids)?;

        tx.commit().context("Failed to commit CPE mapping import")
    }

    fn populate_repos(
        &self,
        tx: &Connection,
        map: &RepoCpeMap,
        arch_ids: &HashMap<String, i64>,
    ) -> Result<HashMap<(String, Option<i64>, Option<String>), i64>> {
        let mut insert = tx.prepare(
            "INSERT OR IGNORE INTO repo (name, basearch_id, releasever) VALUES (?1, ?2, ?3)",
        )?;
        for (name, basearch, releasever) in &map.repos {
            let basearch_id = basearch.as_ref().and_then(|a| arch_ids.get(a)).copied();
            insert.execute(params![name, basearch_id, releasever])?;
        }

        let mut select = tx.prepare("SELECT name, basearch_id, releasever, id FROM repo")?;
        let rows = select.query_map([], |row| {
            Ok(((row.get(0)?, row.get(1)?, row.get(2)?), row.get(3)?))
        })?;
        rows.collect::<std::result::Result<HashMap<_, _>, _>>()
            .context("Failed to load repo table")
    }

    fn reconcile_content_set_cpes(
        &self,
        tx: &Connection,
        map: &RepoCpeMap,
        cpe_ids: &HashMap<String, i64>,
        content_set_ids: &HashMap<String, i64>,
    ) -> Result<()> {
        let mut current = current_associations(tx, "cpe_content_set", "content_set_id")?;

        let mut to_insert: Vec<(i64, i64)> = Vec::new();
        for (content_set, cpes) in &map.content_set_to_cpes {
            let Some(&content_set_id) = content_set_ids.get(content_set) else {
                continue;
            };
            let existing = current.entry(content_set_id).or_default();
            for cpe in cpes {
                let Some(&cpe_id) = cpe_ids.get(cpe) else { continue };
                if !existing.remove(&cpe_id) {
                    to_insert.push((cpe_id, content_set_id));
                }
            }
        }

        apply_association_changes(tx, "cpe_content_set", "content_set_id", to_insert, current)
    }

    fn reconcile_repo_cpes(
        &self,
        tx: &Connection,
        map: &RepoCpeMap,
        cpe_ids: &HashMap<String, i64>,
        repo_ids: &HashMap<(String, Option<i64>, Option<String>), i64>,
        arch_ids: &HashMap<String, i64>,
    ) -> Result<()> {
        let mut current = current_associations(tx, "cpe_repo", "repo_id")?;

        let mut to_insert: Vec<(i64, i64)> = Vec::new();
        for ((name, basearch, releasever), cpes) in &map.repo_to_cpes {
            let basearch_id = basearch.as_ref().and_then(|a| arch_ids.get(a)).copied();
            let key = (name.clone(), basearch_id, releasever.clone());
            let Some(&repo_id) = repo_ids.get(&key) else { continue };
            let existing = current.entry(repo_id).or_default();
            for cpe in cpes {
                let Some(&cpe_id) = cpe_ids.get(cpe) else { continue };
                if !existing.remove(&cpe_id) {
                    to_insert.push((cpe_id, repo_id));
                }
            }
        }

        apply_association_changes(tx, "cpe_repo", "repo_id", to_insert, current)
    }
}

fn populate_named(
    tx: &Connection,
    table: &str,
    names: &HashSet<String>,
) -> Result<HashMap<String, i64>> {
    let mut insert = tx.prepare(&format!("INSERT OR IGNORE INTO {table} (name) VALUES (?1)"))?;
    for name in names {
        insert.execute(params![name])?;
    }

    let mut select = tx.prepare(&format!("SELECT name, id FROM {table}"))?;
    let rows = select.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<std::result::Result<HashMap<_, _>, _>>()
        .with_context(|| format!("Failed to load {table} table"))
}

/// Current association pairs, keyed by the non-CPE side.
fn current_associations(
    tx: &Connection,
    table: &str,
    column: &str,
) -> Result<HashMap<i64, HashSet<i64>>> {
    let mut select = tx.prepare(&format!("SELECT {column}, cpe_id FROM {table}"))?;
    let mut rows = select.query([])?;
    let mut associations: HashMap<i64, HashSet<i64>> = HashMap::new();
    while let Some(row) = rows.next()? {
        let key: i64 = row.get(0)?;
        let cpe_id: i64 = row.get(1)?;
        associations.entry(key).or_default().insert(cpe_id);
    }
    Ok(associations)
}

/// Insert the missing pairs; whatever survived in `stale` was not seen in the
/// new mapping and gets deleted.
fn apply_association_changes(
    tx: &Connection,
    table: &str,
    column: &str,
    to_insert: Vec<(i64, i64)>,
    stale: HashMap<i64, HashSet<i64>>,
) -> Result<()> {
    let stale_count: usize = stale.values().map(HashSet::len).sum();
    tracing::debug!(table, inserting = to_insert.len(), deleting = stale_count, "reconciling");

    let mut insert = tx.prepare(&format!(
        "INSERT INTO {table} (cpe_id, {column}) VALUES (?1, ?2)"
    ))?;
    for (cpe_id, key) in to_insert {
        insert.execute(params![cpe_id, key])?;
    }

    let mut delete = tx.prepare(&format!(
        "DELETE FROM {table} WHERE cpe_id = ?1 AND {column} = ?2"
    ))?;
    for (key, cpe_ids) in stale {
        for cpe_id in cpe_ids {
            delete.execute(params![cpe_id, key])?;
        }
    }
    Ok(())
}
