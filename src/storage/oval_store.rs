//! OVAL stream ingestion
//!
//! Takes a parsed stream and reconciles it into the normalized tables.
//! Streams are keyed by their upstream id; a stream whose feed timestamp is
//! not newer than the stored one is skipped entirely (unless forced).
//! Criteria trees are rewritten on every import: the definition row is
//! upserted with a NULL root first, the tree is inserted depth-first, and the
//! root is patched in afterwards (the two tables reference each other).

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use rusqlite::{params, Connection, OptionalExtension};

use crate::parsers::oval_stream::{Criteria, ParsedOvalStream};
use crate::rpm;
use crate::storage::SqliteStore;

pub struct OvalStore<'a> {
    store: &'a SqliteStore,
}

impl<'a> OvalStore<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self { store }
    }

    /// Record the stream's feed timestamp. Returns the stream row id when
    /// the stream is new or updated, `None` when it is unchanged.
    pub fn upsert_stream(
        &self,
        oval_id: &str,
        updated: DateTime<FixedOffset>,
        force: bool,
    ) -> Result<Option<i64>> {
        let conn = self.store.conn();
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, updated FROM oval_stream WHERE oval_id = ?1",
                params![oval_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO oval_stream (oval_id, updated) VALUES (?1, ?2)",
                    params![oval_id, updated.to_rfc3339()],
                )?;
                Ok(Some(conn.last_insert_rowid()))
            }
            Some((id, stored)) => {
                let stored = DateTime::parse_from_rfc3339(&stored)
                    .with_context(|| format!("Invalid stored timestamp for stream {oval_id}"))?;
                if updated > stored || force {
                    conn.execute(
                        "UPDATE oval_stream SET updated = ?1 WHERE id = ?2",
                        params![updated.to_rfc3339(), id],
                    )?;
                    Ok(Some(id))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Import all entities of a parsed stream under `stream_id`.
    pub fn store_stream(&self, stream_id: i64, parsed: &ParsedOvalStream) -> Result<()> {
        let tx = self.store.conn().unchecked_transaction()?;

        let package_name_ids = ensure_named(
            &tx,
            "package_name",
            parsed.objects.iter().map(|o| o.package_name.as_str()),
        )?;
        let cve_ids = ensure_named(
            &tx,
            "cve",
            parsed.definitions.iter().flat_map(|d| d.cves.iter().map(String::as_str)),
        )?;
        let cpe_ids = ensure_named(
            &tx,
            "cpe",
            parsed.definitions.iter().flat_map(|d| d.cpes.iter().map(String::as_str)),
        )?;
        let evr_ids = ensure_evrs(&tx, parsed)?;
        let arch_ids = self.store.arch_map()?;

        let object_ids = self.store_objects(&tx, stream_id, parsed, &package_name_ids)?;
        let state_ids = self.store_states(&tx, stream_id, parsed, &evr_ids, &arch_ids)?;
        let test_ids = self.store_tests(&tx, stream_id, parsed, &object_ids, &state_ids)?;
        let module_test_ids = self.store_module_tests(&tx, stream_id, parsed)?;
        self.store_definitions(
            &tx,
            stream_id,
            parsed,
            &test_ids,
            &module_test_ids,
            &cve_ids,
            &cpe_ids,
        )?;

        tx.commit().context("Failed to commit OVAL stream import")?;
        Ok(())
    }

    fn store_objects(
        &self,
        tx: &Connection,
        stream_id: i64,
        parsed: &ParsedOvalStream,
        package_name_ids: &HashMap<String, i64>,
    ) -> Result<HashMap<String, i64>> {
        let mut upsert = tx.prepare(
            "INSERT INTO oval_rpminfo_object (stream_id, oval_id, package_name_id, version)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (stream_id, oval_id)
             DO UPDATE SET package_name_id = excluded.package_name_id, version = excluded.version",
        )?;

        let mut ids = HashMap::new();
        for object in &parsed.objects {
            let Some(&package_name_id) = package_name_ids.get(&object.package_name) else {
                continue;
            };
            upsert.execute(params![stream_id, object.oval_id, package_name_id, object.version])?;
            ids.insert(
                object.oval_id.clone(),
                entity_id(tx, "oval_rpminfo_object", stream_id, &object.oval_id)?,
            );
        }
        Ok(ids)
    }

    fn store_states(
        &self,
        tx: &Connection,
        stream_id: i64,
        parsed: &ParsedOvalStream,
        evr_ids: &HashMap<String, i64>,
        arch_ids: &HashMap<String, i64>,
    ) -> Result<HashMap<String, i64>> {
        let mut upsert = tx.prepare(
            "INSERT INTO oval_rpminfo_state (stream_id, oval_id, evr_id, evr_operation_id, version)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (stream_id, oval_id)
             DO UPDATE SET evr_id = excluded.evr_id,
                           evr_operation_id = excluded.evr_operation_id,
                           version = excluded.version",
        )?;
        let mut clear_arches =
            tx.prepare("DELETE FROM oval_rpminfo_state_arch WHERE rpminfo_state_id = ?1")?;
        let mut insert_arch = tx.prepare(
            "INSERT OR IGNORE INTO oval_rpminfo_state_arch (rpminfo_state_id, arch_id)
             VALUES (?1, ?2)",
        )?;

        let mut ids = HashMap::new();
        for state in &parsed.states {
            let evr_id = state.evr.as_ref().and_then(|evr| evr_ids.get(evr)).copied();
            // Keep EVR and operation paired; a state with only one of them
            // is stored bare and never matches a test.
            let (evr_id, evr_operation) = match (evr_id, state.evr_operation) {
                (Some(evr_id), Some(operation)) => (Some(evr_id), Some(operation)),
                _ => (None, None),
            };
            upsert.execute(params![stream_id, state.oval_id, evr_id, evr_operation, state.version])?;
            let state_id = entity_id(tx, "oval_rpminfo_state", stream_id, &state.oval_id)?;

            clear_arches.execute(params![state_id])?;
            for arch in &state.arches {
                match arch_ids.get(arch) {
                    Some(&arch_id) => {
                        insert_arch.execute(params![state_id, arch_id])?;
                    }
                    None => tracing::warn!(%arch, state = %state.oval_id, "unknown architecture"),
                }
            }

            ids.insert(state.oval_id.clone(), state_id);
        }
        Ok(ids)
    }

    fn store_tests(
        &self,
        tx: &Connection,
        stream_id: i64,
        parsed: &ParsedOvalStream,
        object_ids: &HashMap<String, i64>,
        state_ids: &HashMap<String, i64>,
    ) -> Result<HashMap<String, i64>> {
        let mut upsert = tx.prepare(
            "INSERT INTO oval_rpminfo_test
                 (stream_id, oval_id, rpminfo_object_id, check_id, check_existence_id, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (stream_id, oval_id)
             DO UPDATE SET rpminfo_object_id = excluded.rpminfo_object_id,
                           check_id = excluded.check_id,
                           check_existence_id = excluded.check_existence_id,
                           version = excluded.version",
        )?;
        let mut clear_states =
            tx.prepare("DELETE FROM oval_rpminfo_test_state WHERE rpminfo_test_id = ?1")?;
        let mut insert_state = tx.prepare(
            "INSERT OR IGNORE INTO oval_rpminfo_test_state (rpminfo_test_id, rpminfo_state_id)
             VALUES (?1, ?2)",
        )?;

        let mut ids = HashMap::new();
        for test in &parsed.tests {
            let Some(&object_id) = object_ids.get(&test.object_ref) else {
                tracing::warn!(
                    test = %test.oval_id,
                    object_ref = %test.object_ref,
                    "test references unknown object, skipping"
                );
                continue;
            };
            upsert.execute(params![
                stream_id,
                test.oval_id,
                object_id,
                test.check,
                test.check_existence,
                test.version
            ])?;
            let test_id = entity_id(tx, "oval_rpminfo_test", stream_id, &test.oval_id)?;

            clear_states.execute(params![test_id])?;
            for state_ref in &test.state_refs {
                match state_ids.get(state_ref) {
                    Some(&state_id) => {
                        insert_state.execute(params![test_id, state_id])?;
                    }
                    None => tracing::warn!(
                        test = %test.oval_id,
                        state_ref = %state_ref,
                        "test references unknown state"
                    ),
                }
            }

            ids.insert(test.oval_id.clone(), test_id);
        }
        Ok(ids)
    }

    fn store_module_tests(
        &self,
        tx: &Connection,
        stream_id: i64,
        parsed: &ParsedOvalStream,
    ) -> Result<HashMap<String, i64>> {
        let mut upsert = tx.prepare(
            "INSERT INTO oval_module_test (stream_id, oval_id, module_stream, version)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (stream_id, oval_id)
             DO UPDATE SET module_stream = excluded.module_stream, version = excluded.version",
        )?;

        let mut ids = HashMap::new();
        for module_test in &parsed.module_tests {
            upsert.execute(params![
                stream_id,
                module_test.oval_id,
                module_test.module_stream,
                module_test.version
            ])?;
            ids.insert(
                module_test.oval_id.clone(),
                entity_id(tx, "oval_module_test", stream_id, &module_test.oval_id)?,
            );
        }
        Ok(ids)
    }

    #[allow(clippy::too_many_arguments)]
    fn store_definitions(
        &self,
        tx: &Connection,
        stream_id: i64,
        parsed: &ParsedOvalStream,
        test_ids: &HashMap<String, i64>,
        module_test_ids: &HashMap<String, i64>,
        cve_ids: &HashMap<String, i64>,
        cpe_ids: &HashMap<String, i64>,
    ) -> Result<()> {
        let mut upsert = tx.prepare(
            "INSERT INTO oval_definition
                 (stream_id, oval_id, definition_type_id, criteria_id, version)
             VALUES (?1, ?2, ?3, NULL, ?4)
             ON CONFLICT (stream_id, oval_id)
             DO UPDATE SET definition_type_id = excluded.definition_type_id,
                           criteria_id = NULL,
                           version = excluded.version",
        )?;

        for definition in &parsed.definitions {
            upsert.execute(params![
                stream_id,
                definition.oval_id,
                definition.definition_type,
                definition.version
            ])?;
            let definition_id = entity_id(tx, "oval_definition", stream_id, &definition.oval_id)?;

            // Rebuild the criteria tree from scratch; dependency rows go
            // with it via ON DELETE CASCADE.
            tx.execute(
                "DELETE FROM oval_criteria WHERE definition_id = ?1",
                params![definition_id],
            )?;
            if let Some(criteria) = &definition.criteria {
                let root_id =
                    insert_criteria(tx, definition_id, criteria, test_ids, module_test_ids)?;
                tx.execute(
                    "UPDATE oval_definition SET criteria_id = ?1 WHERE id = ?2",
                    params![root_id, definition_id],
                )?;
            }

            self.replace_associations(
                tx,
                "oval_definition_test",
                "rpminfo_test_id",
                definition_id,
                definition
                    .criteria
                    .iter()
                    .flat_map(|c| c.test_refs_recursive())
                    .filter_map(|test_ref| test_ids.get(test_ref))
                    .copied(),
            )?;
            self.replace_associations(
                tx,
                "oval_definition_cve",
                "cve_id",
                definition_id,
                definition
                    .cves
                    .iter()
                    .filter_map(|cve| cve_ids.get(cve))
                    .copied(),
            )?;
            self.replace_associations(
                tx,
                "oval_definition_cpe",
                "cpe_id",
                definition_id,
                definition
                    .cpes
                    .iter()
                    .filter_map(|cpe| cpe_ids.get(cpe))
                    .copied(),
            )?;
        }
        Ok(())
    }

    fn replace_associations(
        &self,
        tx: &Connection,
        table: &str,
        column: &str,
        definition_id: i64,
        ids: impl Iterator<Item = i64>,
    ) -> Result<()> {
        tx.execute(
            &format!("DELETE FROM {table} WHERE definition_id = ?1"),
            params![definition_id],
        )?;
        let mut insert = tx.prepare(&format!(
            "INSERT OR IGNORE INTO {table} (definition_id, {column}) VALUES (?1, ?2)"
        ))?;
        for id in ids {
            insert.execute(params![definition_id, id])?;
        }
        Ok(())
    }
}

/// Insert a criteria subtree depth-first, returning the root row id.
fn insert_criteria(
    tx: &Connection,
    definition_id: i64,
    node: &Criteria,
    test_ids: &HashMap<String, i64>,
    module_test_ids: &HashMap<String, i64>,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO oval_criteria (definition_id, operator_id) VALUES (?1, ?2)",
        params![definition_id, node.operator],
    )?;
    let criteria_id = tx.last_insert_rowid();

    for test_ref in &node.test_refs {
        if let Some(&test_id) = test_ids.get(test_ref) {
            tx.execute(
                "INSERT INTO oval_criteria_dependency (parent_criteria_id, dep_test_id)
                 VALUES (?1, ?2)",
                params![criteria_id, test_id],
            )?;
        } else if let Some(&module_test_id) = module_test_ids.get(test_ref) {
            tx.execute(
                "INSERT INTO oval_criteria_dependency (parent_criteria_id, dep_module_test_id)
                 VALUES (?1, ?2)",
                params![criteria_id, module_test_id],
            )?;
        } else {
            tracing::warn!(%test_ref, "criterion references unknown test, skipping");
        }
    }

    for child in &node.criteria {
        let child_id = insert_criteria(tx, definition_id, child, test_ids, module_test_ids)?;
        tx.execute(
            "INSERT INTO oval_criteria_dependency (parent_criteria_id, dep_criteria_id)
             VALUES (?1, ?2)",
            params![criteria_id, child_id],
        )?;
    }

    Ok(criteria_id)
}

/// Insert-or-ignore `names` into a `(id, name)` table and return the
/// name-to-id map for the whole table.
fn ensure_named<'n>(
    tx: &Connection,
    table: &str,
    names: impl Iterator<Item = &'n str>,
) -> Result<HashMap<String, i64>> {
    let mut insert =
        tx.prepare(&format!("INSERT OR IGNORE INTO {table} (name) VALUES (?1)"))?;
    for name in names {
        insert.execute(params![name])?;
    }

    let mut select = tx.prepare(&format!("SELECT name, id FROM {table}"))?;
    let rows = select.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<std::result::Result<HashMap<_, _>, _>>()
        .with_context(|| format!("Failed to load {table} table"))
}

/// Parse and insert every EVR string referenced by the stream's states,
/// returning a map from the original string to the `evr` row id.
fn ensure_evrs(tx: &Connection, parsed: &ParsedOvalStream) -> Result<HashMap<String, i64>> {
    let mut insert = tx.prepare(
        "INSERT OR IGNORE INTO evr (epoch, version, release) VALUES (?1, ?2, ?3)",
    )?;
    let mut select = tx.prepare(
        "SELECT id FROM evr WHERE epoch = ?1 AND version = ?2 AND release = ?3",
    )?;

    let mut ids = HashMap::new();
    for state in &parsed.states {
        let Some(evr_string) = &state.evr else { continue };
        if ids.contains_key(evr_string) {
            continue;
        }
        let evr = match rpm::parse_evr(evr_string) {
            Ok(evr) => evr,
            Err(_) => {
                tracing::warn!(evr = %evr_string, state = %state.oval_id, "malformed EVR, skipping");
                continue;
            }
        };
        insert.execute(params![evr.epoch, evr.version, evr.release])?;
        let id = select.query_row(params![evr.epoch, evr.version, evr.release], |row| row.get(0))?;
        ids.insert(evr_string.clone(), id);
    }
    Ok(ids)
}

fn entity_id(tx: &Connection, table: &str, stream_id: i64, oval_id: &str) -> Result<i64> {
    tx.query_row(
        &format!("SELECT id FROM {table} WHERE stream_id = ?1 AND oval_id = ?2"),
        params![stream_id, oval_id],
        |row| row.get(0),
    )
    .with_context(|| format!("Missing {table} row for {oval_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::cache::Cache;
    use crate::evaluator::{Evaluator, SystemProfile};
    use crate::parsers::oval_stream::parse_oval_stream;
    use crate::parsers::repo_cpe_map::RepoCpeMap;
    use crate::storage::repo_cpe_store::RepoCpeStore;

    const STREAM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<oval_definitions xmlns="http://oval.mitre.org/XMLSchema/oval-definitions-5">
  <definitions>
    <definition class="patch" id="oval:test:def:1" version="635">
      <metadata>
        <title>RHSA-2024:0001: bash security update</title>
        <reference source="CVE" ref_id="CVE-2024-0001"/>
        <advisory>
          <affected_cpe_list>
            <cpe>cpe:/o:redhat:enterprise_linux:7</cpe>
          </affected_cpe_list>
        </advisory>
      </metadata>
      <criteria operator="AND">
        <criterion test_ref="oval:test:tst:100" comment="bash is earlier than 0:4.2.46-35.el7"/>
      </criteria>
    </definition>
  </definitions>
  <tests>
    <rpminfo_test id="oval:test:tst:100" version="635" check="at least one">
      <object object_ref="oval:test:obj:10"/>
      <state state_ref="oval:test:ste:20"/>
    </rpminfo_test>
  </tests>
  <objects>
    <rpminfo_object id="oval:test:obj:10" version="635">
      <name>bash</name>
    </rpminfo_object>
  </objects>
  <states>
    <rpminfo_state id="oval:test:ste:20" version="635">
      <evr datatype="evr_string" operation="less than">0:4.2.46-35.el7</evr>
    </rpminfo_state>
  </states>
</oval_definitions>
"#;

    const MAPPING: &str = r#"{
        "data": {
            "rhel-7-server-rpms": {
                "cpes": ["cpe:/o:redhat:enterprise_linux:7"]
            }
        }
    }"#;

    fn timestamp(value: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(value).unwrap()
    }

    fn synced_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();

        let arch_names = store.arch_map().unwrap().into_keys().collect();
        let map = RepoCpeMap::parse(MAPPING, &arch_names).unwrap();
        RepoCpeStore::new(&store).store(&map).unwrap();

        let parsed = parse_oval_stream(STREAM.as_bytes()).unwrap();
        let oval_store = OvalStore::new(&store);
        let stream_id = oval_store
            .upsert_stream("RHEL7", timestamp("2024-03-01T00:00:00+00:00"), false)
            .unwrap()
            .unwrap();
        oval_store.store_stream(stream_id, &parsed).unwrap();
        store
    }

    #[test]
    fn test_stream_timestamp_gates_reimport() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let oval_store = OvalStore::new(&store);

        let first = oval_store
            .upsert_stream("RHEL7", timestamp("2024-03-01T00:00:00+00:00"), false)
            .unwrap();
        assert!(first.is_some());

        // Same timestamp: unchanged.
        let unchanged = oval_store
            .upsert_stream("RHEL7", timestamp("2024-03-01T00:00:00+00:00"), false)
            .unwrap();
        assert!(unchanged.is_none());

        // Older timestamp but forced: re-imported.
        let forced = oval_store
            .upsert_stream("RHEL7", timestamp("2024-02-01T00:00:00+00:00"), true)
            .unwrap();
        assert_eq!(forced, first);

        // Newer timestamp: re-imported.
        let newer = oval_store
            .upsert_stream("RHEL7", timestamp("2024-04-01T00:00:00+00:00"), false)
            .unwrap();
        assert_eq!(newer, first);
    }

    #[test]
    fn test_store_stream_populates_tables() {
        let store = synced_store();
        let conn = store.conn();

        let objects: i64 = conn
            .query_row("SELECT count(*) FROM oval_rpminfo_object", [], |r| r.get(0))
            .unwrap();
        assert_eq!(objects, 1);

        let evr: (String, String, String) = conn
            .query_row(
                "SELECT e.epoch, e.version, e.release
                   FROM oval_rpminfo_state s JOIN evr e ON s.evr_id = e.id",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(evr, ("0".to_string(), "4.2.46".to_string(), "35.el7".to_string()));

        let root: Option<i64> = conn
            .query_row("SELECT criteria_id FROM oval_definition", [], |r| r.get(0))
            .unwrap();
        assert!(root.is_some());

        let deps: i64 = conn
            .query_row("SELECT count(*) FROM oval_criteria_dependency", [], |r| r.get(0))
            .unwrap();
        assert_eq!(deps, 1);
    }

    #[test]
    fn test_reimport_is_idempotent() {
        let store = synced_store();
        let parsed = parse_oval_stream(STREAM.as_bytes()).unwrap();
        let oval_store = OvalStore::new(&store);
        let stream_id = oval_store
            .upsert_stream("RHEL7", timestamp("2024-04-01T00:00:00+00:00"), false)
            .unwrap()
            .unwrap();
        oval_store.store_stream(stream_id, &parsed).unwrap();

        let conn = store.conn();
        let criteria: i64 = conn
            .query_row("SELECT count(*) FROM oval_criteria", [], |r| r.get(0))
            .unwrap();
        assert_eq!(criteria, 1);
        let cves: i64 = conn
            .query_row("SELECT count(*) FROM oval_definition_cve", [], |r| r.get(0))
            .unwrap();
        assert_eq!(cves, 1);
    }

    #[test]
    fn test_ingested_stream_is_evaluable() {
        let store = synced_store();
        let evaluator = Evaluator::new(Cache::load(&store).unwrap());

        let profile = SystemProfile {
            package_list: vec!["bash-4.2.46-34.el7.x86_64".to_string()],
            repository_list: vec!["rhel-7-server-rpms".to_string()],
            ..Default::default()
        };
        let report = evaluator.process_list(&profile).unwrap();
        assert_eq!(report.cve_list, vec!["CVE-2024-0001"]);
        assert!(report.unpatched_cve_list.is_empty());
    }
}
