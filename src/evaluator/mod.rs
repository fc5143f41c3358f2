//! Vulnerability evaluator
//!
//! Takes a system profile (installed packages, enabled module streams,
//! repositories), narrows the OVAL definitions to those claimed by the
//! profile's repositories via CPEs, evaluates each installed package against
//! the remaining criteria trees, and reports CVEs fixable by an available
//! update separately from CVEs with no fix yet.

pub mod cache;
pub mod criteria;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::EvalError;
use crate::rpm::{self, Nevra};
use cache::Cache;
use criteria::{evaluate_criteria, PackageEval};

pub const OVAL_OPERATION_EVR_EQUALS: i64 = 1;
pub const OVAL_OPERATION_EVR_LESS_THAN: i64 = 2;

pub const OVAL_CHECK_EXISTENCE_AT_LEAST_ONE: i64 = 1;
pub const OVAL_CHECK_EXISTENCE_NONE: i64 = 2;

pub const OVAL_DEFINITION_TYPE_PATCH: i64 = 1;
pub const OVAL_DEFINITION_TYPE_VULNERABILITY: i64 = 2;

pub const OVAL_CRITERIA_OPERATOR_AND: i64 = 1;
pub const OVAL_CRITERIA_OPERATOR_OR: i64 = 2;

/// System profile submitted for evaluation
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SystemProfile {
    #[serde(default)]
    pub package_list: Vec<String>,
    #[serde(default)]
    pub modules_list: Vec<ModuleStream>,
    #[serde(default)]
    pub repository_list: Vec<String>,
    #[serde(default)]
    pub basearch: Option<String>,
    #[serde(default)]
    pub releasever: Option<String>,
}

/// An enabled module stream, e.g. `nodejs:12`
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleStream {
    pub module_name: String,
    pub module_stream: String,
}

/// Evaluation result: CVEs fixable by an update and CVEs with no fix
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct VulnerabilityReport {
    pub cve_list: Vec<String>,
    pub unpatched_cve_list: Vec<String>,
}

/// Evaluates system profiles against the pre-loaded cache. Holds no mutable
/// state, so one instance serves all requests concurrently.
pub struct Evaluator {
    cache: Cache,
}

impl Evaluator {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    /// Evaluate one profile. Fatal data errors abort the whole request;
    /// unparsable or unknown packages are silently dropped.
    pub fn process_list(&self, profile: &SystemProfile) -> Result<VulnerabilityReport, EvalError> {
        let mut cves_final: BTreeSet<String> = BTreeSet::new();
        let mut unpatched: BTreeSet<String> = BTreeSet::new();

        let packages = self.filter_input_packages(&profile.package_list);
        let modules: HashSet<String> = profile
            .modules_list
            .iter()
            .map(|m| format!("{}:{}", m.module_name, m.module_stream))
            .collect();

        let candidate_definitions = self.repos_to_definitions(
            &profile.repository_list,
            profile.basearch.as_deref(),
            profile.releasever.as_deref(),
        );

        for (package, nevra) in &packages {
            let Some(&package_name_id) = self.cache.packagename2id.get(&nevra.name) else {
                continue;
            };
            let package_definitions = self
                .cache
                .packagename_id2definition_ids
                .get(&package_name_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let definition_ids = intersect_sorted(&candidate_definitions, package_definitions);
            tracing::debug!(
                package = %package,
                count = definition_ids.len(),
                "definitions found for package"
            );

            let package_eval = PackageEval {
                package_name_id,
                epoch: nevra.epoch.clone(),
                version: nevra.version.clone(),
                release: nevra.release.clone(),
                arch: nevra.arch.clone(),
            };

            for definition_id in definition_ids {
                let Some(detail) = self.cache.definition_detail.get(&definition_id) else {
                    continue;
                };
                let cves = self
                    .cache
                    .definition_id2cves
                    .get(&definition_id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);

                // Skip when nothing this definition names is still open. A
                // patch definition stays live while any of its CVEs is merely
                // unpatched, so that the patch verdict can win regardless of
                // the order definitions are visited in.
                let decided = if detail.definition_type == OVAL_DEFINITION_TYPE_PATCH {
                    cves.iter().all(|cve| cves_final.contains(cve))
                } else {
                    cves.iter()
                        .all(|cve| cves_final.contains(cve) || unpatched.contains(cve))
                };
                if decided {
                    continue;
                }

                let Some(criteria_id) = detail.criteria_id else {
                    continue;
                };
                if evaluate_criteria(&self.cache, criteria_id, &package_eval, &modules)? {
                    tracing::debug!(
                        definition_id,
                        definition_type = detail.definition_type,
                        "definition matched"
                    );
                    match detail.definition_type {
                        OVAL_DEFINITION_TYPE_PATCH => {
                            cves_final.extend(cves.iter().cloned());
                        }
                        OVAL_DEFINITION_TYPE_VULNERABILITY => {
                            unpatched.extend(cves.iter().cloned());
                        }
                        other => return Err(EvalError::UnsupportedDefinitionType(other)),
                    }
                }
            }
        }

        // A CVE with an available patch is never reported as unpatched.
        let unpatched_cve_list: Vec<String> = unpatched
            .into_iter()
            .filter(|cve| !cves_final.contains(cve))
            .collect();

        Ok(VulnerabilityReport {
            cve_list: cves_final.into_iter().collect(),
            unpatched_cve_list,
        })
    }

    /// Parse the submitted NEVRA strings, keeping only those the cache knows.
    fn filter_input_packages<'a>(&self, package_list: &'a [String]) -> HashMap<&'a str, Nevra> {
        let mut filtered = HashMap::new();
        for package in package_list {
            let Ok(nevra) = rpm::parse_nevra(package) else {
                tracing::debug!(package = %package, "dropping package with malformed NEVRA");
                continue;
            };
            if self.cache.packagename2id.contains_key(&nevra.name) {
                filtered.insert(package.as_str(), nevra);
            } else {
                tracing::debug!(package = %package, "dropping package with unknown name");
            }
        }
        filtered
    }

    /// Resolve repository labels to candidate definition ids: label (+
    /// basearch/releasever) → repo or content set → CPEs → definitions.
    /// CPEs attached to fully-resolved repos win; content-set CPEs are the
    /// fallback when no repo-level mapping exists.
    fn repos_to_definitions(
        &self,
        repository_list: &[String],
        basearch: Option<&str>,
        releasever: Option<&str>,
    ) -> Vec<i64> {
        let mut repo_ids: HashSet<i64> = HashSet::new();
        let mut content_set_ids: HashSet<i64> = HashSet::new();

        for label in repository_list {
            if basearch.is_some() || releasever.is_some() {
                let basearch_id = basearch.and_then(|a| self.cache.arch2id.get(a)).copied();
                let key = (
                    label.clone(),
                    basearch_id,
                    releasever.map(ToString::to_string),
                );
                if let Some(&repo_id) = self.cache.repo2id.get(&key) {
                    repo_ids.insert(repo_id);
                }
            }
            if let Some(&content_set_id) = self.cache.label2content_set_id.get(label) {
                content_set_ids.insert(content_set_id);
            }
        }

        let mut cpe_ids: HashSet<i64> = HashSet::new();
        for repo_id in &repo_ids {
            if let Some(ids) = self.cache.repo_id2cpe_ids.get(repo_id) {
                cpe_ids.extend(ids);
            }
        }
        if cpe_ids.is_empty() {
            for content_set_id in &content_set_ids {
                if let Some(ids) = self.cache.content_set_id2cpe_ids.get(content_set_id) {
                    cpe_ids.extend(ids);
                }
            }
        }

        let mut candidates: Vec<i64> = Vec::new();
        for cpe_id in &cpe_ids {
            if let Some(ids) = self.cache.cpe_id2definition_ids.get(cpe_id) {
                candidates.extend(ids);
            }
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates
    }
}

/// Linear-merge intersection of two sorted id slices.
fn intersect_sorted(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;

    // Fixture layout:
    //   def 1: patch,         bash    < 0:4.2.46-35.el7 (state arch x86_64), CVE-TEST-0001
    //   def 2: vulnerability, openssl exists (no states),                    CVE-TEST-0002
    //   def 3: vulnerability, sudo    exists (no states),                    CVE-TEST-0001
    //   def 4: patch,         nodejs  < 0:12.22.13-1.module_el8 AND nodejs:12 enabled, CVE-TEST-0003
    // All definitions are claimed by the single CPE of 'rhel-7-server-rpms'.
    fn fixture_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
            .conn()
            .execute_batch(
                r#"
                INSERT INTO package_name (id, name) VALUES
                    (1, 'bash'), (2, 'openssl'), (3, 'nodejs'), (4, 'sudo');
                INSERT INTO evr (id, epoch, version, release) VALUES
                    (1, '0', '4.2.46', '35.el7'),
                    (2, '0', '12.22.13', '1.module_el8');
                INSERT INTO cve (id, name) VALUES
                    (1, 'CVE-TEST-0001'), (2, 'CVE-TEST-0002'), (3, 'CVE-TEST-0003');
                INSERT INTO cpe (id, name) VALUES (1, 'cpe:/o:redhat:enterprise_linux:7');
                INSERT INTO content_set (id, name) VALUES (1, 'rhel-7-server-rpms');
                INSERT INTO repo (id, name, basearch_id, releasever) VALUES
                    (1, 'rhel-7-server-rpms', 20, '7Server');
                INSERT INTO cpe_repo (cpe_id, repo_id) VALUES (1, 1);
                INSERT INTO cpe_content_set (cpe_id, content_set_id) VALUES (1, 1);

                INSERT INTO oval_stream (id, oval_id, updated) VALUES
                    (1, 'RHEL7/rhel-7.oval.xml.bz2', '2024-01-01T00:00:00+00:00');

                INSERT INTO oval_rpminfo_object (id, stream_id, oval_id, package_name_id, version) VALUES
                    (1, 1, 'obj:bash', 1, 1),
                    (2, 1, 'obj:openssl', 2, 1),
                    (3, 1, 'obj:nodejs', 3, 1),
                    (4, 1, 'obj:sudo', 4, 1);

                INSERT INTO oval_rpminfo_state (id, stream_id, oval_id, evr_id, evr_operation_id, version) VALUES
                    (1, 1, 'ste:bash', 1, 2, 1),
                    (2, 1, 'ste:nodejs', 2, 2, 1);
                INSERT INTO oval_rpminfo_state_arch (rpminfo_state_id, arch_id) VALUES (1, 20);

                INSERT INTO oval_rpminfo_test (id, stream_id, oval_id, rpminfo_object_id, check_id, check_existence_id, version) VALUES
                    (1, 1, 'tst:bash', 1, 1, 1, 1),
                    (2, 1, 'tst:openssl', 2, 1, 1, 1),
                    (3, 1, 'tst:nodejs', 3, 1, 1, 1),
                    (4, 1, 'tst:sudo', 4, 1, 1, 1);
                INSERT INTO oval_rpminfo_test_state (rpminfo_test_id, rpminfo_state_id) VALUES
                    (1, 1), (3, 2);

                INSERT INTO oval_module_test (id, stream_id, oval_id, module_stream, version) VALUES
                    (1, 1, 'tst:module:nodejs', 'nodejs:12', 1);

                INSERT INTO oval_definition (id, stream_id, oval_id, definition_type_id, criteria_id, version) VALUES
                    (1, 1, 'def:1', 1, NULL, 1),
                    (2, 1, 'def:2', 2, NULL, 1),
                    (3, 1, 'def:3', 2, NULL, 1),
                    (4, 1, 'def:4', 1, NULL, 1);

                INSERT INTO oval_criteria (id, definition_id, operator_id) VALUES
                    (1, 1, 1), (2, 2, 1), (3, 3, 1), (4, 4, 1);
                INSERT INTO oval_criteria_dependency (parent_criteria_id, dep_test_id) VALUES
                    (1, 1), (2, 2), (3, 4), (4, 3);
                INSERT INTO oval_criteria_dependency (parent_criteria_id, dep_module_test_id) VALUES
                    (4, 1);
                UPDATE oval_definition SET criteria_id = 1 WHERE id = 1;
                UPDATE oval_definition SET criteria_id = 2 WHERE id = 2;
                UPDATE oval_definition SET criteria_id = 3 WHERE id = 3;
                UPDATE oval_definition SET criteria_id = 4 WHERE id = 4;

                INSERT INTO oval_definition_test (definition_id, rpminfo_test_id) VALUES
                    (1, 1), (2, 2), (3, 4), (4, 3);
                INSERT INTO oval_definition_cve (definition_id, cve_id) VALUES
                    (1, 1), (2, 2), (3, 1), (4, 3);
                INSERT INTO oval_definition_cpe (definition_id, cpe_id) VALUES
                    (1, 1), (2, 1), (3, 1), (4, 1);
                "#,
            )
            .unwrap();
        store
    }

    fn fixture_evaluator() -> Evaluator {
        Evaluator::new(Cache::load(&fixture_store()).unwrap())
    }

    fn profile(packages: &[&str]) -> SystemProfile {
        SystemProfile {
            package_list: packages.iter().map(ToString::to_string).collect(),
            repository_list: vec!["rhel-7-server-rpms".to_string()],
            basearch: Some("x86_64".to_string()),
            releasever: Some("7Server".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_patch_match() {
        let evaluator = fixture_evaluator();
        let report = evaluator
            .process_list(&profile(&["bash-4.2.46-34.el7.x86_64"]))
            .unwrap();
        assert_eq!(report.cve_list, vec!["CVE-TEST-0001"]);
        assert!(report.unpatched_cve_list.is_empty());
    }

    #[test]
    fn test_fixed_package_is_not_vulnerable() {
        let evaluator = fixture_evaluator();
        let report = evaluator
            .process_list(&profile(&["bash-4.2.46-35.el7.x86_64"]))
            .unwrap();
        assert!(report.cve_list.is_empty());
        assert!(report.unpatched_cve_list.is_empty());
    }

    #[test]
    fn test_unpatched_cve() {
        let evaluator = fixture_evaluator();
        let report = evaluator
            .process_list(&profile(&["openssl-1.0.2k-1.el7.x86_64"]))
            .unwrap();
        assert!(report.cve_list.is_empty());
        assert_eq!(report.unpatched_cve_list, vec!["CVE-TEST-0002"]);
    }

    #[test]
    fn test_patch_overrides_unpatched() {
        let evaluator = fixture_evaluator();
        // CVE-TEST-0001 is patchable via bash (def 1) and reported without a
        // fix via sudo (def 3); the patch verdict must win either way.
        let report = evaluator
            .process_list(&profile(&[
                "bash-4.2.46-34.el7.x86_64",
                "sudo-1.8.23-4.el7.x86_64",
            ]))
            .unwrap();
        assert_eq!(report.cve_list, vec!["CVE-TEST-0001"]);
        assert!(report.unpatched_cve_list.is_empty());

        let reversed = evaluator
            .process_list(&profile(&[
                "sudo-1.8.23-4.el7.x86_64",
                "bash-4.2.46-34.el7.x86_64",
            ]))
            .unwrap();
        assert_eq!(report, reversed);
    }

    #[test]
    fn test_state_arch_filter() {
        let evaluator = fixture_evaluator();
        let mut prof = profile(&["bash-4.2.46-34.el7.i686"]);
        prof.basearch = Some("i686".to_string());
        let report = evaluator.process_list(&prof).unwrap();
        assert!(report.cve_list.is_empty());
        assert!(report.unpatched_cve_list.is_empty());
    }

    #[test]
    fn test_module_gating() {
        let evaluator = fixture_evaluator();
        let mut prof = profile(&["nodejs-12.22.12-1.module_el8.x86_64"]);

        prof.modules_list = vec![ModuleStream {
            module_name: "nodejs".to_string(),
            module_stream: "10".to_string(),
        }];
        let report = evaluator.process_list(&prof).unwrap();
        assert!(report.cve_list.is_empty());
        assert!(report.unpatched_cve_list.is_empty());

        prof.modules_list = vec![ModuleStream {
            module_name: "nodejs".to_string(),
            module_stream: "12".to_string(),
        }];
        let report = evaluator.process_list(&prof).unwrap();
        assert_eq!(report.cve_list, vec!["CVE-TEST-0003"]);
    }

    #[test]
    fn test_empty_package_list() {
        let evaluator = fixture_evaluator();
        let report = evaluator.process_list(&profile(&[])).unwrap();
        assert!(report.cve_list.is_empty());
        assert!(report.unpatched_cve_list.is_empty());
    }

    #[test]
    fn test_no_repositories_means_no_candidates() {
        let evaluator = fixture_evaluator();
        let prof = SystemProfile {
            package_list: vec!["bash-4.2.46-34.el7.x86_64".to_string()],
            ..Default::default()
        };
        let report = evaluator.process_list(&prof).unwrap();
        assert!(report.cve_list.is_empty());
        assert!(report.unpatched_cve_list.is_empty());
    }

    #[test]
    fn test_content_set_fallback_without_basearch() {
        let evaluator = fixture_evaluator();
        // No basearch/releasever: the repo key cannot resolve, the content
        // set mapping still claims the same CPE.
        let prof = SystemProfile {
            package_list: vec!["bash-4.2.46-34.el7.x86_64".to_string()],
            repository_list: vec!["rhel-7-server-rpms".to_string()],
            ..Default::default()
        };
        let report = evaluator.process_list(&prof).unwrap();
        assert_eq!(report.cve_list, vec!["CVE-TEST-0001"]);
    }

    #[test]
    fn test_malformed_and_unknown_packages_are_dropped() {
        let evaluator = fixture_evaluator();
        let report = evaluator
            .process_list(&profile(&["garbage", "unknown-pkg-1.0-1.el7.x86_64"]))
            .unwrap();
        assert!(report.cve_list.is_empty());
        assert!(report.unpatched_cve_list.is_empty());
    }

    #[test]
    fn test_report_is_sorted_and_deduplicated() {
        let evaluator = fixture_evaluator();
        let report = evaluator
            .process_list(&profile(&[
                "openssl-1.0.2k-1.el7.x86_64",
                "sudo-1.8.23-4.el7.x86_64",
            ]))
            .unwrap();
        assert_eq!(
            report.unpatched_cve_list,
            vec!["CVE-TEST-0001", "CVE-TEST-0002"]
        );
    }

    #[test]
    fn test_repository_order_does_not_matter() {
        let evaluator = fixture_evaluator();
        let mut prof = profile(&["bash-4.2.46-34.el7.x86_64", "openssl-1.0.2k-1.el7.x86_64"]);
        let report = evaluator.process_list(&prof).unwrap();

        prof.package_list.reverse();
        prof.repository_list.reverse();
        assert_eq!(report, evaluator.process_list(&prof).unwrap());
    }

    #[test]
    fn test_intersect_sorted() {
        assert_eq!(intersect_sorted(&[1, 3, 5, 7], &[2, 3, 5, 8]), vec![3, 5]);
        assert_eq!(intersect_sorted(&[], &[1, 2]), Vec::<i64>::new());
        assert_eq!(intersect_sorted(&[1, 2], &[]), Vec::<i64>::new());
    }
}
