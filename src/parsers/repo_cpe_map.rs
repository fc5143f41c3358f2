//! Repository-to-CPE mapping (`repository-to-cpe.json`)
//!
//! Labels come in two shapes: a plain content-set label, or a label with
//! `__`-separated qualifiers (`rhel-7-server-rpms__7Server__x86_64`). A
//! qualifier is a basearch when, after substituting `_DOT_` with `.`, it
//! names a known architecture; otherwise it is a releasever.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct MapFile {
    data: HashMap<String, MapEntry>,
}

#[derive(Debug, Deserialize)]
struct MapEntry {
    cpes: Vec<String>,
}

/// Repository identity: (content-set label, basearch, releasever)
pub type RepoParts = (String, Option<String>, Option<String>);

#[derive(Debug, Default)]
pub struct RepoCpeMap {
    pub cpes: HashSet<String>,
    pub content_sets: HashSet<String>,
    pub repos: HashSet<RepoParts>,
    pub content_set_to_cpes: HashMap<String, Vec<String>>,
    pub repo_to_cpes: HashMap<RepoParts, Vec<String>>,
}

impl RepoCpeMap {
    pub fn from_file(path: &Path, arch_names: &HashSet<String>) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read CPE mapping: {}", path.display()))?;
        Self::parse(&data, arch_names)
            .with_context(|| format!("Failed to parse CPE mapping: {}", path.display()))
    }

    pub fn parse(data: &str, arch_names: &HashSet<String>) -> Result<Self> {
        let parsed: MapFile = serde_json::from_str(data).context("Invalid CPE mapping JSON")?;

        let mut map = Self::default();
        for (repo_label, entry) in parsed.data {
            let mut parts = repo_label.split("__");
            let content_set_label = parts.next().unwrap_or(&repo_label).to_string();

            let mut basearch = None;
            let mut releasever = None;
            for part in parts {
                let part = part.replace("_DOT_", ".");
                if arch_names.contains(&part) {
                    basearch = Some(part);
                } else {
                    releasever = Some(part);
                }
            }

            map.cpes.extend(entry.cpes.iter().cloned());
            if basearch.is_some() || releasever.is_some() {
                let key = (content_set_label, basearch, releasever);
                map.repos.insert(key.clone());
                map.repo_to_cpes.insert(key, entry.cpes);
            } else {
                map.content_sets.insert(content_set_label.clone());
                map.content_set_to_cpes.insert(content_set_label, entry.cpes);
            }
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"{
        "data": {
            "rhel-7-server-rpms": {
                "cpes": ["cpe:/o:redhat:enterprise_linux:7"]
            },
            "rhel-8-for-x86_64-baseos-rpms__8__x86_64": {
                "cpes": ["cpe:/o:redhat:enterprise_linux:8::baseos"]
            },
            "rhel-8-for-x86_64-baseos-rpms__8_DOT_6__x86_64": {
                "cpes": ["cpe:/o:redhat:rhel_eus:8.6::baseos"]
            }
        }
    }"#;

    fn arch_names() -> HashSet<String> {
        ["x86_64", "aarch64", "s390x", "ppc64le"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_plain_label_is_a_content_set() {
        let map = RepoCpeMap::parse(MAPPING, &arch_names()).unwrap();
        assert!(map.content_sets.contains("rhel-7-server-rpms"));
        assert_eq!(
            map.content_set_to_cpes["rhel-7-server-rpms"],
            vec!["cpe:/o:redhat:enterprise_linux:7"]
        );
    }

    #[test]
    fn test_qualified_label_is_a_repo() {
        let map = RepoCpeMap::parse(MAPPING, &arch_names()).unwrap();

        let key = (
            "rhel-8-for-x86_64-baseos-rpms".to_string(),
            Some("x86_64".to_string()),
            Some("8".to_string()),
        );
        assert!(map.repos.contains(&key));
        assert_eq!(
            map.repo_to_cpes[&key],
            vec!["cpe:/o:redhat:enterprise_linux:8::baseos"]
        );
    }

    #[test]
    fn test_dot_substitution_in_releasever() {
        let map = RepoCpeMap::parse(MAPPING, &arch_names()).unwrap();

        let key = (
            "rhel-8-for-x86_64-baseos-rpms".to_string(),
            Some("x86_64".to_string()),
            Some("8.6".to_string()),
        );
        assert!(map.repos.contains(&key));
    }

    #[test]
    fn test_all_cpes_collected() {
        let map = RepoCpeMap::parse(MAPPING, &arch_names()).unwrap();
        assert_eq!(map.cpes.len(), 3);
    }
}
