//! OVAL stream XML parsing
//!
//! Reads the RPM-flavored subset the vendor feeds actually use:
//! `rpminfo_object`, `rpminfo_state`, `rpminfo_test`, module tests and
//! patch/vulnerability definitions with AND/OR criteria trees. Everything
//! else in a stream (other test families, extend_definition references) is
//! ignored.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// `rpminfo_object`: which package name a test looks at
#[derive(Debug, Clone)]
pub struct RpminfoObject {
    pub oval_id: String,
    pub package_name: String,
    pub version: i64,
}

/// `rpminfo_state`: an EVR bound plus optional architecture constraint
#[derive(Debug, Clone, Default)]
pub struct RpminfoState {
    pub oval_id: String,
    pub evr: Option<String>,
    pub evr_operation: Option<i64>,
    pub arches: Vec<String>,
    pub version: i64,
}

/// `rpminfo_test`: object reference plus the states that must hold
#[derive(Debug, Clone, Default)]
pub struct RpminfoTest {
    pub oval_id: String,
    pub object_ref: String,
    pub state_refs: Vec<String>,
    pub check: i64,
    pub check_existence: i64,
    pub version: i64,
}

/// Module-stream gate, e.g. `nodejs:12`
#[derive(Debug, Clone)]
pub struct ModuleTest {
    pub oval_id: String,
    pub module_stream: String,
    pub version: i64,
}

/// AND/OR node over test references and child criteria
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    pub operator: i64,
    pub criteria: Vec<Criteria>,
    pub test_refs: Vec<String>,
}

impl Criteria {
    /// All test references in this subtree, depth-first.
    pub fn test_refs_recursive(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.test_refs.iter().map(String::as_str).collect();
        for child in &self.criteria {
            refs.extend(child.test_refs_recursive());
        }
        refs
    }
}

/// A patch or vulnerability definition
#[derive(Debug, Clone, Default)]
pub struct Definition {
    pub oval_id: String,
    pub definition_type: i64,
    pub cves: Vec<String>,
    pub cpes: Vec<String>,
    pub criteria: Option<Criteria>,
    pub version: i64,
}

/// All supported entities of one OVAL stream
#[derive(Debug, Default)]
pub struct ParsedOvalStream {
    pub objects: Vec<RpminfoObject>,
    pub states: Vec<RpminfoState>,
    pub tests: Vec<RpminfoTest>,
    pub module_tests: Vec<ModuleTest>,
    pub definitions: Vec<Definition>,
}

pub fn parse_oval_stream_file(path: &Path) -> Result<ParsedOvalStream> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open OVAL stream: {}", path.display()))?;
    parse_oval_stream(BufReader::new(file))
        .with_context(|| format!("Failed to parse OVAL stream: {}", path.display()))
}

pub fn parse_oval_stream<R: BufRead>(reader: R) -> Result<ParsedOvalStream> {
    let mut reader = Reader::from_reader(reader);
    reader.config_mut().trim_text(true);

    let mut stream = ParsedOvalStream::default();

    let mut current_definition: Option<Definition> = None;
    let mut criteria_stack: Vec<Criteria> = Vec::new();
    let mut current_object: Option<RpminfoObject> = None;
    let mut current_state: Option<RpminfoState> = None;
    let mut current_test: Option<RpminfoTest> = None;
    let mut text: Option<String> = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"definition" => {
                    let class = attr(&e, "class").unwrap_or_default();
                    match definition_type_code(&class) {
                        Some(definition_type) => {
                            current_definition = Some(Definition {
                                oval_id: attr(&e, "id").unwrap_or_default(),
                                definition_type,
                                version: version_attr(&e),
                                ..Default::default()
                            });
                        }
                        None => {
                            tracing::debug!(%class, "skipping definition of unsupported class");
                            current_definition = None;
                        }
                    }
                    criteria_stack.clear();
                }
                b"criteria" if current_definition.is_some() => {
                    criteria_stack.push(Criteria {
                        operator: operator_code(attr(&e, "operator").as_deref().unwrap_or("AND")),
                        ..Default::default()
                    });
                }
                b"criterion" => on_criterion(&e, &mut criteria_stack),
                b"reference" => on_reference(&e, &mut current_definition),
                b"cve" if current_definition.is_some() => text = Some(String::new()),
                b"cpe" if current_definition.is_some() => text = Some(String::new()),
                b"rpminfo_object" => {
                    current_object = Some(RpminfoObject {
                        oval_id: attr(&e, "id").unwrap_or_default(),
                        package_name: String::new(),
                        version: version_attr(&e),
                    });
                }
                b"name" if current_object.is_some() => text = Some(String::new()),
                b"rpminfo_state" => {
                    current_state = Some(RpminfoState {
                        oval_id: attr(&e, "id").unwrap_or_default(),
                        version: version_attr(&e),
                        ..Default::default()
                    });
                }
                b"evr" if current_state.is_some() => {
                    if let Some(state) = current_state.as_mut() {
                        state.evr_operation =
                            attr(&e, "operation").as_deref().and_then(evr_operation_code);
                    }
                    text = Some(String::new());
                }
                b"arch" if current_state.is_some() => text = Some(String::new()),
                b"rpminfo_test" => {
                    // check_existence defaults to at_least_one_exists.
                    let check = check_code(attr(&e, "check").as_deref().unwrap_or(""));
                    let check_existence = check_existence_code(
                        attr(&e, "check_existence")
                            .as_deref()
                            .unwrap_or("at_least_one_exists"),
                    );
                    match (check, check_existence) {
                        (Some(check), Some(check_existence)) => {
                            current_test = Some(RpminfoTest {
                                oval_id: attr(&e, "id").unwrap_or_default(),
                                check,
                                check_existence,
                                version: version_attr(&e),
                                ..Default::default()
                            });
                        }
                        _ => {
                            tracing::debug!(
                                oval_id = %attr(&e, "id").unwrap_or_default(),
                                "skipping rpminfo test with unsupported check"
                            );
                            current_test = None;
                        }
                    }
                }
                b"object" => on_test_object(&e, &mut current_test),
                b"state" => on_test_state(&e, &mut current_test),
                b"module_test" => on_module_test(&e, &mut stream),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"criterion" => on_criterion(&e, &mut criteria_stack),
                b"reference" => on_reference(&e, &mut current_definition),
                b"object" => on_test_object(&e, &mut current_test),
                b"state" => on_test_state(&e, &mut current_test),
                b"module_test" => on_module_test(&e, &mut stream),
                _ => {}
            },
            Event::Text(e) => {
                if let Some(buffer) = text.as_mut() {
                    buffer.push_str(&e.decode()?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"definition" => {
                    if let Some(mut definition) = current_definition.take() {
                        definition.cves.sort_unstable();
                        definition.cves.dedup();
                        stream.definitions.push(definition);
                    }
                    criteria_stack.clear();
                }
                b"criteria" => {
                    if let Some(node) = criteria_stack.pop() {
                        match criteria_stack.last_mut() {
                            Some(parent) => parent.criteria.push(node),
                            None => {
                                if let Some(definition) = current_definition.as_mut() {
                                    definition.criteria = Some(node);
                                }
                            }
                        }
                    }
                }
                b"cve" => {
                    if let (Some(definition), Some(value)) =
                        (current_definition.as_mut(), text.take())
                    {
                        if !value.is_empty() {
                            definition.cves.push(value);
                        }
                    }
                }
                b"cpe" => {
                    if let (Some(definition), Some(value)) =
                        (current_definition.as_mut(), text.take())
                    {
                        if !value.is_empty() {
                            definition.cpes.push(value);
                        }
                    }
                }
                b"rpminfo_object" => {
                    if let Some(object) = current_object.take() {
                        if !object.package_name.is_empty() {
                            stream.objects.push(object);
                        }
                    }
                }
                b"name" => {
                    if let (Some(object), Some(value)) = (current_object.as_mut(), text.take()) {
                        object.package_name = value;
                    }
                }
                b"rpminfo_state" => {
                    if let Some(state) = current_state.take() {
                        stream.states.push(state);
                    }
                }
                b"evr" => {
                    if let (Some(state), Some(value)) = (current_state.as_mut(), text.take()) {
                        if !value.is_empty() {
                            state.evr = Some(value);
                        }
                    }
                }
                b"arch" => {
                    if let (Some(state), Some(value)) = (current_state.as_mut(), text.take()) {
                        state.arches = value
                            .split('|')
                            .map(str::trim)
                            .filter(|a| !a.is_empty())
                            .map(ToString::to_string)
                            .collect();
                    }
                }
                b"rpminfo_test" => {
                    if let Some(test) = current_test.take() {
                        if !test.object_ref.is_empty() {
                            stream.tests.push(test);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(stream)
}

fn on_criterion(e: &BytesStart<'_>, criteria_stack: &mut Vec<Criteria>) {
    if let (Some(node), Some(test_ref)) = (criteria_stack.last_mut(), attr(e, "test_ref")) {
        node.test_refs.push(test_ref);
    }
}

fn on_reference(e: &BytesStart<'_>, current_definition: &mut Option<Definition>) {
    if let Some(definition) = current_definition.as_mut() {
        if attr(e, "source").as_deref() == Some("CVE") {
            if let Some(ref_id) = attr(e, "ref_id") {
                definition.cves.push(ref_id);
            }
        }
    }
}

fn on_test_object(e: &BytesStart<'_>, current_test: &mut Option<RpminfoTest>) {
    if let (Some(test), Some(object_ref)) = (current_test.as_mut(), attr(e, "object_ref")) {
        test.object_ref = object_ref;
    }
}

fn on_test_state(e: &BytesStart<'_>, current_test: &mut Option<RpminfoTest>) {
    if let (Some(test), Some(state_ref)) = (current_test.as_mut(), attr(e, "state_ref")) {
        test.state_refs.push(state_ref);
    }
}

// Module gates are encoded as test elements whose comment reads
// "Module <name>:<stream> is enabled".
fn on_module_test(e: &BytesStart<'_>, stream: &mut ParsedOvalStream) {
    let Some(comment) = attr(e, "comment") else {
        return;
    };
    let Some(module_stream) = comment
        .strip_prefix("Module ")
        .and_then(|rest| rest.strip_suffix(" is enabled"))
    else {
        tracing::debug!(%comment, "skipping module test with unrecognized comment");
        return;
    };
    stream.module_tests.push(ModuleTest {
        oval_id: attr(e, "id").unwrap_or_default(),
        module_stream: module_stream.to_string(),
        version: version_attr(e),
    });
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    for attribute in e.attributes().flatten() {
        if attribute.key.local_name().as_ref() == name.as_bytes() {
            return attribute.unescape_value().ok().map(|v| v.into_owned());
        }
    }
    None
}

fn version_attr(e: &BytesStart<'_>) -> i64 {
    attr(e, "version").and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn definition_type_code(class: &str) -> Option<i64> {
    match class {
        "patch" => Some(1),
        "vulnerability" => Some(2),
        _ => None,
    }
}

fn operator_code(operator: &str) -> i64 {
    match operator {
        "OR" => 2,
        _ => 1,
    }
}

fn evr_operation_code(operation: &str) -> Option<i64> {
    match operation {
        "equals" => Some(1),
        "less than" => Some(2),
        _ => None,
    }
}

fn check_code(check: &str) -> Option<i64> {
    match check {
        "at least one" => Some(1),
        _ => None,
    }
}

fn check_existence_code(check_existence: &str) -> Option<i64> {
    match check_existence {
        "at_least_one_exists" => Some(1),
        "none_exist" => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<oval_definitions xmlns="http://oval.mitre.org/XMLSchema/oval-definitions-5">
  <definitions>
    <definition class="patch" id="oval:test:def:1" version="635">
      <metadata>
        <title>RHSA-2024:0001: bash security update</title>
        <reference source="RHSA" ref_id="RHSA-2024:0001" ref_url="https://access.redhat.com/errata/RHSA-2024:0001"/>
        <reference source="CVE" ref_id="CVE-2024-0001" ref_url="https://access.redhat.com/security/cve/CVE-2024-0001"/>
        <advisory from="secalert@redhat.com">
          <cve href="https://access.redhat.com/security/cve/CVE-2024-0001" impact="moderate">CVE-2024-0001</cve>
          <affected_cpe_list>
            <cpe>cpe:/o:redhat:enterprise_linux:7</cpe>
          </affected_cpe_list>
        </advisory>
      </metadata>
      <criteria operator="OR">
        <criterion test_ref="oval:test:tst:100" comment="bash is earlier than 0:4.2.46-35.el7"/>
        <criteria operator="AND">
          <criterion test_ref="oval:test:tst:101" comment="nodejs is earlier than 0:12.22.13-1"/>
          <criterion test_ref="oval:test:tst:200" comment="Module nodejs:12 is enabled"/>
        </criteria>
      </criteria>
    </definition>
    <definition class="inventory" id="oval:test:def:2" version="1">
      <criteria operator="AND">
        <criterion test_ref="oval:test:tst:999" comment="ignored"/>
      </criteria>
    </definition>
  </definitions>
  <tests>
    <rpminfo_test id="oval:test:tst:100" version="635" check="at least one" comment="bash is earlier than 0:4.2.46-35.el7">
      <object object_ref="oval:test:obj:10"/>
      <state state_ref="oval:test:ste:20"/>
    </rpminfo_test>
    <rpminfo_test id="oval:test:tst:101" version="635" check="at least one" check_existence="none_exist" comment="nodejs is not installed">
      <object object_ref="oval:test:obj:11"/>
    </rpminfo_test>
    <module_test id="oval:test:tst:200" version="635" comment="Module nodejs:12 is enabled"/>
  </tests>
  <objects>
    <rpminfo_object id="oval:test:obj:10" version="635">
      <name>bash</name>
    </rpminfo_object>
    <rpminfo_object id="oval:test:obj:11" version="635">
      <name>nodejs</name>
    </rpminfo_object>
  </objects>
  <states>
    <rpminfo_state id="oval:test:ste:20" version="635">
      <arch datatype="string" operation="pattern match">aarch64|ppc64le|s390x|x86_64</arch>
      <evr datatype="evr_string" operation="less than">0:4.2.46-35.el7</evr>
    </rpminfo_state>
  </states>
</oval_definitions>
"#;

    #[test]
    fn test_parse_objects() {
        let stream = parse_oval_stream(STREAM.as_bytes()).unwrap();
        assert_eq!(stream.objects.len(), 2);
        assert_eq!(stream.objects[0].oval_id, "oval:test:obj:10");
        assert_eq!(stream.objects[0].package_name, "bash");
        assert_eq!(stream.objects[0].version, 635);
    }

    #[test]
    fn test_parse_states() {
        let stream = parse_oval_stream(STREAM.as_bytes()).unwrap();
        assert_eq!(stream.states.len(), 1);

        let state = &stream.states[0];
        assert_eq!(state.oval_id, "oval:test:ste:20");
        assert_eq!(state.evr.as_deref(), Some("0:4.2.46-35.el7"));
        assert_eq!(state.evr_operation, Some(2));
        assert_eq!(state.arches, vec!["aarch64", "ppc64le", "s390x", "x86_64"]);
    }

    #[test]
    fn test_parse_tests() {
        let stream = parse_oval_stream(STREAM.as_bytes()).unwrap();
        assert_eq!(stream.tests.len(), 2);

        let evr_test = &stream.tests[0];
        assert_eq!(evr_test.oval_id, "oval:test:tst:100");
        assert_eq!(evr_test.object_ref, "oval:test:obj:10");
        assert_eq!(evr_test.state_refs, vec!["oval:test:ste:20"]);
        assert_eq!(evr_test.check, 1);
        assert_eq!(evr_test.check_existence, 1);

        let none_exist = &stream.tests[1];
        assert_eq!(none_exist.check_existence, 2);
        assert!(none_exist.state_refs.is_empty());
    }

    #[test]
    fn test_parse_module_tests() {
        let stream = parse_oval_stream(STREAM.as_bytes()).unwrap();
        assert_eq!(stream.module_tests.len(), 1);
        assert_eq!(stream.module_tests[0].oval_id, "oval:test:tst:200");
        assert_eq!(stream.module_tests[0].module_stream, "nodejs:12");
    }

    #[test]
    fn test_parse_definition() {
        let stream = parse_oval_stream(STREAM.as_bytes()).unwrap();
        // The inventory-class definition is skipped.
        assert_eq!(stream.definitions.len(), 1);

        let definition = &stream.definitions[0];
        assert_eq!(definition.oval_id, "oval:test:def:1");
        assert_eq!(definition.definition_type, 1);
        assert_eq!(definition.version, 635);
        // The CVE is referenced twice (reference + advisory) but kept once.
        assert_eq!(definition.cves, vec!["CVE-2024-0001"]);
        assert_eq!(definition.cpes, vec!["cpe:/o:redhat:enterprise_linux:7"]);
    }

    #[test]
    fn test_parse_criteria_tree() {
        let stream = parse_oval_stream(STREAM.as_bytes()).unwrap();
        let root = stream.definitions[0].criteria.as_ref().unwrap();

        assert_eq!(root.operator, 2);
        assert_eq!(root.test_refs, vec!["oval:test:tst:100"]);
        assert_eq!(root.criteria.len(), 1);

        let inner = &root.criteria[0];
        assert_eq!(inner.operator, 1);
        assert_eq!(
            inner.test_refs,
            vec!["oval:test:tst:101", "oval:test:tst:200"]
        );

        assert_eq!(
            root.test_refs_recursive(),
            vec![
                "oval:test:tst:100",
                "oval:test:tst:101",
                "oval:test:tst:200"
            ]
        );
    }
}
