//! Recursive evaluation of OVAL criteria trees
//!
//! A criteria node is an AND/OR over module tests, rpminfo tests and child
//! criteria. Evaluation short-circuits as soon as the outcome is decided and
//! recurses depth-first; the dependency graph is a forest by construction,
//! but a repeated id on the recursion path is still reported as a fatal data
//! error rather than looping forever.

use std::collections::HashSet;

use crate::error::EvalError;
use crate::evaluator::cache::{Cache, StateRef};
use crate::evaluator::{
    OVAL_CHECK_EXISTENCE_AT_LEAST_ONE, OVAL_CHECK_EXISTENCE_NONE, OVAL_CRITERIA_OPERATOR_AND,
    OVAL_CRITERIA_OPERATOR_OR, OVAL_OPERATION_EVR_EQUALS, OVAL_OPERATION_EVR_LESS_THAN,
};
use crate::rpm::rpmver2array;

/// Package identity resolved against the cache, ready for tree evaluation
#[derive(Debug, Clone)]
pub struct PackageEval {
    pub package_name_id: i64,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

/// Evaluate the criteria tree rooted at `criteria_id` for one package.
pub fn evaluate_criteria(
    cache: &Cache,
    criteria_id: i64,
    package: &PackageEval,
    modules: &HashSet<String>,
) -> Result<bool, EvalError> {
    let mut path = Vec::new();
    evaluate_criteria_at(cache, criteria_id, package, modules, &mut path)
}

fn evaluate_criteria_at(
    cache: &Cache,
    criteria_id: i64,
    package: &PackageEval,
    modules: &HashSet<String>,
    path: &mut Vec<i64>,
) -> Result<bool, EvalError> {
    if path.contains(&criteria_id) {
        return Err(EvalError::CriteriaCycle(criteria_id));
    }
    path.push(criteria_id);
    let result = evaluate_node(cache, criteria_id, package, modules, path);
    path.pop();
    result
}

fn evaluate_node(
    cache: &Cache,
    criteria_id: i64,
    package: &PackageEval,
    modules: &HashSet<String>,
    path: &mut Vec<i64>,
) -> Result<bool, EvalError> {
    let operator = *cache
        .criteria_id2operator
        .get(&criteria_id)
        .ok_or(EvalError::UnknownCriteria(criteria_id))?;

    let module_test_deps = dep_slice(&cache.criteria_id2dep_module_test_ids, criteria_id);
    let test_deps = dep_slice(&cache.criteria_id2dep_test_ids, criteria_id);
    let criteria_deps = dep_slice(&cache.criteria_id2dep_criteria_ids, criteria_id);
    let total = module_test_deps.len() + test_deps.len() + criteria_deps.len();

    // An AND with no dependencies holds, an OR with none does not.
    let (required, must_match) = match operator {
        OVAL_CRITERIA_OPERATOR_AND => (total, true),
        OVAL_CRITERIA_OPERATOR_OR => (total.min(1), false),
        other => return Err(EvalError::UnsupportedCriteriaOperator(other)),
    };

    let mut matches = 0;

    for &module_test_id in module_test_deps {
        if matches >= required {
            break;
        }
        if evaluate_module_test(cache, module_test_id, modules)? {
            matches += 1;
        } else if must_match {
            return Ok(false);
        }
    }

    for &test_id in test_deps {
        if matches >= required {
            break;
        }
        if evaluate_test(cache, test_id, package)? {
            matches += 1;
        } else if must_match {
            return Ok(false);
        }
    }

    for &dep_criteria_id in criteria_deps {
        if matches >= required {
            break;
        }
        if evaluate_criteria_at(cache, dep_criteria_id, package, modules, path)? {
            matches += 1;
        } else if must_match {
            return Ok(false);
        }
    }

    let matched = matches >= required;
    tracing::debug!(criteria_id, operator, matched, "evaluated criteria");
    Ok(matched)
}

fn dep_slice(map: &std::collections::HashMap<i64, Vec<i64>>, criteria_id: i64) -> &[i64] {
    map.get(&criteria_id).map(Vec::as_slice).unwrap_or(&[])
}

/// A module test matches when its `name:stream` is enabled on the system.
fn evaluate_module_test(
    cache: &Cache,
    module_test_id: i64,
    modules: &HashSet<String>,
) -> Result<bool, EvalError> {
    let stream = cache
        .module_test_id2stream
        .get(&module_test_id)
        .ok_or(EvalError::UnknownModuleTest(module_test_id))?;
    Ok(modules.contains(stream))
}

fn evaluate_test(cache: &Cache, test_id: i64, package: &PackageEval) -> Result<bool, EvalError> {
    let detail = cache
        .test_detail
        .get(&test_id)
        .ok_or(EvalError::UnknownTest(test_id))?;
    let name_matched = package.package_name_id == detail.package_name_id;

    let matched = match detail.check_existence {
        OVAL_CHECK_EXISTENCE_AT_LEAST_ONE => {
            let states = cache
                .test_id2states
                .get(&test_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if name_matched && !states.is_empty() {
                let mut any = false;
                for state in states {
                    if evaluate_state(cache, state, package)? {
                        any = true;
                        break;
                    }
                }
                any
            } else {
                // A test without states asks only for the package to exist.
                name_matched
            }
        }
        OVAL_CHECK_EXISTENCE_NONE => !name_matched,
        other => return Err(EvalError::UnsupportedCheckExistence(other)),
    };

    tracing::debug!(
        test_id,
        candidate = detail.package_name_id,
        matched,
        "evaluated rpminfo test"
    );
    Ok(matched)
}

fn evaluate_state(
    cache: &Cache,
    state: &StateRef,
    package: &PackageEval,
) -> Result<bool, EvalError> {
    let candidate = cache
        .id2evr
        .get(&state.evr_id)
        .ok_or(EvalError::UnknownEvr(state.evr_id))?;

    let mut matched = match state.evr_operation {
        OVAL_OPERATION_EVR_EQUALS => {
            package.epoch == candidate.epoch
                && package.version == candidate.version
                && package.release == candidate.release
        }
        OVAL_OPERATION_EVR_LESS_THAN => {
            // Component-wise: epoch decides first, then version, then release.
            let epoch = rpmver2array(&package.epoch);
            let candidate_epoch = rpmver2array(&candidate.epoch);
            let ver = rpmver2array(&package.version);
            let candidate_ver = rpmver2array(&candidate.version);
            let rel = rpmver2array(&package.release);
            let candidate_rel = rpmver2array(&candidate.release);

            epoch < candidate_epoch
                || (epoch == candidate_epoch && ver < candidate_ver)
                || (epoch == candidate_epoch && ver == candidate_ver && rel < candidate_rel)
        }
        other => return Err(EvalError::UnsupportedEvrOperation(other)),
    };

    if let Some(arches) = cache.state_id2arch_ids.get(&state.state_id) {
        if !arches.is_empty() {
            matched = matched
                && cache
                    .arch2id
                    .get(&package.arch)
                    .is_some_and(|id| arches.contains(id));
        }
    }

    tracing::debug!(
        state_id = state.state_id,
        evr_id = state.evr_id,
        operation = state.evr_operation,
        matched,
        "evaluated state"
    );
    Ok(matched)
}
