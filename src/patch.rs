//! RFC-6902 patch construction.
//!
//! Two strategies are provided. [`diff`] compares two documents generically,
//! with LCS-based array handling so in-place list edits stay element-scoped.
//! [`metadata_patch`] replaces whole `/metadata/labels` and
//! `/metadata/annotations` subtrees instead of touching individual keys:
//! patch paths never contain `~1`-escaped key segments, which the API server
//! fails to unescape for keys containing `/`.

use std::collections::BTreeMap;

use json_patch::{
    AddOperation, MoveOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation,
};
use serde_json::Value;
use thiserror::Error;

use crate::fieldmap::FieldMap;
use crate::rule::{Additions, Deletions};
use crate::{template, validation};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("failed to expand template: {0}")]
    Template(#[from] template::Error),
    #[error("template-expanded label value {value:?} is not a valid label value: {source}")]
    ExpandedLabelValue {
        value: String,
        #[source]
        source: validation::Error,
    },
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn join(path: &str, token: &str) -> String {
    format!("{path}/{}", escape(token))
}

fn join_index(path: &str, index: usize) -> String {
    format!("{path}/{index}")
}

enum DiffOp {
    Add { path: String, value: Value },
    Remove { path: String, old: Value },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
}

impl DiffOp {
    fn into_operation(self) -> PatchOperation {
        match self {
            DiffOp::Add { path, value } => PatchOperation::Add(AddOperation { path, value }),
            DiffOp::Remove { path, .. } => PatchOperation::Remove(RemoveOperation { path }),
            DiffOp::Replace { path, value } => {
                PatchOperation::Replace(ReplaceOperation { path, value })
            }
            DiffOp::Move { from, path } => PatchOperation::Move(MoveOperation { from, path }),
        }
    }
}

/// Produces the minimal patch turning `before` into `after`. Deep-equal
/// documents produce an empty patch.
pub fn diff(before: &Value, after: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_value(before, after, String::new(), &mut ops);
    collapse(ops)
}

fn diff_value(before: &Value, after: &Value, path: String, ops: &mut Vec<DiffOp>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => diff_objects(b, a, &path, ops),
        (Value::Array(b), Value::Array(a)) => diff_arrays(b, a, &path, ops),
        _ => ops.push(DiffOp::Replace {
            path,
            value: after.clone(),
        }),
    }
}

fn diff_objects(
    before: &serde_json::Map<String, Value>,
    after: &serde_json::Map<String, Value>,
    path: &str,
    ops: &mut Vec<DiffOp>,
) {
    for (key, old) in before {
        match after.get(key) {
            Some(new) => diff_value(old, new, join(path, key), ops),
            None => ops.push(DiffOp::Remove {
                path: join(path, key),
                old: old.clone(),
            }),
        }
    }
    for (key, new) in after {
        if !before.contains_key(key) {
            ops.push(DiffOp::Add {
                path: join(path, key),
                value: new.clone(),
            });
        }
    }
}

fn diff_arrays(before: &[Value], after: &[Value], path: &str, ops: &mut Vec<DiffOp>) {
    let pairs = lcs_pairs(before, after);
    let mut i = 0;
    let mut j = 0;
    let mut next_pair = 0;
    // Index into the array as it evolves while the patch is applied:
    // removals do not advance it.
    let mut index = 0;
    while i < before.len() || j < after.len() {
        let keep_i = pairs.get(next_pair).map_or(false, |&(ci, _)| ci == i);
        let keep_j = pairs.get(next_pair).map_or(false, |&(_, cj)| cj == j);
        if keep_i && keep_j {
            i += 1;
            j += 1;
            next_pair += 1;
            index += 1;
        } else if i < before.len() && !keep_i && j < after.len() && !keep_j {
            diff_value(&before[i], &after[j], join_index(path, index), ops);
            i += 1;
            j += 1;
            index += 1;
        } else if i < before.len() && !keep_i {
            ops.push(DiffOp::Remove {
                path: join_index(path, index),
                old: before[i].clone(),
            });
            i += 1;
        } else {
            ops.push(DiffOp::Add {
                path: join_index(path, index),
                value: after[j].clone(),
            });
            j += 1;
            index += 1;
        }
    }
}

/// Longest common subsequence of the two slices as matched index pairs,
/// strictly increasing on both sides.
fn lcs_pairs(a: &[Value], b: &[Value]) -> Vec<(usize, usize)> {
    let n = a.len();
    let m = b.len();
    let mut lengths = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lengths[i][j] = if a[i] == b[j] {
                lengths[i + 1][j + 1] + 1
            } else {
                lengths[i + 1][j].max(lengths[i][j + 1])
            };
        }
    }
    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if lengths[i + 1][j] >= lengths[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

/// True when the final path segment addresses an object member rather than
/// an array index. Moves only collapse between object members: dropping a
/// remove shifts array indices.
fn is_member_path(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .map_or(false, |segment| segment.parse::<usize>().is_err())
}

fn collapse(ops: Vec<DiffOp>) -> Patch {
    let mut out: Vec<DiffOp> = Vec::new();
    for op in ops {
        match op {
            DiffOp::Add { path, value } => {
                if let Some(DiffOp::Remove { path: removed, .. }) = out.last() {
                    if *removed == path {
                        out.pop();
                        out.push(DiffOp::Replace { path, value });
                        continue;
                    }
                }
                let matching_remove = out.iter().enumerate().find_map(|(pos, op)| match op {
                    DiffOp::Remove { path: from, old }
                        if *old == value && is_member_path(from) =>
                    {
                        Some((pos, from.clone()))
                    }
                    _ => None,
                });
                if let Some((pos, from)) = matching_remove {
                    if is_member_path(&path) {
                        out.remove(pos);
                        out.push(DiffOp::Move { from, path });
                        continue;
                    }
                }
                out.push(DiffOp::Add { path, value });
            }
            other => out.push(other),
        }
    }
    Patch(out.into_iter().map(DiffOp::into_operation).collect())
}

struct SubtreeEdit {
    present: bool,
    current: BTreeMap<String, String>,
    desired: BTreeMap<String, String>,
}

impl SubtreeEdit {
    fn changed(&self) -> bool {
        self.current != self.desired
    }

    fn desired_value(&self) -> Value {
        Value::Object(
            self.desired
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

fn string_map(subtree: Option<&Value>) -> (bool, BTreeMap<String, String>) {
    match subtree.and_then(Value::as_object) {
        Some(map) => (
            true,
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
        ),
        None => (false, BTreeMap::new()),
    }
}

fn edit_subtree(
    object: &Value,
    subtree: &str,
    additions: &BTreeMap<String, String>,
    deletions: &[String],
    fields: &FieldMap,
    label_values: bool,
) -> Result<SubtreeEdit, Error> {
    let (present, current) = string_map(object.pointer(&format!("/metadata/{subtree}")));
    let mut desired = current.clone();
    for (key, value) in additions {
        let expanded = template::expand(value, fields)?;
        if label_values && template::is_templated(value) {
            validation::validate_label_value(&expanded).map_err(|source| {
                Error::ExpandedLabelValue {
                    value: expanded.clone(),
                    source,
                }
            })?;
        }
        desired.insert(key.clone(), expanded);
    }
    for key in deletions {
        desired.remove(key);
    }
    Ok(SubtreeEdit {
        present,
        current,
        desired,
    })
}

fn metadata_edits(
    object: &Value,
    additions: &Additions,
    deletions: &Deletions,
    fields: &FieldMap,
) -> Result<[(&'static str, SubtreeEdit); 2], Error> {
    let labels = edit_subtree(
        object,
        "labels",
        &additions.labels,
        &deletions.labels,
        fields,
        true,
    )?;
    let annotations = edit_subtree(
        object,
        "annotations",
        &additions.annotations,
        &deletions.annotations,
        fields,
        false,
    )?;
    Ok([("labels", labels), ("annotations", annotations)])
}

/// Builds the admission-time patch for an additions/deletions payload: one
/// `replace` (or `add`, when the map is absent) per changed metadata
/// subtree. Returns `None` when nothing changes.
pub fn metadata_patch(
    object: &Value,
    additions: &Additions,
    deletions: &Deletions,
    fields: &FieldMap,
) -> Result<Option<Patch>, Error> {
    let mut ops = Vec::new();
    for (subtree, edit) in metadata_edits(object, additions, deletions, fields)? {
        if !edit.changed() {
            continue;
        }
        let path = format!("/metadata/{subtree}");
        let value = edit.desired_value();
        ops.push(if edit.present {
            PatchOperation::Replace(ReplaceOperation { path, value })
        } else {
            PatchOperation::Add(AddOperation { path, value })
        });
    }
    if ops.is_empty() {
        return Ok(None);
    }
    Ok(Some(Patch(ops)))
}

/// Applies an additions/deletions payload by rebuilding the object and
/// diffing it generically. Used for the backfill's namespace-label path.
pub fn whole_object_patch(
    object: &Value,
    additions: &Additions,
    deletions: &Deletions,
    fields: &FieldMap,
) -> Result<Option<Patch>, Error> {
    let edits = metadata_edits(object, additions, deletions, fields)?;
    if edits.iter().all(|(_, edit)| !edit.changed()) {
        return Ok(None);
    }
    let mut after = object.clone();
    for (subtree, edit) in &edits {
        if !edit.changed() {
            continue;
        }
        if let Some(metadata) = after.pointer_mut("/metadata").and_then(Value::as_object_mut) {
            metadata.insert(subtree.to_string(), edit.desired_value());
        }
    }
    let patch = diff(object, &after);
    if patch.0.is_empty() {
        return Ok(None);
    }
    Ok(Some(patch))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn apply(before: &Value, patch: &Patch) -> Value {
        let mut doc = before.clone();
        json_patch::patch(&mut doc, patch).unwrap();
        doc
    }

    #[test]
    fn identity_diff_is_empty() {
        let doc = json!({"a": {"b": [1, 2, {"c": true}]}, "d": null});
        assert!(diff(&doc, &doc).0.is_empty());
    }

    #[test]
    fn diff_round_trips() {
        let cases = [
            (json!({"a": 1}), json!({"a": 2})),
            (json!({"a": 1}), json!({"b": 1})),
            (json!({"a": {"b": "x"}}), json!({"a": {"b": "y", "c": "z"}})),
            (json!({"l": [1, 2, 3]}), json!({"l": [1, 3]})),
            (json!({"l": [1, 2, 3]}), json!({"l": [0, 1, 2, 3, 4]})),
            (json!({"l": ["a", "b", "c"]}), json!({"l": ["c", "b", "a"]})),
            (json!({"l": [{"n": 1}, {"n": 2}]}), json!({"l": [{"n": 1}, {"n": 3}]})),
            (json!({"x": [1]}), json!({"x": {"y": 1}})),
            (json!({"a": 1, "b": {"c": 2}}), json!({})),
        ];
        for (before, after) in cases {
            let patch = diff(&before, &after);
            assert_eq!(apply(&before, &patch), after, "patch {patch:?}");
        }
    }

    #[test]
    fn in_place_list_edit_stays_element_scoped() {
        let before = json!({"l": [{"n": 1}, {"n": 2}, {"n": 3}]});
        let after = json!({"l": [{"n": 1}, {"n": 9}, {"n": 3}]});
        let patch = diff(&before, &after);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "replace", "path": "/l/1/n", "value": 9}])
        );
    }

    #[test]
    fn removed_and_readded_value_becomes_move() {
        let before = json!({"a": {"deep": [1, 2]}, "b": 2});
        let after = json!({"b": 2, "c": {"deep": [1, 2]}});
        let patch = diff(&before, &after);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "move", "from": "/a", "path": "/c"}])
        );
        assert_eq!(apply(&before, &patch), after);
    }

    #[test]
    fn type_change_collapses_to_replace() {
        let before = json!({"x": [1, 2]});
        let after = json!({"x": "scalar"});
        let patch = diff(&before, &after);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "replace", "path": "/x", "value": "scalar"}])
        );
    }

    #[test]
    fn pointer_tokens_are_escaped() {
        let before = json!({"m": {"a/b": 1, "t~x": 2}});
        let after = json!({"m": {"a/b": 3, "t~x": 2}});
        let patch = diff(&before, &after);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "replace", "path": "/m/a~1b", "value": 3}])
        );
        assert_eq!(apply(&before, &patch), after);
    }

    fn additions(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Additions {
        Additions {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn deletions(labels: &[&str], annotations: &[&str]) -> Deletions {
        Deletions {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            annotations: annotations.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn label_addition_replaces_whole_subtree() {
        let object = json!({"metadata": {"labels": {"author": "david", "group": "runtime"}}});
        let patch = metadata_patch(
            &object,
            &additions(&[("modified-by-graffiti", "abc123")], &[]),
            &deletions(&[], &[]),
            &FieldMap::new(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{
                "op": "replace",
                "path": "/metadata/labels",
                "value": {"author": "david", "group": "runtime", "modified-by-graffiti": "abc123"},
            }])
        );
    }

    #[test]
    fn annotation_deletion_keeps_slash_keys_out_of_paths() {
        let object = json!({"metadata": {"annotations": {
            "level": "v.special",
            "prometheus.io/path": "/metrics",
        }}});
        let patch = metadata_patch(
            &object,
            &additions(&[], &[]),
            &deletions(&[], &["level"]),
            &FieldMap::new(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{
                "op": "replace",
                "path": "/metadata/annotations",
                "value": {"prometheus.io/path": "/metrics"},
            }])
        );
    }

    #[test]
    fn absent_subtree_is_added_not_replaced() {
        let object = json!({"metadata": {"name": "web"}});
        let patch = metadata_patch(
            &object,
            &additions(&[("painted", "yes")], &[]),
            &deletions(&[], &[]),
            &FieldMap::new(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "add", "path": "/metadata/labels", "value": {"painted": "yes"}}])
        );
    }

    #[test]
    fn deleting_missing_keys_is_a_no_op() {
        let object = json!({"metadata": {"labels": {"a": "b"}}});
        let patch = metadata_patch(
            &object,
            &additions(&[], &[]),
            &deletions(&["no-such-label"], &["no-such-annotation"]),
            &FieldMap::new(),
        )
        .unwrap();
        assert!(patch.is_none());
    }

    #[test]
    fn adding_identical_values_is_a_no_op() {
        let object = json!({"metadata": {"labels": {"a": "b"}}});
        let patch = metadata_patch(
            &object,
            &additions(&[("a", "b")], &[]),
            &deletions(&[], &[]),
            &FieldMap::new(),
        )
        .unwrap();
        assert!(patch.is_none());
    }

    #[test]
    fn templated_label_values_are_revalidated() {
        let object = json!({"metadata": {"labels": {"a": "b"}}});
        let mut fields = FieldMap::new();
        fields.insert("metadata.name".to_string(), "x".repeat(64));
        let err = metadata_patch(
            &object,
            &additions(&[("copy", r#"{{ index . "metadata.name" }}"#)], &[]),
            &deletions(&[], &[]),
            &fields,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ExpandedLabelValue { .. }));
    }

    #[test]
    fn whole_object_patch_diffs_generically() {
        let object = json!({"metadata": {
            "name": "team-a",
            "labels": {"team": "a", "stale": "yes"},
        }});
        let patch = whole_object_patch(
            &object,
            &additions(&[("painted", "yes")], &[]),
            &deletions(&["stale"], &[]),
            &FieldMap::new(),
        )
        .unwrap()
        .unwrap();
        let patched = apply(&object, &patch);
        assert_eq!(
            patched,
            json!({"metadata": {
                "name": "team-a",
                "labels": {"team": "a", "painted": "yes"},
            }})
        );
    }

    #[test]
    fn whole_object_patch_none_when_unchanged() {
        let object = json!({"metadata": {"name": "team-a", "labels": {"team": "a"}}});
        let patch = whole_object_patch(
            &object,
            &additions(&[("team", "a")], &[]),
            &deletions(&[], &[]),
            &FieldMap::new(),
        )
        .unwrap();
        assert!(patch.is_none());
    }
}
