use super::*;

use convoy_apis::{TemplateSource, TemplateSourceItem};

fn source(namespace: Option<&str>, optional: bool) -> TemplateSource {
    TemplateSource {
        api_version: "v1".into(),
        kind: "Secret".into(),
        namespace: namespace.map(|s| s.to_string()),
        name: "db-credentials".into(),
        items: vec![TemplateSourceItem { key: "data.password".into(), destination: "db.password".into() }],
        optional,
    }
}

// ------------- namespace resolution -------------

#[test]
fn namespaced_owner_pins_source_namespace() {
    let (gvk, key) = source_target(Some("prod"), &source(None, false)).unwrap();
    assert_eq!(gvk.kind, "Secret");
    assert_eq!(key.to_string(), "prod/db-credentials");

    // A matching declared namespace is fine.
    let (_, key) = source_target(Some("prod"), &source(Some("prod"), false)).unwrap();
    assert_eq!(key.namespace.as_deref(), Some("prod"));
}

#[test]
fn conflicting_namespaces_are_rejected() {
    let err = source_target(Some("prod"), &source(Some("other"), false)).unwrap_err();
    assert!(matches!(err, TemplateError::NamespaceMismatch { .. }));
    assert!(err.is_config_error());
}

#[test]
fn cluster_owner_uses_declared_namespace_or_fails() {
    let (_, key) = source_target(None, &source(Some("infra"), false)).unwrap();
    assert_eq!(key.namespace.as_deref(), Some("infra"));

    let err = source_target(None, &source(None, false)).unwrap_err();
    assert!(matches!(err, TemplateError::MissingNamespace { .. }));
}

// ------------- source value map -------------

#[test]
fn values_are_copied_to_nested_destinations() {
    let mut values = serde_json::json!({});
    let source_obj = serde_json::json!({
        "data": { "password": "hunter2", "user": "admin" }
    });
    let items = vec![
        TemplateSourceItem { key: "data.password".into(), destination: "db.password".into() },
        TemplateSourceItem { key: "data.user".into(), destination: "db.user".into() },
    ];
    copy_source_values(&mut values, &source_obj, &items, "db-credentials").unwrap();
    assert_eq!(values, serde_json::json!({"db": {"password": "hunter2", "user": "admin"}}));
}

#[test]
fn missing_key_is_a_config_error() {
    let mut values = serde_json::json!({});
    let items = vec![TemplateSourceItem { key: "data.nope".into(), destination: "x".into() }];
    let err =
        copy_source_values(&mut values, &serde_json::json!({"data": {}}), &items, "src").unwrap_err();
    assert!(matches!(err, TemplateError::MissingKey { .. }));
    assert!(err.is_config_error());
}

#[test]
fn duplicate_destination_is_rejected() {
    let mut values = serde_json::json!({});
    let source_obj = serde_json::json!({"data": {"a": "1", "b": "2"}});
    let items = vec![
        TemplateSourceItem { key: "data.a".into(), destination: "spec.a".into() },
        TemplateSourceItem { key: "data.b".into(), destination: "spec.a".into() },
    ];
    let err = copy_source_values(&mut values, &source_obj, &items, "src").unwrap_err();
    assert!(matches!(err, TemplateError::DuplicateDestination(path) if path == "spec.a"));
}

// ------------- rendering -------------

#[test]
fn rendering_is_deterministic() {
    let values = serde_json::json!({"db": {"password": "hunter2"}});
    let template = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: derived\nstringData:\n  pw: {{ config.db.password }}\n";
    let a = render_template(template, &values).unwrap();
    let b = render_template(template, &values).unwrap();
    assert_eq!(a, b);
    assert!(a.contains("pw: hunter2"));
}

#[test]
fn tojson_helper_is_available() {
    let values = serde_json::json!({"labels": {"a": "1"}});
    let rendered = render_template("labels: {{ config.labels | tojson }}", &values).unwrap();
    assert!(rendered.contains(r#"{"a":"1"}"#));
}

#[test]
fn template_compile_errors_surface() {
    let err = render_template("{{ unclosed", &serde_json::json!({})).unwrap_err();
    assert!(matches!(err, TemplateError::Render(_)));
    assert!(err.is_config_error());
}

// ------------- decoding -------------

#[test]
fn decode_accepts_one_document() {
    let obj = decode_rendered("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n").unwrap();
    assert_eq!(obj.types.as_ref().unwrap().kind, "ConfigMap");
}

#[test]
fn decode_rejects_multiple_documents() {
    let rendered = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
    let err = decode_rendered(rendered).unwrap_err();
    assert!(matches!(err, TemplateError::Decode(_)));
}

#[test]
fn decode_rejects_incomplete_objects() {
    assert!(decode_rendered("42").is_err());
    assert!(decode_rendered("metadata:\n  name: a\n").is_err());
    assert!(decode_rendered("apiVersion: v1\nkind: ConfigMap\n").is_err());
}

// ------------- desired object -------------

#[test]
fn templated_objects_carry_label_revision_and_owner_reference() {
    let mut owner = ObjectTemplate::new(
        "t",
        convoy_apis::ObjectTemplateSpec {
            template: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: derived\ndata:\n  pw: {{ config.db.password }}\n".into(),
            sources: Vec::new(),
        },
    );
    owner.metadata.namespace = Some("prod".to_string());
    owner.metadata.uid = Some("uid-t".to_string());
    owner.metadata.generation = Some(4);

    let values = serde_json::json!({"db": {"password": "hunter2"}});
    let desired = desired_object(&owner, &values).unwrap();

    assert_eq!(desired.metadata.name.as_deref(), Some("derived"));
    assert_eq!(desired.metadata.namespace.as_deref(), Some("prod"));
    assert_eq!(desired.data["data"]["pw"], "hunter2");
    assert_eq!(
        desired.metadata.labels.as_ref().unwrap().get(convoy_core::CACHE_LABEL).map(String::as_str),
        Some("True")
    );
    assert_eq!(
        desired.metadata.annotations.as_ref().unwrap().get(REVISION_ANNOTATION).map(String::as_str),
        Some("4")
    );
    let refs = desired.metadata.owner_references.as_ref().unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].uid, "uid-t");
    assert_eq!(refs[0].kind, "ObjectTemplate");
    assert_eq!(refs[0].controller, Some(true));
}

#[test]
fn templated_objects_without_generation_stamp_revision_zero() {
    let mut owner = ObjectTemplate::new(
        "t",
        convoy_apis::ObjectTemplateSpec {
            template: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: derived\n".into(),
            sources: Vec::new(),
        },
    );
    // Owner reference assembly needs a uid; generation stays unset.
    owner.metadata.uid = Some("uid-t".to_string());

    let desired = desired_object(&owner, &serde_json::json!({})).unwrap();
    assert_eq!(
        desired.metadata.annotations.as_ref().unwrap().get(REVISION_ANNOTATION).map(String::as_str),
        Some("0")
    );
}

// ------------- convergence comparison -------------

fn dynamic(value: serde_json::Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

#[test]
fn semantic_compare_ignores_server_managed_fields() {
    let existing = dynamic(serde_json::json!({
        "apiVersion": "convoy.run/v1alpha1",
        "kind": "Package",
        "metadata": {
            "name": "p",
            "namespace": "ns",
            "uid": "u-1",
            "resourceVersion": "42",
            "generation": 3,
            "creationTimestamp": "2023-01-01T00:00:00Z",
            "annotations": {REVISION_ANNOTATION: "7"}
        },
        "spec": {"image": "quay.io/app:v1"},
        "status": {"phase": "Available"}
    }));
    let desired = dynamic(serde_json::json!({
        "apiVersion": "convoy.run/v1alpha1",
        "kind": "Package",
        "metadata": {"name": "p", "namespace": "ns"},
        "spec": {"image": "quay.io/app:v1"}
    }));
    assert!(!semantic_changed(&existing, &desired).unwrap());

    let mut drifted = desired.clone();
    drifted.data["spec"]["image"] = serde_json::Value::String("quay.io/app:v2".into());
    assert!(semantic_changed(&existing, &drifted).unwrap());
}

// ------------- phase ladder -------------

fn cond(type_: &str, status: &str) -> Condition {
    conditions::new_condition(type_, status, "Test", "", Some(1))
}

#[test]
fn phase_ladder_orders_conditions() {
    use condition_types::*;

    assert_eq!(compute_phase(&[cond(INVALID, "True")]), StatusPhase::Invalid);
    assert_eq!(compute_phase(&[]), StatusPhase::Unpacking);
    assert_eq!(
        compute_phase(&[cond(UNPACKED, "True"), cond(PROGRESSING, "True")]),
        StatusPhase::Progressing
    );
    assert_eq!(
        compute_phase(&[cond(UNPACKED, "True"), cond(AVAILABLE, "True")]),
        StatusPhase::Available
    );
    assert_eq!(compute_phase(&[cond(UNPACKED, "True")]), StatusPhase::NotReady);
}

#[test]
fn owner_status_accessors_round_trip() {
    let mut template = ObjectTemplate::new(
        "t",
        convoy_apis::ObjectTemplateSpec { template: String::new(), sources: Vec::new() },
    );
    assert!(template.conditions().is_empty());
    template.conditions_mut().push(cond(condition_types::AVAILABLE, "True"));
    template.set_phase(StatusPhase::Available);
    let body = template.status_body();
    assert_eq!(body["status"]["phase"], "Available");
    assert_eq!(body["status"]["conditions"][0]["type"], "Available");
}
