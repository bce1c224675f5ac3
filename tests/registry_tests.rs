//! Application registry: startup validation of schemas and templates,
//! submission-time role checks, payload validation and coercion.

use jobrelay::config::Config;
use jobrelay::error::{ConfigError, ValidationError};
use jobrelay::job::Principal;
use jobrelay::registry::ApplicationRegistry;

fn registry_from(yaml: &str) -> Result<ApplicationRegistry, ConfigError> {
    let mut config: Config = serde_yaml::from_str(yaml).expect("parse yaml");
    config.validate().expect("validate config");
    ApplicationRegistry::from_config(&config)
}

fn expert() -> Principal {
    Principal::new("erin", vec!["expert".to_string()], "tests")
}

#[test]
fn startup_rejects_unquoted_substitutions() {
    let err = registry_from(
        r#"
job_root_dir: /tmp/jobs
applications:
  leaky:
    command_template: "echo {{ msg }}"
    input_schema:
      type: object
      properties:
        msg: {type: string}
"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::UnquotedSubstitution { variable, .. } if variable == "msg"
    ));
}

#[test]
fn startup_rejects_templates_that_do_not_parse() {
    let err = registry_from(
        r#"
job_root_dir: /tmp/jobs
applications:
  broken:
    command_template: "echo {% if x"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::BadTemplate { .. }));
}

#[test]
fn startup_rejects_non_scalar_schema_properties() {
    let err = registry_from(
        r#"
job_root_dir: /tmp/jobs
applications:
  nested:
    command_template: "true"
    input_schema:
      type: object
      properties:
        blob: {type: array}
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidSchema { .. }));
}

#[test]
fn startup_rejects_non_object_schemas() {
    let err = registry_from(
        r#"
job_root_dir: /tmp/jobs
applications:
  stringy:
    command_template: "true"
    input_schema:
      type: string
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidSchema { .. }));
}

const APP_YAML: &str = r#"
job_root_dir: /tmp/jobs
applications:
  convert:
    command_template: "convert --level {{ level|q }} {% if fast %}--fast{% endif %} {{ source|q }}"
    allowed_roles: [expert]
    input_schema:
      type: object
      properties:
        level: {type: integer}
        fast: {type: boolean}
        source: {type: string}
      required: [level, source]
"#;

#[test]
fn renders_with_coerced_scalars() {
    let registry = registry_from(APP_YAML).unwrap();
    let command = registry
        .prepare_command(
            "convert",
            &expert(),
            &serde_json::json!({"level": 3, "fast": true, "source": "in file.dat"}),
        )
        .unwrap();
    assert_eq!(command, "convert --level 3 --fast 'in file.dat'");
}

#[test]
fn false_booleans_disable_conditional_flags() {
    let registry = registry_from(APP_YAML).unwrap();
    let command = registry
        .prepare_command(
            "convert",
            &expert(),
            &serde_json::json!({"level": 2, "fast": false, "source": "x"}),
        )
        .unwrap();
    assert_eq!(command, "convert --level 2  x");
}

#[test]
fn absent_optional_properties_render_as_disabled_flags() {
    let registry = registry_from(APP_YAML).unwrap();
    let command = registry
        .prepare_command(
            "convert",
            &expert(),
            &serde_json::json!({"level": 1, "source": "x"}),
        )
        .unwrap();
    assert_eq!(command, "convert --level 1  x");
}

#[test]
fn schema_violations_are_validation_errors() {
    let registry = registry_from(APP_YAML).unwrap();
    let err = registry
        .prepare_command("convert", &expert(), &serde_json::json!({"source": "x"}))
        .unwrap_err();
    assert!(matches!(err, ValidationError::InvalidPayload(_)));
}

#[test]
fn role_checks_gate_restricted_applications() {
    let registry = registry_from(APP_YAML).unwrap();
    let outsider = Principal::new("mallory", vec!["user".to_string()], "tests");
    let err = registry
        .prepare_command(
            "convert",
            &outsider,
            &serde_json::json!({"level": 1, "source": "x"}),
        )
        .unwrap_err();
    assert!(matches!(err, ValidationError::RoleDenied(_)));
}

#[test]
fn empty_allowed_roles_admit_any_principal() {
    let registry = registry_from(
        r#"
job_root_dir: /tmp/jobs
applications:
  open:
    command_template: "true"
"#,
    )
    .unwrap();
    let nobody = Principal::new("nobody", vec![], "tests");
    registry
        .prepare_command("open", &nobody, &serde_json::json!({}))
        .unwrap();
}

#[test]
fn unknown_application_is_reported() {
    let registry = registry_from(APP_YAML).unwrap();
    let err = registry
        .prepare_command("missing", &expert(), &serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, ValidationError::UnknownApplication(_)));
}

#[test]
fn nul_bytes_never_reach_the_shell() {
    let registry = registry_from(APP_YAML).unwrap();
    let err = registry
        .prepare_command(
            "convert",
            &expert(),
            &serde_json::json!({"level": 1, "source": "a\u{0}b"}),
        )
        .unwrap_err();
    assert!(matches!(err, ValidationError::InvalidPayload(_)));
}
