//! Typed, validated view over the configured applications and
//! interactive applications.
//!
//! All configuration problems surface here at startup: schemas that are
//! not 2020-12 objects with scalar properties, templates that fail to
//! parse, and templates that would substitute user input without shell
//! quoting. After construction, rendering a command for a
//! schema-validated payload cannot fail.

use std::collections::BTreeMap;

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::config::{ApplicationConfig, Config, InteractiveApplicationConfig};
use crate::error::{ConfigError, ValidationError};
use crate::job::Principal;
use crate::template::TemplateEngine;

#[derive(Debug)]
pub struct Application {
    pub name: String,
    pub config: ApplicationConfig,
    schema: Option<JSONSchema>,
    properties: Vec<String>,
}

#[derive(Debug)]
pub struct InteractiveApplication {
    pub name: String,
    pub config: InteractiveApplicationConfig,
    schema: Option<JSONSchema>,
    properties: Vec<String>,
}

#[derive(Debug)]
pub struct ApplicationRegistry {
    applications: BTreeMap<String, Application>,
    interactive: BTreeMap<String, InteractiveApplication>,
    engine: TemplateEngine,
}

impl ApplicationRegistry {
    /// Validate every application and interactive application in the
    /// config and build the registry.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let engine = TemplateEngine::new();

        let mut applications = BTreeMap::new();
        for (name, app_config) in &config.applications {
            let (schema, properties) =
                compile_schema(name, app_config.input_schema.as_ref())?;
            engine.audit(name, &app_config.command_template, &properties)?;
            applications.insert(
                name.clone(),
                Application {
                    name: name.clone(),
                    config: app_config.clone(),
                    schema,
                    properties,
                },
            );
        }

        let mut interactive = BTreeMap::new();
        for (name, app_config) in &config.interactive_applications {
            let (schema, properties) =
                compile_schema(name, app_config.input_schema.as_ref())?;
            engine.audit(name, &app_config.command_template, &properties)?;
            interactive.insert(
                name.clone(),
                InteractiveApplication {
                    name: name.clone(),
                    config: app_config.clone(),
                    schema,
                    properties,
                },
            );
        }

        Ok(Self {
            applications,
            interactive,
            engine,
        })
    }

    pub fn application(&self, name: &str) -> Result<&Application, ValidationError> {
        self.applications
            .get(name)
            .ok_or_else(|| ValidationError::UnknownApplication(name.to_string()))
    }

    pub fn interactive_application(
        &self,
        name: &str,
    ) -> Result<&InteractiveApplication, crate::error::InteractiveError> {
        self.interactive
            .get(name)
            .ok_or_else(|| crate::error::InteractiveError::UnknownApplication(name.to_string()))
    }

    pub fn application_names(&self) -> Vec<String> {
        self.applications.keys().cloned().collect()
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    /// Submission-time gate: role check, payload validation, rendering.
    pub fn prepare_command(
        &self,
        application: &str,
        principal: &Principal,
        payload: &Value,
    ) -> Result<String, ValidationError> {
        let app = self.application(application)?;
        if !app.config.allowed_roles.is_empty()
            && !app.config.allowed_roles.iter().any(|r| principal.has_role(r))
        {
            return Err(ValidationError::RoleDenied(application.to_string()));
        }
        let params = app.validated_params(payload)?;
        self.engine
            .render(&app.config.command_template, &params)
            .map_err(|e| {
                // audited at startup; reaching this means the template or
                // engine changed underneath us
                ValidationError::InvalidPayload(format!("command rendering failed: {e}"))
            })
    }
}

impl Application {
    /// Validate the payload against the schema and narrow it to the
    /// scalar parameters the template engine consumes.
    pub fn validated_params(
        &self,
        payload: &Value,
    ) -> Result<BTreeMap<String, Value>, ValidationError> {
        validate_params(self.schema.as_ref(), &self.properties, payload)
    }
}

impl InteractiveApplication {
    pub fn validated_params(
        &self,
        payload: &Value,
    ) -> Result<BTreeMap<String, Value>, ValidationError> {
        validate_params(self.schema.as_ref(), &self.properties, payload)
    }

    /// Property names whose schema declares base64 content, to be staged
    /// to temporary files before rendering.
    pub fn base64_properties(&self) -> Vec<String> {
        let Some(schema) = self
            .config
            .input_schema
            .as_ref()
            .and_then(|s| s.as_object())
        else {
            return Vec::new();
        };
        let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
            return Vec::new();
        };
        properties
            .iter()
            .filter(|(_, prop)| {
                prop.get("contentEncoding").and_then(|e| e.as_str()) == Some("base64")
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Compile and vet an input schema: a 2020-12 object whose top-level
/// properties are all scalars that coerce to strings.
fn compile_schema(
    application: &str,
    input_schema: Option<&Value>,
) -> Result<(Option<JSONSchema>, Vec<String>), ConfigError> {
    let Some(schema_value) = input_schema else {
        return Ok((None, Vec::new()));
    };
    let object = schema_value.as_object().ok_or_else(|| ConfigError::InvalidSchema {
        application: application.to_string(),
        reason: "schema must be a JSON object".to_string(),
    })?;
    if object.get("type").and_then(|t| t.as_str()) != Some("object") {
        return Err(ConfigError::InvalidSchema {
            application: application.to_string(),
            reason: "schema type must be object".to_string(),
        });
    }
    let mut properties = Vec::new();
    if let Some(props) = object.get("properties").and_then(|p| p.as_object()) {
        for (name, prop) in props {
            let prop_type = prop.get("type").and_then(|t| t.as_str()).unwrap_or("");
            match prop_type {
                "string" | "number" | "integer" | "boolean" => {}
                other => {
                    return Err(ConfigError::InvalidSchema {
                        application: application.to_string(),
                        reason: format!(
                            "property {name} has type {other:?}, only scalar types are supported"
                        ),
                    });
                }
            }
            properties.push(name.clone());
        }
    }
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft202012)
        .compile(schema_value)
        .map_err(|e| ConfigError::InvalidSchema {
            application: application.to_string(),
            reason: e.to_string(),
        })?;
    Ok((Some(compiled), properties))
}

fn validate_params(
    schema: Option<&JSONSchema>,
    properties: &[String],
    payload: &Value,
) -> Result<BTreeMap<String, Value>, ValidationError> {
    if let Some(schema) = schema {
        if let Err(errors) = schema.validate(payload) {
            let message = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ValidationError::InvalidPayload(message));
        }
    }

    // every schema property gets a value so rendering is total; absent
    // optional properties become empty strings, which read as false in
    // template conditionals. Scalars keep their types so conditionals
    // see real booleans; the q filter stringifies them on substitution.
    let mut params: BTreeMap<String, Value> = properties
        .iter()
        .map(|p| (p.clone(), Value::String(String::new())))
        .collect();
    if let Some(object) = payload.as_object() {
        for (key, value) in object {
            if !params.contains_key(key) {
                continue;
            }
            match value {
                Value::String(s) => {
                    if s.contains('\0') {
                        return Err(ValidationError::InvalidPayload(format!(
                            "property {key} contains a NUL byte"
                        )));
                    }
                    params.insert(key.clone(), value.clone());
                }
                Value::Number(_) | Value::Bool(_) => {
                    params.insert(key.clone(), value.clone());
                }
                Value::Null => {}
                other => {
                    return Err(ValidationError::InvalidPayload(format!(
                        "property {key} has non-scalar value {other}"
                    )));
                }
            }
        }
    }
    Ok(params)
}
