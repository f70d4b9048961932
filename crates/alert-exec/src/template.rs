//! Command rendering using Tera
//!
//! Operators write command and argument templates in Go template style
//! (`{{ .Status }}`, `{{ .CommonLabels.severity }}`). Those are converted to
//! Tera syntax and rendered against the fields of the Alertmanager payload.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

use crate::server::{AlertManagerAlert, AlertManagerPayload};

const DELIMITER: &str = "{{";

/// Rendered in place of a label or annotation the payload does not carry.
pub const NO_VALUE: &str = "<no value>";

lazy_static! {
    static ref EXPRESSION: Regex = Regex::new(r"\{\{(.*?)\}\}").unwrap();
    static ref FIELD_REF: Regex = Regex::new(r"(^|[^\w\])])\.([A-Za-z_])").unwrap();
    static ref MAP_LOOKUP: Regex = Regex::new(
        r"^(\s*)((?:Alerts\.\d+\.(?:Labels|Annotations)|GroupLabels|CommonLabels|CommonAnnotations)\.\w+)(\s*)(.*)$"
    )
    .unwrap();
    static ref DEFAULT_DOUBLE: Regex =
        Regex::new(r#"\{\{([^}]+)\|\s*default\s+"([^"]+)"\s*\}\}"#).unwrap();
    static ref DEFAULT_SINGLE: Regex =
        Regex::new(r#"\{\{([^}]+)\|\s*default\s+'([^']+)'\s*\}\}"#).unwrap();
    static ref DEFAULT_BARE: Regex =
        Regex::new(r#"\{\{([^}]+)\|\s*default\s+([^}\s]+)\s*\}\}"#).unwrap();
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("building template context: {}", describe(.0))]
    Context(#[source] tera::Error),
    #[error("rendering command template: {}", describe(.source))]
    Command {
        #[source]
        source: tera::Error,
    },
    #[error("rendering arg template {index} {template:?}: {}", describe(.source))]
    Arg {
        index: usize,
        template: String,
        #[source]
        source: tera::Error,
    },
}

/// Tera keeps the useful part of a failure in the source chain.
fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub command: String,
    pub args: Vec<String>,
}

/// Data exposed to templates, keyed the way operators reference payload fields.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateContext<'a> {
    version: &'a str,
    group_key: &'a str,
    truncated_alerts: i64,
    status: &'a str,
    receiver: &'a str,
    group_labels: &'a HashMap<String, String>,
    common_labels: &'a HashMap<String, String>,
    common_annotations: &'a HashMap<String, String>,
    #[serde(rename = "ExternalURL")]
    external_url: &'a str,
    alerts: Vec<AlertContext<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AlertContext<'a> {
    status: &'a str,
    labels: &'a HashMap<String, String>,
    annotations: &'a HashMap<String, String>,
    starts_at: String,
    ends_at: String,
    #[serde(rename = "GeneratorURL")]
    generator_url: &'a str,
    fingerprint: &'a str,
}

impl<'a> From<&'a AlertManagerAlert> for AlertContext<'a> {
    fn from(alert: &'a AlertManagerAlert) -> Self {
        Self {
            status: &alert.status,
            labels: &alert.labels,
            annotations: &alert.annotations,
            starts_at: alert.starts_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ends_at: alert.ends_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            generator_url: &alert.generator_url,
            fingerprint: &alert.fingerprint,
        }
    }
}

impl<'a> From<&'a AlertManagerPayload> for TemplateContext<'a> {
    fn from(payload: &'a AlertManagerPayload) -> Self {
        Self {
            version: &payload.version,
            group_key: &payload.group_key,
            truncated_alerts: payload.truncated_alerts,
            status: &payload.status,
            receiver: &payload.receiver,
            group_labels: &payload.group_labels,
            common_labels: &payload.common_labels,
            common_annotations: &payload.common_annotations,
            external_url: &payload.external_url,
            alerts: payload.alerts.iter().map(AlertContext::from).collect(),
        }
    }
}

/// Convert Go template syntax to Tera syntax
///
/// Handles common patterns:
/// - {{ .path.to.value }} -> {{ path.to.value }}
/// - {{ .value | default "default" }} -> {{ value | default(value="default") }}
/// - {{ .CommonLabels.team }} -> {{ CommonLabels.team | default(value="<no value>") }}
///
/// Text outside `{{ }}` that Tera would read as a tag or comment is wrapped in
/// a raw block so it renders verbatim.
pub fn convert_go_to_tera(template: &str) -> String {
    let mut converted = String::with_capacity(template.len());
    let mut last = 0;
    for caps in EXPRESSION.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        converted.push_str(&escape_literal(&template[last..whole.start()]));
        converted.push_str("{{");
        converted.push_str(&convert_expression(&caps[1]));
        converted.push_str("}}");
        last = whole.end();
    }
    converted.push_str(&escape_literal(&template[last..]));

    let converted = DEFAULT_DOUBLE.replace_all(&converted, "{{$1| default(value=\"$2\")}}");
    let converted = DEFAULT_SINGLE.replace_all(&converted, "{{$1| default(value=\"$2\")}}");
    let converted = DEFAULT_BARE.replace_all(&converted, "{{$1| default(value=\"$2\")}}");

    converted.into_owned()
}

fn convert_expression(expression: &str) -> String {
    let expression = FIELD_REF.replace_all(expression, "$1$2");

    // Missing map keys render as a placeholder; `default` only applies as the first filter
    let Some(caps) = MAP_LOOKUP.captures(&expression) else {
        return expression.into_owned();
    };
    let rest = &caps[4];
    if rest.is_empty() {
        format!("{}{} | default(value=\"{NO_VALUE}\"){}", &caps[1], &caps[2], &caps[3])
    } else if rest.starts_with('|') && !rest.contains("default") {
        format!("{}{} | default(value=\"{NO_VALUE}\") {rest}", &caps[1], &caps[2])
    } else {
        expression.to_string()
    }
}

fn escape_literal(text: &str) -> String {
    if text.contains(DELIMITER) || !(text.contains("{%") || text.contains("{#")) {
        return text.to_string();
    }
    format!("{{% raw %}}{text}{{% endraw %}}")
}

pub fn contains_template(raw: &str) -> bool {
    raw.contains(DELIMITER)
}

/// Render the command and its arguments for one payload.
///
/// Strings without a template delimiter are returned verbatim. Arguments are
/// rendered in order and the first failure stops rendering.
pub fn render_command(
    command_template: &str,
    arg_templates: &[String],
    payload: &AlertManagerPayload,
) -> Result<RenderedCommand, RenderError> {
    let context =
        Context::from_serialize(TemplateContext::from(payload)).map_err(RenderError::Context)?;

    let command = render_maybe_template("command", command_template, &context)
        .map_err(|source| RenderError::Command { source })?;

    let mut args = Vec::with_capacity(arg_templates.len());
    for (index, raw) in arg_templates.iter().enumerate() {
        let arg = render_maybe_template("arg", raw, &context).map_err(|source| RenderError::Arg {
            index,
            template: raw.clone(),
            source,
        })?;
        args.push(arg);
    }

    Ok(RenderedCommand { command, args })
}

fn render_maybe_template(name: &str, raw: &str, context: &Context) -> tera::Result<String> {
    if !contains_template(raw) {
        return Ok(raw.to_string());
    }

    let mut tera = Tera::default();
    tera.autoescape_on(vec![]);
    tera.add_raw_template(name, &convert_go_to_tera(raw))?;
    tera.render(name, context)
}
