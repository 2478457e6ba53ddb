//! Input resolution and transforms.
//!
//! Resolves each step's input text from the request or upstream results,
//! then applies the step's named transform. A missing upstream result is a
//! hard failure for the step (not a skip): this is how failures cascade
//! through dependents when `failFast` is off. An unrecognized transform
//! name, or arguments that don't match a transform's shape, is a step
//! failure as well, never a silent passthrough.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::FlowError;
use crate::flow::{InputSource, StepDefinition};
use crate::runner::{FlowRequest, StepResult};

/// Caller-supplied transform: `(resolved_text, transform_args) -> text`.
pub type CustomTransform =
    Arc<dyn Fn(&str, Option<&JsonValue>) -> Result<String, String> + Send + Sync>;

/// Named-transform registry and input resolver.
#[derive(Default, Clone)]
pub struct TransformPipeline {
    custom: HashMap<String, CustomTransform>,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a caller-supplied transform under a name. Lookup is
    /// insensitive to case, dashes and underscores, like the built-ins.
    pub fn register(&mut self, name: impl AsRef<str>, transform: CustomTransform) {
        self.custom.insert(normalize(name.as_ref()), transform);
    }

    /// Resolves a step's input text and applies its transform.
    ///
    /// `feedback` carries any quality-gate feedback recorded for this step
    /// in the current run (consumed by the `feedback` input source).
    pub fn resolve_input(
        &self,
        step: &StepDefinition,
        request: &FlowRequest,
        results: &HashMap<String, StepResult>,
        feedback: &[String],
    ) -> Result<String, FlowError> {
        let parts = self.gather(step, request, results, feedback)?;
        let transform = step.input.transform.as_deref().unwrap_or("passthrough");

        let text = if parts.len() == 1 {
            parts[0].1.clone()
        } else {
            parts
                .iter()
                .map(|(_, content)| content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        self.apply(
            &step.id,
            transform,
            step.input.transform_args.as_ref(),
            &text,
            &parts,
            request,
        )
    }

    /// Gathers `(source_id, content)` pairs according to `input.source`.
    fn gather(
        &self,
        step: &StepDefinition,
        request: &FlowRequest,
        results: &HashMap<String, StepResult>,
        feedback: &[String],
    ) -> Result<Vec<(String, String)>, FlowError> {
        match step.input.source {
            InputSource::Request => Ok(vec![("request".to_string(), request.user_prompt.clone())]),
            InputSource::Feedback => {
                let mut text = request.user_prompt.clone();
                if !feedback.is_empty() {
                    text.push_str("\n\nFeedback from previous attempt:\n");
                    for line in feedback {
                        text.push_str("- ");
                        text.push_str(line);
                        text.push('\n');
                    }
                }
                Ok(vec![("feedback".to_string(), text)])
            }
            InputSource::Step => {
                let source_id = match (&step.input.step_id, step.depends_on.as_slice()) {
                    (Some(id), _) => id.clone(),
                    (None, [only]) => only.clone(),
                    _ => {
                        return Err(FlowError::transform(
                            &step.id,
                            "input source 'step' requires a stepId",
                        ));
                    }
                };
                let content = upstream_content(&step.id, &source_id, results)?;
                Ok(vec![(source_id, content)])
            }
            InputSource::Aggregate => {
                let from: Vec<String> = if step.input.from.is_empty() {
                    step.depends_on.clone()
                } else {
                    step.input.from.clone()
                };
                if from.is_empty() {
                    return Err(FlowError::transform(
                        &step.id,
                        "input source 'aggregate' requires a 'from' list",
                    ));
                }
                from.into_iter()
                    .map(|id| {
                        let content = upstream_content(&step.id, &id, results)?;
                        Ok((id, content))
                    })
                    .collect()
            }
        }
    }

    fn apply(
        &self,
        step_id: &str,
        name: &str,
        args: Option<&JsonValue>,
        text: &str,
        parts: &[(String, String)],
        request: &FlowRequest,
    ) -> Result<String, FlowError> {
        match normalize(name).as_str() {
            "passthrough" => Ok(text.to_string()),
            "mergeascontext" => merge_as_context(step_id, args, parts),
            "extractsection" => extract_section(step_id, args, text),
            "appendtorequest" => Ok(format!("{}\n\n{}", request.user_prompt, text)),
            "jsonextract" => json_extract(step_id, args, text),
            "templatefill" => template_fill(step_id, args, text, request),
            other => match self.custom.get(other) {
                Some(f) => f(text, args).map_err(|e| FlowError::transform(step_id, e)),
                None => Err(FlowError::transform(
                    step_id,
                    format!("unknown transform '{name}'"),
                )),
            },
        }
    }
}

fn upstream_content(
    for_step: &str,
    source_id: &str,
    results: &HashMap<String, StepResult>,
) -> Result<String, FlowError> {
    results
        .get(source_id)
        .and_then(|r| r.result.as_ref())
        .map(|r| r.content.clone())
        .ok_or_else(|| FlowError::MissingUpstreamResult {
            for_step: for_step.to_string(),
            step_id: source_id.to_string(),
        })
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Renders section bodies under `## {title}` headers. Sections come from
/// `transformArgs.sections` when given, otherwise from the aggregated
/// upstream parts keyed by step id.
fn merge_as_context(
    step_id: &str,
    args: Option<&JsonValue>,
    parts: &[(String, String)],
) -> Result<String, FlowError> {
    let sections: Vec<(String, String)> = match args.and_then(|a| a.get("sections")) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| {
                let title = item
                    .get("title")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| {
                        FlowError::transform(step_id, "mergeAsContext sections need a 'title'")
                    })?;
                let content = item
                    .get("content")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| {
                        FlowError::transform(step_id, "mergeAsContext sections need a 'content'")
                    })?;
                Ok((title.to_string(), content.to_string()))
            })
            .collect::<Result<_, FlowError>>()?,
        Some(_) => {
            return Err(FlowError::transform(
                step_id,
                "mergeAsContext 'sections' must be an array",
            ));
        }
        None => parts.to_vec(),
    };

    Ok(sections
        .iter()
        .map(|(title, content)| format!("## {title}\n\n{content}"))
        .collect::<Vec<_>>()
        .join("\n\n"))
}

/// Pulls the body of the named `#`-heading section out of markdown-shaped
/// text. The section ends at the next heading of the same or higher level.
fn extract_section(step_id: &str, args: Option<&JsonValue>, text: &str) -> Result<String, FlowError> {
    let section = args
        .and_then(|a| a.get("section"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| FlowError::transform(step_id, "extractSection requires a 'section' name"))?;

    let mut body: Vec<&str> = Vec::new();
    let mut level = 0usize;
    let mut in_section = false;

    for line in text.lines() {
        let hashes = line.chars().take_while(|c| *c == '#').count();
        let is_heading = hashes > 0 && line.chars().nth(hashes) == Some(' ');
        if is_heading {
            let title = line[hashes..].trim();
            if in_section && hashes <= level {
                break;
            }
            if !in_section && title.eq_ignore_ascii_case(section) {
                in_section = true;
                level = hashes;
                continue;
            }
        }
        if in_section {
            body.push(line);
        }
    }

    if !in_section {
        return Err(FlowError::transform(
            step_id,
            format!("section '{section}' not found"),
        ));
    }
    Ok(body.join("\n").trim().to_string())
}

/// Walks a dot-separated field path through JSON-shaped input. String
/// leaves come back unwrapped; anything else is serialized back to text.
fn json_extract(step_id: &str, args: Option<&JsonValue>, text: &str) -> Result<String, FlowError> {
    let path = args
        .and_then(|a| a.get("path"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| FlowError::transform(step_id, "jsonExtract requires a 'path'"))?;

    let parsed: JsonValue = serde_json::from_str(text)
        .map_err(|e| FlowError::transform(step_id, format!("input is not JSON: {e}")))?;

    let mut current = &parsed;
    for key in path.split('.') {
        current = current.get(key).ok_or_else(|| {
            FlowError::transform(step_id, format!("path '{path}' not found at '{key}'"))
        })?;
    }

    match current {
        JsonValue::String(s) => Ok(s.clone()),
        other => serde_json::to_string(other)
            .map_err(|e| FlowError::transform(step_id, e.to_string())),
    }
}

/// Substitutes named placeholders from `transformArgs.context`, with the
/// resolved input bound as `input` and the original prompt as `request`.
fn template_fill(
    step_id: &str,
    args: Option<&JsonValue>,
    text: &str,
    request: &FlowRequest,
) -> Result<String, FlowError> {
    let mut context = match args.and_then(|a| a.get("context")) {
        Some(JsonValue::Object(map)) => map.clone(),
        Some(_) => {
            return Err(FlowError::transform(
                step_id,
                "templateFill 'context' must be an object",
            ));
        }
        None => serde_json::Map::new(),
    };
    context.insert("input".to_string(), JsonValue::String(text.to_string()));
    context.insert(
        "request".to_string(),
        JsonValue::String(request.user_prompt.clone()),
    );

    let env = minijinja::Environment::new();
    let template = env
        .template_from_str(text)
        .map_err(|e| FlowError::transform(step_id, format!("template error: {e}")))?;
    template
        .render(JsonValue::Object(context))
        .map_err(|e| FlowError::transform(step_id, format!("template render error: {e}")))
}
