//! Structured prompt blocks and their rendering.
//!
//! Rendering happens entirely at compile time, in a locked section order
//! (goal, constraints, procedure, output required, verify), so the rendered
//! text participates in the workflow hash and the interpreter never sees
//! unresolved refs or function markers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Registry of canonical prompt snippets addressable from prompt blocks.
#[derive(Debug, Clone, Default)]
pub struct SnippetRegistry {
    snippets: BTreeMap<String, String>,
}

impl SnippetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.snippets.insert(name.into(), text.into());
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.snippets.get(name).map(String::as_str)
    }
}

/// One fragment of a prompt section: literal text or a snippet reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPart {
    Ref {
        #[serde(rename = "ref")]
        name: String,
    },
    Text {
        text: String,
    },
}

/// Structured prompt sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptBlocks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goal: Vec<PromptPart>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<PromptPart>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub procedure: Vec<PromptPart>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_required: Vec<PromptPart>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify: Vec<PromptPart>,
}

/// Failure surface for prompt rendering, reported per step by the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptRenderIssue {
    UnknownSnippet { name: String },
    UnknownFunction { name: String },
}

/// Render blocks into a single prompt string in the locked section order.
pub fn render_blocks(
    blocks: &PromptBlocks,
    snippets: &SnippetRegistry,
) -> Result<String, PromptRenderIssue> {
    let sections: [(&str, &[PromptPart]); 5] = [
        ("Goal", &blocks.goal),
        ("Constraints", &blocks.constraints),
        ("Procedure", &blocks.procedure),
        ("Output required", &blocks.output_required),
        ("Verify", &blocks.verify),
    ];

    let mut rendered = Vec::new();
    for (heading, parts) in sections {
        if parts.is_empty() {
            continue;
        }
        let mut body = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                PromptPart::Text { text } => body.push(text.as_str()),
                PromptPart::Ref { name } => {
                    let text = snippets
                        .resolve(name)
                        .ok_or_else(|| PromptRenderIssue::UnknownSnippet { name: name.clone() })?;
                    body.push(text);
                }
            }
        }
        rendered.push(format!("## {heading}\n{}", body.join("\n")));
    }
    Ok(rendered.join("\n\n"))
}

const FN_OPEN: &str = "{{fn:";
const FN_CLOSE: &str = "}}";
const FN_EXPANSION_DEPTH: usize = 8;

/// Expand `{{fn:name}}` markers against author-declared functions.
pub fn expand_functions(
    prompt: &str,
    functions: &BTreeMap<String, String>,
) -> Result<String, PromptRenderIssue> {
    let mut current = prompt.to_string();
    for _ in 0..FN_EXPANSION_DEPTH {
        if !current.contains(FN_OPEN) {
            return Ok(current);
        }
        let mut next = String::with_capacity(current.len());
        let mut rest = current.as_str();
        while let Some(open) = rest.find(FN_OPEN) {
            next.push_str(&rest[..open]);
            let after = &rest[open + FN_OPEN.len()..];
            let Some(close) = after.find(FN_CLOSE) else {
                // No closing marker: keep the literal text.
                next.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let name = &after[..close];
            let body = functions
                .get(name)
                .ok_or_else(|| PromptRenderIssue::UnknownFunction {
                    name: name.to_string(),
                })?;
            next.push_str(body);
            rest = &after[close + FN_CLOSE.len()..];
        }
        next.push_str(rest);
        current = next;
    }
    // Depth exhausted with markers remaining: treat as an authoring cycle.
    match extract_first_marker(&current) {
        Some(name) => Err(PromptRenderIssue::UnknownFunction { name }),
        None => Ok(current),
    }
}

fn extract_first_marker(text: &str) -> Option<String> {
    let open = text.find(FN_OPEN)?;
    let after = &text[open + FN_OPEN.len()..];
    let close = after.find(FN_CLOSE)?;
    Some(after[..close].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blocks(json: serde_json::Value) -> PromptBlocks {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_sections_render_in_locked_order() {
        let rendered = render_blocks(
            &blocks(json!({
                "verify": [{"text": "Run the tests."}],
                "goal": [{"text": "Fix the bug."}],
                "procedure": [{"text": "Bisect first."}],
            })),
            &SnippetRegistry::new(),
        )
        .unwrap();

        let goal = rendered.find("## Goal").unwrap();
        let procedure = rendered.find("## Procedure").unwrap();
        let verify = rendered.find("## Verify").unwrap();
        assert!(goal < procedure && procedure < verify);
        assert!(!rendered.contains("## Constraints"));
    }

    #[test]
    fn test_refs_resolve_against_registry() {
        let mut snippets = SnippetRegistry::new();
        snippets.register("no-new-deps", "Do not add dependencies.");

        let rendered = render_blocks(
            &blocks(json!({
                "constraints": [{"ref": "no-new-deps"}, {"text": "Keep the diff small."}],
            })),
            &snippets,
        )
        .unwrap();
        assert!(rendered.contains("Do not add dependencies.\nKeep the diff small."));
    }

    #[test]
    fn test_unknown_ref_fails() {
        let err = render_blocks(
            &blocks(json!({"goal": [{"ref": "missing"}]})),
            &SnippetRegistry::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PromptRenderIssue::UnknownSnippet {
                name: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_output_required_heading() {
        let rendered = render_blocks(
            &blocks(json!({"outputRequired": [{"text": "A JSON object."}]})),
            &SnippetRegistry::new(),
        )
        .unwrap();
        assert!(rendered.starts_with("## Output required\n"));
    }

    #[test]
    fn test_function_expansion() {
        let mut functions = BTreeMap::new();
        functions.insert("greeting".to_string(), "Start politely.".to_string());
        let expanded = expand_functions("{{fn:greeting}} Then work.", &functions).unwrap();
        assert_eq!(expanded, "Start politely. Then work.");
    }

    #[test]
    fn test_nested_function_expansion() {
        let mut functions = BTreeMap::new();
        functions.insert("outer".to_string(), "A {{fn:inner}} B".to_string());
        functions.insert("inner".to_string(), "X".to_string());
        let expanded = expand_functions("{{fn:outer}}", &functions).unwrap();
        assert_eq!(expanded, "A X B");
    }

    #[test]
    fn test_unknown_function_fails() {
        let err = expand_functions("{{fn:nope}}", &BTreeMap::new()).unwrap_err();
        assert_eq!(
            err,
            PromptRenderIssue::UnknownFunction {
                name: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_cyclic_functions_fail_instead_of_spinning() {
        let mut functions = BTreeMap::new();
        functions.insert("a".to_string(), "{{fn:b}}".to_string());
        functions.insert("b".to_string(), "{{fn:a}}".to_string());
        assert!(expand_functions("{{fn:a}}", &functions).is_err());
    }

    #[test]
    fn test_unclosed_marker_is_literal() {
        let expanded = expand_functions("{{fn:open", &BTreeMap::new()).unwrap();
        assert_eq!(expanded, "{{fn:open");
    }

    #[test]
    fn test_prompt_part_untagged_forms() {
        let text: PromptPart = serde_json::from_value(json!({"text": "hi"})).unwrap();
        assert_eq!(text, PromptPart::Text { text: "hi".to_string() });
        let reference: PromptPart = serde_json::from_value(json!({"ref": "std"})).unwrap();
        assert_eq!(reference, PromptPart::Ref { name: "std".to_string() });
    }
}
