//! Command Template Renderer (C3): loads embedded templates, strips
//! YAML front-matter, substitutes `{{.Field}}` placeholders, and
//! sanitizes the result for safe argv passing (§4.3).

use autospec_core::context::Context;
use rust_embed::RustEmbed;
use thiserror::Error;

#[derive(RustEmbed)]
#[folder = "../../templates"]
struct Templates;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no template registered for command '{0}'")]
    NotFound(String),
    #[error("template for '{command}' is not valid UTF-8")]
    NotUtf8 { command: String },
    #[error("unresolved placeholder '{{{{.{field}}}}}' in template for '{command}'")]
    UnresolvedPlaceholder { command: String, field: String },
}

const MAX_RENDERED_BYTES: usize = 100 * 1024;

/// Strip a leading `---\n...\n---\n` front-matter block, if present.
fn strip_front_matter(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("---\n") else {
        return content;
    };
    if let Some(end) = rest.find("\n---\n") {
        &rest[end + 5..]
    } else {
        content
    }
}

/// Remove NUL bytes, normalize CR/CRLF to LF, strip a leading BOM, and
/// prefix a newline if the result would otherwise start with `-`
/// (which a downstream argv parser could mistake for a flag).
pub fn sanitize(input: &str) -> String {
    let no_nul: String = input.chars().filter(|&c| c != '\0').collect();
    let normalized = no_nul.replace("\r\n", "\n").replace('\r', "\n");
    let without_bom = normalized.strip_prefix('\u{feff}').unwrap_or(&normalized);
    if without_bom.starts_with('-') {
        format!("\n{without_bom}")
    } else {
        without_bom.to_string()
    }
}

fn field_value(ctx: &Context, field: &str) -> Option<String> {
    Some(match field {
        "FeatureID" => ctx.feature_id.clone(),
        "FeatureDir" => ctx.feature_dir.display().to_string(),
        "RepoRoot" => ctx.repo_root.display().to_string(),
        "FeatureSpec" => ctx.feature_spec.display().to_string(),
        "ImplPlan" => ctx.impl_plan.display().to_string(),
        "TasksFile" => ctx.tasks_file.display().to_string(),
        "ChecklistFile" => ctx.checklist_file.display().to_string(),
        "AnalysisFile" => ctx.analysis_file.display().to_string(),
        "AutospecVersion" => ctx.autospec_version.clone(),
        "CreatedDate" => ctx.created_date.clone(),
        _ => return None,
    })
}

/// Substitute every `{{.Field}}` occurrence with its context value.
fn substitute(template: &str, ctx: &Context, command: &str) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{.") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            // Unterminated placeholder: leave the rest verbatim and let the
            // unresolved-token check below catch it.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let field = after[..end].trim();
        match field_value(ctx, field) {
            Some(value) => out.push_str(&value),
            None => {
                return Err(RenderError::UnresolvedPlaceholder {
                    command: command.to_string(),
                    field: field.to_string(),
                })
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Render the template for `command` (a bare stage word, e.g. `plan`,
/// matching the embedded `autospec.plan.md` asset) against `ctx`.
/// Rendering is purely functional: the same `(command, ctx)` always
/// produces byte-identical output.
pub fn render(command: &str, ctx: &Context) -> Result<String, RenderError> {
    let file_name = format!("autospec.{command}.md");
    let asset = Templates::get(&file_name).ok_or_else(|| RenderError::NotFound(command.to_string()))?;
    let raw = std::str::from_utf8(asset.data.as_ref())
        .map_err(|_| RenderError::NotUtf8 { command: command.to_string() })?;

    let body = strip_front_matter(raw);
    let substituted = substitute(body, ctx, command)?;

    if substituted.contains("{{.") {
        // Should be unreachable given the check above, but guard anyway:
        // every `{{.` must have been resolved or already errored.
        return Err(RenderError::UnresolvedPlaceholder {
            command: command.to_string(),
            field: "<unknown>".to_string(),
        });
    }

    let sanitized = sanitize(&substituted);
    if sanitized.len() > MAX_RENDERED_BYTES {
        tracing::warn!(command, bytes = sanitized.len(), "rendered prompt exceeds 100 KiB");
    }
    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_ctx() -> Context {
        Context {
            is_git_repo: true,
            repo_root: PathBuf::from("/repo"),
            feature_id: "007-user-auth".to_string(),
            feature_dir: PathBuf::from("/repo/specs/007-user-auth"),
            feature_spec: PathBuf::from("/repo/specs/007-user-auth/spec.yaml"),
            impl_plan: PathBuf::from("/repo/specs/007-user-auth/plan.yaml"),
            tasks_file: PathBuf::from("/repo/specs/007-user-auth/tasks.yaml"),
            checklist_file: PathBuf::from("/repo/specs/007-user-auth/checklist.yaml"),
            analysis_file: PathBuf::from("/repo/specs/007-user-auth/analysis.yaml"),
            autospec_version: "0.2.0".to_string(),
            created_date: "2026-08-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn front_matter_is_stripped() {
        let template = "---\ndescription: x\n---\n## Body";
        assert_eq!(strip_front_matter(template), "## Body");
    }

    #[test]
    fn render_is_deterministic_and_substitutes_fields() {
        let ctx = test_ctx();
        let a = render("specify", &ctx).unwrap();
        let b = render("specify", &ctx).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("007-user-auth"));
        assert!(!a.contains("{{."));
        assert!(!a.contains("---\n"));
    }

    #[test]
    fn unknown_command_errors() {
        let ctx = test_ctx();
        assert!(matches!(render("nonexistent", &ctx), Err(RenderError::NotFound(_))));
    }

    #[test]
    fn sanitize_strips_nul_and_normalizes_newlines() {
        let input = "a\0b\r\nc\rd";
        assert_eq!(sanitize(input), "ab\nc\nd");
    }

    #[test]
    fn sanitize_prefixes_newline_when_leading_dash() {
        assert_eq!(sanitize("-oops"), "\n-oops");
    }

    #[test]
    fn sanitize_strips_leading_bom() {
        assert_eq!(sanitize("\u{feff}hello"), "hello");
    }
}
