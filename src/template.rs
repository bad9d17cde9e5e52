use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use log::debug;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{Result, TychoError};

/// Renders parameterized manifest templates into YAML documents.
///
/// Templates are looked up by name: user-supplied directories are searched
/// first (the first directory containing the name wins), then the built-in
/// set registered at construction. A template may emit a single document or
/// a `---`-separated stream; `render` always returns a sequence.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
    search_paths: Vec<PathBuf>,
}

impl TemplateEngine {
    /// Build an engine over the given search paths and built-in templates.
    pub fn new(search_paths: Vec<PathBuf>, builtins: &[(&str, &str)]) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("now", Box::new(now_helper));
        for (name, body) in builtins {
            handlebars
                .register_template_string(name, body)
                .map_err(|e| TychoError::Template {
                    template: name.to_string(),
                    detail: e.to_string(),
                })?;
        }
        Ok(Self {
            handlebars,
            search_paths,
        })
    }

    /// Render a template into one or more YAML documents.
    pub fn render<C: Serialize>(&self, template_id: &str, context: &C) -> Result<Vec<Value>> {
        let text = if let Some(path) = self.locate(template_id) {
            debug!("rendering user template {}", path.display());
            let body = std::fs::read_to_string(&path).map_err(|e| TychoError::Template {
                template: template_id.to_string(),
                detail: format!("{}: {e}", path.display()),
            })?;
            self.handlebars
                .render_template(&body, context)
                .map_err(|e| TychoError::Template {
                    template: template_id.to_string(),
                    detail: e.to_string(),
                })?
        } else if self.handlebars.get_template(template_id).is_some() {
            self.handlebars
                .render(template_id, context)
                .map_err(|e| TychoError::Template {
                    template: template_id.to_string(),
                    detail: e.to_string(),
                })?
        } else {
            return Err(TychoError::Template {
                template: template_id.to_string(),
                detail: "not found in search paths or built-ins".to_string(),
            });
        };

        split_documents(template_id, &text)
    }

    /// First search-path file matching the template name, if any.
    fn locate(&self, template_id: &str) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(template_id))
            .find(|candidate| candidate.is_file())
    }

    /// Substitute `$VAR` / `${VAR}` occurrences from Bash-style `KEY=VALUE`
    /// lines. Keys missing from the environment are left as-is.
    pub fn apply_environment(env_text: &str, template_text: &str) -> String {
        let env: HashMap<String, String> = Self::parse_env(env_text).into_iter().collect();
        Self::safe_substitute(template_text, &env)
    }

    /// Parse Bash-style `KEY=VALUE` lines, skipping blanks and comments.
    /// Order of appearance is preserved.
    pub fn parse_env(env_text: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for line in env_text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                pairs.push((key.trim().to_string(), value.to_string()));
            }
        }
        pairs
    }

    /// `$VAR` / `${VAR}` substitution that never raises: names missing from
    /// the map survive untouched.
    pub fn safe_substitute(text: &str, variables: &HashMap<String, String>) -> String {
        let pattern = Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("substitution pattern");
        pattern
            .replace_all(text, |caps: &Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match variables.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

/// Split rendered output on document delimiters, dropping empty documents.
fn split_documents(template_id: &str, text: &str) -> Result<Vec<Value>> {
    use serde::Deserialize;
    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(deserializer).map_err(|e| TychoError::Template {
            template: template_id.to_string(),
            detail: format!("output is not valid YAML: {e}"),
        })?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Handlebars helper emitting the current UTC timestamp.
fn now_helper(
    _h: &Helper,
    _r: &Handlebars,
    _ctx: &Context,
    _rc: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&chrono::Utc::now().to_rfc3339())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn engine(paths: Vec<PathBuf>) -> TemplateEngine {
        TemplateEngine::new(
            paths,
            &[
                ("single.yaml", "name: {{name}}\n"),
                (
                    "multi.yaml",
                    "{{#each items}}---\nitem: {{this}}\n{{/each}}",
                ),
                ("stamped.yaml", "generated: \"{{now}}\"\n"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_render_single_document() {
        let engine = engine(vec![]);
        let docs = engine
            .render("single.yaml", &json!({"name": "jupyter"}))
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["name"].as_str(), Some("jupyter"));
    }

    #[test]
    fn test_render_multi_document_stream() {
        let engine = engine(vec![]);
        let docs = engine
            .render("multi.yaml", &json!({"items": ["a", "b", "c"]}))
            .unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[2]["item"].as_str(), Some("c"));
    }

    #[test]
    fn test_now_helper_emits_timestamp() {
        let engine = engine(vec![]);
        let docs = engine.render("stamped.yaml", &json!({})).unwrap();
        let stamp = docs[0]["generated"].as_str().unwrap();
        assert!(stamp.contains('T'));
    }

    #[test]
    fn test_missing_template_is_an_error() {
        let engine = engine(vec![]);
        let err = engine.render("absent.yaml", &json!({})).unwrap_err();
        assert!(matches!(err, TychoError::Template { .. }));
    }

    #[test]
    fn test_user_template_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let mut file = std::fs::File::create(dir.path().join("single.yaml")).unwrap();
        writeln!(file, "test: arbitrary_value_for_testing").unwrap();

        let engine = engine(vec![dir.path().to_path_buf()]);
        let docs = engine.render("single.yaml", &json!({"name": "x"})).unwrap();
        assert_eq!(docs[0]["test"].as_str(), Some("arbitrary_value_for_testing"));
    }

    #[test]
    fn test_first_search_path_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(first.path().join("single.yaml"), "from: first\n").unwrap();
        std::fs::write(second.path().join("single.yaml"), "from: second\n").unwrap();

        let engine = engine(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
        let docs = engine.render("single.yaml", &json!({})).unwrap();
        assert_eq!(docs[0]["from"].as_str(), Some("first"));
    }

    #[test]
    fn test_apply_environment_substitutes_known_keys() {
        let env = "HOST=0.0.0.0\n# a comment\nPORT=8888\n";
        let text = "listen: $HOST:${PORT} token: $UNSET";
        let result = TemplateEngine::apply_environment(env, text);
        assert_eq!(result, "listen: 0.0.0.0:8888 token: $UNSET");
    }

    #[test]
    fn test_parse_env_preserves_order_and_skips_noise() {
        let env = "\nA=1\n# skip\nB=\"two\"\nnot a pair\nC='3'\n";
        let pairs = TemplateEngine::parse_env(env);
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two".to_string()),
                ("C".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_unparseable_output_surfaces_template_error() {
        let engine = TemplateEngine::new(vec![], &[("bad.yaml", "a: [unclosed\n")]).unwrap();
        let err = engine.render("bad.yaml", &json!({})).unwrap_err();
        assert!(matches!(err, TychoError::Template { .. }));
    }
}
