//! Variable interpolation for collaborator command lines.
//!
//! Supports variables like:
//! - `${input}` - Stage input (raw upload, converted volume)
//! - `${output}` - Output file the stage should write
//! - `${output_dir}` - Output directory of the stage
//! - `${job_id}` - Job identifier
//! - `${subject}` - Preprocessing subject identifier
//! - `${env.VAR_NAME}` - Environment variable

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Values available to a command template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub input: Option<String>,
    pub output: Option<String>,
    pub output_dir: Option<String>,
    pub job_id: Option<String>,
    pub subject: Option<String>,
    pub env: HashMap<String, String>,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is a valid regex")
});

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(mut self) -> Self {
        self.env.extend(std::env::vars());
        self
    }

    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();
        match parts.as_slice() {
            ["input"] => self.input.clone(),
            ["output"] => self.output.clone(),
            ["output_dir"] => self.output_dir.clone(),
            ["job_id"] => self.job_id.clone(),
            ["subject"] => self.subject.clone(),
            ["env", name] => self.env.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left
    /// as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Variables referenced by `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}
