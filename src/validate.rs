//! Syntax checking of candidate artifacts.
//!
//! The candidate is staged next to a top-level configuration that includes
//! it, and the proxy's own checker is run against that harness.  By default
//! the harness is a small standalone file with one `http` context and one
//! `server` block.  An operator template can stand in for it so the check
//! also sees the static configuration the candidate will live next to.
//! The live files are never read or written here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::ValidateError;
use crate::render::{serialize, ConfigArtifact, Directive};

const CANDIDATE_UPSTREAMS: &str = "candidate-upstreams.conf";
const CANDIDATE_LOCATIONS: &str = "candidate-locations.conf";
const HARNESS: &str = "harness.conf";

/// Result of a syntax check that actually ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    /// Raw checker output.
    pub diagnostic: String,
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, artifact: &ConfigArtifact) -> Result<Verdict, ValidateError>;
}

/// Runs an external checker such as `nginx -t`.
///
/// Each argument may contain the placeholders `{config}`, `{upstreams}`
/// and `{locations}`, replaced with the staged harness and candidate paths.
/// A template uses `{upstreams}` and `{locations}` the same way.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    staging_dir: PathBuf,
    listen_port: u16,
    command: Vec<String>,
    template: Option<PathBuf>,
}

impl CommandValidator {
    pub fn new(staging_dir: PathBuf, listen_port: u16, command: Vec<String>) -> Self {
        Self {
            staging_dir,
            listen_port,
            command,
            template: None,
        }
    }

    /// Build the harness from an operator file instead, read on every check.
    pub fn with_template(mut self, template: Option<PathBuf>) -> Self {
        self.template = template;
        self
    }

    async fn harness(&self, upstreams: &Path, locations: &Path) -> Result<String, ValidateError> {
        let Some(template) = &self.template else {
            return Ok(self.default_harness(upstreams, locations));
        };
        let text = tokio::fs::read_to_string(template)
            .await
            .map_err(|source| ValidateError::Template {
                path: template.clone(),
                source,
            })?;
        Ok(text
            .replace("{upstreams}", &upstreams.display().to_string())
            .replace("{locations}", &locations.display().to_string()))
    }

    fn default_harness(&self, upstreams: &Path, locations: &Path) -> String {
        let server = Directive::block(
            "server",
            Vec::<String>::new(),
            vec![
                Directive::simple("listen", [self.listen_port.to_string()]),
                Directive::simple("include", [locations.display().to_string()]),
            ],
        );
        serialize(&[
            Directive::simple("error_log", ["stderr"]),
            Directive::block("events", Vec::<String>::new(), Vec::new()),
            Directive::block(
                "http",
                Vec::<String>::new(),
                vec![
                    Directive::simple("include", [upstreams.display().to_string()]),
                    server,
                ],
            ),
        ])
    }

    async fn stage(&self, path: &Path, contents: &str) -> Result<(), ValidateError> {
        tokio::fs::write(path, contents)
            .await
            .map_err(|source| ValidateError::Stage {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate(&self, artifact: &ConfigArtifact) -> Result<Verdict, ValidateError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(ValidateError::EmptyCommand)?;

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|source| ValidateError::Stage {
                path: self.staging_dir.clone(),
                source,
            })?;

        let upstreams = self.staging_dir.join(CANDIDATE_UPSTREAMS);
        let locations = self.staging_dir.join(CANDIDATE_LOCATIONS);
        let harness = self.staging_dir.join(HARNESS);
        self.stage(&upstreams, artifact.upstreams()).await?;
        self.stage(&locations, artifact.locations()).await?;
        let harness_text = self.harness(&upstreams, &locations).await?;
        self.stage(&harness, &harness_text).await?;

        let substitute = |arg: &String| {
            arg.replace("{config}", &harness.display().to_string())
                .replace("{upstreams}", &upstreams.display().to_string())
                .replace("{locations}", &locations.display().to_string())
        };
        let args: Vec<String> = args.iter().map(substitute).collect();
        debug!("Validating candidate: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ValidateError::Spawn {
                command: program.clone(),
                source,
            })?;

        let mut diagnostic = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            if !diagnostic.is_empty() {
                diagnostic.push('\n');
            }
            diagnostic.push_str(stdout.trim());
        }

        Ok(Verdict {
            passed: output.status.success(),
            diagnostic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ConfigArtifact {
        ConfigArtifact::new(
            "upstream a_backend {\n    server 10.0.0.1:80;\n}\n".into(),
            "location /a/ {\n    proxy_pass http://a_backend;\n}\n".into(),
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn passing_check_sees_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(
            dir.path().to_path_buf(),
            80,
            sh("grep -q a_backend {upstreams} \
                && grep -q 'location /a/' {locations} \
                && test -f {config}"),
        );
        let verdict = validator.validate(&artifact()).await.unwrap();
        assert!(verdict.passed, "diagnostic: {}", verdict.diagnostic);
    }

    #[tokio::test]
    async fn failing_check_carries_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(
            dir.path().to_path_buf(),
            80,
            sh("echo 'unexpected end of file, expecting \"}\"' >&2; exit 1"),
        );
        let verdict = validator.validate(&artifact()).await.unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.diagnostic, "unexpected end of file, expecting \"}\"");
    }

    #[tokio::test]
    async fn harness_includes_candidates_in_one_server() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(dir.path().to_path_buf(), 8080, sh("cat {config}"));
        let verdict = validator.validate(&artifact()).await.unwrap();
        assert!(verdict.passed);

        let upstreams = dir.path().join(CANDIDATE_UPSTREAMS);
        let locations = dir.path().join(CANDIDATE_LOCATIONS);
        assert!(verdict
            .diagnostic
            .contains(&format!("    include {};", upstreams.display())));
        assert!(verdict.diagnostic.contains("        listen 8080;"));
        assert!(verdict
            .diagnostic
            .contains(&format!("        include {};", locations.display())));
        assert_eq!(verdict.diagnostic.matches("server {").count(), 1);
    }

    #[tokio::test]
    async fn template_brings_static_configuration_into_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("nginx.conf.in");
        std::fs::write(
            &template,
            "events {}\nhttp {\n    include {upstreams};\n    server {\n        \
             location /static/ { root /srv; }\n        include {locations};\n    }\n}\n",
        )
        .unwrap();

        let staging = dir.path().join("staging");
        let validator = CommandValidator::new(staging.clone(), 80, sh("cat {config}"))
            .with_template(Some(template));
        let verdict = validator.validate(&artifact()).await.unwrap();
        assert!(verdict.passed);
        assert!(verdict.diagnostic.contains("location /static/ { root /srv; }"));
        assert!(verdict.diagnostic.contains(&format!(
            "include {};",
            staging.join(CANDIDATE_LOCATIONS).display()
        )));
        assert!(!verdict.diagnostic.contains("{upstreams}"));
    }

    #[tokio::test]
    async fn missing_template_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(dir.path().to_path_buf(), 80, sh("true"))
            .with_template(Some(dir.path().join("absent.conf.in")));
        assert!(matches!(
            validator.validate(&artifact()).await,
            Err(ValidateError::Template { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(
            dir.path().to_path_buf(),
            80,
            vec!["/nonexistent/proxied-check".into()],
        );
        assert!(matches!(
            validator.validate(&artifact()).await,
            Err(ValidateError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(dir.path().to_path_buf(), 80, Vec::new());
        assert!(matches!(
            validator.validate(&artifact()).await,
            Err(ValidateError::EmptyCommand)
        ));
    }
}
