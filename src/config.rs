use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::routes::CollisionPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    pub label_prefix: String,
    pub upstreams_path: PathBuf,
    pub locations_path: PathBuf,
    pub staging_dir: PathBuf,
    pub listen_port: u16,
    pub validate_command: Vec<String>,
    /// Top-level config to check candidates against, with `{upstreams}`
    /// and `{locations}` where the generated files are included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_template: Option<PathBuf>,
    pub reload_command: Vec<String>,
    pub audit_log: PathBuf,
    pub cycle_timeout_secs: u64,
    pub collision_policy: CollisionPolicy,
    pub keepalive: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_name: None,
            label_prefix: String::new(),
            upstreams_path: "/etc/nginx/proxied/upstreams.conf".into(),
            locations_path: "/etc/nginx/proxied/locations.conf".into(),
            staging_dir: "/var/lib/proxied/staging".into(),
            listen_port: 80,
            validate_command: ["nginx", "-t", "-q", "-c", "{config}"]
                .map(String::from)
                .to_vec(),
            validate_template: None,
            reload_command: ["nginx", "-s", "reload"].map(String::from).to_vec(),
            audit_log: "/var/log/proxied/reconcile.jsonl".into(),
            cycle_timeout_secs: 30,
            collision_policy: CollisionPolicy::Reject,
            keepalive: 16,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("proxied.toml"))
                .merge(Json::file("proxied.json"))
                .merge(Env::prefixed("PROXIED_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.validate_command.is_empty() {
            anyhow::bail!("validate_command must not be empty");
        }
        if self.reload_command.is_empty() {
            anyhow::bail!("reload_command must not be empty");
        }
        if self.cycle_timeout_secs == 0 {
            anyhow::bail!("cycle_timeout_secs must be greater than zero");
        }
        if self.upstreams_path == self.locations_path {
            anyhow::bail!("upstreams_path and locations_path must differ");
        }
        if let Some(name) = &self.network_name {
            if name.trim().is_empty() {
                anyhow::bail!("network_name must not be blank");
            }
        }
        Ok(())
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cycle_timeout(), Duration::from_secs(30));
        assert_eq!(config.collision_policy, CollisionPolicy::Reject);
        assert_eq!(config.validate_template, None);
    }

    #[test]
    fn file_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "proxied.toml",
                r#"
                network_name = "apps"
                label_prefix = "proxied."
                listen_port = 8080
                collision_policy = "last-wins"
                validate_template = "/etc/proxied/nginx.conf.in"
                "#,
            )?;
            jail.set_env("PROXIED_CYCLE_TIMEOUT_SECS", "5");
            jail.set_env("PROXIED_RELOAD_COMMAND", r#"["kill", "-HUP", "1"]"#);

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.network_name.as_deref(), Some("apps"));
            assert_eq!(config.label_prefix, "proxied.");
            assert_eq!(config.listen_port, 8080);
            assert_eq!(config.collision_policy, CollisionPolicy::LastWins);
            assert_eq!(config.cycle_timeout_secs, 5);
            assert_eq!(config.reload_command, vec!["kill", "-HUP", "1"]);
            assert_eq!(config.keepalive, 16);
            assert_eq!(
                config.validate_template,
                Some(PathBuf::from("/etc/proxied/nginx.conf.in"))
            );
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("PROXIED_CYCLE_TIMEOUT_SECS", "0");
            assert!(Config::load().is_err());
            Ok(())
        });

        Jail::expect_with(|jail| {
            jail.create_file("proxied.json", r#"{ "validate_command": [] }"#)?;
            assert!(Config::load().is_err());
            Ok(())
        });

        Jail::expect_with(|jail| {
            jail.set_env("PROXIED_COLLISION_POLICY", "first-wins");
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}
