use std::time::Duration;

use envconfig::Envconfig;

use crate::store::ApplyParams;

#[derive(Envconfig, Clone, Debug)]
pub struct ReconcilerConfig {
    #[envconfig(from = "OPRC_RECONCILER_PROFILE", default = "dev")]
    pub profile: String,

    /// Field manager used for every server-side apply.
    /// Env: OPRC_RECONCILER_FIELD_MANAGER
    #[envconfig(
        from = "OPRC_RECONCILER_FIELD_MANAGER",
        default = "oprc-reconciler"
    )]
    pub field_manager: String,

    /// Take over fields owned by other managers on apply.
    #[envconfig(from = "OPRC_RECONCILER_FORCE_APPLY", default = "true")]
    pub force_apply: bool,

    /// Requeue interval once everything is ready.
    #[envconfig(from = "OPRC_RECONCILER_REQUEUE_SECS", default = "300")]
    pub requeue_secs: u64,

    /// Requeue interval while workloads are still rolling out.
    #[envconfig(
        from = "OPRC_RECONCILER_PROGRESSING_REQUEUE_SECS",
        default = "5"
    )]
    pub progressing_requeue_secs: u64,

    #[envconfig(from = "OPRC_RECONCILER_ERROR_REQUEUE_SECS", default = "60")]
    pub error_requeue_secs: u64,

    #[envconfig(nested)]
    pub features: FeaturesConfig,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct FeaturesConfig {
    /// If Some, env explicitly set; otherwise, profile defaults apply
    #[envconfig(from = "OPRC_RECONCILER_FEATURES_EVENTS")]
    pub events: Option<bool>,
    /// Watch owned Deployments and ConfigMaps in addition to the owners.
    #[envconfig(from = "OPRC_RECONCILER_FEATURES_WATCH_OWNED")]
    pub watch_owned: Option<bool>,
}

impl ReconcilerConfig {
    /// Apply profile → defaults mapping, while respecting explicit env overrides.
    ///
    /// - dev: events=false, watch_owned=false
    /// - edge / full / prod: events=true, watch_owned=true
    pub fn apply_profile_defaults(mut self) -> Self {
        let (def_events, def_watch) = match self.profile.as_str() {
            "edge" | "full" | "prod" | "production" => (true, true),
            _ /* dev */ => (false, false),
        };
        if self.features.events.is_none() {
            self.features.events = Some(def_events);
        }
        if self.features.watch_owned.is_none() {
            self.features.watch_owned = Some(def_watch);
        }
        self
    }

    pub fn apply_params(&self) -> ApplyParams {
        ApplyParams::new(self.field_manager.clone(), self.force_apply)
    }

    pub fn events_enabled(&self) -> bool {
        self.features.events.unwrap_or(false)
    }

    pub fn watch_owned(&self) -> bool {
        self.features.watch_owned.unwrap_or(false)
    }

    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    pub fn progressing_requeue(&self) -> Duration {
        Duration::from_secs(self.progressing_requeue_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            profile: "dev".into(),
            field_manager: "oprc-reconciler".into(),
            force_apply: true,
            requeue_secs: 300,
            progressing_requeue_secs: 5,
            error_requeue_secs: 60,
            features: FeaturesConfig::default(),
        }
        .apply_profile_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(profile: &str) -> ReconcilerConfig {
        ReconcilerConfig {
            profile: profile.to_string(),
            field_manager: "oprc-reconciler".into(),
            force_apply: true,
            requeue_secs: 300,
            progressing_requeue_secs: 5,
            error_requeue_secs: 60,
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn profile_defaults_dev() {
        let cfg = base("dev").apply_profile_defaults();
        assert_eq!(cfg.features.events, Some(false));
        assert_eq!(cfg.features.watch_owned, Some(false));
    }

    #[test]
    fn profile_defaults_full() {
        for p in ["edge", "full", "prod", "production"] {
            let cfg = base(p).apply_profile_defaults();
            assert_eq!(cfg.features.events, Some(true));
            assert_eq!(cfg.features.watch_owned, Some(true));
        }
    }

    #[test]
    fn profile_defaults_respect_env_overrides() {
        let mut cfg = base("prod");
        cfg.features.events = Some(false); // explicitly disabled via env
        let cfg = cfg.apply_profile_defaults();
        assert_eq!(cfg.features.events, Some(false));
        assert_eq!(cfg.features.watch_owned, Some(true));
    }

    #[test]
    fn apply_params_follow_config() {
        let mut cfg = base("dev");
        cfg.force_apply = false;
        let params = cfg.apply_params();
        assert_eq!(params.field_manager, "oprc-reconciler");
        assert!(!params.force);
        assert_eq!(cfg.error_requeue(), Duration::from_secs(60));
    }
}
