use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::descriptor::internal_name;
use crate::ir::MemberRef;

const RECORD_SINK_DESCRIPTOR: &str = "(Ljava/lang/String;)V";

/// Instrumentation passes that can be chained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PassKind {
    ClickGuard,
    PrivacySentry,
    ThreadRename,
}

/// Build-wide configuration, immutable once loaded.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    pub(crate) order: Option<Vec<PassKind>>,
    pub(crate) click_guard: Option<ClickGuardConfig>,
    pub(crate) privacy_sentry: Option<PrivacySentryConfig>,
    pub(crate) thread_rename: Option<ThreadRenameConfig>,
}

/// Click-Guard configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ClickGuardConfig {
    /// Class name prefixes eligible for guarding.
    #[serde(default)]
    pub(crate) include: Vec<String>,
    #[serde(default = "default_force_include")]
    pub(crate) force_include: BTreeSet<String>,
    #[serde(default)]
    pub(crate) force_exclude: BTreeSet<String>,
    #[serde(default = "default_widget_type")]
    pub(crate) widget_type: String,
    /// Static predicate taking the widget and returning whether the click proceeds.
    pub(crate) guard: MemberRef,
    #[serde(default = "default_hook_points")]
    pub(crate) hook_points: Vec<CallbackShape>,
}

/// Listener callback recognised either as an override or as a lambda call site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CallbackShape {
    pub(crate) interface: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    /// Suffix a call-site descriptor ends with when it produces this interface.
    pub(crate) interface_suffix: String,
}

impl CallbackShape {
    pub(crate) fn name_with_descriptor(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }
}

/// Privacy-Sentry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PrivacySentryConfig {
    #[serde(default = "default_sensitive")]
    pub(crate) sensitive: Vec<AccessPattern>,
    /// Static method receiving each rendered record.
    pub(crate) record_sink: MemberRef,
    #[serde(default = "default_helper_name")]
    pub(crate) helper_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AccessKind {
    Method,
    Field,
}

/// Sensitive call or field read identified by owner, name and descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AccessPattern {
    pub(crate) kind: AccessKind,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// Thread-Rename configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ThreadRenameConfig {
    pub(crate) thread_class: String,
    pub(crate) executors_class: String,
    #[serde(default = "default_factory_methods")]
    pub(crate) factory_methods: BTreeSet<String>,
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Config::parse(&text).with_context(|| format!("invalid configuration {}", path.display()))
    }

    pub(crate) fn parse(text: &str) -> Result<Config> {
        let mut config: Config =
            serde_json::from_str(text).context("failed to parse configuration JSON")?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Passes to run, in chain order. Only configured passes are returned.
    pub(crate) fn chain_order(&self) -> Vec<PassKind> {
        let order = self.order.clone().unwrap_or_else(|| {
            vec![
                PassKind::ClickGuard,
                PassKind::PrivacySentry,
                PassKind::ThreadRename,
            ]
        });
        let mut seen = Vec::new();
        for kind in order {
            if self.is_configured(kind) && !seen.contains(&kind) {
                seen.push(kind);
            }
        }
        seen
    }

    fn is_configured(&self, kind: PassKind) -> bool {
        match kind {
            PassKind::ClickGuard => self.click_guard.is_some(),
            PassKind::PrivacySentry => self.privacy_sentry.is_some(),
            PassKind::ThreadRename => self.thread_rename.is_some(),
        }
    }

    fn normalize(&mut self) {
        if let Some(click) = self.click_guard.as_mut() {
            click.include = click.include.iter().map(|prefix| internal_name(prefix)).collect();
            click.force_include = click.force_include.iter().map(|name| type_descriptor(name)).collect();
            click.force_exclude = click.force_exclude.iter().map(|name| type_descriptor(name)).collect();
            click.widget_type = type_descriptor(&click.widget_type);
            normalize_member(&mut click.guard);
            for shape in &mut click.hook_points {
                shape.interface = internal_name(&shape.interface);
            }
        }
        if let Some(privacy) = self.privacy_sentry.as_mut() {
            normalize_member(&mut privacy.record_sink);
            for pattern in &mut privacy.sensitive {
                pattern.owner = internal_name(&pattern.owner);
            }
        }
        if let Some(thread) = self.thread_rename.as_mut() {
            thread.thread_class = internal_name(&thread.thread_class);
            thread.executors_class = internal_name(&thread.executors_class);
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(click) = &self.click_guard {
            if click.guard.descriptor != format!("({})Z", click.widget_type) {
                anyhow::bail!(
                    "click_guard.guard must take {} and return boolean, found {}",
                    click.widget_type,
                    click.guard.descriptor
                );
            }
        }
        if let Some(privacy) = &self.privacy_sentry {
            if privacy.record_sink.descriptor != RECORD_SINK_DESCRIPTOR {
                anyhow::bail!(
                    "privacy_sentry.record_sink must have descriptor {}, found {}",
                    RECORD_SINK_DESCRIPTOR,
                    privacy.record_sink.descriptor
                );
            }
            if privacy.helper_name.is_empty() {
                anyhow::bail!("privacy_sentry.helper_name must not be empty");
            }
        }
        if let Some(thread) = &self.thread_rename {
            if thread.thread_class.is_empty() || thread.executors_class.is_empty() {
                anyhow::bail!("thread_rename requires thread_class and executors_class");
            }
        }
        Ok(())
    }
}

fn normalize_member(member: &mut MemberRef) {
    member.owner = internal_name(&member.owner);
}

/// Accept either a type descriptor or a dotted/slashed class name.
fn type_descriptor(name: &str) -> String {
    if name.starts_with('L') && name.ends_with(';') {
        name.to_string()
    } else {
        format!("L{};", internal_name(name))
    }
}

fn default_force_include() -> BTreeSet<String> {
    BTreeSet::from(["Lbutterknife/OnClick;".to_string()])
}

fn default_widget_type() -> String {
    "Landroid/view/View;".to_string()
}

fn default_hook_points() -> Vec<CallbackShape> {
    vec![CallbackShape {
        interface: "android/view/View$OnClickListener".to_string(),
        name: "onClick".to_string(),
        descriptor: "(Landroid/view/View;)V".to_string(),
        interface_suffix: "Landroid/view/View$OnClickListener;".to_string(),
    }]
}

fn default_sensitive() -> Vec<AccessPattern> {
    vec![
        AccessPattern {
            kind: AccessKind::Method,
            owner: "android/telephony/TelephonyManager".to_string(),
            name: "getDeviceId".to_string(),
            descriptor: "()Ljava/lang/String;".to_string(),
        },
        AccessPattern {
            kind: AccessKind::Field,
            owner: "android/os/Build".to_string(),
            name: "BRAND".to_string(),
            descriptor: "Ljava/lang/String;".to_string(),
        },
    ]
}

fn default_helper_name() -> String {
    "recordPrivacyAccess".to_string()
}

fn default_factory_methods() -> BTreeSet<String> {
    [
        "newFixedThreadPool",
        "newSingleThreadExecutor",
        "newCachedThreadPool",
        "newSingleThreadScheduledExecutor",
        "newScheduledThreadPool",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
