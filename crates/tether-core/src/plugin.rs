//! The plugin capability contract.
//!
//! [`Plugin`] is implemented by in-process plugins and by the host-side
//! adapter of out-of-process plugins alike, so the plugin registry never
//! needs to know which kind it holds.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{HttpError, PluginResult};
use crate::funcs::FuncMap;
use crate::http::{Request, ResponseWriter};
use crate::toolkit::Toolkit;

/// A permission a plugin may request from the site owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grant(String);

impl Grant {
    /// Create a grant from its name, e.g. `site.title:read`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Grant name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A grant a plugin asks for, with the reason shown to the site owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    /// Requested grant.
    pub grant: Grant,
    /// Why the plugin needs it.
    pub description: String,
}

impl GrantRequest {
    /// Create a grant request.
    #[must_use]
    pub fn new(grant: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            grant: Grant::new(grant),
            description: description.into(),
        }
    }
}

/// Input widget used to edit a setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingType {
    /// Single-line text.
    #[default]
    Input,
    /// Masked single-line text.
    Password,
    /// Multi-line text.
    Textarea,
    /// Boolean toggle.
    Checkbox,
}

/// A configurable value a plugin exposes to the site owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    /// Setting name, unique within the plugin.
    pub name: String,
    /// Input widget.
    #[serde(default)]
    pub kind: SettingType,
    /// Help text.
    #[serde(default)]
    pub description: String,
    /// Value used until the owner sets one.
    #[serde(default)]
    pub default: String,
    /// Hidden from the settings page.
    #[serde(default)]
    pub hide: bool,
}

impl Setting {
    /// Create a text setting.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SettingType::Input,
            description: String::new(),
            default: String::new(),
            hide: false,
        }
    }

    /// Set the widget.
    #[must_use]
    pub fn with_kind(mut self, kind: SettingType) -> Self {
        self.kind = kind;
        self
    }

    /// Set the help text.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the default value.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = default.into();
        self
    }
}

/// A stylesheet or script a plugin injects into pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Path served to the browser, or the embedded file name.
    pub path: String,
    /// `stylesheet` or `javascript`.
    pub filetype: String,
    /// `head` or `body`.
    pub location: String,
    /// Inline the content instead of linking to it.
    #[serde(default)]
    pub inline: bool,
}

/// A file shipped inside the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedFile {
    /// File name, relative to the plugin's asset root.
    pub name: String,
    /// File content.
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// Everything a plugin injects or ships.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assets {
    /// Asset declarations.
    pub assets: Vec<Asset>,
    /// Embedded files referenced by the declarations.
    pub files: Vec<EmbeddedFile>,
}

/// Outcome of one middleware step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Pass the request on.
    Next,
    /// A response was written; stop the chain.
    Halt,
}

/// Request filter that runs before route handlers.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect the request; write to `w` and return [`Flow::Halt`] to answer
    /// it directly. Values attached with [`Request::set_value`] reach the
    /// handler that serves the request.
    async fn handle(&self, req: &mut Request, w: &ResponseWriter) -> Result<Flow, HttpError>;
}

/// A loadable capability unit.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    async fn version(&self) -> PluginResult<String>;

    /// Start the plugin with the host services it may use.
    async fn enable(&self, toolkit: Toolkit) -> PluginResult<()>;

    /// Stop the plugin and release host services.
    async fn disable(&self) -> PluginResult<()>;

    /// Declare HTTP routes through the toolkit router.
    async fn routes(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Assets to inject into pages.
    async fn assets(&self) -> PluginResult<Assets> {
        Ok(Assets::default())
    }

    /// Settings the site owner can edit.
    async fn settings(&self) -> PluginResult<Vec<Setting>> {
        Ok(Vec::new())
    }

    /// Grants the plugin asks for.
    async fn grant_requests(&self) -> PluginResult<Vec<GrantRequest>> {
        Ok(Vec::new())
    }

    /// Middleware to install in front of all routes.
    async fn middleware(&self) -> PluginResult<Vec<Arc<dyn Middleware>>> {
        Ok(Vec::new())
    }

    /// Template helpers for a request.
    fn func_map(&self, _req: &Request) -> FuncMap {
        FuncMap::new()
    }
}

/// Serde adapter carrying byte buffers as base64 strings.
///
/// Use with `#[serde(with = "tether_core::base64_bytes")]`.
pub mod base64_bytes {
    use super::{Deserialize, Deserializer, Engine, STANDARD, Serializer};

    /// Encode bytes as a base64 string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    /// Decode a base64 string.
    ///
    /// # Errors
    ///
    /// Fails on input that is not a valid base64 string.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_file_content_is_base64() {
        let file = EmbeddedFile {
            name: "style.css".into(),
            content: b"body{}".to_vec(),
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["content"], "Ym9keXt9");

        let back: EmbeddedFile = serde_json::from_value(json).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn test_setting_defaults_from_json() {
        let setting: Setting = serde_json::from_str(r#"{"name": "greeting"}"#).unwrap();
        assert_eq!(setting, Setting::new("greeting"));

        let secret: Setting =
            serde_json::from_str(r#"{"name": "token", "kind": "password", "hide": true}"#).unwrap();
        assert_eq!(secret.kind, SettingType::Password);
        assert!(secret.hide);
    }
}
