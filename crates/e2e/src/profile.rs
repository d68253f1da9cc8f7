//! Device and viewport profiles

use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Device profile a browsing context is created with. Never mutated once a
/// session holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,

    pub viewport: Viewport,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub device_scale_factor: Option<f64>,

    #[serde(default)]
    pub is_mobile: bool,

    #[serde(default)]
    pub has_touch: bool,
}

const IPHONE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 12_2 like Mac OS X) \
AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148";

const PIXEL_5_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 11; Pixel 5) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

impl Profile {
    pub fn custom(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            viewport: Viewport { width, height },
            user_agent: None,
            device_scale_factor: None,
            is_mobile: false,
            has_touch: false,
        }
    }

    pub fn desktop() -> Self {
        Self::custom("desktop", 1280, 720)
    }

    pub fn desktop_large() -> Self {
        Self::custom("desktop-large", 1920, 1080)
    }

    /// Pixel 5 device metrics
    pub fn mobile() -> Self {
        Self {
            user_agent: Some(PIXEL_5_USER_AGENT.to_string()),
            device_scale_factor: Some(2.75),
            is_mobile: true,
            has_touch: true,
            ..Self::custom("mobile", 393, 851)
        }
    }

    pub fn iphone() -> Self {
        Self {
            user_agent: Some(IPHONE_USER_AGENT.to_string()),
            ..Self::custom("iphone", 375, 667)
        }
    }

    pub fn preset(name: &str) -> E2eResult<Self> {
        match name {
            "desktop" => Ok(Self::desktop()),
            "desktop-large" => Ok(Self::desktop_large()),
            "mobile" => Ok(Self::mobile()),
            "iphone" => Ok(Self::iphone()),
            other => Err(E2eError::SpecParse(format!("Unknown profile preset: {}", other))),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Profile reference in a scenario file: a preset name or a full definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSpec {
    Preset(String),
    Custom(Profile),
}

impl ProfileSpec {
    pub fn resolve(&self) -> E2eResult<Profile> {
        match self {
            ProfileSpec::Preset(name) => Profile::preset(name),
            ProfileSpec::Custom(profile) => Ok(profile.clone()),
        }
    }
}

impl From<Profile> for ProfileSpec {
    fn from(profile: Profile) -> Self {
        ProfileSpec::Custom(profile)
    }
}
