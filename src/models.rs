use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Who may see a meme or template.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Unlisted,
    #[default]
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Unlisted => "unlisted",
            Visibility::Public => "public",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Visibility::Private),
            "unlisted" => Ok(Visibility::Unlisted),
            "public" => Ok(Visibility::Public),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Meme {
    pub public_id: String,
    pub name: String,
    pub creator: String,
    pub visibility: Visibility,
    pub content_type: String,
    /// Object-store key of the image. Never rendered to clients.
    pub image_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub public_id: String,
    pub content: String,
    pub username: String,
    pub meme_public_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Like {
    pub username: String,
    pub meme_public_id: String,
}

/// One text overlay placed on a template's canvas.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextOverlay {
    pub text: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "TextOverlay::default_font_size")]
    pub font_size: f64,
    #[serde(default = "TextOverlay::default_fill")]
    pub fill: String,
    #[serde(default = "TextOverlay::default_font_style")]
    pub font_style: String,
}

impl TextOverlay {
    fn default_font_size() -> f64 {
        20.0
    }

    fn default_fill() -> String {
        "black".to_string()
    }

    fn default_font_style() -> String {
        "normal".to_string()
    }

    /// A bare string overlay: the text at the origin with default styling.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            x: 0.0,
            y: 0.0,
            font_size: Self::default_font_size(),
            fill: Self::default_fill(),
            font_style: Self::default_font_style(),
        }
    }
}

/// Stored overlays are either full descriptors or legacy bare strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredOverlay {
    Plain(String),
    Full(TextOverlay),
}

impl From<StoredOverlay> for TextOverlay {
    fn from(stored: StoredOverlay) -> Self {
        match stored {
            StoredOverlay::Plain(text) => TextOverlay::plain(text),
            StoredOverlay::Full(overlay) => overlay,
        }
    }
}

/// Parses a JSON array of overlays, accepting bare strings as plain overlays.
pub fn parse_overlays(raw: &str) -> Result<Vec<TextOverlay>, serde_json::Error> {
    let stored: Vec<StoredOverlay> = serde_json::from_str(raw)?;
    Ok(stored.into_iter().map(TextOverlay::from).collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub public_id: String,
    pub name: String,
    pub creator: Option<String>,
    pub visibility: Visibility,
    pub content_type: String,
    pub image_key: String,
    pub texts: Vec<TextOverlay>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_round_trips_through_str() {
        for vis in [Visibility::Private, Visibility::Unlisted, Visibility::Public] {
            assert_eq!(vis.as_str().parse::<Visibility>().unwrap(), vis);
        }
        assert!("secret".parse::<Visibility>().is_err());
        assert_eq!(Visibility::default(), Visibility::Public);
    }

    #[test]
    fn overlays_accept_bare_strings() {
        let overlays =
            parse_overlays(r#"["top text", {"text": "bottom", "y": 200, "fill": "white"}]"#)
                .unwrap();
        assert_eq!(overlays[0], TextOverlay::plain("top text"));
        assert_eq!(overlays[1].text, "bottom");
        assert_eq!(overlays[1].y, 200.0);
        assert_eq!(overlays[1].fill, "white");
        assert_eq!(overlays[1].font_size, 20.0);
    }
}
