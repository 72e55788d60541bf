use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::fmt;
use url::Url;

/// Name of the store a deployment caches into.
///
/// Bumped by hand whenever the manifest changes; every other store is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct CacheVersion(String);

impl CacheVersion {
  pub fn new(name: impl Into<String>) -> Result<Self> {
    Self::try_from(name.into()).map_err(|e| eyre!(e))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl TryFrom<String> for CacheVersion {
  type Error = String;

  fn try_from(name: String) -> Result<Self, Self::Error> {
    let name = name.trim().to_string();
    if name.is_empty() {
      return Err("cache version must not be empty".to_string());
    }
    Ok(Self(name))
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Ordered list of app-shell URLs, absolute or relative to the origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
  pub fn new<I, T>(entries: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<String>,
  {
    Self(entries.into_iter().map(Into::into).collect())
  }

  pub fn entries(&self) -> &[String] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Absolute URLs in manifest order.
  pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
    self
      .0
      .iter()
      .map(|entry| resolve_entry(origin, entry))
      .collect()
  }
}

/// Join `entry` onto `origin`, dropping any fragment.
pub fn resolve_entry(origin: &Url, entry: &str) -> Result<Url> {
  let mut url = origin
    .join(entry.trim())
    .map_err(|e| eyre!("Invalid manifest entry '{}': {}", entry, e))?;
  url.set_fragment(None);
  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_keeps_order_and_absolute_entries() {
    let origin = Url::parse("https://app.example.com/").unwrap();
    let manifest = AssetManifest::new([".", "/app.css", "https://cdn.tailwindcss.com", "icons#x"]);

    let urls: Vec<String> = manifest
      .resolve(&origin)
      .unwrap()
      .into_iter()
      .map(String::from)
      .collect();

    assert_eq!(
      urls,
      vec![
        "https://app.example.com/",
        "https://app.example.com/app.css",
        "https://cdn.tailwindcss.com/",
        "https://app.example.com/icons",
      ]
    );
  }

  #[test]
  fn test_relative_entries_follow_scope_path() {
    let origin = Url::parse("https://example.com/Pages/").unwrap();
    let url = resolve_entry(&origin, "student_dashboard.html").unwrap();
    assert_eq!(url.as_str(), "https://example.com/Pages/student_dashboard.html");
  }

  #[test]
  fn test_bad_entry_is_an_error() {
    let origin = Url::parse("https://app.example.com/").unwrap();
    assert!(resolve_entry(&origin, "http://[::1").is_err());
  }

  #[test]
  fn test_empty_version_rejected() {
    assert!(CacheVersion::new("  ").is_err());
    assert_eq!(CacheVersion::new("app-v2").unwrap().as_str(), "app-v2");
  }
}
