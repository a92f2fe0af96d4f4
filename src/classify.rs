//! Maps an intercepted request to the resource class that picks its strategy.

use serde::Serialize;

use crate::http::{Request, RequestMode};

const STATIC_EXTENSIONS: &[&str] = &["css", "js", "woff", "woff2", "ttf", "eot"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "ico"];

/// Resource class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
  StaticAsset,
  Image,
  ApiCall,
  Navigation,
  Other,
}

/// Classify a request. Extension checks take precedence over the API prefix
/// and header inspection.
pub fn classify(request: &Request, api_prefix: &str) -> ResourceClass {
  let path = request.url.path();

  if let Some(ext) = extension(path) {
    // Static extensions are matched case-sensitively, images are not.
    if STATIC_EXTENSIONS.contains(&ext) {
      return ResourceClass::StaticAsset;
    }
    let lower = ext.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&lower.as_str()) {
      return ResourceClass::Image;
    }
  }

  if path.starts_with(api_prefix) {
    return ResourceClass::ApiCall;
  }

  let accepts_html = request
    .accept
    .as_deref()
    .is_some_and(|accept| accept.contains("text/html"));
  if request.mode == RequestMode::Navigate || accepts_html {
    return ResourceClass::Navigation;
  }

  ResourceClass::Other
}

fn extension(path: &str) -> Option<&str> {
  let file = path.rsplit('/').next()?;
  file.rsplit_once('.').map(|(_, ext)| ext)
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  fn req(path: &str) -> Request {
    Request::get(Url::parse("http://app.local").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_static_assets() {
    for path in ["/assets/app.js", "/main.css", "/fonts/inter.woff2", "/f.ttf"] {
      assert_eq!(classify(&req(path), "/api/"), ResourceClass::StaticAsset, "{path}");
    }
  }

  #[test]
  fn test_static_is_case_sensitive() {
    assert_eq!(classify(&req("/APP.JS"), "/api/"), ResourceClass::Other);
  }

  #[test]
  fn test_images_case_insensitive() {
    assert_eq!(classify(&req("/logo.PNG"), "/api/"), ResourceClass::Image);
    assert_eq!(classify(&req("/favicon.ico"), "/api/"), ResourceClass::Image);
  }

  #[test]
  fn test_extension_beats_api_prefix() {
    assert_eq!(classify(&req("/api/charts/scope1.svg"), "/api/"), ResourceClass::Image);
    assert_eq!(classify(&req("/api/widget.js"), "/api/"), ResourceClass::StaticAsset);
  }

  #[test]
  fn test_api_beats_navigation() {
    let request = req("/api/emissions").with_accept("text/html");
    assert_eq!(classify(&request, "/api/"), ResourceClass::ApiCall);

    let post = Request::new(Method::POST, request.url.clone());
    assert_eq!(classify(&post, "/api/"), ResourceClass::ApiCall);
  }

  #[test]
  fn test_navigation_by_mode_or_accept() {
    let nav = req("/dashboard").with_mode(RequestMode::Navigate);
    assert_eq!(classify(&nav, "/api/"), ResourceClass::Navigation);

    let html = req("/reports").with_accept("text/html,application/xhtml+xml");
    assert_eq!(classify(&html, "/api/"), ResourceClass::Navigation);
  }

  #[test]
  fn test_default_is_other() {
    assert_eq!(classify(&req("/manifest.json"), "/api/"), ResourceClass::Other);
    assert_eq!(classify(&req("/"), "/api/"), ResourceClass::Other);
    // "/api" without the trailing slash is not in the namespace
    assert_eq!(classify(&req("/api"), "/api/"), ResourceClass::Other);
  }
}
