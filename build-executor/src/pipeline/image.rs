// Image References
// Normalization and privileged-image pattern matching

use crate::pipeline::ruleset::{pattern_matches, Matcher};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_NAMESPACE: &str = "library";

/// Parsed container image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Fully qualified repository, e.g. `docker.io/library/alpine`
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(image: &str) -> Self {
        let image = image.trim();
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (image, None),
        };

        // a colon after the last slash separates the tag, otherwise it is a registry port
        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };

        Self {
            name: normalize_name(name),
            tag,
            digest,
        }
    }
}

fn normalize_name(name: &str) -> String {
    let mut parts = name.splitn(2, '/');
    let first = parts.next().unwrap_or_default();

    match parts.next() {
        None => format!("{}/{}/{}", DEFAULT_REGISTRY, DEFAULT_NAMESPACE, first),
        Some(_) => {
            let is_registry = first.contains('.') || first.contains(':') || first == "localhost";
            if is_registry {
                name.to_string()
            } else {
                format!("{}/{}", DEFAULT_REGISTRY, name)
            }
        }
    }
}

/// Whether an image matches a privileged pattern.
///
/// A pattern without a tag matches every tag of the image; a tagged pattern
/// must match the tag as well. `*` globs within a path segment.
pub fn is_privileged_image(image: &str, pattern: &str) -> bool {
    let image = ImageRef::parse(image);
    let pattern = ImageRef::parse(pattern);

    if !pattern_matches(&pattern.name, &image.name, Matcher::Filepath) {
        return false;
    }

    match (&pattern.tag, &image.tag) {
        (None, _) => true,
        (Some(want), Some(have)) => pattern_matches(want, have, Matcher::Filepath),
        (Some(want), None) => want == "latest",
    }
}

/// Every image matching at least one privileged pattern
pub fn privileged_images<'a>(images: &[&'a str], patterns: &[String]) -> Vec<&'a str> {
    let mut found = Vec::new();
    for image in images {
        if patterns.iter().any(|p| is_privileged_image(image, p)) && !found.contains(image) {
            found.push(*image);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_official_image() {
        let image = ImageRef::parse("alpine:3.19");
        assert_eq!(image.name, "docker.io/library/alpine");
        assert_eq!(image.tag.as_deref(), Some("3.19"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let image = ImageRef::parse("localhost:5000/team/app");
        assert_eq!(image.name, "localhost:5000/team/app");
        assert_eq!(image.tag, None);
    }

    #[test]
    fn test_parse_digest() {
        let image = ImageRef::parse("target/docker@sha256:abc");
        assert_eq!(image.name, "docker.io/target/docker");
        assert_eq!(image.digest.as_deref(), Some("sha256:abc"));
    }

    #[test]
    fn test_untagged_pattern_matches_any_tag() {
        assert!(is_privileged_image("target/docker:latest", "target/docker"));
        assert!(is_privileged_image("docker.io/target/docker:v1", "target/docker"));
        assert!(!is_privileged_image("target/kaniko:latest", "target/docker"));
    }

    #[test]
    fn test_tagged_pattern() {
        assert!(is_privileged_image("docker:dind", "docker:dind"));
        assert!(!is_privileged_image("docker:24", "docker:dind"));
        assert!(is_privileged_image("docker:24-dind", "docker:*dind"));
    }

    #[test]
    fn test_wildcard_pattern() {
        assert!(is_privileged_image("target/plugin-docker:1", "target/*"));
        assert!(!is_privileged_image("other/plugin-docker:1", "target/*"));
    }

    #[test]
    fn test_privileged_images_collects_all() {
        let images = vec!["alpine", "docker:dind", "target/docker:1", "docker:dind"];
        let patterns = vec!["docker:dind".to_string(), "target/docker".to_string()];
        assert_eq!(
            privileged_images(&images, &patterns),
            vec!["docker:dind", "target/docker:1"]
        );
    }
}
