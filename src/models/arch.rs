//! Filtering of architecture-specific image tags.
//!
//! Image builds may push both a bare tag and per-architecture variants such
//! as `w_2025_39-amd64`. Only one representative per logical tag should
//! survive: the bare tag if it exists, otherwise the first suffixed variant
//! encountered.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::image::RSPImage;

static ARCH_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?P<base>.+)-(?P<arch>[a-z0-9_]+)$").unwrap());

/// Filter a list of tag names down to one representative per logical tag,
/// preserving input order.
pub fn filter_arch_tags(tags: &[String]) -> Vec<String> {
    let keep = keep_mask(tags.iter().map(String::as_str));
    tags.iter()
        .zip(keep)
        .filter_map(|(tag, keep)| keep.then(|| tag.clone()))
        .collect()
}

/// Filter a list of images the same way `filter_arch_tags` filters tag
/// names.
pub fn filter_arch_images(images: Vec<RSPImage>) -> Vec<RSPImage> {
    let keep = keep_mask(images.iter().map(|image| image.tag.as_str()));
    images.into_iter().zip(keep).filter_map(|(image, keep)| keep.then_some(image)).collect()
}

fn keep_mask<'a>(tags: impl Iterator<Item = &'a str> + Clone) -> Vec<bool> {
    let bare: std::collections::HashSet<&str> =
        tags.clone().filter(|tag| !ARCH_SUFFIX.is_match(tag)).collect();
    let mut seen_bases = std::collections::HashSet::new();
    tags.map(|tag| match ARCH_SUFFIX.captures(tag) {
        None => true,
        Some(captures) => {
            let base = captures.name("base").map(|m| m.as_str()).unwrap_or(tag);
            if bare.contains(base) {
                false
            } else {
                seen_bases.insert(base.to_string())
            }
        }
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tag::RSPImageTag;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_filter_arch_tags() {
        let input = tags(&["recommended", "w_2025_39", "w_2025_39-amd64", "w_2025_39-arm64", "w_2025_40-arm64"]);
        assert_eq!(filter_arch_tags(&input), tags(&["recommended", "w_2025_39", "w_2025_40-arm64"]));
    }

    #[test]
    fn test_filter_keeps_first_variant() {
        let input = tags(&[
            "w_2021_21",
            "w_2021_21-arm64",
            "w_2021_22-arm64",
            "w_2021_22-amd64",
            "d_2021_06_14-amd64",
            "d_2021_06_15",
        ]);
        assert_eq!(
            filter_arch_tags(&input),
            tags(&["w_2021_21", "w_2021_22-arm64", "d_2021_06_14-amd64", "d_2021_06_15"])
        );
    }

    #[test]
    fn test_filter_arch_images() {
        let input = ["recommended", "w_2025_39", "w_2025_39-amd64", "w_2025_39-arm64", "w_2025_40-arm64"];
        let images: Vec<RSPImage> = input
            .iter()
            .map(|tag| {
                RSPImage::from_tag(
                    "ghcr.io",
                    "lsst-sqre/sciplat-lab",
                    RSPImageTag::from_str(tag),
                    "sha256:abcd",
                )
            })
            .collect();
        let filtered = filter_arch_images(images);
        let seen: Vec<_> = filtered.iter().map(|image| image.tag.as_str()).collect();
        assert_eq!(seen, vec!["recommended", "w_2025_39", "w_2025_40-arm64"]);
    }
}
