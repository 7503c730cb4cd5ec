//! Policy for selecting images based on filter criteria.

use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Deserializer};
use serde_derive::Deserialize as DeserializeDerive;

use crate::models::tag::RSPImageType;
use crate::unit_conversion::parse_duration;

/// Policy for images to display within a given category.
///
/// All specified policies are applied. For instance, if the policy specifies
/// both age and cutoff version, an image has to be newer than the specified
/// age and have a version greater than or equal to the cutoff in order to be
/// displayed. If no policies are specified, all images of that category are
/// kept.
#[derive(Debug, Clone, Default, DeserializeDerive, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageFilterPolicy {
    /// Number of images to keep.
    #[serde(default)]
    pub number: Option<usize>,

    /// Maximum age of images to keep.
    #[serde(default, deserialize_with = "deserialize_age")]
    pub age: Option<Duration>,

    /// Minimum version of image to keep.
    ///
    /// This does not apply to unparseable tags or to experimental tags not
    /// derived from a parseable tag.
    #[serde(default, deserialize_with = "deserialize_version")]
    pub cutoff_version: Option<Version>,
}

/// Configuration for display of RSP images.
///
/// Images in the alias category are always displayed; unknown images are
/// never filtered.
#[derive(Debug, Clone, Default, DeserializeDerive, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RSPImageFilterPolicy {
    #[serde(default)]
    pub release: ImageFilterPolicy,

    #[serde(default)]
    pub weekly: ImageFilterPolicy,

    #[serde(default)]
    pub daily: ImageFilterPolicy,

    #[serde(default)]
    pub release_candidate: ImageFilterPolicy,

    #[serde(default)]
    pub experimental: ImageFilterPolicy,
}

impl RSPImageFilterPolicy {
    pub fn policy_for_category(&self, category: RSPImageType) -> Option<&ImageFilterPolicy> {
        match category {
            RSPImageType::Alias => None,
            RSPImageType::Release => Some(&self.release),
            RSPImageType::Weekly => Some(&self.weekly),
            RSPImageType::Daily => Some(&self.daily),
            RSPImageType::Candidate => Some(&self.release_candidate),
            RSPImageType::Experimental => Some(&self.experimental),
            RSPImageType::Unknown => None,
        }
    }
}

/// Apply a filter policy to a list of images, returning the survivors in
/// menu order.
pub fn filter_images(
    images: Vec<crate::models::image::RSPImage>,
    policy: &RSPImageFilterPolicy,
    age_basis: chrono::DateTime<chrono::Utc>,
) -> Vec<crate::models::image::RSPImage> {
    use strum::IntoEnumIterator;

    let mut result = Vec::new();
    for category in RSPImageType::iter() {
        let mut candidates: Vec<_> =
            images.iter().filter(|image| image.image_type == category).cloned().collect();
        candidates.sort_by(|a, b| a.compare_within_type(b));
        let Some(category_policy) = policy.policy_for_category(category) else {
            result.extend(candidates);
            continue;
        };
        let cutoff_date = category_policy.age.map(|age| age_basis - age);
        let mut remainder = Vec::new();
        for image in candidates {
            if let Some(number) = category_policy.number {
                if remainder.len() >= number {
                    break;
                }
            }
            if let (Some(date), Some(cutoff)) = (image.date, cutoff_date) {
                if date < cutoff {
                    continue;
                }
            }
            if let (Some(version), Some(cutoff)) = (&image.version, &category_policy.cutoff_version) {
                if version.cmp_precedence(cutoff) == std::cmp::Ordering::Less {
                    continue;
                }
            }
            remainder.push(image);
        }
        result.extend(remainder);
    }
    result
}

fn deserialize_age<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|text| parse_duration(&text).map_err(serde::de::Error::custom))
        .transpose()
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<Version>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|text| Version::parse(&text).map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize() {
        let policy: RSPImageFilterPolicy = serde_yaml::from_str(
            "
            release:
              cutoffVersion: 27.0.0
            weekly:
              age: 2w
            daily:
              age: 2d
              number: 4
            ",
        )
        .unwrap();
        assert_eq!(policy.release.cutoff_version, Some(Version::new(27, 0, 0)));
        assert_eq!(policy.weekly.age, Some(Duration::from_secs(2 * 604_800)));
        assert_eq!(policy.daily.number, Some(4));
        assert_eq!(policy.experimental, ImageFilterPolicy::default());
    }

    #[test]
    fn test_category_lookup() {
        let policy = RSPImageFilterPolicy::default();
        assert!(policy.policy_for_category(RSPImageType::Alias).is_none());
        assert!(policy.policy_for_category(RSPImageType::Unknown).is_none());
        assert!(policy.policy_for_category(RSPImageType::Release).is_some());
    }
}
