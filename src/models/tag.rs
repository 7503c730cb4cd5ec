//! Sortable image tags for Rubin Science Platform images.
//!
//! These encode the tag conventions documented in SQR-059, a grammar of
//! release, weekly, daily, release candidate, and experimental tags with
//! optional RSP build, SAL cycle, and free-text suffixes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use semver::{BuildMetadata, Prerelease, Version};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::constants::DOCKER_DEFAULT_TAG;
use crate::models::policy::RSPImageFilterPolicy;

// Regular expression components used to construct the parsing regexes.

// r22_0_1
const RELEASE: &str = r"r(?P<major>\d+)_(?P<minor>\d+)_(?P<patch>\d+)";
// r23_0_0_rc1
const CANDIDATE: &str = r"r(?P<major>\d+)_(?P<minor>\d+)_(?P<patch>\d+)_(?P<pre>rc\d+)";
// w_2021_13
const WEEKLY: &str = r"w_(?P<year>\d+)_(?P<week>\d+)";
// d_2021_05_13
const DAILY: &str = r"d_(?P<year>\d+)_(?P<month>\d+)_(?P<day>\d+)";
// exp
const EXPERIMENTAL: &str = r"exp";
// c0020.002
const CYCLE: &str = r"_c(?P<cycle>\d+)\.(?P<cbuild>\d+)";
// rsp19
const RSP: &str = r"_rsp(?P<rspbuild>\d+)";
// recommended_c0020 (used for alias tags)
const UNKNOWN_WITH_CYCLE: &str = r"(?P<tag>.*)_c(?P<cycle>\d+)";
// _whatever_your_little_heart_desires
const REST: &str = r"_(?P<rest>.*)";

/// The type (generally, release series) of the identified image.
///
/// This is listed in order of priority when constructing menus. The image
/// types listed first will be shown earlier in the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum RSPImageType {
    #[strum(serialize = "Alias")]
    Alias,
    #[strum(serialize = "Release")]
    Release,
    #[strum(serialize = "Weekly")]
    Weekly,
    #[strum(serialize = "Daily")]
    Daily,
    #[strum(serialize = "Release Candidate")]
    Candidate,
    #[strum(serialize = "Experimental")]
    Experimental,
    #[strum(serialize = "Unknown")]
    Unknown,
}

// The heart of the parser. An ordered list of pairs, each of which contains
// a tag type followed by a regular expression defining something that matches
// that type, with named capture groups.
//
// This is matched top to bottom. In particular, the release candidate images
// must precede the release images since they would otherwise parse as a
// release image with non-empty "rest", and anything with an rsp build version
// tag must precede the same type without that tag, or it will match a
// non-empty "rest".
static TAG_REGEXES: Lazy<Vec<(RSPImageType, Regex)>> = Lazy::new(|| {
    let table: Vec<(RSPImageType, String)> = vec![
        // r23_0_0_rc1_rsp19_c0020.001_20210513
        (RSPImageType::Candidate, format!("^{CANDIDATE}{RSP}{CYCLE}{REST}$")),
        // r23_0_0_rc1_rsp19_c0020.001
        (RSPImageType::Candidate, format!("^{CANDIDATE}{RSP}{CYCLE}$")),
        // r23_0_0_rc1_rsp19_20210513
        (RSPImageType::Candidate, format!("^{CANDIDATE}{RSP}{REST}$")),
        // r23_0_0_rc1_rsp19
        (RSPImageType::Candidate, format!("^{CANDIDATE}{RSP}$")),
        // r23_0_0_rc1_c0020.001_20210513
        (RSPImageType::Candidate, format!("^{CANDIDATE}{CYCLE}{REST}$")),
        // r23_0_0_rc1_c0020.001
        (RSPImageType::Candidate, format!("^{CANDIDATE}{CYCLE}$")),
        // r23_0_0_rc1_20210513
        (RSPImageType::Candidate, format!("^{CANDIDATE}{REST}$")),
        // r23_0_0_rc1
        (RSPImageType::Candidate, format!("^{CANDIDATE}$")),
        // r22_0_1_rsp19_c0019.001_20210513
        (RSPImageType::Release, format!("^{RELEASE}{RSP}{CYCLE}{REST}$")),
        // r22_0_1_rsp19_c0019.001
        (RSPImageType::Release, format!("^{RELEASE}{RSP}{CYCLE}$")),
        // r22_0_1_rsp19_20210513
        (RSPImageType::Release, format!("^{RELEASE}{RSP}{REST}$")),
        // r22_0_1_rsp19
        (RSPImageType::Release, format!("^{RELEASE}{RSP}$")),
        // r22_0_1_c0019.001_20210513
        (RSPImageType::Release, format!("^{RELEASE}{CYCLE}{REST}$")),
        // r22_0_1_c0019.001
        (RSPImageType::Release, format!("^{RELEASE}{CYCLE}$")),
        // r22_0_1_20210513
        (RSPImageType::Release, format!("^{RELEASE}{REST}$")),
        // r22_0_1
        (RSPImageType::Release, format!("^{RELEASE}$")),
        // r170 (obsolete) (no new ones, no additional parts)
        (RSPImageType::Release, r"^r(?P<major>\d\d)(?P<minor>\d)$".to_string()),
        // w_2021_13_rsp19_c0020.001_20210513
        (RSPImageType::Weekly, format!("^{WEEKLY}{RSP}{CYCLE}{REST}$")),
        // w_2021_13_rsp19_c0020.001
        (RSPImageType::Weekly, format!("^{WEEKLY}{RSP}{CYCLE}$")),
        // w_2021_13_rsp19_20210513
        (RSPImageType::Weekly, format!("^{WEEKLY}{RSP}{REST}$")),
        // w_2021_13_rsp19
        (RSPImageType::Weekly, format!("^{WEEKLY}{RSP}$")),
        // w_2021_13_c0020.001_20210513
        (RSPImageType::Weekly, format!("^{WEEKLY}{CYCLE}{REST}$")),
        // w_2021_13_c0020.001
        (RSPImageType::Weekly, format!("^{WEEKLY}{CYCLE}$")),
        // w_2021_13_20210513
        (RSPImageType::Weekly, format!("^{WEEKLY}{REST}$")),
        // w_2021_13
        (RSPImageType::Weekly, format!("^{WEEKLY}$")),
        // d_2021_05_13_rsp19_c0019.001_20210513
        (RSPImageType::Daily, format!("^{DAILY}{RSP}{CYCLE}{REST}$")),
        // d_2021_05_13_rsp19_c0019.001
        (RSPImageType::Daily, format!("^{DAILY}{RSP}{CYCLE}$")),
        // d_2021_05_13_rsp19_20210513
        (RSPImageType::Daily, format!("^{DAILY}{RSP}{REST}$")),
        // d_2021_05_13_rsp19
        (RSPImageType::Daily, format!("^{DAILY}{RSP}$")),
        // d_2021_05_13_c0019.001_20210513
        (RSPImageType::Daily, format!("^{DAILY}{CYCLE}{REST}$")),
        // d_2021_05_13_c0019.001
        (RSPImageType::Daily, format!("^{DAILY}{CYCLE}$")),
        // d_2021_05_13_20210513
        (RSPImageType::Daily, format!("^{DAILY}{REST}$")),
        // d_2021_05_13
        (RSPImageType::Daily, format!("^{DAILY}$")),
        // exp_w_2021_05_13_nosudo
        (RSPImageType::Experimental, format!("^{EXPERIMENTAL}{REST}$")),
        // recommended_c0029
        (RSPImageType::Unknown, format!("^{UNKNOWN_WITH_CYCLE}$")),
    ];
    table
        .into_iter()
        .map(|(image_type, pattern)| (image_type, Regex::new(&pattern).unwrap()))
        .collect()
});

static ALIAS_WITH_CYCLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{UNKNOWN_WITH_CYCLE}$")).unwrap());

/// A sortable image tag for a Rubin Science Platform image.
#[derive(Debug, Clone)]
pub struct RSPImageTag {
    /// The tag itself, unmodified.
    pub tag: String,

    /// Type (release series) of image identified by this tag.
    pub image_type: RSPImageType,

    /// Version information as a semantic version.
    pub version: Option<Version>,

    /// Version information about the RSP build as a counter.
    pub rsp_build_version: Option<u32>,

    /// XML schema version implemented by this image (only for T&S builds).
    pub cycle: Option<i32>,

    /// Human-readable display name.
    pub display_name: String,

    /// When the image was created, or as close as we can get to that.
    ///
    /// We try to derive this from the tag string. For daily or weekly tags
    /// (or experimentals in one of those formats) we can calculate this to
    /// within a day or a week, which is good enough for display purposes.
    pub date: Option<DateTime<Utc>>,
}

impl RSPImageTag {
    /// Create an alias tag.
    pub fn alias(tag: &str) -> Self {
        let (cycle, display_name) = match ALIAS_WITH_CYCLE.captures(tag) {
            Some(captures) => {
                let cycle_str = &captures["cycle"];
                let display = format!("{} (SAL Cycle {cycle_str})", title_case(&captures["tag"]));
                (cycle_str.parse().ok(), display)
            }
            None => (None, title_case(tag)),
        };
        RSPImageTag {
            tag: tag.to_string(),
            image_type: RSPImageType::Alias,
            version: None,
            rsp_build_version: None,
            cycle,
            display_name,
            date: None,
        }
    }

    /// Parse a tag string into an `RSPImageTag`.
    ///
    /// Anything that matches none of the known tag shapes becomes an unknown
    /// tag whose display name is the raw tag string.
    pub fn from_str(tag: &str) -> Self {
        let tag = if tag.is_empty() { DOCKER_DEFAULT_TAG } else { tag };
        for (image_type, regex) in TAG_REGEXES.iter() {
            if let Some(captures) = regex.captures(tag) {
                // It should be impossible for from_match to fail if the
                // regexes are constructed properly, but if it does, fall
                // back on treating this as an unknown tag rather than
                // crashing the lab controller.
                if let Some(parsed) = Self::from_match(*image_type, &captures, tag) {
                    return parsed;
                }
            }
        }
        RSPImageTag {
            tag: tag.to_string(),
            image_type: RSPImageType::Unknown,
            version: None,
            rsp_build_version: None,
            cycle: None,
            display_name: tag.to_string(),
            date: None,
        }
    }

    /// Compare two tags for sorting purposes.
    ///
    /// Tags of different image types are not comparable. Two tags of the
    /// same type compare by version, breaking ties with the RSP build
    /// version and then the semver build component; two tags without
    /// versions compare lexicographically by tag.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        if self.image_type != other.image_type {
            return None;
        }
        let (version, other_version) = match (&self.version, &other.version) {
            (Some(a), Some(b)) => (a, b),
            _ => return Some(self.tag.cmp(&other.tag)),
        };
        let rank = version.cmp_precedence(other_version);
        if rank != Ordering::Equal {
            return Some(rank);
        }

        // If two tags have the same version, next check the RSP build
        // version. A missing RSP build version sorts lower than any tag
        // with one, to preserve backwards compatibility.
        let rank = match (self.rsp_build_version, other.rsp_build_version) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b),
        };
        if rank != Ordering::Equal {
            return Some(rank);
        }

        // semver precedence ignores the build, but we want newer cycles (and
        // newer cycle builds) to sort ahead of older ones in otherwise
        // matching tags, and the cycle information is stored in the build.
        Some(version.build.as_str().cmp(other_version.build.as_str()))
    }

    fn from_match(image_type: RSPImageType, captures: &Captures<'_>, tag: &str) -> Option<Self> {
        let group = |name: &str| captures.name(name).map(|m| m.as_str().to_string());
        let rest = group("rest");
        let cycle = group("cycle");
        let cbuild = group("cbuild");
        let rsp_build_version: Option<u32> = match group("rspbuild") {
            Some(raw) => Some(raw.parse().ok()?),
            None => None,
        };

        // We can't do very much with unknown tags with a cycle, but we do
        // want to capture the cycle so that they survive cycle filtering.
        if image_type == RSPImageType::Unknown {
            let base = group("tag").unwrap_or_else(|| tag.to_string());
            let cycle_str = cycle?;
            return Some(RSPImageTag {
                tag: tag.to_string(),
                image_type,
                version: None,
                rsp_build_version,
                cycle: cycle_str.parse().ok(),
                display_name: format!("{base} (SAL Cycle {cycle_str})"),
                date: None,
            });
        }

        // Experimental tags are often exp_<legal-tag>, an experimental build
        // on top of another tag with additional information in the trailing
        // rest component. Parse the rest as a tag and inherit its fields; if
        // it isn't a valid tag it parses as unknown, whose display name is
        // the raw string, producing "Experimental <rest>".
        if image_type == RSPImageType::Experimental {
            let rest = rest.filter(|r| !r.is_empty())?;
            let subtag = Self::from_str(&rest);
            return Some(RSPImageTag {
                tag: tag.to_string(),
                image_type,
                version: subtag.version,
                rsp_build_version: subtag.rsp_build_version,
                cycle: subtag.cycle,
                display_name: format!("{image_type} {}", subtag.display_name),
                date: subtag.date,
            });
        }

        let build = determine_build(cycle.as_deref(), cbuild.as_deref(), rest.as_deref());
        let (version, mut display_name) = parse_version(image_type, captures)?;

        // Weekly and daily tags must encode a real calendar date; anything
        // else falls through to the unknown tag type.
        let date = calculate_date(captures);
        if captures.name("year").is_some() && date.is_none() {
            return None;
        }
        let version = Version {
            build: match &build {
                Some(build) => BuildMetadata::new(build).ok()?,
                None => BuildMetadata::EMPTY,
            },
            ..version
        };

        // If there is extra information, add it to the end of the display
        // name.
        if let Some(rsp_build) = rsp_build_version {
            display_name.push_str(&format!(" (RSP Build {rsp_build})"));
        }
        if let (Some(cycle), Some(cbuild)) = (&cycle, &cbuild) {
            display_name.push_str(&format!(" (SAL Cycle {cycle}, Build {cbuild})"));
        }
        if let Some(rest) = &rest {
            display_name.push_str(&format!(" [{rest}]"));
        }

        Some(RSPImageTag {
            tag: tag.to_string(),
            image_type,
            version: Some(version),
            rsp_build_version,
            cycle: match cycle {
                Some(cycle) => Some(cycle.parse().ok()?),
                None => None,
            },
            display_name,
            date,
        })
    }
}

impl PartialEq for RSPImageTag {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for RSPImageTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

/// Determine the build component of the semantic version.
fn determine_build(cycle: Option<&str>, cbuild: Option<&str>, rest: Option<&str>) -> Option<String> {
    // semver build components may only contain periods and alphanumerics, so
    // replace underscores with periods and then remove all other characters.
    static SANITIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w.]+").unwrap());
    let rest = rest
        .map(|r| SANITIZE.replace_all(&r.replace('_', "."), "").to_string())
        .filter(|r| !r.is_empty());
    match (cycle, rest) {
        (Some(cycle), Some(rest)) => Some(format!("c{cycle}.{}.{rest}", cbuild.unwrap_or_default())),
        (Some(cycle), None) => Some(format!("c{cycle}.{}", cbuild.unwrap_or_default())),
        (None, rest) => rest,
    }
}

/// Reconstruct the semantic version and base display name from a tag match.
fn parse_version(image_type: RSPImageType, captures: &Captures<'_>) -> Option<(Version, String)> {
    let mut display_name = image_type.to_string();
    let (major, minor, patch, pre) = match image_type {
        RSPImageType::Release | RSPImageType::Candidate => {
            let major = &captures["major"];
            let minor = &captures["minor"];
            let patch = captures.name("patch").map_or("0", |m| m.as_str());
            let pre = captures.name("pre").map(|m| m.as_str()).unwrap_or_default();
            display_name.push_str(&format!(" r{major}.{minor}.{patch}"));
            if !pre.is_empty() {
                display_name.push_str(&format!("-{pre}"));
            }
            (major.parse().ok()?, minor.parse().ok()?, patch.parse().ok()?, pre)
        }
        RSPImageType::Weekly => {
            let year = &captures["year"];
            let week = &captures["week"];
            display_name.push_str(&format!(" {year}_{week}"));
            (year.parse().ok()?, week.parse().ok()?, 0, "")
        }
        _ => {
            let year = &captures["year"];
            let month = &captures["month"];
            let day = &captures["day"];
            display_name.push_str(&format!(" {year}_{month}_{day}"));
            (year.parse().ok()?, month.parse().ok()?, day.parse().ok()?, "")
        }
    };
    let version = Version {
        major,
        minor,
        patch,
        pre: if pre.is_empty() {
            Prerelease::EMPTY
        } else {
            Prerelease::new(pre).ok()?
        },
        build: BuildMetadata::EMPTY,
    };
    Some((version, display_name))
}

/// Calculate the date when the image should have been created.
///
/// Weekly builds happen on Thursday, ISO day 4.
fn calculate_date(captures: &Captures<'_>) -> Option<DateTime<Utc>> {
    let year: i32 = captures.name("year")?.as_str().parse().ok()?;
    if let Some(week) = captures.name("week") {
        let week: u32 = week.as_str().parse().ok()?;
        let date = NaiveDate::from_isoywd_opt(year, week, Weekday::Thu)?;
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    let month: u32 = captures.name("month")?.as_str().parse().ok()?;
    let day: u32 = captures.name("day")?.as_str().parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Title-case an alias tag for display: underscores become spaces and each
/// word is capitalized.
fn title_case(tag: &str) -> String {
    tag.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hold and perform operations on a set of `RSPImageTag` objects.
pub struct RSPImageTagCollection {
    by_tag: BTreeMap<String, RSPImageTag>,
    by_type: HashMap<RSPImageType, Vec<RSPImageTag>>,
}

impl RSPImageTagCollection {
    pub fn new(tags: impl IntoIterator<Item = RSPImageTag>) -> Self {
        let mut by_tag = BTreeMap::new();
        let mut by_type: HashMap<RSPImageType, Vec<RSPImageTag>> = HashMap::new();
        for tag in tags {
            by_type.entry(tag.image_type).or_default().push(tag.clone());
            by_tag.insert(tag.tag.clone(), tag);
        }
        for bucket in by_type.values_mut() {
            bucket.sort_by(|a, b| b.compare(a).unwrap_or_else(|| b.tag.cmp(&a.tag)));
        }
        RSPImageTagCollection { by_tag, by_type }
    }

    /// Create a collection from tag strings.
    ///
    /// Tags named in `aliases` are treated as alias tags. If `cycle` is
    /// given, only tags with a matching cycle are added.
    pub fn from_tag_names(tag_names: &[String], aliases: &HashSet<String>, cycle: Option<i32>) -> Self {
        let tags = tag_names
            .iter()
            .map(|name| {
                if aliases.contains(name) {
                    RSPImageTag::alias(name)
                } else {
                    RSPImageTag::from_str(name)
                }
            })
            .filter(|tag| cycle.is_none() || tag.cycle == cycle);
        Self::new(tags)
    }

    /// Iterate over all tags in sorted order.
    pub fn all_tags(&self) -> impl Iterator<Item = &RSPImageTag> {
        RSPImageType::iter().flat_map(|image_type| self.by_type.get(&image_type).into_iter().flatten())
    }

    /// Look up a tag by tag name.
    pub fn tag_for_tag_name(&self, tag_name: &str) -> Option<&RSPImageTag> {
        self.by_tag.get(tag_name)
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Return a subset of the collection containing the given number of the
    /// newest releases, weeklies, and dailies, plus any tags named in
    /// `include` that are present.
    pub fn subset(&self, releases: usize, weeklies: usize, dailies: usize, include: &HashSet<String>) -> Self {
        let mut tags = Vec::new();
        for (image_type, count) in [
            (RSPImageType::Release, releases),
            (RSPImageType::Weekly, weeklies),
            (RSPImageType::Daily, dailies),
        ] {
            if let Some(bucket) = self.by_type.get(&image_type) {
                tags.extend(bucket.iter().take(count).cloned());
            }
        }
        tags.extend(include.iter().filter_map(|name| self.by_tag.get(name)).cloned());
        Self::new(tags)
    }

    /// Apply a filter policy and return the remaining tags.
    pub fn filter(&self, policy: &RSPImageFilterPolicy, age_basis: DateTime<Utc>) -> Vec<RSPImageTag> {
        let mut tags = Vec::new();
        for category in RSPImageType::iter() {
            let candidates = self.by_type.get(&category).map(Vec::as_slice).unwrap_or_default();
            let Some(category_policy) = policy.policy_for_category(category) else {
                tags.extend_from_slice(candidates);
                continue;
            };
            let cutoff_date = category_policy.age.map(|age| age_basis - age);
            let mut remainder = Vec::new();
            for tag in candidates {
                if let Some(number) = category_policy.number {
                    if remainder.len() >= number {
                        break;
                    }
                }
                if let (Some(date), Some(cutoff)) = (tag.date, cutoff_date) {
                    if date < cutoff {
                        continue;
                    }
                }
                if let (Some(version), Some(cutoff)) = (&tag.version, &category_policy.cutoff_version) {
                    if version.cmp_precedence(cutoff) == Ordering::Less {
                        continue;
                    }
                }
                remainder.push(tag.clone());
            }
            tags.extend(remainder);
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn parse(tag: &str) -> RSPImageTag {
        RSPImageTag::from_str(tag)
    }

    #[test]
    fn test_tag_ordering() {
        let one = parse("r21_0_1");
        let two = parse("r21_0_2");
        assert_eq!(one, one);
        assert!(one <= one);
        assert!(one >= one);
        assert_ne!(one, two);
        assert!(one < two);
        assert!(two >= one);

        let three = parse("d_2023_02_09");
        assert_eq!(three, three);
        assert_ne!(one, three);
        assert_eq!(one.compare(&three), None);

        let four = parse("d_2023_02_10_c0030.004");
        assert!(three < four);
        let five = parse("d_2023_02_10_c0031.004");
        assert!(four < five);
        let six = parse("d_2023_02_10_c0031.005");
        assert!(five < six);

        let exp_one = parse("exp_20230209");
        let exp_two = parse("exp_random");
        assert_eq!(exp_one, exp_one);
        assert_ne!(exp_one, exp_two);
        assert!(exp_one < exp_two);

        // RSP build versions break ties, with absence sorting low.
        let plain = parse("w_2077_44");
        let rsp19 = parse("w_2077_44_rsp19");
        let rsp20 = parse("w_2077_44_rsp20");
        assert!(plain < rsp19);
        assert!(rsp19 < rsp20);
    }

    #[test]
    fn test_alias() {
        let tag = RSPImageTag::alias("recommended");
        assert_eq!(tag.image_type, RSPImageType::Alias);
        assert_eq!(tag.version, None);
        assert_eq!(tag.cycle, None);
        assert_eq!(tag.display_name, "Recommended");

        // If there is a cycle, we should extract it.
        let tag = RSPImageTag::alias("latest_weekly_c0046");
        assert_eq!(tag.image_type, RSPImageType::Alias);
        assert_eq!(tag.cycle, Some(46));
        assert_eq!(tag.display_name, "Latest Weekly (SAL Cycle 0046)");
    }

    #[test]
    fn test_from_str() {
        struct Case {
            tag: &'static str,
            image_type: RSPImageType,
            display_name: &'static str,
            version: Option<&'static str>,
            cycle: Option<i32>,
        }
        let cases = [
            Case {
                tag: "r21_0_1",
                image_type: RSPImageType::Release,
                display_name: "Release r21.0.1",
                version: Some("21.0.1"),
                cycle: None,
            },
            Case {
                tag: "r22_0_0_rc1",
                image_type: RSPImageType::Candidate,
                display_name: "Release Candidate r22.0.0-rc1",
                version: Some("22.0.0-rc1"),
                cycle: None,
            },
            Case {
                tag: "w_2021_22",
                image_type: RSPImageType::Weekly,
                display_name: "Weekly 2021_22",
                version: Some("2021.22.0"),
                cycle: None,
            },
            Case {
                tag: "d_2021_05_27",
                image_type: RSPImageType::Daily,
                display_name: "Daily 2021_05_27",
                version: Some("2021.5.27"),
                cycle: None,
            },
            Case {
                tag: "r21_0_1_c0020.001",
                image_type: RSPImageType::Release,
                display_name: "Release r21.0.1 (SAL Cycle 0020, Build 001)",
                version: Some("21.0.1+c0020.001"),
                cycle: Some(20),
            },
            Case {
                tag: "r22_0_0_rc1_c0020.001",
                image_type: RSPImageType::Candidate,
                display_name: "Release Candidate r22.0.0-rc1 (SAL Cycle 0020, Build 001)",
                version: Some("22.0.0-rc1+c0020.001"),
                cycle: Some(20),
            },
            Case {
                tag: "w_2021_22_c0020.001",
                image_type: RSPImageType::Weekly,
                display_name: "Weekly 2021_22 (SAL Cycle 0020, Build 001)",
                version: Some("2021.22.0+c0020.001"),
                cycle: Some(20),
            },
            Case {
                tag: "r21_0_1_20210527",
                image_type: RSPImageType::Release,
                display_name: "Release r21.0.1 [20210527]",
                version: Some("21.0.1+20210527"),
                cycle: None,
            },
            Case {
                tag: "r21_0_1_c0020.001_20210527",
                image_type: RSPImageType::Release,
                display_name: "Release r21.0.1 (SAL Cycle 0020, Build 001) [20210527]",
                version: Some("21.0.1+c0020.001.20210527"),
                cycle: Some(20),
            },
            Case {
                tag: "w_2021_22_rsp19",
                image_type: RSPImageType::Weekly,
                display_name: "Weekly 2021_22 (RSP Build 19)",
                version: Some("2021.22.0"),
                cycle: None,
            },
            Case {
                tag: "r170",
                image_type: RSPImageType::Release,
                display_name: "Release r17.0.0",
                version: Some("17.0.0"),
                cycle: None,
            },
            Case {
                tag: "recommended",
                image_type: RSPImageType::Unknown,
                display_name: "recommended",
                version: None,
                cycle: None,
            },
            Case {
                tag: "exp_random",
                image_type: RSPImageType::Experimental,
                display_name: "Experimental random",
                version: None,
                cycle: None,
            },
            Case {
                tag: "exp_w_2021_22",
                image_type: RSPImageType::Experimental,
                display_name: "Experimental Weekly 2021_22",
                version: Some("2021.22.0"),
                cycle: None,
            },
            Case {
                tag: "exp_w_2021_22_c0020.001_foo",
                image_type: RSPImageType::Experimental,
                display_name: "Experimental Weekly 2021_22 (SAL Cycle 0020, Build 001) [foo]",
                version: Some("2021.22.0+c0020.001.foo"),
                cycle: Some(20),
            },
            Case {
                tag: "recommended_c0027",
                image_type: RSPImageType::Unknown,
                display_name: "recommended (SAL Cycle 0027)",
                version: None,
                cycle: Some(27),
            },
            Case {
                tag: "not_a_normal_format",
                image_type: RSPImageType::Unknown,
                display_name: "not_a_normal_format",
                version: None,
                cycle: None,
            },
            Case {
                tag: "MiXeD_CaSe_TaG",
                image_type: RSPImageType::Unknown,
                display_name: "MiXeD_CaSe_TaG",
                version: None,
                cycle: None,
            },
            Case {
                tag: "",
                image_type: RSPImageType::Unknown,
                display_name: "latest",
                version: None,
                cycle: None,
            },
        ];
        for case in cases {
            let parsed = parse(case.tag);
            assert_eq!(parsed.image_type, case.image_type, "type for {}", case.tag);
            assert_eq!(parsed.display_name, case.display_name, "display for {}", case.tag);
            let version = case.version.map(|v| Version::parse(v).unwrap());
            assert_eq!(parsed.version, version, "version for {}", case.tag);
            assert_eq!(parsed.cycle, case.cycle, "cycle for {}", case.tag);
            if !case.tag.is_empty() {
                assert_eq!(parsed.tag, case.tag);
            } else {
                assert_eq!(parsed.tag, "latest");
            }
        }
    }

    #[test]
    fn test_dates() {
        let weekly = parse("w_2077_46");
        // ISO week 46 of 2077 starts Monday November 15, so Thursday is the
        // 18th.
        assert_eq!(weekly.date, Some(Utc.with_ymd_and_hms(2077, 11, 18, 0, 0, 0).unwrap()));
        let daily = parse("d_2077_10_23");
        assert_eq!(daily.date, Some(Utc.with_ymd_and_hms(2077, 10, 23, 0, 0, 0).unwrap()));
        let experimental = parse("exp_d_2077_10_23");
        assert_eq!(experimental.date, daily.date);
        assert_eq!(parse("r21_0_1").date, None);

        // Invalid calendar data degrades to an unknown tag.
        assert_eq!(parse("w_2021_99").image_type, RSPImageType::Unknown);
        assert_eq!(parse("d_2021_13_40").image_type, RSPImageType::Unknown);
    }

    #[test]
    fn test_collection() {
        // This tag list must be kept in expected sorted order.
        let tags: Vec<String> = [
            "r21_0_1",
            "r20_0_1_c0027.001",
            "w_2077_46",
            "w_2077_45",
            "w_2077_44",
            "w_2077_43",
            "w_2077_42",
            "w_2077_40_c0027.001",
            "w_2077_40_c0026.001",
            "d_2077_10_21",
            "d_2077_10_20",
            "r22_0_0_rc1",
            "exp_w_2021_22",
            "recommended_c0027",
            "recommended",
        ]
        .iter()
        .map(|t| t.to_string())
        .collect();
        let mut shuffled = tags.clone();
        shuffled.reverse();

        let collection = RSPImageTagCollection::from_tag_names(&shuffled, &HashSet::new(), None);
        let seen: Vec<_> = collection.all_tags().map(|t| t.tag.clone()).collect();
        assert_eq!(seen, tags);
        assert!(collection.tag_for_tag_name("w_2077_46").is_some());
        assert!(collection.tag_for_tag_name("w_2080_01").is_none());

        // Filter by cycle.
        let collection = RSPImageTagCollection::from_tag_names(&shuffled, &HashSet::new(), Some(27));
        let seen: Vec<_> = collection.all_tags().map(|t| t.tag.clone()).collect();
        assert_eq!(seen, vec!["r20_0_1_c0027.001", "w_2077_40_c0027.001", "recommended_c0027"]);

        // Alias tag identification.
        let recommended: HashSet<String> =
            ["recommended", "recommended_c0027"].iter().map(|t| t.to_string()).collect();
        let collection = RSPImageTagCollection::from_tag_names(&shuffled, &recommended, None);
        let aliases: HashSet<String> = collection
            .all_tags()
            .filter(|t| t.image_type == RSPImageType::Alias)
            .map(|t| t.tag.clone())
            .collect();
        assert_eq!(aliases, recommended);
        assert_eq!(collection.all_tags().next().unwrap().tag, "recommended_c0027");

        // Subsetting.
        let subset = collection.subset(1, 3, 1, &HashSet::new());
        let seen: Vec<_> = subset.all_tags().map(|t| t.tag.clone()).collect();
        assert_eq!(seen, vec!["r21_0_1", "w_2077_46", "w_2077_45", "w_2077_44", "d_2077_10_21"]);
        let include: HashSet<String> = ["recommended".to_string()].into_iter().collect();
        let subset = collection.subset(1, 3, 1, &include);
        let seen: Vec<_> = subset.all_tags().map(|t| t.tag.clone()).collect();
        assert_eq!(
            seen,
            vec!["recommended", "r21_0_1", "w_2077_46", "w_2077_45", "w_2077_44", "d_2077_10_21"]
        );
        let subset = subset.subset(0, 0, 1, &HashSet::new());
        let seen: Vec<_> = subset.all_tags().map(|t| t.tag.clone()).collect();
        assert_eq!(seen, vec!["d_2077_10_21"]);
    }

    #[test]
    fn test_parse_idempotence() {
        for tag in ["r21_0_1", "w_2021_22_c0020.001", "exp_w_2021_22", "whatever", "d_2021_05_27_rsp19"] {
            assert_eq!(RSPImageTag::from_str(tag).tag, tag);
        }
    }
}
