//! Images and image collections for Docker image analysis.
//!
//! An `RSPImage` is a tag plus registry coordinates and cluster state. The
//! collection handles the alias-resolution bookkeeping: within a collection
//! there is at most one concrete image per digest, and every alias tag with
//! that digest points at it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use itertools::Itertools;

use crate::models::tag::{RSPImageTag, RSPImageType};

/// A Rubin Science Platform image with registry coordinates and the cluster
/// state we know about it.
#[derive(Debug, Clone, PartialEq)]
pub struct RSPImage {
    /// The tag itself, unmodified.
    pub tag: String,

    /// Type (release series) of image identified by this tag.
    pub image_type: RSPImageType,

    /// Version information as a semantic version.
    pub version: Option<semver::Version>,

    /// Version information about the RSP build as a counter.
    pub rsp_build_version: Option<u32>,

    /// XML schema version implemented by this image (only for T&S builds).
    pub cycle: Option<i32>,

    /// Human-readable display name.
    pub display_name: String,

    /// When the image was created, as close as the tag tells us.
    pub date: Option<DateTime<Utc>>,

    /// Hostname and optional port of the registry holding the image.
    pub registry: String,

    /// Repository path within the registry, without tag or digest.
    pub repository: String,

    /// Content-addressed digest of the image manifest.
    pub digest: String,

    /// Size of the image in bytes, if reported by a node.
    pub size: Option<i64>,

    /// Tag names known to point at this image.
    pub aliases: BTreeSet<String>,

    /// If this image is an alias, the tag of its concrete target.
    pub alias_target: Option<String>,

    /// Names of the nodes on which the digest is known to be cached.
    pub nodes: BTreeSet<String>,
}

impl RSPImage {
    /// Construct an image from a parsed tag and registry coordinates.
    pub fn from_tag(registry: &str, repository: &str, tag: RSPImageTag, digest: &str) -> Self {
        RSPImage {
            tag: tag.tag,
            image_type: tag.image_type,
            version: tag.version,
            rsp_build_version: tag.rsp_build_version,
            cycle: tag.cycle,
            display_name: tag.display_name,
            date: tag.date,
            registry: registry.to_string(),
            repository: repository.to_string(),
            digest: digest.to_string(),
            size: None,
            aliases: BTreeSet::new(),
            alias_target: None,
            nodes: BTreeSet::new(),
        }
    }

    /// Docker reference for this image.
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    /// Docker reference for this image, pinned to its digest.
    pub fn reference_with_digest(&self) -> String {
        format!("{}/{}:{}@{}", self.registry, self.repository, self.tag, self.digest)
    }

    /// Whether this tag could be an alias whose target is not yet known.
    pub fn is_possible_alias(&self) -> bool {
        matches!(self.image_type, RSPImageType::Alias | RSPImageType::Unknown)
    }

    /// Whether this image is cached on every node in the given set.
    pub fn is_prepulled(&self, nodes: &BTreeSet<String>) -> bool {
        nodes.is_subset(&self.nodes)
    }

    /// Compare two images of the same type, newest first.
    pub(crate) fn compare_within_type(&self, other: &Self) -> Ordering {
        let (version, other_version) = match (&self.version, &other.version) {
            (Some(a), Some(b)) => (a, b),
            _ => return other.tag.cmp(&self.tag),
        };
        other_version
            .cmp_precedence(version)
            .then_with(|| match (self.rsp_build_version, other.rsp_build_version) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => b.cmp(&a),
            })
            .then_with(|| other_version.build.as_str().cmp(version.build.as_str()))
    }

    /// Resolve this image as an alias of a concrete target.
    ///
    /// Promotes unknown tags to aliases, inherits the target's cycle, date,
    /// size, and node presence, and rewrites the display name to include the
    /// target's.
    fn resolve_alias(&mut self, target: &RSPImage) {
        self.image_type = RSPImageType::Alias;
        self.alias_target = Some(target.tag.clone());
        self.cycle = target.cycle;
        self.date = target.date;
        self.size = target.size;
        self.nodes = target.nodes.clone();
        let base = RSPImageTag::alias(&self.tag).display_name;
        let base = match base.find(" (") {
            Some(index) => base[..index].to_string(),
            None => base,
        };
        self.display_name = format!("{base} ({})", flatten_display_name(&target.display_name));
    }
}

/// Flatten a trailing parenthetical so a display name can nest inside
/// another parenthetical: `A (B)` becomes `A, B`.
fn flatten_display_name(display_name: &str) -> String {
    match display_name.find(" (") {
        Some(index) if display_name.ends_with(')') => {
            format!("{}, {}", &display_name[..index], &display_name[index + 2..display_name.len() - 1])
        }
        _ => display_name.to_string(),
    }
}

/// Order images the way menus show them: by image type, then descending
/// within a type.
fn display_order(a: &RSPImage, b: &RSPImage) -> Ordering {
    a.image_type.cmp(&b.image_type).then_with(|| a.compare_within_type(b))
}

/// A mutable collection of images, indexed by tag and digest.
#[derive(Debug, Default, Clone)]
pub struct RSPImageCollection {
    by_tag: BTreeMap<String, RSPImage>,
    // Tags per digest, in insertion order.
    by_digest: HashMap<String, Vec<String>>,
    cycle: Option<i32>,
}

impl RSPImageCollection {
    pub fn new(images: impl IntoIterator<Item = RSPImage>, cycle: Option<i32>) -> Self {
        let mut collection = RSPImageCollection {
            by_tag: BTreeMap::new(),
            by_digest: HashMap::new(),
            cycle,
        };
        for image in images {
            collection.add(image);
        }
        collection
    }

    /// Add an image, re-deriving alias relationships for its digest.
    ///
    /// Every image sharing the digest is visited exactly once and its
    /// `alias_target` and `aliases` are recomputed from the group, so alias
    /// cycles cannot occur.
    pub fn add(&mut self, image: RSPImage) {
        if let Some(cycle) = self.cycle {
            if image.cycle != Some(cycle) {
                return;
            }
        }
        let digest = image.digest.clone();
        let bucket = self.by_digest.entry(digest.clone()).or_default();
        if !bucket.contains(&image.tag) {
            bucket.push(image.tag.clone());
        }
        self.by_tag.insert(image.tag.clone(), image);
        self.relink_digest(&digest);
    }

    fn relink_digest(&mut self, digest: &str) {
        let Some(members) = self.by_digest.get(digest).cloned() else {
            return;
        };

        // Pick the concrete image all aliases should point at: the best by
        // menu order among non-alias members.
        let concrete = members
            .iter()
            .filter_map(|tag| self.by_tag.get(tag))
            .filter(|image| !image.is_possible_alias())
            .sorted_by(|a, b| display_order(a, b))
            .next()
            .cloned();

        for tag in &members {
            let others: BTreeSet<String> =
                members.iter().filter(|other| *other != tag).cloned().collect();
            let Some(member) = self.by_tag.get_mut(tag) else {
                continue;
            };
            if member.is_possible_alias() {
                if let Some(target) = &concrete {
                    member.resolve_alias(target);
                }
            }
            let mut aliases: BTreeSet<String> = member.aliases.union(&others).cloned().collect();
            aliases.remove(&member.tag);
            if let Some(target) = &member.alias_target {
                aliases.remove(target);
            }
            member.aliases = aliases;
        }
    }

    /// Iterate over all images in menu order, with optional hiding.
    ///
    /// `hide_resolved_aliases` drops aliases whose target is present in the
    /// collection; `hide_aliased` drops concrete images that some member of
    /// the collection points at.
    pub fn all_images(&self, hide_resolved_aliases: bool, hide_aliased: bool) -> Vec<&RSPImage> {
        let targeted: HashSet<&String> =
            self.by_tag.values().filter_map(|image| image.alias_target.as_ref()).collect();
        self.by_tag
            .values()
            .filter(|image| {
                if hide_resolved_aliases {
                    if let Some(target) = &image.alias_target {
                        if self.by_tag.contains_key(target) {
                            return false;
                        }
                    }
                }
                if hide_aliased && !image.is_possible_alias() && targeted.contains(&image.tag) {
                    return false;
                }
                true
            })
            .sorted_by(|a, b| display_order(a, b))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    pub fn image_for_tag_name(&self, tag_name: &str) -> Option<&RSPImage> {
        self.by_tag.get(tag_name)
    }

    /// Look up an image by digest, always preferring the concrete image over
    /// any of its aliases.
    pub fn image_for_digest(&self, digest: &str) -> Option<&RSPImage> {
        let members = self.by_digest.get(digest)?;
        members
            .iter()
            .filter_map(|tag| self.by_tag.get(tag))
            .find(|image| !image.is_possible_alias())
            .or_else(|| members.first().and_then(|tag| self.by_tag.get(tag)))
    }

    /// The newest image of the given type, if any.
    pub fn latest(&self, image_type: RSPImageType) -> Option<&RSPImage> {
        self.by_tag
            .values()
            .filter(|image| image.image_type == image_type)
            .sorted_by(|a, b| display_order(a, b))
            .next()
    }

    /// Return a subset containing the given number of the newest releases,
    /// weeklies, and dailies, plus any tags named in `include`.
    pub fn subset(&self, releases: usize, weeklies: usize, dailies: usize, include: &HashSet<String>) -> Self {
        let mut images = Vec::new();
        for (image_type, count) in [
            (RSPImageType::Release, releases),
            (RSPImageType::Weekly, weeklies),
            (RSPImageType::Daily, dailies),
        ] {
            images.extend(
                self.by_tag
                    .values()
                    .filter(|image| image.image_type == image_type)
                    .sorted_by(|a, b| display_order(a, b))
                    .take(count)
                    .cloned(),
            );
        }
        images.extend(include.iter().filter_map(|tag| self.by_tag.get(tag)).cloned());
        Self::new(images, None)
    }

    /// Return the images in self whose digests are not in `other`, one per
    /// digest, preferring concrete images over aliases.
    pub fn subtract(&self, other: &RSPImageCollection) -> Self {
        let images = self
            .by_digest
            .keys()
            .filter(|digest| !other.by_digest.contains_key(*digest))
            .filter_map(|digest| self.image_for_digest(digest))
            .cloned()
            .collect::<Vec<_>>();
        Self::new(images, None)
    }

    /// Record that a digest has been seen on a node, updating the concrete
    /// image and every alias that points at it.
    pub fn mark_image_seen_on_node(&mut self, digest: &str, node: &str, size: Option<i64>) {
        let Some(members) = self.by_digest.get(digest).cloned() else {
            return;
        };
        for tag in members {
            if let Some(image) = self.by_tag.get_mut(&tag) {
                image.nodes.insert(node.to_string());
                if size.is_some() {
                    image.size = size;
                }
            }
        }
    }

    /// All tag names present in the collection.
    pub fn tag_names(&self) -> impl Iterator<Item = &String> {
        self.by_tag.keys()
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }
}
