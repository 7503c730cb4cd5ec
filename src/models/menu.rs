//! Internal models returned by image service methods.

use serde_derive::Serialize;

/// A single spawnable image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuImage {
    /// Docker reference.
    pub reference: String,

    /// Human-readable name.
    pub name: String,
}

/// All available spawnable images.
#[derive(Debug, Clone, Default)]
pub struct MenuImages {
    /// Images that should appear as regular menu choices.
    pub menu: Vec<MenuImage>,

    /// Extra images to populate the dropdown.
    pub dropdown: Vec<MenuImage>,
}
