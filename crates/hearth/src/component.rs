use indexmap::IndexMap;

use serde::{Deserialize, Serialize};

use serde_json::{Map, Value};

use crate::error::ErrorKind;

/// An error produced while navigating the component tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human-readable context.
    pub message: String,
}

impl TreeError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for TreeError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for TreeError {}

/// A named node in the device's capability tree.
///
/// A component declares a set of traits and carries their state; its
/// children live under `components`, where a slot holds either a single
/// component or an array of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Names of the traits this component declares.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<String>,
    /// Current state, namespaced by trait name.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub state: Map<String, Value>,
    /// Child components.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub components: IndexMap<String, ComponentNode>,
}

impl Component {
    /// Creates a [`Component`] declaring the given traits, with empty state
    /// and no children.
    #[must_use]
    pub fn with_traits(traits: Vec<String>) -> Self {
        Self {
            traits,
            state: Map::new(),
            components: IndexMap::new(),
        }
    }

    /// Returns whether the component declares the given trait.
    #[must_use]
    pub fn has_trait(&self, name: &str) -> bool {
        self.traits.iter().any(|t| t == name)
    }
}

/// A child slot of a component: a single component or an array of them.
///
/// Array slots are addressed with `[i]` in dotted paths,
/// e.g. `outlets[2].switch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentNode {
    /// A single child component.
    Single(Component),
    /// An array of child components.
    Array(Vec<Component>),
}

/// The device's capability tree: the top-level components and everything
/// below them.
///
/// Components are addressed by dotted paths; `.` separates levels and `[i]`
/// selects an item of an array slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentTree {
    roots: IndexMap<String, ComponentNode>,
}

#[derive(Debug)]
struct PathSegment<'a> {
    name: &'a str,
    index: Option<usize>,
}

fn parse_segment<'a>(part: &'a str, walked: &str) -> Result<PathSegment<'a>, TreeError> {
    let (name, rest) = match part.find('[') {
        Some(at) => (&part[..at], Some(&part[at + 1..])),
        None => (part, None),
    };
    if name.is_empty() {
        return Err(TreeError::new(
            ErrorKind::PropertyMissing,
            format!("Empty path element at '{walked}'"),
        ));
    }
    let index = match rest {
        None => None,
        Some(rest) => {
            let Some(digits) = rest.strip_suffix(']') else {
                return Err(TreeError::new(
                    ErrorKind::PropertyMissing,
                    format!("Invalid array element syntax '{part}'"),
                ));
            };
            let digits = digits.trim();
            match digits.parse::<usize>() {
                Ok(index) => Some(index),
                Err(_) => {
                    return Err(TreeError::new(
                        ErrorKind::InvalidPropValue,
                        format!("Invalid array index '{digits}'"),
                    ));
                }
            }
        }
    };
    Ok(PathSegment { name, index })
}

fn missing(name: &str, walked: &str) -> TreeError {
    TreeError::new(
        ErrorKind::PropertyMissing,
        format!("Component '{name}' does not exist at '{walked}'"),
    )
}

fn element(walked: &str, name: &str) -> String {
    if walked.is_empty() {
        name.to_owned()
    } else {
        format!("{walked}.{name}")
    }
}

impl ComponentTree {
    /// Returns whether the tree has no components at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Returns the name of the first top-level component, when one exists.
    #[must_use]
    pub fn first_root(&self) -> Option<&str> {
        self.roots.keys().next().map(String::as_str)
    }

    /// Returns the top-level component slots.
    #[must_use]
    pub fn roots(&self) -> &IndexMap<String, ComponentNode> {
        &self.roots
    }

    /// Returns the top-level component slots mutably.
    pub fn roots_mut(&mut self) -> &mut IndexMap<String, ComponentNode> {
        &mut self.roots
    }

    /// Returns the component at the given dotted path.
    ///
    /// # Errors
    ///
    /// Fails with `propertyMissing` when a path element does not exist or
    /// has invalid syntax, with `invalidPropValue` on a malformed array
    /// index, and with `typeMismatch` when an array slot is addressed
    /// without an index or vice versa.
    pub fn find(&self, path: &str) -> Result<&Component, TreeError> {
        let mut current: Option<&Component> = None;
        let mut walked = String::new();
        for part in path.split('.') {
            let segment = parse_segment(part, &walked)?;
            let children = match current {
                None => &self.roots,
                Some(component) => &component.components,
            };
            let node = children
                .get(segment.name)
                .ok_or_else(|| missing(segment.name, &walked))?;
            current = Some(resolve(node, &segment, &walked)?);
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(part);
        }
        // `split` yields at least one part, so an empty path already failed
        // above on its empty first element.
        current.ok_or_else(|| TreeError::new(ErrorKind::PropertyMissing, "Empty component path"))
    }

    /// Returns the component at the given dotted path mutably.
    ///
    /// # Errors
    ///
    /// Same failures as [`ComponentTree::find`].
    pub fn find_mut(&mut self, path: &str) -> Result<&mut Component, TreeError> {
        let mut walked = String::new();
        let mut parts = path.split('.');
        // `split` yields at least one part, so an empty path already fails
        // below on its empty first element.
        let first = parts.next().unwrap_or_default();
        let segment = parse_segment(first, &walked)?;
        let node = self
            .roots
            .get_mut(segment.name)
            .ok_or_else(|| missing(segment.name, &walked))?;
        let mut current = resolve_mut(node, &segment, &walked)?;
        walked.push_str(first);
        for part in parts {
            let segment = parse_segment(part, &walked)?;
            let node = current
                .components
                .get_mut(segment.name)
                .ok_or_else(|| missing(segment.name, &walked))?;
            current = resolve_mut(node, &segment, &walked)?;
            walked.push('.');
            walked.push_str(part);
        }
        Ok(current)
    }
}

fn resolve<'a>(
    node: &'a ComponentNode,
    segment: &PathSegment,
    walked: &str,
) -> Result<&'a Component, TreeError> {
    match (node, segment.index) {
        (ComponentNode::Single(component), None) => Ok(component),
        (ComponentNode::Single(_), Some(_)) => Err(TreeError::new(
            ErrorKind::TypeMismatch,
            format!("Element '{}' is not an array", element(walked, segment.name)),
        )),
        (ComponentNode::Array(_), None) => Err(TreeError::new(
            ErrorKind::TypeMismatch,
            format!("Element '{}' is an array", element(walked, segment.name)),
        )),
        (ComponentNode::Array(items), Some(index)) => items.get(index).ok_or_else(|| {
            TreeError::new(
                ErrorKind::PropertyMissing,
                format!(
                    "Element '{}' does not contain item #{index}",
                    element(walked, segment.name)
                ),
            )
        }),
    }
}

fn resolve_mut<'a>(
    node: &'a mut ComponentNode,
    segment: &PathSegment,
    walked: &str,
) -> Result<&'a mut Component, TreeError> {
    match (node, segment.index) {
        (ComponentNode::Single(component), None) => Ok(component),
        (ComponentNode::Single(_), Some(_)) => Err(TreeError::new(
            ErrorKind::TypeMismatch,
            format!("Element '{}' is not an array", element(walked, segment.name)),
        )),
        (ComponentNode::Array(_), None) => Err(TreeError::new(
            ErrorKind::TypeMismatch,
            format!("Element '{}' is an array", element(walked, segment.name)),
        )),
        (ComponentNode::Array(items), Some(index)) => {
            let missing = items.len() <= index;
            if missing {
                return Err(TreeError::new(
                    ErrorKind::PropertyMissing,
                    format!(
                        "Element '{}' does not contain item #{index}",
                        element(walked, segment.name)
                    ),
                ));
            }
            Ok(&mut items[index])
        }
    }
}
