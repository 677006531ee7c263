//! One-step navigation over the host's device registry.

use std::fmt::Debug;

use crate::Error;

/// Device registry property read while describing the tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// Human-friendly name, usually assigned by the driver's INF.
    FriendlyName,

    /// Generic device description.
    Description,

    /// Driver key, used to match a hub port with its registry node.
    DriverKey,
}

/// A device tree that can only be navigated one step at a time.
///
/// Navigation methods return `Ok(None)` when the requested relative does not
/// exist and `Err` when the query itself failed. [`property`][Self::property]
/// follows the same convention: `Ok(None)` means the node has no such value.
pub trait DeviceRegistry {
    /// Opaque node handle.
    type Node: Copy + Eq + Debug;

    /// The root of the whole tree.
    fn root(&self) -> Result<Self::Node, Error>;

    fn first_child(&self, node: Self::Node) -> Result<Option<Self::Node>, Error>;

    fn next_sibling(&self, node: Self::Node) -> Result<Option<Self::Node>, Error>;

    fn parent(&self, node: Self::Node) -> Result<Option<Self::Node>, Error>;

    fn property(&self, node: Self::Node, kind: PropertyKind) -> Result<Option<String>, Error>;
}
