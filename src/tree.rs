//! Iterative walks over a [`DeviceRegistry`].
//!
//! The registry only offers first-child / next-sibling / parent navigation, so
//! every walk here is a loop over an explicit stack rather than recursion.
//! Each loop is bounded by [`LOOP_SANITY_LIMIT`] to survive malformed or
//! cyclic registry data.

use log::{debug, error, trace};

use crate::{
    registry::{DeviceRegistry, PropertyKind},
    Error, ErrorKind,
};

/// Maximum number of steps a single walk loop may take.
pub const LOOP_SANITY_LIMIT: u32 = 10_000;

/// A registry node that had a usable label.
///
/// `node` and `parent_node` are synthetic indices assigned during one walk.
/// They exist so a flat output format can express the composite-device
/// hierarchy below one USB address: `node == 0` is the device itself,
/// `parent_node == 0` means "directly below the device".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitedNode {
    /// Tree depth.
    pub level: u32,

    /// Hub port the device is attached to, 0 for sub-nodes.
    pub port: u32,

    /// Friendly name or description.
    pub display: String,

    /// USB address of the device this node belongs to.
    pub device_address: u16,

    /// USB address of the parent hub, 0 when attached to the root hub.
    pub parent_address: u16,

    pub node: u32,
    pub parent_node: u32,
}

/// Label for a node: its friendly name, falling back to its description.
fn node_label<R: DeviceRegistry>(registry: &R, node: R::Node) -> Option<String> {
    match registry.property(node, PropertyKind::FriendlyName) {
        Ok(Some(name)) => return Some(name),
        Ok(None) => {}
        Err(e) => trace!("No friendly name for {node:?}: {e}"),
    }

    match registry.property(node, PropertyKind::Description) {
        Ok(desc) => desc,
        Err(e) => {
            debug!("No description for {node:?}: {e}");
            None
        }
    }
}

fn sanity_check(steps: &mut u32, what: &'static str) -> Result<(), Error> {
    *steps += 1;
    if *steps > LOOP_SANITY_LIMIT {
        error!("Sanity check failed in {what}");
        return Err(Error::new(
            ErrorKind::SanityLimit,
            "device tree walk exceeded the iteration limit",
        ));
    }
    Ok(())
}

/// Visit every labelled descendant of `start`, depth first.
///
/// `start` itself is not visited. Children of `start` are reported at
/// `indent + 1`. Every visited node receives a fresh index (starting at 1), and
/// its `parent_node` is the index of the nearest visited ancestor below
/// `start`, or 0. Nodes without a label are skipped but their children are
/// still walked.
///
/// Returns an error if a sibling query fails or the walk takes more than
/// [`LOOP_SANITY_LIMIT`] steps. Nodes visited before the error have already
/// been passed to `visit`.
pub fn walk_children<R: DeviceRegistry>(
    registry: &R,
    start: R::Node,
    indent: u32,
    device_address: u16,
    visit: &mut dyn FnMut(&VisitedNode),
) -> Result<(), Error> {
    let mut current = match registry.first_child(start) {
        Ok(Some(child)) => child,
        Ok(None) => return Ok(()),
        Err(e) => {
            debug!("Failed to get first child of {start:?}: {e}");
            return Ok(());
        }
    };

    let mut level = indent + 1;
    let mut parents: Vec<u32> = vec![0];
    let mut next_node: u32 = 1;
    let mut steps = 0;

    loop {
        sanity_check(&mut steps, "walk_children")?;

        let parent_node = parents.last().copied().unwrap_or(0);
        let emitted = match node_label(registry, current) {
            Some(display) if !display.is_empty() => {
                visit(&VisitedNode {
                    level,
                    port: 0,
                    display,
                    device_address,
                    parent_address: device_address,
                    node: next_node,
                    parent_node,
                });
                true
            }
            _ => false,
        };

        let child = registry.first_child(current).unwrap_or_else(|e| {
            debug!("Failed to get first child of {current:?}: {e}");
            None
        });

        if let Some(child) = child {
            current = child;
            level += 1;
            parents.push(if emitted { next_node } else { parent_node });
            next_node += 1;
            continue;
        }

        // Leaf: move across, or climb until there is a sibling. Climbing back
        // to `start` ends the walk.
        loop {
            if let Some(sibling) = registry.next_sibling(current).map_err(Error::log_error)? {
                current = sibling;
                next_node += 1;
                break;
            }

            let up = registry.parent(current).unwrap_or_else(|e| {
                debug!("Failed to get parent of {current:?}: {e}");
                None
            });

            match up {
                Some(up) => {
                    current = up;
                    level -= 1;
                    parents.pop();
                    if up == start || level <= indent {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }
}

/// Find the node whose driver key matches `driver_key` (case-insensitive).
///
/// Searches the whole registry from [`DeviceRegistry::root`]. Nodes without a
/// driver key are skipped; any other property error aborts the search.
pub fn find_by_driver_key<R: DeviceRegistry>(
    registry: &R,
    driver_key: &str,
) -> Result<Option<R::Node>, Error> {
    let mut current = registry.root()?;
    let mut outer = 0;

    loop {
        sanity_check(&mut outer, "find_by_driver_key")?;

        match registry.property(current, PropertyKind::DriverKey) {
            Ok(Some(key)) if key.eq_ignore_ascii_case(driver_key) => return Ok(Some(current)),
            Ok(_) => {}
            Err(e) => return Err(e.log_error()),
        }

        if let Ok(Some(child)) = registry.first_child(current) {
            current = child;
            continue;
        }

        let mut inner = 0;
        loop {
            sanity_check(&mut inner, "find_by_driver_key ascent")?;

            if let Some(sibling) = registry.next_sibling(current).map_err(Error::log_error)? {
                current = sibling;
                break;
            }

            match registry.parent(current) {
                Ok(Some(up)) => current = up,
                _ => return Ok(None),
            }
        }
    }
}

/// Describe the device attached to a hub port.
///
/// Looks up the registry node for `driver_key` and reports its description as
/// a node with index 0. With `include_children` the node's descendants (the
/// functions of a composite device) follow, numbered by [`walk_children`].
///
/// Returns `Ok(false)` if no node has that driver key.
#[allow(clippy::too_many_arguments)]
pub fn describe_device<R: DeviceRegistry>(
    registry: &R,
    driver_key: &str,
    port: u32,
    level: u32,
    include_children: bool,
    device_address: u16,
    parent_address: u16,
    visit: &mut dyn FnMut(&VisitedNode),
) -> Result<bool, Error> {
    let Some(node) = find_by_driver_key(registry, driver_key)? else {
        debug!("No registry node with driver key {driver_key:?}");
        return Ok(false);
    };

    if let Ok(Some(display)) = registry.property(node, PropertyKind::Description) {
        visit(&VisitedNode {
            level,
            port,
            display,
            device_address,
            parent_address,
            node: 0,
            parent_node: 0,
        });

        if include_children {
            walk_children(registry, node, level, device_address, visit)?;
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRegistry;

    fn collect(registry: &MockRegistry, start: usize) -> (Vec<VisitedNode>, Result<(), Error>) {
        let mut out = Vec::new();
        let r = walk_children(registry, start, 1, 7, &mut |n| out.push(n.clone()));
        (out, r)
    }

    /// root
    /// └── dev (1)
    ///     ├── a (2)
    ///     │   ├── a1 (3)
    ///     │   └── a2 (4)
    ///     └── b (5)
    ///         └── b1 (6)
    fn composite() -> MockRegistry {
        let mut r = MockRegistry::new();
        let dev = r.add(0, "USB Composite Device");
        let a = r.add(dev, "USB Input Device");
        r.add(a, "HID Keyboard");
        r.add(a, "HID Consumer Control");
        let b = r.add(dev, "USB Audio");
        r.add(b, "Speakers");
        r
    }

    #[test]
    fn walk_visits_every_node_in_preorder() {
        let r = composite();
        let (nodes, res) = collect(&r, 1);
        res.unwrap();

        let summary: Vec<(u32, &str, u32, u32)> = nodes
            .iter()
            .map(|n| (n.level, n.display.as_str(), n.node, n.parent_node))
            .collect();
        assert_eq!(
            summary,
            vec![
                (2, "USB Input Device", 1, 0),
                (3, "HID Keyboard", 2, 1),
                (3, "HID Consumer Control", 3, 1),
                (2, "USB Audio", 4, 0),
                (3, "Speakers", 5, 4),
            ]
        );
        assert!(nodes.iter().all(|n| n.port == 0));
        assert!(nodes
            .iter()
            .all(|n| n.device_address == 7 && n.parent_address == 7));
    }

    #[test]
    fn walk_of_leaf_visits_nothing() {
        let r = composite();
        let (nodes, res) = collect(&r, 3);
        res.unwrap();
        assert!(nodes.is_empty());
    }

    #[test]
    fn walk_stops_at_start_node() {
        // `b` has a sibling after `dev`'s subtree; it must not be visited.
        let mut r = composite();
        r.add(0, "Unrelated Device");
        let (nodes, res) = collect(&r, 1);
        res.unwrap();
        assert!(nodes.iter().all(|n| n.display != "Unrelated Device"));
        assert_eq!(nodes.len(), 5);
    }

    #[test]
    fn node_indices_increase_and_parents_are_earlier() {
        let mut r = composite();
        // deeper nesting to exercise the stack
        let c = r.add(5, "Level 3");
        let d = r.add(c, "Level 4");
        r.add(d, "Level 5");
        r.add(c, "Level 4 sibling");

        let (nodes, res) = collect(&r, 1);
        res.unwrap();

        let mut seen = vec![0];
        let mut last = 0;
        for n in &nodes {
            assert!(n.node > last, "indices must increase: {nodes:?}");
            assert!(seen.contains(&n.parent_node), "forward reference in {n:?}");
            last = n.node;
            seen.push(n.node);
        }
    }

    #[test]
    fn unlabelled_nodes_are_skipped_but_walked() {
        let mut r = MockRegistry::new();
        let dev = r.add(0, "Composite");
        let hidden = r.add(dev, "");
        r.add(hidden, "Visible Child");
        let unnamed = r.add_unnamed(dev);
        r.add(unnamed, "Grandchild");

        let (nodes, res) = collect(&r, dev);
        res.unwrap();

        let labels: Vec<&str> = nodes.iter().map(|n| n.display.as_str()).collect();
        assert_eq!(labels, vec!["Visible Child", "Grandchild"]);
        // children of skipped nodes attach to the nearest visited ancestor
        assert!(nodes.iter().all(|n| n.parent_node == 0));
    }

    #[test]
    fn friendly_name_preferred_over_description() {
        let mut r = MockRegistry::new();
        let dev = r.add(0, "Composite");
        let child = r.add(dev, "Generic Description");
        r.set_friendly_name(child, "Friendly Name");

        let (nodes, _) = collect(&r, dev);
        assert_eq!(nodes[0].display, "Friendly Name");
    }

    #[test]
    fn cyclic_siblings_hit_sanity_limit() {
        let mut r = MockRegistry::new();
        let dev = r.add(0, "Composite");
        let child = r.add(dev, "Looping Child");
        r.set_sibling_override(child, child);

        let (nodes, res) = collect(&r, dev);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::SanityLimit);
        assert_eq!(nodes.len() as u32, LOOP_SANITY_LIMIT);
    }

    #[test]
    fn sibling_error_aborts_walk() {
        let mut r = MockRegistry::new();
        let dev = r.add(0, "Composite");
        let child = r.add(dev, "First");
        r.add(dev, "Second");
        r.fail_sibling(child);

        let (nodes, res) = collect(&r, dev);
        assert!(res.is_err());
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn finds_driver_key_case_insensitively() {
        let mut r = composite();
        r.set_driver_key(4, "{36fc9e60-c465-11cf-8056-444553540000}\\0007");
        let found =
            find_by_driver_key(&r, "{36FC9E60-C465-11CF-8056-444553540000}\\0007").unwrap();
        assert_eq!(found, Some(4));
        assert_eq!(find_by_driver_key(&r, "missing").unwrap(), None);
    }

    #[test]
    fn driver_key_search_hits_sanity_limit_on_cyclic_siblings() {
        let mut r = MockRegistry::new();
        r.add(0, "Root Hub");
        let looping = r.add(0, "Looping Device");
        r.set_driver_key(looping, "looping");
        r.set_sibling_override(looping, looping);

        let err = find_by_driver_key(&r, "missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SanityLimit);
        assert_eq!(find_by_driver_key(&r, "LOOPING").unwrap(), Some(looping));
    }

    #[test]
    fn describe_device_reports_device_then_children() {
        let mut r = composite();
        r.set_driver_key(1, "key-1");

        let mut out = Vec::new();
        let found =
            describe_device(&r, "key-1", 3, 1, true, 7, 2, &mut |n| out.push(n.clone())).unwrap();
        assert!(found);
        assert_eq!(out.len(), 6);
        assert_eq!(
            out[0],
            VisitedNode {
                level: 1,
                port: 3,
                display: "USB Composite Device".into(),
                device_address: 7,
                parent_address: 2,
                node: 0,
                parent_node: 0,
            }
        );
        assert_eq!(out[1].level, 2);
    }

    #[test]
    fn describe_device_without_children() {
        let mut r = composite();
        r.set_driver_key(1, "key-1");

        let mut out = Vec::new();
        describe_device(&r, "key-1", 3, 1, false, 7, 0, &mut |n| out.push(n.clone())).unwrap();
        assert_eq!(out.len(), 1);

        let found = describe_device(&r, "nope", 3, 1, true, 7, 0, &mut |_| panic!()).unwrap();
        assert!(!found);
    }
}
