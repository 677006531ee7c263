//! Text renderings of the device tree.

use std::io::{self, Write};

use crate::{hub::HubVisitor, tree::VisitedNode};

/// Argument number of the device selection list in the extcap configuration.
pub const EXTCAP_ARGNUM_MULTICHECK: u32 = 99;

/// Deeper trees are assumed to be garbage and are not indented.
const MAX_INDENT_LEVEL: u32 = 20;

/// Holds the first write error so visitor callbacks can stay infallible.
struct Output<W> {
    out: W,
    error: Option<io::Error>,
}

impl<W: Write> Output<W> {
    fn new(out: W) -> Self {
        Output { out, error: None }
    }

    fn write(&mut self, f: impl FnOnce(&mut W) -> io::Result<()>) {
        if self.error.is_none() {
            if let Err(e) = f(&mut self.out) {
                self.error = Some(e);
            }
        }
    }

    fn finish(self) -> io::Result<W> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.out),
        }
    }
}

/// Prints the tree below each capture endpoint as indented text.
///
/// ```text
///   \??\USB#ROOT_HUB30#4&2b4a3f3&0&0#{f18a0e88-c30c-11d0-8815-00a0c906bed8}
///     [Port 1] USB Composite Device
///       USB Input Device
///         HID Keyboard Device
/// ```
pub struct TreePrinter<W> {
    output: Output<W>,
}

impl<W: Write> TreePrinter<W> {
    pub fn new(out: W) -> Self {
        TreePrinter {
            output: Output::new(out),
        }
    }

    /// Return the writer, or the first error encountered while writing.
    pub fn finish(self) -> io::Result<W> {
        self.output.finish()
    }
}

impl<W: Write, H: ?Sized> HubVisitor<H> for TreePrinter<W> {
    fn describes_nodes(&self) -> bool {
        true
    }

    fn visit_root(&mut self, _endpoint: &str, hub_name: &str) {
        self.output.write(|w| writeln!(w, "  {hub_name}"));
    }

    fn visit_node(&mut self, node: &VisitedNode) {
        let indent = node.level + 2;
        self.output.write(|w| {
            if indent > MAX_INDENT_LEVEL {
                writeln!(w, "*** Warning: Device tree might be incorrectly formatted. ***")?;
            } else {
                write!(w, "{:width$}", "", width = 2 * indent as usize)?;
            }
            if node.port != 0 {
                write!(w, "[Port {}] ", node.port)?;
            }
            writeln!(w, "{}", node.display)
        });
    }
}

/// Emits the device list in the extcap `value` line format.
///
/// Devices are selectable entries keyed by USB address. The functions of a
/// composite device are listed beneath it as disabled entries keyed
/// `ADDRESS_NODE`, so the consumer can show the hierarchy in a flat list.
pub struct ExtcapConfig<W> {
    output: Output<W>,
}

impl<W: Write> ExtcapConfig<W> {
    pub fn new(out: W) -> Self {
        ExtcapConfig {
            output: Output::new(out),
        }
    }

    pub fn finish(self) -> io::Result<W> {
        self.output.finish()
    }
}

impl<W: Write, H: ?Sized> HubVisitor<H> for ExtcapConfig<W> {
    fn describes_nodes(&self) -> bool {
        true
    }

    fn visit_node(&mut self, n: &VisitedNode) {
        let arg = EXTCAP_ARGNUM_MULTICHECK;
        let addr = n.device_address;
        self.output.write(|w| {
            if n.node != 0 {
                write!(
                    w,
                    "value {{arg={arg}}}{{value={addr}_{}}}{{display={}}}{{enabled=false}}",
                    n.node, n.display
                )?;
                if n.parent_node != 0 {
                    write!(w, "{{parent={addr}_{}}}", n.parent_node)?;
                } else {
                    write!(w, "{{parent={addr}}}")?;
                }
            } else {
                write!(
                    w,
                    "value {{arg={arg}}}{{value={addr}}}{{display=[{addr}] {}}}{{enabled=true}}",
                    n.display
                )?;
                if n.parent_address != 0 {
                    write!(w, "{{parent={}}}", n.parent_address)?;
                }
            }
            writeln!(w)
        });
    }
}
