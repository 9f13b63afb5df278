//! High Definition Audio host controller driver.
//!
//! Owns the controller's register window: the command/response rings to the
//! codecs, the DMA stream descriptor pool, and the codec graphs behind the
//! link. Every converter reachable from a physical jack is published as a
//! sound device through [`soundcore`]; the embedding kernel maps BAR 0,
//! routes the interrupt to [`Controller::irq`], and runs
//! [`Controller::dispatch`] afterwards from a context that may take locks.

pub mod cmdbuff;
pub mod device;
pub mod graph;
pub mod node;
pub mod regs;
pub mod stream;

pub use self::cmdbuff::{CommandRing, VerbIo, WidgetAddr};
pub use self::device::Controller;
pub use self::graph::{CodecGraph, FunctionGroup, PathKind, WidgetPath};
pub use self::node::Widget;
pub use self::stream::{StreamAssignment, StreamPool};
