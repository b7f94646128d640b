//! # Core
//!
//! Everything that is independent of a particular data source or status bar.
//!
//! ```text
//!   input plugins ──write──►  Registry  ◄──read── output plugin ──► Channel
//!        ▲                        │                                    │
//!        └──── on_action ◄── route ◄──── parse_event ◄─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`section`]: `Section`, the unit of display, plus its state and colours
//! - [`registry`]: ordered set of live sections with stable handles
//! - [`format`]: user templates compiled once, rendered per update
//! - [`action`]: routing host events back to the owning plugin
//! - [`plugin`]: input/output plugin traits and the context plugins run with
//! - [`runtime`]: the single-task event loop and plugin lifecycle
//! - [`config`]: TOML configuration and CLI overrides

pub mod action;
pub mod config;
pub mod format;
pub mod plugin;
pub mod registry;
pub mod runtime;
pub mod section;

pub use action::{ActionError, ActionTable, InboundEvent};
pub use format::{CompileError, CompiledTemplate, TypedValue};
pub use plugin::{InputPlugin, Mailbox, OutputPlugin, PluginContext, PluginInitError};
pub use registry::{PluginId, Registry, SectionHandle};
pub use runtime::{Core, Lifecycle, ShutdownHandle};
pub use section::{Align, Colour, Section, State, StateFlags};
