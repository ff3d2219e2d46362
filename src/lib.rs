#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod calculated;
mod change;
mod collection;
mod delta;
mod error;
mod list;
mod map;
mod node;
mod registry;
mod set;
mod system;
pub mod tracer;
mod tracking;
mod value;

pub use calculated::*;
pub use change::*;
pub use delta::*;
pub use error::*;
pub use list::*;
pub use map::{MapStore, ObservableMap};
pub use node::*;
pub use registry::*;
pub use set::*;
pub use system::*;
pub use tracer::{NoopTracer, Tracer};
pub use tracking::*;
pub use value::ObservableValue;
