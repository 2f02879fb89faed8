//! Compute-once memoization for wrapped objects.
//!
//! Each distinct operation-plus-arguments combination on a wrapped instance
//! executes at most once per process. Concurrent callers of the same
//! combination share a single execution, results (including failures) are
//! cached and replayed, and operations routed through the disk cache tier
//! keep their results across process restarts.
//!
//! A wrapped instance is a hand-written decorator: a type whose methods
//! delegate through an [`Engine`] obtained from a [`Container`]. The
//! container verifies the type's [`Contract`] before handing out the
//! engine, so a type with an unsafe mutable surface fails at wrap time,
//! not at first call.
//!
//! ```
//! use memonce::{Container, Contract, Engine, Identity, OnceError, Routing};
//!
//! struct GreeterOnce {
//!     engine: Engine,
//! }
//!
//! impl GreeterOnce {
//!     fn contract() -> Contract {
//!         Contract::new("Greeter").method("greet", Routing::Intercepted)
//!     }
//!
//!     fn greet(&self, name: &str) -> Result<String, OnceError> {
//!         let id = Identity::method("Greeter", "greet", &(name,))?;
//!         self.engine.call(id, || Ok(format!("Hello, {name}!")))
//!     }
//! }
//!
//! # fn main() -> Result<(), OnceError> {
//! let container = Container::new();
//! let greeter = container.wrap(&GreeterOnce::contract(), |engine| GreeterOnce { engine })?;
//! assert_eq!(greeter.greet("Alice")?, "Hello, Alice!");
//! // Replayed from the cache, not recomputed.
//! assert_eq!(greeter.greet("Alice")?, "Hello, Alice!");
//! # Ok(())
//! # }
//! ```

mod container;
mod contract;
mod disk;
mod error;
mod identity;
mod interceptor;
mod record;
mod timeline;

pub use crate::container::{Container, Engine};
pub use crate::contract::{Contract, Field, Property, Routing};
pub use crate::error::OnceError;
pub use crate::identity::{Identity, MemberKind};
pub use crate::interceptor::{Clock, Interceptor};
pub use crate::record::{Invocation, State};
pub use crate::timeline::{failures, human_duration, timeline};
